//! Session reconstruction from the raw event stream.
//!
//! A session is a run of one visitor's events with no gap longer than the
//! session timeout. The fragments below are common table expressions that
//! must be chained in order:
//!
//! 1. [`session_boundaries`] reads `analytics.events`
//! 2. [`session_groups`] reads `session_boundaries`
//! 3. [`session_metrics`] reads `session_groups`
//! 4. [`page_metrics`] reads `session_groups` and `session_metrics`, and needs
//!    `url` among the passthrough columns
//!
//! Chaining them out of order yields a query the store will reject.

use super::builder::QueryBuilder;
use super::filters::{where_filters, EventColumn, QueryFilter};
use super::{millis_to_datetime, run_query, Dialect, EventScope, QueryError};
use crate::chart::RawPoint;
use crate::granularity::Granularity;
use crate::safe_sql;
use crate::sql::Sql;
use duckdb::Connection;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Gap after which the next event starts a new session.
pub const DEFAULT_SESSION_TIMEOUT_SECS: u32 = 1800;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub timeout_secs: u32,
    /// Event columns carried through fragments 1 and 2.
    pub extra_columns: Vec<EventColumn>,
    /// Restrict the events sessions are built from.
    pub filters: Vec<QueryFilter>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_SESSION_TIMEOUT_SECS,
            extra_columns: Vec::new(),
            filters: Vec::new(),
        }
    }
}

impl SessionOptions {
    pub fn with_timeout(mut self, timeout_secs: u32) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_column(mut self, column: EventColumn) -> Self {
        if !self.extra_columns.contains(&column) {
            self.extra_columns.push(column);
        }
        self
    }

    pub fn with_filters(mut self, filters: Vec<QueryFilter>) -> Self {
        self.filters = filters;
        self
    }

    fn extra_columns_sql(&self) -> Sql {
        Sql::concat(
            self.extra_columns
                .iter()
                .map(|column| safe_sql!(", ", column.sql())),
        )
    }
}

/// Fragment 1: flag each event that starts a new session.
///
/// The first event of every (site, visitor) partition starts a session. Later
/// events start one only when the gap to the previous event is strictly
/// greater than the timeout.
pub fn session_boundaries(dialect: Dialect, scope: &EventScope, options: &SessionOptions) -> Sql {
    let is_new_session = match dialect {
        Dialect::ClickHouse => safe_sql!(
            "if(row_number() OVER (PARTITION BY site_id, visitor_id ORDER BY timestamp) = 1
          OR dateDiff('second', lagInFrame(timestamp) OVER (PARTITION BY site_id, visitor_id ORDER BY timestamp), timestamp) > ",
            Sql::uint32("session_timeout", options.timeout_secs),
            ", 1, 0)",
        ),
        Dialect::DuckDb => safe_sql!(
            "CASE WHEN lag(timestamp) OVER (PARTITION BY site_id, visitor_id ORDER BY timestamp) IS NULL
          OR date_diff('second', lag(timestamp) OVER (PARTITION BY site_id, visitor_id ORDER BY timestamp), timestamp) > ",
            Sql::uint32("session_timeout", options.timeout_secs),
            " THEN 1 ELSE 0 END",
        ),
    };

    safe_sql!(
        "session_boundaries AS (
      SELECT
        site_id,
        visitor_id,
        timestamp",
        options.extra_columns_sql(),
        ",
        ",
        is_new_session,
        " AS is_new_session
      FROM analytics.events
      WHERE ",
        scope.predicate(),
        " AND ",
        where_filters(&options.filters),
        "
    )",
    )
}

/// Fragment 2: number sessions per visitor by running-summing the flags.
pub fn session_groups(options: &SessionOptions) -> Sql {
    safe_sql!(
        "session_groups AS (
      SELECT
        site_id,
        visitor_id,
        timestamp",
        options.extra_columns_sql(),
        ",
        sum(is_new_session) OVER (PARTITION BY site_id, visitor_id ORDER BY timestamp) AS session_id
      FROM session_boundaries
    )",
    )
}

/// Fragment 3: page count and duration per session. A single-page session
/// has duration 0.
pub const fn session_metrics(dialect: Dialect) -> Sql {
    match dialect {
        Dialect::ClickHouse => Sql::raw(
            "session_metrics AS (
      SELECT
        site_id,
        visitor_id,
        session_id,
        count() AS page_count,
        if(count() > 1, dateDiff('second', min(timestamp), max(timestamp)), 0) AS duration
      FROM session_groups
      GROUP BY site_id, visitor_id, session_id
    )",
        ),
        Dialect::DuckDb => Sql::raw(
            "session_metrics AS (
      SELECT
        site_id,
        visitor_id,
        session_id,
        count(*) AS page_count,
        CASE WHEN count(*) > 1 THEN date_diff('second', min(timestamp), max(timestamp)) ELSE 0 END AS duration
      FROM session_groups
      GROUP BY site_id, visitor_id, session_id
    )",
        ),
    }
}

/// Fragment 4: per-page visitors, pageviews, bounce rate and average time.
///
/// Bounce rate is the share of pageviews that belong to single-page sessions.
/// Average time only counts sessions with more than one page.
pub const fn page_metrics(dialect: Dialect) -> Sql {
    match dialect {
        Dialect::ClickHouse => Sql::raw(
            "page_metrics AS (
      SELECT
        sg.url AS path,
        uniqExact(sg.visitor_id) AS visitors,
        count() AS pageviews,
        round(100 * countIf(sm.page_count = 1) / count(), 1) AS bounce_rate,
        if(countIf(sm.page_count > 1) > 0, round(avgIf(sm.duration, sm.page_count > 1), 1), 0) AS avg_time
      FROM session_groups sg
      LEFT JOIN session_metrics sm ON
        sg.site_id = sm.site_id AND
        sg.visitor_id = sm.visitor_id AND
        sg.session_id = sm.session_id
      GROUP BY sg.url
    )",
        ),
        Dialect::DuckDb => Sql::raw(
            "page_metrics AS (
      SELECT
        sg.url AS path,
        count(DISTINCT sg.visitor_id) AS visitors,
        count(*) AS pageviews,
        round(100 * (count(*) FILTER (WHERE sm.page_count = 1))::DOUBLE / count(*), 1) AS bounce_rate,
        COALESCE(round(avg(sm.duration) FILTER (WHERE sm.page_count > 1), 1), 0.0)::DOUBLE AS avg_time
      FROM session_groups sg
      LEFT JOIN session_metrics sm ON
        sg.site_id = sm.site_id AND
        sg.visitor_id = sm.visitor_id AND
        sg.session_id = sm.session_id
      GROUP BY sg.url
    )",
        ),
    }
}

/// Site-wide session totals for a time range.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub total_sessions: u64,
    /// Average over sessions with more than one page.
    pub avg_session_duration_secs: f64,
    pub avg_pages_per_session: f64,
    /// Percentage of sessions with a single page.
    pub bounce_rate: f64,
}

pub fn session_summary_query(dialect: Dialect, scope: &EventScope, options: &SessionOptions) -> Sql {
    let main = match dialect {
        Dialect::ClickHouse => Sql::raw(
            "SELECT
      count() AS total_sessions,
      if(countIf(page_count > 1) > 0, avgIf(duration, page_count > 1), 0) AS avg_duration,
      if(count() > 0, avg(page_count), 0) AS avg_pages,
      if(count() > 0, round(100 * countIf(page_count = 1) / count(), 1), 0) AS bounce_rate
    FROM session_metrics",
        ),
        Dialect::DuckDb => Sql::raw(
            "SELECT
      count(*) AS total_sessions,
      COALESCE(avg(duration) FILTER (WHERE page_count > 1), 0.0)::DOUBLE AS avg_duration,
      COALESCE(avg(page_count), 0.0)::DOUBLE AS avg_pages,
      COALESCE(round(100 * (count(*) FILTER (WHERE page_count = 1))::DOUBLE / NULLIF(count(*), 0), 1), 0.0)::DOUBLE AS bounce_rate
    FROM session_metrics",
        ),
    };

    QueryBuilder::new(dialect)
        .session_boundaries(scope, options)
        .session_groups(options)
        .session_metrics()
        .main_query(main)
        .build()
}

/// Reconstruct sessions in the embedded store and summarize them.
pub fn query_session_summary(
    conn: &Connection,
    scope: &EventScope,
    options: &SessionOptions,
) -> Result<SessionSummary, QueryError> {
    let sql = session_summary_query(Dialect::DuckDb, scope, options);
    let mut rows = run_query(conn, &sql, |row| {
        Ok(SessionSummary {
            total_sessions: row.get(0)?,
            avg_session_duration_secs: row.get(1)?,
            avg_pages_per_session: row.get(2)?,
            bounce_rate: row.get(3)?,
        })
    })?;
    Ok(rows.pop().unwrap_or_default())
}

/// A session statistic charted per bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMetric {
    /// Percentage of sessions with a single page.
    BounceRate,
    /// Mean duration in seconds of multi-page sessions.
    AvgDuration,
    PagesPerSession,
}

impl SessionMetric {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BounceRate => "bounce_rate",
            Self::AvgDuration => "avg_duration",
            Self::PagesPerSession => "pages_per_session",
        }
    }

    const fn value_expr(self, dialect: Dialect) -> Sql {
        let text = match (dialect, self) {
            (Dialect::ClickHouse, Self::BounceRate) => {
                "round(100 * countIf(page_count = 1) / count(), 1)"
            }
            (Dialect::ClickHouse, Self::AvgDuration) => {
                "if(countIf(page_count > 1) > 0, round(avgIf(duration, page_count > 1), 1), 0)"
            }
            (Dialect::ClickHouse, Self::PagesPerSession) => "round(avg(page_count), 1)",
            (Dialect::DuckDb, Self::BounceRate) => {
                "round(100 * (count(*) FILTER (WHERE page_count = 1))::DOUBLE / count(*), 1)::DOUBLE"
            }
            (Dialect::DuckDb, Self::AvgDuration) => {
                "COALESCE(round(avg(duration) FILTER (WHERE page_count > 1), 1), 0.0)::DOUBLE"
            }
            (Dialect::DuckDb, Self::PagesPerSession) => "round(avg(page_count), 1)::DOUBLE",
        };
        Sql::raw(text)
    }
}

impl FromStr for SessionMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bounce_rate" => Ok(Self::BounceRate),
            "avg_duration" => Ok(Self::AvgDuration),
            "pages_per_session" => Ok(Self::PagesPerSession),
            other => Err(format!("Unknown session metric: '{other}'")),
        }
    }
}

/// Sessions with their start time, page count and duration.
fn session_starts(dialect: Dialect) -> Sql {
    match dialect {
        Dialect::ClickHouse => Sql::raw(
            "session_starts AS (
      SELECT
        site_id,
        visitor_id,
        session_id,
        min(timestamp) AS started_at,
        count() AS page_count,
        if(count() > 1, dateDiff('second', min(timestamp), max(timestamp)), 0) AS duration
      FROM session_groups
      GROUP BY site_id, visitor_id, session_id
    )",
        ),
        Dialect::DuckDb => Sql::raw(
            "session_starts AS (
      SELECT
        site_id,
        visitor_id,
        session_id,
        min(timestamp) AS started_at,
        count(*) AS page_count,
        CASE WHEN count(*) > 1 THEN date_diff('second', min(timestamp), max(timestamp)) ELSE 0 END AS duration
      FROM session_groups
      GROUP BY site_id, visitor_id, session_id
    )",
        ),
    }
}

/// One session metric per bucket. A session belongs to the bucket it started
/// in, even when it runs into the next one.
pub fn session_series_query(
    dialect: Dialect,
    scope: &EventScope,
    granularity: Granularity,
    options: &SessionOptions,
    metric: SessionMetric,
) -> Sql {
    QueryBuilder::new(dialect)
        .session_boundaries(scope, options)
        .session_groups(options)
        .fragment(session_starts(dialect))
        .main_query(safe_sql!(
            "SELECT
      ",
            granularity.bucket_expr(dialect),
            " AS date,
      ",
            metric.value_expr(dialect),
            " AS value
    FROM (SELECT started_at AS timestamp, page_count, duration FROM session_starts) sessions
    GROUP BY date
    ORDER BY date ASC
    LIMIT 10080",
        ))
        .build()
}

pub fn query_session_series(
    conn: &Connection,
    scope: &EventScope,
    granularity: Granularity,
    options: &SessionOptions,
    metric: SessionMetric,
) -> Result<Vec<RawPoint>, QueryError> {
    let sql = session_series_query(Dialect::DuckDb, scope, granularity, options, metric);
    run_query(conn, &sql, |row| {
        let millis: i64 = row.get(0)?;
        Ok(RawPoint {
            date: millis_to_datetime(millis),
            value: row.get(1)?,
        })
    })
}
