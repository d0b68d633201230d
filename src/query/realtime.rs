use super::{run_query, Dialect, QueryError};
use crate::safe_sql;
use crate::sql::Sql;
use chrono::{DateTime, Duration, Utc};
use duckdb::Connection;
use serde::Serialize;

/// Minutes of activity that make a visitor count as active.
pub const DEFAULT_ACTIVE_WINDOW_MINUTES: u32 = 5;

/// Visitors seen on a site within the last few minutes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveVisitors {
    pub active_visitors: u64,
    pub window_minutes: u32,
}

/// Distinct visitors with any event at or after `since`.
pub fn active_visitors_query(dialect: Dialect, site_id: &str, since: DateTime<Utc>) -> Sql {
    let count = match dialect {
        Dialect::ClickHouse => Sql::raw("uniq(visitor_id)"),
        Dialect::DuckDb => Sql::raw("count(DISTINCT visitor_id)"),
    };
    safe_sql!(
        "SELECT ",
        count,
        " AS active_visitors
    FROM analytics.events
    WHERE site_id = ",
        Sql::string("site_id", site_id),
        "
      AND timestamp >= ",
        Sql::datetime("since", since),
    )
}

/// Count visitors active in the `window_minutes` leading up to `now`.
pub fn query_active_visitors(
    conn: &Connection,
    site_id: &str,
    now: DateTime<Utc>,
    window_minutes: u32,
) -> Result<ActiveVisitors, QueryError> {
    let since = now - Duration::minutes(i64::from(window_minutes));
    let sql = active_visitors_query(Dialect::DuckDb, site_id, since);
    let counts = run_query(conn, &sql, |row| row.get::<_, u64>(0))?;
    Ok(ActiveVisitors {
        active_visitors: counts.first().copied().unwrap_or_default(),
        window_minutes,
    })
}
