use super::builder::QueryBuilder;
use super::filters::EventColumn;
use super::sessions::SessionOptions;
use super::{run_query, Dialect, EventScope, QueryError};
use crate::safe_sql;
use crate::sql::Sql;
use duckdb::Connection;
use serde::{Deserialize, Serialize};

/// Engagement of one page across the sessions that touched it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageMetrics {
    pub path: String,
    pub visitors: u64,
    pub pageviews: u64,
    /// Percentage of this page's views that were single-page sessions.
    pub bounce_rate: f64,
    /// Mean duration in seconds of the multi-page sessions that include this
    /// page.
    pub avg_time: f64,
}

/// Top pages by visitors, built from all four session fragments.
pub fn page_metrics_query(
    dialect: Dialect,
    scope: &EventScope,
    options: &SessionOptions,
    limit: u32,
) -> Sql {
    let options = options.clone().with_column(EventColumn::Url);
    QueryBuilder::new(dialect)
        .session_boundaries(scope, &options)
        .session_groups(&options)
        .session_metrics()
        .page_metrics()
        .main_query(safe_sql!(
            "SELECT path, visitors, pageviews, bounce_rate, avg_time
    FROM page_metrics
    ORDER BY visitors DESC, pageviews DESC, path ASC
    LIMIT ",
            Sql::uint32("limit", limit),
        ))
        .build()
}

pub fn query_page_metrics(
    conn: &Connection,
    scope: &EventScope,
    options: &SessionOptions,
    limit: u32,
) -> Result<Vec<PageMetrics>, QueryError> {
    let sql = page_metrics_query(Dialect::DuckDb, scope, options, limit);
    run_query(conn, &sql, |row| {
        Ok(PageMetrics {
            path: row.get(0)?,
            visitors: row.get(1)?,
            pageviews: row.get(2)?,
            bounce_rate: row.get(3)?,
            avg_time: row.get(4)?,
        })
    })
}

/// Which end of a session to attribute it to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEdge {
    /// The session's first page.
    Entry,
    /// The session's last page.
    Exit,
}

impl SessionEdge {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Entry => "entry",
            Self::Exit => "exit",
        }
    }

    const fn page_expr(self, dialect: Dialect) -> Sql {
        let text = match (dialect, self) {
            (Dialect::ClickHouse, Self::Entry) => "argMin(url, timestamp)",
            (Dialect::ClickHouse, Self::Exit) => "argMax(url, timestamp)",
            (Dialect::DuckDb, Self::Entry) => "arg_min(url, timestamp)",
            (Dialect::DuckDb, Self::Exit) => "arg_max(url, timestamp)",
        };
        Sql::raw(text)
    }
}

/// A page and how many sessions started or ended on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgePage {
    pub path: String,
    pub sessions: u64,
    pub visitors: u64,
}

/// Top entry or exit pages. Sessions are reconstructed with fragments 1 and 2
/// and each one is attributed to its first or last page.
pub fn edge_pages_query(
    dialect: Dialect,
    scope: &EventScope,
    options: &SessionOptions,
    edge: SessionEdge,
    limit: u32,
) -> Sql {
    let options = options.clone().with_column(EventColumn::Url);
    let (sessions, visitors) = match dialect {
        Dialect::ClickHouse => ("count()", "uniqExact(visitor_id)"),
        Dialect::DuckDb => ("count(*)", "count(DISTINCT visitor_id)"),
    };
    QueryBuilder::new(dialect)
        .session_boundaries(scope, &options)
        .session_groups(&options)
        .fragment(safe_sql!(
            "session_edges AS (
      SELECT
        site_id,
        visitor_id,
        session_id,
        ",
            edge.page_expr(dialect),
            " AS path
      FROM session_groups
      GROUP BY site_id, visitor_id, session_id
    )",
        ))
        .main_query(safe_sql!(
            "SELECT path, ",
            Sql::raw(sessions),
            " AS sessions, ",
            Sql::raw(visitors),
            " AS visitors
    FROM session_edges
    GROUP BY path
    ORDER BY sessions DESC, path ASC
    LIMIT ",
            Sql::uint32("limit", limit),
        ))
        .build()
}

pub fn query_edge_pages(
    conn: &Connection,
    scope: &EventScope,
    options: &SessionOptions,
    edge: SessionEdge,
    limit: u32,
) -> Result<Vec<EdgePage>, QueryError> {
    let sql = edge_pages_query(Dialect::DuckDb, scope, options, edge, limit);
    run_query(conn, &sql, |row| {
        Ok(EdgePage {
            path: row.get(0)?,
            sessions: row.get(1)?,
            visitors: row.get(2)?,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::test_support::{insert_event, setup_test_db};
    use chrono::{TimeZone, Utc};

    fn scope() -> EventScope {
        EventScope::new(
            "test.com",
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 31, 23, 59, 59).unwrap(),
        )
    }

    #[test]
    fn test_clickhouse_text_chains_fragments() {
        let built = page_metrics_query(Dialect::ClickHouse, &scope(), &SessionOptions::default(), 25)
            .build()
            .unwrap();
        assert!(built.text.starts_with("WITH\n"));
        assert!(built.text.contains("timestamp, url,"));
        assert!(built.text.contains("uniqExact(sg.visitor_id)"));
        assert!(built.text.ends_with("LIMIT {limit:UInt32}"));
        assert_eq!(built.params.len(), 5);
    }

    #[test]
    fn test_page_metrics() {
        let conn = setup_test_db();
        // v1: one two-page session of 60s.
        insert_event(&conn, "v1", "2024-01-15 10:00:00", "/", "desktop");
        insert_event(&conn, "v1", "2024-01-15 10:01:00", "/pricing", "desktop");
        // v2 and v3 bounce on the home page.
        insert_event(&conn, "v2", "2024-01-15 11:00:00", "/", "mobile");
        insert_event(&conn, "v3", "2024-01-15 12:00:00", "/", "mobile");

        let pages = query_page_metrics(&conn, &scope(), &SessionOptions::default(), 10).unwrap();
        assert_eq!(pages.len(), 2);

        let home = &pages[0];
        assert_eq!(home.path, "/");
        assert_eq!(home.visitors, 3);
        assert_eq!(home.pageviews, 3);
        assert!((home.bounce_rate - 66.7).abs() < 1e-9);
        assert!((home.avg_time - 60.0).abs() < f64::EPSILON);

        let pricing = &pages[1];
        assert_eq!(pricing.path, "/pricing");
        assert!(pricing.bounce_rate.abs() < f64::EPSILON);
        assert!((pricing.avg_time - 60.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_only_bounces_have_zero_avg_time() {
        let conn = setup_test_db();
        insert_event(&conn, "v1", "2024-01-15 10:00:00", "/", "desktop");

        let pages = query_page_metrics(&conn, &scope(), &SessionOptions::default(), 10).unwrap();
        assert_eq!(pages.len(), 1);
        assert!((pages[0].bounce_rate - 100.0).abs() < f64::EPSILON);
        assert!(pages[0].avg_time.abs() < f64::EPSILON);
    }

    #[test]
    fn test_limit() {
        let conn = setup_test_db();
        insert_event(&conn, "v1", "2024-01-15 10:00:00", "/a", "desktop");
        insert_event(&conn, "v2", "2024-01-15 10:00:00", "/b", "desktop");
        insert_event(&conn, "v3", "2024-01-15 10:00:00", "/b", "desktop");

        let pages = query_page_metrics(&conn, &scope(), &SessionOptions::default(), 1).unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].path, "/b");
    }

    #[test]
    fn test_edge_pages_clickhouse_text() {
        let built = edge_pages_query(
            Dialect::ClickHouse,
            &scope(),
            &SessionOptions::default(),
            SessionEdge::Exit,
            5,
        )
        .build()
        .unwrap();
        assert!(built.text.contains("argMax(url, timestamp) AS path"));
        assert!(built.text.contains("FROM session_groups"));
        assert!(!built.text.contains("session_metrics"));
        assert!(built.text.ends_with("LIMIT {limit:UInt32}"));
    }

    #[test]
    fn test_entry_and_exit_pages() {
        let conn = setup_test_db();
        // v1: / -> /pricing -> /signup, then a second session on /blog.
        insert_event(&conn, "v1", "2024-01-15 10:00:00", "/", "desktop");
        insert_event(&conn, "v1", "2024-01-15 10:05:00", "/pricing", "desktop");
        insert_event(&conn, "v1", "2024-01-15 10:10:00", "/signup", "desktop");
        insert_event(&conn, "v1", "2024-01-15 15:00:00", "/blog", "desktop");
        // v2: / -> /pricing.
        insert_event(&conn, "v2", "2024-01-15 11:00:00", "/", "mobile");
        insert_event(&conn, "v2", "2024-01-15 11:01:00", "/pricing", "mobile");

        let options = SessionOptions::default();
        let entries = query_edge_pages(&conn, &scope(), &options, SessionEdge::Entry, 10).unwrap();
        assert_eq!(
            entries,
            vec![
                EdgePage {
                    path: "/".to_string(),
                    sessions: 2,
                    visitors: 2,
                },
                EdgePage {
                    path: "/blog".to_string(),
                    sessions: 1,
                    visitors: 1,
                },
            ]
        );

        let exits = query_edge_pages(&conn, &scope(), &options, SessionEdge::Exit, 10).unwrap();
        let paths: Vec<&str> = exits.iter().map(|page| page.path.as_str()).collect();
        assert_eq!(paths, vec!["/blog", "/pricing", "/signup"]);
        assert!(exits.iter().all(|page| page.sessions == 1));
    }

    #[test]
    fn test_edge_pages_follow_session_timeout() {
        let conn = setup_test_db();
        insert_event(&conn, "v1", "2024-01-15 10:00:00", "/", "desktop");
        insert_event(&conn, "v1", "2024-01-15 10:20:00", "/docs", "desktop");

        let long = SessionOptions::default();
        let entries = query_edge_pages(&conn, &scope(), &long, SessionEdge::Entry, 10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "/");

        // A 10 minute timeout splits the visit, so /docs also opens a session.
        let short = SessionOptions::default().with_timeout(600);
        let entries = query_edge_pages(&conn, &scope(), &short, SessionEdge::Entry, 10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].visitors, 1);
    }
}
