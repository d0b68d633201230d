//! Visitor counts per funnel step.
//!
//! A visitor reaches step `k` when they match steps `1..=k` in order, each at
//! or after the previous one, all within `window_secs` of entering step 1.
//! Counts are cumulative: everyone counted at step `k` is also counted at
//! every earlier step.

use super::filters::QueryFilter;
use super::{run_query, Dialect, EventScope, QueryError};
use crate::safe_sql;
use crate::sql::Sql;
use duckdb::Connection;

/// Longest funnel that can be queried.
pub const MAX_FUNNEL_STEPS: usize = 16;

/// Default time allowed between entering and completing a funnel.
pub const DEFAULT_FUNNEL_WINDOW_SECS: u32 = 24 * 60 * 60;

const STEP_TABLES: [&str; MAX_FUNNEL_STEPS] = [
    "step_1", "step_2", "step_3", "step_4", "step_5", "step_6", "step_7", "step_8", "step_9",
    "step_10", "step_11", "step_12", "step_13", "step_14", "step_15", "step_16",
];

const LEVELS: [&str; MAX_FUNNEL_STEPS] = [
    "1", "2", "3", "4", "5", "6", "7", "8", "9", "10", "11", "12", "13", "14", "15", "16",
];

fn step_predicates(steps: &[QueryFilter]) -> Vec<Sql> {
    steps
        .iter()
        .enumerate()
        .map(|(i, step)| step.predicate(format!("funnel_step_{i}")))
        .collect()
}

/// Query returning one `count` row per step, in step order.
///
/// `strict` requires steps to follow each other with no other matching event
/// in between. Only ClickHouse supports it; the DuckDB rendering ignores it.
pub fn funnel_query(
    dialect: Dialect,
    scope: &EventScope,
    steps: &[QueryFilter],
    window_secs: u32,
    strict: bool,
) -> Result<Sql, QueryError> {
    if steps.is_empty() {
        return Err(QueryError::InvalidFunnel("a funnel needs at least one step".to_string()));
    }
    if steps.len() > MAX_FUNNEL_STEPS {
        return Err(QueryError::InvalidFunnel(format!(
            "a funnel has at most {MAX_FUNNEL_STEPS} steps, got {}",
            steps.len()
        )));
    }

    Ok(match dialect {
        Dialect::ClickHouse => clickhouse_funnel(scope, steps, window_secs, strict),
        Dialect::DuckDb => duckdb_funnel(scope, steps, window_secs),
    })
}

fn clickhouse_funnel(scope: &EventScope, steps: &[QueryFilter], window_secs: u32, strict: bool) -> Sql {
    let window = Sql::uint32("window_duration", window_secs);
    let funnel_fn = if strict {
        safe_sql!("windowFunnel(", window, ", 'strict_order')")
    } else {
        safe_sql!("windowFunnel(", window, ")")
    };
    // Bounded by MAX_FUNNEL_STEPS.
    #[allow(clippy::cast_possible_truncation)]
    let levels: Vec<u32> = (1..=steps.len() as u32).collect();

    safe_sql!(
        "WITH
      base_funnel AS (
        SELECT
          ",
        funnel_fn,
        "(timestamp, ",
        Sql::separated(step_predicates(steps)),
        ") AS level
        FROM analytics.events
        WHERE ",
        scope.predicate(),
        "
        GROUP BY visitor_id
      ),
      funnel_counts AS (
        SELECT level, count() AS raw_count
        FROM base_funnel
        GROUP BY level
      ),
      levels AS (
        SELECT arrayJoin(",
        Sql::uint32_array("levels_array", levels),
        ") AS level
      ),
      joined AS (
        SELECT levels.level, coalesce(funnel_counts.raw_count, 0) AS count
        FROM levels
        LEFT JOIN funnel_counts USING (level)
      )
    SELECT sum(count) OVER (ORDER BY level DESC) AS count
    FROM joined
    ORDER BY level",
    )
}

/// A chain of per-step tables. Every step-1 event is a separate entry
/// candidate; each later step keeps, per candidate, the earliest time it was
/// reached within the window. A visitor counts at a step when any of their
/// candidates reaches it, which matches the maximum level `windowFunnel`
/// reports per visitor.
fn duckdb_funnel(scope: &EventScope, steps: &[QueryFilter], window_secs: u32) -> Sql {
    let predicates = step_predicates(steps);
    let mut tables = Vec::with_capacity(steps.len());
    let mut counts = Vec::with_capacity(steps.len());

    for (k, predicate) in predicates.into_iter().enumerate() {
        let table = if k == 0 {
            safe_sql!(
                Sql::raw(STEP_TABLES[0]),
                " AS (
        SELECT DISTINCT visitor_id, timestamp AS entered_at, timestamp AS reached_at
        FROM analytics.events
        WHERE ",
                scope.predicate(),
                " AND ",
                predicate,
                "
      )",
            )
        } else {
            safe_sql!(
                Sql::raw(STEP_TABLES[k]),
                " AS (
        SELECT s.visitor_id, s.entered_at, min(e.timestamp) AS reached_at
        FROM ",
                Sql::raw(STEP_TABLES[k - 1]),
                " s
        JOIN analytics.events e ON e.visitor_id = s.visitor_id
        WHERE ",
                scope.predicate(),
                " AND ",
                predicate,
                "
          AND e.timestamp >= s.reached_at
          AND e.timestamp <= s.entered_at + to_seconds(CAST(",
                Sql::uint32("window_duration", window_secs),
                " AS BIGINT))
        GROUP BY s.visitor_id, s.entered_at
      )",
            )
        };
        tables.push(table);
        counts.push(safe_sql!(
            "SELECT ",
            Sql::raw(LEVELS[k]),
            " AS level, count(DISTINCT visitor_id) AS visitors FROM ",
            Sql::raw(STEP_TABLES[k]),
        ));
    }

    safe_sql!(
        "WITH
      ",
        Sql::join(tables, ",\n      "),
        "
    SELECT visitors FROM (
      ",
        Sql::join(counts, "\n      UNION ALL "),
        "
    )
    ORDER BY level",
    )
}

/// Count how many visitors reached each step.
pub fn query_funnel(
    conn: &Connection,
    scope: &EventScope,
    steps: &[QueryFilter],
    window_secs: u32,
) -> Result<Vec<u64>, QueryError> {
    let sql = funnel_query(Dialect::DuckDb, scope, steps, window_secs, false)?;
    run_query(conn, &sql, |row| row.get(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::filters::{EventColumn, FilterOperator};
    use crate::query::test_support::{insert_event, setup_test_db};
    use crate::sql::ParamValue;
    use chrono::{TimeZone, Utc};

    fn scope() -> EventScope {
        EventScope::new(
            "test.com",
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 31, 23, 59, 59).unwrap(),
        )
    }

    fn url(value: &str) -> QueryFilter {
        QueryFilter::new(EventColumn::Url, FilterOperator::Is, value)
    }

    #[test]
    fn test_rejects_empty_and_oversized() {
        assert!(matches!(
            funnel_query(Dialect::DuckDb, &scope(), &[], 60, false),
            Err(QueryError::InvalidFunnel(_))
        ));
        let steps: Vec<QueryFilter> = (0..=MAX_FUNNEL_STEPS).map(|_| url("/")).collect();
        assert!(funnel_query(Dialect::ClickHouse, &scope(), &steps, 60, false).is_err());
    }

    #[test]
    fn test_clickhouse_text() {
        let steps = [url("/"), url("/pricing")];
        let built = funnel_query(Dialect::ClickHouse, &scope(), &steps, 86_400, true)
            .unwrap()
            .build()
            .unwrap();
        assert!(built.text.contains(
            "windowFunnel({window_duration:UInt32}, 'strict_order')(timestamp, url ILIKE {funnel_step_0:String}, url ILIKE {funnel_step_1:String})"
        ));
        assert!(built.text.contains("arrayJoin({levels_array:Array(UInt32)})"));
        assert_eq!(
            built.params.get("levels_array"),
            Some(&ParamValue::UInt32Array(vec![1, 2]))
        );
        assert_eq!(
            built.params.get("window_duration"),
            Some(&ParamValue::UInt32(86_400))
        );
    }

    #[test]
    fn test_clickhouse_non_strict() {
        let built = funnel_query(Dialect::ClickHouse, &scope(), &[url("/")], 60, false)
            .unwrap()
            .text();
        assert!(built.contains("windowFunnel({window_duration:UInt32})(timestamp"));
    }

    #[test]
    fn test_duckdb_funnel_counts() {
        let conn = setup_test_db();
        // v1 completes all steps in order.
        insert_event(&conn, "v1", "2024-01-15 10:00:00", "/", "desktop");
        insert_event(&conn, "v1", "2024-01-15 10:05:00", "/pricing", "desktop");
        insert_event(&conn, "v1", "2024-01-15 10:10:00", "/signup", "desktop");
        // v2 stops after pricing.
        insert_event(&conn, "v2", "2024-01-15 11:00:00", "/", "desktop");
        insert_event(&conn, "v2", "2024-01-15 11:01:00", "/pricing", "desktop");
        // v3 visits pricing before the home page, so only step 1 counts.
        insert_event(&conn, "v3", "2024-01-15 12:00:00", "/pricing", "mobile");
        insert_event(&conn, "v3", "2024-01-15 12:01:00", "/", "mobile");

        let steps = [url("/"), url("/pricing"), url("/signup")];
        let counts = query_funnel(&conn, &scope(), &steps, DEFAULT_FUNNEL_WINDOW_SECS).unwrap();
        assert_eq!(counts, vec![3, 2, 1]);
    }

    #[test]
    fn test_duckdb_funnel_window() {
        let conn = setup_test_db();
        insert_event(&conn, "v1", "2024-01-15 10:00:00", "/", "desktop");
        insert_event(&conn, "v1", "2024-01-15 10:10:00", "/pricing", "desktop");

        let steps = [url("/"), url("/pricing")];
        assert_eq!(query_funnel(&conn, &scope(), &steps, 600).unwrap(), vec![1, 1]);
        assert_eq!(query_funnel(&conn, &scope(), &steps, 599).unwrap(), vec![1, 0]);
    }

    #[test]
    fn test_duckdb_funnel_later_entry_counts() {
        let conn = setup_test_db();
        // The first visit never converts; the return visit does, well inside
        // the window of the second entry but not of the first.
        insert_event(&conn, "v1", "2024-01-10 10:00:00", "/", "desktop");
        insert_event(&conn, "v1", "2024-01-12 10:00:00", "/", "desktop");
        insert_event(&conn, "v1", "2024-01-12 10:05:00", "/pricing", "desktop");

        let steps = [url("/"), url("/pricing")];
        let counts = query_funnel(&conn, &scope(), &steps, DEFAULT_FUNNEL_WINDOW_SECS).unwrap();
        assert_eq!(counts, vec![1, 1]);
    }

    #[test]
    fn test_duckdb_funnel_repeated_entries_count_once() {
        let conn = setup_test_db();
        insert_event(&conn, "v1", "2024-01-15 10:00:00", "/", "desktop");
        insert_event(&conn, "v1", "2024-01-15 10:01:00", "/", "desktop");
        insert_event(&conn, "v1", "2024-01-15 10:02:00", "/pricing", "desktop");

        let steps = [url("/"), url("/pricing")];
        let counts = query_funnel(&conn, &scope(), &steps, 600).unwrap();
        assert_eq!(counts, vec![1, 1]);
    }

    #[test]
    fn test_duckdb_funnel_no_events() {
        let conn = setup_test_db();
        let counts = query_funnel(&conn, &scope(), &[url("/"), url("/b")], 60).unwrap();
        assert_eq!(counts, vec![0, 0]);
    }
}
