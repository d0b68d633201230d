use super::filters::{where_filters, QueryFilter};
use super::{millis_to_datetime, run_query, Dialect, EventScope, QueryError};
use crate::chart::RawPoint;
use crate::granularity::Granularity;
use crate::safe_sql;
use crate::sql::Sql;
use duckdb::Connection;

/// Pageviews per bucket.
pub fn pageviews_query(
    dialect: Dialect,
    scope: &EventScope,
    granularity: Granularity,
    filters: &[QueryFilter],
) -> Sql {
    let count = match dialect {
        Dialect::ClickHouse => Sql::raw("count()"),
        Dialect::DuckDb => Sql::raw("count(*)"),
    };
    safe_sql!(
        "SELECT
      ",
        granularity.bucket_expr(dialect),
        " AS date,
      ",
        count,
        " AS value
    FROM analytics.events
    WHERE ",
        scope.predicate(),
        "
      AND event_type = 'pageview'
      AND ",
        where_filters(filters),
        "
    GROUP BY date
    ORDER BY date ASC
    LIMIT 10080",
    )
}

/// Unique visitors per bucket. Each visitor is counted once, in the bucket of
/// their first event within the range.
pub fn unique_visitors_query(
    dialect: Dialect,
    scope: &EventScope,
    granularity: Granularity,
    filters: &[QueryFilter],
) -> Sql {
    let count = match dialect {
        Dialect::ClickHouse => Sql::raw("uniq(visitor_id)"),
        Dialect::DuckDb => Sql::raw("count(DISTINCT visitor_id)"),
    };
    safe_sql!(
        "WITH first_visitor_appearances AS (
      SELECT
        visitor_id,
        min(timestamp) AS timestamp
      FROM analytics.events
      WHERE ",
        scope.predicate(),
        "
        AND ",
        where_filters(filters),
        "
      GROUP BY visitor_id
    )
    SELECT
      ",
        granularity.bucket_expr(dialect),
        " AS date,
      ",
        count,
        " AS value
    FROM first_visitor_appearances
    GROUP BY date
    ORDER BY date ASC
    LIMIT 10080",
    )
}

fn raw_points(conn: &Connection, sql: &Sql) -> Result<Vec<RawPoint>, QueryError> {
    run_query(conn, sql, |row| {
        let millis: i64 = row.get(0)?;
        let count: i64 = row.get(1)?;
        #[allow(clippy::cast_precision_loss)]
        let value = count as f64;
        Ok(RawPoint {
            date: millis_to_datetime(millis),
            value,
        })
    })
}

pub fn query_pageviews(
    conn: &Connection,
    scope: &EventScope,
    granularity: Granularity,
    filters: &[QueryFilter],
) -> Result<Vec<RawPoint>, QueryError> {
    raw_points(conn, &pageviews_query(Dialect::DuckDb, scope, granularity, filters))
}

pub fn query_unique_visitors(
    conn: &Connection,
    scope: &EventScope,
    granularity: Granularity,
    filters: &[QueryFilter],
) -> Result<Vec<RawPoint>, QueryError> {
    raw_points(
        conn,
        &unique_visitors_query(Dialect::DuckDb, scope, granularity, filters),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::filters::{EventColumn, FilterOperator};
    use crate::query::test_support::{insert_event, setup_test_db};
    use chrono::{TimeZone, Utc};

    fn scope() -> EventScope {
        EventScope::new(
            "test.com",
            Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 16, 23, 59, 59).unwrap(),
        )
    }

    #[test]
    fn test_pageviews_clickhouse_text() {
        let built = pageviews_query(Dialect::ClickHouse, &scope(), Granularity::Hour, &[])
            .build()
            .unwrap();
        assert!(built.text.contains("toStartOfHour(timestamp) AS date"));
        assert!(built.text.contains("count() AS value"));
        assert!(built.text.contains("AND 1=1"));
        assert!(built.text.ends_with("LIMIT 10080"));
        assert_eq!(built.params.len(), 3);
    }

    #[test]
    fn test_pageviews_by_hour() {
        let conn = setup_test_db();
        insert_event(&conn, "v1", "2024-01-15 10:05:00", "/", "desktop");
        insert_event(&conn, "v2", "2024-01-15 10:55:00", "/", "desktop");
        insert_event(&conn, "v1", "2024-01-15 12:00:00", "/about", "desktop");
        insert_event(&conn, "v1", "2024-02-01 12:00:00", "/about", "desktop");

        let points = query_pageviews(&conn, &scope(), Granularity::Hour, &[]).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].date, Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap());
        assert!((points[0].value - 2.0).abs() < f64::EPSILON);
        assert!((points[1].value - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_pageviews_filtered() {
        let conn = setup_test_db();
        insert_event(&conn, "v1", "2024-01-15 10:05:00", "/blog/a", "desktop");
        insert_event(&conn, "v2", "2024-01-15 10:06:00", "/blog/b", "desktop");
        insert_event(&conn, "v3", "2024-01-15 10:07:00", "/pricing", "desktop");

        let filters = [QueryFilter::new(EventColumn::Url, FilterOperator::Is, "/blog/*")];
        let points = query_pageviews(&conn, &scope(), Granularity::Day, &filters).unwrap();
        assert_eq!(points.len(), 1);
        assert!((points[0].value - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_unique_visitors_counted_at_first_appearance() {
        let conn = setup_test_db();
        insert_event(&conn, "v1", "2024-01-15 10:00:00", "/", "desktop");
        insert_event(&conn, "v1", "2024-01-16 10:00:00", "/", "desktop");
        insert_event(&conn, "v2", "2024-01-16 11:00:00", "/", "mobile");

        let points = query_unique_visitors(&conn, &scope(), Granularity::Day, &[]).unwrap();
        assert_eq!(points.len(), 2);
        assert!((points[0].value - 1.0).abs() < f64::EPSILON);
        assert!((points[1].value - 1.0).abs() < f64::EPSILON);
        assert_eq!(points[1].date, Utc.with_ymd_and_hms(2024, 1, 16, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_empty_range() {
        let conn = setup_test_db();
        assert!(query_pageviews(&conn, &scope(), Granularity::Minute, &[])
            .unwrap()
            .is_empty());
    }
}
