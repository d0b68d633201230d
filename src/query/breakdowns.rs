use super::filters::{where_filters, EventColumn, QueryFilter};
use super::{millis_to_datetime, run_query, Dialect, EventScope, QueryError};
use crate::chart::{BreakdownRow, RawCategoryPoint};
use crate::granularity::Granularity;
use crate::safe_sql;
use crate::sql::Sql;
use duckdb::Connection;

const fn unique_visitors(dialect: Dialect) -> Sql {
    match dialect {
        Dialect::ClickHouse => Sql::raw("uniq(visitor_id)"),
        Dialect::DuckDb => Sql::raw("count(DISTINCT visitor_id)"),
    }
}

/// Unique visitors per value of `dimension`, largest first. Missing values
/// are grouped as `(unknown)`.
pub fn breakdown_query(
    dialect: Dialect,
    scope: &EventScope,
    dimension: EventColumn,
    filters: &[QueryFilter],
    limit: u32,
) -> Sql {
    safe_sql!(
        "SELECT
      COALESCE(",
        dimension.sql(),
        ", '(unknown)') AS name,
      ",
        unique_visitors(dialect),
        " AS value
    FROM analytics.events
    WHERE ",
        scope.predicate(),
        "
      AND ",
        where_filters(filters),
        "
    GROUP BY name
    ORDER BY value DESC, name ASC
    LIMIT ",
        Sql::uint32("limit", limit),
    )
}

/// Unique visitors per bucket and value of `dimension`.
///
/// Unlimited: a row cap would cut trailing buckets once categories multiply
/// the row count, and the presenter would zero-fill them.
pub fn breakdown_timeseries_query(
    dialect: Dialect,
    scope: &EventScope,
    dimension: EventColumn,
    granularity: Granularity,
    filters: &[QueryFilter],
) -> Sql {
    safe_sql!(
        "SELECT
      ",
        granularity.bucket_expr(dialect),
        " AS date,
      COALESCE(",
        dimension.sql(),
        ", '(unknown)') AS category,
      ",
        unique_visitors(dialect),
        " AS value
    FROM analytics.events
    WHERE ",
        scope.predicate(),
        "
      AND ",
        where_filters(filters),
        "
    GROUP BY date, category
    ORDER BY date ASC, value DESC",
    )
}

pub fn query_breakdown(
    conn: &Connection,
    scope: &EventScope,
    dimension: EventColumn,
    filters: &[QueryFilter],
    limit: u32,
) -> Result<Vec<BreakdownRow>, QueryError> {
    let sql = breakdown_query(Dialect::DuckDb, scope, dimension, filters, limit);
    run_query(conn, &sql, |row| {
        let count: i64 = row.get(1)?;
        #[allow(clippy::cast_precision_loss)]
        let value = count as f64;
        Ok(BreakdownRow {
            name: row.get(0)?,
            value,
        })
    })
}

pub fn query_breakdown_timeseries(
    conn: &Connection,
    scope: &EventScope,
    dimension: EventColumn,
    granularity: Granularity,
    filters: &[QueryFilter],
) -> Result<Vec<RawCategoryPoint>, QueryError> {
    let sql = breakdown_timeseries_query(Dialect::DuckDb, scope, dimension, granularity, filters);
    run_query(conn, &sql, |row| {
        let millis: i64 = row.get(0)?;
        let count: i64 = row.get(2)?;
        #[allow(clippy::cast_precision_loss)]
        let value = count as f64;
        Ok(RawCategoryPoint {
            date: millis_to_datetime(millis),
            category: row.get(1)?,
            value,
        })
    })
}
