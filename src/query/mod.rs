pub mod breakdowns;
pub mod builder;
pub mod cache;
pub mod filters;
pub mod funnel;
pub mod pages;
pub mod realtime;
pub mod sessions;
pub mod timeseries;

use crate::safe_sql;
use crate::sql::{ParamValue, Sql, SqlError, DATETIME_FORMAT};
use chrono::{DateTime, Utc};
use duckdb::types::Value;
use duckdb::{Connection, Row};

/// SQL vocabulary a query is written in.
///
/// `ClickHouse` is the production event store reached through an external
/// client; `DuckDb` is the embedded store the bundled server executes against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    ClickHouse,
    DuckDb,
}

/// The site and inclusive time range every analytics query is restricted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventScope {
    pub site_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl EventScope {
    pub fn new(site_id: impl Into<String>, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            site_id: site_id.into(),
            start,
            end,
        }
    }

    /// `site_id = {site_id:String} AND timestamp BETWEEN {start} AND {end}`.
    pub fn predicate(&self) -> Sql {
        safe_sql!(
            "site_id = ",
            Sql::string("site_id", self.site_id.clone()),
            " AND timestamp BETWEEN ",
            Sql::datetime("start", self.start),
            " AND ",
            Sql::datetime("end", self.end),
        )
    }
}

/// Error from building or executing a query against the embedded store.
#[derive(Debug)]
pub enum QueryError {
    Sql(SqlError),
    Database(duckdb::Error),
    InvalidFunnel(String),
}

impl std::fmt::Display for QueryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sql(e) => write!(f, "Query construction error: {e}"),
            Self::Database(e) => write!(f, "Database error: {e}"),
            Self::InvalidFunnel(msg) => write!(f, "Invalid funnel: {msg}"),
        }
    }
}

impl std::error::Error for QueryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Sql(e) => Some(e),
            Self::Database(e) => Some(e),
            Self::InvalidFunnel(_) => None,
        }
    }
}

impl From<SqlError> for QueryError {
    fn from(e: SqlError) -> Self {
        Self::Sql(e)
    }
}

impl From<duckdb::Error> for QueryError {
    fn from(e: duckdb::Error) -> Self {
        Self::Database(e)
    }
}

/// Render `sql` with positional placeholders, execute it, and map every row.
pub fn run_query<T, F>(conn: &Connection, sql: &Sql, map_row: F) -> Result<Vec<T>, QueryError>
where
    F: FnMut(&Row<'_>) -> Result<T, duckdb::Error>,
{
    let query = sql.build_positional()?;
    tracing::debug!(sql = %query.text, params = query.values.len(), "Executing query");

    let values: Vec<Value> = query.values.iter().map(to_duckdb_value).collect();
    let mut stmt = conn.prepare(&query.text)?;
    let rows = stmt
        .query_map(duckdb::params_from_iter(values), map_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn to_duckdb_value(value: &ParamValue) -> Value {
    match value {
        ParamValue::String(s) => Value::Text(s.clone()),
        ParamValue::UInt32(n) => Value::BigInt(i64::from(*n)),
        ParamValue::DateTime(dt) => Value::Text(dt.format(DATETIME_FORMAT).to_string()),
        ParamValue::UInt32Array(items) => {
            Value::List(items.iter().map(|n| Value::UInt(*n)).collect())
        }
    }
}

/// Convert a bucket key read back from DuckDB (epoch millis) to a timestamp.
pub(crate) fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod test_support {
    use duckdb::Connection;

    pub fn setup_test_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        crate::storage::schema::init_schema(&conn).unwrap();
        conn
    }

    pub fn insert_event(
        conn: &Connection,
        visitor_id: &str,
        timestamp: &str,
        url: &str,
        device_type: &str,
    ) {
        conn.execute(
            "INSERT INTO analytics.events (site_id, visitor_id, timestamp, event_type, url, device_type)
             VALUES ('test.com', ?, CAST(? AS TIMESTAMP), 'pageview', ?, ?)",
            duckdb::params![visitor_id, timestamp, url, device_type],
        )
        .unwrap();
    }
}
