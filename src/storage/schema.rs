use chrono::NaiveDateTime;
use duckdb::Connection;
use serde::{Deserialize, Serialize};

/// SQL statements creating the events table. The layout mirrors the
/// production `analytics.events` table so the same queries run on both stores.
pub const CREATE_EVENTS_TABLE: &str = r"
CREATE SCHEMA IF NOT EXISTS analytics;
CREATE TABLE IF NOT EXISTS analytics.events (
    site_id              VARCHAR NOT NULL,
    visitor_id           VARCHAR NOT NULL,
    session_id           VARCHAR,
    timestamp            TIMESTAMP NOT NULL,
    event_type           VARCHAR NOT NULL,
    url                  VARCHAR NOT NULL,
    custom_event_name    VARCHAR,
    referrer_url         VARCHAR,
    referrer_source      VARCHAR,
    referrer_source_name VARCHAR,
    referrer_search_term VARCHAR,
    utm_source           VARCHAR,
    utm_medium           VARCHAR,
    utm_campaign         VARCHAR,
    utm_term             VARCHAR,
    utm_content          VARCHAR,
    browser              VARCHAR,
    os                   VARCHAR,
    device_type          VARCHAR,
    country_code         VARCHAR(2)
)
";

/// Initialize the database schema. Idempotent.
pub fn init_schema(conn: &Connection) -> Result<(), duckdb::Error> {
    conn.execute_batch(CREATE_EVENTS_TABLE)?;
    Ok(())
}

/// One row of `analytics.events`, as handed over by the ingestion side.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Event {
    pub site_id: String,
    pub visitor_id: String,
    pub session_id: Option<String>,
    pub timestamp: NaiveDateTime,
    pub event_type: String,
    pub url: String,
    pub custom_event_name: Option<String>,
    pub referrer_url: Option<String>,
    pub referrer_source: Option<String>,
    pub referrer_source_name: Option<String>,
    pub referrer_search_term: Option<String>,
    pub utm_source: Option<String>,
    pub utm_medium: Option<String>,
    pub utm_campaign: Option<String>,
    pub utm_term: Option<String>,
    pub utm_content: Option<String>,
    pub browser: Option<String>,
    pub os: Option<String>,
    pub device_type: Option<String>,
    pub country_code: Option<String>,
}

/// Append events inside one transaction. Returns the number inserted.
pub fn insert_events(conn: &Connection, events: &[Event]) -> Result<usize, duckdb::Error> {
    if events.is_empty() {
        return Ok(0);
    }

    conn.execute_batch("BEGIN TRANSACTION")?;
    let result = insert_all(conn, events);
    match result {
        Ok(()) => conn.execute_batch("COMMIT")?,
        Err(e) => {
            if let Err(rollback) = conn.execute_batch("ROLLBACK") {
                tracing::error!(error = %rollback, "Rollback after failed insert failed");
            }
            return Err(e);
        }
    }

    tracing::debug!(count = events.len(), "Inserted events");
    Ok(events.len())
}

fn insert_all(conn: &Connection, events: &[Event]) -> Result<(), duckdb::Error> {
    let mut stmt = conn.prepare(
        "INSERT INTO analytics.events (site_id, visitor_id, session_id, timestamp, event_type,
         url, custom_event_name, referrer_url, referrer_source, referrer_source_name,
         referrer_search_term, utm_source, utm_medium, utm_campaign, utm_term,
         utm_content, browser, os, device_type, country_code)
         VALUES (?, ?, ?, CAST(? AS TIMESTAMP), ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )?;
    for event in events {
        stmt.execute(duckdb::params![
            event.site_id,
            event.visitor_id,
            event.session_id,
            event
                .timestamp
                .format(crate::sql::DATETIME_FORMAT)
                .to_string(),
            event.event_type,
            event.url,
            event.custom_event_name,
            event.referrer_url,
            event.referrer_source,
            event.referrer_source_name,
            event.referrer_search_term,
            event.utm_source,
            event.utm_medium,
            event.utm_campaign,
            event.utm_term,
            event.utm_content,
            event.browser,
            event.os,
            event.device_type,
            event.country_code,
        ])?;
    }
    Ok(())
}
