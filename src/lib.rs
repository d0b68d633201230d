//! Analytics query composition and chart presentation.
//!
//! Queries are assembled from parameterized expressions ([`sql::Sql`]) so no
//! user value ever reaches query text, rendered for ClickHouse or the
//! embedded DuckDB store, and their rows shaped into chart data by the pure
//! presenters in [`chart`].

pub mod api;
pub mod chart;
pub mod config;
pub mod granularity;
pub mod query;
pub mod server;
pub mod sql;
pub mod storage;
