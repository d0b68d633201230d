//! Assembles common table expressions and a main query into one statement.

use super::sessions::{self, SessionOptions};
use super::{Dialect, EventScope};
use crate::safe_sql;
use crate::sql::Sql;

/// Chains `WITH` fragments in the order they are added.
///
/// Consumed by value, so a half-built query cannot be reused by accident.
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    dialect: Dialect,
    fragments: Vec<Sql>,
    main: Sql,
}

impl QueryBuilder {
    pub const fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            fragments: Vec::new(),
            main: Sql::empty(),
        }
    }

    pub const fn dialect(&self) -> Dialect {
        self.dialect
    }

    #[must_use]
    pub fn session_boundaries(self, scope: &EventScope, options: &SessionOptions) -> Self {
        let fragment = sessions::session_boundaries(self.dialect, scope, options);
        self.fragment(fragment)
    }

    #[must_use]
    pub fn session_groups(self, options: &SessionOptions) -> Self {
        self.fragment(sessions::session_groups(options))
    }

    #[must_use]
    pub fn session_metrics(self) -> Self {
        let fragment = sessions::session_metrics(self.dialect);
        self.fragment(fragment)
    }

    #[must_use]
    pub fn page_metrics(self) -> Self {
        let fragment = sessions::page_metrics(self.dialect);
        self.fragment(fragment)
    }

    /// Append an arbitrary `name AS (...)` fragment.
    #[must_use]
    pub fn fragment(mut self, fragment: Sql) -> Self {
        self.fragments.push(fragment);
        self
    }

    /// Replace the main query.
    #[must_use]
    pub fn main_query(mut self, main: Sql) -> Self {
        self.main = main;
        self
    }

    /// `WITH f1, f2, ... main`, or just the main query when no fragment was
    /// added.
    pub fn build(self) -> Sql {
        if self.fragments.is_empty() {
            return self.main;
        }
        safe_sql!(
            "WITH\n    ",
            Sql::join(self.fragments, ",\n    "),
            "\n    ",
            self.main,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::ParamValue;
    use chrono::{TimeZone, Utc};

    fn scope() -> EventScope {
        EventScope::new(
            "test.com",
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 31, 23, 59, 59).unwrap(),
        )
    }

    #[test]
    fn test_no_fragments_returns_main() {
        let main = safe_sql!("SELECT ", Sql::uint32("n", 1));
        let built = QueryBuilder::new(Dialect::ClickHouse)
            .main_query(main.clone())
            .build();
        assert_eq!(built, main);
    }

    #[test]
    fn test_fragments_in_insertion_order() {
        let built = QueryBuilder::new(Dialect::ClickHouse)
            .fragment(Sql::raw("a AS (SELECT 1)"))
            .fragment(Sql::raw("b AS (SELECT 2)"))
            .main_query(Sql::raw("SELECT * FROM b"))
            .build();
        assert_eq!(
            built.text(),
            "WITH\n    a AS (SELECT 1),\n    b AS (SELECT 2)\n    SELECT * FROM b"
        );
    }

    #[test]
    fn test_session_chain_params_union() {
        let options = SessionOptions::default().with_column(crate::query::filters::EventColumn::Url);
        let built = QueryBuilder::new(Dialect::ClickHouse)
            .session_boundaries(&scope(), &options)
            .session_groups(&options)
            .session_metrics()
            .page_metrics()
            .main_query(safe_sql!(
                "SELECT * FROM page_metrics LIMIT ",
                Sql::uint32("limit", 10)
            ))
            .build()
            .build()
            .unwrap();

        let boundaries = built.text.find("session_boundaries AS").unwrap();
        let groups = built.text.find("session_groups AS").unwrap();
        let metrics = built.text.find("session_metrics AS").unwrap();
        let pages = built.text.find("page_metrics AS").unwrap();
        assert!(boundaries < groups && groups < metrics && metrics < pages);

        assert_eq!(built.params.get("limit"), Some(&ParamValue::UInt32(10)));
        assert_eq!(
            built.params.get("session_timeout"),
            Some(&ParamValue::UInt32(1800))
        );
        assert!(built.params.contains_key("site_id"));
        assert!(built.params.contains_key("start"));
        assert!(built.params.contains_key("end"));
    }

    #[test]
    fn test_dialect_is_kept() {
        assert_eq!(QueryBuilder::new(Dialect::DuckDb).dialect(), Dialect::DuckDb);
    }
}
