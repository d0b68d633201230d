//! Parameterized query composition.
//!
//! Every analytics query is built from [`Sql`] values. Literal text can only
//! come from `&'static str` constants, so runtime input has no way into the
//! query text except through a typed binder that emits a `{name:Type}`
//! placeholder and records the value separately. Substitution and escaping
//! are left to the store driver.
//!
//! Expressions form a tree that is only flattened when rendered, so nesting a
//! composed expression inside another costs nothing until [`Sql::build`] or
//! [`Sql::build_positional`] walks it once.

mod render;
mod value;

pub use render::{PositionalQuery, SqlError, TaggedQuery};
pub use value::{ParamType, ParamValue, DATETIME_FORMAT};

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt::Write;

/// Compose a [`Sql`] expression from literal segments and sub-expressions.
///
/// ```
/// use better_analytics::{safe_sql, sql::Sql};
///
/// let query = safe_sql!(
///     "SELECT uniq(visitor_id) FROM analytics.events WHERE site_id = ",
///     Sql::string("site_id", "example.com"),
/// );
/// assert_eq!(
///     query.text(),
///     "SELECT uniq(visitor_id) FROM analytics.events WHERE site_id = {site_id:String}"
/// );
/// ```
#[macro_export]
macro_rules! safe_sql {
    () => {
        $crate::sql::Sql::empty()
    };
    ($($part:expr),+ $(,)?) => {
        $crate::sql::Sql::concat([$($crate::sql::Sql::from($part)),+])
    };
}

/// A query expression: literal text, one bound parameter, or a sequence of
/// nested expressions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sql(Node);

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    Literal(&'static str),
    Param { name: String, value: ParamValue },
    Composed(Vec<Sql>),
}

enum Leaf<'a> {
    Text(&'static str),
    Param(&'a str, &'a ParamValue),
}

impl Sql {
    /// The empty expression: no text, no parameters.
    pub const fn empty() -> Self {
        Self(Node::Composed(Vec::new()))
    }

    /// Trusted literal text. Only compile-time strings are accepted.
    pub const fn raw(text: &'static str) -> Self {
        Self(Node::Literal(text))
    }

    /// Interleave literal segments with sub-expressions:
    /// `segments[0] exprs[0] segments[1] ... segments[n]`.
    ///
    /// Expects one fewer expression than segments; any surplus expressions are
    /// appended after the last segment.
    pub fn compose<I>(segments: &[&'static str], exprs: I) -> Self
    where
        I: IntoIterator<Item = Self>,
    {
        let mut exprs = exprs.into_iter();
        let mut parts = Vec::with_capacity(segments.len() * 2);
        for (i, &segment) in segments.iter().enumerate() {
            if !segment.is_empty() {
                parts.push(Self::raw(segment));
            }
            if i + 1 < segments.len() {
                if let Some(expr) = exprs.next() {
                    parts.push(expr);
                }
            }
        }
        parts.extend(exprs);
        Self(Node::Composed(parts))
    }

    /// Concatenate expressions without separators.
    pub fn concat<I>(parts: I) -> Self
    where
        I: IntoIterator<Item = Self>,
    {
        Self(Node::Composed(parts.into_iter().collect()))
    }

    /// `{name:String}` bound to `value`.
    pub fn string(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::param(name.into(), ParamValue::String(value.into()))
    }

    /// `{name:UInt32}` bound to `value`.
    pub fn uint32(name: impl Into<String>, value: u32) -> Self {
        Self::param(name.into(), ParamValue::UInt32(value))
    }

    /// `{name:DateTime}` bound to `value` (stored as naive UTC).
    pub fn datetime(name: impl Into<String>, value: DateTime<Utc>) -> Self {
        Self::param(name.into(), ParamValue::DateTime(value.naive_utc()))
    }

    /// `{name:Array(UInt32)}` bound to `values`.
    pub fn uint32_array(name: impl Into<String>, values: Vec<u32>) -> Self {
        Self::param(name.into(), ParamValue::UInt32Array(values))
    }

    fn param(name: String, value: ParamValue) -> Self {
        debug_assert!(is_valid_param_name(&name), "invalid parameter name {name:?}");
        Self(Node::Param { name, value })
    }

    /// Join expressions with ` AND `.
    pub fn and<I>(exprs: I) -> Self
    where
        I: IntoIterator<Item = Self>,
    {
        Self::join(exprs, " AND ")
    }

    /// Join expressions with ` OR `.
    pub fn or<I>(exprs: I) -> Self
    where
        I: IntoIterator<Item = Self>,
    {
        Self::join(exprs, " OR ")
    }

    /// Join expressions with `, `.
    pub fn separated<I>(exprs: I) -> Self
    where
        I: IntoIterator<Item = Self>,
    {
        Self::join(exprs, ", ")
    }

    /// Join expressions with an arbitrary literal separator.
    pub fn join<I>(exprs: I, separator: &'static str) -> Self
    where
        I: IntoIterator<Item = Self>,
    {
        let mut parts = Vec::new();
        for (i, expr) in exprs.into_iter().enumerate() {
            if i > 0 {
                parts.push(Self::raw(separator));
            }
            parts.push(expr);
        }
        Self(Node::Composed(parts))
    }

    /// Wrap in parentheses, e.g. an OR-list nested inside an AND-list.
    pub fn parenthesized(self) -> Self {
        Self(Node::Composed(vec![Self::raw("("), self, Self::raw(")")]))
    }

    /// `true` when rendering would produce no text.
    pub fn is_empty(&self) -> bool {
        match &self.0 {
            Node::Literal(text) => text.is_empty(),
            Node::Param { .. } => false,
            Node::Composed(parts) => parts.iter().all(Self::is_empty),
        }
    }

    fn walk<'a, F>(&'a self, visit: &mut F)
    where
        F: FnMut(Leaf<'a>),
    {
        match &self.0 {
            Node::Literal(text) => visit(Leaf::Text(text)),
            Node::Param { name, value } => visit(Leaf::Param(name, value)),
            Node::Composed(parts) => {
                for part in parts {
                    part.walk(visit);
                }
            }
        }
    }

    /// Query text with `{name:Type}` placeholders.
    pub fn text(&self) -> String {
        let mut out = String::new();
        self.walk(&mut |leaf| match leaf {
            Leaf::Text(text) => out.push_str(text),
            Leaf::Param(name, value) => {
                let _ = write!(out, "{{{name}:{}}}", value.param_type());
            }
        });
        out
    }

    /// Union of every bound parameter in the tree.
    ///
    /// A name bound twice to the same value is one parameter; bound to two
    /// different values it is a [`SqlError::ParamConflict`].
    pub fn params(&self) -> Result<BTreeMap<String, ParamValue>, SqlError> {
        let mut params: BTreeMap<String, ParamValue> = BTreeMap::new();
        let mut conflict = None;
        self.walk(&mut |leaf| {
            let Leaf::Param(name, value) = leaf else {
                return;
            };
            match params.get(name) {
                Some(existing) if existing != value => {
                    if conflict.is_none() {
                        conflict = Some(name.to_string());
                    }
                }
                Some(_) => {}
                None => {
                    params.insert(name.to_string(), value.clone());
                }
            }
        });
        match conflict {
            Some(name) => Err(SqlError::ParamConflict { name }),
            None => Ok(params),
        }
    }

    /// Render for a store that substitutes named `{name:Type}` placeholders.
    pub fn build(&self) -> Result<TaggedQuery, SqlError> {
        let params = self.params()?;
        Ok(TaggedQuery {
            text: self.text(),
            params,
        })
    }

    /// Render for a store that binds positional `?` placeholders.
    ///
    /// Each placeholder occurrence gets its own binding, so a parameter used
    /// twice is bound twice. Date-times are cast in SQL; integer arrays are
    /// written inline since they cannot carry anything but digits.
    pub fn build_positional(&self) -> Result<PositionalQuery, SqlError> {
        self.params()?;
        let mut text = String::new();
        let mut values = Vec::new();
        self.walk(&mut |leaf| match leaf {
            Leaf::Text(t) => text.push_str(t),
            Leaf::Param(_, value) => match value {
                ParamValue::String(_) | ParamValue::UInt32(_) => {
                    text.push('?');
                    values.push(value.clone());
                }
                ParamValue::DateTime(_) => {
                    text.push_str("CAST(? AS TIMESTAMP)");
                    values.push(value.clone());
                }
                ParamValue::UInt32Array(items) => {
                    let items: Vec<String> = items.iter().map(u32::to_string).collect();
                    let _ = write!(text, "[{}]", items.join(", "));
                }
            },
        });
        Ok(PositionalQuery { text, values })
    }
}

impl Default for Sql {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<&'static str> for Sql {
    fn from(text: &'static str) -> Self {
        Self::raw(text)
    }
}

impl From<&Self> for Sql {
    fn from(expr: &Self) -> Self {
        expr.clone()
    }
}

fn is_valid_param_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_empty_input() {
        let query = safe_sql!();
        assert_eq!(query.text(), "");
        assert!(query.params().unwrap().is_empty());
        assert!(query.is_empty());
    }

    #[test]
    fn test_raw_sql_without_params() {
        let query = safe_sql!("SELECT uniq(visitor_id) FROM analytics.events");
        let built = query.build().unwrap();
        assert_eq!(built.text, "SELECT uniq(visitor_id) FROM analytics.events");
        assert!(built.params.is_empty());
    }

    #[test]
    fn test_tagged_param() {
        let query = safe_sql!(
            "SELECT uniq(visitor_id) FROM analytics.events WHERE site_id = ",
            Sql::string("site_id", "test"),
        );
        let built = query.build().unwrap();
        assert_eq!(
            built.text,
            "SELECT uniq(visitor_id) FROM analytics.events WHERE site_id = {site_id:String}"
        );
        assert_eq!(
            built.params.get("site_id"),
            Some(&ParamValue::String("test".to_string()))
        );
    }

    #[test]
    fn test_nested_composition() {
        let inner = safe_sql!(
            "site_id = ",
            Sql::string("site_id", "test"),
            " AND event_type = ",
            Sql::string("event_type", "custom"),
        );
        let query = safe_sql!(
            "SELECT uniq(visitor_id) FROM analytics.events WHERE ",
            inner
        );
        let built = query.build().unwrap();
        assert_eq!(
            built.text,
            "SELECT uniq(visitor_id) FROM analytics.events WHERE site_id = {site_id:String} AND event_type = {event_type:String}"
        );
        assert_eq!(built.params.len(), 2);
        assert_eq!(
            built.params.get("event_type"),
            Some(&ParamValue::String("custom".to_string()))
        );
    }

    #[test]
    fn test_or_list_of_mapped_params() {
        let pages = ["a", "b", "c"];
        let predicates = pages
            .iter()
            .enumerate()
            .map(|(i, page)| safe_sql!("url = ", Sql::string(format!("page_{i}"), *page)));
        let query = safe_sql!(
            "SELECT uniq(visitor_id) FROM analytics.events WHERE ",
            Sql::or(predicates)
        );
        let built = query.build().unwrap();
        assert_eq!(
            built.text,
            "SELECT uniq(visitor_id) FROM analytics.events WHERE url = {page_0:String} OR url = {page_1:String} OR url = {page_2:String}"
        );
        assert_eq!(built.params.len(), 3);
        assert_eq!(
            built.params.get("page_2"),
            Some(&ParamValue::String("c".to_string()))
        );
    }

    #[test]
    fn test_compose_interleaves_segments() {
        let query = Sql::compose(
            &["a = ", " AND b = ", ""],
            [Sql::uint32("a", 1), Sql::uint32("b", 2)],
        );
        assert_eq!(query.text(), "a = {a:UInt32} AND b = {b:UInt32}");
    }

    #[test]
    fn test_compose_without_exprs_returns_literal() {
        let query = Sql::compose(&["SELECT 1"], []);
        assert_eq!(query.text(), "SELECT 1");
        assert!(query.params().unwrap().is_empty());
    }

    #[test]
    fn test_empty_joins() {
        for joined in [Sql::and([]), Sql::or([]), Sql::separated([])] {
            assert_eq!(joined.text(), "");
            assert!(joined.params().unwrap().is_empty());
        }
    }

    #[test]
    fn test_separated_and_parenthesized() {
        let list = Sql::separated([Sql::raw("a"), Sql::raw("b")]);
        assert_eq!(list.text(), "a, b");
        let group = Sql::or([Sql::raw("x"), Sql::raw("y")]).parenthesized();
        let query = Sql::and([Sql::raw("1=1"), group]);
        assert_eq!(query.text(), "1=1 AND (x OR y)");
    }

    #[test]
    fn test_typed_placeholders() {
        let at = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
        let query = Sql::separated([
            Sql::datetime("start", at),
            Sql::uint32_array("levels", vec![1, 2]),
        ]);
        assert_eq!(query.text(), "{start:DateTime}, {levels:Array(UInt32)}");
    }

    #[test]
    fn test_same_param_twice_is_one_param() {
        let at = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
        let query = safe_sql!(
            "toDate(",
            Sql::datetime("start", at),
            ") AND ts >= ",
            Sql::datetime("start", at)
        );
        let built = query.build().unwrap();
        assert_eq!(built.params.len(), 1);
    }

    #[test]
    fn test_conflicting_param_rejected() {
        let query = safe_sql!(
            Sql::string("site_id", "a.com"),
            " ",
            Sql::string("site_id", "b.com")
        );
        assert_eq!(
            query.build().unwrap_err(),
            SqlError::ParamConflict {
                name: "site_id".to_string()
            }
        );
        assert!(query.build_positional().is_err());
    }

    #[test]
    fn test_positional_rendering() {
        let at = Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap();
        let query = safe_sql!(
            "SELECT * FROM t WHERE site_id = ",
            Sql::string("site_id", "a.com"),
            " AND ts >= ",
            Sql::datetime("start", at),
            " AND level IN ",
            Sql::uint32_array("levels", vec![1, 2, 3]),
            " LIMIT ",
            Sql::uint32("limit", 5),
        );
        let positional = query.build_positional().unwrap();
        assert_eq!(
            positional.text,
            "SELECT * FROM t WHERE site_id = ? AND ts >= CAST(? AS TIMESTAMP) AND level IN [1, 2, 3] LIMIT ?"
        );
        assert_eq!(
            positional.values,
            vec![
                ParamValue::String("a.com".to_string()),
                ParamValue::DateTime(at.naive_utc()),
                ParamValue::UInt32(5),
            ]
        );
    }

    #[test]
    fn test_positional_binds_each_occurrence() {
        let query = safe_sql!(
            "a = ",
            Sql::string("site_id", "x"),
            " AND b = ",
            Sql::string("site_id", "x")
        );
        let positional = query.build_positional().unwrap();
        assert_eq!(positional.text, "a = ? AND b = ?");
        assert_eq!(positional.values.len(), 2);
    }

    #[test]
    fn test_value_never_reaches_text() {
        let hostile = "'; DROP TABLE analytics.events; --";
        let query = safe_sql!("url = ", Sql::string("url", hostile));
        assert!(!query.text().contains("DROP"));
        assert!(!query.build_positional().unwrap().text.contains("DROP"));
    }

    #[test]
    fn test_param_name_validation() {
        assert!(is_valid_param_name("query_filter_0"));
        assert!(is_valid_param_name("_x"));
        assert!(!is_valid_param_name(""));
        assert!(!is_valid_param_name("0abc"));
        assert!(!is_valid_param_name("a:b"));
        assert!(!is_valid_param_name("a}"));
    }
}
