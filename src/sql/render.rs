use super::ParamValue;
use serde::Serialize;
use std::collections::BTreeMap;

/// Error raised while turning a composed expression into a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlError {
    /// Two sub-expressions bind the same name to different values.
    ParamConflict { name: String },
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ParamConflict { name } => {
                write!(f, "Parameter '{name}' is bound to conflicting values")
            }
        }
    }
}

impl std::error::Error for SqlError {}

/// Query text with `{name:Type}` placeholders plus the named values the store
/// substitutes for them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaggedQuery {
    pub text: String,
    pub params: BTreeMap<String, ParamValue>,
}

impl TaggedQuery {
    /// `param_<name>` pairs for the ClickHouse HTTP interface.
    pub fn http_params(&self) -> Vec<(String, String)> {
        self.params
            .iter()
            .map(|(name, value)| (format!("param_{name}"), value.to_clickhouse()))
            .collect()
    }

    /// Stable key identifying this exact query and its bound values.
    ///
    /// Encoded as a JSON array so separators inside bound strings are escaped
    /// and cannot make two parameter sets collide.
    pub fn cache_key(&self, scope: &str) -> String {
        serde_json::json!([scope, self.text, self.params]).to_string()
    }
}

/// Query text with positional `?` placeholders, in binding order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionalQuery {
    pub text: String,
    pub values: Vec<ParamValue>,
}
