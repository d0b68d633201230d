use chrono::NaiveDateTime;
use serde::{Serialize, Serializer};
use std::fmt;

/// Text format the event store expects for `DateTime` parameters (UTC).
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Declared type of a named placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamType {
    String,
    UInt32,
    DateTime,
    UInt32Array,
}

impl ParamType {
    /// Type name as written inside a `{name:Type}` placeholder.
    pub const fn clickhouse_name(self) -> &'static str {
        match self {
            Self::String => "String",
            Self::UInt32 => "UInt32",
            Self::DateTime => "DateTime",
            Self::UInt32Array => "Array(UInt32)",
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.clickhouse_name())
    }
}

/// A bound parameter value. The set of kinds is closed: anything else has to
/// be converted by the caller before it can reach a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    String(String),
    UInt32(u32),
    DateTime(NaiveDateTime),
    UInt32Array(Vec<u32>),
}

impl ParamValue {
    pub const fn param_type(&self) -> ParamType {
        match self {
            Self::String(_) => ParamType::String,
            Self::UInt32(_) => ParamType::UInt32,
            Self::DateTime(_) => ParamType::DateTime,
            Self::UInt32Array(_) => ParamType::UInt32Array,
        }
    }

    /// Encode the value the way the ClickHouse HTTP interface reads
    /// `param_<name>` entries.
    pub fn to_clickhouse(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            Self::UInt32(n) => n.to_string(),
            Self::DateTime(dt) => dt.format(DATETIME_FORMAT).to_string(),
            Self::UInt32Array(values) => {
                let items: Vec<String> = values.iter().map(u32::to_string).collect();
                format!("[{}]", items.join(","))
            }
        }
    }
}

impl Serialize for ParamValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::String(s) => serializer.serialize_str(s),
            Self::UInt32(n) => serializer.serialize_u32(*n),
            Self::DateTime(dt) => serializer.collect_str(&dt.format(DATETIME_FORMAT)),
            Self::UInt32Array(values) => values.serialize(serializer),
        }
    }
}
