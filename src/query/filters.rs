//! Compilation of user-selected filters into query predicates.

use crate::safe_sql;
use crate::sql::Sql;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Event columns a dashboard user may filter or break down by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventColumn {
    Url,
    DeviceType,
    CountryCode,
    Browser,
    Os,
    ReferrerSource,
    ReferrerSourceName,
    ReferrerSearchTerm,
    ReferrerUrl,
    UtmSource,
    UtmMedium,
    UtmCampaign,
    UtmTerm,
    UtmContent,
    CustomEventName,
    EventType,
}

impl EventColumn {
    pub const ALL: [Self; 16] = [
        Self::Url,
        Self::DeviceType,
        Self::CountryCode,
        Self::Browser,
        Self::Os,
        Self::ReferrerSource,
        Self::ReferrerSourceName,
        Self::ReferrerSearchTerm,
        Self::ReferrerUrl,
        Self::UtmSource,
        Self::UtmMedium,
        Self::UtmCampaign,
        Self::UtmTerm,
        Self::UtmContent,
        Self::CustomEventName,
        Self::EventType,
    ];

    /// Column name in `analytics.events`.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Url => "url",
            Self::DeviceType => "device_type",
            Self::CountryCode => "country_code",
            Self::Browser => "browser",
            Self::Os => "os",
            Self::ReferrerSource => "referrer_source",
            Self::ReferrerSourceName => "referrer_source_name",
            Self::ReferrerSearchTerm => "referrer_search_term",
            Self::ReferrerUrl => "referrer_url",
            Self::UtmSource => "utm_source",
            Self::UtmMedium => "utm_medium",
            Self::UtmCampaign => "utm_campaign",
            Self::UtmTerm => "utm_term",
            Self::UtmContent => "utm_content",
            Self::CustomEventName => "custom_event_name",
            Self::EventType => "event_type",
        }
    }

    /// Human-readable name.
    pub const fn label(self) -> &'static str {
        match self {
            Self::Url => "URL",
            Self::DeviceType => "Device",
            Self::CountryCode => "Country",
            Self::Browser => "Browser",
            Self::Os => "Operating system",
            Self::ReferrerSource => "Referrer source",
            Self::ReferrerSourceName => "Referrer name",
            Self::ReferrerSearchTerm => "Referrer term",
            Self::ReferrerUrl => "Referrer URL",
            Self::UtmSource => "UTM source",
            Self::UtmMedium => "UTM medium",
            Self::UtmCampaign => "UTM campaign",
            Self::UtmTerm => "UTM term",
            Self::UtmContent => "UTM content",
            Self::CustomEventName => "Event",
            Self::EventType => "Type",
        }
    }

    /// The column as trusted query text.
    pub const fn sql(self) -> Sql {
        Sql::raw(self.as_str())
    }
}

impl FromStr for EventColumn {
    type Err = ParseFilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|column| column.as_str() == s)
            .ok_or_else(|| ParseFilterError(format!("Unknown column: '{s}'")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Is,
    IsNot,
}

impl FilterOperator {
    /// Matching is case-insensitive; `*` in the value acts as a wildcard.
    pub const fn sql(self) -> Sql {
        match self {
            Self::Is => Sql::raw("ILIKE"),
            Self::IsNot => Sql::raw("NOT ILIKE"),
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::Is => "is",
            Self::IsNot => "is not",
        }
    }
}

impl FromStr for FilterOperator {
    type Err = ParseFilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "is" | "=" => Ok(Self::Is),
            "is_not" | "!=" => Ok(Self::IsNot),
            _ => Err(ParseFilterError(format!("Unknown operator: '{s}'"))),
        }
    }
}

/// `column operator value`, e.g. `url is /blog/*`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryFilter {
    pub column: EventColumn,
    pub operator: FilterOperator,
    pub value: String,
}

impl QueryFilter {
    pub fn new(column: EventColumn, operator: FilterOperator, value: impl Into<String>) -> Self {
        Self {
            column,
            operator,
            value: value.into(),
        }
    }

    /// `column ILIKE {param_name:String}` with the value bound under `param_name`.
    pub fn predicate(&self, param_name: String) -> Sql {
        safe_sql!(
            self.column.sql(),
            " ",
            self.operator.sql(),
            " ",
            Sql::string(param_name, self.value.replace('*', "%")),
        )
    }

    /// Display form, e.g. `URL is /pricing`.
    pub fn label(&self) -> String {
        format!(
            "{} {} {}",
            self.column.label(),
            self.operator.label(),
            self.value
        )
    }
}

impl FromStr for QueryFilter {
    type Err = ParseFilterError;

    /// Parses `column:operator:value`; the value may itself contain `:`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().splitn(3, ':');
        let (Some(column), Some(operator), Some(value)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(ParseFilterError(format!(
                "Invalid filter: '{s}'. Use 'column:operator:value'."
            )));
        };
        Ok(Self {
            column: column.parse()?,
            operator: operator.parse()?,
            value: value.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseFilterError(pub String);

impl std::fmt::Display for ParseFilterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ParseFilterError {}

/// One predicate per non-empty filter, bound as `query_filter_<i>`.
///
/// With no usable filters this returns a single `1=1` so the result can always
/// be AND-joined into a `WHERE` clause.
pub fn filter_predicates(filters: &[QueryFilter]) -> Vec<Sql> {
    let predicates: Vec<Sql> = filters
        .iter()
        .filter(|filter| !filter.value.is_empty())
        .enumerate()
        .map(|(i, filter)| filter.predicate(format!("query_filter_{i}")))
        .collect();

    if predicates.is_empty() {
        vec![Sql::raw("1=1")]
    } else {
        predicates
    }
}

/// All filters AND-joined into one predicate.
pub fn where_filters(filters: &[QueryFilter]) -> Sql {
    Sql::and(filter_predicates(filters))
}
