use crate::api::errors::ApiError;
use crate::chart::{
    analyze_funnel, sorted_categories, to_area_chart, to_pie_chart, to_stacked_chart, ComparePeriod,
    DateRange, RawPoint,
};
use crate::granularity::Granularity;
use crate::query::cache::QueryCache;
use crate::query::filters::{EventColumn, QueryFilter};
use crate::query::pages::SessionEdge;
use crate::query::sessions::{SessionMetric, SessionOptions};
use crate::query::{breakdowns, funnel, pages, realtime, sessions, timeseries};
use crate::query::{Dialect, EventScope, QueryError};
use crate::server::AppState;
use crate::sql::Sql;
use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Days, NaiveDate, NaiveDateTime, Utc};
use duckdb::Connection;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Default number of rows for breakdowns and top pages.
const DEFAULT_LIMIT: u32 = 10;
const MAX_LIMIT: u32 = 1000;

/// Query parameters for stats endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct StatsParams {
    pub site_id: String,
    #[serde(default = "default_period")]
    pub period: String,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub granularity: Option<Granularity>,
    /// `previous` compares against the equally long range just before.
    pub compare: Option<String>,
    pub compare_start_date: Option<String>,
    pub compare_end_date: Option<String>,
    /// Comma-separated `column:operator:value` filters.
    pub filters: Option<String>,
    pub limit: Option<u32>,
}

fn default_period() -> String {
    "30d".to_string()
}

/// Validate that a `site_id` parameter is safe to use as a query parameter.
///
/// - Must be non-empty and at most 256 bytes.
/// - Must contain only alphanumeric ASCII characters or `.`, `-`, `_`, `:`.
pub fn validate_site_id(site_id: &str) -> Result<(), ApiError> {
    if site_id.is_empty() {
        return Err(ApiError::BadRequest(
            "site_id must not be empty".to_string(),
        ));
    }
    if site_id.len() > 256 {
        return Err(ApiError::BadRequest(
            "site_id must be at most 256 characters".to_string(),
        ));
    }
    let valid = site_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ':'));
    if !valid {
        return Err(ApiError::BadRequest(
            "site_id may only contain alphanumeric characters, '.', '-', '_', ':'".to_string(),
        ));
    }
    Ok(())
}

fn day_start(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(chrono::NaiveTime::MIN).and_utc()
}

fn day_end(date: NaiveDate) -> DateTime<Utc> {
    day_start(date) + chrono::Duration::seconds(86_399)
}

/// Parse `YYYY-MM-DD HH:MM:SS` or `YYYY-MM-DD`. A bare date means the start
/// of that day, or its last second when `end_of_day` is set.
fn parse_date(value: &str, end_of_day: bool) -> Result<DateTime<Utc>, ApiError> {
    let value = value.trim();
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, crate::sql::DATETIME_FORMAT) {
        return Ok(dt.and_utc());
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|_| {
        ApiError::BadRequest(format!(
            "Invalid date: '{value}'. Use YYYY-MM-DD or YYYY-MM-DD HH:MM:SS."
        ))
    })?;
    Ok(if end_of_day {
        day_end(date)
    } else {
        day_start(date)
    })
}

fn explicit_range(start: &str, end: &str) -> Result<DateRange, ApiError> {
    let range = DateRange::new(parse_date(start, false)?, parse_date(end, true)?);
    if range.start > range.end {
        return Err(ApiError::BadRequest(
            "start_date must not be after end_date".to_string(),
        ));
    }
    Ok(range)
}

/// Whole UTC days ending with `today`.
fn period_range(period: &str, today: NaiveDate) -> Result<DateRange, ApiError> {
    let days_back = match period {
        "day" | "today" => 0,
        "7d" => 7,
        "30d" => 30,
        "90d" => 90,
        _ => {
            return Err(ApiError::BadRequest(format!(
                "Invalid period: {period}. Use 'day', '7d', '30d', '90d', or provide start_date and end_date."
            )));
        }
    };
    Ok(DateRange::new(
        day_start(today - Days::new(days_back)),
        day_end(today),
    ))
}

/// Resolve the range from explicit dates, or from `period` when either is
/// missing.
fn resolve_range(
    period: &str,
    start_date: Option<&str>,
    end_date: Option<&str>,
    today: NaiveDate,
) -> Result<DateRange, ApiError> {
    match (start_date, end_date) {
        (Some(start), Some(end)) => explicit_range(start, end),
        _ => period_range(period, today),
    }
}

/// Parse comma-separated filters. Blank entries are skipped.
fn parse_filters(raw: Option<&str>) -> Result<Vec<QueryFilter>, ApiError> {
    raw.unwrap_or_default()
        .split(',')
        .filter(|part| !part.trim().is_empty())
        .map(|part| {
            part.parse::<QueryFilter>()
                .map_err(|e| ApiError::BadRequest(e.to_string()))
        })
        .collect()
}

/// Requested granularity if it keeps the chart readable, else the closest
/// allowed one. Short ranges default to hourly buckets.
fn choose_granularity(requested: Option<Granularity>, range: &DateRange) -> Granularity {
    let allowed = Granularity::allowed_for_range(range.start, range.end);
    let default = if allowed.contains(&Granularity::Minute) {
        Granularity::Hour
    } else {
        Granularity::Day
    };
    requested.unwrap_or(default).or_fallback(&allowed)
}

/// Chart range whose start sits on a bucket boundary, so presenter keys match
/// the truncated timestamps the store returns.
fn align_range(range: &DateRange, granularity: Granularity) -> DateRange {
    let start = DateTime::from_timestamp_millis(granularity.floor(range.start)).unwrap_or(range.start);
    DateRange::new(start, range.end)
}

/// A query period: what to scope the query to and what to chart.
#[derive(Debug, Clone)]
struct Period {
    scope: EventScope,
    chart_range: DateRange,
}

impl Period {
    fn new(site_id: &str, range: DateRange, granularity: Granularity) -> Self {
        Self {
            scope: EventScope::new(site_id, range.start, range.end),
            chart_range: align_range(&range, granularity),
        }
    }
}

/// Everything a stats request resolves to before touching the store.
#[derive(Debug, Clone)]
struct Selection {
    current: Period,
    compare: Option<Period>,
    granularity: Granularity,
    filters: Vec<QueryFilter>,
    limit: u32,
}

impl StatsParams {
    fn compare_range(&self, range: &DateRange) -> Result<Option<DateRange>, ApiError> {
        if let (Some(start), Some(end)) = (&self.compare_start_date, &self.compare_end_date) {
            return explicit_range(start, end).map(Some);
        }
        match self.compare.as_deref() {
            None | Some("" | "none") => Ok(None),
            Some("previous") => Ok(Some(range.previous())),
            Some(other) => Err(ApiError::BadRequest(format!(
                "Invalid compare: '{other}'. Use 'previous' or provide compare_start_date and compare_end_date."
            ))),
        }
    }

    fn resolve_at(&self, today: NaiveDate) -> Result<Selection, ApiError> {
        validate_site_id(&self.site_id)?;
        let range = resolve_range(
            &self.period,
            self.start_date.as_deref(),
            self.end_date.as_deref(),
            today,
        )?;
        let granularity = choose_granularity(self.granularity, &range);
        let compare = self
            .compare_range(&range)?
            .map(|compare| Period::new(&self.site_id, compare, granularity));

        Ok(Selection {
            current: Period::new(&self.site_id, range, granularity),
            compare,
            granularity,
            filters: parse_filters(self.filters.as_deref())?,
            limit: self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT),
        })
    }

    fn resolve(&self) -> Result<Selection, ApiError> {
        self.resolve_at(Utc::now().date_naive())
    }
}

/// Key covering every query a response is built from. `label` carries
/// presentation inputs that are not part of any query.
fn cache_key(label: &str, queries: &[Sql]) -> Result<String, ApiError> {
    let keys = queries
        .iter()
        .map(|sql| QueryCache::key(label, sql))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(serde_json::json!([label, keys]).to_string())
}

/// Run store work on the blocking pool while holding the connection lock.
async fn run_blocking<T, F>(state: &Arc<AppState>, work: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&Connection) -> Result<T, QueryError> + Send + 'static,
{
    let conn = Arc::clone(&state.conn);
    let result = tokio::task::spawn_blocking(move || {
        let conn = conn.lock();
        work(&conn)
    })
    .await
    .map_err(|e| ApiError::Internal(format!("Query task panicked: {e}")))??;
    Ok(result)
}

/// Serve from the cache, or compute, serialize, and remember the response.
async fn cached<T, F>(
    state: &Arc<AppState>,
    key: String,
    work: F,
) -> Result<Json<serde_json::Value>, ApiError>
where
    T: Serialize + Send + 'static,
    F: FnOnce(&Connection) -> Result<T, QueryError> + Send + 'static,
{
    if let Some(hit) = state.query_cache.get(&key) {
        tracing::debug!(key = %key, "Query cache hit");
        return Ok(Json(hit));
    }

    let result = run_blocking(state, work).await?;
    let value = serde_json::to_value(&result)
        .map_err(|e| ApiError::Internal(format!("Failed to serialize response: {e}")))?;
    state.query_cache.insert(key, value.clone());
    Ok(Json(value))
}

#[derive(Debug, Clone, Copy)]
enum Series {
    Pageviews,
    Visitors,
    Sessions {
        metric: SessionMetric,
        timeout_secs: u32,
    },
}

impl Series {
    const fn name(self) -> &'static str {
        match self {
            Self::Pageviews => "pageviews",
            Self::Visitors => "visitors",
            Self::Sessions { metric, .. } => metric.as_str(),
        }
    }

    fn session_options(timeout_secs: u32, filters: &[QueryFilter]) -> SessionOptions {
        SessionOptions::default()
            .with_timeout(timeout_secs)
            .with_filters(filters.to_vec())
    }

    fn sql(self, scope: &EventScope, granularity: Granularity, filters: &[QueryFilter]) -> Sql {
        match self {
            Self::Pageviews => timeseries::pageviews_query(Dialect::DuckDb, scope, granularity, filters),
            Self::Visitors => {
                timeseries::unique_visitors_query(Dialect::DuckDb, scope, granularity, filters)
            }
            Self::Sessions {
                metric,
                timeout_secs,
            } => sessions::session_series_query(
                Dialect::DuckDb,
                scope,
                granularity,
                &Self::session_options(timeout_secs, filters),
                metric,
            ),
        }
    }

    fn query(
        self,
        conn: &Connection,
        scope: &EventScope,
        granularity: Granularity,
        filters: &[QueryFilter],
    ) -> Result<Vec<RawPoint>, QueryError> {
        match self {
            Self::Pageviews => timeseries::query_pageviews(conn, scope, granularity, filters),
            Self::Visitors => timeseries::query_unique_visitors(conn, scope, granularity, filters),
            Self::Sessions {
                metric,
                timeout_secs,
            } => sessions::query_session_series(
                conn,
                scope,
                granularity,
                &Self::session_options(timeout_secs, filters),
                metric,
            ),
        }
    }
}

async fn area_chart(
    state: &Arc<AppState>,
    params: &StatsParams,
    series: Series,
) -> Result<Json<serde_json::Value>, ApiError> {
    let selection = params.resolve()?;
    let mut queries = vec![series.sql(
        &selection.current.scope,
        selection.granularity,
        &selection.filters,
    )];
    if let Some(compare) = &selection.compare {
        queries.push(series.sql(&compare.scope, selection.granularity, &selection.filters));
    }
    let key = cache_key(series.name(), &queries)?;

    cached(state, key, move |conn| {
        let Selection {
            current,
            compare,
            granularity,
            filters,
            ..
        } = selection;
        let rows = series.query(conn, &current.scope, granularity, &filters)?;
        let compare = compare
            .map(|period| {
                series
                    .query(conn, &period.scope, granularity, &filters)
                    .map(|rows| ComparePeriod {
                        rows,
                        range: period.chart_range,
                    })
            })
            .transpose()?;
        Ok(to_area_chart(
            series.name(),
            &rows,
            granularity,
            &current.chart_range,
            compare.as_ref(),
        ))
    })
    .await
}

/// GET /api/stats/pageviews: Pageviews per bucket.
pub async fn get_pageviews(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StatsParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    area_chart(&state, &params, Series::Pageviews).await
}

/// GET /api/stats/visitors: New unique visitors per bucket.
pub async fn get_visitors(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StatsParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    area_chart(&state, &params, Series::Visitors).await
}

fn parse_dimension(dimension: &str) -> Result<EventColumn, ApiError> {
    dimension
        .parse()
        .map_err(|_| ApiError::NotFound(format!("Unknown dimension: '{dimension}'")))
}

/// GET /api/stats/breakdown/{dimension}: Visitors per dimension value.
pub async fn get_breakdown(
    State(state): State<Arc<AppState>>,
    Path(dimension): Path<String>,
    Query(params): Query<StatsParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let dimension = parse_dimension(&dimension)?;
    let selection = params.resolve()?;

    let sql_for = |scope: &EventScope| {
        breakdowns::breakdown_query(
            Dialect::DuckDb,
            scope,
            dimension,
            &selection.filters,
            selection.limit,
        )
    };
    let mut queries = vec![sql_for(&selection.current.scope)];
    if let Some(compare) = &selection.compare {
        queries.push(sql_for(&compare.scope));
    }
    let key = cache_key("breakdown", &queries)?;

    cached(&state, key, move |conn| {
        let rows = breakdowns::query_breakdown(
            conn,
            &selection.current.scope,
            dimension,
            &selection.filters,
            selection.limit,
        )?;
        let compare = selection
            .compare
            .as_ref()
            .map(|period| {
                breakdowns::query_breakdown(
                    conn,
                    &period.scope,
                    dimension,
                    &selection.filters,
                    selection.limit,
                )
            })
            .transpose()?;
        Ok(to_pie_chart(&rows, compare.as_deref()))
    })
    .await
}

/// GET /api/stats/breakdown/{dimension}/timeseries: The top `limit` values
/// of a dimension over time.
pub async fn get_breakdown_timeseries(
    State(state): State<Arc<AppState>>,
    Path(dimension): Path<String>,
    Query(params): Query<StatsParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let dimension = parse_dimension(&dimension)?;
    let selection = params.resolve()?;

    let sql_for = |scope: &EventScope| {
        breakdowns::breakdown_timeseries_query(
            Dialect::DuckDb,
            scope,
            dimension,
            selection.granularity,
            &selection.filters,
        )
    };
    let mut queries = vec![sql_for(&selection.current.scope)];
    if let Some(compare) = &selection.compare {
        queries.push(sql_for(&compare.scope));
    }
    let key = cache_key(
        &format!("breakdown_timeseries:{}", selection.limit),
        &queries,
    )?;

    cached(&state, key, move |conn| {
        let Selection {
            current,
            compare,
            granularity,
            filters,
            limit,
        } = selection;
        let rows =
            breakdowns::query_breakdown_timeseries(conn, &current.scope, dimension, granularity, &filters)?;
        let mut categories = sorted_categories(&rows);
        categories.truncate(limit as usize);

        let compare = compare
            .map(|period| {
                breakdowns::query_breakdown_timeseries(
                    conn,
                    &period.scope,
                    dimension,
                    granularity,
                    &filters,
                )
                .map(|rows| ComparePeriod {
                    rows,
                    range: period.chart_range,
                })
            })
            .transpose()?;

        Ok(to_stacked_chart(
            &rows,
            Some(categories),
            granularity,
            &current.chart_range,
            compare.as_ref(),
        ))
    })
    .await
}

/// GET /api/stats/pages: Top pages with engagement metrics.
pub async fn get_pages(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StatsParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let selection = params.resolve()?;
    let options = SessionOptions::default()
        .with_timeout(state.session_timeout_secs)
        .with_filters(selection.filters);
    let scope = selection.current.scope;
    let limit = selection.limit;

    let sql = pages::page_metrics_query(Dialect::DuckDb, &scope, &options, limit);
    let key = cache_key("pages", &[sql])?;

    cached(&state, key, move |conn| {
        pages::query_page_metrics(conn, &scope, &options, limit)
    })
    .await
}

/// GET /api/stats/sessions: Session totals for the range.
pub async fn get_sessions(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StatsParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let selection = params.resolve()?;
    let options = SessionOptions::default()
        .with_timeout(state.session_timeout_secs)
        .with_filters(selection.filters);
    let scope = selection.current.scope;

    let sql = sessions::session_summary_query(Dialect::DuckDb, &scope, &options);
    let key = cache_key("sessions", &[sql])?;

    cached(&state, key, move |conn| {
        sessions::query_session_summary(conn, &scope, &options)
    })
    .await
}

/// GET /api/stats/sessions/{metric}: Bounce rate, average duration, or
/// pages per session per bucket.
pub async fn get_session_series(
    State(state): State<Arc<AppState>>,
    Path(metric): Path<String>,
    Query(params): Query<StatsParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let metric: SessionMetric = metric.parse().map_err(ApiError::NotFound)?;
    let series = Series::Sessions {
        metric,
        timeout_secs: state.session_timeout_secs,
    };
    area_chart(&state, &params, series).await
}

async fn edge_pages(
    state: &Arc<AppState>,
    params: &StatsParams,
    edge: SessionEdge,
) -> Result<Json<serde_json::Value>, ApiError> {
    let selection = params.resolve()?;
    let options = SessionOptions::default()
        .with_timeout(state.session_timeout_secs)
        .with_filters(selection.filters);
    let scope = selection.current.scope;
    let limit = selection.limit;

    let sql = pages::edge_pages_query(Dialect::DuckDb, &scope, &options, edge, limit);
    let key = cache_key(&format!("pages:{}", edge.as_str()), &[sql])?;

    cached(state, key, move |conn| {
        pages::query_edge_pages(conn, &scope, &options, edge, limit)
    })
    .await
}

/// GET /api/stats/pages/entry: Pages sessions most often start on.
pub async fn get_entry_pages(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StatsParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    edge_pages(&state, &params, SessionEdge::Entry).await
}

/// GET /api/stats/pages/exit: Pages sessions most often end on.
pub async fn get_exit_pages(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StatsParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    edge_pages(&state, &params, SessionEdge::Exit).await
}

/// Longest window the active visitors endpoint accepts.
const MAX_ACTIVE_WINDOW_MINUTES: u32 = 1440;

/// Query parameters for the active visitors endpoint.
#[derive(Debug, Deserialize)]
pub struct ActiveParams {
    pub site_id: String,
    pub minutes: Option<u32>,
}

/// GET /api/stats/active: Visitors seen in the last few minutes. Never cached.
pub async fn get_active_visitors(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ActiveParams>,
) -> Result<Json<realtime::ActiveVisitors>, ApiError> {
    validate_site_id(&params.site_id)?;
    let window_minutes = params
        .minutes
        .unwrap_or(realtime::DEFAULT_ACTIVE_WINDOW_MINUTES)
        .clamp(1, MAX_ACTIVE_WINDOW_MINUTES);
    let site_id = params.site_id;
    let now = Utc::now();

    let active = run_blocking(&state, move |conn| {
        realtime::query_active_visitors(conn, &site_id, now, window_minutes)
    })
    .await?;
    Ok(Json(active))
}

/// Query parameters for the funnel endpoint.
#[derive(Debug, Deserialize)]
pub struct FunnelParams {
    pub site_id: String,
    #[serde(default = "default_period")]
    pub period: String,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    /// Comma-separated steps, each a `column:operator:value` filter.
    pub steps: String,
    pub name: Option<String>,
    pub window_secs: Option<u32>,
}

/// GET /api/stats/funnel: Visitors reaching each step, with drop-off analysis.
pub async fn get_funnel(
    State(state): State<Arc<AppState>>,
    Query(params): Query<FunnelParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    validate_site_id(&params.site_id)?;
    let range = resolve_range(
        &params.period,
        params.start_date.as_deref(),
        params.end_date.as_deref(),
        Utc::now().date_naive(),
    )?;
    let scope = EventScope::new(&params.site_id, range.start, range.end);
    let steps = parse_filters(Some(&params.steps))?;
    let window_secs = params
        .window_secs
        .unwrap_or(funnel::DEFAULT_FUNNEL_WINDOW_SECS);
    let name = params.name.unwrap_or_else(|| "Funnel".to_string());

    // Rejects empty and oversized funnels before any work is scheduled.
    let sql = funnel::funnel_query(Dialect::DuckDb, &scope, &steps, window_secs, false)?;
    let key = cache_key(&format!("funnel:{name}"), &[sql])?;

    cached(&state, key, move |conn| {
        let counts = funnel::query_funnel(conn, &scope, &steps, window_secs)?;
        let labels: Vec<String> = steps.iter().map(QueryFilter::label).collect();
        Ok(analyze_funnel(&name, &labels, &counts))
    })
    .await
}
