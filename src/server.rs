use crate::api::stats;
use crate::query::cache::QueryCache;
use axum::extract::State;
use axum::http::{header, HeaderValue, Method};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use duckdb::Connection;
use parking_lot::Mutex;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Shared state behind every handler.
pub struct AppState {
    /// The embedded event store. DuckDB work runs on blocking threads while
    /// holding this lock.
    pub conn: Arc<Mutex<Connection>>,
    pub query_cache: QueryCache,
    pub session_timeout_secs: u32,
    pub dashboard_origin: Option<String>,
}

impl AppState {
    pub fn new(conn: Connection, config: &crate::config::Config) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            query_cache: QueryCache::new(config.cache_ttl_secs),
            session_timeout_secs: config.session_timeout_secs,
            dashboard_origin: config.dashboard_origin.clone(),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = build_dashboard_cors(state.dashboard_origin.as_deref());

    let stats_routes = Router::new()
        .route("/stats/pageviews", get(stats::get_pageviews))
        .route("/stats/visitors", get(stats::get_visitors))
        .route("/stats/breakdown/{dimension}", get(stats::get_breakdown))
        .route(
            "/stats/breakdown/{dimension}/timeseries",
            get(stats::get_breakdown_timeseries),
        )
        .route("/stats/pages", get(stats::get_pages))
        .route("/stats/pages/entry", get(stats::get_entry_pages))
        .route("/stats/pages/exit", get(stats::get_exit_pages))
        .route("/stats/sessions", get(stats::get_sessions))
        .route("/stats/sessions/{metric}", get(stats::get_session_series))
        .route("/stats/active", get(stats::get_active_visitors))
        .route("/stats/funnel", get(stats::get_funnel))
        .layer(cors);

    Router::new()
        .route("/health", get(health_check))
        .route("/health/detailed", get(detailed_health_check))
        .nest("/api", stats_routes)
        .layer(axum::middleware::map_response(add_security_headers))
        .layer(TimeoutLayer::with_status_code(
            axum::http::StatusCode::REQUEST_TIMEOUT,
            std::time::Duration::from_secs(30),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn add_security_headers(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        "referrer-policy",
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    response
}

/// CORS for the stats API: the configured dashboard origin, or any origin.
fn build_dashboard_cors(dashboard_origin: Option<&str>) -> CorsLayer {
    dashboard_origin.map_or_else(
        || {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET])
                .allow_headers(Any)
        },
        |origin| {
            let allowed_origin = origin.parse::<HeaderValue>().unwrap_or_else(|_| {
                tracing::warn!(origin, "Invalid dashboard origin, allowing any origin");
                HeaderValue::from_static("*")
            });
            CorsLayer::new()
                .allow_origin(allowed_origin)
                .allow_methods([Method::GET])
                .allow_headers([header::CONTENT_TYPE])
        },
    )
}

/// GET /health
async fn health_check() -> &'static str {
    "ok"
}

/// GET /health/detailed
async fn detailed_health_check(State(state): State<Arc<AppState>>) -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "session_timeout_secs": state.session_timeout_secs,
        "cache_entries": state.query_cache.len(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn make_test_state(dashboard_origin: Option<&str>) -> Arc<AppState> {
        let conn = Connection::open_in_memory().unwrap();
        crate::storage::schema::init_schema(&conn).unwrap();
        let config = Config {
            cache_ttl_secs: 0,
            dashboard_origin: dashboard_origin.map(str::to_string),
            ..Config::default()
        };
        Arc::new(AppState::new(conn, &config))
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = build_router(make_test_state(None));
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("x-content-type-options").unwrap(),
            "nosniff"
        );
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_detailed_health_check() {
        let app = build_router(make_test_state(None));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health/detailed")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["session_timeout_secs"], 1800);
        assert_eq!(json["cache_entries"], 0);
    }

    #[tokio::test]
    async fn test_not_found() {
        let app = build_router(make_test_state(None));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/stats/unknown")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cors_restricted_origin() {
        let app = build_router(make_test_state(Some("https://dashboard.example.com")));
        let response = app
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/api/stats/pageviews")
                    .header("origin", "https://dashboard.example.com")
                    .header("access-control-request-method", "GET")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(
            response
                .headers()
                .get("access-control-allow-origin")
                .unwrap(),
            "https://dashboard.example.com"
        );
    }
}
