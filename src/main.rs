use better_analytics::config::Config;
use better_analytics::server::{self, AppState};
use better_analytics::storage;
use duckdb::Connection;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "better_analytics=info,tower_http=info".into()),
        )
        .init();

    // Load configuration
    let config_path = std::env::args().nth(1);
    let config = Config::load(config_path.as_deref().map(std::path::Path::new));

    tracing::info!(
        host = %config.host,
        port = config.port,
        database = ?config.database_path,
        session_timeout_secs = config.session_timeout_secs,
        "Starting Better Analytics"
    );

    // Initialize DuckDB
    let conn = match &config.database_path {
        Some(path) => Connection::open(path)
            .unwrap_or_else(|e| panic!("Failed to open DuckDB at {}: {e}", path.display())),
        None => {
            tracing::warn!("No database path configured, using an in-memory store");
            Connection::open_in_memory().expect("Failed to open DuckDB")
        }
    };
    storage::schema::init_schema(&conn).expect("Failed to initialize schema");

    let state = Arc::new(AppState::new(conn, &config));

    // Periodically evict expired cache entries
    let cache = state.query_cache.clone();
    let cleanup_every = Duration::from_secs(config.cache_ttl_secs.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(cleanup_every);
        loop {
            interval.tick().await;
            let removed = cache.cleanup_expired();
            if removed > 0 {
                tracing::debug!(removed, "Evicted expired cache entries");
            }
        }
    });

    let app = server::build_router(state);
    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| panic!("Failed to bind to {addr}: {e}"));

    tracing::info!(addr = %addr, "Listening");
    let shutdown_timeout = Duration::from_secs(config.shutdown_timeout_secs);
    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());

    // In-flight requests get `shutdown_timeout` to finish once the signal
    // arrives; the server future itself only resolves after they drain.
    tokio::select! {
        result = server => result.expect("Server error"),
        () = async {
            shutdown_signal().await;
            tokio::time::sleep(shutdown_timeout).await;
        } => {
            tracing::warn!(
                timeout_secs = config.shutdown_timeout_secs,
                "Shutdown timeout elapsed, dropping remaining connections"
            );
        }
    }
    tracing::info!("Server stopped");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
