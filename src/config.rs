use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Server configuration loaded from a TOML file and `BA_` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// DuckDB database file holding `analytics.events`. In-memory when unset.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    /// Gap in seconds after which a visitor's next event starts a new session.
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u32,
    /// Query cache TTL in seconds (default: 60). 0 = no caching.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Dashboard origin allowed by CORS. Any origin when unset.
    #[serde(default)]
    pub dashboard_origin: Option<String>,
    /// Graceful shutdown timeout in seconds (default: 30).
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

const fn default_port() -> u16 {
    8000
}

const fn default_session_timeout_secs() -> u32 {
    crate::query::sessions::DEFAULT_SESSION_TIMEOUT_SECS
}

const fn default_cache_ttl_secs() -> u64 {
    60
}

const fn default_shutdown_timeout_secs() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            database_path: None,
            session_timeout_secs: default_session_timeout_secs(),
            cache_ttl_secs: default_cache_ttl_secs(),
            dashboard_origin: None,
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "Ignoring unparseable environment override");
            None
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, falling back to defaults.
    ///
    /// Environment variables override file values:
    /// - `BA_HOST` → host
    /// - `BA_PORT` → port
    /// - `BA_DATABASE_PATH` → database_path
    /// - `BA_SESSION_TIMEOUT` → session_timeout_secs
    /// - `BA_CACHE_TTL` → cache_ttl_secs
    /// - `BA_DASHBOARD_ORIGIN` → dashboard_origin
    /// - `BA_SHUTDOWN_TIMEOUT` → shutdown_timeout_secs
    pub fn load(config_path: Option<&Path>) -> Self {
        let mut config =
            config_path.map_or_else(Self::default, |path| match std::fs::read_to_string(path) {
                Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                    tracing::warn!("Failed to parse config file: {e}, using defaults");
                    Self::default()
                }),
                Err(e) => {
                    tracing::warn!("Failed to read config file: {e}, using defaults");
                    Self::default()
                }
            });

        if let Ok(host) = std::env::var("BA_HOST") {
            config.host = host;
        }
        if let Some(port) = env_parse("BA_PORT") {
            config.port = port;
        }
        if let Ok(path) = std::env::var("BA_DATABASE_PATH") {
            config.database_path = Some(PathBuf::from(path));
        }
        if let Some(timeout) = env_parse("BA_SESSION_TIMEOUT") {
            config.session_timeout_secs = timeout;
        }
        if let Some(ttl) = env_parse("BA_CACHE_TTL") {
            config.cache_ttl_secs = ttl;
        }
        if let Ok(origin) = std::env::var("BA_DASHBOARD_ORIGIN") {
            config.dashboard_origin = Some(origin);
        }
        if let Some(timeout) = env_parse("BA_SHUTDOWN_TIMEOUT") {
            config.shutdown_timeout_secs = timeout;
        }

        config
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
