use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Server settings, read once at startup from `RESERVD_*` variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub storage_timeout: Duration,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "reservd".into(),
            max_connections: 256,
            compact_threshold: 1000,
            storage_timeout: Duration::from_millis(5000),
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let storage_timeout_ms = parse_or(
            &lookup,
            "RESERVD_STORAGE_TIMEOUT_MS",
            defaults.storage_timeout.as_millis() as u64,
        );
        Self {
            bind: lookup("RESERVD_BIND").unwrap_or(defaults.bind),
            port: parse_or(&lookup, "RESERVD_PORT", defaults.port),
            data_dir: lookup("RESERVD_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            password: lookup("RESERVD_PASSWORD").unwrap_or(defaults.password),
            max_connections: parse_or(&lookup, "RESERVD_MAX_CONNECTIONS", defaults.max_connections),
            compact_threshold: parse_or(&lookup, "RESERVD_COMPACT_THRESHOLD", defaults.compact_threshold),
            storage_timeout: Duration::from_millis(storage_timeout_ms),
            metrics_port: lookup("RESERVD_METRICS_PORT").and_then(|raw| parse_logged("RESERVD_METRICS_PORT", &raw)),
            tls_cert: lookup("RESERVD_TLS_CERT"),
            tls_key: lookup("RESERVD_TLS_KEY"),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key)
        .and_then(|raw| parse_logged(key, &raw))
        .unwrap_or(default)
}

fn parse_logged<T: FromStr>(key: &str, raw: &str) -> Option<T> {
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("ignoring unparseable {key}={raw:?}, using default");
            None
        }
    }
}
