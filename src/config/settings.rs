use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;

use super::defaults;

/// Process-wide configuration for the proxy engine.
///
/// Deserialized from a TOML file, with `serde` defaults filling in anything
/// the operator omits. This is the engine-level surface; per-proxy policy
/// (hosts, capture/rewrite/response rules) lives in the YAML `ProxyConfig`
/// documents compiled by [`crate::config::proxy_config`].
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "defaults::default_bind_https")]
    pub bind_https: String,

    #[serde(default = "defaults::default_bind_http")]
    pub bind_http: String,

    #[serde(default = "defaults::default_workers")]
    pub workers: usize,

    #[serde(default = "defaults::default_max_connections")]
    pub max_connections: usize,

    #[serde(default = "defaults::default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,

    #[serde(default = "defaults::default_cert_dir")]
    pub cert_dir: String,

    #[serde(default = "defaults::default_session_cookie_name")]
    pub session_cookie_name: String,

    #[serde(default = "defaults::default_session_max_age_secs")]
    pub session_max_age_secs: u64,

    #[serde(default = "defaults::default_fingerprint_idle_secs")]
    pub fingerprint_idle_secs: u64,

    #[serde(default = "defaults::default_fingerprint_reap_interval_secs")]
    pub fingerprint_reap_interval_secs: u64,

    #[serde(default = "defaults::default_session_reap_interval_secs")]
    pub session_reap_interval_secs: u64,

    #[serde(default = "defaults::default_rate_limiter_cleanup_interval_secs")]
    pub rate_limiter_cleanup_interval_secs: u64,

    #[serde(default = "defaults::default_allow_list_ttl_secs")]
    pub allow_list_ttl_secs: u64,

    #[serde(default = "defaults::default_outbound_timeout_secs")]
    pub outbound_timeout_secs: u64,

    #[serde(default = "defaults::default_outbound_proxy_connect_timeout_ms")]
    pub outbound_proxy_connect_timeout_ms: u64,

    #[serde(default = "GeoipConfig::default")]
    pub geoip: GeoipConfig,

    #[serde(default = "LoggingConfig::default")]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub proxies: Vec<ProxyEntry>,

    /// Path to a YAML fixture seeding the catalog collaborators (domains,
    /// campaigns, templates, recipients). Persistent catalog storage and
    /// its CRUD surface stay external (§1); this is the minimal stand-in
    /// that lets the engine run standalone. `None` starts with an empty
    /// catalog — every request 404s until one is pointed here.
    #[serde(default)]
    pub catalog_fixture: Option<String>,
}

impl EngineSettings {
    /// Load configuration from a TOML file at the given path.
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path))?;
        let settings: EngineSettings = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path))?;
        Ok(settings)
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            bind_https: defaults::default_bind_https(),
            bind_http: defaults::default_bind_http(),
            workers: defaults::default_workers(),
            max_connections: defaults::default_max_connections(),
            connection_timeout_secs: defaults::default_connection_timeout_secs(),
            cert_dir: defaults::default_cert_dir(),
            session_cookie_name: defaults::default_session_cookie_name(),
            session_max_age_secs: defaults::default_session_max_age_secs(),
            fingerprint_idle_secs: defaults::default_fingerprint_idle_secs(),
            fingerprint_reap_interval_secs: defaults::default_fingerprint_reap_interval_secs(),
            session_reap_interval_secs: defaults::default_session_reap_interval_secs(),
            rate_limiter_cleanup_interval_secs:
                defaults::default_rate_limiter_cleanup_interval_secs(),
            allow_list_ttl_secs: defaults::default_allow_list_ttl_secs(),
            outbound_timeout_secs: defaults::default_outbound_timeout_secs(),
            outbound_proxy_connect_timeout_ms:
                defaults::default_outbound_proxy_connect_timeout_ms(),
            geoip: GeoipConfig::default(),
            logging: LoggingConfig::default(),
            proxies: Vec::new(),
            catalog_fixture: None,
        }
    }
}

/// A single phishing domain entry: which upstream `Domain` it serves and
/// where its compiled `ProxyConfig` YAML document lives on disk.
///
/// This is the engine-config-level pointer; the `Domain`/`Campaign`/
/// `Template` rows themselves are owned by the external catalog (§6).
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyEntry {
    pub id: String,
    pub domain: String,
    pub config_path: String,

    /// Overwrites path+query on a freshly created session's first request
    /// (§4.7 step 7), e.g. `/login`. `None` leaves the inbound path alone.
    #[serde(default)]
    pub start_url: Option<String>,
}

/// GeoIP database configuration. Loading is the engine's responsibility;
/// the lookup itself is consumed behind the `GeoIp` trait (§6).
#[derive(Debug, Clone, Deserialize)]
pub struct GeoipConfig {
    #[serde(default = "defaults::default_geoip_city_db")]
    pub city_db: String,

    #[serde(default = "defaults::default_geoip_asn_db")]
    pub asn_db: String,
}

impl Default for GeoipConfig {
    fn default() -> Self {
        Self {
            city_db: defaults::default_geoip_city_db(),
            asn_db: defaults::default_geoip_asn_db(),
        }
    }
}

/// Structured logging configuration (`tracing` + `tracing-appender`).
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "defaults::default_log_level")]
    pub level: String,

    #[serde(default = "defaults::default_log_dir")]
    pub dir: String,

    #[serde(default = "defaults::default_log_file")]
    pub file: String,

    #[serde(default = "defaults::default_access_log_file")]
    pub access_log_file: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::default_log_level(),
            dir: defaults::default_log_dir(),
            file: defaults::default_log_file(),
            access_log_file: defaults::default_access_log_file(),
        }
    }
}
