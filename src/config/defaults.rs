//! Default values for `EngineSettings` fields, kept in their own module the
//! way the teacher separates defaults from the struct definitions that
//! reference them.

pub fn default_bind_https() -> String {
    "0.0.0.0:443".to_string()
}

pub fn default_bind_http() -> String {
    "0.0.0.0:80".to_string()
}

pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

pub fn default_cert_dir() -> String {
    "/opt/mirrorgate/certs".to_string()
}

pub fn default_max_connections() -> usize {
    50_000
}

pub fn default_connection_timeout_secs() -> u64 {
    30
}

pub fn default_session_cookie_name() -> String {
    "ps".to_string()
}

pub fn default_session_max_age_secs() -> u64 {
    3600
}

pub fn default_fingerprint_idle_secs() -> u64 {
    600
}

pub fn default_fingerprint_reap_interval_secs() -> u64 {
    300
}

pub fn default_session_reap_interval_secs() -> u64 {
    300
}

pub fn default_rate_limiter_cleanup_interval_secs() -> u64 {
    120
}

pub fn default_outbound_timeout_secs() -> u64 {
    30
}

pub fn default_log_level() -> String {
    "info,mirrorgate=debug".to_string()
}

pub fn default_log_dir() -> String {
    "/opt/mirrorgate/logs".to_string()
}

pub fn default_log_file() -> String {
    "mirrorgate.log".to_string()
}

pub fn default_access_log_file() -> String {
    "access.log".to_string()
}

pub fn default_geoip_city_db() -> String {
    "/opt/mirrorgate/geoip/GeoLite2-City.mmdb".to_string()
}

pub fn default_geoip_asn_db() -> String {
    "/opt/mirrorgate/geoip/GeoLite2-ASN.mmdb".to_string()
}

pub fn default_allow_list_ttl_secs() -> u64 {
    600
}

pub fn default_outbound_proxy_connect_timeout_ms() -> u64 {
    5_000
}
