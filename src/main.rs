mod config;
mod crypto;
mod error;
mod metrics;
mod models;
mod proxy;
mod storage;
mod util;

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::proxy_config::ProxyConfig;
use crate::config::settings::{EngineSettings, LoggingConfig};
use crate::metrics::EngineMetrics;
use crate::proxy::access_log::AccessLogger;
use crate::proxy::http_entry::{CompiledProxy, HttpEntry};
use crate::proxy::events::EventEmitter;
use crate::proxy::server::ProxyServer;
use crate::proxy::tls::build_tls_config;
use crate::storage::catalog::{DomainCatalog, CampaignCatalog, Obfuscator, TemplateRenderer};
use crate::storage::fingerprint_store::FingerprintStore;
use crate::storage::geoip::{GeoIp, MaxMindGeoIp};
use crate::storage::memory_catalog::{
    JsonlEventSink, NoopObfuscator, ReqwestWebhookDispatcher, SimpleTemplateRenderer, StaticCatalog,
};
use crate::storage::rate_limit_store::RateLimitStore;
use crate::storage::session_store::SessionStore;

/// Parses the `--config` CLI flag. Defaults to `/opt/mirrorgate/config/mirrorgate.toml`.
fn parse_config_path() -> String {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = String::from("/opt/mirrorgate/config/mirrorgate.toml");

    let mut i = 1;
    while i < args.len() {
        if args[i] == "--config" {
            if let Some(path) = args.get(i + 1) {
                config_path = path.clone();
            }
            i += 2;
        } else {
            i += 1;
        }
    }

    config_path
}

/// Initializes the `tracing` subscriber with both stdout and rolling-file
/// output (A3), matching the teacher's split between a stdout layer for
/// interactive operation and a daily-rolling file layer for durable logs.
/// Returns the `tracing_appender` worker guard, which must stay alive for
/// the life of the process or buffered log lines are dropped on exit.
fn init_tracing(logging: &LoggingConfig) -> tracing_appender::non_blocking::WorkerGuard {
    let _ = fs::create_dir_all(&logging.dir);

    let file_appender = tracing_appender::rolling::daily(&logging.dir, &logging.file);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false).with_target(true);

    let stdout_layer = fmt::layer().with_writer(std::io::stdout).with_target(true);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(logging.level.clone()));

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    guard
}

/// Background loop evicting expired fingerprints, sessions, rate-limit
/// buckets, and allow-list entries (§5 "background tasks"). Each store
/// owns its own reap logic; this just drives the tick.
async fn cleanup_loop(
    fingerprints: Arc<FingerprintStore>,
    sessions: Arc<SessionStore>,
    rate_limits: Arc<RateLimitStore>,
    metrics: Arc<EngineMetrics>,
    fingerprint_idle: Duration,
    fingerprint_interval: Duration,
    session_max_age: Duration,
    session_interval: Duration,
    rate_limiter_interval: Duration,
) {
    let mut fingerprint_tick = tokio::time::interval(fingerprint_interval);
    let mut session_tick = tokio::time::interval(session_interval);
    let mut rate_tick = tokio::time::interval(rate_limiter_interval);

    loop {
        tokio::select! {
            _ = fingerprint_tick.tick() => {
                let n = fingerprints.reap_idle(fingerprint_idle);
                if n > 0 {
                    metrics.record_fingerprints_reaped(n as u64);
                    info!(evicted = n, "fingerprint reaper pass");
                }
            }
            _ = session_tick.tick() => {
                let n = sessions.cleanup_expired(session_max_age);
                if n > 0 {
                    metrics.record_sessions_expired(n as u64);
                    info!(evicted = n, "session reaper pass");
                }
            }
            _ = rate_tick.tick() => {
                let buckets = rate_limits.reap_expired_buckets();
                let allow_list = rate_limits.allow_list_clear_expired();
                if buckets > 0 || allow_list > 0 {
                    info!(buckets, allow_list, "rate-limit / allow-list reaper pass");
                }
            }
        }
    }
}

/// Periodically logs the internal metrics snapshot (A4). Never exposed
/// over HTTP — the admin API that would do that is out of scope (§1).
async fn metrics_loop(metrics: Arc<EngineMetrics>) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let snap = metrics.snapshot();
        info!(
            requests_total = snap.requests_total,
            requests_denied = snap.requests_denied,
            sessions_created = snap.sessions_created,
            sessions_expired = snap.sessions_expired,
            captures_recorded = snap.captures_recorded,
            events_emitted = snap.events_emitted,
            fingerprints_reaped = snap.fingerprints_reaped,
            "metrics snapshot"
        );
    }
}

/// Compiles every configured `ProxyEntry`'s YAML policy document once at
/// startup (§4.4: "recompilation per request is disallowed"), keyed by the
/// phishing host the entry serves.
fn compile_proxies(settings: &EngineSettings) -> HashMap<String, CompiledProxy> {
    let mut proxies = HashMap::with_capacity(settings.proxies.len());

    for entry in &settings.proxies {
        let yaml = match fs::read_to_string(&entry.config_path) {
            Ok(yaml) => yaml,
            Err(e) => {
                error!(proxy_id = %entry.id, path = %entry.config_path, error = %e, "failed to read proxy config file; domain will 503");
                continue;
            }
        };

        match ProxyConfig::compile(&yaml) {
            Ok(config) => {
                info!(proxy_id = %entry.id, domain = %entry.domain, hosts = config.hosts.len(), "compiled proxy config");
                proxies.insert(
                    entry.domain.clone(),
                    CompiledProxy {
                        id: entry.id.clone(),
                        config: Arc::new(config),
                        start_url: entry.start_url.clone(),
                    },
                );
            }
            Err(e) => {
                error!(proxy_id = %entry.id, path = %entry.config_path, error = %e, "invalid proxy config; domain will 503");
            }
        }
    }

    proxies
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Config is read synchronously so `settings.workers` can size the
    // runtime before tokio ever starts (the attribute-macro form can't
    // take a value only known after parsing the config file).
    let config_path = parse_config_path();
    let settings = match EngineSettings::load(&config_path) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("failed to load config from {config_path}, falling back to defaults: {e}");
            EngineSettings::default()
        }
    };
    let settings = Arc::new(settings);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(settings.workers)
        .enable_all()
        .build()
        .expect("failed to build tokio runtime");

    runtime.block_on(run(config_path, settings))
}

async fn run(config_path: String, settings: Arc<EngineSettings>) -> Result<(), Box<dyn std::error::Error>> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls CryptoProvider");

    // ---------------------------------------------------------------
    // 2. Logging
    // ---------------------------------------------------------------
    let _tracing_guard = init_tracing(&settings.logging);
    info!("starting mirrorgate reverse MITM proxy engine");
    info!(config_path = %config_path, "configuration loaded");

    // ---------------------------------------------------------------
    // 3. Stores (C1-C3)
    // ---------------------------------------------------------------
    let fingerprints = Arc::new(FingerprintStore::new());
    let rate_limits = Arc::new(RateLimitStore::new());
    let sessions = Arc::new(SessionStore::new());
    let connections = Arc::new(crate::proxy::connection::ConnectionTracker::new());
    let metrics = Arc::new(EngineMetrics::new());

    // ---------------------------------------------------------------
    // 4. GeoIP (§6, §9)
    // ---------------------------------------------------------------
    let geoip: Arc<dyn GeoIp> = Arc::new(MaxMindGeoIp::new(&settings.geoip.city_db));

    // ---------------------------------------------------------------
    // 5. Catalog collaborators (§6) -- the admin API and persistent
    //    catalog stay external; this fixture-backed stand-in is what
    //    lets the engine run standalone (§1, §9).
    // ---------------------------------------------------------------
    let catalog = Arc::new(
        StaticCatalog::load(settings.catalog_fixture.as_deref())
            .expect("failed to load catalog fixture"),
    );
    let domains: Arc<dyn DomainCatalog> = catalog.clone();
    let campaigns: Arc<dyn CampaignCatalog> = catalog.clone();
    let identifiers = Arc::new(catalog.identifier_service());
    let renderer: Arc<dyn TemplateRenderer> = Arc::new(SimpleTemplateRenderer);
    let obfuscator: Arc<dyn Obfuscator> = Arc::new(NoopObfuscator);

    let event_log_path = Path::new(&settings.logging.dir).join("events.jsonl");
    let event_sink = Arc::new(
        JsonlEventSink::open(event_log_path.to_str().unwrap_or("events.jsonl"))
            .expect("failed to open event log"),
    );
    let webhooks = Arc::new(ReqwestWebhookDispatcher::new());
    let events = Arc::new(EventEmitter::new(campaigns.clone(), event_sink, Some(webhooks)));

    info!("catalog and event collaborators wired");

    // ---------------------------------------------------------------
    // 6. Proxy policy compilation (C4)
    // ---------------------------------------------------------------
    let proxies = compile_proxies(&settings);
    if proxies.is_empty() {
        warn!("no proxy entries compiled; every inbound host will 404 until proxies are configured");
    }

    // ---------------------------------------------------------------
    // 7. HTTP entry point (C12) -- wires C4 through C11
    // ---------------------------------------------------------------
    let entry = Arc::new(HttpEntry::new(
        domains,
        campaigns,
        identifiers,
        renderer,
        Some(obfuscator),
        sessions.clone(),
        fingerprints.clone(),
        rate_limits.clone(),
        geoip,
        events,
        metrics.clone(),
        proxies,
        settings.session_cookie_name.clone(),
        Duration::from_secs(settings.allow_list_ttl_secs),
    ));

    // ---------------------------------------------------------------
    // 8. TLS + access log + server (C1, C12)
    // ---------------------------------------------------------------
    let tls_config = build_tls_config(&settings.cert_dir).expect("failed to build TLS server config");

    let access_log_path = Path::new(&settings.logging.dir).join(&settings.logging.access_log_file);
    let access_log = match AccessLogger::new(access_log_path.to_str().unwrap_or("access.log")) {
        Ok(logger) => Some(Arc::new(logger)),
        Err(e) => {
            warn!(error = %e, "failed to open access log; proceeding without it");
            None
        }
    };

    let proxy_server = ProxyServer::new(
        settings.clone(),
        Arc::new(tls_config),
        entry,
        connections.clone(),
        fingerprints.clone(),
        access_log,
    );

    info!("proxy server configured");

    // ---------------------------------------------------------------
    // 9. Spawn background tasks
    // ---------------------------------------------------------------
    let cleanup_handle = tokio::spawn(cleanup_loop(
        fingerprints,
        sessions,
        rate_limits,
        metrics.clone(),
        Duration::from_secs(settings.fingerprint_idle_secs),
        Duration::from_secs(settings.fingerprint_reap_interval_secs),
        Duration::from_secs(settings.session_max_age_secs),
        Duration::from_secs(settings.session_reap_interval_secs),
        Duration::from_secs(settings.rate_limiter_cleanup_interval_secs),
    ));

    let metrics_handle = tokio::spawn(metrics_loop(metrics));

    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy_server.run().await {
            error!("proxy server error: {}", e);
        }
    });

    info!("mirrorgate is running, press Ctrl+C to shut down");

    // ---------------------------------------------------------------
    // 10. Wait for shutdown signal
    // ---------------------------------------------------------------
    tokio::signal::ctrl_c().await?;
    info!("shutting down mirrorgate...");

    proxy_handle.abort();
    cleanup_handle.abort();
    metrics_handle.abort();

    info!("mirrorgate shut down gracefully");
    Ok(())
}
