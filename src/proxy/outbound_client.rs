//! Outbound Client Factory (C5).
//!
//! Builds the HTTP client the request pipeline uses to call upstream,
//! shaping its TLS ClientHello / HTTP2 SETTINGS / header order to match the
//! victim's detected browser (`reqwest_impersonate`, grounded in spec.md
//! §4.5 and §9's `new-impersonating-client(...)` abstraction boundary).

use std::time::Duration;

use reqwest_impersonate::{Client, Proxy};
use tracing::warn;

use super::browser_detect::{detect_browser, detect_platform, Browser};
use crate::config::proxy_config::ImpersonateConfig;
use crate::error::{ProxyError, ProxyResult};

const OUTBOUND_TIMEOUT_SECS: u64 = 30;

/// Builds the outbound client for one request. Victim UA is used both to
/// pick the impersonation profile and, when `retain_ua` is set, as the
/// literal outbound `User-Agent` override.
pub fn build_client(
    impersonate: &ImpersonateConfig,
    victim_user_agent: Option<&str>,
    accept_language: Option<&str>,
    proxy_url: Option<&str>,
) -> ProxyResult<Client> {
    let mut builder = Client::builder()
        .timeout(Duration::from_secs(OUTBOUND_TIMEOUT_SECS))
        .redirect(reqwest_impersonate::redirect::Policy::none())
        .cookie_store(false)
        .danger_accept_invalid_certs(true);

    if impersonate.enabled {
        let ua = victim_user_agent.unwrap_or("");
        let browser = detect_browser(ua);
        let platform = detect_platform(ua);
        builder = builder.impersonate(impersonation_profile(browser, platform));

        if impersonate.retain_ua && !ua.is_empty() {
            builder = builder.user_agent(ua);
        }
    }

    if let Some(lang) = accept_language {
        let mut headers = reqwest_impersonate::header::HeaderMap::new();
        if let Ok(value) = reqwest_impersonate::header::HeaderValue::from_str(lang) {
            headers.insert(reqwest_impersonate::header::ACCEPT_LANGUAGE, value);
        }
        builder = builder.default_headers(headers);
    }

    if let Some(raw) = proxy_url {
        match parse_outbound_proxy(raw) {
            Ok(proxy) => builder = builder.proxy(proxy),
            Err(e) => warn!(proxy = raw, error = %e, "failed to parse outbound proxy, ignoring"),
        }
    }

    builder
        .build()
        .map_err(|e| ProxyError::Internal(format!("failed to build outbound client: {e}")))
}

/// Maps detected browser+platform onto the impersonation crate's profile
/// enum. Safari and Edge both fold onto a chrome-family profile per §4.5
/// (`safari -> chrome`, `edge -> chrome`); only the platform varies the
/// selected variant where the crate exposes platform-specific profiles.
fn impersonation_profile(browser: Browser, _platform: super::browser_detect::Platform) -> reqwest_impersonate::impersonate::Impersonate {
    use reqwest_impersonate::impersonate::Impersonate;
    match browser {
        Browser::Firefox => Impersonate::Firefox117,
        Browser::Edge | Browser::Chrome => Impersonate::Chrome120,
    }
}

/// Parses `proxy-config.proxy` (§4.5, §6): a bare `host:port` is prefixed
/// `http://`; `http`/`https`/`socks4`/`socks5` schemes and embedded
/// `user:password@` credentials are honored as-is.
fn parse_outbound_proxy(raw: &str) -> ProxyResult<Proxy> {
    let normalized = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("http://{raw}")
    };

    let url = url::Url::parse(&normalized)
        .map_err(|e| ProxyError::Validation(format!("bad outbound proxy url '{raw}': {e}")))?;

    let proxy = match url.scheme() {
        "socks5" | "socks4" => Proxy::all(url.as_str()),
        _ => Proxy::all(url.as_str()),
    }
    .map_err(|e| ProxyError::Validation(format!("bad outbound proxy url '{raw}': {e}")))?;

    Ok(proxy)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_host_port_defaults_to_http_scheme() {
        let proxy = parse_outbound_proxy("1.2.3.4:1080");
        assert!(proxy.is_ok());
    }

    #[test]
    fn socks5_with_credentials_parses() {
        let proxy = parse_outbound_proxy("socks5://user:pw@1.2.3.4:1080");
        assert!(proxy.is_ok());
    }
}
