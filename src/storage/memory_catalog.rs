//! Minimal stand-ins for the external collaborators defined in
//! [`crate::storage::catalog`] (§6, §9). Persistence, an admin CRUD
//! surface, real templating, and real webhook delivery all stay external
//! in a full deployment; this gives the engine something to run against
//! on its own, seeded from one YAML fixture the way [`crate::config::proxy_config`]
//! compiles one per host.

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use crate::error::{ProxyError, ProxyResult};
use crate::models::campaign::{Campaign, CampaignRecipient, Recipient, Template};
use crate::models::domain::Domain;
use crate::models::event::Event;

use super::catalog::{
    CampaignCatalog, DomainCatalog, EventSink, ExtractedIdentifier, IdentifierService,
    Obfuscator, RenderContext, TemplateRenderer, WebhookDispatcher,
};

#[derive(Debug, Deserialize)]
struct CampaignFixture {
    campaign: Campaign,
    domain_id: Uuid,
    template: Template,
    #[serde(default)]
    recipients: Vec<Recipient>,
    #[serde(default)]
    campaign_recipients: Vec<CampaignRecipient>,
}

#[derive(Debug, Deserialize)]
struct Fixture {
    #[serde(default)]
    domains: Vec<Domain>,
    #[serde(default)]
    campaigns: Vec<CampaignFixture>,
}

/// Shared backing store for every in-memory collaborator below. A
/// `campaign-recipient-id`'s string form doubles as the opaque token
/// carried in the `url-identifier` query parameter — there is no separate
/// catalog-assigned token in this stand-in.
struct CatalogData {
    domains_by_name: DashMap<String, Domain>,
    domains_by_id: DashMap<Uuid, Domain>,
    campaigns: DashMap<Uuid, Campaign>,
    templates: DashMap<Uuid, Template>,
    domain_campaign: DashMap<Uuid, Uuid>,
    recipients: DashMap<Uuid, Recipient>,
    campaign_recipients: DashMap<Uuid, CampaignRecipient>,
    notable_events: DashMap<Uuid, (i32, u32)>,
}

impl CatalogData {
    fn empty() -> Self {
        Self {
            domains_by_name: DashMap::new(),
            domains_by_id: DashMap::new(),
            campaigns: DashMap::new(),
            templates: DashMap::new(),
            domain_campaign: DashMap::new(),
            recipients: DashMap::new(),
            campaign_recipients: DashMap::new(),
            notable_events: DashMap::new(),
        }
    }

    fn load(path: &str) -> ProxyResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| ProxyError::Internal(format!("failed to read catalog fixture {path}: {e}")))?;
        let fixture: Fixture = serde_yaml::from_str(&content)?;

        let data = Self::empty();
        for domain in fixture.domains {
            data.domains_by_id.insert(domain.id, domain.clone());
            data.domains_by_name.insert(domain.name.clone(), domain);
        }
        for entry in fixture.campaigns {
            data.domain_campaign.insert(entry.domain_id, entry.campaign.id);
            data.templates.insert(entry.campaign.id, entry.template);
            for recipient in entry.recipients {
                data.recipients.insert(recipient.id, recipient);
            }
            for cr in entry.campaign_recipients {
                data.campaign_recipients.insert(cr.id, cr);
            }
            data.campaigns.insert(entry.campaign.id, entry.campaign);
        }
        Ok(data)
    }
}

/// [`DomainCatalog`] + [`CampaignCatalog`] backed by one YAML fixture
/// loaded at startup. `catalog_fixture: None` in `EngineSettings` yields
/// an empty catalog (every request 404s) rather than failing startup.
pub struct StaticCatalog {
    data: Arc<CatalogData>,
}

impl StaticCatalog {
    pub fn load(path: Option<&str>) -> ProxyResult<Self> {
        let data = match path {
            Some(path) => CatalogData::load(path)?,
            None => CatalogData::empty(),
        };
        Ok(Self { data: Arc::new(data) })
    }

    /// An [`IdentifierService`] sharing this catalog's backing maps.
    pub fn identifier_service(&self) -> StaticIdentifierService {
        StaticIdentifierService { data: self.data.clone() }
    }
}

#[async_trait]
impl DomainCatalog for StaticCatalog {
    async fn resolve(&self, host: &str) -> Option<Domain> {
        self.data.domains_by_name.get(host).map(|d| d.clone())
    }
}

#[async_trait]
impl CampaignCatalog for StaticCatalog {
    async fn load_campaign(&self, campaign_id: Uuid) -> Option<Campaign> {
        self.data.campaigns.get(&campaign_id).map(|c| c.clone())
    }

    async fn load_template(&self, campaign_id: Uuid) -> Option<Template> {
        self.data.templates.get(&campaign_id).map(|t| t.clone())
    }

    async fn load_recipient(&self, recipient_id: Uuid) -> Option<Recipient> {
        self.data.recipients.get(&recipient_id).map(|r| r.clone())
    }

    async fn resolve_for_domain(&self, domain_id: Uuid) -> Option<(Campaign, Template)> {
        let campaign_id = *self.data.domain_campaign.get(&domain_id)?;
        let campaign = self.data.campaigns.get(&campaign_id)?.clone();
        let template = self.data.templates.get(&campaign_id)?.clone();
        Some((campaign, template))
    }

    async fn load_campaign_recipient(&self, campaign_recipient_id: Uuid) -> Option<CampaignRecipient> {
        self.data.campaign_recipients.get(&campaign_recipient_id).map(|cr| cr.clone())
    }

    async fn mark_notable_event(&self, campaign_recipient_id: Uuid, event_id: i32, priority: u32) {
        let mut entry = self.data.notable_events.entry(campaign_recipient_id).or_insert((event_id, 0));
        if priority >= entry.1 {
            *entry = (event_id, priority);
        }
        if let Some(mut cr) = self.data.campaign_recipients.get_mut(&campaign_recipient_id) {
            cr.notable_event_id = Some(entry.0);
        }
    }
}

/// The `url-identifier`/`state-identifier` convention (§9) resolved
/// against the same fixture [`StaticCatalog`] loaded: the query parameter
/// named by `template.url_identifier` carries a `campaign-recipient-id`
/// verbatim.
pub struct StaticIdentifierService {
    data: Arc<CatalogData>,
}

impl IdentifierService for StaticIdentifierService {
    fn extract(&self, query: &HashMap<String, String>, template: &Template) -> Option<ExtractedIdentifier> {
        let raw = query.get(&template.url_identifier)?;
        let campaign_recipient_id = Uuid::parse_str(raw).ok()?;
        let cr = self.data.campaign_recipients.get(&campaign_recipient_id)?;
        Some(ExtractedIdentifier {
            campaign_recipient_id: cr.id,
            campaign_id: cr.campaign_id,
            recipient_id: cr.recipient_id,
            param_name: template.url_identifier.clone(),
        })
    }
}

/// Naive `{{field}}` substitution. A full deployment's renderer handles
/// the template engine its page builder actually authors pages in; this
/// one exists so `campaign_flow`'s evasion/deny pages and the landing
/// page's `company-id`-style personalization have somewhere to resolve.
pub struct SimpleTemplateRenderer;

#[async_trait]
impl TemplateRenderer for SimpleTemplateRenderer {
    async fn render_phishing_page(&self, ctx: RenderContext<'_>) -> Vec<u8> {
        let mut html = ctx.html.to_string();
        let email = ctx.recipient.map(|r| r.email.as_str()).unwrap_or("");
        let first_name = ctx.recipient.and_then(|r| r.first_name.as_deref()).unwrap_or("");
        let last_name = ctx.recipient.and_then(|r| r.last_name.as_deref()).unwrap_or("");

        for (needle, value) in [
            ("{{email}}", email),
            ("{{first_name}}", first_name),
            ("{{last_name}}", last_name),
            ("{{state_param}}", ctx.state_param),
            ("{{original_url}}", ctx.original_url),
            ("{{campaign_recipient_id}}", &ctx.campaign_recipient_id.to_string()),
        ] {
            html = html.replace(needle, value);
        }
        html.into_bytes()
    }
}

/// Identity stand-in for the real obfuscation transform (§9): a full
/// deployment's `obfuscate` rewrites variable/function names and control
/// flow in served JS/HTML; this passes the body through untouched so the
/// response pipeline's "disable recompression on obfuscated output" branch
/// has something to call without requiring the real transform to compile
/// this crate standalone.
pub struct NoopObfuscator;

impl Obfuscator for NoopObfuscator {
    fn obfuscate(&self, html: &[u8], _campaign: &Campaign, _template: &Template) -> Vec<u8> {
        html.to_vec()
    }
}

/// Writes every event as one JSON line (same convention as
/// [`crate::proxy::access_log::AccessLogger`]), then forwards it to the
/// webhook dispatcher when the campaign has one configured.
pub struct JsonlEventSink {
    writer: std::sync::Mutex<std::fs::File>,
}

impl JsonlEventSink {
    pub fn open(path: &str) -> std::io::Result<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            let _ = fs::create_dir_all(parent);
        }
        let file = fs::OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { writer: std::sync::Mutex::new(file) })
    }
}

#[async_trait]
impl EventSink for JsonlEventSink {
    async fn emit(&self, event: Event) {
        let line = serde_json::to_string(&event).unwrap_or_default();
        use std::io::Write;
        if let Ok(mut f) = self.writer.lock() {
            let _ = writeln!(f, "{line}");
        }
    }
}

/// Fire-and-forget HTTP POST to `webhook_id`, treated directly as the
/// destination URL (§4.11). No retry: a dropped webhook delivery never
/// blocks the request path that triggered it.
pub struct ReqwestWebhookDispatcher {
    client: reqwest_impersonate::Client,
}

impl ReqwestWebhookDispatcher {
    pub fn new() -> Self {
        Self { client: reqwest_impersonate::Client::new() }
    }
}

impl Default for ReqwestWebhookDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WebhookDispatcher for ReqwestWebhookDispatcher {
    async fn dispatch(&self, webhook_id: &str, event: &Event) {
        let result = self.client.post(webhook_id).json(event).send().await;
        if let Err(e) = result {
            warn!(webhook = %webhook_id, error = %e, "webhook delivery failed");
        }
    }
}
