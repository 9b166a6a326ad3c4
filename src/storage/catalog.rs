//! External collaborator interfaces (§6, §9). Persistence, rendering,
//! identifier-parameter conventions, obfuscation, and event/webhook
//! delivery all live behind traits so the core compiles and is testable
//! standalone; the admin API and catalog CRUD that implement them in a
//! full deployment are explicitly out of scope here.

use std::collections::HashMap;

use async_trait::async_trait;
use uuid::Uuid;

use crate::models::campaign::{Campaign, Recipient, Template};
use crate::models::domain::Domain;
use crate::models::event::Event;

#[async_trait]
pub trait DomainCatalog: Send + Sync {
    async fn resolve(&self, host: &str) -> Option<Domain>;
}

#[async_trait]
pub trait CampaignCatalog: Send + Sync {
    async fn load_campaign(&self, campaign_id: Uuid) -> Option<Campaign>;
    async fn load_template(&self, campaign_id: Uuid) -> Option<Template>;
    async fn load_recipient(&self, recipient_id: Uuid) -> Option<Recipient>;

    /// Resolves the single campaign currently live on a phishing domain, and
    /// its template, in one call. A phishing domain serves at most one
    /// active campaign at a time (the catalog enforces this when a campaign
    /// is launched); this sidesteps the chicken-and-egg problem of needing
    /// a `Template` to know the `url-identifier` query-parameter name before
    /// a campaign-recipient id has even been read off the URL.
    async fn resolve_for_domain(&self, domain_id: Uuid) -> Option<(Campaign, Template)>;

    async fn load_campaign_recipient(&self, campaign_recipient_id: Uuid) -> Option<crate::models::campaign::CampaignRecipient>;

    /// Updates the campaign-recipient row's notable-event pointer if
    /// `priority` exceeds whatever is currently recorded (§4.11).
    async fn mark_notable_event(&self, campaign_recipient_id: Uuid, event_id: i32, priority: u32);
}

/// The campaign-recipient row and the URL query-parameter name its id was
/// carried under, resolved by [`IdentifierService::extract`].
#[derive(Debug, Clone)]
pub struct ExtractedIdentifier {
    pub campaign_recipient_id: Uuid,
    pub campaign_id: Uuid,
    pub recipient_id: Uuid,
    pub param_name: String,
}

/// Encapsulates the URL-parameter naming convention (§9): given an inbound
/// request's query parameters and the template's configured
/// `url-identifier` name, resolves the campaign-recipient it names.
pub trait IdentifierService: Send + Sync {
    fn extract(&self, query: &HashMap<String, String>, template: &Template) -> Option<ExtractedIdentifier>;
}

/// Context handed to the template renderer for evasion/deny/landing pages
/// (§9: `render-phishing-page(domain, email, campaign-recipient-id,
/// recipient, html, template, state-param, original-url, campaign,
/// company-id)`).
pub struct RenderContext<'a> {
    pub domain: &'a str,
    pub campaign_recipient_id: Uuid,
    pub recipient: Option<&'a Recipient>,
    pub html: &'a str,
    pub template: &'a Template,
    pub state_param: &'a str,
    pub original_url: &'a str,
    pub campaign: &'a Campaign,
}

#[async_trait]
pub trait TemplateRenderer: Send + Sync {
    async fn render_phishing_page(&self, ctx: RenderContext<'_>) -> Vec<u8>;
}

/// A pure transform (§9): treats its output as opaque, ready-to-serve
/// bytes, and the response pipeline disables recompression for it.
pub trait Obfuscator: Send + Sync {
    fn obfuscate(&self, html: &[u8], campaign: &Campaign, template: &Template) -> Vec<u8>;
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: Event);
}

/// Fire-and-forget delivery of an event payload to a campaign's configured
/// webhook (§4.11), consulted only when `Campaign.webhook_id` is set.
#[async_trait]
pub trait WebhookDispatcher: Send + Sync {
    async fn dispatch(&self, webhook_id: &str, event: &Event);
}
