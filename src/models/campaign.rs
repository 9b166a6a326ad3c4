use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One allow/deny-list entry evaluated by the access & filter gate (§4.6).
/// Whichever `kind` the *first* entry in `Campaign.allow_deny_list` carries
/// fixes the polarity for the whole list — entries are expected to be
/// uniform, but the engine only ever consults the first one to decide.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessListEntry {
    pub kind: ListPolarity,
    pub cidr: Option<String>,
    pub ja4: Option<String>,
    pub country: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListPolarity {
    Allow,
    Deny,
}

/// A phishing campaign: the policy object that owns the victim-facing
/// pages, the allow/deny list, and the anonymity/obfuscation flags that
/// gate what the event emitter and response pipeline do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub name: String,
    pub active: bool,
    pub anonymous: bool,
    pub save_submitted_data: bool,
    pub obfuscate: bool,
    pub deny_page: Option<PageRef>,
    pub allow_deny_list: Vec<AccessListEntry>,
    pub webhook_id: Option<String>,
}

impl Campaign {
    /// The list's polarity is fixed by its first entry (§4.6 step 4).
    pub fn list_polarity(&self) -> Option<ListPolarity> {
        self.allow_deny_list.first().map(|e| e.kind)
    }
}

/// A rendered-page reference: which domain it should be served from (so the
/// engine knows whether to redirect there first) and the template's HTML
/// body, opaque to the core beyond being handed to the `TemplateRenderer`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageRef {
    pub domain: String,
    pub html: String,
}

/// The campaign-recipient join row: one lure instance. `notable_event_id`
/// points at the highest-priority event observed for this recipient so far
/// (§4.11 notable-event promotion).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignRecipient {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub recipient_id: Uuid,
    pub notable_event_id: Option<i32>,
}

/// A campaign's template: the URL/state query-parameter names and the
/// optional evasion/before/after pages surrounding the live MITM landing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub url_identifier: String,
    pub state_identifier: String,
    pub evasion_page: Option<PageRef>,
    pub before_landing_page: Option<PageRef>,
    pub landing_page: PageRef,
    pub after_landing_page: Option<PageRef>,
    pub after_landing_redirect_url: Option<String>,
}

/// The lure target: whoever a campaign-recipient row points at. Owned by
/// the external catalog; the core only reads the fields the template
/// renderer needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    pub id: Uuid,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}
