use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fixed event-kind table (§4.11). Each variant carries a stable numeric id
/// and a fixed priority used for notable-event promotion; both are baked
/// into the `as_id`/`priority` methods rather than loaded from config,
/// mirroring the source's "fixed table" framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    PageVisited,
    BeforePageVisited,
    AfterPageVisited,
    EvasionPageVisited,
    DenyPageVisited,
    MessageRead,
    SubmittedData,
}

impl EventKind {
    /// Stable numeric id, stored alongside the event so external consumers
    /// (webhooks, the admin UI) don't need to round-trip the enum name.
    pub fn as_id(&self) -> u32 {
        match self {
            Self::PageVisited => 1,
            Self::BeforePageVisited => 2,
            Self::AfterPageVisited => 3,
            Self::EvasionPageVisited => 4,
            Self::DenyPageVisited => 5,
            Self::MessageRead => 6,
            Self::SubmittedData => 7,
        }
    }

    /// Inverse of [`EventKind::as_id`], used to recover priority from an
    /// already-built `Event`'s stored `event_id`.
    pub fn from_id(id: u32) -> Option<Self> {
        Some(match id {
            1 => Self::PageVisited,
            2 => Self::BeforePageVisited,
            3 => Self::AfterPageVisited,
            4 => Self::EvasionPageVisited,
            5 => Self::DenyPageVisited,
            6 => Self::MessageRead,
            7 => Self::SubmittedData,
            _ => return None,
        })
    }

    /// Priority used by notable-event promotion (§4.11): higher wins. A
    /// submitted credential always outranks a page visit, and any page
    /// visit outranks the synthetic message-read that precedes it.
    pub fn priority(&self) -> u32 {
        match self {
            Self::MessageRead => 10,
            Self::EvasionPageVisited => 15,
            Self::DenyPageVisited => 15,
            Self::BeforePageVisited => 20,
            Self::PageVisited => 25,
            Self::AfterPageVisited => 30,
            Self::SubmittedData => 100,
        }
    }
}

/// A typed campaign event, written only through the external catalog
/// interface (`EventSink`). When the campaign is anonymous, `recipient_id`
/// is `None` and `ip`/`user_agent`/`metadata` are zeroed before emission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub recipient_id: Option<Uuid>,
    pub event_id: u32,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub data: serde_json::Value,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn new(campaign_id: Uuid, recipient_id: Option<Uuid>, kind: EventKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            campaign_id,
            recipient_id,
            event_id: kind.as_id(),
            ip: None,
            user_agent: None,
            data: serde_json::Value::Object(Default::default()),
            metadata: serde_json::Value::Object(Default::default()),
            created_at: Utc::now(),
        }
    }

    /// Applies the anonymous-campaign redaction rule (§4.11): no recipient,
    /// no IP/UA/metadata.
    pub fn anonymize(mut self) -> Self {
        self.recipient_id = None;
        self.ip = None;
        self.user_agent = None;
        self.metadata = serde_json::Value::Object(Default::default());
        self
    }
}
