use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A phishing hostname served by this engine. Owned by the external
/// catalog; the core only reads it through [`crate::storage::catalog::DomainCatalog`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Domain {
    pub id: Uuid,
    pub name: String,
    pub kind: DomainKind,
    pub target_domain: String,
    pub proxy_config_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainKind {
    Proxy,
    Hosted,
}
