//! Session Store (C3): three indexes over live `ProxySession`s, plus the
//! rewritten-path → original-path mapping used by URL-rewrite reversal
//! (§4.3, §4.6 step 1).

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use uuid::Uuid;

use crate::models::session::ProxySession;

pub struct SessionStore {
    by_id: DashMap<Uuid, Arc<ProxySession>>,
    by_recipient: DashMap<Uuid, Uuid>,
    /// path-only (no query) — the mapping must survive query-parameter
    /// churn (§4.3).
    url_mapping: DashMap<String, String>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            by_id: DashMap::new(),
            by_recipient: DashMap::new(),
            url_mapping: DashMap::new(),
        }
    }

    /// Stores `session`, first deleting any prior session for the same
    /// recipient (§3 lifecycle: "any prior session for that recipient is
    /// deleted first").
    pub fn store_session(&self, session: Arc<ProxySession>) {
        if let Some(prior_id) = self.by_recipient.get(&session.campaign_recipient_id) {
            self.by_id.remove(&*prior_id);
        }
        self.by_recipient
            .insert(session.campaign_recipient_id, session.id);
        self.by_id.insert(session.id, session);
    }

    pub fn get_session(&self, session_id: Uuid) -> Option<Arc<ProxySession>> {
        self.by_id.get(&session_id).map(|e| e.value().clone())
    }

    pub fn get_session_by_recipient(&self, campaign_recipient_id: Uuid) -> Option<Arc<ProxySession>> {
        let session_id = *self.by_recipient.get(&campaign_recipient_id)?;
        self.get_session(session_id)
    }

    /// Atomic on both indexes.
    pub fn delete_session(&self, session_id: Uuid) {
        if let Some((_, session)) = self.by_id.remove(&session_id) {
            self.by_recipient.remove(&session.campaign_recipient_id);
        }
    }

    pub fn store_url_mapping(&self, rewritten_path: String, original_path: String) {
        self.url_mapping.insert(rewritten_path, original_path);
    }

    pub fn get_url_mapping(&self, rewritten_path: &str) -> Option<String> {
        self.url_mapping.get(rewritten_path).map(|e| e.value().clone())
    }

    /// Evicts sessions whose `created_at + max_age` is in the past. On
    /// eviction the recipient index is cleared too.
    pub fn cleanup_expired(&self, max_age: Duration) -> usize {
        let stale: Vec<Uuid> = self
            .by_id
            .iter()
            .filter(|e| e.value().age() > max_age)
            .map(|e| *e.key())
            .collect();

        let count = stale.len();
        for session_id in stale {
            self.delete_session(session_id);
        }
        count
    }

    pub fn session_count(&self) -> usize {
        self.by_id.len()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::proxy_config::ProxyConfig;

    fn sample_config() -> ProxyConfig {
        ProxyConfig::compile("version: \"0.0\"\nhosts: {}\n").unwrap()
    }

    fn new_session(campaign_recipient_id: Uuid) -> Arc<ProxySession> {
        let cfg = sample_config();
        Arc::new(ProxySession::new(
            Uuid::new_v4(),
            campaign_recipient_id,
            Uuid::new_v4(),
            "phish.test".to_string(),
            "upstream.example.com".to_string(),
            None,
            &cfg,
        ))
    }

    #[test]
    fn storing_a_new_session_replaces_the_prior_one_for_recipient() {
        let store = SessionStore::new();
        let recipient = Uuid::new_v4();

        let first = new_session(recipient);
        let first_id = first.id;
        store.store_session(first);
        assert!(store.get_session(first_id).is_some());

        let second = new_session(recipient);
        let second_id = second.id;
        store.store_session(second);

        assert!(store.get_session(first_id).is_none(), "prior session evicted");
        assert!(store.get_session(second_id).is_some());
        assert_eq!(
            store.get_session_by_recipient(recipient).unwrap().id,
            second_id
        );
    }

    #[test]
    fn url_mapping_round_trips() {
        let store = SessionStore::new();
        store.store_url_mapping("/auth/signin".to_string(), "/shortlogin".to_string());
        assert_eq!(
            store.get_url_mapping("/auth/signin"),
            Some("/shortlogin".to_string())
        );
        assert_eq!(store.get_url_mapping("/unknown"), None);
    }
}
