//! Event Emitter (C11, §4.11). Writes typed campaign events through the
//! external catalog interface, synthesizes the `message-read` event that
//! must precede a recipient's first landing/before/after visit, promotes
//! the campaign-recipient's notable-event pointer, and fires webhooks.

use std::sync::Arc;

use dashmap::DashSet;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::models::campaign::Campaign;
use crate::models::event::{Event, EventKind};
use crate::storage::catalog::{CampaignCatalog, EventSink, WebhookDispatcher};

pub struct EventEmitter {
    catalog: Arc<dyn CampaignCatalog>,
    sink: Arc<dyn EventSink>,
    webhooks: Option<Arc<dyn WebhookDispatcher>>,
    /// (campaign_id, recipient_id) pairs that have already produced a
    /// synthetic message-read event this process's lifetime. A real
    /// deployment would check catalog history instead; here the recipient
    /// always reaches the engine again via the same session lifecycle, so
    /// an in-memory set is sufficient for the core's scope.
    message_read_seen: DashSet<(Uuid, Uuid)>,
}

/// Everything about the request that a written event needs to carry,
/// besides the kind and campaign/recipient identity.
pub struct EventContext<'a> {
    pub client_ip: Option<&'a str>,
    pub user_agent: Option<&'a str>,
    pub metadata: Value,
}

impl EventEmitter {
    pub fn new(
        catalog: Arc<dyn CampaignCatalog>,
        sink: Arc<dyn EventSink>,
        webhooks: Option<Arc<dyn WebhookDispatcher>>,
    ) -> Self {
        Self {
            catalog,
            sink,
            webhooks,
            message_read_seen: DashSet::new(),
        }
    }

    /// Emits a page-visited-family event, first synthesizing a
    /// `message-read` event if this is the recipient's first landing/
    /// before/after visit for the campaign (§4.11).
    pub async fn emit_page_visited(
        &self,
        campaign: &Campaign,
        campaign_recipient_id: Uuid,
        recipient_id: Uuid,
        kind: EventKind,
        ctx: &EventContext<'_>,
    ) {
        if matches!(
            kind,
            EventKind::PageVisited | EventKind::BeforePageVisited | EventKind::AfterPageVisited
        ) {
            self.maybe_emit_message_read(campaign, campaign_recipient_id, recipient_id, ctx)
                .await;
        }

        let event = self.build_event(campaign, Some(recipient_id), kind, Value::Object(Default::default()), ctx);
        self.persist_and_dispatch(campaign, campaign_recipient_id, event).await;
    }

    /// Emits a `submitted-data` event (§4.9, §4.11). `data` is zeroed to an
    /// empty object when the campaign opts out of retaining submissions.
    pub async fn emit_submitted_data(
        &self,
        campaign: &Campaign,
        campaign_recipient_id: Uuid,
        recipient_id: Uuid,
        data: Value,
        ctx: &EventContext<'_>,
    ) {
        let payload = if campaign.save_submitted_data {
            data
        } else {
            Value::Object(Default::default())
        };
        let event = self.build_event(campaign, Some(recipient_id), EventKind::SubmittedData, payload, ctx);
        self.persist_and_dispatch(campaign, campaign_recipient_id, event).await;
    }

    async fn maybe_emit_message_read(
        &self,
        campaign: &Campaign,
        campaign_recipient_id: Uuid,
        recipient_id: Uuid,
        ctx: &EventContext<'_>,
    ) {
        if !self.message_read_seen.insert((campaign.id, recipient_id)) {
            return;
        }
        let event = self.build_event(
            campaign,
            Some(recipient_id),
            EventKind::MessageRead,
            Value::Object(Default::default()),
            ctx,
        );
        self.persist_and_dispatch(campaign, campaign_recipient_id, event).await;
    }

    fn build_event(&self, campaign: &Campaign, recipient_id: Option<Uuid>, kind: EventKind, data: Value, ctx: &EventContext<'_>) -> Event {
        let mut event = Event::new(campaign.id, recipient_id, kind);
        event.ip = ctx.client_ip.map(str::to_string);
        event.user_agent = ctx.user_agent.map(str::to_string);
        event.data = data;
        event.metadata = ctx.metadata.clone();

        if campaign.anonymous {
            event = event.anonymize();
        }
        event
    }

    async fn persist_and_dispatch(&self, campaign: &Campaign, campaign_recipient_id: Uuid, event: Event) {
        let priority = EventKind::from_id(event.event_id).map(|k| k.priority()).unwrap_or(0);
        self.catalog
            .mark_notable_event(campaign_recipient_id, event.event_id as i32, priority)
            .await;

        self.sink.emit(event.clone()).await;

        if let (Some(webhook_id), Some(dispatcher)) = (&campaign.webhook_id, &self.webhooks) {
            dispatcher.dispatch(webhook_id, &event).await;
        } else if campaign.webhook_id.is_some() {
            warn!(campaign_id = %campaign.id, "webhook configured but no dispatcher wired");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::campaign::Campaign;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct RecordingSink {
        events: StdMutex<Vec<Event>>,
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn emit(&self, event: Event) {
            self.events.lock().unwrap().push(event);
        }
    }

    struct NoopCatalog;

    #[async_trait]
    impl CampaignCatalog for NoopCatalog {
        async fn load_campaign(&self, _: Uuid) -> Option<Campaign> {
            None
        }
        async fn load_template(&self, _: Uuid) -> Option<crate::models::campaign::Template> {
            None
        }
        async fn load_recipient(&self, _: Uuid) -> Option<crate::models::campaign::Recipient> {
            None
        }
        async fn resolve_for_domain(&self, _: Uuid) -> Option<(Campaign, crate::models::campaign::Template)> {
            None
        }
        async fn load_campaign_recipient(&self, _: Uuid) -> Option<crate::models::campaign::CampaignRecipient> {
            None
        }
        async fn mark_notable_event(&self, _: Uuid, _: i32, _: u32) {}
    }

    fn campaign(anonymous: bool, save_submitted_data: bool) -> Campaign {
        Campaign {
            id: Uuid::new_v4(),
            name: "test".to_string(),
            active: true,
            anonymous,
            save_submitted_data,
            obfuscate: false,
            deny_page: None,
            allow_deny_list: vec![],
            webhook_id: None,
        }
    }

    #[tokio::test]
    async fn first_landing_visit_synthesizes_message_read_first() {
        let sink = Arc::new(RecordingSink { events: StdMutex::new(Vec::new()) });
        let emitter = EventEmitter::new(Arc::new(NoopCatalog), sink.clone(), None);
        let campaign = campaign(false, true);
        let recipient_id = Uuid::new_v4();
        let ctx = EventContext { client_ip: Some("1.2.3.4"), user_agent: Some("UA"), metadata: Value::Null };

        emitter
            .emit_page_visited(&campaign, Uuid::new_v4(), recipient_id, EventKind::PageVisited, &ctx)
            .await;

        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_id, EventKind::MessageRead.as_id());
        assert_eq!(events[1].event_id, EventKind::PageVisited.as_id());
    }

    #[tokio::test]
    async fn message_read_fires_only_once_per_recipient() {
        let sink = Arc::new(RecordingSink { events: StdMutex::new(Vec::new()) });
        let emitter = EventEmitter::new(Arc::new(NoopCatalog), sink.clone(), None);
        let campaign = campaign(false, true);
        let recipient_id = Uuid::new_v4();
        let ctx = EventContext { client_ip: None, user_agent: None, metadata: Value::Null };

        emitter
            .emit_page_visited(&campaign, Uuid::new_v4(), recipient_id, EventKind::PageVisited, &ctx)
            .await;
        emitter
            .emit_page_visited(&campaign, Uuid::new_v4(), recipient_id, EventKind::AfterPageVisited, &ctx)
            .await;

        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 3, "second visit must not re-synthesize message-read");
    }

    #[tokio::test]
    async fn anonymous_campaign_redacts_recipient_and_ip() {
        let sink = Arc::new(RecordingSink { events: StdMutex::new(Vec::new()) });
        let emitter = EventEmitter::new(Arc::new(NoopCatalog), sink.clone(), None);
        let campaign = campaign(true, true);
        let ctx = EventContext { client_ip: Some("9.9.9.9"), user_agent: Some("UA"), metadata: Value::Null };

        emitter
            .emit_page_visited(&campaign, Uuid::new_v4(), Uuid::new_v4(), EventKind::PageVisited, &ctx)
            .await;

        let events = sink.events.lock().unwrap();
        let page_visit = events.iter().find(|e| e.event_id == EventKind::PageVisited.as_id()).unwrap();
        assert!(page_visit.recipient_id.is_none());
        assert!(page_visit.ip.is_none());
    }

    #[tokio::test]
    async fn submitted_data_zeroed_when_campaign_opts_out() {
        let sink = Arc::new(RecordingSink { events: StdMutex::new(Vec::new()) });
        let emitter = EventEmitter::new(Arc::new(NoopCatalog), sink.clone(), None);
        let campaign = campaign(false, false);
        let ctx = EventContext { client_ip: None, user_agent: None, metadata: Value::Null };

        emitter
            .emit_submitted_data(
                &campaign,
                Uuid::new_v4(),
                Uuid::new_v4(),
                serde_json::json!({"password": "hunter2"}),
                &ctx,
            )
            .await;

        let events = sink.events.lock().unwrap();
        assert_eq!(events[0].data, serde_json::json!({}));
    }
}
