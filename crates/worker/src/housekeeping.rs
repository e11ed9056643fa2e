//! Raw event retention
//!
//! Old `PROCESSED` events lose their payload, never their row: the
//! `provider_event_id` keeps deduplicating provider redeliveries forever.
//! `PENDING` and `FAILED` rows are left whole until the sweep or an operator
//! resolves them.

use time::{Duration, OffsetDateTime};
use tracing::info;

use billsync_billing::audit::entity;
use billsync_billing::store::EventStore;
use billsync_billing::{Actor, AuditAction, AuditLogger, BillingResult, NewAuditEntry};

/// Compact `PROCESSED` raw events received more than `retention_days` ago
pub async fn compact_processed_events(
    events: &dyn EventStore,
    audit: &AuditLogger,
    retention_days: i64,
) -> BillingResult<u64> {
    let cutoff = OffsetDateTime::now_utc() - Duration::days(retention_days.max(1));
    let compacted = events.compact_processed_events(cutoff).await?;

    if compacted > 0 {
        info!(
            compacted = compacted,
            retention_days = retention_days,
            "Compacted processed raw events"
        );
        audit
            .log_action(
                NewAuditEntry::new(AuditAction::EventsCompacted, entity::RAW_EVENT, "retention")
                    .actor(Actor::Scheduler)
                    .metadata(serde_json::json!({
                        "compacted": compacted,
                        "retentionDays": retention_days,
                        "cutoff": cutoff.unix_timestamp(),
                    })),
            )
            .await;
    }

    Ok(compacted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use billsync_billing::payload::is_compacted;
    use billsync_billing::{
        Dispatcher, EventProcessor, IngestOutcome, MemoryStore, ProcessTrigger, ProcessorConfig,
        SignatureVerifier, Stores, WebhookDelivery, WebhookIngestor,
    };
    use billsync_shared::{
        IdentitySource, NewRawEvent, ProcessingStatus, ProductKind, ProductMapping,
    };

    fn event(id: &str, age_days: i64, status: ProcessingStatus) -> billsync_shared::RawEvent {
        let mut event = NewRawEvent {
            provider_event_id: id.to_string(),
            event_type: "order_approved".into(),
            payload: serde_json::json!({"order_id": id}),
            headers: serde_json::json!({}),
            signature: None,
            identity_source: IdentitySource::TransactionId,
            transaction_ref: Some(id.to_string()),
            received_at: OffsetDateTime::now_utc() - Duration::days(age_days),
        }
        .into_pending();
        event.processing_status = status;
        event
    }

    #[tokio::test]
    async fn test_compacts_only_old_processed_events() {
        let store = Arc::new(MemoryStore::new());
        store.insert_event(event("old-processed", 400, ProcessingStatus::Processed));
        store.insert_event(event("old-failed", 400, ProcessingStatus::Failed));
        store.insert_event(event("recent", 1, ProcessingStatus::Processed));
        let audit = AuditLogger::new(store.clone());

        let compacted = compact_processed_events(store.as_ref(), &audit, 365)
            .await
            .unwrap();

        assert_eq!(compacted, 1);
        assert_eq!(store.events().len(), 3);
        let mut stripped: Vec<String> = store
            .events()
            .into_iter()
            .filter(|e| is_compacted(&e.payload))
            .map(|e| e.provider_event_id)
            .collect();
        stripped.sort();
        assert_eq!(stripped, vec!["old-processed".to_string()]);
        assert_eq!(store.audit_actions("EVENTS_COMPACTED").len(), 1);
    }

    #[tokio::test]
    async fn test_nothing_to_compact_writes_no_audit() {
        let store = Arc::new(MemoryStore::new());
        let audit = AuditLogger::new(store.clone());

        let compacted = compact_processed_events(store.as_ref(), &audit, 365)
            .await
            .unwrap();

        assert_eq!(compacted, 0);
        assert!(store.audit_entries().is_empty());
    }

    #[tokio::test]
    async fn test_redelivery_after_retention_is_still_deduplicated() {
        let store = Arc::new(MemoryStore::new());
        store.insert_user("buyer@example.com");
        store.insert_mapping(ProductMapping {
            provider_product_id: "P1".into(),
            kind: ProductKind::Subscription,
            plan_id: Some("plan-basic".into()),
            bot_type: None,
            quantity: 1,
            duration_days: None,
        });
        let processor =
            EventProcessor::new(Stores::memory(store.clone()), ProcessorConfig::default());
        let (dispatcher, _worker) = Dispatcher::new(processor.clone(), 4);
        let ingestor = WebhookIngestor::new(
            SignatureVerifier::new(None, 300),
            store.clone(),
            processor.audit_logger().clone(),
            dispatcher,
        );
        let body = serde_json::json!({
            "order_id": "tx1",
            "webhook_event_type": "order_approved",
            "Product": {"product_id": "P1"},
            "Customer": {"email": "buyer@example.com"}
        })
        .to_string();
        let delivery = || WebhookDelivery {
            body: &body,
            signature_header: None,
            timestamp_header: None,
        };

        ingestor.ingest(delivery()).await.unwrap();
        processor.process_event("tx1", ProcessTrigger::Webhook).await;
        let subscription_before = store.subscriptions();

        let mut aged = store.events().pop().unwrap();
        aged.received_at -= Duration::days(400);
        store.insert_event(aged);
        let compacted = compact_processed_events(store.as_ref(), processor.audit_logger(), 365)
            .await
            .unwrap();
        assert_eq!(compacted, 1);

        let outcome = ingestor.ingest(delivery()).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::AlreadyProcessed { .. }));
        assert_eq!(store.events().len(), 1);
        assert_eq!(store.subscriptions(), subscription_before);
        assert_eq!(store.audit_actions("SUBSCRIPTION_CREATED").len(), 1);
        assert!(store.audit_actions("SUBSCRIPTION_ACTIVATED").is_empty());
    }
}
