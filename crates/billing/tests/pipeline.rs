//! End-to-end tests for the billing pipeline
//!
//! Deliveries go through the ingestor and the dispatch worker exactly as the
//! API server wires them, against the in-memory store.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use billsync_billing::reconciliation::DEFAULT_WINDOW_DAYS;
use billsync_billing::signature::compute_signature;
use billsync_billing::{
    Actor, Dispatcher, EventProcessor, IngestOutcome, MemoryStore, ProcessorConfig,
    ReconciliationEngine, SignatureError, SignatureVerifier, Stores, WebhookDelivery,
    WebhookIngestor,
};
use billsync_shared::{
    Payment, PaymentStatus, ProcessingStatus, ProductKind, ProductMapping, SubscriptionStatus,
};

const SECRET: &str = "whsec_pipeline_secret";

struct Pipeline {
    store: Arc<MemoryStore>,
    processor: EventProcessor,
    user: Uuid,
}

impl Pipeline {
    fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let user = store.insert_user("buyer@example.com");
        store.insert_mapping(subscription_mapping("P1"));
        let processor = EventProcessor::new(Stores::memory(store.clone()), ProcessorConfig::default());
        Self {
            store,
            processor,
            user,
        }
    }

    /// Deliver each body, then wait for the dispatch worker to drain
    async fn deliver(&self, bodies: &[String]) -> Vec<Result<IngestOutcome, SignatureError>> {
        let (dispatcher, worker) = Dispatcher::new(self.processor.clone(), 16);
        let ingestor = WebhookIngestor::new(
            SignatureVerifier::new(Some(SECRET.to_string()), 300),
            self.processor.stores().events.clone(),
            self.processor.audit_logger().clone(),
            dispatcher,
        );
        let handle = tokio::spawn(worker.run());

        let mut outcomes = Vec::new();
        for body in bodies {
            let signature = compute_signature(SECRET, body.as_bytes());
            outcomes.push(
                ingestor
                    .ingest(WebhookDelivery {
                        body,
                        signature_header: Some(&signature),
                        timestamp_header: None,
                    })
                    .await,
            );
        }

        drop(ingestor);
        handle.await.unwrap();
        outcomes
    }
}

fn subscription_mapping(product_id: &str) -> ProductMapping {
    ProductMapping {
        provider_product_id: product_id.into(),
        kind: ProductKind::Subscription,
        plan_id: Some("plan-basic".into()),
        bot_type: None,
        quantity: 1,
        duration_days: None,
    }
}

fn purchase(order_id: &str, product_id: &str) -> String {
    json!({
        "order_id": order_id,
        "webhook_event_type": "order_approved",
        "Product": {"product_id": product_id},
        "Customer": {"email": "buyer@example.com"},
        "Commissions": {"charge_amount": "49.90", "currency": "BRL"}
    })
    .to_string()
}

#[tokio::test]
async fn test_purchase_activates_subscription_end_to_end() {
    let pipeline = Pipeline::new();
    let outcomes = pipeline.deliver(&[purchase("tx1", "P1")]).await;
    assert_eq!(outcomes[0].as_ref().unwrap().event_id(), "tx1");

    let subscriptions = pipeline.store.subscriptions();
    assert_eq!(subscriptions.len(), 1);
    assert_eq!(subscriptions[0].user_id, pipeline.user);
    assert_eq!(subscriptions[0].plan_id, "plan-basic");
    assert_eq!(subscriptions[0].status, SubscriptionStatus::Active);

    let payments = pipeline.store.payments();
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].transaction_id, "tx1");
    assert_eq!(payments[0].status, PaymentStatus::Paid);

    let event = pipeline.store.events().pop().unwrap();
    assert_eq!(event.processing_status, ProcessingStatus::Processed);
}

#[tokio::test]
async fn test_redelivery_after_processing_is_acknowledged_once() {
    let pipeline = Pipeline::new();
    pipeline.deliver(&[purchase("tx1", "P1")]).await;
    let audit_before = pipeline.store.audit_actions("PAYMENT_CREATED").len();

    let outcomes = pipeline.deliver(&[purchase("tx1", "P1")]).await;

    assert!(matches!(
        outcomes[0],
        Ok(IngestOutcome::AlreadyProcessed { .. })
    ));
    assert_eq!(pipeline.store.events().len(), 1);
    assert_eq!(pipeline.store.payments().len(), 1);
    assert_eq!(
        pipeline.store.audit_actions("PAYMENT_CREATED").len(),
        audit_before
    );
}

#[tokio::test]
async fn test_wrong_secret_is_rejected() {
    let pipeline = Pipeline::new();
    let (dispatcher, _worker) = Dispatcher::new(pipeline.processor.clone(), 4);
    let ingestor = WebhookIngestor::new(
        SignatureVerifier::new(Some(SECRET.to_string()), 300),
        pipeline.processor.stores().events.clone(),
        pipeline.processor.audit_logger().clone(),
        dispatcher,
    );
    let body = purchase("tx1", "P1");
    let signature = compute_signature("some-other-secret", body.as_bytes());

    let result = ingestor
        .ingest(WebhookDelivery {
            body: &body,
            signature_header: Some(&signature),
            timestamp_header: None,
        })
        .await;

    assert_eq!(result, Err(SignatureError::Mismatch));
    assert!(pipeline.store.events().is_empty());
}

#[tokio::test]
async fn test_reprocess_recovers_after_mapping_is_added() {
    let pipeline = Pipeline::new();
    pipeline.deliver(&[purchase("tx9", "P9")]).await;

    let failed = pipeline.store.events().pop().unwrap();
    assert_eq!(failed.processing_status, ProcessingStatus::Failed);
    assert!(pipeline.store.payments().is_empty());

    pipeline.store.insert_mapping(subscription_mapping("P9"));
    let engine = ReconciliationEngine::new(pipeline.processor.clone());
    let admin = Actor::Admin(Uuid::new_v4());

    let result = engine.reprocess_event("tx9", admin.clone()).await.unwrap();
    assert_eq!(result.previous_status, ProcessingStatus::Failed);
    assert_eq!(result.status, ProcessingStatus::Processed);

    // a second operator run must not duplicate the effect
    engine.reprocess_event("tx9", admin.clone()).await.unwrap();

    assert_eq!(pipeline.store.payments().len(), 1);
    assert_eq!(pipeline.store.subscriptions().len(), 1);
    assert_eq!(pipeline.store.audit_actions("PAYMENT_CREATED").len(), 1);
    assert_eq!(pipeline.store.audit_actions("EVENT_REPROCESSED").len(), 2);
}

#[tokio::test]
async fn test_discrepancies_and_rebuild() {
    let pipeline = Pipeline::new();
    let now = time::OffsetDateTime::now_utc();
    pipeline.store.insert_payment(Payment {
        id: Uuid::new_v4(),
        user_id: pipeline.user,
        transaction_id: "orphan".into(),
        amount_cents: 1000,
        currency: "BRL".into(),
        status: PaymentStatus::Paid,
        provider: "kiwify".into(),
        product_id: None,
        created_at: now,
        updated_at: now,
    });

    // processed, then its payment row is lost
    pipeline.deliver(&[purchase("tx2", "P1")]).await;
    let subscription_before = pipeline.store.subscriptions();
    pipeline.store.remove_payment("tx2");

    let engine = ReconciliationEngine::new(pipeline.processor.clone());
    let report = engine
        .detect_discrepancies(DEFAULT_WINDOW_DAYS)
        .await
        .unwrap();

    assert_eq!(report.payments_without_event.len(), 1);
    assert_eq!(report.payments_without_event[0].transaction_id, "orphan");
    assert_eq!(report.events_without_payment.len(), 1);
    assert_eq!(report.events_without_payment[0].provider_event_id, "tx2");
    assert!(report.events_without_payment[0].expects_payment);

    let rebuilt = engine
        .rebuild_payment_from_event("tx2", Actor::Admin(Uuid::new_v4()))
        .await
        .unwrap();
    assert_eq!(rebuilt.transaction_id, "tx2");
    assert_eq!(rebuilt.status, PaymentStatus::Paid);
    assert_eq!(pipeline.store.audit_actions("PAYMENT_REBUILT").len(), 1);
    assert_eq!(pipeline.store.subscriptions(), subscription_before);

    let report = engine
        .detect_discrepancies(DEFAULT_WINDOW_DAYS)
        .await
        .unwrap();
    assert!(report.events_without_payment.is_empty());
}
