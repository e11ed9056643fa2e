//! Reconciliation Engine
//!
//! Compares the raw event log with derived payments over a trailing window and
//! exposes the operator repairs. Detection is read-only; repairs write their
//! own audit trail (`EVENT_REPROCESSED`, `PAYMENT_REBUILT`) separate from
//! normal processing.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};
use uuid::Uuid;

use billsync_shared::{
    IdentitySource, Payment, PaymentStatus, ProcessingStatus, RawEvent, StatusCounts,
};

use crate::audit::{entity, Actor, AuditAction, AuditLogger, NewAuditEntry};
use crate::error::{BillingError, BillingResult};
use crate::payload::{is_compacted, EventKind, WebhookPayload};
use crate::processor::{payment_rank, resolve_user, EventProcessor, ProcessOutcome};
use crate::store::{CommitOutcome, Stores, UnitOfWork};

pub const DEFAULT_WINDOW_DAYS: i64 = 7;
pub const MAX_WINDOW_DAYS: i64 = 365;
pub const DEFAULT_FAILED_LIMIT: i64 = 50;
pub const MAX_FAILED_LIMIT: i64 = 500;

pub fn clamp_window_days(days: Option<i64>) -> i64 {
    days.unwrap_or(DEFAULT_WINDOW_DAYS).clamp(1, MAX_WINDOW_DAYS)
}

pub fn clamp_failed_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_FAILED_LIMIT).clamp(1, MAX_FAILED_LIMIT)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentWithoutEvent {
    pub payment_id: Uuid,
    pub transaction_id: String,
    pub user_id: Uuid,
    pub status: PaymentStatus,
    pub amount_cents: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventWithoutPayment {
    pub provider_event_id: String,
    pub transaction_ref: String,
    pub event_type: String,
    pub processing_status: ProcessingStatus,
    /// False for lifecycle events that correctly produce no payment
    pub expects_payment: bool,
    pub error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusMismatch {
    pub payment_id: Uuid,
    pub transaction_id: String,
    pub payment_status: PaymentStatus,
    pub expected_status: PaymentStatus,
    pub provider_event_id: String,
    pub event_type: String,
}

/// Event stored under a synthesized identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnidentifiedEvent {
    pub provider_event_id: String,
    pub event_type: String,
    pub processing_status: ProcessingStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscrepancySummary {
    pub payments_scanned: usize,
    pub events_scanned: usize,
    pub payments_without_event: usize,
    pub events_without_payment: usize,
    /// Subset of `events_without_payment` whose type implies a payment
    pub events_missing_expected_payment: usize,
    pub status_mismatches: usize,
    pub unidentified_events: usize,
}

impl DiscrepancySummary {
    pub fn total(&self) -> usize {
        self.payments_without_event
            + self.events_missing_expected_payment
            + self.status_mismatches
            + self.unidentified_events
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscrepancyReport {
    pub window_days: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub since: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    pub payments_without_event: Vec<PaymentWithoutEvent>,
    pub events_without_payment: Vec<EventWithoutPayment>,
    pub status_mismatches: Vec<StatusMismatch>,
    pub unidentified_events: Vec<UnidentifiedEvent>,
    pub summary: DiscrepancySummary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingStats {
    pub window_days: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub since: OffsetDateTime,
    pub pending: i64,
    pub processed: i64,
    pub failed: i64,
    pub total: i64,
}

impl ProcessingStats {
    fn new(window_days: i64, since: OffsetDateTime, counts: StatusCounts) -> Self {
        Self {
            window_days,
            since,
            pending: counts.pending,
            processed: counts.processed,
            failed: counts.failed,
            total: counts.total(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReprocessResult {
    pub event_id: String,
    pub previous_status: ProcessingStatus,
    pub status: ProcessingStatus,
    /// False when a concurrent run committed first
    pub applied: bool,
}

/// Pure classification over already-loaded rows
pub fn classify_discrepancies(
    window_days: i64,
    since: OffsetDateTime,
    payments: &[Payment],
    events: &[RawEvent],
) -> DiscrepancyReport {
    let mut unidentified_events = Vec::new();
    let mut events_by_key: HashMap<&str, Vec<&RawEvent>> = HashMap::new();
    for event in events {
        if event.identity_source == IdentitySource::Synthesized {
            unidentified_events.push(UnidentifiedEvent {
                provider_event_id: event.provider_event_id.clone(),
                event_type: event.event_type.clone(),
                processing_status: event.processing_status,
                received_at: event.received_at,
            });
        }
        // synthesized events still join: the processor keys their payment on the same id
        events_by_key.entry(event.join_key()).or_default().push(event);
    }

    let payment_keys: HashSet<&str> = payments.iter().map(|p| p.transaction_id.as_str()).collect();

    let mut payments_without_event = Vec::new();
    let mut status_mismatches = Vec::new();
    for payment in payments {
        let Some(related) = events_by_key.get(payment.transaction_id.as_str()) else {
            payments_without_event.push(PaymentWithoutEvent {
                payment_id: payment.id,
                transaction_id: payment.transaction_id.clone(),
                user_id: payment.user_id,
                status: payment.status,
                amount_cents: payment.amount_cents,
                created_at: payment.created_at,
            });
            continue;
        };

        if let Some((event, expected)) = expected_payment_status(related) {
            if expected != payment.status {
                status_mismatches.push(StatusMismatch {
                    payment_id: payment.id,
                    transaction_id: payment.transaction_id.clone(),
                    payment_status: payment.status,
                    expected_status: expected,
                    provider_event_id: event.provider_event_id.clone(),
                    event_type: event.event_type.clone(),
                });
            }
        }
    }

    let events_without_payment: Vec<EventWithoutPayment> = events
        .iter()
        .filter(|e| e.identity_source != IdentitySource::Synthesized)
        .filter(|e| !payment_keys.contains(e.join_key()))
        .map(|e| EventWithoutPayment {
            provider_event_id: e.provider_event_id.clone(),
            transaction_ref: e.join_key().to_string(),
            event_type: e.event_type.clone(),
            processing_status: e.processing_status,
            expects_payment: EventKind::classify(&e.event_type).expects_payment(),
            error: e.error.clone(),
            received_at: e.received_at,
        })
        .collect();

    let summary = DiscrepancySummary {
        payments_scanned: payments.len(),
        events_scanned: events.len(),
        payments_without_event: payments_without_event.len(),
        events_without_payment: events_without_payment.len(),
        events_missing_expected_payment: events_without_payment
            .iter()
            .filter(|e| e.expects_payment)
            .count(),
        status_mismatches: status_mismatches.len(),
        unidentified_events: unidentified_events.len(),
    };

    DiscrepancyReport {
        window_days,
        since,
        generated_at: OffsetDateTime::now_utc(),
        payments_without_event,
        events_without_payment,
        status_mismatches,
        unidentified_events,
        summary,
    }
}

/// Status the event history implies: the furthest-progressed status, the
/// most recent event among equals
fn expected_payment_status<'a>(events: &[&'a RawEvent]) -> Option<(&'a RawEvent, PaymentStatus)> {
    events
        .iter()
        .filter_map(|e| {
            EventKind::classify(&e.event_type)
                .implied_payment_status()
                .map(|status| (*e, status))
        })
        .max_by_key(|(e, status)| (payment_rank(*status), e.received_at))
}

#[derive(Clone)]
pub struct ReconciliationEngine {
    stores: Stores,
    processor: EventProcessor,
    audit: AuditLogger,
}

impl ReconciliationEngine {
    pub fn new(processor: EventProcessor) -> Self {
        Self {
            stores: processor.stores().clone(),
            audit: processor.audit_logger().clone(),
            processor,
        }
    }

    pub async fn detect_discrepancies(&self, days: i64) -> BillingResult<DiscrepancyReport> {
        let days = clamp_window_days(Some(days));
        let since = OffsetDateTime::now_utc() - Duration::days(days);

        let payments = self.stores.ledger.payments_since(since).await?;
        let events = self.stores.events.events_since(since).await?;
        Ok(classify_discrepancies(days, since, &payments, &events))
    }

    /// Force the processor over an event, even a `PROCESSED` one
    pub async fn reprocess_event(
        &self,
        event_id: &str,
        actor: Actor,
    ) -> BillingResult<ReprocessResult> {
        let before = self
            .stores
            .events
            .get_event(event_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("raw event {}", event_id)))?;

        let outcome = self.processor.reprocess(event_id, actor.clone()).await?;
        let status = self
            .stores
            .events
            .get_event(event_id)
            .await?
            .map_or(before.processing_status, |e| e.processing_status);
        let applied = outcome == ProcessOutcome::Processed;

        self.audit
            .log_action(
                NewAuditEntry::new(AuditAction::EventReprocessed, entity::RAW_EVENT, event_id)
                    .actor(actor)
                    .metadata(serde_json::json!({
                        "previousStatus": before.processing_status.as_str(),
                        "status": status.as_str(),
                        "applied": applied,
                    })),
            )
            .await;

        info!(
            event_id = %event_id,
            previous_status = %before.processing_status,
            status = %status,
            "Raw event reprocessed"
        );

        Ok(ReprocessResult {
            event_id: event_id.to_string(),
            previous_status: before.processing_status,
            status,
            applied,
        })
    }

    /// Create the missing payment for an event without running entitlement
    /// logic. The event's processing status is left untouched.
    pub async fn rebuild_payment_from_event(
        &self,
        event_id: &str,
        actor: Actor,
    ) -> BillingResult<Payment> {
        let event = self
            .stores
            .events
            .get_event(event_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("raw event {}", event_id)))?;

        let status = EventKind::classify(&event.event_type)
            .implied_payment_status()
            .ok_or_else(|| {
                BillingError::InvalidInput(format!(
                    "event type '{}' implies no payment",
                    event.event_type
                ))
            })?;

        let transaction_id = event.join_key();
        if self
            .stores
            .ledger
            .payment_by_transaction(transaction_id)
            .await?
            .is_some()
        {
            return Err(BillingError::AlreadyExists(format!(
                "payment for transaction {}",
                transaction_id
            )));
        }

        if is_compacted(&event.payload) {
            return Err(BillingError::InvalidInput(
                "raw payload was compacted by retention".to_string(),
            ));
        }
        let payload = WebhookPayload::from_stored(&event.payload);
        if payload.is_malformed() {
            return Err(BillingError::InvalidInput(
                "stored payload is not a JSON object".to_string(),
            ));
        }
        let details = payload.details();
        let user_id = resolve_user(self.stores.users.as_ref(), &details.customer)
            .await
            .map_err(|e| match e {
                BillingError::UserCorrelation(msg) => BillingError::InvalidInput(msg),
                other => other,
            })?;

        let now = OffsetDateTime::now_utc();
        let payment = Payment {
            id: Uuid::new_v4(),
            user_id,
            transaction_id: transaction_id.to_string(),
            amount_cents: details.amount_cents.unwrap_or(0),
            currency: details.currency,
            status,
            provider: self.processor.provider().to_string(),
            product_id: details.product_id,
            created_at: now,
            updated_at: now,
        };

        let mut work = UnitOfWork::new(event_id);
        work.mark_processed = false;
        work.force = true;
        work.audit.push(
            NewAuditEntry::new(
                AuditAction::PaymentRebuilt,
                entity::PAYMENT,
                payment.id.to_string(),
            )
            .actor(actor)
            .after(&payment)
            .metadata(serde_json::json!({
                "eventId": event.provider_event_id,
                "eventType": event.event_type,
            }))
            .into_record(now),
        );
        work.payment = Some(payment.clone());

        match self.stores.ledger.commit(work).await? {
            CommitOutcome::Applied => {
                info!(
                    event_id = %event_id,
                    transaction_id = %payment.transaction_id,
                    "Payment rebuilt from raw event"
                );
                Ok(payment)
            }
            CommitOutcome::EventMissing => {
                Err(BillingError::NotFound(format!("raw event {}", event_id)))
            }
            CommitOutcome::AlreadyProcessed => Err(BillingError::Internal(
                "forced commit reported already processed".to_string(),
            )),
            CommitOutcome::Stale => Err(BillingError::AlreadyExists(format!(
                "payment for transaction {}",
                payment.transaction_id
            ))),
        }
    }

    pub async fn processing_stats(&self, days: i64) -> BillingResult<ProcessingStats> {
        let days = clamp_window_days(Some(days));
        let since = OffsetDateTime::now_utc() - Duration::days(days);
        let counts = self.stores.events.event_status_counts(since).await?;
        Ok(ProcessingStats::new(days, since, counts))
    }

    pub async fn failed_events(&self, limit: i64) -> BillingResult<Vec<RawEvent>> {
        self.stores
            .events
            .failed_events(clamp_failed_limit(Some(limit)))
            .await
    }

    /// Daily run: detect, log and audit a summary
    pub async fn run_scheduled(&self, window_days: i64) -> BillingResult<DiscrepancyReport> {
        let report = self.detect_discrepancies(window_days).await?;
        let summary = report.summary;

        if summary.total() > 0 {
            warn!(
                window_days = report.window_days,
                payments_without_event = summary.payments_without_event,
                events_missing_expected_payment = summary.events_missing_expected_payment,
                status_mismatches = summary.status_mismatches,
                unidentified_events = summary.unidentified_events,
                "Reconciliation found discrepancies"
            );
        } else {
            info!(
                window_days = report.window_days,
                payments_scanned = summary.payments_scanned,
                events_scanned = summary.events_scanned,
                "Reconciliation clean"
            );
        }

        let run_id = report
            .generated_at
            .format(&Rfc3339)
            .unwrap_or_else(|_| report.generated_at.unix_timestamp().to_string());
        self.audit
            .log_action(
                NewAuditEntry::new(
                    AuditAction::ReconciliationCompleted,
                    entity::RECONCILIATION,
                    run_id,
                )
                .actor(Actor::Scheduler)
                .metadata(serde_json::to_value(summary).unwrap_or_default()),
            )
            .await;

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use billsync_shared::{NewRawEvent, ProductKind, ProductMapping, SubscriptionStatus};
    use serde_json::json;

    use crate::processor::{ProcessTrigger, ProcessorConfig};
    use crate::store::{EventStore, MemoryStore};

    fn raw(id: &str, event_type: &str, received_at: OffsetDateTime) -> RawEvent {
        NewRawEvent {
            provider_event_id: id.to_string(),
            event_type: event_type.to_string(),
            payload: json!({"order_id": id}),
            headers: json!({}),
            signature: None,
            identity_source: IdentitySource::TransactionId,
            transaction_ref: Some(id.to_string()),
            received_at,
        }
        .into_pending()
    }

    fn payment(tx: &str, status: PaymentStatus) -> Payment {
        let now = OffsetDateTime::now_utc();
        Payment {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            transaction_id: tx.to_string(),
            amount_cents: 1_000,
            currency: "BRL".into(),
            status,
            provider: "kiwify".into(),
            product_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn engine() -> (Arc<MemoryStore>, ReconciliationEngine) {
        let store = Arc::new(MemoryStore::new());
        let processor =
            EventProcessor::new(Stores::memory(store.clone()), ProcessorConfig::default());
        (store, ReconciliationEngine::new(processor))
    }

    #[test]
    fn test_window_and_limit_clamps() {
        assert_eq!(clamp_window_days(None), DEFAULT_WINDOW_DAYS);
        assert_eq!(clamp_window_days(Some(0)), 1);
        assert_eq!(clamp_window_days(Some(10_000)), MAX_WINDOW_DAYS);
        assert_eq!(clamp_failed_limit(Some(-3)), 1);
        assert_eq!(clamp_failed_limit(Some(9_999)), MAX_FAILED_LIMIT);
    }

    #[test]
    fn test_classifies_missing_sides() {
        let now = OffsetDateTime::now_utc();
        let payments = vec![payment("tx1", PaymentStatus::Paid)];
        let events = vec![raw("tx2", "order_approved", now)];

        let report = classify_discrepancies(7, now - Duration::days(7), &payments, &events);
        assert_eq!(report.payments_without_event.len(), 1);
        assert_eq!(report.payments_without_event[0].transaction_id, "tx1");
        assert_eq!(report.events_without_payment.len(), 1);
        assert_eq!(report.events_without_payment[0].provider_event_id, "tx2");
        assert!(report.events_without_payment[0].expects_payment);
    }

    #[test]
    fn test_lifecycle_event_does_not_expect_payment() {
        let now = OffsetDateTime::now_utc();
        let events = vec![raw("sub_cancel", "subscription_canceled", now)];
        let report = classify_discrepancies(7, now, &[], &events);
        assert!(!report.events_without_payment[0].expects_payment);
        assert_eq!(report.summary.events_missing_expected_payment, 0);
    }

    #[test]
    fn test_status_mismatch_uses_furthest_progressed_event() {
        let now = OffsetDateTime::now_utc();
        let mut refund = raw("evt_refund", "order_refunded", now);
        refund.transaction_ref = Some("tx1".into());
        let mut late_pending = raw("evt_pending", "waiting_payment", now + Duration::minutes(5));
        late_pending.transaction_ref = Some("tx1".into());
        let events = vec![raw("tx1", "order_approved", now), refund, late_pending];

        let paid = vec![payment("tx1", PaymentStatus::Paid)];
        let report = classify_discrepancies(7, now, &paid, &events);
        assert_eq!(report.status_mismatches.len(), 1);
        assert_eq!(report.status_mismatches[0].expected_status, PaymentStatus::Refunded);
        assert_eq!(report.status_mismatches[0].provider_event_id, "evt_refund");

        let refunded = vec![payment("tx1", PaymentStatus::Refunded)];
        let report = classify_discrepancies(7, now, &refunded, &events);
        assert!(report.status_mismatches.is_empty());
    }

    #[test]
    fn test_synthesized_events_go_to_unidentified_bucket() {
        let now = OffsetDateTime::now_utc();
        let mut event = raw("unidentified:abc", "order_approved", now);
        event.identity_source = IdentitySource::Synthesized;
        event.transaction_ref = None;

        let report = classify_discrepancies(7, now, &[], &[event]);
        assert_eq!(report.unidentified_events.len(), 1);
        assert!(report.events_without_payment.is_empty());
    }

    #[tokio::test]
    async fn test_processed_unidentified_purchase_is_not_an_orphan_payment() {
        let (store, engine) = engine();
        store.insert_user("buyer@example.com");
        store.insert_mapping(ProductMapping {
            provider_product_id: "P1".into(),
            kind: ProductKind::Subscription,
            plan_id: Some("plan-basic".into()),
            bot_type: None,
            quantity: 1,
            duration_days: None,
        });

        let body = r#"{"signature":"s","order":{"webhook_event_type":"order_approved","Product":{"product_id":"P1"},"Customer":{"email":"buyer@example.com"}}}"#;
        let payload = crate::payload::WebhookPayload::parse(body);
        let normalized = payload.normalize(body.as_bytes());
        assert_eq!(normalized.identity.source, IdentitySource::Synthesized);
        let event_id = normalized.identity.id.clone();
        store
            .insert_event_if_absent(NewRawEvent {
                provider_event_id: event_id.clone(),
                event_type: normalized.event_type,
                payload: payload.to_value(),
                headers: json!({}),
                signature: None,
                identity_source: normalized.identity.source,
                transaction_ref: normalized.transaction_ref,
                received_at: OffsetDateTime::now_utc(),
            })
            .await
            .unwrap();

        engine
            .processor
            .process_event(&event_id, ProcessTrigger::Webhook)
            .await;
        assert_eq!(store.payments().len(), 1);
        assert_eq!(store.payments()[0].transaction_id, event_id);

        let report = engine.detect_discrepancies(DEFAULT_WINDOW_DAYS).await.unwrap();
        assert_eq!(report.unidentified_events.len(), 1);
        assert!(report.payments_without_event.is_empty());
        assert!(report.events_without_payment.is_empty());
        assert!(report.status_mismatches.is_empty());
    }

    #[tokio::test]
    async fn test_detect_respects_window() {
        let (store, engine) = engine();
        let old = OffsetDateTime::now_utc() - Duration::days(30);
        store.insert_event(raw("tx_old", "order_approved", old));
        store.insert_event(raw("tx_new", "order_approved", OffsetDateTime::now_utc()));

        let report = engine.detect_discrepancies(7).await.unwrap();
        assert_eq!(report.summary.events_scanned, 1);
        assert_eq!(report.events_without_payment[0].provider_event_id, "tx_new");
    }

    #[tokio::test]
    async fn test_rebuild_payment_leaves_subscription_alone() {
        let (store, engine) = engine();
        let user = store.insert_user("buyer@example.com");
        let mut event = raw("tx1", "order_approved", OffsetDateTime::now_utc());
        event.payload = json!({
            "order": {
                "order_id": "tx1",
                "Customer": {"email": "buyer@example.com"},
                "amount_cents": 2_500
            }
        });
        store.insert_event(event);

        let admin = Uuid::new_v4();
        let payment = engine
            .rebuild_payment_from_event("tx1", Actor::Admin(admin))
            .await
            .unwrap();

        assert_eq!(payment.transaction_id, "tx1");
        assert_eq!(payment.user_id, user);
        assert_eq!(payment.amount_cents, 2_500);
        assert!(store.subscriptions().is_empty());

        let rebuilt = store.audit_actions("PAYMENT_REBUILT");
        assert_eq!(rebuilt.len(), 1);
        assert_eq!(rebuilt[0].actor, format!("admin:{}", admin));
        assert_eq!(
            store.get_event("tx1").await.unwrap().unwrap().processing_status,
            ProcessingStatus::Pending
        );

        let again = engine.rebuild_payment_from_event("tx1", Actor::Admin(admin)).await;
        assert!(matches!(again, Err(BillingError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_rebuild_rejects_event_without_payment_meaning() {
        let (store, engine) = engine();
        store.insert_event(raw("sub_1", "subscription_canceled", OffsetDateTime::now_utc()));
        let result = engine.rebuild_payment_from_event("sub_1", Actor::System).await;
        assert!(matches!(result, Err(BillingError::InvalidInput(_))));

        let missing = engine.rebuild_payment_from_event("nope", Actor::System).await;
        assert!(matches!(missing, Err(BillingError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_reprocess_recovers_after_mapping_fix() {
        let (store, engine) = engine();
        store.insert_user("buyer@example.com");
        store.insert_event(RawEvent {
            payload: json!({
                "order": {
                    "order_id": "tx1",
                    "webhook_event_type": "order_approved",
                    "Product": {"product_id": "P1"},
                    "Customer": {"email": "buyer@example.com"}
                }
            }),
            ..raw("tx1", "order_approved", OffsetDateTime::now_utc())
        });

        let first = engine
            .processor
            .process_event("tx1", ProcessTrigger::Webhook)
            .await;
        assert!(matches!(first, ProcessOutcome::Failed(_)));

        store.insert_mapping(ProductMapping {
            provider_product_id: "P1".into(),
            kind: ProductKind::Subscription,
            plan_id: Some("plan-basic".into()),
            bot_type: None,
            quantity: 1,
            duration_days: None,
        });

        let result = engine
            .reprocess_event("tx1", Actor::Admin(Uuid::new_v4()))
            .await
            .unwrap();
        assert_eq!(result.previous_status, ProcessingStatus::Failed);
        assert_eq!(result.status, ProcessingStatus::Processed);
        assert!(result.applied);

        let again = engine.reprocess_event("tx1", Actor::System).await.unwrap();
        assert_eq!(again.status, ProcessingStatus::Processed);

        assert_eq!(store.subscriptions().len(), 1);
        assert_eq!(store.subscriptions()[0].status, SubscriptionStatus::Active);
        assert_eq!(store.payments().len(), 1);
        assert_eq!(store.audit_actions("SUBSCRIPTION_CREATED").len(), 1);
        assert_eq!(store.audit_actions("EVENT_REPROCESSED").len(), 2);
    }

    #[tokio::test]
    async fn test_stats_and_failed_events() {
        let (store, engine) = engine();
        let now = OffsetDateTime::now_utc();
        store.insert_event(raw("a", "order_approved", now));
        let mut failed = raw("b", "order_approved", now);
        failed.processing_status = ProcessingStatus::Failed;
        failed.error = Some("no product mapping".into());
        store.insert_event(failed);

        let stats = engine.processing_stats(7).await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.total, 2);

        let failed = engine.failed_events(10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].provider_event_id, "b");
    }

    #[tokio::test]
    async fn test_run_scheduled_writes_audit() {
        let (store, engine) = engine();
        store.insert_payment(payment("orphan", PaymentStatus::Paid));

        let report = engine.run_scheduled(7).await.unwrap();
        assert_eq!(report.summary.payments_without_event, 1);

        let audit = store.audit_actions("RECONCILIATION_COMPLETED");
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].actor, "scheduler");
        assert_eq!(audit[0].metadata["paymentsWithoutEvent"], 1);
    }
}
