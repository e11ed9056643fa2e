//! Synchronous half of the webhook receiver
//!
//! Validate, record, hand off. Only signature and timestamp failures are
//! reported as errors; everything after validation resolves to an
//! [`IngestOutcome`] so the HTTP layer can always answer the provider with 200.

use std::sync::Arc;

use time::OffsetDateTime;
use tracing::{debug, error, warn};

use billsync_shared::{NewRawEvent, ProcessingStatus};

use crate::audit::{entity, Actor, AuditAction, AuditLogger, NewAuditEntry};
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::payload::{signed_content, WebhookPayload};
use crate::signature::{SignatureError, SignatureVerifier};
use crate::store::{EventStore, InsertOutcome};

/// One delivery as seen by the HTTP layer
#[derive(Debug, Clone, Copy)]
pub struct WebhookDelivery<'a> {
    pub body: &'a str,
    /// `x-<provider>-signature`; takes precedence over a signature in the body
    pub signature_header: Option<&'a str>,
    /// `x-<provider>-timestamp`
    pub timestamp_header: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted {
        event_id: String,
        dispatch: DispatchOutcome,
    },
    AlreadyProcessed {
        event_id: String,
    },
    /// Validated but not durably recorded; the provider will retry
    Deferred {
        event_id: String,
        error: String,
    },
}

impl IngestOutcome {
    pub fn event_id(&self) -> &str {
        match self {
            IngestOutcome::Accepted { event_id, .. }
            | IngestOutcome::AlreadyProcessed { event_id }
            | IngestOutcome::Deferred { event_id, .. } => event_id,
        }
    }
}

#[derive(Clone)]
pub struct WebhookIngestor {
    verifier: SignatureVerifier,
    events: Arc<dyn EventStore>,
    audit: AuditLogger,
    dispatcher: Dispatcher,
}

impl WebhookIngestor {
    pub fn new(
        verifier: SignatureVerifier,
        events: Arc<dyn EventStore>,
        audit: AuditLogger,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            verifier,
            events,
            audit,
            dispatcher,
        }
    }

    pub fn verifier(&self) -> &SignatureVerifier {
        &self.verifier
    }

    pub async fn ingest(
        &self,
        delivery: WebhookDelivery<'_>,
    ) -> Result<IngestOutcome, SignatureError> {
        let now = OffsetDateTime::now_utc();
        let payload = WebhookPayload::parse(delivery.body);
        let normalized = payload.normalize(delivery.body.as_bytes());
        let event_id = normalized.identity.id.clone();

        let signature = delivery
            .signature_header
            .filter(|s| !s.trim().is_empty())
            .or_else(|| payload.embedded_signature());

        let validation = self
            .verifier
            .verify(signed_content(delivery.body).as_bytes(), signature)
            .and_then(|_| self.verifier.check_timestamp(delivery.timestamp_header, now));

        if let Err(e) = validation {
            warn!(
                event_id = %event_id,
                code = e.code(),
                error = %e,
                "Rejected webhook delivery"
            );
            self.audit
                .log_action(
                    NewAuditEntry::new(AuditAction::WebhookRejected, entity::RAW_EVENT, &event_id)
                        .actor(Actor::Provider)
                        .metadata(serde_json::json!({
                            "code": e.code(),
                            "reason": e.to_string(),
                            "eventType": normalized.event_type,
                        })),
                )
                .await;
            return Err(e);
        }

        self.audit
            .log_action(
                NewAuditEntry::new(AuditAction::WebhookReceived, entity::RAW_EVENT, &event_id)
                    .actor(Actor::Provider)
                    .metadata(serde_json::json!({
                        "eventType": normalized.event_type,
                        "identitySource": normalized.identity.source.as_str(),
                        "signatureVerified": self.verifier.is_enforced(),
                        "malformed": payload.is_malformed(),
                    })),
            )
            .await;

        let record = NewRawEvent {
            provider_event_id: event_id.clone(),
            event_type: normalized.event_type,
            payload: payload.to_value(),
            headers: serde_json::json!({
                "signature": delivery.signature_header,
                "timestamp": delivery.timestamp_header,
            }),
            signature: signature.map(str::to_string),
            identity_source: normalized.identity.source,
            transaction_ref: normalized.transaction_ref,
            received_at: now,
        };

        let stored = match self.events.insert_event_if_absent(record).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(event_id = %event_id, error = %e, "Failed to persist raw event");
                return Ok(IngestOutcome::Deferred {
                    event_id,
                    error: e.to_string(),
                });
            }
        };

        if let InsertOutcome::Existing(existing) = &stored {
            debug!(
                event_id = %event_id,
                status = %existing.processing_status,
                "Duplicate webhook delivery"
            );
            if existing.processing_status == ProcessingStatus::Processed {
                return Ok(IngestOutcome::AlreadyProcessed { event_id });
            }
        }

        let dispatch = self.dispatcher.submit(&event_id);
        Ok(IngestOutcome::Accepted { event_id, dispatch })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::processor::{EventProcessor, ProcessorConfig};
    use crate::signature::compute_signature;
    use crate::store::{MemoryStore, Stores};
    use crate::dispatch::DispatchWorker;

    const SECRET: &str = "whsec_ingest_secret";

    fn ingestor(secret: Option<&str>) -> (Arc<MemoryStore>, WebhookIngestor, DispatchWorker) {
        let store = Arc::new(MemoryStore::new());
        let stores = Stores::memory(store.clone());
        let processor = EventProcessor::new(stores.clone(), ProcessorConfig::default());
        let (dispatcher, worker) = Dispatcher::new(processor.clone(), 16);
        let ingestor = WebhookIngestor::new(
            SignatureVerifier::new(secret.map(str::to_string), 300),
            stores.events.clone(),
            processor.audit_logger().clone(),
            dispatcher,
        );
        (store, ingestor, worker)
    }

    fn delivery(body: &str) -> WebhookDelivery<'_> {
        WebhookDelivery {
            body,
            signature_header: None,
            timestamp_header: None,
        }
    }

    #[tokio::test]
    async fn test_duplicate_delivery_keeps_one_row() {
        let (store, ingestor, _worker) = ingestor(None);
        let body = r#"{"order":{"order_id":"tx1","webhook_event_type":"order_approved"}}"#;

        let first = ingestor.ingest(delivery(body)).await.unwrap();
        let second = ingestor.ingest(delivery(body)).await.unwrap();

        assert_eq!(first.event_id(), "tx1");
        assert!(matches!(second, IngestOutcome::Accepted { .. }));
        assert_eq!(store.events().len(), 1);
        assert_eq!(store.audit_actions("WEBHOOK_RECEIVED").len(), 2);
    }

    #[tokio::test]
    async fn test_processed_event_reports_already_processed() {
        let (store, ingestor, _worker) = ingestor(None);
        let body = r#"{"order_id":"tx1","event":"order_approved"}"#;
        ingestor.ingest(delivery(body)).await.unwrap();

        let mut event = store.events().pop().unwrap();
        event.processing_status = ProcessingStatus::Processed;
        store.insert_event(event);

        let outcome = ingestor.ingest(delivery(body)).await.unwrap();
        assert_eq!(
            outcome,
            IngestOutcome::AlreadyProcessed {
                event_id: "tx1".into()
            }
        );
    }

    #[tokio::test]
    async fn test_envelope_signature_over_inner_order() {
        let (store, ingestor, _worker) = ingestor(Some(SECRET));
        let order = r#"{"order_id":"tx1","webhook_event_type":"order_approved"}"#;
        let signature = compute_signature(SECRET, order.as_bytes());
        let body = format!(r#"{{"signature":"{}","order":{}}}"#, signature, order);

        assert!(ingestor.ingest(delivery(&body)).await.is_ok());
        assert_eq!(store.events().len(), 1);
        assert_eq!(store.events()[0].signature.as_deref(), Some(signature.as_str()));
    }

    #[tokio::test]
    async fn test_tampered_body_rejected_without_persisting() {
        let (store, ingestor, _worker) = ingestor(Some(SECRET));
        let body = r#"{"order_id":"tx1","event":"order_approved","amount":10}"#;
        let signature = compute_signature(SECRET, body.as_bytes());
        let tampered = body.replace("10", "11");

        let result = ingestor
            .ingest(WebhookDelivery {
                body: &tampered,
                signature_header: Some(&signature),
                timestamp_header: None,
            })
            .await;

        assert_eq!(result, Err(SignatureError::Mismatch));
        assert!(store.events().is_empty());
        assert_eq!(store.audit_actions("WEBHOOK_REJECTED").len(), 1);
    }

    #[tokio::test]
    async fn test_stale_timestamp_rejected() {
        let (_store, ingestor, _worker) = ingestor(None);
        let stale = (OffsetDateTime::now_utc().unix_timestamp() - 3_600).to_string();
        let result = ingestor
            .ingest(WebhookDelivery {
                body: r#"{"order_id":"tx1"}"#,
                signature_header: None,
                timestamp_header: Some(&stale),
            })
            .await;
        assert!(matches!(result, Err(SignatureError::StaleTimestamp { .. })));
    }

    #[tokio::test]
    async fn test_store_failure_is_deferred() {
        let (store, ingestor, _worker) = ingestor(None);
        store.fail_event_writes(true);

        let outcome = ingestor
            .ingest(delivery(r#"{"order_id":"tx1"}"#))
            .await
            .unwrap();
        assert!(matches!(outcome, IngestOutcome::Deferred { .. }));
    }

    #[tokio::test]
    async fn test_malformed_body_is_kept_under_synthesized_identity() {
        let (store, ingestor, _worker) = ingestor(None);
        let outcome = ingestor.ingest(delivery("not json at all")).await.unwrap();

        assert!(outcome.event_id().starts_with("unidentified:"));
        let event = store.events().pop().unwrap();
        assert_eq!(event.payload["malformed"], true);
        assert_eq!(event.payload["raw"], "not json at all");
    }
}
