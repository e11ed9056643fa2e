//! Audit Logging Module
//!
//! Append-only record of every state-changing action in the billing pipeline.
//! Entries answer "why does this user have this plan?" and "who repaired this
//! payment?" questions during operator review.
//!
//! ## Write policy
//!
//! [`AuditLogger::log_action`] never fails. A persistence failure is logged and
//! counted (`billing_audit_write_failures_total`), never surfaced to the caller.
//! Entries that describe an entity mutation made by the event processor are
//! committed together with the mutation instead (see [`crate::store::UnitOfWork`]).

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use billsync_shared::AuditLog;

use crate::error::BillingResult;
use crate::store::AuditStore;

pub const MAX_AUDIT_PAGE: i64 = 500;
pub const DEFAULT_AUDIT_PAGE: i64 = 50;

/// Entity types referenced by audit entries
pub mod entity {
    pub const RAW_EVENT: &str = "raw_event";
    pub const PAYMENT: &str = "payment";
    pub const SUBSCRIPTION: &str = "subscription";
    pub const ENTITLEMENT_GRANT: &str = "entitlement_grant";
    pub const RECONCILIATION: &str = "reconciliation";
}

/// Audit action taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditAction {
    // Ingestion
    WebhookReceived,
    WebhookRejected,

    // Payments
    PaymentCreated,
    PaymentUpdated,

    // Subscriptions
    SubscriptionCreated,
    SubscriptionActivated,
    SubscriptionRenewed,
    SubscriptionStatusChanged,

    // Entitlements
    AddonGranted,
    PromoTokensGranted,

    // Processing
    EventFailed,

    // Operator repairs
    EventReprocessed,
    PaymentRebuilt,

    // Scheduled jobs
    ReconciliationCompleted,
    EventsCompacted,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::WebhookReceived => "WEBHOOK_RECEIVED",
            AuditAction::WebhookRejected => "WEBHOOK_REJECTED",
            AuditAction::PaymentCreated => "PAYMENT_CREATED",
            AuditAction::PaymentUpdated => "PAYMENT_UPDATED",
            AuditAction::SubscriptionCreated => "SUBSCRIPTION_CREATED",
            AuditAction::SubscriptionActivated => "SUBSCRIPTION_ACTIVATED",
            AuditAction::SubscriptionRenewed => "SUBSCRIPTION_RENEWED",
            AuditAction::SubscriptionStatusChanged => "SUBSCRIPTION_STATUS_CHANGED",
            AuditAction::AddonGranted => "ADDON_GRANTED",
            AuditAction::PromoTokensGranted => "PROMO_TOKENS_GRANTED",
            AuditAction::EventFailed => "EVENT_FAILED",
            AuditAction::EventReprocessed => "EVENT_REPROCESSED",
            AuditAction::PaymentRebuilt => "PAYMENT_REBUILT",
            AuditAction::ReconciliationCompleted => "RECONCILIATION_COMPLETED",
            AuditAction::EventsCompacted => "EVENTS_COMPACTED",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who triggered the action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    /// Payment provider webhook
    Provider,
    /// Inline or sweep-triggered processing
    System,
    /// Scheduled job
    Scheduler,
    /// Operator on the admin surface
    Admin(Uuid),
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::Provider => write!(f, "provider"),
            Actor::System => write!(f, "system"),
            Actor::Scheduler => write!(f, "scheduler"),
            Actor::Admin(id) => write!(f, "admin:{}", id),
        }
    }
}

/// Builder for an audit entry
#[derive(Debug, Clone, PartialEq)]
pub struct NewAuditEntry {
    pub actor: Actor,
    pub action: AuditAction,
    pub entity_type: &'static str,
    pub entity_id: String,
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
    pub metadata: serde_json::Value,
}

impl NewAuditEntry {
    pub fn new(action: AuditAction, entity_type: &'static str, entity_id: impl Into<String>) -> Self {
        Self {
            actor: Actor::System,
            action,
            entity_type,
            entity_id: entity_id.into(),
            before: None,
            after: None,
            metadata: serde_json::json!({}),
        }
    }

    pub fn actor(mut self, actor: Actor) -> Self {
        self.actor = actor;
        self
    }

    /// Snapshot of the entity before the action
    pub fn before<T: Serialize>(mut self, before: Option<&T>) -> Self {
        self.before = before.and_then(|b| serde_json::to_value(b).ok());
        self
    }

    /// Snapshot of the entity after the action
    pub fn after<T: Serialize>(mut self, after: &T) -> Self {
        self.after = serde_json::to_value(after).ok();
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn into_record(self, created_at: OffsetDateTime) -> AuditLog {
        AuditLog {
            id: Uuid::new_v4(),
            actor: self.actor.to_string(),
            action: self.action.to_string(),
            entity_type: self.entity_type.to_string(),
            entity_id: self.entity_id,
            before: self.before,
            after: self.after,
            metadata: self.metadata,
            created_at,
        }
    }
}

/// Filtered, paginated audit retrieval
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditQuery {
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub actor: Option<String>,
    pub action: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub from: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub to: Option<OffsetDateTime>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl AuditQuery {
    pub fn page_limit(&self) -> i64 {
        self.limit
            .unwrap_or(DEFAULT_AUDIT_PAGE)
            .clamp(1, MAX_AUDIT_PAGE)
    }

    pub fn page_offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }

    /// In-memory filter; the Postgres store expresses the same predicate in SQL
    pub fn matches(&self, entry: &AuditLog) -> bool {
        self.entity_type.as_deref().map_or(true, |v| entry.entity_type == v)
            && self.entity_id.as_deref().map_or(true, |v| entry.entity_id == v)
            && self.actor.as_deref().map_or(true, |v| entry.actor == v)
            && self.action.as_deref().map_or(true, |v| entry.action == v)
            && self.from.map_or(true, |from| entry.created_at >= from)
            && self.to.map_or(true, |to| entry.created_at <= to)
    }
}

/// Best-effort audit writer and query service
#[derive(Clone)]
pub struct AuditLogger {
    store: Arc<dyn AuditStore>,
    failures: Arc<AtomicU64>,
}

impl AuditLogger {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self {
            store,
            failures: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record an action. Never fails.
    pub async fn log_action(&self, entry: NewAuditEntry) {
        let action = entry.action;
        let entity_id = entry.entity_id.clone();
        let record = entry.into_record(OffsetDateTime::now_utc());

        if let Err(e) = self.store.insert_audit(record).await {
            self.failures.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("billing_audit_write_failures_total").increment(1);
            tracing::error!(
                action = %action,
                entity_id = %entity_id,
                error = %e,
                "Failed to write audit log entry"
            );
        }
    }

    /// Audit writes that failed since start-up
    pub fn failed_writes(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub async fn query(&self, query: &AuditQuery) -> BillingResult<Vec<AuditLog>> {
        self.store.query_audit(query).await
    }
}
