//! Persistence ports for the billing pipeline
//!
//! Each concern is a trait so the processor and reconciliation engine run
//! unchanged against Postgres ([`PgStore`]) or memory ([`MemoryStore`]).
//!
//! Idempotency lives here:
//! - `raw_events.provider_event_id` is unique; [`EventStore::insert_event_if_absent`]
//!   never creates a second row for a redelivered event
//! - [`LedgerStore::commit`] re-checks `PROCESSED` under a row lock and applies
//!   the whole [`UnitOfWork`] or nothing

pub mod memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use billsync_shared::{
    AuditLog, EntitlementGrant, NewRawEvent, Payment, PaymentStatus, ProcessingStatus,
    ProductMapping, RawEvent, StatusCounts, Subscription,
};

use crate::audit::AuditQuery;
use crate::error::BillingResult;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Result of an idempotent raw-event insert
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Inserted(RawEvent),
    /// A row with this identity already existed; returned unchanged
    Existing(RawEvent),
}

impl InsertOutcome {
    pub fn event(&self) -> &RawEvent {
        match self {
            InsertOutcome::Inserted(e) | InsertOutcome::Existing(e) => e,
        }
    }

    pub fn into_event(self) -> RawEvent {
        match self {
            InsertOutcome::Inserted(e) | InsertOutcome::Existing(e) => e,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, InsertOutcome::Inserted(_))
    }
}

/// Raw event listing filter
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFilter {
    pub status: Option<ProcessingStatus>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Payment listing filter
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentFilter {
    pub status: Option<PaymentStatus>,
    pub user_id: Option<Uuid>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub const MAX_LIST_PAGE: i64 = 500;
pub const DEFAULT_LIST_PAGE: i64 = 50;

pub(crate) fn page_bounds(limit: Option<i64>, offset: Option<i64>) -> (i64, i64) {
    (
        limit.unwrap_or(DEFAULT_LIST_PAGE).clamp(1, MAX_LIST_PAGE),
        offset.unwrap_or(0).max(0),
    )
}

/// Count and total amount for one payment status
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentStatusTotal {
    pub status: PaymentStatus,
    pub count: i64,
    pub amount_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub since: OffsetDateTime,
    pub by_status: Vec<PaymentStatusTotal>,
    pub total_count: i64,
    pub net_paid_cents: i64,
}

impl PaymentSummary {
    /// Build a summary with one row per status, zero-filled
    pub fn from_totals(since: OffsetDateTime, totals: &[(PaymentStatus, i64, i64)]) -> Self {
        let by_status: Vec<PaymentStatusTotal> = PaymentStatus::ALL
            .iter()
            .map(|status| {
                let (count, amount_cents) = totals
                    .iter()
                    .filter(|(s, _, _)| s == status)
                    .fold((0, 0), |(c, a), (_, count, amount)| (c + count, a + amount));
                PaymentStatusTotal {
                    status: *status,
                    count,
                    amount_cents,
                }
            })
            .collect();
        let total_count = by_status.iter().map(|t| t.count).sum();
        let net_paid_cents = by_status
            .iter()
            .filter(|t| t.status == PaymentStatus::Paid)
            .map(|t| t.amount_cents)
            .sum();
        Self {
            since,
            by_status,
            total_count,
            net_paid_cents,
        }
    }
}

/// Outcome of resolving a customer email to an internal user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserMatch {
    Found(Uuid),
    NotFound,
    Ambiguous,
}

/// Everything one processing run writes, applied atomically
#[derive(Debug, Clone, PartialEq)]
pub struct UnitOfWork {
    pub event_id: String,
    /// Upserted by `transaction_id`
    pub payment: Option<Payment>,
    /// `updated_at` of the payment row the plan read, `None` when absent.
    /// The commit is `Stale` if the stored row no longer matches.
    pub payment_seen: Option<OffsetDateTime>,
    /// Upserted by `user_id`
    pub subscription: Option<Subscription>,
    /// Same check as `payment_seen`, for the user's subscription row
    pub subscription_seen: Option<OffsetDateTime>,
    /// Inserted unless a grant for the same source event exists
    pub grant: Option<EntitlementGrant>,
    pub audit: Vec<AuditLog>,
    /// Flip the event to `PROCESSED` and clear its error
    pub mark_processed: bool,
    /// Apply even when the event is already `PROCESSED`
    pub force: bool,
}

impl UnitOfWork {
    pub fn new(event_id: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            payment: None,
            payment_seen: None,
            subscription: None,
            subscription_seen: None,
            grant: None,
            audit: Vec::new(),
            mark_processed: true,
            force: false,
        }
    }

    pub fn has_mutations(&self) -> bool {
        self.payment.is_some() || self.subscription.is_some() || self.grant.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Applied,
    /// Another run finished first; nothing was written
    AlreadyProcessed,
    EventMissing,
    /// A ledger row changed after the plan read it; nothing was written
    Stale,
}

/// Raw event log
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn insert_event_if_absent(&self, event: NewRawEvent) -> BillingResult<InsertOutcome>;

    async fn get_event(&self, provider_event_id: &str) -> BillingResult<Option<RawEvent>>;

    /// Record a processing error. `PENDING`/`FAILED` events become `FAILED`;
    /// a `PROCESSED` event keeps its status and only stores the error text.
    async fn mark_event_failed(&self, provider_event_id: &str, error: &str) -> BillingResult<()>;

    /// Oldest first
    async fn pending_events(&self, limit: i64) -> BillingResult<Vec<RawEvent>>;

    /// Most recent first
    async fn failed_events(&self, limit: i64) -> BillingResult<Vec<RawEvent>>;

    async fn events_since(&self, since: OffsetDateTime) -> BillingResult<Vec<RawEvent>>;

    async fn event_status_counts(&self, since: OffsetDateTime) -> BillingResult<StatusCounts>;

    async fn list_events(&self, filter: &EventFilter) -> BillingResult<Vec<RawEvent>>;

    /// Replace the payload of `PROCESSED` events received before `before`
    /// with [`compacted_payload`]. Rows are never deleted: the
    /// `provider_event_id` is the dedupe key for provider redeliveries.
    ///
    /// [`compacted_payload`]: crate::payload::compacted_payload
    async fn compact_processed_events(&self, before: OffsetDateTime) -> BillingResult<u64>;
}

/// Payments, subscriptions and entitlement grants
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn payment_by_transaction(&self, transaction_id: &str) -> BillingResult<Option<Payment>>;

    async fn subscription_for_user(&self, user_id: Uuid) -> BillingResult<Option<Subscription>>;

    async fn grant_for_event(&self, source_event_id: &str)
        -> BillingResult<Option<EntitlementGrant>>;

    /// Most recent first
    async fn grants_for_user(&self, user_id: Uuid) -> BillingResult<Vec<EntitlementGrant>>;

    async fn payments_since(&self, since: OffsetDateTime) -> BillingResult<Vec<Payment>>;

    async fn list_payments(&self, filter: &PaymentFilter) -> BillingResult<Vec<Payment>>;

    async fn payment_summary(&self, since: OffsetDateTime) -> BillingResult<PaymentSummary>;

    async fn commit(&self, work: UnitOfWork) -> BillingResult<CommitOutcome>;
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn insert_audit(&self, entry: AuditLog) -> BillingResult<()>;

    async fn query_audit(&self, query: &AuditQuery) -> BillingResult<Vec<AuditLog>>;
}

/// Read-only view of the product mapping table
#[async_trait]
pub trait ProductCatalog: Send + Sync {
    async fn find_mapping(&self, provider_product_id: &str)
        -> BillingResult<Option<ProductMapping>>;
}

/// Account lookup owned by the account service
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn resolve_email(&self, email: &str) -> BillingResult<UserMatch>;
}

/// The store handles one pipeline instance uses
#[derive(Clone)]
pub struct Stores {
    pub events: Arc<dyn EventStore>,
    pub ledger: Arc<dyn LedgerStore>,
    pub audit: Arc<dyn AuditStore>,
    pub catalog: Arc<dyn ProductCatalog>,
    pub users: Arc<dyn UserDirectory>,
}

impl Stores {
    pub fn postgres(pool: sqlx::PgPool) -> Self {
        let store = Arc::new(PgStore::new(pool));
        Self {
            events: store.clone(),
            ledger: store.clone(),
            audit: store.clone(),
            catalog: store.clone(),
            users: store,
        }
    }

    pub fn memory(store: Arc<MemoryStore>) -> Self {
        Self {
            events: store.clone(),
            ledger: store.clone(),
            audit: store.clone(),
            catalog: store.clone(),
            users: store,
        }
    }
}
