//! In-memory store for tests and local development
//!
//! Mirrors the Postgres constraints: one raw event per `provider_event_id`,
//! one payment per `transaction_id`, one subscription per user and one grant
//! per source event. A single mutex serializes commits the way the row lock
//! does in Postgres.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use billsync_shared::{
    AuditLog, EntitlementGrant, NewRawEvent, Payment, ProcessingStatus, ProductMapping, RawEvent,
    StatusCounts, Subscription,
};

use super::{
    page_bounds, AuditStore, CommitOutcome, EventFilter, EventStore, InsertOutcome, LedgerStore,
    PaymentFilter, PaymentSummary, ProductCatalog, UnitOfWork, UserDirectory, UserMatch,
};
use crate::audit::AuditQuery;
use crate::error::{BillingError, BillingResult};
use crate::payload::{compacted_payload, is_compacted};

#[derive(Default)]
struct MemoryState {
    events: BTreeMap<String, RawEvent>,
    payments: BTreeMap<String, Payment>,
    subscriptions: HashMap<Uuid, Subscription>,
    grants: BTreeMap<String, EntitlementGrant>,
    audit: Vec<AuditLog>,
    mappings: HashMap<String, ProductMapping>,
    users: Vec<(Uuid, String)>,
    fail_audit_writes: bool,
    fail_event_writes: bool,
    fail_commits: bool,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert_mapping(&self, mapping: ProductMapping) {
        self.state()
            .mappings
            .insert(mapping.provider_product_id.clone(), mapping);
    }

    pub fn remove_mapping(&self, provider_product_id: &str) {
        self.state().mappings.remove(provider_product_id);
    }

    /// Register a user in the directory and return its id
    pub fn insert_user(&self, email: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.state().users.push((id, email.to_ascii_lowercase()));
        id
    }

    /// Store a raw event as-is, bypassing the idempotent insert
    pub fn insert_event(&self, event: RawEvent) {
        self.state()
            .events
            .insert(event.provider_event_id.clone(), event);
    }

    /// Store a payment as-is, bypassing the unit of work
    pub fn insert_payment(&self, payment: Payment) {
        self.state()
            .payments
            .insert(payment.transaction_id.clone(), payment);
    }

    pub fn remove_payment(&self, transaction_id: &str) {
        self.state().payments.remove(transaction_id);
    }

    pub fn insert_subscription(&self, subscription: Subscription) {
        self.state()
            .subscriptions
            .insert(subscription.user_id, subscription);
    }

    pub fn fail_audit_writes(&self, fail: bool) {
        self.state().fail_audit_writes = fail;
    }

    pub fn fail_event_writes(&self, fail: bool) {
        self.state().fail_event_writes = fail;
    }

    pub fn fail_commits(&self, fail: bool) {
        self.state().fail_commits = fail;
    }

    pub fn events(&self) -> Vec<RawEvent> {
        self.state().events.values().cloned().collect()
    }

    pub fn payments(&self) -> Vec<Payment> {
        self.state().payments.values().cloned().collect()
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.state().subscriptions.values().cloned().collect()
    }

    pub fn grants(&self) -> Vec<EntitlementGrant> {
        self.state().grants.values().cloned().collect()
    }

    pub fn audit_entries(&self) -> Vec<AuditLog> {
        self.state().audit.clone()
    }

    /// Audit entries with the given action
    pub fn audit_actions(&self, action: &str) -> Vec<AuditLog> {
        self.state()
            .audit
            .iter()
            .filter(|a| a.action == action)
            .cloned()
            .collect()
    }
}

fn unavailable(what: &str) -> BillingError {
    BillingError::Database(format!("{} unavailable", what))
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn insert_event_if_absent(&self, event: NewRawEvent) -> BillingResult<InsertOutcome> {
        let mut state = self.state();
        if state.fail_event_writes {
            return Err(unavailable("event store"));
        }
        if let Some(existing) = state.events.get(&event.provider_event_id) {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }
        let row = event.into_pending();
        state
            .events
            .insert(row.provider_event_id.clone(), row.clone());
        Ok(InsertOutcome::Inserted(row))
    }

    async fn get_event(&self, provider_event_id: &str) -> BillingResult<Option<RawEvent>> {
        Ok(self.state().events.get(provider_event_id).cloned())
    }

    async fn mark_event_failed(&self, provider_event_id: &str, error: &str) -> BillingResult<()> {
        let mut state = self.state();
        if state.fail_event_writes {
            return Err(unavailable("event store"));
        }
        let event = state
            .events
            .get_mut(provider_event_id)
            .ok_or_else(|| BillingError::NotFound(format!("raw event {}", provider_event_id)))?;
        if event.processing_status != ProcessingStatus::Processed {
            event.processing_status = ProcessingStatus::Failed;
        }
        event.error = Some(error.to_string());
        Ok(())
    }

    async fn pending_events(&self, limit: i64) -> BillingResult<Vec<RawEvent>> {
        let mut pending: Vec<RawEvent> = self
            .state()
            .events
            .values()
            .filter(|e| e.processing_status == ProcessingStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|e| e.received_at);
        pending.truncate(limit.max(0) as usize);
        Ok(pending)
    }

    async fn failed_events(&self, limit: i64) -> BillingResult<Vec<RawEvent>> {
        let mut failed: Vec<RawEvent> = self
            .state()
            .events
            .values()
            .filter(|e| e.processing_status == ProcessingStatus::Failed)
            .cloned()
            .collect();
        failed.sort_by(|a, b| b.received_at.cmp(&a.received_at));
        failed.truncate(limit.max(0) as usize);
        Ok(failed)
    }

    async fn events_since(&self, since: OffsetDateTime) -> BillingResult<Vec<RawEvent>> {
        let mut events: Vec<RawEvent> = self
            .state()
            .events
            .values()
            .filter(|e| e.received_at >= since)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.received_at);
        Ok(events)
    }

    async fn event_status_counts(&self, since: OffsetDateTime) -> BillingResult<StatusCounts> {
        let mut counts = StatusCounts::default();
        for event in self.state().events.values().filter(|e| e.received_at >= since) {
            counts.add(event.processing_status, 1);
        }
        Ok(counts)
    }

    async fn list_events(&self, filter: &EventFilter) -> BillingResult<Vec<RawEvent>> {
        let (limit, offset) = page_bounds(filter.limit, filter.offset);
        let mut events: Vec<RawEvent> = self
            .state()
            .events
            .values()
            .filter(|e| filter.status.map_or(true, |s| e.processing_status == s))
            .cloned()
            .collect();
        events.sort_by(|a, b| b.received_at.cmp(&a.received_at));
        Ok(events
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn compact_processed_events(&self, before: OffsetDateTime) -> BillingResult<u64> {
        let mut state = self.state();
        let mut compacted = 0;
        for event in state.events.values_mut() {
            if event.processing_status == ProcessingStatus::Processed
                && event.received_at < before
                && !is_compacted(&event.payload)
            {
                event.payload = compacted_payload();
                event.headers = serde_json::json!({});
                event.signature = None;
                compacted += 1;
            }
        }
        Ok(compacted)
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn payment_by_transaction(&self, transaction_id: &str) -> BillingResult<Option<Payment>> {
        Ok(self.state().payments.get(transaction_id).cloned())
    }

    async fn subscription_for_user(&self, user_id: Uuid) -> BillingResult<Option<Subscription>> {
        Ok(self.state().subscriptions.get(&user_id).cloned())
    }

    async fn grant_for_event(
        &self,
        source_event_id: &str,
    ) -> BillingResult<Option<EntitlementGrant>> {
        Ok(self.state().grants.get(source_event_id).cloned())
    }

    async fn grants_for_user(&self, user_id: Uuid) -> BillingResult<Vec<EntitlementGrant>> {
        let mut grants: Vec<EntitlementGrant> = self
            .state()
            .grants
            .values()
            .filter(|g| g.user_id == user_id)
            .cloned()
            .collect();
        grants.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(grants)
    }

    async fn payments_since(&self, since: OffsetDateTime) -> BillingResult<Vec<Payment>> {
        Ok(self
            .state()
            .payments
            .values()
            .filter(|p| p.created_at >= since)
            .cloned()
            .collect())
    }

    async fn list_payments(&self, filter: &PaymentFilter) -> BillingResult<Vec<Payment>> {
        let (limit, offset) = page_bounds(filter.limit, filter.offset);
        let mut payments: Vec<Payment> = self
            .state()
            .payments
            .values()
            .filter(|p| filter.status.map_or(true, |s| p.status == s))
            .filter(|p| filter.user_id.map_or(true, |u| p.user_id == u))
            .cloned()
            .collect();
        payments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(payments
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn payment_summary(&self, since: OffsetDateTime) -> BillingResult<PaymentSummary> {
        let totals: Vec<_> = self
            .state()
            .payments
            .values()
            .filter(|p| p.created_at >= since)
            .map(|p| (p.status, 1, p.amount_cents))
            .collect();
        Ok(PaymentSummary::from_totals(since, &totals))
    }

    async fn commit(&self, work: UnitOfWork) -> BillingResult<CommitOutcome> {
        let mut state = self.state();
        if state.fail_commits {
            return Err(unavailable("ledger"));
        }

        match state.events.get(&work.event_id) {
            None => return Ok(CommitOutcome::EventMissing),
            Some(e) if e.processing_status == ProcessingStatus::Processed && !work.force => {
                return Ok(CommitOutcome::AlreadyProcessed)
            }
            Some(_) => {}
        }

        if let Some(payment) = &work.payment {
            let current = state.payments.get(&payment.transaction_id).map(|p| p.updated_at);
            if current != work.payment_seen {
                return Ok(CommitOutcome::Stale);
            }
        }
        if let Some(subscription) = &work.subscription {
            let current = state
                .subscriptions
                .get(&subscription.user_id)
                .map(|s| s.updated_at);
            if current != work.subscription_seen {
                return Ok(CommitOutcome::Stale);
            }
        }

        let now = OffsetDateTime::now_utc();

        if let Some(mut payment) = work.payment {
            if let Some(existing) = state.payments.get(&payment.transaction_id) {
                payment.id = existing.id;
                payment.created_at = existing.created_at;
            }
            state
                .payments
                .insert(payment.transaction_id.clone(), payment);
        }

        if let Some(mut subscription) = work.subscription {
            if let Some(existing) = state.subscriptions.get(&subscription.user_id) {
                subscription.id = existing.id;
                subscription.created_at = existing.created_at;
            }
            state
                .subscriptions
                .insert(subscription.user_id, subscription);
        }

        if let Some(grant) = work.grant {
            state
                .grants
                .entry(grant.source_event_id.clone())
                .or_insert(grant);
        }

        state.audit.extend(work.audit);

        if work.mark_processed {
            if let Some(event) = state.events.get_mut(&work.event_id) {
                event.processing_status = ProcessingStatus::Processed;
                event.processed_at = Some(now);
                event.error = None;
            }
        }

        Ok(CommitOutcome::Applied)
    }
}

#[async_trait]
impl AuditStore for MemoryStore {
    async fn insert_audit(&self, entry: AuditLog) -> BillingResult<()> {
        let mut state = self.state();
        if state.fail_audit_writes {
            return Err(unavailable("audit store"));
        }
        state.audit.push(entry);
        Ok(())
    }

    async fn query_audit(&self, query: &AuditQuery) -> BillingResult<Vec<AuditLog>> {
        let mut entries: Vec<AuditLog> = self
            .state()
            .audit
            .iter()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(entries
            .into_iter()
            .skip(query.page_offset() as usize)
            .take(query.page_limit() as usize)
            .collect())
    }
}

#[async_trait]
impl ProductCatalog for MemoryStore {
    async fn find_mapping(
        &self,
        provider_product_id: &str,
    ) -> BillingResult<Option<ProductMapping>> {
        Ok(self.state().mappings.get(provider_product_id).cloned())
    }
}

#[async_trait]
impl UserDirectory for MemoryStore {
    async fn resolve_email(&self, email: &str) -> BillingResult<UserMatch> {
        let email = email.trim().to_ascii_lowercase();
        let matches: Vec<Uuid> = self
            .state()
            .users
            .iter()
            .filter(|(_, e)| *e == email)
            .map(|(id, _)| *id)
            .collect();
        Ok(match matches.as_slice() {
            [] => UserMatch::NotFound,
            [id] => UserMatch::Found(*id),
            _ => UserMatch::Ambiguous,
        })
    }
}
