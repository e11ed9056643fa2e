//! Event Processor
//!
//! Turns one stored raw event into payment, subscription and entitlement
//! mutations. The processor is idempotent and safe to run concurrently for the
//! same event: every run plans a [`UnitOfWork`] and the store commits it only
//! if the event is still unprocessed (or the run is forced).
//!
//! ## Failure handling
//!
//! [`EventProcessor::process_event`] never returns an error. Unmapped products,
//! malformed payloads, user correlation failures and store errors flip the
//! event to `FAILED` with the error text kept for triage. Operator-forced runs
//! go through [`EventProcessor::reprocess`], which reports the error back.

use std::fmt;

use time::{Duration, OffsetDateTime};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use billsync_shared::{
    EntitlementGrant, Payment, PaymentStatus, ProcessingStatus, ProductKind, ProductMapping,
    RawEvent, Subscription, SubscriptionStatus,
};

use crate::audit::{entity, Actor, AuditAction, AuditLogger, NewAuditEntry};
use crate::error::{BillingError, BillingResult};
use crate::payload::{is_compacted, CustomerRef, EventDetails, EventKind, WebhookPayload};
use crate::store::{CommitOutcome, Stores, UnitOfWork, UserDirectory, UserMatch};

pub const DEFAULT_SUBSCRIPTION_PERIOD_DAYS: i64 = 30;
pub const DEFAULT_PROVIDER: &str = "kiwify";

/// Plans are rebuilt from fresh ledger reads when a commit comes back `Stale`
const MAX_COMMIT_ATTEMPTS: usize = 3;

/// What started a processing run; recorded in audit metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessTrigger {
    Webhook,
    Sweep,
    OperatorReprocess,
}

impl ProcessTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessTrigger::Webhook => "webhook",
            ProcessTrigger::Sweep => "sweep",
            ProcessTrigger::OperatorReprocess => "operator_reprocess",
        }
    }
}

impl fmt::Display for ProcessTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one processing run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Processed,
    AlreadyProcessed,
    NotFound,
    Failed(String),
}

/// Totals for one sweep over `PENDING` events
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Provider name stored on payments
    pub provider: String,
    /// Entitlement period when a mapping carries no `duration_days`
    pub subscription_period_days: i64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            provider: DEFAULT_PROVIDER.to_string(),
            subscription_period_days: DEFAULT_SUBSCRIPTION_PERIOD_DAYS,
        }
    }
}

/// Progression of payment statuses. An out-of-order delivery never moves a
/// payment backwards (a late "waiting payment" after "approved").
pub(crate) fn payment_rank(status: PaymentStatus) -> u8 {
    match status {
        PaymentStatus::Pending => 0,
        PaymentStatus::Paid => 1,
        PaymentStatus::Refunded | PaymentStatus::Chargeback => 2,
    }
}

#[derive(Clone)]
pub struct EventProcessor {
    stores: Stores,
    audit: AuditLogger,
    config: ProcessorConfig,
}

impl EventProcessor {
    pub fn new(stores: Stores, config: ProcessorConfig) -> Self {
        let audit = AuditLogger::new(stores.audit.clone());
        Self {
            stores,
            audit,
            config,
        }
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn audit_logger(&self) -> &AuditLogger {
        &self.audit
    }

    pub fn provider(&self) -> &str {
        &self.config.provider
    }

    /// Process one event. Never fails; a missing or already processed event
    /// is a no-op.
    pub async fn process_event(&self, event_id: &str, trigger: ProcessTrigger) -> ProcessOutcome {
        let event = match self.stores.events.get_event(event_id).await {
            Ok(Some(event)) => event,
            Ok(None) => {
                debug!(event_id = %event_id, "Raw event not found, nothing to process");
                return ProcessOutcome::NotFound;
            }
            Err(e) => {
                // Left PENDING; the next sweep retries
                error!(event_id = %event_id, error = %e, "Failed to load raw event");
                return ProcessOutcome::Failed(e.to_string());
            }
        };

        if event.processing_status == ProcessingStatus::Processed {
            return ProcessOutcome::AlreadyProcessed;
        }

        match self.apply(&event, trigger, Actor::System, false).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.record_failure(&event, &e, trigger, Actor::System).await;
                ProcessOutcome::Failed(e.to_string())
            }
        }
    }

    /// Force a run regardless of status. A failure on a `PROCESSED` event
    /// keeps it `PROCESSED` and only stores the error.
    pub async fn reprocess(&self, event_id: &str, actor: Actor) -> BillingResult<ProcessOutcome> {
        let event = self
            .stores
            .events
            .get_event(event_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("raw event {}", event_id)))?;

        let trigger = ProcessTrigger::OperatorReprocess;
        match self.apply(&event, trigger, actor.clone(), true).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.record_failure(&event, &e, trigger, actor).await;
                Err(e)
            }
        }
    }

    /// Process up to `limit` `PENDING` events, oldest first
    pub async fn sweep_pending(&self, limit: i64) -> BillingResult<SweepReport> {
        let pending = self.stores.events.pending_events(limit).await?;
        let mut report = SweepReport {
            scanned: pending.len(),
            ..Default::default()
        };

        for event in pending {
            match self
                .process_event(&event.provider_event_id, ProcessTrigger::Sweep)
                .await
            {
                ProcessOutcome::Processed => report.processed += 1,
                ProcessOutcome::AlreadyProcessed | ProcessOutcome::NotFound => report.skipped += 1,
                ProcessOutcome::Failed(_) => report.failed += 1,
            }
        }

        if report.scanned > 0 {
            info!(
                scanned = report.scanned,
                processed = report.processed,
                skipped = report.skipped,
                failed = report.failed,
                "Processing sweep finished"
            );
        }
        Ok(report)
    }

    async fn apply(
        &self,
        event: &RawEvent,
        trigger: ProcessTrigger,
        actor: Actor,
        force: bool,
    ) -> BillingResult<ProcessOutcome> {
        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            let mut work = self.plan(event, trigger, actor.clone()).await?;
            work.force = force;
            let mutated = work.has_mutations();

            match self.stores.ledger.commit(work).await? {
                CommitOutcome::Applied => {
                    info!(
                        event_id = %event.provider_event_id,
                        event_type = %event.event_type,
                        trigger = %trigger,
                        mutated,
                        "Raw event processed"
                    );
                    return Ok(ProcessOutcome::Processed);
                }
                CommitOutcome::AlreadyProcessed => {
                    debug!(event_id = %event.provider_event_id, "Raw event processed by another run");
                    return Ok(ProcessOutcome::AlreadyProcessed);
                }
                CommitOutcome::EventMissing => return Ok(ProcessOutcome::NotFound),
                CommitOutcome::Stale => {
                    debug!(
                        event_id = %event.provider_event_id,
                        attempt,
                        "Ledger changed under the plan, replanning"
                    );
                }
            }
        }

        Err(BillingError::Conflict(format!(
            "ledger rows for event {} kept changing during {} attempts",
            event.provider_event_id, MAX_COMMIT_ATTEMPTS
        )))
    }

    async fn record_failure(
        &self,
        event: &RawEvent,
        err: &BillingError,
        trigger: ProcessTrigger,
        actor: Actor,
    ) {
        let message = err.to_string();
        warn!(
            event_id = %event.provider_event_id,
            event_type = %event.event_type,
            trigger = %trigger,
            error = %message,
            "Raw event processing failed"
        );
        metrics::counter!("billing_events_failed_total").increment(1);

        if let Err(e) = self
            .stores
            .events
            .mark_event_failed(&event.provider_event_id, &message)
            .await
        {
            error!(
                event_id = %event.provider_event_id,
                error = %e,
                "Failed to mark raw event as failed"
            );
        }

        self.audit
            .log_action(
                NewAuditEntry::new(
                    AuditAction::EventFailed,
                    entity::RAW_EVENT,
                    &event.provider_event_id,
                )
                .actor(actor)
                .metadata(serde_json::json!({
                    "trigger": trigger.as_str(),
                    "eventType": event.event_type,
                    "previousStatus": event.processing_status.as_str(),
                    "error": message,
                })),
            )
            .await;
    }

    /// Decide every write for this event without touching the store
    async fn plan(
        &self,
        event: &RawEvent,
        trigger: ProcessTrigger,
        actor: Actor,
    ) -> BillingResult<UnitOfWork> {
        let mut work = UnitOfWork::new(&event.provider_event_id);
        let kind = EventKind::classify(&event.event_type);

        if is_compacted(&event.payload) {
            return Err(BillingError::InvalidInput(
                "raw payload was compacted by retention".to_string(),
            ));
        }
        let payload = WebhookPayload::from_stored(&event.payload);
        if payload.is_malformed() {
            return Err(BillingError::MalformedPayload(
                "body is not a JSON object".to_string(),
            ));
        }

        if kind == EventKind::Unknown {
            debug!(
                event_id = %event.provider_event_id,
                event_type = %event.event_type,
                "Event type carries no billing effect"
            );
            return Ok(work);
        }

        let details = payload.details();
        let mapping = self.resolve_mapping(kind, &details).await?;
        let user_id = resolve_user(self.stores.users.as_ref(), &details.customer).await?;
        let now = OffsetDateTime::now_utc();
        let ctx = PlanContext {
            event,
            kind,
            details: &details,
            mapping: mapping.as_ref(),
            user_id,
            now,
            actor,
            metadata: serde_json::json!({
                "eventId": event.provider_event_id,
                "eventType": event.event_type,
                "trigger": trigger.as_str(),
            }),
        };

        self.plan_payment(&ctx, &mut work).await?;

        let targets_subscription = mapping
            .as_ref()
            .map_or(true, |m| m.kind == ProductKind::Subscription);
        if targets_subscription {
            self.plan_subscription(&ctx, &mut work).await?;
        } else if kind.grants_entitlement() {
            self.plan_grant(&ctx, &mut work).await?;
        }

        Ok(work)
    }

    /// Purchase-class events must name a mapped product. Lifecycle events
    /// without a product id target the user's subscription.
    async fn resolve_mapping(
        &self,
        kind: EventKind,
        details: &EventDetails,
    ) -> BillingResult<Option<ProductMapping>> {
        let Some(product_id) = details.product_id.as_deref() else {
            return match kind {
                EventKind::Canceled | EventKind::Overdue | EventKind::Expired => Ok(None),
                _ => Err(BillingError::MalformedPayload(
                    "payload carries no product id".to_string(),
                )),
            };
        };

        self.stores
            .catalog
            .find_mapping(product_id)
            .await?
            .map(Some)
            .ok_or_else(|| BillingError::UnmappedProduct(product_id.to_string()))
    }

    async fn plan_payment(&self, ctx: &PlanContext<'_>, work: &mut UnitOfWork) -> BillingResult<()> {
        let Some(status) = ctx.kind.implied_payment_status() else {
            return Ok(());
        };

        let transaction_id = ctx.event.join_key();
        let existing = self
            .stores
            .ledger
            .payment_by_transaction(transaction_id)
            .await?;
        work.payment_seen = existing.as_ref().map(|p| p.updated_at);

        if let Some(current) = &existing {
            if payment_rank(status) < payment_rank(current.status) {
                debug!(
                    event_id = %ctx.event.provider_event_id,
                    current = %current.status,
                    incoming = %status,
                    "Ignoring out-of-order payment status"
                );
                return Ok(());
            }
        }

        let payment = Payment {
            id: existing.as_ref().map_or_else(Uuid::new_v4, |p| p.id),
            user_id: ctx.user_id,
            transaction_id: transaction_id.to_string(),
            amount_cents: ctx
                .details
                .amount_cents
                .or(existing.as_ref().map(|p| p.amount_cents))
                .unwrap_or(0),
            currency: ctx.details.currency.clone(),
            status,
            provider: self.config.provider.clone(),
            product_id: ctx
                .details
                .product_id
                .clone()
                .or_else(|| existing.as_ref().and_then(|p| p.product_id.clone())),
            created_at: existing.as_ref().map_or(ctx.now, |p| p.created_at),
            updated_at: ctx.now,
        };

        if existing
            .as_ref()
            .is_some_and(|current| same_payment(current, &payment))
        {
            return Ok(());
        }

        let action = if existing.is_some() {
            AuditAction::PaymentUpdated
        } else {
            AuditAction::PaymentCreated
        };
        work.audit.push(
            NewAuditEntry::new(action, entity::PAYMENT, payment.id.to_string())
                .actor(ctx.actor.clone())
                .before(existing.as_ref())
                .after(&payment)
                .metadata(ctx.metadata.clone())
                .into_record(ctx.now),
        );
        work.payment = Some(payment);
        Ok(())
    }

    async fn plan_subscription(
        &self,
        ctx: &PlanContext<'_>,
        work: &mut UnitOfWork,
    ) -> BillingResult<()> {
        let existing = self
            .stores
            .ledger
            .subscription_for_user(ctx.user_id)
            .await?;
        work.subscription_seen = existing.as_ref().map(|s| s.updated_at);

        let change = match ctx.kind {
            EventKind::Purchase | EventKind::Renewal => {
                let mapping = require_mapping(ctx)?;
                let plan_id = require_plan(mapping)?;
                let period = Duration::days(
                    mapping
                        .duration_days
                        .map(i64::from)
                        .unwrap_or(self.config.subscription_period_days),
                );
                // Time left on the current period carries over; a rerun of the
                // event that set the current expiry must not extend it again
                let expires_at = match &existing {
                    Some(current)
                        if current.last_event_id.as_deref()
                            == Some(ctx.event.provider_event_id.as_str())
                            && current.expires_at.is_some() =>
                    {
                        current.expires_at
                    }
                    _ => {
                        let base = existing
                            .as_ref()
                            .and_then(|s| s.expires_at)
                            .map_or(ctx.event.received_at, |current| {
                                current.max(ctx.event.received_at)
                            });
                        Some(base + period)
                    }
                };
                let action = match (&existing, ctx.kind) {
                    (None, _) => AuditAction::SubscriptionCreated,
                    (Some(_), EventKind::Renewal) => AuditAction::SubscriptionRenewed,
                    (Some(_), _) => AuditAction::SubscriptionActivated,
                };
                Some((plan_id, SubscriptionStatus::Active, expires_at, action))
            }
            EventKind::PaymentPending => match &existing {
                Some(current) if current.status.is_entitled() => None,
                Some(current) => Some((
                    require_plan(require_mapping(ctx)?)?,
                    SubscriptionStatus::PendingConfirmation,
                    current.expires_at,
                    AuditAction::SubscriptionStatusChanged,
                )),
                None => Some((
                    require_plan(require_mapping(ctx)?)?,
                    SubscriptionStatus::PendingConfirmation,
                    None,
                    AuditAction::SubscriptionCreated,
                )),
            },
            EventKind::Refund
            | EventKind::Chargeback
            | EventKind::Canceled
            | EventKind::Expired
            | EventKind::Overdue => existing.as_ref().map(|current| {
                let status = match ctx.kind {
                    EventKind::Refund => SubscriptionStatus::Refunded,
                    EventKind::Chargeback => SubscriptionStatus::Chargeback,
                    EventKind::Canceled => SubscriptionStatus::Canceled,
                    EventKind::Expired => SubscriptionStatus::Expired,
                    _ => match current.expires_at {
                        Some(expires_at) if ctx.now < expires_at => SubscriptionStatus::Grace,
                        _ => SubscriptionStatus::PastDue,
                    },
                };
                (
                    current.plan_id.clone(),
                    status,
                    current.expires_at,
                    AuditAction::SubscriptionStatusChanged,
                )
            }),
            EventKind::Unknown => None,
        };

        let Some((plan_id, status, expires_at, action)) = change else {
            return Ok(());
        };

        if let Some(current) = &existing {
            if current.plan_id == plan_id
                && current.status == status
                && current.expires_at == expires_at
            {
                return Ok(());
            }
        }

        let subscription = Subscription {
            id: existing.as_ref().map_or_else(Uuid::new_v4, |s| s.id),
            user_id: ctx.user_id,
            plan_id,
            status,
            external_customer_id: ctx
                .details
                .customer
                .external_id
                .clone()
                .or_else(|| existing.as_ref().and_then(|s| s.external_customer_id.clone())),
            expires_at,
            last_event_id: Some(ctx.event.provider_event_id.clone()),
            created_at: existing.as_ref().map_or(ctx.now, |s| s.created_at),
            updated_at: ctx.now,
        };

        work.audit.push(
            NewAuditEntry::new(action, entity::SUBSCRIPTION, subscription.id.to_string())
                .actor(ctx.actor.clone())
                .before(existing.as_ref())
                .after(&subscription)
                .metadata(ctx.metadata.clone())
                .into_record(ctx.now),
        );
        work.subscription = Some(subscription);
        Ok(())
    }

    async fn plan_grant(&self, ctx: &PlanContext<'_>, work: &mut UnitOfWork) -> BillingResult<()> {
        let mapping = require_mapping(ctx)?;

        if self
            .stores
            .ledger
            .grant_for_event(&ctx.event.provider_event_id)
            .await?
            .is_some()
        {
            return Ok(());
        }

        let action = match mapping.kind {
            ProductKind::AddonMarketplace => {
                if mapping.bot_type.is_none() {
                    return Err(BillingError::InvalidMapping {
                        product_id: mapping.provider_product_id.clone(),
                        reason: "add-on mapping has no bot type".to_string(),
                    });
                }
                AuditAction::AddonGranted
            }
            ProductKind::PromoTokenPack => AuditAction::PromoTokensGranted,
            ProductKind::Subscription => return Ok(()),
        };

        if mapping.quantity <= 0 {
            return Err(BillingError::InvalidMapping {
                product_id: mapping.provider_product_id.clone(),
                reason: format!("quantity must be positive, got {}", mapping.quantity),
            });
        }

        let grant = EntitlementGrant {
            id: Uuid::new_v4(),
            user_id: ctx.user_id,
            kind: mapping.kind,
            bot_type: mapping.bot_type.clone(),
            quantity: mapping.quantity,
            source_event_id: ctx.event.provider_event_id.clone(),
            created_at: ctx.now,
        };

        work.audit.push(
            NewAuditEntry::new(action, entity::ENTITLEMENT_GRANT, grant.id.to_string())
                .actor(ctx.actor.clone())
                .after(&grant)
                .metadata(ctx.metadata.clone())
                .into_record(ctx.now),
        );
        work.grant = Some(grant);
        Ok(())
    }
}

/// Explicit user id wins, otherwise the customer email must match exactly one user
pub(crate) async fn resolve_user(
    users: &dyn UserDirectory,
    customer: &CustomerRef,
) -> BillingResult<Uuid> {
    if let Some(user_id) = customer.user_id {
        return Ok(user_id);
    }

    let Some(email) = customer.email.as_deref() else {
        return Err(BillingError::UserCorrelation(
            "payload carries neither a user id nor a customer email".to_string(),
        ));
    };

    match users.resolve_email(email).await? {
        UserMatch::Found(id) => Ok(id),
        UserMatch::NotFound => Err(BillingError::UserCorrelation(format!(
            "no user with email {}",
            email
        ))),
        UserMatch::Ambiguous => Err(BillingError::UserCorrelation(format!(
            "more than one user with email {}",
            email
        ))),
    }
}

struct PlanContext<'a> {
    event: &'a RawEvent,
    kind: EventKind,
    details: &'a EventDetails,
    mapping: Option<&'a ProductMapping>,
    user_id: Uuid,
    now: OffsetDateTime,
    actor: Actor,
    metadata: serde_json::Value,
}

fn require_mapping<'a>(ctx: &PlanContext<'a>) -> BillingResult<&'a ProductMapping> {
    ctx.mapping.ok_or_else(|| {
        BillingError::MalformedPayload("payload carries no product id".to_string())
    })
}

fn require_plan(mapping: &ProductMapping) -> BillingResult<String> {
    mapping.plan_id.clone().ok_or_else(|| BillingError::InvalidMapping {
        product_id: mapping.provider_product_id.clone(),
        reason: "subscription mapping has no plan id".to_string(),
    })
}

fn same_payment(a: &Payment, b: &Payment) -> bool {
    a.user_id == b.user_id
        && a.amount_cents == b.amount_cents
        && a.currency == b.currency
        && a.status == b.status
        && a.product_id == b.product_id
}
