//! Common types used across billsync

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::SharedError;

// =============================================================================
// Enums
// =============================================================================

/// Processing state of a raw provider event
///
/// Transitions: `PENDING -> PROCESSED`, `PENDING -> FAILED`,
/// `FAILED -> PENDING | PROCESSED` (explicit reprocessing).
/// A `PROCESSED` event never regresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingStatus {
    Pending,
    Processed,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "PENDING",
            ProcessingStatus::Processed => "PROCESSED",
            ProcessingStatus::Failed => "FAILED",
        }
    }

    /// Whether moving from `self` to `next` is a legal transition
    pub fn can_transition_to(&self, next: ProcessingStatus) -> bool {
        use ProcessingStatus::*;
        matches!(
            (self, next),
            (Pending, Processed) | (Pending, Failed) | (Failed, Pending) | (Failed, Processed)
        ) || *self == next
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingStatus {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(ProcessingStatus::Pending),
            "PROCESSED" => Ok(ProcessingStatus::Processed),
            "FAILED" => Ok(ProcessingStatus::Failed),
            _ => Err(SharedError::unknown("processing status", s)),
        }
    }
}

/// Where a raw event's identity came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdentitySource {
    /// Explicit provider event id
    EventId,
    /// Transaction / order id
    TransactionId,
    /// Content hash of the body; no identity in the payload
    Synthesized,
}

impl IdentitySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentitySource::EventId => "EVENT_ID",
            IdentitySource::TransactionId => "TRANSACTION_ID",
            IdentitySource::Synthesized => "SYNTHESIZED",
        }
    }
}

impl fmt::Display for IdentitySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payment record status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Refunded,
    Chargeback,
}

impl PaymentStatus {
    pub const ALL: [PaymentStatus; 4] = [
        PaymentStatus::Pending,
        PaymentStatus::Paid,
        PaymentStatus::Refunded,
        PaymentStatus::Chargeback,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Refunded => "refunded",
            PaymentStatus::Chargeback => "chargeback",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(PaymentStatus::Pending),
            "paid" => Ok(PaymentStatus::Paid),
            "refunded" => Ok(PaymentStatus::Refunded),
            "chargeback" => Ok(PaymentStatus::Chargeback),
            _ => Err(SharedError::unknown("payment status", s)),
        }
    }
}

/// Subscription lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    PendingConfirmation,
    Active,
    Grace,
    PastDue,
    Canceled,
    Expired,
    Refunded,
    Chargeback,
    /// Status view only: the user has no subscription row
    NoSubscription,
    Unknown,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::PendingConfirmation => "PENDING_CONFIRMATION",
            SubscriptionStatus::Active => "ACTIVE",
            SubscriptionStatus::Grace => "GRACE",
            SubscriptionStatus::PastDue => "PAST_DUE",
            SubscriptionStatus::Canceled => "CANCELED",
            SubscriptionStatus::Expired => "EXPIRED",
            SubscriptionStatus::Refunded => "REFUNDED",
            SubscriptionStatus::Chargeback => "CHARGEBACK",
            SubscriptionStatus::NoSubscription => "NO_SUBSCRIPTION",
            SubscriptionStatus::Unknown => "UNKNOWN",
        }
    }

    /// Whether the subscription currently entitles the user to its plan
    pub fn is_entitled(&self) -> bool {
        matches!(self, SubscriptionStatus::Active | SubscriptionStatus::Grace)
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = SharedError;

    /// Unrecognized values map to `Unknown` rather than failing.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_uppercase().as_str() {
            "PENDING_CONFIRMATION" => SubscriptionStatus::PendingConfirmation,
            "ACTIVE" => SubscriptionStatus::Active,
            "GRACE" => SubscriptionStatus::Grace,
            "PAST_DUE" => SubscriptionStatus::PastDue,
            "CANCELED" | "CANCELLED" => SubscriptionStatus::Canceled,
            "EXPIRED" => SubscriptionStatus::Expired,
            "REFUNDED" => SubscriptionStatus::Refunded,
            "CHARGEBACK" => SubscriptionStatus::Chargeback,
            "NO_SUBSCRIPTION" => SubscriptionStatus::NoSubscription,
            _ => SubscriptionStatus::Unknown,
        })
    }
}

/// Entitlement kind a provider product maps to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProductKind {
    Subscription,
    AddonMarketplace,
    PromoTokenPack,
}

impl ProductKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductKind::Subscription => "SUBSCRIPTION",
            ProductKind::AddonMarketplace => "ADDON_MARKETPLACE",
            ProductKind::PromoTokenPack => "PROMO_TOKEN_PACK",
        }
    }
}

impl fmt::Display for ProductKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProductKind {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SUBSCRIPTION" => Ok(ProductKind::Subscription),
            "ADDON_MARKETPLACE" => Ok(ProductKind::AddonMarketplace),
            "PROMO_TOKEN_PACK" => Ok(ProductKind::PromoTokenPack),
            _ => Err(SharedError::unknown("product kind", s)),
        }
    }
}

// =============================================================================
// Records
// =============================================================================

/// A provider webhook as received, keyed by its idempotency key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    pub provider_event_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    /// Received signature/timestamp headers
    pub headers: serde_json::Value,
    pub signature: Option<String>,
    pub identity_source: IdentitySource,
    /// Transaction/order reference used to join with payments
    pub transaction_ref: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
    pub processing_status: ProcessingStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub processed_at: Option<OffsetDateTime>,
    pub error: Option<String>,
}

impl RawEvent {
    /// Key used when joining against `payments.transaction_id`
    pub fn join_key(&self) -> &str {
        self.transaction_ref
            .as_deref()
            .unwrap_or(&self.provider_event_id)
    }
}

/// Input for an idempotent raw-event insert
#[derive(Debug, Clone, PartialEq)]
pub struct NewRawEvent {
    pub provider_event_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub headers: serde_json::Value,
    pub signature: Option<String>,
    pub identity_source: IdentitySource,
    pub transaction_ref: Option<String>,
    pub received_at: OffsetDateTime,
}

impl NewRawEvent {
    /// Materialize as a fresh `PENDING` row
    pub fn into_pending(self) -> RawEvent {
        RawEvent {
            provider_event_id: self.provider_event_id,
            event_type: self.event_type,
            payload: self.payload,
            headers: self.headers,
            signature: self.signature,
            identity_source: self.identity_source,
            transaction_ref: self.transaction_ref,
            received_at: self.received_at,
            processing_status: ProcessingStatus::Pending,
            processed_at: None,
            error: None,
        }
    }
}

/// Financial record derived from a purchase-class event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Stable provider transaction reference; unique
    pub transaction_id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub provider: String,
    pub product_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// A user's plan subscription (one row per user)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_id: String,
    pub status: SubscriptionStatus,
    pub external_customer_id: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    /// Last provider event that changed this row
    pub last_event_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Static lookup from a provider product code to an internal entitlement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ProductMapping {
    pub provider_product_id: String,
    pub kind: ProductKind,
    pub plan_id: Option<String>,
    pub bot_type: Option<String>,
    pub quantity: i32,
    /// Overrides the default subscription period
    pub duration_days: Option<i32>,
}

/// Non-subscription entitlement granted by a purchase (add-on or token pack)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementGrant {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: ProductKind,
    pub bot_type: Option<String>,
    pub quantity: i32,
    /// Unique: a provider event grants at most once
    pub source_event_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Append-only audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct AuditLog {
    pub id: Uuid,
    pub actor: String,
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
    pub metadata: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Counts of raw events by processing status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCounts {
    pub pending: i64,
    pub processed: i64,
    pub failed: i64,
}

impl StatusCounts {
    pub fn total(&self) -> i64 {
        self.pending + self.processed + self.failed
    }

    pub fn add(&mut self, status: ProcessingStatus, count: i64) {
        match status {
            ProcessingStatus::Pending => self.pending += count,
            ProcessingStatus::Processed => self.processed += count,
            ProcessingStatus::Failed => self.failed += count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processing_status_transitions() {
        use ProcessingStatus::*;
        assert!(Pending.can_transition_to(Processed));
        assert!(Pending.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Pending));
        assert!(Failed.can_transition_to(Processed));
        assert!(!Processed.can_transition_to(Pending));
        assert!(!Processed.can_transition_to(Failed));
    }

    #[test]
    fn test_subscription_status_parse_is_lenient() {
        assert_eq!(
            "past_due".parse::<SubscriptionStatus>().unwrap(),
            SubscriptionStatus::PastDue
        );
        assert_eq!(
            "cancelled".parse::<SubscriptionStatus>().unwrap(),
            SubscriptionStatus::Canceled
        );
        assert_eq!(
            "something-else".parse::<SubscriptionStatus>().unwrap(),
            SubscriptionStatus::Unknown
        );
    }

    #[test]
    fn test_payment_status_serde() {
        let json = serde_json::to_string(&PaymentStatus::Chargeback).unwrap();
        assert_eq!(json, "\"chargeback\"");
        assert!("bogus".parse::<PaymentStatus>().is_err());
    }

    #[test]
    fn test_raw_event_join_key_prefers_transaction_ref() {
        let mut event = NewRawEvent {
            provider_event_id: "evt_1".into(),
            event_type: "order_approved".into(),
            payload: serde_json::json!({}),
            headers: serde_json::json!({}),
            signature: None,
            identity_source: IdentitySource::EventId,
            transaction_ref: Some("ord_1".into()),
            received_at: OffsetDateTime::now_utc(),
        }
        .into_pending();
        assert_eq!(event.join_key(), "ord_1");
        event.transaction_ref = None;
        assert_eq!(event.join_key(), "evt_1");
    }

    #[test]
    fn test_status_counts_total() {
        let mut counts = StatusCounts::default();
        counts.add(ProcessingStatus::Pending, 2);
        counts.add(ProcessingStatus::Failed, 1);
        assert_eq!(counts.total(), 3);
    }
}
