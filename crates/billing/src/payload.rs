//! Webhook payload shapes and normalization
//!
//! The provider delivers two shapes:
//!
//! - **Envelope**: `{"signature": "...", "order": {...}}`, where the provider
//!   signs the inner `order` object
//! - **Legacy**: a flat object carrying the event fields at the root
//!
//! [`WebhookPayload::parse`] is the only place that decides which shape a body
//! has. Everything downstream works on the decoded variant.

use serde::Deserialize;
use serde_json::{value::RawValue, Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use billsync_shared::{IdentitySource, PaymentStatus};

const EVENT_ID_FIELDS: &[&str] = &["event_id", "webhook_id", "id"];
const TRANSACTION_ID_FIELDS: &[&str] = &["transaction_id", "order_id", "transaction", "sale_id"];
const EVENT_TYPE_FIELDS: &[&str] = &["webhook_event_type", "event_type", "event", "type"];
const PRODUCT_ID_FIELDS: &[&str] = &["Product.product_id", "product.id", "product_id"];
const USER_ID_FIELDS: &[&str] = &[
    "user_id",
    "external_reference",
    "TrackingParameters.src",
    "metadata.user_id",
];
const EMAIL_FIELDS: &[&str] = &["Customer.email", "customer.email", "email"];
const CUSTOMER_ID_FIELDS: &[&str] = &["Customer.id", "customer.id", "customer_id"];
const AMOUNT_DECIMAL_FIELDS: &[&str] = &["Commissions.charge_amount", "amount", "price"];
const CURRENCY_FIELDS: &[&str] = &["currency", "Commissions.currency"];

pub const DEFAULT_EVENT_TYPE: &str = "unknown";
pub const DEFAULT_CURRENCY: &str = "BRL";
pub const SYNTHESIZED_ID_PREFIX: &str = "unidentified:";

/// Decoded webhook body
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookPayload {
    Envelope {
        signature: Option<String>,
        order: Map<String, Value>,
        root: Map<String, Value>,
    },
    Legacy(Map<String, Value>),
    /// Body that is not a JSON object; kept verbatim for triage
    Malformed { raw: String },
}

/// Canonical idempotency key of an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventIdentity {
    pub id: String,
    pub source: IdentitySource,
}

/// Customer correlation data carried by a payload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CustomerRef {
    pub user_id: Option<Uuid>,
    pub email: Option<String>,
    pub external_id: Option<String>,
}

/// Commercial details the processor needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDetails {
    pub product_id: Option<String>,
    pub customer: CustomerRef,
    pub amount_cents: Option<i64>,
    pub currency: String,
}

/// What the ingestion path extracts before persisting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedEvent {
    pub identity: EventIdentity,
    pub event_type: String,
    pub kind: EventKind,
    pub transaction_ref: Option<String>,
}

/// Business meaning of a provider event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Purchase,
    Renewal,
    PaymentPending,
    Refund,
    Chargeback,
    Canceled,
    Overdue,
    Expired,
    Unknown,
}

impl EventKind {
    /// Classify a provider event type string
    pub fn classify(event_type: &str) -> Self {
        let t = event_type
            .trim()
            .to_ascii_lowercase()
            .replace(['.', '-', ' '], "_");
        let has = |needles: &[&str]| needles.iter().any(|n| t.contains(n));

        if has(&["chargeback", "dispute"]) {
            EventKind::Chargeback
        } else if has(&["refund"]) {
            EventKind::Refund
        } else if has(&["refused", "declined", "rejected", "failed"]) {
            EventKind::Unknown
        } else if has(&["renew"]) {
            EventKind::Renewal
        } else if has(&["cancel"]) {
            EventKind::Canceled
        } else if has(&["late", "overdue", "past_due", "unpaid"]) {
            EventKind::Overdue
        } else if has(&["expired"]) {
            EventKind::Expired
        } else if has(&["waiting", "pending", "billet_created", "pix_created", "boleto"]) {
            EventKind::PaymentPending
        } else if has(&["approved", "paid", "purchase", "completed"]) {
            EventKind::Purchase
        } else {
            EventKind::Unknown
        }
    }

    /// Payment status an event of this kind implies, if it concerns a payment
    pub fn implied_payment_status(&self) -> Option<PaymentStatus> {
        match self {
            EventKind::Purchase | EventKind::Renewal => Some(PaymentStatus::Paid),
            EventKind::PaymentPending => Some(PaymentStatus::Pending),
            EventKind::Refund => Some(PaymentStatus::Refunded),
            EventKind::Chargeback => Some(PaymentStatus::Chargeback),
            EventKind::Canceled | EventKind::Overdue | EventKind::Expired | EventKind::Unknown => {
                None
            }
        }
    }

    /// Whether a payment row is expected to exist once this event is processed
    pub fn expects_payment(&self) -> bool {
        self.implied_payment_status().is_some()
    }

    /// Purchase-class events grant entitlements
    pub fn grants_entitlement(&self) -> bool {
        matches!(self, EventKind::Purchase | EventKind::Renewal)
    }
}

#[derive(Deserialize)]
struct EnvelopeShape<'a> {
    #[serde(borrow, default)]
    order: Option<&'a RawValue>,
}

/// Payload left on a raw event once retention has dropped the body. The row
/// keeps its identity so redeliveries still dedupe against it.
pub fn compacted_payload() -> Value {
    serde_json::json!({ "compacted": true })
}

pub fn is_compacted(payload: &Value) -> bool {
    payload.get("compacted").and_then(Value::as_bool) == Some(true)
}

/// The exact bytes the provider signs: the raw `order` object for envelope
/// bodies, the whole body otherwise.
pub fn signed_content(body: &str) -> &str {
    match serde_json::from_str::<EnvelopeShape<'_>>(body) {
        Ok(EnvelopeShape { order: Some(raw) }) if raw.get().trim_start().starts_with('{') => {
            raw.get()
        }
        _ => body,
    }
}

impl WebhookPayload {
    /// Decode a raw request body
    pub fn parse(body: &str) -> Self {
        match serde_json::from_str::<Value>(body) {
            Ok(value) => Self::detect(value).unwrap_or_else(|| WebhookPayload::Malformed {
                raw: body.to_string(),
            }),
            Err(_) => WebhookPayload::Malformed {
                raw: body.to_string(),
            },
        }
    }

    /// Decode a stored payload value
    pub fn from_stored(value: &Value) -> Self {
        if let Some(raw) = value
            .get("raw")
            .and_then(Value::as_str)
            .filter(|_| value.get("malformed").and_then(Value::as_bool) == Some(true))
        {
            return WebhookPayload::Malformed {
                raw: raw.to_string(),
            };
        }
        Self::detect(value.clone()).unwrap_or_else(|| WebhookPayload::Malformed {
            raw: value.to_string(),
        })
    }

    /// Shape detection: an object with an object-valued `order` key is an envelope
    fn detect(value: Value) -> Option<Self> {
        let Value::Object(mut root) = value else {
            return None;
        };

        match root.remove("order") {
            Some(Value::Object(order)) => {
                let signature = root
                    .get("signature")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                Some(WebhookPayload::Envelope {
                    signature,
                    order,
                    root,
                })
            }
            Some(other) => {
                root.insert("order".to_string(), other);
                Some(WebhookPayload::Legacy(root))
            }
            None => Some(WebhookPayload::Legacy(root)),
        }
    }

    /// Value persisted as the raw event payload
    pub fn to_value(&self) -> Value {
        match self {
            WebhookPayload::Envelope { order, root, .. } => {
                let mut full = root.clone();
                full.insert("order".to_string(), Value::Object(order.clone()));
                Value::Object(full)
            }
            WebhookPayload::Legacy(root) => Value::Object(root.clone()),
            WebhookPayload::Malformed { raw } => serde_json::json!({
                "malformed": true,
                "raw": raw,
            }),
        }
    }

    /// Signature embedded in an envelope body
    pub fn embedded_signature(&self) -> Option<&str> {
        match self {
            WebhookPayload::Envelope { signature, .. } => signature.as_deref(),
            _ => None,
        }
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, WebhookPayload::Malformed { .. })
    }

    /// Objects searched for fields, in priority order
    fn sources(&self) -> Vec<&Map<String, Value>> {
        match self {
            WebhookPayload::Envelope { order, root, .. } => vec![order, root],
            WebhookPayload::Legacy(root) => vec![root],
            WebhookPayload::Malformed { .. } => Vec::new(),
        }
    }

    fn first_string(&self, fields: &[&str]) -> Option<String> {
        self.sources()
            .into_iter()
            .find_map(|source| fields.iter().find_map(|f| lookup_string(source, f)))
    }

    fn first_value(&self, fields: &[&str]) -> Option<&Value> {
        self.sources()
            .into_iter()
            .find_map(|source| fields.iter().find_map(|f| lookup(source, f)))
    }

    pub fn explicit_event_id(&self) -> Option<String> {
        self.first_string(EVENT_ID_FIELDS)
    }

    pub fn transaction_id(&self) -> Option<String> {
        self.first_string(TRANSACTION_ID_FIELDS)
    }

    pub fn event_type(&self) -> String {
        self.first_string(EVENT_TYPE_FIELDS)
            .unwrap_or_else(|| DEFAULT_EVENT_TYPE.to_string())
    }

    /// Identity priority: explicit event id, then transaction id, then a
    /// content hash of the body.
    pub fn identity(&self, body: &[u8]) -> EventIdentity {
        if let Some(id) = self.explicit_event_id() {
            return EventIdentity {
                id,
                source: IdentitySource::EventId,
            };
        }
        if let Some(id) = self.transaction_id() {
            return EventIdentity {
                id,
                source: IdentitySource::TransactionId,
            };
        }
        EventIdentity {
            id: format!("{}{}", SYNTHESIZED_ID_PREFIX, hex::encode(Sha256::digest(body))),
            source: IdentitySource::Synthesized,
        }
    }

    /// Ingestion-time view of the event
    pub fn normalize(&self, body: &[u8]) -> NormalizedEvent {
        let identity = self.identity(body);
        let event_type = self.event_type();
        let transaction_ref = match identity.source {
            IdentitySource::Synthesized => None,
            _ => Some(self.transaction_id().unwrap_or_else(|| identity.id.clone())),
        };
        NormalizedEvent {
            kind: EventKind::classify(&event_type),
            identity,
            event_type,
            transaction_ref,
        }
    }

    /// Processing-time details
    pub fn details(&self) -> EventDetails {
        let user_id = self.sources().into_iter().find_map(|source| {
            USER_ID_FIELDS.iter().find_map(|f| {
                lookup_string(source, f).and_then(|s| Uuid::parse_str(s.trim()).ok())
            })
        });

        EventDetails {
            product_id: self.first_string(PRODUCT_ID_FIELDS),
            customer: CustomerRef {
                user_id,
                email: self
                    .first_string(EMAIL_FIELDS)
                    .map(|e| e.trim().to_ascii_lowercase())
                    .filter(|e| !e.is_empty()),
                external_id: self.first_string(CUSTOMER_ID_FIELDS),
            },
            amount_cents: self.amount_cents(),
            currency: self
                .first_string(CURRENCY_FIELDS)
                .map(|c| c.to_ascii_uppercase())
                .unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
        }
    }

    fn amount_cents(&self) -> Option<i64> {
        if let Some(cents) = self.first_value(&["amount_cents"]).and_then(integer_value) {
            return Some(cents);
        }
        self.first_value(AMOUNT_DECIMAL_FIELDS)
            .and_then(decimal_value)
            .map(|units| (units * 100.0).round() as i64)
    }
}

/// Dot-path lookup (`Product.product_id`)
fn lookup<'a>(obj: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = obj.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    if current.is_null() {
        None
    } else {
        Some(current)
    }
}

/// Strings are returned as-is, numbers in their JSON form; empty strings are absent
fn lookup_string(obj: &Map<String, Value>, path: &str) -> Option<String> {
    match lookup(obj, path)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn integer_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn decimal_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().replace(',', ".").parse().ok(),
        _ => None,
    }
    .filter(|v: &f64| v.is_finite())
}
