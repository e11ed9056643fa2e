#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! billsync billing pipeline
//!
//! Turns provider webhooks into ledger state:
//! - `signature` / `payload`: validate and normalize a delivery
//! - `ingest`: record it idempotently and hand it to the `dispatch` queue
//! - `processor`: map products, resolve users, and commit payments,
//!   subscriptions and grants as one unit
//! - `reconciliation`: compare events against the ledger and repair drift
//! - `audit`: append-only trail of everything above
//!
//! Persistence sits behind the traits in `store`, with Postgres and
//! in-memory implementations.

pub mod audit;
pub mod dispatch;
pub mod entitlement;
pub mod error;
pub mod ingest;
pub mod payload;
pub mod processor;
pub mod reconciliation;
pub mod signature;
pub mod store;

pub use audit::{Actor, AuditAction, AuditLogger, AuditQuery, NewAuditEntry};
pub use dispatch::{DispatchOutcome, DispatchWorker, Dispatcher};
pub use entitlement::{EntitlementService, SubscriptionView};
pub use error::{BillingError, BillingResult};
pub use ingest::{IngestOutcome, WebhookDelivery, WebhookIngestor};
pub use payload::{EventKind, WebhookPayload};
pub use processor::{EventProcessor, ProcessOutcome, ProcessTrigger, ProcessorConfig, SweepReport};
pub use reconciliation::{DiscrepancyReport, ProcessingStats, ReconciliationEngine, ReprocessResult};
pub use signature::{SignatureError, SignatureVerifier};
pub use store::{MemoryStore, PgStore, Stores};
