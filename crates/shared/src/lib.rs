#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! billsync shared types and utilities
//!
//! Domain records for the billing-event pipeline (raw provider events,
//! payments, subscriptions, product mappings, audit entries) plus database
//! pool helpers shared by the API server and the worker.

pub mod db;
pub mod error;
pub mod types;

pub use db::*;
pub use error::*;
pub use types::*;
