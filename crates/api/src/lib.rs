//! billsync API Library
//!
//! HTTP surface for the billing pipeline: provider webhook receiver, health
//! checks and the finance admin routes.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
