//! API routes

pub mod admin_billing;
pub mod health;
pub mod webhooks;

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};

use crate::{auth::require_finance_admin, state::AppState};

/// Largest webhook body accepted. Anything bigger is answered with 413
/// before signature verification and is never stored.
pub const MAX_WEBHOOK_BODY_BYTES: usize = 1024 * 1024;

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/webhooks/health", get(health::webhook_health));

    // Provider webhooks (public, signature-verified)
    let webhook_routes = Router::new()
        .route("/webhooks/:provider", post(webhooks::receive))
        .layer(DefaultBodyLimit::max(MAX_WEBHOOK_BODY_BYTES));

    // Finance admin routes (admin JWT with the finance permission)
    let admin_billing_routes = Router::new()
        .route("/payments", get(admin_billing::list_payments))
        .route("/payments/summary", get(admin_billing::payment_summary))
        .route("/events", get(admin_billing::list_events))
        .route("/discrepancies", get(admin_billing::discrepancies))
        .route("/reprocess-event/:event_id", post(admin_billing::reprocess_event))
        .route("/rebuild-payment/:event_id", post(admin_billing::rebuild_payment))
        .route("/failed-events", get(admin_billing::failed_events))
        .route("/processing-stats", get(admin_billing::processing_stats))
        .route("/audit-logs", get(admin_billing::audit_logs))
        .route("/subscriptions/:user_id", get(admin_billing::subscription_status))
        .layer(middleware::from_fn_with_state(
            state.jwt_manager.clone(),
            require_finance_admin,
        ));

    Router::new()
        .merge(health_routes)
        .merge(webhook_routes)
        .nest("/api/v1/admin/billing", admin_billing_routes)
        .with_state(state)
}
