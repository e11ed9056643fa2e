//! Admin finance surface
//!
//! Mounted under `/api/v1/admin/billing` behind [`require_finance_admin`].
//! Repair operations (reprocess, rebuild) are synchronous and report their
//! errors to the operator.
//!
//! [`require_finance_admin`]: crate::auth::require_finance_admin

use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use billsync_billing::reconciliation::{clamp_failed_limit, clamp_window_days};
use billsync_billing::store::{EventFilter, PaymentFilter, PaymentSummary};
use billsync_billing::{
    AuditQuery, DiscrepancyReport, ProcessingStats, ReprocessResult, SubscriptionView,
};
use billsync_shared::{AuditLog, Payment, RawEvent};

use crate::{auth::AdminUser, error::ApiResult, state::AppState};

#[derive(Debug, Default, Deserialize)]
pub struct WindowQuery {
    pub days: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentListResponse {
    pub payments: Vec<Payment>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventListResponse {
    pub events: Vec<RawEvent>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogListResponse {
    pub entries: Vec<AuditLog>,
    pub count: usize,
}

/// `GET /payments`
pub async fn list_payments(
    State(state): State<AppState>,
    Query(filter): Query<PaymentFilter>,
) -> ApiResult<Json<PaymentListResponse>> {
    let payments = state.stores.ledger.list_payments(&filter).await?;
    Ok(Json(PaymentListResponse {
        count: payments.len(),
        payments,
    }))
}

/// `GET /payments/summary`
pub async fn payment_summary(
    State(state): State<AppState>,
    Query(query): Query<WindowQuery>,
) -> ApiResult<Json<PaymentSummary>> {
    let days = clamp_window_days(query.days);
    let since = OffsetDateTime::now_utc() - Duration::days(days);
    Ok(Json(state.stores.ledger.payment_summary(since).await?))
}

/// `GET /events`
pub async fn list_events(
    State(state): State<AppState>,
    Query(filter): Query<EventFilter>,
) -> ApiResult<Json<EventListResponse>> {
    let events = state.stores.events.list_events(&filter).await?;
    Ok(Json(EventListResponse {
        count: events.len(),
        events,
    }))
}

/// `GET /discrepancies`
pub async fn discrepancies(
    State(state): State<AppState>,
    Query(query): Query<WindowQuery>,
) -> ApiResult<Json<DiscrepancyReport>> {
    let report = state
        .reconciliation
        .detect_discrepancies(clamp_window_days(query.days))
        .await?;
    Ok(Json(report))
}

/// `POST /reprocess-event/:eventId`
pub async fn reprocess_event(
    State(state): State<AppState>,
    Extension(admin): Extension<AdminUser>,
    Path(event_id): Path<String>,
) -> ApiResult<Json<ReprocessResult>> {
    tracing::info!(event_id = %event_id, admin = %admin.user_id, "Operator reprocess requested");
    let result = state
        .reconciliation
        .reprocess_event(&event_id, admin.actor())
        .await?;
    Ok(Json(result))
}

/// `POST /rebuild-payment/:eventId`
pub async fn rebuild_payment(
    State(state): State<AppState>,
    Extension(admin): Extension<AdminUser>,
    Path(event_id): Path<String>,
) -> ApiResult<Json<Payment>> {
    tracing::info!(event_id = %event_id, admin = %admin.user_id, "Operator payment rebuild requested");
    let payment = state
        .reconciliation
        .rebuild_payment_from_event(&event_id, admin.actor())
        .await?;
    Ok(Json(payment))
}

/// `GET /failed-events`
pub async fn failed_events(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<EventListResponse>> {
    let events = state
        .reconciliation
        .failed_events(clamp_failed_limit(query.limit))
        .await?;
    Ok(Json(EventListResponse {
        count: events.len(),
        events,
    }))
}

/// `GET /processing-stats`
pub async fn processing_stats(
    State(state): State<AppState>,
    Query(query): Query<WindowQuery>,
) -> ApiResult<Json<ProcessingStats>> {
    let stats = state
        .reconciliation
        .processing_stats(clamp_window_days(query.days))
        .await?;
    Ok(Json(stats))
}

/// `GET /audit-logs`
pub async fn audit_logs(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> ApiResult<Json<AuditLogListResponse>> {
    let entries = state.audit().query(&query).await?;
    Ok(Json(AuditLogListResponse {
        count: entries.len(),
        entries,
    }))
}

/// `GET /subscriptions/:userId`
pub async fn subscription_status(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<SubscriptionView>> {
    Ok(Json(state.entitlements.subscription_view(user_id).await?))
}
