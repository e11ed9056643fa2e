//! Provider webhook receiver
//!
//! Only signature and timestamp failures answer with a non-200 status.
//! Everything else, including a store outage, is acknowledged so the provider
//! does not enter a retry storm; the event arrives again on its next retry.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use billsync_billing::{IngestOutcome, WebhookDelivery};

use crate::state::AppState;

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// `POST /webhooks/:provider`
pub async fn receive(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !provider.eq_ignore_ascii_case(&state.config.provider_name) {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": "unknown_provider",
                "message": format!("No webhook receiver for provider '{}'", provider),
            })),
        )
            .into_response();
    }

    let body = String::from_utf8_lossy(&body);
    let signature_header = format!("x-{}-signature", state.config.provider_name);
    let timestamp_header = format!("x-{}-timestamp", state.config.provider_name);

    let delivery = WebhookDelivery {
        body: &body,
        signature_header: header(&headers, &signature_header),
        timestamp_header: header(&headers, &timestamp_header),
    };

    match state.ingestor.ingest(delivery).await {
        Ok(IngestOutcome::Accepted { event_id, dispatch }) => {
            tracing::info!(event_id = %event_id, dispatch = ?dispatch, "Webhook accepted");
            (
                StatusCode::OK,
                Json(json!({
                    "success": true,
                    "message": "Webhook received",
                    "eventId": event_id,
                })),
            )
                .into_response()
        }
        Ok(IngestOutcome::AlreadyProcessed { event_id }) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "message": "Event already processed",
                "eventId": event_id,
            })),
        )
            .into_response(),
        Ok(IngestOutcome::Deferred { event_id, error }) => {
            tracing::error!(event_id = %event_id, error = %error, "Webhook acknowledged without persistence");
            (
                StatusCode::OK,
                Json(json!({
                    "success": false,
                    "message": "Webhook received, processing may be delayed",
                    "eventId": event_id,
                })),
            )
                .into_response()
        }
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": e.code(),
                "message": e.to_string(),
            })),
        )
            .into_response(),
    }
}
