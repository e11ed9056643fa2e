//! Admin authentication middleware

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};
use uuid::Uuid;

use billsync_billing::Actor;

use super::jwt::{JwtManager, FINANCE_PERMISSION};
use crate::error::ApiError;

/// Authenticated operator, inserted into request extensions
#[derive(Debug, Clone)]
pub struct AdminUser {
    pub user_id: Uuid,
    pub email: String,
    pub role: String,
}

impl AdminUser {
    pub fn actor(&self) -> Actor {
        Actor::Admin(self.user_id)
    }
}

fn extract_bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Require an admin token carrying the `finance` permission
pub async fn require_finance_admin(
    State(jwt): State<JwtManager>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let Some(token) = extract_bearer_token(&request) else {
        tracing::warn!(path = %path, "Admin request without bearer token");
        return ApiError::Unauthorized.into_response();
    };

    let claims = match jwt.validate_token(token) {
        Ok(claims) => claims,
        Err(e) => {
            tracing::warn!(path = %path, error = %e, "Admin token rejected");
            return ApiError::InvalidToken.into_response();
        }
    };

    if !claims.is_admin() || !claims.has_permission(FINANCE_PERMISSION) {
        tracing::warn!(
            path = %path,
            user_id = %claims.sub,
            role = %claims.role,
            "Admin lacks finance permission"
        );
        return ApiError::Forbidden.into_response();
    }

    tracing::debug!(path = %path, user_id = %claims.sub, "Finance admin authenticated");
    request.extensions_mut().insert(AdminUser {
        user_id: claims.sub,
        email: claims.email,
        role: claims.role,
    });
    next.run(request).await
}
