use axum::{extract::State, response::Json};
use serde::Serialize;
use utoipa::ToSchema;

use crate::{
    services::{gateway::WebhookNotification, payments::WebhookOutcome},
    ApiResponse, ApiResult, AppState,
};

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct WebhookAck {
    pub outcome: WebhookOutcome,
}

/// Payment provider callback.
///
/// Unauthenticated; the body carries an HMAC signature that must verify
/// against the shared webhook secret. Replays are acknowledged without
/// effect so the provider stops retrying.
#[utoipa::path(
    post,
    path = "/api/v1/payments/webhook",
    request_body = WebhookNotification,
    responses(
        (status = 200, description = "Webhook accepted", body = ApiResponse<WebhookAck>),
        (status = 401, description = "Invalid signature", body = crate::errors::ErrorResponse),
        (status = 400, description = "Invalid payload", body = crate::errors::ErrorResponse),
        (status = 422, description = "Paid amount differs from the order total", body = crate::errors::ErrorResponse),
    ),
    tag = "payments"
)]
pub async fn payment_webhook(
    State(state): State<AppState>,
    Json(notification): Json<WebhookNotification>,
) -> ApiResult<WebhookAck> {
    let outcome = state.services.payments.handle_webhook(notification).await?;
    Ok(Json(ApiResponse::success(WebhookAck { outcome })))
}
