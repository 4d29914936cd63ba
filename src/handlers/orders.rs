use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use uuid::Uuid;

use super::ensure_owner;
use crate::{
    auth::AuthUser,
    errors::ServiceError,
    services::{
        orders::{
            CheckoutRequest, OrderDetails, OrderSummary, PaymentConfirmation, PaymentIntent,
            PlaceOrderRequest, PlacedOrder, RefundOutcome,
        },
        payments::{CancelOrderRequest, ReconcileOutcome, RefundRequest},
    },
    ApiResponse, ApiResult, AppState,
};

async fn owned_order(state: &AppState, user: &AuthUser, id: Uuid) -> Result<(), ServiceError> {
    let order = state.services.orders.find_order(id).await?;
    ensure_owner(user, order.member_id)
}

/// Place an order for explicit lines
#[utoipa::path(
    post,
    path = "/api/v1/orders",
    request_body = PlaceOrderRequest,
    responses(
        (status = 201, description = "Order placed and stock reserved", body = ApiResponse<PlacedOrder>),
        (status = 400, description = "Invalid lines or address", body = crate::errors::ErrorResponse),
        (status = 409, description = "Insufficient stock", body = crate::errors::ErrorResponse),
    ),
    security(("bearer_auth" = [])),
    tag = "orders"
)]
pub async fn place_order(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<PlaceOrderRequest>,
) -> Result<(StatusCode, Json<ApiResponse<PlacedOrder>>), ServiceError> {
    let placed = state
        .services
        .orders
        .place_order(user.member_id, request)
        .await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(placed))))
}

/// Turn cart lines into an order
#[utoipa::path(
    post,
    path = "/api/v1/cart/checkout",
    request_body = CheckoutRequest,
    responses(
        (status = 201, description = "Order placed from the cart", body = ApiResponse<PlacedOrder>),
        (status = 400, description = "Nothing selected in the cart", body = crate::errors::ErrorResponse),
        (status = 409, description = "Insufficient stock", body = crate::errors::ErrorResponse),
    ),
    security(("bearer_auth" = [])),
    tag = "orders"
)]
pub async fn checkout(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<CheckoutRequest>,
) -> Result<(StatusCode, Json<ApiResponse<PlacedOrder>>), ServiceError> {
    let placed = state.services.orders.checkout(user.member_id, request).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(placed))))
}

#[utoipa::path(
    get,
    path = "/api/v1/orders",
    responses(
        (status = 200, description = "The caller's orders, newest first", body = ApiResponse<Vec<OrderSummary>>),
    ),
    security(("bearer_auth" = [])),
    tag = "orders"
)]
pub async fn list_orders(
    State(state): State<AppState>,
    user: AuthUser,
) -> ApiResult<Vec<OrderSummary>> {
    let orders = state
        .services
        .orders
        .list_member_orders(user.member_id)
        .await?;
    Ok(Json(ApiResponse::success(orders)))
}

#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}",
    params(("id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "Order with lines, payments and refunds", body = ApiResponse<OrderDetails>),
        (status = 403, description = "Order belongs to another member", body = crate::errors::ErrorResponse),
        (status = 404, description = "Unknown order", body = crate::errors::ErrorResponse),
    ),
    security(("bearer_auth" = [])),
    tag = "orders"
)]
pub async fn get_order(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> ApiResult<OrderDetails> {
    let details = state.services.orders.get_order(id).await?;
    ensure_owner(&user, details.summary.member_id)?;
    Ok(Json(ApiResponse::success(details)))
}

/// Cancel an order. Paid orders are cancelled with the provider first.
#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/cancel",
    params(("id" = Uuid, Path, description = "Order id")),
    request_body = CancelOrderRequest,
    responses(
        (status = 200, description = "Order cancelled", body = ApiResponse<OrderSummary>),
        (status = 409, description = "Order can no longer be cancelled", body = crate::errors::ErrorResponse),
        (status = 502, description = "Provider unavailable, retry", body = crate::errors::ErrorResponse),
    ),
    security(("bearer_auth" = [])),
    tag = "orders"
)]
pub async fn cancel_order(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    request: Option<Json<CancelOrderRequest>>,
) -> ApiResult<OrderSummary> {
    owned_order(&state, &user, id).await?;
    let Json(request) = request.unwrap_or_default();
    let order = state
        .services
        .payments
        .cancel_order(id, request.reason)
        .await?;
    Ok(Json(ApiResponse::success(order.into())))
}

/// Start payment and obtain the intent for the provider's checkout widget
#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/payment",
    params(("id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "Payment intent", body = ApiResponse<PaymentIntent>),
        (status = 409, description = "Order is not payable", body = crate::errors::ErrorResponse),
        (status = 502, description = "Provider unavailable, retry", body = crate::errors::ErrorResponse),
    ),
    security(("bearer_auth" = [])),
    tag = "payments"
)]
pub async fn begin_payment(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> ApiResult<PaymentIntent> {
    owned_order(&state, &user, id).await?;
    let intent = state.services.payments.begin_payment(id).await?;
    Ok(Json(ApiResponse::success(intent)))
}

/// Called by the client once the provider widget reports success
#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/payment/confirm",
    params(("id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "Payment applied", body = ApiResponse<PaymentConfirmation>),
        (status = 409, description = "Order is not awaiting payment", body = crate::errors::ErrorResponse),
        (status = 422, description = "Captured amount differs from the order total", body = crate::errors::ErrorResponse),
        (status = 502, description = "Provider unavailable, retry", body = crate::errors::ErrorResponse),
    ),
    security(("bearer_auth" = [])),
    tag = "payments"
)]
pub async fn confirm_payment(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> ApiResult<PaymentConfirmation> {
    owned_order(&state, &user, id).await?;
    let confirmation = state.services.payments.confirm_client_payment(id).await?;
    Ok(Json(ApiResponse::success(confirmation)))
}

/// Refund part or all of a paid order
#[utoipa::path(
    post,
    path = "/api/v1/admin/orders/{id}/refund",
    params(("id" = Uuid, Path, description = "Order id")),
    request_body = RefundRequest,
    responses(
        (status = 200, description = "Refund applied", body = ApiResponse<RefundOutcome>),
        (status = 409, description = "Order is not paid", body = crate::errors::ErrorResponse),
        (status = 422, description = "Refund exceeds the refundable amount", body = crate::errors::ErrorResponse),
        (status = 502, description = "Provider unavailable, retry", body = crate::errors::ErrorResponse),
    ),
    security(("bearer_auth" = [])),
    tag = "admin"
)]
pub async fn refund_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<RefundRequest>,
) -> ApiResult<RefundOutcome> {
    let outcome = state.services.payments.refund(id, request).await?;
    Ok(Json(ApiResponse::success(outcome)))
}

/// Re-check an order's payment with the provider
#[utoipa::path(
    post,
    path = "/api/v1/admin/orders/{id}/reconcile",
    params(("id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "Reconciliation result", body = ApiResponse<ReconcileOutcome>),
        (status = 502, description = "Provider unavailable, retry", body = crate::errors::ErrorResponse),
    ),
    security(("bearer_auth" = [])),
    tag = "admin"
)]
pub async fn reconcile_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<ReconcileOutcome> {
    let outcome = state.services.payments.reconcile(id).await?;
    Ok(Json(ApiResponse::success(outcome)))
}

#[utoipa::path(
    get,
    path = "/api/v1/admin/orders/{id}",
    params(("id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "Any member's order", body = ApiResponse<OrderDetails>),
        (status = 404, description = "Unknown order", body = crate::errors::ErrorResponse),
    ),
    security(("bearer_auth" = [])),
    tag = "admin"
)]
pub async fn admin_get_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<OrderDetails> {
    let details = state.services.orders.get_order(id).await?;
    Ok(Json(ApiResponse::success(details)))
}
