use axum::{
    extract::{Path, State},
    response::Json,
};
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    services::cart::{AddCartItemRequest, CartView, UpdateCartItemRequest},
    ApiResponse, ApiResult, AppState,
};

#[utoipa::path(
    get,
    path = "/api/v1/cart",
    responses(
        (status = 200, description = "Cart priced at current sale prices", body = ApiResponse<CartView>),
        (status = 401, description = "Not authenticated", body = crate::errors::ErrorResponse),
    ),
    security(("bearer_auth" = [])),
    tag = "cart"
)]
pub async fn view_cart(State(state): State<AppState>, user: AuthUser) -> ApiResult<CartView> {
    let cart = state.services.cart.view(user.member_id).await?;
    Ok(Json(ApiResponse::success(cart)))
}

/// Add a SKU; quantities for a SKU already in the cart are merged
#[utoipa::path(
    post,
    path = "/api/v1/cart/items",
    request_body = AddCartItemRequest,
    responses(
        (status = 200, description = "Updated cart", body = ApiResponse<CartView>),
        (status = 400, description = "Invalid quantity", body = crate::errors::ErrorResponse),
        (status = 404, description = "Unknown SKU", body = crate::errors::ErrorResponse),
    ),
    security(("bearer_auth" = [])),
    tag = "cart"
)]
pub async fn add_item(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<AddCartItemRequest>,
) -> ApiResult<CartView> {
    let cart = state.services.cart.add_item(user.member_id, request).await?;
    Ok(Json(ApiResponse::success(cart)))
}

#[utoipa::path(
    put,
    path = "/api/v1/cart/items/{sku_id}",
    params(("sku_id" = Uuid, Path, description = "SKU in the cart")),
    request_body = UpdateCartItemRequest,
    responses(
        (status = 200, description = "Updated cart", body = ApiResponse<CartView>),
        (status = 404, description = "SKU not in cart", body = crate::errors::ErrorResponse),
    ),
    security(("bearer_auth" = [])),
    tag = "cart"
)]
pub async fn update_item(
    State(state): State<AppState>,
    user: AuthUser,
    Path(sku_id): Path<Uuid>,
    Json(request): Json<UpdateCartItemRequest>,
) -> ApiResult<CartView> {
    let cart = state
        .services
        .cart
        .update_quantity(user.member_id, sku_id, request)
        .await?;
    Ok(Json(ApiResponse::success(cart)))
}

#[utoipa::path(
    delete,
    path = "/api/v1/cart/items/{sku_id}",
    params(("sku_id" = Uuid, Path, description = "SKU in the cart")),
    responses(
        (status = 200, description = "Updated cart", body = ApiResponse<CartView>),
        (status = 404, description = "SKU not in cart", body = crate::errors::ErrorResponse),
    ),
    security(("bearer_auth" = [])),
    tag = "cart"
)]
pub async fn remove_item(
    State(state): State<AppState>,
    user: AuthUser,
    Path(sku_id): Path<Uuid>,
) -> ApiResult<CartView> {
    let cart = state.services.cart.remove_item(user.member_id, sku_id).await?;
    Ok(Json(ApiResponse::success(cart)))
}
