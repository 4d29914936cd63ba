use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    errors::ServiceError,
    services::{
        catalog::{CreateProductRequest, ProductResponse, UpdatePricingRequest},
        inventory::{RegisterSkuRequest, SkuStock},
    },
    ApiResponse, ApiResult, AppState,
};

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct RestockRequest {
    pub quantity: i32,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct RestockAvailabilityRequest {
    pub is_restock_available: bool,
}

/// Create a product
#[utoipa::path(
    post,
    path = "/api/v1/admin/products",
    request_body = CreateProductRequest,
    responses(
        (status = 201, description = "Product created", body = ApiResponse<ProductResponse>),
        (status = 400, description = "Invalid pricing or name", body = crate::errors::ErrorResponse),
        (status = 403, description = "Admin role required", body = crate::errors::ErrorResponse),
    ),
    security(("bearer_auth" = [])),
    tag = "catalog"
)]
pub async fn create_product(
    State(state): State<AppState>,
    Json(request): Json<CreateProductRequest>,
) -> Result<(StatusCode, Json<ApiResponse<ProductResponse>>), ServiceError> {
    let product = state.services.catalog.create_product(request).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(product))))
}

#[utoipa::path(
    get,
    path = "/api/v1/products/{id}",
    params(("id" = Uuid, Path, description = "Product id")),
    responses(
        (status = 200, description = "Product", body = ApiResponse<ProductResponse>),
        (status = 404, description = "Unknown product", body = crate::errors::ErrorResponse),
    ),
    tag = "catalog"
)]
pub async fn get_product(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<ProductResponse> {
    let product = state.services.catalog.get_product(id).await?;
    Ok(Json(ApiResponse::success(product)))
}

/// Change price or discount. Orders already placed keep their captured price.
#[utoipa::path(
    put,
    path = "/api/v1/admin/products/{id}/pricing",
    params(("id" = Uuid, Path, description = "Product id")),
    request_body = UpdatePricingRequest,
    responses(
        (status = 200, description = "Pricing updated", body = ApiResponse<ProductResponse>),
        (status = 400, description = "Invalid pricing", body = crate::errors::ErrorResponse),
        (status = 404, description = "Unknown product", body = crate::errors::ErrorResponse),
    ),
    security(("bearer_auth" = [])),
    tag = "catalog"
)]
pub async fn update_pricing(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdatePricingRequest>,
) -> ApiResult<ProductResponse> {
    let product = state.services.catalog.update_pricing(id, request).await?;
    Ok(Json(ApiResponse::success(product)))
}

#[utoipa::path(
    post,
    path = "/api/v1/admin/skus",
    request_body = RegisterSkuRequest,
    responses(
        (status = 201, description = "SKU registered", body = ApiResponse<SkuStock>),
        (status = 404, description = "Unknown product", body = crate::errors::ErrorResponse),
    ),
    security(("bearer_auth" = [])),
    tag = "inventory"
)]
pub async fn register_sku(
    State(state): State<AppState>,
    Json(request): Json<RegisterSkuRequest>,
) -> Result<(StatusCode, Json<ApiResponse<SkuStock>>), ServiceError> {
    let sku = state.services.inventory.register_sku(request).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(sku))))
}

#[utoipa::path(
    get,
    path = "/api/v1/skus/{id}",
    params(("id" = Uuid, Path, description = "SKU id")),
    responses(
        (status = 200, description = "Current stock", body = ApiResponse<SkuStock>),
        (status = 404, description = "Unknown SKU", body = crate::errors::ErrorResponse),
    ),
    tag = "inventory"
)]
pub async fn get_sku(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<SkuStock> {
    let sku = state.services.inventory.get_sku(id).await?;
    Ok(Json(ApiResponse::success(sku)))
}

#[utoipa::path(
    post,
    path = "/api/v1/admin/skus/{id}/restock",
    params(("id" = Uuid, Path, description = "SKU id")),
    request_body = RestockRequest,
    responses(
        (status = 200, description = "Stock added", body = ApiResponse<SkuStock>),
        (status = 400, description = "Quantity must be positive", body = crate::errors::ErrorResponse),
        (status = 404, description = "Unknown SKU", body = crate::errors::ErrorResponse),
    ),
    security(("bearer_auth" = [])),
    tag = "inventory"
)]
pub async fn restock(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<RestockRequest>,
) -> ApiResult<SkuStock> {
    let sku = state.services.inventory.restock(id, request.quantity).await?;
    Ok(Json(ApiResponse::success(sku)))
}

#[utoipa::path(
    put,
    path = "/api/v1/admin/skus/{id}/restock-availability",
    params(("id" = Uuid, Path, description = "SKU id")),
    request_body = RestockAvailabilityRequest,
    responses(
        (status = 200, description = "Flag updated", body = ApiResponse<SkuStock>),
        (status = 404, description = "Unknown SKU", body = crate::errors::ErrorResponse),
    ),
    security(("bearer_auth" = [])),
    tag = "inventory"
)]
pub async fn set_restock_availability(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<RestockAvailabilityRequest>,
) -> ApiResult<SkuStock> {
    let sku = state
        .services
        .inventory
        .set_restock_available(id, request.is_restock_available)
        .await?;
    Ok(Json(ApiResponse::success(sku)))
}
