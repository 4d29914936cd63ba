//! Storefront API Library
//!
//! Order, payment, inventory and authentication backend for an online
//! storefront. The HTTP surface lives in [`handlers`] and [`auth`]; the
//! consistency rules live in [`services`].
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod auth;
pub mod circuit_breaker;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod migrator;
pub mod openapi;
pub mod services;
pub mod tracing;

use axum::{
    extract::{DefaultBodyLimit, State},
    middleware,
    response::Json,
    routing::{get, post, put},
    Extension, Router,
};
use chrono::Utc;
use sea_orm::DatabaseConnection;
use serde::Serialize;
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};
use tower_http::{compression::CompressionLayer, timeout::TimeoutLayer};
use utoipa::ToSchema;

use crate::auth::{oauth2::OAuth2Service, AuthRouterExt, AuthService, ROLE_ADMIN};

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: config::AppConfig,
    pub event_sender: Option<Arc<events::EventSender>>,
    pub services: handlers::AppServices,
    pub auth: Arc<AuthService>,
    pub oauth2: Arc<OAuth2Service>,
}

// Common response wrappers
#[derive(Serialize, ToSchema)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ResponseMeta>,
}

#[derive(Serialize, ToSchema)]
pub struct ResponseMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: String,
}

impl ResponseMeta {
    fn capture() -> Self {
        Self {
            request_id: crate::tracing::current_request_id().map(|rid| rid.as_str().to_string()),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            meta: Some(ResponseMeta::capture()),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message),
            meta: Some(ResponseMeta::capture()),
        }
    }
}

#[cfg(test)]
mod response_tests {
    use super::*;
    use chrono::DateTime;

    #[tokio::test]
    async fn success_response_includes_request_metadata() {
        let response =
            crate::tracing::scope_request_id(crate::tracing::RequestId::new("meta-123"), async {
                ApiResponse::success("ok")
            })
            .await;

        let meta = response.meta.expect("metadata expected");
        assert_eq!(meta.request_id.as_deref(), Some("meta-123"));
        DateTime::parse_from_rfc3339(&meta.timestamp).expect("timestamp should parse");
    }

    #[tokio::test]
    async fn error_response_includes_request_metadata() {
        let response =
            crate::tracing::scope_request_id(crate::tracing::RequestId::new("meta-err"), async {
                ApiResponse::<()>::error("oops".into())
            })
            .await;

        assert!(!response.success);
        let meta = response.meta.expect("metadata expected");
        assert_eq!(meta.request_id.as_deref(), Some("meta-err"));
        assert!(!meta.timestamp.is_empty());
    }
}

/// Standard API result type for JSON responses
pub type ApiResult<T> = Result<Json<ApiResponse<T>>, errors::ServiceError>;

/// Versioned API routes, mounted under `/api/v1`
pub fn api_v1_routes() -> Router<AppState> {
    let public = Router::new()
        .route("/products/:id", get(handlers::catalog::get_product))
        .route("/skus/:id", get(handlers::catalog::get_sku))
        // Provider callbacks authenticate by signature, not by token
        .route("/payments/webhook", post(handlers::payments::payment_webhook));

    let members = Router::new()
        .route("/members/me", get(handlers::members::me))
        .route("/cart", get(handlers::cart::view_cart))
        .route("/cart/items", post(handlers::cart::add_item))
        .route(
            "/cart/items/:sku_id",
            put(handlers::cart::update_item).delete(handlers::cart::remove_item),
        )
        .route("/cart/checkout", post(handlers::orders::checkout))
        .route(
            "/orders",
            get(handlers::orders::list_orders).post(handlers::orders::place_order),
        )
        .route("/orders/:id", get(handlers::orders::get_order))
        .route("/orders/:id/cancel", post(handlers::orders::cancel_order))
        .route("/orders/:id/payment", post(handlers::orders::begin_payment))
        .route(
            "/orders/:id/payment/confirm",
            post(handlers::orders::confirm_payment),
        )
        .with_auth();

    let admin = Router::new()
        .route("/admin/products", post(handlers::catalog::create_product))
        .route(
            "/admin/products/:id/pricing",
            put(handlers::catalog::update_pricing),
        )
        .route("/admin/skus", post(handlers::catalog::register_sku))
        .route("/admin/skus/:id/restock", post(handlers::catalog::restock))
        .route(
            "/admin/skus/:id/restock-availability",
            put(handlers::catalog::set_restock_availability),
        )
        .route("/admin/orders/:id", get(handlers::orders::admin_get_order))
        .route(
            "/admin/orders/:id/refund",
            post(handlers::orders::refund_order),
        )
        .route(
            "/admin/orders/:id/reconcile",
            post(handlers::orders::reconcile_order),
        )
        .with_role(ROLE_ADMIN);

    Router::new()
        .route("/status", get(api_status))
        .merge(public)
        .merge(members)
        .merge(admin)
}

/// Full application router with the shared middleware stack
pub fn build_router(state: AppState) -> Router {
    let request_timeout = Duration::from_secs(state.config.request_timeout_secs);
    let max_body_size = state.config.max_body_size;
    let auth = state.auth.clone();

    Router::new()
        .route("/health", get(health_check))
        .route("/health/ready", get(readiness_check))
        .nest("/api/v1", api_v1_routes())
        .nest("/auth", auth::auth_routes())
        .merge(openapi::swagger_ui())
        .layer(DefaultBodyLimit::max(max_body_size))
        .layer(crate::tracing::configure_http_tracing())
        .layer(CompressionLayer::new())
        .layer(TimeoutLayer::new(request_timeout))
        // Inject AuthService into request extensions for auth middleware
        .layer(Extension(auth))
        // Ensure every request carries a request id for traceability
        .layer(middleware::from_fn(crate::tracing::request_id_middleware))
        .with_state(state)
}

async fn api_status() -> Result<Json<ApiResponse<Value>>, errors::ServiceError> {
    let status_data = json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "storefront-api",
        "timestamp": Utc::now().to_rfc3339(),
    });

    Ok(Json(ApiResponse::success(status_data)))
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn readiness_check(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Value>>, errors::ServiceError> {
    db::check_connection(&state.db).await?;

    Ok(Json(ApiResponse::success(json!({
        "status": "ready",
        "checks": { "database": "healthy" },
        "timestamp": Utc::now().to_rfc3339(),
    }))))
}
