use utoipa::{
    openapi::security::{Http, HttpAuthScheme, SecurityScheme},
    Modify, OpenApi,
};
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Storefront API",
        version = "1.0.0",
        description = r#"
# Storefront API

Order, payment, inventory and member backend for an online shop.

## Authentication

Protected endpoints take an access token issued by `/auth/login`, `/auth/refresh`
or the social login callback:

```
Authorization: Bearer <access-token>
```

Access tokens live 30 minutes. Refresh tokens are single use: every refresh
returns a new pair and the presented refresh token stops working.

## Payments

1. `POST /api/v1/orders` reserves stock and returns the order in `PENDING`.
2. `POST /api/v1/orders/{id}/payment` creates the provider intent (`AWAITING_PAYMENT`).
3. The provider confirms through the webhook, or the client calls `/payment/confirm`.

Responses with `"retryable": true` may be repeated safely.

## Error Handling

```json
{
  "error": "Conflict",
  "code": "insufficient_stock",
  "message": "Insufficient stock: ...",
  "retryable": false,
  "request_id": "req-abc123xyz",
  "timestamp": "2024-01-01T00:00:00Z"
}
```
        "#,
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    ),
    servers(
        (url = "http://localhost:8080", description = "Local development")
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "auth", description = "Registration, login and token lifecycle"),
        (name = "members", description = "Member profile"),
        (name = "catalog", description = "Products"),
        (name = "inventory", description = "SKU stock"),
        (name = "cart", description = "Shopping cart"),
        (name = "orders", description = "Order placement and queries"),
        (name = "payments", description = "Payment intent, confirmation and provider webhooks"),
        (name = "admin", description = "Refunds, reconciliation and order lookup for operators"),
        (name = "health", description = "Liveness and readiness")
    ),
    paths(
        // Auth
        crate::auth::register_handler,
        crate::auth::login_handler,
        crate::auth::refresh_token_handler,
        crate::auth::logout_handler,
        crate::auth::verify_email_handler,
        crate::auth::oauth2_authorize_handler,
        crate::auth::oauth2_callback_handler,

        // Members
        crate::handlers::members::me,

        // Catalog & inventory
        crate::handlers::catalog::create_product,
        crate::handlers::catalog::get_product,
        crate::handlers::catalog::update_pricing,
        crate::handlers::catalog::register_sku,
        crate::handlers::catalog::get_sku,
        crate::handlers::catalog::restock,
        crate::handlers::catalog::set_restock_availability,

        // Cart
        crate::handlers::cart::view_cart,
        crate::handlers::cart::add_item,
        crate::handlers::cart::update_item,
        crate::handlers::cart::remove_item,

        // Orders & payments
        crate::handlers::orders::place_order,
        crate::handlers::orders::checkout,
        crate::handlers::orders::list_orders,
        crate::handlers::orders::get_order,
        crate::handlers::orders::cancel_order,
        crate::handlers::orders::begin_payment,
        crate::handlers::orders::confirm_payment,
        crate::handlers::payments::payment_webhook,

        // Admin
        crate::handlers::orders::refund_order,
        crate::handlers::orders::reconcile_order,
        crate::handlers::orders::admin_get_order,
    ),
    components(
        schemas(
            crate::errors::ErrorResponse,
            crate::auth::TokenPair,
            crate::entities::order::OrderStatus,
            crate::services::orders::ShippingAddress,
            crate::services::orders::OrderLine,
        )
    )
)]
pub struct ApiDocV1;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(Http::new(HttpAuthScheme::Bearer)),
            );
        }
    }
}

pub fn swagger_ui() -> SwaggerUi {
    SwaggerUi::new("/swagger-ui")
        .url("/api-docs/openapi.json", ApiDocV1::openapi())
        .config(utoipa_swagger_ui::Config::from("/api-docs/openapi.json").try_it_out_enabled(true))
}
