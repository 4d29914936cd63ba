mod common;

use axum::http::{Method, StatusCode};
use common::{body_json, signed_webhook, TestApp};
use serde_json::{json, Value};
use uuid::Uuid;

fn address_json() -> Value {
    json!({
        "recipient_name": "Kim Minji",
        "recipient_phone": "010-1234-5678",
        "zip_code": "06236",
        "address": "Teheran-ro 152, Gangnam-gu"
    })
}

async fn place_via_api(app: &TestApp, token: &str, sku_id: Uuid, quantity: i32) -> Value {
    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(json!({
                "lines": [{ "sku_id": sku_id, "quantity": quantity }],
                "shipping_address": address_json()
            })),
            Some(token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    body_json(response).await
}

#[tokio::test]
async fn health_endpoints_respond() {
    let app = TestApp::new().await;

    let response = app.request(Method::GET, "/health", None, None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "ok");

    let response = app.request(Method::GET, "/health/ready", None, None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["data"]["status"], "ready");

    let response = app.request(Method::GET, "/api/v1/status", None, None).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn responses_carry_a_request_id() {
    let app = TestApp::new().await;
    let response = app.request(Method::GET, "/health", None, None).await;
    assert!(response.headers().contains_key("x-request-id"));
}

#[tokio::test]
async fn member_routes_require_a_token() {
    let app = TestApp::new().await;

    for (method, uri) in [
        (Method::GET, "/api/v1/members/me"),
        (Method::GET, "/api/v1/cart"),
        (Method::GET, "/api/v1/orders"),
    ] {
        let response = app.request(method, uri, None, None).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{}", uri);
        let body = body_json(response).await;
        assert_eq!(body["code"], "AUTH_MISSING_TOKEN");
    }

    let response = app
        .request(Method::GET, "/api/v1/orders", None, Some("not-a-jwt"))
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn catalog_reads_are_public() {
    let app = TestApp::new().await;
    let sku = app.seed_sku(20_000, 25, 3).await;

    let response = app
        .request(Method::GET, &format!("/api/v1/skus/{}", sku.id), None, None)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["data"]["product_stock"], 3);

    let response = app
        .request(
            Method::GET,
            &format!("/api/v1/products/{}", sku.product_id),
            None,
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["data"]["sale_price"], 15_000);

    let response = app
        .request(
            Method::GET,
            &format!("/api/v1/skus/{}", Uuid::new_v4()),
            None,
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn order_lifecycle_over_http() {
    let app = TestApp::new().await;
    let (_, tokens) = app.member_with_tokens("buyer@shop.test").await;
    let sku = app.seed_sku(12_000, 0, 5).await;

    let placed = place_via_api(&app, &tokens.access_token, sku.id, 2).await;
    assert_eq!(placed["data"]["status"], "PENDING");
    assert_eq!(placed["data"]["total_price"], 24_000);
    let order_id = placed["data"]["order_id"].as_str().unwrap().to_string();

    let response = app
        .request(
            Method::POST,
            &format!("/api/v1/orders/{}/payment", order_id),
            None,
            Some(&tokens.access_token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["data"]["amount"], 24_000);

    let response = app
        .request(
            Method::POST,
            &format!("/api/v1/orders/{}/payment/confirm", order_id),
            None,
            Some(&tokens.access_token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["data"]["status"], "PAID");

    let response = app
        .request(
            Method::GET,
            &format!("/api/v1/orders/{}", order_id),
            None,
            Some(&tokens.access_token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let details = body_json(response).await;
    assert_eq!(details["data"]["status"], "PAID");
    assert_eq!(details["data"]["paid_amount"], 24_000);
    assert_eq!(details["data"]["lines"][0]["quantity"], 2);

    let response = app
        .request(Method::GET, "/api/v1/orders", None, Some(&tokens.access_token))
        .await;
    let listed = body_json(response).await;
    assert_eq!(listed["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn other_members_cannot_touch_an_order() {
    let app = TestApp::new().await;
    let (_, owner) = app.member_with_tokens("owner@shop.test").await;
    let (_, stranger) = app.member_with_tokens("stranger@shop.test").await;
    let sku = app.seed_sku(12_000, 0, 5).await;

    let placed = place_via_api(&app, &owner.access_token, sku.id, 1).await;
    let order_id = placed["data"]["order_id"].as_str().unwrap().to_string();

    let response = app
        .request(
            Method::GET,
            &format!("/api/v1/orders/{}", order_id),
            None,
            Some(&stranger.access_token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .request(
            Method::POST,
            &format!("/api/v1/orders/{}/cancel", order_id),
            None,
            Some(&stranger.access_token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(app.stock_of(sku.id).await.product_stock, 4);

    let admin = app.admin_token().await;
    let response = app
        .request(
            Method::GET,
            &format!("/api/v1/admin/orders/{}", order_id),
            None,
            Some(&admin),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn sold_out_sku_answers_conflict() {
    let app = TestApp::new().await;
    let (_, tokens) = app.member_with_tokens("buyer@shop.test").await;
    let sku = app.seed_sku(12_000, 0, 1).await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(json!({
                "lines": [{ "sku_id": sku.id, "quantity": 2 }],
                "shipping_address": address_json()
            })),
            Some(&tokens.access_token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(response).await["code"], "insufficient_stock");
}

#[tokio::test]
async fn cancel_without_body_uses_no_reason() {
    let app = TestApp::new().await;
    let (_, tokens) = app.member_with_tokens("buyer@shop.test").await;
    let sku = app.seed_sku(12_000, 0, 2).await;
    let placed = place_via_api(&app, &tokens.access_token, sku.id, 2).await;
    let order_id = placed["data"]["order_id"].as_str().unwrap().to_string();

    let response = app
        .request(
            Method::POST,
            &format!("/api/v1/orders/{}/cancel", order_id),
            None,
            Some(&tokens.access_token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["data"]["status"], "CANCELLED");
    assert_eq!(app.stock_of(sku.id).await.product_stock, 2);
}

#[tokio::test]
async fn webhook_over_http() {
    let app = TestApp::new().await;
    let (member, _) = app.member_with_tokens("buyer@shop.test").await;
    let sku = app.seed_sku(9_900, 0, 2).await;
    let placed = app
        .place(
            member.id,
            vec![storefront_api::services::orders::OrderLine {
                sku_id: sku.id,
                quantity: 1,
            }],
        )
        .await;
    let notification = signed_webhook("imp_http", placed.order_id, 9_900, "paid");
    let payload = serde_json::to_value(&notification).unwrap();

    let response = app
        .request(
            Method::POST,
            "/api/v1/payments/webhook",
            Some(payload.clone()),
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["data"]["outcome"], "applied");

    let response = app
        .request(Method::POST, "/api/v1/payments/webhook", Some(payload), None)
        .await;
    assert_eq!(body_json(response).await["data"]["outcome"], "already_applied");

    let mut forged = notification.clone();
    forged.signature = "00".repeat(32);
    let response = app
        .request(
            Method::POST,
            "/api/v1/payments/webhook",
            Some(serde_json::to_value(&forged).unwrap()),
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn admin_refund_over_http() {
    let app = TestApp::new().await;
    let admin = app.admin_token().await;
    let sku = app.seed_sku(10_000, 0, 1).await;
    let placed = app
        .place(
            Uuid::new_v4(),
            vec![storefront_api::services::orders::OrderLine {
                sku_id: sku.id,
                quantity: 1,
            }],
        )
        .await;
    app.state
        .services
        .orders
        .confirm_payment(placed.order_id, "imp_admin", 10_000)
        .await
        .unwrap();
    let uri = format!("/api/v1/admin/orders/{}/refund", placed.order_id);

    let response = app
        .request(
            Method::POST,
            &uri,
            Some(json!({ "amount": 4000, "reason": "late delivery" })),
            Some(&admin),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"]["status"], "PAID");
    assert_eq!(body["data"]["refundable_amount"], 6_000);

    let response = app
        .request(Method::POST, &uri, Some(json!({ "amount": 6001 })), Some(&admin))
        .await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body_json(response).await["code"], "refund_exceeds_paid");
}

#[tokio::test]
async fn cart_checkout_over_http() {
    let app = TestApp::new().await;
    let (_, tokens) = app.member_with_tokens("buyer@shop.test").await;
    let sku = app.seed_sku(3_000, 0, 10).await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/cart/items",
            Some(json!({ "sku_id": sku.id, "quantity": 2 })),
            Some(&tokens.access_token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .request(
            Method::PUT,
            &format!("/api/v1/cart/items/{}", sku.id),
            Some(json!({ "quantity": 4 })),
            Some(&tokens.access_token),
        )
        .await;
    assert_eq!(body_json(response).await["data"]["total_price"], 12_000);

    let response = app
        .request(
            Method::POST,
            "/api/v1/cart/checkout",
            Some(json!({ "shipping_address": address_json() })),
            Some(&tokens.access_token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(body_json(response).await["data"]["total_price"], 12_000);

    let response = app
        .request(Method::GET, "/api/v1/cart", None, Some(&tokens.access_token))
        .await;
    let cart = body_json(response).await;
    assert!(cart["data"]["lines"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn openapi_document_is_served() {
    let app = TestApp::new().await;
    let response = app
        .request(Method::GET, "/api-docs/openapi.json", None, None)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let doc = body_json(response).await;
    assert!(doc["paths"]["/api/v1/orders"].is_object());
}
