mod common;

use assert_matches::assert_matches;
use common::{address, TestApp};
use rstest::rstest;
use storefront_api::{
    entities::order::OrderStatus,
    errors::ServiceError,
    services::{
        cart::AddCartItemRequest,
        catalog::UpdatePricingRequest,
        orders::{CheckoutRequest, OrderLine},
        payments::RefundRequest,
    },
};
use uuid::Uuid;

#[tokio::test]
async fn total_is_captured_at_order_time() {
    let app = TestApp::new().await;
    let sku = app.seed_sku(10_000, 10, 10).await;

    let placed = app
        .place(
            Uuid::new_v4(),
            vec![OrderLine {
                sku_id: sku.id,
                quantity: 3,
            }],
        )
        .await;
    assert_eq!(placed.status, OrderStatus::Pending);
    assert_eq!(placed.total_price, 27_000);
    assert_eq!(placed.payment_intent.amount, 27_000);

    app.state
        .services
        .catalog
        .update_pricing(
            sku.product_id,
            UpdatePricingRequest {
                price: 50_000,
                discount_rate: 0,
            },
        )
        .await
        .unwrap();

    let details = app.state.services.orders.get_order(placed.order_id).await.unwrap();
    assert_eq!(details.summary.total_price, 27_000);
    assert_eq!(details.lines.len(), 1);
    assert_eq!(details.lines[0].unit_price, 9_000);
    let line_sum: i64 = details.lines.iter().map(|l| l.line_total).sum();
    assert_eq!(line_sum, details.summary.total_price);
}

#[tokio::test]
async fn duplicate_lines_for_one_sku_are_merged() {
    let app = TestApp::new().await;
    let sku = app.seed_sku(1_000, 0, 10).await;

    let placed = app
        .place(
            Uuid::new_v4(),
            vec![
                OrderLine {
                    sku_id: sku.id,
                    quantity: 2,
                },
                OrderLine {
                    sku_id: sku.id,
                    quantity: 3,
                },
            ],
        )
        .await;

    assert_eq!(placed.total_price, 5_000);
    assert_eq!(app.stock_of(sku.id).await.product_stock, 5);
}

#[tokio::test]
async fn confirm_payment_is_idempotent() {
    let app = TestApp::new().await;
    let sku = app.seed_sku(10_000, 0, 2).await;
    let placed = app
        .place(
            Uuid::new_v4(),
            vec![OrderLine {
                sku_id: sku.id,
                quantity: 1,
            }],
        )
        .await;
    let orders = &app.state.services.orders;

    let first = orders
        .confirm_payment(placed.order_id, "tx1", 10_000)
        .await
        .unwrap();
    assert_eq!(first.status, OrderStatus::Paid);
    assert!(!first.already_applied);

    let replay = orders
        .confirm_payment(placed.order_id, "tx1", 10_000)
        .await
        .unwrap();
    assert!(replay.already_applied);
    assert_eq!(replay.status, OrderStatus::Paid);

    let details = orders.get_order(placed.order_id).await.unwrap();
    assert_eq!(details.payments.len(), 1);
    assert_eq!(details.summary.paid_amount, 10_000);
    assert_eq!(app.stock_of(sku.id).await.product_stock, 1);
}

#[tokio::test]
async fn amount_mismatch_leaves_order_untouched() {
    let app = TestApp::new().await;
    let sku = app.seed_sku(10_000, 0, 2).await;
    let placed = app
        .place(
            Uuid::new_v4(),
            vec![OrderLine {
                sku_id: sku.id,
                quantity: 1,
            }],
        )
        .await;

    let err = app
        .state
        .services
        .orders
        .confirm_payment(placed.order_id, "tx_short", 9_000)
        .await
        .unwrap_err();
    assert_matches!(
        err,
        ServiceError::AmountMismatch {
            expected: 10_000,
            paid: 9_000
        }
    );

    let details = app.state.services.orders.get_order(placed.order_id).await.unwrap();
    assert_eq!(details.summary.status, OrderStatus::Pending);
    assert!(details.payments.is_empty());
}

#[tokio::test]
async fn partial_then_full_refund_then_overflow() {
    let app = TestApp::new().await;
    let sku = app.seed_sku(10_000, 0, 1).await;
    let placed = app
        .place(
            Uuid::new_v4(),
            vec![OrderLine {
                sku_id: sku.id,
                quantity: 1,
            }],
        )
        .await;
    app.state
        .services
        .orders
        .confirm_payment(placed.order_id, "tx1", 10_000)
        .await
        .unwrap();
    let payments = &app.state.services.payments;

    let partial = payments
        .refund(
            placed.order_id,
            RefundRequest {
                amount: 4_000,
                reason: Some("damaged button".into()),
            },
        )
        .await
        .unwrap();
    assert_eq!(partial.status, OrderStatus::Paid);
    assert_eq!(partial.refunded_amount, 4_000);
    assert_eq!(partial.refundable_amount, 6_000);
    assert_eq!(app.stock_of(sku.id).await.product_stock, 0);

    let full = payments
        .refund(
            placed.order_id,
            RefundRequest {
                amount: 6_000,
                reason: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(full.status, OrderStatus::Refunded);
    assert_eq!(full.refunded_amount, 10_000);
    assert_eq!(app.stock_of(sku.id).await.product_stock, 1);

    let err = payments
        .refund(
            placed.order_id,
            RefundRequest {
                amount: 1,
                reason: None,
            },
        )
        .await
        .unwrap_err();
    assert_matches!(
        err,
        ServiceError::RefundExceedsPaid {
            requested: 1,
            refundable: 0
        }
    );

    assert_eq!(
        app.gateway.cancels(),
        vec![("tx1".to_string(), 4_000), ("tx1".to_string(), 6_000)]
    );
    let details = app.state.services.orders.get_order(placed.order_id).await.unwrap();
    assert_eq!(details.refunds.len(), 2);
    assert_eq!(details.summary.refunded_amount, 10_000);
}

#[tokio::test]
async fn refund_above_refundable_is_rejected_without_side_effects() {
    let app = TestApp::new().await;
    let sku = app.seed_sku(10_000, 0, 1).await;
    let placed = app
        .place(
            Uuid::new_v4(),
            vec![OrderLine {
                sku_id: sku.id,
                quantity: 1,
            }],
        )
        .await;
    app.state
        .services
        .orders
        .confirm_payment(placed.order_id, "tx1", 10_000)
        .await
        .unwrap();

    let err = app
        .state
        .services
        .payments
        .refund(
            placed.order_id,
            RefundRequest {
                amount: 10_001,
                reason: None,
            },
        )
        .await
        .unwrap_err();
    assert_matches!(
        err,
        ServiceError::RefundExceedsPaid {
            requested: 10_001,
            refundable: 10_000
        }
    );
    assert!(app.gateway.cancels().is_empty());
}

#[tokio::test]
async fn cancelling_paid_order_refunds_the_balance() {
    let app = TestApp::new().await;
    let sku = app.seed_sku(10_000, 0, 3).await;
    let placed = app
        .place(
            Uuid::new_v4(),
            vec![OrderLine {
                sku_id: sku.id,
                quantity: 2,
            }],
        )
        .await;
    let payments = &app.state.services.payments;
    app.state
        .services
        .orders
        .confirm_payment(placed.order_id, "tx_paid", 20_000)
        .await
        .unwrap();
    payments
        .refund(
            placed.order_id,
            RefundRequest {
                amount: 5_000,
                reason: None,
            },
        )
        .await
        .unwrap();

    let cancelled = payments.cancel_order(placed.order_id, None).await.unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert_eq!(cancelled.refunded_amount, 20_000);
    assert_eq!(
        app.gateway.cancels().last(),
        Some(&("tx_paid".to_string(), 15_000))
    );
    assert_eq!(app.stock_of(sku.id).await.product_stock, 3);
}

#[rstest]
#[case::unpaid(false)]
#[case::paid(true)]
#[tokio::test]
async fn cancelled_orders_reject_further_changes(#[case] paid_first: bool) {
    let app = TestApp::new().await;
    let sku = app.seed_sku(4_000, 0, 2).await;
    let placed = app
        .place(
            Uuid::new_v4(),
            vec![OrderLine {
                sku_id: sku.id,
                quantity: 1,
            }],
        )
        .await;
    if paid_first {
        app.state
            .services
            .orders
            .confirm_payment(placed.order_id, "tx_cancel", 4_000)
            .await
            .unwrap();
    }
    let payments = &app.state.services.payments;
    let cancelled = payments.cancel_order(placed.order_id, None).await.unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert_eq!(app.gateway.cancels().len(), usize::from(paid_first));

    assert_matches!(
        payments.cancel_order(placed.order_id, None).await,
        Err(ServiceError::InvalidOrderState { .. })
    );
    assert_matches!(
        payments
            .refund(
                placed.order_id,
                RefundRequest {
                    amount: 1,
                    reason: None
                }
            )
            .await,
        Err(ServiceError::InvalidOrderState { .. })
    );
    assert_matches!(
        app.state
            .services
            .orders
            .confirm_payment(placed.order_id, "tx_late", 4_000)
            .await,
        Err(ServiceError::InvalidOrderState { .. })
    );
    assert_eq!(app.stock_of(sku.id).await.product_stock, 2);
}

#[tokio::test]
async fn checkout_consumes_selected_cart_lines() {
    let app = TestApp::new().await;
    let shirt = app.seed_sku(10_000, 0, 5).await;
    let socks = app.seed_sku(2_000, 0, 5).await;
    let member_id = Uuid::new_v4();
    let cart = &app.state.services.cart;

    cart.add_item(
        member_id,
        AddCartItemRequest {
            sku_id: shirt.id,
            quantity: 1,
        },
    )
    .await
    .unwrap();
    cart.add_item(
        member_id,
        AddCartItemRequest {
            sku_id: shirt.id,
            quantity: 1,
        },
    )
    .await
    .unwrap();
    let view = cart
        .add_item(
            member_id,
            AddCartItemRequest {
                sku_id: socks.id,
                quantity: 3,
            },
        )
        .await
        .unwrap();
    assert_eq!(view.lines.len(), 2);
    assert_eq!(view.total_price, 26_000);

    let placed = app
        .state
        .services
        .orders
        .checkout(
            member_id,
            CheckoutRequest {
                sku_ids: Some(vec![shirt.id]),
                shipping_address: address(),
            },
        )
        .await
        .unwrap();
    assert_eq!(placed.total_price, 20_000);
    assert_eq!(app.stock_of(shirt.id).await.product_stock, 3);

    let remaining = cart.view(member_id).await.unwrap();
    assert_eq!(remaining.lines.len(), 1);
    assert_eq!(remaining.lines[0].sku_id, socks.id);
}

#[tokio::test]
async fn failed_checkout_keeps_the_cart() {
    let app = TestApp::new().await;
    let scarce = app.seed_sku(10_000, 0, 1).await;
    let member_id = Uuid::new_v4();
    let cart = &app.state.services.cart;
    cart.add_item(
        member_id,
        AddCartItemRequest {
            sku_id: scarce.id,
            quantity: 2,
        },
    )
    .await
    .unwrap();

    let err = app
        .state
        .services
        .orders
        .checkout(
            member_id,
            CheckoutRequest {
                sku_ids: None,
                shipping_address: address(),
            },
        )
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InsufficientStock(_));
    assert_eq!(cart.view(member_id).await.unwrap().lines.len(), 1);
    assert!(app
        .state
        .services
        .orders
        .list_member_orders(member_id)
        .await
        .unwrap()
        .is_empty());
}
