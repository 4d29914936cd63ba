//! Payment reconciliation.
//!
//! Everything that talks to the payment provider goes through here. Provider
//! calls run under a timeout and the shared circuit breaker, and any failure
//! is reported as a retryable `GatewayError`; an order is never marked paid
//! on anything but a captured or verified charge.
//!
//! Operations on the same order are serialized in-process so a client
//! confirmation racing a webhook, or two refund clicks, are applied one after
//! the other. The order service's conditional updates and the unique
//! `imp_uid` guard the same invariants across processes.

use chrono::Utc;
use dashmap::DashMap;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::{future::Future, sync::Arc, time::Duration};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    circuit_breaker::{CircuitBreaker, CircuitBreakerError},
    entities::order::{self, OrderStatus},
    errors::ServiceError,
    services::{
        gateway::{PaymentGateway, ProviderError, ProviderPaymentStatus, WebhookNotification, WebhookVerifier},
        orders::{check_refundable, OrderService, PaymentConfirmation, PaymentIntent, RefundOutcome},
    },
};

const STALE_BATCH_SIZE: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    Applied,
    AlreadyApplied,
    /// Valid callback that no longer affects the order
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ReconcileOutcome {
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub changed: bool,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct RefundRequest {
    pub amount: i64,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct CancelOrderRequest {
    pub reason: Option<String>,
}

pub struct PaymentReconciliationService {
    orders: Arc<OrderService>,
    gateway: Arc<dyn PaymentGateway>,
    breaker: Arc<CircuitBreaker>,
    verifier: WebhookVerifier,
    call_timeout: Duration,
    order_locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl PaymentReconciliationService {
    pub fn new(
        orders: Arc<OrderService>,
        gateway: Arc<dyn PaymentGateway>,
        breaker: Arc<CircuitBreaker>,
        verifier: WebhookVerifier,
        call_timeout: Duration,
    ) -> Self {
        Self {
            orders,
            gateway,
            breaker,
            verifier,
            call_timeout,
            order_locks: DashMap::new(),
        }
    }

    /// Registers the charge with the provider and moves the order to `AWAITING_PAYMENT`.
    ///
    /// Calling it again for an order already awaiting payment returns the
    /// existing intent without contacting the provider.
    #[instrument(skip(self))]
    pub async fn begin_payment(&self, order_id: Uuid) -> Result<PaymentIntent, ServiceError> {
        self.serialized(order_id, async {
            let order = self.orders.find_order(order_id).await?;
            match order.status {
                OrderStatus::AwaitingPayment if order.payment_intent_id.is_some() => {
                    self.orders.payment_intent(&order).await
                }
                OrderStatus::Pending => {
                    let order_ref = order.id.to_string();
                    let intent_id = self
                        .call_provider("authorize", self.gateway.authorize(order.total_price, &order_ref))
                        .await?;
                    let order = self.orders.mark_awaiting_payment(order_id, &intent_id).await?;
                    info!(order_id = %order_id, intent_id = %intent_id, "payment started");
                    self.orders.payment_intent(&order).await
                }
                status => Err(ServiceError::InvalidOrderState {
                    order_id,
                    status,
                    action: "start payment",
                }),
            }
        })
        .await
    }

    /// Captures the intent the client just completed and applies the charge.
    ///
    /// A provider timeout leaves the order `AWAITING_PAYMENT`; the client may
    /// retry, or the reconciliation sweep settles it.
    #[instrument(skip(self))]
    pub async fn confirm_client_payment(
        &self,
        order_id: Uuid,
    ) -> Result<PaymentConfirmation, ServiceError> {
        self.serialized(order_id, async {
            let order = self.orders.find_order(order_id).await?;
            if order.status == OrderStatus::Paid {
                let payment = self.orders.paid_payment(order_id).await?;
                return Ok(PaymentConfirmation {
                    order_id,
                    imp_uid: payment.imp_uid,
                    status: order.status,
                    already_applied: true,
                });
            }

            let intent_id = match (&order.status, &order.payment_intent_id) {
                (OrderStatus::AwaitingPayment, Some(intent_id)) => intent_id.clone(),
                _ => {
                    return Err(ServiceError::InvalidOrderState {
                        order_id,
                        status: order.status,
                        action: "confirm payment",
                    })
                }
            };

            let captured = self
                .call_provider("capture", self.gateway.capture(&intent_id))
                .await?;
            self.apply_verified_charge(order_id, &captured.transaction_id, captured.amount)
                .await
        })
        .await
    }

    /// Applies a signed provider callback.
    #[instrument(skip(self, notification), fields(imp_uid = %notification.transaction_id, status = %notification.status))]
    pub async fn handle_webhook(
        &self,
        notification: WebhookNotification,
    ) -> Result<WebhookOutcome, ServiceError> {
        if let Err(err) = self.verifier.verify(&notification) {
            counter!("storefront.payments.webhook_rejected", 1);
            warn!(error = %err, "webhook signature rejected");
            return Err(err);
        }
        let order_id = Uuid::parse_str(&notification.order_ref).map_err(|_| {
            ServiceError::ValidationError(format!(
                "unknown order reference {}",
                notification.order_ref
            ))
        })?;

        self.serialized(order_id, async {
            match notification.status.as_str() {
                "paid" => {
                    let confirmation = self
                        .apply_verified_charge(
                            order_id,
                            &notification.transaction_id,
                            notification.amount,
                        )
                        .await?;
                    Ok(if confirmation.already_applied {
                        WebhookOutcome::AlreadyApplied
                    } else {
                        WebhookOutcome::Applied
                    })
                }
                "failed" => {
                    let order = self.orders.find_order(order_id).await?;
                    if !order.status.can_transition_to(OrderStatus::Failed) {
                        info!(order_id = %order_id, status = %order.status, "failure callback ignored");
                        return Ok(WebhookOutcome::Ignored);
                    }
                    self.orders
                        .fail_order(
                            order_id,
                            "payment failed at provider",
                            Some(&notification.transaction_id),
                        )
                        .await?;
                    Ok(WebhookOutcome::Applied)
                }
                "cancelled" => {
                    let order = self.orders.find_order(order_id).await?;
                    if !order.status.can_transition_to(OrderStatus::Cancelled) {
                        return Ok(WebhookOutcome::Ignored);
                    }
                    // Already cancelled upstream; only local state changes.
                    self.orders
                        .cancel_order(
                            order_id,
                            order.status,
                            Some("cancelled at payment provider".into()),
                        )
                        .await?;
                    Ok(WebhookOutcome::Applied)
                }
                other => Err(ServiceError::ValidationError(format!(
                    "unsupported payment status {}",
                    other
                ))),
            }
        })
        .await
    }

    /// Cancels an order, voiding its charge with the provider first when paid.
    #[instrument(skip(self, reason))]
    pub async fn cancel_order(
        &self,
        order_id: Uuid,
        reason: Option<String>,
    ) -> Result<order::Model, ServiceError> {
        self.serialized(order_id, async {
            let mut order = self.orders.find_order(order_id).await?;

            if order.status == OrderStatus::AwaitingPayment {
                // The client may have paid without us hearing about it yet.
                if let Some(intent_id) = order.payment_intent_id.clone() {
                    let payment = self
                        .call_provider("lookup", self.gateway.lookup(&intent_id))
                        .await?;
                    if let (ProviderPaymentStatus::Paid, Some(tx)) =
                        (payment.status, payment.transaction_id.as_deref())
                    {
                        self.apply_verified_charge(order_id, tx, payment.amount)
                            .await?;
                        order = self.orders.find_order(order_id).await?;
                    }
                }
            }

            match order.status {
                OrderStatus::Pending | OrderStatus::AwaitingPayment => {
                    self.orders.cancel_order(order_id, order.status, reason).await
                }
                OrderStatus::Paid => {
                    let refundable = order.refundable_amount();
                    if refundable > 0 {
                        let payment = self.orders.paid_payment(order_id).await?;
                        self.call_provider("cancel", self.gateway.cancel(&payment.imp_uid, refundable))
                            .await?;
                    }
                    self.orders
                        .cancel_order(order_id, OrderStatus::Paid, reason)
                        .await
                        .map_err(|err| {
                            error!(order_id = %order_id, error = %err, "provider cancelled but local cancellation failed");
                            err
                        })
                }
                status => Err(ServiceError::InvalidOrderState {
                    order_id,
                    status,
                    action: "cancel",
                }),
            }
        })
        .await
    }

    /// Refunds part or all of a paid order through the provider.
    #[instrument(skip(self, request), fields(amount = request.amount))]
    pub async fn refund(
        &self,
        order_id: Uuid,
        request: RefundRequest,
    ) -> Result<RefundOutcome, ServiceError> {
        self.serialized(order_id, async {
            let order = self.orders.find_order(order_id).await?;
            check_refundable(&order, request.amount)?;

            let payment = self.orders.paid_payment(order_id).await?;
            self.call_provider("cancel", self.gateway.cancel(&payment.imp_uid, request.amount))
                .await?;

            self.orders
                .refund(order_id, request.amount, request.reason)
                .await
                .map_err(|err| {
                    error!(order_id = %order_id, error = %err, "provider refunded but local refund failed");
                    err
                })
        })
        .await
    }

    /// Settles an `AWAITING_PAYMENT` order from the provider's view of its intent.
    #[instrument(skip(self))]
    pub async fn reconcile(&self, order_id: Uuid) -> Result<ReconcileOutcome, ServiceError> {
        self.serialized(order_id, async {
            let order = self.orders.find_order(order_id).await?;
            let unchanged = ReconcileOutcome {
                order_id,
                status: order.status,
                changed: false,
            };
            let intent_id = match (&order.status, &order.payment_intent_id) {
                (OrderStatus::AwaitingPayment, Some(intent_id)) => intent_id.clone(),
                _ => return Ok(unchanged),
            };

            let payment = self
                .call_provider("lookup", self.gateway.lookup(&intent_id))
                .await?;
            let status = match payment.status {
                ProviderPaymentStatus::Ready => return Ok(unchanged),
                ProviderPaymentStatus::Paid => {
                    let tx = payment.transaction_id.ok_or_else(|| {
                        ServiceError::GatewayError("paid intent without a transaction id".into())
                    })?;
                    self.apply_verified_charge(order_id, &tx, payment.amount)
                        .await?
                        .status
                }
                ProviderPaymentStatus::Failed => {
                    self.orders
                        .fail_order(
                            order_id,
                            "payment failed at provider",
                            payment.transaction_id.as_deref(),
                        )
                        .await?
                        .status
                }
                ProviderPaymentStatus::Cancelled => {
                    self.orders
                        .cancel_order(
                            order_id,
                            OrderStatus::AwaitingPayment,
                            Some("cancelled at payment provider".into()),
                        )
                        .await?
                        .status
                }
            };

            info!(order_id = %order_id, status = %status, "order reconciled");
            Ok(ReconcileOutcome {
                order_id,
                status,
                changed: true,
            })
        })
        .await
    }

    /// Reconciles orders stuck in `AWAITING_PAYMENT` for longer than `stale_after`.
    /// Returns how many of them changed status.
    pub async fn reconcile_stale(&self, stale_after: Duration) -> Result<usize, ServiceError> {
        let stale_after = chrono::Duration::from_std(stale_after)
            .map_err(|e| ServiceError::InternalError(e.to_string()))?;
        let stale = self
            .orders
            .stale_awaiting_payment(Utc::now() - stale_after, STALE_BATCH_SIZE)
            .await?;

        let mut changed = 0;
        for order in stale {
            match self.reconcile(order.id).await {
                Ok(outcome) if outcome.changed => changed += 1,
                Ok(_) => {}
                Err(err) => warn!(order_id = %order.id, error = %err, "reconciliation attempt failed"),
            }
        }
        Ok(changed)
    }

    /// Applies a charge the provider has confirmed.
    ///
    /// A charge that cannot be applied (wrong amount, or an order that can no
    /// longer be paid) is voided with the provider so the customer is not
    /// left paying for nothing; the order itself is left untouched.
    async fn apply_verified_charge(
        &self,
        order_id: Uuid,
        transaction_id: &str,
        amount: i64,
    ) -> Result<PaymentConfirmation, ServiceError> {
        match self
            .orders
            .confirm_payment(order_id, transaction_id, amount)
            .await
        {
            Err(err @ ServiceError::AmountMismatch { .. })
            | Err(err @ ServiceError::InvalidOrderState { .. }) => {
                warn!(order_id = %order_id, imp_uid = %transaction_id, error = %err, "voiding charge that cannot be applied");
                if let Err(void_err) = self
                    .call_provider("cancel", self.gateway.cancel(transaction_id, amount))
                    .await
                {
                    counter!("storefront.payments.void_failures", 1);
                    error!(imp_uid = %transaction_id, error = %void_err, "failed to void charge");
                }
                Err(err)
            }
            other => other,
        }
    }

    async fn call_provider<T, F>(&self, operation: &'static str, call: F) -> Result<T, ServiceError>
    where
        F: Future<Output = Result<T, ProviderError>>,
    {
        let timeout = self.call_timeout;
        let bounded = async move {
            tokio::time::timeout(timeout, call)
                .await
                .unwrap_or(Err(ProviderError::Timeout))
        };

        match self.breaker.call(bounded, ProviderError::is_transient).await {
            Ok(value) => Ok(value),
            Err(CircuitBreakerError::CircuitOpen(name)) => {
                counter!("storefront.gateway.short_circuited", 1);
                Err(ServiceError::GatewayError(format!(
                    "circuit breaker '{}' is open",
                    name
                )))
            }
            Err(CircuitBreakerError::Inner(err)) => {
                counter!("storefront.gateway.failures", 1);
                warn!(operation, error = %err, "payment provider call failed");
                Err(err.into())
            }
        }
    }

    async fn serialized<T>(&self, order_id: Uuid, op: impl Future<Output = T>) -> T {
        let lock = self
            .order_locks
            .entry(order_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = {
            let _guard = lock.lock().await;
            op.await
        };
        drop(lock);
        self.order_locks
            .remove_if(&order_id, |_, lock| Arc::strong_count(lock) == 1);
        result
    }
}

/// Periodically settles stale `AWAITING_PAYMENT` orders.
pub fn spawn_reconciliation_sweep(
    service: Arc<PaymentReconciliationService>,
    interval: Duration,
    stale_after: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match service.reconcile_stale(stale_after).await {
                Ok(0) => {}
                Ok(changed) => info!(changed, "reconciliation sweep settled orders"),
                Err(err) => error!(error = %err, "reconciliation sweep failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        circuit_breaker::CircuitBreakerConfig,
        db,
        services::{
            cart::CartService,
            gateway::{CapturedPayment, MockPaymentGateway, ProviderPayment},
            inventory::InventoryLedger,
        },
    };
    use assert_matches::assert_matches;
    use sea_orm::{ActiveModelTrait, DatabaseConnection, Set};

    use crate::entities::{product, sku};
    use crate::services::orders::{OrderLine, PlaceOrderRequest, ShippingAddress};

    async fn setup(gateway: MockPaymentGateway) -> (PaymentReconciliationService, Arc<OrderService>, Arc<DatabaseConnection>, Uuid) {
        let pool = db::establish_connection_with_config(&db::DbConfig {
            url: "sqlite::memory:".into(),
            max_connections: 1,
            min_connections: 1,
            ..Default::default()
        })
        .await
        .unwrap();
        db::run_migrations(&pool).await.unwrap();
        let pool = Arc::new(pool);

        let now = Utc::now();
        let product = product::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set("Wool coat".into()),
            price: Set(10_000),
            discount_rate: Set(0),
            image_url: Set(None),
            category_id: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*pool)
        .await
        .unwrap();
        let sku = sku::ActiveModel {
            id: Set(Uuid::new_v4()),
            product_id: Set(product.id),
            color: Set("navy".into()),
            size: Set("M".into()),
            category_id: Set(None),
            initial_stock: Set(5),
            additional_stock: Set(0),
            product_stock: Set(5),
            is_sold_out: Set(false),
            is_restock_available: Set(false),
            is_restocked: Set(false),
            version: Set(1),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*pool)
        .await
        .unwrap();

        let inventory = Arc::new(InventoryLedger::new(pool.clone(), None));
        let cart = Arc::new(CartService::new(pool.clone()));
        let orders = Arc::new(OrderService::new(pool.clone(), inventory, cart, None));
        let breaker = Arc::new(CircuitBreaker::new(
            "payment_gateway",
            CircuitBreakerConfig {
                failure_threshold: 3,
                timeout: Duration::from_secs(60),
                success_threshold: 1,
            },
        ));
        let service = PaymentReconciliationService::new(
            orders.clone(),
            Arc::new(gateway),
            breaker,
            WebhookVerifier::new(Some("whsec".into())),
            Duration::from_millis(200),
        );

        let placed = orders
            .place_order(
                Uuid::new_v4(),
                PlaceOrderRequest {
                    lines: vec![OrderLine { sku_id: sku.id, quantity: 1 }],
                    shipping_address: ShippingAddress {
                        recipient_name: "Lee".into(),
                        recipient_phone: "010-0000-0000".into(),
                        zip_code: "04524".into(),
                        address: "Sejong-daero 110".into(),
                        address_detail: None,
                        delivery_message: None,
                    },
                },
            )
            .await
            .unwrap();

        (service, orders, pool, placed.order_id)
    }

    #[tokio::test]
    async fn authorize_failure_leaves_order_pending() {
        let mut gateway = MockPaymentGateway::new();
        gateway
            .expect_authorize()
            .returning(|_, _| Err(ProviderError::Transport("connection refused".into())));
        let (service, orders, _pool, order_id) = setup(gateway).await;

        let err = service.begin_payment(order_id).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(orders.find_order(order_id).await.unwrap().status, OrderStatus::Pending);
    }

    #[tokio::test]
    async fn capture_timeout_keeps_awaiting_payment() {
        let mut gateway = MockPaymentGateway::new();
        gateway
            .expect_authorize()
            .returning(|_, _| Ok("intent_1".to_string()));
        gateway.expect_capture().returning(|_| Err(ProviderError::Timeout));
        let (service, orders, _pool, order_id) = setup(gateway).await;

        let intent = service.begin_payment(order_id).await.unwrap();
        assert_eq!(intent.intent_id.as_deref(), Some("intent_1"));

        let err = service.confirm_client_payment(order_id).await.unwrap_err();
        assert_matches!(err, ServiceError::GatewayError(_));
        assert_eq!(
            orders.find_order(order_id).await.unwrap().status,
            OrderStatus::AwaitingPayment
        );
    }

    #[tokio::test]
    async fn mismatched_capture_is_voided() {
        let mut gateway = MockPaymentGateway::new();
        gateway
            .expect_authorize()
            .returning(|_, _| Ok("intent_1".to_string()));
        gateway.expect_capture().returning(|_| {
            Ok(CapturedPayment {
                transaction_id: "imp_low".into(),
                amount: 100,
            })
        });
        gateway
            .expect_cancel()
            .withf(|tx, amount| tx.to_string() == "imp_low" && *amount == 100)
            .times(1)
            .returning(|_, _| Ok(()));
        let (service, orders, _pool, order_id) = setup(gateway).await;

        service.begin_payment(order_id).await.unwrap();
        let err = service.confirm_client_payment(order_id).await.unwrap_err();
        assert_matches!(err, ServiceError::AmountMismatch { expected: 10_000, paid: 100 });
        assert_eq!(
            orders.find_order(order_id).await.unwrap().status,
            OrderStatus::AwaitingPayment
        );
    }

    #[tokio::test]
    async fn reconcile_confirms_paid_intent() {
        let mut gateway = MockPaymentGateway::new();
        gateway
            .expect_authorize()
            .returning(|_, _| Ok("intent_1".to_string()));
        gateway.expect_lookup().returning(|_| {
            Ok(ProviderPayment {
                status: ProviderPaymentStatus::Paid,
                transaction_id: Some("imp_ok".into()),
                amount: 10_000,
            })
        });
        let (service, _orders, _pool, order_id) = setup(gateway).await;

        service.begin_payment(order_id).await.unwrap();
        let outcome = service.reconcile(order_id).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome {
                order_id,
                status: OrderStatus::Paid,
                changed: true
            }
        );

        let again = service.reconcile(order_id).await.unwrap();
        assert!(!again.changed);
    }

    #[tokio::test]
    async fn open_circuit_fails_fast() {
        let mut gateway = MockPaymentGateway::new();
        gateway
            .expect_authorize()
            .times(3)
            .returning(|_, _| Err(ProviderError::Timeout));
        let (service, _orders, _pool, order_id) = setup(gateway).await;

        for _ in 0..3 {
            assert!(service.begin_payment(order_id).await.is_err());
        }
        let err = service.begin_payment(order_id).await.unwrap_err();
        assert_matches!(err, ServiceError::GatewayError(message) if message.contains("open"));
    }
}
