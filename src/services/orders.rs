//! Order workflow.
//!
//! Owns the order state machine and every multi-step write touching an order.
//! Each operation opens one explicit transaction, runs all of its steps
//! (stock ledger calls, order row changes, payment records) against it and
//! settles it with [`db::settle`], so a failing step leaves no partial state.
//!
//! Status changes are conditional updates on `(id, version)`; a concurrent
//! writer that got there first turns the loser into `ConcurrentModification`
//! instead of a lost update.

use chrono::{DateTime, Utc};
use metrics::counter;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    db,
    entities::{
        order::{self, OrderStatus},
        order_product,
        payment_history::{self, PaymentStatus},
        payment_refund, product,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        cart::{CartService, MAX_LINE_QUANTITY},
        inventory::{find_sku, InventoryLedger, StockSignal},
    },
};

const MAX_ORDER_LINES: usize = 50;
const MEMBER_ORDER_LIMIT: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct OrderLine {
    pub sku_id: Uuid,
    pub quantity: i32,
}

/// Delivery destination, copied onto the order when it is placed
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct ShippingAddress {
    #[validate(length(min = 1, max = 100))]
    pub recipient_name: String,
    #[validate(length(min = 8, max = 30))]
    pub recipient_phone: String,
    #[validate(length(min = 5, max = 10))]
    pub zip_code: String,
    #[validate(length(min = 1, max = 255))]
    pub address: String,
    #[validate(length(max = 255))]
    pub address_detail: Option<String>,
    #[validate(length(max = 200))]
    pub delivery_message: Option<String>,
}

/// "Buy now" order for explicit lines
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct PlaceOrderRequest {
    pub lines: Vec<OrderLine>,
    pub shipping_address: ShippingAddress,
}

/// Order built from cart lines; all lines when `sku_ids` is omitted
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CheckoutRequest {
    pub sku_ids: Option<Vec<Uuid>>,
    pub shipping_address: ShippingAddress,
}

/// What the client hands to the payment provider's checkout widget
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PaymentIntent {
    /// Merchant-side reference of the charge (the order id)
    pub merchant_uid: String,
    pub amount: i64,
    pub order_name: String,
    /// Provider intent id, present once payment has been started
    pub intent_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PlacedOrder {
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub total_price: i64,
    pub payment_intent: PaymentIntent,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrderLineView {
    pub sku_id: Uuid,
    pub product_id: Uuid,
    pub product_name: String,
    pub color: String,
    pub size: String,
    pub image_url: Option<String>,
    pub unit_price: i64,
    pub quantity: i32,
    pub line_total: i64,
}

impl From<order_product::Model> for OrderLineView {
    fn from(line: order_product::Model) -> Self {
        Self {
            sku_id: line.sku_id,
            product_id: line.product_id,
            product_name: line.product_name,
            color: line.color,
            size: line.size,
            image_url: line.image_url,
            unit_price: line.unit_price,
            quantity: line.quantity,
            line_total: line.line_total,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PaymentView {
    pub id: Uuid,
    pub imp_uid: String,
    pub amount: i64,
    pub status: PaymentStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RefundView {
    pub id: Uuid,
    pub amount: i64,
    pub reason: Option<String>,
    pub refunded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrderSummary {
    pub id: Uuid,
    pub member_id: Uuid,
    pub status: OrderStatus,
    pub total_price: i64,
    pub paid_amount: i64,
    pub refunded_amount: i64,
    pub ordered_at: DateTime<Utc>,
}

impl From<order::Model> for OrderSummary {
    fn from(order: order::Model) -> Self {
        Self {
            id: order.id,
            member_id: order.member_id,
            status: order.status,
            total_price: order.total_price,
            paid_amount: order.paid_amount,
            refunded_amount: order.refunded_amount,
            ordered_at: order.ordered_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrderDetails {
    #[serde(flatten)]
    pub summary: OrderSummary,
    pub shipping_address: ShippingAddress,
    pub payment_intent_id: Option<String>,
    pub lines: Vec<OrderLineView>,
    pub payments: Vec<PaymentView>,
    pub refunds: Vec<RefundView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PaymentConfirmation {
    pub order_id: Uuid,
    pub imp_uid: String,
    pub status: OrderStatus,
    /// True when this transaction had already been applied earlier
    pub already_applied: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct RefundOutcome {
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub refunded_amount: i64,
    pub refundable_amount: i64,
}

/// Checks a refund request against what the order can still give back
pub fn check_refundable(order: &order::Model, amount: i64) -> Result<(), ServiceError> {
    if order.status == OrderStatus::Refunded && amount > 0 {
        return Err(ServiceError::RefundExceedsPaid {
            requested: amount,
            refundable: 0,
        });
    }
    if order.status != OrderStatus::Paid {
        return Err(ServiceError::InvalidOrderState {
            order_id: order.id,
            status: order.status,
            action: "refund",
        });
    }
    if amount <= 0 {
        return Err(ServiceError::ValidationError(
            "refund amount must be positive".into(),
        ));
    }
    let refundable = order.refundable_amount();
    if amount > refundable {
        return Err(ServiceError::RefundExceedsPaid {
            requested: amount,
            refundable,
        });
    }
    Ok(())
}

/// Validates and merges requested lines; duplicate SKUs are summed.
pub fn normalize_lines(lines: &[OrderLine]) -> Result<Vec<OrderLine>, ServiceError> {
    if lines.is_empty() {
        return Err(ServiceError::ValidationError(
            "an order needs at least one line".into(),
        ));
    }

    let mut merged: Vec<OrderLine> = Vec::with_capacity(lines.len());
    for line in lines {
        if line.quantity <= 0 {
            return Err(ServiceError::ValidationError(format!(
                "quantity for sku {} must be positive",
                line.sku_id
            )));
        }
        let merged_line = match merged.iter_mut().find(|m| m.sku_id == line.sku_id) {
            Some(existing) => {
                existing.quantity = existing.quantity.saturating_add(line.quantity);
                *existing
            }
            None => {
                merged.push(*line);
                *line
            }
        };
        if merged_line.quantity > MAX_LINE_QUANTITY {
            return Err(ServiceError::ValidationError(format!(
                "quantity for sku {} exceeds {}",
                merged_line.sku_id, MAX_LINE_QUANTITY
            )));
        }
    }

    if merged.len() > MAX_ORDER_LINES {
        return Err(ServiceError::ValidationError(format!(
            "an order may contain at most {} distinct skus",
            MAX_ORDER_LINES
        )));
    }
    Ok(merged)
}

fn order_total(snapshots: &[LineSnapshot]) -> Result<i64, ServiceError> {
    snapshots
        .iter()
        .try_fold(0i64, |total, line| total.checked_add(line.line_total))
        .ok_or_else(|| ServiceError::ValidationError("order total overflows".into()))
}

fn invalid_state(order: &order::Model, action: &'static str) -> ServiceError {
    ServiceError::InvalidOrderState {
        order_id: order.id,
        status: order.status,
        action,
    }
}

struct LineSnapshot {
    sku_id: Uuid,
    product_id: Uuid,
    product_name: String,
    color: String,
    size: String,
    image_url: Option<String>,
    unit_price: i64,
    quantity: i32,
    line_total: i64,
}

/// Stock and order events produced inside a transaction, published after commit
#[derive(Default)]
struct Outbox {
    events: Vec<Event>,
    stock: Vec<StockSignal>,
}

#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    inventory: Arc<InventoryLedger>,
    cart: Arc<CartService>,
    event_sender: Option<Arc<EventSender>>,
}

impl OrderService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        inventory: Arc<InventoryLedger>,
        cart: Arc<CartService>,
        event_sender: Option<Arc<EventSender>>,
    ) -> Self {
        Self {
            db,
            inventory,
            cart,
            event_sender,
        }
    }

    /// Places an order for explicit lines, reserving stock for all of them or none.
    #[instrument(skip(self, request), fields(member_id = %member_id, lines = request.lines.len()))]
    pub async fn place_order(
        &self,
        member_id: Uuid,
        request: PlaceOrderRequest,
    ) -> Result<PlacedOrder, ServiceError> {
        request.shipping_address.validate()?;
        let lines = normalize_lines(&request.lines)?;

        let txn = self.db.begin().await?;
        let result = self
            .place_in(&txn, member_id, &lines, &request.shipping_address)
            .await;
        self.finish_placement(txn, result).await
    }

    /// Converts cart lines into an order; the consumed lines leave the cart
    /// in the same transaction.
    #[instrument(skip(self, request), fields(member_id = %member_id))]
    pub async fn checkout(
        &self,
        member_id: Uuid,
        request: CheckoutRequest,
    ) -> Result<PlacedOrder, ServiceError> {
        request.shipping_address.validate()?;

        let txn = self.db.begin().await?;
        let result = async {
            let taken = self
                .cart
                .take_lines(&txn, member_id, request.sku_ids.as_deref())
                .await?;
            let lines = normalize_lines(&taken)?;
            self.place_in(&txn, member_id, &lines, &request.shipping_address)
                .await
        }
        .await;
        self.finish_placement(txn, result).await
    }

    async fn finish_placement(
        &self,
        txn: sea_orm::DatabaseTransaction,
        result: Result<(PlacedOrder, Outbox), ServiceError>,
    ) -> Result<PlacedOrder, ServiceError> {
        match db::settle(txn, result).await {
            Ok((placed, outbox)) => {
                counter!("storefront.orders.placed", 1);
                info!(order_id = %placed.order_id, total = placed.total_price, "order placed");
                self.publish(outbox).await;
                Ok(placed)
            }
            Err(err) => {
                if matches!(err, ServiceError::InsufficientStock(_)) {
                    counter!("storefront.orders.rejected_out_of_stock", 1);
                }
                warn!(error = %err, "order placement rolled back");
                Err(err)
            }
        }
    }

    async fn place_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        member_id: Uuid,
        lines: &[OrderLine],
        address: &ShippingAddress,
    ) -> Result<(PlacedOrder, Outbox), ServiceError> {
        let mut snapshots = Vec::with_capacity(lines.len());
        for line in lines {
            let sku = find_sku(conn, line.sku_id).await?;
            let product = product::Entity::find_by_id(sku.product_id)
                .one(conn)
                .await?
                .ok_or_else(|| {
                    ServiceError::NotFound(format!("product {} not found", sku.product_id))
                })?;
            let unit_price = product.sale_price();
            let line_total = unit_price
                .checked_mul(i64::from(line.quantity))
                .ok_or_else(|| ServiceError::ValidationError("line total overflows".into()))?;
            snapshots.push(LineSnapshot {
                sku_id: sku.id,
                product_id: product.id,
                product_name: product.name,
                color: sku.color,
                size: sku.size,
                image_url: product.image_url,
                unit_price,
                quantity: line.quantity,
                line_total,
            });
        }
        let total_price = order_total(&snapshots)?;

        let order = order::ActiveModel {
            member_id: Set(member_id),
            status: Set(OrderStatus::Pending),
            total_price: Set(total_price),
            paid_amount: Set(0),
            refunded_amount: Set(0),
            recipient_name: Set(address.recipient_name.clone()),
            recipient_phone: Set(address.recipient_phone.clone()),
            zip_code: Set(address.zip_code.clone()),
            address: Set(address.address.clone()),
            address_detail: Set(address.address_detail.clone()),
            delivery_message: Set(address.delivery_message.clone()),
            payment_intent_id: Set(None),
            ..Default::default()
        }
        .insert(conn)
        .await?;

        let mut outbox = Outbox::default();
        for snapshot in &snapshots {
            let (_, signal) = self
                .inventory
                .reserve(conn, order.id, snapshot.sku_id, snapshot.quantity)
                .await?;
            outbox.stock.extend(signal);

            order_product::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order.id),
                sku_id: Set(snapshot.sku_id),
                product_id: Set(snapshot.product_id),
                product_name: Set(snapshot.product_name.clone()),
                color: Set(snapshot.color.clone()),
                size: Set(snapshot.size.clone()),
                image_url: Set(snapshot.image_url.clone()),
                unit_price: Set(snapshot.unit_price),
                quantity: Set(snapshot.quantity),
                line_total: Set(snapshot.line_total),
            }
            .insert(conn)
            .await?;
        }

        outbox.events.push(Event::OrderPlaced {
            order_id: order.id,
            member_id,
            total_price,
        });

        let placed = PlacedOrder {
            order_id: order.id,
            status: order.status,
            total_price,
            payment_intent: payment_intent_for(
                &order,
                &order_name(
                    snapshots.first().map(|s| s.product_name.as_str()),
                    snapshots.len(),
                ),
            ),
        };
        Ok((placed, outbox))
    }

    /// Records the provider intent and moves `PENDING → AWAITING_PAYMENT`.
    #[instrument(skip(self))]
    pub async fn mark_awaiting_payment(
        &self,
        order_id: Uuid,
        intent_id: &str,
    ) -> Result<order::Model, ServiceError> {
        let order = self.find_order(order_id).await?;
        if order.status == OrderStatus::AwaitingPayment
            && order.payment_intent_id.as_deref() == Some(intent_id)
        {
            return Ok(order);
        }
        if order.status != OrderStatus::Pending {
            return Err(invalid_state(&order, "start payment"));
        }

        update_status(
            &*self.db,
            &order,
            OrderStatus::AwaitingPayment,
            |update| {
                update.col_expr(
                    order::Column::PaymentIntentId,
                    Expr::value(intent_id.to_string()),
                )
            },
        )
        .await?;

        self.publish(Outbox {
            events: vec![Event::OrderAwaitingPayment {
                order_id,
                intent_id: intent_id.to_string(),
            }],
            stock: Vec::new(),
        })
        .await;
        self.find_order(order_id).await
    }

    /// Applies a successful provider transaction.
    ///
    /// Replaying the same `imp_uid` for the same order is a no-op that reports
    /// `already_applied`; one PaymentHistory row and one stock commit result.
    #[instrument(skip(self), fields(order_id = %order_id, imp_uid = %imp_uid))]
    pub async fn confirm_payment(
        &self,
        order_id: Uuid,
        imp_uid: &str,
        paid_amount: i64,
    ) -> Result<PaymentConfirmation, ServiceError> {
        if imp_uid.trim().is_empty() {
            return Err(ServiceError::ValidationError(
                "provider transaction id is required".into(),
            ));
        }

        let txn = self.db.begin().await?;
        let result = self.confirm_in(&txn, order_id, imp_uid, paid_amount).await;

        match db::settle(txn, result).await {
            Ok((confirmation, outbox)) => {
                if !confirmation.already_applied {
                    counter!("storefront.payments.confirmed", 1);
                    info!(amount = paid_amount, "payment confirmed");
                    self.publish(outbox).await;
                }
                Ok(confirmation)
            }
            Err(err) if err.is_unique_violation() => {
                // A concurrent confirmation for the same transaction committed first.
                let (confirmation, _) = self
                    .confirm_in(&*self.db, order_id, imp_uid, paid_amount)
                    .await?;
                Ok(confirmation)
            }
            Err(err) => {
                if matches!(err, ServiceError::AmountMismatch { .. }) {
                    counter!("storefront.payments.amount_mismatch", 1);
                    error!(error = %err, "payment amount mismatch");
                }
                Err(err)
            }
        }
    }

    async fn confirm_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        order_id: Uuid,
        imp_uid: &str,
        paid_amount: i64,
    ) -> Result<(PaymentConfirmation, Outbox), ServiceError> {
        if let Some(existing) = find_payment_by_imp_uid(conn, imp_uid).await? {
            if existing.order_id != order_id {
                return Err(ServiceError::Conflict(format!(
                    "transaction {} belongs to another order",
                    imp_uid
                )));
            }
            if existing.status == PaymentStatus::Failed {
                return Err(ServiceError::Conflict(format!(
                    "transaction {} was recorded as failed",
                    imp_uid
                )));
            }
            let order = find_order(conn, order_id).await?;
            return Ok((
                PaymentConfirmation {
                    order_id,
                    imp_uid: imp_uid.to_string(),
                    status: order.status,
                    already_applied: true,
                },
                Outbox::default(),
            ));
        }

        let order = find_order(conn, order_id).await?;
        if !order.status.can_transition_to(OrderStatus::Paid) {
            return Err(invalid_state(&order, "confirm payment"));
        }
        if paid_amount != order.total_price {
            return Err(ServiceError::AmountMismatch {
                expected: order.total_price,
                paid: paid_amount,
            });
        }

        self.inventory.commit_order(conn, order.id).await?;

        update_status(conn, &order, OrderStatus::Paid, |update| {
            update.col_expr(order::Column::PaidAmount, Expr::value(paid_amount))
        })
        .await?;

        let now = Utc::now();
        payment_history::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            member_id: Set(order.member_id),
            imp_uid: Set(imp_uid.to_string()),
            amount: Set(paid_amount),
            status: Set(PaymentStatus::Paid),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(conn)
        .await?;

        Ok((
            PaymentConfirmation {
                order_id,
                imp_uid: imp_uid.to_string(),
                status: OrderStatus::Paid,
                already_applied: false,
            },
            Outbox {
                events: vec![Event::OrderPaid {
                    order_id,
                    imp_uid: imp_uid.to_string(),
                    amount: paid_amount,
                }],
                stock: Vec::new(),
            },
        ))
    }

    /// Marks an unpaid order as failed and gives its stock back.
    #[instrument(skip(self))]
    pub async fn fail_order(
        &self,
        order_id: Uuid,
        reason: &str,
        failed_imp_uid: Option<&str>,
    ) -> Result<order::Model, ServiceError> {
        let txn = self.db.begin().await?;
        let result = async {
            let order = find_order(&txn, order_id).await?;
            if order.status == OrderStatus::Failed {
                return Ok((order, Outbox::default()));
            }
            if !order.status.can_transition_to(OrderStatus::Failed) {
                return Err(invalid_state(&order, "fail"));
            }

            let stock = self.inventory.restore_order(&txn, order_id).await?;
            update_status(&txn, &order, OrderStatus::Failed, |update| update).await?;

            if let Some(imp_uid) = failed_imp_uid {
                if find_payment_by_imp_uid(&txn, imp_uid).await?.is_none() {
                    let now = Utc::now();
                    payment_history::ActiveModel {
                        id: Set(Uuid::new_v4()),
                        order_id: Set(order.id),
                        member_id: Set(order.member_id),
                        imp_uid: Set(imp_uid.to_string()),
                        amount: Set(0),
                        status: Set(PaymentStatus::Failed),
                        created_at: Set(now),
                        updated_at: Set(now),
                    }
                    .insert(&txn)
                    .await?;
                }
            }

            let order = find_order(&txn, order_id).await?;
            Ok((
                order,
                Outbox {
                    events: vec![Event::OrderFailed {
                        order_id,
                        reason: reason.to_string(),
                    }],
                    stock,
                },
            ))
        }
        .await;

        let (order, outbox) = db::settle(txn, result).await?;
        warn!(order_id = %order_id, reason, "order failed");
        self.publish(outbox).await;
        Ok(order)
    }

    /// Cancels an order that is still in `observed` status.
    ///
    /// Callers decide whether a provider-side cancel is needed based on the
    /// status they observed; if the order moved on meanwhile this fails with
    /// `ConcurrentModification` and nothing is written. A paid order's
    /// remaining balance is recorded as refunded.
    #[instrument(skip(self))]
    pub async fn cancel_order(
        &self,
        order_id: Uuid,
        observed: OrderStatus,
        reason: Option<String>,
    ) -> Result<order::Model, ServiceError> {
        let txn = self.db.begin().await?;
        let result = async {
            let order = find_order(&txn, order_id).await?;
            if order.status != observed {
                return Err(ServiceError::ConcurrentModification(order_id));
            }
            if !order.status.can_transition_to(OrderStatus::Cancelled) {
                return Err(invalid_state(&order, "cancel"));
            }

            let refunded_now = if order.status == OrderStatus::Paid {
                let refundable = order.refundable_amount();
                let history = paid_history(&txn, order_id).await?;
                if refundable > 0 {
                    insert_refund(&txn, &history, refundable, reason.clone()).await?;
                }
                set_payment_status(&txn, &history, PaymentStatus::Cancelled).await?;
                refundable
            } else {
                0
            };

            let stock = self.inventory.restore_order(&txn, order_id).await?;
            let refunded_total = order.refunded_amount + refunded_now;
            update_status(&txn, &order, OrderStatus::Cancelled, |update| {
                update.col_expr(order::Column::RefundedAmount, Expr::value(refunded_total))
            })
            .await?;

            let order = find_order(&txn, order_id).await?;
            Ok((
                order,
                Outbox {
                    events: vec![Event::OrderCancelled {
                        order_id,
                        refunded: refunded_now,
                    }],
                    stock,
                },
            ))
        }
        .await;

        let (order, outbox) = db::settle(txn, result).await?;
        counter!("storefront.orders.cancelled", 1);
        info!(order_id = %order_id, "order cancelled");
        self.publish(outbox).await;
        Ok(order)
    }

    /// Records a (partial) refund of a paid order.
    ///
    /// Once the cumulative refund equals the paid amount the order becomes
    /// `REFUNDED` and its units go back on sale.
    #[instrument(skip(self, reason))]
    pub async fn refund(
        &self,
        order_id: Uuid,
        amount: i64,
        reason: Option<String>,
    ) -> Result<RefundOutcome, ServiceError> {
        let txn = self.db.begin().await?;
        let result = async {
            let order = find_order(&txn, order_id).await?;
            check_refundable(&order, amount)?;

            let history = paid_history(&txn, order_id).await?;
            insert_refund(&txn, &history, amount, reason).await?;

            let refunded_total = order.refunded_amount + amount;
            let fully_refunded = refunded_total == order.paid_amount;
            let next_status = if fully_refunded {
                OrderStatus::Refunded
            } else {
                OrderStatus::Paid
            };

            update_status(&txn, &order, next_status, |update| {
                update.col_expr(order::Column::RefundedAmount, Expr::value(refunded_total))
            })
            .await?;

            let mut stock = Vec::new();
            if fully_refunded {
                set_payment_status(&txn, &history, PaymentStatus::Cancelled).await?;
                stock = self.inventory.restore_order(&txn, order_id).await?;
            }

            Ok((
                RefundOutcome {
                    order_id,
                    status: next_status,
                    refunded_amount: refunded_total,
                    refundable_amount: order.paid_amount - refunded_total,
                },
                Outbox {
                    events: vec![Event::OrderRefunded {
                        order_id,
                        amount,
                        fully_refunded,
                    }],
                    stock,
                },
            ))
        }
        .await;

        let (outcome, outbox) = db::settle(txn, result).await?;
        counter!("storefront.payments.refunds", 1);
        info!(
            order_id = %order_id,
            amount,
            refunded_total = outcome.refunded_amount,
            status = %outcome.status,
            "refund recorded"
        );
        self.publish(outbox).await;
        Ok(outcome)
    }

    /// Provider-ready description of an order's charge
    pub async fn payment_intent(&self, order: &order::Model) -> Result<PaymentIntent, ServiceError> {
        let lines = order_product::Entity::find()
            .filter(order_product::Column::OrderId.eq(order.id))
            .order_by_asc(order_product::Column::ProductName)
            .all(&*self.db)
            .await?;
        let name = order_name(lines.first().map(|l| l.product_name.as_str()), lines.len());
        Ok(payment_intent_for(order, &name))
    }

    pub async fn find_order(&self, order_id: Uuid) -> Result<order::Model, ServiceError> {
        find_order(&*self.db, order_id).await
    }

    pub async fn get_order(&self, order_id: Uuid) -> Result<OrderDetails, ServiceError> {
        let order = self.find_order(order_id).await?;

        let lines = order_product::Entity::find()
            .filter(order_product::Column::OrderId.eq(order_id))
            .all(&*self.db)
            .await?;
        let payments = payment_history::Entity::find()
            .filter(payment_history::Column::OrderId.eq(order_id))
            .order_by_asc(payment_history::Column::CreatedAt)
            .all(&*self.db)
            .await?;
        let refunds = payment_refund::Entity::find()
            .filter(payment_refund::Column::OrderId.eq(order_id))
            .order_by_asc(payment_refund::Column::RefundedAt)
            .all(&*self.db)
            .await?;

        Ok(OrderDetails {
            shipping_address: ShippingAddress {
                recipient_name: order.recipient_name.clone(),
                recipient_phone: order.recipient_phone.clone(),
                zip_code: order.zip_code.clone(),
                address: order.address.clone(),
                address_detail: order.address_detail.clone(),
                delivery_message: order.delivery_message.clone(),
            },
            payment_intent_id: order.payment_intent_id.clone(),
            summary: order.into(),
            lines: lines.into_iter().map(Into::into).collect(),
            payments: payments
                .into_iter()
                .map(|p| PaymentView {
                    id: p.id,
                    imp_uid: p.imp_uid,
                    amount: p.amount,
                    status: p.status,
                    created_at: p.created_at,
                })
                .collect(),
            refunds: refunds
                .into_iter()
                .map(|r| RefundView {
                    id: r.id,
                    amount: r.amount,
                    reason: r.reason,
                    refunded_at: r.refunded_at,
                })
                .collect(),
        })
    }

    /// Most recent orders of a member
    pub async fn list_member_orders(
        &self,
        member_id: Uuid,
    ) -> Result<Vec<OrderSummary>, ServiceError> {
        Ok(order::Entity::find()
            .filter(order::Column::MemberId.eq(member_id))
            .order_by_desc(order::Column::OrderedAt)
            .limit(MEMBER_ORDER_LIMIT)
            .all(&*self.db)
            .await?
            .into_iter()
            .map(Into::into)
            .collect())
    }

    /// Orders that have been waiting on the provider since before `cutoff`
    pub async fn stale_awaiting_payment(
        &self,
        cutoff: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<order::Model>, ServiceError> {
        Ok(order::Entity::find()
            .filter(order::Column::Status.eq(OrderStatus::AwaitingPayment))
            .filter(order::Column::UpdatedAt.lt(cutoff))
            .order_by_asc(order::Column::UpdatedAt)
            .limit(limit)
            .all(&*self.db)
            .await?)
    }

    /// The successful charge backing a paid order
    pub async fn paid_payment(
        &self,
        order_id: Uuid,
    ) -> Result<payment_history::Model, ServiceError> {
        paid_history(&*self.db, order_id).await
    }

    pub async fn find_payment(
        &self,
        imp_uid: &str,
    ) -> Result<Option<payment_history::Model>, ServiceError> {
        find_payment_by_imp_uid(&*self.db, imp_uid).await
    }

    async fn publish(&self, outbox: Outbox) {
        self.inventory.announce(outbox.stock).await;
        if let Some(sender) = &self.event_sender {
            for event in outbox.events {
                sender.send_or_log(event).await;
            }
        }
    }
}

pub fn payment_intent_for(order: &order::Model, order_name: &str) -> PaymentIntent {
    PaymentIntent {
        merchant_uid: order.id.to_string(),
        amount: order.total_price,
        order_name: order_name.to_string(),
        intent_id: order.payment_intent_id.clone(),
    }
}

/// Display name of a charge: the first product, plus how many others follow it
fn order_name(first: Option<&str>, line_count: usize) -> String {
    match (first, line_count) {
        (None, _) => String::new(),
        (Some(name), 0 | 1) => name.to_string(),
        (Some(name), n) => format!("{} and {} more", name, n - 1),
    }
}

async fn find_order<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
) -> Result<order::Model, ServiceError> {
    order::Entity::find_by_id(order_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("order {} not found", order_id)))
}

async fn find_payment_by_imp_uid<C: ConnectionTrait>(
    conn: &C,
    imp_uid: &str,
) -> Result<Option<payment_history::Model>, ServiceError> {
    Ok(payment_history::Entity::find()
        .filter(payment_history::Column::ImpUid.eq(imp_uid))
        .one(conn)
        .await?)
}

async fn paid_history<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
) -> Result<payment_history::Model, ServiceError> {
    payment_history::Entity::find()
        .filter(payment_history::Column::OrderId.eq(order_id))
        .filter(payment_history::Column::Status.eq(PaymentStatus::Paid))
        .one(conn)
        .await?
        .ok_or_else(|| {
            ServiceError::NotFound(format!("no successful payment recorded for order {}", order_id))
        })
}

async fn insert_refund<C: ConnectionTrait>(
    conn: &C,
    history: &payment_history::Model,
    amount: i64,
    reason: Option<String>,
) -> Result<(), ServiceError> {
    payment_refund::ActiveModel {
        id: Set(Uuid::new_v4()),
        payment_history_id: Set(history.id),
        order_id: Set(history.order_id),
        amount: Set(amount),
        reason: Set(reason),
        refunded_at: Set(Utc::now()),
    }
    .insert(conn)
    .await?;
    Ok(())
}

async fn set_payment_status<C: ConnectionTrait>(
    conn: &C,
    history: &payment_history::Model,
    status: PaymentStatus,
) -> Result<(), ServiceError> {
    payment_history::Entity::update_many()
        .col_expr(payment_history::Column::Status, Expr::value(status))
        .col_expr(payment_history::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(payment_history::Column::Id.eq(history.id))
        .exec(conn)
        .await?;
    Ok(())
}

/// Moves `order` to `next` only if nobody changed it since it was read.
async fn update_status<C, F>(
    conn: &C,
    order: &order::Model,
    next: OrderStatus,
    extra: F,
) -> Result<(), ServiceError>
where
    C: ConnectionTrait,
    F: FnOnce(sea_orm::UpdateMany<order::Entity>) -> sea_orm::UpdateMany<order::Entity>,
{
    if order.status != next && !order.status.can_transition_to(next) {
        return Err(invalid_state(order, "change status"));
    }

    let update = order::Entity::update_many()
        .col_expr(order::Column::Status, Expr::value(next))
        .col_expr(order::Column::Version, Expr::col(order::Column::Version).add(1))
        .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(order::Column::Id.eq(order.id))
        .filter(order::Column::Version.eq(order.version));

    let result = extra(update).exec(conn).await?;
    if result.rows_affected != 1 {
        return Err(ServiceError::ConcurrentModification(order.id));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    fn paid_order(paid: i64, refunded: i64) -> order::Model {
        let now = Utc::now();
        order::Model {
            id: Uuid::new_v4(),
            member_id: Uuid::new_v4(),
            status: OrderStatus::Paid,
            total_price: paid,
            paid_amount: paid,
            refunded_amount: refunded,
            recipient_name: "Kim".into(),
            recipient_phone: "010-1234-5678".into(),
            zip_code: "06236".into(),
            address: "Teheran-ro 1".into(),
            address_detail: None,
            delivery_message: None,
            payment_intent_id: None,
            ordered_at: now,
            updated_at: now,
            version: 1,
        }
    }

    #[test]
    fn duplicate_skus_are_merged() {
        let sku = Uuid::new_v4();
        let other = Uuid::new_v4();
        let lines = normalize_lines(&[
            OrderLine { sku_id: sku, quantity: 1 },
            OrderLine { sku_id: other, quantity: 2 },
            OrderLine { sku_id: sku, quantity: 3 },
        ])
        .unwrap();
        assert_eq!(
            lines,
            vec![
                OrderLine { sku_id: sku, quantity: 4 },
                OrderLine { sku_id: other, quantity: 2 },
            ]
        );
    }

    #[test]
    fn charge_names_summarise_lines() {
        assert_eq!(order_name(Some("Linen shirt"), 1), "Linen shirt");
        assert_eq!(order_name(Some("Linen shirt"), 3), "Linen shirt and 2 more");
        assert_eq!(order_name(None, 0), "");
    }

    #[test]
    fn invalid_lines_are_rejected() {
        assert_matches!(normalize_lines(&[]), Err(ServiceError::ValidationError(_)));
        assert_matches!(
            normalize_lines(&[OrderLine { sku_id: Uuid::new_v4(), quantity: 0 }]),
            Err(ServiceError::ValidationError(_))
        );
        let sku = Uuid::new_v4();
        assert_matches!(
            normalize_lines(&[
                OrderLine { sku_id: sku, quantity: 60 },
                OrderLine { sku_id: sku, quantity: 60 },
            ]),
            Err(ServiceError::ValidationError(_))
        );
    }

    #[test]
    fn merged_quantity_near_i32_max_is_rejected() {
        let sku = Uuid::new_v4();
        assert_matches!(
            normalize_lines(&[
                OrderLine { sku_id: sku, quantity: i32::MAX },
                OrderLine { sku_id: sku, quantity: 1 },
            ]),
            Err(ServiceError::ValidationError(message)) if message.contains("exceeds")
        );
        assert_matches!(
            normalize_lines(&[
                OrderLine { sku_id: sku, quantity: 50 },
                OrderLine { sku_id: sku, quantity: i32::MAX },
            ]),
            Err(ServiceError::ValidationError(_))
        );
    }

    fn snapshot(line_total: i64) -> LineSnapshot {
        LineSnapshot {
            sku_id: Uuid::new_v4(),
            product_id: Uuid::new_v4(),
            product_name: "Wool coat".into(),
            color: "navy".into(),
            size: "M".into(),
            image_url: None,
            unit_price: line_total,
            quantity: 1,
            line_total,
        }
    }

    #[test]
    fn order_total_sums_lines_and_rejects_overflow() {
        assert_eq!(order_total(&[snapshot(9_000), snapshot(1_500)]).unwrap(), 10_500);
        assert_matches!(
            order_total(&[snapshot(i64::MAX), snapshot(1)]),
            Err(ServiceError::ValidationError(message)) if message == "order total overflows"
        );
    }

    #[test]
    fn refund_limits() {
        let order = paid_order(10_000, 4_000);
        assert!(check_refundable(&order, 6_000).is_ok());
        assert_matches!(
            check_refundable(&order, 6_001),
            Err(ServiceError::RefundExceedsPaid {
                requested: 6_001,
                refundable: 6_000
            })
        );
        assert_matches!(
            check_refundable(&order, 0),
            Err(ServiceError::ValidationError(_))
        );

        let mut refunded = paid_order(10_000, 10_000);
        refunded.status = OrderStatus::Refunded;
        assert_matches!(
            check_refundable(&refunded, 1),
            Err(ServiceError::RefundExceedsPaid { refundable: 0, .. })
        );

        let mut cancelled = paid_order(10_000, 0);
        cancelled.status = OrderStatus::Cancelled;
        assert_matches!(
            check_refundable(&cancelled, 1),
            Err(ServiceError::InvalidOrderState { action: "refund", .. })
        );
    }

    proptest! {
        #[test]
        fn refunds_accepted_in_sequence_never_exceed_paid(
            paid in 1i64..1_000_000,
            requests in proptest::collection::vec(1i64..500_000, 1..20)
        ) {
            let mut order = paid_order(paid, 0);
            for amount in requests {
                if check_refundable(&order, amount).is_ok() {
                    order.refunded_amount += amount;
                    if order.refunded_amount == order.paid_amount {
                        order.status = OrderStatus::Refunded;
                    }
                }
                prop_assert!(order.refunded_amount <= order.paid_amount);
            }
        }
    }
}
