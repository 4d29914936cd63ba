//! Inventory ledger.
//!
//! The only code that mutates SKU stock counters. Every counter change is a
//! single conditional `UPDATE` so concurrent checkouts serialize on the SKU
//! row: a reservation succeeds only while `product_stock >= quantity`, which
//! keeps stock from going negative without an application-level lock.
//!
//! Ledger operations that are part of a larger workflow are generic over
//! [`ConnectionTrait`] and run inside the caller's transaction.

use chrono::Utc;
use metrics::counter;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    db,
    entities::{
        inventory_reservation::{self, ReservationStatus},
        product, sku,
    },
    errors::ServiceError,
    events::{Event, EventSender},
};

/// Handle for a stock hold created by [`InventoryLedger::reserve`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationToken {
    pub id: Uuid,
    pub sku_id: Uuid,
    pub quantity: i32,
}

/// Stock level change worth announcing once the surrounding transaction commits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StockSignal {
    Depleted { sku_id: Uuid },
    Replenished { sku_id: Uuid, product_stock: i32 },
}

impl From<StockSignal> for Event {
    fn from(signal: StockSignal) -> Self {
        match signal {
            StockSignal::Depleted { sku_id } => Event::StockDepleted { sku_id },
            StockSignal::Replenished {
                sku_id,
                product_stock,
            } => Event::StockReplenished {
                sku_id,
                product_stock,
            },
        }
    }
}

/// Request to register a new variant of an existing product
#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct RegisterSkuRequest {
    pub product_id: Uuid,
    #[validate(length(min = 1, max = 50))]
    pub color: String,
    #[validate(length(min = 1, max = 20))]
    pub size: String,
    pub category_id: Option<Uuid>,
    #[validate(range(min = 0, max = 1000000))]
    pub initial_stock: i32,
    #[serde(default)]
    pub is_restock_available: bool,
}

/// Current stock view of a SKU
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SkuStock {
    pub id: Uuid,
    pub product_id: Uuid,
    pub color: String,
    pub size: String,
    pub initial_stock: i32,
    pub additional_stock: i32,
    pub product_stock: i32,
    pub is_sold_out: bool,
    pub is_restock_available: bool,
    pub is_restocked: bool,
}

impl From<sku::Model> for SkuStock {
    fn from(model: sku::Model) -> Self {
        Self {
            id: model.id,
            product_id: model.product_id,
            color: model.color,
            size: model.size,
            initial_stock: model.initial_stock,
            additional_stock: model.additional_stock,
            product_stock: model.product_stock,
            is_sold_out: model.is_sold_out,
            is_restock_available: model.is_restock_available,
            is_restocked: model.is_restocked,
        }
    }
}

#[derive(Clone)]
pub struct InventoryLedger {
    db: Arc<DatabaseConnection>,
    event_sender: Option<Arc<EventSender>>,
}

impl InventoryLedger {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Option<Arc<EventSender>>) -> Self {
        Self { db, event_sender }
    }

    /// Holds `quantity` units of a SKU for an order.
    ///
    /// Fails with `InsufficientStock` when fewer units are available, leaving
    /// the counter untouched.
    #[instrument(skip(self, conn))]
    pub async fn reserve<C: ConnectionTrait>(
        &self,
        conn: &C,
        order_id: Uuid,
        sku_id: Uuid,
        quantity: i32,
    ) -> Result<(ReservationToken, Option<StockSignal>), ServiceError> {
        if quantity <= 0 {
            return Err(ServiceError::ValidationError(format!(
                "quantity must be positive, got {}",
                quantity
            )));
        }

        let claimed = sku::Entity::update_many()
            .col_expr(
                sku::Column::ProductStock,
                Expr::col(sku::Column::ProductStock).sub(quantity),
            )
            .col_expr(sku::Column::Version, Expr::col(sku::Column::Version).add(1))
            .col_expr(sku::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(sku::Column::Id.eq(sku_id))
            .filter(sku::Column::ProductStock.gte(quantity))
            .exec(conn)
            .await?;

        if claimed.rows_affected != 1 {
            let current = sku::Entity::find_by_id(sku_id)
                .one(conn)
                .await?
                .ok_or_else(|| ServiceError::NotFound(format!("sku {} not found", sku_id)))?;
            counter!("storefront.inventory.reservations_rejected", 1);
            warn!(
                sku_id = %sku_id,
                available = current.product_stock,
                requested = quantity,
                "stock reservation rejected"
            );
            return Err(ServiceError::InsufficientStock(format!(
                "sku {} has {} left, {} requested",
                sku_id, current.product_stock, quantity
            )));
        }

        let depleted = mark_sold_out_if_empty(conn, sku_id).await?;

        let now = Utc::now();
        let reservation = inventory_reservation::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            sku_id: Set(sku_id),
            quantity: Set(quantity),
            status: Set(ReservationStatus::Held),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(conn)
        .await?;

        debug!(sku_id = %sku_id, quantity, reservation_id = %reservation.id, "stock held");

        Ok((
            ReservationToken {
                id: reservation.id,
                sku_id,
                quantity,
            },
            depleted.then_some(StockSignal::Depleted { sku_id }),
        ))
    }

    /// Makes a hold permanent. Committing an already committed hold is a no-op.
    #[instrument(skip(self, conn))]
    pub async fn commit<C: ConnectionTrait>(
        &self,
        conn: &C,
        reservation_id: Uuid,
    ) -> Result<(), ServiceError> {
        if transition(
            conn,
            reservation_id,
            ReservationStatus::Held,
            ReservationStatus::Committed,
        )
        .await?
        {
            return Ok(());
        }

        match load_reservation(conn, reservation_id).await?.status {
            ReservationStatus::Committed => Ok(()),
            other => Err(ServiceError::Conflict(format!(
                "reservation {} is {:?} and cannot be committed",
                reservation_id, other
            ))),
        }
    }

    /// Returns held stock to the SKU. Releasing twice has no further effect.
    ///
    /// Committed holds are not released here; use [`Self::return_to_stock`].
    #[instrument(skip(self, conn))]
    pub async fn release<C: ConnectionTrait>(
        &self,
        conn: &C,
        reservation_id: Uuid,
    ) -> Result<Option<StockSignal>, ServiceError> {
        if transition(
            conn,
            reservation_id,
            ReservationStatus::Held,
            ReservationStatus::Released,
        )
        .await?
        {
            let reservation = load_reservation(conn, reservation_id).await?;
            let stock = increment_stock(conn, reservation.sku_id, reservation.quantity).await?;
            return Ok(Some(StockSignal::Replenished {
                sku_id: reservation.sku_id,
                product_stock: stock,
            }));
        }

        match load_reservation(conn, reservation_id).await?.status {
            ReservationStatus::Released | ReservationStatus::Restocked => Ok(None),
            other => Err(ServiceError::Conflict(format!(
                "reservation {} is {:?} and cannot be released",
                reservation_id, other
            ))),
        }
    }

    /// Puts committed (sold) units back on sale, e.g. after a paid order is
    /// cancelled or fully refunded. Idempotent like [`Self::release`].
    #[instrument(skip(self, conn))]
    pub async fn return_to_stock<C: ConnectionTrait>(
        &self,
        conn: &C,
        reservation_id: Uuid,
    ) -> Result<Option<StockSignal>, ServiceError> {
        if transition(
            conn,
            reservation_id,
            ReservationStatus::Committed,
            ReservationStatus::Restocked,
        )
        .await?
        {
            let reservation = load_reservation(conn, reservation_id).await?;
            let stock = increment_stock(conn, reservation.sku_id, reservation.quantity).await?;
            return Ok(Some(StockSignal::Replenished {
                sku_id: reservation.sku_id,
                product_stock: stock,
            }));
        }

        match load_reservation(conn, reservation_id).await?.status {
            ReservationStatus::Released | ReservationStatus::Restocked => Ok(None),
            other => Err(ServiceError::Conflict(format!(
                "reservation {} is {:?} and cannot be restocked",
                reservation_id, other
            ))),
        }
    }

    /// Commits every outstanding hold of an order
    pub async fn commit_order<C: ConnectionTrait>(
        &self,
        conn: &C,
        order_id: Uuid,
    ) -> Result<(), ServiceError> {
        for reservation in self.reservations_for_order(conn, order_id).await? {
            if reservation.status == ReservationStatus::Held {
                self.commit(conn, reservation.id).await?;
            }
        }
        Ok(())
    }

    /// Gives back all stock an order is holding or has consumed
    pub async fn restore_order<C: ConnectionTrait>(
        &self,
        conn: &C,
        order_id: Uuid,
    ) -> Result<Vec<StockSignal>, ServiceError> {
        let mut signals = Vec::new();
        for reservation in self.reservations_for_order(conn, order_id).await? {
            let signal = match reservation.status {
                ReservationStatus::Held => self.release(conn, reservation.id).await?,
                ReservationStatus::Committed => self.return_to_stock(conn, reservation.id).await?,
                ReservationStatus::Released | ReservationStatus::Restocked => None,
            };
            signals.extend(signal);
        }
        Ok(signals)
    }

    pub async fn reservations_for_order<C: ConnectionTrait>(
        &self,
        conn: &C,
        order_id: Uuid,
    ) -> Result<Vec<inventory_reservation::Model>, ServiceError> {
        Ok(inventory_reservation::Entity::find()
            .filter(inventory_reservation::Column::OrderId.eq(order_id))
            .order_by_asc(inventory_reservation::Column::CreatedAt)
            .all(conn)
            .await?)
    }

    /// Creates a SKU with its opening stock
    #[instrument(skip(self, request), fields(product_id = %request.product_id))]
    pub async fn register_sku(&self, request: RegisterSkuRequest) -> Result<SkuStock, ServiceError> {
        request.validate()?;

        product::Entity::find_by_id(request.product_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("product {} not found", request.product_id))
            })?;

        let now = Utc::now();
        let model = sku::ActiveModel {
            id: Set(Uuid::new_v4()),
            product_id: Set(request.product_id),
            color: Set(request.color),
            size: Set(request.size),
            category_id: Set(request.category_id),
            initial_stock: Set(request.initial_stock),
            additional_stock: Set(0),
            product_stock: Set(request.initial_stock),
            is_sold_out: Set(request.initial_stock == 0),
            is_restock_available: Set(request.is_restock_available),
            is_restocked: Set(false),
            version: Set(1),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await
        .map_err(ServiceError::from)
        .map_err(|err| {
            if err.is_unique_violation() {
                ServiceError::Conflict("a sku with this color and size already exists".into())
            } else {
                err
            }
        })?;

        info!(sku_id = %model.id, stock = model.product_stock, "sku registered");
        Ok(model.into())
    }

    /// Adds freshly received units to a SKU
    #[instrument(skip(self))]
    pub async fn restock(&self, sku_id: Uuid, quantity: i32) -> Result<SkuStock, ServiceError> {
        if quantity <= 0 {
            return Err(ServiceError::ValidationError(
                "restock quantity must be positive".into(),
            ));
        }

        let txn = self.db.begin().await?;
        let result = async {
            let updated = sku::Entity::update_many()
                .col_expr(
                    sku::Column::ProductStock,
                    Expr::col(sku::Column::ProductStock).add(quantity),
                )
                .col_expr(
                    sku::Column::AdditionalStock,
                    Expr::col(sku::Column::AdditionalStock).add(quantity),
                )
                .col_expr(sku::Column::IsSoldOut, Expr::value(false))
                .col_expr(sku::Column::IsRestocked, Expr::value(true))
                .col_expr(sku::Column::Version, Expr::col(sku::Column::Version).add(1))
                .col_expr(sku::Column::UpdatedAt, Expr::value(Utc::now()))
                .filter(sku::Column::Id.eq(sku_id))
                .exec(&txn)
                .await?;
            if updated.rows_affected == 0 {
                return Err(ServiceError::NotFound(format!("sku {} not found", sku_id)));
            }
            find_sku(&txn, sku_id).await
        }
        .await;
        let model = db::settle(txn, result).await?;

        info!(sku_id = %sku_id, added = quantity, stock = model.product_stock, "sku restocked");
        self.announce(vec![StockSignal::Replenished {
            sku_id,
            product_stock: model.product_stock,
        }])
        .await;
        Ok(model.into())
    }

    /// Toggles whether shoppers may ask for a restock notification
    pub async fn set_restock_available(
        &self,
        sku_id: Uuid,
        available: bool,
    ) -> Result<SkuStock, ServiceError> {
        let model = find_sku(&*self.db, sku_id).await?;
        let mut active: sku::ActiveModel = model.into();
        active.is_restock_available = Set(available);
        active.updated_at = Set(Utc::now());
        Ok(active.update(&*self.db).await?.into())
    }

    pub async fn get_sku(&self, sku_id: Uuid) -> Result<SkuStock, ServiceError> {
        Ok(find_sku(&*self.db, sku_id).await?.into())
    }

    /// Publishes stock signals collected inside a committed transaction
    pub async fn announce(&self, signals: Vec<StockSignal>) {
        let Some(sender) = &self.event_sender else {
            return;
        };
        for signal in signals {
            sender.send_or_log(signal.into()).await;
        }
    }
}

pub(crate) async fn find_sku<C: ConnectionTrait>(
    conn: &C,
    sku_id: Uuid,
) -> Result<sku::Model, ServiceError> {
    sku::Entity::find_by_id(sku_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("sku {} not found", sku_id)))
}

async fn load_reservation<C: ConnectionTrait>(
    conn: &C,
    reservation_id: Uuid,
) -> Result<inventory_reservation::Model, ServiceError> {
    inventory_reservation::Entity::find_by_id(reservation_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("reservation {} not found", reservation_id)))
}

/// Moves a reservation between states only if it is still in `from`.
async fn transition<C: ConnectionTrait>(
    conn: &C,
    reservation_id: Uuid,
    from: ReservationStatus,
    to: ReservationStatus,
) -> Result<bool, ServiceError> {
    let result = inventory_reservation::Entity::update_many()
        .col_expr(inventory_reservation::Column::Status, Expr::value(to))
        .col_expr(
            inventory_reservation::Column::UpdatedAt,
            Expr::value(Utc::now()),
        )
        .filter(inventory_reservation::Column::Id.eq(reservation_id))
        .filter(inventory_reservation::Column::Status.eq(from))
        .exec(conn)
        .await?;
    Ok(result.rows_affected == 1)
}

async fn mark_sold_out_if_empty<C: ConnectionTrait>(
    conn: &C,
    sku_id: Uuid,
) -> Result<bool, ServiceError> {
    let result = sku::Entity::update_many()
        .col_expr(sku::Column::IsSoldOut, Expr::value(true))
        .filter(sku::Column::Id.eq(sku_id))
        .filter(sku::Column::ProductStock.eq(0))
        .filter(sku::Column::IsSoldOut.eq(false))
        .exec(conn)
        .await?;
    Ok(result.rows_affected == 1)
}

async fn increment_stock<C: ConnectionTrait>(
    conn: &C,
    sku_id: Uuid,
    quantity: i32,
) -> Result<i32, ServiceError> {
    sku::Entity::update_many()
        .col_expr(
            sku::Column::ProductStock,
            Expr::col(sku::Column::ProductStock).add(quantity),
        )
        .col_expr(sku::Column::IsSoldOut, Expr::value(false))
        .col_expr(sku::Column::Version, Expr::col(sku::Column::Version).add(1))
        .col_expr(sku::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(sku::Column::Id.eq(sku_id))
        .exec(conn)
        .await?;
    Ok(find_sku(conn, sku_id).await?.product_stock)
}
