use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    entities::{cart_item, product, sku},
    errors::ServiceError,
    services::{inventory::find_sku, orders::OrderLine},
};

/// Upper bound on the quantity of a single cart line
pub const MAX_LINE_QUANTITY: i32 = 99;

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct AddCartItemRequest {
    pub sku_id: Uuid,
    #[validate(range(min = 1, max = 99))]
    pub quantity: i32,
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct UpdateCartItemRequest {
    #[validate(range(min = 1, max = 99))]
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CartLine {
    pub sku_id: Uuid,
    pub product_id: Uuid,
    pub product_name: String,
    pub color: String,
    pub size: String,
    pub unit_price: i64,
    pub quantity: i32,
    pub line_total: i64,
    /// Whether the requested quantity is currently in stock
    pub available: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CartView {
    pub member_id: Uuid,
    pub lines: Vec<CartLine>,
    pub total_price: i64,
}

/// Cart aggregator: a member's selected SKUs before checkout.
///
/// The cart never touches stock. Availability shown in [`CartView`] is a live
/// hint; the authoritative check happens when the order reserves stock.
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
}

impl CartService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Adds a SKU to the cart, merging with an existing line for the same SKU.
    #[instrument(skip(self, request), fields(sku_id = %request.sku_id))]
    pub async fn add_item(
        &self,
        member_id: Uuid,
        request: AddCartItemRequest,
    ) -> Result<CartView, ServiceError> {
        request.validate()?;
        find_sku(&*self.db, request.sku_id).await?;

        let now = Utc::now();
        match self.find_line(member_id, request.sku_id).await? {
            Some(existing) => {
                let merged = existing.quantity + request.quantity;
                if merged > MAX_LINE_QUANTITY {
                    return Err(ServiceError::ValidationError(format!(
                        "a cart line may hold at most {} units",
                        MAX_LINE_QUANTITY
                    )));
                }
                let mut active: cart_item::ActiveModel = existing.into();
                active.quantity = Set(merged);
                active.updated_at = Set(now);
                active.update(&*self.db).await?;
            }
            None => {
                cart_item::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    member_id: Set(member_id),
                    sku_id: Set(request.sku_id),
                    quantity: Set(request.quantity),
                    created_at: Set(now),
                    updated_at: Set(now),
                }
                .insert(&*self.db)
                .await?;
            }
        }

        info!(member_id = %member_id, "cart item added");
        self.view(member_id).await
    }

    pub async fn update_quantity(
        &self,
        member_id: Uuid,
        sku_id: Uuid,
        request: UpdateCartItemRequest,
    ) -> Result<CartView, ServiceError> {
        request.validate()?;
        let existing = self
            .find_line(member_id, sku_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("sku {} is not in the cart", sku_id)))?;

        let mut active: cart_item::ActiveModel = existing.into();
        active.quantity = Set(request.quantity);
        active.updated_at = Set(Utc::now());
        active.update(&*self.db).await?;

        self.view(member_id).await
    }

    pub async fn remove_item(&self, member_id: Uuid, sku_id: Uuid) -> Result<CartView, ServiceError> {
        let deleted = cart_item::Entity::delete_many()
            .filter(cart_item::Column::MemberId.eq(member_id))
            .filter(cart_item::Column::SkuId.eq(sku_id))
            .exec(&*self.db)
            .await?;
        if deleted.rows_affected == 0 {
            return Err(ServiceError::NotFound(format!(
                "sku {} is not in the cart",
                sku_id
            )));
        }
        self.view(member_id).await
    }

    /// Prices the cart at current sale prices
    pub async fn view(&self, member_id: Uuid) -> Result<CartView, ServiceError> {
        let items = cart_item::Entity::find()
            .filter(cart_item::Column::MemberId.eq(member_id))
            .order_by_asc(cart_item::Column::CreatedAt)
            .all(&*self.db)
            .await?;

        let sku_ids: Vec<Uuid> = items.iter().map(|i| i.sku_id).collect();
        let skus: HashMap<Uuid, sku::Model> = sku::Entity::find()
            .filter(sku::Column::Id.is_in(sku_ids))
            .all(&*self.db)
            .await?
            .into_iter()
            .map(|s| (s.id, s))
            .collect();
        let product_ids: Vec<Uuid> = skus.values().map(|s| s.product_id).collect();
        let products: HashMap<Uuid, product::Model> = product::Entity::find()
            .filter(product::Column::Id.is_in(product_ids))
            .all(&*self.db)
            .await?
            .into_iter()
            .map(|p| (p.id, p))
            .collect();

        let lines: Vec<CartLine> = items
            .into_iter()
            .filter_map(|item| {
                let sku = skus.get(&item.sku_id)?;
                let product = products.get(&sku.product_id)?;
                let unit_price = product.sale_price();
                Some(CartLine {
                    sku_id: sku.id,
                    product_id: product.id,
                    product_name: product.name.clone(),
                    color: sku.color.clone(),
                    size: sku.size.clone(),
                    unit_price,
                    quantity: item.quantity,
                    line_total: unit_price * i64::from(item.quantity),
                    available: sku.can_supply(item.quantity),
                })
            })
            .collect();

        Ok(CartView {
            member_id,
            total_price: lines.iter().map(|l| l.line_total).sum(),
            lines,
        })
    }

    /// Removes the selected lines (all lines when `sku_ids` is `None`) inside
    /// the caller's transaction and returns them as order lines.
    pub async fn take_lines<C: ConnectionTrait>(
        &self,
        conn: &C,
        member_id: Uuid,
        sku_ids: Option<&[Uuid]>,
    ) -> Result<Vec<OrderLine>, ServiceError> {
        let mut query = cart_item::Entity::find()
            .filter(cart_item::Column::MemberId.eq(member_id))
            .order_by_asc(cart_item::Column::CreatedAt);
        if let Some(ids) = sku_ids {
            query = query.filter(cart_item::Column::SkuId.is_in(ids.to_vec()));
        }
        let items = query.all(conn).await?;

        if items.is_empty() {
            return Err(ServiceError::ValidationError(
                "no cart lines selected for checkout".into(),
            ));
        }

        cart_item::Entity::delete_many()
            .filter(cart_item::Column::Id.is_in(items.iter().map(|i| i.id).collect::<Vec<_>>()))
            .exec(conn)
            .await?;

        Ok(items
            .into_iter()
            .map(|item| OrderLine {
                sku_id: item.sku_id,
                quantity: item.quantity,
            })
            .collect())
    }

    async fn find_line(
        &self,
        member_id: Uuid,
        sku_id: Uuid,
    ) -> Result<Option<cart_item::Model>, ServiceError> {
        Ok(cart_item::Entity::find()
            .filter(cart_item::Column::MemberId.eq(member_id))
            .filter(cart_item::Column::SkuId.eq(sku_id))
            .one(&*self.db)
            .await?)
    }
}
