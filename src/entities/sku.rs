use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// A sellable variant (product × color × size) and its stock counters.
///
/// Only the inventory ledger mutates the counters, always through
/// conditional updates so `product_stock` never drops below zero.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "skus")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub product_id: Uuid,
    pub color: String,
    pub size: String,
    pub category_id: Option<Uuid>,
    pub initial_stock: i32,
    pub additional_stock: i32,
    pub product_stock: i32,
    pub is_sold_out: bool,
    pub is_restock_available: bool,
    pub is_restocked: bool,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn can_supply(&self, quantity: i32) -> bool {
        quantity > 0 && self.product_stock >= quantity
    }
}
