use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveValue, Set};
use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;

/// Order lifecycle.
///
/// ```text
/// PENDING ──▶ AWAITING_PAYMENT ──▶ PAID ──▶ CANCELLED | REFUNDED
///    │               │
///    └──────┬────────┴──▶ CANCELLED | FAILED
/// ```
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    EnumIter,
    DeriveActiveEnum,
    ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    #[sea_orm(string_value = "PENDING")]
    Pending,
    #[sea_orm(string_value = "AWAITING_PAYMENT")]
    AwaitingPayment,
    #[sea_orm(string_value = "PAID")]
    Paid,
    #[sea_orm(string_value = "CANCELLED")]
    Cancelled,
    #[sea_orm(string_value = "REFUNDED")]
    Refunded,
    #[sea_orm(string_value = "FAILED")]
    Failed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::AwaitingPayment => "AWAITING_PAYMENT",
            OrderStatus::Paid => "PAID",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Refunded => "REFUNDED",
            OrderStatus::Failed => "FAILED",
        }
    }

    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Pending, AwaitingPayment)
                | (Pending, Paid)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (AwaitingPayment, Paid)
                | (AwaitingPayment, Cancelled)
                | (AwaitingPayment, Failed)
                | (Paid, Cancelled)
                | (Paid, Refunded)
        )
    }

    /// Statuses from which `next` may be entered
    pub fn sources_of(next: OrderStatus) -> Vec<OrderStatus> {
        use sea_orm::Iterable;
        OrderStatus::iter()
            .filter(|from| from.can_transition_to(next))
            .collect()
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Cancelled | OrderStatus::Refunded | OrderStatus::Failed
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub member_id: Uuid,
    pub status: OrderStatus,
    /// Sum of line totals, fixed when the order is placed
    pub total_price: i64,
    pub paid_amount: i64,
    pub refunded_amount: i64,
    // Shipping address snapshot
    pub recipient_name: String,
    pub recipient_phone: String,
    pub zip_code: String,
    pub address: String,
    pub address_detail: Option<String>,
    pub delivery_message: Option<String>,
    pub payment_intent_id: Option<String>,
    pub ordered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i32,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_product::Entity")]
    OrderProduct,
}

impl Related<super::order_product::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderProduct.def()
    }
}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {
    async fn before_save<C>(self, _db: &C, insert: bool) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        let mut active_model = self;
        let now = Utc::now();

        if insert {
            if let ActiveValue::NotSet = active_model.id {
                active_model.id = Set(Uuid::new_v4());
            }
            if let ActiveValue::NotSet = active_model.ordered_at {
                active_model.ordered_at = Set(now);
            }
            active_model.version = Set(1);
        }
        active_model.updated_at = Set(now);

        Ok(active_model)
    }
}

impl Model {
    /// Amount that can still be handed back to the buyer
    pub fn refundable_amount(&self) -> i64 {
        (self.paid_amount - self.refunded_amount).max(0)
    }
}
