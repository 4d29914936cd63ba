use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "products")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub name: String,
    /// List price in won
    pub price: i64,
    /// Percentage off the list price, 0..=100
    pub discount_rate: i32,
    pub image_url: Option<String>,
    pub category_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Current selling price after discount
    pub fn sale_price(&self) -> i64 {
        discounted_price(self.price, self.discount_rate)
    }
}

/// Applies a percentage discount, flooring to whole won.
///
/// Rates outside 0..=100 are clamped; callers validate them at the boundary.
pub fn discounted_price(price: i64, discount_rate: i32) -> i64 {
    let rate = Decimal::from(discount_rate.clamp(0, 100));
    let hundred = Decimal::from(100);
    let discounted = Decimal::from(price) * (hundred - rate) / hundred;
    discounted.floor().to_i64().unwrap_or(price)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn discount_floors_to_whole_won() {
        assert_eq!(discounted_price(10_000, 0), 10_000);
        assert_eq!(discounted_price(10_000, 15), 8_500);
        assert_eq!(discounted_price(9_999, 33), 6_699);
        assert_eq!(discounted_price(10_000, 100), 0);
    }

    proptest! {
        #[test]
        fn discounted_price_never_exceeds_list_price(price in 0i64..10_000_000, rate in -10i32..120) {
            let sale = discounted_price(price, rate);
            prop_assert!(sale >= 0);
            prop_assert!(sale <= price);
        }
    }
}
