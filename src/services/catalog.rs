use chrono::Utc;
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, Set};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{entities::product, errors::ServiceError};

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct CreateProductRequest {
    #[validate(length(min = 1, max = 200))]
    pub name: String,
    pub price: i64,
    #[serde(default)]
    pub discount_rate: i32,
    #[validate(url)]
    pub image_url: Option<String>,
    pub category_id: Option<Uuid>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct UpdatePricingRequest {
    pub price: i64,
    pub discount_rate: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ProductResponse {
    pub id: Uuid,
    pub name: String,
    pub price: i64,
    pub discount_rate: i32,
    pub sale_price: i64,
    pub image_url: Option<String>,
    pub category_id: Option<Uuid>,
}

impl From<product::Model> for ProductResponse {
    fn from(model: product::Model) -> Self {
        Self {
            sale_price: model.sale_price(),
            id: model.id,
            name: model.name,
            price: model.price,
            discount_rate: model.discount_rate,
            image_url: model.image_url,
            category_id: model.category_id,
        }
    }
}

/// Checks the price / discount pair as a unit.
pub fn validate_pricing(price: i64, discount_rate: i32) -> Result<(), ServiceError> {
    if price <= 0 {
        return Err(ServiceError::ValidationError(
            "price must be greater than zero".into(),
        ));
    }
    if !(0..=100).contains(&discount_rate) {
        return Err(ServiceError::ValidationError(format!(
            "discount rate must be between 0 and 100, got {}",
            discount_rate
        )));
    }
    if discount_rate > 0 && product::discounted_price(price, discount_rate) == 0 && discount_rate < 100
    {
        return Err(ServiceError::ValidationError(
            "discount would reduce the price to zero".into(),
        ));
    }
    Ok(())
}

/// Minimal product registry backing SKU pricing
#[derive(Clone)]
pub struct CatalogService {
    db: Arc<DatabaseConnection>,
}

impl CatalogService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    #[instrument(skip(self, request), fields(name = %request.name))]
    pub async fn create_product(
        &self,
        request: CreateProductRequest,
    ) -> Result<ProductResponse, ServiceError> {
        request.validate()?;
        validate_pricing(request.price, request.discount_rate)?;

        let now = Utc::now();
        let model = product::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(request.name),
            price: Set(request.price),
            discount_rate: Set(request.discount_rate),
            image_url: Set(request.image_url),
            category_id: Set(request.category_id),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await?;

        info!(product_id = %model.id, "product created");
        Ok(model.into())
    }

    /// Changes the live price. Orders already placed keep their snapshot.
    #[instrument(skip(self))]
    pub async fn update_pricing(
        &self,
        product_id: Uuid,
        request: UpdatePricingRequest,
    ) -> Result<ProductResponse, ServiceError> {
        validate_pricing(request.price, request.discount_rate)?;

        let model = self.find(product_id).await?;
        let mut active: product::ActiveModel = model.into();
        active.price = Set(request.price);
        active.discount_rate = Set(request.discount_rate);
        active.updated_at = Set(Utc::now());
        Ok(active.update(&*self.db).await?.into())
    }

    pub async fn get_product(&self, product_id: Uuid) -> Result<ProductResponse, ServiceError> {
        Ok(self.find(product_id).await?.into())
    }

    async fn find(&self, product_id: Uuid) -> Result<product::Model, ServiceError> {
        product::Entity::find_by_id(product_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("product {} not found", product_id)))
    }
}
