use crate::{
    db::DbPool,
    entities::{
        product::{self, Entity as ProductEntity},
        user::MembershipTier,
    },
    errors::ServiceError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Price a given tier pays for a product at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PriceQuote {
    pub product_code: String,
    pub product_name: String,
    pub category_id: Uuid,
    pub provider_sku: String,
    pub amount: i64,
    pub profit_margin: i64,
    pub flash_sale: bool,
}

/// Resolves the charge amount for `tier`.
///
/// An active flash sale wins for every tier except platinum, which only takes
/// the flash price when it undercuts the platinum price.
pub fn resolve_price(
    product: &product::Model,
    tier: MembershipTier,
    now: DateTime<Utc>,
) -> PriceQuote {
    let tier_price = product.tier_price(tier);
    let flash = product.active_flash_price(now);

    let (amount, flash_sale) = match (tier, flash) {
        (MembershipTier::Platinum, Some(flash)) if flash < tier_price => (flash, true),
        (MembershipTier::Platinum, _) => (tier_price, false),
        (_, Some(flash)) => (flash, true),
        (_, None) => (tier_price, false),
    };

    PriceQuote {
        product_code: product.code.clone(),
        product_name: product.name.clone(),
        category_id: product.category_id,
        provider_sku: product.provider_sku.clone(),
        amount,
        profit_margin: product.tier_profit(tier),
        flash_sale,
    }
}

/// Catalog capability consumed by checkout.
#[async_trait]
pub trait CatalogLookup: Send + Sync {
    async fn resolve_price(
        &self,
        product_ref: &str,
        tier: MembershipTier,
    ) -> Result<PriceQuote, ServiceError>;
}

/// Catalog backed by the `products` table.
#[derive(Clone)]
pub struct DbCatalog {
    db: Arc<DbPool>,
}

impl DbCatalog {
    pub fn new(db: Arc<DbPool>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CatalogLookup for DbCatalog {
    #[instrument(skip(self))]
    async fn resolve_price(
        &self,
        product_ref: &str,
        tier: MembershipTier,
    ) -> Result<PriceQuote, ServiceError> {
        let product = ProductEntity::find()
            .filter(product::Column::Code.eq(product_ref))
            .filter(product::Column::IsActive.eq(true))
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::ProductNotFound(product_ref.to_string()))?;

        let quote = resolve_price(&product, tier, Utc::now());
        debug!(
            product = %quote.product_code,
            amount = quote.amount,
            flash_sale = quote.flash_sale,
            "price resolved"
        );
        Ok(quote)
    }
}
