use super::user::MembershipTier;
use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Catalog item. Owned by the catalog; this service only reads it.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "products")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Storefront product code used by checkout requests
    #[sea_orm(unique)]
    pub code: String,

    pub name: String,
    pub category_id: Uuid,

    /// SKU sent to the goods provider
    pub provider_sku: String,

    pub price_regular: i64,
    pub price_gold: i64,
    pub price_platinum: i64,
    pub price_reseller: i64,

    pub profit_regular: i64,
    pub profit_gold: i64,
    pub profit_platinum: i64,
    pub profit_reseller: i64,

    pub is_flash_sale: bool,
    pub flash_sale_price: Option<i64>,
    pub flash_sale_expires_at: Option<DateTime<Utc>>,

    pub is_active: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn tier_price(&self, tier: MembershipTier) -> i64 {
        match tier {
            MembershipTier::Regular => self.price_regular,
            MembershipTier::Gold => self.price_gold,
            MembershipTier::Platinum => self.price_platinum,
            MembershipTier::Reseller => self.price_reseller,
        }
    }

    pub fn tier_profit(&self, tier: MembershipTier) -> i64 {
        match tier {
            MembershipTier::Regular => self.profit_regular,
            MembershipTier::Gold => self.profit_gold,
            MembershipTier::Platinum => self.profit_platinum,
            MembershipTier::Reseller => self.profit_reseller,
        }
    }

    /// Flash-sale price if the sale is flagged, priced, and not yet expired.
    pub fn active_flash_price(&self, now: DateTime<Utc>) -> Option<i64> {
        if !self.is_flash_sale {
            return None;
        }
        match (self.flash_sale_price, self.flash_sale_expires_at) {
            (Some(price), Some(expires_at)) if now < expires_at => Some(price),
            _ => None,
        }
    }
}
