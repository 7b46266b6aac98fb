use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// What the customer is paying for. Stored explicitly; the merchant order id
/// prefix is only consulted at the callback boundary.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    ToSchema,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    #[sea_orm(string_value = "DEPOSIT")]
    Deposit,
    #[sea_orm(string_value = "MEMBERSHIP")]
    Membership,
    #[sea_orm(string_value = "PURCHASE")]
    Purchase,
}

impl OrderType {
    /// Prefix used when minting merchant order ids.
    pub fn prefix(self) -> &'static str {
        match self {
            OrderType::Deposit => "DEP",
            OrderType::Membership => "MEM",
            OrderType::Purchase => "VAZ",
        }
    }

    /// Infers the type from a merchant order id. `ORD-` is the legacy
    /// purchase prefix.
    pub fn from_order_id(order_id: &str) -> Option<Self> {
        let (prefix, _) = order_id.split_once('-')?;
        match prefix {
            "DEP" => Some(OrderType::Deposit),
            "MEM" => Some(OrderType::Membership),
            "VAZ" | "ORD" => Some(OrderType::Purchase),
            _ => None,
        }
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    ToSchema,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    #[sea_orm(string_value = "PENDING")]
    Pending,
    #[sea_orm(string_value = "PROCESS")]
    Process,
    #[sea_orm(string_value = "PAID")]
    Paid,
    #[sea_orm(string_value = "SUCCESS")]
    Success,
    #[sea_orm(string_value = "FAILED")]
    Failed,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Success | OrderStatus::Failed)
    }

    /// Allowed forward moves. Status never goes backwards; FAILED is the only
    /// exit from a non-terminal state that skips ahead.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Pending, Process)
                | (Pending, Paid)
                | (Pending, Success)
                | (Pending, Failed)
                | (Paid, Process)
                | (Paid, Success)
                | (Paid, Failed)
                | (Process, Success)
                | (Process, Failed)
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Merchant order id shared with the gateway and provider
    #[sea_orm(unique)]
    pub order_id: String,

    pub order_type: OrderType,

    pub product_ref: Option<String>,
    pub product_name: Option<String>,
    pub provider_sku: Option<String>,

    /// Destination account / phone number / meter id
    pub buyer_reference: String,
    /// Notification destination
    pub customer_phone: Option<String>,

    pub username: Option<String>,
    pub voucher_id: Option<Uuid>,

    pub charge_amount: i64,
    pub discount_amount: i64,
    pub final_amount: i64,
    pub expected_profit: i64,

    pub purchase_price: Option<i64>,
    pub profit_amount: Option<i64>,

    pub payment_method: String,
    pub status: OrderStatus,

    /// Serial number / voucher code returned by the provider
    pub provider_reference: Option<String>,

    pub log: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_one = "super::payment::Entity")]
    Payment,
}

impl Related<super::payment::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Payment.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
