use crate::{
    entities::{
        voucher::{self, DiscountType, Entity as VoucherEntity},
        voucher_category::{self, Entity as VoucherCategoryEntity},
    },
    errors::ServiceError,
};
use chrono::{DateTime, Utc};
use metrics::counter;
use rust_decimal::{Decimal, RoundingStrategy};
use sea_orm::{
    sea_query::Expr,
    ColumnTrait, Condition, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter, QuerySelect,
};
use serde::Serialize;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

/// Outcome of applying a voucher to an amount
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct Redemption {
    pub voucher_id: Uuid,
    pub code: String,
    pub discount_amount: i64,
    pub final_amount: i64,
}

/// Discount for `amount`, never more than `amount` itself.
pub fn compute_discount(voucher: &voucher::Model, amount: i64) -> i64 {
    let raw = match voucher.discount_type {
        DiscountType::Percentage => {
            let pct = (Decimal::from(amount) * Decimal::from(voucher.discount_value)
                / Decimal::ONE_HUNDRED)
                .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
            let pct = i64::try_from(pct).unwrap_or(0);
            match voucher.max_discount {
                Some(cap) => pct.min(cap),
                None => pct,
            }
        }
        DiscountType::Fixed => voucher.discount_value,
    };
    raw.clamp(0, amount.max(0))
}

/// Voucher checks and redemption.
#[derive(Debug, Clone, Default)]
pub struct VoucherService;

impl VoucherService {
    pub fn new() -> Self {
        Self
    }

    /// Computes the discount without consuming the voucher.
    #[instrument(skip(self, conn))]
    pub async fn quote<C: ConnectionTrait>(
        &self,
        conn: &C,
        code: &str,
        amount: i64,
        category_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<Redemption, ServiceError> {
        let voucher = self.find_live(conn, code, now).await?;
        if voucher.is_exhausted() {
            return Err(ServiceError::VoucherExhausted(code.to_string()));
        }
        self.check_applicable(conn, &voucher, amount, category_id)
            .await?;
        Ok(Self::redemption(&voucher, amount))
    }

    /// Redeems `code` against `amount` inside the caller's transaction.
    ///
    /// The voucher row is locked and re-read before the checks, and the usage
    /// increment is guarded by the limit so the count can never exceed it
    /// even on backends without row locks.
    #[instrument(skip(self, txn))]
    pub async fn redeem<C: ConnectionTrait>(
        &self,
        txn: &C,
        code: &str,
        amount: i64,
        category_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<Redemption, ServiceError> {
        let candidate = self.find_live(txn, code, now).await?;

        let voucher = VoucherEntity::find_by_id(candidate.id)
            .lock_exclusive()
            .one(txn)
            .await?
            .ok_or_else(|| ServiceError::VoucherInvalid(code.to_string()))?;

        if voucher.is_exhausted() {
            counter!("topup_voucher.exhausted", 1);
            return Err(ServiceError::VoucherExhausted(code.to_string()));
        }
        self.check_applicable(txn, &voucher, amount, category_id)
            .await?;

        let updated = VoucherEntity::update_many()
            .col_expr(
                voucher::Column::UsageCount,
                Expr::col(voucher::Column::UsageCount).add(1),
            )
            .col_expr(voucher::Column::UpdatedAt, Expr::value(now))
            .filter(voucher::Column::Id.eq(voucher.id))
            .filter(
                Condition::any()
                    .add(voucher::Column::UsageLimit.is_null())
                    .add(
                        Expr::col(voucher::Column::UsageCount)
                            .lt(Expr::col(voucher::Column::UsageLimit)),
                    ),
            )
            .exec(txn)
            .await?;

        if updated.rows_affected != 1 {
            counter!("topup_voucher.exhausted", 1);
            return Err(ServiceError::VoucherExhausted(code.to_string()));
        }

        let redemption = Self::redemption(&voucher, amount);
        counter!("topup_voucher.redeemed", 1);
        info!(
            voucher = %redemption.code,
            discount = redemption.discount_amount,
            final_amount = redemption.final_amount,
            "voucher redeemed"
        );
        Ok(redemption)
    }

    /// Gives back one use of a voucher whose order failed.
    pub async fn release<C: ConnectionTrait>(
        &self,
        txn: &C,
        voucher_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        let updated = VoucherEntity::update_many()
            .col_expr(
                voucher::Column::UsageCount,
                Expr::col(voucher::Column::UsageCount).sub(1),
            )
            .col_expr(voucher::Column::UpdatedAt, Expr::value(now))
            .filter(voucher::Column::Id.eq(voucher_id))
            .filter(voucher::Column::UsageCount.gt(0))
            .exec(txn)
            .await?;
        if updated.rows_affected == 0 {
            warn!(%voucher_id, "voucher release skipped; usage already zero");
        }
        Ok(())
    }

    async fn find_live<C: ConnectionTrait>(
        &self,
        conn: &C,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<voucher::Model, ServiceError> {
        VoucherEntity::find()
            .filter(voucher::Column::Code.eq(code))
            .filter(voucher::Column::IsActive.eq(true))
            .filter(voucher::Column::StartDate.lte(now))
            .filter(voucher::Column::ExpiryDate.gte(now))
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::VoucherInvalid(code.to_string()))
    }

    async fn check_applicable<C: ConnectionTrait>(
        &self,
        conn: &C,
        voucher: &voucher::Model,
        amount: i64,
        category_id: Option<Uuid>,
    ) -> Result<(), ServiceError> {
        if let Some(minimum) = voucher.min_purchase {
            if amount < minimum {
                return Err(ServiceError::MinPurchaseNotMet { minimum, amount });
            }
        }

        if voucher.is_for_all_categories {
            return Ok(());
        }

        let Some(category_id) = category_id else {
            return Err(ServiceError::CategoryNotApplicable(voucher.code.clone()));
        };

        let matches = VoucherCategoryEntity::find()
            .filter(voucher_category::Column::VoucherId.eq(voucher.id))
            .filter(voucher_category::Column::CategoryId.eq(category_id))
            .count(conn)
            .await?;
        if matches == 0 {
            return Err(ServiceError::CategoryNotApplicable(voucher.code.clone()));
        }
        Ok(())
    }

    fn redemption(voucher: &voucher::Model, amount: i64) -> Redemption {
        let discount_amount = compute_discount(voucher, amount);
        Redemption {
            voucher_id: voucher.id,
            code: voucher.code.clone(),
            discount_amount,
            final_amount: (amount - discount_amount).max(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn voucher(discount_type: DiscountType, value: i64, max: Option<i64>) -> voucher::Model {
        let now = Utc::now();
        voucher::Model {
            id: Uuid::new_v4(),
            code: "SAVE10".into(),
            discount_type,
            discount_value: value,
            max_discount: max,
            min_purchase: None,
            usage_limit: None,
            usage_count: 0,
            is_active: true,
            is_for_all_categories: true,
            start_date: now - Duration::days(1),
            expiry_date: now + Duration::days(1),
            description: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn percentage_discount_is_capped() {
        let v = voucher(DiscountType::Percentage, 10, Some(5_000));
        assert_eq!(compute_discount(&v, 100_000), 5_000);
        assert_eq!(compute_discount(&v, 20_000), 2_000);
    }

    #[test]
    fn fixed_discount_never_exceeds_amount() {
        let v = voucher(DiscountType::Fixed, 25_000, None);
        assert_eq!(compute_discount(&v, 100_000), 25_000);
        assert_eq!(compute_discount(&v, 10_000), 10_000);
    }

    #[test]
    fn redemption_clamps_final_amount_at_zero() {
        let v = voucher(DiscountType::Fixed, 50_000, None);
        let r = VoucherService::redemption(&v, 30_000);
        assert_eq!(r.discount_amount, 30_000);
        assert_eq!(r.final_amount, 0);
    }

    #[test]
    fn exhaustion_respects_limit() {
        let mut v = voucher(DiscountType::Fixed, 1, None);
        v.usage_count = 100;
        assert!(!v.is_exhausted());
        v.usage_limit = Some(100);
        assert!(v.is_exhausted());
    }
}
