use crate::{
    entities::{
        ledger_entry::{self, Entity as LedgerEntity, LedgerChangeType},
        user::{self, Entity as UserEntity},
    },
    errors::ServiceError,
};
use chrono::Utc;
use metrics::counter;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use thiserror::Error;
use tracing::{info, instrument};

/// A balance change about to be recorded
#[derive(Debug, Clone)]
pub struct BalanceChange<'a> {
    pub username: &'a str,
    pub delta: i64,
    pub change_type: LedgerChangeType,
    pub description: String,
    pub order_ref: Option<&'a str>,
}

/// Balance store. Every balance mutation goes through [`LedgerService::apply_delta`]
/// so that each one is paired with exactly one ledger row.
#[derive(Debug, Clone, Default)]
pub struct LedgerService;

impl LedgerService {
    pub fn new() -> Self {
        Self
    }

    /// Applies `change` to the user's balance and appends the matching entry,
    /// both on the caller's connection (normally an open transaction).
    #[instrument(skip(self, txn, change), fields(username = %change.username, delta = change.delta, change_type = %change.change_type))]
    pub async fn apply_delta<C: ConnectionTrait>(
        &self,
        txn: &C,
        change: BalanceChange<'_>,
    ) -> Result<ledger_entry::Model, ServiceError> {
        let user = UserEntity::find()
            .filter(user::Column::Username.eq(change.username))
            .lock_exclusive()
            .one(txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("user {}", change.username)))?;

        let balance_before = user.balance;
        let balance_after = balance_before
            .checked_add(change.delta)
            .ok_or_else(|| ServiceError::InternalError("balance overflow".to_string()))?;

        if change.change_type == LedgerChangeType::Usage && balance_after < 0 {
            counter!("topup_ledger.insufficient_balance", 1);
            return Err(ServiceError::InsufficientBalance {
                balance: balance_before,
                required: -change.delta,
            });
        }

        let now = Utc::now();
        // Compare-and-set on the old balance; a mismatch means someone wrote
        // the row outside this lock.
        let updated = UserEntity::update_many()
            .col_expr(user::Column::Balance, Expr::value(balance_after))
            .col_expr(user::Column::UpdatedAt, Expr::value(now))
            .filter(user::Column::Id.eq(user.id))
            .filter(user::Column::Balance.eq(balance_before))
            .exec(txn)
            .await?;
        if updated.rows_affected != 1 {
            return Err(ServiceError::Conflict(format!(
                "balance of {} changed concurrently",
                change.username
            )));
        }

        let entry = ledger_entry::ActiveModel {
            username: Set(user.username.clone()),
            change_type: Set(change.change_type),
            amount_delta: Set(change.delta),
            balance_before: Set(balance_before),
            balance_after: Set(balance_after),
            description: Set(change.description),
            order_ref: Set(change.order_ref.map(str::to_string)),
            created_at: Set(now),
            ..Default::default()
        }
        .insert(txn)
        .await?;

        counter!("topup_ledger.entries", 1, "change_type" => change.change_type.to_string());
        info!(
            entry_id = entry.id,
            balance_before, balance_after, "balance updated"
        );
        Ok(entry)
    }

    pub async fn balance<C: ConnectionTrait>(
        &self,
        conn: &C,
        username: &str,
    ) -> Result<i64, ServiceError> {
        UserEntity::find()
            .filter(user::Column::Username.eq(username))
            .one(conn)
            .await?
            .map(|u| u.balance)
            .ok_or_else(|| ServiceError::NotFound(format!("user {}", username)))
    }

    /// Ledger rows for `username`, oldest first.
    pub async fn history<C: ConnectionTrait>(
        &self,
        conn: &C,
        username: &str,
        limit: Option<u64>,
    ) -> Result<Vec<ledger_entry::Model>, ServiceError> {
        let mut query = LedgerEntity::find()
            .filter(ledger_entry::Column::Username.eq(username))
            .order_by_asc(ledger_entry::Column::Id);
        if let Some(limit) = limit {
            query = query.limit(limit);
        }
        Ok(query.all(conn).await?)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChainBreak {
    #[error("entry {id}: balance_after {after} != balance_before {before} + delta {delta}")]
    Arithmetic {
        id: i32,
        before: i64,
        delta: i64,
        after: i64,
    },
    #[error("entry {id}: balance_before {before} does not continue from {expected}")]
    Gap { id: i32, expected: i64, before: i64 },
}

/// Checks that every entry is internally consistent and chains from the one
/// before it. Returns the closing balance.
pub fn verify_chain(
    opening_balance: i64,
    entries: &[ledger_entry::Model],
) -> Result<i64, ChainBreak> {
    let mut running = opening_balance;
    for entry in entries {
        if entry.balance_before != running {
            return Err(ChainBreak::Gap {
                id: entry.id,
                expected: running,
                before: entry.balance_before,
            });
        }
        if entry.balance_before + entry.amount_delta != entry.balance_after {
            return Err(ChainBreak::Arithmetic {
                id: entry.id,
                before: entry.balance_before,
                delta: entry.amount_delta,
                after: entry.balance_after,
            });
        }
        running = entry.balance_after;
    }
    Ok(running)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: i32, before: i64, delta: i64, after: i64) -> ledger_entry::Model {
        ledger_entry::Model {
            id,
            username: "budi".into(),
            change_type: if delta < 0 {
                LedgerChangeType::Usage
            } else {
                LedgerChangeType::Deposit
            },
            amount_delta: delta,
            balance_before: before,
            balance_after: after,
            description: String::new(),
            order_ref: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn consistent_chain_returns_closing_balance() {
        let entries = vec![
            entry(1, 0, 100_000, 100_000),
            entry(2, 100_000, -20_000, 80_000),
            entry(3, 80_000, 19_860, 99_860),
        ];
        assert_eq!(verify_chain(0, &entries), Ok(99_860));
    }

    #[test]
    fn gap_between_entries_is_reported() {
        let entries = vec![entry(1, 0, 100, 100), entry(2, 150, -50, 100)];
        assert_eq!(
            verify_chain(0, &entries),
            Err(ChainBreak::Gap {
                id: 2,
                expected: 100,
                before: 150
            })
        );
    }

    #[test]
    fn bad_arithmetic_is_reported() {
        let entries = vec![entry(1, 0, 100, 90)];
        assert!(matches!(
            verify_chain(0, &entries),
            Err(ChainBreak::Arithmetic { id: 1, .. })
        ));
    }
}
