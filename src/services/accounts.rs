use crate::{
    entities::user::{self, Entity as UserEntity, MembershipTier},
    errors::ServiceError,
};
use chrono::Utc;
use sea_orm::{
    sea_query::Expr, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QuerySelect,
};
use tracing::info;

/// Account reads and tier changes. Balance is out of bounds here; see
/// [`crate::services::ledger::LedgerService`].
#[derive(Debug, Clone, Default)]
pub struct AccountService;

impl AccountService {
    pub fn new() -> Self {
        Self
    }

    pub async fn find<C: ConnectionTrait>(
        &self,
        conn: &C,
        username: &str,
    ) -> Result<Option<user::Model>, ServiceError> {
        Ok(UserEntity::find()
            .filter(user::Column::Username.eq(username))
            .one(conn)
            .await?)
    }

    pub async fn require<C: ConnectionTrait>(
        &self,
        conn: &C,
        username: &str,
    ) -> Result<user::Model, ServiceError> {
        self.find(conn, username)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("user {}", username)))
    }

    /// Tier used for pricing; unknown callers pay the regular price.
    pub async fn tier_of<C: ConnectionTrait>(
        &self,
        conn: &C,
        username: Option<&str>,
    ) -> Result<MembershipTier, ServiceError> {
        match username {
            Some(name) => Ok(self
                .find(conn, name)
                .await?
                .map(|u| u.tier)
                .unwrap_or_default()),
            None => Ok(MembershipTier::Regular),
        }
    }

    /// Upgrades a regular account to platinum. Returns false when the
    /// account already sits on another tier.
    pub async fn upgrade_to_platinum<C: ConnectionTrait>(
        &self,
        txn: &C,
        username: &str,
    ) -> Result<bool, ServiceError> {
        let user = UserEntity::find()
            .filter(user::Column::Username.eq(username))
            .lock_exclusive()
            .one(txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("user {}", username)))?;

        if user.tier != MembershipTier::Regular {
            return Ok(false);
        }

        UserEntity::update_many()
            .col_expr(user::Column::Tier, Expr::value(MembershipTier::Platinum))
            .col_expr(user::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(user::Column::Id.eq(user.id))
            .exec(txn)
            .await?;
        info!(username, "membership upgraded to platinum");
        Ok(true)
    }
}
