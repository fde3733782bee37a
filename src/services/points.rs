use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait,
    DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
};
use serde::Serialize;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::{clock::Clock, entities::point_entry, errors::ServiceError};

const REDEMPTION_SOURCE: &str = "redemption";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PointsRedemption {
    pub points: i64,
    pub discount_amount: Decimal,
    pub new_balance: i64,
}

/// Loyalty points with expiring award entries.
#[derive(Clone)]
pub struct PointsService {
    db: Arc<DatabaseConnection>,
    clock: Arc<dyn Clock>,
    points_per_currency_unit: i64,
}

impl PointsService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        clock: Arc<dyn Clock>,
        points_per_currency_unit: i64,
    ) -> Self {
        Self {
            db,
            clock,
            points_per_currency_unit: points_per_currency_unit.max(1),
        }
    }

    /// Currency value of `points`, rounded down to cents.
    pub fn discount_for(&self, points: i64) -> Decimal {
        (Decimal::from(points) / Decimal::from(self.points_per_currency_unit))
            .round_dp_with_strategy(2, RoundingStrategy::ToZero)
    }

    #[instrument(skip(self))]
    pub async fn award(
        &self,
        user_id: Uuid,
        points: i64,
        source: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<point_entry::Model, ServiceError> {
        if points <= 0 {
            return Err(ServiceError::ValidationError(
                "Awarded points must be positive".to_string(),
            ));
        }

        let entry = point_entry::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            points: Set(points),
            remaining: Set(points),
            source: Set(source.to_string()),
            reference_id: Set(None),
            expires_at: Set(expires_at),
            created_at: Set(self.clock.now()),
        }
        .insert(&*self.db)
        .await?;

        info!(%user_id, points, "Awarded points");
        Ok(entry)
    }

    pub async fn available_balance(&self, user_id: Uuid) -> Result<i64, ServiceError> {
        self.available_balance_with(&*self.db, user_id).await
    }

    pub async fn available_balance_with<C: ConnectionTrait>(
        &self,
        conn: &C,
        user_id: Uuid,
    ) -> Result<i64, ServiceError> {
        let entries = self.live_entries(conn, user_id).await?;
        Ok(entries.iter().map(|e| e.remaining).sum())
    }

    /// Burns `points` from the soonest-expiring entries and returns the
    /// discount they are worth. Writes a negative ledger row for the audit trail.
    pub async fn redeem<C: ConnectionTrait>(
        &self,
        conn: &C,
        user_id: Uuid,
        points: i64,
        reference_id: Option<Uuid>,
    ) -> Result<PointsRedemption, ServiceError> {
        if points <= 0 {
            return Err(ServiceError::ValidationError(
                "Redeemed points must be positive".to_string(),
            ));
        }

        let mut entries = self.live_entries(conn, user_id).await?;
        let available: i64 = entries.iter().map(|e| e.remaining).sum();
        if available < points {
            return Err(ServiceError::InsufficientPoints {
                requested: points,
                available,
            });
        }

        // Soonest expiry first, never-expiring last, oldest first within a tie
        entries.sort_by(|a, b| {
            let key = |e: &point_entry::Model| (e.expires_at.is_none(), e.expires_at, e.created_at);
            key(a).cmp(&key(b))
        });

        let mut left = points;
        for entry in entries {
            if left == 0 {
                break;
            }
            let take = entry.remaining.min(left);
            let result = point_entry::Entity::update_many()
                .col_expr(
                    point_entry::Column::Remaining,
                    Expr::col(point_entry::Column::Remaining).sub(take),
                )
                .filter(point_entry::Column::Id.eq(entry.id))
                .filter(point_entry::Column::Remaining.gte(take))
                .exec(conn)
                .await?;
            if result.rows_affected == 0 {
                return Err(ServiceError::Conflict(format!(
                    "Points balance of user {} changed during redemption",
                    user_id
                )));
            }
            left -= take;
        }

        point_entry::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            points: Set(-points),
            remaining: Set(0),
            source: Set(REDEMPTION_SOURCE.to_string()),
            reference_id: Set(reference_id),
            expires_at: Set(None),
            created_at: Set(self.clock.now()),
        }
        .insert(conn)
        .await?;

        Ok(PointsRedemption {
            points,
            discount_amount: self.discount_for(points),
            new_balance: available - points,
        })
    }

    pub async fn history(&self, user_id: Uuid) -> Result<Vec<point_entry::Model>, ServiceError> {
        Ok(point_entry::Entity::find()
            .filter(point_entry::Column::UserId.eq(user_id))
            .order_by_desc(point_entry::Column::CreatedAt)
            .all(&*self.db)
            .await?)
    }

    async fn live_entries<C: ConnectionTrait>(
        &self,
        conn: &C,
        user_id: Uuid,
    ) -> Result<Vec<point_entry::Model>, ServiceError> {
        let now = self.clock.now();
        let entries = point_entry::Entity::find()
            .filter(point_entry::Column::UserId.eq(user_id))
            .filter(point_entry::Column::Remaining.gt(0))
            .all(conn)
            .await?;
        Ok(entries.into_iter().filter(|e| e.is_live(now)).collect())
    }
}
