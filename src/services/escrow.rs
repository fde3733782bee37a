use std::sync::Arc;

use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, QueryFilter, Set, SqlErr,
};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    clock::Clock,
    entities::{escrow, store_order, EscrowStatus},
    errors::ServiceError,
};

/// Holds store order funds between payment capture and delivery.
///
/// Both operations run on the caller's transaction: the pay transition creates
/// the escrow, the deliver transition releases it.
#[derive(Clone)]
pub struct EscrowService {
    db: Arc<DatabaseConnection>,
    clock: Arc<dyn Clock>,
}

impl EscrowService {
    pub fn new(db: Arc<DatabaseConnection>, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Locks the subtotal and delivery fee of a freshly paid store order.
    ///
    /// # Errors
    ///
    /// * `EscrowAlreadyExists` - the unique index on `store_order_id` refused a
    ///   second escrow for the store order
    /// * `DatabaseError` - any other insert failure, passed through as is
    pub async fn create_escrow<C: ConnectionTrait>(
        &self,
        conn: &C,
        store_order: &store_order::Model,
    ) -> Result<escrow::Model, ServiceError> {
        let created = escrow::ActiveModel {
            id: Set(Uuid::new_v4()),
            store_order_id: Set(store_order.id),
            status: Set(EscrowStatus::Locked),
            amount: Set(store_order.subtotal),
            shipping_fee: Set(store_order.delivery_fee),
            locked_at: Set(self.clock.now()),
            released_at: Set(None),
        }
        .insert(conn)
        .await
        .map_err(|e| match e.sql_err() {
            Some(SqlErr::UniqueConstraintViolation(_)) => {
                warn!(store_order_id = %store_order.id, "Escrow already exists");
                ServiceError::EscrowAlreadyExists(store_order.id)
            }
            _ => ServiceError::DatabaseError(e),
        })?;

        info!(escrow_id = %created.id, store_order_id = %store_order.id, "Escrow locked");
        Ok(created)
    }

    /// Marks a locked escrow released. Moving money to the seller happens
    /// downstream of this boundary.
    pub async fn release_escrow<C: ConnectionTrait>(
        &self,
        conn: &C,
        escrow: &escrow::Model,
    ) -> Result<escrow::Model, ServiceError> {
        let now = self.clock.now();
        let result = escrow::Entity::update_many()
            .col_expr(escrow::Column::Status, Expr::value(EscrowStatus::Released))
            .col_expr(escrow::Column::ReleasedAt, Expr::value(Some(now)))
            .filter(escrow::Column::Id.eq(escrow.id))
            .filter(escrow::Column::Status.eq(EscrowStatus::Locked))
            .exec(conn)
            .await?;

        if result.rows_affected == 0 {
            return Err(ServiceError::EscrowNotLocked(escrow.id));
        }

        info!(escrow_id = %escrow.id, store_order_id = %escrow.store_order_id, "Escrow released");
        Ok(escrow::Model {
            status: EscrowStatus::Released,
            released_at: Some(now),
            ..escrow.clone()
        })
    }

    #[instrument(skip(self))]
    pub async fn find_by_store_order(
        &self,
        store_order_id: Uuid,
    ) -> Result<Option<escrow::Model>, ServiceError> {
        self.find_with(&*self.db, store_order_id).await
    }

    pub async fn find_with<C: ConnectionTrait>(
        &self,
        conn: &C,
        store_order_id: Uuid,
    ) -> Result<Option<escrow::Model>, ServiceError> {
        Ok(escrow::Entity::find()
            .filter(escrow::Column::StoreOrderId.eq(store_order_id))
            .one(conn)
            .await?)
    }
}
