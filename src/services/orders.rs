use std::sync::Arc;

use sea_orm::{
    sea_query::Expr, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, RelationTrait, JoinType,
};
use serde::Serialize;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    clock::Clock,
    entities::{escrow, order, order_item, store, store_order, PaymentStatus},
    errors::ServiceError,
    events::{Event, EventSender},
};

/// A store order together with what was sold and the money held for it.
#[derive(Debug, Clone, Serialize)]
pub struct StoreOrderDetails {
    #[serde(flatten)]
    pub store_order: store_order::Model,
    /// Only filled in for the buyer, who hands it to the courier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_code: Option<String>,
    pub items: Vec<order_item::Model>,
    pub escrow: Option<escrow::Model>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderDetails {
    #[serde(flatten)]
    pub order: order::Model,
    pub store_orders: Vec<StoreOrderDetails>,
}

#[derive(Debug, Serialize)]
pub struct OrderListResponse {
    pub orders: Vec<order::Model>,
    pub total: u64,
    pub page: u64,
    pub per_page: u64,
}

/// Read side of orders plus the two writes that touch an order after
/// checkout: archiving and the payment-status rollup.
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    clock: Arc<dyn Clock>,
}

impl OrderService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            db,
            event_sender,
            clock,
        }
    }

    /// Retrieves one of the buyer's orders with every store order, its items
    /// and escrow.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn get(&self, buyer_id: Uuid, order_id: Uuid) -> Result<OrderDetails, ServiceError> {
        let db = &*self.db;
        let order = self.find_live(db, order_id).await?;
        if order.buyer_id != buyer_id {
            warn!(%buyer_id, "Order requested by someone other than its buyer");
            return Err(ServiceError::Forbidden(format!(
                "Order {} belongs to another buyer",
                order_id
            )));
        }

        let store_orders = store_order::Entity::find()
            .filter(store_order::Column::OrderId.eq(order.id))
            .order_by_asc(store_order::Column::CreatedAt)
            .all(db)
            .await?;

        let mut details = Vec::with_capacity(store_orders.len());
        for so in store_orders {
            details.push(self.details(db, so, true).await?);
        }

        Ok(OrderDetails {
            order,
            store_orders: details,
        })
    }

    /// Lists a buyer's orders, newest first. Archived orders are left out.
    #[instrument(skip(self))]
    pub async fn list_for_buyer(
        &self,
        buyer_id: Uuid,
        page: u64,
        per_page: u64,
    ) -> Result<OrderListResponse, ServiceError> {
        let page = page.max(1);
        let per_page = per_page.clamp(1, 100);

        let paginator = order::Entity::find()
            .filter(order::Column::BuyerId.eq(buyer_id))
            .filter(order::Column::DeletedAt.is_null())
            .order_by_desc(order::Column::CreatedAt)
            .paginate(&*self.db, per_page);

        let total = paginator.num_items().await.map_err(|e| {
            error!(error = %e, "Failed to count orders");
            ServiceError::DatabaseError(e)
        })?;
        let orders = paginator.fetch_page(page - 1).await?;

        Ok(OrderListResponse {
            orders,
            total,
            page,
            per_page,
        })
    }

    /// Store orders of one store, newest first, for its seller.
    #[instrument(skip(self))]
    pub async fn list_for_store(
        &self,
        seller_id: Uuid,
        store_id: Uuid,
    ) -> Result<Vec<store_order::Model>, ServiceError> {
        let db = &*self.db;
        let store = store::Entity::find_by_id(store_id)
            .filter(store::Column::DeletedAt.is_null())
            .one(db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Store {} not found", store_id)))?;
        if store.owner_id != seller_id {
            return Err(ServiceError::Forbidden(format!(
                "Store {} belongs to another seller",
                store_id
            )));
        }

        Ok(store_order::Entity::find()
            .join(JoinType::InnerJoin, store_order::Relation::Order.def())
            .filter(store_order::Column::StoreId.eq(store_id))
            .filter(order::Column::DeletedAt.is_null())
            .order_by_desc(store_order::Column::CreatedAt)
            .all(db)
            .await?)
    }

    /// One store order as its seller sees it: no delivery code.
    #[instrument(skip(self))]
    pub async fn store_order_for_seller(
        &self,
        seller_id: Uuid,
        store_order_id: Uuid,
    ) -> Result<StoreOrderDetails, ServiceError> {
        let db = &*self.db;
        let so = store_order::Entity::find_by_id(store_order_id)
            .one(db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Store order {} not found", store_order_id))
            })?;
        self.find_live(db, so.order_id).await?;
        if so.seller_id != seller_id {
            return Err(ServiceError::Forbidden(format!(
                "Store order {} belongs to another seller",
                store_order_id
            )));
        }
        self.details(db, so, false).await
    }

    /// Tombstones an order once none of its store orders is still in flight.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn archive(&self, buyer_id: Uuid, order_id: Uuid) -> Result<(), ServiceError> {
        let db = &*self.db;
        let order = self.find_live(db, order_id).await?;
        if order.buyer_id != buyer_id {
            return Err(ServiceError::Forbidden(format!(
                "Order {} belongs to another buyer",
                order_id
            )));
        }

        let store_orders = store_order::Entity::find()
            .filter(store_order::Column::OrderId.eq(order_id))
            .all(db)
            .await?;
        if let Some(open) = store_orders.iter().find(|so| !so.status.is_terminal()) {
            return Err(ServiceError::Conflict(format!(
                "Store order {} is still {}",
                open.id, open.status
            )));
        }

        order::Entity::update_many()
            .col_expr(order::Column::DeletedAt, Expr::value(Some(self.clock.now())))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::DeletedAt.is_null())
            .exec(db)
            .await?;

        self.event_sender
            .send_or_log(Event::OrderArchived(order_id))
            .await;

        info!(order_id = %order_id, "Order archived");
        Ok(())
    }

    /// Recomputes the informational payment status of an order from its store
    /// orders, on the caller's transaction.
    pub async fn rollup_payment_status<C: ConnectionTrait>(
        &self,
        conn: &C,
        order_id: Uuid,
    ) -> Result<PaymentStatus, ServiceError> {
        let statuses: Vec<_> = store_order::Entity::find()
            .filter(store_order::Column::OrderId.eq(order_id))
            .all(conn)
            .await?
            .into_iter()
            .map(|so| so.status)
            .collect();

        let status = payment_status_for(&statuses);
        order::Entity::update_many()
            .col_expr(order::Column::PaymentStatus, Expr::value(status))
            .col_expr(order::Column::UpdatedAt, Expr::value(self.clock.now()))
            .filter(order::Column::Id.eq(order_id))
            .exec(conn)
            .await?;

        Ok(status)
    }

    async fn find_live<C: ConnectionTrait>(
        &self,
        conn: &C,
        order_id: Uuid,
    ) -> Result<order::Model, ServiceError> {
        order::Entity::find_by_id(order_id)
            .filter(order::Column::DeletedAt.is_null())
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
    }

    async fn details<C: ConnectionTrait>(
        &self,
        conn: &C,
        store_order: store_order::Model,
        reveal_code: bool,
    ) -> Result<StoreOrderDetails, ServiceError> {
        let items = order_item::Entity::find()
            .filter(order_item::Column::StoreOrderId.eq(store_order.id))
            .order_by_asc(order_item::Column::CreatedAt)
            .all(conn)
            .await?;
        let escrow = escrow::Entity::find()
            .filter(escrow::Column::StoreOrderId.eq(store_order.id))
            .one(conn)
            .await?;

        Ok(StoreOrderDetails {
            delivery_code: reveal_code.then(|| store_order.delivery_code.clone()),
            store_order,
            items,
            escrow,
        })
    }
}

/// `paid` once every live store order is paid, `failed` when none is left,
/// `pending` otherwise.
pub fn payment_status_for(statuses: &[crate::entities::StoreOrderStatus]) -> PaymentStatus {
    let live: Vec<_> = statuses.iter().filter(|s| s.is_live()).collect();
    if live.is_empty() {
        PaymentStatus::Failed
    } else if live.iter().all(|s| s.is_paid_or_later()) {
        PaymentStatus::Paid
    } else {
        PaymentStatus::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::StoreOrderStatus as S;

    #[test]
    fn rollup_ignores_dropped_store_orders() {
        assert_eq!(payment_status_for(&[S::Paid, S::Rejected]), PaymentStatus::Paid);
        assert_eq!(
            payment_status_for(&[S::Delivered, S::Cancelled, S::Processing]),
            PaymentStatus::Paid
        );
    }

    #[test]
    fn rollup_waits_for_every_live_store_order() {
        assert_eq!(payment_status_for(&[S::Paid, S::Accepted]), PaymentStatus::Pending);
        assert_eq!(payment_status_for(&[S::Pending]), PaymentStatus::Pending);
    }

    #[test]
    fn rollup_fails_when_nothing_is_left() {
        assert_eq!(
            payment_status_for(&[S::Rejected, S::Cancelled]),
            PaymentStatus::Failed
        );
        assert_eq!(payment_status_for(&[]), PaymentStatus::Failed);
    }
}
