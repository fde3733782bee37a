use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::{Expr, SimpleExpr},
    ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    clock::Clock,
    entities::{
        escrow, order_item, store_order, wallet_transaction, BalanceKind, StoreOrderStatus,
        TransactionType,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    notifications::{dispatch_all, Notification, NotificationDispatcher, NotificationEvent, Recipient},
    services::{
        catalog::CatalogService,
        escrow::EscrowService,
        orders::OrderService,
        transitions::{self, next_status, StoreOrderAction},
        wallet::{LedgerEntry, WalletService},
    },
};

const MAX_REASON_LEN: usize = 500;

#[derive(Debug, Clone, Deserialize)]
pub struct AcceptInput {
    pub delivery_fee: Decimal,
    pub estimated_delivery_at: Option<DateTime<Utc>>,
}

/// How the buyer settles a store order.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum PaymentMethod {
    /// Debits the buyer's shopping balance
    Wallet,
    /// Captured by an outside gateway; only its reference is kept
    External { reference: String },
}

impl PaymentMethod {
    fn name(&self) -> &'static str {
        match self {
            PaymentMethod::Wallet => "wallet",
            PaymentMethod::External { .. } => "external",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentReceipt {
    pub store_order: store_order::Model,
    pub escrow: escrow::Model,
    pub wallet_transaction: Option<wallet_transaction::Model>,
    pub amount_charged: Decimal,
}

/// Drives a store order through its workflow.
///
/// Each operation reads the store order, asks [`next_status`] whether the
/// action is allowed, and persists the move as a conditional update on the
/// observed state, so two racing callers cannot both win.
#[derive(Clone)]
pub struct StoreOrderService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    clock: Arc<dyn Clock>,
    catalog: Arc<CatalogService>,
    escrow: Arc<EscrowService>,
    wallet: Arc<WalletService>,
    orders: Arc<OrderService>,
    notifier: Arc<dyn NotificationDispatcher>,
    max_delivery_code_attempts: Option<i32>,
}

impl StoreOrderService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        clock: Arc<dyn Clock>,
        catalog: Arc<CatalogService>,
        escrow: Arc<EscrowService>,
        wallet: Arc<WalletService>,
        orders: Arc<OrderService>,
        notifier: Arc<dyn NotificationDispatcher>,
        max_delivery_code_attempts: Option<i32>,
    ) -> Self {
        Self {
            db,
            event_sender,
            clock,
            catalog,
            escrow,
            wallet,
            orders,
            notifier,
            max_delivery_code_attempts,
        }
    }

    /// Seller accepts a pending store order and sets the delivery fee.
    #[instrument(skip(self, input), fields(delivery_fee = %input.delivery_fee))]
    pub async fn accept(
        &self,
        seller_id: Uuid,
        store_order_id: Uuid,
        input: AcceptInput,
    ) -> Result<store_order::Model, ServiceError> {
        if input.delivery_fee.is_sign_negative() {
            return Err(ServiceError::ValidationError(format!(
                "Delivery fee cannot be negative: {}",
                input.delivery_fee
            )));
        }
        let delivery_fee = input.delivery_fee.round_dp(2);

        let txn = self.db.begin().await?;
        let so = self.load(&txn, store_order_id).await?;
        ensure_seller(&so, seller_id)?;

        let now = self.clock.now();
        let to = self
            .advance(
                &txn,
                &so,
                StoreOrderAction::Accept,
                vec![
                    (store_order::Column::DeliveryFee, Expr::value(delivery_fee)),
                    (
                        store_order::Column::Total,
                        Expr::value(so.subtotal + delivery_fee),
                    ),
                    (
                        store_order::Column::EstimatedDeliveryAt,
                        Expr::value(input.estimated_delivery_at),
                    ),
                    (store_order::Column::AcceptedAt, Expr::value(Some(now))),
                ],
            )
            .await?;
        txn.commit().await?;

        self.announce(&so, to).await;
        info!(%store_order_id, %delivery_fee, "Store order accepted");
        self.find(store_order_id).await
    }

    /// Seller turns down a pending store order and its units go back on the
    /// shelf. The rest of the order carries on.
    #[instrument(skip(self))]
    pub async fn reject(
        &self,
        seller_id: Uuid,
        store_order_id: Uuid,
        reason: &str,
    ) -> Result<store_order::Model, ServiceError> {
        let reason = required_reason(reason)?;

        let txn = self.db.begin().await?;
        let so = self.load(&txn, store_order_id).await?;
        ensure_seller(&so, seller_id)?;

        let to = self
            .advance(
                &txn,
                &so,
                StoreOrderAction::Reject,
                vec![
                    (store_order::Column::RejectionReason, Expr::value(Some(reason))),
                    (
                        store_order::Column::RejectedAt,
                        Expr::value(Some(self.clock.now())),
                    ),
                ],
            )
            .await?;
        self.restock(&txn, so.id).await?;
        self.orders.rollup_payment_status(&txn, so.order_id).await?;
        txn.commit().await?;

        self.announce(&so, to).await;
        info!(%store_order_id, "Store order rejected");
        self.find(store_order_id).await
    }

    /// Buyer pays an accepted store order.
    ///
    /// The state moves `accepted -> paid` first; only the caller that wins
    /// that move debits the wallet and locks the escrow, after which the store
    /// order continues straight into `processing`. Any failure rolls the whole
    /// payment back and leaves the store order `accepted`.
    ///
    /// # Errors
    ///
    /// * `OrderNotAccepted` - the seller has not accepted yet
    /// * `AlreadyPaid` - someone already paid this store order
    /// * `InsufficientBalance` - wallet payment with too little on the shopping balance
    #[instrument(skip(self, method), fields(method = method.name()))]
    pub async fn pay(
        &self,
        buyer_id: Uuid,
        store_order_id: Uuid,
        method: PaymentMethod,
    ) -> Result<PaymentReceipt, ServiceError> {
        if let PaymentMethod::External { reference } = &method {
            if reference.trim().is_empty() {
                return Err(ServiceError::ValidationError(
                    "External payments need a gateway reference".to_string(),
                ));
            }
        }

        let txn = self.db.begin().await?;
        let so = self.load(&txn, store_order_id).await?;
        ensure_buyer(&so, buyer_id)?;

        let reference = match &method {
            PaymentMethod::External { reference } => Some(reference.trim().to_string()),
            PaymentMethod::Wallet => None,
        };
        let paid = self
            .advance(
                &txn,
                &so,
                StoreOrderAction::Pay,
                vec![
                    (
                        store_order::Column::PaymentMethod,
                        Expr::value(Some(method.name().to_string())),
                    ),
                    (store_order::Column::PaymentReference, Expr::value(reference)),
                    (
                        store_order::Column::PaidAt,
                        Expr::value(Some(self.clock.now())),
                    ),
                ],
            )
            .await?;

        let amount_charged = (so.total - so.discount_amount).max(Decimal::ZERO);
        let wallet_transaction = match method {
            PaymentMethod::Wallet if amount_charged > Decimal::ZERO => Some(
                self.wallet
                    .debit(
                        &txn,
                        buyer_id,
                        LedgerEntry {
                            kind: BalanceKind::Shopping,
                            amount: amount_charged,
                            transaction_type: TransactionType::OrderPayment,
                            metadata: serde_json::json!({
                                "order_id": so.order_id,
                                "store_order_id": so.id,
                            }),
                        },
                    )
                    .await
                    .map_err(|e| e.in_collaborator("wallet ledger"))?,
            ),
            _ => None,
        };

        let paid_so = store_order::Model {
            status: paid,
            ..so.clone()
        };
        let escrow = self.escrow.create_escrow(&txn, &paid_so).await?;
        let processing = self
            .advance(&txn, &paid_so, StoreOrderAction::BeginProcessing, Vec::new())
            .await?;
        self.orders.rollup_payment_status(&txn, so.order_id).await?;
        txn.commit().await?;

        self.announce(&so, paid).await;
        self.announce(&paid_so, processing).await;
        self.event_sender
            .send_or_log(Event::EscrowLocked {
                escrow_id: escrow.id,
                store_order_id,
                amount: escrow.amount,
                shipping_fee: escrow.shipping_fee,
            })
            .await;
        if let Some(tx) = &wallet_transaction {
            self.event_sender
                .send_or_log(Event::WalletDebited {
                    user_id: buyer_id,
                    transaction_id: tx.id,
                    kind: BalanceKind::Shopping,
                    amount: amount_charged,
                })
                .await;
        }

        dispatch_all(
            self.notifier.as_ref(),
            vec![Notification::new(
                NotificationEvent::OrderPaid,
                Recipient::Seller(so.seller_id),
                so.order_id,
                Some(so.id),
                serde_json::json!({
                    "amount": escrow.amount,
                    "shipping_fee": escrow.shipping_fee,
                }),
                self.clock.now(),
            )],
        )
        .await;

        info!(%store_order_id, %amount_charged, escrow_id = %escrow.id, "Store order paid");
        Ok(PaymentReceipt {
            store_order: self.find(store_order_id).await?,
            escrow,
            wallet_transaction,
            amount_charged,
        })
    }

    #[instrument(skip(self))]
    pub async fn mark_out_for_delivery(
        &self,
        seller_id: Uuid,
        store_order_id: Uuid,
    ) -> Result<store_order::Model, ServiceError> {
        let txn = self.db.begin().await?;
        let so = self.load(&txn, store_order_id).await?;
        ensure_seller(&so, seller_id)?;

        let to = self
            .advance(
                &txn,
                &so,
                StoreOrderAction::MarkOutForDelivery,
                vec![(
                    store_order::Column::OutForDeliveryAt,
                    Expr::value(Some(self.clock.now())),
                )],
            )
            .await?;
        txn.commit().await?;

        self.announce(&so, to).await;
        self.find(store_order_id).await
    }

    /// Completes the handoff when `code` matches the store order's delivery
    /// code, and releases its escrow.
    ///
    /// A wrong code leaves the state untouched but is counted; with an attempt
    /// limit configured the code locks once the limit is reached.
    #[instrument(skip(self, code))]
    pub async fn deliver(
        &self,
        seller_id: Uuid,
        store_order_id: Uuid,
        code: &str,
    ) -> Result<store_order::Model, ServiceError> {
        let txn = self.db.begin().await?;
        let so = self.load(&txn, store_order_id).await?;
        ensure_seller(&so, seller_id)?;
        next_status(so.id, so.status, StoreOrderAction::Deliver)?;

        if let Some(max) = self.max_delivery_code_attempts {
            if so.delivery_code_attempts >= max {
                warn!(%store_order_id, attempts = so.delivery_code_attempts, "Delivery code locked");
                return Err(ServiceError::DeliveryCodeLocked(so.id));
            }
        }

        if code != so.delivery_code {
            store_order::Entity::update_many()
                .col_expr(
                    store_order::Column::DeliveryCodeAttempts,
                    Expr::col(store_order::Column::DeliveryCodeAttempts).add(1),
                )
                .filter(store_order::Column::Id.eq(so.id))
                .exec(&txn)
                .await?;
            txn.commit().await?;

            let attempts = so.delivery_code_attempts + 1;
            self.event_sender
                .send_or_log(Event::DeliveryCodeRejected {
                    store_order_id,
                    attempts,
                })
                .await;
            warn!(%store_order_id, attempts, "Wrong delivery code");
            return Err(ServiceError::InvalidDeliveryCode(so.id));
        }

        let to = self
            .advance(
                &txn,
                &so,
                StoreOrderAction::Deliver,
                vec![(
                    store_order::Column::DeliveredAt,
                    Expr::value(Some(self.clock.now())),
                )],
            )
            .await?;

        let escrow = self.escrow.find_with(&txn, so.id).await?.ok_or_else(|| {
            ServiceError::NotFound(format!("Escrow for store order {} not found", so.id))
        })?;
        let released = self.escrow.release_escrow(&txn, &escrow).await?;
        txn.commit().await?;

        self.announce(&so, to).await;
        self.event_sender
            .send_or_log(Event::EscrowReleased {
                escrow_id: released.id,
                store_order_id,
            })
            .await;

        info!(%store_order_id, escrow_id = %released.id, "Store order delivered");
        self.find(store_order_id).await
    }

    /// Buyer withdraws a store order before paying for it, returning its units
    /// to stock.
    #[instrument(skip(self))]
    pub async fn cancel(
        &self,
        buyer_id: Uuid,
        store_order_id: Uuid,
        reason: Option<String>,
    ) -> Result<store_order::Model, ServiceError> {
        let reason = match reason.as_deref().map(str::trim) {
            Some("") | None => None,
            Some(r) => Some(required_reason(r)?),
        };

        let txn = self.db.begin().await?;
        let so = self.load(&txn, store_order_id).await?;
        ensure_buyer(&so, buyer_id)?;

        let to = self
            .advance(
                &txn,
                &so,
                StoreOrderAction::Cancel,
                vec![
                    (store_order::Column::CancellationReason, Expr::value(reason)),
                    (
                        store_order::Column::CancelledAt,
                        Expr::value(Some(self.clock.now())),
                    ),
                ],
            )
            .await?;
        self.restock(&txn, so.id).await?;
        self.orders.rollup_payment_status(&txn, so.order_id).await?;
        txn.commit().await?;

        self.announce(&so, to).await;
        info!(%store_order_id, "Store order cancelled");
        self.find(store_order_id).await
    }

    pub async fn find(&self, store_order_id: Uuid) -> Result<store_order::Model, ServiceError> {
        self.load(&*self.db, store_order_id).await
    }

    async fn load<C: ConnectionTrait>(
        &self,
        conn: &C,
        store_order_id: Uuid,
    ) -> Result<store_order::Model, ServiceError> {
        store_order::Entity::find_by_id(store_order_id)
            .one(conn)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Store order {} not found", store_order_id))
            })
    }

    async fn advance<C: ConnectionTrait>(
        &self,
        conn: &C,
        so: &store_order::Model,
        action: StoreOrderAction,
        columns: Vec<(store_order::Column, SimpleExpr)>,
    ) -> Result<StoreOrderStatus, ServiceError> {
        transitions::apply(conn, so, action, self.clock.now(), columns).await
    }

    /// Returns the units a dropped store order reserved at checkout.
    async fn restock<C: ConnectionTrait>(
        &self,
        conn: &C,
        store_order_id: Uuid,
    ) -> Result<(), ServiceError> {
        let items = order_item::Entity::find()
            .filter(order_item::Column::StoreOrderId.eq(store_order_id))
            .all(conn)
            .await?;
        for item in &items {
            self.catalog
                .release_stock(conn, item.product_id, item.quantity)
                .await?;
        }
        Ok(())
    }

    async fn announce(&self, so: &store_order::Model, to: StoreOrderStatus) {
        self.event_sender
            .send_or_log(Event::StoreOrderStatusChanged {
                store_order_id: so.id,
                order_id: so.order_id,
                from: so.status,
                to,
            })
            .await;
    }
}

fn ensure_seller(so: &store_order::Model, seller_id: Uuid) -> Result<(), ServiceError> {
    if so.seller_id != seller_id {
        return Err(ServiceError::Forbidden(format!(
            "Store order {} belongs to another seller",
            so.id
        )));
    }
    Ok(())
}

fn ensure_buyer(so: &store_order::Model, buyer_id: Uuid) -> Result<(), ServiceError> {
    if so.buyer_id != buyer_id {
        return Err(ServiceError::Forbidden(format!(
            "Store order {} belongs to another buyer",
            so.id
        )));
    }
    Ok(())
}

fn required_reason(reason: &str) -> Result<String, ServiceError> {
    let reason = reason.trim();
    if reason.is_empty() {
        return Err(ServiceError::ValidationError(
            "A reason is required".to_string(),
        ));
    }
    if reason.chars().count() > MAX_REASON_LEN {
        return Err(ServiceError::ValidationError(format!(
            "Reason cannot exceed {} characters",
            MAX_REASON_LEN
        )));
    }
    Ok(reason.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn payment_method_wire_format() {
        let wallet: PaymentMethod = serde_json::from_str(r#"{"method":"wallet"}"#).unwrap();
        assert_eq!(wallet, PaymentMethod::Wallet);

        let external: PaymentMethod =
            serde_json::from_str(r#"{"method":"external","reference":"pi_123"}"#).unwrap();
        assert_eq!(
            external,
            PaymentMethod::External {
                reference: "pi_123".into()
            }
        );
    }

    #[test]
    fn reasons_are_trimmed_and_bounded() {
        assert_eq!(required_reason("  out of stock ").unwrap(), "out of stock");
        assert_matches!(required_reason("   "), Err(ServiceError::ValidationError(_)));
        assert_matches!(
            required_reason(&"x".repeat(MAX_REASON_LEN + 1)),
            Err(ServiceError::ValidationError(_))
        );
    }
}
