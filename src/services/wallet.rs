use std::sync::Arc;

use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::Deserialize;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::{
    clock::Clock,
    entities::{
        wallet::{self, BalanceKind},
        wallet_transaction::{self, TransactionStatus, TransactionType},
    },
    errors::ServiceError,
    events::{Event, EventSender},
};

/// A single balance movement to book.
#[derive(Debug, Clone, Deserialize)]
pub struct LedgerEntry {
    pub kind: BalanceKind,
    /// Always positive; the direction comes from the operation
    pub amount: Decimal,
    pub transaction_type: TransactionType,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Stored-value wallets and their append-only transaction ledger.
#[derive(Clone)]
pub struct WalletService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    clock: Arc<dyn Clock>,
}

impl WalletService {
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

    /// Returns the user's wallet, opening an empty one on first use.
    pub async fn get_or_create<C: ConnectionTrait>(
        &self,
        conn: &C,
        user_id: Uuid,
    ) -> Result<wallet::Model, ServiceError> {
        if let Some(existing) = wallet::Entity::find()
            .filter(wallet::Column::UserId.eq(user_id))
            .one(conn)
            .await?
        {
            return Ok(existing);
        }

        let now = self.clock.now();
        let created = wallet::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            shopping_balance: Set(Decimal::ZERO),
            reward_balance: Set(Decimal::ZERO),
            referral_balance: Set(Decimal::ZERO),
            loyalty_points_balance: Set(Decimal::ZERO),
            ad_credit_balance: Set(Decimal::ZERO),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(conn)
        .await?;

        info!(%user_id, wallet_id = %created.id, "Opened wallet");
        Ok(created)
    }

    pub async fn wallet(&self, user_id: Uuid) -> Result<wallet::Model, ServiceError> {
        self.get_or_create(&*self.db, user_id).await
    }

    /// Takes `entry.amount` off one balance. Fails closed when the balance
    /// would go negative.
    pub async fn debit<C: ConnectionTrait>(
        &self,
        conn: &C,
        user_id: Uuid,
        entry: LedgerEntry,
    ) -> Result<wallet_transaction::Model, ServiceError> {
        self.book_debit(conn, user_id, entry, TransactionStatus::Success)
            .await
    }

    /// Adds `entry.amount` to one balance.
    pub async fn credit<C: ConnectionTrait>(
        &self,
        conn: &C,
        user_id: Uuid,
        entry: LedgerEntry,
    ) -> Result<wallet_transaction::Model, ServiceError> {
        ensure_positive(entry.amount)?;
        let wallet = self.get_or_create(conn, user_id).await?;
        let column = entry.kind.column();

        wallet::Entity::update_many()
            .col_expr(column, Expr::col(column).add(entry.amount))
            .col_expr(wallet::Column::UpdatedAt, Expr::value(self.clock.now()))
            .filter(wallet::Column::Id.eq(wallet.id))
            .exec(conn)
            .await?;

        self.append(conn, &wallet, &entry, entry.amount, TransactionStatus::Success)
            .await
    }

    /// Credits the shopping balance and publishes the movement.
    #[instrument(skip(self))]
    pub async fn top_up(
        &self,
        user_id: Uuid,
        amount: Decimal,
    ) -> Result<wallet_transaction::Model, ServiceError> {
        let txn = self.db.begin().await?;
        let transaction = self
            .credit(
                &txn,
                user_id,
                LedgerEntry {
                    kind: BalanceKind::Shopping,
                    amount,
                    transaction_type: TransactionType::TopUp,
                    metadata: serde_json::json!({}),
                },
            )
            .await?;
        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::WalletCredited {
                user_id,
                transaction_id: transaction.id,
                kind: BalanceKind::Shopping,
                amount,
            })
            .await;

        info!(%user_id, %amount, "Wallet topped up");
        Ok(transaction)
    }

    /// Holds funds for a withdrawal. The ledger row stays `pending` until
    /// [`set_transaction_status`](Self::set_transaction_status) settles it.
    #[instrument(skip(self))]
    pub async fn request_withdrawal(
        &self,
        user_id: Uuid,
        kind: BalanceKind,
        amount: Decimal,
    ) -> Result<wallet_transaction::Model, ServiceError> {
        let txn = self.db.begin().await?;
        let transaction = self
            .book_debit(
                &txn,
                user_id,
                LedgerEntry {
                    kind,
                    amount,
                    transaction_type: TransactionType::Withdrawal,
                    metadata: serde_json::json!({}),
                },
                TransactionStatus::Pending,
            )
            .await?;
        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::WalletDebited {
                user_id,
                transaction_id: transaction.id,
                kind,
                amount,
            })
            .await;

        Ok(transaction)
    }

    /// Settles a pending ledger row. Only `pending -> success` and
    /// `pending -> failed` exist; a failed debit gives the funds back.
    #[instrument(skip(self))]
    pub async fn set_transaction_status(
        &self,
        transaction_id: Uuid,
        status: TransactionStatus,
    ) -> Result<wallet_transaction::Model, ServiceError> {
        if status == TransactionStatus::Pending {
            return Err(ServiceError::ValidationError(
                "A transaction cannot be moved back to pending".to_string(),
            ));
        }

        let txn = self.db.begin().await?;
        let transaction = wallet_transaction::Entity::find_by_id(transaction_id)
            .one(&txn)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Wallet transaction {} not found", transaction_id))
            })?;

        let result = wallet_transaction::Entity::update_many()
            .col_expr(wallet_transaction::Column::Status, Expr::value(status))
            .col_expr(
                wallet_transaction::Column::UpdatedAt,
                Expr::value(self.clock.now()),
            )
            .filter(wallet_transaction::Column::Id.eq(transaction_id))
            .filter(wallet_transaction::Column::Status.eq(TransactionStatus::Pending))
            .exec(&txn)
            .await?;

        if result.rows_affected == 0 {
            return Err(ServiceError::Conflict(format!(
                "Wallet transaction {} is already {}",
                transaction_id, transaction.status
            )));
        }

        if status == TransactionStatus::Failed && transaction.amount.is_sign_negative() {
            let column = transaction.balance_kind.column();
            wallet::Entity::update_many()
                .col_expr(column, Expr::col(column).add(-transaction.amount))
                .col_expr(wallet::Column::UpdatedAt, Expr::value(self.clock.now()))
                .filter(wallet::Column::Id.eq(transaction.wallet_id))
                .exec(&txn)
                .await?;
        }

        let updated = wallet_transaction::Entity::find_by_id(transaction_id)
            .one(&txn)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Wallet transaction {} not found", transaction_id))
            })?;
        txn.commit().await?;

        info!(%transaction_id, %status, "Wallet transaction settled");
        Ok(updated)
    }

    /// Ledger history, newest first.
    pub async fn transactions(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<wallet_transaction::Model>, ServiceError> {
        Ok(wallet_transaction::Entity::find()
            .filter(wallet_transaction::Column::UserId.eq(user_id))
            .order_by_desc(wallet_transaction::Column::CreatedAt)
            .all(&*self.db)
            .await?)
    }

    async fn book_debit<C: ConnectionTrait>(
        &self,
        conn: &C,
        user_id: Uuid,
        entry: LedgerEntry,
        status: TransactionStatus,
    ) -> Result<wallet_transaction::Model, ServiceError> {
        ensure_positive(entry.amount)?;
        let wallet = self.get_or_create(conn, user_id).await?;
        let column = entry.kind.column();

        let result = wallet::Entity::update_many()
            .col_expr(column, Expr::col(column).sub(entry.amount))
            .col_expr(wallet::Column::UpdatedAt, Expr::value(self.clock.now()))
            .filter(wallet::Column::Id.eq(wallet.id))
            .filter(column.gte(entry.amount))
            .exec(conn)
            .await?;

        if result.rows_affected == 0 {
            let current = wallet::Entity::find_by_id(wallet.id)
                .one(conn)
                .await?
                .map(|w| w.balance(entry.kind))
                .unwrap_or(Decimal::ZERO);
            return Err(ServiceError::InsufficientBalance {
                requested: entry.amount,
                available: current,
            });
        }

        self.append(conn, &wallet, &entry, -entry.amount, status)
            .await
    }

    async fn append<C: ConnectionTrait>(
        &self,
        conn: &C,
        wallet: &wallet::Model,
        entry: &LedgerEntry,
        signed_amount: Decimal,
        status: TransactionStatus,
    ) -> Result<wallet_transaction::Model, ServiceError> {
        let now = self.clock.now();
        let metadata = if entry.metadata.is_null() {
            serde_json::json!({})
        } else {
            entry.metadata.clone()
        };

        Ok(wallet_transaction::ActiveModel {
            id: Set(Uuid::new_v4()),
            wallet_id: Set(wallet.id),
            user_id: Set(wallet.user_id),
            balance_kind: Set(entry.kind),
            transaction_type: Set(entry.transaction_type),
            amount: Set(signed_amount),
            status: Set(status),
            metadata: Set(metadata),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(conn)
        .await?)
    }
}

fn ensure_positive(amount: Decimal) -> Result<(), ServiceError> {
    if amount <= Decimal::ZERO {
        return Err(ServiceError::ValidationError(format!(
            "Amount must be positive, got {}",
            amount
        )));
    }
    Ok(())
}
