use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stored-value wallet, one per user. Every balance stays non-negative.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "wallets")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub user_id: Uuid,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub shopping_balance: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub reward_balance: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub referral_balance: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub loyalty_points_balance: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub ad_credit_balance: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Model {
    pub fn balance(&self, kind: BalanceKind) -> Decimal {
        match kind {
            BalanceKind::Shopping => self.shopping_balance,
            BalanceKind::Reward => self.reward_balance,
            BalanceKind::Referral => self.referral_balance,
            BalanceKind::LoyaltyPoints => self.loyalty_points_balance,
            BalanceKind::AdCredit => self.ad_credit_balance,
        }
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::wallet_transaction::Entity")]
    Transactions,
}

impl Related<super::wallet_transaction::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Transactions.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// The five independent wallet balances.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    EnumIter,
    DeriveActiveEnum,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BalanceKind {
    #[sea_orm(string_value = "shopping")]
    Shopping,
    #[sea_orm(string_value = "reward")]
    Reward,
    #[sea_orm(string_value = "referral")]
    Referral,
    #[sea_orm(string_value = "loyalty_points")]
    LoyaltyPoints,
    #[sea_orm(string_value = "ad_credit")]
    AdCredit,
}

impl BalanceKind {
    pub fn column(self) -> Column {
        match self {
            BalanceKind::Shopping => Column::ShoppingBalance,
            BalanceKind::Reward => Column::RewardBalance,
            BalanceKind::Referral => Column::ReferralBalance,
            BalanceKind::LoyaltyPoints => Column::LoyaltyPointsBalance,
            BalanceKind::AdCredit => Column::AdCreditBalance,
        }
    }
}
