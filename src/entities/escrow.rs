use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Funds held for one store order between payment and delivery.
///
/// `store_order_id` is unique: the schema itself refuses a second escrow.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "escrows")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub store_order_id: Uuid,
    pub status: EscrowStatus,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub amount: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub shipping_fee: Decimal,
    pub locked_at: DateTime<Utc>,
    #[sea_orm(nullable)]
    pub released_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::store_order::Entity",
        from = "Column::StoreOrderId",
        to = "super::store_order::Column::Id",
        on_delete = "Cascade"
    )]
    StoreOrder,
}

impl Related<super::store_order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::StoreOrder.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

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
pub enum EscrowStatus {
    #[sea_orm(string_value = "locked")]
    Locked,
    #[sea_orm(string_value = "released")]
    Released,
}
