use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Immutable snapshot of what was sold, copied from the catalog at checkout.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "order_items")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub store_order_id: Uuid,
    pub product_id: Uuid,
    #[sea_orm(nullable)]
    pub variant_id: Option<Uuid>,
    pub name: String,
    pub sku: String,
    pub quantity: i32,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub price: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub line_total: Decimal,
    #[sea_orm(column_type = "Json", nullable)]
    pub images: Option<Json>,
    #[sea_orm(nullable)]
    pub frame_size: Option<String>,
    #[sea_orm(column_type = "Json", nullable)]
    pub prescription: Option<Json>,
    #[sea_orm(column_type = "Json", nullable)]
    pub lens_config: Option<Json>,
    pub created_at: DateTime<Utc>,
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
