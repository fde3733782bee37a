use std::sync::Arc;

use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set,
};
use serde::Deserialize;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

use crate::{clock::Clock, entities::address, errors::ServiceError};

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateAddressInput {
    #[validate(length(min = 1, max = 255))]
    pub recipient_name: String,
    #[validate(length(min = 3, max = 32))]
    pub phone: String,
    #[validate(length(min = 1, max = 255))]
    pub line_one: String,
    pub line_two: Option<String>,
    #[validate(length(min = 1, max = 128))]
    pub city: String,
    #[validate(length(min = 1, max = 128))]
    pub region: String,
    #[validate(length(min = 1, max = 32))]
    pub postal_code: String,
    #[validate(length(min = 2, max = 64))]
    pub country: String,
}

#[derive(Clone)]
pub struct AddressService {
    db: Arc<DatabaseConnection>,
    clock: Arc<dyn Clock>,
}

impl AddressService {
    pub fn new(db: Arc<DatabaseConnection>, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    #[instrument(skip(self, input))]
    pub async fn create(
        &self,
        user_id: Uuid,
        input: CreateAddressInput,
    ) -> Result<address::Model, ServiceError> {
        input.validate()?;

        let address = address::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            recipient_name: Set(input.recipient_name),
            phone: Set(input.phone),
            line_one: Set(input.line_one),
            line_two: Set(input.line_two),
            city: Set(input.city),
            region: Set(input.region),
            postal_code: Set(input.postal_code),
            country: Set(input.country),
            created_at: Set(self.clock.now()),
            deleted_at: Set(None),
        }
        .insert(&*self.db)
        .await?;

        info!(address_id = %address.id, %user_id, "Created address");
        Ok(address)
    }

    pub async fn list(&self, user_id: Uuid) -> Result<Vec<address::Model>, ServiceError> {
        Ok(address::Entity::find()
            .filter(address::Column::UserId.eq(user_id))
            .filter(address::Column::DeletedAt.is_null())
            .order_by_asc(address::Column::CreatedAt)
            .all(&*self.db)
            .await?)
    }

    /// Resolves an address the user may deliver to. Someone else's address
    /// reads as missing.
    pub async fn find_owned<C: ConnectionTrait>(
        &self,
        conn: &C,
        user_id: Uuid,
        address_id: Uuid,
    ) -> Result<address::Model, ServiceError> {
        address::Entity::find_by_id(address_id)
            .filter(address::Column::UserId.eq(user_id))
            .filter(address::Column::DeletedAt.is_null())
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Address {} not found", address_id)))
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, user_id: Uuid, address_id: Uuid) -> Result<(), ServiceError> {
        let address = self.find_owned(&*self.db, user_id, address_id).await?;
        let mut active: address::ActiveModel = address.into();
        active.deleted_at = Set(Some(self.clock.now()));
        active.update(&*self.db).await?;
        Ok(())
    }
}
