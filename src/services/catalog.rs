use std::sync::Arc;

use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, QueryFilter, Set,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

use crate::{
    clock::Clock,
    entities::{product, store},
    errors::ServiceError,
};

/// Live catalog data for one product, as checkout and the cart see it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProductLookup {
    pub product_id: Uuid,
    pub store_id: Uuid,
    /// Owner of the store, i.e. the seller
    pub seller_id: Uuid,
    pub name: String,
    pub sku: String,
    pub price: Decimal,
    pub is_active: bool,
    pub stock_quantity: i32,
    pub images: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateStoreInput {
    pub owner_id: Uuid,
    #[validate(length(min = 1, max = 255))]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateProductInput {
    pub store_id: Uuid,
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[validate(length(min = 1, max = 64))]
    pub sku: String,
    pub price: Decimal,
    #[validate(range(min = 0))]
    pub stock_quantity: i32,
    pub images: Option<serde_json::Value>,
}

/// Product and store lookups backing the cart and checkout.
#[derive(Clone)]
pub struct CatalogService {
    db: Arc<DatabaseConnection>,
    clock: Arc<dyn Clock>,
}

impl CatalogService {
    pub fn new(db: Arc<DatabaseConnection>, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    #[instrument(skip(self))]
    pub async fn create_store(&self, input: CreateStoreInput) -> Result<store::Model, ServiceError> {
        input.validate()?;

        let store = store::ActiveModel {
            id: Set(Uuid::new_v4()),
            owner_id: Set(input.owner_id),
            name: Set(input.name),
            created_at: Set(self.clock.now()),
            deleted_at: Set(None),
        }
        .insert(&*self.db)
        .await?;

        info!(store_id = %store.id, "Created store");
        Ok(store)
    }

    #[instrument(skip(self))]
    pub async fn create_product(
        &self,
        input: CreateProductInput,
    ) -> Result<product::Model, ServiceError> {
        input.validate()?;
        if input.price.is_sign_negative() {
            return Err(ServiceError::ValidationError(
                "Product price cannot be negative".to_string(),
            ));
        }

        self.find_store(&*self.db, input.store_id).await?;

        let now = self.clock.now();
        let product = product::ActiveModel {
            id: Set(Uuid::new_v4()),
            store_id: Set(input.store_id),
            name: Set(input.name),
            sku: Set(input.sku),
            price: Set(input.price),
            stock_quantity: Set(input.stock_quantity),
            is_active: Set(true),
            images: Set(input.images),
            created_at: Set(now),
            updated_at: Set(now),
            deleted_at: Set(None),
        }
        .insert(&*self.db)
        .await?;

        info!(product_id = %product.id, store_id = %product.store_id, "Created product");
        Ok(product)
    }

    /// Current price, status, stock and owning store of a product.
    pub async fn lookup(&self, product_id: Uuid) -> Result<ProductLookup, ServiceError> {
        self.lookup_with(&*self.db, product_id).await
    }

    /// Same as [`lookup`](Self::lookup) but on the caller's connection or transaction.
    pub async fn lookup_with<C: ConnectionTrait>(
        &self,
        conn: &C,
        product_id: Uuid,
    ) -> Result<ProductLookup, ServiceError> {
        let product = product::Entity::find_by_id(product_id)
            .filter(product::Column::DeletedAt.is_null())
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))?;

        let store = self.find_store(conn, product.store_id).await.map_err(|_| {
            ServiceError::NotFound(format!("Product {} not found", product_id))
        })?;

        Ok(ProductLookup {
            product_id: product.id,
            store_id: store.id,
            seller_id: store.owner_id,
            name: product.name,
            sku: product.sku,
            price: product.price,
            is_active: product.is_active,
            stock_quantity: product.stock_quantity,
            images: product.images,
        })
    }

    /// Takes `quantity` units off the shelf, refusing to go below zero.
    pub async fn reserve_stock<C: ConnectionTrait>(
        &self,
        conn: &C,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<(), ServiceError> {
        if quantity <= 0 {
            return Err(ServiceError::ValidationError(format!(
                "Quantity must be positive, got {}",
                quantity
            )));
        }

        let result = product::Entity::update_many()
            .col_expr(
                product::Column::StockQuantity,
                Expr::col(product::Column::StockQuantity).sub(quantity),
            )
            .col_expr(product::Column::UpdatedAt, Expr::value(self.clock.now()))
            .filter(product::Column::Id.eq(product_id))
            .filter(product::Column::IsActive.eq(true))
            .filter(product::Column::DeletedAt.is_null())
            .filter(product::Column::StockQuantity.gte(quantity))
            .exec(conn)
            .await?;

        if result.rows_affected == 1 {
            return Ok(());
        }

        // Work out which guard refused the decrement
        let current = self.lookup_with(conn, product_id).await?;
        if !current.is_active {
            return Err(ServiceError::ProductUnavailable { product_id });
        }
        Err(ServiceError::InsufficientStock {
            product_id,
            requested: quantity,
            available: current.stock_quantity,
        })
    }

    /// Puts `quantity` units back on the shelf. Archived or deactivated
    /// products take their units back too.
    pub async fn release_stock<C: ConnectionTrait>(
        &self,
        conn: &C,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<(), ServiceError> {
        if quantity <= 0 {
            return Ok(());
        }
        product::Entity::update_many()
            .col_expr(
                product::Column::StockQuantity,
                Expr::col(product::Column::StockQuantity).add(quantity),
            )
            .col_expr(product::Column::UpdatedAt, Expr::value(self.clock.now()))
            .filter(product::Column::Id.eq(product_id))
            .exec(conn)
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn set_stock(&self, product_id: Uuid, stock_quantity: i32) -> Result<(), ServiceError> {
        if stock_quantity < 0 {
            return Err(ServiceError::ValidationError(
                "Stock cannot be negative".to_string(),
            ));
        }
        let product = self.find_product(product_id).await?;
        let mut active: product::ActiveModel = product.into();
        active.stock_quantity = Set(stock_quantity);
        active.updated_at = Set(self.clock.now());
        active.update(&*self.db).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn set_active(&self, product_id: Uuid, is_active: bool) -> Result<(), ServiceError> {
        let product = self.find_product(product_id).await?;
        let mut active: product::ActiveModel = product.into();
        active.is_active = Set(is_active);
        active.updated_at = Set(self.clock.now());
        active.update(&*self.db).await?;
        Ok(())
    }

    /// Tombstones a product; it disappears from every lookup.
    #[instrument(skip(self))]
    pub async fn archive_product(&self, product_id: Uuid) -> Result<(), ServiceError> {
        let product = self.find_product(product_id).await?;
        let now = self.clock.now();
        let mut active: product::ActiveModel = product.into();
        active.deleted_at = Set(Some(now));
        active.updated_at = Set(now);
        active.update(&*self.db).await?;
        info!(%product_id, "Archived product");
        Ok(())
    }

    async fn find_product(&self, product_id: Uuid) -> Result<product::Model, ServiceError> {
        product::Entity::find_by_id(product_id)
            .filter(product::Column::DeletedAt.is_null())
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))
    }

    async fn find_store<C: ConnectionTrait>(
        &self,
        conn: &C,
        store_id: Uuid,
    ) -> Result<store::Model, ServiceError> {
        store::Entity::find_by_id(store_id)
            .filter(store::Column::DeletedAt.is_null())
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Store {} not found", store_id)))
    }
}
