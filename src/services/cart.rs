use std::collections::BTreeMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::{
    clock::Clock,
    entities::{cart, cart_item},
    errors::ServiceError,
    events::{Event, EventSender},
    services::catalog::CatalogService,
};

/// Line to put into the cart.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AddCartItemInput {
    pub product_id: Uuid,
    #[validate(range(min = 1, max = 1000))]
    pub quantity: i32,
    pub variant_id: Option<Uuid>,
    #[validate(length(max = 32))]
    pub frame_size: Option<String>,
    pub prescription: Option<serde_json::Value>,
    pub lens_config: Option<serde_json::Value>,
}

/// Cart lines of one store with their advisory subtotal.
#[derive(Debug, Clone, Serialize)]
pub struct StoreCartGroup {
    pub store_id: Uuid,
    pub items: Vec<cart_item::Model>,
    pub subtotal: Decimal,
}

/// Buyer cart broken down by store.
///
/// Prices here are the ones captured when each line was added; checkout
/// re-prices against the live catalog.
#[derive(Debug, Clone, Serialize)]
pub struct CartView {
    pub cart_id: Uuid,
    pub buyer_id: Uuid,
    pub stores: Vec<StoreCartGroup>,
    pub item_count: i32,
    pub subtotal: Decimal,
}

impl CartView {
    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}

/// Buyer shopping cart.
///
/// One cart per buyer, opened on first use. Lines are keyed by product plus
/// configuration (variant, frame size, prescription, lens options); adding the
/// same combination again bumps the quantity of the existing line.
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    catalog: Arc<CatalogService>,
    clock: Arc<dyn Clock>,
}

impl CartService {
    /// Creates a new `CartService` instance.
    ///
    /// # Arguments
    ///
    /// * `db` - Database connection pool
    /// * `event_sender` - Event sender for publishing cart events
    /// * `catalog` - Live product lookups for stock and price checks
    /// * `clock` - Source of timestamps
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        catalog: Arc<CatalogService>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            db,
            event_sender,
            catalog,
            clock,
        }
    }

    /// Adds a line to the buyer's cart, or merges into a matching line.
    ///
    /// The product must be active, and the resulting line quantity must not
    /// exceed current stock. New lines capture the current catalog price.
    ///
    /// # Returns
    ///
    /// * `Ok(CartView)` - The cart after the change
    /// * `Err(ServiceError::NotFound)` - Product missing or archived
    /// * `Err(ServiceError::ProductUnavailable)` - Product deactivated
    /// * `Err(ServiceError::InsufficientStock)` - Not enough units on hand
    #[instrument(skip(self, input), fields(product_id = %input.product_id, quantity = input.quantity))]
    pub async fn add_item(
        &self,
        buyer_id: Uuid,
        input: AddCartItemInput,
    ) -> Result<CartView, ServiceError> {
        input.validate()?;

        let txn = self.db.begin().await?;
        let cart = self.get_or_create_cart(&txn, buyer_id).await?;

        let product = self.catalog.lookup_with(&txn, input.product_id).await?;
        if !product.is_active {
            return Err(ServiceError::ProductUnavailable {
                product_id: product.product_id,
            });
        }

        let key = config_key(
            input.product_id,
            input.variant_id,
            input.frame_size.as_deref(),
            input.prescription.as_ref(),
            input.lens_config.as_ref(),
        );

        let existing = cart_item::Entity::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .filter(cart_item::Column::ConfigKey.eq(key.as_str()))
            .one(&txn)
            .await?;

        let wanted = existing.as_ref().map_or(0, |item| item.quantity) + input.quantity;
        if wanted > product.stock_quantity {
            return Err(ServiceError::InsufficientStock {
                product_id: product.product_id,
                requested: wanted,
                available: product.stock_quantity,
            });
        }

        let now = self.clock.now();
        let item_id = match existing {
            Some(item) => {
                let id = item.id;
                let mut item: cart_item::ActiveModel = item.into();
                item.quantity = Set(wanted);
                item.updated_at = Set(now);
                item.update(&txn).await?;
                id
            }
            None => {
                let item = cart_item::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    cart_id: Set(cart.id),
                    product_id: Set(product.product_id),
                    store_id: Set(product.store_id),
                    quantity: Set(input.quantity),
                    unit_price: Set(product.price),
                    variant_id: Set(input.variant_id),
                    frame_size: Set(input.frame_size),
                    prescription: Set(input.prescription),
                    lens_config: Set(input.lens_config),
                    config_key: Set(key),
                    created_at: Set(now),
                    updated_at: Set(now),
                }
                .insert(&txn)
                .await?;
                item.id
            }
        };

        self.touch(&txn, cart.clone()).await?;
        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::CartItemAdded {
                cart_id: cart.id,
                item_id,
                product_id: product.product_id,
            })
            .await;

        info!(cart_id = %cart.id, %item_id, "Added item to cart");
        self.view(&*self.db, cart).await
    }

    /// Sets the quantity of one of the buyer's cart lines.
    ///
    /// # Returns
    ///
    /// * `Ok(CartView)` - The cart after the change
    /// * `Err(ServiceError::ValidationError)` - Quantity below one
    /// * `Err(ServiceError::NotFound)` - No such line in this buyer's cart
    /// * `Err(ServiceError::InsufficientStock)` - Not enough units on hand
    #[instrument(skip(self))]
    pub async fn update_item(
        &self,
        buyer_id: Uuid,
        item_id: Uuid,
        quantity: i32,
    ) -> Result<CartView, ServiceError> {
        if quantity < 1 {
            return Err(ServiceError::ValidationError(format!(
                "Quantity must be at least 1, got {}",
                quantity
            )));
        }

        let txn = self.db.begin().await?;
        let cart = self.get_or_create_cart(&txn, buyer_id).await?;
        let item = self.find_item(&txn, &cart, item_id).await?;

        let product = self.catalog.lookup_with(&txn, item.product_id).await?;
        if !product.is_active {
            return Err(ServiceError::ProductUnavailable {
                product_id: product.product_id,
            });
        }
        if quantity > product.stock_quantity {
            return Err(ServiceError::InsufficientStock {
                product_id: product.product_id,
                requested: quantity,
                available: product.stock_quantity,
            });
        }

        let mut item: cart_item::ActiveModel = item.into();
        item.quantity = Set(quantity);
        item.updated_at = Set(self.clock.now());
        item.update(&txn).await?;

        self.touch(&txn, cart.clone()).await?;
        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::CartItemUpdated {
                cart_id: cart.id,
                item_id,
            })
            .await;

        self.view(&*self.db, cart).await
    }

    /// Drops one line from the buyer's cart.
    #[instrument(skip(self))]
    pub async fn remove_item(&self, buyer_id: Uuid, item_id: Uuid) -> Result<CartView, ServiceError> {
        let txn = self.db.begin().await?;
        let cart = self.get_or_create_cart(&txn, buyer_id).await?;
        let item = self.find_item(&txn, &cart, item_id).await?;

        cart_item::Entity::delete_by_id(item.id).exec(&txn).await?;
        self.touch(&txn, cart.clone()).await?;
        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::CartItemRemoved {
                cart_id: cart.id,
                item_id,
            })
            .await;

        self.view(&*self.db, cart).await
    }

    /// Empties the buyer's cart.
    #[instrument(skip(self))]
    pub async fn clear(&self, buyer_id: Uuid) -> Result<(), ServiceError> {
        let txn = self.db.begin().await?;
        let cart = self.get_or_create_cart(&txn, buyer_id).await?;
        self.clear_with(&txn, cart.id).await?;
        txn.commit().await?;

        self.event_sender.send_or_log(Event::CartCleared(cart.id)).await;

        info!(cart_id = %cart.id, "Cleared cart");
        Ok(())
    }

    /// Retrieves the buyer's cart grouped by store.
    #[instrument(skip(self))]
    pub async fn get(&self, buyer_id: Uuid) -> Result<CartView, ServiceError> {
        let cart = self.get_or_create_cart(&*self.db, buyer_id).await?;
        self.view(&*self.db, cart).await
    }

    /// Deletes every line of a cart on the caller's connection or transaction.
    pub async fn clear_with<C: ConnectionTrait>(
        &self,
        conn: &C,
        cart_id: Uuid,
    ) -> Result<u64, ServiceError> {
        let result = cart_item::Entity::delete_many()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .exec(conn)
            .await?;
        Ok(result.rows_affected)
    }

    /// Removes exactly the given lines from a cart, or fails with `Conflict`
    /// when any of them is already gone.
    ///
    /// Checkout claims its lines with this before touching stock, so two
    /// checkouts of the same cart cannot both go through: the second one's
    /// delete waits on the first and then finds nothing left to take.
    pub async fn take_lines<C: ConnectionTrait>(
        &self,
        conn: &C,
        cart_id: Uuid,
        lines: &[cart_item::Model],
    ) -> Result<(), ServiceError> {
        let ids: Vec<Uuid> = lines.iter().map(|line| line.id).collect();
        let result = cart_item::Entity::delete_many()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .filter(cart_item::Column::Id.is_in(ids.clone()))
            .exec(conn)
            .await?;

        if result.rows_affected != ids.len() as u64 {
            warn!(
                %cart_id,
                expected = ids.len(),
                removed = result.rows_affected,
                "Cart lines taken by another checkout"
            );
            return Err(ServiceError::Conflict(format!(
                "Cart {} changed while checking out",
                cart_id
            )));
        }
        Ok(())
    }

    /// Loads the buyer's cart and its lines, oldest line first.
    pub async fn load_with<C: ConnectionTrait>(
        &self,
        conn: &C,
        buyer_id: Uuid,
    ) -> Result<Option<(cart::Model, Vec<cart_item::Model>)>, ServiceError> {
        let Some(cart) = cart::Entity::find()
            .filter(cart::Column::BuyerId.eq(buyer_id))
            .one(conn)
            .await?
        else {
            return Ok(None);
        };
        let items = self.items(conn, cart.id).await?;
        Ok(Some((cart, items)))
    }

    async fn get_or_create_cart<C: ConnectionTrait>(
        &self,
        conn: &C,
        buyer_id: Uuid,
    ) -> Result<cart::Model, ServiceError> {
        if let Some(cart) = cart::Entity::find()
            .filter(cart::Column::BuyerId.eq(buyer_id))
            .one(conn)
            .await?
        {
            return Ok(cart);
        }

        let now = self.clock.now();
        let cart = cart::ActiveModel {
            id: Set(Uuid::new_v4()),
            buyer_id: Set(buyer_id),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(conn)
        .await?;
        Ok(cart)
    }

    async fn find_item<C: ConnectionTrait>(
        &self,
        conn: &C,
        cart: &cart::Model,
        item_id: Uuid,
    ) -> Result<cart_item::Model, ServiceError> {
        cart_item::Entity::find_by_id(item_id)
            .filter(cart_item::Column::CartId.eq(cart.id))
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart item {} not found", item_id)))
    }

    async fn items<C: ConnectionTrait>(
        &self,
        conn: &C,
        cart_id: Uuid,
    ) -> Result<Vec<cart_item::Model>, ServiceError> {
        Ok(cart_item::Entity::find()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .order_by_asc(cart_item::Column::CreatedAt)
            .all(conn)
            .await?)
    }

    async fn touch<C: ConnectionTrait>(
        &self,
        conn: &C,
        cart: cart::Model,
    ) -> Result<(), ServiceError> {
        let mut active: cart::ActiveModel = cart.into();
        active.updated_at = Set(self.clock.now());
        active.update(conn).await?;
        Ok(())
    }

    async fn view<C: ConnectionTrait>(
        &self,
        conn: &C,
        cart: cart::Model,
    ) -> Result<CartView, ServiceError> {
        let items = self.items(conn, cart.id).await?;
        Ok(group_by_store(cart.id, cart.buyer_id, items))
    }
}

/// Groups cart lines by owning store, preserving line order within a store.
pub fn group_by_store(cart_id: Uuid, buyer_id: Uuid, items: Vec<cart_item::Model>) -> CartView {
    let mut order: Vec<Uuid> = Vec::new();
    let mut groups: BTreeMap<Uuid, Vec<cart_item::Model>> = BTreeMap::new();
    for item in items {
        if !groups.contains_key(&item.store_id) {
            order.push(item.store_id);
        }
        groups.entry(item.store_id).or_default().push(item);
    }

    let stores: Vec<StoreCartGroup> = order
        .into_iter()
        .filter_map(|store_id| groups.remove(&store_id).map(|items| (store_id, items)))
        .map(|(store_id, items)| {
            let subtotal = items
                .iter()
                .map(|i| i.unit_price * Decimal::from(i.quantity))
                .sum();
            StoreCartGroup {
                store_id,
                items,
                subtotal,
            }
        })
        .collect();

    let item_count = stores
        .iter()
        .flat_map(|g| g.items.iter())
        .map(|i| i.quantity)
        .sum();
    let subtotal = stores.iter().map(|g| g.subtotal).sum();

    CartView {
        cart_id,
        buyer_id,
        stores,
        item_count,
        subtotal,
    }
}

/// Identity of a cart line: product plus every configuration that makes two
/// units distinguishable.
pub fn config_key(
    product_id: Uuid,
    variant_id: Option<Uuid>,
    frame_size: Option<&str>,
    prescription: Option<&serde_json::Value>,
    lens_config: Option<&serde_json::Value>,
) -> String {
    // serde_json maps are ordered, so equal payloads serialize identically
    let canonical = serde_json::json!({
        "product": product_id,
        "variant": variant_id,
        "frame_size": frame_size,
        "prescription": prescription,
        "lens": lens_config,
    });
    hex::encode(Sha256::digest(canonical.to_string().as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn line(store_id: Uuid, price: Decimal, quantity: i32) -> cart_item::Model {
        cart_item::Model {
            id: Uuid::new_v4(),
            cart_id: Uuid::nil(),
            product_id: Uuid::new_v4(),
            store_id,
            quantity,
            unit_price: price,
            variant_id: None,
            frame_size: None,
            prescription: None,
            lens_config: None,
            config_key: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn key_ignores_json_field_order() {
        let product = Uuid::new_v4();
        let a = json!({"coating": "blue-light", "index": 1.67});
        let b: serde_json::Value =
            serde_json::from_str(r#"{"index": 1.67, "coating": "blue-light"}"#).unwrap();
        assert_eq!(
            config_key(product, None, None, None, Some(&a)),
            config_key(product, None, None, None, Some(&b))
        );
    }

    #[test]
    fn key_separates_configurations() {
        let product = Uuid::new_v4();
        let plain = config_key(product, None, None, None, None);
        let sized = config_key(product, None, Some("52-18-140"), None, None);
        let lens = config_key(product, None, None, None, Some(&json!({"tint": "grey"})));
        assert_ne!(plain, sized);
        assert_ne!(plain, lens);
        assert_ne!(sized, lens);
        assert_eq!(plain.len(), 64);
    }

    #[test]
    fn groups_keep_store_order_and_subtotals() {
        let store_a = Uuid::new_v4();
        let store_b = Uuid::new_v4();
        let view = group_by_store(
            Uuid::new_v4(),
            Uuid::new_v4(),
            vec![
                line(store_b, dec!(50.00), 1),
                line(store_a, dec!(30.00), 2),
                line(store_b, dec!(10.00), 3),
            ],
        );

        assert_eq!(view.stores.len(), 2);
        assert_eq!(view.stores[0].store_id, store_b);
        assert_eq!(view.stores[0].subtotal, dec!(80.00));
        assert_eq!(view.stores[1].subtotal, dec!(60.00));
        assert_eq!(view.item_count, 6);
        assert_eq!(view.subtotal, dec!(140.00));
    }
}
