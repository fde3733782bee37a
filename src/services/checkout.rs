use std::sync::Arc;

use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::{
    clock::Clock,
    codes::{format_delivery_code, format_order_number, CodeGenerator},
    config::SettlementSettings,
    entities::{cart_item, order, order_item, store_order, PaymentStatus, StoreOrderStatus},
    errors::ServiceError,
    events::{Event, EventSender},
    notifications::{dispatch_all, Notification, NotificationDispatcher, NotificationEvent, Recipient},
    services::{
        addresses::AddressService,
        allocation::allocate_discount,
        cart::{group_by_store, CartService},
        catalog::{CatalogService, ProductLookup},
        coupons::CouponService,
        points::PointsService,
    },
};

/// Order-number draws before giving up on finding a free one.
const MAX_ORDER_NUMBER_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct PlaceOrderInput {
    pub delivery_address_id: Uuid,
    #[validate(length(min = 1, max = 32))]
    pub payment_method: Option<String>,
    #[validate(length(min = 1, max = 64))]
    pub coupon_code: Option<String>,
    #[validate(range(min = 0))]
    pub points_to_redeem: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlacedStoreOrder {
    #[serde(flatten)]
    pub store_order: store_order::Model,
    pub items: Vec<order_item::Model>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlacedOrder {
    #[serde(flatten)]
    pub order: order::Model,
    pub store_orders: Vec<PlacedStoreOrder>,
}

/// One cart line re-priced against the live catalog.
struct PricedLine {
    item: cart_item::Model,
    product: ProductLookup,
    line_total: Decimal,
}

struct StoreGroup {
    store_id: Uuid,
    seller_id: Uuid,
    lines: Vec<PricedLine>,
    subtotal: Decimal,
}

/// Turns a buyer's cart into one order and a store order per seller.
///
/// Everything from stock reservation to clearing the cart happens in one
/// database transaction; notifications go out only after it commits.
#[derive(Clone)]
pub struct CheckoutService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    clock: Arc<dyn Clock>,
    codes: Arc<dyn CodeGenerator>,
    catalog: Arc<CatalogService>,
    addresses: Arc<AddressService>,
    coupons: Arc<CouponService>,
    points: Arc<PointsService>,
    cart: Arc<CartService>,
    notifier: Arc<dyn NotificationDispatcher>,
    settings: SettlementSettings,
}

impl CheckoutService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        clock: Arc<dyn Clock>,
        codes: Arc<dyn CodeGenerator>,
        catalog: Arc<CatalogService>,
        addresses: Arc<AddressService>,
        coupons: Arc<CouponService>,
        points: Arc<PointsService>,
        cart: Arc<CartService>,
        notifier: Arc<dyn NotificationDispatcher>,
        settings: SettlementSettings,
    ) -> Self {
        Self {
            db,
            event_sender,
            clock,
            codes,
            catalog,
            addresses,
            coupons,
            points,
            cart,
            notifier,
            settings,
        }
    }

    /// Places an order from the buyer's cart.
    ///
    /// Products are re-checked and re-priced against the live catalog and
    /// their stock is reserved. Coupon and points discounts are combined and
    /// split across store orders by subtotal share.
    ///
    /// # Errors
    ///
    /// * `EmptyCart` - nothing to check out
    /// * `ProductUnavailable` / `InsufficientStock` - naming the offending product
    /// * `ValidationError` - unusable coupon, or discounts above the items total
    /// * `InsufficientPoints` - the buyer cannot cover the requested points
    /// * `Conflict` - a concurrent checkout already took the cart's lines
    ///
    /// Any error leaves no trace: the order, stock, points, coupon usage and
    /// cart are all rolled back together.
    #[instrument(skip(self, input), fields(buyer_id = %buyer_id))]
    pub async fn place_order(
        &self,
        buyer_id: Uuid,
        input: PlaceOrderInput,
    ) -> Result<PlacedOrder, ServiceError> {
        input.validate()?;

        let txn = self.db.begin().await?;
        self.addresses
            .find_owned(&txn, buyer_id, input.delivery_address_id)
            .await?;

        let (cart, items) = match self.cart.load_with(&txn, buyer_id).await? {
            Some((cart, items)) if !items.is_empty() => (cart, items),
            _ => return Err(ServiceError::EmptyCart),
        };
        self.cart.take_lines(&txn, cart.id, &items).await?;

        let groups = self.price_and_reserve(&txn, cart.id, buyer_id, items).await?;
        let subtotals: Vec<Decimal> = groups.iter().map(|g| g.subtotal).collect();
        let items_total: Decimal = subtotals.iter().copied().sum();
        let order_id = Uuid::new_v4();

        let coupon = match input.coupon_code.as_deref().map(str::trim) {
            Some(code) if !code.is_empty() => {
                let validation = self
                    .coupons
                    .validate_with(&txn, code, buyer_id, items_total)
                    .await
                    .map_err(|e| e.in_collaborator("coupon validator"))?;
                match (validation.valid, validation.coupon_id) {
                    (true, Some(coupon_id)) => Some((
                        coupon_id,
                        code.to_uppercase(),
                        validation.discount_amount,
                    )),
                    _ => return Err(ServiceError::ValidationError(validation.message)),
                }
            }
            _ => None,
        };
        let coupon_discount = coupon.as_ref().map_or(Decimal::ZERO, |(_, _, d)| *d);

        let points_requested = input.points_to_redeem.unwrap_or(0);
        let redemption = if points_requested > 0 {
            Some(
                self.points
                    .redeem(&txn, buyer_id, points_requested, Some(order_id))
                    .await
                    .map_err(|e| e.in_collaborator("points ledger"))?,
            )
        } else {
            None
        };
        let points_discount = redemption
            .as_ref()
            .map_or(Decimal::ZERO, |r| r.discount_amount);

        let discount_total = coupon_discount + points_discount;
        let shares = allocate_discount(&subtotals, discount_total)?;

        let shipping_total = Decimal::ZERO;
        let platform_fee = (items_total * self.settings.platform_fee_rate).round_dp(2);
        let grand_total = items_total + shipping_total + platform_fee - discount_total;

        let now = self.clock.now();
        let order_number = self.next_order_number(&txn).await?;
        let order = order::ActiveModel {
            id: Set(order_id),
            order_number: Set(order_number),
            buyer_id: Set(buyer_id),
            delivery_address_id: Set(input.delivery_address_id),
            payment_status: Set(PaymentStatus::Pending),
            payment_method: Set(input.payment_method.clone()),
            coupon_code: Set(coupon.as_ref().map(|(_, code, _)| code.clone())),
            points_redeemed: Set(points_requested),
            items_total: Set(items_total),
            shipping_total: Set(shipping_total),
            platform_fee: Set(platform_fee),
            discount_total: Set(discount_total),
            grand_total: Set(grand_total),
            metadata: Set(serde_json::json!({
                "coupon_discount": coupon_discount,
                "points_discount": points_discount,
            })),
            created_at: Set(now),
            updated_at: Set(now),
            deleted_at: Set(None),
        }
        .insert(&txn)
        .await?;

        let mut placed = Vec::with_capacity(groups.len());
        for (group, discount_amount) in groups.into_iter().zip(shares) {
            let so = store_order::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                store_id: Set(group.store_id),
                seller_id: Set(group.seller_id),
                buyer_id: Set(buyer_id),
                status: Set(StoreOrderStatus::Pending),
                subtotal: Set(group.subtotal),
                discount_amount: Set(discount_amount),
                delivery_fee: Set(Decimal::ZERO),
                total: Set(group.subtotal),
                delivery_code: Set(format_delivery_code(self.codes.delivery_code())),
                delivery_code_attempts: Set(0),
                delivery_address_id: Set(input.delivery_address_id),
                estimated_delivery_at: Set(None),
                payment_method: Set(None),
                payment_reference: Set(None),
                rejection_reason: Set(None),
                cancellation_reason: Set(None),
                accepted_at: Set(None),
                rejected_at: Set(None),
                paid_at: Set(None),
                out_for_delivery_at: Set(None),
                delivered_at: Set(None),
                cancelled_at: Set(None),
                created_at: Set(now),
                updated_at: Set(now),
            }
            .insert(&txn)
            .await?;

            let mut items = Vec::with_capacity(group.lines.len());
            for line in group.lines {
                let item = order_item::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    store_order_id: Set(so.id),
                    product_id: Set(line.product.product_id),
                    variant_id: Set(line.item.variant_id),
                    name: Set(line.product.name),
                    sku: Set(line.product.sku),
                    quantity: Set(line.item.quantity),
                    price: Set(line.product.price),
                    line_total: Set(line.line_total),
                    images: Set(line.product.images),
                    frame_size: Set(line.item.frame_size),
                    prescription: Set(line.item.prescription),
                    lens_config: Set(line.item.lens_config),
                    created_at: Set(now),
                }
                .insert(&txn)
                .await?;
                items.push(item);
            }

            placed.push(PlacedStoreOrder {
                store_order: so,
                items,
            });
        }

        if let Some((coupon_id, _, discount)) = &coupon {
            self.coupons
                .record_redemption(&txn, *coupon_id, buyer_id, order_id, *discount)
                .await
                .map_err(|e| e.in_collaborator("coupon validator"))?;
        }

        txn.commit().await?;

        info!(
            order_id = %order.id,
            order_number = %order.order_number,
            store_orders = placed.len(),
            %items_total,
            %discount_total,
            "Order placed"
        );

        self.after_commit(
            &order,
            &placed,
            cart.id,
            coupon.map(|(id, _, _)| id),
            redemption.map(|r| (r.points, r.discount_amount)),
        )
        .await;

        Ok(PlacedOrder {
            order,
            store_orders: placed,
        })
    }

    /// Groups cart lines by store, re-prices them and takes their stock.
    async fn price_and_reserve<C: ConnectionTrait>(
        &self,
        conn: &C,
        cart_id: Uuid,
        buyer_id: Uuid,
        items: Vec<cart_item::Model>,
    ) -> Result<Vec<StoreGroup>, ServiceError> {
        let view = group_by_store(cart_id, buyer_id, items);

        let mut groups = Vec::with_capacity(view.stores.len());
        for store in view.stores {
            let mut lines = Vec::with_capacity(store.items.len());
            let mut seller_id = None;
            for item in store.items {
                let product = self
                    .catalog
                    .lookup_with(conn, item.product_id)
                    .await
                    .map_err(|e| e.in_collaborator("catalog"))?;
                if !product.is_active {
                    return Err(ServiceError::ProductUnavailable {
                        product_id: product.product_id,
                    });
                }
                self.catalog
                    .reserve_stock(conn, product.product_id, item.quantity)
                    .await
                    .map_err(|e| e.in_collaborator("catalog"))?;

                seller_id.get_or_insert(product.seller_id);
                let line_total = product.price * Decimal::from(item.quantity);
                lines.push(PricedLine {
                    item,
                    product,
                    line_total,
                });
            }

            let Some(seller_id) = seller_id else {
                continue;
            };
            let subtotal = lines.iter().map(|l| l.line_total).sum();
            groups.push(StoreGroup {
                store_id: store.store_id,
                seller_id,
                lines,
                subtotal,
            });
        }
        Ok(groups)
    }

    async fn next_order_number<C: ConnectionTrait>(&self, conn: &C) -> Result<String, ServiceError> {
        let date = self.clock.now().date_naive();
        for _ in 0..MAX_ORDER_NUMBER_ATTEMPTS {
            let candidate = format_order_number(
                &self.settings.order_number_prefix,
                date,
                self.codes.order_sequence(),
            );
            let taken = order::Entity::find()
                .filter(order::Column::OrderNumber.eq(candidate.as_str()))
                .count(conn)
                .await?;
            if taken == 0 {
                return Ok(candidate);
            }
            warn!(order_number = %candidate, "Order number already taken, drawing again");
        }
        Err(ServiceError::Conflict(
            "Could not allocate a unique order number".to_string(),
        ))
    }

    async fn after_commit(
        &self,
        order: &order::Model,
        placed: &[PlacedStoreOrder],
        cart_id: Uuid,
        coupon_id: Option<Uuid>,
        points: Option<(i64, Decimal)>,
    ) {
        self.event_sender
            .send_or_log(Event::OrderPlaced {
                order_id: order.id,
                order_number: order.order_number.clone(),
                buyer_id: order.buyer_id,
                store_order_ids: placed.iter().map(|p| p.store_order.id).collect(),
            })
            .await;
        self.event_sender.send_or_log(Event::CartCleared(cart_id)).await;
        if let Some(coupon_id) = coupon_id {
            self.event_sender
                .send_or_log(Event::CouponRedeemed {
                    coupon_id,
                    order_id: order.id,
                })
                .await;
        }
        if let Some((points, discount)) = points {
            self.event_sender
                .send_or_log(Event::PointsRedeemed {
                    user_id: order.buyer_id,
                    points,
                    discount,
                })
                .await;
        }

        let now = self.clock.now();
        let mut notifications = vec![Notification::new(
            NotificationEvent::OrderPlaced,
            Recipient::Buyer(order.buyer_id),
            order.id,
            None,
            serde_json::json!({
                "order_number": order.order_number,
                "grand_total": order.grand_total,
            }),
            now,
        )];
        notifications.extend(placed.iter().map(|p| {
            Notification::new(
                NotificationEvent::OrderPlaced,
                Recipient::Seller(p.store_order.seller_id),
                order.id,
                Some(p.store_order.id),
                serde_json::json!({
                    "order_number": order.order_number,
                    "subtotal": p.store_order.subtotal,
                    "items": p.items.len(),
                }),
                now,
            )
        }));
        dispatch_all(self.notifier.as_ref(), notifications).await;
    }
}
