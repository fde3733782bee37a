mod common;

use assert_matches::assert_matches;
use common::{line, Marketplace, TestApp};
use optical_settlement::{
    config::SettlementSettings,
    entities::{
        coupon::DiscountType, coupon_redemption, product, PaymentStatus, StoreOrderStatus,
    },
    errors::ServiceError,
    notifications::{NotificationEvent, Recipient},
    services::{checkout::PlaceOrderInput, coupons::CreateCouponInput},
};
use rust_decimal_macros::dec;
use sea_orm::{ConnectionTrait, EntityTrait, PaginatorTrait};
use uuid::Uuid;

async fn stock_of(app: &TestApp, product_id: Uuid) -> i32 {
    product::Entity::find_by_id(product_id)
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap()
        .stock_quantity
}

fn percent_coupon(code: &str, value: rust_decimal::Decimal) -> CreateCouponInput {
    CreateCouponInput {
        code: code.to_string(),
        discount_type: DiscountType::Percent,
        value,
        min_order_amount: None,
        max_discount: None,
        usage_limit: None,
        per_user_limit: None,
        starts_at: None,
        expires_at: None,
    }
}

#[tokio::test]
async fn cart_splits_into_one_store_order_per_seller() {
    let app = TestApp::new().await;
    let m = Marketplace::seed(&app, dec!(40.00), 10).await;

    let other_seller = Uuid::new_v4();
    let other_store = app.seed_store(other_seller, "Lens Lab").await;
    let lenses = app
        .seed_product(other_store.id, "Blue Light Lenses", dec!(25.50), 5)
        .await;

    app.add_to_cart(m.buyer, m.product.id, 2).await;
    app.add_to_cart(m.buyer, lenses.id, 1).await;

    let placed = app.checkout(m.buyer, m.address.id).await;

    assert_eq!(placed.order.buyer_id, m.buyer);
    assert_eq!(placed.order.items_total, dec!(105.50));
    assert_eq!(placed.order.grand_total, dec!(105.50));
    assert_eq!(placed.order.payment_status, PaymentStatus::Pending);
    assert!(placed.order.order_number.starts_with("COL-20240301-"));
    assert_eq!(placed.store_orders.len(), 2);

    let frames = placed
        .store_orders
        .iter()
        .find(|so| so.store_order.store_id == m.store.id)
        .expect("frame store order");
    assert_eq!(frames.store_order.seller_id, m.seller);
    assert_eq!(frames.store_order.status, StoreOrderStatus::Pending);
    assert_eq!(frames.store_order.subtotal, dec!(80.00));
    assert_eq!(frames.store_order.total, dec!(80.00));
    assert_eq!(frames.items.len(), 1);
    assert_eq!(frames.items[0].quantity, 2);
    assert_eq!(frames.items[0].name, "Round Acetate Frame");

    let lens_order = placed
        .store_orders
        .iter()
        .find(|so| so.store_order.store_id == other_store.id)
        .expect("lens store order");
    assert_eq!(lens_order.store_order.seller_id, other_seller);
    assert_eq!(lens_order.store_order.subtotal, dec!(25.50));

    // Every store order gets its own six-digit code
    for so in &placed.store_orders {
        assert_eq!(so.store_order.delivery_code.len(), 6);
        assert!(so.store_order.delivery_code.chars().all(|c| c.is_ascii_digit()));
    }
    assert_ne!(
        frames.store_order.delivery_code,
        lens_order.store_order.delivery_code
    );

    assert_eq!(stock_of(&app, m.product.id).await, 8);
    assert_eq!(stock_of(&app, lenses.id).await, 4);
    assert!(app.services.cart.get(m.buyer).await.unwrap().is_empty());
}

#[tokio::test]
async fn checkout_uses_live_prices_not_cart_prices() {
    let app = TestApp::new().await;
    let m = Marketplace::seed(&app, dec!(40.00), 10).await;
    app.add_to_cart(m.buyer, m.product.id, 1).await;

    // Seller raises the price after the buyer added the frame
    let mut active: product::ActiveModel = m.product.clone().into();
    active.price = sea_orm::Set(dec!(45.00));
    sea_orm::ActiveModelTrait::update(active, &*app.state.db)
        .await
        .unwrap();

    let placed = app.checkout(m.buyer, m.address.id).await;
    assert_eq!(placed.order.items_total, dec!(45.00));
    assert_eq!(placed.store_orders[0].items[0].price, dec!(45.00));
    assert_eq!(placed.store_orders[0].items[0].line_total, dec!(45.00));
}

#[tokio::test]
async fn empty_cart_is_rejected() {
    let app = TestApp::new().await;
    let m = Marketplace::seed(&app, dec!(40.00), 10).await;

    let result = app
        .services
        .checkout
        .place_order(
            m.buyer,
            PlaceOrderInput {
                delivery_address_id: m.address.id,
                ..PlaceOrderInput::default()
            },
        )
        .await;
    assert_matches!(result, Err(ServiceError::EmptyCart));
}

#[tokio::test]
async fn address_of_someone_else_is_not_found() {
    let app = TestApp::new().await;
    let m = Marketplace::seed(&app, dec!(40.00), 10).await;
    let stranger_address = app.seed_address(Uuid::new_v4()).await;
    app.add_to_cart(m.buyer, m.product.id, 1).await;

    let result = app
        .services
        .checkout
        .place_order(
            m.buyer,
            PlaceOrderInput {
                delivery_address_id: stranger_address.id,
                ..PlaceOrderInput::default()
            },
        )
        .await;
    assert_matches!(result, Err(ServiceError::NotFound(_)));
    assert_eq!(stock_of(&app, m.product.id).await, 10);
}

#[tokio::test]
async fn stock_shortfall_rolls_everything_back() {
    let app = TestApp::new().await;
    let m = Marketplace::seed(&app, dec!(40.00), 10).await;

    let other_store = app.seed_store(Uuid::new_v4(), "Lens Lab").await;
    let scarce = app
        .seed_product(other_store.id, "Photochromic Lens", dec!(60.00), 3)
        .await;

    app.add_to_cart(m.buyer, m.product.id, 2).await;
    app.add_to_cart(m.buyer, scarce.id, 3).await;
    app.services.catalog.set_stock(scarce.id, 1).await.unwrap();
    app.services
        .points
        .award(m.buyer, 500, "welcome", None)
        .await
        .unwrap();

    let result = app
        .services
        .checkout
        .place_order(
            m.buyer,
            PlaceOrderInput {
                delivery_address_id: m.address.id,
                points_to_redeem: Some(500),
                ..PlaceOrderInput::default()
            },
        )
        .await;

    assert_matches!(
        result,
        Err(ServiceError::InsufficientStock { product_id, requested: 3, available: 1 })
            if product_id == scarce.id
    );

    // Nothing moved: stock, points, cart, orders
    assert_eq!(stock_of(&app, m.product.id).await, 10);
    assert_eq!(stock_of(&app, scarce.id).await, 1);
    assert_eq!(app.services.points.available_balance(m.buyer).await.unwrap(), 500);
    assert_eq!(app.services.cart.get(m.buyer).await.unwrap().item_count, 5);
    let orders = optical_settlement::entities::order::Entity::find()
        .count(&*app.state.db)
        .await
        .unwrap();
    assert_eq!(orders, 0);
    assert!(app.notifier.sent().await.is_empty());
}

#[tokio::test]
async fn deactivated_product_blocks_checkout() {
    let app = TestApp::new().await;
    let m = Marketplace::seed(&app, dec!(40.00), 10).await;
    app.add_to_cart(m.buyer, m.product.id, 1).await;
    app.services
        .catalog
        .set_active(m.product.id, false)
        .await
        .unwrap();

    let result = app
        .services
        .checkout
        .place_order(
            m.buyer,
            PlaceOrderInput {
                delivery_address_id: m.address.id,
                ..PlaceOrderInput::default()
            },
        )
        .await;
    assert_matches!(
        result,
        Err(ServiceError::ProductUnavailable { product_id }) if product_id == m.product.id
    );
}

#[tokio::test]
async fn coupon_and_points_are_split_by_subtotal_share() {
    let app = TestApp::new().await;
    let m = Marketplace::seed(&app, dec!(75.00), 10).await;
    let other_store = app.seed_store(Uuid::new_v4(), "Lens Lab").await;
    let lenses = app
        .seed_product(other_store.id, "Anti-Glare Lens", dec!(25.00), 10)
        .await;

    app.add_to_cart(m.buyer, m.product.id, 1).await;
    app.add_to_cart(m.buyer, lenses.id, 1).await;
    app.services
        .coupons
        .create_coupon(percent_coupon("SPRING10", dec!(10)))
        .await
        .unwrap();
    app.services
        .points
        .award(m.buyer, 1_000, "welcome", None)
        .await
        .unwrap();

    let placed = app
        .services
        .checkout
        .place_order(
            m.buyer,
            PlaceOrderInput {
                delivery_address_id: m.address.id,
                coupon_code: Some("spring10".to_string()),
                points_to_redeem: Some(1_000),
                ..PlaceOrderInput::default()
            },
        )
        .await
        .unwrap();

    // 10% of 100 plus 1000 points at 100 points per unit
    assert_eq!(placed.order.discount_total, dec!(20.00));
    assert_eq!(placed.order.grand_total, dec!(80.00));
    assert_eq!(placed.order.coupon_code.as_deref(), Some("SPRING10"));
    assert_eq!(placed.order.points_redeemed, 1_000);
    let coupon_discount: rust_decimal::Decimal =
        serde_json::from_value(placed.order.metadata["coupon_discount"].clone()).unwrap();
    assert_eq!(coupon_discount, dec!(10.00));

    let share = |store_id| {
        placed
            .store_orders
            .iter()
            .find(|so| so.store_order.store_id == store_id)
            .map(|so| so.store_order.discount_amount)
            .unwrap()
    };
    assert_eq!(share(m.store.id), dec!(15.00));
    assert_eq!(share(other_store.id), dec!(5.00));

    assert_eq!(app.services.points.available_balance(m.buyer).await.unwrap(), 0);
    let redemptions = coupon_redemption::Entity::find()
        .count(&*app.state.db)
        .await
        .unwrap();
    assert_eq!(redemptions, 1);
}

#[tokio::test]
async fn unusable_coupon_is_a_validation_error() {
    let app = TestApp::new().await;
    let m = Marketplace::seed(&app, dec!(40.00), 10).await;
    app.add_to_cart(m.buyer, m.product.id, 1).await;
    app.services
        .coupons
        .create_coupon(CreateCouponInput {
            min_order_amount: Some(dec!(100.00)),
            ..percent_coupon("BIGSPEND", dec!(15))
        })
        .await
        .unwrap();

    for code in ["NOPE", "BIGSPEND"] {
        let result = app
            .services
            .checkout
            .place_order(
                m.buyer,
                PlaceOrderInput {
                    delivery_address_id: m.address.id,
                    coupon_code: Some(code.to_string()),
                    ..PlaceOrderInput::default()
                },
            )
            .await;
        assert_matches!(result, Err(ServiceError::ValidationError(_)));
    }
    assert_eq!(stock_of(&app, m.product.id).await, 10);
}

#[tokio::test]
async fn redeeming_more_points_than_held_fails() {
    let app = TestApp::new().await;
    let m = Marketplace::seed(&app, dec!(40.00), 10).await;
    app.add_to_cart(m.buyer, m.product.id, 1).await;
    app.services
        .points
        .award(m.buyer, 200, "welcome", None)
        .await
        .unwrap();

    let result = app
        .services
        .checkout
        .place_order(
            m.buyer,
            PlaceOrderInput {
                delivery_address_id: m.address.id,
                points_to_redeem: Some(300),
                ..PlaceOrderInput::default()
            },
        )
        .await;
    assert_matches!(
        result,
        Err(ServiceError::InsufficientPoints { requested: 300, available: 200 })
    );
    assert_eq!(app.services.points.available_balance(m.buyer).await.unwrap(), 200);
}

#[tokio::test]
async fn broken_points_ledger_is_an_external_failure() {
    let app = TestApp::new().await;
    let m = Marketplace::seed(&app, dec!(40.00), 10).await;
    app.add_to_cart(m.buyer, m.product.id, 1).await;
    app.state
        .db
        .execute_unprepared("DROP TABLE point_entries")
        .await
        .unwrap();

    let result = app
        .services
        .checkout
        .place_order(
            m.buyer,
            PlaceOrderInput {
                delivery_address_id: m.address.id,
                points_to_redeem: Some(100),
                ..PlaceOrderInput::default()
            },
        )
        .await;
    let err = result.unwrap_err();
    assert_matches!(&err, ServiceError::ExternalServiceError(msg) if msg.starts_with("points ledger"));
    assert_eq!(err.status_code(), axum::http::StatusCode::BAD_GATEWAY);

    // Nothing from the attempt survives
    assert_eq!(stock_of(&app, m.product.id).await, 10);
    assert_eq!(app.services.cart.get(m.buyer).await.unwrap().item_count, 1);
}

#[tokio::test]
async fn discount_above_items_total_is_rejected() {
    let app = TestApp::new().await;
    let m = Marketplace::seed(&app, dec!(4.00), 10).await;
    app.add_to_cart(m.buyer, m.product.id, 1).await;
    app.services
        .points
        .award(m.buyer, 1_000, "welcome", None)
        .await
        .unwrap();

    let result = app
        .services
        .checkout
        .place_order(
            m.buyer,
            PlaceOrderInput {
                delivery_address_id: m.address.id,
                points_to_redeem: Some(1_000),
                ..PlaceOrderInput::default()
            },
        )
        .await;
    assert_matches!(result, Err(ServiceError::ValidationError(_)));
    assert_eq!(app.services.points.available_balance(m.buyer).await.unwrap(), 1_000);
}

#[tokio::test]
async fn platform_fee_follows_configured_rate() {
    let app = TestApp::with_settings(SettlementSettings {
        platform_fee_rate: dec!(0.025),
        ..SettlementSettings::default()
    })
    .await;
    let m = Marketplace::seed(&app, dec!(40.00), 10).await;
    app.add_to_cart(m.buyer, m.product.id, 1).await;

    let placed = app.checkout(m.buyer, m.address.id).await;
    assert_eq!(placed.order.platform_fee, dec!(1.00));
    assert_eq!(placed.order.grand_total, dec!(41.00));
    // Sellers are settled on their own subtotal
    assert_eq!(placed.store_orders[0].store_order.total, dec!(40.00));
}

#[tokio::test]
async fn prescription_lines_keep_their_configuration() {
    let app = TestApp::new().await;
    let m = Marketplace::seed(&app, dec!(40.00), 10).await;
    let prescription = serde_json::json!({ "od": { "sph": -1.25 }, "os": { "sph": -1.5 } });

    app.services
        .cart
        .add_item(
            m.buyer,
            optical_settlement::services::cart::AddCartItemInput {
                frame_size: Some("52-18-140".to_string()),
                prescription: Some(prescription.clone()),
                ..line(m.product.id, 1)
            },
        )
        .await
        .unwrap();

    let placed = app.checkout(m.buyer, m.address.id).await;
    let item = &placed.store_orders[0].items[0];
    assert_eq!(item.frame_size.as_deref(), Some("52-18-140"));
    assert_eq!(item.prescription.as_ref(), Some(&prescription));
}

#[tokio::test]
async fn buyer_and_sellers_are_notified_after_commit() {
    let app = TestApp::new().await;
    let m = Marketplace::seed(&app, dec!(40.00), 10).await;
    let other_seller = Uuid::new_v4();
    let other_store = app.seed_store(other_seller, "Lens Lab").await;
    let lenses = app
        .seed_product(other_store.id, "Blue Light Lenses", dec!(20.00), 5)
        .await;
    app.add_to_cart(m.buyer, m.product.id, 1).await;
    app.add_to_cart(m.buyer, lenses.id, 1).await;

    let placed = app.checkout(m.buyer, m.address.id).await;

    let sent = app.notifier.sent_for(NotificationEvent::OrderPlaced).await;
    assert_eq!(sent.len(), 3);
    assert!(sent.iter().all(|n| n.order_id == placed.order.id));
    assert!(sent.contains_recipient(Recipient::Buyer(m.buyer)));
    assert!(sent.contains_recipient(Recipient::Seller(m.seller)));
    assert!(sent.contains_recipient(Recipient::Seller(other_seller)));
}

#[tokio::test]
async fn failing_notifier_does_not_undo_the_order() {
    let app = TestApp::with_notifier(
        optical_settlement::notifications::RecordingDispatcher::failing(),
    )
    .await;
    let m = Marketplace::seed(&app, dec!(40.00), 10).await;
    app.add_to_cart(m.buyer, m.product.id, 1).await;

    let placed = app.checkout(m.buyer, m.address.id).await;
    let details = app
        .services
        .orders
        .get(m.buyer, placed.order.id)
        .await
        .unwrap();
    assert_eq!(details.store_orders.len(), 1);
}

trait RecipientsExt {
    fn contains_recipient(&self, recipient: Recipient) -> bool;
}

impl RecipientsExt for Vec<optical_settlement::notifications::Notification> {
    fn contains_recipient(&self, recipient: Recipient) -> bool {
        self.iter().any(|n| n.recipient == recipient)
    }
}
