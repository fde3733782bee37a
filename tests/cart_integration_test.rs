mod common;

use assert_matches::assert_matches;
use common::{line, Marketplace, TestApp};
use optical_settlement::{errors::ServiceError, services::cart::AddCartItemInput};
use rust_decimal_macros::dec;
use serde_json::json;
use uuid::Uuid;

#[tokio::test]
async fn same_configuration_merges_into_one_line() {
    let app = TestApp::new().await;
    let m = Marketplace::seed(&app, dec!(40.00), 10).await;
    let lens = json!({ "coating": "anti_glare", "index": 1.67 });

    let with_lens = |quantity| AddCartItemInput {
        lens_config: Some(lens.clone()),
        ..line(m.product.id, quantity)
    };

    app.services.cart.add_item(m.buyer, with_lens(1)).await.unwrap();
    let cart = app.services.cart.add_item(m.buyer, with_lens(2)).await.unwrap();

    assert_eq!(cart.stores.len(), 1);
    assert_eq!(cart.stores[0].items.len(), 1);
    assert_eq!(cart.stores[0].items[0].quantity, 3);
    assert_eq!(cart.item_count, 3);
    assert_eq!(cart.subtotal, dec!(120.00));
}

#[tokio::test]
async fn different_prescriptions_stay_separate() {
    let app = TestApp::new().await;
    let m = Marketplace::seed(&app, dec!(40.00), 10).await;

    app.services
        .cart
        .add_item(
            m.buyer,
            AddCartItemInput {
                prescription: Some(json!({ "od": { "sph": -1.0 } })),
                ..line(m.product.id, 1)
            },
        )
        .await
        .unwrap();
    let cart = app
        .services
        .cart
        .add_item(
            m.buyer,
            AddCartItemInput {
                prescription: Some(json!({ "od": { "sph": -2.0 } })),
                ..line(m.product.id, 1)
            },
        )
        .await
        .unwrap();

    assert_eq!(cart.stores[0].items.len(), 2);
    assert_eq!(cart.item_count, 2);
}

#[tokio::test]
async fn lines_are_grouped_by_store() {
    let app = TestApp::new().await;
    let m = Marketplace::seed(&app, dec!(40.00), 10).await;
    let other_store = app.seed_store(Uuid::new_v4(), "Lens Lab").await;
    let lenses = app
        .seed_product(other_store.id, "Blue Light Lenses", dec!(12.50), 10)
        .await;
    let case = app.seed_product(m.store.id, "Hard Case", dec!(5.00), 10).await;

    app.add_to_cart(m.buyer, m.product.id, 1).await;
    app.add_to_cart(m.buyer, lenses.id, 2).await;
    let cart = app.add_to_cart(m.buyer, case.id, 1).await;

    assert_eq!(cart.stores.len(), 2);
    let frames = cart.stores.iter().find(|g| g.store_id == m.store.id).unwrap();
    assert_eq!(frames.items.len(), 2);
    assert_eq!(frames.subtotal, dec!(45.00));
    let lens_group = cart
        .stores
        .iter()
        .find(|g| g.store_id == other_store.id)
        .unwrap();
    assert_eq!(lens_group.subtotal, dec!(25.00));
    assert_eq!(cart.subtotal, dec!(70.00));
}

#[tokio::test]
async fn adding_beyond_stock_is_refused() {
    let app = TestApp::new().await;
    let m = Marketplace::seed(&app, dec!(40.00), 3).await;
    app.add_to_cart(m.buyer, m.product.id, 2).await;

    let result = app
        .services
        .cart
        .add_item(m.buyer, line(m.product.id, 2))
        .await;
    assert_matches!(
        result,
        Err(ServiceError::InsufficientStock { requested: 4, available: 3, .. })
    );
    assert_eq!(app.services.cart.get(m.buyer).await.unwrap().item_count, 2);
}

#[tokio::test]
async fn inactive_and_missing_products_cannot_be_added() {
    let app = TestApp::new().await;
    let m = Marketplace::seed(&app, dec!(40.00), 3).await;
    app.services
        .catalog
        .set_active(m.product.id, false)
        .await
        .unwrap();

    let inactive = app
        .services
        .cart
        .add_item(m.buyer, line(m.product.id, 1))
        .await;
    assert_matches!(inactive, Err(ServiceError::ProductUnavailable { .. }));

    let missing = app
        .services
        .cart
        .add_item(m.buyer, line(Uuid::new_v4(), 1))
        .await;
    assert_matches!(missing, Err(ServiceError::NotFound(_)));
}

#[tokio::test]
async fn zero_quantity_is_a_validation_error() {
    let app = TestApp::new().await;
    let m = Marketplace::seed(&app, dec!(40.00), 3).await;

    let result = app
        .services
        .cart
        .add_item(m.buyer, line(m.product.id, 0))
        .await;
    assert_matches!(result, Err(ServiceError::ValidationError(_)));
}

#[tokio::test]
async fn update_remove_and_clear() {
    let app = TestApp::new().await;
    let m = Marketplace::seed(&app, dec!(40.00), 10).await;
    let case = app.seed_product(m.store.id, "Hard Case", dec!(5.00), 10).await;
    app.add_to_cart(m.buyer, m.product.id, 1).await;
    let cart = app.add_to_cart(m.buyer, case.id, 1).await;
    let frame_line = cart.stores[0]
        .items
        .iter()
        .find(|i| i.product_id == m.product.id)
        .unwrap()
        .id;
    let case_line = cart.stores[0]
        .items
        .iter()
        .find(|i| i.product_id == case.id)
        .unwrap()
        .id;

    let cart = app
        .services
        .cart
        .update_item(m.buyer, frame_line, 4)
        .await
        .unwrap();
    assert_eq!(cart.item_count, 5);

    let too_many = app.services.cart.update_item(m.buyer, frame_line, 11).await;
    assert_matches!(too_many, Err(ServiceError::InsufficientStock { .. }));

    let cart = app.services.cart.remove_item(m.buyer, case_line).await.unwrap();
    assert_eq!(cart.item_count, 4);

    app.services.cart.clear(m.buyer).await.unwrap();
    assert!(app.services.cart.get(m.buyer).await.unwrap().is_empty());
}

#[tokio::test]
async fn lines_of_another_buyer_are_not_found() {
    let app = TestApp::new().await;
    let m = Marketplace::seed(&app, dec!(40.00), 10).await;
    let cart = app.add_to_cart(m.buyer, m.product.id, 1).await;
    let line_id = cart.stores[0].items[0].id;
    let intruder = Uuid::new_v4();

    let update = app.services.cart.update_item(intruder, line_id, 2).await;
    assert_matches!(update, Err(ServiceError::NotFound(_)));
    let remove = app.services.cart.remove_item(intruder, line_id).await;
    assert_matches!(remove, Err(ServiceError::NotFound(_)));

    assert_eq!(app.services.cart.get(m.buyer).await.unwrap().item_count, 1);
}
