mod common;

use axum::http::{Method, StatusCode};
use common::{Marketplace, TestApp};
use optical_settlement::codes::ScriptedCodeGenerator;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use uuid::Uuid;

fn money(value: &Value) -> Decimal {
    serde_json::from_value(value.clone()).expect("decimal field")
}

fn id(value: &Value) -> Uuid {
    value.as_str().and_then(|s| s.parse().ok()).expect("uuid field")
}

#[tokio::test]
async fn health_reports_database() {
    let app = TestApp::new().await;
    let (status, body) = app.request(Method::GET, "/api/v1/health", None, None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["checks"]["database"], "healthy");
}

#[tokio::test]
async fn acting_user_header_is_required() {
    let app = TestApp::new().await;

    let (status, body) = app.request(Method::GET, "/api/v1/cart", None, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["kind"], "forbidden");

    let request = axum::http::Request::builder()
        .uri("/api/v1/cart")
        .header("x-user-id", "not-a-uuid")
        .body(axum::body::Body::empty())
        .unwrap();
    let response = tower::ServiceExt::oneshot(
        axum::Router::new()
            .nest("/api/v1", optical_settlement::api_v1_routes())
            .with_state(app.state.clone()),
        request,
    )
    .await
    .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn order_settles_end_to_end_over_http() {
    let app = TestApp::with_codes(
        ScriptedCodeGenerator::new().with_delivery_codes([975_310]),
    )
    .await;
    let m = Marketplace::seed(&app, dec!(90.00), 4).await;
    let buyer = Some(m.buyer);
    let seller = Some(m.seller);

    let (status, cart) = app
        .request(
            Method::POST,
            "/api/v1/cart/items",
            buyer,
            Some(json!({
                "product_id": m.product.id,
                "quantity": 2,
                "frame_size": "50-20-145",
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cart["item_count"], 2);

    let (status, placed) = app
        .request(
            Method::POST,
            "/api/v1/checkout",
            buyer,
            Some(json!({ "delivery_address_id": m.address.id })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(money(&placed["grand_total"]), dec!(180.00));
    let order_id = id(&placed["id"]);
    let store_order_id = id(&placed["store_orders"][0]["id"]);
    assert!(placed["store_orders"][0].get("delivery_code").is_none());

    let (status, accepted) = app
        .request(
            Method::POST,
            &format!("/api/v1/store-orders/{store_order_id}/accept"),
            seller,
            Some(json!({ "delivery_fee": "6.00" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(accepted["status"], "accepted");
    assert_eq!(money(&accepted["total"]), dec!(186.00));

    let (status, _) = app
        .request(
            Method::POST,
            "/api/v1/wallet/top-up",
            buyer,
            Some(json!({ "amount": "200.00" })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, receipt) = app
        .request(
            Method::POST,
            &format!("/api/v1/store-orders/{store_order_id}/pay"),
            buyer,
            Some(json!({ "method": "wallet" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(receipt["store_order"]["status"], "processing");
    assert_eq!(receipt["escrow"]["status"], "locked");

    let (status, body) = app
        .request(
            Method::POST,
            &format!("/api/v1/store-orders/{store_order_id}/pay"),
            buyer,
            Some(json!({ "method": "wallet" })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["current_status"], "processing");

    let (status, _) = app
        .request(
            Method::POST,
            &format!("/api/v1/store-orders/{store_order_id}/out-for-delivery"),
            seller,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    // The buyer reads the code from their order and hands it over
    let (status, order) = app
        .request(Method::GET, &format!("/api/v1/orders/{order_id}"), buyer, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(order["payment_status"], "paid");
    let code = order["store_orders"][0]["delivery_code"]
        .as_str()
        .expect("delivery code for buyer")
        .to_string();
    assert_eq!(code, "975310");

    let (status, body) = app
        .request(
            Method::POST,
            &format!("/api/v1/store-orders/{store_order_id}/deliver"),
            seller,
            Some(json!({ "code": "000001" })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "conflict");

    let (status, delivered) = app
        .request(
            Method::POST,
            &format!("/api/v1/store-orders/{store_order_id}/deliver"),
            seller,
            Some(json!({ "code": code })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(delivered["status"], "delivered");

    let (status, escrow) = app
        .request(
            Method::GET,
            &format!("/api/v1/store-orders/{store_order_id}/escrow"),
            buyer,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(escrow["status"], "released");
    assert_eq!(money(&escrow["amount"]), dec!(180.00));
    assert_eq!(money(&escrow["shipping_fee"]), dec!(6.00));

    let (status, seller_orders) = app
        .request(
            Method::GET,
            &format!("/api/v1/stores/{}/orders", m.store.id),
            seller,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(seller_orders.as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn strangers_cannot_read_escrow_or_orders() {
    let app = TestApp::new().await;
    let m = Marketplace::seed(&app, dec!(30.00), 4).await;
    app.add_to_cart(m.buyer, m.product.id, 1).await;
    let placed = app.checkout(m.buyer, m.address.id).await;
    let stranger = Some(Uuid::new_v4());

    let (status, _) = app
        .request(
            Method::GET,
            &format!("/api/v1/orders/{}", placed.order.id),
            stranger,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = app
        .request(
            Method::GET,
            &format!(
                "/api/v1/store-orders/{}/escrow",
                placed.store_orders[0].store_order.id
            ),
            stranger,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = app
        .request(
            Method::GET,
            &format!("/api/v1/stores/{}/orders", m.store.id),
            stranger,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn checkout_errors_map_to_status_codes() {
    let app = TestApp::new().await;
    let m = Marketplace::seed(&app, dec!(30.00), 1).await;
    let buyer = Some(m.buyer);

    let (status, body) = app
        .request(
            Method::POST,
            "/api/v1/checkout",
            buyer,
            Some(json!({ "delivery_address_id": m.address.id })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "validation");

    let (status, body) = app
        .request(
            Method::POST,
            "/api/v1/cart/items",
            buyer,
            Some(json!({ "product_id": m.product.id, "quantity": 2 })),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["kind"], "insufficient_resource");
}

#[tokio::test]
async fn addresses_and_points_endpoints() {
    let app = TestApp::new().await;
    let user = Some(Uuid::new_v4());

    let (status, created) = app
        .request(
            Method::POST,
            "/api/v1/addresses",
            user,
            Some(json!({
                "recipient_name": "Tolu",
                "phone": "+2348011111111",
                "line_one": "3 Optic Close",
                "line_two": null,
                "city": "Ibadan",
                "region": "Oyo",
                "postal_code": "200001",
                "country": "NG"
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, listed) = app.request(Method::GET, "/api/v1/addresses", user, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().map(Vec::len), Some(1));

    let (status, _) = app
        .request(
            Method::DELETE,
            &format!("/api/v1/addresses/{}", id(&created["id"])),
            user,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, points) = app
        .request(Method::GET, "/api/v1/wallet/points", user, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(points["available"], 0);
}

#[tokio::test]
async fn coupon_preview_does_not_use_the_coupon() {
    let app = TestApp::new().await;
    app.services
        .coupons
        .create_coupon(optical_settlement::services::coupons::CreateCouponInput {
            code: "LENS20".to_string(),
            discount_type: optical_settlement::entities::coupon::DiscountType::Percent,
            value: dec!(20),
            min_order_amount: None,
            max_discount: Some(dec!(15.00)),
            usage_limit: Some(1),
            per_user_limit: None,
            starts_at: None,
            expires_at: None,
        })
        .await
        .unwrap();
    let user = Some(Uuid::new_v4());

    for _ in 0..2 {
        let (status, preview) = app
            .request(
                Method::POST,
                "/api/v1/checkout/coupon-preview",
                user,
                Some(json!({ "code": "lens20", "subtotal": "100.00" })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(preview["valid"], true);
        assert_eq!(money(&preview["discount_amount"]), dec!(15.00));
    }
}
