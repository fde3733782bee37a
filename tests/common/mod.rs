#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use chrono::{DateTime, TimeZone, Utc};
use optical_settlement::{
    api_v1_routes,
    clock::FixedClock,
    codes::ScriptedCodeGenerator,
    config::{AppConfig, SettlementSettings},
    db::{self, DbConfig},
    entities::{address, product, store},
    events::{self, EventSender},
    handlers::{common::USER_ID_HEADER, AppServices},
    notifications::RecordingDispatcher,
    services::{
        addresses::CreateAddressInput,
        cart::{AddCartItemInput, CartView},
        catalog::{CreateProductInput, CreateStoreInput},
        checkout::{PlaceOrderInput, PlacedOrder},
        store_orders::AcceptInput,
    },
    AppState,
};
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

pub fn test_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap()
}

/// Application wired over a single-connection in-memory SQLite database,
/// with a pinned clock, scripted codes and a recording notifier.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub services: AppServices,
    pub clock: Arc<FixedClock>,
    pub notifier: Arc<RecordingDispatcher>,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::build(
            SettlementSettings::default(),
            ScriptedCodeGenerator::new(),
            RecordingDispatcher::new(),
        )
        .await
    }

    pub async fn with_settings(settings: SettlementSettings) -> Self {
        Self::build(settings, ScriptedCodeGenerator::new(), RecordingDispatcher::new()).await
    }

    pub async fn with_codes(codes: ScriptedCodeGenerator) -> Self {
        Self::build(SettlementSettings::default(), codes, RecordingDispatcher::new()).await
    }

    pub async fn with_notifier(notifier: RecordingDispatcher) -> Self {
        Self::build(SettlementSettings::default(), ScriptedCodeGenerator::new(), notifier).await
    }

    pub async fn build(
        settings: SettlementSettings,
        codes: ScriptedCodeGenerator,
        notifier: RecordingDispatcher,
    ) -> Self {
        // One connection: every pooled handle sees the same in-memory database
        let pool = db::establish_connection_with_config(&DbConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            min_connections: 1,
            ..DbConfig::default()
        })
        .await
        .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");
        let db = Arc::new(pool);

        let (tx, rx) = mpsc::channel(1024);
        let event_sender = Arc::new(EventSender::new(tx));
        let event_task = tokio::spawn(events::process_events(rx));

        let clock = Arc::new(FixedClock::new(test_start()));
        let notifier = Arc::new(notifier);
        let services = AppServices::new(
            db.clone(),
            event_sender.clone(),
            clock.clone(),
            Arc::new(codes),
            notifier.clone(),
            settings,
        );

        let state = AppState {
            db,
            config: AppConfig::new(
                "sqlite::memory:".to_string(),
                "127.0.0.1".to_string(),
                18_080,
                "test".to_string(),
            ),
            event_sender,
            services: services.clone(),
        };
        let router = Router::new()
            .nest("/api/v1", api_v1_routes())
            .with_state(state.clone());

        Self {
            router,
            state,
            services,
            clock,
            notifier,
            _event_task: event_task,
        }
    }

    /// Sends a request as `user`, returning the status and the JSON body
    /// (`Value::Null` when the body is empty).
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        user: Option<Uuid>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header(USER_ID_HEADER, user.to_string());
        }
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("request");

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router response");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body bytes");
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("json body")
        };
        (status, json)
    }

    pub async fn seed_store(&self, owner_id: Uuid, name: &str) -> store::Model {
        self.services
            .catalog
            .create_store(CreateStoreInput {
                owner_id,
                name: name.to_string(),
            })
            .await
            .expect("seed store")
    }

    pub async fn seed_product(
        &self,
        store_id: Uuid,
        name: &str,
        price: Decimal,
        stock_quantity: i32,
    ) -> product::Model {
        self.services
            .catalog
            .create_product(CreateProductInput {
                store_id,
                name: name.to_string(),
                sku: format!("SKU-{}", &Uuid::new_v4().simple().to_string()[..8]),
                price,
                stock_quantity,
                images: Some(serde_json::json!(["front.jpg"])),
            })
            .await
            .expect("seed product")
    }

    pub async fn seed_address(&self, user_id: Uuid) -> address::Model {
        self.services
            .addresses
            .create(
                user_id,
                CreateAddressInput {
                    recipient_name: "Ada Buyer".to_string(),
                    phone: "+2348000000000".to_string(),
                    line_one: "12 Lens Street".to_string(),
                    line_two: None,
                    city: "Lagos".to_string(),
                    region: "Lagos".to_string(),
                    postal_code: "100001".to_string(),
                    country: "NG".to_string(),
                },
            )
            .await
            .expect("seed address")
    }

    pub async fn stock_of(&self, product_id: Uuid) -> i32 {
        self.services
            .catalog
            .lookup(product_id)
            .await
            .expect("product lookup")
            .stock_quantity
    }

    pub async fn add_to_cart(&self, buyer_id: Uuid, product_id: Uuid, quantity: i32) -> CartView {
        self.services
            .cart
            .add_item(buyer_id, line(product_id, quantity))
            .await
            .expect("add to cart")
    }

    pub async fn checkout(&self, buyer_id: Uuid, address_id: Uuid) -> PlacedOrder {
        self.services
            .checkout
            .place_order(
                buyer_id,
                PlaceOrderInput {
                    delivery_address_id: address_id,
                    ..PlaceOrderInput::default()
                },
            )
            .await
            .expect("checkout")
    }

    pub async fn accept(&self, seller_id: Uuid, store_order_id: Uuid, fee: Decimal) {
        self.services
            .store_orders
            .accept(
                seller_id,
                store_order_id,
                AcceptInput {
                    delivery_fee: fee,
                    estimated_delivery_at: None,
                },
            )
            .await
            .expect("accept");
    }
}

pub fn line(product_id: Uuid, quantity: i32) -> AddCartItemInput {
    AddCartItemInput {
        product_id,
        quantity,
        variant_id: None,
        frame_size: None,
        prescription: None,
        lens_config: None,
    }
}

/// A buyer with an address plus one seller store holding one product.
pub struct Marketplace {
    pub buyer: Uuid,
    pub address: address::Model,
    pub seller: Uuid,
    pub store: store::Model,
    pub product: product::Model,
}

impl Marketplace {
    pub async fn seed(app: &TestApp, price: Decimal, stock: i32) -> Self {
        let buyer = Uuid::new_v4();
        let seller = Uuid::new_v4();
        let address = app.seed_address(buyer).await;
        let store = app.seed_store(seller, "Clear View Optics").await;
        let product = app.seed_product(store.id, "Round Acetate Frame", price, stock).await;
        Self {
            buyer,
            address,
            seller,
            store,
            product,
        }
    }
}
