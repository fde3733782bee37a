pub mod addresses;
pub mod cart;
pub mod checkout;
pub mod common;
pub mod orders;
pub mod store_orders;
pub mod wallet;

use std::sync::Arc;

use crate::{
    clock::Clock,
    codes::CodeGenerator,
    config::SettlementSettings,
    db::DbPool,
    events::EventSender,
    notifications::NotificationDispatcher,
    services::{
        addresses::AddressService, cart::CartService, catalog::CatalogService,
        checkout::CheckoutService, coupons::CouponService, escrow::EscrowService,
        orders::OrderService, points::PointsService, store_orders::StoreOrderService,
        wallet::WalletService,
    },
};

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub catalog: Arc<CatalogService>,
    pub addresses: Arc<AddressService>,
    pub coupons: Arc<CouponService>,
    pub points: Arc<PointsService>,
    pub wallet: Arc<WalletService>,
    pub cart: Arc<CartService>,
    pub checkout: Arc<CheckoutService>,
    pub escrow: Arc<EscrowService>,
    pub orders: Arc<OrderService>,
    pub store_orders: Arc<StoreOrderService>,
}

impl AppServices {
    /// Wires every service over one pool, clock, code generator and dispatcher.
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
        clock: Arc<dyn Clock>,
        codes: Arc<dyn CodeGenerator>,
        notifier: Arc<dyn NotificationDispatcher>,
        settings: SettlementSettings,
    ) -> Self {
        let catalog = Arc::new(CatalogService::new(db_pool.clone(), clock.clone()));
        let addresses = Arc::new(AddressService::new(db_pool.clone(), clock.clone()));
        let coupons = Arc::new(CouponService::new(db_pool.clone(), clock.clone()));
        let points = Arc::new(PointsService::new(
            db_pool.clone(),
            clock.clone(),
            settings.points_per_currency_unit,
        ));
        let wallet = Arc::new(WalletService::new(
            db_pool.clone(),
            event_sender.clone(),
            clock.clone(),
        ));
        let cart = Arc::new(CartService::new(
            db_pool.clone(),
            event_sender.clone(),
            catalog.clone(),
            clock.clone(),
        ));
        let escrow = Arc::new(EscrowService::new(db_pool.clone(), clock.clone()));
        let orders = Arc::new(OrderService::new(
            db_pool.clone(),
            event_sender.clone(),
            clock.clone(),
        ));
        let checkout = Arc::new(CheckoutService::new(
            db_pool.clone(),
            event_sender.clone(),
            clock.clone(),
            codes,
            catalog.clone(),
            addresses.clone(),
            coupons.clone(),
            points.clone(),
            cart.clone(),
            notifier.clone(),
            settings.clone(),
        ));
        let store_orders = Arc::new(StoreOrderService::new(
            db_pool,
            event_sender,
            clock,
            catalog.clone(),
            escrow.clone(),
            wallet.clone(),
            orders.clone(),
            notifier,
            settings.max_delivery_code_attempts,
        ));

        Self {
            catalog,
            addresses,
            coupons,
            points,
            wallet,
            cart,
            checkout,
            escrow,
            orders,
            store_orders,
        }
    }
}
