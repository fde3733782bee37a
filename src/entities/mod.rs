pub mod address;
pub mod cart;
pub mod cart_item;
pub mod coupon;
pub mod coupon_redemption;
pub mod escrow;
pub mod order;
pub mod order_item;
pub mod point_entry;
pub mod product;
pub mod store;
pub mod store_order;
pub mod wallet;
pub mod wallet_transaction;

// Re-export the types callers pattern-match on
pub use escrow::EscrowStatus;
pub use order::PaymentStatus;
pub use store_order::StoreOrderStatus;
pub use wallet::BalanceKind;
pub use wallet_transaction::{TransactionStatus, TransactionType};
