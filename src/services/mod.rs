// Settlement core
pub mod allocation;
pub mod cart;
pub mod checkout;
pub mod escrow;
pub mod orders;
pub mod store_orders;
pub mod transitions;

// Collaborators
pub mod addresses;
pub mod catalog;
pub mod coupons;
pub mod points;
pub mod wallet;
