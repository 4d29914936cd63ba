//! sea-orm entities.
//!
//! Rows reference each other by id only. The single navigable relation is
//! `order` → `order_product`, because an order owns its lines.

pub mod cart_item;
pub mod email_verification;
pub mod inventory_reservation;
pub mod member;
pub mod order;
pub mod order_product;
pub mod payment_history;
pub mod payment_refund;
pub mod product;
pub mod sku;
