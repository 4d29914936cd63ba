pub mod cart;
pub mod catalog;
pub mod gateway;
pub mod inventory;
pub mod mail;
pub mod members;
pub mod orders;
pub mod payments;
