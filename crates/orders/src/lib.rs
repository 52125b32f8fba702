//! Orders domain module.
//!
//! Order construction, pricing and status rules, implemented as deterministic
//! domain logic (no IO, no HTTP, no storage).

pub mod order;

pub use order::{Order, OrderItem, OrderStatus, PlaceOrder, RequestedLine};
