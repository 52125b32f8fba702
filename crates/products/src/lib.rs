//! Products domain module (authoritative catalog and stock rules).
//!
//! Pure, deterministic logic: no IO, no transport, no storage.

pub mod product;
pub mod stock;

pub use product::{CreateProduct, Product};
pub use stock::{ConcurrencyError, DeductionReport, LineOutcome};
