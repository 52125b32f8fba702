//! `storefront-core` — identifiers and the error taxonomy shared by every service.
//!
//! This crate is **pure domain** (no IO, no transport, no storage).

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{OrderId, ProductId, UserId};
