//! Event handlers wiring decoded events to the service stores.
//!
//! Store failures map onto `HandlerError`: transient ones (`Unavailable`,
//! `MissingReference`) are retried, everything else is rejected.

use storefront_events::HandlerError;

use crate::store::StoreError;

pub mod inventory_sync;
pub mod product_replica;
pub mod user_replica;

pub use inventory_sync::InventorySyncHandler;
pub use product_replica::ProductReplicaHandler;
pub use user_replica::UserReplicaHandler;

pub(crate) fn store_failure(err: StoreError) -> HandlerError {
    if err.is_transient() {
        HandlerError::retryable(err.to_string())
    } else {
        HandlerError::rejected(err.to_string())
    }
}
