use tracing::debug;

use storefront_events::{EventHandler, HandlerError, UserProfileUpdated, UserRegistered};

use super::store_failure;
use crate::store::UserReplicaStore;

/// Keeps the order service's user replica current.
#[derive(Debug, Clone)]
pub struct UserReplicaHandler<S> {
    store: S,
}

impl<S> UserReplicaHandler<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: UserReplicaStore + 'static> EventHandler<UserRegistered> for UserReplicaHandler<S> {
    fn handle(&self, event: UserRegistered) -> Result<(), HandlerError> {
        if !event.user_id.is_valid() {
            return Err(HandlerError::rejected("UserRegistered without user id"));
        }
        self.store.upsert_user(&event).map_err(store_failure)?;
        debug!(user_id = %event.user_id, "user replica upserted");
        Ok(())
    }
}

impl<S: UserReplicaStore + 'static> EventHandler<UserProfileUpdated> for UserReplicaHandler<S> {
    fn handle(&self, event: UserProfileUpdated) -> Result<(), HandlerError> {
        if !event.user_id.is_valid() {
            return Err(HandlerError::rejected("UserProfileUpdated without user id"));
        }
        self.store.apply_profile_update(&event).map_err(store_failure)?;
        debug!(user_id = %event.user_id, "user profile applied");
        Ok(())
    }
}
