//! Integration events exchanged between services.
//!
//! Field names are the wire names (snake_case JSON). Counts are unsigned, so a
//! negative quantity or inventory count from a foreign producer fails to decode.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use storefront_core::{OrderId, ProductId, UserId};

use crate::event::{DomainEvent, Event};
use crate::topic::Topic;

/// A user account was created in the user service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRegistered {
    pub user_id: UserId,
    pub email: String,
    pub phone_no: String,
}

/// Contact details of an existing user changed.
///
/// Absent fields were not part of the change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfileUpdated {
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_no: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// A product was added to the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductCreated {
    pub product_id: ProductId,
    pub name: String,
    pub price: f64,
    pub inventory_count: u32,
}

/// The authoritative stock level of a product changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductInventoryUpdated {
    pub product_id: ProductId,
    pub inventory_count: u32,
}

/// One requested line of a placed order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub product_id: ProductId,
    pub quantity: u32,
}

/// An order was committed by the order service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub items: Vec<OrderLine>,
}

macro_rules! impl_event {
    ($t:ident, $topic:expr) => {
        impl Event for $t {
            const NAME: &'static str = stringify!($t);
            const TOPIC: Topic = $topic;

            fn into_domain(self) -> DomainEvent {
                DomainEvent::$t(self)
            }

            fn from_domain(event: DomainEvent) -> Option<Self> {
                match event {
                    DomainEvent::$t(e) => Some(e),
                    _ => None,
                }
            }
        }
    };
}

impl_event!(UserRegistered, Topic::UserRegistered);
impl_event!(UserProfileUpdated, Topic::UserProfileUpdated);
impl_event!(ProductCreated, Topic::ProductCreated);
impl_event!(ProductInventoryUpdated, Topic::ProductInventoryUpdated);
impl_event!(OrderPlaced, Topic::OrderPlaced);
