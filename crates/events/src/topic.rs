//! Topic names on the message bus.
//!
//! Each topic carries exactly one event kind.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topic {
    UserRegistered,
    UserProfileUpdated,
    ProductCreated,
    ProductInventoryUpdated,
    OrderPlaced,
}

impl Topic {
    pub const ALL: [Topic; 5] = [
        Topic::UserRegistered,
        Topic::UserProfileUpdated,
        Topic::ProductCreated,
        Topic::ProductInventoryUpdated,
        Topic::OrderPlaced,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::UserRegistered => "user-registered",
            Topic::UserProfileUpdated => "user-profile-updated",
            Topic::ProductCreated => "product-created",
            Topic::ProductInventoryUpdated => "product-inventory-updated",
            Topic::OrderPlaced => "order-placed",
        }
    }
}

impl core::fmt::Display for Topic {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown topic: {0}")]
pub struct UnknownTopic(pub String);

impl FromStr for Topic {
    type Err = UnknownTopic;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownTopic(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_names_parse_back() {
        for topic in Topic::ALL {
            assert_eq!(topic.as_str().parse::<Topic>().unwrap(), topic);
        }
        assert!("inventory-updated".parse::<Topic>().is_err());
    }

    #[test]
    fn serde_uses_wire_names() {
        let json = serde_json::to_string(&Topic::ProductInventoryUpdated).unwrap();
        assert_eq!(json, "\"product-inventory-updated\"");
    }
}
