//! Strongly-typed identifiers used across services.
//!
//! Identifiers travel on the wire as plain strings (`"P100"`, `"u-42"`), so the
//! newtypes wrap a `String` and only reject blank values.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Identifier of a user (owned by the user service).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

/// Identifier of a product (owned by the product service).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductId(String);

/// Identifier of an order (owned by the order service).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(String);

macro_rules! impl_string_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Wrap a raw identifier, rejecting blank values.
            pub fn parse(raw: impl Into<String>) -> Result<Self, DomainError> {
                let raw = raw.into();
                if raw.trim().is_empty() {
                    return Err(DomainError::invalid_id(format!("{}: must not be blank", $name)));
                }
                Ok(Self(raw))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }

            /// Whether the identifier carries a usable value.
            ///
            /// Values deserialized from the wire bypass `parse`, so handlers
            /// check this before trusting a foreign id.
            pub fn is_valid(&self) -> bool {
                !self.0.trim().is_empty()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

impl_string_newtype!(UserId, "UserId");
impl_string_newtype!(ProductId, "ProductId");
impl_string_newtype!(OrderId, "OrderId");

impl OrderId {
    /// Allocate a fresh order identifier.
    ///
    /// Uses UUIDv7 so identifiers sort by creation time.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_ids_are_rejected() {
        let err = ProductId::parse("   ").unwrap_err();
        match err {
            DomainError::InvalidId(msg) => assert!(msg.contains("ProductId")),
            _ => panic!("Expected InvalidId error"),
        }
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let id = UserId::parse("u-1").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"u-1\"");

        let back: UserId = serde_json::from_str("\"u-1\"").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn generated_order_ids_are_unique_and_time_ordered() {
        let a = OrderId::generate();
        let b = OrderId::generate();
        assert_ne!(a, b);
        assert!(a.as_str() < b.as_str());
    }

    #[test]
    fn deserialized_blank_id_is_flagged_invalid() {
        let id: ProductId = serde_json::from_str("\"\"").unwrap();
        assert!(!id.is_valid());
    }
}
