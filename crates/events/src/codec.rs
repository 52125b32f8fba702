//! Envelope decoding against a per-service registry.
//!
//! A service declares, once at startup, which event kinds it consumes. The
//! resulting `EventRegistry` is immutable and shared by reference with every
//! subscription worker; there is no process-wide registry.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::envelope::EventEnvelope;
use crate::event::{DomainEvent, Event};
use crate::integration::{
    OrderPlaced, ProductCreated, ProductInventoryUpdated, UserProfileUpdated, UserRegistered,
};
use crate::topic::Topic;

/// Terminal failure for a single message. The subscription keeps running.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The consuming service never registered this topic.
    #[error("topic {0} is not registered for this service")]
    UnregisteredTopic(Topic),

    /// The envelope names an event other than the one bound to its topic.
    #[error("topic {topic} expects {expected}, got {found}")]
    UnexpectedEventName {
        topic: Topic,
        expected: &'static str,
        found: String,
    },

    /// The event name is not part of the known union.
    #[error("unknown event name: {0}")]
    UnknownEventName(String),

    /// The payload does not match the event's shape.
    #[error("malformed {event_name} payload: {reason}")]
    MalformedPayload {
        event_name: &'static str,
        reason: String,
    },

    /// Decoded successfully, but into a different kind than the subscriber expects.
    #[error("expected {expected}, decoded {found}")]
    KindMismatch {
        expected: &'static str,
        found: &'static str,
    },
}

/// Immutable `topic -> event name` bindings for one service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventRegistry {
    bindings: BTreeMap<Topic, &'static str>,
}

/// Builder used during startup; consumed by `build`.
#[derive(Debug, Default)]
pub struct EventRegistryBuilder {
    bindings: BTreeMap<Topic, &'static str>,
}

impl EventRegistryBuilder {
    /// Bind `E`'s topic to `E`. Registering the same kind twice is harmless.
    pub fn register<E: Event>(mut self) -> Self {
        self.bindings.insert(E::TOPIC, E::NAME);
        self
    }

    pub fn build(self) -> EventRegistry {
        EventRegistry {
            bindings: self.bindings,
        }
    }
}

impl EventRegistry {
    pub fn builder() -> EventRegistryBuilder {
        EventRegistryBuilder::default()
    }

    pub fn expected_event(&self, topic: Topic) -> Option<&'static str> {
        self.bindings.get(&topic).copied()
    }

    pub fn is_registered<E: Event>(&self) -> bool {
        self.expected_event(E::TOPIC) == Some(E::NAME)
    }

    pub fn topics(&self) -> impl Iterator<Item = Topic> + '_ {
        self.bindings.keys().copied()
    }

    /// Decode an envelope into the union.
    pub fn decode(&self, envelope: &EventEnvelope) -> Result<DomainEvent, DecodeError> {
        let topic = envelope.topic();
        let expected = self
            .expected_event(topic)
            .ok_or(DecodeError::UnregisteredTopic(topic))?;

        if envelope.event_name() != expected {
            return Err(DecodeError::UnexpectedEventName {
                topic,
                expected,
                found: envelope.event_name().to_string(),
            });
        }

        let payload = envelope.payload();
        match envelope.event_name() {
            "UserRegistered" => parse::<UserRegistered>(payload).map(DomainEvent::UserRegistered),
            "UserProfileUpdated" => {
                parse::<UserProfileUpdated>(payload).map(DomainEvent::UserProfileUpdated)
            }
            "ProductCreated" => parse::<ProductCreated>(payload).map(DomainEvent::ProductCreated),
            "ProductInventoryUpdated" => {
                parse::<ProductInventoryUpdated>(payload).map(DomainEvent::ProductInventoryUpdated)
            }
            "OrderPlaced" => parse::<OrderPlaced>(payload).map(DomainEvent::OrderPlaced),
            other => Err(DecodeError::UnknownEventName(other.to_string())),
        }
    }

    /// Decode straight into the subscriber's concrete type.
    pub fn decode_as<E: Event>(&self, envelope: &EventEnvelope) -> Result<E, DecodeError> {
        let event = self.decode(envelope)?;
        let found = event.name();
        E::from_domain(event).ok_or(DecodeError::KindMismatch {
            expected: E::NAME,
            found,
        })
    }
}

fn parse<E: Event + DeserializeOwned>(payload: &[u8]) -> Result<E, DecodeError> {
    serde_json::from_slice(payload).map_err(|e| DecodeError::MalformedPayload {
        event_name: E::NAME,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use storefront_core::{OrderId, ProductId, UserId};
    use uuid::Uuid;

    use crate::integration::OrderLine;

    fn order_service_registry() -> EventRegistry {
        EventRegistry::builder()
            .register::<UserRegistered>()
            .register::<ProductCreated>()
            .register::<ProductInventoryUpdated>()
            .build()
    }

    fn sample_order() -> OrderPlaced {
        OrderPlaced {
            order_id: OrderId::parse("o-1").unwrap(),
            user_id: UserId::parse("u-1").unwrap(),
            items: vec![OrderLine {
                product_id: ProductId::parse("P100").unwrap(),
                quantity: 3,
            }],
        }
    }

    #[test]
    fn decodes_registered_event() {
        let registry = EventRegistry::builder().register::<OrderPlaced>().build();
        let envelope = EventEnvelope::from_event(Uuid::now_v7(), &sample_order()).unwrap();

        let decoded: OrderPlaced = registry.decode_as(&envelope).unwrap();
        assert_eq!(decoded, sample_order());
    }

    #[test]
    fn unregistered_topic_is_a_decode_error() {
        let registry = order_service_registry();
        let envelope = EventEnvelope::from_event(Uuid::now_v7(), &sample_order()).unwrap();

        assert_eq!(
            registry.decode(&envelope),
            Err(DecodeError::UnregisteredTopic(Topic::OrderPlaced))
        );
    }

    #[test]
    fn mismatched_event_name_is_rejected() {
        let registry = order_service_registry();
        let envelope = EventEnvelope::new(
            Uuid::now_v7(),
            Topic::ProductCreated,
            "ProductDeleted",
            b"{}".to_vec(),
            Utc::now(),
        );

        match registry.decode(&envelope) {
            Err(DecodeError::UnexpectedEventName { expected, found, .. }) => {
                assert_eq!(expected, "ProductCreated");
                assert_eq!(found, "ProductDeleted");
            }
            other => panic!("Expected UnexpectedEventName, got {other:?}"),
        }
    }

    #[test]
    fn malformed_payload_is_rejected() {
        let registry = EventRegistry::builder().register::<OrderPlaced>().build();
        let envelope = EventEnvelope::new(
            Uuid::now_v7(),
            Topic::OrderPlaced,
            "OrderPlaced",
            b"not json".to_vec(),
            Utc::now(),
        );

        assert!(matches!(
            registry.decode(&envelope),
            Err(DecodeError::MalformedPayload { event_name: "OrderPlaced", .. })
        ));
    }

    #[test]
    fn negative_inventory_fails_to_decode() {
        let registry = order_service_registry();
        let envelope = EventEnvelope::new(
            Uuid::now_v7(),
            Topic::ProductInventoryUpdated,
            "ProductInventoryUpdated",
            br#"{"product_id":"P1","inventory_count":-4}"#.to_vec(),
            Utc::now(),
        );

        assert!(matches!(
            registry.decode(&envelope),
            Err(DecodeError::MalformedPayload { .. })
        ));
    }

    #[test]
    fn base64_wrapped_payloads_are_not_sniffed() {
        let registry = EventRegistry::builder().register::<OrderPlaced>().build();
        // base64 of {"order_id":"o-1"}, wrapped as a JSON string
        let envelope = EventEnvelope::new(
            Uuid::now_v7(),
            Topic::OrderPlaced,
            "OrderPlaced",
            br#""eyJvcmRlcl9pZCI6Im8tMSJ9""#.to_vec(),
            Utc::now(),
        );

        assert!(registry.decode(&envelope).is_err());
    }

    #[test]
    fn decode_as_reports_kind_mismatch() {
        let registry = order_service_registry();
        let envelope = EventEnvelope::from_event(
            Uuid::now_v7(),
            &ProductInventoryUpdated {
                product_id: ProductId::parse("P1").unwrap(),
                inventory_count: 4,
            },
        )
        .unwrap();

        let err = registry.decode_as::<ProductCreated>(&envelope).unwrap_err();
        assert_eq!(
            err,
            DecodeError::KindMismatch {
                expected: "ProductCreated",
                found: "ProductInventoryUpdated",
            }
        );
    }

    #[test]
    fn registry_reports_bindings() {
        let registry = order_service_registry();
        assert!(registry.is_registered::<UserRegistered>());
        assert!(!registry.is_registered::<OrderPlaced>());
        assert_eq!(registry.topics().count(), 3);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 256,
                ..ProptestConfig::default()
            })]

            /// Arbitrary bytes on a registered topic never panic the decoder.
            #[test]
            fn decode_never_panics(payload in proptest::collection::vec(any::<u8>(), 0..256)) {
                let registry = EventRegistry::builder().register::<OrderPlaced>().build();
                let envelope = EventEnvelope::new(
                    Uuid::now_v7(),
                    Topic::OrderPlaced,
                    "OrderPlaced",
                    payload,
                    Utc::now(),
                );
                let _ = registry.decode(&envelope);
            }
        }
    }
}
