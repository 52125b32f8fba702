//! Node configuration from environment variables.
//!
//! | Variable | Default |
//! |---|---|
//! | `STOREFRONT_ROLE` | required: `order` or `product` |
//! | `STOREFRONT_BUS` | `memory` (`redis` needs `REDIS_URL`) |
//! | `REDIS_URL` | `redis://localhost:6379` |
//! | `STOREFRONT_STREAM_PREFIX` | `storefront` |
//! | `STOREFRONT_CONSUMER_GROUP` | the role's service group |
//! | `DATABASE_URL` | unset: in-memory stores |
//! | `STOREFRONT_OUTBOX_POLL_MS` | `200` |
//! | `STOREFRONT_OUTBOX_BATCH` | `100` |
//! | `STOREFRONT_MAX_ATTEMPTS` | `20` deliveries before a stuck message is reported (`0` never) |
//! | `STOREFRONT_BACKOFF_MS` | `100` |

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::outbox::RelayConfig;
use crate::services::{ORDER_SERVICE_GROUP, PRODUCT_SERVICE_GROUP};
use crate::workers::{RetryPolicy, SubscriptionConfig};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Which service this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceRole {
    Order,
    Product,
}

impl ServiceRole {
    pub fn default_group(&self) -> &'static str {
        match self {
            ServiceRole::Order => ORDER_SERVICE_GROUP,
            ServiceRole::Product => PRODUCT_SERVICE_GROUP,
        }
    }
}

impl FromStr for ServiceRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "order" => Ok(ServiceRole::Order),
            "product" => Ok(ServiceRole::Product),
            other => Err(format!("expected `order` or `product`, got `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusBackend {
    /// In-process broker; only useful when everything runs in one process.
    Memory,
    Redis { url: String, stream_prefix: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub role: ServiceRole,
    pub bus: BusBackend,
    pub consumer_group: String,
    pub database_url: Option<String>,
    pub relay: RelayConfig,
    pub subscription: SubscriptionConfig,
}

impl NodeConfig {
    pub fn new(role: ServiceRole) -> Self {
        Self {
            role,
            bus: BusBackend::Memory,
            consumer_group: role.default_group().to_string(),
            database_url: None,
            relay: RelayConfig::default(),
            subscription: SubscriptionConfig::default(),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup (the process environment in production).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let role_raw = get("STOREFRONT_ROLE").ok_or(ConfigError::Missing("STOREFRONT_ROLE"))?;
        let role = role_raw.parse::<ServiceRole>().map_err(|reason| ConfigError::Invalid {
            key: "STOREFRONT_ROLE",
            value: role_raw.clone(),
            reason,
        })?;

        let mut config = Self::new(role);

        let bus = get("STOREFRONT_BUS").unwrap_or_else(|| "memory".to_string());
        config.bus = match bus.trim().to_ascii_lowercase().as_str() {
            "memory" => BusBackend::Memory,
            "redis" => BusBackend::Redis {
                url: get("REDIS_URL").unwrap_or_else(|| "redis://localhost:6379".to_string()),
                stream_prefix: get("STOREFRONT_STREAM_PREFIX").unwrap_or_else(|| "storefront".to_string()),
            },
            _ => {
                return Err(ConfigError::Invalid {
                    key: "STOREFRONT_BUS",
                    value: bus,
                    reason: "expected `memory` or `redis`".to_string(),
                });
            }
        };

        if let Some(group) = get("STOREFRONT_CONSUMER_GROUP") {
            config.consumer_group = group;
        }
        config.database_url = get("DATABASE_URL");

        if let Some(ms) = parse_number::<u64>(&get, "STOREFRONT_OUTBOX_POLL_MS")? {
            config.relay = config.relay.with_poll_interval(Duration::from_millis(ms));
        }
        if let Some(batch) = parse_number::<usize>(&get, "STOREFRONT_OUTBOX_BATCH")? {
            if batch == 0 {
                return Err(ConfigError::Invalid {
                    key: "STOREFRONT_OUTBOX_BATCH",
                    value: batch.to_string(),
                    reason: "must be at least 1".to_string(),
                });
            }
            config.relay = config.relay.with_batch_size(batch);
        }
        config.relay = config
            .relay
            .with_name(format!("{}-outbox-relay", config.consumer_group));

        let mut retry = RetryPolicy::default();
        if let Some(max) = parse_number::<u32>(&get, "STOREFRONT_MAX_ATTEMPTS")? {
            retry.max_attempts = max;
        }
        if let Some(ms) = parse_number::<u64>(&get, "STOREFRONT_BACKOFF_MS")? {
            retry.base_delay = Duration::from_millis(ms);
        }
        config.subscription = config.subscription.with_retry(retry);

        Ok(config)
    }

    pub fn with_bus(mut self, bus: BusBackend) -> Self {
        self.bus = bus;
        self
    }

    pub fn with_consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = group.into();
        self
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    pub fn with_relay(mut self, relay: RelayConfig) -> Self {
        self.relay = relay;
        self
    }

    pub fn with_subscription(mut self, subscription: SubscriptionConfig) -> Self {
        self.subscription = subscription;
        self
    }
}

fn parse_number<T>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get(key)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_for_order_role() {
        let config = NodeConfig::from_lookup(lookup(&[("STOREFRONT_ROLE", "order")])).unwrap();
        assert_eq!(config.role, ServiceRole::Order);
        assert_eq!(config.bus, BusBackend::Memory);
        assert_eq!(config.consumer_group, "order-service");
        assert_eq!(config.database_url, None);
        assert_eq!(config.subscription.retry.max_attempts, 20);
        assert_eq!(config.relay.name, "order-service-outbox-relay");
    }

    #[test]
    fn redis_backend_and_overrides() {
        let config = NodeConfig::from_lookup(lookup(&[
            ("STOREFRONT_ROLE", "Product"),
            ("STOREFRONT_BUS", "redis"),
            ("REDIS_URL", "redis://cache:6379"),
            ("STOREFRONT_MAX_ATTEMPTS", "0"),
            ("STOREFRONT_BACKOFF_MS", "50"),
            ("STOREFRONT_OUTBOX_BATCH", "10"),
        ]))
        .unwrap();

        assert_eq!(
            config.bus,
            BusBackend::Redis {
                url: "redis://cache:6379".into(),
                stream_prefix: "storefront".into(),
            }
        );
        assert_eq!(config.consumer_group, "product-service");
        assert_eq!(config.subscription.retry.max_attempts, 0);
        assert_eq!(config.subscription.retry.base_delay, Duration::from_millis(50));
        assert_eq!(config.relay.batch_size, 10);
    }

    #[test]
    fn missing_role_is_an_error() {
        assert_eq!(
            NodeConfig::from_lookup(lookup(&[])).unwrap_err(),
            ConfigError::Missing("STOREFRONT_ROLE")
        );
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let err = NodeConfig::from_lookup(lookup(&[
            ("STOREFRONT_ROLE", "order"),
            ("STOREFRONT_OUTBOX_POLL_MS", "soon"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "STOREFRONT_OUTBOX_POLL_MS", .. }));
    }

    #[test]
    fn unknown_bus_is_rejected() {
        let err = NodeConfig::from_lookup(lookup(&[
            ("STOREFRONT_ROLE", "order"),
            ("STOREFRONT_BUS", "kafka"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "STOREFRONT_BUS", .. }));
    }
}
