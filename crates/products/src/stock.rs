//! Outcomes of applying an order's lines against authoritative stock.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use storefront_core::{DomainError, OrderId, ProductId};

/// Result of one guarded decrement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LineOutcome {
    Deducted {
        product_id: ProductId,
        quantity: u32,
        remaining: u32,
    },
    Shortfall {
        product_id: ProductId,
        requested: u32,
        available: u32,
    },
}

impl LineOutcome {
    pub fn product_id(&self) -> &ProductId {
        match self {
            LineOutcome::Deducted { product_id, .. } | LineOutcome::Shortfall { product_id, .. } => {
                product_id
            }
        }
    }

    pub fn is_deducted(&self) -> bool {
        matches!(self, LineOutcome::Deducted { .. })
    }
}

/// A committed order line that real-time stock could not cover.
///
/// Raised after the order already exists as `placed`; no compensating event
/// is emitted for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error(
    "order {order_id}: insufficient stock for {product_id} (requested {requested}, available {available})"
)]
pub struct ConcurrencyError {
    pub order_id: OrderId,
    pub product_id: ProductId,
    pub requested: u32,
    pub available: u32,
}

impl From<ConcurrencyError> for DomainError {
    fn from(err: ConcurrencyError) -> Self {
        DomainError::concurrency(err.to_string())
    }
}

/// Everything one `OrderPlaced` did to stock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeductionReport {
    pub order_id: OrderId,
    pub outcomes: Vec<LineOutcome>,
}

impl DeductionReport {
    pub fn deducted(&self) -> impl Iterator<Item = &LineOutcome> {
        self.outcomes.iter().filter(|o| o.is_deducted())
    }

    pub fn shortfalls(&self) -> Vec<ConcurrencyError> {
        self.outcomes
            .iter()
            .filter_map(|o| match o {
                LineOutcome::Shortfall {
                    product_id,
                    requested,
                    available,
                } => Some(ConcurrencyError {
                    order_id: self.order_id.clone(),
                    product_id: product_id.clone(),
                    requested: *requested,
                    available: *available,
                }),
                LineOutcome::Deducted { .. } => None,
            })
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.outcomes.iter().all(LineOutcome::is_deducted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shortfalls_become_concurrency_errors() {
        let report = DeductionReport {
            order_id: OrderId::parse("o-2").unwrap(),
            outcomes: vec![
                LineOutcome::Deducted {
                    product_id: ProductId::parse("P1").unwrap(),
                    quantity: 1,
                    remaining: 0,
                },
                LineOutcome::Shortfall {
                    product_id: ProductId::parse("P100").unwrap(),
                    requested: 3,
                    available: 2,
                },
            ],
        };

        assert!(!report.is_complete());
        assert_eq!(report.deducted().count(), 1);

        let errors = report.shortfalls();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].product_id.as_str(), "P100");

        let domain: DomainError = errors[0].clone().into();
        assert!(matches!(domain, DomainError::Concurrency(_)));
    }
}
