use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use storefront_core::{DomainError, DomainResult, ProductId};
use storefront_events::{ProductCreated, ProductInventoryUpdated};

use crate::stock::LineOutcome;

/// Authoritative product row (owned by the product service).
///
/// `inventory_count` is unsigned; the only way to lower it is `try_deduct`,
/// which refuses to go below zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub product_id: ProductId,
    pub name: String,
    pub price: f64,
    pub inventory_count: u32,
    pub updated_at: DateTime<Utc>,
}

/// Command: CreateProduct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateProduct {
    pub product_id: ProductId,
    pub name: String,
    pub price: f64,
    pub inventory_count: u32,
}

impl CreateProduct {
    pub fn validate(&self) -> DomainResult<()> {
        if !self.product_id.is_valid() {
            return Err(DomainError::invalid_id("ProductId: must not be blank"));
        }
        if self.name.trim().is_empty() {
            return Err(DomainError::validation("product name cannot be empty"));
        }
        if !self.price.is_finite() || self.price < 0.0 {
            return Err(DomainError::validation(format!(
                "price must be a non-negative number, got {}",
                self.price
            )));
        }
        Ok(())
    }

    pub fn into_product(self, at: DateTime<Utc>) -> DomainResult<Product> {
        self.validate()?;
        Ok(Product {
            product_id: self.product_id,
            name: self.name.trim().to_string(),
            price: self.price,
            inventory_count: self.inventory_count,
            updated_at: at,
        })
    }
}

impl Product {
    /// Conditional decrement: deduct only when enough stock is on hand.
    pub fn try_deduct(&mut self, quantity: u32, at: DateTime<Utc>) -> LineOutcome {
        match self.inventory_count.checked_sub(quantity) {
            Some(remaining) => {
                self.inventory_count = remaining;
                self.updated_at = at;
                LineOutcome::Deducted {
                    product_id: self.product_id.clone(),
                    quantity,
                    remaining,
                }
            }
            None => LineOutcome::Shortfall {
                product_id: self.product_id.clone(),
                requested: quantity,
                available: self.inventory_count,
            },
        }
    }

    pub fn set_inventory(&mut self, count: u32, at: DateTime<Utc>) {
        self.inventory_count = count;
        self.updated_at = at;
    }

    pub fn created_event(&self) -> ProductCreated {
        ProductCreated {
            product_id: self.product_id.clone(),
            name: self.name.clone(),
            price: self.price,
            inventory_count: self.inventory_count,
        }
    }

    pub fn inventory_event(&self) -> ProductInventoryUpdated {
        ProductInventoryUpdated {
            product_id: self.product_id.clone(),
            inventory_count: self.inventory_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_product_id() -> ProductId {
        ProductId::parse("P100").unwrap()
    }

    fn test_product(inventory_count: u32) -> Product {
        CreateProduct {
            product_id: test_product_id(),
            name: "Widget".to_string(),
            price: 9.5,
            inventory_count,
        }
        .into_product(Utc::now())
        .unwrap()
    }

    #[test]
    fn create_product_rejects_empty_name() {
        let cmd = CreateProduct {
            product_id: test_product_id(),
            name: "   ".to_string(),
            price: 1.0,
            inventory_count: 0,
        };

        match cmd.validate().unwrap_err() {
            DomainError::Validation(_) => {}
            _ => panic!("Expected Validation error for empty name"),
        }
    }

    #[test]
    fn create_product_rejects_negative_or_nan_price() {
        for price in [-0.01, f64::NAN, f64::INFINITY] {
            let cmd = CreateProduct {
                product_id: test_product_id(),
                name: "Widget".to_string(),
                price,
                inventory_count: 0,
            };
            assert!(cmd.validate().is_err(), "price {price} should be rejected");
        }
    }

    #[test]
    fn deduct_with_enough_stock_lowers_count() {
        let mut product = test_product(5);

        let outcome = product.try_deduct(3, Utc::now());

        assert_eq!(product.inventory_count, 2);
        match outcome {
            LineOutcome::Deducted { remaining, quantity, .. } => {
                assert_eq!(remaining, 2);
                assert_eq!(quantity, 3);
            }
            _ => panic!("Expected Deducted outcome"),
        }
    }

    #[test]
    fn deduct_without_enough_stock_leaves_count_untouched() {
        let mut product = test_product(2);

        let outcome = product.try_deduct(3, Utc::now());

        assert_eq!(product.inventory_count, 2);
        assert_eq!(
            outcome,
            LineOutcome::Shortfall {
                product_id: test_product_id(),
                requested: 3,
                available: 2,
            }
        );
    }

    #[test]
    fn events_reflect_current_state() {
        let mut product = test_product(5);
        product.try_deduct(1, Utc::now());

        assert_eq!(product.created_event().inventory_count, 4);
        assert_eq!(product.inventory_event().inventory_count, 4);
        assert_eq!(product.created_event().name, "Widget");
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 1000,
                ..ProptestConfig::default()
            })]

            /// Property: no sequence of deductions drives stock below zero, and
            /// deducted quantities plus what is left equal the starting stock.
            #[test]
            fn deductions_conserve_stock(
                start in 0u32..1_000,
                requests in proptest::collection::vec(0u32..200, 0..50)
            ) {
                let mut product = test_product(start);
                let mut deducted: u64 = 0;

                for q in requests {
                    if let LineOutcome::Deducted { quantity, .. } = product.try_deduct(q, Utc::now()) {
                        deducted += u64::from(quantity);
                    }
                }

                prop_assert_eq!(deducted + u64::from(product.inventory_count), u64::from(start));
            }
        }
    }
}
