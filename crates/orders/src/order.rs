use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use storefront_core::{DomainError, DomainResult, OrderId, ProductId, UserId};
use storefront_events::{OrderLine, OrderPlaced};

/// Order status lifecycle.
///
/// `placed → shipped → completed`, and `placed | shipped → cancelled`.
/// `completed` and `cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Placed,
    Shipped,
    Completed,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Placed => "placed",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Completed | OrderStatus::Cancelled)
    }

    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Placed, Shipped) | (Shipped, Completed) | (Placed, Cancelled) | (Shipped, Cancelled)
        )
    }
}

impl core::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "placed" => Ok(OrderStatus::Placed),
            "shipped" => Ok(OrderStatus::Shipped),
            "completed" => Ok(OrderStatus::Completed),
            "cancelled" => Ok(OrderStatus::Cancelled),
            other => Err(DomainError::validation(format!("unknown order status: {other}"))),
        }
    }
}

/// A priced order line, frozen at placement time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub product_id: ProductId,
    pub quantity: u32,
    pub price_at_order: f64,
}

impl OrderItem {
    pub fn line_total(&self) -> f64 {
        self.price_at_order * f64::from(self.quantity)
    }
}

/// One line of a `PlaceOrder` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestedLine {
    pub product_id: ProductId,
    pub quantity: u32,
}

/// Command: PlaceOrder (the user id is already authenticated).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceOrder {
    pub user_id: UserId,
    pub items: Vec<RequestedLine>,
}

impl PlaceOrder {
    /// Validate and merge the requested lines.
    ///
    /// Repeated products are folded into one line (quantities summed) so stock
    /// checks see the full amount asked for. First-seen order is kept.
    pub fn normalized_lines(&self) -> DomainResult<Vec<RequestedLine>> {
        if !self.user_id.is_valid() {
            return Err(DomainError::invalid_id("UserId: must not be blank"));
        }
        if self.items.is_empty() {
            return Err(DomainError::validation("order must contain at least one item"));
        }

        let mut merged: Vec<RequestedLine> = Vec::with_capacity(self.items.len());
        for line in &self.items {
            if !line.product_id.is_valid() {
                return Err(DomainError::invalid_id("ProductId: must not be blank"));
            }
            if line.quantity == 0 {
                return Err(DomainError::validation(format!(
                    "quantity for {} must be greater than zero",
                    line.product_id
                )));
            }

            match merged.iter_mut().find(|m| m.product_id == line.product_id) {
                Some(existing) => {
                    existing.quantity = existing.quantity.checked_add(line.quantity).ok_or_else(|| {
                        DomainError::validation(format!("quantity for {} is too large", line.product_id))
                    })?;
                }
                None => merged.push(line.clone()),
            }
        }
        Ok(merged)
    }
}

/// Order owned by the order service.
///
/// `total_price` always equals the sum of `price_at_order × quantity`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    order_id: OrderId,
    user_id: UserId,
    items: Vec<OrderItem>,
    total_price: f64,
    status: OrderStatus,
    placed_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Order {
    /// Create a new `placed` order from priced lines.
    pub fn place(
        order_id: OrderId,
        user_id: UserId,
        items: Vec<OrderItem>,
        at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        if items.is_empty() {
            return Err(DomainError::validation("order must contain at least one item"));
        }
        for item in &items {
            if item.quantity == 0 {
                return Err(DomainError::validation(format!(
                    "quantity for {} must be greater than zero",
                    item.product_id
                )));
            }
            if !item.price_at_order.is_finite() || item.price_at_order < 0.0 {
                return Err(DomainError::invariant(format!(
                    "price for {} is not a valid amount: {}",
                    item.product_id, item.price_at_order
                )));
            }
        }

        let total_price = total_of(&items);
        Ok(Self {
            order_id,
            user_id,
            items,
            total_price,
            status: OrderStatus::Placed,
            placed_at: at,
            updated_at: at,
        })
    }

    /// Rebuild an order loaded from storage.
    ///
    /// The stored total is ignored and recomputed from the items.
    pub fn restore(
        order_id: OrderId,
        user_id: UserId,
        items: Vec<OrderItem>,
        status: OrderStatus,
        placed_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        let total_price = total_of(&items);
        Self {
            order_id,
            user_id,
            items,
            total_price,
            status,
            placed_at,
            updated_at,
        }
    }

    pub fn order_id(&self) -> &OrderId {
        &self.order_id
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn items(&self) -> &[OrderItem] {
        &self.items
    }

    pub fn total_price(&self) -> f64 {
        self.total_price
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn placed_at(&self) -> DateTime<Utc> {
        self.placed_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Move to `next`. Re-applying the current status is a no-op.
    pub fn transition_to(&mut self, next: OrderStatus, at: DateTime<Utc>) -> DomainResult<()> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(DomainError::invariant(format!(
                "order {} cannot move from {} to {}",
                self.order_id, self.status, next
            )));
        }
        self.status = next;
        self.updated_at = at;
        Ok(())
    }

    /// The integration event announcing this order.
    pub fn placed_event(&self) -> OrderPlaced {
        OrderPlaced {
            order_id: self.order_id.clone(),
            user_id: self.user_id.clone(),
            items: self
                .items
                .iter()
                .map(|i| OrderLine {
                    product_id: i.product_id.clone(),
                    quantity: i.quantity,
                })
                .collect(),
        }
    }
}

fn total_of(items: &[OrderItem]) -> f64 {
    items.iter().map(OrderItem::line_total).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_user_id() -> UserId {
        UserId::parse("u-1").unwrap()
    }

    fn pid(raw: &str) -> ProductId {
        ProductId::parse(raw).unwrap()
    }

    fn item(product: &str, quantity: u32, price: f64) -> OrderItem {
        OrderItem {
            product_id: pid(product),
            quantity,
            price_at_order: price,
        }
    }

    fn placed_order() -> Order {
        Order::place(
            OrderId::generate(),
            test_user_id(),
            vec![item("P100", 3, 2.5), item("P200", 1, 10.0)],
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn place_computes_total_and_starts_placed() {
        let order = placed_order();
        assert_eq!(order.status(), OrderStatus::Placed);
        assert_eq!(order.total_price(), 17.5);
        assert_eq!(order.placed_at(), order.updated_at());
    }

    #[test]
    fn place_rejects_empty_orders() {
        let err = Order::place(OrderId::generate(), test_user_id(), vec![], Utc::now()).unwrap_err();
        match err {
            DomainError::Validation(_) => {}
            _ => panic!("Expected Validation error for empty order"),
        }
    }

    #[test]
    fn placed_event_mirrors_items() {
        let order = placed_order();
        let event = order.placed_event();

        assert_eq!(&event.order_id, order.order_id());
        assert_eq!(event.items.len(), 2);
        assert_eq!(event.items[0].product_id, pid("P100"));
        assert_eq!(event.items[0].quantity, 3);
    }

    #[test]
    fn normalized_lines_merge_duplicates_in_first_seen_order() {
        let cmd = PlaceOrder {
            user_id: test_user_id(),
            items: vec![
                RequestedLine { product_id: pid("P2"), quantity: 1 },
                RequestedLine { product_id: pid("P1"), quantity: 2 },
                RequestedLine { product_id: pid("P2"), quantity: 4 },
            ],
        };

        let lines = cmd.normalized_lines().unwrap();
        assert_eq!(
            lines,
            vec![
                RequestedLine { product_id: pid("P2"), quantity: 5 },
                RequestedLine { product_id: pid("P1"), quantity: 2 },
            ]
        );
    }

    #[test]
    fn normalized_lines_reject_zero_quantity() {
        let cmd = PlaceOrder {
            user_id: test_user_id(),
            items: vec![RequestedLine { product_id: pid("P1"), quantity: 0 }],
        };
        assert!(matches!(cmd.normalized_lines(), Err(DomainError::Validation(_))));
    }

    #[test]
    fn full_lifecycle_placed_to_shipped_to_completed() {
        let mut order = placed_order();
        order.transition_to(OrderStatus::Shipped, Utc::now()).unwrap();
        order.transition_to(OrderStatus::Completed, Utc::now()).unwrap();
        assert_eq!(order.status(), OrderStatus::Completed);
    }

    #[test]
    fn terminal_states_never_regress() {
        let mut order = placed_order();
        order.transition_to(OrderStatus::Cancelled, Utc::now()).unwrap();

        for next in [OrderStatus::Placed, OrderStatus::Shipped, OrderStatus::Completed] {
            assert!(order.transition_to(next, Utc::now()).is_err());
        }
        assert!(order.transition_to(OrderStatus::Cancelled, Utc::now()).is_ok());
        assert_eq!(order.status(), OrderStatus::Cancelled);
    }

    #[test]
    fn status_round_trips_through_text() {
        assert_eq!("shipped".parse::<OrderStatus>().unwrap(), OrderStatus::Shipped);
        assert!("returned".parse::<OrderStatus>().is_err());
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        fn status() -> impl Strategy<Value = OrderStatus> {
            prop_oneof![
                Just(OrderStatus::Placed),
                Just(OrderStatus::Shipped),
                Just(OrderStatus::Completed),
                Just(OrderStatus::Cancelled),
            ]
        }

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 1000,
                ..ProptestConfig::default()
            })]

            /// Property: total price equals the sum of line totals.
            #[test]
            fn total_matches_line_sum(
                lines in proptest::collection::vec((1u32..100, 0u32..100_000), 1..20)
            ) {
                let items: Vec<OrderItem> = lines
                    .iter()
                    .enumerate()
                    .map(|(i, (q, cents))| item(&format!("P{i}"), *q, f64::from(*cents) / 100.0))
                    .collect();
                let expected: f64 = items.iter().map(|i| i.price_at_order * f64::from(i.quantity)).sum();

                let order = Order::place(OrderId::generate(), test_user_id(), items, Utc::now()).unwrap();
                prop_assert_eq!(order.total_price(), expected);
            }

            /// Property: once terminal, no sequence of transitions changes the status.
            #[test]
            fn terminal_status_is_sticky(steps in proptest::collection::vec(status(), 0..20)) {
                let mut order = placed_order();
                let mut terminal: Option<OrderStatus> = None;

                for next in steps {
                    let _ = order.transition_to(next, Utc::now());
                    if let Some(t) = terminal {
                        prop_assert_eq!(order.status(), t);
                    } else if order.status().is_terminal() {
                        terminal = Some(order.status());
                    }
                }
            }
        }
    }
}
