//! Order model: one exchange order instance tied to exactly one Trade.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Order side on the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "sell" => OrderSide::Sell,
            _ => OrderSide::Buy,
        }
    }
}

/// What role an order plays within its trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderKind {
    Entry,
    Exit,
    Stoploss,
}

impl OrderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderKind::Entry => "entry",
            OrderKind::Exit => "exit",
            OrderKind::Stoploss => "stoploss",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "exit" => OrderKind::Exit,
            "stoploss" => OrderKind::Stoploss,
            _ => OrderKind::Entry,
        }
    }
}

/// Exchange-reported lifecycle status of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Open,
    Closed,
    Canceled,
    Expired,
    Rejected,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Open => "open",
            OrderStatus::Closed => "closed",
            OrderStatus::Canceled => "canceled",
            OrderStatus::Expired => "expired",
            OrderStatus::Rejected => "rejected",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "closed" => OrderStatus::Closed,
            "canceled" => OrderStatus::Canceled,
            "expired" => OrderStatus::Expired,
            "rejected" => OrderStatus::Rejected,
            _ => OrderStatus::Open,
        }
    }
}

/// A single exchange order belonging to a trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    /// Ledger id, `None` until persisted.
    pub id: Option<i64>,

    pub trade_id: i64,

    /// Exchange-assigned id; `None` until the submission is acknowledged.
    pub order_id: Option<String>,

    pub side: OrderSide,
    pub kind: OrderKind,

    /// Requested limit price (trigger price for stoploss orders). `None` for
    /// market orders.
    pub price: Option<Decimal>,

    /// Average fill price reported by the exchange.
    pub average: Option<Decimal>,

    pub amount: Decimal,

    /// Fill high-water mark. Reconciliation only ever advances this.
    pub filled: Decimal,

    /// Quote-currency cost of the filled portion.
    pub cost: Decimal,

    pub status: OrderStatus,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn new(
        trade_id: i64,
        side: OrderSide,
        kind: OrderKind,
        price: Option<Decimal>,
        amount: Decimal,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: None,
            trade_id,
            order_id: None,
            side,
            kind,
            price,
            average: None,
            amount,
            filled: Decimal::ZERO,
            cost: Decimal::ZERO,
            status: OrderStatus::Open,
            created_at: now,
            updated_at: now,
        }
    }

    /// Terminal orders are immutable: fully-filled closed orders and any
    /// canceled/expired/rejected order.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            OrderStatus::Closed => self.filled >= self.amount,
            OrderStatus::Canceled | OrderStatus::Expired | OrderStatus::Rejected => true,
            OrderStatus::Open => false,
        }
    }

    pub fn is_fully_filled(&self) -> bool {
        self.status == OrderStatus::Closed && self.filled >= self.amount
    }

    pub fn remaining(&self) -> Decimal {
        (self.amount - self.filled).max(Decimal::ZERO)
    }

    /// Whether this order's fill participates in the trade's aggregates:
    /// fully-filled orders, or cancelled/expired ones whose partial fill was
    /// folded into the trade. In-flight orders never count.
    pub fn counts_toward_position(&self) -> bool {
        match self.status {
            OrderStatus::Closed => self.filled >= self.amount,
            OrderStatus::Canceled | OrderStatus::Expired => self.filled > Decimal::ZERO,
            _ => false,
        }
    }

    /// Effective fill price: exchange-reported average, falling back to the
    /// requested price.
    pub fn fill_price(&self) -> Decimal {
        self.average.or(self.price).unwrap_or(Decimal::ZERO)
    }

    /// Merge an authoritative exchange snapshot into this order.
    ///
    /// Idempotent: the fill amount is a high-water mark and a terminal status
    /// never regresses, so applying the same snapshot twice is a no-op.
    /// Returns whether anything changed.
    pub fn apply_update(
        &mut self,
        status: OrderStatus,
        filled: Decimal,
        average: Option<Decimal>,
    ) -> bool {
        let mut changed = false;

        if filled > self.filled {
            self.filled = filled.min(self.amount);
            if let Some(avg) = average {
                self.average = Some(avg);
            }
            self.cost = self.filled * self.fill_price();
            changed = true;
        }

        if status != self.status && !self.is_terminal() {
            self.status = status;
            changed = true;
        }

        if changed {
            self.updated_at = Utc::now();
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn apply_update_is_idempotent() {
        let mut order = Order::new(1, OrderSide::Buy, OrderKind::Entry, Some(dec!(10)), dec!(4));

        assert!(order.apply_update(OrderStatus::Open, dec!(1), Some(dec!(10))));
        assert_eq!(order.filled, dec!(1));

        // Same snapshot again: nothing moves.
        assert!(!order.apply_update(OrderStatus::Open, dec!(1), Some(dec!(10))));
        assert_eq!(order.filled, dec!(1));
        assert_eq!(order.cost, dec!(10));
    }

    #[test]
    fn fill_high_water_mark_never_regresses() {
        let mut order = Order::new(1, OrderSide::Buy, OrderKind::Entry, Some(dec!(10)), dec!(4));
        order.apply_update(OrderStatus::Open, dec!(3), Some(dec!(10)));

        // A stale snapshot with a lower fill must not move anything.
        assert!(!order.apply_update(OrderStatus::Open, dec!(2), Some(dec!(10))));
        assert_eq!(order.filled, dec!(3));
    }

    #[test]
    fn terminal_status_is_sticky() {
        let mut order = Order::new(1, OrderSide::Buy, OrderKind::Entry, Some(dec!(10)), dec!(4));
        order.apply_update(OrderStatus::Canceled, dec!(1), Some(dec!(10)));
        assert_eq!(order.status, OrderStatus::Canceled);

        assert!(!order.apply_update(OrderStatus::Open, dec!(1), Some(dec!(10))));
        assert_eq!(order.status, OrderStatus::Canceled);
    }

    #[test]
    fn full_fill_is_terminal_and_counts() {
        let mut order = Order::new(1, OrderSide::Buy, OrderKind::Entry, Some(dec!(10)), dec!(4));
        order.apply_update(OrderStatus::Closed, dec!(4), Some(dec!(10)));

        assert!(order.is_terminal());
        assert!(order.is_fully_filled());
        assert!(order.counts_toward_position());
        assert_eq!(order.cost, dec!(40));
    }

    #[test]
    fn canceled_without_fill_never_counts() {
        let mut order = Order::new(1, OrderSide::Buy, OrderKind::Entry, Some(dec!(10)), dec!(4));
        order.apply_update(OrderStatus::Canceled, Decimal::ZERO, None);
        assert!(order.is_terminal());
        assert!(!order.counts_toward_position());
    }
}
