//! In-memory exchange used for dry-run trading and tests.
//!
//! Orders are tracked in a simple book: market orders fill immediately at the
//! ticker, limit orders fill immediately when `instant_fill` is on (the
//! dry-run default) and otherwise rest until a test drives them with
//! [`SimulatedExchange::fill_order`]. Stoploss orders always rest until
//! triggered. Temporary failures can be injected to exercise retry paths, and
//! orders can be dropped to exercise divergence handling.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{OrderKind, OrderSide, OrderStatus};

use super::{
    Balance, ExchangeError, ExchangeGateway, ExchangeOrder, ExchangePosition, PairLimits, Ticker,
};

#[derive(Default)]
struct SimState {
    tickers: HashMap<String, Ticker>,
    balances: HashMap<String, Balance>,
    orders: HashMap<String, ExchangeOrder>,
    limits: HashMap<String, PairLimits>,
    positions: Vec<ExchangePosition>,
    /// Fill amount already charged to the paper balance, per order.
    settled: HashMap<String, Decimal>,
    instant_fill: bool,
    pending_failures: u32,
}

/// Paper-trading gateway backing dry-run mode and the test suite.
pub struct SimulatedExchange {
    state: RwLock<SimState>,
}

fn quote_currency(pair: &str) -> String {
    pair.split('/').nth(1).unwrap_or(pair).to_string()
}

impl SimulatedExchange {
    /// Fresh paper exchange holding `wallet` units of `quote_currency`.
    pub fn new(quote: impl Into<String>, wallet: Decimal) -> Self {
        let mut balances = HashMap::new();
        balances.insert(
            quote.into(),
            Balance {
                free: wallet,
                used: Decimal::ZERO,
                total: wallet,
            },
        );
        Self {
            state: RwLock::new(SimState {
                balances,
                instant_fill: true,
                ..SimState::default()
            }),
        }
    }

    pub async fn set_ticker(&self, pair: &str, bid: Decimal, ask: Decimal) {
        let mut state = self.state.write().await;
        state.tickers.insert(
            pair.to_string(),
            Ticker {
                pair: pair.to_string(),
                bid,
                ask,
                last: (bid + ask) / Decimal::TWO,
            },
        );
    }

    pub async fn set_balance(&self, currency: &str, free: Decimal, used: Decimal) {
        let mut state = self.state.write().await;
        state.balances.insert(
            currency.to_string(),
            Balance {
                free,
                used,
                total: free + used,
            },
        );
    }

    pub async fn set_pair_limits(
        &self,
        pair: &str,
        min_stake: Option<Decimal>,
        max_stake: Option<Decimal>,
    ) {
        let mut state = self.state.write().await;
        state.limits.insert(
            pair.to_string(),
            PairLimits {
                min_stake,
                max_stake,
            },
        );
    }

    /// When off, limit orders rest until filled explicitly.
    pub async fn set_instant_fill(&self, instant: bool) {
        self.state.write().await.instant_fill = instant;
    }

    /// The next `count` gateway calls fail with a temporary error.
    pub async fn fail_next_calls(&self, count: u32) {
        self.state.write().await.pending_failures = count;
    }

    /// Drive a resting order: advance its fill and optionally terminate it.
    pub async fn fill_order(&self, order_id: &str, filled: Decimal, average: Decimal) {
        let mut state = self.state.write().await;
        if let Some(order) = state.orders.get_mut(order_id) {
            order.filled = filled.min(order.amount);
            order.average = Some(average);
            if order.filled >= order.amount {
                order.status = OrderStatus::Closed;
            }
        }
        self.settle_balance(&mut state, order_id);
    }

    /// Mark a resting order canceled/expired/rejected on the exchange side.
    pub async fn set_order_status(&self, order_id: &str, status: OrderStatus) {
        let mut state = self.state.write().await;
        if let Some(order) = state.orders.get_mut(order_id) {
            order.status = status;
        }
    }

    /// Forget an order entirely, as a diverging exchange would.
    pub async fn drop_order(&self, order_id: &str) {
        self.state.write().await.orders.remove(order_id);
    }

    pub async fn open_order_count(&self) -> usize {
        self.state
            .read()
            .await
            .orders
            .values()
            .filter(|o| o.status == OrderStatus::Open)
            .count()
    }

    fn settle_balance(&self, state: &mut SimState, order_id: &str) {
        // Paper accounting, once per fill delta: buys consume their
        // reservation out of `used`, sells credit `free`. Good enough for
        // dry-run; tests set balances directly when exact figures matter.
        let Some(order) = state.orders.get(order_id).cloned() else {
            return;
        };
        let already = state
            .settled
            .get(order_id)
            .copied()
            .unwrap_or(Decimal::ZERO);
        let delta = order.filled - already;
        if delta <= Decimal::ZERO {
            return;
        }
        let cost = delta * order.average.or(order.price).unwrap_or(Decimal::ZERO);
        let quote = quote_currency(&order.pair);
        let balance = state.balances.entry(quote).or_default();
        match order.side {
            OrderSide::Buy => balance.used -= cost,
            OrderSide::Sell => balance.free += cost,
        }
        balance.total = balance.free + balance.used;
        state.settled.insert(order_id.to_string(), order.filled);
    }

    /// Return the unfilled part of a cancelled buy's reservation to `free`.
    fn release_reservation(&self, state: &mut SimState, order_id: &str) {
        let Some(order) = state.orders.get(order_id).cloned() else {
            return;
        };
        if order.side != OrderSide::Buy {
            return;
        }
        let release = order.remaining() * order.average.or(order.price).unwrap_or(Decimal::ZERO);
        if release <= Decimal::ZERO {
            return;
        }
        let quote = quote_currency(&order.pair);
        let balance = state.balances.entry(quote).or_default();
        balance.used -= release;
        balance.free += release;
        balance.total = balance.free + balance.used;
    }

    async fn take_injected_failure(&self) -> Option<ExchangeError> {
        let mut state = self.state.write().await;
        if state.pending_failures > 0 {
            state.pending_failures -= 1;
            Some(ExchangeError::Temporary("injected failure".into()))
        } else {
            None
        }
    }
}

#[async_trait]
impl ExchangeGateway for SimulatedExchange {
    async fn fetch_ticker(&self, pair: &str) -> Result<Ticker, ExchangeError> {
        if let Some(err) = self.take_injected_failure().await {
            return Err(err);
        }
        let state = self.state.read().await;
        state
            .tickers
            .get(pair)
            .cloned()
            .ok_or_else(|| ExchangeError::Temporary(format!("no ticker for {pair}")))
    }

    async fn fetch_order(
        &self,
        order_id: &str,
        _pair: &str,
    ) -> Result<ExchangeOrder, ExchangeError> {
        if let Some(err) = self.take_injected_failure().await {
            return Err(err);
        }
        let state = self.state.read().await;
        state
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| ExchangeError::OrderNotFound {
                order_id: order_id.to_string(),
            })
    }

    async fn create_order(
        &self,
        pair: &str,
        side: OrderSide,
        kind: OrderKind,
        amount: Decimal,
        price: Option<Decimal>,
    ) -> Result<ExchangeOrder, ExchangeError> {
        if let Some(err) = self.take_injected_failure().await {
            return Err(err);
        }
        if amount <= Decimal::ZERO {
            return Err(ExchangeError::InvalidRequest(format!(
                "order amount must be positive, got {amount}"
            )));
        }

        let mut state = self.state.write().await;

        let market_rate = state.tickers.get(pair).map(|t| match side {
            OrderSide::Buy => t.ask,
            OrderSide::Sell => t.bid,
        });
        let effective_price = price.or(market_rate);
        if effective_price.is_none() {
            return Err(ExchangeError::Rejected(format!(
                "no price available for market order on {pair}"
            )));
        }

        let mut order = ExchangeOrder {
            id: Uuid::new_v4().to_string(),
            pair: pair.to_string(),
            side,
            kind,
            price: effective_price,
            average: None,
            amount,
            filled: Decimal::ZERO,
            status: OrderStatus::Open,
            timestamp: Utc::now(),
        };

        // Stoploss orders always rest; everything else follows the fill mode
        // (market orders are treated as instantly marketable).
        let fills_now = kind != OrderKind::Stoploss && (state.instant_fill || price.is_none());
        if fills_now {
            order.filled = amount;
            order.average = effective_price;
            order.status = OrderStatus::Closed;
        }

        // Buys reserve quote funds at placement, like a real exchange: the
        // wallet's free balance drops as soon as the order is accepted.
        if side == OrderSide::Buy {
            let reserve = amount * effective_price.unwrap_or(Decimal::ZERO);
            let quote = quote_currency(pair);
            let balance = state.balances.entry(quote).or_default();
            balance.free -= reserve;
            balance.used += reserve;
            balance.total = balance.free + balance.used;
        }

        let id = order.id.clone();
        state.orders.insert(id.clone(), order.clone());
        if fills_now {
            self.settle_balance(&mut state, &id);
        }
        Ok(order)
    }

    async fn cancel_order(
        &self,
        order_id: &str,
        _pair: &str,
    ) -> Result<ExchangeOrder, ExchangeError> {
        if let Some(err) = self.take_injected_failure().await {
            return Err(err);
        }
        let mut state = self.state.write().await;
        let order = state
            .orders
            .get_mut(order_id)
            .ok_or_else(|| ExchangeError::OrderNotFound {
                order_id: order_id.to_string(),
            })?;
        if order.status == OrderStatus::Open {
            order.status = OrderStatus::Canceled;
            self.release_reservation(&mut state, order_id);
        }
        let order = state.orders.get(order_id).cloned().expect("order exists");
        Ok(order)
    }

    async fn get_balances(&self) -> Result<HashMap<String, Balance>, ExchangeError> {
        if let Some(err) = self.take_injected_failure().await {
            return Err(err);
        }
        Ok(self.state.read().await.balances.clone())
    }

    async fn fetch_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
        if let Some(err) = self.take_injected_failure().await {
            return Err(err);
        }
        Ok(self.state.read().await.positions.clone())
    }

    async fn pair_limits(&self, pair: &str) -> Result<PairLimits, ExchangeError> {
        Ok(self
            .state
            .read()
            .await
            .limits
            .get(pair)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn market_order_fills_at_ticker() {
        let exchange = SimulatedExchange::new("USDT", dec!(1000));
        exchange.set_ticker("ETH/USDT", dec!(99), dec!(101)).await;

        let order = exchange
            .create_order("ETH/USDT", OrderSide::Buy, OrderKind::Entry, dec!(2), None)
            .await
            .unwrap();

        assert_eq!(order.status, OrderStatus::Closed);
        assert_eq!(order.average, Some(dec!(101)));

        let balances = exchange.get_balances().await.unwrap();
        assert_eq!(balances["USDT"].free, dec!(1000) - dec!(202));
    }

    #[tokio::test]
    async fn resting_limit_order_fills_on_demand() {
        let exchange = SimulatedExchange::new("USDT", dec!(1000));
        exchange.set_ticker("ETH/USDT", dec!(99), dec!(101)).await;
        exchange.set_instant_fill(false).await;

        let order = exchange
            .create_order("ETH/USDT", OrderSide::Buy, OrderKind::Entry, dec!(2), Some(dec!(95)))
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Open);
        assert_eq!(exchange.open_order_count().await, 1);

        exchange.fill_order(&order.id, dec!(2), dec!(95)).await;
        let synced = exchange.fetch_order(&order.id, "ETH/USDT").await.unwrap();
        assert_eq!(synced.status, OrderStatus::Closed);
        assert_eq!(synced.filled, dec!(2));
    }

    #[tokio::test]
    async fn injected_failures_are_temporary_and_bounded() {
        let exchange = SimulatedExchange::new("USDT", dec!(1000));
        exchange.set_ticker("ETH/USDT", dec!(99), dec!(101)).await;
        exchange.fail_next_calls(1).await;

        let err = exchange.fetch_ticker("ETH/USDT").await.unwrap_err();
        assert!(err.is_retryable());
        assert!(exchange.fetch_ticker("ETH/USDT").await.is_ok());
    }

    #[tokio::test]
    async fn dropped_order_reports_not_found() {
        let exchange = SimulatedExchange::new("USDT", dec!(1000));
        exchange.set_ticker("ETH/USDT", dec!(99), dec!(101)).await;
        exchange.set_instant_fill(false).await;

        let order = exchange
            .create_order("ETH/USDT", OrderSide::Buy, OrderKind::Entry, dec!(1), Some(dec!(90)))
            .await
            .unwrap();
        exchange.drop_order(&order.id).await;

        assert!(matches!(
            exchange.fetch_order(&order.id, "ETH/USDT").await,
            Err(ExchangeError::OrderNotFound { .. })
        ));
    }
}
