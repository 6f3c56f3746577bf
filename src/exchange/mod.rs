//! Abstract exchange gateway.
//!
//! The engine never speaks an exchange wire protocol; it consumes this trait.
//! Concrete adapters (REST clients, rate limiting, parameter quirks) live
//! outside this crate. The in-repo [`SimulatedExchange`] backs dry-run mode
//! and the test suite.

mod retry;
mod simulated;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::models::{OrderKind, OrderSide, OrderStatus};

pub use retry::{RetryError, RetryPolicy};
pub use simulated::SimulatedExchange;

/// Outcome classes for gateway calls.
///
/// `Temporary` failures are retried with bounded backoff; everything else is
/// surfaced to the caller unchanged.
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    /// Network hiccup, rate limit, 5xx. Safe to retry.
    #[error("temporary exchange failure: {0}")]
    Temporary(String),

    /// The exchange declined the request. Retrying will not help.
    #[error("rejected by exchange: {0}")]
    Rejected(String),

    /// The exchange no longer knows the order.
    #[error("order {order_id} not found on exchange")]
    OrderNotFound { order_id: String },

    /// The request itself was malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ExchangeError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExchangeError::Temporary(_))
    }
}

/// Current best prices for a pair.
#[derive(Debug, Clone)]
pub struct Ticker {
    pub pair: String,
    pub bid: Decimal,
    pub ask: Decimal,
    pub last: Decimal,
}

/// Free/used/total for one currency as the exchange reports it.
#[derive(Debug, Clone, Default)]
pub struct Balance {
    pub free: Decimal,
    pub used: Decimal,
    pub total: Decimal,
}

/// Authoritative order state as reported by the exchange.
#[derive(Debug, Clone)]
pub struct ExchangeOrder {
    pub id: String,
    pub pair: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub price: Option<Decimal>,
    pub average: Option<Decimal>,
    pub amount: Decimal,
    pub filled: Decimal,
    pub status: OrderStatus,
    pub timestamp: DateTime<Utc>,
}

impl ExchangeOrder {
    pub fn remaining(&self) -> Decimal {
        (self.amount - self.filled).max(Decimal::ZERO)
    }
}

/// An open position as reported by the exchange (futures-style accounts).
#[derive(Debug, Clone)]
pub struct ExchangePosition {
    pub pair: String,
    pub side: OrderSide,
    pub amount: Decimal,
    pub entry_price: Decimal,
    pub leverage: Decimal,
}

/// Exchange-imposed stake limits for a pair.
#[derive(Debug, Clone, Default)]
pub struct PairLimits {
    pub min_stake: Option<Decimal>,
    pub max_stake: Option<Decimal>,
}

/// The narrow surface the engine needs from an exchange.
///
/// Every call may fail with a retryable [`ExchangeError::Temporary`] or a
/// terminal outcome; callers wrap invocations in a [`RetryPolicy`].
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    async fn fetch_ticker(&self, pair: &str) -> Result<Ticker, ExchangeError>;

    async fn fetch_order(&self, order_id: &str, pair: &str)
        -> Result<ExchangeOrder, ExchangeError>;

    /// Submit an order. `price` of `None` means a market order; stoploss
    /// orders interpret `price` as the trigger price.
    async fn create_order(
        &self,
        pair: &str,
        side: OrderSide,
        kind: OrderKind,
        amount: Decimal,
        price: Option<Decimal>,
    ) -> Result<ExchangeOrder, ExchangeError>;

    async fn cancel_order(&self, order_id: &str, pair: &str)
        -> Result<ExchangeOrder, ExchangeError>;

    async fn get_balances(&self) -> Result<HashMap<String, Balance>, ExchangeError>;

    async fn fetch_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError>;

    async fn pair_limits(&self, pair: &str) -> Result<PairLimits, ExchangeError>;
}
