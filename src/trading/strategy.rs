//! Strategy capability interface and registry.
//!
//! Signal generation lives outside the engine; a strategy only answers the
//! fixed set of questions the position engine asks. Implementations are
//! registered by name and resolved once at startup, never looked up
//! dynamically per call.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::exchange::Ticker;
use crate::models::{ExitReason, Order, Trade, TradeDirection};

use super::config::{ConfigurationFatal, TradingConfig};

/// The fixed capability surface the engine polls each strategy through.
pub trait PositionStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Stoploss distance as a positive fraction, applied against the
    /// realized open rate once entry is confirmed.
    fn stoploss_pct(&self) -> Decimal;

    /// Entry signal for a whitelist pair, from externally supplied analysis.
    fn entry_signal(&self, pair: &str, ticker: &Ticker) -> Option<TradeDirection>;

    /// Signal-based exit, checked after the risk-control exits.
    fn should_exit(&self, _trade: &Trade, _rate: Decimal, _now: DateTime<Utc>) -> bool {
        false
    }

    /// Adjust the stake the allocator proposed for a new entry.
    fn size_position(
        &self,
        _pair: &str,
        proposed: Decimal,
        _min_stake: Option<Decimal>,
        _max_stake: Option<Decimal>,
    ) -> Decimal {
        proposed
    }

    /// New limit price for an unfilled entry order, or `None` to leave it.
    fn adjust_entry_price(&self, _trade: &Trade, _order: &Order, _current_rate: Decimal) -> Option<Decimal> {
        None
    }

    /// Additional stake to commit to an open trade (DCA), or `None`.
    fn adjust_position(
        &self,
        _trade: &Trade,
        _current_rate: Decimal,
        _profit_ratio: Decimal,
        _available: Decimal,
    ) -> Option<Decimal> {
        None
    }

    fn confirm_trade_entry(
        &self,
        _pair: &str,
        _direction: TradeDirection,
        _stake: Decimal,
        _rate: Decimal,
    ) -> bool {
        true
    }

    fn confirm_trade_exit(&self, _trade: &Trade, _reason: ExitReason, _rate: Decimal) -> bool {
        true
    }
}

/// Reference strategy: configured stoploss, no signals of its own.
///
/// Entries come from the administrative force-entry path (or a custom
/// strategy); exits are driven entirely by stoploss/ROI/trailing rules.
pub struct DefaultStrategy {
    stoploss_pct: Decimal,
}

impl DefaultStrategy {
    pub fn new(config: &TradingConfig) -> Self {
        Self {
            stoploss_pct: config.stoploss,
        }
    }
}

impl PositionStrategy for DefaultStrategy {
    fn name(&self) -> &str {
        "default"
    }

    fn stoploss_pct(&self) -> Decimal {
        self.stoploss_pct
    }

    fn entry_signal(&self, _pair: &str, _ticker: &Ticker) -> Option<TradeDirection> {
        None
    }
}

/// Name -> strategy mapping, populated at startup.
pub struct StrategyRegistry {
    strategies: HashMap<String, Arc<dyn PositionStrategy>>,
}

impl StrategyRegistry {
    /// Registry with the built-in strategies.
    pub fn builtin(config: &TradingConfig) -> Self {
        let mut registry = Self {
            strategies: HashMap::new(),
        };
        registry.register(Arc::new(DefaultStrategy::new(config)));
        registry
    }

    pub fn register(&mut self, strategy: Arc<dyn PositionStrategy>) {
        self.strategies
            .insert(strategy.name().to_string(), strategy);
    }

    /// Resolve once at startup; an unknown name is a fatal configuration
    /// error, not a runtime fallback.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn PositionStrategy>, ConfigurationFatal> {
        self.strategies.get(name).cloned().ok_or_else(|| {
            let known: Vec<&str> = self.strategies.keys().map(String::as_str).collect();
            ConfigurationFatal(format!(
                "unknown strategy {name:?}, registered: {}",
                known.join(", ")
            ))
        })
    }
}
