//! Trade model: one position lifecycle on a pair, long or short.
//!
//! A Trade owns an ordered sequence of Orders (submission order) and derives
//! its aggregates (amount, open_rate, stake_amount) from the orders that
//! actually filled. At most one entry/exit order may be in flight at a time;
//! a resting exchange-side stoploss order is tracked separately.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::order::{Order, OrderKind, OrderSide};

/// Direction of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeDirection {
    Long,
    Short,
}

impl TradeDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeDirection::Long => "long",
            TradeDirection::Short => "short",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "short" => TradeDirection::Short,
            _ => TradeDirection::Long,
        }
    }

    /// Order side that opens (or increases) a position in this direction.
    pub fn entry_side(&self) -> OrderSide {
        match self {
            TradeDirection::Long => OrderSide::Buy,
            TradeDirection::Short => OrderSide::Sell,
        }
    }

    /// Order side that closes (or reduces) a position in this direction.
    pub fn exit_side(&self) -> OrderSide {
        match self {
            TradeDirection::Long => OrderSide::Sell,
            TradeDirection::Short => OrderSide::Buy,
        }
    }
}

/// Lifecycle state of a trade.
///
/// `Open` is re-entered after every position-adjustment fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeState {
    PendingEntry,
    Open,
    PendingExit,
    Closed,
}

impl TradeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeState::PendingEntry => "pending_entry",
            TradeState::Open => "open",
            TradeState::PendingExit => "pending_exit",
            TradeState::Closed => "closed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "pending_entry" => TradeState::PendingEntry,
            "pending_exit" => TradeState::PendingExit,
            "closed" => TradeState::Closed,
            _ => TradeState::Open,
        }
    }
}

/// Why a trade was closed. Persisted with a stable string encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Roi,
    Stoploss,
    TrailingStop,
    ExitSignal,
    ForceExit,
    EmergencyExit,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::Roi => "roi",
            ExitReason::Stoploss => "stoploss",
            ExitReason::TrailingStop => "trailing_stop",
            ExitReason::ExitSignal => "exit_signal",
            ExitReason::ForceExit => "force_exit",
            ExitReason::EmergencyExit => "emergency_exit",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "roi" => Some(ExitReason::Roi),
            "stoploss" => Some(ExitReason::Stoploss),
            "trailing_stop" => Some(ExitReason::TrailingStop),
            "exit_signal" => Some(ExitReason::ExitSignal),
            "force_exit" => Some(ExitReason::ForceExit),
            "emergency_exit" => Some(ExitReason::EmergencyExit),
            _ => None,
        }
    }
}

/// One open or closed position on one pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    /// Ledger id, `None` until persisted.
    pub id: Option<i64>,

    /// Trading pair, e.g. "ETH/USDT".
    pub pair: String,

    pub direction: TradeDirection,

    pub state: TradeState,

    /// Strategy that opened this trade.
    pub strategy: String,

    /// Net filled quantity (entry fills minus exit fills).
    pub amount: Decimal,

    /// Volume-weighted average entry price over filled entry orders.
    pub open_rate: Decimal,

    /// Capital committed, in quote currency.
    pub stake_amount: Decimal,

    pub leverage: Decimal,

    /// Current stoploss as an absolute price. Only ever tightens.
    pub stoploss: Option<Decimal>,
    pub stoploss_pct: Option<Decimal>,

    /// Stoploss fixed at confirmed entry; never mutated afterwards.
    pub initial_stoploss: Option<Decimal>,
    pub initial_stoploss_pct: Option<Decimal>,

    pub is_open: bool,

    /// Set when reconciliation detects a divergence the engine must not
    /// paper over. Frozen trades are skipped by all automated mutation.
    pub is_frozen: bool,

    pub exit_reason: Option<ExitReason>,

    /// Exchange id of the single in-flight entry/exit order, if any.
    pub open_order_id: Option<String>,

    /// Exchange id of the resting exchange-side stoploss order, if any.
    pub stoploss_order_id: Option<String>,

    pub open_date: DateTime<Utc>,
    pub close_date: Option<DateTime<Utc>>,
    pub close_rate: Option<Decimal>,
    pub close_profit: Option<Decimal>,
}

impl Trade {
    /// Create a new trade in `PendingEntry` with the intended stake.
    pub fn new(
        pair: impl Into<String>,
        direction: TradeDirection,
        stake_amount: Decimal,
        leverage: Decimal,
        strategy: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            pair: pair.into(),
            direction,
            state: TradeState::PendingEntry,
            strategy: strategy.into(),
            amount: Decimal::ZERO,
            open_rate: Decimal::ZERO,
            stake_amount,
            leverage,
            stoploss: None,
            stoploss_pct: None,
            initial_stoploss: None,
            initial_stoploss_pct: None,
            is_open: true,
            is_frozen: false,
            exit_reason: None,
            open_order_id: None,
            stoploss_order_id: None,
            open_date: Utc::now(),
            close_date: None,
            close_rate: None,
            close_profit: None,
        }
    }

    pub fn has_open_order(&self) -> bool {
        self.open_order_id.is_some()
    }

    /// Minutes elapsed since the trade was opened.
    pub fn elapsed_minutes(&self, now: DateTime<Utc>) -> i64 {
        (now - self.open_date).num_minutes()
    }

    /// Recompute amount, open_rate and stake_amount from the order history.
    ///
    /// Only orders that contributed a position change count: fully-filled
    /// orders, plus cancelled/expired orders whose partial fill was folded in.
    /// Orders still in flight never influence the aggregates.
    pub fn recalculate_from_orders(&mut self, orders: &[Order]) {
        let mut entry_filled = Decimal::ZERO;
        let mut entry_cost = Decimal::ZERO;
        let mut exit_filled = Decimal::ZERO;

        for order in orders {
            if !order.counts_toward_position() {
                continue;
            }
            match order.kind {
                OrderKind::Entry => {
                    entry_filled += order.filled;
                    entry_cost += order.filled * order.fill_price();
                }
                OrderKind::Exit | OrderKind::Stoploss => {
                    exit_filled += order.filled;
                }
            }
        }

        self.amount = entry_filled - exit_filled;
        if entry_filled > Decimal::ZERO {
            self.open_rate = entry_cost / entry_filled;
            self.stake_amount = entry_cost / self.leverage;
        }
    }

    /// Absolute stoploss price for a reference rate and percentage.
    fn stoploss_price(&self, rate: Decimal, pct: Decimal) -> Decimal {
        match self.direction {
            TradeDirection::Long => rate * (Decimal::ONE - pct),
            TradeDirection::Short => rate * (Decimal::ONE + pct),
        }
    }

    /// Fix the initial stoploss once entry is confirmed. Subsequent calls
    /// leave the initial values untouched.
    pub fn set_initial_stoploss(&mut self, pct: Decimal) {
        let price = self.stoploss_price(self.open_rate, pct);
        if self.initial_stoploss.is_none() {
            self.initial_stoploss = Some(price);
            self.initial_stoploss_pct = Some(pct);
        }
        if self.stoploss.is_none() {
            self.stoploss = Some(price);
            self.stoploss_pct = Some(pct);
        }
    }

    /// Ratchet the stoploss toward a new reference rate.
    ///
    /// The stoploss never moves against the position: for a long it only
    /// increases, for a short it only decreases. Returns whether it moved.
    pub fn adjust_stoploss(&mut self, reference_rate: Decimal, pct: Decimal) -> bool {
        let candidate = self.stoploss_price(reference_rate, pct);
        let moved = match (self.direction, self.stoploss) {
            (_, None) => true,
            (TradeDirection::Long, Some(current)) => candidate > current,
            (TradeDirection::Short, Some(current)) => candidate < current,
        };
        if moved {
            self.stoploss = Some(candidate);
            self.stoploss_pct = Some(pct);
        }
        moved
    }

    /// Explicit reset, the only path that may loosen a stoploss.
    pub fn reset_stoploss(&mut self, pct: Decimal) {
        self.stoploss = Some(self.stoploss_price(self.open_rate, pct));
        self.stoploss_pct = Some(pct);
    }

    /// True once the stoploss has ratcheted away from its initial value.
    pub fn stoploss_was_trailed(&self) -> bool {
        match (self.stoploss, self.initial_stoploss) {
            (Some(current), Some(initial)) => current != initial,
            _ => false,
        }
    }

    /// Whether the given rate breaches the current stoploss.
    pub fn stoploss_hit(&self, rate: Decimal) -> bool {
        match (self.direction, self.stoploss) {
            (TradeDirection::Long, Some(sl)) => rate <= sl,
            (TradeDirection::Short, Some(sl)) => rate >= sl,
            (_, None) => false,
        }
    }

    /// Profit ratio at the given rate, leverage-adjusted.
    pub fn profit_ratio(&self, rate: Decimal) -> Decimal {
        if self.open_rate.is_zero() {
            return Decimal::ZERO;
        }
        let raw = match self.direction {
            TradeDirection::Long => rate / self.open_rate - Decimal::ONE,
            TradeDirection::Short => Decimal::ONE - rate / self.open_rate,
        };
        raw * self.leverage
    }

    /// Absolute profit in quote currency at the given rate.
    pub fn profit_abs(&self, rate: Decimal) -> Decimal {
        self.profit_for_amount(rate, self.amount)
    }

    /// Absolute profit for an explicit quantity, e.g. the portion an exit
    /// order actually filled.
    pub fn profit_for_amount(&self, rate: Decimal, amount: Decimal) -> Decimal {
        match self.direction {
            TradeDirection::Long => (rate - self.open_rate) * amount,
            TradeDirection::Short => (self.open_rate - rate) * amount,
        }
    }

    /// Close the trade. Terminal; only called once the exit order (or the
    /// exchange-side stoploss) is confirmed fully filled.
    pub fn close(&mut self, rate: Decimal, reason: ExitReason) {
        self.state = TradeState::Closed;
        self.is_open = false;
        self.close_rate = Some(rate);
        self.close_profit = Some(self.profit_abs(rate));
        self.close_date = Some(Utc::now());
        if self.exit_reason.is_none() {
            self.exit_reason = Some(reason);
        }
        self.open_order_id = None;
    }
}
