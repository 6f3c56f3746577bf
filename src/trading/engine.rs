//! Position engine: the per-trade state machine.
//!
//! Opens trades sized by the allocator, submits and cancels entry and exit
//! orders, evaluates stepped position adjustments, applies the
//! stoploss/ROI/trailing rules and drives trades to closure. Fill
//! confirmation always arrives through the reconciler; the engine only ever
//! reacts to the ledger state it left behind.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::exchange::{ExchangeError, ExchangeGateway, RetryError, RetryPolicy, Ticker};
use crate::models::{
    ExitReason, Order, OrderKind, Trade, TradeDirection, TradeState,
};

use super::config::TradingConfig;
use super::strategy::PositionStrategy;
use super::wallets::{InsufficientCapital, Wallets};

/// Drives every trade through `PendingEntry -> Open -> PendingExit -> Closed`.
pub struct PositionEngine {
    config: Arc<TradingConfig>,
    db: Arc<Database>,
    gateway: Arc<dyn ExchangeGateway>,
    wallets: Arc<Wallets>,
    strategy: Arc<dyn PositionStrategy>,
    retry: RetryPolicy,
}

impl PositionEngine {
    pub fn new(
        config: Arc<TradingConfig>,
        db: Arc<Database>,
        gateway: Arc<dyn ExchangeGateway>,
        wallets: Arc<Wallets>,
        strategy: Arc<dyn PositionStrategy>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            config,
            db,
            gateway,
            wallets,
            strategy,
            retry,
        }
    }

    fn entry_rate(&self, direction: TradeDirection, ticker: &Ticker) -> Decimal {
        match direction {
            TradeDirection::Long => ticker.ask,
            TradeDirection::Short => ticker.bid,
        }
    }

    fn exit_rate(&self, direction: TradeDirection, ticker: &Ticker) -> Decimal {
        match direction {
            TradeDirection::Long => ticker.bid,
            TradeDirection::Short => ticker.ask,
        }
    }

    async fn ticker(&self, pair: &str) -> Result<Ticker> {
        let pair_owned = pair.to_string();
        self.retry
            .call("fetch_ticker", || self.gateway.fetch_ticker(&pair_owned))
            .await
            .with_context(|| format!("Failed to fetch ticker for {pair}"))
    }

    /// Evaluate a whitelist pair for a strategy-signalled entry.
    pub async fn evaluate_entry(&self, pair: &str) -> Result<Option<Trade>> {
        let ticker = self.ticker(pair).await?;
        let Some(direction) = self.strategy.entry_signal(pair, &ticker) else {
            return Ok(None);
        };
        self.try_enter(pair, direction, None, None, false).await
    }

    /// Open a new trade: size it, submit the entry order, persist
    /// `PendingEntry`. Returns `None` when entry conditions refuse the trade
    /// (locked pair, no slot, sizing refused, strategy veto, rejection).
    pub async fn try_enter(
        &self,
        pair: &str,
        direction: TradeDirection,
        price: Option<Decimal>,
        stake: Option<Decimal>,
        forced: bool,
    ) -> Result<Option<Trade>> {
        let now = Utc::now();

        if !forced && self.db.is_pair_locked(pair, now).await? {
            debug!(pair, "Pair is locked, skipping entry");
            return Ok(None);
        }
        if !self.db.get_open_trades_by_pair(pair).await?.is_empty() {
            debug!(pair, "Trade already open for pair, skipping entry");
            return Ok(None);
        }
        let open_count = self.db.open_trade_count().await?;
        if !forced && !self.config.entry_slot_available(open_count) {
            debug!(pair, open_count, "No open-trade slot available");
            return Ok(None);
        }

        let ticker = self.ticker(pair).await?;
        let rate = price.unwrap_or_else(|| self.entry_rate(direction, &ticker));
        if rate <= Decimal::ZERO {
            return Err(anyhow::anyhow!("entry rate for {pair} must be positive"));
        }

        let pair_owned = pair.to_string();
        let limits = self
            .retry
            .call("pair_limits", || self.gateway.pair_limits(&pair_owned))
            .await
            .context("Failed to fetch pair limits")?;

        let stake = match stake {
            Some(stake) => stake,
            None => {
                match self
                    .wallets
                    .stake_amount_for(pair, limits.min_stake, limits.max_stake)
                    .await
                {
                    Ok(stake) => stake,
                    Err(err) if err.downcast_ref::<InsufficientCapital>().is_some() => {
                        info!(pair, error = %err, "Entry skipped");
                        return Ok(None);
                    }
                    Err(err) => return Err(err),
                }
            }
        };
        let stake = self
            .strategy
            .size_position(pair, stake, limits.min_stake, limits.max_stake);
        if stake <= Decimal::ZERO {
            debug!(pair, "Sizing yielded no stake, skipping entry");
            return Ok(None);
        }

        if !self
            .strategy
            .confirm_trade_entry(pair, direction, stake, rate)
        {
            info!(pair, "Strategy declined the entry");
            return Ok(None);
        }

        let amount = stake * self.config.leverage / rate;
        let side = direction.entry_side();
        let exchange_order = match self
            .retry
            .call("create_order", || {
                self.gateway
                    .create_order(pair, side, OrderKind::Entry, amount, Some(rate))
            })
            .await
        {
            Ok(order) => order,
            Err(RetryError::Aborted(ExchangeError::Rejected(reason))) => {
                warn!(pair, reason, "Entry order rejected, trade discarded");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        let mut trade = Trade::new(
            pair,
            direction,
            stake,
            self.config.leverage,
            self.strategy.name(),
        );
        trade.open_order_id = Some(exchange_order.id.clone());

        let mut order = Order::new(0, side, OrderKind::Entry, Some(rate), amount);
        order.order_id = Some(exchange_order.id.clone());
        order.apply_update(
            exchange_order.status,
            exchange_order.filled,
            exchange_order.average,
        );

        self.db.create_trade_with_order(&mut trade, &mut order).await?;

        info!(
            pair,
            direction = direction.as_str(),
            %stake,
            %rate,
            order_id = %exchange_order.id,
            "Entry order submitted"
        );
        Ok(Some(trade))
    }

    /// Per-tick evaluation of one trade. Frozen trades and trades whose fill
    /// is still being reconciled are left alone.
    pub async fn manage_trade(&self, trade: &mut Trade) -> Result<()> {
        if trade.is_frozen {
            return Ok(());
        }

        match trade.state {
            TradeState::PendingEntry => self.maybe_replace_entry_order(trade).await,
            TradeState::Open => self.manage_open_trade(trade).await,
            // Awaiting exit-fill confirmation from the reconciler.
            TradeState::PendingExit => Ok(()),
            TradeState::Closed => Ok(()),
        }
    }

    async fn manage_open_trade(&self, trade: &mut Trade) -> Result<()> {
        let ticker = self.ticker(&trade.pair).await?;
        let rate = self.exit_rate(trade.direction, &ticker);

        self.update_trailing_stoploss(trade, rate).await?;
        self.maintain_stoploss_on_exchange(trade).await?;

        if let Some(reason) = self.evaluate_exit(trade, rate) {
            return self.submit_exit(trade, rate, reason, false).await;
        }

        if self.config.position_adjustment_enable && !trade.has_open_order() {
            self.maybe_increase_position(trade, rate).await?;
        }
        Ok(())
    }

    /// Risk control beats signals: stoploss is checked before ROI, ROI before
    /// the strategy's own exit signal.
    pub fn evaluate_exit(&self, trade: &Trade, rate: Decimal) -> Option<ExitReason> {
        let now = Utc::now();

        if trade.stoploss_hit(rate) {
            return Some(if trade.stoploss_was_trailed() {
                ExitReason::TrailingStop
            } else {
                ExitReason::Stoploss
            });
        }

        if let Some(threshold) = self.config.roi_threshold(trade.elapsed_minutes(now)) {
            if trade.profit_ratio(rate) >= threshold {
                return Some(ExitReason::Roi);
            }
        }

        if self.strategy.should_exit(trade, rate, now) {
            return Some(ExitReason::ExitSignal);
        }
        None
    }

    /// Ratchet the trailing stop once the activation offset is reached. The
    /// stoploss never loosens.
    async fn update_trailing_stoploss(&self, trade: &mut Trade, rate: Decimal) -> Result<()> {
        if !self.config.trailing_stop {
            return Ok(());
        }
        let Some(trail_pct) = self.config.trailing_stop_positive else {
            return Ok(());
        };
        if trade.profit_ratio(rate) < self.config.trailing_stop_positive_offset {
            return Ok(());
        }
        if trade.adjust_stoploss(rate, trail_pct) {
            debug!(
                pair = %trade.pair,
                stoploss = %trade.stoploss.unwrap_or_default(),
                "Trailing stop tightened"
            );
            self.db.update_trade(trade).await?;
        }
        Ok(())
    }

    /// Keep the exchange-side stoploss order mirroring the local price and
    /// amount; any local tightening cancels and resubmits it.
    async fn maintain_stoploss_on_exchange(&self, trade: &mut Trade) -> Result<()> {
        if !self.config.stoploss_on_exchange || trade.state != TradeState::Open {
            return Ok(());
        }
        let Some(stoploss_price) = trade.stoploss else {
            return Ok(());
        };
        if trade.amount <= Decimal::ZERO {
            return Ok(());
        }

        if let Some(order_id) = trade.stoploss_order_id.clone() {
            let trade_id = trade.id.context("Trade without id")?;
            let current = self.db.find_order_by_exchange_id(trade_id, &order_id).await?;
            let stale = match &current {
                Some(order) => {
                    order.price != Some(stoploss_price) || order.amount != trade.amount
                }
                None => true,
            };
            if !stale {
                return Ok(());
            }
            self.cancel_stoploss_order(trade, &order_id).await?;
        }

        self.place_stoploss_order(trade, stoploss_price).await
    }

    async fn place_stoploss_order(&self, trade: &mut Trade, price: Decimal) -> Result<()> {
        let side = trade.direction.exit_side();
        let pair = trade.pair.clone();
        let amount = trade.amount;
        let exchange_order = self
            .retry
            .call("create_order", || {
                self.gateway
                    .create_order(&pair, side, OrderKind::Stoploss, amount, Some(price))
            })
            .await
            .context("Failed to place exchange-side stoploss")?;

        let trade_id = trade.id.context("Trade without id")?;
        let mut order = Order::new(trade_id, side, OrderKind::Stoploss, Some(price), amount);
        order.order_id = Some(exchange_order.id.clone());
        self.db.insert_order(&mut order).await?;

        trade.stoploss_order_id = Some(exchange_order.id.clone());
        self.db.update_trade(trade).await?;

        info!(
            pair = %trade.pair,
            %price,
            order_id = %exchange_order.id,
            "Exchange-side stoploss placed"
        );
        Ok(())
    }

    /// Cancel the resting stoploss order. An already-closed/not-found outcome
    /// counts as success; anything else must settle before any local exit
    /// path is used.
    async fn cancel_stoploss_order(&self, trade: &mut Trade, order_id: &str) -> Result<()> {
        let pair = trade.pair.clone();
        let id = order_id.to_string();
        let outcome = self
            .retry
            .call("cancel_order", || self.gateway.cancel_order(&id, &pair))
            .await;

        match outcome {
            Ok(canceled) => {
                let trade_id = trade.id.context("Trade without id")?;
                if let Some(mut local) =
                    self.db.find_order_by_exchange_id(trade_id, order_id).await?
                {
                    local.apply_update(canceled.status, canceled.filled, canceled.average);
                    self.db.update_order(&local).await?;
                }
            }
            Err(RetryError::Aborted(ExchangeError::OrderNotFound { .. })) => {
                debug!(order_id, "Stoploss order already gone on exchange");
            }
            Err(err) => return Err(err.into()),
        }

        trade.stoploss_order_id = None;
        self.db.update_trade(trade).await?;
        Ok(())
    }

    /// Submit the closing order for the full remaining amount and move the
    /// trade to `PendingExit`. The exchange-side stoploss is cancelled first
    /// and must settle before the exit order goes out.
    pub async fn submit_exit(
        &self,
        trade: &mut Trade,
        rate: Decimal,
        reason: ExitReason,
        forced: bool,
    ) -> Result<()> {
        if trade.has_open_order() {
            debug!(pair = %trade.pair, "Order already in flight, exit deferred");
            return Ok(());
        }
        if !forced && !self.strategy.confirm_trade_exit(trade, reason, rate) {
            info!(pair = %trade.pair, reason = reason.as_str(), "Strategy declined the exit");
            return Ok(());
        }

        if let Some(stoploss_id) = trade.stoploss_order_id.clone() {
            self.cancel_stoploss_order(trade, &stoploss_id).await?;
        }

        let amount = trade.amount;
        if amount <= Decimal::ZERO {
            warn!(pair = %trade.pair, "Nothing to exit, closing trade");
            trade.close(rate, reason);
            return Ok(self.db.update_trade(trade).await?);
        }

        let side = trade.direction.exit_side();
        let pair = trade.pair.clone();
        let price = if forced { None } else { Some(rate) };
        let exchange_order = match self
            .retry
            .call("create_order", || {
                self.gateway
                    .create_order(&pair, side, OrderKind::Exit, amount, price)
            })
            .await
        {
            Ok(order) => order,
            Err(RetryError::Aborted(ExchangeError::Rejected(rejection))) => {
                warn!(pair = %trade.pair, rejection, "Exit order rejected, trade stays open");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let trade_id = trade.id.context("Trade without id")?;
        let mut order = Order::new(trade_id, side, OrderKind::Exit, price, amount);
        order.order_id = Some(exchange_order.id.clone());
        order.apply_update(
            exchange_order.status,
            exchange_order.filled,
            exchange_order.average,
        );

        trade.state = TradeState::PendingExit;
        trade.exit_reason = Some(reason);
        trade.open_order_id = Some(exchange_order.id.clone());

        self.db.insert_order(&mut order).await?;
        self.db.update_trade_with_order(trade, &order).await?;

        info!(
            pair = %trade.pair,
            reason = reason.as_str(),
            %amount,
            %rate,
            order_id = %exchange_order.id,
            "Exit order submitted"
        );
        Ok(())
    }

    /// DCA increase: ask the strategy for additional stake and submit another
    /// entry-side order. Only reachable when the trade is `Open` with no
    /// in-flight order.
    async fn maybe_increase_position(&self, trade: &mut Trade, rate: Decimal) -> Result<()> {
        let available = self.wallets.get_available_stake_amount().await?;
        let profit = trade.profit_ratio(rate);
        let Some(extra_stake) = self
            .strategy
            .adjust_position(trade, rate, profit, available)
        else {
            return Ok(());
        };
        if extra_stake <= Decimal::ZERO {
            return Ok(());
        }

        let pair = trade.pair.clone();
        let limits = self
            .retry
            .call("pair_limits", || self.gateway.pair_limits(&pair))
            .await
            .context("Failed to fetch pair limits")?;
        let stake = self.wallets.validate_stake_amount(
            &trade.pair,
            extra_stake,
            limits.min_stake,
            limits.max_stake,
            available,
        );
        if stake <= Decimal::ZERO {
            debug!(pair = %trade.pair, "Position adjustment refused by sizing");
            return Ok(());
        }

        let amount = stake * trade.leverage / rate;
        let side = trade.direction.entry_side();
        let exchange_order = match self
            .retry
            .call("create_order", || {
                self.gateway
                    .create_order(&pair, side, OrderKind::Entry, amount, Some(rate))
            })
            .await
        {
            Ok(order) => order,
            Err(RetryError::Aborted(ExchangeError::Rejected(reason))) => {
                warn!(pair = %trade.pair, reason, "Adjustment order rejected");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let trade_id = trade.id.context("Trade without id")?;
        let mut order = Order::new(trade_id, side, OrderKind::Entry, Some(rate), amount);
        order.order_id = Some(exchange_order.id.clone());
        order.apply_update(
            exchange_order.status,
            exchange_order.filled,
            exchange_order.average,
        );

        trade.open_order_id = Some(exchange_order.id.clone());
        self.db.insert_order(&mut order).await?;
        self.db.update_trade_with_order(trade, &order).await?;

        info!(
            pair = %trade.pair,
            %stake,
            %rate,
            order_id = %exchange_order.id,
            "Position increased"
        );
        Ok(())
    }

    /// DCA price adjustment: cancel the unfilled entry order and resubmit at
    /// the strategy's revised price for the residual of the originally
    /// intended stake. A partial fill on the cancelled order is folded into
    /// the trade first, never silently discarded.
    async fn maybe_replace_entry_order(&self, trade: &mut Trade) -> Result<()> {
        if !self.config.position_adjustment_enable {
            return Ok(());
        }
        let Some(order_id) = trade.open_order_id.clone() else {
            return Ok(());
        };
        let trade_id = trade.id.context("Trade without id")?;
        let Some(local) = self.db.find_order_by_exchange_id(trade_id, &order_id).await? else {
            return Ok(());
        };
        if local.kind != OrderKind::Entry || local.is_terminal() {
            return Ok(());
        }

        let ticker = self.ticker(&trade.pair).await?;
        let rate = self.entry_rate(trade.direction, &ticker);
        let Some(new_price) = self.strategy.adjust_entry_price(trade, &local, rate) else {
            return Ok(());
        };
        if local.price == Some(new_price) {
            return Ok(());
        }

        let intended_stake = trade.stake_amount;

        // Cancel, folding whatever already filled.
        let pair = trade.pair.clone();
        let cancel_id = order_id.clone();
        let canceled = match self
            .retry
            .call("cancel_order", || {
                self.gateway.cancel_order(&cancel_id, &pair)
            })
            .await
        {
            Ok(order) => order,
            Err(RetryError::Aborted(ExchangeError::OrderNotFound { .. })) => {
                // The order vanished; reconciliation owns that divergence.
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let mut local = local;
        local.apply_update(canceled.status, canceled.filled, canceled.average);
        self.db.update_order(&local).await?;

        let orders = self.db.orders_for_trade(trade_id).await?;
        trade.recalculate_from_orders(&orders);
        trade.open_order_id = None;

        // The exchange filled it entirely before the cancel landed: nothing
        // to resubmit.
        if local.is_fully_filled() {
            self.confirm_entry_fill(trade);
            self.db.update_trade(trade).await?;
            return Ok(());
        }

        let folded_stake = trade.stake_amount;
        let residual_stake = (intended_stake - folded_stake).max(Decimal::ZERO);
        info!(
            pair = %trade.pair,
            %folded_stake,
            %residual_stake,
            %new_price,
            "Replacing entry order at adjusted price"
        );

        if residual_stake <= Decimal::ZERO {
            self.confirm_entry_fill(trade);
            self.db.update_trade(trade).await?;
            return Ok(());
        }

        let amount = residual_stake * trade.leverage / new_price;
        let side = trade.direction.entry_side();
        let exchange_order = match self
            .retry
            .call("create_order", || {
                self.gateway
                    .create_order(&pair, side, OrderKind::Entry, amount, Some(new_price))
            })
            .await
        {
            Ok(order) => order,
            Err(RetryError::Aborted(ExchangeError::Rejected(reason))) => {
                warn!(pair = %trade.pair, reason, "Replacement order rejected");
                // Keep whatever filled; an empty trade is discarded.
                if trade.amount <= Decimal::ZERO {
                    self.db.delete_trade(trade_id).await?;
                } else {
                    self.confirm_entry_fill(trade);
                    self.db.update_trade(trade).await?;
                }
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let mut order = Order::new(trade_id, side, OrderKind::Entry, Some(new_price), amount);
        order.order_id = Some(exchange_order.id.clone());
        order.apply_update(
            exchange_order.status,
            exchange_order.filled,
            exchange_order.average,
        );

        trade.open_order_id = Some(exchange_order.id.clone());
        self.db.insert_order(&mut order).await?;
        self.db.update_trade_with_order(trade, &order).await?;
        Ok(())
    }

    /// Transition a trade to `Open` once entry fills are in its aggregates,
    /// deriving the initial stoploss from the realized open rate.
    pub fn confirm_entry_fill(&self, trade: &mut Trade) {
        trade.state = TradeState::Open;
        if trade.initial_stoploss.is_none() {
            trade.set_initial_stoploss(self.strategy.stoploss_pct());
        }
    }

    /// Administrative exit: cancel anything in flight, fold partial fills,
    /// then market-exit the remainder.
    pub async fn force_exit(&self, trade: &mut Trade) -> Result<()> {
        let trade_id = trade.id.context("Trade without id")?;

        if let Some(order_id) = trade.open_order_id.clone() {
            let pair = trade.pair.clone();
            let cancel_id = order_id.clone();
            match self
                .retry
                .call("cancel_order", || {
                    self.gateway.cancel_order(&cancel_id, &pair)
                })
                .await
            {
                Ok(canceled) => {
                    if let Some(mut local) =
                        self.db.find_order_by_exchange_id(trade_id, &order_id).await?
                    {
                        local.apply_update(canceled.status, canceled.filled, canceled.average);
                        self.db.update_order(&local).await?;
                    }
                }
                Err(RetryError::Aborted(ExchangeError::OrderNotFound { .. })) => {
                    debug!(order_id, "In-flight order already gone on exchange");
                }
                Err(err) => return Err(err.into()),
            }
            let orders = self.db.orders_for_trade(trade_id).await?;
            trade.recalculate_from_orders(&orders);
            trade.open_order_id = None;
        }

        if trade.amount <= Decimal::ZERO {
            // Nothing ever filled: remove the trade instead of closing it.
            info!(pair = %trade.pair, "Force exit on unfilled trade, discarding");
            self.db.delete_trade(trade_id).await?;
            trade.state = TradeState::Closed;
            trade.is_open = false;
            return Ok(());
        }

        let ticker = self.ticker(&trade.pair).await?;
        let rate = self.exit_rate(trade.direction, &ticker);
        trade.state = TradeState::Open;
        self.submit_exit(trade, rate, ExitReason::ForceExit, true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::SimulatedExchange;
    use crate::models::OrderStatus;
    use crate::trading::config::StakeAmount;
    use chrono::{DateTime, Utc};
    use rust_decimal_macros::dec;
    use std::sync::Mutex;

    /// Strategy with externally scripted answers.
    struct ScriptedStrategy {
        stoploss: Decimal,
        exit_signal: Mutex<bool>,
        adjusted_price: Mutex<Option<Decimal>>,
        extra_stake: Mutex<Option<Decimal>>,
    }

    impl ScriptedStrategy {
        fn new() -> Self {
            Self {
                stoploss: dec!(0.10),
                exit_signal: Mutex::new(false),
                adjusted_price: Mutex::new(None),
                extra_stake: Mutex::new(None),
            }
        }
    }

    impl PositionStrategy for ScriptedStrategy {
        fn name(&self) -> &str {
            "scripted"
        }
        fn stoploss_pct(&self) -> Decimal {
            self.stoploss
        }
        fn entry_signal(&self, _pair: &str, _ticker: &Ticker) -> Option<TradeDirection> {
            None
        }
        fn should_exit(&self, _trade: &Trade, _rate: Decimal, _now: DateTime<Utc>) -> bool {
            *self.exit_signal.lock().unwrap()
        }
        fn adjust_entry_price(
            &self,
            _trade: &Trade,
            _order: &Order,
            _current_rate: Decimal,
        ) -> Option<Decimal> {
            *self.adjusted_price.lock().unwrap()
        }
        fn adjust_position(
            &self,
            _trade: &Trade,
            _current_rate: Decimal,
            _profit_ratio: Decimal,
            _available: Decimal,
        ) -> Option<Decimal> {
            *self.extra_stake.lock().unwrap()
        }
    }

    struct Harness {
        db: Arc<Database>,
        exchange: Arc<SimulatedExchange>,
        strategy: Arc<ScriptedStrategy>,
        engine: PositionEngine,
    }

    async fn harness(mut config: TradingConfig) -> Harness {
        config.stake_amount = StakeAmount::Fixed(dec!(100));
        let config = Arc::new(config);
        let db = Arc::new(Database::in_memory().await.unwrap());
        let exchange = Arc::new(SimulatedExchange::new("USDT", dec!(10000)));
        exchange.set_ticker("ETH/USDT", dec!(99), dec!(101)).await;

        let retry = RetryPolicy::immediate(2);
        let wallets = Arc::new(Wallets::new(
            config.clone(),
            db.clone(),
            exchange.clone(),
            retry.clone(),
        ));
        wallets.update(true).await.unwrap();

        let strategy = Arc::new(ScriptedStrategy::new());
        let engine = PositionEngine::new(
            config,
            db.clone(),
            exchange.clone(),
            wallets,
            strategy.clone(),
            retry,
        );
        Harness {
            db,
            exchange,
            strategy,
            engine,
        }
    }

    fn open_trade_at(rate: Decimal, amount: Decimal) -> Trade {
        let mut trade = Trade::new(
            "ETH/USDT",
            TradeDirection::Long,
            rate * amount,
            Decimal::ONE,
            "scripted",
        );
        trade.state = TradeState::Open;
        trade.open_rate = rate;
        trade.amount = amount;
        trade.set_initial_stoploss(dec!(0.10));
        trade
    }

    #[tokio::test]
    async fn entry_creates_pending_trade_with_single_order() {
        let h = harness(TradingConfig::default()).await;
        h.exchange.set_instant_fill(false).await;

        let trade = h
            .engine
            .try_enter("ETH/USDT", TradeDirection::Long, None, None, false)
            .await
            .unwrap()
            .expect("trade opened");

        assert_eq!(trade.state, TradeState::PendingEntry);
        assert!(trade.open_order_id.is_some());
        assert_eq!(trade.stake_amount, dec!(100));

        let orders = h.db.orders_for_trade(trade.id.unwrap()).await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].kind, OrderKind::Entry);

        // Second entry on the same pair is refused while one is open.
        let again = h
            .engine
            .try_enter("ETH/USDT", TradeDirection::Long, None, None, false)
            .await
            .unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn locked_pair_blocks_entry_unless_forced() {
        let h = harness(TradingConfig::default()).await;
        h.db.lock_pair("ETH/USDT", Utc::now() + chrono::Duration::minutes(5), None)
            .await
            .unwrap();

        let blocked = h
            .engine
            .try_enter("ETH/USDT", TradeDirection::Long, None, None, false)
            .await
            .unwrap();
        assert!(blocked.is_none());

        let forced = h
            .engine
            .try_enter("ETH/USDT", TradeDirection::Long, None, None, true)
            .await
            .unwrap();
        assert!(forced.is_some());
    }

    #[tokio::test]
    async fn exit_precedence_stoploss_beats_signal() {
        let h = harness(TradingConfig::default()).await;
        let trade = open_trade_at(dec!(100), dec!(1));

        // Both conditions true in the same evaluation: rate breaches the
        // stoploss and the strategy also wants out.
        *h.strategy.exit_signal.lock().unwrap() = true;
        let reason = h.engine.evaluate_exit(&trade, dec!(89)).unwrap();
        assert_eq!(reason, ExitReason::Stoploss);

        // Signal alone yields the signal reason.
        let reason = h.engine.evaluate_exit(&trade, dec!(100.5));
        assert_eq!(reason, Some(ExitReason::ExitSignal));
    }

    #[tokio::test]
    async fn roi_exit_uses_elapsed_schedule() {
        let config = TradingConfig::default(); // 0 -> 4%, 30 -> 2%, 60 -> 1%
        let h = harness(config).await;
        let mut trade = open_trade_at(dec!(100), dec!(1));

        // Fresh trade: +3% is below the 4% threshold.
        assert_eq!(h.engine.evaluate_exit(&trade, dec!(103)), None);

        // After 45 minutes the 30-minute rung (2%) applies.
        trade.open_date = Utc::now() - chrono::Duration::minutes(45);
        assert_eq!(h.engine.evaluate_exit(&trade, dec!(103)), Some(ExitReason::Roi));
    }

    #[tokio::test]
    async fn dca_increase_only_without_inflight_order() {
        let mut config = TradingConfig::default();
        config.position_adjustment_enable = true;
        let h = harness(config).await;
        h.exchange.set_instant_fill(false).await;

        let mut trade = open_trade_at(dec!(100), dec!(1));
        h.db.insert_trade(&mut trade).await.unwrap();
        *h.strategy.extra_stake.lock().unwrap() = Some(dec!(50));

        h.engine.manage_trade(&mut trade).await.unwrap();
        assert!(trade.open_order_id.is_some());
        let orders = h.db.orders_for_trade(trade.id.unwrap()).await.unwrap();
        assert_eq!(orders.len(), 1);

        // A second evaluation while the adjustment order is in flight must
        // not submit another one.
        h.engine.manage_trade(&mut trade).await.unwrap();
        let orders = h.db.orders_for_trade(trade.id.unwrap()).await.unwrap();
        assert_eq!(orders.len(), 1, "single in-flight order invariant");
    }

    #[tokio::test]
    async fn price_adjustment_folds_partial_fill_and_resubmits_residual() {
        let mut config = TradingConfig::default();
        config.position_adjustment_enable = true;
        let h = harness(config).await;
        h.exchange.set_instant_fill(false).await;

        let trade = h
            .engine
            .try_enter("ETH/USDT", TradeDirection::Long, Some(dec!(100)), None, false)
            .await
            .unwrap()
            .unwrap();
        let trade_id = trade.id.unwrap();
        let order_id = trade.open_order_id.clone().unwrap();

        // Stake 100 at 100 => amount 1. A quarter fills before the repricing.
        h.exchange.fill_order(&order_id, dec!(0.25), dec!(100)).await;
        *h.strategy.adjusted_price.lock().unwrap() = Some(dec!(99));

        let mut trade = h.db.get_trade(trade_id).await.unwrap().unwrap();
        h.engine.manage_trade(&mut trade).await.unwrap();

        // The partial fill is folded in, never discarded.
        assert_eq!(trade.amount, dec!(0.25));
        assert_eq!(trade.open_rate, dec!(100));

        // The replacement is sized to the residual stake at the new price.
        let orders = h.db.orders_for_trade(trade_id).await.unwrap();
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[0].status, OrderStatus::Canceled);
        let replacement = &orders[1];
        assert_eq!(replacement.price, Some(dec!(99)));
        assert_eq!(replacement.amount, dec!(75) / dec!(99));
        assert_eq!(trade.open_order_id, replacement.order_id);

        // Once it fills, the stake adds up to the originally intended 100.
        h.exchange
            .fill_order(replacement.order_id.as_deref().unwrap(), replacement.amount, dec!(99))
            .await;
        let mut replacement = replacement.clone();
        replacement.apply_update(OrderStatus::Closed, replacement.amount, Some(dec!(99)));
        h.db.update_order(&replacement).await.unwrap();

        let orders = h.db.orders_for_trade(trade_id).await.unwrap();
        trade.recalculate_from_orders(&orders);
        assert!((trade.stake_amount - dec!(100)).abs() < dec!(0.0000001));
    }

    #[tokio::test]
    async fn exchange_stoploss_is_replaced_when_tightened() {
        let mut config = TradingConfig::default();
        config.stoploss_on_exchange = true;
        config.trailing_stop = true;
        config.trailing_stop_positive = Some(dec!(0.05));
        config.trailing_stop_positive_offset = Decimal::ZERO;
        // Keep ROI out of the way so only the stoploss machinery acts here.
        config.minimal_roi.clear();
        let h = harness(config).await;

        let mut trade = open_trade_at(dec!(100), dec!(1));
        h.db.insert_trade(&mut trade).await.unwrap();

        // First pass places the stoploss order at the initial stop.
        h.engine.maintain_stoploss_on_exchange(&mut trade).await.unwrap();
        let first_id = trade.stoploss_order_id.clone().unwrap();

        // Price moves up; the trailing ratchet tightens the stop, so the
        // resting order must be cancelled and resubmitted.
        h.exchange.set_ticker("ETH/USDT", dec!(120), dec!(121)).await;
        h.engine.manage_trade(&mut trade).await.unwrap();

        let second_id = trade.stoploss_order_id.clone().unwrap();
        assert_ne!(first_id, second_id);
        assert_eq!(trade.stoploss, Some(dec!(120) * dec!(0.95)));

        let old = h
            .db
            .find_order_by_exchange_id(trade.id.unwrap(), &first_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(old.status, OrderStatus::Canceled);
    }

    #[tokio::test]
    async fn exit_cancels_exchange_stoploss_first() {
        let mut config = TradingConfig::default();
        config.stoploss_on_exchange = true;
        let h = harness(config).await;
        h.exchange.set_instant_fill(false).await;

        let mut trade = open_trade_at(dec!(100), dec!(1));
        h.db.insert_trade(&mut trade).await.unwrap();
        h.engine.maintain_stoploss_on_exchange(&mut trade).await.unwrap();
        let stoploss_id = trade.stoploss_order_id.clone().unwrap();

        h.engine
            .submit_exit(&mut trade, dec!(105), ExitReason::ExitSignal, false)
            .await
            .unwrap();

        assert_eq!(trade.state, TradeState::PendingExit);
        assert!(trade.stoploss_order_id.is_none());
        let old = h
            .db
            .find_order_by_exchange_id(trade.id.unwrap(), &stoploss_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(old.status, OrderStatus::Canceled);
    }

    #[tokio::test]
    async fn force_exit_discards_unfilled_trade() {
        let h = harness(TradingConfig::default()).await;
        h.exchange.set_instant_fill(false).await;

        let mut trade = h
            .engine
            .try_enter("ETH/USDT", TradeDirection::Long, None, None, false)
            .await
            .unwrap()
            .unwrap();
        let trade_id = trade.id.unwrap();

        h.engine.force_exit(&mut trade).await.unwrap();
        assert!(h.db.get_trade(trade_id).await.unwrap().is_none());
    }
}
