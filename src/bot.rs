//! Bot runner: the control loop plus the administrative surface.
//!
//! One tick runs reconcile -> refresh wallets -> evaluate open trades ->
//! evaluate entries, strictly in that order and strictly sequentially per
//! trade, so every sizing decision observes the ledger effects of the
//! submission before it. Administrative commands (force entry/exit, delete,
//! pair locks, status) go through the same ledger handle and are serialized
//! against the loop at its tick boundary.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::db::Database;
use crate::exchange::{ExchangeGateway, RetryPolicy, SimulatedExchange};
use crate::models::{PairLock, Trade, TradeDirection, TradeState};
use crate::trading::{
    ConfigurationFatal, PositionEngine, Reconciler, StrategyRegistry, TradingConfig, Wallets,
};

/// Structured failures surfaced to the administrative/RPC layer.
#[derive(Debug, Error)]
pub enum AdminError {
    #[error("pair {0} already has an open trade")]
    AlreadyOpen(String),

    #[error("trade {0} not found")]
    TradeNotFound(i64),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("trader is not running")]
    NotRunning,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Read-only trade summary for the status surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TradeView {
    pub id: i64,
    pub pair: String,
    pub direction: String,
    pub state: String,
    pub amount: Decimal,
    pub open_rate: Decimal,
    pub stake_amount: Decimal,
    pub stoploss: Option<Decimal>,
    pub is_frozen: bool,
    pub exit_reason: Option<String>,
    pub open_date: DateTime<Utc>,
    /// Profit at the current ticker, when one is available.
    pub current_profit_ratio: Option<Decimal>,
}

impl std::fmt::Display for TradeView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "#{:<4} {:<12} {:<5} {:<13} amount={} open_rate={} stake={}",
            self.id, self.pair, self.direction, self.state, self.amount, self.open_rate,
            self.stake_amount
        )?;
        if let Some(profit) = self.current_profit_ratio {
            write!(f, " profit={:.4}", profit)?;
        }
        if self.is_frozen {
            write!(f, " [FROZEN]")?;
        }
        Ok(())
    }
}

/// Connect to the ledger store with bounded backoff and jitter. Running out
/// of attempts is a process-level configuration failure.
pub async fn connect_store(database_url: &str) -> Result<Database> {
    let mut backoff = ExponentialBackoff {
        current_interval: Duration::from_millis(200),
        initial_interval: Duration::from_millis(200),
        max_interval: Duration::from_secs(5),
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    };
    let mut attempts_left = 5u32;

    loop {
        match Database::connect(database_url).await {
            Ok(db) => return Ok(db),
            Err(err) if attempts_left > 1 => {
                attempts_left -= 1;
                let delay = backoff.next_backoff().unwrap_or(Duration::from_secs(5));
                warn!(
                    error = %err,
                    attempts_left,
                    delay_ms = delay.as_millis() as u64,
                    "Store connection failed, reconnecting"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                return Err(anyhow::Error::new(ConfigurationFatal(format!(
                    "store unreachable at {database_url}: {err}"
                ))));
            }
        }
    }
}

/// The trading engine's process-wide context: owns the ledger handle, the
/// gateway, and the component wiring, constructed once at startup.
pub struct Bot {
    config: Arc<TradingConfig>,
    db: Arc<Database>,
    gateway: Arc<dyn ExchangeGateway>,
    wallets: Arc<Wallets>,
    engine: PositionEngine,
    reconciler: Reconciler,
    shutdown: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
}

impl Bot {
    /// Build a bot for the configured mode. Dry-run gets the simulated
    /// gateway; live trading requires an externally supplied adapter via
    /// [`Bot::with_gateway`].
    pub async fn new(config: TradingConfig) -> Result<Self> {
        if !config.dry_run {
            return Err(anyhow::Error::new(ConfigurationFatal(
                "live trading requires an exchange gateway adapter; use Bot::with_gateway"
                    .to_string(),
            )));
        }
        let gateway: Arc<dyn ExchangeGateway> = Arc::new(SimulatedExchange::new(
            config.stake_currency.clone(),
            config.dry_run_wallet,
        ));
        Self::with_gateway(config, gateway).await
    }

    /// Build a bot around an explicit gateway.
    pub async fn with_gateway(
        config: TradingConfig,
        gateway: Arc<dyn ExchangeGateway>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let db = Arc::new(connect_store(&config.database_url).await?);

        let registry = StrategyRegistry::builtin(&config);
        let strategy = registry.resolve(&config.strategy)?;

        let retry = RetryPolicy::default();
        let wallets = Arc::new(Wallets::new(
            config.clone(),
            db.clone(),
            gateway.clone(),
            retry.clone(),
        ));
        let engine = PositionEngine::new(
            config.clone(),
            db.clone(),
            gateway.clone(),
            wallets.clone(),
            strategy.clone(),
            retry.clone(),
        );
        let reconciler = Reconciler::new(db.clone(), gateway.clone(), strategy, retry);

        Ok(Self {
            config,
            db,
            gateway,
            wallets,
            engine,
            reconciler,
            shutdown: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn shutdown_signal(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn db(&self) -> Arc<Database> {
        self.db.clone()
    }

    /// Main run loop at the configured tick interval.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            dry_run = self.config.dry_run,
            tick_interval = self.config.tick_interval_secs,
            strategy = %self.config.strategy,
            "Starting control loop"
        );
        self.running.store(true, Ordering::SeqCst);
        self.wallets.update(true).await?;

        let mut tick_interval = interval(Duration::from_secs(self.config.tick_interval_secs));

        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
        });

        // The stop flag is only consulted between ticks, so an in-flight
        // submission or cancellation always finishes before the loop halts.
        while !self.shutdown.load(Ordering::SeqCst) {
            tick_interval.tick().await;
            if let Err(err) = self.tick().await {
                error!(error = %err, "Cycle failed");
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!("Control loop stopped");
        Ok(())
    }

    /// One control-loop cycle: reconcile, refresh, evaluate, enter.
    pub async fn tick(&self) -> Result<()> {
        let report = self.reconciler.sync_all().await?;
        if report.divergences > 0 {
            warn!(
                divergences = report.divergences,
                "Trades frozen pending operator action"
            );
        }

        self.wallets.update(false).await?;

        for mut trade in self.db.get_open_trades().await? {
            if trade.is_frozen {
                continue;
            }
            if let Err(err) = self.engine.manage_trade(&mut trade).await {
                warn!(
                    pair = %trade.pair,
                    trade_id = trade.id.unwrap_or_default(),
                    error = %err,
                    "Trade evaluation failed, continuing with next trade"
                );
            }
        }

        for pair in &self.config.whitelist {
            let open_count = self.db.open_trade_count().await?;
            if !self.config.entry_slot_available(open_count) {
                break;
            }
            if let Err(err) = self.engine.evaluate_entry(pair).await {
                warn!(pair = %pair, error = %err, "Entry evaluation failed");
            }
        }

        Ok(())
    }

    // ==================== Administrative surface ====================

    /// Force-entry on a pair, bypassing the signal but not the sizing.
    pub async fn enter(
        &self,
        pair: &str,
        direction: TradeDirection,
        price: Option<Decimal>,
        stake: Option<Decimal>,
    ) -> Result<Trade, AdminError> {
        // Once a stop has been requested, no new positions are accepted.
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(AdminError::NotRunning);
        }
        if !self
            .db
            .get_open_trades_by_pair(pair)
            .await
            .map_err(AdminError::Internal)?
            .is_empty()
        {
            return Err(AdminError::AlreadyOpen(pair.to_string()));
        }
        if let Some(stake) = stake {
            if stake <= Decimal::ZERO {
                return Err(AdminError::InvalidArgument(format!(
                    "stake must be positive, got {stake}"
                )));
            }
        }

        match self
            .engine
            .try_enter(pair, direction, price, stake, true)
            .await
        {
            Ok(Some(trade)) => Ok(trade),
            Ok(None) => Err(AdminError::InvalidArgument(format!(
                "entry on {pair} was refused (sizing or strategy confirmation)"
            ))),
            Err(err) => Err(AdminError::Internal(err)),
        }
    }

    /// Force-exit one trade or, with `"all"`, every open trade. Frozen
    /// trades are thawed by the explicit operator action. Returns how many
    /// trades were exited.
    pub async fn force_exit(&self, target: &str) -> Result<usize, AdminError> {
        let mut trades = if target == "all" {
            self.db.get_open_trades().await.map_err(AdminError::Internal)?
        } else {
            let id: i64 = target
                .parse()
                .map_err(|_| AdminError::InvalidArgument(format!("invalid trade id {target:?}")))?;
            let trade = self
                .db
                .get_trade(id)
                .await
                .map_err(AdminError::Internal)?
                .ok_or(AdminError::TradeNotFound(id))?;
            if !trade.is_open {
                return Err(AdminError::InvalidArgument(format!(
                    "trade {id} is already closed"
                )));
            }
            vec![trade]
        };

        let mut exited = 0usize;
        for trade in trades.iter_mut() {
            if trade.is_frozen {
                info!(pair = %trade.pair, "Thawing frozen trade for forced exit");
                trade.is_frozen = false;
                self.db.update_trade(trade).await.map_err(AdminError::Internal)?;
            }
            self.engine
                .force_exit(trade)
                .await
                .map_err(AdminError::Internal)?;
            exited += 1;
        }
        Ok(exited)
    }

    /// Delete a trade from the ledger, cancelling whatever is still resting
    /// on the exchange. Returns the number of cancellations issued.
    pub async fn delete_trade(&self, id: i64) -> Result<usize, AdminError> {
        let trade = self
            .db
            .get_trade(id)
            .await
            .map_err(AdminError::Internal)?
            .ok_or(AdminError::TradeNotFound(id))?;

        for order_id in [&trade.open_order_id, &trade.stoploss_order_id]
            .into_iter()
            .flatten()
        {
            if let Err(err) = self.gateway.cancel_order(order_id, &trade.pair).await {
                warn!(order_id, error = %err, "Cancel during delete failed, continuing");
            }
        }

        self.db.delete_trade(id).await.map_err(AdminError::Internal)
    }

    pub async fn lock(
        &self,
        pair: &str,
        until: DateTime<Utc>,
        reason: Option<&str>,
    ) -> Result<PairLock, AdminError> {
        if until <= Utc::now() {
            return Err(AdminError::InvalidArgument(
                "lock expiry must be in the future".to_string(),
            ));
        }
        self.db
            .lock_pair(pair, until, reason)
            .await
            .map_err(AdminError::Internal)
    }

    /// Unlock by numeric lock id or by pair name. Returns how many locks
    /// were released.
    pub async fn unlock(&self, target: &str) -> Result<usize, AdminError> {
        if let Ok(id) = target.parse::<i64>() {
            let released = self.db.unlock_by_id(id).await.map_err(AdminError::Internal)?;
            return Ok(usize::from(released));
        }
        let released = self
            .db
            .unlock_pair(target)
            .await
            .map_err(AdminError::Internal)?;
        Ok(released as usize)
    }

    /// Read-only view of all open trades, for the status surface.
    pub async fn status(&self) -> Result<Vec<TradeView>, AdminError> {
        let trades = self.db.get_open_trades().await.map_err(AdminError::Internal)?;
        let mut views = Vec::with_capacity(trades.len());
        for trade in trades {
            let current_profit_ratio = match self.gateway.fetch_ticker(&trade.pair).await {
                Ok(ticker) if trade.state != TradeState::PendingEntry => {
                    let rate = match trade.direction {
                        TradeDirection::Long => ticker.bid,
                        TradeDirection::Short => ticker.ask,
                    };
                    Some(trade.profit_ratio(rate))
                }
                _ => None,
            };
            views.push(TradeView {
                id: trade.id.unwrap_or_default(),
                pair: trade.pair.clone(),
                direction: trade.direction.as_str().to_string(),
                state: trade.state.as_str().to_string(),
                amount: trade.amount,
                open_rate: trade.open_rate,
                stake_amount: trade.stake_amount,
                stoploss: trade.stoploss,
                is_frozen: trade.is_frozen,
                exit_reason: trade.exit_reason.map(|r| r.as_str().to_string()),
                open_date: trade.open_date,
                current_profit_ratio,
            });
        }
        Ok(views)
    }

    /// Current open-trade count against the configured maximum.
    pub async fn count(&self) -> Result<(i64, i64), AdminError> {
        let current = self.db.open_trade_count().await.map_err(AdminError::Internal)?;
        Ok((current, self.config.max_open_trades))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderStatus;
    use crate::trading::StakeAmount;
    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;

    async fn test_bot() -> (Bot, Arc<SimulatedExchange>) {
        let exchange = Arc::new(SimulatedExchange::new("USDT", dec!(10000)));
        exchange.set_ticker("ETH/USDT", dec!(99), dec!(101)).await;
        exchange.set_ticker("BTC/USDT", dec!(49900), dec!(50100)).await;

        let config = TradingConfig {
            stake_amount: StakeAmount::Fixed(dec!(100)),
            database_url: "sqlite::memory:".to_string(),
            ..TradingConfig::default()
        };
        // In-memory pools need a single connection; swap the store in.
        let bot = Bot::with_gateway_for_tests(config, exchange.clone())
            .await
            .unwrap();
        (bot, exchange)
    }

    impl Bot {
        /// Test constructor with an in-memory single-connection store.
        async fn with_gateway_for_tests(
            config: TradingConfig,
            gateway: Arc<SimulatedExchange>,
        ) -> Option<Self> {
            config.validate().ok()?;
            let config = Arc::new(config);
            let db = Arc::new(Database::in_memory().await.ok()?);

            let registry = StrategyRegistry::builtin(&config);
            let strategy = registry.resolve(&config.strategy).ok()?;
            let gateway: Arc<dyn ExchangeGateway> = gateway;

            let retry = RetryPolicy::default();
            let wallets = Arc::new(Wallets::new(
                config.clone(),
                db.clone(),
                gateway.clone(),
                retry.clone(),
            ));
            let engine = PositionEngine::new(
                config.clone(),
                db.clone(),
                gateway.clone(),
                wallets.clone(),
                strategy.clone(),
                retry.clone(),
            );
            let reconciler = Reconciler::new(db.clone(), gateway.clone(), strategy, retry);

            Some(Self {
                config,
                db,
                gateway,
                wallets,
                engine,
                reconciler,
                shutdown: Arc::new(AtomicBool::new(false)),
                running: Arc::new(AtomicBool::new(false)),
            })
        }
    }

    #[tokio::test]
    async fn forced_entry_then_tick_confirms_fill() {
        let (bot, _exchange) = test_bot().await;
        bot.wallets.update(true).await.unwrap();

        let trade = bot
            .enter("ETH/USDT", TradeDirection::Long, None, None)
            .await
            .unwrap();
        assert_eq!(trade.state, TradeState::PendingEntry);

        // Instant fill on the simulated gateway: the next tick reconciles
        // the fill and the trade opens.
        bot.tick().await.unwrap();
        let synced = bot.db.get_trade(trade.id.unwrap()).await.unwrap().unwrap();
        assert_eq!(synced.state, TradeState::Open);
        assert!(synced.stoploss.is_some());

        // Entering the same pair again is refused with a structured error.
        let err = bot
            .enter("ETH/USDT", TradeDirection::Long, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AdminError::AlreadyOpen(_)));
    }

    #[tokio::test]
    async fn force_exit_all_closes_positions() {
        let (bot, _exchange) = test_bot().await;
        bot.wallets.update(true).await.unwrap();

        bot.enter("ETH/USDT", TradeDirection::Long, None, None)
            .await
            .unwrap();
        bot.enter("BTC/USDT", TradeDirection::Long, None, None)
            .await
            .unwrap();
        bot.tick().await.unwrap();

        let exited = bot.force_exit("all").await.unwrap();
        assert_eq!(exited, 2);

        bot.tick().await.unwrap();
        assert_eq!(bot.db.open_trade_count().await.unwrap(), 0);
        for trade_views in bot.status().await.unwrap() {
            panic!("no open trades expected, found {trade_views}");
        }
    }

    #[tokio::test]
    async fn force_exit_unknown_trade_is_structured_error() {
        let (bot, _exchange) = test_bot().await;
        assert!(matches!(
            bot.force_exit("9999").await.unwrap_err(),
            AdminError::TradeNotFound(9999)
        ));
        assert!(matches!(
            bot.force_exit("not-a-number").await.unwrap_err(),
            AdminError::InvalidArgument(_)
        ));
    }

    #[tokio::test]
    async fn delete_trade_reports_cancellations() {
        let (bot, exchange) = test_bot().await;
        bot.wallets.update(true).await.unwrap();
        exchange.set_instant_fill(false).await;

        let trade = bot
            .enter("ETH/USDT", TradeDirection::Long, Some(dec!(95)), None)
            .await
            .unwrap();
        let order_id = trade.open_order_id.clone().unwrap();

        let cancelled = bot.delete_trade(trade.id.unwrap()).await.unwrap();
        assert_eq!(cancelled, 1);

        // The resting order was cancelled on the exchange too.
        let order = exchange.fetch_order(&order_id, "ETH/USDT").await.unwrap();
        assert_eq!(order.status, OrderStatus::Canceled);
    }

    #[tokio::test]
    async fn locked_pair_refuses_loop_entries_until_unlock() {
        let (bot, _exchange) = test_bot().await;
        let until = Utc::now() + ChronoDuration::minutes(30);

        bot.lock("ETH/USDT", until, Some("manual cooldown")).await.unwrap();
        assert!(bot.db.is_pair_locked("ETH/USDT", Utc::now()).await.unwrap());

        let released = bot.unlock("ETH/USDT").await.unwrap();
        assert_eq!(released, 1);
        assert!(!bot.db.is_pair_locked("ETH/USDT", Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn entries_refused_after_stop_requested() {
        let (bot, _exchange) = test_bot().await;
        bot.wallets.update(true).await.unwrap();

        bot.shutdown_signal().store(true, Ordering::SeqCst);
        let err = bot
            .enter("ETH/USDT", TradeDirection::Long, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AdminError::NotRunning));
    }

    #[tokio::test]
    async fn count_reports_current_versus_max() {
        let (bot, _exchange) = test_bot().await;
        bot.wallets.update(true).await.unwrap();

        bot.enter("ETH/USDT", TradeDirection::Long, None, None)
            .await
            .unwrap();
        let (current, max) = bot.count().await.unwrap();
        assert_eq!(current, 1);
        assert_eq!(max, 3);
    }
}
