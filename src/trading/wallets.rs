//! Wallet snapshots and capital allocation.
//!
//! Balances are refreshed from the gateway on a throttled cadence and held as
//! a per-currency snapshot. Every sizing decision recomputes the deployable
//! capital from the snapshot plus the ledger (open stakes, realized profit);
//! nothing is cached between calls, so a realized loss on one trade
//! immediately reduces the stake offered to the next.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::exchange::{ExchangeGateway, RetryPolicy};
use crate::models::Wallet;

use super::config::{StakeAmount, TradingConfig};

/// Stake sizing could not fund an order at all.
#[derive(Debug, Clone, Error)]
#[error("insufficient capital: required {required}, available {available}")]
pub struct InsufficientCapital {
    pub required: Decimal,
    pub available: Decimal,
}

/// If a stake undershoots the exchange minimum by more than this factor the
/// order is refused instead of silently bumped up.
const MIN_STAKE_RESERVE_FACTOR: Decimal = dec!(1.3);

/// Balance book plus the capital-allocation rules.
pub struct Wallets {
    config: Arc<TradingConfig>,
    db: Arc<Database>,
    gateway: Arc<dyn ExchangeGateway>,
    retry: RetryPolicy,
    wallets: RwLock<HashMap<String, Wallet>>,
    last_refresh: RwLock<Option<Instant>>,
}

impl Wallets {
    pub fn new(
        config: Arc<TradingConfig>,
        db: Arc<Database>,
        gateway: Arc<dyn ExchangeGateway>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            config,
            db,
            gateway,
            retry,
            wallets: RwLock::new(HashMap::new()),
            last_refresh: RwLock::new(None),
        }
    }

    /// Refresh the snapshot from the gateway. Unless forced, the call is a
    /// no-op while the snapshot is younger than the refresh interval, to
    /// bound gateway call volume.
    pub async fn update(&self, force: bool) -> Result<()> {
        let interval = Duration::from_secs(self.config.wallet_refresh_interval_secs);
        {
            let last = self.last_refresh.read().await;
            if !force && last.map_or(false, |at| at.elapsed() < interval) {
                return Ok(());
            }
        }

        let balances = self
            .retry
            .call("get_balances", || self.gateway.get_balances())
            .await
            .context("Failed to refresh wallets")?;

        let snapshot: HashMap<String, Wallet> = balances
            .into_iter()
            .map(|(currency, b)| {
                (
                    currency.clone(),
                    Wallet::new(currency, b.free, b.used, b.total),
                )
            })
            .collect();

        debug!(currencies = snapshot.len(), "Wallets refreshed");
        *self.wallets.write().await = snapshot;
        *self.last_refresh.write().await = Some(Instant::now());
        Ok(())
    }

    pub async fn get_free(&self, currency: &str) -> Decimal {
        self.wallets
            .read()
            .await
            .get(currency)
            .map(|w| w.free)
            .unwrap_or(Decimal::ZERO)
    }

    pub async fn get_used(&self, currency: &str) -> Decimal {
        self.wallets
            .read()
            .await
            .get(currency)
            .map(|w| w.used)
            .unwrap_or(Decimal::ZERO)
    }

    pub async fn get_total(&self, currency: &str) -> Decimal {
        self.wallets
            .read()
            .await
            .get(currency)
            .map(|w| w.total)
            .unwrap_or(Decimal::ZERO)
    }

    /// Capital currently available for new stakes:
    /// `(tied_up + free) * tradable_balance_ratio - tied_up`, additionally
    /// capped by `available_capital + closed_profit - tied_up` when an
    /// absolute capital override is configured.
    pub async fn get_available_stake_amount(&self) -> Result<Decimal> {
        let tied_up = self.db.total_open_stake().await?;
        let free = self.get_free(&self.config.stake_currency).await;

        let mut available = (tied_up + free) * self.config.tradable_balance_ratio - tied_up;

        if let Some(capital) = self.config.available_capital {
            let closed_profit = self.db.total_closed_profit().await?;
            available = available.min(capital + closed_profit - tied_up);
        }

        Ok(available.max(Decimal::ZERO))
    }

    /// The balance the engine effectively started with: the configured
    /// absolute capital, or the current balance with realized profit backed
    /// out.
    pub async fn get_starting_balance(&self) -> Result<Decimal> {
        if let Some(capital) = self.config.available_capital {
            return Ok(capital);
        }
        let closed_profit = self.db.total_closed_profit().await?;
        let tied_up = self.db.total_open_stake().await?;
        let free = self.get_free(&self.config.stake_currency).await;
        Ok((free - closed_profit + tied_up) * self.config.tradable_balance_ratio)
    }

    /// Clip a proposed stake to the exchange limits and available capital.
    ///
    /// Order of operations: a minimum that cannot be funded at all fails
    /// closed to zero; a stake slightly below the minimum is bumped up to it,
    /// but one undershooting by more than the reserve factor is refused; the
    /// result is clamped to the exchange maximum and then to the available
    /// balance.
    pub fn validate_stake_amount(
        &self,
        pair: &str,
        stake: Decimal,
        min_stake: Option<Decimal>,
        max_stake: Option<Decimal>,
        available: Decimal,
    ) -> Decimal {
        let max_allowed = max_stake.map_or(available, |m| m.min(available));

        if let Some(min) = min_stake {
            if min > max_allowed {
                warn!(
                    pair,
                    %min,
                    %max_allowed,
                    "Minimum stake exceeds what is available, refusing entry"
                );
                return Decimal::ZERO;
            }
            if stake < min {
                if stake * MIN_STAKE_RESERVE_FACTOR < min {
                    warn!(
                        pair,
                        %stake,
                        %min,
                        "Stake is too far below the exchange minimum, refusing entry"
                    );
                    return Decimal::ZERO;
                }
                info!(pair, %stake, %min, "Raising stake to the exchange minimum");
                return min.min(max_allowed);
            }
        }

        stake.min(max_allowed)
    }

    /// Stake to commit to a new entry on `pair`.
    ///
    /// Recomputed fresh on every call from the wallet snapshot and ledger
    /// aggregates. Returns zero when sizing refuses the entry; returns an
    /// [`InsufficientCapital`] error when fixed-stake mode cannot fund the
    /// exchange minimum at all.
    pub async fn stake_amount_for(
        &self,
        pair: &str,
        min_stake: Option<Decimal>,
        max_stake: Option<Decimal>,
    ) -> Result<Decimal> {
        self.update(false).await?;

        let available = self.get_available_stake_amount().await?;

        let proposed = match self.config.stake_amount {
            StakeAmount::Fixed(amount) => {
                if let Some(min) = min_stake {
                    if available < min {
                        return Err(anyhow::Error::new(InsufficientCapital {
                            required: min,
                            available,
                        }));
                    }
                }
                if available <= Decimal::ZERO {
                    return Err(anyhow::Error::new(InsufficientCapital {
                        required: amount,
                        available,
                    }));
                }
                amount
            }
            StakeAmount::Unlimited => {
                let tied_up = self.db.total_open_stake().await?;
                self.unlimited_stake(available, tied_up, min_stake)
            }
        };

        Ok(self.validate_stake_amount(pair, proposed, min_stake, max_stake, available))
    }

    /// Unlimited-mode sizing: total deployable capital divided across the
    /// open-trade slots, clamped to what is still available.
    fn unlimited_stake(
        &self,
        available: Decimal,
        tied_up: Decimal,
        min_stake: Option<Decimal>,
    ) -> Decimal {
        let slots = self.config.max_open_trades;
        if slots == 0 {
            return Decimal::ZERO;
        }
        if slots < 0 {
            // No slot count to divide by: fall back to the minimum the
            // exchange will accept.
            return min_stake.unwrap_or(Decimal::ZERO).min(available);
        }
        let per_slot = (available + tied_up) / Decimal::from(slots);
        per_slot.min(available)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::SimulatedExchange;
    use crate::models::{ExitReason, Trade, TradeDirection};

    async fn setup(
        config: TradingConfig,
        free: Decimal,
    ) -> (Arc<Database>, Arc<SimulatedExchange>, Wallets) {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let exchange = Arc::new(SimulatedExchange::new("USDT", free));
        let wallets = Wallets::new(
            Arc::new(config),
            db.clone(),
            exchange.clone(),
            RetryPolicy::immediate(2),
        );
        wallets.update(true).await.unwrap();
        (db, exchange, wallets)
    }

    async fn open_trade(db: &Database, stake: Decimal) -> Trade {
        let mut trade =
            Trade::new("ETH/USDT", TradeDirection::Long, stake, Decimal::ONE, "default");
        trade.state = crate::models::TradeState::Open;
        db.insert_trade(&mut trade).await.unwrap();
        trade
    }

    fn unlimited_config(max_open_trades: i64) -> TradingConfig {
        TradingConfig {
            stake_amount: StakeAmount::Unlimited,
            max_open_trades,
            tradable_balance_ratio: Decimal::ONE,
            ..TradingConfig::default()
        }
    }

    #[tokio::test]
    async fn unlimited_stake_redistributes_evenly() {
        let (db, exchange, wallets) = setup(unlimited_config(4), dec!(1000)).await;

        // Four successive entries each get a quarter of the deployable
        // balance; the ledger effect of each submission is visible to the
        // next sizing call.
        for opened in 0..4u32 {
            let stake = wallets.stake_amount_for("ETH/USDT", None, None).await.unwrap();
            assert_eq!(stake, dec!(250), "entry {opened}");

            open_trade(&db, stake).await;
            let remaining = dec!(1000) - dec!(250) * Decimal::from(opened + 1);
            exchange
                .set_balance("USDT", remaining, dec!(1000) - remaining)
                .await;
            wallets.update(true).await.unwrap();
        }

        // All capital tied up: nothing left for a fifth entry.
        let stake = wallets.stake_amount_for("ETH/USDT", None, None).await.unwrap();
        assert_eq!(stake, Decimal::ZERO);
    }

    #[tokio::test]
    async fn realized_loss_reduces_next_stake() {
        let (db, exchange, wallets) = setup(unlimited_config(4), dec!(1000)).await;

        let mut trades = Vec::new();
        for _ in 0..4 {
            trades.push(open_trade(&db, dec!(250)).await);
        }
        exchange.set_balance("USDT", Decimal::ZERO, dec!(1000)).await;
        wallets.update(true).await.unwrap();

        // Everything closes at a combined loss of 200: 800 comes back free.
        for trade in &mut trades {
            trade.amount = dec!(1);
            trade.open_rate = dec!(250);
            trade.close(dec!(200), ExitReason::Stoploss);
            db.update_trade(trade).await.unwrap();
        }
        exchange.set_balance("USDT", dec!(800), Decimal::ZERO).await;

        // Reconfigured to five slots: the stake reflects the reduced balance,
        // recomputed rather than cached.
        let wallets_five = Wallets::new(
            Arc::new(unlimited_config(5)),
            db.clone(),
            exchange.clone(),
            RetryPolicy::immediate(2),
        );
        wallets_five.update(true).await.unwrap();
        let stake = wallets_five
            .stake_amount_for("ETH/USDT", None, None)
            .await
            .unwrap();
        assert_eq!(stake, dec!(160));
    }

    #[tokio::test]
    async fn available_capital_caps_deployable_balance() {
        let config = TradingConfig {
            available_capital: Some(dec!(100)),
            ..unlimited_config(2)
        };
        let (db, exchange, wallets) = setup(config, dec!(1000)).await;

        assert_eq!(
            wallets.stake_amount_for("ETH/USDT", None, None).await.unwrap(),
            dec!(50)
        );

        // Once the whole override is tied up, sizing refuses more.
        open_trade(&db, dec!(100)).await;
        exchange.set_balance("USDT", dec!(900), dec!(100)).await;
        wallets.update(true).await.unwrap();
        assert_eq!(
            wallets.stake_amount_for("ETH/USDT", None, None).await.unwrap(),
            Decimal::ZERO
        );
    }

    #[tokio::test]
    async fn minimum_stake_rejection_fails_closed() {
        let config = TradingConfig {
            stake_amount: StakeAmount::Fixed(dec!(20)),
            ..TradingConfig::default()
        };
        let (_db, _exchange, wallets) = setup(config, dec!(100)).await;

        // 20 * 1.3 < 50: refuse rather than silently trade at the minimum.
        let stake = wallets
            .stake_amount_for("ETH/USDT", Some(dec!(50)), Some(dec!(10000)))
            .await
            .unwrap();
        assert_eq!(stake, Decimal::ZERO);
    }

    #[tokio::test]
    async fn fixed_stake_errors_when_minimum_unfundable() {
        let config = TradingConfig {
            stake_amount: StakeAmount::Fixed(dec!(20)),
            ..TradingConfig::default()
        };
        let (_db, _exchange, wallets) = setup(config, dec!(10)).await;

        let err = wallets
            .stake_amount_for("ETH/USDT", Some(dec!(50)), None)
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<InsufficientCapital>().is_some());
    }

    #[tokio::test]
    async fn stake_validation_clipping_table() {
        let (_db, _exchange, wallets) =
            setup(TradingConfig::default(), dec!(1000)).await;

        let cases: Vec<(Decimal, Option<Decimal>, Decimal, Option<Decimal>, Decimal)> = vec![
            (dec!(22), Some(dec!(11)), dec!(50), Some(dec!(10000)), dec!(22)),
            (dec!(100), Some(dec!(11)), dec!(500), Some(dec!(10000)), dec!(100)),
            // Above what is available.
            (dec!(1000), Some(dec!(11)), dec!(500), Some(dec!(10000)), dec!(500)),
            // Above the exchange maximum, below what is available.
            (dec!(700), Some(dec!(11)), dec!(1000), Some(dec!(400)), dec!(400)),
            // Minimum exceeds what is available.
            (dec!(20), Some(dec!(15)), dec!(10), Some(dec!(10000)), Decimal::ZERO),
            // Slightly below the minimum: bumped up.
            (dec!(9), Some(dec!(11)), dec!(100), Some(dec!(10000)), dec!(11)),
            // Far below the minimum: refused.
            (dec!(20), Some(dec!(50)), dec!(100), Some(dec!(10000)), Decimal::ZERO),
            // No minimum known.
            (dec!(1000), None, dec!(1000), Some(dec!(10000)), dec!(1000)),
        ];

        for (stake, min, available, max, expected) in cases {
            let result = wallets.validate_stake_amount("XRP/USDT", stake, min, max, available);
            assert_eq!(
                result, expected,
                "stake={stake} min={min:?} available={available} max={max:?}"
            );
        }
    }

    #[tokio::test]
    async fn starting_balance_backs_out_realized_profit() {
        let (db, exchange, wallets) = setup(unlimited_config(3), dec!(910)).await;

        open_trade(&db, dec!(100)).await;
        let mut closed = open_trade(&db, dec!(10)).await;
        closed.amount = dec!(1);
        closed.open_rate = dec!(10);
        closed.close(dec!(20), ExitReason::Roi); // +10 profit
        db.update_trade(&closed).await.unwrap();

        exchange.set_balance("USDT", dec!(910), dec!(100)).await;
        wallets.update(true).await.unwrap();

        // free 910 - profit 10 + tied 100 = 1000
        assert_eq!(wallets.get_starting_balance().await.unwrap(), dec!(1000));
    }

    #[tokio::test]
    async fn refresh_is_throttled_between_intervals() {
        let (_db, exchange, wallets) = setup(TradingConfig::default(), dec!(1000)).await;

        // Any gateway call would fail now; the throttled update never makes one.
        exchange.fail_next_calls(1).await;
        wallets.update(false).await.unwrap();
        assert_eq!(wallets.get_free("USDT").await, dec!(1000));

        // A forced refresh does reach the gateway (one retry absorbs the
        // injected failure).
        wallets.update(true).await.unwrap();
    }
}
