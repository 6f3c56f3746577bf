//! Order-state reconciliation.
//!
//! Each tick, every trade with an order in flight is checked against the
//! exchange's authoritative order state and the ledger is updated to match.
//! Fills are applied idempotently (each order's `filled` is a high-water
//! mark), cancellations fold partial fills into the trade, and an order the
//! exchange no longer knows freezes the trade for operator attention — a
//! fill price is never guessed.

use std::sync::Arc;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::exchange::{ExchangeError, ExchangeGateway, RetryError, RetryPolicy};
use crate::models::{ExitReason, Order, OrderKind, OrderStatus, Trade, TradeState};

use super::strategy::PositionStrategy;

/// What a sync pass did to one trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    NoChange,
    Updated,
    TradeClosed,
    TradeDiscarded,
    /// Exchange state could not be mapped to local expectation; the trade is
    /// frozen until an operator resolves it.
    Divergence,
}

/// Tick-level summary across all trades.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyncReport {
    pub synced: usize,
    pub updated: usize,
    pub closed: usize,
    pub discarded: usize,
    pub divergences: usize,
    pub failures: usize,
}

pub struct Reconciler {
    db: Arc<Database>,
    gateway: Arc<dyn ExchangeGateway>,
    strategy: Arc<dyn PositionStrategy>,
    retry: RetryPolicy,
}

impl Reconciler {
    pub fn new(
        db: Arc<Database>,
        gateway: Arc<dyn ExchangeGateway>,
        strategy: Arc<dyn PositionStrategy>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            db,
            gateway,
            strategy,
            retry,
        }
    }

    /// Sync every open trade that has an order in flight. A failure on one
    /// trade is contained: the others still sync, and the failed one is
    /// retried next tick.
    pub async fn sync_all(&self) -> Result<SyncReport> {
        let trades = self.db.get_open_trades().await?;
        let mut report = SyncReport::default();

        for mut trade in trades {
            if trade.is_frozen {
                continue;
            }
            if trade.open_order_id.is_none() && trade.stoploss_order_id.is_none() {
                continue;
            }
            report.synced += 1;
            match self.sync_trade(&mut trade).await {
                Ok(SyncOutcome::NoChange) => {}
                Ok(SyncOutcome::Updated) => report.updated += 1,
                Ok(SyncOutcome::TradeClosed) => report.closed += 1,
                Ok(SyncOutcome::TradeDiscarded) => report.discarded += 1,
                Ok(SyncOutcome::Divergence) => report.divergences += 1,
                Err(err) => {
                    warn!(
                        trade_id = trade.id.unwrap_or_default(),
                        pair = %trade.pair,
                        error = %err,
                        "Order sync failed, retrying next tick"
                    );
                    report.failures += 1;
                }
            }
        }
        Ok(report)
    }

    /// Pull authoritative state for this trade's in-flight orders and apply
    /// it. Safe to run repeatedly against unchanged exchange state.
    pub async fn sync_trade(&self, trade: &mut Trade) -> Result<SyncOutcome> {
        if trade.is_frozen {
            return Ok(SyncOutcome::NoChange);
        }

        let mut outcome = SyncOutcome::NoChange;
        if let Some(order_id) = trade.open_order_id.clone() {
            outcome = self.sync_open_order(trade, &order_id).await?;
        }

        if trade.is_open && !trade.is_frozen {
            if let Some(stoploss_id) = trade.stoploss_order_id.clone() {
                let stoploss_outcome = self.sync_stoploss_order(trade, &stoploss_id).await?;
                if outcome == SyncOutcome::NoChange {
                    outcome = stoploss_outcome;
                }
            }
        }
        Ok(outcome)
    }

    async fn sync_open_order(&self, trade: &mut Trade, order_id: &str) -> Result<SyncOutcome> {
        let trade_id = trade.id.context("Trade without id")?;
        let pair = trade.pair.clone();
        let id = order_id.to_string();

        let exchange_order = match self
            .retry
            .call("fetch_order", || self.gateway.fetch_order(&id, &pair))
            .await
        {
            Ok(order) => order,
            Err(RetryError::Aborted(ExchangeError::OrderNotFound { .. })) => {
                return self.flag_divergence(trade, order_id, "order unknown to exchange").await;
            }
            Err(err) => return Err(err.into()),
        };

        let Some(mut local) = self.db.find_order_by_exchange_id(trade_id, order_id).await? else {
            return self.flag_divergence(trade, order_id, "order missing from ledger").await;
        };

        let changed = local.apply_update(
            exchange_order.status,
            exchange_order.filled,
            exchange_order.average,
        );
        self.db.update_order(&local).await?;

        if local.is_fully_filled() {
            self.apply_full_fill(trade, &local).await
        } else if matches!(
            local.status,
            OrderStatus::Canceled | OrderStatus::Expired | OrderStatus::Rejected
        ) {
            self.apply_termination(trade, &local).await
        } else {
            Ok(if changed {
                SyncOutcome::Updated
            } else {
                SyncOutcome::NoChange
            })
        }
    }

    async fn apply_full_fill(&self, trade: &mut Trade, order: &Order) -> Result<SyncOutcome> {
        let trade_id = trade.id.context("Trade without id")?;
        let orders = self.db.orders_for_trade(trade_id).await?;
        trade.recalculate_from_orders(&orders);
        trade.open_order_id = None;

        match order.kind {
            OrderKind::Entry => {
                trade.state = TradeState::Open;
                if trade.initial_stoploss.is_none() {
                    trade.set_initial_stoploss(self.strategy.stoploss_pct());
                }
                self.db.update_trade(trade).await?;
                info!(
                    pair = %trade.pair,
                    open_rate = %trade.open_rate,
                    amount = %trade.amount,
                    stoploss = %trade.stoploss.unwrap_or_default(),
                    "Entry fill confirmed"
                );
                Ok(SyncOutcome::Updated)
            }
            OrderKind::Exit | OrderKind::Stoploss => {
                if trade.amount <= Decimal::ZERO {
                    let reason = trade.exit_reason.unwrap_or(ExitReason::ForceExit);
                    trade.close(order.fill_price(), reason);
                    // The position amount is already zero after the recalc;
                    // profit is what the exit order actually realized.
                    trade.close_profit =
                        Some(trade.profit_for_amount(order.fill_price(), order.filled));
                    self.db.update_trade(trade).await?;
                    info!(
                        pair = %trade.pair,
                        close_rate = %order.fill_price(),
                        profit = %trade.close_profit.unwrap_or_default(),
                        reason = reason.as_str(),
                        "Trade closed"
                    );
                    Ok(SyncOutcome::TradeClosed)
                } else {
                    // Partial exit: the remainder keeps trading.
                    trade.state = TradeState::Open;
                    self.db.update_trade(trade).await?;
                    info!(
                        pair = %trade.pair,
                        remaining = %trade.amount,
                        "Partial exit filled, trade stays open"
                    );
                    Ok(SyncOutcome::Updated)
                }
            }
        }
    }

    async fn apply_termination(&self, trade: &mut Trade, order: &Order) -> Result<SyncOutcome> {
        let trade_id = trade.id.context("Trade without id")?;
        let orders = self.db.orders_for_trade(trade_id).await?;
        trade.recalculate_from_orders(&orders);
        trade.open_order_id = None;

        match order.kind {
            OrderKind::Entry => {
                if trade.amount > Decimal::ZERO {
                    // The cancelled order partially filled; the fold leaves a
                    // live position behind.
                    trade.state = TradeState::Open;
                    if trade.initial_stoploss.is_none() {
                        trade.set_initial_stoploss(self.strategy.stoploss_pct());
                    }
                    self.db.update_trade(trade).await?;
                    info!(
                        pair = %trade.pair,
                        amount = %trade.amount,
                        "Entry order cancelled with partial fill folded in"
                    );
                    Ok(SyncOutcome::Updated)
                } else if trade.state == TradeState::PendingEntry {
                    self.db.delete_trade(trade_id).await?;
                    trade.state = TradeState::Closed;
                    trade.is_open = false;
                    info!(
                        pair = %trade.pair,
                        status = order.status.as_str(),
                        "Unfilled entry terminated, trade discarded"
                    );
                    Ok(SyncOutcome::TradeDiscarded)
                } else {
                    // A cancelled adjustment order on an already-open trade.
                    self.db.update_trade(trade).await?;
                    Ok(SyncOutcome::Updated)
                }
            }
            OrderKind::Exit => {
                trade.state = TradeState::Open;
                trade.exit_reason = None;
                self.db.update_trade(trade).await?;
                info!(
                    pair = %trade.pair,
                    status = order.status.as_str(),
                    "Exit order terminated without full fill, trade re-opened"
                );
                Ok(SyncOutcome::Updated)
            }
            OrderKind::Stoploss => {
                trade.stoploss_order_id = None;
                self.db.update_trade(trade).await?;
                Ok(SyncOutcome::Updated)
            }
        }
    }

    async fn sync_stoploss_order(&self, trade: &mut Trade, order_id: &str) -> Result<SyncOutcome> {
        let trade_id = trade.id.context("Trade without id")?;
        let pair = trade.pair.clone();
        let id = order_id.to_string();

        let exchange_order = match self
            .retry
            .call("fetch_order", || self.gateway.fetch_order(&id, &pair))
            .await
        {
            Ok(order) => order,
            Err(RetryError::Aborted(ExchangeError::OrderNotFound { .. })) => {
                // A vanished stoploss is recoverable: the engine resubmits it
                // on the next evaluation.
                warn!(pair = %trade.pair, order_id, "Stoploss order gone on exchange, will replace");
                trade.stoploss_order_id = None;
                self.db.update_trade(trade).await?;
                return Ok(SyncOutcome::Updated);
            }
            Err(err) => return Err(err.into()),
        };

        let Some(mut local) = self.db.find_order_by_exchange_id(trade_id, order_id).await? else {
            trade.stoploss_order_id = None;
            self.db.update_trade(trade).await?;
            return Ok(SyncOutcome::Updated);
        };

        let changed = local.apply_update(
            exchange_order.status,
            exchange_order.filled,
            exchange_order.average,
        );
        self.db.update_order(&local).await?;

        if local.is_fully_filled() {
            let orders = self.db.orders_for_trade(trade_id).await?;
            trade.recalculate_from_orders(&orders);
            trade.stoploss_order_id = None;

            let reason = if trade.stoploss_was_trailed() {
                ExitReason::TrailingStop
            } else {
                ExitReason::Stoploss
            };
            if trade.amount <= Decimal::ZERO {
                trade.close(local.fill_price(), reason);
                trade.close_profit =
                    Some(trade.profit_for_amount(local.fill_price(), local.filled));
                self.db.update_trade(trade).await?;
                info!(
                    pair = %trade.pair,
                    close_rate = %local.fill_price(),
                    reason = reason.as_str(),
                    "Exchange-side stoploss filled, trade closed"
                );
                Ok(SyncOutcome::TradeClosed)
            } else {
                warn!(
                    pair = %trade.pair,
                    remaining = %trade.amount,
                    "Stoploss filled but position remains, trade stays open"
                );
                trade.state = TradeState::Open;
                self.db.update_trade(trade).await?;
                Ok(SyncOutcome::Updated)
            }
        } else if matches!(
            local.status,
            OrderStatus::Canceled | OrderStatus::Expired | OrderStatus::Rejected
        ) {
            trade.stoploss_order_id = None;
            self.db.update_trade(trade).await?;
            debug!(pair = %trade.pair, "Stoploss order terminated externally, will replace");
            Ok(SyncOutcome::Updated)
        } else {
            Ok(if changed {
                SyncOutcome::Updated
            } else {
                SyncOutcome::NoChange
            })
        }
    }

    /// Never guess a fill: freeze the trade and surface the problem.
    async fn flag_divergence(
        &self,
        trade: &mut Trade,
        order_id: &str,
        detail: &str,
    ) -> Result<SyncOutcome> {
        warn!(
            trade_id = trade.id.unwrap_or_default(),
            pair = %trade.pair,
            order_id,
            detail,
            "Reconciliation divergence, trade frozen pending operator action"
        );
        trade.is_frozen = true;
        self.db.update_trade(trade).await?;
        Ok(SyncOutcome::Divergence)
    }
}
