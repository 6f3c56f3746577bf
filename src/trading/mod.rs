//! Trading logic: configuration, capital allocation, strategy interface,
//! the position engine and order reconciliation.

mod config;
mod engine;
mod reconciler;
mod strategy;
mod wallets;

pub use config::{ConfigurationFatal, StakeAmount, TradingConfig};
pub use engine::PositionEngine;
pub use reconciler::{Reconciler, SyncOutcome, SyncReport};
pub use strategy::{DefaultStrategy, PositionStrategy, StrategyRegistry};
pub use wallets::{InsufficientCapital, Wallets};
