//! Durable entities: trades, orders, pair locks and wallet snapshots.

mod order;
mod pair_lock;
mod trade;
mod wallet;

pub use order::{Order, OrderKind, OrderSide, OrderStatus};
pub use pair_lock::{PairLock, LOCK_ALL_PAIRS};
pub use trade::{ExitReason, Trade, TradeDirection, TradeState};
pub use wallet::Wallet;
