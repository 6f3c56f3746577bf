//! Wallet model: per-currency balance snapshot.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Free/used/total balances for one currency, as last reported by the
/// gateway. Snapshots older than the refresh interval are invalid for sizing
/// decisions and must be refreshed before use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub currency: String,
    pub free: Decimal,
    pub used: Decimal,
    pub total: Decimal,
}

impl Wallet {
    pub fn new(currency: impl Into<String>, free: Decimal, used: Decimal, total: Decimal) -> Self {
        Self {
            currency: currency.into(),
            free,
            used,
            total,
        }
    }
}
