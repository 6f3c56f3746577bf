//! PairLock model: a temporary prohibition on opening new trades for a pair.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Wildcard pair that locks every pair at once.
pub const LOCK_ALL_PAIRS: &str = "*";

/// A single lock entry. Multiple overlapping locks may exist for one pair;
/// the pair is locked as long as any of them is active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairLock {
    /// Ledger id, `None` until persisted.
    pub id: Option<i64>,

    /// Pair this lock applies to, or `"*"` for all pairs.
    pub pair: String,

    pub reason: Option<String>,

    pub lock_time: DateTime<Utc>,
    pub lock_until: DateTime<Utc>,

    /// Cleared by an explicit unlock; expired locks stay in the ledger for
    /// inspection but no longer block entries.
    pub active: bool,
}

impl PairLock {
    pub fn new(pair: impl Into<String>, lock_until: DateTime<Utc>, reason: Option<String>) -> Self {
        Self {
            id: None,
            pair: pair.into(),
            reason,
            lock_time: Utc::now(),
            lock_until,
            active: true,
        }
    }

    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.active && self.lock_until > now
    }

    /// Whether this lock applies to the given pair, honoring the wildcard.
    pub fn applies_to(&self, pair: &str) -> bool {
        self.pair == pair || self.pair == LOCK_ALL_PAIRS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn expired_lock_is_inactive() {
        let lock = PairLock::new("ETH/USDT", Utc::now() - Duration::minutes(1), None);
        assert!(!lock.is_active_at(Utc::now()));
    }

    #[test]
    fn wildcard_lock_applies_to_any_pair() {
        let lock = PairLock::new(LOCK_ALL_PAIRS, Utc::now() + Duration::minutes(5), None);
        assert!(lock.applies_to("ETH/USDT"));
        assert!(lock.applies_to("XRP/USDT"));
        assert!(lock.is_active_at(Utc::now()));
    }
}
