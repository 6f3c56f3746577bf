//! Engine configuration.

use std::collections::BTreeMap;
use std::path::Path;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Fatal configuration problem: the process must not start trading.
#[derive(Debug, Error)]
#[error("fatal configuration error: {0}")]
pub struct ConfigurationFatal(pub String);

/// Stake per entry: a fixed quote-currency amount, or "unlimited" to spread
/// the deployable balance across the open-trade slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StakeAmount {
    Fixed(Decimal),
    Unlimited,
}

impl Serialize for StakeAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            StakeAmount::Fixed(amount) => Serialize::serialize(amount, serializer),
            StakeAmount::Unlimited => serializer.serialize_str("unlimited"),
        }
    }
}

impl<'de> Deserialize<'de> for StakeAmount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Amount(Decimal),
            Keyword(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Amount(amount) => Ok(StakeAmount::Fixed(amount)),
            Raw::Keyword(word) if word == "unlimited" => Ok(StakeAmount::Unlimited),
            Raw::Keyword(word) => Err(D::Error::custom(format!(
                "stake_amount must be a number or \"unlimited\", got {word:?}"
            ))),
        }
    }
}

/// Configuration for the trading engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    /// Strategy name, resolved against the registry at startup.
    pub strategy: String,

    /// Quote currency all stakes are denominated in.
    pub stake_currency: String,

    pub stake_amount: StakeAmount,

    /// Maximum concurrently open trades. `-1` lifts the cap; `0` disables
    /// new entries entirely.
    pub max_open_trades: i64,

    /// Share of the total balance the engine may deploy (0–1].
    pub tradable_balance_ratio: Decimal,

    /// Absolute capital override; when set, sizing ignores the balance ratio
    /// beyond this amount.
    pub available_capital: Option<Decimal>,

    pub dry_run: bool,

    /// Paper wallet size for dry-run mode.
    pub dry_run_wallet: Decimal,

    /// Pairs considered for new entries.
    pub whitelist: Vec<String>,

    /// Default stoploss as a positive fraction, e.g. 0.10 for 10%.
    pub stoploss: Decimal,

    pub position_adjustment_enable: bool,

    pub stoploss_on_exchange: bool,

    pub trailing_stop: bool,

    /// Stoploss distance once trailing is active.
    pub trailing_stop_positive: Option<Decimal>,

    /// Profit ratio that arms the trailing stop.
    pub trailing_stop_positive_offset: Decimal,

    /// Minutes-since-entry -> minimum acceptable profit ratio. The applicable
    /// threshold is the entry with the greatest key not exceeding the elapsed
    /// time.
    pub minimal_roi: BTreeMap<u32, Decimal>,

    pub leverage: Decimal,

    pub tick_interval_secs: u64,

    pub wallet_refresh_interval_secs: u64,

    pub database_url: String,
}

impl Default for TradingConfig {
    fn default() -> Self {
        let mut minimal_roi = BTreeMap::new();
        minimal_roi.insert(0, dec!(0.04));
        minimal_roi.insert(30, dec!(0.02));
        minimal_roi.insert(60, dec!(0.01));

        Self {
            strategy: "default".to_string(),
            stake_currency: "USDT".to_string(),
            stake_amount: StakeAmount::Unlimited,
            max_open_trades: 3,
            tradable_balance_ratio: Decimal::ONE,
            available_capital: None,
            dry_run: true,
            dry_run_wallet: dec!(1000),
            whitelist: vec!["BTC/USDT".to_string(), "ETH/USDT".to_string()],
            stoploss: dec!(0.10),
            position_adjustment_enable: false,
            stoploss_on_exchange: false,
            trailing_stop: false,
            trailing_stop_positive: None,
            trailing_stop_positive_offset: Decimal::ZERO,
            minimal_roi,
            leverage: Decimal::ONE,
            tick_interval_secs: 5,
            wallet_refresh_interval_secs: 300,
            database_url: "sqlite:helmsman.db?mode=rwc".to_string(),
        }
    }
}

impl TradingConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigurationFatal> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ConfigurationFatal(format!("cannot read {}: {e}", path.as_ref().display()))
        })?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| ConfigurationFatal(format!("cannot parse configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigurationFatal> {
        if self.tradable_balance_ratio <= Decimal::ZERO
            || self.tradable_balance_ratio > Decimal::ONE
        {
            return Err(ConfigurationFatal(format!(
                "tradable_balance_ratio must be within (0, 1], got {}",
                self.tradable_balance_ratio
            )));
        }
        if self.stoploss <= Decimal::ZERO || self.stoploss >= Decimal::ONE {
            return Err(ConfigurationFatal(format!(
                "stoploss must be a fraction within (0, 1), got {}",
                self.stoploss
            )));
        }
        if let StakeAmount::Fixed(amount) = self.stake_amount {
            if amount <= Decimal::ZERO {
                return Err(ConfigurationFatal(format!(
                    "stake_amount must be positive, got {amount}"
                )));
            }
        }
        if self.dry_run && self.dry_run_wallet <= Decimal::ZERO {
            return Err(ConfigurationFatal(
                "dry_run_wallet must be positive in dry-run mode".to_string(),
            ));
        }
        if self.trailing_stop {
            let Some(positive) = self.trailing_stop_positive else {
                return Err(ConfigurationFatal(
                    "trailing_stop requires trailing_stop_positive".to_string(),
                ));
            };
            if positive <= Decimal::ZERO || positive >= Decimal::ONE {
                return Err(ConfigurationFatal(format!(
                    "trailing_stop_positive must be within (0, 1), got {positive}"
                )));
            }
        }
        if self.leverage < Decimal::ONE {
            return Err(ConfigurationFatal(format!(
                "leverage must be at least 1, got {}",
                self.leverage
            )));
        }
        if self.strategy.trim().is_empty() {
            return Err(ConfigurationFatal("strategy name must not be empty".to_string()));
        }
        Ok(())
    }

    /// Whether the open-trade cap allows another entry.
    pub fn entry_slot_available(&self, open_trades: i64) -> bool {
        if self.max_open_trades < 0 {
            return true;
        }
        open_trades < self.max_open_trades
    }

    /// ROI threshold for a trade of the given age: the schedule value at the
    /// greatest key not exceeding the elapsed minutes.
    pub fn roi_threshold(&self, elapsed_minutes: i64) -> Option<Decimal> {
        let elapsed = u32::try_from(elapsed_minutes.max(0)).unwrap_or(u32::MAX);
        self.minimal_roi
            .range(..=elapsed)
            .next_back()
            .map(|(_, ratio)| *ratio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stake_amount_accepts_number_and_keyword() {
        let fixed: StakeAmount = serde_json::from_str("125.5").unwrap();
        assert_eq!(fixed, StakeAmount::Fixed(dec!(125.5)));

        let unlimited: StakeAmount = serde_json::from_str("\"unlimited\"").unwrap();
        assert_eq!(unlimited, StakeAmount::Unlimited);

        assert!(serde_json::from_str::<StakeAmount>("\"lots\"").is_err());
    }

    #[test]
    fn roi_threshold_picks_greatest_key_not_exceeding_elapsed() {
        let config = TradingConfig::default();
        assert_eq!(config.roi_threshold(0), Some(dec!(0.04)));
        assert_eq!(config.roi_threshold(29), Some(dec!(0.04)));
        assert_eq!(config.roi_threshold(30), Some(dec!(0.02)));
        assert_eq!(config.roi_threshold(59), Some(dec!(0.02)));
        assert_eq!(config.roi_threshold(180), Some(dec!(0.01)));
    }

    #[test]
    fn empty_roi_schedule_never_triggers() {
        let config = TradingConfig {
            minimal_roi: BTreeMap::new(),
            ..TradingConfig::default()
        };
        assert_eq!(config.roi_threshold(1000), None);
    }

    #[test]
    fn validation_rejects_bad_ratio_and_trailing_setup() {
        let bad_ratio = TradingConfig {
            tradable_balance_ratio: dec!(1.5),
            ..TradingConfig::default()
        };
        assert!(bad_ratio.validate().is_err());

        let bad_trailing = TradingConfig {
            trailing_stop: true,
            trailing_stop_positive: None,
            ..TradingConfig::default()
        };
        assert!(bad_trailing.validate().is_err());
    }

    #[test]
    fn entry_slots_honor_unlimited_and_disabled() {
        let capped = TradingConfig {
            max_open_trades: 2,
            ..TradingConfig::default()
        };
        assert!(capped.entry_slot_available(1));
        assert!(!capped.entry_slot_available(2));

        let unlimited = TradingConfig {
            max_open_trades: -1,
            ..TradingConfig::default()
        };
        assert!(unlimited.entry_slot_available(10_000));

        let disabled = TradingConfig {
            max_open_trades: 0,
            ..TradingConfig::default()
        };
        assert!(!disabled.entry_slot_available(0));
    }
}
