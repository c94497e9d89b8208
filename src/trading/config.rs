//! Trading configuration.

use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::legs::{leg_table, LegSpec, StopLossMode};

/// What happens to legs whose entry price has already been reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagedEntry {
    /// Only the crossed leg nearest the current price goes to market; the
    /// other crossed legs are skipped
    NearestOnly,
    /// Every crossed leg goes to market at the current price
    MarketAll,
}

/// Stop-loss management rule for non-runner legs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopMode {
    Breakeven,
    Trailing,
    Fixed,
}

/// Entry level whose crossing arms breakeven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakevenTrigger {
    MiddleEntry,
    LastEntry,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakevenConfig {
    pub trigger: BreakevenTrigger,

    /// Distance beyond the trigger level price must reach
    pub trigger_offset: Decimal,

    /// Stop is locked this far beyond the open price
    pub lock_offset: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrailingConfig {
    /// Favorable excursion from open price that arms trailing
    pub activation: Decimal,

    /// Distance kept between the best price and the stop
    pub distance: Decimal,
}

/// Configuration for entry planning and position supervision.
/// All offsets and distances are in price units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    // === Legs ===
    /// Legs per signal (3, 6 or 9 are the usual layouts)
    pub num_legs: usize,

    /// Take-profit level for the first leg
    pub first_leg_target: usize,

    /// Last leg rides without a take-profit and trails after the final target
    pub runner_enabled: bool,

    /// Paired per leg, or one level shared by all legs
    pub stop_loss_mode: StopLossMode,

    /// Level used by every leg in fixed mode
    pub stop_loss_level: usize,

    /// Fixed order volume per leg
    pub leg_volume: Decimal,

    // === Entry ===
    pub staged_entry: StagedEntry,

    /// Resting orders closer than this to the current price go to market
    pub min_limit_distance: Decimal,

    /// Refuse signals while opposite positions are open on the symbol
    pub block_opposite_positions: bool,

    // === Supervision ===
    pub stop_mode: StopMode,
    pub breakeven: BreakevenConfig,
    pub trailing: TrailingConfig,

    /// Take-profit level that completes a signal
    pub final_target_level: usize,

    /// Also complete signals when price reaches the final target while
    /// resting legs are still unfilled
    pub final_target_by_price: bool,

    // === Runtime ===
    pub poll_interval_secs: u64,

    /// Upper bound on every gateway call
    pub call_timeout_ms: u64,

    /// Tickets supervised in parallel
    pub max_workers: usize,

    /// First retry delay when cancelling resting orders
    pub cancel_retry_ms: u64,

    /// Total time budget for cancelling one order within a tick
    pub cancel_budget_ms: u64,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            num_legs: 3,
            first_leg_target: 1,
            runner_enabled: true,
            stop_loss_mode: StopLossMode::Paired,
            stop_loss_level: 1,
            leg_volume: dec!(0.01),
            staged_entry: StagedEntry::NearestOnly,
            min_limit_distance: Decimal::ZERO,
            block_opposite_positions: true,
            stop_mode: StopMode::Breakeven,
            breakeven: BreakevenConfig {
                trigger: BreakevenTrigger::MiddleEntry,
                trigger_offset: dec!(0.0),
                lock_offset: dec!(0.1),
            },
            trailing: TrailingConfig {
                activation: dec!(1.0),
                distance: dec!(0.5),
            },
            final_target_level: 2,
            final_target_by_price: true,
            poll_interval_secs: 5,
            call_timeout_ms: 5_000,
            max_workers: 4,
            cancel_retry_ms: 500,
            cancel_budget_ms: 2_000,
        }
    }
}

/// A configuration variable that could not be parsed.
#[derive(Debug, Error)]
#[error("invalid value {value:?} for {key}: {reason}")]
pub struct ConfigError {
    pub key: String,
    pub value: String,
    pub reason: String,
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError {
            key: key.to_string(),
            value: value.clone(),
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn parse_choice<T: Copy>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
    choices: &[(&str, T)],
) -> Result<T, ConfigError> {
    let Some(value) = lookup(key) else {
        return Ok(default);
    };
    let wanted = value.trim().to_ascii_lowercase();
    choices
        .iter()
        .find(|(name, _)| *name == wanted)
        .map(|(_, choice)| *choice)
        .ok_or_else(|| ConfigError {
            key: key.to_string(),
            value: value.clone(),
            reason: format!(
                "expected one of {}",
                choices.iter().map(|(n, _)| *n).collect::<Vec<_>>().join(", ")
            ),
        })
}

impl TradingConfig {
    /// Defaults overlaid with environment variables (a `.env` file is loaded first).
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Self::default();
        let env = &lookup;

        let config = Self {
            num_legs: parse_var(env, "NUM_LEGS", d.num_legs)?,
            first_leg_target: parse_var(env, "POSITION_1_TP", d.first_leg_target)?,
            runner_enabled: parse_var(env, "RUNNER_ENABLED", d.runner_enabled)?,
            stop_loss_mode: parse_choice(
                env,
                "STOP_LOSS_MODE",
                d.stop_loss_mode,
                &[("paired", StopLossMode::Paired), ("fixed", StopLossMode::Fixed)],
            )?,
            stop_loss_level: parse_var(env, "STOP_LOSS_LEVEL", d.stop_loss_level)?,
            leg_volume: parse_var(env, "LEG_VOLUME", d.leg_volume)?,
            staged_entry: parse_choice(
                env,
                "STAGED_ENTRY",
                d.staged_entry,
                &[
                    ("nearest_only", StagedEntry::NearestOnly),
                    ("market_all", StagedEntry::MarketAll),
                ],
            )?,
            min_limit_distance: parse_var(env, "MIN_LIMIT_DISTANCE", d.min_limit_distance)?,
            block_opposite_positions: parse_var(
                env,
                "BLOCK_OPPOSITE_POSITIONS",
                d.block_opposite_positions,
            )?,
            stop_mode: parse_choice(
                env,
                "STOP_MODE",
                d.stop_mode,
                &[
                    ("breakeven", StopMode::Breakeven),
                    ("trailing", StopMode::Trailing),
                    ("fixed", StopMode::Fixed),
                ],
            )?,
            breakeven: BreakevenConfig {
                trigger: parse_choice(
                    env,
                    "BREAKEVEN_TRIGGER",
                    d.breakeven.trigger,
                    &[
                        ("middle_entry", BreakevenTrigger::MiddleEntry),
                        ("last_entry", BreakevenTrigger::LastEntry),
                    ],
                )?,
                trigger_offset: parse_var(env, "BREAKEVEN_OFFSET", d.breakeven.trigger_offset)?,
                lock_offset: parse_var(env, "BREAKEVEN_LOCK_OFFSET", d.breakeven.lock_offset)?,
            },
            trailing: TrailingConfig {
                activation: parse_var(env, "TRAILING_ACTIVATION", d.trailing.activation)?,
                distance: parse_var(env, "TRAILING_DISTANCE", d.trailing.distance)?,
            },
            final_target_level: parse_var(env, "FINAL_TARGET_LEVEL", d.final_target_level)?,
            final_target_by_price: parse_var(
                env,
                "FINAL_TARGET_BY_PRICE",
                d.final_target_by_price,
            )?,
            poll_interval_secs: parse_var(env, "POLL_INTERVAL_SECS", d.poll_interval_secs)?,
            call_timeout_ms: parse_var(env, "CALL_TIMEOUT_MS", d.call_timeout_ms)?,
            max_workers: parse_var(env, "MAX_WORKERS", d.max_workers)?,
            cancel_retry_ms: parse_var(env, "CANCEL_RETRY_MS", d.cancel_retry_ms)?,
            cancel_budget_ms: parse_var(env, "CANCEL_BUDGET_MS", d.cancel_budget_ms)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the planner and supervisor cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, value: String, reason: &str| ConfigError {
            key: key.to_string(),
            value,
            reason: reason.to_string(),
        };

        if !(1..=9).contains(&self.num_legs) {
            return Err(invalid("NUM_LEGS", self.num_legs.to_string(), "must be 1..=9"));
        }
        if self.first_leg_target == 0 || self.final_target_level == 0 || self.stop_loss_level == 0 {
            return Err(invalid(
                "POSITION_1_TP/FINAL_TARGET_LEVEL/STOP_LOSS_LEVEL",
                "0".to_string(),
                "levels are 1-based",
            ));
        }
        if self.leg_volume <= Decimal::ZERO {
            return Err(invalid("LEG_VOLUME", self.leg_volume.to_string(), "must be positive"));
        }
        if self.trailing.distance <= Decimal::ZERO {
            return Err(invalid(
                "TRAILING_DISTANCE",
                self.trailing.distance.to_string(),
                "must be positive",
            ));
        }
        if self.max_workers == 0 {
            return Err(invalid("MAX_WORKERS", "0".to_string(), "must be at least 1"));
        }
        Ok(())
    }

    pub fn leg_table(&self) -> Vec<LegSpec> {
        leg_table(
            self.num_legs,
            self.first_leg_target,
            self.final_target_level,
            self.stop_loss_mode,
            self.stop_loss_level,
            self.runner_enabled,
        )
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn cancel_retry(&self) -> Duration {
        Duration::from_millis(self.cancel_retry_ms.max(1))
    }

    /// Total time a single cancellation may spend retrying.
    pub fn cancel_budget(&self) -> Duration {
        Duration::from_millis(self.cancel_budget_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_overrides() {
        let config = TradingConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.num_legs, 3);
        assert_eq!(config.stop_loss_mode, StopLossMode::Paired);
        assert_eq!(config.stop_mode, StopMode::Breakeven);
        assert_eq!(config.breakeven.lock_offset, dec!(0.1));
        assert_eq!(config.call_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_overrides() {
        let config = TradingConfig::from_lookup(lookup(&[
            ("NUM_LEGS", "6"),
            ("STOP_MODE", "Trailing"),
            ("STAGED_ENTRY", "market_all"),
            ("TRAILING_DISTANCE", "2.5"),
            ("RUNNER_ENABLED", "false"),
            ("STOP_LOSS_MODE", "fixed"),
            ("STOP_LOSS_LEVEL", "3"),
        ]))
        .unwrap();
        assert_eq!(config.num_legs, 6);
        assert_eq!(config.stop_mode, StopMode::Trailing);
        assert_eq!(config.staged_entry, StagedEntry::MarketAll);
        assert_eq!(config.trailing.distance, dec!(2.5));
        assert!(!config.runner_enabled);
        assert_eq!(config.stop_loss_mode, StopLossMode::Fixed);
        assert!(config.leg_table().iter().all(|l| l.stop_loss_level == 3));
        assert_eq!(config.leg_table().len(), 6);
    }

    #[test]
    fn test_bad_value_names_variable() {
        let err = TradingConfig::from_lookup(lookup(&[("LEG_VOLUME", "lots")])).unwrap_err();
        assert_eq!(err.key, "LEG_VOLUME");

        let err = TradingConfig::from_lookup(lookup(&[("STOP_MODE", "chandelier")])).unwrap_err();
        assert_eq!(err.key, "STOP_MODE");
        assert!(err.reason.contains("trailing"));

        let err = TradingConfig::from_lookup(lookup(&[("NUM_LEGS", "12")])).unwrap_err();
        assert_eq!(err.key, "NUM_LEGS");
    }
}
