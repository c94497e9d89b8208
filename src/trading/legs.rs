//! Data-driven leg table: which entry, stop-loss and take-profit each leg uses.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::Signal;

/// Entry level a leg is assigned, relative to the signal's direction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntrySelector {
    /// Upper entry for BUY, lower for SELL
    First,
    Middle,
    /// Lower entry for BUY, upper for SELL
    Last,
    /// Interpolated between first (0) and last (1)
    Between(Decimal),
}

impl EntrySelector {
    pub fn resolve(&self, signal: &Signal) -> Decimal {
        match self {
            EntrySelector::First => signal.first_entry(),
            EntrySelector::Middle => signal.middle(),
            EntrySelector::Last => signal.last_entry(),
            EntrySelector::Between(fraction) => {
                let first = signal.first_entry();
                let last = signal.last_entry();
                let scale = first.scale().max(last.scale());
                (first + (last - first) * fraction).round_dp(scale)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetSelector {
    /// 1-based take-profit level, clamped to the levels the signal supplies
    Level(usize),
    /// No take-profit; trails once the final target is reached
    Runner,
}

/// How legs are paired with the signal's stop-loss levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopLossMode {
    /// Leg n uses stop-loss level n, clamped to the last supplied level
    Paired,
    /// Every leg uses the same configured level
    Fixed,
}

/// One row of the leg table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LegSpec {
    pub entry: EntrySelector,
    pub stop_loss_level: usize,
    pub target: TargetSelector,
}

impl LegSpec {
    pub fn is_runner(&self) -> bool {
        self.target == TargetSelector::Runner
    }
}

/// Build the leg table for `num_legs` legs.
///
/// Three legs use first/middle/last entries. Any other count spreads the
/// entries evenly from first to last. The first third of the legs target
/// `first_target`, the rest the final target, and the last leg becomes the
/// runner when enabled. Paired stops give leg n stop-loss level n; fixed
/// stops give every leg `stop_loss_level`.
pub fn leg_table(
    num_legs: usize,
    first_target: usize,
    final_target: usize,
    stop_loss_mode: StopLossMode,
    stop_loss_level: usize,
    runner_enabled: bool,
) -> Vec<LegSpec> {
    let entries: Vec<EntrySelector> = match num_legs {
        0 => Vec::new(),
        1 => vec![EntrySelector::First],
        3 => vec![EntrySelector::First, EntrySelector::Middle, EntrySelector::Last],
        n => {
            let steps = Decimal::from(n as u64 - 1);
            (0..n)
                .map(|i| match i {
                    0 => EntrySelector::First,
                    i if i == n - 1 => EntrySelector::Last,
                    i => EntrySelector::Between(Decimal::from(i as u64) / steps),
                })
                .collect()
        }
    };

    let first_group = num_legs.div_ceil(3);
    entries
        .into_iter()
        .enumerate()
        .map(|(i, entry)| {
            let target = if runner_enabled && num_legs > 1 && i == num_legs - 1 {
                TargetSelector::Runner
            } else if i < first_group {
                TargetSelector::Level(first_target)
            } else {
                TargetSelector::Level(final_target)
            };
            let stop_loss_level = match stop_loss_mode {
                StopLossMode::Paired => i + 1,
                StopLossMode::Fixed => stop_loss_level,
            };
            LegSpec {
                entry,
                stop_loss_level,
                target,
            }
        })
        .collect()
}
