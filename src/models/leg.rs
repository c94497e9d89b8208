//! Planned legs and their persisted lifecycle.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::api::Ticket;

use super::Fingerprint;

/// How a leg is entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryMode {
    /// Not submitted; price already swept past the entry
    Skip,
    /// Limit order resting at the leg's entry
    Resting,
    /// Market order at the current price
    Immediate,
}

impl EntryMode {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryMode::Skip => "skip",
            EntryMode::Resting => "resting",
            EntryMode::Immediate => "immediate",
        }
    }
}

impl FromStr for EntryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "skip" => Ok(EntryMode::Skip),
            "resting" => Ok(EntryMode::Resting),
            "immediate" => Ok(EntryMode::Immediate),
            other => Err(format!("unknown entry mode {other:?}")),
        }
    }
}

/// Persisted state of a single leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegState {
    Skipped,
    Rejected,
    /// Accepted by the gateway, not yet seen as an open position
    Placed,
    /// Filled and under supervision
    Open,
    Closed,
    /// Resting order cancelled or vanished without filling
    Cancelled,
}

impl LegState {
    /// Whether the leg may still produce or hold exposure.
    pub fn is_live(self) -> bool {
        matches!(self, LegState::Placed | LegState::Open)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LegState::Skipped => "skipped",
            LegState::Rejected => "rejected",
            LegState::Placed => "placed",
            LegState::Open => "open",
            LegState::Closed => "closed",
            LegState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for LegState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LegState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "skipped" => Ok(LegState::Skipped),
            "rejected" => Ok(LegState::Rejected),
            "placed" => Ok(LegState::Placed),
            "open" => Ok(LegState::Open),
            "closed" => Ok(LegState::Closed),
            "cancelled" => Ok(LegState::Cancelled),
            other => Err(format!("unknown leg state {other:?}")),
        }
    }
}

/// A leg as recorded in the ledger, owned by its signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegRecord {
    pub fingerprint: Fingerprint,

    /// 1-based leg index within the signal
    pub leg: u32,

    /// Order/position ticket once accepted by the gateway
    pub ticket: Option<Ticket>,

    pub mode: EntryMode,

    /// Price the leg was submitted at (current price for immediate legs)
    pub entry_price: Decimal,

    pub stop_loss: Decimal,

    /// None for runner legs
    pub take_profit: Option<Decimal>,

    /// Take-profit level this leg targets (1 = tp1), None for runners
    pub target_level: Option<usize>,

    pub runner: bool,

    pub state: LegState,
}
