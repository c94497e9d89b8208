//! Signal lifecycle status and its forward-only transition rules.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a signal as persisted in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalStatus {
    /// Accepted, no leg filled yet
    Pending,
    /// At least one leg filled
    Active,
    /// First target reached by at least one leg
    Tp1Hit,
    /// Final target reached; terminal
    Tp2Hit,
    /// Every leg closed at a loss before any target; terminal
    Expired,
    /// Nothing could be placed or every resting order vanished unfilled; terminal
    Cancelled,
}

impl SignalStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SignalStatus::Tp2Hit | SignalStatus::Expired | SignalStatus::Cancelled
        )
    }

    /// Whether the ledger may move a signal from `self` to `next`.
    ///
    /// Transitions only go forward and may skip steps (a resting signal can
    /// jump straight to `tp2_hit` when price reaches the final target).
    /// Terminal statuses never change.
    pub fn can_advance_to(self, next: SignalStatus) -> bool {
        use SignalStatus::*;
        match self {
            Pending => matches!(next, Active | Tp1Hit | Tp2Hit | Expired | Cancelled),
            Active => matches!(next, Tp1Hit | Tp2Hit | Expired),
            Tp1Hit => matches!(next, Tp2Hit),
            Tp2Hit | Expired | Cancelled => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SignalStatus::Pending => "pending",
            SignalStatus::Active => "active",
            SignalStatus::Tp1Hit => "tp1_hit",
            SignalStatus::Tp2Hit => "tp2_hit",
            SignalStatus::Expired => "expired",
            SignalStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SignalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SignalStatus::Pending),
            "active" => Ok(SignalStatus::Active),
            "tp1_hit" => Ok(SignalStatus::Tp1Hit),
            "tp2_hit" => Ok(SignalStatus::Tp2Hit),
            "expired" => Ok(SignalStatus::Expired),
            "cancelled" => Ok(SignalStatus::Cancelled),
            other => Err(format!("unknown signal status {other:?}")),
        }
    }
}
