//! Tracked position under supervision and its stop-loss state machine.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::api::Ticket;

use super::{Direction, Fingerprint};

/// Stop-loss management phase of one position.
///
/// Breakeven and trailing are separate branches: once `BreakevenApplied`
/// is reached the position never re-enters breakeven logic, and once a
/// trailing variant is reached it stays trailing for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum StopState {
    /// Stop-loss left as submitted
    Fixed,
    /// Stop locked at open price (plus offset); breakeven never reapplies
    BreakevenApplied,
    /// Trailing armed, stop not yet moved by it
    TrailingEligible { best: Decimal },
    /// Trailing has moved the stop at least once
    TrailingActive { best: Decimal },
}

impl StopState {
    pub fn is_trailing(&self) -> bool {
        matches!(
            self,
            StopState::TrailingEligible { .. } | StopState::TrailingActive { .. }
        )
    }

    /// High-water mark (BUY) or low-water mark (SELL) while trailing.
    pub fn best(&self) -> Option<Decimal> {
        match self {
            StopState::TrailingEligible { best } | StopState::TrailingActive { best } => {
                Some(*best)
            }
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            StopState::Fixed => "fixed",
            StopState::BreakevenApplied => "breakeven",
            StopState::TrailingEligible { .. } => "trailing_eligible",
            StopState::TrailingActive { .. } => "trailing_active",
        }
    }
}

/// A filled leg being supervised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedPosition {
    pub ticket: Ticket,

    /// Owning signal
    pub fingerprint: Fingerprint,

    pub leg: u32,

    pub symbol: String,

    pub direction: Direction,

    pub open_price: Decimal,

    /// Current stop-loss as last confirmed by the gateway
    pub stop_loss: Option<Decimal>,

    pub take_profit: Option<Decimal>,

    /// Price that arms breakeven (signal middle or last entry)
    pub breakeven_trigger: Decimal,

    /// Runner legs carry no take-profit and only trail after activation
    pub runner: bool,

    pub state: StopState,

    /// Last price observed for this ticket
    pub last_price: Option<Decimal>,
}

impl TrackedPosition {
    pub fn breakeven_applied(&self) -> bool {
        self.state == StopState::BreakevenApplied
    }

    pub fn trailing_active(&self) -> bool {
        self.state.is_trailing()
    }

    pub fn best_price(&self) -> Option<Decimal> {
        self.state.best()
    }

    /// Whether `candidate` tightens the current stop. A missing stop is
    /// tightened by any candidate.
    pub fn tightens(&self, candidate: Decimal) -> bool {
        match self.stop_loss {
            Some(current) => self.direction.improves(candidate, current),
            None => true,
        }
    }

    /// Take the venue's live stop when it is tighter than the cached one.
    /// Returns whether the cached stop changed.
    pub fn merge_live_stop(&mut self, live: Option<Decimal>) -> bool {
        match live {
            Some(live) if self.tightens(live) => {
                self.stop_loss = Some(live);
                true
            }
            _ => false,
        }
    }

    /// Whether a runner leg is still waiting for the final target.
    pub fn awaiting_activation(&self) -> bool {
        self.runner && self.state == StopState::Fixed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn make_position(direction: Direction, stop_loss: Option<Decimal>) -> TrackedPosition {
        TrackedPosition {
            ticket: 7,
            fingerprint: Fingerprint::from("abc"),
            leg: 1,
            symbol: "XAUUSD".to_string(),
            direction,
            open_price: dec!(100),
            stop_loss,
            take_profit: None,
            breakeven_trigger: dec!(99),
            runner: true,
            state: StopState::Fixed,
            last_price: None,
        }
    }

    #[test]
    fn test_tightens_by_direction() {
        let buy = make_position(Direction::Buy, Some(dec!(95)));
        assert!(buy.tightens(dec!(96)));
        assert!(!buy.tightens(dec!(95)));

        let sell = make_position(Direction::Sell, Some(dec!(105)));
        assert!(sell.tightens(dec!(104)));
        assert!(!sell.tightens(dec!(106)));

        let naked = make_position(Direction::Buy, None);
        assert!(naked.tightens(dec!(1)));
    }

    #[test]
    fn test_flags_follow_state() {
        let mut position = make_position(Direction::Buy, Some(dec!(95)));
        assert!(position.awaiting_activation());
        assert!(!position.trailing_active());

        position.state = StopState::TrailingEligible { best: dec!(110) };
        assert!(position.trailing_active());
        assert_eq!(position.best_price(), Some(dec!(110)));
        assert!(!position.awaiting_activation());
    }
}
