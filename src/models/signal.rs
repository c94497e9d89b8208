//! Parsed trading signal, its direction semantics and deduplication fingerprint.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::api::PriceSide;

/// Trade direction of a signal and every leg derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    /// Quote side used to enter (ask for BUY, bid for SELL).
    pub fn entry_side(self) -> PriceSide {
        match self {
            Direction::Buy => PriceSide::Ask,
            Direction::Sell => PriceSide::Bid,
        }
    }

    /// Quote side a position is closed at.
    pub fn exit_side(self) -> PriceSide {
        match self {
            Direction::Buy => PriceSide::Bid,
            Direction::Sell => PriceSide::Ask,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Direction::Buy => Direction::Sell,
            Direction::Sell => Direction::Buy,
        }
    }

    /// Whether `price` has reached or passed `level` in the favorable direction.
    /// The boundary is inclusive.
    pub fn reached(self, price: Decimal, level: Decimal) -> bool {
        match self {
            Direction::Buy => price >= level,
            Direction::Sell => price <= level,
        }
    }

    /// Whether `candidate` is strictly more favorable than `current` for a stop or mark.
    pub fn improves(self, candidate: Decimal, current: Decimal) -> bool {
        match self {
            Direction::Buy => candidate > current,
            Direction::Sell => candidate < current,
        }
    }

    /// Move `level` by `distance` in the favorable direction.
    pub fn ahead(self, level: Decimal, distance: Decimal) -> Decimal {
        match self {
            Direction::Buy => level + distance,
            Direction::Sell => level - distance,
        }
    }

    /// Move `level` by `distance` against the position.
    pub fn behind(self, level: Decimal, distance: Decimal) -> Decimal {
        match self {
            Direction::Buy => level - distance,
            Direction::Sell => level + distance,
        }
    }

    /// The more favorable of two prices.
    pub fn best(self, a: Decimal, b: Decimal) -> Decimal {
        if self.improves(b, a) {
            b
        } else {
            a
        }
    }

    /// Favorable excursion of `price` measured from `open`; negative when underwater.
    pub fn excursion(self, open: Decimal, price: Decimal) -> Decimal {
        match self {
            Direction::Buy => price - open,
            Direction::Sell => open - price,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Buy => "BUY",
            Direction::Sell => "SELL",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Direction {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BUY" => Ok(Direction::Buy),
            "SELL" => Ok(Direction::Sell),
            other => Err(ValidationError::UnknownDirection(other.to_string())),
        }
    }
}

/// Reasons a signal is refused before any order is placed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("unknown direction {0:?}")]
    UnknownDirection(String),

    #[error("symbol is empty")]
    EmptySymbol,

    #[error("price {0} must be positive")]
    NonPositivePrice(Decimal),

    #[error("upper entry {upper} is below lower entry {lower}")]
    InvertedEntries { upper: Decimal, lower: Decimal },

    #[error("middle entry {middle} is outside {lower}..={upper}")]
    MiddleOutOfRange {
        middle: Decimal,
        lower: Decimal,
        upper: Decimal,
    },

    #[error("at least one stop-loss level is required")]
    MissingStopLoss,

    #[error("at least one take-profit level is required")]
    MissingTakeProfit,

    #[error("{direction} stop-loss {stop_loss} is not beyond the entry zone")]
    StopLossOnWrongSide {
        direction: Direction,
        stop_loss: Decimal,
    },

    #[error("{direction} take-profit {take_profit} is not beyond the entry zone")]
    TakeProfitOnWrongSide {
        direction: Direction,
        take_profit: Decimal,
    },
}

/// Deterministic identity of a signal: direction, symbol and entry levels.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    const LEN: usize = 16;

    pub fn compute(
        direction: Direction,
        symbol: &str,
        upper: Decimal,
        middle: Decimal,
        lower: Decimal,
    ) -> Self {
        let canonical = format!(
            "{}|{}|{}|{}|{}",
            direction,
            symbol,
            upper.normalize(),
            middle.normalize(),
            lower.normalize()
        );
        let hash = blake3::hash(canonical.as_bytes()).to_hex();
        Self(hash.as_str()[..Self::LEN].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Fingerprint {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Fingerprint {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Wire shape of a parsed signal as delivered by the upstream feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalInput {
    pub direction: Direction,
    pub symbol: String,
    pub entry_upper: Decimal,
    pub entry_lower: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_middle: Option<Decimal>,
    pub stop_losses: Vec<Decimal>,
    pub take_profits: Vec<Decimal>,
}

/// A validated trading signal.
///
/// Only constructible through [`Signal::new`] (or deserialization, which
/// routes through it), so every instance satisfies the price ordering
/// `tp > entry > sl` for BUY and the reverse for SELL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SignalInput", into = "SignalInput")]
pub struct Signal {
    direction: Direction,
    symbol: String,
    upper: Decimal,
    middle: Decimal,
    lower: Decimal,
    stop_losses: Vec<Decimal>,
    take_profits: Vec<Decimal>,
    fingerprint: Fingerprint,
}

impl Signal {
    pub fn new(input: SignalInput) -> Result<Self, ValidationError> {
        let symbol = input.symbol.trim().to_ascii_uppercase();
        if symbol.is_empty() {
            return Err(ValidationError::EmptySymbol);
        }

        let upper = input.entry_upper;
        let lower = input.entry_lower;
        if upper < lower {
            return Err(ValidationError::InvertedEntries { upper, lower });
        }
        let middle = match input.entry_middle {
            Some(m) => m,
            None => ((upper + lower) / Decimal::TWO).normalize(),
        };
        if middle < lower || middle > upper {
            return Err(ValidationError::MiddleOutOfRange {
                middle,
                lower,
                upper,
            });
        }

        if input.stop_losses.is_empty() {
            return Err(ValidationError::MissingStopLoss);
        }
        if input.take_profits.is_empty() {
            return Err(ValidationError::MissingTakeProfit);
        }

        let all_prices = [upper, middle, lower]
            .into_iter()
            .chain(input.stop_losses.iter().copied())
            .chain(input.take_profits.iter().copied());
        for price in all_prices {
            if price <= Decimal::ZERO {
                return Err(ValidationError::NonPositivePrice(price));
            }
        }

        let direction = input.direction;
        // Zone bounds as seen from the position: stops sit behind the last
        // entry to fill, targets beyond the first.
        let (stop_bound, target_bound) = match direction {
            Direction::Buy => (lower, upper),
            Direction::Sell => (upper, lower),
        };
        if let Some(&stop_loss) = input
            .stop_losses
            .iter()
            .find(|&&sl| !direction.improves(stop_bound, sl))
        {
            return Err(ValidationError::StopLossOnWrongSide {
                direction,
                stop_loss,
            });
        }
        if let Some(&take_profit) = input
            .take_profits
            .iter()
            .find(|&&tp| !direction.improves(tp, target_bound))
        {
            return Err(ValidationError::TakeProfitOnWrongSide {
                direction,
                take_profit,
            });
        }

        let fingerprint = Fingerprint::compute(direction, &symbol, upper, middle, lower);

        Ok(Self {
            direction,
            symbol,
            upper,
            middle,
            lower,
            stop_losses: input.stop_losses,
            take_profits: input.take_profits,
            fingerprint,
        })
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn upper(&self) -> Decimal {
        self.upper
    }

    pub fn middle(&self) -> Decimal {
        self.middle
    }

    pub fn lower(&self) -> Decimal {
        self.lower
    }

    /// Entry the market is expected to reach first: upper for BUY, lower for SELL.
    pub fn first_entry(&self) -> Decimal {
        match self.direction {
            Direction::Buy => self.upper,
            Direction::Sell => self.lower,
        }
    }

    /// Entry at the far end of the zone: lower for BUY, upper for SELL.
    pub fn last_entry(&self) -> Decimal {
        match self.direction {
            Direction::Buy => self.lower,
            Direction::Sell => self.upper,
        }
    }

    pub fn stop_losses(&self) -> &[Decimal] {
        &self.stop_losses
    }

    pub fn take_profits(&self) -> &[Decimal] {
        &self.take_profits
    }

    /// Stop-loss by 1-based level, clamped to the last supplied level.
    pub fn stop_loss(&self, level: usize) -> Decimal {
        clamped(&self.stop_losses, level)
    }

    /// Take-profit by 1-based level, clamped to the last supplied level.
    pub fn take_profit(&self, level: usize) -> Decimal {
        clamped(&self.take_profits, level)
    }

    /// Highest take-profit level this signal actually defines, capped at `level`.
    pub fn target_level(&self, level: usize) -> usize {
        level.clamp(1, self.take_profits.len())
    }
}

fn clamped(levels: &[Decimal], level: usize) -> Decimal {
    let idx = level.saturating_sub(1).min(levels.len() - 1);
    levels[idx]
}

impl TryFrom<SignalInput> for Signal {
    type Error = ValidationError;

    fn try_from(input: SignalInput) -> Result<Self, Self::Error> {
        Signal::new(input)
    }
}

impl From<Signal> for SignalInput {
    fn from(signal: Signal) -> Self {
        SignalInput {
            direction: signal.direction,
            symbol: signal.symbol,
            entry_upper: signal.upper,
            entry_lower: signal.lower,
            entry_middle: Some(signal.middle),
            stop_losses: signal.stop_losses,
            take_profits: signal.take_profits,
        }
    }
}
