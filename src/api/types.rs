//! Gateway-facing request and snapshot types.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::{Direction, Fingerprint};

/// Venue-assigned identifier of an order; the position it fills keeps it.
pub type Ticket = u64;

/// Quote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceSide {
    Bid,
    Ask,
}

impl PriceSide {
    pub fn as_str(self) -> &'static str {
        match self {
            PriceSide::Bid => "bid",
            PriceSide::Ask => "ask",
        }
    }
}

/// Order kind as submitted to the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderKind {
    Limit,
    Market,
}

/// Order placement request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub direction: Direction,
    pub kind: OrderKind,
    pub price: Decimal,
    pub volume: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<Decimal>,
    pub client_tag: String,
}

/// Open position as reported by the venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub ticket: Ticket,
    pub symbol: String,
    pub direction: Direction,
    pub volume: Decimal,
    pub open_price: Decimal,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    #[serde(default)]
    pub take_profit: Option<Decimal>,
    pub current_price: Decimal,
    #[serde(default)]
    pub client_tag: Option<String>,
}

/// Resting order as reported by the venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSnapshot {
    pub ticket: Ticket,
    pub symbol: String,
    pub direction: Direction,
    pub volume: Decimal,
    pub entry_price: Decimal,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    #[serde(default)]
    pub take_profit: Option<Decimal>,
    #[serde(default)]
    pub client_tag: Option<String>,
}

/// Attribution tag attached to every order: `{fingerprint}_leg{n}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientTag {
    pub fingerprint: Fingerprint,
    pub leg: u32,
}

impl ClientTag {
    pub fn new(fingerprint: Fingerprint, leg: u32) -> Self {
        Self { fingerprint, leg }
    }

    /// Parse an optional tag, ignoring orders not placed by this system.
    pub fn parse(tag: Option<&str>) -> Option<Self> {
        tag.and_then(|t| t.parse().ok())
    }
}

impl fmt::Display for ClientTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_leg{}", self.fingerprint, self.leg)
    }
}

impl FromStr for ClientTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (fingerprint, leg) = s
            .rsplit_once("_leg")
            .ok_or_else(|| format!("not a client tag: {s:?}"))?;
        if fingerprint.is_empty() {
            return Err(format!("client tag without fingerprint: {s:?}"));
        }
        let leg = leg
            .parse::<u32>()
            .map_err(|e| format!("bad leg in client tag {s:?}: {e}"))?;
        Ok(Self::new(Fingerprint::from(fingerprint), leg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_tag_format() {
        let tag = ClientTag::new(Fingerprint::from("9f2c11aa03b4e5d6"), 3);
        assert_eq!(tag.to_string(), "9f2c11aa03b4e5d6_leg3");
        assert_eq!("9f2c11aa03b4e5d6_leg3".parse::<ClientTag>().unwrap(), tag);
    }

    #[test]
    fn test_foreign_tags_are_ignored() {
        assert_eq!(ClientTag::parse(Some("manual trade")), None);
        assert_eq!(ClientTag::parse(Some("_leg2")), None);
        assert_eq!(ClientTag::parse(Some("abc_legx")), None);
        assert_eq!(ClientTag::parse(None), None);
    }
}
