//! Entry planner: turns a validated signal into per-leg orders.
//!
//! Planning is a pure function of the signal, the current price and the
//! leg table; [`EntryPlanner::submit`] adds deduplication, placement and
//! ledger bookkeeping around it.

use std::sync::Arc;

use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::api::{
    with_timeout, ClientTag, GatewayError, OrderGateway, OrderKind, OrderRequest, PriceSource,
    Ticket,
};
use crate::db::{advance_status, LedgerError, SignalLedger};
use crate::models::{EntryMode, Fingerprint, LegRecord, LegState, Signal, SignalStatus};

use super::config::{StagedEntry, TradingConfig};
use super::legs::TargetSelector;

/// Why a leg was not submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Price swept past the entry and another leg took the market fill
    EntryPassed,
    /// The leg's take-profit is already reached at the current price
    TargetAlreadyReached,
}

/// Planning decision for one leg.
#[derive(Debug, Clone, PartialEq)]
pub struct LegDecision {
    /// 1-based leg index
    pub leg: u32,
    pub mode: EntryMode,
    pub skip_reason: Option<SkipReason>,
    /// Entry from the leg table
    pub nominal_entry: Decimal,
    /// Price submitted: the nominal entry, or the current price for immediate legs
    pub price: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Option<Decimal>,
    pub target_level: Option<usize>,
    pub runner: bool,
}

/// Decide, per leg, whether to rest a limit order, go to market or skip.
///
/// A leg is crossed when the current price has reached its entry in the
/// signal's direction (inclusive) or sits within `min_limit_distance` of it.
pub fn plan(signal: &Signal, current_price: Decimal, config: &TradingConfig) -> Vec<LegDecision> {
    let direction = signal.direction();

    let mut decisions: Vec<LegDecision> = config
        .leg_table()
        .iter()
        .enumerate()
        .map(|(i, row)| {
            let (take_profit, target_level) = match row.target {
                TargetSelector::Level(level) => {
                    let level = signal.target_level(level);
                    (Some(signal.take_profit(level)), Some(level))
                }
                TargetSelector::Runner => (None, None),
            };
            let entry = row.entry.resolve(signal);
            LegDecision {
                leg: i as u32 + 1,
                mode: EntryMode::Resting,
                skip_reason: None,
                nominal_entry: entry,
                price: entry,
                stop_loss: signal.stop_loss(row.stop_loss_level),
                take_profit,
                target_level,
                runner: row.is_runner(),
            }
        })
        .collect();

    let crossed = |entry: Decimal| {
        direction.reached(current_price, entry)
            || (config.min_limit_distance > Decimal::ZERO
                && (entry - current_price).abs() < config.min_limit_distance)
    };

    // Nearest crossed entry; ties go to the lower leg index.
    let nearest = decisions
        .iter()
        .filter(|d| crossed(d.nominal_entry))
        .min_by_key(|d| ((d.nominal_entry - current_price).abs(), d.leg))
        .map(|d| d.leg);

    for decision in decisions.iter_mut() {
        if !crossed(decision.nominal_entry) {
            continue;
        }
        let to_market = match config.staged_entry {
            StagedEntry::MarketAll => true,
            StagedEntry::NearestOnly => nearest == Some(decision.leg),
        };
        if !to_market {
            decision.mode = EntryMode::Skip;
            decision.skip_reason = Some(SkipReason::EntryPassed);
            continue;
        }
        decision.mode = EntryMode::Immediate;
        decision.price = current_price;
        if decision
            .take_profit
            .is_some_and(|tp| direction.reached(current_price, tp))
        {
            decision.mode = EntryMode::Skip;
            decision.skip_reason = Some(SkipReason::TargetAlreadyReached);
        }
    }

    decisions
}

/// Result of submitting one leg.
#[derive(Debug, Clone, PartialEq)]
pub enum LegResult {
    Skipped(SkipReason),
    Placed(Ticket),
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LegOutcome {
    pub decision: LegDecision,
    pub result: LegResult,
}

/// What happened to a planned signal.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanReport {
    pub fingerprint: Fingerprint,
    pub current_price: Decimal,
    pub status: SignalStatus,
    pub legs: Vec<LegOutcome>,
}

impl PlanReport {
    pub fn placed(&self) -> usize {
        self.legs
            .iter()
            .filter(|l| matches!(l.result, LegResult::Placed(_)))
            .count()
    }
}

/// Outcome of [`EntryPlanner::submit`].
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    Planned(PlanReport),
    /// Fingerprint already known and still live; nothing placed
    Duplicate(SignalStatus),
    /// Fingerprint reached a terminal status earlier; nothing placed
    AlreadyCompleted(SignalStatus),
    /// Refused by an entry guard
    Blocked(String),
}

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("no price for {symbol}: {source}")]
    Price {
        symbol: String,
        #[source]
        source: GatewayError,
    },

    #[error("failed to list open positions: {0}")]
    Positions(#[source] GatewayError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Places the legs of incoming signals.
pub struct EntryPlanner {
    gateway: Arc<dyn OrderGateway>,
    prices: Arc<dyn PriceSource>,
    ledger: Arc<dyn SignalLedger>,
    config: Arc<TradingConfig>,
}

impl EntryPlanner {
    pub fn new(
        gateway: Arc<dyn OrderGateway>,
        prices: Arc<dyn PriceSource>,
        ledger: Arc<dyn SignalLedger>,
        config: Arc<TradingConfig>,
    ) -> Self {
        Self {
            gateway,
            prices,
            ledger,
            config,
        }
    }

    /// Deduplicate, plan and place a signal.
    pub async fn submit(&self, signal: &Signal) -> Result<SubmitOutcome, PlanError> {
        let fingerprint = signal.fingerprint();
        let timeout = self.config.call_timeout();

        if let Some(status) = self.ledger.get(fingerprint).await? {
            return Ok(if status.is_terminal() {
                info!(fingerprint = %fingerprint, status = %status, "Signal already completed, ignoring");
                SubmitOutcome::AlreadyCompleted(status)
            } else {
                debug!(fingerprint = %fingerprint, status = %status, "Duplicate signal, ignoring");
                SubmitOutcome::Duplicate(status)
            });
        }

        let current_price = with_timeout(
            timeout,
            self.prices
                .get_price(signal.symbol(), signal.direction().entry_side()),
        )
        .await
        .map_err(|source| PlanError::Price {
            symbol: signal.symbol().to_string(),
            source,
        })?;

        if self.config.block_opposite_positions {
            let positions = with_timeout(timeout, self.gateway.list_open_positions())
                .await
                .map_err(PlanError::Positions)?;
            let opposite = signal.direction().opposite();
            let blocking = positions
                .iter()
                .filter(|p| p.symbol == signal.symbol() && p.direction == opposite)
                .count();
            if blocking > 0 {
                let reason = format!("{blocking} open {opposite} position(s) on {}", signal.symbol());
                warn!(fingerprint = %fingerprint, reason = %reason, "Signal blocked");
                return Ok(SubmitOutcome::Blocked(reason));
            }
        }

        let decisions = plan(signal, current_price, &self.config);

        // Claim the fingerprint before touching the venue; a concurrent
        // delivery of the same signal loses here.
        if !self.ledger.insert_pending(signal).await? {
            let status = self.ledger.get(fingerprint).await?.unwrap_or(SignalStatus::Pending);
            return Ok(SubmitOutcome::Duplicate(status));
        }

        info!(
            fingerprint = %fingerprint,
            symbol = %signal.symbol(),
            direction = %signal.direction(),
            price = %current_price,
            "Planning signal"
        );

        let mut legs = Vec::with_capacity(decisions.len());
        for decision in decisions {
            let result = self.place_leg(signal, &decision).await;
            let (ticket, state) = match &result {
                LegResult::Skipped(_) => (None, LegState::Skipped),
                LegResult::Placed(ticket) => (Some(*ticket), LegState::Placed),
                LegResult::Rejected(_) => (None, LegState::Rejected),
            };
            self.ledger
                .record_leg(&LegRecord {
                    fingerprint: fingerprint.clone(),
                    leg: decision.leg,
                    ticket,
                    mode: decision.mode,
                    entry_price: decision.price,
                    stop_loss: decision.stop_loss,
                    take_profit: decision.take_profit,
                    target_level: decision.target_level,
                    runner: decision.runner,
                    state,
                })
                .await?;
            legs.push(LegOutcome { decision, result });
        }

        let placed = |mode: EntryMode| {
            legs.iter()
                .any(|l| l.decision.mode == mode && matches!(l.result, LegResult::Placed(_)))
        };
        let target = if placed(EntryMode::Immediate) {
            Some(SignalStatus::Active)
        } else if placed(EntryMode::Resting) {
            None
        } else {
            Some(SignalStatus::Cancelled)
        };
        if let Some(target) = target {
            advance_status(self.ledger.as_ref(), fingerprint, target).await?;
        }
        let status = self.ledger.get(fingerprint).await?.unwrap_or(SignalStatus::Pending);

        let report = PlanReport {
            fingerprint: fingerprint.clone(),
            current_price,
            status,
            legs,
        };
        info!(
            fingerprint = %fingerprint,
            placed = report.placed(),
            legs = report.legs.len(),
            status = %status,
            "Signal planned"
        );
        Ok(SubmitOutcome::Planned(report))
    }

    async fn place_leg(&self, signal: &Signal, decision: &LegDecision) -> LegResult {
        let fingerprint = signal.fingerprint();
        let kind = match decision.mode {
            EntryMode::Skip => {
                let reason = decision.skip_reason.unwrap_or(SkipReason::EntryPassed);
                info!(fingerprint = %fingerprint, leg = decision.leg, entry = %decision.nominal_entry, reason = ?reason, "Leg skipped");
                return LegResult::Skipped(reason);
            }
            EntryMode::Resting => OrderKind::Limit,
            EntryMode::Immediate => OrderKind::Market,
        };

        let request = OrderRequest {
            symbol: signal.symbol().to_string(),
            direction: signal.direction(),
            kind,
            price: decision.price,
            volume: self.config.leg_volume,
            stop_loss: Some(decision.stop_loss),
            take_profit: decision.take_profit,
            client_tag: ClientTag::new(fingerprint.clone(), decision.leg).to_string(),
        };

        match with_timeout(self.config.call_timeout(), self.gateway.place_order(&request)).await {
            Ok(ticket) => {
                info!(
                    fingerprint = %fingerprint,
                    leg = decision.leg,
                    ticket,
                    kind = ?kind,
                    price = %decision.price,
                    stop_loss = %decision.stop_loss,
                    take_profit = ?decision.take_profit,
                    "Leg placed"
                );
                LegResult::Placed(ticket)
            }
            Err(e) => {
                warn!(fingerprint = %fingerprint, leg = decision.leg, kind = ?kind, error = %e, "Leg rejected");
                LegResult::Rejected(e.to_string())
            }
        }
    }
}
