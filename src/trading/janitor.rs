//! Target-hit detection and signal completion.
//!
//! Runs once per bot tick against a fresh view of the venue. Closed legs are
//! classified by exit price; reaching the final target completes the signal,
//! cancels whatever is still resting and hands the runner to the trailing
//! stop. Every step is a compare-and-set on the ledger, so observing the same
//! closure twice does nothing the second time.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use backoff::ExponentialBackoffBuilder;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::api::{
    with_timeout, CancelOutcome, ClientTag, GatewayError, OrderGateway, OrderSnapshot,
    PositionSnapshot, PriceSource, Ticket,
};
use crate::db::{advance_status, LedgerError, SignalLedger};
use crate::models::{Direction, Fingerprint, LegRecord, LegState, SignalStatus};

use super::config::TradingConfig;
use super::supervisor::PositionSupervisor;

/// How a closed leg ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Closure {
    /// Exit at or beyond the leg's take-profit, tagged with its target level
    Target(usize),
    Loss,
    /// Manual close in profit, or no exit price available
    Other,
}

/// Classify an exit against the leg's entry and take-profit.
pub fn classify(
    direction: Direction,
    open_price: Decimal,
    take_profit: Option<Decimal>,
    target_level: Option<usize>,
    exit: Option<Decimal>,
) -> Closure {
    let Some(exit) = exit else {
        return Closure::Other;
    };
    if let (Some(tp), Some(level)) = (take_profit, target_level) {
        if direction.reached(exit, tp) {
            return Closure::Target(level);
        }
    }
    if direction.excursion(open_price, exit) < Decimal::ZERO {
        Closure::Loss
    } else {
        Closure::Other
    }
}

/// What one reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub closed: usize,
    pub completed: Vec<Fingerprint>,
    pub first_targets: Vec<Fingerprint>,
    pub expired: Vec<Fingerprint>,
    pub withdrawn: Vec<Fingerprint>,
    pub cancelled_orders: usize,
    pub vanished_orders: usize,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Venue state observed at the start of a tick.
struct View<'a> {
    open: HashSet<Ticket>,
    resting: HashSet<Ticket>,
    positions: &'a [PositionSnapshot],
    orders: &'a [OrderSnapshot],
}

impl View<'_> {
    /// Whether the leg is an open position, possibly under a ticket the
    /// venue assigned on fill.
    fn holds(&self, leg: &LegRecord) -> bool {
        leg.ticket.is_some_and(|t| self.open.contains(&t))
            || self.positions.iter().any(|p| {
                ClientTag::parse(p.client_tag.as_deref())
                    .is_some_and(|tag| tag.fingerprint == leg.fingerprint && tag.leg == leg.leg)
            })
    }
}

pub struct TargetHitDetector {
    gateway: Arc<dyn OrderGateway>,
    prices: Arc<dyn PriceSource>,
    ledger: Arc<dyn SignalLedger>,
    supervisor: Arc<PositionSupervisor>,
    config: Arc<TradingConfig>,
}

impl TargetHitDetector {
    pub fn new(
        gateway: Arc<dyn OrderGateway>,
        prices: Arc<dyn PriceSource>,
        ledger: Arc<dyn SignalLedger>,
        supervisor: Arc<PositionSupervisor>,
        config: Arc<TradingConfig>,
    ) -> Self {
        Self {
            gateway,
            prices,
            ledger,
            supervisor,
            config,
        }
    }

    /// Reconcile the ledger with the venue's open positions and resting orders.
    ///
    /// Errors on one leg or signal are logged and do not stop the pass; only
    /// failing to read the ledger itself is returned.
    pub async fn reconcile(
        &self,
        positions: &[PositionSnapshot],
        orders: &[OrderSnapshot],
    ) -> Result<ReconcileReport, LedgerError> {
        let view = View {
            open: positions.iter().map(|p| p.ticket).collect(),
            resting: orders.iter().map(|o| o.ticket).collect(),
            positions,
            orders,
        };
        let mut report = ReconcileReport::default();

        // Positions that disappeared since the last tick.
        for leg in self.ledger.legs_in_state(LegState::Open).await? {
            let Some(ticket) = leg.ticket else { continue };
            if view.open.contains(&ticket) {
                continue;
            }
            if let Err(e) = self.settle_closure(&leg, ticket, LegState::Open, &view, &mut report).await {
                warn!(ticket, fingerprint = %leg.fingerprint, error = %e, "Failed to settle closed leg");
            }
        }

        // Resting orders: vanished, leftovers of finished signals, or watched
        // for a final target reached by price alone.
        let mut watched = BTreeSet::new();
        for leg in self.ledger.legs_in_state(LegState::Placed).await? {
            let Some(ticket) = leg.ticket else { continue };
            if view.holds(&leg) {
                continue;
            }
            let result = if !view.resting.contains(&ticket) {
                self.settle_vanished(&leg, ticket, &view, &mut report).await
            } else {
                match self.ledger.get(&leg.fingerprint).await {
                    Ok(Some(status)) if status.is_terminal() => {
                        self.cancel(&leg.fingerprint, ticket, Some(leg.leg), &mut report).await;
                        Ok(())
                    }
                    Ok(_) => {
                        watched.insert(leg.fingerprint.clone());
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            };
            if let Err(e) = result {
                warn!(ticket, fingerprint = %leg.fingerprint, error = %e, "Failed to reconcile resting leg");
            }
        }

        if self.config.final_target_by_price {
            for fingerprint in watched {
                if let Err(e) = self.check_price_target(&fingerprint, &view, &mut report).await {
                    warn!(fingerprint = %fingerprint, error = %e, "Final target check failed");
                }
            }
        }

        if !report.is_empty() {
            info!(
                closed = report.closed,
                completed = report.completed.len(),
                expired = report.expired.len(),
                cancelled = report.cancelled_orders,
                vanished = report.vanished_orders,
                "Reconciled with venue"
            );
        }
        Ok(report)
    }

    /// Record a closed position and act on how it ended.
    async fn settle_closure(
        &self,
        leg: &LegRecord,
        ticket: Ticket,
        from: LegState,
        view: &View<'_>,
        report: &mut ReconcileReport,
    ) -> Result<(), LedgerError> {
        let tracked = self.supervisor.forget(ticket).await;
        let fingerprint = &leg.fingerprint;
        if !self
            .ledger
            .try_set_leg_state(fingerprint, leg.leg, from, LegState::Closed)
            .await?
        {
            return Ok(());
        }
        report.closed += 1;

        let Some(signal) = self.ledger.signal(fingerprint).await? else {
            return Ok(());
        };
        let exit = match self.closing_price(ticket).await {
            Some(price) => Some(price),
            None => tracked.as_ref().and_then(|p| p.last_price),
        };
        let open_price = tracked.as_ref().map_or(leg.entry_price, |p| p.open_price);
        let closure = classify(
            signal.direction(),
            open_price,
            leg.take_profit,
            leg.target_level,
            exit,
        );
        info!(
            ticket,
            fingerprint = %fingerprint,
            leg = leg.leg,
            exit = ?exit,
            closure = ?closure,
            "Position closed"
        );

        match closure {
            Closure::Target(level) if level >= signal.target_level(self.config.final_target_level) => {
                self.complete_signal(fingerprint, view, report).await?;
            }
            Closure::Target(level) => {
                if advance_status(self.ledger.as_ref(), fingerprint, SignalStatus::Tp1Hit).await? {
                    info!(fingerprint = %fingerprint, level, "First target hit");
                    report.first_targets.push(fingerprint.clone());
                }
            }
            Closure::Loss => {
                if !self.has_live_legs(fingerprint).await?
                    && advance_status(self.ledger.as_ref(), fingerprint, SignalStatus::Expired).await?
                {
                    info!(fingerprint = %fingerprint, "Last leg lost, signal expired");
                    report.expired.push(fingerprint.clone());
                }
            }
            Closure::Other => {}
        }
        Ok(())
    }

    /// A resting order the venue no longer lists and that is not a position.
    async fn settle_vanished(
        &self,
        leg: &LegRecord,
        ticket: Ticket,
        view: &View<'_>,
        report: &mut ReconcileReport,
    ) -> Result<(), LedgerError> {
        // Filled and closed between two ticks.
        if self.closing_price(ticket).await.is_some() {
            return self.settle_closure(leg, ticket, LegState::Placed, view, report).await;
        }

        let fingerprint = &leg.fingerprint;
        if !self
            .ledger
            .try_set_leg_state(fingerprint, leg.leg, LegState::Placed, LegState::Cancelled)
            .await?
        {
            return Ok(());
        }
        info!(ticket, fingerprint = %fingerprint, leg = leg.leg, "Resting order vanished");
        report.vanished_orders += 1;

        if self.ledger.get(fingerprint).await? == Some(SignalStatus::Pending)
            && !self.has_live_legs(fingerprint).await?
            && advance_status(self.ledger.as_ref(), fingerprint, SignalStatus::Cancelled).await?
        {
            info!(fingerprint = %fingerprint, "No orders left, signal cancelled");
            report.withdrawn.push(fingerprint.clone());
        }
        Ok(())
    }

    async fn check_price_target(
        &self,
        fingerprint: &Fingerprint,
        view: &View<'_>,
        report: &mut ReconcileReport,
    ) -> Result<(), LedgerError> {
        let Some(signal) = self.ledger.signal(fingerprint).await? else {
            return Ok(());
        };
        let direction = signal.direction();
        let price = match with_timeout(
            self.config.call_timeout(),
            self.prices.get_price(signal.symbol(), direction.exit_side()),
        )
        .await
        {
            Ok(price) => price,
            Err(e) => {
                debug!(fingerprint = %fingerprint, error = %e, "No price for final target check");
                return Ok(());
            }
        };

        let target = signal.take_profit(self.config.final_target_level);
        if direction.reached(price, target) {
            info!(fingerprint = %fingerprint, price = %price, target = %target, "Final target reached by price");
            self.complete_signal(fingerprint, view, report).await?;
        }
        Ok(())
    }

    /// Move a signal to its final-target status, withdraw its resting orders
    /// and switch its runners to trailing. A second call is a no-op.
    async fn complete_signal(
        &self,
        fingerprint: &Fingerprint,
        view: &View<'_>,
        report: &mut ReconcileReport,
    ) -> Result<(), LedgerError> {
        if !advance_status(self.ledger.as_ref(), fingerprint, SignalStatus::Tp2Hit).await? {
            return Ok(());
        }
        info!(fingerprint = %fingerprint, "Final target hit");
        report.completed.push(fingerprint.clone());

        let mut tickets: BTreeMap<Ticket, Option<u32>> = BTreeMap::new();
        for leg in self.ledger.legs(fingerprint).await? {
            if let (LegState::Placed, Some(ticket)) = (leg.state, leg.ticket) {
                if !view.holds(&leg) {
                    tickets.insert(ticket, Some(leg.leg));
                }
            }
        }
        // Orders the ledger lost track of still carry the signal's tag.
        for order in view.orders {
            let owned = ClientTag::parse(order.client_tag.as_deref())
                .is_some_and(|tag| &tag.fingerprint == fingerprint);
            if owned {
                tickets.entry(order.ticket).or_insert(None);
            }
        }
        for (ticket, leg) in tickets {
            self.cancel(fingerprint, ticket, leg, report).await;
        }

        let activated = self.supervisor.activate_runners(fingerprint).await;
        if activated > 0 {
            info!(fingerprint = %fingerprint, runners = activated, "Runners trailing");
        }
        Ok(())
    }

    /// Cancel one resting order. Failures are left for the next tick's sweep.
    async fn cancel(
        &self,
        fingerprint: &Fingerprint,
        ticket: Ticket,
        leg: Option<u32>,
        report: &mut ReconcileReport,
    ) {
        let outcome = match self.cancel_with_retry(ticket).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(ticket, fingerprint = %fingerprint, error = %e, "Cancel failed, will retry next tick");
                return;
            }
        };
        if let Some(leg) = leg {
            if let Err(e) = self
                .ledger
                .try_set_leg_state(fingerprint, leg, LegState::Placed, LegState::Cancelled)
                .await
            {
                warn!(ticket, fingerprint = %fingerprint, error = %e, "Failed to record cancellation");
            }
        }
        if outcome == CancelOutcome::Cancelled {
            report.cancelled_orders += 1;
        }
        info!(ticket, fingerprint = %fingerprint, outcome = ?outcome, "Resting order withdrawn");
    }

    async fn cancel_with_retry(&self, ticket: Ticket) -> Result<CancelOutcome, GatewayError> {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.config.cancel_retry())
            .with_max_elapsed_time(Some(self.config.cancel_budget()))
            .build();
        let timeout = self.config.call_timeout();

        backoff::future::retry(policy, || async move {
            with_timeout(timeout, self.gateway.cancel_order(ticket))
                .await
                .map_err(|e| {
                    if e.is_transient() {
                        debug!(ticket, error = %e, "Cancel attempt failed");
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
        })
        .await
    }

    async fn closing_price(&self, ticket: Ticket) -> Option<Decimal> {
        match with_timeout(self.config.call_timeout(), self.gateway.closing_price(ticket)).await {
            Ok(price) => price,
            Err(e) => {
                debug!(ticket, error = %e, "Closing price unavailable");
                None
            }
        }
    }

    async fn has_live_legs(&self, fingerprint: &Fingerprint) -> Result<bool, LedgerError> {
        Ok(self
            .ledger
            .legs(fingerprint)
            .await?
            .iter()
            .any(|l| l.state.is_live()))
    }
}
