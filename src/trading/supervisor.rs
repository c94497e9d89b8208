//! Position supervisor: per-ticket stop-loss management on a fixed cadence.
//!
//! Every tracked ticket sits behind its own async mutex. All stop-loss
//! mutations (rule evaluation, runner activation, closure handling) take that
//! lock, so two writers never race on one ticket while distinct tickets are
//! processed in parallel by a bounded worker pool.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use rust_decimal::Decimal;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::api::{with_timeout, ClientTag, GatewayError, OrderGateway, PositionSnapshot, PriceSource, Ticket};
use crate::db::{advance_status, LedgerError, SignalLedger};
use crate::models::{Fingerprint, LegRecord, LegState, SignalStatus, TrackedPosition};

use super::config::TradingConfig;
use super::stop_rules;

type Handle = Arc<Mutex<TrackedPosition>>;

/// What one supervision pass did to a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Unchanged,
    Moved,
    Failed,
}

/// Counts from one supervision tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SupervisionSummary {
    pub checked: usize,
    pub modified: usize,
    pub failed: usize,
}

pub struct PositionSupervisor {
    gateway: Arc<dyn OrderGateway>,
    prices: Arc<dyn PriceSource>,
    ledger: Arc<dyn SignalLedger>,
    config: Arc<TradingConfig>,
    tracked: RwLock<HashMap<Ticket, Handle>>,
    /// Signals whose final target was reached; their runners trail
    completed: RwLock<HashSet<Fingerprint>>,
}

impl PositionSupervisor {
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
            tracked: RwLock::new(HashMap::new()),
            completed: RwLock::new(HashSet::new()),
        }
    }

    // ==================== Tracking ====================

    /// Start tracking open positions that belong to known signals.
    /// Tickets already tracked pick up their live stop-loss from the
    /// snapshot. Returns the number of newly tracked tickets.
    pub async fn adopt(&self, positions: &[PositionSnapshot]) -> usize {
        let mut adopted = 0;
        for snapshot in positions {
            let handle = self.tracked.read().await.get(&snapshot.ticket).cloned();
            if let Some(handle) = handle {
                let mut position = handle.lock().await;
                let cached = position.stop_loss;
                if position.merge_live_stop(snapshot.stop_loss) {
                    info!(
                        ticket = position.ticket,
                        fingerprint = %position.fingerprint,
                        from = ?cached,
                        to = ?position.stop_loss,
                        "Stop-loss tightened on venue"
                    );
                }
                continue;
            }
            match self.build_tracked(snapshot).await {
                Ok(Some(position)) => {
                    info!(
                        ticket = position.ticket,
                        fingerprint = %position.fingerprint,
                        leg = position.leg,
                        open = %position.open_price,
                        state = position.state.label(),
                        runner = position.runner,
                        "Tracking position"
                    );
                    self.tracked
                        .write()
                        .await
                        .insert(position.ticket, Arc::new(Mutex::new(position)));
                    adopted += 1;
                }
                Ok(None) => debug!(ticket = snapshot.ticket, "Position not owned by any signal"),
                Err(e) => warn!(ticket = snapshot.ticket, error = %e, "Failed to adopt position"),
            }
        }
        adopted
    }

    async fn resolve_leg(&self, snapshot: &PositionSnapshot) -> Result<Option<LegRecord>, LedgerError> {
        if let Some(leg) = self.ledger.leg_by_ticket(snapshot.ticket).await? {
            return Ok(Some(leg));
        }
        // Venue assigned a new ticket on fill: fall back to the client tag.
        let Some(tag) = ClientTag::parse(snapshot.client_tag.as_deref()) else {
            return Ok(None);
        };
        let Some(mut leg) = self
            .ledger
            .legs(&tag.fingerprint)
            .await?
            .into_iter()
            .find(|l| l.leg == tag.leg)
        else {
            return Ok(None);
        };
        leg.ticket = Some(snapshot.ticket);
        self.ledger.record_leg(&leg).await?;
        Ok(Some(leg))
    }

    async fn build_tracked(
        &self,
        snapshot: &PositionSnapshot,
    ) -> Result<Option<TrackedPosition>, LedgerError> {
        let Some(leg) = self.resolve_leg(snapshot).await? else {
            return Ok(None);
        };
        let fingerprint = leg.fingerprint.clone();
        let Some(signal) = self.ledger.signal(&fingerprint).await? else {
            return Ok(None);
        };

        if matches!(leg.state, LegState::Placed | LegState::Cancelled)
            && self
                .ledger
                .try_set_leg_state(&fingerprint, leg.leg, leg.state, LegState::Open)
                .await?
            && advance_status(self.ledger.as_ref(), &fingerprint, SignalStatus::Active).await?
        {
            info!(fingerprint = %fingerprint, leg = leg.leg, "Signal active");
        }

        let final_target_hit = self.completed.read().await.contains(&fingerprint)
            || self.ledger.get(&fingerprint).await? == Some(SignalStatus::Tp2Hit);
        let state = stop_rules::restored_state(
            snapshot.direction,
            snapshot.open_price,
            snapshot.stop_loss,
            snapshot.current_price,
            leg.runner,
            final_target_hit,
            &self.config,
        );
        if final_target_hit {
            self.completed.write().await.insert(fingerprint.clone());
        }

        Ok(Some(TrackedPosition {
            ticket: snapshot.ticket,
            fingerprint,
            leg: leg.leg,
            symbol: snapshot.symbol.clone(),
            direction: snapshot.direction,
            open_price: snapshot.open_price,
            stop_loss: snapshot.stop_loss,
            take_profit: snapshot.take_profit,
            breakeven_trigger: stop_rules::breakeven_trigger(&signal, &self.config),
            runner: leg.runner,
            state,
            last_price: Some(snapshot.current_price),
        }))
    }

    /// Stop tracking a ticket, waiting for any in-flight mutation on it.
    /// A completed signal is released with its last tracked ticket.
    pub async fn forget(&self, ticket: Ticket) -> Option<TrackedPosition> {
        let handle = self.tracked.write().await.remove(&ticket)?;
        let position = handle.lock().await.clone();
        debug!(ticket, "Position no longer tracked");
        if !self.tracks_signal(&position.fingerprint).await {
            self.completed.write().await.remove(&position.fingerprint);
        }
        Some(position)
    }

    async fn tracks_signal(&self, fingerprint: &Fingerprint) -> bool {
        for handle in self.handles().await {
            if &handle.lock().await.fingerprint == fingerprint {
                return true;
            }
        }
        false
    }

    pub async fn tracked_tickets(&self) -> Vec<Ticket> {
        let mut tickets: Vec<Ticket> = self.tracked.read().await.keys().copied().collect();
        tickets.sort_unstable();
        tickets
    }

    pub async fn position(&self, ticket: Ticket) -> Option<TrackedPosition> {
        let handle = self.tracked.read().await.get(&ticket).cloned()?;
        let position = handle.lock().await.clone();
        Some(position)
    }

    pub async fn positions(&self) -> Vec<TrackedPosition> {
        let mut positions = Vec::new();
        for handle in self.handles().await {
            positions.push(handle.lock().await.clone());
        }
        positions.sort_by_key(|p| p.ticket);
        positions
    }

    async fn handles(&self) -> Vec<Handle> {
        self.tracked.read().await.values().cloned().collect()
    }

    // ==================== Supervision ====================

    /// Evaluate every tracked ticket once.
    pub async fn tick(&self) -> SupervisionSummary {
        let handles = self.handles().await;
        let checked = handles.len();

        let passes: Vec<Pass> = stream::iter(handles)
            .map(|handle| async move {
                let mut position = handle.lock().await;
                self.supervise(&mut position).await
            })
            .buffer_unordered(self.config.max_workers.max(1))
            .collect()
            .await;

        let summary = SupervisionSummary {
            checked,
            modified: passes.iter().filter(|p| **p == Pass::Moved).count(),
            failed: passes.iter().filter(|p| **p == Pass::Failed).count(),
        };
        debug!(
            checked = summary.checked,
            modified = summary.modified,
            failed = summary.failed,
            "Supervision tick"
        );
        summary
    }

    /// One read-modify-write pass over a locked ticket.
    async fn supervise(&self, position: &mut TrackedPosition) -> Pass {
        let price = match with_timeout(
            self.config.call_timeout(),
            self.prices
                .get_price(&position.symbol, position.direction.exit_side()),
        )
        .await
        {
            Ok(price) => price,
            Err(e) => {
                warn!(
                    ticket = position.ticket,
                    fingerprint = %position.fingerprint,
                    symbol = %position.symbol,
                    error = %e,
                    "Price fetch failed, retrying next tick"
                );
                return Pass::Failed;
            }
        };
        position.last_price = Some(price);

        if position.awaiting_activation()
            && self.completed.read().await.contains(&position.fingerprint)
        {
            position.state = stop_rules::activate_runner(price);
            info!(
                ticket = position.ticket,
                fingerprint = %position.fingerprint,
                price = %price,
                "Runner switched to trailing"
            );
        }

        match self.apply_rules(position, price).await {
            Ok(true) => Pass::Moved,
            Ok(false) => Pass::Unchanged,
            Err(e) => {
                warn!(
                    ticket = position.ticket,
                    fingerprint = %position.fingerprint,
                    error = %e,
                    "Stop-loss update failed, retrying next tick"
                );
                Pass::Failed
            }
        }
    }

    async fn apply_rules(
        &self,
        position: &mut TrackedPosition,
        price: Decimal,
    ) -> Result<bool, GatewayError> {
        let decision = stop_rules::evaluate(position, price, &self.config);
        let Some(new_stop) = decision.new_stop else {
            position.state = decision.observed;
            return Ok(false);
        };

        match with_timeout(
            self.config.call_timeout(),
            self.gateway.modify_stop_loss(position.ticket, new_stop),
        )
        .await
        {
            Ok(()) => {
                info!(
                    ticket = position.ticket,
                    fingerprint = %position.fingerprint,
                    from = ?position.stop_loss,
                    to = %new_stop,
                    state = decision.applied.label(),
                    "Stop-loss moved"
                );
                position.stop_loss = Some(new_stop);
                position.state = decision.applied;
                Ok(true)
            }
            Err(e) => {
                position.state = decision.observed;
                Err(e)
            }
        }
    }

    /// Switch the open runner legs of `fingerprint` to trailing.
    ///
    /// The signal is remembered, so runners whose activation fails here (or
    /// that fill later) are switched on their next supervision pass.
    pub async fn activate_runners(&self, fingerprint: &Fingerprint) -> usize {
        self.completed.write().await.insert(fingerprint.clone());

        let mut activated = 0;
        let mut owned = false;
        for handle in self.handles().await {
            let mut position = handle.lock().await;
            if &position.fingerprint != fingerprint {
                continue;
            }
            owned = true;
            if !position.awaiting_activation() {
                continue;
            }
            self.supervise(&mut position).await;
            if !position.awaiting_activation() {
                activated += 1;
            }
        }
        // Late fills find the completed status in the ledger instead.
        if !owned {
            self.completed.write().await.remove(fingerprint);
        }
        activated
    }

    /// Wait for every in-flight per-ticket mutation to finish.
    pub async fn drain(&self) {
        let handles = self.handles().await;
        let count = handles.len();
        for handle in handles {
            drop(handle.lock().await);
        }
        info!(tickets = count, "Supervisor drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Direction, StopState};
    use crate::test_helpers::{gold_signal, silver_signal, test_config, Harness};
    use crate::trading::config::StopMode;
    use rust_decimal_macros::dec;
    use std::time::Duration;
    use tokio_test::assert_ok;

    /// Enter the gold signal's first leg at market (2650.60) and track it.
    async fn market_first_leg(h: &Harness) -> Ticket {
        h.venue.set_price("XAUUSD", dec!(2650.60)).await;
        h.planner.submit(&gold_signal()).await.unwrap();
        let open = h.venue.list_open_positions().await.unwrap();
        assert_eq!(h.supervisor.adopt(&open).await, 1);
        open[0].ticket
    }

    #[tokio::test]
    async fn test_resting_fill_marks_leg_open_and_signal_active() {
        let h = Harness::new(test_config()).await;
        let signal = gold_signal();
        h.venue.set_price("XAUUSD", dec!(2645.00)).await;
        h.planner.submit(&signal).await.unwrap();

        // Only the 2648.20 leg is reached.
        h.venue.set_price("XAUUSD", dec!(2648.50)).await;
        let open = h.venue.list_open_positions().await.unwrap();
        assert_eq!(h.supervisor.adopt(&open).await, 1);

        let ticket = open[0].ticket;
        let leg = h.ledger.leg_by_ticket(ticket).await.unwrap().unwrap();
        assert_eq!(leg.leg, 3);
        assert_eq!(leg.state, LegState::Open);
        assert_eq!(
            h.ledger.get(signal.fingerprint()).await.unwrap(),
            Some(SignalStatus::Active)
        );

        let position = h.supervisor.position(ticket).await.unwrap();
        assert!(position.runner);
        assert_eq!(position.breakeven_trigger, dec!(2649.35));
        assert_eq!(position.state, StopState::Fixed);

        // Adopting again is a no-op.
        assert_eq!(h.supervisor.adopt(&open).await, 0);
    }

    #[tokio::test]
    async fn test_foreign_positions_are_ignored() {
        let h = Harness::new(test_config()).await;
        let snapshot = PositionSnapshot {
            ticket: 900,
            symbol: "XAUUSD".to_string(),
            direction: Direction::Buy,
            volume: dec!(1),
            open_price: dec!(2000),
            stop_loss: None,
            take_profit: None,
            current_price: dec!(2001),
            client_tag: Some("manual".to_string()),
        };
        assert_eq!(h.supervisor.adopt(&[snapshot]).await, 0);
        assert!(h.supervisor.tracked_tickets().await.is_empty());
    }

    #[tokio::test]
    async fn test_breakeven_applied_once_through_gateway() {
        let h = Harness::new(test_config()).await;
        let ticket = market_first_leg(&h).await;

        for price in [dec!(2651.00), dec!(2650.80), dec!(2652.00), dec!(2650.90), dec!(2653.00)] {
            h.venue.set_price("XAUUSD", price).await;
            h.supervisor.tick().await;
        }

        assert_eq!(h.venue.stop_history(ticket).await, vec![dec!(2650.70)]);
        let position = h.supervisor.position(ticket).await.unwrap();
        assert!(position.breakeven_applied());
        assert_eq!(position.stop_loss, Some(dec!(2650.70)));
    }

    #[tokio::test]
    async fn test_rejected_modification_retries() {
        let h = Harness::new(test_config()).await;
        let ticket = market_first_leg(&h).await;
        h.venue.reject_next_modifications(1).await;

        h.venue.set_price("XAUUSD", dec!(2651.00)).await;
        let first = h.supervisor.tick().await;
        assert_eq!(first.failed, 1);
        assert!(h.venue.stop_history(ticket).await.is_empty());

        let second = h.supervisor.tick().await;
        assert_eq!(second.modified, 1);
        assert_eq!(h.venue.stop_history(ticket).await, vec![dec!(2650.70)]);
    }

    #[tokio::test]
    async fn test_trailing_stop_is_monotonic() {
        let mut config = test_config();
        config.stop_mode = StopMode::Trailing;
        config.trailing.activation = dec!(1.0);
        config.trailing.distance = dec!(0.8);
        let h = Harness::new(config).await;
        let ticket = market_first_leg(&h).await;

        let path = [
            dec!(2651.00),
            dec!(2652.00),
            dec!(2651.50),
            dec!(2653.40),
            dec!(2652.90),
            dec!(2654.10),
            dec!(2653.50),
        ];
        for price in path {
            h.venue.set_price("XAUUSD", price).await;
            h.supervisor.tick().await;
        }

        let history = h.venue.stop_history(ticket).await;
        assert_eq!(history, vec![dec!(2651.20), dec!(2652.60), dec!(2653.30)]);
        assert!(history.windows(2).all(|w| w[1] > w[0]));
    }

    #[tokio::test]
    async fn test_venue_tightened_stop_is_never_loosened() {
        let mut config = test_config();
        config.stop_mode = StopMode::Trailing;
        let h = Harness::new(config).await;
        let ticket = market_first_leg(&h).await;

        h.venue.set_price("XAUUSD", dec!(2656.00)).await;
        assert_ok!(h.venue.modify_stop_loss(ticket, dec!(2655.80)).await);
        let open = h.venue.list_open_positions().await.unwrap();
        assert_eq!(h.supervisor.adopt(&open).await, 0);

        let summary = h.supervisor.tick().await;
        assert_eq!(summary.modified, 0);
        let live = h.venue.position(ticket).await.unwrap();
        assert_eq!(live.stop_loss, Some(dec!(2655.80)));
        let position = h.supervisor.position(ticket).await.unwrap();
        assert_eq!(position.stop_loss, Some(dec!(2655.80)));
        assert_eq!(position.best_price(), Some(dec!(2656.00)));

        h.venue.set_price("XAUUSD", dec!(2657.00)).await;
        assert_eq!(h.supervisor.tick().await.modified, 1);
        assert_eq!(
            h.venue.stop_history(ticket).await,
            vec![dec!(2655.80), dec!(2656.50)]
        );
    }

    #[tokio::test]
    async fn test_breakeven_already_on_venue_is_not_resent() {
        let h = Harness::new(test_config()).await;
        let ticket = market_first_leg(&h).await;

        // The lock landed on the venue but its confirmation was lost.
        h.venue.set_price("XAUUSD", dec!(2651.00)).await;
        assert_ok!(h.venue.modify_stop_loss(ticket, dec!(2650.70)).await);
        let open = h.venue.list_open_positions().await.unwrap();
        h.supervisor.adopt(&open).await;

        for price in [dec!(2651.00), dec!(2652.00)] {
            h.venue.set_price("XAUUSD", price).await;
            assert_eq!(h.supervisor.tick().await.modified, 0);
        }
        assert_eq!(h.venue.stop_history(ticket).await, vec![dec!(2650.70)]);
        assert!(h.supervisor.position(ticket).await.unwrap().breakeven_applied());
    }

    #[tokio::test]
    async fn test_stalled_symbol_does_not_block_others() {
        let mut config = test_config();
        config.call_timeout_ms = 50;
        let h = Harness::new(config).await;
        let gold = market_first_leg(&h).await;

        h.venue.set_price("XAGUSD", dec!(31.60)).await;
        h.planner.submit(&silver_signal()).await.unwrap();
        let open = h.venue.list_open_positions().await.unwrap();
        assert_eq!(h.supervisor.adopt(&open).await, 1);

        h.venue.set_price("XAGUSD", dec!(31.90)).await;
        h.venue.set_price("XAUUSD", dec!(2651.00)).await;
        h.venue.stall_prices("XAUUSD").await;

        let summary = tokio::time::timeout(Duration::from_secs(5), h.supervisor.tick())
            .await
            .expect("tick must not hang on a stalled feed");
        assert_eq!(summary.checked, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.modified, 1);
        assert!(h.venue.stop_history(gold).await.is_empty());
    }

    #[tokio::test]
    async fn test_runner_activation_seeds_mark() {
        let h = Harness::new(test_config()).await;
        let signal = gold_signal();
        h.venue.set_price("XAUUSD", dec!(2645.00)).await;
        h.planner.submit(&signal).await.unwrap();
        // A jump through the zone fills every resting leg.
        h.venue.set_price("XAUUSD", dec!(2650.50)).await;
        let open = h.venue.list_open_positions().await.unwrap();
        assert_eq!(h.supervisor.adopt(&open).await, 3);

        let runner = h
            .supervisor
            .positions()
            .await
            .into_iter()
            .find(|p| p.runner)
            .unwrap();
        assert!(runner.awaiting_activation());

        h.venue.set_price("XAUUSD", dec!(2659.00)).await;
        assert_eq!(h.supervisor.activate_runners(signal.fingerprint()).await, 1);

        let runner = h.supervisor.position(runner.ticket).await.unwrap();
        assert!(runner.trailing_active());
        assert_eq!(runner.best_price(), Some(dec!(2659.00)));
        assert_eq!(runner.stop_loss, Some(dec!(2658.50)));

        assert_eq!(h.supervisor.activate_runners(signal.fingerprint()).await, 0);
    }

    #[tokio::test]
    async fn test_completed_signal_released_with_last_ticket() {
        let h = Harness::new(test_config()).await;
        let signal = gold_signal();
        let fingerprint = signal.fingerprint();
        h.venue.set_price("XAUUSD", dec!(2645.00)).await;
        h.planner.submit(&signal).await.unwrap();
        h.venue.set_price("XAUUSD", dec!(2650.50)).await;
        let open = h.venue.list_open_positions().await.unwrap();
        assert_eq!(h.supervisor.adopt(&open).await, 3);

        h.venue.set_price("XAUUSD", dec!(2659.00)).await;
        h.supervisor.activate_runners(fingerprint).await;
        assert!(h.supervisor.completed.read().await.contains(fingerprint));

        let tickets = h.supervisor.tracked_tickets().await;
        h.supervisor.forget(tickets[0]).await;
        h.supervisor.forget(tickets[1]).await;
        assert!(h.supervisor.completed.read().await.contains(fingerprint));
        h.supervisor.forget(tickets[2]).await;
        assert!(h.supervisor.completed.read().await.is_empty());

        // Nothing tracked for the signal: nothing is remembered.
        assert_eq!(h.supervisor.activate_runners(fingerprint).await, 0);
        assert!(h.supervisor.completed.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_forget_and_drain() {
        let h = Harness::new(test_config()).await;
        let ticket = market_first_leg(&h).await;

        h.supervisor.drain().await;
        let position = h.supervisor.forget(ticket).await.unwrap();
        assert_eq!(position.ticket, ticket);
        assert!(h.supervisor.forget(ticket).await.is_none());
        assert_eq!(h.supervisor.tick().await, SupervisionSummary::default());
    }
}
