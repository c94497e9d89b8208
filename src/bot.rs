//! Bot runner: main orchestration loop.
//!
//! Handles:
//! - Planning signals arriving on the upstream feed
//! - Reconciling the ledger with the venue (closures, vanished orders,
//!   final targets)
//! - Adopting filled legs and supervising their stop-losses
//! - Draining in-flight work on shutdown

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::api::{with_timeout, OrderGateway, PriceSource};
use crate::db::SignalLedger;
use crate::models::Signal;
use crate::trading::{
    EntryPlanner, PlanError, PositionSupervisor, ReconcileReport, SubmitOutcome,
    SupervisionSummary, TargetHitDetector, TradingConfig,
};

/// Bot configuration.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Supervision cadence
    pub poll_interval: Duration,

    /// Trading configuration
    pub trading: TradingConfig,
}

impl From<TradingConfig> for BotConfig {
    fn from(trading: TradingConfig) -> Self {
        Self {
            poll_interval: trading.poll_interval(),
            trading,
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub reconciled: ReconcileReport,
    pub adopted: usize,
    pub supervision: SupervisionSummary,
}

#[derive(Debug, Default)]
struct Counters {
    signals_received: u64,
    signals_planned: u64,
    duplicates: u64,
    blocked: u64,
    plan_failures: u64,
    ticks: u64,
    failed_ticks: u64,
    stops_moved: u64,
    signals_completed: u64,
    signals_expired: u64,
    orders_cancelled: u64,
}

/// Main bot runner.
pub struct Bot {
    config: BotConfig,
    gateway: Arc<dyn OrderGateway>,
    ledger: Arc<dyn SignalLedger>,
    planner: Arc<EntryPlanner>,
    supervisor: Arc<PositionSupervisor>,
    detector: TargetHitDetector,
    counters: Arc<RwLock<Counters>>,

    // Shutdown signal
    shutdown: Arc<AtomicBool>,
}

impl Bot {
    pub fn new(
        gateway: Arc<dyn OrderGateway>,
        prices: Arc<dyn PriceSource>,
        ledger: Arc<dyn SignalLedger>,
        config: BotConfig,
    ) -> Self {
        let trading = Arc::new(config.trading.clone());
        let planner = Arc::new(EntryPlanner::new(
            gateway.clone(),
            prices.clone(),
            ledger.clone(),
            trading.clone(),
        ));
        let supervisor = Arc::new(PositionSupervisor::new(
            gateway.clone(),
            prices.clone(),
            ledger.clone(),
            trading.clone(),
        ));
        let detector = TargetHitDetector::new(
            gateway.clone(),
            prices,
            ledger.clone(),
            supervisor.clone(),
            trading,
        );

        Self {
            config,
            gateway,
            ledger,
            planner,
            supervisor,
            detector,
            counters: Arc::new(RwLock::new(Counters::default())),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Get shutdown signal for external control.
    pub fn shutdown_signal(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Log what the ledger still has in flight from a previous session.
    /// Open positions are picked up again by the first tick.
    pub async fn initialize(&self) -> Result<()> {
        info!("Initializing bot...");

        let entries = self
            .ledger
            .entries(usize::MAX)
            .await
            .context("failed to read signal ledger")?;
        let live: Vec<_> = entries.iter().filter(|e| !e.status.is_terminal()).collect();
        for entry in &live {
            info!(
                fingerprint = %entry.fingerprint,
                symbol = %entry.symbol,
                status = %entry.status,
                "Resuming signal"
            );
        }

        info!(
            signals = entries.len(),
            live = live.len(),
            poll_interval = ?self.config.poll_interval,
            "Bot initialized"
        );
        Ok(())
    }

    /// Main run loop. Returns after shutdown once in-flight work is drained.
    ///
    /// Signals are planned on their own tasks so a slow venue call during
    /// planning never holds up the supervision ticks.
    pub async fn run(&self, mut signals: mpsc::Receiver<Signal>) -> Result<()> {
        info!(poll_interval = ?self.config.poll_interval, "Starting bot run loop");

        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Register shutdown handler
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
        });

        let mut planning = JoinSet::new();
        let mut feed_open = true;
        while !self.shutdown.load(Ordering::SeqCst) {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        self.counters.write().await.failed_ticks += 1;
                        error!(error = %e, "Error in bot tick");
                    }
                }
                received = signals.recv(), if feed_open => match received {
                    Some(signal) => {
                        let planner = self.planner.clone();
                        let counters = self.counters.clone();
                        planning.spawn(async move {
                            if let Err(e) = plan_signal(&planner, &counters, &signal).await {
                                error!(fingerprint = %signal.fingerprint(), error = %e, "Failed to plan signal");
                            }
                        });
                    }
                    None => {
                        info!("Signal feed closed, supervising until shutdown");
                        feed_open = false;
                    }
                },
                Some(joined) = planning.join_next(), if !planning.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Planning task failed");
                    }
                }
            }
        }

        self.shutdown(planning).await;
        Ok(())
    }

    /// Plan one signal and place its legs.
    pub async fn submit(&self, signal: &Signal) -> Result<SubmitOutcome, PlanError> {
        plan_signal(&self.planner, &self.counters, signal).await
    }

    /// Single iteration of the supervision loop.
    pub async fn tick(&self) -> Result<TickReport> {
        debug!("Bot tick");
        let timeout = self.config.trading.call_timeout();

        // Orders before positions: a fill landing between the two calls then
        // shows up as a position instead of a vanished order.
        let orders = with_timeout(timeout, self.gateway.list_pending_orders())
            .await
            .context("failed to list pending orders")?;
        let positions = with_timeout(timeout, self.gateway.list_open_positions())
            .await
            .context("failed to list open positions")?;

        // 1. Closures, vanished orders and final targets
        let reconciled = self
            .detector
            .reconcile(&positions, &orders)
            .await
            .context("failed to reconcile with venue")?;

        // 2. Newly filled legs
        let adopted = self.supervisor.adopt(&positions).await;

        // 3. Stop-loss rules for every tracked ticket
        let supervision = self.supervisor.tick().await;
        if supervision.failed > 0 {
            warn!(failed = supervision.failed, "Some tickets were not supervised this tick");
        }

        let mut counters = self.counters.write().await;
        counters.ticks += 1;
        counters.stops_moved += supervision.modified as u64;
        counters.signals_completed += reconciled.completed.len() as u64;
        counters.signals_expired += reconciled.expired.len() as u64;
        counters.orders_cancelled += reconciled.cancelled_orders as u64;

        Ok(TickReport {
            reconciled,
            adopted,
            supervision,
        })
    }

    /// Graceful shutdown: wait for signals being planned and for every
    /// in-flight ticket mutation.
    async fn shutdown(&self, mut planning: JoinSet<()>) {
        info!(planning = planning.len(), "Shutting down bot...");
        self.shutdown.store(true, Ordering::SeqCst);
        while let Some(joined) = planning.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Planning task failed");
            }
        }
        self.supervisor.drain().await;
        info!("Bot shutdown complete");
    }

    /// Get current stats.
    pub async fn get_stats(&self) -> BotStats {
        let tracked_positions = self.supervisor.tracked_tickets().await.len();
        let counters = self.counters.read().await;
        BotStats {
            signals_received: counters.signals_received,
            signals_planned: counters.signals_planned,
            duplicates: counters.duplicates,
            blocked: counters.blocked,
            plan_failures: counters.plan_failures,
            ticks: counters.ticks,
            failed_ticks: counters.failed_ticks,
            stops_moved: counters.stops_moved,
            signals_completed: counters.signals_completed,
            signals_expired: counters.signals_expired,
            orders_cancelled: counters.orders_cancelled,
            tracked_positions,
            is_running: !self.shutdown.load(Ordering::SeqCst),
        }
    }
}

async fn plan_signal(
    planner: &EntryPlanner,
    counters: &RwLock<Counters>,
    signal: &Signal,
) -> Result<SubmitOutcome, PlanError> {
    counters.write().await.signals_received += 1;
    let outcome = planner.submit(signal).await;

    let mut counters = counters.write().await;
    match &outcome {
        Ok(SubmitOutcome::Planned(_)) => counters.signals_planned += 1,
        Ok(SubmitOutcome::Duplicate(_) | SubmitOutcome::AlreadyCompleted(_)) => counters.duplicates += 1,
        Ok(SubmitOutcome::Blocked(_)) => counters.blocked += 1,
        Err(_) => counters.plan_failures += 1,
    }
    outcome
}

/// Bot statistics.
#[derive(Debug, Clone)]
pub struct BotStats {
    pub signals_received: u64,
    pub signals_planned: u64,
    pub duplicates: u64,
    pub blocked: u64,
    pub plan_failures: u64,
    pub ticks: u64,
    pub failed_ticks: u64,
    pub stops_moved: u64,
    pub signals_completed: u64,
    pub signals_expired: u64,
    pub orders_cancelled: u64,
    pub tracked_positions: usize,
    pub is_running: bool,
}

impl std::fmt::Display for BotStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Bot Statistics ===")?;
        writeln!(f, "Signals:         {} (Planned: {}, Duplicate: {}, Blocked: {}, Failed: {})",
            self.signals_received, self.signals_planned, self.duplicates, self.blocked, self.plan_failures)?;
        writeln!(f, "Ticks:           {} (Failed: {})", self.ticks, self.failed_ticks)?;
        writeln!(f, "Stops Moved:     {}", self.stops_moved)?;
        writeln!(f, "Completed:       {}", self.signals_completed)?;
        writeln!(f, "Expired:         {}", self.signals_expired)?;
        writeln!(f, "Orders Withdrawn: {}", self.orders_cancelled)?;
        writeln!(f, "Tracked:         {}", self.tracked_positions)?;
        writeln!(f, "Status:          {}", if self.is_running { "Running" } else { "Stopped" })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::PaperVenue;
    use crate::db::MemoryLedger;
    use crate::models::{LegState, SignalStatus};
    use crate::test_helpers::{gold_signal, silver_signal, test_config};
    use rust_decimal_macros::dec;

    fn paper_bot(venue: &Arc<PaperVenue>, ledger: &Arc<dyn SignalLedger>, config: BotConfig) -> Bot {
        Bot::new(venue.clone(), venue.clone(), ledger.clone(), config)
    }

    #[tokio::test]
    async fn test_signal_lifecycle() {
        let venue = Arc::new(PaperVenue::new());
        let ledger: Arc<dyn SignalLedger> = Arc::new(MemoryLedger::new());
        let bot = paper_bot(&venue, &ledger, BotConfig::from(test_config()));
        let signal = gold_signal();
        let fingerprint = signal.fingerprint();

        venue.set_price("XAUUSD", dec!(2645.00)).await;
        assert!(matches!(bot.submit(&signal).await.unwrap(), SubmitOutcome::Planned(_)));
        assert_eq!(ledger.get(fingerprint).await.unwrap(), Some(SignalStatus::Pending));

        // Price sweeps the zone and every leg fills.
        venue.set_price("XAUUSD", dec!(2650.50)).await;
        let report = bot.tick().await.unwrap();
        assert_eq!(report.adopted, 3);
        // Only the middle leg can lock its breakeven below 2650.50.
        assert_eq!(report.supervision.modified, 1);
        assert_eq!(ledger.get(fingerprint).await.unwrap(), Some(SignalStatus::Active));

        let legs = ledger.legs(fingerprint).await.unwrap();
        let tickets: Vec<_> = legs.iter().filter_map(|l| l.ticket).collect();
        assert_eq!(venue.stop_history(tickets[1]).await, vec![dec!(2649.45)]);

        // Legs 1 and 2 close at the final target; the runner keeps going.
        venue.set_price("XAUUSD", dec!(2660.00)).await;
        let report = bot.tick().await.unwrap();
        assert_eq!(report.reconciled.closed, 2);
        assert_eq!(report.reconciled.completed, vec![fingerprint.clone()]);
        assert_eq!(ledger.get(fingerprint).await.unwrap(), Some(SignalStatus::Tp2Hit));
        assert_eq!(venue.stop_history(tickets[2]).await, vec![dec!(2659.50)]);

        venue.set_price("XAUUSD", dec!(2662.00)).await;
        bot.tick().await.unwrap();
        assert_eq!(
            venue.stop_history(tickets[2]).await,
            vec![dec!(2659.50), dec!(2661.50)]
        );

        // Runner stopped out in profit; the signal stays completed.
        venue.set_price("XAUUSD", dec!(2661.40)).await;
        let report = bot.tick().await.unwrap();
        assert_eq!(report.reconciled.closed, 1);
        assert_eq!(ledger.get(fingerprint).await.unwrap(), Some(SignalStatus::Tp2Hit));
        let states: Vec<_> = ledger
            .legs(fingerprint)
            .await
            .unwrap()
            .iter()
            .map(|l| l.state)
            .collect();
        assert_eq!(states, vec![LegState::Closed; 3]);

        let stats = bot.get_stats().await;
        assert_eq!(stats.signals_planned, 1);
        assert_eq!(stats.signals_completed, 1);
        assert_eq!(stats.tracked_positions, 0);
        assert!(matches!(
            bot.submit(&signal).await.unwrap(),
            SubmitOutcome::AlreadyCompleted(SignalStatus::Tp2Hit)
        ));
    }

    #[tokio::test]
    async fn test_restart_resumes_supervision() {
        let venue = Arc::new(PaperVenue::new());
        let ledger: Arc<dyn SignalLedger> = Arc::new(MemoryLedger::new());
        let signal = gold_signal();

        {
            let bot = paper_bot(&venue, &ledger, BotConfig::from(test_config()));
            venue.set_price("XAUUSD", dec!(2650.60)).await;
            bot.submit(&signal).await.unwrap();
            venue.set_price("XAUUSD", dec!(2651.00)).await;
            bot.tick().await.unwrap();
        }

        // A fresh bot over the same ledger and venue picks the ticket up
        // with breakeven already applied and leaves it alone.
        let bot = paper_bot(&venue, &ledger, BotConfig::from(test_config()));
        bot.initialize().await.unwrap();
        let report = bot.tick().await.unwrap();
        assert_eq!(report.adopted, 1);
        assert_eq!(report.supervision.modified, 0);

        let ticket = ledger.legs(signal.fingerprint()).await.unwrap()[0].ticket.unwrap();
        assert_eq!(venue.stop_history(ticket).await, vec![dec!(2650.70)]);
        assert!(matches!(
            bot.submit(&signal).await.unwrap(),
            SubmitOutcome::Duplicate(SignalStatus::Active)
        ));
    }

    #[tokio::test]
    async fn test_run_plans_feed_and_shuts_down() {
        let venue = Arc::new(PaperVenue::new());
        let ledger: Arc<dyn SignalLedger> = Arc::new(MemoryLedger::new());
        let config = BotConfig {
            poll_interval: Duration::from_millis(50),
            trading: test_config(),
        };
        let bot = Arc::new(paper_bot(&venue, &ledger, config));
        venue.set_price("XAUUSD", dec!(2645.00)).await;

        let (tx, rx) = mpsc::channel(8);
        let runner = tokio::spawn({
            let bot = bot.clone();
            async move { bot.run(rx).await }
        });

        tx.send(gold_signal()).await.unwrap();
        tx.send(gold_signal()).await.unwrap();
        drop(tx);
        tokio::time::sleep(Duration::from_millis(200)).await;

        bot.shutdown_signal().store(true, Ordering::SeqCst);
        let result = tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .expect("run loop must stop after shutdown");
        assert!(result.unwrap().is_ok());

        let stats = bot.get_stats().await;
        assert_eq!(stats.signals_received, 2);
        assert_eq!(stats.signals_planned, 1);
        assert_eq!(stats.duplicates, 1);
        assert!(stats.ticks > 0);
        assert!(!stats.is_running);
        assert_eq!(venue.placed_orders().await.len(), 3);
    }

    #[tokio::test]
    async fn test_slow_planning_does_not_delay_supervision() {
        let venue = Arc::new(PaperVenue::new());
        let ledger: Arc<dyn SignalLedger> = Arc::new(MemoryLedger::new());
        let config = BotConfig {
            poll_interval: Duration::from_millis(50),
            trading: test_config(),
        };
        let bot = Arc::new(paper_bot(&venue, &ledger, config));

        venue.set_price("XAUUSD", dec!(2650.60)).await;
        bot.submit(&gold_signal()).await.unwrap();
        let ticket = venue.list_open_positions().await.unwrap()[0].ticket;
        venue.stall_prices("XAGUSD").await;

        let (tx, rx) = mpsc::channel(8);
        let runner = tokio::spawn({
            let bot = bot.clone();
            async move { bot.run(rx).await }
        });

        // Planning silver waits out the full call timeout on the stalled feed.
        tx.send(silver_signal()).await.unwrap();
        venue.set_price("XAUUSD", dec!(2651.00)).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(venue.stop_history(ticket).await, vec![dec!(2650.70)]);

        bot.shutdown_signal().store(true, Ordering::SeqCst);
        let result = tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .expect("run loop must stop after shutdown");
        assert!(result.unwrap().is_ok());
        assert_eq!(bot.get_stats().await.plan_failures, 1);
    }
}
