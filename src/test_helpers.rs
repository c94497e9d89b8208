//! Shared fixtures for unit tests.

use std::sync::Arc;

use rust_decimal_macros::dec;

use crate::api::PaperVenue;
use crate::db::{MemoryLedger, SignalLedger};
use crate::models::{Direction, Signal, SignalInput};
use crate::trading::config::{BreakevenConfig, BreakevenTrigger, StagedEntry, TrailingConfig};
use crate::trading::{EntryPlanner, PositionSupervisor, TargetHitDetector, TradingConfig};

/// BUY XAUUSD 2650.50 - 2648.20, middle 2649.35.
pub fn gold_signal() -> Signal {
    Signal::new(SignalInput {
        direction: Direction::Buy,
        symbol: "XAUUSD".to_string(),
        entry_upper: dec!(2650.50),
        entry_lower: dec!(2648.20),
        entry_middle: None,
        stop_losses: vec![dec!(2645.00), dec!(2643.50), dec!(2642.00)],
        take_profits: vec![dec!(2655.00), dec!(2660.00)],
    })
    .unwrap()
}

/// SELL EURUSD 1.0850 - 1.0830.
pub fn sell_signal() -> Signal {
    Signal::new(SignalInput {
        direction: Direction::Sell,
        symbol: "EURUSD".to_string(),
        entry_upper: dec!(1.0850),
        entry_lower: dec!(1.0830),
        entry_middle: None,
        stop_losses: vec![dec!(1.0880)],
        take_profits: vec![dec!(1.0800), dec!(1.0770)],
    })
    .unwrap()
}

/// BUY XAGUSD 31.50 - 31.10.
pub fn silver_signal() -> Signal {
    Signal::new(SignalInput {
        direction: Direction::Buy,
        symbol: "XAGUSD".to_string(),
        entry_upper: dec!(31.50),
        entry_lower: dec!(31.10),
        entry_middle: None,
        stop_losses: vec![dec!(30.50)],
        take_profits: vec![dec!(32.00), dec!(32.50)],
    })
    .unwrap()
}

/// Short timeouts and retry windows; the first leg aims at the final target.
pub fn test_config() -> TradingConfig {
    TradingConfig {
        first_leg_target: 2,
        staged_entry: StagedEntry::NearestOnly,
        breakeven: BreakevenConfig {
            trigger: BreakevenTrigger::MiddleEntry,
            trigger_offset: dec!(0),
            lock_offset: dec!(0.1),
        },
        trailing: TrailingConfig {
            activation: dec!(1.0),
            distance: dec!(0.5),
        },
        call_timeout_ms: 1_000,
        cancel_retry_ms: 10,
        cancel_budget_ms: 200,
        max_workers: 4,
        ..TradingConfig::default()
    }
}

/// Planner, supervisor and detector wired to one paper venue and an
/// in-memory ledger.
pub struct Harness {
    pub venue: Arc<PaperVenue>,
    /// Price source; the venue itself unless built with a separate feed
    pub feed: Arc<PaperVenue>,
    pub ledger: Arc<dyn SignalLedger>,
    pub planner: EntryPlanner,
    pub supervisor: Arc<PositionSupervisor>,
    pub detector: TargetHitDetector,
    pub config: Arc<TradingConfig>,
}

impl Harness {
    pub async fn new(config: TradingConfig) -> Self {
        let venue = Arc::new(PaperVenue::new());
        Self::build(venue.clone(), venue, config)
    }

    /// Quotes come from a feed that never fills or closes anything on the venue.
    pub async fn with_separate_feed(config: TradingConfig) -> Self {
        Self::build(Arc::new(PaperVenue::new()), Arc::new(PaperVenue::new()), config)
    }

    fn build(venue: Arc<PaperVenue>, feed: Arc<PaperVenue>, config: TradingConfig) -> Self {
        let config = Arc::new(config);
        let ledger: Arc<dyn SignalLedger> = Arc::new(MemoryLedger::new());
        let planner = EntryPlanner::new(venue.clone(), feed.clone(), ledger.clone(), config.clone());
        let supervisor = Arc::new(PositionSupervisor::new(
            venue.clone(),
            feed.clone(),
            ledger.clone(),
            config.clone(),
        ));
        let detector = TargetHitDetector::new(
            venue.clone(),
            feed.clone(),
            ledger.clone(),
            supervisor.clone(),
            config.clone(),
        );
        Self {
            venue,
            feed,
            ledger,
            planner,
            supervisor,
            detector,
            config,
        }
    }
}
