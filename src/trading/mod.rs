//! Trading logic: leg planning, stop-loss supervision and target detection.

pub mod config;
mod janitor;
mod legs;
mod planner;
mod stop_rules;
mod supervisor;

pub use config::TradingConfig;
pub use janitor::{ReconcileReport, TargetHitDetector};
pub use planner::{EntryPlanner, LegResult, PlanError, SubmitOutcome};
pub use supervisor::{PositionSupervisor, SupervisionSummary};
