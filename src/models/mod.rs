//! Domain models: signals, ledger statuses, legs and tracked positions.

mod leg;
mod position;
mod signal;
mod status;

pub use leg::{EntryMode, LegRecord, LegState};
pub use position::{StopState, TrackedPosition};
pub use signal::{Direction, Fingerprint, Signal, SignalInput, ValidationError};
pub use status::SignalStatus;
