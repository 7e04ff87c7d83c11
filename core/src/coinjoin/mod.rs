//! Chaumian CoinJoin rounds and their coordination

pub mod alice;
pub mod coordinator;
pub mod ledger;
pub mod registry;
pub mod round;
pub mod watchdog;

#[cfg(test)]
mod tests;

pub use alice::{Alice, AliceId};
pub use coordinator::{Coordinator, CoordinatorError};
pub use ledger::{CoinJoinLedger, LedgerError, LedgerSnapshot};
pub use registry::{RegistryError, RoundRegistry};
pub use round::{
    Round, RoundConfig, RoundError, RoundEvent, RoundId, RoundOutcome, RoundPhase, RoundStatus,
};
pub use watchdog::{TimeoutReport, enforce_phase_timeouts};
