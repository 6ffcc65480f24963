//! Multi-domain voltage-margin (Vmin) search engine
//!
//! Finds the minimum supply voltage at which a pattern sequence still
//! passes, for one or more independent voltage domains searched together:
//! every active domain's voltage is applied simultaneously, one shared
//! pattern execution evaluates all of them per step. Failure decode, fault
//! masking, sub-unit recovery and cross-test voltage forwarding hang off
//! the same loop.
//!
//! The engine is a library driven by a surrounding test-method shell; it
//! owns no CLI and no I/O beyond the injected collaborator traits.

use thiserror::Error;
use vminsearch_base::BaseError;
use vminsearch_forwarding::ForwardingError;
use vminsearch_recovery::RecoveryError;

pub mod config;
pub mod datalog;
pub mod engine;
pub mod outcome;
pub mod point;
pub mod recovery;
pub mod target;

pub use config::{FeatureSwitches, ForwardingMode, RecoveryModeKind, SearchConfig, TestMode};
pub use engine::{SearchContext, SearchServices, VminSearch};
pub use outcome::{FlowState, SearchOutcome};
pub use point::SearchPoint;
pub use recovery::{
    recovery_mode_for, RecoveryContext, RecoveryMode, FAIL_AMBLE_PORT, FAIL_PORT,
    FAIL_RECOVERY_PORT, FAIL_RULES_PORT, PASS_PORT,
};
pub use target::{
    FailReason, PatternData, SearchIdentifiers, SearchPointData, SearchResultData, VoltageTarget,
    VOLTAGE_FAIL, VOLTAGE_MASK,
};

/// Errors raised by the search engine
#[derive(Debug, Error)]
pub enum SearchError {
    /// Invalid parameter combination, raised at verification time before
    /// any pattern execution
    #[error("configuration error: {0}")]
    Config(String),
    /// A referenced storage key was not found; fatal, no default fallback
    #[error("storage miss: key [{0}] not found")]
    StorageMiss(String),
    /// A failing pattern could not be located in the pattern-list index
    #[error("pattern [{0}] not found in pattern list")]
    PatternNotFound(String),
    #[error(transparent)]
    Recovery(#[from] RecoveryError),
    #[error(transparent)]
    Forwarding(#[from] ForwardingError),
    #[error(transparent)]
    Base(#[from] BaseError),
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, SearchError>;
