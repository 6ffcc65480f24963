//! Die recovery: persistent sub-unit disablement tracking, defeature rule
//! evaluation, and pin-map fail decoding
//!
//! A *tracker* is a persistent bit-vector recording which recoverable
//! sub-units of a device are already disabled. *Defeature rules* enumerate
//! the disablement combinations a product may legally ship with. A *pin
//! map* translates physical per-pin failures into tracker bits and applies
//! the electrical/pattern masking that excludes disabled units from
//! subsequent executions.

use thiserror::Error;

pub mod pinmap;
pub mod rules;
pub mod tracker;

pub use pinmap::{AnyFailDecoder, PinMap, PinMapDecoder, PinToBitDecoder};
pub use rules::{PassingRule, RuleDef, RuleGroup, RuleMode, RuleStore, RuleType};
pub use tracker::{DieRecoveryTracker, TrackerDef, TrackerStore, UpdateMode};

/// Errors raised by recovery bookkeeping
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// A tracker name is not defined in the store
    #[error("tracker [{0}] is not defined")]
    UnknownTracker(String),
    /// A tracker is defined but has never been written
    #[error("tracker [{0}] has not been initialized yet")]
    TrackerNotInitialized(String),
    /// A bit-vector width does not match the expected tracker/pin-map size
    #[error("wrong size for [{name}]: expected {expected} bits, got {actual}")]
    SizeMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },
    /// A rule group name is not registered
    #[error("no defeature rule group [{0}] found")]
    UnknownRuleGroup(String),
    /// A rule pattern width does not match the evaluated input
    #[error("rule [{rule}] pattern [{pattern}] does not match input width {input}")]
    RuleWidthMismatch {
        rule: String,
        pattern: String,
        input: usize,
    },
    /// A pin map or decoder definition failed validation
    #[error("pin map error: {0}")]
    PinMap(String),
    /// A JSON definition could not be parsed
    #[error("definition parse error: {0}")]
    Definition(#[from] serde_json::Error),
    /// A definition file could not be read
    #[error("cannot read definition file: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Base(#[from] vminsearch_base::BaseError),
}

/// Result type for recovery operations
pub type RecoveryResult<T> = Result<T, RecoveryError>;
