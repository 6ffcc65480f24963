//! Shared foundations for the vminsearch workspace
//!
//! Holds the fixed-width bit mask used across every search component and the
//! abstract collaborator contracts (pattern executor, voltage control,
//! datalog sink, key-value persistence, pattern-list metadata). Concrete
//! tester bindings implement these traits; unit tests implement them with
//! in-memory doubles.

use thiserror::Error;

pub mod bits;
pub mod exec;
pub mod services;

pub use bits::BitMask;
pub use exec::{FailureRecord, PatternExecutor, VoltageControl};
pub use services::{
    DatalogSink, KeyValueStore, PatConfigRequest, PatConfigService, PatternOccurrence, PlistInfo,
    StorageScope, StoreValue,
};

/// Errors produced by the base abstractions
#[derive(Debug, Error)]
pub enum BaseError {
    /// A mask literal contained characters other than '0'/'1'
    #[error("invalid mask string: {0}")]
    InvalidMask(String),
    /// Two masks of different widths were combined
    #[error("mask width mismatch: {left} vs {right}")]
    WidthMismatch { left: usize, right: usize },
    /// The voltage-control collaborator rejected an operation
    #[error("voltage control error: {0}")]
    Voltage(String),
    /// Per-cycle capture data could not be retrieved from the executor
    #[error("capture data unavailable: {0}")]
    CaptureUnavailable(String),
    /// A pattern-config request could not be applied
    #[error("pat-config error: {0}")]
    PatConfig(String),
}

/// Result type for base operations
pub type BaseResult<T> = Result<T, BaseError>;
