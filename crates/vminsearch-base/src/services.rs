//! Station-wide service contracts consumed by the search core
//!
//! Datalog, key-value persistence, pattern-list metadata, and pattern-config
//! application. These are process-wide collaborators injected by the caller;
//! the core never owns a concrete implementation.

use crate::{BaseResult, BitMask};

/// Structured production datalog sink.
///
/// The core only ever produces one delimited string record plus a
/// test-name suffix per call; formatting of the surrounding frame belongs
/// to the sink.
pub trait DatalogSink {
    fn write_record(&mut self, tname_postfix: &str, data: &str);
}

/// Storage scope for key-value persistence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageScope {
    /// Per-device-under-test; cleared between units
    Dut,
    /// Whole test-program execution
    Program,
}

/// Value stored in key-value persistence
#[derive(Debug, Clone, PartialEq)]
pub enum StoreValue {
    Double(f64),
    Integer(i64),
    Text(String),
}

impl StoreValue {
    /// Numeric view of the stored value, if it has one
    pub fn as_double(&self) -> Option<f64> {
        match self {
            StoreValue::Double(v) => Some(*v),
            StoreValue::Integer(v) => Some(*v as f64),
            StoreValue::Text(text) => text.parse().ok(),
        }
    }
}

/// Cross-instance key-value persistence.
///
/// Used for voltage result passing between test instances when the
/// forwarding store is not in play. A missing key is surfaced to callers
/// as `None` and treated as fatal by the search core (no default-value
/// fallback).
pub trait KeyValueStore {
    fn insert(&mut self, key: &str, value: StoreValue, scope: StorageScope);
    fn get(&self, key: &str, scope: StorageScope) -> Option<StoreValue>;
}

/// One pattern occurrence inside a resolved pattern list
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PatternOccurrence {
    pub burst_index: u32,
    pub pattern_name: String,
    pub occurrence: u32,
}

/// Pattern-list metadata service
pub trait PlistInfo {
    /// True when the named pattern is a preamble/postamble pattern
    fn is_pattern_an_amble(&self, pattern_name: &str) -> bool;

    /// Ordered pattern occurrences of the resolved pattern list; empty when
    /// the flow does not need per-pattern data
    fn pattern_index(&self) -> Vec<PatternOccurrence> {
        Vec::new()
    }
}

/// One pattern-config modification request produced by a pin-map decoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatConfigRequest {
    /// Configuration name understood by the pattern-config service
    pub name: String,
    /// Bit payload to program, e.g. the disabled-unit selection
    pub data: String,
    /// Pattern list the configuration applies to; empty = global
    pub patlist: String,
}

impl PatConfigRequest {
    /// Request carrying a mask payload for the given configuration
    pub fn with_mask(name: &str, mask: &BitMask, patlist: &str) -> Self {
        Self {
            name: name.to_string(),
            data: mask.to_string(),
            patlist: patlist.to_string(),
        }
    }
}

/// Applies batched pattern-config modifications
pub trait PatConfigService {
    fn apply(&mut self, requests: &[PatConfigRequest]) -> BaseResult<()>;
}
