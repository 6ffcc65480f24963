//! Vmin forwarding: one test seeds the starting voltage of another
//!
//! A process-wide cache keyed by (corner identifier, flow index). Each entry
//! holds the last stored Vmin result and the frequency associated with the
//! corner at that flow. Forwarding never lowers a requested start voltage;
//! it only raises it to a known-good prior result.

use indexmap::IndexMap;
use thiserror::Error;
use tracing::debug;

/// Errors raised by the forwarding store
#[derive(Debug, Error)]
pub enum ForwardingError {
    /// No frequency has been configured for the corner/flow
    #[error("no frequency configured for corner [{corner}] flow [{flow}]")]
    FrequencyNotSet { corner: String, flow: u32 },
}

/// Result type for forwarding operations
pub type ForwardingResult<T> = Result<T, ForwardingError>;

/// Key of one forwarding entry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CornerKey {
    pub corner: String,
    pub flow: u32,
}

impl CornerKey {
    pub fn new(corner: &str, flow: u32) -> Self {
        Self {
            corner: corner.to_string(),
            flow,
        }
    }
}

/// Per-(corner, flow) forwarding data
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ForwardingEntry {
    /// Last stored Vmin result, if any
    pub voltage: Option<f64>,
    /// Operating frequency of the corner at this flow, in Hz
    pub frequency: Option<f64>,
    /// Number of results stored into this entry
    pub store_count: u32,
}

/// Keyed cache of Vmin results spanning the whole test-program execution.
///
/// Passed by reference into the search engine; tests construct isolated
/// instances instead of sharing hidden statics.
#[derive(Debug, Clone, Default)]
pub struct VminForwardingStore {
    entries: IndexMap<CornerKey, ForwardingEntry>,
    single_point_mode: bool,
    store_voltages: bool,
    search_guardband_enabled: bool,
}

impl VminForwardingStore {
    pub fn new() -> Self {
        Self {
            entries: IndexMap::new(),
            single_point_mode: false,
            store_voltages: true,
            search_guardband_enabled: false,
        }
    }

    /// Single-point mode restricts every corner/flow to one stored result
    /// per program execution
    pub fn set_single_point_mode(&mut self, enabled: bool) {
        self.single_point_mode = enabled;
    }

    pub fn is_single_point_mode(&self) -> bool {
        self.single_point_mode
    }

    /// Globally disables result storage; `store_vmin_result` becomes an
    /// accepted no-op
    pub fn set_store_voltages(&mut self, enabled: bool) {
        self.store_voltages = enabled;
    }

    pub fn set_search_guardband_enabled(&mut self, enabled: bool) {
        self.search_guardband_enabled = enabled;
    }

    pub fn is_search_guardband_enabled(&self) -> bool {
        self.search_guardband_enabled
    }

    /// Entry handle, created lazily on first access
    pub fn entry(&mut self, corner: &str, flow: u32) -> &mut ForwardingEntry {
        self.entries
            .entry(CornerKey::new(corner, flow))
            .or_default()
    }

    pub fn get(&self, corner: &str, flow: u32) -> Option<&ForwardingEntry> {
        self.entries.get(&CornerKey::new(corner, flow))
    }

    pub fn set_frequency(&mut self, corner: &str, flow: u32, hz: f64) {
        self.entry(corner, flow).frequency = Some(hz);
    }

    /// Frequency for the corner at the flow; a miss is fatal, no default
    /// fallback
    pub fn frequency(&self, corner: &str, flow: u32) -> ForwardingResult<f64> {
        self.get(corner, flow)
            .and_then(|entry| entry.frequency)
            .ok_or_else(|| ForwardingError::FrequencyNotSet {
                corner: corner.to_string(),
                flow,
            })
    }

    /// Start voltage for a search: the stored prior Vmin when it exceeds
    /// `candidate`, else `candidate`. Never lowers the request.
    pub fn starting_voltage(&self, corner: &str, flow: u32, candidate: f64) -> f64 {
        match self.get(corner, flow).and_then(|entry| entry.voltage) {
            Some(prior) if prior > candidate => {
                debug!(corner, flow, prior, candidate, "forwarding raised start voltage");
                prior
            }
            _ => candidate,
        }
    }

    /// Stores a Vmin result; `false` means the store was rejected (second
    /// write in single-point mode) and is consumed by the caller for
    /// exit-code purposes. Overwrites the previous value otherwise.
    pub fn store_vmin_result(&mut self, corner: &str, flow: u32, voltage: f64) -> bool {
        if !self.store_voltages {
            debug!(corner, flow, "voltage storage disabled, result not stored");
            return true;
        }
        let single_point = self.single_point_mode;
        let entry = self.entry(corner, flow);
        if single_point && entry.store_count > 0 {
            debug!(corner, flow, "single-point mode rejected second store");
            return false;
        }
        entry.voltage = Some(voltage);
        entry.store_count += 1;
        true
    }
}
