//! Persistent die-recovery trackers
//!
//! A tracker is a named, fixed-width bit string persisted for the lifetime
//! of a test-program execution; bit = 1 means the sub-unit is disabled. A
//! `DieRecoveryTracker` handle spans one or more consecutive tracker
//! definitions and reads/merges them as one vector. Updates are monotonic
//! in `Merge` mode and gated by a process-wide allow-changes flag.

use crate::rules::{PassingRule, RuleStore};
use crate::{RecoveryError, RecoveryResult};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};
use vminsearch_base::{BitMask, DatalogSink};

/// Static definition of one tracker segment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerDef {
    pub name: String,
    /// Number of sub-units tracked
    pub size: usize,
    /// Initial bit string written by `reset`, defaults to all zeros
    #[serde(default)]
    pub initial_value: Option<String>,
    /// Trackers forced to all-ones when this one becomes fully disabled
    #[serde(default)]
    pub link_on_disable: Vec<String>,
}

impl TrackerDef {
    fn reset_value(&self) -> String {
        self.initial_value
            .clone()
            .unwrap_or_else(|| "0".repeat(self.size))
    }
}

/// How an update combines with the stored value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// Union of bits; never clears a previously-set bit
    Merge,
    /// Replaces the stored value outright
    Overwrite,
}

/// Registry holding tracker definitions and their persisted data.
///
/// Injected by reference into the search engine so multiple searches can be
/// tested in isolation with distinct registry instances.
#[derive(Debug, Clone, Default)]
pub struct TrackerStore {
    definitions: IndexMap<String, TrackerDef>,
    data: IndexMap<String, String>,
    changes_blocked: bool,
}

impl TrackerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(&mut self, def: TrackerDef) {
        self.definitions.insert(def.name.clone(), def);
    }

    /// Loads a JSON array of tracker definitions
    pub fn from_json(text: &str) -> RecoveryResult<Self> {
        let defs: Vec<TrackerDef> = serde_json::from_str(text)?;
        let mut store = Self::new();
        for def in defs {
            store.define(def);
        }
        Ok(store)
    }

    pub fn definition(&self, name: &str) -> RecoveryResult<&TrackerDef> {
        self.definitions
            .get(name)
            .ok_or_else(|| RecoveryError::UnknownTracker(name.to_string()))
    }

    pub fn has_data(&self, name: &str) -> bool {
        self.data.contains_key(name)
    }

    pub fn data(&self, name: &str) -> RecoveryResult<&str> {
        self.data
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| RecoveryError::TrackerNotInitialized(name.to_string()))
    }

    pub fn store_data(&mut self, name: &str, value: &str) {
        self.data.insert(name.to_string(), value.to_string());
    }

    /// Writes the defined initial value of the named tracker
    pub fn reset(&mut self, name: &str) -> RecoveryResult<()> {
        let value = self.definition(name)?.reset_value();
        self.store_data(name, &value);
        Ok(())
    }

    /// Process-wide gate suppressing all tracker writes while still
    /// allowing mask reads
    pub fn set_changes_allowed(&mut self, allowed: bool) {
        self.changes_blocked = !allowed;
    }

    pub fn changes_allowed(&self) -> bool {
        !self.changes_blocked
    }
}

/// Handle over one or more tracker segments read and written as one vector
#[derive(Debug, Clone)]
pub struct DieRecoveryTracker {
    names: Vec<String>,
    size: usize,
}

impl DieRecoveryTracker {
    /// Resolves the comma-separated tracker names against the store
    pub fn new(names: &str, store: &TrackerStore) -> RecoveryResult<Self> {
        let names: Vec<String> = names.split(',').map(|n| n.trim().to_string()).collect();
        let mut size = 0;
        for name in &names {
            size += store.definition(name)?.size;
        }
        Ok(Self { names, size })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Datalog tag for this handle, e.g. "CORE0|CORE1"
    pub fn names_tag(&self) -> String {
        self.names.join("|")
    }

    /// Currently-disabled-unit snapshot; read-only for the duration of one
    /// search
    pub fn mask_bits(&self, store: &TrackerStore) -> RecoveryResult<BitMask> {
        BitMask::parse(&self.read(store)?).map_err(Into::into)
    }

    /// Evaluates the named defeature rule group against `input`
    pub fn run_rule(
        &self,
        input: &BitMask,
        group: &str,
        rules: &RuleStore,
    ) -> RecoveryResult<Vec<PassingRule>> {
        rules.get(group)?.passing_rules(input)
    }

    /// Attempts to merge `value` into the tracked state.
    ///
    /// Bits covered by `mask` keep their stored value. Returns `Ok(false)`
    /// without committing when tracker changes are blocked; the caller must
    /// treat the overall test as a hard fail. `result` only affects the
    /// datalog record; `sink = None` skips logging.
    pub fn update(
        &self,
        store: &mut TrackerStore,
        value: &BitMask,
        mask: Option<&BitMask>,
        result: Option<&BitMask>,
        mode: UpdateMode,
        mut sink: Option<&mut dyn DatalogSink>,
    ) -> RecoveryResult<bool> {
        if value.len() != self.size {
            return Err(RecoveryError::SizeMismatch {
                name: self.names_tag(),
                expected: self.size,
                actual: value.len(),
            });
        }

        let (current, initialized) = match self.read(store) {
            Ok(text) => (BitMask::parse(&text)?, true),
            Err(_) => (BitMask::zeros(self.size), false),
        };

        let keep = mask.cloned().unwrap_or_else(|| BitMask::zeros(self.size));
        let mut to_write = BitMask::zeros(self.size);
        for i in 0..self.size {
            let bit = if keep.get(i) {
                current.get(i)
            } else {
                value.get(i) || (current.get(i) && mode == UpdateMode::Merge)
            };
            to_write.set(i, bit);
        }

        if let Some(sink) = sink.as_deref_mut() {
            let test_result = result.unwrap_or(value);
            self.write_log(sink, &keep, test_result, &current, &to_write);
        }

        if initialized && current == to_write {
            return Ok(true);
        }
        if initialized && !store.changes_allowed() {
            error!(
                tracker = %self.names_tag(),
                current = %current,
                new = %to_write,
                "tracker changes are blocked, update rejected"
            );
            return Ok(false);
        }

        let newly_disabled = self.write(store, &to_write, &current);
        debug!(tracker = %self.names_tag(), value = %to_write, "tracker updated");

        // A fully-disabled segment drags its linked trackers down with it.
        for name in newly_disabled {
            for linked in store.definition(&name)?.link_on_disable.clone() {
                let link = DieRecoveryTracker::new(&linked, store)?;
                let already_disabled =
                    store.has_data(&linked) && link.mask_bits(store)?.all();
                if already_disabled {
                    continue;
                }
                let ones = BitMask::ones(link.size());
                if !link.update(store, &ones, None, None, UpdateMode::Overwrite, None)? {
                    return Ok(false);
                }
            }
        }

        Ok(true)
    }

    /// Observability hook: writes the tracking record without modifying the
    /// stored state. Used when an update is evaluated but not applied.
    pub fn log_tracking_structure(
        &self,
        store: &TrackerStore,
        sink: &mut dyn DatalogSink,
        mask: &BitMask,
        result: &BitMask,
    ) -> RecoveryResult<()> {
        let current = self.mask_bits(store)?;
        self.write_log(sink, mask, result, &current, &current);
        Ok(())
    }

    fn write_log(
        &self,
        sink: &mut dyn DatalogSink,
        mask: &BitMask,
        result: &BitMask,
        incoming: &BitMask,
        outgoing: &BitMask,
    ) {
        sink.write_record(
            &format!("::{}", self.names_tag()),
            &format!("Mask:b{mask}|TestResult:b{result}|Incoming:b{incoming}|Outgoing:b{outgoing}"),
        );
    }

    fn read(&self, store: &TrackerStore) -> RecoveryResult<String> {
        let mut text = String::with_capacity(self.size);
        for name in &self.names {
            text.push_str(store.data(name)?);
        }
        Ok(text)
    }

    /// Writes per-segment data and returns the names of segments that went
    /// from partially-enabled to fully-disabled
    fn write(&self, store: &mut TrackerStore, data: &BitMask, previous: &BitMask) -> Vec<String> {
        let mut offset = 0;
        let mut newly_disabled = Vec::new();
        for name in &self.names {
            let size = store
                .definition(name)
                .map(|def| def.size)
                .unwrap_or_default();
            let segment = data.slice(offset, size);
            if previous.slice(offset, size).count_zeros() > 0 && segment.all() {
                newly_disabled.push(name.clone());
            }
            store.store_data(name, &segment.to_string());
            offset += size;
        }
        newly_disabled
    }
}
