//! Shared test doubles for driving the search engine end to end
#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use vminsearch_base::{
    BaseError, BaseResult, DatalogSink, FailureRecord, KeyValueStore, PatternExecutor,
    PatternOccurrence, PlistInfo, StorageScope, StoreValue, VoltageControl,
};

pub type AppliedVoltages = Rc<RefCell<Vec<Vec<f64>>>>;

pub fn applied_voltages() -> AppliedVoltages {
    Rc::new(RefCell::new(Vec::new()))
}

/// Pattern executor whose pass/fail is derived from the last applied
/// voltages: target `i` fails while its voltage is below `thresholds[i]`.
/// Masked pins suppress the failures they would otherwise report.
pub struct ThresholdExecutor {
    pub thresholds: Vec<f64>,
    /// Pins implicated when target `i` fails; empty = pin-less failure
    pub fail_pins: Vec<Vec<String>>,
    /// Per-pin thresholds evaluated against the first target's voltage;
    /// models several recoverable units behind one searched rail
    pub pin_thresholds: Vec<(String, f64)>,
    pub fail_pattern: String,
    pub applied: AppliedVoltages,
    pub masked_pins: Vec<String>,
    pub mask_history: Vec<Vec<String>>,
    pub executions: u32,
    pub capture_fault: bool,
    pub force_fail: bool,
    failures: Vec<FailureRecord>,
}

impl ThresholdExecutor {
    pub fn new(thresholds: &[f64], applied: &AppliedVoltages) -> Self {
        Self {
            thresholds: thresholds.to_vec(),
            fail_pins: vec![Vec::new(); thresholds.len()],
            pin_thresholds: Vec::new(),
            fail_pattern: "pat_core_0".to_string(),
            applied: Rc::clone(applied),
            masked_pins: Vec::new(),
            mask_history: Vec::new(),
            executions: 0,
            capture_fault: false,
            force_fail: false,
            failures: Vec::new(),
        }
    }

    pub fn with_pins(mut self, pins: &[&str]) -> Self {
        self.fail_pins = pins.iter().map(|p| vec![p.to_string()]).collect();
        self
    }
}

impl PatternExecutor for ThresholdExecutor {
    fn execute(&mut self) -> bool {
        self.executions += 1;
        let voltages = self.applied.borrow().last().cloned().unwrap_or_default();
        self.failures.clear();
        if self.force_fail {
            self.failures.push(FailureRecord {
                pattern_name: self.fail_pattern.clone(),
                ..FailureRecord::default()
            });
            return false;
        }
        if !self.pin_thresholds.is_empty() {
            let voltage = voltages.first().copied().unwrap_or(f64::MAX);
            if voltage >= 0.0 {
                for (pin, threshold) in &self.pin_thresholds {
                    if voltage + 1e-9 < *threshold && !self.masked_pins.contains(pin) {
                        self.failures.push(FailureRecord {
                            pattern_name: self.fail_pattern.clone(),
                            failing_pins: vec![pin.clone()],
                            ..FailureRecord::default()
                        });
                    }
                }
            }
            return self.failures.is_empty();
        }
        for (index, &voltage) in voltages.iter().enumerate() {
            if voltage < 0.0 || voltage + 1e-9 >= self.thresholds[index] {
                continue;
            }
            let configured = &self.fail_pins[index];
            let pins: Vec<String> = configured
                .iter()
                .filter(|pin| !self.masked_pins.contains(pin))
                .cloned()
                .collect();
            if !configured.is_empty() && pins.is_empty() {
                // the failing unit is fully masked out
                continue;
            }
            self.failures.push(FailureRecord {
                pattern_name: self.fail_pattern.clone(),
                failing_pins: pins,
                ..FailureRecord::default()
            });
        }
        self.failures.is_empty()
    }

    fn per_cycle_failures(&self) -> BaseResult<Vec<FailureRecord>> {
        if self.capture_fault {
            return Err(BaseError::CaptureUnavailable("no capture buffer".into()));
        }
        Ok(self.failures.clone())
    }

    fn set_pin_mask(&mut self, pins: &[String]) {
        self.masked_pins = pins.to_vec();
        self.mask_history.push(pins.to_vec());
    }

    fn resolve_plist(&mut self, instance_name: &str) -> String {
        format!("{instance_name}_plist")
    }
}

/// Voltage control recording every applied vector
pub struct RecordingVoltage {
    pub applied: AppliedVoltages,
    pub restored: bool,
}

impl RecordingVoltage {
    pub fn new(applied: &AppliedVoltages) -> Self {
        Self {
            applied: Rc::clone(applied),
            restored: false,
        }
    }
}

impl VoltageControl for RecordingVoltage {
    fn apply(&mut self, voltages: &[f64]) -> BaseResult<()> {
        self.applied.borrow_mut().push(voltages.to_vec());
        Ok(())
    }

    fn restore(&mut self) {
        self.restored = true;
    }
}

/// Datalog sink collecting (postfix, data) records
#[derive(Default)]
pub struct RecordingSink {
    pub records: Vec<(String, String)>,
}

impl DatalogSink for RecordingSink {
    fn write_record(&mut self, tname_postfix: &str, data: &str) {
        self.records
            .push((tname_postfix.to_string(), data.to_string()));
    }
}

/// In-memory key-value persistence
#[derive(Default)]
pub struct MemoryStore {
    pub values: HashMap<String, StoreValue>,
}

impl KeyValueStore for MemoryStore {
    fn insert(&mut self, key: &str, value: StoreValue, _scope: StorageScope) {
        self.values.insert(key.to_string(), value);
    }

    fn get(&self, key: &str, _scope: StorageScope) -> Option<StoreValue> {
        self.values.get(key).cloned()
    }
}

/// Pattern-list metadata double
#[derive(Default)]
pub struct PlistMeta {
    pub ambles: Vec<String>,
    pub index: Vec<PatternOccurrence>,
}

impl PlistInfo for PlistMeta {
    fn is_pattern_an_amble(&self, pattern_name: &str) -> bool {
        self.ambles.iter().any(|amble| amble == pattern_name)
    }

    fn pattern_index(&self) -> Vec<PatternOccurrence> {
        self.index.clone()
    }
}
