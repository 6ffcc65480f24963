//! Search configuration and feature switches
//!
//! `SearchConfig` is the per-instance parameter block handed to the engine
//! by the surrounding test-method shell. Everything is validated during
//! engine construction, before any pattern execution.

use serde::{Deserialize, Serialize};

/// Search execution mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestMode {
    /// One independent voltage per target; failures attributed per domain
    MultiVmin,
    /// Exactly one searched voltage; scalar start/end reduce by max
    SingleVmin,
    /// Single-point execution at the start voltage
    Functional,
    /// Single-point execution gathering fail statistics
    Scoreboard,
}

/// How forwarding participates in the search
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForwardingMode {
    /// No forwarding
    None,
    /// Seed start voltages from the store; never write back
    Input,
    /// Ignore stored voltages; publish results
    Output,
    /// Seed start voltages and publish results
    InputOutput,
}

/// Recovery strategy applied to search results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryModeKind {
    /// Rule evaluation decides the port; trackers update only on full pass
    Default,
    /// Like `Default`, but an accepted disablement also updates trackers
    RecoveryPort,
    /// Masks newly-failing units and repeats the search up to the
    /// repetition bound
    RecoveryLoop,
    /// Additionally retests a rules-failing pass on the failing subset
    RecoveryFailRetest,
    /// Trackers are read-only; any mismatch against the incoming mask fails
    NoRecovery,
}

/// Parsed feature-switch settings
#[derive(Debug, Clone)]
pub struct FeatureSwitches {
    pub disable_masked_targets: bool,
    pub disable_pairs: bool,
    pub disable_quadruplets: bool,
    pub start_on_first_fail: bool,
    pub ignore_masked_results: bool,
    pub per_pattern_printing: bool,
    pub print_per_target_increments: bool,
    pub print_results_for_all_searches: bool,
    pub recovery_update_always: bool,
    pub vmin_update_on_pass_only: bool,
    pub force_recovery_loop: bool,
    pub high_to_low_search: bool,
    pub recovery_mask_enabled: bool,
}

impl Default for FeatureSwitches {
    fn default() -> Self {
        Self {
            disable_masked_targets: false,
            disable_pairs: false,
            disable_quadruplets: false,
            start_on_first_fail: true,
            ignore_masked_results: false,
            per_pattern_printing: false,
            print_per_target_increments: false,
            print_results_for_all_searches: false,
            recovery_update_always: false,
            vmin_update_on_pass_only: false,
            force_recovery_loop: false,
            high_to_low_search: false,
            recovery_mask_enabled: true,
        }
    }
}

impl FeatureSwitches {
    /// Parses the comma-separated switch list; unknown tokens are ignored
    pub fn parse(switches: &[String]) -> Self {
        let has = |name: &str| switches.iter().any(|s| s == name);
        Self {
            disable_masked_targets: has("disable_masked_targets")
                || has("disable_pairs")
                || has("disable_quadruplets"),
            disable_pairs: has("disable_pairs"),
            disable_quadruplets: has("disable_quadruplets"),
            start_on_first_fail: !has("start_on_first_fail_off"),
            ignore_masked_results: has("ignore_masked_results"),
            per_pattern_printing: has("per_pattern_printing"),
            print_per_target_increments: has("print_per_target_increments"),
            print_results_for_all_searches: has("print_results_for_all_searches"),
            recovery_update_always: has("recovery_update_always"),
            vmin_update_on_pass_only: has("vmin_update_on_pass_only"),
            force_recovery_loop: has("force_recovery_loop"),
            high_to_low_search: has("high_to_low_search"),
            recovery_mask_enabled: !has("recovery_mask_off"),
        }
    }

    /// Aligned group width for core-group disablement (1, 2 or 4)
    pub fn core_group_size(&self) -> usize {
        if self.disable_quadruplets {
            4
        } else if self.disable_pairs {
            2
        } else {
            1
        }
    }
}

/// Per-instance search parameters.
///
/// Voltage fields accept literal values ("0.55") or key-value-store keys
/// resolved at search start; a single entry fans out to every target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Test instance name; used for plist resolution and datalog keys
    pub instance_name: String,
    /// Pattern list under search
    pub patlist: String,
    /// Searched voltage rails, in application order
    pub targets: Vec<String>,
    pub start_voltages: Vec<String>,
    pub end_voltage_limits: Vec<String>,
    /// Lower start voltages used to redo a search that passed on its very
    /// first execution; empty disables the overshoot retry
    #[serde(default)]
    pub start_voltages_for_retry: Vec<String>,
    /// Voltage increment per failing step; must be positive
    pub step_size: f64,
    /// Upper bound on search repetitions for recovery purposes
    #[serde(default)]
    pub max_repetition_count: u32,
    /// Literal mask strings, one search pass per entry ("1100,0011")
    #[serde(default)]
    pub multi_pass_masks: Vec<String>,
    pub test_mode: TestMode,
    pub forwarding_mode: ForwardingMode,
    pub recovery_mode: RecoveryModeKind,
    /// Forwarding corner per target; count must match targets when present
    #[serde(default)]
    pub corner_identifiers: Vec<String>,
    /// Flow index per corner; a single value fans out to all corners
    #[serde(default)]
    pub flow_indexes: Vec<u32>,
    /// Comma-separated literal bit patterns, or "group,count" delegating to
    /// a defeature rule group
    #[serde(default)]
    pub recovery_options: String,
    /// Tracker names sourced for the incoming mask
    #[serde(default)]
    pub recovery_tracking_incoming: Option<String>,
    /// Tracker names updated with the outgoing mask
    #[serde(default)]
    pub recovery_tracking_outgoing: Option<String>,
    /// Literal incoming mask; bits set here are excluded from the search
    #[serde(default)]
    pub initial_mask_bits: String,
    /// Pins masked on every execution, independent of decoding
    #[serde(default)]
    pub mask_pins: Vec<String>,
    /// Guardband per target for the limit-guardband check
    #[serde(default)]
    pub limit_guardband: Vec<String>,
    /// Key-value-store keys receiving the aggregated voltage results
    #[serde(default)]
    pub vmin_result_keys: Vec<String>,
    /// Character-index map compressing pattern names in datalog records
    #[serde(default)]
    pub pattern_name_map: String,
    #[serde(default)]
    pub feature_switches: Vec<String>,
}

impl SearchConfig {
    /// Minimal configuration for a plain search over the given targets
    pub fn for_targets(targets: &[&str], start: f64, end: f64, step: f64) -> Self {
        Self {
            instance_name: String::new(),
            patlist: String::new(),
            targets: targets.iter().map(|t| t.to_string()).collect(),
            start_voltages: vec![start.to_string()],
            end_voltage_limits: vec![end.to_string()],
            start_voltages_for_retry: Vec::new(),
            step_size: step,
            max_repetition_count: 0,
            multi_pass_masks: Vec::new(),
            test_mode: if targets.len() == 1 {
                TestMode::SingleVmin
            } else {
                TestMode::MultiVmin
            },
            forwarding_mode: ForwardingMode::None,
            recovery_mode: RecoveryModeKind::Default,
            corner_identifiers: Vec::new(),
            flow_indexes: Vec::new(),
            recovery_options: String::new(),
            recovery_tracking_incoming: None,
            recovery_tracking_outgoing: None,
            initial_mask_bits: String::new(),
            mask_pins: Vec::new(),
            limit_guardband: Vec::new(),
            vmin_result_keys: Vec::new(),
            pattern_name_map: String::new(),
            feature_switches: Vec::new(),
        }
    }

    pub fn switches(&self) -> FeatureSwitches {
        FeatureSwitches::parse(&self.feature_switches)
    }

    /// True when `recovery_options` is a literal bit-pattern list rather
    /// than a rule-group delegation
    pub fn recovery_options_are_literal(&self) -> bool {
        let options = self.recovery_options.replace(' ', "");
        !options.is_empty()
            && options
                .split(',')
                .all(|part| !part.is_empty() && part.chars().all(|c| c == '0' || c == '1'))
    }
}
