//! Accumulated search outcome across multi-pass and repetition executions
//!
//! Collects every per-search result together with the decoded fail bits,
//! evaluates recovery options against them, and merges per-target voltages
//! across passes for the final datalog/forwarding/port decision.

use crate::target::{voltages_equal, SearchResultData, VOLTAGE_FAIL, VOLTAGE_MASK};
use crate::{EngineResult, SearchError};
use tracing::debug;
use vminsearch_base::{BitMask, PlistInfo};
use vminsearch_recovery::{DieRecoveryTracker, RuleStore, TrackerStore};

/// Counters of the multi-pass/repetition control flow
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowState {
    pub multi_pass_count: u32,
    pub repetition_count: u32,
    pub is_any_search_passing: bool,
    pub has_to_abort: bool,
    pub has_to_repeat: bool,
}

impl FlowState {
    pub fn init() -> Self {
        Self::default()
    }

    /// Moves the counters for the next multi-pass search
    pub fn start_search(&mut self) {
        self.multi_pass_count += 1;
        self.repetition_count = 0;
        self.has_to_repeat = false;
    }
}

/// Aggregated state of one engine execution
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    /// Per-search results in execution order
    pub results: Vec<SearchResultData>,
    /// Result bit-vector appended after each completed search
    pub test_results_bits: Vec<BitMask>,
    /// Accepted rule bits of the latest rule evaluation
    pub rules_results_bits: BitMask,
    /// Disablement snapshot taken at search start; immutable
    pub incoming_mask: BitMask,
    /// Raw decoded bits of the last execution, when a pin map is present
    pub decoded_result: Option<BitMask>,
    pub failed_search: bool,
    pub failed_rules: bool,
    pub failed_amble: bool,
    pub max_repetition_count: u32,
    pub flow: FlowState,
}

impl SearchOutcome {
    pub fn new(incoming_mask: BitMask, max_repetition_count: u32) -> Self {
        let width = incoming_mask.len();
        Self {
            results: Vec::new(),
            test_results_bits: Vec::new(),
            rules_results_bits: BitMask::zeros(width),
            incoming_mask,
            decoded_result: None,
            failed_search: false,
            failed_rules: false,
            failed_amble: false,
            max_repetition_count,
            flow: FlowState::init(),
        }
    }

    /// Union of every accumulated result bit-vector
    pub fn or_test_results(&self) -> Option<BitMask> {
        let mut iter = self.test_results_bits.iter();
        let mut result = iter.next()?.clone();
        for bits in iter {
            result.merge(bits);
        }
        Some(result)
    }

    /// Merges per-target voltages across passes into the final result.
    ///
    /// Walking backwards: within the newest multi-pass group a target's
    /// voltage fills mask-sentinel slots; older groups only raise voltages
    /// (or stamp the fail sentinel) for targets they actually searched.
    pub fn aggregate_voltages(&self) -> Vec<f64> {
        let Some(last) = self.results.last() else {
            return Vec::new();
        };
        let mut voltages: Option<Vec<f64>> = None;
        let mut current_multi_pass = last.multi_pass_count + 1;

        for result in self.results.iter().rev() {
            match voltages {
                None => voltages = Some(result.voltages.clone()),
                Some(ref mut merged) => {
                    let same_group = result.multi_pass_count >= current_multi_pass;
                    for target in 0..merged.len() {
                        let candidate = result.voltages[target];
                        let slot = &mut merged[target];
                        if same_group {
                            // same repetition group: fill still-masked slots
                            if !voltages_equal(candidate, VOLTAGE_MASK)
                                && voltages_equal(*slot, VOLTAGE_MASK)
                            {
                                *slot = candidate;
                            }
                        } else if !voltages_equal(candidate, VOLTAGE_MASK)
                            && !voltages_equal(*slot, VOLTAGE_FAIL)
                            && (voltages_equal(candidate, VOLTAGE_FAIL) || candidate > *slot)
                        {
                            *slot = candidate;
                        }
                    }
                }
            }
            current_multi_pass = result.multi_pass_count;
        }

        match voltages {
            Some(v) if !v.is_empty() => v,
            _ => vec![VOLTAGE_MASK; self.results[0].start_voltages.len()],
        }
    }

    /// Recomputes `failed_search` from the latest result of every
    /// multi-pass group
    pub fn update_search_data(&mut self) {
        let Some(last) = self.results.last() else {
            self.failed_search = true;
            return;
        };
        let mut passing = last.is_pass;
        let mut current_multi_pass = last.multi_pass_count + 1;
        for result in self.results.iter().rev() {
            if result.multi_pass_count >= current_multi_pass {
                continue;
            }
            passing &= result.is_pass || result.execution_count == 0;
            current_multi_pass = result.multi_pass_count;
        }
        self.failed_search = !passing;
    }

    /// True when the latest result of any multi-pass group failed on an
    /// amble pattern
    pub fn evaluate_amble_fails(&mut self, plist_info: &dyn PlistInfo) {
        let Some(last) = self.results.last() else {
            self.failed_amble = false;
            return;
        };
        let mut current_multi_pass = last.multi_pass_count + 1;
        for result in self.results.iter().rev() {
            if result.multi_pass_count >= current_multi_pass {
                continue;
            }
            current_multi_pass = result.multi_pass_count;
            if !result.is_pass
                && result
                    .voltage_limiting_patterns
                    .iter()
                    .any(|pattern| plist_info.is_pattern_an_amble(pattern))
            {
                self.failed_amble = true;
                return;
            }
        }
        self.failed_amble = false;
    }

    /// Evaluates the configured recovery options against the accumulated
    /// fail bits.
    ///
    /// With empty options the raw fail bits pass through and fail when any
    /// bit is set. A literal pattern list accepts the first candidate that
    /// is a superset of the observed fails. A "group,count" pair delegates
    /// to the tracker's defeature rule group and accepts its first passing
    /// rule when it satisfies the minimum-good count. Sets `failed_rules`
    /// and returns the accepted (or passthrough) bit-vector.
    pub fn run_rules(
        &mut self,
        recovery_options: &str,
        tracker: Option<&DieRecoveryTracker>,
        tracker_store: &TrackerStore,
        rules: &RuleStore,
    ) -> EngineResult<BitMask> {
        let mut result_bits = self
            .or_test_results()
            .unwrap_or_else(|| BitMask::zeros(self.incoming_mask.len()));

        let options = recovery_options.replace(' ', "");
        if options.is_empty() {
            self.failed_rules = result_bits.any();
            return Ok(result_bits);
        }

        if let Some(tracker) = tracker {
            result_bits.merge(&tracker.mask_bits(tracker_store)?);
        }

        let literal = options
            .split(',')
            .all(|part| !part.is_empty() && part.chars().all(|c| c == '0' || c == '1'));
        if literal {
            for option in options.split(',') {
                if option.len() != result_bits.len() {
                    return Err(SearchError::Config(format!(
                        "recovery option [{option}] does not match result width {}",
                        result_bits.len()
                    )));
                }
                let combination = BitMask::parse(option).map_err(SearchError::Base)?;
                if combination.is_superset_of(&result_bits) {
                    debug!(accepted = %combination, "recovery option accepted");
                    self.failed_rules = false;
                    return Ok(combination);
                }
            }
        } else {
            let parts: Vec<&str> = options.split(',').collect();
            let [group, count] = parts.as_slice() else {
                return Err(SearchError::Config(format!(
                    "invalid recovery options [{recovery_options}]: expected bit vectors or GroupName,Size"
                )));
            };
            let count: usize = count.parse().map_err(|_| {
                SearchError::Config(format!("invalid rule size in recovery options [{count}]"))
            })?;
            if let Some(tracker) = tracker {
                let passing = tracker.run_rule(&result_bits, group, rules)?;
                let Some(first) = passing.first() else {
                    self.failed_rules = true;
                    return Ok(result_bits);
                };
                if first.size >= count {
                    self.failed_rules = false;
                    return Ok(first.bit_vector.clone());
                }
            }
        }

        self.failed_rules = result_bits.any();
        Ok(result_bits)
    }
}
