//! Per-step search-point state machine
//!
//! Tracks the current voltage of every target through one search: sticky
//! pass (a passing target is never re-stepped), voltage increments for
//! failing targets, end-limit exhaustion, and the per-point history the
//! result aggregation consumes.

use crate::target::{
    step_round, voltages_equal, FailReason, PatternData, SearchPointData, VoltageTarget,
    VOLTAGE_FAIL, VOLTAGE_MASK,
};
use tracing::{debug, error, warn};
use vminsearch_base::BitMask;

/// Mutable search state over a fixed set of voltage targets
#[derive(Debug)]
pub struct SearchPoint {
    targets: Vec<VoltageTarget>,
    high_to_low: bool,
    recovery_mask_enabled: bool,
    /// Index groups of targets sharing one rail name; repeated targets are
    /// driven at the max voltage of their group
    repeated_groups: Vec<Vec<usize>>,
    pub execution_count: u32,
    pub per_point_data: Vec<SearchPointData>,
    pub fail_reason: Option<FailReason>,
    plist_result_bits: BitMask,
}

impl SearchPoint {
    pub fn new(targets: Vec<VoltageTarget>, high_to_low: bool, recovery_mask_enabled: bool) -> Self {
        let mut repeated_groups: Vec<Vec<usize>> = Vec::new();
        for (index, target) in targets.iter().enumerate() {
            match repeated_groups
                .iter_mut()
                .find(|group| targets[group[0]].name == target.name)
            {
                Some(group) => group.push(index),
                None => repeated_groups.push(vec![index]),
            }
        }
        repeated_groups.retain(|group| group.len() > 1);

        let count = targets.len();
        Self {
            targets,
            high_to_low,
            recovery_mask_enabled,
            repeated_groups,
            execution_count: 0,
            per_point_data: Vec::new(),
            fail_reason: None,
            plist_result_bits: BitMask::zeros(count),
        }
    }

    pub fn targets(&self) -> &[VoltageTarget] {
        &self.targets
    }

    pub fn targets_count(&self) -> usize {
        self.targets.len()
    }

    /// Voltages to apply at the current point, in target order
    pub fn voltages(&self) -> Vec<f64> {
        self.targets.iter().map(|t| t.current).collect()
    }

    pub fn start_voltages(&self) -> Vec<f64> {
        self.targets.iter().map(|t| t.start).collect()
    }

    pub fn end_voltage_limits(&self) -> Vec<f64> {
        self.targets.iter().map(|t| t.end_limit).collect()
    }

    pub fn per_target_increments(&self) -> Vec<u32> {
        self.targets.iter().map(|t| t.increments).collect()
    }

    /// Mask of targets excluded from further stepping
    pub fn mask_bits(&self) -> BitMask {
        self.targets.iter().map(|t| t.masked).collect()
    }

    /// Re-arms the point for a fresh search. Returns `false` (with
    /// `fail_reason` set) when the voltage ranges or the initial mask make
    /// the search unexecutable; a skip result is still recorded.
    pub fn reset(
        &mut self,
        start_voltages: &[f64],
        end_voltage_limits: &[f64],
        initial_mask: BitMask,
    ) -> bool {
        self.per_point_data.clear();
        self.fail_reason = None;
        for (target, (&start, &end)) in self
            .targets
            .iter_mut()
            .zip(start_voltages.iter().zip(end_voltage_limits))
        {
            target.start = start;
            target.end_limit = end;
            target.current = start;
            target.increments = 0;
            target.masked = false;
        }

        if !self.are_voltage_values_valid() {
            self.disable_all_targets();
            self.record_point(PatternData::default());
            return false;
        }

        self.level_repeated_targets();
        self.initial_mask_setup(initial_mask);
        if self.mask_bits().all() {
            error!(
                mask = %self.mask_bits(),
                "no enabled bits in initial mask, search is not executed"
            );
            self.disable_all_targets();
            self.record_point(PatternData::default());
            self.fail_reason = Some(FailReason::InvalidInitialMask);
            return false;
        }
        true
    }

    /// Appends the current voltages and fail-pattern identity to the
    /// per-point history
    pub fn record_point(&mut self, fail_pattern: PatternData) {
        self.per_point_data.push(SearchPointData {
            voltages: self.voltages(),
            fail_pattern,
        });
    }

    /// Validates and stores the decoded result bits of one execution.
    /// Returns the pass verdict: pass = no attributed failure bit.
    pub fn process_results(&mut self, plist_passed: bool, result_bits: BitMask) -> bool {
        let bits = if self.are_result_bits_invalid(plist_passed, &result_bits) {
            warn!("replacing decoded result by all-fail bits due to invalid condition");
            BitMask::ones(self.targets.len())
        } else {
            result_bits
        };
        debug!(bits = %bits, "decoded result bits");
        self.plist_result_bits = bits;
        !self.plist_result_bits.any()
    }

    /// Steps every failing target and disables targets that stepped past
    /// their end limit
    pub fn advance(&mut self) {
        let mut any_voltage_updated = false;
        for index in 0..self.targets.len() {
            if self.targets[index].current >= 0.0 && self.plist_result_bits.get(index) {
                self.step_target(index);
                any_voltage_updated = true;
            }
            if self.is_before_end_limit(self.targets[index].current, index) {
                continue;
            }
            self.disable_target(index);
            any_voltage_updated = true;
        }

        if !any_voltage_updated {
            // Nothing stepped: the decoded bits only covered already-done
            // targets. Treat every remaining target as failing instead.
            warn!("no voltage updated for next point, treating all targets as failing");
            self.plist_result_bits = BitMask::ones(self.targets.len());
            self.advance();
            return;
        }
        self.level_repeated_targets();
    }

    /// True when the search cannot continue: every target is already
    /// masked/disabled, or (with the recovery mask disabled) any target has
    /// failed out
    pub fn recovery_not_possible(&self) -> bool {
        if self.recovery_mask_enabled {
            self.mask_bits().all()
        } else {
            self.targets
                .iter()
                .any(|t| voltages_equal(t.current, VOLTAGE_FAIL))
        }
    }

    pub fn disable_all_targets(&mut self) {
        for index in 0..self.targets.len() {
            if !voltages_equal(self.targets[index].current, VOLTAGE_MASK) {
                self.disable_target(index);
            }
        }
    }

    fn disable_target(&mut self, index: usize) {
        self.targets[index].current = VOLTAGE_FAIL;
        self.targets[index].masked = true;
    }

    fn step_target(&mut self, index: usize) {
        let target = &mut self.targets[index];
        target.current = if self.high_to_low {
            step_round(target.current - target.step_size)
        } else {
            step_round(target.current + target.step_size)
        };
        target.increments += 1;
    }

    fn is_before_end_limit(&self, value: f64, index: usize) -> bool {
        let end = self.targets[index].end_limit;
        if self.high_to_low {
            value >= end
        } else {
            value <= end
        }
    }

    fn are_voltage_values_valid(&mut self) -> bool {
        let mut any_positive_start = false;
        for index in 0..self.targets.len() {
            let start = self.targets[index].start;
            if start >= 0.0 {
                any_positive_start = true;
            }
            if self.is_before_end_limit(start, index) {
                continue;
            }
            error!(
                start,
                end = self.targets[index].end_limit,
                "start voltage lies beyond the end voltage"
            );
            self.fail_reason = Some(FailReason::InvalidRange);
            return false;
        }
        if !any_positive_start {
            error!("no valid start voltage values, search is not executed");
            self.fail_reason = Some(FailReason::InvalidStartVoltage);
            return false;
        }
        true
    }

    fn initial_mask_setup(&mut self, initial_mask: BitMask) {
        let mask = if initial_mask.len() != self.targets.len() {
            error!(
                mask = %initial_mask,
                targets = self.targets.len(),
                "initial mask width does not match target count, using all-enabled"
            );
            BitMask::zeros(self.targets.len())
        } else {
            initial_mask
        };
        for (index, target) in self.targets.iter_mut().enumerate() {
            if target.current < 0.0 {
                target.masked = true;
            } else {
                target.masked = mask.get(index);
            }
            if target.masked {
                target.current = VOLTAGE_MASK;
            }
        }
        debug!(mask = %self.mask_bits(), "initial mask bits");
    }

    fn are_result_bits_invalid(&self, plist_passed: bool, bits: &BitMask) -> bool {
        if bits.len() != self.targets.len() {
            warn!(
                bits = %bits,
                expected = self.targets.len(),
                "result bits do not match target count"
            );
            return true;
        }
        if !plist_passed && !bits.any() {
            warn!("no failures reported for a failing execution");
            return true;
        }
        if self.mask_bits().and(bits).any() {
            warn!(bits = %bits, mask = %self.mask_bits(), "failure attributed to a masked target");
            return true;
        }
        false
    }

    /// Repeated rail names share one physical supply; drive the group at
    /// its maximum requested voltage
    fn level_repeated_targets(&mut self) {
        for group in &self.repeated_groups {
            let max = group
                .iter()
                .map(|&i| self.targets[i].current)
                .fold(f64::NEG_INFINITY, f64::max);
            for &i in group {
                self.targets[i].current = max;
            }
        }
    }
}
