//! Voltage targets, search points and per-search results
//!
//! Sentinel voltages: a target that exhausted its range reports
//! `VOLTAGE_FAIL`, a target excluded from the search reports
//! `VOLTAGE_MASK`. Every final voltage is either a stepped value between
//! start and end limit or one of the two sentinels.

use vminsearch_base::BitMask;
use vminsearch_forwarding::CornerKey;

/// Voltage reported for a target that failed at its end limit
pub const VOLTAGE_FAIL: f64 = -9999.0;

/// Voltage reported for a target masked out of the search
pub const VOLTAGE_MASK: f64 = -8888.0;

/// Tolerance absorbing binary rounding of decimal step sizes
pub const VOLTAGE_EPSILON: f64 = 1e-3;

/// Token logged when no limiting pattern is known
pub const NO_LIMITING_PATTERN: &str = "na";

/// Equality under the voltage epsilon
pub fn voltages_equal(a: f64, b: f64) -> bool {
    (a - b).abs() < VOLTAGE_EPSILON
}

/// Normalizes a stepped voltage to three decimals so accumulated binary
/// rounding cannot drift past an end limit
pub fn step_round(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// One controllable voltage rail/domain under search
#[derive(Debug, Clone)]
pub struct VoltageTarget {
    /// Rail identifier, as known to the voltage-control collaborator
    pub name: String,
    /// Start voltage of the current search
    pub start: f64,
    /// End (limit) voltage of the current search
    pub end_limit: f64,
    /// Voltage increment per failing step
    pub step_size: f64,
    /// Voltage applied at the current search point
    pub current: f64,
    /// Forwarding key, when this rail participates in Vmin forwarding
    pub corner: Option<CornerKey>,
    /// Excluded from search; driven at the masked sentinel voltage
    pub masked: bool,
    /// Number of voltage increments taken this search
    pub increments: u32,
}

impl VoltageTarget {
    pub fn new(name: &str, step_size: f64) -> Self {
        Self {
            name: name.to_string(),
            start: 0.0,
            end_limit: 0.0,
            step_size,
            current: 0.0,
            corner: None,
            masked: false,
            increments: 0,
        }
    }
}

/// Identity of the pattern that limited a search point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternData {
    pub pattern_name: String,
    pub burst_index: u32,
    pub pattern_id: u32,
    pub fail_vector: u64,
}

impl Default for PatternData {
    fn default() -> Self {
        Self {
            pattern_name: NO_LIMITING_PATTERN.to_string(),
            burst_index: 0,
            pattern_id: 0,
            fail_vector: 0,
        }
    }
}

/// One executed pattern pass: voltages applied plus the originating fail
/// pattern. Immutable once recorded.
#[derive(Debug, Clone)]
pub struct SearchPointData {
    pub voltages: Vec<f64>,
    pub fail_pattern: PatternData,
}

/// Why a search was skipped without executing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    /// A start voltage lies beyond its end limit
    InvalidRange,
    /// No target has a usable start voltage
    InvalidStartVoltage,
    /// The initial mask leaves no target enabled
    InvalidInitialMask,
}

impl std::fmt::Display for FailReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            FailReason::InvalidRange => "InvalidRange",
            FailReason::InvalidStartVoltage => "InvalidStartVoltage",
            FailReason::InvalidInitialMask => "InvalidInitialMask",
        };
        f.write_str(text)
    }
}

/// Identifiers of one search execution within the multi-pass/repetition flow
#[derive(Debug, Clone, Default)]
pub struct SearchIdentifiers {
    /// Datalog test-name postfix, e.g. "M1R2"
    pub tname_postfix: String,
    pub multi_pass_count: u32,
    pub repetition_count: u32,
}

/// Final state of one search, per target
#[derive(Debug, Clone)]
pub struct SearchResultData {
    pub voltages: Vec<f64>,
    pub start_voltages: Vec<f64>,
    pub end_voltage_limits: Vec<f64>,
    pub is_pass: bool,
    pub mask_bits: BitMask,
    pub execution_count: u32,
    pub per_target_increments: Vec<u32>,
    /// First pattern that limited each target's voltage
    pub voltage_limiting_patterns: Vec<String>,
    pub tname_postfix: String,
    pub multi_pass_count: u32,
    pub repetition_count: u32,
    pub fail_reason: Option<FailReason>,
}

impl SearchResultData {
    /// Snapshots the search-point state into an immutable result
    pub fn new(
        voltages: Vec<f64>,
        start_voltages: Vec<f64>,
        end_voltage_limits: Vec<f64>,
        mask_bits: BitMask,
        execution_count: u32,
        per_target_increments: Vec<u32>,
        per_point_data: &[SearchPointData],
        fail_reason: Option<FailReason>,
        is_pass: bool,
        identifiers: SearchIdentifiers,
    ) -> Self {
        let limiting = Self::limiting_patterns(&voltages, per_point_data);
        Self {
            voltages,
            start_voltages,
            end_voltage_limits,
            is_pass,
            mask_bits,
            execution_count,
            per_target_increments,
            voltage_limiting_patterns: limiting,
            tname_postfix: identifiers.tname_postfix,
            multi_pass_count: identifiers.multi_pass_count,
            repetition_count: identifiers.repetition_count,
            fail_reason,
        }
    }

    /// Selects the limiting pattern for each target from the per-point
    /// history: the pattern of the last point where the target still had a
    /// different (lower) voltage.
    fn limiting_patterns(voltages: &[f64], points: &[SearchPointData]) -> Vec<String> {
        let mut limiting = vec![NO_LIMITING_PATTERN.to_string(); voltages.len()];
        if points.is_empty() {
            return limiting;
        }
        if points.len() == 1 {
            for pattern in &mut limiting {
                *pattern = points[0].fail_pattern.pattern_name.clone();
            }
            return limiting;
        }

        let last = &points[points.len() - 1].voltages;
        for target in 0..voltages.len() {
            if last[target] > 0.0 {
                for point in points[..points.len() - 1].iter().rev() {
                    if !voltages_equal(point.voltages[target], last[target]) {
                        limiting[target] = point.fail_pattern.pattern_name.clone();
                        break;
                    }
                }
            } else if voltages_equal(last[target], VOLTAGE_FAIL) {
                for point in points[..points.len() - 1].iter().rev() {
                    if point.voltages[target] > 0.0 {
                        limiting[target] = point.fail_pattern.pattern_name.clone();
                        break;
                    }
                }
            }
        }
        limiting
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(voltages: &[f64], pattern: &str) -> SearchPointData {
        SearchPointData {
            voltages: voltages.to_vec(),
            fail_pattern: PatternData {
                pattern_name: pattern.to_string(),
                ..PatternData::default()
            },
        }
    }

    #[test]
    fn test_step_round_absorbs_binary_drift() {
        let mut voltage = 0.5;
        for _ in 0..3 {
            voltage = step_round(voltage + 0.1);
        }
        assert_eq!(voltage, 0.8);
        assert!(voltages_equal(voltage, 0.8));
    }

    #[test]
    fn test_limiting_pattern_is_last_differing_point() {
        let points = vec![
            point(&[0.5, 0.5], "pat_a"),
            point(&[0.6, 0.5], "pat_b"),
            point(&[0.6, 0.5], "pat_b"),
        ];
        let limiting = SearchResultData::limiting_patterns(&[0.6, 0.5], &points);
        // target 0 was last raised by pat_a's failure; target 1 never moved
        assert_eq!(limiting[0], "pat_a");
        assert_eq!(limiting[1], NO_LIMITING_PATTERN);
    }

    #[test]
    fn test_limiting_pattern_for_failed_target() {
        let points = vec![
            point(&[0.7], "pat_a"),
            point(&[0.8], "pat_b"),
            point(&[VOLTAGE_FAIL], "pat_b"),
        ];
        let limiting = SearchResultData::limiting_patterns(&[VOLTAGE_FAIL], &points);
        assert_eq!(limiting[0], "pat_b");
    }

    #[test]
    fn test_single_point_history_uses_its_pattern() {
        let points = vec![point(&[0.5], "pat_only")];
        let limiting = SearchResultData::limiting_patterns(&[0.5], &points);
        assert_eq!(limiting[0], "pat_only");
    }
}
