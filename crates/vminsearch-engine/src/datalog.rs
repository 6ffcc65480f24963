//! Structured datalog records for search results
//!
//! Formats the ordered field lists written to the injected datalog sink:
//! `_`-joined per-target values, `|`-separated field groups, and the
//! colon-delimited corner:flow:frequency forwarding configuration. Only
//! string records are produced here; framing belongs to the sink.

use crate::target::SearchResultData;
use crate::EngineResult;
use vminsearch_base::DatalogSink;
use vminsearch_forwarding::VminForwardingStore;

const TOKEN_SEPARATOR: &str = "|";
const TARGET_SEPARATOR: &str = "_";
const LIMITING_PATTERN_SEPARATOR: &str = "^";
const FORWARDING_CONFIG_SEPARATOR: &str = ":";
const FORWARDING_CONFIG_SUFFIX: &str = "_vminFwCfg";
const SKIP_SEARCH_VALUE: i32 = 9999;

/// Voltage formatted to three decimals, capped at five characters so
/// sentinels print as "-9999"/"-8888"
fn format_voltage(value: f64) -> String {
    let text = format!("{value:.3}");
    if text.len() <= 5 {
        text
    } else {
        text[..5].to_string()
    }
}

fn join_voltages(values: &[f64]) -> String {
    values
        .iter()
        .map(|v| format_voltage(*v))
        .collect::<Vec<_>>()
        .join(TARGET_SEPARATOR)
}

/// Characters of `text` selected by a comma-separated index map; negative
/// indexes count from the end
pub fn mapped_string(text: &str, index_map: &str) -> String {
    if index_map.is_empty() {
        return text.to_string();
    }
    let chars: Vec<char> = text.chars().collect();
    index_map
        .split(',')
        .filter_map(|token| token.trim().parse::<i64>().ok())
        .filter_map(|index| {
            let position = if index < 0 {
                chars.len() as i64 + index
            } else {
                index
            };
            chars.get(position as usize)
        })
        .collect()
}

fn write_voltage_results(
    sink: &mut dyn DatalogSink,
    result_voltages: &[f64],
    start_voltages: &[f64],
    end_voltages: &[f64],
    execution_count: u32,
    postfix: &str,
) {
    let data = format!(
        "{}{TOKEN_SEPARATOR}{}{TOKEN_SEPARATOR}{}{TOKEN_SEPARATOR}{execution_count}",
        join_voltages(result_voltages),
        join_voltages(start_voltages),
        join_voltages(end_voltages),
    );
    let postfix = if postfix.is_empty() {
        String::new()
    } else {
        format!("{TARGET_SEPARATOR}{postfix}")
    };
    sink.write_record(&postfix, &data);
}

fn write_limiting_patterns(
    sink: &mut dyn DatalogSink,
    patterns: &[String],
    pattern_name_map: &str,
    postfix: &str,
) {
    let data = patterns
        .iter()
        .map(|pattern| mapped_string(pattern, pattern_name_map))
        .collect::<Vec<_>>()
        .join(LIMITING_PATTERN_SEPARATOR);
    let postfix = if postfix.is_empty() {
        String::new()
    } else {
        format!("{TARGET_SEPARATOR}{postfix}")
    };
    sink.write_record(&postfix, &data);
}

fn write_per_target_increments(sink: &mut dyn DatalogSink, increments: &[u32], postfix: &str) {
    let data = increments
        .iter()
        .map(|count| count.to_string())
        .collect::<Vec<_>>()
        .join(TARGET_SEPARATOR);
    let postfix = if postfix.is_empty() {
        "_it".to_string()
    } else {
        format!("{TARGET_SEPARATOR}{postfix}_it")
    };
    sink.write_record(&postfix, &data);
}

/// Logs a skipped search: placeholder result values plus the configured
/// voltage range
pub fn log_skip_search(sink: &mut dyn DatalogSink, start_voltages: &[f64], end_voltages: &[f64]) {
    let placeholders = vec![SKIP_SEARCH_VALUE.to_string(); start_voltages.len()].join(TARGET_SEPARATOR);
    let data = format!(
        "{placeholders}{TOKEN_SEPARATOR}{}{TOKEN_SEPARATOR}{}",
        join_voltages(start_voltages),
        join_voltages(end_voltages),
    );
    sink.write_record("", &data);
}

/// One record per executed search, tagged with its multi-pass/repetition
/// postfix
pub fn print_results_for_all_searches(
    sink: &mut dyn DatalogSink,
    results: &[SearchResultData],
    pattern_name_map: &str,
    print_per_target_increments: bool,
) {
    for result in results {
        if result.execution_count != 0 {
            write_voltage_results(
                sink,
                &result.voltages,
                &result.start_voltages,
                &result.end_voltage_limits,
                result.execution_count,
                &result.tname_postfix,
            );
            if !pattern_name_map.is_empty() {
                write_limiting_patterns(
                    sink,
                    &result.voltage_limiting_patterns,
                    pattern_name_map,
                    &result.tname_postfix,
                );
            }
            if print_per_target_increments {
                write_per_target_increments(
                    sink,
                    &result.per_target_increments,
                    &result.tname_postfix,
                );
            }
        } else if result.fail_reason.is_some() {
            log_skip_search(sink, &result.start_voltages, &result.end_voltage_limits);
        }
    }
}

/// Merged across passes: one record carrying, per target, the voltage of
/// the pass that produced its final value, with execution counts summed
pub fn print_merged_search_results(
    sink: &mut dyn DatalogSink,
    results: &[SearchResultData],
    pattern_name_map: &str,
    print_per_target_increments: bool,
) {
    let Some(merged) = merge_search_results(results, pattern_name_map, print_per_target_increments)
    else {
        return;
    };
    if merged.execution_count != 0 {
        write_voltage_results(
            sink,
            &merged.voltages,
            &merged.start_voltages,
            &merged.end_voltages,
            merged.execution_count,
            "",
        );
        if !pattern_name_map.is_empty() {
            write_limiting_patterns(sink, &merged.limiting_patterns, pattern_name_map, "");
        }
        if print_per_target_increments {
            write_per_target_increments(sink, &merged.per_target_increments, "");
        }
    } else if merged.fail_reason {
        log_skip_search(sink, &merged.start_voltages, &merged.end_voltages);
    }
}

/// Forwarding configuration record: `corner:flow:freqGHz` per corner,
/// consumed downstream to configure forwarding tables
pub fn log_vmin_configuration(
    sink: &mut dyn DatalogSink,
    corners: &[(String, u32)],
    store: &VminForwardingStore,
) -> EngineResult<()> {
    if corners.is_empty() {
        return Ok(());
    }
    let mut fields = Vec::with_capacity(corners.len());
    for (corner, flow) in corners {
        let ghz = store.frequency(corner, *flow)? / 1e9;
        fields.push(format!(
            "{corner}{FORWARDING_CONFIG_SEPARATOR}{flow}{FORWARDING_CONFIG_SEPARATOR}{ghz:.3}"
        ));
    }
    sink.write_record(FORWARDING_CONFIG_SUFFIX, &fields.join(TARGET_SEPARATOR));
    Ok(())
}

struct MergedSearchResult {
    voltages: Vec<f64>,
    start_voltages: Vec<f64>,
    end_voltages: Vec<f64>,
    limiting_patterns: Vec<String>,
    per_target_increments: Vec<u32>,
    execution_count: u32,
    fail_reason: bool,
}

fn merge_search_results(
    results: &[SearchResultData],
    pattern_name_map: &str,
    include_increments: bool,
) -> Option<MergedSearchResult> {
    use crate::target::{voltages_equal, VOLTAGE_FAIL, VOLTAGE_MASK};

    let last = results.last()?;
    let mut merged = MergedSearchResult {
        voltages: last.voltages.clone(),
        start_voltages: last.start_voltages.clone(),
        end_voltages: last.end_voltage_limits.clone(),
        limiting_patterns: last.voltage_limiting_patterns.clone(),
        per_target_increments: last.per_target_increments.clone(),
        execution_count: last.execution_count,
        fail_reason: last.fail_reason.is_some(),
    };
    let mut current_multi_pass = last.multi_pass_count;

    for result in results.iter().rev().skip(1) {
        let older_pass = result.multi_pass_count < current_multi_pass;
        for target in 0..merged.voltages.len() {
            let candidate = result.voltages[target];
            if voltages_equal(candidate, VOLTAGE_MASK) {
                continue;
            }
            let update = if older_pass {
                !voltages_equal(merged.voltages[target], VOLTAGE_FAIL)
                    && (voltages_equal(candidate, VOLTAGE_FAIL)
                        || candidate > merged.voltages[target])
            } else {
                voltages_equal(merged.voltages[target], VOLTAGE_MASK)
            };
            if update {
                merged.voltages[target] = candidate;
                merged.start_voltages[target] = result.start_voltages[target];
                merged.end_voltages[target] = result.end_voltage_limits[target];
                if !pattern_name_map.is_empty() {
                    merged.limiting_patterns[target] =
                        result.voltage_limiting_patterns[target].clone();
                }
                if include_increments {
                    merged.per_target_increments[target] = result.per_target_increments[target];
                }
            }
        }
        if older_pass {
            merged.fail_reason |= result.fail_reason.is_some();
        }
        merged.execution_count += result.execution_count;
        current_multi_pass = result.multi_pass_count;
    }
    Some(merged)
}
