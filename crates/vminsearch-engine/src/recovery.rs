//! Recovery-mode strategies and exit-port resolution
//!
//! A recovery mode decides four things from the accumulated outcome: the
//! exit port, whether the search repeats at the same voltage point, how the
//! per-search initial mask is built, and whether/how the outgoing
//! die-recovery tracker commits. The strategies share the default
//! behaviors as free functions and override only what differs.

use crate::config::RecoveryModeKind;
use crate::outcome::SearchOutcome;
use crate::target::{voltages_equal, VOLTAGE_FAIL};
use crate::EngineResult;
use tracing::debug;
use vminsearch_base::{BitMask, DatalogSink, PatternExecutor};
use vminsearch_recovery::{DieRecoveryTracker, PinMap, RuleStore, TrackerStore, UpdateMode};

/// Failed search and failed recovery rules
pub const FAIL_PORT: i32 = 0;
/// Passed
pub const PASS_PORT: i32 = 1;
/// Passed search but failed recovery rules
pub const FAIL_RULES_PORT: i32 = 2;
/// Failed search and passed recovery rules
pub const FAIL_RECOVERY_PORT: i32 = 3;
/// Search failure caused by an amble pattern
pub const FAIL_AMBLE_PORT: i32 = 5;

/// Collaborators a recovery mode consults while evaluating an outcome
pub struct RecoveryContext<'a> {
    pub pin_map: Option<&'a PinMap>,
    pub executor: &'a mut dyn PatternExecutor,
    pub tracker: Option<&'a DieRecoveryTracker>,
    pub tracker_store: &'a mut TrackerStore,
    pub rules: &'a RuleStore,
    pub sink: &'a mut dyn DatalogSink,
    pub recovery_options: &'a str,
    /// Derive result bits from final voltages (multi-domain searches)
    /// instead of the raw decoded bits
    pub decode_from_voltages: bool,
}

/// Strategy interface for the configured recovery mode
pub trait RecoveryMode {
    /// Exit port for the final outcome
    fn port(&self, outcome: &SearchOutcome) -> i32;

    /// Evaluates the finished search and decides whether to repeat it at
    /// the same voltage point. Always restores pin-map masking first and
    /// re-runs the recovery rules.
    fn has_to_repeat_search(
        &self,
        outcome: &mut SearchOutcome,
        ctx: &mut RecoveryContext<'_>,
    ) -> EngineResult<bool>;

    /// Commits (or merely logs) the outgoing tracker update. `Ok(false)`
    /// means the commit was rejected and the test must hard-fail.
    fn update_recovery_trackers(
        &self,
        outcome: &SearchOutcome,
        tracker: &DieRecoveryTracker,
        tracker_store: &mut TrackerStore,
        sink: &mut dyn DatalogSink,
        force_update: bool,
    ) -> EngineResult<bool>;

    /// Initial mask for the next search iteration
    fn mask_bits(&self, outcome: &SearchOutcome, use_rules_bits: bool) -> BitMask;
}

/// Builds the strategy for the configured kind
pub fn recovery_mode_for(kind: RecoveryModeKind) -> Box<dyn RecoveryMode> {
    match kind {
        RecoveryModeKind::Default => Box::new(DefaultMode),
        RecoveryModeKind::RecoveryPort => Box::new(RecoveryPortMode),
        RecoveryModeKind::RecoveryLoop => Box::new(RecoveryLoopMode),
        RecoveryModeKind::RecoveryFailRetest => Box::new(RecoveryFailRetestMode),
        RecoveryModeKind::NoRecovery => Box::new(NoRecoveryMode),
    }
}

/// Result bits for rule evaluation: either the raw decoded bits of the
/// last execution, or bits derived from the aggregated final voltages
/// (fail sentinel = failing), expanded to tracker width when a pin map is
/// configured.
fn result_bits(outcome: &SearchOutcome, ctx: &RecoveryContext<'_>) -> EngineResult<BitMask> {
    if !ctx.decode_from_voltages {
        if let Some(decoded) = &outcome.decoded_result {
            debug!(bits = %decoded, "result bits from decode");
            return Ok(decoded.clone());
        }
    }

    let voltages = outcome.aggregate_voltages();
    let mut bits = BitMask::zeros(voltages.len());
    for (index, voltage) in voltages.iter().enumerate() {
        if voltages_equal(*voltage, VOLTAGE_FAIL) {
            bits.set(index, true);
        }
    }
    if bits.len() != outcome.incoming_mask.len() {
        if let Some(pin_map) = ctx.pin_map {
            bits = pin_map.voltage_domains_to_fail_tracker(&bits)?;
        }
    }
    debug!(bits = %bits, "result bits from voltages");
    Ok(bits)
}

/// Shared post-search evaluation: restore masking, refresh the pass/fail
/// state, accumulate the result bits, re-run the rules
fn evaluate_search(
    outcome: &mut SearchOutcome,
    ctx: &mut RecoveryContext<'_>,
) -> EngineResult<()> {
    if let Some(pin_map) = ctx.pin_map {
        pin_map.restore(&mut *ctx.executor);
    }
    outcome.update_search_data();
    let bits = result_bits(outcome, ctx)?;
    outcome.test_results_bits.push(bits);
    outcome.rules_results_bits =
        outcome.run_rules(ctx.recovery_options, ctx.tracker, ctx.tracker_store, ctx.rules)?;
    Ok(())
}

fn default_port(outcome: &SearchOutcome) -> i32 {
    match (outcome.failed_search, outcome.failed_rules) {
        (true, false) => FAIL_RECOVERY_PORT,
        (true, true) => FAIL_PORT,
        (false, false) => PASS_PORT,
        (false, true) => FAIL_RULES_PORT,
    }
}

fn or_test_results(outcome: &SearchOutcome) -> BitMask {
    outcome
        .or_test_results()
        .unwrap_or_else(|| BitMask::zeros(outcome.incoming_mask.len()))
}

/// Default commit policy: only a fully passing outcome (or a forced
/// update) writes the tracker; everything else logs the evaluation
fn default_update_trackers(
    outcome: &SearchOutcome,
    tracker: &DieRecoveryTracker,
    tracker_store: &mut TrackerStore,
    sink: &mut dyn DatalogSink,
    force_update: bool,
    skip_commit: bool,
) -> EngineResult<bool> {
    let test_results = or_test_results(outcome);
    if !force_update && skip_commit {
        tracker.log_tracking_structure(tracker_store, sink, &outcome.incoming_mask, &test_results)?;
        return Ok(true);
    }

    debug!(bits = %outcome.rules_results_bits, "updating tracking structure");
    let updated = tracker.update(
        tracker_store,
        &outcome.rules_results_bits,
        Some(&outcome.incoming_mask),
        Some(&test_results),
        UpdateMode::Merge,
        Some(sink),
    )?;
    if !updated {
        debug!("unable to update die-recovery trackers");
    }
    Ok(updated)
}

fn default_mask_bits(outcome: &SearchOutcome, use_rules_bits: bool) -> BitMask {
    if use_rules_bits {
        return outcome.rules_results_bits.or(&outcome.incoming_mask);
    }
    if outcome.test_results_bits.is_empty() {
        return outcome.incoming_mask.clone();
    }
    or_test_results(outcome).or(&outcome.incoming_mask)
}

/// Rule evaluation decides the port; trackers commit only on a full pass
pub struct DefaultMode;

impl RecoveryMode for DefaultMode {
    fn port(&self, outcome: &SearchOutcome) -> i32 {
        default_port(outcome)
    }

    fn has_to_repeat_search(
        &self,
        outcome: &mut SearchOutcome,
        ctx: &mut RecoveryContext<'_>,
    ) -> EngineResult<bool> {
        evaluate_search(outcome, ctx)?;
        Ok(false)
    }

    fn update_recovery_trackers(
        &self,
        outcome: &SearchOutcome,
        tracker: &DieRecoveryTracker,
        tracker_store: &mut TrackerStore,
        sink: &mut dyn DatalogSink,
        force_update: bool,
    ) -> EngineResult<bool> {
        let skip = outcome.failed_rules || outcome.failed_search;
        default_update_trackers(outcome, tracker, tracker_store, sink, force_update, skip)
    }

    fn mask_bits(&self, outcome: &SearchOutcome, use_rules_bits: bool) -> BitMask {
        default_mask_bits(outcome, use_rules_bits)
    }
}

/// Like `DefaultMode`, but an accepted disablement combination commits the
/// tracker even when the search failed
pub struct RecoveryPortMode;

impl RecoveryMode for RecoveryPortMode {
    fn port(&self, outcome: &SearchOutcome) -> i32 {
        default_port(outcome)
    }

    fn has_to_repeat_search(
        &self,
        outcome: &mut SearchOutcome,
        ctx: &mut RecoveryContext<'_>,
    ) -> EngineResult<bool> {
        evaluate_search(outcome, ctx)?;
        Ok(false)
    }

    fn update_recovery_trackers(
        &self,
        outcome: &SearchOutcome,
        tracker: &DieRecoveryTracker,
        tracker_store: &mut TrackerStore,
        sink: &mut dyn DatalogSink,
        force_update: bool,
    ) -> EngineResult<bool> {
        default_update_trackers(
            outcome,
            tracker,
            tracker_store,
            sink,
            force_update,
            outcome.failed_rules,
        )
    }

    fn mask_bits(&self, outcome: &SearchOutcome, use_rules_bits: bool) -> BitMask {
        default_mask_bits(outcome, use_rules_bits)
    }
}

/// Masks the units an accepted rule disables and re-executes the same
/// voltage step, committing the tracker before each repetition
pub struct RecoveryLoopMode;

impl RecoveryMode for RecoveryLoopMode {
    fn port(&self, outcome: &SearchOutcome) -> i32 {
        default_port(outcome)
    }

    fn has_to_repeat_search(
        &self,
        outcome: &mut SearchOutcome,
        ctx: &mut RecoveryContext<'_>,
    ) -> EngineResult<bool> {
        evaluate_search(outcome, ctx)?;

        if outcome.failed_search
            && !outcome.failed_rules
            && outcome.flow.repetition_count < outcome.max_repetition_count
        {
            let updated = match ctx.tracker {
                Some(tracker) => {
                    let test_results = or_test_results(outcome);
                    tracker.update(
                        &mut *ctx.tracker_store,
                        &outcome.rules_results_bits,
                        Some(&outcome.incoming_mask),
                        Some(&test_results),
                        UpdateMode::Merge,
                        Some(&mut *ctx.sink),
                    )?
                }
                None => true,
            };
            if !updated {
                // cannot defeature; keep the failed-search state for the port
                return Ok(false);
            }
            debug!(
                rules = %outcome.rules_results_bits,
                repetition = outcome.flow.repetition_count,
                "repeating search with recovered units masked"
            );
            outcome.failed_search = false;
            outcome.failed_rules = false;
            return Ok(true);
        }
        Ok(false)
    }

    fn update_recovery_trackers(
        &self,
        outcome: &SearchOutcome,
        tracker: &DieRecoveryTracker,
        tracker_store: &mut TrackerStore,
        sink: &mut dyn DatalogSink,
        force_update: bool,
    ) -> EngineResult<bool> {
        let skip = outcome.failed_rules || outcome.failed_search;
        default_update_trackers(outcome, tracker, tracker_store, sink, force_update, skip)
    }

    fn mask_bits(&self, outcome: &SearchOutcome, use_rules_bits: bool) -> BitMask {
        default_mask_bits(outcome, use_rules_bits)
    }
}

/// Additionally retries a rules-failing passing search once, running only
/// the previously failing subset
pub struct RecoveryFailRetestMode;

impl RecoveryMode for RecoveryFailRetestMode {
    fn port(&self, outcome: &SearchOutcome) -> i32 {
        default_port(outcome)
    }

    fn has_to_repeat_search(
        &self,
        outcome: &mut SearchOutcome,
        ctx: &mut RecoveryContext<'_>,
    ) -> EngineResult<bool> {
        evaluate_search(outcome, ctx)?;

        let repetition = outcome
            .results
            .last()
            .map(|result| result.repetition_count)
            .unwrap_or_default();
        if repetition >= outcome.max_repetition_count {
            return Ok(false);
        }

        if !outcome.failed_search && outcome.failed_rules {
            debug!(
                rules = %outcome.rules_results_bits,
                "retesting failed rules on the failing subset"
            );
            outcome.failed_search = false;
            outcome.failed_rules = false;
            outcome.test_results_bits.pop();
            return Ok(true);
        }
        if outcome.failed_search && !outcome.failed_rules {
            debug!(rules = %outcome.rules_results_bits, "repeating failed search");
            outcome.failed_search = false;
            outcome.failed_rules = false;
            return Ok(true);
        }
        Ok(false)
    }

    fn update_recovery_trackers(
        &self,
        outcome: &SearchOutcome,
        tracker: &DieRecoveryTracker,
        tracker_store: &mut TrackerStore,
        sink: &mut dyn DatalogSink,
        force_update: bool,
    ) -> EngineResult<bool> {
        let skip = outcome.failed_rules || outcome.failed_search;
        default_update_trackers(outcome, tracker, tracker_store, sink, force_update, skip)
    }

    fn mask_bits(&self, outcome: &SearchOutcome, use_rules_bits: bool) -> BitMask {
        let base = if use_rules_bits {
            outcome.rules_results_bits.clone()
        } else {
            or_test_results(outcome)
        };
        // a retest pass inverts the mask to rerun only the failing subset
        let base = if outcome.flow.repetition_count > 1 {
            base.not()
        } else {
            base
        };
        base.or(&outcome.incoming_mask)
    }
}

/// Trackers are never written; any disablement the incoming mask does not
/// already cover fails the test
pub struct NoRecoveryMode;

impl RecoveryMode for NoRecoveryMode {
    fn port(&self, outcome: &SearchOutcome) -> i32 {
        if outcome.failed_search {
            return FAIL_PORT;
        }
        let mismatch = outcome
            .rules_results_bits
            .or(&outcome.incoming_mask)
            .xor(&outcome.incoming_mask)
            .any();
        if mismatch || outcome.failed_rules {
            debug!(
                incoming = %outcome.incoming_mask,
                rules = %outcome.rules_results_bits,
                "result requires disablement the incoming mask does not cover"
            );
            return FAIL_RULES_PORT;
        }
        PASS_PORT
    }

    fn has_to_repeat_search(
        &self,
        outcome: &mut SearchOutcome,
        ctx: &mut RecoveryContext<'_>,
    ) -> EngineResult<bool> {
        evaluate_search(outcome, ctx)?;
        Ok(false)
    }

    fn update_recovery_trackers(
        &self,
        outcome: &SearchOutcome,
        tracker: &DieRecoveryTracker,
        tracker_store: &mut TrackerStore,
        sink: &mut dyn DatalogSink,
        force_update: bool,
    ) -> EngineResult<bool> {
        default_update_trackers(outcome, tracker, tracker_store, sink, force_update, !force_update)
    }

    fn mask_bits(&self, outcome: &SearchOutcome, use_rules_bits: bool) -> BitMask {
        default_mask_bits(outcome, use_rules_bits)
    }
}
