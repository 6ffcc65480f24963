//! Pattern-execution and voltage-control contracts
//!
//! The search core never talks to tester hardware directly; it drives these
//! two capability traits. Production code binds them to the functional-test
//! and voltage services, tests bind them to scripted doubles.

use crate::BaseResult;

/// One captured per-cycle failure from a pattern-list execution.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FailureRecord {
    /// Failing pattern name
    pub pattern_name: String,
    /// Burst the pattern executed in
    pub burst_index: u32,
    /// Occurrence of the pattern within the burst
    pub pattern_instance_id: u32,
    /// Vector address of the first failing cycle
    pub vector_address: u64,
    /// Timing/level domain the failure was captured in
    pub domain: String,
    /// Pattern list the failing pattern belongs to
    pub parent_plist: String,
    /// Failing pin names; empty when the flow captured no pin data
    pub failing_pins: Vec<String>,
}

/// A created functional test over one pattern list.
///
/// Mirrors the capture-failure test handle of the tester runtime: execute,
/// query per-cycle failures, mask pins, and edit the execution plan. All
/// methods are synchronous; a non-responsive implementation blocks the
/// search (no timeout is defined in this domain).
pub trait PatternExecutor {
    /// Applies levels/timings before the first execution
    fn apply_test_conditions(&mut self) {}

    /// Runs the pattern list once; `true` = pass
    fn execute(&mut self) -> bool;

    /// Per-cycle failures of the last execution. An error means the capture
    /// data could not be read; callers degrade gracefully rather than abort.
    fn per_cycle_failures(&self) -> BaseResult<Vec<FailureRecord>>;

    /// Masks the named pins for subsequent executions
    fn set_pin_mask(&mut self, pins: &[String]);

    /// Resolves the pattern list for the given instance name and returns the
    /// plist that will actually execute
    fn resolve_plist(&mut self, instance_name: &str) -> String;

    /// Clears captured data and any start-pattern state
    fn reset(&mut self) {}

    /// Restarts subsequent executions from the first failing pattern
    fn enable_start_on_first_fail(&mut self) {}

    /// Always executes from the head of the pattern list
    fn disable_start_pattern(&mut self) {}

    /// Emits the tester-side failure datalog for the last execution
    fn log_failure(&mut self, _count: u32) {}

    /// Removes the given plist content tokens from the execution plan
    fn disable_plist_tokens(&mut self, _tokens: &[String]) {}

    /// Undoes every plist edit made through `disable_plist_tokens`
    fn restore_plist(&mut self) {}
}

/// Batched voltage application for the search targets.
///
/// One handle covers every target of a search; `apply` receives one value
/// per target in target order.
pub trait VoltageControl {
    /// Drives the per-target voltages for the next execution
    fn apply(&mut self, voltages: &[f64]) -> BaseResult<()>;

    /// Applies the pre-search initial condition, if any
    fn apply_initial(&mut self) -> BaseResult<()> {
        Ok(())
    }

    /// Returns the rails to their pre-search configuration
    fn restore(&mut self);

    /// Clears any cached state before a fresh search
    fn reset(&mut self) {}
}
