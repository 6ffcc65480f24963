//! Recovery-mode flows: recovery port, loop repetition, fail retest,
//! single-point modes and configuration verification

mod common;

use common::*;
use vminsearch_engine::{
    ForwardingMode, RecoveryModeKind, SearchConfig, SearchContext, SearchError, SearchServices,
    TestMode, VminSearch, FAIL_PORT, FAIL_RECOVERY_PORT, FAIL_RULES_PORT, PASS_PORT,
};
use vminsearch_forwarding::VminForwardingStore;
use vminsearch_recovery::{
    AnyFailDecoder, PinMap, PinMapDecoder, RuleStore, TrackerDef, TrackerStore,
};

fn pin_map_for(pins: &[&str]) -> PinMap {
    let decoders: Vec<Box<dyn PinMapDecoder>> = pins
        .iter()
        .map(|pin| {
            Box::new(AnyFailDecoder {
                name: format!("{pin}_unit"),
                pins: vec![pin.to_string()],
            }) as Box<dyn PinMapDecoder>
        })
        .collect();
    PinMap::new("units", decoders)
}

struct Bench {
    tracker_store: TrackerStore,
    rules: RuleStore,
    forwarding: Option<VminForwardingStore>,
    pin_map: Option<PinMap>,
    sink: RecordingSink,
    kv: MemoryStore,
    plist: PlistMeta,
}

impl Bench {
    fn new() -> Self {
        Self {
            tracker_store: TrackerStore::new(),
            rules: RuleStore::new(),
            forwarding: None,
            pin_map: None,
            sink: RecordingSink::default(),
            kv: MemoryStore::default(),
            plist: PlistMeta::default(),
        }
    }

    fn with_tracker(mut self, name: &str, size: usize) -> Self {
        self.tracker_store.define(TrackerDef {
            name: name.to_string(),
            size,
            initial_value: None,
            link_on_disable: Vec::new(),
        });
        self.tracker_store.reset(name).unwrap();
        self
    }

    fn run(
        &mut self,
        config: SearchConfig,
        executor: &mut ThresholdExecutor,
        voltage: &mut RecordingVoltage,
    ) -> Result<i32, SearchError> {
        let services = SearchServices {
            executor,
            voltage,
            datalog: &mut self.sink,
            kv: &mut self.kv,
            plist: &self.plist,
            pat_config: None,
        };
        let ctx = SearchContext {
            tracker_store: &mut self.tracker_store,
            rules: &self.rules,
            forwarding: self.forwarding.as_mut(),
            pin_map: self.pin_map.as_ref(),
        };
        let mut search = VminSearch::new(config, services, ctx)?;
        search.execute()
    }
}

fn forwarding_for(corners: &[&str]) -> VminForwardingStore {
    let mut store = VminForwardingStore::new();
    for corner in corners {
        store.set_frequency(corner, 1, 2.0e9);
    }
    store
}

/// Base configuration for a single-rail search over two recoverable units
fn single_rail_config() -> SearchConfig {
    let mut config = SearchConfig::for_targets(&["VDD"], 0.5, 1.0, 0.1);
    config.corner_identifiers = vec!["C0".to_string()];
    config.flow_indexes = vec![1];
    config.forwarding_mode = ForwardingMode::Output;
    config.recovery_tracking_outgoing = Some("CORE".to_string());
    config
}

#[test]
fn test_recovery_port_mode_routes_accepted_fail_to_recovery_port() {
    let applied = applied_voltages();
    let mut executor = ThresholdExecutor::new(&[0.0, 0.0], &applied);
    executor.pin_thresholds = vec![("P0".to_string(), 2.0), ("P1".to_string(), 2.0)];
    let mut voltage = RecordingVoltage::new(&applied);
    let mut bench = Bench::new().with_tracker("CORE", 2);
    bench.pin_map = Some(pin_map_for(&["P0", "P1"]));
    bench.forwarding = Some(forwarding_for(&["C0"]));

    let mut config = single_rail_config();
    config.recovery_mode = RecoveryModeKind::RecoveryPort;
    config.recovery_options = "00,11".to_string();
    let port = bench.run(config, &mut executor, &mut voltage).unwrap();

    // search failed, rules accepted full disablement: recovery port, and
    // the mode commits the tracker even though the search failed
    assert_eq!(port, FAIL_RECOVERY_PORT);
    assert_eq!(bench.tracker_store.data("CORE").unwrap(), "11");
    // forwarding is skipped on the recovery port
    assert_eq!(bench.forwarding.as_ref().unwrap().get("C0", 1).unwrap().voltage, None);
}

#[test]
fn test_recovery_loop_masks_bad_unit_and_repeats() {
    let applied = applied_voltages();
    let mut executor = ThresholdExecutor::new(&[0.0], &applied);
    executor.pin_thresholds = vec![("P0".to_string(), 2.0), ("P1".to_string(), 0.5)];
    let mut voltage = RecordingVoltage::new(&applied);
    let mut bench = Bench::new().with_tracker("CORE", 2);
    bench.pin_map = Some(pin_map_for(&["P0", "P1"]));
    bench.forwarding = Some(forwarding_for(&["C0"]));

    let mut config = single_rail_config();
    config.recovery_mode = RecoveryModeKind::RecoveryLoop;
    config.max_repetition_count = 2;
    config.recovery_options = "00,10,01".to_string();
    let port = bench.run(config, &mut executor, &mut voltage).unwrap();

    // first search exhausts the range; the bad unit is masked and the
    // repeat passes at the start voltage
    assert_eq!(port, PASS_PORT);
    assert_eq!(bench.tracker_store.data("CORE").unwrap(), "10");
    assert_eq!(executor.executions, 7);
    assert_eq!(bench.forwarding.as_ref().unwrap().get("C0", 1).unwrap().voltage, Some(0.5));
    // the repeat ran with the bad unit's pin masked
    assert!(executor
        .mask_history
        .iter()
        .any(|pins| pins == &["P0".to_string()]));
}

#[test]
fn test_recovery_loop_blocked_tracker_exits_recovery_port() {
    let applied = applied_voltages();
    let mut executor = ThresholdExecutor::new(&[0.0], &applied);
    executor.pin_thresholds = vec![("P0".to_string(), 2.0), ("P1".to_string(), 0.5)];
    let mut voltage = RecordingVoltage::new(&applied);
    let mut bench = Bench::new().with_tracker("CORE", 2);
    bench.tracker_store.set_changes_allowed(false);
    bench.pin_map = Some(pin_map_for(&["P0", "P1"]));
    bench.forwarding = Some(forwarding_for(&["C0"]));

    let mut config = single_rail_config();
    config.recovery_mode = RecoveryModeKind::RecoveryLoop;
    config.max_repetition_count = 2;
    config.recovery_options = "00,10,01".to_string();
    let port = bench.run(config, &mut executor, &mut voltage).unwrap();

    // the disablement could not be committed, so no repeat happened and
    // the failed search with passing rules routes to the recovery port
    assert_eq!(port, FAIL_RECOVERY_PORT);
    assert_eq!(bench.tracker_store.data("CORE").unwrap(), "00");
    assert_eq!(executor.executions, 6);
}

#[test]
fn test_recovery_loop_rejected_rules_fail_without_repeat() {
    let applied = applied_voltages();
    let mut executor = ThresholdExecutor::new(&[0.0], &applied);
    executor.pin_thresholds = vec![("P0".to_string(), 2.0), ("P1".to_string(), 2.0)];
    let mut voltage = RecordingVoltage::new(&applied);
    let mut bench = Bench::new().with_tracker("CORE", 2);
    bench.pin_map = Some(pin_map_for(&["P0", "P1"]));
    bench.forwarding = Some(forwarding_for(&["C0"]));

    let mut config = single_rail_config();
    config.recovery_mode = RecoveryModeKind::RecoveryLoop;
    config.max_repetition_count = 2;
    config.recovery_options = "00,10,01".to_string();
    let port = bench.run(config, &mut executor, &mut voltage).unwrap();

    // both units failing is not an acceptable configuration
    assert_eq!(port, FAIL_PORT);
    assert_eq!(bench.tracker_store.data("CORE").unwrap(), "00");
}

#[test]
fn test_fail_retest_reruns_failing_subset() {
    let applied = applied_voltages();
    let mut executor = ThresholdExecutor::new(&[0.0], &applied);
    executor.pin_thresholds = vec![("P0".to_string(), 0.5), ("P1".to_string(), 0.5)];
    let mut voltage = RecordingVoltage::new(&applied);
    let mut bench = Bench::new().with_tracker("CORE", 2);
    // a unit already disabled by an earlier flow
    bench.tracker_store.store_data("CORE", "10");
    bench.pin_map = Some(pin_map_for(&["P0", "P1"]));
    bench.forwarding = Some(forwarding_for(&["C0"]));

    let mut config = single_rail_config();
    config.recovery_mode = RecoveryModeKind::RecoveryFailRetest;
    config.max_repetition_count = 2;
    config.recovery_options = "00".to_string();
    let port = bench.run(config, &mut executor, &mut voltage).unwrap();

    // the prior disablement is not covered by the rules: the mode retests
    // the failing subset once, then reports the rules failure
    assert_eq!(port, FAIL_RULES_PORT);
    assert!(executor
        .mask_history
        .iter()
        .any(|pins| pins == &["P1".to_string()]));
}

#[test]
fn test_functional_mode_executes_single_point() {
    let applied = applied_voltages();
    let mut executor = ThresholdExecutor::new(&[0.0], &applied);
    let mut voltage = RecordingVoltage::new(&applied);
    let mut bench = Bench::new();

    let mut config = SearchConfig::for_targets(&["VDD"], 0.5, 1.0, 0.1);
    config.test_mode = TestMode::Functional;
    let port = bench.run(config, &mut executor, &mut voltage).unwrap();

    assert_eq!(port, PASS_PORT);
    assert_eq!(executor.executions, 1);
    // no search voltage is applied without forwarding input
    assert!(applied.borrow().is_empty());
    // single-point mode without corners emits no search datalog
    assert!(bench.sink.records.is_empty());
}

#[test]
fn test_functional_mode_failure_fails_after_one_execution() {
    let applied = applied_voltages();
    let mut executor = ThresholdExecutor::new(&[0.0], &applied);
    executor.force_fail = true;
    let mut voltage = RecordingVoltage::new(&applied);
    let mut bench = Bench::new();

    let mut config = SearchConfig::for_targets(&["VDD"], 0.5, 1.0, 0.1);
    config.test_mode = TestMode::Functional;
    let port = bench.run(config, &mut executor, &mut voltage).unwrap();

    assert_eq!(port, FAIL_PORT);
    assert_eq!(executor.executions, 1);
}

#[test]
fn test_per_pattern_vmin_table_is_logged() {
    let applied = applied_voltages();
    let mut executor = ThresholdExecutor::new(&[0.6], &applied);
    executor.fail_pattern = "pat_b".to_string();
    let mut voltage = RecordingVoltage::new(&applied);
    let mut bench = Bench::new();
    bench.plist.ambles = vec!["amble_x".to_string()];
    bench.plist.index = ["amble_x", "pat_a", "pat_b"]
        .iter()
        .map(|name| vminsearch_base::PatternOccurrence {
            burst_index: 0,
            pattern_name: name.to_string(),
            occurrence: 0,
        })
        .collect();

    let mut config = SearchConfig::for_targets(&["VDD"], 0.5, 1.0, 0.1);
    config.instance_name = "inst".to_string();
    config.pattern_name_map = "0,1,2,3,4".to_string();
    config.feature_switches = vec!["per_pattern_printing".to_string()];
    let port = bench.run(config, &mut executor, &mut voltage).unwrap();

    assert_eq!(port, PASS_PORT);
    let record = bench
        .sink
        .records
        .iter()
        .find(|(postfix, _)| postfix == "_pp")
        .unwrap();
    // ambles are skipped; patterns before the first fail keep the lower
    // voltage, the limiting pattern gets the passing voltage
    assert_eq!(record.1, "pat_a:0.5|pat_b:0.6");
    assert!(bench.kv.values.contains_key("inst_pp"));
}

// ----------------------------------------------------------------------
// configuration verification
// ----------------------------------------------------------------------

fn expect_config_error(config: SearchConfig, bench: &mut Bench) {
    let applied = applied_voltages();
    let mut executor = ThresholdExecutor::new(&[0.6], &applied);
    let mut voltage = RecordingVoltage::new(&applied);
    let result = bench.run(config, &mut executor, &mut voltage);
    assert!(matches!(result, Err(SearchError::Config(_))));
}

#[test]
fn test_single_vmin_rejects_multiple_targets() {
    let mut config = SearchConfig::for_targets(&["V0", "V1"], 0.5, 1.0, 0.1);
    config.test_mode = TestMode::SingleVmin;
    expect_config_error(config, &mut Bench::new());
}

#[test]
fn test_multi_vmin_rejects_single_target() {
    let mut config = SearchConfig::for_targets(&["V0"], 0.5, 1.0, 0.1);
    config.test_mode = TestMode::MultiVmin;
    expect_config_error(config, &mut Bench::new());
}

#[test]
fn test_step_size_must_be_positive() {
    let config = SearchConfig::for_targets(&["V0"], 0.5, 1.0, 0.0);
    expect_config_error(config, &mut Bench::new());
}

#[test]
fn test_repetition_count_requires_loop_mode() {
    let mut config = SearchConfig::for_targets(&["V0"], 0.5, 1.0, 0.1);
    config.max_repetition_count = 3;
    expect_config_error(config, &mut Bench::new());
}

#[test]
fn test_recovery_loop_requires_pin_map() {
    let mut config = SearchConfig::for_targets(&["V0"], 0.5, 1.0, 0.1);
    config.recovery_mode = RecoveryModeKind::RecoveryLoop;
    config.max_repetition_count = 2;
    expect_config_error(config, &mut Bench::new());
}

#[test]
fn test_rule_group_options_require_outgoing_tracking() {
    let mut config = SearchConfig::for_targets(&["V0"], 0.5, 1.0, 0.1);
    config.recovery_options = "SliceRules,2".to_string();
    expect_config_error(config, &mut Bench::new());
}

#[test]
fn test_per_pattern_printing_requires_name_map() {
    let mut config = SearchConfig::for_targets(&["V0"], 0.5, 1.0, 0.1);
    config.feature_switches = vec!["per_pattern_printing".to_string()];
    expect_config_error(config, &mut Bench::new());
}
