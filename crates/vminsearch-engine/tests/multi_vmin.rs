//! Multi-domain searches: per-domain attribution, masking and recovery

mod common;

use common::*;
use vminsearch_engine::{
    ForwardingMode, SearchConfig, SearchContext, SearchError, SearchServices, VminSearch,
    FAIL_RULES_PORT, PASS_PORT, VOLTAGE_FAIL, VOLTAGE_MASK,
};
use vminsearch_forwarding::VminForwardingStore;
use vminsearch_recovery::{AnyFailDecoder, PinMap, PinMapDecoder, RuleStore, TrackerDef, TrackerStore};

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
    PinMap::new("cores", decoders)
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

#[test]
fn test_without_pin_map_failures_attribute_to_all_targets() {
    let applied = applied_voltages();
    let mut executor = ThresholdExecutor::new(&[0.6, 0.8, 0.6, 0.6], &applied);
    let mut voltage = RecordingVoltage::new(&applied);
    let mut bench = Bench::new();

    let config = SearchConfig::for_targets(&["V0", "V1", "V2", "V3"], 0.5, 1.0, 0.1);
    let port = bench.run(config, &mut executor, &mut voltage).unwrap();

    assert_eq!(port, PASS_PORT);
    assert_eq!(executor.executions, 4);
    // every active target stepped together with the shared failure
    assert_eq!(*applied.borrow().last().unwrap(), vec![0.8, 0.8, 0.8, 0.8]);
}

#[test]
fn test_pin_map_attributes_failures_per_domain() {
    let applied = applied_voltages();
    let mut executor =
        ThresholdExecutor::new(&[0.6, 0.8, 0.6, 0.6], &applied).with_pins(&["P0", "P1", "P2", "P3"]);
    let mut voltage = RecordingVoltage::new(&applied);
    let mut bench = Bench::new();
    bench.pin_map = Some(pin_map_for(&["P0", "P1", "P2", "P3"]));

    let config = SearchConfig::for_targets(&["V0", "V1", "V2", "V3"], 0.5, 1.0, 0.1);
    let port = bench.run(config, &mut executor, &mut voltage).unwrap();

    assert_eq!(port, PASS_PORT);
    assert_eq!(executor.executions, 4);
    // only the domain that still failed kept stepping
    assert_eq!(*applied.borrow().last().unwrap(), vec![0.6, 0.8, 0.6, 0.6]);
}

#[test]
fn test_initial_mask_bits_exclude_target_from_search() {
    let applied = applied_voltages();
    let mut executor =
        ThresholdExecutor::new(&[9.9, 0.6, 0.6, 0.6], &applied).with_pins(&["P0", "P1", "P2", "P3"]);
    let mut voltage = RecordingVoltage::new(&applied);
    let mut bench = Bench::new();
    bench.pin_map = Some(pin_map_for(&["P0", "P1", "P2", "P3"]));

    let mut config = SearchConfig::for_targets(&["V0", "V1", "V2", "V3"], 0.5, 1.0, 0.1);
    config.initial_mask_bits = "1000".to_string();
    let port = bench.run(config, &mut executor, &mut voltage).unwrap();

    assert_eq!(port, PASS_PORT);
    // the masked target is driven at the masked sentinel voltage
    let last = applied.borrow().last().unwrap().clone();
    assert!((last[0] - VOLTAGE_MASK).abs() < 1e-3);
    assert_eq!(&last[1..], &[0.6, 0.6, 0.6]);
    // masking the pins kept the bad unit out of pass/fail evaluation
    assert!(executor
        .mask_history
        .iter()
        .any(|pins| pins.contains(&"P0".to_string())));
}

#[test]
fn test_failing_unit_recovers_through_rules() {
    let applied = applied_voltages();
    let mut executor =
        ThresholdExecutor::new(&[9.9, 0.5, 0.5, 0.5], &applied).with_pins(&["P0", "P1", "P2", "P3"]);
    let mut voltage = RecordingVoltage::new(&applied);
    let mut bench = Bench::new().with_tracker("CORE", 4);
    bench.pin_map = Some(pin_map_for(&["P0", "P1", "P2", "P3"]));
    bench.forwarding = Some(forwarding_for(&["C0", "C1", "C2", "C3"]));

    let mut config = SearchConfig::for_targets(&["V0", "V1", "V2", "V3"], 0.5, 1.0, 0.1);
    config.recovery_options = "0000,1000,1100".to_string();
    config.recovery_tracking_outgoing = Some("CORE".to_string());
    config.forwarding_mode = ForwardingMode::Output;
    config.corner_identifiers = ["C0", "C1", "C2", "C3"].map(String::from).to_vec();
    config.flow_indexes = vec![1];
    let port = bench.run(config, &mut executor, &mut voltage).unwrap();

    // the bad unit exhausted its range, was masked out, and the accepted
    // rule committed its disablement to the tracker
    assert_eq!(port, PASS_PORT);
    assert_eq!(bench.tracker_store.data("CORE").unwrap(), "1000");
    let last = applied.borrow().last().unwrap().clone();
    assert!((last[0] - VOLTAGE_FAIL).abs() < 1e-3);
    // surviving domains forwarded their Vmin
    let store = bench.forwarding.as_ref().unwrap();
    assert_eq!(store.get("C1", 1).unwrap().voltage, Some(0.5));
    assert_eq!(store.get("C0", 1).unwrap().voltage, Some(VOLTAGE_FAIL));
}

#[test]
fn test_unaccepted_fail_pattern_fails_rules() {
    let applied = applied_voltages();
    let mut executor =
        ThresholdExecutor::new(&[9.9, 0.5, 0.5, 0.5], &applied).with_pins(&["P0", "P1", "P2", "P3"]);
    let mut voltage = RecordingVoltage::new(&applied);
    let mut bench = Bench::new().with_tracker("CORE", 4);
    bench.pin_map = Some(pin_map_for(&["P0", "P1", "P2", "P3"]));
    bench.forwarding = Some(forwarding_for(&["C0", "C1", "C2", "C3"]));

    let mut config = SearchConfig::for_targets(&["V0", "V1", "V2", "V3"], 0.5, 1.0, 0.1);
    config.recovery_options = "0000,0100".to_string();
    config.recovery_tracking_outgoing = Some("CORE".to_string());
    config.forwarding_mode = ForwardingMode::Output;
    config.corner_identifiers = ["C0", "C1", "C2", "C3"].map(String::from).to_vec();
    config.flow_indexes = vec![1];
    let port = bench.run(config, &mut executor, &mut voltage).unwrap();

    // no listed pattern covers the observed fail bits
    assert_eq!(port, FAIL_RULES_PORT);
    // the rejected configuration was not committed
    assert_eq!(bench.tracker_store.data("CORE").unwrap(), "0000");
}

#[test]
fn test_blocked_tracker_update_forces_fail_port() {
    let applied = applied_voltages();
    let mut executor =
        ThresholdExecutor::new(&[9.9, 0.5, 0.5, 0.5], &applied).with_pins(&["P0", "P1", "P2", "P3"]);
    let mut voltage = RecordingVoltage::new(&applied);
    let mut bench = Bench::new().with_tracker("CORE", 4);
    bench.tracker_store.set_changes_allowed(false);
    bench.pin_map = Some(pin_map_for(&["P0", "P1", "P2", "P3"]));
    bench.forwarding = Some(forwarding_for(&["C0", "C1", "C2", "C3"]));

    let mut config = SearchConfig::for_targets(&["V0", "V1", "V2", "V3"], 0.5, 1.0, 0.1);
    config.recovery_options = "0000,1000".to_string();
    config.recovery_tracking_outgoing = Some("CORE".to_string());
    config.forwarding_mode = ForwardingMode::Output;
    config.corner_identifiers = ["C0", "C1", "C2", "C3"].map(String::from).to_vec();
    config.flow_indexes = vec![1];
    let port = bench.run(config, &mut executor, &mut voltage).unwrap();

    // the accepted rule could not be committed; hard fail
    assert_eq!(port, 0);
    assert_eq!(bench.tracker_store.data("CORE").unwrap(), "0000");
}

#[test]
fn test_multi_pass_masks_merge_results() {
    let applied = applied_voltages();
    let mut executor = ThresholdExecutor::new(&[0.6, 0.7], &applied);
    let mut voltage = RecordingVoltage::new(&applied);
    let mut bench = Bench::new();

    let mut config = SearchConfig::for_targets(&["V0", "V1"], 0.5, 1.0, 0.1);
    config.multi_pass_masks = vec!["10".to_string(), "01".to_string()];
    let port = bench.run(config, &mut executor, &mut voltage).unwrap();

    assert_eq!(port, PASS_PORT);
    // pass 1 searched V1 only, pass 2 searched V0 only; merged record
    // carries both with summed execution counts
    assert_eq!(bench.sink.records[0].1, "0.600_0.700|0.500_0.500|1.000_1.000|5");
}

#[test]
fn test_no_recovery_mode_rejects_new_disablement() {
    let applied = applied_voltages();
    let mut executor =
        ThresholdExecutor::new(&[9.9, 9.9, 0.5], &applied).with_pins(&["P0", "P1", "P2"]);
    let mut voltage = RecordingVoltage::new(&applied);
    let mut bench = Bench::new();
    bench.pin_map = Some(pin_map_for(&["P0", "P1", "P2"]));

    let mut config = SearchConfig::for_targets(&["V0", "V1", "V2"], 0.5, 1.0, 0.1);
    config.recovery_mode = vminsearch_engine::RecoveryModeKind::NoRecovery;
    config.initial_mask_bits = "100".to_string();
    let port = bench.run(config, &mut executor, &mut voltage).unwrap();

    // V1 failed out beyond what the incoming mask already covered
    assert_eq!(port, FAIL_RULES_PORT);
}

#[test]
fn test_corner_count_mismatch_is_a_config_error() {
    let applied = applied_voltages();
    let mut executor = ThresholdExecutor::new(&[0.6, 0.6], &applied);
    let mut voltage = RecordingVoltage::new(&applied);
    let mut bench = Bench::new();
    bench.forwarding = Some(forwarding_for(&["C0"]));

    let mut config = SearchConfig::for_targets(&["V0", "V1"], 0.5, 1.0, 0.1);
    config.forwarding_mode = ForwardingMode::Input;
    config.corner_identifiers = vec!["C0".to_string()];
    config.recovery_tracking_incoming = Some("CORE".to_string());
    let result = bench.run(config, &mut executor, &mut voltage);

    assert!(matches!(result, Err(SearchError::Config(_))));
}

#[test]
fn test_exhausted_domain_reports_fail_sentinel_in_datalog() {
    let applied = applied_voltages();
    let mut executor =
        ThresholdExecutor::new(&[9.9, 0.5], &applied).with_pins(&["P0", "P1"]);
    let mut voltage = RecordingVoltage::new(&applied);
    let mut bench = Bench::new();
    bench.pin_map = Some(pin_map_for(&["P0", "P1"]));

    let mut config = SearchConfig::for_targets(&["V0", "V1"], 0.5, 1.0, 0.1);
    config.recovery_options = "00,10".to_string();
    let port = bench.run(config, &mut executor, &mut voltage).unwrap();

    // the exhausted domain logs the fail sentinel, the survivor its Vmin,
    // and the accepted rule keeps the overall verdict passing
    assert_eq!(port, PASS_PORT);
    assert_eq!(bench.sink.records[0].1, "-9999_0.500|0.500_0.500|1.000_1.000|7");
}
