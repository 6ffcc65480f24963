//! Search engine driver
//!
//! Ties the per-step state machine to the injected collaborators: applies
//! voltages, executes the pattern list, decodes and attributes failures,
//! runs the multi-pass/repetition flow, and resolves the exit port from
//! search outcome plus recovery-rule evaluation.
//!
//! Ordering guarantees: voltage application strictly precedes pattern
//! execution for the same step; mask/plist edits strictly precede the
//! execution they affect; all masking is undone after the final result of
//! the search is captured, on every exit path.

use crate::config::{
    FeatureSwitches, ForwardingMode, RecoveryModeKind, SearchConfig, TestMode,
};
use crate::datalog;
use crate::outcome::{FlowState, SearchOutcome};
use crate::point::SearchPoint;
use crate::recovery::{
    recovery_mode_for, RecoveryContext, RecoveryMode, FAIL_AMBLE_PORT, FAIL_PORT,
    FAIL_RECOVERY_PORT, PASS_PORT,
};
use crate::target::{
    voltages_equal, PatternData, SearchIdentifiers, SearchResultData, VoltageTarget, VOLTAGE_FAIL,
    VOLTAGE_MASK,
};
use crate::{EngineResult, SearchError};
use indexmap::IndexMap;
use tracing::{debug, warn};
use vminsearch_base::{
    BitMask, DatalogSink, FailureRecord, KeyValueStore, PatConfigService, PatternExecutor,
    PatternOccurrence, PlistInfo, StorageScope, StoreValue, VoltageControl,
};
use vminsearch_forwarding::{CornerKey, VminForwardingStore};
use vminsearch_recovery::{DieRecoveryTracker, PinMap, RuleStore, TrackerStore};

/// Tester collaborators the engine drives
pub struct SearchServices<'a> {
    pub executor: &'a mut dyn PatternExecutor,
    pub voltage: &'a mut dyn VoltageControl,
    pub datalog: &'a mut dyn DatalogSink,
    pub kv: &'a mut dyn KeyValueStore,
    pub plist: &'a dyn PlistInfo,
    pub pat_config: Option<&'a mut dyn PatConfigService>,
}

/// Shared registries and the optional pin map
pub struct SearchContext<'a> {
    pub tracker_store: &'a mut TrackerStore,
    pub rules: &'a RuleStore,
    pub forwarding: Option<&'a mut VminForwardingStore>,
    pub pin_map: Option<&'a PinMap>,
}

/// One configured Vmin search over a set of voltage targets
pub struct VminSearch<'a> {
    config: SearchConfig,
    switches: FeatureSwitches,
    services: SearchServices<'a>,
    ctx: SearchContext<'a>,
    corners: Vec<(String, u32)>,
    tracker_outgoing: Option<DieRecoveryTracker>,
    tracker_incoming: Option<DieRecoveryTracker>,
    recovery: Box<dyn RecoveryMode>,
    multi_pass_masks: Vec<BitMask>,
    point: SearchPoint,
    outcome: SearchOutcome,
    /// Incoming-width mask applied to every execution of the current search
    initial_search_mask: BitMask,
    start_voltages: Vec<f64>,
    skip_apply_search_voltage: bool,
    single_point_mode: bool,
    failed_tracker_update: bool,
    port: i32,
    per_pattern_voltages: IndexMap<PatternOccurrence, Vec<f64>>,
}

impl<'a> VminSearch<'a> {
    /// Validates the configuration against the provided collaborators and
    /// builds the engine. All configuration errors surface here, before
    /// any pattern execution.
    pub fn new(
        config: SearchConfig,
        services: SearchServices<'a>,
        ctx: SearchContext<'a>,
    ) -> EngineResult<Self> {
        let switches = config.switches();
        Self::verify_targets(&config)?;
        Self::verify_modes(&config, &switches, ctx.pin_map.is_some())?;

        let corners = Self::verify_forwarding(&config, &ctx)?;
        let expected_mask_width = ctx
            .pin_map
            .map(|p| p.full_size())
            .unwrap_or(config.targets.len());
        let multi_pass_masks =
            Self::verify_multi_pass_masks(&config, expected_mask_width)?;
        let (tracker_outgoing, tracker_incoming) = Self::verify_trackers(&config, &ctx)?;

        let mut services = services;
        if let Some(pin_map) = ctx.pin_map {
            pin_map.verify(&mut *services.executor)?;
        }
        if switches.start_on_first_fail {
            services.executor.enable_start_on_first_fail();
        } else {
            services.executor.disable_start_pattern();
        }

        let targets: Vec<VoltageTarget> = config
            .targets
            .iter()
            .enumerate()
            .map(|(index, name)| {
                let mut target = VoltageTarget::new(name, config.step_size);
                if corners.len() == config.targets.len() {
                    target.corner =
                        Some(CornerKey::new(&corners[index].0, corners[index].1));
                }
                target
            })
            .collect();
        let point = SearchPoint::new(
            targets,
            switches.high_to_low_search,
            switches.recovery_mask_enabled,
        );

        let single_modes = matches!(
            config.test_mode,
            TestMode::Functional | TestMode::Scoreboard
        );
        let single_point_mode = single_modes
            || (config.forwarding_mode != ForwardingMode::None
                && ctx
                    .forwarding
                    .as_deref()
                    .map(VminForwardingStore::is_single_point_mode)
                    .unwrap_or(false));
        let skip_apply_search_voltage = single_modes
            && (corners.is_empty()
                || matches!(
                    config.forwarding_mode,
                    ForwardingMode::None | ForwardingMode::Output
                ));

        let recovery = recovery_mode_for(config.recovery_mode);
        let outcome = SearchOutcome::new(
            BitMask::zeros(expected_mask_width),
            config.max_repetition_count,
        );
        Ok(Self {
            initial_search_mask: BitMask::zeros(expected_mask_width),
            config,
            switches,
            services,
            ctx,
            corners,
            tracker_outgoing,
            tracker_incoming,
            recovery,
            multi_pass_masks,
            point,
            outcome,
            start_voltages: Vec::new(),
            skip_apply_search_voltage,
            single_point_mode,
            failed_tracker_update: false,
            port: FAIL_PORT,
            per_pattern_voltages: IndexMap::new(),
        })
    }

    /// Runs the configured search and returns the exit port.
    ///
    /// Pin-map masking and plist edits are unwound before this returns,
    /// pass, fail or error.
    pub fn execute(&mut self) -> EngineResult<i32> {
        self.port = FAIL_PORT;
        if let Some(port) = self.bypass_port()? {
            self.port = port;
            return Ok(port);
        }

        let resolved = self
            .services
            .executor
            .resolve_plist(&self.config.instance_name);
        debug!(plist = %resolved, "resolved pattern list");

        self.services.executor.apply_test_conditions();
        self.services.voltage.reset();
        self.services.voltage.apply_initial().map_err(SearchError::Base)?;

        let run = self.run_searches();
        self.restore_after_search();
        run?;

        self.post_process_results()?;
        Ok(self.port)
    }

    /// Final per-search results, in execution order
    pub fn results(&self) -> &[SearchResultData] {
        &self.outcome.results
    }

    /// Accumulated outcome of the last execution
    pub fn outcome(&self) -> &SearchOutcome {
        &self.outcome
    }

    // ------------------------------------------------------------------
    // verification
    // ------------------------------------------------------------------

    fn verify_targets(config: &SearchConfig) -> EngineResult<()> {
        if config.targets.is_empty() {
            return Err(SearchError::Config("voltage targets must not be empty".into()));
        }
        if config.step_size <= 0.0 {
            return Err(SearchError::Config("step size must be higher than 0".into()));
        }
        let keys = config.vmin_result_keys.len();
        if keys > 1 && keys != config.targets.len() {
            return Err(SearchError::Config(
                "number of vmin result keys must be 1 or match the number of targets".into(),
            ));
        }
        Ok(())
    }

    fn verify_modes(
        config: &SearchConfig,
        switches: &FeatureSwitches,
        has_pin_map: bool,
    ) -> EngineResult<()> {
        match config.test_mode {
            TestMode::SingleVmin => {
                if config.targets.len() != 1 {
                    return Err(SearchError::Config(
                        "single-vmin mode supports a single voltage target".into(),
                    ));
                }
                if !config.multi_pass_masks.is_empty() {
                    return Err(SearchError::Config(
                        "single-vmin mode does not support multi-pass masks".into(),
                    ));
                }
            }
            TestMode::MultiVmin => {
                if config.targets.len() < 2 {
                    return Err(SearchError::Config(
                        "multi-vmin mode only supports multiple voltage targets".into(),
                    ));
                }
                if !config.corner_identifiers.is_empty()
                    && config.corner_identifiers.len() != config.targets.len()
                {
                    return Err(SearchError::Config(
                        "number of voltage targets must match number of corner identifiers".into(),
                    ));
                }
                let output = matches!(
                    config.forwarding_mode,
                    ForwardingMode::Output | ForwardingMode::InputOutput
                );
                if output && config.recovery_tracking_outgoing.is_none() {
                    return Err(SearchError::Config(
                        "output forwarding in multi-vmin mode requires an outgoing recovery tracking".into(),
                    ));
                }
                let input = matches!(
                    config.forwarding_mode,
                    ForwardingMode::Input | ForwardingMode::InputOutput
                );
                if input && config.recovery_tracking_incoming.is_none() {
                    return Err(SearchError::Config(
                        "input forwarding in multi-vmin mode requires an incoming recovery tracking".into(),
                    ));
                }
            }
            TestMode::Functional | TestMode::Scoreboard => {}
        }

        if config.max_repetition_count > 1
            && !matches!(
                config.recovery_mode,
                RecoveryModeKind::RecoveryLoop | RecoveryModeKind::RecoveryFailRetest
            )
        {
            return Err(SearchError::Config(
                "max repetition count above 1 requires the recovery-loop or fail-retest mode".into(),
            ));
        }
        let needs_pin_map = matches!(
            config.recovery_mode,
            RecoveryModeKind::RecoveryPort
                | RecoveryModeKind::RecoveryLoop
                | RecoveryModeKind::RecoveryFailRetest
        );
        if needs_pin_map && !has_pin_map {
            return Err(SearchError::Config(format!(
                "recovery mode {:?} requires a pin map",
                config.recovery_mode
            )));
        }
        if config.recovery_mode == RecoveryModeKind::RecoveryFailRetest
            && switches.force_recovery_loop
        {
            return Err(SearchError::Config(
                "fail-retest mode does not support force_recovery_loop".into(),
            ));
        }
        if !config.initial_mask_bits.is_empty() && !has_pin_map {
            return Err(SearchError::Config(
                "use of initial mask bits requires a pin map".into(),
            ));
        }
        if !config.recovery_options.is_empty()
            && !config.recovery_options_are_literal()
            && config.recovery_tracking_outgoing.is_none()
        {
            return Err(SearchError::Config(
                "rule-group recovery options require an outgoing recovery tracking".into(),
            ));
        }
        if switches.per_pattern_printing && config.pattern_name_map.is_empty() {
            return Err(SearchError::Config(
                "per-pattern printing requires a pattern name map".into(),
            ));
        }
        Ok(())
    }

    fn verify_forwarding(
        config: &SearchConfig,
        ctx: &SearchContext<'_>,
    ) -> EngineResult<Vec<(String, u32)>> {
        if config.forwarding_mode == ForwardingMode::None
            || config.corner_identifiers.is_empty()
        {
            return Ok(Vec::new());
        }
        if ctx.forwarding.is_none() {
            return Err(SearchError::Config(
                "forwarding mode requires a forwarding store".into(),
            ));
        }
        let corners = &config.corner_identifiers;
        let flows: Vec<u32> = match config.flow_indexes.len() {
            0 => vec![1; corners.len()],
            1 => vec![config.flow_indexes[0]; corners.len()],
            len if len == corners.len() => config.flow_indexes.clone(),
            _ => {
                return Err(SearchError::Config(
                    "forwarding requires a single flow index or one per corner identifier".into(),
                ))
            }
        };
        Ok(corners
            .iter()
            .cloned()
            .zip(flows)
            .collect())
    }

    fn verify_multi_pass_masks(
        config: &SearchConfig,
        expected_width: usize,
    ) -> EngineResult<Vec<BitMask>> {
        if config.multi_pass_masks.is_empty() {
            return Ok(vec![BitMask::zeros(expected_width)]);
        }
        let mut masks = Vec::with_capacity(config.multi_pass_masks.len());
        for text in &config.multi_pass_masks {
            let mask = match BitMask::parse(text) {
                Ok(mask) => mask,
                Err(_) => {
                    debug!(
                        mask = %text,
                        "multi-pass mask contains invalid values, using initial mask bits only"
                    );
                    BitMask::zeros(expected_width)
                }
            };
            if mask.len() != expected_width {
                return Err(SearchError::Config(format!(
                    "multi-pass mask [{text}] does not match mask width {expected_width}"
                )));
            }
            masks.push(mask);
        }
        Ok(masks)
    }

    fn verify_trackers(
        config: &SearchConfig,
        ctx: &SearchContext<'_>,
    ) -> EngineResult<(Option<DieRecoveryTracker>, Option<DieRecoveryTracker>)> {
        let mut resolve = |names: &Option<String>| -> EngineResult<Option<DieRecoveryTracker>> {
            let Some(names) = names else { return Ok(None) };
            if ctx.pin_map.is_none() {
                return Err(SearchError::Config(
                    "recovery tracking requires a pin map".into(),
                ));
            }
            Ok(Some(DieRecoveryTracker::new(names, ctx.tracker_store)?))
        };
        let outgoing = resolve(&config.recovery_tracking_outgoing)?;
        let incoming = resolve(&config.recovery_tracking_incoming)?;
        Ok((outgoing, incoming))
    }

    // ------------------------------------------------------------------
    // incoming mask / bypass
    // ------------------------------------------------------------------

    fn bypass_port(&mut self) -> EngineResult<Option<i32>> {
        let input_forwarding = matches!(
            self.config.forwarding_mode,
            ForwardingMode::Input | ForwardingMode::InputOutput
        );

        let mut mask = if !self.config.initial_mask_bits.is_empty() {
            let mut mask =
                BitMask::parse(&self.config.initial_mask_bits).map_err(SearchError::Base)?;
            if input_forwarding {
                if let Some(tracker) = &self.tracker_incoming {
                    mask.merge(&tracker.mask_bits(self.ctx.tracker_store)?);
                }
            }
            mask
        } else if input_forwarding && self.tracker_incoming.is_some() {
            let tracker = self.tracker_incoming.as_ref().unwrap();
            tracker.mask_bits(self.ctx.tracker_store)?
        } else if let Some(pin_map) = self.ctx.pin_map {
            BitMask::zeros(pin_map.full_size())
        } else {
            BitMask::zeros(self.point.targets_count())
        };

        if mask.count_zeros() > 0 {
            self.start_voltages = self.calculate_start_voltages()?;
            if self.config.test_mode == TestMode::MultiVmin && self.tracker_incoming.is_none() {
                let from_voltages = self.mask_from_voltages(&self.start_voltages, mask.len())?;
                mask.merge(&from_voltages);
            } else if self.start_voltages.iter().all(|v| *v < 0.0)
                && !self.skip_apply_search_voltage
            {
                mask.set_all(true);
            }
        }

        debug!(mask = %mask, "incoming mask bits");
        self.outcome = SearchOutcome::new(mask.clone(), self.config.max_repetition_count);
        if mask.all() {
            // every unit is already disabled; nothing to search
            if let Some(tracker) = &self.tracker_outgoing {
                tracker.log_tracking_structure(
                    self.ctx.tracker_store,
                    &mut *self.services.datalog,
                    &mask,
                    &BitMask::zeros(mask.len()),
                )?;
            }
            self.update_vmin_result(None);
            return Ok(Some(PASS_PORT));
        }
        Ok(None)
    }

    fn calculate_start_voltages(&self) -> EngineResult<Vec<f64>> {
        let mut values = self.resolve_voltage_list(&self.config.start_voltages)?;
        if !self.corners.is_empty()
            && matches!(
                self.config.forwarding_mode,
                ForwardingMode::Input | ForwardingMode::InputOutput
            )
        {
            if let Some(store) = self.ctx.forwarding.as_deref() {
                for (value, (corner, flow)) in values.iter_mut().zip(&self.corners) {
                    *value = store.starting_voltage(corner, *flow, *value);
                }
            }
        }
        Ok(self.fit_to_targets(values))
    }

    fn mask_from_voltages(&self, voltages: &[f64], width: usize) -> EngineResult<BitMask> {
        let mut bits = BitMask::zeros(voltages.len());
        for (index, voltage) in voltages.iter().enumerate() {
            if *voltage < 0.0 {
                bits.set(index, true);
            }
        }
        if bits.len() != width {
            if let Some(pin_map) = self.ctx.pin_map {
                bits = pin_map.voltage_domains_to_fail_tracker(&bits)?;
            }
        }
        Ok(bits)
    }

    // ------------------------------------------------------------------
    // search flow
    // ------------------------------------------------------------------

    fn run_searches(&mut self) -> EngineResult<()> {
        self.outcome.flow = FlowState::init();
        for pass_index in 0..self.multi_pass_masks.len() {
            self.outcome.flow.start_search();
            loop {
                self.outcome.flow.repetition_count += 1;
                let identifiers = SearchIdentifiers {
                    tname_postfix: self.execution_identifier(),
                    multi_pass_count: self.outcome.flow.multi_pass_count,
                    repetition_count: self.outcome.flow.repetition_count,
                };
                self.apply_pre_search_setup(pass_index)?;

                if !self.reset_point()? {
                    self.push_result(false, identifiers);
                    if !self.has_to_continue() {
                        self.outcome.flow.has_to_abort = true;
                    }
                } else {
                    let pass = self.execute_single_search()?;
                    self.outcome.flow.is_any_search_passing |= pass;
                    self.push_result(pass, identifiers);
                    self.outcome.flow.has_to_repeat = self.has_to_repeat_search()?;
                    self.outcome.flow.has_to_abort = !self.has_to_continue();
                }

                let repeat = self.outcome.flow.has_to_repeat
                    && self.outcome.flow.repetition_count < self.config.max_repetition_count
                    && !self.outcome.flow.has_to_abort;
                if !repeat {
                    break;
                }
            }
            if self.outcome.flow.has_to_abort {
                break;
            }
        }
        Ok(())
    }

    fn execute_single_search(&mut self) -> EngineResult<bool> {
        loop {
            self.apply_search_voltage()?;
            self.apply_mask()?;
            self.point.execution_count += 1;
            debug!(
                iteration = self.point.execution_count,
                mask = %self.point.mask_bits(),
                "search point execution"
            );

            let plist_pass = self.services.executor.execute();
            let failures = if plist_pass {
                Vec::new()
            } else {
                match self.services.executor.per_cycle_failures() {
                    Ok(failures) => failures,
                    Err(error) => {
                        warn!(%error, "capture data unavailable, continuing without pin data");
                        Vec::new()
                    }
                }
            };
            self.point
                .record_point(first_fail_pattern(&failures, self.switches.start_on_first_fail));
            self.update_per_pattern_table(plist_pass, &failures)?;

            let result_bits = self.decode_results(plist_pass, &failures)?;
            let pass = self.point.process_results(plist_pass, result_bits);

            if pass {
                if self.point.execution_count == 1
                    && !self.config.start_voltages_for_retry.is_empty()
                {
                    debug!("search passed at first try, lowering start voltages to redo");
                    if !self.reset_point()? {
                        return Ok(false);
                    }
                    continue;
                }
                debug!(voltages = ?self.point.voltages(), "search completed with pass");
                return Ok(true);
            }

            self.point.advance();
            if self.single_point_mode || self.point.recovery_not_possible() {
                self.point.disable_all_targets();
                self.services.executor.log_failure(1);
                debug!(voltages = ?self.point.voltages(), "search completed with fail");
                return Ok(false);
            }
        }
    }

    fn reset_point(&mut self) -> EngineResult<bool> {
        self.services.executor.reset();
        let overshoot = self.point.execution_count == 1
            && !self.config.start_voltages_for_retry.is_empty();
        let start = if overshoot {
            self.fit_to_targets(self.resolve_voltage_list(&self.config.start_voltages_for_retry)?)
        } else {
            self.point.execution_count = 0;
            self.start_voltages.clone()
        };
        let end = self.fit_to_targets(self.resolve_voltage_list(&self.config.end_voltage_limits)?);
        let initial_mask = self.initial_mask_for_point();
        Ok(self.point.reset(&start, &end, initial_mask))
    }

    fn apply_pre_search_setup(&mut self, pass_index: usize) -> EngineResult<()> {
        self.outcome.decoded_result = None;
        self.set_initial_mask(pass_index);
        if self.switches.disable_masked_targets && self.initial_search_mask.any() {
            if let (Some(pin_map), Some(pat_config)) =
                (self.ctx.pin_map, self.services.pat_config.as_deref_mut())
            {
                pin_map.apply_pat_config(
                    &self.initial_search_mask,
                    &self.config.patlist,
                    pat_config,
                )?;
            }
        }
        if self.switches.per_pattern_printing {
            self.per_pattern_voltages.clear();
        }
        Ok(())
    }

    fn set_initial_mask(&mut self, pass_index: usize) {
        let mut mask = self
            .recovery
            .mask_bits(&self.outcome, !self.switches.force_recovery_loop);
        if !self.config.multi_pass_masks.is_empty() {
            mask.merge(&self.multi_pass_masks[pass_index]);
        }
        mask = self.process_core_groups(mask);
        debug!(mask = %mask, "initial search mask bits");
        self.initial_search_mask = mask;
    }

    /// Voltage-width view of the incoming-width initial mask: a domain is
    /// masked only when every tracker bit of its decoder is masked
    fn initial_mask_for_point(&self) -> BitMask {
        let targets = self.point.targets_count();
        if targets == 1 {
            return if self.initial_search_mask.count_zeros() == 0 {
                BitMask::ones(1)
            } else {
                BitMask::zeros(1)
            };
        }
        if self.initial_search_mask.len() == targets {
            return self.initial_search_mask.clone();
        }
        let Some(pin_map) = self.ctx.pin_map else {
            return BitMask::zeros(targets);
        };
        let mut mask = BitMask::zeros(0);
        let mut offset = 0;
        for decoder in pin_map.configuration() {
            let local = self.initial_search_mask.slice(offset, decoder.tracker_size());
            mask.push(local.all());
            offset += decoder.tracker_size();
        }
        mask
    }

    fn process_core_groups(&self, mask: BitMask) -> BitMask {
        let size = self.switches.core_group_size();
        if size == 1 {
            return mask;
        }
        let mut result = mask.clone();
        for group in 0..(mask.len() / size) {
            if mask.slice(group * size, size).any() {
                for bit in 0..size {
                    result.set(group * size + bit, true);
                }
            }
        }
        result
    }

    fn apply_search_voltage(&mut self) -> EngineResult<()> {
        if self.skip_apply_search_voltage {
            debug!("skipping voltage setup, using initial voltage");
            return Ok(());
        }
        let voltages = self.point.voltages();
        debug!(?voltages, "applying search voltages");
        self.services
            .voltage
            .apply(&voltages)
            .map_err(SearchError::Base)
    }

    fn apply_mask(&mut self) -> EngineResult<()> {
        match self.ctx.pin_map {
            Some(pin_map) => {
                let mask = if self.config.test_mode == TestMode::MultiVmin {
                    self.combine_mask(&self.point.mask_bits())?
                } else {
                    self.initial_search_mask.clone()
                };
                pin_map.mask_pins(&mask, &mut *self.services.executor, &self.config.mask_pins)?;
                pin_map.modify_plist(&mask, &mut *self.services.executor)?;
            }
            None => {
                self.services.executor.set_pin_mask(&self.config.mask_pins);
            }
        }
        Ok(())
    }

    fn combine_mask(&self, point_mask: &BitMask) -> EngineResult<BitMask> {
        let mut mask = if self.initial_search_mask.len() != point_mask.len() {
            let pin_map = self.ctx.pin_map.ok_or_else(|| {
                SearchError::Config("mask width mismatch without a pin map".into())
            })?;
            pin_map.voltage_domains_to_fail_tracker(point_mask)?
        } else {
            point_mask.clone()
        };
        mask.merge(&self.initial_search_mask);
        Ok(mask)
    }

    fn decode_results(
        &mut self,
        plist_pass: bool,
        failures: &[FailureRecord],
    ) -> EngineResult<BitMask> {
        let targets = self.point.targets_count();
        let default_bits = if plist_pass {
            BitMask::zeros(targets)
        } else {
            BitMask::ones(targets)
        };

        let Some(pin_map) = self.ctx.pin_map else {
            self.outcome.decoded_result = Some(default_bits.clone());
            return Ok(default_bits);
        };

        let mut decoded = pin_map.decode_failure(failures, self.services.plist);
        if self.switches.ignore_masked_results
            && decoded.len() == self.initial_search_mask.len()
        {
            decoded = decoded.and(&self.initial_search_mask.not());
        }
        self.outcome.decoded_result = Some(decoded.clone());

        match self.config.test_mode {
            TestMode::MultiVmin if decoded.len() == targets => Ok(decoded),
            TestMode::MultiVmin => {
                Ok(pin_map.fail_tracker_to_fail_voltage_domains(&decoded)?)
            }
            _ => Ok(default_bits),
        }
    }

    fn has_to_repeat_search(&mut self) -> EngineResult<bool> {
        let mut ctx = RecoveryContext {
            pin_map: self.ctx.pin_map,
            executor: &mut *self.services.executor,
            tracker: self.tracker_outgoing.as_ref(),
            tracker_store: &mut *self.ctx.tracker_store,
            rules: self.ctx.rules,
            sink: &mut *self.services.datalog,
            recovery_options: &self.config.recovery_options,
            decode_from_voltages: self.config.test_mode == TestMode::MultiVmin,
        };
        let repeat = self.recovery.has_to_repeat_search(&mut self.outcome, &mut ctx)?;
        let forced = self.switches.force_recovery_loop
            && !self
                .outcome
                .results
                .last()
                .map(|result| result.is_pass)
                .unwrap_or(true);
        Ok(forced || repeat)
    }

    fn has_to_continue(&self) -> bool {
        if !self.switches.force_recovery_loop
            && self.outcome.failed_search
            && self.outcome.failed_rules
        {
            debug!("search failed with no option for recovery");
            return false;
        }
        true
    }

    fn push_result(&mut self, is_pass: bool, identifiers: SearchIdentifiers) {
        self.outcome.results.push(SearchResultData::new(
            self.point.voltages(),
            self.point.start_voltages(),
            self.point.end_voltage_limits(),
            self.point.mask_bits(),
            self.point.execution_count,
            self.point.per_target_increments(),
            &self.point.per_point_data,
            self.point.fail_reason,
            is_pass,
            identifiers,
        ));
    }

    fn execution_identifier(&self) -> String {
        let mut identifier = String::new();
        if self.multi_pass_masks.len() > 1 {
            identifier.push_str(&format!("M{}", self.outcome.flow.multi_pass_count));
        }
        if self.config.max_repetition_count > 1 {
            identifier.push_str(&format!("R{}", self.outcome.flow.repetition_count));
        }
        identifier
    }

    fn restore_after_search(&mut self) {
        if let Some(pin_map) = self.ctx.pin_map {
            pin_map.restore(&mut *self.services.executor);
        }
        self.services.voltage.restore();
    }

    // ------------------------------------------------------------------
    // post-processing
    // ------------------------------------------------------------------

    fn post_process_results(&mut self) -> EngineResult<()> {
        self.custom_print_to_datalog()?;
        self.outcome.evaluate_amble_fails(self.services.plist);
        self.update_die_recovery_tracking()?;
        self.update_port();
        self.process_vmin_results()?;
        Ok(())
    }

    fn custom_print_to_datalog(&mut self) -> EngineResult<()> {
        let single_modes = matches!(
            self.config.test_mode,
            TestMode::Functional | TestMode::Scoreboard
        );
        if single_modes && self.corners.is_empty() {
            return Ok(());
        }
        if self.switches.print_results_for_all_searches {
            datalog::print_results_for_all_searches(
                &mut *self.services.datalog,
                &self.outcome.results,
                &self.config.pattern_name_map,
                self.switches.print_per_target_increments,
            );
        } else if !self.outcome.results.is_empty() {
            datalog::print_merged_search_results(
                &mut *self.services.datalog,
                &self.outcome.results,
                &self.config.pattern_name_map,
                self.switches.print_per_target_increments,
            );
        }
        if let Some(store) = self.ctx.forwarding.as_deref() {
            datalog::log_vmin_configuration(&mut *self.services.datalog, &self.corners, store)?;
        }
        self.print_per_pattern_vmin();
        Ok(())
    }

    fn update_die_recovery_tracking(&mut self) -> EngineResult<()> {
        self.failed_tracker_update = false;
        let Some(tracker) = self.tracker_outgoing.as_ref() else {
            return Ok(());
        };
        if matches!(
            self.config.forwarding_mode,
            ForwardingMode::None | ForwardingMode::Input
        ) || self.outcome.test_results_bits.is_empty()
        {
            return Ok(());
        }

        self.outcome.rules_results_bits =
            self.process_core_groups(self.outcome.rules_results_bits.clone());
        let updated = self.recovery.update_recovery_trackers(
            &self.outcome,
            tracker,
            &mut *self.ctx.tracker_store,
            &mut *self.services.datalog,
            self.switches.recovery_update_always,
        )?;
        self.failed_tracker_update = !updated;
        Ok(())
    }

    fn update_port(&mut self) {
        self.port = self.recovery.port(&self.outcome);
        if self.outcome.failed_search && self.outcome.failed_amble {
            debug!(port = FAIL_AMBLE_PORT, "search fail due to amble pattern");
            self.port = FAIL_AMBLE_PORT;
            return;
        }
        if self.failed_tracker_update {
            debug!(port = FAIL_PORT, "die-recovery tracking update failed");
            self.port = FAIL_PORT;
        }
    }

    fn process_vmin_results(&mut self) -> EngineResult<()> {
        let voltages = self.outcome.aggregate_voltages();
        self.update_vmin_result(Some(&voltages));
        self.update_vmin_forwarding(&voltages)?;
        Ok(())
    }

    fn update_vmin_result(&mut self, voltages: Option<&[f64]>) {
        if self.config.vmin_result_keys.is_empty() {
            return;
        }
        let values: Vec<f64> = voltages
            .map(|v| v.to_vec())
            .unwrap_or_else(|| vec![VOLTAGE_MASK; self.point.targets_count()]);

        if self.config.vmin_result_keys.len() == 1 {
            let min = values.iter().copied().fold(f64::INFINITY, f64::min);
            let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let value = if min < 0.0 { min } else { max };
            self.services.kv.insert(
                &self.config.vmin_result_keys[0],
                StoreValue::Double(value),
                StorageScope::Dut,
            );
        } else {
            for (key, value) in self.config.vmin_result_keys.iter().zip(&values) {
                self.services
                    .kv
                    .insert(key, StoreValue::Double(*value), StorageScope::Dut);
            }
        }
    }

    fn is_forwarding_disabled(&self) -> bool {
        matches!(
            self.config.test_mode,
            TestMode::Functional | TestMode::Scoreboard
        ) || self.corners.is_empty()
            || self.port == FAIL_RECOVERY_PORT
            || !matches!(
                self.config.forwarding_mode,
                ForwardingMode::Output | ForwardingMode::InputOutput
            )
            || self.ctx.forwarding.is_none()
    }

    fn update_vmin_forwarding(&mut self, voltages: &[f64]) -> EngineResult<()> {
        let guardbands = if self.config.limit_guardband.is_empty() {
            None
        } else {
            Some(self.fit_to_targets(self.resolve_voltage_list(&self.config.limit_guardband)?))
        };

        let mut failed = false;
        if self.is_forwarding_disabled() {
            if let (Some(guardbands), Some(last)) = (&guardbands, self.outcome.results.last()) {
                for index in 0..voltages.len().min(guardbands.len()) {
                    failed |= failed_limit_guardband(
                        true,
                        last.start_voltages[index],
                        voltages[index],
                        guardbands[index],
                    );
                }
            }
        } else {
            let store = self.ctx.forwarding.as_deref_mut().unwrap();
            let results: Vec<f64> = if voltages.len() == 1 && self.corners.len() > 1 {
                vec![voltages[0]; self.corners.len()]
            } else {
                voltages.to_vec()
            };
            for (index, (corner, flow)) in self.corners.iter().enumerate() {
                let Some(&result) = results.get(index) else {
                    break;
                };
                let prior = store.starting_voltage(corner, *flow, VOLTAGE_FAIL);
                if let Some(guardbands) = &guardbands {
                    failed |= failed_limit_guardband(
                        store.is_search_guardband_enabled(),
                        prior,
                        result,
                        guardbands[index.min(guardbands.len() - 1)],
                    );
                }
                if !self.switches.vmin_update_on_pass_only || result > 0.0 {
                    let value = if voltages_equal(result, VOLTAGE_FAIL) {
                        result
                    } else {
                        result.max(prior)
                    };
                    failed |= !store.store_vmin_result(corner, *flow, value);
                }
            }
        }

        if failed && self.port == PASS_PORT {
            self.port = FAIL_PORT;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // per-pattern vmin
    // ------------------------------------------------------------------

    fn update_per_pattern_table(
        &mut self,
        plist_pass: bool,
        failures: &[FailureRecord],
    ) -> EngineResult<()> {
        if !self.switches.per_pattern_printing {
            return Ok(());
        }
        let index = self.services.plist.pattern_index();
        if index.is_empty() {
            return Ok(());
        }
        let voltages = self.point.voltages();
        let upto = if plist_pass {
            index.len()
        } else {
            match failures.first() {
                None => 0,
                Some(fail) => index
                    .iter()
                    .position(|occurrence| {
                        occurrence.burst_index == fail.burst_index
                            && occurrence.pattern_name == fail.pattern_name
                            && occurrence.occurrence == fail.pattern_instance_id
                    })
                    .ok_or_else(|| SearchError::PatternNotFound(fail.pattern_name.clone()))?,
            }
        };
        for occurrence in &index[..upto] {
            self.per_pattern_voltages
                .entry(occurrence.clone())
                .or_insert_with(|| voltages.clone());
        }
        Ok(())
    }

    fn print_per_pattern_vmin(&mut self) {
        if !self.switches.per_pattern_printing || self.per_pattern_voltages.is_empty() {
            return;
        }
        let mut data = String::new();
        for (occurrence, voltages) in &self.per_pattern_voltages {
            if self.services.plist.is_pattern_an_amble(&occurrence.pattern_name) {
                continue;
            }
            let id = datalog::mapped_string(&occurrence.pattern_name, &self.config.pattern_name_map);
            let values = voltages
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join("_");
            data.push_str(&format!("{id}:{values}|"));
        }
        if data.is_empty() {
            return;
        }
        data.pop();
        self.services.datalog.write_record("_pp", &data);
        self.services.kv.insert(
            &format!("{}_pp", self.config.instance_name),
            StoreValue::Text(data),
            StorageScope::Dut,
        );
    }

    // ------------------------------------------------------------------
    // voltage resolution
    // ------------------------------------------------------------------

    /// Resolves voltage entries: literal values (with an optional trailing
    /// volt unit) or key-value-store keys
    fn resolve_voltage_list(&self, entries: &[String]) -> EngineResult<Vec<f64>> {
        let mut values = Vec::with_capacity(entries.len());
        for entry in entries {
            let trimmed = entry.trim();
            let literal = trimmed.parse::<f64>().ok().or_else(|| {
                trimmed
                    .strip_suffix(['v', 'V'])
                    .and_then(|text| text.trim().parse::<f64>().ok())
            });
            let value = match literal {
                Some(value) => value,
                None => self
                    .services
                    .kv
                    .get(trimmed, StorageScope::Dut)
                    .and_then(|stored| stored.as_double())
                    .ok_or_else(|| SearchError::StorageMiss(trimmed.to_string()))?,
            };
            values.push(value);
        }
        Ok(values)
    }

    /// Fits a resolved list to the target count: a single-target search
    /// takes the maximum, a single value fans out to every target
    fn fit_to_targets(&self, values: Vec<f64>) -> Vec<f64> {
        let targets = self.point.targets_count();
        if targets == 1 && values.len() > 1 {
            return vec![values.iter().copied().fold(f64::NEG_INFINITY, f64::max)];
        }
        if values.len() == 1 && targets > 1 {
            return vec![values[0]; targets];
        }
        values
    }
}

fn first_fail_pattern(failures: &[FailureRecord], start_on_first_fail: bool) -> PatternData {
    if !start_on_first_fail {
        return PatternData::default();
    }
    failures
        .first()
        .map(|fail| PatternData {
            pattern_name: fail.pattern_name.clone(),
            burst_index: fail.burst_index,
            pattern_id: fail.pattern_instance_id,
            fail_vector: fail.vector_address,
        })
        .unwrap_or_default()
}

fn failed_limit_guardband(enabled: bool, start: f64, result: f64, guardband: f64) -> bool {
    if enabled
        && start > 0.0
        && (voltages_equal(result, VOLTAGE_FAIL) || (result - start) > guardband)
    {
        debug!(result, start, guardband, "voltage result exceeded the limit guardband");
        return true;
    }
    false
}
