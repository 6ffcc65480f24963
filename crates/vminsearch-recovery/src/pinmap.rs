//! Pin maps: physical fail bits to logical tracker bits
//!
//! A pin map is an ordered list of decoders. Each decoder owns a declared
//! number of tracker bits and knows how to attribute captured per-pin
//! failures to them, which pins to mask when its bits are disabled, and
//! which pattern-list edits go with that masking. The pin map concatenates
//! the decoders into one tracker-wide vector and provides the lossy
//! translation between tracker bits and voltage-domain bits.

use crate::{RecoveryError, RecoveryResult};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use vminsearch_base::{
    BitMask, FailureRecord, PatConfigRequest, PatConfigService, PatternExecutor, PlistInfo,
};

/// One decoder inside a pin map
pub trait PinMapDecoder {
    fn name(&self) -> &str;

    /// Number of tracker bits this decoder owns
    fn tracker_size(&self) -> usize;

    /// Attributes captured failures to this decoder's tracker bits.
    /// Ambiguous or pin-less failures map to no bits set.
    fn decode(&self, failures: &[FailureRecord]) -> BitMask;

    /// Pins to mask for the given decoder-local disablement bits
    fn mask_pins(&self, mask: &BitMask) -> Vec<String>;

    /// Edits the pattern-list execution plan for the given decoder-local
    /// mask; paired with `mask_pins`
    fn apply_plist_settings(&self, _mask: &BitMask, _executor: &mut dyn PatternExecutor) {}

    /// Static pattern-config disablement for a-priori masked units
    fn pat_config(&self, _bits: &BitMask, _patlist: &str) -> Option<PatConfigRequest> {
        None
    }

    /// Validates compatibility with the execution context; called once
    /// before any masking
    fn verify(&self, _executor: &mut dyn PatternExecutor) -> RecoveryResult<()> {
        Ok(())
    }

    /// Undoes any masking/plist edits this decoder applied
    fn restore(&self, _executor: &mut dyn PatternExecutor) {}
}

/// Table-driven decoder mapping failing pin names to tracker bit positions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinToBitDecoder {
    pub name: String,
    /// Number of tracker bits owned by this decoder
    pub size: usize,
    /// Failing pin name -> tracker bit positions it implicates
    pub pins: IndexMap<String, Vec<usize>>,
    /// Tracker bit -> plist content token removed when the bit is masked
    #[serde(default)]
    pub plist_disable_tokens: IndexMap<usize, String>,
    /// Pattern-config name used for static disablement, if any
    #[serde(default)]
    pub pat_config_name: Option<String>,
}

impl PinMapDecoder for PinToBitDecoder {
    fn name(&self) -> &str {
        &self.name
    }

    fn tracker_size(&self) -> usize {
        self.size
    }

    fn decode(&self, failures: &[FailureRecord]) -> BitMask {
        let mut tracker = BitMask::zeros(self.size);
        for failure in failures {
            for pin in &failure.failing_pins {
                if let Some(bits) = self.pins.get(pin) {
                    for &bit in bits {
                        tracker.set(bit, true);
                    }
                }
            }
        }
        tracker
    }

    fn mask_pins(&self, mask: &BitMask) -> Vec<String> {
        let mut pins = Vec::new();
        for (pin, bits) in &self.pins {
            if bits.iter().any(|&bit| mask.get(bit)) {
                pins.push(pin.clone());
            }
        }
        pins
    }

    fn apply_plist_settings(&self, mask: &BitMask, executor: &mut dyn PatternExecutor) {
        let tokens: Vec<String> = self
            .plist_disable_tokens
            .iter()
            .filter(|(&bit, _)| mask.get(bit))
            .map(|(_, token)| token.clone())
            .collect();
        if !tokens.is_empty() {
            executor.disable_plist_tokens(&tokens);
        }
    }

    fn pat_config(&self, bits: &BitMask, patlist: &str) -> Option<PatConfigRequest> {
        self.pat_config_name
            .as_deref()
            .map(|name| PatConfigRequest::with_mask(name, bits, patlist))
    }

    fn verify(&self, _executor: &mut dyn PatternExecutor) -> RecoveryResult<()> {
        for (pin, bits) in &self.pins {
            if let Some(&bad) = bits.iter().find(|&&bit| bit >= self.size) {
                return Err(RecoveryError::PinMap(format!(
                    "decoder [{}] maps pin [{}] to bit {} outside size {}",
                    self.name, pin, bad, self.size
                )));
            }
        }
        Ok(())
    }

    fn restore(&self, executor: &mut dyn PatternExecutor) {
        if !self.plist_disable_tokens.is_empty() {
            executor.restore_plist();
        }
    }
}

/// Single-bit decoder: any captured failure on its pins implicates its unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnyFailDecoder {
    pub name: String,
    /// Pins owned by this unit; empty means any failing pin counts
    #[serde(default)]
    pub pins: Vec<String>,
}

impl PinMapDecoder for AnyFailDecoder {
    fn name(&self) -> &str {
        &self.name
    }

    fn tracker_size(&self) -> usize {
        1
    }

    fn decode(&self, failures: &[FailureRecord]) -> BitMask {
        let mut tracker = BitMask::zeros(1);
        let hit = failures.iter().any(|failure| {
            if self.pins.is_empty() {
                !failure.failing_pins.is_empty()
            } else {
                failure
                    .failing_pins
                    .iter()
                    .any(|pin| self.pins.contains(pin))
            }
        });
        tracker.set(0, hit);
        tracker
    }

    fn mask_pins(&self, mask: &BitMask) -> Vec<String> {
        if mask.get(0) {
            self.pins.clone()
        } else {
            Vec::new()
        }
    }
}

/// Serializable decoder definition used when loading pin maps from JSON
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DecoderDef {
    PinToBit(PinToBitDecoder),
    AnyFail(AnyFailDecoder),
}

impl DecoderDef {
    fn into_decoder(self) -> Box<dyn PinMapDecoder> {
        match self {
            DecoderDef::PinToBit(decoder) => Box::new(decoder),
            DecoderDef::AnyFail(decoder) => Box::new(decoder),
        }
    }
}

/// Ordered decoder table translating between physical pins, tracker bits
/// and voltage domains. One decoder per voltage domain.
pub struct PinMap {
    name: String,
    decoders: Vec<Box<dyn PinMapDecoder>>,
    full_size: usize,
}

impl PinMap {
    pub fn new(name: &str, decoders: Vec<Box<dyn PinMapDecoder>>) -> Self {
        let full_size = decoders.iter().map(|d| d.tracker_size()).sum();
        Self {
            name: name.to_string(),
            decoders,
            full_size,
        }
    }

    /// Loads a pin map from a JSON array of decoder definitions
    pub fn from_json(name: &str, text: &str) -> RecoveryResult<Self> {
        let defs: Vec<DecoderDef> = serde_json::from_str(text)?;
        Ok(Self::new(
            name,
            defs.into_iter().map(DecoderDef::into_decoder).collect(),
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total tracker width across all decoders
    pub fn full_size(&self) -> usize {
        self.full_size
    }

    /// Decoder table, in declaration order
    pub fn configuration(&self) -> &[Box<dyn PinMapDecoder>] {
        &self.decoders
    }

    /// Maps a functional-test failure set to a tracker-bit vector.
    ///
    /// A first failure on an amble pattern, or failing pins that no decoder
    /// attributes, mark every tracker bit as failing: the failure is real
    /// but cannot be pinned to a unit.
    pub fn decode_failure(
        &self,
        failures: &[FailureRecord],
        plist_info: &dyn PlistInfo,
    ) -> BitMask {
        let mut checked_domains: Vec<&str> = Vec::new();
        for failure in failures {
            if checked_domains.contains(&failure.domain.as_str()) {
                continue;
            }
            checked_domains.push(&failure.domain);
            if plist_info.is_pattern_an_amble(&failure.pattern_name) {
                debug!(
                    pattern = %failure.pattern_name,
                    "first failing pattern is an amble, marking all domains as failing"
                );
                return BitMask::ones(self.full_size);
            }
        }

        let mut result = BitMask::zeros(0);
        for decoder in &self.decoders {
            let tracker = decoder.decode(failures);
            debug!(decoder = decoder.name(), tracker = %tracker, "decoder result");
            result.extend_from(&tracker);
        }

        let any_failing_pin = failures.iter().any(|f| !f.failing_pins.is_empty());
        if !result.any() && any_failing_pin {
            warn!(
                pin_map = %self.name,
                "failing pins present but no decoder attributed them, marking all tracker bits"
            );
            result.set_all(true);
        }
        result
    }

    /// Applies electrical masking for the bits set in `mask` plus any
    /// additionally-named pins. No-op for an all-zero mask with no extras.
    pub fn mask_pins(
        &self,
        mask: &BitMask,
        executor: &mut dyn PatternExecutor,
        extra_pins: &[String],
    ) -> RecoveryResult<()> {
        self.check_size(mask)?;
        if !mask.any() && extra_pins.is_empty() {
            return Ok(());
        }

        let mut pins = Vec::new();
        let mut offset = 0;
        for decoder in &self.decoders {
            let local = mask.slice(offset, decoder.tracker_size());
            pins.extend(decoder.mask_pins(&local));
            offset += decoder.tracker_size();
        }
        pins.extend_from_slice(extra_pins);
        debug!(pin_map = %self.name, mask = %mask, pins = ?pins, "masking pins");
        executor.set_pin_mask(&pins);
        Ok(())
    }

    /// Edits the pattern-list execution plan consistent with `mask`; called
    /// paired with `mask_pins`
    pub fn modify_plist(
        &self,
        mask: &BitMask,
        executor: &mut dyn PatternExecutor,
    ) -> RecoveryResult<()> {
        self.check_size(mask)?;
        let mut offset = 0;
        for decoder in &self.decoders {
            let local = mask.slice(offset, decoder.tracker_size());
            decoder.apply_plist_settings(&local, executor);
            offset += decoder.tracker_size();
        }
        Ok(())
    }

    /// Contracts tracker bits to per-voltage-domain bits: a domain fails
    /// when any of its decoder's tracker bits fail
    pub fn fail_tracker_to_fail_voltage_domains(
        &self,
        tracker_bits: &BitMask,
    ) -> RecoveryResult<BitMask> {
        self.check_size(tracker_bits)?;
        let mut domains = BitMask::zeros(self.decoders.len());
        let mut offset = 0;
        for (index, decoder) in self.decoders.iter().enumerate() {
            let local = tracker_bits.slice(offset, decoder.tracker_size());
            domains.set(index, local.any());
            offset += decoder.tracker_size();
        }
        Ok(domains)
    }

    /// Expands per-voltage-domain bits to tracker bits: a failing domain
    /// marks every tracker bit of its decoder
    pub fn voltage_domains_to_fail_tracker(
        &self,
        domain_bits: &BitMask,
    ) -> RecoveryResult<BitMask> {
        if domain_bits.len() != self.decoders.len() {
            return Err(RecoveryError::SizeMismatch {
                name: self.name.clone(),
                expected: self.decoders.len(),
                actual: domain_bits.len(),
            });
        }
        let mut tracker = BitMask::zeros(0);
        for (index, decoder) in self.decoders.iter().enumerate() {
            let value = domain_bits.get(index);
            for _ in 0..decoder.tracker_size() {
                tracker.push(value);
            }
        }
        Ok(tracker)
    }

    /// Validates every decoder against the execution context; must run once
    /// before any masking
    pub fn verify(&self, executor: &mut dyn PatternExecutor) -> RecoveryResult<()> {
        if self.decoders.is_empty() {
            return Err(RecoveryError::PinMap(format!(
                "pin map [{}] has no decoders",
                self.name
            )));
        }
        for decoder in &self.decoders {
            decoder.verify(executor)?;
        }
        Ok(())
    }

    /// Undoes all masking and plist edits; guaranteed to run on every exit
    /// path of a search
    pub fn restore(&self, executor: &mut dyn PatternExecutor) {
        for decoder in &self.decoders {
            decoder.restore(executor);
        }
        executor.set_pin_mask(&[]);
    }

    /// Applies static pattern-config disablement for a-priori masked units
    pub fn apply_pat_config(
        &self,
        bits: &BitMask,
        patlist: &str,
        service: &mut dyn PatConfigService,
    ) -> RecoveryResult<()> {
        self.check_size(bits)?;
        let mut requests = Vec::new();
        let mut offset = 0;
        for decoder in &self.decoders {
            let local = bits.slice(offset, decoder.tracker_size());
            if let Some(request) = decoder.pat_config(&local, patlist) {
                requests.push(request);
            }
            offset += decoder.tracker_size();
        }
        if !requests.is_empty() {
            debug!(pin_map = %self.name, bits = %bits, "applying pattern-config disablement");
            service.apply(&requests)?;
        }
        Ok(())
    }

    fn check_size(&self, mask: &BitMask) -> RecoveryResult<()> {
        if mask.len() != self.full_size {
            return Err(RecoveryError::SizeMismatch {
                name: self.name.clone(),
                expected: self.full_size,
                actual: mask.len(),
            });
        }
        Ok(())
    }
}
