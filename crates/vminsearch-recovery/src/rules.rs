//! Defeature rule groups
//!
//! A rule group names the disablement combinations that are acceptable
//! post-recovery configurations. Evaluating a group against a candidate
//! mask returns the matching subset of rules in declaration order; an empty
//! result is a rule failure. Groups are plain data and load from JSON.

use crate::{RecoveryError, RecoveryResult};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::debug;
use vminsearch_base::BitMask;

/// How a rule's patterns are interpreted. Only literal valid-combination
/// lists are supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleMode {
    ValidCombinations,
}

/// What a passing configuration may be used for downstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleType {
    /// No unit disabled
    FullyFeatured,
    /// Valid for de-featuring and fusing
    Recovery,
    /// Valid for fusing and fuse-down string generation
    FuseDown,
    /// Valid only for fusing
    FuseOnly,
}

/// One rule inside a group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDef {
    pub name: String,
    pub mode: RuleMode,
    /// Minimum number of still-enabled (zero) units required
    pub size: usize,
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    /// Inverts the match: the rule passes when no pattern matches
    #[serde(default)]
    pub fail_when: bool,
    /// Acceptable disablement bit patterns, e.g. ["0000", "0011"]
    pub patterns: Vec<String>,
}

/// A named set of rules evaluated together
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleGroup {
    pub name: String,
    pub rules: Vec<RuleDef>,
}

/// One passing configuration returned from rule evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct PassingRule {
    pub name: String,
    pub bit_vector: BitMask,
    pub size: usize,
    pub rule_type: RuleType,
    pub mode: RuleMode,
}

impl RuleGroup {
    /// Evaluates every rule against `input` and returns the passing
    /// configurations in declaration order.
    ///
    /// A pattern matches when it is a superset of the input: the input has
    /// no unit disabled that the pattern leaves enabled.
    pub fn passing_rules(&self, input: &BitMask) -> RecoveryResult<Vec<PassingRule>> {
        let mut passing = Vec::new();
        for rule in &self.rules {
            let mut matched = Vec::new();
            for pattern in &rule.patterns {
                if pattern.len() != input.len() {
                    return Err(RecoveryError::RuleWidthMismatch {
                        rule: rule.name.clone(),
                        pattern: pattern.clone(),
                        input: input.len(),
                    });
                }
                let candidate = BitMask::parse(pattern)?;
                if candidate.is_superset_of(input) != rule.fail_when {
                    matched.push(candidate);
                }
            }
            for bit_vector in matched {
                passing.push(PassingRule {
                    name: rule.name.clone(),
                    bit_vector,
                    size: rule.size,
                    rule_type: rule.rule_type,
                    mode: rule.mode,
                });
            }
        }

        match passing.first() {
            Some(first) => debug!(
                group = %self.name,
                input = %input,
                rule = %first.name,
                bit_vector = %first.bit_vector,
                "defeature rule passed"
            ),
            None => debug!(group = %self.name, input = %input, "no passing defeature rule"),
        }
        Ok(passing)
    }
}

/// Registry of rule groups, injected wherever rules are evaluated
#[derive(Debug, Clone, Default)]
pub struct RuleStore {
    groups: IndexMap<String, RuleGroup>,
}

impl RuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, group: RuleGroup) {
        self.groups.insert(group.name.clone(), group);
    }

    pub fn get(&self, name: &str) -> RecoveryResult<&RuleGroup> {
        self.groups
            .get(name)
            .ok_or_else(|| RecoveryError::UnknownRuleGroup(name.to_string()))
    }

    /// Loads a JSON array of rule groups
    pub fn from_json(text: &str) -> RecoveryResult<Self> {
        let groups: Vec<RuleGroup> = serde_json::from_str(text)?;
        let mut store = Self::new();
        for group in groups {
            store.insert(group);
        }
        Ok(store)
    }

    /// Loads rule groups from a JSON file
    pub fn from_json_file(path: &std::path::Path) -> RecoveryResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }
}
