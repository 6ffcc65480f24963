//! # vminsearch
//!
//! Voltage-margin (Vmin) search engine for semiconductor production test:
//! finds the minimum supply voltage at which a pattern sequence still
//! passes, per voltage domain, while coordinating fault masking, die
//! recovery and cross-test voltage forwarding.
//!
//! The workspace splits into four crates, re-exported here:
//! - [`base`]: bit masks plus the abstract tester collaborators
//! - [`recovery`]: defeature rules, die-recovery trackers, pin maps
//! - [`forwarding`]: the per-(corner, flow) Vmin forwarding store
//! - [`engine`]: voltage targets, the search loop, recovery modes, ports

pub use vminsearch_base as base;
pub use vminsearch_engine as engine;
pub use vminsearch_forwarding as forwarding;
pub use vminsearch_recovery as recovery;

pub use vminsearch_base::{BitMask, FailureRecord, PatternExecutor, VoltageControl};
pub use vminsearch_engine::{
    RecoveryModeKind, SearchConfig, SearchContext, SearchServices, TestMode, VminSearch,
};
pub use vminsearch_forwarding::VminForwardingStore;
pub use vminsearch_recovery::{DieRecoveryTracker, PinMap, RuleStore, TrackerStore};
