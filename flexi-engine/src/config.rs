//! Engine-wide tunables (`SPEC_FULL.md` §B). None of these change the
//! algorithms in `flexi-merger`/`flexi-validator`/`flexi-applier`; they only
//! parameterise the heuristics those crates already expose.

use flexi_applier::IndexThreshold;

/// Construction-time configuration for a [`crate::Context`].
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Row-count / on-disk-size heuristic gating deferred index
    /// materialisation (spec §4.6.4).
    pub index_apply_threshold: IndexThreshold,
    /// How many rows the data validator scans between cancellation-token
    /// polls (spec §5, default 1024).
    pub cancellation_poll_interval: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config { index_apply_threshold: IndexThreshold::default(), cancellation_poll_interval: 1024 }
    }
}
