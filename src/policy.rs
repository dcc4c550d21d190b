//! Per-level session policies.
//!
//! A [`Policy`] carries the three inactivity budgets the session pump
//! uses: the full-duplex idle timeout and the two half-closed budgets
//! applied once one direction has finished.

use std::collections::HashMap;
use std::time::Duration;

/// Default idle timeout while both directions are open.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Default budget once the uplink has finished (downlink only remains).
pub const DEFAULT_DOWNLINK_ONLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Default budget once the downlink has finished (uplink only remains).
pub const DEFAULT_UPLINK_ONLY_TIMEOUT: Duration = Duration::from_secs(2);

/// Timeouts governing one tunnel session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    pub idle_timeout: Duration,
    pub downlink_only_timeout: Duration,
    pub uplink_only_timeout: Duration,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            downlink_only_timeout: DEFAULT_DOWNLINK_ONLY_TIMEOUT,
            uplink_only_timeout: DEFAULT_UPLINK_ONLY_TIMEOUT,
        }
    }
}

/// Maps user levels to policies; level 0 is the fallback.
#[derive(Debug, Clone, Default)]
pub struct PolicyManager {
    levels: HashMap<u32, Policy>,
    default: Policy,
}

impl PolicyManager {
    /// Creates a manager whose level-0 policy is `default`.
    pub fn new(default: Policy) -> Self {
        Self {
            levels: HashMap::new(),
            default,
        }
    }

    /// Registers the policy for a level, replacing any previous one.
    pub fn set_level(&mut self, level: u32, policy: Policy) {
        self.levels.insert(level, policy);
    }

    /// Returns the policy for `level`, falling back to the default.
    pub fn for_level(&self, level: u32) -> Policy {
        self.levels.get(&level).copied().unwrap_or(self.default)
    }
}
