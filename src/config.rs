//! Engine configuration: every magic number the
//! rest of the crate uses is collected here with its default value.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunable engine parameters, collected in one struct the way a CLI tool
/// collects every tunable constant in its own `Args` struct. `Serialize` /
/// `Deserialize` let a host embed this directly in its own on-disk config.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Bounded line-history capacity serviced for resend (N=50).
    pub history_capacity: usize,
    /// Maximum outstanding clear-to-send credit (max=10).
    pub max_credit: u32,
    /// Resend-requested log burst size per window.
    pub resend_log_burst: u32,
    /// Resend-requested log window (60s).
    pub resend_log_window: Duration,
    /// Ceiling on autoreport intervals the engine will request from
    /// firmware (M155/M27), in seconds.
    pub max_autoreport_interval_secs: u32,
    /// Whether an emergency stop (M112) also zeroes the heater setpoints it
    /// knows about before tearing the connection down. Default leaves this
    /// to the firmware's own M112 handling, matching most hosts; opting in
    /// adds a belt-and-suspenders zero from the host side too, since a
    /// forced shutdown can't be sure the firmware is still listening.
    pub emergency_stop_drops_heaters: bool,
    /// How long the engine waits for any line from firmware before running
    /// the timeout ladder (base timeouts of 10/15s are derived
    /// from this multiplied out in `crate::timeout`; this is the poll
    /// granularity the liveness task wakes at).
    pub liveness_poll_interval: Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            history_capacity: crate::history::DEFAULT_CAPACITY,
            max_credit: crate::credit::DEFAULT_MAX,
            resend_log_burst: 5,
            resend_log_window: Duration::from_secs(60),
            max_autoreport_interval_secs: 2,
            emergency_stop_drops_heaters: false,
            liveness_poll_interval: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_constants() {
        let cfg = ProtocolConfig::default();
        assert_eq!(cfg.history_capacity, 50);
        assert_eq!(cfg.max_credit, 10);
        assert!(!cfg.emergency_stop_drops_heaters);
    }
}
