//! Protocol event listener: a default-no-op trait so a host
//! application can observe engine events without having to special-case
//! unhandled callbacks.

use std::collections::BTreeMap;

use crate::error::ProtocolError;
use crate::state::ProtocolState;

/// Receives notifications from a running [`crate::protocol::Protocol`].
/// Every method has a default no-op body; implementors override only the
/// events they care about.
pub trait ProtocolListener: Send + Sync {
    fn on_protocol_state_change(&self, _old: ProtocolState, _new: ProtocolState) {}

    fn on_protocol_temperature_update(
        &self,
        _temps: &BTreeMap<String, (Option<f64>, Option<f64>)>,
    ) {
    }

    fn on_protocol_firmware_info(&self, _name: &str, _info: &BTreeMap<String, String>) {}

    fn on_protocol_position_update(&self, _z: Option<f64>) {}

    fn on_protocol_sd_status(&self, _current: u64, _total: u64) {}

    /// Firmware published a complete SD file listing (`begin file
    /// list`..`end file list`).
    fn on_protocol_sd_file_list(&self, _files: &[(String, u64)]) {}

    /// Firmware reported a file opened for printing (`File opened: <name>
    /// Size: <n>`).
    fn on_protocol_file_print_started(&self, _name: &str, _size: u64) {}

    /// Firmware reported the active SD print finished.
    fn on_protocol_file_print_done(&self) {}

    /// A protocol-level log line a host UI would want to mirror, distinct
    /// from `tracing`'s own output (e.g. "resend requested" summaries a
    /// terminal-facing client wants even without enabling debug logging).
    fn on_protocol_log(&self, _message: &str) {}

    fn on_protocol_error(&self, _error: &ProtocolError) {}

    /// A line was received from firmware that no flavor matcher claimed
    /// ("unmatched lines are surfaced, not dropped").
    fn on_protocol_unmatched_line(&self, _line: &str) {}
}

/// A listener that discards every event; used where no observer is wired.
pub struct NullListener;

impl ProtocolListener for NullListener {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_listener_accepts_every_call() {
        let listener = NullListener;
        listener.on_protocol_state_change(ProtocolState::Disconnected, ProtocolState::Connecting);
        listener.on_protocol_unmatched_line("??");
    }
}
