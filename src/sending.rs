//! Sending loop: the cooperative task that awaits credit, drains
//! resend-then-send, emits checksummed bytes, and advances the line
//! counter. A `select!`-driven loop around a cancellation token, but
//! single-ended: there is one outbound direction here, not a
//! request/response cycle.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::command::Command;
use crate::flavor::FlavorHandle;
use crate::internal::Internal;
use crate::phase::{HookOutcome, Phase, Pipeline};
use crate::queue::send::Entry;
use crate::state::ProtocolState;

/// XOR of every byte in `data`, the RepRap checksum used for outbound lines.
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, b| acc ^ b)
}

/// Whether `entry`'s command should be transmitted with a checksum, per
/// the checksum policy formula: required for commands the flavor flags as
/// needing one, otherwise allowed-and-enabled for any gcode command.
pub fn send_with_checksum(
    command: &Command,
    state: ProtocolState,
    message_integrity: bool,
    policy: &crate::flavor::Policy,
) -> bool {
    if message_integrity {
        return false;
    }
    let gcode_key = command.gcode_key();
    let is_gcode = gcode_key.is_some();
    let requires = policy.requires_checksum(gcode_key.as_deref());
    let allows = is_gcode || policy.unknown_with_checksum;
    let enabled = policy.always_send_checksum || (state == ProtocolState::Processing && !policy.never_send_checksum);
    requires || (allows && enabled)
}

/// Whether transmitting `command` should consume one unit of clear-to-send
/// credit: gcode commands always do, anything else only if the flavor
/// requires an ack for unknown lines.
pub fn consumes_credit(command: &Command, policy: &crate::flavor::Policy) -> bool {
    command.gcode_key().is_some() || policy.unknown_requires_ack
}

/// Formats a checksummed wire line: `N<n> <line>*<checksum>`, no trailing
/// newline (the transport writer appends line framing).
pub fn format_checksummed(line_number: u64, line: &str) -> Bytes {
    let prefix = format!("N{line_number} {line}");
    let c = checksum(prefix.as_bytes());
    Bytes::from(format!("{prefix}*{c}"))
}

/// Decides what the sending loop should do with the next queued entry.
pub enum SendDecision {
    /// Write `bytes` to the transport verbatim (already framed/checksummed).
    /// `sent_phase_command` is `Some` when the caller should run `command`
    /// through the `sent` phase once the write completes (resends skip it:
    /// their built-ins already ran the first time the line went out).
    Write {
        bytes: Bytes,
        consumes_credit: bool,
        on_sent: Option<crate::queue::send::OnSent>,
        sent_phase_command: Option<Command>,
    },
    /// Nothing to transmit (command dropped by the `sending` phase, or an
    /// at-command that never reaches the wire); caller should tickle
    /// `continue_sending` and loop again without waiting on a fresh credit.
    Skip,
}

/// Runs one dequeued [`Entry`] through the sending-phase pipeline and
/// checksum policy, returning what the caller should write to the transport
/// (if anything). The `sent` phase itself is *not* run here: it only applies
/// once the transport write has actually succeeded, so the caller runs it
/// via `sent_phase_command`.
pub fn process_entry(
    internal: &Arc<Internal>,
    flavor: &FlavorHandle,
    pipeline: &Pipeline,
    entry: Entry,
    message_integrity: bool,
) -> SendDecision {
    // Resend entries go out byte-identical: no phase processing, no line
    // counter change, no history update. `entry.command.line()` already
    // holds the fully framed wire bytes history stored the first time this
    // line went out (`N<n> ...*<checksum>`), so it is written verbatim
    // rather than reframed.
    if let Some(line_number) = entry.line_number {
        let bytes = Bytes::from(entry.command.line().to_string());
        trace!(line_number, "resending verbatim from history");
        return SendDecision::Write {
            bytes,
            consumes_credit: true,
            on_sent: entry.on_sent,
            sent_phase_command: None,
        };
    }

    let command = if entry.processed {
        entry.command
    } else {
        match pipeline.process(Phase::Sending, entry.command) {
            HookOutcome::Continue(c) => c,
            _ => return SendDecision::Skip,
        }
    };

    if command.is_empty_line() {
        return SendDecision::Skip;
    }

    if matches!(command, Command::AtCommand { .. }) {
        pipeline.process(Phase::Sending, command);
        return SendDecision::Skip;
    }

    let state = internal.current_state();
    let flavor_guard = flavor.read();
    let policy = &flavor_guard.policy;
    let with_checksum = send_with_checksum(&command, state, message_integrity, policy);
    let consumes = consumes_credit(&command, policy);
    drop(flavor_guard);

    let bytes = if with_checksum {
        let mut line_state = internal.line.lock();
        let line_number = line_state.current_line;
        let wire = format_checksummed(line_number, command.line());
        line_state.history.append(line_number, wire.clone());
        line_state.current_line += 1;
        wire
    } else {
        Bytes::from(command.line().to_string())
    };

    SendDecision::Write {
        bytes,
        consumes_credit: consumes,
        on_sent: entry.on_sent,
        sent_phase_command: Some(command),
    }
}

/// The emergency-stop double-send for M112: bypasses
/// the send queue, emitting the checksummed stop command twice — once at
/// the current line (no increment) and once with increment — as a defense
/// against M112 colliding with an in-flight resend window.
pub fn emergency_stop_frames(internal: &Arc<Internal>, command: &Command) -> (Bytes, Bytes) {
    let mut line_state = internal.line.lock();
    let n = line_state.current_line;
    let first = format_checksummed(n, command.line());
    line_state.history.append(n, first.clone());
    line_state.current_line = n + 1;
    let second = format_checksummed(n + 1, command.line());
    line_state.history.append(n + 1, second.clone());
    line_state.current_line = n + 2;
    debug!(first = n, second = n + 1, "emergency stop bypassing send queue");
    (first, second)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::to_command;
    use crate::flavor::{generic, Policy};

    #[test]
    fn checksum_matches_xor_of_bytes() {
        // N1 G28*52 is a commonly cited worked example for this exact line.
        let c = checksum(b"N1 G28");
        assert_eq!(format!("N1 G28*{c}"), "N1 G28*52");
    }

    #[test]
    fn format_checksummed_appends_correct_checksum() {
        let bytes = format_checksummed(1, "G28");
        assert_eq!(bytes.as_ref(), b"N1 G28*52");
    }

    #[test]
    fn gcode_commands_always_allow_checksum_in_processing() {
        let policy = generic::flavor().policy;
        let cmd = to_command("G1 X1", None, vec![]);
        assert!(send_with_checksum(&cmd, ProtocolState::Processing, false, &policy));
    }

    #[test]
    fn message_integrity_disables_checksum() {
        let policy = generic::flavor().policy;
        let cmd = to_command("G1 X1", None, vec![]);
        assert!(!send_with_checksum(&cmd, ProtocolState::Processing, true, &policy));
    }

    #[test]
    fn m110_requires_checksum_outside_processing() {
        let policy = generic::flavor().policy;
        let cmd = to_command("M110 N0", None, vec![]);
        assert!(send_with_checksum(&cmd, ProtocolState::Connected, false, &policy));
    }

    #[test]
    fn generic_lines_need_policy_opt_in() {
        let policy = Policy::default();
        let cmd = to_command("not a gcode", None, vec![]);
        assert!(!send_with_checksum(&cmd, ProtocolState::Processing, false, &policy));
    }

    #[test]
    fn gcode_commands_consume_credit() {
        let policy = generic::flavor().policy;
        let cmd = to_command("G1 X1", None, vec![]);
        assert!(consumes_credit(&cmd, &policy));
    }

    #[test]
    fn process_entry_increments_line_and_records_history() {
        let internal = Arc::new(Internal::new(10, 10));
        let flavor = Arc::new(parking_lot::RwLock::new(generic::flavor()));
        let pipeline = Pipeline::new();
        let entry = Entry::new(to_command("G28", None, vec![]));

        match process_entry(&internal, &flavor, &pipeline, entry, false) {
            SendDecision::Write { bytes, consumes_credit, sent_phase_command, .. } => {
                assert_eq!(bytes.as_ref(), b"N1 G28*52");
                assert!(consumes_credit);
                assert!(sent_phase_command.is_some());
            },
            SendDecision::Skip => panic!("expected a write"),
        }
        assert_eq!(internal.line.lock().current_line, 2);
        assert!(internal.line.lock().history.contains(1));
    }

    #[test]
    fn process_entry_resend_does_not_touch_line_counter() {
        let internal = Arc::new(Internal::new(10, 10));
        internal.line.lock().current_line = 9;
        let flavor = Arc::new(parking_lot::RwLock::new(generic::flavor()));
        let pipeline = Pipeline::new();
        // `entry.command.line()` carries the fully framed wire bytes history
        // stored the first time this line went out, the way `resend::next`
        // reconstructs it from `History::get`.
        let entry = Entry::resend(to_command("N3 G1 X1*12", None, vec![]), 3);

        match process_entry(&internal, &flavor, &pipeline, entry, false) {
            SendDecision::Write { bytes, .. } => assert_eq!(bytes.as_ref(), b"N3 G1 X1*12"),
            SendDecision::Skip => panic!("expected a write"),
        }
        assert_eq!(internal.line.lock().current_line, 9);
    }

    #[test]
    fn emergency_stop_sends_twice_advancing_by_two() {
        let internal = Arc::new(Internal::new(10, 10));
        internal.line.lock().current_line = 5;
        let cmd = to_command("M112", None, vec![]);
        let (first, second) = emergency_stop_frames(&internal, &cmd);
        assert!(first.starts_with(b"N5 "));
        assert!(second.starts_with(b"N6 "));
        assert_eq!(internal.line.lock().current_line, 7);
    }
}
