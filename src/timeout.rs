//! Timeout and liveness: the deadline ladder that decides how
//! long the engine will wait for any line from firmware before treating the
//! silence as a communication problem, and what to do about it.

use std::time::Duration;

use crate::state::ProtocolState;

/// Base per-state timeout, before the long-running-command override.
fn base_timeout(state: ProtocolState) -> Duration {
    match state {
        ProtocolState::Processing | ProtocolState::Pausing | ProtocolState::Cancelling => {
            Duration::from_secs(10)
        },
        _ => Duration::from_secs(15),
    }
}

/// The consecutive-timeout ceiling before escalating to
/// `DisconnectedWithError`: 5 while a long-running command is in
/// flight (it ties up the line without talking), 10 while the state machine
/// is mid-job, else 15.
pub fn consecutive_max(state: ProtocolState, long_running: bool) -> u32 {
    if long_running {
        5
    } else if matches!(state, ProtocolState::Processing | ProtocolState::Pausing | ProtocolState::Cancelling) {
        10
    } else {
        15
    }
}

/// The deadline to arm after the most recent received line, accounting for
/// a command's `pending_extension_secs` (G4 dwell) and the state's base
/// timeout.
pub fn deadline(state: ProtocolState, pending_extension_secs: f64) -> Duration {
    base_timeout(state) + Duration::from_secs_f64(pending_extension_secs.max(0.0))
}

/// What the engine should do when a deadline lapses with no line received
/// (`on_comm_timeout`'s behavior tree).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutAction {
    /// A resend is in flight; re-emit the currently outstanding resend line.
    ReemitResend,
    /// A heatup wait is outstanding; the silence is expected, so declare the
    /// heatup finished (folds elapsed wait into `lost_seconds`, clears
    /// `heating`) rather than treating it as a fault.
    FinishHeatup,
    /// A long-running command (G4/M109/M190/...) is in flight; don't
    /// penalize the deadline, just rearm it.
    IgnoreLongRunning,
    /// Printing but otherwise idle on the line; send a temperature poll to
    /// confirm the link is alive.
    TicklePrinting,
    /// Connected and idle; grant one credit so a queued command can go out
    /// and confirm liveness.
    GrantIdleCredit,
    /// `consecutive` has now reached the ceiling for this state; escalate.
    Escalate { consecutive: u32 },
}

/// Decides the action for one lapsed deadline, given the engine's current
/// snapshot. Bumps `consecutive` by one as a side effect of being called —
/// callers own persisting the new value.
pub fn on_timeout(
    state: ProtocolState,
    consecutive: u32,
    long_running: bool,
    heating: bool,
    resend_in_flight: bool,
) -> (u32, TimeoutAction) {
    let consecutive = consecutive + 1;
    let max = consecutive_max(state, long_running);

    if consecutive > max {
        return (consecutive, TimeoutAction::Escalate { consecutive });
    }

    let action = if resend_in_flight {
        TimeoutAction::ReemitResend
    } else if heating {
        TimeoutAction::FinishHeatup
    } else if long_running {
        TimeoutAction::IgnoreLongRunning
    } else if state == ProtocolState::Processing {
        TimeoutAction::TicklePrinting
    } else {
        TimeoutAction::GrantIdleCredit
    };

    (consecutive, action)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consecutive_max_prioritizes_long_running() {
        assert_eq!(consecutive_max(ProtocolState::Processing, true), 5);
        assert_eq!(consecutive_max(ProtocolState::Processing, false), 10);
        assert_eq!(consecutive_max(ProtocolState::Connected, false), 15);
    }

    #[test]
    fn resend_takes_priority_over_heating() {
        let (n, action) = on_timeout(ProtocolState::Processing, 0, false, true, true);
        assert_eq!(n, 1);
        assert_eq!(action, TimeoutAction::ReemitResend);
    }

    #[test]
    fn heating_timeout_finishes_the_heatup() {
        let (_, action) = on_timeout(ProtocolState::Processing, 0, false, true, false);
        assert_eq!(action, TimeoutAction::FinishHeatup);
    }

    #[test]
    fn idle_connected_grants_credit() {
        let (_, action) = on_timeout(ProtocolState::Connected, 0, false, false, false);
        assert_eq!(action, TimeoutAction::GrantIdleCredit);
    }

    #[test]
    fn printing_idle_tickles_with_poll() {
        let (_, action) = on_timeout(ProtocolState::Processing, 0, false, false, false);
        assert_eq!(action, TimeoutAction::TicklePrinting);
    }

    #[test]
    fn ceiling_th_timeout_still_recovers() {
        // P8: escalation happens once the count *exceeds* the ceiling, so
        // the ceiling-th timeout itself still takes the normal action.
        let (n, action) = on_timeout(ProtocolState::Connected, 14, false, false, false);
        assert_eq!(n, 15);
        assert_eq!(action, TimeoutAction::GrantIdleCredit);
    }

    #[test]
    fn escalates_one_past_the_ceiling() {
        let (n, action) = on_timeout(ProtocolState::Connected, 15, false, false, false);
        assert_eq!(n, 16);
        assert_eq!(action, TimeoutAction::Escalate { consecutive: 16 });
    }

    #[test]
    fn long_running_ceiling_th_timeout_still_recovers() {
        let (n, action) = on_timeout(ProtocolState::Processing, 4, true, false, false);
        assert_eq!(n, 5);
        assert_eq!(action, TimeoutAction::IgnoreLongRunning);
    }

    #[test]
    fn long_running_escalates_one_past_the_ceiling() {
        let (n, action) = on_timeout(ProtocolState::Processing, 5, true, false, false);
        assert_eq!(n, 6);
        assert_eq!(action, TimeoutAction::Escalate { consecutive: 6 });
    }
}
