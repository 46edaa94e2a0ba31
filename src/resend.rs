//! Resend controller: correlates a firmware `Resend: N` request
//! against line history and drives the resend window until it closes.

use std::time::{Duration, Instant};

use crate::error::ProtocolError;
use crate::flavor::ErrorKind;
use crate::history::History;
use crate::queue::send::{Entry, Target};

/// Default rate limit on "resend requested" logging ("5 logs per 60s
/// window, then suppressed until the window rolls over"), overridable via
/// [`crate::config::ProtocolConfig::resend_log_burst`] /
/// `resend_log_window`.
const DEFAULT_LOG_WINDOW: Duration = Duration::from_secs(60);
const DEFAULT_LOG_BURST: u32 = 5;

pub struct ResendLogLimiter {
    window_start: Option<Instant>,
    count: u32,
    burst: u32,
    window: Duration,
}

impl Default for ResendLogLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_BURST, DEFAULT_LOG_WINDOW)
    }
}

impl ResendLogLimiter {
    pub fn new(burst: u32, window: Duration) -> Self {
        Self { window_start: None, count: 0, burst, window }
    }

    /// Returns `true` if this occurrence should actually be logged.
    pub fn allow(&mut self, now: Instant) -> bool {
        match self.window_start {
            Some(start) if now.duration_since(start) < self.window => {
                if self.count < self.burst {
                    self.count += 1;
                    true
                } else {
                    false
                }
            },
            _ => {
                self.window_start = Some(now);
                self.count = 1;
                true
            },
        }
    }
}

/// Outcome of handling one `Resend: N`.
pub enum ResendOutcome {
    /// `N == current_line` and no resend window is already open: the
    /// previous line was acked twice (a timeout re-sent a line firmware had
    /// already seen). Nothing to do.
    DoubleAck,
    /// A resend for a line still within lines sent before the *first*
    /// resend request in this window; firmware is catching up on a
    /// checksum/linenumber error it already reported. Caller should bump
    /// `resend.count` and otherwise ignore.
    Stale,
    /// The resend window is opened/extended; caller should drive
    /// `next()` repeatedly until it returns `None`.
    Opened,
    /// `N` isn't in history and the channel isn't busy: ignore (nothing we
    /// can do, and firmware isn't waiting on a job to be cancelled).
    UnknownIgnored,
}

/// Decides how to handle one `Resend: N` request from firmware.
/// `resend_active`/`resend_requested`/`resend_count` describe the window's
/// state *before* this call; `in_history` is whether `requested` is still
/// in the line history; `busy` is `ProtocolState::is_busy()`.
///
/// Returns `Err` only when the channel is busy and the requested line is
/// unrecoverable (caller should cancel the job with an error).
pub fn begin(
    requested: u64,
    current_line: u64,
    resend_active: bool,
    resend_requested: Option<u64>,
    resend_count: u64,
    last_error: Option<ErrorKind>,
    in_history: bool,
    busy: bool,
) -> Result<ResendOutcome, ProtocolError> {
    if requested == current_line && !resend_active {
        return Ok(ResendOutcome::DoubleAck);
    }

    if last_error == Some(ErrorKind::LineNumber)
        && Some(requested) == resend_requested
        && current_line > requested
        && resend_count < current_line - requested - 1
    {
        return Ok(ResendOutcome::Stale);
    }

    if !in_history {
        if busy {
            return Err(ProtocolError::LineNumberUnknown { requested });
        }
        return Ok(ResendOutcome::UnknownIgnored);
    }

    Ok(ResendOutcome::Opened)
}

/// Pulls the next entry to re-transmit out of `history`, advancing the
/// cursor and reporting whether the window has now closed.
///
/// Mirrors `_send_next_from_resend`'s decrement-then-increment cycle: the
/// cursor climbs line-by-line from `next_to_resend` up to (but not
/// including) `current_line`, at which point the window is closed.
pub fn next(
    next_to_resend: &mut u64,
    current_line: u64,
    history: &History,
) -> Result<Option<Entry>, ProtocolError> {
    if *next_to_resend >= current_line {
        return Ok(None);
    }

    let line_number = *next_to_resend;
    let bytes = history.get(line_number)?;
    *next_to_resend += 1;

    let command = crate::command::to_command(
        String::from_utf8_lossy(&bytes).into_owned(),
        None,
        vec!["source:resend".into()],
    );
    Ok(Some(Entry::resend(command, line_number)))
}

/// `true` once `next_to_resend` has caught up to `current_line`: the resend
/// window closes the moment the cursor reaches the line currently in flight.
pub fn window_closed(next_to_resend: u64, current_line: u64) -> bool {
    next_to_resend >= current_line
}

pub fn target() -> Target {
    Target::Resend
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn begin_rejects_unknown_line_when_busy() {
        let err = begin(10, 12, false, None, 0, None, false, true).unwrap_err();
        assert!(matches!(err, ProtocolError::LineNumberUnknown { requested: 10 }));
    }

    #[test]
    fn begin_ignores_unknown_line_when_idle() {
        let outcome = begin(10, 12, false, None, 0, None, false, false).unwrap();
        assert!(matches!(outcome, ResendOutcome::UnknownIgnored));
    }

    #[test]
    fn begin_detects_double_ack() {
        let outcome = begin(5, 5, false, None, 0, None, true, false).unwrap();
        assert!(matches!(outcome, ResendOutcome::DoubleAck));
    }

    #[test]
    fn begin_detects_stale_request() {
        let outcome = begin(5, 10, false, Some(5), 2, Some(ErrorKind::LineNumber), true, false).unwrap();
        assert!(matches!(outcome, ResendOutcome::Stale));
    }

    #[test]
    fn begin_opens_window_for_past_line() {
        let outcome = begin(3, 7, false, None, 0, None, true, false).unwrap();
        assert!(matches!(outcome, ResendOutcome::Opened));
    }

    #[test]
    fn begin_reopens_while_already_active() {
        // requested == current_line is only a double-ack when no window is
        // already open; an active window re-targeting the in-flight line is
        // a normal (if unusual) extension.
        let outcome = begin(5, 5, true, Some(4), 0, None, true, false).unwrap();
        assert!(matches!(outcome, ResendOutcome::Opened));
    }

    #[test]
    fn next_walks_history_then_closes() {
        let mut history = History::new(10);
        history.append(3, Bytes::from_static(b"N3 G1 X1*12"));
        history.append(4, Bytes::from_static(b"N4 G1 X2*13"));

        let mut cursor = 3u64;
        let first = next(&mut cursor, 5, &history).unwrap().unwrap();
        assert_eq!(first.line_number, Some(3));
        let second = next(&mut cursor, 5, &history).unwrap().unwrap();
        assert_eq!(second.line_number, Some(4));
        assert!(next(&mut cursor, 5, &history).unwrap().is_none());
        assert!(window_closed(cursor, 5));
    }

    #[test]
    fn log_limiter_allows_burst_then_suppresses() {
        let mut limiter = ResendLogLimiter::default();
        let now = Instant::now();
        for _ in 0..DEFAULT_LOG_BURST {
            assert!(limiter.allow(now));
        }
        assert!(!limiter.allow(now));
    }

    #[test]
    fn log_limiter_resets_after_window() {
        let mut limiter = ResendLogLimiter::default();
        let start = Instant::now();
        assert!(limiter.allow(start));
        let later = start + DEFAULT_LOG_WINDOW + Duration::from_secs(1);
        assert!(limiter.allow(later));
    }
}
