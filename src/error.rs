//! Crate-wide error taxonomy .
//!
//! Each variant maps to one entry in the error taxonomy. Local errors
//! (`QueueDedup`, `HookFailure`, `FlavorParseFailure`) are contained at the
//! boundary that produces them and never escape as `Err` to a caller of
//! [`crate::protocol::Protocol`]; they exist here so they can be logged
//! uniformly and unit-tested.

use std::fmt;

/// A line number referenced by a resend request or history lookup.
pub type LineNumber = u64;

#[derive(Debug)]
pub enum ProtocolError {
    /// Firmware asked to resend a line still present in history.
    LineNumberMismatch { requested: LineNumber, current: LineNumber },
    /// Firmware asked to resend a line no longer (or never) in history.
    LineNumberUnknown { requested: LineNumber },
    /// Firmware reported a checksum error for a given line.
    ChecksumMismatch { line: LineNumber },
    /// No line was received within the configured deadline, `consecutive`
    /// times in a row.
    CommunicationTimeout { consecutive: u32 },
    /// The transport reported an unrecoverable failure.
    TransportFailure(String),
    /// A flavor matcher or parser aborted handling of a line.
    FlavorParseFailure { matcher: &'static str },
    /// A command could not be enqueued because its `type` was already
    /// present on the target track.
    QueueDedup { item_type: crate::command::CommandType },
    /// A phase-pipeline hook raised while processing a command.
    HookFailure { phase: &'static str, hook: &'static str },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LineNumberMismatch { requested, current } => write!(
                f,
                "resend requested for line {requested}, current line is {current}"
            ),
            Self::LineNumberUnknown { requested } => {
                write!(f, "resend requested for unknown line {requested}")
            },
            Self::ChecksumMismatch { line } => write!(f, "checksum mismatch on line {line}"),
            Self::CommunicationTimeout { consecutive } => {
                write!(f, "{consecutive} consecutive communication timeouts")
            },
            Self::TransportFailure(msg) => write!(f, "transport failure: {msg}"),
            Self::FlavorParseFailure { matcher } => {
                write!(f, "flavor parser for {matcher} returned no payload")
            },
            Self::QueueDedup { item_type } => {
                write!(f, "type {item_type:?} already queued")
            },
            Self::HookFailure { phase, hook } => {
                write!(f, "hook {hook} failed during {phase} phase")
            },
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<crate::history::HistoryError> for ProtocolError {
    fn from(value: crate::history::HistoryError) -> Self {
        match value {
            crate::history::HistoryError::NotFound { requested } => {
                Self::LineNumberUnknown { requested }
            },
        }
    }
}

impl From<crate::queue::send::EnqueueError> for ProtocolError {
    fn from(value: crate::queue::send::EnqueueError) -> Self {
        match value {
            crate::queue::send::EnqueueError::Dedup { item_type } => {
                Self::QueueDedup { item_type }
            },
        }
    }
}
