//! Flavor table: an immutable, data-driven description of a
//! firmware dialect.
//!
//! Dispatch is explicit registration, not reflection: a [`Flavor`] is a
//! plain struct of typed function-pointer tables (matchers, parsers,
//! emitters) and policy flags, built once at registration time and
//! swapped atomically on identification.

pub mod generic;
pub mod marlin;

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::command::Command;

/// Result of running a matcher against a line. `MatchedContinue` lets a
/// later matcher in declaration order also see the same line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchOutcome {
    NoMatch,
    Matched,
    MatchedContinue,
}

/// The parsed payload for a message whose matcher fired. Variants cover
/// every built-in message handler the receive dispatcher attaches.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    None,
    Resend { line_number: u64 },
    Temperature { max_tool_num: u32, temps: Vec<(String, Option<f64>, Option<f64>)>, heatup_detected: bool },
    FirmwareInfo { name: String, info: BTreeMap<String, String> },
    FirmwareCapability { cap: String, enabled: bool },
    SdEntry { name: String, size: u64 },
    SdFileOpened { name: String, size: u64 },
    SdPrintingByte { current: u64, total: u64 },
}

/// Names of the built-in message handlers the receive dispatcher
/// attaches. Declaration order within a [`Flavor`]'s `messages` table is
/// the order matchers are tried against an incoming line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageName {
    CommOk,
    CommWait,
    CommStart,
    CommResend,
    CommTimeout,
    CommIgnoreOk,
    Temperature,
    FirmwareInfo,
    FirmwareCapability,
    SdInitOk,
    SdInitFail,
    SdBeginFileList,
    SdEntry,
    SdEndFileList,
    SdFileOpened,
    SdDonePrinting,
    SdPrintingByte,
}

/// Known communication error classes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    LineNumber,
    Checksum,
    Multiline,
}

pub type MatcherFn = fn(line: &str, lower: &str) -> MatchOutcome;
pub type ParserFn = fn(line: &str, lower: &str) -> Option<Payload>;
pub type ErrorMatcherFn = fn(line: &str, lower: &str) -> Option<ErrorKind>;

pub struct MessageEntry {
    pub name: MessageName,
    pub matcher: MatcherFn,
    pub parser: Option<ParserFn>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct MoveArgs {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
    pub e: Option<f64>,
    pub feedrate: Option<f64>,
    pub relative: bool,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct HomeArgs {
    pub x: bool,
    pub y: bool,
    pub z: bool,
}

pub struct Emitters {
    pub hello: Option<fn() -> Option<Command>>,
    pub set_line: fn(u64) -> Command,
    pub move_cmd: fn(MoveArgs) -> Command,
    pub home: fn(HomeArgs) -> Command,
    pub get_temp: fn() -> Command,
    pub emergency_stop: fn() -> Command,
    pub autoreport_temperature: fn(u32) -> Command,
    pub autoreport_sd_status: fn(u32) -> Command,
}

/// Policy flags governing checksum and ack behavior.
#[derive(Clone, Debug, Default)]
pub struct Policy {
    pub checksum_requiring_commands: Vec<String>,
    pub long_running_commands: Vec<String>,
    pub always_send_checksum: bool,
    pub never_send_checksum: bool,
    pub unknown_with_checksum: bool,
    pub unknown_requires_ack: bool,
}

impl Policy {
    pub fn requires_checksum(&self, gcode_key: Option<&str>) -> bool {
        gcode_key
            .map(|k| self.checksum_requiring_commands.iter().any(|c| c == k))
            .unwrap_or(false)
    }

    pub fn is_long_running(&self, gcode_key: Option<&str>) -> bool {
        gcode_key.map(|k| self.long_running_commands.iter().any(|c| c == k)).unwrap_or(false)
    }
}

/// A flavor shared between the receive dispatcher and the sending loop,
/// swapped atomically on firmware identification.
pub type FlavorHandle = Arc<RwLock<Flavor>>;

pub struct Flavor {
    pub key: &'static str,
    pub identifier: fn(firmware_name: &str, info: &BTreeMap<String, String>) -> bool,
    pub messages: Vec<MessageEntry>,
    pub errors: Vec<(ErrorKind, ErrorMatcherFn)>,
    pub emitters: Emitters,
    pub policy: Policy,
}

impl Flavor {
    /// Returns every matching message entry (and its parsed payload, if
    /// any), trying entries in declaration order. An entry whose parser
    /// returns `None` is treated as "message handled, no payload"
    /// (`FlavorParseFailure`, contained). Matching stops at the first entry
    /// that matches with plain `Matched`; an entry matching with
    /// `MatchedContinue` (e.g. an inline temperature report riding along on
    /// an `ok` line) lets subsequent entries also see the same line.
    pub fn dispatch_message(
        &self,
        line: &str,
        lower: &str,
    ) -> Vec<(MessageName, MatchOutcome, Option<Payload>)> {
        let mut matches = Vec::new();
        for entry in &self.messages {
            let outcome = (entry.matcher)(line, lower);
            if outcome == MatchOutcome::NoMatch {
                continue;
            }
            let payload = entry.parser.and_then(|p| p(line, lower));
            let keep_going = outcome == MatchOutcome::MatchedContinue;
            matches.push((entry.name, outcome, payload));
            if !keep_going {
                break;
            }
        }
        matches
    }

    pub fn dispatch_error(&self, line: &str, lower: &str) -> Option<ErrorKind> {
        self.errors.iter().find_map(|(kind, matcher)| matcher(line, lower).map(|_| *kind))
    }
}

/// Returns every statically-known flavor other than `generic`, in the order
/// they should be probed for identification against a firmware-info report.
pub fn all_flavors() -> Vec<Flavor> {
    vec![marlin::flavor()]
}
