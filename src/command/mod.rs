//! Command model.
//!
//! Commands are immutable once constructed: the phase pipeline produces new
//! commands rather than mutating one in place.

use std::collections::BTreeMap;
use std::fmt;

/// Dedup bucket. `None` means the command never deduplicates against another
/// of the same kind.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CommandType {
    /// Dedup key derived from a gcode's letter+code, e.g. temperature polls.
    Gcode(String),
    /// An arbitrary caller-supplied dedup key.
    Named(String),
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gcode(s) | Self::Named(s) => write!(f, "{s}"),
        }
    }
}

/// Provenance / bookkeeping tag, e.g. `source:file`, `filepos:123`.
pub type Tag = String;

#[derive(Clone, Debug, PartialEq)]
pub struct Meta {
    pub command_type: Option<CommandType>,
    pub tags: Vec<Tag>,
}

impl Meta {
    pub fn new(command_type: Option<CommandType>, tags: Vec<Tag>) -> Self {
        Self { command_type, tags }
    }

    pub fn empty() -> Self {
        Self { command_type: None, tags: Vec::new() }
    }
}

impl Default for Meta {
    fn default() -> Self {
        Self::empty()
    }
}

/// A command sent to the firmware, or a host-side pseudo-command.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    /// A line that isn't a recognized G/M-code, sent to the firmware as-is.
    Generic { line: String, meta: Meta },
    /// A parsed gcode line, e.g. `G1 X10 Y20*`.
    Gcode {
        code: char,
        number: u32,
        subcode: Option<u32>,
        params: BTreeMap<char, String>,
        raw: String,
        meta: Meta,
    },
    /// A host-side `@…` pseudo-command. Never transmitted to the firmware.
    AtCommand { name: String, parameters: String, raw: String, meta: Meta },
}

impl Command {
    pub fn meta(&self) -> &Meta {
        match self {
            Self::Generic { meta, .. } => meta,
            Self::Gcode { meta, .. } => meta,
            Self::AtCommand { meta, .. } => meta,
        }
    }

    pub fn meta_mut(&mut self) -> &mut Meta {
        match self {
            Self::Generic { meta, .. } => meta,
            Self::Gcode { meta, .. } => meta,
            Self::AtCommand { meta, .. } => meta,
        }
    }

    pub fn command_type(&self) -> Option<&CommandType> {
        self.meta().command_type.as_ref()
    }

    pub fn with_tag(mut self, tag: impl Into<Tag>) -> Self {
        self.meta_mut().tags.push(tag.into());
        self
    }

    /// The line as it would be transmitted, excluding line number/checksum.
    pub fn line(&self) -> &str {
        match self {
            Self::Generic { line, .. } => line,
            Self::Gcode { raw, .. } => raw,
            Self::AtCommand { raw, .. } => raw,
        }
    }

    pub fn is_empty_line(&self) -> bool {
        self.line().trim().is_empty()
    }

    /// Gcode letter+number, e.g. `"G1"`, used as a key into flavor policy
    /// sets and `_gcode_<CODE>_<phase>` built-in handler tables.
    pub fn gcode_key(&self) -> Option<String> {
        match self {
            Self::Gcode { code, number, .. } => Some(format!("{code}{number}")),
            _ => None,
        }
    }
}

/// Parses a leading G/M/T token and its numeric parameters from a raw line,
/// e.g. `"G1 X10 Y20"` -> `code='G', number=1, params={'X': "10", 'Y': "20"}`.
///
/// Returns `None` if `line` doesn't start with a recognized gcode letter.
fn parse_gcode(line: &str) -> Option<(char, u32, Option<u32>, BTreeMap<char, String>)> {
    let trimmed = line.trim();
    let mut chars = trimmed.char_indices();
    let (_, first) = chars.next()?;
    let code = first.to_ascii_uppercase();
    if !matches!(code, 'G' | 'M' | 'T') {
        return None;
    }

    let rest = &trimmed[first.len_utf8()..];
    let digits_end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    if digits_end == 0 {
        return None;
    }
    let number: u32 = rest[..digits_end].parse().ok()?;

    let mut remainder = &rest[digits_end..];
    let mut subcode = None;
    if let Some(stripped) = remainder.strip_prefix('.') {
        let sub_end = stripped.find(|c: char| !c.is_ascii_digit()).unwrap_or(stripped.len());
        if sub_end > 0 {
            subcode = stripped[..sub_end].parse().ok();
            remainder = &stripped[sub_end..];
        }
    }

    let mut params = BTreeMap::new();
    for token in remainder.split_whitespace() {
        let mut tchars = token.char_indices();
        if let Some((_, letter)) = tchars.next() {
            if letter.is_ascii_alphabetic() {
                let value = &token[letter.len_utf8()..];
                params.insert(letter.to_ascii_uppercase(), value.to_string());
                continue;
            }
        }
        // Bare token with no leading letter (e.g. a checksum remnant);
        // ignore it rather than fail the whole parse.
    }

    Some((code, number, subcode, params))
}

/// Constructs the correct [`Command`] variant from a raw line. Idempotent:
/// passing an already-constructed value back through leaves it unchanged
/// except for merging in `command_type`/`tags` when supplied.
pub fn to_command(
    line: impl Into<String>,
    command_type: Option<CommandType>,
    tags: Vec<Tag>,
) -> Command {
    let raw = line.into();
    let meta = Meta::new(command_type, tags);

    if let Some(name) = raw.strip_prefix('@') {
        let mut parts = name.splitn(2, char::is_whitespace);
        let name = parts.next().unwrap_or_default().to_string();
        let parameters = parts.next().unwrap_or_default().trim().to_string();
        return Command::AtCommand { name, parameters, raw, meta };
    }

    match parse_gcode(&raw) {
        Some((code, number, subcode, params)) => {
            Command::Gcode { code, number, subcode, params, raw, meta }
        },
        None => Command::Generic { line: raw, meta },
    }
}
