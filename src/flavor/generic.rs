//! The `generic` flavor: the root flavor assumed before firmware
//! identification, and the fallback if no more specific flavor claims the
//! connected printer. Matching follows the common subset RepRap firmwares
//! agree on.

use std::collections::BTreeMap;

use itertools::Itertools;

use crate::command::{to_command, Command};
use crate::flavor::{
    Emitters, ErrorKind, Flavor, HomeArgs, MatchOutcome, MessageEntry, MessageName, MoveArgs,
    Payload, Policy,
};

fn match_ok(_line: &str, lower: &str) -> MatchOutcome {
    if lower == "ok" {
        MatchOutcome::Matched
    } else if lower.starts_with("ok ") || lower.starts_with("ok\t") {
        // Marlin's M105 reply (and its temperature autoreports) put the
        // report on the same line as the `ok`, e.g. "ok T:210 /210 B:60
        // /60": let a later entry also see the line for that payload.
        MatchOutcome::MatchedContinue
    } else {
        MatchOutcome::NoMatch
    }
}

fn match_wait(_line: &str, lower: &str) -> MatchOutcome {
    if lower == "wait" { MatchOutcome::Matched } else { MatchOutcome::NoMatch }
}

fn match_start(_line: &str, lower: &str) -> MatchOutcome {
    if lower == "start" { MatchOutcome::Matched } else { MatchOutcome::NoMatch }
}

fn match_resend(_line: &str, lower: &str) -> MatchOutcome {
    if lower.starts_with("resend:") || lower.starts_with("rs ") {
        MatchOutcome::Matched
    } else {
        MatchOutcome::NoMatch
    }
}

fn parse_resend(line: &str, lower: &str) -> Option<Payload> {
    let rest = if let Some(r) = lower.strip_prefix("resend:") {
        &line[line.len() - r.len()..]
    } else {
        line.strip_prefix("rs ").or_else(|| line.strip_prefix("RS "))?
    };
    let n: u64 = rest.trim().parse().ok()?;
    Some(Payload::Resend { line_number: n })
}

fn match_ignore_ok(_line: &str, lower: &str) -> MatchOutcome {
    if lower.starts_with("//action:ignore_ok") {
        MatchOutcome::Matched
    } else {
        MatchOutcome::NoMatch
    }
}

fn match_temperature(_line: &str, lower: &str) -> MatchOutcome {
    if (lower.contains("t:") || lower.starts_with("ok t:")) && lower.contains('/') {
        MatchOutcome::MatchedContinue
    } else {
        MatchOutcome::NoMatch
    }
}

/// Parses `T:23.4/0.0 B:22.1/0.0 T0:23.4/0.0` style temperature reports.
fn parse_temperature(line: &str, _lower: &str) -> Option<Payload> {
    // Some firmwares (Marlin) insert a space before the "/target" half of a
    // reading, e.g. "T:23.4 /0.0"; normalize that away before tokenizing.
    let normalized = line.replace(" /", "/");

    // A firmware occasionally echoes the active hotend as both `T:` and
    // `T0:` in the same report; keep the first (most specific) reading.
    let temps: Vec<(String, Option<f64>, Option<f64>)> = normalized
        .split_whitespace()
        .filter_map(|token| {
            let (label, vals) = token.split_once(':')?;
            let (actual_s, target_s) = vals.split_once('/')?;
            let actual: Option<f64> = actual_s.parse().ok();
            let target: Option<f64> = target_s.parse().ok();
            if actual.is_none() && target.is_none() {
                return None;
            }
            let key = match label {
                "T" => "T0".to_string(),
                "B" => "B".to_string(),
                other if other.starts_with('T') => other.to_string(),
                _ => return None,
            };
            Some((key, actual, target))
        })
        .unique_by(|(key, ..)| key.clone())
        .collect();

    if temps.is_empty() {
        return None;
    }

    let max_tool_num = temps
        .iter()
        .filter_map(|(key, ..)| key.strip_prefix('T').and_then(|n| n.parse::<u32>().ok()))
        .max()
        .unwrap_or(0);

    Some(Payload::Temperature { max_tool_num, temps, heatup_detected: false })
}

fn match_firmware_info(_line: &str, lower: &str) -> MatchOutcome {
    if lower.starts_with("firmware_name:") {
        MatchOutcome::Matched
    } else {
        MatchOutcome::NoMatch
    }
}

fn parse_firmware_info(line: &str, _lower: &str) -> Option<Payload> {
    let mut info = BTreeMap::new();
    let mut name = String::new();
    for (i, token) in line.split_whitespace().enumerate() {
        if let Some((key, val)) = token.split_once(':') {
            if key.eq_ignore_ascii_case("firmware_name") {
                name = val.to_string();
            }
            info.insert(key.to_string(), val.to_string());
        } else if i == 0 {
            continue;
        }
    }
    if name.is_empty() {
        return None;
    }
    Some(Payload::FirmwareInfo { name, info })
}

fn match_firmware_capability(_line: &str, lower: &str) -> MatchOutcome {
    if lower.starts_with("cap:") { MatchOutcome::Matched } else { MatchOutcome::NoMatch }
}

fn parse_firmware_capability(line: &str, _lower: &str) -> Option<Payload> {
    let rest = line.strip_prefix("Cap:").or_else(|| line.strip_prefix("CAP:"))?;
    let (cap, enabled) = rest.rsplit_once(':')?;
    let enabled = enabled.trim() == "1";
    Some(Payload::FirmwareCapability { cap: cap.to_string(), enabled })
}

fn match_sd_init_ok(_line: &str, lower: &str) -> MatchOutcome {
    if lower.starts_with("sd card ok") || lower.starts_with("sd card detected") {
        MatchOutcome::Matched
    } else {
        MatchOutcome::NoMatch
    }
}

fn match_sd_init_fail(_line: &str, lower: &str) -> MatchOutcome {
    if lower.starts_with("sd init fail") || lower.starts_with("volume.init failed") {
        MatchOutcome::Matched
    } else {
        MatchOutcome::NoMatch
    }
}

fn match_sd_begin_file_list(_line: &str, lower: &str) -> MatchOutcome {
    if lower.starts_with("begin file list") { MatchOutcome::Matched } else { MatchOutcome::NoMatch }
}

fn match_sd_end_file_list(_line: &str, lower: &str) -> MatchOutcome {
    if lower.starts_with("end file list") { MatchOutcome::Matched } else { MatchOutcome::NoMatch }
}

fn match_sd_file_opened(_line: &str, lower: &str) -> MatchOutcome {
    if lower.starts_with("file opened:") { MatchOutcome::Matched } else { MatchOutcome::NoMatch }
}

fn parse_sd_file_opened(line: &str, _lower: &str) -> Option<Payload> {
    let rest = line.strip_prefix("File opened:").or_else(|| line.strip_prefix("file opened:"))?;
    let (name, size_part) = rest.rsplit_once("Size:").or_else(|| rest.rsplit_once("size:"))?;
    let size: u64 = size_part.trim().parse().ok()?;
    Some(Payload::SdFileOpened { name: name.trim().to_string(), size })
}

fn match_sd_done_printing(_line: &str, lower: &str) -> MatchOutcome {
    if lower.starts_with("done printing file") { MatchOutcome::Matched } else { MatchOutcome::NoMatch }
}

fn match_sd_printing_byte(_line: &str, lower: &str) -> MatchOutcome {
    if lower.starts_with("sd printing byte") { MatchOutcome::Matched } else { MatchOutcome::NoMatch }
}

fn parse_sd_printing_byte(line: &str, _lower: &str) -> Option<Payload> {
    let rest = line.rsplit(' ').next()?;
    let (current_s, total_s) = rest.split_once('/')?;
    let current: u64 = current_s.trim().parse().ok()?;
    let total: u64 = total_s.trim().parse().ok()?;
    Some(Payload::SdPrintingByte { current, total })
}

fn match_error_linenumber(_line: &str, lower: &str) -> Option<ErrorKind> {
    if lower.contains("linenumber") || lower.contains("line number") {
        Some(ErrorKind::LineNumber)
    } else {
        None
    }
}

fn match_error_checksum(_line: &str, lower: &str) -> Option<ErrorKind> {
    if lower.contains("checksum") { Some(ErrorKind::Checksum) } else { None }
}

fn emit_hello() -> Option<Command> {
    // Ask for an identification report rather than reset line numbering
    // here; `set_line` is issued separately once the connection handshake
    // actually needs to (re)synchronize numbering.
    Some(to_command("M115", None, vec![]))
}

fn emit_set_line(n: u64) -> Command {
    to_command(format!("M110 N{n}"), None, vec![])
}

fn emit_move(args: MoveArgs) -> Command {
    let mut line = String::from("G1");
    if args.relative {
        line = "G91\nG1".to_string();
    }
    if let Some(x) = args.x {
        line.push_str(&format!(" X{x}"));
    }
    if let Some(y) = args.y {
        line.push_str(&format!(" Y{y}"));
    }
    if let Some(z) = args.z {
        line.push_str(&format!(" Z{z}"));
    }
    if let Some(e) = args.e {
        line.push_str(&format!(" E{e}"));
    }
    if let Some(f) = args.feedrate {
        line.push_str(&format!(" F{f}"));
    }
    to_command(line, None, vec![])
}

fn emit_home(args: HomeArgs) -> Command {
    let mut line = String::from("G28");
    if args.x {
        line.push_str(" X0");
    }
    if args.y {
        line.push_str(" Y0");
    }
    if args.z {
        line.push_str(" Z0");
    }
    to_command(line, None, vec![])
}

fn emit_get_temp() -> Command {
    to_command(
        "M105",
        Some(crate::command::CommandType::Named("temperature".into())),
        vec![],
    )
}

fn emit_emergency_stop() -> Command {
    to_command("M112", None, vec![])
}

fn emit_autoreport_temperature(interval: u32) -> Command {
    to_command(format!("M155 S{interval}"), None, vec![])
}

fn emit_autoreport_sd_status(interval: u32) -> Command {
    to_command(format!("M27 S{interval}"), None, vec![])
}

fn identifier(_name: &str, _info: &BTreeMap<String, String>) -> bool {
    // Generic never self-identifies; it's the fallback installed at
    // connect time and replaced only by a more specific flavor.
    false
}

pub fn flavor() -> Flavor {
    Flavor {
        key: "generic",
        identifier,
        messages: vec![
            MessageEntry { name: MessageName::CommOk, matcher: match_ok, parser: None },
            MessageEntry { name: MessageName::CommWait, matcher: match_wait, parser: None },
            MessageEntry { name: MessageName::CommStart, matcher: match_start, parser: None },
            MessageEntry {
                name: MessageName::CommResend,
                matcher: match_resend,
                parser: Some(parse_resend),
            },
            MessageEntry {
                name: MessageName::CommIgnoreOk,
                matcher: match_ignore_ok,
                parser: None,
            },
            MessageEntry {
                name: MessageName::Temperature,
                matcher: match_temperature,
                parser: Some(parse_temperature),
            },
            MessageEntry {
                name: MessageName::FirmwareInfo,
                matcher: match_firmware_info,
                parser: Some(parse_firmware_info),
            },
            MessageEntry {
                name: MessageName::FirmwareCapability,
                matcher: match_firmware_capability,
                parser: Some(parse_firmware_capability),
            },
            MessageEntry { name: MessageName::SdInitOk, matcher: match_sd_init_ok, parser: None },
            MessageEntry {
                name: MessageName::SdInitFail,
                matcher: match_sd_init_fail,
                parser: None,
            },
            MessageEntry {
                name: MessageName::SdBeginFileList,
                matcher: match_sd_begin_file_list,
                parser: None,
            },
            MessageEntry {
                name: MessageName::SdEndFileList,
                matcher: match_sd_end_file_list,
                parser: None,
            },
            MessageEntry {
                name: MessageName::SdFileOpened,
                matcher: match_sd_file_opened,
                parser: Some(parse_sd_file_opened),
            },
            MessageEntry {
                name: MessageName::SdDonePrinting,
                matcher: match_sd_done_printing,
                parser: None,
            },
            MessageEntry {
                name: MessageName::SdPrintingByte,
                matcher: match_sd_printing_byte,
                parser: Some(parse_sd_printing_byte),
            },
        ],
        errors: vec![
            (ErrorKind::LineNumber, match_error_linenumber),
            (ErrorKind::Checksum, match_error_checksum),
        ],
        emitters: Emitters {
            hello: Some(emit_hello),
            set_line: emit_set_line,
            move_cmd: emit_move,
            home: emit_home,
            get_temp: emit_get_temp,
            emergency_stop: emit_emergency_stop,
            autoreport_temperature: emit_autoreport_temperature,
            autoreport_sd_status: emit_autoreport_sd_status,
        },
        policy: Policy {
            checksum_requiring_commands: vec!["M110".into(), "M112".into()],
            long_running_commands: vec![
                "G4".into(),
                "M109".into(),
                "M190".into(),
                "M116".into(),
                "M400".into(),
            ],
            always_send_checksum: false,
            never_send_checksum: false,
            unknown_with_checksum: false,
            unknown_requires_ack: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_ok_and_resend() {
        let f = flavor();
        assert_eq!(
            f.dispatch_message("ok", "ok"),
            vec![(MessageName::CommOk, MatchOutcome::Matched, None)]
        );
        let matches = f.dispatch_message("Resend: 5", "resend: 5");
        let (name, _, payload) = matches.into_iter().next().unwrap();
        assert_eq!(name, MessageName::CommResend);
        assert_eq!(payload, Some(Payload::Resend { line_number: 5 }));
    }

    #[test]
    fn parses_temperature_report() {
        let f = flavor();
        let matches = f.dispatch_message("T:23.4 /0.0 B:22.1 /0.0", "t:23.4 /0.0 b:22.1 /0.0");
        let (name, _, payload) = matches.into_iter().next().unwrap();
        assert_eq!(name, MessageName::Temperature);
        assert!(matches!(payload, Some(Payload::Temperature { .. })));
    }

    #[test]
    fn parses_firmware_info() {
        let f = flavor();
        let matches = f.dispatch_message("FIRMWARE_NAME:Repetier", "firmware_name:repetier");
        let (name, _, payload) = matches.into_iter().next().unwrap();
        assert_eq!(name, MessageName::FirmwareInfo);
        assert!(matches!(payload, Some(Payload::FirmwareInfo { .. })));
    }

    #[test]
    fn ok_with_inline_temperature_report_dispatches_both() {
        // Marlin's M105 reply is literally an "ok" line with the
        // temperature report riding along on the same line.
        let f = flavor();
        let matches = f.dispatch_message(
            "ok T:210.0 /210.0 B:60.0 /60.0",
            "ok t:210.0 /210.0 b:60.0 /60.0",
        );
        let names: Vec<_> = matches.iter().map(|(name, ..)| *name).collect();
        assert_eq!(names, vec![MessageName::CommOk, MessageName::Temperature]);
    }
}
