//! Receive dispatcher: turns a raw line from firmware into
//! state updates, queued follow-up commands, and listener notifications.
//!
//! One line may need none, one, or several of these effects (e.g. a
//! `Resend:` line both opens a resend window and is itself "handled", so no
//! `on_protocol_unmatched_line` fires). Rather than mutate the engine
//! directly mid-match, `handle_line` returns the handful of side effects
//! the caller (the receive task in `protocol.rs`) should apply — this
//! keeps the dispatcher itself free of anything that needs to `.await`.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::flavor::{self, ErrorKind, FlavorHandle, MessageName, Payload};
use crate::internal::Internal;
use crate::listener::ProtocolListener;
use crate::resend::{self, ResendLogLimiter, ResendOutcome};
use crate::state::ProtocolState;

/// Heatup completion tolerance in degrees ("temperature is
/// considered reached within a small tolerance of its target").
const HEATUP_EPSILON: f64 = 0.5;

/// A side effect `handle_line` asks the caller to apply. More than one may
/// be returned for a single line (e.g. `FlavorSwitched` plus `SendHello`).
#[derive(Debug, PartialEq)]
pub enum Effect {
    /// `CONNECTING -> CONNECTED` just fired (on `start` or the first `ok`):
    /// caller should send `command_set_line(0)`, grant one credit, and
    /// start the temperature poller.
    ConnectedEntry,
    /// A resend window has opened; caller should start pulling entries via
    /// [`crate::resend::next`].
    ResendWindowOpened,
    /// The engine identified a more specific flavor and should use it from
    /// here on.
    FlavorSwitched { key: &'static str },
    /// firmware reported being done with the current job.
    SdPrintFinished,
    /// A resend was requested for a line no longer in history while the
    /// channel was busy; caller should cancel the active job with an error.
    CancelJobWithError,
    /// Firmware just advertised `Cap:AUTOREPORT_TEMP:1`; caller should
    /// request periodic temperature pushes instead of waiting on the poller.
    AutoreportTempCapable,
}

pub struct Dispatcher {
    internal: Arc<Internal>,
    flavor: FlavorHandle,
    listener: Arc<dyn ProtocolListener>,
    resend_log: Mutex<ResendLogLimiter>,
}

impl Dispatcher {
    pub fn new(
        internal: Arc<Internal>,
        flavor: FlavorHandle,
        listener: Arc<dyn ProtocolListener>,
        resend_log_burst: u32,
        resend_log_window: std::time::Duration,
    ) -> Self {
        Self {
            internal,
            flavor,
            listener,
            resend_log: Mutex::new(ResendLogLimiter::new(resend_log_burst, resend_log_window)),
        }
    }

    pub fn flavor_key(&self) -> &'static str {
        self.flavor.read().key
    }

    /// Normalizes a raw received line: strips embedded NULs (some firmwares
    /// pad partial writes with them) and surrounding whitespace, and
    /// produces the lowercase mirror matchers key off.
    fn normalize(raw: &str) -> (String, String) {
        let cleaned: String = raw.chars().filter(|c| *c != '\0').collect();
        let trimmed = cleaned.trim().to_string();
        let lower = trimmed.to_ascii_lowercase();
        (trimmed, lower)
    }

    /// Processes one received line, applying state/bookkeeping changes
    /// in-place and returning the effects the caller must act on.
    pub fn handle_line(&self, raw: &str) -> Vec<Effect> {
        let (line, lower) = Self::normalize(raw);
        if line.is_empty() {
            return Vec::new();
        }

        {
            let mut timeout = self.internal.timeout.lock();
            timeout.consecutive = 0;
            timeout.deadline = None;
        }

        let mut effects = Vec::new();

        {
            let flavor = self.flavor.read();
            if let Some(kind) = flavor.dispatch_error(&line, &lower) {
                self.internal.resend.lock().last_error = Some(kind);
                warn!(?kind, %line, "firmware reported a communication error");
            }
        }

        let dispatched = {
            let flavor = self.flavor.read();
            flavor.dispatch_message(&line, &lower)
        };

        if dispatched.is_empty() {
            if !self.maybe_sd_file_entry(&line) {
                self.listener.on_protocol_unmatched_line(&line);
            }
            return effects;
        }

        for (name, _, payload) in dispatched {
            self.apply_message(name, payload, &mut effects);
        }

        effects
    }

    /// Applies one matched message entry's built-in handler. Split out of
    /// `handle_line` so a line that matches several entries in a row (e.g.
    /// an `ok` with an inline temperature report) runs each handler in
    /// declaration order instead of only the first.
    fn apply_message(&self, name: MessageName, payload: Option<Payload>, effects: &mut Vec<Effect>) {
        match name {
            MessageName::CommStart => {
                if self.internal.current_state() != ProtocolState::Connected
                    && self.internal.transition(ProtocolState::Connected).is_some()
                {
                    effects.push(Effect::ConnectedEntry);
                }
            },
            MessageName::CommOk => self.on_ok(effects),
            MessageName::CommWait => {
                if self.internal.current_state().is_operational() {
                    self.internal.credit.set();
                }
            },
            MessageName::CommIgnoreOk => {
                self.internal.flags.ignore_ok.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
            },
            MessageName::CommResend => {
                if let Some(Payload::Resend { line_number }) = payload {
                    self.on_resend(line_number, effects);
                }
            },
            MessageName::Temperature => {
                if let Some(Payload::Temperature { temps, .. }) = payload {
                    self.on_temperature(temps);
                }
            },
            MessageName::FirmwareInfo => {
                if let Some(Payload::FirmwareInfo { name, info }) = payload {
                    self.on_firmware_info(name, info, effects);
                }
            },
            MessageName::FirmwareCapability => {
                if let Some(Payload::FirmwareCapability { cap, enabled }) = payload {
                    if cap == "AUTOREPORT_TEMP" && enabled {
                        effects.push(Effect::AutoreportTempCapable);
                    }
                    self.internal.firmware.lock().capabilities.insert(cap, enabled);
                }
            },
            MessageName::SdInitOk => {
                let mut sd = self.internal.sd.lock();
                sd.available = true;
            },
            MessageName::SdInitFail => {
                self.internal.sd.lock().available = false;
            },
            MessageName::SdBeginFileList => {
                self.internal.sd.lock().files_temp = Some(Vec::new());
            },
            MessageName::SdEndFileList => {
                let files = {
                    let mut sd = self.internal.sd.lock();
                    sd.files_temp.take().unwrap_or_default()
                };
                self.internal.sd.lock().files = files.clone();
                if self.internal.flags.trigger_events() {
                    self.listener.on_protocol_sd_file_list(&files);
                }
            },
            MessageName::SdFileOpened => {
                if let Some(Payload::SdFileOpened { name, size }) = payload {
                    if self.internal.flags.trigger_events() {
                        self.listener.on_protocol_file_print_started(&name, size);
                    }
                }
            },
            MessageName::SdPrintingByte => {
                if let Some(Payload::SdPrintingByte { current, total }) = payload {
                    if self.internal.flags.trigger_events() {
                        self.listener.on_protocol_sd_status(current, total);
                    }
                }
            },
            MessageName::SdDonePrinting => {
                effects.push(Effect::SdPrintFinished);
                if self.internal.flags.trigger_events() {
                    self.listener.on_protocol_file_print_done();
                }
            },
            _ => {},
        }
    }

    /// While a `begin file list`/`end file list` block is open, any line no
    /// registered matcher claims is treated as one SD directory entry
    /// (`SdEntry` has no fixed prefix to key a matcher off, unlike the
    /// other SD messages, so it's recognized here by context instead).
    /// Firmwares report entries as `<name> <size>`; a bare name with no
    /// trailing size is recorded with size 0.
    fn maybe_sd_file_entry(&self, line: &str) -> bool {
        let mut sd = self.internal.sd.lock();
        let Some(files) = sd.files_temp.as_mut() else { return false };
        let mut parts = line.rsplitn(2, ' ');
        let (name, size) = match (parts.next(), parts.next()) {
            (Some(size_str), Some(name)) if size_str.chars().all(|c| c.is_ascii_digit()) => {
                (name.trim().to_string(), size_str.parse().unwrap_or(0))
            },
            _ => (line.trim().to_string(), 0),
        };
        files.push((name, size));
        true
    }

    fn on_ok(&self, effects: &mut Vec<Effect>) {
        let had_ignore = self
            .internal
            .flags
            .ignore_ok
            .fetch_update(std::sync::atomic::Ordering::AcqRel, std::sync::atomic::Ordering::Acquire, |n| {
                if n > 0 { Some(n - 1) } else { None }
            })
            .is_ok();

        if had_ignore {
            debug!("ignoring ok per prior //action:ignore_ok request");
            return;
        }

        if self.internal.current_state() == ProtocolState::Connecting
            && self.internal.transition(ProtocolState::Connected).is_some()
        {
            effects.push(Effect::ConnectedEntry);
            return;
        }

        if self.internal.current_state().is_operational() {
            self.internal.credit.set();
        }

        self.internal.flags.set_long_running(false);

        let mut tool = self.internal.tool.lock();
        if let Some(former) = tool.former_tool.take() {
            tool.current_tool = former;
        }
        drop(tool);

        self.internal.finish_heatup();
    }

    fn on_resend(&self, requested: u64, effects: &mut Vec<Effect>) {
        let current_line = self.internal.line.lock().current_line;
        let in_history = self.internal.line.lock().history.contains(requested);
        let busy = self.internal.current_state().is_busy();

        let (resend_active, resend_requested, resend_count, last_error) = {
            let resend = self.internal.resend.lock();
            (
                self.internal.flags.resend_active(),
                resend.requested,
                resend.count,
                resend.last_error,
            )
        };
        // The firmware error that correlated with this resend has now been
        // consumed; clear it so it doesn't stick around and stale-match a
        // later, unrelated resend.
        self.internal.resend.lock().last_error = None;

        let now = Instant::now();
        if self.resend_log.lock().allow(now) {
            warn!(requested, current_line, "firmware requested resend");
        }

        match resend::begin(
            requested,
            current_line,
            resend_active,
            resend_requested,
            resend_count,
            last_error,
            in_history,
            busy,
        ) {
            Ok(ResendOutcome::DoubleAck) => {
                debug!(requested, "ignoring resend for the line we haven't sent yet");
            },
            Ok(ResendOutcome::Stale) => {
                debug!(requested, "ignoring stale resend request");
                self.internal.resend.lock().count += 1;
            },
            Ok(ResendOutcome::UnknownIgnored) => {
                tracing::error!(requested, "firmware requested resend of a line we don't have");
            },
            Ok(ResendOutcome::Opened) => {
                let mut resend_state = self.internal.resend.lock();
                resend_state.requested = Some(requested);
                resend_state.next_to_resend = Some(requested);
                resend_state.count = 0;
                drop(resend_state);

                self.internal.flags.set_resend_active(true);
                self.internal.send_queue.lock().send_queue.resend_active = true;
                effects.push(Effect::ResendWindowOpened);
            },
            Err(err) => {
                tracing::error!(requested, "firmware requested resend of a line we don't have; busy, cancelling");
                self.listener.on_protocol_error(&err);
                effects.push(Effect::CancelJobWithError);
            },
        }
    }

    fn on_temperature(&self, temps: Vec<(String, Option<f64>, Option<f64>)>) {
        let mut table = self.internal.temperatures.lock();
        for (key, actual, target) in &temps {
            table.insert(key.clone(), (*actual, *target));
        }
        let snapshot = table.clone();
        drop(table);

        let heating_done = self.internal.heating.lock().active
            && temps.iter().all(|(_, actual, target)| match (actual, target) {
                (Some(a), Some(t)) if *t > 0.0 => (*a - *t).abs() <= HEATUP_EPSILON,
                _ => true,
            });
        if heating_done {
            self.internal.flags.set_heating(false);
            self.internal.heating.lock().active = false;
        }

        self.listener.on_protocol_temperature_update(&snapshot);
    }

    fn on_firmware_info(
        &self,
        name: String,
        info: std::collections::BTreeMap<String, String>,
        effects: &mut Vec<Effect>,
    ) {
        {
            let mut firmware = self.internal.firmware.lock();
            firmware.identified = true;
            firmware.name = name.clone();
            firmware.info = info.clone();
        }

        for candidate in flavor::all_flavors() {
            if (candidate.identifier)(&name, &info) {
                let key = candidate.key;
                *self.flavor.write() = candidate;
                effects.push(Effect::FlavorSwitched { key });
                break;
            }
        }

        self.listener.on_protocol_firmware_info(&name, &info);
    }
}
