//! The engine itself: wires the admission pipeline, send/receive tasks,
//! and liveness ladder around a connected [`TransportHandle`], and exposes
//! the public surface a host application drives (`connect`, `process`,
//! `pause`, `move_to`, ...).
//!
//! One `CancellationToken` shared by every spawned task, `tokio::select!`
//! racing cancellation against real work, `tracing` for every state change
//! worth knowing about.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::{Mutex as SyncMutex, RwLock};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::command::Command;
use crate::config::ProtocolConfig;
use crate::dispatch::{Dispatcher, Effect};
use crate::error::ProtocolError;
use crate::flavor::{generic, FlavorHandle, HomeArgs, MoveArgs};
use crate::internal::Internal;
use crate::job::Job;
use crate::listener::ProtocolListener;
use crate::phase::{self, HookOutcome, Phase, Pipeline};
use crate::queue::send::{Entry, OnSent, SendQueue, Target};
use crate::queue::command::CommandQueue;
use crate::resend;
use crate::sending::{self, SendDecision};
use crate::state::ProtocolState;
use crate::timeout::TimeoutAction;
use crate::transport::{TransportHandle, TransportReader, TransportWriter};

/// The running protocol engine. Cheap to clone (it's always held behind an
/// `Arc`); every long-running task holds its own clone so the handle
/// outlives any individual connection.
pub struct Protocol {
    internal: Arc<Internal>,
    flavor: FlavorHandle,
    pipeline: Arc<Pipeline>,
    listener: Arc<dyn ProtocolListener>,
    config: ProtocolConfig,
    job: Arc<AsyncMutex<Option<Box<dyn Job>>>>,
    cancel: CancellationToken,
    writer: Arc<AsyncMutex<Option<Box<dyn TransportWriter>>>>,
    message_integrity: Arc<AtomicBool>,
    tasks: SyncMutex<Vec<JoinHandle<()>>>,
}

impl Protocol {
    pub fn new(config: ProtocolConfig, listener: Arc<dyn ProtocolListener>) -> Arc<Self> {
        let internal = Arc::new(Internal::new(config.history_capacity, config.max_credit));
        let flavor: FlavorHandle = Arc::new(RwLock::new(generic::flavor()));

        let mut pipeline = Pipeline::new();
        pipeline.add_builtin(Phase::Queuing, "M112", phase::builtin_m112(internal.clone()));
        pipeline.add_builtin(Phase::Queuing, "M110", phase::builtin_m110(internal.clone()));
        pipeline.add_builtin(Phase::Sent, "M109", phase::builtin_heater_sent(internal.clone()));
        pipeline.add_builtin(Phase::Sent, "M190", phase::builtin_heater_sent(internal.clone()));
        pipeline.add_builtin(Phase::Sent, "M116", phase::builtin_heater_sent(internal.clone()));
        pipeline.add_builtin(Phase::Sent, "M104", phase::builtin_track_temp_target(internal.clone()));
        pipeline.add_builtin(Phase::Sent, "M140", phase::builtin_track_temp_target(internal.clone()));
        pipeline.add_builtin(Phase::Sent, "M155", phase::builtin_track_autoreport_interval(internal.clone()));
        pipeline.add_builtin(Phase::Sent, "M27", phase::builtin_track_autoreport_interval(internal.clone()));
        pipeline.add_builtin(Phase::Sent, "G4", phase::builtin_extend_deadline_for_dwell(internal.clone()));
        pipeline.add_catch_all(
            Phase::Sent,
            phase::builtin_sent_catch_all_tracking(internal.clone(), listener.clone()),
        );
        let flavor_for_lr = flavor.clone();
        pipeline.add_catch_all(
            Phase::Queuing,
            phase::builtin_mark_long_running(internal.clone(), move |command| {
                flavor_for_lr.read().policy.is_long_running(command.gcode_key().as_deref())
            }),
        );

        Arc::new(Self {
            internal,
            flavor,
            pipeline: Arc::new(pipeline),
            listener,
            config,
            job: Arc::new(AsyncMutex::new(None)),
            cancel: CancellationToken::new(),
            writer: Arc::new(AsyncMutex::new(None)),
            message_integrity: Arc::new(AtomicBool::new(false)),
            tasks: SyncMutex::new(Vec::new()),
        })
    }

    pub fn state(&self) -> ProtocolState {
        self.internal.current_state()
    }

    // ---- connection lifecycle --------------------------------------

    /// Brings up a connection: stores the transport, runs the
    /// `DISCONNECTED -> CONNECTING` entry action (send hello), and spawns
    /// the sending, receiving, and liveness tasks.
    pub async fn connect(self: &Arc<Self>, transport: TransportHandle) {
        *self.writer.lock().await = Some(transport.writer);
        self.message_integrity.store(transport.message_integrity, Ordering::Release);

        if let Some(old) = self.internal.transition(ProtocolState::Connecting) {
            self.listener.on_protocol_state_change(old, ProtocolState::Connecting);
        }

        if let Some(hello) = (self.flavor.read().emitters.hello)() {
            self.write_direct_command(hello).await;
        }

        self.spawn_receiving(transport.reader);
        self.spawn_sending();
        self.spawn_liveness();
    }

    pub async fn disconnect(&self) {
        if let Some(old) = self.internal.transition(ProtocolState::Disconnected) {
            self.listener.on_protocol_state_change(old, ProtocolState::Disconnected);
        }
        *self.job.lock().await = None;
        self.cancel.cancel();
    }

    async fn teardown_with_error(&self, reason: &str) {
        warn!(reason, "tearing down connection");
        if let Some(old) = self.internal.transition(ProtocolState::DisconnectedWithError) {
            self.listener.on_protocol_state_change(old, ProtocolState::DisconnectedWithError);
        }
        *self.job.lock().await = None;
        self.cancel.cancel();
    }

    // ---- job control --------------------------------------------------

    pub async fn process(self: &Arc<Self>, job: Box<dyn Job>) {
        self.internal.flags.set_job_is_sd_streamed(job.is_sd_streamed());
        // A local gcode-stream job (lines fed in by the host itself, not
        // read off the printer's SD card) locks out externally-injected
        // commands (`only_from_job`) and suppresses job-progress events
        // (`trigger_events`) since the host already knows its own state;
        // an SD-streamed job is driven by firmware, so the host depends on
        // those same notifications to track progress.
        self.internal.flags.set_only_from_job(!job.is_sd_streamed());
        self.internal.flags.set_trigger_events(job.is_sd_streamed());
        *self.job.lock().await = Some(job);
        if let Some(old) = self.internal.transition(ProtocolState::Processing) {
            self.listener.on_protocol_state_change(old, ProtocolState::Processing);
        }
        self.internal.work.notify_one();
    }

    pub async fn pause(&self) {
        if let Some(old) = self.internal.transition(ProtocolState::Pausing) {
            self.listener.on_protocol_state_change(old, ProtocolState::Pausing);
            self.internal.flags.set_pending_pause(true);
        }
    }

    pub async fn resume(&self) {
        if let Some(old) = self.internal.transition(ProtocolState::Resuming) {
            self.listener.on_protocol_state_change(old, ProtocolState::Resuming);
        }
        if let Some(old) = self.internal.transition(ProtocolState::Processing) {
            self.listener.on_protocol_state_change(old, ProtocolState::Processing);
            self.internal.flags.set_pending_pause(false);
        }
        self.internal.work.notify_one();
    }

    pub async fn cancel_print(&self) {
        let state = self.internal.current_state();
        if !matches!(state, ProtocolState::Processing | ProtocolState::Paused) {
            return;
        }
        if let Some(old) = self.internal.transition(ProtocolState::Cancelling) {
            self.listener.on_protocol_state_change(old, ProtocolState::Cancelling);
        }
        *self.job.lock().await = None;
        {
            let mut queues = self.internal.send_queue.lock();
            queues.send_queue = SendQueue::new();
            queues.command_queue = CommandQueue::new();
        }
        self.internal.flags.set_pending_cancel(false);
        self.internal.flags.set_only_from_job(false);
        self.internal.flags.set_trigger_events(true);
        if let Some(old) = self.internal.transition(ProtocolState::Connected) {
            self.listener.on_protocol_state_change(old, ProtocolState::Connected);
        }
    }

    async fn finish_job(&self) {
        if let Some(old) = self.internal.transition(ProtocolState::Finishing) {
            self.listener.on_protocol_state_change(old, ProtocolState::Finishing);
        }
        *self.job.lock().await = None;
        self.internal.flags.set_job_is_sd_streamed(false);
        self.internal.flags.set_only_from_job(false);
        self.internal.flags.set_trigger_events(true);
        if let Some(old) = self.internal.transition(ProtocolState::Connected) {
            self.listener.on_protocol_state_change(old, ProtocolState::Connected);
        }
    }

    async fn cancel_job_with_error(&self) {
        *self.job.lock().await = None;
        self.internal.flags.set_only_from_job(false);
        self.internal.flags.set_trigger_events(true);
        if let Some(old) = self.internal.transition(ProtocolState::Cancelling) {
            self.listener.on_protocol_state_change(old, ProtocolState::Cancelling);
        }
        if let Some(old) = self.internal.transition(ProtocolState::Connected) {
            self.listener.on_protocol_state_change(old, ProtocolState::Connected);
        }
    }

    // ---- user-facing commands ------------------------------------------

    pub async fn move_to(&self, args: MoveArgs) {
        let cmd = (self.flavor.read().emitters.move_cmd)(args);
        self.queue_command(cmd, None);
    }

    pub async fn home(&self, args: HomeArgs) {
        let cmd = (self.flavor.read().emitters.home)(args);
        self.queue_command(cmd, None);
    }

    pub async fn change_tool(&self, tool: u32) {
        self.internal.tool.lock().current_tool = tool;
        self.queue_command(crate::command::to_command(format!("T{tool}"), None, vec![]), None);
    }

    pub async fn set_extruder_temperature(&self, tool: Option<u32>, celsius: f64) {
        let line = match tool {
            Some(t) => format!("M104 T{t} S{celsius}"),
            None => format!("M104 S{celsius}"),
        };
        self.queue_command(crate::command::to_command(line, None, vec![]), None);
    }

    pub async fn set_bed_temperature(&self, celsius: f64) {
        let line = format!("M140 S{celsius}");
        self.queue_command(crate::command::to_command(line, None, vec![]), None);
    }

    pub async fn send_commands(&self, lines: impl IntoIterator<Item = String>) {
        for line in lines {
            self.queue_command(
                crate::command::to_command(line, None, vec!["source:user".into()]),
                None,
            );
        }
    }

    pub async fn emergency_stop(&self) {
        self.queue_command(crate::command::to_command("M112", None, vec![]), None);
    }

    // ---- admission ------------------------------------------------------

    fn queue_command(&self, command: Command, on_sent: Option<OnSent>) {
        // `only_from_job` locks out externally-injected commands while a
        // local gcode-stream job owns the line; `M112` always gets through
        // regardless.
        if self.internal.flags.only_from_job() && command.gcode_key().as_deref() != Some("M112") {
            self.listener.on_protocol_log(&format!(
                "command suppressed: exclusive job active ({})",
                command.line()
            ));
            return;
        }
        let mut state = self.internal.send_queue.lock();
        if let Err(err) = state.command_queue.push(command, on_sent) {
            drop(state);
            self.listener.on_protocol_error(&err.into());
            return;
        }
        drop(state);
        self.internal.work.notify_one();
    }

    /// Runs `command` through `queuing` then `queued`. Returns `None` if a
    /// hook suppressed it, it expanded into several (each individually
    /// re-queued), or it was `M112` and got the emergency-stop bypass
    /// instead of ordinary admission.
    async fn run_admission_phases(&self, command: Command) -> Option<Command> {
        let command = match self.pipeline.process(Phase::Queuing, command) {
            HookOutcome::Continue(c) => c,
            HookOutcome::Suppress => return None,
            HookOutcome::Expand(cmds) => {
                for c in cmds {
                    self.queue_command(c, None);
                }
                return None;
            },
        };

        if command.gcode_key().as_deref() == Some("M112") {
            self.run_emergency_stop(command).await;
            return None;
        }

        // M0/M1 pause the job but are never transmitted to firmware.
        if matches!(command.gcode_key().as_deref(), Some("M0") | Some("M1")) {
            self.pause().await;
            return None;
        }

        // M25 pauses a host-streamed (non-SD) job but, unlike M0/M1, is
        // still transmitted: firmware's own M25 handling only matters for
        // an SD-resident print, so this is purely the host-side job pause.
        if command.gcode_key().as_deref() == Some("M25") && !self.internal.flags.job_is_sd_streamed() {
            self.pause().await;
        }

        match self.pipeline.process(Phase::Queued, command) {
            HookOutcome::Continue(c) => Some(c),
            HookOutcome::Suppress => None,
            HookOutcome::Expand(cmds) => {
                for c in cmds {
                    self.queue_command(c, None);
                }
                None
            },
        }
    }

    /// M112 bypasses the send queue entirely: the admission pipeline's
    /// `queuing`-phase built-in already deactivated it; this writes the
    /// checksummed stop command twice and tears the connection down.
    async fn run_emergency_stop(&self, command: Command) {
        self.internal.flags.deactivate();
        if self.config.emergency_stop_drops_heaters {
            self.internal.heating.lock().active = false;
            self.internal.flags.set_heating(false);
            for (_, target) in self.internal.temperatures.lock().values_mut() {
                *target = Some(0.0);
            }
        }
        let (first, second) = sending::emergency_stop_frames(&self.internal, &command);
        self.write_bytes(first).await;
        self.write_bytes(second).await;
        self.teardown_with_error("emergency stop (M112)").await;
    }

    /// Drains one unit of work — the command queue before the active job's
    /// own lines — onto the send queue. Returns whether it attempted
    /// anything at all (even if the attempt produced no send-queue entry,
    /// e.g. a suppressed hook), so the caller knows whether to try again.
    async fn try_continue_sending(&self) -> bool {
        let popped = self.internal.send_queue.lock().command_queue.pop();
        if let Some(entry) = popped {
            if let Some(command) = self.run_admission_phases(entry.command).await {
                let mut built = Entry::new(command);
                if let Some(cb) = entry.on_sent {
                    built = built.with_on_sent(cb);
                }
                if let Err(err) = self.internal.send_queue.lock().send_queue.put(built, Target::Send) {
                    self.listener.on_protocol_error(&err.into());
                }
            }
            return true;
        }

        if self.internal.current_state() != ProtocolState::Processing
            || self.internal.flags.job_is_sd_streamed()
        {
            return false;
        }

        let mut job_guard = self.job.lock().await;
        let Some(job) = job_guard.as_mut() else { return false };
        if !job.active() {
            drop(job_guard);
            self.finish_job().await;
            return false;
        }
        let Some(line) = job.get_next().await else { return false };
        drop(job_guard);

        let raw = crate::command::to_command(line, None, vec!["source:file".into()]);
        if let Some(command) = self.run_admission_phases(raw).await {
            if let Err(err) = self.internal.send_queue.lock().send_queue.put(Entry::new(command), Target::Send) {
                self.listener.on_protocol_error(&err.into());
            }
        }
        true
    }

    async fn next_send_entry(&self) -> Option<Entry> {
        loop {
            if let Some(entry) = self.internal.send_queue.lock().send_queue.pop() {
                return Some(entry);
            }
            if !self.try_continue_sending().await {
                return None;
            }
        }
    }

    /// `PROCESSING -> PAUSING` only finalizes to `PAUSED` once the send and
    /// command queues have fully drained and no resend window is open.
    fn maybe_finish_pause(&self) {
        if self.internal.current_state() == ProtocolState::Pausing
            && self.internal.send_queue.lock().send_queue.is_empty()
            && self.internal.send_queue.lock().command_queue.is_empty()
            && !self.internal.flags.resend_active()
        {
            if let Some(old) = self.internal.transition(ProtocolState::Paused) {
                self.listener.on_protocol_state_change(old, ProtocolState::Paused);
                self.internal.flags.set_pending_pause(false);
            }
        }
    }

    // ---- wire I/O -------------------------------------------------------

    async fn write_bytes(&self, bytes: Bytes) {
        let mut guard = self.writer.lock().await;
        if let Some(writer) = guard.as_mut() {
            if let Err(e) = writer.write_line(bytes).await {
                drop(guard);
                self.listener.on_protocol_error(&ProtocolError::TransportFailure(e.to_string()));
            }
        }
    }

    /// Sends a host-originated command (hello, `M110 N0`) straight to the
    /// wire, bypassing the admission queues but not the `queuing`-phase
    /// built-ins (M110's immediate line-reset in particular must still fire
    /// here, since this path never goes through `run_admission_phases`).
    async fn write_direct_command(&self, command: Command) {
        let command = match self.pipeline.process(Phase::Queuing, command) {
            HookOutcome::Continue(c) => c,
            HookOutcome::Suppress | HookOutcome::Expand(_) => return,
        };
        let entry = Entry::new(command);
        let decision = sending::process_entry(
            &self.internal,
            &self.flavor,
            &self.pipeline,
            entry,
            self.message_integrity.load(Ordering::Acquire),
        );
        if let SendDecision::Write { bytes, sent_phase_command, on_sent, .. } = decision {
            self.write_bytes(bytes).await;
            if let Some(cmd) = sent_phase_command {
                self.pipeline.process(Phase::Sent, cmd);
            }
            if let Some(cb) = on_sent {
                cb();
            }
        }
    }

    fn drain_resend_window(&self) {
        let mut queued = 0u32;
        loop {
            let mut resend_state = self.internal.resend.lock();
            let Some(mut cursor) = resend_state.next_to_resend else { break };
            let line_state = self.internal.line.lock();
            let current_line = line_state.current_line;
            let next = resend::next(&mut cursor, current_line, &line_state.history);
            drop(line_state);

            match next {
                Ok(Some(entry)) => {
                    resend_state.next_to_resend = Some(cursor);
                    drop(resend_state);
                    if self.internal.send_queue.lock().send_queue.put(entry, resend::target()).is_ok() {
                        queued += 1;
                    }
                },
                Ok(None) => {
                    resend_state.next_to_resend = None;
                    resend_state.requested = None;
                    drop(resend_state);
                    self.internal.flags.set_resend_active(false);
                    self.internal.send_queue.lock().send_queue.resend_active = false;
                    break;
                },
                Err(err) => {
                    drop(resend_state);
                    self.listener.on_protocol_error(&err);
                    break;
                },
            }
        }
        if queued > 0 {
            self.internal.work.notify_one();
        }
    }

    // ---- tasks ------------------------------------------------------------

    fn spawn_sending(self: &Arc<Self>) {
        let this = self.clone();
        let handle = tokio::spawn(async move { this.sending_loop().await });
        self.tasks.lock().push(handle);
    }

    async fn sending_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = self.internal.credit.wait() => {},
            }
            if self.cancel.is_cancelled() {
                return;
            }
            if !self.internal.flags.active() {
                continue;
            }

            let Some(entry) = self.next_send_entry().await else {
                self.internal.credit.set();
                self.maybe_finish_pause();
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = self.internal.work.notified() => {},
                }
                continue;
            };

            match sending::process_entry(
                &self.internal,
                &self.flavor,
                &self.pipeline,
                entry,
                self.message_integrity.load(Ordering::Acquire),
            ) {
                SendDecision::Skip => self.internal.credit.set(),
                SendDecision::Write { bytes, consumes_credit, on_sent, sent_phase_command } => {
                    self.write_bytes(bytes).await;
                    if let Some(command) = sent_phase_command {
                        self.pipeline.process(Phase::Sent, command);
                    }
                    if let Some(cb) = on_sent {
                        cb();
                    }
                    if !consumes_credit {
                        self.internal.credit.set();
                    }
                },
            }
        }
    }

    fn spawn_receiving(self: &Arc<Self>, reader: Box<dyn TransportReader>) {
        let this = self.clone();
        let handle = tokio::spawn(async move { this.receiving_loop(reader).await });
        self.tasks.lock().push(handle);
    }

    async fn receiving_loop(self: Arc<Self>, mut reader: Box<dyn TransportReader>) {
        let dispatcher = Dispatcher::new(
            self.internal.clone(),
            self.flavor.clone(),
            self.listener.clone(),
            self.config.resend_log_burst,
            self.config.resend_log_window,
        );
        loop {
            let line = tokio::select! {
                _ = self.cancel.cancelled() => return,
                line = reader.read_line() => line,
            };
            match line {
                Ok(Some(line)) => {
                    let effects = dispatcher.handle_line(&line);
                    self.apply_effects(effects).await;
                },
                Ok(None) => {
                    self.teardown_with_error("transport closed").await;
                    return;
                },
                Err(e) => {
                    self.teardown_with_error(&e.to_string()).await;
                    return;
                },
            }
        }
    }

    async fn apply_effects(self: &Arc<Self>, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::ConnectedEntry => {
                    let old = self.internal.current_state();
                    let _ = old;
                    self.listener.on_protocol_state_change(ProtocolState::Connecting, ProtocolState::Connected);
                    let set_line = (self.flavor.read().emitters.set_line)(0);
                    self.write_direct_command(set_line).await;
                    self.internal.credit.set();
                    self.spawn_temperature_poller();
                },
                Effect::ResendWindowOpened => self.drain_resend_window(),
                Effect::FlavorSwitched { key } => debug!(flavor = key, "firmware identified; switched flavor"),
                Effect::SdPrintFinished => {
                    if let Some(job) = self.job.lock().await.as_mut() {
                        job.mark_finished();
                    }
                    self.finish_job().await;
                },
                Effect::CancelJobWithError => self.cancel_job_with_error().await,
                Effect::AutoreportTempCapable => {
                    let interval = self.config.max_autoreport_interval_secs;
                    let command = (self.flavor.read().emitters.autoreport_temperature)(interval);
                    self.queue_command(command, None);
                },
            }
        }
    }

    fn spawn_temperature_poller(self: &Arc<Self>) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(this.config.max_autoreport_interval_secs.max(1) as u64));
            loop {
                tokio::select! {
                    _ = this.cancel.cancelled() => return,
                    _ = interval.tick() => {},
                }
                if !this.internal.current_state().is_operational() {
                    return;
                }
                let get_temp = (this.flavor.read().emitters.get_temp)();
                this.queue_command(get_temp, None);
            }
        });
        self.tasks.lock().push(handle);
    }

    fn spawn_liveness(self: &Arc<Self>) {
        let this = self.clone();
        let handle = tokio::spawn(async move { this.liveness_loop().await });
        self.tasks.lock().push(handle);
    }

    async fn liveness_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.liveness_poll_interval);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = interval.tick() => {},
            }

            let state = self.internal.current_state();
            if !state.is_connected_or_better() {
                continue;
            }

            let lapsed = {
                let mut timeout_state = self.internal.timeout.lock();
                let now = Instant::now();
                match timeout_state.deadline {
                    Some(d) if now >= d => {
                        let extension = timeout_state.pending_extension_secs;
                        timeout_state.pending_extension_secs = 0.0;
                        timeout_state.deadline = Some(now + crate::timeout::deadline(state, extension));
                        true
                    },
                    Some(_) => false,
                    None => {
                        timeout_state.deadline =
                            Some(now + crate::timeout::deadline(state, timeout_state.pending_extension_secs));
                        false
                    },
                }
            };
            if !lapsed {
                continue;
            }

            let long_running = self.internal.flags.long_running();
            let heating = self.internal.flags.heating();
            let resend_in_flight = self.internal.flags.resend_active();
            let consecutive = self.internal.timeout.lock().consecutive;
            let (new_consecutive, action) =
                crate::timeout::on_timeout(state, consecutive, long_running, heating, resend_in_flight);
            self.internal.timeout.lock().consecutive = new_consecutive;

            match action {
                TimeoutAction::ReemitResend => self.drain_resend_window(),
                TimeoutAction::FinishHeatup => self.internal.finish_heatup(),
                TimeoutAction::IgnoreLongRunning => {},
                TimeoutAction::TicklePrinting => {
                    let get_temp = (self.flavor.read().emitters.get_temp)();
                    self.queue_command(get_temp, None);
                },
                TimeoutAction::GrantIdleCredit => self.internal.credit.set(),
                TimeoutAction::Escalate { consecutive } => {
                    self.listener.on_protocol_error(&ProtocolError::CommunicationTimeout { consecutive });
                    self.teardown_with_error("communication timeout").await;
                    return;
                },
            }
        }
    }
}
