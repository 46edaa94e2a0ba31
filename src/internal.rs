//! The engine's mutable internal-state record, partitioned into a
//! send-side half (guarded by `line_mutex` / `send_queue_mutex`),
//! a receive-side half (touched only by the receive task), and a small
//! "published core" of atomics both sides read as hint-quality checks.
//!
//! Critical sections here are all synchronous and short (a counter bump, a
//! map insert), so plain [`parking_lot::Mutex`] guards them rather than
//! `tokio::sync::Mutex` — nothing here ever awaits while holding a lock.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::flavor::ErrorKind;
use crate::history::History;
use crate::queue::command::CommandQueue;
use crate::queue::send::SendQueue;
use crate::state::ProtocolState;

/// `(current_line, history)`, guarded by `line_mutex`.
pub struct LineState {
    pub current_line: u64,
    pub history: History,
}

impl LineState {
    pub fn new(history_capacity: usize) -> Self {
        Self { current_line: 1, history: History::new(history_capacity) }
    }

    /// Resets line numbering (M110): clears history and sets the next line
    /// number, per I1.
    pub fn reset(&mut self, new_line_number: u64) {
        self.current_line = new_line_number;
        self.history.clear();
    }
}

/// The admission pipeline's own queues, guarded together by
/// `send_queue_mutex` so a caller sees coherent `resend_active`/enqueue
/// semantics across multi-command expansions.
pub struct SendQueueState {
    pub send_queue: SendQueue,
    pub command_queue: CommandQueue,
}

impl Default for SendQueueState {
    fn default() -> Self {
        Self { send_queue: SendQueue::new(), command_queue: CommandQueue::new() }
    }
}

/// The resend cursor.
#[derive(Default)]
pub struct ResendState {
    pub requested: Option<u64>,
    pub next_to_resend: Option<u64>,
    pub count: u64,
    pub last_error: Option<ErrorKind>,
}

#[derive(Default)]
pub struct ToolState {
    pub current_tool: u32,
    pub former_tool: Option<u32>,
}

#[derive(Default)]
pub struct HeatingState {
    pub active: bool,
    pub start: Option<Instant>,
    pub lost_seconds: f64,
}

#[derive(Default)]
pub struct SdState {
    pub available: bool,
    pub files: Vec<(String, u64)>,
    pub files_temp: Option<Vec<(String, u64)>>,
    pub autoreport: bool,
}

#[derive(Default)]
pub struct FirmwareState {
    pub identified: bool,
    pub name: String,
    pub info: BTreeMap<String, String>,
    pub capabilities: BTreeMap<String, bool>,
}

/// Host-side record of the autoreport intervals last requested, purely for
/// diagnostics/introspection (the firmware is the actual source of truth
/// once it starts honoring `M155`/`M27`).
#[derive(Default)]
pub struct AutoreportState {
    pub temperature_interval_secs: Option<u32>,
    pub sd_interval_secs: Option<u32>,
}

#[derive(Default)]
pub struct TimeoutState {
    pub deadline: Option<Instant>,
    pub consecutive: u32,
    /// Set by `G4` (dwell) to extend the next deadline computation by this
    /// many extra seconds ("extends the communication deadline").
    pub pending_extension_secs: f64,
}

/// The small set of flags every component needs to read without taking a
/// lock ('s "published core"). Writers update both the atomic and
/// whatever guarded struct is authoritative; readers here only get
/// hint-quality answers and must re-validate under the relevant mutex
/// before acting on them.
#[derive(Clone)]
pub struct PublishedFlags {
    pub long_running: Arc<AtomicBool>,
    pub heating: Arc<AtomicBool>,
    pub resend_active: Arc<AtomicBool>,
    pub only_from_job: Arc<AtomicBool>,
    pub trigger_events: Arc<AtomicBool>,
    pub ignore_ok: Arc<AtomicU32>,
    pub send_queue_active: Arc<AtomicBool>,
    /// Set when a caller has requested `pause`/`cancel`/`resume` but the
    /// engine hasn't yet reached a point in the admission pipeline where it
    /// can act on it (e.g. a resend window is still draining).
    pub pending_pause: Arc<AtomicBool>,
    pub pending_cancel: Arc<AtomicBool>,
    pub pending_resume: Arc<AtomicBool>,
    /// Mirrors the active job's `is_sd_streamed()` so the sending loop can
    /// decide whether to keep pulling lines from it without re-locking the
    /// job handle on every iteration.
    pub job_is_sd_streamed: Arc<AtomicBool>,
}

impl Default for PublishedFlags {
    fn default() -> Self {
        Self {
            long_running: Arc::new(AtomicBool::new(false)),
            heating: Arc::new(AtomicBool::new(false)),
            resend_active: Arc::new(AtomicBool::new(false)),
            only_from_job: Arc::new(AtomicBool::new(false)),
            trigger_events: Arc::new(AtomicBool::new(true)),
            ignore_ok: Arc::new(AtomicU32::new(0)),
            send_queue_active: Arc::new(AtomicBool::new(true)),
            pending_pause: Arc::new(AtomicBool::new(false)),
            pending_cancel: Arc::new(AtomicBool::new(false)),
            pending_resume: Arc::new(AtomicBool::new(false)),
            job_is_sd_streamed: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl PublishedFlags {
    pub fn long_running(&self) -> bool {
        self.long_running.load(Ordering::Acquire)
    }

    pub fn set_long_running(&self, v: bool) {
        self.long_running.store(v, Ordering::Release);
    }

    pub fn heating(&self) -> bool {
        self.heating.load(Ordering::Acquire)
    }

    pub fn set_heating(&self, v: bool) {
        self.heating.store(v, Ordering::Release);
    }

    pub fn resend_active(&self) -> bool {
        self.resend_active.load(Ordering::Acquire)
    }

    pub fn set_resend_active(&self, v: bool) {
        self.resend_active.store(v, Ordering::Release);
    }

    pub fn only_from_job(&self) -> bool {
        self.only_from_job.load(Ordering::Acquire)
    }

    pub fn set_only_from_job(&self, v: bool) {
        self.only_from_job.store(v, Ordering::Release);
    }

    pub fn trigger_events(&self) -> bool {
        self.trigger_events.load(Ordering::Acquire)
    }

    pub fn set_trigger_events(&self, v: bool) {
        self.trigger_events.store(v, Ordering::Release);
    }

    pub fn active(&self) -> bool {
        self.send_queue_active.load(Ordering::Acquire)
    }

    pub fn deactivate(&self) {
        self.send_queue_active.store(false, Ordering::Release);
    }

    pub fn pending_pause(&self) -> bool {
        self.pending_pause.load(Ordering::Acquire)
    }

    pub fn set_pending_pause(&self, v: bool) {
        self.pending_pause.store(v, Ordering::Release);
    }

    pub fn pending_cancel(&self) -> bool {
        self.pending_cancel.load(Ordering::Acquire)
    }

    pub fn set_pending_cancel(&self, v: bool) {
        self.pending_cancel.store(v, Ordering::Release);
    }

    pub fn pending_resume(&self) -> bool {
        self.pending_resume.load(Ordering::Acquire)
    }

    pub fn set_pending_resume(&self, v: bool) {
        self.pending_resume.store(v, Ordering::Release);
    }

    pub fn job_is_sd_streamed(&self) -> bool {
        self.job_is_sd_streamed.load(Ordering::Acquire)
    }

    pub fn set_job_is_sd_streamed(&self, v: bool) {
        self.job_is_sd_streamed.store(v, Ordering::Release);
    }
}

/// Everything the engine needs, shared by `Arc` between the two long-running
/// tasks and the public `Protocol` handle.
pub struct Internal {
    pub line: Mutex<LineState>,
    pub send_queue: Mutex<SendQueueState>,
    pub resend: Mutex<ResendState>,
    pub temperatures: Mutex<BTreeMap<String, (Option<f64>, Option<f64>)>>,
    pub tool: Mutex<ToolState>,
    pub heating: Mutex<HeatingState>,
    pub sd: Mutex<SdState>,
    pub firmware: Mutex<FirmwareState>,
    pub timeout: Mutex<TimeoutState>,
    pub autoreport: Mutex<AutoreportState>,
    pub current_z: Mutex<Option<f64>>,
    pub state: Mutex<ProtocolState>,
    pub flags: PublishedFlags,
    pub credit: crate::credit::Credit,
    /// Woken whenever the admission pipeline puts something new onto either
    /// queue (or opens a resend window), so the sending loop isn't left
    /// polling an empty queue on a tight spin.
    pub work: tokio::sync::Notify,
}

impl Internal {
    pub fn new(history_capacity: usize, max_credit: u32) -> Self {
        Self {
            line: Mutex::new(LineState::new(history_capacity)),
            send_queue: Mutex::new(SendQueueState::default()),
            resend: Mutex::new(ResendState::default()),
            temperatures: Mutex::new(BTreeMap::new()),
            tool: Mutex::new(ToolState::default()),
            heating: Mutex::new(HeatingState::default()),
            sd: Mutex::new(SdState::default()),
            firmware: Mutex::new(FirmwareState::default()),
            timeout: Mutex::new(TimeoutState::default()),
            autoreport: Mutex::new(AutoreportState::default()),
            current_z: Mutex::new(None),
            state: Mutex::new(ProtocolState::Disconnected),
            flags: PublishedFlags::default(),
            credit: crate::credit::Credit::new(max_credit),
            work: tokio::sync::Notify::new(),
        }
    }

    /// Validates and applies a state transition, returning the old state on
    /// success.
    pub fn transition(&self, to: ProtocolState) -> Option<ProtocolState> {
        let mut state = self.state.lock();
        if !crate::state::is_valid_transition(*state, to) {
            return None;
        }
        let old = *state;
        *state = to;
        Some(old)
    }

    pub fn current_state(&self) -> ProtocolState {
        *self.state.lock()
    }

    /// Finalizes an in-flight heatup: folds the elapsed wait into
    /// `lost_seconds` and clears the active flag. Shared by the `ok` handler
    /// (heatup completed normally) and the liveness ladder: a communication
    /// timeout while heating means the heatup is done, not a fault.
    pub fn finish_heatup(&self) {
        let mut heating = self.heating.lock();
        if let Some(start) = heating.start.take() {
            heating.lost_seconds += start.elapsed().as_secs_f64();
        }
        heating.active = false;
        drop(heating);
        self.flags.set_heating(false);
    }
}
