//! Command-phase pipeline: every command passes through
//! `queuing -> queued -> sending -> sent`, with a plugin hook chain and a
//! fixed set of built-in per-gcode handlers at each phase.
//!
//! Hooks are plain closures rather than a generic `PhaseContext` trait: the
//! built-ins that need engine state close over `Arc`-shared handles
//! ([`crate::internal::Internal`], a job-control channel), which is simpler
//! than threading a context object through every call site.

use std::collections::HashMap;
use std::sync::Arc;

use crate::command::Command;
use crate::internal::Internal;
use crate::listener::ProtocolListener;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    Queuing,
    Queued,
    Sending,
    Sent,
}

/// What a hook wants to happen to the command it was given.
pub enum HookOutcome {
    /// Continue with `command` (possibly rewritten).
    Continue(Command),
    /// Drop the command silently; no further hooks or built-ins run.
    Suppress,
    /// Replace the single command with several, each re-entering the
    /// pipeline from the start of the *same* phase ("a hook may
    /// expand one command into many").
    Expand(Vec<Command>),
}

pub type Hook = Box<dyn Fn(&Command) -> HookOutcome + Send + Sync>;

/// An ordered chain of plugin hooks for one phase, run front to back until
/// one returns something other than `Continue`, or all run to completion.
#[derive(Default)]
pub struct HookChain {
    hooks: Vec<Hook>,
}

impl HookChain {
    pub fn push(&mut self, hook: Hook) {
        self.hooks.push(hook);
    }

    fn run(&self, mut command: Command) -> HookOutcome {
        for hook in &self.hooks {
            match hook(&command) {
                HookOutcome::Continue(c) => command = c,
                other => return other,
            }
        }
        HookOutcome::Continue(command)
    }
}

/// A built-in handler keyed by gcode letter+number (e.g. `"M112"`), run
/// after plugin hooks for the phase.
pub type BuiltinFn = Arc<dyn Fn(&Command) -> HookOutcome + Send + Sync>;

#[derive(Default, Clone)]
pub struct BuiltinTable {
    by_gcode: HashMap<String, BuiltinFn>,
    catch_all: Option<BuiltinFn>,
}

impl BuiltinTable {
    pub fn register(&mut self, gcode_key: impl Into<String>, f: BuiltinFn) {
        self.by_gcode.insert(gcode_key.into(), f);
    }

    pub fn register_catch_all(&mut self, f: BuiltinFn) {
        self.catch_all = Some(f);
    }

    fn run(&self, command: &Command) -> HookOutcome {
        if let Some(key) = command.gcode_key() {
            if let Some(f) = self.by_gcode.get(&key) {
                return f(command);
            }
        }
        if let Some(f) = &self.catch_all {
            return f(command);
        }
        HookOutcome::Continue(command.clone())
    }
}

/// The full four-phase pipeline. `Protocol` owns one of these and feeds
/// every command through it on the way to (and after) transmission.
#[derive(Default)]
pub struct Pipeline {
    pub hooks: HashMap<Phase, HookChain>,
    pub builtins: HashMap<Phase, BuiltinTable>,
}

impl Pipeline {
    pub fn new() -> Self {
        let mut hooks = HashMap::new();
        let mut builtins = HashMap::new();
        for phase in [Phase::Queuing, Phase::Queued, Phase::Sending, Phase::Sent] {
            hooks.insert(phase, HookChain::default());
            builtins.insert(phase, BuiltinTable::default());
        }
        Self { hooks, builtins }
    }

    pub fn add_hook(&mut self, phase: Phase, hook: Hook) {
        self.hooks.entry(phase).or_default().push(hook);
    }

    pub fn add_builtin(&mut self, phase: Phase, gcode_key: impl Into<String>, f: BuiltinFn) {
        self.builtins.entry(phase).or_default().register(gcode_key.into(), f);
    }

    pub fn add_catch_all(&mut self, phase: Phase, f: BuiltinFn) {
        self.builtins.entry(phase).or_default().register_catch_all(f);
    }

    /// Runs `command` through one phase: plugin hooks first, then the
    /// matching built-in.
    pub fn process(&self, phase: Phase, command: Command) -> HookOutcome {
        let after_hooks = match self.hooks.get(&phase) {
            Some(chain) => chain.run(command),
            None => HookOutcome::Continue(command),
        };
        let command = match after_hooks {
            HookOutcome::Continue(c) => c,
            other => return other,
        };
        match self.builtins.get(&phase) {
            Some(table) => table.run(&command),
            None => HookOutcome::Continue(command),
        }
    }
}

/// Built-in `queuing`-phase M112 handler: short-circuits the normal admission
/// path entirely and drives an immediate emergency-stop teardown: M112
/// bypasses queuing rather than flowing through the normal phases.
pub fn builtin_m112(internal: Arc<Internal>) -> BuiltinFn {
    Arc::new(move |command: &Command| {
        internal.flags.deactivate();
        HookOutcome::Continue(command.clone())
    })
}

/// Built-in `queuing`-phase M110 handler: resets line numbering immediately
/// rather than waiting for the command to reach `sending` (I1).
pub fn builtin_m110(internal: Arc<Internal>) -> BuiltinFn {
    Arc::new(move |command: &Command| {
        if let Command::Gcode { params, .. } = command {
            if let Some(n) = params.get(&'N').and_then(|v| v.parse::<u64>().ok()) {
                internal.line.lock().reset(n);
            }
        }
        HookOutcome::Continue(command.clone())
    })
}

/// Built-in `sent`-phase M109/M190/M116 handler: marks heating active so the
/// timeout ladder treats subsequent silence as expected, and — since these
/// "additionally set heating=true, long_running=true" on top of what
/// `M104`/`M140` already do (spec §6) — also records the target temperature
/// `M109`/`M190` carry, the same way `builtin_track_temp_target` does for
/// their non-waiting counterparts.
pub fn builtin_heater_sent(internal: Arc<Internal>) -> BuiltinFn {
    Arc::new(move |command: &Command| {
        if let Command::Gcode { code, number, .. } = command {
            let waits = matches!((code, number), ('M', 109) | ('M', 190) | ('M', 116));
            if waits {
                internal.flags.set_heating(true);
                let mut h = internal.heating.lock();
                h.active = true;
            }
        }
        record_temp_target(&internal, command);
        HookOutcome::Continue(command.clone())
    })
}

/// Built-in `queuing`-phase long-running marker: any command on the
/// flavor's long-running list sets the published flag so the sending loop
/// and timeout ladder both see it without a lock.
pub fn builtin_mark_long_running(
    internal: Arc<Internal>,
    is_long_running: impl Fn(&Command) -> bool + Send + Sync + 'static,
) -> BuiltinFn {
    Arc::new(move |command: &Command| {
        if is_long_running(command) {
            internal.flags.set_long_running(true);
        }
        HookOutcome::Continue(command.clone())
    })
}

/// Built-in `sent`-phase `T<n>` handler: records the new tool selection.
/// Tool switches made implicitly by a heatup wait are unwound on the next
/// `ok` (`dispatch::Dispatcher::on_ok`'s `former_tool` restore), not here.
/// `T<n>`'s gcode key varies with `n`, so unlike the fixed-key builtins
/// above this can't be registered per-key; it's folded into the `Sent`
/// phase's catch-all alongside Z tracking (see
/// [`builtin_sent_catch_all_tracking`]).
fn track_tool_select(internal: &Internal, command: &Command) {
    if let Command::Gcode { code: 'T', number, .. } = command {
        internal.tool.lock().current_tool = *number;
    }
}

/// Tracks the last commanded Z height (`G0`/`G1 Z<z>`) and notifies the
/// listener of the update. Folded into the `Sent` catch-all for the same
/// reason as tool tracking: `G0`/`G1` carry every move parameter, not just
/// `Z`, so this has to inspect params rather than key off a fixed gcode key.
fn track_z(internal: &Internal, listener: &Arc<dyn ProtocolListener>, command: &Command) {
    if let Command::Gcode { code, params, .. } = command {
        if matches!(code, 'G') {
            if let Some(z) = params.get(&'Z').and_then(|v| v.parse::<f64>().ok()) {
                *internal.current_z.lock() = Some(z);
                listener.on_protocol_position_update(Some(z));
            }
        }
    }
}

/// `Sent`-phase catch-all: runs every tracker whose gcode key isn't fixed
/// (tool select, Z height) against commands the phase's fixed-key builtins
/// didn't already claim.
pub fn builtin_sent_catch_all_tracking(
    internal: Arc<Internal>,
    listener: Arc<dyn ProtocolListener>,
) -> BuiltinFn {
    Arc::new(move |command: &Command| {
        track_tool_select(&internal, command);
        track_z(&internal, &listener, command);
        HookOutcome::Continue(command.clone())
    })
}

/// Records the target temperature carried by a `M104`/`M109 [T<n>] S<v>`
/// (extruder) or `M140`/`M190 S<v>` (bed) command. `M109`/`M190` are the
/// wait-for-temperature variants of `M104`/`M140` and carry the same target
/// parameter, so both pairs share this lookup (spec §6: the wait variants
/// "additionally" set heating/long-running on top of the plain setters'
/// effects — the target bookkeeping is one of those shared effects). `R`
/// (Marlin's "standby" target) is treated the same as `S` here since the
/// core only tracks one target per tool, a single
/// `tool_id -> (actual?, target?)` entry.
fn record_temp_target(internal: &Internal, command: &Command) {
    if let Command::Gcode { code, number, params, .. } = command {
        let target = params.get(&'S').or_else(|| params.get(&'R')).and_then(|v| v.parse::<f64>().ok());
        if let Some(target) = target {
            let key = match (code, number) {
                ('M', 104) | ('M', 109) => {
                    let tool = params.get(&'T').and_then(|v| v.parse::<u32>().ok());
                    match tool {
                        Some(t) => format!("T{t}"),
                        None => "T0".to_string(),
                    }
                },
                ('M', 140) | ('M', 190) => "B".to_string(),
                _ => return,
            };
            let mut temps = internal.temperatures.lock();
            let entry = temps.entry(key).or_insert((None, None));
            entry.1 = Some(target);
        }
    }
}

/// Built-in `sent`-phase `M104`/`M140 [S|R]` handler: updates the tool/bed
/// target temperature the host expects firmware to now be heating toward.
/// See [`record_temp_target`] for the shared lookup `M109`/`M190` also use.
pub fn builtin_track_temp_target(internal: Arc<Internal>) -> BuiltinFn {
    Arc::new(move |command: &Command| {
        record_temp_target(&internal, command);
        HookOutcome::Continue(command.clone())
    })
}

/// Built-in `sent`-phase `M155`/`M27 S<i>` handler: records the autoreport
/// interval the host just asked firmware to use.
pub fn builtin_track_autoreport_interval(internal: Arc<Internal>) -> BuiltinFn {
    Arc::new(move |command: &Command| {
        if let Command::Gcode { code, number, params, .. } = command {
            if let Some(interval) = params.get(&'S').and_then(|v| v.parse::<u32>().ok()) {
                match (code, number) {
                    ('M', 155) => internal.autoreport.lock().temperature_interval_secs = Some(interval),
                    ('M', 27) => internal.autoreport.lock().sd_interval_secs = Some(interval),
                    _ => {},
                }
            }
        }
        HookOutcome::Continue(command.clone())
    })
}

/// Built-in `sent`-phase `G4 P<ms>|S<s>` handler: extends the next
/// communication deadline computation by the dwell duration, so a long
/// `G4` doesn't get mistaken for a stalled link.
pub fn builtin_extend_deadline_for_dwell(internal: Arc<Internal>) -> BuiltinFn {
    Arc::new(move |command: &Command| {
        if let Command::Gcode { code: 'G', number: 4, params, .. } = command {
            let secs = params
                .get(&'S')
                .and_then(|v| v.parse::<f64>().ok())
                .or_else(|| params.get(&'P').and_then(|v| v.parse::<f64>().ok()).map(|ms| ms / 1000.0));
            if let Some(secs) = secs {
                internal.timeout.lock().pending_extension_secs += secs;
            }
        }
        HookOutcome::Continue(command.clone())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::to_command;

    #[test]
    fn hooks_run_in_order_and_can_rewrite() {
        let mut chain = HookChain::default();
        chain.push(Box::new(|c: &Command| {
            HookOutcome::Continue(to_command(format!("{} ; first", c.line()), None, vec![]))
        }));
        chain.push(Box::new(|c: &Command| {
            HookOutcome::Continue(to_command(format!("{} ; second", c.line()), None, vec![]))
        }));
        let out = chain.run(to_command("G1 X1", None, vec![]));
        match out {
            HookOutcome::Continue(c) => assert_eq!(c.line(), "G1 X1 ; first ; second"),
            _ => panic!("expected Continue"),
        }
    }

    #[test]
    fn suppress_short_circuits_remaining_hooks() {
        let mut chain = HookChain::default();
        chain.push(Box::new(|_: &Command| HookOutcome::Suppress));
        chain.push(Box::new(|c: &Command| {
            HookOutcome::Continue(to_command(format!("{} ; unreachable", c.line()), None, vec![]))
        }));
        assert!(matches!(chain.run(to_command("G1", None, vec![])), HookOutcome::Suppress));
    }

    #[test]
    fn builtin_dispatches_by_gcode_key() {
        let mut table = BuiltinTable::default();
        table.register(
            "M112",
            Arc::new(|_: &Command| HookOutcome::Continue(to_command("M112", None, vec![]))),
        );
        let out = table.run(&to_command("M112", None, vec![]));
        assert!(matches!(out, HookOutcome::Continue(_)));

        let out = table.run(&to_command("G1 X1", None, vec![]));
        match out {
            HookOutcome::Continue(c) => assert_eq!(c.line(), "G1 X1"),
            _ => panic!("expected pass-through Continue"),
        }
    }

    #[test]
    fn pipeline_runs_hooks_then_builtins() {
        let mut pipeline = Pipeline::new();
        pipeline.add_hook(
            Phase::Queuing,
            Box::new(|c: &Command| {
                HookOutcome::Continue(to_command(format!("{} ; tagged", c.line()), None, vec![]))
            }),
        );
        pipeline.add_builtin(
            Phase::Queuing,
            "G1",
            Arc::new(|c: &Command| HookOutcome::Continue(to_command(format!("{} ; builtin", c.line()), None, vec![]))),
        );
        let out = pipeline.process(Phase::Queuing, to_command("G1 X1", None, vec![]));
        match out {
            HookOutcome::Continue(c) => assert_eq!(c.line(), "G1 X1 ; tagged ; builtin"),
            _ => panic!("expected Continue"),
        }
    }

    #[test]
    fn m112_builtin_deactivates_send_queue() {
        let internal = Arc::new(Internal::new(4, 10));
        let handler = builtin_m112(internal.clone());
        handler(&to_command("M112", None, vec![]));
        assert!(!internal.flags.active());
    }

    #[test]
    fn m110_builtin_resets_line_state() {
        let internal = Arc::new(Internal::new(4, 10));
        internal.line.lock().current_line = 50;
        let handler = builtin_m110(internal.clone());
        handler(&to_command("M110 N0", None, vec![]));
        assert_eq!(internal.line.lock().current_line, 0);
    }

    #[test]
    fn sent_catch_all_tracks_tool_select() {
        let internal = Arc::new(Internal::new(4, 10));
        let handler =
            builtin_sent_catch_all_tracking(internal.clone(), Arc::new(crate::listener::NullListener));
        handler(&to_command("T2", None, vec![]));
        assert_eq!(internal.tool.lock().current_tool, 2);
    }

    #[test]
    fn sent_catch_all_tracks_last_commanded_z() {
        let internal = Arc::new(Internal::new(4, 10));
        let handler =
            builtin_sent_catch_all_tracking(internal.clone(), Arc::new(crate::listener::NullListener));
        handler(&to_command("G1 X1 Z12.5", None, vec![]));
        assert_eq!(*internal.current_z.lock(), Some(12.5));
    }

    #[test]
    fn temp_target_builtin_tracks_bed_and_tool() {
        let internal = Arc::new(Internal::new(4, 10));
        let handler = builtin_track_temp_target(internal.clone());
        handler(&to_command("M104 T1 S210", None, vec![]));
        handler(&to_command("M140 S60", None, vec![]));
        let temps = internal.temperatures.lock();
        assert_eq!(temps.get("T1"), Some(&(None, Some(210.0))));
        assert_eq!(temps.get("B"), Some(&(None, Some(60.0))));
    }

    #[test]
    fn heater_sent_builtin_also_records_wait_variant_targets() {
        // M109/M190 are the wait-for-temperature variants of M104/M140 and
        // carry the same target parameter; spec §6 says they "additionally"
        // set heating/long-running on top of the plain setters' effects.
        let internal = Arc::new(Internal::new(4, 10));
        let handler = builtin_heater_sent(internal.clone());
        handler(&to_command("M109 T0 S200", None, vec![]));
        handler(&to_command("M190 S65", None, vec![]));
        let temps = internal.temperatures.lock();
        assert_eq!(temps.get("T0"), Some(&(None, Some(200.0))));
        assert_eq!(temps.get("B"), Some(&(None, Some(65.0))));
        assert!(internal.flags.heating());
    }

    #[test]
    fn autoreport_builtin_records_requested_intervals() {
        let internal = Arc::new(Internal::new(4, 10));
        let handler = builtin_track_autoreport_interval(internal.clone());
        handler(&to_command("M155 S2", None, vec![]));
        handler(&to_command("M27 S5", None, vec![]));
        let autoreport = internal.autoreport.lock();
        assert_eq!(autoreport.temperature_interval_secs, Some(2));
        assert_eq!(autoreport.sd_interval_secs, Some(5));
    }

    #[test]
    fn dwell_builtin_extends_pending_deadline() {
        let internal = Arc::new(Internal::new(4, 10));
        let handler = builtin_extend_deadline_for_dwell(internal.clone());
        handler(&to_command("G4 P500", None, vec![]));
        assert_eq!(internal.timeout.lock().pending_extension_secs, 0.5);
    }
}
