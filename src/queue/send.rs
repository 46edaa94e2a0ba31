//! Send queue: a two-track priority-and-dedup queue. The
//! `resend` track preempts the `send` track whenever it is non-empty.

use std::collections::{HashSet, VecDeque};
use std::fmt;

use crate::command::{Command, CommandType};

pub type OnSent = Box<dyn FnOnce() + Send>;

/// Which track an entry is enqueued onto.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Target {
    Send,
    Resend,
}

pub struct Entry {
    pub command: Command,
    /// Set only for resend entries (`SendQueueEntry.line_number`).
    pub line_number: Option<u64>,
    pub on_sent: Option<OnSent>,
    /// `true` skips the `sending` phase: resends must go out byte-identical.
    pub processed: bool,
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("command", &self.command)
            .field("line_number", &self.line_number)
            .field("processed", &self.processed)
            .finish()
    }
}

impl Entry {
    pub fn new(command: Command) -> Self {
        Self { command, line_number: None, on_sent: None, processed: false }
    }

    pub fn resend(command: Command, line_number: u64) -> Self {
        Self { command, line_number: Some(line_number), on_sent: None, processed: true }
    }

    pub fn with_on_sent(mut self, on_sent: OnSent) -> Self {
        self.on_sent = Some(on_sent);
        self
    }
}

#[derive(Debug)]
pub enum EnqueueError {
    Dedup { item_type: CommandType },
}

impl fmt::Display for EnqueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dedup { item_type } => write!(f, "type {item_type} already queued"),
        }
    }
}

impl std::error::Error for EnqueueError {}

#[derive(Default)]
struct Track {
    entries: VecDeque<Entry>,
    types_present: HashSet<CommandType>,
}

impl Track {
    fn put(&mut self, entry: Entry) -> Result<(), EnqueueError> {
        if let Some(item_type) = entry.command.command_type() {
            if self.types_present.contains(item_type) {
                return Err(EnqueueError::Dedup { item_type: item_type.clone() });
            }
            self.types_present.insert(item_type.clone());
        }
        self.entries.push_back(entry);
        Ok(())
    }

    fn pop(&mut self) -> Option<Entry> {
        let entry = self.entries.pop_front()?;
        if let Some(item_type) = entry.command.command_type() {
            self.types_present.remove(item_type);
        }
        Some(entry)
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Two-track queue. `resend_active` is exposed so the sending loop (and
/// tests) can short-circuit normal sends during an active resend window
/// without taking the dequeue path.
pub struct SendQueue {
    send: Track,
    resend: Track,
    pub resend_active: bool,
}

impl Default for SendQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl SendQueue {
    pub fn new() -> Self {
        Self { send: Track::default(), resend: Track::default(), resend_active: false }
    }

    pub fn put(&mut self, entry: Entry, target: Target) -> Result<(), EnqueueError> {
        match target {
            Target::Send => self.send.put(entry),
            Target::Resend => self.resend.put(entry),
        }
    }

    /// Returns the next resend entry if any exist, else the next send entry.
    pub fn pop(&mut self) -> Option<Entry> {
        if let Some(entry) = self.resend.pop() {
            return Some(entry);
        }
        self.send.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.send.is_empty() && self.resend.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::to_command;

    fn cmd(line: &str, ty: Option<&str>) -> Command {
        to_command(line, ty.map(|t| CommandType::Named(t.to_string())), vec![])
    }

    #[test]
    fn resend_preempts_send() {
        let mut q = SendQueue::new();
        q.put(Entry::new(cmd("G1 X1", None)), Target::Send).unwrap();
        q.put(Entry::resend(cmd("G1 X0", None), 3), Target::Resend).unwrap();

        let first = q.pop().unwrap();
        assert_eq!(first.line_number, Some(3));
        let second = q.pop().unwrap();
        assert_eq!(second.line_number, None);
    }

    #[test]
    fn dedup_rejects_second_enqueue_of_same_type() {
        let mut q = SendQueue::new();
        q.put(Entry::new(cmd("M105", Some("temperature"))), Target::Send).unwrap();
        let err = q.put(Entry::new(cmd("M105", Some("temperature"))), Target::Send);
        assert!(matches!(err, Err(EnqueueError::Dedup { .. })));
    }

    #[test]
    fn dedup_tracks_are_independent() {
        let mut q = SendQueue::new();
        q.put(Entry::new(cmd("M105", Some("temperature"))), Target::Send).unwrap();
        // Same type on the resend track is independent of the send track.
        q.put(Entry::resend(cmd("M105", Some("temperature")), 1), Target::Resend).unwrap();
    }

    #[test]
    fn popping_frees_the_dedup_slot() {
        let mut q = SendQueue::new();
        q.put(Entry::new(cmd("M105", Some("temperature"))), Target::Send).unwrap();
        q.pop().unwrap();
        q.put(Entry::new(cmd("M105", Some("temperature"))), Target::Send).unwrap();
    }

    #[test]
    fn resend_window_honors_ascending_order() {
        let mut q = SendQueue::new();
        q.put(Entry::resend(cmd("G1", None), 2), Target::Resend).unwrap();
        q.put(Entry::resend(cmd("G2", None), 3), Target::Resend).unwrap();

        assert_eq!(q.pop().unwrap().line_number, Some(2));
        assert_eq!(q.pop().unwrap().line_number, Some(3));
    }
}
