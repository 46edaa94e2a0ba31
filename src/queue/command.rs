//! Command queue: FIFO of user/job commands awaiting admission,
//! with the same type-dedup discipline as the send queue.

use std::collections::{HashSet, VecDeque};

use crate::command::{Command, CommandType};
use crate::queue::send::{EnqueueError, OnSent};

pub struct QueueEntry {
    pub command: Command,
    pub on_sent: Option<OnSent>,
}

#[derive(Default)]
pub struct CommandQueue {
    entries: VecDeque<QueueEntry>,
    types_present: HashSet<CommandType>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(
        &mut self,
        command: Command,
        on_sent: Option<OnSent>,
    ) -> Result<(), EnqueueError> {
        if let Some(item_type) = command.command_type() {
            if self.types_present.contains(item_type) {
                return Err(EnqueueError::Dedup { item_type: item_type.clone() });
            }
            self.types_present.insert(item_type.clone());
        }
        self.entries.push_back(QueueEntry { command, on_sent });
        Ok(())
    }

    pub fn pop(&mut self) -> Option<QueueEntry> {
        let entry = self.entries.pop_front()?;
        if let Some(item_type) = entry.command.command_type() {
            self.types_present.remove(item_type);
        }
        Some(entry)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::to_command;

    #[test]
    fn fifo_order() {
        let mut q = CommandQueue::new();
        q.push(to_command("G28", None, vec![]), None).unwrap();
        q.push(to_command("G1 X1", None, vec![]), None).unwrap();

        assert_eq!(q.pop().unwrap().command.line(), "G28");
        assert_eq!(q.pop().unwrap().command.line(), "G1 X1");
    }

    #[test]
    fn dedup_rejects_duplicate_type() {
        let mut q = CommandQueue::new();
        let ty = Some(CommandType::Named("temperature".into()));
        q.push(to_command("M105", ty.clone(), vec![]), None).unwrap();
        assert!(q.push(to_command("M105", ty, vec![]), None).is_err());
    }
}
