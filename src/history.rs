//! Line history: a bounded ring of recently-sent lines, indexed
//! by line number, used to service resend requests.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;

/// Number of sent lines retained for resend (N=50).
pub const DEFAULT_CAPACITY: usize = 50;

#[derive(Debug)]
pub enum HistoryError {
    NotFound { requested: u64 },
}

impl fmt::Display for HistoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { requested } => write!(f, "line {requested} not in history"),
        }
    }
}

impl std::error::Error for HistoryError {}

/// A bounded `line_number -> bytes` mapping. Eviction discards the smallest
/// key when at capacity, since lines are only ever appended in increasing
/// order (I1/I2).
#[derive(Debug)]
pub struct History {
    capacity: usize,
    lines: BTreeMap<u64, Bytes>,
}

impl History {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, lines: BTreeMap::new() }
    }

    /// Records `bytes` against `line_number`, evicting the oldest entry if
    /// the history is at capacity.
    pub fn append(&mut self, line_number: u64, bytes: Bytes) {
        self.lines.insert(line_number, bytes);
        while self.lines.len() > self.capacity {
            if let Some(&oldest) = self.lines.keys().next() {
                self.lines.remove(&oldest);
            }
        }
    }

    /// Fetches the bytes sent for `line_number`. A missing key is a hard
    /// error for resend handling.
    pub fn get(&self, line_number: u64) -> Result<Bytes, HistoryError> {
        self.lines
            .get(&line_number)
            .cloned()
            .ok_or(HistoryError::NotFound { requested: line_number })
    }

    pub fn contains(&self, line_number: u64) -> bool {
        self.lines.contains_key(&line_number)
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_get_roundtrip() {
        let mut h = History::new(4);
        h.append(1, Bytes::from_static(b"G28"));
        assert_eq!(h.get(1).unwrap(), Bytes::from_static(b"G28"));
    }

    #[test]
    fn get_missing_is_error() {
        let h = History::new(4);
        assert!(matches!(h.get(5), Err(HistoryError::NotFound { requested: 5 })));
    }

    #[test]
    fn eviction_discards_oldest() {
        let mut h = History::new(2);
        h.append(1, Bytes::from_static(b"a"));
        h.append(2, Bytes::from_static(b"b"));
        h.append(3, Bytes::from_static(b"c"));
        assert!(!h.contains(1));
        assert!(h.contains(2));
        assert!(h.contains(3));
        assert_eq!(h.len(), 2);
    }

    #[test]
    fn clear_empties_history() {
        let mut h = History::new(4);
        h.append(1, Bytes::from_static(b"a"));
        h.clear();
        assert!(h.is_empty());
    }
}
