//! Outstanding retransmission requests at the sink.
//!
//! A sparse map from sequence number to the retransmit state of that
//! block. Every entry is limited to `resend_limit` attempts spaced at
//! least `resend_interval` apart; entries behind the playhead are swept.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy)]
pub struct AckEntry {
    pub sequence: i32,
    remaining: i32,
    last_attempt: f64,
}

impl AckEntry {
    fn new(sequence: i32, limit: i32) -> Self {
        Self {
            sequence,
            remaining: limit,
            // far in the past, so the first check fires immediately
            last_attempt: -1e9,
        }
    }

    /// True if another request may go out now; books the attempt.
    pub fn check(&mut self, time: f64, interval: f64) -> bool {
        if self.remaining > 0 {
            if time - self.last_attempt >= interval {
                self.last_attempt = time;
                self.remaining -= 1;
                return true;
            }
        }
        false
    }
}

#[derive(Debug, Default)]
pub struct AckList {
    entries: HashMap<i32, AckEntry>,
    limit: i32,
}

impl AckList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn setup(&mut self, limit: i32) {
        self.limit = limit;
        self.entries.clear();
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, sequence: i32) -> bool {
        self.entries.contains_key(&sequence)
    }

    /// True if at least one retransmit request actually went out for this
    /// block (distinguishes resent blocks from naturally reordered ones).
    pub fn requested(&self, sequence: i32) -> bool {
        self.entries
            .get(&sequence)
            .map(|e| e.remaining < self.limit)
            .unwrap_or(false)
    }

    pub fn get_or_insert(&mut self, sequence: i32) -> &mut AckEntry {
        let limit = self.limit;
        self.entries
            .entry(sequence)
            .or_insert_with(|| AckEntry::new(sequence, limit))
    }

    pub fn remove(&mut self, sequence: i32) {
        self.entries.remove(&sequence);
    }

    /// Sweep entries older than `sequence` when the playhead advances.
    pub fn remove_before(&mut self, sequence: i32) {
        self.entries.retain(|&seq, _| seq >= sequence);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_and_interval() {
        let mut list = AckList::new();
        list.setup(3);
        let interval = 0.01;

        // first attempt fires immediately
        assert!(list.get_or_insert(5).check(0.0, interval));
        // too soon
        assert!(!list.get_or_insert(5).check(0.005, interval));
        // spaced attempts up to the limit
        assert!(list.get_or_insert(5).check(0.011, interval));
        assert!(list.get_or_insert(5).check(0.022, interval));
        // limit reached
        assert!(!list.get_or_insert(5).check(1.0, interval));
    }

    #[test]
    fn test_remove_before_quiescence() {
        let mut list = AckList::new();
        list.setup(16);
        for seq in 0..10 {
            list.get_or_insert(seq);
        }
        list.remove_before(8);
        assert_eq!(list.len(), 2);
        assert!(list.contains(8) && list.contains(9));
        list.remove_before(100);
        assert!(list.is_empty());
    }
}
