//! Per-peer sliding-window replay protection over 32-bit sequence numbers.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::packet::{MsgType, Nid};

/// Outcome of presenting a sequence number to a [`ReplayWindow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
    Accepted,
    Duplicate,
    TooOld,
}

/// Sliding window over a single peer's sequence space: a high-water mark
/// plus a bitmap covering the `window_size` numbers at or below it.
#[derive(Debug, Clone)]
pub struct ReplayWindow {
    window_size: u32,
    high_water: Option<u32>,
    /// `seen[i]` tracks whether `high_water - i` has been accepted.
    seen: Vec<bool>,
}

impl ReplayWindow {
    pub fn new(window_size: u32) -> Self {
        Self {
            window_size: window_size.max(1),
            high_water: None,
            seen: vec![false; window_size.max(1) as usize],
        }
    }

    /// Checks `sequence` against the current state and, if accepted,
    /// records it. Not reentrant-safe on its own; callers needing
    /// thread-safety across peers should go through [`ReplayTable`].
    pub fn check_and_record(&mut self, sequence: u32) -> ReplayOutcome {
        match self.high_water {
            None => {
                self.high_water = Some(sequence);
                self.seen.iter_mut().for_each(|b| *b = false);
                self.seen[0] = true;
                ReplayOutcome::Accepted
            }
            Some(hw) if sequence > hw => {
                let advance = (sequence - hw) as usize;
                if advance >= self.seen.len() {
                    self.seen.iter_mut().for_each(|b| *b = false);
                } else {
                    self.seen.rotate_right(advance);
                    self.seen[..advance].iter_mut().for_each(|b| *b = false);
                }
                self.seen[0] = true;
                self.high_water = Some(sequence);
                ReplayOutcome::Accepted
            }
            Some(hw) => {
                let diff = (hw - sequence) as usize;
                if diff >= self.seen.len() {
                    ReplayOutcome::TooOld
                } else if self.seen[diff] {
                    ReplayOutcome::Duplicate
                } else {
                    self.seen[diff] = true;
                    ReplayOutcome::Accepted
                }
            }
        }
    }

    /// Resets the window, discarding all recorded state. Invoked whenever
    /// a new session key is installed for the owning peer/port.
    pub fn reset(&mut self) {
        self.high_water = None;
        self.seen.iter_mut().for_each(|b| *b = false);
    }
}

/// Thread-safe map of replay windows keyed by `(source, msg_type)`, as
/// required by the router's receive pipeline (spec: replay check on
/// `(source, msg_type)`, not per hop).
#[derive(Debug, Default)]
pub struct ReplayTable {
    window_size: u32,
    windows: RwLock<HashMap<(Nid, MsgTypeKey), ReplayWindow>>,
}

/// `MsgType` is not `Hash`/`Eq` (it carries a discriminant tag only); this
/// newtype gives the table a hashable key without widening `MsgType`'s
/// public API for an internal concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct MsgTypeKey(u8);

impl From<MsgType> for MsgTypeKey {
    fn from(m: MsgType) -> Self {
        MsgTypeKey(m as u8)
    }
}

impl ReplayTable {
    pub fn new(window_size: u32) -> Self {
        Self {
            window_size,
            windows: RwLock::new(HashMap::new()),
        }
    }

    pub fn check_and_record(&self, peer: Nid, msg_type: MsgType, sequence: u32) -> ReplayOutcome {
        let mut guard = self.windows.write();
        let window = guard
            .entry((peer, msg_type.into()))
            .or_insert_with(|| ReplayWindow::new(self.window_size));
        window.check_and_record(sequence)
    }

    /// Clears the replay state for a peer across all message types,
    /// called when a new session key is installed or the port is evicted.
    pub fn reset_peer(&self, peer: Nid) {
        let mut guard = self.windows.write();
        guard.retain(|(p, _), _| *p != peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sequence_always_accepted() {
        let mut w = ReplayWindow::new(100);
        assert_eq!(w.check_and_record(42), ReplayOutcome::Accepted);
    }

    #[test]
    fn exact_duplicate_is_rejected() {
        let mut w = ReplayWindow::new(100);
        assert_eq!(w.check_and_record(10), ReplayOutcome::Accepted);
        assert_eq!(w.check_and_record(10), ReplayOutcome::Duplicate);
    }

    #[test]
    fn reordered_but_in_window_is_accepted_once() {
        let mut w = ReplayWindow::new(100);
        w.check_and_record(50);
        assert_eq!(w.check_and_record(45), ReplayOutcome::Accepted);
        assert_eq!(w.check_and_record(45), ReplayOutcome::Duplicate);
    }

    #[test]
    fn sequence_outside_window_is_too_old() {
        let mut w = ReplayWindow::new(10);
        w.check_and_record(100);
        assert_eq!(w.check_and_record(89), ReplayOutcome::TooOld);
    }

    #[test]
    fn advancing_high_water_shifts_window_and_forgets_old_bits() {
        let mut w = ReplayWindow::new(4);
        w.check_and_record(10);
        w.check_and_record(9);
        w.check_and_record(20);
        // 9 and 10 are now outside the window of size 4 relative to 20.
        assert_eq!(w.check_and_record(9), ReplayOutcome::TooOld);
        assert_eq!(w.check_and_record(18), ReplayOutcome::Accepted);
    }

    #[test]
    fn no_accepted_duplicates_under_random_order_presentation() {
        let mut w = ReplayWindow::new(100);
        let sequences = [5u32, 3, 5, 8, 3, 200, 150, 200, 199];
        let mut accepted = std::collections::HashSet::new();
        for s in sequences {
            if w.check_and_record(s) == ReplayOutcome::Accepted {
                assert!(accepted.insert(s), "sequence {s} accepted twice");
            }
        }
    }

    #[test]
    fn table_resets_only_the_named_peer() {
        let table = ReplayTable::new(100);
        let a = Nid([1; 16]);
        let b = Nid([2; 16]);
        table.check_and_record(a, MsgType::Data, 1);
        table.check_and_record(b, MsgType::Data, 1);
        table.reset_peer(a);
        assert_eq!(table.check_and_record(a, MsgType::Data, 1), ReplayOutcome::Accepted);
        assert_eq!(table.check_and_record(b, MsgType::Data, 1), ReplayOutcome::Duplicate);
    }
}
