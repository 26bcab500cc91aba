//! Per-session replay buffer: a small ring of the most recent outbound
//! events plus a monotonically increasing sequence counter, so a
//! reconnecting client can catch up instead of missing events that fired
//! while it was disconnected.

use std::collections::VecDeque;

use super::types::{OutboundEvent, SequencedEvent};

pub struct Outbox {
    retain: usize,
    next_sequence: u64,
    ring: VecDeque<SequencedEvent>,
}

impl Outbox {
    pub fn new(retain: usize) -> Self {
        Self {
            retain,
            next_sequence: 0,
            ring: VecDeque::with_capacity(retain),
        }
    }

    /// Assigns the next sequence number and stores the event, evicting the
    /// oldest entry once retention is exceeded.
    pub fn push(&mut self, event: OutboundEvent) -> SequencedEvent {
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let sequenced = SequencedEvent { sequence, event };
        if self.ring.len() == self.retain {
            self.ring.pop_front();
        }
        self.ring.push_back(sequenced.clone());
        sequenced
    }

    /// Returns the events strictly after `from_sequence`, or `None` if
    /// `from_sequence` predates everything retained (the `catchup_unavailable`
    /// case).
    pub fn replay_from(&self, from_sequence: u64) -> Option<Vec<SequencedEvent>> {
        if let Some(earliest) = self.earliest_sequence() {
            if from_sequence + 1 < earliest {
                return None;
            }
        }

        Some(
            self.ring
                .iter()
                .filter(|item| item.sequence > from_sequence)
                .cloned()
                .collect(),
        )
    }

    pub fn earliest_sequence(&self) -> Option<u64> {
        self.ring.front().map(|item| item.sequence)
    }

    pub fn latest_sequence(&self) -> Option<u64> {
        self.ring.back().map(|item| item.sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retains_only_the_configured_window() {
        let mut outbox = Outbox::new(2);
        outbox.push(OutboundEvent::NoteArchived {
            note_id: "n1".into(),
        });
        outbox.push(OutboundEvent::NoteArchived {
            note_id: "n2".into(),
        });
        outbox.push(OutboundEvent::NoteArchived {
            note_id: "n3".into(),
        });

        assert_eq!(outbox.earliest_sequence(), Some(1));
        assert_eq!(outbox.latest_sequence(), Some(2));
    }

    #[test]
    fn replay_from_within_window_returns_remaining_events() {
        let mut outbox = Outbox::new(5);
        for i in 0..3 {
            outbox.push(OutboundEvent::NoteArchived {
                note_id: format!("n{i}"),
            });
        }

        let replayed = outbox.replay_from(0).expect("within window");
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0].sequence, 1);
    }

    #[test]
    fn replay_before_retention_window_is_unavailable() {
        let mut outbox = Outbox::new(2);
        for i in 0..5 {
            outbox.push(OutboundEvent::NoteArchived {
                note_id: format!("n{i}"),
            });
        }

        assert!(outbox.replay_from(0).is_none());
    }
}
