//! Fixed-capacity packet ring shared by one producer and many sessions.
//!
//! Slots hold reference-counted packets. Overwriting a slot only drops the
//! ring's reference, so a session that already took a snapshot keeps a
//! valid packet while the producer moves on. Staleness is always judged by
//! `sequence_id`, never by slot index.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::packet::Packet;

pub const DEFAULT_CAPACITY: usize = 600;
pub const AUDIO_ONLY_CAPACITY: usize = 180;

/// A consumer's position: the last slot it consumed and the sequence id it
/// saw there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub index: usize,
    pub last_sequence_id: u64,
}

struct Slots {
    slots: Vec<Option<Arc<Packet>>>,
    write_index: Option<usize>,
    sequence: u64,
}

pub struct RingBuffer {
    capacity: usize,
    inner: Mutex<Slots>,
}

impl RingBuffer {
    /// The write slot is never readable, so capacity is clamped to two.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            capacity,
            inner: Mutex::new(Slots {
                slots: vec![None; capacity],
                write_index: None,
                sequence: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn index_next(&self, index: usize) -> usize {
        if index + 1 >= self.capacity {
            0
        } else {
            index + 1
        }
    }

    pub fn index_prev(&self, index: usize) -> usize {
        if index == 0 {
            self.capacity - 1
        } else {
            index - 1
        }
    }

    /// Slot holding the most recently pushed packet.
    pub fn write_index(&self) -> Option<usize> {
        self.lock().write_index
    }

    pub fn latest_sequence_id(&self) -> u64 {
        self.lock().sequence
    }

    pub fn live_count(&self) -> usize {
        self.lock().slots.iter().filter(|s| s.is_some()).count()
    }

    /// Producer only. Overwrites the slot after the write index, stamps the
    /// next sequence id and returns it.
    pub fn push(&self, mut packet: Packet) -> u64 {
        let mut inner = self.lock();
        let next = match inner.write_index {
            Some(index) => self.index_next(index),
            None => 0,
        };
        inner.sequence += 1;
        packet.sequence_id = inner.sequence;
        inner.slots[next] = Some(Arc::new(packet));
        inner.write_index = Some(next);
        inner.sequence
    }

    /// Empties every slot. Sequence ids keep counting, so cursors taken
    /// before the clear never see a packet twice.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.slots.iter_mut().for_each(|slot| *slot = None);
        inner.write_index = None;
    }

    /// Returns the packet after `cursor` when it is populated, newer than
    /// what the consumer already saw, and not the slot the producer wrote
    /// last. Never blocks.
    pub fn try_read(&self, cursor: &Cursor) -> Option<Arc<Packet>> {
        let candidate = self.index_next(cursor.index);
        let inner = self.lock();
        if inner.write_index == Some(candidate) {
            return None;
        }
        match &inner.slots[candidate] {
            Some(packet) if packet.sequence_id > cursor.last_sequence_id => Some(Arc::clone(packet)),
            _ => None,
        }
    }

    /// Starting position for a new viewer: about half the ring behind the
    /// write index, so the first packet read is recent but not the live
    /// edge.
    pub fn join_cursor(&self) -> Cursor {
        let inner = self.lock();
        let Some(write_index) = inner.write_index else {
            return Cursor {
                index: self.capacity - 1,
                last_sequence_id: 0,
            };
        };
        let back = self.capacity / 2;
        let mut start = (write_index + self.capacity + 1 - back) % self.capacity;
        // Skip slots the producer has not reached on its first lap.
        while inner.slots[start].is_none() && start != write_index {
            start = self.index_next(start);
        }
        let first = inner.slots[start]
            .as_ref()
            .map(|p| p.sequence_id)
            .unwrap_or(1);
        Cursor {
            index: self.index_prev(start),
            last_sequence_id: first.saturating_sub(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Rational, StreamKind};
    use bytes::Bytes;

    fn packet(pts: i64) -> Packet {
        Packet::new(StreamKind::Video, pts, pts, Rational::new(1, 90_000), Bytes::from_static(b"x"))
    }

    #[test]
    fn push_assigns_increasing_sequence_ids() {
        let ring = RingBuffer::new(3);
        assert_eq!(ring.push(packet(1)), 1);
        assert_eq!(ring.push(packet(2)), 2);
        assert_eq!(ring.write_index(), Some(1));
        assert_eq!(ring.latest_sequence_id(), 2);
    }

    #[test]
    fn wraparound_keeps_exactly_capacity_packets() {
        let ring = RingBuffer::new(4);
        for pts in 0..5 {
            ring.push(packet(pts));
        }
        assert_eq!(ring.live_count(), 4);
        // Oldest (sequence 1) was overwritten by sequence 5 in slot 0.
        let cursor = Cursor { index: 3, last_sequence_id: 0 };
        assert!(ring.try_read(&cursor).is_none(), "slot 0 is the write slot");
        let cursor = Cursor { index: 0, last_sequence_id: 0 };
        assert_eq!(ring.try_read(&cursor).map(|p| p.sequence_id), Some(2));
    }

    #[test]
    fn overwritten_packets_are_never_returned() {
        let ring = RingBuffer::new(4);
        for pts in 1..=6 {
            ring.push(packet(pts));
        }
        // Cursor sat just before packet 3 was written (slot 1 held packet 2).
        let mut cursor = Cursor { index: 1, last_sequence_id: 2 };
        let mut seen = Vec::new();
        while let Some(p) = ring.try_read(&cursor) {
            seen.push(p.sequence_id);
            cursor = Cursor {
                index: ring.index_next(cursor.index),
                last_sequence_id: p.sequence_id,
            };
        }
        assert_eq!(seen, vec![3, 4, 5]);

        // 6 is the live write slot until something newer lands.
        ring.push(packet(7));
        let p = ring.try_read(&cursor).expect("packet 6 readable after next push");
        assert_eq!(p.sequence_id, 6);
        assert!(seen.iter().all(|&id| id > 2));
    }

    #[test]
    fn try_read_rejects_already_seen_sequence() {
        let ring = RingBuffer::new(4);
        ring.push(packet(1));
        ring.push(packet(2));
        let cursor = Cursor { index: 3, last_sequence_id: 1 };
        assert!(ring.try_read(&cursor).is_none());
    }

    #[test]
    fn snapshot_survives_overwrite() {
        let ring = RingBuffer::new(2);
        ring.push(packet(10));
        ring.push(packet(20));
        let held = ring.try_read(&Cursor { index: 1, last_sequence_id: 0 }).unwrap();
        ring.push(packet(30));
        ring.push(packet(40));
        assert_eq!(held.pts, 10);
    }

    #[test]
    fn join_cursor_sits_behind_the_write_index() {
        let ring = RingBuffer::new(10);
        for pts in 0..25 {
            ring.push(packet(pts));
        }
        let cursor = ring.join_cursor();
        let next = ring.try_read(&cursor).expect("fresh packet after join");
        assert_eq!(next.sequence_id, cursor.last_sequence_id + 1);
        assert!(ring.latest_sequence_id() - next.sequence_id <= 5);
    }

    #[test]
    fn join_cursor_on_partially_filled_ring() {
        let ring = RingBuffer::new(10);
        ring.push(packet(0));
        ring.push(packet(1));
        let cursor = ring.join_cursor();
        assert_eq!(ring.try_read(&cursor).map(|p| p.sequence_id), Some(1));

        let empty = RingBuffer::new(10);
        let cursor = empty.join_cursor();
        empty.push(packet(0));
        empty.push(packet(1));
        assert_eq!(empty.try_read(&cursor).map(|p| p.sequence_id), Some(1));
    }

    #[test]
    fn cleared_ring_only_yields_later_packets() {
        let ring = RingBuffer::new(6);
        for pts in 0..9 {
            ring.push(packet(pts));
        }
        ring.clear();
        assert_eq!(ring.live_count(), 0);
        assert_eq!(ring.write_index(), None);
        assert_eq!(ring.latest_sequence_id(), 9);

        let cursor = ring.join_cursor();
        assert!(ring.try_read(&cursor).is_none());
        ring.push(packet(100));
        ring.push(packet(101));
        let first = ring.try_read(&cursor).expect("fresh packet after clear");
        assert_eq!((first.sequence_id, first.pts), (10, 100));
    }
}
