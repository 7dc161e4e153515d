//! Sequence-ordered containers for the sender and receiver engines.
//!
//! All containers key on the raw 31-bit sequence value and answer ordered
//!  queries relative to a pivot (the engine's current window base). The
//!  protocol guarantees every live entry lies within half the sequence space
//!  ahead of its pivot, so "wrap order from the pivot" is simply: entries at
//!  or above the pivot's raw value first, then the entries that wrapped.

use crate::packet::{DataPacket, LossRange};
use crate::packet_id::PacketId;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Instant;

/// An ordered set of sequence numbers, used as the sender's loss list.
#[derive(Default, Debug)]
pub struct PacketIdSet {
    ids: BTreeSet<u32>,
}

impl PacketIdSet {
    /// Returns false if the id was already present.
    pub fn insert(&mut self, id: PacketId) -> bool {
        self.ids.insert(id.to_raw())
    }

    pub fn remove(&mut self, id: PacketId) -> bool {
        self.ids.remove(&id.to_raw())
    }

    pub fn contains(&self, id: PacketId) -> bool {
        self.ids.contains(&id.to_raw())
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// The smallest id at or above `pivot` in wrap order.
    pub fn min_from(&self, pivot: PacketId) -> Option<PacketId> {
        self.ids
            .range(pivot.to_raw()..)
            .next()
            .or_else(|| self.ids.iter().next())
            .copied()
            .map(PacketId::from_raw)
    }

    pub fn pop_min(&mut self, pivot: PacketId) -> Option<PacketId> {
        let id = self.min_from(pivot)?;
        self.ids.remove(&id.to_raw());
        Some(id)
    }

    /// Drops every id strictly below `threshold` in protocol order.
    pub fn remove_below(&mut self, threshold: PacketId) {
        self.ids.retain(|&raw| !(PacketId::from_raw(raw) < threshold));
    }

    /// Drops every id in the inclusive range `[first, last]`.
    pub fn remove_range(&mut self, first: PacketId, last: PacketId) {
        for id in first.seq_range(last.next()) {
            self.ids.remove(&id.to_raw());
        }
    }
}

/// A sequence-ordered buffer of data packets: the sender's retransmission
///  store and the receiver's out-of-order reassembly store.
#[derive(Default, Debug)]
pub struct DataPacketBuffer {
    packets: BTreeMap<u32, DataPacket>,
}

impl DataPacketBuffer {
    /// Returns false (and keeps the original) if the sequence is already buffered.
    pub fn insert(&mut self, packet: DataPacket) -> bool {
        let raw = packet.seq.to_raw();
        if self.packets.contains_key(&raw) {
            return false;
        }
        self.packets.insert(raw, packet);
        true
    }

    pub fn get(&self, seq: PacketId) -> Option<&DataPacket> {
        self.packets.get(&seq.to_raw())
    }

    pub fn remove(&mut self, seq: PacketId) -> Option<DataPacket> {
        self.packets.remove(&seq.to_raw())
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    /// The smallest buffered sequence at or above `pivot` in wrap order.
    pub fn min_from(&self, pivot: PacketId) -> Option<PacketId> {
        self.packets
            .range(pivot.to_raw()..)
            .next()
            .or_else(|| self.packets.iter().next())
            .map(|(&raw, _)| PacketId::from_raw(raw))
    }

    /// All buffered sequence numbers; bounded by the flow window.
    pub fn ids(&self) -> Vec<PacketId> {
        self.packets.keys().map(|&raw| PacketId::from_raw(raw)).collect()
    }

    /// The smallest buffered sequence strictly above `seq` in wrap order.
    pub fn upper_bound(&self, seq: PacketId) -> Option<PacketId> {
        self.min_from(seq.next())
    }

    /// Drops every packet strictly below `threshold` in protocol order.
    pub fn remove_below(&mut self, threshold: PacketId) {
        self.packets.retain(|&raw, _| !(PacketId::from_raw(raw) < threshold));
    }

    pub fn remove_range(&mut self, first: PacketId, last: PacketId) {
        for id in first.seq_range(last.next()) {
            self.packets.remove(&id.to_raw());
        }
    }
}

#[derive(Debug)]
struct LossEntry {
    last_nak: Instant,
    nak_count: u32,
}

/// The receiver's loss list: unreceived sequences with NAK bookkeeping.
#[derive(Default, Debug)]
pub struct LossList {
    entries: BTreeMap<u32, LossEntry>,
}

impl LossList {
    /// Registers `[first, last)` as missing; already-known entries keep their
    ///  NAK metadata.
    pub fn register(&mut self, first: PacketId, last: PacketId, now: Instant) {
        for id in first.seq_range(last) {
            self.entries
                .entry(id.to_raw())
                .or_insert(LossEntry { last_nak: now, nak_count: 1 });
        }
    }

    pub fn remove(&mut self, seq: PacketId) -> bool {
        self.entries.remove(&seq.to_raw()).is_some()
    }

    pub fn contains(&self, seq: PacketId) -> bool {
        self.entries.contains_key(&seq.to_raw())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn remove_below(&mut self, threshold: PacketId) {
        self.entries.retain(|&raw, _| !(PacketId::from_raw(raw) < threshold));
    }

    pub fn remove_range(&mut self, first: PacketId, last: PacketId) {
        for id in first.seq_range(last.next()) {
            self.entries.remove(&id.to_raw());
        }
    }

    /// Collects the entries due for a NAK re-issue, compressed into ranges in
    ///  wrap order from `pivot`, and advances their NAK metadata. An entry is
    ///  due when `now - last_nak >= interval * nak_count`.
    pub fn due_ranges(&mut self, pivot: PacketId, now: Instant, interval_us: u64) -> Vec<LossRange> {
        let due: Vec<u32> = self
            .entries
            .range(pivot.to_raw()..)
            .chain(self.entries.range(..pivot.to_raw()))
            .filter(|(_, e)| {
                now.duration_since(e.last_nak).as_micros() as u64 >= interval_us * e.nak_count as u64
            })
            .map(|(&raw, _)| raw)
            .collect();

        for raw in &due {
            let entry = self.entries.get_mut(raw).expect("entry collected above");
            entry.last_nak = now;
            entry.nak_count += 1;
        }

        compress_ranges(due.into_iter().map(PacketId::from_raw))
    }
}

/// Builds inclusive NAK ranges from ids that are already in wrap order.
pub fn compress_ranges(ids: impl IntoIterator<Item = PacketId>) -> Vec<LossRange> {
    let mut ranges: Vec<LossRange> = Vec::new();
    for id in ids {
        match ranges.last_mut() {
            Some(range) if range.last.next() == id => range.last = id,
            _ => ranges.push(LossRange::single(id)),
        }
    }
    ranges
}

#[derive(Debug)]
pub struct AckHistoryEntry {
    pub ack_seq_no: u32,
    pub recv_next: PacketId,
    pub sent: Instant,
}

/// Full ACKs awaiting their ACK2, in emission order.
#[derive(Default, Debug)]
pub struct AckHistory {
    entries: VecDeque<AckHistoryEntry>,
}

impl AckHistory {
    pub fn push(&mut self, entry: AckHistoryEntry) {
        self.entries.push_back(entry);
    }

    /// Removes the entry matching an ACK2's sequence number, along with every
    ///  older entry (their ACK2s are either lost or implied).
    pub fn take(&mut self, ack_seq_no: u32) -> Option<AckHistoryEntry> {
        let pos = self.entries.iter().position(|e| e.ack_seq_no == ack_seq_no)?;
        let entry = self.entries.remove(pos);
        self.entries.drain(..pos.min(self.entries.len()));
        entry
    }

    /// Drops entries older than `max_age`; their ACK2 is not coming.
    pub fn expire(&mut self, now: Instant, max_age: std::time::Duration) {
        while let Some(front) = self.entries.front() {
            if now.duration_since(front.sent) < max_age {
                break;
            }
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{MessageBoundary};
    use crate::packet_id::MessageId;
    use bytes::Bytes;
    use rstest::rstest;
    use std::time::Duration;

    fn data(seq: u32) -> DataPacket {
        DataPacket {
            seq: PacketId::from_raw(seq),
            boundary: MessageBoundary::Only,
            in_order: false,
            message_id: MessageId::ZERO,
            timestamp: 0,
            dst_conn_id: 0,
            payload: Bytes::new(),
        }
    }

    const WRAP: u32 = 1 << 31;

    #[rstest]
    #[case::plain(vec![5, 9, 7], 4, Some(5))]
    #[case::pivot_inside(vec![5, 9, 7], 6, Some(7))]
    #[case::pivot_exact(vec![5, 9, 7], 9, Some(9))]
    #[case::wrapped(vec![WRAP - 2, 1, WRAP - 1], WRAP - 3, Some(WRAP - 2))]
    #[case::wrapped_pivot_after_wrap(vec![WRAP - 2, 1], 0, Some(1))]
    #[case::empty(vec![], 0, None)]
    fn test_id_set_min_from(#[case] ids: Vec<u32>, #[case] pivot: u32, #[case] expected: Option<u32>) {
        let mut set = PacketIdSet::default();
        for id in ids {
            set.insert(PacketId::from_raw(id));
        }
        assert_eq!(set.min_from(PacketId::from_raw(pivot)), expected.map(PacketId::from_raw));
    }

    #[test]
    fn test_id_set_pop_min_across_wrap() {
        let mut set = PacketIdSet::default();
        for id in [WRAP - 1, 0, 1, WRAP - 2] {
            set.insert(PacketId::from_raw(id));
        }
        let pivot = PacketId::from_raw(WRAP - 2);
        let popped: Vec<u32> = std::iter::from_fn(|| set.pop_min(pivot).map(PacketId::to_raw)).collect();
        assert_eq!(popped, vec![WRAP - 2, WRAP - 1, 0, 1]);
    }

    #[test]
    fn test_id_set_insert_is_unique() {
        let mut set = PacketIdSet::default();
        assert!(set.insert(PacketId::from_raw(3)));
        assert!(!set.insert(PacketId::from_raw(3)));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_id_set_remove_below_across_wrap() {
        let mut set = PacketIdSet::default();
        for id in [WRAP - 2, WRAP - 1, 0, 1, 2] {
            set.insert(PacketId::from_raw(id));
        }
        set.remove_below(PacketId::from_raw(1));
        assert!(!set.contains(PacketId::from_raw(WRAP - 1)));
        assert!(!set.contains(PacketId::from_raw(0)));
        assert!(set.contains(PacketId::from_raw(1)));
        assert!(set.contains(PacketId::from_raw(2)));
    }

    #[test]
    fn test_data_buffer_find_and_upper_bound_across_wrap() {
        let mut buffer = DataPacketBuffer::default();
        for seq in [WRAP - 1, 1] {
            assert!(buffer.insert(data(seq)));
        }
        assert!(buffer.get(PacketId::from_raw(WRAP - 1)).is_some());
        assert_eq!(buffer.upper_bound(PacketId::from_raw(WRAP - 1)), Some(PacketId::from_raw(1)));
        assert_eq!(
            buffer.min_from(PacketId::from_raw(WRAP - 2)),
            Some(PacketId::from_raw(WRAP - 1))
        );
    }

    #[test]
    fn test_data_buffer_rejects_duplicate_seq() {
        let mut buffer = DataPacketBuffer::default();
        assert!(buffer.insert(data(7)));
        assert!(!buffer.insert(data(7)));
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_loss_list_register_and_due() {
        let t0 = Instant::now();
        let mut loss = LossList::default();
        loss.register(PacketId::from_raw(10), PacketId::from_raw(13), t0);
        assert_eq!(loss.len(), 3);

        // entries were just NAK'ed once (registration), nothing due yet
        assert!(loss.due_ranges(PacketId::from_raw(10), t0, 10_000).is_empty());

        // after one interval the first-round entries become due as one range
        let due = loss.due_ranges(PacketId::from_raw(10), t0 + Duration::from_millis(10), 10_000);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].first, PacketId::from_raw(10));
        assert_eq!(due[0].last, PacketId::from_raw(12));

        // the nak_count is now 2, so the next re-issue needs twice the interval
        assert!(loss
            .due_ranges(PacketId::from_raw(10), t0 + Duration::from_millis(25), 10_000)
            .is_empty());
        assert_eq!(
            loss.due_ranges(PacketId::from_raw(10), t0 + Duration::from_millis(30), 10_000)
                .len(),
            1
        );
    }

    #[test]
    fn test_loss_list_due_ranges_split_on_gap() {
        let t0 = Instant::now();
        let mut loss = LossList::default();
        loss.register(PacketId::from_raw(5), PacketId::from_raw(7), t0);
        loss.register(PacketId::from_raw(9), PacketId::from_raw(10), t0);

        let due = loss.due_ranges(PacketId::from_raw(5), t0 + Duration::from_millis(20), 10_000);
        assert_eq!(due.len(), 2);
        assert_eq!((due[0].first.to_raw(), due[0].last.to_raw()), (5, 6));
        assert_eq!((due[1].first.to_raw(), due[1].last.to_raw()), (9, 9));
    }

    #[test]
    fn test_loss_list_wrap_order() {
        let t0 = Instant::now();
        let mut loss = LossList::default();
        loss.register(PacketId::from_raw(WRAP - 1), PacketId::from_raw(1), t0);

        let due = loss.due_ranges(PacketId::from_raw(WRAP - 1), t0 + Duration::from_millis(20), 10_000);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].first, PacketId::from_raw(WRAP - 1));
        assert_eq!(due[0].last, PacketId::from_raw(0));
    }

    #[test]
    fn test_ack_history_take_prunes_older_entries() {
        let now = Instant::now();
        let mut history = AckHistory::default();
        for n in 1..=3 {
            history.push(AckHistoryEntry {
                ack_seq_no: n,
                recv_next: PacketId::from_raw(n * 10),
                sent: now,
            });
        }

        let taken = history.take(2).expect("entry 2 present");
        assert_eq!(taken.recv_next, PacketId::from_raw(20));
        // entry 1 is dropped alongside, entry 3 stays
        assert!(history.take(1).is_none());
        assert!(history.take(3).is_some());
    }

    #[test]
    fn test_ack_history_expire() {
        let t0 = Instant::now();
        let mut history = AckHistory::default();
        history.push(AckHistoryEntry { ack_seq_no: 1, recv_next: PacketId::ZERO, sent: t0 });
        history.push(AckHistoryEntry {
            ack_seq_no: 2,
            recv_next: PacketId::ZERO,
            sent: t0 + Duration::from_secs(5),
        });

        history.expire(t0 + Duration::from_secs(6), Duration::from_secs(3));
        assert_eq!(history.len(), 1);
        assert!(history.take(2).is_some());
    }
}
