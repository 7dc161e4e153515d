use rand::Rng;
use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

/// Modulus of the 31-bit data sequence space.
const SEQ_MODULUS: u32 = 1 << 31;
/// Half of the sequence space; distances below this are "forward".
const SEQ_HALF: u32 = 1 << 30;

/// A 31-bit packet sequence number with wrap-around arithmetic.
///
/// Ordering follows the protocol's half-range rule: `a < b` iff
///  `(b - a) mod 2^31` lies in `(0, 2^30)`. That relation is *not* a total
///  order (two ids exactly `2^30` apart are mutually unordered), so `PacketId`
///  implements `PartialOrd` only. Containers that need ordered traversal key
///  on the raw value and resolve wrap-around relative to a pivot, see
///  `seq_buffers`.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct PacketId(u32);

impl Display for PacketId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl PacketId {
    pub const ZERO: PacketId = PacketId(0);

    /// Wraps the value into the 31-bit sequence space.
    pub fn from_raw(value: u32) -> Self {
        PacketId(value % SEQ_MODULUS)
    }

    pub fn to_raw(self) -> u32 {
        self.0
    }

    /// A random initial sequence number, as assigned at handshake time.
    pub fn random() -> Self {
        PacketId(rand::thread_rng().gen_range(0..SEQ_MODULUS))
    }

    pub fn next(self) -> PacketId {
        PacketId((self.0 + 1) % SEQ_MODULUS)
    }

    pub fn add(self, n: u32) -> PacketId {
        PacketId((self.0 + (n % SEQ_MODULUS)) % SEQ_MODULUS)
    }

    /// The number of steps from `earlier` forward to `self`, mod 2^31.
    pub fn offset_from(self, earlier: PacketId) -> u32 {
        self.0.wrapping_sub(earlier.0) % SEQ_MODULUS
    }

    /// Iterates `self, self+1, .. end` (exclusive), following the wrap.
    ///
    /// The caller must ensure `end` is no more than a flow window ahead; the
    ///  protocol never produces ranges anywhere near the half-range limit.
    pub fn seq_range(self, end: PacketId) -> SeqRangeIter {
        SeqRangeIter { next: self, remaining: end.offset_from(self) }
    }
}

impl PartialOrd for PacketId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.0 == other.0 {
            return Some(Ordering::Equal);
        }
        let forward = other.offset_from(*self);
        if forward == 0 || forward == SEQ_HALF {
            // equal is handled above; exactly half-range apart is unordered
            return None;
        }
        if forward < SEQ_HALF {
            Some(Ordering::Less)
        } else {
            Some(Ordering::Greater)
        }
    }
}

pub struct SeqRangeIter {
    next: PacketId,
    remaining: u32,
}

impl Iterator for SeqRangeIter {
    type Item = PacketId;

    fn next(&mut self) -> Option<PacketId> {
        if self.remaining == 0 {
            return None;
        }
        let id = self.next;
        self.next = self.next.next();
        self.remaining -= 1;
        Some(id)
    }
}

/// Modulus of the 29-bit message counter used in datagram mode.
const MSG_MODULUS: u32 = 1 << 29;

/// A 29-bit message number grouping the fragments of one datagram.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct MessageId(u32);

impl Display for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "msg#{}", self.0)
    }
}

impl MessageId {
    pub const ZERO: MessageId = MessageId(0);

    pub fn from_raw(value: u32) -> Self {
        MessageId(value % MSG_MODULUS)
    }

    pub fn to_raw(self) -> u32 {
        self.0
    }

    pub fn next(self) -> MessageId {
        MessageId((self.0 + 1) % MSG_MODULUS)
    }
}
