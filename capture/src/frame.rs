//! The frame record and its exact-precision capture timestamp.

use std::cmp::Ordering;

/// A capture timestamp in the native tick units of the originating file.
///
/// Legacy pcap stores seconds plus micro- or nanoseconds (depending on the
/// file magic), pcapng stores a single 64-bit counter whose resolution is
/// declared per interface. Keeping the raw units around means a timestamp
/// read from a file can be written back bit-for-bit.
///
/// Comparison and equality are by the instant denoted, so timestamps of
/// different resolutions compare meaningfully.
#[derive(Copy, Clone, Debug)]
pub struct Timestamp {
    units: u64,
    ticks_per_second: u64,
}

impl Timestamp {
    pub fn new(units: u64, ticks_per_second: u64) -> Self {
        assert!(ticks_per_second > 0);
        Self {
            units,
            ticks_per_second,
        }
    }

    /// Build a timestamp from a seconds/sub-second pair, e.g. the two fields
    /// of a legacy pcap record header.
    pub fn from_sec_frac(sec: u64, frac: u64, ticks_per_second: u64) -> Self {
        assert!(ticks_per_second > 0);
        assert!(frac < ticks_per_second);
        Self {
            units: sec * ticks_per_second + frac,
            ticks_per_second,
        }
    }

    pub fn units(self) -> u64 {
        self.units
    }

    pub fn ticks_per_second(self) -> u64 {
        self.ticks_per_second
    }

    pub fn seconds(self) -> u64 {
        self.units / self.ticks_per_second
    }

    pub fn subsec_ticks(self) -> u64 {
        self.units % self.ticks_per_second
    }

    /// Sub-second part truncated to microseconds.
    ///
    /// Used for frame-correspondence keys, where two captures of the same
    /// traffic may carry different tick resolutions.
    pub fn subsec_micros(self) -> u32 {
        (self.subsec_ticks() as u128 * 1_000_000 / self.ticks_per_second as u128) as u32
    }

    pub fn subsec_nanos(self) -> u32 {
        (self.subsec_ticks() as u128 * 1_000_000_000 / self.ticks_per_second as u128) as u32
    }
}

impl PartialEq for Timestamp {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Timestamp {}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        // Cross-resolution comparison without precision loss:
        // a/ra < b/rb  <=>  a*rb < b*ra
        let lhs = self.units as u128 * other.ticks_per_second as u128;
        let rhs = other.units as u128 * self.ticks_per_second as u128;
        lhs.cmp(&rhs)
    }
}

/// A single frame as it appears on the wire.
///
/// Frames are immutable once read; masking operates on a copy of the data.
/// They are never reordered or renumbered.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Frame {
    /// Position within the capture file, starting at 1.
    ///
    /// Matches the numbering wireshark displays, which makes cross-checking
    /// a masked capture against the original painless.
    pub index: u32,
    /// Interface the frame was captured on (always 0 for legacy pcap).
    pub iface: u32,
    pub ts: Timestamp,
    /// Captured bytes. May be shorter than `orig_len` for truncated frames.
    pub data: Vec<u8>,
    /// Original on-wire length.
    pub orig_len: u32,
}

impl Frame {
    /// Whether the capture recorded fewer bytes than were on the wire.
    pub fn is_truncated(&self) -> bool {
        (self.data.len() as u32) < self.orig_len
    }
}
