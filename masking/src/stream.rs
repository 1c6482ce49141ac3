//! Per-direction TCP byte sequencing for the analyzer.
//!
//! Segments arrive duplicated, reordered, and with gaps. `StreamBuffer`
//! accepts them keyed by absolute sequence number, exposes the contiguous
//! in-order bytes starting at `head_seq`, and parks out-of-order segments
//! until the gap before them closes. All sequence arithmetic wraps mod 2^32.

use anyhow::{bail, Error};
use std::collections::{BTreeMap, VecDeque};

/// Window of recently seen keys, for retransmission detection.
///
/// Keeps the last `max_size` entries; `insert` reports whether the key was
/// new. TCP retransmits cluster closely, so a short window suffices.
#[derive(Clone, Debug)]
pub struct RecentSet<T: PartialEq> {
    entries: VecDeque<T>,
    max_size: usize,
}

impl<T: PartialEq> RecentSet<T> {
    pub fn new(max_size: usize) -> Self {
        assert!(max_size > 0);
        Self {
            entries: VecDeque::with_capacity(max_size),
            max_size,
        }
    }

    /// Returns `true` if the key was not in the window, inserting it.
    pub fn insert(&mut self, key: T) -> bool {
        if self.entries.contains(&key) {
            return false;
        }
        if self.entries.len() == self.max_size {
            self.entries.pop_front();
        }
        self.entries.push_back(key);
        true
    }
}

/// In-order assembly of one TCP flow direction.
pub struct StreamBuffer {
    recent: RecentSet<u32>,
    /// Absolute sequence number of `data[0]`, once the first segment arrived.
    head_seq: Option<u32>,
    /// Sequence number the next in-order segment must carry.
    next_seq: Option<u32>,
    data: Vec<u8>,
    /// Out-of-order segments, parked until the gap before them closes.
    parked: BTreeMap<u32, Vec<u8>>,
}

impl StreamBuffer {
    pub fn new() -> Self {
        Self {
            recent: RecentSet::new(20),
            head_seq: None,
            next_seq: None,
            data: Vec::with_capacity(4096),
            parked: BTreeMap::new(),
        }
    }

    /// Offer one segment. Returns `false` for retransmissions, which are
    /// dropped without effect.
    pub fn add_segment(&mut self, seq: u32, payload: &[u8]) -> bool {
        if payload.is_empty() {
            return true;
        }
        if !self.recent.insert(seq) {
            return false;
        }
        let chains_before_head = self
            .head_seq
            .map(|head| seq.wrapping_add(payload.len() as u32) == head)
            .unwrap_or(false);
        if self.next_seq.is_none() || self.next_seq == Some(seq) {
            self.accept(seq, payload);
            // Accepting may have closed the gap before parked segments.
            loop {
                let next = match self.next_seq {
                    Some(next) => next,
                    None => break,
                };
                match self.parked.remove(&next) {
                    Some(parked) => self.accept(next, &parked),
                    None => break,
                }
            }
        } else if chains_before_head {
            // The stream was first observed mid-flight; this segment ends
            // exactly where the buffer begins, so it extends the front.
            self.prepend(seq, payload);
        } else {
            self.parked.insert(seq, payload.to_vec());
        }
        true
    }

    fn accept(&mut self, seq: u32, payload: &[u8]) {
        if self.head_seq.is_none() {
            self.head_seq = Some(seq);
        }
        self.next_seq = Some(seq.wrapping_add(payload.len() as u32));
        self.data.extend_from_slice(payload);
    }

    fn prepend(&mut self, seq: u32, payload: &[u8]) {
        self.data.splice(0..0, payload.iter().copied());
        self.head_seq = Some(seq);
        // Parked segments may chain before the new head as well.
        loop {
            let head = match self.head_seq {
                Some(head) => head,
                None => break,
            };
            let chained = self
                .parked
                .iter()
                .find(|(&s, bytes)| s.wrapping_add(bytes.len() as u32) == head)
                .map(|(&s, _)| s);
            match chained {
                Some(s) => {
                    let bytes = self.parked.remove(&s).unwrap_or_default();
                    self.data.splice(0..0, bytes.iter().copied());
                    self.head_seq = Some(s);
                }
                None => break,
            }
        }
    }

    /// Absolute sequence number of the first buffered byte.
    pub fn head_seq(&self) -> Option<u32> {
        self.head_seq
    }

    /// The contiguous in-order bytes currently buffered.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Drop `count` bytes from the front, advancing the head sequence.
    pub fn consume(&mut self, count: usize) -> Result<(), Error> {
        if count > self.data.len() {
            bail!(
                "cannot consume {} bytes, buffer holds {}",
                count,
                self.data.len()
            );
        }
        self.data.drain(..count);
        self.head_seq = self.head_seq.map(|seq| seq.wrapping_add(count as u32));
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.parked.is_empty()
    }

    /// Merge the parked out-of-order segments into contiguous runs and
    /// return them. Used at end of capture, when the gaps before them can
    /// no longer close.
    pub fn take_parked_runs(&mut self) -> Vec<(u32, Vec<u8>)> {
        let mut runs: Vec<(u32, Vec<u8>)> = Vec::new();
        for (seq, bytes) in std::mem::take(&mut self.parked) {
            match runs.last_mut() {
                Some((run_seq, run)) if run_seq.wrapping_add(run.len() as u32) == seq => {
                    run.extend_from_slice(&bytes);
                }
                _ => runs.push((seq, bytes)),
            }
        }
        runs
    }
}

impl Default for StreamBuffer {
    fn default() -> Self {
        Self::new()
    }
}
