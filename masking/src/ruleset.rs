//! Keep rules: the absolute-sequence byte ranges preserved per flow direction.
//!
//! Rules are half-open `[seq_start, seq_end)` in modular 32-bit sequence
//! space. Internally every range is normalized into the extended space
//! `[0, 2^32]` so that `end > start` always holds; a wire rule that wraps the
//! 32-bit boundary is split into two stored ranges at construction time.
//! Lookups therefore reduce to a binary search over a sorted range list.

use crate::flow::FlowKey;
use fnv::FnvHashMap;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

const SEQ_SPACE: u64 = 1 << 32;

/// A keep rule as it appears on the wire: modular sequence numbers, where
/// `seq_end < seq_start` denotes a range wrapping the 32-bit boundary.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct KeepRule {
    pub flow: FlowKey,
    pub seq_start: u32,
    pub seq_end: u32,
}

/// Normalized range plus the merge class it belongs to.
///
/// Ranges that keep a whole TLS record may fuse with abutting whole-record
/// ranges. A range protecting only an ApplicationData header must stay
/// separate, since the bytes after it are deliberately not kept.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
struct Span {
    start: u64,
    end: u64,
    mergeable: bool,
}

#[derive(Default)]
pub struct RuleSetBuilder {
    flows: FnvHashMap<FlowKey, Vec<Span>>,
}

impl RuleSetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a flow direction without keeping any of its bytes.
    ///
    /// An analyzed flow with no rules is distinct from an unknown flow: the
    /// applier zeroes the former unconditionally, while the latter falls
    /// under the unanalyzed-flow policy.
    pub fn touch(&mut self, flow: FlowKey) {
        self.flows.entry(flow).or_default();
    }

    /// Add a keep range. Zero-length ranges are dropped, wrapping ranges are
    /// split. `mergeable` marks whole-record ranges that may fuse with
    /// abutting whole-record neighbors.
    pub fn keep(&mut self, flow: FlowKey, seq_start: u32, seq_end: u32, mergeable: bool) {
        if seq_start == seq_end {
            return;
        }
        let spans = self.flows.entry(flow).or_default();
        let start = u64::from(seq_start);
        let end = u64::from(seq_end);
        if end > start {
            spans.push(Span {
                start,
                end,
                mergeable,
            });
        } else {
            spans.push(Span {
                start,
                end: SEQ_SPACE,
                mergeable,
            });
            if end > 0 {
                spans.push(Span {
                    start: 0,
                    end,
                    mergeable,
                });
            }
        }
    }

    pub fn build(self) -> KeepRuleSet {
        let flows = self
            .flows
            .into_iter()
            .map(|(flow, mut spans)| {
                spans.sort_by_key(|s| (s.start, s.end));
                let mut merged: Vec<Span> = Vec::with_capacity(spans.len());
                for span in spans {
                    match merged.last_mut() {
                        // Overlapping ranges always union: they keep the
                        // same bytes twice (retransmission artifacts).
                        Some(last) if span.start < last.end => {
                            last.end = last.end.max(span.end);
                            last.mergeable = last.mergeable && span.mergeable;
                        }
                        // Abutting ranges fuse only when both sides are
                        // whole-record keeps.
                        Some(last)
                            if span.start == last.end && last.mergeable && span.mergeable =>
                        {
                            last.end = span.end;
                        }
                        _ => merged.push(span),
                    }
                }
                let ranges = merged.into_iter().map(|s| (s.start, s.end)).collect();
                (flow, FlowRules { ranges })
            })
            .collect();
        KeepRuleSet { flows }
    }
}

#[derive(Clone, Debug)]
struct FlowRules {
    /// Sorted, non-overlapping, non-empty ranges in `[0, 2^32]`.
    ranges: Vec<(u64, u64)>,
}

impl FlowRules {
    /// Intersect the payload span `[seq, seq + len)` with the kept ranges,
    /// returning payload-local `[start, end)` offset pairs.
    fn kept_intervals(&self, seq: u32, len: usize) -> Vec<(usize, usize)> {
        if len == 0 {
            return Vec::new();
        }
        let seq = u64::from(seq);
        let end = seq + len as u64;
        // A payload crossing the 2^32 boundary is looked up as two spans,
        // the second shifted back by the part before the boundary.
        let mut segments: Vec<(u64, u64, usize)> = Vec::with_capacity(2);
        segments.push((seq, end.min(SEQ_SPACE), 0));
        if end > SEQ_SPACE {
            segments.push((0, end - SEQ_SPACE, (SEQ_SPACE - seq) as usize));
        }

        let mut out = Vec::new();
        for (lo, hi, base) in segments {
            let mut idx = self.ranges.partition_point(|&(_, range_end)| range_end <= lo);
            while let Some(&(start, stop)) = self.ranges.get(idx) {
                if start >= hi {
                    break;
                }
                let from = start.max(lo);
                let to = stop.min(hi);
                if to > from {
                    out.push(((from - lo) as usize + base, (to - lo) as usize + base));
                }
                idx += 1;
            }
        }
        out
    }
}

/// The complete set of keep rules for one capture, keyed by flow direction.
///
/// Built once by the analyzer, consumed read-only by the applier.
#[derive(Clone, Debug, Default)]
pub struct KeepRuleSet {
    flows: FnvHashMap<FlowKey, FlowRules>,
}

impl KeepRuleSet {
    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    pub fn rule_count(&self) -> usize {
        self.flows.values().map(|r| r.ranges.len()).sum()
    }

    /// Whether this flow direction was analyzed (even if nothing is kept).
    pub fn contains_flow(&self, flow: &FlowKey) -> bool {
        self.flows.contains_key(flow)
    }

    /// Payload-local `[start, end)` intervals of `[seq, seq + len)` that must
    /// be preserved. Empty for unknown flows and zero-length payloads.
    pub fn kept_intervals(&self, flow: &FlowKey, seq: u32, len: usize) -> Vec<(usize, usize)> {
        match self.flows.get(flow) {
            Some(rules) => rules.kept_intervals(seq, len),
            None => Vec::new(),
        }
    }

    /// All rules in wire form, ordered by flow and sequence, for diagnostics.
    pub fn rules(&self) -> Vec<KeepRule> {
        self.flows
            .iter()
            .sorted_by_key(|(flow, _)| **flow)
            .flat_map(|(flow, rules)| {
                let flow = *flow;
                rules.ranges.iter().map(move |&(start, end)| KeepRule {
                    flow,
                    seq_start: start as u32,
                    // 2^32 truncates to 0, the wire form of "up to the wrap".
                    seq_end: end as u32,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::net::IpAddr;

    fn flow() -> FlowKey {
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();
        FlowKey::new(a, 50000, b, 443)
    }

    fn build(ranges: &[(u32, u32, bool)]) -> KeepRuleSet {
        let mut builder = RuleSetBuilder::new();
        for &(start, end, mergeable) in ranges {
            builder.keep(flow(), start, end, mergeable);
        }
        builder.build()
    }

    #[test]
    fn test_lookup_simple_overlap() {
        let set = build(&[(100, 110, true)]);
        assert_eq!(set.kept_intervals(&flow(), 90, 30), vec![(10, 20)]);
        assert_eq!(set.kept_intervals(&flow(), 100, 10), vec![(0, 10)]);
        assert_eq!(set.kept_intervals(&flow(), 105, 3), vec![(0, 3)]);
        assert_eq!(set.kept_intervals(&flow(), 110, 10), vec![]);
    }

    #[test]
    fn test_lookup_zero_length_payload() {
        let set = build(&[(100, 110, true)]);
        assert_eq!(set.kept_intervals(&flow(), 100, 0), vec![]);
    }

    #[test]
    fn test_unknown_flow_keeps_nothing() {
        let set = build(&[(100, 110, true)]);
        assert_eq!(set.kept_intervals(&flow().reversed(), 100, 10), vec![]);
        assert!(!set.contains_flow(&flow().reversed()));
    }

    #[test]
    fn test_overlap_always_unions() {
        let set = build(&[(100, 110, false), (105, 120, false)]);
        assert_eq!(set.rule_count(), 1);
        assert_eq!(set.kept_intervals(&flow(), 100, 25), vec![(0, 20)]);
    }

    #[test]
    fn test_abutting_merge_requires_both_mergeable() {
        // Whole-record keeps fuse.
        let set = build(&[(100, 110, true), (110, 120, true)]);
        assert_eq!(set.rule_count(), 1);

        // An ApplicationData header keep never fuses with its neighbor.
        let set = build(&[(100, 110, true), (110, 115, false)]);
        assert_eq!(set.rule_count(), 2);
        let set = build(&[(100, 105, false), (105, 115, true)]);
        assert_eq!(set.rule_count(), 2);
    }

    #[test]
    fn test_insertion_order_does_not_matter() {
        let a = build(&[(100, 110, true), (200, 210, true), (110, 120, true)]);
        let b = build(&[(110, 120, true), (100, 110, true), (200, 210, true)]);
        assert_eq!(a.rules(), b.rules());
        assert_eq!(a.rule_count(), 2);
    }

    #[test]
    fn test_zero_length_rule_dropped() {
        let set = build(&[(100, 100, true)]);
        assert_eq!(set.rule_count(), 0);
        // The flow still counts as analyzed.
        assert!(set.contains_flow(&flow()));
    }

    #[test]
    fn test_wrapping_rule_split_and_lookup() {
        // [0xffff_fff0, 0x10) wraps: 16 bytes before and 16 after the boundary.
        let set = build(&[(0xffff_fff0, 0x10, true)]);
        assert_eq!(set.rule_count(), 2);

        // Payload also crossing the boundary: everything is kept.
        assert_eq!(
            set.kept_intervals(&flow(), 0xffff_fff0, 32),
            vec![(0, 16), (16, 32)]
        );

        // Payload entirely after the wrap.
        assert_eq!(set.kept_intervals(&flow(), 0, 16), vec![(0, 16)]);
        assert_eq!(set.kept_intervals(&flow(), 8, 16), vec![(0, 8)]);

        // Payload entirely before the wrap.
        assert_eq!(set.kept_intervals(&flow(), 0xffff_ffe0, 32), vec![(16, 32)]);
    }

    #[test]
    fn test_wire_form_of_wrapping_rule() {
        let set = build(&[(0xffff_fff0, 0, true)]);
        let rules = set.rules();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].seq_start, 0xffff_fff0);
        assert_eq!(rules[0].seq_end, 0);
    }

    #[test]
    fn test_rules_serialize_for_diagnostics() {
        let set = build(&[(100, 110, true)]);
        let json = serde_json::to_string(&set.rules()).unwrap();
        assert!(json.contains("\"seq_start\":100"));
        assert!(json.contains("\"seq_end\":110"));
    }

    #[test]
    fn test_gap_between_rules_not_kept() {
        let set = build(&[(100, 105, false), (125, 130, false)]);
        assert_eq!(
            set.kept_intervals(&flow(), 100, 30),
            vec![(0, 5), (25, 30)]
        );
    }
}
