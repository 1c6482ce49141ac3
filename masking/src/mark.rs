//! The analyzer: derive keep rules from the TLS records of a capture.
//!
//! Works best on a reassembled capture, but degrades gracefully: segments
//! are sequenced per direction with [`StreamBuffer`], retransmissions are
//! filtered, and out-of-order data whose gap never closes is recovered at
//! end of capture when it is still aligned on record boundaries.

use crate::{
    flow::{BidiKey, FlowKey},
    ruleset::{KeepRuleSet, RuleSetBuilder},
    stream::StreamBuffer,
    tls::{self, RecordHeader, RecordType},
};
use anyhow::{bail, Error};
use capture::{dissect::Dissection, Dissector, FrameReader};
use fnv::{FnvHashMap, FnvHashSet};
use log::{debug, trace, warn};
use serde::Serialize;
use std::path::Path;

/// Per record-type tallies, published in the run report.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct RecordTypeCounts {
    pub change_cipher_spec: u64,
    pub alert: u64,
    pub handshake: u64,
    pub application_data: u64,
    pub heartbeat: u64,
    pub unknown: u64,
}

impl RecordTypeCounts {
    fn bump(&mut self, record_type: RecordType) {
        match record_type {
            RecordType::ChangeCipherSpec => self.change_cipher_spec += 1,
            RecordType::Alert => self.alert += 1,
            RecordType::Handshake => self.handshake += 1,
            RecordType::ApplicationData => self.application_data += 1,
            RecordType::Heartbeat => self.heartbeat += 1,
            RecordType::Unknown(_) => self.unknown += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.change_cipher_spec
            + self.alert
            + self.handshake
            + self.application_data
            + self.heartbeat
            + self.unknown
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct MarkStats {
    pub frames: u64,
    pub tcp_payload_frames: u64,
    /// Flow directions that carried TCP payload.
    pub flows: usize,
    /// Two-way TCP connections behind those directions.
    pub connections: usize,
    pub records: RecordTypeCounts,
    pub rules: usize,
    pub frame_errors: u64,
}

/// How many bytes a direction may buffer while its start still does not
/// parse as TLS. Generously above the largest legal record.
const UNALIGNED_BUFFER_LIMIT: usize = 64 * 1024;

#[derive(Default)]
struct DirectionState {
    buffer: StreamBuffer,
    /// The direction produced at least one well-formed TLS record.
    saw_tls: bool,
    /// Analysis gave up on this direction; its bytes stay unkept.
    sync_lost: bool,
}

/// Analyze a capture and derive the keep rules for every flow direction.
///
/// Every direction that carries TCP payload is registered in the resulting
/// rule set, so the applier zeroes analyzed-but-ruleless flows instead of
/// falling back to the unanalyzed-flow policy.
pub fn analyze(path: &Path, dissector: &Dissector) -> Result<(KeepRuleSet, MarkStats), Error> {
    let mut reader = FrameReader::open(path)?;
    let meta = reader.meta();
    for iface in &meta.interfaces {
        if !Dissector::supports_linktype(iface.linktype) {
            bail!(
                "unsupported link type {} in {}",
                iface.linktype,
                path.display()
            );
        }
    }

    let mut builder = RuleSetBuilder::new();
    let mut states: FnvHashMap<FlowKey, DirectionState> = FnvHashMap::default();
    let mut stats = MarkStats::default();

    while let Some(frame) = reader.next_frame()? {
        stats.frames += 1;
        if frame.is_truncated() {
            warn!(
                "frame {}: captured {} of {} bytes, skipping",
                frame.index,
                frame.data.len(),
                frame.orig_len
            );
            stats.frame_errors += 1;
            continue;
        }
        // The reader validated the interface reference.
        let linktype = meta.interfaces[frame.iface as usize].linktype;
        let pkt = match dissector.dissect(linktype, &frame.data) {
            Ok(Dissection::Tcp(pkt)) => pkt,
            Ok(Dissection::Other) => continue,
            Err(err) => {
                warn!("frame {}: {}", frame.index, err);
                stats.frame_errors += 1;
                continue;
            }
        };
        let payload = &frame.data[pkt.payload.clone()];
        if payload.is_empty() {
            continue;
        }
        stats.tcp_payload_frames += 1;

        let flow = FlowKey::new(
            pkt.ip.src_addr(),
            pkt.tcp.src_port,
            pkt.ip.dst_addr(),
            pkt.tcp.dst_port,
        );
        builder.touch(flow);
        let dir = states.entry(flow).or_default();
        if dir.sync_lost {
            continue;
        }
        if !dir.buffer.add_segment(pkt.tcp.seq, payload) {
            trace!("frame {}: retransmission of seq {}", frame.index, pkt.tcp.seq);
            continue;
        }
        debug!("({:>2}) processing TCP segment of {}", frame.index, flow);
        drain_records(dir, flow, &mut builder, &mut stats.records)?;
    }

    for (flow, dir) in states.iter_mut() {
        if dir.sync_lost {
            continue;
        }
        flush_direction(dir, *flow, &mut builder, &mut stats.records)?;
    }

    stats.connections = states
        .keys()
        .map(|flow| BidiKey::from(*flow))
        .collect::<FnvHashSet<_>>()
        .len();
    let ruleset = builder.build();
    stats.flows = ruleset.flow_count();
    stats.rules = ruleset.rule_count();
    debug!(
        "analyzed {} frames, {} directions over {} connections, {} records, {} rules",
        stats.frames,
        stats.flows,
        stats.connections,
        stats.records.total(),
        stats.rules
    );
    Ok((ruleset, stats))
}

/// Parse and consume every complete record currently at the buffer head.
fn drain_records(
    dir: &mut DirectionState,
    flow: FlowKey,
    builder: &mut RuleSetBuilder,
    counts: &mut RecordTypeCounts,
) -> Result<(), Error> {
    loop {
        let header = match tls::parse_record_header(dir.buffer.data()) {
            Some(header) => header,
            // Fewer than 5 bytes buffered; wait for the next segment.
            None => return Ok(()),
        };
        if !dir.saw_tls {
            // The first record decides whether this direction is TLS at all.
            // An implausible start is not final yet: a capture that began
            // mid-flight may still receive the true stream head, which
            // prepends and realigns the buffer. Give up once the buffered
            // bytes clearly exceed anything a record boundary could fix.
            if !header.is_plausible() {
                if dir.buffer.data().len() > UNALIGNED_BUFFER_LIMIT {
                    trace!("{} does not open with a TLS record, zeroing", flow);
                    dir.sync_lost = true;
                }
                return Ok(());
            }
            dir.saw_tls = true;
        } else if header.body_len > tls::MAX_RECORD_BODY {
            warn!(
                "{}: record length {} exceeds the TLS maximum, analysis stops here",
                flow, header.body_len
            );
            dir.sync_lost = true;
            return Ok(());
        }
        if dir.buffer.data().len() < header.total_len() {
            // The body is still in flight.
            return Ok(());
        }
        let start = match dir.buffer.head_seq() {
            Some(seq) => seq,
            None => bail!("stream buffer holds data but no head sequence"),
        };
        emit_record(builder, counts, flow, start, &header);
        dir.buffer.consume(header.total_len())?;
    }
}

/// End-of-capture handling for one direction: a record whose body is
/// truncated still yields its rule, an unfinished header keeps its observed
/// bytes, and parked out-of-order runs are scanned for aligned records.
fn flush_direction(
    dir: &mut DirectionState,
    flow: FlowKey,
    builder: &mut RuleSetBuilder,
    counts: &mut RecordTypeCounts,
) -> Result<(), Error> {
    match tls::parse_record_header(dir.buffer.data()) {
        Some(header) => {
            let trusted = (dir.saw_tls && header.body_len <= tls::MAX_RECORD_BODY)
                || header.is_plausible();
            if trusted {
                let start = match dir.buffer.head_seq() {
                    Some(seq) => seq,
                    None => bail!("stream buffer holds data but no head sequence"),
                };
                emit_record(builder, counts, flow, start, &header);
            }
        }
        None => {
            if dir.saw_tls && !dir.buffer.data().is_empty() {
                // Sub-header tail: these bytes open the next record and a
                // continuation of the capture would have kept them.
                let start = match dir.buffer.head_seq() {
                    Some(seq) => seq,
                    None => bail!("stream buffer holds data but no head sequence"),
                };
                let len = dir.buffer.data().len();
                builder.keep(flow, start, start.wrapping_add(len as u32), true);
            }
        }
    }
    let len = dir.buffer.data().len();
    dir.buffer.consume(len)?;

    for (run_seq, bytes) in dir.buffer.take_parked_runs() {
        scan_parked_run(builder, counts, flow, run_seq, &bytes);
    }
    Ok(())
}

/// Parse records out of an out-of-order run that never connected to the
/// in-order stream. Without stream context every header must look like TLS
/// on its own; scanning stops at the first one that does not.
fn scan_parked_run(
    builder: &mut RuleSetBuilder,
    counts: &mut RecordTypeCounts,
    flow: FlowKey,
    run_seq: u32,
    bytes: &[u8],
) {
    let mut offset = 0usize;
    while let Some(header) = tls::parse_record_header(&bytes[offset..]) {
        if !header.is_plausible() {
            trace!(
                "{}: out-of-order run loses alignment after {} bytes",
                flow,
                offset
            );
            return;
        }
        let start = run_seq.wrapping_add(offset as u32);
        emit_record(builder, counts, flow, start, &header);
        offset += header.total_len();
        if offset >= bytes.len() {
            return;
        }
    }
}

fn emit_record(
    builder: &mut RuleSetBuilder,
    counts: &mut RecordTypeCounts,
    flow: FlowKey,
    header_seq_start: u32,
    header: &RecordHeader,
) {
    // On the wire the single type byte is the content type for TLS <= 1.2
    // and the opaque type for encrypted TLS 1.3 records; either way it is
    // the byte that decides what survives masking.
    let record_type = header.record_type;
    counts.bump(record_type);
    let keep_len = if record_type.keeps_whole_record() {
        header.total_len()
    } else {
        tls::RECORD_HEADER_LEN
    };
    let end = header_seq_start.wrapping_add(keep_len as u32);
    trace!(
        "{:?} {} [{}, {}) of {}B",
        record_type,
        flow,
        header_seq_start,
        end,
        header.total_len()
    );
    builder.keep(
        flow,
        header_seq_start,
        end,
        record_type.keeps_whole_record(),
    );
}
