//! The applier: rewrite TCP payloads of the original capture per keep rules.
//!
//! Streams frame-for-frame, never reordering or resizing anything. The only
//! bytes that change are payload bytes outside kept intervals (overwritten
//! with zeros) and the checksums covering them.

use crate::{flow::FlowKey, ruleset::KeepRuleSet};
use anyhow::{bail, Error};
use capture::{checksum, dissect::Dissection, CaptureWriter, Dissector, Frame, FrameReader};
use log::{trace, warn};
use serde::Serialize;
use std::{
    fmt,
    path::Path,
    str::FromStr,
    sync::atomic::{AtomicBool, Ordering},
};

/// What happens to TCP payload of flows the analyzer never saw.
///
/// `Zero` is the default: the rule set is the complete statement of what
/// survives, which keeps the output auditable. `Keep` passes such flows
/// through untouched.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum UnanalyzedPolicy {
    Zero,
    Keep,
}

impl Default for UnanalyzedPolicy {
    fn default() -> Self {
        UnanalyzedPolicy::Zero
    }
}

impl FromStr for UnanalyzedPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "zero" => Ok(UnanalyzedPolicy::Zero),
            "keep" => Ok(UnanalyzedPolicy::Keep),
            other => Err(format!("unknown policy '{}', expected zero or keep", other)),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ApplyConfig {
    pub policy: UnanalyzedPolicy,
    pub dissector: Dissector,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ApplyStats {
    pub frames_in: u64,
    pub frames_out: u64,
    /// Frames whose output bytes differ from the input.
    pub frames_modified: u64,
    /// Payload bytes overwritten with zeros.
    pub bytes_masked: u64,
    pub frame_errors: u64,
    pub checksum_errors: u64,
}

/// Marker error distinguishing cooperative cancellation from failures, so
/// callers can tell an abandoned run from a broken one.
#[derive(Copy, Clone, Debug)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("run cancelled")
    }
}

impl std::error::Error for Cancelled {}

/// Stream `input`, mask payloads per `rules`, and write `output`.
///
/// `cancel` is polled between frames; `progress` receives the running frame
/// count. On error or cancellation the partially written output file is the
/// caller's to remove.
pub fn apply(
    input: &Path,
    output: &Path,
    rules: &KeepRuleSet,
    config: &ApplyConfig,
    cancel: &AtomicBool,
    progress: &mut dyn FnMut(u64),
) -> Result<ApplyStats, Error> {
    let mut reader = FrameReader::open(input)?;
    let meta = reader.meta();
    for iface in &meta.interfaces {
        if !Dissector::supports_linktype(iface.linktype) {
            bail!(
                "unsupported link type {} in {}",
                iface.linktype,
                input.display()
            );
        }
    }
    let mut writer = CaptureWriter::create(output, &meta)?;
    let mut stats = ApplyStats::default();

    while let Some(frame) = reader.next_frame()? {
        if cancel.load(Ordering::Relaxed) {
            return Err(Error::new(Cancelled));
        }
        stats.frames_in += 1;
        let linktype = meta.interfaces[frame.iface as usize].linktype;
        let out = mask_frame(&frame, linktype, rules, config, &mut stats);
        if out.data != frame.data {
            stats.frames_modified += 1;
        }
        writer.write_frame(&out)?;
        stats.frames_out += 1;
        progress(stats.frames_in);
    }
    writer.finish()?;
    Ok(stats)
}

/// Produce the output frame for one input frame. Infallible by design:
/// anything that cannot be processed passes through unchanged and is
/// counted, per the frame-level error policy.
fn mask_frame(
    frame: &Frame,
    linktype: u32,
    rules: &KeepRuleSet,
    config: &ApplyConfig,
    stats: &mut ApplyStats,
) -> Frame {
    if frame.is_truncated() {
        warn!(
            "frame {}: captured {} of {} bytes, passing through",
            frame.index,
            frame.data.len(),
            frame.orig_len
        );
        stats.frame_errors += 1;
        return frame.clone();
    }
    let pkt = match config.dissector.dissect(linktype, &frame.data) {
        Ok(Dissection::Tcp(pkt)) => pkt,
        Ok(Dissection::Other) => return frame.clone(),
        Err(err) => {
            warn!("frame {}: {}, passing through", frame.index, err);
            stats.frame_errors += 1;
            return frame.clone();
        }
    };
    let payload_len = pkt.payload.len();
    if payload_len == 0 {
        return frame.clone();
    }

    let flow = FlowKey::new(
        pkt.ip.src_addr(),
        pkt.tcp.src_port,
        pkt.ip.dst_addr(),
        pkt.tcp.dst_port,
    );
    let kept = if rules.contains_flow(&flow) {
        rules.kept_intervals(&flow, pkt.tcp.seq, payload_len)
    } else {
        match config.policy {
            UnanalyzedPolicy::Zero => {
                trace!("frame {}: {} not analyzed, zeroing payload", frame.index, flow);
                Vec::new()
            }
            UnanalyzedPolicy::Keep => return frame.clone(),
        }
    };

    let mut data = frame.data.clone();
    let base = pkt.payload.start;
    let mut cursor = 0usize;
    let mut masked = 0u64;
    for &(start, end) in &kept {
        for byte in &mut data[base + cursor..base + start] {
            *byte = 0;
        }
        masked += (start - cursor) as u64;
        cursor = end;
    }
    for byte in &mut data[base + cursor..base + payload_len] {
        *byte = 0;
    }
    masked += (payload_len - cursor) as u64;

    if let Err(err) = checksum::rewrite_checksums(&mut data, &pkt) {
        warn!(
            "frame {}: checksum rewrite failed ({}), emitting the frame unchanged",
            frame.index, err
        );
        stats.checksum_errors += 1;
        return frame.clone();
    }
    stats.bytes_masked += masked;

    Frame {
        data,
        ..frame.clone()
    }
}
