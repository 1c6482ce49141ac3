//! Frame correspondence between a reassembled capture and its original.
//!
//! The analyzer reports sequence ranges, not frame indices, so this map is
//! diagnostic: it lets reports point from reassembled frames back to the
//! original capture. Frames match on a composite key of microsecond
//! timestamp and the directional TCP 5-tuple. Colliding keys are logged and
//! resolved towards the earliest original frame.

use anyhow::Error;
use capture::{
    dissect::{Dissection, Dissector},
    Frame, FrameReader,
};
use fnv::FnvHashMap;
use log::{debug, warn};
use std::{net::IpAddr, path::Path};

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
struct FrameKey {
    secs: u64,
    micros: u32,
    src: IpAddr,
    dst: IpAddr,
    src_port: u16,
    dst_port: u16,
}

#[derive(Debug, Default)]
pub struct FrameMap {
    by_reassembled: FnvHashMap<u32, u32>,
    /// Composite keys shared by more than one original frame.
    pub collisions: u64,
    /// Reassembled frames with no counterpart in the original capture.
    pub unmatched: u64,
}

impl FrameMap {
    /// Index of the original frame matching the given reassembled frame.
    pub fn original_index(&self, reassembled_index: u32) -> Option<u32> {
        self.by_reassembled.get(&reassembled_index).copied()
    }

    pub fn len(&self) -> usize {
        self.by_reassembled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_reassembled.is_empty()
    }
}

fn key_of(frame: &Frame, linktype: u32, dissector: &Dissector) -> Option<FrameKey> {
    match dissector.dissect(linktype, &frame.data) {
        Ok(Dissection::Tcp(pkt)) => Some(FrameKey {
            secs: frame.ts.seconds(),
            // Truncated to the minimum resolution both captures guarantee.
            micros: frame.ts.subsec_micros(),
            src: pkt.ip.src_addr(),
            dst: pkt.ip.dst_addr(),
            src_port: pkt.tcp.src_port,
            dst_port: pkt.tcp.dst_port,
        }),
        _ => None,
    }
}

/// Build the correspondence map for one original/reassembled capture pair.
pub fn frame_map(
    original: &Path,
    reassembled: &Path,
    dissector: &Dissector,
) -> Result<FrameMap, Error> {
    let mut map = FrameMap::default();

    let mut originals: FnvHashMap<FrameKey, u32> = FnvHashMap::default();
    let mut reader = FrameReader::open(original)?;
    let meta = reader.meta();
    while let Some(frame) = reader.next_frame()? {
        let linktype = meta.interfaces[frame.iface as usize].linktype;
        if let Some(key) = key_of(&frame, linktype, dissector) {
            // The earliest original frame wins; later twins only count.
            if originals.contains_key(&key) {
                warn!(
                    "frames share timestamp and 5-tuple at {}.{:06}, keeping the earliest",
                    key.secs, key.micros
                );
                map.collisions += 1;
            } else {
                originals.insert(key, frame.index);
            }
        }
    }

    let mut reader = FrameReader::open(reassembled)?;
    let meta = reader.meta();
    while let Some(frame) = reader.next_frame()? {
        let linktype = meta.interfaces[frame.iface as usize].linktype;
        let key = match key_of(&frame, linktype, dissector) {
            Some(key) => key,
            None => continue,
        };
        match originals.get(&key) {
            Some(&original_index) => {
                map.by_reassembled.insert(frame.index, original_index);
            }
            None => {
                debug!(
                    "reassembled frame {} has no counterpart in the original capture",
                    frame.index
                );
                map.unmatched += 1;
            }
        }
    }
    Ok(map)
}

#[cfg(test)]
mod test {
    use super::*;
    use capture::checksum::internet_checksum;
    use capture::read::InterfaceInfo;
    use capture::{CaptureFormat, CaptureMeta, CaptureWriter, Timestamp};
    use pretty_assertions::assert_eq;

    fn tcp_frame(src_port: u16, payload: &[u8]) -> Vec<u8> {
        let mut f = vec![
            0x02, 0, 0, 0, 0, 1, 0x02, 0, 0, 0, 0, 2, 0x08, 0x00,
        ];
        let total = 40 + payload.len();
        let mut ip = Vec::new();
        ip.push(0x45);
        ip.push(0);
        ip.extend_from_slice(&(total as u16).to_be_bytes());
        ip.extend_from_slice(&[0, 0, 0, 0]);
        ip.push(64);
        ip.push(6);
        ip.extend_from_slice(&[0, 0]);
        ip.extend_from_slice(&[10, 0, 0, 1]);
        ip.extend_from_slice(&[10, 0, 0, 2]);
        let sum = internet_checksum(&ip);
        ip[10..12].copy_from_slice(&sum.to_be_bytes());
        f.extend_from_slice(&ip);
        f.extend_from_slice(&src_port.to_be_bytes());
        f.extend_from_slice(&443u16.to_be_bytes());
        f.extend_from_slice(&100u32.to_be_bytes());
        f.extend_from_slice(&0u32.to_be_bytes());
        f.push(5 << 4);
        f.push(0x18);
        f.extend_from_slice(&[4, 0, 0, 0, 0, 0]);
        f.extend_from_slice(payload);
        f
    }

    fn write(path: &Path, frames: &[(u64, u64, Vec<u8>)]) {
        let meta = CaptureMeta {
            format: CaptureFormat::Pcap,
            interfaces: vec![InterfaceInfo {
                linktype: 1,
                snaplen: 65535,
                tsresol_raw: 6,
                ticks_per_second: 1_000_000,
            }],
        };
        let mut writer = CaptureWriter::create(path, &meta).unwrap();
        for (i, (sec, usec, data)) in frames.iter().enumerate() {
            writer
                .write_frame(&Frame {
                    index: i as u32 + 1,
                    iface: 0,
                    ts: Timestamp::from_sec_frac(*sec, *usec, 1_000_000),
                    data: data.clone(),
                    orig_len: data.len() as u32,
                })
                .unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn test_maps_by_timestamp_and_flow() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("original.pcap");
        let reassembled = dir.path().join("reassembled.pcap");

        write(
            &original,
            &[
                (100, 1, tcp_frame(50001, b"aa")),
                (100, 2, tcp_frame(50002, b"bb")),
                (100, 3, tcp_frame(50003, b"cc")),
            ],
        );
        // The decoder dropped the middle frame and reordered the rest.
        write(
            &reassembled,
            &[
                (100, 3, tcp_frame(50003, b"cc")),
                (100, 1, tcp_frame(50001, b"aa")),
            ],
        );

        let map = frame_map(&original, &reassembled, &Dissector::default()).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.original_index(1), Some(3));
        assert_eq!(map.original_index(2), Some(1));
        assert_eq!(map.collisions, 0);
        assert_eq!(map.unmatched, 0);
    }

    #[test]
    fn test_collision_prefers_earliest() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("original.pcap");
        let reassembled = dir.path().join("reassembled.pcap");

        // Two original frames with identical key (same µs, same flow).
        write(
            &original,
            &[
                (100, 1, tcp_frame(50001, b"aa")),
                (100, 1, tcp_frame(50001, b"bb")),
            ],
        );
        write(&reassembled, &[(100, 1, tcp_frame(50001, b"aa"))]);

        let map = frame_map(&original, &reassembled, &Dissector::default()).unwrap();
        assert_eq!(map.collisions, 1);
        assert_eq!(map.original_index(1), Some(1));
    }

    #[test]
    fn test_unmatched_reassembled_frame() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("original.pcap");
        let reassembled = dir.path().join("reassembled.pcap");

        write(&original, &[(100, 1, tcp_frame(50001, b"aa"))]);
        write(&reassembled, &[(200, 9, tcp_frame(50009, b"zz"))]);

        let map = frame_map(&original, &reassembled, &Dissector::default()).unwrap();
        assert!(map.is_empty());
        assert_eq!(map.unmatched, 1);
    }
}
