use capture::{CaptureFormat, CaptureMeta, CaptureWriter, Frame, FrameReader, Timestamp};
use capture::read::InterfaceInfo;
use pretty_assertions::assert_eq;
use std::io::Cursor;

fn sample_frames(ticks_per_second: u64) -> Vec<Frame> {
    vec![
        Frame {
            index: 1,
            iface: 0,
            ts: Timestamp::from_sec_frac(1_600_000_000, 1, ticks_per_second),
            data: vec![0xaa; 60],
            orig_len: 60,
        },
        Frame {
            index: 2,
            iface: 0,
            ts: Timestamp::from_sec_frac(1_600_000_000, ticks_per_second - 1, ticks_per_second),
            data: vec![0xbb; 61],
            orig_len: 61,
        },
        Frame {
            index: 3,
            iface: 0,
            ts: Timestamp::from_sec_frac(1_600_000_123, 0, ticks_per_second),
            data: vec![0xcc; 9],
            // Truncated capture of a larger frame.
            orig_len: 1514,
        },
    ]
}

fn roundtrip(meta: &CaptureMeta, frames: &[Frame]) -> (CaptureMeta, Vec<Frame>) {
    let mut out = Vec::new();
    {
        let mut writer = CaptureWriter::new(&mut out, meta).unwrap();
        for frame in frames {
            writer.write_frame(frame).unwrap();
        }
        writer.finish().unwrap();
    }

    let mut reader = FrameReader::from_read(Cursor::new(out)).unwrap();
    let read_meta = reader.meta();
    let mut read_frames = Vec::new();
    while let Some(frame) = reader.next_frame().unwrap() {
        read_frames.push(frame);
    }
    (read_meta, read_frames)
}

#[test]
fn test_legacy_pcap_roundtrip() {
    let meta = CaptureMeta {
        format: CaptureFormat::Pcap,
        interfaces: vec![InterfaceInfo {
            linktype: 1,
            snaplen: 65535,
            tsresol_raw: 6,
            ticks_per_second: 1_000_000,
        }],
    };
    let frames = sample_frames(1_000_000);
    let (read_meta, read_frames) = roundtrip(&meta, &frames);
    assert_eq!(read_meta, meta);
    assert_eq!(read_frames, frames);
}

#[test]
fn test_legacy_pcap_nanosecond_roundtrip() {
    let meta = CaptureMeta {
        format: CaptureFormat::Pcap,
        interfaces: vec![InterfaceInfo {
            linktype: 1,
            snaplen: 262144,
            tsresol_raw: 9,
            ticks_per_second: 1_000_000_000,
        }],
    };
    let frames = sample_frames(1_000_000_000);
    let (read_meta, read_frames) = roundtrip(&meta, &frames);
    assert_eq!(read_meta, meta);
    assert_eq!(read_frames, frames);
}

#[test]
fn test_pcapng_roundtrip_two_interfaces() {
    let meta = CaptureMeta {
        format: CaptureFormat::PcapNg,
        interfaces: vec![
            InterfaceInfo {
                linktype: 1,
                snaplen: 65535,
                tsresol_raw: 6,
                ticks_per_second: 1_000_000,
            },
            InterfaceInfo {
                linktype: 113,
                snaplen: 65535,
                tsresol_raw: 9,
                ticks_per_second: 1_000_000_000,
            },
        ],
    };
    let mut frames = sample_frames(1_000_000);
    frames.push(Frame {
        index: 4,
        iface: 1,
        ts: Timestamp::from_sec_frac(1_600_000_456, 987_654_321, 1_000_000_000),
        data: vec![0xdd; 33],
        orig_len: 33,
    });
    let (read_meta, read_frames) = roundtrip(&meta, &frames);
    assert_eq!(read_meta, meta);
    assert_eq!(read_frames, frames);
}

#[test]
fn test_pcapng_odd_length_padding() {
    // Frame lengths 1..5 exercise every padding remainder.
    let meta = CaptureMeta {
        format: CaptureFormat::PcapNg,
        interfaces: vec![InterfaceInfo {
            linktype: 1,
            snaplen: 65535,
            tsresol_raw: 6,
            ticks_per_second: 1_000_000,
        }],
    };
    let frames: Vec<_> = (1u32..=5)
        .map(|n| Frame {
            index: n,
            iface: 0,
            ts: Timestamp::from_sec_frac(1_600_000_000 + u64::from(n), 0, 1_000_000),
            data: vec![n as u8; n as usize],
            orig_len: n,
        })
        .collect();
    let (_, read_frames) = roundtrip(&meta, &frames);
    assert_eq!(read_frames, frames);
}
