//! Shared builders for the masking integration tests: synthetic frames,
//! capture files on disk, and checksum validation.
#![allow(dead_code)]

use capture::checksum::internet_checksum;
use capture::read::InterfaceInfo;
use capture::{CaptureFormat, CaptureMeta, CaptureWriter, Frame, FrameReader, Timestamp};
use std::path::Path;

pub const CLIENT: [u8; 4] = [10, 0, 0, 1];
pub const SERVER: [u8; 4] = [10, 0, 0, 2];
pub const CLIENT_PORT: u16 = 51000;
pub const SERVER_PORT: u16 = 443;

/// A TLS record: 5-byte header plus body.
pub fn tls_record(record_type: u8, body: &[u8]) -> Vec<u8> {
    let mut r = vec![record_type, 0x03, 0x03];
    r.extend_from_slice(&(body.len() as u16).to_be_bytes());
    r.extend_from_slice(body);
    r
}

/// An IPv4+TCP packet (no link layer) with valid checksums.
pub fn ipv4_tcp_packet(
    src: [u8; 4],
    src_port: u16,
    dst: [u8; 4],
    dst_port: u16,
    seq: u32,
    payload: &[u8],
) -> Vec<u8> {
    let total = 40 + payload.len();
    let mut ip = Vec::with_capacity(total);
    ip.push(0x45);
    ip.push(0);
    ip.extend_from_slice(&(total as u16).to_be_bytes());
    ip.extend_from_slice(&[0x00, 0x01, 0x40, 0x00]); // id, DF
    ip.push(64);
    ip.push(6);
    ip.extend_from_slice(&[0, 0]); // checksum placeholder
    ip.extend_from_slice(&src);
    ip.extend_from_slice(&dst);
    let ip_sum = internet_checksum(&ip);
    ip[10..12].copy_from_slice(&ip_sum.to_be_bytes());

    let mut tcp = Vec::with_capacity(20 + payload.len());
    tcp.extend_from_slice(&src_port.to_be_bytes());
    tcp.extend_from_slice(&dst_port.to_be_bytes());
    tcp.extend_from_slice(&seq.to_be_bytes());
    tcp.extend_from_slice(&0u32.to_be_bytes()); // ack
    tcp.push(5 << 4);
    tcp.push(0x18); // psh|ack
    tcp.extend_from_slice(&0x0400u16.to_be_bytes());
    tcp.extend_from_slice(&[0, 0]); // checksum placeholder
    tcp.extend_from_slice(&[0, 0]); // urgent
    tcp.extend_from_slice(payload);

    let mut pseudo = Vec::with_capacity(12 + tcp.len());
    pseudo.extend_from_slice(&src);
    pseudo.extend_from_slice(&dst);
    pseudo.push(0);
    pseudo.push(6);
    pseudo.extend_from_slice(&(tcp.len() as u16).to_be_bytes());
    pseudo.extend_from_slice(&tcp);
    let tcp_sum = internet_checksum(&pseudo);
    tcp[16..18].copy_from_slice(&tcp_sum.to_be_bytes());

    ip.extend_from_slice(&tcp);
    ip
}

pub fn eth_frame(ethertype: u16, packet: &[u8]) -> Vec<u8> {
    let mut f = vec![
        0x02, 0x00, 0x00, 0x00, 0x00, 0x01, 0x02, 0x00, 0x00, 0x00, 0x00, 0x02,
    ];
    f.extend_from_slice(&ethertype.to_be_bytes());
    f.extend_from_slice(packet);
    f
}

/// Frame sent by the client towards the server.
pub fn client_frame(seq: u32, payload: &[u8]) -> Vec<u8> {
    eth_frame(
        0x0800,
        &ipv4_tcp_packet(CLIENT, CLIENT_PORT, SERVER, SERVER_PORT, seq, payload),
    )
}

/// Frame sent by the server towards the client.
pub fn server_frame(seq: u32, payload: &[u8]) -> Vec<u8> {
    eth_frame(
        0x0800,
        &ipv4_tcp_packet(SERVER, SERVER_PORT, CLIENT, CLIENT_PORT, seq, payload),
    )
}

/// Scenario frame wrapped in 802.1ad QinQ: outer S-tag, inner C-tag.
pub fn qinq_client_frame(seq: u32, payload: &[u8]) -> Vec<u8> {
    let mut tagged = Vec::new();
    tagged.extend_from_slice(&[0x00, 0x64]); // S-tag, VLAN 100
    tagged.extend_from_slice(&0x8100u16.to_be_bytes());
    tagged.extend_from_slice(&[0x00, 0xc8]); // C-tag, VLAN 200
    tagged.extend_from_slice(&0x0800u16.to_be_bytes());
    tagged.extend_from_slice(&ipv4_tcp_packet(
        CLIENT,
        CLIENT_PORT,
        SERVER,
        SERVER_PORT,
        seq,
        payload,
    ));
    eth_frame(0x88a8, &tagged)
}

/// An ARP request; dissects as non-TCP and must pass through bit-identical.
pub fn arp_frame() -> Vec<u8> {
    let mut arp = vec![0x00, 0x01, 0x08, 0x00, 0x06, 0x04, 0x00, 0x01];
    arp.extend_from_slice(&[0x02, 0, 0, 0, 0, 1]);
    arp.extend_from_slice(&CLIENT);
    arp.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
    arp.extend_from_slice(&SERVER);
    eth_frame(0x0806, &arp)
}

pub fn ethernet_meta() -> CaptureMeta {
    CaptureMeta {
        format: CaptureFormat::Pcap,
        interfaces: vec![InterfaceInfo {
            linktype: 1,
            snaplen: 65535,
            tsresol_raw: 6,
            ticks_per_second: 1_000_000,
        }],
    }
}

/// Write `frames` as a µs-resolution pcap file, timestamps 1 ms apart.
pub fn write_capture(path: &Path, frames: &[Vec<u8>]) {
    let mut writer = CaptureWriter::create(path, &ethernet_meta()).unwrap();
    for (i, data) in frames.iter().enumerate() {
        writer
            .write_frame(&Frame {
                index: i as u32 + 1,
                iface: 0,
                ts: Timestamp::from_sec_frac(1_600_000_000, 1000 * i as u64 + 137, 1_000_000),
                data: data.clone(),
                orig_len: data.len() as u32,
            })
            .unwrap();
    }
    writer.finish().unwrap();
}

pub fn read_all(path: &Path) -> Vec<Frame> {
    let mut reader = FrameReader::open(path).unwrap();
    let mut frames = Vec::new();
    while let Some(frame) = reader.next_frame().unwrap() {
        frames.push(frame);
    }
    frames
}

/// Validate the IPv4 header and TCP checksums of an Ethernet frame built by
/// the helpers above (or a VLAN-tagged variant of one).
pub fn assert_checksums_valid(frame: &[u8]) {
    // Skip the link layer: Ethernet plus any VLAN tag stack.
    let mut offset = 12;
    let mut ethertype = u16::from_be_bytes([frame[offset], frame[offset + 1]]);
    offset += 2;
    while ethertype == 0x8100 || ethertype == 0x88a8 {
        ethertype = u16::from_be_bytes([frame[offset + 2], frame[offset + 3]]);
        offset += 4;
    }
    assert_eq!(ethertype, 0x0800, "helper frames are IPv4");

    let ip = &frame[offset..];
    let ihl = usize::from(ip[0] & 0x0f) * 4;
    assert_eq!(
        internet_checksum(&ip[..ihl]),
        0,
        "IPv4 header checksum must validate"
    );

    let total = usize::from(u16::from_be_bytes([ip[2], ip[3]]));
    let segment = &ip[ihl..total];
    let mut pseudo = Vec::new();
    pseudo.extend_from_slice(&ip[12..20]);
    pseudo.push(0);
    pseudo.push(6);
    pseudo.extend_from_slice(&(segment.len() as u16).to_be_bytes());
    pseudo.extend_from_slice(segment);
    assert_eq!(
        internet_checksum(&pseudo),
        0,
        "TCP checksum must validate against the pseudo-header"
    );
}

/// Byte range of the TCP payload inside a plain Ethernet helper frame.
pub fn payload_of(frame: &[u8]) -> &[u8] {
    &frame[14 + 40..]
}
