//! Checksum rewriting for frames whose TCP payload was modified in place.

use crate::dissect::{IpInfo, OuterChecksum, OuterIp, TcpPacket};
use anyhow::{anyhow, Error};
use etherparse::{Ipv4HeaderSlice, TcpHeaderSlice, UdpHeaderSlice};

/// One's-complement sum over `data`, odd lengths padded with a zero byte.
pub fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Recompute every checksum covering the (rewritten) TCP payload:
/// the TCP checksum, the innermost IPv4 header checksum, and any outer
/// tunnel checksums recorded during dissection, innermost first.
///
/// Checksum-offload placeholders in the original capture are replaced
/// unconditionally; a disabled outer UDP checksum (zero, IPv4) stays
/// disabled.
pub fn rewrite_checksums(data: &mut [u8], pkt: &TcpPacket) -> Result<(), Error> {
    let tcp_sum = {
        let tcp = TcpHeaderSlice::from_slice(&data[pkt.tcp.header_offset..pkt.payload.end])
            .map_err(|err| anyhow!("re-parsing TCP header: {:?}", err))?
            .to_header();
        let payload = &data[pkt.payload.clone()];
        match &pkt.ip {
            IpInfo::V4 { src, dst, .. } => tcp.calc_checksum_ipv4_raw(*src, *dst, payload),
            IpInfo::V6 { src, dst, .. } => tcp.calc_checksum_ipv6_raw(*src, *dst, payload),
        }
        .map_err(|err| anyhow!("TCP checksum: {:?}", err))?
    };
    put16(data, pkt.tcp.header_offset + 16, tcp_sum);

    if let IpInfo::V4 { offset, .. } = pkt.ip {
        let ip_sum = Ipv4HeaderSlice::from_slice(&data[offset..])
            .map_err(|err| anyhow!("re-parsing IPv4 header: {:?}", err))?
            .to_header()
            .calc_header_checksum()
            .map_err(|err| anyhow!("IPv4 header checksum: {:?}", err))?;
        put16(data, offset + 10, ip_sum);
    }

    for outer in &pkt.outer_checksums {
        match outer {
            OuterChecksum::Udp {
                header_offset,
                end,
                ip,
            } => {
                let off = *header_offset;
                let existing = u16::from_be_bytes([data[off + 6], data[off + 7]]);
                if existing == 0 && matches!(ip, OuterIp::V4(..)) {
                    continue;
                }
                let udp_sum = {
                    let udp = UdpHeaderSlice::from_slice(&data[off..*end])
                        .map_err(|err| anyhow!("re-parsing outer UDP header: {:?}", err))?
                        .to_header();
                    let payload = &data[off + 8..*end];
                    match ip {
                        OuterIp::V4(src, dst) => udp.calc_checksum_ipv4_raw(*src, *dst, payload),
                        OuterIp::V6(src, dst) => udp.calc_checksum_ipv6_raw(*src, *dst, payload),
                    }
                    .map_err(|err| anyhow!("outer UDP checksum: {:?}", err))?
                };
                put16(data, off + 6, udp_sum);
            }
            OuterChecksum::Gre { header_offset, end } => {
                // The GRE checksum covers the GRE header and everything after it.
                put16(data, header_offset + 4, 0);
                let gre_sum = internet_checksum(&data[*header_offset..*end]);
                put16(data, header_offset + 4, gre_sum);
            }
        }
    }
    Ok(())
}

fn put16(data: &mut [u8], offset: usize, value: u16) {
    data[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}
