//! Offset-tracking packet dissection through arbitrary encapsulation.
//!
//! Walks a raw frame from the link layer down to the innermost TCP segment,
//! recording the byte offset of every layer on the way. The offsets allow
//! rewriting the payload in place and recomputing exactly the checksums that
//! cover the rewritten bytes.
//!
//! Supported encapsulations: Ethernet, 802.1Q, 802.1ad QinQ (arbitrary tag
//! stacks), MPLS label stacks, GRE, VXLAN, IP-in-IP, plus the Linux cooked,
//! raw-IP, and null link types.

use anyhow::{anyhow, bail, Error};
use etherparse::{Ipv4HeaderSlice, Ipv6HeaderSlice, TcpHeaderSlice, UdpHeaderSlice};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::ops::Range;

pub const LINKTYPE_NULL: u32 = 0;
pub const LINKTYPE_ETHERNET: u32 = 1;
pub const LINKTYPE_RAW: u32 = 101;
pub const LINKTYPE_LINUX_SLL: u32 = 113;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86dd;
const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERTYPE_QINQ: u16 = 0x88a8;
const ETHERTYPE_QINQ_LEGACY: u16 = 0x9100;
const ETHERTYPE_MPLS_UNICAST: u16 = 0x8847;
const ETHERTYPE_MPLS_MULTICAST: u16 = 0x8848;
const ETHERTYPE_TEB: u16 = 0x6558;

const IP_PROTO_IPIP: u8 = 4;
const IP_PROTO_TCP: u8 = 6;
const IP_PROTO_UDP: u8 = 17;
const IP_PROTO_IPV6: u8 = 41;
const IP_PROTO_GRE: u8 = 47;

pub const VXLAN_PORT: u16 = 4789;

/// Tunnel layers cap; deeper nesting than this is treated as malformed.
const MAX_DEPTH: u8 = 8;

/// Innermost network layer of a dissected TCP packet.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum IpInfo {
    V4 {
        offset: usize,
        header_len: usize,
        src: [u8; 4],
        dst: [u8; 4],
    },
    V6 {
        offset: usize,
        src: [u8; 16],
        dst: [u8; 16],
    },
}

impl IpInfo {
    pub fn src_addr(&self) -> IpAddr {
        match self {
            IpInfo::V4 { src, .. } => IpAddr::V4(Ipv4Addr::from(*src)),
            IpInfo::V6 { src, .. } => IpAddr::V6(Ipv6Addr::from(*src)),
        }
    }

    pub fn dst_addr(&self) -> IpAddr {
        match self {
            IpInfo::V4 { dst, .. } => IpAddr::V4(Ipv4Addr::from(*dst)),
            IpInfo::V6 { dst, .. } => IpAddr::V6(Ipv6Addr::from(*dst)),
        }
    }
}

/// Innermost TCP header of a dissected packet.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct TcpInfo {
    pub header_offset: usize,
    pub header_len: usize,
    pub seq: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
}

/// Addresses backing an outer tunnel's pseudo-header.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum OuterIp {
    V4([u8; 4], [u8; 4]),
    V6([u8; 16], [u8; 16]),
}

/// An outer checksum whose coverage includes the TCP payload and therefore
/// goes stale when the payload is rewritten.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum OuterChecksum {
    /// UDP datagram carrying a VXLAN tunnel.
    Udp {
        header_offset: usize,
        /// End of the datagram (header offset + UDP length field).
        end: usize,
        ip: OuterIp,
    },
    /// GRE header with the checksum-present bit set.
    Gre { header_offset: usize, end: usize },
}

/// A frame dissected down to TCP-over-IP.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct TcpPacket {
    pub ip: IpInfo,
    pub tcp: TcpInfo,
    /// Byte range of the TCP payload within the frame.
    pub payload: Range<usize>,
    /// Outer checksums to rewrite, ordered innermost first.
    pub outer_checksums: Vec<OuterChecksum>,
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub enum Dissection {
    Tcp(TcpPacket),
    /// Structurally valid, but not TCP-over-IP (or an IP fragment, which
    /// cannot be interpreted at the transport layer).
    Other,
}

/// Reusable dissector; holds the tunnel-port configuration.
#[derive(Clone, Debug)]
pub struct Dissector {
    vxlan_ports: Vec<u16>,
}

impl Default for Dissector {
    fn default() -> Self {
        Self {
            vxlan_ports: vec![VXLAN_PORT],
        }
    }
}

impl Dissector {
    pub fn new(extra_vxlan_ports: &[u16]) -> Self {
        let mut vxlan_ports = vec![VXLAN_PORT];
        vxlan_ports.extend_from_slice(extra_vxlan_ports);
        vxlan_ports.dedup();
        Self { vxlan_ports }
    }

    pub fn supports_linktype(linktype: u32) -> bool {
        matches!(
            linktype,
            LINKTYPE_NULL | LINKTYPE_ETHERNET | LINKTYPE_RAW | LINKTYPE_LINUX_SLL
        )
    }

    /// Dissect one frame. `Err` means the frame is malformed; the caller
    /// downgrades that to a frame-level event.
    pub fn dissect(&self, linktype: u32, data: &[u8]) -> Result<Dissection, Error> {
        match linktype {
            LINKTYPE_ETHERNET => self.ethernet(data, 0, 0),
            LINKTYPE_LINUX_SLL => {
                if data.len() < 16 {
                    bail!("frame shorter than the Linux cooked header");
                }
                let proto = be16(data, 14);
                self.ethertype(data, 16, proto, 0)
            }
            LINKTYPE_RAW => self.ip_by_nibble(data, 0, 0),
            LINKTYPE_NULL => {
                if data.len() < 4 {
                    bail!("frame shorter than the null link header");
                }
                // The address family is in host byte order of the capturing
                // machine; accept either.
                let family = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
                let family = if family > 0xff { family.swap_bytes() } else { family };
                match family {
                    2 => self.ipv4(data, 4, 0),
                    24 | 28 | 30 => self.ipv6(data, 4, 0),
                    _ => Ok(Dissection::Other),
                }
            }
            other => bail!("unsupported link type {}", other),
        }
    }

    fn ethernet(&self, data: &[u8], offset: usize, depth: u8) -> Result<Dissection, Error> {
        if data.len() < offset + 14 {
            bail!("truncated Ethernet header");
        }
        let ethertype = be16(data, offset + 12);
        self.ethertype(data, offset + 14, ethertype, depth)
    }

    /// Dispatch on an ethertype, first stripping VLAN tag stacks and MPLS
    /// label stacks.
    fn ethertype(
        &self,
        data: &[u8],
        mut offset: usize,
        mut ethertype: u16,
        depth: u8,
    ) -> Result<Dissection, Error> {
        while matches!(
            ethertype,
            ETHERTYPE_VLAN | ETHERTYPE_QINQ | ETHERTYPE_QINQ_LEGACY
        ) {
            if data.len() < offset + 4 {
                bail!("truncated VLAN tag");
            }
            ethertype = be16(data, offset + 2);
            offset += 4;
        }

        if ethertype == ETHERTYPE_MPLS_UNICAST || ethertype == ETHERTYPE_MPLS_MULTICAST {
            loop {
                if data.len() < offset + 4 {
                    bail!("truncated MPLS label stack");
                }
                let bottom = data[offset + 2] & 0x01 != 0;
                offset += 4;
                if bottom {
                    break;
                }
            }
            // MPLS carries no protocol field; the first nibble of the
            // payload identifies the inner packet.
            return self.ip_by_nibble(data, offset, depth);
        }

        match ethertype {
            ETHERTYPE_IPV4 => self.ipv4(data, offset, depth),
            ETHERTYPE_IPV6 => self.ipv6(data, offset, depth),
            ETHERTYPE_TEB => {
                if depth >= MAX_DEPTH {
                    bail!("encapsulation nested deeper than {} layers", MAX_DEPTH);
                }
                self.ethernet(data, offset, depth + 1)
            }
            _ => Ok(Dissection::Other),
        }
    }

    fn ip_by_nibble(&self, data: &[u8], offset: usize, depth: u8) -> Result<Dissection, Error> {
        match data.get(offset).map(|b| b >> 4) {
            Some(4) => self.ipv4(data, offset, depth),
            Some(6) => self.ipv6(data, offset, depth),
            Some(v) => bail!("payload starts with IP version nibble {}", v),
            None => bail!("empty IP payload"),
        }
    }

    fn ipv4(&self, data: &[u8], offset: usize, depth: u8) -> Result<Dissection, Error> {
        let slice = Ipv4HeaderSlice::from_slice(&data[offset..])
            .map_err(|err| anyhow!("IPv4 header: {:?}", err))?;
        if slice.is_fragmenting_payload() {
            // A fragment carries no complete transport segment; it passes
            // through unmodified.
            return Ok(Dissection::Other);
        }
        let header_len = slice.slice().len();
        let total_len = slice.total_len() as usize;
        if total_len < header_len {
            bail!("IPv4 total length smaller than the header");
        }
        let end = offset + total_len;
        if end > data.len() {
            bail!("IPv4 packet extends past the captured bytes");
        }
        let src = slice.source();
        let dst = slice.destination();
        let protocol = slice.protocol();
        let inner = offset + header_len;
        match protocol {
            IP_PROTO_TCP => self.tcp(
                data,
                inner,
                end,
                IpInfo::V4 {
                    offset,
                    header_len,
                    src,
                    dst,
                },
            ),
            IP_PROTO_UDP => self.udp(data, inner, end, OuterIp::V4(src, dst), depth),
            IP_PROTO_GRE => self.gre(data, inner, end, depth),
            IP_PROTO_IPIP => self.nested(data, inner, depth, true),
            IP_PROTO_IPV6 => self.nested(data, inner, depth, false),
            _ => Ok(Dissection::Other),
        }
    }

    fn ipv6(&self, data: &[u8], offset: usize, depth: u8) -> Result<Dissection, Error> {
        let slice = Ipv6HeaderSlice::from_slice(&data[offset..])
            .map_err(|err| anyhow!("IPv6 header: {:?}", err))?;
        let src = slice.source();
        let dst = slice.destination();
        let end = offset + 40 + slice.payload_length() as usize;
        if end > data.len() {
            bail!("IPv6 packet extends past the captured bytes");
        }

        let mut next_header = slice.next_header();
        let mut cursor = offset + 40;
        loop {
            match next_header {
                // hop-by-hop, routing, destination options
                0 | 43 | 60 => {
                    if cursor + 2 > end {
                        bail!("truncated IPv6 extension header");
                    }
                    next_header = data[cursor];
                    cursor += (data[cursor + 1] as usize + 1) * 8;
                }
                // authentication header, length counted in 4-byte units
                51 => {
                    if cursor + 2 > end {
                        bail!("truncated IPv6 authentication header");
                    }
                    next_header = data[cursor];
                    cursor += (data[cursor + 1] as usize + 2) * 4;
                }
                // fragment header
                44 => {
                    if cursor + 8 > end {
                        bail!("truncated IPv6 fragment header");
                    }
                    let frag_off = be16(data, cursor + 2);
                    if frag_off & 0xfff9 != 0 {
                        // Offset nonzero or more-fragments set.
                        return Ok(Dissection::Other);
                    }
                    next_header = data[cursor];
                    cursor += 8;
                }
                _ => break,
            }
            if cursor > end {
                bail!("IPv6 extension chain extends past the packet");
            }
        }

        match next_header {
            IP_PROTO_TCP => self.tcp(data, cursor, end, IpInfo::V6 { offset, src, dst }),
            IP_PROTO_UDP => self.udp(data, cursor, end, OuterIp::V6(src, dst), depth),
            IP_PROTO_GRE => self.gre(data, cursor, end, depth),
            IP_PROTO_IPIP => self.nested(data, cursor, depth, true),
            IP_PROTO_IPV6 => self.nested(data, cursor, depth, false),
            _ => Ok(Dissection::Other),
        }
    }

    fn nested(&self, data: &[u8], offset: usize, depth: u8, v4: bool) -> Result<Dissection, Error> {
        if depth >= MAX_DEPTH {
            bail!("encapsulation nested deeper than {} layers", MAX_DEPTH);
        }
        if v4 {
            self.ipv4(data, offset, depth + 1)
        } else {
            self.ipv6(data, offset, depth + 1)
        }
    }

    fn udp(
        &self,
        data: &[u8],
        offset: usize,
        end: usize,
        outer_ip: OuterIp,
        depth: u8,
    ) -> Result<Dissection, Error> {
        let slice = UdpHeaderSlice::from_slice(&data[offset..end])
            .map_err(|err| anyhow!("UDP header: {:?}", err))?;
        let src_port = slice.source_port();
        let dst_port = slice.destination_port();
        if !self.vxlan_ports.contains(&dst_port) && !self.vxlan_ports.contains(&src_port) {
            return Ok(Dissection::Other);
        }
        let udp_len = slice.length() as usize;
        if udp_len < 8 || offset + udp_len > end {
            bail!("UDP length field inconsistent with the IP payload");
        }
        let udp_end = offset + udp_len;

        // VXLAN: 8-byte header, then an inner Ethernet frame.
        let vxlan = offset + 8;
        if vxlan + 8 > udp_end {
            bail!("truncated VXLAN header");
        }
        if data[vxlan] & 0x08 == 0 {
            // Without the valid-VNI flag this is ordinary UDP traffic that
            // happens to use a VXLAN port.
            return Ok(Dissection::Other);
        }
        if depth >= MAX_DEPTH {
            bail!("encapsulation nested deeper than {} layers", MAX_DEPTH);
        }
        let mut result = self.ethernet(&data[..udp_end], vxlan + 8, depth + 1)?;
        if let Dissection::Tcp(ref mut pkt) = result {
            pkt.outer_checksums.push(OuterChecksum::Udp {
                header_offset: offset,
                end: udp_end,
                ip: outer_ip,
            });
        }
        Ok(result)
    }

    fn gre(&self, data: &[u8], offset: usize, end: usize, depth: u8) -> Result<Dissection, Error> {
        if offset + 4 > end {
            bail!("truncated GRE header");
        }
        let flags = be16(data, offset);
        let version = flags & 0x0007;
        if version != 0 {
            // GREv1 (PPTP) carries PPP, which never holds plain TCP.
            return Ok(Dissection::Other);
        }
        let checksum_present = flags & 0x8000 != 0;
        let routing_present = flags & 0x4000 != 0;
        let key_present = flags & 0x2000 != 0;
        let sequence_present = flags & 0x1000 != 0;
        if routing_present {
            bail!("GRE source routing is not supported");
        }
        let mut header_len = 4;
        if checksum_present {
            header_len += 4;
        }
        if key_present {
            header_len += 4;
        }
        if sequence_present {
            header_len += 4;
        }
        if offset + header_len > end {
            bail!("truncated GRE header");
        }
        if depth >= MAX_DEPTH {
            bail!("encapsulation nested deeper than {} layers", MAX_DEPTH);
        }
        let protocol = be16(data, offset + 2);
        let mut result = self.ethertype(&data[..end], offset + header_len, protocol, depth + 1)?;
        if checksum_present {
            if let Dissection::Tcp(ref mut pkt) = result {
                pkt.outer_checksums.push(OuterChecksum::Gre {
                    header_offset: offset,
                    end,
                });
            }
        }
        Ok(result)
    }

    fn tcp(
        &self,
        data: &[u8],
        offset: usize,
        end: usize,
        ip: IpInfo,
    ) -> Result<Dissection, Error> {
        let slice = TcpHeaderSlice::from_slice(&data[offset..end])
            .map_err(|err| anyhow!("TCP header: {:?}", err))?;
        let header_len = usize::from(slice.data_offset()) * 4;
        if header_len < 20 || offset + header_len > end {
            bail!("TCP data offset inconsistent with the segment");
        }
        Ok(Dissection::Tcp(TcpPacket {
            ip,
            tcp: TcpInfo {
                header_offset: offset,
                header_len,
                seq: slice.sequence_number(),
                src_port: slice.source_port(),
                dst_port: slice.destination_port(),
                syn: slice.syn(),
                fin: slice.fin(),
                rst: slice.rst(),
            },
            payload: offset + header_len..end,
            outer_checksums: Vec::new(),
        }))
    }
}

fn be16(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([data[offset], data[offset + 1]])
}
