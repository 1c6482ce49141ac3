//! Reading, dissecting, and writing packet capture files.
//!
//! This crate owns everything that touches raw capture bytes:
//!
//! 1. [`read::FrameReader`] streams frames out of PCAP and PCAPNG files
//!    without buffering the whole capture.
//! 2. [`dissect::Dissector`] walks a raw frame through arbitrary
//!    encapsulation layers (VLAN, QinQ, MPLS, GRE, VXLAN, IP-in-IP) down to
//!    the innermost TCP segment, recording the byte offset of every layer.
//! 3. [`checksum::rewrite_checksums`] recomputes the transport and network
//!    checksums after a frame's payload has been rewritten in place.
//! 4. [`write::CaptureWriter`] writes frames back out in the same format,
//!    preserving order, lengths, timestamps, and interface records.

pub mod checksum;
pub mod dissect;
pub mod frame;
pub mod read;
pub mod write;

pub use crate::{
    dissect::{Dissection, Dissector, TcpPacket},
    frame::{Frame, Timestamp},
    read::{CaptureFormat, CaptureMeta, FrameReader, InterfaceInfo},
    write::CaptureWriter,
};
