//! Streaming capture reader for PCAP and PCAPNG files.

use crate::frame::{Frame, Timestamp};
use anyhow::{anyhow, bail, Error};
use log::trace;
use misc_utils::fs::file_open_read;
use pcap_parser::{create_reader, pcapng::Block, traits::PcapReaderIterator, PcapBlockOwned, PcapError};
use std::{io::Read, path::Path};

/// Buffer must hold at least one complete block; EPBs can carry jumbo
/// frames, so leave generous room.
const BUFFER_CAPACITY: usize = 1 << 20;

/// Magic numbers of nanosecond-resolution legacy pcap, native and byte-swapped.
const PCAP_MAGIC_NS: u32 = 0xa1b2_3c4d;
const PCAP_MAGIC_NS_SWAPPED: u32 = 0x4d3c_b2a1;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum CaptureFormat {
    Pcap,
    PcapNg,
}

/// Per-interface capture properties, carried from reader to writer so the
/// output file mirrors the input file's structure.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct InterfaceInfo {
    pub linktype: u32,
    pub snaplen: u32,
    /// The raw `if_tsresol` byte (6 and 9 for legacy pcap µs/ns files).
    pub tsresol_raw: u8,
    pub ticks_per_second: u64,
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct CaptureMeta {
    pub format: CaptureFormat,
    pub interfaces: Vec<InterfaceInfo>,
}

/// Convert a pcapng `if_tsresol` value into ticks per second.
fn tsresol_ticks(raw: u8) -> Result<u64, Error> {
    if raw & 0x80 != 0 {
        let exp = u32::from(raw & 0x7f);
        if exp > 63 {
            bail!("unsupported binary if_tsresol exponent {}", exp);
        }
        Ok(1u64 << exp)
    } else {
        if raw > 19 {
            bail!("unsupported decimal if_tsresol exponent {}", raw);
        }
        Ok(10u64.pow(u32::from(raw)))
    }
}

/// Format- and interface-tracking state, separate from the block reader so
/// that borrows of the two never overlap.
struct ReaderCore {
    format: Option<CaptureFormat>,
    interfaces: Vec<InterfaceInfo>,
    saw_packet: bool,
    next_index: u32,
}

impl ReaderCore {
    fn absorb(&mut self, block: &PcapBlockOwned) -> Result<Option<Frame>, Error> {
        match block {
            PcapBlockOwned::LegacyHeader(hdr) => {
                if self.format.is_some() {
                    bail!("unexpected second pcap file header");
                }
                let nanos = hdr.magic_number == PCAP_MAGIC_NS
                    || hdr.magic_number == PCAP_MAGIC_NS_SWAPPED;
                let (tsresol_raw, ticks_per_second) =
                    if nanos { (9, 1_000_000_000) } else { (6, 1_000_000) };
                self.format = Some(CaptureFormat::Pcap);
                self.interfaces.push(InterfaceInfo {
                    linktype: hdr.network.0 as u32,
                    snaplen: hdr.snaplen,
                    tsresol_raw,
                    ticks_per_second,
                });
                Ok(None)
            }
            PcapBlockOwned::Legacy(b) => {
                let iface = self
                    .interfaces
                    .get(0)
                    .ok_or_else(|| anyhow!("packet record before pcap file header"))?;
                let caplen = b.caplen as usize;
                if b.data.len() < caplen {
                    bail!("packet record shorter than its declared capture length");
                }
                self.saw_packet = true;
                self.next_index += 1;
                let tps = iface.ticks_per_second;
                Ok(Some(Frame {
                    index: self.next_index,
                    iface: 0,
                    ts: Timestamp::new(u64::from(b.ts_sec) * tps + u64::from(b.ts_usec), tps),
                    data: b.data[..caplen].to_vec(),
                    orig_len: b.origlen,
                }))
            }
            PcapBlockOwned::NG(Block::SectionHeader(_)) => {
                if self.format.is_some() {
                    bail!("multi-section pcapng captures are not supported");
                }
                self.format = Some(CaptureFormat::PcapNg);
                Ok(None)
            }
            PcapBlockOwned::NG(Block::InterfaceDescription(idb)) => {
                if self.saw_packet {
                    // The writer emits all interface blocks up front, so a
                    // late IDB could not be reproduced faithfully.
                    bail!("interface description after packet data is not supported");
                }
                self.interfaces.push(InterfaceInfo {
                    linktype: idb.linktype.0 as u32,
                    snaplen: idb.snaplen,
                    tsresol_raw: idb.if_tsresol,
                    ticks_per_second: tsresol_ticks(idb.if_tsresol)?,
                });
                Ok(None)
            }
            PcapBlockOwned::NG(Block::EnhancedPacket(epb)) => {
                let iface = self.interfaces.get(epb.if_id as usize).ok_or_else(|| {
                    anyhow!("packet references undeclared interface {}", epb.if_id)
                })?;
                let caplen = epb.caplen as usize;
                if epb.data.len() < caplen {
                    bail!("packet block shorter than its declared capture length");
                }
                self.saw_packet = true;
                self.next_index += 1;
                let units = (u64::from(epb.ts_high) << 32) | u64::from(epb.ts_low);
                Ok(Some(Frame {
                    index: self.next_index,
                    iface: epb.if_id,
                    ts: Timestamp::new(units, iface.ticks_per_second),
                    data: epb.data[..caplen].to_vec(),
                    orig_len: epb.origlen,
                }))
            }
            PcapBlockOwned::NG(Block::SimplePacket(_)) => {
                bail!("pcapng SimplePacket blocks carry no timestamp and are not supported");
            }
            PcapBlockOwned::NG(_) => {
                // Statistics, name resolution, and custom blocks do not
                // affect masking and are not carried to the output.
                trace!("skipping auxiliary pcapng block");
                Ok(None)
            }
        }
    }
}

/// Streaming frame reader over a PCAP or PCAPNG byte stream.
///
/// Only one frame is held in memory at a time. The capture-level metadata
/// (format, interfaces, timestamp resolution) is fully resolved by the time
/// construction returns, so a matching [`crate::write::CaptureWriter`] can
/// be opened before the first frame is consumed.
pub struct FrameReader {
    inner: Box<dyn PcapReaderIterator>,
    core: ReaderCore,
    format: CaptureFormat,
    pending: Option<Frame>,
    done: bool,
}

impl FrameReader {
    /// Open a capture file, transparently decompressing `.gz`/`.xz` inputs.
    pub fn open(path: &Path) -> Result<Self, Error> {
        let read =
            file_open_read(path).map_err(|err| anyhow!("open {}: {}", path.display(), err))?;
        Self::from_read(read).map_err(|err| err.context(format!("reading {}", path.display())))
    }

    pub fn from_read<R: Read + 'static>(read: R) -> Result<Self, Error> {
        let inner = create_reader(BUFFER_CAPACITY, read)
            .map_err(|err| anyhow!("unrecognized capture format: {:?}", err))?;
        let mut partial = PartialReader {
            inner,
            core: ReaderCore {
                format: None,
                interfaces: Vec::new(),
                saw_packet: false,
                next_index: 0,
            },
            done: false,
        };
        // Pump blocks until the header metadata is complete, which is the
        // case once the first packet (or end of file) is reached.
        let pending = partial.next_frame()?;
        let format = match partial.core.format {
            Some(format) => format,
            None => bail!("capture contains no recognizable file header"),
        };
        Ok(FrameReader {
            inner: partial.inner,
            core: partial.core,
            format,
            pending,
            done: partial.done,
        })
    }

    pub fn meta(&self) -> CaptureMeta {
        CaptureMeta {
            format: self.format,
            interfaces: self.core.interfaces.clone(),
        }
    }

    /// The next frame in capture order, or `None` at end of file.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, Error> {
        if let Some(frame) = self.pending.take() {
            return Ok(Some(frame));
        }
        let mut partial = PartialReaderRef {
            inner: &mut self.inner,
            core: &mut self.core,
            done: &mut self.done,
        };
        partial.next_frame()
    }
}

/// Owned variant used during construction.
struct PartialReader {
    inner: Box<dyn PcapReaderIterator>,
    core: ReaderCore,
    done: bool,
}

impl PartialReader {
    fn next_frame(&mut self) -> Result<Option<Frame>, Error> {
        let mut partial = PartialReaderRef {
            inner: &mut self.inner,
            core: &mut self.core,
            done: &mut self.done,
        };
        partial.next_frame()
    }
}

/// Borrowed block-pump shared by construction and steady-state reading.
struct PartialReaderRef<'a> {
    inner: &'a mut Box<dyn PcapReaderIterator>,
    core: &'a mut ReaderCore,
    done: &'a mut bool,
}

impl<'a> PartialReaderRef<'a> {
    fn next_frame(&mut self) -> Result<Option<Frame>, Error> {
        if *self.done {
            return Ok(None);
        }
        // A refill that makes no progress twice in a row means a block is
        // larger than the read buffer.
        let mut stalled = 0u8;
        loop {
            match self.inner.next() {
                Ok((offset, block)) => {
                    stalled = 0;
                    let produced = self.core.absorb(&block)?;
                    self.inner.consume(offset);
                    if let Some(frame) = produced {
                        return Ok(Some(frame));
                    }
                }
                Err(PcapError::Eof) => {
                    *self.done = true;
                    return Ok(None);
                }
                Err(PcapError::Incomplete) => {
                    stalled += 1;
                    if stalled > 2 {
                        bail!("capture block larger than {} byte read buffer", BUFFER_CAPACITY);
                    }
                    self.inner
                        .refill()
                        .map_err(|err| anyhow!("refilling capture buffer: {:?}", err))?;
                }
                Err(err) => {
                    bail!("malformed capture data: {:?}", err);
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_tsresol_decimal() {
        assert_eq!(tsresol_ticks(6).unwrap(), 1_000_000);
        assert_eq!(tsresol_ticks(9).unwrap(), 1_000_000_000);
        assert_eq!(tsresol_ticks(0).unwrap(), 1);
    }

    #[test]
    fn test_tsresol_binary() {
        assert_eq!(tsresol_ticks(0x80 | 10).unwrap(), 1024);
    }

    #[test]
    fn test_tsresol_out_of_range() {
        assert!(tsresol_ticks(20).is_err());
        assert!(tsresol_ticks(0x80 | 64).is_err());
    }
}
