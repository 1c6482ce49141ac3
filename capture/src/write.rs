//! Capture writer mirroring the structure of the file that was read.
//!
//! pcap-parser only parses, so the block layouts are produced here by hand.
//! Output is always little-endian; frame bytes, ordering, original lengths,
//! and native-unit timestamps are preserved exactly.

use crate::{
    frame::Frame,
    read::{CaptureFormat, CaptureMeta},
};
use anyhow::{bail, Context as _, Error};
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

const PCAP_MAGIC_US: u32 = 0xa1b2_c3d4;
const PCAP_MAGIC_NS: u32 = 0xa1b2_3c4d;

const SHB_TYPE: u32 = 0x0a0d_0d0a;
const IDB_TYPE: u32 = 0x0000_0001;
const EPB_TYPE: u32 = 0x0000_0006;
const BYTE_ORDER_MAGIC: u32 = 0x1a2b_3c4d;

pub struct CaptureWriter<W: Write> {
    out: W,
    meta: CaptureMeta,
    frames_written: u64,
}

impl CaptureWriter<BufWriter<File>> {
    pub fn create(path: &Path, meta: &CaptureMeta) -> Result<Self, Error> {
        let file = File::create(path)
            .with_context(|| format!("creating output capture {}", path.display()))?;
        Self::new(BufWriter::new(file), meta)
    }
}

impl<W: Write> CaptureWriter<W> {
    /// Open a writer and emit the file header(s) for `meta` immediately.
    pub fn new(out: W, meta: &CaptureMeta) -> Result<Self, Error> {
        let mut writer = Self {
            out,
            meta: meta.clone(),
            frames_written: 0,
        };
        match writer.meta.format {
            CaptureFormat::Pcap => writer.write_pcap_header()?,
            CaptureFormat::PcapNg => writer.write_pcapng_headers()?,
        }
        Ok(writer)
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn write_frame(&mut self, frame: &Frame) -> Result<(), Error> {
        match self.meta.format {
            CaptureFormat::Pcap => self.write_pcap_record(frame),
            CaptureFormat::PcapNg => self.write_epb(frame),
        }
    }

    pub fn finish(mut self) -> Result<(), Error> {
        self.out.flush().context("flushing output capture")?;
        Ok(())
    }

    fn write_pcap_header(&mut self) -> Result<(), Error> {
        let iface = match self.meta.interfaces.get(0) {
            Some(iface) => iface.clone(),
            None => bail!("cannot write a pcap file without interface metadata"),
        };
        let magic = match iface.tsresol_raw {
            6 => PCAP_MAGIC_US,
            9 => PCAP_MAGIC_NS,
            other => bail!("timestamp resolution 10^-{} not expressible in legacy pcap", other),
        };
        self.u32(magic)?;
        self.u16(2)?; // version major
        self.u16(4)?; // version minor
        self.u32(0)?; // thiszone
        self.u32(0)?; // sigfigs
        self.u32(iface.snaplen)?;
        self.u32(iface.linktype)?;
        Ok(())
    }

    fn write_pcap_record(&mut self, frame: &Frame) -> Result<(), Error> {
        if frame.iface != 0 {
            bail!("legacy pcap has a single interface, frame references {}", frame.iface);
        }
        self.u32(frame.ts.seconds() as u32)?;
        self.u32(frame.ts.subsec_ticks() as u32)?;
        self.u32(frame.data.len() as u32)?;
        self.u32(frame.orig_len)?;
        self.out.write_all(&frame.data)?;
        self.frames_written += 1;
        Ok(())
    }

    fn write_pcapng_headers(&mut self) -> Result<(), Error> {
        if self.meta.interfaces.is_empty() {
            bail!("cannot write a pcapng file without interface metadata");
        }
        // Section header, unknown section length.
        self.u32(SHB_TYPE)?;
        self.u32(28)?;
        self.u32(BYTE_ORDER_MAGIC)?;
        self.u16(1)?; // major
        self.u16(0)?; // minor
        self.u64(u64::max_value())?;
        self.u32(28)?;

        let interfaces = self.meta.interfaces.clone();
        for iface in &interfaces {
            // if_tsresol 6 is the pcapng default and needs no option.
            let options_len = if iface.tsresol_raw == 6 { 0 } else { 12 };
            let total = 20 + options_len;
            self.u32(IDB_TYPE)?;
            self.u32(total)?;
            self.u16(iface.linktype as u16)?;
            self.u16(0)?; // reserved
            self.u32(iface.snaplen)?;
            if options_len != 0 {
                self.u16(9)?; // if_tsresol
                self.u16(1)?;
                self.out.write_all(&[iface.tsresol_raw, 0, 0, 0])?;
                self.u16(0)?; // opt_endofopt
                self.u16(0)?;
            }
            self.u32(total)?;
        }
        Ok(())
    }

    fn write_epb(&mut self, frame: &Frame) -> Result<(), Error> {
        if frame.iface as usize >= self.meta.interfaces.len() {
            bail!("frame references undeclared interface {}", frame.iface);
        }
        let caplen = frame.data.len() as u32;
        let padded = (frame.data.len() + 3) & !3;
        let total = 32 + padded as u32;
        self.u32(EPB_TYPE)?;
        self.u32(total)?;
        self.u32(frame.iface)?;
        self.u32((frame.ts.units() >> 32) as u32)?;
        self.u32(frame.ts.units() as u32)?;
        self.u32(caplen)?;
        self.u32(frame.orig_len)?;
        self.out.write_all(&frame.data)?;
        let pad = padded - frame.data.len();
        if pad != 0 {
            self.out.write_all(&[0u8; 3][..pad])?;
        }
        self.u32(total)?;
        self.frames_written += 1;
        Ok(())
    }

    fn u16(&mut self, v: u16) -> Result<(), Error> {
        self.out.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn u32(&mut self, v: u32) -> Result<(), Error> {
        self.out.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn u64(&mut self, v: u64) -> Result<(), Error> {
        self.out.write_all(&v.to_le_bytes())?;
        Ok(())
    }
}
