//! TLS record framing: the fixed 5-byte header is all the analyzer needs.
//!
//! Record bodies are opaque (usually ciphertext) and never inspected.

use serde::{Deserialize, Serialize};

/// Length of the TLS record header: content type, version, body length.
pub const RECORD_HEADER_LEN: usize = 5;

/// Upper bound on a record body: 2^14 plaintext plus the maximum ciphertext
/// expansion allowed by TLS 1.2. A larger length field means the byte stream
/// is not aligned on a record boundary.
pub const MAX_RECORD_BODY: usize = (1 << 14) + 2048;

/// The TLS record content types.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub enum RecordType {
    ChangeCipherSpec,
    Alert,
    Handshake,
    ApplicationData,
    Heartbeat,
    Unknown(u8),
}

impl RecordType {
    pub fn from_wire(code: u8) -> Self {
        match code {
            20 => RecordType::ChangeCipherSpec,
            21 => RecordType::Alert,
            22 => RecordType::Handshake,
            23 => RecordType::ApplicationData,
            24 => RecordType::Heartbeat,
            other => RecordType::Unknown(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            RecordType::ChangeCipherSpec => 20,
            RecordType::Alert => 21,
            RecordType::Handshake => 22,
            RecordType::ApplicationData => 23,
            RecordType::Heartbeat => 24,
            RecordType::Unknown(other) => other,
        }
    }

    /// Whether the whole record survives masking. Only ApplicationData
    /// bodies are zeroed; unknown types keep everything as the safe default.
    pub fn keeps_whole_record(self) -> bool {
        self != RecordType::ApplicationData
    }
}

/// Resolve the record type from the two type fields a decoder may report.
///
/// TLS 1.3 wraps encrypted records: the outer `opaque_type` is what appears
/// on the wire while `content_type` may name the decrypted inner type. The
/// wire byte governs masking, so `opaque_type` wins when both are present.
pub fn effective_type(content_type: u8, opaque_type: Option<u8>) -> RecordType {
    RecordType::from_wire(opaque_type.unwrap_or(content_type))
}

/// A parsed record header.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct RecordHeader {
    pub record_type: RecordType,
    pub version: (u8, u8),
    pub body_len: usize,
}

impl RecordHeader {
    pub fn total_len(&self) -> usize {
        RECORD_HEADER_LEN + self.body_len
    }

    /// Conservative check that these five bytes can open a TLS record:
    /// a known content type, a 3.x version, and a sane body length. Used to
    /// decide whether an unsynchronized byte stream is TLS at all.
    pub fn is_plausible(&self) -> bool {
        !matches!(self.record_type, RecordType::Unknown(_))
            && self.version.0 == 3
            && self.version.1 <= 4
            && self.body_len <= MAX_RECORD_BODY
    }
}

/// Parse a record header from the front of `data`, if 5 bytes are available.
pub fn parse_record_header(data: &[u8]) -> Option<RecordHeader> {
    if data.len() < RECORD_HEADER_LEN {
        return None;
    }
    Some(RecordHeader {
        record_type: RecordType::from_wire(data[0]),
        version: (data[1], data[2]),
        body_len: usize::from(u16::from_be_bytes([data[3], data[4]])),
    })
}
