//! RFC 4960 chunk codec
//!
//! Every chunk is a TLV record: one byte of type, one byte of flags, and a
//! big-endian u16 length that counts the 4-byte header plus the unpadded
//! value, with the whole record zero-padded to a 4-byte boundary. Individual
//! chunk parsers return `None` on any malformed input; the `Chunk` enum
//! dispatches on the type tag and reports unknown types distinctly so callers
//! can apply the RFC 4960 §3.2 upper-two-bit handling rules.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::error_cause::ErrorCause;
use crate::parameter::Parameter;
use crate::tlv;
use crate::types::{PayloadProtocolId, Ssn, StreamId, Tsn};

/// Fixed part of a DATA chunk value: tsn, stream id, ssn, ppid
const DATA_SUBHEADER_SIZE: usize = 12;

/// Fixed part of a SACK chunk value: cum ack, a_rwnd, gap/dup counts
const SACK_SUBHEADER_SIZE: usize = 12;

const DATA_FLAG_IMMEDIATE_ACK: u8 = 0x08;
const DATA_FLAG_UNORDERED: u8 = 0x04;
const DATA_FLAG_BEGINNING: u8 = 0x02;
const DATA_FLAG_END: u8 = 0x01;

const SHUTDOWN_COMPLETE_FLAG_TAG_REFLECTED: u8 = 0x01;

/// Payload-bearing chunk (RFC 4960 §3.3.1)
///
/// A message fragment: `beginning` and `end` mark the first and last fragment,
/// a chunk carrying both is a complete message. An empty payload is invalid
/// on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChunk {
    pub tsn: Tsn,
    pub stream_id: StreamId,
    pub ssn: Ssn,
    pub ppid: PayloadProtocolId,
    pub payload: Bytes,
    /// Ask the receiver to SACK without delay
    pub immediate_ack: bool,
    pub unordered: bool,
    pub beginning: bool,
    pub end: bool,
}

impl DataChunk {
    pub const TYPE: u8 = 0;

    pub fn parse(data: &[u8]) -> Option<Self> {
        let header = tlv::parse_chunk_tlv(Self::TYPE, data)?;
        let mut value = header.value;
        // The payload must be non-empty.
        if value.len() <= DATA_SUBHEADER_SIZE {
            return None;
        }
        let tsn = Tsn::new(value.get_u32());
        let stream_id = StreamId(value.get_u16());
        let ssn = Ssn(value.get_u16());
        let ppid = PayloadProtocolId(value.get_u32());
        Some(DataChunk {
            tsn,
            stream_id,
            ssn,
            ppid,
            payload: Bytes::copy_from_slice(value),
            immediate_ack: header.flags & DATA_FLAG_IMMEDIATE_ACK != 0,
            unordered: header.flags & DATA_FLAG_UNORDERED != 0,
            beginning: header.flags & DATA_FLAG_BEGINNING != 0,
            end: header.flags & DATA_FLAG_END != 0,
        })
    }

    pub fn serialize_to(&self, out: &mut BytesMut) {
        let mut flags = 0;
        if self.immediate_ack {
            flags |= DATA_FLAG_IMMEDIATE_ACK;
        }
        if self.unordered {
            flags |= DATA_FLAG_UNORDERED;
        }
        if self.beginning {
            flags |= DATA_FLAG_BEGINNING;
        }
        if self.end {
            flags |= DATA_FLAG_END;
        }
        let value_len = DATA_SUBHEADER_SIZE + self.payload.len();
        tlv::write_chunk_header(out, Self::TYPE, flags, value_len);
        out.put_u32(self.tsn.as_raw());
        out.put_u16(self.stream_id.0);
        out.put_u16(self.ssn.0);
        out.put_u32(self.ppid.0);
        out.extend_from_slice(&self.payload);
        tlv::write_padding(out, tlv::TLV_HEADER_SIZE + value_len);
    }

    /// On-the-wire length including header and padding
    #[inline]
    pub fn serialized_size(&self) -> usize {
        tlv::round_up_to_4(tlv::TLV_HEADER_SIZE + DATA_SUBHEADER_SIZE + self.payload.len())
    }
}

impl fmt::Display for DataChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DATA (tsn={}, stream={}, ssn={}, bytes={})",
            self.tsn,
            self.stream_id,
            self.ssn,
            self.payload.len()
        )
    }
}

/// One gap of received TSNs above the cumulative ack, as offsets from it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GapAckBlock {
    /// Offset of the first received TSN in the block (>= 1)
    pub start: u16,
    /// Offset of the last received TSN in the block (inclusive)
    pub end: u16,
}

impl GapAckBlock {
    pub fn new(start: u16, end: u16) -> Self {
        GapAckBlock { start, end }
    }
}

/// Selective acknowledgement (RFC 4960 §3.3.4)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SackChunk {
    /// Every TSN up to and including this one has been received
    pub cumulative_tsn_ack: Tsn,
    /// Receiver window the sender must respect
    pub a_rwnd: u32,
    pub gap_ack_blocks: Vec<GapAckBlock>,
    pub duplicate_tsns: Vec<Tsn>,
}

impl SackChunk {
    pub const TYPE: u8 = 3;

    pub fn parse(data: &[u8]) -> Option<Self> {
        let header = tlv::parse_chunk_tlv(Self::TYPE, data)?;
        let mut value = header.value;
        if value.len() < SACK_SUBHEADER_SIZE {
            return None;
        }
        let cumulative_tsn_ack = Tsn::new(value.get_u32());
        let a_rwnd = value.get_u32();
        let gap_count = usize::from(value.get_u16());
        let dup_count = usize::from(value.get_u16());
        if value.len() != gap_count * 4 + dup_count * 4 {
            return None;
        }
        let mut gap_ack_blocks = Vec::with_capacity(gap_count);
        for _ in 0..gap_count {
            let start = value.get_u16();
            let end = value.get_u16();
            gap_ack_blocks.push(GapAckBlock { start, end });
        }
        let mut duplicate_tsns = Vec::with_capacity(dup_count);
        for _ in 0..dup_count {
            duplicate_tsns.push(Tsn::new(value.get_u32()));
        }
        Some(SackChunk {
            cumulative_tsn_ack,
            a_rwnd,
            gap_ack_blocks,
            duplicate_tsns,
        })
    }

    pub fn serialize_to(&self, out: &mut BytesMut) {
        let value_len =
            SACK_SUBHEADER_SIZE + self.gap_ack_blocks.len() * 4 + self.duplicate_tsns.len() * 4;
        tlv::write_chunk_header(out, Self::TYPE, 0, value_len);
        out.put_u32(self.cumulative_tsn_ack.as_raw());
        out.put_u32(self.a_rwnd);
        out.put_u16(self.gap_ack_blocks.len() as u16);
        out.put_u16(self.duplicate_tsns.len() as u16);
        for block in &self.gap_ack_blocks {
            out.put_u16(block.start);
            out.put_u16(block.end);
        }
        for tsn in &self.duplicate_tsns {
            out.put_u32(tsn.as_raw());
        }
    }
}

impl fmt::Display for SackChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SACK (cum_ack={}, a_rwnd={}, gaps={})",
            self.cumulative_tsn_ack,
            self.a_rwnd,
            self.gap_ack_blocks.len()
        )
    }
}

/// Liveness probe carrying opaque sender state (RFC 4960 §3.3.5)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatRequestChunk {
    pub info: Parameter,
}

impl HeartbeatRequestChunk {
    pub const TYPE: u8 = 4;

    pub fn new(info: Bytes) -> Self {
        HeartbeatRequestChunk {
            info: Parameter::heartbeat_info(info),
        }
    }

    pub fn parse(data: &[u8]) -> Option<Self> {
        let header = tlv::parse_chunk_tlv(Self::TYPE, data)?;
        let info = Parameter::parse(header.value)?;
        Some(HeartbeatRequestChunk { info })
    }

    pub fn serialize_to(&self, out: &mut BytesMut) {
        tlv::write_chunk_header(out, Self::TYPE, 0, self.info.serialized_size());
        self.info.serialize_to(out);
    }
}

impl fmt::Display for HeartbeatRequestChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HEARTBEAT")
    }
}

/// Echo of a heartbeat, returning the probe's info verbatim (RFC 4960 §3.3.6)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatAckChunk {
    pub info: Parameter,
}

impl HeartbeatAckChunk {
    pub const TYPE: u8 = 5;

    pub fn new(info: Parameter) -> Self {
        HeartbeatAckChunk { info }
    }

    pub fn parse(data: &[u8]) -> Option<Self> {
        let header = tlv::parse_chunk_tlv(Self::TYPE, data)?;
        let info = Parameter::parse(header.value)?;
        Some(HeartbeatAckChunk { info })
    }

    pub fn serialize_to(&self, out: &mut BytesMut) {
        tlv::write_chunk_header(out, Self::TYPE, 0, self.info.serialized_size());
        self.info.serialize_to(out);
    }
}

impl fmt::Display for HeartbeatAckChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HEARTBEAT-ACK")
    }
}

/// Immediate association teardown (RFC 4960 §3.3.7)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortChunk {
    pub error_causes: Vec<ErrorCause>,
}

impl AbortChunk {
    pub const TYPE: u8 = 6;

    pub fn parse(data: &[u8]) -> Option<Self> {
        let header = tlv::parse_chunk_tlv(Self::TYPE, data)?;
        let error_causes = ErrorCause::parse_all(header.value)?;
        Some(AbortChunk { error_causes })
    }

    pub fn serialize_to(&self, out: &mut BytesMut) {
        let value_len = ErrorCause::serialized_size_all(&self.error_causes);
        tlv::write_chunk_header(out, Self::TYPE, 0, value_len);
        ErrorCause::serialize_all(&self.error_causes, out);
    }
}

impl fmt::Display for AbortChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ABORT")
    }
}

/// Graceful shutdown request carrying the receiver's cumulative ack
/// (RFC 4960 §3.3.8)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownChunk {
    pub cumulative_tsn_ack: Tsn,
}

impl ShutdownChunk {
    pub const TYPE: u8 = 7;

    pub fn parse(data: &[u8]) -> Option<Self> {
        let header = tlv::parse_chunk_tlv(Self::TYPE, data)?;
        let mut value = header.value;
        if value.len() != 4 {
            return None;
        }
        Some(ShutdownChunk {
            cumulative_tsn_ack: Tsn::new(value.get_u32()),
        })
    }

    pub fn serialize_to(&self, out: &mut BytesMut) {
        tlv::write_chunk_header(out, Self::TYPE, 0, 4);
        out.put_u32(self.cumulative_tsn_ack.as_raw());
    }
}

impl fmt::Display for ShutdownChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SHUTDOWN")
    }
}

/// Acknowledges a SHUTDOWN (RFC 4960 §3.3.9)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShutdownAckChunk;

impl ShutdownAckChunk {
    pub const TYPE: u8 = 8;

    pub fn parse(data: &[u8]) -> Option<Self> {
        let header = tlv::parse_chunk_tlv(Self::TYPE, data)?;
        if !header.value.is_empty() {
            return None;
        }
        Some(ShutdownAckChunk)
    }

    pub fn serialize_to(&self, out: &mut BytesMut) {
        tlv::write_chunk_header(out, Self::TYPE, 0, 0);
    }
}

impl fmt::Display for ShutdownAckChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SHUTDOWN-ACK")
    }
}

/// Non-fatal error report (RFC 4960 §3.3.10)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorChunk {
    pub error_causes: Vec<ErrorCause>,
}

impl ErrorChunk {
    pub const TYPE: u8 = 9;

    pub fn parse(data: &[u8]) -> Option<Self> {
        let header = tlv::parse_chunk_tlv(Self::TYPE, data)?;
        let error_causes = ErrorCause::parse_all(header.value)?;
        Some(ErrorChunk { error_causes })
    }

    pub fn serialize_to(&self, out: &mut BytesMut) {
        let value_len = ErrorCause::serialized_size_all(&self.error_causes);
        tlv::write_chunk_header(out, Self::TYPE, 0, value_len);
        ErrorCause::serialize_all(&self.error_causes, out);
    }
}

impl fmt::Display for ErrorChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ERROR")
    }
}

/// Returns the peer's opaque state cookie to establish an association
/// (RFC 4960 §3.3.11)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieEchoChunk {
    pub cookie: Bytes,
}

impl CookieEchoChunk {
    pub const TYPE: u8 = 10;

    pub fn parse(data: &[u8]) -> Option<Self> {
        let header = tlv::parse_chunk_tlv(Self::TYPE, data)?;
        Some(CookieEchoChunk {
            cookie: Bytes::copy_from_slice(header.value),
        })
    }

    pub fn serialize_to(&self, out: &mut BytesMut) {
        tlv::write_chunk_header(out, Self::TYPE, 0, self.cookie.len());
        out.extend_from_slice(&self.cookie);
        tlv::write_padding(out, tlv::TLV_HEADER_SIZE + self.cookie.len());
    }
}

impl fmt::Display for CookieEchoChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "COOKIE-ECHO")
    }
}

/// Completes association establishment (RFC 4960 §3.3.12)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CookieAckChunk;

impl CookieAckChunk {
    pub const TYPE: u8 = 11;

    pub fn parse(data: &[u8]) -> Option<Self> {
        let header = tlv::parse_chunk_tlv(Self::TYPE, data)?;
        if !header.value.is_empty() {
            return None;
        }
        Some(CookieAckChunk)
    }

    pub fn serialize_to(&self, out: &mut BytesMut) {
        tlv::write_chunk_header(out, Self::TYPE, 0, 0);
    }
}

impl fmt::Display for CookieAckChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "COOKIE-ACK")
    }
}

/// Final message of the shutdown handshake (RFC 4960 §3.3.13)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShutdownCompleteChunk {
    /// T bit: set when the sender had no association and reflected the tag
    pub tag_reflected: bool,
}

impl ShutdownCompleteChunk {
    pub const TYPE: u8 = 14;

    pub fn parse(data: &[u8]) -> Option<Self> {
        let header = tlv::parse_chunk_tlv(Self::TYPE, data)?;
        if !header.value.is_empty() {
            return None;
        }
        Some(ShutdownCompleteChunk {
            tag_reflected: header.flags & SHUTDOWN_COMPLETE_FLAG_TAG_REFLECTED != 0,
        })
    }

    pub fn serialize_to(&self, out: &mut BytesMut) {
        let flags = if self.tag_reflected {
            SHUTDOWN_COMPLETE_FLAG_TAG_REFLECTED
        } else {
            0
        };
        tlv::write_chunk_header(out, Self::TYPE, flags, 0);
    }
}

impl fmt::Display for ShutdownCompleteChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SHUTDOWN-COMPLETE")
    }
}

/// Why a buffer failed to parse as a chunk
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChunkParseError {
    #[error("buffer too short for a chunk header: {0} bytes")]
    TooShort(usize),

    #[error("unknown chunk type {0}")]
    UnknownType(u8),

    #[error("malformed {0} chunk")]
    Malformed(&'static str),
}

/// Any chunk this implementation understands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Data(DataChunk),
    Sack(SackChunk),
    HeartbeatRequest(HeartbeatRequestChunk),
    HeartbeatAck(HeartbeatAckChunk),
    Abort(AbortChunk),
    Shutdown(ShutdownChunk),
    ShutdownAck(ShutdownAckChunk),
    Error(ErrorChunk),
    CookieEcho(CookieEchoChunk),
    CookieAck(CookieAckChunk),
    ShutdownComplete(ShutdownCompleteChunk),
}

impl Chunk {
    /// Parse a chunk, dispatching on the type tag
    pub fn parse(data: &[u8]) -> Result<Chunk, ChunkParseError> {
        if data.len() < tlv::TLV_HEADER_SIZE {
            return Err(ChunkParseError::TooShort(data.len()));
        }
        match data[0] {
            DataChunk::TYPE => DataChunk::parse(data)
                .map(Chunk::Data)
                .ok_or(ChunkParseError::Malformed("DATA")),
            SackChunk::TYPE => SackChunk::parse(data)
                .map(Chunk::Sack)
                .ok_or(ChunkParseError::Malformed("SACK")),
            HeartbeatRequestChunk::TYPE => HeartbeatRequestChunk::parse(data)
                .map(Chunk::HeartbeatRequest)
                .ok_or(ChunkParseError::Malformed("HEARTBEAT")),
            HeartbeatAckChunk::TYPE => HeartbeatAckChunk::parse(data)
                .map(Chunk::HeartbeatAck)
                .ok_or(ChunkParseError::Malformed("HEARTBEAT-ACK")),
            AbortChunk::TYPE => AbortChunk::parse(data)
                .map(Chunk::Abort)
                .ok_or(ChunkParseError::Malformed("ABORT")),
            ShutdownChunk::TYPE => ShutdownChunk::parse(data)
                .map(Chunk::Shutdown)
                .ok_or(ChunkParseError::Malformed("SHUTDOWN")),
            ShutdownAckChunk::TYPE => ShutdownAckChunk::parse(data)
                .map(Chunk::ShutdownAck)
                .ok_or(ChunkParseError::Malformed("SHUTDOWN-ACK")),
            ErrorChunk::TYPE => ErrorChunk::parse(data)
                .map(Chunk::Error)
                .ok_or(ChunkParseError::Malformed("ERROR")),
            CookieEchoChunk::TYPE => CookieEchoChunk::parse(data)
                .map(Chunk::CookieEcho)
                .ok_or(ChunkParseError::Malformed("COOKIE-ECHO")),
            CookieAckChunk::TYPE => CookieAckChunk::parse(data)
                .map(Chunk::CookieAck)
                .ok_or(ChunkParseError::Malformed("COOKIE-ACK")),
            ShutdownCompleteChunk::TYPE => ShutdownCompleteChunk::parse(data)
                .map(Chunk::ShutdownComplete)
                .ok_or(ChunkParseError::Malformed("SHUTDOWN-COMPLETE")),
            typ => Err(ChunkParseError::UnknownType(typ)),
        }
    }

    pub fn serialize_to(&self, out: &mut BytesMut) {
        match self {
            Chunk::Data(c) => c.serialize_to(out),
            Chunk::Sack(c) => c.serialize_to(out),
            Chunk::HeartbeatRequest(c) => c.serialize_to(out),
            Chunk::HeartbeatAck(c) => c.serialize_to(out),
            Chunk::Abort(c) => c.serialize_to(out),
            Chunk::Shutdown(c) => c.serialize_to(out),
            Chunk::ShutdownAck(c) => c.serialize_to(out),
            Chunk::Error(c) => c.serialize_to(out),
            Chunk::CookieEcho(c) => c.serialize_to(out),
            Chunk::CookieAck(c) => c.serialize_to(out),
            Chunk::ShutdownComplete(c) => c.serialize_to(out),
        }
    }

    /// Serialize into a fresh buffer
    pub fn serialize(&self) -> Bytes {
        let mut out = BytesMut::new();
        self.serialize_to(&mut out);
        out.freeze()
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Chunk::Data(c) => c.fmt(f),
            Chunk::Sack(c) => c.fmt(f),
            Chunk::HeartbeatRequest(c) => c.fmt(f),
            Chunk::HeartbeatAck(c) => c.fmt(f),
            Chunk::Abort(c) => c.fmt(f),
            Chunk::Shutdown(c) => c.fmt(f),
            Chunk::ShutdownAck(c) => c.fmt(f),
            Chunk::Error(c) => c.fmt(f),
            Chunk::CookieEcho(c) => c.fmt(f),
            Chunk::CookieAck(c) => c.fmt(f),
            Chunk::ShutdownComplete(c) => c.fmt(f),
        }
    }
}
