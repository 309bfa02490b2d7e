//! Error causes carried by ABORT and ERROR chunks
//!
//! Same TLV shape as parameters: u16 cause code, u16 length covering the
//! 4-byte header plus the unpadded value. Unknown causes are preserved raw so
//! peers using extensions we do not understand still round-trip.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::tlv;
use crate::types::StreamId;

pub const INVALID_STREAM_IDENTIFIER_CAUSE: u16 = 1;
pub const MISSING_MANDATORY_PARAMETER_CAUSE: u16 = 2;
pub const STALE_COOKIE_ERROR_CAUSE: u16 = 3;
pub const INVALID_MANDATORY_PARAMETER_CAUSE: u16 = 7;
pub const USER_INITIATED_ABORT_CAUSE: u16 = 12;
pub const PROTOCOL_VIOLATION_CAUSE: u16 = 13;

/// One error cause (RFC 4960 §3.3.10)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCause {
    /// Data arrived for a stream the receiver does not accept
    InvalidStreamIdentifier { stream_id: StreamId },
    /// A required parameter was absent; lists the missing parameter types
    MissingMandatoryParameter { parameter_types: Vec<u16> },
    /// The state cookie had expired; staleness in microseconds
    StaleCookieError { staleness_us: u32 },
    InvalidMandatoryParameter,
    /// The application tore the association down; free-form reason
    UserInitiatedAbort { reason: String },
    /// Peer misbehavior description
    ProtocolViolation { information: String },
    /// A cause code this implementation does not know, kept byte-exact
    Unknown { typ: u16, value: Bytes },
}

impl ErrorCause {
    /// The wire cause code
    pub fn typ(&self) -> u16 {
        match self {
            ErrorCause::InvalidStreamIdentifier { .. } => INVALID_STREAM_IDENTIFIER_CAUSE,
            ErrorCause::MissingMandatoryParameter { .. } => MISSING_MANDATORY_PARAMETER_CAUSE,
            ErrorCause::StaleCookieError { .. } => STALE_COOKIE_ERROR_CAUSE,
            ErrorCause::InvalidMandatoryParameter => INVALID_MANDATORY_PARAMETER_CAUSE,
            ErrorCause::UserInitiatedAbort { .. } => USER_INITIATED_ABORT_CAUSE,
            ErrorCause::ProtocolViolation { .. } => PROTOCOL_VIOLATION_CAUSE,
            ErrorCause::Unknown { typ, .. } => *typ,
        }
    }

    /// Parse one cause from the front of `data`
    ///
    /// Returns the cause and the bytes consumed including padding.
    pub fn parse(data: &[u8]) -> Option<(ErrorCause, usize)> {
        let (header, consumed) = tlv::parse_param_tlv(data)?;
        let cause = Self::parse_value(header.typ, header.value)?;
        Some((cause, consumed))
    }

    /// Parse a packed sequence of causes, e.g. an ABORT chunk value
    pub fn parse_all(mut data: &[u8]) -> Option<Vec<ErrorCause>> {
        let mut causes = Vec::new();
        while !data.is_empty() {
            let (cause, consumed) = ErrorCause::parse(data)?;
            causes.push(cause);
            data = &data[consumed..];
        }
        Some(causes)
    }

    fn parse_value(typ: u16, mut value: &[u8]) -> Option<ErrorCause> {
        match typ {
            INVALID_STREAM_IDENTIFIER_CAUSE => {
                // Stream identifier plus two reserved bytes.
                if value.len() != 4 {
                    return None;
                }
                let stream_id = StreamId(value.get_u16());
                Some(ErrorCause::InvalidStreamIdentifier { stream_id })
            }
            MISSING_MANDATORY_PARAMETER_CAUSE => {
                if value.len() < 4 {
                    return None;
                }
                let count = value.get_u32() as usize;
                if value.len() != count * 2 {
                    return None;
                }
                let mut parameter_types = Vec::with_capacity(count);
                for _ in 0..count {
                    parameter_types.push(value.get_u16());
                }
                Some(ErrorCause::MissingMandatoryParameter { parameter_types })
            }
            STALE_COOKIE_ERROR_CAUSE => {
                if value.len() != 4 {
                    return None;
                }
                Some(ErrorCause::StaleCookieError {
                    staleness_us: value.get_u32(),
                })
            }
            INVALID_MANDATORY_PARAMETER_CAUSE => {
                if !value.is_empty() {
                    return None;
                }
                Some(ErrorCause::InvalidMandatoryParameter)
            }
            USER_INITIATED_ABORT_CAUSE => Some(ErrorCause::UserInitiatedAbort {
                reason: String::from_utf8_lossy(value).into_owned(),
            }),
            PROTOCOL_VIOLATION_CAUSE => Some(ErrorCause::ProtocolViolation {
                information: String::from_utf8_lossy(value).into_owned(),
            }),
            typ => Some(ErrorCause::Unknown {
                typ,
                value: Bytes::copy_from_slice(value),
            }),
        }
    }

    pub fn serialize_to(&self, out: &mut BytesMut) {
        let value_len = self.value_len();
        tlv::write_param_header(out, self.typ(), value_len);
        match self {
            ErrorCause::InvalidStreamIdentifier { stream_id } => {
                out.put_u16(stream_id.0);
                out.put_u16(0);
            }
            ErrorCause::MissingMandatoryParameter { parameter_types } => {
                out.put_u32(parameter_types.len() as u32);
                for typ in parameter_types {
                    out.put_u16(*typ);
                }
            }
            ErrorCause::StaleCookieError { staleness_us } => out.put_u32(*staleness_us),
            ErrorCause::InvalidMandatoryParameter => {}
            ErrorCause::UserInitiatedAbort { reason } => out.extend_from_slice(reason.as_bytes()),
            ErrorCause::ProtocolViolation { information } => {
                out.extend_from_slice(information.as_bytes())
            }
            ErrorCause::Unknown { value, .. } => out.extend_from_slice(value),
        }
        tlv::write_padding(out, tlv::TLV_HEADER_SIZE + value_len);
    }

    fn value_len(&self) -> usize {
        match self {
            ErrorCause::InvalidStreamIdentifier { .. } => 4,
            ErrorCause::MissingMandatoryParameter { parameter_types } => {
                4 + parameter_types.len() * 2
            }
            ErrorCause::StaleCookieError { .. } => 4,
            ErrorCause::InvalidMandatoryParameter => 0,
            ErrorCause::UserInitiatedAbort { reason } => reason.len(),
            ErrorCause::ProtocolViolation { information } => information.len(),
            ErrorCause::Unknown { value, .. } => value.len(),
        }
    }

    /// Serialize a cause list the way ABORT and ERROR chunks carry it
    pub fn serialize_all(causes: &[ErrorCause], out: &mut BytesMut) {
        for cause in causes {
            cause.serialize_to(out);
        }
    }

    /// Serialized length of a cause list including per-cause padding
    pub fn serialized_size_all(causes: &[ErrorCause]) -> usize {
        causes
            .iter()
            .map(|cause| tlv::round_up_to_4(tlv::TLV_HEADER_SIZE + cause.value_len()))
            .sum()
    }
}

impl fmt::Display for ErrorCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCause::InvalidStreamIdentifier { stream_id } => {
                write!(f, "Invalid Stream Identifier ({})", stream_id)
            }
            ErrorCause::MissingMandatoryParameter { parameter_types } => {
                write!(f, "Missing Mandatory Parameter ({} types)", parameter_types.len())
            }
            ErrorCause::StaleCookieError { staleness_us } => {
                write!(f, "Stale Cookie Error ({} us)", staleness_us)
            }
            ErrorCause::InvalidMandatoryParameter => write!(f, "Invalid Mandatory Parameter"),
            ErrorCause::UserInitiatedAbort { reason } => {
                write!(f, "User-Initiated Abort: {}", reason)
            }
            ErrorCause::ProtocolViolation { information } => {
                write!(f, "Protocol Violation: {}", information)
            }
            ErrorCause::Unknown { typ, value } => {
                write!(f, "Unknown error cause type={} ({} bytes)", typ, value.len())
            }
        }
    }
}
