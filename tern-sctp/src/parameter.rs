//! Variable-length chunk parameters
//!
//! Parameters ride inside chunks as u16-typed TLV records. Only the
//! heartbeat info parameter is given meaning here; everything else is
//! carried opaquely.

use std::fmt;

use bytes::{Bytes, BytesMut};

use crate::tlv;

/// Heartbeat info parameter type (RFC 4960 §3.3.5)
pub const HEARTBEAT_INFO_PARAMETER_TYPE: u16 = 1;

/// An opaque chunk parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    pub typ: u16,
    pub value: Bytes,
}

impl Parameter {
    pub fn new(typ: u16, value: Bytes) -> Self {
        Parameter { typ, value }
    }

    /// Heartbeat info carrying sender-defined opaque bytes
    pub fn heartbeat_info(value: Bytes) -> Self {
        Parameter::new(HEARTBEAT_INFO_PARAMETER_TYPE, value)
    }

    /// Parse one parameter from the front of `data`, ignoring trailing bytes
    pub fn parse(data: &[u8]) -> Option<Parameter> {
        let (tlv, _consumed) = tlv::parse_param_tlv(data)?;
        Some(Parameter {
            typ: tlv.typ,
            value: Bytes::copy_from_slice(tlv.value),
        })
    }

    pub fn serialize_to(&self, out: &mut BytesMut) {
        tlv::write_param_header(out, self.typ, self.value.len());
        out.extend_from_slice(&self.value);
        tlv::write_padding(out, tlv::TLV_HEADER_SIZE + self.value.len());
    }

    /// Serialized length including padding
    pub fn serialized_size(&self) -> usize {
        tlv::round_up_to_4(tlv::TLV_HEADER_SIZE + self.value.len())
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.typ {
            HEARTBEAT_INFO_PARAMETER_TYPE => {
                write!(f, "Heartbeat Info ({} bytes)", self.value.len())
            }
            typ => write!(f, "Parameter type={} ({} bytes)", typ, self.value.len()),
        }
    }
}
