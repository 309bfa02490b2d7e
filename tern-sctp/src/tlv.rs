//! Type-length-value framing shared by chunks, parameters, and error causes
//!
//! Every record carries a 4-byte header whose length field counts the header
//! plus the unpadded value; the record itself is padded to a 4-byte boundary
//! with zeros. Chunk headers spend one byte on type and one on flags;
//! parameter and error-cause headers spend two bytes on the type.

use bytes::{BufMut, BytesMut};

pub(crate) const TLV_HEADER_SIZE: usize = 4;

/// Round a record length up to the 4-byte alignment the wire format requires
#[inline]
pub(crate) fn round_up_to_4(len: usize) -> usize {
    (len + 3) & !3
}

/// Flags and value of a validated chunk record
pub(crate) struct ChunkTlv<'a> {
    pub flags: u8,
    pub value: &'a [u8],
}

/// Validate a chunk TLV of `expected_type` and expose its value slice
///
/// Rejects buffers shorter than a header, a mismatched type tag, and a
/// declared length that is smaller than the header or runs past the buffer.
pub(crate) fn parse_chunk_tlv(expected_type: u8, data: &[u8]) -> Option<ChunkTlv<'_>> {
    if data.len() < TLV_HEADER_SIZE {
        return None;
    }
    if data[0] != expected_type {
        return None;
    }
    let length = usize::from(u16::from_be_bytes([data[2], data[3]]));
    if length < TLV_HEADER_SIZE || length > data.len() {
        return None;
    }
    Some(ChunkTlv {
        flags: data[1],
        value: &data[TLV_HEADER_SIZE..length],
    })
}

/// Write a chunk header for a value of `value_len` bytes
pub(crate) fn write_chunk_header(out: &mut BytesMut, typ: u8, flags: u8, value_len: usize) {
    let length = TLV_HEADER_SIZE + value_len;
    debug_assert!(length <= usize::from(u16::MAX), "chunk too large for TLV length field");
    out.put_u8(typ);
    out.put_u8(flags);
    out.put_u16(length as u16);
}

/// Zero-fill a record of `unpadded_len` bytes out to its 4-byte boundary
pub(crate) fn write_padding(out: &mut BytesMut, unpadded_len: usize) {
    for _ in unpadded_len..round_up_to_4(unpadded_len) {
        out.put_u8(0);
    }
}

/// Type and value of a validated parameter-style record (u16 type tag)
pub(crate) struct ParamTlv<'a> {
    pub typ: u16,
    pub value: &'a [u8],
}

/// Parse one parameter-style TLV from the front of `data`
///
/// Returns the record and the number of bytes consumed including padding.
/// The final record of a buffer may legally omit its padding.
pub(crate) fn parse_param_tlv(data: &[u8]) -> Option<(ParamTlv<'_>, usize)> {
    if data.len() < TLV_HEADER_SIZE {
        return None;
    }
    let typ = u16::from_be_bytes([data[0], data[1]]);
    let length = usize::from(u16::from_be_bytes([data[2], data[3]]));
    if length < TLV_HEADER_SIZE || length > data.len() {
        return None;
    }
    let consumed = round_up_to_4(length).min(data.len());
    Some((
        ParamTlv {
            typ,
            value: &data[TLV_HEADER_SIZE..length],
        },
        consumed,
    ))
}

/// Write a parameter-style header for a value of `value_len` bytes
pub(crate) fn write_param_header(out: &mut BytesMut, typ: u16, value_len: usize) {
    let length = TLV_HEADER_SIZE + value_len;
    debug_assert!(length <= usize::from(u16::MAX), "record too large for TLV length field");
    out.put_u16(typ);
    out.put_u16(length as u16);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_up_to_4() {
        assert_eq!(round_up_to_4(0), 0);
        assert_eq!(round_up_to_4(1), 4);
        assert_eq!(round_up_to_4(4), 4);
        assert_eq!(round_up_to_4(17), 20);
    }

    #[test]
    fn test_chunk_tlv_round_trip() {
        let mut out = BytesMut::new();
        write_chunk_header(&mut out, 3, 0x08, 5);
        out.extend_from_slice(b"hello");
        write_padding(&mut out, 9);
        assert_eq!(out.len(), 12);

        let tlv = parse_chunk_tlv(3, &out).unwrap();
        assert_eq!(tlv.flags, 0x08);
        assert_eq!(tlv.value, b"hello");
    }

    #[test]
    fn test_chunk_tlv_rejects_garbage() {
        assert!(parse_chunk_tlv(3, &[]).is_none());
        assert!(parse_chunk_tlv(3, &[3, 0, 0]).is_none());
        // Wrong type tag.
        assert!(parse_chunk_tlv(3, &[4, 0, 0, 4]).is_none());
        // Declared length below the header size.
        assert!(parse_chunk_tlv(3, &[3, 0, 0, 2]).is_none());
        // Declared length runs past the buffer.
        assert!(parse_chunk_tlv(3, &[3, 0, 0, 9, 1, 2]).is_none());
    }

    #[test]
    fn test_param_tlv_consumes_padding() {
        let mut out = BytesMut::new();
        write_param_header(&mut out, 1, 3);
        out.extend_from_slice(b"abc");
        write_padding(&mut out, 7);
        write_param_header(&mut out, 2, 0);

        let (first, consumed) = parse_param_tlv(&out).unwrap();
        assert_eq!(first.typ, 1);
        assert_eq!(first.value, b"abc");
        assert_eq!(consumed, 8);

        let (second, consumed) = parse_param_tlv(&out[8..]).unwrap();
        assert_eq!(second.typ, 2);
        assert!(second.value.is_empty());
        assert_eq!(consumed, 4);
    }

    #[test]
    fn test_param_tlv_final_record_without_padding() {
        let mut out = BytesMut::new();
        write_param_header(&mut out, 9, 1);
        out.put_u8(0xAA);
        // No padding appended; consumption stops at the buffer end.
        let (tlv, consumed) = parse_param_tlv(&out).unwrap();
        assert_eq!(tlv.typ, 9);
        assert_eq!(tlv.value, &[0xAA]);
        assert_eq!(consumed, 5);
    }
}
