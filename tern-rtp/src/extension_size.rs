//! RTP header extension registration and size accounting, RFC 8285
//!
//! Senders need the extension block size before assembling a packet so
//! payload limits can be budgeted. The calculator mirrors the on-wire
//! layout: one-byte element headers normally, promoted wholesale to the
//! two-byte form when any registered id or value cannot use them.

use tracing::warn;

/// Largest id usable with one-byte element headers
pub const ONE_BYTE_HEADER_MAX_ID: u8 = 14;
/// Largest value length usable with one-byte element headers
pub const ONE_BYTE_HEADER_MAX_VALUE_SIZE: usize = 16;

const MIN_ID: u8 = 1;

/// Header extensions this stack knows how to size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RtpExtensionType {
    TransmissionOffset,
    AbsoluteSendTime,
    TransportSequenceNumber,
    VideoRotation,
    RtpMid,
    DependencyDescriptor,
}

/// One extension's contribution to a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpExtensionSize {
    pub kind: RtpExtensionType,
    pub value_size: usize,
}

impl RtpExtensionSize {
    pub fn new(kind: RtpExtensionType, value_size: usize) -> Self {
        RtpExtensionSize { kind, value_size }
    }
}

/// Negotiated extension-type to id mapping
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RtpHeaderExtensionMap {
    ids: Vec<(RtpExtensionType, u8)>,
}

impl RtpHeaderExtensionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `kind` under `id` (1..=14 one-byte range, 15..=255
    /// two-byte). Re-registering the same pair is accepted; a conflict
    /// with an existing entry is logged and refused.
    pub fn register(&mut self, kind: RtpExtensionType, id: u8) -> bool {
        if id < MIN_ID {
            warn!(?kind, id, "extension id out of range");
            return false;
        }
        if let Some(&(_, existing)) = self.ids.iter().find(|(k, _)| *k == kind) {
            if existing == id {
                return true;
            }
            warn!(?kind, id, existing, "extension type registered under another id");
            return false;
        }
        if let Some(&(existing, _)) = self.ids.iter().find(|(_, i)| *i == id) {
            warn!(?kind, id, existing_kind = ?existing, "extension id already taken");
            return false;
        }
        self.ids.push((kind, id));
        true
    }

    pub fn id(&self, kind: RtpExtensionType) -> Option<u8> {
        self.ids.iter().find(|(k, _)| *k == kind).map(|&(_, id)| id)
    }

    pub fn is_registered(&self, kind: RtpExtensionType) -> bool {
        self.id(kind).is_some()
    }
}

/// Bytes the extension block adds to an RTP header
///
/// Unregistered extensions are skipped. A single id above 14 or value
/// over 16 bytes switches every element header to the two-byte form.
/// Zero when no registered extension carries a value.
pub fn rtp_header_extension_size(
    extensions: &[RtpExtensionSize],
    map: &RtpHeaderExtensionMap,
) -> usize {
    const BLOCK_HEADER_LEN: usize = 4;
    const ONE_BYTE_ELEMENT_HEADER_LEN: usize = 1;
    const TWO_BYTE_ELEMENT_HEADER_LEN: usize = 2;

    let mut values_size = 0;
    let mut header_size = ONE_BYTE_ELEMENT_HEADER_LEN;
    let mut num_extensions = 0;
    for extension in extensions {
        let id = match map.id(extension.kind) {
            Some(id) => id,
            None => continue,
        };
        if id > ONE_BYTE_HEADER_MAX_ID || extension.value_size > ONE_BYTE_HEADER_MAX_VALUE_SIZE {
            header_size = TWO_BYTE_ELEMENT_HEADER_LEN;
        }
        values_size += extension.value_size;
        num_extensions += 1;
    }
    if values_size == 0 {
        return 0;
    }
    let size = BLOCK_HEADER_LEN + header_size * num_extensions + values_size;
    // the block length is written in 32-bit words
    size + 3 - (size + 3) % 4
}
