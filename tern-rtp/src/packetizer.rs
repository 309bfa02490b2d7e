//! Frame packetization
//!
//! Splits one encoded frame into RTP-sized payloads. [`num_packets`] is a
//! pre-pass that exactly predicts how many [`next_packet`] calls will
//! succeed, so the sender can budget before emitting anything; the final
//! packet carries the marker bit.
//!
//! [`num_packets`]: RtpPacketizer::num_packets
//! [`next_packet`]: RtpPacketizer::next_packet

use std::collections::VecDeque;

use bytes::Bytes;

use crate::h264::H264Packetizer;

/// Per-packet payload budget for one frame
///
/// The reductions shrink the budget of specific packets, making room for
/// headers the caller will add there (e.g. an aggregation header on the
/// first packet or an extension only the last packet carries).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadSizeLimits {
    pub max_payload_len: usize,
    pub first_packet_reduction_len: usize,
    pub last_packet_reduction_len: usize,
    /// Applied instead of first/last when the frame fits in one packet
    pub single_packet_reduction_len: usize,
}

impl Default for PayloadSizeLimits {
    fn default() -> Self {
        PayloadSizeLimits {
            max_payload_len: 1200,
            first_packet_reduction_len: 0,
            last_packet_reduction_len: 0,
            single_packet_reduction_len: 0,
        }
    }
}

/// The piece of a frame that rides in one RTP packet
#[derive(Debug, Clone, Default)]
pub struct RtpPacket {
    pub payload: Bytes,
    /// Set on the final packet of the frame
    pub marker: bool,
}

/// Turns one frame into an ordered sequence of packet payloads
pub trait RtpPacketizer {
    /// Packets still to come; exactly this many `next_packet` calls succeed
    fn num_packets(&self) -> usize;

    /// Fill `packet` with the next piece of the frame
    ///
    /// Returns `false` once the frame is exhausted (or the limits made
    /// packetization impossible, in which case it never returns `true`).
    fn next_packet(&mut self, packet: &mut RtpPacket) -> bool;
}

/// Which packetization strategy to construct
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodecKind {
    /// Opaque frame bytes, split about equally
    Generic,
    /// H.264 Annex A NAL units, packetization mode 1
    H264,
}

/// Codec-specific framing details that accompany a frame
#[derive(Debug, Clone, Default)]
pub struct VideoPayloadInfo {
    /// H.264: byte length of each NAL unit in payload order, summing to
    /// the payload length. Empty treats the whole payload as one unit.
    /// Ignored by the generic packetizer.
    pub nalu_sizes: Vec<usize>,
}

/// Construct the packetizer for `kind`
///
/// Infeasible limits yield a packetizer that reports zero packets rather
/// than an error, so callers can treat "will not fit" and "already
/// drained" uniformly.
pub fn new_packetizer(
    kind: VideoCodecKind,
    payload: Bytes,
    info: &VideoPayloadInfo,
    limits: PayloadSizeLimits,
) -> Box<dyn RtpPacketizer> {
    match kind {
        VideoCodecKind::Generic => Box::new(GenericPacketizer::new(payload, limits)),
        VideoCodecKind::H264 => Box::new(H264Packetizer::new(payload, &info.nalu_sizes, limits)),
    }
}

/// Split `payload_len` bytes into per-packet sizes, as evenly as possible
///
/// Honors the first/last/single packet reductions. Returns an empty vector
/// when the limits cannot accommodate the payload at all. The sizes sum to
/// `payload_len` and no packet is more than one byte larger than an
/// earlier one, reductions aside.
pub fn split_about_equally(payload_len: usize, limits: PayloadSizeLimits) -> Vec<usize> {
    if payload_len == 0 {
        return Vec::new();
    }
    if limits.max_payload_len >= limits.single_packet_reduction_len
        && limits.max_payload_len - limits.single_packet_reduction_len >= payload_len
    {
        return vec![payload_len];
    }
    // need room for at least one byte in the first and the last packet
    if limits.max_payload_len <= limits.first_packet_reduction_len
        || limits.max_payload_len <= limits.last_packet_reduction_len
    {
        return Vec::new();
    }

    // pretend the first and last packets are full sized by padding the
    // total with their reductions
    let total_bytes =
        payload_len + limits.first_packet_reduction_len + limits.last_packet_reduction_len;
    let mut num_packets_left = (total_bytes + limits.max_payload_len - 1) / limits.max_payload_len;
    if num_packets_left == 1 {
        // a true single packet was handled above; this frame must split
        num_packets_left = 2;
    }

    if payload_len < num_packets_left {
        // the reductions demand more packets than there are payload bytes
        return Vec::new();
    }

    let mut bytes_per_packet = total_bytes / num_packets_left;
    let num_larger_packets = total_bytes % num_packets_left;
    let mut remaining_data = payload_len;

    let mut result = Vec::with_capacity(num_packets_left);
    let mut first_packet = true;
    while remaining_data > 0 {
        // the last num_larger_packets packets are one byte wider
        if num_packets_left == num_larger_packets {
            bytes_per_packet += 1;
        }
        let mut current_packet_bytes = bytes_per_packet;
        if first_packet {
            if current_packet_bytes > limits.first_packet_reduction_len + 1 {
                current_packet_bytes -= limits.first_packet_reduction_len;
            } else {
                current_packet_bytes = 1;
            }
        }
        if current_packet_bytes > remaining_data {
            current_packet_bytes = remaining_data;
        }
        // not the last packet overall, so keep a byte back for it
        if num_packets_left == 2 && current_packet_bytes == remaining_data {
            current_packet_bytes -= 1;
        }
        result.push(current_packet_bytes);

        remaining_data -= current_packet_bytes;
        num_packets_left -= 1;
        first_packet = false;
    }

    result
}

/// Codec-agnostic packetizer: an even split of an opaque frame
///
/// The matching depacketization is plain concatenation of the payloads in
/// order.
#[derive(Debug)]
pub struct GenericPacketizer {
    payload: Bytes,
    offset: usize,
    sizes: VecDeque<usize>,
}

impl GenericPacketizer {
    pub fn new(payload: Bytes, limits: PayloadSizeLimits) -> Self {
        let sizes = split_about_equally(payload.len(), limits).into();
        GenericPacketizer {
            payload,
            offset: 0,
            sizes,
        }
    }
}

impl RtpPacketizer for GenericPacketizer {
    fn num_packets(&self) -> usize {
        self.sizes.len()
    }

    fn next_packet(&mut self, packet: &mut RtpPacket) -> bool {
        let size = match self.sizes.pop_front() {
            Some(size) => size,
            None => return false,
        };
        packet.payload = self.payload.slice(self.offset..self.offset + size);
        packet.marker = self.sizes.is_empty();
        self.offset += size;
        true
    }
}
