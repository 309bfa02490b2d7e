//! H.264 packetization, RFC 6184 non-interleaved mode
//!
//! Small NAL units travel whole (single NALU packet) or aggregated
//! (STAP-A); units over the limit are fragmented (FU-A) with the NAL
//! header stripped and rebuilt from the FU headers on the far side. The
//! depacketizer is the exact inverse: feeding it every packet payload in
//! order yields the original NAL units byte for byte.

use std::collections::VecDeque;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tracing::warn;

use crate::packetizer::{split_about_equally, PayloadSizeLimits, RtpPacket, RtpPacketizer};

const NAL_HEADER_SIZE: usize = 1;
const FU_A_HEADER_SIZE: usize = 2;
const LENGTH_FIELD_SIZE: usize = 2;

const NAL_F_BIT: u8 = 0x80;
const NAL_NRI_MASK: u8 = 0x60;
const NAL_TYPE_MASK: u8 = 0x1f;
const NAL_TYPE_STAP_A: u8 = 24;
const NAL_TYPE_FU_A: u8 = 28;
const FU_S_BIT: u8 = 0x80;
const FU_E_BIT: u8 = 0x40;

/// One queued output unit: a whole NALU (possibly aggregated) or one
/// fragment of an oversized NALU
#[derive(Debug)]
struct PacketUnit {
    source_fragment: Bytes,
    first_fragment: bool,
    last_fragment: bool,
    aggregated: bool,
    /// NAL header byte of the unit this came from
    header: u8,
}

/// Packetization mode 1 packetizer
///
/// All packets are planned up front; `num_packets` is exact before the
/// first `next_packet` call.
#[derive(Debug)]
pub struct H264Packetizer {
    packets: VecDeque<PacketUnit>,
    num_packets_left: usize,
}

impl H264Packetizer {
    /// `nalu_sizes` gives the byte length of each NAL unit in `payload`,
    /// in order; empty treats the payload as a single unit. Sizes that do
    /// not cover the payload exactly produce an empty packetizer.
    pub fn new(payload: Bytes, nalu_sizes: &[usize], limits: PayloadSizeLimits) -> Self {
        let mut packetizer = H264Packetizer {
            packets: VecDeque::new(),
            num_packets_left: 0,
        };
        let fragments = match split_fragments(&payload, nalu_sizes) {
            Some(fragments) => fragments,
            None => {
                warn!(
                    payload_len = payload.len(),
                    "NAL unit sizes do not cover the payload"
                );
                return packetizer;
            }
        };
        if fragments.is_empty() {
            return packetizer;
        }
        if !packetizer.generate_packets(&fragments, limits) {
            // emit nothing rather than a truncated frame
            packetizer.packets.clear();
            packetizer.num_packets_left = 0;
        }
        packetizer
    }

    fn generate_packets(&mut self, fragments: &[Bytes], limits: PayloadSizeLimits) -> bool {
        let mut i = 0;
        while i < fragments.len() {
            let reduction = if fragments.len() == 1 {
                limits.single_packet_reduction_len
            } else if i == 0 {
                limits.first_packet_reduction_len
            } else if i + 1 == fragments.len() {
                limits.last_packet_reduction_len
            } else {
                0
            };
            let single_packet_capacity = limits.max_payload_len.saturating_sub(reduction);

            if fragments[i].len() > single_packet_capacity {
                if !self.packetize_fu_a(fragments, i, limits) {
                    return false;
                }
                i += 1;
            } else {
                i = self.packetize_stap_a(fragments, i, limits);
            }
        }
        true
    }

    /// Fragment one oversized NAL unit across FU-A packets
    fn packetize_fu_a(
        &mut self,
        fragments: &[Bytes],
        index: usize,
        limits: PayloadSizeLimits,
    ) -> bool {
        let fragment = &fragments[index];
        let last_index = fragments.len() - 1;

        let mut fu_limits = limits;
        fu_limits.max_payload_len = limits.max_payload_len.saturating_sub(FU_A_HEADER_SIZE);
        if fragments.len() != 1 {
            // if all fragments of this unit end up in one packet, that
            // packet takes this unit's position in the frame
            fu_limits.single_packet_reduction_len = if index == last_index {
                limits.last_packet_reduction_len
            } else if index == 0 {
                limits.first_packet_reduction_len
            } else {
                0
            };
        }
        if index != 0 {
            fu_limits.first_packet_reduction_len = 0;
        }
        if index != last_index {
            fu_limits.last_packet_reduction_len = 0;
        }

        // the NAL header is not sent; FU headers replace it
        let payload_left = fragment.len() - NAL_HEADER_SIZE;
        let payload_sizes = split_about_equally(payload_left, fu_limits);
        if payload_sizes.is_empty() {
            return false;
        }

        let mut offset = NAL_HEADER_SIZE;
        let last_fragment = payload_sizes.len() - 1;
        for (k, &size) in payload_sizes.iter().enumerate() {
            self.packets.push_back(PacketUnit {
                source_fragment: fragment.slice(offset..offset + size),
                first_fragment: k == 0,
                last_fragment: k == last_fragment,
                aggregated: false,
                header: fragment[0],
            });
            offset += size;
        }
        self.num_packets_left += payload_sizes.len();
        true
    }

    /// Aggregate consecutive small NAL units into one STAP-A packet,
    /// returning the index of the first unit not taken
    fn packetize_stap_a(
        &mut self,
        fragments: &[Bytes],
        mut index: usize,
        limits: PayloadSizeLimits,
    ) -> usize {
        let mut payload_size_left = if fragments.len() == 1 {
            limits.max_payload_len.saturating_sub(limits.single_packet_reduction_len)
        } else if index == 0 {
            limits.max_payload_len.saturating_sub(limits.first_packet_reduction_len)
        } else {
            limits.max_payload_len
        };
        let mut aggregated_fragments = 0;
        let mut fragment_headers_length = 0;
        self.num_packets_left += 1;

        while index < fragments.len() {
            let fragment = &fragments[index];
            // the last unit must leave room for the last-packet reduction,
            // since this aggregate might become the frame's final packet
            let tail_reduction = if fragments.len() > 1 && index == fragments.len() - 1 {
                limits.last_packet_reduction_len
            } else {
                0
            };
            let needed = fragment.len() + fragment_headers_length + tail_reduction;
            if payload_size_left < needed {
                break;
            }
            self.packets.push_back(PacketUnit {
                source_fragment: fragment.clone(),
                first_fragment: aggregated_fragments == 0,
                last_fragment: false,
                aggregated: true,
                header: fragment[0],
            });
            payload_size_left -= fragment.len() + fragment_headers_length;

            fragment_headers_length = LENGTH_FIELD_SIZE;
            // aggregating a second unit also costs the STAP-A header and
            // a length field for the first unit
            if aggregated_fragments == 0 {
                fragment_headers_length += NAL_HEADER_SIZE + LENGTH_FIELD_SIZE;
            }
            aggregated_fragments += 1;
            index += 1;
        }
        if let Some(last) = self.packets.back_mut() {
            last.last_fragment = true;
        }
        index
    }

    fn next_aggregate_packet(&mut self, rtp: &mut RtpPacket) {
        let mut buffer = BytesMut::new();
        while let Some(unit) = self.packets.pop_front() {
            if buffer.is_empty() {
                buffer.put_u8((unit.header & (NAL_F_BIT | NAL_NRI_MASK)) | NAL_TYPE_STAP_A);
            }
            buffer.put_u16(unit.source_fragment.len() as u16);
            buffer.extend_from_slice(&unit.source_fragment);
            if unit.last_fragment {
                break;
            }
        }
        rtp.payload = buffer.freeze();
    }

    fn next_fragment_packet(&mut self, rtp: &mut RtpPacket) {
        let unit = match self.packets.pop_front() {
            Some(unit) => unit,
            None => return,
        };
        let fu_indicator = (unit.header & (NAL_F_BIT | NAL_NRI_MASK)) | NAL_TYPE_FU_A;
        let mut fu_header = unit.header & NAL_TYPE_MASK;
        if unit.first_fragment {
            fu_header |= FU_S_BIT;
        }
        if unit.last_fragment {
            fu_header |= FU_E_BIT;
        }
        let mut buffer = BytesMut::with_capacity(FU_A_HEADER_SIZE + unit.source_fragment.len());
        buffer.put_u8(fu_indicator);
        buffer.put_u8(fu_header);
        buffer.extend_from_slice(&unit.source_fragment);
        rtp.payload = buffer.freeze();
    }
}

impl RtpPacketizer for H264Packetizer {
    fn num_packets(&self) -> usize {
        self.num_packets_left
    }

    fn next_packet(&mut self, packet: &mut RtpPacket) -> bool {
        let (single, aggregated) = match self.packets.front() {
            Some(unit) => (unit.first_fragment && unit.last_fragment, unit.aggregated),
            None => return false,
        };
        if single {
            // a lone unit needs no aggregation or fragmentation framing
            if let Some(unit) = self.packets.pop_front() {
                packet.payload = unit.source_fragment;
            }
        } else if aggregated {
            self.next_aggregate_packet(packet);
        } else {
            self.next_fragment_packet(packet);
        }
        packet.marker = self.packets.is_empty();
        self.num_packets_left = self.num_packets_left.saturating_sub(1);
        true
    }
}

fn split_fragments(payload: &Bytes, nalu_sizes: &[usize]) -> Option<Vec<Bytes>> {
    if payload.is_empty() {
        return Some(Vec::new());
    }
    if nalu_sizes.is_empty() {
        return Some(vec![payload.clone()]);
    }
    if nalu_sizes.iter().any(|&size| size == 0)
        || nalu_sizes.iter().sum::<usize>() != payload.len()
    {
        return None;
    }
    let mut fragments = Vec::with_capacity(nalu_sizes.len());
    let mut offset = 0;
    for &size in nalu_sizes {
        fragments.push(payload.slice(offset..offset + size));
        offset += size;
    }
    Some(fragments)
}

/// Why an RTP payload could not be depacketized
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DepacketizeError {
    #[error("empty RTP payload")]
    Empty,

    #[error("truncated {0} payload")]
    Truncated(&'static str),

    #[error("unsupported NAL type {0}")]
    UnsupportedNalType(u8),

    #[error("FU-A continuation without a start fragment")]
    DanglingFragment,
}

/// Reassembles NAL units from packet payloads
///
/// Stateful only across the fragments of one FU-A unit. Feed payloads in
/// sequence order; each call returns the units that completed.
#[derive(Debug, Default)]
pub struct H264Depacketizer {
    fragment: Option<BytesMut>,
}

impl H264Depacketizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// NAL units completed by this packet, in decode order
    pub fn handle_packet(&mut self, payload: &[u8]) -> Result<Vec<Bytes>, DepacketizeError> {
        let first = *payload.first().ok_or(DepacketizeError::Empty)?;
        match first & NAL_TYPE_MASK {
            NAL_TYPE_STAP_A => self.parse_stap_a(&payload[1..]),
            NAL_TYPE_FU_A => self.parse_fu_a(payload),
            1..=23 => {
                // a whole unit aborts any partial fragment (packet loss)
                self.fragment = None;
                Ok(vec![Bytes::copy_from_slice(payload)])
            }
            other => Err(DepacketizeError::UnsupportedNalType(other)),
        }
    }

    fn parse_stap_a(&mut self, mut data: &[u8]) -> Result<Vec<Bytes>, DepacketizeError> {
        self.fragment = None;
        let mut units = Vec::new();
        while !data.is_empty() {
            if data.len() < LENGTH_FIELD_SIZE {
                return Err(DepacketizeError::Truncated("STAP-A"));
            }
            let len = usize::from(u16::from_be_bytes([data[0], data[1]]));
            data = &data[LENGTH_FIELD_SIZE..];
            if data.len() < len {
                return Err(DepacketizeError::Truncated("STAP-A"));
            }
            units.push(Bytes::copy_from_slice(&data[..len]));
            data = &data[len..];
        }
        if units.is_empty() {
            return Err(DepacketizeError::Truncated("STAP-A"));
        }
        Ok(units)
    }

    fn parse_fu_a(&mut self, payload: &[u8]) -> Result<Vec<Bytes>, DepacketizeError> {
        if payload.len() <= FU_A_HEADER_SIZE {
            return Err(DepacketizeError::Truncated("FU-A"));
        }
        let indicator = payload[0];
        let fu_header = payload[1];
        let data = &payload[FU_A_HEADER_SIZE..];

        if fu_header & FU_S_BIT != 0 {
            // rebuild the NAL header the packetizer stripped
            let nal_header =
                (indicator & (NAL_F_BIT | NAL_NRI_MASK)) | (fu_header & NAL_TYPE_MASK);
            let mut unit = BytesMut::with_capacity(NAL_HEADER_SIZE + data.len());
            unit.put_u8(nal_header);
            unit.extend_from_slice(data);
            self.fragment = Some(unit);
        } else {
            match self.fragment.as_mut() {
                Some(unit) => unit.extend_from_slice(data),
                None => return Err(DepacketizeError::DanglingFragment),
            }
        }

        if fu_header & FU_E_BIT != 0 {
            match self.fragment.take() {
                Some(unit) => return Ok(vec![unit.freeze()]),
                None => return Err(DepacketizeError::DanglingFragment),
            }
        }
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max: usize) -> PayloadSizeLimits {
        PayloadSizeLimits {
            max_payload_len: max,
            ..PayloadSizeLimits::default()
        }
    }

    fn nalu(header: u8, len: usize) -> Vec<u8> {
        let mut unit = vec![header];
        unit.extend((1..len).map(|i| (i % 251) as u8));
        unit
    }

    fn frame(units: &[Vec<u8>]) -> (Bytes, Vec<usize>) {
        let mut payload = Vec::new();
        let mut sizes = Vec::new();
        for unit in units {
            payload.extend_from_slice(unit);
            sizes.push(unit.len());
        }
        (Bytes::from(payload), sizes)
    }

    fn collect_packets(packetizer: &mut dyn RtpPacketizer) -> Vec<RtpPacket> {
        let mut packets = Vec::new();
        let mut packet = RtpPacket::default();
        while packetizer.next_packet(&mut packet) {
            packets.push(packet.clone());
        }
        packets
    }

    fn depacketize_all(packets: &[RtpPacket]) -> Vec<Bytes> {
        let mut depacketizer = H264Depacketizer::new();
        let mut units = Vec::new();
        for packet in packets {
            units.extend(depacketizer.handle_packet(&packet.payload).unwrap());
        }
        units
    }

    #[test]
    fn test_lone_small_nalu_goes_out_whole() {
        let idr = nalu(0x65, 20);
        let (payload, sizes) = frame(&[idr.clone()]);
        let mut packetizer = H264Packetizer::new(payload, &sizes, limits(100));
        assert_eq!(packetizer.num_packets(), 1);

        let packets = collect_packets(&mut packetizer);
        assert_eq!(packets.len(), 1);
        assert_eq!(&packets[0].payload[..], &idr[..]);
        assert!(packets[0].marker);

        assert_eq!(depacketize_all(&packets), vec![Bytes::from(idr)]);
    }

    #[test]
    fn test_small_nalus_aggregate_into_stap_a() {
        let sps = nalu(0x67, 8);
        let pps = nalu(0x68, 4);
        let idr = nalu(0x65, 30);
        let (payload, sizes) = frame(&[sps.clone(), pps.clone(), idr.clone()]);
        let mut packetizer = H264Packetizer::new(payload, &sizes, limits(100));
        assert_eq!(packetizer.num_packets(), 1);

        let packets = collect_packets(&mut packetizer);
        assert_eq!(packets.len(), 1);
        let stap = &packets[0].payload;
        // STAP-A header carries the first unit's F/NRI bits
        assert_eq!(stap[0], (0x67 & 0xe0) | NAL_TYPE_STAP_A);
        assert_eq!(&stap[1..3], &[0, 8]);
        assert_eq!(&stap[3..11], &sps[..]);

        let units = depacketize_all(&packets);
        assert_eq!(units, vec![Bytes::from(sps), Bytes::from(pps), Bytes::from(idr)]);
    }

    #[test]
    fn test_oversized_nalu_fragments_into_fu_a() {
        let idr = nalu(0x65, 300);
        let (payload, sizes) = frame(&[idr.clone()]);
        let mut packetizer = H264Packetizer::new(payload, &sizes, limits(100));
        assert_eq!(packetizer.num_packets(), 4);

        let packets = collect_packets(&mut packetizer);
        assert_eq!(packets.len(), 4);
        for (i, packet) in packets.iter().enumerate() {
            assert!(packet.payload.len() <= 100);
            assert_eq!(packet.payload[0], (0x65 & 0xe0) | NAL_TYPE_FU_A);
            let fu_header = packet.payload[1];
            assert_eq!(fu_header & NAL_TYPE_MASK, 0x65 & NAL_TYPE_MASK);
            assert_eq!(fu_header & FU_S_BIT != 0, i == 0);
            assert_eq!(fu_header & FU_E_BIT != 0, i == packets.len() - 1);
            assert_eq!(packet.marker, i == packets.len() - 1);
        }

        assert_eq!(depacketize_all(&packets), vec![Bytes::from(idr)]);
    }

    #[test]
    fn test_mixed_frame_round_trips_byte_exact() {
        let units = [nalu(0x61, 10), nalu(0x62, 10), nalu(0x65, 120), nalu(0x41, 10)];
        let (payload, sizes) = frame(&units);
        let mut packetizer = H264Packetizer::new(payload.clone(), &sizes, limits(50));
        let expected = packetizer.num_packets();

        let packets = collect_packets(&mut packetizer);
        assert_eq!(packets.len(), expected);
        // STAP-A for the two small units, FU-A run, then a lone unit
        assert_eq!(expected, 5);
        for (i, packet) in packets.iter().enumerate() {
            assert_eq!(packet.marker, i == packets.len() - 1);
        }

        let reassembled = depacketize_all(&packets);
        let flat: Vec<u8> = reassembled.iter().flat_map(|u| u.iter().copied()).collect();
        assert_eq!(&flat[..], &payload[..]);
    }

    #[test]
    fn test_whole_payload_is_one_unit_when_sizes_are_absent() {
        let idr = nalu(0x65, 40);
        let mut packetizer = H264Packetizer::new(Bytes::from(idr.clone()), &[], limits(100));
        let packets = collect_packets(&mut packetizer);
        assert_eq!(packets.len(), 1);
        assert_eq!(&packets[0].payload[..], &idr[..]);
    }

    #[test]
    fn test_mismatched_sizes_produce_no_packets() {
        let (payload, _) = frame(&[nalu(0x65, 20)]);
        let mut packetizer = H264Packetizer::new(payload, &[5, 5], limits(100));
        assert_eq!(packetizer.num_packets(), 0);
        let mut packet = RtpPacket::default();
        assert!(!packetizer.next_packet(&mut packet));
    }

    #[test]
    fn test_infeasible_limits_produce_no_packets() {
        let (payload, sizes) = frame(&[nalu(0x65, 10)]);
        // 2 bytes minus the FU-A header leaves no room at all
        let mut packetizer = H264Packetizer::new(payload, &sizes, limits(2));
        assert_eq!(packetizer.num_packets(), 0);
        let mut packet = RtpPacket::default();
        assert!(!packetizer.next_packet(&mut packet));
    }

    #[test]
    fn test_depacketizer_rejects_malformed_payloads() {
        let mut depacketizer = H264Depacketizer::new();
        assert_eq!(
            depacketizer.handle_packet(&[]),
            Err(DepacketizeError::Empty)
        );
        // STAP-A with a length field pointing past the end
        assert_eq!(
            depacketizer.handle_packet(&[NAL_TYPE_STAP_A, 0, 200, 1, 2]),
            Err(DepacketizeError::Truncated("STAP-A"))
        );
        // FU-A continuation with no start seen
        assert_eq!(
            depacketizer.handle_packet(&[NAL_TYPE_FU_A, 0x05, 1, 2, 3]),
            Err(DepacketizeError::DanglingFragment)
        );
        assert_eq!(
            depacketizer.handle_packet(&[25, 0, 0]),
            Err(DepacketizeError::UnsupportedNalType(25))
        );
    }
}
