//! RTP payload packetization and scalable-video signalling
//!
//! Splits encoded frames into RTP payloads under explicit size limits
//! (generic even split, or RFC 6184 H.264 with STAP-A aggregation and
//! FU-A fragmentation), with depacketizers that invert the split byte
//! for byte. The svc side models scalability structures: per-frame layer
//! configs, decode target indications and chain bookkeeping for the
//! dependency descriptor. Header extension sizing rounds out what a
//! sender needs to budget a packet.
//!
//! Everything is synchronous and allocation-light; payloads are shared
//! [`bytes::Bytes`] slices, never copies of the frame.

pub mod dependency;
pub mod extension_size;
pub mod h264;
pub mod packetizer;
pub mod svc;

pub use dependency::{
    CodecBufferUsage, DecodeTargetIndication, FrameDependencyStructure, FrameDependencyTemplate,
    GenericFrameInfo, LayerFrameConfig,
};
pub use extension_size::{
    rtp_header_extension_size, RtpExtensionSize, RtpExtensionType, RtpHeaderExtensionMap,
};
pub use h264::{DepacketizeError, H264Depacketizer, H264Packetizer};
pub use packetizer::{
    new_packetizer, split_about_equally, GenericPacketizer, PayloadSizeLimits, RtpPacket,
    RtpPacketizer, VideoCodecKind, VideoPayloadInfo,
};
pub use svc::{
    create_scalability_structure, ScalabilityStructureL1T1, ScalabilityStructureL2T1Key,
    ScalableVideoController, StreamLayersConfig,
};
