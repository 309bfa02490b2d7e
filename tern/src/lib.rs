//! Tern - real-time transport building blocks
//!
//! Umbrella crate over the transport core: typed units, bandwidth and
//! RTO estimation, reliable messaging with live handover, and RTP
//! payload packetization with scalable-video signalling.

pub use tern_units as units;
pub use tern_bwe as bwe;
pub use tern_sctp as sctp;
pub use tern_rtp as rtp;

// Re-export commonly used types
pub use bytes::Bytes;
pub use sctp::{Message, Socket, SocketConfig};
pub use units::{DataRate, DataSize, TimeDelta, Timestamp};
