//! Reliable message transport over an unreliable datagram path
//!
//! Implements RFC 4960-style framing (chunks, parameters, error causes), a
//! synchronous socket state machine with cumulative acks, fast retransmit and
//! window-based congestion control, and live handover: a drained socket can
//! snapshot its counters and be rehydrated elsewhere without the peer
//! noticing.
//!
//! All state machines are single-writer and driven by explicit timestamps;
//! nothing here does I/O or owns a clock.

pub mod chunk;
pub mod error_cause;
pub mod handover;
pub mod parameter;
pub mod socket;
mod tlv;
pub mod types;

pub use chunk::{Chunk, ChunkParseError, DataChunk, GapAckBlock, SackChunk};
pub use error_cause::ErrorCause;
pub use handover::{HandoverReadinessStatus, HandoverUnreadinessReason, SocketHandoverState};
pub use socket::{Message, Socket, SocketConfig, SocketError, SocketState, SocketStats};
pub use types::{PayloadProtocolId, Ssn, StreamId, Tsn};
