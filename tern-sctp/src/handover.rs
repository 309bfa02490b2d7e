//! Live socket handover
//!
//! A drained socket can export its transmission and reception counters as a
//! plain serializable value, be torn down, and later be reconstructed on
//! another instance (or another host) without the peer noticing. Readiness is
//! reported as a bit set of blocking conditions so callers can tell exactly
//! what still has to drain.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A condition that blocks handover
///
/// Each variant is a distinct bit so several can be reported at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum HandoverUnreadinessReason {
    WrongConnectionState = 1,
    SendQueueNotEmpty = 2,
    PendingStreamResetRequest = 4,
    DataTrackerTsnBlocksPending = 8,
    PendingStreamReset = 16,
    ReassemblyQueueDeliveredTsnGap = 32,
    StreamResetDeferred = 64,
    OrderedStreamHasUnassembledChunks = 128,
    UnorderedStreamHasUnassembledChunks = 256,
    RetransmissionQueueOutstandingData = 512,
    RetransmissionQueueFastRecovery = 1024,
    RetransmissionQueueNotEmpty = 2048,
}

impl HandoverUnreadinessReason {
    const ALL: [HandoverUnreadinessReason; 12] = [
        HandoverUnreadinessReason::WrongConnectionState,
        HandoverUnreadinessReason::SendQueueNotEmpty,
        HandoverUnreadinessReason::PendingStreamResetRequest,
        HandoverUnreadinessReason::DataTrackerTsnBlocksPending,
        HandoverUnreadinessReason::PendingStreamReset,
        HandoverUnreadinessReason::ReassemblyQueueDeliveredTsnGap,
        HandoverUnreadinessReason::StreamResetDeferred,
        HandoverUnreadinessReason::OrderedStreamHasUnassembledChunks,
        HandoverUnreadinessReason::UnorderedStreamHasUnassembledChunks,
        HandoverUnreadinessReason::RetransmissionQueueOutstandingData,
        HandoverUnreadinessReason::RetransmissionQueueFastRecovery,
        HandoverUnreadinessReason::RetransmissionQueueNotEmpty,
    ];

    pub fn name(self) -> &'static str {
        match self {
            HandoverUnreadinessReason::WrongConnectionState => "WrongConnectionState",
            HandoverUnreadinessReason::SendQueueNotEmpty => "SendQueueNotEmpty",
            HandoverUnreadinessReason::PendingStreamResetRequest => "PendingStreamResetRequest",
            HandoverUnreadinessReason::DataTrackerTsnBlocksPending => "DataTrackerTsnBlocksPending",
            HandoverUnreadinessReason::PendingStreamReset => "PendingStreamReset",
            HandoverUnreadinessReason::ReassemblyQueueDeliveredTsnGap => {
                "ReassemblyQueueDeliveredTsnGap"
            }
            HandoverUnreadinessReason::StreamResetDeferred => "StreamResetDeferred",
            HandoverUnreadinessReason::OrderedStreamHasUnassembledChunks => {
                "OrderedStreamHasUnassembledChunks"
            }
            HandoverUnreadinessReason::UnorderedStreamHasUnassembledChunks => {
                "UnorderedStreamHasUnassembledChunks"
            }
            HandoverUnreadinessReason::RetransmissionQueueOutstandingData => {
                "RetransmissionQueueOutstandingData"
            }
            HandoverUnreadinessReason::RetransmissionQueueFastRecovery => {
                "RetransmissionQueueFastRecovery"
            }
            HandoverUnreadinessReason::RetransmissionQueueNotEmpty => {
                "RetransmissionQueueNotEmpty"
            }
        }
    }
}

impl fmt::Display for HandoverUnreadinessReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Aggregated handover readiness: empty means ready
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HandoverReadinessStatus(u32);

impl HandoverReadinessStatus {
    pub fn ready() -> Self {
        HandoverReadinessStatus(0)
    }

    pub fn single(reason: HandoverUnreadinessReason) -> Self {
        HandoverReadinessStatus(reason as u32)
    }

    pub fn is_ready(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, reason: HandoverUnreadinessReason) -> bool {
        self.0 & reason as u32 != 0
    }

    /// Add a blocking reason, chainable
    #[must_use]
    pub fn add(self, reason: HandoverUnreadinessReason) -> Self {
        HandoverReadinessStatus(self.0 | reason as u32)
    }

    /// Add a reason only when `blocked` holds
    #[must_use]
    pub fn add_if(self, blocked: bool, reason: HandoverUnreadinessReason) -> Self {
        if blocked {
            self.add(reason)
        } else {
            self
        }
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl fmt::Display for HandoverReadinessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ready() {
            return f.write_str("ready");
        }
        let mut first = true;
        for reason in HandoverUnreadinessReason::ALL {
            if self.contains(reason) {
                if !first {
                    f.write_str(", ")?;
                }
                f.write_str(reason.name())?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Next sequence number for one ordered stream, on either side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OrderedStreamState {
    pub id: u16,
    pub next_ssn: u16,
}

/// Send- or receive-side record of an unordered stream's existence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UnorderedStreamState {
    pub id: u16,
}

/// Transmission-side counters
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TxHandoverState {
    pub next_tsn: u32,
    pub next_reset_req_sn: u32,
    pub cwnd: u32,
    pub rwnd: u32,
    pub ssthresh: u32,
    pub partial_bytes_acked: u32,
    pub last_cumulative_tsn_ack: u32,
    /// SSN counters for every ordered stream this side has sent on; without
    /// them a resumed socket would reuse sequence numbers the peer has
    /// already consumed
    pub ordered_streams: Vec<OrderedStreamState>,
}

/// Reception-side counters
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RxHandoverState {
    /// Whether any packet has been seen from the peer
    pub seen_packet: bool,
    pub last_cumulative_acked_tsn: u32,
    pub last_assembled_tsn: u32,
    pub ordered_streams: Vec<OrderedStreamState>,
    pub unordered_streams: Vec<UnorderedStreamState>,
}

/// Complete exported socket state
///
/// Captured by a drained socket, sufficient to resume the association
/// elsewhere. The representation is plain data so callers can serialize it
/// with whatever format they use for control-plane messages.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SocketHandoverState {
    pub tx: TxHandoverState,
    pub rx: RxHandoverState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_bits_are_distinct_powers_of_two() {
        let mut seen = 0u32;
        for reason in HandoverUnreadinessReason::ALL {
            let bit = reason as u32;
            assert_eq!(bit.count_ones(), 1);
            assert_eq!(seen & bit, 0);
            seen |= bit;
        }
        assert_eq!(seen, 0xFFF);
    }

    #[test]
    fn test_reason_bit_values() {
        assert_eq!(HandoverUnreadinessReason::WrongConnectionState as u32, 1);
        assert_eq!(HandoverUnreadinessReason::SendQueueNotEmpty as u32, 2);
        assert_eq!(
            HandoverUnreadinessReason::DataTrackerTsnBlocksPending as u32,
            8
        );
        assert_eq!(
            HandoverUnreadinessReason::RetransmissionQueueNotEmpty as u32,
            2048
        );
    }

    #[test]
    fn test_status_add_and_contains() {
        let status = HandoverReadinessStatus::ready()
            .add(HandoverUnreadinessReason::SendQueueNotEmpty)
            .add(HandoverUnreadinessReason::RetransmissionQueueFastRecovery);
        assert!(!status.is_ready());
        assert!(status.contains(HandoverUnreadinessReason::SendQueueNotEmpty));
        assert!(status.contains(HandoverUnreadinessReason::RetransmissionQueueFastRecovery));
        assert!(!status.contains(HandoverUnreadinessReason::WrongConnectionState));
        assert_eq!(status.bits(), 2 | 1024);
    }

    #[test]
    fn test_status_add_if() {
        let status = HandoverReadinessStatus::ready()
            .add_if(false, HandoverUnreadinessReason::SendQueueNotEmpty)
            .add_if(true, HandoverUnreadinessReason::WrongConnectionState);
        assert_eq!(
            status,
            HandoverReadinessStatus::single(HandoverUnreadinessReason::WrongConnectionState)
        );
    }

    #[test]
    fn test_status_display() {
        assert_eq!(HandoverReadinessStatus::ready().to_string(), "ready");
        let status = HandoverReadinessStatus::ready()
            .add(HandoverUnreadinessReason::WrongConnectionState)
            .add(HandoverUnreadinessReason::ReassemblyQueueDeliveredTsnGap);
        assert_eq!(
            status.to_string(),
            "WrongConnectionState, ReassemblyQueueDeliveredTsnGap"
        );
    }

    #[test]
    fn test_default_state_is_zeroed() {
        let state = SocketHandoverState::default();
        assert_eq!(state.tx.next_tsn, 0);
        assert_eq!(state.tx.cwnd, 0);
        assert!(!state.rx.seen_packet);
        assert!(state.rx.ordered_streams.is_empty());
    }

    #[test]
    fn test_state_serde_round_trip() {
        let state = SocketHandoverState {
            tx: TxHandoverState {
                next_tsn: 123_457,
                next_reset_req_sn: 0,
                cwnd: 4800,
                rwnd: 128 * 1024,
                ssthresh: 64 * 1024,
                partial_bytes_acked: 1200,
                last_cumulative_tsn_ack: 123_456,
                ordered_streams: vec![OrderedStreamState { id: 7, next_ssn: 3 }],
            },
            rx: RxHandoverState {
                seen_packet: true,
                last_cumulative_acked_tsn: 999,
                last_assembled_tsn: 999,
                ordered_streams: vec![OrderedStreamState { id: 1, next_ssn: 42 }],
                unordered_streams: vec![UnorderedStreamState { id: 2 }],
            },
        };
        let json = serde_json::to_string(&state).unwrap();
        let restored: SocketHandoverState = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, state);
    }
}
