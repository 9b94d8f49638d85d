//! Common data types used across the reassembly subsystem.

use bytes::Bytes;
use std::fmt;

/// What a flow's reader receives, in stream order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowEvent {
    /// Contiguous bytes following everything released before.
    Data(Bytes),
    /// `missing` bytes were never captured; the next `Data` starts after the hole.
    /// Only emitted while flushing a flow that is being retired.
    Gap { missing: u64 },
}

/// Lifecycle of one flow in the assembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    /// Created on the first segment of an unseen flow key.
    Active,
    /// FIN or RST seen, waiting for outstanding bytes.
    Closing,
    /// Removed from the flow table; the key may be reused by a new connection.
    Retired,
}

/// Why a flow left the flow table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireReason {
    /// FIN/RST seen and every byte released.
    Closed,
    /// No segment within the retention period.
    Idle,
    /// Evicted to make room for a new flow.
    Capacity,
    /// Process shutting down.
    Shutdown,
}

impl fmt::Display for RetireReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetireReason::Closed => write!(f, "closed"),
            RetireReason::Idle => write!(f, "idle"),
            RetireReason::Capacity => write!(f, "capacity"),
            RetireReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Counters kept by the assembler, logged on every sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AssemblerStats {
    pub flows_created: u64,
    pub flows_closed: u64,
    pub flows_evicted: u64,
    /// Flows whose reader stopped or fell behind; their bytes are discarded from then on.
    pub flows_detached: u64,
    pub duplicate_segments: u64,
    /// Segments rejected because they precede the stream start or overflow the pending limit.
    pub dropped_segments: u64,
    pub released_bytes: u64,
}
