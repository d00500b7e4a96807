// Copyright (c) Andrea Righi <andrea.righi@linux.dev>

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use thiserror::Error;

use crate::topology::CacheLevel;

/// A record received from (or sent to) the BPF component is shorter than its C layout.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed {record}: expected at least {expected} bytes, got {actual}")]
pub struct LayoutError {
    pub record: &'static str,
    pub expected: usize,
    pub actual: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The outbound queue stayed full for the whole send timeout.
    #[error("dispatch queue is full")]
    Full,
    /// The other end of the channel is gone (ring buffer torn down).
    #[error("ring buffer disconnected")]
    Disconnected,
}

#[derive(Debug, Error)]
pub enum ControlBlockError {
    #[error("shared control block is not mapped")]
    Unavailable,
    #[error("shared control block access failed: {0}")]
    Access(String),
    #[error(transparent)]
    Layout(#[from] LayoutError),
}

#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("CPU selection program not found")]
    Unavailable,
    #[error("CPU selection failed: {0}")]
    Failed(String),
}

#[derive(Debug, Error)]
#[error("failed to register {level} sibling {sibling} of CPU {cpu}: {reason}")]
pub struct TopologyRegistrationError {
    pub level: CacheLevel,
    pub cpu: usize,
    pub sibling: usize,
    pub reason: String,
}

/// Errors surfaced by the control loop.
#[derive(Debug, Error)]
pub enum SchedError {
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    ControlBlock(#[from] ControlBlockError),
    #[error(transparent)]
    Placement(#[from] PlacementError),
    #[error(transparent)]
    Topology(#[from] TopologyRegistrationError),
}
