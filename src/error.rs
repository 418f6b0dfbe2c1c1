//! BalanceError: unified error type for tree-balance public APIs.
//!
//! Precondition violations and transport faults surface as errors;
//! constraint infeasibility inside the box breaker is not an error
//! (the caller falls back to another transfer strategy).

use thiserror::Error;

use crate::index::BoxId;

/// Unified error type for tree-balance operations.
#[derive(Debug, Error)]
pub enum BalanceError {
    /// Object name was empty at construction.
    #[error("balancer name must not be empty")]
    EmptyName,
    /// Two collaborating objects disagree on spatial dimension.
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    /// Dimension outside the supported 1..=3 range.
    #[error("unsupported dimension {0} (supported: 1..=3)")]
    UnsupportedDimension(usize),
    /// A rank group referenced a rank outside the communicator.
    #[error("rank group contains rank {rank} but communicator has {size} ranks")]
    RankOutOfRange { rank: usize, size: usize },
    /// Rank group was empty.
    #[error("rank group must not be empty")]
    EmptyRankGroup,
    /// A box level built for one rank was handed to another.
    #[error("box level belongs to rank {level_rank}, balancer runs on rank {comm_rank}")]
    RankMismatch { level_rank: usize, comm_rank: usize },
    /// The same box id was inserted twice into a transit set.
    /// Indicates a logic bug, not recoverable.
    #[error("duplicate box id {0:?} in transit set")]
    DuplicateTransitBox(BoxId),
    /// A peer's message could not be decoded.
    #[error("malformed message from rank {peer}: {detail}")]
    MalformedMessage { peer: usize, detail: String },
    /// Transport-level failure.
    #[error("communication failure with rank {peer}: {detail}")]
    CommFailure { peer: usize, detail: String },
    /// A constraint set admits no valid box at all (e.g. min_size
    /// exceeds max_size on some axis).
    #[error("infeasible partitioning constraints: {0}")]
    InfeasibleConstraints(String),
}
