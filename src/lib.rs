//! # tree-balance
//!
//! tree-balance is a distributed load balancer for structured AMR box
//! hierarchies. Ranks are arranged in a conceptual tree; surplus work
//! flows toward the root and deficits are fed back down, over one or
//! more cycles whose rank groups grow exponentially so a single heavily
//! loaded rank never fans out to too many peers at once. Boxes that are
//! too large for a transfer are cut by a penalty-minimizing box breaker
//! under minimum-size, maximum-size, cut-factor, and bad-interval
//! constraints, and the balancer reports an exact mapping from the
//! unbalanced box set to the balanced one.
//!
//! ## Features
//! - Non-blocking tree protocol over a pluggable communicator (serial,
//!   in-process threads, MPI behind `mpi-support`)
//! - Geometry-aware box breaking with composite cut penalties
//! - Unbalanced→balanced mapping reconstruction with deterministic
//!   completion
//! - Per-call statistics and optional load/map summaries
//!
//! ## Usage
//! Every rank constructs a [`balancer::TreeLoadBalancer`] over its
//! communicator and calls
//! [`load_balance`](balancer::TreeLoadBalancer::load_balance)
//! collectively with its local [`index::BoxLevel`] and the geometric
//! constraints for the call.
//!
//! Uniform load only: each cell counts one unit of work. A workload
//! patch-data id is accepted for interface compatibility and ignored.

pub mod balancer;
pub mod breaker;
pub mod comm;
pub mod error;
pub mod index;
pub mod load;
pub mod mapping;
pub mod params;
pub mod rank_tree;
pub mod transit;
pub mod tree;
pub mod wire;

/// The most-used types in one import.
pub mod prelude {
    pub use crate::balancer::{
        BalanceConstraints, BalanceMaps, BalancerOptions, LoadReport, LoadSummary,
        TreeLoadBalancer,
    };
    pub use crate::breaker::{burst, BalanceBoxBreaker, BreakOff};
    #[cfg(feature = "mpi-support")]
    pub use crate::comm::MpiComm;
    pub use crate::comm::{Communicator, NoComm, PollWait, ThreadComm, Wait};
    pub use crate::error::BalanceError;
    pub use crate::index::{
        BlockId, BoxId, BoxLevel, IndexBox, IntVector, LocalId, MappingConnector, Rank,
        RankGroup,
    };
    pub use crate::params::PartitioningParams;
    pub use crate::rank_tree::{BalancedBinaryTree, RankTreeStrategy};
    pub use crate::transit::{BoxInTransit, TransitSet};
}
