//! Per-call partitioning context.
//!
//! Everything the breaker and the transfer strategies need to know about
//! geometry constraints and penalty weighting for one balance call,
//! threaded explicitly instead of living as balancer fields.

use crate::error::BalanceError;
use crate::index::{BlockId, IndexBox, IntVector};
use crate::load::LoadType;
use hashbrown::HashMap;

/// Geometric constraints and cut-penalty weights for one balance call.
#[derive(Debug, Clone)]
pub struct PartitioningParams {
    pub dim: usize,
    /// Smallest admissible box width per axis.
    pub min_size: IntVector,
    /// Largest admissible box width per axis.
    pub max_size: IntVector,
    /// Cut planes must fall on multiples of this per axis.
    pub cut_factor: IntVector,
    /// Cuts may not fall strictly within this many cells of a same-block
    /// domain box face unless they coincide with it.
    pub bad_interval: IntVector,
    /// Domain boxes per mesh block; empty map disables the bad-interval
    /// rule.
    pub block_domain_boxes: HashMap<BlockId, Vec<IndexBox>>,
    /// Average load per rank over the active group, for advisory floors.
    pub global_avg_load: LoadType,
    /// Advisory floor: fragments below this fraction of the average load
    /// are avoided when a larger cut is available.
    pub min_load_fraction_per_box: f64,

    pub balance_penalty_wt: f64,
    pub surface_penalty_wt: f64,
    pub slender_penalty_wt: f64,
    /// Aspect ratio above which slenderness starts to cost.
    pub slender_penalty_threshold: f64,
    /// Multiplier (>= 1) on cut penalties, biasing toward not cutting.
    pub precut_penalty_wt: f64,
}

impl PartitioningParams {
    pub fn new(
        dim: usize,
        min_size: IntVector,
        max_size: IntVector,
        cut_factor: IntVector,
        bad_interval: IntVector,
    ) -> Result<Self, BalanceError> {
        for v in [&min_size, &max_size, &cut_factor, &bad_interval] {
            if v.dim() != dim {
                return Err(BalanceError::DimensionMismatch {
                    expected: dim,
                    got: v.dim(),
                });
            }
        }
        for d in 0..dim {
            if min_size[d] < 1 || cut_factor[d] < 1 {
                return Err(BalanceError::InfeasibleConstraints(format!(
                    "min_size and cut_factor must be positive (axis {d})"
                )));
            }
            if max_size[d] < min_size[d] {
                return Err(BalanceError::InfeasibleConstraints(format!(
                    "max_size {} below min_size {} on axis {d}",
                    max_size[d], min_size[d]
                )));
            }
        }
        Ok(Self {
            dim,
            min_size,
            max_size,
            cut_factor,
            bad_interval,
            block_domain_boxes: HashMap::new(),
            global_avg_load: 0.0,
            min_load_fraction_per_box: 0.0,
            balance_penalty_wt: 1.0,
            surface_penalty_wt: 1.0,
            slender_penalty_wt: 1.0,
            slender_penalty_threshold: 4.0,
            precut_penalty_wt: 1.0,
        })
    }

    /// Domain boxes of one block, if known.
    pub fn domain_boxes(&self, block: BlockId) -> &[IndexBox] {
        self.block_domain_boxes
            .get(&block)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Advisory smallest fragment load worth producing.
    pub fn min_fragment_load(&self) -> LoadType {
        self.min_load_fraction_per_box * self.global_avg_load
    }
}
