//! The tree load balancer: plans cycles, forms per-cycle rank groups,
//! drives the redistributor, reconstructs the mapping, and enforces
//! post-balance size constraints.

use std::sync::Arc;

use hashbrown::HashMap;
use log::{debug, info, warn};

use crate::breaker::BalanceBoxBreaker;
use crate::comm::peer::{pump_all, send_framed, FramedRecv, SendDrain};
use crate::comm::{tags, Communicator};
use crate::error::BalanceError;
use crate::index::{
    BlockId, BoxLevel, IndexBox, IntVector, LocalId, MappingConnector, Rank, RankGroup,
};
use crate::load::LoadType;
use crate::mapping::{build_reverse_mapping, construct_semilocal_mapping};
use crate::params::PartitioningParams;
use crate::rank_tree::{BalancedBinaryTree, RankTreeStrategy};
use crate::transit::{BoxInTransit, TransitSet};
use crate::tree::{group_load_moments, Redistributor};
use crate::wire::{get_transit, put_transit, WireLoadMoments, WireReader, WireWriter};

/// Below this many participating ranks, a single cycle is used unless
/// the spread ratio forces more.
pub const MIN_NPROC_FOR_MULTICYCLE: usize = 65;

/// Balancer configuration.
#[derive(Debug, Clone)]
pub struct BalancerOptions {
    /// Fraction above its ideal load a rank may keep to avoid excessive
    /// cutting and movement. Not a hard limit.
    pub flexible_load_tolerance: f64,
    /// Most ranks one heavily loaded rank may feed per cycle; exceeding
    /// this spreads the fan-out over multiple cycles.
    pub max_cycle_spread_ratio: u64,
    /// Log a load summary after each balance call.
    pub report_load_balance: bool,
    /// Log a summary of the produced mapping.
    pub summarize_map: bool,
}

impl Default for BalancerOptions {
    fn default() -> Self {
        Self {
            flexible_load_tolerance: 0.05,
            max_cycle_spread_ratio: 1_000_000,
            report_load_balance: false,
            summarize_map: false,
        }
    }
}

/// Geometric constraints for one balance call.
#[derive(Debug, Clone)]
pub struct BalanceConstraints {
    pub min_size: IntVector,
    pub max_size: IntVector,
    pub cut_factor: IntVector,
    pub bad_interval: IntVector,
    pub block_domain_boxes: HashMap<BlockId, Vec<IndexBox>>,
}

impl BalanceConstraints {
    /// No effective restrictions beyond unit cells.
    pub fn unconstrained(dim: usize) -> Self {
        Self {
            min_size: IntVector::uniform(dim, 1),
            max_size: IntVector::uniform(dim, i32::MAX),
            cut_factor: IntVector::uniform(dim, 1),
            bad_interval: IntVector::uniform(dim, 0),
            block_domain_boxes: HashMap::new(),
        }
    }
}

/// Min/avg/max rank loads at one point in time.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadSummary {
    pub min: LoadType,
    pub avg: LoadType,
    pub max: LoadType,
}

impl LoadSummary {
    fn from_moments(m: &WireLoadMoments, nranks: usize) -> Self {
        Self {
            min: m.min(),
            avg: m.sum() / nranks.max(1) as LoadType,
            max: m.max(),
        }
    }
}

/// Statistics of the most recent balance call.
#[derive(Debug, Clone, Copy)]
pub struct LoadReport {
    pub before: LoadSummary,
    pub after: LoadSummary,
    pub cycles: usize,
}

/// Both directions of the produced mapping.
#[derive(Debug, Clone)]
pub struct BalanceMaps {
    pub unbalanced_to_balanced: MappingConnector,
    pub balanced_to_unbalanced: MappingConnector,
}

/// Tree-based load balancer.
///
/// Ranks are arranged in a conceptual tree and work moves along its
/// edges; one heavily loaded rank fans out over exponentially growing
/// rank groups across cycles. Uniform load only: every cell counts one.
pub struct TreeLoadBalancer<C: Communicator> {
    comm: Arc<C>,
    name: String,
    rank_tree: Box<dyn RankTreeStrategy>,
    opts: BalancerOptions,
    workload_data_id: Option<i32>,
    last_report: Option<LoadReport>,
}

impl<C: Communicator> TreeLoadBalancer<C> {
    pub fn new(comm: Arc<C>, name: &str, opts: BalancerOptions) -> Result<Self, BalanceError> {
        if name.is_empty() {
            return Err(BalanceError::EmptyName);
        }
        if !(0.0..=1.0).contains(&opts.flexible_load_tolerance) {
            return Err(BalanceError::InfeasibleConstraints(
                "flexible_load_tolerance must be in [0, 1]".into(),
            ));
        }
        if opts.max_cycle_spread_ratio <= 1 {
            return Err(BalanceError::InfeasibleConstraints(
                "max_cycle_spread_ratio must exceed 1".into(),
            ));
        }
        Ok(Self {
            comm,
            name: name.to_string(),
            rank_tree: Box::new(BalancedBinaryTree),
            opts,
            workload_data_id: None,
            last_report: None,
        })
    }

    /// Replace the default binary tree arrangement.
    pub fn with_rank_tree(mut self, tree: Box<dyn RankTreeStrategy>) -> Self {
        self.rank_tree = tree;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Accepts a patch-data id for non-uniform workload estimation. The
    /// id is stored but the uniform cell-count model is always used.
    pub fn set_workload_data_id(&mut self, data_id: i32) {
        self.workload_data_id = Some(data_id);
    }

    /// Whether balancing reads patch data. Always false: load is the
    /// cell count.
    pub fn depends_on_patch_data(&self) -> bool {
        false
    }

    /// Statistics of the most recent balance call on this rank.
    pub fn last_report(&self) -> Option<&LoadReport> {
        self.last_report.as_ref()
    }

    /// Balance `level` over `rank_group` (default: all ranks), replacing
    /// its boxes with the balanced set and returning the mapping between
    /// the old and new distributed box sets. Collective over the whole
    /// communicator.
    pub fn load_balance(
        &mut self,
        level: &mut BoxLevel,
        constraints: &BalanceConstraints,
        rank_group: Option<&RankGroup>,
    ) -> Result<BalanceMaps, BalanceError> {
        let rank = self.comm.rank();
        let size = self.comm.size();
        let dim = level.dim();
        if !(1..=crate::index::MAX_DIM).contains(&dim) {
            return Err(BalanceError::UnsupportedDimension(dim));
        }
        if level.rank() != rank {
            return Err(BalanceError::RankMismatch {
                level_rank: level.rank(),
                comm_rank: rank,
            });
        }
        // Check before the barrier: no peer can have sent anything for
        // this call until its own barrier passes, so anything pending
        // now is stray traffic from outside the protocol.
        self.assert_no_stray_messages()?;
        self.comm.barrier();
        let group = match rank_group {
            Some(g) => {
                g.validate(size)?;
                g.clone()
            }
            None => RankGroup::all(size),
        };
        let mut params = PartitioningParams::new(
            dim,
            constraints.min_size,
            constraints.max_size,
            constraints.cut_factor,
            constraints.bad_interval,
        )?;
        params.block_domain_boxes = constraints.block_domain_boxes.clone();

        let mut unassigned = TransitSet::new();
        unassigned.insert_all(level.boxes().iter().map(|b| BoxInTransit::from_origin(*b)))?;
        let mut next_id = level
            .max_local_id()
            .map(|l| l.next())
            .unwrap_or(LocalId::new(0));

        let whole = RankGroup::all(size);
        let local = unassigned.sum_load();
        let before_m = group_load_moments(&*self.comm, &whole, &*self.rank_tree, local)?
            .unwrap_or_else(|| WireLoadMoments::new(local, local, local));
        let before = LoadSummary::from_moments(&before_m, size);

        self.prebalance(&group, dim, &mut unassigned, &mut next_id)?;

        let group_m = group_load_moments(
            &*self.comm,
            &group,
            &*self.rank_tree,
            unassigned.sum_load(),
        )?;
        let plan = match &group_m {
            Some(m) => {
                let avg = m.sum() / group.len() as LoadType;
                params.global_avg_load = avg;
                plan_cycles(
                    group.len(),
                    m.max(),
                    avg,
                    self.opts.max_cycle_spread_ratio,
                )
            }
            None => Vec::new(),
        };
        debug!(
            "{}: rank {rank} planning {} cycle(s) over {} ranks",
            self.name,
            plan.len(),
            group.len()
        );

        let redistributor = Redistributor::new(
            &*self.comm,
            &params,
            &*self.rank_tree,
            self.opts.flexible_load_tolerance,
        );
        for &g in &plan {
            if let Some(sub) = cycle_subgroup(&group, rank, g) {
                redistributor.run_cycle(&sub, &mut unassigned, &mut next_id)?;
            }
        }

        self.constrain_max_box_sizes(&params, &mut unassigned, &mut next_id);

        level.set_boxes(unassigned.iter().map(|t| t.box_).collect());
        let forward =
            construct_semilocal_mapping(&*self.comm, &*self.rank_tree, dim, &unassigned)?;
        let reverse = build_reverse_mapping(&unassigned);

        let local = unassigned.sum_load();
        let after_m = group_load_moments(&*self.comm, &whole, &*self.rank_tree, local)?
            .unwrap_or_else(|| WireLoadMoments::new(local, local, local));
        let after = LoadSummary::from_moments(&after_m, size);

        let report = LoadReport {
            before,
            after,
            cycles: plan.len(),
        };
        if self.opts.report_load_balance {
            info!(
                "{}: balanced {} ranks in {} cycle(s): max/avg {:.3} -> {:.3} (min {} avg {:.1} max {})",
                self.name,
                group.len(),
                report.cycles,
                ratio_of(before.max, before.avg),
                ratio_of(after.max, after.avg),
                after.min,
                after.avg,
                after.max
            );
        }
        if after.avg > 0.0
            && after.max > after.avg * (1.0 + self.opts.flexible_load_tolerance) + 0.5
        {
            warn!(
                "{}: residual imbalance: max load {} vs avg {:.1} (tolerance {})",
                self.name, after.max, after.avg, self.opts.flexible_load_tolerance
            );
        }
        if self.opts.summarize_map {
            self.log_map_summary(&forward);
        }
        self.last_report = Some(report);
        // Barrier before the exit check: every rank has consumed all of
        // its protocol messages by the time it arrives here.
        self.comm.barrier();
        self.assert_no_stray_messages()?;
        Ok(BalanceMaps {
            unbalanced_to_balanced: forward,
            balanced_to_unbalanced: reverse,
        })
    }

    /// Move every box held outside the rank group onto a member, so the
    /// cycles only ever trade work inside the group. Outsider `r` ships
    /// to member `r mod |group|`; members receive from the outsiders
    /// that map to them.
    fn prebalance(
        &self,
        group: &RankGroup,
        dim: usize,
        unassigned: &mut TransitSet,
        next_id: &mut LocalId,
    ) -> Result<(), BalanceError> {
        let rank = self.comm.rank();
        let size = self.comm.size();
        if group.len() == size {
            return Ok(());
        }
        let mut drain = SendDrain::new();
        if group.contains(rank) {
            let sources: Vec<Rank> = (0..size)
                .filter(|&r| !group.contains(r) && group.rank_at(r % group.len()) == rank)
                .collect();
            let pending: Vec<_> = sources
                .iter()
                .map(|&s| FramedRecv::post(&*self.comm, s, tags::PREBALANCE_UP))
                .collect();
            for (peer, payload) in pump_all(&*self.comm, pending)? {
                let mut r = WireReader::new(&payload);
                let mut inner = || -> Result<Vec<BoxInTransit>, String> {
                    let count = r.get_u32()?;
                    let mut out = Vec::with_capacity(count as usize);
                    for _ in 0..count {
                        out.push(get_transit(&mut r, dim)?);
                    }
                    r.expect_end()?;
                    Ok(out)
                };
                let records =
                    inner().map_err(|detail| BalanceError::MalformedMessage { peer, detail })?;
                unassigned.insert_all(records.into_iter().map(|t| {
                    let re = t.reassigned(t.box_, rank, *next_id);
                    *next_id = next_id.next();
                    re
                }))?;
            }
        } else {
            let dest = group.rank_at(rank % group.len());
            let records = unassigned.drain();
            let mut w = WireWriter::new();
            w.put_u32(records.len() as u32);
            for t in &records {
                put_transit(&mut w, t);
            }
            send_framed(&*self.comm, dest, tags::PREBALANCE_UP, &w.finish(), &mut drain);
            debug!(
                "{}: rank {rank} prebalanced {} boxes to {dest}",
                self.name,
                records.len()
            );
        }
        drain.drain();
        Ok(())
    }

    /// Split any surviving box wider than `max_size`, keeping the
    /// mapping exact by reassigning fragments fresh ids.
    fn constrain_max_box_sizes(
        &self,
        params: &PartitioningParams,
        unassigned: &mut TransitSet,
        next_id: &mut LocalId,
    ) {
        let rank = self.comm.rank();
        let breaker = BalanceBoxBreaker::new(params);
        let held = unassigned.drain();
        for t in held {
            let pieces = breaker.chop_to_max_size(&t.box_);
            if pieces.len() == 1 {
                unassigned.insert(t);
            } else {
                for piece in pieces {
                    let re = t.reassigned(piece, rank, *next_id);
                    *next_id = next_id.next();
                    unassigned.insert(re);
                }
            }
        }
    }

    fn log_map_summary(&self, forward: &MappingConnector) {
        let mut identity = 0usize;
        let mut moved = 0usize;
        let mut split = 0usize;
        let mut fragments = 0usize;
        for (_, rel) in forward.iter() {
            fragments += rel.dsts.len();
            match rel.dsts.as_slice() {
                [(r, d)] if *r == rel.src.owner() && d.id() == rel.src.id() => identity += 1,
                [_] => moved += 1,
                _ => split += 1,
            }
        }
        info!(
            "{}: map summary: {} kept, {} moved, {} split, {} fragments total",
            self.name, identity, moved, split, fragments
        );
    }

    /// Entry/exit sanity check: the protocol must leave no undelivered
    /// traffic behind on backends that can observe it.
    fn assert_no_stray_messages(&self) -> Result<(), BalanceError> {
        match self.comm.pending_message_count() {
            Some(n) if n > 0 => Err(BalanceError::CommFailure {
                peer: self.comm.rank(),
                detail: format!("{n} stray message(s) pending on the balancer communicator"),
            }),
            _ => Ok(()),
        }
    }
}

fn ratio_of(max: LoadType, avg: LoadType) -> f64 {
    if avg > 0.0 {
        max / avg
    } else {
        1.0
    }
}

/// Group sizes for each cycle. Heavy single-rank loads fan out over
/// groups growing by the spread ratio; otherwise large runs warm up with
/// a √n group before the full-group cycle.
fn plan_cycles(nprocs: usize, max_rank_load: LoadType, avg: LoadType, ratio: u64) -> Vec<usize> {
    if nprocs <= 1 {
        return vec![1];
    }
    let spread_bound = ratio as LoadType;
    if avg > 0.0 && max_rank_load / avg > spread_bound {
        let mut sizes = Vec::new();
        let mut g = (ratio as usize).max(2);
        loop {
            sizes.push(g.min(nprocs));
            if g >= nprocs {
                break;
            }
            g = g.saturating_mul(ratio as usize);
        }
        sizes
    } else if nprocs >= MIN_NPROC_FOR_MULTICYCLE {
        let warmup = (nprocs as f64).sqrt().ceil() as usize;
        vec![warmup.max(2), nprocs]
    } else {
        vec![nprocs]
    }
}

/// The contiguous chunk of the active group this rank balances with in a
/// cycle of group size `g`.
fn cycle_subgroup(group: &RankGroup, rank: Rank, g: usize) -> Option<RankGroup> {
    let idx = group.index_of(rank)?;
    let start = (idx / g) * g;
    let end = (start + g).min(group.len());
    RankGroup::new(group.ranks()[start..end].to_vec()).ok()
}
