//! One redistribution cycle over a rank group arranged as a tree.
//!
//! Per cycle a rank moves through the states INITIAL →
//! AWAIT_CHILDREN_UP → COMPUTE_UP → SEND_UP (non-root) | REBALANCE
//! (root) → AWAIT_PARENT_DOWN (wanting non-root) → COMPUTE_DOWN →
//! SEND_DOWN → FINALIZE. Fan-in from children is pumped cooperatively;
//! all posted sends are drained before the cycle returns. A cycle is
//! preceded by a load sweep on its own tag pair that aggregates load
//! moments to the root and broadcasts the group totals back down, since
//! up-pass decisions need the group average before any work moves.

pub mod transfer;

use log::debug;

use crate::comm::peer::{pump_all, send_framed, FramedRecv, SendDrain};
use crate::comm::{tags, Communicator};
use crate::error::BalanceError;
use crate::index::{LocalId, Rank, RankGroup};
use crate::load::LoadType;
use crate::params::PartitioningParams;
use crate::rank_tree::RankTreeStrategy;
use crate::transit::TransitSet;
use crate::wire::{get_transit, put_transit, WireLoadMoments, WireReader, WireWriter};

/// A subtree under one rank wants more work only when it is at least one
/// cell under its ideal; smaller gaps are not worth a message.
const WANT_THRESHOLD: LoadType = 1.0;

/// Accounting for the subtree rooted at one rank, exchanged on the wire
/// during the up and down passes.
#[derive(Debug, Clone, Default)]
pub struct SubtreeData {
    /// Rank at the subtree root.
    pub subtree_rank: Rank,
    /// Number of processes in the subtree.
    pub num_procs: i32,
    /// Work retained in the subtree (excludes work being traded away).
    pub load_current: LoadType,
    /// Target work for the subtree.
    pub load_ideal: LoadType,
    /// Largest load the subtree is willing to keep.
    pub load_upperlimit: LoadType,
    /// Process count after pruning satisfied descendants.
    pub eff_num_procs: i32,
    pub eff_load_current: LoadType,
    pub eff_load_ideal: LoadType,
    pub eff_load_upperlimit: LoadType,
    /// Work traded with the parent (direction depends on the pass).
    pub work_traded: TransitSet,
    pub wants_work_from_parent: bool,
}

impl SubtreeData {
    /// Fresh single-rank subtree against a group average.
    pub fn for_rank(rank: Rank, local_load: LoadType, avg: LoadType, tol: f64) -> Self {
        let ideal = avg;
        let upper = avg * (1.0 + tol);
        Self {
            subtree_rank: rank,
            num_procs: 1,
            load_current: local_load,
            load_ideal: ideal,
            load_upperlimit: upper,
            eff_num_procs: 1,
            eff_load_current: local_load,
            eff_load_ideal: ideal,
            eff_load_upperlimit: upper,
            work_traded: TransitSet::new(),
            wants_work_from_parent: false,
        }
    }

    pub fn surplus(&self) -> LoadType {
        self.load_current - self.load_ideal
    }

    pub fn deficit(&self) -> LoadType {
        self.load_ideal - self.load_current
    }

    pub fn excess(&self) -> LoadType {
        self.load_current - self.load_upperlimit
    }

    pub fn margin(&self) -> LoadType {
        self.load_upperlimit - self.load_current
    }

    pub fn eff_surplus(&self) -> LoadType {
        self.eff_load_current - self.eff_load_ideal
    }

    pub fn eff_deficit(&self) -> LoadType {
        self.eff_load_ideal - self.eff_load_current
    }

    pub fn eff_excess(&self) -> LoadType {
        self.eff_load_current - self.eff_load_upperlimit
    }

    pub fn eff_margin(&self) -> LoadType {
        self.eff_load_upperlimit - self.eff_load_current
    }

    /// Fold a child subtree's totals into this one. Children that do not
    /// want work are pruned from the effective accounting.
    pub fn add_child(&mut self, child: &SubtreeData) {
        self.num_procs += child.num_procs;
        self.load_current += child.load_current;
        self.load_ideal += child.load_ideal;
        self.load_upperlimit += child.load_upperlimit;
        if child.wants_work_from_parent {
            self.eff_num_procs += child.eff_num_procs;
            self.eff_load_current += child.eff_load_current;
            self.eff_load_ideal += child.eff_load_ideal;
            self.eff_load_upperlimit += child.eff_load_upperlimit;
        }
    }

    /// Serialize in the fixed wire order.
    pub fn pack(&self, w: &mut WireWriter) {
        w.put_i32(self.subtree_rank as i32);
        w.put_i32(self.num_procs);
        w.put_f64(self.load_current);
        w.put_f64(self.load_ideal);
        w.put_f64(self.load_upperlimit);
        w.put_i32(self.eff_num_procs);
        w.put_f64(self.eff_load_current);
        w.put_f64(self.eff_load_ideal);
        w.put_f64(self.eff_load_upperlimit);
        w.put_u8(self.wants_work_from_parent as u8);
        w.put_u32(self.work_traded.len() as u32);
        for t in self.work_traded.iter() {
            put_transit(w, t);
        }
    }

    /// Inverse of [`SubtreeData::pack`].
    pub fn unpack(r: &mut WireReader, dim: usize) -> Result<SubtreeData, String> {
        let subtree_rank = r.get_i32()?;
        if subtree_rank < 0 {
            return Err(format!("negative subtree rank {subtree_rank}"));
        }
        let num_procs = r.get_i32()?;
        let load_current = r.get_f64()?;
        let load_ideal = r.get_f64()?;
        let load_upperlimit = r.get_f64()?;
        let eff_num_procs = r.get_i32()?;
        let eff_load_current = r.get_f64()?;
        let eff_load_ideal = r.get_f64()?;
        let eff_load_upperlimit = r.get_f64()?;
        let wants_work_from_parent = r.get_u8()? != 0;
        let work_count = r.get_u32()?;
        let mut work_traded = TransitSet::new();
        for _ in 0..work_count {
            let t = get_transit(r, dim)?;
            if !work_traded.insert(t) {
                return Err(format!("duplicate box id {:?} in message", t.id()));
            }
        }
        Ok(SubtreeData {
            subtree_rank: subtree_rank as Rank,
            num_procs,
            load_current,
            load_ideal,
            load_upperlimit,
            eff_num_procs,
            eff_load_current,
            eff_load_ideal,
            eff_load_upperlimit,
            work_traded,
            wants_work_from_parent,
        })
    }
}

/// Summary of one cycle at one rank.
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleStats {
    pub group_avg: LoadType,
    pub group_sum: LoadType,
    pub group_max_rank_load: LoadType,
    /// Load shipped to the parent.
    pub sent_up: LoadType,
    /// Load received from the parent.
    pub received_down: LoadType,
}

/// Drives one up/down traversal of the rank tree for one group.
pub struct Redistributor<'a, C: Communicator> {
    comm: &'a C,
    params: &'a PartitioningParams,
    tree: &'a dyn RankTreeStrategy,
    /// Flexible load tolerance (fraction above ideal a rank accepts).
    tol: f64,
}

impl<'a, C: Communicator> Redistributor<'a, C> {
    pub fn new(
        comm: &'a C,
        params: &'a PartitioningParams,
        tree: &'a dyn RankTreeStrategy,
        tol: f64,
    ) -> Self {
        Self {
            comm,
            params,
            tree,
            tol,
        }
    }

    /// Run one cycle. `unassigned` holds this rank's movable work before
    /// and after; `next_id` supplies ids for boxes created or received
    /// here. Ranks outside `group` return immediately with empty stats.
    pub fn run_cycle(
        &self,
        group: &RankGroup,
        unassigned: &mut TransitSet,
        next_id: &mut LocalId,
    ) -> Result<CycleStats, BalanceError> {
        let rank = self.comm.rank();
        let Some(pos) = group.index_of(rank) else {
            return Ok(CycleStats::default());
        };
        let n = group.len();
        let parent = self.tree.parent(pos, n).map(|p| group.rank_at(p));
        let children: Vec<Rank> = self
            .tree
            .children(pos, n)
            .into_iter()
            .map(|c| group.rank_at(c))
            .collect();

        let mut drain = SendDrain::new();
        let (group_sum, group_max) =
            self.load_sweep(parent, &children, unassigned.sum_load(), &mut drain)?;
        let avg = group_sum / n as LoadType;
        let mut stats = CycleStats {
            group_avg: avg,
            group_sum,
            group_max_rank_load: group_max,
            ..CycleStats::default()
        };

        // AWAIT_CHILDREN_UP: fan-in, pumped as messages complete.
        let pending: Vec<_> = children
            .iter()
            .map(|&c| FramedRecv::post(self.comm, c, tags::LOAD_UP))
            .collect();
        let arrived = pump_all(self.comm, pending)?;

        // COMPUTE_UP: fold children in, absorbing their shed work.
        // Arrival order is completion order; slot the data back into
        // child order so the down pass addresses the right subtrees.
        let mut my = SubtreeData::for_rank(rank, unassigned.sum_load(), avg, self.tol);
        let mut slots: Vec<Option<SubtreeData>> = children.iter().map(|_| None).collect();
        for (peer, payload) in arrived {
            let mut r = WireReader::new(&payload);
            let mut child = SubtreeData::unpack(&mut r, self.params.dim)
                .map_err(|detail| BalanceError::MalformedMessage { peer, detail })?;
            r.expect_end()
                .map_err(|detail| BalanceError::MalformedMessage { peer, detail })?;
            let shed = child.work_traded.sum_load();
            self.absorb_received(&mut child.work_traded, unassigned, next_id)?;
            my.load_current += shed;
            my.eff_load_current += shed;
            my.add_child(&child);
            let slot = children
                .iter()
                .position(|&c| c == peer)
                .ok_or_else(|| BalanceError::CommFailure {
                    peer,
                    detail: "up-message from a rank that is not a child".into(),
                })?;
            slots[slot] = Some(child);
        }
        let mut child_data = Vec::with_capacity(slots.len());
        for (slot, &c) in slots.into_iter().zip(children.iter()) {
            child_data.push(slot.ok_or_else(|| BalanceError::CommFailure {
                peer: c,
                detail: "missing up-message from child".into(),
            })?);
        }

        if let Some(parent_rank) = parent {
            // SEND_UP: shed surplus beyond the subtree upper limit.
            let mut up_bin = TransitSet::new();
            if my.surplus() > 0.0 {
                let ideal_send = my.surplus();
                let low_send = my.excess().max(0.0);
                let high_send = ideal_send + self.tol * avg;
                transfer::adjust_load(
                    self.params,
                    rank,
                    &mut up_bin,
                    unassigned,
                    next_id,
                    ideal_send,
                    low_send,
                    high_send,
                );
                my.load_current -= up_bin.sum_load();
                my.eff_load_current -= up_bin.sum_load();
            }
            my.wants_work_from_parent = my.eff_deficit() >= WANT_THRESHOLD;
            stats.sent_up = up_bin.sum_load();
            my.work_traded = up_bin;
            let mut w = WireWriter::new();
            my.pack(&mut w);
            send_framed(self.comm, parent_rank, tags::LOAD_UP, &w.finish(), &mut drain);
            my.work_traded.clear();

            // AWAIT_PARENT_DOWN: only requesters are answered.
            if my.wants_work_from_parent {
                let fr = FramedRecv::post(self.comm, parent_rank, tags::LOAD_DOWN);
                let payload = fr.wait(self.comm)?;
                let mut r = WireReader::new(&payload);
                let mut delivery = SubtreeData::unpack(&mut r, self.params.dim).map_err(
                    |detail| BalanceError::MalformedMessage {
                        peer: parent_rank,
                        detail,
                    },
                )?;
                stats.received_down = delivery.work_traded.sum_load();
                self.absorb_received(&mut delivery.work_traded, unassigned, next_id)?;
            }
        }

        // COMPUTE_DOWN / REBALANCE: feed requesting child subtrees in
        // proportion to their effective deficits.
        self.send_down(rank, avg, unassigned, next_id, &children, &child_data, &mut drain)?;

        // FINALIZE: confirm every send this rank posted has completed.
        drain.drain();
        debug!(
            "rank {rank}: cycle done, holding {} cells in {} boxes",
            unassigned.sum_load(),
            unassigned.len()
        );
        Ok(stats)
    }

    /// Reassign received records to this rank with fresh local ids.
    fn absorb_received(
        &self,
        received: &mut TransitSet,
        unassigned: &mut TransitSet,
        next_id: &mut LocalId,
    ) -> Result<(), BalanceError> {
        let rank = self.comm.rank();
        let records = received.drain();
        unassigned.insert_all(records.into_iter().map(|t| {
            let re = t.reassigned(t.box_, rank, *next_id);
            *next_id = next_id.next();
            re
        }))
    }

    /// Aggregate load moments to the root and broadcast the result back.
    /// Runs on the reduction tag pair ahead of the main sweep.
    fn load_sweep(
        &self,
        parent: Option<Rank>,
        children: &[Rank],
        local_load: LoadType,
        drain: &mut SendDrain<C>,
    ) -> Result<(LoadType, LoadType), BalanceError> {
        let m = reduce_load_moments(self.comm, parent, children, local_load, drain)?;
        Ok((m.sum(), m.max()))
    }

    /// Deliver work to each child subtree that asked for it. Every
    /// requester gets a message, possibly empty.
    #[allow(clippy::too_many_arguments)]
    fn send_down(
        &self,
        rank: Rank,
        avg: LoadType,
        unassigned: &mut TransitSet,
        next_id: &mut LocalId,
        children: &[Rank],
        child_data: &[SubtreeData],
        drain: &mut SendDrain<C>,
    ) -> Result<(), BalanceError> {
        let waiting_procs: i32 = child_data
            .iter()
            .filter(|c| c.wants_work_from_parent)
            .map(|c| c.eff_num_procs)
            .sum();
        if waiting_procs == 0 {
            return Ok(());
        }
        // Keep one rank's share locally; everything above it is surplus
        // to spread over waiting descendants.
        let mut available = (unassigned.sum_load() - avg).max(0.0);
        let per_desc = available / waiting_procs as LoadType;
        for (&child_rank, child) in children.iter().zip(child_data) {
            if !child.wants_work_from_parent {
                continue;
            }
            let give_ideal = child
                .eff_deficit()
                .min(per_desc * child.eff_num_procs as LoadType)
                .min(available)
                .max(0.0);
            let slack = self.tol * avg * child.eff_num_procs as LoadType;
            let low = (give_ideal - slack).max(0.0);
            let high = (give_ideal + slack).min(available.max(0.0));
            let mut down_bin = TransitSet::new();
            if give_ideal > 0.0 && high > 0.0 {
                transfer::adjust_load(
                    self.params,
                    rank,
                    &mut down_bin,
                    unassigned,
                    next_id,
                    give_ideal,
                    low.min(give_ideal),
                    high.max(give_ideal),
                );
            }
            available = (available - down_bin.sum_load()).max(0.0);
            debug!(
                "rank {rank}: sending {} cells down to {child_rank} (wanted {})",
                down_bin.sum_load(),
                child.eff_deficit()
            );
            let mut delivery = SubtreeData::for_rank(rank, 0.0, avg, self.tol);
            delivery.work_traded = down_bin;
            let mut w = WireWriter::new();
            delivery.pack(&mut w);
            send_framed(self.comm, child_rank, tags::LOAD_DOWN, &w.finish(), drain);
        }
        Ok(())
    }
}

/// Tree allreduce of per-rank load moments over parent/children edges on
/// the reduction tags: fold (sum, min, max) toward the root, broadcast
/// the group totals back down.
pub fn reduce_load_moments<C: Communicator>(
    comm: &C,
    parent: Option<Rank>,
    children: &[Rank],
    local_load: LoadType,
    drain: &mut SendDrain<C>,
) -> Result<WireLoadMoments, BalanceError> {
    let mut acc = WireLoadMoments::new(local_load, local_load, local_load);
    let pending: Vec<_> = children
        .iter()
        .map(|&c| FramedRecv::post(comm, c, tags::REDUCE_UP))
        .collect();
    for (peer, payload) in pump_all(comm, pending)? {
        let m = WireLoadMoments::decode(&payload)
            .map_err(|detail| BalanceError::MalformedMessage { peer, detail })?;
        acc = acc.merge(&m);
    }
    let total = if let Some(parent_rank) = parent {
        send_framed(comm, parent_rank, tags::REDUCE_UP, &acc.encode(), drain);
        let fr = FramedRecv::post(comm, parent_rank, tags::REDUCE_DOWN);
        let payload = fr.wait(comm)?;
        WireLoadMoments::decode(&payload).map_err(|detail| BalanceError::MalformedMessage {
            peer: parent_rank,
            detail,
        })?
    } else {
        acc
    };
    for &c in children {
        send_framed(comm, c, tags::REDUCE_DOWN, &total.encode(), drain);
    }
    Ok(total)
}

/// [`reduce_load_moments`] over a rank group's tree; `None` when this
/// rank is not a member.
pub fn group_load_moments<C: Communicator>(
    comm: &C,
    group: &RankGroup,
    tree: &dyn RankTreeStrategy,
    local_load: LoadType,
) -> Result<Option<WireLoadMoments>, BalanceError> {
    let Some(pos) = group.index_of(comm.rank()) else {
        return Ok(None);
    };
    let n = group.len();
    let parent = tree.parent(pos, n).map(|p| group.rank_at(p));
    let children: Vec<Rank> = tree
        .children(pos, n)
        .into_iter()
        .map(|c| group.rank_at(c))
        .collect();
    let mut drain = SendDrain::new();
    let m = reduce_load_moments(comm, parent, &children, local_load, &mut drain)?;
    drain.drain();
    Ok(Some(m))
}
