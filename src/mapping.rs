//! Reconstructing the unbalanced→balanced mapping after work has moved.
//!
//! Every rank ends the cycles holding some set of boxes; each box knows
//! the origin box it descends from. Relationships for own-origin work are
//! recorded locally. Foreign-origin records are routed to the origin's
//! owner over the full rank tree on the edge tag pair: an up sweep moves
//! records toward the root until their destination lies inside the
//! current subtree, then a down sweep delivers them. One framed message
//! crosses each tree edge per direction, so completion is deterministic.

use hashbrown::HashSet;
use log::debug;

use crate::comm::peer::{pump_all, send_framed, FramedRecv, SendDrain};
use crate::comm::{tags, Communicator};
use crate::error::BalanceError;
use crate::index::{IndexBox, MappingConnector, Rank};
use crate::rank_tree::{subtree_positions, RankTreeStrategy};
use crate::transit::TransitSet;
use crate::wire::{get_box, put_box, WireReader, WireWriter};

/// A fragment's final placement, traveling back to the origin's owner.
#[derive(Debug, Clone, Copy)]
struct PlacementRecord {
    origin: IndexBox,
    holder: Rank,
    fragment: IndexBox,
}

impl PlacementRecord {
    fn dest(&self) -> Rank {
        self.origin.owner()
    }
}

fn encode_records(records: &[PlacementRecord]) -> Vec<u8> {
    let mut w = WireWriter::new();
    w.put_u32(records.len() as u32);
    for r in records {
        put_box(&mut w, &r.origin);
        w.put_i32(r.holder as i32);
        put_box(&mut w, &r.fragment);
    }
    w.finish()
}

fn decode_records(payload: &[u8], dim: usize, peer: usize) -> Result<Vec<PlacementRecord>, BalanceError> {
    let mut r = WireReader::new(payload);
    let mut inner = || -> Result<Vec<PlacementRecord>, String> {
        let count = r.get_u32()?;
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let origin = get_box(&mut r, dim)?;
            let holder = r.get_i32()?;
            if holder < 0 {
                return Err(format!("negative holder rank {holder}"));
            }
            let fragment = get_box(&mut r, dim)?;
            out.push(PlacementRecord {
                origin,
                holder: holder as Rank,
                fragment,
            });
        }
        r.expect_end()?;
        Ok(out)
    };
    inner().map_err(|detail| BalanceError::MalformedMessage { peer, detail })
}

/// Build this rank's unbalanced→balanced connector from its final
/// holdings, exchanging placement records with all other ranks over the
/// rank tree. Collective over the whole communicator.
pub fn construct_semilocal_mapping<C: Communicator>(
    comm: &C,
    tree: &dyn RankTreeStrategy,
    dim: usize,
    holdings: &TransitSet,
) -> Result<MappingConnector, BalanceError> {
    let rank = comm.rank();
    let n = comm.size();
    let mut connector = MappingConnector::new();
    let mut outgoing = Vec::new();
    for t in holdings.iter() {
        if t.origin.owner() == rank {
            connector.insert(t.origin, rank, t.box_);
        } else {
            outgoing.push(PlacementRecord {
                origin: t.origin,
                holder: rank,
                fragment: t.box_,
            });
        }
    }
    if n == 1 {
        return Ok(connector);
    }

    let parent = tree.parent(rank, n);
    let children = tree.children(rank, n);
    let child_subtrees: Vec<HashSet<Rank>> = children
        .iter()
        .map(|&c| subtree_positions(tree, c, n).into_iter().collect())
        .collect();
    let mut down_queues: Vec<Vec<PlacementRecord>> = vec![Vec::new(); children.len()];
    let mut up_queue = Vec::new();

    let mut route = |rec: PlacementRecord,
                     connector: &mut MappingConnector,
                     down_queues: &mut [Vec<PlacementRecord>],
                     up_queue: &mut Vec<PlacementRecord>| {
        if rec.dest() == rank {
            connector.insert(rec.origin, rec.holder, rec.fragment);
        } else if let Some(i) = child_subtrees.iter().position(|s| s.contains(&rec.dest())) {
            down_queues[i].push(rec);
        } else {
            up_queue.push(rec);
        }
    };

    for rec in outgoing {
        route(rec, &mut connector, &mut down_queues, &mut up_queue);
    }

    let mut drain = SendDrain::new();

    // Up sweep: children's records climb until their destination falls
    // inside this subtree.
    let pending: Vec<_> = children
        .iter()
        .map(|&c| FramedRecv::post(comm, c, tags::EDGE_UP))
        .collect();
    for (peer, payload) in pump_all(comm, pending)? {
        for rec in decode_records(&payload, dim, peer)? {
            route(rec, &mut connector, &mut down_queues, &mut up_queue);
        }
    }
    if let Some(p) = parent {
        send_framed(comm, p, tags::EDGE_UP, &encode_records(&up_queue), &mut drain);
        up_queue.clear();

        // Down sweep: whatever the ancestors routed toward us.
        let fr = FramedRecv::post(comm, p, tags::EDGE_DOWN);
        let payload = fr.wait(comm)?;
        for rec in decode_records(&payload, dim, p)? {
            route(rec, &mut connector, &mut down_queues, &mut up_queue);
        }
        debug_assert!(up_queue.is_empty(), "down-sweep record routed upward");
    }
    for (i, &c) in children.iter().enumerate() {
        send_framed(
            comm,
            c,
            tags::EDGE_DOWN,
            &encode_records(&down_queues[i]),
            &mut drain,
        );
    }
    drain.drain();
    debug!(
        "rank {rank}: mapping has {} sources, {} edges",
        connector.num_sources(),
        connector.num_edges()
    );
    Ok(connector)
}

/// The balanced→unbalanced direction, known locally: each held box points
/// back at its origin.
pub fn build_reverse_mapping(holdings: &TransitSet) -> MappingConnector {
    let mut rev = MappingConnector::new();
    for t in holdings.iter() {
        rev.insert(t.box_, t.origin.owner(), t.origin);
    }
    rev
}
