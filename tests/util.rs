#![allow(dead_code)]
use std::sync::Arc;

use tree_balance::prelude::*;

/// Spawn one thread per rank over a shared universe, run `f` on each,
/// and return the results ordered by rank.
pub fn run_ranks<R: Send + 'static>(
    n: usize,
    f: impl Fn(ThreadComm) -> R + Send + Sync + 'static,
) -> Vec<R> {
    let comms = ThreadComm::universe(n);
    let f = Arc::new(f);
    let handles: Vec<_> = comms
        .into_iter()
        .map(|c| {
            let f = Arc::clone(&f);
            std::thread::spawn(move || (c.rank(), f(c)))
        })
        .collect();
    let mut out: Vec<(usize, R)> = handles
        .into_iter()
        .map(|h| h.join().expect("rank thread panicked"))
        .collect();
    out.sort_by_key(|(r, _)| *r);
    out.into_iter().map(|(_, v)| v).collect()
}

pub fn bx2(owner: Rank, local: i64, lo: [i32; 2], hi: [i32; 2]) -> IndexBox {
    IndexBox::new(
        IntVector::from_slice(&lo),
        IntVector::from_slice(&hi),
        BlockId(0),
        BoxId::new(owner, LocalId::new(local)),
    )
}

pub fn level_with(rank: Rank, boxes: Vec<IndexBox>) -> BoxLevel {
    let mut level = BoxLevel::new(2, rank);
    for b in boxes {
        level.add_box(b).unwrap();
    }
    level
}

/// One rank's outcome from a balance run.
pub struct RankOutcome {
    pub level: BoxLevel,
    pub maps: BalanceMaps,
    pub report: Option<LoadReport>,
}

/// Run a full balance on `n` ranks, rank `r` starting with
/// `initial(r)`. Panics on any balancer error.
pub fn balance_on_ranks(
    n: usize,
    opts: BalancerOptions,
    constraints: BalanceConstraints,
    initial: impl Fn(Rank) -> Vec<IndexBox> + Send + Sync + 'static,
) -> Vec<RankOutcome> {
    run_ranks(n, move |comm| {
        let rank = comm.rank();
        let mut level = level_with(rank, initial(rank));
        let mut lb =
            TreeLoadBalancer::new(Arc::new(comm), "test-balancer", opts.clone()).unwrap();
        let maps = lb
            .load_balance(&mut level, &constraints, None)
            .expect("balance failed");
        RankOutcome {
            level,
            maps,
            report: lb.last_report().copied(),
        }
    })
}

/// Merge every rank's connector into one global relation.
pub fn gather_connectors<'a>(
    conns: impl Iterator<Item = &'a MappingConnector>,
) -> MappingConnector {
    let mut all = MappingConnector::new();
    for c in conns {
        all.absorb(c);
    }
    all
}

/// Fragments must cover `origin` exactly: pairwise disjoint, inside it,
/// cell counts summing to its size.
pub fn assert_tiles(origin: &IndexBox, fragments: &[IndexBox]) {
    let total: u64 = fragments.iter().map(|f| f.size()).sum();
    assert_eq!(
        total,
        origin.size(),
        "fragment cells {total} != origin cells {} for {:?}",
        origin.size(),
        origin.id()
    );
    for (i, f) in fragments.iter().enumerate() {
        assert!(
            origin.contains_box(f),
            "fragment {:?} escapes origin {:?}",
            f.id(),
            origin.id()
        );
        for g in &fragments[i + 1..] {
            assert!(
                f.intersect(g).is_empty(),
                "fragments {:?} and {:?} overlap",
                f.id(),
                g.id()
            );
        }
    }
}

pub fn total_cells(outcomes: &[RankOutcome]) -> u64 {
    outcomes.iter().map(|o| o.level.local_cell_count()).sum()
}
