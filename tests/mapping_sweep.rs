//! The semilocal mapping sweep in isolation: records planted on
//! arbitrary holders must reach their origin owners, whatever the tree
//! distance between them.

mod util;

use tree_balance::mapping::construct_semilocal_mapping;
use tree_balance::prelude::*;
use util::*;

/// A transit record pretending `holder` ended up with `fragment` of
/// rank `origin_owner`'s box.
fn held_fragment(
    holder: Rank,
    holder_local: i64,
    origin_owner: Rank,
    origin_local: i64,
    lo: [i32; 2],
    hi: [i32; 2],
    frag_lo: [i32; 2],
    frag_hi: [i32; 2],
) -> BoxInTransit {
    let origin = bx2(origin_owner, origin_local, lo, hi);
    BoxInTransit::from_origin(origin)
        .reassigned(bx2(holder, 0, frag_lo, frag_hi), holder, LocalId::new(holder_local))
}

#[test]
fn records_reach_origin_owners() {
    // Seven ranks in a heap tree. Rank 6 (deep leaf) holds a fragment
    // of rank 3's box (another deep leaf on the opposite branch), so
    // the record must climb to the root and come back down. Rank 0
    // holds a fragment of rank 1's box, and rank 4 keeps one of its
    // own.
    let outcomes = run_ranks(7, |comm| {
        let rank = comm.rank();
        let mut holdings = TransitSet::new();
        match rank {
            0 => {
                holdings.insert(held_fragment(0, 10, 1, 0, [0, 0], [7, 7], [0, 0], [7, 3]));
            }
            4 => {
                holdings.insert(BoxInTransit::from_origin(bx2(4, 2, [64, 0], [71, 7])));
            }
            6 => {
                holdings.insert(held_fragment(6, 20, 3, 5, [32, 0], [47, 7], [40, 0], [47, 7]));
            }
            _ => {}
        }
        construct_semilocal_mapping(&comm, &BalancedBinaryTree, 2, &holdings).unwrap()
    });

    // Rank 3 learned where its box went.
    let rel3 = outcomes[3]
        .relationship(BoxId::new(3, LocalId::new(5)))
        .expect("rank 3 missing relationship");
    assert_eq!(rel3.dsts.len(), 1);
    assert_eq!(rel3.dsts[0].0, 6);
    assert_eq!(rel3.dsts[0].1.lower().as_slice(), &[40, 0]);

    // Rank 1 learned about its fragment on rank 0.
    let rel1 = outcomes[1]
        .relationship(BoxId::new(1, LocalId::new(0)))
        .expect("rank 1 missing relationship");
    assert_eq!(rel1.dsts[0].0, 0);

    // Rank 4's own box is recorded locally without communication.
    let rel4 = outcomes[4]
        .relationship(BoxId::new(4, LocalId::new(2)))
        .expect("rank 4 missing relationship");
    assert_eq!(rel4.dsts[0].0, 4);

    // Nobody else invented relationships.
    for (rank, conn) in outcomes.iter().enumerate() {
        let expected = match rank {
            1 | 3 | 4 => 1,
            _ => 0,
        };
        assert_eq!(conn.num_sources(), expected, "rank {rank}");
    }
}

#[test]
fn empty_holdings_everywhere_is_quiet() {
    let outcomes = run_ranks(5, |comm| {
        let holdings = TransitSet::new();
        construct_semilocal_mapping(&comm, &BalancedBinaryTree, 2, &holdings).unwrap()
    });
    for conn in &outcomes {
        assert_eq!(conn.num_sources(), 0);
    }
}
