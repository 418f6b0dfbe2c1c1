//! End-to-end balancing scenarios, one thread per rank.

mod util;

use std::sync::Arc;

use tree_balance::prelude::*;
use util::*;

#[test]
fn single_rank_is_identity() {
    let original = bx2(0, 0, [0, 0], [15, 15]);
    let outcomes = balance_on_ranks(
        1,
        BalancerOptions::default(),
        BalanceConstraints::unconstrained(2),
        move |_| vec![original],
    );
    let out = &outcomes[0];
    assert_eq!(out.level.boxes(), &[original]);
    let rel = out
        .maps
        .unbalanced_to_balanced
        .relationship(original.id())
        .unwrap();
    assert_eq!(rel.dsts.len(), 1);
    assert_eq!(rel.dsts[0].0, 0);
    assert_eq!(rel.dsts[0].1.id(), original.id());
    let report = out.report.unwrap();
    assert_eq!(report.before.max, 256.0);
    assert_eq!(report.after.max, 256.0);
}

#[test]
fn two_ranks_split_within_tolerance() {
    let original = bx2(0, 0, [0, 0], [31, 15]); // 512 cells
    let outcomes = balance_on_ranks(
        2,
        BalancerOptions::default(),
        BalanceConstraints::unconstrained(2),
        move |rank| if rank == 0 { vec![original] } else { vec![] },
    );
    let load0 = outcomes[0].level.local_cell_count();
    let load1 = outcomes[1].level.local_cell_count();
    assert_eq!(load0 + load1, 512);
    assert!((243..=269).contains(&load0), "rank 0 kept {load0}");
    assert!(load1 > 0);
    for b in outcomes[1].level.boxes() {
        assert_eq!(b.owner(), 1);
    }
    // The pieces tile the original exactly.
    let all = gather_connectors(outcomes.iter().map(|o| &o.maps.unbalanced_to_balanced));
    let rel = all.relationship(original.id()).unwrap();
    let fragments: Vec<IndexBox> = rel.dsts.iter().map(|&(_, b)| b).collect();
    assert_tiles(&original, &fragments);
}

#[test]
fn four_ranks_fan_out_from_root() {
    let original = bx2(0, 0, [0, 0], [39, 24]); // 1000 cells
    let outcomes = balance_on_ranks(
        4,
        BalancerOptions::default(),
        BalanceConstraints::unconstrained(2),
        move |rank| if rank == 0 { vec![original] } else { vec![] },
    );
    assert_eq!(total_cells(&outcomes), 1000);
    for (rank, out) in outcomes.iter().enumerate() {
        let load = out.level.local_cell_count();
        assert!(
            (237..=263).contains(&load),
            "rank {rank} ended with {load} cells"
        );
    }
    // Only one cycle for four ranks.
    assert_eq!(outcomes[0].report.unwrap().cycles, 1);
    // Rank 0's origin produced exactly three remote fragments.
    let rel_owner = &outcomes[0].maps.unbalanced_to_balanced;
    let rel = rel_owner.relationship(original.id()).unwrap();
    let remote = rel.dsts.iter().filter(|&&(r, _)| r != 0).count();
    assert_eq!(remote, 3);
    let fragments: Vec<IndexBox> = rel.dsts.iter().map(|&(_, b)| b).collect();
    assert_tiles(&original, &fragments);
}

#[test]
fn indivisible_box_leaves_residual_imbalance() {
    // 100 cells that cannot be cut: min_size equals the box extent.
    let original = bx2(0, 0, [0, 0], [9, 9]);
    let mut constraints = BalanceConstraints::unconstrained(2);
    constraints.min_size = IntVector::from_slice(&[10, 10]);
    let outcomes = balance_on_ranks(
        4,
        BalancerOptions::default(),
        constraints,
        move |rank| if rank == 0 { vec![original] } else { vec![] },
    );
    assert_eq!(outcomes[0].level.local_cell_count(), 100);
    for out in &outcomes[1..] {
        assert_eq!(out.level.local_cell_count(), 0);
    }
    let report = outcomes[0].report.unwrap();
    assert_eq!(report.after.max, 100.0);
    assert_eq!(report.after.min, 0.0);
    // The untouched box keeps its identity.
    assert_eq!(outcomes[0].level.boxes(), &[original]);
}

#[test]
fn already_balanced_input_does_not_move() {
    let outcomes = balance_on_ranks(
        4,
        BalancerOptions::default(),
        BalanceConstraints::unconstrained(2),
        move |rank| vec![bx2(rank, 0, [0, 16 * rank as i32], [7, 16 * rank as i32 + 7])],
    );
    for (rank, out) in outcomes.iter().enumerate() {
        assert_eq!(out.level.boxes().len(), 1);
        let b = out.level.boxes()[0];
        assert_eq!(b.owner(), rank);
        assert_eq!(b.local_id(), LocalId::new(0));
        assert_eq!(b.size(), 64);
        let rel = out.maps.unbalanced_to_balanced.relationship(b.id()).unwrap();
        assert_eq!(rel.dsts.len(), 1);
        assert_eq!(rel.dsts[0].0, rank);
    }
}

#[test]
fn multi_cycle_spread_reaches_balance() {
    // All load on rank 0, spread ratio 8 over 128 ranks: three cycles
    // with group sizes 8, 64, 128.
    let original = bx2(0, 0, [0, 0], [127, 63]); // 8192 cells, avg 64
    let mut opts = BalancerOptions::default();
    opts.max_cycle_spread_ratio = 8;
    let outcomes = balance_on_ranks(
        128,
        opts,
        BalanceConstraints::unconstrained(2),
        move |rank| if rank == 0 { vec![original] } else { vec![] },
    );
    assert_eq!(total_cells(&outcomes), 8192);
    let report = outcomes[0].report.unwrap();
    assert_eq!(report.cycles, 3);
    for (rank, out) in outcomes.iter().enumerate() {
        let load = out.level.local_cell_count();
        assert!(
            (30..=110).contains(&load),
            "rank {rank} ended with {load} cells (avg 64)"
        );
    }
    let all = gather_connectors(outcomes.iter().map(|o| &o.maps.unbalanced_to_balanced));
    let rel = all.relationship(original.id()).unwrap();
    let fragments: Vec<IndexBox> = rel.dsts.iter().map(|&(_, b)| b).collect();
    assert_tiles(&original, &fragments);
}

#[test]
fn subset_rank_group_prebalances_outsiders() {
    // Only ranks 1 and 2 participate; ranks 0 and 3 must hand their
    // boxes over and end empty.
    let outcomes = run_ranks(4, move |comm| {
        let rank = comm.rank();
        let boxes = match rank {
            0 => vec![bx2(0, 0, [0, 0], [15, 15])],
            3 => vec![bx2(3, 0, [0, 32], [15, 47])],
            _ => vec![],
        };
        let mut level = level_with(rank, boxes);
        let mut lb = TreeLoadBalancer::new(
            Arc::new(comm),
            "subset",
            BalancerOptions::default(),
        )
        .unwrap();
        let group = RankGroup::new(vec![1, 2]).unwrap();
        let maps = lb
            .load_balance(
                &mut level,
                &BalanceConstraints::unconstrained(2),
                Some(&group),
            )
            .expect("balance failed");
        (level, maps)
    });
    assert_eq!(outcomes[0].0.local_cell_count(), 0);
    assert_eq!(outcomes[3].0.local_cell_count(), 0);
    let mid: u64 = outcomes[1].0.local_cell_count() + outcomes[2].0.local_cell_count();
    assert_eq!(mid, 512);
    for out in &outcomes[1..3] {
        let load = out.0.local_cell_count();
        assert!((243..=269).contains(&load), "member held {load}");
    }
    // Each origin owner can still account for its boxes.
    let all = gather_connectors(outcomes.iter().map(|(_, m)| &m.unbalanced_to_balanced));
    for (owner, local) in [(0usize, 0i64), (3, 0)] {
        let rel = all
            .relationship(BoxId::new(owner, LocalId::new(local)))
            .unwrap();
        let covered: u64 = rel.dsts.iter().map(|&(_, b)| b.size()).sum();
        assert_eq!(covered, 256);
    }
}

#[test]
fn max_size_constraint_applies_after_balance() {
    let original = bx2(0, 0, [0, 0], [31, 31]); // 1024 cells
    let mut constraints = BalanceConstraints::unconstrained(2);
    constraints.max_size = IntVector::from_slice(&[8, 8]);
    let outcomes = balance_on_ranks(
        2,
        BalancerOptions::default(),
        constraints,
        move |rank| if rank == 0 { vec![original] } else { vec![] },
    );
    assert_eq!(total_cells(&outcomes), 1024);
    for out in &outcomes {
        for b in out.level.boxes() {
            assert!(b.width(0) <= 8 && b.width(1) <= 8, "{b:?} exceeds max size");
        }
    }
    let all = gather_connectors(outcomes.iter().map(|o| &o.maps.unbalanced_to_balanced));
    let rel = all.relationship(original.id()).unwrap();
    let fragments: Vec<IndexBox> = rel.dsts.iter().map(|&(_, b)| b).collect();
    assert_tiles(&original, &fragments);
}
