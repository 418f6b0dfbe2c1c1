//! Moving work between two transit sets until one of them holds a target
//! amount.
//!
//! Three strategies run in order until `main_bin` lands inside
//! `[low, high]`: move whole boxes, swap a pair, break a box. Each keeps
//! both bins' cached sums exact.

use log::trace;

use crate::breaker::BalanceBoxBreaker;
use crate::index::{LocalId, Rank};
use crate::load::LoadType;
use crate::params::PartitioningParams;
use crate::transit::{BoxInTransit, TransitSet};

fn in_band(v: LoadType, low: LoadType, high: LoadType) -> bool {
    low <= v && v <= high
}

/// Adjust `main_bin` toward `ideal` by trading with `hold_bin`,
/// accepting any result in `[low, high]`. New boxes created by breaking
/// are owned by `rank` and numbered from `next_id`. Returns the net load
/// moved into `main_bin` (negative when load moved out).
pub fn adjust_load(
    params: &PartitioningParams,
    rank: Rank,
    main_bin: &mut TransitSet,
    hold_bin: &mut TransitSet,
    next_id: &mut LocalId,
    ideal: LoadType,
    low: LoadType,
    high: LoadType,
) -> LoadType {
    debug_assert!(low <= ideal && ideal <= high);
    let before = main_bin.sum_load();
    if in_band(before, low, high) {
        return 0.0;
    }
    adjust_by_moving(main_bin, hold_bin, ideal, low, high);
    if !in_band(main_bin.sum_load(), low, high) {
        adjust_by_swapping(main_bin, hold_bin, ideal, low, high);
    }
    if !in_band(main_bin.sum_load(), low, high) {
        adjust_by_breaking(params, rank, main_bin, hold_bin, next_id, ideal, low, high);
    }
    main_bin.sum_load() - before
}

/// Greedy whole-box moves, largest useful box first. Each move strictly
/// reduces `|sum(main) - ideal|` and never overshoots the band.
fn adjust_by_moving(
    main_bin: &mut TransitSet,
    hold_bin: &mut TransitSet,
    ideal: LoadType,
    low: LoadType,
    high: LoadType,
) {
    loop {
        let sum = main_bin.sum_load();
        if in_band(sum, low, high) {
            return;
        }
        if sum < ideal {
            let gap = ideal - sum;
            let Some(&cand) = hold_bin.best_fit_at_most(high - sum) else {
                return;
            };
            if cand.load <= 0.0 || (gap - cand.load).abs() >= gap {
                return;
            }
            let cand = hold_bin.take(&cand).expect("candidate vanished");
            trace!("move {:?} into main ({} cells)", cand.id(), cand.load);
            main_bin.insert(cand);
        } else {
            let over = sum - ideal;
            let Some(&cand) = main_bin.best_fit_at_most(sum - low) else {
                return;
            };
            if cand.load <= 0.0 || (over - cand.load).abs() >= over {
                return;
            }
            let cand = main_bin.take(&cand).expect("candidate vanished");
            trace!("move {:?} out of main ({} cells)", cand.id(), cand.load);
            hold_bin.insert(cand);
        }
    }
}

/// Exchange one box from each bin so the pair's load difference covers
/// what whole moves could not. Returns whether a swap happened.
fn adjust_by_swapping(
    main_bin: &mut TransitSet,
    hold_bin: &mut TransitSet,
    ideal: LoadType,
    low: LoadType,
    high: LoadType,
) -> bool {
    let sum = main_bin.sum_load();
    let need = ideal - sum;
    let (src, dst, want) = if need > 0.0 {
        (&*hold_bin, &*main_bin, need)
    } else {
        (&*main_bin, &*hold_bin, -need)
    };
    let Some((a, b)) = find_swap_pair(src, dst, want) else {
        return false;
    };
    // Moving (a - b) into the destination side; translate back to main.
    let delta = if need > 0.0 {
        a.load - b.load
    } else {
        b.load - a.load
    };
    // A swap only commits when it actually lands in band; anything less
    // is left to the breaking strategy from the unswapped state.
    let new_sum = sum + delta;
    if !in_band(new_sum, low, high) {
        return false;
    }
    let (from_src, from_dst) = if need > 0.0 {
        (hold_bin.take(&a), main_bin.take(&b))
    } else {
        (main_bin.take(&a), hold_bin.take(&b))
    };
    let (a, b) = (from_src.expect("swap src vanished"), from_dst.expect("swap dst vanished"));
    trace!("swap {:?} ({}) with {:?} ({})", a.id(), a.load, b.id(), b.load);
    if need > 0.0 {
        main_bin.insert(a);
        hold_bin.insert(b);
    } else {
        hold_bin.insert(a);
        main_bin.insert(b);
    }
    true
}

/// Best `(a in src, b in dst)` with `load(a) - load(b)` nearest `want`
/// (want > 0). Candidates for each `a` are the two `dst` entries
/// bracketing `load(a) - want`.
fn find_swap_pair(
    src: &TransitSet,
    dst: &TransitSet,
    want: LoadType,
) -> Option<(BoxInTransit, BoxInTransit)> {
    let mut best: Option<(BoxInTransit, BoxInTransit, LoadType)> = None;
    for a in src.iter() {
        let target = a.load - want;
        if target < 0.0 {
            // Entries only get smaller from here; a whole move would
            // beat any such swap.
            break;
        }
        for b in [dst.best_fit_at_most(target), dst.smallest_at_least(target)]
            .into_iter()
            .flatten()
        {
            let err = (a.load - b.load - want).abs();
            if best.as_ref().map_or(true, |(_, _, e)| err < *e) {
                best = Some((*a, *b, err));
            }
        }
    }
    best.map(|(a, b, _)| (a, b))
}

/// Cut a donor box so the fragment closes the remaining gap.
#[allow(clippy::too_many_arguments)]
fn adjust_by_breaking(
    params: &PartitioningParams,
    rank: Rank,
    main_bin: &mut TransitSet,
    hold_bin: &mut TransitSet,
    next_id: &mut LocalId,
    ideal: LoadType,
    low: LoadType,
    high: LoadType,
) -> bool {
    let sum = main_bin.sum_load();
    let need = ideal - sum;
    let breaker = BalanceBoxBreaker::new(params);
    if need > 0.0 {
        // Fragment lands in main; band on the fragment follows from the
        // band on main's sum.
        let Some(&donor) = hold_bin.smallest_at_least(need) else {
            return false;
        };
        let Some(brk) = breaker.break_off(&donor.box_, need, low - sum, high - sum) else {
            return false;
        };
        let donor = hold_bin.take(&donor).expect("donor vanished");
        distribute_pieces(&donor, &brk.breakoff, rank, next_id, main_bin);
        distribute_pieces(&donor, &brk.leftover, rank, next_id, hold_bin);
        trace!(
            "break {:?}: {} cells into main, {} back",
            donor.id(),
            brk.brk_load,
            donor.load - brk.brk_load
        );
        true
    } else {
        let want = -need;
        let Some(&donor) = main_bin.smallest_at_least(want) else {
            return false;
        };
        let Some(brk) = breaker.break_off(&donor.box_, want, sum - high, sum - low) else {
            return false;
        };
        let donor = main_bin.take(&donor).expect("donor vanished");
        distribute_pieces(&donor, &brk.breakoff, rank, next_id, hold_bin);
        distribute_pieces(&donor, &brk.leftover, rank, next_id, main_bin);
        trace!(
            "break {:?}: {} cells out of main",
            donor.id(),
            brk.brk_load
        );
        true
    }
}

fn distribute_pieces(
    donor: &BoxInTransit,
    pieces: &[crate::index::IndexBox],
    rank: Rank,
    next_id: &mut LocalId,
    bin: &mut TransitSet,
) {
    for piece in pieces {
        let t = donor.reassigned(*piece, rank, *next_id);
        *next_id = next_id.next();
        bin.insert(t);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{BlockId, BoxId, IndexBox, IntVector};

    fn params() -> PartitioningParams {
        PartitioningParams::new(
            2,
            IntVector::uniform(2, 1),
            IntVector::uniform(2, 1 << 20),
            IntVector::uniform(2, 1),
            IntVector::uniform(2, 0),
        )
        .unwrap()
    }

    fn transit(local: i64, w: i32, h: i32) -> BoxInTransit {
        let b = IndexBox::new(
            IntVector::from_slice(&[0, 0]),
            IntVector::from_slice(&[w - 1, h - 1]),
            BlockId(0),
            BoxId::new(0, LocalId::new(local)),
        );
        BoxInTransit::from_origin(b)
    }

    #[test]
    fn whole_moves_fill_the_bin() {
        let p = params();
        let mut main = TransitSet::new();
        let mut hold = TransitSet::new();
        for (l, w) in [(0, 8), (1, 6), (2, 4), (3, 2)] {
            hold.insert(transit(l, w, 1));
        }
        let mut next = LocalId::new(100);
        let moved = adjust_load(&p, 0, &mut main, &mut hold, &mut next, 10.0, 9.0, 11.0);
        assert_eq!(moved, 10.0);
        assert_eq!(main.sum_load(), 10.0);
        assert_eq!(hold.sum_load(), 10.0);
        // No breaking was needed.
        assert_eq!(next, LocalId::new(100));
    }

    #[test]
    fn swap_closes_small_gap() {
        let p = params();
        let mut main = TransitSet::new();
        let mut hold = TransitSet::new();
        main.insert(transit(0, 5, 1));
        hold.insert(transit(1, 8, 1));
        hold.insert(transit(2, 9, 1));
        let mut next = LocalId::new(100);
        // Want main at 8: no whole move fits (8,9 both overshoot 9.0
        // high? no: high 9 admits 8+5=13 > 9; the swap 8<->5 lands at 8).
        adjust_load(&p, 0, &mut main, &mut hold, &mut next, 8.0, 7.5, 8.5);
        assert_eq!(main.sum_load(), 8.0);
        assert_eq!(hold.sum_load(), 14.0);
    }

    #[test]
    fn breaking_creates_exact_fragment() {
        let p = params();
        let mut main = TransitSet::new();
        let mut hold = TransitSet::new();
        hold.insert(transit(0, 32, 16)); // 512 cells
        let mut next = LocalId::new(1);
        let moved = adjust_load(&p, 3, &mut main, &mut hold, &mut next, 256.0, 243.0, 269.0);
        assert!(moved >= 243.0 && moved <= 269.0);
        assert!((main.sum_load() + hold.sum_load() - 512.0).abs() < 1e-9);
        // Fragments got fresh ids owned by rank 3.
        for t in main.iter() {
            assert_eq!(t.owner(), 3);
        }
        assert!(next > LocalId::new(1));
    }

    #[test]
    fn infeasible_band_leaves_bins_unchanged() {
        let p = params();
        let mut main = TransitSet::new();
        let mut hold = TransitSet::new();
        hold.insert(transit(0, 1, 1));
        let mut next = LocalId::new(1);
        let moved = adjust_load(&p, 0, &mut main, &mut hold, &mut next, 0.5, 0.4, 0.6);
        assert_eq!(moved, 0.0);
        assert_eq!(hold.len(), 1);
        assert!(main.is_empty());
    }
}
