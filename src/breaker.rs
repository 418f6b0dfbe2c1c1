//! Cutting one box to shed a requested amount of work.
//!
//! Candidate cuts are planar slabs and corner chops, filtered by the
//! geometric constraints in [`PartitioningParams`] and ranked by a
//! composite penalty of imbalance, new surface, and slenderness. Pieces
//! keep the source box's identity; callers assign fresh ids.

use log::trace;

use crate::index::IndexBox;
use crate::load::LoadType;
use crate::params::PartitioningParams;

/// A successful break: `breakoff ∪ leftover` tiles the source box
/// exactly and `brk_load` is the work in `breakoff`.
#[derive(Debug, Clone)]
pub struct BreakOff {
    pub breakoff: Vec<IndexBox>,
    pub leftover: Vec<IndexBox>,
    pub brk_load: LoadType,
}

/// Utility for breaking boxes during partitioning.
pub struct BalanceBoxBreaker<'a> {
    params: &'a PartitioningParams,
}

#[derive(Debug)]
struct Candidate {
    penalty: f64,
    /// 0 whole-box (no cut), 1 planar, 2 cubic. On equal penalty not
    /// cutting beats any cut, and planar beats cubic.
    kind: u8,
    axis: usize,
    center_dist: i64,
    plane: i32,
    result: BreakOff,
}

impl Candidate {
    fn beats(&self, other: &Candidate) -> bool {
        (
            self.penalty,
            self.kind,
            self.axis,
            self.center_dist,
            self.plane,
        )
            .partial_cmp(&(
                other.penalty,
                other.kind,
                other.axis,
                other.center_dist,
                other.plane,
            ))
            .map(|o| o.is_lt())
            .unwrap_or(false)
    }
}

impl<'a> BalanceBoxBreaker<'a> {
    pub fn new(params: &'a PartitioningParams) -> Self {
        Self { params }
    }

    /// Break off approximately `ideal` load from `b`, accepting any
    /// result in `[low, high]`. Returns `None` when no candidate lands
    /// in the band without violating a constraint.
    pub fn break_off(
        &self,
        b: &IndexBox,
        ideal: LoadType,
        low: LoadType,
        high: LoadType,
    ) -> Option<BreakOff> {
        debug_assert!(ideal > 0.0);
        debug_assert!(low <= high);
        if b.is_empty() {
            return None;
        }
        let box_load = b.size() as LoadType;
        let floor = self.params.min_fragment_load();

        // Best candidate honoring the advisory fragment floor, and best
        // overall; the floor only matters when it can be honored.
        fn consider(
            best: &mut Option<Candidate>,
            best_floored: &mut Option<Candidate>,
            floor: f64,
            cand: Candidate,
        ) {
            let honors_floor = cand.result.brk_load >= floor;
            if best.as_ref().map_or(true, |b| cand.beats(b)) {
                *best = Some(clone_cand(&cand));
            }
            if honors_floor && best_floored.as_ref().map_or(true, |b| cand.beats(b)) {
                *best_floored = Some(cand);
            }
        }
        let mut best: Option<Candidate> = None;
        let mut best_floored: Option<Candidate> = None;

        // Giving the whole box away needs no cut and pays no surface or
        // slenderness price, nor the precut multiplier; on a penalty tie
        // its kind sorts ahead of every cut.
        if in_band(box_load, low, high) {
            let balance = (box_load - ideal).abs();
            consider(
                &mut best,
                &mut best_floored,
                floor,
                Candidate {
                    penalty: self.params.balance_penalty_wt * balance * balance,
                    kind: 0,
                    axis: 0,
                    center_dist: 0,
                    plane: 0,
                    result: BreakOff {
                        breakoff: vec![*b],
                        leftover: Vec::new(),
                        brk_load: box_load,
                    },
                },
            );
        }

        let bad = self.bad_cut_planes(b);

        for (cand, axis, plane) in self.planar_candidates(b, ideal, low, high, &bad) {
            trace!(
                "planar candidate axis={} plane={} load={} penalty={}",
                axis,
                plane,
                cand.result.brk_load,
                cand.penalty
            );
            consider(&mut best, &mut best_floored, floor, cand);
        }

        // Corner chops only when no single plane lands in the band.
        if best.is_none() {
            for cand in self.cubic_candidates(b, ideal, low, high, &bad) {
                trace!(
                    "cubic candidate load={} penalty={}",
                    cand.result.brk_load,
                    cand.penalty
                );
                consider(&mut best, &mut best_floored, floor, cand);
            }
        }

        let chosen = best_floored.or(best)?;
        debug_assert_eq!(
            chosen
                .result
                .breakoff
                .iter()
                .chain(&chosen.result.leftover)
                .map(|p| p.size())
                .sum::<u64>(),
            b.size(),
            "break pieces must tile the box"
        );
        Some(chosen.result)
    }

    /// Whether the plane at coordinate `p` on `axis` is an admissible
    /// cut of `b`: both slabs at least `min_size` wide, the coordinate a
    /// multiple of `cut_factor`, and not strictly inside the bad
    /// interval around a same-block domain face.
    pub fn is_good_plane(&self, b: &IndexBox, axis: usize, p: i32) -> bool {
        let p64 = p as i64;
        let lo = b.lower()[axis] as i64;
        let hi = b.upper()[axis] as i64 + 1;
        if p64 <= lo || p64 >= hi {
            return false;
        }
        let min = self.params.min_size[axis] as i64;
        if p64 - lo < min || hi - p64 < min {
            return false;
        }
        if p64.rem_euclid(self.params.cut_factor[axis] as i64) != 0 {
            return false;
        }
        let bad = self.params.bad_interval[axis] as i64;
        if bad > 0 {
            for dom in self.params.domain_boxes(b.block()) {
                for face in [dom.lower()[axis] as i64, dom.upper()[axis] as i64 + 1] {
                    let dist = (p64 - face).abs();
                    if dist != 0 && dist < bad {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Per axis, a flag for each interior plane (offset `p - lower - 1`)
    /// telling whether cutting there is forbidden.
    fn bad_cut_planes(&self, b: &IndexBox) -> Vec<Vec<bool>> {
        (0..b.dim())
            .map(|axis| {
                (b.lower()[axis] + 1..=b.upper()[axis])
                    .map(|p| !self.is_good_plane(b, axis, p))
                    .collect()
            })
            .collect()
    }

    fn planar_candidates(
        &self,
        b: &IndexBox,
        ideal: LoadType,
        low: LoadType,
        high: LoadType,
        bad: &[Vec<bool>],
    ) -> Vec<(Candidate, usize, i32)> {
        let box_load = b.size() as LoadType;
        let mut out = Vec::new();
        for axis in 0..b.dim() {
            let width = b.width(axis);
            let per_plane = box_load / width as LoadType;
            let center = b.lower()[axis] + (width / 2) as i32;
            for (off, &is_bad) in bad[axis].iter().enumerate() {
                if is_bad {
                    continue;
                }
                let p = b.lower()[axis] + 1 + off as i32;
                let lower_load = (p - b.lower()[axis]) as LoadType * per_plane;
                let upper_load = box_load - lower_load;

                let mut up = *b.upper();
                up[axis] = p - 1;
                let lower_slab = b.with_corners(*b.lower(), up);
                let mut lo = *b.lower();
                lo[axis] = p;
                let upper_slab = b.with_corners(lo, *b.upper());

                let (brk, rest, brk_load) =
                    if (lower_load - ideal).abs() <= (upper_load - ideal).abs() {
                        (lower_slab, upper_slab, lower_load)
                    } else {
                        (upper_slab, lower_slab, upper_load)
                    };
                if !in_band(brk_load, low, high) {
                    continue;
                }
                let pieces = [brk, rest];
                let penalty = self.params.precut_penalty_wt
                    * self.combined_penalty(b, &pieces, brk_load, ideal);
                out.push((
                    Candidate {
                        penalty,
                        kind: 1,
                        axis,
                        center_dist: (p - center).abs() as i64,
                        plane: p,
                        result: BreakOff {
                            breakoff: vec![brk],
                            leftover: vec![rest],
                            brk_load,
                        },
                    },
                    axis,
                    p,
                ));
            }
        }
        out
    }

    fn cubic_candidates(
        &self,
        b: &IndexBox,
        ideal: LoadType,
        low: LoadType,
        high: LoadType,
        bad: &[Vec<bool>],
    ) -> Vec<Candidate> {
        let dim = b.dim();
        if dim < 2 {
            return Vec::new();
        }
        let mut out = Vec::new();
        for corner in 0..(1usize << dim) {
            let Some(chop) = self.corner_chop(b, ideal, corner, bad) else {
                continue;
            };
            let brk_load = chop.size() as LoadType;
            if !in_band(brk_load, low, high) || chop == *b {
                continue;
            }
            let leftover = burst(b, &chop);
            let mut pieces = vec![chop];
            pieces.extend(leftover.iter().copied());
            let penalty = self.params.precut_penalty_wt
                * self.combined_penalty(b, &pieces, brk_load, ideal);
            out.push(Candidate {
                penalty,
                kind: 2,
                axis: dim,
                center_dist: 0,
                plane: 0,
                result: BreakOff {
                    breakoff: vec![chop],
                    leftover,
                    brk_load,
                },
            });
        }
        out
    }

    /// Axis-aligned sub-box anchored at `corner` (bit d set: anchored at
    /// the upper end of axis d) whose volume approximates `ideal`, with
    /// each inner face snapped to an admissible plane.
    fn corner_chop(
        &self,
        b: &IndexBox,
        ideal: LoadType,
        corner: usize,
        bad: &[Vec<bool>],
    ) -> Option<IndexBox> {
        let dim = b.dim();
        let mut lower = *b.lower();
        let mut upper = *b.upper();
        let mut remaining = ideal.max(1.0);
        for axis in 0..dim {
            let width = b.width(axis);
            let target = remaining
                .powf(1.0 / (dim - axis) as f64)
                .round()
                .clamp(1.0, width as f64) as i64;
            let w = self.snap_extent(b, axis, target, width, bad)?;
            if w < width {
                if corner & (1 << axis) == 0 {
                    upper[axis] = b.lower()[axis] + w as i32 - 1;
                } else {
                    lower[axis] = b.upper()[axis] - w as i32 + 1;
                }
            }
            remaining = (remaining / w as f64).max(1.0);
        }
        Some(b.with_corners(lower, upper))
    }

    /// Snap a desired extent to one whose implied cut plane is
    /// admissible, searching outward from the target; full extent means
    /// no cut along the axis.
    fn snap_extent(
        &self,
        b: &IndexBox,
        axis: usize,
        target: i64,
        width: i64,
        bad: &[Vec<bool>],
    ) -> Option<i64> {
        if target >= width {
            return Some(width);
        }
        // Extent w cuts at offset w - 1 into the bad-plane table (plane
        // lower + w). The table is symmetric for lower/upper anchoring
        // because min-size binds both slabs.
        for delta in 0..width {
            for w in [target - delta, target + delta] {
                if w >= width {
                    return Some(width);
                }
                if w < 1 {
                    continue;
                }
                let off = (w - 1) as usize;
                if off < bad[axis].len() && !bad[axis][off] {
                    return Some(w);
                }
            }
        }
        None
    }

    fn combined_penalty(
        &self,
        original: &IndexBox,
        pieces: &[IndexBox],
        brk_load: LoadType,
        ideal: LoadType,
    ) -> f64 {
        let balance = (brk_load - ideal).abs();
        let old_surface = original.surface_area();
        let new_surface: f64 = pieces.iter().map(|p| p.surface_area()).sum();
        let surface = (new_surface - old_surface).max(0.0) / old_surface;
        let slender: f64 = pieces
            .iter()
            .map(|p| (p.aspect_ratio() - self.params.slender_penalty_threshold).max(0.0))
            .sum();
        self.params.balance_penalty_wt * balance * balance
            + self.params.surface_penalty_wt * surface * surface
            + self.params.slender_penalty_wt * slender * slender
    }

    /// Split `b` as needed so every piece respects `max_size`, cutting
    /// only at admissible planes. Returns `b` alone when it already
    /// conforms or cannot be legally cut.
    pub fn chop_to_max_size(&self, b: &IndexBox) -> Vec<IndexBox> {
        let Some(axis) = (0..b.dim())
            .filter(|&d| b.width(d) > self.params.max_size[d] as i64)
            .max_by_key(|&d| b.width(d) - self.params.max_size[d] as i64)
        else {
            return vec![*b];
        };
        // Widest legal lower piece not exceeding max_size.
        let top = b.lower()[axis] as i64 + self.params.max_size[axis] as i64;
        let bottom = b.lower()[axis] as i64 + 1;
        let plane = (bottom..=top)
            .rev()
            .find(|&p| self.is_good_plane(b, axis, p as i32));
        let Some(p) = plane else {
            log::warn!(
                "box {:?} exceeds max_size on axis {} but has no admissible cut",
                b.id(),
                axis
            );
            return vec![*b];
        };
        let mut up = *b.upper();
        up[axis] = p as i32 - 1;
        let mut lo = *b.lower();
        lo[axis] = p as i32;
        let mut out = self.chop_to_max_size(&b.with_corners(*b.lower(), up));
        out.extend(self.chop_to_max_size(&b.with_corners(lo, *b.upper())));
        out
    }
}

fn in_band(v: LoadType, low: LoadType, high: LoadType) -> bool {
    low <= v && v <= high
}

fn clone_cand(c: &Candidate) -> Candidate {
    Candidate {
        penalty: c.penalty,
        kind: c.kind,
        axis: c.axis,
        center_dist: c.center_dist,
        plane: c.plane,
        result: c.result.clone(),
    }
}

/// Minimal rectilinear cover of `bursty \ solid` (with `solid` inside
/// `bursty`) as up to `2 * dim` boxes, slicing along each face of
/// `solid` in canonical axis order.
pub fn burst(bursty: &IndexBox, solid: &IndexBox) -> Vec<IndexBox> {
    debug_assert!(bursty.contains_box(solid));
    let mut rest = *bursty;
    let mut out = Vec::new();
    for d in 0..bursty.dim() {
        if rest.lower()[d] < solid.lower()[d] {
            let mut up = *rest.upper();
            up[d] = solid.lower()[d] - 1;
            out.push(rest.with_corners(*rest.lower(), up));
            let mut lo = *rest.lower();
            lo[d] = solid.lower()[d];
            rest = rest.with_corners(lo, *rest.upper());
        }
        if rest.upper()[d] > solid.upper()[d] {
            let mut lo = *rest.lower();
            lo[d] = solid.upper()[d] + 1;
            out.push(rest.with_corners(lo, *rest.upper()));
            let mut up = *rest.upper();
            up[d] = solid.upper()[d];
            rest = rest.with_corners(*rest.lower(), up);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{BlockId, BoxId, IntVector, LocalId};

    fn bx(lo: &[i32], hi: &[i32]) -> IndexBox {
        IndexBox::new(
            IntVector::from_slice(lo),
            IntVector::from_slice(hi),
            BlockId(0),
            BoxId::new(0, LocalId::new(0)),
        )
    }

    fn params(dim: usize) -> PartitioningParams {
        PartitioningParams::new(
            dim,
            IntVector::uniform(dim, 1),
            IntVector::uniform(dim, 1 << 20),
            IntVector::uniform(dim, 1),
            IntVector::uniform(dim, 0),
        )
        .unwrap()
    }

    #[test]
    fn burst_covers_exactly() {
        let outer = bx(&[0, 0], &[9, 9]);
        let inner = bx(&[2, 3], &[5, 7]);
        let pieces = burst(&outer, &inner);
        assert!(pieces.len() <= 4);
        let total: u64 = pieces.iter().map(|p| p.size()).sum();
        assert_eq!(total + inner.size(), outer.size());
        for (i, a) in pieces.iter().enumerate() {
            assert!(a.intersect(&inner).is_empty());
            for b in &pieces[i + 1..] {
                assert!(a.intersect(b).is_empty());
            }
        }
    }

    #[test]
    fn planar_break_hits_band() {
        let p = params(2);
        let brk = BalanceBoxBreaker::new(&p);
        let b = bx(&[0, 0], &[31, 15]); // 512 cells
        let got = brk.break_off(&b, 256.0, 243.0, 269.0).unwrap();
        assert!(got.brk_load >= 243.0 && got.brk_load <= 269.0);
        let total: u64 = got
            .breakoff
            .iter()
            .chain(&got.leftover)
            .map(|p| p.size())
            .sum();
        assert_eq!(total, 512);
    }

    #[test]
    fn min_size_respected() {
        let mut p = params(2);
        p.min_size = IntVector::from_slice(&[4, 4]);
        let brk = BalanceBoxBreaker::new(&p);
        let b = bx(&[0, 0], &[7, 7]);
        // Only planes 4 are allowed per axis; asking for 8 of 64 cells
        // cannot be satisfied inside [6, 10].
        assert!(brk.break_off(&b, 8.0, 6.0, 10.0).is_none());
        // A band admitting the quarter cut succeeds.
        let got = brk.break_off(&b, 8.0, 6.0, 32.0).unwrap();
        for piece in got.breakoff.iter().chain(&got.leftover) {
            assert!(piece.width(0) >= 4 && piece.width(1) >= 4);
        }
    }

    #[test]
    fn cut_factor_respected() {
        let mut p = params(2);
        p.cut_factor = IntVector::from_slice(&[4, 4]);
        let brk = BalanceBoxBreaker::new(&p);
        let b = bx(&[0, 0], &[15, 3]);
        let got = brk.break_off(&b, 20.0, 12.0, 28.0).unwrap();
        for piece in got.breakoff.iter().chain(&got.leftover) {
            assert_eq!(piece.lower()[0].rem_euclid(4), 0);
            assert_eq!((piece.upper()[0] + 1).rem_euclid(4), 0);
        }
    }

    #[test]
    fn bad_interval_avoids_forbidden_plane() {
        // Domain faces at x=5 with bad_interval 2 forbid planes 4 and 6.
        let mut p = params(2);
        p.bad_interval = IntVector::from_slice(&[2, 2]);
        p.block_domain_boxes.insert(
            BlockId(0),
            vec![
                bx(&[0, 0], &[4, 4]),
                bx(&[5, 0], &[7, 4]),
                bx(&[0, 5], &[4, 7]),
                bx(&[5, 5], &[7, 7]),
            ],
        );
        let brk = BalanceBoxBreaker::new(&p);
        let b = bx(&[0, 0], &[7, 7]); // 64 cells
        let got = brk.break_off(&b, 32.0, 24.0, 40.0).unwrap();
        // Cut at x=4 would be ideal (load 32) but is forbidden; x=3 or
        // x=5 give 24 or 40.
        assert!(got.brk_load == 24.0 || got.brk_load == 40.0);
        for piece in got.breakoff.iter().chain(&got.leftover) {
            assert_ne!(piece.lower()[0], 4);
            assert_ne!(piece.upper()[0] + 1, 4);
        }
    }

    #[test]
    fn whole_box_preferred_when_band_allows() {
        let p = params(2);
        let brk = BalanceBoxBreaker::new(&p);
        let b = bx(&[0, 0], &[7, 7]); // 64 cells
        let got = brk.break_off(&b, 64.0, 32.0, 70.0).unwrap();
        assert_eq!(got.brk_load, 64.0);
        assert!(got.leftover.is_empty());
    }

    #[test]
    fn chop_to_max_size_splits_recursively() {
        let mut p = params(2);
        p.max_size = IntVector::from_slice(&[8, 8]);
        let brk = BalanceBoxBreaker::new(&p);
        let b = bx(&[0, 0], &[31, 5]);
        let pieces = brk.chop_to_max_size(&b);
        let total: u64 = pieces.iter().map(|q| q.size()).sum();
        assert_eq!(total, b.size());
        for q in &pieces {
            assert!(q.width(0) <= 8 && q.width(1) <= 8);
        }
        assert_eq!(pieces.len(), 4);
    }

    #[test]
    fn indivisible_box_fails_cleanly() {
        let p = params(2);
        let brk = BalanceBoxBreaker::new(&p);
        let b = bx(&[0, 0], &[0, 0]);
        assert!(brk.break_off(&b, 0.5, 0.4, 0.6).is_none());
    }
}
