//! Boxes in motion between ranks, and the ordered multiset that holds
//! them.

use std::collections::BTreeSet;

use crate::error::BalanceError;
use crate::index::{BoxId, IndexBox, LocalId, Rank};
use crate::load::{box_load_in, LoadType};

/// A box traveling along tree edges, carrying the box it originated from
/// and the work it represents.
///
/// `origin` is never modified. Fragments produced by cutting inherit the
/// same `origin` and take fresh local ids; `load` always equals the cells
/// of `box_ ∩ origin` under the uniform model.
#[derive(Debug, Clone, Copy)]
pub struct BoxInTransit {
    pub box_: IndexBox,
    pub origin: IndexBox,
    pub load: LoadType,
}

impl BoxInTransit {
    /// Start a box on its journey: the box is its own origin.
    pub fn from_origin(b: IndexBox) -> Self {
        Self {
            box_: b,
            origin: b,
            load: b.size() as LoadType,
        }
    }

    /// A record with the same history but different geometry and
    /// identity: used when a box is cut or changes owner.
    pub fn reassigned(&self, geometry: IndexBox, owner: Rank, local: LocalId) -> Self {
        let box_ = geometry.with_id(BoxId::new(owner, local));
        Self {
            box_,
            origin: self.origin,
            load: box_load_in(&box_, &self.origin),
        }
    }

    pub fn id(&self) -> BoxId {
        self.box_.id()
    }

    pub fn owner(&self) -> Rank {
        self.box_.owner()
    }
}

// Set-key semantics: ordering and equality look only at (load, id), with
// larger loads first and ids ascending among equals. Geometry never
// participates.
impl Ord for BoxInTransit {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .load
            .total_cmp(&self.load)
            .then_with(|| self.id().cmp(&other.id()))
    }
}

impl PartialOrd for BoxInTransit {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for BoxInTransit {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for BoxInTransit {}

fn probe(load: LoadType, id: BoxId) -> BoxInTransit {
    use crate::index::{BlockId, IntVector};
    let b = IndexBox::new(
        IntVector::uniform(1, 0),
        IntVector::uniform(1, -1),
        BlockId(0),
        id,
    );
    BoxInTransit {
        box_: b,
        origin: b,
        load,
    }
}

const ID_MIN: BoxId = BoxId::new(0, LocalId::new(i64::MIN));
const ID_MAX: BoxId = BoxId::new(usize::MAX, LocalId::new(i64::MAX));

/// Ordered multiset of [`BoxInTransit`], largest load first, ties broken
/// by ascending box id, with the sum of loads cached.
///
/// Elements are only reachable by shared reference; to change a record,
/// erase it, modify the copy, and reinsert (the load is part of the key).
#[derive(Debug, Clone, Default)]
pub struct TransitSet {
    set: BTreeSet<BoxInTransit>,
    sum_load: LoadType,
}

impl TransitSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Cached sum of loads. O(1).
    pub fn sum_load(&self) -> LoadType {
        self.sum_load
    }

    /// Insert one record; returns false (and leaves the set unchanged)
    /// when an equal key is already present.
    pub fn insert(&mut self, t: BoxInTransit) -> bool {
        let added = self.set.insert(t);
        if added {
            self.sum_load += t.load;
        }
        added
    }

    /// Insert many records; a collision is a logic bug and fails the
    /// whole operation with the offending id.
    pub fn insert_all<I>(&mut self, items: I) -> Result<(), BalanceError>
    where
        I: IntoIterator<Item = BoxInTransit>,
    {
        for t in items {
            if !self.insert(t) {
                return Err(BalanceError::DuplicateTransitBox(t.id()));
            }
        }
        Ok(())
    }

    /// Remove a record equal (by key) to `t`; returns it if present.
    pub fn take(&mut self, t: &BoxInTransit) -> Option<BoxInTransit> {
        let got = self.set.take(t);
        if let Some(ref found) = got {
            self.sum_load -= found.load;
        }
        got
    }

    /// Remove and return the highest-load record.
    pub fn pop_largest(&mut self) -> Option<BoxInTransit> {
        let first = *self.set.iter().next()?;
        self.take(&first)
    }

    /// Largest-load record whose load does not exceed `limit`.
    pub fn best_fit_at_most(&self, limit: LoadType) -> Option<&BoxInTransit> {
        self.set.range(probe(limit, ID_MIN)..).next()
    }

    /// Smallest-load record whose load is at least `need`.
    pub fn smallest_at_least(&self, need: LoadType) -> Option<&BoxInTransit> {
        self.set.range(..=probe(need, ID_MAX)).next_back()
    }

    /// Iterate from largest load to smallest.
    pub fn iter(&self) -> impl Iterator<Item = &BoxInTransit> {
        self.set.iter()
    }

    pub fn clear(&mut self) {
        self.set.clear();
        self.sum_load = 0.0;
    }

    pub fn swap(&mut self, other: &mut TransitSet) {
        std::mem::swap(self, other);
    }

    /// Drain every record, largest first.
    pub fn drain(&mut self) -> Vec<BoxInTransit> {
        self.sum_load = 0.0;
        let mut out = Vec::with_capacity(self.set.len());
        while let Some(t) = self.set.pop_first() {
            out.push(t);
        }
        out
    }
}

impl FromIterator<BoxInTransit> for TransitSet {
    fn from_iter<I: IntoIterator<Item = BoxInTransit>>(iter: I) -> Self {
        let mut s = TransitSet::new();
        for t in iter {
            s.insert(t);
        }
        s
    }
}
