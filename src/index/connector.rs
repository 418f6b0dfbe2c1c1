//! Mapping connector: the relation between two distributed box sets.
//!
//! Each rank records the relationships whose source boxes it owns. The
//! balancer produces a forward connector (unbalanced origin box to its
//! balanced fragments) and a reverse connector (balanced box back to its
//! origin); the two must be mutual transposes once gathered over ranks.

use hashbrown::HashMap;

use crate::index::{BoxId, IndexBox, Rank};

/// One source box's relationships.
#[derive(Debug, Clone)]
pub struct Relationship {
    pub src: IndexBox,
    pub dsts: Vec<(Rank, IndexBox)>,
}

/// Relation from source boxes (keyed by id) to destination boxes with
/// their owner ranks.
#[derive(Debug, Clone, Default)]
pub struct MappingConnector {
    relations: HashMap<BoxId, Relationship>,
}

impl MappingConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `src -> (dst_rank, dst)`. Repeated inserts for one source
    /// accumulate destinations.
    pub fn insert(&mut self, src: IndexBox, dst_rank: Rank, dst: IndexBox) {
        self.relations
            .entry(src.id())
            .or_insert_with(|| Relationship {
                src,
                dsts: Vec::new(),
            })
            .dsts
            .push((dst_rank, dst));
    }

    pub fn relationship(&self, src: BoxId) -> Option<&Relationship> {
        self.relations.get(&src)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&BoxId, &Relationship)> {
        self.relations.iter()
    }

    /// Number of source boxes with at least one relationship.
    pub fn num_sources(&self) -> usize {
        self.relations.len()
    }

    /// Total destination edges.
    pub fn num_edges(&self) -> usize {
        self.relations.values().map(|r| r.dsts.len()).sum()
    }

    /// Merge another connector's relationships into this one. Used to
    /// gather per-rank connectors into a global view.
    pub fn absorb(&mut self, other: &MappingConnector) {
        for (_, rel) in other.iter() {
            for &(rank, dst) in &rel.dsts {
                self.insert(rel.src, rank, dst);
            }
        }
    }

    /// Whether `self` and `other` are mutual transposes: every edge
    /// `a -> (rb, b)` of one appears as `b -> (ra, a)` in the other,
    /// where `ra` is the owner of `a`. Both connectors must be global
    /// (already gathered over ranks).
    pub fn is_transpose_of(&self, other: &MappingConnector) -> bool {
        fn covered(fwd: &MappingConnector, rev: &MappingConnector) -> bool {
            for (_, rel) in fwd.iter() {
                for &(_, dst) in &rel.dsts {
                    let Some(back) = rev.relationship(dst.id()) else {
                        return false;
                    };
                    if !back
                        .dsts
                        .iter()
                        .any(|&(r, b)| r == rel.src.owner() && b.id() == rel.src.id())
                    {
                        return false;
                    }
                }
            }
            true
        }
        covered(self, other) && covered(other, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{BlockId, IntVector, LocalId};

    fn bx(owner: Rank, local: i64, lo: i32, hi: i32) -> IndexBox {
        IndexBox::new(
            IntVector::from_slice(&[lo, 0]),
            IntVector::from_slice(&[hi, 7]),
            BlockId(0),
            BoxId::new(owner, LocalId::new(local)),
        )
    }

    #[test]
    fn transpose_detection() {
        let a = bx(0, 0, 0, 15);
        let b0 = bx(0, 1, 0, 7);
        let b1 = bx(1, 5, 8, 15);

        let mut fwd = MappingConnector::new();
        fwd.insert(a, 0, b0);
        fwd.insert(a, 1, b1);

        let mut rev = MappingConnector::new();
        rev.insert(b0, 0, a);
        rev.insert(b1, 0, a);
        assert!(fwd.is_transpose_of(&rev));

        let mut broken = MappingConnector::new();
        broken.insert(b0, 0, a);
        assert!(!fwd.is_transpose_of(&broken));
    }
}
