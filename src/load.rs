//! Scalar work model.
//!
//! Uniform load only: the load of a box is its cell count. The signatures
//! leave room for summing per-cell weights from attached patch data, but
//! no such model is wired in; a workload data id set on the balancer is
//! accepted and ignored.

use crate::index::IndexBox;

/// Scalar work type used throughout the balancer.
pub type LoadType = f64;

/// Work contained in a box.
pub fn box_load(b: &IndexBox) -> LoadType {
    b.size() as LoadType
}

/// Work contained in the part of `b` that overlaps `restriction`.
pub fn box_load_in(b: &IndexBox, restriction: &IndexBox) -> LoadType {
    b.intersect(restriction).size() as LoadType
}
