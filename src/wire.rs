//! Fixed little-endian wire formats for the balancing protocol.
//!
//! Up/down work messages are a packed subtree header followed by
//! `work_count` box-in-transit records; field order is fixed and there is
//! no implicit padding, so the header is streamed field by field rather
//! than cast. Fixed-size records (the load-moments sweep) are
//! `bytemuck`-Pod structs.

use bytemuck::{Pod, Zeroable};
use std::mem::size_of;

use crate::index::{BlockId, BoxId, IndexBox, IntVector, LocalId, MAX_DIM};
use crate::load::LoadType;
use crate::transit::BoxInTransit;

/// Sequential little-endian writer.
#[derive(Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
        }
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Sequential little-endian reader over a received payload.
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], String> {
        if self.pos + n > self.buf.len() {
            return Err(format!(
                "message truncated: wanted {} bytes at offset {}, have {}",
                n,
                self.pos,
                self.buf.len()
            ));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    pub fn get_i32(&mut self) -> Result<i32, String> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn get_u32(&mut self) -> Result<u32, String> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn get_i64(&mut self) -> Result<i64, String> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn get_u8(&mut self) -> Result<u8, String> {
        Ok(self.take(1)?[0])
    }

    pub fn get_f64(&mut self) -> Result<f64, String> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    /// All bytes consumed?
    pub fn expect_end(&self) -> Result<(), String> {
        if self.pos == self.buf.len() {
            Ok(())
        } else {
            Err(format!(
                "{} trailing bytes after message",
                self.buf.len() - self.pos
            ))
        }
    }
}

/// Box on the wire:
/// `owner_rank:i32, local_id:i64, block_id:i32, lower[dim], upper[dim]`.
pub fn put_box(w: &mut WireWriter, b: &IndexBox) {
    w.put_i32(b.owner() as i32);
    w.put_i64(b.local_id().get());
    w.put_i32(b.block().0);
    for d in 0..b.dim() {
        w.put_i32(b.lower()[d]);
    }
    for d in 0..b.dim() {
        w.put_i32(b.upper()[d]);
    }
}

pub fn get_box(r: &mut WireReader, dim: usize) -> Result<IndexBox, String> {
    debug_assert!((1..=MAX_DIM).contains(&dim));
    let owner = r.get_i32()?;
    if owner < 0 {
        return Err(format!("negative owner rank {owner} on wire"));
    }
    let local = r.get_i64()?;
    let block = r.get_i32()?;
    let mut lower = IntVector::uniform(dim, 0);
    let mut upper = IntVector::uniform(dim, 0);
    for d in 0..dim {
        lower[d] = r.get_i32()?;
    }
    for d in 0..dim {
        upper[d] = r.get_i32()?;
    }
    Ok(IndexBox::new(
        lower,
        upper,
        BlockId(block),
        BoxId::new(owner as usize, LocalId::new(local)),
    ))
}

/// Box-in-transit on the wire: `box, origin, load:f64`.
pub fn put_transit(w: &mut WireWriter, t: &BoxInTransit) {
    put_box(w, &t.box_);
    put_box(w, &t.origin);
    w.put_f64(t.load);
}

pub fn get_transit(r: &mut WireReader, dim: usize) -> Result<BoxInTransit, String> {
    let box_ = get_box(r, dim)?;
    let origin = get_box(r, dim)?;
    let load = r.get_f64()?;
    Ok(BoxInTransit { box_, origin, load })
}

/// Byte length of one box record for a given dimension.
pub const fn box_wire_len(dim: usize) -> usize {
    4 + 8 + 4 + 2 * 4 * dim
}

/// Byte length of one box-in-transit record for a given dimension.
pub const fn transit_wire_len(dim: usize) -> usize {
    2 * box_wire_len(dim) + 8
}

/// Load moments exchanged by reduction sweeps. `f64` values travel as
/// their IEEE-754 bit patterns.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireLoadMoments {
    pub sum_bits_le: u64,
    pub min_bits_le: u64,
    pub max_bits_le: u64,
}

impl WireLoadMoments {
    pub fn new(sum: LoadType, min: LoadType, max: LoadType) -> Self {
        Self {
            sum_bits_le: sum.to_bits().to_le(),
            min_bits_le: min.to_bits().to_le(),
            max_bits_le: max.to_bits().to_le(),
        }
    }

    pub fn sum(&self) -> LoadType {
        f64::from_bits(u64::from_le(self.sum_bits_le))
    }

    pub fn min(&self) -> LoadType {
        f64::from_bits(u64::from_le(self.min_bits_le))
    }

    pub fn max(&self) -> LoadType {
        f64::from_bits(u64::from_le(self.max_bits_le))
    }

    /// Componentwise fold of another rank's moments.
    pub fn merge(&self, other: &WireLoadMoments) -> WireLoadMoments {
        WireLoadMoments::new(
            self.sum() + other.sum(),
            self.min().min(other.min()),
            self.max().max(other.max()),
        )
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        expect_exact_len(bytes.len(), size_of::<Self>())?;
        Ok(bytemuck::pod_read_unaligned(bytes))
    }

    pub fn encode(&self) -> Vec<u8> {
        bytemuck::bytes_of(self).to_vec()
    }
}

pub fn expect_exact_len(actual: usize, expected: usize) -> Result<(), String> {
    if actual == expected {
        Ok(())
    } else {
        Err(format!("expected {expected} bytes, got {actual}"))
    }
}

const _: () = {
    assert!(size_of::<WireLoadMoments>() == 24);
    assert!(box_wire_len(2) == 32);
    assert!(transit_wire_len(2) == 72);
};
