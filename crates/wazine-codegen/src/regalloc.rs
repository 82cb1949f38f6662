//! A minimal register allocator for the per-function compiler: separate
//! free-lists for general-purpose and vector registers, spilling by storing
//! the owning operand to its value-stack slot when a pool runs dry.

use crate::masm::{Gpr, VReg};
use rustc_hash::FxHashSet;

/// One physical register pool (general-purpose or vector).
#[derive(Debug)]
pub struct RegPool<R> {
    free: Vec<R>,
    used: FxHashSet<u8>,
}

impl<R: Copy + Into<u8> + From<u8>> RegPool<R> {
    /// `usable` lists the registers this pool is allowed to allocate —
    /// callee-saved/reserved registers (frame pointer, stack context
    /// pointer, module context pointer) are never included, matching the
    /// calling convention's fixed register assignments.
    pub fn new(usable: &[u8]) -> Self {
        RegPool {
            free: usable.iter().rev().map(|&r| R::from(r)).collect(),
            used: FxHashSet::default(),
        }
    }

    /// Allocate a free register, or `None` if the pool is exhausted (the
    /// caller must spill something and retry).
    pub fn allocate(&mut self) -> Option<R> {
        let reg = self.free.pop()?;
        self.used.insert(reg.into());
        Some(reg)
    }

    pub fn free(&mut self, reg: R) {
        if self.used.remove(&reg.into()) {
            self.free.push(reg);
        }
    }

    pub fn is_used(&self, reg: R) -> bool {
        self.used.contains(&reg.into())
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }
}

impl From<u8> for Gpr {
    fn from(value: u8) -> Self {
        Gpr(value)
    }
}
impl From<Gpr> for u8 {
    fn from(value: Gpr) -> Self {
        value.0
    }
}
impl From<u8> for VReg {
    fn from(value: u8) -> Self {
        VReg(value)
    }
}
impl From<VReg> for u8 {
    fn from(value: VReg) -> Self {
        value.0
    }
}

/// The compiler's combined allocator: one pool of general-purpose registers
/// for i32/i64/reference values, one pool of vector registers for
/// f32/f64/v128 values (vector registers double as float registers, as on
/// both target ISAs).
pub struct RegisterAllocator {
    pub gpr: RegPool<Gpr>,
    pub vreg: RegPool<VReg>,
}

impl RegisterAllocator {
    pub fn new(gpr_usable: &[u8], vreg_usable: &[u8]) -> Self {
        RegisterAllocator {
            gpr: RegPool::new(gpr_usable),
            vreg: RegPool::new(vreg_usable),
        }
    }

    /// Pick a victim to spill when a pool is exhausted. The allocator
    /// itself doesn't know *which* symbolic-stack entry owns a register —
    /// the per-function compiler looks that up and calls back into
    /// `gpr.free`/`vreg.free` once the spill store has been emitted.
    pub fn gpr_exhausted(&self) -> bool {
        self.gpr.available() == 0
    }

    pub fn vreg_exhausted(&self) -> bool {
        self.vreg.available() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_free_round_trips() {
        let mut pool: RegPool<Gpr> = RegPool::new(&[0, 1, 2]);
        assert_eq!(pool.available(), 3);
        let r0 = pool.allocate().unwrap();
        assert_eq!(pool.available(), 2);
        assert!(pool.is_used(r0));
        pool.free(r0);
        assert_eq!(pool.available(), 3);
        assert!(!pool.is_used(r0));
    }

    #[test]
    fn exhausted_pool_returns_none() {
        let mut pool: RegPool<Gpr> = RegPool::new(&[0]);
        assert!(pool.allocate().is_some());
        assert!(pool.allocate().is_none());
    }
}
