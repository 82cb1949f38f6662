//! The symbolic operand stack the per-function compiler maintains while
//! walking a function's IR. Mirrors the value stack's runtime shape without
//! ever touching memory: each entry says *where* a value currently lives.

use crate::masm::{Cond, Gpr, VReg};
use wazine_types::ValType;

/// Where a symbolic stack entry currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Gpr(Gpr),
    VReg(VReg),
    /// On the value stack, at this many slots below the function's current
    /// stack-pointer (i.e. `stack_pointer - depth_from_top` once the entry
    /// stops being the top of stack and gets assigned a concrete position).
    Stack { slot: u32 },
    /// The result of the previous `compare`; consumed by the next `branch_if`
    /// or materialized into a register via `set_from_flags` if something
    /// else needs to observe it first (a second operator between the
    /// compare and its use, or a spill).
    Flags(Cond),
}

/// One entry on the symbolic operand stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackValue {
    pub ty: ValType,
    pub location: Location,
}

/// The compiler's model of the value stack for the function currently being
/// compiled. Tracks depth in slots (not entries — a `V128` entry occupies
/// two) so the stack-pointer ceiling watermark is exact.
#[derive(Debug, Default)]
pub struct SymbolicStack {
    entries: Vec<StackValue>,
    /// Current stack-pointer, in slots, relative to this function's
    /// stack-base-pointer.
    depth: u32,
    /// High-water mark of `depth`, becomes the function's
    /// `stack_pointer_ceil` once compilation finishes.
    ceiling: u32,
}

impl SymbolicStack {
    pub fn new(initial_depth: u32) -> Self {
        SymbolicStack { entries: Vec::new(), depth: initial_depth, ceiling: initial_depth }
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push(&mut self, ty: ValType, location: Location) {
        self.depth += ty.slot_count();
        self.ceiling = self.ceiling.max(self.depth);
        self.entries.push(StackValue { ty, location });
    }

    /// Pop the top entry, decrementing the tracked stack-pointer depth by
    /// its slot count.
    pub fn pop(&mut self) -> StackValue {
        let value = self.entries.pop().expect("symbolic stack underflow");
        self.depth -= value.ty.slot_count();
        value
    }

    /// Bump the ceiling watermark to cover `extra_slots` above the current
    /// depth without actually pushing anything — for scratch space (e.g. a
    /// call frame) written by address rather than through push/pop.
    pub fn reserve(&mut self, extra_slots: u32) {
        self.ceiling = self.ceiling.max(self.depth + extra_slots);
    }

    pub fn peek(&self) -> Option<&StackValue> {
        self.entries.last()
    }

    /// Nth entry from the top (0 = top), used by `pick`/`set`.
    pub fn peek_at(&self, depth_from_top: u32) -> &StackValue {
        let index = self.entries.len() - 1 - depth_from_top as usize;
        &self.entries[index]
    }

    pub fn replace_at(&mut self, depth_from_top: u32, value: StackValue) {
        let index = self.entries.len() - 1 - depth_from_top as usize;
        self.entries[index] = value;
    }

    /// True if the top entry is a pending flags result (needs materializing
    /// before anything other than a branch consumes it).
    pub fn top_is_flags(&self) -> bool {
        matches!(self.peek().map(|v| v.location), Some(Location::Flags(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_tracks_slot_depth() {
        let mut stack = SymbolicStack::new(0);
        stack.push(ValType::I32, Location::Gpr(Gpr(0)));
        assert_eq!(stack.depth(), 1);
        stack.push(ValType::V128, Location::VReg(VReg(0)));
        assert_eq!(stack.depth(), 3);
        assert_eq!(stack.ceiling(), 3);
        stack.pop();
        assert_eq!(stack.depth(), 1);
        assert_eq!(stack.ceiling(), 3, "ceiling is a watermark, it never shrinks");
    }

    #[test]
    fn pick_reads_without_popping() {
        let mut stack = SymbolicStack::new(0);
        stack.push(ValType::I32, Location::Gpr(Gpr(1)));
        stack.push(ValType::I32, Location::Gpr(Gpr(2)));
        let picked = *stack.peek_at(1);
        assert_eq!(picked.location, Location::Gpr(Gpr(1)));
        assert_eq!(stack.len(), 2, "pick must not consume the stack");
    }
}
