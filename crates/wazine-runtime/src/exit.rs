//! The exit context: the protocol channel generated code uses to hand
//! control back to the host with a reason. Field order mirrors
//! `wazine_types::layout::exit_context`.

use wazine_types::{layout::exit_context, BuiltinIndex, ExitStatus};

#[repr(C)]
pub struct ExitContext {
    pub status: u64,
    pub builtin_index: u64,
    pub return_address: u64,
}

const _: () = assert!(exit_context::SIZE == std::mem::size_of::<ExitContext>());

impl ExitContext {
    pub fn new() -> Self {
        ExitContext { status: ExitStatus::Returned as u64, builtin_index: 0, return_address: 0 }
    }

    pub fn status(&self) -> Option<ExitStatus> {
        ExitStatus::from_u32(self.status as u32)
    }

    pub fn builtin_index(&self) -> Option<BuiltinIndex> {
        BuiltinIndex::from_u32(self.builtin_index as u32)
    }
}

impl Default for ExitContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_returned() {
        let ctx = ExitContext::new();
        assert_eq!(ctx.status(), Some(ExitStatus::Returned));
    }

    #[test]
    fn decodes_builtin_index() {
        let mut ctx = ExitContext::new();
        ctx.builtin_index = BuiltinIndex::MemoryGrow as u64;
        assert_eq!(ctx.builtin_index(), Some(BuiltinIndex::MemoryGrow));
    }
}
