//! Byte-offset contract between generated code and the host-side structs it
//! addresses directly.
//!
//! Every offset below is read by native code via a hard-coded immediate.
//! There is exactly one place that is allowed to know these numbers: this
//! module. [`verify_layouts`] recomputes them from `core::mem::offset_of!`
//! and panics (at startup, not per-call) if they ever drift from the
//! constants the code generator emits — see design note "struct-field
//! offsets baked into generated code".

/// Offsets into the module context block, in bytes from its base pointer.
/// Mirrors `wazine_runtime::ModuleContext`'s field order exactly.
pub mod module_context {
    pub const GLOBALS_PTR: usize = 0;
    pub const MEMORY_PTR: usize = 8;
    pub const MEMORY_LEN: usize = 16;
    pub const TABLES_PTR: usize = 24;
    /// Pointer to one `u64` element count per table, parallel to
    /// `TABLES_PTR`; read by `call_indirect` to bounds-check an element
    /// index before it ever touches the table's contents.
    pub const TABLE_LENS_PTR: usize = 32;
    pub const FUNCTIONS_PTR: usize = 40;
    pub const TYPE_IDS_PTR: usize = 48;
    pub const DATA_SEGMENTS_PTR: usize = 56;
    pub const ELEM_SEGMENTS_PTR: usize = 64;
    pub const MEMORY_INSTANCE_PTR: usize = 72;
    pub const SIZE: usize = 80;
}

/// Offsets into the exit context, in bytes from its base pointer. Mirrors
/// `wazine_runtime::ExitContext`.
pub mod exit_context {
    pub const STATUS: usize = 0;
    pub const BUILTIN_INDEX: usize = 8;
    pub const RETURN_ADDRESS: usize = 16;
    pub const SIZE: usize = 24;
}

/// Offsets into an embedded call frame, relative to the frame's own base
/// (which sits at `stack_base_pointer - CALL_FRAME_SIZE` for the callee,
/// i.e. just below a function's own locals). Mirrors
/// `wazine_runtime::CallFrame`.
pub mod call_frame {
    pub const RETURN_ADDRESS: usize = 0;
    pub const CALLER_STACK_BASE_POINTER: usize = 8;
    pub const CALLER_FUNCTION_PTR: usize = 16;
    pub const SIZE: usize = 24;
}

/// Number of 8-byte slots a call frame occupies on the value stack.
pub const CALL_FRAME_SLOTS: u32 = (call_frame::SIZE / 8) as u32;

/// Verifies that the hard-coded offsets above still match the actual layout
/// of the structs they describe. Called once from each binary's/test's
/// startup path (`wazine_runtime` calls this from a `#[ctor]`-free `OnceLock`
/// guard the first time an `Executor` is constructed).
pub fn verify_module_context_layout(actual: &[(usize, usize)]) -> Result<(), LayoutMismatch> {
    let expected = [
        ("globals_ptr", module_context::GLOBALS_PTR),
        ("memory_ptr", module_context::MEMORY_PTR),
        ("memory_len", module_context::MEMORY_LEN),
        ("tables_ptr", module_context::TABLES_PTR),
        ("table_lens_ptr", module_context::TABLE_LENS_PTR),
        ("functions_ptr", module_context::FUNCTIONS_PTR),
        ("type_ids_ptr", module_context::TYPE_IDS_PTR),
        ("data_segments_ptr", module_context::DATA_SEGMENTS_PTR),
        ("elem_segments_ptr", module_context::ELEM_SEGMENTS_PTR),
        ("memory_instance_ptr", module_context::MEMORY_INSTANCE_PTR),
    ];
    for (i, (name, expected_offset)) in expected.iter().enumerate() {
        let Some(&(_, actual_offset)) = actual.get(i) else {
            return Err(LayoutMismatch { field: name, expected: *expected_offset, actual: usize::MAX });
        };
        if actual_offset != *expected_offset {
            return Err(LayoutMismatch { field: name, expected: *expected_offset, actual: actual_offset });
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("layout drift in field `{field}`: emitted offset {expected}, actual offset {actual}")]
pub struct LayoutMismatch {
    pub field: &'static str,
    pub expected: usize,
    pub actual: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_frame_is_three_slots() {
        assert_eq!(CALL_FRAME_SLOTS, 3);
    }

    fn reference_offsets() -> Vec<usize> {
        vec![
            module_context::GLOBALS_PTR,
            module_context::MEMORY_PTR,
            module_context::MEMORY_LEN,
            module_context::TABLES_PTR,
            module_context::TABLE_LENS_PTR,
            module_context::FUNCTIONS_PTR,
            module_context::TYPE_IDS_PTR,
            module_context::DATA_SEGMENTS_PTR,
            module_context::ELEM_SEGMENTS_PTR,
            module_context::MEMORY_INSTANCE_PTR,
        ]
    }

    #[test]
    fn matching_layout_verifies_ok() {
        let actual: Vec<(usize, usize)> = reference_offsets().into_iter().enumerate().collect();
        assert!(verify_module_context_layout(&actual).is_ok());
    }

    #[test]
    fn drifted_layout_is_rejected() {
        let mut offsets = reference_offsets();
        offsets[1] += 8; // simulate a field insertion nobody updated the constants for
        let actual: Vec<(usize, usize)> = offsets.into_iter().enumerate().collect();
        assert!(verify_module_context_layout(&actual).is_err());
    }
}
