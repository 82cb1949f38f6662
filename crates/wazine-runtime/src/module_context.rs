//! The module context block: cached pointers and lengths native code reads
//! directly, at the fixed byte offsets `wazine_types::layout::module_context`
//! names. One instance is published per module instantiation and kept
//! current across every call into that instance.

use wazine_types::layout::module_context;

/// Raw fields native code addresses by offset. Kept as a plain repr(C)-style
/// struct (field order matches the layout module exactly) rather than
/// something richer, since its only consumer besides Rust is generated
/// machine code.
#[repr(C)]
pub struct ModuleContext {
    pub globals_ptr: *mut u64,
    pub memory_ptr: *mut u8,
    pub memory_len: u64,
    pub tables_ptr: *mut u64,
    /// One `u64` element count per table, parallel to `tables_ptr`.
    pub table_lens_ptr: *mut u64,
    pub functions_ptr: *mut u64,
    pub type_ids_ptr: *mut u32,
    pub data_segments_ptr: *mut u8,
    pub elem_segments_ptr: *mut u64,
    pub memory_instance_ptr: *mut u8,
}

impl ModuleContext {
    pub fn offsets() -> [(&'static str, usize); 10] {
        [
            ("globals_ptr", std::mem::offset_of!(ModuleContext, globals_ptr)),
            ("memory_ptr", std::mem::offset_of!(ModuleContext, memory_ptr)),
            ("memory_len", std::mem::offset_of!(ModuleContext, memory_len)),
            ("tables_ptr", std::mem::offset_of!(ModuleContext, tables_ptr)),
            ("table_lens_ptr", std::mem::offset_of!(ModuleContext, table_lens_ptr)),
            ("functions_ptr", std::mem::offset_of!(ModuleContext, functions_ptr)),
            ("type_ids_ptr", std::mem::offset_of!(ModuleContext, type_ids_ptr)),
            ("data_segments_ptr", std::mem::offset_of!(ModuleContext, data_segments_ptr)),
            ("elem_segments_ptr", std::mem::offset_of!(ModuleContext, elem_segments_ptr)),
            ("memory_instance_ptr", std::mem::offset_of!(ModuleContext, memory_instance_ptr)),
        ]
    }

    /// Called once, the first time an [`crate::call_engine::Executor`] is
    /// constructed, to catch a drift between this struct's field order and
    /// the constants the code generator emits before any native code runs.
    pub fn verify_layout() -> Result<(), wazine_types::layout::LayoutMismatch> {
        let actual_offsets: Vec<(usize, usize)> =
            Self::offsets().iter().enumerate().map(|(i, &(_, offset))| (i, offset)).collect();
        wazine_types::layout::verify_module_context_layout(&actual_offsets)
    }

    pub fn memory(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.memory_ptr, self.memory_len as usize) }
    }

    pub fn memory_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.memory_ptr, self.memory_len as usize) }
    }
}

const _: () = assert!(module_context::GLOBALS_PTR == 0);
const _: () = assert!(module_context::SIZE == std::mem::size_of::<ModuleContext>());

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_offsets_match_the_layout_constants() {
        assert!(ModuleContext::verify_layout().is_ok());
    }
}
