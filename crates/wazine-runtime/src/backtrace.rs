//! Builds a human-readable backtrace by walking embedded call frames from
//! the point of a trap back to the outermost (host) caller.

use wazine_engine::CompiledModule;
use wazine_types::{FuncType, TrapCode};

/// One frame of a trapped call's backtrace.
#[derive(Debug, Clone)]
pub struct BacktraceFrame {
    pub debug_name: String,
    pub sig: FuncType,
    /// Binary-source offset for this frame's return address, if the
    /// function carries a source-offset map.
    pub source_offset: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct Backtrace {
    pub trap: TrapCode,
    pub frames: Vec<BacktraceFrame>,
}

/// Translate a native return address into a source-binary offset via binary
/// search over the function's sorted `(native_offset, source_offset)` pairs.
/// Entries are sorted ascending by construction (the compiler emits them in
/// program order); `native_pc` is relative to the function's own entry.
pub fn resolve_source_offset(
    entries: &[wazine_types::SourceOffsetEntry],
    native_pc: u32,
) -> Option<u32> {
    if entries.is_empty() {
        return None;
    }
    match entries.binary_search_by_key(&native_pc, |e| e.native_offset) {
        Ok(i) => Some(entries[i].source_offset),
        Err(0) => None,
        Err(i) => Some(entries[i - 1].source_offset),
    }
}

/// Build a backtrace from a stream of `(function_index, native_return_pc)`
/// pairs, innermost first, as collected by walking call frames on the value
/// stack (see [`crate::call_engine::Executor`]).
pub fn build_backtrace(
    module: &CompiledModule,
    trap: TrapCode,
    frame_walk: &[(usize, u32)],
) -> Backtrace {
    let frames = frame_walk
        .iter()
        .map(|&(function_index, native_pc)| {
            let record = &module.functions[function_index];
            let source_offset = resolve_source_offset(&record.source_offsets, native_pc);
            BacktraceFrame { debug_name: record.debug_name.clone(), sig: record.sig.clone(), source_offset }
        })
        .collect();
    Backtrace { trap, frames }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wazine_types::SourceOffsetEntry;

    #[test]
    fn binary_search_finds_the_enclosing_entry() {
        let entries = vec![
            SourceOffsetEntry { native_offset: 0, source_offset: 10 },
            SourceOffsetEntry { native_offset: 8, source_offset: 20 },
            SourceOffsetEntry { native_offset: 16, source_offset: 30 },
        ];
        let resolved: Vec<Option<u32>> =
            [10, 0, 100].iter().map(|&pc| resolve_source_offset(&entries, pc)).collect();
        assert_eq!(resolved, vec![Some(20), Some(10), Some(30)]);
    }

    #[test]
    fn empty_map_resolves_to_none() {
        assert_eq!(resolve_source_offset(&[], 5), None);
    }
}
