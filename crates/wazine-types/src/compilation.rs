//! The interface the per-function compiler consumes: a validated,
//! linearized IR handed over by a front-end that is explicitly out of scope
//! for this crate (see spec §1).

use crate::op::Operator;
use crate::val_type::{FuncType, ValType};
use std::sync::Arc;

/// A pair of (native offset, source-binary offset), kept sorted by native
/// offset so the backtrace builder can binary-search it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceOffsetEntry {
    pub native_offset: u32,
    pub source_offset: u32,
}

/// Opaque handle to a host-defined function. The engine never inspects its
/// contents; it is threaded through to the executor's host-call dispatch.
#[derive(Clone)]
pub struct HostFunctionHandle(pub Arc<dyn Fn(&mut [u64]) -> Result<(), crate::status::TrapCode> + Send + Sync>);

impl std::fmt::Debug for HostFunctionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("HostFunctionHandle(..)")
    }
}

/// Per-function body: either a linear IR program to compile, or a host
/// function handle to wrap in a trampoline template.
#[derive(Debug, Clone)]
pub enum FunctionBody {
    Defined { operators: Vec<Operator>, locals: Vec<ValType> },
    Host(HostFunctionHandle),
}

/// One function as seen by the module compiler.
#[derive(Debug, Clone)]
pub struct FunctionIr {
    pub debug_name: String,
    pub sig: FuncType,
    pub body: FunctionBody,
    /// Type-id this function was declared with, for `call_indirect` checks
    /// against table elements of this function's type.
    pub type_id: u32,
}

impl FunctionIr {
    pub fn is_host(&self) -> bool {
        matches!(self.body, FunctionBody::Host(_))
    }
}

/// The full compilation result a front-end hands to the engine: every
/// function in module-index order, plus whether termination-check
/// trampolines should be woven in.
#[derive(Debug, Clone)]
pub struct CompilationResult {
    pub module_name: String,
    pub functions: Vec<FunctionIr>,
    pub termination_support: bool,
}

impl CompilationResult {
    pub fn contains_host_function(&self) -> bool {
        self.functions.iter().any(FunctionIr::is_host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_modules_are_detected() {
        let host_fn = FunctionIr {
            debug_name: "env.log".to_string(),
            sig: FuncType::new(vec![ValType::I32], vec![]),
            body: FunctionBody::Host(HostFunctionHandle(Arc::new(|_| Ok(())))),
            type_id: 0,
        };
        let result = CompilationResult {
            module_name: "m".to_string(),
            functions: vec![host_fn],
            termination_support: false,
        };
        assert!(result.contains_host_function());
    }
}
