//! Drives [`FunctionCompiler`] across every function in a module, and
//! builds the host-function call trampoline template used for functions the
//! embedder supplies rather than ones compiled from IR.

use crate::backend::new_assembler;
use crate::compiler::{CompiledFunction, FunctionCompiler};
use crate::masm::{CodegenError, Gpr, Width};
use wazine_types::{CompilationResult, ExitStatus, FunctionBody, TargetIsa};

/// One module's worth of compiled functions, in declaration order. Host
/// functions get a trampoline rather than compiled native code; the engine
/// tells them apart via [`wazine_types::FunctionIr::is_host`].
pub struct CompiledModule {
    pub module_name: String,
    pub functions: Vec<CompiledFunction>,
}

/// Compile every function in `result` for `target`.
pub fn compile_module(result: &CompilationResult, target: TargetIsa) -> Result<CompiledModule, CodegenError> {
    let mut functions = Vec::with_capacity(result.functions.len());
    for function in &result.functions {
        let compiled = match &function.body {
            FunctionBody::Defined { operators, locals } => {
                let masm = new_assembler(target);
                let fc = FunctionCompiler::new(masm, function.sig.clone(), locals.clone(), result.termination_support);
                fc.compile(operators)?
            }
            FunctionBody::Host(_) => host_trampoline(target),
        };
        functions.push(compiled);
    }
    Ok(CompiledModule { module_name: result.module_name.clone(), functions })
}

/// A host function has no native body of its own: generated code that calls
/// it jumps straight to this template, which writes
/// `ExitStatus::CallHostFunction` into the exit context and returns to the
/// executor, which looks up and invokes the actual `HostFunctionHandle`.
fn host_trampoline(target: TargetIsa) -> CompiledFunction {
    let mut masm = new_assembler(target);
    let conv = crate::compiler::CallingConvention::for_target(target);
    masm.exit_with_status(ExitStatus::CallHostFunction, conv.exit_context_base);
    let code = masm.finish();
    CompiledFunction { code, stack_pointer_ceil: 0, source_offsets: Vec::new() }
}

/// Emit a trampoline that adapts a table-indirect call: loads the target
/// function pointer plus its module-context pointer from a table element
/// (two adjacent 8-byte fields) and tail-calls it, swapping the module
/// context register the callee expects to see.
pub fn emit_cross_module_thunk(target: TargetIsa, element_base: Gpr) -> Vec<u8> {
    let mut masm = new_assembler(target);
    let conv = crate::compiler::CallingConvention::for_target(target);
    masm.load(conv.module_context_base, element_base, 8, Width::Bits64, false);
    let fn_ptr = Gpr(0);
    masm.load(fn_ptr, element_base, 0, Width::Bits64, false);
    masm.call_reg(fn_ptr);
    masm.ret();
    masm.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wazine_types::{FuncType, FunctionIr, ValType};

    #[test]
    fn compiles_a_module_with_one_defined_function() {
        let result = CompilationResult {
            module_name: "m".to_string(),
            functions: vec![FunctionIr {
                debug_name: "add".to_string(),
                sig: FuncType::new(vec![ValType::I32, ValType::I32], vec![ValType::I32]),
                body: FunctionBody::Defined {
                    operators: vec![
                        wazine_types::Operator::LocalGet { index: 0 },
                        wazine_types::Operator::LocalGet { index: 1 },
                        wazine_types::Operator::Add { ty: ValType::I32 },
                        wazine_types::Operator::Return,
                    ],
                    locals: vec![],
                },
                type_id: 0,
            }],
            termination_support: false,
        };
        let compiled = compile_module(&result, TargetIsa::host().unwrap_or(TargetIsa::X64)).unwrap();
        assert_eq!(compiled.functions.len(), 1);
        assert!(!compiled.functions[0].code.is_empty());
    }

    #[test]
    fn host_function_gets_a_trampoline_not_compiled_ir() {
        use std::sync::Arc;
        let result = CompilationResult {
            module_name: "m".to_string(),
            functions: vec![FunctionIr {
                debug_name: "env.log".to_string(),
                sig: FuncType::new(vec![ValType::I32], vec![]),
                body: FunctionBody::Host(wazine_types::HostFunctionHandle(Arc::new(|_| Ok(())))),
                type_id: 0,
            }],
            termination_support: false,
        };
        let compiled = compile_module(&result, TargetIsa::X64).unwrap();
        assert_eq!(compiled.functions[0].stack_pointer_ceil, 0);
    }
}
