//! The executor: drives native code, services host calls and runtime
//! builtins, and turns trap exit statuses into backtraced errors.
//!
//! Every function activation — whether it runs to the end of the call chain
//! or stops partway through to ask the host for something — ends the same
//! way: it writes a status into the exit context and hands control back
//! here. [`Executor::call`] is the only place that loop is driven; resuming
//! a suspended activation means re-entering native code at the address the
//! exit context just recorded, with the module context and exit context
//! pointers passed again as fresh arguments (the compiled prologue reloads
//! its fixed calling-convention registers from them every time it's
//! entered, not just at a function's true start — see the compiler's
//! `CallingConvention`).

use crate::backtrace::{build_backtrace, Backtrace};
use crate::call_frame::CallFrame;
use crate::error::CallError;
use crate::exit::ExitContext;
use crate::module_context::ModuleContext;
use crate::observer::{ObserverSnapshot, ObserverStack};
use crate::value_stack::ValueStack;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use wazine_engine::{CompiledModule, EngineConfig};
use wazine_types::{layout, BuiltinIndex, ExitStatus, TrapCode};

/// The raw signature every compiled entry point and every resumption target
/// is called through: stack base, module context, exit context, in that
/// fixed order.
pub type NativeEntryFn = unsafe extern "C" fn(*mut u64, *const ModuleContext, *mut ExitContext);

/// Grows a module instance's linear memory by `delta_pages`, updating
/// `ctx.memory_ptr`/`ctx.memory_len` in place. Returns the previous size in
/// pages, or `None` if the request cannot be satisfied (the 0xFFFF_FFFF
/// sentinel `memory.grow` returns on failure). Implemented by the embedder
/// that owns the actual memory allocation; this crate only reacts to it.
pub trait MemoryGrower: Send + Sync {
    fn grow(&self, ctx: &mut ModuleContext, delta_pages: u32) -> Option<u32>;
}

/// Grows a module instance's table by `delta_elements`, filling new slots
/// with `fill_value`. Returns the previous element count, or `None` on
/// failure, mirroring [`MemoryGrower`].
pub trait TableGrower: Send + Sync {
    fn grow(&self, ctx: &mut ModuleContext, delta_elements: u32, fill_value: u64) -> Option<u32>;
}

/// One call engine: a value stack plus the resource hooks bound to it for
/// the lifetime of calls made through it. Not shareable across threads —
/// native code mutates the value stack with no synchronization, matching
/// the single-threaded-cooperative execution model; make one `Executor` per
/// worker instead of sharing one.
pub struct Executor {
    stack: ValueStack,
    exit_context: ExitContext,
    observers: ObserverStack,
    call_stack_ceiling_slots: u32,
    debug_breakpoints: bool,
    memory_grower: Option<Box<dyn MemoryGrower>>,
    table_grower: Option<Box<dyn TableGrower>>,
    canceled: Arc<AtomicBool>,
}

const INITIAL_STACK_SLOTS: u32 = 256;

impl Executor {
    pub fn new(config: &EngineConfig) -> Result<Self, layout::LayoutMismatch> {
        ModuleContext::verify_layout()?;
        Ok(Executor {
            stack: ValueStack::new(INITIAL_STACK_SLOTS),
            exit_context: ExitContext::new(),
            observers: ObserverStack::new(),
            call_stack_ceiling_slots: config.call_stack_ceiling_slots,
            debug_breakpoints: config.debug_breakpoints,
            memory_grower: None,
            table_grower: None,
            canceled: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn with_memory_grower(mut self, grower: Box<dyn MemoryGrower>) -> Self {
        self.memory_grower = Some(grower);
        self
    }

    pub fn with_table_grower(mut self, grower: Box<dyn TableGrower>) -> Self {
        self.table_grower = Some(grower);
        self
    }

    /// A shared flag the embedder can set from another thread to ask a
    /// long-running call to stop at its next `check-exit-code` builtin.
    pub fn cancellation_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.canceled)
    }

    /// Invoke `function_index` in `module` with `args`, against the module
    /// instance state in `ctx`. Blocks until the call returns, traps, or is
    /// canceled.
    pub fn call(
        &mut self,
        module: &Arc<CompiledModule>,
        ctx: &mut ModuleContext,
        function_index: usize,
        args: &[u64],
    ) -> Result<Vec<u64>, CallError> {
        let record = &module.functions[function_index];
        if record.sig.params.len() != args.len() {
            return Err(CallError::ArityMismatch { expected: record.sig.params.clone(), actual: args.len() });
        }

        if let Some(host_fn) = &record.host_fn {
            let mut slots = args.to_vec();
            host_fn.0(&mut slots).map_err(|trap| CallError::Trap {
                backtrace: build_backtrace(module, trap, &[(function_index, 0)]),
            })?;
            slots.truncate(record.sig.results.len());
            return Ok(slots);
        }

        let frame_slots = layout::CALL_FRAME_SLOTS;
        let needed = frame_slots + args.len() as u32 + record.stack_pointer_ceil;
        if needed > self.stack.len() {
            self.stack.grow(needed, self.call_stack_ceiling_slots).map_err(|trap| CallError::Trap {
                backtrace: build_backtrace(module, trap, &[(function_index, 0)]),
            })?;
        }

        let frame_base = 0u32;
        CallFrame::ROOT.write(self.stack.slice_mut(frame_base, frame_slots), 0);
        let args_base = frame_base + frame_slots;
        for (i, &a) in args.iter().enumerate() {
            self.stack.set_slot(args_base + i as u32, a);
        }
        self.stack.set_pointer(args_base);

        let mut resume_at = module.entry_ptr(function_index);
        let mut current_function = function_index;

        loop {
            self.invoke_native(resume_at, ctx);

            let Some(status) = self.exit_context.status() else {
                panic!("native code wrote an unrecognized exit status");
            };

            match status {
                ExitStatus::Returned => {
                    return Ok(self.read_results(args_base, record.sig.results.len()));
                }
                ExitStatus::CallHostFunction => {
                    let return_address = self.exit_context.return_address as *const u8;
                    current_function = module
                        .function_index_for_address(return_address)
                        .unwrap_or(current_function);
                    let callee = &module.functions[current_function];
                    let Some(host_fn) = &callee.host_fn else {
                        panic!("CallHostFunction exit from a non-host function record");
                    };
                    let arg_count = callee.sig.params.len() as u32;
                    let mut slots = self.stack.slice(args_base, arg_count).to_vec();
                    if let Err(trap) = host_fn.0(&mut slots) {
                        return Err(CallError::Trap {
                            backtrace: self.build_current_backtrace(module, trap, args_base, current_function),
                        });
                    }
                    for (i, v) in slots.iter().take(callee.sig.results.len()).enumerate() {
                        self.stack.set_slot(args_base + i as u32, *v);
                    }
                    resume_at = return_address;
                }
                ExitStatus::CallBuiltinFunction => {
                    if let Err(trap) = self.service_builtin(ctx, args_base) {
                        return Err(CallError::Trap {
                            backtrace: self.build_current_backtrace(module, trap, args_base, current_function),
                        });
                    }
                    if self.canceled.load(Ordering::Relaxed) {
                        return Err(CallError::Canceled);
                    }
                    resume_at = self.exit_context.return_address as *const u8;
                }
                other => {
                    let trap = other.trap_code();
                    return Err(CallError::Trap {
                        backtrace: self.build_current_backtrace(module, trap, args_base, current_function),
                    });
                }
            }
        }
    }

    fn read_results(&self, args_base: u32, count: usize) -> Vec<u64> {
        (0..count as u32).map(|i| self.stack.slot(args_base + i)).collect()
    }

    fn build_current_backtrace(
        &self,
        module: &CompiledModule,
        trap: TrapCode,
        base: u32,
        function_index: usize,
    ) -> Backtrace {
        let mut walk = Vec::new();
        let mut cursor = base;
        let mut fn_index = function_index;
        loop {
            let frame_base = cursor.saturating_sub(layout::CALL_FRAME_SLOTS);
            let frame = CallFrame::read(self.stack.slice(frame_base, layout::CALL_FRAME_SLOTS), 0);
            walk.push((fn_index, frame.return_address as u32));
            if frame.is_root() {
                break;
            }
            fn_index = module
                .function_index_for_address(frame.caller_function_ptr as *const u8)
                .unwrap_or(fn_index);
            cursor = frame.caller_stack_base_pointer;
        }
        build_backtrace(module, trap, &walk)
    }

    /// Service one `ExitStatus::CallBuiltinFunction` request. `args_base` is
    /// where the builtin's own operands were pushed, mirroring how a host
    /// call's arguments are read.
    fn service_builtin(&mut self, ctx: &mut ModuleContext, args_base: u32) -> Result<(), TrapCode> {
        let Some(builtin) = self.exit_context.builtin_index() else {
            panic!("CallBuiltinFunction exit carried an unrecognized builtin index");
        };
        match builtin {
            BuiltinIndex::MemoryGrow => {
                let delta = self.stack.slot(args_base) as u32;
                let result = match &self.memory_grower {
                    Some(grower) => grower.grow(ctx, delta).map(|prev| prev as u64).unwrap_or(u64::MAX),
                    None => u64::MAX,
                };
                self.stack.set_slot(args_base, result);
                Ok(())
            }
            BuiltinIndex::TableGrow => {
                let delta = self.stack.slot(args_base) as u32;
                let fill_value = self.stack.slot(args_base + 1);
                let result = match &self.table_grower {
                    Some(grower) => grower.grow(ctx, delta, fill_value).map(|prev| prev as u64).unwrap_or(u64::MAX),
                    None => u64::MAX,
                };
                self.stack.set_slot(args_base, result);
                Ok(())
            }
            BuiltinIndex::StackGrow => {
                let ceiling_needed = self.stack.slot(args_base) as u32;
                self.stack.grow(ceiling_needed, self.call_stack_ceiling_slots)
            }
            BuiltinIndex::ObserverBefore => {
                self.observers.push(ObserverSnapshot {
                    function_debug_name: String::new(),
                    module_name: String::new(),
                    slots: self.stack.slice(args_base, 0).to_vec(),
                });
                Ok(())
            }
            BuiltinIndex::ObserverAfter => {
                self.observers.pop();
                Ok(())
            }
            BuiltinIndex::CheckExitCode => {
                // Nothing to do here beyond the cancellation check the
                // caller performs right after; this builtin exists purely
                // as a periodic safepoint for cooperative cancellation.
                Ok(())
            }
            BuiltinIndex::Breakpoint => {
                if !self.debug_breakpoints {
                    panic!("breakpoint builtin reached with debug_breakpoints disabled");
                }
                Ok(())
            }
            BuiltinIndex::MemoryCopy => {
                let dst = self.stack.slot(args_base) as usize;
                let src = self.stack.slot(args_base + 1) as usize;
                let len = self.stack.slot(args_base + 2) as usize;
                let mem = ctx.memory_mut();
                let (dst_end, src_end) = (dst.checked_add(len), src.checked_add(len));
                if !matches!((dst_end, src_end), (Some(d), Some(s)) if d <= mem.len() && s <= mem.len()) {
                    return Err(TrapCode::MemoryOutOfBounds);
                }
                // `copy_within` is memmove-equivalent: correct even when the
                // two ranges overlap, which `memory.copy` explicitly allows.
                mem.copy_within(src..src + len, dst);
                Ok(())
            }
            BuiltinIndex::MemoryFill => {
                let dst = self.stack.slot(args_base) as usize;
                let value = self.stack.slot(args_base + 1) as u8;
                let len = self.stack.slot(args_base + 2) as usize;
                let mem = ctx.memory_mut();
                let Some(end) = dst.checked_add(len) else {
                    return Err(TrapCode::MemoryOutOfBounds);
                };
                if end > mem.len() {
                    return Err(TrapCode::MemoryOutOfBounds);
                }
                mem[dst..end].fill(value);
                Ok(())
            }
            BuiltinIndex::TableCopy => {
                let dst = self.stack.slot(args_base) as usize;
                let src = self.stack.slot(args_base + 1) as usize;
                let len = self.stack.slot(args_base + 2) as usize;
                let table_len = unsafe { *ctx.table_lens_ptr } as usize;
                let (dst_end, src_end) = (dst.checked_add(len), src.checked_add(len));
                if !matches!((dst_end, src_end), (Some(d), Some(s)) if d <= table_len && s <= table_len) {
                    return Err(TrapCode::InvalidTableAccess);
                }
                let table = unsafe { std::slice::from_raw_parts_mut(ctx.tables_ptr, table_len) };
                table.copy_within(src..src + len, dst);
                Ok(())
            }
            BuiltinIndex::TableFill => {
                let dst = self.stack.slot(args_base) as usize;
                let value = self.stack.slot(args_base + 1);
                let len = self.stack.slot(args_base + 2) as usize;
                let table_len = unsafe { *ctx.table_lens_ptr } as usize;
                let Some(end) = dst.checked_add(len) else {
                    return Err(TrapCode::InvalidTableAccess);
                };
                if end > table_len {
                    return Err(TrapCode::InvalidTableAccess);
                }
                let table = unsafe { std::slice::from_raw_parts_mut(ctx.tables_ptr, table_len) };
                table[dst..end].fill(value);
                Ok(())
            }
        }
    }

    /// Call into native code at `entry`, passing the current value stack
    /// and context pointers, and catching a host panic so it becomes an
    /// ordinary `Result` instead of unwinding across the FFI boundary.
    fn invoke_native(&mut self, entry: *const u8, ctx: *mut ModuleContext) {
        let entry_fn: NativeEntryFn = unsafe { std::mem::transmute(entry) };
        let stack_ptr = self.stack.as_mut_ptr();
        let exit_ptr = &mut self.exit_context as *mut ExitContext;
        let ctx_ptr = ctx as *const ModuleContext;
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| unsafe {
            entry_fn(stack_ptr, ctx_ptr, exit_ptr)
        }));
        if outcome.is_err() {
            self.exit_context.status = ExitStatus::Unreachable as u64;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;
    use wazine_engine::Engine;
    use wazine_types::{CompilationResult, FuncType, FunctionBody, FunctionIr, ValType};

    fn host_echo_module() -> CompilationResult {
        CompilationResult {
            module_name: "host-echo".to_string(),
            functions: vec![FunctionIr {
                debug_name: "env.echo".to_string(),
                sig: FuncType::new(vec![ValType::I32], vec![ValType::I32]),
                body: FunctionBody::Host(wazine_types::HostFunctionHandle(StdArc::new(|slots: &mut [u64]| {
                    slots[0] *= 2;
                    Ok(())
                }))),
                type_id: 0,
            }],
            termination_support: false,
        }
    }

    fn blank_module_context() -> ModuleContext {
        ModuleContext {
            globals_ptr: std::ptr::null_mut(),
            memory_ptr: std::ptr::null_mut(),
            memory_len: 0,
            tables_ptr: std::ptr::null_mut(),
            table_lens_ptr: std::ptr::null_mut(),
            functions_ptr: std::ptr::null_mut(),
            type_ids_ptr: std::ptr::null_mut(),
            data_segments_ptr: std::ptr::null_mut(),
            elem_segments_ptr: std::ptr::null_mut(),
            memory_instance_ptr: std::ptr::null_mut(),
        }
    }

    #[test]
    fn calling_a_host_function_directly_skips_native_entry() {
        let engine = Engine::new(wazine_engine::EngineConfig::default());
        let result = host_echo_module();
        let module = engine.compile_module(&result).unwrap();
        let mut executor = Executor::new(engine.config()).unwrap();
        let mut ctx = blank_module_context();
        let results = executor.call(&module, &mut ctx, 0, &[21]).unwrap();
        assert_eq!(results, vec![42]);
    }

    #[test]
    fn arity_mismatch_is_rejected_before_touching_the_stack() {
        let engine = Engine::new(wazine_engine::EngineConfig::default());
        let result = host_echo_module();
        let module = engine.compile_module(&result).unwrap();
        let mut executor = Executor::new(engine.config()).unwrap();
        let mut ctx = blank_module_context();
        let err = executor.call(&module, &mut ctx, 0, &[]).unwrap_err();
        assert!(matches!(err, CallError::ArityMismatch { .. }));
    }

    struct FixedGrower(u32);
    impl MemoryGrower for FixedGrower {
        fn grow(&self, _ctx: &mut ModuleContext, _delta_pages: u32) -> Option<u32> {
            Some(self.0)
        }
    }

    #[test]
    fn memory_grow_builtin_writes_back_the_previous_size() {
        let engine = Engine::new(wazine_engine::EngineConfig::default());
        let mut executor = Executor::new(engine.config()).unwrap().with_memory_grower(Box::new(FixedGrower(3)));
        let mut ctx = blank_module_context();
        executor.stack = ValueStack::new(8);
        executor.stack.set_slot(0, 1);
        executor.exit_context.builtin_index = BuiltinIndex::MemoryGrow as u64;
        executor.service_builtin(&mut ctx, 0).unwrap();
        assert_eq!(executor.stack.slot(0), 3);
    }

    #[test]
    fn memory_copy_builtin_moves_overlapping_ranges_correctly() {
        let engine = Engine::new(wazine_engine::EngineConfig::default());
        let mut executor = Executor::new(engine.config()).unwrap();
        let mut backing = vec![1u8, 2, 3, 4, 5, 6, 7, 8];
        let mut ctx = blank_module_context();
        ctx.memory_ptr = backing.as_mut_ptr();
        ctx.memory_len = backing.len() as u64;
        executor.stack = ValueStack::new(8);
        executor.stack.set_slot(0, 2); // dst
        executor.stack.set_slot(1, 0); // src
        executor.stack.set_slot(2, 4); // len, overlaps [0..4) into [2..6)
        executor.exit_context.builtin_index = BuiltinIndex::MemoryCopy as u64;
        executor.service_builtin(&mut ctx, 0).unwrap();
        assert_eq!(backing, vec![1, 2, 1, 2, 3, 4, 7, 8]);
    }

    #[test]
    fn memory_copy_builtin_traps_on_out_of_bounds_range() {
        let engine = Engine::new(wazine_engine::EngineConfig::default());
        let mut executor = Executor::new(engine.config()).unwrap();
        let mut backing = vec![0u8; 4];
        let mut ctx = blank_module_context();
        ctx.memory_ptr = backing.as_mut_ptr();
        ctx.memory_len = backing.len() as u64;
        executor.stack = ValueStack::new(8);
        executor.stack.set_slot(0, 0);
        executor.stack.set_slot(1, 0);
        executor.stack.set_slot(2, 5); // past the 4-byte memory
        executor.exit_context.builtin_index = BuiltinIndex::MemoryCopy as u64;
        assert_eq!(executor.service_builtin(&mut ctx, 0), Err(TrapCode::MemoryOutOfBounds));
    }

    #[test]
    fn memory_fill_builtin_writes_the_low_byte_of_the_value() {
        let engine = Engine::new(wazine_engine::EngineConfig::default());
        let mut executor = Executor::new(engine.config()).unwrap();
        let mut backing = vec![0u8; 6];
        let mut ctx = blank_module_context();
        ctx.memory_ptr = backing.as_mut_ptr();
        ctx.memory_len = backing.len() as u64;
        executor.stack = ValueStack::new(8);
        executor.stack.set_slot(0, 1); // dst
        executor.stack.set_slot(1, 0x1_41); // value, low byte is b'A'
        executor.stack.set_slot(2, 3); // len
        executor.exit_context.builtin_index = BuiltinIndex::MemoryFill as u64;
        executor.service_builtin(&mut ctx, 0).unwrap();
        assert_eq!(backing, vec![0, b'A', b'A', b'A', 0, 0]);
    }

    #[test]
    fn table_copy_builtin_moves_funcref_slots() {
        let engine = Engine::new(wazine_engine::EngineConfig::default());
        let mut executor = Executor::new(engine.config()).unwrap();
        let mut table = vec![10u64, 20, 30, 0];
        let mut lens = 4u64;
        let mut ctx = blank_module_context();
        ctx.tables_ptr = table.as_mut_ptr();
        ctx.table_lens_ptr = &mut lens;
        executor.stack = ValueStack::new(8);
        executor.stack.set_slot(0, 1); // dst
        executor.stack.set_slot(1, 0); // src
        executor.stack.set_slot(2, 2); // len
        executor.exit_context.builtin_index = BuiltinIndex::TableCopy as u64;
        executor.service_builtin(&mut ctx, 0).unwrap();
        assert_eq!(table, vec![10, 10, 20, 0]);
    }

    #[test]
    fn table_fill_builtin_traps_when_the_range_runs_past_the_table() {
        let engine = Engine::new(wazine_engine::EngineConfig::default());
        let mut executor = Executor::new(engine.config()).unwrap();
        let mut table = vec![0u64; 2];
        let mut lens = 2u64;
        let mut ctx = blank_module_context();
        ctx.tables_ptr = table.as_mut_ptr();
        ctx.table_lens_ptr = &mut lens;
        executor.stack = ValueStack::new(8);
        executor.stack.set_slot(0, 1);
        executor.stack.set_slot(1, 99);
        executor.stack.set_slot(2, 2); // would touch index 2, out of bounds
        executor.exit_context.builtin_index = BuiltinIndex::TableFill as u64;
        assert_eq!(executor.service_builtin(&mut ctx, 0), Err(TrapCode::InvalidTableAccess));
    }

    #[test]
    fn cancellation_flag_is_observable_after_check_exit_code() {
        let engine = Engine::new(wazine_engine::EngineConfig::default());
        let executor = Executor::new(engine.config()).unwrap();
        let flag = executor.cancellation_flag();
        assert!(!flag.load(Ordering::Relaxed));
        flag.store(true, Ordering::Relaxed);
        assert!(flag.load(Ordering::Relaxed));
    }
}
