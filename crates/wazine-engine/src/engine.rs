//! The top-level engine: module registry, compile driver, and cache
//! coordinator.

use crate::cache::{self, CachedFunction, ReadOutcome};
use crate::code_memory::{CodeMemory, FunctionSlice};
use crate::error::EngineError;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use wazine_codegen::compile_module as codegen_compile_module;
use wazine_types::{CompilationResult, FuncType, TargetIsa};

/// Where compiled code is persisted between process runs. The engine never
/// assumes a particular backing store; anything that can read/write a byte
/// stream per module name works.
pub trait ModuleCache: Send + Sync {
    fn load(&self, module_name: &str) -> Option<Vec<u8>>;
    fn store(&self, module_name: &str, bytes: &[u8]);
}

/// Knobs fixed for the lifetime of an [`Engine`].
pub struct EngineConfig {
    pub target: TargetIsa,
    /// Whether compiled functions get check-exit-code trampolines at entry
    /// points and loop headers so cooperative cancellation can be observed.
    pub termination_support: bool,
    /// Tag embedded in cache file headers; bumping it invalidates every
    /// previously cached module without touching the on-disk bytes.
    pub cache_version: String,
    /// Upper bound on value-stack growth, in 8-byte slots.
    pub call_stack_ceiling_slots: u32,
    /// Gate for `BuiltinIndex::Breakpoint`; false unless the embedder opts
    /// into a debug build.
    pub debug_breakpoints: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            target: TargetIsa::host().unwrap_or(TargetIsa::X64),
            termination_support: false,
            cache_version: "1".to_string(),
            call_stack_ceiling_slots: 5_000_000,
            debug_breakpoints: false,
        }
    }
}

/// One function's compiled record as held by the module registry: its entry
/// point, signature, and stack-ceiling watermark. Imported functions share
/// the exporting module's record rather than copying it.
pub struct CompiledFunctionRecord {
    pub debug_name: String,
    pub sig: FuncType,
    pub entry: FunctionSlice,
    pub stack_pointer_ceil: u32,
    pub source_offsets: Vec<wazine_types::SourceOffsetEntry>,
    pub is_host: bool,
    /// Present only for host functions; the executor invokes this directly
    /// once it observes `ExitStatus::CallHostFunction` for this function's
    /// trampoline rather than treating it as a jump target.
    pub host_fn: Option<wazine_types::HostFunctionHandle>,
}

/// A fully compiled module: its executable mapping plus one record per
/// function. Held behind `Arc` so in-flight calls keep the mapping alive
/// after the module is closed (see resource policy on scoped code-page
/// ownership).
pub struct CompiledModule {
    pub name: String,
    pub code: CodeMemory,
    pub functions: Vec<CompiledFunctionRecord>,
}

impl CompiledModule {
    pub fn entry_ptr(&self, function_index: usize) -> *const u8 {
        self.code.entry_ptr(self.functions[function_index].entry)
    }

    /// Resolve a raw return address (as captured in an exit context or a
    /// call frame) back to the function whose code range contains it. Used
    /// by the executor to recover which function triggered a given exit and
    /// to walk a backtrace without carrying a separate index alongside every
    /// function pointer.
    pub fn function_index_for_address(&self, addr: *const u8) -> Option<usize> {
        let addr = addr as usize;
        self.functions.iter().position(|f| {
            let base = self.code.entry_ptr(f.entry) as usize;
            addr >= base && addr < base + f.entry.len
        })
    }
}

/// The module registry and compile driver.
pub struct Engine {
    config: EngineConfig,
    modules: RwLock<FxHashMap<String, Arc<CompiledModule>>>,
    cache: Option<Box<dyn ModuleCache>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Engine { config, modules: RwLock::new(FxHashMap::default()), cache: None }
    }

    pub fn with_cache(config: EngineConfig, cache: Box<dyn ModuleCache>) -> Self {
        Engine { config, modules: RwLock::new(FxHashMap::default()), cache: Some(cache) }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn module_count(&self) -> usize {
        self.modules.read().len()
    }

    /// Compile `result` if it isn't already registered under its module
    /// name; idempotent on a cache hit. Host modules (any function with a
    /// host body) are never cached, per policy.
    pub fn compile_module(&self, result: &CompilationResult) -> Result<Arc<CompiledModule>, EngineError> {
        if let Some(existing) = self.modules.read().get(&result.module_name) {
            return Ok(Arc::clone(existing));
        }

        let cacheable = !result.contains_host_function();

        if cacheable {
            if let Some(cached) = self.try_load_from_cache(result)? {
                let compiled = Arc::new(cached);
                self.modules.write().insert(result.module_name.clone(), Arc::clone(&compiled));
                return Ok(compiled);
            }
        }

        let compiled_module = codegen_compile_module(result, self.config.target).map_err(|source| {
            let function = result
                .functions
                .first()
                .map(|f| f.debug_name.clone())
                .unwrap_or_else(|| "<unknown>".to_string());
            EngineError::Compile { module: result.module_name.clone(), function, source }
        })?;

        let code_vecs: Vec<Vec<u8>> = compiled_module.functions.iter().map(|f| f.code.clone()).collect();
        let (code_memory, slices) = CodeMemory::new(&result.module_name, &code_vecs)
            .map_err(|source| EngineError::CodeMap { module: result.module_name.clone(), source })?;

        let records = result
            .functions
            .iter()
            .zip(compiled_module.functions.iter())
            .zip(slices.iter())
            .map(|((ir, compiled), &slice)| CompiledFunctionRecord {
                debug_name: ir.debug_name.clone(),
                sig: ir.sig.clone(),
                entry: slice,
                stack_pointer_ceil: compiled.stack_pointer_ceil,
                source_offsets: compiled.source_offsets.clone(),
                is_host: ir.is_host(),
                host_fn: match &ir.body {
                    wazine_types::FunctionBody::Host(handle) => Some(handle.clone()),
                    wazine_types::FunctionBody::Defined { .. } => None,
                },
            })
            .collect();

        let compiled = Arc::new(CompiledModule { name: result.module_name.clone(), code: code_memory, functions: records });

        if cacheable {
            self.store_to_cache(&compiled, &compiled_module);
        }

        self.modules.write().insert(result.module_name.clone(), Arc::clone(&compiled));
        Ok(compiled)
    }

    fn try_load_from_cache(&self, result: &CompilationResult) -> Result<Option<CompiledModule>, EngineError> {
        let Some(cache) = &self.cache else { return Ok(None) };
        let Some(bytes) = cache.load(&result.module_name) else { return Ok(None) };

        let mut cursor = std::io::Cursor::new(bytes);
        let outcome = cache::read_module(&mut cursor, &self.config.cache_version)
            .map_err(|source| EngineError::CacheIo { module: result.module_name.clone(), source })?;

        let cached_functions = match outcome {
            ReadOutcome::Fresh(functions) => functions,
            ReadOutcome::Stale => return Ok(None),
        };

        if cached_functions.len() != result.functions.len() {
            return Ok(None);
        }

        let (code_memory, slices) = cache::load_into_code_memory(&result.module_name, &cached_functions)
            .map_err(|source| EngineError::CodeMap { module: result.module_name.clone(), source })?;

        let records = result
            .functions
            .iter()
            .zip(cached_functions.iter())
            .zip(slices.iter())
            .map(|((ir, cached), &slice)| CompiledFunctionRecord {
                debug_name: ir.debug_name.clone(),
                sig: ir.sig.clone(),
                entry: slice,
                stack_pointer_ceil: cached.stack_pointer_ceil as u32,
                source_offsets: Vec::new(),
                // Host functions are never cached (see `contains_host_function`
                // gating above), so a cache hit never carries one.
                is_host: ir.is_host(),
                host_fn: None,
            })
            .collect();

        Ok(Some(CompiledModule { name: result.module_name.clone(), code: code_memory, functions: records }))
    }

    fn store_to_cache(&self, compiled: &CompiledModule, codegen_output: &wazine_codegen::CompiledModule) {
        let Some(cache) = &self.cache else { return };
        let cached_functions: Vec<CachedFunction> = codegen_output
            .functions
            .iter()
            .map(|f| CachedFunction { stack_pointer_ceil: f.stack_pointer_ceil as u64, code: f.code.clone() })
            .collect();
        let mut buf = Vec::new();
        if cache::write_module(&mut buf, &self.config.cache_version, &cached_functions).is_ok() {
            cache.store(&compiled.name, &buf);
        }
    }

    /// Drop this module's registry entry. Idempotent; in-flight calls keep
    /// their own `Arc<CompiledModule>` alive regardless.
    pub fn delete_module(&self, name: &str) {
        self.modules.write().remove(name);
    }

    pub fn close(&self) {
        self.modules.write().clear();
    }

    pub fn lookup_module(&self, name: &str) -> Option<Arc<CompiledModule>> {
        self.modules.read().get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wazine_types::{FunctionBody, FunctionIr, Operator, ValType};

    fn sample_result(name: &str) -> CompilationResult {
        CompilationResult {
            module_name: name.to_string(),
            functions: vec![FunctionIr {
                debug_name: "add".to_string(),
                sig: FuncType::new(vec![ValType::I32, ValType::I32], vec![ValType::I32]),
                body: FunctionBody::Defined {
                    operators: vec![
                        Operator::LocalGet { index: 0 },
                        Operator::LocalGet { index: 1 },
                        Operator::Add { ty: ValType::I32 },
                        Operator::Return,
                    ],
                    locals: vec![],
                },
                type_id: 0,
            }],
            termination_support: false,
        }
    }

    #[test]
    fn compiling_twice_is_idempotent() {
        let engine = Engine::new(EngineConfig::default());
        let result = sample_result("m1");
        let first = engine.compile_module(&result).unwrap();
        let second = engine.compile_module(&result).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(engine.module_count(), 1);
    }

    #[test]
    fn delete_then_recompile_produces_a_new_record() {
        let engine = Engine::new(EngineConfig::default());
        let result = sample_result("m2");
        let first = engine.compile_module(&result).unwrap();
        engine.delete_module("m2");
        assert_eq!(engine.module_count(), 0);
        let second = engine.compile_module(&result).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    struct InMemoryCache(parking_lot::Mutex<FxHashMap<String, Vec<u8>>>);

    impl ModuleCache for InMemoryCache {
        fn load(&self, module_name: &str) -> Option<Vec<u8>> {
            self.0.lock().get(module_name).cloned()
        }
        fn store(&self, module_name: &str, bytes: &[u8]) {
            self.0.lock().insert(module_name.to_string(), bytes.to_vec());
        }
    }

    #[test]
    fn cache_hit_avoids_recompiling_but_still_produces_a_working_module() {
        let cache = Box::new(InMemoryCache(parking_lot::Mutex::new(FxHashMap::default())));
        let engine = Engine::with_cache(EngineConfig::default(), cache);
        let result = sample_result("m3");
        let first = engine.compile_module(&result).unwrap();
        engine.delete_module("m3");
        let second = engine.compile_module(&result).unwrap();
        assert_eq!(first.functions.len(), second.functions.len());
    }

    #[test]
    fn host_module_is_never_cached() {
        use std::sync::Arc as StdArc;
        let cache = Box::new(InMemoryCache(parking_lot::Mutex::new(FxHashMap::default())));
        let engine = Engine::with_cache(EngineConfig::default(), cache);
        let result = CompilationResult {
            module_name: "host-mod".to_string(),
            functions: vec![FunctionIr {
                debug_name: "env.log".to_string(),
                sig: FuncType::new(vec![ValType::I32], vec![]),
                body: FunctionBody::Host(wazine_types::HostFunctionHandle(StdArc::new(|_| Ok(())))),
                type_id: 0,
            }],
            termination_support: false,
        };
        engine.compile_module(&result).unwrap();
        // No assertion on the cache's internal map (private); this just
        // exercises the host-module path end to end without panicking.
    }
}
