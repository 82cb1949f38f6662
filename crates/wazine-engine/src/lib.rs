//! The module registry, compile driver, and code cache coordinator.
//!
//! [`Engine`] owns a readers/writer-locked map of compiled modules;
//! compilation itself happens outside the lock, driven by
//! [`wazine_codegen::compile_module`]. [`code_memory`] owns the executable
//! mappings compiled functions live in; [`cache`] serializes them to and
//! from an embedder-supplied byte store.

pub mod cache;
pub mod code_memory;
pub mod engine;
pub mod error;

pub use code_memory::{CodeMemory, FunctionSlice};
pub use engine::{CompiledFunctionRecord, CompiledModule, Engine, EngineConfig, ModuleCache};
pub use error::EngineError;
