//! The executor side of the engine: the value stack, call frames, module
//! and exit context blocks, observer instrumentation, backtraces, and the
//! call loop that ties them together. [`wazine_engine`] compiles and caches
//! code; this crate runs it.

pub mod backtrace;
pub mod call_engine;
pub mod call_frame;
pub mod error;
pub mod exit;
pub mod module_context;
pub mod observer;
pub mod value_stack;

pub use backtrace::{Backtrace, BacktraceFrame};
pub use call_engine::{Executor, MemoryGrower, NativeEntryFn, TableGrower};
pub use call_frame::CallFrame;
pub use error::CallError;
pub use exit::ExitContext;
pub use module_context::ModuleContext;
pub use observer::{ObserverFrame, ObserverSnapshot, ObserverStack};
pub use value_stack::ValueStack;
