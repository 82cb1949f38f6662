//! Errors raised by the executor. Converted from exit statuses or raised
//! directly for host-visible lifecycle conditions the executor observes
//! before any native code runs.

use crate::backtrace::Backtrace as TrapBacktrace;
use thiserror::Error;
use wazine_types::ValType;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("argument arity mismatch: expected {expected:?}, got {actual} values")]
    ArityMismatch { expected: Vec<ValType>, actual: usize },

    #[error("trap: {}", .backtrace.trap)]
    Trap { backtrace: TrapBacktrace },

    #[error("module `{0}` is closed")]
    ModuleClosed(String),

    #[error("context canceled")]
    Canceled,
}
