//! The exit-status / trap taxonomy that crosses the native/host boundary.
//!
//! Native code never constructs a [`TrapCode`] or an [`EngineError`] — it
//! only ever writes one of these numeric [`ExitStatus`] codes into the exit
//! context and returns. The executor is the only place a status is turned
//! into a typed, user-visible error.

use std::fmt;

/// Bit-exact status codes written by generated code into the exit context.
/// The discriminants are load-bearing: native code embeds them as
/// immediates, so reordering this enum without updating the code generator
/// silently breaks every compiled function in existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ExitStatus {
    Returned = 0,
    CallHostFunction = 1,
    CallBuiltinFunction = 2,
    Unreachable = 3,
    InvalidFloatToIntConversion = 4,
    MemoryOutOfBounds = 5,
    InvalidTableAccess = 6,
    IndirectCallTypeMismatch = 7,
    IntegerOverflow = 8,
    IntegerDivisionByZero = 9,
    ModuleClosed = 10,
}

impl ExitStatus {
    pub const fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0 => ExitStatus::Returned,
            1 => ExitStatus::CallHostFunction,
            2 => ExitStatus::CallBuiltinFunction,
            3 => ExitStatus::Unreachable,
            4 => ExitStatus::InvalidFloatToIntConversion,
            5 => ExitStatus::MemoryOutOfBounds,
            6 => ExitStatus::InvalidTableAccess,
            7 => ExitStatus::IndirectCallTypeMismatch,
            8 => ExitStatus::IntegerOverflow,
            9 => ExitStatus::IntegerDivisionByZero,
            10 => ExitStatus::ModuleClosed,
            _ => return None,
        })
    }

    /// Whether this status represents a WebAssembly-defined trap (as opposed
    /// to a normal return or a request for host service).
    pub const fn is_trap(self) -> bool {
        !matches!(
            self,
            ExitStatus::Returned | ExitStatus::CallHostFunction | ExitStatus::CallBuiltinFunction
        )
    }

    /// Convert a trap-shaped status into its [`TrapCode`]. Panics (a
    /// programming-error panic, not a WebAssembly trap) if called on a
    /// non-trap status — callers must check [`is_trap`](Self::is_trap) first.
    pub fn trap_code(self) -> TrapCode {
        match self {
            ExitStatus::Unreachable => TrapCode::Unreachable,
            ExitStatus::InvalidFloatToIntConversion => TrapCode::InvalidFloatToIntConversion,
            ExitStatus::MemoryOutOfBounds => TrapCode::MemoryOutOfBounds,
            ExitStatus::InvalidTableAccess => TrapCode::InvalidTableAccess,
            ExitStatus::IndirectCallTypeMismatch => TrapCode::IndirectCallTypeMismatch,
            ExitStatus::IntegerOverflow => TrapCode::IntegerOverflow,
            ExitStatus::IntegerDivisionByZero => TrapCode::IntegerDivisionByZero,
            ExitStatus::ModuleClosed => TrapCode::ModuleClosed,
            other => panic!("{other:?} is not a trap status"),
        }
    }
}

/// User-visible trap kind. Unlike [`ExitStatus`] this never crosses into
/// native code — it is only ever constructed by the executor once a trap
/// status has been observed at the native/host boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TrapCode {
    #[error("unreachable executed")]
    Unreachable,
    #[error("invalid float-to-int conversion")]
    InvalidFloatToIntConversion,
    #[error("out of bounds memory access")]
    MemoryOutOfBounds,
    #[error("invalid table access")]
    InvalidTableAccess,
    #[error("indirect call type mismatch")]
    IndirectCallTypeMismatch,
    #[error("integer overflow")]
    IntegerOverflow,
    #[error("integer division by zero")]
    IntegerDivisionByZero,
    #[error("module closed")]
    ModuleClosed,
    /// Raised by the executor itself (not a native-code exit status) when a
    /// function call would grow the value stack past the call-stack ceiling.
    #[error("stack overflow")]
    StackOverflow,
}

/// A builtin the executor can be asked to service via
/// [`ExitStatus::CallBuiltinFunction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BuiltinIndex {
    MemoryGrow = 0,
    StackGrow = 1,
    TableGrow = 2,
    ObserverBefore = 3,
    ObserverAfter = 4,
    CheckExitCode = 5,
    /// Only reachable when the engine is built with the debug feature; see
    /// `EngineConfig::debug_breakpoints`.
    Breakpoint = 6,
    MemoryCopy = 7,
    MemoryFill = 8,
    TableCopy = 9,
    TableFill = 10,
}

impl BuiltinIndex {
    pub const fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0 => BuiltinIndex::MemoryGrow,
            1 => BuiltinIndex::StackGrow,
            2 => BuiltinIndex::TableGrow,
            3 => BuiltinIndex::ObserverBefore,
            4 => BuiltinIndex::ObserverAfter,
            5 => BuiltinIndex::CheckExitCode,
            6 => BuiltinIndex::Breakpoint,
            7 => BuiltinIndex::MemoryCopy,
            8 => BuiltinIndex::MemoryFill,
            9 => BuiltinIndex::TableCopy,
            10 => BuiltinIndex::TableFill,
            _ => return None,
        })
    }
}

impl fmt::Display for BuiltinIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BuiltinIndex::MemoryGrow => "memory.grow",
            BuiltinIndex::StackGrow => "stack.grow",
            BuiltinIndex::TableGrow => "table.grow",
            BuiltinIndex::ObserverBefore => "observer.before",
            BuiltinIndex::ObserverAfter => "observer.after",
            BuiltinIndex::CheckExitCode => "check-exit-code",
            BuiltinIndex::Breakpoint => "breakpoint",
            BuiltinIndex::MemoryCopy => "memory.copy",
            BuiltinIndex::MemoryFill => "memory.fill",
            BuiltinIndex::TableCopy => "table.copy",
            BuiltinIndex::TableFill => "table.fill",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_discriminants_are_bit_exact() {
        assert_eq!(ExitStatus::Returned as u32, 0);
        assert_eq!(ExitStatus::CallHostFunction as u32, 1);
        assert_eq!(ExitStatus::CallBuiltinFunction as u32, 2);
        assert_eq!(ExitStatus::Unreachable as u32, 3);
        assert_eq!(ExitStatus::InvalidFloatToIntConversion as u32, 4);
        assert_eq!(ExitStatus::MemoryOutOfBounds as u32, 5);
        assert_eq!(ExitStatus::InvalidTableAccess as u32, 6);
        assert_eq!(ExitStatus::IndirectCallTypeMismatch as u32, 7);
        assert_eq!(ExitStatus::IntegerOverflow as u32, 8);
        assert_eq!(ExitStatus::IntegerDivisionByZero as u32, 9);
        assert_eq!(ExitStatus::ModuleClosed as u32, 10);
    }

    #[test]
    fn builtin_discriminants_are_bit_exact() {
        assert_eq!(BuiltinIndex::MemoryGrow as u32, 0);
        assert_eq!(BuiltinIndex::StackGrow as u32, 1);
        assert_eq!(BuiltinIndex::TableGrow as u32, 2);
        assert_eq!(BuiltinIndex::ObserverBefore as u32, 3);
        assert_eq!(BuiltinIndex::ObserverAfter as u32, 4);
        assert_eq!(BuiltinIndex::CheckExitCode as u32, 5);
        assert_eq!(BuiltinIndex::Breakpoint as u32, 6);
        assert_eq!(BuiltinIndex::MemoryCopy as u32, 7);
        assert_eq!(BuiltinIndex::MemoryFill as u32, 8);
        assert_eq!(BuiltinIndex::TableCopy as u32, 9);
        assert_eq!(BuiltinIndex::TableFill as u32, 10);
    }

    #[test]
    fn builtin_round_trips_through_u32() {
        for raw in 0..=10u32 {
            let builtin = BuiltinIndex::from_u32(raw).unwrap();
            assert_eq!(builtin as u32, raw);
        }
        assert!(BuiltinIndex::from_u32(11).is_none());
    }

    #[test]
    fn round_trips_through_u32() {
        for raw in 0..=10u32 {
            let status = ExitStatus::from_u32(raw).unwrap();
            assert_eq!(status as u32, raw);
        }
        assert!(ExitStatus::from_u32(11).is_none());
    }

    #[test]
    fn trap_statuses_map_to_trap_codes() {
        assert_eq!(ExitStatus::MemoryOutOfBounds.trap_code(), TrapCode::MemoryOutOfBounds);
        assert!(ExitStatus::Unreachable.is_trap());
        assert!(!ExitStatus::Returned.is_trap());
        assert!(!ExitStatus::CallHostFunction.is_trap());
    }
}
