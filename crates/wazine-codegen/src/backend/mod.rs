//! Target-specific [`crate::masm::MacroAssembler`] implementations.
//!
//! Exactly one real backend is selected per compiled module, based on
//! [`wazine_types::TargetIsa`]; the per-function compiler is otherwise
//! identical across both.

pub mod aarch64;
pub mod stub;
pub mod x64;

pub use aarch64::Aarch64Assembler;
pub use stub::{Emitted, StubAssembler};
pub use x64::X64Assembler;

use crate::masm::MacroAssembler;
use wazine_types::TargetIsa;

/// Construct the real assembler for `target`. Used by the module compiler;
/// the stub backend is only ever constructed directly by tests that want to
/// exercise the pipeline without committing to either ISA's encoding.
pub fn new_assembler(target: TargetIsa) -> Box<dyn MacroAssembler> {
    match target {
        TargetIsa::X64 => Box::new(X64Assembler::new()),
        TargetIsa::Arm64 => Box::new(Aarch64Assembler::new()),
    }
}
