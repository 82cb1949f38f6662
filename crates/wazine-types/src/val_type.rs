//! Runtime value types tracked by the symbolic operand stack and the IR.

use std::fmt;

/// A WebAssembly value type as seen by the compiler and executor.
///
/// `FuncRef` and `ExternRef` are carried as a single 64-bit slot (a raw
/// pointer-sized reference value or zero for null); they never split across
/// two stack slots the way `V128` does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValType {
    I32,
    I64,
    F32,
    F64,
    V128,
    FuncRef,
    ExternRef,
}

impl ValType {
    /// Number of 8-byte value-stack slots this type occupies.
    pub const fn slot_count(self) -> u32 {
        match self {
            ValType::V128 => 2,
            _ => 1,
        }
    }

    pub const fn is_reference(self) -> bool {
        matches!(self, ValType::FuncRef | ValType::ExternRef)
    }

    pub const fn is_float(self) -> bool {
        matches!(self, ValType::F32 | ValType::F64)
    }

    pub const fn is_vector(self) -> bool {
        matches!(self, ValType::V128)
    }
}

impl fmt::Display for ValType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValType::I32 => "i32",
            ValType::I64 => "i64",
            ValType::F32 => "f32",
            ValType::F64 => "f64",
            ValType::V128 => "v128",
            ValType::FuncRef => "funcref",
            ValType::ExternRef => "externref",
        };
        f.write_str(s)
    }
}

/// A function's parameter and result shape, as recorded on a compiled
/// function and consulted at call sites and by the backtrace builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncType {
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
}

impl FuncType {
    pub fn new(params: Vec<ValType>, results: Vec<ValType>) -> Self {
        FuncType { params, results }
    }

    pub fn param_slot_count(&self) -> u32 {
        self.params.iter().map(|t| t.slot_count()).sum()
    }

    pub fn result_slot_count(&self) -> u32 {
        self.results.iter().map(|t| t.slot_count()).sum()
    }

    /// Stable identity used by `call_indirect` type checks. Two `FuncType`s
    /// with the same shape always hash to the same id within one module,
    /// because the module compiler interns types before compiling bodies.
    pub fn signature_key(&self) -> (Vec<ValType>, Vec<ValType>) {
        (self.params.clone(), self.results.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn v128_occupies_two_slots() {
        assert_eq!(ValType::V128.slot_count(), 2);
        assert_eq!(ValType::I64.slot_count(), 1);
    }

    #[test]
    fn func_type_slot_counts() {
        let ft = FuncType::new(vec![ValType::I32, ValType::V128], vec![ValType::F64]);
        assert_eq!(ft.param_slot_count(), 3);
        assert_eq!(ft.result_slot_count(), 1);
    }

    #[test]
    fn signature_key_matches_shape_not_identity() {
        let a = FuncType::new(vec![ValType::I32, ValType::I64], vec![ValType::F32]);
        let b = FuncType::new(vec![ValType::I32, ValType::I64], vec![ValType::F32]);
        assert_eq!(a.signature_key(), b.signature_key());
    }
}
