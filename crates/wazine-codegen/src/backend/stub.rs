//! Stub assembler for exercising the compilation pipeline without
//! committing to either target ISA's real encoding.
//!
//! Every emit method appends a single placeholder trap byte. This lets
//! tests walk a full [`crate::compiler::FunctionCompiler`] run — symbolic
//! stack bookkeeping, label resolution, stack-pointer-ceiling tracking —
//! and assert on those, independent of whether the x64/aarch64 encoders are
//! bit-exact.

use crate::masm::{AsmLabel, BinOp, Cond, CodegenError, Gpr, MacroAssembler, UnaryOp, VReg, VecBinOp, Width};
use wazine_types::{ExitStatus, LaneShape, TargetIsa};

const PLACEHOLDER_BYTE: u8 = 0xCC;

/// One recorded call into the assembler, kept around so tests can assert on
/// which operations were emitted and with what arguments instead of only on
/// symbolic-stack bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub enum Emitted {
    MovReg(Gpr, Gpr),
    Load(Gpr, Gpr, i32, Width),
    Store(Gpr, Gpr, i32, Width),
    MovImm(Gpr, i64),
    Binop(BinOp, Gpr, Gpr, Gpr, bool),
    Unop(UnaryOp, Gpr, Gpr, bool),
    Fbinop(BinOp, Gpr, Gpr, Gpr, bool),
    Funop(UnaryOp, Gpr, Gpr, bool),
    Vbinop(VecBinOp, LaneShape, VReg, VReg, VReg),
    VecMulI64x2(VReg, VReg, VReg),
    ConvertIntToFloat(Gpr, Gpr, bool, bool, bool),
    TruncFloatToInt(Gpr, Gpr, bool, bool, bool, bool),
    Compare(Gpr, Gpr, bool),
    BranchIf(Cond, AsmLabel),
    CallReg(Gpr),
    Ret,
    ExitWithStatus(ExitStatus),
    CallBuiltin(u32),
    LoadLabelAddress(Gpr, AsmLabel),
    Other,
}

#[derive(Default)]
pub struct StubAssembler {
    code: Vec<u8>,
    next_label: u32,
    labels: Vec<Option<u32>>,
    trace: Vec<Emitted>,
}

impl StubAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emitted_len(&self) -> usize {
        self.code.len()
    }

    pub fn trace(&self) -> &[Emitted] {
        &self.trace
    }

    fn emit_placeholder(&mut self) {
        self.code.push(PLACEHOLDER_BYTE);
    }

    fn record(&mut self, entry: Emitted) {
        self.trace.push(entry);
        self.emit_placeholder();
    }
}

impl MacroAssembler for StubAssembler {
    fn target(&self) -> TargetIsa {
        TargetIsa::host().unwrap_or(TargetIsa::X64)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn current_offset(&self) -> u32 {
        self.code.len() as u32
    }

    fn new_label(&mut self) -> crate::masm::AsmLabel {
        let id = self.next_label;
        self.next_label += 1;
        self.labels.push(None);
        crate::masm::AsmLabel(id)
    }

    fn bind_label(&mut self, label: crate::masm::AsmLabel) {
        self.labels[label.0 as usize] = Some(self.code.len() as u32);
    }

    fn mov_reg(&mut self, dst: Gpr, src: Gpr) {
        self.record(Emitted::MovReg(dst, src));
    }
    fn mov_vreg(&mut self, _dst: VReg, _src: VReg) {
        self.record(Emitted::Other);
    }
    fn load(&mut self, dst: Gpr, base: Gpr, offset: i32, width: Width, _sign_extend: bool) {
        self.record(Emitted::Load(dst, base, offset, width));
    }
    fn store(&mut self, src: Gpr, base: Gpr, offset: i32, width: Width) {
        self.record(Emitted::Store(src, base, offset, width));
    }
    fn load_vector(&mut self, _dst: VReg, _base: Gpr, _offset: i32) {
        self.record(Emitted::Other);
    }
    fn store_vector(&mut self, _src: VReg, _base: Gpr, _offset: i32) {
        self.record(Emitted::Other);
    }
    fn mov_imm(&mut self, dst: Gpr, imm: i64) {
        self.record(Emitted::MovImm(dst, imm));
    }
    fn load_const_vector(&mut self, _dst: VReg, _bytes: [u8; 16]) {
        self.record(Emitted::Other);
    }
    fn binop(&mut self, op: BinOp, dst: Gpr, lhs: Gpr, rhs: Gpr, is_64: bool) {
        self.record(Emitted::Binop(op, dst, lhs, rhs, is_64));
    }
    fn unop(&mut self, op: UnaryOp, dst: Gpr, src: Gpr, is_64: bool) {
        self.record(Emitted::Unop(op, dst, src, is_64));
    }
    fn fbinop(&mut self, op: BinOp, dst: Gpr, lhs: Gpr, rhs: Gpr, is_f64: bool) {
        self.record(Emitted::Fbinop(op, dst, lhs, rhs, is_f64));
    }
    fn funop(&mut self, op: UnaryOp, dst: Gpr, src: Gpr, is_f64: bool) {
        self.record(Emitted::Funop(op, dst, src, is_f64));
    }
    fn vbinop(&mut self, op: VecBinOp, shape: LaneShape, dst: VReg, lhs: VReg, rhs: VReg) {
        self.record(Emitted::Vbinop(op, shape, dst, lhs, rhs));
    }
    fn vunop(&mut self, _op: UnaryOp, _shape: LaneShape, _dst: VReg, _src: VReg) {
        self.record(Emitted::Other);
    }
    fn vec_mul_i64x2(&mut self, dst: VReg, lhs: VReg, rhs: VReg) {
        self.record(Emitted::VecMulI64x2(dst, lhs, rhs));
    }
    fn convert_int_to_float(&mut self, dst: Gpr, src: Gpr, dst_is_f64: bool, src_is_64: bool, signed: bool) {
        self.record(Emitted::ConvertIntToFloat(dst, src, dst_is_f64, src_is_64, signed));
    }
    fn trunc_float_to_int(
        &mut self,
        dst: Gpr,
        src: Gpr,
        src_is_f64: bool,
        dst_is_64: bool,
        signed: bool,
        saturating: bool,
        _exit_context_base: Gpr,
    ) {
        self.record(Emitted::TruncFloatToInt(dst, src, src_is_f64, dst_is_64, signed, saturating));
    }
    fn compare(&mut self, lhs: Gpr, rhs: Gpr, is_64: bool) {
        self.record(Emitted::Compare(lhs, rhs, is_64));
    }
    fn fcompare(&mut self, _lhs: Gpr, _rhs: Gpr, _is_f64: bool) {
        self.record(Emitted::Other);
    }
    fn set_from_flags(&mut self, _dst: Gpr, _cond: Cond) {
        self.record(Emitted::Other);
    }
    fn jmp(&mut self, _label: crate::masm::AsmLabel) {
        self.record(Emitted::Other);
    }
    fn branch_if(&mut self, cond: Cond, label: crate::masm::AsmLabel) {
        self.record(Emitted::BranchIf(cond, label));
    }
    fn call_reg(&mut self, target: Gpr) {
        self.record(Emitted::CallReg(target));
    }
    fn ret(&mut self) {
        self.record(Emitted::Ret);
    }
    fn exit_with_status(&mut self, status: ExitStatus, _exit_context_base: Gpr) {
        self.record(Emitted::ExitWithStatus(status));
    }
    fn call_builtin(&mut self, builtin_index: u32, _exit_context_base: Gpr) {
        self.record(Emitted::CallBuiltin(builtin_index));
    }
    fn load_label_address(&mut self, dst: Gpr, label: crate::masm::AsmLabel) {
        self.record(Emitted::LoadLabelAddress(dst, label));
    }

    fn finish(self: Box<Self>) -> Vec<u8> {
        self.code
    }
}

/// Stub assemblers never produce a function worth executing; `compile` only
/// exists so the pipeline (not the real encoders) can be smoke-tested. Any
/// attempt to actually run stub-emitted bytes is a test bug.
pub fn assert_never_executed() -> Result<(), CodegenError> {
    Err(CodegenError::Backend("stub backend output must not be executed".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_resolve_to_offsets() {
        let mut asm = StubAssembler::new();
        let label = asm.new_label();
        asm.mov_reg(Gpr(0), Gpr(1));
        asm.bind_label(label);
        assert_eq!(asm.labels[label.0 as usize], Some(1));
    }

    #[test]
    fn every_op_appends_one_byte() {
        let mut asm = StubAssembler::new();
        asm.mov_imm(Gpr(0), 42);
        asm.ret();
        assert_eq!(asm.emitted_len(), 2);
    }
}
