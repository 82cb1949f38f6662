//! The `MacroAssembler` trait: the opaque instruction-emitter interface the
//! per-function compiler drives. Two modules in [`crate::backend`] implement
//! it, one per target ISA; the compiler never branches on target outside of
//! the backend's own instruction-selection methods (design note "Assembler
//! dependency").

use wazine_types::{ExitStatus, LaneShape, TargetIsa};

/// A general-purpose register, opaque to the compiler beyond its index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Gpr(pub u8);

/// A vector (SIMD) register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VReg(pub u8);

/// A forward/backward branch target. Allocated by [`MacroAssembler::new_label`]
/// and resolved by [`MacroAssembler::bind_label`]; any branch taken before its
/// target is bound is recorded in the backend's own fix-up list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AsmLabel(pub u32);

/// Access width for a scalar load/store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Bits8,
    Bits16,
    Bits32,
    Bits64,
}

impl Width {
    pub const fn bytes(self) -> u32 {
        match self {
            Width::Bits8 => 1,
            Width::Bits16 => 2,
            Width::Bits32 => 4,
            Width::Bits64 => 8,
        }
    }
}

/// Condition under which [`MacroAssembler::branch_if`] is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    Equal,
    NotEqual,
    LessSigned,
    LessUnsigned,
    LessEqualSigned,
    LessEqualUnsigned,
    GreaterSigned,
    GreaterUnsigned,
    GreaterEqualSigned,
    GreaterEqualUnsigned,
}

/// Scalar integer/float binary op, dispatched generically so the compiler
/// does not need one masm method per [`wazine_types::Operator`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    DivSigned,
    DivUnsigned,
    RemSigned,
    RemUnsigned,
    And,
    Or,
    Xor,
    Shl,
    ShrSigned,
    ShrUnsigned,
    Rotl,
    Rotr,
}

/// Vector lane-wise binary op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VecBinOp {
    Add,
    Sub,
    Mul,
    AddSatSigned,
    AddSatUnsigned,
    SubSatSigned,
    SubSatUnsigned,
    MinSigned,
    MinUnsigned,
    MaxSigned,
    MaxUnsigned,
    AvgrUnsigned,
    And,
    AndNot,
    Or,
    Xor,
    /// Lane-wise equality, all-ones/all-zero mask per lane.
    Eq,
    /// Lane-wise signed greater-than mask.
    GtSigned,
    /// Lane-wise unsigned greater-than mask, built from a sign-bit flip plus
    /// a signed compare (no native unsigned packed compare pre-AVX512).
    GtUnsigned,
    /// Ordered float equality mask (false, not true, when either operand is NaN).
    FloatEq,
    /// Ordered float less-than mask.
    FloatLt,
    /// Float division.
    Div,
    /// Saturating narrow of `shape`-wide lanes into half-width signed lanes,
    /// low half from `lhs`, high half from `rhs`.
    NarrowSigned,
    /// Saturating narrow into half-width unsigned lanes.
    NarrowUnsigned,
    /// i16x8 lane-pair multiply-add into i32x4 (`i32x4.dot_i16x8_s`).
    DotProduct,
    /// Rounding saturating Q15 multiply (`i16x8.q15mulr_sat_s`).
    Q15MulrSat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
    Clz,
    Ctz,
    Popcnt,
    Abs,
    Sqrt,
    Ceil,
    Floor,
    Trunc,
    Nearest,
}

/// Failure while emitting code for a function. Never constructed by the
/// compiler for a condition that should instead be a WebAssembly trap —
/// traps are runtime, not compile-time, outcomes.
#[derive(Debug, thiserror::Error)]
pub enum CodegenError {
    #[error("unsupported operator: {0}")]
    UnsupportedOperator(String),
    #[error("register allocation failed: {0}")]
    RegisterAllocationFailed(String),
    #[error("backend error: {0}")]
    Backend(String),
}

/// The opaque native-code emitter the per-function compiler drives.
///
/// Implementors own a growable byte buffer and a label/fix-up table; they
/// are created fresh per function and consumed by [`MacroAssembler::finish`].
pub trait MacroAssembler {
    fn target(&self) -> TargetIsa;

    /// Lets tests recover the concrete backend behind the trait object —
    /// `StubAssembler::trace()` records every call made through this trait,
    /// which real-behavior tests assert against instead of only checking
    /// symbolic-stack balance.
    fn as_any(&self) -> &dyn std::any::Any;

    /// Current offset into the emitted code, used to populate the
    /// source-offset map and to record the stack-pointer-ceiling watermark
    /// alongside a native position for diagnostics.
    fn current_offset(&self) -> u32;

    // ---- labels --------------------------------------------------------
    fn new_label(&mut self) -> AsmLabel;
    fn bind_label(&mut self, label: AsmLabel);

    // ---- register-to-register ------------------------------------------
    fn mov_reg(&mut self, dst: Gpr, src: Gpr);
    fn mov_vreg(&mut self, dst: VReg, src: VReg);

    // ---- register-to-memory-with-index (base + byte offset) -------------
    fn load(&mut self, dst: Gpr, base: Gpr, offset: i32, width: Width, sign_extend: bool);
    fn store(&mut self, src: Gpr, base: Gpr, offset: i32, width: Width);
    fn load_vector(&mut self, dst: VReg, base: Gpr, offset: i32);
    fn store_vector(&mut self, src: VReg, base: Gpr, offset: i32);

    // ---- const-to-register ----------------------------------------------
    fn mov_imm(&mut self, dst: Gpr, imm: i64);

    // ---- static-const-to-register (PC-relative constant pool load) ------
    fn load_const_vector(&mut self, dst: VReg, bytes: [u8; 16]);

    // ---- arithmetic -------------------------------------------------------
    fn binop(&mut self, op: BinOp, dst: Gpr, lhs: Gpr, rhs: Gpr, is_64: bool);
    fn unop(&mut self, op: UnaryOp, dst: Gpr, src: Gpr, is_64: bool);
    fn fbinop(&mut self, op: BinOp, dst: Gpr, lhs: Gpr, rhs: Gpr, is_f64: bool);
    fn funop(&mut self, op: UnaryOp, dst: Gpr, src: Gpr, is_f64: bool);
    fn vbinop(&mut self, op: VecBinOp, shape: LaneShape, dst: VReg, lhs: VReg, rhs: VReg);
    /// Lane-wise unary op (`neg`/`abs`/`sqrt`/rounding modes/`not`/`popcnt`).
    fn vunop(&mut self, op: UnaryOp, shape: LaneShape, dst: VReg, src: VReg);
    /// Emulated 64x64-bit lane-wise multiply, truncated to the low 64 bits of
    /// each product (`i64x2.mul`). Decomposed into three 32x32-bit unsigned
    /// multiplies plus a shift-and-add, the standard trick for targets
    /// without a native 64-bit packed multiply.
    fn vec_mul_i64x2(&mut self, dst: VReg, lhs: VReg, rhs: VReg);

    /// Convert an integer in `src` to a float in `dst`. `src_is_64`/`signed`
    /// describe the source integer's width and signedness; `dst_is_f64`
    /// selects the destination float width.
    fn convert_int_to_float(&mut self, dst: Gpr, src: Gpr, dst_is_f64: bool, src_is_64: bool, signed: bool);
    /// Convert a float in `src` to an integer in `dst`. When `saturating` is
    /// false, a NaN or out-of-range source traps via `exit_context_base`
    /// (`InvalidFloatToIntConversion`) instead of producing a value; when
    /// true, the result clamps to the destination type's range (NaN becomes
    /// zero) and never traps.
    #[allow(clippy::too_many_arguments)]
    fn trunc_float_to_int(
        &mut self,
        dst: Gpr,
        src: Gpr,
        src_is_f64: bool,
        dst_is_64: bool,
        signed: bool,
        saturating: bool,
        exit_context_base: Gpr,
    );

    /// Materialize the absolute address of a (local, already-allocated)
    /// label into `dst`, via PC-relative addressing. Used to capture a
    /// return address or a function's own entry address for a call frame.
    fn load_label_address(&mut self, dst: Gpr, label: AsmLabel);

    /// Compare `lhs` against `rhs` and set the flags the next
    /// [`MacroAssembler::branch_if`] or `set_from_flags` will consume.
    fn compare(&mut self, lhs: Gpr, rhs: Gpr, is_64: bool);
    fn fcompare(&mut self, lhs: Gpr, rhs: Gpr, is_f64: bool);
    /// Materialize the condition set by the previous compare into `dst` as
    /// a 0/1 integer (used when the symbolic stack must spill a
    /// flags-pending operand instead of branching on it directly).
    fn set_from_flags(&mut self, dst: Gpr, cond: Cond);

    // ---- control flow -----------------------------------------------------
    fn jmp(&mut self, label: AsmLabel);
    fn branch_if(&mut self, cond: Cond, label: AsmLabel);
    fn call_reg(&mut self, target: Gpr);
    fn ret(&mut self);

    /// Write `status` into the exit-context status field, the return
    /// address of the next instruction into the exit-context return-address
    /// field, and transfer control back to the executor's native-enter loop.
    fn exit_with_status(&mut self, status: ExitStatus, exit_context_base: Gpr);

    /// Emit a trampoline that writes `ExitStatus::CallBuiltinFunction` plus
    /// the builtin index and exits.
    fn call_builtin(&mut self, builtin_index: u32, exit_context_base: Gpr);

    /// Consume the assembler, returning the finished machine code and the
    /// resolved label offsets (for tests and for the module compiler's
    /// entry-offset bookkeeping).
    fn finish(self: Box<Self>) -> Vec<u8>;
}
