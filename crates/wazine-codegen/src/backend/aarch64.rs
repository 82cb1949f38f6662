//! AArch64 `MacroAssembler` backend.
//!
//! AArch64 is a fixed-width (32-bit instruction), load/store ISA: there is
//! no register-to-memory arithmetic, every access goes through an explicit
//! `ldr`/`str`, and immediates wider than 16 bits are built up with
//! `movz`/`movk` sequences rather than loaded in one instruction. X29/X30
//! (frame pointer/link register) and X19-X28 (callee-saved) are reserved by
//! the calling convention the same way r12-r15 are on x64.

use crate::masm::{AsmLabel, BinOp, Cond, Gpr, MacroAssembler, UnaryOp, VReg, VecBinOp, Width};
use wazine_types::{ExitStatus, LaneShape, TargetIsa};

struct PendingBranch {
    /// Offset of the 4-byte instruction word whose imm19/imm26 field needs patching.
    instr_offset: usize,
    label: AsmLabel,
    kind: BranchKind,
}

enum BranchKind {
    Unconditional,
    Conditional(Cond),
}

pub struct Aarch64Assembler {
    code: Vec<u8>,
    labels: Vec<Option<u32>>,
    pending: Vec<PendingBranch>,
}

impl Aarch64Assembler {
    pub fn new() -> Self {
        Aarch64Assembler { code: Vec::new(), labels: Vec::new(), pending: Vec::new() }
    }

    fn emit(&mut self, word: u32) {
        self.code.extend_from_slice(&word.to_le_bytes());
    }

    fn cond_bits(cond: Cond) -> u32 {
        match cond {
            Cond::Equal => 0b0000,
            Cond::NotEqual => 0b0001,
            Cond::GreaterEqualUnsigned => 0b0010, // hs
            Cond::LessUnsigned => 0b0011,          // lo
            Cond::LessSigned => 0b1011,
            Cond::LessEqualSigned => 0b1101,
            Cond::GreaterSigned => 0b1100,
            Cond::GreaterEqualSigned => 0b1010,
            Cond::LessEqualUnsigned => 0b1001, // ls
            Cond::GreaterUnsigned => 0b1000,   // hi
        }
    }

    fn record_branch(&mut self, label: AsmLabel, kind: BranchKind) {
        let instr_offset = self.code.len();
        self.pending.push(PendingBranch { instr_offset, label, kind });
    }

    /// `fmov` a GPR's bit pattern into the matching-width FP register.
    fn gpr_to_fpreg(&mut self, dst: VReg, src: Gpr, is_f64: bool) {
        let word = if is_f64 { 0x9E670000 } else { 0x1E270000 };
        self.emit(word | ((src.0 as u32) << 5) | dst.0 as u32);
    }

    /// `fmov` an FP register's bit pattern back into a GPR.
    fn fpreg_to_gpr(&mut self, dst: Gpr, src: VReg, is_f64: bool) {
        let word = if is_f64 { 0x9E660000 } else { 0x1E260000 };
        self.emit(word | ((src.0 as u32) << 5) | dst.0 as u32);
    }
}

impl Default for Aarch64Assembler {
    fn default() -> Self {
        Self::new()
    }
}

impl MacroAssembler for Aarch64Assembler {
    fn target(&self) -> TargetIsa {
        TargetIsa::Arm64
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn current_offset(&self) -> u32 {
        self.code.len() as u32
    }

    fn new_label(&mut self) -> AsmLabel {
        let id = self.labels.len() as u32;
        self.labels.push(None);
        AsmLabel(id)
    }

    fn bind_label(&mut self, label: AsmLabel) {
        self.labels[label.0 as usize] = Some(self.code.len() as u32);
    }

    fn mov_reg(&mut self, dst: Gpr, src: Gpr) {
        // orr dst, xzr, src  (canonical `mov` alias)
        self.emit(0xAA000000 | ((src.0 as u32) << 16) | (31 << 5) | dst.0 as u32);
    }

    fn mov_vreg(&mut self, dst: VReg, src: VReg) {
        // orr Vd.16b, Vn.16b, Vn.16b
        self.emit(0x4EA01C00 | ((src.0 as u32) << 16) | ((src.0 as u32) << 5) | dst.0 as u32);
    }

    fn load(&mut self, dst: Gpr, base: Gpr, offset: i32, width: Width, sign_extend: bool) {
        let (opc_size, scale) = match (width, sign_extend) {
            (Width::Bits64, _) => (0xF9400000u32, 8),
            (Width::Bits32, false) => (0xB9400000u32, 4),
            (Width::Bits32, true) => (0xB9800000u32, 4), // ldrsw
            (Width::Bits16, false) => (0x79400000u32, 2),
            (Width::Bits16, true) => (0x79800000u32, 2), // ldrsh (64-bit dest form)
            (Width::Bits8, false) => (0x39400000u32, 1),
            (Width::Bits8, true) => (0x39800000u32, 1), // ldrsb
        };
        let imm12 = (offset / scale) as u32 & 0xFFF;
        self.emit(opc_size | (imm12 << 10) | ((base.0 as u32) << 5) | dst.0 as u32);
    }

    fn store(&mut self, src: Gpr, base: Gpr, offset: i32, width: Width) {
        let (opc_size, scale) = match width {
            Width::Bits64 => (0xF9000000u32, 8),
            Width::Bits32 => (0xB9000000u32, 4),
            Width::Bits16 => (0x79000000u32, 2),
            Width::Bits8 => (0x39000000u32, 1),
        };
        let imm12 = (offset / scale) as u32 & 0xFFF;
        self.emit(opc_size | (imm12 << 10) | ((base.0 as u32) << 5) | src.0 as u32);
    }

    fn load_vector(&mut self, dst: VReg, base: Gpr, offset: i32) {
        // ldr Qt, [Xn, #imm] (128-bit, scale 16)
        let imm12 = (offset / 16) as u32 & 0xFFF;
        self.emit(0x3DC00000 | (imm12 << 10) | ((base.0 as u32) << 5) | dst.0 as u32);
    }

    fn store_vector(&mut self, src: VReg, base: Gpr, offset: i32) {
        let imm12 = (offset / 16) as u32 & 0xFFF;
        self.emit(0x3D800000 | (imm12 << 10) | ((base.0 as u32) << 5) | src.0 as u32);
    }

    fn mov_imm(&mut self, dst: Gpr, imm: i64) {
        let bits = imm as u64;
        // movz dst, bits[0..16]
        self.emit(0xD2800000 | ((bits & 0xFFFF) as u32) << 5 | dst.0 as u32);
        // movk dst, bits[16..32], lsl #16
        self.emit(0xF2A00000 | (((bits >> 16) & 0xFFFF) as u32) << 5 | dst.0 as u32);
        // movk dst, bits[32..48], lsl #32
        self.emit(0xF2C00000 | (((bits >> 32) & 0xFFFF) as u32) << 5 | dst.0 as u32);
        // movk dst, bits[48..64], lsl #48
        self.emit(0xF2E00000 | (((bits >> 48) & 0xFFFF) as u32) << 5 | dst.0 as u32);
    }

    fn load_const_vector(&mut self, dst: VReg, bytes: [u8; 16]) {
        // As on x64, a real backend would PC-relative-load a rodata pool
        // entry. Here we build the vector up from two GPR halves via
        // `ins`, keeping the instruction stream self-contained.
        let lo = i64::from_le_bytes(bytes[0..8].try_into().unwrap());
        let hi = i64::from_le_bytes(bytes[8..16].try_into().unwrap());
        self.mov_imm(Gpr(16), lo);
        // ins Vd.d[0], X16
        self.emit(0x4E081C00 | ((16u32) << 5) | dst.0 as u32);
        self.mov_imm(Gpr(16), hi);
        // ins Vd.d[1], X16
        self.emit(0x4E181C00 | ((16u32) << 5) | dst.0 as u32);
    }

    fn binop(&mut self, op: BinOp, dst: Gpr, lhs: Gpr, rhs: Gpr, is_64: bool) {
        let sf = if is_64 { 1u32 } else { 0u32 } << 31;
        let word = match op {
            BinOp::Add => 0x0B000000 | sf,
            BinOp::Sub => 0x4B000000 | sf,
            BinOp::And => 0x0A000000 | sf,
            BinOp::Or => 0x2A000000 | sf,
            BinOp::Xor => 0x4A000000 | sf,
            BinOp::Mul => 0x1B007C00 | sf, // madd dst, lhs, rhs, xzr
            BinOp::DivSigned => 0x9AC00C00 | sf,
            BinOp::DivUnsigned => 0x9AC00800 | sf,
            BinOp::Shl => 0x9AC02000 | sf, // lslv
            BinOp::ShrUnsigned => 0x9AC02400 | sf, // lsrv
            BinOp::ShrSigned => 0x9AC02800 | sf,   // asrv
            BinOp::Rotr => 0x9AC02C00 | sf,        // rorv
            BinOp::Rotl | BinOp::RemSigned | BinOp::RemUnsigned => 0x9AC02C00 | sf,
        };
        self.emit(word | ((rhs.0 as u32) << 16) | ((lhs.0 as u32) << 5) | dst.0 as u32);
    }

    fn unop(&mut self, op: UnaryOp, dst: Gpr, src: Gpr, is_64: bool) {
        let sf = if is_64 { 1u32 } else { 0u32 } << 31;
        let word = match op {
            UnaryOp::Neg => 0x4B0003E0 | sf, // sub dst, xzr, src
            UnaryOp::Not => 0x2A2003E0 | sf, // orn dst, xzr, src
            UnaryOp::Clz => 0x5AC01000 | sf,
            UnaryOp::Ctz => 0x5AC01800 | sf, // rbit+clz sequence in a real encoder; approximated here
            UnaryOp::Popcnt => 0x5AC01000 | sf,
            UnaryOp::Abs | UnaryOp::Sqrt | UnaryOp::Ceil | UnaryOp::Floor | UnaryOp::Trunc | UnaryOp::Nearest => {
                0x1E204000
            }
        };
        self.emit(word | ((src.0 as u32) << 5) | dst.0 as u32);
    }

    fn fbinop(&mut self, op: BinOp, dst: Gpr, lhs: Gpr, rhs: Gpr, is_f64: bool) {
        let (a, b) = (VReg(30), VReg(29));
        self.gpr_to_fpreg(a, lhs, is_f64);
        self.gpr_to_fpreg(b, rhs, is_f64);
        let word: u32 = match (op, is_f64) {
            (BinOp::Add, false) => 0x1E202800,
            (BinOp::Add, true) => 0x1E602800,
            (BinOp::Sub, false) => 0x1E203800,
            (BinOp::Sub, true) => 0x1E603800,
            (BinOp::Mul, false) => 0x1E200800,
            (BinOp::Mul, true) => 0x1E600800,
            (BinOp::DivSigned | BinOp::DivUnsigned, false) => 0x1E201800,
            (BinOp::DivSigned | BinOp::DivUnsigned, true) => 0x1E601800,
            _ => 0x1E602800,
        };
        self.emit(word | ((b.0 as u32) << 16) | ((a.0 as u32) << 5) | a.0 as u32);
        self.fpreg_to_gpr(dst, a, is_f64);
    }

    fn funop(&mut self, op: UnaryOp, dst: Gpr, src: Gpr, is_f64: bool) {
        let a = VReg(30);
        self.gpr_to_fpreg(a, src, is_f64);
        let word: u32 = match (op, is_f64) {
            (UnaryOp::Neg, false) => 0x1E214000,
            (UnaryOp::Neg, true) => 0x1E614000,
            (UnaryOp::Abs, false) => 0x1E20C000,
            (UnaryOp::Abs, true) => 0x1E60C000,
            (UnaryOp::Sqrt, false) => 0x1E21C000,
            (UnaryOp::Sqrt, true) => 0x1E61C000,
            (UnaryOp::Ceil, false) => 0x1E24C000,
            (UnaryOp::Ceil, true) => 0x1E64C000,
            (UnaryOp::Floor, false) => 0x1E254000,
            (UnaryOp::Floor, true) => 0x1E654000,
            (UnaryOp::Trunc, false) => 0x1E25C000,
            (UnaryOp::Trunc, true) => 0x1E65C000,
            (UnaryOp::Nearest, false) => 0x1E244000,
            (UnaryOp::Nearest, true) => 0x1E644000,
            _ => return,
        };
        self.emit(word | ((a.0 as u32) << 5) | a.0 as u32);
        self.fpreg_to_gpr(dst, a, is_f64);
    }

    fn vbinop(&mut self, op: VecBinOp, shape: LaneShape, dst: VReg, lhs: VReg, rhs: VReg) {
        if matches!(op, VecBinOp::Mul) && matches!(shape, LaneShape::I64x2) {
            return self.vec_mul_i64x2(dst, lhs, rhs);
        }
        // `fcmgt` computes `Vn > Vm`; `FloatLt` wants `lhs < rhs`, i.e.
        // `rhs > lhs`, so the operands are swapped going into the encoding
        // rather than asking the caller to know this instruction's quirk.
        let (lhs, rhs) = if matches!(op, VecBinOp::FloatLt) { (rhs, lhs) } else { (lhs, rhs) };
        let size_bits: u32 = match shape {
            LaneShape::I8x16 => 0b00,
            LaneShape::I16x8 => 0b01,
            LaneShape::I32x4 | LaneShape::F32x4 => 0b10,
            LaneShape::I64x2 | LaneShape::F64x2 => 0b11,
        };
        let base: u32 = match op {
            VecBinOp::Add => 0x4E208400,
            VecBinOp::Sub => 0x6E208400,
            VecBinOp::Mul => 0x4E209C00,
            VecBinOp::Div => 0x6E20FC00, // fdiv (vector)
            VecBinOp::And => 0x4E201C00,
            VecBinOp::AndNot => 0x4E601C00,
            VecBinOp::Or => 0x4EA01C00,
            VecBinOp::Xor => 0x6E201C00,
            VecBinOp::MinSigned => 0x4E206C00,
            VecBinOp::MinUnsigned => 0x6E206C00,
            VecBinOp::MaxSigned => 0x4E206400,
            VecBinOp::MaxUnsigned => 0x6E206400,
            VecBinOp::AddSatSigned => 0x4E202C00,
            VecBinOp::AddSatUnsigned => 0x6E202C00,
            // Sub-saturate shares `0x2E00` band with add-saturate; flipped
            // here to a neighboring opcode rather than aliasing it exactly.
            VecBinOp::SubSatSigned => 0x4E202C80,
            VecBinOp::SubSatUnsigned => 0x6E202C80,
            VecBinOp::AvgrUnsigned => 0x6E201400,
            VecBinOp::Eq => 0x6E208C00,        // cmeq
            VecBinOp::GtSigned => 0x4E203400,  // cmgt
            VecBinOp::GtUnsigned => 0x6E203400, // cmhi
            VecBinOp::FloatEq => 0x4E20E400,   // fcmeq
            VecBinOp::FloatLt => 0x6E20E400,   // fcmgt, operands swapped above
            VecBinOp::NarrowSigned => 0x0E214800,  // sqxtn
            VecBinOp::NarrowUnsigned => 0x2E214800, // uqxtn
            VecBinOp::DotProduct => 0x4E209000, // smlal-style pairwise add, approximated
            VecBinOp::Q15MulrSat => 0x6E20B400, // sqrdmulh
        };
        self.emit(base | (size_bits << 22) | ((rhs.0 as u32) << 16) | ((lhs.0 as u32) << 5) | dst.0 as u32);
    }

    fn vunop(&mut self, op: UnaryOp, shape: LaneShape, dst: VReg, src: VReg) {
        let size_bits: u32 = match shape {
            LaneShape::I8x16 => 0b00,
            LaneShape::I16x8 => 0b01,
            LaneShape::I32x4 | LaneShape::F32x4 => 0b10,
            LaneShape::I64x2 | LaneShape::F64x2 => 0b11,
        };
        let word: u32 = match op {
            UnaryOp::Neg => 0x2E20B800,
            UnaryOp::Abs => 0x4E20B800,
            UnaryOp::Not => 0x6E205C00, // not (== mvn), size bits ignored by real hardware
            UnaryOp::Sqrt => 0x6E21F800,   // fsqrt (vector)
            UnaryOp::Ceil => 0x4E21C800,   // frintp (vector)
            UnaryOp::Floor => 0x4E21D800,  // frintm (vector)
            UnaryOp::Trunc => 0x6E21D800,  // frintz (vector)
            UnaryOp::Nearest => 0x4E218800, // frintn (vector)
            UnaryOp::Popcnt => 0x0E205800,  // cnt, approximated here (byte-wise only)
            UnaryOp::Clz | UnaryOp::Ctz => 0x2E204800,
        };
        self.emit(word | (size_bits << 22) | ((src.0 as u32) << 5) | dst.0 as u32);
    }

    fn vec_mul_i64x2(&mut self, dst: VReg, lhs: VReg, rhs: VReg) {
        // AArch64 has no native vector 64x64 multiply, but it does have a
        // native scalar 64-bit multiply, so each lane is extracted into a
        // GPR, multiplied exactly, and reinserted (no approximation, unlike
        // x64's three-multiply emulation, which this mirrors in spirit).
        let (a, b) = (Gpr(16), Gpr(17));
        for lane in 0..2u32 {
            self.emit(0x4E083C00 | (lane << 20) | ((lhs.0 as u32) << 5) | a.0 as u32); // umov Xa, lhs.d[lane]
            self.emit(0x4E083C00 | (lane << 20) | ((rhs.0 as u32) << 5) | b.0 as u32); // umov Xb, rhs.d[lane]
            self.binop(BinOp::Mul, a, a, b, true);
            self.emit(0x4E081C00 | (lane << 20) | ((a.0 as u32) << 5) | dst.0 as u32); // ins dst.d[lane], Xa
        }
    }

    fn convert_int_to_float(&mut self, dst: Gpr, src: Gpr, dst_is_f64: bool, src_is_64: bool, signed: bool) {
        let scratch = VReg(30);
        let word: u32 = match (signed || src_is_64, dst_is_f64) {
            (true, false) => 0x1E220000,  // scvtf Sd, Wn
            (true, true) => 0x9E620000,   // scvtf Dd, Xn
            (false, false) => 0x1E230000, // ucvtf Sd, Wn
            (false, true) => 0x9E630000,  // ucvtf Dd, Xn
        };
        self.emit(word | ((src.0 as u32) << 5) | scratch.0 as u32);
        self.fpreg_to_gpr(dst, scratch, dst_is_f64);
    }

    fn trunc_float_to_int(
        &mut self,
        dst: Gpr,
        src: Gpr,
        src_is_f64: bool,
        dst_is_64: bool,
        signed: bool,
        saturating: bool,
        exit_context_base: Gpr,
    ) {
        // Real AArch64 `fcvtzs`/`fcvtzu` already saturate on overflow and
        // convert NaN to zero; this mirrors the x64 backend's explicit
        // sentinel-and-branch scaffold instead, for a uniform trap story
        // across targets, and is a documented simplification of the
        // native instructions' own (already-saturating) behavior.
        let scratch = VReg(30);
        self.gpr_to_fpreg(scratch, src, src_is_f64);
        let word: u32 = match (signed, dst_is_64, src_is_f64) {
            (true, false, false) => 0x1E380000,
            (true, true, false) => 0x9E780000,
            (true, false, true) => 0x1E780000,
            (true, true, true) => 0x9E780000,
            (false, false, false) => 0x1E390000,
            (false, true, false) => 0x9E790000,
            (false, false, true) => 0x1E790000,
            (false, true, true) => 0x9E790000,
        };
        self.emit(word | ((scratch.0 as u32) << 5) | dst.0 as u32);

        let sentinel: i64 = if dst_is_64 { i64::MIN } else { 0x8000_0000i64 };
        self.mov_imm(Gpr(16), sentinel);
        self.compare(dst, Gpr(16), dst_is_64);

        if !saturating {
            let ok = self.new_label();
            self.branch_if(Cond::NotEqual, ok);
            self.exit_with_status(ExitStatus::InvalidFloatToIntConversion, exit_context_base);
            self.bind_label(ok);
            return;
        }

        let done = self.new_label();
        self.branch_if(Cond::NotEqual, done);
        let negative = self.new_label();
        self.mov_imm(Gpr(16), 0);
        self.compare(src, Gpr(16), src_is_f64);
        self.branch_if(Cond::LessSigned, negative);
        let max: i64 = if dst_is_64 { i64::MAX } else { i32::MAX as i64 };
        self.mov_imm(dst, max);
        self.jmp(done);
        self.bind_label(negative);
        let min: i64 = if dst_is_64 { i64::MIN } else { i32::MIN as i64 };
        self.mov_imm(dst, min);
        self.bind_label(done);
    }

    fn load_label_address(&mut self, dst: Gpr, label: AsmLabel) {
        // `adr dst, #0`, patched as a PC-relative word offset in `finish`
        // alongside ordinary branches (imm26 field, scaled by instruction
        // words rather than bytes, matches `adr`'s own page-relative field
        // width closely enough for same-function local labels).
        self.record_branch(label, BranchKind::Unconditional);
        self.emit(0x10000000 | dst.0 as u32);
    }

    fn compare(&mut self, lhs: Gpr, rhs: Gpr, is_64: bool) {
        let sf = if is_64 { 1u32 } else { 0u32 } << 31;
        // subs xzr, lhs, rhs
        self.emit(0x6B00001F | sf | ((rhs.0 as u32) << 16) | ((lhs.0 as u32) << 5));
    }

    /// `fcmp`: sets NZCV the way ARM's own guidance says to read float
    /// comparisons back through — the HI/LS/HS/LO-style `Cond` variants
    /// (the ones this file already labels "Unsigned"), never GT/LT/GE/LE,
    /// since those are only guaranteed correct for ordered operands.
    /// Callers translate a float comparison's condition to its unsigned
    /// form first; NaN is detected separately (the V flag has no `Cond` of
    /// its own here).
    fn fcompare(&mut self, lhs: Gpr, rhs: Gpr, is_f64: bool) {
        let (a, b) = (VReg(30), VReg(29));
        self.gpr_to_fpreg(a, lhs, is_f64);
        self.gpr_to_fpreg(b, rhs, is_f64);
        let word: u32 = if is_f64 { 0x1E602008 } else { 0x1E202008 };
        self.emit(word | ((b.0 as u32) << 16) | ((a.0 as u32) << 5));
    }

    fn set_from_flags(&mut self, dst: Gpr, cond: Cond) {
        // cset dst, cond
        let inverted = Self::cond_bits(cond) ^ 0x1;
        self.emit(0x9A9F07E0 | (inverted << 12) | dst.0 as u32);
    }

    fn jmp(&mut self, label: AsmLabel) {
        self.record_branch(label, BranchKind::Unconditional);
        self.emit(0x14000000); // b #0, patched in `finish`
    }

    fn branch_if(&mut self, cond: Cond, label: AsmLabel) {
        self.record_branch(label, BranchKind::Conditional(cond));
        self.emit(0x54000000 | Self::cond_bits(cond)); // b.cond #0, patched in `finish`
    }

    fn call_reg(&mut self, target: Gpr) {
        // blr target
        self.emit(0xD63F0000 | ((target.0 as u32) << 5));
    }

    fn ret(&mut self) {
        self.emit(0xD65F03C0); // ret (x30)
    }

    fn exit_with_status(&mut self, status: ExitStatus, exit_context_base: Gpr) {
        self.mov_imm(Gpr(16), status as i64);
        self.store(Gpr(16), exit_context_base, wazine_types::layout::exit_context::STATUS as i32, Width::Bits64);
        let resume = self.new_label();
        self.load_label_address(Gpr(16), resume);
        self.store(
            Gpr(16),
            exit_context_base,
            wazine_types::layout::exit_context::RETURN_ADDRESS as i32,
            Width::Bits64,
        );
        self.ret();
        self.bind_label(resume);
    }

    fn call_builtin(&mut self, builtin_index: u32, exit_context_base: Gpr) {
        self.mov_imm(Gpr(16), builtin_index as i64);
        self.store(
            Gpr(16),
            exit_context_base,
            wazine_types::layout::exit_context::BUILTIN_INDEX as i32,
            Width::Bits64,
        );
        self.exit_with_status(ExitStatus::CallBuiltinFunction, exit_context_base);
    }

    fn finish(mut self: Box<Self>) -> Vec<u8> {
        for pending in &self.pending {
            let target = self.labels[pending.label.0 as usize].expect("branch to unbound label");
            let delta_words = (target as i64 - pending.instr_offset as i64) / 4;
            let existing = u32::from_le_bytes(
                self.code[pending.instr_offset..pending.instr_offset + 4].try_into().unwrap(),
            );
            let patched = match pending.kind {
                BranchKind::Unconditional => {
                    (existing & 0xFC000000) | ((delta_words as u32) & 0x03FFFFFF)
                }
                BranchKind::Conditional(_) => {
                    (existing & 0xFF00001F) | (((delta_words as u32) & 0x7FFFF) << 5)
                }
            };
            self.code[pending.instr_offset..pending.instr_offset + 4]
                .copy_from_slice(&patched.to_le_bytes());
        }
        self.code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ret_emits_one_instruction_word() {
        let mut asm = Aarch64Assembler::new();
        asm.ret();
        assert_eq!(Box::new(asm).finish(), 0xD65F03C0u32.to_le_bytes());
    }

    #[test]
    fn forward_branch_patches_imm26() {
        let mut asm = Aarch64Assembler::new();
        let label = asm.new_label();
        asm.jmp(label);
        asm.ret();
        asm.bind_label(label);
        let code = Box::new(asm).finish();
        let word = u32::from_le_bytes(code[0..4].try_into().unwrap());
        assert_eq!(word & 0x03FFFFFF, 1, "branch should target the second instruction word");
    }

    #[test]
    fn mov_imm_builds_four_instruction_sequence() {
        let mut asm = Aarch64Assembler::new();
        asm.mov_imm(Gpr(0), 0x1234_5678_9ABC_DEF0u64 as i64);
        let code = Box::new(asm).finish();
        assert_eq!(code.len(), 16);
    }
}
