//! Target backends.
//!
//! Each target implements [`TargetIsa`]: a fixed capability set the code
//! generator is written against, plus the patching hooks the relocation
//! machinery needs. The generator never matches on the architecture.
//!
//! | Target  | Word | PC bias           | Literal pool   | Store-multiple |
//! |---------|------|-------------------|----------------|----------------|
//! | `Arm`   | 32   | +8                | ±4095 bytes    | `stmib jsp!`   |
//! | `Thumb` | 16   | +4 (word-aligned) | +1020 bytes    | none           |
//! | `X86`   | var  | end of insn       | none           | none           |

pub mod arm;
pub mod thumb;
pub mod x86;

use std::fmt;

use smallvec::SmallVec;
use talon_core::{Condition, ObjectRef, Stub, StubLocation};

use crate::assembler::{CodeBuffer, Label};
use crate::error::CompileError;

/// Result of emitting into a [`CodeBuffer`].
pub type EmitResult = Result<(), CompileError>;

// =============================================================================
// Architecture
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    Arm,
    Thumb,
    X86,
}

impl Arch {
    pub const ALL: [Arch; 3] = [Arch::Arm, Arch::Thumb, Arch::X86];
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Arch::Arm => "arm",
            Arch::Thumb => "thumb",
            Arch::X86 => "x86",
        })
    }
}

static ARM: arm::ArmIsa = arm::ArmIsa;
static THUMB: thumb::ThumbIsa = thumb::ThumbIsa;
static X86: x86::X86Isa = x86::X86Isa;

/// Get the backend for a target.
pub fn isa_for(arch: Arch) -> &'static dyn TargetIsa {
    match arch {
        Arch::Arm => &ARM,
        Arch::Thumb => &THUMB,
        Arch::X86 => &X86,
    }
}

// =============================================================================
// Registers
// =============================================================================

/// A physical register, identified by its hardware encoding.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reg(pub u8);

impl Reg {
    #[inline(always)]
    pub const fn encoding(self) -> u8 {
        self.0
    }
}

impl fmt::Debug for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Reg({})", self.0)
    }
}

bitflags::bitflags! {
    /// What a register is used for by the JIT calling convention.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct RegRoles: u16 {
        /// Carries an incoming argument or outgoing result.
        const ARGUMENT = 1 << 0;
        /// Preserved across calls; saved by the prologue when used.
        const CALLEE_SAVED = 1 << 1;
        /// Reserved temporary for multi-instruction sequences.
        const SCRATCH = 1 << 2;
        const STACK_POINTER = 1 << 3;
        const PROGRAM_COUNTER = 1 << 4;
        const LINK = 1 << 5;
        const FRAME_POINTER = 1 << 6;
        /// Addresses the top committed operand-stack slot.
        const JAVA_STACK_POINTER = 1 << 7;
        /// Holds interpreter dispatch state; never touched by compiled code.
        const INTERPRETER = 1 << 8;
        /// May back operand-stack slots and locals.
        const ALLOCATABLE = 1 << 9;
    }
}

/// Static description of one register.
#[derive(Debug, Clone, Copy)]
pub struct RegisterInfo {
    pub reg: Reg,
    pub name: &'static str,
    pub roles: RegRoles,
}

impl RegisterInfo {
    pub const fn new(encoding: u8, name: &'static str, roles: RegRoles) -> Self {
        Self {
            reg: Reg(encoding),
            name,
            roles,
        }
    }
}

/// Set of registers as a bitmask over encodings.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RegSet(u16);

impl RegSet {
    pub const EMPTY: RegSet = RegSet(0);

    #[inline(always)]
    pub const fn singleton(reg: Reg) -> Self {
        RegSet(1 << reg.0)
    }

    #[inline(always)]
    pub const fn from_bits(bits: u16) -> Self {
        RegSet(bits)
    }

    #[inline(always)]
    pub const fn bits(self) -> u16 {
        self.0
    }

    #[inline(always)]
    pub const fn contains(self, reg: Reg) -> bool {
        (self.0 & (1 << reg.0)) != 0
    }

    #[inline(always)]
    pub const fn insert(self, reg: Reg) -> Self {
        RegSet(self.0 | (1 << reg.0))
    }

    #[inline(always)]
    pub const fn remove(self, reg: Reg) -> Self {
        RegSet(self.0 & !(1 << reg.0))
    }

    #[inline(always)]
    pub const fn union(self, other: RegSet) -> Self {
        RegSet(self.0 | other.0)
    }

    #[inline(always)]
    pub const fn intersection(self, other: RegSet) -> Self {
        RegSet(self.0 & other.0)
    }

    #[inline(always)]
    pub const fn difference(self, other: RegSet) -> Self {
        RegSet(self.0 & !other.0)
    }

    #[inline(always)]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline(always)]
    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Iterate in ascending encoding order.
    pub fn iter(self) -> impl Iterator<Item = Reg> {
        (0..16u8).filter(move |&n| (self.0 & (1 << n)) != 0).map(Reg)
    }
}

impl fmt::Debug for RegSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(|r| r.0)).finish()
    }
}

impl FromIterator<Reg> for RegSet {
    fn from_iter<I: IntoIterator<Item = Reg>>(iter: I) -> Self {
        iter.into_iter().fold(RegSet::EMPTY, RegSet::insert)
    }
}

// =============================================================================
// Encoded Instructions
// =============================================================================

/// Maximum length of any instruction emitted by a backend.
pub const MAX_INST_LEN: usize = 15;

/// An encoded instruction in a fixed-size array.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct EncodedInst {
    bytes: [u8; MAX_INST_LEN],
    len: u8,
}

impl EncodedInst {
    #[inline]
    pub const fn new() -> Self {
        EncodedInst {
            bytes: [0; MAX_INST_LEN],
            len: 0,
        }
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    #[inline]
    pub const fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn push(&mut self, byte: u8) {
        assert!((self.len as usize) < MAX_INST_LEN, "instruction longer than {MAX_INST_LEN} bytes");
        self.bytes[self.len as usize] = byte;
        self.len += 1;
    }

    #[inline]
    pub fn push_u16(&mut self, val: u16) {
        for byte in val.to_le_bytes() {
            self.push(byte);
        }
    }

    #[inline]
    pub fn push_u32(&mut self, val: u32) {
        for byte in val.to_le_bytes() {
            self.push(byte);
        }
    }
}

impl Default for EncodedInst {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EncodedInst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.as_slice().iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Read a little-endian halfword, if in bounds.
#[inline]
pub(crate) fn read_u16(code: &[u8], at: usize) -> Option<u16> {
    let bytes = code.get(at..at + 2)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

/// Read a little-endian word, if in bounds.
#[inline]
pub(crate) fn read_u32(code: &[u8], at: usize) -> Option<u32> {
    let bytes = code.get(at..at + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Overwrite bytes at `at`, asserting the replacement keeps the length.
pub(crate) fn overwrite(code: &mut [u8], at: usize, old_len: usize, inst: &EncodedInst) {
    assert_eq!(
        inst.len(),
        old_len,
        "re-encoding at {at:#x} changed instruction length"
    );
    code[at..at + old_len].copy_from_slice(inst.as_slice());
}

// =============================================================================
// Neutral operations
// =============================================================================

/// Register-register arithmetic understood by every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    /// Add, setting carry for a following `Adc`.
    Adds,
    /// Add with carry in.
    Adc,
    /// Subtract, setting borrow for a following `Sbc`.
    Subs,
    /// Subtract with borrow in.
    Sbc,
}

impl AluOp {
    #[inline]
    pub const fn is_commutative(self) -> bool {
        !matches!(self, AluOp::Sub | AluOp::Subs | AluOp::Sbc)
    }
}

/// Machine frame of a compiled method that owns one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameShape {
    /// Locals plus operand-stack slots.
    pub slots: u16,
    pub max_locals: u16,
}

impl FrameShape {
    /// Byte offset of the Java stack pointer from the frame pointer at `depth`.
    #[inline]
    pub const fn jsp_offset(&self, depth: u16) -> i32 {
        (self.max_locals as i32 + depth as i32 - 1) * 4
    }
}

/// One decoded instruction, rendered for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedInst {
    pub len: usize,
    pub mnemonic: String,
    pub operands: String,
    /// Byte distance from the instruction to its PC-relative target.
    pub pc_target: Option<i64>,
}

// =============================================================================
// Target ISA
// =============================================================================

/// Capabilities the code generator and relocator need from a target.
///
/// Emission methods append to a [`CodeBuffer`] and record any relocation
/// the instruction needs before returning. Encodings that cannot represent
/// an operand panic; callers are expected to stay within the limits the
/// trait advertises (`max_code_size`, `max_frame_slots`).
pub trait TargetIsa: Send + Sync {
    fn arch(&self) -> Arch;

    fn registers(&self) -> &'static [RegisterInfo];

    /// Largest method body whose internal branches are always encodable.
    fn max_code_size(&self) -> usize;

    /// Largest frame (locals + stack) addressable from the frame pointer.
    fn max_frame_slots(&self) -> u16;

    fn uses_literal_pool(&self) -> bool;

    /// Whether a literal placed at `literal_at` can be loaded from `load_at`.
    fn literal_in_reach(&self, load_at: u32, literal_at: u32) -> bool;

    /// Filler used to word-align a literal pool.
    fn pool_padding(&self) -> &'static [u8];

    /// Whether `emit_store_multiple` is available.
    fn supports_store_multiple(&self) -> bool;

    fn emit_move(&self, buf: &mut CodeBuffer, dst: Reg, src: Reg) -> EmitResult;

    fn emit_move_imm(&self, buf: &mut CodeBuffer, dst: Reg, imm: i32) -> EmitResult;

    fn emit_alu(&self, buf: &mut CodeBuffer, op: AluOp, dst: Reg, lhs: Reg, rhs: Reg)
    -> EmitResult;

    fn emit_add_imm(&self, buf: &mut CodeBuffer, dst: Reg, src: Reg, imm: i32) -> EmitResult;

    fn emit_compare(&self, buf: &mut CodeBuffer, lhs: Reg, rhs: Reg) -> EmitResult;

    fn emit_compare_imm(&self, buf: &mut CodeBuffer, lhs: Reg, imm: i32) -> EmitResult;

    /// Branch to `target`, unconditionally when `cond` is `None`.
    fn emit_branch(&self, buf: &mut CodeBuffer, cond: Option<Condition>, target: Label)
    -> EmitResult;

    fn emit_call(&self, buf: &mut CodeBuffer, stub: Stub, location: StubLocation) -> EmitResult;

    fn emit_load(&self, buf: &mut CodeBuffer, dst: Reg, base: Reg, offset: i32) -> EmitResult;

    fn emit_store(&self, buf: &mut CodeBuffer, src: Reg, base: Reg, offset: i32) -> EmitResult;

    /// Store `regs` to consecutive words above `base`, pre-incrementing and
    /// writing the final address back to `base`.
    fn emit_store_multiple(&self, buf: &mut CodeBuffer, base: Reg, regs: &[Reg]) -> EmitResult;

    /// Materialize a heap reference and record a `HeapObject` relocation.
    fn emit_load_object(&self, buf: &mut CodeBuffer, dst: Reg, obj: ObjectRef) -> EmitResult;

    /// Materialize one half of a wide literal and record a `Literal` relocation.
    fn emit_load_literal(&self, buf: &mut CodeBuffer, dst: Reg, value: u32) -> EmitResult;

    fn emit_prologue(&self, buf: &mut CodeBuffer, shape: &FrameShape) -> EmitResult;

    /// Tear down the frame (if any) and return to the caller.
    fn emit_return(&self, buf: &mut CodeBuffer, shape: Option<&FrameShape>) -> EmitResult;

    /// Displacement of the PC-relative instruction at `at`, if it is one.
    fn pc_relative(&self, code: &[u8], at: usize) -> Option<i64>;

    /// Re-point the PC-relative instruction at `at`.
    ///
    /// Panics if `at` does not hold a PC-relative form or `disp` does not fit.
    fn set_pc_relative(&self, code: &mut [u8], at: usize, disp: i64);

    /// Check whether the PC-relative instruction at `at` can encode `disp`.
    ///
    /// False when `at` holds no PC-relative form.
    fn pc_relative_fits(&self, code: &[u8], at: usize, disp: i64) -> bool;

    /// Offset of the 32-bit word embedded in, or loaded by, the instruction at `at`.
    fn embedded_word_at(&self, code: &[u8], at: usize) -> Option<usize>;

    fn decode_at(&self, code: &[u8], at: usize) -> Option<DecodedInst>;

    // =========================================================================
    // Register classification
    // =========================================================================

    fn register_info(&self, reg: Reg) -> Option<&'static RegisterInfo> {
        self.registers().iter().find(|info| info.reg == reg)
    }

    fn register_name(&self, reg: Reg) -> &'static str {
        self.register_info(reg).map_or("?", |info| info.name)
    }

    fn registers_with(&self, roles: RegRoles) -> RegSet {
        self.registers()
            .iter()
            .filter(|info| info.roles.contains(roles))
            .map(|info| info.reg)
            .collect()
    }

    /// Argument registers in calling-convention order.
    fn argument_registers(&self) -> SmallVec<[Reg; 4]> {
        self.registers()
            .iter()
            .filter(|info| info.roles.contains(RegRoles::ARGUMENT))
            .map(|info| info.reg)
            .collect()
    }

    fn allocatable(&self) -> RegSet {
        self.registers_with(RegRoles::ALLOCATABLE)
    }

    /// Allocatable registers a leaf may use without saving them.
    fn caller_saved_allocatable(&self) -> RegSet {
        self.allocatable()
            .difference(self.registers_with(RegRoles::CALLEE_SAVED))
    }

    fn role_register(&self, role: RegRoles) -> Reg {
        match self.registers_with(role).iter().next() {
            Some(reg) => reg,
            None => panic!("{} defines no {role:?} register", self.arch()),
        }
    }

    fn scratch(&self) -> Reg {
        self.role_register(RegRoles::SCRATCH)
    }

    fn frame_pointer(&self) -> Reg {
        self.role_register(RegRoles::FRAME_POINTER)
    }

    fn java_stack_pointer(&self) -> Reg {
        self.role_register(RegRoles::JAVA_STACK_POINTER)
    }

    /// Registers carrying a one- or two-word result.
    fn result_registers(&self) -> (Reg, Reg) {
        let args = self.argument_registers();
        (args[0], args[1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regset_ops() {
        let set = RegSet::EMPTY.insert(Reg(1)).insert(Reg(4)).insert(Reg(9));
        assert_eq!(set.count(), 3);
        assert!(set.contains(Reg(4)));
        assert!(!set.remove(Reg(4)).contains(Reg(4)));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![Reg(1), Reg(4), Reg(9)]);
        assert_eq!(
            set.difference(RegSet::singleton(Reg(1))).bits(),
            (1 << 4) | (1 << 9)
        );
    }

    #[test]
    fn test_interpreter_registers_never_allocatable() {
        for arch in Arch::ALL {
            let isa = isa_for(arch);
            let interp = isa.registers_with(RegRoles::INTERPRETER);
            assert!(!interp.is_empty(), "{arch} reserves interpreter state");
            assert!(isa.allocatable().intersection(interp).is_empty());
            assert!(!interp.contains(isa.scratch()));
            for arg in isa.argument_registers() {
                assert!(!interp.contains(arg));
            }
        }
    }

    #[test]
    fn test_special_registers_are_distinct() {
        for arch in Arch::ALL {
            let isa = isa_for(arch);
            let special = [isa.scratch(), isa.frame_pointer(), isa.java_stack_pointer()];
            for reg in special {
                assert!(!isa.allocatable().contains(reg), "{arch}: {reg:?}");
            }
            assert!(isa.argument_registers().len() >= 2);
        }
    }

    #[test]
    fn test_encoded_inst_push() {
        let mut inst = EncodedInst::new();
        inst.push(0xE8);
        inst.push_u32(0x1122_3344);
        assert_eq!(inst.as_slice(), &[0xE8, 0x44, 0x33, 0x22, 0x11]);
        assert_eq!(format!("{inst:?}"), "e8 44 33 22 11");
    }
}
