//! A32 instruction encoder and decoder.
//!
//! Covers the forms the JIT emits:
//! - Data processing with a register or rotated 8-bit immediate operand
//! - `mul`
//! - Word `ldr`/`str` with a 12-bit signed offset (including PC-relative)
//! - `b`/`bl`, `bx`/`blx`
//! - Block transfers (`push`, `pop`, `stmib`)
//!
//! Branch and literal displacements are measured from the instruction's own
//! address. Encoding subtracts the 8-byte pipeline bias; decoding adds it
//! back.

use std::fmt;

use super::registers::{self, PC, SP};
use crate::backend::Reg;

/// Distance between an instruction and the PC value it observes.
pub const PC_BIAS: i64 = 8;

/// Largest reach of `ldr rt, [pc, #imm]` in either direction.
pub const LDR_REACH: i64 = 4095;

/// Branch displacement bounds (inclusive), from the instruction address.
pub const BRANCH_MIN: i64 = -(1 << 25) + PC_BIAS;
pub const BRANCH_MAX: i64 = (1 << 25) - 4 + PC_BIAS;

// =============================================================================
// Conditions
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    Eq = 0x0,
    Ne = 0x1,
    Ge = 0xA,
    Lt = 0xB,
    Gt = 0xC,
    Le = 0xD,
    Al = 0xE,
}

impl Cond {
    pub const fn from_bits(bits: u32) -> Option<Self> {
        Some(match bits {
            0x0 => Cond::Eq,
            0x1 => Cond::Ne,
            0xA => Cond::Ge,
            0xB => Cond::Lt,
            0xC => Cond::Gt,
            0xD => Cond::Le,
            0xE => Cond::Al,
            _ => return None,
        })
    }

    pub const fn invert(self) -> Self {
        match self {
            Cond::Eq => Cond::Ne,
            Cond::Ne => Cond::Eq,
            Cond::Ge => Cond::Lt,
            Cond::Lt => Cond::Ge,
            Cond::Gt => Cond::Le,
            Cond::Le => Cond::Gt,
            Cond::Al => panic!("`al` has no inverse"),
        }
    }

    /// Mnemonic suffix; empty for `al`.
    pub const fn suffix(self) -> &'static str {
        match self {
            Cond::Eq => "eq",
            Cond::Ne => "ne",
            Cond::Ge => "ge",
            Cond::Lt => "lt",
            Cond::Gt => "gt",
            Cond::Le => "le",
            Cond::Al => "",
        }
    }
}

impl From<talon_core::Condition> for Cond {
    fn from(cond: talon_core::Condition) -> Self {
        use talon_core::Condition as C;
        match cond {
            C::Eq => Cond::Eq,
            C::Ne => Cond::Ne,
            C::Lt => Cond::Lt,
            C::Ge => Cond::Ge,
            C::Gt => Cond::Gt,
            C::Le => Cond::Le,
        }
    }
}

// =============================================================================
// Operands
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DpOp {
    And = 0x0,
    Eor = 0x1,
    Sub = 0x2,
    Add = 0x4,
    Adc = 0x5,
    Sbc = 0x6,
    Cmp = 0xA,
    Orr = 0xC,
    Mov = 0xD,
    Mvn = 0xF,
}

impl DpOp {
    const fn from_bits(bits: u32) -> Option<Self> {
        Some(match bits {
            0x0 => DpOp::And,
            0x1 => DpOp::Eor,
            0x2 => DpOp::Sub,
            0x4 => DpOp::Add,
            0x5 => DpOp::Adc,
            0x6 => DpOp::Sbc,
            0xA => DpOp::Cmp,
            0xC => DpOp::Orr,
            0xD => DpOp::Mov,
            0xF => DpOp::Mvn,
            _ => return None,
        })
    }

    const fn name(self) -> &'static str {
        match self {
            DpOp::And => "and",
            DpOp::Eor => "eor",
            DpOp::Sub => "sub",
            DpOp::Add => "add",
            DpOp::Adc => "adc",
            DpOp::Sbc => "sbc",
            DpOp::Cmp => "cmp",
            DpOp::Orr => "orr",
            DpOp::Mov => "mov",
            DpOp::Mvn => "mvn",
        }
    }

    /// Moves ignore `rn`.
    const fn is_move(self) -> bool {
        matches!(self, DpOp::Mov | DpOp::Mvn)
    }
}

/// Flexible second operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand2 {
    Reg(Reg),
    /// `imm8` rotated right by `2 * rot`.
    Imm { imm8: u8, rot: u8 },
}

impl Operand2 {
    /// Encode `value` as a rotated immediate, if possible.
    pub fn imm(value: u32) -> Option<Self> {
        (0..16u8).find_map(|rot| {
            let imm = value.rotate_left(2 * rot as u32);
            (imm <= 0xFF).then_some(Operand2::Imm {
                imm8: imm as u8,
                rot,
            })
        })
    }

    pub const fn imm_value(imm8: u8, rot: u8) -> u32 {
        (imm8 as u32).rotate_right(2 * rot as u32)
    }
}

impl fmt::Display for Operand2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Operand2::Reg(reg) => f.write_str(registers::name(reg)),
            Operand2::Imm { imm8, rot } => write!(f, "#{}", Operand2::imm_value(imm8, rot)),
        }
    }
}

/// Addressing mode of a block transfer, as the P and U bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockMode {
    /// Decrement after.
    Da = 0b00,
    /// Increment after.
    Ia = 0b01,
    /// Decrement before.
    Db = 0b10,
    /// Increment before.
    Ib = 0b11,
}

impl BlockMode {
    const fn from_bits(bits: u32) -> Self {
        match bits & 0b11 {
            0b00 => BlockMode::Da,
            0b01 => BlockMode::Ia,
            0b10 => BlockMode::Db,
            _ => BlockMode::Ib,
        }
    }

    const fn suffix(self) -> &'static str {
        match self {
            BlockMode::Da => "da",
            BlockMode::Ia => "ia",
            BlockMode::Db => "db",
            BlockMode::Ib => "ib",
        }
    }
}

// =============================================================================
// Instructions
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inst {
    DataProc {
        op: DpOp,
        s: bool,
        rd: Reg,
        rn: Reg,
        op2: Operand2,
    },
    /// `rd = rm * rs`
    Mul { s: bool, rd: Reg, rm: Reg, rs: Reg },
    Ldr { rt: Reg, rn: Reg, offset: i32 },
    Str { rt: Reg, rn: Reg, offset: i32 },
    B { cond: Cond, link: bool, disp: i32 },
    Bx { rm: Reg },
    Blx { rm: Reg },
    Stm {
        rn: Reg,
        regs: u16,
        mode: BlockMode,
        writeback: bool,
    },
    Ldm {
        rn: Reg,
        regs: u16,
        mode: BlockMode,
        writeback: bool,
    },
}

const COND_AL: u32 = 0xE000_0000;

#[inline]
fn field(reg: Reg) -> u32 {
    assert!(reg.0 < 16, "r{} is not an A32 register", reg.0);
    reg.0 as u32
}

/// Encode one instruction.
///
/// Panics if an operand does not fit its field.
pub fn encode(inst: &Inst) -> u32 {
    match *inst {
        Inst::DataProc { op, s, rd, rn, op2 } => {
            let (imm_bit, operand) = match op2 {
                Operand2::Reg(rm) => (0, field(rm)),
                Operand2::Imm { imm8, rot } => {
                    assert!(rot < 16, "rotation {rot} out of range");
                    (1, (rot as u32) << 8 | imm8 as u32)
                }
            };
            let (s, rd) = match op {
                DpOp::Cmp => (true, Reg(0)),
                _ => (s, rd),
            };
            let rn = if op.is_move() { Reg(0) } else { rn };
            COND_AL
                | imm_bit << 25
                | (op as u32) << 21
                | (s as u32) << 20
                | field(rn) << 16
                | field(rd) << 12
                | operand
        }
        Inst::Mul { s, rd, rm, rs } => {
            COND_AL | (s as u32) << 20 | field(rd) << 16 | field(rs) << 8 | 0x90 | field(rm)
        }
        Inst::Ldr { rt, rn, offset } | Inst::Str { rt, rn, offset } => {
            assert!(
                (-4095..=4095).contains(&offset),
                "ldr/str offset {offset} out of range"
            );
            let load = matches!(inst, Inst::Ldr { .. });
            COND_AL
                | 0x0500_0000
                | ((offset >= 0) as u32) << 23
                | (load as u32) << 20
                | field(rn) << 16
                | field(rt) << 12
                | offset.unsigned_abs()
        }
        Inst::B { cond, link, disp } => {
            let disp = disp as i64;
            assert!(disp % 4 == 0, "branch displacement {disp} is not word aligned");
            assert!(
                (BRANCH_MIN..=BRANCH_MAX).contains(&disp),
                "branch displacement {disp} out of range"
            );
            let imm24 = ((disp - PC_BIAS) >> 2) as u32 & 0x00FF_FFFF;
            (cond as u32) << 28 | 0x0A00_0000 | (link as u32) << 24 | imm24
        }
        Inst::Bx { rm } => 0xE12F_FF10 | field(rm),
        Inst::Blx { rm } => 0xE12F_FF30 | field(rm),
        Inst::Stm {
            rn,
            regs,
            mode,
            writeback,
        }
        | Inst::Ldm {
            rn,
            regs,
            mode,
            writeback,
        } => {
            assert!(regs != 0, "empty register list");
            let load = matches!(inst, Inst::Ldm { .. });
            COND_AL
                | 0x0800_0000
                | (mode as u32) << 23
                | (writeback as u32) << 21
                | (load as u32) << 20
                | field(rn) << 16
                | regs as u32
        }
    }
}

/// Decode a word produced by [`encode`].
pub fn decode(word: u32) -> Option<Inst> {
    let reg = |shift: u32| Reg(((word >> shift) & 0xF) as u8);

    if word & 0x0E00_0000 == 0x0A00_0000 {
        let cond = Cond::from_bits(word >> 28)?;
        let imm24 = (word & 0x00FF_FFFF) as i32;
        let disp = ((imm24 << 8) >> 6) + PC_BIAS as i32;
        return Some(Inst::B {
            cond,
            link: word & (1 << 24) != 0,
            disp,
        });
    }
    if word & 0xF000_0000 != COND_AL {
        return None;
    }
    if word & 0x0FFF_FFF0 == 0x012F_FF10 {
        return Some(Inst::Bx { rm: reg(0) });
    }
    if word & 0x0FFF_FFF0 == 0x012F_FF30 {
        return Some(Inst::Blx { rm: reg(0) });
    }
    if word & 0x0FE0_F0F0 == 0x0000_0090 {
        return Some(Inst::Mul {
            s: word & (1 << 20) != 0,
            rd: reg(16),
            rm: reg(0),
            rs: reg(8),
        });
    }
    if word & 0x0E40_0000 == 0x0800_0000 {
        let regs = (word & 0xFFFF) as u16;
        if regs == 0 {
            return None;
        }
        let mode = BlockMode::from_bits(word >> 23);
        let writeback = word & (1 << 21) != 0;
        let rn = reg(16);
        return Some(if word & (1 << 20) != 0 {
            Inst::Ldm {
                rn,
                regs,
                mode,
                writeback,
            }
        } else {
            Inst::Stm {
                rn,
                regs,
                mode,
                writeback,
            }
        });
    }
    if word & 0x0F60_0000 == 0x0500_0000 {
        let magnitude = (word & 0xFFF) as i32;
        let offset = if word & (1 << 23) != 0 {
            magnitude
        } else {
            -magnitude
        };
        let (rt, rn) = (reg(12), reg(16));
        return Some(if word & (1 << 20) != 0 {
            Inst::Ldr { rt, rn, offset }
        } else {
            Inst::Str { rt, rn, offset }
        });
    }
    if word & 0x0C00_0000 == 0 {
        let op = DpOp::from_bits((word >> 21) & 0xF)?;
        let s = word & (1 << 20) != 0;
        let op2 = if word & (1 << 25) != 0 {
            Operand2::Imm {
                imm8: (word & 0xFF) as u8,
                rot: ((word >> 8) & 0xF) as u8,
            }
        } else {
            if word & 0xFF0 != 0 {
                return None;
            }
            Operand2::Reg(reg(0))
        };
        let (rd, rn) = (reg(12), reg(16));
        if op == DpOp::Cmp && (!s || rd.0 != 0) {
            return None;
        }
        if op.is_move() && rn.0 != 0 {
            return None;
        }
        return Some(Inst::DataProc { op, s, rd, rn, op2 });
    }
    None
}

// =============================================================================
// Rendering
// =============================================================================

impl Inst {
    pub fn mnemonic(&self) -> String {
        match *self {
            Inst::DataProc { op, s, .. } => {
                let flags = if s && op != DpOp::Cmp { "s" } else { "" };
                format!("{}{flags}", op.name())
            }
            Inst::Mul { s, .. } => if s { "muls" } else { "mul" }.to_string(),
            Inst::Ldr { .. } => "ldr".to_string(),
            Inst::Str { .. } => "str".to_string(),
            Inst::B { cond, link, .. } => {
                format!("{}{}", if link { "bl" } else { "b" }, cond.suffix())
            }
            Inst::Bx { .. } => "bx".to_string(),
            Inst::Blx { .. } => "blx".to_string(),
            Inst::Stm {
                rn,
                mode: BlockMode::Db,
                writeback: true,
                ..
            } if rn == SP => "push".to_string(),
            Inst::Ldm {
                rn,
                mode: BlockMode::Ia,
                writeback: true,
                ..
            } if rn == SP => "pop".to_string(),
            Inst::Stm { mode, .. } => format!("stm{}", mode.suffix()),
            Inst::Ldm { mode, .. } => format!("ldm{}", mode.suffix()),
        }
    }

    /// Render operands; `at` resolves PC-relative targets to code offsets.
    pub fn operands(&self, at: usize) -> String {
        let name = registers::name;
        match *self {
            Inst::DataProc {
                op: DpOp::Cmp,
                rn,
                op2,
                ..
            } => format!("{}, {op2}", name(rn)),
            Inst::DataProc { op, rd, op2, .. } if op.is_move() => format!("{}, {op2}", name(rd)),
            Inst::DataProc { rd, rn, op2, .. } => {
                format!("{}, {}, {op2}", name(rd), name(rn))
            }
            Inst::Mul { rd, rm, rs, .. } => format!("{}, {}, {}", name(rd), name(rm), name(rs)),
            Inst::Ldr { rt, rn, offset } | Inst::Str { rt, rn, offset } => {
                if offset == 0 && rn != PC {
                    format!("{}, [{}]", name(rt), name(rn))
                } else {
                    format!("{}, [{}, #{offset}]", name(rt), name(rn))
                }
            }
            Inst::B { disp, .. } => format!("{:#x}", at as i64 + disp as i64),
            Inst::Bx { rm } | Inst::Blx { rm } => name(rm).to_string(),
            Inst::Stm {
                rn,
                regs,
                mode,
                writeback,
            }
            | Inst::Ldm {
                rn,
                regs,
                mode,
                writeback,
            } => {
                let is_stack_op = rn == SP
                    && writeback
                    && match self {
                        Inst::Stm { .. } => mode == BlockMode::Db,
                        _ => mode == BlockMode::Ia,
                    };
                if is_stack_op {
                    registers::list(regs)
                } else {
                    let wb = if writeback { "!" } else { "" };
                    format!("{}{wb}, {}", name(rn), registers::list(regs))
                }
            }
        }
    }

    /// Displacement to the PC-relative target, if any.
    pub fn pc_relative(&self) -> Option<i64> {
        match *self {
            Inst::B { disp, .. } => Some(disp as i64),
            Inst::Ldr { rn, offset, .. } if rn == PC => Some(offset as i64 + PC_BIAS),
            _ => None,
        }
    }
}
