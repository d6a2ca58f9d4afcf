//! Thumb-1 instruction encoder and decoder.
//!
//! Only low registers (r0-r7) are encodable outside `mov` and `bx`/`blx`.
//! Displacements are measured from the instruction's own address; the
//! hardware PC reads as the address plus 4, word-aligned down for literal
//! loads.

use crate::backend::Reg;
use crate::backend::arm::encoder::Cond;

pub const PC_BIAS: i64 = 4;

/// Unconditional `b` displacement bounds (inclusive).
pub const B_MIN: i64 = -2048 + PC_BIAS;
pub const B_MAX: i64 = 2046 + PC_BIAS;

/// Conditional `b<cc>` displacement bounds (inclusive).
pub const BCOND_MIN: i64 = -256 + PC_BIAS;
pub const BCOND_MAX: i64 = 254 + PC_BIAS;

/// `bl` pair displacement bounds (inclusive).
pub const BL_MIN: i64 = -(1 << 22) + PC_BIAS;
pub const BL_MAX: i64 = (1 << 22) - 2 + PC_BIAS;

/// Furthest literal a `ldr rt, [pc, #imm]` can reach.
pub const LITERAL_REACH: u32 = 1020;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AluOp {
    And = 0x0,
    Eor = 0x1,
    Adc = 0x5,
    Sbc = 0x6,
    Cmp = 0xA,
    Orr = 0xC,
    Mul = 0xD,
}

impl AluOp {
    const fn from_bits(bits: u16) -> Option<Self> {
        Some(match bits {
            0x0 => AluOp::And,
            0x1 => AluOp::Eor,
            0x5 => AluOp::Adc,
            0x6 => AluOp::Sbc,
            0xA => AluOp::Cmp,
            0xC => AluOp::Orr,
            0xD => AluOp::Mul,
            _ => return None,
        })
    }

    const fn name(self) -> &'static str {
        match self {
            AluOp::And => "ands",
            AluOp::Eor => "eors",
            AluOp::Adc => "adcs",
            AluOp::Sbc => "sbcs",
            AluOp::Cmp => "cmp",
            AluOp::Orr => "orrs",
            AluOp::Mul => "muls",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inst {
    MovImm { rd: Reg, imm: u8 },
    /// High-register move; does not set flags.
    MovReg { rd: Reg, rm: Reg },
    AddReg { rd: Reg, rn: Reg, rm: Reg },
    SubReg { rd: Reg, rn: Reg, rm: Reg },
    AddImm3 { rd: Reg, rn: Reg, imm: u8 },
    SubImm3 { rd: Reg, rn: Reg, imm: u8 },
    AddImm8 { rdn: Reg, imm: u8 },
    SubImm8 { rdn: Reg, imm: u8 },
    CmpImm { rn: Reg, imm: u8 },
    /// Two-operand `rdn = rdn op rm`.
    Alu { op: AluOp, rdn: Reg, rm: Reg },
    /// `rd = sp + imm`
    AddSpImm { rd: Reg, imm: u16 },
    /// `sp = sp ± imm`
    AdjustSp { sub: bool, imm: u16 },
    Str { rt: Reg, rn: Reg, offset: u8 },
    Ldr { rt: Reg, rn: Reg, offset: u8 },
    /// `ldr rt, [pc, #imm]`
    LdrLiteral { rt: Reg, imm: u16 },
    BCond { cond: Cond, disp: i32 },
    B { disp: i32 },
    /// Both halves of `bl`.
    Bl { disp: i32 },
    Bx { rm: Reg },
    Blx { rm: Reg },
    /// Low registers in `list`, plus `lr`.
    Push { list: u8, lr: bool },
    /// Low registers in `list`, plus `pc`.
    Pop { list: u8, pc: bool },
}

#[inline]
fn low(reg: Reg) -> u16 {
    assert!(reg.0 < 8, "r{} is not a low register", reg.0);
    reg.0 as u16
}

#[inline]
fn any(reg: Reg) -> u16 {
    assert!(reg.0 < 16, "r{} is not a register", reg.0);
    reg.0 as u16
}

fn word_scaled(value: u32, max: u32, what: &str) -> u16 {
    assert!(
        value % 4 == 0 && value <= max,
        "{what} {value} not encodable"
    );
    (value / 4) as u16
}

/// Encode one instruction as one or two halfwords.
///
/// Panics if an operand does not fit its field.
pub fn encode(inst: &Inst) -> (u16, Option<u16>) {
    let half = match *inst {
        Inst::MovImm { rd, imm } => 0x2000 | low(rd) << 8 | imm as u16,
        Inst::MovReg { rd, rm } => 0x4600 | (any(rd) & 8) << 4 | any(rm) << 3 | (any(rd) & 7),
        Inst::AddReg { rd, rn, rm } => 0x1800 | low(rm) << 6 | low(rn) << 3 | low(rd),
        Inst::SubReg { rd, rn, rm } => 0x1A00 | low(rm) << 6 | low(rn) << 3 | low(rd),
        Inst::AddImm3 { rd, rn, imm } | Inst::SubImm3 { rd, rn, imm } => {
            assert!(imm < 8, "imm3 {imm} out of range");
            let base = if matches!(inst, Inst::AddImm3 { .. }) {
                0x1C00
            } else {
                0x1E00
            };
            base | (imm as u16) << 6 | low(rn) << 3 | low(rd)
        }
        Inst::AddImm8 { rdn, imm } => 0x3000 | low(rdn) << 8 | imm as u16,
        Inst::SubImm8 { rdn, imm } => 0x3800 | low(rdn) << 8 | imm as u16,
        Inst::CmpImm { rn, imm } => 0x2800 | low(rn) << 8 | imm as u16,
        Inst::Alu { op, rdn, rm } => 0x4000 | (op as u16) << 6 | low(rm) << 3 | low(rdn),
        Inst::AddSpImm { rd, imm } => {
            0xA800 | low(rd) << 8 | word_scaled(imm as u32, 1020, "add sp offset")
        }
        Inst::AdjustSp { sub, imm } => {
            0xB000 | (sub as u16) << 7 | word_scaled(imm as u32, 508, "sp adjustment")
        }
        Inst::Str { rt, rn, offset } | Inst::Ldr { rt, rn, offset } => {
            let base = if matches!(inst, Inst::Str { .. }) {
                0x6000
            } else {
                0x6800
            };
            base | word_scaled(offset as u32, 124, "ldr/str offset") << 6 | low(rn) << 3 | low(rt)
        }
        Inst::LdrLiteral { rt, imm } => {
            0x4800 | low(rt) << 8 | word_scaled(imm as u32, LITERAL_REACH, "literal offset")
        }
        Inst::BCond { cond, disp } => {
            assert!(cond != Cond::Al, "b<cc> needs a real condition");
            let field = branch_field(disp, BCOND_MIN, BCOND_MAX);
            0xD000 | (cond as u16) << 8 | (field & 0xFF) as u16
        }
        Inst::B { disp } => 0xE000 | (branch_field(disp, B_MIN, B_MAX) & 0x7FF) as u16,
        Inst::Bl { disp } => {
            let field = branch_field(disp, BL_MIN, BL_MAX);
            let hi = 0xF000 | ((field >> 11) & 0x7FF) as u16;
            let lo = 0xF800 | (field & 0x7FF) as u16;
            return (hi, Some(lo));
        }
        Inst::Bx { rm } => 0x4700 | any(rm) << 3,
        Inst::Blx { rm } => 0x4780 | any(rm) << 3,
        Inst::Push { list, lr } => 0xB400 | (lr as u16) << 8 | list as u16,
        Inst::Pop { list, pc } => 0xBC00 | (pc as u16) << 8 | list as u16,
    };
    (half, None)
}

fn branch_field(disp: i32, min: i64, max: i64) -> i32 {
    let disp = disp as i64;
    assert!(disp % 2 == 0, "branch displacement {disp} is not halfword aligned");
    assert!(
        (min..=max).contains(&disp),
        "branch displacement {disp} out of range"
    );
    ((disp - PC_BIAS) >> 1) as i32
}

/// Sign-extend the low `bits` of `value`.
#[inline]
fn sext(value: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((value << shift) as i32) >> shift
}

/// Decode the instruction starting with `half`; `next` is the following
/// halfword, needed only for `bl`.
pub fn decode(half: u16, next: Option<u16>) -> Option<Inst> {
    let reg = |shift: u16| Reg(((half >> shift) & 7) as u8);
    let imm8 = (half & 0xFF) as u8;
    Some(match half >> 11 {
        0b00011 => {
            let imm = ((half >> 6) & 7) as u8;
            let (rd, rn, rm) = (reg(0), reg(3), reg(6));
            match (half >> 9) & 3 {
                0b00 => Inst::AddReg { rd, rn, rm },
                0b01 => Inst::SubReg { rd, rn, rm },
                0b10 => Inst::AddImm3 { rd, rn, imm },
                _ => Inst::SubImm3 { rd, rn, imm },
            }
        }
        0b00100 => Inst::MovImm { rd: reg(8), imm: imm8 },
        0b00101 => Inst::CmpImm { rn: reg(8), imm: imm8 },
        0b00110 => Inst::AddImm8 { rdn: reg(8), imm: imm8 },
        0b00111 => Inst::SubImm8 { rdn: reg(8), imm: imm8 },
        0b01000 => match (half >> 8) & 7 {
            0b000 | 0b001 | 0b010 | 0b011 => Inst::Alu {
                op: AluOp::from_bits((half >> 6) & 0xF)?,
                rdn: reg(0),
                rm: reg(3),
            },
            0b110 => Inst::MovReg {
                rd: Reg((((half >> 4) & 8) | (half & 7)) as u8),
                rm: Reg(((half >> 3) & 0xF) as u8),
            },
            0b111 if half & 7 == 0 => {
                let rm = Reg(((half >> 3) & 0xF) as u8);
                if half & 0x80 != 0 {
                    Inst::Blx { rm }
                } else {
                    Inst::Bx { rm }
                }
            }
            _ => return None,
        },
        0b01001 => Inst::LdrLiteral {
            rt: reg(8),
            imm: (imm8 as u16) * 4,
        },
        0b01100 | 0b01101 => {
            let (rt, rn) = (reg(0), reg(3));
            let offset = (((half >> 6) & 0x1F) * 4) as u8;
            if half & 0x0800 != 0 {
                Inst::Ldr { rt, rn, offset }
            } else {
                Inst::Str { rt, rn, offset }
            }
        }
        0b10101 => Inst::AddSpImm {
            rd: reg(8),
            imm: (imm8 as u16) * 4,
        },
        0b10110 if half & 0x0700 == 0 => Inst::AdjustSp {
            sub: half & 0x80 != 0,
            imm: (half & 0x7F) * 4,
        },
        0b10110 if half & 0x0600 == 0x0400 => Inst::Push {
            list: imm8,
            lr: half & 0x100 != 0,
        },
        0b10111 if half & 0x0600 == 0x0400 => Inst::Pop {
            list: imm8,
            pc: half & 0x100 != 0,
        },
        0b11010 | 0b11011 => Inst::BCond {
            cond: Cond::from_bits(((half >> 8) & 0xF) as u32).filter(|c| *c != Cond::Al)?,
            disp: sext(imm8 as u32, 8) * 2 + PC_BIAS as i32,
        },
        0b11100 => Inst::B {
            disp: sext((half & 0x7FF) as u32, 11) * 2 + PC_BIAS as i32,
        },
        0b11110 => {
            let lo = next.filter(|lo| lo >> 11 == 0b11111)?;
            let field = ((half & 0x7FF) as u32) << 11 | (lo & 0x7FF) as u32;
            Inst::Bl {
                disp: sext(field, 22) * 2 + PC_BIAS as i32,
            }
        }
        _ => return None,
    })
}

impl Inst {
    #[inline]
    pub const fn len(&self) -> usize {
        match self {
            Inst::Bl { .. } => 4,
            _ => 2,
        }
    }

    pub fn mnemonic(&self) -> String {
        match *self {
            Inst::MovImm { .. } => "movs".to_string(),
            Inst::MovReg { .. } => "mov".to_string(),
            Inst::AddReg { .. } | Inst::AddImm3 { .. } | Inst::AddImm8 { .. } => {
                "adds".to_string()
            }
            Inst::SubReg { .. } | Inst::SubImm3 { .. } | Inst::SubImm8 { .. } => {
                "subs".to_string()
            }
            Inst::CmpImm { .. } => "cmp".to_string(),
            Inst::Alu { op, .. } => op.name().to_string(),
            Inst::AddSpImm { .. } => "add".to_string(),
            Inst::AdjustSp { sub, .. } => if sub { "sub" } else { "add" }.to_string(),
            Inst::Str { .. } => "str".to_string(),
            Inst::Ldr { .. } | Inst::LdrLiteral { .. } => "ldr".to_string(),
            Inst::BCond { cond, .. } => format!("b{}", cond.suffix()),
            Inst::B { .. } => "b".to_string(),
            Inst::Bl { .. } => "bl".to_string(),
            Inst::Bx { .. } => "bx".to_string(),
            Inst::Blx { .. } => "blx".to_string(),
            Inst::Push { .. } => "push".to_string(),
            Inst::Pop { .. } => "pop".to_string(),
        }
    }

    pub fn operands(&self, at: usize, name: impl Fn(Reg) -> &'static str) -> String {
        let list = |bits: u8, extra: Option<&'static str>| {
            let mut names: Vec<&str> = (0..8u8)
                .filter(|n| bits & (1 << n) != 0)
                .map(|n| name(Reg(n)))
                .collect();
            names.extend(extra);
            format!("{{{}}}", names.join(", "))
        };
        match *self {
            Inst::MovImm { rd, imm } => format!("{}, #{imm}", name(rd)),
            Inst::MovReg { rd, rm } => format!("{}, {}", name(rd), name(rm)),
            Inst::AddReg { rd, rn, rm } | Inst::SubReg { rd, rn, rm } => {
                format!("{}, {}, {}", name(rd), name(rn), name(rm))
            }
            Inst::AddImm3 { rd, rn, imm } | Inst::SubImm3 { rd, rn, imm } => {
                format!("{}, {}, #{imm}", name(rd), name(rn))
            }
            Inst::AddImm8 { rdn, imm } | Inst::SubImm8 { rdn, imm } => {
                format!("{}, #{imm}", name(rdn))
            }
            Inst::CmpImm { rn, imm } => format!("{}, #{imm}", name(rn)),
            Inst::Alu { rdn, rm, .. } => format!("{}, {}", name(rdn), name(rm)),
            Inst::AddSpImm { rd, imm } => format!("{}, sp, #{imm}", name(rd)),
            Inst::AdjustSp { imm, .. } => format!("sp, #{imm}"),
            Inst::Str { rt, rn, offset } | Inst::Ldr { rt, rn, offset } => {
                format!("{}, [{}, #{offset}]", name(rt), name(rn))
            }
            Inst::LdrLiteral { rt, imm } => format!("{}, [pc, #{imm}]", name(rt)),
            Inst::BCond { disp, .. } | Inst::B { disp } | Inst::Bl { disp } => {
                format!("{:#x}", at as i64 + disp as i64)
            }
            Inst::Bx { rm } | Inst::Blx { rm } => name(rm).to_string(),
            Inst::Push { list: bits, lr } => list(bits, lr.then_some("lr")),
            Inst::Pop { list: bits, pc } => list(bits, pc.then_some("pc")),
        }
    }

    /// Displacement to the PC-relative target, given the instruction's offset.
    pub fn pc_relative(&self, at: usize) -> Option<i64> {
        match *self {
            Inst::BCond { disp, .. } | Inst::B { disp } | Inst::Bl { disp } => Some(disp as i64),
            Inst::LdrLiteral { imm, .. } => {
                Some(literal_base(at as u32) as i64 + imm as i64 - at as i64)
            }
            _ => None,
        }
    }
}

/// Address literal offsets are measured from.
#[inline]
pub const fn literal_base(at: u32) -> u32 {
    (at + 4) & !3
}
