//! IA-32 instruction encoder and decoder.
//!
//! Encodes the 32-bit forms the JIT emits:
//! ```text
//! [Opcode] [ModR/M] [SIB] [Disp] [Imm]
//! ```
//! No prefixes are ever produced. Branch displacements are carried from the
//! start of the instruction; the encoder subtracts the instruction length to
//! get the hardware `rel` field.

use std::fmt;

use super::registers::{self, ESP, low_bits, needs_displacement, needs_sib_as_base};
use crate::backend::{EncodedInst, Reg};

// =============================================================================
// ModR/M and SIB
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Mod {
    /// `[reg]`
    Indirect = 0b00,
    /// `[reg + disp8]`
    IndirectDisp8 = 0b01,
    /// `[reg + disp32]`
    IndirectDisp32 = 0b10,
    /// `reg`
    Direct = 0b11,
}

#[inline]
pub const fn modrm(mod_: Mod, reg: u8, rm: u8) -> u8 {
    ((mod_ as u8) << 6) | ((reg & 0x7) << 3) | (rm & 0x7)
}

/// SIB with scale 1, no index.
#[inline]
pub const fn sib_base(base: u8) -> u8 {
    (0b100 << 3) | (base & 0x7)
}

/// `[base + disp]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mem {
    pub base: Reg,
    pub disp: i32,
}

impl Mem {
    #[inline]
    pub const fn new(base: Reg, disp: i32) -> Self {
        Mem { base, disp }
    }

    #[inline]
    fn disp_fits_i8(&self) -> bool {
        i8::try_from(self.disp).is_ok()
    }
}

impl fmt::Display for Mem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let base = registers::name(self.base);
        match self.disp {
            0 => write!(f, "[{base}]"),
            d if d < 0 => write!(f, "[{base}-{}]", d.unsigned_abs()),
            d => write!(f, "[{base}+{d}]"),
        }
    }
}

fn encode_modrm_disp(enc: &mut EncodedInst, reg: u8, mem: &Mem) {
    let needs_disp = needs_displacement(mem.base) && mem.disp == 0;
    let mod_field = if mem.disp == 0 && !needs_disp {
        Mod::Indirect
    } else if mem.disp_fits_i8() {
        Mod::IndirectDisp8
    } else {
        Mod::IndirectDisp32
    };
    if needs_sib_as_base(mem.base) {
        enc.push(modrm(mod_field, reg, 0b100));
        enc.push(sib_base(low_bits(mem.base)));
    } else {
        enc.push(modrm(mod_field, reg, low_bits(mem.base)));
    }
    match mod_field {
        Mod::IndirectDisp8 => enc.push(mem.disp as i8 as u8),
        Mod::IndirectDisp32 => enc.push_u32(mem.disp as u32),
        _ => {}
    }
}

// =============================================================================
// Operations and conditions
// =============================================================================

/// Group-1 arithmetic; the value is the `/digit` extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AluKind {
    Add = 0,
    Or = 1,
    Adc = 2,
    Sbb = 3,
    And = 4,
    Sub = 5,
    Xor = 6,
    Cmp = 7,
}

impl AluKind {
    const fn from_ext(ext: u8) -> Self {
        match ext & 7 {
            0 => AluKind::Add,
            1 => AluKind::Or,
            2 => AluKind::Adc,
            3 => AluKind::Sbb,
            4 => AluKind::And,
            5 => AluKind::Sub,
            6 => AluKind::Xor,
            _ => AluKind::Cmp,
        }
    }

    /// Opcode of the `r/m32, r32` form.
    #[inline]
    const fn opcode_rr(self) -> u8 {
        (self as u8) << 3 | 0x01
    }

    const fn name(self) -> &'static str {
        match self {
            AluKind::Add => "add",
            AluKind::Or => "or",
            AluKind::Adc => "adc",
            AluKind::Sbb => "sbb",
            AluKind::And => "and",
            AluKind::Sub => "sub",
            AluKind::Xor => "xor",
            AluKind::Cmp => "cmp",
        }
    }
}

/// Condition codes for Jcc.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CondCode {
    Equal = 0x4,
    NotEqual = 0x5,
    Less = 0xC,
    GreaterEqual = 0xD,
    LessEqual = 0xE,
    Greater = 0xF,
}

impl CondCode {
    const fn from_bits(bits: u8) -> Option<Self> {
        Some(match bits {
            0x4 => CondCode::Equal,
            0x5 => CondCode::NotEqual,
            0xC => CondCode::Less,
            0xD => CondCode::GreaterEqual,
            0xE => CondCode::LessEqual,
            0xF => CondCode::Greater,
            _ => return None,
        })
    }

    const fn suffix(self) -> &'static str {
        match self {
            CondCode::Equal => "e",
            CondCode::NotEqual => "ne",
            CondCode::Less => "l",
            CondCode::GreaterEqual => "ge",
            CondCode::LessEqual => "le",
            CondCode::Greater => "g",
        }
    }
}

impl From<talon_core::Condition> for CondCode {
    fn from(cond: talon_core::Condition) -> Self {
        use talon_core::Condition as C;
        match cond {
            C::Eq => CondCode::Equal,
            C::Ne => CondCode::NotEqual,
            C::Lt => CondCode::Less,
            C::Ge => CondCode::GreaterEqual,
            C::Gt => CondCode::Greater,
            C::Le => CondCode::LessEqual,
        }
    }
}

// =============================================================================
// Instructions
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inst {
    /// `op dst, src`
    Alu { kind: AluKind, dst: Reg, src: Reg },
    /// `op dst, imm`
    AluImm { kind: AluKind, dst: Reg, imm: i32 },
    Imul { dst: Reg, src: Reg },
    Mov { dst: Reg, src: Reg },
    /// `mov dst, imm32`; the immediate is always four bytes.
    MovImm { dst: Reg, imm: u32 },
    Load { dst: Reg, mem: Mem },
    Store { mem: Mem, src: Reg },
    Lea { dst: Reg, mem: Mem },
    Push(Reg),
    Pop(Reg),
    Jmp { disp: i32, short: bool },
    Jcc { cc: CondCode, disp: i32, short: bool },
    Call { disp: i32 },
    CallReg(Reg),
    Ret,
    Nop,
}

/// `op r/m32, r32`
#[inline]
pub fn encode_rr(opcode: u8, dst: Reg, src: Reg) -> EncodedInst {
    let mut enc = EncodedInst::new();
    enc.push(opcode);
    enc.push(modrm(Mod::Direct, low_bits(src), low_bits(dst)));
    enc
}

/// `op r/m32, imm` with the shortest immediate.
#[inline]
pub fn encode_ri(digit: u8, dst: Reg, imm: i32) -> EncodedInst {
    let mut enc = EncodedInst::new();
    match i8::try_from(imm) {
        Ok(imm8) => {
            enc.push(0x83);
            enc.push(modrm(Mod::Direct, digit, low_bits(dst)));
            enc.push(imm8 as u8);
        }
        Err(_) => {
            enc.push(0x81);
            enc.push(modrm(Mod::Direct, digit, low_bits(dst)));
            enc.push_u32(imm as u32);
        }
    }
    enc
}

/// `op r32, [mem]` and `op [mem], r32`
#[inline]
pub fn encode_rm(opcode: u8, reg: Reg, mem: &Mem) -> EncodedInst {
    let mut enc = EncodedInst::new();
    enc.push(opcode);
    encode_modrm_disp(&mut enc, low_bits(reg), mem);
    enc
}

fn rel8(disp: i32, len: i32) -> u8 {
    match i8::try_from(disp - len) {
        Ok(rel) => rel as u8,
        Err(_) => panic!("short branch displacement {disp} out of range"),
    }
}

fn rel32(disp: i32, len: i32) -> u32 {
    match disp.checked_sub(len) {
        Some(rel) => rel as u32,
        None => panic!("branch displacement {disp} out of range"),
    }
}

/// Encode one instruction.
///
/// Panics if a short branch displacement does not fit in eight bits.
pub fn encode(inst: &Inst) -> EncodedInst {
    match *inst {
        Inst::Alu { kind, dst, src } => encode_rr(kind.opcode_rr(), dst, src),
        Inst::AluImm { kind, dst, imm } => encode_ri(kind as u8, dst, imm),
        Inst::Imul { dst, src } => {
            let mut enc = EncodedInst::new();
            enc.push(0x0F);
            enc.push(0xAF);
            enc.push(modrm(Mod::Direct, low_bits(dst), low_bits(src)));
            enc
        }
        Inst::Mov { dst, src } => encode_rr(0x89, dst, src),
        Inst::MovImm { dst, imm } => {
            let mut enc = EncodedInst::new();
            enc.push(0xB8 + low_bits(dst));
            enc.push_u32(imm);
            enc
        }
        Inst::Load { dst, mem } => encode_rm(0x8B, dst, &mem),
        Inst::Store { mem, src } => encode_rm(0x89, src, &mem),
        Inst::Lea { dst, mem } => encode_rm(0x8D, dst, &mem),
        Inst::Push(reg) => single(0x50 + low_bits(reg)),
        Inst::Pop(reg) => single(0x58 + low_bits(reg)),
        Inst::Jmp { disp, short: true } => {
            let mut enc = single(0xEB);
            enc.push(rel8(disp, 2));
            enc
        }
        Inst::Jmp { disp, short: false } => {
            let mut enc = single(0xE9);
            enc.push_u32(rel32(disp, 5));
            enc
        }
        Inst::Jcc {
            cc,
            disp,
            short: true,
        } => {
            let mut enc = single(0x70 + cc as u8);
            enc.push(rel8(disp, 2));
            enc
        }
        Inst::Jcc {
            cc,
            disp,
            short: false,
        } => {
            let mut enc = single(0x0F);
            enc.push(0x80 + cc as u8);
            enc.push_u32(rel32(disp, 6));
            enc
        }
        Inst::Call { disp } => {
            let mut enc = single(0xE8);
            enc.push_u32(rel32(disp, 5));
            enc
        }
        Inst::CallReg(reg) => {
            let mut enc = single(0xFF);
            enc.push(modrm(Mod::Direct, 2, low_bits(reg)));
            enc
        }
        Inst::Ret => single(0xC3),
        Inst::Nop => single(0x90),
    }
}

#[inline]
fn single(byte: u8) -> EncodedInst {
    let mut enc = EncodedInst::new();
    enc.push(byte);
    enc
}

// =============================================================================
// Decoder
// =============================================================================

struct Cursor<'a> {
    code: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn u8(&mut self) -> Option<u8> {
        let byte = *self.code.get(self.pos)?;
        self.pos += 1;
        Some(byte)
    }

    fn i32(&mut self) -> Option<i32> {
        let bytes = self.code.get(self.pos..self.pos + 4)?;
        self.pos += 4;
        Some(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Parse a register-direct ModR/M: `(reg, rm)`.
    fn direct(&mut self) -> Option<(u8, Reg)> {
        let byte = self.u8()?;
        (byte >> 6 == Mod::Direct as u8).then_some(((byte >> 3) & 7, Reg(byte & 7)))
    }

    /// Parse a memory ModR/M with optional SIB and displacement.
    fn memory(&mut self) -> Option<(Reg, Mem)> {
        let byte = self.u8()?;
        let (mod_bits, reg, rm) = (byte >> 6, Reg((byte >> 3) & 7), byte & 7);
        let base = match rm {
            0b100 => {
                let sib = self.u8()?;
                if sib != sib_base(ESP.0) {
                    return None;
                }
                ESP
            }
            0b101 if mod_bits == 0 => return None,
            _ => Reg(rm),
        };
        let disp = match mod_bits {
            0b00 => 0,
            0b01 => self.u8()? as i8 as i32,
            0b10 => self.i32()?,
            _ => return None,
        };
        Some((reg, Mem::new(base, disp)))
    }
}

/// Decode the instruction at `at`, returning it with its length.
pub fn decode(code: &[u8], at: usize) -> Option<(Inst, usize)> {
    let mut cur = Cursor { code, pos: at };
    let op = cur.u8()?;
    let inst = match op {
        0x01 | 0x09 | 0x11 | 0x19 | 0x21 | 0x29 | 0x31 | 0x39 => {
            let (src, dst) = cur.direct()?;
            Inst::Alu {
                kind: AluKind::from_ext(op >> 3),
                dst,
                src: Reg(src),
            }
        }
        0x83 => {
            let (ext, dst) = cur.direct()?;
            let imm = cur.u8()? as i8 as i32;
            Inst::AluImm {
                kind: AluKind::from_ext(ext),
                dst,
                imm,
            }
        }
        0x81 => {
            let (ext, dst) = cur.direct()?;
            Inst::AluImm {
                kind: AluKind::from_ext(ext),
                dst,
                imm: cur.i32()?,
            }
        }
        0x0F => match cur.u8()? {
            0xAF => {
                let (dst, src) = cur.direct()?;
                Inst::Imul { dst: Reg(dst), src }
            }
            cc @ 0x80..=0x8F => Inst::Jcc {
                cc: CondCode::from_bits(cc & 0xF)?,
                disp: cur.i32()?.wrapping_add(6),
                short: false,
            },
            _ => return None,
        },
        0x89 => {
            let modrm_byte = *code.get(cur.pos)?;
            if modrm_byte >> 6 == Mod::Direct as u8 {
                let (src, dst) = cur.direct()?;
                Inst::Mov { dst, src: Reg(src) }
            } else {
                let (src, mem) = cur.memory()?;
                Inst::Store { mem, src }
            }
        }
        0x8B => {
            let (dst, mem) = cur.memory()?;
            Inst::Load { dst, mem }
        }
        0x8D => {
            let (dst, mem) = cur.memory()?;
            Inst::Lea { dst, mem }
        }
        0xB8..=0xBF => Inst::MovImm {
            dst: Reg(op - 0xB8),
            imm: cur.i32()? as u32,
        },
        0x50..=0x57 => Inst::Push(Reg(op - 0x50)),
        0x58..=0x5F => Inst::Pop(Reg(op - 0x58)),
        0xEB => Inst::Jmp {
            disp: cur.u8()? as i8 as i32 + 2,
            short: true,
        },
        0xE9 => Inst::Jmp {
            disp: cur.i32()?.wrapping_add(5),
            short: false,
        },
        0x70..=0x7F => Inst::Jcc {
            cc: CondCode::from_bits(op & 0xF)?,
            disp: cur.u8()? as i8 as i32 + 2,
            short: true,
        },
        0xE8 => Inst::Call {
            disp: cur.i32()?.wrapping_add(5),
        },
        0xFF => match cur.direct()? {
            (2, target) => Inst::CallReg(target),
            _ => return None,
        },
        0xC3 => Inst::Ret,
        0x90 => Inst::Nop,
        _ => return None,
    };
    Some((inst, cur.pos - at))
}

// =============================================================================
// Rendering
// =============================================================================

impl Inst {
    pub fn mnemonic(&self) -> String {
        match *self {
            Inst::Alu { kind, .. } | Inst::AluImm { kind, .. } => kind.name().to_string(),
            Inst::Imul { .. } => "imul".to_string(),
            Inst::Mov { .. } | Inst::MovImm { .. } | Inst::Load { .. } | Inst::Store { .. } => {
                "mov".to_string()
            }
            Inst::Lea { .. } => "lea".to_string(),
            Inst::Push(_) => "push".to_string(),
            Inst::Pop(_) => "pop".to_string(),
            Inst::Jmp { .. } => "jmp".to_string(),
            Inst::Jcc { cc, .. } => format!("j{}", cc.suffix()),
            Inst::Call { .. } | Inst::CallReg(_) => "call".to_string(),
            Inst::Ret => "ret".to_string(),
            Inst::Nop => "nop".to_string(),
        }
    }

    pub fn operands(&self, at: usize) -> String {
        let name = registers::name;
        match *self {
            Inst::Alu { dst, src, .. } | Inst::Imul { dst, src } | Inst::Mov { dst, src } => {
                format!("{}, {}", name(dst), name(src))
            }
            Inst::AluImm { dst, imm, .. } => format!("{}, {imm}", name(dst)),
            Inst::MovImm { dst, imm } => format!("{}, {imm:#x}", name(dst)),
            Inst::Load { dst, mem } | Inst::Lea { dst, mem } => format!("{}, {mem}", name(dst)),
            Inst::Store { mem, src } => format!("{mem}, {}", name(src)),
            Inst::Push(reg) | Inst::Pop(reg) | Inst::CallReg(reg) => name(reg).to_string(),
            Inst::Jmp { disp, .. } | Inst::Jcc { disp, .. } | Inst::Call { disp } => {
                format!("{:#x}", at as i64 + disp as i64)
            }
            Inst::Ret | Inst::Nop => String::new(),
        }
    }

    pub fn pc_relative(&self) -> Option<i64> {
        match *self {
            Inst::Jmp { disp, .. } | Inst::Jcc { disp, .. } | Inst::Call { disp } => {
                Some(disp as i64)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::x86::registers::{EAX, EBP, EBX, ECX, EDX, ESI};

    fn bytes(inst: Inst) -> Vec<u8> {
        let enc = encode(&inst);
        let (decoded, len) = decode(enc.as_slice(), 0).expect("decodes");
        assert_eq!(decoded, inst);
        assert_eq!(len, enc.len());
        enc.as_slice().to_vec()
    }

    #[test]
    fn test_scenario_forms() {
        assert_eq!(
            bytes(Inst::Alu {
                kind: AluKind::Add,
                dst: EAX,
                src: ECX
            }),
            vec![0x01, 0xC8]
        );
        assert_eq!(bytes(Inst::Ret), vec![0xC3]);
    }

    #[test]
    fn test_alu_immediates() {
        assert_eq!(
            bytes(Inst::AluImm {
                kind: AluKind::Sub,
                dst: ESP,
                imm: 12
            }),
            vec![0x83, 0xEC, 0x0C]
        );
        assert_eq!(
            bytes(Inst::AluImm {
                kind: AluKind::Cmp,
                dst: EBX,
                imm: 1000
            }),
            vec![0x81, 0xFB, 0xE8, 0x03, 0x00, 0x00]
        );
        assert_eq!(bytes(Inst::Imul { dst: EAX, src: ECX }), vec![0x0F, 0xAF, 0xC1]);
    }

    #[test]
    fn test_memory_forms() {
        // ebp needs an explicit zero displacement
        assert_eq!(
            bytes(Inst::Load {
                dst: EAX,
                mem: Mem::new(EBP, 0)
            }),
            vec![0x8B, 0x45, 0x00]
        );
        // esp needs a SIB byte
        assert_eq!(
            bytes(Inst::Store {
                mem: Mem::new(ESP, 4),
                src: ECX
            }),
            vec![0x89, 0x4C, 0x24, 0x04]
        );
        assert_eq!(
            bytes(Inst::Lea {
                dst: ESI,
                mem: Mem::new(EBP, 400)
            }),
            vec![0x8D, 0xB5, 0x90, 0x01, 0x00, 0x00]
        );
        assert_eq!(
            bytes(Inst::Load {
                dst: EDX,
                mem: Mem::new(ESI, -4)
            }),
            vec![0x8B, 0x56, 0xFC]
        );
    }

    #[test]
    fn test_branch_displacements_from_start() {
        assert_eq!(
            bytes(Inst::Jmp {
                disp: 2,
                short: true
            }),
            vec![0xEB, 0x00]
        );
        assert_eq!(
            bytes(Inst::Jcc {
                cc: CondCode::Less,
                disp: -10,
                short: false
            }),
            vec![0x0F, 0x8C, 0xF0, 0xFF, 0xFF, 0xFF]
        );
        assert_eq!(bytes(Inst::Call { disp: 5 }), vec![0xE8, 0, 0, 0, 0]);
        assert_eq!(bytes(Inst::CallReg(EDX)), vec![0xFF, 0xD2]);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_short_branch_out_of_range() {
        encode(&Inst::Jmp {
            disp: 130,
            short: true,
        });
    }

    #[test]
    fn test_mov_imm_rendering() {
        let inst = Inst::MovImm {
            dst: EDX,
            imm: 0x9000,
        };
        assert_eq!(bytes(inst), vec![0xBA, 0x00, 0x90, 0x00, 0x00]);
        assert_eq!(inst.operands(0), "edx, 0x9000");
        assert_eq!(
            Inst::Store {
                mem: Mem::new(EBP, -8),
                src: EAX
            }
            .operands(0),
            "[ebp-8], eax"
        );
    }
}
