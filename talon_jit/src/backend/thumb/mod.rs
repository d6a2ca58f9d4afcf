//! Thumb-1 backend.
//!
//! Three caller-saved registers are available to the allocator; `r3` is
//! reserved as the scratch register that two-operand lowering and literal
//! calls go through. Frames are small: `str` reaches 31 words from `fp`.

pub mod encoder;

use talon_core::{Condition, ObjectRef, Stub, StubLocation};

use self::encoder::{AluOp as ThumbAlu, Inst, decode, encode, literal_base};
use super::{
    AluOp, Arch, DecodedInst, EmitResult, EncodedInst, FrameShape, Reg, RegRoles, RegisterInfo,
    TargetIsa, arm::encoder::Cond, overwrite, read_u16,
};
use crate::assembler::{CodeBuffer, Label};
use crate::reloc::RelocKind;

const SCRATCH: Reg = Reg(3);
const JSP: Reg = Reg(6);
const FP: Reg = Reg(7);
const LR: Reg = Reg(14);

/// r4-r7.
const SAVED_LIST: u8 = 0xF0;

const ARG: RegRoles = RegRoles::ARGUMENT.union(RegRoles::ALLOCATABLE);
const SAVED: RegRoles = RegRoles::CALLEE_SAVED.union(RegRoles::ALLOCATABLE);

static REGISTERS: [RegisterInfo; 16] = [
    RegisterInfo::new(0, "r0", ARG),
    RegisterInfo::new(1, "r1", ARG),
    RegisterInfo::new(2, "r2", ARG),
    RegisterInfo::new(3, "r3", RegRoles::SCRATCH),
    RegisterInfo::new(4, "r4", SAVED),
    RegisterInfo::new(5, "r5", SAVED),
    RegisterInfo::new(
        6,
        "r6",
        RegRoles::JAVA_STACK_POINTER.union(RegRoles::CALLEE_SAVED),
    ),
    RegisterInfo::new(
        7,
        "r7",
        RegRoles::FRAME_POINTER.union(RegRoles::CALLEE_SAVED),
    ),
    RegisterInfo::new(8, "r8", RegRoles::INTERPRETER),
    RegisterInfo::new(9, "r9", RegRoles::empty()),
    RegisterInfo::new(10, "r10", RegRoles::INTERPRETER),
    RegisterInfo::new(11, "r11", RegRoles::empty()),
    RegisterInfo::new(12, "ip", RegRoles::empty()),
    RegisterInfo::new(13, "sp", RegRoles::STACK_POINTER),
    RegisterInfo::new(14, "lr", RegRoles::LINK),
    RegisterInfo::new(15, "pc", RegRoles::PROGRAM_COUNTER),
];

fn name(reg: Reg) -> &'static str {
    REGISTERS.get(reg.0 as usize).map_or("?", |info| info.name)
}

/// Stateless Thumb-1 backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThumbIsa;

fn put(buf: &mut CodeBuffer, inst: Inst) -> EmitResult {
    let (first, second) = encode(&inst);
    buf.put_u16(first)?;
    if let Some(second) = second {
        buf.put_u16(second)?;
    }
    Ok(())
}

fn patch(code: &mut [u8], at: usize, inst: Inst) {
    let (first, second) = encode(&inst);
    let mut bytes = EncodedInst::new();
    bytes.push_u16(first);
    if let Some(second) = second {
        bytes.push_u16(second);
    }
    overwrite(code, at, inst.len(), &bytes);
}

fn decode_half(code: &[u8], at: usize) -> Option<Inst> {
    decode(read_u16(code, at)?, read_u16(code, at + 2))
}

fn pool_load(buf: &mut CodeBuffer, dst: Reg, value: u32, reloc: Option<RelocKind>) -> EmitResult {
    let at = buf.offset();
    buf.add_literal(at, value)?;
    if let Some(kind) = reloc {
        buf.add_relocation(at, kind);
    }
    put(buf, Inst::LdrLiteral { rt: dst, imm: 0 })
}

fn frame_offset(offset: i32) -> u8 {
    assert!(
        (0..=124).contains(&offset) && offset % 4 == 0,
        "frame offset {offset} not addressable"
    );
    offset as u8
}

fn relative(disp: i64) -> i32 {
    i32::try_from(disp).unwrap_or_else(|_| panic!("branch displacement {disp} out of range"))
}

impl TargetIsa for ThumbIsa {
    fn arch(&self) -> Arch {
        Arch::Thumb
    }

    fn registers(&self) -> &'static [RegisterInfo] {
        &REGISTERS
    }

    fn max_code_size(&self) -> usize {
        2044
    }

    fn max_frame_slots(&self) -> u16 {
        32
    }

    fn uses_literal_pool(&self) -> bool {
        true
    }

    fn literal_in_reach(&self, load_at: u32, literal_at: u32) -> bool {
        let base = literal_base(load_at);
        literal_at >= base && literal_at - base <= encoder::LITERAL_REACH
    }

    fn pool_padding(&self) -> &'static [u8] {
        // mov r8, r8
        &[0xC0, 0x46]
    }

    fn supports_store_multiple(&self) -> bool {
        false
    }

    fn emit_move(&self, buf: &mut CodeBuffer, dst: Reg, src: Reg) -> EmitResult {
        put(buf, Inst::MovReg { rd: dst, rm: src })
    }

    fn emit_move_imm(&self, buf: &mut CodeBuffer, dst: Reg, imm: i32) -> EmitResult {
        match u8::try_from(imm) {
            Ok(imm) => put(buf, Inst::MovImm { rd: dst, imm }),
            Err(_) => pool_load(buf, dst, imm as u32, None),
        }
    }

    fn emit_alu(
        &self,
        buf: &mut CodeBuffer,
        op: AluOp,
        dst: Reg,
        lhs: Reg,
        rhs: Reg,
    ) -> EmitResult {
        let two_operand = match op {
            AluOp::Add | AluOp::Adds => {
                return put(buf, Inst::AddReg { rd: dst, rn: lhs, rm: rhs });
            }
            AluOp::Sub | AluOp::Subs => {
                return put(buf, Inst::SubReg { rd: dst, rn: lhs, rm: rhs });
            }
            AluOp::Mul => ThumbAlu::Mul,
            AluOp::And => ThumbAlu::And,
            AluOp::Or => ThumbAlu::Orr,
            AluOp::Xor => ThumbAlu::Eor,
            AluOp::Adc => ThumbAlu::Adc,
            AluOp::Sbc => ThumbAlu::Sbc,
        };
        // mov does not touch the flags, so carry survives into adc/sbc.
        let rm = if dst == lhs {
            rhs
        } else if dst != rhs {
            self.emit_move(buf, dst, lhs)?;
            rhs
        } else if op.is_commutative() {
            lhs
        } else {
            self.emit_move(buf, SCRATCH, rhs)?;
            self.emit_move(buf, dst, lhs)?;
            SCRATCH
        };
        put(
            buf,
            Inst::Alu {
                op: two_operand,
                rdn: dst,
                rm,
            },
        )
    }

    fn emit_add_imm(&self, buf: &mut CodeBuffer, dst: Reg, src: Reg, imm: i32) -> EmitResult {
        const SP: Reg = Reg(13);
        if imm == 0 && dst == src {
            return Ok(());
        }
        if dst == SP && src == SP {
            let sub = imm < 0;
            let imm = u16::try_from(imm.unsigned_abs())
                .unwrap_or_else(|_| panic!("sp adjustment {imm} not encodable"));
            return put(buf, Inst::AdjustSp { sub, imm });
        }
        if src == SP {
            let imm = u16::try_from(imm)
                .unwrap_or_else(|_| panic!("sp offset {imm} not encodable"));
            return put(buf, Inst::AddSpImm { rd: dst, imm });
        }
        match imm {
            0..=7 => put(buf, Inst::AddImm3 { rd: dst, rn: src, imm: imm as u8 }),
            -7..=-1 => put(
                buf,
                Inst::SubImm3 {
                    rd: dst,
                    rn: src,
                    imm: (-imm) as u8,
                },
            ),
            8..=255 if dst == src => put(buf, Inst::AddImm8 { rdn: dst, imm: imm as u8 }),
            -255..=-8 if dst == src => put(
                buf,
                Inst::SubImm8 {
                    rdn: dst,
                    imm: (-imm) as u8,
                },
            ),
            _ => {
                assert_ne!(src, SCRATCH, "add_imm through r3 would clobber its source");
                self.emit_move_imm(buf, SCRATCH, imm)?;
                put(
                    buf,
                    Inst::AddReg {
                        rd: dst,
                        rn: src,
                        rm: SCRATCH,
                    },
                )
            }
        }
    }

    fn emit_compare(&self, buf: &mut CodeBuffer, lhs: Reg, rhs: Reg) -> EmitResult {
        put(
            buf,
            Inst::Alu {
                op: ThumbAlu::Cmp,
                rdn: lhs,
                rm: rhs,
            },
        )
    }

    fn emit_compare_imm(&self, buf: &mut CodeBuffer, lhs: Reg, imm: i32) -> EmitResult {
        if let Ok(imm) = u8::try_from(imm) {
            return put(buf, Inst::CmpImm { rn: lhs, imm });
        }
        self.emit_move_imm(buf, SCRATCH, imm)?;
        self.emit_compare(buf, lhs, SCRATCH)
    }

    fn emit_branch(
        &self,
        buf: &mut CodeBuffer,
        cond: Option<Condition>,
        target: Label,
    ) -> EmitResult {
        // b<cc> reaches only 256 bytes; hop over an unconditional b instead.
        if let Some(cond) = cond {
            put(
                buf,
                Inst::BCond {
                    cond: Cond::from(cond.invert()),
                    disp: 4,
                },
            )?;
        }
        let at = buf.offset();
        let disp = match buf.label_offset(target) {
            Some(bound) => relative(bound as i64 - at as i64),
            None => {
                buf.use_label(at, target);
                encoder::PC_BIAS as i32
            }
        };
        put(buf, Inst::B { disp })
    }

    fn emit_call(&self, buf: &mut CodeBuffer, stub: Stub, location: StubLocation) -> EmitResult {
        let at = buf.offset();
        match location {
            StubLocation::CodeHeap(target) => {
                let disp = target as i64 - (buf.base() + at as usize) as i64;
                buf.add_relocation(at, RelocKind::IntraCodeBranch { target });
                put(
                    buf,
                    Inst::Bl {
                        disp: relative(disp),
                    },
                )
            }
            StubLocation::Native(addr) => {
                pool_load(buf, SCRATCH, addr, Some(RelocKind::ExternalStub { stub }))?;
                put(buf, Inst::Blx { rm: SCRATCH })
            }
        }
    }

    fn emit_load(&self, buf: &mut CodeBuffer, dst: Reg, base: Reg, offset: i32) -> EmitResult {
        put(
            buf,
            Inst::Ldr {
                rt: dst,
                rn: base,
                offset: frame_offset(offset),
            },
        )
    }

    fn emit_store(&self, buf: &mut CodeBuffer, src: Reg, base: Reg, offset: i32) -> EmitResult {
        put(
            buf,
            Inst::Str {
                rt: src,
                rn: base,
                offset: frame_offset(offset),
            },
        )
    }

    fn emit_store_multiple(&self, _buf: &mut CodeBuffer, _base: Reg, _regs: &[Reg]) -> EmitResult {
        panic!("thumb has no pre-incrementing store-multiple")
    }

    fn emit_load_object(&self, buf: &mut CodeBuffer, dst: Reg, obj: ObjectRef) -> EmitResult {
        pool_load(buf, dst, obj.address(), Some(RelocKind::HeapObject))
    }

    fn emit_load_literal(&self, buf: &mut CodeBuffer, dst: Reg, value: u32) -> EmitResult {
        pool_load(buf, dst, value, Some(RelocKind::Literal))
    }

    fn emit_prologue(&self, buf: &mut CodeBuffer, shape: &FrameShape) -> EmitResult {
        const SP: Reg = Reg(13);
        put(
            buf,
            Inst::Push {
                list: SAVED_LIST,
                lr: true,
            },
        )?;
        self.emit_add_imm(buf, SP, SP, -(shape.slots as i32 * 4))?;
        put(buf, Inst::AddSpImm { rd: FP, imm: 0 })?;
        if shape.max_locals == 0 {
            put(
                buf,
                Inst::SubImm3 {
                    rd: JSP,
                    rn: FP,
                    imm: 4,
                },
            )
        } else {
            put(
                buf,
                Inst::AddSpImm {
                    rd: JSP,
                    imm: shape.jsp_offset(0) as u16,
                },
            )
        }
    }

    fn emit_return(&self, buf: &mut CodeBuffer, shape: Option<&FrameShape>) -> EmitResult {
        const SP: Reg = Reg(13);
        let Some(shape) = shape else {
            return put(buf, Inst::Bx { rm: LR });
        };
        self.emit_add_imm(buf, SP, SP, shape.slots as i32 * 4)?;
        put(
            buf,
            Inst::Pop {
                list: SAVED_LIST,
                pc: true,
            },
        )
    }

    fn pc_relative(&self, code: &[u8], at: usize) -> Option<i64> {
        decode_half(code, at)?.pc_relative(at)
    }

    fn set_pc_relative(&self, code: &mut [u8], at: usize, disp: i64) {
        let inst = match decode_half(code, at) {
            Some(Inst::B { .. }) => Inst::B {
                disp: relative(disp),
            },
            Some(Inst::BCond { cond, .. }) => Inst::BCond {
                cond,
                disp: relative(disp),
            },
            Some(Inst::Bl { .. }) => Inst::Bl {
                disp: relative(disp),
            },
            Some(Inst::LdrLiteral { rt, .. }) => {
                let target = at as i64 + disp;
                let imm = target - literal_base(at as u32) as i64;
                assert!(
                    (0..=encoder::LITERAL_REACH as i64).contains(&imm) && imm % 4 == 0,
                    "literal at {at:#x}{disp:+} out of range"
                );
                Inst::LdrLiteral {
                    rt,
                    imm: imm as u16,
                }
            }
            _ => panic!("no PC-relative instruction at {at:#x}"),
        };
        patch(code, at, inst);
    }

    fn pc_relative_fits(&self, code: &[u8], at: usize, disp: i64) -> bool {
        let within = |min: i64, max: i64| disp % 2 == 0 && (min..=max).contains(&disp);
        match decode_half(code, at) {
            Some(Inst::B { .. }) => within(encoder::B_MIN, encoder::B_MAX),
            Some(Inst::BCond { .. }) => within(encoder::BCOND_MIN, encoder::BCOND_MAX),
            Some(Inst::Bl { .. }) => within(encoder::BL_MIN, encoder::BL_MAX),
            Some(Inst::LdrLiteral { .. }) => {
                let imm = at as i64 + disp - literal_base(at as u32) as i64;
                (0..=encoder::LITERAL_REACH as i64).contains(&imm) && imm % 4 == 0
            }
            _ => false,
        }
    }

    fn embedded_word_at(&self, code: &[u8], at: usize) -> Option<usize> {
        match decode_half(code, at)? {
            Inst::LdrLiteral { imm, .. } => Some(literal_base(at as u32) as usize + imm as usize),
            _ => None,
        }
    }

    fn decode_at(&self, code: &[u8], at: usize) -> Option<DecodedInst> {
        let inst = decode_half(code, at)?;
        Some(DecodedInst {
            len: inst.len(),
            mnemonic: inst.mnemonic(),
            operands: inst.operands(at, name),
            pc_target: inst.pc_relative(at),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn halves(buf: &CodeBuffer) -> Vec<u16> {
        buf.bytes()
            .chunks(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect()
    }

    #[test]
    fn test_two_operand_lowering() {
        let mut buf = CodeBuffer::new(64, 4);
        // dst == lhs
        ThumbIsa
            .emit_alu(&mut buf, AluOp::And, Reg(0), Reg(0), Reg(1))
            .unwrap();
        // dst == rhs, commutative
        ThumbIsa
            .emit_alu(&mut buf, AluOp::Xor, Reg(1), Reg(0), Reg(1))
            .unwrap();
        // dst == rhs, non-commutative
        ThumbIsa
            .emit_alu(&mut buf, AluOp::Sbc, Reg(1), Reg(0), Reg(1))
            .unwrap();
        assert_eq!(
            halves(&buf),
            vec![
                0x4008, // ands r0, r1
                0x4041, // eors r1, r0
                0x460B, // mov r3, r1
                0x4601, // mov r1, r0
                0x4199, // sbcs r1, r3
            ]
        );
    }

    #[test]
    fn test_conditional_branch_is_a_pair() {
        let mut buf = CodeBuffer::new(64, 4);
        let target = buf.new_label();
        buf.bind_label(target);
        ThumbIsa
            .emit_branch(&mut buf, Some(Condition::Lt), target)
            .unwrap();
        // bge +4; b target
        assert_eq!(halves(&buf), vec![0xDA00, 0xE7FD]);
        assert_eq!(ThumbIsa.pc_relative(buf.bytes(), 2), Some(-2));
    }

    #[test]
    fn test_prologue_sequences() {
        let mut buf = CodeBuffer::new(64, 4);
        let shape = FrameShape {
            slots: 4,
            max_locals: 2,
        };
        ThumbIsa.emit_prologue(&mut buf, &shape).unwrap();
        ThumbIsa.emit_return(&mut buf, Some(&shape)).unwrap();
        assert_eq!(
            halves(&buf),
            vec![0xB5F0, 0xB084, 0xAF00, 0xAE01, 0xB004, 0xBDF0]
        );

        let mut buf = CodeBuffer::new(64, 4);
        let empty = FrameShape {
            slots: 1,
            max_locals: 0,
        };
        ThumbIsa.emit_prologue(&mut buf, &empty).unwrap();
        assert_eq!(halves(&buf)[3], 0x1F3E);
    }

    #[test]
    fn test_literal_call_and_reach() {
        let mut buf = CodeBuffer::new(64, 4);
        ThumbIsa
            .emit_call(&mut buf, Stub::Invoke, StubLocation::Native(0x8000))
            .unwrap();
        assert_eq!(halves(&buf), vec![0x4B00, 0x4798]);
        assert!(ThumbIsa.literal_in_reach(0, 4));
        assert!(ThumbIsa.literal_in_reach(2, 1024));
        assert!(!ThumbIsa.literal_in_reach(2, 1028));
        assert!(!ThumbIsa.literal_in_reach(8, 4));
    }

    #[test]
    fn test_code_heap_call_patch() {
        let mut buf = CodeBuffer::new(64, 4);
        ThumbIsa
            .emit_call(&mut buf, Stub::Invoke, StubLocation::CodeHeap(0x200))
            .unwrap();
        let mut code = buf.bytes().to_vec();
        assert_eq!(ThumbIsa.pc_relative(&code, 0), Some(0x200));
        ThumbIsa.set_pc_relative(&mut code, 0, -0x1000);
        assert_eq!(ThumbIsa.pc_relative(&code, 0), Some(-0x1000));
        assert_eq!(code.len(), 4);
    }

    #[test]
    fn test_call_reach() {
        let mut buf = CodeBuffer::new(64, 4);
        ThumbIsa
            .emit_call(&mut buf, Stub::Invoke, StubLocation::CodeHeap(0x200))
            .unwrap();
        let code = buf.bytes().to_vec();
        assert!(ThumbIsa.pc_relative_fits(&code, 0, encoder::BL_MAX));
        assert!(ThumbIsa.pc_relative_fits(&code, 0, encoder::BL_MIN));
        assert!(!ThumbIsa.pc_relative_fits(&code, 0, encoder::BL_MAX + 2));
        assert!(!ThumbIsa.pc_relative_fits(&code, 0, 3));
    }

    #[test]
    #[should_panic(expected = "not addressable")]
    fn test_frame_offset_limit() {
        let mut buf = CodeBuffer::new(64, 4);
        let _ = ThumbIsa.emit_store(&mut buf, Reg(0), FP, 128);
    }
}
