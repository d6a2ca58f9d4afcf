//! ARM (A32) backend.

pub mod encoder;
pub mod registers;

use talon_core::{Condition, ObjectRef, Stub, StubLocation};

use self::encoder::{BlockMode, Cond, DpOp, Inst, Operand2, decode, encode};
use self::registers::{IP, LR, PC, REGISTERS, SAVED_MASK, SP};
use super::{
    AluOp, Arch, DecodedInst, EmitResult, EncodedInst, FrameShape, Reg, RegisterInfo, TargetIsa,
    overwrite, read_u32,
};
use crate::assembler::{CodeBuffer, Label};
use crate::reloc::RelocKind;

/// Stateless A32 backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct ArmIsa;

#[inline]
fn put(buf: &mut CodeBuffer, inst: Inst) -> EmitResult {
    buf.put_u32(encode(&inst))
}

fn patch(code: &mut [u8], at: usize, inst: Inst) {
    let mut bytes = EncodedInst::new();
    bytes.push_u32(encode(&inst));
    overwrite(code, at, 4, &bytes);
}

fn decode_word(code: &[u8], at: usize) -> Option<Inst> {
    read_u32(code, at).and_then(decode)
}

/// Emit `ldr dst, [pc, #?]` and queue `value` for the next pool.
fn pool_load(buf: &mut CodeBuffer, dst: Reg, value: u32, reloc: Option<RelocKind>) -> EmitResult {
    let at = buf.offset();
    buf.add_literal(at, value)?;
    if let Some(kind) = reloc {
        buf.add_relocation(at, kind);
    }
    put(
        buf,
        Inst::Ldr {
            rt: dst,
            rn: PC,
            offset: 0,
        },
    )
}

fn data_proc(op: DpOp, s: bool, rd: Reg, rn: Reg, op2: Operand2) -> Inst {
    Inst::DataProc { op, s, rd, rn, op2 }
}

impl TargetIsa for ArmIsa {
    fn arch(&self) -> Arch {
        Arch::Arm
    }

    fn registers(&self) -> &'static [RegisterInfo] {
        &REGISTERS
    }

    fn max_code_size(&self) -> usize {
        1 << 25
    }

    fn max_frame_slots(&self) -> u16 {
        255
    }

    fn uses_literal_pool(&self) -> bool {
        true
    }

    fn literal_in_reach(&self, load_at: u32, literal_at: u32) -> bool {
        let offset = literal_at as i64 - load_at as i64 - encoder::PC_BIAS;
        offset.abs() <= encoder::LDR_REACH
    }

    fn pool_padding(&self) -> &'static [u8] {
        // mov r0, r0
        &[0x00, 0x00, 0xA0, 0xE1]
    }

    fn supports_store_multiple(&self) -> bool {
        true
    }

    fn emit_move(&self, buf: &mut CodeBuffer, dst: Reg, src: Reg) -> EmitResult {
        put(buf, data_proc(DpOp::Mov, false, dst, Reg(0), Operand2::Reg(src)))
    }

    fn emit_move_imm(&self, buf: &mut CodeBuffer, dst: Reg, imm: i32) -> EmitResult {
        if let Some(op2) = Operand2::imm(imm as u32) {
            put(buf, data_proc(DpOp::Mov, false, dst, Reg(0), op2))
        } else if let Some(op2) = Operand2::imm(!imm as u32) {
            put(buf, data_proc(DpOp::Mvn, false, dst, Reg(0), op2))
        } else {
            pool_load(buf, dst, imm as u32, None)
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
        let (dp, s) = match op {
            AluOp::Mul => {
                return put(
                    buf,
                    Inst::Mul {
                        s: false,
                        rd: dst,
                        rm: lhs,
                        rs: rhs,
                    },
                );
            }
            AluOp::Add => (DpOp::Add, false),
            AluOp::Sub => (DpOp::Sub, false),
            AluOp::And => (DpOp::And, false),
            AluOp::Or => (DpOp::Orr, false),
            AluOp::Xor => (DpOp::Eor, false),
            AluOp::Adds => (DpOp::Add, true),
            AluOp::Adc => (DpOp::Adc, false),
            AluOp::Subs => (DpOp::Sub, true),
            AluOp::Sbc => (DpOp::Sbc, false),
        };
        put(buf, data_proc(dp, s, dst, lhs, Operand2::Reg(rhs)))
    }

    fn emit_add_imm(&self, buf: &mut CodeBuffer, dst: Reg, src: Reg, imm: i32) -> EmitResult {
        if imm == 0 && dst == src {
            return Ok(());
        }
        if let Some(op2) = Operand2::imm(imm as u32) {
            return put(buf, data_proc(DpOp::Add, false, dst, src, op2));
        }
        if let Some(op2) = Operand2::imm(imm.unsigned_abs()).filter(|_| imm < 0) {
            return put(buf, data_proc(DpOp::Sub, false, dst, src, op2));
        }
        assert_ne!(src, IP, "add_imm through ip would clobber its source");
        self.emit_move_imm(buf, IP, imm)?;
        put(buf, data_proc(DpOp::Add, false, dst, src, Operand2::Reg(IP)))
    }

    fn emit_compare(&self, buf: &mut CodeBuffer, lhs: Reg, rhs: Reg) -> EmitResult {
        put(buf, data_proc(DpOp::Cmp, true, Reg(0), lhs, Operand2::Reg(rhs)))
    }

    fn emit_compare_imm(&self, buf: &mut CodeBuffer, lhs: Reg, imm: i32) -> EmitResult {
        if let Some(op2) = Operand2::imm(imm as u32) {
            return put(buf, data_proc(DpOp::Cmp, true, Reg(0), lhs, op2));
        }
        self.emit_move_imm(buf, IP, imm)?;
        self.emit_compare(buf, lhs, IP)
    }

    fn emit_branch(
        &self,
        buf: &mut CodeBuffer,
        cond: Option<Condition>,
        target: Label,
    ) -> EmitResult {
        let at = buf.offset();
        let disp = match buf.label_offset(target) {
            Some(bound) => bound as i64 - at as i64,
            None => {
                buf.use_label(at, target);
                0
            }
        };
        let cond = cond.map_or(Cond::Al, Cond::from);
        put(
            buf,
            Inst::B {
                cond,
                link: false,
                disp: branch_disp(disp),
            },
        )
    }

    fn emit_call(&self, buf: &mut CodeBuffer, stub: Stub, location: StubLocation) -> EmitResult {
        let at = buf.offset();
        match location {
            StubLocation::CodeHeap(target) => {
                let disp = target as i64 - (buf.base() + at as usize) as i64;
                buf.add_relocation(at, RelocKind::IntraCodeBranch { target });
                put(
                    buf,
                    Inst::B {
                        cond: Cond::Al,
                        link: true,
                        disp: branch_disp(disp),
                    },
                )
            }
            StubLocation::Native(addr) => {
                pool_load(buf, IP, addr, Some(RelocKind::ExternalStub { stub }))?;
                put(buf, Inst::Blx { rm: IP })
            }
        }
    }

    fn emit_load(&self, buf: &mut CodeBuffer, dst: Reg, base: Reg, offset: i32) -> EmitResult {
        put(
            buf,
            Inst::Ldr {
                rt: dst,
                rn: base,
                offset,
            },
        )
    }

    fn emit_store(&self, buf: &mut CodeBuffer, src: Reg, base: Reg, offset: i32) -> EmitResult {
        put(
            buf,
            Inst::Str {
                rt: src,
                rn: base,
                offset,
            },
        )
    }

    fn emit_store_multiple(&self, buf: &mut CodeBuffer, base: Reg, regs: &[Reg]) -> EmitResult {
        assert!(
            regs.windows(2).all(|pair| pair[0] < pair[1]),
            "stm register list must ascend: {regs:?}"
        );
        let mask = regs.iter().fold(0u16, |acc, reg| acc | (1 << reg.0));
        put(
            buf,
            Inst::Stm {
                rn: base,
                regs: mask,
                mode: BlockMode::Ib,
                writeback: true,
            },
        )
    }

    fn emit_load_object(&self, buf: &mut CodeBuffer, dst: Reg, obj: ObjectRef) -> EmitResult {
        pool_load(buf, dst, obj.address(), Some(RelocKind::HeapObject))
    }

    fn emit_load_literal(&self, buf: &mut CodeBuffer, dst: Reg, value: u32) -> EmitResult {
        pool_load(buf, dst, value, Some(RelocKind::Literal))
    }

    fn emit_prologue(&self, buf: &mut CodeBuffer, shape: &FrameShape) -> EmitResult {
        put(
            buf,
            Inst::Stm {
                rn: SP,
                regs: SAVED_MASK | 1 << LR.0,
                mode: BlockMode::Db,
                writeback: true,
            },
        )?;
        self.emit_add_imm(buf, SP, SP, -(shape.slots as i32 * 4))?;
        let fp = self.frame_pointer();
        self.emit_move(buf, fp, SP)?;
        let jsp = self.java_stack_pointer();
        self.emit_add_imm(buf, jsp, fp, shape.jsp_offset(0))
    }

    fn emit_return(&self, buf: &mut CodeBuffer, shape: Option<&FrameShape>) -> EmitResult {
        let Some(shape) = shape else {
            return put(buf, Inst::Bx { rm: LR });
        };
        self.emit_add_imm(buf, SP, SP, shape.slots as i32 * 4)?;
        put(
            buf,
            Inst::Ldm {
                rn: SP,
                regs: SAVED_MASK | 1 << PC.0,
                mode: BlockMode::Ia,
                writeback: true,
            },
        )
    }

    fn pc_relative(&self, code: &[u8], at: usize) -> Option<i64> {
        decode_word(code, at)?.pc_relative()
    }

    fn set_pc_relative(&self, code: &mut [u8], at: usize, disp: i64) {
        let inst = match decode_word(code, at) {
            Some(Inst::B { cond, link, .. }) => Inst::B {
                cond,
                link,
                disp: branch_disp(disp),
            },
            Some(Inst::Ldr { rt, rn, .. }) if rn == PC => {
                let offset = disp - encoder::PC_BIAS;
                assert!(
                    offset.abs() <= encoder::LDR_REACH,
                    "literal at {at:#x}{disp:+} out of range"
                );
                Inst::Ldr {
                    rt,
                    rn,
                    offset: offset as i32,
                }
            }
            _ => panic!("no PC-relative instruction at {at:#x}"),
        };
        patch(code, at, inst);
    }

    fn pc_relative_fits(&self, code: &[u8], at: usize, disp: i64) -> bool {
        match decode_word(code, at) {
            Some(Inst::B { .. }) => {
                disp % 4 == 0 && (encoder::BRANCH_MIN..=encoder::BRANCH_MAX).contains(&disp)
            }
            Some(Inst::Ldr { rn, .. }) if rn == PC => {
                (disp - encoder::PC_BIAS).abs() <= encoder::LDR_REACH
            }
            _ => false,
        }
    }

    fn embedded_word_at(&self, code: &[u8], at: usize) -> Option<usize> {
        match decode_word(code, at)? {
            Inst::Ldr { rn, offset, .. } if rn == PC => {
                usize::try_from(at as i64 + offset as i64 + encoder::PC_BIAS).ok()
            }
            _ => None,
        }
    }

    fn decode_at(&self, code: &[u8], at: usize) -> Option<DecodedInst> {
        let inst = decode_word(code, at)?;
        Some(DecodedInst {
            len: 4,
            mnemonic: inst.mnemonic(),
            operands: inst.operands(at),
            pc_target: inst.pc_relative(),
        })
    }
}

/// Narrow a branch displacement, panicking when it cannot be encoded.
fn branch_disp(disp: i64) -> i32 {
    assert!(
        (encoder::BRANCH_MIN..=encoder::BRANCH_MAX).contains(&disp),
        "branch displacement {disp} out of range"
    );
    disp as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(buf: &CodeBuffer) -> Vec<u32> {
        buf.bytes()
            .chunks(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn test_move_imm_forms() {
        let mut buf = CodeBuffer::new(64, 4);
        ArmIsa.emit_move_imm(&mut buf, Reg(0), 255).unwrap();
        ArmIsa.emit_move_imm(&mut buf, Reg(1), -1).unwrap();
        ArmIsa.emit_move_imm(&mut buf, Reg(2), 0x1234_5678).unwrap();
        assert_eq!(words(&buf), vec![0xE3A0_00FF, 0xE3E0_1000, 0xE59F_2000]);
        assert_eq!(buf.pending_literals().len(), 1);
        assert!(buf.relocations().is_empty());
    }

    #[test]
    fn test_add_imm_negative_and_wide() {
        let mut buf = CodeBuffer::new(64, 4);
        ArmIsa.emit_add_imm(&mut buf, Reg(9), Reg(11), -4).unwrap();
        ArmIsa.emit_add_imm(&mut buf, Reg(9), Reg(9), 0).unwrap();
        ArmIsa.emit_add_imm(&mut buf, Reg(0), Reg(1), 0x101).unwrap();
        // 0x101 is not a rotated immediate: ldr ip, =0x101; add r0, r1, ip
        assert_eq!(words(&buf)[0], 0xE24B_9004);
        assert_eq!(words(&buf).len(), 3);
        assert_eq!(words(&buf)[2], 0xE081_000C);
    }

    #[test]
    fn test_native_call_records_stub() {
        let mut buf = CodeBuffer::new(64, 4);
        ArmIsa
            .emit_call(&mut buf, Stub::FloatAdd, StubLocation::Native(0x9000))
            .unwrap();
        assert_eq!(words(&buf), vec![0xE59F_C000, 0xE12F_FF3C]);
        assert_eq!(
            buf.relocations()[0].kind,
            RelocKind::ExternalStub {
                stub: Stub::FloatAdd
            }
        );
    }

    #[test]
    fn test_code_heap_call_is_pc_relative() {
        let mut buf = CodeBuffer::new(64, 4);
        buf.put_u32(0).unwrap();
        ArmIsa
            .emit_call(&mut buf, Stub::Invoke, StubLocation::CodeHeap(0x1004))
            .unwrap();
        assert_eq!(ArmIsa.pc_relative(buf.bytes(), 4), Some(0x1000));
        assert_eq!(
            buf.relocations()[0].kind,
            RelocKind::IntraCodeBranch { target: 0x1004 }
        );
    }

    #[test]
    fn test_prologue_and_epilogue() {
        let shape = FrameShape {
            slots: 3,
            max_locals: 2,
        };
        let mut buf = CodeBuffer::new(64, 4);
        ArmIsa.emit_prologue(&mut buf, &shape).unwrap();
        ArmIsa.emit_return(&mut buf, Some(&shape)).unwrap();
        assert_eq!(
            words(&buf),
            vec![
                0xE92D_4AF0, // push {r4-r7, r9, fp, lr}
                0xE24D_D00C, // sub sp, sp, #12
                0xE1A0_B00D, // mov fp, sp
                0xE28B_9004, // add r9, fp, #4
                0xE28D_D00C, // add sp, sp, #12
                0xE8BD_8AF0, // pop {r4-r7, r9, fp, pc}
            ]
        );
    }

    #[test]
    fn test_set_pc_relative_literal() {
        let mut code = encode(&Inst::Ldr {
            rt: Reg(0),
            rn: PC,
            offset: 0,
        })
        .to_le_bytes()
        .to_vec();
        ArmIsa.set_pc_relative(&mut code, 0, 16);
        assert_eq!(ArmIsa.embedded_word_at(&code, 0), Some(16));
        assert_eq!(ArmIsa.pc_relative(&code, 0), Some(16));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_branch_past_reach_panics() {
        let mut code = encode(&Inst::B {
            cond: Cond::Al,
            link: false,
            disp: 0,
        })
        .to_le_bytes()
        .to_vec();
        ArmIsa.set_pc_relative(&mut code, 0, encoder::BRANCH_MAX + 4);
    }

    #[test]
    fn test_literal_reach() {
        assert!(ArmIsa.literal_in_reach(0, 4095 + 8));
        assert!(!ArmIsa.literal_in_reach(0, 4096 + 8));
        assert!(ArmIsa.literal_in_reach(5000, 5000 + 8 - 4095));
    }
}
