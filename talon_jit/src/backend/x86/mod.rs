//! x86 (IA-32) backend.
//!
//! There is no literal pool: every constant, heap reference and native stub
//! address is an `imm32` inside a `mov`. Relocations point at the `mov`;
//! the patched word starts one byte in.
//!
//! Compiled code never pushes inside a body, so `esp` doubles as the frame
//! base and `ebp` joins the allocatable set.

pub mod encoder;
pub mod registers;

use talon_core::{Condition, ObjectRef, Stub, StubLocation};

use self::encoder::{AluKind, CondCode, Inst, Mem, decode, encode};
use self::registers::{EBP, EBX, EDX, ESI, ESP, REGISTERS};
use super::{
    AluOp, Arch, DecodedInst, EmitResult, FrameShape, Reg, RegisterInfo, TargetIsa, overwrite,
};
use crate::assembler::{CodeBuffer, Label};
use crate::reloc::RelocKind;

/// Registers the framed prologue pushes, in push order.
const SAVED: [Reg; 3] = [EBX, ESI, EBP];

/// Stateless IA-32 backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct X86Isa;

#[inline]
fn put(buf: &mut CodeBuffer, inst: Inst) -> EmitResult {
    buf.put_inst(&encode(&inst))
}

/// `mov dst, imm32` with a relocation on the instruction.
fn mov_relocated(buf: &mut CodeBuffer, dst: Reg, imm: u32, kind: RelocKind) -> EmitResult {
    let at = buf.offset();
    buf.add_relocation(at, kind);
    put(buf, Inst::MovImm { dst, imm })
}

fn relative(disp: i64) -> i32 {
    i32::try_from(disp).unwrap_or_else(|_| panic!("branch displacement {disp} out of range"))
}

impl TargetIsa for X86Isa {
    fn arch(&self) -> Arch {
        Arch::X86
    }

    fn registers(&self) -> &'static [RegisterInfo] {
        &REGISTERS
    }

    fn max_code_size(&self) -> usize {
        1 << 24
    }

    fn max_frame_slots(&self) -> u16 {
        4096
    }

    fn uses_literal_pool(&self) -> bool {
        false
    }

    fn literal_in_reach(&self, _load_at: u32, _literal_at: u32) -> bool {
        true
    }

    fn pool_padding(&self) -> &'static [u8] {
        &[0x90]
    }

    fn supports_store_multiple(&self) -> bool {
        false
    }

    fn emit_move(&self, buf: &mut CodeBuffer, dst: Reg, src: Reg) -> EmitResult {
        put(buf, Inst::Mov { dst, src })
    }

    fn emit_move_imm(&self, buf: &mut CodeBuffer, dst: Reg, imm: i32) -> EmitResult {
        // Always the flag-neutral `mov`, never `xor r, r`.
        put(
            buf,
            Inst::MovImm {
                dst,
                imm: imm as u32,
            },
        )
    }

    fn emit_alu(
        &self,
        buf: &mut CodeBuffer,
        op: AluOp,
        dst: Reg,
        lhs: Reg,
        rhs: Reg,
    ) -> EmitResult {
        let kind = match op {
            AluOp::Add | AluOp::Adds => Some(AluKind::Add),
            AluOp::Sub | AluOp::Subs => Some(AluKind::Sub),
            AluOp::And => Some(AluKind::And),
            AluOp::Or => Some(AluKind::Or),
            AluOp::Xor => Some(AluKind::Xor),
            AluOp::Adc => Some(AluKind::Adc),
            AluOp::Sbc => Some(AluKind::Sbb),
            AluOp::Mul => None,
        };
        let src = if dst == lhs {
            rhs
        } else if dst != rhs {
            self.emit_move(buf, dst, lhs)?;
            rhs
        } else if op.is_commutative() {
            lhs
        } else {
            self.emit_move(buf, EDX, rhs)?;
            self.emit_move(buf, dst, lhs)?;
            EDX
        };
        match kind {
            Some(kind) => put(buf, Inst::Alu { kind, dst, src }),
            None => put(buf, Inst::Imul { dst, src }),
        }
    }

    fn emit_add_imm(&self, buf: &mut CodeBuffer, dst: Reg, src: Reg, imm: i32) -> EmitResult {
        if dst != src {
            return put(
                buf,
                Inst::Lea {
                    dst,
                    mem: Mem::new(src, imm),
                },
            );
        }
        if imm == 0 {
            return Ok(());
        }
        let (kind, imm) = if imm < 0 && imm != i32::MIN {
            (AluKind::Sub, -imm)
        } else {
            (AluKind::Add, imm)
        };
        put(buf, Inst::AluImm { kind, dst, imm })
    }

    fn emit_compare(&self, buf: &mut CodeBuffer, lhs: Reg, rhs: Reg) -> EmitResult {
        put(
            buf,
            Inst::Alu {
                kind: AluKind::Cmp,
                dst: lhs,
                src: rhs,
            },
        )
    }

    fn emit_compare_imm(&self, buf: &mut CodeBuffer, lhs: Reg, imm: i32) -> EmitResult {
        put(
            buf,
            Inst::AluImm {
                kind: AluKind::Cmp,
                dst: lhs,
                imm,
            },
        )
    }

    fn emit_branch(
        &self,
        buf: &mut CodeBuffer,
        cond: Option<Condition>,
        target: Label,
    ) -> EmitResult {
        let at = buf.offset();
        let (disp, short) = match buf.label_offset(target) {
            Some(bound) => {
                let disp = relative(bound as i64 - at as i64);
                (disp, i8::try_from(disp - 2).is_ok())
            }
            None => {
                buf.use_label(at, target);
                // rel32 = 0 until the fixup runs
                (if cond.is_some() { 6 } else { 5 }, false)
            }
        };
        let inst = match cond {
            None => Inst::Jmp { disp, short },
            Some(cond) => Inst::Jcc {
                cc: CondCode::from(cond),
                disp,
                short,
            },
        };
        put(buf, inst)
    }

    fn emit_call(&self, buf: &mut CodeBuffer, stub: Stub, location: StubLocation) -> EmitResult {
        match location {
            StubLocation::CodeHeap(target) => {
                let at = buf.offset();
                let disp = target as i64 - (buf.base() + at as usize) as i64;
                buf.add_relocation(at, RelocKind::IntraCodeBranch { target });
                put(
                    buf,
                    Inst::Call {
                        disp: relative(disp),
                    },
                )
            }
            StubLocation::Native(addr) => {
                mov_relocated(buf, EDX, addr, RelocKind::ExternalStub { stub })?;
                put(buf, Inst::CallReg(EDX))
            }
        }
    }

    fn emit_load(&self, buf: &mut CodeBuffer, dst: Reg, base: Reg, offset: i32) -> EmitResult {
        put(
            buf,
            Inst::Load {
                dst,
                mem: Mem::new(base, offset),
            },
        )
    }

    fn emit_store(&self, buf: &mut CodeBuffer, src: Reg, base: Reg, offset: i32) -> EmitResult {
        put(
            buf,
            Inst::Store {
                mem: Mem::new(base, offset),
                src,
            },
        )
    }

    fn emit_store_multiple(&self, _buf: &mut CodeBuffer, _base: Reg, _regs: &[Reg]) -> EmitResult {
        panic!("x86 has no store-multiple")
    }

    fn emit_load_object(&self, buf: &mut CodeBuffer, dst: Reg, obj: ObjectRef) -> EmitResult {
        mov_relocated(buf, dst, obj.address(), RelocKind::HeapObject)
    }

    fn emit_load_literal(&self, buf: &mut CodeBuffer, dst: Reg, value: u32) -> EmitResult {
        mov_relocated(buf, dst, value, RelocKind::Literal)
    }

    fn emit_prologue(&self, buf: &mut CodeBuffer, shape: &FrameShape) -> EmitResult {
        for reg in SAVED {
            put(buf, Inst::Push(reg))?;
        }
        self.emit_add_imm(buf, ESP, ESP, -(shape.slots as i32 * 4))?;
        self.emit_add_imm(buf, ESI, ESP, shape.jsp_offset(0))
    }

    fn emit_return(&self, buf: &mut CodeBuffer, shape: Option<&FrameShape>) -> EmitResult {
        if let Some(shape) = shape {
            self.emit_add_imm(buf, ESP, ESP, shape.slots as i32 * 4)?;
            for reg in SAVED.into_iter().rev() {
                put(buf, Inst::Pop(reg))?;
            }
        }
        put(buf, Inst::Ret)
    }

    fn pc_relative(&self, code: &[u8], at: usize) -> Option<i64> {
        decode(code, at)?.0.pc_relative()
    }

    fn set_pc_relative(&self, code: &mut [u8], at: usize, disp: i64) {
        let Some((inst, len)) = decode(code, at) else {
            panic!("no PC-relative instruction at {at:#x}");
        };
        let disp = relative(disp);
        let patched = match inst {
            Inst::Jmp { short, .. } => Inst::Jmp { disp, short },
            Inst::Jcc { cc, short, .. } => Inst::Jcc { cc, disp, short },
            Inst::Call { .. } => Inst::Call { disp },
            _ => panic!("no PC-relative instruction at {at:#x}"),
        };
        overwrite(code, at, len, &encode(&patched));
    }

    fn pc_relative_fits(&self, code: &[u8], at: usize, disp: i64) -> bool {
        let Some((inst, len)) = decode(code, at) else {
            return false;
        };
        // Encoded relative to the end of the instruction.
        let rel = disp - len as i64;
        match inst {
            Inst::Jmp { short: true, .. } | Inst::Jcc { short: true, .. } => {
                i8::try_from(rel).is_ok()
            }
            Inst::Jmp { .. } | Inst::Jcc { .. } | Inst::Call { .. } => {
                i32::try_from(disp).is_ok() && i32::try_from(rel).is_ok()
            }
            _ => false,
        }
    }

    fn embedded_word_at(&self, code: &[u8], at: usize) -> Option<usize> {
        match decode(code, at)?.0 {
            Inst::MovImm { .. } => Some(at + 1),
            _ => None,
        }
    }

    fn decode_at(&self, code: &[u8], at: usize) -> Option<DecodedInst> {
        let (inst, len) = decode(code, at)?;
        Some(DecodedInst {
            len,
            mnemonic: inst.mnemonic(),
            operands: inst.operands(at),
            pc_target: inst.pc_relative(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::x86::registers::{EAX, ECX};

    #[test]
    fn test_prologue_epilogue_bytes() {
        let shape = FrameShape {
            slots: 3,
            max_locals: 2,
        };
        let mut buf = CodeBuffer::new(64, 0);
        X86Isa.emit_prologue(&mut buf, &shape).unwrap();
        X86Isa.emit_return(&mut buf, Some(&shape)).unwrap();
        assert_eq!(
            buf.bytes(),
            &[
                0x53, 0x56, 0x55, // push ebx; push esi; push ebp
                0x83, 0xEC, 0x0C, // sub esp, 12
                0x8D, 0x74, 0x24, 0x04, // lea esi, [esp+4]
                0x83, 0xC4, 0x0C, // add esp, 12
                0x5D, 0x5E, 0x5B, // pop ebp; pop esi; pop ebx
                0xC3,
            ]
        );
    }

    #[test]
    fn test_backward_branch_uses_short_form() {
        let mut buf = CodeBuffer::new(64, 0);
        let top = buf.new_label();
        buf.bind_label(top);
        X86Isa.emit_move(&mut buf, EAX, ECX).unwrap();
        X86Isa
            .emit_branch(&mut buf, Some(Condition::Ne), top)
            .unwrap();
        assert_eq!(&buf.bytes()[2..], &[0x75, 0xFC]);
    }

    #[test]
    fn test_forward_branch_resolves_near() {
        let mut buf = CodeBuffer::new(64, 0);
        let target = buf.new_label();
        X86Isa.emit_branch(&mut buf, None, target).unwrap();
        X86Isa.emit_return(&mut buf, None).unwrap();
        buf.bind_label(target);
        let code = buf.finish(&X86Isa).code;
        assert_eq!(&code[..5], &[0xE9, 0x01, 0x00, 0x00, 0x00]);
        assert_eq!(X86Isa.pc_relative(&code, 0), Some(6));
    }

    #[test]
    fn test_two_operand_sub_into_rhs() {
        let mut buf = CodeBuffer::new(64, 0);
        X86Isa
            .emit_alu(&mut buf, AluOp::Sub, ECX, EAX, ECX)
            .unwrap();
        // mov edx, ecx; mov ecx, eax; sub ecx, edx
        assert_eq!(buf.bytes(), &[0x89, 0xCA, 0x89, 0xC1, 0x29, 0xD1]);
    }

    #[test]
    fn test_object_load_relocation() {
        let mut buf = CodeBuffer::new(64, 0);
        X86Isa
            .emit_load_object(&mut buf, EBX, ObjectRef::from_address(0x1000))
            .unwrap();
        assert_eq!(buf.relocations()[0].kind, RelocKind::HeapObject);
        assert_eq!(X86Isa.embedded_word_at(buf.bytes(), 0), Some(1));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_short_branch_patch_out_of_range() {
        let mut code = encode(&Inst::Jmp {
            disp: 2,
            short: true,
        })
        .as_slice()
        .to_vec();
        X86Isa.set_pc_relative(&mut code, 0, 200);
    }

    #[test]
    fn test_branch_reach() {
        let short = encode(&Inst::Jmp {
            disp: 2,
            short: true,
        })
        .as_slice()
        .to_vec();
        assert!(X86Isa.pc_relative_fits(&short, 0, 129));
        assert!(X86Isa.pc_relative_fits(&short, 0, -126));
        assert!(!X86Isa.pc_relative_fits(&short, 0, 130));

        let call = encode(&Inst::Call { disp: 5 }).as_slice().to_vec();
        assert!(X86Isa.pc_relative_fits(&call, 0, i32::MAX as i64));
        assert!(X86Isa.pc_relative_fits(&call, 0, i32::MIN as i64 + 5));
        assert!(!X86Isa.pc_relative_fits(&call, 0, i32::MIN as i64));
        assert!(!X86Isa.pc_relative_fits(&call, 0, -140_117_074_829_327));

        let ret = encode(&Inst::Ret).as_slice().to_vec();
        assert!(!X86Isa.pc_relative_fits(&ret, 0, 0));
    }
}
