//! Code buffer and architecture-neutral assembler.
//!
//! `CodeBuffer` is the append-only byte store shared by every backend:
//! labels, a deferred fixup list, a pending literal pool and the
//! relocation entries recorded as instructions are emitted. All patching
//! goes through byte offsets, so the underlying `Vec` may reallocate freely.
//!
//! `Assembler` pairs a buffer with a [`TargetIsa`] and adds the policy the
//! buffer cannot know about: when a literal pool must be forced out ahead
//! of the code that still needs it.
//!
//! ```text
//!   ldr r0, [pc, #..] ─┐      ldr r1, [pc, #..] ─┐
//!   ...                │      b   after          │
//!                      └────► .word 0x12345678   │
//!                             .word 0x0badf00d ◄─┘
//!                      after: ...
//! ```

use std::ops::Range;

use talon_core::{Condition, ObjectRef, Stub, StubLocation};
use tracing::trace;

use crate::backend::{AluOp, EmitResult, EncodedInst, FrameShape, Reg, TargetIsa};
use crate::error::CompileError;
use crate::reloc::{RelocEntry, RelocKind};

// =============================================================================
// Labels
// =============================================================================

/// A position in the code, possibly not yet known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(u32);

impl Label {
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// A PC-relative instruction waiting for its label to be bound.
#[derive(Debug, Clone, Copy)]
struct LabelFixup {
    at: u32,
    label: Label,
}

/// A literal word waiting for a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingLiteral {
    /// Offset of the instruction that loads the literal.
    pub load_at: u32,
    pub value: u32,
}

// =============================================================================
// Code Buffer
// =============================================================================

/// Output of a finished buffer.
#[derive(Debug, Clone)]
pub struct FinishedCode {
    pub code: Vec<u8>,
    pub relocations: Vec<RelocEntry>,
    /// Byte ranges holding literal pools rather than instructions.
    pub data_ranges: Vec<Range<u32>>,
}

#[derive(Debug)]
pub struct CodeBuffer {
    data: Vec<u8>,
    max_size: usize,
    /// Address the code is assumed to run at.
    base: usize,
    labels: Vec<Option<u32>>,
    fixups: Vec<LabelFixup>,
    literals: Vec<PendingLiteral>,
    literal_count: usize,
    max_literals: usize,
    relocations: Vec<RelocEntry>,
    data_ranges: Vec<Range<u32>>,
}

impl CodeBuffer {
    pub fn new(max_size: usize, max_literals: usize) -> Self {
        Self {
            data: Vec::with_capacity(max_size.min(1024)),
            max_size,
            base: 0,
            labels: Vec::new(),
            fixups: Vec::new(),
            literals: Vec::new(),
            literal_count: 0,
            max_literals,
            relocations: Vec::new(),
            data_ranges: Vec::new(),
        }
    }

    /// Assume the finished code will be placed at `base`.
    pub fn with_base(mut self, base: usize) -> Self {
        self.base = base;
        self
    }

    #[inline]
    pub fn base(&self) -> usize {
        self.base
    }

    /// Current emission offset.
    #[inline]
    pub fn offset(&self) -> u32 {
        self.data.len() as u32
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    // =========================================================================
    // Emission
    // =========================================================================

    pub fn put_bytes(&mut self, bytes: &[u8]) -> EmitResult {
        if self.data.len() + bytes.len() > self.max_size {
            return Err(CompileError::BufferOverflow {
                limit: self.max_size,
            });
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    #[inline]
    pub fn put_u16(&mut self, value: u16) -> EmitResult {
        self.put_bytes(&value.to_le_bytes())
    }

    #[inline]
    pub fn put_u32(&mut self, value: u32) -> EmitResult {
        self.put_bytes(&value.to_le_bytes())
    }

    #[inline]
    pub fn put_inst(&mut self, inst: &EncodedInst) -> EmitResult {
        self.put_bytes(inst.as_slice())
    }

    // =========================================================================
    // Labels
    // =========================================================================

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() as u32 - 1)
    }

    /// Bind `label` to the current offset.
    pub fn bind_label(&mut self, label: Label) {
        let slot = &mut self.labels[label.index()];
        assert!(slot.is_none(), "label {label:?} bound twice");
        *slot = Some(self.data.len() as u32);
    }

    #[inline]
    pub fn label_offset(&self, label: Label) -> Option<u32> {
        self.labels[label.index()]
    }

    /// Record that the instruction at `at` must be re-pointed at `label`.
    pub fn use_label(&mut self, at: u32, label: Label) {
        self.fixups.push(LabelFixup { at, label });
    }

    // =========================================================================
    // Literals and relocations
    // =========================================================================

    /// Queue a literal for the instruction about to be emitted at `load_at`.
    pub fn add_literal(&mut self, load_at: u32, value: u32) -> EmitResult {
        if self.literal_count >= self.max_literals {
            return Err(CompileError::LiteralPoolExhausted {
                limit: self.max_literals,
            });
        }
        self.literal_count += 1;
        self.literals.push(PendingLiteral { load_at, value });
        Ok(())
    }

    #[inline]
    pub fn pending_literals(&self) -> &[PendingLiteral] {
        &self.literals
    }

    pub(crate) fn take_literals(&mut self) -> Vec<PendingLiteral> {
        std::mem::take(&mut self.literals)
    }

    /// Record a relocation for the instruction at `offset`.
    ///
    /// Instructions are emitted in order, so entries arrive sorted.
    pub fn add_relocation(&mut self, offset: u32, kind: RelocKind) {
        if let Some(last) = self.relocations.last() {
            assert!(
                offset > last.offset,
                "relocation at {offset:#x} recorded after {:#x}",
                last.offset
            );
        }
        self.relocations.push(RelocEntry { offset, kind });
    }

    #[inline]
    pub fn relocations(&self) -> &[RelocEntry] {
        &self.relocations
    }

    pub(crate) fn mark_data(&mut self, range: Range<u32>) {
        if !range.is_empty() {
            self.data_ranges.push(range);
        }
    }

    /// Resolve label fixups and hand over the finished code.
    ///
    /// Every literal must already have been placed.
    pub fn finish(mut self, isa: &dyn TargetIsa) -> FinishedCode {
        assert!(
            self.literals.is_empty(),
            "{} literals never placed",
            self.literals.len()
        );
        for fixup in &self.fixups {
            let Some(target) = self.labels[fixup.label.index()] else {
                panic!("branch at {:#x} targets unbound {:?}", fixup.at, fixup.label);
            };
            let disp = target as i64 - fixup.at as i64;
            isa.set_pc_relative(&mut self.data, fixup.at as usize, disp);
        }
        FinishedCode {
            code: self.data,
            relocations: self.relocations,
            data_ranges: self.data_ranges,
        }
    }
}

// =============================================================================
// Assembler
// =============================================================================

/// Architecture-neutral emission front end.
pub struct Assembler<'a> {
    isa: &'a dyn TargetIsa,
    buf: CodeBuffer,
    pool_margin: u32,
    pools_emitted: usize,
}

impl<'a> Assembler<'a> {
    pub fn new(isa: &'a dyn TargetIsa, buf: CodeBuffer, pool_margin: u32) -> Self {
        Self {
            isa,
            buf,
            pool_margin,
            pools_emitted: 0,
        }
    }

    #[inline]
    pub fn isa(&self) -> &'a dyn TargetIsa {
        self.isa
    }

    #[inline]
    pub fn buffer(&self) -> &CodeBuffer {
        &self.buf
    }

    #[inline]
    pub fn offset(&self) -> u32 {
        self.buf.offset()
    }

    #[inline]
    pub fn pools_emitted(&self) -> usize {
        self.pools_emitted
    }

    pub fn new_label(&mut self) -> Label {
        self.buf.new_label()
    }

    pub fn bind(&mut self, label: Label) {
        self.buf.bind_label(label);
    }

    // =========================================================================
    // Literal pool
    // =========================================================================

    /// Whether the oldest pending literal is about to fall out of reach.
    fn pool_is_desperate(&self) -> bool {
        let Some(oldest) = self.buf.pending_literals().first() else {
            return false;
        };
        let pending = self.buf.pending_literals().len() as u32;
        let worst = self.buf.offset() + self.pool_margin + 4 * pending;
        !self.isa.literal_in_reach(oldest.load_at, worst)
    }

    /// Place every pending literal at the current position.
    ///
    /// With `jump_over`, execution branches around the pool.
    fn flush_pool(&mut self, jump_over: bool) -> EmitResult {
        if self.buf.pending_literals().is_empty() {
            return Ok(());
        }
        let after = self.buf.new_label();
        if jump_over {
            self.isa.emit_branch(&mut self.buf, None, after)?;
        }
        let start = self.buf.offset();
        while self.buf.offset() % 4 != 0 {
            self.buf.put_bytes(self.isa.pool_padding())?;
        }
        let literals = self.buf.take_literals();
        for literal in &literals {
            let at = self.buf.offset();
            self.buf.put_u32(literal.value)?;
            assert!(
                self.isa.literal_in_reach(literal.load_at, at),
                "literal for load at {:#x} placed out of reach at {at:#x}",
                literal.load_at
            );
            let disp = at as i64 - literal.load_at as i64;
            self.isa
                .set_pc_relative(self.buf.bytes_mut(), literal.load_at as usize, disp);
        }
        let end = self.buf.offset();
        self.buf.mark_data(start..end);
        self.buf.bind_label(after);
        self.pools_emitted += 1;
        trace!(
            start,
            end,
            count = literals.len(),
            jump_over,
            "placed literal pool"
        );
        Ok(())
    }

    /// Force the pool out early if the next instruction could strand it.
    #[inline]
    fn prepare(&mut self) -> EmitResult {
        if self.pool_is_desperate() {
            self.flush_pool(true)?;
        }
        Ok(())
    }

    /// Place any remaining literals and resolve all labels.
    pub fn finish(mut self) -> Result<FinishedCode, CompileError> {
        self.flush_pool(false)?;
        Ok(self.buf.finish(self.isa))
    }

    // =========================================================================
    // Emission
    // =========================================================================

    pub fn move_reg(&mut self, dst: Reg, src: Reg) -> EmitResult {
        if dst == src {
            return Ok(());
        }
        self.prepare()?;
        self.isa.emit_move(&mut self.buf, dst, src)
    }

    /// Move two values at once, even when the sources overlap the destinations.
    pub fn move_pair(&mut self, (dst0, src0): (Reg, Reg), (dst1, src1): (Reg, Reg)) -> EmitResult {
        assert_ne!(dst0, dst1, "parallel move into one register");
        if dst0 == src1 && dst1 == src0 {
            let scratch = self.isa.scratch();
            self.move_reg(scratch, src0)?;
            self.move_reg(dst1, src1)?;
            self.move_reg(dst0, scratch)
        } else if dst0 == src1 {
            self.move_reg(dst1, src1)?;
            self.move_reg(dst0, src0)
        } else {
            self.move_reg(dst0, src0)?;
            self.move_reg(dst1, src1)
        }
    }

    pub fn move_imm(&mut self, dst: Reg, imm: i32) -> EmitResult {
        self.prepare()?;
        self.isa.emit_move_imm(&mut self.buf, dst, imm)
    }

    pub fn alu(&mut self, op: AluOp, dst: Reg, lhs: Reg, rhs: Reg) -> EmitResult {
        self.prepare()?;
        self.isa.emit_alu(&mut self.buf, op, dst, lhs, rhs)
    }

    pub fn add_imm(&mut self, dst: Reg, src: Reg, imm: i32) -> EmitResult {
        self.prepare()?;
        self.isa.emit_add_imm(&mut self.buf, dst, src, imm)
    }

    pub fn compare(&mut self, lhs: Reg, rhs: Reg) -> EmitResult {
        self.prepare()?;
        self.isa.emit_compare(&mut self.buf, lhs, rhs)
    }

    pub fn compare_imm(&mut self, lhs: Reg, imm: i32) -> EmitResult {
        self.prepare()?;
        self.isa.emit_compare_imm(&mut self.buf, lhs, imm)
    }

    pub fn branch(&mut self, cond: Condition, target: Label) -> EmitResult {
        self.prepare()?;
        self.isa.emit_branch(&mut self.buf, Some(cond), target)
    }

    pub fn jump(&mut self, target: Label) -> EmitResult {
        self.prepare()?;
        self.isa.emit_branch(&mut self.buf, None, target)
    }

    pub fn call(&mut self, stub: Stub, location: StubLocation) -> EmitResult {
        self.prepare()?;
        self.isa.emit_call(&mut self.buf, stub, location)
    }

    pub fn load(&mut self, dst: Reg, base: Reg, offset: i32) -> EmitResult {
        self.prepare()?;
        self.isa.emit_load(&mut self.buf, dst, base, offset)
    }

    pub fn store(&mut self, src: Reg, base: Reg, offset: i32) -> EmitResult {
        self.prepare()?;
        self.isa.emit_store(&mut self.buf, src, base, offset)
    }

    pub fn store_multiple(&mut self, base: Reg, regs: &[Reg]) -> EmitResult {
        self.prepare()?;
        self.isa.emit_store_multiple(&mut self.buf, base, regs)
    }

    pub fn load_object(&mut self, dst: Reg, obj: ObjectRef) -> EmitResult {
        self.prepare()?;
        self.isa.emit_load_object(&mut self.buf, dst, obj)
    }

    pub fn load_literal(&mut self, dst: Reg, value: u32) -> EmitResult {
        self.prepare()?;
        self.isa.emit_load_literal(&mut self.buf, dst, value)
    }

    pub fn prologue(&mut self, shape: &FrameShape) -> EmitResult {
        self.prepare()?;
        self.isa.emit_prologue(&mut self.buf, shape)
    }

    pub fn ret(&mut self, shape: Option<&FrameShape>) -> EmitResult {
        self.prepare()?;
        self.isa.emit_return(&mut self.buf, shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Arch, isa_for};

    fn arm_asm(max_size: usize) -> Assembler<'static> {
        Assembler::new(isa_for(Arch::Arm), CodeBuffer::new(max_size, 64), 16)
    }

    #[test]
    fn test_buffer_overflow_is_reported() {
        let mut buf = CodeBuffer::new(6, 4);
        buf.put_u32(0).unwrap();
        let err = buf.put_u32(0).unwrap_err();
        assert_eq!(err, CompileError::BufferOverflow { limit: 6 });
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn test_literal_limit() {
        let mut buf = CodeBuffer::new(64, 1);
        buf.add_literal(0, 1).unwrap();
        assert_eq!(
            buf.add_literal(4, 2),
            Err(CompileError::LiteralPoolExhausted { limit: 1 })
        );
    }

    #[test]
    #[should_panic(expected = "bound twice")]
    fn test_label_bound_twice() {
        let mut buf = CodeBuffer::new(64, 1);
        let label = buf.new_label();
        buf.bind_label(label);
        buf.bind_label(label);
    }

    #[test]
    #[should_panic(expected = "recorded after")]
    fn test_relocations_must_be_sorted() {
        let mut buf = CodeBuffer::new(64, 1);
        buf.add_relocation(8, RelocKind::HeapObject);
        buf.add_relocation(4, RelocKind::HeapObject);
    }

    #[test]
    fn test_forward_label_resolved_on_finish() {
        let mut asm = arm_asm(256);
        let target = asm.new_label();
        asm.jump(target).unwrap();
        asm.move_imm(Reg(0), 1).unwrap();
        asm.bind(target);
        asm.ret(None).unwrap();
        let code = asm.finish().unwrap();
        let isa = isa_for(Arch::Arm);
        assert_eq!(isa.pc_relative(&code.code, 0), Some(8));
    }

    #[test]
    fn test_pool_placed_at_end() {
        let mut asm = arm_asm(256);
        asm.move_imm(Reg(0), 0x1234_5678).unwrap();
        asm.ret(None).unwrap();
        let code = asm.finish().unwrap();
        assert_eq!(code.code.len(), 12);
        assert_eq!(code.data_ranges, vec![8..12]);
        assert_eq!(&code.code[8..12], &0x1234_5678u32.to_le_bytes());
        let isa = isa_for(Arch::Arm);
        assert_eq!(isa.embedded_word_at(&code.code, 0), Some(8));
    }

    #[test]
    fn test_desperate_pool_jumps_over() {
        let mut asm = arm_asm(16 * 1024);
        asm.move_imm(Reg(0), 0x1234_5678).unwrap();
        for _ in 0..1100 {
            asm.move_reg(Reg(1), Reg(2)).unwrap();
        }
        asm.ret(None).unwrap();
        assert_eq!(asm.pools_emitted(), 1);
        let code = asm.finish().unwrap();
        assert_eq!(code.data_ranges.len(), 1);
        let isa = isa_for(Arch::Arm);
        let pool = code.data_ranges[0].start as usize;
        assert_eq!(isa.embedded_word_at(&code.code, 0), Some(pool));
        // The instruction right before the pool branches past it.
        let jump_at = pool - 4;
        assert_eq!(isa.pc_relative(&code.code, jump_at), Some(8));
    }
}
