//! Virtual stack frame.
//!
//! Tracks where every local variable and operand-stack slot of the method
//! being compiled currently lives, hands out registers, and emits the
//! stores that make the tracked state real when it has to be.
//!
//! # Frame Layout (one word per slot, ascending)
//! ```text
//! ┌───────────────────────────────┐ ← fp + 0
//! │     Locals [0..max_locals]    │
//! ├───────────────────────────────┤ ← fp + max_locals*4
//! │     Operand stack [0..real)   │   committed
//! │                               │ ← jsp (top committed slot)
//! ├───────────────────────────────┤
//! │     Operand stack [real..)    │   virtual only: registers/constants
//! └───────────────────────────────┘
//! ```
//!
//! The real stack pointer never overtakes the virtual one. Values are
//! committed lazily by [`VirtualFrame::flush`] and [`VirtualFrame::flush_all`].
//!
//! # Register sharing
//! A register may back several slots at once (a local and the copies of
//! it pushed by loads). Each register carries a reference count; it is
//! only ever written while the count is zero, so sharing never changes a
//! value behind a slot's back.

use smallvec::SmallVec;
use talon_core::{Bci, ValueType};
use tracing::trace;

use crate::assembler::Assembler;
use crate::backend::{Reg, RegSet, TargetIsa};
use crate::config::JitConfig;
use crate::error::CompileError;

// =============================================================================
// Slot state
// =============================================================================

/// Where the authoritative copy of one slot lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// In its home word in the frame.
    Flushed,
    /// In its home word, with a clean copy cached in a register.
    InRegister(Reg),
    /// Only in a register; the home word is stale.
    UnflushedChanged(Reg),
    /// A known constant not yet materialized anywhere.
    Constant(i32),
}

impl SlotState {
    #[inline]
    pub const fn register(self) -> Option<Reg> {
        match self {
            SlotState::InRegister(reg) | SlotState::UnflushedChanged(reg) => Some(reg),
            SlotState::Flushed | SlotState::Constant(_) => None,
        }
    }

    /// Whether committing the slot needs a store.
    #[inline]
    pub const fn is_dirty(self) -> bool {
        matches!(self, SlotState::UnflushedChanged(_) | SlotState::Constant(_))
    }
}

/// Value category of an operand-stack slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Int,
    Float,
    Reference,
    /// Low word of a long.
    WideLow,
    /// High word of a long.
    WideHigh,
}

impl ValueKind {
    #[inline]
    pub const fn is_wide(self) -> bool {
        matches!(self, ValueKind::WideLow | ValueKind::WideHigh)
    }

    /// Slot kinds of a value of type `ty`, low word first.
    pub fn of(ty: ValueType) -> &'static [ValueKind] {
        match ty {
            ValueType::Int => &[ValueKind::Int],
            ValueType::Float => &[ValueKind::Float],
            ValueType::Reference => &[ValueKind::Reference],
            ValueType::Long => &[ValueKind::WideLow, ValueKind::WideHigh],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackSlot {
    pub state: SlotState,
    pub kind: ValueKind,
}

/// A popped value: a register pinned until the end of the bytecode, or a
/// constant that has not been materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Reg(Reg),
    Imm(i32),
}

/// Which path a flush took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushKind {
    /// Already committed.
    Nothing,
    /// Only the Java stack pointer register needed updating.
    PointerOnly,
    /// One pre-indexed store-multiple with writeback.
    Bulk,
    /// Individual stores plus an explicit stack pointer update.
    SlotBySlot,
}

/// Whether the method owns a machine frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameMode {
    Framed,
    /// Leaf without a frame: caller-saved registers only, nothing in memory.
    Frameless,
}

#[derive(Debug, Clone, Copy, Default)]
struct RegUse {
    refs: u16,
    last_use: u32,
}

// =============================================================================
// Virtual frame
// =============================================================================

#[derive(Debug, Clone)]
pub struct VirtualFrame {
    locals: SmallVec<[SlotState; 8]>,
    stack: SmallVec<[StackSlot; 8]>,
    /// Slots below this index are committed to memory.
    real_sp: u16,
    /// Whether `jsp` addresses slot `real_sp - 1`.
    jsp_synced: bool,
    max_locals: u16,
    mode: FrameMode,
    pool: RegSet,
    pinned: RegSet,
    usage: [RegUse; 16],
    tick: u32,
    bulk_flush: bool,
    float_bulk_flush: bool,
    fp: Reg,
    jsp: Reg,
    scratch: Reg,
}

impl VirtualFrame {
    /// Create a frame in canonical state with every local in memory.
    pub fn new(isa: &dyn TargetIsa, max_locals: u16, mode: FrameMode, config: &JitConfig) -> Self {
        let pool = match mode {
            FrameMode::Framed => isa.allocatable(),
            FrameMode::Frameless => isa.caller_saved_allocatable(),
        };
        Self {
            locals: SmallVec::from_elem(SlotState::Flushed, max_locals as usize),
            stack: SmallVec::new(),
            real_sp: 0,
            jsp_synced: true,
            max_locals,
            mode,
            pool,
            pinned: RegSet::EMPTY,
            usage: [RegUse::default(); 16],
            tick: 0,
            bulk_flush: config.bulk_flush && isa.supports_store_multiple(),
            float_bulk_flush: config.float_bulk_flush,
            fp: isa.frame_pointer(),
            jsp: isa.java_stack_pointer(),
            scratch: isa.scratch(),
        }
    }

    /// Mark the leading locals as arriving in `regs`, one slot per register.
    pub fn bind_arguments(&mut self, regs: &[Reg]) {
        for (index, &reg) in regs.iter().enumerate() {
            self.locals[index] = SlotState::UnflushedChanged(reg);
            self.acquire(reg);
            self.touch(reg);
        }
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    #[inline]
    pub fn mode(&self) -> FrameMode {
        self.mode
    }

    #[inline]
    pub fn virtual_sp(&self) -> u16 {
        self.stack.len() as u16
    }

    #[inline]
    pub fn real_sp(&self) -> u16 {
        self.real_sp
    }

    #[inline]
    pub fn jsp_synced(&self) -> bool {
        self.jsp_synced
    }

    /// Slot `index` counted from the bottom of the operand stack.
    #[inline]
    pub fn stack_slot(&self, index: usize) -> StackSlot {
        self.stack[index]
    }

    #[inline]
    pub fn local(&self, index: usize) -> SlotState {
        self.locals[index]
    }

    /// Kind of the slot `depth` below the top (0 = top).
    pub fn kind_at(&self, depth: usize) -> ValueKind {
        self.stack[self.stack.len() - 1 - depth].kind
    }

    #[inline]
    pub fn refs(&self, reg: Reg) -> u16 {
        self.usage[reg.0 as usize].refs
    }

    /// Nothing cached, nothing pending, `jsp` at the top of stack.
    pub fn is_canonical(&self) -> bool {
        self.real_sp as usize == self.stack.len()
            && self.jsp_synced
            && self.locals.iter().all(|s| *s == SlotState::Flushed)
            && self.stack.iter().all(|s| s.state == SlotState::Flushed)
    }

    // =========================================================================
    // Register bookkeeping
    // =========================================================================

    #[inline]
    fn acquire(&mut self, reg: Reg) {
        self.usage[reg.0 as usize].refs += 1;
    }

    #[inline]
    fn release(&mut self, reg: Reg) {
        let usage = &mut self.usage[reg.0 as usize];
        assert!(usage.refs > 0, "register {reg:?} released more often than acquired");
        usage.refs -= 1;
    }

    #[inline]
    fn touch(&mut self, reg: Reg) {
        self.tick += 1;
        self.usage[reg.0 as usize].last_use = self.tick;
    }

    #[inline]
    fn pin(&mut self, reg: Reg) {
        self.pinned = self.pinned.insert(reg);
    }

    /// Release every pin taken while lowering the current bytecode.
    pub fn unpin_all(&mut self) {
        self.pinned = RegSet::EMPTY;
    }

    /// Whether every slot backed by `reg` also has a valid home word.
    fn is_clean(&self, reg: Reg) -> bool {
        let dirty = SlotState::UnflushedChanged(reg);
        !self.locals.contains(&dirty) && !self.stack.iter().any(|s| s.state == dirty)
    }

    fn spill_candidate(&self) -> Option<Reg> {
        if self.mode == FrameMode::Frameless {
            return None;
        }
        self.pool
            .difference(self.pinned)
            .iter()
            .filter(|&reg| self.refs(reg) > 0)
            .min_by_key(|&reg| (!self.is_clean(reg), self.usage[reg.0 as usize].last_use))
    }

    /// Evict `reg`, storing every dirty slot it backs.
    fn spill(&mut self, asm: &mut Assembler<'_>, reg: Reg) -> Result<(), CompileError> {
        let mut stores = 0;
        for index in 0..self.locals.len() {
            match self.locals[index] {
                SlotState::UnflushedChanged(r) if r == reg => {
                    asm.store(reg, self.fp, self.local_home(index))?;
                    stores += 1;
                }
                SlotState::InRegister(r) if r == reg => {}
                _ => continue,
            }
            self.locals[index] = SlotState::Flushed;
        }
        for index in 0..self.stack.len() {
            match self.stack[index].state {
                SlotState::UnflushedChanged(r) if r == reg => {
                    asm.store(reg, self.fp, self.stack_home(index))?;
                    stores += 1;
                }
                SlotState::InRegister(r) if r == reg => {}
                _ => continue,
            }
            self.stack[index].state = SlotState::Flushed;
        }
        self.usage[reg.0 as usize].refs = 0;
        trace!(reg = reg.0, stores, "spilled register");
        Ok(())
    }

    fn free_register(&self) -> Option<Reg> {
        self.pool
            .difference(self.pinned)
            .iter()
            .find(|&reg| self.refs(reg) == 0)
    }

    /// Hand out a register nobody references, spilling if necessary.
    ///
    /// The register stays pinned until [`unpin_all`](Self::unpin_all).
    pub fn alloc(&mut self, asm: &mut Assembler<'_>) -> Result<Reg, CompileError> {
        let reg = match self.free_register() {
            Some(reg) => reg,
            None => {
                let victim = self
                    .spill_candidate()
                    .ok_or(CompileError::RegistersExhausted)?;
                self.spill(asm, victim)?;
                victim
            }
        };
        self.pin(reg);
        self.touch(reg);
        Ok(reg)
    }

    /// Destination for an operation consuming the pinned register `src`.
    ///
    /// Reuses `src` when no slot still needs its value, takes a free
    /// register otherwise, and as a last resort evicts `src`'s owners.
    pub fn dest_for(&mut self, asm: &mut Assembler<'_>, src: Reg) -> Result<Reg, CompileError> {
        if self.refs(src) > 0 {
            if let Some(reg) = self.free_register() {
                self.pin(reg);
                self.touch(reg);
                return Ok(reg);
            }
            if self.mode == FrameMode::Frameless {
                return Err(CompileError::RegistersExhausted);
            }
            self.spill(asm, src)?;
        }
        self.pin(src);
        self.touch(src);
        Ok(src)
    }

    // =========================================================================
    // Homes
    // =========================================================================

    #[inline]
    fn local_home(&self, index: usize) -> i32 {
        assert!(
            self.mode == FrameMode::Framed,
            "frameless method touched local {index} in memory"
        );
        index as i32 * 4
    }

    #[inline]
    fn stack_home(&self, index: usize) -> i32 {
        assert!(
            self.mode == FrameMode::Framed,
            "frameless method touched stack slot {index} in memory"
        );
        (self.max_locals as i32 + index as i32) * 4
    }

    /// `jsp` value, relative to `fp`, for a committed depth.
    #[inline]
    fn jsp_offset(&self, depth: u16) -> i32 {
        (self.max_locals as i32 + depth as i32 - 1) * 4
    }

    fn store_state(
        &self,
        asm: &mut Assembler<'_>,
        state: SlotState,
        offset: i32,
    ) -> Result<(), CompileError> {
        match state {
            SlotState::UnflushedChanged(reg) => asm.store(reg, self.fp, offset),
            SlotState::Constant(value) => {
                asm.move_imm(self.scratch, value)?;
                asm.store(self.scratch, self.fp, offset)
            }
            SlotState::Flushed | SlotState::InRegister(_) => Ok(()),
        }
    }

    // =========================================================================
    // Stack operations
    // =========================================================================

    pub fn push_constant(&mut self, kind: ValueKind, value: i32) {
        self.stack.push(StackSlot {
            state: SlotState::Constant(value),
            kind,
        });
    }

    /// Push a value held in `reg`; the slot takes a reference on it.
    pub fn push_register(&mut self, reg: Reg, kind: ValueKind) {
        self.acquire(reg);
        self.touch(reg);
        self.stack.push(StackSlot {
            state: SlotState::UnflushedChanged(reg),
            kind,
        });
    }

    pub fn push(&mut self, operand: Operand, kind: ValueKind) {
        match operand {
            Operand::Reg(reg) => self.push_register(reg, kind),
            Operand::Imm(value) => self.push_constant(kind, value),
        }
    }

    fn take_top(&mut self) -> (usize, StackSlot) {
        let Some(slot) = self.stack.pop() else {
            panic!("operand stack underflow in verified bytecode");
        };
        let index = self.stack.len();
        if (index as u16) < self.real_sp {
            self.real_sp = index as u16;
            self.jsp_synced = false;
        }
        (index, slot)
    }

    /// Pop the top slot; a register result is pinned.
    pub fn pop(&mut self, asm: &mut Assembler<'_>) -> Result<Operand, CompileError> {
        let (index, slot) = self.take_top();
        match slot.state {
            SlotState::Constant(value) => Ok(Operand::Imm(value)),
            SlotState::InRegister(reg) | SlotState::UnflushedChanged(reg) => {
                self.release(reg);
                self.pin(reg);
                self.touch(reg);
                Ok(Operand::Reg(reg))
            }
            SlotState::Flushed => {
                let reg = self.alloc(asm)?;
                asm.load(reg, self.fp, self.stack_home(index))?;
                Ok(Operand::Reg(reg))
            }
        }
    }

    /// Pop the top slot into a pinned register.
    pub fn pop_register(&mut self, asm: &mut Assembler<'_>) -> Result<Reg, CompileError> {
        let operand = self.pop(asm)?;
        self.materialize(asm, operand)
    }

    /// Make `operand` available in a pinned register.
    pub fn materialize(
        &mut self,
        asm: &mut Assembler<'_>,
        operand: Operand,
    ) -> Result<Reg, CompileError> {
        match operand {
            Operand::Reg(reg) => Ok(reg),
            Operand::Imm(value) => {
                let reg = self.alloc(asm)?;
                asm.move_imm(reg, value)?;
                Ok(reg)
            }
        }
    }

    /// Drop the top slot without reading it.
    pub fn discard(&mut self) {
        let (_, slot) = self.take_top();
        if let Some(reg) = slot.state.register() {
            self.release(reg);
        }
    }

    /// Duplicate the top slot.
    pub fn dup(&mut self, asm: &mut Assembler<'_>) -> Result<(), CompileError> {
        let Some(&top) = self.stack.last() else {
            panic!("dup on an empty operand stack");
        };
        match top.state {
            SlotState::Constant(value) => self.push_constant(top.kind, value),
            SlotState::InRegister(reg) | SlotState::UnflushedChanged(reg) => {
                self.push_register(reg, top.kind)
            }
            SlotState::Flushed => {
                let index = self.stack.len() - 1;
                let reg = self.alloc(asm)?;
                asm.load(reg, self.fp, self.stack_home(index))?;
                self.stack[index].state = SlotState::InRegister(reg);
                self.acquire(reg);
                self.push_register(reg, top.kind);
            }
        }
        Ok(())
    }

    /// Account for a call that consumed `arg_slots` committed slots.
    ///
    /// `jsp` is callee-saved, so it still addresses the last argument.
    pub fn after_call(&mut self, arg_slots: u16) {
        assert!(
            self.is_canonical(),
            "call emitted without committing the frame first"
        );
        let len = self.stack.len() - arg_slots as usize;
        self.stack.truncate(len);
        self.real_sp = len as u16;
        self.jsp_synced = arg_slots == 0;
        self.pinned = RegSet::EMPTY;
    }

    // =========================================================================
    // Locals
    // =========================================================================

    /// Push a copy of local `index`.
    pub fn load_local(
        &mut self,
        asm: &mut Assembler<'_>,
        index: usize,
        kind: ValueKind,
    ) -> Result<(), CompileError> {
        match self.locals[index] {
            SlotState::Constant(value) => self.push_constant(kind, value),
            SlotState::InRegister(reg) | SlotState::UnflushedChanged(reg) => {
                self.push_register(reg, kind)
            }
            SlotState::Flushed => {
                let reg = self.alloc(asm)?;
                asm.load(reg, self.fp, self.local_home(index))?;
                self.locals[index] = SlotState::InRegister(reg);
                self.acquire(reg);
                self.push_register(reg, kind);
            }
        }
        Ok(())
    }

    /// Pop the top slot into local `index`.
    pub fn store_local(&mut self, asm: &mut Assembler<'_>, index: usize) -> Result<(), CompileError> {
        let value = self.pop(asm)?;
        self.set_local(index, value);
        Ok(())
    }

    fn set_local(&mut self, index: usize, value: Operand) {
        if let Some(old) = self.locals[index].register() {
            self.release(old);
        }
        self.locals[index] = match value {
            Operand::Imm(value) => SlotState::Constant(value),
            Operand::Reg(reg) => {
                self.acquire(reg);
                SlotState::UnflushedChanged(reg)
            }
        };
    }

    /// Add `delta` to local `index` in place.
    pub fn increment_local(
        &mut self,
        asm: &mut Assembler<'_>,
        index: usize,
        delta: i32,
    ) -> Result<(), CompileError> {
        let src = match self.locals[index] {
            SlotState::Constant(value) => {
                self.locals[index] = SlotState::Constant(value.wrapping_add(delta));
                return Ok(());
            }
            SlotState::InRegister(reg) | SlotState::UnflushedChanged(reg) => reg,
            SlotState::Flushed => {
                let reg = self.alloc(asm)?;
                asm.load(reg, self.fp, self.local_home(index))?;
                self.locals[index] = SlotState::InRegister(reg);
                self.acquire(reg);
                reg
            }
        };
        self.pin(src);
        let dst = if self.refs(src) > 1 {
            self.alloc(asm)?
        } else {
            src
        };
        asm.add_imm(dst, src, delta)?;
        self.set_local(index, Operand::Reg(dst));
        Ok(())
    }

    /// Forget locals that are never read at or after `bci`.
    pub fn release_dead_locals(&mut self, bci: Bci, last_read: &[Option<Bci>]) {
        for index in 0..self.locals.len() {
            let dead = last_read[index].is_none_or(|last| last < bci);
            if !dead || self.locals[index] == SlotState::Flushed {
                continue;
            }
            if let Some(reg) = self.locals[index].register() {
                self.release(reg);
            }
            self.locals[index] = SlotState::Flushed;
        }
    }

    // =========================================================================
    // Flushing
    // =========================================================================

    /// Registers for a pre-indexed store-multiple of the whole gap, if the
    /// gap qualifies.
    fn bulk_registers(&self) -> Option<SmallVec<[Reg; 8]>> {
        if !self.bulk_flush {
            return None;
        }
        let real = self.real_sp as usize;
        if self.stack[..real]
            .iter()
            .any(|slot| slot.state != SlotState::Flushed)
        {
            return None;
        }
        let mut regs = SmallVec::<[Reg; 8]>::new();
        for slot in &self.stack[real..] {
            if slot.kind.is_wide() || (slot.kind == ValueKind::Float && !self.float_bulk_flush) {
                return None;
            }
            let SlotState::UnflushedChanged(reg) = slot.state else {
                return None;
            };
            if regs.last().is_some_and(|&last| last >= reg) {
                return None;
            }
            regs.push(reg);
        }
        Some(regs)
    }

    fn sync_jsp(&mut self, asm: &mut Assembler<'_>, depth: u16) -> Result<(), CompileError> {
        asm.add_imm(self.jsp, self.fp, self.jsp_offset(depth))
    }

    /// Commit every operand-stack slot above the real stack pointer.
    ///
    /// Slots below the real stack pointer are left untouched.
    pub fn flush(&mut self, asm: &mut Assembler<'_>) -> Result<FlushKind, CompileError> {
        let len = self.stack.len() as u16;
        assert!(
            self.real_sp <= len,
            "real stack pointer {} ahead of virtual {len}",
            self.real_sp
        );
        if self.real_sp == len {
            if self.jsp_synced {
                return Ok(FlushKind::Nothing);
            }
            self.sync_jsp(asm, len)?;
            self.jsp_synced = true;
            return Ok(FlushKind::PointerOnly);
        }

        let from = self.real_sp;
        let kind = match self.bulk_registers() {
            Some(regs) => {
                if !self.jsp_synced {
                    self.sync_jsp(asm, from)?;
                }
                asm.store_multiple(self.jsp, &regs)?;
                FlushKind::Bulk
            }
            None => {
                for index in from as usize..len as usize {
                    self.store_state(asm, self.stack[index].state, self.stack_home(index))?;
                }
                self.sync_jsp(asm, len)?;
                FlushKind::SlotBySlot
            }
        };

        for index in from as usize..len as usize {
            if let Some(reg) = self.stack[index].state.register() {
                self.release(reg);
            }
            self.stack[index].state = SlotState::Flushed;
        }
        self.real_sp = len;
        self.jsp_synced = true;
        trace!(from, to = len, ?kind, "flushed operand stack");
        Ok(kind)
    }

    /// Commit everything and drop every register cache.
    pub fn flush_all(&mut self, asm: &mut Assembler<'_>) -> Result<(), CompileError> {
        self.flush(asm)?;
        for index in 0..self.locals.len() {
            let state = self.locals[index];
            if state.is_dirty() {
                self.store_state(asm, state, self.local_home(index))?;
            }
        }
        self.locals.fill(SlotState::Flushed);
        for slot in &mut self.stack {
            slot.state = SlotState::Flushed;
        }
        for usage in &mut self.usage {
            usage.refs = 0;
        }
        Ok(())
    }

    /// Adopt the canonical state expected at a merge point.
    pub fn reset_canonical(&mut self, kinds: &[ValueKind]) {
        self.locals.fill(SlotState::Flushed);
        self.stack.clear();
        self.stack.extend(kinds.iter().map(|&kind| StackSlot {
            state: SlotState::Flushed,
            kind,
        }));
        self.real_sp = kinds.len() as u16;
        self.jsp_synced = true;
        self.pinned = RegSet::EMPTY;
        for usage in &mut self.usage {
            usage.refs = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::CodeBuffer;
    use crate::backend::{Arch, isa_for};

    fn asm(arch: Arch) -> Assembler<'static> {
        Assembler::new(isa_for(arch), CodeBuffer::new(4096, 64), 16)
    }

    fn frame(arch: Arch, max_locals: u16, config: &JitConfig) -> VirtualFrame {
        VirtualFrame::new(isa_for(arch), max_locals, FrameMode::Framed, config)
    }

    /// Push values held in `regs` with the given kinds.
    fn push_all(frame: &mut VirtualFrame, slots: &[(u8, ValueKind)]) {
        for &(reg, kind) in slots {
            frame.push_register(Reg(reg), kind);
        }
    }

    #[test]
    fn test_flush_invariant() {
        let config = JitConfig::default();
        let mut asm = asm(Arch::Arm);
        let mut frame = frame(Arch::Arm, 1, &config);
        frame.push_constant(ValueKind::Int, 7);
        frame.flush(&mut asm).unwrap();
        frame.push_register(Reg(4), ValueKind::Int);
        frame.push_constant(ValueKind::Reference, 0);
        frame.push_register(Reg(2), ValueKind::Int);

        let below: Vec<StackSlot> = (0..frame.real_sp() as usize)
            .map(|i| frame.stack_slot(i))
            .collect();
        frame.flush(&mut asm).unwrap();

        assert_eq!(frame.real_sp(), frame.virtual_sp());
        for (i, slot) in below.iter().enumerate() {
            assert_eq!(frame.stack_slot(i), *slot);
        }
        for i in below.len()..frame.virtual_sp() as usize {
            assert_eq!(frame.stack_slot(i).state, SlotState::Flushed);
        }
        assert_eq!(frame.refs(Reg(4)), 0);
        assert_eq!(frame.flush(&mut asm).unwrap(), FlushKind::Nothing);
    }

    #[test]
    fn test_bulk_flush_for_ascending_registers() {
        let config = JitConfig::default();
        let mut asm = asm(Arch::Arm);
        let mut frame = frame(Arch::Arm, 2, &config);
        push_all(
            &mut frame,
            &[(0, ValueKind::Int), (1, ValueKind::Reference), (2, ValueKind::Int)],
        );
        assert_eq!(frame.flush(&mut asm).unwrap(), FlushKind::Bulk);
        // stmib r9!, {r0, r1, r2}
        assert_eq!(asm.buffer().bytes(), &0xE9A9_0007u32.to_le_bytes());
    }

    #[test]
    fn test_wide_value_forces_slot_by_slot() {
        let bulk = JitConfig::default();
        let no_bulk = JitConfig::default().with_bulk_flush(false);
        let slots = [
            (0, ValueKind::Int),
            (1, ValueKind::WideLow),
            (2, ValueKind::WideHigh),
        ];

        let mut with_bulk = asm(Arch::Arm);
        let mut a = frame(Arch::Arm, 1, &bulk);
        push_all(&mut a, &slots);
        assert_eq!(a.flush(&mut with_bulk).unwrap(), FlushKind::SlotBySlot);

        let mut without_bulk = asm(Arch::Arm);
        let mut b = frame(Arch::Arm, 1, &no_bulk);
        push_all(&mut b, &slots);
        assert_eq!(b.flush(&mut without_bulk).unwrap(), FlushKind::SlotBySlot);

        assert_eq!(with_bulk.buffer().bytes(), without_bulk.buffer().bytes());
        // Three stores and the jsp update.
        assert_eq!(with_bulk.buffer().len(), 16);
    }

    #[test]
    fn test_float_blocks_bulk_unless_enabled() {
        let slots = [(0, ValueKind::Int), (1, ValueKind::Float)];

        let mut asm_default = asm(Arch::Arm);
        let mut conservative = frame(Arch::Arm, 0, &JitConfig::default());
        push_all(&mut conservative, &slots);
        assert_eq!(
            conservative.flush(&mut asm_default).unwrap(),
            FlushKind::SlotBySlot
        );

        let mut asm_float = asm(Arch::Arm);
        let config = JitConfig::default().with_float_bulk_flush(true);
        let mut permissive = frame(Arch::Arm, 0, &config);
        push_all(&mut permissive, &slots);
        assert_eq!(permissive.flush(&mut asm_float).unwrap(), FlushKind::Bulk);
    }

    #[test]
    fn test_descending_or_shared_registers_are_not_bulk() {
        let config = JitConfig::default();
        for slots in [
            [(1, ValueKind::Int), (0, ValueKind::Int)],
            [(3, ValueKind::Int), (3, ValueKind::Int)],
        ] {
            let mut asm = asm(Arch::Arm);
            let mut frame = frame(Arch::Arm, 0, &config);
            push_all(&mut frame, &slots);
            assert_eq!(frame.flush(&mut asm).unwrap(), FlushKind::SlotBySlot);
        }
    }

    #[test]
    fn test_no_bulk_on_thumb_or_x86() {
        for arch in [Arch::Thumb, Arch::X86] {
            let mut asm = asm(arch);
            let mut frame = frame(arch, 1, &JitConfig::default());
            push_all(&mut frame, &[(0, ValueKind::Int), (1, ValueKind::Int)]);
            assert_eq!(frame.flush(&mut asm).unwrap(), FlushKind::SlotBySlot);
        }
    }

    #[test]
    fn test_pop_below_real_sp_unsyncs_jsp() {
        let mut asm = asm(Arch::Arm);
        let mut frame = frame(Arch::Arm, 1, &JitConfig::default());
        frame.push_register(Reg(0), ValueKind::Int);
        frame.push_register(Reg(1), ValueKind::Int);
        frame.flush(&mut asm).unwrap();
        frame.discard();
        assert_eq!(frame.real_sp(), 1);
        assert!(!frame.jsp_synced());
        assert_eq!(frame.flush(&mut asm).unwrap(), FlushKind::PointerOnly);
        assert!(frame.jsp_synced());
    }

    #[test]
    #[should_panic(expected = "ahead of virtual")]
    fn test_flush_with_inconsistent_pointers_panics() {
        let mut asm = asm(Arch::Arm);
        let mut frame = frame(Arch::Arm, 1, &JitConfig::default());
        frame.push_constant(ValueKind::Int, 1);
        frame.real_sp = 3;
        let _ = frame.flush(&mut asm);
    }

    #[test]
    fn test_spill_prefers_clean_then_lru() {
        use crate::backend::x86::registers::{EAX, EBP, EBX, ECX};

        let mut asm = asm(Arch::X86);
        let mut frame = frame(Arch::X86, 1, &JitConfig::default());

        // eax: dirty, least recently used.
        let reg = frame.alloc(&mut asm).unwrap();
        assert_eq!(reg, EAX);
        frame.push_register(reg, ValueKind::Int);
        frame.unpin_all();

        // ecx: clean cache of local 0.
        frame.load_local(&mut asm, 0, ValueKind::Int).unwrap();
        assert_eq!(frame.local(0), SlotState::InRegister(ECX));
        frame.discard();
        frame.unpin_all();

        // ebx, ebp: dirty, recent.
        for expected in [EBX, EBP] {
            let reg = frame.alloc(&mut asm).unwrap();
            assert_eq!(reg, expected);
            frame.push_register(reg, ValueKind::Int);
        }
        frame.unpin_all();

        let before = asm.buffer().len();
        assert_eq!(frame.alloc(&mut asm).unwrap(), ECX);
        assert_eq!(asm.buffer().len(), before, "clean spill needs no store");
        assert_eq!(frame.local(0), SlotState::Flushed);

        // Everything left is dirty: the oldest one goes, with a store.
        assert_eq!(frame.alloc(&mut asm).unwrap(), EAX);
        assert!(asm.buffer().len() > before);
        assert_eq!(frame.stack_slot(0).state, SlotState::Flushed);
    }

    #[test]
    fn test_frameless_exhaustion() {
        let mut asm = asm(Arch::X86);
        let config = JitConfig::default();
        let mut frame = VirtualFrame::new(isa_for(Arch::X86), 0, FrameMode::Frameless, &config);
        for _ in 0..2 {
            let reg = frame.alloc(&mut asm).unwrap();
            frame.push_register(reg, ValueKind::Int);
        }
        assert_eq!(frame.alloc(&mut asm), Err(CompileError::RegistersExhausted));
    }

    #[test]
    fn test_flush_all_reaches_canonical_state() {
        let mut asm = asm(Arch::Thumb);
        let mut frame = frame(Arch::Thumb, 2, &JitConfig::default());
        frame.bind_arguments(&[Reg(0), Reg(1)]);
        frame.load_local(&mut asm, 1, ValueKind::Int).unwrap();
        frame.push_constant(ValueKind::Int, 300);
        frame.store_local(&mut asm, 0).unwrap();
        assert_eq!(frame.local(0), SlotState::Constant(300));
        frame.flush_all(&mut asm).unwrap();
        assert!(frame.is_canonical());
        assert_eq!(frame.refs(Reg(0)), 0);
        assert_eq!(frame.refs(Reg(1)), 0);
    }

    #[test]
    fn test_increment_shared_local_copies() {
        let mut asm = asm(Arch::Arm);
        let mut frame = frame(Arch::Arm, 1, &JitConfig::default());
        frame.bind_arguments(&[Reg(0)]);
        frame.load_local(&mut asm, 0, ValueKind::Int).unwrap();
        frame.increment_local(&mut asm, 0, 1).unwrap();
        // The stack copy keeps r0; the local moves to a fresh register.
        assert_eq!(frame.stack_slot(0).state, SlotState::UnflushedChanged(Reg(0)));
        assert_eq!(frame.local(0), SlotState::UnflushedChanged(Reg(1)));
        assert_eq!(frame.refs(Reg(0)), 1);
    }

    #[test]
    fn test_dead_locals_release_registers() {
        let mut frame = frame(Arch::Arm, 2, &JitConfig::default());
        frame.bind_arguments(&[Reg(0), Reg(1)]);
        frame.release_dead_locals(3, &[Some(2), Some(5)]);
        assert_eq!(frame.local(0), SlotState::Flushed);
        assert_eq!(frame.refs(Reg(0)), 0);
        assert_eq!(frame.local(1), SlotState::UnflushedChanged(Reg(1)));
    }
}
