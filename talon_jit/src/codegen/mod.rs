//! Method compilation driver.
//!
//! The flow for one method is:
//!
//! 1. Analyze the bytecode (stack shapes, merge points, liveness)
//! 2. Pick a frame mode: frameless for qualifying leaves, framed otherwise
//! 3. Emit the prologue, binding arguments to their registers
//! 4. Lower each reachable instruction through the virtual frame
//! 5. Emit the synchronization stubs of deferred forward branches
//! 6. Place remaining literals, resolve labels and package the result
//!
//! Nothing escapes until the last step succeeds, so a failure at any point
//! leaves the method interpreted with no partial state observable.

pub mod analysis;

use std::sync::Arc;

use rustc_hash::FxHashMap;
use talon_core::{
    Bci, Condition, MethodDescriptor, MethodId, Opcode, ResultKind, Stub, StubTable,
};
use tracing::{debug, trace};

use crate::assembler::{Assembler, CodeBuffer, Label};
use crate::backend::{AluOp, Arch, FrameShape, Reg, TargetIsa, isa_for};
use crate::config::JitConfig;
use crate::error::{CompilationFailed, CompileError};
use crate::frame::{FrameMode, Operand, ValueKind, VirtualFrame};
use crate::method::{CompiledMethod, CompiledParts};
use crate::reloc::RelocationTable;
use crate::trap_table::{Trap, TrapTable};

use self::analysis::MethodInfo;

// =============================================================================
// Compile Context
// =============================================================================

/// Everything a compilation reads besides the method itself.
#[derive(Debug, Clone, Copy)]
pub struct CompileContext<'a> {
    pub arch: Arch,
    pub config: &'a JitConfig,
    pub stubs: &'a StubTable,
    pub traps: Option<&'a TrapTable>,
    /// Address the code is assumed to run at until it is installed.
    pub base: usize,
}

impl<'a> CompileContext<'a> {
    pub fn new(arch: Arch, config: &'a JitConfig, stubs: &'a StubTable) -> Self {
        Self {
            arch,
            config,
            stubs,
            traps: None,
            base: 0,
        }
    }

    pub fn with_traps(mut self, traps: &'a TrapTable) -> Self {
        self.traps = Some(traps);
        self
    }

    pub fn with_base(mut self, base: usize) -> Self {
        self.base = base;
        self
    }
}

/// Compile `method` to native code.
///
/// On failure the method must keep running in the interpreter.
pub fn compile(
    method: &Arc<MethodDescriptor>,
    ctx: &CompileContext<'_>,
) -> Result<CompiledMethod, CompilationFailed> {
    match compile_method(method, ctx) {
        Ok(compiled) => {
            debug!(
                method = %method.id,
                name = %method.name,
                arch = %ctx.arch,
                bytes = compiled.length(),
                relocations = compiled.relocations().len(),
                frameless = compiled.frame_shape().is_none(),
                "compiled method"
            );
            Ok(compiled)
        }
        Err(reason) => {
            debug!(
                method = %method.id,
                name = %method.name,
                arch = %ctx.arch,
                %reason,
                "compilation failed; staying interpreted"
            );
            Err(CompilationFailed {
                method: method.id,
                reason,
            })
        }
    }
}

fn compile_method(
    method: &Arc<MethodDescriptor>,
    ctx: &CompileContext<'_>,
) -> Result<CompiledMethod, CompileError> {
    let info = analysis::analyze(method)?;
    let trap = ctx.traps.and_then(|traps| traps.trap_for(method.id));

    if info.frameless_eligible && trap.is_none() {
        match Generator::new(method, ctx, &info, FrameMode::Frameless, None)?.run() {
            Err(CompileError::RegistersExhausted) => {
                trace!(method = %method.id, "frameless attempt ran out of registers");
            }
            result => return result,
        }
    }
    Generator::new(method, ctx, &info, FrameMode::Framed, trap)?.run()
}

// =============================================================================
// Generator
// =============================================================================

/// A forward branch whose frame state must be committed on the taken path.
struct PendingSync {
    stub: Label,
    target: Bci,
    frame: VirtualFrame,
}

struct Generator<'a> {
    method: &'a Arc<MethodDescriptor>,
    ctx: &'a CompileContext<'a>,
    info: &'a MethodInfo,
    isa: &'static dyn TargetIsa,
    asm: Assembler<'static>,
    frame: VirtualFrame,
    shape: Option<FrameShape>,
    trap: Option<Trap>,
    labels: FxHashMap<Bci, Label>,
    pending: Vec<PendingSync>,
    bci_map: FxHashMap<Bci, u32>,
    liveness: bool,
    /// Whether control can reach the next instruction by falling through.
    live: bool,
}

impl<'a> Generator<'a> {
    fn new(
        method: &'a Arc<MethodDescriptor>,
        ctx: &'a CompileContext<'a>,
        info: &'a MethodInfo,
        mode: FrameMode,
        trap: Option<Trap>,
    ) -> Result<Self, CompileError> {
        let isa = isa_for(ctx.arch);

        let arg_slots = method.arg_slots();
        let arg_regs = isa.argument_registers().len();
        if arg_slots as usize > arg_regs {
            return Err(CompileError::TooManyArguments {
                slots: arg_slots,
                limit: arg_regs,
            });
        }

        let slots = method.max_locals as u32 + method.max_stack as u32;
        let limit = isa.max_frame_slots();
        if slots > limit as u32 {
            return Err(CompileError::FrameTooLarge { slots, limit });
        }
        let shape = (mode == FrameMode::Framed).then_some(FrameShape {
            slots: slots as u16,
            max_locals: method.max_locals,
        });

        let max_size = ctx.config.max_code_size.min(isa.max_code_size());
        let buf = CodeBuffer::new(max_size, ctx.config.max_pool_entries).with_base(ctx.base);
        let asm = Assembler::new(isa, buf, ctx.config.pool_margin);
        let frame = VirtualFrame::new(isa, method.max_locals, mode, ctx.config);

        Ok(Self {
            method,
            ctx,
            info,
            isa,
            asm,
            frame,
            shape,
            trap,
            labels: FxHashMap::default(),
            pending: Vec::new(),
            bci_map: FxHashMap::default(),
            liveness: ctx.config.local_liveness && info.liveness_usable(),
            live: true,
        })
    }

    fn run(mut self) -> Result<CompiledMethod, CompileError> {
        self.emit_entry()?;
        let method = self.method;
        for (bci, op) in method.code.iter().enumerate() {
            self.emit_instruction(bci as Bci, op)?;
        }
        self.emit_pending_syncs()?;

        let finished = self.asm.finish()?;
        Ok(CompiledMethod::from_parts(CompiledParts {
            source: Arc::clone(self.method),
            arch: self.ctx.arch,
            code: finished.code,
            base: self.ctx.base,
            entry_offset: 0,
            relocations: RelocationTable::from_sorted(finished.relocations),
            data_ranges: finished.data_ranges,
            bci_map: self.bci_map,
            frame: self.shape,
        }))
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn label_for(&mut self, bci: Bci) -> Label {
        *self
            .labels
            .entry(bci)
            .or_insert_with(|| self.asm.new_label())
    }

    fn call_stub(&mut self, stub: Stub) -> Result<(), CompileError> {
        let location = self
            .ctx
            .stubs
            .location(stub)
            .ok_or(CompileError::MissingStub(stub))?;
        self.asm.call(stub, location)
    }

    fn first_arg(&self) -> Reg {
        self.isa.argument_registers()[0]
    }

    fn emit_entry(&mut self) -> Result<(), CompileError> {
        if let Some(shape) = self.shape {
            self.asm.prologue(&shape)?;
        }
        let arg_regs = self.isa.argument_registers();
        self.frame
            .bind_arguments(&arg_regs[..self.method.arg_slots() as usize]);

        if let Some(trap) = self.trap {
            self.frame.flush_all(&mut self.asm)?;
            let arg0 = self.first_arg();
            self.asm.move_imm(arg0, trap.handle.index() as i32)?;
            self.call_stub(Stub::MethodTrap)?;
            self.frame.after_call(0);
        }
        Ok(())
    }

    // =========================================================================
    // Instructions
    // =========================================================================

    fn emit_instruction(&mut self, bci: Bci, op: &Opcode) -> Result<(), CompileError> {
        let info = self.info;
        let Some(entry) = &info.entry_stacks[bci as usize] else {
            self.live = false;
            return Ok(());
        };
        if info.is_merge_point(bci) {
            if self.live {
                self.frame.flush_all(&mut self.asm)?;
            }
            self.frame.reset_canonical(entry);
            let label = self.label_for(bci);
            self.asm.bind(label);
        }
        self.bci_map.insert(bci, self.asm.offset());
        if self.liveness {
            self.frame.release_dead_locals(bci, &info.last_read);
        }

        self.lower(bci, op)?;
        self.frame.unpin_all();
        self.live = !op.ends_block();
        Ok(())
    }

    fn lower(&mut self, bci: Bci, op: &Opcode) -> Result<(), CompileError> {
        match *op {
            Opcode::Nop => {}

            Opcode::IConst(value) => self.frame.push_constant(ValueKind::Int, value),
            Opcode::FConst(value) => self
                .frame
                .push_constant(ValueKind::Float, value.to_bits() as i32),
            Opcode::LConst(value) => {
                for (half, kind) in [
                    (value as u32, ValueKind::WideLow),
                    ((value >> 32) as u32, ValueKind::WideHigh),
                ] {
                    let reg = self.frame.alloc(&mut self.asm)?;
                    self.asm.load_literal(reg, half)?;
                    self.frame.push_register(reg, kind);
                }
            }
            Opcode::ObjConst(obj) => {
                let reg = self.frame.alloc(&mut self.asm)?;
                self.asm.load_object(reg, obj)?;
                self.frame.push_register(reg, ValueKind::Reference);
            }

            Opcode::ILoad(i) => self.frame.load_local(&mut self.asm, i as usize, ValueKind::Int)?,
            Opcode::FLoad(i) => self
                .frame
                .load_local(&mut self.asm, i as usize, ValueKind::Float)?,
            Opcode::ALoad(i) => {
                self.frame
                    .load_local(&mut self.asm, i as usize, ValueKind::Reference)?
            }
            Opcode::LLoad(i) => {
                self.frame
                    .load_local(&mut self.asm, i as usize, ValueKind::WideLow)?;
                self.frame
                    .load_local(&mut self.asm, i as usize + 1, ValueKind::WideHigh)?;
            }
            Opcode::IStore(i) | Opcode::FStore(i) | Opcode::AStore(i) => {
                self.frame.store_local(&mut self.asm, i as usize)?
            }
            Opcode::LStore(i) => {
                self.frame.store_local(&mut self.asm, i as usize + 1)?;
                self.frame.store_local(&mut self.asm, i as usize)?;
            }
            Opcode::IInc(i, delta) => {
                self.frame
                    .increment_local(&mut self.asm, i as usize, delta as i32)?
            }

            Opcode::IAdd => self.int_binary(AluOp::Add)?,
            Opcode::ISub => self.int_binary(AluOp::Sub)?,
            Opcode::IMul => self.int_binary(AluOp::Mul)?,
            Opcode::IAnd => self.int_binary(AluOp::And)?,
            Opcode::IOr => self.int_binary(AluOp::Or)?,
            Opcode::IXor => self.int_binary(AluOp::Xor)?,
            Opcode::LAdd => self.long_binary(AluOp::Adds, AluOp::Adc)?,
            Opcode::LSub => self.long_binary(AluOp::Subs, AluOp::Sbc)?,
            Opcode::FAdd => self.float_add()?,

            Opcode::Dup => self.frame.dup(&mut self.asm)?,
            Opcode::Pop => self.frame.discard(),
            Opcode::Swap => {
                let (top_kind, below_kind) = (self.frame.kind_at(0), self.frame.kind_at(1));
                let top = self.frame.pop(&mut self.asm)?;
                let below = self.frame.pop(&mut self.asm)?;
                self.frame.push(top, top_kind);
                self.frame.push(below, below_kind);
            }

            Opcode::IfZero(cond, target) => {
                let value = self.frame.pop(&mut self.asm)?;
                match value {
                    Operand::Imm(v) => {
                        if cond.holds(v, 0) {
                            self.goto(target)?;
                        }
                    }
                    Operand::Reg(reg) => self.conditional(bci, target, cond, reg, Operand::Imm(0))?,
                }
            }
            Opcode::IfICmp(cond, target) => {
                let rhs = self.frame.pop(&mut self.asm)?;
                let lhs = self.frame.pop(&mut self.asm)?;
                match (lhs, rhs) {
                    (Operand::Imm(a), Operand::Imm(b)) => {
                        if cond.holds(a, b) {
                            self.goto(target)?;
                        }
                    }
                    (Operand::Imm(a), Operand::Reg(reg)) => {
                        self.conditional(bci, target, swapped(cond), reg, Operand::Imm(a))?
                    }
                    (Operand::Reg(reg), rhs) => self.conditional(bci, target, cond, reg, rhs)?,
                }
            }
            Opcode::Goto(target) => self.goto(target)?,

            Opcode::InvokeStatic {
                method,
                arg_slots,
                result,
            } => self.invoke(method, arg_slots, result)?,

            Opcode::IReturn | Opcode::FReturn | Opcode::AReturn => {
                let value = self.frame.pop(&mut self.asm)?;
                let (result, _) = self.isa.result_registers();
                match value {
                    Operand::Imm(v) => self.asm.move_imm(result, v)?,
                    Operand::Reg(reg) => self.asm.move_reg(result, reg)?,
                }
                self.asm.ret(self.shape.as_ref())?;
            }
            Opcode::LReturn => {
                let high = self.frame.pop_register(&mut self.asm)?;
                let low = self.frame.pop_register(&mut self.asm)?;
                let (r0, r1) = self.isa.result_registers();
                self.asm.move_pair((r0, low), (r1, high))?;
                self.asm.ret(self.shape.as_ref())?;
            }
            Opcode::Return => self.asm.ret(self.shape.as_ref())?,
        }
        Ok(())
    }

    fn int_binary(&mut self, op: AluOp) -> Result<(), CompileError> {
        let rhs = self.frame.pop(&mut self.asm)?;
        let lhs = self.frame.pop(&mut self.asm)?;
        match (lhs, rhs) {
            (Operand::Imm(a), Operand::Imm(b)) => {
                self.frame.push_constant(ValueKind::Int, fold(op, a, b));
            }
            (Operand::Reg(src), Operand::Imm(imm)) if matches!(op, AluOp::Add | AluOp::Sub) => {
                let imm = if op == AluOp::Sub { imm.wrapping_neg() } else { imm };
                let dst = self.frame.dest_for(&mut self.asm, src)?;
                self.asm.add_imm(dst, src, imm)?;
                self.frame.push_register(dst, ValueKind::Int);
            }
            (lhs, rhs) => {
                let lhs = self.frame.materialize(&mut self.asm, lhs)?;
                let rhs = self.frame.materialize(&mut self.asm, rhs)?;
                let dst = self.frame.dest_for(&mut self.asm, lhs)?;
                self.asm.alu(op, dst, lhs, rhs)?;
                self.frame.push_register(dst, ValueKind::Int);
            }
        }
        Ok(())
    }

    /// Two-word arithmetic: `low_op` sets the carry `high_op` consumes.
    fn long_binary(&mut self, low_op: AluOp, high_op: AluOp) -> Result<(), CompileError> {
        let rhs_high = self.frame.pop_register(&mut self.asm)?;
        let rhs_low = self.frame.pop_register(&mut self.asm)?;
        let lhs_high = self.frame.pop_register(&mut self.asm)?;
        let lhs_low = self.frame.pop_register(&mut self.asm)?;

        // The low result must not clobber an input of the high half.
        let dst_low = if lhs_low != lhs_high && lhs_low != rhs_high {
            self.frame.dest_for(&mut self.asm, lhs_low)?
        } else {
            self.frame.alloc(&mut self.asm)?
        };
        let dst_high = self.frame.dest_for(&mut self.asm, lhs_high)?;

        self.asm.alu(low_op, dst_low, lhs_low, rhs_low)?;
        self.asm.alu(high_op, dst_high, lhs_high, rhs_high)?;
        self.frame.push_register(dst_low, ValueKind::WideLow);
        self.frame.push_register(dst_high, ValueKind::WideHigh);
        Ok(())
    }

    /// Soft-float addition through the runtime.
    fn float_add(&mut self) -> Result<(), CompileError> {
        let rhs = self.frame.pop_register(&mut self.asm)?;
        let lhs = self.frame.pop_register(&mut self.asm)?;
        self.frame.flush_all(&mut self.asm)?;
        let (arg0, arg1) = self.isa.result_registers();
        self.asm.move_pair((arg0, lhs), (arg1, rhs))?;
        self.call_stub(Stub::FloatAdd)?;
        self.frame.after_call(0);
        self.frame.push_register(arg0, ValueKind::Float);
        Ok(())
    }

    fn invoke(
        &mut self,
        callee: MethodId,
        arg_slots: u16,
        result: ResultKind,
    ) -> Result<(), CompileError> {
        self.frame.flush_all(&mut self.asm)?;
        let arg0 = self.first_arg();
        self.asm.move_imm(arg0, callee.0 as i32)?;
        self.call_stub(Stub::Invoke)?;
        self.frame.after_call(arg_slots);

        if let ResultKind::Value(ty) = result {
            let (r0, r1) = self.isa.result_registers();
            for (&kind, reg) in ValueKind::of(ty).iter().zip([r0, r1]) {
                self.frame.push_register(reg, kind);
            }
        }
        Ok(())
    }

    // =========================================================================
    // Control flow
    // =========================================================================

    fn goto(&mut self, target: Bci) -> Result<(), CompileError> {
        self.frame.flush_all(&mut self.asm)?;
        let label = self.label_for(target);
        self.asm.jump(label)
    }

    /// Branch to `target` when `lhs cond rhs`.
    fn conditional(
        &mut self,
        bci: Bci,
        target: Bci,
        cond: Condition,
        lhs: Reg,
        rhs: Operand,
    ) -> Result<(), CompileError> {
        let backward = target <= bci;
        if backward {
            self.frame.flush_all(&mut self.asm)?;
        }

        match rhs {
            Operand::Imm(imm) => self.asm.compare_imm(lhs, imm)?,
            Operand::Reg(rhs) => self.asm.compare(lhs, rhs)?,
        }

        let target_label = self.label_for(target);
        if backward || self.frame.is_canonical() {
            return self.asm.branch(cond, target_label);
        }
        let stub = self.asm.new_label();
        self.asm.branch(cond, stub)?;
        self.pending.push(PendingSync {
            stub,
            target,
            frame: self.frame.clone(),
        });
        Ok(())
    }

    /// Commit each deferred branch's frame on its taken path.
    fn emit_pending_syncs(&mut self) -> Result<(), CompileError> {
        for sync in std::mem::take(&mut self.pending) {
            let PendingSync {
                stub,
                target,
                mut frame,
            } = sync;
            self.asm.bind(stub);
            frame.flush_all(&mut self.asm)?;
            let label = self.label_for(target);
            self.asm.jump(label)?;
            trace!(target, "emitted branch synchronization stub");
        }
        Ok(())
    }
}

/// Condition that holds for `(b, a)` exactly when `cond` holds for `(a, b)`.
fn swapped(cond: Condition) -> Condition {
    match cond {
        Condition::Eq | Condition::Ne => cond,
        Condition::Lt => Condition::Gt,
        Condition::Gt => Condition::Lt,
        Condition::Le => Condition::Ge,
        Condition::Ge => Condition::Le,
    }
}

fn fold(op: AluOp, a: i32, b: i32) -> i32 {
    match op {
        AluOp::Add | AluOp::Adds => a.wrapping_add(b),
        AluOp::Sub | AluOp::Subs => a.wrapping_sub(b),
        AluOp::Mul => a.wrapping_mul(b),
        AluOp::And => a & b,
        AluOp::Or => a | b,
        AluOp::Xor => a ^ b,
        AluOp::Adc | AluOp::Sbc => unreachable!("carry ops are never folded"),
    }
}

#[cfg(test)]
mod tests;
