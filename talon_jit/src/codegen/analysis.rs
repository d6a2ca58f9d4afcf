//! Pre-pass over a method's bytecode.
//!
//! Computes, in one forward walk:
//! - the operand-stack shape at the start of every reachable instruction
//! - which instructions are control-flow merge points
//! - the last instruction that reads each local (for liveness)
//! - whether the method can run without a machine frame
//!
//! Malformed bytecode is reported as [`CompileError::MalformedBytecode`]
//! rather than trusted: the generator relies on every shape computed here.

use smallvec::SmallVec;
use talon_core::{Bci, MethodDescriptor, Opcode, ResultKind, ValueType};

use crate::error::CompileError;
use crate::frame::ValueKind;

/// Stack shape at one program point, bottom first.
pub type StackShape = SmallVec<[ValueKind; 8]>;

#[derive(Debug, Clone)]
pub struct MethodInfo {
    /// Stack shape on entry to each instruction; `None` if unreachable.
    pub entry_stacks: Vec<Option<StackShape>>,
    merge_points: Vec<bool>,
    /// Per local, the last instruction that reads it.
    pub last_read: Vec<Option<Bci>>,
    pub has_backward_branch: bool,
    pub has_handlers: bool,
    /// Straight-line leaf touching only int arguments and constants.
    pub frameless_eligible: bool,
}

impl MethodInfo {
    #[inline]
    pub fn is_merge_point(&self, bci: Bci) -> bool {
        self.merge_points[bci as usize]
    }

    #[inline]
    pub fn is_reachable(&self, bci: Bci) -> bool {
        self.entry_stacks[bci as usize].is_some()
    }

    /// Whether last-read positions may be used to drop dead locals.
    #[inline]
    pub fn liveness_usable(&self) -> bool {
        !self.has_backward_branch && !self.has_handlers
    }
}

fn malformed(bci: Bci, reason: &'static str) -> CompileError {
    CompileError::MalformedBytecode { bci, reason }
}

/// Abstract interpretation state for one instruction.
struct Walker<'m> {
    method: &'m MethodDescriptor,
    bci: Bci,
    stack: StackShape,
}

impl Walker<'_> {
    fn push(&mut self, kinds: &[ValueKind]) -> Result<(), CompileError> {
        if self.stack.len() + kinds.len() > self.method.max_stack as usize {
            return Err(malformed(self.bci, "operand stack overflow"));
        }
        self.stack.extend_from_slice(kinds);
        Ok(())
    }

    fn pop_single(&mut self) -> Result<ValueKind, CompileError> {
        match self.stack.pop() {
            None => Err(malformed(self.bci, "operand stack underflow")),
            Some(kind) if kind.is_wide() => Err(malformed(self.bci, "splits a wide value")),
            Some(kind) => Ok(kind),
        }
    }

    fn pop_wide(&mut self) -> Result<(), CompileError> {
        let high = self.stack.pop();
        let low = self.stack.pop();
        match (low, high) {
            (Some(ValueKind::WideLow), Some(ValueKind::WideHigh)) => Ok(()),
            (_, None) | (None, _) => Err(malformed(self.bci, "operand stack underflow")),
            _ => Err(malformed(self.bci, "expected a wide value")),
        }
    }

    fn pop_slots(&mut self, slots: u16) -> Result<(), CompileError> {
        let slots = slots as usize;
        if slots > self.stack.len() {
            return Err(malformed(self.bci, "operand stack underflow"));
        }
        let rest = self.stack.len() - slots;
        if slots > 0 && rest > 0 && self.stack[rest] == ValueKind::WideHigh {
            return Err(malformed(self.bci, "splits a wide value"));
        }
        self.stack.truncate(rest);
        Ok(())
    }

    fn local(&self, index: u16, width: u16) -> Result<usize, CompileError> {
        if index as usize + width as usize > self.method.max_locals as usize {
            return Err(malformed(self.bci, "local index out of range"));
        }
        Ok(index as usize)
    }

    /// Apply the stack effect of `op`.
    fn step(&mut self, op: &Opcode, last_read: &mut [Option<Bci>]) -> Result<(), CompileError> {
        use ValueKind::{Float, Int, Reference, WideHigh, WideLow};

        let bci = self.bci;
        let mut read = |index: usize, width: usize| {
            for slot in &mut last_read[index..index + width] {
                *slot = Some(bci);
            }
        };

        match *op {
            Opcode::Nop | Opcode::Goto(_) | Opcode::Return => {}
            Opcode::IConst(_) => self.push(&[Int])?,
            Opcode::FConst(_) => self.push(&[Float])?,
            Opcode::ObjConst(_) => self.push(&[Reference])?,
            Opcode::LConst(_) => self.push(&[WideLow, WideHigh])?,

            Opcode::ILoad(i) | Opcode::FLoad(i) | Opcode::ALoad(i) => {
                let index = self.local(i, 1)?;
                read(index, 1);
                let kind = match op {
                    Opcode::ILoad(_) => Int,
                    Opcode::FLoad(_) => Float,
                    _ => Reference,
                };
                self.push(&[kind])?;
            }
            Opcode::LLoad(i) => {
                let index = self.local(i, 2)?;
                read(index, 2);
                self.push(&[WideLow, WideHigh])?;
            }
            Opcode::IStore(i) | Opcode::FStore(i) | Opcode::AStore(i) => {
                self.local(i, 1)?;
                self.pop_single()?;
            }
            Opcode::LStore(i) => {
                self.local(i, 2)?;
                self.pop_wide()?;
            }
            Opcode::IInc(i, _) => {
                let index = self.local(i, 1)?;
                read(index, 1);
            }

            Opcode::IAdd
            | Opcode::ISub
            | Opcode::IMul
            | Opcode::IAnd
            | Opcode::IOr
            | Opcode::IXor => {
                self.pop_single()?;
                self.pop_single()?;
                self.push(&[Int])?;
            }
            Opcode::FAdd => {
                self.pop_single()?;
                self.pop_single()?;
                self.push(&[Float])?;
            }
            Opcode::LAdd | Opcode::LSub => {
                self.pop_wide()?;
                self.pop_wide()?;
                self.push(&[WideLow, WideHigh])?;
            }

            Opcode::Dup => {
                let kind = self.pop_single()?;
                self.push(&[kind, kind])?;
            }
            Opcode::Pop => {
                self.pop_single()?;
            }
            Opcode::Swap => {
                let top = self.pop_single()?;
                let below = self.pop_single()?;
                self.push(&[top, below])?;
            }

            Opcode::IfZero(..) => {
                self.pop_single()?;
            }
            Opcode::IfICmp(..) => {
                self.pop_single()?;
                self.pop_single()?;
            }
            Opcode::InvokeStatic {
                arg_slots, result, ..
            } => {
                self.pop_slots(arg_slots)?;
                if let ResultKind::Value(ty) = result {
                    self.push(ValueKind::of(ty))?;
                }
            }

            Opcode::IReturn | Opcode::FReturn | Opcode::AReturn => {
                self.pop_single()?;
            }
            Opcode::LReturn => self.pop_wide()?,
        }
        Ok(())
    }
}

/// Whether `op` can be lowered without a frame.
fn frameless_op(op: &Opcode, arg_slots: u16) -> bool {
    match *op {
        Opcode::ILoad(i) | Opcode::IStore(i) | Opcode::IInc(i, _) => i < arg_slots,
        Opcode::Nop
        | Opcode::IConst(_)
        | Opcode::IAdd
        | Opcode::ISub
        | Opcode::IMul
        | Opcode::IAnd
        | Opcode::IOr
        | Opcode::IXor
        | Opcode::Dup
        | Opcode::Pop
        | Opcode::Swap
        | Opcode::IReturn
        | Opcode::Return => true,
        _ => false,
    }
}

/// Record the shape flowing into `target`, checking agreement at merges.
fn record(
    entry_stacks: &mut [Option<StackShape>],
    from: Bci,
    target: usize,
    shape: &StackShape,
) -> Result<(), CompileError> {
    match &entry_stacks[target] {
        Some(existing) if existing != shape => {
            Err(malformed(from, "operand stack shape differs at merge point"))
        }
        Some(_) => Ok(()),
        None => {
            entry_stacks[target] = Some(shape.clone());
            Ok(())
        }
    }
}

/// Analyze `method`, validating its bytecode.
pub fn analyze(method: &MethodDescriptor) -> Result<MethodInfo, CompileError> {
    let code = &method.code;
    let len = code.len();
    if len == 0 {
        return Err(malformed(0, "empty method body"));
    }
    if method.arg_slots() > method.max_locals {
        return Err(malformed(0, "arguments exceed max_locals"));
    }

    let mut entry_stacks: Vec<Option<StackShape>> = vec![None; len];
    let mut merge_points = vec![false; len];
    let mut last_read = vec![None; method.max_locals as usize];
    let mut has_backward_branch = false;

    // Every branch target and handler entry is a merge point.
    for (bci, op) in code.iter().enumerate() {
        if let Some(target) = op.branch_target() {
            if target as usize >= len {
                return Err(malformed(bci as Bci, "branch target out of range"));
            }
            merge_points[target as usize] = true;
            has_backward_branch |= target as usize <= bci;
        }
    }
    for range in &method.handlers {
        if range.handler as usize >= len || range.start > range.end || range.end as usize > len {
            return Err(malformed(range.handler, "exception range out of bounds"));
        }
        merge_points[range.handler as usize] = true;
    }

    entry_stacks[0] = Some(StackShape::new());
    for range in &method.handlers {
        let shape: StackShape = SmallVec::from_slice(&[ValueKind::Reference]);
        record(&mut entry_stacks, range.handler, range.handler as usize, &shape)?;
    }

    // Forward edges settle within a sweep; repeat while a backward edge
    // reaches something new.
    let mut changed = true;
    while changed {
        changed = false;
        for bci in 0..len {
            let Some(shape) = entry_stacks[bci].clone() else {
                continue;
            };
            let op = &code[bci];
            let mut walker = Walker {
                method,
                bci: bci as Bci,
                stack: shape,
            };
            walker.step(op, &mut last_read)?;

            if let Some(target) = op.branch_target() {
                let before = entry_stacks[target as usize].is_some();
                record(&mut entry_stacks, bci as Bci, target as usize, &walker.stack)?;
                changed |= !before && (target as usize) < bci;
            }
            if !op.ends_block() {
                if bci + 1 == len {
                    return Err(malformed(bci as Bci, "control falls off the end of the code"));
                }
                record(&mut entry_stacks, bci as Bci, bci + 1, &walker.stack)?;
            }
        }
    }

    let arg_slots = method.arg_slots();
    let frameless_eligible = method.handlers.is_empty()
        && merge_points.iter().all(|merge| !merge)
        && method.args.iter().all(|ty| *ty == ValueType::Int)
        && code.iter().all(|op| frameless_op(op, arg_slots));

    Ok(MethodInfo {
        entry_stacks,
        merge_points,
        last_read,
        has_backward_branch,
        has_handlers: !method.handlers.is_empty(),
        frameless_eligible,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use talon_core::{Condition, ExceptionRange, MethodId};

    fn method(args: Vec<ValueType>, max_locals: u16, code: Vec<Opcode>) -> MethodDescriptor {
        MethodDescriptor::new(MethodId(1), "t", args, max_locals, 4, code)
    }

    fn reason(err: CompileError) -> &'static str {
        match err {
            CompileError::MalformedBytecode { reason, .. } => reason,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_add_is_frameless_leaf() {
        let m = method(
            vec![ValueType::Int, ValueType::Int],
            2,
            vec![Opcode::ILoad(0), Opcode::ILoad(1), Opcode::IAdd, Opcode::IReturn],
        );
        let info = analyze(&m).unwrap();
        assert!(info.frameless_eligible);
        assert!(info.liveness_usable());
        assert_eq!(info.last_read, vec![Some(0), Some(1)]);
        assert_eq!(
            info.entry_stacks[2].as_deref(),
            Some(&[ValueKind::Int, ValueKind::Int][..])
        );
    }

    #[test]
    fn test_loop_marks_merge_and_backward_branch() {
        // i = 0; do { i++ } while (i < 10); return i
        let m = method(
            vec![],
            1,
            vec![
                Opcode::IConst(0),
                Opcode::IStore(0),
                Opcode::IInc(0, 1),
                Opcode::ILoad(0),
                Opcode::IConst(10),
                Opcode::IfICmp(Condition::Lt, 2),
                Opcode::ILoad(0),
                Opcode::IReturn,
            ],
        );
        let info = analyze(&m).unwrap();
        assert!(info.has_backward_branch);
        assert!(info.is_merge_point(2));
        assert!(!info.is_merge_point(3));
        assert!(!info.frameless_eligible);
        assert!(!info.liveness_usable());
    }

    #[test]
    fn test_unreachable_code_is_skipped() {
        let m = method(
            vec![],
            0,
            vec![Opcode::Goto(2), Opcode::Nop, Opcode::Return],
        );
        let info = analyze(&m).unwrap();
        assert!(info.is_reachable(0));
        assert!(!info.is_reachable(1));
        assert!(info.is_reachable(2));
    }

    #[test]
    fn test_handler_entry_holds_exception() {
        let m = method(vec![], 1, vec![Opcode::Return, Opcode::AStore(0), Opcode::Return])
            .with_handlers(vec![ExceptionRange {
                start: 0,
                end: 1,
                handler: 1,
            }]);
        let info = analyze(&m).unwrap();
        assert!(info.is_merge_point(1));
        assert_eq!(
            info.entry_stacks[1].as_deref(),
            Some(&[ValueKind::Reference][..])
        );
        assert!(!info.liveness_usable());
    }

    #[test]
    fn test_malformed_bytecode() {
        let cases: Vec<(MethodDescriptor, &str)> = vec![
            (method(vec![], 0, vec![Opcode::IAdd, Opcode::Return]), "operand stack underflow"),
            (method(vec![], 1, vec![Opcode::ILoad(3), Opcode::IReturn]), "local index out of range"),
            (method(vec![], 0, vec![Opcode::Goto(9)]), "branch target out of range"),
            (method(vec![], 0, vec![Opcode::Nop]), "control falls off the end of the code"),
            (
                method(vec![], 0, vec![Opcode::LConst(1), Opcode::Pop, Opcode::Return]),
                "splits a wide value",
            ),
            (
                method(
                    vec![],
                    0,
                    vec![
                        Opcode::IConst(1),
                        Opcode::IfZero(Condition::Eq, 3),
                        Opcode::IConst(2),
                        Opcode::Return,
                    ],
                ),
                "operand stack shape differs at merge point",
            ),
            (method(vec![ValueType::Long], 1, vec![Opcode::Return]), "arguments exceed max_locals"),
        ];
        for (m, expected) in cases {
            assert_eq!(reason(analyze(&m).unwrap_err()), expected);
        }
    }

    #[test]
    fn test_stack_overflow() {
        let m = MethodDescriptor::new(
            MethodId(2),
            "deep",
            vec![],
            0,
            1,
            vec![Opcode::IConst(1), Opcode::IConst(2), Opcode::Return],
        );
        assert_eq!(reason(analyze(&m).unwrap_err()), "operand stack overflow");
    }

    #[test]
    fn test_calls_block_frameless() {
        let m = method(
            vec![ValueType::Int],
            1,
            vec![
                Opcode::ILoad(0),
                Opcode::InvokeStatic {
                    method: MethodId(9),
                    arg_slots: 1,
                    result: ResultKind::Value(ValueType::Long),
                },
                Opcode::LReturn,
            ],
        );
        let info = analyze(&m).unwrap();
        assert!(!info.frameless_eligible);
        assert_eq!(
            info.entry_stacks[2].as_deref(),
            Some(&[ValueKind::WideLow, ValueKind::WideHigh][..])
        );
    }
}
