//! Stack-oriented bytecode as seen by the compiler.
//!
//! The class-file parser resolves constant-pool indices before handing a
//! method over, so constants and call targets appear inline in each
//! instruction. Branch targets are instruction indices (`Bci`), not byte
//! offsets.

use std::fmt;

use crate::method::{MethodId, ValueType};
use crate::object::ObjectRef;

/// Index of an instruction within a method's code.
pub type Bci = u32;

// =============================================================================
// Conditions
// =============================================================================

/// Integer comparison used by conditional branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Condition {
    Eq,
    Ne,
    Lt,
    Ge,
    Gt,
    Le,
}

impl Condition {
    /// Get the condition that holds exactly when `self` does not.
    #[inline]
    pub const fn invert(self) -> Self {
        match self {
            Condition::Eq => Condition::Ne,
            Condition::Ne => Condition::Eq,
            Condition::Lt => Condition::Ge,
            Condition::Ge => Condition::Lt,
            Condition::Gt => Condition::Le,
            Condition::Le => Condition::Gt,
        }
    }

    /// Evaluate the condition on two integers.
    #[inline]
    pub const fn holds(self, lhs: i32, rhs: i32) -> bool {
        match self {
            Condition::Eq => lhs == rhs,
            Condition::Ne => lhs != rhs,
            Condition::Lt => lhs < rhs,
            Condition::Ge => lhs >= rhs,
            Condition::Gt => lhs > rhs,
            Condition::Le => lhs <= rhs,
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Condition::Eq => "eq",
            Condition::Ne => "ne",
            Condition::Lt => "lt",
            Condition::Ge => "ge",
            Condition::Gt => "gt",
            Condition::Le => "le",
        };
        f.write_str(s)
    }
}

// =============================================================================
// Opcodes
// =============================================================================

/// What an invoked method leaves on the caller's operand stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    Void,
    Value(ValueType),
}

impl ResultKind {
    /// Number of operand-stack slots the result occupies.
    #[inline]
    pub const fn slots(self) -> u16 {
        match self {
            ResultKind::Void => 0,
            ResultKind::Value(ty) => ty.slots(),
        }
    }
}

/// A single bytecode instruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Opcode {
    Nop,

    // Constants
    IConst(i32),
    LConst(i64),
    FConst(f32),
    /// Push a resolved heap reference (string literal, class mirror).
    ObjConst(ObjectRef),

    // Locals
    ILoad(u16),
    IStore(u16),
    LLoad(u16),
    LStore(u16),
    FLoad(u16),
    FStore(u16),
    ALoad(u16),
    AStore(u16),
    /// Add a signed constant to an int local in place.
    IInc(u16, i16),

    // Arithmetic
    IAdd,
    ISub,
    IMul,
    IAnd,
    IOr,
    IXor,
    LAdd,
    LSub,
    FAdd,

    // Stack manipulation
    Dup,
    Pop,
    Swap,

    // Control flow
    /// Compare the top of stack against zero.
    IfZero(Condition, Bci),
    /// Compare the two topmost ints (`value1 cond value2`).
    IfICmp(Condition, Bci),
    Goto(Bci),
    InvokeStatic {
        method: MethodId,
        arg_slots: u16,
        result: ResultKind,
    },

    // Returns
    IReturn,
    LReturn,
    FReturn,
    AReturn,
    Return,
}

impl Opcode {
    /// Get the branch target of a control-flow instruction.
    #[inline]
    pub const fn branch_target(&self) -> Option<Bci> {
        match *self {
            Opcode::IfZero(_, target) | Opcode::IfICmp(_, target) | Opcode::Goto(target) => {
                Some(target)
            }
            _ => None,
        }
    }

    /// Check whether control never falls through to the next instruction.
    #[inline]
    pub const fn ends_block(&self) -> bool {
        matches!(
            self,
            Opcode::Goto(_)
                | Opcode::IReturn
                | Opcode::LReturn
                | Opcode::FReturn
                | Opcode::AReturn
                | Opcode::Return
        )
    }
}
