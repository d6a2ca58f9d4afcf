//! Per-method metadata supplied by the class loader.

use std::fmt;

use crate::bytecode::{Bci, Opcode};

/// Identifier of a method, unique for the lifetime of its class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(pub u32);

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// Type of a value held in locals or on the operand stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Int,
    Float,
    Reference,
    Long,
}

impl ValueType {
    /// Number of 32-bit slots the value occupies.
    #[inline]
    pub const fn slots(self) -> u16 {
        match self {
            ValueType::Long => 2,
            _ => 1,
        }
    }
}

/// A protected bytecode range and the handler that covers it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionRange {
    pub start: Bci,
    pub end: Bci,
    pub handler: Bci,
}

/// Read-only view of a method handed to the compiler.
#[derive(Debug, Clone)]
pub struct MethodDescriptor {
    pub id: MethodId,
    pub name: String,
    /// Argument types in declaration order; they occupy the first locals.
    pub args: Vec<ValueType>,
    pub max_locals: u16,
    pub max_stack: u16,
    pub code: Vec<Opcode>,
    pub handlers: Vec<ExceptionRange>,
}

impl MethodDescriptor {
    /// Create a descriptor with no exception handlers.
    pub fn new(
        id: MethodId,
        name: impl Into<String>,
        args: Vec<ValueType>,
        max_locals: u16,
        max_stack: u16,
        code: Vec<Opcode>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            args,
            max_locals,
            max_stack,
            code,
            handlers: Vec::new(),
        }
    }

    /// Attach exception handler ranges.
    pub fn with_handlers(mut self, handlers: Vec<ExceptionRange>) -> Self {
        self.handlers = handlers;
        self
    }

    /// Number of local slots occupied by the arguments.
    pub fn arg_slots(&self) -> u16 {
        self.args.iter().map(|ty| ty.slots()).sum()
    }
}
