//! Error types for compilation, installation and trap management.
//!
//! Only recoverable conditions are represented here. A relocation entry that
//! no longer matches the instruction it describes, or a frame whose real
//! stack pointer has overtaken the virtual one, means the compiler itself is
//! broken; those paths panic instead of returning.

use std::io;

use talon_core::{Bci, MethodId, Stub};
use thiserror::Error;

/// Why a single method could not be compiled.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("code buffer would exceed {limit} bytes")]
    BufferOverflow { limit: usize },

    #[error("literal pool would exceed {limit} entries")]
    LiteralPoolExhausted { limit: usize },

    #[error("no free register and no spill candidate")]
    RegistersExhausted,

    #[error("frame needs {slots} slots but the target addresses at most {limit}")]
    FrameTooLarge { slots: u32, limit: u16 },

    #[error("method takes {slots} argument slots but only {limit} are passed in registers")]
    TooManyArguments { slots: u16, limit: usize },

    #[error("runtime stub `{0}` is not registered")]
    MissingStub(Stub),

    #[error("malformed bytecode at {bci}: {reason}")]
    MalformedBytecode { bci: Bci, reason: &'static str },
}

impl CompileError {
    /// Check whether the failure is a resource limit rather than bad input.
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(
            self,
            CompileError::BufferOverflow { .. }
                | CompileError::LiteralPoolExhausted { .. }
                | CompileError::RegistersExhausted
                | CompileError::FrameTooLarge { .. }
                | CompileError::TooManyArguments { .. }
        )
    }
}

/// Returned by `compile`; the method keeps running in the interpreter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("compilation of {method} failed: {reason}")]
pub struct CompilationFailed {
    pub method: MethodId,
    #[source]
    pub reason: CompileError,
}

/// Failure to publish a compiled method.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("executable memory: {0}")]
    Memory(#[from] io::Error),

    #[error("code cache full: {used} of {capacity} bytes in use, {requested} requested")]
    CacheFull {
        used: usize,
        capacity: usize,
        requested: usize,
    },

    #[error("{0} is already installed")]
    AlreadyInstalled(MethodId),

    #[error("{0} is not installed")]
    NotInstalled(MethodId),

    #[error("compiled method has been discarded")]
    Discarded,

    #[error("branch at {offset:#x} cannot reach {target:#x} from code at {base:#x}")]
    OutOfReach { offset: u32, target: u32, base: usize },

    #[error("code region at {base:#x} lies outside the 32-bit code address space")]
    OutsideAddressSpace { base: usize },

    #[error("{0} is installed; move it through the code cache")]
    Installed(MethodId),
}

/// Failure to register a method trap.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrapError {
    #[error("trap table full ({capacity} entries)")]
    TableFull { capacity: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_exhaustion_classification() {
        assert!(CompileError::BufferOverflow { limit: 16 }.is_resource_exhaustion());
        assert!(CompileError::RegistersExhausted.is_resource_exhaustion());
        assert!(!CompileError::MissingStub(Stub::Invoke).is_resource_exhaustion());
        assert!(
            !CompileError::MalformedBytecode {
                bci: 3,
                reason: "stack underflow"
            }
            .is_resource_exhaustion()
        );
    }

    #[test]
    fn test_compilation_failed_message() {
        let err = CompilationFailed {
            method: MethodId(7),
            reason: CompileError::BufferOverflow { limit: 256 },
        };
        assert_eq!(
            err.to_string(),
            "compilation of m7 failed: code buffer would exceed 256 bytes"
        );
    }
}
