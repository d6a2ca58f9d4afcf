//! Contracts shared between the Talon VM and its method JIT.
//!
//! This crate provides:
//! - The read-only bytecode/method model handed to the compiler
//! - Opaque heap references and the object-motion query used during GC
//! - Runtime stub addresses the generated code calls into
//! - The executable-memory allocator contract

pub mod alloc;
pub mod bytecode;
pub mod method;
pub mod object;
pub mod stubs;

pub use alloc::{CodeAllocator, CodeRegion};
pub use bytecode::{Bci, Condition, Opcode, ResultKind};
pub use method::{ExceptionRange, MethodDescriptor, MethodId, ValueType};
pub use object::{AddressDescriber, ObjectDescriber, ObjectMotion, ObjectRef};
pub use stubs::{Stub, StubLocation, StubTable};
