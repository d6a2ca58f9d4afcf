//! Method JIT for the Talon VM.
//!
//! Single-pass compiler from stack bytecode to native code with:
//! - ARM, Thumb and x86 backends behind one `TargetIsa` trait
//! - A virtual stack frame that defers stores until control flow demands them
//! - Literal pools placed before they fall out of reach
//! - Relocation tables kept in step with the code for GC and code motion
//! - Installation into W^X executable memory
#![deny(unsafe_op_in_unsafe_fn)]
pub mod assembler;
pub mod backend;
pub mod codegen;
pub mod config;
pub mod disasm;
pub mod error;
pub mod frame;
pub mod install;
pub mod method;
pub mod reloc;
pub mod trap_table;

pub use backend::{Arch, TargetIsa, isa_for};
pub use codegen::{CompileContext, compile};
pub use config::JitConfig;
pub use disasm::DisasmLine;
pub use error::{CompilationFailed, CompileError, InstallError, TrapError};
pub use install::{CodeCache, CodeCacheStats};
#[cfg(unix)]
pub use install::{MmapAllocator, MmapRegion};
pub use method::CompiledMethod;
pub use reloc::{RelocEntry, RelocKind, RelocationTable};
pub use trap_table::{Trap, TrapHandle, TrapKind, TrapTable};
