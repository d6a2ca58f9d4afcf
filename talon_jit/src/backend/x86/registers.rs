//! IA-32 register file and JIT register conventions.
//!
//! ```text
//! eax, ecx   arguments / results, allocatable
//! edx        scratch (literal calls, two-operand lowering)
//! ebx, ebp   callee-saved, allocatable
//! esp        machine stack pointer and frame base (local 0)
//! esi        Java stack pointer
//! edi        interpreter state
//! ```

use crate::backend::{Reg, RegRoles, RegisterInfo};

pub const EAX: Reg = Reg(0);
pub const ECX: Reg = Reg(1);
pub const EDX: Reg = Reg(2);
pub const EBX: Reg = Reg(3);
pub const ESP: Reg = Reg(4);
pub const EBP: Reg = Reg(5);
pub const ESI: Reg = Reg(6);
pub const EDI: Reg = Reg(7);

const ARG: RegRoles = RegRoles::ARGUMENT.union(RegRoles::ALLOCATABLE);

pub static REGISTERS: [RegisterInfo; 8] = [
    RegisterInfo::new(0, "eax", ARG),
    RegisterInfo::new(1, "ecx", ARG),
    RegisterInfo::new(2, "edx", RegRoles::SCRATCH),
    RegisterInfo::new(
        3,
        "ebx",
        RegRoles::CALLEE_SAVED.union(RegRoles::ALLOCATABLE),
    ),
    RegisterInfo::new(
        4,
        "esp",
        RegRoles::STACK_POINTER.union(RegRoles::FRAME_POINTER),
    ),
    RegisterInfo::new(
        5,
        "ebp",
        RegRoles::CALLEE_SAVED.union(RegRoles::ALLOCATABLE),
    ),
    RegisterInfo::new(
        6,
        "esi",
        RegRoles::JAVA_STACK_POINTER.union(RegRoles::CALLEE_SAVED),
    ),
    RegisterInfo::new(
        7,
        "edi",
        RegRoles::INTERPRETER.union(RegRoles::CALLEE_SAVED),
    ),
];

#[inline]
pub fn name(reg: Reg) -> &'static str {
    REGISTERS
        .get(reg.0 as usize)
        .map_or("?", |info| info.name)
}

/// Low three bits used in ModR/M, SIB and `+r` opcodes.
#[inline]
pub fn low_bits(reg: Reg) -> u8 {
    assert!(reg.0 < 8, "r{} is not an IA-32 register", reg.0);
    reg.0
}

/// `esp` as a base always needs a SIB byte.
#[inline]
pub const fn needs_sib_as_base(reg: Reg) -> bool {
    reg.0 == ESP.0
}

/// `ebp` as a base cannot use the no-displacement form.
#[inline]
pub const fn needs_displacement(reg: Reg) -> bool {
    reg.0 == EBP.0
}
