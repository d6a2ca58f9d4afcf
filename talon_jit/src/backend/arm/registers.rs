//! A32 register file and JIT register conventions.
//!
//! ```text
//! r0-r3   arguments / results, allocatable
//! r4-r7   callee-saved, allocatable
//! r8      interpreter dispatch table
//! r9      Java stack pointer (top committed operand slot)
//! r10     interpreter bytecode pointer
//! r11     frame pointer (local 0)
//! r12     scratch (ip)
//! r13-15  sp, lr, pc
//! ```

use crate::backend::{Reg, RegRoles, RegisterInfo};

pub const R0: Reg = Reg(0);
pub const R1: Reg = Reg(1);
pub const JSP: Reg = Reg(9);
pub const FP: Reg = Reg(11);
pub const IP: Reg = Reg(12);
pub const SP: Reg = Reg(13);
pub const LR: Reg = Reg(14);
pub const PC: Reg = Reg(15);

const ARG: RegRoles = RegRoles::ARGUMENT.union(RegRoles::ALLOCATABLE);
const SAVED: RegRoles = RegRoles::CALLEE_SAVED.union(RegRoles::ALLOCATABLE);

pub static REGISTERS: [RegisterInfo; 16] = [
    RegisterInfo::new(0, "r0", ARG),
    RegisterInfo::new(1, "r1", ARG),
    RegisterInfo::new(2, "r2", ARG),
    RegisterInfo::new(3, "r3", ARG),
    RegisterInfo::new(4, "r4", SAVED),
    RegisterInfo::new(5, "r5", SAVED),
    RegisterInfo::new(6, "r6", SAVED),
    RegisterInfo::new(7, "r7", SAVED),
    RegisterInfo::new(8, "r8", RegRoles::INTERPRETER),
    RegisterInfo::new(
        9,
        "r9",
        RegRoles::JAVA_STACK_POINTER.union(RegRoles::CALLEE_SAVED),
    ),
    RegisterInfo::new(10, "r10", RegRoles::INTERPRETER),
    RegisterInfo::new(
        11,
        "fp",
        RegRoles::FRAME_POINTER.union(RegRoles::CALLEE_SAVED),
    ),
    RegisterInfo::new(12, "ip", RegRoles::SCRATCH),
    RegisterInfo::new(13, "sp", RegRoles::STACK_POINTER),
    RegisterInfo::new(14, "lr", RegRoles::LINK),
    RegisterInfo::new(15, "pc", RegRoles::PROGRAM_COUNTER),
];

/// Registers pushed by a framed prologue, excluding `lr`.
pub const SAVED_MASK: u16 = 0b0000_1010_1111_0000;

#[inline]
pub fn name(reg: Reg) -> &'static str {
    REGISTERS
        .get(reg.0 as usize)
        .map_or("?", |info| info.name)
}

/// Render a register list such as `{r4, r5, fp, lr}`.
pub fn list(mask: u16) -> String {
    let names: Vec<&str> = (0..16u8)
        .filter(|n| mask & (1 << n) != 0)
        .map(|n| name(Reg(n)))
        .collect();
    format!("{{{}}}", names.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saved_mask_matches_roles() {
        let saved: u16 = REGISTERS
            .iter()
            .filter(|info| info.roles.contains(RegRoles::CALLEE_SAVED))
            .fold(0, |acc, info| acc | (1 << info.reg.0));
        assert_eq!(saved, SAVED_MASK);
    }

    #[test]
    fn test_list() {
        assert_eq!(list(SAVED_MASK | (1 << 14)), "{r4, r5, r6, r7, r9, fp, lr}");
    }
}
