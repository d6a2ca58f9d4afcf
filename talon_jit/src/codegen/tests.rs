use super::*;
use crate::reloc::RelocKind;
use crate::trap_table::TrapKind;
use talon_core::{ObjectRef, StubLocation, ValueType};

fn stubs() -> StubTable {
    StubTable::new()
        .with(Stub::Invoke, StubLocation::CodeHeap(0x4000))
        .with(Stub::FloatAdd, StubLocation::Native(0x9000))
        .with(Stub::MethodTrap, StubLocation::Native(0x9100))
}

fn method(args: Vec<ValueType>, max_locals: u16, max_stack: u16, code: Vec<Opcode>) -> Arc<MethodDescriptor> {
    Arc::new(MethodDescriptor::new(
        MethodId(1),
        "test",
        args,
        max_locals,
        max_stack,
        code,
    ))
}

fn add_ints() -> Arc<MethodDescriptor> {
    method(
        vec![ValueType::Int, ValueType::Int],
        2,
        2,
        vec![Opcode::ILoad(0), Opcode::ILoad(1), Opcode::IAdd, Opcode::IReturn],
    )
}

fn compile_with(
    arch: Arch,
    config: &JitConfig,
    m: &Arc<MethodDescriptor>,
) -> Result<CompiledMethod, CompileError> {
    let stubs = stubs();
    let ctx = CompileContext::new(arch, config, &stubs);
    compile(m, &ctx).map_err(|failed| failed.reason)
}

fn compile_on(arch: Arch, m: &Arc<MethodDescriptor>) -> Result<CompiledMethod, CompileError> {
    compile_with(arch, &JitConfig::default(), m)
}

fn mnemonics(compiled: &CompiledMethod) -> Vec<String> {
    compiled
        .disassemble()
        .into_iter()
        .map(|line| line.mnemonic)
        .collect()
}

#[test]
fn test_leaf_add_is_frameless_everywhere() {
    for arch in Arch::ALL {
        let compiled = compile_on(arch, &add_ints()).unwrap();
        assert!(compiled.frame_shape().is_none(), "{arch}");
        assert!(compiled.relocations().is_empty(), "{arch}");
    }
}

#[test]
fn test_frameless_falls_back_to_frame() {
    // Without liveness both arguments stay live, and x86 has only two
    // caller-saved registers to compute into.
    let config = JitConfig::default().with_local_liveness(false);
    let compiled = compile_with(Arch::X86, &config, &add_ints()).unwrap();
    assert!(compiled.frame_shape().is_some());
    assert_eq!(mnemonics(&compiled).last().map(String::as_str), Some("ret"));
}

#[test]
fn test_constants_fold() {
    let m = method(
        vec![],
        0,
        2,
        vec![Opcode::IConst(6), Opcode::IConst(7), Opcode::IMul, Opcode::IReturn],
    );
    let compiled = compile_on(Arch::Arm, &m).unwrap();
    // mov r0, #42; bx lr
    assert_eq!(compiled.code(), &[0x2A, 0x00, 0xA0, 0xE3, 0x1E, 0xFF, 0x2F, 0xE1]);
}

#[test]
fn test_invoke_records_code_heap_branch() {
    let m = method(
        vec![],
        0,
        1,
        vec![
            Opcode::InvokeStatic {
                method: MethodId(9),
                arg_slots: 0,
                result: ResultKind::Value(ValueType::Int),
            },
            Opcode::IReturn,
        ],
    );
    for arch in Arch::ALL {
        let compiled = compile_on(arch, &m).unwrap();
        let relocs = compiled.relocations();
        assert_eq!(relocs.len(), 1, "{arch}");
        assert_eq!(
            relocs.entries()[0].kind,
            RelocKind::IntraCodeBranch { target: 0x4000 }
        );
        let isa = isa_for(arch);
        let at = relocs.entries()[0].offset;
        assert_eq!(
            isa.pc_relative(compiled.code(), at as usize),
            Some(0x4000 - at as i64)
        );
    }
}

#[test]
fn test_float_add_calls_native_stub() {
    let m = method(
        vec![],
        0,
        2,
        vec![
            Opcode::FConst(1.5),
            Opcode::FConst(2.0),
            Opcode::FAdd,
            Opcode::FReturn,
        ],
    );
    for arch in Arch::ALL {
        let compiled = compile_on(arch, &m).unwrap();
        assert_eq!(
            compiled
                .relocations()
                .count(|kind| *kind == RelocKind::ExternalStub { stub: Stub::FloatAdd }),
            1,
            "{arch}"
        );
    }
}

#[test]
fn test_forward_branch_syncs_on_taken_path() {
    // if (a == 0) return 0; return a;
    let m = method(
        vec![ValueType::Int],
        1,
        1,
        vec![
            Opcode::ILoad(0),
            Opcode::IfZero(Condition::Eq, 4),
            Opcode::ILoad(0),
            Opcode::IReturn,
            Opcode::IConst(0),
            Opcode::IReturn,
        ],
    );
    for arch in Arch::ALL {
        let compiled = compile_on(arch, &m).unwrap();
        let target = compiled.native_offset(4).unwrap();
        let lines = compiled.disassemble();
        // The argument is stored only on the taken path, after the body.
        let stores: Vec<u32> = lines
            .iter()
            .filter(|line| line.mnemonic == "str" || line.mnemonic == "mov" && line.operands.starts_with('['))
            .map(|line| line.offset)
            .collect();
        assert!(!stores.is_empty(), "{arch}: {lines:?}");
        assert!(stores.iter().all(|&at| at > target), "{arch}");
    }
}

#[test]
fn test_loops_compile_on_every_target() {
    // i = 0; do { i++ } while (i < 10); return i
    let m = method(
        vec![],
        1,
        2,
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
    for arch in Arch::ALL {
        let compiled = compile_on(arch, &m).unwrap();
        assert!(compiled.native_offset(2).is_some());
        assert!(compiled.native_offset(6).unwrap() > compiled.native_offset(5).unwrap());
        assert!(!compiled.disassemble().is_empty());
    }
}

#[test]
fn test_long_arithmetic() {
    let m = method(
        vec![ValueType::Long, ValueType::Long],
        4,
        4,
        vec![
            Opcode::LLoad(0),
            Opcode::LLoad(2),
            Opcode::LAdd,
            Opcode::LConst(1),
            Opcode::LSub,
            Opcode::LReturn,
        ],
    );
    let compiled = compile_on(Arch::Arm, &m).unwrap();
    assert_eq!(
        compiled.relocations().count(|kind| *kind == RelocKind::Literal),
        2
    );
    assert!(mnemonics(&compiled).iter().any(|m| m.starts_with("adc")));

    // Four argument slots only fit in ARM's argument registers.
    assert_eq!(
        compile_on(Arch::Thumb, &m).unwrap_err(),
        CompileError::TooManyArguments { slots: 4, limit: 3 }
    );
    assert_eq!(
        compile_on(Arch::X86, &m).unwrap_err(),
        CompileError::TooManyArguments { slots: 4, limit: 2 }
    );
}

#[test]
fn test_object_constant_is_relocated() {
    let m = method(
        vec![],
        0,
        1,
        vec![Opcode::ObjConst(ObjectRef::from_address(0x2000)), Opcode::AReturn],
    );
    for arch in Arch::ALL {
        let compiled = compile_on(arch, &m).unwrap();
        assert_eq!(compiled.relocations().heap_objects().count(), 1);
        let comments: Vec<String> = compiled
            .disassemble()
            .into_iter()
            .filter_map(|line| line.comment)
            .collect();
        assert_eq!(comments, vec!["obj@0x2000".to_string()], "{arch}");
    }
}

#[test]
fn test_trapped_method_calls_trap_stub() {
    let traps = TrapTable::new(4);
    traps.set_trap(MethodId(1), TrapKind::Breakpoint).unwrap();
    let stubs = stubs();
    let config = JitConfig::default();
    let ctx = CompileContext::new(Arch::Arm, &config, &stubs).with_traps(&traps);
    let compiled = compile(&add_ints(), &ctx).unwrap();
    assert!(compiled.frame_shape().is_some());
    assert_eq!(
        compiled.relocations().entries()[0].kind,
        RelocKind::ExternalStub {
            stub: Stub::MethodTrap
        }
    );
}

#[test]
fn test_resource_limits() {
    let wide = method(vec![], 30, 4, vec![Opcode::Return]);
    assert_eq!(
        compile_on(Arch::Thumb, &wide).unwrap_err(),
        CompileError::FrameTooLarge {
            slots: 34,
            limit: 32
        }
    );

    let invoke = Opcode::InvokeStatic {
        method: MethodId(2),
        arg_slots: 0,
        result: ResultKind::Void,
    };
    let calls = method(vec![], 0, 0, vec![invoke, invoke, invoke, invoke, Opcode::Return]);
    let small = JitConfig::default().with_max_code_size(16);
    assert_eq!(
        compile_with(Arch::X86, &small, &calls).unwrap_err(),
        CompileError::BufferOverflow { limit: 16 }
    );

    let literal = method(vec![], 0, 2, vec![Opcode::LConst(0x1_0000_0002), Opcode::LReturn]);
    let one_literal = JitConfig::default().with_max_pool_entries(1);
    assert_eq!(
        compile_with(Arch::Arm, &one_literal, &literal).unwrap_err(),
        CompileError::LiteralPoolExhausted { limit: 1 }
    );
}

#[test]
fn test_missing_stub() {
    let m = method(
        vec![],
        0,
        0,
        vec![
            Opcode::InvokeStatic {
                method: MethodId(2),
                arg_slots: 0,
                result: ResultKind::Void,
            },
            Opcode::Return,
        ],
    );
    let config = JitConfig::default();
    let empty = StubTable::new();
    let ctx = CompileContext::new(Arch::Arm, &config, &empty);
    let failed = compile(&m, &ctx).unwrap_err();
    assert_eq!(failed.method, MethodId(1));
    assert_eq!(failed.reason, CompileError::MissingStub(Stub::Invoke));
}

#[test]
fn test_swapped_condition() {
    for cond in [
        Condition::Eq,
        Condition::Ne,
        Condition::Lt,
        Condition::Ge,
        Condition::Gt,
        Condition::Le,
    ] {
        for (a, b) in [(1, 2), (2, 1), (3, 3)] {
            assert_eq!(cond.holds(a, b), swapped(cond).holds(b, a));
        }
    }
}
