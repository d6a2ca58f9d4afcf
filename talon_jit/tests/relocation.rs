//! Relocation after object motion and code motion.

use std::sync::Arc;

use talon_core::{
    MethodDescriptor, MethodId, ObjectRef, Opcode, ResultKind, Stub, StubLocation, StubTable,
    ValueType,
};
use talon_jit::{Arch, CompileContext, CompiledMethod, JitConfig, RelocKind, compile, isa_for};

const OBJECTS: [u32; 3] = [0x0001_0000, 0x0002_4000, 0x0003_0010];
const SHIFT: u32 = 0x80;

fn stubs() -> StubTable {
    StubTable::new().with(Stub::Invoke, StubLocation::CodeHeap(0x0008_0000))
}

fn compile_for(arch: Arch, method: MethodDescriptor, base: usize) -> CompiledMethod {
    let config = JitConfig::default();
    let stubs = stubs();
    let ctx = CompileContext::new(arch, &config, &stubs).with_base(base);
    compile(&Arc::new(method), &ctx).unwrap()
}

/// Loads three objects, calls out once, and returns the last object.
fn object_holder() -> MethodDescriptor {
    let [a, b, c] = OBJECTS.map(ObjectRef::from_address);
    MethodDescriptor::new(
        MethodId(10),
        "holder",
        vec![],
        0,
        1,
        vec![
            Opcode::ObjConst(a),
            Opcode::Pop,
            Opcode::ObjConst(b),
            Opcode::Pop,
            Opcode::InvokeStatic {
                method: MethodId(11),
                arg_slots: 0,
                result: ResultKind::Void,
            },
            Opcode::ObjConst(c),
            Opcode::AReturn,
        ],
    )
}

fn comments(method: &CompiledMethod) -> Vec<String> {
    method
        .disassemble()
        .into_iter()
        .filter_map(|line| line.comment)
        .filter(|comment| comment.starts_with("obj@"))
        .collect()
}

#[test]
fn test_object_motion_round_trip() {
    for arch in Arch::ALL {
        let mut method = compile_for(arch, object_holder(), 0x1000);
        let isa = isa_for(arch);
        let before = method.code().to_vec();
        let words: Vec<usize> = method
            .relocations()
            .heap_objects()
            .map(|offset| isa.embedded_word_at(&before, offset as usize).unwrap())
            .collect();
        assert_eq!(words.len(), OBJECTS.len(), "{arch}");

        let shift = |obj: ObjectRef| Some(ObjectRef::from_address(obj.address() + SHIFT));
        assert_eq!(method.relocate_for_object_motion(&shift).unwrap(), OBJECTS.len());

        let expected: Vec<String> = OBJECTS
            .iter()
            .map(|addr| format!("obj@{:#x}", addr + SHIFT))
            .collect();
        assert_eq!(comments(&method), expected, "{arch}");

        let after = method.code();
        for (at, (old, new)) in before.iter().zip(after).enumerate() {
            let in_word = words.iter().any(|&w| (w..w + 4).contains(&at));
            if !in_word {
                assert_eq!(old, new, "{arch}: byte {at:#x} changed");
            }
        }
    }
}

#[test]
fn test_zero_code_motion_is_identity() {
    for arch in Arch::ALL {
        let mut method = compile_for(arch, object_holder(), 0x1000);
        let before = method.code().to_vec();
        assert_eq!(method.relocate_for_code_motion(0).unwrap(), 1, "{arch}");
        assert_eq!(method.code(), before.as_slice(), "{arch}");
        assert_eq!(method.base(), 0x1000);
    }
}

#[test]
fn test_code_motion_keeps_stub_reachable() {
    for arch in Arch::ALL {
        let mut method = compile_for(arch, object_holder(), 0x1000);
        let isa = isa_for(arch);
        let at = method
            .relocations()
            .entries()
            .iter()
            .find(|e| matches!(e.kind, RelocKind::IntraCodeBranch { .. }))
            .unwrap()
            .offset as usize;
        let original = method.code().to_vec();

        method.relocate_for_code_motion(0x400).unwrap();
        assert_eq!(method.base(), 0x1400);
        let reach = isa.pc_relative(method.code(), at).unwrap();
        assert_eq!(0x1400 + at as i64 + reach, 0x0008_0000, "{arch}");

        method.relocate_for_code_motion(-0x400).unwrap();
        assert_eq!(method.code(), original.as_slice(), "{arch}");
    }
}

#[test]
fn test_object_motion_leaves_literals_alone() {
    let method = MethodDescriptor::new(
        MethodId(12),
        "wide",
        vec![],
        0,
        2,
        vec![Opcode::LConst(0x0001_0000_0002_0000), Opcode::LReturn],
    );
    for arch in Arch::ALL {
        let mut compiled = compile_for(arch, method.clone(), 0);
        let before = compiled.code().to_vec();
        // Literal words look like object addresses; they must not move.
        let shift = |obj: ObjectRef| Some(ObjectRef::from_address(obj.address() + SHIFT));
        assert_eq!(compiled.relocate_for_object_motion(&shift).unwrap(), 0);
        assert_eq!(compiled.code(), before.as_slice(), "{arch}");
    }
}

#[test]
fn test_discarded_method_is_not_relocated() {
    let mut method = compile_for(Arch::Arm, object_holder(), 0x1000);
    method.discard();
    let shift = |obj: ObjectRef| Some(ObjectRef::from_address(obj.address() + SHIFT));
    assert_eq!(method.relocate_for_object_motion(&shift).unwrap(), 0);
    assert_eq!(method.relocate_for_code_motion(0x100).unwrap(), 0);
    assert!(method.code().is_empty());
}

#[test]
fn test_arguments_survive_in_order() {
    // Guard against relocation entries leaking into argument-only code.
    let method = MethodDescriptor::new(
        MethodId(13),
        "first",
        vec![ValueType::Int, ValueType::Int],
        2,
        1,
        vec![Opcode::ILoad(0), Opcode::IReturn],
    );
    for arch in Arch::ALL {
        assert!(compile_for(arch, method.clone(), 0).relocations().is_empty());
    }
}
