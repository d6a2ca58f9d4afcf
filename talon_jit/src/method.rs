//! The compiled form of one method.
//!
//! A `CompiledMethod` owns its native code, the relocation table that
//! enumerates every address-bearing position in it, and the metadata the
//! runtime needs to enter it. Code starts out in a private `Vec` assumed to
//! run at the buffer base chosen at compile time; [`install_into`] moves it
//! into executable memory.
//!
//! A method whose length is zero is being discarded; relocation on it is a
//! no-op.
//!
//! [`install_into`]: CompiledMethod::install_into

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use talon_core::{
    AddressDescriber, Bci, CodeAllocator, CodeRegion, MethodDescriptor, ObjectDescriber,
    ObjectMotion,
};
use tracing::trace;

use crate::backend::{Arch, FrameShape, isa_for};
use crate::disasm::{self, DisasmLine};
use crate::error::InstallError;
use crate::reloc::{RelocationTable, apply_code_motion, apply_object_motion};

enum CodeStorage {
    Owned(Vec<u8>),
    Installed(Box<dyn CodeRegion>),
}

impl fmt::Debug for CodeStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodeStorage::Owned(code) => write!(f, "Owned({} bytes)", code.len()),
            CodeStorage::Installed(region) => write!(f, "Installed({:#x})", region.base()),
        }
    }
}

/// Everything the generator hands over for a finished method.
#[derive(Debug)]
pub(crate) struct CompiledParts {
    pub source: Arc<MethodDescriptor>,
    pub arch: Arch,
    pub code: Vec<u8>,
    pub base: usize,
    pub entry_offset: u32,
    pub relocations: RelocationTable,
    pub data_ranges: Vec<Range<u32>>,
    pub bci_map: FxHashMap<Bci, u32>,
    pub frame: Option<FrameShape>,
}

#[derive(Debug)]
pub struct CompiledMethod {
    source: Arc<MethodDescriptor>,
    arch: Arch,
    storage: CodeStorage,
    /// Address the code currently runs at.
    base: usize,
    /// Bytes of live code; zero once discarded.
    length: usize,
    entry_offset: u32,
    relocations: RelocationTable,
    data_ranges: Box<[Range<u32>]>,
    bci_map: FxHashMap<Bci, u32>,
    frame: Option<FrameShape>,
}

impl CompiledMethod {
    pub(crate) fn from_parts(parts: CompiledParts) -> Self {
        Self {
            length: parts.code.len(),
            source: parts.source,
            arch: parts.arch,
            storage: CodeStorage::Owned(parts.code),
            base: parts.base,
            entry_offset: parts.entry_offset,
            relocations: parts.relocations,
            data_ranges: parts.data_ranges.into_boxed_slice(),
            bci_map: parts.bci_map,
            frame: parts.frame,
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    #[inline]
    pub fn source(&self) -> &Arc<MethodDescriptor> {
        &self.source
    }

    #[inline]
    pub fn arch(&self) -> Arch {
        self.arch
    }

    /// Absolute address callers jump to.
    #[inline]
    pub fn entry_address(&self) -> usize {
        self.base + self.entry_offset as usize
    }

    #[inline]
    pub fn base(&self) -> usize {
        self.base
    }

    /// Code length in bytes; zero means the method is being discarded.
    #[inline]
    pub fn length(&self) -> usize {
        self.length
    }

    #[inline]
    pub fn is_discarded(&self) -> bool {
        self.length == 0
    }

    #[inline]
    pub fn is_installed(&self) -> bool {
        matches!(self.storage, CodeStorage::Installed(_))
    }

    pub fn code(&self) -> &[u8] {
        let bytes = match &self.storage {
            CodeStorage::Owned(code) => code.as_slice(),
            CodeStorage::Installed(region) => region.bytes(),
        };
        &bytes[..self.length]
    }

    #[inline]
    pub fn relocations(&self) -> &RelocationTable {
        &self.relocations
    }

    #[inline]
    pub fn data_ranges(&self) -> &[Range<u32>] {
        &self.data_ranges
    }

    /// Native offset of the code for bytecode `bci`.
    pub fn native_offset(&self, bci: Bci) -> Option<u32> {
        self.bci_map.get(&bci).copied()
    }

    /// Machine frame, or `None` for a frameless leaf.
    #[inline]
    pub fn frame_shape(&self) -> Option<&FrameShape> {
        self.frame.as_ref()
    }

    /// Check whether `address` lies inside this method's code.
    pub fn contains(&self, address: usize) -> bool {
        (self.base..self.base + self.length).contains(&address)
    }

    // =========================================================================
    // Relocation
    // =========================================================================

    /// Run `patch` over the live code, opening installed code for writing.
    fn patch_code<R>(&mut self, patch: impl FnOnce(&mut [u8]) -> R) -> Result<R, InstallError> {
        let length = self.length;
        match &mut self.storage {
            CodeStorage::Owned(code) => Ok(patch(&mut code[..length])),
            CodeStorage::Installed(region) => {
                region.make_writable()?;
                let result = patch(&mut region.bytes_mut()[..length]);
                region.make_executable()?;
                Ok(result)
            }
        }
    }

    /// Account for not-yet-installed code having moved by `delta` bytes.
    ///
    /// Re-points every code-heap branch so it still reaches its target;
    /// heap references are left alone. Returns the number of entries patched.
    /// Installed code never moves in place; see [`relocate_into`].
    ///
    /// [`relocate_into`]: CompiledMethod::relocate_into
    pub fn relocate_for_code_motion(&mut self, delta: isize) -> Result<usize, InstallError> {
        if self.is_discarded() {
            return Ok(0);
        }
        let CodeStorage::Owned(code) = &mut self.storage else {
            return Err(InstallError::Installed(self.source.id));
        };
        let old_base = self.base;
        let Some(new_base) = old_base.checked_add_signed(delta) else {
            panic!("code at {old_base:#x} moved by {delta} out of the address space");
        };
        let patched = apply_code_motion(
            isa_for(self.arch),
            &mut code[..self.length],
            &self.relocations,
            old_base,
            new_base,
        )?;
        self.base = new_base;
        trace!(method = %self.source.id, delta, patched, "code motion applied");
        Ok(patched)
    }

    /// Rewrite embedded references to objects the collector moved.
    ///
    /// Runs inside a collection pause: visits each relocation entry once and
    /// does not allocate.
    pub fn relocate_for_object_motion(
        &mut self,
        motion: &dyn ObjectMotion,
    ) -> Result<usize, InstallError> {
        if self.is_discarded() || self.relocations.heap_objects().next().is_none() {
            return Ok(0);
        }
        let isa = isa_for(self.arch);
        let table = std::mem::take(&mut self.relocations);
        let patched = self.patch_code(|code| apply_object_motion(isa, code, &table, motion));
        self.relocations = table;
        patched
    }

    /// Mark the method as being discarded.
    ///
    /// Installed code stays mapped until the method is dropped, since a
    /// thread may still be returning through it.
    pub fn discard(&mut self) {
        self.length = 0;
        if let CodeStorage::Owned(code) = &mut self.storage {
            code.clear();
        }
    }

    // =========================================================================
    // Installation
    // =========================================================================

    /// Move the code into a fresh executable region from `allocator`.
    pub fn install_into(mut self, allocator: &dyn CodeAllocator) -> Result<Self, InstallError> {
        if self.is_discarded() {
            return Err(InstallError::Discarded);
        }
        if self.is_installed() {
            return Err(InstallError::AlreadyInstalled(self.source.id));
        }
        self.relocate_into(allocator)?;
        Ok(self)
    }

    /// Copy the code into a fresh executable region and run it from there.
    ///
    /// Code-heap branches are re-pointed for the new base before the region
    /// is published. On failure the method keeps its old storage and base.
    /// A previous region is released, so no thread may be executing it.
    /// Returns the number of branches patched.
    pub fn relocate_into(&mut self, allocator: &dyn CodeAllocator) -> Result<usize, InstallError> {
        if self.is_discarded() {
            return Err(InstallError::Discarded);
        }
        let mut region = allocator.allocate(self.length)?;
        let new_base = region.base();
        if new_base as u64 + self.length as u64 > 1 << 32 {
            return Err(InstallError::OutsideAddressSpace { base: new_base });
        }
        let mut code = self.code().to_vec();
        let patched = apply_code_motion(
            isa_for(self.arch),
            &mut code,
            &self.relocations,
            self.base,
            new_base,
        )?;
        region.bytes_mut()[..self.length].copy_from_slice(&code);
        region.make_executable()?;
        trace!(
            method = %self.source.id,
            from = format_args!("{:#x}", self.base),
            to = format_args!("{new_base:#x}"),
            patched,
            "code placed"
        );
        self.storage = CodeStorage::Installed(region);
        self.base = new_base;
        Ok(patched)
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    pub fn disassemble(&self) -> Vec<DisasmLine> {
        self.disassemble_with(&AddressDescriber)
    }

    /// Disassemble, naming heap references through `describer`.
    pub fn disassemble_with(&self, describer: &dyn ObjectDescriber) -> Vec<DisasmLine> {
        disasm::disassemble(
            isa_for(self.arch),
            self.code(),
            &self.relocations,
            &self.data_ranges,
            describer,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reloc::{RelocEntry, RelocKind};
    use talon_core::{MethodId, ObjectRef, Opcode};

    fn parts(arch: Arch, code: Vec<u8>, entries: Vec<RelocEntry>) -> CompiledParts {
        CompiledParts {
            source: Arc::new(MethodDescriptor::new(
                MethodId(3),
                "m",
                vec![],
                0,
                1,
                vec![Opcode::Return],
            )),
            arch,
            code,
            base: 0x1000,
            entry_offset: 0,
            relocations: RelocationTable::from_sorted(entries),
            data_ranges: Vec::new(),
            bci_map: FxHashMap::default(),
            frame: None,
        }
    }

    /// `mov eax, 0x2000` with a heap reference, then `ret`.
    fn x86_object_load() -> CompiledMethod {
        CompiledMethod::from_parts(parts(
            Arch::X86,
            vec![0xB8, 0x00, 0x20, 0x00, 0x00, 0xC3],
            vec![RelocEntry {
                offset: 0,
                kind: RelocKind::HeapObject,
            }],
        ))
    }

    #[test]
    fn test_object_motion_patches_embedded_word() {
        let mut method = x86_object_load();
        let motion = |obj: ObjectRef| Some(ObjectRef::from_address(obj.address() + 0x40));
        assert_eq!(method.relocate_for_object_motion(&motion).unwrap(), 1);
        assert_eq!(method.code(), &[0xB8, 0x40, 0x20, 0x00, 0x00, 0xC3]);
        assert_eq!(
            method.disassemble()[0].comment.as_deref(),
            Some("obj@0x2040")
        );
    }

    #[test]
    fn test_unmoved_objects_untouched() {
        let mut method = x86_object_load();
        let before = method.code().to_vec();
        let motion = |_: ObjectRef| None;
        assert_eq!(method.relocate_for_object_motion(&motion).unwrap(), 0);
        assert_eq!(method.code(), before.as_slice());
    }

    #[test]
    fn test_code_motion_repoints_call() {
        // call rel32 to 0x4000 from 0x1000.
        let disp = 0x4000i32 - (0x1000 + 5);
        let mut code = vec![0xE8];
        code.extend_from_slice(&disp.to_le_bytes());
        code.push(0xC3);
        let mut method = CompiledMethod::from_parts(parts(
            Arch::X86,
            code,
            vec![RelocEntry {
                offset: 0,
                kind: RelocKind::IntraCodeBranch { target: 0x4000 },
            }],
        ));
        assert_eq!(method.relocate_for_code_motion(0x100).unwrap(), 1);
        assert_eq!(method.base(), 0x1100);
        let new_disp = i32::from_le_bytes(method.code()[1..5].try_into().unwrap());
        assert_eq!(new_disp, 0x4000 - (0x1100 + 5));
    }

    #[test]
    fn test_discarded_method_ignores_relocation() {
        let mut method = x86_object_load();
        method.discard();
        assert!(method.is_discarded());
        assert_eq!(method.length(), 0);
        let motion = |obj: ObjectRef| Some(obj);
        assert_eq!(method.relocate_for_object_motion(&motion).unwrap(), 0);
        assert_eq!(method.relocate_for_code_motion(64).unwrap(), 0);
        assert_eq!(method.base(), 0x1000);
        assert!(method.disassemble().is_empty());
    }

    #[test]
    #[should_panic(expected = "desynchronized")]
    fn test_stale_entry_is_fatal() {
        let mut method = CompiledMethod::from_parts(parts(
            Arch::X86,
            vec![0xC3],
            vec![RelocEntry {
                offset: 0,
                kind: RelocKind::HeapObject,
            }],
        ));
        let motion = |obj: ObjectRef| Some(obj);
        let _ = method.relocate_for_object_motion(&motion);
    }
}
