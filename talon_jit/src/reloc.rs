//! Relocation table for compiled methods.
//!
//! The table enumerates every position in a method's code that encodes a
//! heap address or a code-heap address. The collector and the code
//! compactor only ever walk this table; they never scan instructions.
//!
//! # Entry kinds
//! ```text
//! HeapObject        instruction loads/embeds an object address   (object motion)
//! Literal           instruction loads half of a wide constant    (diagnostic only)
//! IntraCodeBranch   PC-relative call into the code heap          (code motion)
//! ExternalStub      instruction loads a native stub address      (diagnostic only)
//! ```
//!
//! Each patch re-validates the instruction at the recorded offset and
//! panics if it does not have the expected shape: a table that has drifted
//! from its code must not be allowed to scribble over executable memory.

use talon_core::{ObjectMotion, ObjectRef, Stub};

use crate::backend::TargetIsa;
use crate::error::InstallError;

// =============================================================================
// Entries
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    HeapObject,
    Literal,
    /// PC-relative branch or call to a fixed address in the code heap
    /// outside this method.
    IntraCodeBranch { target: u32 },
    ExternalStub { stub: Stub },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocEntry {
    /// Offset of the instruction the entry describes.
    pub offset: u32,
    pub kind: RelocKind,
}

/// Sorted, immutable set of relocation entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelocationTable {
    entries: Box<[RelocEntry]>,
}

impl RelocationTable {
    /// Build a table from entries already sorted by offset.
    pub fn from_sorted(entries: Vec<RelocEntry>) -> Self {
        assert!(
            entries.windows(2).all(|pair| pair[0].offset < pair[1].offset),
            "relocation entries out of order"
        );
        Self {
            entries: entries.into_boxed_slice(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn entries(&self) -> &[RelocEntry] {
        &self.entries
    }

    /// Find the entry for the instruction at `offset`.
    pub fn entry_at(&self, offset: u32) -> Option<&RelocEntry> {
        self.entries
            .binary_search_by_key(&offset, |entry| entry.offset)
            .ok()
            .map(|idx| &self.entries[idx])
    }

    pub fn count(&self, pred: impl Fn(&RelocKind) -> bool) -> usize {
        self.entries.iter().filter(|entry| pred(&entry.kind)).count()
    }

    /// Iterate over the offsets of heap-object entries.
    pub fn heap_objects(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries
            .iter()
            .filter(|entry| entry.kind == RelocKind::HeapObject)
            .map(|entry| entry.offset)
    }
}

// =============================================================================
// Patching
// =============================================================================

#[inline]
pub(crate) fn read_word(code: &[u8], at: usize) -> u32 {
    let bytes: [u8; 4] = match code.get(at..at + 4) {
        Some(bytes) => [bytes[0], bytes[1], bytes[2], bytes[3]],
        None => panic!("embedded word at {at:#x} lies outside the code"),
    };
    u32::from_le_bytes(bytes)
}

#[inline]
pub(crate) fn write_word(code: &mut [u8], at: usize, value: u32) {
    code[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

/// Locate the word a heap-object or literal entry refers to.
pub(crate) fn embedded_word(isa: &dyn TargetIsa, code: &[u8], entry: &RelocEntry) -> usize {
    match isa.embedded_word_at(code, entry.offset as usize) {
        Some(at) => at,
        None => panic!(
            "relocation table desynchronized: no embedded word at {:#x} ({:?})",
            entry.offset, entry.kind
        ),
    }
}

/// Rewrite every heap-object address the collector moved.
///
/// Runs inside a collection pause: no allocation, one visit per entry.
pub(crate) fn apply_object_motion(
    isa: &dyn TargetIsa,
    code: &mut [u8],
    table: &RelocationTable,
    motion: &dyn ObjectMotion,
) -> usize {
    let mut patched = 0;
    for entry in table.entries() {
        if entry.kind != RelocKind::HeapObject {
            continue;
        }
        let at = embedded_word(isa, code, entry);
        let old = ObjectRef::from_address(read_word(code, at));
        if let Some(new) = motion.forwarded(old) {
            write_word(code, at, new.address());
            patched += 1;
        }
    }
    patched
}

/// `(offset, target)` of every code-heap branch.
fn code_heap_branches(table: &RelocationTable) -> impl Iterator<Item = (u32, u32)> + '_ {
    table.entries().iter().filter_map(|entry| match entry.kind {
        RelocKind::IntraCodeBranch { target } => Some((entry.offset, target)),
        _ => None,
    })
}

/// Re-point code-heap branches after the method moved from `old_base` to
/// `new_base`. Targets stay where they are, so each displacement shifts by
/// the negated motion.
///
/// Every entry is checked before any is written: a branch the new placement
/// cannot reach fails the whole move and leaves `code` untouched.
pub(crate) fn apply_code_motion(
    isa: &dyn TargetIsa,
    code: &mut [u8],
    table: &RelocationTable,
    old_base: usize,
    new_base: usize,
) -> Result<usize, InstallError> {
    let delta = new_base as i64 - old_base as i64;

    for (offset, target) in code_heap_branches(table) {
        let at = offset as usize;
        let Some(current) = isa.pc_relative(code, at) else {
            panic!("relocation table desynchronized: no branch at {at:#x}");
        };
        let expected = target as i64 - (old_base + at) as i64;
        assert_eq!(
            current, expected,
            "relocation table desynchronized: branch at {at:#x} does not reach {target:#x}"
        );
        if !isa.pc_relative_fits(code, at, current - delta) {
            return Err(InstallError::OutOfReach {
                offset,
                target,
                base: new_base,
            });
        }
    }

    let mut patched = 0;
    for (offset, target) in code_heap_branches(table) {
        if delta != 0 {
            let at = offset as usize;
            isa.set_pc_relative(code, at, target as i64 - (new_base + at) as i64);
        }
        patched += 1;
    }
    Ok(patched)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RelocationTable {
        RelocationTable::from_sorted(vec![
            RelocEntry {
                offset: 4,
                kind: RelocKind::HeapObject,
            },
            RelocEntry {
                offset: 12,
                kind: RelocKind::IntraCodeBranch { target: 0x4000 },
            },
            RelocEntry {
                offset: 20,
                kind: RelocKind::HeapObject,
            },
        ])
    }

    #[test]
    fn test_entry_lookup() {
        let table = table();
        assert_eq!(table.len(), 3);
        assert_eq!(
            table.entry_at(12).map(|e| e.kind),
            Some(RelocKind::IntraCodeBranch { target: 0x4000 })
        );
        assert!(table.entry_at(8).is_none());
        assert_eq!(table.heap_objects().collect::<Vec<_>>(), vec![4, 20]);
        assert_eq!(table.count(|kind| *kind == RelocKind::HeapObject), 2);
    }

    #[test]
    #[should_panic(expected = "out of order")]
    fn test_unsorted_rejected() {
        RelocationTable::from_sorted(vec![
            RelocEntry {
                offset: 8,
                kind: RelocKind::Literal,
            },
            RelocEntry {
                offset: 8,
                kind: RelocKind::Literal,
            },
        ]);
    }

    #[test]
    fn test_word_access() {
        let mut code = vec![0u8; 8];
        write_word(&mut code, 4, 0xdead_beef);
        assert_eq!(read_word(&code, 4), 0xdead_beef);
        assert_eq!(&code[..4], &[0, 0, 0, 0]);
    }
}
