//! Diagnostic disassembly of compiled code.
//!
//! Instructions are decoded by the method's backend; literal-pool islands
//! are printed as data. Every instruction with a relocation entry carries
//! a comment naming what the embedded address denotes.

use std::fmt;
use std::ops::Range;

use talon_core::{ObjectDescriber, ObjectRef};

use crate::backend::{TargetIsa, read_u16};
use crate::reloc::{RelocKind, RelocationTable, embedded_word, read_word};

/// One line of disassembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisasmLine {
    pub offset: u32,
    pub mnemonic: String,
    pub operands: String,
    pub comment: Option<String>,
}

impl fmt::Display for DisasmLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}  {:<8}", self.offset, self.mnemonic)?;
        if !self.operands.is_empty() {
            write!(f, " {}", self.operands)?;
        }
        if let Some(comment) = &self.comment {
            write!(f, "  ; {comment}")?;
        }
        Ok(())
    }
}

fn data_line(code: &[u8], at: usize, end: usize) -> (DisasmLine, usize) {
    let (mnemonic, operands, len) = if end - at >= 4 && at % 4 == 0 {
        (".word", format!("{:#010x}", read_word(code, at)), 4)
    } else {
        let half = read_u16(code, at).unwrap_or_default();
        (".short", format!("{half:#06x}"), 2)
    };
    let line = DisasmLine {
        offset: at as u32,
        mnemonic: mnemonic.to_string(),
        operands,
        comment: None,
    };
    (line, len)
}

fn relocation_comment(
    isa: &dyn TargetIsa,
    code: &[u8],
    table: &RelocationTable,
    at: usize,
    describer: &dyn ObjectDescriber,
) -> Option<String> {
    let entry = table.entry_at(at as u32)?;
    Some(match entry.kind {
        RelocKind::HeapObject => {
            let word = read_word(code, embedded_word(isa, code, entry));
            describer.describe(ObjectRef::from_address(word))
        }
        RelocKind::Literal => {
            let word = read_word(code, embedded_word(isa, code, entry));
            format!("literal {word:#x}")
        }
        RelocKind::IntraCodeBranch { target } => format!("code heap {target:#x}"),
        RelocKind::ExternalStub { stub } => format!("stub {stub}"),
    })
}

/// Disassemble `code`.
///
/// Panics on bytes outside a data range that do not decode: the compiler
/// emitted something its own decoder does not know.
pub fn disassemble(
    isa: &dyn TargetIsa,
    code: &[u8],
    relocations: &RelocationTable,
    data_ranges: &[Range<u32>],
    describer: &dyn ObjectDescriber,
) -> Vec<DisasmLine> {
    let mut lines = Vec::new();
    let mut at = 0;
    while at < code.len() {
        if let Some(range) = data_ranges.iter().find(|r| r.contains(&(at as u32))) {
            let (line, len) = data_line(code, at, range.end as usize);
            lines.push(line);
            at += len;
            continue;
        }
        let Some(decoded) = isa.decode_at(code, at) else {
            panic!("undecodable instruction at {at:#x} for {}", isa.arch());
        };
        let comment = relocation_comment(isa, code, relocations, at, describer);
        lines.push(DisasmLine {
            offset: at as u32,
            mnemonic: decoded.mnemonic,
            operands: decoded.operands,
            comment,
        });
        at += decoded.len;
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Arch, isa_for};
    use crate::reloc::RelocEntry;
    use talon_core::AddressDescriber;

    #[test]
    fn test_line_format() {
        let line = DisasmLine {
            offset: 8,
            mnemonic: "ldr".into(),
            operands: "r0, [pc, #4]".into(),
            comment: Some("obj@0x40".into()),
        };
        assert_eq!(line.to_string(), "0008  ldr      r0, [pc, #4]  ; obj@0x40");
    }

    #[test]
    fn test_pool_words_render_as_data() {
        let isa = isa_for(Arch::Arm);
        // ldr r0, [pc, #-4]; .word 0x1234
        let mut code = 0xE51F_0004u32.to_le_bytes().to_vec();
        code.extend_from_slice(&0x1234u32.to_le_bytes());
        let table = RelocationTable::from_sorted(vec![RelocEntry {
            offset: 0,
            kind: RelocKind::HeapObject,
        }]);
        let lines = disassemble(isa, &code, &table, &[4..8], &AddressDescriber);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].mnemonic, "ldr");
        assert_eq!(lines[0].comment.as_deref(), Some("obj@0x1234"));
        assert_eq!(lines[1].mnemonic, ".word");
        assert_eq!(lines[1].operands, "0x00001234");
    }

    #[test]
    #[should_panic(expected = "undecodable instruction")]
    fn test_garbage_panics() {
        let isa = isa_for(Arch::X86);
        disassemble(
            isa,
            &[0x0F, 0x0B],
            &RelocationTable::default(),
            &[],
            &AddressDescriber,
        );
    }
}
