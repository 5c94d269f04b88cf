//! Binary introspection for the observed executable.
//!
//! The [`Introspector`] combines the ELF image, the embedded line table
//! and the instruction scanner into one read-only surface:
//!
//! - PC -> (file, line, function) resolution for the event assembler
//! - probe offsets: post-prologue entry points, return instructions, and
//!   per-source-line offsets across a whole package
//! - global symbol addresses for the kernel side
//! - the per-function descriptor table
//!
//! Construction fails on any binary this tool cannot faithfully describe:
//! a missing section, an unsupported line-table version, an instruction
//! the scanner does not know. There is no degraded mode; a wrong offset
//! attaches a probe into the middle of an instruction.

pub mod elf;
pub mod functab;
pub mod linetable;
pub mod scanner;

use std::collections::BTreeMap;
use std::path::Path;

use goscope_common::FunctionDescriptor;
use log::debug;

use crate::assemble::{ResolvePc, ResolvedPc};
use crate::domain::IntrospectError;
use elf::Image;
use linetable::{LineTable, Resolution};

/// Per-function instrumentation offsets, keyed by qualified symbol name.
pub type PackageOffsets = BTreeMap<String, Vec<u64>>;

pub struct Introspector {
    image: Image,
    line_table: LineTable,
}

impl Introspector {
    /// Open and index the target executable. The result is immutable and
    /// safe to share across threads for the lifetime of the tool.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, IntrospectError> {
        let mut image = Image::open(path)?;
        let line_table = LineTable::parse(std::mem::take(&mut image.line_table.data))?;
        debug!(
            "indexed target: {} functions, {} symbols",
            line_table.func_count(),
            image.symbols.len()
        );
        Ok(Self { image, line_table })
    }

    #[cfg(test)]
    pub(crate) fn from_parts(image: Image, line_table: LineTable) -> Self {
        Self { image, line_table }
    }

    /// Resolve a PC through the line table. `None` when the PC is outside
    /// any function.
    pub fn pc_to_line(&self, pc: u64) -> Option<Resolution> {
        self.line_table.pc_to_line(pc)
    }

    /// First PC of a (file, line) pair, with the containing function's
    /// name. `None` when the line has no code.
    pub fn line_to_pc(&self, file: &str, line: i32) -> Option<(u64, String)> {
        self.line_table.line_to_pc(file, line)
    }

    /// Address of a named global. The name must exist; the caller is
    /// wiring it into a kernel-side program and has no fallback.
    pub fn address_of_global(&self, name: &str) -> Result<u64, IntrospectError> {
        self.image
            .symbol_named(name)
            .map(|sym| sym.address)
            .ok_or_else(|| IntrospectError::MissingSymbol(name.to_string()))
    }

    /// Byte offset, from the function's entry, of the first instruction
    /// after the stack-growth prologue.
    pub fn function_start_offset(&self, symbol: &str) -> Result<u64, IntrospectError> {
        let code = self.image.function_bytes(symbol)?;
        scanner::post_prologue_offset(&code)
            .map_err(|source| IntrospectError::Scan { symbol: symbol.to_string(), source })?
            .ok_or_else(|| IntrospectError::PrologueNotFound { symbol: symbol.to_string() })
    }

    /// Offsets of every return instruction in the function. Empty for
    /// functions that never return normally.
    pub fn function_return_offsets(&self, symbol: &str) -> Result<Vec<u64>, IntrospectError> {
        let code = self.image.function_bytes(symbol)?;
        scanner::return_offsets(&code)
            .map_err(|source| IntrospectError::Scan { symbol: symbol.to_string(), source })
    }

    /// Name of the symbol covering `address`, or `None` when the address
    /// is not backed by the image (a stack or heap location).
    pub fn symbol_by_address(&self, address: u64) -> Option<&str> {
        self.image.symbol_by_address(address)
    }

    /// Per-source-line instrumentation offsets for every function whose
    /// qualified name lives in `pkg`.
    ///
    /// The first offset of each function skips the prologue; further
    /// offsets come from enumerating the line numbers spanned by the
    /// function body and keeping those that map back into it. Lines with
    /// no code are skipped.
    pub fn instrumentable_offsets_in_package(
        &self,
        pkg: &str,
    ) -> Result<PackageOffsets, IntrospectError> {
        let prefix = format!("{pkg}.");
        let mut out = PackageOffsets::new();
        for func in self.line_table.funcs() {
            if !func.name.starts_with(&prefix) {
                continue;
            }
            let Some(entry_res) = self.line_table.pc_to_line(func.entry) else {
                continue;
            };
            let start_line = entry_res.line;
            let file = entry_res.file;

            // The function index gives the next function's entry as our
            // end, so the last line is found by probing every PC of the
            // body rather than trusting the boundary.
            let mut end_line = start_line;
            for pc in func.entry..func.end {
                if let Some(res) = self.line_table.pc_to_line(pc) {
                    if res.func == func.name && res.file == file {
                        end_line = end_line.max(res.line);
                    }
                }
            }

            let mut offsets = vec![self.function_start_offset(&func.name)?];
            for line in start_line + 1..=end_line {
                let Some((pc, owner)) = self.line_table.line_to_pc(&file, line) else {
                    continue;
                };
                if owner != func.name {
                    continue;
                }
                let offset = pc - func.entry;
                if !offsets.contains(&offset) {
                    offsets.push(offset);
                }
            }
            out.insert(func.name, offsets);
        }
        Ok(out)
    }

    /// One descriptor per function in compiler emission order, for the
    /// kernel-side lookup table.
    pub fn function_descriptor_table(&self) -> Result<Vec<FunctionDescriptor>, IntrospectError> {
        functab::function_descriptor_table(&self.line_table)
    }
}

impl ResolvePc for Introspector {
    fn resolve(&self, pc: u64) -> Option<ResolvedPc> {
        self.pc_to_line(pc)
            .map(|res| ResolvedPc { file: res.file, line: res.line, func: res.func })
    }
}

/// Synthetic two-function target shared by this module's tests and the
/// probe orchestrator's.
#[cfg(test)]
pub(crate) mod testing {
    use super::elf::{Image, SectionData, SymbolInfo};
    use super::linetable::testtab::two_func_table;
    use super::{Introspector, LineTable};

    const TEXT_START: u64 = 0x0040_0000;

    /// `.text` matching the synthetic line table: both functions open
    /// with the CMP/JBE stack check, beta ends in a return.
    fn test_text() -> Vec<u8> {
        let mut text = vec![0x90u8; 0x40];
        for base in [0usize, 0x20] {
            text[base..base + 4].copy_from_slice(&[0x49, 0x3B, 0x66, 0x10]);
            text[base + 4..base + 6].copy_from_slice(&[0x76, 0x0A]);
        }
        text[0x3f] = 0xC3;
        text
    }

    pub fn introspector() -> Introspector {
        let image = Image {
            text: SectionData { addr: TEXT_START, data: test_text() },
            line_table: SectionData { addr: 0, data: Vec::new() },
            symbols: vec![
                SymbolInfo { name: "pkg.alpha".into(), address: TEXT_START, size: 0x20 },
                SymbolInfo { name: "pkg.beta".into(), address: TEXT_START + 0x20, size: 0x20 },
                SymbolInfo { name: "runtime.sched".into(), address: 0x0052_0000, size: 0x400 },
            ],
        };
        let line_table = LineTable::parse(two_func_table()).unwrap();
        Introspector::from_parts(image, line_table)
    }
}
