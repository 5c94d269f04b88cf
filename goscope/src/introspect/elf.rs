//! ELF image access for the introspector.
//!
//! Opens the target executable once, pulls out the two sections the rest
//! of the introspector works from (`.text` and the embedded line table)
//! and an address-sorted copy of the symbol table, then releases the file.

use std::fs;
use std::path::Path;

use object::{Object, ObjectSection, ObjectSymbol};

use crate::domain::IntrospectError;

const TEXT_SECTION: &str = ".text";
const LINE_TABLE_SECTION: &str = ".gopclntab";

/// A section's load address plus its raw bytes.
pub struct SectionData {
    pub addr: u64,
    pub data: Vec<u8>,
}

/// One entry of the target's symbol table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolInfo {
    pub name: String,
    pub address: u64,
    pub size: u64,
}

/// The parts of the target image the introspector needs, owned and
/// read-only for the lifetime of the tool.
pub struct Image {
    pub text: SectionData,
    pub line_table: SectionData,
    /// Sorted by address; `symbol_by_address` binary-searches this.
    pub symbols: Vec<SymbolInfo>,
}

impl Image {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, IntrospectError> {
        let bytes = fs::read(path.as_ref())?;
        let file = object::File::parse(&*bytes)?;

        let text = read_section(&file, TEXT_SECTION)?;
        let line_table = read_section(&file, LINE_TABLE_SECTION)?;

        let mut symbols: Vec<SymbolInfo> = file
            .symbols()
            .filter_map(|sym| {
                let name = sym.name().ok()?;
                if name.is_empty() {
                    return None;
                }
                Some(SymbolInfo {
                    name: name.to_string(),
                    address: sym.address(),
                    size: sym.size(),
                })
            })
            .collect();
        symbols.sort_by_key(|sym| sym.address);

        Ok(Self { text, line_table, symbols })
    }

    /// Look a symbol up by name. The table is address-sorted, so this is a
    /// linear scan; callers resolve a handful of names at startup only.
    pub fn symbol_named(&self, name: &str) -> Option<&SymbolInfo> {
        self.symbols.iter().find(|sym| sym.name == name)
    }

    /// The name of the symbol covering `address`: the entry with the
    /// greatest address less than or equal to it. `None` when the address
    /// precedes the first symbol or lies beyond the last one, i.e. is not
    /// backed by the image at all.
    pub fn symbol_by_address(&self, address: u64) -> Option<&str> {
        match self.symbols.binary_search_by_key(&address, |sym| sym.address) {
            Ok(idx) => Some(&self.symbols[idx].name),
            Err(0) => None,
            Err(idx) if idx == self.symbols.len() => None,
            Err(idx) => Some(&self.symbols[idx - 1].name),
        }
    }

    /// Copy the instruction bytes of a named function out of `.text`.
    pub fn function_bytes(&self, symbol: &str) -> Result<Vec<u8>, IntrospectError> {
        let sym = self
            .symbol_named(symbol)
            .ok_or_else(|| IntrospectError::MissingFunction(symbol.to_string()))?;
        let start = sym.address.checked_sub(self.text.addr).ok_or_else(|| {
            IntrospectError::FunctionOutOfText {
                symbol: symbol.to_string(),
                offset: sym.address,
                len: sym.size,
            }
        })?;
        let end = start + sym.size;
        let range = usize::try_from(start).ok().zip(usize::try_from(end).ok());
        range
            .and_then(|(start, end)| self.text.data.get(start..end))
            .map(<[u8]>::to_vec)
            .ok_or_else(|| IntrospectError::FunctionOutOfText {
                symbol: symbol.to_string(),
                offset: start,
                len: sym.size,
            })
    }
}

fn read_section(
    file: &object::File<'_>,
    name: &'static str,
) -> Result<SectionData, IntrospectError> {
    let section = file.section_by_name(name).ok_or(IntrospectError::MissingSection(name))?;
    let data = section.uncompressed_data()?.into_owned();
    Ok(SectionData { addr: section.address(), data })
}
