//! Decoder for the compiler-embedded PC/line table.
//!
//! The table lives in its own section of the target image and maps PCs to
//! (file, line, function) triples through per-function delta-encoded
//! pc-value tables. Only the header layout written by toolchains 1.20
//! through 1.22 is accepted; the per-function info record the descriptor
//! extractor reads at fixed offsets is specific to that range, so an
//! unknown header magic fails construction instead of producing silently
//! wrong descriptors.
//!
//! Lookup failures (a PC outside any function, a line with no code) are
//! `None`; a table that cannot be parsed at all is a construction error.

use std::collections::HashMap;

use crate::byteorder::ByteOrder;
use crate::domain::IntrospectError;

const LINE_TABLE_MAGIC: u32 = 0xFFFF_FFF1;

/// Size of one per-function info record.
const FUNC_INFO_LEN: usize = 44;
const FUNC_INFO_NAME_OFF: usize = 4;
const FUNC_INFO_PCFILE: usize = 20;
const FUNC_INFO_PCLN: usize = 24;
const FUNC_INFO_CU_OFFSET: usize = 32;

/// functab entries are u32 pairs in this table version.
const FUNCTAB_FIELD_SIZE: usize = 4;

/// A function enumerated from the table. `end` is the entry PC of the
/// next function, not the last PC of this one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncInfo {
    pub name: String,
    pub entry: u64,
    pub end: u64,
}

/// A successful PC resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub file: String,
    pub line: i32,
    pub func: String,
}

pub struct LineTable {
    data: Vec<u8>,
    order: ByteOrder,
    quantum: u32,
    nfunctab: u32,
    text_start: u64,
    funcnametab: usize,
    cutab: usize,
    filetab: usize,
    pctab: usize,
    funcdata: usize,
    /// file path -> byte offset of its name in the file table, the value
    /// the compilation-unit table maps pcfile values onto.
    file_map: HashMap<String, u32>,
}

impl LineTable {
    pub fn parse(data: Vec<u8>) -> Result<Self, IntrospectError> {
        if data.len() < 8 {
            return Err(IntrospectError::BadLineTable("header shorter than 8 bytes"));
        }
        let le = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let be = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let order = if le == LINE_TABLE_MAGIC {
            ByteOrder::Little
        } else if be == LINE_TABLE_MAGIC {
            ByteOrder::Big
        } else {
            return Err(IntrospectError::UnsupportedLineTable { magic: le });
        };

        if data[4] != 0 || data[5] != 0 {
            return Err(IntrospectError::BadLineTable("nonzero header padding"));
        }
        let quantum = u32::from(data[6]);
        if !matches!(quantum, 1 | 2 | 4) {
            return Err(IntrospectError::BadLineTable("unrecognized instruction quantum"));
        }
        let ptr_size = usize::from(data[7]);
        if !matches!(ptr_size, 4 | 8) {
            return Err(IntrospectError::BadLineTable("unrecognized pointer size"));
        }

        let word = |index: usize| -> Result<u64, IntrospectError> {
            let off = 8 + index * ptr_size;
            let bytes = data
                .get(off..off + ptr_size)
                .ok_or(IntrospectError::BadLineTable("header truncated"))?;
            Ok(if ptr_size == 8 {
                order.u64(bytes.try_into().expect("eight header bytes"))
            } else {
                u64::from(order.u32(bytes.try_into().expect("four header bytes")))
            })
        };

        let nfunctab = u32::try_from(word(0)?)
            .map_err(|_| IntrospectError::BadLineTable("function count overflows u32"))?;
        let nfiletab = u32::try_from(word(1)?)
            .map_err(|_| IntrospectError::BadLineTable("file count overflows u32"))?;
        let text_start = word(2)?;
        let region = |index: usize| -> Result<usize, IntrospectError> {
            let off = usize::try_from(word(index)?)
                .map_err(|_| IntrospectError::BadLineTable("region offset overflows usize"))?;
            if off > data.len() {
                return Err(IntrospectError::BadLineTable("region offset beyond table"));
            }
            Ok(off)
        };
        let funcnametab = region(3)?;
        let cutab = region(4)?;
        let filetab = region(5)?;
        let pctab = region(6)?;
        let funcdata = region(7)?;

        let functab_len = (nfunctab as usize * 2 + 1) * FUNCTAB_FIELD_SIZE;
        if funcdata + functab_len > data.len() {
            return Err(IntrospectError::BadLineTable("function index beyond table"));
        }

        let mut table = Self {
            data,
            order,
            quantum,
            nfunctab,
            text_start,
            funcnametab,
            cutab,
            filetab,
            pctab,
            funcdata,
            file_map: HashMap::new(),
        };
        table.file_map = table.build_file_map(nfiletab)?;
        Ok(table)
    }

    fn build_file_map(&self, nfiletab: u32) -> Result<HashMap<String, u32>, IntrospectError> {
        let mut map = HashMap::with_capacity(nfiletab as usize);
        let mut pos = 0u32;
        for _ in 0..nfiletab {
            let name = self
                .cstring_at(self.filetab, pos)
                .ok_or(IntrospectError::BadLineTable("file table truncated"))?;
            let len = name.len() as u32;
            map.insert(name, pos);
            pos += len + 1;
        }
        Ok(map)
    }

    pub fn func_count(&self) -> u32 {
        self.nfunctab
    }

    pub fn text_start(&self) -> u64 {
        self.text_start
    }

    /// Enumerate all functions in compiler emission order.
    pub fn funcs(&self) -> Vec<FuncInfo> {
        (0..self.nfunctab)
            .filter_map(|i| {
                Some(FuncInfo {
                    name: self.func_name(i)?,
                    entry: self.text_start + u64::from(self.functab_entry_off(i)?),
                    end: self.text_start + u64::from(self.functab_entry_off(i + 1)?),
                })
            })
            .collect()
    }

    /// Resolve a PC to its source position. `None` when the PC lies
    /// outside every function.
    pub fn pc_to_line(&self, pc: u64) -> Option<Resolution> {
        let idx = self.find_func(pc)?;
        let func = self.func_name(idx)?;
        let entry = self.text_start + u64::from(self.functab_entry_off(idx)?);
        let line = self.pcvalue(self.func_field_u32(idx, FUNC_INFO_PCLN)?, entry, pc).unwrap_or(-1);
        let file = self.file_for(idx, entry, pc).unwrap_or_default();
        Some(Resolution { file, line, func })
    }

    fn file_for(&self, idx: u32, entry: u64, pc: u64) -> Option<String> {
        let fileno = self.pcvalue(self.func_field_u32(idx, FUNC_INFO_PCFILE)?, entry, pc)?;
        let cu = self.func_field_u32(idx, FUNC_INFO_CU_OFFSET)?;
        if cu == u32::MAX || fileno < 0 {
            return None;
        }
        let file_off = self.u32_at(self.cutab + (cu as usize + fileno as usize) * 4)?;
        if file_off == u32::MAX {
            return None;
        }
        self.cstring_at(self.filetab, file_off)
    }

    /// Find the first PC of `line` in `file`, along with the containing
    /// function's name. `None` when the pair maps to no code.
    pub fn line_to_pc(&self, file: &str, line: i32) -> Option<(u64, String)> {
        let filenum = *self.file_map.get(file)?;
        for idx in 0..self.nfunctab {
            let cu = self.func_field_u32(idx, FUNC_INFO_CU_OFFSET)?;
            if cu == u32::MAX {
                // Linker-generated stub without a compilation unit.
                continue;
            }
            let entry = self.text_start + u64::from(self.functab_entry_off(idx)?);
            let filetab = self.func_field_u32(idx, FUNC_INFO_PCFILE)?;
            let linetab = self.func_field_u32(idx, FUNC_INFO_PCLN)?;
            if let Some(pc) = self.find_file_line(entry, filetab, linetab, filenum, line, cu) {
                return Some((pc, self.func_name(idx)?));
            }
        }
        None
    }

    /// The raw per-function info record, for the descriptor extractor.
    pub(crate) fn func_info_bytes(&self, idx: u32) -> Result<&[u8], IntrospectError> {
        let func_off = self
            .functab_func_off(idx)
            .ok_or(IntrospectError::BadLineTable("function index beyond table"))?;
        let start = self.funcdata + func_off as usize;
        self.data
            .get(start..start + FUNC_INFO_LEN)
            .ok_or(IntrospectError::BadLineTable("function info record truncated"))
    }

    // Table walking.

    fn find_func(&self, pc: u64) -> Option<u32> {
        if self.nfunctab == 0 || pc < self.text_start {
            return None;
        }
        let off = u32::try_from(pc - self.text_start).ok()?;
        if off >= self.functab_entry_off(self.nfunctab)? {
            return None;
        }
        let (mut lo, mut hi) = (0u32, self.nfunctab);
        while lo + 1 < hi {
            let mid = lo + (hi - lo) / 2;
            if self.functab_entry_off(mid)? <= off {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        (self.functab_entry_off(lo)? <= off).then_some(lo)
    }

    fn functab_entry_off(&self, idx: u32) -> Option<u32> {
        self.u32_at(self.funcdata + idx as usize * 2 * FUNCTAB_FIELD_SIZE)
    }

    fn functab_func_off(&self, idx: u32) -> Option<u32> {
        if idx >= self.nfunctab {
            return None;
        }
        self.u32_at(self.funcdata + (idx as usize * 2 + 1) * FUNCTAB_FIELD_SIZE)
    }

    fn func_name(&self, idx: u32) -> Option<String> {
        let name_off = self.func_field_u32(idx, FUNC_INFO_NAME_OFF)?;
        self.cstring_at(self.funcnametab, name_off)
    }

    fn func_field_u32(&self, idx: u32, field_off: usize) -> Option<u32> {
        let info = self.func_info_bytes(idx).ok()?;
        let bytes = info.get(field_off..field_off + 4)?;
        Some(self.order.u32(bytes.try_into().expect("four field bytes")))
    }

    /// Walk a delta-encoded pc-value table, returning the value in effect
    /// at `target`.
    fn pcvalue(&self, table_off: u32, entry: u64, target: u64) -> Option<i32> {
        if table_off == 0 {
            return None;
        }
        let mut p = self.data.get(self.pctab + table_off as usize..)?;
        let mut pc = entry;
        let mut val = -1i32;
        let mut first = true;
        while self.step(&mut p, &mut pc, &mut val, first) {
            first = false;
            if target < pc {
                return Some(val);
            }
        }
        None
    }

    /// One step of a pc-value table: a zigzag value delta followed by a
    /// PC delta in quantum units. A zero value delta terminates the table
    /// everywhere but the first step.
    fn step(&self, p: &mut &[u8], pc: &mut u64, val: &mut i32, first: bool) -> bool {
        let Some(mut uvdelta) = read_varint(p) else {
            return false;
        };
        if uvdelta == 0 && !first {
            return false;
        }
        if uvdelta & 1 != 0 {
            uvdelta = !(uvdelta >> 1);
        } else {
            uvdelta >>= 1;
        }
        let vdelta = uvdelta as i32;
        let Some(pcdelta) = read_varint(p) else {
            return false;
        };
        *pc += u64::from(pcdelta * self.quantum);
        *val = val.wrapping_add(vdelta);
        true
    }

    /// Parallel walk of a function's pcfile and pcln tables looking for a
    /// PC whose file and line both match.
    fn find_file_line(
        &self,
        entry: u64,
        filetab: u32,
        linetab: u32,
        filenum: u32,
        line: i32,
        cu: u32,
    ) -> Option<u64> {
        if filetab == 0 || linetab == 0 {
            return None;
        }
        let mut fp = self.data.get(self.pctab + filetab as usize..)?;
        let mut fl = self.data.get(self.pctab + linetab as usize..)?;
        let (mut file_val, mut file_pc) = (-1i32, entry);
        let (mut line_val, mut line_pc) = (-1i32, entry);
        let mut file_start_pc = file_pc;
        let mut first_file = true;
        let mut first_line = true;
        while self.step(&mut fp, &mut file_pc, &mut file_val, first_file) {
            first_file = false;
            let file_off = (file_val >= 0)
                .then(|| self.u32_at(self.cutab + (cu as usize + file_val as usize) * 4))
                .flatten();
            if file_off == Some(filenum) && file_start_pc < file_pc {
                // This file covers [file_start_pc, file_pc); run the line
                // table over the same range.
                let mut line_start_pc = line_pc;
                while line_pc < file_pc && self.step(&mut fl, &mut line_pc, &mut line_val, first_line)
                {
                    first_line = false;
                    if line_val == line {
                        if file_start_pc <= line_start_pc {
                            return Some(line_start_pc);
                        }
                        if file_start_pc < line_pc {
                            return Some(file_start_pc);
                        }
                    }
                    line_start_pc = line_pc;
                }
            }
            file_start_pc = file_pc;
        }
        None
    }

    // Raw accessors.

    fn u32_at(&self, off: usize) -> Option<u32> {
        let bytes = self.data.get(off..off + 4)?;
        Some(self.order.u32(bytes.try_into().expect("four bytes")))
    }

    fn cstring_at(&self, region: usize, off: u32) -> Option<String> {
        let start = region + off as usize;
        let rest = self.data.get(start..)?;
        let len = rest.iter().position(|&b| b == 0)?;
        String::from_utf8(rest[..len].to_vec()).ok()
    }
}

fn read_varint(p: &mut &[u8]) -> Option<u32> {
    let mut v = 0u32;
    let mut shift = 0u32;
    loop {
        let (&byte, rest) = p.split_first()?;
        *p = rest;
        v |= u32::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some(v);
        }
        shift += 7;
        if shift > 28 {
            return None;
        }
    }
}

/// Synthetic line-table construction shared by this module's tests and
/// the descriptor extractor's.
#[cfg(test)]
pub(crate) mod testtab {
    /// Description of one function for [`build`].
    pub struct TestFunc {
        pub name: &'static str,
        pub entry_off: u32,
        pub end_off: u32,
        pub pcsp: u32,
        pub flag: u8,
        /// (line, covered byte length) runs across the function body.
        pub lines: Vec<(i32, u32)>,
    }

    fn uvarint(out: &mut Vec<u8>, mut v: u32) {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                out.push(byte);
                break;
            }
            out.push(byte | 0x80);
        }
    }

    fn zigzag(from: i32, to: i32) -> u32 {
        let delta = to.wrapping_sub(from);
        if delta < 0 {
            (!(delta as u32)) << 1 | 1
        } else {
            (delta as u32) << 1
        }
    }

    /// Build a single-file table (`file` holds every function) with the
    /// 1.20 header layout.
    pub fn build(text_start: u64, file: &'static str, funcs: &[TestFunc]) -> Vec<u8> {
        let mut funcnametab = Vec::new();
        let mut name_offsets = Vec::new();
        for f in funcs {
            name_offsets.push(funcnametab.len() as u32);
            funcnametab.extend_from_slice(f.name.as_bytes());
            funcnametab.push(0);
        }

        let mut filetab = Vec::new();
        filetab.extend_from_slice(file.as_bytes());
        filetab.push(0);

        // One compilation unit whose only file is `file`.
        let cutab: Vec<u8> = 0u32.to_le_bytes().to_vec();

        let mut pctab = vec![0u8]; // offset 0 means "no table"
        let mut pcfile_offs = Vec::new();
        let mut pcln_offs = Vec::new();
        for f in funcs {
            pcfile_offs.push(pctab.len() as u32);
            let span = f.end_off - f.entry_off;
            uvarint(&mut pctab, zigzag(-1, 0)); // file 0 for the whole body
            uvarint(&mut pctab, span);
            pctab.push(0);

            pcln_offs.push(pctab.len() as u32);
            let mut prev_line = -1i32;
            for &(line, len) in &f.lines {
                uvarint(&mut pctab, zigzag(prev_line, line));
                uvarint(&mut pctab, len);
                prev_line = line;
            }
            pctab.push(0);
        }

        let functab_len = (funcs.len() * 2 + 1) * 4;
        let mut funcdata = vec![0u8; functab_len];
        let mut func_offs = Vec::new();
        for (i, f) in funcs.iter().enumerate() {
            func_offs.push(funcdata.len() as u32);
            let mut info = Vec::with_capacity(44);
            info.extend_from_slice(&f.entry_off.to_le_bytes());
            info.extend_from_slice(&name_offsets[i].to_le_bytes());
            info.extend_from_slice(&0i32.to_le_bytes()); // args
            info.extend_from_slice(&0u32.to_le_bytes()); // deferreturn
            info.extend_from_slice(&f.pcsp.to_le_bytes());
            info.extend_from_slice(&pcfile_offs[i].to_le_bytes());
            info.extend_from_slice(&pcln_offs[i].to_le_bytes());
            info.extend_from_slice(&0u32.to_le_bytes()); // npcdata
            info.extend_from_slice(&0u32.to_le_bytes()); // compilation unit
            info.extend_from_slice(&f.lines[0].0.to_le_bytes()); // start line
            info.push(0); // func id
            info.push(f.flag);
            info.push(0);
            info.push(0); // nfuncdata
            assert_eq!(info.len(), 44);
            funcdata.extend_from_slice(&info);
        }
        for (i, f) in funcs.iter().enumerate() {
            funcdata[i * 8..i * 8 + 4].copy_from_slice(&f.entry_off.to_le_bytes());
            funcdata[i * 8 + 4..i * 8 + 8].copy_from_slice(&func_offs[i].to_le_bytes());
        }
        let sentinel = funcs.last().map_or(0, |f| f.end_off);
        funcdata[funcs.len() * 8..funcs.len() * 8 + 4]
            .copy_from_slice(&sentinel.to_le_bytes());

        // Header: magic, padding, quantum 1, 8-byte pointers, then eight
        // words of counts and region offsets.
        let header_len = 8 + 8 * 8;
        let funcname_off = header_len;
        let cutab_off = funcname_off + funcnametab.len();
        let filetab_off = cutab_off + cutab.len();
        let pctab_off = filetab_off + filetab.len();
        let funcdata_off = pctab_off + pctab.len();

        let mut data = Vec::new();
        data.extend_from_slice(&super::LINE_TABLE_MAGIC.to_le_bytes());
        data.extend_from_slice(&[0, 0, 1, 8]);
        for word in [
            funcs.len() as u64,
            1,
            text_start,
            funcname_off as u64,
            cutab_off as u64,
            filetab_off as u64,
            pctab_off as u64,
            funcdata_off as u64,
        ] {
            data.extend_from_slice(&word.to_le_bytes());
        }
        data.extend_from_slice(&funcnametab);
        data.extend_from_slice(&cutab);
        data.extend_from_slice(&filetab);
        data.extend_from_slice(&pctab);
        data.extend_from_slice(&funcdata);
        data
    }

    pub fn two_func_table() -> Vec<u8> {
        build(
            0x0040_0000,
            "alpha.go",
            &[
                TestFunc {
                    name: "pkg.alpha",
                    entry_off: 0x0,
                    end_off: 0x20,
                    pcsp: 0x77,
                    flag: 0x04,
                    lines: vec![(10, 0x8), (11, 0x18)],
                },
                TestFunc {
                    name: "pkg.beta",
                    entry_off: 0x20,
                    end_off: 0x40,
                    pcsp: 0x99,
                    flag: 0x01,
                    lines: vec![(20, 0x20)],
                },
            ],
        )
    }
}
