//! Linear x86-64 instruction scanner.
//!
//! The introspector only ever needs two facts about an instruction: how
//! long it is, and whether it is one of `CMP`, `JBE` or `RET`. This module
//! decodes enough of the 64-bit instruction encoding to answer that for
//! the code the targeted compiler emits: legacy and REX prefixes, one- and
//! two-byte opcode maps, the 0F 38 / 0F 3A extensions, VEX, ModRM/SIB and
//! displacement forms, and the immediate widths. Anything it cannot
//! classify is a hard error rather than a guessed length, because a wrong
//! length desynchronizes every offset derived downstream.
//!
//! The stack-growth prologue of every non-leaf function opens with a
//! `CMP` against the stack bound followed immediately by a `JBE` into the
//! grow path; `post_prologue_offset` finds the first byte after that pair.

use crate::domain::ScanError;

/// The opcode classes the introspector distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Cmp,
    Jbe,
    Ret,
    Other,
}

/// One decoded instruction: its class and total encoded length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inst {
    pub op: Op,
    pub len: usize,
}

/// Decode the single instruction starting at `code[offset]`.
pub fn decode(code: &[u8], offset: usize) -> Result<Inst, ScanError> {
    Decoder { code, offset, pos: offset }.decode()
}

/// Offsets of every `RET` in a function body, decoding linearly from
/// offset zero.
pub fn return_offsets(code: &[u8]) -> Result<Vec<u64>, ScanError> {
    let mut offsets = Vec::new();
    let mut offset = 0;
    while offset < code.len() {
        let inst = decode(code, offset)?;
        if inst.op == Op::Ret {
            offsets.push(offset as u64);
        }
        offset += inst.len;
    }
    Ok(offsets)
}

/// Find the first offset after the stack-growth prologue: the byte after
/// the first `CMP` immediately followed by a `JBE`. Returns `None` when
/// the pattern never occurs in the body.
///
/// The scan keeps a resume point at the byte after the last instruction
/// inspected while no pattern element was matched; a partial match that
/// fails falls back there, so decoding never restarts mid-instruction.
pub fn post_prologue_offset(code: &[u8]) -> Result<Option<u64>, ScanError> {
    const PATTERN: [Op; 2] = [Op::Cmp, Op::Jbe];

    let mut offset = 0;
    let mut matched = 0;
    let mut resume = 0;
    while offset < code.len() {
        let inst = decode(code, offset)?;
        if matched == 0 {
            resume = offset + inst.len;
        }
        if inst.op == PATTERN[matched] {
            matched += 1;
            offset += inst.len;
            if matched == PATTERN.len() {
                return Ok(Some(offset as u64));
            }
        } else {
            matched = 0;
            offset = resume;
        }
    }
    Ok(None)
}

struct Decoder<'a> {
    code: &'a [u8],
    offset: usize,
    pos: usize,
}

impl Decoder<'_> {
    fn next(&mut self) -> Result<u8, ScanError> {
        let byte = *self
            .code
            .get(self.pos)
            .ok_or(ScanError::Truncated { offset: self.offset })?;
        self.pos += 1;
        Ok(byte)
    }

    fn skip(&mut self, n: usize) -> Result<(), ScanError> {
        if self.pos + n > self.code.len() {
            return Err(ScanError::Truncated { offset: self.offset });
        }
        self.pos += n;
        Ok(())
    }

    fn decode(mut self) -> Result<Inst, ScanError> {
        let mut operand16 = false;
        let mut rex_w = false;

        // Legacy prefixes, in any order and number.
        let mut byte = loop {
            let byte = self.next()?;
            match byte {
                0x66 => operand16 = true,
                0xF0 | 0xF2 | 0xF3 | 0x2E | 0x36 | 0x3E | 0x26 | 0x64 | 0x65 | 0x67 => {}
                _ => break byte,
            }
        };

        if byte & 0xF0 == 0x40 {
            rex_w = byte & 0x08 != 0;
            byte = self.next()?;
        }

        let op = match byte {
            // Two-byte VEX prefix: implied 0F map, ModRM always follows.
            0xC5 => {
                self.next()?;
                let opcode = self.next()?;
                self.modrm()?;
                if vex_0f_imm8(opcode) {
                    self.skip(1)?;
                }
                Op::Other
            }
            // Three-byte VEX prefix: the map lives in the second byte.
            0xC4 => {
                let map = self.next()? & 0x1F;
                self.next()?;
                let opcode = self.next()?;
                self.modrm()?;
                match map {
                    1 if vex_0f_imm8(opcode) => self.skip(1)?,
                    3 => self.skip(1)?,
                    _ => {}
                }
                Op::Other
            }
            0x0F => self.decode_0f()?,
            _ => self.decode_one_byte(byte, operand16, rex_w)?,
        };

        Ok(Inst { op, len: self.pos - self.offset })
    }

    fn decode_one_byte(
        &mut self,
        byte: u8,
        operand16: bool,
        rex_w: bool,
    ) -> Result<Op, ScanError> {
        let immz = if operand16 { 2 } else { 4 };
        let op = match byte {
            0x38..=0x3B | 0x3C | 0x3D => Op::Cmp,
            0x76 => Op::Jbe,
            0xC2 | 0xC3 => Op::Ret,
            _ => Op::Other,
        };
        match byte {
            // ALU r/m,r and r,r/m forms, plus the other ModRM-only ops.
            0x00..=0x03
            | 0x08..=0x0B
            | 0x10..=0x13
            | 0x18..=0x1B
            | 0x20..=0x23
            | 0x28..=0x2B
            | 0x30..=0x33
            | 0x38..=0x3B
            | 0x63
            | 0x84..=0x8F
            | 0xD0..=0xD3
            | 0xFE
            | 0xFF => {
                self.modrm()?;
            }
            // ALU accumulator, imm8.
            0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x34 | 0x3C | 0xA8 => self.skip(1)?,
            // ALU accumulator, imm16/32.
            0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x35 | 0x3D | 0xA9 => self.skip(immz)?,
            // Single-byte: push/pop, xchg, string ops, flag ops, leave...
            0x50..=0x5F
            | 0x90..=0x99
            | 0x9C..=0x9F
            | 0xA4..=0xA7
            | 0xAA..=0xAF
            | 0xC9
            | 0xCB
            | 0xCC
            | 0xF1
            | 0xF4
            | 0xF5
            | 0xF8..=0xFD => {}
            0x68 => self.skip(immz)?,
            0x69 => {
                self.modrm()?;
                self.skip(immz)?;
            }
            0x6A => self.skip(1)?,
            0x6B | 0xC0 | 0xC1 | 0xC6 => {
                self.modrm()?;
                self.skip(1)?;
            }
            // Short conditional jumps.
            0x70..=0x7F | 0xEB | 0xE0..=0xE3 => self.skip(1)?,
            // Immediate-group ALU: reg field selects the operation; CMP is
            // reg 7 and shares the encoding with ADD/SUB/AND/OR/...
            0x80 | 0x83 => {
                let reg = self.modrm()?;
                self.skip(1)?;
                if reg == 7 {
                    return Ok(Op::Cmp);
                }
            }
            0x81 => {
                let reg = self.modrm()?;
                self.skip(immz)?;
                if reg == 7 {
                    return Ok(Op::Cmp);
                }
            }
            // Moves with 64-bit absolute offsets.
            0xA0..=0xA3 => self.skip(8)?,
            0xB0..=0xB7 => self.skip(1)?,
            // mov reg, imm: the only instruction whose immediate widens to
            // eight bytes under REX.W.
            0xB8..=0xBF => self.skip(if rex_w { 8 } else { immz })?,
            0xC2 => self.skip(2)?,
            0xC3 => {}
            0xC7 => {
                self.modrm()?;
                self.skip(immz)?;
            }
            0xCD => self.skip(1)?,
            0xE8 | 0xE9 => self.skip(4)?,
            // Unary group: TEST carries an immediate, NOT/NEG/MUL/DIV do
            // not.
            0xF6 => {
                let reg = self.modrm()?;
                if reg <= 1 {
                    self.skip(1)?;
                }
            }
            0xF7 => {
                let reg = self.modrm()?;
                if reg <= 1 {
                    self.skip(immz)?;
                }
            }
            _ => {
                return Err(ScanError::UnsupportedOpcode { byte, offset: self.offset });
            }
        }
        Ok(op)
    }

    fn decode_0f(&mut self) -> Result<Op, ScanError> {
        let byte = self.next()?;
        let op = if byte == 0x86 { Op::Jbe } else { Op::Other };
        match byte {
            // syscall, rdtsc, ud2, cpuid, bswap and the other bare forms.
            0x05 | 0x0B | 0x31 | 0xA2 | 0xC8..=0xCF | 0x77 => {}
            // Three-byte maps.
            0x38 => {
                self.next()?;
                self.modrm()?;
            }
            0x3A => {
                self.next()?;
                self.modrm()?;
                self.skip(1)?;
            }
            // Long conditional jumps.
            0x80..=0x8F => self.skip(4)?,
            // ModRM plus an immediate byte: shuffles, inserts, bit tests.
            0x70..=0x73 | 0xA4 | 0xAC | 0xBA | 0xC2 | 0xC4..=0xC6 => {
                self.modrm()?;
                self.skip(1)?;
            }
            // Everything else in the 0F map the compiler emits takes a
            // bare ModRM: vector moves and arithmetic, cmov, setcc,
            // movzx/movsx, xadd, cmpxchg, fences, prefetch/nop hints.
            0x10..=0x2F
            | 0x40..=0x6F
            | 0x74..=0x76
            | 0x78 | 0x79 | 0x7C..=0x7F
            | 0x90..=0x9F
            | 0xA3 | 0xA5 | 0xAB | 0xAD..=0xAF
            | 0xB0..=0xB9 | 0xBB..=0xC3
            | 0xC7
            | 0xD0..=0xFE
            => {
                self.modrm()?;
            }
            _ => {
                return Err(ScanError::UnsupportedExtendedOpcode { byte, offset: self.offset });
            }
        }
        Ok(op)
    }

    /// Consume a ModRM byte plus any SIB and displacement it implies, and
    /// return the reg field for opcode groups.
    fn modrm(&mut self) -> Result<u8, ScanError> {
        let modrm = self.next()?;
        let mode = modrm >> 6;
        let rm = modrm & 0x07;
        let reg = (modrm >> 3) & 0x07;
        if mode != 3 {
            if rm == 4 {
                let sib = self.next()?;
                if mode == 0 && sib & 0x07 == 5 {
                    self.skip(4)?;
                }
            } else if mode == 0 && rm == 5 {
                // RIP-relative.
                self.skip(4)?;
            }
            match mode {
                1 => self.skip(1)?,
                2 => self.skip(4)?,
                _ => {}
            }
        }
        Ok(reg)
    }
}

/// VEX-encoded 0F-map opcodes that carry a trailing immediate.
fn vex_0f_imm8(opcode: u8) -> bool {
    matches!(opcode, 0x70..=0x73 | 0xC2 | 0xC4..=0xC6)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lens(code: &[u8]) -> Vec<usize> {
        let mut out = Vec::new();
        let mut offset = 0;
        while offset < code.len() {
            let inst = decode(code, offset).unwrap();
            out.push(inst.len);
            offset += inst.len;
        }
        out
    }

    #[test]
    fn decodes_common_encodings_to_exact_lengths() {
        // mov rbp, rsp; sub rsp, 0x18; mov rax, [r14+0x10]; nop
        let code = [
            0x48, 0x89, 0xE5, // mov rbp, rsp
            0x48, 0x83, 0xEC, 0x18, // sub rsp, 0x18
            0x49, 0x8B, 0x46, 0x10, // mov rax, [r14+0x10]
            0x90, // nop
        ];
        assert_eq!(lens(&code), vec![3, 4, 4, 1]);
    }

    #[test]
    fn decodes_sib_and_rip_relative_forms() {
        let code = [
            0x48, 0x8B, 0x04, 0x25, 0x00, 0x10, 0x00, 0x00, // mov rax, [0x1000]
            0x48, 0x8D, 0x05, 0x44, 0x33, 0x22, 0x11, // lea rax, [rip+0x11223344]
            0x8B, 0x84, 0x24, 0x80, 0x00, 0x00, 0x00, // mov eax, [rsp+0x80]
        ];
        assert_eq!(lens(&code), vec![8, 7, 7]);
    }

    #[test]
    fn classifies_cmp_jbe_and_ret() {
        assert_eq!(decode(&[0x49, 0x3B, 0x66, 0x10], 0).unwrap(), Inst { op: Op::Cmp, len: 4 });
        assert_eq!(decode(&[0x76, 0x0A], 0).unwrap(), Inst { op: Op::Jbe, len: 2 });
        assert_eq!(decode(&[0x0F, 0x86, 1, 0, 0, 0], 0).unwrap(), Inst { op: Op::Jbe, len: 6 });
        assert_eq!(decode(&[0xC3], 0).unwrap(), Inst { op: Op::Ret, len: 1 });
        assert_eq!(decode(&[0xC2, 0x08, 0x00], 0).unwrap(), Inst { op: Op::Ret, len: 3 });
    }

    #[test]
    fn classifies_immediate_group_cmp_by_reg_field() {
        // cmp rax, 0x10 via group 1 (83 /7) vs add rax, 0x10 (83 /0).
        assert_eq!(decode(&[0x48, 0x83, 0xF8, 0x10], 0).unwrap().op, Op::Cmp);
        assert_eq!(decode(&[0x48, 0x83, 0xC0, 0x10], 0).unwrap().op, Op::Other);
        // cmp with imm32 (81 /7).
        assert_eq!(
            decode(&[0x48, 0x81, 0xFC, 0x00, 0x01, 0x00, 0x00], 0).unwrap(),
            Inst { op: Op::Cmp, len: 7 }
        );
    }

    #[test]
    fn immediate_width_follows_rex_and_operand_size() {
        // mov rax, imm64
        assert_eq!(decode(&[0x48, 0xB8, 1, 2, 3, 4, 5, 6, 7, 8], 0).unwrap().len, 10);
        // mov eax, imm32
        assert_eq!(decode(&[0xB8, 1, 2, 3, 4], 0).unwrap().len, 5);
        // mov ax, imm16
        assert_eq!(decode(&[0x66, 0xB8, 1, 2], 0).unwrap().len, 4);
    }

    #[test]
    fn unary_group_test_carries_an_immediate() {
        // test byte [rax], 0x1 (F6 /0 ib) vs neg byte [rax] (F6 /3).
        assert_eq!(decode(&[0xF6, 0x00, 0x01], 0).unwrap().len, 3);
        assert_eq!(decode(&[0xF6, 0x18], 0).unwrap().len, 2);
    }

    #[test]
    fn unknown_opcodes_are_errors_not_guesses() {
        assert_eq!(
            decode(&[0x06], 0),
            Err(ScanError::UnsupportedOpcode { byte: 0x06, offset: 0 })
        );
        assert_eq!(
            decode(&[0x48], 0),
            Err(ScanError::Truncated { offset: 0 })
        );
    }

    // The stack-growth prologue scan.

    const CMP_BOUND: [u8; 4] = [0x49, 0x3B, 0x66, 0x10]; // cmp rsp, [r14+0x10]
    const JBE_GROW: [u8; 2] = [0x76, 0x10];

    #[test]
    fn prologue_directly_at_entry() {
        let mut code = Vec::new();
        code.extend_from_slice(&CMP_BOUND);
        code.extend_from_slice(&JBE_GROW);
        code.push(0xC3);
        assert_eq!(post_prologue_offset(&code).unwrap(), Some(6));
    }

    #[test]
    fn prologue_after_leading_instructions() {
        let mut code = vec![0x90]; // nop
        code.extend_from_slice(&CMP_BOUND);
        code.extend_from_slice(&JBE_GROW);
        code.push(0xC3);
        assert_eq!(post_prologue_offset(&code).unwrap(), Some(7));
    }

    #[test]
    fn partial_match_resumes_after_the_failed_pair() {
        // cmp; nop; cmp; jbe; ret -- the first cmp is a false start.
        let mut code = Vec::new();
        code.extend_from_slice(&CMP_BOUND);
        code.push(0x90);
        code.extend_from_slice(&CMP_BOUND);
        code.extend_from_slice(&JBE_GROW);
        code.push(0xC3);
        assert_eq!(post_prologue_offset(&code).unwrap(), Some(11));
    }

    #[test]
    fn missing_prologue_reports_none() {
        let code = [0x90, 0x48, 0x89, 0xE5, 0xC3];
        assert_eq!(post_prologue_offset(&code).unwrap(), None);
    }

    #[test]
    fn return_offsets_are_exactly_the_ret_positions() {
        let mut code = Vec::new();
        code.extend_from_slice(&[0x48, 0x89, 0xE5]); // mov rbp, rsp
        code.push(0xC3); // ret at 3
        code.extend_from_slice(&[0x48, 0x83, 0xEC, 0x18]); // sub rsp, 0x18
        code.push(0xC3); // ret at 8
        assert_eq!(return_offsets(&code).unwrap(), vec![3, 8]);
    }

    #[test]
    fn functions_without_returns_yield_an_empty_list() {
        let code = [0x48, 0x89, 0xE5, 0xE8, 0x01, 0x02, 0x03, 0x04]; // mov; call
        assert_eq!(return_offsets(&code).unwrap(), Vec::<u64>::new());
    }
}
