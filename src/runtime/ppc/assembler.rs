//! PowerPC assembler for runtime code generation.
//!
//! This module provides a lightweight assembler for the 32-bit PowerPC
//! instructions the trampolines and thunks need. Every instruction is one
//! big-endian 32-bit word appended to an owned buffer; nothing is written to
//! executable memory until the buffer is finalized.

/// Opcodes of the D-form instructions we emit.
const OP_ADDI: u32 = 14;
const OP_ADDIS: u32 = 15;
const OP_ORI: u32 = 24;
const OP_LWZ: u32 = 32;
const OP_STW: u32 = 36;
const OP_STWU: u32 = 37;
const OP_STB: u32 = 38;
const OP_STH: u32 = 44;
const OP_LFD: u32 = 50;
const OP_STFS: u32 = 52;
const OP_STFD: u32 = 54;

/// PowerPC assembler that emits machine code into a growable buffer.
#[derive(Debug, Default)]
pub struct Assembler {
    text: Vec<u8>,
}

impl Assembler {
    pub fn new() -> Self {
        Self { text: Vec::new() }
    }

    /// Creates an assembler whose buffer can hold `size` bytes without
    /// reallocating.
    pub fn with_capacity(size: usize) -> Self {
        Self {
            text: Vec::with_capacity(size),
        }
    }

    /// Returns the number of bytes emitted so far.
    pub fn size(&self) -> usize {
        self.text.len()
    }

    /// `addi rD, rA, SIMM`. With `ra == 0` the base is the literal zero.
    pub fn emit_addi(&mut self, rd: u8, ra: u8, simm: i32) {
        self.emit(d_form(OP_ADDI, rd, ra, simm));
    }

    /// `li rD, SIMM`
    pub fn emit_li(&mut self, rd: u8, simm: i32) {
        self.emit_addi(rd, 0, simm);
    }

    /// `lis rD, UIMM`, loading `uimm << 16`.
    pub fn emit_lis(&mut self, rd: u8, uimm: u16) {
        self.emit(d_form(OP_ADDIS, rd, 0, uimm as i16 as i32));
    }

    /// `ori rA, rS, UIMM`
    pub fn emit_ori(&mut self, ra: u8, rs: u8, uimm: u16) {
        self.emit(d_form(OP_ORI, rs, ra, uimm as i16 as i32));
    }

    /// Loads a 32-bit immediate value into a register.
    ///
    /// Always two instructions (`lis` + `ori`) so that code size does not
    /// depend on the value.
    pub fn emit_ld_imm(&mut self, rd: u8, value: u32) {
        self.emit_lis(rd, (value >> 16) as u16);
        self.emit_ori(rd, rd, (value & 0xffff) as u16);
    }

    /// `mr rA, rS`, encoded as `or rA, rS, rS`.
    pub fn emit_mr(&mut self, ra: u8, rs: u8) {
        check_reg(ra);
        check_reg(rs);
        self.emit(
            (31 << 26) | ((rs as u32) << 21) | ((ra as u32) << 16) | ((rs as u32) << 11) | (444 << 1),
        );
    }

    /// `lwz rD, d(rA)`
    pub fn emit_lwz(&mut self, rd: u8, d: i32, ra: u8) {
        self.emit(d_form(OP_LWZ, rd, ra, d));
    }

    /// `stw rS, d(rA)`
    pub fn emit_stw(&mut self, rs: u8, d: i32, ra: u8) {
        self.emit(d_form(OP_STW, rs, ra, d));
    }

    /// `stwu rS, d(rA)`: stores and writes the effective address back to rA.
    pub fn emit_stwu(&mut self, rs: u8, d: i32, ra: u8) {
        self.emit(d_form(OP_STWU, rs, ra, d));
    }

    /// `stb rS, d(rA)`
    pub fn emit_stb(&mut self, rs: u8, d: i32, ra: u8) {
        self.emit(d_form(OP_STB, rs, ra, d));
    }

    /// `sth rS, d(rA)`
    pub fn emit_sth(&mut self, rs: u8, d: i32, ra: u8) {
        self.emit(d_form(OP_STH, rs, ra, d));
    }

    /// `lfd frD, d(rA)`
    pub fn emit_lfd(&mut self, frd: u8, d: i32, ra: u8) {
        self.emit(d_form(OP_LFD, frd, ra, d));
    }

    /// `stfs frS, d(rA)`: rounds to single precision on the way out.
    pub fn emit_stfs(&mut self, frs: u8, d: i32, ra: u8) {
        self.emit(d_form(OP_STFS, frs, ra, d));
    }

    /// `stfd frS, d(rA)`
    pub fn emit_stfd(&mut self, frs: u8, d: i32, ra: u8) {
        self.emit(d_form(OP_STFD, frs, ra, d));
    }

    /// `frsp frD, frB`
    pub fn emit_frsp(&mut self, frd: u8, frb: u8) {
        check_reg(frd);
        check_reg(frb);
        self.emit(0xfc000018 | ((frd as u32) << 21) | ((frb as u32) << 11));
    }

    /// `mflr rD`
    pub fn emit_mflr(&mut self, rd: u8) {
        check_reg(rd);
        self.emit(0x7c0802a6 | ((rd as u32) << 21));
    }

    /// `mtlr rS`
    pub fn emit_mtlr(&mut self, rs: u8) {
        check_reg(rs);
        self.emit(0x7c0803a6 | ((rs as u32) << 21));
    }

    /// `blr`: returns to the address in the link register.
    pub fn emit_blr(&mut self) {
        self.emit(0x4e800020);
    }

    /// `blrl`: calls the address in the link register.
    pub fn emit_blrl(&mut self) {
        self.emit(0x4e800021);
    }

    /// Emits a raw 32-bit instruction.
    pub fn emit(&mut self, insn: u32) {
        self.text.extend_from_slice(&insn.to_be_bytes());
    }

    /// Consumes the assembler and returns the emitted code.
    pub fn finish(self) -> Vec<u8> {
        self.text
    }
}

fn check_reg(reg: u8) {
    assert!(reg < 32, "Invalid register: {}", reg);
}

fn d_form(opcode: u32, rt: u8, ra: u8, d: i32) -> u32 {
    check_reg(rt);
    check_reg(ra);
    assert!(
        (i16::MIN as i32..=i16::MAX as i32).contains(&d),
        "Displacement out of range: {}",
        d
    );
    (opcode << 26) | ((rt as u32) << 21) | ((ra as u32) << 16) | (d as u32 & 0xffff)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(asm: Assembler) -> Vec<u32> {
        asm.finish()
            .chunks(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn encodes_prolog_instructions() {
        let mut asm = Assembler::new();
        asm.emit_stwu(1, -32, 1);
        asm.emit_mflr(0);
        asm.emit_stw(31, 28, 1);
        asm.emit_mr(31, 1);
        assert_eq!(words(asm), vec![0x9421ffe0, 0x7c0802a6, 0x93e1001c, 0x7c3f0b78]);
    }

    #[test]
    fn encodes_branches_and_moves() {
        let mut asm = Assembler::new();
        asm.emit_mtlr(0);
        asm.emit_blrl();
        asm.emit_blr();
        asm.emit_li(0, 0);
        assert_eq!(words(asm), vec![0x7c0803a6, 0x4e800021, 0x4e800020, 0x38000000]);
    }

    #[test]
    fn loads_immediate_in_two_instructions() {
        let mut asm = Assembler::new();
        asm.emit_ld_imm(3, 0xdead_beef);
        assert_eq!(words(asm), vec![0x3c60dead, 0x6063beef]);
    }

    #[test]
    fn encodes_float_memory_access() {
        let mut asm = Assembler::new();
        asm.emit_lfd(1, 16, 12);
        asm.emit_stfs(1, 0, 9);
        asm.emit_stfd(1, 0, 9);
        asm.emit_frsp(1, 1);
        assert_eq!(words(asm), vec![0xc82c0010, 0xd0290000, 0xd8290000, 0xfc200818]);
    }

    #[test]
    fn writes_big_endian_words() {
        let mut asm = Assembler::with_capacity(4);
        asm.emit_blr();
        assert_eq!(asm.size(), 4);
        assert_eq!(asm.finish(), vec![0x4e, 0x80, 0x00, 0x20]);
    }

    #[test]
    #[should_panic(expected = "Displacement out of range")]
    fn rejects_wide_displacement() {
        Assembler::new().emit_lwz(3, 0x8000, 12);
    }
}
