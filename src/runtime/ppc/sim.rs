//! Test interpreter for generated code.
//!
//! Executes the instruction subset the assembler emits against a flat
//! big-endian memory, so trampolines and thunks can be exercised on any host.
//! Native functions called by the generated code are modelled as hooks: when
//! the program counter reaches a hooked address the hook runs and control
//! returns to the link register.

use std::collections::HashMap;

pub(crate) const MEM_BASE: u32 = 0x1000_0000;
const MEM_SIZE: u32 = 0x10_0000;
const DATA_BASE: u32 = MEM_BASE + 0x8_0000;
/// Initial stack pointer; the words above it act as the caller's frame.
pub(crate) const STACK_TOP: u32 = MEM_BASE + MEM_SIZE - 0x1000;
/// Return address that ends a call.
pub(crate) const EXIT: u32 = 0xffff_fff0;
const MAX_STEPS: usize = 100_000;

/// Value written to volatile registers after every hook.
const CLOBBER: u32 = 0xbad0_bad0;

/// A decoded instruction of the emitted subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Insn {
    Addi { rd: u8, ra: u8, simm: i16 },
    Addis { rd: u8, ra: u8, simm: i16 },
    Ori { ra: u8, rs: u8, uimm: u16 },
    Or { ra: u8, rs: u8, rb: u8 },
    Lwz { rd: u8, d: i16, ra: u8 },
    Stw { rs: u8, d: i16, ra: u8 },
    Stwu { rs: u8, d: i16, ra: u8 },
    Stb { rs: u8, d: i16, ra: u8 },
    Sth { rs: u8, d: i16, ra: u8 },
    Lfd { frd: u8, d: i16, ra: u8 },
    Stfs { frs: u8, d: i16, ra: u8 },
    Stfd { frs: u8, d: i16, ra: u8 },
    Frsp { frd: u8, frb: u8 },
    Mflr { rd: u8 },
    Mtlr { rs: u8 },
    Blr,
    Blrl,
}

fn decode(word: u32) -> Option<Insn> {
    let rt = ((word >> 21) & 0x1f) as u8;
    let ra = ((word >> 16) & 0x1f) as u8;
    let rb = ((word >> 11) & 0x1f) as u8;
    let d = (word & 0xffff) as u16 as i16;
    let xo = (word >> 1) & 0x3ff;
    let insn = match word >> 26 {
        14 => Insn::Addi { rd: rt, ra, simm: d },
        15 => Insn::Addis { rd: rt, ra, simm: d },
        24 => Insn::Ori {
            ra,
            rs: rt,
            uimm: d as u16,
        },
        32 => Insn::Lwz { rd: rt, d, ra },
        36 => Insn::Stw { rs: rt, d, ra },
        37 => Insn::Stwu { rs: rt, d, ra },
        38 => Insn::Stb { rs: rt, d, ra },
        44 => Insn::Sth { rs: rt, d, ra },
        50 => Insn::Lfd { frd: rt, d, ra },
        52 => Insn::Stfs { frs: rt, d, ra },
        54 => Insn::Stfd { frs: rt, d, ra },
        19 if word == 0x4e800020 => Insn::Blr,
        19 if word == 0x4e800021 => Insn::Blrl,
        31 if xo == 444 && word & 1 == 0 => Insn::Or { ra, rs: rt, rb },
        31 if word & 0xfc1fffff == 0x7c0802a6 => Insn::Mflr { rd: rt },
        31 if word & 0xfc1fffff == 0x7c0803a6 => Insn::Mtlr { rs: rt },
        63 if xo == 12 && ra == 0 && word & 1 == 0 => Insn::Frsp { frd: rt, frb: rb },
        _ => return None,
    };
    Some(insn)
}

type Hook = Box<dyn FnMut(&mut Machine)>;

pub(crate) struct Machine {
    pub gpr: [u32; 32],
    pub fpr: [f64; 32],
    pub lr: u32,
    pub pc: u32,
    mem: Vec<u8>,
    hooks: HashMap<u32, Hook>,
    next_code: u32,
    next_data: u32,
}

impl Machine {
    pub fn new() -> Self {
        let mut gpr = [0; 32];
        gpr[1] = STACK_TOP;
        Self {
            gpr,
            fpr: [0.0; 32],
            lr: 0,
            pc: 0,
            mem: vec![0; MEM_SIZE as usize],
            hooks: HashMap::new(),
            next_code: MEM_BASE,
            next_data: DATA_BASE,
        }
    }

    /// Copies `code` into memory and returns its address.
    pub fn load_code(&mut self, code: &[u8]) -> u32 {
        let addr = self.next_code;
        self.write_bytes(addr, code);
        self.next_code = (addr + code.len() as u32 + 15) & !15;
        assert!(self.next_code < DATA_BASE, "code area exhausted");
        addr
    }

    /// Reserves `size` zeroed bytes of data memory, 16-byte aligned.
    pub fn alloc(&mut self, size: u32) -> u32 {
        let addr = self.next_data;
        self.next_data = (addr + size + 15) & !15;
        assert!(self.next_data < STACK_TOP - 0x4000, "data area exhausted");
        addr
    }

    pub fn hook(&mut self, addr: u32, hook: impl FnMut(&mut Machine) + 'static) {
        self.hooks.insert(addr, Box::new(hook));
    }

    fn index(&self, addr: u32, len: u32) -> usize {
        assert!(
            addr >= MEM_BASE && addr + len <= MEM_BASE + MEM_SIZE,
            "memory access out of range: 0x{:08x}",
            addr
        );
        (addr - MEM_BASE) as usize
    }

    pub fn read_bytes(&self, addr: u32, len: u32) -> &[u8] {
        let i = self.index(addr, len);
        &self.mem[i..i + len as usize]
    }

    pub fn write_bytes(&mut self, addr: u32, bytes: &[u8]) {
        let i = self.index(addr, bytes.len() as u32);
        self.mem[i..i + bytes.len()].copy_from_slice(bytes);
    }

    pub fn read_u8(&self, addr: u32) -> u8 {
        self.read_bytes(addr, 1)[0]
    }

    pub fn read_u16(&self, addr: u32) -> u16 {
        let b = self.read_bytes(addr, 2);
        u16::from_be_bytes([b[0], b[1]])
    }

    pub fn read_u32(&self, addr: u32) -> u32 {
        let b = self.read_bytes(addr, 4);
        u32::from_be_bytes([b[0], b[1], b[2], b[3]])
    }

    pub fn read_u64(&self, addr: u32) -> u64 {
        let mut b = [0; 8];
        b.copy_from_slice(self.read_bytes(addr, 8));
        u64::from_be_bytes(b)
    }

    pub fn read_f32(&self, addr: u32) -> f32 {
        f32::from_bits(self.read_u32(addr))
    }

    pub fn read_f64(&self, addr: u32) -> f64 {
        f64::from_bits(self.read_u64(addr))
    }

    pub fn write_u32(&mut self, addr: u32, value: u32) {
        self.write_bytes(addr, &value.to_be_bytes());
    }

    /// Runs the code at `entry` until it returns.
    pub fn call(&mut self, entry: u32) {
        self.lr = EXIT;
        self.pc = entry;
        for _ in 0..MAX_STEPS {
            if self.pc == EXIT {
                return;
            }
            if let Some(mut hook) = self.hooks.remove(&self.pc) {
                let addr = self.pc;
                hook(self);
                self.hooks.insert(addr, hook);
                self.clobber_volatile();
                self.pc = self.lr;
                continue;
            }
            let word = self.read_u32(self.pc);
            let insn = decode(word)
                .unwrap_or_else(|| panic!("unknown instruction 0x{:08x} at 0x{:08x}", word, self.pc));
            self.pc += 4;
            self.execute(insn);
        }
        panic!("step limit exceeded");
    }

    /// Trashes the volatile registers a native callee may change, except
    /// the return registers.
    fn clobber_volatile(&mut self) {
        self.gpr[0] = CLOBBER;
        for reg in 5..=12 {
            self.gpr[reg] = CLOBBER;
        }
        self.fpr[0] = f64::NAN;
        for reg in 2..=13 {
            self.fpr[reg] = f64::NAN;
        }
    }

    fn base(&self, ra: u8) -> u32 {
        if ra == 0 { 0 } else { self.gpr[ra as usize] }
    }

    fn ea(&self, d: i16, ra: u8) -> u32 {
        self.base(ra).wrapping_add(d as i32 as u32)
    }

    fn execute(&mut self, insn: Insn) {
        match insn {
            Insn::Addi { rd, ra, simm } => {
                self.gpr[rd as usize] = self.base(ra).wrapping_add(simm as i32 as u32);
            }
            Insn::Addis { rd, ra, simm } => {
                self.gpr[rd as usize] = self.base(ra).wrapping_add((simm as u16 as u32) << 16);
            }
            Insn::Ori { ra, rs, uimm } => {
                self.gpr[ra as usize] = self.gpr[rs as usize] | uimm as u32;
            }
            Insn::Or { ra, rs, rb } => {
                self.gpr[ra as usize] = self.gpr[rs as usize] | self.gpr[rb as usize];
            }
            Insn::Lwz { rd, d, ra } => {
                self.gpr[rd as usize] = self.read_u32(self.ea(d, ra));
            }
            Insn::Stw { rs, d, ra } => {
                self.write_u32(self.ea(d, ra), self.gpr[rs as usize]);
            }
            Insn::Stwu { rs, d, ra } => {
                let ea = self.ea(d, ra);
                self.write_u32(ea, self.gpr[rs as usize]);
                self.gpr[ra as usize] = ea;
            }
            Insn::Stb { rs, d, ra } => {
                let value = self.gpr[rs as usize] as u8;
                self.write_bytes(self.ea(d, ra), &[value]);
            }
            Insn::Sth { rs, d, ra } => {
                let value = self.gpr[rs as usize] as u16;
                self.write_bytes(self.ea(d, ra), &value.to_be_bytes());
            }
            Insn::Lfd { frd, d, ra } => {
                self.fpr[frd as usize] = self.read_f64(self.ea(d, ra));
            }
            Insn::Stfs { frs, d, ra } => {
                let value = self.fpr[frs as usize] as f32;
                self.write_bytes(self.ea(d, ra), &value.to_be_bytes());
            }
            Insn::Stfd { frs, d, ra } => {
                let value = self.fpr[frs as usize];
                self.write_bytes(self.ea(d, ra), &value.to_be_bytes());
            }
            Insn::Frsp { frd, frb } => {
                self.fpr[frd as usize] = self.fpr[frb as usize] as f32 as f64;
            }
            Insn::Mflr { rd } => self.gpr[rd as usize] = self.lr,
            Insn::Mtlr { rs } => self.lr = self.gpr[rs as usize],
            Insn::Blr => self.pc = self.lr,
            Insn::Blrl => {
                let target = self.lr;
                self.lr = self.pc;
                self.pc = target;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ppc::assembler::Assembler;

    fn decode_all(code: &[u8]) -> Vec<Insn> {
        code.chunks_exact(4)
            .map(|c| decode(u32::from_be_bytes([c[0], c[1], c[2], c[3]])).unwrap())
            .collect()
    }

    #[test]
    fn decodes_what_the_assembler_emits() {
        let mut asm = Assembler::new();
        asm.emit_stwu(1, -48, 1);
        asm.emit_mr(12, 6);
        asm.emit_ld_imm(0, 0x8000_1234);
        asm.emit_addi(5, 31, 40);
        asm.emit_lfd(3, 32, 12);
        asm.emit_frsp(1, 1);
        asm.emit_blrl();
        assert_eq!(
            decode_all(&asm.finish()),
            vec![
                Insn::Stwu { rs: 1, d: -48, ra: 1 },
                Insn::Or { ra: 12, rs: 6, rb: 6 },
                Insn::Addis { rd: 0, ra: 0, simm: 0x8000u16 as i16 },
                Insn::Ori { ra: 0, rs: 0, uimm: 0x1234 },
                Insn::Addi { rd: 5, ra: 31, simm: 40 },
                Insn::Lfd { frd: 3, d: 32, ra: 12 },
                Insn::Frsp { frd: 1, frb: 1 },
                Insn::Blrl,
            ]
        );
    }

    #[test]
    fn unknown_words_do_not_decode() {
        assert_eq!(decode(0x00000000), None);
        // mfctr r0
        assert_eq!(decode(0x7c0902a6), None);
    }

    #[test]
    fn lis_ori_materializes_a_full_word() {
        let mut asm = Assembler::new();
        asm.emit_ld_imm(3, 0xdead_beef);
        asm.emit_blr();
        let mut m = Machine::new();
        let entry = m.load_code(&asm.finish());
        m.call(entry);
        assert_eq!(m.gpr[3], 0xdead_beef);
    }
}
