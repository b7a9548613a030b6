//! Listings of generated code.

use super::PPC_INSN_SIZE;
use crate::{Error, Result};
use capstone::prelude::*;

fn capstone() -> Result<Capstone> {
    Capstone::new()
        .ppc()
        .mode(arch::ppc::ArchMode::Mode32)
        .endian(capstone::Endian::Big)
        .build()
        .map_err(|err| Error::Disassembler(err.to_string()))
}

/// Disassembles `code`, addressed from `base`, into one line per
/// instruction word.
pub fn disassemble(code: &[u8], base: usize) -> Result<Vec<String>> {
    let cs = capstone()?;
    let mut lines = Vec::with_capacity(code.len() / PPC_INSN_SIZE);
    for (i, chunk) in code.chunks(PPC_INSN_SIZE).enumerate() {
        let addr = base + i * PPC_INSN_SIZE;
        let word = chunk.iter().fold(0u32, |word, b| (word << 8) | *b as u32);
        let insns = cs
            .disasm_count(chunk, addr as u64, 1)
            .map_err(|err| Error::Disassembler(err.to_string()))?;
        let line = match insns.iter().next() {
            Some(insn) => {
                let mnemonic = insn.mnemonic().unwrap_or("");
                match insn.op_str() {
                    Some(ops) if !ops.is_empty() => {
                        format!("{:08x}: {:08x}  {} {}", addr, word, mnemonic, ops)
                    }
                    _ => format!("{:08x}: {:08x}  {}", addr, word, mnemonic),
                }
            }
            None => format!("{:08x}: <invalid instruction: 0x{:08x}>", addr, word),
        };
        lines.push(line);
    }
    Ok(lines)
}

/// Prints a listing of `code`, addressed from `base`.
pub fn print_code(code: &[u8], base: usize) -> Result<()> {
    for line in disassemble(code, base)? {
        println!("{}", line);
    }
    Ok(())
}

/// Formats `code` as assembler `.byte` directives, one word per line, so a
/// stub can be fed to an external disassembler.
pub fn byte_listing(code: &[u8]) -> String {
    let mut listing = String::new();
    for chunk in code.chunks(PPC_INSN_SIZE) {
        let bytes: Vec<String> = chunk.iter().map(|b| format!("0x{:02x}", b)).collect();
        listing.push_str(".byte ");
        listing.push_str(&bytes.join(","));
        listing.push('\n');
    }
    listing
}
