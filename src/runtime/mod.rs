//! Code generation for call-convention bridges.
//!
//! This module ties the PowerPC backend to the runtime it serves. A
//! [`Generator`] builds two kinds of stubs:
//!
//! - **Trampolines** call a native function with arguments taken from an
//!   array of tagged values, for calls whose signature is only known at run
//!   time.
//! - **Thunks** are native function pointers that run an interpreted method
//!   when called.
//!
//! Generation is synchronous and keeps no state between requests; finalized
//! code is immutable and may be called from any thread.
//!
//! # Runtime collaborators
//!
//! Thunks call back into the runtime through two entry points, supplied as
//! [`RuntimeEntryPoints`], and announce themselves to the runtime's code
//! table through a [`CodeRegistry`].

pub mod ppc;

mod icache;

pub use icache::flush_icache_range;
pub use ppc::{Thunk, Trampoline};

use crate::Result;
use crate::signature::{Method, Signature};
use tracing::debug;

/// Target addresses of the runtime functions thunks call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeEntryPoints {
    /// `convert(descriptor, source, destination, pinvoke)`: copies a native
    /// value into a tagged slot.
    pub convert_native_to_tagged: u32,
    /// `entry(record)`: runs the method described by an invocation record.
    pub interpreter_entry: u32,
}

/// A generated code object, as announced to the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeInfo {
    pub code_start: *const u8,
    pub code_size: usize,
    /// Handle of the method the code runs.
    pub method: u32,
}

/// The runtime's table of generated code.
pub trait CodeRegistry {
    /// Called once for every thunk, after its code is final.
    fn register(&self, info: CodeInfo);
}

pub struct GeneratorBuilder {
    print_code: bool,
    entry_points: RuntimeEntryPoints,
}

impl Default for GeneratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GeneratorBuilder {
    pub fn new() -> Self {
        Self {
            print_code: false,
            entry_points: RuntimeEntryPoints::default(),
        }
    }

    /// Print the disassembly of every generated stub.
    pub fn print_code(mut self, print_code: bool) -> Self {
        self.print_code = print_code;
        self
    }

    pub fn entry_points(mut self, entry_points: RuntimeEntryPoints) -> Self {
        self.entry_points = entry_points;
        self
    }

    pub fn build(self) -> Generator {
        Generator {
            print_code: self.print_code,
            entry_points: self.entry_points,
        }
    }
}

/// Trampoline and thunk generator.
pub struct Generator {
    print_code: bool,
    entry_points: RuntimeEntryPoints,
}

impl Generator {
    /// Builds a trampoline calling native functions of signature `sig`.
    pub fn create_trampoline(&self, sig: &Signature, string_ctor: bool) -> Result<Trampoline> {
        let trampoline = Trampoline::build(sig, string_ctor)?;
        if self.print_code {
            println!("trampoline `{}`:", sig);
            trampoline.print_code()?;
        }
        Ok(trampoline)
    }

    /// Builds a native entry point for `method`.
    pub fn create_method_pointer(
        &self,
        method: &Method,
        registry: &dyn CodeRegistry,
    ) -> Result<Thunk> {
        debug!("creating method pointer for 0x{:08x}", method.handle);
        let thunk = Thunk::build(method, &self.entry_points, registry)?;
        if self.print_code {
            println!("thunk for 0x{:08x} `{}`:", method.handle, method.signature);
            thunk.print_code()?;
        }
        Ok(thunk)
    }

    pub fn entry_points(&self) -> &RuntimeEntryPoints {
        &self.entry_points
    }
}
