//! Forward trampolines: calling native code with tagged arguments.
//!
//! A trampoline is entered with the host convention
//!
//! ```text
//! r3 = callee, r4 = return slot, r5 = receiver, r6 = tagged argument array
//! ```
//!
//! and calls `callee` with the native calling convention, loading each
//! argument from its tagged slot into the register or stack word
//! [`FrameLayout::calculate`] assigned to it. The native result is stored at
//! offset 0 of the return slot in its native width.

use super::assembler::Assembler;
use super::layout::{ArgLocation, FrameLayout, SAVED_RETVAL_FROM_TOP};
use super::{
    FIRST_ARG_FPR, FIRST_ARG_GPR, F1, PARAM_AREA_OFFSET, R0, R3, R4, R5, R6, R9, R11, R12, R31,
    SP, TAGGED_VALUE_SIZE, TaggedValue, disasm, emit_frame_epilog, emit_frame_prolog,
};
use crate::mmap::ExecutableMemory;
use crate::signature::{ReturnClass, Signature};
use crate::{Error, Result};
use core::ffi::c_void;
use tracing::{debug, trace};

/// Native type of a finalized trampoline.
pub type TrampolineFn =
    unsafe extern "C" fn(*const c_void, *mut c_void, *mut c_void, *const TaggedValue);

/// A finalized forward trampoline.
pub struct Trampoline {
    code: ExecutableMemory,
    stack_size: u32,
}

impl Trampoline {
    /// Builds a trampoline for `sig`.
    ///
    /// With `string_ctor` the callee is a string constructor and its result
    /// is stored as a raw pointer regardless of the declared return type.
    pub fn build(sig: &Signature, string_ctor: bool) -> Result<Self> {
        let layout = FrameLayout::calculate(sig, string_ctor)?;
        let text = emit(&layout)?;
        let code = ExecutableMemory::finalize(&text)?;
        debug!(
            "trampoline for `{}` at {:p} ({} bytes)",
            sig,
            code.as_ptr(),
            code.len()
        );
        Ok(Self {
            code,
            stack_size: layout.stack_size,
        })
    }

    pub fn code_ptr(&self) -> *const u8 {
        self.code.as_ptr()
    }

    pub fn code_size(&self) -> usize {
        self.code.len()
    }

    pub fn code(&self) -> &[u8] {
        self.code.as_slice()
    }

    /// Size of the native frame the trampoline allocates.
    pub fn stack_size(&self) -> u32 {
        self.stack_size
    }

    pub fn print_code(&self) -> Result<()> {
        disasm::print_code(self.code(), self.code_ptr() as usize)
    }

    /// Returns the trampoline as a callable function.
    ///
    /// # Safety
    ///
    /// The argument array must hold one tagged value per parameter of the
    /// signature the trampoline was built for, the callee must match that
    /// signature and the return slot must be at least 16 bytes.
    #[cfg(target_arch = "powerpc")]
    pub unsafe fn as_fn(&self) -> TrampolineFn {
        unsafe { core::mem::transmute::<*const u8, TrampolineFn>(self.code.as_ptr()) }
    }
}

fn emit(layout: &FrameLayout) -> Result<Vec<u8>> {
    let stack_size = layout.stack_size as i32;
    let mut asm = Assembler::with_capacity(layout.code_size);

    // Prolog
    emit_frame_prolog(&mut asm, stack_size);
    asm.emit_mr(R12, R6);
    asm.emit_mr(R0, R3);
    asm.emit_stw(R4, stack_size + SAVED_RETVAL_FROM_TOP, R31);

    // Arguments
    if layout.has_receiver {
        asm.emit_mr(R3, R5);
    }
    for (i, param) in layout.params.iter().enumerate() {
        let offset = i as i32 * TAGGED_VALUE_SIZE as i32;
        match param.location {
            ArgLocation::Gpr(slot) => {
                asm.emit_lwz(FIRST_ARG_GPR + slot, offset, R12);
            }
            ArgLocation::GprPair(slot) => {
                asm.emit_lwz(FIRST_ARG_GPR + slot, offset, R12);
                asm.emit_lwz(FIRST_ARG_GPR + slot + 1, offset + 4, R12);
            }
            // Both widths travel as the tagged value's double member.
            ArgLocation::Fpr(slot) => {
                asm.emit_lfd(FIRST_ARG_FPR + slot, offset, R12);
            }
            ArgLocation::Stack(stack_offset) => {
                asm.emit_lwz(R11, offset, R12);
                asm.emit_stw(R11, PARAM_AREA_OFFSET + stack_offset as i32, SP);
            }
        }
        trace!("param {}: {:?} -> {:?}", i, param.class, param.location);
    }

    // Call and store the result
    asm.emit_mtlr(R0);
    asm.emit_blrl();
    if layout.ret != ReturnClass::Void {
        asm.emit_lwz(R9, stack_size + SAVED_RETVAL_FROM_TOP, R31);
    }
    match layout.ret {
        ReturnClass::Void => {}
        ReturnClass::Byte => asm.emit_stb(R3, 0, R9),
        ReturnClass::Half => asm.emit_sth(R3, 0, R9),
        ReturnClass::Word | ReturnClass::Pointer => asm.emit_stw(R3, 0, R9),
        ReturnClass::Wide => {
            asm.emit_stw(R3, 0, R9);
            asm.emit_stw(R4, 4, R9);
        }
        ReturnClass::Single => asm.emit_stfs(F1, 0, R9),
        ReturnClass::Double => asm.emit_stfd(F1, 0, R9),
    }

    emit_frame_epilog(&mut asm);

    if asm.size() != layout.code_size {
        return Err(Error::LayoutInconsistency {
            what: "trampoline",
            computed: layout.code_size,
            emitted: asm.size(),
        });
    }
    Ok(asm.finish())
}
