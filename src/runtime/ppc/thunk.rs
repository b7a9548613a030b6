//! Reverse thunks: native entry points into interpreted methods.
//!
//! A thunk is an ordinary native function with the method's signature. It
//! builds an [`InvocationRecord`] in its own frame, converts every incoming
//! native argument into a tagged slot with the runtime's conversion primitive,
//! runs the method through the interpreter entry point and loads the tagged
//! result back into the native return registers.
//!
//! Frame layout, from the stack pointer up:
//!
//! ```text
//!  0              back chain
//!  4              LR save word for our callees
//!  8              invocation record
//!  40             tagged arguments, one per parameter, then the return slot
//!  gpr_spill      r3-r10 as received
//!  fpr_spill      f1-f8 as received
//!  S-4            saved r31
//! ```

use super::assembler::Assembler;
use super::layout::{ArgLocation, FLOAT_REGS, GENERAL_REGS, PlacedArg, align_stack, place_params};
use super::{
    F1, FIRST_ARG_FPR, FIRST_ARG_GPR, InvocationRecord, PARAM_AREA_OFFSET, R0, R3, R4, R5, R6,
    R31, TAGGED_VALUE_SIZE, disasm, emit_frame_epilog, emit_frame_prolog,
};
use crate::mmap::ExecutableMemory;
use crate::runtime::{CodeInfo, CodeRegistry, RuntimeEntryPoints};
use crate::signature::{ArgClass, Method, ReturnClass, Signature};
use crate::{Result, UnsupportedType};
use tracing::{debug, trace};

/// Offset of the invocation record in the thunk frame.
const RECORD_OFFSET: i32 = PARAM_AREA_OFFSET;
/// Offset of the first tagged argument slot.
const ARGS_OFFSET: i32 = RECORD_OFFSET + InvocationRecord::SIZE;

/// Frame offsets of a thunk, relative to r31.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ThunkLayout {
    stack_size: u32,
    retval: i32,
    gpr_spill: i32,
    fpr_spill: i32,
    params: Vec<PlacedArg>,
    ret: ReturnClass,
}

impl ThunkLayout {
    fn calculate(sig: &Signature) -> Result<Self> {
        let (params, alloc) = place_params(sig)?;
        let ret = ReturnClass::classify(&sig.ret, false)?;

        let retval = ARGS_OFFSET + params.len() as i32 * TAGGED_VALUE_SIZE as i32;
        let gpr_spill = retval + TAGGED_VALUE_SIZE as i32;
        let fpr_spill = gpr_spill + GENERAL_REGS as i32 * 4;
        let saved_r31 = fpr_spill + FLOAT_REGS as i32 * 8;
        let stack_size = align_stack(saved_r31 as u32 + 4);

        // Incoming stack arguments are the farthest the code reaches.
        let reach = stack_size as usize + PARAM_AREA_OFFSET as usize + alloc.stack as usize;
        if reach > i16::MAX as usize {
            return Err(UnsupportedType::FrameTooLarge { size: reach }.into());
        }
        debug!(
            "thunk stack size: {}, {} params, retval at {}",
            stack_size,
            params.len(),
            retval
        );
        Ok(Self {
            stack_size,
            retval,
            gpr_spill,
            fpr_spill,
            params,
            ret,
        })
    }

    fn arg_slot(&self, index: usize) -> i32 {
        ARGS_OFFSET + index as i32 * TAGGED_VALUE_SIZE as i32
    }

    /// Frame offset of the native value of an argument in its native width.
    fn source(&self, param: &PlacedArg) -> i32 {
        let word = match param.location {
            ArgLocation::Gpr(slot) | ArgLocation::GprPair(slot) => self.gpr_spill + slot as i32 * 4,
            ArgLocation::Fpr(slot) => self.fpr_spill + slot as i32 * 8,
            ArgLocation::Stack(offset) => {
                self.stack_size as i32 + PARAM_AREA_OFFSET + offset as i32
            }
        };
        // Big-endian: a narrow integer sits at the high address of its word.
        match param.class {
            ArgClass::Word { size } if size < 4 => word + 4 - size as i32,
            _ => word,
        }
    }
}

/// A finalized reverse thunk.
pub struct Thunk {
    code: ExecutableMemory,
    method: u32,
    stack_size: u32,
}

impl Thunk {
    /// Builds a native entry point for `method` and registers it with
    /// `registry`.
    pub fn build(
        method: &Method,
        entry_points: &RuntimeEntryPoints,
        registry: &dyn CodeRegistry,
    ) -> Result<Self> {
        let sig = &method.signature;
        let layout = ThunkLayout::calculate(sig)?;
        let text = emit(method, entry_points, &layout);
        let code = ExecutableMemory::finalize(&text)?;
        debug!(
            "thunk for method 0x{:08x} `{}` at {:p} ({} bytes)",
            method.handle,
            sig,
            code.as_ptr(),
            code.len()
        );
        registry.register(CodeInfo {
            code_start: code.as_ptr(),
            code_size: code.len(),
            method: method.handle,
        });
        Ok(Self {
            code,
            method: method.handle,
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

    /// Handle of the method the thunk runs.
    pub fn method(&self) -> u32 {
        self.method
    }

    pub fn stack_size(&self) -> u32 {
        self.stack_size
    }

    pub fn print_code(&self) -> Result<()> {
        disasm::print_code(self.code(), self.code_ptr() as usize)
    }
}

fn emit(method: &Method, entry_points: &RuntimeEntryPoints, layout: &ThunkLayout) -> Vec<u8> {
    let sig = &method.signature;
    let mut asm = Assembler::new();

    emit_frame_prolog(&mut asm, layout.stack_size as i32);

    // Invocation record
    asm.emit_li(R0, 0);
    for field in [
        InvocationRecord::PARENT,
        InvocationRecord::CHILD,
        InvocationRecord::EXCEPTION,
        InvocationRecord::EXCEPTION_HANDLER,
    ] {
        asm.emit_stw(R0, RECORD_OFFSET + field, R31);
    }
    let receiver = if sig.has_receiver { R3 } else { R0 };
    asm.emit_stw(receiver, RECORD_OFFSET + InvocationRecord::RECEIVER, R31);

    // Conversion calls clobber the argument registers, so spill them first.
    for param in &layout.params {
        match (param.location, param.class) {
            (ArgLocation::Gpr(slot), _) => {
                asm.emit_stw(FIRST_ARG_GPR + slot, layout.gpr_spill + slot as i32 * 4, R31);
            }
            (ArgLocation::GprPair(slot), _) => {
                for reg in [slot, slot + 1] {
                    asm.emit_stw(FIRST_ARG_GPR + reg, layout.gpr_spill + reg as i32 * 4, R31);
                }
            }
            (ArgLocation::Fpr(slot), ArgClass::Single) => {
                asm.emit_stfs(FIRST_ARG_FPR + slot, layout.fpr_spill + slot as i32 * 8, R31);
            }
            (ArgLocation::Fpr(slot), _) => {
                asm.emit_stfd(FIRST_ARG_FPR + slot, layout.fpr_spill + slot as i32 * 8, R31);
            }
            (ArgLocation::Stack(_), _) => {}
        }
    }

    asm.emit_ld_imm(R0, method.handle);
    asm.emit_stw(R0, RECORD_OFFSET + InvocationRecord::METHOD, R31);
    asm.emit_addi(R0, R31, ARGS_OFFSET);
    asm.emit_stw(R0, RECORD_OFFSET + InvocationRecord::STACK_ARGS, R31);
    asm.emit_addi(R0, R31, layout.retval);
    asm.emit_stw(R0, RECORD_OFFSET + InvocationRecord::RETVAL, R31);

    // Arguments
    for (i, (param, placed)) in sig.params.iter().zip(&layout.params).enumerate() {
        let source = layout.source(placed);
        trace!(
            "param {}: {:?} at {:?}, source r31+{}",
            i, placed.class, placed.location, source
        );
        asm.emit_ld_imm(R3, param.descriptor);
        asm.emit_addi(R4, R31, source);
        asm.emit_addi(R5, R31, layout.arg_slot(i));
        asm.emit_li(R6, sig.pinvoke as i32);
        emit_call(&mut asm, entry_points.convert_native_to_tagged);
    }

    // Call
    asm.emit_addi(R3, R31, RECORD_OFFSET);
    emit_call(&mut asm, entry_points.interpreter_entry);

    // Return value
    match layout.ret {
        ReturnClass::Void => {}
        ReturnClass::Byte | ReturnClass::Half | ReturnClass::Word | ReturnClass::Pointer => {
            asm.emit_lwz(R3, layout.retval, R31);
        }
        ReturnClass::Wide => {
            asm.emit_lwz(R3, layout.retval, R31);
            asm.emit_lwz(R4, layout.retval + 4, R31);
        }
        ReturnClass::Single => {
            asm.emit_lfd(F1, layout.retval, R31);
            asm.emit_frsp(F1, F1);
        }
        ReturnClass::Double => asm.emit_lfd(F1, layout.retval, R31),
    }

    emit_frame_epilog(&mut asm);
    asm.finish()
}

/// Calls the function at `target` through the link register.
fn emit_call(asm: &mut Assembler, target: u32) {
    asm.emit_ld_imm(R0, target);
    asm.emit_mtlr(R0);
    asm.emit_blrl();
}
