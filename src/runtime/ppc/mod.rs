//! 32-bit PowerPC System V backend.
//!
//! Register usage, frame conventions and the in-memory contracts shared with
//! the interpreter (tagged values and invocation records) live here; the
//! emitters are in [`trampoline`] and [`thunk`].

mod assembler;
pub mod disasm;
pub mod layout;
#[cfg(test)]
pub(crate) mod sim;
pub mod thunk;
pub mod trampoline;

pub use layout::{ArgLocation, FrameLayout, PlacedArg, RegisterAllocation};
pub use thunk::Thunk;
pub use trampoline::Trampoline;

use assembler::Assembler;
use core::mem::offset_of;

pub const PPC_INSN_SIZE: usize = 4;

pub const R0: u8 = 0;
/// Stack pointer.
pub const SP: u8 = 1;
pub const R3: u8 = 3;
pub const R4: u8 = 4;
pub const R5: u8 = 5;
pub const R6: u8 = 6;
pub const R9: u8 = 9;
pub const R11: u8 = 11;
pub const R12: u8 = 12;
/// Callee-saved register used as the frame pointer.
pub const R31: u8 = 31;
pub const F1: u8 = 1;

/// First general-purpose argument register.
pub const FIRST_ARG_GPR: u8 = R3;
/// First floating-point argument register.
pub const FIRST_ARG_FPR: u8 = F1;

/// Offset of the parameter area from the stack pointer, past the back chain
/// and the link register save word.
pub const PARAM_AREA_OFFSET: i32 = 8;

/// Number of instructions in [`emit_frame_prolog`].
const FRAME_PROLOG_INS: usize = 5;
/// Number of instructions in [`emit_frame_epilog`].
const FRAME_EPILOG_INS: usize = 6;

/// Allocates a frame of `stack_size` bytes and makes r31 its frame pointer.
///
/// The back chain goes to `0(r1)`, the link register to the caller's LR
/// save word and r31 to the top word of the new frame.
fn emit_frame_prolog(asm: &mut Assembler, stack_size: i32) {
    asm.emit_stwu(SP, -stack_size, SP);
    asm.emit_mflr(R0);
    asm.emit_stw(R31, stack_size - 4, SP);
    asm.emit_stw(R0, stack_size + 4, SP);
    asm.emit_mr(R31, SP);
}

/// Pops the frame through the back chain, restoring r31 and the link
/// register, and returns.
fn emit_frame_epilog(asm: &mut Assembler) {
    asm.emit_lwz(R11, 0, SP);
    asm.emit_lwz(R0, 4, R11);
    asm.emit_mtlr(R0);
    asm.emit_lwz(R31, -4, R11);
    asm.emit_mr(SP, R11);
    asm.emit_blr();
}

/// Size of one tagged value.
pub const TAGGED_VALUE_SIZE: u32 = 16;

/// Type tag of a [`TaggedValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ValueTag {
    I32 = 0,
    F64 = 1,
    I64 = 2,
    Pointer = 4,
    Object = 8,
}

/// The interpreter's universal argument and return representation.
///
/// The data union is stored in target (big-endian) byte order: 32-bit
/// integers and pointers occupy the first four bytes, 64-bit integers and
/// floats all eight.
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(C, align(8))]
pub struct TaggedValue {
    pub data: [u8; 8],
    pub tag: u32,
    _reserved: u32,
}

const _: () = assert!(size_of::<TaggedValue>() == TAGGED_VALUE_SIZE as usize);

impl TaggedValue {
    fn new(data: [u8; 8], tag: ValueTag) -> Self {
        Self {
            data,
            tag: tag as u32,
            _reserved: 0,
        }
    }

    pub fn from_i32(value: i32) -> Self {
        let mut data = [0; 8];
        data[..4].copy_from_slice(&value.to_be_bytes());
        Self::new(data, ValueTag::I32)
    }

    pub fn from_i64(value: i64) -> Self {
        Self::new(value.to_be_bytes(), ValueTag::I64)
    }

    pub fn from_f64(value: f64) -> Self {
        Self::new(value.to_be_bytes(), ValueTag::F64)
    }

    pub fn from_ptr(addr: u32) -> Self {
        let mut data = [0; 8];
        data[..4].copy_from_slice(&addr.to_be_bytes());
        Self::new(data, ValueTag::Pointer)
    }

    pub fn as_i32(&self) -> i32 {
        i32::from_be_bytes([self.data[0], self.data[1], self.data[2], self.data[3]])
    }

    pub fn as_i64(&self) -> i64 {
        i64::from_be_bytes(self.data)
    }

    pub fn as_f64(&self) -> f64 {
        f64::from_be_bytes(self.data)
    }

    /// Encodes the value as it is laid out in target memory.
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut bytes = [0; 16];
        bytes[..8].copy_from_slice(&self.data);
        bytes[8..12].copy_from_slice(&self.tag.to_be_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; 16]) -> Self {
        let mut data = [0; 8];
        data.copy_from_slice(&bytes[..8]);
        Self {
            data,
            tag: u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            _reserved: 0,
        }
    }
}

/// One in-flight interpreter call, as laid out on the 32-bit target.
///
/// Thunks build this record in their own stack frame; every field is a
/// target address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct InvocationRecord {
    pub parent: u32,
    pub child: u32,
    pub method: u32,
    /// Tagged slot receiving the return value.
    pub retval: u32,
    pub receiver: u32,
    /// First element of the tagged argument array.
    pub stack_args: u32,
    pub exception: u32,
    pub exception_handler: u32,
}

impl InvocationRecord {
    pub const PARENT: i32 = offset_of!(InvocationRecord, parent) as i32;
    pub const CHILD: i32 = offset_of!(InvocationRecord, child) as i32;
    pub const METHOD: i32 = offset_of!(InvocationRecord, method) as i32;
    pub const RETVAL: i32 = offset_of!(InvocationRecord, retval) as i32;
    pub const RECEIVER: i32 = offset_of!(InvocationRecord, receiver) as i32;
    pub const STACK_ARGS: i32 = offset_of!(InvocationRecord, stack_args) as i32;
    pub const EXCEPTION: i32 = offset_of!(InvocationRecord, exception) as i32;
    pub const EXCEPTION_HANDLER: i32 = offset_of!(InvocationRecord, exception_handler) as i32;
    pub const SIZE: i32 = size_of::<InvocationRecord>() as i32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invocation_record_matches_target_layout() {
        assert_eq!(InvocationRecord::PARENT, 0);
        assert_eq!(InvocationRecord::METHOD, 8);
        assert_eq!(InvocationRecord::RETVAL, 12);
        assert_eq!(InvocationRecord::RECEIVER, 16);
        assert_eq!(InvocationRecord::STACK_ARGS, 20);
        assert_eq!(InvocationRecord::EXCEPTION_HANDLER, 28);
        assert_eq!(InvocationRecord::SIZE, 32);
    }

    #[test]
    fn tagged_values_are_big_endian() {
        let value = TaggedValue::from_i32(-2);
        assert_eq!(&value.to_bytes()[..4], &[0xff, 0xff, 0xff, 0xfe]);
        assert_eq!(TaggedValue::from_bytes(&value.to_bytes()), value);
        assert_eq!(TaggedValue::from_i64(0x0102_0304_0506_0708).data[0], 0x01);
        assert_eq!(TaggedValue::from_f64(1.5).as_f64(), 1.5);
    }
}
