//! Signature layout for the PowerPC calling convention.
//!
//! A single placement rule, [`RegisterAllocation::place`], decides where each
//! argument lives in a native call. The forward trampoline uses it through
//! [`FrameLayout::calculate`] to size its frame and code and to emit the
//! argument loads; the reverse thunk uses it to find incoming arguments.

use super::{FRAME_EPILOG_INS, FRAME_PROLOG_INS, PPC_INSN_SIZE, TAGGED_VALUE_SIZE};
use crate::signature::{ArgClass, ReturnClass, Signature};
use crate::{Result, UnsupportedType};
use tracing::debug;

/// General-purpose argument registers (r3-r10).
pub const GENERAL_REGS: u8 = 8;
/// Floating-point argument registers (f1-f8).
pub const FLOAT_REGS: u8 = 8;
/// Floating-point argument registers the generated code fills (f1-f7).
pub const USABLE_FLOAT_REGS: u8 = 7;

/// Frame setup plus moving the argument array, callee and return slot
/// pointer out of the argument registers.
const PROLOG_INS: usize = FRAME_PROLOG_INS + 3;
const CALL_INS: usize = 2;
const EPILOG_INS: usize = FRAME_EPILOG_INS;

/// Back chain, LR save word, parameter area start, saved return slot
/// pointer and saved r31.
const MINIMAL_STACK_SIZE: u32 = 5 * 4;

/// Frame-relative offset (from the top of the frame) of the saved return
/// slot pointer.
pub const SAVED_RETVAL_FROM_TOP: i32 = -12;
/// Frame-relative offset (from the top of the frame) of the saved r31.
pub const SAVED_R31_FROM_TOP: i32 = -4;

/// Rounds a frame size up to the 16-byte stack alignment.
pub fn align_stack(size: u32) -> u32 {
    (size + 15) & !15
}

/// Where one argument travels in a native call.
///
/// Register numbers are argument slot indices: `Gpr(0)` is r3, `Fpr(0)` is
/// f1. Stack offsets are relative to the caller's parameter area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgLocation {
    Gpr(u8),
    /// An even/odd register pair starting at the given slot.
    GprPair(u8),
    Fpr(u8),
    Stack(u32),
}

/// Cursor over the argument registers and the stack spill area.
///
/// Threaded by value through the parameters, left to right.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterAllocation {
    pub general: u8,
    pub float: u8,
    pub stack: u32,
}

impl RegisterAllocation {
    /// Starts an allocation; a receiver takes the first general register.
    pub fn new(has_receiver: bool) -> Self {
        Self {
            general: has_receiver as u8,
            ..Self::default()
        }
    }

    /// Places an argument of `class`, returning the advanced cursor.
    ///
    /// Word arguments spill to the stack once the general registers run out.
    /// 64-bit integers and floats have no stack fallback.
    pub fn place(
        self,
        class: ArgClass,
        position: usize,
    ) -> core::result::Result<(Self, ArgLocation), UnsupportedType> {
        let mut next = self;
        let location = match class {
            ArgClass::Word { .. } => {
                if self.general < GENERAL_REGS {
                    next.general += 1;
                    ArgLocation::Gpr(self.general)
                } else {
                    next.stack += 4;
                    ArgLocation::Stack(self.stack)
                }
            }
            ArgClass::Wide => {
                // Pairs start on an even register.
                let first = (self.general + 1) & !1;
                if first + 1 >= GENERAL_REGS {
                    return Err(UnsupportedType::UnsupportedArgumentPlacement {
                        position,
                        reason: "64-bit integer argument on the stack",
                    });
                }
                next.general = first + 2;
                ArgLocation::GprPair(first)
            }
            ArgClass::Single | ArgClass::Double => {
                if self.float >= USABLE_FLOAT_REGS {
                    return Err(UnsupportedType::UnsupportedArgumentPlacement {
                        position,
                        reason: "floating-point argument on the stack",
                    });
                }
                next.float += 1;
                ArgLocation::Fpr(self.float)
            }
        };
        Ok((next, location))
    }
}

/// A classified and placed parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlacedArg {
    pub class: ArgClass,
    pub location: ArgLocation,
}

impl PlacedArg {
    /// Bytes of forward trampoline code needed to load this argument.
    fn code_size(&self) -> usize {
        match self.location {
            ArgLocation::Gpr(_) | ArgLocation::Fpr(_) => PPC_INSN_SIZE,
            // Two loads, or a load and a store to the stack.
            ArgLocation::GprPair(_) | ArgLocation::Stack(_) => 2 * PPC_INSN_SIZE,
        }
    }
}

/// Places every parameter of `sig` in order.
pub fn place_params(sig: &Signature) -> Result<(Vec<PlacedArg>, RegisterAllocation)> {
    let mut alloc = RegisterAllocation::new(sig.has_receiver);
    let mut params = Vec::with_capacity(sig.params.len());
    for (position, param) in sig.params.iter().enumerate() {
        let class = ArgClass::classify(&param.kind, position)?;
        let (next, location) = alloc.place(class, position)?;
        alloc = next;
        params.push(PlacedArg { class, location });
    }
    Ok((params, alloc))
}

/// Frame and code layout of a forward trampoline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameLayout {
    /// Native frame size, a multiple of 16.
    pub stack_size: u32,
    /// Exact size of the emitted code in bytes.
    pub code_size: usize,
    pub has_receiver: bool,
    pub params: Vec<PlacedArg>,
    pub ret: ReturnClass,
}

impl FrameLayout {
    /// Computes the frame size, code size and argument placement for `sig`.
    pub fn calculate(sig: &Signature, string_ctor: bool) -> Result<Self> {
        let (params, alloc) = place_params(sig)?;
        let ret = ReturnClass::classify(&sig.ret, string_ctor)?;

        let mut code_size = (PROLOG_INS + CALL_INS + EPILOG_INS) * PPC_INSN_SIZE;
        if sig.has_receiver {
            code_size += PPC_INSN_SIZE;
        }
        code_size += params.iter().map(PlacedArg::code_size).sum::<usize>();
        code_size += match ret {
            ReturnClass::Void => 0,
            ReturnClass::Wide => 3 * PPC_INSN_SIZE,
            _ => 2 * PPC_INSN_SIZE,
        };

        let unaligned = MINIMAL_STACK_SIZE + alloc.stack;
        let stack_size = align_stack(unaligned);
        debug!(
            "stack size: {} ({}), code size: {}",
            stack_size, unaligned, code_size
        );

        // The LR save word above the frame and the last tagged argument must
        // be reachable with a 16-bit displacement.
        let reach = (stack_size as usize + 4).max(params.len() * TAGGED_VALUE_SIZE as usize);
        if reach > i16::MAX as usize {
            return Err(UnsupportedType::FrameTooLarge { size: reach }.into());
        }

        Ok(Self {
            stack_size,
            code_size,
            has_receiver: sig.has_receiver,
            params,
            ret,
        })
    }
}
