//! Tramp - run-time call-convention bridges for an interpreter.
//!
//! Tramp generates small PowerPC (32-bit System V) machine-code stubs at run
//! time. A *trampoline* lets the runtime call a native function whose
//! signature is only known at run time, marshaling arguments out of an array
//! of tagged values. A *thunk* exposes an interpreter method as an ordinary
//! native function pointer that native code can call back into.
//!
//! # Modules
//!
//! - [`signature`] - The abstract signature model and its classification
//! - [`runtime`] - Layout computation, code emission and the generator
//! - [`mmap`] - Executable memory for finalized code
//!
//! # Error Handling
//!
//! All operations use the consolidated [`Error`] type. Signatures the
//! generator cannot bridge are reported as [`UnsupportedType`] before any
//! code is emitted.

pub mod mmap;
pub mod runtime;
pub mod signature;

/// Consolidated error type for all Tramp operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unsupported type: {0}")]
    UnsupportedType(#[from] UnsupportedType),

    #[error("executable memory allocation failed: {0}")]
    AllocationFailure(String),

    #[error("layout inconsistency in {what}: computed {computed} bytes, emitted {emitted} bytes")]
    LayoutInconsistency {
        what: &'static str,
        computed: usize,
        emitted: usize,
    },

    #[error("signature syntax error: {0}")]
    SignatureSyntax(String),

    #[error("disassembler error: {0}")]
    Disassembler(String),
}

/// Error type for signatures that cannot be bridged
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnsupportedType {
    #[error("parameter {position}: can only marshal enums, not generic structures (size: {size})")]
    CannotMarshalValueType { position: usize, size: u32 },

    #[error("parameter {position}: {reason} is not implemented")]
    UnsupportedArgumentPlacement {
        position: usize,
        reason: &'static str,
    },

    #[error("parameter {position}: cannot trampoline {kind}")]
    UnsupportedParameter { position: usize, kind: String },

    #[error("cannot handle {kind} as return value")]
    UnsupportedReturn { kind: String },

    #[error("value type return (size: {size}) is not implemented")]
    ValueTypeReturn { size: u32 },

    #[error("enum must have an integer underlying type, found {kind}")]
    InvalidEnumBase { kind: String },

    #[error("enum nesting is too deep")]
    EnumTooDeep,

    #[error("frame of {size} bytes exceeds the 16-bit displacement range")]
    FrameTooLarge { size: usize },
}

pub type Result<T> = core::result::Result<T, Error>;

pub use mmap::ExecutableMemory;
pub use runtime::{
    CodeInfo, CodeRegistry, Generator, GeneratorBuilder, RuntimeEntryPoints, Thunk, Trampoline,
};
pub use signature::{Method, Parameter, Signature, TypeKind};
