//! Abstract call signatures.
//!
//! The runtime's type system is consumed read-only through the small model in
//! this module: a [`Signature`] is an ordered list of [`Parameter`]s, an
//! optional receiver and a return [`TypeKind`]. Before any layout or code is
//! produced every parameter is reduced to an [`ArgClass`] and the return type
//! to a [`ReturnClass`]; signatures that cannot be reduced are rejected here.
//!
//! Signatures also have a compact text form used by the `tramp` binary and
//! the tests:
//!
//! ```text
//! this i4, &object, enum(u2), i8, r8 -> bool
//! ```

use crate::{Error, UnsupportedType};
use std::fmt;
use std::str::FromStr;

/// Enum chains deeper than this are treated as malformed metadata.
const MAX_ENUM_DEPTH: usize = 16;

/// Kind of a parameter or return value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeKind {
    Void,
    Boolean,
    Char,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    NativeInt,
    NativeUInt,
    Pointer,
    Object,
    String,
    Array,
    Int64,
    Float32,
    Float64,
    /// Managed pointer to a value of the inner kind.
    ByRef(Box<TypeKind>),
    /// Enum with the given underlying kind.
    Enum(Box<TypeKind>),
    /// Any other value type, described only by its size.
    ValueType { size: u32 },
}

impl TypeKind {
    pub fn by_ref(inner: TypeKind) -> Self {
        TypeKind::ByRef(Box::new(inner))
    }

    pub fn enumeration(base: TypeKind) -> Self {
        TypeKind::Enum(Box::new(base))
    }

    fn is_integer(&self) -> bool {
        matches!(
            self,
            TypeKind::Boolean
                | TypeKind::Char
                | TypeKind::Int8
                | TypeKind::UInt8
                | TypeKind::Int16
                | TypeKind::UInt16
                | TypeKind::Int32
                | TypeKind::UInt32
                | TypeKind::NativeInt
                | TypeKind::NativeUInt
                | TypeKind::Int64
        )
    }

    /// Unwraps enums until the underlying kind is reached.
    ///
    /// Non-enum kinds are returned unchanged. An enum must bottom out at an
    /// integer kind.
    pub fn reduce_enum(&self) -> Result<&TypeKind, UnsupportedType> {
        let mut kind = self;
        let mut unwrapped = false;
        for _ in 0..MAX_ENUM_DEPTH {
            match kind {
                TypeKind::Enum(base) => {
                    kind = base;
                    unwrapped = true;
                }
                _ if unwrapped && !kind.is_integer() => {
                    return Err(UnsupportedType::InvalidEnumBase {
                        kind: kind.to_string(),
                    });
                }
                _ => return Ok(kind),
            }
        }
        Err(UnsupportedType::EnumTooDeep)
    }
}

impl fmt::Display for TypeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TypeKind::Void => "void",
            TypeKind::Boolean => "bool",
            TypeKind::Char => "char",
            TypeKind::Int8 => "i1",
            TypeKind::UInt8 => "u1",
            TypeKind::Int16 => "i2",
            TypeKind::UInt16 => "u2",
            TypeKind::Int32 => "i4",
            TypeKind::UInt32 => "u4",
            TypeKind::NativeInt => "i",
            TypeKind::NativeUInt => "u",
            TypeKind::Pointer => "ptr",
            TypeKind::Object => "object",
            TypeKind::String => "string",
            TypeKind::Array => "szarray",
            TypeKind::Int64 => "i8",
            TypeKind::Float32 => "r4",
            TypeKind::Float64 => "r8",
            TypeKind::ByRef(inner) => return write!(f, "&{}", inner),
            TypeKind::Enum(base) => return write!(f, "enum({})", base),
            TypeKind::ValueType { size } => return write!(f, "vt({})", size),
        };
        f.write_str(name)
    }
}

impl FromStr for TypeKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(inner) = s.strip_prefix('&') {
            return Ok(TypeKind::by_ref(inner.parse()?));
        }
        if let Some(base) = s.strip_prefix("enum(").and_then(|r| r.strip_suffix(')')) {
            return Ok(TypeKind::enumeration(base.parse()?));
        }
        if let Some(size) = s.strip_prefix("vt(").and_then(|r| r.strip_suffix(')')) {
            let size = size
                .trim()
                .parse()
                .map_err(|_| Error::SignatureSyntax(format!("invalid value type size in '{}'", s)))?;
            return Ok(TypeKind::ValueType { size });
        }
        let kind = match s {
            "void" => TypeKind::Void,
            "bool" => TypeKind::Boolean,
            "char" => TypeKind::Char,
            "i1" => TypeKind::Int8,
            "u1" => TypeKind::UInt8,
            "i2" => TypeKind::Int16,
            "u2" => TypeKind::UInt16,
            "i4" => TypeKind::Int32,
            "u4" => TypeKind::UInt32,
            "i" => TypeKind::NativeInt,
            "u" => TypeKind::NativeUInt,
            "ptr" => TypeKind::Pointer,
            "object" => TypeKind::Object,
            "string" => TypeKind::String,
            "szarray" => TypeKind::Array,
            "i8" => TypeKind::Int64,
            "r4" => TypeKind::Float32,
            "r8" => TypeKind::Float64,
            _ => return Err(Error::SignatureSyntax(format!("unknown type '{}'", s))),
        };
        Ok(kind)
    }
}

/// A parameter of a signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    pub kind: TypeKind,
    /// Target address of the runtime's type descriptor for this parameter.
    ///
    /// Only reverse thunks use it; it is handed verbatim to the conversion
    /// primitive.
    pub descriptor: u32,
}

impl Parameter {
    pub fn new(kind: TypeKind) -> Self {
        Self {
            kind,
            descriptor: 0,
        }
    }

    pub fn with_descriptor(kind: TypeKind, descriptor: u32) -> Self {
        Self { kind, descriptor }
    }
}

/// A call signature.
///
/// Parameter order is call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub params: Vec<Parameter>,
    /// Whether an implicit receiver precedes the parameters.
    pub has_receiver: bool,
    pub ret: TypeKind,
    /// Selects native rather than interpreter size rules in the conversion
    /// primitive.
    pub pinvoke: bool,
}

impl Signature {
    pub fn new(ret: TypeKind) -> Self {
        Self {
            params: Vec::new(),
            has_receiver: false,
            ret,
            pinvoke: false,
        }
    }

    pub fn with_receiver(mut self) -> Self {
        self.has_receiver = true;
        self
    }

    pub fn param(mut self, kind: TypeKind) -> Self {
        self.params.push(Parameter::new(kind));
        self
    }

    pub fn pinvoke(mut self, pinvoke: bool) -> Self {
        self.pinvoke = pinvoke;
        self
    }
}

impl FromStr for Signature {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (params, ret) = match s.split_once("->") {
            Some((params, ret)) => (params.trim(), ret.parse()?),
            None => (s.trim(), TypeKind::Void),
        };
        let mut sig = Signature::new(ret);
        let params = match params.strip_prefix("this") {
            Some(rest) if rest.is_empty() || rest.starts_with([' ', ',']) => {
                sig.has_receiver = true;
                rest.trim_start_matches([' ', ','])
            }
            _ => params,
        };
        if !params.trim().is_empty() {
            for param in params.split(',') {
                sig.params.push(Parameter::new(param.parse()?));
            }
        }
        Ok(sig)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut params: Vec<String> = self.params.iter().map(|p| p.kind.to_string()).collect();
        if self.has_receiver {
            params.insert(0, "this".to_string());
        }
        write!(f, "{} -> {}", params.join(", "), self.ret)
    }
}

/// An interpreter method exposed through a thunk.
#[derive(Debug, Clone)]
pub struct Method {
    /// Target address of the runtime's method handle.
    pub handle: u32,
    pub signature: Signature,
}

/// How a parameter travels in the native calling convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgClass {
    /// One general register or stack word; `size` is the native width in
    /// bytes of the value held in it.
    Word { size: u8 },
    /// A 64-bit integer in a general register pair.
    Wide,
    Single,
    Double,
}

impl ArgClass {
    /// Classifies the parameter at `position`.
    pub fn classify(kind: &TypeKind, position: usize) -> Result<Self, UnsupportedType> {
        if let TypeKind::ByRef(_) = kind {
            return Ok(ArgClass::Word { size: 4 });
        }
        let class = match kind.reduce_enum()? {
            TypeKind::Boolean | TypeKind::Int8 | TypeKind::UInt8 => ArgClass::Word { size: 1 },
            TypeKind::Char | TypeKind::Int16 | TypeKind::UInt16 => ArgClass::Word { size: 2 },
            TypeKind::Int32
            | TypeKind::UInt32
            | TypeKind::NativeInt
            | TypeKind::NativeUInt
            | TypeKind::Pointer
            | TypeKind::Object
            | TypeKind::String
            | TypeKind::Array => ArgClass::Word { size: 4 },
            TypeKind::Int64 => ArgClass::Wide,
            TypeKind::Float32 => ArgClass::Single,
            TypeKind::Float64 => ArgClass::Double,
            TypeKind::ValueType { size } => {
                return Err(UnsupportedType::CannotMarshalValueType {
                    position,
                    size: *size,
                });
            }
            other => {
                return Err(UnsupportedType::UnsupportedParameter {
                    position,
                    kind: other.to_string(),
                });
            }
        };
        Ok(class)
    }
}

/// How a return value travels in the native calling convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnClass {
    Void,
    Byte,
    Half,
    Word,
    Wide,
    Single,
    Double,
    /// By-ref results and string constructors: a raw pointer in r3.
    Pointer,
}

impl ReturnClass {
    pub fn classify(kind: &TypeKind, string_ctor: bool) -> Result<Self, UnsupportedType> {
        if string_ctor {
            return Ok(ReturnClass::Pointer);
        }
        if let TypeKind::ByRef(_) = kind {
            return Ok(ReturnClass::Pointer);
        }
        let class = match kind.reduce_enum()? {
            TypeKind::Void => ReturnClass::Void,
            TypeKind::Boolean | TypeKind::Int8 | TypeKind::UInt8 => ReturnClass::Byte,
            TypeKind::Char | TypeKind::Int16 | TypeKind::UInt16 => ReturnClass::Half,
            TypeKind::Int32
            | TypeKind::UInt32
            | TypeKind::NativeInt
            | TypeKind::NativeUInt
            | TypeKind::Pointer
            | TypeKind::Object
            | TypeKind::String
            | TypeKind::Array => ReturnClass::Word,
            TypeKind::Int64 => ReturnClass::Wide,
            TypeKind::Float32 => ReturnClass::Single,
            TypeKind::Float64 => ReturnClass::Double,
            TypeKind::ValueType { size } => {
                return Err(UnsupportedType::ValueTypeReturn { size: *size });
            }
            other => {
                return Err(UnsupportedType::UnsupportedReturn {
                    kind: other.to_string(),
                });
            }
        };
        Ok(class)
    }
}
