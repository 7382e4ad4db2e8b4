//! Runtime type information
//!
//! Types are stored in a compact byte encoding: an optional `const` marker,
//! a control byte selecting the variant, then a variant payload. Indices and
//! sizes in the payload are varints. A 32-bit *type id* either carries the
//! encoding inline or points into the `rtti.data` blob.

mod tables;
mod value;

pub use tables::{
    ClassDef, DebugMethod, DebugVar, EnumStruct, EnumStructField, Field, RttiEnum, RttiMethod,
    RttiNative, RttiTables, Typedef, Typeset,
};
pub use value::{interpret_value, MemoryView, Value};

use crate::format::CELL_SIZE;
use crate::reader::{write_varint, ByteReader, DecodeError};
use thiserror::Error;

/// Control bytes of the type encoding
pub mod cb {
    /// `bool`
    pub const BOOL: u8 = 0x01;
    /// `int`
    pub const INT32: u8 = 0x06;
    /// `float`
    pub const FLOAT32: u8 = 0x0c;
    /// `char`
    pub const CHAR8: u8 = 0x0e;
    /// `any`
    pub const ANY: u8 = 0x10;
    /// `Function`
    pub const TOP_FUNCTION: u8 = 0x11;
    /// Fixed-length array: varint length, element type
    pub const FIXED_ARRAY: u8 = 0x30;
    /// Dynamic array: element type
    pub const ARRAY: u8 = 0x31;
    /// Function type: signature payload
    pub const FUNCTION: u8 = 0x32;
    /// Enum: varint index
    pub const ENUM: u8 = 0x42;
    /// Typedef: varint index
    pub const TYPEDEF: u8 = 0x43;
    /// Typeset: varint index
    pub const TYPESET: u8 = 0x44;
    /// Class (methodmap): varint index
    pub const CLASSDEF: u8 = 0x45;
    /// Enum struct: varint index
    pub const ENUM_STRUCT: u8 = 0x46;
    /// `void` return
    pub const VOID: u8 = 0x70;
    /// Variadic marker in a signature
    pub const VARIADIC: u8 = 0x71;
    /// By-reference marker on a parameter
    pub const BY_REF: u8 = 0x72;
    /// Const qualifier
    pub const CONST: u8 = 0x73;
}

/// Type id kind: encoding stored in the upper 28 bits
pub const TYPE_ID_INLINE: u32 = 0x0;
/// Type id kind: upper 28 bits are an offset into `rtti.data`
pub const TYPE_ID_COMPLEX: u32 = 0x1;

const TYPE_ID_KIND_MASK: u32 = 0xf;
const TYPE_ID_PAYLOAD_SHIFT: u32 = 4;

/// Errors raised while decoding or interpreting types
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RttiError {
    /// The encoding stream is truncated or malformed
    #[error("Type decode error: {0}")]
    Decode(#[from] DecodeError),

    /// An unrecognised control byte
    #[error("Unknown type control byte {byte:#04x} at offset {offset}")]
    UnknownControl {
        /// The offending byte
        byte: u8,
        /// Offset within the encoding stream
        offset: usize,
    },

    /// The type id kind is neither inline nor complex
    #[error("Unknown type id kind {0:#x}")]
    UnknownTypeIdKind(u32),

    /// A dynamically sized value was interpreted without an explicit size
    #[error("Size required to interpret a value of type {0}")]
    SizeRequired(String),

    /// A value referenced memory outside the machine
    #[error("Invalid memory address {0:#x}")]
    InvalidAddress(i32),

    /// The image carries no `rtti.data` blob
    #[error("Image has no rtti.data section")]
    NoTypeData,
}

/// The variant of a decoded type
#[derive(Debug, Clone, PartialEq)]
pub enum TypeKind {
    /// `bool`
    Bool,
    /// `any`
    Any,
    /// `int`
    Int32,
    /// `float`
    Float32,
    /// `char`
    Char8,
    /// `void`
    Void,
    /// Array with a length known at compile time
    FixedArray {
        /// Element type
        inner: Box<TypeInfo>,
        /// Number of elements
        len: u32,
    },
    /// Array whose length is only known at runtime
    Array(Box<TypeInfo>),
    /// Enum, by index into `rtti.enums`
    Enum(u32),
    /// Typedef, by index into `rtti.typedefs`
    Typedef(u32),
    /// Typeset, by index into `rtti.typesets`
    Typeset(u32),
    /// Class, by index into `rtti.classdefs`
    Classdef(u32),
    /// Enum struct, by index into `rtti.enumstructs`
    EnumStruct(u32),
    /// Function value with a known signature
    Function(Box<FunctionSignature>),
    /// Any function value
    TopFunction,
}

/// A decoded type, optionally const-qualified
#[derive(Debug, Clone, PartialEq)]
pub struct TypeInfo {
    /// Variant
    pub kind: TypeKind,
    /// Whether the type carries the const qualifier
    pub is_const: bool,
}

/// A formal parameter of a function signature
#[derive(Debug, Clone, PartialEq)]
pub struct ParamType {
    /// Declared type
    pub ty: TypeInfo,
    /// Whether the argument is passed by reference
    pub by_ref: bool,
}

/// A function signature
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionSignature {
    /// Return type, [`TypeKind::Void`] when the function returns nothing
    pub return_type: TypeInfo,
    /// Formal parameters in declaration order
    pub params: Vec<ParamType>,
    /// Whether the last parameter absorbs extra arguments
    pub variadic: bool,
}

impl TypeInfo {
    /// Create a non-const type
    pub fn new(kind: TypeKind) -> Self {
        Self {
            kind,
            is_const: false,
        }
    }

    /// Create a const-qualified type
    pub fn constant(kind: TypeKind) -> Self {
        Self {
            kind,
            is_const: true,
        }
    }

    /// Fixed array of `len` elements
    pub fn fixed_array(inner: TypeInfo, len: u32) -> Self {
        Self::new(TypeKind::FixedArray {
            inner: Box::new(inner),
            len,
        })
    }

    /// Dynamic array
    pub fn array(inner: TypeInfo) -> Self {
        Self::new(TypeKind::Array(Box::new(inner)))
    }

    /// Decode one type from `reader`
    pub fn decode(reader: &mut ByteReader<'_>) -> Result<Self, RttiError> {
        let mut is_const = false;
        let mut offset = reader.position();
        let mut byte = reader.read_u8()?;
        if byte == cb::CONST {
            is_const = true;
            offset = reader.position();
            byte = reader.read_u8()?;
        }

        let kind = match byte {
            cb::BOOL => TypeKind::Bool,
            cb::INT32 => TypeKind::Int32,
            cb::FLOAT32 => TypeKind::Float32,
            cb::CHAR8 => TypeKind::Char8,
            cb::ANY => TypeKind::Any,
            cb::TOP_FUNCTION => TypeKind::TopFunction,
            cb::VOID => TypeKind::Void,
            cb::FIXED_ARRAY => {
                let len = reader.read_varint()?;
                let inner = Self::decode(reader)?;
                TypeKind::FixedArray {
                    inner: Box::new(inner),
                    len,
                }
            }
            cb::ARRAY => TypeKind::Array(Box::new(Self::decode(reader)?)),
            cb::FUNCTION => TypeKind::Function(Box::new(FunctionSignature::decode(reader)?)),
            cb::ENUM => TypeKind::Enum(reader.read_varint()?),
            cb::TYPEDEF => TypeKind::Typedef(reader.read_varint()?),
            cb::TYPESET => TypeKind::Typeset(reader.read_varint()?),
            cb::CLASSDEF => TypeKind::Classdef(reader.read_varint()?),
            cb::ENUM_STRUCT => TypeKind::EnumStruct(reader.read_varint()?),
            byte => return Err(RttiError::UnknownControl { byte, offset }),
        };
        Ok(Self { kind, is_const })
    }

    /// Encode into the compact byte form
    pub fn encode(&self, out: &mut Vec<u8>) {
        if self.is_const {
            out.push(cb::CONST);
        }
        match &self.kind {
            TypeKind::Bool => out.push(cb::BOOL),
            TypeKind::Int32 => out.push(cb::INT32),
            TypeKind::Float32 => out.push(cb::FLOAT32),
            TypeKind::Char8 => out.push(cb::CHAR8),
            TypeKind::Any => out.push(cb::ANY),
            TypeKind::TopFunction => out.push(cb::TOP_FUNCTION),
            TypeKind::Void => out.push(cb::VOID),
            TypeKind::FixedArray { inner, len } => {
                out.push(cb::FIXED_ARRAY);
                write_varint(out, *len);
                inner.encode(out);
            }
            TypeKind::Array(inner) => {
                out.push(cb::ARRAY);
                inner.encode(out);
            }
            TypeKind::Function(signature) => {
                out.push(cb::FUNCTION);
                signature.encode(out);
            }
            TypeKind::Enum(index) => encode_indexed(out, cb::ENUM, *index),
            TypeKind::Typedef(index) => encode_indexed(out, cb::TYPEDEF, *index),
            TypeKind::Typeset(index) => encode_indexed(out, cb::TYPESET, *index),
            TypeKind::Classdef(index) => encode_indexed(out, cb::CLASSDEF, *index),
            TypeKind::EnumStruct(index) => encode_indexed(out, cb::ENUM_STRUCT, *index),
        }
    }

    /// Size of a value of this type in bytes, when known statically
    pub fn byte_size(&self) -> Option<u32> {
        match &self.kind {
            TypeKind::Char8 => Some(1),
            TypeKind::Bool
            | TypeKind::Any
            | TypeKind::Int32
            | TypeKind::Float32
            | TypeKind::Enum(_)
            | TypeKind::Typedef(_)
            | TypeKind::Typeset(_)
            | TypeKind::Classdef(_)
            | TypeKind::Function(_)
            | TypeKind::TopFunction => Some(CELL_SIZE),
            TypeKind::FixedArray { inner, len } => inner.byte_size()?.checked_mul(*len),
            TypeKind::Void | TypeKind::Array(_) | TypeKind::EnumStruct(_) => None,
        }
    }

    /// Size of a value of this type in cells, rounding partial cells up
    pub fn cell_size(&self) -> Option<u32> {
        self.byte_size().map(|bytes| bytes.div_ceil(CELL_SIZE))
    }

    /// Whether values of this type are passed through a memory address
    pub fn is_array(&self) -> bool {
        matches!(
            self.kind,
            TypeKind::FixedArray { .. } | TypeKind::Array(_) | TypeKind::EnumStruct(_)
        )
    }

    /// Whether this is a character array (a string buffer)
    pub fn is_string(&self) -> bool {
        match &self.kind {
            TypeKind::FixedArray { inner, .. } | TypeKind::Array(inner) => {
                inner.kind == TypeKind::Char8
            }
            _ => false,
        }
    }

    /// Element type of an array
    pub fn element(&self) -> Option<&TypeInfo> {
        match &self.kind {
            TypeKind::FixedArray { inner, .. } | TypeKind::Array(inner) => Some(inner),
            _ => None,
        }
    }
}

fn encode_indexed(out: &mut Vec<u8>, control: u8, index: u32) {
    out.push(control);
    write_varint(out, index);
}

impl std::fmt::Display for TypeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_const {
            f.write_str("const ")?;
        }
        match &self.kind {
            TypeKind::Bool => f.write_str("bool"),
            TypeKind::Any => f.write_str("any"),
            TypeKind::Int32 => f.write_str("int"),
            TypeKind::Float32 => f.write_str("float"),
            TypeKind::Char8 => f.write_str("char"),
            TypeKind::Void => f.write_str("void"),
            TypeKind::FixedArray { inner, len } => write!(f, "{inner}[{len}]"),
            TypeKind::Array(inner) => write!(f, "{inner}[]"),
            TypeKind::Enum(index) => write!(f, "enum#{index}"),
            TypeKind::Typedef(index) => write!(f, "typedef#{index}"),
            TypeKind::Typeset(index) => write!(f, "typeset#{index}"),
            TypeKind::Classdef(index) => write!(f, "class#{index}"),
            TypeKind::EnumStruct(index) => write!(f, "enumstruct#{index}"),
            TypeKind::Function(signature) => write!(f, "function {signature}"),
            TypeKind::TopFunction => f.write_str("Function"),
        }
    }
}

impl FunctionSignature {
    /// Decode a signature payload: parameter count, optional variadic
    /// marker, return type, then each parameter with an optional by-ref marker
    pub fn decode(reader: &mut ByteReader<'_>) -> Result<Self, RttiError> {
        let count = reader.read_u8()?;
        let mut variadic = false;
        if peek(reader)? == cb::VARIADIC {
            reader.skip(1)?;
            variadic = true;
        }
        let return_type = TypeInfo::decode(reader)?;

        let mut params = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let mut by_ref = false;
            if peek(reader)? == cb::BY_REF {
                reader.skip(1)?;
                by_ref = true;
            }
            params.push(ParamType {
                ty: TypeInfo::decode(reader)?,
                by_ref,
            });
        }

        Ok(Self {
            return_type,
            params,
            variadic,
        })
    }

    /// Encode the signature payload read by [`FunctionSignature::decode`]
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.params.len() as u8);
        if self.variadic {
            out.push(cb::VARIADIC);
        }
        self.return_type.encode(out);
        for param in &self.params {
            if param.by_ref {
                out.push(cb::BY_REF);
            }
            param.ty.encode(out);
        }
    }

    /// Whether the return value is a fixed array that the caller must allocate
    pub fn returns_fixed_array(&self) -> bool {
        matches!(self.return_type.kind, TypeKind::FixedArray { .. })
    }
}

impl std::fmt::Display for FunctionSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}(", self.return_type)?;
        for (index, param) in self.params.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            if param.by_ref {
                f.write_str("&")?;
            }
            write!(f, "{}", param.ty)?;
            if self.variadic && index + 1 == self.params.len() {
                f.write_str("...")?;
            }
        }
        f.write_str(")")
    }
}

fn peek(reader: &ByteReader<'_>) -> Result<u8, DecodeError> {
    reader.clone().read_u8()
}

/// Split a type id into its kind and payload
fn split_type_id(type_id: u32) -> (u32, u32) {
    (
        type_id & TYPE_ID_KIND_MASK,
        type_id >> TYPE_ID_PAYLOAD_SHIFT,
    )
}

/// Decode a 32-bit type id
pub fn decode_type_id(type_id: u32, rtti_data: Option<&[u8]>) -> Result<TypeInfo, RttiError> {
    let (kind, payload) = split_type_id(type_id);
    match kind {
        TYPE_ID_INLINE => {
            let bytes = payload.to_le_bytes();
            TypeInfo::decode(&mut ByteReader::new(&bytes))
        }
        TYPE_ID_COMPLEX => {
            let data = rtti_data.ok_or(RttiError::NoTypeData)?;
            TypeInfo::decode(&mut ByteReader::at(data, payload as usize))
        }
        other => Err(RttiError::UnknownTypeIdKind(other)),
    }
}

/// Build a type id for `ty`, inlining the encoding when it fits in 28 bits
/// and otherwise appending it to `rtti_data`
pub fn encode_type_id(ty: &TypeInfo, rtti_data: &mut Vec<u8>) -> u32 {
    let mut bytes = Vec::new();
    ty.encode(&mut bytes);
    // The top nibble of the fourth byte is lost to the kind field
    let fits = bytes.len() < 4 || (bytes.len() == 4 && bytes[3] < 0x10);
    if fits {
        let mut word = [0u8; 4];
        word[..bytes.len()].copy_from_slice(&bytes);
        (u32::from_le_bytes(word) << TYPE_ID_PAYLOAD_SHIFT) | TYPE_ID_INLINE
    } else {
        let offset = rtti_data.len() as u32;
        rtti_data.extend_from_slice(&bytes);
        (offset << TYPE_ID_PAYLOAD_SHIFT) | TYPE_ID_COMPLEX
    }
}

/// Decode the signature payload at `offset` in `rtti.data`
pub fn decode_signature(rtti_data: &[u8], offset: u32) -> Result<FunctionSignature, RttiError> {
    FunctionSignature::decode(&mut ByteReader::at(rtti_data, offset as usize))
}

/// Decode a typeset: a varint member count followed by member types
pub fn decode_typeset(rtti_data: &[u8], offset: u32) -> Result<Vec<TypeInfo>, RttiError> {
    let mut reader = ByteReader::at(rtti_data, offset as usize);
    let count = reader.read_varint()?;
    (0..count).map(|_| TypeInfo::decode(&mut reader)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_bytes(bytes: &[u8]) -> Result<TypeInfo, RttiError> {
        TypeInfo::decode(&mut ByteReader::new(bytes))
    }

    #[test]
    fn test_decode_scalars() {
        assert_eq!(decode_bytes(&[cb::INT32]).unwrap().kind, TypeKind::Int32);
        assert_eq!(decode_bytes(&[cb::FLOAT32]).unwrap().kind, TypeKind::Float32);
        let ty = decode_bytes(&[cb::CONST, cb::BOOL]).unwrap();
        assert!(ty.is_const);
        assert_eq!(ty.kind, TypeKind::Bool);
    }

    #[test]
    fn test_decode_nested_array() {
        // char[3][200]
        let bytes = [cb::FIXED_ARRAY, 3, cb::FIXED_ARRAY, 0xC8, 0x01, cb::CHAR8];
        let ty = decode_bytes(&bytes).unwrap();
        assert_eq!(
            ty,
            TypeInfo::fixed_array(TypeInfo::fixed_array(TypeInfo::new(TypeKind::Char8), 200), 3)
        );
        assert_eq!(ty.byte_size(), Some(600));
        assert_eq!(ty.cell_size(), Some(150));
    }

    #[test]
    fn test_sizes() {
        assert_eq!(TypeInfo::new(TypeKind::Int32).byte_size(), Some(4));
        assert_eq!(TypeInfo::new(TypeKind::Char8).cell_size(), Some(1));
        assert_eq!(TypeInfo::array(TypeInfo::new(TypeKind::Int32)).byte_size(), None);
        assert_eq!(TypeInfo::new(TypeKind::EnumStruct(0)).cell_size(), None);
        let string = TypeInfo::fixed_array(TypeInfo::new(TypeKind::Char8), 6);
        assert_eq!(string.cell_size(), Some(2));
        assert!(string.is_string());
    }

    #[test]
    fn test_unknown_control() {
        assert_eq!(
            decode_bytes(&[cb::CONST, 0x99]),
            Err(RttiError::UnknownControl {
                byte: 0x99,
                offset: 1
            })
        );
    }

    #[test]
    fn test_signature_roundtrip() {
        let signature = FunctionSignature {
            return_type: TypeInfo::new(TypeKind::Float32),
            params: vec![
                ParamType {
                    ty: TypeInfo::new(TypeKind::Int32),
                    by_ref: true,
                },
                ParamType {
                    ty: TypeInfo::constant(TypeKind::Array(Box::new(TypeInfo::new(
                        TypeKind::Char8,
                    )))),
                    by_ref: false,
                },
                ParamType {
                    ty: TypeInfo::new(TypeKind::Any),
                    by_ref: false,
                },
            ],
            variadic: true,
        };
        let mut out = Vec::new();
        signature.encode(&mut out);
        assert_eq!(out[0], 3);
        assert_eq!(out[1], cb::VARIADIC);
        assert_eq!(decode_signature(&out, 0).unwrap(), signature);
        assert_eq!(signature.to_string(), "float(&int, const char[], any...)");
    }

    #[test]
    fn test_type_id_inline_and_complex() {
        let mut data = Vec::new();
        let int_id = encode_type_id(&TypeInfo::new(TypeKind::Int32), &mut data);
        assert_eq!(int_id & 0xf, TYPE_ID_INLINE);
        assert!(data.is_empty());
        assert_eq!(
            decode_type_id(int_id, None).unwrap().kind,
            TypeKind::Int32
        );

        let big = TypeInfo::fixed_array(
            TypeInfo::fixed_array(TypeInfo::new(TypeKind::Char8), 300),
            64,
        );
        let big_id = encode_type_id(&big, &mut data);
        assert_eq!(big_id & 0xf, TYPE_ID_COMPLEX);
        assert_eq!(decode_type_id(big_id, Some(&data)).unwrap(), big);
        assert_eq!(decode_type_id(big_id, None), Err(RttiError::NoTypeData));
    }

    #[test]
    fn test_typeset() {
        let mut out = vec![2];
        TypeInfo::new(TypeKind::Int32).encode(&mut out);
        TypeInfo::new(TypeKind::Float32).encode(&mut out);
        let members = decode_typeset(&out, 0).unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[1].kind, TypeKind::Float32);
    }
}
