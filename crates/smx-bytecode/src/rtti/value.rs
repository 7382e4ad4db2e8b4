//! Host-level values and their interpretation from machine memory

use super::{RttiError, TypeInfo, TypeKind};
use crate::format::{Cell, CELL_SIZE};
use std::fmt;

/// Read access to machine memory by VM address
///
/// Implemented by the machine's memory so that typed values can be decoded
/// without this crate depending on the interpreter.
pub trait MemoryView {
    /// Read the cell at `addr`
    fn read_cell(&self, addr: Cell) -> Option<Cell>;

    /// Borrow `len` bytes starting at `addr`
    fn read_bytes(&self, addr: Cell, len: usize) -> Option<&[u8]>;
}

/// A typed value exchanged with the host
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// No value
    Void,
    /// Boolean
    Bool(bool),
    /// Integer cell (also chars, enums and `any`)
    Int(i32),
    /// Binary32 float
    Float(f32),
    /// Character array
    String(String),
    /// Cell array
    Array(Vec<Value>),
    /// Opaque handle id
    Handle(i32),
    /// Raw bytes, pushed like a string without UTF-8 interpretation
    Bytes(Vec<u8>),
}

impl Value {
    /// Encode a scalar value as a cell; floats keep their bit pattern
    pub fn to_cell(&self) -> Option<Cell> {
        match self {
            Value::Void => Some(0),
            Value::Bool(value) => Some(Cell::from(*value)),
            Value::Int(value) | Value::Handle(value) => Some(*value),
            Value::Float(value) => Some(value.to_bits() as Cell),
            Value::String(_) | Value::Array(_) | Value::Bytes(_) => None,
        }
    }

    /// Integer payload, if any
    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(value) | Value::Handle(value) => Some(*value),
            Value::Bool(value) => Some(i32::from(*value)),
            _ => None,
        }
    }

    /// Float payload, if any
    pub fn as_float(&self) -> Option<f32> {
        match self {
            Value::Float(value) => Some(*value),
            _ => None,
        }
    }

    /// String payload, if any
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(value) => Some(value),
            _ => None,
        }
    }

    /// Short name of the variant, used in diagnostics
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Void => "void",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Handle(_) => "handle",
            Value::Bytes(_) => "bytes",
        }
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value)
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::Array(value)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Void => f.write_str("void"),
            Value::Bool(value) => write!(f, "{value}"),
            Value::Int(value) => write!(f, "{value}"),
            Value::Float(value) => write!(f, "{value:?}"),
            Value::String(value) => write!(f, "{value:?}"),
            Value::Handle(value) => write!(f, "handle#{value}"),
            Value::Bytes(bytes) => write!(f, "{bytes:02x?}"),
            Value::Array(items) => {
                f.write_str("[")?;
                for (index, item) in items.iter().enumerate() {
                    if index > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

/// Interpret a raw cell as a value of type `ty`
///
/// Scalars are decoded from `raw` directly. For arrays `raw` is the VM
/// address of the first element and `size` overrides the element count
/// (bytes for character arrays); dynamic arrays require it.
pub fn interpret_value(
    ty: &TypeInfo,
    raw: Cell,
    memory: &dyn MemoryView,
    size: Option<u32>,
) -> Result<Value, RttiError> {
    match &ty.kind {
        TypeKind::Void => Ok(Value::Void),
        TypeKind::Bool => Ok(Value::Bool(raw != 0)),
        TypeKind::Int32
        | TypeKind::Char8
        | TypeKind::Any
        | TypeKind::Enum(_)
        | TypeKind::Typedef(_)
        | TypeKind::Typeset(_)
        | TypeKind::TopFunction => Ok(Value::Int(raw)),
        TypeKind::Float32 => Ok(Value::Float(f32::from_bits(raw as u32))),
        TypeKind::Classdef(_) => Ok(Value::Handle(raw)),
        TypeKind::Function(signature) => {
            interpret_value(&signature.return_type, raw, memory, size)
        }
        TypeKind::FixedArray { inner, len } => {
            interpret_array(inner, raw, memory, size.unwrap_or(*len))
        }
        TypeKind::Array(inner) => {
            let count = size.ok_or_else(|| RttiError::SizeRequired(ty.to_string()))?;
            interpret_array(inner, raw, memory, count)
        }
        TypeKind::EnumStruct(_) => {
            let count = size.ok_or_else(|| RttiError::SizeRequired(ty.to_string()))?;
            let cells = (0..count)
                .map(|index| read_cell(memory, element_addr(raw, index)?).map(Value::Int))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Array(cells))
        }
    }
}

fn interpret_array(
    inner: &TypeInfo,
    addr: Cell,
    memory: &dyn MemoryView,
    count: u32,
) -> Result<Value, RttiError> {
    if inner.kind == TypeKind::Char8 {
        let bytes = memory
            .read_bytes(addr, count as usize)
            .ok_or(RttiError::InvalidAddress(addr))?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        return Ok(Value::String(
            String::from_utf8_lossy(&bytes[..end]).into_owned(),
        ));
    }

    let mut items = Vec::with_capacity(count as usize);
    for index in 0..count {
        let slot = element_addr(addr, index)?;
        let cell = read_cell(memory, slot)?;
        let item = if inner.is_array() {
            // Sub-arrays are reached through a relative indirection cell
            let sub = slot
                .checked_add(cell)
                .ok_or(RttiError::InvalidAddress(slot))?;
            interpret_value(inner, sub, memory, None)?
        } else {
            interpret_value(inner, cell, memory, None)?
        };
        items.push(item);
    }
    Ok(Value::Array(items))
}

fn element_addr(base: Cell, index: u32) -> Result<Cell, RttiError> {
    (index as Cell)
        .checked_mul(CELL_SIZE as Cell)
        .and_then(|offset| base.checked_add(offset))
        .ok_or(RttiError::InvalidAddress(base))
}

fn read_cell(memory: &dyn MemoryView, addr: Cell) -> Result<Cell, RttiError> {
    memory.read_cell(addr).ok_or(RttiError::InvalidAddress(addr))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Flat(Vec<u8>);

    impl MemoryView for Flat {
        fn read_cell(&self, addr: Cell) -> Option<Cell> {
            let bytes = self.read_bytes(addr, 4)?;
            Some(Cell::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        }

        fn read_bytes(&self, addr: Cell, len: usize) -> Option<&[u8]> {
            let start = usize::try_from(addr).ok()?;
            self.0.get(start..start.checked_add(len)?)
        }
    }

    fn cells(values: &[i32]) -> Flat {
        Flat(values.iter().flat_map(|v| v.to_le_bytes()).collect())
    }

    #[test]
    fn test_scalar_roundtrip() {
        let memory = Flat(Vec::new());
        let cases = [
            (TypeKind::Int32, Value::Int(0)),
            (TypeKind::Int32, Value::Int(-1)),
            (TypeKind::Int32, Value::Int(i32::MAX)),
            (TypeKind::Int32, Value::Int(i32::MIN)),
            (TypeKind::Bool, Value::Bool(true)),
            (TypeKind::Float32, Value::Float(0.0)),
            (TypeKind::Float32, Value::Float(3.14)),
        ];
        for (kind, value) in cases {
            let raw = value.to_cell().unwrap();
            let ty = TypeInfo::new(kind);
            assert_eq!(interpret_value(&ty, raw, &memory, None).unwrap(), value);
        }
    }

    #[test]
    fn test_float_bits_preserved() {
        let memory = Flat(Vec::new());
        let ty = TypeInfo::new(TypeKind::Float32);
        for bits in [0x8000_0000u32, 0x4048_F5C3, 0x7FC0_1234] {
            let value = interpret_value(&ty, bits as Cell, &memory, None).unwrap();
            let Value::Float(f) = value else {
                panic!("expected float");
            };
            assert_eq!(f.to_bits(), bits);
            assert_eq!(Value::Float(f).to_cell(), Some(bits as Cell));
        }
    }

    #[test]
    fn test_string_truncates_at_nul() {
        let memory = Flat(b"hi\0xyz\0".to_vec());
        let ty = TypeInfo::fixed_array(TypeInfo::new(TypeKind::Char8), 7);
        assert_eq!(
            interpret_value(&ty, 0, &memory, None).unwrap(),
            Value::String("hi".into())
        );
        assert_eq!(
            interpret_value(&ty, 3, &memory, Some(3)).unwrap(),
            Value::String("xyz".into())
        );
    }

    #[test]
    fn test_dynamic_array_requires_size() {
        let memory = cells(&[1, 2, 3]);
        let ty = TypeInfo::array(TypeInfo::new(TypeKind::Int32));
        assert!(matches!(
            interpret_value(&ty, 0, &memory, None),
            Err(RttiError::SizeRequired(_))
        ));
        assert_eq!(
            interpret_value(&ty, 4, &memory, Some(2)).unwrap(),
            Value::Array(vec![Value::Int(2), Value::Int(3)])
        );
    }

    #[test]
    fn test_two_dimensional_array() {
        // Indirection vector of two cells followed by two rows of two cells
        let memory = cells(&[8, 12, 1, 2, 3, 4]);
        let ty = TypeInfo::fixed_array(
            TypeInfo::fixed_array(TypeInfo::new(TypeKind::Int32), 2),
            2,
        );
        assert_eq!(
            interpret_value(&ty, 0, &memory, None).unwrap(),
            Value::Array(vec![
                Value::Array(vec![Value::Int(1), Value::Int(2)]),
                Value::Array(vec![Value::Int(3), Value::Int(4)]),
            ])
        );
    }

    #[test]
    fn test_out_of_range() {
        let memory = cells(&[1]);
        let ty = TypeInfo::fixed_array(TypeInfo::new(TypeKind::Int32), 4);
        assert_eq!(
            interpret_value(&ty, 0, &memory, None),
            Err(RttiError::InvalidAddress(4))
        );
    }
}
