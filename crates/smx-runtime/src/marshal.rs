//! Typed argument marshalling
//!
//! Turns host [`Value`]s into a [`ParamList`] by matching them positionally
//! against a function signature, and turns the raw result back into a
//! [`Value`].

use crate::error::CallError;
use crate::param::ParamList;
use smx_bytecode::rtti::{interpret_value, FunctionSignature, ParamType, TypeInfo, TypeKind};
use smx_bytecode::{Cell, MemoryView, RttiError, Value};

/// Parameters of one typed call
#[derive(Debug)]
pub(crate) struct Marshalled {
    pub params: ParamList,
    /// Buffer receiving a fixed-array return value, outside the counted arguments
    pub return_buffer: Option<ParamList>,
}

struct Marshaller<'a> {
    function: &'a str,
    params: ParamList,
}

impl<'a> Marshaller<'a> {
    fn type_error(&self, index: usize, expected: &TypeInfo, value: &Value) -> CallError {
        CallError::ArgumentType {
            function: self.function.to_string(),
            index,
            expected: expected.to_string(),
            actual: value.kind_name(),
        }
    }

    fn scalar(&self, index: usize, ty: &TypeInfo, value: &Value) -> Result<Cell, CallError> {
        scalar_cell(ty, value).ok_or_else(|| self.type_error(index, ty, value))
    }

    fn typed(&mut self, index: usize, param: &ParamType, value: &Value) -> Result<(), CallError> {
        let ty = &param.ty;
        let copy_back = !ty.is_const;

        if ty.is_string() {
            let bytes = match value {
                Value::String(text) => text.as_bytes(),
                Value::Bytes(bytes) => bytes.as_slice(),
                _ => return Err(self.type_error(index, ty, value)),
            };
            let size = match ty.kind {
                TypeKind::FixedArray { len, .. } => len,
                _ => bytes.len() as u32 + 1,
            };
            self.params.push_string_ex(bytes, size, copy_back);
            return Ok(());
        }

        if ty.is_array() {
            let Value::Array(items) = value else {
                return Err(self.type_error(index, ty, value));
            };
            let element = ty.element().cloned().unwrap_or_else(|| TypeInfo::new(TypeKind::Any));
            if element.is_array() {
                return Err(self.type_error(index, ty, value));
            }
            let cells = items
                .iter()
                .map(|item| self.scalar(index, &element, item))
                .collect::<Result<Vec<_>, _>>()?;
            let size = match ty.kind {
                TypeKind::FixedArray { len, .. } if cells.len() as u32 > len => {
                    return Err(self.type_error(index, ty, value));
                }
                TypeKind::FixedArray { len, .. } => len,
                _ => cells.len() as u32,
            };
            self.params.push_array_ex(&cells, size, copy_back);
            return Ok(());
        }

        let cell = self.scalar(index, ty, value)?;
        let is_float = ty.kind == TypeKind::Float32;
        match (param.by_ref, is_float) {
            (true, true) => self.params.push_float_ref(f32::from_bits(cell as u32)),
            (true, false) => self.params.push_cell_ref(cell),
            (false, true) => self.params.push_float(f32::from_bits(cell as u32)),
            (false, false) => self.params.push_cell(cell),
        };
        Ok(())
    }

    /// Untyped and variadic arguments: scalars as cells, buffers read-only
    fn untyped(&mut self, index: usize, value: &Value) -> Result<(), CallError> {
        match value {
            Value::Float(f) => {
                self.params.push_float(*f);
            }
            Value::String(text) => {
                self.params.push_string(text);
            }
            Value::Bytes(bytes) => {
                self.params
                    .push_string_ex(bytes, bytes.len() as u32 + 1, false);
            }
            Value::Array(items) => {
                let cells = items
                    .iter()
                    .map(|item| {
                        item.to_cell()
                            .ok_or_else(|| self.type_error(index, &TypeInfo::new(TypeKind::Any), item))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                self.params.push_array(&cells, false);
            }
            scalar => {
                let cell = scalar
                    .to_cell()
                    .ok_or_else(|| self.type_error(index, &TypeInfo::new(TypeKind::Any), scalar))?;
                self.params.push_cell(cell);
            }
        }
        Ok(())
    }
}

/// Encode a scalar value for a parameter of type `ty`
fn scalar_cell(ty: &TypeInfo, value: &Value) -> Option<Cell> {
    match (&ty.kind, value) {
        (TypeKind::Float32, Value::Float(f)) => Some(f.to_bits() as Cell),
        (TypeKind::Float32, Value::Int(i)) => Some((*i as f32).to_bits() as Cell),
        (TypeKind::Float32, _) => None,
        (TypeKind::Bool, Value::Bool(_) | Value::Int(_)) => value.as_int().map(|v| Cell::from(v != 0)),
        (TypeKind::Bool, _) => None,
        (TypeKind::Any, _) => value.to_cell(),
        (TypeKind::Void, _) => None,
        (_, Value::Int(_) | Value::Bool(_) | Value::Handle(_)) => value.as_int(),
        _ => None,
    }
}

/// Build the parameter list for a call to `function` with `signature`
pub(crate) fn marshal_typed(
    function: &str,
    signature: &FunctionSignature,
    args: &[Value],
) -> Result<Marshalled, CallError> {
    let fixed = if signature.variadic {
        signature.params.len().saturating_sub(1)
    } else {
        signature.params.len()
    };
    let count_ok = if signature.variadic {
        args.len() >= fixed
    } else {
        args.len() == fixed
    };
    if !count_ok {
        return Err(CallError::ArgumentCount {
            function: function.to_string(),
            expected: fixed,
            actual: args.len(),
        });
    }

    let mut marshaller = Marshaller {
        function,
        params: ParamList::new(),
    };
    for (index, (param, value)) in signature.params.iter().zip(args).take(fixed).enumerate() {
        marshaller.typed(index, param, value)?;
    }
    for (index, value) in args.iter().enumerate().skip(fixed) {
        marshaller.untyped(index, value)?;
    }

    let return_buffer = signature
        .returns_fixed_array()
        .then(|| fixed_array_buffer(&signature.return_type));

    Ok(Marshalled {
        params: marshaller.params,
        return_buffer,
    })
}

/// Build the parameter list for a function without type information
pub(crate) fn marshal_untyped(function: &str, args: &[Value]) -> Result<Marshalled, CallError> {
    let mut marshaller = Marshaller {
        function,
        params: ParamList::new(),
    };
    for (index, value) in args.iter().enumerate() {
        marshaller.untyped(index, value)?;
    }
    Ok(Marshalled {
        params: marshaller.params,
        return_buffer: None,
    })
}

/// Copy-back buffer sized for a fixed-array return type
fn fixed_array_buffer(ty: &TypeInfo) -> ParamList {
    let mut buffer = ParamList::new();
    if let TypeKind::FixedArray { inner, len } = &ty.kind {
        if inner.kind == TypeKind::Char8 {
            buffer.push_string_ex(b"", *len, true);
        } else {
            buffer.push_array_ex(&[], *len, true);
        }
    }
    buffer
}

/// Interpret the raw `PRI` value of a call returning `ty`
pub(crate) fn return_value(
    ty: &TypeInfo,
    raw: Cell,
    memory: &dyn MemoryView,
) -> Result<Value, RttiError> {
    match ty.kind {
        // Size unknown to the caller: hand out the address
        TypeKind::Array(_) | TypeKind::EnumStruct(_) => Ok(Value::Int(raw)),
        _ => interpret_value(ty, raw, memory, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::ParamKind;

    fn signature(params: Vec<ParamType>, variadic: bool) -> FunctionSignature {
        FunctionSignature {
            return_type: TypeInfo::new(TypeKind::Int32),
            params,
            variadic,
        }
    }

    fn param(kind: TypeKind, by_ref: bool) -> ParamType {
        ParamType {
            ty: TypeInfo::new(kind),
            by_ref,
        }
    }

    #[test]
    fn test_scalar_kinds() {
        let sig = signature(
            vec![
                param(TypeKind::Int32, false),
                param(TypeKind::Float32, false),
                param(TypeKind::Int32, true),
                param(TypeKind::Float32, true),
            ],
            false,
        );
        let args = [
            Value::Int(1),
            Value::Float(2.0),
            Value::Int(3),
            Value::Int(4),
        ];
        let marshalled = marshal_typed("f", &sig, &args).unwrap();
        let kinds: Vec<ParamKind> = marshalled.params.params().iter().map(|p| p.kind).collect();
        assert_eq!(
            kinds,
            [
                ParamKind::Cell,
                ParamKind::Float,
                ParamKind::CellRef,
                ParamKind::FloatRef
            ]
        );
        assert!(marshalled.return_buffer.is_none());
    }

    #[test]
    fn test_string_sizes() {
        let sig = signature(
            vec![
                ParamType {
                    ty: TypeInfo::fixed_array(TypeInfo::new(TypeKind::Char8), 16),
                    by_ref: false,
                },
                ParamType {
                    ty: TypeInfo::constant(TypeKind::Array(Box::new(TypeInfo::new(
                        TypeKind::Char8,
                    )))),
                    by_ref: false,
                },
            ],
            false,
        );
        let args = [Value::from("abc"), Value::from("hello")];
        let marshalled = marshal_typed("f", &sig, &args).unwrap();
        let params = marshalled.params.params();
        assert_eq!((params[0].size, params[0].copy_back), (16, true));
        assert_eq!((params[1].size, params[1].copy_back), (6, false));
    }

    #[test]
    fn test_argument_errors() {
        let sig = signature(vec![param(TypeKind::Float32, false)], false);
        assert!(matches!(
            marshal_typed("f", &sig, &[]),
            Err(CallError::ArgumentCount { expected: 1, actual: 0, .. })
        ));
        assert!(matches!(
            marshal_typed("f", &sig, &[Value::from("x")]),
            Err(CallError::ArgumentType { index: 0, actual: "string", .. })
        ));
    }

    #[test]
    fn test_variadic_tail() {
        let sig = signature(
            vec![param(TypeKind::Int32, false), param(TypeKind::Any, true)],
            true,
        );
        let args = [Value::Int(1), Value::Int(2), Value::Float(3.0)];
        let marshalled = marshal_typed("f", &sig, &args).unwrap();
        let kinds: Vec<ParamKind> = marshalled.params.params().iter().map(|p| p.kind).collect();
        assert_eq!(kinds, [ParamKind::Cell, ParamKind::Cell, ParamKind::Float]);
    }

    #[test]
    fn test_fixed_array_return_buffer_is_separate() {
        let sig = FunctionSignature {
            return_type: TypeInfo::fixed_array(TypeInfo::new(TypeKind::Int32), 3),
            params: vec![param(TypeKind::Int32, false)],
            variadic: false,
        };
        let marshalled = marshal_typed("f", &sig, &[Value::Int(1)]).unwrap();
        assert_eq!(marshalled.params.len(), 1);
        let buffer = marshalled.return_buffer.unwrap();
        let hidden = &buffer.params()[0];
        assert_eq!((hidden.kind, hidden.size, hidden.copy_back), (ParamKind::Array, 3, true));
    }
}
