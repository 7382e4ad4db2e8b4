//! Native function boundary
//!
//! Natives are host functions called from bytecode through `sysreq`
//! instructions. The image lists native names in a table; the instruction
//! carries a position in that table and the Machine binds the position to a
//! registered callable by name.
//!
//! Two registration styles exist:
//! - [`NativeRegistry::register`] hands the raw parameter block to the
//!   callable ([`NativeParams`]).
//! - [`NativeRegistry::register_typed`] declares a [`NativeSignature`] once;
//!   arguments are decoded into [`NativeArg`] values before every call.

mod context;
mod handles;

pub use context::NativeContext;
pub use handles::{CloseFn, HandleError, HandleTable, INVALID_HANDLE};

use crate::error::NativeError;
use rustc_hash::FxHashMap;
use smx_bytecode::Cell;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Raw native callable
pub type NativeFn =
    Arc<dyn Fn(&mut NativeContext<'_>, &NativeParams) -> Result<Cell, NativeError> + Send + Sync>;

/// Parameter block passed to a native
///
/// In plugin memory the block is the argument count followed by the
/// argument cells. `base` is the VM address of the count cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeParams {
    /// VM address of the count cell
    pub base: Cell,
    /// Argument cells in declaration order
    pub args: Vec<Cell>,
}

impl NativeParams {
    /// Number of arguments
    pub fn count(&self) -> usize {
        self.args.len()
    }

    /// Argument cells
    pub fn args(&self) -> &[Cell] {
        &self.args
    }

    /// Argument `index`, if passed
    pub fn get(&self, index: usize) -> Option<Cell> {
        self.args.get(index).copied()
    }

    /// Argument `index` as a cell
    pub fn cell(&self, index: usize) -> Result<Cell, NativeError> {
        self.get(index)
            .ok_or_else(|| NativeError::invalid_argument(index, "missing argument"))
    }

    /// Argument `index` reinterpreted as a binary32 float
    pub fn float(&self, index: usize) -> Result<f32, NativeError> {
        self.cell(index).map(|cell| f32::from_bits(cell as u32))
    }

    /// Argument `index` as a boolean
    pub fn bool(&self, index: usize) -> Result<bool, NativeError> {
        self.cell(index).map(|cell| cell != 0)
    }
}

/// Declared kind of a native parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKind {
    /// Plain cell (`int`, `any`)
    Cell,
    /// Boolean cell
    Bool,
    /// Binary32 float cell
    Float,
    /// Address of a NUL-terminated string, decoded before the call
    String,
    /// Address of a cell written back by the native
    CellRef,
    /// Address of a float written back by the native
    FloatRef,
    /// Address of a cell array
    Array,
    /// Opaque handle id
    Handle,
    /// Remaining arguments, by address
    Variadic,
}

impl ParamKind {
    /// Source-level spelling
    pub fn name(self) -> &'static str {
        match self {
            ParamKind::Cell => "int",
            ParamKind::Bool => "bool",
            ParamKind::Float => "float",
            ParamKind::String => "string",
            ParamKind::CellRef => "&int",
            ParamKind::FloatRef => "&float",
            ParamKind::Array => "array",
            ParamKind::Handle => "handle",
            ParamKind::Variadic => "...",
        }
    }
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Malformed native signature
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid native signature '{signature}': {reason}")]
pub struct SignatureError {
    /// Signature text
    pub signature: String,
    /// What is wrong with it
    pub reason: String,
}

impl FromStr for ParamKind {
    type Err = SignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s.trim() {
            "int" | "any" | "cell" | "char" => ParamKind::Cell,
            "bool" => ParamKind::Bool,
            "float" => ParamKind::Float,
            "string" | "char[]" => ParamKind::String,
            "&int" | "int&" | "&any" | "&bool" => ParamKind::CellRef,
            "&float" | "float&" => ParamKind::FloatRef,
            "array" | "int[]" | "any[]" | "float[]" => ParamKind::Array,
            "handle" | "Handle" => ParamKind::Handle,
            "..." | "any..." => ParamKind::Variadic,
            other => {
                return Err(SignatureError {
                    signature: s.to_string(),
                    reason: format!("unknown parameter kind '{other}'"),
                })
            }
        };
        Ok(kind)
    }
}

/// Fixed parameter list of a typed native
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NativeSignature {
    params: Vec<ParamKind>,
}

impl NativeSignature {
    /// Build from parameter kinds; a variadic kind must come last
    pub fn new(params: Vec<ParamKind>) -> Result<Self, SignatureError> {
        if let Some(pos) = params.iter().position(|&k| k == ParamKind::Variadic) {
            if pos + 1 != params.len() {
                return Err(SignatureError {
                    signature: params
                        .iter()
                        .map(|k| k.name())
                        .collect::<Vec<_>>()
                        .join(", "),
                    reason: "variadic parameter must be last".into(),
                });
            }
        }
        Ok(Self { params })
    }

    /// Parse a comma separated list such as `"string, &int, ..."`
    pub fn parse(text: &str) -> Result<Self, SignatureError> {
        let params = text
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                part.parse::<ParamKind>().map_err(|err| SignatureError {
                    signature: text.to_string(),
                    reason: err.reason,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(params)
    }

    /// Declared kinds
    pub fn params(&self) -> &[ParamKind] {
        &self.params
    }

    /// Check if the last parameter is variadic
    pub fn is_variadic(&self) -> bool {
        self.params.last() == Some(&ParamKind::Variadic)
    }

    /// Decode raw argument cells according to this signature
    pub fn decode(
        &self,
        ctx: &NativeContext<'_>,
        params: &NativeParams,
    ) -> Result<Vec<NativeArg>, NativeError> {
        let mut args = Vec::with_capacity(self.params.len());
        for (index, kind) in self.params.iter().enumerate() {
            let arg = match kind {
                ParamKind::Variadic => {
                    let rest = params.args.get(index..).unwrap_or_default();
                    args.push(NativeArg::Variadic(rest.to_vec()));
                    break;
                }
                ParamKind::Cell => NativeArg::Cell(params.cell(index)?),
                ParamKind::Bool => NativeArg::Bool(params.bool(index)?),
                ParamKind::Float => NativeArg::Float(params.float(index)?),
                ParamKind::String => NativeArg::String(ctx.read_string(params.cell(index)?)?),
                ParamKind::CellRef => NativeArg::CellRef(params.cell(index)?),
                ParamKind::FloatRef => NativeArg::FloatRef(params.cell(index)?),
                ParamKind::Array => NativeArg::Array(params.cell(index)?),
                ParamKind::Handle => NativeArg::Handle(params.cell(index)?),
            };
            args.push(arg);
        }
        Ok(args)
    }
}

impl fmt::Display for NativeSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, kind) in self.params.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{kind}")?;
        }
        Ok(())
    }
}

/// Decoded argument of a typed native
#[derive(Debug, Clone, PartialEq)]
pub enum NativeArg {
    /// Plain cell
    Cell(Cell),
    /// Boolean
    Bool(bool),
    /// Float
    Float(f32),
    /// String read from plugin memory
    String(String),
    /// Address of a by-reference cell
    CellRef(Cell),
    /// Address of a by-reference float
    FloatRef(Cell),
    /// Address of a cell array
    Array(Cell),
    /// Handle id
    Handle(i32),
    /// Addresses of the variadic tail
    Variadic(Vec<Cell>),
}

impl NativeArg {
    /// Cell payload of scalar and address kinds
    pub fn as_cell(&self) -> Option<Cell> {
        match self {
            NativeArg::Cell(v)
            | NativeArg::CellRef(v)
            | NativeArg::FloatRef(v)
            | NativeArg::Array(v)
            | NativeArg::Handle(v) => Some(*v),
            NativeArg::Bool(v) => Some(Cell::from(*v)),
            NativeArg::Float(v) => Some(v.to_bits() as Cell),
            NativeArg::String(_) | NativeArg::Variadic(_) => None,
        }
    }

    /// Float payload
    pub fn as_float(&self) -> Option<f32> {
        match self {
            NativeArg::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// String payload
    pub fn as_str(&self) -> Option<&str> {
        match self {
            NativeArg::String(v) => Some(v),
            _ => None,
        }
    }
}

/// A registered native
pub struct NativeEntry {
    /// Name the image refers to
    pub name: String,
    /// Callable
    pub func: NativeFn,
    /// Declared signature of typed natives
    pub signature: Option<NativeSignature>,
}

impl fmt::Debug for NativeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeEntry")
            .field("name", &self.name)
            .field("signature", &self.signature)
            .finish()
    }
}

/// Flat name to native map
///
/// Entries are reference counted so that the Machine can hold on to the
/// callable while the registry is extended from inside a native.
#[derive(Clone, Default)]
pub struct NativeRegistry {
    entries: FxHashMap<String, Arc<NativeEntry>>,
}

impl fmt::Debug for NativeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeRegistry")
            .field("count", &self.entries.len())
            .finish()
    }
}

impl NativeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a raw native, replacing any previous entry of that name
    pub fn register(
        &mut self,
        name: &str,
        func: impl Fn(&mut NativeContext<'_>, &NativeParams) -> Result<Cell, NativeError>
            + Send
            + Sync
            + 'static,
    ) {
        self.insert(NativeEntry {
            name: name.to_string(),
            func: Arc::new(func),
            signature: None,
        });
    }

    /// Register a native whose arguments are decoded through `signature`
    pub fn register_typed(
        &mut self,
        name: &str,
        signature: NativeSignature,
        func: impl Fn(&mut NativeContext<'_>, &[NativeArg]) -> Result<Cell, NativeError>
            + Send
            + Sync
            + 'static,
    ) {
        let decoder = signature.clone();
        let func: NativeFn = Arc::new(move |ctx: &mut NativeContext<'_>, params: &NativeParams| {
            let args = decoder.decode(ctx, params)?;
            func(ctx, &args)
        });
        self.insert(NativeEntry {
            name: name.to_string(),
            func,
            signature: Some(signature),
        });
    }

    fn insert(&mut self, entry: NativeEntry) {
        if self.entries.contains_key(&entry.name) {
            log::debug!("replacing native '{}'", entry.name);
        }
        self.entries.insert(entry.name.clone(), Arc::new(entry));
    }

    /// Look up a native by name
    pub fn get(&self, name: &str) -> Option<Arc<NativeEntry>> {
        self.entries.get(name).cloned()
    }

    /// Check if a native is registered
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Remove a native
    pub fn unregister(&mut self, name: &str) -> bool {
        self.entries.remove(name).is_some()
    }

    /// Get the number of registered natives
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered names in sorted order
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_register_and_get() {
        let mut registry = NativeRegistry::new();
        registry.register("FloatAbs", |_ctx, params| {
            Ok(params.float(0)?.abs().to_bits() as Cell)
        });

        assert!(registry.contains("FloatAbs"));
        assert!(!registry.contains("SquareRoot"));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("FloatAbs").unwrap().signature.is_none());
        assert!(registry.unregister("FloatAbs"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_signature_parse() {
        let sig = NativeSignature::parse("string, &int, float, ...").unwrap();
        assert_eq!(
            sig.params(),
            &[
                ParamKind::String,
                ParamKind::CellRef,
                ParamKind::Float,
                ParamKind::Variadic
            ]
        );
        assert!(sig.is_variadic());
        assert_eq!(sig.to_string(), "string, &int, float, ...");
        assert_eq!(NativeSignature::parse("").unwrap().params().len(), 0);
    }

    #[test]
    fn test_signature_errors() {
        assert!(NativeSignature::parse("int, vector").is_err());
        let err = NativeSignature::parse("..., int").unwrap_err();
        assert!(err.reason.contains("last"));
    }

    #[test]
    fn test_params_accessors() {
        let params = NativeParams {
            base: 100,
            args: vec![3, 1.5f32.to_bits() as Cell, 0],
        };
        assert_eq!(params.count(), 3);
        assert_eq!(params.cell(0).unwrap(), 3);
        assert_eq!(params.float(1).unwrap(), 1.5);
        assert!(!params.bool(2).unwrap());
        assert!(matches!(
            params.cell(3),
            Err(NativeError::InvalidArgument { index: 3, .. })
        ));
    }
}
