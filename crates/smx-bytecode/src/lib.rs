//! smx plugin image format
//!
//! This crate provides the binary layout of compiled plugin images, the
//! loader that turns a raw byte buffer into an immutable [`PluginImage`],
//! the RTTI type decoder, debug tables and the instruction set.
//!
//! Images are produced by an external compiler. For tests and tooling the
//! [`builder`] module can assemble conformant images directly.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod builder;
pub mod debug;
pub mod disasm;
pub mod format;
pub mod image;
pub mod opcode;
pub mod reader;
pub mod rtti;

pub use builder::{BuildError, CodeWriter, ImageBuilder, Label};
pub use debug::{DebugInfo, DebugSymbol};
pub use disasm::{decode_instructions, DisasmError, Instruction};
pub use format::{Cell, CELL_SIZE};
pub use image::{FormatError, PluginImage, PluginInfo, PubVar, Public, SectionInfo, Tag};
pub use opcode::Opcode;
pub use reader::{ByteReader, DecodeError};
pub use rtti::{
    interpret_value, FunctionSignature, MemoryView, ParamType, RttiError, RttiTables, TypeInfo,
    TypeKind, Value,
};
