//! Decoded RTTI and typed debug tables
//!
//! Each table is a [`RttiTableHeader`] followed by `row_count` rows of
//! `row_size` bytes. Rows may be larger than the fields read here, and
//! trailing bytes are ignored.

use crate::format::{rows, RttiTableHeader};
use crate::image::{FormatError, Sections, StringTable};
use crate::reader::{ByteReader, DecodeError};
use log::trace;

/// `rtti.enums` row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RttiEnum {
    /// Enum name
    pub name: String,
}

/// `rtti.methods` row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RttiMethod {
    /// Method name
    pub name: String,
    /// First code byte of the method
    pub pcode_start: u32,
    /// One past the last code byte
    pub pcode_end: u32,
    /// Offset of the signature payload in `rtti.data`
    pub signature: u32,
}

/// `rtti.natives` row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RttiNative {
    /// Native name
    pub name: String,
    /// Offset of the signature payload in `rtti.data`
    pub signature: u32,
}

/// `rtti.typedefs` row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Typedef {
    /// Typedef name
    pub name: String,
    /// Aliased type id
    pub type_id: u32,
}

/// `rtti.typesets` row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Typeset {
    /// Typeset name
    pub name: String,
    /// Offset of the member list in `rtti.data`
    pub signature: u32,
}

/// `rtti.enumstructs` row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumStruct {
    /// Enum struct name
    pub name: String,
    /// Index of the first row in `rtti.enumstruct_fields`
    pub first_field: u32,
    /// Size in cells
    pub size: u32,
}

/// `rtti.enumstruct_fields` row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumStructField {
    /// Field name
    pub name: String,
    /// Field type id
    pub type_id: u32,
    /// Offset in cells from the start of the struct
    pub offset: u32,
}

/// `rtti.classdefs` row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassDef {
    /// Class flags
    pub flags: u32,
    /// Class name
    pub name: String,
    /// Index of the first row in `rtti.fields`
    pub first_field: u32,
}

/// `rtti.fields` row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    /// Field flags
    pub flags: u16,
    /// Field name
    pub name: String,
    /// Field type id
    pub type_id: u32,
}

/// `.dbg.globals` / `.dbg.locals` row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugVar {
    /// Data address (globals) or frame offset (locals)
    pub address: i32,
    /// Scope class
    pub vclass: u8,
    /// Variable name
    pub name: String,
    /// First code address where the variable is live
    pub code_start: u32,
    /// One past the last code address where the variable is live
    pub code_end: u32,
    /// Type id
    pub type_id: u32,
}

/// `.dbg.methods` row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugMethod {
    /// Index into `rtti.methods`
    pub method_index: u32,
    /// Index of the first row in `.dbg.locals`
    pub first_local: u32,
}

/// Every RTTI table of an image; absent tables are empty
#[derive(Debug, Clone, Default)]
pub struct RttiTables {
    /// `rtti.enums`
    pub enums: Vec<RttiEnum>,
    /// `rtti.methods`
    pub methods: Vec<RttiMethod>,
    /// `rtti.natives`
    pub natives: Vec<RttiNative>,
    /// `rtti.typedefs`
    pub typedefs: Vec<Typedef>,
    /// `rtti.typesets`
    pub typesets: Vec<Typeset>,
    /// `rtti.enumstructs`
    pub enum_structs: Vec<EnumStruct>,
    /// `rtti.enumstruct_fields`
    pub enum_struct_fields: Vec<EnumStructField>,
    /// `rtti.classdefs`
    pub classdefs: Vec<ClassDef>,
    /// `rtti.fields`
    pub fields: Vec<Field>,
    /// `.dbg.globals`
    pub globals: Vec<DebugVar>,
    /// `.dbg.locals`
    pub locals: Vec<DebugVar>,
    /// `.dbg.methods`
    pub debug_methods: Vec<DebugMethod>,
}

/// Tables that cannot be decoded without another table
const DEPENDENCIES: &[(&str, &str)] = &[
    ("rtti.enumstruct_fields", "rtti.enumstructs"),
    ("rtti.fields", "rtti.classdefs"),
    (".dbg.methods", "rtti.methods"),
    (".dbg.locals", ".dbg.methods"),
];

impl RttiTables {
    /// Decode every RTTI table present in `sections`
    pub(crate) fn load(sections: &Sections<'_>, names: &StringTable) -> Result<Self, FormatError> {
        for (section, requires) in DEPENDENCIES {
            if sections.get(section).is_some() && sections.get(requires).is_none() {
                return Err(FormatError::MissingDependency {
                    section: (*section).to_string(),
                    requires: (*requires).to_string(),
                });
            }
        }

        let tables = Self {
            enums: load_table(sections, "rtti.enums", rows::ENUM, |r| {
                Ok(RttiEnum {
                    name: names.resolve(r.read_u32()?)?,
                })
            })?,
            methods: load_table(sections, "rtti.methods", rows::METHOD, |r| {
                Ok(RttiMethod {
                    name: names.resolve(r.read_u32()?)?,
                    pcode_start: r.read_u32()?,
                    pcode_end: r.read_u32()?,
                    signature: r.read_u32()?,
                })
            })?,
            natives: load_table(sections, "rtti.natives", rows::NATIVE, |r| {
                Ok(RttiNative {
                    name: names.resolve(r.read_u32()?)?,
                    signature: r.read_u32()?,
                })
            })?,
            typedefs: load_table(sections, "rtti.typedefs", rows::TYPEDEF, |r| {
                Ok(Typedef {
                    name: names.resolve(r.read_u32()?)?,
                    type_id: r.read_u32()?,
                })
            })?,
            typesets: load_table(sections, "rtti.typesets", rows::TYPESET, |r| {
                Ok(Typeset {
                    name: names.resolve(r.read_u32()?)?,
                    signature: r.read_u32()?,
                })
            })?,
            enum_structs: load_table(sections, "rtti.enumstructs", rows::ENUM_STRUCT, |r| {
                Ok(EnumStruct {
                    name: names.resolve(r.read_u32()?)?,
                    first_field: r.read_u32()?,
                    size: r.read_u32()?,
                })
            })?,
            enum_struct_fields: load_table(
                sections,
                "rtti.enumstruct_fields",
                rows::ENUM_STRUCT_FIELD,
                |r| {
                    Ok(EnumStructField {
                        name: names.resolve(r.read_u32()?)?,
                        type_id: r.read_u32()?,
                        offset: r.read_u32()?,
                    })
                },
            )?,
            classdefs: load_table(sections, "rtti.classdefs", rows::CLASSDEF, |r| {
                Ok(ClassDef {
                    flags: r.read_u32()?,
                    name: names.resolve(r.read_u32()?)?,
                    first_field: r.read_u32()?,
                })
            })?,
            fields: load_table(sections, "rtti.fields", rows::FIELD, |r| {
                Ok(Field {
                    flags: r.read_u16()?,
                    name: names.resolve(r.read_u32()?)?,
                    type_id: r.read_u32()?,
                })
            })?,
            globals: load_table(sections, ".dbg.globals", rows::DEBUG_VAR, |r| {
                read_debug_var(r, names)
            })?,
            locals: load_table(sections, ".dbg.locals", rows::DEBUG_VAR, |r| {
                read_debug_var(r, names)
            })?,
            debug_methods: load_table(sections, ".dbg.methods", rows::DEBUG_METHOD, |r| {
                Ok(DebugMethod {
                    method_index: r.read_u32()?,
                    first_local: r.read_u32()?,
                })
            })?,
        };

        for method in &tables.debug_methods {
            if method.method_index as usize >= tables.methods.len() {
                return Err(FormatError::Corrupt(format!(
                    ".dbg.methods references method {} of {}",
                    method.method_index,
                    tables.methods.len()
                )));
            }
        }

        Ok(tables)
    }

    /// Find the method whose code range contains `addr`
    pub fn method_at(&self, addr: u32) -> Option<(usize, &RttiMethod)> {
        self.methods
            .iter()
            .enumerate()
            .find(|(_, m)| m.pcode_start <= addr && addr < m.pcode_end)
    }

    /// Fields of enum struct `index`
    pub fn enum_struct_fields_of(&self, index: usize) -> &[EnumStructField] {
        let Some(es) = self.enum_structs.get(index) else {
            return &[];
        };
        let start = es.first_field as usize;
        let end = self
            .enum_structs
            .get(index + 1)
            .map_or(self.enum_struct_fields.len(), |next| next.first_field as usize);
        self.enum_struct_fields.get(start..end).unwrap_or(&[])
    }

    /// Locals declared by row `debug_method` of `.dbg.methods`
    pub fn locals_of(&self, debug_method: usize) -> &[DebugVar] {
        let Some(method) = self.debug_methods.get(debug_method) else {
            return &[];
        };
        let start = method.first_local as usize;
        let end = self
            .debug_methods
            .get(debug_method + 1)
            .map_or(self.locals.len(), |next| next.first_local as usize);
        self.locals.get(start..end).unwrap_or(&[])
    }
}

fn read_debug_var(r: &mut ByteReader<'_>, names: &StringTable) -> Result<DebugVar, FormatError> {
    Ok(DebugVar {
        address: r.read_i32()?,
        vclass: r.read_u8()?,
        name: names.resolve(r.read_u32()?)?,
        code_start: r.read_u32()?,
        code_end: r.read_u32()?,
        type_id: r.read_u32()?,
    })
}

fn load_table<T>(
    sections: &Sections<'_>,
    name: &str,
    min_row_size: u32,
    mut read_row: impl FnMut(&mut ByteReader<'_>) -> Result<T, FormatError>,
) -> Result<Vec<T>, FormatError> {
    let Some(bytes) = sections.get(name) else {
        return Ok(Vec::new());
    };
    let truncated = |_: DecodeError| FormatError::TruncatedSection(name.to_string());

    let header = RttiTableHeader::read(&mut ByteReader::new(bytes)).map_err(truncated)?;
    if header.row_size < min_row_size || (header.header_size as usize) < RttiTableHeader::SIZE {
        return Err(FormatError::Corrupt(format!(
            "{name}: row size {} below {min_row_size}",
            header.row_size
        )));
    }
    let end = u64::from(header.header_size)
        + u64::from(header.row_size) * u64::from(header.row_count);
    if end > bytes.len() as u64 {
        return Err(FormatError::TruncatedSection(name.to_string()));
    }

    let mut out = Vec::with_capacity(header.row_count as usize);
    for row in 0..header.row_count {
        let offset = header.header_size as usize + (row * header.row_size) as usize;
        out.push(read_row(&mut ByteReader::at(bytes, offset))?);
    }
    trace!("decoded {} rows from {name}", out.len());
    Ok(out)
}
