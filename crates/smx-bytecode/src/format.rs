//! Fixed-layout records of the plugin image format
//!
//! All multi-byte integers are little-endian and records are packed (no
//! padding). Offsets stored inside section records are relative to the start
//! of the owning section; the loader resolves them against the image base.

use crate::reader::{ByteReader, DecodeError};

/// The machine word
pub type Cell = i32;

/// Size of a [`Cell`] in bytes
pub const CELL_SIZE: u32 = 4;

/// Magic number at offset 0 ("FFPS" little-endian)
pub const FILE_MAGIC: u32 = 0x5350_4646;

/// First supported file format version
pub const FILE_VERSION_MIN: u16 = 0x0101;
/// Newest file format version understood by the loader
pub const FILE_VERSION_MAX: u16 = 0x0107;
/// File version that is never accepted
pub const FILE_VERSION_ALWAYS_REJECT: u16 = 0x01FF;

/// Oldest accepted code version
pub const CODE_VERSION_MINIMUM: u8 = 9;
/// Code version introducing the feature mask field
pub const CODE_VERSION_FEATURE_MASK: u8 = 13;
/// Newest code version understood by the interpreter
pub const CODE_VERSION_CURRENT: u8 = 13;
/// Code version that is never accepted
pub const CODE_VERSION_ALWAYS_REJECT: u8 = 0x7F;

/// Code flag: the image carries debug tables
pub const CODEFLAG_DEBUG: u16 = 0x0001;

/// Section name of the symbol string table
pub const NAMES_SECTION: &str = ".names";

/// Compression method stored in the file header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// Payload stored verbatim
    None,
    /// Payload compressed with zlib (deflate)
    Zlib,
}

impl Compression {
    /// Decode the header byte
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Compression::None),
            1 => Some(Compression::Zlib),
            _ => None,
        }
    }

    /// Encode to the header byte
    pub fn to_u8(self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Zlib => 1,
        }
    }
}

/// File header at offset 0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    /// Magic number, must equal [`FILE_MAGIC`]
    pub magic: u32,
    /// File format version
    pub version: u16,
    /// Raw compression byte
    pub compression: u8,
    /// Size of the file on disk
    pub disk_size: u32,
    /// Size of the decompressed image
    pub image_size: u32,
    /// Number of section table entries
    pub section_count: u8,
    /// Offset of the section-name string table
    pub string_table: u32,
    /// Offset where the (possibly compressed) payload starts
    pub data_offset: u32,
}

impl FileHeader {
    /// Encoded size in bytes
    pub const SIZE: usize = 24;

    /// Decode the header
    pub fn read(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            magic: reader.read_u32()?,
            version: reader.read_u16()?,
            compression: reader.read_u8()?,
            disk_size: reader.read_u32()?,
            image_size: reader.read_u32()?,
            section_count: reader.read_u8()?,
            string_table: reader.read_u32()?,
            data_offset: reader.read_u32()?,
        })
    }

    /// Encode the header
    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.magic.to_le_bytes());
        out.extend_from_slice(&self.version.to_le_bytes());
        out.push(self.compression);
        out.extend_from_slice(&self.disk_size.to_le_bytes());
        out.extend_from_slice(&self.image_size.to_le_bytes());
        out.push(self.section_count);
        out.extend_from_slice(&self.string_table.to_le_bytes());
        out.extend_from_slice(&self.data_offset.to_le_bytes());
    }
}

/// One section table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionEntry {
    /// Offset of the name within the header string table
    pub name_offset: u32,
    /// Offset of the section data within the image
    pub data_offset: u32,
    /// Size of the section data
    pub size: u32,
}

impl SectionEntry {
    /// Encoded size in bytes
    pub const SIZE: usize = 12;

    /// Decode an entry
    pub fn read(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            name_offset: reader.read_u32()?,
            data_offset: reader.read_u32()?,
            size: reader.read_u32()?,
        })
    }
}

/// `.code` section header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeHeader {
    /// Size of the code in bytes
    pub code_size: u32,
    /// Cell size in bytes, must be [`CELL_SIZE`]
    pub cell_size: u8,
    /// Code version
    pub code_version: u8,
    /// Code flags (`CODEFLAG_*`)
    pub flags: u16,
    /// Entry point, 0 when absent
    pub main: u32,
    /// Offset of the code bytes relative to the section
    pub code: u32,
    /// Feature mask, only present for newer code versions
    pub features: u32,
}

impl CodeHeader {
    /// Size of the record without the feature mask
    pub const BASE_SIZE: usize = 16;

    /// Decode the record; the feature mask is read when the version carries one
    pub fn read(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        let code_size = reader.read_u32()?;
        let cell_size = reader.read_u8()?;
        let code_version = reader.read_u8()?;
        let flags = reader.read_u16()?;
        let main = reader.read_u32()?;
        let code = reader.read_u32()?;
        let features = if code_version >= CODE_VERSION_FEATURE_MASK {
            reader.read_u32()?
        } else {
            0
        };
        Ok(Self {
            code_size,
            cell_size,
            code_version,
            flags,
            main,
            code,
            features,
        })
    }
}

/// `.data` section header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    /// Bytes of initialized data
    pub data_size: u32,
    /// Total memory required, including heap and stack
    pub mem_size: u32,
    /// Offset of the data bytes relative to the section
    pub data: u32,
}

impl DataHeader {
    /// Encoded size in bytes
    pub const SIZE: usize = 12;

    /// Decode the record
    pub fn read(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            data_size: reader.read_u32()?,
            mem_size: reader.read_u32()?,
            data: reader.read_u32()?,
        })
    }
}

/// An (address or id, name offset) pair used by `.publics`, `.pubvars` and `.tags`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamedEntry {
    /// Code address, data address or tag id
    pub value: u32,
    /// Offset into `.names`
    pub name: u32,
}

impl NamedEntry {
    /// Encoded size in bytes
    pub const SIZE: usize = 8;

    /// Decode the record
    pub fn read(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            value: reader.read_u32()?,
            name: reader.read_u32()?,
        })
    }
}

/// Header shared by every RTTI table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RttiTableHeader {
    /// Size of this header, rows start after it
    pub header_size: u32,
    /// Size of one row
    pub row_size: u32,
    /// Number of rows
    pub row_count: u32,
}

impl RttiTableHeader {
    /// Encoded size in bytes
    pub const SIZE: usize = 12;

    /// Decode the record
    pub fn read(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            header_size: reader.read_u32()?,
            row_size: reader.read_u32()?,
            row_count: reader.read_u32()?,
        })
    }
}

/// Row sizes of the RTTI tables
pub mod rows {
    /// `rtti.enums`: name, three reserved words
    pub const ENUM: u32 = 16;
    /// `rtti.methods`: name, pcode start, pcode end, signature
    pub const METHOD: u32 = 16;
    /// `rtti.natives`: name, signature
    pub const NATIVE: u32 = 8;
    /// `rtti.typedefs`: name, type id
    pub const TYPEDEF: u32 = 8;
    /// `rtti.typesets`: name, signature
    pub const TYPESET: u32 = 8;
    /// `rtti.enumstructs`: name, first field, size
    pub const ENUM_STRUCT: u32 = 12;
    /// `rtti.enumstruct_fields`: name, type id, offset
    pub const ENUM_STRUCT_FIELD: u32 = 12;
    /// `rtti.classdefs`: flags, name, first field, four reserved words
    pub const CLASSDEF: u32 = 28;
    /// `rtti.fields`: flags (u16), name, type id
    pub const FIELD: u32 = 10;
    /// `.dbg.globals` / `.dbg.locals`
    pub const DEBUG_VAR: u32 = 21;
    /// `.dbg.methods`: method index, first local
    pub const DEBUG_METHOD: u32 = 8;
}

/// Rounds `bytes` up to a whole number of cells
pub fn align_to_cell(bytes: u32) -> u32 {
    bytes.div_ceil(CELL_SIZE) * CELL_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = FileHeader {
            magic: FILE_MAGIC,
            version: FILE_VERSION_MAX,
            compression: 1,
            disk_size: 100,
            image_size: 200,
            section_count: 3,
            string_table: 60,
            data_offset: 80,
        };
        let mut out = Vec::new();
        header.write(&mut out);
        assert_eq!(out.len(), FileHeader::SIZE);
        assert_eq!(FileHeader::read(&mut ByteReader::new(&out)).unwrap(), header);
    }

    #[test]
    fn test_code_header_without_features() {
        let mut out = Vec::new();
        out.extend_from_slice(&8u32.to_le_bytes());
        out.push(4);
        out.push(10);
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&16u32.to_le_bytes());
        let header = CodeHeader::read(&mut ByteReader::new(&out)).unwrap();
        assert_eq!(header.code_version, 10);
        assert_eq!(header.features, 0);
        assert_eq!(header.code, 16);
    }

    #[test]
    fn test_align_to_cell() {
        assert_eq!(align_to_cell(0), 0);
        assert_eq!(align_to_cell(1), 4);
        assert_eq!(align_to_cell(4), 4);
        assert_eq!(align_to_cell(6), 8);
    }
}
