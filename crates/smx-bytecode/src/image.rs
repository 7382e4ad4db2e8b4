//! Plugin image loader
//!
//! [`PluginImage::load`] validates and decodes a raw image into an immutable
//! in-memory form. Loading either produces a complete image or an error;
//! there is no partially loaded state.

use crate::debug::DebugInfo;
use crate::format::{
    CodeHeader, Compression, DataHeader, FileHeader, NamedEntry, SectionEntry, CELL_SIZE,
    CODEFLAG_DEBUG, CODE_VERSION_ALWAYS_REJECT, CODE_VERSION_CURRENT, CODE_VERSION_MINIMUM,
    FILE_MAGIC, FILE_VERSION_ALWAYS_REJECT, FILE_VERSION_MAX, FILE_VERSION_MIN, NAMES_SECTION,
};
use crate::reader::{cstr_at, ByteReader, DecodeError};
use crate::rtti::{self, FunctionSignature, RttiError, RttiMethod, RttiTables};
use flate2::read::ZlibDecoder;
use log::{debug, trace, warn};
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::io::Read;
use std::ops::Range;
use thiserror::Error;

/// Name of the public variable holding plugin metadata
pub const MYINFO: &str = "myinfo";

/// Errors raised while loading an image
#[derive(Debug, Error)]
pub enum FormatError {
    /// Raw read failed
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// The magic number does not match
    #[error("Bad magic number {0:#010x}")]
    BadMagic(u32),

    /// File version below the supported minimum
    #[error("File version {0:#06x} is too old")]
    TooOld(u16),

    /// File version newer than this loader understands
    #[error("File version {0:#06x} is too new")]
    TooNew(u16),

    /// File version that is never accepted
    #[error("File version {0:#06x} is rejected")]
    Rejected(u16),

    /// Unknown compression method
    #[error("Unknown compression method {0}")]
    UnknownCompression(u8),

    /// Structurally invalid image
    #[error("Corrupt image: {0}")]
    Corrupt(String),

    /// A mandatory section is absent
    #[error("Missing section {0}")]
    MissingSection(&'static str),

    /// A section extends past the end of the image
    #[error("Section {0} is truncated")]
    TruncatedSection(String),

    /// A table is present without the table it depends on
    #[error("Section {section} requires {requires}")]
    MissingDependency {
        /// The dependent section
        section: String,
        /// The absent section
        requires: String,
    },

    /// Code version below the supported minimum
    #[error("Code version {0} is too old")]
    CodeTooOld(u8),

    /// Code version newer than this interpreter understands
    #[error("Code version {0} is too new")]
    CodeTooNew(u8),

    /// Code version that is never accepted
    #[error("Code version {0} is rejected")]
    CodeRejected(u8),

    /// The debug flag is set but debug tables are missing or empty
    #[error("Image is flagged as debug but its debug tables are incomplete")]
    IncompleteDebugInfo,

    /// A name offset does not point at a string
    #[error("Invalid name offset {0:#x}")]
    InvalidName(u32),
}

/// Strings of a names section, keyed by their byte offset
#[derive(Debug, Clone, Default)]
pub struct StringTable {
    bytes: Vec<u8>,
    strings: FxHashMap<u32, String>,
}

impl StringTable {
    /// Scan `bytes` for NUL-terminated runs
    pub fn new(bytes: &[u8]) -> Self {
        let mut strings = FxHashMap::default();
        let mut start = 0usize;
        for (index, &byte) in bytes.iter().enumerate() {
            if byte == 0 {
                let text = String::from_utf8_lossy(&bytes[start..index]).into_owned();
                strings.insert(start as u32, text);
                start = index + 1;
            }
        }
        Self {
            bytes: bytes.to_vec(),
            strings,
        }
    }

    /// String starting exactly at `offset`
    pub fn get(&self, offset: u32) -> Option<&str> {
        self.strings.get(&offset).map(String::as_str)
    }

    /// Resolve a name offset, including offsets into the middle of a run
    pub fn resolve(&self, offset: u32) -> Result<String, FormatError> {
        if let Some(name) = self.get(offset) {
            return Ok(name.to_string());
        }
        cstr_at(&self.bytes, offset as usize).map_err(|_| FormatError::InvalidName(offset))
    }

    /// Number of strings found by the scan
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

/// A section of the image
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SectionInfo {
    /// Section name
    pub name: String,
    /// Offset within the image
    pub offset: u32,
    /// Size in bytes
    pub size: u32,
}

impl SectionInfo {
    fn range(&self) -> Range<usize> {
        self.offset as usize..(self.offset as usize + self.size as usize)
    }
}

/// Section lookup used while decoding
pub(crate) struct Sections<'a> {
    base: &'a [u8],
    entries: &'a [SectionInfo],
}

impl<'a> Sections<'a> {
    pub(crate) fn get(&self, name: &str) -> Option<&'a [u8]> {
        self.entries
            .iter()
            .find(|s| s.name == name)
            .map(|s| &self.base[s.range()])
    }
}

/// An exported function
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Public {
    /// Code address of the function
    pub address: u32,
    /// Index in the public table
    pub id: u32,
    /// Exported name
    pub name: String,
}

impl Public {
    /// Whether the name marks a compiler-generated inline function
    pub fn is_inline(&self) -> bool {
        self.name.starts_with('.')
    }
}

/// An exported variable
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PubVar {
    /// Data address of the variable
    pub address: u32,
    /// Exported name
    pub name: String,
}

/// A legacy type tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tag {
    /// Tag id
    pub id: u32,
    /// Tag name
    pub name: String,
}

/// Plugin metadata read from the `myinfo` public variable
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PluginInfo {
    /// Plugin name
    pub name: String,
    /// Author
    pub author: String,
    /// Description
    pub description: String,
    /// Version string
    pub version: String,
    /// Homepage
    pub url: String,
}

/// A loaded plugin image
#[derive(Debug, Clone)]
pub struct PluginImage {
    base: Vec<u8>,
    header: FileHeader,
    sections: Vec<SectionInfo>,
    code_header: CodeHeader,
    code: Range<usize>,
    data_header: DataHeader,
    data: Range<usize>,
    rtti_data: Option<Range<usize>>,
    names: StringTable,
    publics: Vec<Public>,
    public_index: FxHashMap<String, usize>,
    inlines: FxHashMap<String, usize>,
    pubvars: Vec<PubVar>,
    natives: Vec<String>,
    tags: Vec<Tag>,
    info: Option<PluginInfo>,
    debug: Option<DebugInfo>,
    rtti: RttiTables,
}

impl PluginImage {
    /// Validate and decode an image
    pub fn load(bytes: &[u8]) -> Result<Self, FormatError> {
        let header = FileHeader::read(&mut ByteReader::new(bytes))?;
        check_file_header(&header)?;

        let base = decompress(bytes, &header)?;
        debug!(
            "image v{:#06x}: {} bytes, {} sections",
            header.version,
            base.len(),
            header.section_count
        );

        let sections = read_section_table(&base, &header)?;
        let lookup = Sections {
            base: &base,
            entries: &sections,
        };

        let names = lookup
            .get(NAMES_SECTION)
            .map(StringTable::new)
            .ok_or(FormatError::MissingSection(NAMES_SECTION))?;

        let code_section = find_section(&sections, ".code")?;
        let (code_header, code) = read_code(&base, code_section)?;
        let data_section = find_section(&sections, ".data")?;
        let (data_header, data) = read_data(&base, data_section)?;
        let code_size = code_header.code_size;

        let publics = read_named(&lookup, ".publics", &names)?
            .into_iter()
            .enumerate()
            .map(|(id, entry)| {
                check_code_addr(entry.0, code_size, &entry.1)?;
                Ok(Public {
                    address: entry.0,
                    id: id as u32,
                    name: entry.1,
                })
            })
            .collect::<Result<Vec<_>, FormatError>>()?;
        let public_index = publics
            .iter()
            .enumerate()
            .map(|(index, p)| (p.name.clone(), index))
            .collect();
        let inlines = publics
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_inline())
            .map(|(index, p)| (p.name.clone(), index))
            .collect();

        let pubvars = read_named(&lookup, ".pubvars", &names)?
            .into_iter()
            .map(|(address, name)| {
                if address >= data_header.data_size {
                    return Err(FormatError::Corrupt(format!(
                        "pubvar {name} outside data ({address:#x})"
                    )));
                }
                Ok(PubVar { address, name })
            })
            .collect::<Result<Vec<_>, FormatError>>()?;
        let tags: Vec<Tag> = read_named(&lookup, ".tags", &names)?
            .into_iter()
            .map(|(id, name)| Tag { id, name })
            .collect();
        let natives = read_natives(&lookup, &names)?;

        let debug = DebugInfo::load(&lookup, &names)?;
        if code_header.flags & CODEFLAG_DEBUG != 0
            && !debug.as_ref().is_some_and(DebugInfo::is_complete)
        {
            return Err(FormatError::IncompleteDebugInfo);
        }

        let rtti = RttiTables::load(&lookup, &names)?;
        let rtti_data = sections
            .iter()
            .find(|s| s.name == "rtti.data")
            .map(SectionInfo::range);

        let info = match pubvars.iter().find(|p| p.name == MYINFO) {
            Some(pubvar) => Some(read_plugin_info(&base[data.clone()], pubvar.address)?),
            None => None,
        };

        trace!(
            "{} publics, {} pubvars, {} natives, {} tags",
            publics.len(),
            pubvars.len(),
            natives.len(),
            tags.len()
        );

        Ok(Self {
            base,
            header,
            sections,
            code_header,
            code,
            data_header,
            data,
            rtti_data,
            names,
            publics,
            public_index,
            inlines,
            pubvars,
            natives,
            tags,
            info,
            debug,
            rtti,
        })
    }

    /// The decompressed image bytes
    ///
    /// The leading [`FileHeader::SIZE`] bytes are the header as read from
    /// disk, so a compressed image still reports its compression and disk
    /// size there.
    pub fn base(&self) -> &[u8] {
        &self.base
    }

    /// The file header
    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    /// The section table in file order
    pub fn sections(&self) -> &[SectionInfo] {
        &self.sections
    }

    /// Bytes of the named section
    pub fn section(&self, name: &str) -> Option<&[u8]> {
        self.sections
            .iter()
            .find(|s| s.name == name)
            .map(|s| &self.base[s.range()])
    }

    /// Executable code
    pub fn code(&self) -> &[u8] {
        &self.base[self.code.clone()]
    }

    /// Code version
    pub fn code_version(&self) -> u8 {
        self.code_header.code_version
    }

    /// Code flags (`CODEFLAG_*`)
    pub fn code_flags(&self) -> u16 {
        self.code_header.flags
    }

    /// Code feature mask
    pub fn features(&self) -> u32 {
        self.code_header.features
    }

    /// Entry point, 0 when absent
    pub fn main(&self) -> u32 {
        self.code_header.main
    }

    /// Initial data segment
    pub fn data(&self) -> &[u8] {
        &self.base[self.data.clone()]
    }

    /// Size of the initialized data segment
    pub fn data_size(&self) -> u32 {
        self.data_header.data_size
    }

    /// Total memory required, including heap and stack
    pub fn mem_size(&self) -> u32 {
        self.data_header.mem_size
    }

    /// The `.names` string table
    pub fn names(&self) -> &StringTable {
        &self.names
    }

    /// Exported functions in table order
    pub fn publics(&self) -> &[Public] {
        &self.publics
    }

    /// Exported function by id
    pub fn public(&self, id: u32) -> Option<&Public> {
        self.publics.get(id as usize)
    }

    /// Exported function by name
    pub fn find_public(&self, name: &str) -> Option<&Public> {
        self.public_index.get(name).map(|&index| &self.publics[index])
    }

    /// Inline function by name
    pub fn find_inline(&self, name: &str) -> Option<&Public> {
        self.inlines.get(name).map(|&index| &self.publics[index])
    }

    /// Exported variables
    pub fn pubvars(&self) -> &[PubVar] {
        &self.pubvars
    }

    /// Exported variable by name
    pub fn find_pubvar(&self, name: &str) -> Option<&PubVar> {
        self.pubvars.iter().find(|p| p.name == name)
    }

    /// Native names; the position is the index used by native calls
    pub fn natives(&self) -> &[String] {
        &self.natives
    }

    /// Native name by index
    pub fn native(&self, index: u32) -> Option<&str> {
        self.natives.get(index as usize).map(String::as_str)
    }

    /// Native index by name
    pub fn find_native(&self, name: &str) -> Option<u32> {
        self.natives
            .iter()
            .position(|n| n == name)
            .map(|index| index as u32)
    }

    /// Legacy tags
    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    /// Plugin metadata, when the image exports `myinfo`
    pub fn info(&self) -> Option<&PluginInfo> {
        self.info.as_ref()
    }

    /// Debug tables
    pub fn debug(&self) -> Option<&DebugInfo> {
        self.debug.as_ref()
    }

    /// RTTI tables
    pub fn rtti(&self) -> &RttiTables {
        &self.rtti
    }

    /// The `rtti.data` blob
    pub fn rtti_data(&self) -> Option<&[u8]> {
        self.rtti_data.clone().map(|range| &self.base[range])
    }

    /// RTTI method whose code range contains `addr`
    pub fn find_method_by_addr(&self, addr: u32) -> Option<&RttiMethod> {
        self.rtti.method_at(addr).map(|(_, method)| method)
    }

    /// Typed signature of an exported function, if the image carries one
    pub fn method_signature(&self, public: &Public) -> Result<Option<FunctionSignature>, RttiError> {
        let method = self
            .rtti
            .methods
            .iter()
            .find(|m| m.pcode_start == public.address)
            .or_else(|| self.rtti.methods.iter().find(|m| m.name == public.name));
        let Some(method) = method else {
            return Ok(None);
        };
        let data = self.rtti_data().ok_or(RttiError::NoTypeData)?;
        rtti::decode_signature(data, method.signature).map(Some)
    }

    /// Typed signature of native `index`, if the image carries one
    pub fn native_signature(&self, index: u32) -> Result<Option<FunctionSignature>, RttiError> {
        let Some(name) = self.native(index) else {
            return Ok(None);
        };
        let Some(native) = self.rtti.natives.iter().find(|n| n.name == name) else {
            return Ok(None);
        };
        let data = self.rtti_data().ok_or(RttiError::NoTypeData)?;
        rtti::decode_signature(data, native.signature).map(Some)
    }

    /// Source file containing code address `addr`
    pub fn lookup_file(&self, addr: u32) -> Option<&str> {
        self.debug.as_ref()?.lookup_file(addr)
    }

    /// Source line containing code address `addr`
    pub fn lookup_line(&self, addr: u32) -> Option<u32> {
        self.debug.as_ref()?.lookup_line(addr)
    }

    /// Name of the function containing code address `addr`
    ///
    /// Debug symbols are consulted first, then RTTI methods, then the
    /// nearest public at or below `addr`.
    pub fn lookup_function(&self, addr: u32) -> Option<&str> {
        if let Some(symbol) = self.debug.as_ref().and_then(|d| d.lookup_function(addr)) {
            return Some(symbol.name.as_str());
        }
        if let Some(method) = self.find_method_by_addr(addr) {
            return Some(method.name.as_str());
        }
        self.publics
            .iter()
            .filter(|p| p.address <= addr)
            .max_by_key(|p| p.address)
            .map(|p| p.name.as_str())
    }
}

fn check_file_header(header: &FileHeader) -> Result<(), FormatError> {
    if header.magic != FILE_MAGIC {
        return Err(FormatError::BadMagic(header.magic));
    }
    match header.version {
        v if v < FILE_VERSION_MIN => Err(FormatError::TooOld(v)),
        FILE_VERSION_ALWAYS_REJECT => Err(FormatError::Rejected(header.version)),
        v if v > FILE_VERSION_MAX => Err(FormatError::TooNew(v)),
        _ => Ok(()),
    }
}

fn decompress(bytes: &[u8], header: &FileHeader) -> Result<Vec<u8>, FormatError> {
    let image_size = header.image_size as usize;
    let compression = Compression::from_u8(header.compression)
        .ok_or(FormatError::UnknownCompression(header.compression))?;

    match compression {
        Compression::None => {
            if bytes.len() < image_size || image_size < FileHeader::SIZE {
                return Err(FormatError::Corrupt(format!(
                    "image size {image_size} but {} bytes available",
                    bytes.len()
                )));
            }
            Ok(bytes[..image_size].to_vec())
        }
        Compression::Zlib => {
            let payload = header.data_offset as usize;
            if payload < FileHeader::SIZE || payload > bytes.len() || payload > image_size {
                return Err(FormatError::Corrupt(format!(
                    "payload offset {payload} out of range"
                )));
            }
            let mut base = Vec::with_capacity(image_size);
            base.extend_from_slice(&bytes[..payload]);
            let limit = (image_size - payload) as u64 + 1;
            ZlibDecoder::new(&bytes[payload..])
                .take(limit)
                .read_to_end(&mut base)
                .map_err(|err| FormatError::Corrupt(format!("inflate failed: {err}")))?;
            if base.len() != image_size {
                return Err(FormatError::Corrupt(format!(
                    "inflated to {} bytes, expected {image_size}",
                    base.len()
                )));
            }
            Ok(base)
        }
    }
}

fn read_section_table(base: &[u8], header: &FileHeader) -> Result<Vec<SectionInfo>, FormatError> {
    let mut reader = ByteReader::at(base, FileHeader::SIZE);
    let mut sections = Vec::with_capacity(header.section_count as usize);
    for _ in 0..header.section_count {
        let entry = SectionEntry::read(&mut reader)?;
        let name_offset = (header.string_table as usize)
            .checked_add(entry.name_offset as usize)
            .ok_or(FormatError::InvalidName(entry.name_offset))?;
        let name =
            cstr_at(base, name_offset).map_err(|_| FormatError::InvalidName(entry.name_offset))?;
        let end = u64::from(entry.data_offset) + u64::from(entry.size);
        if end > base.len() as u64 {
            return Err(FormatError::TruncatedSection(name));
        }
        trace!(
            "section {name} at {:#x} ({} bytes)",
            entry.data_offset,
            entry.size
        );
        sections.push(SectionInfo {
            name,
            offset: entry.data_offset,
            size: entry.size,
        });
    }
    Ok(sections)
}

fn find_section<'a>(
    sections: &'a [SectionInfo],
    name: &'static str,
) -> Result<&'a SectionInfo, FormatError> {
    sections
        .iter()
        .find(|s| s.name == name)
        .ok_or(FormatError::MissingSection(name))
}

/// Resolve a section-relative byte range, checking it lies inside the section
fn sub_range(
    section: &SectionInfo,
    offset: u32,
    size: u32,
) -> Result<Range<usize>, FormatError> {
    let end = u64::from(offset) + u64::from(size);
    if end > u64::from(section.size) {
        return Err(FormatError::TruncatedSection(section.name.clone()));
    }
    let start = section.offset as usize + offset as usize;
    Ok(start..start + size as usize)
}

fn read_code(base: &[u8], section: &SectionInfo) -> Result<(CodeHeader, Range<usize>), FormatError> {
    let bytes = &base[section.range()];
    let header = CodeHeader::read(&mut ByteReader::new(bytes))
        .map_err(|_| FormatError::TruncatedSection(section.name.clone()))?;

    if u32::from(header.cell_size) != CELL_SIZE {
        return Err(FormatError::Corrupt(format!(
            "unsupported cell size {}",
            header.cell_size
        )));
    }
    match header.code_version {
        CODE_VERSION_ALWAYS_REJECT => return Err(FormatError::CodeRejected(header.code_version)),
        v if v < CODE_VERSION_MINIMUM => return Err(FormatError::CodeTooOld(v)),
        v if v > CODE_VERSION_CURRENT => return Err(FormatError::CodeTooNew(v)),
        _ => {}
    }
    if header.code_size % CELL_SIZE != 0 {
        return Err(FormatError::Corrupt(format!(
            "code size {} is not a whole number of cells",
            header.code_size
        )));
    }
    if header.main != 0 {
        check_code_addr(header.main, header.code_size, "main")?;
    }
    let range = sub_range(section, header.code, header.code_size)?;
    Ok((header, range))
}

fn read_data(base: &[u8], section: &SectionInfo) -> Result<(DataHeader, Range<usize>), FormatError> {
    let bytes = &base[section.range()];
    let header = DataHeader::read(&mut ByteReader::new(bytes))
        .map_err(|_| FormatError::TruncatedSection(section.name.clone()))?;
    if header.data_size > header.mem_size {
        return Err(FormatError::Corrupt(format!(
            "data size {} exceeds memory size {}",
            header.data_size, header.mem_size
        )));
    }
    let range = sub_range(section, header.data, header.data_size)?;
    Ok((header, range))
}

fn check_code_addr(addr: u32, code_size: u32, what: &str) -> Result<(), FormatError> {
    if addr % CELL_SIZE != 0 || addr >= code_size {
        return Err(FormatError::Corrupt(format!(
            "{what}: invalid code address {addr:#x}"
        )));
    }
    Ok(())
}

fn read_named(
    sections: &Sections<'_>,
    name: &str,
    names: &StringTable,
) -> Result<Vec<(u32, String)>, FormatError> {
    let Some(bytes) = sections.get(name) else {
        return Ok(Vec::new());
    };
    if bytes.len() % NamedEntry::SIZE != 0 {
        warn!("{name}: {} trailing bytes ignored", bytes.len() % NamedEntry::SIZE);
    }
    let mut reader = ByteReader::new(bytes);
    (0..bytes.len() / NamedEntry::SIZE)
        .map(|_| {
            let entry = NamedEntry::read(&mut reader)?;
            Ok((entry.value, names.resolve(entry.name)?))
        })
        .collect()
}

fn read_natives(sections: &Sections<'_>, names: &StringTable) -> Result<Vec<String>, FormatError> {
    let Some(bytes) = sections.get(".natives") else {
        return Ok(Vec::new());
    };
    let mut reader = ByteReader::new(bytes);
    (0..bytes.len() / 4)
        .map(|_| names.resolve(reader.read_u32()?))
        .collect()
}

fn read_plugin_info(data: &[u8], address: u32) -> Result<PluginInfo, FormatError> {
    let mut reader = ByteReader::at(data, address as usize);
    let mut field = || -> Result<String, FormatError> {
        let addr = reader
            .read_u32()
            .map_err(|_| FormatError::Corrupt("myinfo outside data".to_string()))?;
        cstr_at(data, addr as usize)
            .map_err(|_| FormatError::Corrupt(format!("myinfo string at {addr:#x}")))
    };
    Ok(PluginInfo {
        name: field()?,
        description: field()?,
        author: field()?,
        version: field()?,
        url: field()?,
    })
}
