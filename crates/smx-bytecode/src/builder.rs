//! Image assembler
//!
//! [`CodeWriter`] emits instructions with forward-referencable labels and
//! [`ImageBuilder`] lays out a complete image around it. Used by tests,
//! benchmarks and tooling; it is not a compiler.

use crate::debug::IDENT_FUNCTION;
use crate::format::{
    rows, Cell, Compression, FileHeader, RttiTableHeader, CELL_SIZE, CODEFLAG_DEBUG,
    CODE_VERSION_CURRENT, CODE_VERSION_FEATURE_MASK, FILE_MAGIC, FILE_VERSION_MAX,
};
use crate::image::{PluginInfo, MYINFO};
use crate::opcode::Opcode;
use crate::rtti::FunctionSignature;
use flate2::write::ZlibEncoder;
use rustc_hash::FxHashMap;
use std::io::Write;
use thiserror::Error;

/// Errors raised while assembling an image
#[derive(Debug, Error)]
pub enum BuildError {
    /// A label was referenced but never bound
    #[error("Label {0} was never bound")]
    UnboundLabel(usize),

    /// A label was bound twice
    #[error("Label {0} bound twice")]
    Rebound(usize),

    /// Compression failed
    #[error("Compression failed: {0}")]
    Compress(#[from] std::io::Error),
}

/// A code position that may be bound after it is referenced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(usize);

/// Instruction emitter
///
/// Offset 0 always holds `halt 0`, the return target of host calls.
#[derive(Debug, Clone)]
pub struct CodeWriter {
    cells: Vec<Cell>,
    labels: Vec<Option<u32>>,
    fixups: Vec<(usize, Label)>,
}

impl Default for CodeWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeWriter {
    /// Create a writer with the `halt 0` prologue in place
    pub fn new() -> Self {
        Self {
            cells: vec![Opcode::Halt.to_cell(), 0],
            labels: Vec::new(),
            fixups: Vec::new(),
        }
    }

    /// Byte offset of the next instruction
    pub fn position(&self) -> u32 {
        self.cells.len() as u32 * CELL_SIZE
    }

    /// Emit an instruction, returning its code address
    pub fn emit(&mut self, opcode: Opcode, operands: &[Cell]) -> u32 {
        let addr = self.position();
        self.cells.push(opcode.to_cell());
        self.cells.extend_from_slice(operands);
        addr
    }

    /// Emit a raw cell
    pub fn emit_raw(&mut self, cell: Cell) {
        self.cells.push(cell);
    }

    /// Start a function: emits `proc` and returns its address
    pub fn begin_function(&mut self) -> u32 {
        self.emit(Opcode::Proc, &[])
    }

    /// Allocate an unbound label
    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind `label` to the current position
    pub fn bind(&mut self, label: Label) -> Result<(), BuildError> {
        let slot = &mut self.labels[label.0];
        if slot.is_some() {
            return Err(BuildError::Rebound(label.0));
        }
        *slot = Some(self.cells.len() as u32 * CELL_SIZE);
        Ok(())
    }

    /// Emit an instruction whose single operand is the address of `label`
    pub fn emit_label(&mut self, opcode: Opcode, label: Label) -> u32 {
        let addr = self.emit(opcode, &[0]);
        self.fixups.push((self.cells.len() - 1, label));
        addr
    }

    /// Emit a case table: default target then (value, target) pairs
    pub fn emit_casetbl(&mut self, default: Label, cases: &[(Cell, Label)]) -> u32 {
        let addr = self.emit(Opcode::Casetbl, &[cases.len() as Cell]);
        self.cells.push(0);
        self.fixups.push((self.cells.len() - 1, default));
        for &(value, target) in cases {
            self.cells.push(value);
            self.cells.push(0);
            self.fixups.push((self.cells.len() - 1, target));
        }
        addr
    }

    /// Resolve labels and produce the code bytes
    pub fn finish(mut self) -> Result<Vec<u8>, BuildError> {
        for &(slot, label) in &self.fixups {
            let addr = self.labels[label.0].ok_or(BuildError::UnboundLabel(label.0))?;
            self.cells[slot] = addr as Cell;
        }
        Ok(self.cells.iter().flat_map(|c| c.to_le_bytes()).collect())
    }
}

/// Interned NUL-terminated strings
#[derive(Debug, Clone, Default)]
struct NameTable {
    bytes: Vec<u8>,
    offsets: FxHashMap<String, u32>,
}

impl NameTable {
    fn intern(&mut self, name: &str) -> u32 {
        if let Some(&offset) = self.offsets.get(name) {
            return offset;
        }
        let offset = self.bytes.len() as u32;
        self.bytes.extend_from_slice(name.as_bytes());
        self.bytes.push(0);
        self.offsets.insert(name.to_string(), offset);
        offset
    }
}

#[derive(Debug, Clone)]
struct TypedPublic {
    name: String,
    address: u32,
    signature: FunctionSignature,
}

#[derive(Debug, Clone)]
struct DebugFunction {
    name: String,
    start: u32,
    end: u32,
}

/// Assembles a complete plugin image
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    file_version: u16,
    code_version: u8,
    compression: Compression,
    code: Vec<u8>,
    main: u32,
    data: Vec<u8>,
    heap_size: u32,
    publics: Vec<(String, u32)>,
    pubvars: Vec<(String, u32)>,
    natives: Vec<String>,
    tags: Vec<(String, u32)>,
    methods: Vec<TypedPublic>,
    native_signatures: Vec<(String, FunctionSignature)>,
    debug_flag: bool,
    debug_files: Vec<(u32, String)>,
    debug_lines: Vec<(u32, u32)>,
    debug_functions: Vec<DebugFunction>,
    raw_sections: Vec<(String, Vec<u8>)>,
    omitted: Vec<String>,
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageBuilder {
    /// Default heap and stack size in bytes
    pub const DEFAULT_HEAP_SIZE: u32 = 16 * 1024;

    /// Create an empty builder
    pub fn new() -> Self {
        Self {
            file_version: FILE_VERSION_MAX,
            code_version: CODE_VERSION_CURRENT,
            compression: Compression::None,
            code: CodeWriter::new().cells.iter().flat_map(|c| c.to_le_bytes()).collect(),
            main: 0,
            data: Vec::new(),
            heap_size: Self::DEFAULT_HEAP_SIZE,
            publics: Vec::new(),
            pubvars: Vec::new(),
            natives: Vec::new(),
            tags: Vec::new(),
            methods: Vec::new(),
            native_signatures: Vec::new(),
            debug_flag: false,
            debug_files: Vec::new(),
            debug_lines: Vec::new(),
            debug_functions: Vec::new(),
            raw_sections: Vec::new(),
            omitted: Vec::new(),
        }
    }

    /// Set the code from a writer
    pub fn code(&mut self, writer: CodeWriter) -> Result<&mut Self, BuildError> {
        self.code = writer.finish()?;
        Ok(self)
    }

    /// Set the file format version
    pub fn file_version(&mut self, version: u16) -> &mut Self {
        self.file_version = version;
        self
    }

    /// Set the code version
    pub fn code_version(&mut self, version: u8) -> &mut Self {
        self.code_version = version;
        self
    }

    /// Set the compression method
    pub fn compression(&mut self, compression: Compression) -> &mut Self {
        self.compression = compression;
        self
    }

    /// Set the entry point
    pub fn main(&mut self, addr: u32) -> &mut Self {
        self.main = addr;
        self
    }

    /// Bytes available to heap and stack beyond the data segment
    pub fn heap_size(&mut self, size: u32) -> &mut Self {
        self.heap_size = size;
        self
    }

    /// Append cell-aligned bytes to the data segment, returning their address
    pub fn add_data(&mut self, bytes: &[u8]) -> u32 {
        let addr = self.data.len() as u32;
        self.data.extend_from_slice(bytes);
        while self.data.len() % CELL_SIZE as usize != 0 {
            self.data.push(0);
        }
        addr
    }

    /// Append a NUL-terminated string to the data segment
    pub fn add_string(&mut self, text: &str) -> u32 {
        let mut bytes = text.as_bytes().to_vec();
        bytes.push(0);
        self.add_data(&bytes)
    }

    /// Append cells to the data segment
    pub fn add_cells(&mut self, cells: &[Cell]) -> u32 {
        let bytes: Vec<u8> = cells.iter().flat_map(|c| c.to_le_bytes()).collect();
        self.add_data(&bytes)
    }

    /// Export a function
    pub fn public(&mut self, name: &str, addr: u32) -> &mut Self {
        self.publics.push((name.to_string(), addr));
        self
    }

    /// Export a function together with its typed signature
    pub fn typed_public(
        &mut self,
        name: &str,
        addr: u32,
        signature: FunctionSignature,
    ) -> &mut Self {
        self.public(name, addr);
        self.methods.push(TypedPublic {
            name: name.to_string(),
            address: addr,
            signature,
        });
        self
    }

    /// Export a variable
    pub fn pubvar(&mut self, name: &str, addr: u32) -> &mut Self {
        self.pubvars.push((name.to_string(), addr));
        self
    }

    /// Import a native, returning its index
    pub fn native(&mut self, name: &str) -> u32 {
        if let Some(index) = self.natives.iter().position(|n| n == name) {
            return index as u32;
        }
        self.natives.push(name.to_string());
        self.natives.len() as u32 - 1
    }

    /// Attach a typed signature to an imported native
    pub fn native_signature(&mut self, name: &str, signature: FunctionSignature) -> &mut Self {
        self.native(name);
        self.native_signatures.push((name.to_string(), signature));
        self
    }

    /// Declare a legacy tag
    pub fn tag(&mut self, name: &str, id: u32) -> &mut Self {
        self.tags.push((name.to_string(), id));
        self
    }

    /// Store plugin metadata in a `myinfo` variable
    pub fn info(&mut self, info: &PluginInfo) -> &mut Self {
        let fields = [
            &info.name,
            &info.description,
            &info.author,
            &info.version,
            &info.url,
        ];
        let addrs: Vec<Cell> = fields.iter().map(|f| self.add_string(f) as Cell).collect();
        let record = self.add_cells(&addrs);
        self.pubvar(MYINFO, record)
    }

    /// Set or clear the debug code flag
    pub fn debug_flag(&mut self, enabled: bool) -> &mut Self {
        self.debug_flag = enabled;
        self
    }

    /// Record the source file starting at `addr`
    pub fn debug_file(&mut self, addr: u32, name: &str) -> &mut Self {
        self.debug_files.push((addr, name.to_string()));
        self
    }

    /// Record the source line starting at `addr`
    pub fn debug_line(&mut self, addr: u32, line: u32) -> &mut Self {
        self.debug_lines.push((addr, line));
        self
    }

    /// Record a function symbol spanning `start..=end`
    pub fn debug_function(&mut self, name: &str, start: u32, end: u32) -> &mut Self {
        self.debug_functions.push(DebugFunction {
            name: name.to_string(),
            start,
            end,
        });
        self
    }

    /// Add an arbitrary section
    pub fn raw_section(&mut self, name: &str, bytes: Vec<u8>) -> &mut Self {
        self.raw_sections.push((name.to_string(), bytes));
        self
    }

    /// Leave a section out of the output
    pub fn omit_section(&mut self, name: &str) -> &mut Self {
        self.omitted.push(name.to_string());
        self
    }

    /// Lay out the image
    pub fn build(&self) -> Result<Vec<u8>, BuildError> {
        let mut names = NameTable::default();
        let mut sections: Vec<(String, Vec<u8>)> = Vec::new();

        sections.push((".code".into(), self.code_section()));
        sections.push((".data".into(), self.data_section()));

        let publics = named_records(&mut names, self.publics.iter().map(|(n, v)| (n, *v)));
        sections.push((".publics".into(), publics));
        if !self.pubvars.is_empty() {
            let pubvars = named_records(&mut names, self.pubvars.iter().map(|(n, v)| (n, *v)));
            sections.push((".pubvars".into(), pubvars));
        }
        if !self.natives.is_empty() {
            let natives = self
                .natives
                .iter()
                .flat_map(|n| names.intern(n).to_le_bytes())
                .collect();
            sections.push((".natives".into(), natives));
        }
        if !self.tags.is_empty() {
            let tags = named_records(&mut names, self.tags.iter().map(|(n, v)| (n, *v)));
            sections.push((".tags".into(), tags));
        }

        if !self.methods.is_empty() || !self.native_signatures.is_empty() {
            self.rtti_sections(&mut names, &mut sections);
        }
        if !self.debug_files.is_empty()
            || !self.debug_lines.is_empty()
            || !self.debug_functions.is_empty()
        {
            self.debug_sections(&mut sections);
        }

        sections.push((".names".into(), names.bytes));
        sections.extend(self.raw_sections.iter().cloned());
        sections.retain(|(name, _)| !self.omitted.contains(name));

        self.layout(sections)
    }

    fn code_section(&self) -> Vec<u8> {
        let with_features = self.code_version >= CODE_VERSION_FEATURE_MASK;
        let header_size = if with_features { 20u32 } else { 16 };
        let flags = if self.debug_flag { CODEFLAG_DEBUG } else { 0 };

        let mut out = Vec::new();
        out.extend_from_slice(&(self.code.len() as u32).to_le_bytes());
        out.push(CELL_SIZE as u8);
        out.push(self.code_version);
        out.extend_from_slice(&flags.to_le_bytes());
        out.extend_from_slice(&self.main.to_le_bytes());
        out.extend_from_slice(&header_size.to_le_bytes());
        if with_features {
            out.extend_from_slice(&0u32.to_le_bytes());
        }
        out.extend_from_slice(&self.code);
        out
    }

    fn data_section(&self) -> Vec<u8> {
        let data_size = self.data.len() as u32;
        let mut out = Vec::new();
        out.extend_from_slice(&data_size.to_le_bytes());
        out.extend_from_slice(&(data_size + self.heap_size).to_le_bytes());
        out.extend_from_slice(&12u32.to_le_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    fn rtti_sections(&self, names: &mut NameTable, sections: &mut Vec<(String, Vec<u8>)>) {
        let mut data = Vec::new();
        let code_end = self.code.len() as u32;

        let mut methods = Vec::new();
        for method in &self.methods {
            let end = self
                .publics
                .iter()
                .map(|(_, addr)| *addr)
                .filter(|&addr| addr > method.address)
                .min()
                .unwrap_or(code_end);
            let signature = data.len() as u32;
            method.signature.encode(&mut data);
            methods.push([names.intern(&method.name), method.address, end, signature]);
        }

        let mut natives = Vec::new();
        for (name, signature) in &self.native_signatures {
            let offset = data.len() as u32;
            signature.encode(&mut data);
            natives.push([names.intern(name), offset]);
        }

        sections.push(("rtti.data".into(), data));
        if !methods.is_empty() {
            sections.push((
                "rtti.methods".into(),
                rtti_table(rows::METHOD, methods.iter().map(|row| row.as_slice())),
            ));
        }
        if !natives.is_empty() {
            sections.push((
                "rtti.natives".into(),
                rtti_table(rows::NATIVE, natives.iter().map(|row| row.as_slice())),
            ));
        }
    }

    fn debug_sections(&self, sections: &mut Vec<(String, Vec<u8>)>) {
        let mut strings = NameTable::default();

        let mut info = Vec::new();
        for count in [
            self.debug_files.len(),
            self.debug_lines.len(),
            self.debug_functions.len(),
            0,
        ] {
            info.extend_from_slice(&(count as u32).to_le_bytes());
        }

        let mut files = Vec::new();
        for (addr, name) in &self.debug_files {
            files.extend_from_slice(&addr.to_le_bytes());
            files.extend_from_slice(&strings.intern(name).to_le_bytes());
        }

        let mut lines = Vec::new();
        for (addr, line) in &self.debug_lines {
            lines.extend_from_slice(&addr.to_le_bytes());
            lines.extend_from_slice(&line.to_le_bytes());
        }

        let mut symbols = Vec::new();
        for function in &self.debug_functions {
            symbols.extend_from_slice(&(function.start as i32).to_le_bytes());
            symbols.extend_from_slice(&0i16.to_le_bytes());
            symbols.extend_from_slice(&function.start.to_le_bytes());
            symbols.extend_from_slice(&function.end.to_le_bytes());
            symbols.push(IDENT_FUNCTION);
            symbols.push(0);
            symbols.extend_from_slice(&0u16.to_le_bytes());
            symbols.extend_from_slice(&strings.intern(&function.name).to_le_bytes());
        }

        sections.push((".dbg.info".into(), info));
        sections.push((".dbg.files".into(), files));
        sections.push((".dbg.lines".into(), lines));
        sections.push((".dbg.symbols".into(), symbols));
        sections.push((".dbg.strings".into(), strings.bytes));
    }

    fn layout(&self, sections: Vec<(String, Vec<u8>)>) -> Result<Vec<u8>, BuildError> {
        let mut section_names = NameTable::default();
        let name_offsets: Vec<u32> = sections
            .iter()
            .map(|(name, _)| section_names.intern(name))
            .collect();

        let string_table = (FileHeader::SIZE + sections.len() * 12) as u32;
        let data_offset = string_table + section_names.bytes.len() as u32;

        let mut table = Vec::new();
        let mut payload = Vec::new();
        for ((_, bytes), name_offset) in sections.iter().zip(name_offsets) {
            let offset = data_offset + payload.len() as u32;
            table.extend_from_slice(&name_offset.to_le_bytes());
            table.extend_from_slice(&offset.to_le_bytes());
            table.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            payload.extend_from_slice(bytes);
        }

        let image_size = data_offset + payload.len() as u32;
        let stored = match self.compression {
            Compression::None => payload,
            Compression::Zlib => {
                let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(&payload)?;
                encoder.finish()?
            }
        };

        let header = FileHeader {
            magic: FILE_MAGIC,
            version: self.file_version,
            compression: self.compression.to_u8(),
            disk_size: data_offset + stored.len() as u32,
            image_size,
            section_count: sections.len() as u8,
            string_table,
            data_offset,
        };

        let mut out = Vec::with_capacity(header.disk_size as usize);
        header.write(&mut out);
        out.extend_from_slice(&table);
        out.extend_from_slice(&section_names.bytes);
        out.extend_from_slice(&stored);
        Ok(out)
    }
}

fn named_records<'a>(
    names: &mut NameTable,
    entries: impl Iterator<Item = (&'a String, u32)>,
) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, value) in entries {
        out.extend_from_slice(&value.to_le_bytes());
        out.extend_from_slice(&names.intern(name).to_le_bytes());
    }
    out
}

fn rtti_table<'a>(row_size: u32, rows: impl ExactSizeIterator<Item = &'a [u32]>) -> Vec<u8> {
    let header = RttiTableHeader {
        header_size: RttiTableHeader::SIZE as u32,
        row_size,
        row_count: rows.len() as u32,
    };
    let mut out = Vec::new();
    for word in [header.header_size, header.row_size, header.row_count] {
        out.extend_from_slice(&word.to_le_bytes());
    }
    for row in rows {
        for word in row {
            out.extend_from_slice(&word.to_le_bytes());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_resolve_forward_and_backward() {
        let mut code = CodeWriter::new();
        let top = code.label();
        let end = code.label();
        code.bind(top).unwrap();
        code.emit_label(Opcode::Jzer, end);
        code.emit_label(Opcode::Jump, top);
        code.bind(end).unwrap();
        code.emit(Opcode::Retn, &[]);

        let bytes = code.finish().unwrap();
        let cells: Vec<i32> = bytes
            .chunks(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(cells[0], Opcode::Halt.to_cell());
        assert_eq!(cells[3], 24);
        assert_eq!(cells[5], 8);
    }

    #[test]
    fn test_unbound_label() {
        let mut code = CodeWriter::new();
        let nowhere = code.label();
        code.emit_label(Opcode::Jump, nowhere);
        assert!(matches!(code.finish(), Err(BuildError::UnboundLabel(0))));
    }

    #[test]
    fn test_rebinding_fails() {
        let mut code = CodeWriter::new();
        let label = code.label();
        code.bind(label).unwrap();
        assert!(matches!(code.bind(label), Err(BuildError::Rebound(0))));
    }

    #[test]
    fn test_native_indices_are_stable() {
        let mut builder = ImageBuilder::new();
        assert_eq!(builder.native("PrintToServer"), 0);
        assert_eq!(builder.native("strlen"), 1);
        assert_eq!(builder.native("PrintToServer"), 0);
    }
}
