//! Legacy debug tables
//!
//! `.dbg.info` carries the record counts for `.dbg.files`, `.dbg.lines` and
//! `.dbg.symbols`. Names are offsets into `.dbg.strings` when present and
//! `.names` otherwise. All tables are sorted by address after loading so
//! that lookups are binary searches.

use crate::image::{FormatError, Sections, StringTable};
use crate::reader::{ByteReader, DecodeError};
use log::debug;

/// Symbol kind: variable
pub const IDENT_VARIABLE: u8 = 1;
/// Symbol kind: reference argument
pub const IDENT_REFERENCE: u8 = 2;
/// Symbol kind: array
pub const IDENT_ARRAY: u8 = 3;
/// Symbol kind: array passed by reference
pub const IDENT_REFARRAY: u8 = 4;
/// Symbol kind: function
pub const IDENT_FUNCTION: u8 = 9;

/// Address range start of a source file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugFile {
    /// First code address belonging to the file
    pub addr: u32,
    /// File name
    pub name: String,
}

/// Address of a source line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugLine {
    /// First code address of the line
    pub addr: u32,
    /// Line number
    pub line: u32,
}

/// One array dimension of a symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugDim {
    /// Tag of the dimension index
    pub tag: i16,
    /// Number of elements
    pub size: u32,
}

/// A debug symbol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugSymbol {
    /// Address: data address, frame offset or code address by kind
    pub addr: i32,
    /// Legacy tag id
    pub tag: i16,
    /// First code address of the symbol's scope
    pub code_start: u32,
    /// Last code address of the symbol's scope
    pub code_end: u32,
    /// Kind (`IDENT_*`)
    pub ident: u8,
    /// Scope class: 0 global, 1 local, 2 static
    pub vclass: u8,
    /// Symbol name
    pub name: String,
    /// Array dimensions
    pub dims: Vec<DebugDim>,
}

/// An argument of a native described by `.dbg.natives`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugNativeArg {
    /// Kind (`IDENT_*`)
    pub ident: u8,
    /// Legacy tag id
    pub tag: i16,
    /// Argument name
    pub name: String,
    /// Array dimensions
    pub dims: Vec<DebugDim>,
}

/// A native prototype from `.dbg.natives`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugNative {
    /// Index in the native table
    pub index: u32,
    /// Native name
    pub name: String,
    /// Return tag
    pub tag: i16,
    /// Arguments
    pub args: Vec<DebugNativeArg>,
}

/// The debug tables of an image
#[derive(Debug, Clone, Default)]
pub struct DebugInfo {
    /// Files, sorted by address
    pub files: Vec<DebugFile>,
    /// Lines, sorted by address
    pub lines: Vec<DebugLine>,
    /// Symbols, sorted by address
    pub symbols: Vec<DebugSymbol>,
    /// Native prototypes
    pub natives: Vec<DebugNative>,
    /// Function symbols as indices into `symbols`, sorted by code start
    functions: Vec<usize>,
}

const DEBUG_SECTIONS: &[&str] = &[".dbg.files", ".dbg.lines", ".dbg.symbols", ".dbg.natives"];

impl DebugInfo {
    /// Decode the debug tables, returning `None` when the image has none
    pub(crate) fn load(
        sections: &Sections<'_>,
        names: &StringTable,
    ) -> Result<Option<Self>, FormatError> {
        let Some(info) = sections.get(".dbg.info") else {
            if let Some(section) = DEBUG_SECTIONS
                .iter()
                .find(|name| sections.get(name).is_some())
            {
                return Err(FormatError::MissingDependency {
                    section: (*section).to_string(),
                    requires: ".dbg.info".to_string(),
                });
            }
            return Ok(None);
        };

        let owned_strings;
        let strings = match sections.get(".dbg.strings") {
            Some(bytes) => {
                owned_strings = StringTable::new(bytes);
                &owned_strings
            }
            None => names,
        };

        let mut reader = ByteReader::new(info);
        let truncated = |_: DecodeError| FormatError::TruncatedSection(".dbg.info".to_string());
        let num_files = reader.read_u32().map_err(truncated)?;
        let num_lines = reader.read_u32().map_err(truncated)?;
        let num_syms = reader.read_u32().map_err(truncated)?;
        let _num_arrays = reader.read_u32().map_err(truncated)?;

        let mut files = read_records(sections, ".dbg.files", num_files, |r| {
            Ok(DebugFile {
                addr: r.read_u32()?,
                name: strings.resolve(r.read_u32()?)?,
            })
        })?;
        let mut lines = read_records(sections, ".dbg.lines", num_lines, |r| {
            Ok(DebugLine {
                addr: r.read_u32()?,
                line: r.read_u32()?,
            })
        })?;
        let mut symbols = read_records(sections, ".dbg.symbols", num_syms, |r| {
            read_symbol(r, strings)
        })?;
        let natives = match sections.get(".dbg.natives") {
            Some(bytes) => read_natives(bytes, strings)
                .map_err(|_| FormatError::TruncatedSection(".dbg.natives".to_string()))?,
            None => Vec::new(),
        };

        files.sort_by_key(|f| f.addr);
        lines.sort_by_key(|l| l.addr);
        symbols.sort_by_key(|s| s.addr);

        let mut functions: Vec<usize> = symbols
            .iter()
            .enumerate()
            .filter(|(_, s)| s.ident == IDENT_FUNCTION)
            .map(|(index, _)| index)
            .collect();
        functions.sort_by_key(|&index| symbols[index].code_start);

        debug!(
            "debug tables: {} files, {} lines, {} symbols, {} natives",
            files.len(),
            lines.len(),
            symbols.len(),
            natives.len()
        );

        Ok(Some(Self {
            files,
            lines,
            symbols,
            natives,
            functions,
        }))
    }

    /// Whether every table required by the debug flag is non-empty
    pub fn is_complete(&self) -> bool {
        !self.files.is_empty() && !self.lines.is_empty() && !self.symbols.is_empty()
    }

    /// Source file containing code address `addr`
    pub fn lookup_file(&self, addr: u32) -> Option<&str> {
        let index = self.files.partition_point(|f| f.addr <= addr);
        index
            .checked_sub(1)
            .map(|index| self.files[index].name.as_str())
    }

    /// Source line containing code address `addr`
    pub fn lookup_line(&self, addr: u32) -> Option<u32> {
        let index = self.lines.partition_point(|l| l.addr <= addr);
        index.checked_sub(1).map(|index| self.lines[index].line)
    }

    /// Function symbol whose code range contains `addr`
    pub fn lookup_function(&self, addr: u32) -> Option<&DebugSymbol> {
        let index = self
            .functions
            .partition_point(|&s| self.symbols[s].code_start <= addr);
        let symbol = &self.symbols[*self.functions.get(index.checked_sub(1)?)?];
        (addr <= symbol.code_end).then_some(symbol)
    }

    /// Prototype of native `index`
    pub fn native(&self, index: u32) -> Option<&DebugNative> {
        self.natives.iter().find(|n| n.index == index)
    }
}

fn read_records<T>(
    sections: &Sections<'_>,
    name: &str,
    count: u32,
    mut read: impl FnMut(&mut ByteReader<'_>) -> Result<T, FormatError>,
) -> Result<Vec<T>, FormatError> {
    let Some(bytes) = sections.get(name) else {
        return Ok(Vec::new());
    };
    let mut reader = ByteReader::new(bytes);
    let mut out = Vec::with_capacity(count.min(4096) as usize);
    for _ in 0..count {
        match read(&mut reader) {
            Ok(record) => out.push(record),
            Err(FormatError::Decode(_)) => {
                return Err(FormatError::TruncatedSection(name.to_string()))
            }
            Err(err) => return Err(err),
        }
    }
    Ok(out)
}

fn read_dims(r: &mut ByteReader<'_>, count: u16) -> Result<Vec<DebugDim>, DecodeError> {
    (0..count)
        .map(|_| {
            Ok(DebugDim {
                tag: r.read_i16()?,
                size: r.read_u32()?,
            })
        })
        .collect()
}

fn read_symbol(r: &mut ByteReader<'_>, strings: &StringTable) -> Result<DebugSymbol, FormatError> {
    let addr = r.read_i32()?;
    let tag = r.read_i16()?;
    let code_start = r.read_u32()?;
    let code_end = r.read_u32()?;
    let ident = r.read_u8()?;
    let vclass = r.read_u8()?;
    let dim_count = r.read_u16()?;
    let name = strings.resolve(r.read_u32()?)?;
    let dims = read_dims(r, dim_count)?;
    Ok(DebugSymbol {
        addr,
        tag,
        code_start,
        code_end,
        ident,
        vclass,
        name,
        dims,
    })
}

fn read_natives(bytes: &[u8], strings: &StringTable) -> Result<Vec<DebugNative>, FormatError> {
    let mut r = ByteReader::new(bytes);
    let count = r.read_u32()?;
    let mut natives = Vec::with_capacity(count.min(4096) as usize);
    for _ in 0..count {
        let index = r.read_u32()?;
        let name = strings.resolve(r.read_u32()?)?;
        let tag = r.read_i16()?;
        let nargs = r.read_u16()?;
        let mut args = Vec::with_capacity(nargs as usize);
        for _ in 0..nargs {
            let ident = r.read_u8()?;
            let tag = r.read_i16()?;
            let dim_count = r.read_u16()?;
            let name = strings.resolve(r.read_u32()?)?;
            let dims = read_dims(&mut r, dim_count)?;
            args.push(DebugNativeArg {
                ident,
                tag,
                name,
                dims,
            });
        }
        natives.push(DebugNative {
            index,
            name,
            tag,
            args,
        });
    }
    Ok(natives)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> DebugInfo {
        let symbols = vec![
            DebugSymbol {
                addr: 8,
                tag: 0,
                code_start: 8,
                code_end: 40,
                ident: IDENT_FUNCTION,
                vclass: 0,
                name: "first".into(),
                dims: Vec::new(),
            },
            DebugSymbol {
                addr: 44,
                tag: 0,
                code_start: 44,
                code_end: 80,
                ident: IDENT_FUNCTION,
                vclass: 0,
                name: "second".into(),
                dims: Vec::new(),
            },
        ];
        DebugInfo {
            files: vec![
                DebugFile {
                    addr: 0,
                    name: "a.sp".into(),
                },
                DebugFile {
                    addr: 44,
                    name: "b.sp".into(),
                },
            ],
            lines: vec![
                DebugLine { addr: 8, line: 3 },
                DebugLine { addr: 20, line: 4 },
                DebugLine { addr: 44, line: 10 },
            ],
            symbols,
            natives: Vec::new(),
            functions: vec![0, 1],
        }
    }

    #[test]
    fn test_lookup_file_and_line() {
        let info = info();
        assert_eq!(info.lookup_file(4), Some("a.sp"));
        assert_eq!(info.lookup_file(60), Some("b.sp"));
        assert_eq!(info.lookup_line(4), None);
        assert_eq!(info.lookup_line(24), Some(4));
        assert_eq!(info.lookup_line(44), Some(10));
    }

    #[test]
    fn test_lookup_function() {
        let info = info();
        assert_eq!(info.lookup_function(12).map(|s| s.name.as_str()), Some("first"));
        assert_eq!(info.lookup_function(80).map(|s| s.name.as_str()), Some("second"));
        assert!(info.lookup_function(4).is_none());
        assert!(info.lookup_function(100).is_none());
    }
}
