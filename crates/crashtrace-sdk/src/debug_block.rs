//! The debug block a compiler appends to a module image
//!
//! Layout (all little-endian, packed):
//!
//! ```text
//! header   size:i32 magic:u16 file_version:u8 amx_version:u8 flags:i16
//!          files:i16 lines:i16 symbols:i16 tags:i16 automatons:i16 states:i16
//! files    { address:u32 name:cstr } * files
//! lines    { address:u32 line:i32 } * lines          (line is 0-based)
//! symbols  { address:u32 tag:i16 codestart:u32 codeend:u32 ident:u8
//!            vclass:u8 dim:i16 name:cstr { tag:i16 size:u32 } * dim } * symbols
//! tags     { tag:i16 name:cstr } * tags
//! ```
//!
//! Automaton and state tables follow the tags; they carry nothing a stack
//! trace needs and are left unparsed.

use crate::codec::{ByteReader, ByteWriter, DecodeError};
use crate::types::UCell;

/// Magic number of a debug block
pub const DEBUG_MAGIC: u16 = 0xF1EF;

/// Size of the packed debug block header
pub const DEBUG_HEADER_SIZE: usize = 22;

/// Debug format version written by `DebugBlockWriter`
pub const DEBUG_FILE_VERSION: u8 = 8;

// ============================================================================
// Table entries
// ============================================================================

/// A file table entry: code from `address` onward belongs to `name`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugFile {
    /// First code address of the file
    pub address: UCell,
    /// Source file name as the compiler saw it
    pub name: String,
}

/// A line table entry: code from `address` onward is on `line`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugLine {
    /// First code address of the line
    pub address: UCell,
    /// Line number, 0-based
    pub line: i32,
}

/// Symbol identity class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    /// Plain variable
    Variable,
    /// Reference parameter
    Reference,
    /// Array
    Array,
    /// Array passed by reference
    RefArray,
    /// Function
    Function,
    /// Anything else the compiler emits
    Other(u8),
}

impl SymbolKind {
    fn from_ident(ident: u8) -> Self {
        match ident {
            1 => SymbolKind::Variable,
            2 => SymbolKind::Reference,
            3 => SymbolKind::Array,
            4 => SymbolKind::RefArray,
            9 => SymbolKind::Function,
            other => SymbolKind::Other(other),
        }
    }

    fn ident(self) -> u8 {
        match self {
            SymbolKind::Variable => 1,
            SymbolKind::Reference => 2,
            SymbolKind::Array => 3,
            SymbolKind::RefArray => 4,
            SymbolKind::Function => 9,
            SymbolKind::Other(ident) => ident,
        }
    }
}

/// A symbol table entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugSymbol {
    /// Data address (variables) or entry address (functions)
    pub address: UCell,
    /// Tag id
    pub tag: i16,
    /// First code address where the symbol is in scope
    pub code_start: UCell,
    /// First code address past the symbol's scope
    pub code_end: UCell,
    /// Identity class
    pub kind: SymbolKind,
    /// Storage class (0 global, 1 local, 2 static)
    pub vclass: u8,
    /// Array dimensions as `(tag, size)` pairs
    pub dims: Vec<(i16, UCell)>,
    /// Symbol name
    pub name: String,
}

impl DebugSymbol {
    /// Whether `address` lies in this symbol's code range
    pub fn covers(&self, address: UCell) -> bool {
        self.code_start <= address && address < self.code_end
    }
}

/// A tag table entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugTag {
    /// Tag id
    pub id: i16,
    /// Tag name (`_` is the untagged tag)
    pub name: String,
}

// ============================================================================
// DebugBlock
// ============================================================================

/// A parsed debug block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DebugBlock {
    /// Format version from the header
    pub file_version: u8,
    /// Required VM version from the header
    pub amx_version: u8,
    /// File table, in file order
    pub files: Vec<DebugFile>,
    /// Line table, in file order
    pub lines: Vec<DebugLine>,
    /// Symbol table, in file order
    pub symbols: Vec<DebugSymbol>,
    /// Tag table, in file order
    pub tags: Vec<DebugTag>,
}

impl DebugBlock {
    /// Parse a debug block starting at the first byte of `data`.
    pub fn parse(data: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = ByteReader::new(data);

        let size = reader.read_i32()?;
        let magic = reader.read_u16()?;
        if magic != DEBUG_MAGIC {
            return Err(DecodeError::BadMagic {
                found: magic,
                expected: DEBUG_MAGIC,
            });
        }
        if size < DEBUG_HEADER_SIZE as i32 || size as usize > data.len() {
            return Err(DecodeError::InvalidOffset {
                field: "debug size",
                offset: size as i64,
            });
        }
        let file_version = reader.read_u8()?;
        let amx_version = reader.read_u8()?;
        let _flags = reader.read_i16()?;
        let num_files = reader.read_u16()?;
        let num_lines = reader.read_u16()?;
        let num_symbols = reader.read_u16()?;
        let num_tags = reader.read_u16()?;
        let _automatons = reader.read_u16()?;
        let _states = reader.read_u16()?;

        let block = &data[..size as usize];
        let mut reader = ByteReader::new(block);
        reader.seek(DEBUG_HEADER_SIZE);

        let mut files = Vec::with_capacity(num_files as usize);
        for _ in 0..num_files {
            let address = reader.read_u32()?;
            let name = reader.read_cstr()?;
            files.push(DebugFile { address, name });
        }

        let mut lines = Vec::with_capacity(num_lines as usize);
        for _ in 0..num_lines {
            let address = reader.read_u32()?;
            let line = reader.read_i32()?;
            lines.push(DebugLine { address, line });
        }

        let mut symbols = Vec::with_capacity(num_symbols as usize);
        for _ in 0..num_symbols {
            let address = reader.read_u32()?;
            let tag = reader.read_i16()?;
            let code_start = reader.read_u32()?;
            let code_end = reader.read_u32()?;
            let kind = SymbolKind::from_ident(reader.read_u8()?);
            let vclass = reader.read_u8()?;
            let dim = reader.read_i16()?;
            let name = reader.read_cstr()?;
            let mut dims = Vec::with_capacity(dim.max(0) as usize);
            for _ in 0..dim.max(0) {
                let dim_tag = reader.read_i16()?;
                let dim_size = reader.read_u32()?;
                dims.push((dim_tag, dim_size));
            }
            symbols.push(DebugSymbol {
                address,
                tag,
                code_start,
                code_end,
                kind,
                vclass,
                dims,
                name,
            });
        }

        let mut tags = Vec::with_capacity(num_tags as usize);
        for _ in 0..num_tags {
            let id = reader.read_i16()?;
            let name = reader.read_cstr()?;
            tags.push(DebugTag { id, name });
        }

        Ok(Self {
            file_version,
            amx_version,
            files,
            lines,
            symbols,
            tags,
        })
    }

    /// Function symbols
    pub fn functions(&self) -> impl Iterator<Item = &DebugSymbol> {
        self.symbols
            .iter()
            .filter(|s| s.kind == SymbolKind::Function)
    }

    /// Whether the block carries any lookup data at all
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.lines.is_empty() && self.symbols.is_empty()
    }
}

// ============================================================================
// DebugBlockWriter
// ============================================================================

/// Builds a debug block, mainly for tools and tests that synthesize modules
#[derive(Debug, Default)]
pub struct DebugBlockWriter {
    block: DebugBlock,
}

impl DebugBlockWriter {
    /// Create an empty writer
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file table entry
    pub fn file(mut self, address: UCell, name: &str) -> Self {
        self.block.files.push(DebugFile {
            address,
            name: name.to_string(),
        });
        self
    }

    /// Add a line table entry (`line` is 0-based)
    pub fn line(mut self, address: UCell, line: i32) -> Self {
        self.block.lines.push(DebugLine { address, line });
        self
    }

    /// Add a function symbol covering `[code_start, code_end)`
    pub fn function(mut self, name: &str, tag: i16, code_start: UCell, code_end: UCell) -> Self {
        self.block.symbols.push(DebugSymbol {
            address: code_start,
            tag,
            code_start,
            code_end,
            kind: SymbolKind::Function,
            vclass: 0,
            dims: Vec::new(),
            name: name.to_string(),
        });
        self
    }

    /// Add an arbitrary symbol
    pub fn symbol(mut self, symbol: DebugSymbol) -> Self {
        self.block.symbols.push(symbol);
        self
    }

    /// Add a tag table entry
    pub fn tag(mut self, id: i16, name: &str) -> Self {
        self.block.tags.push(DebugTag {
            id,
            name: name.to_string(),
        });
        self
    }

    /// Encode the block
    pub fn finish(self) -> Vec<u8> {
        let block = self.block;
        let mut writer = ByteWriter::new();
        writer.emit_i32(0);
        writer.emit_u16(DEBUG_MAGIC);
        writer.emit_u8(DEBUG_FILE_VERSION);
        writer.emit_u8(DEBUG_FILE_VERSION);
        writer.emit_i16(0);
        writer.emit_u16(block.files.len() as u16);
        writer.emit_u16(block.lines.len() as u16);
        writer.emit_u16(block.symbols.len() as u16);
        writer.emit_u16(block.tags.len() as u16);
        writer.emit_u16(0);
        writer.emit_u16(0);

        for file in &block.files {
            writer.emit_u32(file.address);
            writer.emit_cstr(&file.name);
        }
        for line in &block.lines {
            writer.emit_u32(line.address);
            writer.emit_i32(line.line);
        }
        for symbol in &block.symbols {
            writer.emit_u32(symbol.address);
            writer.emit_i16(symbol.tag);
            writer.emit_u32(symbol.code_start);
            writer.emit_u32(symbol.code_end);
            writer.emit_u8(symbol.kind.ident());
            writer.emit_u8(symbol.vclass);
            writer.emit_i16(symbol.dims.len() as i16);
            writer.emit_cstr(&symbol.name);
            for (tag, size) in &symbol.dims {
                writer.emit_i16(*tag);
                writer.emit_u32(*size);
            }
        }
        for tag in &block.tags {
            writer.emit_i16(tag.id);
            writer.emit_cstr(&tag.name);
        }

        let size = writer.offset() as u32;
        writer.patch_u32(0, size);
        writer.into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hand_encoded_block() {
        // One file, one line, one function symbol, no tags
        let mut w = ByteWriter::new();
        w.emit_i32(0);
        w.emit_u16(DEBUG_MAGIC);
        w.emit_u8(8);
        w.emit_u8(8);
        w.emit_i16(0);
        for count in [1u16, 1, 1, 0, 0, 0] {
            w.emit_u16(count);
        }
        w.emit_u32(0);
        w.emit_cstr("file.pwn");
        w.emit_u32(0x10);
        w.emit_i32(4);
        w.emit_u32(0x08);
        w.emit_i16(0);
        w.emit_u32(0x08);
        w.emit_u32(0x40);
        w.emit_u8(9);
        w.emit_u8(0);
        w.emit_i16(0);
        w.emit_cstr("Main");
        let size = w.offset() as u32;
        w.patch_u32(0, size);

        let block = DebugBlock::parse(w.buffer()).unwrap();
        assert_eq!(block.files[0].name, "file.pwn");
        assert_eq!(block.lines[0], DebugLine { address: 0x10, line: 4 });
        let main = block.functions().next().unwrap();
        assert_eq!(main.name, "Main");
        assert!(main.covers(0x08));
        assert!(!main.covers(0x40));
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = DebugBlockWriter::new().finish();
        bytes[4] = 0;
        assert!(matches!(
            DebugBlock::parse(&bytes),
            Err(DecodeError::BadMagic { .. })
        ));
    }

    #[test]
    fn test_truncated_block() {
        let bytes = DebugBlockWriter::new()
            .file(0, "a.pwn")
            .function("f", 0, 0, 8)
            .finish();
        let cut = &bytes[..bytes.len() - 3];
        assert!(DebugBlock::parse(cut).is_err());
    }

    #[test]
    fn test_array_symbol_dims() {
        let bytes = DebugBlockWriter::new()
            .symbol(DebugSymbol {
                address: 0x100,
                tag: 0,
                code_start: 0,
                code_end: 0x80,
                kind: SymbolKind::Array,
                vclass: 0,
                dims: vec![(0, 32), (0, 4)],
                name: "grid".to_string(),
            })
            .tag(0, "_")
            .tag(1, "Float")
            .finish();
        let block = DebugBlock::parse(&bytes).unwrap();
        assert_eq!(block.symbols[0].dims, vec![(0, 32), (0, 4)]);
        assert_eq!(block.tags[1].name, "Float");
        assert_eq!(block.functions().count(), 0);
    }
}
