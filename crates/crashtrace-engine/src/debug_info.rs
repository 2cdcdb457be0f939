//! Debug-info accessor: code address → function, file and line
//!
//! Wraps a module's parsed debug block with the lookups a stack trace needs,
//! and reads the fixed frame layout used to walk from a frame to its caller.
//! A module without debug information gets an empty table; every lookup on it
//! returns the "no debug info" sentinel (`None`).

use std::fmt;
use std::path::Path;

use crashtrace_sdk::{
    AmxImage, DebugBlock, DebugFile, DebugLine, DebugSymbol, ScriptVm, UCell, CELL_SIZE,
};

use crate::error::DetectError;

/// Name of the untagged tag
const UNTAGGED: &str = "_";

/// A resolved source position
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceLocation {
    /// Source file name
    pub file: String,
    /// Line number, 1-based
    pub line: u32,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// What the debug table knows about one code address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeSymbol {
    /// Owning function, with its tag prefix (`Float:Foo`) when tagged
    pub function: String,
    /// Source file and line, when the tables cover the address
    pub location: Option<SourceLocation>,
}

/// The saved linkage stored at the base of every bytecode frame.
///
/// Layout relative to the frame pointer: `[frm]` caller frame,
/// `[frm + 4]` return address, `[frm + 8]` size of the arguments in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLink {
    /// Frame pointer of the caller
    pub caller_frm: UCell,
    /// Code address to return to; zero for the entry frame of a public call
    pub return_address: UCell,
    /// Bytes of arguments pushed by the caller
    pub arg_bytes: UCell,
}

impl FrameLink {
    /// Whether this frame was entered from the host rather than from bytecode
    pub fn is_entry(&self) -> bool {
        self.return_address == 0
    }
}

/// Debug tables of one module, sorted for address lookups
#[derive(Debug, Clone, Default)]
pub struct DebugInfo {
    files: Vec<DebugFile>,
    lines: Vec<DebugLine>,
    functions: Vec<DebugSymbol>,
    tags: Vec<(i16, String)>,
}

impl DebugInfo {
    /// A table with no debug data
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from a parsed debug block
    pub fn from_block(block: DebugBlock) -> Self {
        let mut files = block.files;
        let mut lines = block.lines;
        files.sort_by_key(|f| f.address);
        lines.sort_by_key(|l| l.address);

        let mut functions: Vec<DebugSymbol> = block
            .symbols
            .into_iter()
            .filter(|s| s.kind == crashtrace_sdk::SymbolKind::Function)
            .collect();
        functions.sort_by_key(|f| f.code_start);

        let tags = block.tags.into_iter().map(|t| (t.id, t.name)).collect();

        Self {
            files,
            lines,
            functions,
            tags,
        }
    }

    /// Parse an encoded debug block
    pub fn parse(bytes: &[u8]) -> Result<Self, DetectError> {
        Ok(Self::from_block(DebugBlock::parse(bytes)?))
    }

    /// Read the debug block of the module file at `path`.
    ///
    /// A module compiled without debug information yields an empty table.
    pub fn from_module_file(path: &Path) -> Result<Self, DetectError> {
        let bytes = std::fs::read(path)?;
        let image = AmxImage::parse(&bytes)?;
        match image.debug_block() {
            Some(block) => Self::parse(block),
            None => Ok(Self::empty()),
        }
    }

    /// Whether there is nothing to look up
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.lines.is_empty() && self.functions.is_empty()
    }

    /// Function symbol whose code range covers `address`
    pub fn function_at(&self, address: UCell) -> Option<&DebugSymbol> {
        // Ranges don't overlap, so the last one starting at or before the
        // address is the only candidate
        let idx = self.functions.partition_point(|f| f.code_start <= address);
        let candidate = self.functions.get(idx.checked_sub(1)?)?;
        candidate.covers(address).then_some(candidate)
    }

    /// Source file containing `address`
    pub fn file_at(&self, address: UCell) -> Option<&str> {
        let idx = self.files.partition_point(|f| f.address <= address);
        self.files
            .get(idx.checked_sub(1)?)
            .map(|f| f.name.as_str())
    }

    /// 1-based source line containing `address`
    pub fn line_at(&self, address: UCell) -> Option<u32> {
        let idx = self.lines.partition_point(|l| l.address <= address);
        let entry = self.lines.get(idx.checked_sub(1)?)?;
        u32::try_from(entry.line).ok().map(|line| line + 1)
    }

    /// Name of tag `id`
    pub fn tag_name(&self, id: i16) -> Option<&str> {
        self.tags
            .iter()
            .find(|(tag, _)| *tag == id)
            .map(|(_, name)| name.as_str())
    }

    /// File and line of `address`, when both are known
    pub fn locate(&self, address: UCell) -> Option<SourceLocation> {
        Some(SourceLocation {
            file: self.file_at(address)?.to_string(),
            line: self.line_at(address)?,
        })
    }

    /// Everything known about `address`, or `None` when no function covers it
    pub fn resolve(&self, address: UCell) -> Option<CodeSymbol> {
        let function = self.function_at(address)?;
        let name = match self.tag_name(function.tag) {
            Some(tag) if tag != UNTAGGED => format!("{}:{}", tag, function.name),
            _ => function.name.clone(),
        };
        Some(CodeSymbol {
            function: name,
            location: self.locate(address),
        })
    }

    /// Read the frame linkage at `frm`. `None` for the null frame or when any
    /// cell of the linkage lies outside the VM's data.
    pub fn frame_link(&self, vm: &dyn ScriptVm, frm: UCell) -> Option<FrameLink> {
        if frm == 0 {
            return None;
        }
        let caller_frm = vm.read_cell(frm)? as UCell;
        let return_address = vm.read_cell(frm.checked_add(CELL_SIZE)?)? as UCell;
        let arg_bytes = vm.read_cell(frm.checked_add(2 * CELL_SIZE)?)? as UCell;
        Some(FrameLink {
            caller_frm,
            return_address,
            arg_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crashtrace_sdk::DebugBlockWriter;

    fn sample() -> DebugInfo {
        let bytes = DebugBlockWriter::new()
            .file(0x00, "include.inc")
            .file(0x40, "file.pwn")
            .line(0x00, 9)
            .line(0x40, 11)
            .line(0x58, 12)
            .function("helper", 0, 0x00, 0x40)
            .function("Main", 0, 0x40, 0x80)
            .function("Ratio", 1, 0x80, 0xa0)
            .tag(0, "_")
            .tag(1, "Float")
            .finish();
        DebugInfo::parse(&bytes).unwrap()
    }

    #[test]
    fn test_resolve_in_table() {
        let info = sample();
        let symbol = info.resolve(0x5c).unwrap();
        assert_eq!(symbol.function, "Main");
        assert_eq!(
            symbol.location,
            Some(SourceLocation {
                file: "file.pwn".to_string(),
                line: 13
            })
        );
        assert_eq!(info.resolve(0x00).unwrap().function, "helper");
        assert_eq!(info.line_at(0x40), Some(12));
    }

    #[test]
    fn test_tagged_function_name() {
        let info = sample();
        assert_eq!(info.resolve(0x84).unwrap().function, "Float:Ratio");
    }

    #[test]
    fn test_out_of_range_is_sentinel() {
        let info = sample();
        assert_eq!(info.resolve(0xa0), None);
        assert_eq!(info.resolve(0x1000), None);
    }

    #[test]
    fn test_empty_table_degrades() {
        let info = DebugInfo::empty();
        assert!(info.is_empty());
        assert_eq!(info.resolve(0), None);
        assert_eq!(info.locate(0x40), None);
        assert_eq!(info.file_at(0x40), None);
    }

    #[test]
    fn test_location_display() {
        let loc = SourceLocation {
            file: "file.pwn".to_string(),
            line: 7,
        };
        assert_eq!(loc.to_string(), "file.pwn:7");
    }
}
