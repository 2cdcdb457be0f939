//! AMX module images
//!
//! Only the parts the diagnostics layer consumes are decoded: the header, the
//! public and native tables (with their names), and the debug block appended
//! after the image proper. Code and data sections are left to the VM.

use crate::codec::{ByteReader, ByteWriter, DecodeError};
use crate::types::{NativeEntry, PublicEntry, UCell};

/// Magic number of a 32-bit cell image
pub const AMX_MAGIC: u16 = 0xF1E0;

/// Size of the packed image header
pub const AMX_HEADER_SIZE: usize = 56;

/// Image carries a debug block
pub const AMX_FLAG_DEBUG: i16 = 0x02;

/// Code section is compacted
pub const AMX_FLAG_COMPACT: i16 = 0x04;

/// Size of a table record when names live in the name table
const NAME_TABLE_DEFSIZE: i16 = 8;

/// Default stack/heap size reserved by `AmxImageWriter`
const DEFAULT_STACK_SIZE: i32 = 4096;

// ============================================================================
// AmxHeader
// ============================================================================

/// The fixed image header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AmxHeader {
    /// Size of the image proper; a debug block, if any, starts here
    pub size: i32,
    /// Signature
    pub magic: u16,
    /// File format version
    pub file_version: u8,
    /// Required VM version
    pub amx_version: u8,
    /// `AMX_FLAG_*` bits
    pub flags: i16,
    /// Size of one public/native table record
    pub defsize: i16,
    /// Offset of the code section
    pub cod: i32,
    /// Offset of the data section
    pub dat: i32,
    /// Initial heap pointer
    pub hea: i32,
    /// Stack top
    pub stp: i32,
    /// Entry point of `main`, or -1
    pub cip: i32,
    /// Offset of the public table
    pub publics: i32,
    /// Offset of the native table
    pub natives: i32,
    /// Offset of the library table
    pub libraries: i32,
    /// Offset of the public variable table
    pub pubvars: i32,
    /// Offset of the tag table
    pub tags: i32,
    /// Offset of the name table
    pub nametable: i32,
}

impl AmxHeader {
    /// Decode the header at the start of `data`
    pub fn parse(data: &[u8]) -> Result<Self, DecodeError> {
        let mut r = ByteReader::new(data);
        let size = r.read_i32()?;
        let magic = r.read_u16()?;
        if magic != AMX_MAGIC {
            return Err(DecodeError::BadMagic {
                found: magic,
                expected: AMX_MAGIC,
            });
        }
        Ok(Self {
            size,
            magic,
            file_version: r.read_u8()?,
            amx_version: r.read_u8()?,
            flags: r.read_i16()?,
            defsize: r.read_i16()?,
            cod: r.read_i32()?,
            dat: r.read_i32()?,
            hea: r.read_i32()?,
            stp: r.read_i32()?,
            cip: r.read_i32()?,
            publics: r.read_i32()?,
            natives: r.read_i32()?,
            libraries: r.read_i32()?,
            pubvars: r.read_i32()?,
            tags: r.read_i32()?,
            nametable: r.read_i32()?,
        })
    }

    /// Whether the image was compiled with debug information
    pub fn has_debug_info(&self) -> bool {
        self.flags & AMX_FLAG_DEBUG != 0
    }

    /// Number of records between two table offsets. Both offsets must lie
    /// inside the first `limit` bytes of the image.
    fn table_len(
        &self,
        start: i32,
        end: i32,
        limit: usize,
        field: &'static str,
    ) -> Result<usize, DecodeError> {
        let invalid = |offset: i32| DecodeError::InvalidOffset {
            field,
            offset: offset as i64,
        };
        let first = usize::try_from(start).map_err(|_| invalid(start))?;
        let last = usize::try_from(end).map_err(|_| invalid(end))?;
        if first > limit {
            return Err(invalid(start));
        }
        if last > limit {
            return Err(invalid(end));
        }
        let defsize = usize::try_from(self.defsize)
            .ok()
            .filter(|&size| size > 0)
            .ok_or_else(|| invalid(start))?;
        let span = last.checked_sub(first).ok_or_else(|| invalid(start))?;
        Ok(span / defsize)
    }
}

// ============================================================================
// AmxImage
// ============================================================================

/// A decoded module image
#[derive(Debug, Clone)]
pub struct AmxImage {
    /// Image header
    pub header: AmxHeader,
    /// Public function table
    pub publics: Vec<PublicEntry>,
    /// Native function table (all unregistered; the host registers later)
    pub natives: Vec<NativeEntry>,
    debug: Option<Vec<u8>>,
}

impl AmxImage {
    /// Decode a module file
    pub fn parse(data: &[u8]) -> Result<Self, DecodeError> {
        let header = AmxHeader::parse(data)?;
        if header.size < AMX_HEADER_SIZE as i32 || header.size as usize > data.len() {
            return Err(DecodeError::InvalidOffset {
                field: "size",
                offset: header.size as i64,
            });
        }

        let limit = header.size as usize;
        let num_publics = header.table_len(header.publics, header.natives, limit, "publics")?;
        let num_natives = header.table_len(header.natives, header.libraries, limit, "natives")?;

        let mut publics = Vec::with_capacity(num_publics);
        for i in 0..num_publics {
            let (address, name) = read_record(data, &header, header.publics, i)?;
            publics.push(PublicEntry::new(name, address));
        }

        let mut natives = Vec::with_capacity(num_natives);
        for i in 0..num_natives {
            let (_, name) = read_record(data, &header, header.natives, i)?;
            natives.push(NativeEntry::unregistered(name));
        }

        let debug = if header.has_debug_info() && data.len() > header.size as usize {
            Some(data[header.size as usize..].to_vec())
        } else {
            None
        };

        Ok(Self {
            header,
            publics,
            natives,
            debug,
        })
    }

    /// The debug block appended after the image, if present
    pub fn debug_block(&self) -> Option<&[u8]> {
        self.debug.as_deref()
    }
}

fn read_record(
    data: &[u8],
    header: &AmxHeader,
    table: i32,
    index: usize,
) -> Result<(UCell, String), DecodeError> {
    let offset = table as usize + index * header.defsize as usize;
    let mut r = ByteReader::new(data);
    r.seek(offset);
    let address = r.read_u32()?;
    let name = if header.defsize == NAME_TABLE_DEFSIZE {
        let name_offset = r.read_u32()?;
        r.seek(name_offset as usize);
        r.read_cstr()?
    } else {
        // Older images store the name inline after the address
        r.read_cstr()?
    };
    Ok((address, name))
}

// ============================================================================
// AmxImageWriter
// ============================================================================

/// Builds a minimal module image, for tools and tests
#[derive(Debug, Default)]
pub struct AmxImageWriter {
    publics: Vec<PublicEntry>,
    natives: Vec<String>,
    code: Vec<u8>,
    data: Vec<u8>,
    debug: Option<Vec<u8>>,
}

impl AmxImageWriter {
    /// Create an empty writer
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a public function
    pub fn public(mut self, name: &str, address: UCell) -> Self {
        self.publics.push(PublicEntry::new(name, address));
        self
    }

    /// Add a native import
    pub fn native(mut self, name: &str) -> Self {
        self.natives.push(name.to_string());
        self
    }

    /// Set the code section
    pub fn code(mut self, code: Vec<u8>) -> Self {
        self.code = code;
        self
    }

    /// Set the data section
    pub fn data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }

    /// Append a debug block and set `AMX_FLAG_DEBUG`
    pub fn debug_block(mut self, block: Vec<u8>) -> Self {
        self.debug = Some(block);
        self
    }

    /// Encode the image
    pub fn finish(self) -> Vec<u8> {
        let defsize = NAME_TABLE_DEFSIZE as usize;
        let publics = AMX_HEADER_SIZE;
        let natives = publics + self.publics.len() * defsize;
        let libraries = natives + self.natives.len() * defsize;
        let nametable = libraries;

        let names: Vec<&str> = self
            .publics
            .iter()
            .map(|p| p.name.as_str())
            .chain(self.natives.iter().map(|n| n.as_str()))
            .collect();
        let max_name = names.iter().map(|n| n.len()).max().unwrap_or(0);
        let names_len: usize = 2 + names.iter().map(|n| n.len() + 1).sum::<usize>();
        let cod = nametable + names_len;
        let dat = cod + self.code.len();
        let size = dat + self.data.len();
        let hea = size as i32;

        let flags = if self.debug.is_some() { AMX_FLAG_DEBUG } else { 0 };

        let mut w = ByteWriter::new();
        w.emit_i32(size as i32);
        w.emit_u16(AMX_MAGIC);
        w.emit_u8(8);
        w.emit_u8(8);
        w.emit_i16(flags);
        w.emit_i16(NAME_TABLE_DEFSIZE);
        w.emit_i32(cod as i32);
        w.emit_i32(dat as i32);
        w.emit_i32(hea);
        w.emit_i32(hea + DEFAULT_STACK_SIZE);
        w.emit_i32(-1);
        w.emit_i32(publics as i32);
        w.emit_i32(natives as i32);
        w.emit_i32(libraries as i32);
        w.emit_i32(libraries as i32);
        w.emit_i32(libraries as i32);
        w.emit_i32(nametable as i32);

        let mut name_offset = nametable + 2;
        for public in &self.publics {
            w.emit_u32(public.address);
            w.emit_u32(name_offset as u32);
            name_offset += public.name.len() + 1;
        }
        for native in &self.natives {
            w.emit_u32(0);
            w.emit_u32(name_offset as u32);
            name_offset += native.len() + 1;
        }

        w.emit_u16(max_name as u16);
        for name in names {
            w.emit_cstr(name);
        }
        w.emit_bytes(&self.code);
        w.emit_bytes(&self.data);
        if let Some(debug) = &self.debug {
            w.emit_bytes(debug);
        }
        w.into_bytes()
    }
}
