//! Process symbol resolver
//!
//! Names native code addresses as `module!symbol+offset`. Only native frames
//! go through here; bytecode frames are named from the module's debug info.

use std::fmt;

#[cfg(target_os = "linux")]
use once_cell::sync::OnceCell;

/// What is known about a native code address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeSymbol {
    /// The address that was resolved
    pub address: usize,
    /// File name of the owning module
    pub module: Option<String>,
    /// Nearest preceding exported symbol
    pub symbol: Option<String>,
    /// Distance from the symbol, or from the module base without one
    pub offset: usize,
}

impl NativeSymbol {
    /// Nothing known about `address`
    pub fn unknown(address: usize) -> Self {
        Self {
            address,
            module: None,
            symbol: None,
            offset: 0,
        }
    }

    /// Whether neither module nor symbol is known
    pub fn is_unknown(&self) -> bool {
        self.module.is_none() && self.symbol.is_none()
    }
}

impl fmt::Display for NativeSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.module, &self.symbol) {
            (Some(module), Some(symbol)) if self.offset == 0 => write!(f, "{}!{}", module, symbol),
            (Some(module), Some(symbol)) => write!(f, "{}!{}+{:#x}", module, symbol, self.offset),
            (None, Some(symbol)) => write!(f, "{}+{:#x}", symbol, self.offset),
            (Some(module), None) => write!(f, "{}", module),
            (None, None) => write!(f, "{:#010x}", self.address),
        }
    }
}

/// Maps native code addresses to module and symbol names
pub trait SymbolResolver: Send + Sync {
    /// Resolve `address`; `NativeSymbol::unknown` when nothing matches
    fn resolve(&self, address: usize) -> NativeSymbol;
}

/// File name component of a module path
fn file_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// One line of a `/proc/<pid>/maps` listing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Mapping<'a> {
    pub start: usize,
    pub end: usize,
    pub perms: &'a str,
    /// File path or pseudo name such as `[stack]`; `None` when anonymous
    pub path: Option<&'a str>,
}

/// Parse a `/proc/<pid>/maps` listing, skipping malformed lines
pub(crate) fn proc_maps(text: &str) -> impl Iterator<Item = Mapping<'_>> {
    text.lines().filter_map(|line| {
        let mut fields = line.split_whitespace();
        let range = fields.next()?;
        let perms = fields.next()?;
        // offset, device, inode
        let path = fields.nth(3);
        let (start, end) = range.split_once('-')?;
        let start = usize::from_str_radix(start, 16).ok()?;
        let end = usize::from_str_radix(end, 16).ok()?;
        Some(Mapping {
            start,
            end,
            perms,
            path,
        })
    })
}

// ============================================================================
// ModuleMap
// ============================================================================

#[derive(Debug, Clone)]
struct ModuleRange {
    base: usize,
    end: usize,
    /// Path as loaded; two files may share a `name`
    path: String,
    name: String,
    /// Sorted by address
    symbols: Vec<(usize, String)>,
}

/// A static table of module ranges and their exported symbols
#[derive(Debug, Clone, Default)]
pub struct ModuleMap {
    /// Sorted by base, non-overlapping
    modules: Vec<ModuleRange>,
}

impl ModuleMap {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Add module `path` covering `[base, base + size)`; it is reported by
    /// its file name
    pub fn module(mut self, path: &str, base: usize, size: usize) -> Self {
        self.insert(path, base, base.saturating_add(size));
        self
    }

    /// Add an exported symbol; ignored when no module covers `address`
    pub fn symbol(mut self, address: usize, name: &str) -> Self {
        if let Some(idx) = self.find(address) {
            let symbols = &mut self.modules[idx].symbols;
            let pos = symbols.partition_point(|(a, _)| *a <= address);
            symbols.insert(pos, (address, name.to_string()));
        }
        self
    }

    /// Number of modules
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Whether the map has no modules
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Build from a Linux `/proc/<pid>/maps` listing.
    ///
    /// Keeps file-backed executable mappings. Adjacent mappings of one path
    /// merge into a single range; mappings separated by another module stay
    /// separate.
    pub fn from_proc_maps(text: &str) -> Self {
        let mut map = ModuleMap::new();
        for mapping in proc_maps(text) {
            if !mapping.perms.contains('x') {
                continue;
            }
            if let Some(path) = mapping.path.filter(|path| path.starts_with('/')) {
                map.insert(path, mapping.start, mapping.end);
            }
        }
        map
    }

    fn insert(&mut self, path: &str, base: usize, end: usize) {
        let touching = self
            .modules
            .iter()
            .position(|m| m.path == path && m.base <= end && base <= m.end);
        if let Some(idx) = touching {
            let low = self.modules[idx].base.min(base);
            let high = self.modules[idx].end.max(end);
            let clear = self
                .modules
                .iter()
                .enumerate()
                .all(|(i, m)| i == idx || m.end <= low || m.base >= high);
            if clear {
                self.modules[idx].base = low;
                self.modules[idx].end = high;
                return;
            }
        }
        self.modules.push(ModuleRange {
            base,
            end,
            path: path.to_string(),
            name: file_name(path).to_string(),
            symbols: Vec::new(),
        });
        self.modules.sort_by_key(|m| m.base);
    }

    fn find(&self, address: usize) -> Option<usize> {
        let idx = self.modules.partition_point(|m| m.base <= address);
        let idx = idx.checked_sub(1)?;
        (address < self.modules[idx].end).then_some(idx)
    }
}

impl SymbolResolver for ModuleMap {
    fn resolve(&self, address: usize) -> NativeSymbol {
        let Some(idx) = self.find(address) else {
            return NativeSymbol::unknown(address);
        };
        let module = &self.modules[idx];
        let pos = module.symbols.partition_point(|(a, _)| *a <= address);
        match pos.checked_sub(1).map(|i| &module.symbols[i]) {
            Some((start, name)) => NativeSymbol {
                address,
                module: Some(module.name.clone()),
                symbol: Some(name.clone()),
                offset: address - start,
            },
            None => NativeSymbol {
                address,
                module: Some(module.name.clone()),
                symbol: None,
                offset: address - module.base,
            },
        }
    }
}

// ============================================================================
// ProcessSymbols
// ============================================================================

/// Resolves addresses in the running process
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessSymbols;

impl ProcessSymbols {
    /// Create a resolver for the current process
    pub fn new() -> Self {
        Self
    }
}

impl SymbolResolver for ProcessSymbols {
    fn resolve(&self, address: usize) -> NativeSymbol {
        if address == 0 {
            return NativeSymbol::unknown(address);
        }
        dladdr(address).unwrap_or_else(|| fallback(address))
    }
}

#[cfg(not(unix))]
fn dladdr(_address: usize) -> Option<NativeSymbol> {
    None
}

#[cfg(target_os = "linux")]
fn fallback(address: usize) -> NativeSymbol {
    self_maps().resolve(address)
}

#[cfg(not(target_os = "linux"))]
fn fallback(address: usize) -> NativeSymbol {
    NativeSymbol::unknown(address)
}

#[cfg(unix)]
fn dladdr(address: usize) -> Option<NativeSymbol> {
    use std::ffi::CStr;

    // SAFETY: Dl_info is plain data; dladdr only writes through the pointer
    let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
    let found = unsafe { libc::dladdr(address as *const libc::c_void, &mut info) };
    if found == 0 {
        return None;
    }

    let module = if info.dli_fname.is_null() {
        None
    } else {
        // SAFETY: non-null dli_fname points at a NUL-terminated path owned by the loader
        let path = unsafe { CStr::from_ptr(info.dli_fname) }.to_string_lossy();
        Some(file_name(&path).to_string())
    };

    let (symbol, offset) = if !info.dli_sname.is_null() && !info.dli_saddr.is_null() {
        // SAFETY: as above, for the symbol name
        let name = unsafe { CStr::from_ptr(info.dli_sname) }
            .to_string_lossy()
            .into_owned();
        (Some(name), address.wrapping_sub(info.dli_saddr as usize))
    } else {
        (None, address.wrapping_sub(info.dli_fbase as usize))
    };

    if module.is_none() && symbol.is_none() {
        return None;
    }
    Some(NativeSymbol {
        address,
        module,
        symbol,
        offset,
    })
}

#[cfg(target_os = "linux")]
fn self_maps() -> &'static ModuleMap {
    static MAPS: OnceCell<ModuleMap> = OnceCell::new();
    MAPS.get_or_init(|| match std::fs::read_to_string("/proc/self/maps") {
        Ok(text) => ModuleMap::from_proc_maps(&text),
        Err(e) => {
            tracing::debug!("cannot read /proc/self/maps: {}", e);
            ModuleMap::new()
        }
    })
}
