//! Trampoline resolver
//!
//! Hook libraries commonly overwrite the first bytes of a function with a
//! short jump to their own handler. Reporting such a function by its address
//! would name the hooker, not the function, so native addresses are passed
//! through `resolve_jump` first.
//!
//! Only a fixed prefix is inspected and only these stubs are recognised:
//!
//! | ABI    | bytes                      | target                         |
//! |--------|----------------------------|--------------------------------|
//! | both   | `E9 rel32`                 | `addr + 5 + rel32`             |
//! | both   | `EB rel8`                  | `addr + 2 + rel8`              |
//! | x86    | `FF 25 abs32`              | pointer stored at `abs32`      |
//! | x86-64 | `FF 25 disp32`             | pointer at `addr + 6 + disp32` |
//! | x86    | `68 imm32 C3`              | `imm32` (push/ret)             |
//! | x86-64 | `48 B8 imm64 FF E0`        | `imm64` (movabs rax; jmp rax)  |
//! | x86-64 | `49 BB imm64 41 FF E3`     | `imm64` (movabs r11; jmp r11)  |
//!
//! On any other target architecture nothing matches and addresses pass
//! through unchanged.

/// Number of bytes read at a candidate address
pub const PREFIX_LEN: usize = 16;

/// Default number of chained stubs followed
pub const DEFAULT_MAX_HOPS: usize = 8;

// ============================================================================
// Code readers
// ============================================================================

/// Source of code bytes at native addresses
pub trait CodeReader: Send + Sync {
    /// Copy up to `buf.len()` bytes starting at `address` into `buf`.
    /// Returns the number of bytes copied; 0 when the address is unreadable.
    fn read(&self, address: usize, buf: &mut [u8]) -> usize;
}

/// Reads the current process's own memory.
///
/// Reads are limited to a fixed set of readable ranges; anything outside
/// them, including stub targets and pointer slots, reads as nothing.
#[derive(Debug, Clone, Default)]
pub struct ProcessMemory {
    /// Sorted, disjoint `[start, end)`
    ranges: Vec<(usize, usize)>,
}

impl ProcessMemory {
    /// Snapshot the readable mappings of the current process. Outside Linux
    /// nothing is known to be readable.
    ///
    /// # Safety
    ///
    /// Memory mapped at the time of the call must stay mapped while the
    /// reader is in use: unloading a library afterwards leaves its range
    /// recorded as readable.
    pub unsafe fn new() -> Self {
        // SAFETY: forwarded to the caller
        unsafe { Self::from_ranges(readable_mappings()) }
    }

    /// A reader limited to `ranges`, given as `[start, end)` pairs.
    ///
    /// # Safety
    ///
    /// Every byte of every range must be readable for as long as the reader
    /// is in use.
    pub unsafe fn from_ranges(ranges: impl IntoIterator<Item = (usize, usize)>) -> Self {
        let mut sorted: Vec<(usize, usize)> =
            ranges.into_iter().filter(|(start, end)| start < end).collect();
        sorted.sort_unstable();

        let mut merged: Vec<(usize, usize)> = Vec::with_capacity(sorted.len());
        for (start, end) in sorted {
            match merged.last_mut() {
                Some(last) if start <= last.1 => last.1 = last.1.max(end),
                _ => merged.push((start, end)),
            }
        }
        Self { ranges: merged }
    }

    /// How many of the `len` bytes at `address` are readable
    fn readable_len(&self, address: usize, len: usize) -> usize {
        let idx = self.ranges.partition_point(|&(start, _)| start <= address);
        match idx.checked_sub(1).map(|i| self.ranges[i]) {
            Some((_, end)) if address < end => (end - address).min(len),
            _ => 0,
        }
    }
}

impl CodeReader for ProcessMemory {
    fn read(&self, address: usize, buf: &mut [u8]) -> usize {
        let n = self.readable_len(address, buf.len());
        if n == 0 {
            return 0;
        }
        // SAFETY: `[address, address + n)` lies inside one recorded range,
        // readable per the contract of the constructor
        unsafe {
            std::ptr::copy_nonoverlapping(address as *const u8, buf.as_mut_ptr(), n);
        }
        n
    }
}

#[cfg(target_os = "linux")]
fn readable_mappings() -> Vec<(usize, usize)> {
    let text = match std::fs::read_to_string("/proc/self/maps") {
        Ok(text) => text,
        Err(e) => {
            tracing::debug!("cannot read /proc/self/maps: {}", e);
            return Vec::new();
        }
    };
    crate::symbols::proc_maps(&text)
        // vvar pages may fault even though they are listed readable
        .filter(|m| m.perms.starts_with('r') && !m.path.is_some_and(|p| p.starts_with("[vvar")))
        .map(|m| (m.start, m.end))
        .collect()
}

#[cfg(not(target_os = "linux"))]
fn readable_mappings() -> Vec<(usize, usize)> {
    Vec::new()
}

/// A byte buffer pretending to be mapped at `base`
#[derive(Debug, Clone)]
pub struct MappedBytes {
    base: usize,
    bytes: Vec<u8>,
}

impl MappedBytes {
    /// Map `bytes` at `base`
    pub fn new(base: usize, bytes: Vec<u8>) -> Self {
        Self { base, bytes }
    }
}

impl CodeReader for MappedBytes {
    fn read(&self, address: usize, buf: &mut [u8]) -> usize {
        let Some(offset) = address.checked_sub(self.base) else {
            return 0;
        };
        let Some(available) = self.bytes.get(offset..) else {
            return 0;
        };
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        n
    }
}

/// A reader for which nothing is readable
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMemory;

impl CodeReader for NoMemory {
    fn read(&self, _address: usize, _buf: &mut [u8]) -> usize {
        0
    }
}

// ============================================================================
// Stub matching
// ============================================================================

/// Instruction set the stub patterns are matched for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Abi {
    /// 32-bit x86
    X86,
    /// x86-64
    X86_64,
    /// Anything else; no patterns are known
    Other,
}

impl Abi {
    /// The ABI this crate was compiled for
    pub fn host() -> Self {
        if cfg!(target_arch = "x86") {
            Abi::X86
        } else if cfg!(target_arch = "x86_64") {
            Abi::X86_64
        } else {
            Abi::Other
        }
    }

    fn pointer_size(self) -> usize {
        match self {
            Abi::X86 => 4,
            _ => 8,
        }
    }
}

/// Where a matched stub sends control
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubTarget {
    /// Target address encoded in the stub
    Direct(usize),
    /// Target is the pointer stored at this address
    Indirect(usize),
}

fn le_i32(bytes: &[u8]) -> i32 {
    i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(raw)
}

/// Match the code bytes found at `address` against the known stubs
pub fn match_stub(prefix: &[u8], address: usize, abi: Abi) -> Option<StubTarget> {
    if abi == Abi::Other {
        return None;
    }
    match prefix {
        [0xE9, rel @ ..] if rel.len() >= 4 => Some(StubTarget::Direct(
            address.wrapping_add(5).wrapping_add_signed(le_i32(rel) as isize),
        )),
        [0xEB, rel, ..] => Some(StubTarget::Direct(
            address.wrapping_add(2).wrapping_add_signed(*rel as i8 as isize),
        )),
        [0xFF, 0x25, disp @ ..] if disp.len() >= 4 => match abi {
            Abi::X86 => Some(StubTarget::Indirect(le_i32(disp) as u32 as usize)),
            _ => Some(StubTarget::Indirect(
                address.wrapping_add(6).wrapping_add_signed(le_i32(disp) as isize),
            )),
        },
        [0x68, imm @ ..] if abi == Abi::X86 && imm.len() >= 5 && imm[4] == 0xC3 => {
            Some(StubTarget::Direct(le_i32(imm) as u32 as usize))
        }
        [0x48, 0xB8, imm @ ..]
            if abi == Abi::X86_64 && imm.len() >= 10 && imm[8..10] == [0xFF, 0xE0] =>
        {
            Some(StubTarget::Direct(le_u64(imm) as usize))
        }
        [0x49, 0xBB, imm @ ..]
            if abi == Abi::X86_64 && imm.len() >= 11 && imm[8..11] == [0x41, 0xFF, 0xE3] =>
        {
            Some(StubTarget::Direct(le_u64(imm) as usize))
        }
        _ => None,
    }
}

fn read_pointer(reader: &dyn CodeReader, slot: usize, abi: Abi) -> Option<usize> {
    let mut raw = [0u8; 8];
    let size = abi.pointer_size();
    if reader.read(slot, &mut raw[..size]) < size {
        return None;
    }
    Some(match size {
        4 => le_i32(&raw) as u32 as usize,
        _ => le_u64(&raw) as usize,
    })
}

/// Follow jump stubs starting at `address`, at most `max_hops` of them.
///
/// Returns the first address that is not a recognised stub. An address that
/// is not a stub (or cannot be read) comes back unchanged.
pub fn resolve_jump(reader: &dyn CodeReader, address: usize, abi: Abi, max_hops: usize) -> usize {
    let mut current = address;
    for _ in 0..max_hops {
        let mut prefix = [0u8; PREFIX_LEN];
        let n = reader.read(current, &mut prefix);
        let next = match match_stub(&prefix[..n], current, abi) {
            Some(StubTarget::Direct(target)) => target,
            Some(StubTarget::Indirect(slot)) => match read_pointer(reader, slot, abi) {
                Some(target) => target,
                None => break,
            },
            None => break,
        };
        if next == 0 || next == current {
            break;
        }
        current = next;
    }
    current
}
