//! Core value types shared between the VM host and the diagnostics layer

use std::fmt;

/// A signed VM cell (the AMX is a 32-bit cell machine)
pub type Cell = i32;

/// An unsigned VM cell, used for code and data addresses
pub type UCell = u32;

/// Size of one cell in bytes
pub const CELL_SIZE: UCell = 4;

// ============================================================================
// Exec indices
// ============================================================================

/// Exec index that runs the module's `main` entry point
pub const EXEC_MAIN: i32 = -1;

/// Exec index that continues a sleeping module
pub const EXEC_CONT: i32 = -2;

/// Exec index used by GDK-style hosts to probe for a public that may not exist
pub const EXEC_GDK: i32 = -10;

// ============================================================================
// VmHandle
// ============================================================================

/// Opaque identity of one loaded VM instance.
///
/// The host picks the value (typically the address of its native VM struct);
/// it only has to stay unique while the instance is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VmHandle(pub u64);

impl fmt::Display for VmHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vm#{:x}", self.0)
    }
}

// ============================================================================
// Registers
// ============================================================================

/// Snapshot of the VM registers the diagnostics layer cares about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Registers {
    /// Frame pointer (data-relative address of the current frame)
    pub frm: UCell,
    /// Code pointer (code-relative address of the current instruction)
    pub cip: UCell,
    /// Stack pointer
    pub stk: UCell,
    /// Heap pointer
    pub hea: UCell,
}

// ============================================================================
// Function tables
// ============================================================================

/// One entry of a module's native function table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeEntry {
    /// Name the script imported the native under
    pub name: String,
    /// Address of the registered host implementation, `None` when unregistered
    pub address: Option<usize>,
}

impl NativeEntry {
    /// Create an entry with a registered implementation
    pub fn registered(name: impl Into<String>, address: usize) -> Self {
        Self {
            name: name.into(),
            address: Some(address),
        }
    }

    /// Create an entry no host has registered yet
    pub fn unregistered(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: None,
        }
    }

    /// Whether a host implementation is registered
    pub fn is_registered(&self) -> bool {
        self.address.is_some()
    }
}

/// One entry of a module's public function table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicEntry {
    /// Exported name
    pub name: String,
    /// Code address of the function's first instruction
    pub address: UCell,
}

impl PublicEntry {
    /// Create a public entry
    pub fn new(name: impl Into<String>, address: UCell) -> Self {
        Self {
            name: name.into(),
            address,
        }
    }
}
