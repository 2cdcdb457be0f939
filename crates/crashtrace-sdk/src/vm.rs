//! The VM instance interface and its replaceable extension points
//!
//! A host VM exposes three slots that it invokes at documented moments:
//!
//! - the **debug hook**, after each executed instruction while debug mode is on
//! - the **native dispatcher**, whenever bytecode calls a native by index
//! - the **exec entry**, whenever the host runs a public function (or `main`)
//!
//! Each slot holds at most one handler. A layer that wants to observe a slot
//! takes the current handler out, installs its own, and forwards to the one it
//! took once its own work is done. The host's own interpreter entry and native
//! dispatcher are simply the first handlers in those chains.

use std::any::Any;
use std::path::Path;
use std::sync::Arc;

use crate::error::AmxResult;
use crate::types::{Cell, NativeEntry, PublicEntry, Registers, UCell, VmHandle};

// ============================================================================
// Extension point traits
// ============================================================================

/// Handler for the per-instruction debug hook
pub trait DebugHook: Send + Sync {
    /// Called after an instruction completed. An error aborts execution.
    fn on_instruction(&self, vm: &mut dyn ScriptVm) -> AmxResult<()>;
}

/// Handler for native function calls made from bytecode
pub trait NativeDispatcher: Send + Sync {
    /// Dispatch native `index` with the script-supplied `params`.
    fn dispatch(&self, vm: &mut dyn ScriptVm, index: Cell, params: &[Cell]) -> AmxResult<Cell>;
}

/// Handler for the VM's top-level "run a function" entry point
pub trait ExecEntry: Send + Sync {
    /// Run public `index` (or one of the special `EXEC_*` indices).
    fn exec(&self, vm: &mut dyn ScriptVm, index: i32) -> AmxResult<Cell>;
}

/// The three replaceable handler slots of one VM instance
#[derive(Clone, Default)]
pub struct ExtensionPoints {
    /// Debug hook slot
    pub debug_hook: Option<Arc<dyn DebugHook>>,
    /// Native dispatcher slot
    pub dispatcher: Option<Arc<dyn NativeDispatcher>>,
    /// Exec entry slot
    pub exec: Option<Arc<dyn ExecEntry>>,
}

impl std::fmt::Debug for ExtensionPoints {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionPoints")
            .field("debug_hook", &self.debug_hook.is_some())
            .field("dispatcher", &self.dispatcher.is_some())
            .field("exec", &self.exec.is_some())
            .finish()
    }
}

// ============================================================================
// ScriptVm
// ============================================================================

/// One loaded script's VM state, as seen from outside the interpreter.
///
/// Owned by the host. The diagnostics layer only borrows it for the duration
/// of a hook call or a notification.
pub trait ScriptVm {
    /// Identity of this instance
    fn handle(&self) -> VmHandle;

    /// Current register values
    fn registers(&self) -> Registers;

    /// Read the cell at data address `addr`. `None` when out of bounds.
    fn read_cell(&self, addr: UCell) -> Option<Cell>;

    /// Native table entry `index`
    fn native(&self, index: Cell) -> Option<&NativeEntry>;

    /// Number of entries in the native table
    fn native_count(&self) -> usize;

    /// Public table entry `index`
    fn public(&self, index: Cell) -> Option<&PublicEntry>;

    /// Path of the module file this instance was loaded from, if known
    fn path(&self) -> Option<&Path> {
        None
    }

    /// Debug block embedded in the loaded image, if any
    fn debug_block(&self) -> Option<&[u8]> {
        None
    }

    /// The instance's handler slots
    fn extension_points(&self) -> &ExtensionPoints;

    /// Mutable access to the handler slots
    fn extension_points_mut(&mut self) -> &mut ExtensionPoints;

    /// Lets host-side base handlers recover their concrete VM type
    fn as_any_mut(&mut self) -> &mut dyn Any;
}
