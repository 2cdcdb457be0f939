//! crashtrace test support
//!
//! `SimVm` is a small in-memory stand-in for a host VM. It has no instruction
//! set: a "script" is a Rust closure that moves the code pointer around, calls
//! other script functions with `call`, and calls natives with `call_native`.
//! What it does reproduce faithfully is the part the diagnostics layer reads:
//! the register file, the stack frame layout, the native and public tables,
//! and the three extension-point slots (pre-filled with base handlers that
//! play the role of the host interpreter).
//!
//! # Example
//!
//! ```ignore
//! let mut vm = SimVm::new(1)
//!     .with_unregistered_native("Foo")
//!     .with_public("Main", 0x40, |vm| {
//!         vm.set_cip(0x58);
//!         vm.call_native(0, &[])
//!     });
//! detector.attach(&mut vm)?;
//! vm.exec(0)?;
//! ```

#![warn(missing_docs)]

use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crashtrace_sdk::{
    AmxError, AmxResult, Cell, DebugHook, ExecEntry, ExtensionPoints, NativeDispatcher,
    NativeEntry, PublicEntry, Registers, ScriptVm, UCell, VmHandle, CELL_SIZE, EXEC_MAIN,
};

/// Body of a script function
pub type ScriptFn = Arc<dyn Fn(&mut SimVm) -> AmxResult<Cell> + Send + Sync>;

/// Host implementation of a native
pub type NativeFn = Arc<dyn Fn(&mut SimVm, &[Cell]) -> AmxResult<Cell> + Send + Sync>;

/// Default size of the data segment in bytes
pub const DEFAULT_DATA_SIZE: usize = 0x1000;

/// First fake host address handed out to registered natives
pub const NATIVE_BASE_ADDRESS: usize = 0x7000_0000;

/// Bytes of saved linkage at the base of every frame
const FRAME_LINK_SIZE: UCell = 3 * CELL_SIZE;

/// An in-memory script VM
pub struct SimVm {
    handle: VmHandle,
    data: Vec<u8>,
    regs: Registers,
    natives: Vec<NativeEntry>,
    native_impls: Vec<Option<NativeFn>>,
    publics: Vec<PublicEntry>,
    public_bodies: Vec<ScriptFn>,
    main: Option<(UCell, ScriptFn)>,
    path: Option<PathBuf>,
    debug: Option<Vec<u8>>,
    points: ExtensionPoints,
}

impl SimVm {
    /// Create a VM with an empty module and the base handlers installed
    pub fn new(handle: u64) -> Self {
        Self {
            handle: VmHandle(handle),
            data: vec![0; DEFAULT_DATA_SIZE],
            regs: Registers {
                frm: 0,
                cip: 0,
                stk: DEFAULT_DATA_SIZE as UCell,
                hea: 0,
            },
            natives: Vec::new(),
            native_impls: Vec::new(),
            publics: Vec::new(),
            public_bodies: Vec::new(),
            main: None,
            path: None,
            debug: None,
            points: ExtensionPoints {
                debug_hook: None,
                dispatcher: Some(Arc::new(SimDispatcher)),
                exec: Some(Arc::new(SimExec)),
            },
        }
    }

    // ------------------------------------------------------------------
    // Module setup
    // ------------------------------------------------------------------

    /// Resize the data segment; the stack starts at its top
    pub fn with_data_size(mut self, bytes: usize) -> Self {
        self.data = vec![0; bytes];
        self.regs.stk = bytes as UCell;
        self
    }

    /// Add a registered native at a generated host address
    pub fn with_native<F>(self, name: &str, f: F) -> Self
    where
        F: Fn(&mut SimVm, &[Cell]) -> AmxResult<Cell> + Send + Sync + 'static,
    {
        let address = NATIVE_BASE_ADDRESS + self.natives.len() * 0x100;
        self.with_native_at(name, address, f)
    }

    /// Add a registered native at `address`
    pub fn with_native_at<F>(mut self, name: &str, address: usize, f: F) -> Self
    where
        F: Fn(&mut SimVm, &[Cell]) -> AmxResult<Cell> + Send + Sync + 'static,
    {
        self.natives.push(NativeEntry::registered(name, address));
        self.native_impls.push(Some(Arc::new(f)));
        self
    }

    /// Add a native import no host registered
    pub fn with_unregistered_native(mut self, name: &str) -> Self {
        self.natives.push(NativeEntry::unregistered(name));
        self.native_impls.push(None);
        self
    }

    /// Add a public function starting at `address`
    pub fn with_public<F>(mut self, name: &str, address: UCell, body: F) -> Self
    where
        F: Fn(&mut SimVm) -> AmxResult<Cell> + Send + Sync + 'static,
    {
        self.publics.push(PublicEntry::new(name, address));
        self.public_bodies.push(Arc::new(body));
        self
    }

    /// Set the `main` entry point
    pub fn with_main<F>(mut self, address: UCell, body: F) -> Self
    where
        F: Fn(&mut SimVm) -> AmxResult<Cell> + Send + Sync + 'static,
    {
        self.main = Some((address, Arc::new(body)));
        self
    }

    /// Set the module file path
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Embed a debug block
    pub fn with_debug_block(mut self, block: Vec<u8>) -> Self {
        self.debug = Some(block);
        self
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// Move the code pointer, as if executing the instruction at `cip`
    pub fn set_cip(&mut self, cip: UCell) {
        self.regs.cip = cip;
    }

    /// Overwrite the registers
    pub fn set_registers(&mut self, regs: Registers) {
        self.regs = regs;
    }

    /// Call the script function at `address` from the current code pointer.
    ///
    /// Builds a frame (`[frm]` caller frame, `[frm+4]` return address,
    /// `[frm+8]` argument bytes), runs `body`, and tears the frame down again
    /// on success. On error the registers stay where the fault left them.
    pub fn call<F>(&mut self, address: UCell, body: F) -> AmxResult<Cell>
    where
        F: FnOnce(&mut SimVm) -> AmxResult<Cell>,
    {
        let return_address = self.regs.cip;
        self.enter_frame(address, return_address)?;
        let saved = self.regs;
        let value = body(self)?;
        self.leave_frame(saved.frm)?;
        Ok(value)
    }

    /// Call native `index` through the installed dispatcher chain
    pub fn call_native(&mut self, index: Cell, params: &[Cell]) -> AmxResult<Cell> {
        let dispatcher = self.points.dispatcher.clone().ok_or(AmxError::Callback)?;
        dispatcher.dispatch(self, index, params)
    }

    /// Run public `index` (or `EXEC_MAIN`) through the installed exec chain
    pub fn exec(&mut self, index: i32) -> AmxResult<Cell> {
        let exec = self.points.exec.clone().ok_or(AmxError::Init)?;
        exec.exec(self, index)
    }

    /// Signal one executed instruction to the installed debug hook
    pub fn step(&mut self) -> AmxResult<()> {
        match self.points.debug_hook.clone() {
            Some(hook) => hook.on_instruction(self),
            None => Ok(()),
        }
    }

    /// Write a cell into the data segment. `false` when out of bounds.
    pub fn write_cell(&mut self, addr: UCell, value: Cell) -> bool {
        let start = addr as usize;
        let Some(end) = start.checked_add(CELL_SIZE as usize) else {
            return false;
        };
        match self.data.get_mut(start..end) {
            Some(slot) => {
                slot.copy_from_slice(&value.to_le_bytes());
                true
            }
            None => false,
        }
    }

    fn push(&mut self, value: Cell) -> AmxResult<()> {
        let stk = self
            .regs
            .stk
            .checked_sub(CELL_SIZE)
            .filter(|stk| *stk >= self.regs.hea)
            .ok_or(AmxError::StackErr)?;
        self.regs.stk = stk;
        self.write_cell(stk, value);
        Ok(())
    }

    fn enter_frame(&mut self, address: UCell, return_address: UCell) -> AmxResult<()> {
        self.push(0)?;
        self.push(return_address as Cell)?;
        self.push(self.regs.frm as Cell)?;
        self.regs.frm = self.regs.stk;
        self.regs.cip = address;
        Ok(())
    }

    fn leave_frame(&mut self, frm: UCell) -> AmxResult<()> {
        let caller = self.read_cell(frm).ok_or(AmxError::MemAccess)?;
        let return_address = self
            .read_cell(frm + CELL_SIZE)
            .ok_or(AmxError::MemAccess)?;
        self.regs.stk = frm + FRAME_LINK_SIZE;
        self.regs.frm = caller as UCell;
        self.regs.cip = return_address as UCell;
        Ok(())
    }

    fn run_public(&mut self, index: i32) -> AmxResult<Cell> {
        let (address, body) = if index == EXEC_MAIN {
            self.main.clone().ok_or(AmxError::Index)?
        } else {
            let i = usize::try_from(index).map_err(|_| AmxError::Index)?;
            let public = self.publics.get(i).ok_or(AmxError::Index)?;
            (public.address, Arc::clone(&self.public_bodies[i]))
        };

        let saved = self.regs;
        // Entered from the host: return address 0 marks the entry frame
        self.enter_frame(address, 0)?;
        let value = body(self)?;
        self.regs = saved;
        Ok(value)
    }

    fn run_native(&mut self, index: Cell, params: &[Cell]) -> AmxResult<Cell> {
        let f = usize::try_from(index)
            .ok()
            .and_then(|i| self.native_impls.get(i))
            .and_then(Clone::clone)
            .ok_or(AmxError::Callback)?;
        f(self, params)
    }
}

impl ScriptVm for SimVm {
    fn handle(&self) -> VmHandle {
        self.handle
    }

    fn registers(&self) -> Registers {
        self.regs
    }

    fn read_cell(&self, addr: UCell) -> Option<Cell> {
        let start = addr as usize;
        let bytes = self.data.get(start..start.checked_add(CELL_SIZE as usize)?)?;
        Some(Cell::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn native(&self, index: Cell) -> Option<&NativeEntry> {
        self.natives.get(usize::try_from(index).ok()?)
    }

    fn native_count(&self) -> usize {
        self.natives.len()
    }

    fn public(&self, index: Cell) -> Option<&PublicEntry> {
        self.publics.get(usize::try_from(index).ok()?)
    }

    fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn debug_block(&self) -> Option<&[u8]> {
        self.debug.as_deref()
    }

    fn extension_points(&self) -> &ExtensionPoints {
        &self.points
    }

    fn extension_points_mut(&mut self) -> &mut ExtensionPoints {
        &mut self.points
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// The host's own native dispatcher: runs the registered closure
pub struct SimDispatcher;

impl NativeDispatcher for SimDispatcher {
    fn dispatch(&self, vm: &mut dyn ScriptVm, index: Cell, params: &[Cell]) -> AmxResult<Cell> {
        let sim = vm
            .as_any_mut()
            .downcast_mut::<SimVm>()
            .ok_or(AmxError::InvState)?;
        sim.run_native(index, params)
    }
}

/// The host's own exec entry: runs the public's closure in a fresh frame
pub struct SimExec;

impl ExecEntry for SimExec {
    fn exec(&self, vm: &mut dyn ScriptVm, index: i32) -> AmxResult<Cell> {
        let sim = vm
            .as_any_mut()
            .downcast_mut::<SimVm>()
            .ok_or(AmxError::InvState)?;
        sim.run_public(index)
    }
}

/// A debug hook that counts instructions, for chaining tests
#[derive(Default)]
pub struct CountingHook {
    count: std::sync::atomic::AtomicUsize,
}

impl CountingHook {
    /// Instructions seen so far
    pub fn count(&self) -> usize {
        self.count.load(std::sync::atomic::Ordering::Relaxed)
    }
}

impl DebugHook for CountingHook {
    fn on_instruction(&self, _vm: &mut dyn ScriptVm) -> AmxResult<()> {
        self.count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_builds_entry_frame() {
        let mut vm = SimVm::new(1).with_public("Main", 0x40, |vm| {
            let regs = vm.registers();
            assert_eq!(regs.cip, 0x40);
            assert_eq!(vm.read_cell(regs.frm), Some(0));
            assert_eq!(vm.read_cell(regs.frm + 4), Some(0));
            assert_eq!(regs.frm, DEFAULT_DATA_SIZE as UCell - 12);
            Ok(7)
        });
        assert_eq!(vm.exec(0), Ok(7));
        assert_eq!(vm.registers().frm, 0);
        assert_eq!(vm.registers().stk, DEFAULT_DATA_SIZE as UCell);
    }

    #[test]
    fn test_call_links_to_caller() {
        let mut vm = SimVm::new(1).with_public("Main", 0x40, |vm| {
            let outer = vm.registers().frm;
            vm.set_cip(0x4c);
            let value = vm.call(0x100, |vm| {
                let regs = vm.registers();
                assert_eq!(vm.read_cell(regs.frm), Some(outer as Cell));
                assert_eq!(vm.read_cell(regs.frm + 4), Some(0x4c));
                Ok(1)
            })?;
            assert_eq!(vm.registers().frm, outer);
            assert_eq!(vm.registers().cip, 0x4c);
            Ok(value)
        });
        assert_eq!(vm.exec(0), Ok(1));
    }

    #[test]
    fn test_error_leaves_registers_at_fault() {
        let mut vm = SimVm::new(1).with_public("Main", 0x40, |vm| {
            vm.set_cip(0x44);
            Err(AmxError::Bounds)
        });
        assert_eq!(vm.exec(0), Err(AmxError::Bounds));
        assert_eq!(vm.registers().cip, 0x44);
        assert_ne!(vm.registers().frm, 0);
    }

    #[test]
    fn test_natives_and_bad_indices() {
        let mut vm = SimVm::new(1)
            .with_native("add", |_, params| Ok(params.iter().sum()))
            .with_unregistered_native("Foo");
        assert_eq!(vm.call_native(0, &[2, 3]), Ok(5));
        assert_eq!(vm.call_native(1, &[]), Err(AmxError::Callback));
        assert_eq!(vm.exec(3), Err(AmxError::Index));
        assert_eq!(vm.native(0).and_then(|n| n.address), Some(NATIVE_BASE_ADDRESS));
    }

    #[test]
    fn test_stack_overflow_is_an_error() {
        fn recurse(vm: &mut SimVm) -> AmxResult<Cell> {
            vm.call(0x40, recurse)
        }
        let mut vm = SimVm::new(1).with_data_size(64).with_public("Main", 0x40, recurse);
        assert_eq!(vm.exec(0), Err(AmxError::StackErr));
    }

    #[test]
    fn test_read_cell_bounds() {
        let mut vm = SimVm::new(1).with_data_size(16);
        assert!(vm.write_cell(12, -1));
        assert_eq!(vm.read_cell(12), Some(-1));
        assert_eq!(vm.read_cell(13), None);
        assert!(!vm.write_cell(16, 0));
        assert_eq!(vm.read_cell(u32::MAX), None);
    }
}
