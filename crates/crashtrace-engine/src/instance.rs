//! Per-VM diagnostic state

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crashtrace_sdk::{DebugHook, ExecEntry, ExtensionPoints, NativeDispatcher, ScriptVm, VmHandle};

use crate::debug_info::DebugInfo;
use crate::tracking::CallStack;

/// Diagnostics attached to one VM instance.
///
/// Holds the debug tables, the handlers that were installed before ours (the
/// next links in each chain), and the instance's call-tracking stack.
#[derive(Debug)]
pub struct DiagnosticInstance {
    handle: VmHandle,
    path: Option<PathBuf>,
    name: String,
    debug_info: DebugInfo,
    previous: ExtensionPoints,
    calls: CallStack,
}

impl DiagnosticInstance {
    /// Create an instance from already loaded parts
    pub fn new(
        handle: VmHandle,
        path: Option<PathBuf>,
        debug_info: DebugInfo,
        previous: ExtensionPoints,
    ) -> Self {
        let name = path
            .as_deref()
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| handle.to_string());
        Self {
            handle,
            path,
            name,
            debug_info,
            previous,
            calls: CallStack::new(),
        }
    }

    /// Create an instance for `vm`, loading its debug information
    pub fn load(vm: &dyn ScriptVm, previous: ExtensionPoints) -> Self {
        let path = vm.path().map(Path::to_path_buf);
        Self::new(vm.handle(), path, load_debug_info(vm), previous)
    }

    /// Handle of the VM this instance belongs to
    pub fn handle(&self) -> VmHandle {
        self.handle
    }

    /// Path of the module file, when known
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Module file name, or the VM handle when the path is unknown
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Debug tables of the module
    pub fn debug_info(&self) -> &DebugInfo {
        &self.debug_info
    }

    /// Handlers that were installed before this instance's interceptors
    pub fn previous(&self) -> &ExtensionPoints {
        &self.previous
    }

    /// Previously installed debug hook
    pub fn previous_debug_hook(&self) -> Option<&Arc<dyn DebugHook>> {
        self.previous.debug_hook.as_ref()
    }

    /// Previously installed native dispatcher
    pub fn previous_dispatcher(&self) -> Option<&Arc<dyn NativeDispatcher>> {
        self.previous.dispatcher.as_ref()
    }

    /// Previously installed exec entry
    pub fn previous_exec(&self) -> Option<&Arc<dyn ExecEntry>> {
        self.previous.exec.as_ref()
    }

    /// In-flight calls on this instance
    pub fn calls(&self) -> &CallStack {
        &self.calls
    }
}

/// Embedded debug block first, then the module file, then nothing
fn load_debug_info(vm: &dyn ScriptVm) -> DebugInfo {
    if let Some(block) = vm.debug_block() {
        match DebugInfo::parse(block) {
            Ok(info) => return info,
            Err(e) => tracing::warn!("{}: ignoring embedded debug info: {}", vm.handle(), e),
        }
    }
    if let Some(path) = vm.path() {
        match DebugInfo::from_module_file(path) {
            Ok(info) => return info,
            Err(e) => tracing::warn!("{}: no debug info from {}: {}", vm.handle(), path.display(), e),
        }
    }
    DebugInfo::empty()
}
