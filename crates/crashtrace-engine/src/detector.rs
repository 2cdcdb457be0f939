//! The detector: what a host plugin holds on to
//!
//! ```ignore
//! let detector = CrashDetector::builder()
//!     .config_file("server.cfg")?
//!     .build();
//!
//! // on script load / unload
//! detector.attach(&mut vm)?;
//! detector.detach(&mut vm)?;
//!
//! // from the host's fault handler
//! detector.crash(&[&vm]);
//! ```

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crashtrace_sdk::{AmxError, ExtensionPoints, ScriptVm, VmHandle};

use crate::config::Config;
use crate::error::DetectError;
use crate::handlers::Disposition;
use crate::hooks::{self, Interceptors};
use crate::instance::DiagnosticInstance;
use crate::printer::{StackPrinter, StackTrace};
use crate::registry::InstanceRegistry;
use crate::report::{ProcessExit, ReportSink, Terminator, TracingSink};
use crate::symbols::{ProcessSymbols, SymbolResolver};
use crate::trampoline::{Abi, CodeReader, NoMemory, ProcessMemory};

/// State shared by the detector and every interceptor it installs
pub(crate) struct DetectorCore {
    pub(crate) registry: InstanceRegistry,
    pub(crate) config: Config,
    pub(crate) sink: Arc<dyn ReportSink>,
    pub(crate) terminator: Arc<dyn Terminator>,
    pub(crate) symbols: Arc<dyn SymbolResolver>,
    pub(crate) code: Arc<dyn CodeReader>,
    pub(crate) abi: Abi,
    pub(crate) interrupt: Arc<AtomicBool>,
    pub(crate) terminating: AtomicBool,
}

impl DetectorCore {
    pub(crate) fn printer(&self) -> StackPrinter<'_> {
        StackPrinter::new(&*self.symbols, &*self.code, self.abi)
            .max_depth(self.config.max_trace_depth)
            .max_hops(self.config.max_trampoline_hops)
    }

    pub(crate) fn take_interrupt(&self) -> bool {
        self.interrupt.swap(false, Ordering::AcqRel)
    }
}

/// Requests an interrupt report from any thread, including a signal handler
#[derive(Debug, Clone)]
pub struct InterruptHandle {
    flag: Arc<AtomicBool>,
}

impl InterruptHandle {
    /// Ask the next debug-hook callback to report its stack
    pub fn request(&self) {
        self.flag.store(true, Ordering::Release);
    }
}

/// Builder for `CrashDetector`
pub struct DetectorBuilder {
    config: Config,
    sink: Arc<dyn ReportSink>,
    terminator: Arc<dyn Terminator>,
    symbols: Arc<dyn SymbolResolver>,
    code: Arc<dyn CodeReader>,
    abi: Abi,
}

impl Default for DetectorBuilder {
    fn default() -> Self {
        Self {
            config: Config::default(),
            sink: Arc::new(TracingSink),
            terminator: Arc::new(ProcessExit),
            symbols: Arc::new(ProcessSymbols::new()),
            code: Arc::new(NoMemory),
            abi: Abi::host(),
        }
    }
}

impl DetectorBuilder {
    /// Settings
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Settings loaded from a file; see `Config::load`
    pub fn config_file(self, path: impl AsRef<Path>) -> Result<Self, DetectError> {
        let path = path.as_ref();
        let config = Config::load(path)?;
        debug!("loaded settings from {}", path.display());
        Ok(self.config(config))
    }

    /// Where reports go (default: `tracing` events)
    pub fn sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sink = sink;
        self
    }

    /// How fatal failures end the process (default: exit status 1)
    pub fn terminator(mut self, terminator: Arc<dyn Terminator>) -> Self {
        self.terminator = terminator;
        self
    }

    /// Native symbol lookup (default: the running process)
    pub fn symbols(mut self, symbols: Arc<dyn SymbolResolver>) -> Self {
        self.symbols = symbols;
        self
    }

    /// Source of native code bytes for following jump stubs (default: none)
    pub fn code_reader(mut self, code: Arc<dyn CodeReader>) -> Self {
        self.code = code;
        self
    }

    /// Follow jump stubs by reading this process's memory, limited to the
    /// mappings readable when this is called.
    ///
    /// # Safety
    ///
    /// Libraries loaded now must stay loaded while the detector is in use;
    /// see `ProcessMemory::new`.
    pub unsafe fn read_process_memory(mut self) -> Self {
        // SAFETY: forwarded to the caller
        self.code = Arc::new(unsafe { ProcessMemory::new() });
        self
    }

    /// Instruction set for stub matching (default: the host's)
    pub fn abi(mut self, abi: Abi) -> Self {
        self.abi = abi;
        self
    }

    /// Create the detector
    pub fn build(self) -> CrashDetector {
        CrashDetector {
            core: Arc::new(DetectorCore {
                registry: InstanceRegistry::new(),
                config: self.config,
                sink: self.sink,
                terminator: self.terminator,
                symbols: self.symbols,
                code: self.code,
                abi: self.abi,
                interrupt: Arc::new(AtomicBool::new(false)),
                terminating: AtomicBool::new(false),
            }),
            installed: Mutex::new(FxHashMap::default()),
        }
    }
}

/// Crash and runtime-error diagnostics for a set of VM instances
pub struct CrashDetector {
    core: Arc<DetectorCore>,
    installed: Mutex<FxHashMap<VmHandle, Interceptors>>,
}

impl CrashDetector {
    /// Start building a detector
    pub fn builder() -> DetectorBuilder {
        DetectorBuilder::default()
    }

    /// A detector with `config` and default collaborators
    pub fn new(config: Config) -> Self {
        Self::builder().config(config).build()
    }

    /// Settings in effect
    pub fn config(&self) -> &Config {
        &self.core.config
    }

    /// Install the interceptors into `vm` and start tracking it.
    ///
    /// Whatever handlers `vm` held become the next links of each chain.
    pub fn attach(&self, vm: &mut dyn ScriptVm) -> Result<(), DetectError> {
        let handle = vm.handle();
        if self.core.registry.contains(handle) {
            return Err(DetectError::AlreadyAttached(handle));
        }

        let previous: ExtensionPoints = vm.extension_points().clone();
        if previous.dispatcher.is_none() {
            warn!(
                "{}: no native dispatcher installed, native calls will fail",
                handle
            );
        }
        if previous.exec.is_none() {
            warn!("{}: no exec entry installed, public calls will fail", handle);
        }

        let instance = Arc::new(DiagnosticInstance::load(&*vm, previous));
        self.core.registry.insert(Arc::clone(&instance))?;

        let interceptors = Interceptors::new(&self.core, &instance);
        let points = vm.extension_points_mut();
        points.debug_hook = Some(Arc::clone(&interceptors.debug_hook));
        points.dispatcher = Some(Arc::clone(&interceptors.dispatcher));
        points.exec = Some(Arc::clone(&interceptors.exec));
        self.installed.lock().insert(handle, interceptors);

        debug!(
            "attached to {} ({}, debug info: {})",
            handle,
            instance.name(),
            if instance.debug_info().is_empty() { "none" } else { "loaded" }
        );
        Ok(())
    }

    /// Stop tracking `vm` and put back the handlers found at attach time,
    /// for each slot that still holds this detector's interceptor
    pub fn detach(&self, vm: &mut dyn ScriptVm) -> Result<(), DetectError> {
        let handle = vm.handle();
        let instance = self
            .core
            .registry
            .remove(handle)
            .ok_or(DetectError::NotAttached(handle))?;

        if let Some(ours) = self.installed.lock().remove(&handle) {
            let previous = instance.previous().clone();
            let points = vm.extension_points_mut();
            let restored = [
                hooks::restore(&mut points.debug_hook, &ours.debug_hook, previous.debug_hook),
                hooks::restore(&mut points.dispatcher, &ours.dispatcher, previous.dispatcher),
                hooks::restore(&mut points.exec, &ours.exec, previous.exec),
            ];
            if restored.contains(&false) {
                debug!(
                    "{}: another layer chained on top, leaving its handlers in place",
                    handle
                );
            }
        }
        debug!("detached from {}", handle);
        Ok(())
    }

    /// Whether `handle` is attached
    pub fn is_attached(&self, handle: VmHandle) -> bool {
        self.core.registry.contains(handle)
    }

    /// Diagnostic state of an attached instance
    pub fn instance(&self, handle: VmHandle) -> Option<Arc<DiagnosticInstance>> {
        self.core.registry.get(handle)
    }

    /// Number of attached instances
    pub fn attached_count(&self) -> usize {
        self.core.registry.len()
    }

    /// Whether a failure has been reported since reporting was last re-armed.
    ///
    /// Reporting re-arms when the next outermost public call starts.
    pub fn error_reported(&self) -> bool {
        self.core.registry.latch().is_armed()
    }

    /// Composite stack of an attached `vm` as it is right now
    pub fn trace(&self, vm: &dyn ScriptVm) -> Option<StackTrace> {
        let instance = self.core.registry.get(vm.handle())?;
        Some(self.core.printer().print(vm, &instance))
    }

    /// The host process faulted; report and terminate.
    ///
    /// `vms` are the instances the host can still provide for reading frames.
    /// The one running the most recently entered native call is blamed.
    pub fn crash(&self, vms: &[&dyn ScriptVm]) -> Disposition {
        self.core.on_crash(vms)
    }

    /// The host observed `error` from running public `index` on `vm` outside
    /// the exec interceptor
    pub fn runtime_error(&self, vm: &dyn ScriptVm, index: i32, error: AmxError) -> Disposition {
        match self.core.registry.get(vm.handle()) {
            Some(instance) => self.core.on_runtime_error(vm, &instance, index, error),
            None => {
                warn!(
                    "{}: runtime error {} on a VM that is not attached",
                    vm.handle(),
                    error.code()
                );
                Disposition::Suppressed
            }
        }
    }

    /// Ask the next debug-hook callback to report its stack
    pub fn request_interrupt(&self) {
        self.core.interrupt.store(true, Ordering::Release);
    }

    /// A handle for requesting interrupts from elsewhere
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            flag: Arc::clone(&self.core.interrupt),
        }
    }
}

impl std::fmt::Debug for CrashDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrashDetector")
            .field("config", &self.core.config)
            .field("attached", &self.core.registry.len())
            .finish()
    }
}
