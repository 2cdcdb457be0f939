//! Failure handlers
//!
//! Each handler assembles one report and decides whether the process ends.
//! All of them consult the error-caught latch first so a failure observed
//! through two paths (a failing native, then the exec entry returning its
//! error) is reported once.

use std::sync::atomic::Ordering;

use crashtrace_sdk::{AmxError, Cell, ScriptVm, EXEC_GDK};

use crate::detector::DetectorCore;
use crate::instance::DiagnosticInstance;
use crate::report::{FailureKind, Report};

/// What a handler did with a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Reported, then the terminator ran
    Terminate,
    /// Reported; control returns to the VM or host
    Continue,
    /// Not reported (already reported, or not a failure)
    Suppressed,
}

/// Why a native call did not complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NativeFault {
    /// The index lies outside the native table
    OutOfRange,
    /// The table entry has no host function behind it
    Unregistered,
    /// The host function returned an error
    Failed(AmxError),
}

impl DetectorCore {
    fn report(
        &self,
        kind: FailureKind,
        instance: Option<&DiagnosticInstance>,
        headline: String,
        trace_from: Option<&dyn ScriptVm>,
    ) {
        let trace = match (instance, trace_from) {
            (Some(instance), Some(vm)) => Some(self.printer().print(vm, instance)),
            _ => None,
        };
        let report = Report {
            kind,
            module: instance.map(|i| i.name().to_string()),
            path: instance.and_then(|i| i.path()).map(|p| p.to_path_buf()),
            headline,
            trace,
        };
        self.sink.emit(&report);
    }

    fn terminate(&self, kind: FailureKind) -> Disposition {
        self.terminating.store(true, Ordering::Release);
        self.terminator.terminate(kind);
        Disposition::Terminate
    }

    /// The host process faulted. `vms` are the instances the host can still
    /// hand out for reading; the one with the most recent in-flight native
    /// call is blamed.
    pub(crate) fn on_crash(&self, vms: &[&dyn ScriptVm]) -> Disposition {
        let first = self.registry.latch().arm();
        match self.registry.most_recent_native() {
            Some((instance, _)) => {
                let vm = if first {
                    vms.iter().copied().find(|vm| vm.handle() == instance.handle())
                } else {
                    None
                };
                let headline = format!("Host process crashed while executing {}", instance.name());
                self.report(FailureKind::HostCrash, Some(&instance), headline, vm);
            }
            None => {
                self.report(
                    FailureKind::HostCrash,
                    None,
                    "Host process crashed due to an unknown error".to_string(),
                    None,
                );
            }
        }
        self.terminate(FailureKind::HostCrash)
    }

    /// The VM returned `error` from running public `index`
    pub(crate) fn on_runtime_error(
        &self,
        vm: &dyn ScriptVm,
        instance: &DiagnosticInstance,
        index: i32,
        error: AmxError,
    ) -> Disposition {
        match error {
            // A GDK host probing for a public the module does not define
            AmxError::Index if index == EXEC_GDK => return Disposition::Suppressed,
            AmxError::Exit | AmxError::Sleep => return Disposition::Suppressed,
            _ => {}
        }
        if !self.registry.latch().arm() {
            tracing::debug!(
                "{}: runtime error {} already reported",
                instance.handle(),
                error.code()
            );
            return Disposition::Suppressed;
        }

        let headline = format!("Run time error {}: \"{}\"", error.code(), error);
        self.report(FailureKind::RuntimeError, Some(instance), headline, Some(vm));

        if self.config.die_on_error {
            self.terminate(FailureKind::RuntimeError)
        } else {
            Disposition::Continue
        }
    }

    /// Native `index` could not be called, or returned an error
    pub(crate) fn on_native_error(
        &self,
        vm: &dyn ScriptVm,
        instance: &DiagnosticInstance,
        index: Cell,
        fault: NativeFault,
    ) -> Disposition {
        if !self.registry.latch().arm() {
            return Disposition::Suppressed;
        }
        let name = vm
            .native(index)
            .map(|n| n.name.clone())
            .unwrap_or_else(|| format!("<native #{}>", index));
        let headline = match fault {
            NativeFault::OutOfRange => format!(
                "Native function index {} is out of range ({} natives)",
                index,
                vm.native_count()
            ),
            NativeFault::Unregistered => {
                format!("Native function {}() is not registered (index {})", name, index)
            }
            NativeFault::Failed(error) => format!("Native function {}() failed: {}", name, error),
        };
        self.report(FailureKind::NativeCallFailure, Some(instance), headline, Some(vm));
        Disposition::Continue
    }

    /// An interrupt was requested and `vm` is the first to notice
    pub(crate) fn on_interrupt(
        &self,
        vm: &dyn ScriptVm,
        instance: &DiagnosticInstance,
    ) -> Disposition {
        if self.registry.latch().is_armed() {
            return Disposition::Suppressed;
        }
        self.report(
            FailureKind::Interrupt,
            Some(instance),
            "Interrupt requested".to_string(),
            Some(vm),
        );
        Disposition::Continue
    }

    /// Re-arm reporting when no call is in flight anywhere and the process
    /// is not going down
    pub(crate) fn rearm_if_idle(&self) {
        if self.registry.latch().is_armed()
            && !self.terminating.load(Ordering::Acquire)
            && self.registry.all_idle()
        {
            self.registry.latch().clear();
        }
    }
}
