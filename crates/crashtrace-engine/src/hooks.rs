//! Interceptors installed into a VM's extension points
//!
//! One set is created per attached instance. Each holds the instance it
//! belongs to, so it keeps forwarding to the handlers it replaced even after
//! the instance is detached (another layer may have chained on top of it and
//! still call into it).

use std::sync::Arc;

use crashtrace_sdk::{
    AmxError, AmxResult, Cell, DebugHook, ExecEntry, NativeDispatcher, NativeEntry, ScriptVm,
};

use crate::detector::DetectorCore;
use crate::handlers::NativeFault;
use crate::instance::DiagnosticInstance;
use crate::tracking::{CallKind, CallRecord};

/// Per-instruction hook: notices interrupt requests
pub(crate) struct DebugInterceptor {
    core: Arc<DetectorCore>,
    instance: Arc<DiagnosticInstance>,
}

impl DebugHook for DebugInterceptor {
    fn on_instruction(&self, vm: &mut dyn ScriptVm) -> AmxResult<()> {
        if self.core.take_interrupt() {
            self.core.on_interrupt(&*vm, &self.instance);
        }
        match self.instance.previous_debug_hook() {
            Some(next) => next.on_instruction(vm),
            None => Ok(()),
        }
    }
}

/// Native call hook: tracks the call and reports missing or failing natives
pub(crate) struct DispatchInterceptor {
    core: Arc<DetectorCore>,
    instance: Arc<DiagnosticInstance>,
}

impl NativeDispatcher for DispatchInterceptor {
    fn dispatch(&self, vm: &mut dyn ScriptVm, index: Cell, params: &[Cell]) -> AmxResult<Cell> {
        let regs = vm.registers();
        let _call = self.instance.calls().enter(CallRecord {
            kind: CallKind::Native,
            index,
            frm: regs.frm,
            cip: regs.cip,
            seq: self.core.registry.next_seq(),
        });

        let in_table = usize::try_from(index).is_ok_and(|i| i < vm.native_count());
        if !in_table {
            self.core
                .on_native_error(&*vm, &self.instance, index, NativeFault::OutOfRange);
            return Err(AmxError::Native);
        }
        if !vm.native(index).is_some_and(NativeEntry::is_registered) {
            self.core
                .on_native_error(&*vm, &self.instance, index, NativeFault::Unregistered);
            return Err(AmxError::Native);
        }
        let Some(next) = self.instance.previous_dispatcher() else {
            let fault = NativeFault::Failed(AmxError::Callback);
            self.core.on_native_error(&*vm, &self.instance, index, fault);
            return Err(AmxError::Callback);
        };

        match next.dispatch(vm, index, params) {
            Ok(value) => Ok(value),
            // Forced exit is how natives stop the script, not a failure
            Err(AmxError::Exit) => Err(AmxError::Exit),
            Err(error) => {
                let fault = NativeFault::Failed(error);
                self.core.on_native_error(&*vm, &self.instance, index, fault);
                Err(AmxError::Native)
            }
        }
    }
}

/// Exec entry hook: tracks public calls and reports runtime errors
pub(crate) struct ExecInterceptor {
    core: Arc<DetectorCore>,
    instance: Arc<DiagnosticInstance>,
}

impl ExecEntry for ExecInterceptor {
    fn exec(&self, vm: &mut dyn ScriptVm, index: i32) -> AmxResult<Cell> {
        // A new outermost call: whatever was reported before has unwound
        self.core.rearm_if_idle();

        let regs = vm.registers();
        let _call = self.instance.calls().enter(CallRecord {
            kind: CallKind::Public,
            index,
            frm: regs.frm,
            cip: regs.cip,
            seq: self.core.registry.next_seq(),
        });

        let result = match self.instance.previous_exec() {
            Some(next) => next.exec(vm, index),
            None => Err(AmxError::Init),
        };
        if let Err(error) = result {
            // Reported while the public is still on the tracking stack
            self.core.on_runtime_error(&*vm, &self.instance, index, error);
        }
        result
    }
}

/// The three interceptors of one attached instance
pub(crate) struct Interceptors {
    pub(crate) debug_hook: Arc<dyn DebugHook>,
    pub(crate) dispatcher: Arc<dyn NativeDispatcher>,
    pub(crate) exec: Arc<dyn ExecEntry>,
}

impl Interceptors {
    pub(crate) fn new(core: &Arc<DetectorCore>, instance: &Arc<DiagnosticInstance>) -> Self {
        Self {
            debug_hook: Arc::new(DebugInterceptor {
                core: Arc::clone(core),
                instance: Arc::clone(instance),
            }),
            dispatcher: Arc::new(DispatchInterceptor {
                core: Arc::clone(core),
                instance: Arc::clone(instance),
            }),
            exec: Arc::new(ExecInterceptor {
                core: Arc::clone(core),
                instance: Arc::clone(instance),
            }),
        }
    }
}

/// Put `previous` back into `slot` if `slot` still holds `ours`.
/// Returns whether it did.
pub(crate) fn restore<T: ?Sized>(
    slot: &mut Option<Arc<T>>,
    ours: &Arc<T>,
    previous: Option<Arc<T>>,
) -> bool {
    let still_ours = slot
        .as_ref()
        .is_some_and(|current| std::ptr::addr_eq(Arc::as_ptr(current), Arc::as_ptr(ours)));
    if still_ours {
        *slot = previous;
    }
    still_ours
}
