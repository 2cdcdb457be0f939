//! Instance registry
//!
//! Maps VM handles to their diagnostic state and owns the state shared by all
//! instances: the error-caught latch and the call sequence counter.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crashtrace_sdk::VmHandle;

use crate::error::DetectError;
use crate::instance::DiagnosticInstance;
use crate::tracking::{CallKind, CallRecord};

/// One-shot flag preventing a single failure from being reported twice
#[derive(Debug, Default)]
pub struct ErrorLatch {
    armed: AtomicBool,
}

impl ErrorLatch {
    /// Create a disarmed latch
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the latch. Returns `true` only for the caller that armed it.
    pub fn arm(&self) -> bool {
        !self.armed.swap(true, Ordering::AcqRel)
    }

    /// Whether a failure has already been reported
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    /// Allow the next failure to be reported
    pub fn clear(&self) {
        self.armed.store(false, Ordering::Release);
    }
}

/// All attached instances
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    instances: RwLock<FxHashMap<VmHandle, Arc<DiagnosticInstance>>>,
    latch: ErrorLatch,
    last_seq: AtomicU64,
}

impl InstanceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `instance`; fails if its handle is already registered
    pub fn insert(&self, instance: Arc<DiagnosticInstance>) -> Result<(), DetectError> {
        let handle = instance.handle();
        let mut instances = self.instances.write();
        if instances.contains_key(&handle) {
            return Err(DetectError::AlreadyAttached(handle));
        }
        instances.insert(handle, instance);
        Ok(())
    }

    /// Unregister `handle`
    pub fn remove(&self, handle: VmHandle) -> Option<Arc<DiagnosticInstance>> {
        self.instances.write().remove(&handle)
    }

    /// Instance registered for `handle`
    pub fn get(&self, handle: VmHandle) -> Option<Arc<DiagnosticInstance>> {
        self.instances.read().get(&handle).cloned()
    }

    /// Whether `handle` is registered
    pub fn contains(&self, handle: VmHandle) -> bool {
        self.instances.read().contains_key(&handle)
    }

    /// Number of registered instances
    pub fn len(&self) -> usize {
        self.instances.read().len()
    }

    /// Whether no instance is registered
    pub fn is_empty(&self) -> bool {
        self.instances.read().is_empty()
    }

    /// The error-caught latch
    pub fn latch(&self) -> &ErrorLatch {
        &self.latch
    }

    /// Next call sequence number; strictly increasing, starting at 1
    pub fn next_seq(&self) -> u64 {
        self.last_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Whether no call is in flight on any instance
    pub fn all_idle(&self) -> bool {
        self.instances.read().values().all(|i| i.calls().is_empty())
    }

    /// The instance whose innermost call is the most recently entered native
    /// call, with that call's record
    pub fn most_recent_native(&self) -> Option<(Arc<DiagnosticInstance>, CallRecord)> {
        self.instances
            .read()
            .values()
            .filter_map(|instance| {
                let top = instance.calls().top()?;
                (top.kind == CallKind::Native).then(|| (Arc::clone(instance), top))
            })
            .max_by_key(|(_, record)| record.seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug_info::DebugInfo;
    use crashtrace_sdk::ExtensionPoints;

    fn instance(handle: u64) -> Arc<DiagnosticInstance> {
        Arc::new(DiagnosticInstance::new(
            VmHandle(handle),
            None,
            DebugInfo::empty(),
            ExtensionPoints::default(),
        ))
    }

    fn native(index: i32, seq: u64) -> CallRecord {
        CallRecord {
            kind: CallKind::Native,
            index,
            frm: 0,
            cip: 0,
            seq,
        }
    }

    #[test]
    fn test_insert_is_unique_per_handle() {
        let registry = InstanceRegistry::new();
        registry.insert(instance(1)).unwrap();
        let err = registry.insert(instance(1)).unwrap_err();
        assert!(matches!(err, DetectError::AlreadyAttached(VmHandle(1))));
        assert_eq!(registry.len(), 1);

        assert!(registry.remove(VmHandle(1)).is_some());
        assert!(registry.remove(VmHandle(1)).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_latch_arms_once() {
        let latch = ErrorLatch::new();
        assert!(!latch.is_armed());
        assert!(latch.arm());
        assert!(!latch.arm());
        assert!(latch.is_armed());
        latch.clear();
        assert!(latch.arm());
    }

    #[test]
    fn test_sequence_increases() {
        let registry = InstanceRegistry::new();
        let a = registry.next_seq();
        let b = registry.next_seq();
        assert!(b > a);
        assert_eq!(a, 1);
    }

    #[test]
    fn test_most_recent_native_across_instances() {
        let registry = InstanceRegistry::new();
        let first = instance(1);
        let second = instance(2);
        registry.insert(Arc::clone(&first)).unwrap();
        registry.insert(Arc::clone(&second)).unwrap();
        assert!(registry.most_recent_native().is_none());
        assert!(registry.all_idle());

        let _a = first.calls().enter(native(0, 1));
        let _b = second.calls().enter(native(5, 2));
        let (owner, record) = registry.most_recent_native().unwrap();
        assert_eq!(owner.handle(), VmHandle(2));
        assert_eq!(record.index, 5);
        assert!(!registry.all_idle());

        // A public call on top hides the native below it
        let _c = second.calls().enter(CallRecord {
            kind: CallKind::Public,
            index: 0,
            frm: 0,
            cip: 0,
            seq: 3,
        });
        let (owner, _) = registry.most_recent_native().unwrap();
        assert_eq!(owner.handle(), VmHandle(1));
    }
}
