//! Call-tracking stack
//!
//! Every native call and every public call made through an attached VM pushes
//! a record here for its duration. The bytecode frame chain alone cannot be
//! walked across a native boundary (a native that calls back into a public
//! starts a fresh chain), so the printer stitches the chains together using
//! these records.

use parking_lot::Mutex;

use crashtrace_sdk::{Cell, UCell};

/// What kind of call a record tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    /// Bytecode called a native function
    Native,
    /// The host called a public function
    Public,
}

/// One in-flight call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallRecord {
    /// Native or public
    pub kind: CallKind,
    /// Native table index, or public index (may be an `EXEC_*` value)
    pub index: Cell,
    /// Frame pointer at the moment of the call
    pub frm: UCell,
    /// Code pointer at the moment of the call
    pub cip: UCell,
    /// Process-wide call order
    pub seq: u64,
}

/// LIFO of in-flight calls for one VM instance
#[derive(Debug, Default)]
pub struct CallStack {
    records: Mutex<Vec<CallRecord>>,
}

impl CallStack {
    /// Create an empty stack
    pub fn new() -> Self {
        Self::default()
    }

    /// Push `record` and return a guard that pops it when dropped
    pub fn enter(&self, record: CallRecord) -> CallGuard<'_> {
        self.records.lock().push(record);
        CallGuard {
            stack: self,
            seq: record.seq,
        }
    }

    /// Remove the record with sequence `seq`.
    ///
    /// It is always the top one unless a guard was leaked; then the record is
    /// removed from wherever it sits so the stack still matches reality.
    fn exit(&self, seq: u64) -> Option<CallRecord> {
        let mut records = self.records.lock();
        match records.last() {
            Some(top) if top.seq == seq => records.pop(),
            _ => {
                let pos = records.iter().rposition(|r| r.seq == seq)?;
                tracing::warn!(
                    "call #{} left out of order ({} newer records above it)",
                    seq,
                    records.len() - pos - 1
                );
                Some(records.remove(pos))
            }
        }
    }

    /// Innermost in-flight call
    pub fn top(&self) -> Option<CallRecord> {
        self.records.lock().last().copied()
    }

    /// Copy of the records, outermost first
    pub fn snapshot(&self) -> Vec<CallRecord> {
        self.records.lock().clone()
    }

    /// Number of in-flight calls
    pub fn depth(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether no call is in flight
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

/// Pops its record when dropped, including during unwinding
#[derive(Debug)]
#[must_use = "the call is untracked as soon as the guard is dropped"]
pub struct CallGuard<'a> {
    stack: &'a CallStack,
    seq: u64,
}

impl CallGuard<'_> {
    /// Sequence number of the guarded record
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.stack.exit(self.seq);
    }
}
