//! Failure reports, where they go, and how the process ends

use std::fmt;
use std::path::PathBuf;

use parking_lot::Mutex;

use crate::printer::StackTrace;

/// The kind of failure a report describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// The host process faulted
    HostCrash,
    /// The VM returned an error code
    RuntimeError,
    /// A native function is missing or failed
    NativeCallFailure,
    /// The host asked for a trace of whatever is running
    Interrupt,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::HostCrash => "host crash",
            FailureKind::RuntimeError => "runtime error",
            FailureKind::NativeCallFailure => "native call failure",
            FailureKind::Interrupt => "interrupt",
        };
        f.write_str(name)
    }
}

/// One failure report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    /// What happened
    pub kind: FailureKind,
    /// File name of the module that was executing, when known
    pub module: Option<String>,
    /// Full path of that module, when known
    pub path: Option<PathBuf>,
    /// First line of the report
    pub headline: String,
    /// Composite call stack, when one could be taken
    pub trace: Option<StackTrace>,
}

impl Report {
    /// The report as printable lines
    pub fn lines(&self) -> Vec<String> {
        let mut lines = vec![self.headline.clone()];
        if let Some(trace) = &self.trace {
            match &self.module {
                Some(module) => lines.push(format!("Backtrace of {}:", module)),
                None => lines.push("Backtrace:".to_string()),
            }
            lines.extend(trace.lines());
        }
        lines
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, line) in self.lines().iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            f.write_str(line)?;
        }
        Ok(())
    }
}

// ============================================================================
// Sinks
// ============================================================================

/// Destination for reports
pub trait ReportSink: Send + Sync {
    /// Deliver `report`. Must not fail; a sink that cannot write drops it.
    fn emit(&self, report: &Report);
}

/// Writes each report line as an `error` event
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ReportSink for TracingSink {
    fn emit(&self, report: &Report) {
        for line in report.lines() {
            tracing::error!(target: "crashtrace", kind = %report.kind, "{}", line);
        }
    }
}

/// Keeps reports in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    reports: Mutex<Vec<Report>>,
}

impl MemorySink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies of all reports so far
    pub fn reports(&self) -> Vec<Report> {
        self.reports.lock().clone()
    }

    /// All report lines so far, in order
    pub fn lines(&self) -> Vec<String> {
        self.reports.lock().iter().flat_map(Report::lines).collect()
    }

    /// Remove and return all reports
    pub fn take(&self) -> Vec<Report> {
        std::mem::take(&mut *self.reports.lock())
    }
}

impl ReportSink for MemorySink {
    fn emit(&self, report: &Report) {
        self.reports.lock().push(report.clone());
    }
}

// ============================================================================
// Termination
// ============================================================================

/// Ends the process after a fatal report
pub trait Terminator: Send + Sync {
    /// Called once the report for a fatal failure has been emitted
    fn terminate(&self, kind: FailureKind);
}

/// Exits the process with status 1
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessExit;

impl Terminator for ProcessExit {
    fn terminate(&self, kind: FailureKind) {
        tracing::error!(target: "crashtrace", "terminating after {}", kind);
        std::process::exit(1);
    }
}
