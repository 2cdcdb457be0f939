//! Shared fixtures for the engine integration tests

#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;

use crashtrace_engine::{
    Abi, Config, CrashDetector, FailureKind, MemorySink, ModuleMap, NoMemory, Terminator,
};
use crashtrace_sdk::DebugBlockWriter;

/// Start of `helper` in the fixture module
pub const HELPER: u32 = 0x00;
/// Start of the `Main` public
pub const MAIN: u32 = 0x40;
/// An instruction inside `Main` on line 12
pub const MAIN_LINE_12: u32 = 0x58;
/// Start of the `OnTimer` public
pub const ON_TIMER: u32 = 0x80;
/// An instruction inside `OnTimer` on line 22
pub const ON_TIMER_LINE_22: u32 = 0x90;

/// Debug block for a module with `helper`, `Main` and `OnTimer`
pub fn fixture_debug_block() -> Vec<u8> {
    DebugBlockWriter::new()
        .file(0x00, "file.pwn")
        .line(0x00, 2)
        .line(0x08, 3)
        .line(0x40, 9)
        .line(MAIN_LINE_12, 11)
        .line(ON_TIMER, 19)
        .line(ON_TIMER_LINE_22, 21)
        .function("helper", 0, HELPER, MAIN)
        .function("Main", 0, MAIN, ON_TIMER)
        .function("OnTimer", 1, ON_TIMER, 0xc0)
        .tag(0, "_")
        .tag(1, "bool")
        .finish()
}

/// Records what would have ended the process
#[derive(Default)]
pub struct RecordingTerminator {
    calls: Mutex<Vec<FailureKind>>,
}

impl RecordingTerminator {
    pub fn calls(&self) -> Vec<FailureKind> {
        self.calls.lock().clone()
    }
}

impl Terminator for RecordingTerminator {
    fn terminate(&self, kind: FailureKind) {
        self.calls.lock().push(kind);
    }
}

/// A detector wired to in-memory collaborators
pub struct Harness {
    pub detector: Arc<CrashDetector>,
    pub sink: Arc<MemorySink>,
    pub terminator: Arc<RecordingTerminator>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        Self::with_symbols(config, ModuleMap::new())
    }

    pub fn with_symbols(config: Config, symbols: ModuleMap) -> Self {
        let sink = Arc::new(MemorySink::new());
        let terminator = Arc::new(RecordingTerminator::default());
        let detector = CrashDetector::builder()
            .config(config)
            .sink(sink.clone())
            .terminator(terminator.clone())
            .symbols(Arc::new(symbols))
            .code_reader(Arc::new(NoMemory))
            .abi(Abi::X86_64)
            .build();
        let detector = Arc::new(detector);
        Self {
            detector,
            sink,
            terminator,
        }
    }

    /// Trace lines of the only report so far
    pub fn single_report_lines(&self) -> Vec<String> {
        let reports = self.sink.reports();
        assert_eq!(reports.len(), 1, "expected one report, got {:#?}", reports);
        reports[0].lines()
    }
}
