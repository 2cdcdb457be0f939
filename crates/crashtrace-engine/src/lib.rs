//! crashtrace engine - crash and runtime-error diagnostics for script VMs
//!
//! Attaches to every loaded VM instance through its three extension points
//! and, when something goes wrong, prints a call stack that crosses freely
//! between script frames and host native frames:
//!
//! ```text
//! Native function Foo() is not registered (index 3)
//! Backtrace of grandlarc.amx:
//! #0 Foo (native, unresolved)
//! #1 Main (grandlarc.pwn:12)
//! ```
//!
//! - **Detector** (`detector`): attach/detach and the failure entry points
//! - **Hooks** (`hooks`): the debug hook, native dispatcher and exec entry interceptors
//! - **Handlers** (`handlers`): what each kind of failure reports and whether it is fatal
//! - **Printer** (`printer`): the composite stack walk
//! - **Debug info** (`debug_info`): code address to function, file and line
//! - **Symbols** (`symbols`) and **trampolines** (`trampoline`): naming native code
//!
//! # Example
//!
//! ```rust,ignore
//! use crashtrace_engine::{Config, CrashDetector};
//!
//! crashtrace_engine::logging::init("crashtrace=info");
//! let detector = CrashDetector::new(Config::load("server.cfg".as_ref())?);
//! detector.attach(&mut vm)?;
//! vm.exec(EXEC_MAIN)?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod debug_info;
pub mod detector;
pub mod error;
pub mod handlers;
mod hooks;
pub mod instance;
pub mod logging;
pub mod printer;
pub mod registry;
pub mod report;
pub mod symbols;
pub mod tracking;
pub mod trampoline;

pub use config::{Config, ConfigError};
pub use debug_info::{CodeSymbol, DebugInfo, FrameLink, SourceLocation};
pub use detector::{CrashDetector, DetectorBuilder, InterruptHandle};
pub use error::DetectError;
pub use handlers::Disposition;
pub use instance::DiagnosticInstance;
pub use printer::{NativeTarget, StackPrinter, StackTrace, TraceFrame};
pub use registry::{ErrorLatch, InstanceRegistry};
pub use report::{
    FailureKind, MemorySink, ProcessExit, Report, ReportSink, Terminator, TracingSink,
};
pub use symbols::{ModuleMap, NativeSymbol, ProcessSymbols, SymbolResolver};
pub use tracking::{CallGuard, CallKind, CallRecord, CallStack};
pub use trampoline::{resolve_jump, Abi, CodeReader, MappedBytes, NoMemory, ProcessMemory};
