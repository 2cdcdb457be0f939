//! Stack printer
//!
//! Builds the composite call stack of one VM instance: bytecode frames found
//! by following the saved frame links, stitched across native boundaries with
//! the instance's call-tracking records.
//!
//! The records are consumed innermost first. Each public call owns one
//! bytecode segment, which ends at the frame whose return address is zero (the
//! frame the VM created on entry). Below that segment there is either the
//! native that called back into the VM, whose own bytecode segment continues
//! at the frame recorded with it, or nothing.

use std::fmt;

use crashtrace_sdk::{Cell, ScriptVm, UCell, EXEC_MAIN};

use crate::config::DEFAULT_MAX_TRACE_DEPTH;
use crate::debug_info::{DebugInfo, SourceLocation};
use crate::instance::DiagnosticInstance;
use crate::symbols::{NativeSymbol, SymbolResolver};
use crate::trampoline::{self, Abi, CodeReader, DEFAULT_MAX_HOPS};
use crate::tracking::{CallKind, CallRecord};

/// Where a native frame's implementation lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeTarget {
    /// No implementation is registered for the native
    Unresolved,
    /// The implementation, after following jump stubs
    Resolved(NativeSymbol),
}

/// One frame of a composite stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceFrame {
    /// A bytecode frame
    Script {
        /// Code address executing in this frame
        address: UCell,
        /// Owning function, when the debug info knows it
        function: Option<String>,
        /// Source position of `address`
        location: Option<SourceLocation>,
    },
    /// A host function called from bytecode
    Native {
        /// Native table index
        index: Cell,
        /// Imported name
        name: Option<String>,
        /// Host implementation
        target: NativeTarget,
    },
}

impl fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceFrame::Script {
                address,
                function,
                location,
            } => {
                f.write_str(function.as_deref().unwrap_or("<unknown>"))?;
                match location {
                    Some(location) => write!(f, " ({})", location),
                    None => write!(f, " ({:#010x})", address),
                }
            }
            TraceFrame::Native {
                index,
                name,
                target,
            } => {
                match name {
                    Some(name) => f.write_str(name)?,
                    None => write!(f, "<native #{}>", index)?,
                }
                match target {
                    NativeTarget::Unresolved => f.write_str(" (native, unresolved)"),
                    NativeTarget::Resolved(symbol) => write!(f, " (native, {})", symbol),
                }
            }
        }
    }
}

/// A composite call stack, innermost frame first
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackTrace {
    /// Frames in order, innermost first
    pub frames: Vec<TraceFrame>,
    /// The walk stopped at the depth limit
    pub truncated: bool,
}

impl StackTrace {
    /// One line per frame, plus a marker when truncated
    pub fn lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .frames
            .iter()
            .enumerate()
            .map(|(i, frame)| format!("#{} {}", i, frame))
            .collect();
        if self.truncated {
            lines.push(format!(
                "... (stack truncated after {} frames)",
                self.frames.len()
            ));
        }
        lines
    }

    /// Number of frames
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether there are no frames
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl fmt::Display for StackTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in self.lines() {
            writeln!(f, "{}", line)?;
        }
        Ok(())
    }
}

/// Where the walk is
#[derive(Debug, Clone, Copy)]
enum Step {
    /// Inside bytecode at this frame and code address
    Bytecode { frm: UCell, cip: UCell, entered: bool },
    /// Just left the bytecode segment of this public call
    Boundary(CallRecord),
}

/// Frames collected so far, bounded
struct Collector {
    frames: Vec<TraceFrame>,
    max_depth: usize,
    truncated: bool,
}

impl Collector {
    fn push(&mut self, frame: TraceFrame) -> bool {
        if self.frames.len() >= self.max_depth {
            self.truncated = true;
            return false;
        }
        self.frames.push(frame);
        true
    }
}

/// Walks frames and names them
pub struct StackPrinter<'a> {
    symbols: &'a dyn SymbolResolver,
    code: &'a dyn CodeReader,
    abi: Abi,
    max_depth: usize,
    max_hops: usize,
}

impl<'a> StackPrinter<'a> {
    /// Create a printer with default limits
    pub fn new(symbols: &'a dyn SymbolResolver, code: &'a dyn CodeReader, abi: Abi) -> Self {
        Self {
            symbols,
            code,
            abi,
            max_depth: DEFAULT_MAX_TRACE_DEPTH,
            max_hops: DEFAULT_MAX_HOPS,
        }
    }

    /// Set the maximum number of frames
    pub fn max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Set the maximum number of chained jump stubs followed
    pub fn max_hops(mut self, max_hops: usize) -> Self {
        self.max_hops = max_hops;
        self
    }

    /// Trace of `vm` using the instance's debug info and a snapshot of its
    /// in-flight calls
    pub fn print(&self, vm: &dyn ScriptVm, instance: &DiagnosticInstance) -> StackTrace {
        self.print_records(vm, instance.debug_info(), &instance.calls().snapshot())
    }

    /// Trace of `vm` given explicit call records, outermost first
    pub fn print_records(
        &self,
        vm: &dyn ScriptVm,
        debug: &DebugInfo,
        records: &[CallRecord],
    ) -> StackTrace {
        let mut out = Collector {
            frames: Vec::new(),
            max_depth: self.max_depth,
            truncated: false,
        };
        let regs = vm.registers();
        let mut remaining = records;

        let mut step = match remaining.split_last() {
            Some((top, rest)) if top.kind == CallKind::Native => {
                if !out.push(self.native_frame(vm, top)) {
                    return finish(out);
                }
                remaining = rest;
                Step::Bytecode {
                    frm: top.frm,
                    cip: top.cip,
                    entered: true,
                }
            }
            None if regs.frm == 0 => return finish(out),
            _ => Step::Bytecode {
                frm: regs.frm,
                cip: regs.cip,
                entered: true,
            },
        };

        loop {
            step = match step {
                Step::Bytecode { frm, cip, entered } => {
                    // The public was called but its frame never got created
                    if entered {
                        if let Some((public, rest)) = remaining.split_last() {
                            if public.kind == CallKind::Public && public.frm == frm {
                                if !out.push(public_frame(vm, debug, public)) {
                                    break;
                                }
                                remaining = rest;
                                step = Step::Boundary(*public);
                                continue;
                            }
                        }
                    }

                    if !out.push(script_frame(debug, cip)) {
                        break;
                    }
                    let Some(link) = debug.frame_link(vm, frm) else {
                        break;
                    };
                    if link.is_entry() {
                        match remaining.split_last() {
                            Some((public, rest)) if public.kind == CallKind::Public => {
                                remaining = rest;
                                Step::Boundary(*public)
                            }
                            _ => break,
                        }
                    } else {
                        Step::Bytecode {
                            frm: link.caller_frm,
                            cip: link.return_address,
                            entered: false,
                        }
                    }
                }
                Step::Boundary(public) => match remaining.split_last() {
                    Some((native, rest)) if native.kind == CallKind::Native => {
                        if !out.push(self.native_frame(vm, native)) {
                            break;
                        }
                        remaining = rest;
                        Step::Bytecode {
                            frm: native.frm,
                            cip: native.cip,
                            entered: true,
                        }
                    }
                    // A public run directly from inside another one
                    Some(_) => Step::Bytecode {
                        frm: public.frm,
                        cip: public.cip,
                        entered: true,
                    },
                    None => break,
                },
            };
        }
        finish(out)
    }

    fn native_frame(&self, vm: &dyn ScriptVm, record: &CallRecord) -> TraceFrame {
        let entry = vm.native(record.index);
        let target = match entry.and_then(|e| e.address) {
            None => NativeTarget::Unresolved,
            Some(address) => {
                let real = trampoline::resolve_jump(self.code, address, self.abi, self.max_hops);
                NativeTarget::Resolved(self.symbols.resolve(real))
            }
        };
        TraceFrame::Native {
            index: record.index,
            name: entry.map(|e| e.name.clone()),
            target,
        }
    }
}

fn finish(out: Collector) -> StackTrace {
    StackTrace {
        frames: out.frames,
        truncated: out.truncated,
    }
}

fn script_frame(debug: &DebugInfo, address: UCell) -> TraceFrame {
    match debug.resolve(address) {
        Some(symbol) => TraceFrame::Script {
            address,
            function: Some(symbol.function),
            location: symbol.location,
        },
        None => TraceFrame::Script {
            address,
            function: None,
            location: None,
        },
    }
}

/// Frame for a public whose entry frame does not exist yet
fn public_frame(vm: &dyn ScriptVm, debug: &DebugInfo, record: &CallRecord) -> TraceFrame {
    let Some(public) = vm.public(record.index) else {
        let function = (record.index == EXEC_MAIN).then(|| "main".to_string());
        return TraceFrame::Script {
            address: record.cip,
            function,
            location: None,
        };
    };
    match script_frame(debug, public.address) {
        TraceFrame::Script {
            function: None,
            address,
            location,
        } => TraceFrame::Script {
            address,
            function: Some(public.name.clone()),
            location,
        },
        frame => frame,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script(function: Option<&str>, location: Option<(&str, u32)>) -> TraceFrame {
        TraceFrame::Script {
            address: 0x1a4,
            function: function.map(String::from),
            location: location.map(|(file, line)| SourceLocation {
                file: file.to_string(),
                line,
            }),
        }
    }

    #[test]
    fn test_script_frame_formats() {
        assert_eq!(
            script(Some("Main"), Some(("file.pwn", 12))).to_string(),
            "Main (file.pwn:12)"
        );
        assert_eq!(script(Some("Main"), None).to_string(), "Main (0x000001a4)");
        assert_eq!(script(None, None).to_string(), "<unknown> (0x000001a4)");
    }

    #[test]
    fn test_native_frame_formats() {
        let unresolved = TraceFrame::Native {
            index: 3,
            name: Some("Foo".to_string()),
            target: NativeTarget::Unresolved,
        };
        assert_eq!(unresolved.to_string(), "Foo (native, unresolved)");

        let resolved = TraceFrame::Native {
            index: 0,
            name: Some("SetTimer".to_string()),
            target: NativeTarget::Resolved(NativeSymbol {
                address: 0x2000_0110,
                module: Some("plugin.so".to_string()),
                symbol: Some("timer_impl".to_string()),
                offset: 0x10,
            }),
        };
        assert_eq!(
            resolved.to_string(),
            "SetTimer (native, plugin.so!timer_impl+0x10)"
        );

        let nameless = TraceFrame::Native {
            index: 9,
            name: None,
            target: NativeTarget::Unresolved,
        };
        assert_eq!(nameless.to_string(), "<native #9> (native, unresolved)");
    }

    #[test]
    fn test_trace_lines_and_truncation_marker() {
        let trace = StackTrace {
            frames: vec![script(Some("A"), None), script(None, None)],
            truncated: true,
        };
        assert_eq!(
            trace.lines(),
            vec![
                "#0 A (0x000001a4)".to_string(),
                "#1 <unknown> (0x000001a4)".to_string(),
                "... (stack truncated after 2 frames)".to_string(),
            ]
        );
        assert_eq!(trace.len(), 2);
    }
}
