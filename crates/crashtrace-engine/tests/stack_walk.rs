//! Integration tests for the composite stack walk

mod common;

use std::sync::Arc;

use parking_lot::Mutex;

use common::*;
use crashtrace_engine::{Abi, Config, CrashDetector, MappedBytes, MemorySink, ModuleMap};
use crashtrace_sdk::{AmxError, AmxResult, Cell, ScriptVm};
use crashtrace_test::{SimVm, NATIVE_BASE_ADDRESS};

/// `helper` entered `depth` times, each level calling the next from line 4,
/// failing at the bottom
fn recurse(vm: &mut SimVm, depth: u32) -> AmxResult<Cell> {
    if depth == 0 {
        return Err(AmxError::Bounds);
    }
    vm.call(HELPER, |vm| {
        vm.set_cip(0x08);
        recurse(vm, depth - 1)
    })
}

#[test]
fn test_trace_is_deterministic() {
    let h = Harness::new();
    let traces = Arc::new(Mutex::new(Vec::new()));

    let (detector, seen) = (Arc::clone(&h.detector), Arc::clone(&traces));
    let mut vm = SimVm::new(1)
        .with_debug_block(fixture_debug_block())
        .with_native("snapshot", move |vm, _| {
            for _ in 0..2 {
                if let Some(trace) = detector.trace(&*vm) {
                    seen.lock().push(trace.lines());
                }
            }
            Ok(0)
        })
        .with_public("Main", MAIN, |vm| {
            vm.set_cip(MAIN_LINE_12);
            vm.call(HELPER, |vm| {
                vm.set_cip(0x08);
                vm.call_native(0, &[])
            })
        });
    h.detector.attach(&mut vm).unwrap();

    assert_eq!(vm.exec(0), Ok(0));
    let traces = traces.lock();
    assert_eq!(traces.len(), 2);
    assert_eq!(traces[0], traces[1]);
    assert_eq!(
        traces[0],
        vec![
            "#0 snapshot (native, 0x70000000)",
            "#1 helper (file.pwn:4)",
            "#2 Main (file.pwn:12)",
        ]
    );
    assert!(h.sink.reports().is_empty());
}

#[test]
fn test_cyclic_frame_chain_is_bounded() {
    let config = Config {
        max_trace_depth: 5,
        ..Config::default()
    };
    let h = Harness::with_config(config);
    let mut vm = SimVm::new(1)
        .with_debug_block(fixture_debug_block())
        .with_public("Main", MAIN, |vm| {
            // Corrupt the frame so it links back to itself
            let frm = vm.registers().frm;
            vm.write_cell(frm, frm as Cell);
            vm.write_cell(frm + 4, 0x44);
            vm.set_cip(MAIN_LINE_12);
            Err(AmxError::Bounds)
        });
    h.detector.attach(&mut vm).unwrap();

    assert!(vm.exec(0).is_err());
    let lines = h.single_report_lines();
    assert_eq!(
        &lines[2..],
        [
            "#0 Main (file.pwn:12)",
            "#1 Main (file.pwn:10)",
            "#2 Main (file.pwn:10)",
            "#3 Main (file.pwn:10)",
            "#4 Main (file.pwn:10)",
            "... (stack truncated after 5 frames)",
        ]
    );
}

#[test]
fn test_deep_recursion_is_truncated() {
    let h = Harness::new();
    let mut vm = SimVm::new(1)
        .with_debug_block(fixture_debug_block())
        .with_public("Main", MAIN, |vm| recurse(vm, 150));
    h.detector.attach(&mut vm).unwrap();

    assert!(vm.exec(0).is_err());
    let reports = h.sink.reports();
    let trace = reports[0].trace.as_ref().unwrap();
    assert_eq!(trace.len(), 100);
    assert!(trace.truncated);
    assert_eq!(
        trace.lines().last().map(String::as_str),
        Some("... (stack truncated after 100 frames)")
    );
}

#[test]
fn test_nested_calls_in_order() {
    let h = Harness::new();
    let mut vm = SimVm::new(1)
        .with_debug_block(fixture_debug_block())
        .with_public("Main", MAIN, |vm| {
            vm.set_cip(MAIN_LINE_12);
            recurse(vm, 2)
        });
    h.detector.attach(&mut vm).unwrap();

    assert!(vm.exec(0).is_err());
    assert_eq!(
        &h.single_report_lines()[2..],
        [
            "#0 helper (file.pwn:4)",
            "#1 helper (file.pwn:4)",
            "#2 Main (file.pwn:12)",
        ]
    );
}

#[test]
fn test_without_debug_info() {
    let h = Harness::new();
    let mut vm = SimVm::new(1)
        .with_unregistered_native("Foo")
        .with_public("Main", MAIN, |vm| {
            vm.set_cip(MAIN_LINE_12);
            vm.call_native(0, &[])
        });
    h.detector.attach(&mut vm).unwrap();

    assert!(vm.exec(0).is_err());
    assert_eq!(
        &h.single_report_lines()[2..],
        ["#0 Foo (native, unresolved)", "#1 <unknown> (0x00000058)"]
    );
}

#[test]
fn test_native_resolved_through_jump_stub() {
    // jmp rel32 from the registered address to 0x10 bytes into the plugin
    let target: usize = 0x7100_0010;
    let rel = (target - (NATIVE_BASE_ADDRESS + 5)) as i32;
    let mut stub = vec![0xE9];
    stub.extend_from_slice(&rel.to_le_bytes());

    let sink = Arc::new(MemorySink::new());
    let detector = CrashDetector::builder()
        .sink(sink.clone())
        .terminator(Arc::new(RecordingTerminator::default()))
        .symbols(Arc::new(
            ModuleMap::new()
                .module("plugins/streamer.so", 0x7100_0000, 0x1000)
                .symbol(0x7100_0000, "n_CreateObject"),
        ))
        .code_reader(Arc::new(MappedBytes::new(NATIVE_BASE_ADDRESS, stub)))
        .abi(Abi::X86_64)
        .build();

    let mut vm = SimVm::new(1)
        .with_debug_block(fixture_debug_block())
        .with_native("CreateObject", |_, _| Err(AmxError::Params))
        .with_public("Main", MAIN, |vm| {
            vm.set_cip(MAIN_LINE_12);
            vm.call_native(0, &[])
        });
    detector.attach(&mut vm).unwrap();

    assert!(vm.exec(0).is_err());
    let lines = sink.lines();
    assert_eq!(
        lines[2],
        "#0 CreateObject (native, streamer.so!n_CreateObject+0x10)"
    );
}

#[test]
fn test_idle_and_unknown_vms() {
    let h = Harness::new();
    let mut vm = SimVm::new(1).with_public("Main", MAIN, |_| Ok(0));
    let other = SimVm::new(2);
    h.detector.attach(&mut vm).unwrap();

    let trace = h.detector.trace(&vm).unwrap();
    assert!(trace.is_empty());
    assert!(!trace.truncated);
    assert!(h.detector.trace(&other).is_none());
}
