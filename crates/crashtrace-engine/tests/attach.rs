//! Integration tests for attaching, chaining and detaching

mod common;

use std::sync::Arc;
use std::thread;

use common::*;
use crashtrace_engine::{ConfigError, CrashDetector, DetectError, FailureKind};
use crashtrace_sdk::{
    AmxError, AmxImageWriter, AmxResult, Cell, DebugHook, NativeDispatcher, ScriptVm, VmHandle,
};
use crashtrace_test::{CountingHook, SimVm};

/// A dispatcher some other layer installs on top of ours
struct Layer {
    next: Option<Arc<dyn NativeDispatcher>>,
}

impl NativeDispatcher for Layer {
    fn dispatch(&self, vm: &mut dyn ScriptVm, index: Cell, params: &[Cell]) -> AmxResult<Cell> {
        match &self.next {
            Some(next) => next.dispatch(vm, index, params),
            None => Err(AmxError::Callback),
        }
    }
}

fn same<T: ?Sized, U: ?Sized>(a: &Option<Arc<T>>, b: &Arc<U>) -> bool {
    a.as_ref()
        .is_some_and(|a| std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b)))
}

#[test]
fn test_attach_twice_fails() {
    let h = Harness::new();
    let mut vm = SimVm::new(3);
    h.detector.attach(&mut vm).unwrap();

    let result = h.detector.attach(&mut vm);
    assert!(matches!(result, Err(DetectError::AlreadyAttached(VmHandle(3)))));
    assert_eq!(h.detector.attached_count(), 1);
}

#[test]
fn test_detach_unknown_fails() {
    let h = Harness::new();
    let mut vm = SimVm::new(4);

    let result = h.detector.detach(&mut vm);
    assert!(matches!(result, Err(DetectError::NotAttached(VmHandle(4)))));
}

#[test]
fn test_previous_handlers_still_run() {
    let h = Harness::new();
    let counter = Arc::new(CountingHook::default());
    let mut vm = SimVm::new(1)
        .with_native("add", |_, params| Ok(params.iter().sum()))
        .with_public("Main", MAIN, |vm| {
            for _ in 0..3 {
                vm.step()?;
            }
            vm.call_native(0, &[2, 3])
        });
    vm.extension_points_mut().debug_hook = Some(counter.clone());
    h.detector.attach(&mut vm).unwrap();

    assert_eq!(vm.exec(0), Ok(5));
    assert_eq!(counter.count(), 3);
    assert!(!same(&vm.extension_points().debug_hook, &counter));
}

#[test]
fn test_detach_restores_handlers() {
    let h = Harness::new();
    let counter = Arc::new(CountingHook::default());
    let mut vm = SimVm::new(1).with_public("Main", MAIN, |_| Err(AmxError::Bounds));
    vm.extension_points_mut().debug_hook = Some(counter.clone());
    let original = vm.extension_points().clone();

    h.detector.attach(&mut vm).unwrap();
    h.detector.detach(&mut vm).unwrap();

    let points = vm.extension_points();
    assert!(same(&points.debug_hook, &counter));
    assert!(same(&points.dispatcher, original.dispatcher.as_ref().unwrap()));
    assert!(same(&points.exec, original.exec.as_ref().unwrap()));
    assert!(!h.detector.is_attached(vm.handle()));

    // Failures are the host's business again
    assert!(vm.exec(0).is_err());
    assert!(h.sink.reports().is_empty());
}

#[test]
fn test_detach_leaves_outer_layer() {
    let h = Harness::new();
    let mut vm = SimVm::new(1)
        .with_native("add", |_, params| Ok(params.iter().sum()))
        .with_public("Main", MAIN, |vm| vm.call_native(0, &[4, 5]));
    let original_exec = vm.extension_points().exec.clone().unwrap();
    h.detector.attach(&mut vm).unwrap();

    let ours = vm.extension_points().dispatcher.clone();
    let layer = Arc::new(Layer { next: ours });
    vm.extension_points_mut().dispatcher = Some(layer.clone());

    h.detector.detach(&mut vm).unwrap();
    assert!(same(&vm.extension_points().dispatcher, &layer));
    assert!(same(&vm.extension_points().exec, &original_exec));

    // The outer layer still calls through to the host
    assert_eq!(vm.exec(0), Ok(9));
}

#[test]
fn test_interrupt_reports_current_stack() {
    let h = Harness::new();
    let mut vm = SimVm::new(1)
        .with_path("test.amx")
        .with_debug_block(fixture_debug_block())
        .with_public("Main", MAIN, |vm| {
            vm.set_cip(MAIN_LINE_12);
            vm.step()?;
            Ok(0)
        });
    h.detector.attach(&mut vm).unwrap();

    h.detector.request_interrupt();
    assert_eq!(vm.exec(0), Ok(0));
    // The request is consumed by the first instruction
    assert_eq!(vm.exec(0), Ok(0));

    let reports = h.sink.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].kind, FailureKind::Interrupt);
    assert_eq!(
        reports[0].lines(),
        vec![
            "Interrupt requested",
            "Backtrace of test.amx:",
            "#0 Main (file.pwn:12)",
        ]
    );
    assert!(h.terminator.calls().is_empty());
}

#[test]
fn test_interrupt_from_another_thread() {
    let h = Harness::new();
    let mut vm = SimVm::new(1).with_public("Main", MAIN, |vm| vm.step().map(|_| 0));
    h.detector.attach(&mut vm).unwrap();

    let handle = h.detector.interrupt_handle();
    thread::spawn(move || handle.request()).join().unwrap();

    assert_eq!(vm.exec(0), Ok(0));
    assert_eq!(h.sink.reports()[0].kind, FailureKind::Interrupt);
}

#[test]
fn test_debug_info_from_module_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.amx");
    let image = AmxImageWriter::new()
        .public("Main", MAIN)
        .native("Foo")
        .code(vec![0; 0xc0])
        .debug_block(fixture_debug_block())
        .finish();
    std::fs::write(&path, image).unwrap();

    let h = Harness::new();
    let mut vm = SimVm::new(1)
        .with_path(&path)
        .with_unregistered_native("Foo")
        .with_public("Main", MAIN, |vm| {
            vm.set_cip(MAIN_LINE_12);
            vm.call_native(0, &[])
        });
    h.detector.attach(&mut vm).unwrap();

    let instance = h.detector.instance(vm.handle()).unwrap();
    assert!(!instance.debug_info().is_empty());
    assert_eq!(instance.name(), "test.amx");

    assert!(vm.exec(0).is_err());
    assert_eq!(
        &h.single_report_lines()[1..],
        [
            "Backtrace of test.amx:",
            "#0 Foo (native, unresolved)",
            "#1 Main (file.pwn:12)",
        ]
    );
}

#[test]
fn test_unreadable_module_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.amx");
    std::fs::write(&path, b"not a module").unwrap();

    let h = Harness::new();
    let mut vm = SimVm::new(1)
        .with_path(&path)
        .with_public("Main", MAIN, |vm| {
            vm.set_cip(MAIN_LINE_12);
            Err(AmxError::Divide)
        });
    h.detector.attach(&mut vm).unwrap();

    let instance = h.detector.instance(vm.handle()).unwrap();
    assert!(instance.debug_info().is_empty());

    assert!(vm.exec(0).is_err());
    assert_eq!(
        &h.single_report_lines()[2..],
        ["#0 <unknown> (0x00000058)"]
    );
}

#[test]
fn test_instances_are_independent() {
    let h = Harness::new();
    let mut first = SimVm::new(1);
    let mut second = SimVm::new(2);
    h.detector.attach(&mut first).unwrap();
    h.detector.attach(&mut second).unwrap();
    assert_eq!(h.detector.attached_count(), 2);

    h.detector.detach(&mut first).unwrap();
    assert!(!h.detector.is_attached(VmHandle(1)));
    assert!(h.detector.is_attached(VmHandle(2)));
    assert_eq!(h.detector.attached_count(), 1);
}

#[test]
fn test_exec_without_host_entry() {
    let h = Harness::new();
    let mut vm = SimVm::new(1);
    vm.extension_points_mut().exec = None;
    h.detector.attach(&mut vm).unwrap();

    assert_eq!(vm.exec(0), Err(AmxError::Init));
    assert_eq!(
        h.sink.reports()[0].headline,
        "Run time error 22: \"AMX not initialized (or doubly initialized)\""
    );
}

#[test]
fn test_debug_hook_errors_pass_through() {
    struct Halt;

    impl DebugHook for Halt {
        fn on_instruction(&self, _vm: &mut dyn ScriptVm) -> AmxResult<()> {
            Err(AmxError::Exit)
        }
    }

    let h = Harness::new();
    let mut vm = SimVm::new(1).with_public("Main", MAIN, |vm| vm.step().map(|_| 0));
    vm.extension_points_mut().debug_hook = Some(Arc::new(Halt));
    h.detector.attach(&mut vm).unwrap();

    assert_eq!(vm.exec(0), Err(AmxError::Exit));
    assert!(h.sink.reports().is_empty());
}

#[test]
fn test_builder_loads_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("server.cfg");
    std::fs::write(&path, "gamemode0 lvdm 1\ndie_on_error 1\nmax_trace_depth 7\n").unwrap();

    let detector = CrashDetector::builder()
        .config_file(&path)
        .unwrap()
        .terminator(Arc::new(RecordingTerminator::default()))
        .build();
    assert!(detector.config().die_on_error);
    assert_eq!(detector.config().max_trace_depth, 7);
}

#[test]
fn test_builder_config_errors() {
    let dir = tempfile::tempdir().unwrap();
    let bad = dir.path().join("crashtrace.toml");
    std::fs::write(&bad, "max_trace_depth = \"deep\"").unwrap();

    let err = CrashDetector::builder().config_file(&bad).err().unwrap();
    assert!(matches!(err, DetectError::Config(ConfigError::Toml(_))));

    let err = CrashDetector::builder()
        .config_file(dir.path().join("absent.cfg"))
        .err()
        .unwrap();
    assert!(matches!(err, DetectError::Config(ConfigError::Io(_))));
}
