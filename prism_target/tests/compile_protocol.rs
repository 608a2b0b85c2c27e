//! End-to-end tests of the compile-and-wait protocol and lazy linking.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use prism_target::compile::CompiledState;
use prism_target::stubs::{patch_static_trampoline_call_site, resolve_virtual_call};
use prism_target::target::{CallSite, CallTarget, Site};
use prism_target::{
    CallEntryPoint, CodegenResult, CompileContext, CompileError, Hub, Kind, MethodActor, MethodRef, Nature,
    RuntimeCompiler, Signature, TargetConfig, TargetError, TargetMethod, TargetRuntime,
};

/// Compiler that sleeps, counts its invocations and emits a 16-byte body.
struct SlowCompiler {
    nature: Nature,
    delay: Duration,
    calls: AtomicUsize,
}

impl SlowCompiler {
    fn new(nature: Nature, delay: Duration) -> Self {
        Self {
            nature,
            delay,
            calls: AtomicUsize::new(0),
        }
    }
}

impl RuntimeCompiler for SlowCompiler {
    fn name(&self) -> &str {
        match self.nature {
            Nature::Baseline => "slow-baseline",
            Nature::Opt => "slow-opt",
        }
    }

    fn nature(&self) -> Nature {
        self.nature
    }

    fn compile(
        &self,
        _rt: &TargetRuntime,
        _method: &MethodRef,
        _for_deopt: bool,
        _ctx: &mut CompileContext,
    ) -> Result<CodegenResult, CompileError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        thread::sleep(self.delay);
        let mut code = vec![0x90; 15];
        code.push(0xC3);
        Ok(CodegenResult::new(code, self.nature))
    }
}

fn runtime(delay: Duration) -> (Arc<TargetRuntime>, Arc<SlowCompiler>, Arc<SlowCompiler>) {
    let opt = Arc::new(SlowCompiler::new(Nature::Opt, delay));
    let baseline = Arc::new(SlowCompiler::new(Nature::Baseline, delay));
    let rt = TargetRuntime::new(
        TargetConfig::for_testing(),
        Arc::clone(&opt) as Arc<dyn RuntimeCompiler>,
        Some(Arc::clone(&baseline) as Arc<dyn RuntimeCompiler>),
    )
    .expect("runtime");
    (Arc::new(rt), opt, baseline)
}

fn method(name: &str) -> MethodRef {
    MethodActor::builder("Protocol", name, Signature::new([Kind::Int], Kind::Int))
        .static_method()
        .build()
}

#[test]
fn concurrent_requests_share_one_compilation() {
    let (rt, _opt, baseline) = runtime(Duration::from_millis(50));
    let m = method("shared");
    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let rt = Arc::clone(&rt);
            let m = Arc::clone(&m);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                rt.compile(&m, Some(Nature::Baseline), &mut CompileContext::new())
            })
        })
        .collect();
    let results: Vec<Arc<TargetMethod>> = handles
        .into_iter()
        .map(|h| h.join().expect("thread").expect("compiled"))
        .collect();

    assert_eq!(baseline.calls.load(Ordering::SeqCst), 1);
    for tm in &results[1..] {
        assert!(Arc::ptr_eq(tm, &results[0]));
    }
    assert_eq!(m.compiled_state(), CompiledState::Single(Arc::clone(&results[0])));
    let stats = rt.broker().stats();
    assert_eq!(stats.compilations, 1);
    assert_eq!(stats.waits as usize, threads - 1);
}

#[test]
fn recompilation_keeps_history() {
    let (rt, _opt, _baseline) = runtime(Duration::ZERO);
    let m = method("history");
    let mut ctx = CompileContext::new();
    let base = rt.compile(&m, Some(Nature::Baseline), &mut ctx).unwrap();
    let opt = rt.compile(&m, Some(Nature::Opt), &mut ctx).unwrap();

    assert!(Arc::ptr_eq(&m.current_target_method().unwrap(), &opt));
    let history = m.compiled_state();
    let versions = history.target_methods();
    assert_eq!(versions.len(), 2);
    assert!(Arc::ptr_eq(&versions[0], &opt));
    assert!(Arc::ptr_eq(&versions[1], &base));
}

#[test]
fn virtual_call_resolves_and_caches() {
    let (rt, _opt, _baseline) = runtime(Duration::ZERO);
    let target = MethodActor::builder("Circle", "area", Signature::new([], Kind::Double)).build();
    let index = rt.config().first_valid_vtable_index;
    let mut vtable = vec![None; index];
    vtable.push(Some(Arc::clone(&target)));
    let hub = Hub::new(&rt, "Circle", vtable, Vec::new()).unwrap();

    let entry = resolve_virtual_call(&rt, &hub, index, 0, &mut CompileContext::new()).unwrap();
    let tm = target.current_target_method().unwrap();
    assert_eq!(entry, tm.get_entry_point(CallEntryPoint::Vtable));

    let missing = resolve_virtual_call(&rt, &hub, index + 1, 0, &mut CompileContext::new());
    assert!(matches!(missing, Err(TargetError::IncompatibleClassChange { .. })));
}

#[test]
fn static_call_is_linked_on_first_execution() {
    let (rt, opt, _baseline) = runtime(Duration::ZERO);
    let callee = method("callee");
    let caller = method("caller");

    // 8 entry nops, then an aligned `call rel32` and `ret`.
    let mut code = vec![0x90; 8];
    while (code.len() + 1) % 4 != 0 {
        code.push(0x90);
    }
    let call = code.len();
    code.extend_from_slice(&[0xE8, 0, 0, 0, 0, 0xC3]);
    let result = CodegenResult::new(code, Nature::Opt).with_site(Site::Call(CallSite {
        pc_offset: call,
        size: 5,
        target: CallTarget::Method(Arc::clone(&callee)),
        direct: true,
        reference_map: None,
    }));
    let caller_tm = TargetMethod::install_codegen(&rt, &caller, result).unwrap();
    assert!(caller_tm.is_patchable_call_site(caller_tm.code_at(call)));
    let trampoline = rt.stubs().static_trampoline().unwrap();
    assert_eq!(
        caller_tm.call_target_at(call),
        Some(trampoline.get_entry_point(CallEntryPoint::Optimized))
    );

    let entry = patch_static_trampoline_call_site(&rt, caller_tm.code_at(call), &mut CompileContext::new()).unwrap();
    assert_eq!(caller_tm.call_target_at(call), Some(entry));
    assert_eq!(opt.calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        callee.current_target_method().unwrap().get_entry_point(CallEntryPoint::Optimized),
        entry
    );
}
