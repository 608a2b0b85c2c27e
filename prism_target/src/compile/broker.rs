//! Compiler selection and the compile-and-wait entry point.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use crate::config::{CompileCommand, TargetConfig};
use crate::dispatch::Hub;
use crate::error::TargetError;
use crate::method::MethodRef;
use crate::runtime::TargetRuntime;
use crate::target::{CallEntryPoint, TargetMethod};

use super::{Compilation, CompileContext, Nature, RuntimeCompiler};

// =============================================================================
// Method Profiles
// =============================================================================

/// Entry count given to a profile whose recompilation had to be postponed.
pub const DEFERRED_ENTRY_COUNT: i64 = 1000;

/// Invocation counter maintained by instrumented baseline code.
///
/// Counts down from its threshold; reaching zero triggers
/// [`CompilationBroker::instrumentation_counter_overflow`].
#[derive(Debug)]
pub struct MethodProfile {
    method: MethodRef,
    threshold: i64,
    entry_count: AtomicI64,
}

impl MethodProfile {
    pub fn new(method: MethodRef, threshold: i64) -> Self {
        Self {
            method,
            threshold,
            entry_count: AtomicI64::new(threshold),
        }
    }

    #[inline]
    pub fn method(&self) -> &MethodRef {
        &self.method
    }

    #[inline]
    pub fn entry_count(&self) -> i64 {
        self.entry_count.load(Ordering::Relaxed)
    }

    /// Count one entry; returns whether the counter overflowed.
    #[inline]
    pub fn record_entry(&self) -> bool {
        self.entry_count.fetch_sub(1, Ordering::Relaxed) == 1
    }

    pub fn reset(&self) {
        self.entry_count.store(self.threshold, Ordering::Relaxed);
    }

    pub fn defer(&self) {
        self.entry_count.store(DEFERRED_ENTRY_COUNT, Ordering::Relaxed);
    }
}

// =============================================================================
// Broker
// =============================================================================

/// Broker statistics.
#[derive(Debug, Clone, Default)]
pub struct BrokerStats {
    /// Compilations started by this broker.
    pub compilations: u64,
    /// Requests satisfied by another thread's compilation.
    pub waits: u64,
    pub failures: u64,
    pub fail_overs: u64,
}

/// Picks a compiler for each request and runs the compile-and-wait protocol.
pub struct CompilationBroker {
    optimizing: Arc<dyn RuntimeCompiler>,
    baseline: Option<Arc<dyn RuntimeCompiler>>,
    default_nature: Nature,
    fail_over: bool,
    commands: Vec<CompileCommand>,
    poll: Duration,

    compilations: AtomicU64,
    waits: AtomicU64,
    failures: AtomicU64,
    fail_overs: AtomicU64,
}

impl CompilationBroker {
    pub fn new(
        config: &TargetConfig,
        optimizing: Arc<dyn RuntimeCompiler>,
        baseline: Option<Arc<dyn RuntimeCompiler>>,
    ) -> Self {
        Self {
            optimizing,
            baseline,
            default_nature: config.default_nature,
            fail_over: config.fail_over_compilation,
            commands: config.compile_commands.clone(),
            poll: config.compile_wait_poll,
            compilations: AtomicU64::new(0),
            waits: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            fail_overs: AtomicU64::new(0),
        }
    }

    pub fn optimizing_compiler(&self) -> &Arc<dyn RuntimeCompiler> {
        &self.optimizing
    }

    pub fn baseline_compiler(&self) -> Option<&Arc<dyn RuntimeCompiler>> {
        self.baseline.as_ref()
    }

    fn compiler_for(&self, nature: Nature) -> &Arc<dyn RuntimeCompiler> {
        match nature {
            Nature::Opt => &self.optimizing,
            Nature::Baseline => self.baseline.as_ref().unwrap_or(&self.optimizing),
        }
    }

    fn compiler_named(&self, name: &str) -> Option<&Arc<dyn RuntimeCompiler>> {
        std::iter::once(&self.optimizing)
            .chain(self.baseline.as_ref())
            .find(|c| c.name() == name)
    }

    /// Compiler for `method`.
    ///
    /// Unsafe methods always get the optimizing compiler. Otherwise a
    /// matching compile command wins, then the requested nature, then the
    /// configured default.
    pub fn select_compiler(&self, method: &MethodRef, nature: Option<Nature>) -> Arc<dyn RuntimeCompiler> {
        if method.is_unsafe() {
            return Arc::clone(&self.optimizing);
        }
        let qualified = method.qualified_name();
        if let Some(command) = self.commands.iter().find(|c| c.matches(&qualified)) {
            match self.compiler_named(command.compiler()) {
                Some(compiler) => return Arc::clone(compiler),
                None => tracing::warn!(
                    method = %qualified,
                    compiler = command.compiler(),
                    "compile command names an unknown compiler"
                ),
            }
        }
        Arc::clone(self.compiler_for(nature.unwrap_or(self.default_nature)))
    }

    // =========================================================================
    // Compile Requests
    // =========================================================================

    /// Produce code for `method`, compiling it if needed.
    ///
    /// Joins a compatible compilation already in flight. A failure is retried
    /// once with the other compiler when fail-over is enabled.
    #[tracing::instrument(level = "debug", skip_all, fields(method = %method.qualified_name(), ?nature))]
    pub fn compile(
        &self,
        rt: &TargetRuntime,
        method: &MethodRef,
        nature: Option<Nature>,
        ctx: &mut CompileContext,
    ) -> Result<Arc<TargetMethod>, TargetError> {
        self.request(rt, method, nature, false, ctx)
    }

    /// Compile baseline code able to resume deoptimized frames.
    pub fn compile_for_deopt(
        &self,
        rt: &TargetRuntime,
        method: &MethodRef,
        ctx: &mut CompileContext,
    ) -> Result<Arc<TargetMethod>, TargetError> {
        self.request(rt, method, Some(Nature::Baseline), true, ctx)
    }

    fn request(
        &self,
        rt: &TargetRuntime,
        method: &MethodRef,
        nature: Option<Nature>,
        for_deopt: bool,
        ctx: &mut CompileContext,
    ) -> Result<Arc<TargetMethod>, TargetError> {
        if method.is_abstract() {
            return Err(TargetError::Unavailable {
                method: method.qualified_name(),
            });
        }
        let compiler = self.select_compiler(method, nature);
        let result = self.compile_with(rt, method, nature, for_deopt, &compiler, ctx);
        match result {
            Err(err @ TargetError::CompilationFailed { .. }) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                let other = self.compiler_for(compiler.nature().other());
                if !self.fail_over || other.name() == compiler.name() {
                    return Err(err);
                }
                tracing::warn!(
                    method = %method.qualified_name(),
                    failed = compiler.name(),
                    retry = other.name(),
                    error = %err,
                    "compilation failed, retrying with the other compiler"
                );
                self.fail_overs.fetch_add(1, Ordering::Relaxed);
                let other = Arc::clone(other);
                let retried = self.compile_with(rt, method, Some(other.nature()), for_deopt, &other, ctx);
                if retried.is_err() {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                }
                retried
            }
            result => result,
        }
    }

    fn compile_with(
        &self,
        rt: &TargetRuntime,
        method: &MethodRef,
        nature: Option<Nature>,
        for_deopt: bool,
        compiler: &Arc<dyn RuntimeCompiler>,
        ctx: &mut CompileContext,
    ) -> Result<Arc<TargetMethod>, TargetError> {
        if ctx.is_compiling_with(method, compiler.name()) {
            crate::fatal!("recursive compilation of {} by {}", method.qualified_name(), compiler.name());
        }
        loop {
            let mut state = method.lock_state();
            let pending = match &state.in_progress {
                Some(c) if nature.is_none_or(|n| n == c.compiler_nature()) => {
                    let c = Arc::clone(c);
                    drop(state);
                    self.waits.fetch_add(1, Ordering::Relaxed);
                    return c.get(ctx);
                }
                Some(c) => Arc::clone(c),
                None => {
                    let compilation = Arc::new(Compilation::new(
                        Arc::clone(method),
                        Arc::clone(compiler),
                        nature,
                        for_deopt,
                        state.history.clone(),
                        self.poll,
                    ));
                    state.in_progress = Some(Arc::clone(&compilation));
                    drop(state);
                    self.compilations.fetch_add(1, Ordering::Relaxed);
                    return compilation.compile(rt, ctx);
                }
            };
            drop(state);
            // Incompatible compilation in flight: let it finish, then retry.
            let _ = pending.get(ctx);
        }
    }

    /// Current code for `method`, compiling when there is none or it has
    /// been invalidated.
    pub fn compiled_code(
        &self,
        rt: &TargetRuntime,
        method: &MethodRef,
        ctx: &mut CompileContext,
    ) -> Result<Arc<TargetMethod>, TargetError> {
        match method.current_target_method() {
            Some(tm) if !tm.is_invalidated() => Ok(tm),
            _ => self.compile(rt, method, None, ctx),
        }
    }

    // =========================================================================
    // Tiered Recompilation
    // =========================================================================

    /// Handle an invocation counter reaching zero in baseline code.
    ///
    /// Recompiles the method with the optimizing compiler unless a newer
    /// optimized version already exists, then retargets dispatch entries of
    /// `receiver` and the callers' direct calls from the old code to the new.
    /// `callers` pairs each calling method with the return address of its
    /// call. Returns `None` when the request was deferred because this thread
    /// is itself compiling.
    pub fn instrumentation_counter_overflow(
        &self,
        rt: &TargetRuntime,
        profile: &MethodProfile,
        receiver: Option<&Hub>,
        callers: &[(Arc<TargetMethod>, usize)],
        ctx: &mut CompileContext,
    ) -> Result<Option<Arc<TargetMethod>>, TargetError> {
        if ctx.is_compiling() {
            profile.defer();
            return Ok(None);
        }
        let method = profile.method();
        let old = method.current_target_method();
        let new = match &old {
            Some(tm) if tm.nature() == Some(Nature::Opt) && !tm.is_invalidated() => Arc::clone(tm),
            _ => self.compile(rt, method, Some(Nature::Opt), ctx)?,
        };
        profile.reset();

        let Some(old) = old.filter(|old| !Arc::ptr_eq(old, &new)) else {
            return Ok(Some(new));
        };
        if let Some(hub) = receiver {
            let patched = hub.replace_entry(
                old.get_entry_point(CallEntryPoint::Vtable),
                new.get_entry_point(CallEntryPoint::Vtable),
            );
            tracing::debug!(hub = hub.name(), patched, "retargeted dispatch entries");
        }
        for (caller, return_address) in callers {
            let Some(pos) = caller.pos_for(*return_address) else {
                continue;
            };
            let Some(call_pos) = pos.checked_sub(crate::asm::amd64::CALL_REL32_SIZE) else {
                continue;
            };
            let current = caller.call_target_at(call_pos);
            if current == Some(old.get_entry_point(caller.call_entry_point()))
                && caller.is_patchable_call_site(caller.code_at(call_pos))
            {
                caller.patch_call_site(call_pos, new.get_entry_point(caller.call_entry_point()));
            }
        }
        Ok(Some(new))
    }

    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            compilations: self.compilations.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            fail_overs: self.fail_overs.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for CompilationBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompilationBroker")
            .field("optimizing", &self.optimizing.name())
            .field("baseline", &self.baseline.as_ref().map(|c| c.name()))
            .field("default_nature", &self.default_nature)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kind::Kind;
    use crate::method::{MethodActor, Signature};
    use crate::compile::CompiledState;
    use crate::error::CompileError;
    use crate::target::CodegenResult;
    use crate::test_support::{FakeCompiler, runtime, runtime_with, unique_method};

    /// Asks for the method it is compiling, with the same context.
    struct SelfCompiling;

    impl RuntimeCompiler for SelfCompiling {
        fn name(&self) -> &str {
            "self-compiling"
        }

        fn nature(&self) -> Nature {
            Nature::Opt
        }

        fn compile(
            &self,
            rt: &TargetRuntime,
            method: &MethodRef,
            _for_deopt: bool,
            ctx: &mut CompileContext,
        ) -> Result<CodegenResult, CompileError> {
            let tm = rt
                .broker()
                .compile(rt, method, Some(Nature::Opt), ctx)
                .map_err(|err| CompileError::new(err.to_string()))?;
            Ok(CodegenResult::new(tm.copy_code(), Nature::Opt))
        }
    }

    #[test]
    fn test_compile_uses_default_nature() {
        let rt = runtime();
        let m = unique_method("default");
        let tm = rt.broker().compile(&rt, &m, None, &mut CompileContext::new()).unwrap();
        assert_eq!(tm.nature(), Some(Nature::Baseline));
        assert_eq!(rt.broker().stats().compilations, 1);
    }

    #[test]
    fn test_unsafe_method_gets_optimizing_compiler() {
        let rt = runtime();
        let m = MethodActor::builder("Unsafe", "peek", Signature::new([], Kind::Long))
            .static_method()
            .unsafe_method()
            .build();
        let tm = rt.broker().compile(&rt, &m, Some(Nature::Baseline), &mut CompileContext::new()).unwrap();
        assert_eq!(tm.nature(), Some(Nature::Opt));
    }

    #[test]
    fn test_compile_command_overrides_nature() {
        let config = crate::TargetConfig::for_testing()
            .with_compile_command(CompileCommand::new(r"^Hot\.", "fake-opt").unwrap());
        let rt = runtime_with(config, FakeCompiler::opt(), Some(FakeCompiler::baseline()));
        let m = MethodActor::builder("Hot", "loop", Signature::new([], Kind::Void))
            .static_method()
            .build();
        let tm = rt.broker().compile(&rt, &m, Some(Nature::Baseline), &mut CompileContext::new()).unwrap();
        assert_eq!(tm.nature(), Some(Nature::Opt));
    }

    #[test]
    #[should_panic(expected = "recursive compilation")]
    fn test_recursive_compile_is_fatal() {
        let rt = runtime_with(crate::TargetConfig::for_testing(), SelfCompiling, None::<FakeCompiler>);
        let m = unique_method("recursive");
        let _ = rt.broker().compile(&rt, &m, Some(Nature::Opt), &mut CompileContext::new());
    }

    #[test]
    fn test_abstract_method_unavailable() {
        let rt = runtime();
        let m = MethodActor::builder("Shape", "area", Signature::new([], Kind::Double))
            .abstract_method()
            .build();
        let err = rt.broker().compile(&rt, &m, None, &mut CompileContext::new()).unwrap_err();
        assert!(matches!(err, TargetError::Unavailable { .. }));
    }

    #[test]
    fn test_fail_over_to_other_compiler() {
        let rt = runtime_with(
            crate::TargetConfig::for_testing(),
            FakeCompiler::opt(),
            Some(FakeCompiler::failing("baseline bailout")),
        );
        let m = unique_method("failover");
        let tm = rt.broker().compile(&rt, &m, Some(Nature::Baseline), &mut CompileContext::new()).unwrap();
        assert_eq!(tm.nature(), Some(Nature::Opt));
        let stats = rt.broker().stats();
        assert_eq!(stats.fail_overs, 1);
        assert_eq!(stats.failures, 1);
        assert_eq!(m.compiled_state(), CompiledState::Single(tm));
    }

    #[test]
    fn test_fail_over_disabled_returns_error() {
        let config = crate::TargetConfig {
            fail_over_compilation: false,
            ..crate::TargetConfig::for_testing()
        };
        let rt = runtime_with(config, FakeCompiler::opt(), Some(FakeCompiler::failing("nope")));
        let m = unique_method("nofailover");
        let err = rt.broker().compile(&rt, &m, None, &mut CompileContext::new()).unwrap_err();
        assert!(matches!(err, TargetError::CompilationFailed { .. }));
        assert_eq!(m.compiled_state(), CompiledState::Empty);
    }

    #[test]
    fn test_compiled_code_reuses_current() {
        let rt = runtime();
        let m = unique_method("reuse");
        let mut ctx = CompileContext::new();
        let a = rt.broker().compiled_code(&rt, &m, &mut ctx).unwrap();
        let b = rt.broker().compiled_code(&rt, &m, &mut ctx).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(rt.broker().stats().compilations, 1);
    }

    #[test]
    fn test_counter_overflow_deferred_while_compiling() {
        let rt = runtime();
        let m = unique_method("deferred");
        let profile = MethodProfile::new(Arc::clone(&m), 10);
        let mut ctx = CompileContext::new();
        let outer = unique_method("outer");
        let c = Arc::new(Compilation::new(
            Arc::clone(&outer),
            Arc::new(FakeCompiler::opt()),
            None,
            false,
            CompiledState::Empty,
            Duration::from_millis(1),
        ));
        ctx.enter(Arc::clone(&c));
        let result = rt
            .broker()
            .instrumentation_counter_overflow(&rt, &profile, None, &[], &mut ctx)
            .unwrap();
        assert!(result.is_none());
        assert_eq!(profile.entry_count(), DEFERRED_ENTRY_COUNT);
        ctx.exit(&c);
    }

    #[test]
    fn test_counter_overflow_recompiles_optimized() {
        let rt = runtime();
        let m = unique_method("hot");
        let mut ctx = CompileContext::new();
        let base = rt.broker().compile(&rt, &m, Some(Nature::Baseline), &mut ctx).unwrap();
        let profile = MethodProfile::new(Arc::clone(&m), 2);
        assert!(!profile.record_entry());
        assert!(profile.record_entry());

        let opt = rt
            .broker()
            .instrumentation_counter_overflow(&rt, &profile, None, &[], &mut ctx)
            .unwrap()
            .unwrap();
        assert_eq!(opt.nature(), Some(Nature::Opt));
        assert!(!Arc::ptr_eq(&base, &opt));
        assert_eq!(profile.entry_count(), 2);
        assert!(Arc::ptr_eq(&m.current_target_method().unwrap(), &opt));
    }
}
