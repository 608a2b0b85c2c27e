//! A single compilation of one method.

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::TargetError;
use crate::method::MethodRef;
use crate::runtime::TargetRuntime;
use crate::target::TargetMethod;

use super::{CompileContext, CompiledState, Nature, RuntimeCompiler};

/// Lifecycle phase of a [`Compilation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompilationPhase {
    Created,
    Running,
    Done,
}

/// One compile request, shared by the thread running it and every thread
/// waiting for its result.
pub struct Compilation {
    method: MethodRef,
    compiler: Arc<dyn RuntimeCompiler>,
    requested: Option<Nature>,
    for_deopt: bool,
    /// State of the method when this compilation was created.
    previous: CompiledState,
    poll: Duration,
    phase: Mutex<CompilationPhase>,
    outcome: OnceLock<Result<Arc<TargetMethod>, TargetError>>,
}

impl Compilation {
    pub(crate) fn new(
        method: MethodRef,
        compiler: Arc<dyn RuntimeCompiler>,
        requested: Option<Nature>,
        for_deopt: bool,
        previous: CompiledState,
        poll: Duration,
    ) -> Self {
        Self {
            method,
            compiler,
            requested,
            for_deopt,
            previous,
            poll,
            phase: Mutex::new(CompilationPhase::Created),
            outcome: OnceLock::new(),
        }
    }

    #[inline]
    pub fn method(&self) -> &MethodRef {
        &self.method
    }

    #[inline]
    pub fn compiler_name(&self) -> &str {
        self.compiler.name()
    }

    /// Nature of the code the chosen compiler produces.
    #[inline]
    pub fn compiler_nature(&self) -> Nature {
        self.compiler.nature()
    }

    #[inline]
    pub fn requested_nature(&self) -> Option<Nature> {
        self.requested
    }

    #[inline]
    pub fn is_for_deopt(&self) -> bool {
        self.for_deopt
    }

    #[inline]
    pub fn previous(&self) -> &CompiledState {
        &self.previous
    }

    pub fn phase(&self) -> CompilationPhase {
        *self.phase.lock()
    }

    pub fn is_done(&self) -> bool {
        self.outcome.get().is_some()
    }

    /// Compilations cannot be cancelled.
    pub fn cancel(&self) -> bool {
        false
    }

    pub fn is_cancelled(&self) -> bool {
        false
    }

    /// State a reader should see for this compilation right now.
    pub fn outcome_state(self: &Arc<Self>) -> CompiledState {
        match self.outcome.get() {
            Some(Ok(tm)) => CompiledState::Single(Arc::clone(tm)),
            Some(Err(err)) => CompiledState::Failed(err.clone()),
            None => CompiledState::InProgress(Arc::clone(self)),
        }
    }

    // =========================================================================
    // Running
    // =========================================================================

    /// Run the compiler and publish the result to the method.
    ///
    /// Must be called exactly once, by the thread that created the
    /// compilation.
    pub fn compile(self: &Arc<Self>, rt: &TargetRuntime, ctx: &mut CompileContext) -> Result<Arc<TargetMethod>, TargetError> {
        {
            let mut phase = self.phase.lock();
            if *phase != CompilationPhase::Created {
                crate::fatal!("compilation of {} started twice", self.method.qualified_name());
            }
            *phase = CompilationPhase::Running;
        }
        let verbose = rt.config().verbose_compilation;
        if verbose {
            tracing::info!(method = %self.method.qualified_name(), compiler = self.compiler_name(), "compiling");
        } else {
            tracing::debug!(method = %self.method.qualified_name(), compiler = self.compiler_name(), "compiling");
        }
        let started = Instant::now();

        ctx.enter(Arc::clone(self));
        let result = self
            .compiler
            .compile(rt, &self.method, self.for_deopt, ctx)
            .map_err(|source| TargetError::CompilationFailed {
                method: self.method.qualified_name(),
                compiler: self.compiler_name().to_string(),
                source,
            })
            .and_then(|codegen| TargetMethod::install_codegen(rt, &self.method, codegen));
        ctx.exit(self);

        match &result {
            Ok(tm) if verbose => tracing::info!(
                method = %self.method.qualified_name(),
                compiler = self.compiler_name(),
                code_start = tm.code_start(),
                elapsed_us = started.elapsed().as_micros() as u64,
                "compiled"
            ),
            Ok(tm) => tracing::debug!(
                method = %self.method.qualified_name(),
                code_start = tm.code_start(),
                "compiled"
            ),
            Err(err) => tracing::debug!(method = %self.method.qualified_name(), error = %err, "compilation failed"),
        }

        self.finish(result.clone());
        result
    }

    /// Publish the outcome and wake every waiter.
    fn finish(&self, result: Result<Arc<TargetMethod>, TargetError>) {
        let mut state = self.method.lock_state();
        match &result {
            Ok(tm) => {
                state.compilations = state.compilations.with(Arc::clone(tm));
                state.history = CompiledState::add_target_method(Arc::clone(tm), &self.previous, true);
            }
            Err(_) => state.history = self.previous.clone(),
        }
        if state
            .in_progress
            .as_ref()
            .is_some_and(|c| std::ptr::eq(c.as_ref(), self))
        {
            state.in_progress = None;
        }
        if self.outcome.set(result).is_err() {
            crate::fatal!("compilation of {} finished twice", self.method.qualified_name());
        }
        *self.phase.lock() = CompilationPhase::Done;
        self.method.state_changed().notify_all();
    }

    // =========================================================================
    // Waiting
    // =========================================================================

    /// Block until the compilation finishes.
    pub fn get(&self, ctx: &CompileContext) -> Result<Arc<TargetMethod>, TargetError> {
        self.wait(ctx, None)
    }

    /// Block for at most `timeout`. A timeout past the end of the clock
    /// waits without a deadline.
    pub fn get_timeout(&self, ctx: &CompileContext, timeout: Duration) -> Result<Arc<TargetMethod>, TargetError> {
        self.wait(ctx, Instant::now().checked_add(timeout))
    }

    fn wait(&self, ctx: &CompileContext, deadline: Option<Instant>) -> Result<Arc<TargetMethod>, TargetError> {
        if ctx.contains(self) {
            crate::fatal!("{} waits on its own compilation", self.method.qualified_name());
        }
        let interrupt = ctx.interrupt_flag();
        let mut interrupted = false;
        let mut state = self.method.lock_state();
        let result = loop {
            if let Some(outcome) = self.outcome.get() {
                break outcome.clone();
            }
            let mut wait = self.poll;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    break Err(TargetError::Timeout {
                        method: self.method.qualified_name(),
                    });
                }
                wait = wait.min(deadline - now);
            }
            self.method.state_changed().wait_for(&mut state, wait);
            interrupted |= interrupt.take();
        };
        drop(state);
        if interrupted {
            interrupt.interrupt();
        }
        result
    }
}

impl fmt::Debug for Compilation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Compilation")
            .field("method", &self.method.qualified_name())
            .field("compiler", &self.compiler_name())
            .field("requested", &self.requested)
            .field("phase", &self.phase())
            .finish()
    }
}
