//! Shared fixtures for unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::compile::{CompileContext, Nature, RuntimeCompiler};
use crate::config::TargetConfig;
use crate::error::CompileError;
use crate::kind::Kind;
use crate::method::{MethodActor, MethodRef, Signature};
use crate::runtime::TargetRuntime;
use crate::target::CodegenResult;

/// Compiler emitting `nop x15; ret`, or failing with a fixed message.
#[derive(Debug, Clone)]
pub struct FakeCompiler {
    name: String,
    nature: Nature,
    fail: Option<String>,
}

impl FakeCompiler {
    pub fn opt() -> Self {
        Self {
            name: "fake-opt".into(),
            nature: Nature::Opt,
            fail: None,
        }
    }

    pub fn baseline() -> Self {
        Self {
            name: "fake-baseline".into(),
            nature: Nature::Baseline,
            fail: None,
        }
    }

    /// A baseline compiler rejecting every method.
    pub fn failing(message: &str) -> Self {
        Self {
            name: "fake-failing".into(),
            nature: Nature::Baseline,
            fail: Some(message.into()),
        }
    }
}

impl RuntimeCompiler for FakeCompiler {
    fn name(&self) -> &str {
        &self.name
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
        if let Some(message) = &self.fail {
            return Err(CompileError::bailout(message.clone()));
        }
        let mut code = vec![crate::asm::amd64::NOP; 15];
        code.push(0xC3);
        Ok(CodegenResult::new(code, self.nature))
    }
}

pub fn runtime() -> TargetRuntime {
    runtime_with(TargetConfig::for_testing(), FakeCompiler::opt(), Some(FakeCompiler::baseline()))
}

pub fn runtime_with(
    config: TargetConfig,
    optimizing: impl RuntimeCompiler + 'static,
    baseline: Option<impl RuntimeCompiler + 'static>,
) -> TargetRuntime {
    let baseline = baseline.map(|c| Arc::new(c) as Arc<dyn RuntimeCompiler>);
    TargetRuntime::new(config, Arc::new(optimizing), baseline).expect("test runtime")
}

/// A static `() -> int` method with a name no other test uses.
pub fn unique_method(name: &str) -> MethodRef {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    let id = NEXT.fetch_add(1, Ordering::Relaxed);
    MethodActor::builder("Test", format!("{name}{id}"), Signature::new([], Kind::Int))
        .static_method()
        .build()
}
