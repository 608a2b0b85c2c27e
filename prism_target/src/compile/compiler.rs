//! The code-generation service seam.

use crate::error::CompileError;
use crate::method::MethodRef;
use crate::runtime::TargetRuntime;
use crate::target::CodegenResult;

use super::{CompileContext, Nature};

/// A compiler producing machine code for managed methods.
///
/// Implementations live outside this crate. A compiler that needs another
/// method's code while compiling (inlining, eager callee compilation) goes
/// back through [`crate::CompilationBroker::compile`] with the same `ctx`.
pub trait RuntimeCompiler: Send + Sync {
    /// Name used in logs and compile commands.
    fn name(&self) -> &str;

    /// Classification of the code this compiler produces.
    fn nature(&self) -> Nature;

    /// Compile `method`.
    ///
    /// `for_deopt` asks for code that can resume deoptimized frames.
    fn compile(
        &self,
        rt: &TargetRuntime,
        method: &MethodRef,
        for_deopt: bool,
        ctx: &mut CompileContext,
    ) -> Result<CodegenResult, CompileError>;
}

impl std::fmt::Debug for dyn RuntimeCompiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RuntimeCompiler({}, {})", self.name(), self.nature())
    }
}
