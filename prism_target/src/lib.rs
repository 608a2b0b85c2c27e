//! Compiled-method representation and linking runtime for Prism.
//!
//! This crate owns everything between "a compiler produced some machine code"
//! and "other code can call it":
//! - `TargetMethod` records (compiled methods, adapters, stubs) laid out in
//!   code-cache bundles together with their literals
//! - Safepoint/stop tables and direct-call linking
//! - Hand-assembled trampolines and deoptimization glue
//! - The compile-and-wait protocol that moves a method between
//!   "not compiled", "compiling" and "compiled"
//!
//! The bytecode model, the compiler backends and the garbage collector are
//! collaborators; they plug in through [`compile::RuntimeCompiler`],
//! [`target::StackFrameWalker`] and [`target::ReferenceMapPreparer`].
#![deny(unsafe_op_in_unsafe_fn)]

pub mod asm;
pub mod code;
pub mod compile;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod fatal;
pub mod kind;
pub mod method;
pub mod platform;
pub mod registers;
pub mod runtime;
pub mod stubs;
pub mod target;

#[cfg(test)]
mod test_support;

pub use compile::{CompilationBroker, CompileContext, Nature, RuntimeCompiler};
pub use config::{CompileCommand, TargetConfig};
pub use dispatch::{DispatchTable, Hub};
pub use error::{CompileError, TargetError};
pub use kind::Kind;
pub use method::{MethodActor, MethodRef, Signature};
pub use platform::{Isa, Os, Platform};
pub use runtime::TargetRuntime;
pub use stubs::Stubs;
pub use target::{CallEntryPoint, CodegenResult, RuntimeRoutine, TargetMethod};
