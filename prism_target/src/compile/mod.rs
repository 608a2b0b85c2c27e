//! The compile-and-wait protocol.
//!
//! A method moves between "not compiled", "compiling" and "compiled" under
//! its own lock. The first requester installs a [`Compilation`] in the
//! method's state slot and runs the compiler; later requesters find it there
//! and block until it finishes.
//!
//! ```text
//!   Created ──compile()──▶ Running ──┬──▶ Done(Ok(tm))
//!                                     └──▶ Done(Err(e))
//! ```

pub mod broker;
pub mod compilation;
pub mod compilations;
pub mod compiler;
pub mod context;
pub mod state;

use std::fmt;

pub use broker::{BrokerStats, CompilationBroker, MethodProfile};
pub use compilation::{Compilation, CompilationPhase};
pub use compilations::{Compilations, CurrentFlags};
pub use compiler::RuntimeCompiler;
pub use context::{CompileContext, InterruptFlag};
pub use state::CompiledState;

/// Classification of compiled code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Nature {
    /// Quick template-style code with a stack-based calling convention.
    #[default]
    Baseline,
    /// Optimized code with a register-based calling convention.
    Opt,
}

impl Nature {
    /// The other nature.
    #[inline]
    pub const fn other(self) -> Nature {
        match self {
            Nature::Baseline => Nature::Opt,
            Nature::Opt => Nature::Baseline,
        }
    }
}

impl fmt::Display for Nature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Nature::Baseline => f.write_str("baseline"),
            Nature::Opt => f.write_str("opt"),
        }
    }
}
