//! Entry points and direct-call targets.

use std::fmt;
use std::sync::Arc;

use crate::kind::Kind;
use crate::method::MethodRef;

use super::method::TargetMethod;

// =============================================================================
// Call Entry Points
// =============================================================================

/// Offset into a method's code at which a caller of a given convention
/// enters.
///
/// Every compiled method starts with an adapter prologue. Baseline callers
/// enter at offset 0 and optimized callers skip the first 8 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallEntryPoint {
    /// Entry used by dispatch tables.
    Vtable,
    Optimized,
    Baseline,
    /// Entry used when native code calls into the VM.
    CEntry,
}

impl CallEntryPoint {
    pub const VALUES: [CallEntryPoint; 4] = [
        CallEntryPoint::Vtable,
        CallEntryPoint::Optimized,
        CallEntryPoint::Baseline,
        CallEntryPoint::CEntry,
    ];

    /// Byte offset from the code start.
    #[inline]
    pub const fn offset(self) -> usize {
        match self {
            CallEntryPoint::Baseline => 0,
            CallEntryPoint::Optimized | CallEntryPoint::Vtable | CallEntryPoint::CEntry => 8,
        }
    }
}

// =============================================================================
// Runtime Routines
// =============================================================================

/// A routine implemented by the embedding VM that stubs call into.
///
/// Routines are bound to code addresses at startup with
/// [`crate::TargetRuntime::bind_routine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeRoutine {
    ResolveVirtualCall,
    ResolveInterfaceCall,
    PatchStaticTrampolineCallSite,
    HandleTrap,
    /// Deoptimize a frame returning a value of the given stack kind.
    Deoptimize(Kind),
    DeoptimizeAtSafepoint,
    DeoptimizeFromCompilerStub(Kind),
    UncommonTrap,
    Unroll,
    /// A routine only known to the embedder.
    Named(&'static str),
}

impl RuntimeRoutine {
    /// Conventional symbol name.
    pub fn name(&self) -> String {
        match self {
            RuntimeRoutine::ResolveVirtualCall => "resolveVirtualCall".into(),
            RuntimeRoutine::ResolveInterfaceCall => "resolveInterfaceCall".into(),
            RuntimeRoutine::PatchStaticTrampolineCallSite => "patchStaticTrampolineCallSite".into(),
            RuntimeRoutine::HandleTrap => "handleTrap".into(),
            RuntimeRoutine::Deoptimize(kind) => format!("deoptimize{}", kind_suffix(*kind)),
            RuntimeRoutine::DeoptimizeAtSafepoint => "deoptimizeAtSafepoint".into(),
            RuntimeRoutine::DeoptimizeFromCompilerStub(kind) => {
                format!("deoptimize{}FromCompilerStub", kind_suffix(*kind))
            }
            RuntimeRoutine::UncommonTrap => "uncommonTrap".into(),
            RuntimeRoutine::Unroll => "unroll".into(),
            RuntimeRoutine::Named(name) => (*name).into(),
        }
    }
}

fn kind_suffix(kind: Kind) -> &'static str {
    match kind.stack_kind() {
        Kind::Void => "Void",
        Kind::Int => "Int",
        Kind::Long => "Long",
        Kind::Float => "Float",
        Kind::Double => "Double",
        Kind::Object => "Object",
        _ => "Word",
    }
}

impl fmt::Display for RuntimeRoutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

// =============================================================================
// Direct Callees
// =============================================================================

/// Statically known target of a direct call site.
#[derive(Clone)]
pub enum Callee {
    /// A managed method, linked to its current compiled version.
    Method(MethodRef),
    /// The adapter called from a method prologue.
    Adapter(Arc<TargetMethod>),
    /// A runtime routine.
    Routine(RuntimeRoutine),
}

impl Callee {
    pub fn as_method(&self) -> Option<&MethodRef> {
        match self {
            Callee::Method(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_routine(&self) -> Option<RuntimeRoutine> {
        match self {
            Callee::Routine(r) => Some(*r),
            _ => None,
        }
    }
}

impl PartialEq for Callee {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Callee::Method(a), Callee::Method(b)) => Arc::ptr_eq(a, b),
            (Callee::Adapter(a), Callee::Adapter(b)) => Arc::ptr_eq(a, b),
            (Callee::Routine(a), Callee::Routine(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Callee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Callee::Method(m) => write!(f, "Method({})", m.qualified_name()),
            Callee::Adapter(tm) => write!(f, "Adapter({})", tm.name()),
            Callee::Routine(r) => write!(f, "Routine({r})"),
        }
    }
}
