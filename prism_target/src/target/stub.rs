//! Stub kinds and per-stub metadata.

use std::fmt;

use crate::kind::Kind;

use super::call_target::RuntimeRoutine;

/// The closed set of hand-assembled stubs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StubType {
    /// Resolves a virtual call through the vtable and tail-calls the target.
    VirtualTrampoline,
    /// Resolves an interface call through the itable and tail-calls the target.
    InterfaceTrampoline,
    /// Links a direct call site to its callee and re-executes the call.
    StaticTrampoline,
    CompilerStub,
    TrapStub,
    UncommonTrapStub,
    DeoptStub,
    DeoptStubFromCompilerStub,
    DeoptStubFromSafepoint,
    UnwindStub,
    UnrollStub,
    /// Shared target of dispatch-table slots below the first valid index.
    InvalidIndexTrampoline,
}

impl StubType {
    #[inline]
    pub const fn is_trampoline(self) -> bool {
        matches!(
            self,
            StubType::VirtualTrampoline
                | StubType::InterfaceTrampoline
                | StubType::StaticTrampoline
                | StubType::InvalidIndexTrampoline
        )
    }

    #[inline]
    pub const fn is_deopt(self) -> bool {
        matches!(
            self,
            StubType::DeoptStub | StubType::DeoptStubFromCompilerStub | StubType::DeoptStubFromSafepoint
        )
    }
}

impl fmt::Display for StubType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Metadata carried by a stub target method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubInfo {
    pub stub_type: StubType,
    /// Offset of the stub's single direct call, if it has one.
    pub call_pos: Option<usize>,
    /// Dispatch index of a virtual or interface trampoline.
    pub index: Option<usize>,
    /// Routine the stub transfers to.
    pub routine: Option<RuntimeRoutine>,
    /// Offset of the 8-byte aligned immediate holding the routine address,
    /// for stubs that reach their routine without a call.
    pub routine_patch_pos: Option<usize>,
    /// Return kind handled by per-kind stubs.
    pub kind: Option<Kind>,
}

impl StubInfo {
    pub fn new(stub_type: StubType) -> Self {
        Self {
            stub_type,
            call_pos: None,
            index: None,
            routine: None,
            routine_patch_pos: None,
            kind: None,
        }
    }

    pub fn with_call(mut self, call_pos: usize, routine: RuntimeRoutine) -> Self {
        self.call_pos = Some(call_pos);
        self.routine = Some(routine);
        self
    }

    pub fn with_index(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_routine_patch(mut self, pos: usize, routine: RuntimeRoutine) -> Self {
        self.routine_patch_pos = Some(pos);
        self.routine = Some(routine);
        self
    }

    pub fn with_kind(mut self, kind: Kind) -> Self {
        self.kind = Some(kind);
        self
    }
}
