//! Managed methods as seen by the code subsystem.
//!
//! The full class model lives with the embedding VM. This crate only needs a
//! method's identity, signature and flags, plus the state slot recording what
//! it has been compiled to.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};
use smallvec::SmallVec;

use crate::compile::{Compilation, Compilations, CompiledState, CurrentFlags};
use crate::kind::Kind;
use crate::target::TargetMethod;

/// Shared handle to a method.
pub type MethodRef = Arc<MethodActor>;

// =============================================================================
// Signature
// =============================================================================

/// Parameter and return kinds of a method, receiver excluded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    params: SmallVec<[Kind; 8]>,
    return_kind: Kind,
}

impl Signature {
    pub fn new(params: impl IntoIterator<Item = Kind>, return_kind: Kind) -> Self {
        Self {
            params: params.into_iter().collect(),
            return_kind,
        }
    }

    #[inline]
    pub fn params(&self) -> &[Kind] {
        &self.params
    }

    #[inline]
    pub fn return_kind(&self) -> Kind {
        self.return_kind
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, kind) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{kind}")?;
        }
        write!(f, ") -> {}", self.return_kind)
    }
}

// =============================================================================
// Method Actor
// =============================================================================

const STATIC: u8 = 1 << 0;
const ABSTRACT: u8 = 1 << 1;
const NATIVE: u8 = 1 << 2;
const UNSAFE: u8 = 1 << 3;

/// Compilation state guarded by the method lock.
#[derive(Debug, Default)]
pub(crate) struct MethodState {
    pub(crate) compilations: Compilations,
    pub(crate) history: CompiledState,
    pub(crate) in_progress: Option<Arc<Compilation>>,
}

/// A managed method.
pub struct MethodActor {
    holder: String,
    name: String,
    signature: Signature,
    flags: u8,
    state: Mutex<MethodState>,
    state_changed: Condvar,
}

impl MethodActor {
    pub fn builder(holder: impl Into<String>, name: impl Into<String>, signature: Signature) -> MethodActorBuilder {
        MethodActorBuilder {
            holder: holder.into(),
            name: name.into(),
            signature,
            flags: 0,
        }
    }

    #[inline]
    pub fn holder(&self) -> &str {
        &self.holder
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `Holder.name`, the form matched by compile commands.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.holder, self.name)
    }

    #[inline]
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    #[inline]
    pub fn is_static(&self) -> bool {
        self.flags & STATIC != 0
    }

    #[inline]
    pub fn is_abstract(&self) -> bool {
        self.flags & ABSTRACT != 0
    }

    #[inline]
    pub fn is_native(&self) -> bool {
        self.flags & NATIVE != 0
    }

    /// Methods that manipulate raw memory and must never run as baseline
    /// code.
    #[inline]
    pub fn is_unsafe(&self) -> bool {
        self.flags & UNSAFE != 0
    }

    /// Kinds of the incoming arguments, receiver first.
    pub fn argument_kinds(&self) -> SmallVec<[Kind; 8]> {
        let mut kinds = SmallVec::with_capacity(self.signature.params.len() + 1);
        if !self.is_static() {
            kinds.push(Kind::Object);
        }
        kinds.extend_from_slice(&self.signature.params);
        kinds
    }

    /// Code callers should use now, optimized when valid.
    pub fn current_target_method(&self) -> Option<Arc<TargetMethod>> {
        self.current_target_method_with(CurrentFlags::DEFAULT)
    }

    pub fn current_target_method_with(&self, flags: CurrentFlags) -> Option<Arc<TargetMethod>> {
        self.state.lock().compilations.current_method(flags)
    }

    /// Snapshot of the baseline/optimized pair.
    pub fn compilations(&self) -> Compilations {
        self.state.lock().compilations.clone()
    }

    /// Snapshot of the compiled-state slot.
    pub fn compiled_state(&self) -> CompiledState {
        let state = self.state.lock();
        match &state.in_progress {
            Some(compilation) => CompiledState::InProgress(Arc::clone(compilation)),
            None => state.history.clone(),
        }
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, MethodState> {
        self.state.lock()
    }

    pub(crate) fn state_changed(&self) -> &Condvar {
        &self.state_changed
    }
}

impl fmt::Debug for MethodActor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodActor")
            .field("name", &self.qualified_name())
            .field("signature", &self.signature)
            .field("flags", &format_args!("{:#06b}", self.flags))
            .finish()
    }
}

impl fmt::Display for MethodActor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}{}", self.holder, self.name, self.signature)
    }
}

/// Builder for [`MethodActor`]; instance, concrete and managed by default.
#[derive(Debug, Clone)]
pub struct MethodActorBuilder {
    holder: String,
    name: String,
    signature: Signature,
    flags: u8,
}

impl MethodActorBuilder {
    pub fn static_method(mut self) -> Self {
        self.flags |= STATIC;
        self
    }

    pub fn abstract_method(mut self) -> Self {
        self.flags |= ABSTRACT;
        self
    }

    pub fn native_method(mut self) -> Self {
        self.flags |= NATIVE;
        self
    }

    pub fn unsafe_method(mut self) -> Self {
        self.flags |= UNSAFE;
        self
    }

    pub fn build(self) -> MethodRef {
        Arc::new(MethodActor {
            holder: self.holder,
            name: self.name,
            signature: self.signature,
            flags: self.flags,
            state: Mutex::new(MethodState::default()),
            state_changed: Condvar::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argument_kinds_include_receiver() {
        let sig = Signature::new([Kind::Int, Kind::Double], Kind::Void);
        let m = MethodActor::builder("Point", "move", sig.clone()).build();
        assert_eq!(m.argument_kinds().as_slice(), &[Kind::Object, Kind::Int, Kind::Double]);

        let s = MethodActor::builder("Math", "hypot", sig).static_method().build();
        assert_eq!(s.argument_kinds().as_slice(), &[Kind::Int, Kind::Double]);
    }

    #[test]
    fn test_flags() {
        let m = MethodActor::builder("A", "b", Signature::new([], Kind::Void))
            .abstract_method()
            .native_method()
            .build();
        assert!(m.is_abstract());
        assert!(m.is_native());
        assert!(!m.is_static());
        assert!(!m.is_unsafe());
        assert_eq!(m.qualified_name(), "A.b");
    }

    #[test]
    fn test_fresh_method_has_no_code() {
        let m = MethodActor::builder("A", "c", Signature::new([], Kind::Int)).build();
        assert!(m.current_target_method().is_none());
        assert_eq!(m.compiled_state(), CompiledState::Empty);
        assert!(m.compilations().is_empty());
    }
}
