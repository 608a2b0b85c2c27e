//! Per-thread compile context.
//!
//! The chain of compilations running on the current thread travels through
//! the compile call chain as an explicit value, so a compiler asking for the
//! method it is compiling is caught instead of deadlocking on the method's
//! own lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use smallvec::SmallVec;

use crate::method::MethodActor;

use super::Compilation;

/// A thread's pending-interrupt flag.
///
/// Interrupts that arrive while the thread waits for a compilation are
/// deferred and re-raised once the result is in hand.
#[derive(Debug, Default)]
pub struct InterruptFlag(AtomicBool);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Clear the flag, returning whether it was set.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

/// Compilations in flight on one thread, innermost last.
#[derive(Debug, Default)]
pub struct CompileContext {
    in_flight: SmallVec<[Arc<Compilation>; 4]>,
    interrupt: Arc<InterruptFlag>,
}

impl CompileContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// A context sharing `interrupt` with the owning thread.
    pub fn with_interrupt(interrupt: Arc<InterruptFlag>) -> Self {
        Self {
            in_flight: SmallVec::new(),
            interrupt,
        }
    }

    #[inline]
    pub fn interrupt_flag(&self) -> &Arc<InterruptFlag> {
        &self.interrupt
    }

    /// Whether any compilation is running on this thread.
    #[inline]
    pub fn is_compiling(&self) -> bool {
        !self.in_flight.is_empty()
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.in_flight.len()
    }

    /// Innermost running compilation.
    pub fn current(&self) -> Option<&Arc<Compilation>> {
        self.in_flight.last()
    }

    /// Whether `compiler` is already compiling `method` on this thread.
    pub fn is_compiling_with(&self, method: &MethodActor, compiler: &str) -> bool {
        self.in_flight
            .iter()
            .any(|c| std::ptr::eq(c.method().as_ref(), method) && c.compiler_name() == compiler)
    }

    /// Whether `compilation` runs on this thread.
    pub fn contains(&self, compilation: &Compilation) -> bool {
        self.in_flight.iter().any(|c| std::ptr::eq(c.as_ref(), compilation))
    }

    pub(crate) fn enter(&mut self, compilation: Arc<Compilation>) {
        self.in_flight.push(compilation);
    }

    /// Restore the parent context.
    pub(crate) fn exit(&mut self, compilation: &Compilation) {
        match self.in_flight.pop() {
            Some(top) if std::ptr::eq(top.as_ref(), compilation) => {}
            _ => crate::fatal!("compile context out of order for {}", compilation.method().qualified_name()),
        }
    }
}
