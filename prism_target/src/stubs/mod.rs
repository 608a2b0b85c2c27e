//! Stub factory.
//!
//! The static trampoline, the trap stubs and the deoptimization glue are
//! generated once by [`Stubs::initialize`]. Dynamic trampolines are generated
//! on demand, one per dispatch index, and cached for the life of the runtime.

pub mod amd64;
pub mod resolve;

use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::error::TargetError;
use crate::kind::Kind;
use crate::platform::Isa;
use crate::runtime::TargetRuntime;
use crate::target::method::{RawTarget, TargetMethod};
use crate::target::stub::StubType;
use crate::target::StackFrameWalker;

pub use resolve::{
    adjust_entry_point_for_caller, patch_static_trampoline_call_site, resolve_interface_call,
    resolve_virtual_call,
};

// =============================================================================
// Trap State
// =============================================================================

/// Thread-local offsets, from the latch register, of the state the native
/// trap handler records before entering the trap stub. The four words are
/// consecutive.
pub const TRAP_NUMBER_OFFSET: i32 = 0x40;
pub const TRAP_INSTRUCTION_POINTER_OFFSET: i32 = TRAP_NUMBER_OFFSET + 8;
pub const TRAP_FAULT_ADDRESS_OFFSET: i32 = TRAP_NUMBER_OFFSET + 16;
pub const TRAP_LATCH_REGISTER_OFFSET: i32 = TRAP_NUMBER_OFFSET + 24;

// =============================================================================
// Stubs
// =============================================================================

type PerKind = Box<[Arc<TargetMethod>]>;

/// Every stub of one runtime.
#[derive(Default)]
pub struct Stubs {
    /// Serializes generation of the fixed stubs.
    init: Mutex<()>,
    virtual_trampolines: Mutex<Vec<Option<Arc<TargetMethod>>>>,
    interface_trampolines: Mutex<Vec<Option<Arc<TargetMethod>>>>,
    invalid_index_trampoline: OnceLock<Arc<TargetMethod>>,
    static_trampoline: OnceLock<Arc<TargetMethod>>,
    trap: OnceLock<Arc<TargetMethod>>,
    uncommon_trap: OnceLock<Arc<TargetMethod>>,
    deopt: OnceLock<PerKind>,
    deopt_from_compiler_stub: OnceLock<PerKind>,
    deopt_at_safepoint: OnceLock<Arc<TargetMethod>>,
    unwind: OnceLock<PerKind>,
    unroll: OnceLock<Arc<TargetMethod>>,
}

impl Stubs {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_isa(rt: &TargetRuntime) {
        if rt.platform().isa != Isa::Amd64 {
            crate::fatal!("stub generation unimplemented for {}", rt.platform());
        }
    }

    fn install(rt: &TargetRuntime, raw: RawTarget) -> Result<Arc<TargetMethod>, TargetError> {
        let stub = TargetMethod::install_raw(rt, raw)?;
        tracing::trace!(name = stub.name(), start = stub.code_start(), "generated stub");
        Ok(stub)
    }

    fn per_kind(
        rt: &TargetRuntime,
        generate: impl Fn(&TargetRuntime, Kind) -> RawTarget,
    ) -> Result<PerKind, TargetError> {
        Kind::STACK_KINDS
            .iter()
            .map(|&kind| Self::install(rt, generate(rt, kind)))
            .collect()
    }

    /// Generate the fixed stubs. Repeated calls are no-ops.
    pub(crate) fn initialize(&self, rt: &TargetRuntime) -> Result<(), TargetError> {
        let _init = self.init.lock();
        if self.static_trampoline.get().is_some() {
            return Ok(());
        }
        Self::check_isa(rt);
        // Linking any later code needs the static trampoline.
        let _ = self.static_trampoline.set(Self::install(rt, amd64::static_trampoline(rt))?);
        let _ = self.invalid_index_trampoline.set(Self::install(
            rt,
            amd64::dynamic_trampoline(rt, StubType::InvalidIndexTrampoline, 0),
        )?);
        let _ = self.trap.set(Self::install(rt, amd64::trap_stub(rt))?);
        let _ = self.uncommon_trap.set(Self::install(rt, amd64::uncommon_trap_stub(rt))?);
        let _ = self.deopt.set(Self::per_kind(rt, amd64::deopt_stub)?);
        let _ = self
            .deopt_from_compiler_stub
            .set(Self::per_kind(rt, |rt, kind| amd64::deopt_stub_with_csa(rt, Some(kind)))?);
        let _ = self
            .deopt_at_safepoint
            .set(Self::install(rt, amd64::deopt_stub_with_csa(rt, None))?);
        let _ = self.unwind.set(Self::per_kind(rt, amd64::unwind_stub)?);
        let _ = self.unroll.set(Self::install(rt, amd64::unroll_stub(rt))?);

        for stub in self.deopt.get().into_iter().flat_map(|s| s.iter()) {
            rt.patch_routine_immediate(stub);
        }
        tracing::debug!(platform = %rt.platform(), "generated stubs");
        Ok(())
    }

    // =========================================================================
    // Trampolines
    // =========================================================================

    /// Trampoline for vtable slot `index`.
    pub fn virtual_trampoline(&self, rt: &TargetRuntime, index: usize) -> Result<Arc<TargetMethod>, TargetError> {
        if index < rt.config().first_valid_vtable_index {
            return Ok(Arc::clone(self.invalid_index_trampoline()));
        }
        Self::trampoline(rt, &self.virtual_trampolines, StubType::VirtualTrampoline, index)
    }

    /// Trampoline for itable slot `index`.
    pub fn interface_trampoline(&self, rt: &TargetRuntime, index: usize) -> Result<Arc<TargetMethod>, TargetError> {
        if index < rt.config().first_valid_itable_index {
            return Ok(Arc::clone(self.invalid_index_trampoline()));
        }
        Self::trampoline(rt, &self.interface_trampolines, StubType::InterfaceTrampoline, index)
    }

    fn trampoline(
        rt: &TargetRuntime,
        cache: &Mutex<Vec<Option<Arc<TargetMethod>>>>,
        stub_type: StubType,
        index: usize,
    ) -> Result<Arc<TargetMethod>, TargetError> {
        let mut cache = cache.lock();
        if let Some(Some(stub)) = cache.get(index) {
            return Ok(Arc::clone(stub));
        }
        Self::check_isa(rt);
        let stub = Self::install(rt, amd64::dynamic_trampoline(rt, stub_type, index))?;
        if cache.len() <= index {
            cache.resize(index + 1, None);
        }
        cache[index] = Some(Arc::clone(&stub));
        Ok(stub)
    }

    fn invalid_index_trampoline(&self) -> &Arc<TargetMethod> {
        match self.invalid_index_trampoline.get() {
            Some(stub) => stub,
            None => crate::fatal!("stubs not initialized"),
        }
    }

    /// The static trampoline, once generated.
    pub fn static_trampoline(&self) -> Option<&Arc<TargetMethod>> {
        self.static_trampoline.get()
    }

    /// Dispatch index baked into a dynamic trampoline.
    pub fn dispatch_table_index(&self, stub: &TargetMethod) -> usize {
        if !matches!(
            stub.stub_type(),
            Some(StubType::VirtualTrampoline | StubType::InterfaceTrampoline | StubType::InvalidIndexTrampoline)
        ) {
            crate::fatal!("{} is not a dynamic trampoline", stub.name());
        }
        let pos = amd64::DISPATCH_INDEX_IMM_POS;
        let code = stub.copy_code();
        match code.get(pos - 2..pos + 4) {
            Some([0x41, 0xBB, imm @ ..]) => u32::from_le_bytes([imm[0], imm[1], imm[2], imm[3]]) as usize,
            _ => crate::fatal!("{}: no dispatch index at offset {pos}", stub.name()),
        }
    }

    /// Dispatch index saved by a dynamic trampoline whose callee-save area
    /// starts at `csa`.
    pub fn read_virtual_dispatch_index_from_trampoline_frame(
        &self,
        rt: &TargetRuntime,
        csa: usize,
        walker: &dyn StackFrameWalker,
    ) -> usize {
        let config = &rt.register_configs().trampoline;
        let offset = config
            .csl
            .as_ref()
            .and_then(|csl| csl.offset_of(config.scratch))
            .unwrap_or_else(|| crate::fatal!("trampoline does not save {}", config.scratch.name));
        walker.read_word(csa + offset) & u32::MAX as usize
    }

    // =========================================================================
    // Traps and Deoptimization
    // =========================================================================

    pub fn trap_stub(&self) -> Option<&Arc<TargetMethod>> {
        self.trap.get()
    }

    pub fn uncommon_trap_stub(&self) -> Option<&Arc<TargetMethod>> {
        self.uncommon_trap.get()
    }

    /// Deopt stub returned into by a method returning `kind`.
    pub fn deopt_stub(&self, kind: Kind, from_compiler_stub: bool) -> Option<&Arc<TargetMethod>> {
        let table = if from_compiler_stub {
            &self.deopt_from_compiler_stub
        } else {
            &self.deopt
        };
        table.get().map(|stubs| &stubs[kind.stack_index()])
    }

    pub fn deopt_stub_at_safepoint(&self) -> Option<&Arc<TargetMethod>> {
        self.deopt_at_safepoint.get()
    }

    pub fn unwind_stub(&self, kind: Kind) -> Option<&Arc<TargetMethod>> {
        self.unwind.get().map(|stubs| &stubs[kind.stack_index()])
    }

    pub fn unroll_stub(&self) -> Option<&Arc<TargetMethod>> {
        self.unroll.get()
    }

    pub fn is_deopt_stub(&self, tm: &TargetMethod) -> bool {
        tm.stub_type().is_some_and(StubType::is_deopt)
    }
}

impl std::fmt::Debug for Stubs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stubs")
            .field("initialized", &self.static_trampoline.get().is_some())
            .field("virtual_trampolines", &self.virtual_trampolines.lock().len())
            .field("interface_trampolines", &self.interface_trampolines.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::call_target::RuntimeRoutine;
    use crate::test_support::runtime;

    struct Words(usize, usize);

    impl StackFrameWalker for Words {
        fn read_word(&self, address: usize) -> usize {
            assert_eq!(address, self.0);
            self.1
        }

        fn advance(&mut self, _ip: usize, _sp: usize, _fp: usize) {}
    }

    #[test]
    fn test_initialize_generates_fixed_stubs() {
        let rt = runtime();
        let stubs = rt.stubs();
        assert!(stubs.static_trampoline().unwrap().is(StubType::StaticTrampoline));
        assert!(stubs.trap_stub().is_some());
        assert!(stubs.uncommon_trap_stub().is_some());
        assert!(stubs.unroll_stub().is_some());
        for kind in Kind::STACK_KINDS {
            let deopt = stubs.deopt_stub(kind, false).unwrap();
            assert!(stubs.is_deopt_stub(deopt));
            assert!(stubs.is_deopt_stub(stubs.deopt_stub(kind, true).unwrap()));
            assert!(!stubs.is_deopt_stub(stubs.unwind_stub(kind).unwrap()));
        }
        assert_eq!(stubs.deopt_stub(Kind::Boolean, false).unwrap().name(), "deoptimizeIntStub");
        // A second initialization reuses the existing stubs.
        let before = rt.code_cache().len();
        stubs.initialize(&rt).unwrap();
        assert_eq!(rt.code_cache().len(), before);
    }

    #[test]
    fn test_concurrent_initialize_generates_one_set() {
        let rt = runtime();
        let per_set = rt.code_cache().len();
        let stubs = Stubs::new();
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| stubs.initialize(&rt).unwrap());
            }
        });
        assert_eq!(rt.code_cache().len(), 2 * per_set);
        assert!(stubs.static_trampoline().is_some());
    }

    #[test]
    fn test_trampolines_are_cached_per_index() {
        let rt = runtime();
        let a = rt.stubs().virtual_trampoline(&rt, 9).unwrap();
        let b = rt.stubs().virtual_trampoline(&rt, 9).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let i = rt.stubs().interface_trampoline(&rt, 9).unwrap();
        assert!(!Arc::ptr_eq(&a, &i));
        assert_eq!(a.name(), "vtrampoline9");
        assert_eq!(rt.stubs().dispatch_table_index(&a), 9);
        assert_eq!(rt.stubs().dispatch_table_index(&i), 9);
    }

    #[test]
    fn test_low_indexes_share_invalid_index_trampoline() {
        let rt = runtime();
        let a = rt.stubs().virtual_trampoline(&rt, 0).unwrap();
        let b = rt.stubs().interface_trampoline(&rt, 1).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.is(StubType::InvalidIndexTrampoline));
    }

    #[test]
    fn test_read_dispatch_index_from_frame() {
        let rt = runtime();
        let csl = rt.register_configs().trampoline.csl.clone().unwrap();
        let offset = csl.offset_of(crate::registers::amd64::R11).unwrap();
        let walker = Words(0x8000 + offset, 0xFFFF_FFFF_0000_0011);
        assert_eq!(
            rt.stubs().read_virtual_dispatch_index_from_trampoline_frame(&rt, 0x8000, &walker),
            0x11
        );
    }

    #[test]
    fn test_deopt_immediate_patched_on_bind() {
        let rt = runtime();
        let stub = rt.stubs().deopt_stub(Kind::Long, false).unwrap();
        let pos = stub.stub_info().unwrap().routine_patch_pos.unwrap();
        assert_eq!(stub.code_span().read_u64(pos), amd64::UNBOUND_ROUTINE);
        let routine = rt.code_cache().region().start() + 0x40;
        rt.bind_routine(RuntimeRoutine::Deoptimize(Kind::Long), routine).unwrap();
        assert_eq!(stub.code_span().read_u64(pos), routine as u64);
    }

    #[test]
    #[should_panic(expected = "not a dynamic trampoline")]
    fn test_dispatch_index_of_static_trampoline_is_fatal() {
        let rt = runtime();
        let stub = Arc::clone(rt.stubs().static_trampoline().unwrap());
        rt.stubs().dispatch_table_index(&stub);
    }
}
