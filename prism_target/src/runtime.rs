//! The per-VM root object.
//!
//! [`TargetRuntime`] owns the code cache, the register configurations, the
//! stubs, the adapter cache and the compilation broker, and binds the
//! runtime routines stubs and compiled code call into.

use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard};
use rustc_hash::FxHashMap;

use crate::asm::Amd64Assembler;
use crate::code::patch;
use crate::code::CodeCache;
use crate::compile::{CompilationBroker, CompileContext, Nature, RuntimeCompiler};
use crate::config::TargetConfig;
use crate::error::TargetError;
use crate::method::MethodRef;
use crate::platform::Platform;
use crate::registers::RegisterConfigs;
use crate::registers::amd64::R11;
use crate::stubs::Stubs;
use crate::target::{AdapterGenerator, Callee, RuntimeRoutine, TargetMethod};

/// Size of `mov r11, imm64; jmp r11`.
const FAR_THUNK_SIZE: usize = 13;

/// A bound routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Binding {
    /// Address the embedder bound.
    address: usize,
    /// Address direct calls reach: `address` or a thunk jumping to it.
    call_target: usize,
}

/// Code installation, linking and compilation state of one VM.
pub struct TargetRuntime {
    config: TargetConfig,
    register_configs: RegisterConfigs,
    code_cache: CodeCache,
    routines: RwLock<FxHashMap<RuntimeRoutine, Binding>>,
    /// Held shared while code is linked and registered, exclusive while a
    /// routine is bound and its calls relinked.
    linking: RwLock<()>,
    stubs: Stubs,
    adapters: AdapterGenerator,
    broker: CompilationBroker,
}

impl TargetRuntime {
    /// Map the code cache and generate the fixed stubs.
    ///
    /// `optimizing` is required; without a `baseline` compiler every request
    /// goes to `optimizing`.
    pub fn new(
        config: TargetConfig,
        optimizing: Arc<dyn RuntimeCompiler>,
        baseline: Option<Arc<dyn RuntimeCompiler>>,
    ) -> Result<Self, TargetError> {
        config.validate()?;
        let register_configs = RegisterConfigs::create(config.platform);
        let code_cache = CodeCache::new(&config)?;
        let broker = CompilationBroker::new(&config, optimizing, baseline);
        let rt = Self {
            config,
            register_configs,
            code_cache,
            routines: RwLock::new(FxHashMap::default()),
            linking: RwLock::new(()),
            stubs: Stubs::new(),
            adapters: AdapterGenerator::new(),
            broker,
        };
        rt.stubs.initialize(&rt)?;
        tracing::info!(
            platform = %rt.config.platform,
            code_cache = rt.config.code_cache_size,
            stubs = rt.code_cache.len(),
            "target runtime ready"
        );
        Ok(rt)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    #[inline]
    pub fn config(&self) -> &TargetConfig {
        &self.config
    }

    #[inline]
    pub fn platform(&self) -> &Platform {
        &self.config.platform
    }

    #[inline]
    pub fn word_size(&self) -> usize {
        self.config.platform.word_size
    }

    #[inline]
    pub fn register_configs(&self) -> &RegisterConfigs {
        &self.register_configs
    }

    #[inline]
    pub fn code_cache(&self) -> &CodeCache {
        &self.code_cache
    }

    #[inline]
    pub fn stubs(&self) -> &Stubs {
        &self.stubs
    }

    #[inline]
    pub fn adapters(&self) -> &AdapterGenerator {
        &self.adapters
    }

    #[inline]
    pub fn broker(&self) -> &CompilationBroker {
        &self.broker
    }

    /// Compile `method` through the broker.
    pub fn compile(
        &self,
        method: &MethodRef,
        nature: Option<Nature>,
        ctx: &mut CompileContext,
    ) -> Result<Arc<TargetMethod>, TargetError> {
        self.broker.compile(self, method, nature, ctx)
    }

    // =========================================================================
    // Runtime Routines
    // =========================================================================

    /// Address direct calls to `routine` reach, once bound.
    pub fn routine_address(&self, routine: RuntimeRoutine) -> Option<usize> {
        self.routines.read().get(&routine).map(|binding| binding.call_target)
    }

    /// Bind `routine` to `address` and relink every installed call to it.
    ///
    /// Addresses a rel32 call from the code cache cannot reach go through a
    /// thunk allocated in the cache.
    pub fn bind_routine(&self, routine: RuntimeRoutine, address: usize) -> Result<(), TargetError> {
        let call_target = if self.reachable_from_cache(address) {
            address
        } else {
            self.far_thunk(address)?
        };
        let _linking = self.linking.write();
        self.routines.write().insert(routine, Binding { address, call_target });

        let mut relinked = 0usize;
        for tm in self.code_cache.methods() {
            let safepoints = tm.safepoints();
            for (dc, index) in safepoints.direct_calls().enumerate() {
                if let Some(Callee::Routine(r)) = tm.direct_callees().get(dc) {
                    if *r == routine {
                        tm.patch_call_site(safepoints.cause_pos_at(index), call_target);
                        relinked += 1;
                    }
                }
            }
            if let Some(info) = tm.stub_info() {
                if info.routine == Some(routine) {
                    self.patch_routine_immediate(&tm);
                }
            }
        }
        tracing::debug!(
            %routine,
            address,
            thunk = call_target != address,
            relinked,
            "bound runtime routine"
        );
        Ok(())
    }

    /// Keep routine bindings stable until the guard drops.
    ///
    /// Code must be linked and registered under one guard so a concurrent
    /// [`bind_routine`](Self::bind_routine) either sees it in the cache or
    /// has already published the address it links to.
    pub(crate) fn link_guard(&self) -> RwLockReadGuard<'_, ()> {
        self.linking.read()
    }

    /// Store the bound address of a stub's routine in its patchable
    /// immediate. Unbound routines and stubs without one are left alone.
    pub(crate) fn patch_routine_immediate(&self, stub: &TargetMethod) {
        let Some(info) = stub.stub_info() else {
            return;
        };
        let (Some(pos), Some(routine)) = (info.routine_patch_pos, info.routine) else {
            return;
        };
        let Some(binding) = self.routines.read().get(&routine).copied() else {
            return;
        };
        if let Err(err) = patch::patch_word_mt_safe(stub.code_span(), pos, binding.address as u64) {
            crate::fatal!("{}: {err}", stub.name());
        }
    }

    fn reachable_from_cache(&self, address: usize) -> bool {
        let region = self.code_cache.region();
        patch::rel32_displacement(region.start(), 0, address).is_ok()
            && patch::rel32_displacement(region.end(), 0, address).is_ok()
    }

    fn far_thunk(&self, address: usize) -> Result<usize, TargetError> {
        let mut asm = Amd64Assembler::new();
        asm.movq_imm64(R11, address as u64);
        asm.jmp_reg(R11);
        let code = asm.finish();
        debug_assert_eq!(code.len(), FAR_THUNK_SIZE);
        let span = self.code_cache.allocate_span(code.len())?;
        span.write_bytes(0, &code);
        Ok(span.start())
    }
}

impl std::fmt::Debug for TargetRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetRuntime")
            .field("platform", &self.config.platform)
            .field("code_cache", &self.code_cache)
            .field("routines", &self.routines.read().len())
            .field("stubs", &self.stubs)
            .finish()
    }
}
