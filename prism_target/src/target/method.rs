//! Installed machine code: compiled methods, adapters and stubs.
//!
//! A [`TargetMethod`] is immutable once installed except for three things:
//! individual call displacements may be patched, the invalidation marker is
//! set at most once, and eviction wipes the code.
//!
//! # Installation
//!
//! Both installation paths build a [`BundleLayout`], patch literal loads
//! against it, copy everything into a code-cache bundle and link the direct
//! calls before the method becomes reachable:
//!
//! - [`TargetMethod::install_raw`] for hand-assembled stubs and adapters
//! - [`TargetMethod::install_codegen`] for compiler output

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use crate::code::patch::{self, Unpublished, WorldStopped};
use crate::code::region::CodeSpan;
use crate::compile::Nature;
use crate::error::TargetError;
use crate::method::MethodRef;
use crate::registers::CalleeSaveLayout;
use crate::runtime::TargetRuntime;

use super::adapter::AdapterInfo;
use super::bundle::{ArrayField, BundleLayout};
use super::call_target::{CallEntryPoint, Callee};
use super::codegen_result::{
    CallTarget, CodegenResult, ExceptionHandler, Lifespan, ObjectConstant, ReferenceMap, Site,
};
use super::literals::Literals;
use super::safepoints::{self, Safepoints};
use super::stub::{StubInfo, StubType};

/// Byte written over evicted code.
pub const WIPED_CODE_BYTE: u8 = 0xCC;

// =============================================================================
// Kinds
// =============================================================================

/// The closed set of target method kinds.
#[derive(Debug, Clone)]
pub enum TargetKind {
    /// Output of a compiler for a managed method.
    Compiled,
    /// Calling-convention bridge.
    Adapter(AdapterInfo),
    /// Hand-assembled runtime glue.
    Stub(StubInfo),
}

/// Why a method was invalidated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationMarker {
    pub reason: String,
}

impl InvalidationMarker {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Input for [`TargetMethod::install_raw`].
#[derive(Debug)]
pub struct RawTarget {
    pub name: String,
    pub kind: TargetKind,
    pub code: Vec<u8>,
    pub safepoints: Safepoints,
    pub direct_callees: Vec<Callee>,
    pub frame_size: usize,
    pub callee_save_layout: Option<CalleeSaveLayout>,
    pub register_restore_epilogue_offset: Option<usize>,
    pub call_entry_point: CallEntryPoint,
}

impl RawTarget {
    pub fn new(name: impl Into<String>, kind: TargetKind, code: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            kind,
            code,
            safepoints: Safepoints::default(),
            direct_callees: Vec::new(),
            frame_size: 0,
            callee_save_layout: None,
            register_restore_epilogue_offset: None,
            call_entry_point: CallEntryPoint::Optimized,
        }
    }

    pub fn with_safepoints(mut self, safepoints: Safepoints, direct_callees: Vec<Callee>) -> Self {
        self.safepoints = safepoints;
        self.direct_callees = direct_callees;
        self
    }

    pub fn with_frame_size(mut self, frame_size: usize) -> Self {
        self.frame_size = frame_size;
        self
    }

    pub fn with_callee_save(mut self, csl: CalleeSaveLayout, restore_epilogue_offset: Option<usize>) -> Self {
        self.callee_save_layout = Some(csl);
        self.register_restore_epilogue_offset = restore_epilogue_offset;
        self
    }
}

// =============================================================================
// Target Method
// =============================================================================

/// A unit of installed machine code.
pub struct TargetMethod {
    name: String,
    method: Option<MethodRef>,
    kind: TargetKind,
    nature: Option<Nature>,
    call_entry_point: CallEntryPoint,
    word_size: usize,
    bundle: CodeSpan,
    code: CodeSpan,
    scalar_literals: Option<CodeSpan>,
    reference_literals: Vec<ObjectConstant>,
    safepoints: Safepoints,
    direct_callees: Vec<Callee>,
    reference_maps: Vec<Option<ReferenceMap>>,
    exception_handlers: Vec<ExceptionHandler>,
    frame_size: usize,
    register_restore_epilogue_offset: Option<usize>,
    callee_save_layout: Option<CalleeSaveLayout>,
    lifespan: Lifespan,
    invalidated: OnceLock<InvalidationMarker>,
    wiped: AtomicBool,
}

/// Everything but the bundle, gathered by the two installation paths.
struct Parts {
    name: String,
    method: Option<MethodRef>,
    kind: TargetKind,
    nature: Option<Nature>,
    call_entry_point: CallEntryPoint,
    safepoints: Safepoints,
    direct_callees: Vec<Callee>,
    reference_maps: Vec<Option<ReferenceMap>>,
    exception_handlers: Vec<ExceptionHandler>,
    frame_size: usize,
    register_restore_epilogue_offset: Option<usize>,
    callee_save_layout: Option<CalleeSaveLayout>,
    lifespan: Lifespan,
}

impl TargetMethod {
    // =========================================================================
    // Installation
    // =========================================================================

    /// Install hand-assembled code with an explicit safepoint table.
    pub fn install_raw(rt: &TargetRuntime, raw: RawTarget) -> Result<Arc<Self>, TargetError> {
        let reference_maps = vec![None; raw.safepoints.len()];
        let parts = Parts {
            name: raw.name,
            method: None,
            kind: raw.kind,
            nature: None,
            call_entry_point: raw.call_entry_point,
            safepoints: raw.safepoints,
            direct_callees: raw.direct_callees,
            reference_maps,
            exception_handlers: Vec::new(),
            frame_size: raw.frame_size,
            register_restore_epilogue_offset: raw.register_restore_epilogue_offset,
            callee_save_layout: raw.callee_save_layout,
            lifespan: Lifespan::Long,
        };
        Self::install(rt, parts, Literals::default(), raw.code)
    }

    /// Install the output of a compiler for `method`.
    pub fn install_codegen(
        rt: &TargetRuntime,
        method: &MethodRef,
        result: CodegenResult,
    ) -> Result<Arc<Self>, TargetError> {
        if result.code.len() > safepoints::MAX_POS {
            return Err(TargetError::CodeTooLarge {
                method: method.qualified_name(),
                size: result.code.len(),
                max: safepoints::MAX_POS,
            });
        }
        let mut sites = result.sites;
        sites.sort_by_key(Site::pc_offset);

        let mut entries = Vec::with_capacity(sites.len() + 1);
        let mut callees = Vec::new();
        let mut reference_maps = Vec::with_capacity(sites.len() + 1);

        if let Some(adapter) = &result.adapter {
            let Some(info) = adapter.adapter_info() else {
                crate::fatal!("{} is not an adapter", adapter.name())
            };
            let call_pos = info.call_offset_in_prologue();
            entries.push(safepoints::make(
                call_pos + info.call_size_in_prologue(),
                call_pos,
                safepoints::DIRECT_CALL,
            ));
            callees.push(Callee::Adapter(Arc::clone(adapter)));
            reference_maps.push(None);
        }

        for site in sites {
            match site {
                Site::Call(call) => {
                    let pos = safepoints::safepoint_pos_for_call(call.pc_offset, call.size);
                    let attrs = if call.direct {
                        let (callee, template) = match call.target {
                            CallTarget::Method(m) => (Callee::Method(m), false),
                            CallTarget::Runtime(r) => (Callee::Routine(r), false),
                            CallTarget::Template(r) => (Callee::Routine(r), true),
                            CallTarget::Native(symbol) => crate::fatal!(
                                "{}: direct call to native function {symbol}",
                                method.qualified_name()
                            ),
                            CallTarget::Indirect => crate::fatal!(
                                "{}: direct call at {} has no static target",
                                method.qualified_name(),
                                call.pc_offset
                            ),
                        };
                        callees.push(callee);
                        if template {
                            safepoints::DIRECT_CALL | safepoints::TEMPLATE_CALL
                        } else {
                            safepoints::DIRECT_CALL
                        }
                    } else {
                        match call.target {
                            CallTarget::Native(_) => safepoints::INDIRECT_CALL | safepoints::NATIVE_CALL,
                            CallTarget::Template(_) => safepoints::INDIRECT_CALL | safepoints::TEMPLATE_CALL,
                            _ => safepoints::INDIRECT_CALL,
                        }
                    };
                    entries.push(safepoints::make(pos, call.pc_offset, attrs));
                    reference_maps.push(call.reference_map);
                }
                Site::Safepoint {
                    pc_offset,
                    reference_map,
                } => {
                    entries.push(safepoints::make_safepoint(pc_offset));
                    reference_maps.push(reference_map);
                }
            }
        }

        let literals = Literals::serialize(rt.word_size(), &result.data_patches);
        let call_entry_point = match result.nature {
            Nature::Baseline => CallEntryPoint::Baseline,
            Nature::Opt => CallEntryPoint::Optimized,
        };
        let parts = Parts {
            name: method.qualified_name(),
            method: Some(Arc::clone(method)),
            kind: TargetKind::Compiled,
            nature: Some(result.nature),
            call_entry_point,
            safepoints: Safepoints::new(entries),
            direct_callees: callees,
            reference_maps,
            exception_handlers: result.exception_handlers,
            frame_size: result.frame_size,
            register_restore_epilogue_offset: result.register_restore_epilogue_offset,
            callee_save_layout: result.callee_save_layout,
            lifespan: result.lifespan,
        };
        Self::install(rt, parts, literals, result.code)
    }

    fn install(
        rt: &TargetRuntime,
        parts: Parts,
        literals: Literals,
        mut code: Vec<u8>,
    ) -> Result<Arc<Self>, TargetError> {
        if parts.direct_callees.len() != parts.safepoints.number_of_direct_calls() {
            crate::fatal!(
                "{}: {} direct callees for {} direct calls",
                parts.name,
                parts.direct_callees.len(),
                parts.safepoints.number_of_direct_calls()
            );
        }

        let word_size = rt.word_size();
        let layout = BundleLayout::new(
            word_size,
            literals.scalar_bytes().len(),
            literals.references().len(),
            code.len(),
        );
        if let Err(err) = literals.patch_code(&mut code, &layout) {
            crate::fatal!("{}: cannot patch literal load: {err}", parts.name);
        }

        let bundle = rt.code_cache().allocate(&layout)?;
        for field in ArrayField::VALUES {
            if layout.is_allocated(field) {
                let cell = layout.cell_offset(field);
                write_word(&bundle, word_size, cell, field as usize);
                write_word(&bundle, word_size, cell + word_size, layout.length(field));
            }
        }

        let scalar_literals = layout.is_allocated(ArrayField::ScalarLiterals).then(|| {
            let span = bundle.slice(
                layout.first_element_offset(ArrayField::ScalarLiterals),
                literals.scalar_bytes().len(),
            );
            span.write_bytes(0, literals.scalar_bytes());
            span
        });
        if layout.is_allocated(ArrayField::ReferenceLiterals) {
            let base = layout.first_element_offset(ArrayField::ReferenceLiterals);
            for (i, object) in literals.references().iter().enumerate() {
                write_word(&bundle, word_size, base + i * word_size, object.address());
            }
        }
        let code_span = bundle.slice(layout.first_element_offset(ArrayField::Code), code.len());
        code_span.write_bytes(0, &code);

        let tm = TargetMethod {
            name: parts.name,
            method: parts.method,
            kind: parts.kind,
            nature: parts.nature,
            call_entry_point: parts.call_entry_point,
            word_size,
            bundle,
            code: code_span,
            scalar_literals,
            reference_literals: literals.into_references(),
            safepoints: parts.safepoints,
            direct_callees: parts.direct_callees,
            reference_maps: parts.reference_maps,
            exception_handlers: parts.exception_handlers,
            frame_size: parts.frame_size,
            register_restore_epilogue_offset: parts.register_restore_epilogue_offset,
            callee_save_layout: parts.callee_save_layout,
            lifespan: parts.lifespan,
            invalidated: OnceLock::new(),
            wiped: AtomicBool::new(false),
        };

        let proof = Unpublished::new();
        let linking = rt.link_guard();
        let linked = tm.link_direct_calls(rt, &proof);
        let tm = Arc::new(tm);
        rt.code_cache().register(Arc::clone(&tm));
        drop(linking);
        tracing::debug!(
            name = %tm.name,
            start = tm.code_start(),
            size = tm.code_len(),
            linked,
            "installed target method"
        );
        Ok(tm)
    }

    // =========================================================================
    // Identity
    // =========================================================================

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Source method, absent for stubs and adapters.
    #[inline]
    pub fn method(&self) -> Option<&MethodRef> {
        self.method.as_ref()
    }

    #[inline]
    pub fn kind(&self) -> &TargetKind {
        &self.kind
    }

    #[inline]
    pub fn nature(&self) -> Option<Nature> {
        self.nature
    }

    /// Convention this method uses when calling other methods.
    #[inline]
    pub fn call_entry_point(&self) -> CallEntryPoint {
        self.call_entry_point
    }

    pub fn stub_info(&self) -> Option<&StubInfo> {
        match &self.kind {
            TargetKind::Stub(info) => Some(info),
            _ => None,
        }
    }

    pub fn adapter_info(&self) -> Option<&AdapterInfo> {
        match &self.kind {
            TargetKind::Adapter(info) => Some(info),
            _ => None,
        }
    }

    pub fn stub_type(&self) -> Option<StubType> {
        self.stub_info().map(|info| info.stub_type)
    }

    /// Whether this is a stub of `stub_type`.
    #[inline]
    pub fn is(&self, stub_type: StubType) -> bool {
        self.stub_type() == Some(stub_type)
    }

    #[inline]
    pub fn is_adapter(&self) -> bool {
        matches!(self.kind, TargetKind::Adapter(_))
    }

    #[inline]
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    #[inline]
    pub fn callee_save_layout(&self) -> Option<&CalleeSaveLayout> {
        self.callee_save_layout.as_ref()
    }

    #[inline]
    pub fn register_restore_epilogue_offset(&self) -> Option<usize> {
        self.register_restore_epilogue_offset
    }

    /// Whether the method saves callee-save registers.
    #[inline]
    pub fn is_callee_saved(&self) -> bool {
        self.register_restore_epilogue_offset.is_some()
    }

    #[inline]
    pub fn lifespan(&self) -> Lifespan {
        self.lifespan
    }

    #[inline]
    pub fn word_size(&self) -> usize {
        self.word_size
    }

    // =========================================================================
    // Arrays
    // =========================================================================

    #[inline]
    pub fn code_start(&self) -> usize {
        self.code.start()
    }

    #[inline]
    pub fn code_end(&self) -> usize {
        self.code.end()
    }

    #[inline]
    pub fn code_len(&self) -> usize {
        self.code.len()
    }

    /// Bundle holding the code and literals.
    #[inline]
    pub fn bundle(&self) -> &CodeSpan {
        &self.bundle
    }

    #[inline]
    pub(crate) fn code_span(&self) -> &CodeSpan {
        &self.code
    }

    /// Snapshot of the code bytes.
    pub fn copy_code(&self) -> Vec<u8> {
        self.code.read_bytes(0, self.code.len())
    }

    pub fn scalar_literals_len(&self) -> usize {
        self.scalar_literals.as_ref().map_or(0, CodeSpan::len)
    }

    pub fn scalar_literals(&self) -> Vec<u8> {
        self.scalar_literals
            .as_ref()
            .map(|s| s.read_bytes(0, s.len()))
            .unwrap_or_default()
    }

    #[inline]
    pub fn reference_literals(&self) -> &[ObjectConstant] {
        &self.reference_literals
    }

    #[inline]
    pub fn safepoints(&self) -> &Safepoints {
        &self.safepoints
    }

    #[inline]
    pub fn direct_callees(&self) -> &[Callee] {
        &self.direct_callees
    }

    /// Reference map recorded for safepoint `index`.
    pub fn reference_map(&self, index: usize) -> Option<&ReferenceMap> {
        self.reference_maps.get(index).and_then(Option::as_ref)
    }

    #[inline]
    pub fn exception_handlers(&self) -> &[ExceptionHandler] {
        &self.exception_handlers
    }

    // =========================================================================
    // Addresses
    // =========================================================================

    /// Absolute address of code offset `pos`.
    #[inline]
    pub fn code_at(&self, pos: usize) -> usize {
        self.code_start() + pos
    }

    /// Code offset of `address`, if it lies in `[code_start, code_end]`.
    ///
    /// The end address is included: it is the return address of a call that
    /// ends the code.
    #[inline]
    pub fn pos_for(&self, address: usize) -> Option<usize> {
        (address >= self.code_start() && address <= self.code_end()).then(|| address - self.code_start())
    }

    /// Address a caller using `entry_point` calls.
    pub fn get_entry_point(&self, entry_point: CallEntryPoint) -> usize {
        match self.kind {
            TargetKind::Adapter(_) => self.code_start(),
            _ => self.code_start() + entry_point.offset(),
        }
    }

    /// Index of the safepoint at `ip`.
    pub fn find_safepoint_index(&self, ip: usize) -> Option<usize> {
        self.pos_for(ip).and_then(|pos| self.safepoints.index_of(pos))
    }

    /// Statically known callee of the direct call at `call_site`.
    ///
    /// A site without callee metadata is fatal.
    pub fn call_site_to_callee(&self, call_site: usize) -> &Callee {
        if let Some(pos) = self.pos_for(call_site) {
            for (dc, index) in self.safepoints.direct_calls().enumerate() {
                if self.safepoints.cause_pos_at(index) == pos {
                    return &self.direct_callees[dc];
                }
            }
        }
        crate::fatal!("no direct callee at {call_site:#x} in {}", self.name)
    }

    // =========================================================================
    // Linking and Patching
    // =========================================================================

    /// Address the direct call `dc` should currently reach, if available.
    fn callee_entry(&self, rt: &TargetRuntime, callee: &Callee) -> Option<usize> {
        match callee {
            Callee::Adapter(adapter) => Some(adapter.code_start()),
            Callee::Method(method) => method
                .current_target_method()
                .map(|tm| tm.get_entry_point(self.call_entry_point)),
            Callee::Routine(routine) => rt.routine_address(*routine),
        }
    }

    fn static_trampoline_entry(&self, rt: &TargetRuntime) -> usize {
        match rt.stubs().static_trampoline() {
            Some(stub) => stub.get_entry_point(self.call_entry_point),
            None => crate::fatal!("{}: static trampoline not yet generated", self.name),
        }
    }

    /// Point every direct call at its callee before publication.
    ///
    /// Uncompiled method callees are routed through the static trampoline and
    /// unbound routines are left for [`TargetRuntime::bind_routine`]. Returns
    /// whether every callee was available.
    pub fn link_direct_calls(&self, rt: &TargetRuntime, proof: &Unpublished) -> bool {
        let mut all_linked = true;
        for (dc, index) in self.safepoints.direct_calls().enumerate() {
            let callee = &self.direct_callees[dc];
            let target = match self.callee_entry(rt, callee) {
                Some(target) => target,
                None => {
                    all_linked = false;
                    match callee {
                        Callee::Method(_) => self.static_trampoline_entry(rt),
                        _ => continue,
                    }
                }
            };
            self.fixup_call_site(self.safepoints.cause_pos_at(index), target, proof);
        }
        all_linked
    }

    /// Route direct call `dc` (at safepoint `index`) back through the static
    /// trampoline so it relinks on its next execution.
    pub fn reset_direct_call(&self, rt: &TargetRuntime, index: usize, dc: usize) -> usize {
        debug_assert_eq!(self.safepoints.next_direct_call(index), Some(index));
        debug_assert!(matches!(self.direct_callees.get(dc), Some(Callee::Method(_))));
        let trampoline = self.static_trampoline_entry(rt);
        self.patch_call_site(self.safepoints.cause_pos_at(index), trampoline)
    }

    /// Whether the call at `call_site` can be patched while running.
    pub fn is_patchable_call_site(&self, call_site: usize) -> bool {
        !self.is_adapter() && patch::is_mt_safe_call_address(call_site)
    }

    /// Retarget the call at code offset `call_pos` while other threads may
    /// execute it. Returns the previous target.
    pub fn patch_call_site(&self, call_pos: usize, target: usize) -> usize {
        let site = self.code_at(call_pos);
        if !self.is_patchable_call_site(site) {
            crate::fatal!("{}: call at {site:#x} is not patchable", self.name);
        }
        match patch::patch_call_mt_safe(&self.code, call_pos, target) {
            Ok(old) => old,
            Err(err) => crate::fatal!("{}: {err}", self.name),
        }
    }

    /// Retarget the call at `call_pos` before publication. Returns the
    /// previous target.
    pub fn fixup_call_site(&self, call_pos: usize, target: usize, proof: &Unpublished) -> usize {
        match patch::fixup_call(&self.code, call_pos, target, proof) {
            Ok(old) => old,
            Err(err) => crate::fatal!("{}: {err}", self.name),
        }
    }

    /// Current target of the call at `call_pos`.
    pub fn call_target_at(&self, call_pos: usize) -> Option<usize> {
        patch::read_call_target(&self.code, call_pos).ok()
    }

    /// Send every entry of this method to the matching entry of `target`.
    pub fn redirect_to(&self, target: &TargetMethod, world: &WorldStopped<'_>) {
        for entry in [CallEntryPoint::Baseline, CallEntryPoint::Optimized] {
            let pos = entry.offset();
            if pos + crate::asm::amd64::JMP_REL32_SIZE > self.code_len() {
                crate::fatal!("{}: too short to redirect", self.name);
            }
            if let Err(err) = patch::redirect_entry(&self.code, pos, target.get_entry_point(entry), world) {
                crate::fatal!("{}: {err}", self.name);
            }
        }
        tracing::debug!(from = %self.name, to = %target.name, "redirected entry points");
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Mark the method invalidated. Returns whether this call set the marker.
    pub fn invalidate(&self, marker: InvalidationMarker) -> bool {
        let won = self.invalidated.set(marker).is_ok();
        if won {
            tracing::debug!(name = %self.name, "invalidated target method");
        }
        won
    }

    #[inline]
    pub fn invalidated(&self) -> Option<&InvalidationMarker> {
        self.invalidated.get()
    }

    #[inline]
    pub fn is_invalidated(&self) -> bool {
        self.invalidated.get().is_some()
    }

    /// Overwrite the code with traps after eviction.
    pub fn wipe(&self) {
        if self.wiped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.code.fill(WIPED_CODE_BYTE);
        if let Some(scalars) = &self.scalar_literals {
            scalars.fill(0);
        }
    }

    #[inline]
    pub fn is_wiped(&self) -> bool {
        self.wiped.load(Ordering::Acquire)
    }
}

fn write_word(span: &CodeSpan, word_size: usize, offset: usize, value: usize) {
    if word_size == 8 {
        span.write_u64(offset, value as u64);
    } else {
        span.write_bytes(offset, &(value as u32).to_le_bytes());
    }
}

impl fmt::Debug for TargetMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetMethod")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("code", &format_args!("{:#x}..{:#x}", self.code_start(), self.code_end()))
            .field("safepoints", &self.safepoints.len())
            .finish()
    }
}

impl fmt::Display for TargetMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{:#x}, {:#x})", self.name, self.code_start(), self.code_end())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::Amd64Assembler;
    use crate::kind::Kind;
    use crate::method::{MethodActor, Signature};
    use crate::target::call_target::RuntimeRoutine;
    use crate::target::codegen_result::{CallSite, Constant};
    use crate::test_support::{runtime, unique_method};

    fn static_method(name: &str) -> MethodRef {
        MethodActor::builder("Test", name, Signature::new([], Kind::Int))
            .static_method()
            .build()
    }

    /// 8 nops, `call` (aligned), `ret`.
    fn code_with_call() -> (Vec<u8>, usize) {
        let mut asm = Amd64Assembler::new();
        asm.nops(8);
        asm.align_patchable_call();
        let call = asm.call();
        asm.ret();
        (asm.finish(), call)
    }

    #[test]
    fn test_install_codegen_links_uncompiled_callee_to_trampoline() {
        let rt = runtime();
        let caller = unique_method("caller");
        let callee = static_method("callee");
        let (code, call) = code_with_call();
        let result = CodegenResult::new(code, Nature::Opt).with_site(Site::Call(CallSite {
            pc_offset: call,
            size: 5,
            target: CallTarget::Method(Arc::clone(&callee)),
            direct: true,
            reference_map: None,
        }));
        let tm = TargetMethod::install_codegen(&rt, &caller, result).unwrap();

        let trampoline = rt.stubs().static_trampoline().unwrap();
        assert_eq!(
            tm.call_target_at(call),
            Some(trampoline.get_entry_point(CallEntryPoint::Optimized))
        );
        assert_eq!(tm.call_site_to_callee(tm.code_at(call)), &Callee::Method(callee));
        assert_eq!(tm.safepoints().pos_at(0), call + 5);
        assert!(Arc::ptr_eq(&rt.code_cache().find_by_ip(tm.code_at(call)).unwrap(), &tm));
    }

    #[test]
    fn test_reset_direct_call_restores_trampoline() {
        let rt = runtime();
        let caller = unique_method("caller");
        let callee = static_method("callee");
        let (code, call) = code_with_call();
        let result = CodegenResult::new(code, Nature::Baseline).with_site(Site::Call(CallSite {
            pc_offset: call,
            size: 5,
            target: CallTarget::Method(callee),
            direct: true,
            reference_map: None,
        }));
        let tm = TargetMethod::install_codegen(&rt, &caller, result).unwrap();
        let trampoline = tm.call_target_at(call).unwrap();

        let elsewhere = tm.code_start();
        assert_eq!(tm.patch_call_site(call, elsewhere), trampoline);
        assert_eq!(tm.call_target_at(call), Some(elsewhere));
        assert_eq!(tm.reset_direct_call(&rt, 0, 0), elsewhere);
        assert_eq!(tm.call_target_at(call), Some(trampoline));
    }

    #[test]
    fn test_literals_are_co_located() {
        let rt = runtime();
        let method = unique_method("lits");
        // mov rax, [rip+0] ; ret
        let code = vec![0x48, 0x8B, 0x05, 0, 0, 0, 0, 0xC3];
        let result = CodegenResult::new(code, Nature::Opt)
            .with_data_patch(0, Constant::Long(0x1122_3344_5566_7788));
        let tm = TargetMethod::install_codegen(&rt, &method, result).unwrap();

        let bytes = tm.copy_code();
        let disp = i32::from_le_bytes(bytes[3..7].try_into().unwrap()) as isize;
        let literal = (tm.code_at(7) as isize + disp) as usize;
        let bundle = tm.bundle();
        assert_eq!(bundle.slice(literal - bundle.start(), 8).read_u64(0), 0x1122_3344_5566_7788);
        assert_eq!(tm.scalar_literals().len(), 8);
        assert_eq!(BundleLayout::from_target_method(&tm).bundle_size(), bundle.len());
    }

    #[test]
    fn test_safepoint_attributes_from_sites() {
        let rt = runtime();
        let method = unique_method("sites");
        let mut code = vec![0x90; 40];
        code[20] = 0xC3;
        let result = CodegenResult::new(code, Nature::Opt)
            .with_site(Site::Safepoint {
                pc_offset: 30,
                reference_map: Some(ReferenceMap::new().with_frame_slot(2)),
            })
            .with_site(Site::Call(CallSite {
                pc_offset: 2,
                size: 3,
                target: CallTarget::Native("memcpy".into()),
                direct: false,
                reference_map: None,
            }))
            .with_site(Site::Call(CallSite {
                pc_offset: 10,
                size: 2,
                target: CallTarget::Indirect,
                direct: false,
                reference_map: None,
            }));
        let tm = TargetMethod::install_codegen(&rt, &method, result).unwrap();
        let sp = tm.safepoints();
        assert_eq!(sp.len(), 3);
        assert!(sp.is_set_at(safepoints::NATIVE_CALL, 0));
        assert_eq!(sp.attrs_at(1), safepoints::INDIRECT_CALL);
        assert_eq!(sp.attrs_at(2), safepoints::SAFEPOINT);
        assert_eq!(tm.find_safepoint_index(tm.code_at(30)), Some(2));
        assert!(tm.reference_map(2).unwrap().is_frame_slot_set(2));
    }

    #[test]
    #[should_panic(expected = "direct call to native function")]
    fn test_direct_native_call_is_fatal() {
        let rt = runtime();
        let method = unique_method("native");
        let result = CodegenResult::new(vec![0xE8, 0, 0, 0, 0], Nature::Opt).with_site(Site::Call(CallSite {
            pc_offset: 0,
            size: 5,
            target: CallTarget::Native("puts".into()),
            direct: true,
            reference_map: None,
        }));
        let _ = TargetMethod::install_codegen(&rt, &method, result);
    }

    #[test]
    fn test_pos_for_includes_end() {
        let rt = runtime();
        let tm = TargetMethod::install_raw(
            &rt,
            RawTarget::new("raw", TargetKind::Compiled, vec![0x90; 10]),
        )
        .unwrap();
        assert_eq!(tm.pos_for(tm.code_start()), Some(0));
        assert_eq!(tm.pos_for(tm.code_end()), Some(10));
        assert_eq!(tm.pos_for(tm.code_end() + 1), None);
        assert_eq!(tm.pos_for(tm.code_start() - 1), None);
    }

    #[test]
    fn test_invalidate_once() {
        let rt = runtime();
        let tm = TargetMethod::install_raw(
            &rt,
            RawTarget::new("raw", TargetKind::Compiled, vec![0xC3]),
        )
        .unwrap();
        assert!(tm.invalidate(InvalidationMarker::new("class hierarchy changed")));
        assert!(!tm.invalidate(InvalidationMarker::new("again")));
        assert_eq!(tm.invalidated().unwrap().reason, "class hierarchy changed");
    }

    #[test]
    fn test_wipe_fills_code_with_traps() {
        let rt = runtime();
        let tm = TargetMethod::install_raw(
            &rt,
            RawTarget::new("raw", TargetKind::Compiled, vec![0x90, 0x90, 0xC3]),
        )
        .unwrap();
        tm.wipe();
        assert!(tm.is_wiped());
        assert_eq!(tm.copy_code(), vec![WIPED_CODE_BYTE; 3]);
    }

    #[test]
    #[should_panic(expected = "no direct callee")]
    fn test_call_site_to_callee_without_metadata_is_fatal() {
        let rt = runtime();
        let tm = TargetMethod::install_raw(
            &rt,
            RawTarget::new("raw", TargetKind::Compiled, vec![0x90; 8]),
        )
        .unwrap();
        tm.call_site_to_callee(tm.code_at(3));
    }

    #[test]
    fn test_install_codegen_rejects_unencodable_code() {
        let rt = runtime();
        let result = CodegenResult::new(vec![0x90; safepoints::MAX_POS + 1], Nature::Opt);
        let err = TargetMethod::install_codegen(&rt, &unique_method("huge"), result).unwrap_err();
        assert!(matches!(err, TargetError::CodeTooLarge { size, .. } if size == safepoints::MAX_POS + 1));
    }

    #[test]
    fn test_bound_routine_is_linked_at_install() {
        let rt = runtime();
        let target = rt.stubs().static_trampoline().unwrap().code_start();
        rt.bind_routine(RuntimeRoutine::Named("helper"), target).unwrap();
        let (code, call) = code_with_call();
        let raw = RawTarget::new("calls-helper", TargetKind::Compiled, code).with_safepoints(
            Safepoints::new(vec![safepoints::make(call + 5, call, safepoints::DIRECT_CALL)]),
            vec![Callee::Routine(RuntimeRoutine::Named("helper"))],
        );
        let tm = TargetMethod::install_raw(&rt, raw).unwrap();
        assert_eq!(tm.call_target_at(call), Some(target));
    }

    #[test]
    fn test_install_racing_bind_links_every_call() {
        let rt = runtime();
        let routine = RuntimeRoutine::Named("racy");
        let target = rt.stubs().static_trampoline().unwrap().code_start();
        let (code, call) = code_with_call();
        let installed = std::thread::scope(|scope| {
            let installer = scope.spawn(|| {
                (0..64)
                    .map(|i| {
                        let raw = RawTarget::new(format!("racy{i}"), TargetKind::Compiled, code.clone())
                            .with_safepoints(
                                Safepoints::new(vec![safepoints::make(call + 5, call, safepoints::DIRECT_CALL)]),
                                vec![Callee::Routine(routine)],
                            );
                        TargetMethod::install_raw(&rt, raw).unwrap()
                    })
                    .collect::<Vec<_>>()
            });
            std::thread::yield_now();
            rt.bind_routine(routine, target).unwrap();
            installer.join().unwrap()
        });
        for tm in &installed {
            assert_eq!(tm.call_target_at(call), Some(target), "{}", tm.name());
        }
    }
}
