//! Calling-convention adapters between baseline and optimized code.
//!
//! Baseline code passes every argument on the stack (argument 0 deepest)
//! and the callee pops them. Optimized code passes arguments in registers
//! with stack overflow and the caller pops. A method whose callers may use
//! either convention starts with a prologue that calls an adapter for the
//! foreign convention:
//!
//! ```text
//! Baseline2Opt (optimized callee)      Opt2Baseline (baseline callee)
//!  0: call <adapter>                    0: jmp 13
//!  5: nop; nop; nop                     2: nop x6
//!  8: <body>                            8: call <adapter>
//!                                      13: <body>
//! ```
//!
//! An optimized caller enters at offset 8 and a baseline caller at
//! offset 0. The adapter reads its own return address to find the body.

use std::sync::Arc;

use dashmap::DashMap;
use rustc_hash::FxBuildHasher;
use smallvec::SmallVec;

use crate::asm::amd64::{CALL_REL32_SIZE, Mem};
use crate::asm::Amd64Assembler;
use crate::compile::Nature;
use crate::error::TargetError;
use crate::kind::Kind;
use crate::method::MethodActor;
use crate::platform::{Isa, align_up};
use crate::registers::amd64::{RAX, RBP, RSP, SCRATCH};
use crate::registers::{CallType, Location};
use crate::runtime::TargetRuntime;

use super::call_target::CallEntryPoint;
use super::codegen_result::ReferenceMap;
use super::method::{RawTarget, TargetKind, TargetMethod};
use super::safepoints::{self, Safepoints};

// =============================================================================
// Adapter Kinds
// =============================================================================

/// Direction of an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdapterType {
    /// Baseline caller, optimized callee.
    Baseline2Opt,
    /// Optimized caller, baseline callee.
    Opt2Baseline,
}

impl AdapterType {
    /// Adapter a method of `nature` needs in its prologue, if any.
    ///
    /// A static method without parameters is called the same way under both
    /// conventions.
    pub fn for_callee(method: &MethodActor, nature: Nature) -> Option<AdapterType> {
        if method.is_static() && method.signature().params().is_empty() {
            return None;
        }
        Some(match nature {
            Nature::Baseline => AdapterType::Opt2Baseline,
            Nature::Opt => AdapterType::Baseline2Opt,
        })
    }

    /// Offset of the adapter call inside the callee prologue.
    #[inline]
    pub const fn call_offset_in_prologue(self) -> usize {
        match self {
            AdapterType::Baseline2Opt => CallEntryPoint::Baseline.offset(),
            AdapterType::Opt2Baseline => CallEntryPoint::Optimized.offset(),
        }
    }

    /// Size of the prologue that calls this adapter.
    #[inline]
    pub const fn prologue_size(self) -> usize {
        match self {
            AdapterType::Baseline2Opt => CallEntryPoint::Optimized.offset(),
            AdapterType::Opt2Baseline => CallEntryPoint::Optimized.offset() + CALL_REL32_SIZE,
        }
    }
}

/// Metadata carried by an adapter target method.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub adapter_type: AdapterType,
    /// Parameter kinds, receiver first.
    pub kinds: SmallVec<[Kind; 8]>,
    /// References in the adapter's own frame while the callee runs.
    pub frame_reference_map: ReferenceMap,
    /// Code range `[start, end)` in which the adapter frame is set up.
    pub frame_start: usize,
    pub frame_end: usize,
}

impl AdapterInfo {
    #[inline]
    pub fn call_offset_in_prologue(&self) -> usize {
        self.adapter_type.call_offset_in_prologue()
    }

    #[inline]
    pub fn call_size_in_prologue(&self) -> usize {
        CALL_REL32_SIZE
    }

    /// Whether the frame exists at code offset `pos`.
    #[inline]
    pub fn has_frame_at(&self, pos: usize) -> bool {
        pos >= self.frame_start && pos < self.frame_end
    }
}

// =============================================================================
// Generator
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct AdapterKey {
    adapter_type: AdapterType,
    kinds: SmallVec<[Kind; 8]>,
}

/// Generates adapters and caches them by signature.
#[derive(Debug, Default)]
pub struct AdapterGenerator {
    adapters: DashMap<AdapterKey, Arc<TargetMethod>, FxBuildHasher>,
}

impl AdapterGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct adapters generated so far.
    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Adapter for a `nature` compilation of `method`, generating it on
    /// first use.
    pub fn adapter(
        &self,
        rt: &TargetRuntime,
        method: &MethodActor,
        nature: Nature,
    ) -> Result<Option<Arc<TargetMethod>>, TargetError> {
        let Some(adapter_type) = AdapterType::for_callee(method, nature) else {
            return Ok(None);
        };
        let key = AdapterKey {
            adapter_type,
            kinds: method.argument_kinds(),
        };
        if let Some(adapter) = self.adapters.get(&key) {
            return Ok(Some(Arc::clone(adapter.value())));
        }

        let adapter = self.generate(rt, &key)?;
        // A racing generator may have won; its adapter is the canonical one.
        let canonical = self.adapters.entry(key).or_insert(adapter);
        Ok(Some(Arc::clone(canonical.value())))
    }

    /// Emit the adapter prologue for `method` at the start of `asm`.
    ///
    /// Returns the adapter the prologue calls; the caller records it with
    /// [`super::CodegenResult::with_adapter`].
    pub fn emit_prologue(
        &self,
        rt: &TargetRuntime,
        method: &MethodActor,
        nature: Nature,
        asm: &mut Amd64Assembler,
    ) -> Result<Option<Arc<TargetMethod>>, TargetError> {
        debug_assert_eq!(asm.position(), 0, "prologue must start the method");
        let adapter = self.adapter(rt, method, nature)?;
        let Some(info) = adapter.as_ref().and_then(|a| a.adapter_info()) else {
            asm.nops(CallEntryPoint::Optimized.offset());
            return Ok(None);
        };
        match info.adapter_type {
            AdapterType::Baseline2Opt => {
                asm.call();
                asm.nops(CallEntryPoint::Optimized.offset() - CALL_REL32_SIZE);
            }
            AdapterType::Opt2Baseline => {
                let body = AdapterType::Opt2Baseline.prologue_size();
                asm.jmp_short((body - 2) as i8);
                asm.nops(CallEntryPoint::Optimized.offset() - 2);
                asm.call();
            }
        }
        debug_assert_eq!(asm.position(), info.adapter_type.prologue_size());
        Ok(adapter)
    }

    fn generate(&self, rt: &TargetRuntime, key: &AdapterKey) -> Result<Arc<TargetMethod>, TargetError> {
        if rt.platform().isa != Isa::Amd64 {
            crate::fatal!("adapter generation unimplemented for {}", rt.platform());
        }
        let generated = match key.adapter_type {
            AdapterType::Baseline2Opt => baseline2opt(rt, &key.kinds),
            AdapterType::Opt2Baseline => opt2baseline(rt, &key.kinds),
        };
        let name = format!(
            "{:?}({})",
            key.adapter_type,
            key.kinds.iter().map(|k| k.type_char()).collect::<String>()
        );
        let safepoints = Safepoints::new(vec![safepoints::make(
            generated.call_pos + generated.call_size,
            generated.call_pos,
            safepoints::INDIRECT_CALL,
        )]);
        let raw = RawTarget::new(name, TargetKind::Adapter(generated.info), generated.code)
            .with_safepoints(safepoints, Vec::new())
            .with_frame_size(generated.frame_size);
        let adapter = TargetMethod::install_raw(rt, raw)?;
        tracing::debug!(name = adapter.name(), start = adapter.code_start(), "generated adapter");
        Ok(adapter)
    }
}

/// An assembled adapter before installation.
struct GeneratedAdapter {
    code: Vec<u8>,
    info: AdapterInfo,
    call_pos: usize,
    call_size: usize,
    /// Bytes between the stack pointer and the caller's return address
    /// while the frame exists.
    frame_size: usize,
}

#[inline]
fn baseline_args_size(kinds: &[Kind]) -> usize {
    kinds.len() * 8
}

/// Offset from `rbp` (after `enter`) of baseline argument `index`.
#[inline]
fn baseline_arg_from_rbp(kinds: &[Kind], index: usize) -> i32 {
    // saved rbp, prologue return address, caller return address
    (24 + 8 * (kinds.len() - 1 - index)) as i32
}

fn baseline2opt(rt: &TargetRuntime, kinds: &[Kind]) -> GeneratedAdapter {
    let standard = &rt.register_configs().standard;
    let cc = standard.calling_convention(CallType::Managed, kinds, false);
    let frame = align_up(cc.stack_size, 16);
    let frame_u16 = match u16::try_from(frame) {
        Ok(frame) => frame,
        Err(_) => crate::fatal!("adapter frame of {frame} bytes too large"),
    };

    let mut asm = Amd64Assembler::new();
    asm.movq_load(RAX, Mem::sp(0));
    asm.enter(frame_u16, 0);
    let frame_start = asm.position();

    let mut reference_map = ReferenceMap::new();
    for (i, (&kind, location)) in kinds.iter().zip(&cc.locations).enumerate() {
        let src = Mem::new(RBP, baseline_arg_from_rbp(kinds, i));
        match *location {
            Location::Register(reg) if reg.is_fpu() => asm.movsd_load(reg, src),
            Location::Register(reg) => asm.movq_load(reg, src),
            Location::Stack { offset } => {
                asm.movq_load(SCRATCH, src);
                asm.movq_store(Mem::sp(offset as i32), SCRATCH);
                if kind.is_reference() {
                    reference_map.set_frame_slot(offset / 8);
                }
            }
        }
    }

    let call_pos = asm.call_reg(RAX);
    let call_size = asm.position() - call_pos;
    let frame_end = asm.position() + 1;
    asm.leave();
    asm.addq_imm(RSP, 8);
    asm.ret_pop(baseline_args_size(kinds) as u16);

    let info = AdapterInfo {
        adapter_type: AdapterType::Baseline2Opt,
        kinds: kinds.iter().copied().collect(),
        frame_reference_map: reference_map,
        frame_start,
        frame_end,
    };
    GeneratedAdapter {
        code: asm.finish(),
        info,
        call_pos,
        call_size,
        // enter frame, saved rbp, prologue return address
        frame_size: frame + 16,
    }
}

fn opt2baseline(rt: &TargetRuntime, kinds: &[Kind]) -> GeneratedAdapter {
    let standard = &rt.register_configs().standard;
    let cc = standard.calling_convention(CallType::Managed, kinds, false);
    let args_size = baseline_args_size(kinds);

    let mut asm = Amd64Assembler::new();
    asm.movq_load(RAX, Mem::sp(0));
    asm.subq_imm(RSP, args_size as i32);
    let frame_start = asm.position();

    let mut reference_map = ReferenceMap::new();
    for (i, (&kind, location)) in kinds.iter().zip(&cc.locations).enumerate() {
        let slot = kinds.len() - 1 - i;
        let dst = Mem::sp((slot * 8) as i32);
        match *location {
            Location::Register(reg) if reg.is_fpu() => asm.movsd_store(dst, reg),
            Location::Register(reg) => asm.movq_store(dst, reg),
            Location::Stack { offset } => {
                // args, prologue return address, caller return address
                let src = Mem::sp((args_size + 16 + offset) as i32);
                asm.movq_load(SCRATCH, src);
                asm.movq_store(dst, SCRATCH);
            }
        }
        if kind.is_reference() {
            reference_map.set_frame_slot(slot);
        }
    }

    let call_pos = asm.call_reg(RAX);
    let call_size = asm.position() - call_pos;
    let frame_end = asm.position() + 1;
    // The baseline callee popped its arguments.
    asm.addq_imm(RSP, 8);
    asm.ret();

    let info = AdapterInfo {
        adapter_type: AdapterType::Opt2Baseline,
        kinds: kinds.iter().copied().collect(),
        frame_reference_map: reference_map,
        frame_start,
        frame_end,
    };
    GeneratedAdapter {
        code: asm.finish(),
        info,
        call_pos,
        call_size,
        // baseline arguments, prologue return address
        frame_size: args_size + 8,
    }
}

// =============================================================================
// Tests
// =============================================================================
