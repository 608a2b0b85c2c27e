//! AMD64 stub assembly.
//!
//! Every stub starts with [`PROLOGUE_SIZE`] bytes of nops so that both the
//! baseline and the optimized entry point land on stub code. Stubs that call a
//! runtime routine align the call for mt-safe patching and record it as their
//! only direct call.

use smallvec::{SmallVec, smallvec};

use crate::asm::amd64::{Amd64Assembler, CALL_REL32_SIZE, Mem};
use crate::kind::Kind;
use crate::registers::amd64::{LATCH, RAX, RBP, RSI, RSP, XMM0};
use crate::registers::{CallType, Location, Register, RegisterConfig};
use crate::runtime::TargetRuntime;
use crate::target::call_target::{CallEntryPoint, Callee, RuntimeRoutine};
use crate::target::method::{RawTarget, TargetKind};
use crate::target::safepoints::{self, Safepoints};
use crate::target::stub::{StubInfo, StubType};

use super::{
    TRAP_FAULT_ADDRESS_OFFSET, TRAP_INSTRUCTION_POINTER_OFFSET, TRAP_LATCH_REGISTER_OFFSET,
    TRAP_NUMBER_OFFSET,
};

/// Nop padding at the start of every stub.
pub const PROLOGUE_SIZE: usize = CallEntryPoint::Optimized.offset();

/// Offset of the dispatch index immediate in a dynamic trampoline:
/// the prologue, `sub rsp, imm32` (7 bytes), then the `mov r11d` opcode.
pub const DISPATCH_INDEX_IMM_POS: usize = PROLOGUE_SIZE + 7 + 2;

/// Placeholder in a deopt stub's routine immediate until the routine is bound.
pub const UNBOUND_ROUTINE: u64 = u64::MAX;

fn prologue(asm: &mut Amd64Assembler) {
    asm.nops(PROLOGUE_SIZE);
}

/// Emit the stub's single routine call, returning its position.
fn routine_call(asm: &mut Amd64Assembler) -> usize {
    asm.align_patchable_call();
    asm.call()
}

fn stub_target(
    name: String,
    info: StubInfo,
    code: Vec<u8>,
    frame_size: usize,
) -> RawTarget {
    let (safepoints, callees) = match (info.call_pos, info.routine) {
        (Some(call_pos), Some(routine)) => (
            Safepoints::new(vec![safepoints::make(
                call_pos + CALL_REL32_SIZE,
                call_pos,
                safepoints::DIRECT_CALL,
            )]),
            vec![Callee::Routine(routine)],
        ),
        _ => (Safepoints::default(), Vec::new()),
    };
    RawTarget::new(name, TargetKind::Stub(info), code)
        .with_safepoints(safepoints, callees)
        .with_frame_size(frame_size)
}

/// Location of argument `index` when calling a routine taking `kinds`.
fn argument_register(config: &RegisterConfig, kinds: &[Kind], index: usize) -> Register {
    match config.calling_convention(CallType::Runtime, kinds, false).locations[index] {
        Location::Register(reg) => reg,
        Location::Stack { .. } => crate::fatal!("routine argument {index} of {kinds:?} is not in a register"),
    }
}

/// `words` word arguments followed by `value` unless it is void.
fn routine_args(words: usize, value: Kind) -> SmallVec<[Kind; 6]> {
    let mut args: SmallVec<[Kind; 6]> = smallvec![Kind::Word; words];
    if !value.is_void() {
        args.push(value);
    }
    args
}

fn move_value(asm: &mut Amd64Assembler, kind: Kind, dst: Register, src: Register) {
    if dst == src {
        return;
    }
    if kind.is_float() {
        asm.movsd(dst, src);
    } else {
        asm.movq(dst, src);
    }
}

// =============================================================================
// Trampolines
// =============================================================================

/// `vtrampoline<i>`, `itrampoline<i>` and the invalid-index trampoline.
///
/// Resolves the call, stores the resolved entry point just below the
/// caller's return address and `ret`s into it, so the resolved method runs
/// as if called directly.
pub fn dynamic_trampoline(rt: &TargetRuntime, stub_type: StubType, index: usize) -> RawTarget {
    let config = &rt.register_configs().trampoline;
    let Some(csl) = config.csl.clone() else {
        crate::fatal!("trampoline register config has no callee-save area")
    };
    let word = rt.word_size();
    let frame = rt.platform().align_frame_size(csl.size + word);
    let routine = match stub_type {
        StubType::InterfaceTrampoline => RuntimeRoutine::ResolveInterfaceCall,
        _ => RuntimeRoutine::ResolveVirtualCall,
    };
    let index_imm = u32::try_from(index).unwrap_or_else(|_| crate::fatal!("dispatch index {index} too large"));

    let mut asm = Amd64Assembler::new();
    prologue(&mut asm);
    asm.subq_imm(RSP, frame as i32);
    asm.movl_imm(config.scratch, index_imm);
    debug_assert_eq!(asm.position(), DISPATCH_INDEX_IMM_POS + 4);
    asm.save_registers(&csl, 0);

    let args = [Kind::Object, Kind::Int, Kind::Word];
    asm.movl_imm(argument_register(config, &args, 1), index_imm);
    asm.movq_load(argument_register(config, &args, 2), Mem::sp(frame as i32));
    let call_pos = routine_call(&mut asm);

    asm.movq_store(Mem::sp((frame - word) as i32), RAX);
    let restore = asm.position();
    asm.restore_registers(&csl, 0);
    asm.addq_imm(RSP, (frame - word) as i32);
    asm.ret();

    let name = match stub_type {
        StubType::VirtualTrampoline => format!("vtrampoline{index}"),
        StubType::InterfaceTrampoline => format!("itrampoline{index}"),
        _ => "invalidIndexTrampoline".to_string(),
    };
    let info = StubInfo::new(stub_type).with_index(index).with_call(call_pos, routine);
    stub_target(name, info, asm.finish(), frame).with_callee_save(csl, Some(restore))
}

/// `strampoline`: patches the calling site to the callee's current code and
/// re-executes the call.
pub fn static_trampoline(rt: &TargetRuntime) -> RawTarget {
    let config = &rt.register_configs().trampoline;
    let Some(csl) = config.csl.clone() else {
        crate::fatal!("trampoline register config has no callee-save area")
    };
    let frame = rt.platform().align_frame_size(csl.size);
    let call_site = config.scratch;

    let mut asm = Amd64Assembler::new();
    prologue(&mut asm);
    asm.movq_load(call_site, Mem::sp(0));
    asm.subq_imm(call_site, CALL_REL32_SIZE as i32);
    asm.subq_imm(RSP, frame as i32);
    asm.save_registers(&csl, 0);
    asm.movq(argument_register(config, &[Kind::Word], 0), call_site);
    let call_pos = routine_call(&mut asm);

    let restore = asm.position();
    asm.restore_registers(&csl, 0);
    asm.addq_imm(RSP, frame as i32);
    asm.movq_load(call_site, Mem::sp(0));
    asm.subq_imm(call_site, CALL_REL32_SIZE as i32);
    asm.movq_store(Mem::sp(0), call_site);
    asm.ret();

    let info = StubInfo::new(StubType::StaticTrampoline)
        .with_call(call_pos, RuntimeRoutine::PatchStaticTrampolineCallSite);
    stub_target("strampoline".into(), info, asm.finish(), frame).with_callee_save(csl, Some(restore))
}

// =============================================================================
// Traps
// =============================================================================

/// Entered from the native trap handler with the trap state in the thread
/// locals. Saves everything, calls `handleTrap` and resumes at the trapped
/// instruction.
pub fn trap_stub(rt: &TargetRuntime) -> RawTarget {
    let config = &rt.register_configs().trap_stub;
    let Some(csl) = config.csl.clone() else {
        crate::fatal!("trap stub register config has no callee-save area")
    };
    let word = rt.word_size();
    // The trap number is kept in the slot above the saved registers, below
    // the saved flags.
    let trap_number_slot = csl.size as i32;
    let frame = rt.platform().align_frame_size(csl.size + 2 * word);
    let scratch = config.scratch;
    let args = [Kind::Int, Kind::Word, Kind::Word];

    let mut asm = Amd64Assembler::new();
    // Flags first, twice: the first copy becomes the return address.
    asm.pushfq();
    asm.pushfq();
    asm.subq_imm(RSP, (frame - word) as i32);
    asm.save_registers(&csl, 0);

    asm.movq_load(scratch, Mem::new(LATCH, TRAP_LATCH_REGISTER_OFFSET));
    if let Some(offset) = csl.offset_of(LATCH) {
        asm.movq_store(Mem::sp(offset as i32), scratch);
    }
    asm.movq_load(scratch, Mem::new(LATCH, TRAP_INSTRUCTION_POINTER_OFFSET));
    asm.movq_store(Mem::sp(frame as i32), scratch);

    let trap_number = argument_register(config, &args, 0);
    asm.movq_load(trap_number, Mem::new(LATCH, TRAP_NUMBER_OFFSET));
    asm.movq_store(Mem::sp(trap_number_slot), trap_number);
    asm.leaq(argument_register(config, &args, 1), Mem::sp(0));
    asm.movq_load(argument_register(config, &args, 2), Mem::new(LATCH, TRAP_FAULT_ADDRESS_OFFSET));
    let call_pos = routine_call(&mut asm);

    let restore = asm.position();
    asm.restore_registers(&csl, 0);
    asm.addq_imm(RSP, (frame - word) as i32);
    asm.popfq();
    asm.ret();

    let info = StubInfo::new(StubType::TrapStub).with_call(call_pos, RuntimeRoutine::HandleTrap);
    stub_target("trapStub".into(), info, asm.finish(), frame).with_callee_save(csl, Some(restore))
}

/// Transition from an uncommon-trap site into `uncommonTrap(csa, ip, sp, fp)`.
pub fn uncommon_trap_stub(rt: &TargetRuntime) -> RawTarget {
    let config = &rt.register_configs().uncommon_trap_stub;
    let Some(csl) = config.csl.clone() else {
        crate::fatal!("uncommon trap register config has no callee-save area")
    };
    let word = rt.word_size();
    let frame = rt.platform().align_frame_size(csl.size);
    let args = [Kind::Word; 4];

    let mut asm = Amd64Assembler::new();
    prologue(&mut asm);
    asm.subq_imm(RSP, frame as i32);
    asm.save_registers(&csl, 0);
    asm.leaq(argument_register(config, &args, 0), Mem::sp(0));
    asm.movq_load(argument_register(config, &args, 1), Mem::sp(frame as i32));
    asm.leaq(argument_register(config, &args, 2), Mem::sp((frame + word) as i32));
    asm.movq(argument_register(config, &args, 3), RBP);
    let call_pos = routine_call(&mut asm);
    asm.hlt();

    let info = StubInfo::new(StubType::UncommonTrapStub).with_call(call_pos, RuntimeRoutine::UncommonTrap);
    stub_target("uncommonTrapStub".into(), info, asm.finish(), frame).with_callee_save(csl, None)
}

// =============================================================================
// Deoptimization
// =============================================================================

/// Returned into by a method whose frame is about to be deoptimized.
///
/// Passes `(ip, sp, fp, csa = 0, value)` and enters the routine by pushing
/// the original return address plus the routine address and `ret`ing, so the
/// routine sees the deoptimized frame as its direct caller. The routine
/// address lives in an 8-byte aligned immediate patched at bind time.
pub fn deopt_stub(rt: &TargetRuntime, kind: Kind) -> RawTarget {
    let config = &rt.register_configs().standard;
    let word = rt.word_size() as i32;
    let args = routine_args(4, kind.stack_kind());
    let routine = RuntimeRoutine::Deoptimize(kind);

    let mut asm = Amd64Assembler::new();
    prologue(&mut asm);
    if !kind.is_void() {
        let value = argument_register(config, &args, 4);
        let Some(ret) = config.return_register(kind) else {
            crate::fatal!("no return register for {kind}")
        };
        move_value(&mut asm, kind, value, ret);
    }
    let ip = argument_register(config, &args, 0);
    asm.movq_load(ip, Mem::sp(0));
    asm.movq(argument_register(config, &args, 1), RSP);
    asm.movq(argument_register(config, &args, 2), RBP);
    let csa = argument_register(config, &args, 3);
    asm.xorq(csa, csa);
    asm.subq_imm(RSP, 2 * word);
    asm.movq_store(Mem::sp(word), ip);
    // REX.W B8+r precedes the immediate.
    while (asm.position() + 2) % 8 != 0 {
        asm.nop();
    }
    let patch_pos = asm.movq_imm64(config.scratch, UNBOUND_ROUTINE);
    asm.movq_store(Mem::sp(0), config.scratch);
    asm.ret();

    let info = StubInfo::new(StubType::DeoptStub)
        .with_kind(kind)
        .with_routine_patch(patch_pos, routine);
    stub_target(format!("{routine}Stub"), info, asm.finish(), 0)
}

/// Deoptimization entered with every register live: from a compiler stub
/// (`kind` is the stub's return kind) or from a safepoint poll.
pub fn deopt_stub_with_csa(rt: &TargetRuntime, kind: Option<Kind>) -> RawTarget {
    let config = &rt.register_configs().compiler_stub;
    let Some(csl) = config.csl.clone() else {
        crate::fatal!("compiler stub register config has no callee-save area")
    };
    let word = rt.word_size();
    let frame = rt.platform().align_frame_size(csl.size);
    let (stub_type, routine) = match kind {
        Some(kind) => (StubType::DeoptStubFromCompilerStub, RuntimeRoutine::DeoptimizeFromCompilerStub(kind)),
        None => (StubType::DeoptStubFromSafepoint, RuntimeRoutine::DeoptimizeAtSafepoint),
    };
    let value_kind = kind.map_or(Kind::Void, Kind::stack_kind);
    let args = routine_args(4, value_kind);

    let mut asm = Amd64Assembler::new();
    prologue(&mut asm);
    asm.subq_imm(RSP, frame as i32);
    asm.save_registers(&csl, 0);
    if !value_kind.is_void() {
        // Compiler stubs return their value in the caller's outgoing slot.
        asm.load(argument_register(config, &args, 4), Mem::sp((frame + word) as i32));
    }
    asm.movq_load(argument_register(config, &args, 0), Mem::sp(frame as i32));
    asm.leaq(argument_register(config, &args, 1), Mem::sp((frame + word) as i32));
    asm.movq(argument_register(config, &args, 2), RBP);
    asm.leaq(argument_register(config, &args, 3), Mem::sp(0));
    let call_pos = routine_call(&mut asm);
    asm.int3();

    let mut info = StubInfo::new(stub_type).with_call(call_pos, routine);
    if let Some(kind) = kind {
        info = info.with_kind(kind);
    }
    stub_target(format!("{routine}Stub"), info, asm.finish(), frame).with_callee_save(csl, None)
}

/// `unwind(ip, sp, fp[, value])`: resume at `ip` in the frame `(sp, fp)`.
pub fn unwind_stub(rt: &TargetRuntime, kind: Kind) -> RawTarget {
    let config = &rt.register_configs().standard;
    let word = rt.word_size() as i32;
    let kind = kind.stack_kind();
    let args = routine_args(3, kind);
    let pc = argument_register(config, &args, 0);
    let sp = argument_register(config, &args, 1);
    let fp = argument_register(config, &args, 2);

    let mut asm = Amd64Assembler::new();
    prologue(&mut asm);
    if !kind.is_void() {
        let ret = if kind.is_float() { XMM0 } else { RAX };
        move_value(&mut asm, kind, ret, argument_register(config, &args, 3));
    }
    asm.subq_imm(sp, word);
    asm.movq_store(Mem::new(sp, 0), pc);
    asm.movq(RBP, fp);
    asm.movq(RSP, sp);
    asm.ret();

    let name = if kind.is_void() {
        "unwindStub".to_string()
    } else {
        format!("unwind{kind:?}Stub")
    };
    stub_target(name, StubInfo::new(StubType::UnwindStub).with_kind(kind), asm.finish(), 0)
}

/// `unroll(info, size)`: grow the stack by `size` and call `unroll`.
pub fn unroll_stub(_rt: &TargetRuntime) -> RawTarget {
    let mut asm = Amd64Assembler::new();
    prologue(&mut asm);
    asm.subq(RSP, RSI);
    let call_pos = routine_call(&mut asm);
    asm.hlt();

    let info = StubInfo::new(StubType::UnrollStub).with_call(call_pos, RuntimeRoutine::Unroll);
    stub_target("unrollStub".into(), info, asm.finish(), 0)
}
