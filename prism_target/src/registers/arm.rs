//! ARMv7 registers and register configurations.
//!
//! ARMv7 is the one platform whose allocatable set is not the caller-save
//! set: r4-r9 are handed to the allocator although the native ABI makes
//! them callee-saved.

use super::{CalleeSaveLayout, Register, RegisterConfig, RegisterConfigs, RegisterSet, Role};
use crate::platform::Platform;

macro_rules! cpu_registers {
    ($($name:ident = $n:literal),* $(,)?) => {
        $(pub const $name: Register = Register::cpu($n, stringify!($name), $n);)*
    };
}

macro_rules! fpu_registers {
    ($($name:ident = $n:literal),* $(,)?) => {
        $(pub const $name: Register = Register::fpu($n + 16, stringify!($name), $n);)*
    };
}

cpu_registers! {
    R0 = 0, R1 = 1, R2 = 2, R3 = 3, R4 = 4, R5 = 5, R6 = 6, R7 = 7,
    R8 = 8, R9 = 9, R10 = 10, R11 = 11, R12 = 12, SP = 13, LR = 14, PC = 15,
}

fpu_registers! {
    S0 = 0, S1 = 1, S2 = 2, S3 = 3, S4 = 4, S5 = 5, S6 = 6, S7 = 7,
    S8 = 8, S9 = 9, S10 = 10, S11 = 11, S12 = 12, S13 = 13, S14 = 14, S15 = 15,
    S16 = 16, S17 = 17, S18 = 18, S19 = 19, S20 = 20, S21 = 21, S22 = 22, S23 = 23,
    S24 = 24, S25 = 25, S26 = 26, S27 = 27, S28 = 28, S29 = 29, S30 = 30, S31 = 31,
}

pub const FP: Register = R11;
pub const SCRATCH: Register = R12;
pub const LATCH: Register = R10;

pub static ALL_REGISTERS: [Register; 48] = [
    R0, R1, R2, R3, R4, R5, R6, R7, R8, R9, R10, R11, R12, SP, LR, PC, S0, S1, S2, S3, S4, S5,
    S6, S7, S8, S9, S10, S11, S12, S13, S14, S15, S16, S17, S18, S19, S20, S21, S22, S23, S24,
    S25, S26, S27, S28, S29, S30, S31,
];

pub static CPU_PARAMETERS: [Register; 4] = [R0, R1, R2, R3];
pub static FPU_PARAMETERS: [Register; 16] = [
    S0, S1, S2, S3, S4, S5, S6, S7, S8, S9, S10, S11, S12, S13, S14, S15,
];

const FPU_ALL: [Register; 32] = [
    S0, S1, S2, S3, S4, S5, S6, S7, S8, S9, S10, S11, S12, S13, S14, S15, S16, S17, S18, S19,
    S20, S21, S22, S23, S24, S25, S26, S27, S28, S29, S30, S31,
];

const ALLOCATABLE: RegisterSet =
    RegisterSet::of(&[R0, R1, R2, R3, R4, R5, R6, R7, R8, R9]).union(RegisterSet::of(&FPU_ALL));

const CALLER_SAVE: RegisterSet =
    RegisterSet::of(&[R0, R1, R2, R3, R12, LR]).union(RegisterSet::of(&FPU_ALL));

pub(super) fn create(platform: Platform) -> RegisterConfigs {
    let word = platform.word_size;

    let standard = RegisterConfig {
        role: Role::Standard,
        frame: SP,
        integer_return: R0,
        float_return: S0,
        scratch: SCRATCH,
        latch: LATCH,
        allocatable: ALLOCATABLE,
        caller_save: CALLER_SAVE,
        non_zero: RegisterSet::of(&[LATCH, SP, FP]),
        cpu_parameters: &CPU_PARAMETERS,
        fpu_parameters: &FPU_PARAMETERS,
        all_registers: &ALL_REGISTERS,
        csl: None,
        word_size: word,
        stack_arg0_offset_managed: 0,
        stack_arg0_offset_native: 0,
    };

    let all: Vec<Register> = ALL_REGISTERS
        .iter()
        .copied()
        .filter(|r| *r != SP && *r != PC)
        .collect();
    let all_but_latch: Vec<Register> = all.iter().copied().filter(|r| *r != LATCH).collect();

    RegisterConfigs {
        n2j: standard.derive(
            Role::NativeToManaged,
            Some(CalleeSaveLayout::new(
                None,
                word,
                &[R4, R5, R6, R7, R8, R9, R10, FP, LR],
            )),
        ),
        trampoline: standard.derive(
            Role::Trampoline,
            Some(CalleeSaveLayout::new(
                Some(0),
                word,
                &[R0, R1, R2, R3, FP, LR, SCRATCH, S0, S1, S2, S3, S4, S5, S6, S7],
            )),
        ),
        template: standard.derive(Role::Template, None).with_frame(FP),
        compiler_stub: standard.derive(
            Role::CompilerStub,
            Some(CalleeSaveLayout::new(Some(0), word, &all_but_latch)),
        ),
        trap_stub: standard.derive(
            Role::TrapStub,
            Some(CalleeSaveLayout::new(Some(0), word, &all)),
        ),
        uncommon_trap_stub: standard.derive(
            Role::UncommonTrapStub,
            Some(CalleeSaveLayout::new(Some(0), word, &all)),
        ),
        standard,
    }
}
