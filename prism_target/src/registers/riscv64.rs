//! RISC-V 64 registers and register configurations.

use super::{CalleeSaveLayout, Register, RegisterConfig, RegisterConfigs, RegisterSet, Role};
use crate::platform::Platform;

macro_rules! cpu_registers {
    ($($name:ident = $n:literal),* $(,)?) => {
        $(pub const $name: Register = Register::cpu($n, stringify!($name), $n);)*
    };
}

macro_rules! fpu_registers {
    ($($name:ident = $n:literal),* $(,)?) => {
        $(pub const $name: Register = Register::fpu($n + 32, stringify!($name), $n);)*
    };
}

cpu_registers! {
    X0 = 0, X1 = 1, X2 = 2, X3 = 3, X4 = 4, X5 = 5, X6 = 6, X7 = 7,
    X8 = 8, X9 = 9, X10 = 10, X11 = 11, X12 = 12, X13 = 13, X14 = 14, X15 = 15,
    X16 = 16, X17 = 17, X18 = 18, X19 = 19, X20 = 20, X21 = 21, X22 = 22, X23 = 23,
    X24 = 24, X25 = 25, X26 = 26, X27 = 27, X28 = 28, X29 = 29, X30 = 30, X31 = 31,
}

fpu_registers! {
    F0 = 0, F1 = 1, F2 = 2, F3 = 3, F4 = 4, F5 = 5, F6 = 6, F7 = 7,
    F8 = 8, F9 = 9, F10 = 10, F11 = 11, F12 = 12, F13 = 13, F14 = 14, F15 = 15,
    F16 = 16, F17 = 17, F18 = 18, F19 = 19, F20 = 20, F21 = 21, F22 = 22, F23 = 23,
    F24 = 24, F25 = 25, F26 = 26, F27 = 27, F28 = 28, F29 = 29, F30 = 30, F31 = 31,
}

pub const ZERO: Register = X0;
pub const RA: Register = X1;
pub const SP: Register = X2;
pub const FP: Register = X8;
pub const SCRATCH: Register = X5;
pub const LATCH: Register = X26;

pub static ALL_REGISTERS: [Register; 64] = [
    X0, X1, X2, X3, X4, X5, X6, X7, X8, X9, X10, X11, X12, X13, X14, X15, X16, X17, X18, X19,
    X20, X21, X22, X23, X24, X25, X26, X27, X28, X29, X30, X31, F0, F1, F2, F3, F4, F5, F6, F7,
    F8, F9, F10, F11, F12, F13, F14, F15, F16, F17, F18, F19, F20, F21, F22, F23, F24, F25, F26,
    F27, F28, F29, F30, F31,
];

pub static CPU_PARAMETERS: [Register; 8] = [X10, X11, X12, X13, X14, X15, X16, X17];
pub static FPU_PARAMETERS: [Register; 8] = [F10, F11, F12, F13, F14, F15, F16, F17];

const ALLOCATABLE: RegisterSet = RegisterSet::of(&[
    X6, X7, X9, X10, X11, X12, X13, X14, X15, X16, X17, X18, X19, X20, X21, X22, X23, X24, X25,
    X28, X29, X30, X31, F0, F1, F2, F3, F4, F5, F6, F7, F8, F9, F10, F11, F12, F13, F14, F15,
    F16, F17, F18, F19, F20, F21, F22, F23, F24, F25, F26, F27, F28, F29, F30, F31,
]);

pub(super) fn create(platform: Platform) -> RegisterConfigs {
    let word = platform.word_size;

    let standard = RegisterConfig {
        role: Role::Standard,
        frame: SP,
        integer_return: X10,
        float_return: F10,
        scratch: SCRATCH,
        latch: LATCH,
        allocatable: ALLOCATABLE,
        caller_save: ALLOCATABLE,
        non_zero: RegisterSet::of(&[LATCH, SP, FP]),
        cpu_parameters: &CPU_PARAMETERS,
        fpu_parameters: &FPU_PARAMETERS,
        all_registers: &ALL_REGISTERS,
        csl: None,
        word_size: word,
        stack_arg0_offset_managed: 0,
        stack_arg0_offset_native: 0,
    };

    // zero, sp, gp and tp are never saved.
    let all: Vec<Register> = ALL_REGISTERS
        .iter()
        .copied()
        .filter(|r| ![ZERO, SP, X3, X4].contains(r))
        .collect();
    let all_but_latch: Vec<Register> = all.iter().copied().filter(|r| *r != LATCH).collect();
    let trampoline_saved = [
        X10, X11, X12, X13, X14, X15, X16, X17, FP, RA, SCRATCH, F10, F11, F12, F13, F14, F15, F16,
        F17,
    ];

    RegisterConfigs {
        n2j: standard.derive(
            Role::NativeToManaged,
            Some(CalleeSaveLayout::new(
                None,
                word,
                &[X8, X9, X18, X19, X20, X21, X22, X23, X24, X25, X26, X27, RA],
            )),
        ),
        trampoline: standard.derive(
            Role::Trampoline,
            Some(CalleeSaveLayout::new(Some(0), word, &trampoline_saved)),
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
