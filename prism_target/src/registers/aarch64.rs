//! AArch64 registers and register configurations.

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
    R0 = 0, R1 = 1, R2 = 2, R3 = 3, R4 = 4, R5 = 5, R6 = 6, R7 = 7,
    R8 = 8, R9 = 9, R10 = 10, R11 = 11, R12 = 12, R13 = 13, R14 = 14, R15 = 15,
    R16 = 16, R17 = 17, R18 = 18, R19 = 19, R20 = 20, R21 = 21, R22 = 22, R23 = 23,
    R24 = 24, R25 = 25, R26 = 26, R27 = 27, R28 = 28, R29 = 29, R30 = 30, SP = 31,
}

fpu_registers! {
    V0 = 0, V1 = 1, V2 = 2, V3 = 3, V4 = 4, V5 = 5, V6 = 6, V7 = 7,
    V8 = 8, V9 = 9, V10 = 10, V11 = 11, V12 = 12, V13 = 13, V14 = 14, V15 = 15,
    V16 = 16, V17 = 17, V18 = 18, V19 = 19, V20 = 20, V21 = 21, V22 = 22, V23 = 23,
    V24 = 24, V25 = 25, V26 = 26, V27 = 27, V28 = 28, V29 = 29, V30 = 30, V31 = 31,
}

/// Frame pointer.
pub const FP: Register = R29;
/// Link register.
pub const LR: Register = R30;
/// Intra-procedure-call scratch register (IP0).
pub const SCRATCH: Register = R16;
pub const LATCH: Register = R26;

pub static ALL_REGISTERS: [Register; 64] = [
    R0, R1, R2, R3, R4, R5, R6, R7, R8, R9, R10, R11, R12, R13, R14, R15, R16, R17, R18, R19,
    R20, R21, R22, R23, R24, R25, R26, R27, R28, R29, R30, SP, V0, V1, V2, V3, V4, V5, V6, V7,
    V8, V9, V10, V11, V12, V13, V14, V15, V16, V17, V18, V19, V20, V21, V22, V23, V24, V25, V26,
    V27, V28, V29, V30, V31,
];

pub static CPU_PARAMETERS: [Register; 8] = [R0, R1, R2, R3, R4, R5, R6, R7];
pub static FPU_PARAMETERS: [Register; 8] = [V0, V1, V2, V3, V4, V5, V6, V7];

const ALLOCATABLE: RegisterSet = RegisterSet::of(&[
    R0, R1, R2, R3, R4, R5, R6, R7, R8, R9, R10, R11, R12, R13, R14, R15, R19, R20, R21, R22,
    R23, R24, R25, V0, V1, V2, V3, V4, V5, V6, V7, V8, V9, V10, V11, V12, V13, V14, V15, V16,
    V17, V18, V19, V20, V21, V22, V23, V24, V25, V26, V27, V28, V29, V30, V31,
]);

pub(super) fn create(platform: Platform) -> RegisterConfigs {
    let word = platform.word_size;

    let standard = RegisterConfig {
        role: Role::Standard,
        frame: SP,
        integer_return: R0,
        float_return: V0,
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

    let all: Vec<Register> = ALL_REGISTERS.iter().copied().filter(|r| *r != SP).collect();
    let all_but_latch: Vec<Register> = all.iter().copied().filter(|r| *r != LATCH).collect();
    let trampoline_saved = [
        R0, R1, R2, R3, R4, R5, R6, R7, FP, LR, SCRATCH, V0, V1, V2, V3, V4, V5, V6, V7,
    ];

    RegisterConfigs {
        n2j: standard.derive(
            Role::NativeToManaged,
            Some(CalleeSaveLayout::new(
                None,
                word,
                &[R19, R20, R21, R22, R23, R24, R25, R26, R27, R28, FP, LR],
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{Isa, Os};

    #[test]
    fn test_aarch64_numbers_fit_register_set() {
        assert_eq!(V31.number, 63);
        assert_eq!(V31.encoding, 31);
        assert!(RegisterSet::of(&ALL_REGISTERS).count() == 64);
    }

    #[test]
    fn test_aarch64_parameters() {
        let configs = RegisterConfigs::create(Platform::new(Isa::Aarch64, Os::Linux));
        assert_eq!(configs.standard.cpu_parameters.len(), 8);
        assert_eq!(configs.standard.integer_return, R0);
        assert!(configs.trampoline.csl.as_ref().unwrap().contains(LR));
    }
}
