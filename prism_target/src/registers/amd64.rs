//! AMD64 registers and register configurations (System V style).

use super::{CalleeSaveLayout, RegisterConfig, RegisterConfigs, RegisterSet, Role};
use crate::platform::Platform;
use crate::registers::Register;

// =============================================================================
// General-Purpose Registers
// =============================================================================

pub const RAX: Register = Register::cpu(0, "rax", 0);
pub const RCX: Register = Register::cpu(1, "rcx", 1);
pub const RDX: Register = Register::cpu(2, "rdx", 2);
pub const RBX: Register = Register::cpu(3, "rbx", 3);
pub const RSP: Register = Register::cpu(4, "rsp", 4);
pub const RBP: Register = Register::cpu(5, "rbp", 5);
pub const RSI: Register = Register::cpu(6, "rsi", 6);
pub const RDI: Register = Register::cpu(7, "rdi", 7);
pub const R8: Register = Register::cpu(8, "r8", 8);
pub const R9: Register = Register::cpu(9, "r9", 9);
pub const R10: Register = Register::cpu(10, "r10", 10);
pub const R11: Register = Register::cpu(11, "r11", 11);
pub const R12: Register = Register::cpu(12, "r12", 12);
pub const R13: Register = Register::cpu(13, "r13", 13);
pub const R14: Register = Register::cpu(14, "r14", 14);
pub const R15: Register = Register::cpu(15, "r15", 15);

// =============================================================================
// XMM Registers
// =============================================================================

pub const XMM0: Register = Register::fpu(16, "xmm0", 0);
pub const XMM1: Register = Register::fpu(17, "xmm1", 1);
pub const XMM2: Register = Register::fpu(18, "xmm2", 2);
pub const XMM3: Register = Register::fpu(19, "xmm3", 3);
pub const XMM4: Register = Register::fpu(20, "xmm4", 4);
pub const XMM5: Register = Register::fpu(21, "xmm5", 5);
pub const XMM6: Register = Register::fpu(22, "xmm6", 6);
pub const XMM7: Register = Register::fpu(23, "xmm7", 7);
pub const XMM8: Register = Register::fpu(24, "xmm8", 8);
pub const XMM9: Register = Register::fpu(25, "xmm9", 9);
pub const XMM10: Register = Register::fpu(26, "xmm10", 10);
pub const XMM11: Register = Register::fpu(27, "xmm11", 11);
pub const XMM12: Register = Register::fpu(28, "xmm12", 12);
pub const XMM13: Register = Register::fpu(29, "xmm13", 13);
pub const XMM14: Register = Register::fpu(30, "xmm14", 14);
pub const XMM15: Register = Register::fpu(31, "xmm15", 15);

pub static CPU_REGISTERS: [Register; 16] = [
    RAX, RCX, RDX, RBX, RSP, RBP, RSI, RDI, R8, R9, R10, R11, R12, R13, R14, R15,
];

pub static XMM_REGISTERS: [Register; 16] = [
    XMM0, XMM1, XMM2, XMM3, XMM4, XMM5, XMM6, XMM7, XMM8, XMM9, XMM10, XMM11, XMM12, XMM13,
    XMM14, XMM15,
];

pub static ALL_REGISTERS: [Register; 32] = [
    RAX, RCX, RDX, RBX, RSP, RBP, RSI, RDI, R8, R9, R10, R11, R12, R13, R14, R15, XMM0, XMM1,
    XMM2, XMM3, XMM4, XMM5, XMM6, XMM7, XMM8, XMM9, XMM10, XMM11, XMM12, XMM13, XMM14, XMM15,
];

pub static CPU_PARAMETERS: [Register; 6] = [RDI, RSI, RDX, RCX, R8, R9];

pub static XMM_PARAMETERS: [Register; 8] = [XMM0, XMM1, XMM2, XMM3, XMM4, XMM5, XMM6, XMM7];

/// Safepoint latch; also the base of the current thread's locals.
pub const LATCH: Register = R14;

/// Scratch register; trampolines also use it to carry the dispatch index.
pub const SCRATCH: Register = R11;

const ALLOCATABLE: RegisterSet = RegisterSet::of(&[
    RAX, RCX, RDX, RBX, RSI, RDI, R8, R9, R10, R12, R13, R15, XMM0, XMM1, XMM2, XMM3, XMM4, XMM5,
    XMM6, XMM7, XMM8, XMM9, XMM10, XMM11, XMM12, XMM13, XMM14, XMM15,
]);

/// Build every AMD64 register configuration.
pub(super) fn create(platform: Platform) -> RegisterConfigs {
    let word = platform.word_size;

    let standard = RegisterConfig {
        role: Role::Standard,
        frame: RSP,
        integer_return: RAX,
        float_return: XMM0,
        scratch: SCRATCH,
        latch: LATCH,
        allocatable: ALLOCATABLE,
        caller_save: ALLOCATABLE,
        non_zero: RegisterSet::of(&[LATCH, RSP]),
        cpu_parameters: &CPU_PARAMETERS,
        fpu_parameters: &XMM_PARAMETERS,
        all_registers: &ALL_REGISTERS,
        csl: None,
        word_size: word,
        stack_arg0_offset_managed: word,
        stack_arg0_offset_native: 0,
    };

    let all_but_latch: Vec<Register> = ALL_REGISTERS
        .iter()
        .copied()
        .filter(|r| *r != LATCH && *r != RSP)
        .collect();
    let all: Vec<Register> = ALL_REGISTERS.iter().copied().filter(|r| *r != RSP).collect();

    let trampoline_saved = [
        RDI, RSI, RDX, RCX, R8, R9, RBP, R11, XMM0, XMM1, XMM2, XMM3, XMM4, XMM5, XMM6, XMM7,
    ];

    RegisterConfigs {
        n2j: standard.derive(
            Role::NativeToManaged,
            Some(CalleeSaveLayout::new(None, word, &[RBX, RBP, R12, R13, R14, R15])),
        ),
        trampoline: standard.derive(
            Role::Trampoline,
            Some(CalleeSaveLayout::new(Some(0), word, &trampoline_saved)),
        ),
        template: standard.derive(Role::Template, None).with_frame(RBP),
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
    use crate::registers::RegisterConfigs;

    fn configs() -> RegisterConfigs {
        RegisterConfigs::create(Platform::amd64_linux())
    }

    #[test]
    fn test_register_encodings() {
        assert_eq!(R11.low_bits(), 3);
        assert!(R11.high_bit());
        assert!(!RDI.high_bit());
        assert_eq!(XMM9.encoding, 9);
        assert!(XMM9.is_fpu());
    }

    #[test]
    fn test_standard_allocatable_equals_caller_save() {
        let configs = configs();
        assert_eq!(configs.standard.allocatable, configs.standard.caller_save);
        assert!(!configs.standard.allocatable.contains(LATCH));
        assert!(!configs.standard.allocatable.contains(SCRATCH));
        assert!(!configs.standard.allocatable.contains(RSP));
    }

    #[test]
    fn test_trampoline_csa_holds_dispatch_index_register() {
        let csl = configs().trampoline.csl.expect("trampoline csl");
        assert!(csl.contains(R11));
        assert!(csl.contains(RBP));
        assert!(csl.contains(XMM7));
        assert!(!csl.contains(XMM8));
        assert_eq!(csl.size, 16 * 8);
    }

    #[test]
    fn test_compiler_stub_saves_all_but_latch() {
        let csl = configs().compiler_stub.csl.expect("compiler stub csl");
        assert!(!csl.contains(LATCH));
        assert!(csl.contains(RAX));
        assert!(csl.contains(XMM15));
    }

    #[test]
    fn test_n2j_has_unspecified_frame_offset() {
        let csl = configs().n2j.csl.expect("n2j csl");
        assert_eq!(csl.frame_offset_to_csa, None);
        assert!(csl.contains(RBX));
    }

    #[test]
    fn test_template_addresses_frame_through_rbp() {
        assert_eq!(configs().template.frame, RBP);
        assert_eq!(configs().standard.frame, RSP);
    }
}
