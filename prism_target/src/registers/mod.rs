//! Register configurations for each code role.
//!
//! A [`RegisterConfig`] describes one calling convention: which registers
//! carry parameters and return values, which ones are scratch or reserved,
//! and which ones a piece of code must preserve in its callee-save area.
//! Different kinds of code (ordinary methods, trampolines, trap stubs, ...)
//! use different configurations on the same platform; [`RegisterConfigs`]
//! is the per-platform catalogue of all of them.
//!
//! # Performance Considerations
//! - [`Register`] is `Copy` and compares by number
//! - [`RegisterSet`] is a 64-bit bitfield with O(1) membership testing

pub mod aarch64;
pub mod amd64;
pub mod arm;
pub mod riscv64;

use std::fmt;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::kind::Kind;
use crate::platform::{Isa, Os, Platform};

// =============================================================================
// Registers
// =============================================================================

/// Register file a register belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterCategory {
    /// General-purpose integer register.
    Cpu,
    /// Floating-point / vector register.
    Fpu,
}

/// An architecture register.
///
/// `number` is unique across all register files of one ISA and stays below
/// 64 so registers fit a [`RegisterSet`]. `encoding` is the value the
/// hardware uses in instruction fields.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Register {
    pub number: u8,
    pub name: &'static str,
    pub encoding: u8,
    pub category: RegisterCategory,
}

impl Register {
    pub const fn cpu(number: u8, name: &'static str, encoding: u8) -> Self {
        Self {
            number,
            name,
            encoding,
            category: RegisterCategory::Cpu,
        }
    }

    pub const fn fpu(number: u8, name: &'static str, encoding: u8) -> Self {
        Self {
            number,
            name,
            encoding,
            category: RegisterCategory::Fpu,
        }
    }

    #[inline(always)]
    pub const fn is_cpu(self) -> bool {
        matches!(self.category, RegisterCategory::Cpu)
    }

    #[inline(always)]
    pub const fn is_fpu(self) -> bool {
        matches!(self.category, RegisterCategory::Fpu)
    }

    /// Bits 0-2 of the encoding (ModR/M field on x64).
    #[inline(always)]
    pub const fn low_bits(self) -> u8 {
        self.encoding & 0x7
    }

    /// Bit 3 of the encoding (REX extension on x64).
    #[inline(always)]
    pub const fn high_bit(self) -> bool {
        self.encoding & 0x8 != 0
    }
}

impl fmt::Debug for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

// =============================================================================
// Register Sets
// =============================================================================

/// A set of registers keyed by register number.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RegisterSet(u64);

impl RegisterSet {
    pub const EMPTY: RegisterSet = RegisterSet(0);

    /// Build a set from a slice of registers.
    pub const fn of(registers: &[Register]) -> Self {
        let mut bits = 0u64;
        let mut i = 0;
        while i < registers.len() {
            bits |= 1 << registers[i].number;
            i += 1;
        }
        RegisterSet(bits)
    }

    #[inline]
    pub const fn bits(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn contains(self, reg: Register) -> bool {
        self.0 & (1 << reg.number) != 0
    }

    #[inline]
    pub const fn insert(self, reg: Register) -> Self {
        RegisterSet(self.0 | (1 << reg.number))
    }

    #[inline]
    pub const fn remove(self, reg: Register) -> Self {
        RegisterSet(self.0 & !(1 << reg.number))
    }

    #[inline]
    pub const fn union(self, other: RegisterSet) -> Self {
        RegisterSet(self.0 | other.0)
    }

    #[inline]
    pub const fn difference(self, other: RegisterSet) -> Self {
        RegisterSet(self.0 & !other.0)
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Iterate the members, resolving numbers against `universe`.
    pub fn iter_in(self, universe: &[Register]) -> impl Iterator<Item = Register> + '_ {
        universe.iter().copied().filter(move |r| self.contains(*r))
    }
}

impl fmt::Debug for RegisterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RegisterSet({:#018x})", self.0)
    }
}

// =============================================================================
// Callee-Save Layout
// =============================================================================

/// Layout of the area in which a frame saves registers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalleeSaveLayout {
    /// Offset from the frame's stack pointer to the area, if fixed.
    pub frame_offset_to_csa: Option<usize>,
    /// Total size of the area in bytes.
    pub size: usize,
    /// Bytes reserved per saved register.
    pub slot_size: usize,
    registers: Vec<Register>,
    offsets: FxHashMap<u8, usize>,
}

impl CalleeSaveLayout {
    /// Lay out `registers` in order, one `slot_size` slot each.
    pub fn new(frame_offset_to_csa: Option<usize>, slot_size: usize, registers: &[Register]) -> Self {
        let offsets = registers
            .iter()
            .enumerate()
            .map(|(i, r)| (r.number, i * slot_size))
            .collect();
        Self {
            frame_offset_to_csa,
            size: registers.len() * slot_size,
            slot_size,
            registers: registers.to_vec(),
            offsets,
        }
    }

    /// Saved registers in slot order.
    #[inline]
    pub fn registers(&self) -> &[Register] {
        &self.registers
    }

    /// Offset of `reg`'s slot within the area.
    #[inline]
    pub fn offset_of(&self, reg: Register) -> Option<usize> {
        self.offsets.get(&reg.number).copied()
    }

    #[inline]
    pub fn contains(&self, reg: Register) -> bool {
        self.offsets.contains_key(&reg.number)
    }

    /// Register saved in the slot starting at `offset`.
    pub fn register_at(&self, offset: usize) -> Option<Register> {
        if offset % self.slot_size != 0 {
            return None;
        }
        self.registers.get(offset / self.slot_size).copied()
    }
}

// =============================================================================
// Calling Conventions
// =============================================================================

/// Where a parameter travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Register(Register),
    /// Offset from the first stack argument slot.
    Stack { offset: usize },
}

/// Kind of call a convention is computed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallType {
    /// Managed code calling managed code.
    Managed,
    /// Managed code calling a native function.
    Native,
    /// Stub code calling a runtime routine.
    Runtime,
}

/// Parameter locations for one signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallingConvention {
    pub locations: SmallVec<[Location; 8]>,
    /// Bytes of outgoing stack arguments.
    pub stack_size: usize,
}

/// Code role a register configuration serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Standard,
    NativeToManaged,
    Trampoline,
    Template,
    CompilerStub,
    TrapStub,
    UncommonTrapStub,
}

// =============================================================================
// Register Configuration
// =============================================================================

/// One calling-convention descriptor.
#[derive(Debug, Clone)]
pub struct RegisterConfig {
    pub role: Role,
    /// Register used to address the frame.
    pub frame: Register,
    pub integer_return: Register,
    pub float_return: Register,
    /// Register free for any use between instructions.
    pub scratch: Register,
    /// Safepoint latch / thread-locals register.
    pub latch: Register,
    pub allocatable: RegisterSet,
    pub caller_save: RegisterSet,
    /// Registers that never hold zero (stack pointer, latch).
    pub non_zero: RegisterSet,
    pub cpu_parameters: &'static [Register],
    pub fpu_parameters: &'static [Register],
    pub all_registers: &'static [Register],
    /// Registers this role saves, if any.
    pub csl: Option<CalleeSaveLayout>,
    pub word_size: usize,
    /// Stack arg 0 offset from the stack pointer at entry, managed calls.
    pub stack_arg0_offset_managed: usize,
    /// Stack arg 0 offset from the stack pointer at entry, native calls.
    pub stack_arg0_offset_native: usize,
}

impl RegisterConfig {
    /// Derive a config for `role` from this one.
    pub fn derive(&self, role: Role, csl: Option<CalleeSaveLayout>) -> Self {
        Self {
            role,
            csl,
            ..self.clone()
        }
    }

    /// Derive a config that addresses its frame through `frame`.
    pub fn with_frame(mut self, frame: Register) -> Self {
        self.frame = frame;
        self
    }

    pub fn stack_arg0_offset(&self, call_type: CallType) -> usize {
        match call_type {
            CallType::Managed | CallType::Runtime => self.stack_arg0_offset_managed,
            CallType::Native => self.stack_arg0_offset_native,
        }
    }

    /// Register a value of `kind` is returned in.
    pub fn return_register(&self, kind: Kind) -> Option<Register> {
        match kind {
            Kind::Void => None,
            k if k.is_float() => Some(self.float_return),
            _ => Some(self.integer_return),
        }
    }

    /// Assign a location to every parameter of `kinds`.
    ///
    /// Integral and reference kinds take CPU parameter registers, float
    /// kinds take FPU parameter registers, and the rest spill to word-sized
    /// stack slots. `stack_only` forces every parameter onto the stack.
    pub fn calling_convention(
        &self,
        _call_type: CallType,
        kinds: &[Kind],
        stack_only: bool,
    ) -> CallingConvention {
        let mut locations = SmallVec::with_capacity(kinds.len());
        let mut next_cpu = 0;
        let mut next_fpu = 0;
        let mut stack_size = 0;

        for &kind in kinds {
            let reg = if stack_only {
                None
            } else if kind.is_void() {
                crate::fatal!("void parameter in calling convention")
            } else if kind.is_float() {
                let reg = self.fpu_parameters.get(next_fpu).copied();
                next_fpu += 1;
                reg
            } else {
                let reg = self.cpu_parameters.get(next_cpu).copied();
                next_cpu += 1;
                reg
            };
            match reg {
                Some(reg) => locations.push(Location::Register(reg)),
                None => {
                    locations.push(Location::Stack { offset: stack_size });
                    let slot = kind.size_in_bytes(self.word_size).max(self.word_size);
                    stack_size += crate::platform::align_up(slot, self.word_size);
                }
            }
        }

        CallingConvention {
            locations,
            stack_size,
        }
    }
}

// =============================================================================
// Register Configs
// =============================================================================

/// All register configurations of one platform.
#[derive(Debug, Clone)]
pub struct RegisterConfigs {
    pub standard: RegisterConfig,
    pub n2j: RegisterConfig,
    pub trampoline: RegisterConfig,
    pub template: RegisterConfig,
    pub compiler_stub: RegisterConfig,
    pub trap_stub: RegisterConfig,
    pub uncommon_trap_stub: RegisterConfig,
}

impl RegisterConfigs {
    /// Build the catalogue for `platform`.
    ///
    /// Unsupported ISA/OS pairs are fatal.
    pub fn create(platform: Platform) -> Self {
        let configs = match (platform.isa, platform.os) {
            (Isa::Amd64, Os::Linux | Os::Darwin) => amd64::create(platform),
            (Isa::Aarch64, Os::Linux | Os::Darwin) => aarch64::create(platform),
            (Isa::Arm, Os::Linux) => arm::create(platform),
            (Isa::Riscv64, Os::Linux) => riscv64::create(platform),
            _ => crate::fatal!("register configurations unimplemented for {platform}"),
        };

        let standard = &configs.standard;
        if standard.allocatable != standard.caller_save {
            if platform.isa == Isa::Arm {
                // Fixed-role registers on ARMv7 are allocatable but callee-saved.
                tracing::debug!(
                    %platform,
                    allocatable = ?standard.allocatable,
                    caller_save = ?standard.caller_save,
                    "allocatable registers differ from caller-save registers"
                );
            } else {
                crate::fatal!("{platform}: allocatable registers must all be caller-saved");
            }
        }
        configs
    }

    /// Config for a role.
    pub fn get(&self, role: Role) -> &RegisterConfig {
        match role {
            Role::Standard => &self.standard,
            Role::NativeToManaged => &self.n2j,
            Role::Trampoline => &self.trampoline,
            Role::Template => &self.template,
            Role::CompilerStub => &self.compiler_stub,
            Role::TrapStub => &self.trap_stub,
            Role::UncommonTrapStub => &self.uncommon_trap_stub,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
