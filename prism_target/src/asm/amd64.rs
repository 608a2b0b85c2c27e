//! AMD64 instruction emitter for stubs and adapters.
//!
//! Encodings follow the Intel SDM. Instruction forms are fixed-size where a
//! stub relies on knowing the position of an operand afterwards (index
//! immediates, patchable call displacements, 64-bit placeholders).

use crate::registers::Register;
use crate::registers::amd64::RSP;

// =============================================================================
// Opcodes
// =============================================================================

pub const CALL_REL32_OPCODE: u8 = 0xE8;
pub const CALL_REL32_SIZE: usize = 5;
pub const JMP_REL32_OPCODE: u8 = 0xE9;
pub const JMP_REL32_SIZE: usize = 5;
pub const NOP: u8 = 0x90;
pub const INT3: u8 = 0xCC;
pub const HLT: u8 = 0xF4;

// =============================================================================
// REX Prefix
// =============================================================================

/// REX prefix (0100WRXB).
#[derive(Debug, Clone, Copy, Default)]
struct Rex {
    w: bool,
    r: bool,
    x: bool,
    b: bool,
}

impl Rex {
    #[inline]
    const fn is_needed(self) -> bool {
        self.w || self.r || self.x || self.b
    }

    #[inline]
    const fn encode(self) -> u8 {
        0x40 | ((self.w as u8) << 3) | ((self.r as u8) << 2) | ((self.x as u8) << 1) | (self.b as u8)
    }
}

/// Mod field values for ModR/M.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Mod {
    Indirect = 0b00,
    IndirectDisp8 = 0b01,
    IndirectDisp32 = 0b10,
    Direct = 0b11,
}

#[inline]
const fn modrm(mod_: Mod, reg: u8, rm: u8) -> u8 {
    ((mod_ as u8) << 6) | ((reg & 0x7) << 3) | (rm & 0x7)
}

// =============================================================================
// Memory Operands
// =============================================================================

/// A `[base + disp]` memory operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mem {
    pub base: Register,
    pub disp: i32,
}

impl Mem {
    #[inline]
    pub const fn new(base: Register, disp: i32) -> Self {
        Self { base, disp }
    }

    /// `[rsp + disp]`.
    #[inline]
    pub const fn sp(disp: i32) -> Self {
        Self { base: RSP, disp }
    }

    #[inline]
    const fn disp_fits_i8(&self) -> bool {
        self.disp >= -128 && self.disp <= 127
    }
}

// =============================================================================
// Assembler
// =============================================================================

/// Growable AMD64 code buffer.
#[derive(Debug, Default, Clone)]
pub struct Amd64Assembler {
    code: Vec<u8>,
}

impl Amd64Assembler {
    pub fn new() -> Self {
        Self { code: Vec::with_capacity(256) }
    }

    /// Current emission offset.
    #[inline]
    pub fn position(&self) -> usize {
        self.code.len()
    }

    #[inline]
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Finish emission and take the bytes.
    pub fn finish(self) -> Vec<u8> {
        self.code
    }

    #[inline]
    pub fn emit_u8(&mut self, byte: u8) {
        self.code.push(byte);
    }

    #[inline]
    pub fn emit_u16(&mut self, val: u16) {
        self.code.extend_from_slice(&val.to_le_bytes());
    }

    #[inline]
    pub fn emit_u32(&mut self, val: u32) {
        self.code.extend_from_slice(&val.to_le_bytes());
    }

    #[inline]
    pub fn emit_u64(&mut self, val: u64) {
        self.code.extend_from_slice(&val.to_le_bytes());
    }

    /// Overwrite a little-endian u32 at `pos`.
    pub fn patch_u32(&mut self, pos: usize, val: u32) {
        self.code[pos..pos + 4].copy_from_slice(&val.to_le_bytes());
    }

    fn rex(&mut self, rex: Rex) {
        if rex.is_needed() {
            self.emit_u8(rex.encode());
        }
    }

    /// ModR/M, optional SIB and displacement for `[base + disp]`.
    fn mem_operand(&mut self, reg: u8, mem: Mem) {
        let base = mem.base;
        // RSP/R12 need a SIB byte; RBP/R13 cannot use mod=00.
        let needs_sib = base.low_bits() == 0b100;
        let needs_disp = base.low_bits() == 0b101 && mem.disp == 0;

        let mod_field = if mem.disp == 0 && !needs_disp {
            Mod::Indirect
        } else if mem.disp_fits_i8() {
            Mod::IndirectDisp8
        } else {
            Mod::IndirectDisp32
        };

        if needs_sib {
            self.emit_u8(modrm(mod_field, reg, 0b100));
            self.emit_u8(0x24); // scale=1, no index, base=rsp/r12
        } else {
            self.emit_u8(modrm(mod_field, reg, base.low_bits()));
        }

        match mod_field {
            Mod::IndirectDisp8 => self.emit_u8(mem.disp as i8 as u8),
            Mod::IndirectDisp32 => self.emit_u32(mem.disp as u32),
            _ => {}
        }
    }

    fn op_rm(&mut self, w: bool, opcode: &[u8], reg: Register, mem: Mem) {
        self.rex(Rex {
            w,
            r: reg.high_bit(),
            x: false,
            b: mem.base.high_bit(),
        });
        self.code.extend_from_slice(opcode);
        self.mem_operand(reg.encoding, mem);
    }

    fn op_rr(&mut self, opcode: u8, rm: Register, reg: Register) {
        self.rex(Rex {
            w: true,
            r: reg.high_bit(),
            x: false,
            b: rm.high_bit(),
        });
        self.emit_u8(opcode);
        self.emit_u8(modrm(Mod::Direct, reg.encoding, rm.encoding));
    }

    // =========================================================================
    // Padding
    // =========================================================================

    pub fn nop(&mut self) {
        self.emit_u8(NOP);
    }

    pub fn nops(&mut self, count: usize) {
        for _ in 0..count {
            self.nop();
        }
    }

    /// Pad with nops to a multiple of `alignment`.
    pub fn align(&mut self, alignment: usize) {
        while self.position() % alignment != 0 {
            self.nop();
        }
    }

    /// Pad so the next `call rel32` has a 4-byte aligned displacement.
    ///
    /// Such a displacement can be rewritten with one atomic store while
    /// other threads execute the call.
    pub fn align_patchable_call(&mut self) {
        while (self.position() + 1) % 4 != 0 {
            self.nop();
        }
    }

    // =========================================================================
    // Stack
    // =========================================================================

    pub fn push(&mut self, reg: Register) {
        debug_assert!(reg.is_cpu());
        if reg.high_bit() {
            self.emit_u8(0x41);
        }
        self.emit_u8(0x50 + reg.low_bits());
    }

    pub fn pop(&mut self, reg: Register) {
        debug_assert!(reg.is_cpu());
        if reg.high_bit() {
            self.emit_u8(0x41);
        }
        self.emit_u8(0x58 + reg.low_bits());
    }

    pub fn pushfq(&mut self) {
        self.emit_u8(0x9C);
    }

    pub fn popfq(&mut self) {
        self.emit_u8(0x9D);
    }

    /// `enter frame_size, nesting`.
    pub fn enter(&mut self, frame_size: u16, nesting: u8) {
        self.emit_u8(0xC8);
        self.emit_u16(frame_size);
        self.emit_u8(nesting);
    }

    pub fn leave(&mut self) {
        self.emit_u8(0xC9);
    }

    // =========================================================================
    // Moves
    // =========================================================================

    /// `mov dst, src` (64-bit).
    pub fn movq(&mut self, dst: Register, src: Register) {
        self.op_rr(0x89, dst, src);
    }

    /// `mov dst, [mem]` (64-bit).
    pub fn movq_load(&mut self, dst: Register, mem: Mem) {
        self.op_rm(true, &[0x8B], dst, mem);
    }

    /// `mov [mem], src` (64-bit).
    pub fn movq_store(&mut self, mem: Mem, src: Register) {
        self.op_rm(true, &[0x89], src, mem);
    }

    /// `mov dst32, imm32`; always 5 or 6 bytes.
    pub fn movl_imm(&mut self, dst: Register, imm: u32) {
        self.rex(Rex {
            b: dst.high_bit(),
            ..Rex::default()
        });
        self.emit_u8(0xB8 + dst.low_bits());
        self.emit_u32(imm);
    }

    /// `mov dst, imm64`. Returns the position of the immediate.
    pub fn movq_imm64(&mut self, dst: Register, imm: u64) -> usize {
        self.rex(Rex {
            w: true,
            b: dst.high_bit(),
            ..Rex::default()
        });
        self.emit_u8(0xB8 + dst.low_bits());
        let pos = self.position();
        self.emit_u64(imm);
        pos
    }

    /// `lea dst, [mem]`.
    pub fn leaq(&mut self, dst: Register, mem: Mem) {
        self.op_rm(true, &[0x8D], dst, mem);
    }

    /// `movsd xmm, [mem]`.
    pub fn movsd_load(&mut self, dst: Register, mem: Mem) {
        debug_assert!(dst.is_fpu());
        self.emit_u8(0xF2);
        self.op_rm(false, &[0x0F, 0x10], dst, mem);
    }

    /// `movsd [mem], xmm`.
    pub fn movsd_store(&mut self, mem: Mem, src: Register) {
        debug_assert!(src.is_fpu());
        self.emit_u8(0xF2);
        self.op_rm(false, &[0x0F, 0x11], src, mem);
    }

    /// `movsd dst, src` between XMM registers.
    pub fn movsd(&mut self, dst: Register, src: Register) {
        self.emit_u8(0xF2);
        self.rex(Rex {
            r: dst.high_bit(),
            b: src.high_bit(),
            ..Rex::default()
        });
        self.emit_u8(0x0F);
        self.emit_u8(0x10);
        self.emit_u8(modrm(Mod::Direct, dst.encoding, src.encoding));
    }

    /// Store a register of either file to memory.
    pub fn store(&mut self, mem: Mem, src: Register) {
        if src.is_fpu() {
            self.movsd_store(mem, src);
        } else {
            self.movq_store(mem, src);
        }
    }

    /// Load a register of either file from memory.
    pub fn load(&mut self, dst: Register, mem: Mem) {
        if dst.is_fpu() {
            self.movsd_load(dst, mem);
        } else {
            self.movq_load(dst, mem);
        }
    }

    // =========================================================================
    // Arithmetic
    // =========================================================================

    /// `add dst, imm32` (always the imm32 form).
    pub fn addq_imm(&mut self, dst: Register, imm: i32) {
        self.alu_imm32(0, dst, imm);
    }

    /// `sub dst, imm32` (always the imm32 form).
    pub fn subq_imm(&mut self, dst: Register, imm: i32) {
        self.alu_imm32(5, dst, imm);
    }

    fn alu_imm32(&mut self, digit: u8, dst: Register, imm: i32) {
        self.rex(Rex {
            w: true,
            b: dst.high_bit(),
            ..Rex::default()
        });
        self.emit_u8(0x81);
        self.emit_u8(modrm(Mod::Direct, digit, dst.encoding));
        self.emit_u32(imm as u32);
    }

    /// `sub dst, src`.
    pub fn subq(&mut self, dst: Register, src: Register) {
        self.op_rr(0x29, dst, src);
    }

    /// `xor dst, src`.
    pub fn xorq(&mut self, dst: Register, src: Register) {
        self.op_rr(0x31, dst, src);
    }

    // =========================================================================
    // Control Flow
    // =========================================================================

    /// `call rel32` with a zero displacement. Returns the call's position.
    pub fn call(&mut self) -> usize {
        let pos = self.position();
        self.emit_u8(CALL_REL32_OPCODE);
        self.emit_u32(0);
        pos
    }

    /// `call reg`. Returns the call's position.
    pub fn call_reg(&mut self, target: Register) -> usize {
        let pos = self.position();
        self.rex(Rex {
            b: target.high_bit(),
            ..Rex::default()
        });
        self.emit_u8(0xFF);
        self.emit_u8(modrm(Mod::Direct, 2, target.encoding));
        pos
    }

    /// `jmp reg`.
    pub fn jmp_reg(&mut self, target: Register) {
        self.rex(Rex {
            b: target.high_bit(),
            ..Rex::default()
        });
        self.emit_u8(0xFF);
        self.emit_u8(modrm(Mod::Direct, 4, target.encoding));
    }

    /// `jmp rel8`.
    pub fn jmp_short(&mut self, offset: i8) {
        self.emit_u8(0xEB);
        self.emit_u8(offset as u8);
    }

    pub fn ret(&mut self) {
        self.emit_u8(0xC3);
    }

    /// `ret imm16`, popping `bytes` of arguments.
    pub fn ret_pop(&mut self, bytes: u16) {
        if bytes == 0 {
            self.ret();
        } else {
            self.emit_u8(0xC2);
            self.emit_u16(bytes);
        }
    }

    pub fn hlt(&mut self) {
        self.emit_u8(HLT);
    }

    pub fn int3(&mut self) {
        self.emit_u8(INT3);
    }

    // =========================================================================
    // Callee-Save Areas
    // =========================================================================

    /// Save every register of `csl` into the area at `[rsp + frame_to_csa]`.
    pub fn save_registers(&mut self, csl: &crate::registers::CalleeSaveLayout, frame_to_csa: i32) {
        for &reg in csl.registers() {
            let offset = csl.offset_of(reg).unwrap_or_default() as i32;
            self.store(Mem::sp(frame_to_csa + offset), reg);
        }
    }

    /// Reload every register of `csl` from the area at `[rsp + frame_to_csa]`.
    pub fn restore_registers(&mut self, csl: &crate::registers::CalleeSaveLayout, frame_to_csa: i32) {
        for &reg in csl.registers() {
            let offset = csl.offset_of(reg).unwrap_or_default() as i32;
            self.load(reg, Mem::sp(frame_to_csa + offset));
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::CalleeSaveLayout;
    use crate::registers::amd64::*;

    fn emit(f: impl FnOnce(&mut Amd64Assembler)) -> Vec<u8> {
        let mut asm = Amd64Assembler::new();
        f(&mut asm);
        asm.finish()
    }

    #[test]
    fn test_mov_load_from_rsp() {
        // mov r11, [rsp]
        assert_eq!(emit(|a| a.movq_load(R11, Mem::sp(0))), [0x4C, 0x8B, 0x1C, 0x24]);
        // mov rdx, [rsp+136]
        assert_eq!(
            emit(|a| a.movq_load(RDX, Mem::sp(136))),
            [0x48, 0x8B, 0x94, 0x24, 0x88, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_mov_store_disp8() {
        // mov [rsp+8], rdi
        assert_eq!(emit(|a| a.movq_store(Mem::sp(8), RDI)), [0x48, 0x89, 0x7C, 0x24, 0x08]);
    }

    #[test]
    fn test_mov_rbp_needs_displacement() {
        // mov rax, [rbp]
        assert_eq!(emit(|a| a.movq_load(RAX, Mem::new(RBP, 0))), [0x48, 0x8B, 0x45, 0x00]);
    }

    #[test]
    fn test_mov_register_register() {
        // mov rdi, r11
        assert_eq!(emit(|a| a.movq(RDI, R11)), [0x4C, 0x89, 0xDF]);
        // mov rsp, rsi
        assert_eq!(emit(|a| a.movq(RSP, RSI)), [0x48, 0x89, 0xF4]);
    }

    #[test]
    fn test_mov_immediates() {
        assert_eq!(emit(|a| a.movl_imm(R11, 7)), [0x41, 0xBB, 7, 0, 0, 0]);
        assert_eq!(emit(|a| a.movl_imm(RSI, 7)), [0xBE, 7, 0, 0, 0]);
        let mut asm = Amd64Assembler::new();
        let pos = asm.movq_imm64(R11, u64::MAX);
        assert_eq!(pos, 2);
        assert_eq!(&asm.code()[..2], &[0x49, 0xBB]);
        assert_eq!(asm.position(), 10);
    }

    #[test]
    fn test_alu_immediates() {
        // sub rsp, 136
        assert_eq!(
            emit(|a| a.subq_imm(RSP, 136)),
            [0x48, 0x81, 0xEC, 0x88, 0x00, 0x00, 0x00]
        );
        // add rsp, 8
        assert_eq!(emit(|a| a.addq_imm(RSP, 8)), [0x48, 0x81, 0xC4, 8, 0, 0, 0]);
        // sub r11, 5
        assert_eq!(emit(|a| a.subq_imm(R11, 5)), [0x49, 0x81, 0xEB, 5, 0, 0, 0]);
    }

    #[test]
    fn test_xor_and_sub_registers() {
        assert_eq!(emit(|a| a.xorq(RCX, RCX)), [0x48, 0x31, 0xC9]);
        assert_eq!(emit(|a| a.subq(RSP, RSI)), [0x48, 0x29, 0xF4]);
    }

    #[test]
    fn test_movsd_forms() {
        // movsd [rsp+16], xmm1
        assert_eq!(
            emit(|a| a.movsd_store(Mem::sp(16), XMM1)),
            [0xF2, 0x0F, 0x11, 0x4C, 0x24, 0x10]
        );
        // movsd xmm9, [rsp]
        assert_eq!(
            emit(|a| a.movsd_load(XMM9, Mem::sp(0))),
            [0xF2, 0x44, 0x0F, 0x10, 0x0C, 0x24]
        );
    }

    #[test]
    fn test_calls_and_returns() {
        let mut asm = Amd64Assembler::new();
        asm.nop();
        assert_eq!(asm.call(), 1);
        assert_eq!(&asm.code()[1..6], &[0xE8, 0, 0, 0, 0]);
        assert_eq!(emit(|a| { a.call_reg(RAX); }), [0xFF, 0xD0]);
        assert_eq!(emit(|a| { a.call_reg(R11); }), [0x41, 0xFF, 0xD3]);
        assert_eq!(emit(|a| a.jmp_reg(R11)), [0x41, 0xFF, 0xE3]);
        assert_eq!(emit(|a| a.ret_pop(16)), [0xC2, 16, 0]);
        assert_eq!(emit(|a| a.ret_pop(0)), [0xC3]);
    }

    #[test]
    fn test_enter_leave_push_pop() {
        assert_eq!(emit(|a| a.enter(32, 0)), [0xC8, 32, 0, 0]);
        assert_eq!(emit(|a| a.leave()), [0xC9]);
        assert_eq!(emit(|a| a.push(R12)), [0x41, 0x54]);
        assert_eq!(emit(|a| a.pop(RBP)), [0x5D]);
        assert_eq!(emit(|a| { a.pushfq(); a.popfq(); }), [0x9C, 0x9D]);
    }

    #[test]
    fn test_align_patchable_call() {
        for prefix in 0..8 {
            let mut asm = Amd64Assembler::new();
            asm.nops(prefix);
            asm.align_patchable_call();
            let pos = asm.call();
            assert_eq!((pos + 1) % 4, 0);
        }
    }

    #[test]
    fn test_save_and_restore_registers() {
        let csl = CalleeSaveLayout::new(Some(0), 8, &[RDI, XMM0]);
        let mut asm = Amd64Assembler::new();
        asm.save_registers(&csl, 0);
        // mov [rsp], rdi ; movsd [rsp+8], xmm0
        assert_eq!(
            asm.code(),
            &[0x48, 0x89, 0x3C, 0x24, 0xF2, 0x0F, 0x11, 0x44, 0x24, 0x08]
        );
        let mut asm = Amd64Assembler::new();
        asm.restore_registers(&csl, 0);
        assert_eq!(&asm.code()[..4], &[0x48, 0x8B, 0x3C, 0x24]);
    }
}
