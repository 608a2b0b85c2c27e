//! x64 decoder for RIP-relative operands.
//!
//! Compilers emit literal loads as `op reg, [rip + 0]` and record the
//! instruction's start. Once the literal has a position in the bundle, the
//! decoder finds the disp32 field and rewrites it relative to the end of the
//! instruction.

use thiserror::Error;

/// Decoding failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("instruction at {pos} runs past the end of the code")]
    Truncated { pos: usize },
    #[error("instruction at {pos} has no RIP-relative operand")]
    NotRipRelative { pos: usize },
}

/// Location of the displacement inside a RIP-relative instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RipOperand {
    /// Offset of the disp32 field from the code start.
    pub disp_pos: usize,
    /// Total instruction length.
    pub length: usize,
}

const PREFIXES: [u8; 11] = [
    0x66, 0x67, 0xF2, 0xF3, 0xF0, 0x2E, 0x36, 0x3E, 0x26, 0x64, 0x65,
];

/// Decode the instruction at `pos` and locate its RIP-relative disp32.
pub fn decode_rip_operand(code: &[u8], pos: usize) -> Result<RipOperand, DecodeError> {
    let byte = |i: usize| code.get(i).copied().ok_or(DecodeError::Truncated { pos });

    let mut i = pos;
    while PREFIXES.contains(&byte(i)?) {
        i += 1;
    }
    if byte(i)? & 0xF0 == 0x40 {
        i += 1; // REX
    }

    let imm_size = match byte(i)? {
        0x0F => {
            i += 1;
            match byte(i)? {
                0x3A => {
                    i += 2;
                    1
                }
                0x38 => {
                    i += 2;
                    0
                }
                0x70..=0x73 | 0xC2 | 0xC4..=0xC6 => {
                    i += 1;
                    1
                }
                _ => {
                    i += 1;
                    0
                }
            }
        }
        opcode => {
            i += 1;
            match opcode {
                0x80 | 0x83 | 0xC6 | 0x6B | 0xC0 | 0xC1 => 1,
                0x81 | 0xC7 | 0x69 => 4,
                0xF6 => {
                    // test r/m8, imm8 only for /0 and /1
                    if (byte(i)? >> 3) & 0x7 <= 1 { 1 } else { 0 }
                }
                0xF7 => {
                    if (byte(i)? >> 3) & 0x7 <= 1 { 4 } else { 0 }
                }
                _ => 0,
            }
        }
    };

    let modrm = byte(i)?;
    if modrm & 0xC7 != 0x05 {
        return Err(DecodeError::NotRipRelative { pos });
    }
    let disp_pos = i + 1;
    let end = disp_pos + 4 + imm_size;
    if end > code.len() {
        return Err(DecodeError::Truncated { pos });
    }
    Ok(RipOperand {
        disp_pos,
        length: end - pos,
    })
}

/// Point the RIP-relative operand at `pos` to `target_offset` bytes from the
/// instruction's start.
pub fn patch_rip_operand(code: &mut [u8], pos: usize, target_offset: i64) -> Result<RipOperand, DecodeError> {
    let operand = decode_rip_operand(code, pos)?;
    let disp = target_offset - operand.length as i64;
    let disp = i32::try_from(disp).map_err(|_| DecodeError::NotRipRelative { pos })?;
    code[operand.disp_pos..operand.disp_pos + 4].copy_from_slice(&disp.to_le_bytes());
    Ok(operand)
}
