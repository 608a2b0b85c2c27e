//! Call-site and entry-point patching.
//!
//! Installed code is modified in three ways, each guarded by a capability:
//!
//! | Patch | Capability | Concurrent executors |
//! |-------|------------|----------------------|
//! | call displacement (mt-safe) | 4-byte aligned displacement | allowed |
//! | call displacement (fixup) | [`Unpublished`] | none can exist yet |
//! | entry redirection | [`WorldStopped`] | all parked at a safepoint |
//!
//! An mt-safe patch is one aligned 32-bit release store followed by a full
//! fence. On AMD64 an aligned 4-byte store is observed by instruction fetch
//! either entirely or not at all, so a concurrently executing call lands on
//! the old or the new target and never a torn one.

use std::sync::atomic::{AtomicU64, Ordering, fence};

use thiserror::Error;

use crate::asm::amd64::{CALL_REL32_OPCODE, CALL_REL32_SIZE, JMP_REL32_OPCODE, JMP_REL32_SIZE};
use crate::code::region::CodeSpan;

// =============================================================================
// Errors
// =============================================================================

/// Reasons a patch cannot be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PatchError {
    /// The target is further than ±2GB from the instruction.
    #[error("target {target:#x} out of rel32 range of {from:#x}")]
    OutOfRange { from: usize, target: usize },
    /// The displacement cannot be written atomically.
    #[error("call displacement at {address:#x} is not 4-byte aligned")]
    Unaligned { address: usize },
    /// The bytes at the site are not a `call rel32`.
    #[error("no call instruction at {address:#x}")]
    NotACall { address: usize },
}

// =============================================================================
// Capabilities
// =============================================================================

/// Proof that the code being patched is not reachable by any other thread.
///
/// Only the installation path of a target method can mint one.
#[derive(Debug)]
pub struct Unpublished {
    _private: (),
}

impl Unpublished {
    pub(crate) fn new() -> Self {
        Self { _private: () }
    }
}

/// Embedder hook that parks every mutator thread at a global safepoint.
///
/// # Safety
/// After `stop_the_world` returns, no thread other than the caller may
/// execute managed code until `resume` is called.
pub unsafe trait StopTheWorld: Send + Sync {
    fn stop_the_world(&self);
    fn resume(&self);
}

/// RAII token held while the world is stopped.
///
/// Dropping the token resumes the world.
pub struct WorldStopped<'a> {
    world: &'a dyn StopTheWorld,
}

impl<'a> WorldStopped<'a> {
    /// Stop the world and return the guard.
    pub fn stop(world: &'a dyn StopTheWorld) -> Self {
        world.stop_the_world();
        tracing::debug!("world stopped for code redirection");
        Self { world }
    }
}

impl Drop for WorldStopped<'_> {
    fn drop(&mut self) {
        self.world.resume();
        tracing::debug!("world resumed");
    }
}

impl std::fmt::Debug for WorldStopped<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("WorldStopped")
    }
}

// =============================================================================
// Statistics
// =============================================================================

static MT_SAFE_PATCHES: AtomicU64 = AtomicU64::new(0);
static FIXUP_PATCHES: AtomicU64 = AtomicU64::new(0);
static REDIRECTIONS: AtomicU64 = AtomicU64::new(0);

/// Patch counters since process start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatchStats {
    pub mt_safe_patches: u64,
    pub fixup_patches: u64,
    pub redirections: u64,
}

/// Snapshot the global patch counters.
pub fn patch_stats() -> PatchStats {
    PatchStats {
        mt_safe_patches: MT_SAFE_PATCHES.load(Ordering::Relaxed),
        fixup_patches: FIXUP_PATCHES.load(Ordering::Relaxed),
        redirections: REDIRECTIONS.load(Ordering::Relaxed),
    }
}

// =============================================================================
// Encoding
// =============================================================================

/// Displacement of a rel32 instruction of `size` bytes at `from` to `target`.
#[inline]
pub fn rel32_displacement(from: usize, size: usize, target: usize) -> Result<i32, PatchError> {
    let next_ip = from.wrapping_add(size) as i64;
    let offset = (target as i64).wrapping_sub(next_ip);
    i32::try_from(offset).map_err(|_| PatchError::OutOfRange { from, target })
}

/// Encode `jmp rel32` at `from` to `to`.
#[inline]
pub fn encode_jmp_rel32(from: usize, to: usize) -> Result<[u8; JMP_REL32_SIZE], PatchError> {
    let disp = rel32_displacement(from, JMP_REL32_SIZE, to)?;
    let mut bytes = [0u8; JMP_REL32_SIZE];
    bytes[0] = JMP_REL32_OPCODE;
    bytes[1..].copy_from_slice(&disp.to_le_bytes());
    Ok(bytes)
}

/// Whether the call at absolute address `call_address` can be patched while
/// other threads execute it.
#[inline]
pub const fn is_mt_safe_call_address(call_address: usize) -> bool {
    (call_address + 1) % 4 == 0
}

/// Current target of the `call rel32` at `pos` in `code`.
pub fn read_call_target(code: &CodeSpan, pos: usize) -> Result<usize, PatchError> {
    let address = code.start() + pos;
    if code.read_u8(pos) != CALL_REL32_OPCODE {
        return Err(PatchError::NotACall { address });
    }
    let disp = code.read_u32(pos + 1) as i32;
    Ok((address + CALL_REL32_SIZE).wrapping_add_signed(disp as isize))
}

// =============================================================================
// Patching
// =============================================================================

/// Retarget the call at `pos` while other threads may execute it.
///
/// Returns the previous target.
pub fn patch_call_mt_safe(code: &CodeSpan, pos: usize, target: usize) -> Result<usize, PatchError> {
    let old = read_call_target(code, pos)?;
    let address = code.start() + pos;
    let disp = rel32_displacement(address, CALL_REL32_SIZE, target)?;
    let word = code
        .atomic_u32(pos + 1)
        .ok_or(PatchError::Unaligned { address })?;
    word.store(disp as u32, Ordering::Release);
    fence(Ordering::SeqCst);
    MT_SAFE_PATCHES.fetch_add(1, Ordering::Relaxed);
    tracing::trace!(site = address, old, new = target, "patched call site");
    Ok(old)
}

/// Retarget the call at `pos` in code no other thread can see yet.
///
/// Returns the previous target.
pub fn fixup_call(
    code: &CodeSpan,
    pos: usize,
    target: usize,
    _proof: &Unpublished,
) -> Result<usize, PatchError> {
    let old = read_call_target(code, pos)?;
    let address = code.start() + pos;
    let disp = rel32_displacement(address, CALL_REL32_SIZE, target)?;
    code.write_bytes(pos + 1, &disp.to_le_bytes());
    FIXUP_PATCHES.fetch_add(1, Ordering::Relaxed);
    Ok(old)
}

/// Overwrite the instruction at `pos` with `jmp target`.
pub fn redirect_entry(
    code: &CodeSpan,
    pos: usize,
    target: usize,
    _world: &WorldStopped<'_>,
) -> Result<(), PatchError> {
    let bytes = encode_jmp_rel32(code.start() + pos, target)?;
    code.write_bytes(pos, &bytes);
    fence(Ordering::SeqCst);
    REDIRECTIONS.fetch_add(1, Ordering::Relaxed);
    Ok(())
}

/// Replace the 8-byte aligned immediate at `pos` while other threads may
/// execute the instruction holding it. Returns the previous value.
pub fn patch_word_mt_safe(code: &CodeSpan, pos: usize, value: u64) -> Result<u64, PatchError> {
    let word = code.atomic_u64(pos).ok_or(PatchError::Unaligned {
        address: code.start() + pos,
    })?;
    let old = word.swap(value, Ordering::AcqRel);
    fence(Ordering::SeqCst);
    MT_SAFE_PATCHES.fetch_add(1, Ordering::Relaxed);
    Ok(old)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::region::CodeRegion;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    fn span(size: usize) -> CodeSpan {
        let region = Arc::new(CodeRegion::new(4096, false).unwrap());
        CodeSpan::allocate(&region, size).unwrap()
    }

    /// Span starting at a 16-byte boundary with `call +0` at offset 3.
    fn span_with_call() -> CodeSpan {
        let code = span(32);
        code.write_bytes(3, &[CALL_REL32_OPCODE, 0, 0, 0, 0]);
        code
    }

    #[test]
    fn test_rel32_displacement() {
        assert_eq!(rel32_displacement(0x1000, 5, 0x1005), Ok(0));
        assert_eq!(rel32_displacement(0x1000, 5, 0x1000), Ok(-5));
        assert!(matches!(
            rel32_displacement(0, 5, 0x1_0000_0000),
            Err(PatchError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_encode_jmp_rel32() {
        let bytes = encode_jmp_rel32(0x1000, 0x2000).unwrap();
        assert_eq!(bytes[0], JMP_REL32_OPCODE);
        assert_eq!(i32::from_le_bytes(bytes[1..].try_into().unwrap()), 0x2000 - 0x1005);
    }

    #[test]
    fn test_mt_safe_patch_returns_previous_target() {
        let code = span_with_call();
        let site = code.start() + 3;
        assert_eq!(read_call_target(&code, 3), Ok(site + 5));
        let old = patch_call_mt_safe(&code, 3, site + 0x100).unwrap();
        assert_eq!(old, site + 5);
        assert_eq!(read_call_target(&code, 3), Ok(site + 0x100));
    }

    #[test]
    fn test_mt_safe_patch_requires_alignment() {
        let code = span(32);
        code.write_bytes(4, &[CALL_REL32_OPCODE, 0, 0, 0, 0]);
        assert!(!is_mt_safe_call_address(code.start() + 4));
        assert!(matches!(
            patch_call_mt_safe(&code, 4, code.start()),
            Err(PatchError::Unaligned { .. })
        ));
    }

    #[test]
    fn test_fixup_any_alignment() {
        let code = span(32);
        code.write_bytes(4, &[CALL_REL32_OPCODE, 0, 0, 0, 0]);
        let target = code.start() + 20;
        fixup_call(&code, 4, target, &Unpublished::new()).unwrap();
        assert_eq!(read_call_target(&code, 4), Ok(target));
    }

    #[test]
    fn test_patch_non_call_is_rejected() {
        let code = span(32);
        assert!(matches!(
            fixup_call(&code, 0, 0, &Unpublished::new()),
            Err(PatchError::NotACall { .. })
        ));
    }

    struct CountingWorld {
        stops: AtomicUsize,
        resumes: AtomicUsize,
    }

    unsafe impl StopTheWorld for CountingWorld {
        fn stop_the_world(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
        fn resume(&self) {
            self.resumes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_redirect_entry_under_world_stopped() {
        let world = CountingWorld {
            stops: AtomicUsize::new(0),
            resumes: AtomicUsize::new(0),
        };
        let code = span(32);
        {
            let stopped = WorldStopped::stop(&world);
            redirect_entry(&code, 0, code.start() + 16, &stopped).unwrap();
            assert_eq!(world.resumes.load(Ordering::SeqCst), 0);
        }
        assert_eq!(world.stops.load(Ordering::SeqCst), 1);
        assert_eq!(world.resumes.load(Ordering::SeqCst), 1);
        assert_eq!(code.read_u8(0), JMP_REL32_OPCODE);
        assert_eq!(code.read_u32(1) as i32, 11);
    }

    #[test]
    fn test_patch_word_mt_safe() {
        let code = span(32);
        code.write_u64(8, u64::MAX);
        assert_eq!(patch_word_mt_safe(&code, 8, 0x1234), Ok(u64::MAX));
        assert_eq!(code.read_u64(8), 0x1234);
        assert!(patch_word_mt_safe(&code, 4, 0).is_err());
    }
}
