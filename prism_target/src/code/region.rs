//! Page-backed code regions.
//!
//! A [`CodeRegion`] is one anonymous mapping that bundles are bump-allocated
//! from. Pages are mapped read-write-execute so call sites can be patched in
//! place while other threads run the surrounding code; every access goes
//! through per-byte or aligned-word atomics.
//!
//! # Safety
//! Raw memory management lives in the `platform` module. [`CodeSpan`] is the
//! only way to touch region memory and keeps the region alive.

use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::error::TargetError;
use crate::platform::align_up;

// =============================================================================
// Platform-specific mapping
// =============================================================================

#[cfg(windows)]
mod platform {
    use std::ptr;
    use windows_sys::Win32::System::Memory::{
        MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READWRITE, PAGE_READWRITE, VirtualAlloc,
        VirtualFree,
    };

    /// Map `size` bytes, executable if requested.
    pub unsafe fn map(size: usize, executable: bool) -> *mut u8 {
        let protect = if executable {
            PAGE_EXECUTE_READWRITE
        } else {
            PAGE_READWRITE
        };
        unsafe { VirtualAlloc(ptr::null(), size, MEM_COMMIT | MEM_RESERVE, protect) as *mut u8 }
    }

    pub unsafe fn unmap(ptr: *mut u8, _size: usize) {
        unsafe {
            VirtualFree(ptr as *mut _, 0, MEM_RELEASE);
        }
    }

    pub fn page_size() -> usize {
        use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};
        // SAFETY: SYSTEM_INFO can be zero-initialized and GetSystemInfo always succeeds
        let mut info: SYSTEM_INFO = unsafe { std::mem::zeroed() };
        unsafe { GetSystemInfo(&mut info) };
        info.dwPageSize as usize
    }
}

#[cfg(unix)]
mod platform {
    use std::ptr;

    /// Map `size` bytes, executable if requested.
    pub unsafe fn map(size: usize, executable: bool) -> *mut u8 {
        let mut prot = libc::PROT_READ | libc::PROT_WRITE;
        if executable {
            prot |= libc::PROT_EXEC;
        }
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                prot,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            ptr::null_mut()
        } else {
            ptr as *mut u8
        }
    }

    pub unsafe fn unmap(ptr: *mut u8, size: usize) {
        unsafe {
            libc::munmap(ptr as *mut _, size);
        }
    }

    pub fn page_size() -> usize {
        // SAFETY: sysconf is safe to call with _SC_PAGESIZE
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }
}

pub use platform::page_size;

// =============================================================================
// Code Region
// =============================================================================

/// Alignment of every bundle allocated from a region.
pub const BUNDLE_ALIGNMENT: usize = 16;

/// A contiguous mapping that bundles are bump-allocated from.
#[derive(Debug)]
pub struct CodeRegion {
    base: NonNull<u8>,
    capacity: usize,
    top: AtomicUsize,
    executable: bool,
}

// SAFETY: the mapping is owned by the region and only accessed atomically
// through `CodeSpan`.
unsafe impl Send for CodeRegion {}
unsafe impl Sync for CodeRegion {}

impl CodeRegion {
    /// Map a region of at least `min_capacity` bytes.
    pub fn new(min_capacity: usize, executable: bool) -> Result<Self, TargetError> {
        let capacity = align_up(min_capacity.max(1), page_size());
        // SAFETY: a fresh anonymous mapping has no aliases.
        let ptr = unsafe { platform::map(capacity, executable) };
        let base = NonNull::new(ptr).ok_or(TargetError::RegionAllocation { size: capacity })?;
        tracing::debug!(capacity, executable, base = ?base, "mapped code region");
        Ok(Self {
            base,
            capacity,
            top: AtomicUsize::new(0),
            executable,
        })
    }

    #[inline]
    pub fn start(&self) -> usize {
        self.base.as_ptr() as usize
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.start() + self.capacity
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn used(&self) -> usize {
        self.top.load(Ordering::Acquire)
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.capacity - self.used()
    }

    #[inline]
    pub fn is_executable(&self) -> bool {
        self.executable
    }

    #[inline]
    pub fn contains(&self, address: usize) -> bool {
        address >= self.start() && address < self.end()
    }

    /// Bump-allocate `size` bytes. Returns the region offset.
    pub fn allocate(&self, size: usize) -> Option<usize> {
        let size = align_up(size, BUNDLE_ALIGNMENT);
        let mut top = self.top.load(Ordering::Relaxed);
        loop {
            let new_top = top.checked_add(size)?;
            if new_top > self.capacity {
                return None;
            }
            match self
                .top
                .compare_exchange_weak(top, new_top, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return Some(top),
                Err(actual) => top = actual,
            }
        }
    }
}

impl Drop for CodeRegion {
    fn drop(&mut self) {
        // SAFETY: every CodeSpan holds an Arc to the region, so no span
        // outlives the mapping.
        unsafe { platform::unmap(self.base.as_ptr(), self.capacity) };
    }
}

// =============================================================================
// Code Span
// =============================================================================

/// A window onto region memory.
///
/// Reads and writes are atomic per byte, or per aligned word for the
/// `atomic_*` accessors, so inspecting code never races with patching it.
#[derive(Debug, Clone)]
pub struct CodeSpan {
    region: Arc<CodeRegion>,
    start: usize,
    len: usize,
}

impl CodeSpan {
    /// Allocate a span of `size` bytes from `region`.
    pub fn allocate(region: &Arc<CodeRegion>, size: usize) -> Option<Self> {
        let offset = region.allocate(size)?;
        Some(Self {
            region: Arc::clone(region),
            start: region.start() + offset,
            len: size,
        })
    }

    /// Absolute address of the first byte.
    #[inline]
    pub fn start(&self) -> usize {
        self.start
    }

    /// Absolute address one past the last byte.
    #[inline]
    pub fn end(&self) -> usize {
        self.start + self.len
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// A sub-window of this span.
    pub fn slice(&self, offset: usize, len: usize) -> CodeSpan {
        assert!(offset + len <= self.len, "span slice out of bounds");
        Self {
            region: Arc::clone(&self.region),
            start: self.start + offset,
            len,
        }
    }

    #[inline]
    fn byte(&self, offset: usize) -> &AtomicU8 {
        assert!(offset < self.len, "code access at {offset} outside span of {}", self.len);
        // SAFETY: the address lies inside the live mapping held by `region`
        // and all accesses to it are atomic.
        unsafe { AtomicU8::from_ptr((self.start + offset) as *mut u8) }
    }

    #[inline]
    pub fn read_u8(&self, offset: usize) -> u8 {
        self.byte(offset).load(Ordering::Acquire)
    }

    #[inline]
    pub fn write_u8(&self, offset: usize, value: u8) {
        self.byte(offset).store(value, Ordering::Release);
    }

    pub fn read_bytes(&self, offset: usize, len: usize) -> Vec<u8> {
        (offset..offset + len).map(|i| self.read_u8(i)).collect()
    }

    pub fn write_bytes(&self, offset: usize, bytes: &[u8]) {
        for (i, b) in bytes.iter().enumerate() {
            self.write_u8(offset + i, *b);
        }
    }

    pub fn fill(&self, value: u8) {
        for i in 0..self.len {
            self.write_u8(i, value);
        }
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        let mut bytes = [0u8; 4];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = self.read_u8(offset + i);
        }
        u32::from_le_bytes(bytes)
    }

    pub fn read_u64(&self, offset: usize) -> u64 {
        let mut bytes = [0u8; 8];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = self.read_u8(offset + i);
        }
        u64::from_le_bytes(bytes)
    }

    pub fn write_u64(&self, offset: usize, value: u64) {
        self.write_bytes(offset, &value.to_le_bytes());
    }

    /// The 4-byte word at `offset`, if it is 4-byte aligned.
    pub fn atomic_u32(&self, offset: usize) -> Option<&AtomicU32> {
        assert!(offset + 4 <= self.len, "code access at {offset} outside span");
        let address = self.start + offset;
        if address % 4 != 0 {
            return None;
        }
        // SAFETY: aligned, in bounds, and kept alive by `region`.
        Some(unsafe { AtomicU32::from_ptr(address as *mut u32) })
    }

    /// The 8-byte word at `offset`, if it is 8-byte aligned.
    pub fn atomic_u64(&self, offset: usize) -> Option<&AtomicU64> {
        assert!(offset + 8 <= self.len, "code access at {offset} outside span");
        let address = self.start + offset;
        if address % 8 != 0 {
            return None;
        }
        // SAFETY: aligned, in bounds, and kept alive by `region`.
        Some(unsafe { AtomicU64::from_ptr(address as *mut u64) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_creation() {
        let region = CodeRegion::new(1000, false).expect("map");
        assert!(region.capacity() >= 1000);
        assert_eq!(region.capacity() % page_size(), 0);
        assert_eq!(region.used(), 0);
        assert!(!region.is_executable());
    }

    #[test]
    fn test_bump_allocation_is_aligned() {
        let region = CodeRegion::new(4096, false).unwrap();
        assert_eq!(region.allocate(10), Some(0));
        assert_eq!(region.allocate(1), Some(16));
        assert_eq!(region.used(), 32);
    }

    #[test]
    fn test_allocation_exhaustion() {
        let region = CodeRegion::new(4096, false).unwrap();
        let capacity = region.capacity();
        assert!(region.allocate(capacity).is_some());
        assert!(region.allocate(1).is_none());
    }

    #[test]
    fn test_span_read_write() {
        let region = Arc::new(CodeRegion::new(4096, false).unwrap());
        let span = CodeSpan::allocate(&region, 64).unwrap();
        span.write_bytes(0, &[0x90, 0xC3]);
        assert_eq!(span.read_bytes(0, 2), vec![0x90, 0xC3]);
        span.write_u64(8, 0xDEAD_BEEF_0BAD_F00D);
        assert_eq!(span.read_u64(8), 0xDEAD_BEEF_0BAD_F00D);
        assert_eq!(span.read_u32(8), 0x0BAD_F00D);

        let sub = span.slice(8, 8);
        assert_eq!(sub.start(), span.start() + 8);
        assert_eq!(sub.read_u64(0), 0xDEAD_BEEF_0BAD_F00D);
    }

    #[test]
    fn test_atomic_word_alignment() {
        let region = Arc::new(CodeRegion::new(4096, false).unwrap());
        let span = CodeSpan::allocate(&region, 64).unwrap();
        assert!(span.atomic_u32(4).is_some());
        assert!(span.atomic_u32(5).is_none());
        assert!(span.atomic_u64(8).is_some());
        assert!(span.atomic_u64(12).is_none());
    }

    #[test]
    #[should_panic(expected = "outside span")]
    fn test_out_of_bounds_access_panics() {
        let region = Arc::new(CodeRegion::new(4096, false).unwrap());
        let span = CodeSpan::allocate(&region, 16).unwrap();
        span.read_u8(16);
    }
}
