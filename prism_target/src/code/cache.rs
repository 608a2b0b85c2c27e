//! Code cache: bundle allocation and address-to-method lookup.
//!
//! The cache owns one [`CodeRegion`] and indexes every installed
//! [`TargetMethod`] by code start, so the method containing an instruction
//! pointer is found with a single ordered-map probe.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::config::TargetConfig;
use crate::error::TargetError;
use crate::target::bundle::BundleLayout;
use crate::target::codegen_result::Lifespan;
use crate::target::method::TargetMethod;

use super::region::{CodeRegion, CodeSpan};

// =============================================================================
// Code Cache
// =============================================================================

/// Storage and lookup for installed target methods.
#[derive(Debug)]
pub struct CodeCache {
    region: Arc<CodeRegion>,
    /// Installed methods keyed by code start.
    methods: RwLock<BTreeMap<usize, Arc<TargetMethod>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    allocations: AtomicU64,
    evictions: AtomicU64,
}

impl CodeCache {
    /// Map a region of `config.code_cache_size` bytes.
    pub fn new(config: &TargetConfig) -> Result<Self, TargetError> {
        let region = CodeRegion::new(config.code_cache_size, config.executable_code)?;
        tracing::debug!(
            start = region.start(),
            capacity = region.capacity(),
            executable = region.is_executable(),
            "mapped code region"
        );
        Ok(Self {
            region: Arc::new(region),
            methods: RwLock::new(BTreeMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            allocations: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        })
    }

    #[inline]
    pub fn region(&self) -> &Arc<CodeRegion> {
        &self.region
    }

    /// Allocate a zeroed bundle for `layout`.
    pub fn allocate(&self, layout: &BundleLayout) -> Result<CodeSpan, TargetError> {
        self.allocate_span(layout.bundle_size())
    }

    /// Allocate `size` zeroed bytes that belong to no target method.
    pub fn allocate_span(&self, size: usize) -> Result<CodeSpan, TargetError> {
        match CodeSpan::allocate(&self.region, size) {
            Some(span) => {
                self.allocations.fetch_add(1, Ordering::Relaxed);
                Ok(span)
            }
            None => {
                tracing::warn!(requested = size, available = self.region.available(), "code cache full");
                Err(TargetError::CodeCacheFull {
                    requested: size,
                    available: self.region.available(),
                })
            }
        }
    }

    /// Make `tm` findable by address.
    pub fn register(&self, tm: Arc<TargetMethod>) {
        let previous = self.methods.write().insert(tm.code_start(), tm);
        debug_assert!(previous.is_none(), "two methods share a code start");
    }

    /// The method whose code contains `ip`.
    ///
    /// The code end is included so a return address just past a trailing
    /// call still maps to its caller.
    pub fn find_by_ip(&self, ip: usize) -> Option<Arc<TargetMethod>> {
        let found = {
            let methods = self.methods.read();
            methods
                .range(..=ip)
                .next_back()
                .filter(|(_, tm)| ip <= tm.code_end())
                .map(|(_, tm)| Arc::clone(tm))
        };
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Remove `tm` and wipe its code.
    ///
    /// Long-lived code is never evicted. Returns whether `tm` was removed.
    pub fn evict(&self, tm: &TargetMethod) -> bool {
        if tm.lifespan() == Lifespan::Long {
            return false;
        }
        let removed = self.methods.write().remove(&tm.code_start());
        match removed {
            Some(removed) => {
                removed.wipe();
                self.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(name = removed.name(), "evicted target method");
                true
            }
            None => false,
        }
    }

    /// Snapshot of all installed methods in address order.
    pub fn methods(&self) -> Vec<Arc<TargetMethod>> {
        self.methods.read().values().cloned().collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.methods.read().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CodeCacheStats {
        CodeCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            allocations: self.allocations.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            bytes_used: self.region.used(),
            bytes_available: self.region.available(),
        }
    }
}

/// Code cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodeCacheStats {
    /// `find_by_ip` lookups that found a method.
    pub hits: u64,
    pub misses: u64,
    pub allocations: u64,
    pub evictions: u64,
    pub bytes_used: usize,
    pub bytes_available: usize,
}

impl CodeCacheStats {
    /// Fraction of `find_by_ip` lookups that succeeded.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::method::{RawTarget, TargetKind};
    use crate::test_support::runtime;

    #[test]
    fn test_find_by_ip() {
        let rt = runtime();
        let cache = rt.code_cache();
        let tm = TargetMethod::install_raw(&rt, RawTarget::new("a", TargetKind::Compiled, vec![0x90; 32])).unwrap();

        let found = cache.find_by_ip(tm.code_start() + 10).unwrap();
        assert!(Arc::ptr_eq(&found, &tm));
        assert!(Arc::ptr_eq(&cache.find_by_ip(tm.code_end()).unwrap(), &tm));
        assert!(cache.find_by_ip(1).is_none());
        assert!(cache.stats().hits >= 2);
        assert!(cache.stats().misses >= 1);
    }

    #[test]
    fn test_find_by_ip_between_methods() {
        let rt = runtime();
        let cache = rt.code_cache();
        let a = TargetMethod::install_raw(&rt, RawTarget::new("a", TargetKind::Compiled, vec![0x90; 3])).unwrap();
        let b = TargetMethod::install_raw(&rt, RawTarget::new("b", TargetKind::Compiled, vec![0x90; 3])).unwrap();
        // The gap between a's code end and b's bundle holds b's header.
        assert!(b.code_start() > a.code_end() + 1);
        assert!(cache.find_by_ip(a.code_end() + 1).is_none());
        assert!(Arc::ptr_eq(&cache.find_by_ip(b.code_start()).unwrap(), &b));
    }

    #[test]
    fn test_evict_wipes_short_lived_code() {
        let rt = runtime();
        let cache = rt.code_cache();
        let tm = TargetMethod::install_raw(&rt, RawTarget::new("raw", TargetKind::Compiled, vec![0x90; 4])).unwrap();
        // Raw installs are long-lived.
        assert!(!cache.evict(&tm));

        let method = crate::test_support::unique_method("evictable");
        let result = crate::target::codegen_result::CodegenResult::new(vec![0xC3], crate::compile::Nature::Opt);
        let short = TargetMethod::install_codegen(&rt, &method, result).unwrap();
        assert!(cache.evict(&short));
        assert!(short.is_wiped());
        assert!(cache.find_by_ip(short.code_start()).is_none());
        assert!(!cache.evict(&short));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_allocation_failure_reports_cache_full() {
        let rt = runtime();
        let cache = rt.code_cache();
        let err = cache.allocate_span(usize::MAX / 2).unwrap_err();
        assert!(matches!(err, TargetError::CodeCacheFull { .. }));
    }

    #[test]
    fn test_hit_rate() {
        let stats = CodeCacheStats {
            hits: 3,
            misses: 1,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.75).abs() < f64::EPSILON);
        assert_eq!(CodeCacheStats::default().hit_rate(), 0.0);
    }
}
