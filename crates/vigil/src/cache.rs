//! Shared, memory-budget aware lookup cache.
//!
//! Parent-protein lookups are the most expensive reads performed by the
//! engine, and the same peptide is looked up by several stages. They are
//! memoized here, and the cache is the only structure the pipeline shrinks
//! when memory runs low.

use crate::sequence::{ProteinInfo, SequenceMatching, SequenceProvider};
use dashmap::DashMap;
use fnv::FnvBuildHasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use sysinfo::{System, SystemExt};

struct Entry {
    parents: Arc<Vec<String>>,
    hits: AtomicU64,
}

pub struct SequenceCache {
    provider: Arc<dyn SequenceProvider>,
    parents: DashMap<(String, SequenceMatching), Entry, FnvBuildHasher>,
}

impl SequenceCache {
    pub fn new(provider: Arc<dyn SequenceProvider>) -> Self {
        Self {
            provider,
            parents: DashMap::default(),
        }
    }

    pub fn provider(&self) -> &dyn SequenceProvider {
        self.provider.as_ref()
    }

    pub fn protein(&self, accession: &str) -> Option<Arc<ProteinInfo>> {
        self.provider.protein(accession)
    }

    pub fn parent_proteins(&self, peptide: &str, matching: SequenceMatching) -> Arc<Vec<String>> {
        let key = (peptide.to_string(), matching);
        if let Some(entry) = self.parents.get(&key) {
            entry.hits.fetch_add(1, Ordering::Relaxed);
            return entry.parents.clone();
        }
        let parents = Arc::new(self.provider.parent_proteins(peptide, matching));
        self.parents.insert(
            key,
            Entry {
                parents: parents.clone(),
                hits: AtomicU64::new(1),
            },
        );
        parents
    }

    pub fn len(&self) -> usize {
        self.parents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }

    /// Evict roughly `fraction` of the cached entries, least used first.
    /// Returns the number of evicted entries.
    pub fn reduce(&self, fraction: f64) -> usize {
        let fraction = fraction.clamp(0.0, 1.0);
        let target = (self.parents.len() as f64 * fraction).ceil() as usize;
        if target == 0 {
            return 0;
        }
        let mut usage = self
            .parents
            .iter()
            .map(|entry| (entry.hits.load(Ordering::Relaxed), entry.key().clone()))
            .collect::<Vec<_>>();
        usage.sort();
        usage
            .into_iter()
            .take(target)
            .filter(|(_, key)| self.parents.remove(key).is_some())
            .count()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemoryStatus {
    Ok,
    /// Usage was above the limit, the cache was shrunk and headroom restored
    Reduced { evicted: usize },
    /// Usage is still critical after shrinking the cache
    Critical { evicted: usize },
}

/// Watches the fraction of system memory in use
pub struct MemoryGuard {
    probe: Box<dyn Fn() -> f64 + Send + Sync>,
    limit: f64,
    critical: f64,
    reduction: f64,
}

impl MemoryGuard {
    pub fn system(limit: f64, critical: f64, reduction: f64) -> Self {
        let system = Mutex::new(System::new());
        Self::with_probe(
            move || match system.lock() {
                Ok(mut system) => {
                    system.refresh_memory();
                    match system.total_memory() {
                        0 => 0.0,
                        total => system.used_memory() as f64 / total as f64,
                    }
                }
                Err(_) => 0.0,
            },
            limit,
            critical,
            reduction,
        )
    }

    pub fn with_probe<F>(probe: F, limit: f64, critical: f64, reduction: f64) -> Self
    where
        F: Fn() -> f64 + Send + Sync + 'static,
    {
        Self {
            probe: Box::new(probe),
            limit,
            critical: critical.max(limit),
            reduction,
        }
    }

    pub fn usage(&self) -> f64 {
        (self.probe)()
    }

    /// Shrink the cache if memory usage exceeds the limit
    pub fn relieve(&self, cache: &SequenceCache) -> MemoryStatus {
        let usage = self.usage();
        if usage <= self.limit {
            return MemoryStatus::Ok;
        }
        let evicted = cache.reduce(self.reduction);
        let after = self.usage();
        log::warn!(
            "memory usage at {:.1}%, evicted {} cached lookups (now {:.1}%)",
            usage * 100.0,
            evicted,
            after * 100.0
        );
        if after > self.critical {
            MemoryStatus::Critical { evicted }
        } else {
            MemoryStatus::Reduced { evicted }
        }
    }
}
