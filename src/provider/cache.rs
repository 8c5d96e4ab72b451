use crate::models::{Revision, RevisionId};
use crate::provider::{ProviderError, RevisionProvider};
use lru::LruCache;
use std::cell::{Cell, RefCell};
use std::num::NonZeroUsize;
use tracing::debug;

/// Default number of revisions kept by [`CachingProvider`].
pub const DEFAULT_CACHE_CAPACITY: usize = 4096;

/// Cache hit/miss counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
    pub capacity: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Bounded LRU decorator over another provider.
///
/// Metadata and changed-path lookups are memoised; errors never are.
pub struct CachingProvider<P> {
    inner: P,
    revisions: RefCell<LruCache<RevisionId, Revision>>,
    paths: RefCell<LruCache<RevisionId, Vec<String>>>,
    hits: Cell<u64>,
    misses: Cell<u64>,
}

impl<P: RevisionProvider> CachingProvider<P> {
    /// A capacity of zero is treated as one.
    pub fn new(inner: P, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            revisions: RefCell::new(LruCache::new(capacity)),
            paths: RefCell::new(LruCache::new(capacity)),
            hits: Cell::new(0),
            misses: Cell::new(0),
        }
    }

    pub fn with_default_capacity(inner: P) -> Self {
        Self::new(inner, DEFAULT_CACHE_CAPACITY)
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    /// Drops everything cached for `id`.
    pub fn invalidate(&self, id: &RevisionId) {
        self.revisions.borrow_mut().pop(id);
        self.paths.borrow_mut().pop(id);
    }

    pub fn clear(&self) {
        debug!("Clearing revision cache");
        self.revisions.borrow_mut().clear();
        self.paths.borrow_mut().clear();
    }

    pub fn stats(&self) -> CacheStats {
        let revisions = self.revisions.borrow();
        CacheStats {
            hits: self.hits.get(),
            misses: self.misses.get(),
            size: revisions.len(),
            capacity: revisions.cap().get(),
        }
    }

    fn hit(&self) {
        self.hits.set(self.hits.get() + 1);
    }

    fn miss(&self) {
        self.misses.set(self.misses.get() + 1);
    }
}

impl<P: RevisionProvider> RevisionProvider for CachingProvider<P> {
    fn parents(&self, id: &RevisionId) -> Result<Vec<RevisionId>, ProviderError> {
        if let Some(rev) = self.revisions.borrow_mut().get(id) {
            self.hit();
            return Ok(rev.parents.clone());
        }
        self.miss();
        self.inner.parents(id)
    }

    fn metadata(&self, id: &RevisionId) -> Result<Revision, ProviderError> {
        if let Some(rev) = self.revisions.borrow_mut().get(id) {
            self.hit();
            return Ok(rev.clone());
        }
        self.miss();
        let rev = self.inner.metadata(id)?;
        self.revisions.borrow_mut().put(id.clone(), rev.clone());
        Ok(rev)
    }

    fn heads(&self) -> Result<Vec<(RevisionId, String)>, ProviderError> {
        self.inner.heads()
    }

    fn supports_changed_paths(&self) -> bool {
        self.inner.supports_changed_paths()
    }

    fn changed_paths(&self, id: &RevisionId) -> Result<Vec<String>, ProviderError> {
        if let Some(paths) = self.paths.borrow_mut().get(id) {
            self.hit();
            return Ok(paths.clone());
        }
        self.miss();
        let paths = self.inner.changed_paths(id)?;
        self.paths.borrow_mut().put(id.clone(), paths.clone());
        Ok(paths)
    }
}

impl<P> std::fmt::Debug for CachingProvider<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachingProvider")
            .field("cached_revisions", &self.revisions.borrow().len())
            .field("cached_paths", &self.paths.borrow().len())
            .field("hits", &self.hits.get())
            .field("misses", &self.misses.get())
            .finish()
    }
}
