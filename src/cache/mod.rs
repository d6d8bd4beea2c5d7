//! Match cache — memoized route resolution per (host, path, method).
//!
//! Resolving which middleware and terminal routes apply to a request means
//! running every pattern in the route table. The result depends only on the
//! request host, path and method, so the router stores it as a [`MatchPlan`]
//! under a [`CacheKey`] and reuses it for repeat requests.
//!
//! The cache is shared by every in-flight dispatch. Writes are idempotent: two
//! dispatches racing on the same key compute the same plan, and whichever
//! insert lands last wins.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::context::Parameters;

/// Composite key: `host:{host}:path:{path}:method:{method}`.
///
/// A missing host is written as `none`. The path excludes the query string,
/// since the query never influences matching.
///
/// # Examples
///
/// ```
/// use waypost::cache::CacheKey;
///
/// let key = CacheKey::new(None, "/users/7", "GET");
/// assert_eq!(key.as_str(), "host:none:path:/users/7:method:GET");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(host: Option<&str>, path: &str, method: &str) -> Self {
        Self(format!(
            "host:{}:path:{}:method:{}",
            host.unwrap_or("none"),
            path,
            method
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A middleware route that applies, with the callback indexes to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MiddlewareHit {
    pub route: usize,
    pub callbacks: Vec<usize>,
    pub params: Parameters,
    pub host_params: Parameters,
}

/// A terminal route that applies, with the captures taken when it matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalHit {
    pub route: usize,
    pub params: Parameters,
    pub host_params: Parameters,
}

/// Everything the dispatcher needs to know about one cache key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchPlan {
    /// Matching global middleware, in registration order.
    pub global: Vec<MiddlewareHit>,
    /// Matching path middleware, in registration order.
    pub path: Vec<MiddlewareHit>,
    /// Matching terminal routes, most specific first.
    pub terminal: Vec<TerminalHit>,
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Concurrent store of [`MatchPlan`]s.
///
/// With a capacity set, new keys beyond it are not stored (the plan is still
/// used for the request that computed it). Existing keys may always be
/// overwritten.
#[derive(Debug, Default)]
pub struct MatchCache {
    entries: DashMap<CacheKey, Arc<MatchPlan>>,
    capacity: Option<usize>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MatchCache {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    /// Look up a plan, counting the hit or miss.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<MatchPlan>> {
        let found = self.entries.get(key).map(|entry| Arc::clone(entry.value()));
        let counter = if found.is_some() {
            &self.hits
        } else {
            &self.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    /// Store `plan` under `key`. Returns `false` when the capacity kept it out.
    pub fn insert(&self, key: CacheKey, plan: Arc<MatchPlan>) -> bool {
        if let Some(capacity) = self.capacity {
            if self.entries.len() >= capacity && !self.entries.contains_key(&key) {
                return false;
            }
        }
        self.entries.insert(key, plan);
        true
    }

    /// Drop every entry. Counters are kept.
    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }
}
