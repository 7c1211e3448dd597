//! Process-wide store of compiled queries.
//!
//! Compiles run outside the lock. Two threads that miss on the same key
//! both compile; the first to insert wins and the other result is
//! dropped, so callers always see the retained artifact.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::debug;

use crate::ast::OperatorChain;
use crate::error::Result;
use crate::query::CompiledQuery;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MutationKind {
    Insert,
    Update,
    Delete,
}

/// Mutation templates are shared per entity and modified-member set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MutationKey {
    pub kind: MutationKind,
    pub entity: String,
    pub members: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// Compared structurally; captured values do not matter.
    Select(OperatorChain),
    Mutation(MutationKey),
    Direct(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug, Default)]
pub struct QueryCache {
    entries: RwLock<HashMap<CacheKey, CompiledQuery>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &CacheKey) -> Option<CompiledQuery> {
        let found = self.entries.read().get(key).cloned();
        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    /// Store `query` unless the key is already present, returning whichever
    /// artifact the cache holds afterwards.
    pub fn insert_if_absent(&self, key: CacheKey, query: CompiledQuery) -> CompiledQuery {
        let mut entries = self.entries.write();
        match entries.get(&key) {
            Some(existing) => {
                debug!(kind = ?existing.kind(), "discarding duplicate compile");
                existing.clone()
            }
            None => {
                entries.insert(key, query.clone());
                query
            }
        }
    }

    /// Cached artifact for `key`, compiling it on a miss. A failed compile
    /// leaves the cache untouched.
    pub fn get_or_compile<F>(&self, key: CacheKey, compile: F) -> Result<CompiledQuery>
    where
        F: FnOnce() -> Result<CompiledQuery>,
    {
        if let Some(found) = self.get(&key) {
            return Ok(found);
        }
        let compiled = compile()?;
        Ok(self.insert_if_absent(key, compiled))
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.read().contains_key(key)
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CompileError;
    use crate::query::DirectQuery;
    use std::sync::Arc;

    fn direct(sql: &str) -> CompiledQuery {
        CompiledQuery::Direct(Arc::new(DirectQuery {
            sql: sql.to_string(),
            input_parameters: Vec::new(),
        }))
    }

    #[test]
    fn test_first_insert_wins() {
        let cache = QueryCache::new();
        let key = CacheKey::Direct("SELECT 1".to_string());
        let first = cache.insert_if_absent(key.clone(), direct("first"));
        let second = cache.insert_if_absent(key.clone(), direct("second"));
        assert!(first.ptr_eq(&second));
        assert_eq!(second.sql(), "first");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_failed_compile_is_not_cached() {
        let cache = QueryCache::new();
        let key = CacheKey::Direct("bad".to_string());
        let result = cache.get_or_compile(key.clone(), || Err(CompileError::syntax("bad")));
        assert!(result.is_err());
        assert!(cache.is_empty());
        assert!(!cache.contains(&key));
    }

    #[test]
    fn test_stats_count_hits_and_misses() {
        let cache = QueryCache::new();
        let key = CacheKey::Direct("SELECT 1".to_string());
        cache.get_or_compile(key.clone(), || Ok(direct("SELECT 1"))).unwrap();
        cache.get_or_compile(key.clone(), || Ok(direct("SELECT 1"))).unwrap();
        assert_eq!(
            cache.stats(),
            CacheStats {
                entries: 1,
                hits: 1,
                misses: 1
            }
        );
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_select_keys_ignore_captured_values() {
        let a = CacheKey::Select(OperatorChain::from_table("Customer").take(5));
        let b = CacheKey::Select(OperatorChain::from_table("Customer").take(10));
        assert_eq!(a, b);
        let cache = QueryCache::new();
        cache.insert_if_absent(a, direct("x"));
        assert!(cache.contains(&b));
    }
}
