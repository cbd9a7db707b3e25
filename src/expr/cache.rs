//! Compiled-expression cache, keyed by source text. Schemas reuse the same
//! expression strings across many parsed instances (e.g. every array
//! element re-evaluates the same `repeat-until` condition), so compiling
//! once and sharing the `Arc<Expr>` avoids re-lexing/re-parsing on every
//! hit. Shared across threads: [`crate::parser::parse`] may run the same
//! [`crate::schema::Schema`] concurrently.

use std::sync::{Arc, RwLock};

use indexmap::IndexMap;

use super::ast::Expr;
use super::parser;
use crate::errors::Result;

pub struct ExprCache {
    entries: RwLock<IndexMap<String, Arc<Expr>>>,
    capacity: Option<usize>,
}

impl ExprCache {
    /// `capacity: None` means unbounded; `Some(n)` evicts the
    /// least-recently-inserted entry once the cache holds more than `n`.
    pub fn new(capacity: Option<usize>) -> Self {
        ExprCache {
            entries: RwLock::new(IndexMap::new()),
            capacity,
        }
    }

    pub fn compile(&self, source: &str) -> Result<Arc<Expr>> {
        if let Some(hit) = self.entries.read().unwrap().get(source) {
            tracing::trace!(expr = source, "expression cache hit");
            return Ok(hit.clone());
        }
        tracing::trace!(expr = source, "expression cache miss");
        let ast = Arc::new(parser::parse(source)?);
        let mut entries = self.entries.write().unwrap();
        entries.insert(source.to_string(), ast.clone());
        if let Some(cap) = self.capacity {
            while entries.len() > cap {
                let Some((oldest, _)) = entries.iter().next() else {
                    break;
                };
                let oldest = oldest.clone();
                entries.shift_remove(&oldest);
            }
        }
        Ok(ast)
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }
}

impl Default for ExprCache {
    fn default() -> Self {
        ExprCache::new(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caches_repeated_source() {
        let cache = ExprCache::new(None);
        let a = cache.compile("1 + 2").unwrap();
        let b = cache.compile("1 + 2").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn evicts_oldest_when_over_capacity() {
        let cache = ExprCache::new(Some(2));
        cache.compile("1").unwrap();
        cache.compile("2").unwrap();
        cache.compile("3").unwrap();
        assert_eq!(cache.len(), 2);
    }
}
