//! Per-connector prepared-statement cache.
//!
//! Statements are keyed by fingerprint (SQL text plus ordered parameter type
//! OIDs) and promoted to named server-side statements once they have been
//! seen `AutoPrepareMinUsages` times. Beyond `MaxAutoPrepare` entries the
//! least-recently-used statement is evicted and must be `Close`d on the wire
//! by the caller. Names are connector-local; a statement prepared on one
//! connector is never referenced on another.

use std::collections::HashMap;
use std::num::NonZeroUsize;

use lru::LruCache;

use crate::messages::RowDescription;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    sql: String,
    param_oids: Vec<u32>,
}

impl Fingerprint {
    pub fn new(sql: &str, param_oids: &[u32]) -> Fingerprint {
        Fingerprint {
            sql: sql.to_string(),
            param_oids: param_oids.to_vec(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PreparedStatement {
    pub name: String,
    pub row_description: Option<RowDescription>,
}

/// How the next execution of a statement should hit the wire.
#[derive(Debug, PartialEq, Eq)]
pub enum StatementPlan {
    /// Parse under the unnamed statement.
    Unprepared,
    /// Bind an already-prepared named statement; no Parse needed.
    Prepared { name: String },
    /// Parse under a fresh name and cache it; `evicted` must be closed on
    /// the wire in the same batch.
    Promote {
        name: String,
        evicted: Option<String>,
    },
}

#[derive(Debug)]
pub struct StatementCache {
    max_size: usize,
    min_usages: u32,
    /// Usage counts for fingerprints not yet promoted. Bounded: cleared
    /// wholesale when it outgrows the cache by 16x.
    usages: HashMap<Fingerprint, u32>,
    cache: Option<LruCache<Fingerprint, PreparedStatement>>,
    next_index: u64,
}

impl StatementCache {
    pub fn new(max_size: usize, min_usages: u32) -> StatementCache {
        StatementCache {
            max_size,
            min_usages,
            usages: HashMap::new(),
            cache: NonZeroUsize::new(max_size).map(LruCache::new),
            next_index: 0,
        }
    }

    #[inline(always)]
    pub fn enabled(&self) -> bool {
        self.max_size > 0
    }

    pub fn len(&self) -> usize {
        self.cache.as_ref().map_or(0, |c| c.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record one use of the fingerprint and decide the wire plan.
    pub fn plan(&mut self, sql: &str, param_oids: &[u32]) -> StatementPlan {
        let Some(cache) = self.cache.as_mut() else {
            return StatementPlan::Unprepared;
        };
        let fingerprint = Fingerprint::new(sql, param_oids);

        if let Some(prepared) = cache.get(&fingerprint) {
            return StatementPlan::Prepared {
                name: prepared.name.clone(),
            };
        }

        let count = self.usages.entry(fingerprint.clone()).or_insert(0);
        *count += 1;
        if *count < self.min_usages {
            if self.usages.len() > self.max_size * 16 {
                self.usages.clear();
            }
            return StatementPlan::Unprepared;
        }

        self.usages.remove(&fingerprint);
        self.next_index += 1;
        let name = format!("_p{}", self.next_index);

        let evicted = if cache.len() >= self.max_size {
            cache.pop_lru().map(|(_, prepared)| prepared.name)
        } else {
            None
        };
        cache.put(
            fingerprint,
            PreparedStatement {
                name: name.clone(),
                row_description: None,
            },
        );
        StatementPlan::Promote { name, evicted }
    }

    /// Attach the row descriptor observed for a cached statement.
    pub fn set_row_description(
        &mut self,
        sql: &str,
        param_oids: &[u32],
        description: RowDescription,
    ) {
        if let Some(cache) = self.cache.as_mut() {
            if let Some(prepared) = cache.peek_mut(&Fingerprint::new(sql, param_oids)) {
                prepared.row_description = Some(description);
            }
        }
    }

    /// Drop a statement whose server-side Parse failed.
    pub fn forget(&mut self, name: &str) {
        if let Some(cache) = self.cache.as_mut() {
            let key = cache
                .iter()
                .find(|(_, prepared)| prepared.name == name)
                .map(|(fingerprint, _)| fingerprint.clone());
            if let Some(key) = key {
                cache.pop(&key);
            }
        }
    }

    /// Session state is gone (DISCARD ALL or reconnect); nothing named
    /// survives on the server.
    pub fn clear(&mut self) {
        self.usages.clear();
        if let Some(cache) = self.cache.as_mut() {
            cache.clear();
        }
    }

    /// Names currently prepared, most recently used first.
    #[cfg(test)]
    pub fn names(&self) -> Vec<String> {
        self.cache
            .as_ref()
            .map(|c| c.iter().map(|(_, p)| p.name.clone()).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(cache: &mut StatementCache, sql: &str) -> StatementPlan {
        cache.plan(sql, &[])
    }

    #[test]
    fn disabled_cache_never_prepares() {
        let mut cache = StatementCache::new(0, 1);
        assert!(!cache.enabled());
        for _ in 0..10 {
            assert_eq!(plan(&mut cache, "SELECT 1"), StatementPlan::Unprepared);
        }
    }

    #[test]
    fn promotes_at_min_usages() {
        let mut cache = StatementCache::new(4, 3);
        assert_eq!(plan(&mut cache, "SELECT 1"), StatementPlan::Unprepared);
        assert_eq!(plan(&mut cache, "SELECT 1"), StatementPlan::Unprepared);
        match plan(&mut cache, "SELECT 1") {
            StatementPlan::Promote { name, evicted } => {
                assert_eq!(name, "_p1");
                assert!(evicted.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            plan(&mut cache, "SELECT 1"),
            StatementPlan::Prepared { name: "_p1".into() }
        );
    }

    #[test]
    fn fingerprint_includes_parameter_oids() {
        let mut cache = StatementCache::new(4, 1);
        match cache.plan("SELECT $1", &[23]) {
            StatementPlan::Promote { name, .. } => assert_eq!(name, "_p1"),
            other => panic!("unexpected {other:?}"),
        }
        // Same SQL, different parameter types: a distinct statement.
        match cache.plan("SELECT $1", &[25]) {
            StatementPlan::Promote { name, .. } => assert_eq!(name, "_p2"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn evicts_least_recently_used_and_reports_victim() {
        let mut cache = StatementCache::new(2, 2);
        for sql in ["SELECT 1", "SELECT 2", "SELECT 3"] {
            for _ in 0..2 {
                plan(&mut cache, sql);
            }
        }
        // SELECT 1 (_p1) was the least recently used when SELECT 3 promoted.
        for _ in 0..1 {
            match plan(&mut cache, "SELECT 3") {
                StatementPlan::Prepared { .. } => {}
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(cache.len(), 2);
        let names = cache.names();
        assert!(names.contains(&"_p2".to_string()));
        assert!(names.contains(&"_p3".to_string()));
        assert!(!names.contains(&"_p1".to_string()));
    }

    #[test]
    fn third_promotion_evicts_first() {
        let mut cache = StatementCache::new(2, 2);
        plan(&mut cache, "SELECT 1");
        match plan(&mut cache, "SELECT 1") {
            StatementPlan::Promote { evicted: None, .. } => {}
            other => panic!("unexpected {other:?}"),
        }
        plan(&mut cache, "SELECT 2");
        plan(&mut cache, "SELECT 2");
        plan(&mut cache, "SELECT 3");
        match plan(&mut cache, "SELECT 3") {
            StatementPlan::Promote { evicted, .. } => assert_eq!(evicted.as_deref(), Some("_p1")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn clear_forgets_everything() {
        let mut cache = StatementCache::new(2, 1);
        plan(&mut cache, "SELECT 1");
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
        match plan(&mut cache, "SELECT 1") {
            StatementPlan::Promote { name, .. } => assert_eq!(name, "_p2"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn forget_removes_by_name() {
        let mut cache = StatementCache::new(2, 1);
        plan(&mut cache, "SELECT 1");
        cache.forget("_p1");
        assert!(cache.is_empty());
    }
}
