use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::acl::Acl;
use crate::identity::{AclId, ObjectIdentity};

#[derive(Debug, Default)]
struct Indexes {
    by_identity: HashMap<ObjectIdentity, Arc<Acl>>,
    by_id: HashMap<AclId, Arc<Acl>>,
    // Bumped by every eviction and clear.
    generation: u64,
}

impl Indexes {
    fn insert(&mut self, acl: Arc<Acl>) {
        if let Some(previous) = self
            .by_identity
            .insert(acl.object_identity().clone(), Arc::clone(&acl))
            && let Some(previous_id) = previous.id()
            && Some(previous_id) != acl.id()
        {
            self.by_id.remove(&previous_id);
        }
        if let Some(id) = acl.id() {
            self.by_id.insert(id, acl);
        }
    }

    fn remove(&mut self, acl: &Acl) {
        self.by_identity.remove(acl.object_identity());
        if let Some(id) = acl.id() {
            self.by_id.remove(&id);
        }
    }
}

#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStats {
    fn record(&self, hit: bool) {
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

/// Process-local cache of fully resolved ACLs, reachable by storage id and by
/// object identity.
///
/// The cache only mirrors committed store state. Entries never expire; the
/// mutation service evicts them.
///
/// Every eviction advances a generation counter. A reader that fetched rows
/// before an eviction must not put what it built afterwards, so loaders
/// capture [`AclCache::generation`] before touching the store and publish
/// with [`AclCache::put_if_generation`].
#[derive(Debug, Default)]
pub struct AclCache {
    indexes: RwLock<Indexes>,
    stats: CacheStats,
}

impl AclCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_by_identity(&self, identity: &ObjectIdentity) -> Option<Arc<Acl>> {
        let found = self.indexes.read().by_identity.get(identity).cloned();
        self.stats.record(found.is_some());
        found
    }

    pub fn get_by_id(&self, id: AclId) -> Option<Arc<Acl>> {
        let found = self.indexes.read().by_id.get(&id).cloned();
        self.stats.record(found.is_some());
        found
    }

    /// Caches `acl` and every ancestor, root first, so any node of a cached
    /// chain can be served without touching the store.
    pub fn put(&self, acl: Arc<Acl>) {
        let chain = ancestry(acl);
        let mut indexes = self.indexes.write();
        for acl in chain.into_iter().rev() {
            indexes.insert(acl);
        }
    }

    /// Like [`AclCache::put`], but only if no eviction happened since
    /// `generation` was read. Returns whether the chain was cached.
    pub fn put_if_generation(&self, generation: u64, acl: Arc<Acl>) -> bool {
        let chain = ancestry(acl);
        let mut indexes = self.indexes.write();
        if indexes.generation != generation {
            return false;
        }
        for acl in chain.into_iter().rev() {
            indexes.insert(acl);
        }
        true
    }

    pub fn generation(&self) -> u64 {
        self.indexes.read().generation
    }

    pub fn evict_by_identity(&self, identity: &ObjectIdentity) -> Option<Arc<Acl>> {
        let mut indexes = self.indexes.write();
        indexes.generation += 1;
        let removed = indexes.by_identity.get(identity).cloned()?;
        indexes.remove(&removed);
        Some(removed)
    }

    pub fn evict_by_id(&self, id: AclId) -> Option<Arc<Acl>> {
        let mut indexes = self.indexes.write();
        indexes.generation += 1;
        let removed = indexes.by_id.get(&id).cloned()?;
        indexes.remove(&removed);
        Some(removed)
    }

    /// Evicts every id in `ids` under one lock and one generation step.
    /// Returns the new generation.
    pub fn evict_ids(&self, ids: &[AclId]) -> u64 {
        let mut indexes = self.indexes.write();
        indexes.generation += 1;
        for id in ids {
            if let Some(removed) = indexes.by_id.get(id).cloned() {
                indexes.remove(&removed);
            }
        }
        indexes.generation
    }

    pub fn clear(&self) {
        let mut indexes = self.indexes.write();
        indexes.generation += 1;
        indexes.by_identity.clear();
        indexes.by_id.clear();
    }

    pub fn len(&self) -> usize {
        self.indexes.read().by_identity.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

/// `acl` followed by its ancestors, leaf first.
fn ancestry(acl: Arc<Acl>) -> Vec<Arc<Acl>> {
    let mut chain = vec![Arc::clone(&acl)];
    let mut node = acl.parent().cloned();
    while let Some(parent) = node {
        node = parent.parent().cloned();
        chain.push(parent);
    }
    chain
}
