use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use hieracl_core::{Acl, AclCache, AclId, AclParts, ObjectIdentity, Sid, SidId};
use hieracl_storage::{AclStore, AclTransaction, NewEntry};

use crate::error::AclError;
use crate::loader::{AclLoader, DEFAULT_BATCH_SIZE, entry_from_row};

/// Supplies the principal that owns newly created ACLs.
pub trait PrincipalSource: Send + Sync {
    fn current_principal(&self) -> Option<Sid>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticPrincipal(Option<Sid>);

impl StaticPrincipal {
    pub fn new(sid: Sid) -> Self {
        Self(Some(sid))
    }

    pub fn anonymous() -> Self {
        Self(None)
    }
}

impl PrincipalSource for StaticPrincipal {
    fn current_principal(&self) -> Option<Sid> {
        self.0.clone()
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub batch_size: usize,
    pub operation_timeout: Option<Duration>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            operation_timeout: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheReport {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

pub struct AclService<S: AclStore> {
    store: Arc<S>,
    cache: Arc<AclCache>,
    loader: AclLoader<S>,
    principal: Arc<dyn PrincipalSource>,
    config: ServiceConfig,
}

impl<S: AclStore> AclService<S> {
    pub fn new(
        store: Arc<S>,
        cache: Arc<AclCache>,
        principal: Arc<dyn PrincipalSource>,
        config: ServiceConfig,
    ) -> Self {
        let loader = AclLoader::new(Arc::clone(&store), Arc::clone(&cache), config.batch_size);
        Self {
            store,
            cache,
            loader,
            principal,
            config,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub async fn read_acl_by_id(
        &self,
        identity: &ObjectIdentity,
        sids: &[Sid],
    ) -> Result<Arc<Acl>, AclError> {
        let mut found = self
            .bounded(
                "read_acl_by_id",
                self.loader.load(std::slice::from_ref(identity), sids),
            )
            .await?;
        found
            .remove(identity)
            .ok_or_else(|| AclError::NotFound(format!("no acl for {identity}")))
    }

    pub async fn read_acls_by_id(
        &self,
        identities: &[ObjectIdentity],
        sids: &[Sid],
    ) -> Result<HashMap<ObjectIdentity, Arc<Acl>>, AclError> {
        self.bounded("read_acls_by_id", self.loader.load(identities, sids))
            .await
    }

    /// Creates a bare ACL owned by the current principal.
    pub async fn create_acl(&self, identity: &ObjectIdentity) -> Result<Arc<Acl>, AclError> {
        let owner = self.principal.current_principal().ok_or_else(|| {
            AclError::InvalidArgument("no current principal to own the acl".to_string())
        })?;
        self.create_object_identity(identity, &owner, true).await
    }

    pub async fn create_object_identity(
        &self,
        identity: &ObjectIdentity,
        owner: &Sid,
        entries_inheriting: bool,
    ) -> Result<Arc<Acl>, AclError> {
        self.bounded(
            "create_object_identity",
            self.create_inner(identity, owner, entries_inheriting),
        )
        .await
    }

    /// Persists `acl` and every ancestor it links to, root first, in one
    /// transaction. Returns the stored aggregate with fresh entry ids.
    pub async fn update_acl(&self, acl: &Acl) -> Result<Arc<Acl>, AclError> {
        self.bounded("update_acl", self.update_inner(acl)).await
    }

    pub async fn delete_acl(
        &self,
        identity: &ObjectIdentity,
        delete_children: bool,
    ) -> Result<(), AclError> {
        self.bounded("delete_acl", self.delete_inner(identity, delete_children))
            .await
    }

    /// Removes every trace of `sid`: the ACLs it owns (with their subtrees),
    /// the entries naming it, and the sid row. Unknown sids are a no-op.
    pub async fn delete_sid(&self, sid: &Sid) -> Result<(), AclError> {
        self.bounded("delete_sid", self.delete_sid_inner(sid)).await
    }

    pub async fn find_children(
        &self,
        identity: &ObjectIdentity,
    ) -> Result<Vec<ObjectIdentity>, AclError> {
        self.bounded("find_children", async {
            let mut tx = self.store.begin().await?;
            let parent = tx
                .find_identity(identity)
                .await?
                .ok_or_else(|| AclError::NotFound(format!("no acl for {identity}")))?;
            let children = tx.find_children(parent.id).await?;
            Ok::<_, AclError>(children.into_iter().map(|c| c.object_identity).collect())
        })
        .await
    }

    pub async fn list_identities(&self, object_type: &str) -> Result<Vec<ObjectIdentity>, AclError> {
        self.bounded("list_identities", async {
            Ok::<_, AclError>(self.store.list_identities(object_type).await?)
        })
        .await
    }

    pub fn cache_stats(&self) -> CacheReport {
        let stats = self.cache.stats();
        CacheReport {
            entries: self.cache.len(),
            hits: stats.hits(),
            misses: stats.misses(),
        }
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T, AclError>>,
    ) -> Result<T, AclError> {
        match self.config.operation_timeout {
            Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
                tracing::warn!(operation, ?limit, "acl operation timed out");
                AclError::StoreUnavailable(format!("{operation} timed out after {limit:?}"))
            })?,
            None => fut.await,
        }
    }

    #[tracing::instrument(skip_all, fields(identity = %identity, owner = %owner))]
    async fn create_inner(
        &self,
        identity: &ObjectIdentity,
        owner: &Sid,
        entries_inheriting: bool,
    ) -> Result<Arc<Acl>, AclError> {
        let sid_ids = self.store.ensure_sids(std::slice::from_ref(owner)).await?;
        let owner_id = lookup_sid(&sid_ids, owner)?;

        let mut tx = self.store.begin().await?;
        if tx.find_identity(identity).await?.is_some() {
            return Err(AclError::AlreadyExists(identity.to_string()));
        }
        let id = tx
            .insert_identity(identity, owner_id, None, entries_inheriting)
            .await?;
        self.cache.evict_by_identity(identity);
        let generation = self.cache.generation();
        tx.commit().await?;

        let acl = Arc::new(Acl::from_parts(AclParts {
            id: Some(id),
            object_identity: identity.clone(),
            owner: owner.clone(),
            entries: Vec::new(),
            parent: None,
            entries_inheriting,
        })?);
        self.publish(generation, &[id], &acl);

        tracing::info!(acl_id = %id, "acl created");
        Ok(acl)
    }

    #[tracing::instrument(skip_all, fields(identity = %acl.object_identity()))]
    async fn update_inner(&self, acl: &Acl) -> Result<Arc<Acl>, AclError> {
        let mut chain: Vec<&Acl> = std::iter::once(acl).chain(acl.ancestors()).collect();
        let mut seen = HashSet::new();
        for node in &chain {
            if node.id().is_none() {
                return Err(AclError::InvalidArgument(format!(
                    "{} has not been persisted",
                    node.object_identity()
                )));
            }
            if !seen.insert(node.object_identity()) {
                return Err(AclError::InvalidArgument(format!(
                    "{} appears twice in its parent chain",
                    node.object_identity()
                )));
            }
        }
        chain.reverse();

        // Sid rows are committed before the entry transaction opens so that
        // concurrent updaters never wait on each other's uncommitted sids.
        let sids: Vec<Sid> = chain
            .iter()
            .flat_map(|node| {
                std::iter::once(node.owner().clone())
                    .chain(node.entries().iter().map(|e| e.sid.clone()))
            })
            .collect();
        let sid_ids = self.store.ensure_sids(&sids).await?;

        let mut tx = self.store.begin().await?;
        let mut touched = Vec::new();
        let mut persisted: Option<Arc<Acl>> = None;

        for node in chain {
            let id = node.id().ok_or_else(|| {
                AclError::InvalidArgument(format!(
                    "{} has not been persisted",
                    node.object_identity()
                ))
            })?;
            touched.extend(self.evict_subtree(&mut tx, id).await?);

            let parent_id = node.parent().and_then(|p| p.id());
            tx.update_identity(
                id,
                lookup_sid(&sid_ids, node.owner())?,
                parent_id,
                node.is_entries_inheriting(),
            )
            .await?;

            let entries = node
                .entries()
                .iter()
                .map(|e| {
                    Ok(NewEntry {
                        sid: e.sid.clone(),
                        sid_id: lookup_sid(&sid_ids, &e.sid)?,
                        mask: e.mask,
                        granting: e.granting,
                    })
                })
                .collect::<Result<Vec<_>, AclError>>()?;
            let rows = tx.replace_entries(id, &entries).await?;

            let rebuilt = Acl::from_parts(AclParts {
                id: Some(id),
                object_identity: node.object_identity().clone(),
                owner: node.owner().clone(),
                entries: rows.into_iter().map(|row| entry_from_row(id, row)).collect(),
                parent: persisted.take(),
                entries_inheriting: node.is_entries_inheriting(),
            })?;
            persisted = Some(Arc::new(rebuilt));
        }

        let persisted = persisted
            .ok_or_else(|| AclError::InvalidArgument("empty parent chain".to_string()))?;
        let generation = self.cache.generation();
        tx.commit().await?;

        self.publish(generation, &touched, &persisted);

        tracing::info!(
            entries = persisted.entries().len(),
            evicted = touched.len(),
            "acl updated"
        );
        Ok(persisted)
    }

    #[tracing::instrument(skip_all, fields(identity = %identity, delete_children = delete_children))]
    async fn delete_inner(
        &self,
        identity: &ObjectIdentity,
        delete_children: bool,
    ) -> Result<(), AclError> {
        let mut tx = self.store.begin().await?;
        let row = tx
            .find_identity(identity)
            .await?
            .ok_or_else(|| AclError::NotFound(format!("no acl for {identity}")))?;

        if !delete_children && !tx.find_children(row.id).await?.is_empty() {
            return Err(AclError::ChildrenExist(identity.to_string()));
        }

        let subtree = self.delete_subtree(&mut tx, row.id).await?;
        tx.commit().await?;

        self.cache.evict_ids(&subtree);
        self.cache.evict_by_identity(identity);

        tracing::info!(deleted = subtree.len(), "acl deleted");
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(sid = %sid))]
    async fn delete_sid_inner(&self, sid: &Sid) -> Result<(), AclError> {
        let mut tx = self.store.begin().await?;
        let Some(sid_id) = tx.find_sid(sid).await? else {
            tracing::warn!("sid is not known, nothing to delete");
            return Ok(());
        };

        let mut touched = Vec::new();
        let mut deleted = 0usize;
        for owned in tx.find_owned_by(sid_id).await? {
            // An earlier subtree may already have taken this one with it.
            if tx.find_identity(&owned.object_identity).await?.is_none() {
                continue;
            }
            let removed = self.delete_subtree(&mut tx, owned.id).await?;
            deleted += removed.len();
            touched.extend(removed);
        }

        let affected = tx.delete_entries_for_sid(sid_id).await?;
        for id in &affected {
            touched.extend(self.evict_subtree(&mut tx, *id).await?);
        }

        tx.delete_sid(sid_id).await?;
        tx.commit().await?;

        self.cache.evict_ids(&touched);

        tracing::info!(
            deleted_acls = deleted,
            stripped_acls = affected.len(),
            "sid deleted"
        );
        Ok(())
    }

    /// Evicts `ids` after a commit and caches `acl`. `generation` is read just
    /// before the commit; if anything else was evicted since, a later writer
    /// may already have committed over `acl`, so it is left out of the cache.
    fn publish(&self, generation: u64, ids: &[AclId], acl: &Arc<Acl>) {
        let evicted_at = self.cache.evict_ids(ids);
        let cached = evicted_at == generation + 1
            && self.cache.put_if_generation(evicted_at, Arc::clone(acl));
        if !cached {
            tracing::debug!(
                acl = %acl.object_identity(),
                "concurrent eviction, not caching written acl"
            );
        }
    }

    /// Evicts `root` and every descendant from the cache. Returns the ids in
    /// breadth-first order, root first.
    async fn evict_subtree(
        &self,
        tx: &mut S::Transaction,
        root: AclId,
    ) -> Result<Vec<AclId>, AclError> {
        let subtree = collect_subtree(tx, root).await?;
        for id in &subtree {
            self.cache.evict_by_id(*id);
        }
        Ok(subtree)
    }

    /// Deletes `root` and its descendants leaves first. Each node leaves the
    /// cache before its row goes.
    async fn delete_subtree(
        &self,
        tx: &mut S::Transaction,
        root: AclId,
    ) -> Result<Vec<AclId>, AclError> {
        let subtree = collect_subtree(tx, root).await?;
        for id in subtree.iter().rev() {
            self.cache.evict_by_id(*id);
            tx.delete_identity(*id).await?;
            tracing::debug!(acl_id = %id, "acl row deleted");
        }
        Ok(subtree)
    }
}

async fn collect_subtree<T: AclTransaction>(
    tx: &mut T,
    root: AclId,
) -> Result<Vec<AclId>, AclError> {
    let mut ordered = vec![root];
    let mut seen = HashSet::from([root]);
    let mut queue = VecDeque::from([root]);

    while let Some(id) = queue.pop_front() {
        for child in tx.find_children(id).await? {
            if seen.insert(child.id) {
                ordered.push(child.id);
                queue.push_back(child.id);
            }
        }
    }
    Ok(ordered)
}

fn lookup_sid(ids: &HashMap<Sid, SidId>, sid: &Sid) -> Result<SidId, AclError> {
    ids.get(sid)
        .copied()
        .ok_or_else(|| AclError::StoreUnavailable(format!("sid {sid} was not persisted")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hieracl_storage::{AclRow, InMemoryStore, InMemoryTransaction, StorageError};
    use tokio::sync::{Mutex, oneshot};

    /// Parks the next `fetch_acl_rows` after it has read its rows, until the
    /// test releases it.
    #[derive(Default)]
    struct GatedStore {
        inner: InMemoryStore,
        gate: Mutex<Option<(oneshot::Sender<()>, oneshot::Receiver<()>)>>,
    }

    impl GatedStore {
        async fn arm(&self) -> (oneshot::Receiver<()>, oneshot::Sender<()>) {
            let (parked_tx, parked_rx) = oneshot::channel();
            let (release_tx, release_rx) = oneshot::channel();
            *self.gate.lock().await = Some((parked_tx, release_rx));
            (parked_rx, release_tx)
        }
    }

    impl AclStore for GatedStore {
        type Transaction = InMemoryTransaction;

        async fn fetch_acl_rows(
            &self,
            identities: &[ObjectIdentity],
        ) -> Result<Vec<AclRow>, StorageError> {
            let rows = self.inner.fetch_acl_rows(identities).await?;
            let gate = self.gate.lock().await.take();
            if let Some((parked, release)) = gate {
                let _ = parked.send(());
                let _ = release.await;
            }
            Ok(rows)
        }

        async fn fetch_acl_rows_by_id(&self, ids: &[AclId]) -> Result<Vec<AclRow>, StorageError> {
            self.inner.fetch_acl_rows_by_id(ids).await
        }

        async fn ensure_sids(&self, sids: &[Sid]) -> Result<HashMap<Sid, SidId>, StorageError> {
            self.inner.ensure_sids(sids).await
        }

        async fn list_identities(
            &self,
            object_type: &str,
        ) -> Result<Vec<ObjectIdentity>, StorageError> {
            self.inner.list_identities(object_type).await
        }

        async fn begin(&self) -> Result<InMemoryTransaction, StorageError> {
            self.inner.begin().await
        }
    }

    fn oid(id: i64) -> ObjectIdentity {
        ObjectIdentity::new("Dataset", id).unwrap()
    }

    fn alice() -> Sid {
        Sid::principal("alice").unwrap()
    }

    fn bob() -> Sid {
        Sid::principal("bob").unwrap()
    }

    fn make_service() -> (AclService<InMemoryStore>, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let service = AclService::new(
            Arc::clone(&store),
            Arc::new(AclCache::new()),
            Arc::new(StaticPrincipal::new(alice())),
            ServiceConfig::default(),
        );
        (service, store)
    }

    async fn create_child(
        service: &AclService<InMemoryStore>,
        identity: &ObjectIdentity,
        parent: &Arc<Acl>,
    ) -> Arc<Acl> {
        let created = service.create_acl(identity).await.unwrap();
        let mut edited = (*created).clone();
        edited.set_parent(Some(Arc::clone(parent))).unwrap();
        service.update_acl(&edited).await.unwrap()
    }

    #[tokio::test]
    async fn create_acl_uses_current_principal() {
        let (service, _) = make_service();

        let acl = service.create_acl(&oid(1)).await.unwrap();

        assert_eq!(acl.owner(), &alice());
        assert!(acl.is_entries_inheriting());
        assert!(acl.entries().is_empty());
        assert!(acl.id().is_some());
    }

    #[tokio::test]
    async fn create_acl_without_principal_is_invalid() {
        let store = Arc::new(InMemoryStore::new());
        let service = AclService::new(
            store,
            Arc::new(AclCache::new()),
            Arc::new(StaticPrincipal::anonymous()),
            ServiceConfig::default(),
        );

        let result = service.create_acl(&oid(1)).await;

        assert!(matches!(result, Err(AclError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn create_twice_is_already_exists() {
        let (service, _) = make_service();
        service.create_acl(&oid(1)).await.unwrap();

        let result = service.create_object_identity(&oid(1), &bob(), false).await;

        assert!(matches!(result, Err(AclError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn update_without_storage_id_is_invalid() {
        let (service, _) = make_service();
        let unsaved = Acl::new(oid(1), alice());

        let result = service.update_acl(&unsaved).await;

        assert!(matches!(result, Err(AclError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn update_returns_fresh_entries() {
        let (service, _) = make_service();
        let created = service.create_acl(&oid(1)).await.unwrap();

        let mut edited = (*created).clone();
        edited.insert_ace(0, bob(), 0b0010, true).unwrap();
        edited.insert_ace(0, alice(), 0b0001, false).unwrap();
        let updated = service.update_acl(&edited).await.unwrap();

        assert_eq!(updated.entries().len(), 2);
        assert_eq!(updated.entries()[0].sid, alice());
        assert_eq!(updated.entries()[1].order, 1);
        assert!(updated.entries().iter().all(|e| e.id.is_some()));

        service.clear_cache();
        let reloaded = service.read_acl_by_id(&oid(1), &[]).await.unwrap();
        assert_eq!(reloaded, updated);
    }

    #[tokio::test]
    async fn alice_grant_on_parent_visible_through_child() {
        let (service, _) = make_service();

        // 1. A owned by alice, no parent
        let a = service.create_object_identity(&oid(1), &alice(), true).await.unwrap();

        // 2. B owned by bob, parent A
        let b = service.create_object_identity(&oid(2), &bob(), true).await.unwrap();
        let mut b_edit = (*b).clone();
        b_edit.set_parent(Some(Arc::clone(&a))).unwrap();
        service.update_acl(&b_edit).await.unwrap();

        // 3. Grant alice 0b0001 on A
        let mut a_edit = (*a).clone();
        a_edit.insert_ace(0, alice(), 0b0001, true).unwrap();
        service.update_acl(&a_edit).await.unwrap();

        // 4. Load B
        let loaded = service.read_acls_by_id(&[oid(2)], &[]).await.unwrap();

        let b = &loaded[&oid(2)];
        assert!(b.entries().is_empty());
        assert_eq!(b.owner(), &bob());
        let parent_entries = b.parent().unwrap().entries();
        assert_eq!(parent_entries.len(), 1);
        assert_eq!(parent_entries[0].sid, alice());
        assert_eq!(parent_entries[0].mask, 0b0001);
        assert!(parent_entries[0].granting);
    }

    #[tokio::test]
    async fn delete_with_children_requires_flag() {
        let (service, _) = make_service();
        let root = service.create_acl(&oid(1)).await.unwrap();
        create_child(&service, &oid(2), &root).await;

        let refused = service.delete_acl(&oid(1), false).await;
        assert!(matches!(refused, Err(AclError::ChildrenExist(_))));

        service.delete_acl(&oid(1), true).await.unwrap();

        let gone = service.read_acl_by_id(&oid(2), &[]).await;
        assert!(matches!(gone, Err(AclError::NotFound(_))));
        assert_eq!(service.cache_stats().entries, 0);
    }

    #[tokio::test]
    async fn delete_unknown_is_not_found() {
        let (service, _) = make_service();

        let result = service.delete_acl(&oid(9), true).await;

        assert!(matches!(result, Err(AclError::NotFound(_))));
    }

    #[tokio::test]
    async fn delete_unknown_sid_is_noop() {
        let (service, _) = make_service();

        service.delete_sid(&Sid::principal("nobody").unwrap()).await.unwrap();
    }

    #[tokio::test]
    async fn delete_sid_removes_owned_acls_and_entries() {
        let (service, store) = make_service();
        let a = service.create_object_identity(&oid(1), &alice(), true).await.unwrap();
        service.create_object_identity(&oid(2), &bob(), true).await.unwrap();
        let mut a_edit = (*a).clone();
        a_edit.insert_ace(0, bob(), 0b0100, true).unwrap();
        service.update_acl(&a_edit).await.unwrap();

        service.delete_sid(&bob()).await.unwrap();

        let a = service.read_acl_by_id(&oid(1), &[]).await.unwrap();
        assert!(a.entries().is_empty());
        let b = service.read_acl_by_id(&oid(2), &[]).await;
        assert!(matches!(b, Err(AclError::NotFound(_))));
        assert_eq!(store.sid_count().await, 1);
    }

    #[tokio::test]
    async fn delete_sid_entry_on_root_reloads_cached_descendants() {
        let (service, store) = make_service();
        let root = service.create_acl(&oid(1)).await.unwrap();
        let mut root_edit = (*root).clone();
        root_edit.insert_ace(0, bob(), 0b0010, true).unwrap();
        let root = service.update_acl(&root_edit).await.unwrap();
        let mid = create_child(&service, &oid(2), &root).await;
        create_child(&service, &oid(3), &mid).await;

        // 1. Warm the grandchild
        let warm = service.read_acl_by_id(&oid(3), &[]).await.unwrap();
        assert_eq!(warm.ancestors().last().unwrap().entries().len(), 1);

        // 2. Bob only appears on the root
        service.delete_sid(&bob()).await.unwrap();

        // 3. The grandchild must come from the store again
        store.reset_round_trips();
        let reread = service.read_acl_by_id(&oid(3), &[]).await.unwrap();

        assert!(store.round_trips() > 0, "grandchild served from a stale cache");
        assert!(reread.ancestors().last().unwrap().entries().is_empty());
    }

    #[tokio::test]
    async fn delete_sid_takes_owned_subtree_with_foreign_owned_children() {
        let (service, store) = make_service();
        let root = service.create_object_identity(&oid(1), &bob(), true).await.unwrap();
        let child = create_child(&service, &oid(2), &root).await;
        create_child(&service, &oid(3), &child).await;
        assert_eq!(child.owner(), &alice());

        service.read_acl_by_id(&oid(3), &[]).await.unwrap();

        service.delete_sid(&bob()).await.unwrap();

        for identifier in 1..=3 {
            let gone = service.read_acl_by_id(&oid(identifier), &[]).await;
            assert!(matches!(gone, Err(AclError::NotFound(_))), "Dataset:{identifier}");
        }
        assert!(service.list_identities("Dataset").await.unwrap().is_empty());
        assert_eq!(store.sid_count().await, 1);
    }

    #[tokio::test]
    async fn read_racing_an_update_does_not_cache_stale_acl() {
        let store = Arc::new(GatedStore::default());
        let service = Arc::new(AclService::new(
            Arc::clone(&store),
            Arc::new(AclCache::new()),
            Arc::new(StaticPrincipal::new(alice())),
            ServiceConfig::default(),
        ));
        let created = service.create_acl(&oid(1)).await.unwrap();
        service.clear_cache();

        // 1. A reader fetches the empty row and stalls before caching it
        let (parked, release) = store.arm().await;
        let reader = tokio::spawn({
            let service = Arc::clone(&service);
            async move { service.read_acl_by_id(&oid(1), &[]).await }
        });
        parked.await.unwrap();

        // 2. A writer commits a grant meanwhile
        let mut edited = (*created).clone();
        edited.insert_ace(0, bob(), 0b0001, true).unwrap();
        service.update_acl(&edited).await.unwrap();

        // 3. The reader finishes with its pre-update snapshot
        release.send(()).unwrap();
        let snapshot = reader.await.unwrap().unwrap();
        assert!(snapshot.entries().is_empty());

        // 4. Later reads see the committed grant
        let reread = service.read_acl_by_id(&oid(1), &[]).await.unwrap();
        assert_eq!(reread.entries().len(), 1);
        assert_eq!(reread.entries()[0].sid, bob());
    }

    #[tokio::test]
    async fn find_children_lists_direct_children_only() {
        let (service, _) = make_service();
        let root = service.create_acl(&oid(1)).await.unwrap();
        let child = create_child(&service, &oid(2), &root).await;
        create_child(&service, &oid(3), &child).await;

        let children = service.find_children(&oid(1)).await.unwrap();

        assert_eq!(children, vec![oid(2)]);
    }

    #[tokio::test]
    async fn find_children_of_unknown_is_not_found() {
        let (service, _) = make_service();

        let result = service.find_children(&oid(1)).await;

        assert!(matches!(result, Err(AclError::NotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn operation_timeout_maps_to_store_unavailable() {
        let store = Arc::new(InMemoryStore::new());
        let service = AclService::new(
            Arc::clone(&store),
            Arc::new(AclCache::new()),
            Arc::new(StaticPrincipal::new(alice())),
            ServiceConfig {
                operation_timeout: Some(Duration::from_millis(50)),
                ..ServiceConfig::default()
            },
        );
        service.create_acl(&oid(1)).await.unwrap();

        // Holding a transaction keeps the in-memory store locked.
        let held = store.begin().await.unwrap();
        let result = service.delete_acl(&oid(1), false).await;
        drop(held);

        assert!(
            matches!(result, Err(AclError::StoreUnavailable(ref msg)) if msg.contains("timed out"))
        );
        service.read_acl_by_id(&oid(1), &[]).await.unwrap();
    }

    #[tokio::test]
    async fn cache_stats_track_hits() {
        let (service, _) = make_service();
        service.create_acl(&oid(1)).await.unwrap();

        service.read_acl_by_id(&oid(1), &[]).await.unwrap();
        let report = service.cache_stats();

        assert_eq!(report.entries, 1);
        assert_eq!(report.hits, 1);

        service.clear_cache();
        assert_eq!(service.cache_stats().entries, 0);
    }
}
