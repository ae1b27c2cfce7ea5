use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use hieracl_core::{AccessControlEntry, Acl, AclCache, AclId, AclParts, ObjectIdentity, Sid};
use hieracl_storage::{AclRow, AclStore, EntryRow};

use crate::error::AclError;

pub const DEFAULT_BATCH_SIZE: usize = 50;

pub(crate) fn entry_from_row(acl_id: AclId, row: EntryRow) -> AccessControlEntry {
    AccessControlEntry {
        id: Some(row.id),
        acl_id: Some(acl_id),
        sid: row.sid,
        mask: row.mask,
        granting: row.granting,
        order: row.order,
    }
}

/// Resolves ACLs with their full parent chains.
///
/// Requested identities are served from the cache where possible; misses are
/// fetched in chunks of `batch_size`, then missing ancestors are fetched one
/// level at a time. Each storage id is fetched at most once per call.
pub struct AclLoader<S> {
    store: Arc<S>,
    cache: Arc<AclCache>,
    batch_size: usize,
}

impl<S: AclStore> AclLoader<S> {
    pub fn new(store: Arc<S>, cache: Arc<AclCache>, batch_size: usize) -> Self {
        Self {
            store,
            cache,
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// `sids` is accepted for callers that know which principals they will
    /// evaluate; every entry is loaded regardless.
    pub async fn load(
        &self,
        identities: &[ObjectIdentity],
        _sids: &[Sid],
    ) -> Result<HashMap<ObjectIdentity, Arc<Acl>>, AclError> {
        if identities.is_empty() {
            return Err(AclError::InvalidArgument(
                "at least one object identity is required".to_string(),
            ));
        }

        // Anything evicted after this point may be newer in the store than in
        // the rows fetched below.
        let generation = self.cache.generation();
        let requested: BTreeSet<&ObjectIdentity> = identities.iter().collect();
        let mut result = HashMap::with_capacity(requested.len());
        let mut misses = Vec::new();

        for identity in requested {
            match self.cache.get_by_identity(identity) {
                Some(acl) => {
                    result.insert(identity.clone(), acl);
                }
                None => misses.push(identity.clone()),
            }
        }

        if misses.is_empty() {
            return Ok(result);
        }

        let mut shells: HashMap<AclId, AclRow> = HashMap::new();
        let mut built: HashMap<AclId, Arc<Acl>> = HashMap::new();
        let mut ids_by_identity: HashMap<ObjectIdentity, AclId> = HashMap::new();

        for chunk in misses.chunks(self.batch_size) {
            for row in self.store.fetch_acl_rows(chunk).await? {
                ids_by_identity.insert(row.object_identity.clone(), row.id);
                shells.insert(row.id, row);
            }
        }

        if let Some(missing) = misses.iter().find(|i| !ids_by_identity.contains_key(*i)) {
            return Err(AclError::NotFound(format!("no acl for {missing}")));
        }

        let mut visited: HashSet<AclId> = shells.keys().copied().collect();
        let mut frontier = self.next_frontier(shells.values(), &shells, &mut built, &visited);
        let mut level = 0usize;

        while !frontier.is_empty() {
            level += 1;
            tracing::debug!(level, parents = frontier.len(), "resolving parent level");

            let wanted: Vec<AclId> = frontier.into_iter().collect();
            visited.extend(wanted.iter().copied());

            let mut fetched = Vec::new();
            for chunk in wanted.chunks(self.batch_size) {
                fetched.extend(self.store.fetch_acl_rows_by_id(chunk).await?);
            }

            if let Some(missing) = wanted.iter().find(|id| !fetched.iter().any(|r| r.id == **id)) {
                return Err(AclError::NotFound(format!("parent acl {missing}")));
            }

            let new_ids: Vec<AclId> = fetched.iter().map(|r| r.id).collect();
            for row in fetched {
                shells.insert(row.id, row);
            }
            frontier = self.next_frontier(
                new_ids.iter().filter_map(|id| shells.get(id)),
                &shells,
                &mut built,
                &visited,
            );
        }

        let mut fresh = Vec::new();
        for identity in &misses {
            if let Some(&id) = ids_by_identity.get(identity) {
                let acl = link(id, &shells, &mut built, &mut fresh)?;
                result.insert(identity.clone(), acl);
            }
        }

        for acl in fresh {
            if !self.cache.put_if_generation(generation, acl) {
                tracing::debug!(generation, "cache evicted during load, not caching");
                break;
            }
        }

        tracing::debug!(
            requested = identities.len(),
            fetched = shells.len(),
            levels = level,
            "acls loaded"
        );
        Ok(result)
    }

    /// Parent ids of `rows` that still need a store fetch. Parents found in
    /// the cache are moved straight into `built`.
    fn next_frontier<'a>(
        &self,
        rows: impl Iterator<Item = &'a AclRow>,
        shells: &HashMap<AclId, AclRow>,
        built: &mut HashMap<AclId, Arc<Acl>>,
        visited: &HashSet<AclId>,
    ) -> BTreeSet<AclId> {
        let mut frontier = BTreeSet::new();
        for parent_id in rows.filter_map(|r| r.parent_id) {
            if shells.contains_key(&parent_id)
                || built.contains_key(&parent_id)
                || visited.contains(&parent_id)
            {
                continue;
            }
            match self.cache.get_by_id(parent_id) {
                Some(cached) => {
                    built.insert(parent_id, cached);
                }
                None => {
                    frontier.insert(parent_id);
                }
            }
        }
        frontier
    }
}

/// Builds the ACL for `id`, building any unbuilt ancestors first. Newly built
/// ACLs are appended to `fresh` root first.
fn link(
    id: AclId,
    shells: &HashMap<AclId, AclRow>,
    built: &mut HashMap<AclId, Arc<Acl>>,
    fresh: &mut Vec<Arc<Acl>>,
) -> Result<Arc<Acl>, AclError> {
    let mut path = Vec::new();
    let mut on_path = HashSet::new();
    let mut cursor = Some(id);

    while let Some(current) = cursor {
        if built.contains_key(&current) {
            break;
        }
        if !on_path.insert(current) {
            return Err(AclError::InvalidArgument(format!(
                "parent chain of acl {id} loops back to acl {current}"
            )));
        }
        let row = shells
            .get(&current)
            .ok_or_else(|| AclError::NotFound(format!("parent acl {current}")))?;
        path.push(row);
        cursor = row.parent_id;
    }

    for row in path.into_iter().rev() {
        let parent = match row.parent_id {
            Some(parent_id) => Some(
                built
                    .get(&parent_id)
                    .cloned()
                    .ok_or_else(|| AclError::NotFound(format!("parent acl {parent_id}")))?,
            ),
            None => None,
        };
        let acl = Arc::new(Acl::from_parts(AclParts {
            id: Some(row.id),
            object_identity: row.object_identity.clone(),
            owner: row.owner.clone(),
            entries: row
                .entries
                .iter()
                .cloned()
                .map(|e| entry_from_row(row.id, e))
                .collect(),
            parent,
            entries_inheriting: row.entries_inheriting,
        })?);
        built.insert(row.id, Arc::clone(&acl));
        fresh.push(acl);
    }

    built
        .get(&id)
        .cloned()
        .ok_or_else(|| AclError::NotFound(format!("acl {id}")))
}
