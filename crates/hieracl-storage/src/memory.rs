use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, OwnedMutexGuard};

use hieracl_core::{AclId, EntryId, ObjectIdentity, Sid, SidId};

use crate::traits::{
    AclRow, AclStore, AclTransaction, EntryRow, IdentityRow, NewEntry, StorageError,
};

#[derive(Debug, Clone)]
struct StoredIdentity {
    object_identity: ObjectIdentity,
    owner: SidId,
    parent: Option<AclId>,
    entries_inheriting: bool,
}

impl StoredIdentity {
    fn to_row(&self, id: AclId) -> IdentityRow {
        IdentityRow {
            id,
            object_identity: self.object_identity.clone(),
            owner_sid_id: self.owner,
            parent_id: self.parent,
            entries_inheriting: self.entries_inheriting,
        }
    }
}

#[derive(Debug, Clone)]
struct StoredEntry {
    acl: AclId,
    sid: SidId,
    mask: i32,
    granting: bool,
    order: i32,
}

#[derive(Debug, Clone, Default)]
struct Tables {
    last_acl_id: i64,
    last_entry_id: i64,
    last_sid_id: i64,
    sids: BTreeMap<SidId, Sid>,
    identities: BTreeMap<AclId, StoredIdentity>,
    entries: BTreeMap<EntryId, StoredEntry>,
}

impl Tables {
    fn sid_id(&self, sid: &Sid) -> Option<SidId> {
        self.sids
            .iter()
            .find_map(|(id, stored)| (stored == sid).then_some(*id))
    }

    fn sid(&self, id: SidId) -> Result<&Sid, StorageError> {
        self.sids
            .get(&id)
            .ok_or_else(|| StorageError::Internal(format!("dangling sid reference {}", id.value())))
    }

    fn identity_id(&self, identity: &ObjectIdentity) -> Option<AclId> {
        self.identities
            .iter()
            .find_map(|(id, stored)| (&stored.object_identity == identity).then_some(*id))
    }

    fn entry_rows(&self, acl: AclId) -> Result<Vec<EntryRow>, StorageError> {
        let mut rows = self
            .entries
            .iter()
            .filter(|(_, e)| e.acl == acl)
            .map(|(id, e)| {
                Ok(EntryRow {
                    id: *id,
                    sid: self.sid(e.sid)?.clone(),
                    mask: e.mask,
                    granting: e.granting,
                    order: e.order,
                })
            })
            .collect::<Result<Vec<_>, StorageError>>()?;
        rows.sort_by_key(|r| r.order);
        Ok(rows)
    }

    fn acl_row(&self, id: AclId) -> Result<Option<AclRow>, StorageError> {
        let Some(stored) = self.identities.get(&id) else {
            return Ok(None);
        };
        Ok(Some(AclRow {
            id,
            object_identity: stored.object_identity.clone(),
            owner: self.sid(stored.owner)?.clone(),
            parent_id: stored.parent,
            entries_inheriting: stored.entries_inheriting,
            entries: self.entry_rows(id)?,
        }))
    }

    fn require_sid(&self, id: SidId) -> Result<(), StorageError> {
        self.sid(id).map(|_| ())
    }

    fn require_identity(&self, id: AclId) -> Result<(), StorageError> {
        if self.identities.contains_key(&id) {
            Ok(())
        } else {
            Err(StorageError::NotFound(format!("acl {id}")))
        }
    }
}

/// Store kept entirely in memory, with the same transactional behaviour as
/// the PostgreSQL store: one writer at a time, rollback on drop.
///
/// Every fetch counts as one round trip, which lets tests observe batching.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<Mutex<Tables>>,
    round_trips: Arc<AtomicUsize>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn round_trips(&self) -> usize {
        self.round_trips.load(Ordering::SeqCst)
    }

    pub fn reset_round_trips(&self) {
        self.round_trips.store(0, Ordering::SeqCst);
    }

    pub async fn sid_count(&self) -> usize {
        self.tables.lock().await.sids.len()
    }

    pub async fn entry_count(&self) -> usize {
        self.tables.lock().await.entries.len()
    }
}

impl AclStore for InMemoryStore {
    type Transaction = InMemoryTransaction;

    async fn fetch_acl_rows(
        &self,
        identities: &[ObjectIdentity],
    ) -> Result<Vec<AclRow>, StorageError> {
        self.round_trips.fetch_add(1, Ordering::SeqCst);
        let tables = self.tables.lock().await;

        let mut rows = Vec::new();
        for identity in identities {
            if let Some(id) = tables.identity_id(identity)
                && let Some(row) = tables.acl_row(id)?
            {
                rows.push(row);
            }
        }
        rows.sort_by_key(|r| (r.object_identity.identifier(), r.id));
        rows.dedup_by_key(|r| r.id);
        Ok(rows)
    }

    async fn fetch_acl_rows_by_id(&self, ids: &[AclId]) -> Result<Vec<AclRow>, StorageError> {
        self.round_trips.fetch_add(1, Ordering::SeqCst);
        let tables = self.tables.lock().await;

        let mut rows = Vec::new();
        for id in ids {
            if let Some(row) = tables.acl_row(*id)? {
                rows.push(row);
            }
        }
        rows.sort_by_key(|r| r.id);
        rows.dedup_by_key(|r| r.id);
        Ok(rows)
    }

    async fn ensure_sids(&self, sids: &[Sid]) -> Result<HashMap<Sid, SidId>, StorageError> {
        let mut tables = self.tables.lock().await;

        let mut ids = HashMap::with_capacity(sids.len());
        for sid in sids {
            let id = match tables.sid_id(sid) {
                Some(id) => id,
                None => {
                    tables.last_sid_id += 1;
                    let id = SidId::new(tables.last_sid_id);
                    tables.sids.insert(id, sid.clone());
                    id
                }
            };
            ids.insert(sid.clone(), id);
        }
        Ok(ids)
    }

    async fn list_identities(&self, object_type: &str) -> Result<Vec<ObjectIdentity>, StorageError> {
        let tables = self.tables.lock().await;
        let mut identities: Vec<ObjectIdentity> = tables
            .identities
            .values()
            .filter(|s| s.object_identity.object_type() == object_type)
            .map(|s| s.object_identity.clone())
            .collect();
        identities.sort();
        Ok(identities)
    }

    async fn begin(&self) -> Result<InMemoryTransaction, StorageError> {
        let guard = Arc::clone(&self.tables).lock_owned().await;
        let working = guard.clone();
        Ok(InMemoryTransaction { guard, working })
    }
}

/// Holds the store lock for its whole lifetime and edits a private copy of
/// the tables, published on commit.
#[derive(Debug)]
pub struct InMemoryTransaction {
    guard: OwnedMutexGuard<Tables>,
    working: Tables,
}

impl AclTransaction for InMemoryTransaction {
    async fn find_identity(
        &mut self,
        identity: &ObjectIdentity,
    ) -> Result<Option<IdentityRow>, StorageError> {
        Ok(self
            .working
            .identity_id(identity)
            .and_then(|id| self.working.identities.get(&id).map(|s| s.to_row(id))))
    }

    async fn find_sid(&mut self, sid: &Sid) -> Result<Option<SidId>, StorageError> {
        Ok(self.working.sid_id(sid))
    }

    async fn insert_identity(
        &mut self,
        identity: &ObjectIdentity,
        owner: SidId,
        parent: Option<AclId>,
        entries_inheriting: bool,
    ) -> Result<AclId, StorageError> {
        if self.working.identity_id(identity).is_some() {
            return Err(StorageError::Duplicate(identity.to_string()));
        }
        self.working.require_sid(owner)?;
        if let Some(parent) = parent {
            self.working.require_identity(parent)?;
        }

        self.working.last_acl_id += 1;
        let id = AclId::new(self.working.last_acl_id);
        self.working.identities.insert(
            id,
            StoredIdentity {
                object_identity: identity.clone(),
                owner,
                parent,
                entries_inheriting,
            },
        );
        Ok(id)
    }

    async fn update_identity(
        &mut self,
        id: AclId,
        owner: SidId,
        parent: Option<AclId>,
        entries_inheriting: bool,
    ) -> Result<(), StorageError> {
        self.working.require_sid(owner)?;
        if let Some(parent) = parent {
            self.working.require_identity(parent)?;
        }
        let stored = self
            .working
            .identities
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("acl {id}")))?;
        stored.owner = owner;
        stored.parent = parent;
        stored.entries_inheriting = entries_inheriting;
        Ok(())
    }

    async fn replace_entries(
        &mut self,
        id: AclId,
        entries: &[NewEntry],
    ) -> Result<Vec<EntryRow>, StorageError> {
        self.working.require_identity(id)?;
        for entry in entries {
            self.working.require_sid(entry.sid_id)?;
        }

        let mut existing: HashMap<i32, EntryId> = self
            .working
            .entries
            .iter()
            .filter(|(_, e)| e.acl == id)
            .map(|(entry_id, e)| (e.order, *entry_id))
            .collect();

        let mut rows = Vec::with_capacity(entries.len());
        for (position, entry) in entries.iter().enumerate() {
            let order = position as i32;
            let entry_id = match existing.remove(&order) {
                Some(entry_id) => entry_id,
                None => {
                    self.working.last_entry_id += 1;
                    EntryId::new(self.working.last_entry_id)
                }
            };
            self.working.entries.insert(
                entry_id,
                StoredEntry {
                    acl: id,
                    sid: entry.sid_id,
                    mask: entry.mask,
                    granting: entry.granting,
                    order,
                },
            );
            rows.push(EntryRow {
                id: entry_id,
                sid: entry.sid.clone(),
                mask: entry.mask,
                granting: entry.granting,
                order,
            });
        }

        for (_, stale) in existing {
            self.working.entries.remove(&stale);
        }
        Ok(rows)
    }

    async fn find_children(&mut self, id: AclId) -> Result<Vec<IdentityRow>, StorageError> {
        Ok(self
            .working
            .identities
            .iter()
            .filter(|(_, s)| s.parent == Some(id))
            .map(|(child, s)| s.to_row(*child))
            .collect())
    }

    async fn delete_identity(&mut self, id: AclId) -> Result<(), StorageError> {
        self.working.require_identity(id)?;
        if self
            .working
            .identities
            .values()
            .any(|s| s.parent == Some(id))
        {
            return Err(StorageError::Internal(format!(
                "acl {id} is still referenced as a parent"
            )));
        }
        self.working.entries.retain(|_, e| e.acl != id);
        self.working.identities.remove(&id);
        Ok(())
    }

    async fn find_owned_by(&mut self, sid: SidId) -> Result<Vec<IdentityRow>, StorageError> {
        Ok(self
            .working
            .identities
            .iter()
            .filter(|(_, s)| s.owner == sid)
            .map(|(id, s)| s.to_row(*id))
            .collect())
    }

    async fn delete_entries_for_sid(&mut self, sid: SidId) -> Result<Vec<AclId>, StorageError> {
        let mut affected: Vec<AclId> = self
            .working
            .entries
            .values()
            .filter(|e| e.sid == sid)
            .map(|e| e.acl)
            .collect();
        affected.sort();
        affected.dedup();

        self.working.entries.retain(|_, e| e.sid != sid);
        Ok(affected)
    }

    async fn delete_sid(&mut self, sid: SidId) -> Result<(), StorageError> {
        let in_use = self.working.identities.values().any(|s| s.owner == sid)
            || self.working.entries.values().any(|e| e.sid == sid);
        if in_use {
            return Err(StorageError::Internal(format!(
                "sid {} is still referenced",
                sid.value()
            )));
        }
        self.working
            .sids
            .remove(&sid)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(format!("sid {}", sid.value())))
    }

    async fn commit(self) -> Result<(), StorageError> {
        let InMemoryTransaction { mut guard, working } = self;
        *guard = working;
        Ok(())
    }
}
