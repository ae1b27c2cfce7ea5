use std::collections::HashMap;

use hieracl_core::{AclId, EntryId, ObjectIdentity, Sid, SidId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    Duplicate(String),
    #[error("internal storage error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryRow {
    pub id: EntryId,
    pub sid: Sid,
    pub mask: i32,
    pub granting: bool,
    pub order: i32,
}

/// One stored ACL with its entries, sorted by order. The parent is only named
/// by storage id; linking is the loader's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclRow {
    pub id: AclId,
    pub object_identity: ObjectIdentity,
    pub owner: Sid,
    pub parent_id: Option<AclId>,
    pub entries_inheriting: bool,
    pub entries: Vec<EntryRow>,
}

/// Object identity row without entries, for structural lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRow {
    pub id: AclId,
    pub object_identity: ObjectIdentity,
    pub owner_sid_id: SidId,
    pub parent_id: Option<AclId>,
    pub entries_inheriting: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEntry {
    pub sid: Sid,
    pub sid_id: SidId,
    pub mask: i32,
    pub granting: bool,
}

/// Read side and transaction factory of an ACL store.
///
/// Reads run outside any caller transaction. `ensure_sids` commits on its
/// own, so callers run it before opening the transaction that writes entry
/// rows referencing those sids.
pub trait AclStore: Send + Sync {
    type Transaction: AclTransaction;

    /// One round trip for all `identities`. Unknown identities are skipped.
    fn fetch_acl_rows(
        &self,
        identities: &[ObjectIdentity],
    ) -> impl Future<Output = Result<Vec<AclRow>, StorageError>> + Send;

    /// One round trip for all `ids`. Unknown ids are skipped.
    fn fetch_acl_rows_by_id(
        &self,
        ids: &[AclId],
    ) -> impl Future<Output = Result<Vec<AclRow>, StorageError>> + Send;

    /// Find-or-create by value equality.
    fn ensure_sids(
        &self,
        sids: &[Sid],
    ) -> impl Future<Output = Result<HashMap<Sid, SidId>, StorageError>> + Send;

    fn list_identities(
        &self,
        object_type: &str,
    ) -> impl Future<Output = Result<Vec<ObjectIdentity>, StorageError>> + Send;

    fn begin(&self) -> impl Future<Output = Result<Self::Transaction, StorageError>> + Send;
}

/// A unit of work. Dropping it without `commit` rolls everything back.
pub trait AclTransaction: Send {
    fn find_identity(
        &mut self,
        identity: &ObjectIdentity,
    ) -> impl Future<Output = Result<Option<IdentityRow>, StorageError>> + Send;

    fn find_sid(
        &mut self,
        sid: &Sid,
    ) -> impl Future<Output = Result<Option<SidId>, StorageError>> + Send;

    fn insert_identity(
        &mut self,
        identity: &ObjectIdentity,
        owner: SidId,
        parent: Option<AclId>,
        entries_inheriting: bool,
    ) -> impl Future<Output = Result<AclId, StorageError>> + Send;

    fn update_identity(
        &mut self,
        id: AclId,
        owner: SidId,
        parent: Option<AclId>,
        entries_inheriting: bool,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Rewrites the entry rows of `id` in place: position `i` of `entries`
    /// lands on order `i`, existing rows at that order are updated rather than
    /// deleted and re-inserted, and rows past the new length are removed.
    fn replace_entries(
        &mut self,
        id: AclId,
        entries: &[NewEntry],
    ) -> impl Future<Output = Result<Vec<EntryRow>, StorageError>> + Send;

    fn find_children(
        &mut self,
        id: AclId,
    ) -> impl Future<Output = Result<Vec<IdentityRow>, StorageError>> + Send;

    /// Deletes the identity and its entries. Fails while children reference it.
    fn delete_identity(&mut self, id: AclId)
    -> impl Future<Output = Result<(), StorageError>> + Send;

    fn find_owned_by(
        &mut self,
        sid: SidId,
    ) -> impl Future<Output = Result<Vec<IdentityRow>, StorageError>> + Send;

    /// Returns the ids of the ACLs that lost entries.
    fn delete_entries_for_sid(
        &mut self,
        sid: SidId,
    ) -> impl Future<Output = Result<Vec<AclId>, StorageError>> + Send;

    fn delete_sid(&mut self, sid: SidId) -> impl Future<Output = Result<(), StorageError>> + Send;

    fn commit(self) -> impl Future<Output = Result<(), StorageError>> + Send;
}
