use std::fmt;
use std::sync::Arc;

use crate::error::ModelError;
use crate::identity::{AclId, EntryId, ObjectIdentity, Sid};

/// One grant or denial of a permission mask to a sid, within one ACL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessControlEntry {
    pub id: Option<EntryId>,
    /// Storage id of the owning ACL, once it has one.
    pub acl_id: Option<AclId>,
    pub sid: Sid,
    pub mask: i32,
    pub granting: bool,
    pub order: i32,
}

impl AccessControlEntry {
    pub fn new(sid: Sid, mask: i32, granting: bool) -> Self {
        Self {
            id: None,
            acl_id: None,
            sid,
            mask,
            granting,
            order: 0,
        }
    }
}

impl fmt::Display for AccessControlEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = if self.granting { "grant" } else { "deny" };
        write!(f, "#{} {verb} {:#b} to {}", self.order, self.mask, self.sid)
    }
}

/// Everything needed to assemble an [`Acl`]; used by stores and the loader.
#[derive(Debug, Clone)]
pub struct AclParts {
    pub id: Option<AclId>,
    pub object_identity: ObjectIdentity,
    pub owner: Sid,
    pub entries: Vec<AccessControlEntry>,
    pub parent: Option<Arc<Acl>>,
    pub entries_inheriting: bool,
}

/// The permission set of one object identity.
///
/// Resolved ACLs are shared as `Arc<Acl>` and never mutated in place; callers
/// clone one, edit the clone and hand it to the mutation service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acl {
    id: Option<AclId>,
    object_identity: ObjectIdentity,
    owner: Sid,
    entries: Vec<AccessControlEntry>,
    parent: Option<Arc<Acl>>,
    entries_inheriting: bool,
}

impl Acl {
    /// A bare, unsaved ACL: no entries, no parent, inheriting.
    pub fn new(object_identity: ObjectIdentity, owner: Sid) -> Self {
        Self {
            id: None,
            object_identity,
            owner,
            entries: Vec::new(),
            parent: None,
            entries_inheriting: true,
        }
    }

    pub fn from_parts(parts: AclParts) -> Result<Self, ModelError> {
        let AclParts {
            id,
            object_identity,
            owner,
            mut entries,
            parent,
            entries_inheriting,
        } = parts;

        if chain_contains(parent.as_deref(), &object_identity) {
            return Err(ModelError::CyclicParent(object_identity));
        }

        entries.sort_by_key(|e| e.order);
        if let Some(pair) = entries.windows(2).find(|w| w[0].order == w[1].order) {
            return Err(ModelError::DuplicateOrder(pair[0].order));
        }
        for entry in &mut entries {
            entry.acl_id = id;
        }

        Ok(Self {
            id,
            object_identity,
            owner,
            entries,
            parent,
            entries_inheriting,
        })
    }

    pub fn id(&self) -> Option<AclId> {
        self.id
    }

    pub fn object_identity(&self) -> &ObjectIdentity {
        &self.object_identity
    }

    pub fn owner(&self) -> &Sid {
        &self.owner
    }

    pub fn entries(&self) -> &[AccessControlEntry] {
        &self.entries
    }

    pub fn parent(&self) -> Option<&Arc<Acl>> {
        self.parent.as_ref()
    }

    pub fn is_entries_inheriting(&self) -> bool {
        self.entries_inheriting
    }

    /// Parent, grandparent, ... up to the root.
    pub fn ancestors(&self) -> Ancestors<'_> {
        Ancestors {
            next: self.parent.as_deref(),
        }
    }

    pub fn insert_ace(
        &mut self,
        index: usize,
        sid: Sid,
        mask: i32,
        granting: bool,
    ) -> Result<(), ModelError> {
        if index > self.entries.len() {
            return Err(ModelError::IndexOutOfBounds {
                index,
                len: self.entries.len(),
            });
        }
        let mut entry = AccessControlEntry::new(sid, mask, granting);
        entry.acl_id = self.id;
        self.entries.insert(index, entry);
        self.renumber();
        Ok(())
    }

    pub fn update_ace(&mut self, index: usize, mask: i32) -> Result<(), ModelError> {
        let len = self.entries.len();
        let entry = self
            .entries
            .get_mut(index)
            .ok_or(ModelError::IndexOutOfBounds { index, len })?;
        entry.mask = mask;
        Ok(())
    }

    pub fn delete_ace(&mut self, index: usize) -> Result<AccessControlEntry, ModelError> {
        if index >= self.entries.len() {
            return Err(ModelError::IndexOutOfBounds {
                index,
                len: self.entries.len(),
            });
        }
        let removed = self.entries.remove(index);
        self.renumber();
        Ok(removed)
    }

    pub fn set_owner(&mut self, owner: Sid) {
        self.owner = owner;
    }

    pub fn set_entries_inheriting(&mut self, entries_inheriting: bool) {
        self.entries_inheriting = entries_inheriting;
    }

    pub fn set_parent(&mut self, parent: Option<Arc<Acl>>) -> Result<(), ModelError> {
        if chain_contains(parent.as_deref(), &self.object_identity) {
            return Err(ModelError::CyclicParent(self.object_identity.clone()));
        }
        self.parent = parent;
        Ok(())
    }

    // Unsaved entries take their list position as order; the store assigns the
    // same positions when the ACL is persisted.
    fn renumber(&mut self) {
        for (position, entry) in self.entries.iter_mut().enumerate() {
            entry.order = position as i32;
        }
    }
}

impl fmt::Display for Acl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Acl[{} owner={}", self.object_identity, self.owner)?;
        if let Some(ref parent) = self.parent {
            write!(f, " parent={}", parent.object_identity)?;
        }
        write!(f, " entries={}]", self.entries.len())
    }
}

pub struct Ancestors<'a> {
    next: Option<&'a Acl>,
}

impl<'a> Iterator for Ancestors<'a> {
    type Item = &'a Acl;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = current.parent.as_deref();
        Some(current)
    }
}

fn chain_contains(start: Option<&Acl>, identity: &ObjectIdentity) -> bool {
    let mut node = start;
    while let Some(acl) = node {
        if &acl.object_identity == identity {
            return true;
        }
        node = acl.parent.as_deref();
    }
    false
}
