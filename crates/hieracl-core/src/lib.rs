pub mod acl;
pub mod cache;
pub mod error;
pub mod identity;

pub use acl::{AccessControlEntry, Acl, AclParts, Ancestors};
pub use cache::{AclCache, CacheStats};
pub use error::ModelError;
pub use identity::{AclId, EntryId, ObjectIdentity, Securable, Sid, SidId, SidName};
