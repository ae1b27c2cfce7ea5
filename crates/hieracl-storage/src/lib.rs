pub mod memory;
pub mod postgres;
pub mod traits;

pub use memory::{InMemoryStore, InMemoryTransaction};
pub use postgres::{PostgresStore, PostgresTransaction};
pub use traits::{
    AclRow, AclStore, AclTransaction, EntryRow, IdentityRow, NewEntry, StorageError,
};
