use hieracl_core::ModelError;
use hieracl_storage::StorageError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AclError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("{0} has children")]
    ChildrenExist(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl From<StorageError> for AclError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(what) => AclError::NotFound(what),
            StorageError::Duplicate(what) => AclError::AlreadyExists(what),
            StorageError::Internal(msg) => AclError::StoreUnavailable(msg),
        }
    }
}

impl From<ModelError> for AclError {
    fn from(err: ModelError) -> Self {
        AclError::InvalidArgument(err.to_string())
    }
}
