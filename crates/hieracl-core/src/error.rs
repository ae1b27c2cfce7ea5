use crate::identity::ObjectIdentity;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    #[error("object identity type must not be empty")]
    EmptyObjectType,

    #[error("sid name must not be empty")]
    EmptySidName,

    #[error("entry index {index} out of bounds (len {len})")]
    IndexOutOfBounds { index: usize, len: usize },

    #[error("duplicate entry order {0}")]
    DuplicateOrder(i32),

    #[error("{0} would become its own ancestor")]
    CyclicParent(ObjectIdentity),
}
