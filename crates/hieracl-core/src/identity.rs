use std::fmt;

use crate::error::ModelError;

/// Storage key of a persisted ACL (the object identity row).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AclId(i64);

impl AclId {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for AclId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId(i64);

impl EntryId {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> i64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SidId(i64);

impl SidId {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> i64 {
        self.0
    }
}

/// Handle naming one securable resource, independent of any stored row.
///
/// Equality and hashing only consider `(object_type, identifier)`, so callers
/// can build identities before anything has been persisted.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectIdentity {
    object_type: String,
    identifier: i64,
}

impl ObjectIdentity {
    pub fn new(object_type: impl Into<String>, identifier: i64) -> Result<Self, ModelError> {
        let object_type = object_type.into();
        if object_type.trim().is_empty() {
            return Err(ModelError::EmptyObjectType);
        }
        Ok(Self {
            object_type,
            identifier,
        })
    }

    pub fn of<S: Securable + ?Sized>(securable: &S) -> Result<Self, ModelError> {
        Self::new(securable.securable_type(), securable.securable_id())
    }

    pub fn object_type(&self) -> &str {
        &self.object_type
    }

    pub fn identifier(&self) -> i64 {
        self.identifier
    }
}

impl fmt::Display for ObjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.object_type, self.identifier)
    }
}

/// Implemented by domain objects that can be secured by an ACL.
pub trait Securable {
    fn securable_type(&self) -> &str;

    fn securable_id(&self) -> i64;

    fn object_identity(&self) -> Result<ObjectIdentity, ModelError> {
        ObjectIdentity::of(self)
    }
}

/// Non-blank name of a principal or authority.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SidName(String);

impl SidName {
    pub fn new(name: impl Into<String>) -> Result<Self, ModelError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ModelError::EmptySidName);
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SidName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Security identifier: either a user principal or a granted authority (role).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Sid {
    Principal(SidName),
    Authority(SidName),
}

impl Sid {
    pub fn principal(name: impl Into<String>) -> Result<Self, ModelError> {
        Ok(Self::Principal(SidName::new(name)?))
    }

    pub fn authority(name: impl Into<String>) -> Result<Self, ModelError> {
        Ok(Self::Authority(SidName::new(name)?))
    }

    pub fn name(&self) -> &str {
        match self {
            Sid::Principal(name) | Sid::Authority(name) => name.as_str(),
        }
    }

    pub fn is_principal(&self) -> bool {
        matches!(self, Sid::Principal(_))
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sid::Principal(name) => write!(f, "principal:{name}"),
            Sid::Authority(name) => write!(f, "authority:{name}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    struct Dataset {
        id: i64,
    }

    impl Securable for Dataset {
        fn securable_type(&self) -> &str {
            "Dataset"
        }

        fn securable_id(&self) -> i64 {
            self.id
        }
    }

    #[test]
    fn object_identity_equality_uses_type_and_identifier() {
        let a = ObjectIdentity::new("Dataset", 1).unwrap();
        let b = ObjectIdentity::new("Dataset".to_string(), 1).unwrap();
        let c = ObjectIdentity::new("Dataset", 2).unwrap();
        let d = ObjectIdentity::new("Analysis", 1).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);

        let set: HashSet<_> = [a, b, c, d].into_iter().collect();
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn object_identity_rejects_empty_type() {
        assert_eq!(
            ObjectIdentity::new("  ", 1),
            Err(ModelError::EmptyObjectType)
        );
    }

    #[test]
    fn object_identity_from_securable() {
        let oid = Dataset { id: 42 }.object_identity().unwrap();

        assert_eq!(oid.object_type(), "Dataset");
        assert_eq!(oid.identifier(), 42);
        assert_eq!(oid.to_string(), "Dataset:42");
    }

    #[test]
    fn sid_equality_is_variant_specific() {
        let user = Sid::principal("admin").unwrap();
        let role = Sid::authority("admin").unwrap();

        assert_ne!(user, role);
        assert_eq!(user, Sid::principal("admin").unwrap());
        assert_eq!(user.name(), role.name());
        assert!(user.is_principal());
        assert!(!role.is_principal());
    }

    #[test]
    fn sid_rejects_empty_name() {
        assert_eq!(Sid::principal(""), Err(ModelError::EmptySidName));
        assert_eq!(Sid::authority(" "), Err(ModelError::EmptySidName));
    }

    #[test]
    fn sid_variants_only_hold_validated_names() {
        assert_eq!(SidName::new("\t"), Err(ModelError::EmptySidName));

        let name = SidName::new("alice").unwrap();
        assert_eq!(Sid::Principal(name), Sid::principal("alice").unwrap());
    }

    #[test]
    fn sid_display() {
        assert_eq!(Sid::principal("alice").unwrap().to_string(), "principal:alice");
        assert_eq!(
            Sid::authority("GROUP_ADMIN").unwrap().to_string(),
            "authority:GROUP_ADMIN"
        );
    }
}
