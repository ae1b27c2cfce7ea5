//! Consistency checks between the securable resources an application knows
//! about and the ACLs stored for them.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use hieracl_core::{Acl, ObjectIdentity, Sid};
use hieracl_storage::AclStore;

use crate::error::AclError;
use crate::service::AclService;

/// Where a resource is expected to sit in the ACL hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParentRule {
    /// Top-level resource: its ACL must not have a parent.
    Root,
    /// Child resource whose parent is known.
    ChildOf(ObjectIdentity),
    /// Child resource whose parent cannot be resolved; only a missing parent
    /// link is reported.
    ChildOfUnknown,
}

/// The application's view of which securable resources exist.
pub trait SecurableCatalog: Send + Sync {
    fn securable_types(&self) -> impl Future<Output = Result<Vec<String>, AclError>> + Send;

    fn identifiers(
        &self,
        object_type: &str,
    ) -> impl Future<Output = Result<Vec<i64>, AclError>> + Send;

    fn parent_rule(
        &self,
        identity: &ObjectIdentity,
    ) -> impl Future<Output = Result<ParentRule, AclError>> + Send;
}

const READ: i32 = 1;
const ADMINISTRATION: i32 = 1 << 4;

/// An entry every ACL of a linted type must carry. It is satisfied by any
/// entry for `sid` with the same `granting` flag whose mask shares a bit
/// with `mask`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequiredGrant {
    pub sid: Sid,
    pub mask: i32,
    pub granting: bool,
}

impl RequiredGrant {
    pub fn new(sid: Sid, mask: i32, granting: bool) -> Self {
        Self {
            sid,
            mask,
            granting,
        }
    }

    /// Administrators administer everything; agents read everything.
    pub fn defaults() -> Vec<RequiredGrant> {
        let mut grants = Vec::new();
        if let Ok(admin) = Sid::authority("GROUP_ADMIN") {
            grants.push(RequiredGrant::new(admin, ADMINISTRATION, true));
        }
        if let Ok(agent) = Sid::authority("GROUP_AGENT") {
            grants.push(RequiredGrant::new(agent, READ, true));
        }
        grants
    }

    fn is_met_by(&self, acl: &Acl) -> bool {
        acl.entries()
            .iter()
            .any(|e| e.sid == self.sid && e.granting == self.granting && e.mask & self.mask != 0)
    }
}

impl fmt::Display for RequiredGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = if self.granting { "granting" } else { "denying" };
        write!(f, "{verb} mask {:#b} to {}", self.mask, self.sid)
    }
}

#[derive(Debug, Clone)]
pub struct LintConfig {
    pub dangling_identities: bool,
    pub securables_lacking_identities: bool,
    pub child_without_parent: bool,
    pub child_with_incorrect_parent: bool,
    pub not_child_with_parent: bool,
    pub permissions: bool,
    pub required_grants: Vec<RequiredGrant>,
    pub apply_fixes: bool,
    /// Restricts the run to one identifier of each type. Dangling identities
    /// are not checked in this mode.
    pub identifier: Option<i64>,
}

impl Default for LintConfig {
    fn default() -> Self {
        Self {
            dangling_identities: true,
            securables_lacking_identities: true,
            child_without_parent: true,
            child_with_incorrect_parent: true,
            not_child_with_parent: true,
            permissions: true,
            required_grants: RequiredGrant::defaults(),
            apply_fixes: false,
            identifier: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LintProblem {
    DanglingIdentity,
    MissingIdentity,
    ChildWithoutParent,
    IncorrectParent {
        expected: ObjectIdentity,
        actual: ObjectIdentity,
    },
    NotChildWithParent(ObjectIdentity),
    MissingGrant(RequiredGrant),
}

impl fmt::Display for LintProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LintProblem::DanglingIdentity => write!(f, "acl has no corresponding resource"),
            LintProblem::MissingIdentity => write!(f, "resource lacks an acl"),
            LintProblem::ChildWithoutParent => write!(f, "child acl lacks a parent"),
            LintProblem::IncorrectParent { expected, actual } => {
                write!(f, "parent is {actual}, expected {expected}")
            }
            LintProblem::NotChildWithParent(parent) => {
                write!(f, "top-level acl has parent {parent}")
            }
            LintProblem::MissingGrant(grant) => write!(f, "acl lacks an entry {grant}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LintResult {
    pub identity: ObjectIdentity,
    pub problem: LintProblem,
    pub fixed: bool,
}

pub struct AclLinter<'a, S: AclStore, C> {
    service: &'a AclService<S>,
    catalog: &'a C,
}

impl<'a, S: AclStore, C: SecurableCatalog> AclLinter<'a, S, C> {
    pub fn new(service: &'a AclService<S>, catalog: &'a C) -> Self {
        Self { service, catalog }
    }

    pub async fn lint(&self, config: &LintConfig) -> Result<Vec<LintResult>, AclError> {
        let mut results = Vec::new();
        for object_type in self.catalog.securable_types().await? {
            self.lint_type(&object_type, config, &mut results).await?;
        }
        Ok(results)
    }

    async fn lint_type(
        &self,
        object_type: &str,
        config: &LintConfig,
        results: &mut Vec<LintResult>,
    ) -> Result<(), AclError> {
        let selected = |id: &i64| config.identifier.is_none_or(|only| only == *id);

        let existing: BTreeSet<i64> = self
            .catalog
            .identifiers(object_type)
            .await?
            .into_iter()
            .filter(selected)
            .collect();
        let stored: BTreeSet<i64> = self
            .service
            .list_identities(object_type)
            .await?
            .iter()
            .map(|i| i.identifier())
            .filter(selected)
            .collect();

        if config.dangling_identities && config.identifier.is_none() {
            let dangling: Vec<i64> = stored.difference(&existing).copied().collect();
            if !dangling.is_empty() {
                tracing::warn!(object_type, count = dangling.len(), "dangling acl identities");
            }
            for id in dangling {
                let identity = ObjectIdentity::new(object_type, id)?;
                let fixed = config.apply_fixes && self.delete_dangling(&identity).await?;
                results.push(LintResult {
                    identity,
                    problem: LintProblem::DanglingIdentity,
                    fixed,
                });
            }
        }

        let mut with_acl: Vec<ObjectIdentity> = Vec::new();
        for id in &existing {
            let identity = ObjectIdentity::new(object_type, *id)?;
            if stored.contains(id) {
                with_acl.push(identity);
                continue;
            }
            if !config.securables_lacking_identities {
                continue;
            }
            let fixed = if config.apply_fixes {
                self.service.create_acl(&identity).await?;
                tracing::info!(identity = %identity, "created missing acl");
                with_acl.push(identity.clone());
                true
            } else {
                false
            };
            results.push(LintResult {
                identity,
                problem: LintProblem::MissingIdentity,
                fixed,
            });
        }

        let checks_parents = config.child_without_parent
            || config.child_with_incorrect_parent
            || config.not_child_with_parent;
        let checks_grants = config.permissions && !config.required_grants.is_empty();
        if !(checks_parents || checks_grants) || with_acl.is_empty() {
            return Ok(());
        }

        let acls = self.service.read_acls_by_id(&with_acl, &[]).await?;
        for identity in &with_acl {
            let Some(acl) = acls.get(identity) else {
                continue;
            };
            if checks_parents {
                let rule = self.catalog.parent_rule(identity).await?;
                if let Some(result) = self.check_parent(acl, rule, config).await? {
                    results.push(result);
                }
            }
            if checks_grants {
                self.check_grants(acl, config, results).await?;
            }
        }
        Ok(())
    }

    async fn check_grants(
        &self,
        acl: &Acl,
        config: &LintConfig,
        results: &mut Vec<LintResult>,
    ) -> Result<(), AclError> {
        let identity = acl.object_identity();
        for grant in config.required_grants.iter().filter(|g| !g.is_met_by(acl)) {
            tracing::warn!(identity = %identity, grant = %grant, "acl lacks required grant");
            let fixed = config.apply_fixes && self.append_grant(identity, grant).await?;
            results.push(LintResult {
                identity: identity.clone(),
                problem: LintProblem::MissingGrant(grant.clone()),
                fixed,
            });
        }
        Ok(())
    }

    async fn check_parent(
        &self,
        acl: &Arc<Acl>,
        rule: ParentRule,
        config: &LintConfig,
    ) -> Result<Option<LintResult>, AclError> {
        let identity = acl.object_identity().clone();
        let actual = acl.parent().map(|p| p.object_identity().clone());

        let (problem, target) = match (rule, actual) {
            (ParentRule::Root, Some(actual)) if config.not_child_with_parent => {
                (LintProblem::NotChildWithParent(actual), None)
            }
            (ParentRule::ChildOf(expected), None) if config.child_without_parent => {
                (LintProblem::ChildWithoutParent, Some(expected))
            }
            (ParentRule::ChildOf(expected), Some(actual))
                if config.child_with_incorrect_parent && expected != actual =>
            {
                let problem = LintProblem::IncorrectParent {
                    expected: expected.clone(),
                    actual,
                };
                (problem, Some(expected))
            }
            (ParentRule::ChildOfUnknown, None) if config.child_without_parent => {
                return Ok(Some(LintResult {
                    identity,
                    problem: LintProblem::ChildWithoutParent,
                    fixed: false,
                }));
            }
            _ => return Ok(None),
        };

        tracing::warn!(identity = %identity, problem = %problem, "acl hierarchy problem");
        let fixed = config.apply_fixes && self.reparent(acl, target.as_ref()).await?;
        Ok(Some(LintResult {
            identity,
            problem,
            fixed,
        }))
    }

    /// Appends `grant` as the last entry. The ACL is read again first, since
    /// an earlier fix in this run may have rewritten it.
    async fn append_grant(
        &self,
        identity: &ObjectIdentity,
        grant: &RequiredGrant,
    ) -> Result<bool, AclError> {
        let current = self.service.read_acl_by_id(identity, &[]).await?;
        let mut edited = Acl::clone(&current);
        edited.insert_ace(
            edited.entries().len(),
            grant.sid.clone(),
            grant.mask,
            grant.granting,
        )?;
        self.service.update_acl(&edited).await?;
        tracing::info!(identity = %identity, grant = %grant, "added missing grant");
        Ok(true)
    }

    async fn delete_dangling(&self, identity: &ObjectIdentity) -> Result<bool, AclError> {
        match self.service.delete_acl(identity, true).await {
            Ok(()) => {
                tracing::info!(identity = %identity, "deleted dangling acl");
                Ok(true)
            }
            // Taken out already as a descendant of an earlier dangling acl.
            Err(AclError::NotFound(_)) => Ok(true),
            Err(e) => Err(e),
        }
    }

    /// Points `acl` at `parent`, or detaches it when `parent` is `None`.
    /// Returns false when the expected parent has no ACL to link to.
    async fn reparent(
        &self,
        acl: &Arc<Acl>,
        parent: Option<&ObjectIdentity>,
    ) -> Result<bool, AclError> {
        let parent_acl = match parent {
            Some(parent) => match self.service.read_acl_by_id(parent, &[]).await {
                Ok(found) => Some(found),
                Err(AclError::NotFound(_)) => {
                    tracing::warn!(parent = %parent, "expected parent has no acl, not fixing");
                    return Ok(false);
                }
                Err(e) => return Err(e),
            },
            None => None,
        };

        let mut edited = Acl::clone(acl);
        edited.set_parent(parent_acl)?;
        self.service.update_acl(&edited).await?;
        tracing::info!(identity = %acl.object_identity(), "acl parent fixed");
        Ok(true)
    }
}
