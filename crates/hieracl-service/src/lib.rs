pub mod cli;
pub mod config;
pub mod error;
pub mod lint;
pub mod loader;
pub mod service;

pub use error::AclError;
pub use lint::{
    AclLinter, LintConfig, LintProblem, LintResult, ParentRule, RequiredGrant, SecurableCatalog,
};
pub use loader::AclLoader;
pub use service::{AclService, CacheReport, PrincipalSource, ServiceConfig, StaticPrincipal};
