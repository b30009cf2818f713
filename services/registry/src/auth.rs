//! Authorization seam for the distribution surface.
//!
//! Authentication happens upstream; whatever authenticated the request
//! inserts a [`Subject`] into the request extensions. Requests without one
//! are anonymous.

use std::fmt;

use crate::error::{RegistryError, RegistryResult};
use crate::reference::RepositoryName;

/// What a request wants to do to a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Action {
    Pull,
    Push,
    Delete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Pull => "pull",
            Action::Push => "push",
            Action::Delete => "delete",
        })
    }
}

/// The caller, as established by upstream authentication.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subject {
    name: Option<String>,
}

impl Subject {
    /// A caller with no identity.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// A caller authenticated as `name`.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
        }
    }

    /// The caller's name, if authenticated.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name.as_deref().unwrap_or("anonymous"))
    }
}

/// Decides whether a subject may perform an action on a repository.
#[async_trait::async_trait]
pub trait Authorizer: fmt::Debug + Send + Sync {
    /// `Ok(())` to allow; [`RegistryError::Denied`] or
    /// [`RegistryError::Unauthorized`] to refuse.
    async fn authorize(
        &self,
        subject: &Subject,
        repository: &RepositoryName,
        action: Action,
    ) -> RegistryResult<()>;
}

static_assertions::assert_obj_safe!(Authorizer);

/// Permits everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait::async_trait]
impl Authorizer for AllowAll {
    async fn authorize(&self, _: &Subject, _: &RepositoryName, _: Action) -> RegistryResult<()> {
        Ok(())
    }
}

/// Permits pulls only, for read-only mirrors.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOnly;

#[async_trait::async_trait]
impl Authorizer for ReadOnly {
    async fn authorize(
        &self,
        subject: &Subject,
        repository: &RepositoryName,
        action: Action,
    ) -> RegistryResult<()> {
        match action {
            Action::Pull => Ok(()),
            _ => Err(RegistryError::Denied(format!(
                "{subject} may not {action} {repository}"
            ))),
        }
    }
}
