//! Branch reference types.

use std::fmt;

use serde::{Deserialize, Serialize};

use arbor_types::RepositoryId;

use crate::error::Result;
use crate::names::{validate_branch_name, DEFAULT_BRANCH};

/// A named branch of a repository.
///
/// The head of a branch is the hash of its latest version; it only ever
/// changes through a compare-and-swap on a
/// [`BranchStore`](crate::BranchStore).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BranchRef {
    repository: RepositoryId,
    name: String,
}

impl BranchRef {
    /// A reference to branch `name` of `repository`; the name is validated.
    pub fn new(repository: RepositoryId, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_branch_name(&name)?;
        Ok(Self { repository, name })
    }

    /// The default branch of `repository`.
    pub fn default_branch(repository: RepositoryId) -> Self {
        Self {
            repository,
            name: DEFAULT_BRANCH.to_string(),
        }
    }

    pub fn repository(&self) -> &RepositoryId {
        &self.repository
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Another branch of the same repository.
    pub fn sibling(&self, name: impl Into<String>) -> Result<Self> {
        Self::new(self.repository.clone(), name)
    }

    /// Canonical name, e.g. `refs/models/heads/master`.
    pub fn canonical_name(&self) -> String {
        format!("refs/{}/heads/{}", self.repository, self.name)
    }
}

impl fmt::Display for BranchRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.name)
    }
}
