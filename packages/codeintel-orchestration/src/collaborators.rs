//! External collaborators of the upload handler
//!
//! All of them are injected into the handler as trait objects. Production
//! adapters live in `infrastructure`; tests use the in-memory ones.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use crate::error::Result;

/// A repository known to the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    pub id: i64,
    pub name: String,
}

impl Repository {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// Result of resolving a commit in a repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevisionStatus {
    /// Commit exists; carries the full object id
    Resolved(String),
    /// The repository does not (yet) contain the commit
    NotFound,
    /// The repository is still being cloned
    Cloning,
}

#[async_trait]
pub trait RepositoryRegistry: Send + Sync {
    /// `Ok(None)` when no repository has this id
    async fn get_repository(&self, id: i64) -> Result<Option<Repository>>;
}

#[async_trait]
pub trait VersionControl: Send + Sync {
    async fn resolve_revision(&self, repo: &Repository, commit: &str) -> Result<RevisionStatus>;

    /// Children of each directory at `commit`, as repository-relative paths.
    /// The repository root is the empty string.
    async fn directory_children(
        &self,
        repo: &Repository,
        commit: &str,
        dirnames: &[String],
    ) -> Result<HashMap<String, Vec<String>>>;

    /// Committer timestamp; `Ok(None)` when the commit does not exist
    async fn commit_timestamp(&self, repo: &Repository, commit: &str)
        -> Result<Option<DateTime<Utc>>>;

    async fn is_on_default_branch(&self, repo: &Repository, commit: &str) -> Result<bool>;
}

/// Object storage holding raw uploaded artifacts
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Open a blob for reading. The reader is consumed on a blocking thread.
    async fn get(&self, key: &str) -> Result<Box<dyn Read + Send>>;

    async fn delete(&self, key: &str) -> Result<()>;
}

/// Directory listing used to prune documents that are not in the repository
#[async_trait]
pub trait ChildrenLookup: Send + Sync {
    async fn children(&self, dirnames: &[String]) -> Result<HashMap<String, Vec<String>>>;
}

/// `ChildrenLookup` bound to one repository and commit
pub struct CommitChildren {
    vcs: Arc<dyn VersionControl>,
    repo: Repository,
    commit: String,
}

impl CommitChildren {
    pub fn new(vcs: Arc<dyn VersionControl>, repo: Repository, commit: impl Into<String>) -> Self {
        Self {
            vcs,
            repo,
            commit: commit.into(),
        }
    }
}

#[async_trait]
impl ChildrenLookup for CommitChildren {
    async fn children(&self, dirnames: &[String]) -> Result<HashMap<String, Vec<String>>> {
        self.vcs
            .directory_children(&self.repo, &self.commit, dirnames)
            .await
            .map_err(|e| e.wrap("version_control.directory_children"))
    }
}

/// Key of the artifact of an upload in the blob store
pub fn upload_blob_key(upload_id: i64) -> String {
    format!("upload-{}.lsif.zst", upload_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_blob_key() {
        assert_eq!(upload_blob_key(42), "upload-42.lsif.zst");
    }
}
