//! In-memory version control (for testing)
//!
//! Repositories hold a set of commits, each with a flat file list. Directory
//! listings are derived from the file paths.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::collaborators::{Repository, RevisionStatus, VersionControl};
use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone)]
struct CommitData {
    committed_at: DateTime<Utc>,
    files: BTreeSet<String>,
    on_default_branch: bool,
}

#[derive(Debug, Default)]
struct RepoData {
    cloning: bool,
    commits: HashMap<String, CommitData>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryVersionControl {
    repos: Arc<RwLock<HashMap<i64, RepoData>>>,
    /// When set, every call fails with this message
    failure: Arc<RwLock<Option<String>>>,
    /// Failures scoped to a single operation
    operation_failures: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryVersionControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a commit with the given files (repository-relative paths)
    pub fn add_commit<I, S>(
        &self,
        repository_id: i64,
        commit: &str,
        committed_at: DateTime<Utc>,
        files: I,
    ) where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut repos = self.repos.write();
        let repo = repos.entry(repository_id).or_default();
        repo.commits.insert(
            commit.to_string(),
            CommitData {
                committed_at,
                files: files.into_iter().map(Into::into).collect(),
                on_default_branch: true,
            },
        );
    }

    pub fn set_cloning(&self, repository_id: i64, cloning: bool) {
        self.repos.write().entry(repository_id).or_default().cloning = cloning;
    }

    pub fn set_failure(&self, message: Option<&str>) {
        *self.failure.write() = message.map(str::to_string);
    }

    /// Make only `operation` (e.g. `version_control.is_on_default_branch`) fail
    pub fn fail_operation(&self, operation: &str, message: &str) {
        self.operation_failures
            .write()
            .insert(operation.to_string(), message.to_string());
    }

    fn check_failure(&self, operation: &str) -> Result<()> {
        if let Some(message) = self.failure.read().as_ref() {
            return Err(OrchestratorError::collaborator(operation, message));
        }
        match self.operation_failures.read().get(operation) {
            Some(message) => Err(OrchestratorError::collaborator(operation, message)),
            None => Ok(()),
        }
    }

    fn with_commit<T>(
        &self,
        repository_id: i64,
        commit: &str,
        f: impl FnOnce(Option<&CommitData>) -> T,
    ) -> T {
        let repos = self.repos.read();
        f(repos.get(&repository_id).and_then(|r| r.commits.get(commit)))
    }
}

fn children_of(files: &BTreeSet<String>, dirname: &str) -> Vec<String> {
    let prefix = if dirname.is_empty() {
        String::new()
    } else {
        format!("{}/", dirname.trim_end_matches('/'))
    };

    let children: BTreeSet<String> = files
        .iter()
        .filter_map(|file| file.strip_prefix(prefix.as_str()))
        .map(|rest| match rest.split_once('/') {
            Some((dir, _)) => format!("{}{}", prefix, dir),
            None => format!("{}{}", prefix, rest),
        })
        .collect();
    children.into_iter().collect()
}

#[async_trait]
impl VersionControl for MemoryVersionControl {
    async fn resolve_revision(&self, repo: &Repository, commit: &str) -> Result<RevisionStatus> {
        self.check_failure("version_control.resolve_revision")?;
        let repos = self.repos.read();
        let status = match repos.get(&repo.id) {
            None => RevisionStatus::Cloning,
            Some(data) if data.cloning => RevisionStatus::Cloning,
            Some(data) if data.commits.contains_key(commit) => {
                RevisionStatus::Resolved(commit.to_string())
            }
            Some(_) => RevisionStatus::NotFound,
        };
        Ok(status)
    }

    async fn directory_children(
        &self,
        repo: &Repository,
        commit: &str,
        dirnames: &[String],
    ) -> Result<HashMap<String, Vec<String>>> {
        self.check_failure("version_control.directory_children")?;
        self.with_commit(repo.id, commit, |data| {
            let data = data.ok_or_else(|| {
                OrchestratorError::collaborator("version_control.directory_children", "unknown commit")
            })?;
            Ok(dirnames
                .iter()
                .map(|d| (d.clone(), children_of(&data.files, d)))
                .collect())
        })
    }

    async fn commit_timestamp(
        &self,
        repo: &Repository,
        commit: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        self.check_failure("version_control.commit_timestamp")?;
        Ok(self.with_commit(repo.id, commit, |data| data.map(|d| d.committed_at)))
    }

    async fn is_on_default_branch(&self, repo: &Repository, commit: &str) -> Result<bool> {
        self.check_failure("version_control.is_on_default_branch")?;
        Ok(self.with_commit(repo.id, commit, |data| {
            data.map(|d| d.on_default_branch).unwrap_or(false)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vcs() -> (MemoryVersionControl, Repository) {
        let vcs = MemoryVersionControl::new();
        vcs.add_commit(
            50,
            "deadbeef1",
            Utc::now(),
            ["sub3/main.go", "sub3/pkg/util.go", "README.md"],
        );
        (vcs, Repository::new(50, "repo"))
    }

    #[tokio::test]
    async fn test_resolve_states() {
        let (vcs, repo) = vcs();
        assert_eq!(
            vcs.resolve_revision(&repo, "deadbeef1").await.unwrap(),
            RevisionStatus::Resolved("deadbeef1".to_string())
        );
        assert_eq!(
            vcs.resolve_revision(&repo, "cafe").await.unwrap(),
            RevisionStatus::NotFound
        );
        vcs.set_cloning(50, true);
        assert_eq!(
            vcs.resolve_revision(&repo, "deadbeef1").await.unwrap(),
            RevisionStatus::Cloning
        );
    }

    #[tokio::test]
    async fn test_children_are_derived_from_files() {
        let (vcs, repo) = vcs();
        let dirs = vec!["".to_string(), "sub3".to_string(), "nope".to_string()];
        let children = vcs
            .directory_children(&repo, "deadbeef1", &dirs)
            .await
            .unwrap();

        assert_eq!(children[""], vec!["README.md", "sub3"]);
        assert_eq!(children["sub3"], vec!["sub3/main.go", "sub3/pkg"]);
        assert!(children["nope"].is_empty());
    }

    #[tokio::test]
    async fn test_operation_failure_is_scoped() {
        let (vcs, repo) = vcs();
        vcs.fail_operation("version_control.is_on_default_branch", "ref lookup failed");
        assert!(vcs.is_on_default_branch(&repo, "deadbeef1").await.is_err());
        assert!(vcs.commit_timestamp(&repo, "deadbeef1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let (vcs, repo) = vcs();
        vcs.set_failure(Some("gitserver unavailable"));
        let err = vcs.resolve_revision(&repo, "deadbeef1").await.unwrap_err();
        assert!(err.to_string().contains("gitserver unavailable"));
    }
}
