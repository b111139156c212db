//! git2-backed version control
//!
//! Each repository lives at `<repos_dir>/<repository name>`. A directory that
//! does not exist yet, or is not yet a git repository, is reported as cloning.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use git2::{ErrorCode, ObjectType, Oid};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::collaborators::{Repository, RevisionStatus, VersionControl};
use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone)]
pub struct GitBackend {
    repos_dir: PathBuf,
}

enum Opened {
    Cloning,
    Ready(git2::Repository),
}

impl GitBackend {
    pub fn new(repos_dir: impl Into<PathBuf>) -> Self {
        Self {
            repos_dir: repos_dir.into(),
        }
    }

    pub fn repository_path(&self, repo: &Repository) -> PathBuf {
        self.repos_dir.join(&repo.name)
    }

    fn open(path: &Path) -> Result<Opened> {
        if !path.exists() {
            return Ok(Opened::Cloning);
        }
        match git2::Repository::open(path) {
            Ok(repo) => Ok(Opened::Ready(repo)),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(Opened::Cloning),
            Err(e) => Err(OrchestratorError::collaborator("git.open", e)),
        }
    }

    fn open_ready(path: &Path) -> Result<git2::Repository> {
        match Self::open(path)? {
            Opened::Ready(repo) => Ok(repo),
            Opened::Cloning => Err(OrchestratorError::collaborator(
                "git.open",
                format!("repository at {} is still cloning", path.display()),
            )),
        }
    }

    /// `Ok(None)` when the commit is unknown
    fn find_commit<'r>(repo: &'r git2::Repository, commit: &str) -> Result<Option<git2::Commit<'r>>> {
        let object = match repo.revparse_single(&format!("{}^{{commit}}", commit)) {
            Ok(object) => object,
            Err(e) if matches!(e.code(), ErrorCode::NotFound | ErrorCode::InvalidSpec) => {
                return Ok(None)
            }
            Err(e) if e.class() == git2::ErrorClass::Odb => return Ok(None),
            Err(e) => return Err(OrchestratorError::collaborator("git.revparse", e)),
        };
        object
            .peel_to_commit()
            .map(Some)
            .map_err(|e| OrchestratorError::collaborator("git.peel_to_commit", e))
    }

    async fn blocking<T, F>(&self, repo: &Repository, f: F) -> Result<T>
    where
        F: FnOnce(&Path) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let path = self.repository_path(repo);
        tokio::task::spawn_blocking(move || f(&path)).await?
    }
}

fn list_directory(
    repo: &git2::Repository,
    tree: &git2::Tree<'_>,
    dirname: &str,
) -> Result<Vec<String>> {
    let subtree = if dirname.is_empty() {
        tree.clone()
    } else {
        let entry = match tree.get_path(Path::new(dirname)) {
            Ok(entry) => entry,
            Err(e) if e.code() == ErrorCode::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(OrchestratorError::collaborator("git.tree_get_path", e)),
        };
        if entry.kind() != Some(ObjectType::Tree) {
            return Ok(Vec::new());
        }
        repo.find_tree(entry.id())
            .map_err(|e| OrchestratorError::collaborator("git.find_tree", e))?
    };

    let mut children: Vec<String> = subtree
        .iter()
        .filter_map(|entry| entry.name().map(str::to_string))
        .map(|name| {
            if dirname.is_empty() {
                name
            } else {
                format!("{}/{}", dirname.trim_end_matches('/'), name)
            }
        })
        .collect();
    children.sort();
    Ok(children)
}

#[async_trait]
impl VersionControl for GitBackend {
    async fn resolve_revision(&self, repo: &Repository, commit: &str) -> Result<RevisionStatus> {
        let commit = commit.to_string();
        self.blocking(repo, move |path| {
            let git = match Self::open(path)? {
                Opened::Cloning => return Ok(RevisionStatus::Cloning),
                Opened::Ready(git) => git,
            };
            let found = Self::find_commit(&git, &commit)?;
            let status = match found {
                Some(c) => RevisionStatus::Resolved(c.id().to_string()),
                None => RevisionStatus::NotFound,
            };
            Ok(status)
        })
        .await
    }

    async fn directory_children(
        &self,
        repo: &Repository,
        commit: &str,
        dirnames: &[String],
    ) -> Result<HashMap<String, Vec<String>>> {
        let commit = commit.to_string();
        let dirnames = dirnames.to_vec();
        self.blocking(repo, move |path| {
            let git = Self::open_ready(path)?;
            let found = Self::find_commit(&git, &commit)?.ok_or_else(|| {
                OrchestratorError::collaborator("git.directory_children", "unknown commit")
            })?;
            let tree = found
                .tree()
                .map_err(|e| OrchestratorError::collaborator("git.tree", e))?;

            let mut result = HashMap::with_capacity(dirnames.len());
            for dirname in dirnames {
                let children = list_directory(&git, &tree, &dirname)?;
                debug!(dirname = %dirname, children = children.len(), "Listed directory");
                result.insert(dirname, children);
            }
            Ok(result)
        })
        .await
    }

    async fn commit_timestamp(
        &self,
        repo: &Repository,
        commit: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let commit = commit.to_string();
        self.blocking(repo, move |path| {
            let git = Self::open_ready(path)?;
            let found = Self::find_commit(&git, &commit)?;
            let timestamp = found.and_then(|c| DateTime::from_timestamp(c.time().seconds(), 0));
            Ok(timestamp)
        })
        .await
    }

    async fn is_on_default_branch(&self, repo: &Repository, commit: &str) -> Result<bool> {
        let commit = commit.to_string();
        self.blocking(repo, move |path| {
            let git = Self::open_ready(path)?;
            let Some(target) = Self::find_commit(&git, &commit)? else {
                return Ok(false);
            };
            let head: Oid = match git.head() {
                Ok(head) => match head.target() {
                    Some(oid) => oid,
                    None => return Ok(false),
                },
                Err(e) if e.code() == ErrorCode::UnbornBranch => return Ok(false),
                Err(e) => return Err(OrchestratorError::collaborator("git.head", e)),
            };
            if head == target.id() {
                return Ok(true);
            }
            git.graph_descendant_of(head, target.id())
                .map_err(|e| OrchestratorError::collaborator("git.graph_descendant_of", e))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn commit_files(repo: &git2::Repository, files: &[&str], time: i64) -> Oid {
        let workdir = repo.workdir().unwrap().to_path_buf();
        let mut index = repo.index().unwrap();
        for file in files {
            let path = workdir.join(file);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, format!("// {}\n", file)).unwrap();
            index.add_path(Path::new(file)).unwrap();
        }
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = git2::Signature::new("dev", "dev@example.com", &git2::Time::new(time, 0)).unwrap();

        let parents: Vec<git2::Commit<'_>> = match repo.head() {
            Ok(head) => vec![head.peel_to_commit().unwrap()],
            Err(_) => Vec::new(),
        };
        let parent_refs: Vec<&git2::Commit<'_>> = parents.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, "change", &tree, &parent_refs)
            .unwrap()
    }

    fn setup() -> (tempfile::TempDir, GitBackend, Repository, Oid, Oid) {
        let dir = tempfile::tempdir().unwrap();
        let repo_dir = dir.path().join("github.com/example/repo");
        fs::create_dir_all(&repo_dir).unwrap();
        let git = git2::Repository::init(&repo_dir).unwrap();

        let first = commit_files(&git, &["sub3/main.go", "README.md"], 1_600_000_000);
        let second = commit_files(&git, &["sub3/util.go"], 1_600_000_100);

        let backend = GitBackend::new(dir.path());
        (dir, backend, Repository::new(50, "github.com/example/repo"), first, second)
    }

    #[tokio::test]
    async fn test_resolve_revision() {
        let (_dir, backend, repo, first, _) = setup();

        let status = backend
            .resolve_revision(&repo, &first.to_string())
            .await
            .unwrap();
        assert_eq!(status, RevisionStatus::Resolved(first.to_string()));

        let missing = backend
            .resolve_revision(&repo, "0123456789abcdef0123456789abcdef01234567")
            .await
            .unwrap();
        assert_eq!(missing, RevisionStatus::NotFound);
    }

    #[tokio::test]
    async fn test_missing_directory_is_cloning() {
        let (_dir, backend, _, first, _) = setup();
        let other = Repository::new(51, "github.com/example/not-yet-cloned");
        assert_eq!(
            backend
                .resolve_revision(&other, &first.to_string())
                .await
                .unwrap(),
            RevisionStatus::Cloning
        );
    }

    #[tokio::test]
    async fn test_directory_children_at_commit() {
        let (_dir, backend, repo, first, second) = setup();
        let dirs = vec!["".to_string(), "sub3".to_string(), "missing".to_string()];

        let at_first = backend
            .directory_children(&repo, &first.to_string(), &dirs)
            .await
            .unwrap();
        assert_eq!(at_first[""], vec!["README.md".to_string(), "sub3".to_string()]);
        assert_eq!(at_first["sub3"], vec!["sub3/main.go".to_string()]);
        assert!(at_first["missing"].is_empty());

        let at_second = backend
            .directory_children(&repo, &second.to_string(), &dirs)
            .await
            .unwrap();
        assert_eq!(
            at_second["sub3"],
            vec!["sub3/main.go".to_string(), "sub3/util.go".to_string()]
        );
    }

    #[tokio::test]
    async fn test_commit_timestamp_and_default_branch() {
        let (_dir, backend, repo, first, second) = setup();

        let ts = backend
            .commit_timestamp(&repo, &first.to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ts.timestamp(), 1_600_000_000);

        assert!(backend
            .is_on_default_branch(&repo, &first.to_string())
            .await
            .unwrap());
        assert!(backend
            .is_on_default_branch(&repo, &second.to_string())
            .await
            .unwrap());
        assert_eq!(
            backend
                .commit_timestamp(&repo, "0123456789abcdef0123456789abcdef01234567")
                .await
                .unwrap(),
            None
        );
    }
}
