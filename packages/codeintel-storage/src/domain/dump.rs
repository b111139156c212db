//! Relational bookkeeping records written by the metadata store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Durable record of a successfully ingested upload
///
/// `(repository_id, commit, root, indexer)` is unique among dumps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dump {
    /// Id of the upload job that produced this dump
    pub upload_id: i64,
    pub repository_id: i64,
    pub commit: String,
    pub root: String,
    pub indexer: String,
    pub finished_at: DateTime<Utc>,
}

impl Dump {
    pub fn new(
        upload_id: i64,
        repository_id: i64,
        commit: impl Into<String>,
        root: impl Into<String>,
        indexer: impl Into<String>,
    ) -> Self {
        Self {
            upload_id,
            repository_id,
            commit: commit.into(),
            root: root.into(),
            indexer: indexer.into(),
            finished_at: Utc::now(),
        }
    }
}

/// Companion record asking a downstream scheduler to sync the dependencies
/// referenced by an upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySyncJob {
    pub id: i64,
    pub upload_id: i64,
    pub state: String,
    pub queued_at: DateTime<Utc>,
}

/// Row counts of one upload in the bulk store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkRowCounts {
    pub meta: u64,
    pub documents: u64,
    pub result_chunks: u64,
    pub definitions: u64,
    pub references: u64,
    pub implementations: u64,
}

impl BulkRowCounts {
    pub fn total(&self) -> u64 {
        self.meta
            + self.documents
            + self.result_chunks
            + self.definitions
            + self.references
            + self.implementations
    }
}
