//! Port traits implemented by storage adapters.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::domain::bundle::{
    DocumentData, MetaData, MonikerLocations, Package, PackageReference, ResultChunkData,
};
use crate::domain::dump::{BulkRowCounts, DependencySyncJob, Dump};
use crate::domain::job::{Claim, Job, JobStateCounts, NewJob, ResetOutcome};
use crate::Result;

// ═══════════════════════════════════════════════════════════════════════════
// Port Trait: JobStore
// ═══════════════════════════════════════════════════════════════════════════

/// Persisted job queue with atomic claim/release semantics.
///
/// # Ownership
///
/// `dequeue` is the only way to acquire a job. It stamps the job with a fresh
/// lease token; every later mutation presents `(id, token)` and is applied
/// only while the job is still `processing` under that token. A mutation from
/// a worker whose lease was revoked (reset, finished by someone else) returns
/// `Ok(false)` and leaves the row untouched.
///
/// # Errors
///
/// Store-level failures (connection loss, busy database) surface as
/// `StorageError` and are safe to retry.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Name of the queue (its table name)
    fn queue_name(&self) -> &str;

    /// Insert a new job in `queued`
    async fn enqueue(&self, job: &NewJob) -> Result<i64>;

    /// Claim one eligible job (`queued`, `process_after` reached), if any
    async fn dequeue(&self) -> Result<Option<Claim>>;

    /// Refresh `last_heartbeat_at` of a held job
    async fn heartbeat(&self, id: i64, token: Uuid) -> Result<bool>;

    /// `processing → completed`
    async fn complete(&self, id: i64, token: Uuid) -> Result<bool>;

    /// `processing → errored`, recording `reason` and incrementing `num_failures`
    async fn fail(&self, id: i64, token: Uuid, reason: &str) -> Result<bool>;

    /// `processing → queued`, eligible again at `after`; `num_failures` is untouched
    async fn requeue(&self, id: i64, token: Uuid, after: DateTime<Utc>) -> Result<bool>;

    /// Reclaim jobs whose heartbeat is older than `now - stalled_after`.
    ///
    /// Jobs with `num_resets < max_resets` return to `queued`; the others are
    /// moved to `errored`. Both increment `num_resets`.
    async fn reset_stalled(
        &self,
        now: DateTime<Utc>,
        stalled_after: chrono::Duration,
        max_resets: u32,
    ) -> Result<ResetOutcome>;

    /// Read a job by id
    async fn get(&self, id: i64) -> Result<Option<Job>>;

    /// Count jobs per state for one repository
    async fn state_counts(&self, repository_id: i64) -> Result<JobStateCounts>;
}

// ═══════════════════════════════════════════════════════════════════════════
// Port Trait: NestedTransaction
// ═══════════════════════════════════════════════════════════════════════════

/// A transaction that supports named marks (savepoints).
///
/// Dropping a transaction that was neither committed nor rolled back rolls it
/// back.
pub trait NestedTransaction {
    /// Set a named mark inside the transaction
    fn mark(&mut self, name: &str) -> Result<()>;

    /// Discard everything written since `name`; the mark stays usable
    fn rollback_to_mark(&mut self, name: &str) -> Result<()>;

    /// Forget the mark, keeping its writes in the enclosing transaction
    fn release_mark(&mut self, name: &str) -> Result<()>;

    fn commit(self: Box<Self>) -> Result<()>;

    fn rollback(self: Box<Self>) -> Result<()>;
}

// ═══════════════════════════════════════════════════════════════════════════
// Port Trait: BulkStore
// ═══════════════════════════════════════════════════════════════════════════

/// Bulk analysis store: one table per grouped-bundle field, keyed by upload id.
///
/// Writes for a given upload id are deterministic, so a unique-key collision on
/// any of them means a previous attempt already wrote this upload.
pub trait BulkStore: Send + Sync {
    /// Open a write transaction
    fn begin(&self) -> Result<Box<dyn BulkTransaction + '_>>;

    /// Content digest recorded with the upload's meta row, if written
    fn content_digest(&self, upload_id: i64) -> Result<Option<String>>;

    /// Delete every row of an upload; returns the number of rows removed
    fn purge_upload(&self, upload_id: i64) -> Result<u64>;

    /// Per-table row counts of an upload
    fn row_counts(&self, upload_id: i64) -> Result<BulkRowCounts>;

    /// Read back one document
    fn document(&self, upload_id: i64, path: &str) -> Result<Option<DocumentData>>;
}

/// Write side of the bulk store. Each method is one bulk insert.
pub trait BulkTransaction {
    fn write_meta(&mut self, upload_id: i64, meta: &MetaData, content_digest: &str) -> Result<()>;

    fn write_documents(
        &mut self,
        upload_id: i64,
        documents: &BTreeMap<String, DocumentData>,
    ) -> Result<u32>;

    fn write_result_chunks(
        &mut self,
        upload_id: i64,
        result_chunks: &BTreeMap<u32, ResultChunkData>,
    ) -> Result<u32>;

    fn write_definitions(&mut self, upload_id: i64, monikers: &[MonikerLocations]) -> Result<u32>;

    fn write_references(&mut self, upload_id: i64, monikers: &[MonikerLocations]) -> Result<u32>;

    fn write_implementations(
        &mut self,
        upload_id: i64,
        monikers: &[MonikerLocations],
    ) -> Result<u32>;

    fn commit(self: Box<Self>) -> Result<()>;
}

// ═══════════════════════════════════════════════════════════════════════════
// Port Trait: MetadataStore
// ═══════════════════════════════════════════════════════════════════════════

/// Relational metadata store: dumps, packages, commit dates, dirty flags and
/// dependency-sync jobs.
pub trait MetadataStore: Send + Sync {
    /// Record the commit date of `(repository_id, commit)` if not already present
    fn update_committed_at(
        &self,
        repository_id: i64,
        commit: &str,
        committed_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Open a write transaction
    fn begin(&self) -> Result<Box<dyn MetadataTransaction + '_>>;

    fn get_dump(&self, upload_id: i64) -> Result<Option<Dump>>;

    /// Dumps of a repository, ordered by upload id
    fn list_dumps(&self, repository_id: i64) -> Result<Vec<Dump>>;

    fn committed_at(&self, repository_id: i64, commit: &str) -> Result<Option<DateTime<Utc>>>;

    /// Current dirty token of a repository (0 if never marked)
    fn dirty_token(&self, repository_id: i64) -> Result<u64>;

    fn dependency_sync_jobs(&self, upload_id: i64) -> Result<Vec<DependencySyncJob>>;

    fn packages(&self, upload_id: i64) -> Result<Vec<Package>>;

    fn package_references(&self, upload_id: i64) -> Result<Vec<PackageReference>>;
}

/// Write side of the metadata store
pub trait MetadataTransaction: NestedTransaction {
    /// Delete dumps sharing the key of `upload_id`, excluding `upload_id` itself
    fn delete_overlapping_dumps(
        &mut self,
        upload_id: i64,
        repository_id: i64,
        commit: &str,
        root: &str,
        indexer: &str,
    ) -> Result<u64>;

    /// Replace the packages emitted by an upload
    fn update_packages(&mut self, upload_id: i64, packages: &[Package]) -> Result<()>;

    /// Replace the packages consumed by an upload
    fn update_package_references(
        &mut self,
        upload_id: i64,
        references: &[PackageReference],
    ) -> Result<()>;

    fn insert_dependency_sync_job(&mut self, upload_id: i64) -> Result<i64>;

    /// Bump the repository's dirty token
    fn set_repository_dirty(&mut self, repository_id: i64) -> Result<()>;

    fn install_dump(&mut self, dump: &Dump) -> Result<()>;
}
