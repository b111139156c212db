//! Dual-store writer
//!
//! Writes a correlated bundle to the bulk store, then installs the dump in the
//! metadata store. The two stores fail independently:
//!
//! - bulk writes happen in one transaction and are keyed by upload id, so a
//!   retried upload collides with the rows of the previous attempt. What
//!   happens then is decided by `ReplayPolicy`.
//! - metadata writes run under a named savepoint. Any failure rolls back to
//!   the savepoint and then the whole transaction, so no partial bookkeeping
//!   is ever visible.

use codeintel_storage::{
    BulkStore, Dump, GroupedBundleData, Job, MetadataStore, MetadataTransaction,
    NestedTransaction,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{OrchestratorError, Result, ResultExt};

const INSTALL_MARK: &str = "install_dump";

/// What to do when the bulk store already holds rows for an upload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayPolicy {
    /// Assume the earlier attempt wrote identical rows and continue
    TrustDeterministic,
    /// Compare content digests; purge and rewrite when they differ
    #[default]
    VerifyDigest,
}

impl ReplayPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplayPolicy::TrustDeterministic => "trust_deterministic",
            ReplayPolicy::VerifyDigest => "verify_digest",
        }
    }
}

/// Outcome of the bulk half of a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkWriteStatus {
    Written,
    /// Rows from an earlier attempt were kept
    AlreadyPresent,
    /// Rows from an earlier attempt differed and were replaced
    Rewritten,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReport {
    pub bulk: BulkWriteStatus,
    /// Bulk rows inserted by this attempt
    pub rows_written: u32,
    pub overlapping_dumps_removed: u64,
}

pub struct DualStoreWriter {
    bulk: Arc<dyn BulkStore>,
    metadata: Arc<dyn MetadataStore>,
    policy: ReplayPolicy,
}

impl DualStoreWriter {
    pub fn new(
        bulk: Arc<dyn BulkStore>,
        metadata: Arc<dyn MetadataStore>,
        policy: ReplayPolicy,
    ) -> Self {
        Self {
            bulk,
            metadata,
            policy,
        }
    }

    pub fn policy(&self) -> ReplayPolicy {
        self.policy
    }

    /// Write `bundle` for `job`. Cancellation is honoured between bulk inserts
    /// and before the metadata transaction starts; once it has started it runs
    /// to commit or rollback.
    pub async fn write(
        &self,
        job: &Job,
        bundle: Arc<GroupedBundleData>,
        cancel: &CancellationToken,
    ) -> Result<WriteReport> {
        let digest = bundle.content_digest().wrap_err("content_digest")?;

        let (status, rows_written) = self
            .write_bulk(job.id, Arc::clone(&bundle), digest, cancel)
            .await?;
        debug!(
            "upload {}: bulk write {:?} ({} rows)",
            job.id, status, rows_written
        );

        if cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled);
        }

        let metadata = Arc::clone(&self.metadata);
        let owned_job = job.clone();
        let overlapping_dumps_removed = tokio::task::spawn_blocking(move || {
            install(metadata.as_ref(), &owned_job, &bundle)
        })
        .await??;

        info!(
            "upload {} installed for repository {} at {} ({} overlapping dumps removed)",
            job.id, job.repository_id, job.commit, overlapping_dumps_removed
        );

        Ok(WriteReport {
            bulk: status,
            rows_written,
            overlapping_dumps_removed,
        })
    }

    async fn write_bulk(
        &self,
        upload_id: i64,
        bundle: Arc<GroupedBundleData>,
        digest: String,
        cancel: &CancellationToken,
    ) -> Result<(BulkWriteStatus, u32)> {
        let bulk = Arc::clone(&self.bulk);
        let policy = self.policy;
        let token = cancel.clone();

        tokio::task::spawn_blocking(move || {
            let bulk = bulk.as_ref();
            match write_all(bulk, upload_id, &bundle, &digest, &token) {
                Ok(rows) => Ok((BulkWriteStatus::Written, rows)),
                Err(e) if e.is_unique_violation() => {
                    replay(bulk, policy, upload_id, &bundle, &digest, &token)
                }
                Err(e) => Err(e),
            }
        })
        .await?
    }
}

fn checkpoint(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(OrchestratorError::Cancelled)
    } else {
        Ok(())
    }
}

fn write_all(
    bulk: &dyn BulkStore,
    upload_id: i64,
    bundle: &GroupedBundleData,
    digest: &str,
    cancel: &CancellationToken,
) -> Result<u32> {
    let mut tx = bulk.begin().wrap_err("bulk_store.begin")?;

    checkpoint(cancel)?;
    tx.write_meta(upload_id, &bundle.meta, digest)
        .wrap_err("bulk_store.write_meta")?;
    let mut rows = 1;

    checkpoint(cancel)?;
    rows += tx
        .write_documents(upload_id, &bundle.documents)
        .wrap_err("bulk_store.write_documents")?;

    checkpoint(cancel)?;
    rows += tx
        .write_result_chunks(upload_id, &bundle.result_chunks)
        .wrap_err("bulk_store.write_result_chunks")?;

    checkpoint(cancel)?;
    rows += tx
        .write_definitions(upload_id, &bundle.definitions)
        .wrap_err("bulk_store.write_definitions")?;

    checkpoint(cancel)?;
    rows += tx
        .write_references(upload_id, &bundle.references)
        .wrap_err("bulk_store.write_references")?;

    checkpoint(cancel)?;
    rows += tx
        .write_implementations(upload_id, &bundle.implementations)
        .wrap_err("bulk_store.write_implementations")?;

    checkpoint(cancel)?;
    tx.commit().wrap_err("bulk_store.commit")?;
    Ok(rows)
}

fn replay(
    bulk: &dyn BulkStore,
    policy: ReplayPolicy,
    upload_id: i64,
    bundle: &GroupedBundleData,
    digest: &str,
    cancel: &CancellationToken,
) -> Result<(BulkWriteStatus, u32)> {
    match policy {
        ReplayPolicy::TrustDeterministic => {
            warn!(
                "upload {}: bulk rows already present, keeping them",
                upload_id
            );
            Ok((BulkWriteStatus::AlreadyPresent, 0))
        }
        ReplayPolicy::VerifyDigest => {
            let stored = bulk
                .content_digest(upload_id)
                .wrap_err("bulk_store.content_digest")?;
            if stored.as_deref() == Some(digest) {
                debug!("upload {}: bulk rows match digest {}", upload_id, digest);
                return Ok((BulkWriteStatus::AlreadyPresent, 0));
            }

            warn!(
                "upload {}: bulk rows differ (stored {:?}, new {}), rewriting",
                upload_id, stored, digest
            );
            let purged = bulk
                .purge_upload(upload_id)
                .wrap_err("bulk_store.purge_upload")?;
            debug!("upload {}: purged {} rows", upload_id, purged);

            let rows = write_all(bulk, upload_id, bundle, digest, cancel)?;
            Ok((BulkWriteStatus::Rewritten, rows))
        }
    }
}

/// Savepoint-scoped metadata install. Returns the number of overlapping dumps removed.
fn install(metadata: &dyn MetadataStore, job: &Job, bundle: &GroupedBundleData) -> Result<u64> {
    let mut tx = metadata.begin().wrap_err("metadata_store.begin")?;
    tx.mark(INSTALL_MARK).wrap_err("metadata_store.mark")?;

    match install_steps(&mut *tx, job, bundle) {
        Ok(removed) => {
            tx.release_mark(INSTALL_MARK)
                .wrap_err("metadata_store.release_mark")?;
            tx.commit().wrap_err("metadata_store.commit")?;
            Ok(removed)
        }
        Err(e) => {
            if let Err(rollback) = tx.rollback_to_mark(INSTALL_MARK) {
                warn!("upload {}: rollback to savepoint failed: {}", job.id, rollback);
            }
            if let Err(rollback) = tx.rollback() {
                warn!("upload {}: rollback failed: {}", job.id, rollback);
            }
            Err(e)
        }
    }
}

fn install_steps(
    tx: &mut (dyn MetadataTransaction + '_),
    job: &Job,
    bundle: &GroupedBundleData,
) -> Result<u64> {
    let removed = tx
        .delete_overlapping_dumps(job.id, job.repository_id, &job.commit, &job.root, &job.indexer)
        .wrap_err("metadata_store.delete_overlapping_dumps")?;
    tx.update_packages(job.id, &bundle.packages)
        .wrap_err("metadata_store.update_packages")?;
    tx.update_package_references(job.id, &bundle.package_references)
        .wrap_err("metadata_store.update_package_references")?;
    tx.insert_dependency_sync_job(job.id)
        .wrap_err("metadata_store.insert_dependency_sync_job")?;
    tx.set_repository_dirty(job.repository_id)
        .wrap_err("metadata_store.set_repository_dirty")?;
    tx.install_dump(&Dump::new(
        job.id,
        job.repository_id,
        &job.commit,
        &job.root,
        &job.indexer,
    ))
    .wrap_err("metadata_store.install_dump")?;
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use codeintel_storage::{
        JobState, MetaData, Package, PackageReference, SqliteBulkStore, SqliteMetadataStore,
    };

    fn job(id: i64) -> Job {
        Job {
            id,
            repository_id: 50,
            commit: "deadbeef1".to_string(),
            root: "sub3/".to_string(),
            indexer: "lsif-go".to_string(),
            state: JobState::Processing,
            failure_message: None,
            queued_at: Utc::now(),
            process_after: None,
            started_at: Some(Utc::now()),
            finished_at: None,
            last_heartbeat_at: Some(Utc::now()),
            num_resets: 0,
            num_failures: 0,
        }
    }

    fn bundle(tool_version: &str) -> Arc<GroupedBundleData> {
        let mut documents = std::collections::BTreeMap::new();
        documents.insert("main.go".to_string(), Default::default());
        Arc::new(GroupedBundleData {
            meta: MetaData {
                lsif_version: "0.4.3".to_string(),
                tool_name: "lsif-go".to_string(),
                tool_version: tool_version.to_string(),
                num_result_chunks: 1,
            },
            documents,
            packages: vec![Package::new("gomod", "gomod", "example.com/a", "v1.0.0")],
            package_references: vec![PackageReference {
                package: Package::new("gomod", "gomod", "example.com/b", "v0.2.0"),
            }],
            ..Default::default()
        })
    }

    fn writer(policy: ReplayPolicy) -> (DualStoreWriter, Arc<SqliteBulkStore>, Arc<SqliteMetadataStore>) {
        let bulk = Arc::new(SqliteBulkStore::in_memory().unwrap());
        let metadata = Arc::new(SqliteMetadataStore::in_memory().unwrap());
        (
            DualStoreWriter::new(bulk.clone(), metadata.clone(), policy),
            bulk,
            metadata,
        )
    }

    #[test]
    fn test_policy_serde() {
        assert_eq!(ReplayPolicy::default(), ReplayPolicy::VerifyDigest);
        let parsed: ReplayPolicy = serde_yaml::from_str("trust_deterministic").unwrap();
        assert_eq!(parsed, ReplayPolicy::TrustDeterministic);
        assert_eq!(parsed.as_str(), "trust_deterministic");
    }

    #[tokio::test]
    async fn test_write_installs_everything() {
        let (writer, bulk, metadata) = writer(ReplayPolicy::VerifyDigest);
        let report = writer
            .write(&job(1), bundle("1.0"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.bulk, BulkWriteStatus::Written);
        assert_eq!(report.rows_written, 2);
        assert_eq!(bulk.row_counts(1).unwrap().documents, 1);
        assert!(metadata.get_dump(1).unwrap().is_some());
        assert_eq!(metadata.packages(1).unwrap().len(), 1);
        assert_eq!(metadata.package_references(1).unwrap().len(), 1);
        assert_eq!(metadata.dependency_sync_jobs(1).unwrap().len(), 1);
        assert_eq!(metadata.dirty_token(50).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_verify_digest_rewrites_on_mismatch() {
        let (writer, bulk, _) = writer(ReplayPolicy::VerifyDigest);
        let cancel = CancellationToken::new();

        writer.write(&job(1), bundle("1.0"), &cancel).await.unwrap();
        let same = writer.write(&job(1), bundle("1.0"), &cancel).await.unwrap();
        assert_eq!(same.bulk, BulkWriteStatus::AlreadyPresent);

        let changed = writer.write(&job(1), bundle("2.0"), &cancel).await.unwrap();
        assert_eq!(changed.bulk, BulkWriteStatus::Rewritten);
        assert_eq!(
            bulk.content_digest(1).unwrap(),
            Some(bundle("2.0").content_digest().unwrap())
        );
    }

    #[tokio::test]
    async fn test_trust_deterministic_keeps_rows() {
        let (writer, bulk, _) = writer(ReplayPolicy::TrustDeterministic);
        let cancel = CancellationToken::new();

        writer.write(&job(1), bundle("1.0"), &cancel).await.unwrap();
        let report = writer.write(&job(1), bundle("2.0"), &cancel).await.unwrap();
        assert_eq!(report.bulk, BulkWriteStatus::AlreadyPresent);
        assert_eq!(
            bulk.content_digest(1).unwrap(),
            Some(bundle("1.0").content_digest().unwrap())
        );
    }

    #[tokio::test]
    async fn test_cancelled_before_write_leaves_no_rows() {
        let (writer, bulk, metadata) = writer(ReplayPolicy::VerifyDigest);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = writer.write(&job(1), bundle("1.0"), &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(bulk.row_counts(1).unwrap().total(), 0);
        assert!(metadata.get_dump(1).unwrap().is_none());
    }
}
