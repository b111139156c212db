//! codeintel-storage - stores behind the upload ingestion pipeline
//!
//! Three stores, each independently failing:
//!
//! 1. **Job queue**: upload jobs with lease-based ownership and stall recovery
//! 2. **Bulk analysis store**: documents, result chunks and moniker locations
//!    keyed by upload id, written at-least-once
//! 3. **Metadata store**: dumps, packages, commit dates, dirty flags and
//!    dependency-sync jobs, written under a savepoint-scoped transaction
//!
//! ## Usage
//!
//! ```rust,ignore
//! use codeintel_storage::{JobStore, NewJob, SqliteJobStore};
//!
//! let queue = SqliteJobStore::open("queue.db", "lsif_uploads")?;
//! let id = queue.enqueue(&NewJob::new(50, "deadbeef1", "sub3/", "lsif-go")).await?;
//!
//! if let Some(claim) = queue.dequeue().await? {
//!     // ... process ...
//!     queue.complete(claim.id(), claim.token).await?;
//! }
//! ```

pub mod domain;
pub mod error;

#[cfg(feature = "sqlite")]
pub mod infrastructure;

pub use error::{ErrorKind, Result, StorageError};

pub use domain::{
    BulkRowCounts, BulkStore, BulkTransaction, Claim, DependencySyncJob, Diagnostic,
    DocumentData, DocumentIdRangeId, Dump, ElementId, GroupedBundleData, Job, JobState,
    JobStateCounts, JobStore, Location, MetaData, MetadataStore, MetadataTransaction,
    MonikerData, MonikerLocations, NestedTransaction, NewJob, Package, PackageInformationData,
    PackageReference, RangeData, ResetOutcome, ResultChunkData, RESET_LIMIT_MESSAGE,
};

#[cfg(feature = "sqlite")]
pub use infrastructure::{SqliteBulkStore, SqliteJobStore, SqliteMetadataStore};
