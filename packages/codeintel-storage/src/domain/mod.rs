//! Domain layer for the upload ingestion stores
//!
//! # Domain Models
//!
//! - `Job`: one ingestion request held by a queue
//! - `GroupedBundleData`: correlated artifact, ready to be written
//! - `Dump`: durable record of an ingested upload
//! - `DependencySyncJob`: companion record for the downstream scheduler
//!
//! # Port Traits
//!
//! - `JobStore`: queue with lease-based ownership
//! - `BulkStore` / `BulkTransaction`: bulk analysis tables
//! - `MetadataStore` / `MetadataTransaction`: relational bookkeeping
//! - `NestedTransaction`: savepoint-scoped partial rollback

pub mod bundle;
pub mod dump;
pub mod job;
pub mod ports;

pub use bundle::{
    Diagnostic, DocumentData, DocumentIdRangeId, ElementId, GroupedBundleData, Location,
    MetaData, MonikerData, MonikerLocations, Package, PackageInformationData, PackageReference,
    RangeData, ResultChunkData,
};
pub use dump::{BulkRowCounts, DependencySyncJob, Dump};
pub use job::{
    Claim, Job, JobState, JobStateCounts, NewJob, ResetOutcome, RESET_LIMIT_MESSAGE,
};
pub use ports::{
    BulkStore, BulkTransaction, JobStore, MetadataStore, MetadataTransaction, NestedTransaction,
};
