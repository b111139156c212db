//! Collaborator adapters
//!
//! - `GitBackend`: git2 repositories on local disk
//! - `FsBlobStore` / `MemoryBlobStore`: artifact storage
//! - `StaticRegistry`: repositories from configuration
//! - `MemoryVersionControl`: scripted commits (for testing)

pub mod blob;
pub mod git;
pub mod memory_vcs;
pub mod registry;

pub use blob::{FsBlobStore, MemoryBlobStore};
pub use git::GitBackend;
pub use memory_vcs::MemoryVersionControl;
pub use registry::StaticRegistry;
