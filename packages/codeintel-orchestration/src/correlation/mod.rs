//! Bundle correlation
//!
//! Turns a raw LSIF stream into `GroupedBundleData`:
//!
//! ```text
//! read (element -> state) -> canonicalize -> prune (needs VCS) -> group
//! ```
//!
//! Reading and grouping are CPU bound and run on the blocking pool. Pruning
//! asks the version-control collaborator which files exist, so it is the one
//! async step in between.

pub mod canonicalize;
pub mod element;
pub mod group;
pub mod prune;
pub mod reader;
pub mod state;

pub use group::{num_result_chunks, result_chunk_index, MAX_NUM_RESULT_CHUNKS};
pub use state::{DisjointIdSet, State};

use codeintel_storage::GroupedBundleData;
use std::io::Read;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::collaborators::ChildrenLookup;
use crate::error::{OrchestratorError, Result};

/// Correlate one artifact. `root` is the upload root inside the repository.
pub async fn correlate(
    reader: Box<dyn Read + Send>,
    root: &str,
    lookup: &dyn ChildrenLookup,
    cancel: &CancellationToken,
) -> Result<GroupedBundleData> {
    let token = cancel.clone();
    let mut state = tokio::task::spawn_blocking(move || -> Result<State> {
        let mut state = reader::read_state(reader, &token)?;
        canonicalize::canonicalize(&mut state);
        Ok(state)
    })
    .await??;

    let directories = prune::directories(&state, root);
    let children = lookup.children(&directories).await?;
    let removed = prune::prune(&mut state, root, &children);
    if removed > 0 {
        debug!("pruned {} documents missing from the commit", removed);
    }

    if cancel.is_cancelled() {
        return Err(OrchestratorError::Cancelled);
    }

    let bundle = tokio::task::spawn_blocking(move || group::group(state)).await?;
    Ok(bundle)
}
