//! Grouped bundle data: the correlated, write-ready form of one artifact.
//!
//! Every collection is ordered (`BTreeMap` or a sorted `Vec`) so the same
//! artifact always serializes to the same bytes. The bulk writer relies on
//! this when it compares content digests of a replayed upload.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::error::Result;

/// Identifier of an element inside one bundle (ranges, result sets, monikers, ...)
pub type ElementId = u64;

/// Tool and layout metadata of a bundle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaData {
    pub lsif_version: String,
    pub tool_name: String,
    pub tool_version: String,
    pub num_result_chunks: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeData {
    pub start_line: u32,
    pub start_character: u32,
    pub end_line: u32,
    pub end_character: u32,
    pub definition_result_id: Option<ElementId>,
    pub reference_result_id: Option<ElementId>,
    pub implementation_result_id: Option<ElementId>,
    pub hover_result_id: Option<ElementId>,
    #[serde(default)]
    pub moniker_ids: Vec<ElementId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonikerData {
    /// `import`, `export`, `local` or `implementation`
    pub kind: String,
    pub scheme: String,
    pub identifier: String,
    pub package_information_id: Option<ElementId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageInformationData {
    pub manager: String,
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: u8,
    pub code: String,
    pub message: String,
    pub source: String,
    pub start_line: u32,
    pub start_character: u32,
    pub end_line: u32,
    pub end_character: u32,
}

/// Everything needed to answer hover/definition queries inside one document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentData {
    pub ranges: BTreeMap<ElementId, RangeData>,
    pub hover_results: BTreeMap<ElementId, String>,
    pub monikers: BTreeMap<ElementId, MonikerData>,
    pub package_information: BTreeMap<ElementId, PackageInformationData>,
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentIdRangeId {
    pub document_id: ElementId,
    pub range_id: ElementId,
}

/// One shard of the definition/reference/implementation results of a bundle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultChunkData {
    pub document_paths: BTreeMap<ElementId, String>,
    pub document_id_range_ids: BTreeMap<ElementId, Vec<DocumentIdRangeId>>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Location {
    pub path: String,
    pub start_line: u32,
    pub start_character: u32,
    pub end_line: u32,
    pub end_character: u32,
}

/// All locations attached to one moniker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonikerLocations {
    pub kind: String,
    pub scheme: String,
    pub identifier: String,
    pub locations: Vec<Location>,
}

/// A package identity emitted or consumed by a bundle
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Package {
    pub scheme: String,
    pub manager: String,
    pub name: String,
    pub version: String,
}

impl Package {
    pub fn new(
        scheme: impl Into<String>,
        manager: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            scheme: scheme.into(),
            manager: manager.into(),
            name: name.into(),
            version: version.into(),
        }
    }
}

/// A package consumed by a bundle; `version` is the requested version or range
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PackageReference {
    pub package: Package,
}

/// Correlated data of one artifact
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupedBundleData {
    pub meta: MetaData,
    /// Keyed by path relative to the upload root
    pub documents: BTreeMap<String, DocumentData>,
    /// Keyed by chunk index in `0..meta.num_result_chunks`
    pub result_chunks: BTreeMap<u32, ResultChunkData>,
    pub definitions: Vec<MonikerLocations>,
    pub references: Vec<MonikerLocations>,
    pub implementations: Vec<MonikerLocations>,
    pub packages: Vec<Package>,
    pub package_references: Vec<PackageReference>,
}

impl GroupedBundleData {
    /// Hex SHA-256 of the canonical JSON encoding of the bundle
    pub fn content_digest(&self) -> Result<String> {
        let bytes = serde_json::to_vec(self)?;
        let digest = Sha256::digest(&bytes);
        Ok(digest.iter().map(|b| format!("{:02x}", b)).collect())
    }
}
