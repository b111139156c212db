//! Grouping: canonical state -> write-ready bundle

use codeintel_storage::{
    DocumentData, DocumentIdRangeId, ElementId, GroupedBundleData, Location, MetaData,
    MonikerLocations, Package, PackageReference, RangeData, ResultChunkData,
};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

use super::state::{Links, ResultItems, State};

/// Target number of results stored per chunk
pub const RESULTS_PER_RESULT_CHUNK: usize = 500;
pub const MAX_NUM_RESULT_CHUNKS: usize = 1000;

pub fn num_result_chunks(num_results: usize) -> u32 {
    (num_results / RESULTS_PER_RESULT_CHUNK).clamp(1, MAX_NUM_RESULT_CHUNKS) as u32
}

/// Chunk holding the result with the given id
pub fn result_chunk_index(id: ElementId, num_chunks: u32) -> u32 {
    let digest = Sha256::digest(id.to_string().as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % u64::from(num_chunks.max(1))) as u32
}

pub fn group(state: State) -> GroupedBundleData {
    let num_chunks = num_result_chunks(state.num_results());

    GroupedBundleData {
        meta: MetaData {
            lsif_version: state.lsif_version.clone(),
            tool_name: state.tool_name.clone(),
            tool_version: state.tool_version.clone(),
            num_result_chunks: num_chunks,
        },
        documents: group_documents(&state),
        result_chunks: group_result_chunks(&state, num_chunks),
        definitions: gather_moniker_locations(
            &state,
            &state.definition_results,
            &["import", "export"],
            |l| l.definition_result_id,
        ),
        references: gather_moniker_locations(
            &state,
            &state.reference_results,
            &["import", "export"],
            |l| l.reference_result_id,
        ),
        implementations: gather_moniker_locations(
            &state,
            &state.definition_results,
            &["implementation"],
            |l| l.definition_result_id,
        ),
        packages: gather_packages(&state, "export"),
        package_references: gather_packages(&state, "import")
            .into_iter()
            .map(|package| PackageReference { package })
            .collect(),
    }
}

fn group_documents(state: &State) -> BTreeMap<String, DocumentData> {
    let mut documents = BTreeMap::new();

    for (document_id, path) in &state.documents {
        let mut data = DocumentData::default();

        for range_id in state.contains.get(document_id).into_iter().flatten() {
            let Some(range) = state.ranges.get(range_id) else {
                continue;
            };
            let moniker_ids: Vec<ElementId> = state
                .attached_monikers
                .get(range_id)
                .into_iter()
                .flatten()
                .copied()
                .filter(|id| state.monikers.contains_key(id))
                .collect();

            if let Some(hover_id) = range.links.hover_result_id {
                if let Some(hover) = state.hovers.get(&hover_id) {
                    data.hover_results.insert(hover_id, hover.clone());
                }
            }
            for moniker_id in &moniker_ids {
                let moniker = &state.monikers[moniker_id];
                if let Some(info_id) = moniker.package_information_id {
                    if let Some(info) = state.package_information.get(&info_id) {
                        data.package_information.insert(info_id, info.clone());
                    }
                }
                data.monikers.insert(*moniker_id, moniker.clone());
            }

            data.ranges.insert(
                *range_id,
                RangeData {
                    start_line: range.start_line,
                    start_character: range.start_character,
                    end_line: range.end_line,
                    end_character: range.end_character,
                    definition_result_id: range.links.definition_result_id,
                    reference_result_id: range.links.reference_result_id,
                    implementation_result_id: range.links.implementation_result_id,
                    hover_result_id: range.links.hover_result_id,
                    moniker_ids,
                },
            );
        }

        for result_id in state.document_diagnostics.get(document_id).into_iter().flatten() {
            if let Some(diagnostics) = state.diagnostic_results.get(result_id) {
                data.diagnostics.extend(diagnostics.iter().cloned());
            }
        }

        documents.insert(path.clone(), data);
    }
    documents
}

fn group_result_chunks(state: &State, num_chunks: u32) -> BTreeMap<u32, ResultChunkData> {
    let mut chunks: BTreeMap<u32, ResultChunkData> = BTreeMap::new();

    let all_results = state
        .definition_results
        .iter()
        .chain(state.reference_results.iter())
        .chain(state.implementation_results.iter());

    for (result_id, items) in all_results {
        let chunk = chunks
            .entry(result_chunk_index(*result_id, num_chunks))
            .or_default();

        let mut pairs = Vec::new();
        for (document_id, range_ids) in items {
            let Some(path) = state.documents.get(document_id) else {
                continue;
            };
            chunk.document_paths.insert(*document_id, path.clone());
            pairs.extend(range_ids.iter().map(|range_id| DocumentIdRangeId {
                document_id: *document_id,
                range_id: *range_id,
            }));
        }
        pairs.sort();
        chunk.document_id_range_ids.insert(*result_id, pairs);
    }
    chunks
}

fn gather_moniker_locations(
    state: &State,
    results: &BTreeMap<ElementId, ResultItems>,
    kinds: &[&str],
    result_of: fn(&Links) -> Option<ElementId>,
) -> Vec<MonikerLocations> {
    let mut by_moniker: BTreeMap<(String, String, String), BTreeSet<Location>> = BTreeMap::new();

    for range_ids in state
        .documents
        .keys()
        .filter_map(|document_id| state.contains.get(document_id))
    {
        for range_id in range_ids {
            let Some(range) = state.ranges.get(range_id) else {
                continue;
            };
            let Some(items) = result_of(&range.links).and_then(|id| results.get(&id)) else {
                continue;
            };

            for moniker_id in state.attached_monikers.get(range_id).into_iter().flatten() {
                let Some(moniker) = state.monikers.get(moniker_id) else {
                    continue;
                };
                if !kinds.contains(&moniker.kind.as_str()) {
                    continue;
                }

                let locations = by_moniker
                    .entry((
                        moniker.kind.clone(),
                        moniker.scheme.clone(),
                        moniker.identifier.clone(),
                    ))
                    .or_default();
                for (document_id, item_ranges) in items {
                    let Some(path) = state.documents.get(document_id) else {
                        continue;
                    };
                    for item in item_ranges.iter().filter_map(|id| state.ranges.get(id)) {
                        locations.insert(Location {
                            path: path.clone(),
                            start_line: item.start_line,
                            start_character: item.start_character,
                            end_line: item.end_line,
                            end_character: item.end_character,
                        });
                    }
                }
            }
        }
    }

    by_moniker
        .into_iter()
        .filter(|(_, locations)| !locations.is_empty())
        .map(|((kind, scheme, identifier), locations)| MonikerLocations {
            kind,
            scheme,
            identifier,
            locations: locations.into_iter().collect(),
        })
        .collect()
}

fn gather_packages(state: &State, kind: &str) -> Vec<Package> {
    let packages: BTreeSet<Package> = state
        .monikers
        .values()
        .filter(|moniker| moniker.kind == kind)
        .filter_map(|moniker| {
            let info = state
                .package_information
                .get(&moniker.package_information_id?)?;
            Some(Package::new(
                moniker.scheme.clone(),
                info.manager.clone(),
                info.name.clone(),
                info.version.clone(),
            ))
        })
        .collect();
    packages.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_num_result_chunks_bounds() {
        assert_eq!(num_result_chunks(0), 1);
        assert_eq!(num_result_chunks(999), 1);
        assert_eq!(num_result_chunks(1500), 3);
        assert_eq!(num_result_chunks(10_000_000), 1000);
    }

    #[test]
    fn test_chunk_index_is_stable() {
        assert_eq!(result_chunk_index(42, 1), 0);
        let a = result_chunk_index(42, 7);
        assert_eq!(a, result_chunk_index(42, 7));
        assert!(a < 7);
    }

    #[test]
    fn test_empty_state_groups_to_one_chunk() {
        let bundle = group(State::default());
        assert_eq!(bundle.meta.num_result_chunks, 1);
        assert!(bundle.documents.is_empty());
        assert!(bundle.result_chunks.is_empty());
    }
}
