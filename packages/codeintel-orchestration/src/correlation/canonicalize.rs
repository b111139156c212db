//! Canonicalization passes
//!
//! Run in order, each relying on the previous one:
//!
//! 1. documents with the same path are merged into the first one
//! 2. linked reference results are merged into their representative
//! 3. result-set `next` chains are flattened into every result set
//! 4. ranges inherit the data of their result set
//! 5. moniker sets are closed over `nextMoniker` links

use codeintel_storage::ElementId;
use std::collections::{BTreeMap, BTreeSet};

use super::state::{Links, ResultItems, State};

pub fn canonicalize(state: &mut State) {
    canonicalize_documents(state);
    canonicalize_reference_results(state);
    canonicalize_result_sets(state);
    canonicalize_ranges(state);
    canonicalize_monikers(state);

    state.result_sets.clear();
    state.next.clear();
}

fn canonicalize_documents(state: &mut State) {
    let mut first_by_path: BTreeMap<String, ElementId> = BTreeMap::new();
    let mut aliases: BTreeMap<ElementId, ElementId> = BTreeMap::new();

    for (&id, path) in &state.documents {
        match first_by_path.get(path) {
            Some(&canonical) => {
                aliases.insert(id, canonical);
            }
            None => {
                first_by_path.insert(path.clone(), id);
            }
        }
    }

    for (&alias, &canonical) in &aliases {
        state.documents.remove(&alias);
        if let Some(ranges) = state.contains.remove(&alias) {
            state.contains.entry(canonical).or_default().extend(ranges);
        }
        if let Some(diagnostics) = state.document_diagnostics.remove(&alias) {
            state
                .document_diagnostics
                .entry(canonical)
                .or_default()
                .extend(diagnostics);
        }
        for results in [
            &mut state.definition_results,
            &mut state.reference_results,
            &mut state.implementation_results,
        ] {
            for items in results.values_mut() {
                if let Some(ranges) = items.remove(&alias) {
                    items.entry(canonical).or_default().extend(ranges);
                }
            }
        }
    }
}

fn canonicalize_reference_results(state: &mut State) {
    let groups = state.linked_reference_results.groups();
    let mut representative: BTreeMap<ElementId, ElementId> = BTreeMap::new();

    for (&root, members) in &groups {
        let mut merged = ResultItems::new();
        for member in members {
            if let Some(items) = state.reference_results.remove(member) {
                for (document, ranges) in items {
                    merged.entry(document).or_default().extend(ranges);
                }
            }
            representative.insert(*member, root);
        }
        state.reference_results.insert(root, merged);
    }

    if representative.is_empty() {
        return;
    }

    let relink = |links: &mut Links| {
        if let Some(id) = links.reference_result_id {
            links.reference_result_id = Some(representative.get(&id).copied().unwrap_or(id));
        }
    };
    state.ranges.values_mut().for_each(|r| relink(&mut r.links));
    state.result_sets.values_mut().for_each(relink);
}

fn canonicalize_result_sets(state: &mut State) {
    let ids: Vec<ElementId> = state.result_sets.keys().copied().collect();
    let mut merged: Vec<(ElementId, Links, BTreeSet<ElementId>)> = Vec::with_capacity(ids.len());

    for id in ids {
        let mut links = state.result_sets.get(&id).copied().unwrap_or_default();
        let mut monikers = state.attached_monikers.get(&id).cloned().unwrap_or_default();

        let mut visited = BTreeSet::from([id]);
        let mut current = id;
        while let Some(&next) = state.next.get(&current) {
            if !visited.insert(next) {
                break;
            }
            if let Some(next_links) = state.result_sets.get(&next) {
                links.fill_from(next_links);
            }
            if let Some(next_monikers) = state.attached_monikers.get(&next) {
                monikers.extend(next_monikers.iter().copied());
            }
            current = next;
        }
        merged.push((id, links, monikers));
    }

    for (id, links, monikers) in merged {
        state.result_sets.insert(id, links);
        if !monikers.is_empty() {
            state.attached_monikers.insert(id, monikers);
        }
    }
}

fn canonicalize_ranges(state: &mut State) {
    let State {
        ranges,
        result_sets,
        next,
        attached_monikers,
        ..
    } = state;

    for (id, range) in ranges.iter_mut() {
        let Some(result_set) = next.get(id) else {
            continue;
        };
        if let Some(links) = result_sets.get(result_set) {
            range.links.fill_from(links);
        }
        if let Some(inherited) = attached_monikers.get(result_set).cloned() {
            attached_monikers.entry(*id).or_default().extend(inherited);
        }
    }
}

fn canonicalize_monikers(state: &mut State) {
    let groups = state.linked_monikers.groups();
    if groups.is_empty() {
        return;
    }

    let mut group_of: BTreeMap<ElementId, &BTreeSet<ElementId>> = BTreeMap::new();
    for members in groups.values() {
        for member in members {
            group_of.insert(*member, members);
        }
    }

    for monikers in state.attached_monikers.values_mut() {
        let expanded: BTreeSet<ElementId> = monikers
            .iter()
            .filter_map(|m| group_of.get(m))
            .flat_map(|members| members.iter().copied())
            .collect();
        monikers.extend(expanded);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::state::RangeState;

    #[test]
    fn test_duplicate_documents_are_merged() {
        let mut state = State::default();
        state.documents.insert(1, "a.go".to_string());
        state.documents.insert(2, "a.go".to_string());
        state.contains.insert(1, BTreeSet::from([10]));
        state.contains.insert(2, BTreeSet::from([11]));
        state
            .definition_results
            .insert(20, BTreeMap::from([(2, BTreeSet::from([11]))]));

        canonicalize(&mut state);

        assert_eq!(state.documents.len(), 1);
        assert_eq!(state.contains[&1], BTreeSet::from([10, 11]));
        assert_eq!(state.definition_results[&20][&1], BTreeSet::from([11]));
    }

    #[test]
    fn test_result_set_chain_flows_into_range() {
        let mut state = State::default();
        state.ranges.insert(1, RangeState::default());
        state.result_sets.insert(
            2,
            Links {
                hover_result_id: Some(7),
                ..Default::default()
            },
        );
        state.result_sets.insert(
            3,
            Links {
                hover_result_id: Some(8),
                definition_result_id: Some(9),
                ..Default::default()
            },
        );
        state.next.insert(1, 2);
        state.next.insert(2, 3);
        state.attached_monikers.insert(3, BTreeSet::from([30]));

        canonicalize(&mut state);

        let links = state.ranges[&1].links;
        assert_eq!(links.hover_result_id, Some(7));
        assert_eq!(links.definition_result_id, Some(9));
        assert_eq!(state.attached_monikers[&1], BTreeSet::from([30]));
        assert!(state.result_sets.is_empty());
    }

    #[test]
    fn test_next_cycle_terminates() {
        let mut state = State::default();
        state.result_sets.insert(1, Links::default());
        state.result_sets.insert(2, Links::default());
        state.next.insert(1, 2);
        state.next.insert(2, 1);
        canonicalize(&mut state);
    }

    #[test]
    fn test_linked_reference_results_merge() {
        let mut state = State::default();
        state.ranges.insert(
            1,
            RangeState {
                links: Links {
                    reference_result_id: Some(6),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        state
            .reference_results
            .insert(5, BTreeMap::from([(100, BTreeSet::from([1]))]));
        state
            .reference_results
            .insert(6, BTreeMap::from([(100, BTreeSet::from([2]))]));
        state.linked_reference_results.union(5, 6);

        canonicalize(&mut state);

        assert_eq!(state.reference_results.len(), 1);
        assert_eq!(state.reference_results[&5][&100], BTreeSet::from([1, 2]));
        assert_eq!(state.ranges[&1].links.reference_result_id, Some(5));
    }

    #[test]
    fn test_next_moniker_closure() {
        let mut state = State::default();
        state.ranges.insert(1, RangeState::default());
        state.attached_monikers.insert(1, BTreeSet::from([10]));
        state.linked_monikers.union(10, 11);
        state.linked_monikers.union(11, 12);

        canonicalize(&mut state);

        assert_eq!(state.attached_monikers[&1], BTreeSet::from([10, 11, 12]));
    }
}
