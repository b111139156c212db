//! In-memory correlation state built while reading an LSIF stream

use codeintel_storage::{Diagnostic, ElementId, MonikerData, PackageInformationData};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::{OrchestratorError, Result};

/// Maps textual element ids to dense integers in first-seen order
#[derive(Debug, Default)]
pub struct IdInterner {
    ids: HashMap<String, ElementId>,
}

impl IdInterner {
    /// Register a new id. Fails if the id was already defined.
    pub fn define(&mut self, raw: &str) -> Result<ElementId> {
        if self.ids.contains_key(raw) {
            return Err(OrchestratorError::parse(format!(
                "duplicate element id {}",
                raw
            )));
        }
        let id = self.ids.len() as ElementId + 1;
        self.ids.insert(raw.to_string(), id);
        Ok(id)
    }

    /// Resolve an id that must already be defined
    pub fn resolve(&self, raw: &str) -> Result<ElementId> {
        self.ids.get(raw).copied().ok_or_else(|| {
            OrchestratorError::parse(format!("reference to unknown element {}", raw))
        })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Union-find over element ids. The smallest id of a set is its representative.
#[derive(Debug, Clone, Default)]
pub struct DisjointIdSet {
    parent: BTreeMap<ElementId, ElementId>,
}

impl DisjointIdSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&mut self, id: ElementId) -> ElementId {
        let mut root = id;
        while let Some(&parent) = self.parent.get(&root) {
            if parent == root {
                break;
            }
            root = parent;
        }

        let mut current = id;
        while current != root {
            let next = match self.parent.insert(current, root) {
                Some(next) => next,
                None => break,
            };
            current = next;
        }
        root
    }

    pub fn union(&mut self, a: ElementId, b: ElementId) {
        let ra = self.find(a);
        let rb = self.find(b);
        self.parent.entry(ra).or_insert(ra);
        self.parent.entry(rb).or_insert(rb);
        if ra == rb {
            return;
        }
        let (root, child) = if ra < rb { (ra, rb) } else { (rb, ra) };
        self.parent.insert(child, root);
    }

    /// Every id linked to `id`, including itself
    pub fn extract_set(&mut self, id: ElementId) -> BTreeSet<ElementId> {
        let root = self.find(id);
        let mut set: BTreeSet<ElementId> = self
            .members()
            .into_iter()
            .filter(|&m| self.find(m) == root)
            .collect();
        set.insert(id);
        set
    }

    /// All sets with more than one member, keyed by representative
    pub fn groups(&mut self) -> BTreeMap<ElementId, BTreeSet<ElementId>> {
        let mut groups: BTreeMap<ElementId, BTreeSet<ElementId>> = BTreeMap::new();
        for member in self.members() {
            let root = self.find(member);
            groups.entry(root).or_default().insert(member);
        }
        groups.retain(|_, members| members.len() > 1);
        groups
    }

    fn members(&self) -> Vec<ElementId> {
        self.parent.keys().copied().collect()
    }
}

/// Result links shared by ranges and result sets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Links {
    pub definition_result_id: Option<ElementId>,
    pub reference_result_id: Option<ElementId>,
    pub implementation_result_id: Option<ElementId>,
    pub hover_result_id: Option<ElementId>,
}

impl Links {
    /// Copy links that are still unset from `other`
    pub fn fill_from(&mut self, other: &Links) {
        self.definition_result_id = self.definition_result_id.or(other.definition_result_id);
        self.reference_result_id = self.reference_result_id.or(other.reference_result_id);
        self.implementation_result_id = self
            .implementation_result_id
            .or(other.implementation_result_id);
        self.hover_result_id = self.hover_result_id.or(other.hover_result_id);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RangeState {
    pub start_line: u32,
    pub start_character: u32,
    pub end_line: u32,
    pub end_character: u32,
    pub links: Links,
}

/// Items of a definition/reference/implementation result: document -> ranges
pub type ResultItems = BTreeMap<ElementId, BTreeSet<ElementId>>;

#[derive(Debug, Default)]
pub struct State {
    pub lsif_version: String,
    pub project_root: String,
    pub tool_name: String,
    pub tool_version: String,

    /// Document id -> path relative to the project root
    pub documents: BTreeMap<ElementId, String>,
    pub ranges: BTreeMap<ElementId, RangeState>,
    pub result_sets: BTreeMap<ElementId, Links>,
    pub definition_results: BTreeMap<ElementId, ResultItems>,
    pub reference_results: BTreeMap<ElementId, ResultItems>,
    pub implementation_results: BTreeMap<ElementId, ResultItems>,
    pub hovers: BTreeMap<ElementId, String>,
    pub monikers: BTreeMap<ElementId, MonikerData>,
    pub package_information: BTreeMap<ElementId, PackageInformationData>,
    pub diagnostic_results: BTreeMap<ElementId, Vec<Diagnostic>>,

    /// Range or result set -> result set
    pub next: BTreeMap<ElementId, ElementId>,
    /// Document -> ranges
    pub contains: BTreeMap<ElementId, BTreeSet<ElementId>>,
    /// Document -> diagnostic results
    pub document_diagnostics: BTreeMap<ElementId, BTreeSet<ElementId>>,
    /// Range or result set -> monikers
    pub attached_monikers: BTreeMap<ElementId, BTreeSet<ElementId>>,

    pub linked_monikers: DisjointIdSet,
    pub linked_reference_results: DisjointIdSet,
}

impl State {
    /// Mutable links of a range or result set
    pub fn links_mut(&mut self, id: ElementId) -> Option<&mut Links> {
        if let Some(range) = self.ranges.get_mut(&id) {
            return Some(&mut range.links);
        }
        self.result_sets.get_mut(&id)
    }

    pub fn num_results(&self) -> usize {
        self.definition_results.len()
            + self.reference_results.len()
            + self.implementation_results.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interner_dense_first_seen_order() {
        let mut ids = IdInterner::default();
        assert_eq!(ids.define("a").unwrap(), 1);
        assert_eq!(ids.define("7").unwrap(), 2);
        assert_eq!(ids.resolve("a").unwrap(), 1);
        assert!(ids.define("a").is_err());
        assert!(ids.resolve("b").is_err());
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn test_union_find_transitive() {
        let mut set = DisjointIdSet::new();
        set.union(5, 3);
        set.union(3, 9);
        set.union(11, 12);

        assert_eq!(set.find(9), 3);
        assert_eq!(set.extract_set(5), BTreeSet::from([3, 5, 9]));
        assert_eq!(set.extract_set(42), BTreeSet::from([42]));

        let groups = set.groups();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[&11], BTreeSet::from([11, 12]));
    }

    #[test]
    fn test_links_fill_only_missing() {
        let mut links = Links {
            hover_result_id: Some(1),
            ..Default::default()
        };
        links.fill_from(&Links {
            hover_result_id: Some(2),
            definition_result_id: Some(3),
            ..Default::default()
        });
        assert_eq!(links.hover_result_id, Some(1));
        assert_eq!(links.definition_result_id, Some(3));
    }
}
