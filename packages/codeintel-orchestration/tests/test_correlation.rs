//! Correlation properties: union-find, chunk assignment, determinism

use async_trait::async_trait;
use codeintel_orchestration::correlation::{
    correlate, num_result_chunks, result_chunk_index, DisjointIdSet, MAX_NUM_RESULT_CHUNKS,
};
use codeintel_orchestration::{ChildrenLookup, Result};
use proptest::prelude::*;
use std::collections::{BTreeSet, HashMap};
use std::io::Cursor;
use tokio_util::sync::CancellationToken;

/// Children lookup backed by a fixed list of repository files
struct Files(Vec<String>);

#[async_trait]
impl ChildrenLookup for Files {
    async fn children(&self, dirnames: &[String]) -> Result<HashMap<String, Vec<String>>> {
        Ok(dirnames
            .iter()
            .map(|dir| {
                let prefix = if dir.is_empty() {
                    String::new()
                } else {
                    format!("{}/", dir)
                };
                let children = self
                    .0
                    .iter()
                    .filter(|f| f.starts_with(&prefix) && !f[prefix.len()..].contains('/'))
                    .cloned()
                    .collect();
                (dir.clone(), children)
            })
            .collect())
    }
}

fn dump(duplicate_document: bool) -> String {
    let mut lines = vec![
        r#"{"id":1,"type":"vertex","label":"metaData","version":"0.4.3","projectRoot":"file:///w"}"#,
        r#"{"id":2,"type":"vertex","label":"document","uri":"file:///w/a.rs"}"#,
        r#"{"id":3,"type":"vertex","label":"range","start":{"line":0,"character":0},"end":{"line":0,"character":3}}"#,
        r#"{"id":4,"type":"vertex","label":"hoverResult","result":{"contents":"fn a()"}}"#,
        r#"{"id":5,"type":"edge","label":"textDocument/hover","outV":3,"inV":4}"#,
        r#"{"id":6,"type":"edge","label":"contains","outV":2,"inVs":[3]}"#,
    ];
    if duplicate_document {
        lines.extend([
            r#"{"id":7,"type":"vertex","label":"document","uri":"file:///w/a.rs"}"#,
            r#"{"id":8,"type":"vertex","label":"range","start":{"line":4,"character":0},"end":{"line":4,"character":1}}"#,
            r#"{"id":9,"type":"edge","label":"contains","outV":7,"inVs":[8]}"#,
        ]);
    }
    lines.join("\n")
}

async fn run(input: String, cancel: &CancellationToken) -> Result<codeintel_storage::GroupedBundleData> {
    let files = Files(vec!["a.rs".to_string()]);
    correlate(Box::new(Cursor::new(input.into_bytes())), "", &files, cancel).await
}

#[tokio::test]
async fn test_correlation_is_deterministic() {
    let cancel = CancellationToken::new();
    let a = run(dump(false), &cancel).await.unwrap();
    let b = run(dump(false), &cancel).await.unwrap();
    assert_eq!(a.content_digest().unwrap(), b.content_digest().unwrap());
    assert_eq!(a.documents["a.rs"].hover_results.values().next().unwrap(), "fn a()");
}

#[tokio::test]
async fn test_duplicate_documents_merge_ranges() {
    let bundle = run(dump(true), &CancellationToken::new()).await.unwrap();
    assert_eq!(bundle.documents.len(), 1);
    assert_eq!(bundle.documents["a.rs"].ranges.len(), 2);
}

#[tokio::test]
async fn test_cancelled_correlation() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = run(dump(false), &cancel).await.unwrap_err();
    assert!(err.is_cancelled());
}

fn naive_components(n: u64, pairs: &[(u64, u64)]) -> Vec<BTreeSet<u64>> {
    let mut components: Vec<BTreeSet<u64>> = (0..n).map(|i| BTreeSet::from([i])).collect();
    for &(a, b) in pairs {
        let ia = components.iter().position(|c| c.contains(&a)).unwrap();
        let ib = components.iter().position(|c| c.contains(&b)).unwrap();
        if ia != ib {
            let moved = components[ib].clone();
            components[ia].extend(moved);
            components.remove(ib);
        }
    }
    components
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_union_find_matches_naive_components(
        pairs in prop::collection::vec((0u64..30, 0u64..30), 0..40)
    ) {
        let mut set = DisjointIdSet::new();
        for &(a, b) in &pairs {
            set.union(a, b);
        }

        for component in naive_components(30, &pairs) {
            let min = *component.iter().next().unwrap();
            for &member in &component {
                prop_assert_eq!(set.find(member), min);
            }
            prop_assert_eq!(set.extract_set(min), component);
        }
    }

    #[test]
    fn prop_chunk_index_in_range(id in any::<u64>(), results in 0usize..2_000_000) {
        let n = num_result_chunks(results);
        prop_assert!(n >= 1 && n as usize <= MAX_NUM_RESULT_CHUNKS);
        let index = result_chunk_index(id, n);
        prop_assert!(index < n);
        prop_assert_eq!(index, result_chunk_index(id, n));
    }
}
