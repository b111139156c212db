//! Drop documents that do not exist in the indexed commit

use std::collections::{BTreeSet, HashMap};

use super::state::State;

/// Normalize an upload root to either `""` or `"dir/"`
pub fn normalize_root(root: &str) -> String {
    let trimmed = root.trim_start_matches("./").trim_matches('/');
    if trimmed.is_empty() || trimmed == "." {
        String::new()
    } else {
        format!("{}/", trimmed)
    }
}

/// Repository-relative path of a document
pub fn repository_path(root: &str, path: &str) -> String {
    format!("{}{}", normalize_root(root), path)
}

fn dirname(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some((dir, _)) => dir,
        None => "",
    }
}

/// Distinct directories holding the documents of `state`, sorted
pub fn directories(state: &State, root: &str) -> Vec<String> {
    let dirs: BTreeSet<String> = state
        .documents
        .values()
        .map(|path| dirname(&repository_path(root, path)).to_string())
        .collect();
    dirs.into_iter().collect()
}

/// Remove every document whose path is not listed in `children`.
/// Returns the number of documents removed.
pub fn prune(state: &mut State, root: &str, children: &HashMap<String, Vec<String>>) -> usize {
    let present: BTreeSet<&str> = children
        .values()
        .flat_map(|paths| paths.iter().map(String::as_str))
        .collect();

    let missing: Vec<u64> = state
        .documents
        .iter()
        .filter(|(_, path)| !present.contains(repository_path(root, path).as_str()))
        .map(|(&id, _)| id)
        .collect();

    for id in &missing {
        state.documents.remove(id);
        state.contains.remove(id);
        state.document_diagnostics.remove(id);
        for results in [
            &mut state.definition_results,
            &mut state.reference_results,
            &mut state.implementation_results,
        ] {
            for items in results.values_mut() {
                items.remove(id);
            }
        }
    }
    missing.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};

    #[test]
    fn test_normalize_root() {
        assert_eq!(normalize_root(""), "");
        assert_eq!(normalize_root("/"), "");
        assert_eq!(normalize_root("./"), "");
        assert_eq!(normalize_root("sub3"), "sub3/");
        assert_eq!(normalize_root("sub3/"), "sub3/");
        assert_eq!(normalize_root("./a/b/"), "a/b/");
    }

    #[test]
    fn test_directories_include_root() {
        let mut state = State::default();
        state.documents.insert(1, "main.go".to_string());
        state.documents.insert(2, "pkg/util.go".to_string());
        state.documents.insert(3, "pkg/other.go".to_string());
        assert_eq!(directories(&state, "sub3/"), vec!["sub3", "sub3/pkg"]);
        assert_eq!(directories(&state, ""), vec!["", "pkg"]);
    }

    #[test]
    fn test_prune_drops_missing_documents_everywhere() {
        let mut state = State::default();
        state.documents.insert(1, "main.go".to_string());
        state.documents.insert(2, "gen/generated.go".to_string());
        state.contains.insert(2, BTreeSet::from([20]));
        state.reference_results.insert(
            9,
            BTreeMap::from([(1, BTreeSet::from([10])), (2, BTreeSet::from([20]))]),
        );

        let children = HashMap::from([
            ("sub3".to_string(), vec!["sub3/main.go".to_string()]),
            ("sub3/gen".to_string(), vec![]),
        ]);
        assert_eq!(prune(&mut state, "sub3", &children), 1);

        assert_eq!(state.documents.len(), 1);
        assert!(!state.contains.contains_key(&2));
        assert_eq!(state.reference_results[&9].len(), 1);
        assert!(state.reference_results[&9].contains_key(&1));
    }
}
