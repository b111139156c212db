//! Streaming reader: LSIF lines -> correlation state

use codeintel_storage::{Diagnostic, MonikerData, PackageInformationData};
use std::io::{BufRead, BufReader, Read};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::element::{parse_element, Edge, Element, Vertex};
use super::state::{IdInterner, Links, RangeState, State};
use crate::error::{OrchestratorError, Result};

/// Lines between two cancellation checks
const CANCEL_CHECK_INTERVAL: usize = 1000;

/// Read a whole LSIF stream into a fresh state
pub fn read_state<R: Read>(reader: R, cancel: &CancellationToken) -> Result<State> {
    let mut builder = StateBuilder::default();

    for (index, line) in BufReader::new(reader).lines().enumerate() {
        if index % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled);
        }

        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let element = parse_element(line).map_err(|e| e.wrap(format!("line {}", index + 1)))?;
        builder
            .apply(element)
            .map_err(|e| e.wrap(format!("line {}", index + 1)))?;
    }

    builder.finish()
}

#[derive(Default)]
struct StateBuilder {
    ids: IdInterner,
    state: State,
    has_metadata: bool,
}

impl StateBuilder {
    fn apply(&mut self, element: Element) -> Result<()> {
        match element {
            Element::Vertex { id, vertex } => {
                let id = self.ids.define(&id)?;
                self.add_vertex(id, vertex)
            }
            Element::Edge { id, label, edge } => {
                self.ids.define(&id)?;
                self.add_edge(&label, edge)
            }
        }
    }

    fn finish(self) -> Result<State> {
        if !self.has_metadata {
            return Err(OrchestratorError::parse("no metaData vertex"));
        }
        debug!(
            "read {} elements, {} documents, {} ranges",
            self.ids.len(),
            self.state.documents.len(),
            self.state.ranges.len()
        );
        Ok(self.state)
    }

    fn add_vertex(&mut self, id: u64, vertex: Vertex) -> Result<()> {
        let state = &mut self.state;
        match vertex {
            Vertex::MetaData {
                version,
                project_root,
                tool_name,
                tool_version,
            } => {
                if self.has_metadata {
                    return Err(OrchestratorError::parse("duplicate metaData vertex"));
                }
                self.has_metadata = true;
                state.lsif_version = version;
                state.project_root = if project_root.ends_with('/') {
                    project_root
                } else {
                    format!("{}/", project_root)
                };
                state.tool_name = tool_name;
                state.tool_version = tool_version;
            }
            Vertex::Document { uri } => {
                if !self.has_metadata {
                    return Err(OrchestratorError::parse("document vertex before metaData"));
                }
                let path = uri
                    .strip_prefix(state.project_root.as_str())
                    .filter(|p| !p.is_empty())
                    .ok_or_else(|| {
                        OrchestratorError::parse(format!(
                            "document {} is outside the project root {}",
                            uri, state.project_root
                        ))
                    })?;
                state.documents.insert(id, path.to_string());
            }
            Vertex::Range(span) => {
                state.ranges.insert(
                    id,
                    RangeState {
                        start_line: span.start.line,
                        start_character: span.start.character,
                        end_line: span.end.line,
                        end_character: span.end.character,
                        links: Links::default(),
                    },
                );
            }
            Vertex::ResultSet => {
                state.result_sets.insert(id, Links::default());
            }
            Vertex::DefinitionResult => {
                state.definition_results.insert(id, Default::default());
            }
            Vertex::ReferenceResult => {
                state.reference_results.insert(id, Default::default());
            }
            Vertex::ImplementationResult => {
                state.implementation_results.insert(id, Default::default());
            }
            Vertex::HoverResult { contents } => {
                state.hovers.insert(id, contents);
            }
            Vertex::Moniker {
                kind,
                scheme,
                identifier,
            } => {
                state.monikers.insert(
                    id,
                    MonikerData {
                        kind,
                        scheme,
                        identifier,
                        package_information_id: None,
                    },
                );
            }
            Vertex::PackageInformation {
                manager,
                name,
                version,
            } => {
                state.package_information.insert(
                    id,
                    PackageInformationData {
                        manager,
                        name,
                        version,
                    },
                );
            }
            Vertex::DiagnosticResult { diagnostics } => {
                let diagnostics = diagnostics
                    .into_iter()
                    .map(|d| Diagnostic {
                        severity: d.severity,
                        code: d.code,
                        message: d.message,
                        source: d.source,
                        start_line: d.span.start.line,
                        start_character: d.span.start.character,
                        end_line: d.span.end.line,
                        end_character: d.span.end.character,
                    })
                    .collect();
                state.diagnostic_results.insert(id, diagnostics);
            }
            Vertex::Ignored => {}
        }
        Ok(())
    }

    fn add_edge(&mut self, label: &str, edge: Edge) -> Result<()> {
        let out_v = self.ids.resolve(&edge.out_v)?;
        let in_vs = edge
            .in_vs
            .iter()
            .map(|raw| self.ids.resolve(raw))
            .collect::<Result<Vec<_>>>()?;
        let state = &mut self.state;

        match label {
            "contains" => {
                // project -> document edges carry nothing we store
                if state.documents.contains_key(&out_v) {
                    state.contains.entry(out_v).or_default().extend(in_vs);
                }
            }
            "item" => {
                let raw_document = edge.document.as_deref().ok_or_else(|| {
                    OrchestratorError::parse("item edge without a document")
                })?;
                let document = self.ids.resolve(raw_document)?;

                if state.reference_results.contains_key(&out_v)
                    && edge.property.as_deref() == Some("referenceResults")
                {
                    for in_v in in_vs {
                        state.linked_reference_results.union(out_v, in_v);
                    }
                    return Ok(());
                }

                let items = if let Some(items) = state.definition_results.get_mut(&out_v) {
                    items
                } else if let Some(items) = state.reference_results.get_mut(&out_v) {
                    items
                } else if let Some(items) = state.implementation_results.get_mut(&out_v) {
                    items
                } else {
                    return Err(OrchestratorError::parse(format!(
                        "item edge from {} which is not a result",
                        edge.out_v
                    )));
                };
                items.entry(document).or_default().extend(in_vs);
            }
            "next" => {
                let target = single(label, &in_vs)?;
                state.next.insert(out_v, target);
            }
            "textDocument/definition" => {
                let target = single(label, &in_vs)?;
                link(state, label, out_v)?.definition_result_id = Some(target);
            }
            "textDocument/references" => {
                let target = single(label, &in_vs)?;
                link(state, label, out_v)?.reference_result_id = Some(target);
            }
            "textDocument/implementation" => {
                let target = single(label, &in_vs)?;
                link(state, label, out_v)?.implementation_result_id = Some(target);
            }
            "textDocument/hover" => {
                let target = single(label, &in_vs)?;
                link(state, label, out_v)?.hover_result_id = Some(target);
            }
            "textDocument/diagnostic" => {
                let target = single(label, &in_vs)?;
                state
                    .document_diagnostics
                    .entry(out_v)
                    .or_default()
                    .insert(target);
            }
            "moniker" => {
                let target = single(label, &in_vs)?;
                state.attached_monikers.entry(out_v).or_default().insert(target);
            }
            "nextMoniker" => {
                let target = single(label, &in_vs)?;
                state.linked_monikers.union(out_v, target);
            }
            "packageInformation" => {
                let target = single(label, &in_vs)?;
                let moniker = state.monikers.get_mut(&out_v).ok_or_else(|| {
                    OrchestratorError::parse(format!(
                        "packageInformation edge from {} which is not a moniker",
                        edge.out_v
                    ))
                })?;
                moniker.package_information_id = Some(target);
            }
            _ => {}
        }
        Ok(())
    }
}

fn single(label: &str, in_vs: &[u64]) -> Result<u64> {
    match in_vs {
        [only] => Ok(*only),
        _ => Err(OrchestratorError::parse(format!(
            "{} edge must have exactly one inV",
            label
        ))),
    }
}

fn link<'a>(state: &'a mut State, label: &str, out_v: u64) -> Result<&'a mut Links> {
    state.links_mut(out_v).ok_or_else(|| {
        OrchestratorError::parse(format!(
            "{} edge from {} which is not a range or result set",
            label, out_v
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(lines: &[&str]) -> Result<State> {
        read_state(lines.join("\n").as_bytes(), &CancellationToken::new())
    }

    const META: &str = r#"{"id":1,"type":"vertex","label":"metaData","version":"0.4.3","projectRoot":"file:///repo/sub3","toolInfo":{"name":"lsif-go"}}"#;

    #[test]
    fn test_document_paths_are_root_relative() {
        let state = read(&[
            META,
            r#"{"id":2,"type":"vertex","label":"document","uri":"file:///repo/sub3/pkg/a.go"}"#,
        ])
        .unwrap();
        assert_eq!(state.documents[&2], "pkg/a.go");
        assert_eq!(state.project_root, "file:///repo/sub3/");
    }

    #[test]
    fn test_range_links_and_items() {
        let state = read(&[
            META,
            r#"{"id":2,"type":"vertex","label":"document","uri":"file:///repo/sub3/a.go"}"#,
            r#"{"id":3,"type":"vertex","label":"range","start":{"line":1,"character":2},"end":{"line":1,"character":5}}"#,
            r#"{"id":4,"type":"vertex","label":"definitionResult"}"#,
            r#"{"id":5,"type":"edge","label":"textDocument/definition","outV":3,"inV":4}"#,
            r#"{"id":6,"type":"edge","label":"item","outV":4,"inVs":[3],"document":2}"#,
            r#"{"id":7,"type":"edge","label":"contains","outV":2,"inVs":[3]}"#,
        ])
        .unwrap();

        assert_eq!(state.ranges[&3].links.definition_result_id, Some(4));
        assert!(state.definition_results[&4][&2].contains(&3));
        assert!(state.contains[&2].contains(&3));
    }

    #[test]
    fn test_missing_metadata_is_fatal() {
        let err = read(&[r#"{"id":3,"type":"vertex","label":"resultSet"}"#]).unwrap_err();
        assert!(err.to_string().contains("no metaData vertex"));
    }

    #[test]
    fn test_duplicate_metadata_is_fatal() {
        let second = META.replace("\"id\":1", "\"id\":9");
        assert!(read(&[META, &second]).is_err());
    }

    #[test]
    fn test_unknown_reference_reports_line() {
        let err = read(&[
            META,
            r#"{"id":5,"type":"edge","label":"next","outV":3,"inV":4}"#,
        ])
        .unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("line 2:"), "{}", message);
        assert!(message.contains("unknown element 3"), "{}", message);
    }

    #[test]
    fn test_document_outside_root_is_fatal() {
        assert!(read(&[
            META,
            r#"{"id":2,"type":"vertex","label":"document","uri":"file:///elsewhere/a.go"}"#,
        ])
        .is_err());
    }

    #[test]
    fn test_cancelled_before_read() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = read_state(META.as_bytes(), &cancel).unwrap_err();
        assert!(err.is_cancelled());
    }
}
