//! Parsing of single LSIF elements (one JSON object per line)

use serde::Deserialize;
use serde_json::Value;

use crate::error::{OrchestratorError, Result};

/// Textual form of an element id. Numeric and string ids share one namespace.
pub type RawId = String;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Element {
    Vertex { id: RawId, vertex: Vertex },
    Edge { id: RawId, label: String, edge: Edge },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Vertex {
    MetaData {
        version: String,
        project_root: String,
        tool_name: String,
        tool_version: String,
    },
    Document {
        uri: String,
    },
    Range(Span),
    ResultSet,
    DefinitionResult,
    ReferenceResult,
    ImplementationResult,
    HoverResult {
        contents: String,
    },
    Moniker {
        kind: String,
        scheme: String,
        identifier: String,
    },
    PackageInformation {
        manager: String,
        name: String,
        version: String,
    },
    DiagnosticResult {
        diagnostics: Vec<RawDiagnostic>,
    },
    /// Vertex kinds the correlator does not use (project, event, ...)
    Ignored,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct Span {
    pub start: Position,
    pub end: Position,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDiagnostic {
    pub severity: u8,
    pub code: String,
    pub message: String,
    pub source: String,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub out_v: RawId,
    /// `inV` and `inVs` combined
    pub in_vs: Vec<RawId>,
    pub document: Option<RawId>,
    pub property: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetaDataPayload {
    version: String,
    project_root: String,
    #[serde(default)]
    tool_info: Option<ToolInfo>,
}

#[derive(Deserialize)]
struct ToolInfo {
    name: String,
    #[serde(default)]
    version: Option<String>,
}

#[derive(Deserialize)]
struct DocumentPayload {
    uri: String,
}

#[derive(Deserialize)]
struct HoverPayload {
    result: HoverContents,
}

#[derive(Deserialize)]
struct HoverContents {
    contents: Value,
}

#[derive(Deserialize)]
struct MonikerPayload {
    #[serde(default)]
    kind: Option<String>,
    scheme: String,
    identifier: String,
}

#[derive(Deserialize)]
struct PackageInformationPayload {
    name: String,
    manager: String,
    #[serde(default)]
    version: Option<String>,
}

#[derive(Deserialize)]
struct DiagnosticResultPayload {
    result: Vec<DiagnosticPayload>,
}

#[derive(Deserialize)]
struct DiagnosticPayload {
    #[serde(default)]
    severity: Option<u8>,
    #[serde(default)]
    code: Option<Value>,
    message: String,
    #[serde(default)]
    source: Option<String>,
    range: Span,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EdgePayload {
    out_v: Value,
    #[serde(default)]
    in_v: Option<Value>,
    #[serde(default)]
    in_vs: Vec<Value>,
    #[serde(default)]
    document: Option<Value>,
    #[serde(default)]
    property: Option<String>,
}

fn id_of(value: &Value) -> Option<RawId> {
    match value {
        Value::Number(n) => n.as_u64().map(|n| n.to_string()),
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn payload<T: for<'de> Deserialize<'de>>(label: &str, value: Value) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| OrchestratorError::parse(format!("malformed {} element: {}", label, e)))
}

/// Flatten LSP hover contents (string, MarkupContent, MarkedString or a list of
/// them) into one markdown string.
pub fn hover_markdown(contents: &Value) -> String {
    match contents {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .map(hover_markdown)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n---\n\n"),
        Value::Object(obj) => {
            let value = obj.get("value").and_then(Value::as_str).unwrap_or_default();
            match obj.get("language").and_then(Value::as_str) {
                Some(language) => format!("```{}\n{}\n```", language, value),
                None => value.to_string(),
            }
        }
        _ => String::new(),
    }
}

/// Parse one line of an LSIF dump
pub fn parse_element(line: &str) -> Result<Element> {
    let value: Value = serde_json::from_str(line)
        .map_err(|e| OrchestratorError::parse(format!("invalid JSON: {}", e)))?;

    let obj = value
        .as_object()
        .ok_or_else(|| OrchestratorError::parse("element is not a JSON object"))?;
    let id = obj
        .get("id")
        .and_then(id_of)
        .ok_or_else(|| OrchestratorError::parse("element has no valid id"))?;
    let kind = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| OrchestratorError::parse(format!("element {} has no type", id)))?
        .to_string();
    let label = obj
        .get("label")
        .and_then(Value::as_str)
        .ok_or_else(|| OrchestratorError::parse(format!("element {} has no label", id)))?
        .to_string();

    match kind.as_str() {
        "vertex" => Ok(Element::Vertex {
            vertex: parse_vertex(&label, value)?,
            id,
        }),
        "edge" => Ok(Element::Edge {
            edge: parse_edge(&label, value)?,
            id,
            label,
        }),
        other => Err(OrchestratorError::parse(format!(
            "element {} has unknown type {:?}",
            id, other
        ))),
    }
}

fn parse_vertex(label: &str, value: Value) -> Result<Vertex> {
    let vertex = match label {
        "metaData" => {
            let p: MetaDataPayload = payload(label, value)?;
            let (tool_name, tool_version) = match p.tool_info {
                Some(info) => (info.name, info.version.unwrap_or_default()),
                None => (String::new(), String::new()),
            };
            Vertex::MetaData {
                version: p.version,
                project_root: p.project_root,
                tool_name,
                tool_version,
            }
        }
        "document" => {
            let p: DocumentPayload = payload(label, value)?;
            Vertex::Document { uri: p.uri }
        }
        "range" => Vertex::Range(payload(label, value)?),
        "resultSet" => Vertex::ResultSet,
        "definitionResult" => Vertex::DefinitionResult,
        "referenceResult" => Vertex::ReferenceResult,
        "implementationResult" => Vertex::ImplementationResult,
        "hoverResult" => {
            let p: HoverPayload = payload(label, value)?;
            Vertex::HoverResult {
                contents: hover_markdown(&p.result.contents),
            }
        }
        "moniker" => {
            let p: MonikerPayload = payload(label, value)?;
            Vertex::Moniker {
                kind: p.kind.unwrap_or_else(|| "local".to_string()),
                scheme: p.scheme,
                identifier: p.identifier,
            }
        }
        "packageInformation" => {
            let p: PackageInformationPayload = payload(label, value)?;
            Vertex::PackageInformation {
                manager: p.manager,
                name: p.name,
                version: p.version.unwrap_or_default(),
            }
        }
        "diagnosticResult" => {
            let p: DiagnosticResultPayload = payload(label, value)?;
            Vertex::DiagnosticResult {
                diagnostics: p
                    .result
                    .into_iter()
                    .map(|d| RawDiagnostic {
                        severity: d.severity.unwrap_or(0),
                        code: match d.code {
                            Some(Value::String(s)) => s,
                            Some(Value::Number(n)) => n.to_string(),
                            _ => String::new(),
                        },
                        message: d.message,
                        source: d.source.unwrap_or_default(),
                        span: d.range,
                    })
                    .collect(),
            }
        }
        _ => Vertex::Ignored,
    };
    Ok(vertex)
}

fn parse_edge(label: &str, value: Value) -> Result<Edge> {
    let p: EdgePayload = payload(label, value)?;

    let out_v = id_of(&p.out_v)
        .ok_or_else(|| OrchestratorError::parse(format!("{} edge has an invalid outV", label)))?;

    let mut in_vs = Vec::with_capacity(p.in_vs.len() + 1);
    for raw in p.in_v.iter().chain(p.in_vs.iter()) {
        in_vs.push(id_of(raw).ok_or_else(|| {
            OrchestratorError::parse(format!("{} edge has an invalid inV", label))
        })?);
    }
    if in_vs.is_empty() {
        return Err(OrchestratorError::parse(format!(
            "{} edge has no inV or inVs",
            label
        )));
    }

    let document = match &p.document {
        Some(raw) => Some(id_of(raw).ok_or_else(|| {
            OrchestratorError::parse(format!("{} edge has an invalid document", label))
        })?),
        None => None,
    };

    Ok(Edge {
        out_v,
        in_vs,
        document,
        property: p.property,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_metadata() {
        let element = parse_element(
            r#"{"id":1,"type":"vertex","label":"metaData","version":"0.4.3","projectRoot":"file:///repo","toolInfo":{"name":"lsif-go","version":"1.2"}}"#,
        )
        .unwrap();
        assert_eq!(
            element,
            Element::Vertex {
                id: "1".to_string(),
                vertex: Vertex::MetaData {
                    version: "0.4.3".to_string(),
                    project_root: "file:///repo".to_string(),
                    tool_name: "lsif-go".to_string(),
                    tool_version: "1.2".to_string(),
                },
            }
        );
    }

    #[test]
    fn test_string_and_numeric_ids_share_namespace() {
        let a = parse_element(r#"{"id":"7","type":"vertex","label":"resultSet"}"#).unwrap();
        let b = parse_element(r#"{"id":7,"type":"vertex","label":"resultSet"}"#).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_parse_edge_with_in_vs() {
        let element = parse_element(
            r#"{"id":9,"type":"edge","label":"item","outV":5,"inVs":[3,4],"document":2,"property":"definitions"}"#,
        )
        .unwrap();
        match element {
            Element::Edge { label, edge, .. } => {
                assert_eq!(label, "item");
                assert_eq!(edge.out_v, "5");
                assert_eq!(edge.in_vs, vec!["3".to_string(), "4".to_string()]);
                assert_eq!(edge.document.as_deref(), Some("2"));
                assert_eq!(edge.property.as_deref(), Some("definitions"));
            }
            other => panic!("expected an edge, got {:?}", other),
        }
    }

    #[test]
    fn test_moniker_kind_defaults_to_local() {
        let element = parse_element(
            r#"{"id":3,"type":"vertex","label":"moniker","scheme":"tsc","identifier":"a:b"}"#,
        )
        .unwrap();
        assert!(matches!(
            element,
            Element::Vertex { vertex: Vertex::Moniker { ref kind, .. }, .. } if kind == "local"
        ));
    }

    #[test]
    fn test_hover_markdown_forms() {
        let marked: Value = serde_json::json!([
            {"language": "go", "value": "func main()"},
            "Entry point",
            {"kind": "markdown", "value": "**bold**"}
        ]);
        assert_eq!(
            hover_markdown(&marked),
            "```go\nfunc main()\n```\n\n---\n\nEntry point\n\n---\n\n**bold**"
        );
    }

    #[test]
    fn test_malformed_elements() {
        assert!(parse_element("{not json").is_err());
        assert!(parse_element(r#"{"type":"vertex","label":"range"}"#).is_err());
        assert!(parse_element(r#"{"id":1,"label":"range"}"#).is_err());
        assert!(parse_element(r#"{"id":1,"type":"vertex"}"#).is_err());
        assert!(parse_element(r#"{"id":1,"type":"vertex","label":"range"}"#).is_err());
        assert!(parse_element(r#"{"id":1,"type":"edge","label":"next","outV":2}"#).is_err());
        assert!(parse_element(r#"{"id":1,"type":"node","label":"range"}"#).is_err());
    }

    #[test]
    fn test_unknown_vertex_is_ignored() {
        let element = parse_element(r#"{"id":1,"type":"vertex","label":"project","kind":"go"}"#)
            .unwrap();
        assert!(matches!(
            element,
            Element::Vertex {
                vertex: Vertex::Ignored,
                ..
            }
        ));
    }
}
