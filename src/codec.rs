//! Node file codec: a machine-readable header between `---` delimiters,
//! followed by a human-readable markdown body.
//!
//! The header is a restricted block notation: two-space indentation per
//! level, `- ` object items, inline JSON arrays for primitive lists, and
//! JSON-escape quoting for scalars containing `:`, `#` or a line break.

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;

use crate::error::{CubeError, Result};
use crate::model::{Edge, EdgeType, Node, NodeType, Ordering, Priority, Status, Validity};

const DELIM: &str = "---";

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

fn scalar(raw: &str) -> String {
    if raw.contains(':') || raw.contains('#') || raw.contains('\n') {
        serde_json::to_string(raw).expect("string serialization is infallible")
    } else {
        raw.to_string()
    }
}

fn opt_scalar(raw: Option<&str>) -> String {
    match raw {
        Some(v) => scalar(v),
        None => "null".to_string(),
    }
}

fn inline_string_list(items: &[String]) -> String {
    serde_json::to_string(items).expect("string list serialization is infallible")
}

fn json_value_scalar(value: &Value) -> String {
    let text = serde_json::to_string(value).expect("value serialization is infallible");
    scalar(&text)
}

/// Render a node to its file representation.
pub fn encode(node: &Node) -> String {
    let mut out = String::with_capacity(512 + node.content.len());
    out.push_str(DELIM);
    out.push('\n');

    push_kv(&mut out, 0, "id", &scalar(&node.id));
    push_kv(&mut out, 0, "type", node.node_type.as_str());
    push_kv(&mut out, 0, "version", &node.version.to_string());
    push_kv(&mut out, 0, "status", node.status.as_str());
    push_kv(&mut out, 0, "validity", node.validity.as_str());
    push_kv(&mut out, 0, "confidence", &format_f64(node.confidence));
    push_kv(&mut out, 0, "priority", node.priority.as_str());
    push_kv(&mut out, 0, "tags", &inline_string_list(&node.tags));
    push_kv(&mut out, 0, "created_by", &opt_scalar(node.created_by.as_deref()));
    push_kv(&mut out, 0, "assigned_to", &opt_scalar(node.assigned_to.as_deref()));
    push_kv(&mut out, 0, "locked_by", &opt_scalar(node.locked_by.as_deref()));
    push_kv(&mut out, 0, "created_at", &scalar(&node.created_at.to_rfc3339()));
    push_kv(&mut out, 0, "modified_at", &scalar(&node.modified_at.to_rfc3339()));
    push_kv(
        &mut out,
        0,
        "due_at",
        &opt_scalar(node.due_at.map(|d| d.to_rfc3339()).as_deref()),
    );

    out.push_str("ordering:\n");
    push_kv(
        &mut out,
        1,
        "superseded_by",
        &opt_scalar(node.ordering.superseded_by.as_deref()),
    );
    push_kv(&mut out, 1, "semantic_hash", &node.ordering.semantic_hash);
    push_kv(
        &mut out,
        1,
        "source_freshness",
        &node.ordering.source_freshness.format("%Y-%m-%d").to_string(),
    );

    if node.edges.is_empty() {
        out.push_str("edges: []\n");
    } else {
        out.push_str("edges:\n");
        for edge in &node.edges {
            out.push_str("  - type: ");
            out.push_str(edge.edge_type.as_str());
            out.push('\n');
            push_kv(&mut out, 2, "target", &scalar(&edge.to));
            if !edge.metadata.is_empty() {
                out.push_str("    metadata:\n");
                for (key, value) in &edge.metadata {
                    push_kv(&mut out, 3, key, &json_value_scalar(value));
                }
            }
        }
    }

    if node.actions.is_empty() {
        out.push_str("actions: []\n");
    } else {
        out.push_str("actions:\n");
        for action in &node.actions {
            out.push_str("  - ");
            out.push_str(&json_value_scalar(action));
            out.push('\n');
        }
    }

    out.push_str(DELIM);
    out.push_str("\n\n# ");
    out.push_str(&node.title);
    out.push('\n');
    if !node.content.is_empty() {
        out.push('\n');
        out.push_str(&node.content);
        if !node.content.ends_with('\n') {
            out.push('\n');
        }
    }
    out
}

fn push_kv(out: &mut String, level: usize, key: &str, value: &str) {
    for _ in 0..level {
        out.push_str("  ");
    }
    out.push_str(key);
    out.push_str(": ");
    out.push_str(value);
    out.push('\n');
}

fn format_f64(v: f64) -> String {
    // Keep a decimal point so the field reads as a float.
    if v.fract() == 0.0 {
        format!("{v:.1}")
    } else {
        format!("{v}")
    }
}

// ---------------------------------------------------------------------------
// Header parse tree
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Hv {
    Scalar(String),
    List(Vec<Hv>),
    Map(Vec<(String, Hv)>),
}

impl Hv {
    fn get<'a>(&'a self, key: &str) -> Option<&'a Hv> {
        match self {
            Hv::Map(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }
}

struct Line<'a> {
    indent: usize,
    text: &'a str,
}

fn split_lines<'a>(header: &'a str, path: &str) -> Result<Vec<Line<'a>>> {
    let mut lines = Vec::new();
    for raw in header.lines() {
        if raw.trim().is_empty() {
            continue;
        }
        let trimmed = raw.trim_start_matches(' ');
        let spaces = raw.len() - trimmed.len();
        if spaces % 2 != 0 {
            return Err(CubeError::malformed(
                path,
                format!("odd indentation ({spaces} spaces): '{raw}'"),
            ));
        }
        lines.push(Line {
            indent: spaces / 2,
            text: trimmed,
        });
    }
    Ok(lines)
}

fn parse_map(lines: &[Line<'_>], pos: &mut usize, level: usize, path: &str) -> Result<Hv> {
    let mut entries = Vec::new();
    while *pos < lines.len() {
        let line = &lines[*pos];
        if line.indent < level || line.text.starts_with("- ") {
            break;
        }
        if line.indent > level {
            return Err(CubeError::malformed(
                path,
                format!("unexpected indentation at '{}'", line.text),
            ));
        }
        let (key, rest) = split_entry(line.text, path)?;
        *pos += 1;
        let value = if rest.is_empty() {
            parse_nested(lines, pos, level + 1, path)?
        } else {
            Hv::Scalar(rest.to_string())
        };
        entries.push((key.to_string(), value));
    }
    Ok(Hv::Map(entries))
}

fn parse_nested(lines: &[Line<'_>], pos: &mut usize, level: usize, path: &str) -> Result<Hv> {
    if *pos >= lines.len() || lines[*pos].indent < level {
        // `key:` with no indented block underneath
        return Ok(Hv::Scalar("null".to_string()));
    }
    if lines[*pos].text.starts_with("- ") {
        parse_list(lines, pos, level, path)
    } else {
        parse_map(lines, pos, level, path)
    }
}

fn parse_list(lines: &[Line<'_>], pos: &mut usize, level: usize, path: &str) -> Result<Hv> {
    let mut items = Vec::new();
    while *pos < lines.len() {
        let line = &lines[*pos];
        if line.indent != level || !line.text.starts_with("- ") {
            break;
        }
        let rest = &line.text[2..];
        *pos += 1;
        // A quoted item is always a scalar, even when the quoted text
        // happens to contain a `key: value` shape.
        if !rest.starts_with('"') && (rest.contains(": ") || rest.ends_with(':')) {
            // Object item: first entry on the dash line, the rest indented
            // one level deeper.
            let (key, value_text) = split_entry(rest, path)?;
            let first = if value_text.is_empty() {
                parse_nested(lines, pos, level + 2, path)?
            } else {
                Hv::Scalar(value_text.to_string())
            };
            let mut entries = vec![(key.to_string(), first)];
            if let Hv::Map(more) = parse_map(lines, pos, level + 1, path)? {
                entries.extend(more);
            }
            items.push(Hv::Map(entries));
        } else {
            items.push(Hv::Scalar(rest.to_string()));
        }
    }
    Ok(Hv::List(items))
}

fn split_entry<'a>(text: &'a str, path: &str) -> Result<(&'a str, &'a str)> {
    if let Some(idx) = text.find(": ") {
        Ok((&text[..idx], text[idx + 2..].trim()))
    } else if let Some(stripped) = text.strip_suffix(':') {
        Ok((stripped, ""))
    } else {
        Err(CubeError::malformed(
            path,
            format!("expected 'key: value' at '{text}'"),
        ))
    }
}

// ---------------------------------------------------------------------------
// Typed field extraction
// ---------------------------------------------------------------------------

fn unquote(raw: &str, path: &str) -> Result<String> {
    if raw.starts_with('"') {
        serde_json::from_str::<String>(raw)
            .map_err(|e| CubeError::malformed(path, format!("bad quoted scalar {raw}: {e}")))
    } else {
        Ok(raw.to_string())
    }
}

fn req<'a>(map: &'a Hv, key: &str, path: &str) -> Result<&'a Hv> {
    map.get(key)
        .ok_or_else(|| CubeError::malformed(path, format!("missing header key '{key}'")))
}

fn req_scalar(map: &Hv, key: &str, path: &str) -> Result<String> {
    match req(map, key, path)? {
        Hv::Scalar(raw) => unquote(raw, path),
        _ => Err(CubeError::malformed(path, format!("'{key}' must be a scalar"))),
    }
}

fn opt_string(map: &Hv, key: &str, path: &str) -> Result<Option<String>> {
    let raw = req_scalar(map, key, path)?;
    Ok(if raw == "null" { None } else { Some(raw) })
}

fn string_list(map: &Hv, key: &str, path: &str) -> Result<Vec<String>> {
    match req(map, key, path)? {
        Hv::Scalar(raw) => serde_json::from_str::<Vec<String>>(raw)
            .map_err(|e| CubeError::malformed(path, format!("'{key}' must be a string list: {e}"))),
        _ => Err(CubeError::malformed(
            path,
            format!("'{key}' must be an inline list"),
        )),
    }
}

fn datetime(raw: &str, key: &str, path: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| CubeError::malformed(path, format!("'{key}' is not an ISO-8601 date: {e}")))
}

fn enum_field<T>(map: &Hv, key: &str, path: &str) -> Result<T>
where
    T: std::str::FromStr<Err = CubeError>,
{
    let raw = req_scalar(map, key, path)?;
    raw.parse::<T>()
        .map_err(|e| CubeError::malformed(path, e.to_string()))
}

fn metadata_value(raw: &str, path: &str) -> Result<Value> {
    let text = unquote(raw, path)?;
    Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Parse a node file. `file_path` is recorded on the node and used in
/// error messages.
pub fn decode(text: &str, file_path: &str) -> Result<Node> {
    let path = file_path;
    let rest = text
        .strip_prefix("---\n")
        .ok_or_else(|| CubeError::malformed(path, "missing opening header delimiter"))?;
    let end = rest
        .find("\n---\n")
        .or_else(|| rest.strip_suffix("\n---").map(|head| head.len()))
        .ok_or_else(|| CubeError::malformed(path, "missing closing header delimiter"))?;
    let (header_text, tail) = rest.split_at(end);
    let body = tail.strip_prefix("\n---\n").unwrap_or("");

    let lines = split_lines(header_text, path)?;
    let mut pos = 0;
    let header = parse_map(&lines, &mut pos, 0, path)?;
    if pos != lines.len() {
        return Err(CubeError::malformed(path, "trailing unparsed header lines"));
    }

    let id = req_scalar(&header, "id", path)?;
    let node_type: NodeType = enum_field(&header, "type", path)?;
    let version = req_scalar(&header, "version", path)?
        .parse::<u64>()
        .map_err(|e| CubeError::malformed(path, format!("bad version: {e}")))?;
    let status: Status = enum_field(&header, "status", path)?;
    let validity: Validity = enum_field(&header, "validity", path)?;
    let confidence = req_scalar(&header, "confidence", path)?
        .parse::<f64>()
        .map_err(|e| CubeError::malformed(path, format!("bad confidence: {e}")))?;
    let priority: Priority = enum_field(&header, "priority", path)?;
    let tags = string_list(&header, "tags", path)?;
    let created_by = opt_string(&header, "created_by", path)?;
    let assigned_to = opt_string(&header, "assigned_to", path)?;
    let locked_by = opt_string(&header, "locked_by", path)?;
    let created_at = datetime(&req_scalar(&header, "created_at", path)?, "created_at", path)?;
    let modified_at = datetime(
        &req_scalar(&header, "modified_at", path)?,
        "modified_at",
        path,
    )?;
    let due_at = match opt_string(&header, "due_at", path)? {
        Some(raw) => Some(datetime(&raw, "due_at", path)?),
        None => None,
    };

    let ordering_map = req(&header, "ordering", path)?;
    let ordering = Ordering {
        superseded_by: opt_string(ordering_map, "superseded_by", path)?,
        semantic_hash: req_scalar(ordering_map, "semantic_hash", path)?,
        source_freshness: NaiveDate::parse_from_str(
            &req_scalar(ordering_map, "source_freshness", path)?,
            "%Y-%m-%d",
        )
        .map_err(|e| CubeError::malformed(path, format!("bad source_freshness: {e}")))?,
    };

    let edges = decode_edges(&header, &id, modified_at, path)?;
    let actions = decode_actions(&header, path)?;

    let (title, content) = decode_body(body, path)?;

    Ok(Node {
        id,
        node_type,
        version,
        status,
        validity,
        confidence,
        priority,
        tags,
        created_by,
        assigned_to,
        locked_by,
        created_at,
        modified_at,
        due_at,
        ordering,
        edges,
        actions,
        title,
        content_preview: crate::model::content_preview(&content),
        content,
        file_path: Some(file_path.to_string()),
    })
}

fn decode_edges(
    header: &Hv,
    node_id: &str,
    modified_at: DateTime<Utc>,
    path: &str,
) -> Result<Vec<Edge>> {
    match req(header, "edges", path)? {
        Hv::Scalar(raw) if raw == "[]" => Ok(Vec::new()),
        Hv::List(items) => items
            .iter()
            .map(|item| {
                let edge_type: EdgeType = enum_field(item, "type", path)?;
                let to = req_scalar(item, "target", path)?;
                let metadata = match item.get("metadata") {
                    Some(Hv::Map(entries)) => {
                        let mut map = serde_json::Map::new();
                        for (key, value) in entries {
                            let Hv::Scalar(raw) = value else {
                                return Err(CubeError::malformed(
                                    path,
                                    "edge metadata values must be scalars",
                                ));
                            };
                            map.insert(key.clone(), metadata_value(raw, path)?);
                        }
                        map
                    }
                    Some(_) => {
                        return Err(CubeError::malformed(path, "edge metadata must be a map"))
                    }
                    None => serde_json::Map::new(),
                };
                Ok(Edge {
                    from: node_id.to_string(),
                    to,
                    edge_type,
                    metadata,
                    // Edge timestamps are not part of the file format.
                    created_at: modified_at,
                })
            })
            .collect(),
        _ => Err(CubeError::malformed(path, "'edges' must be a list")),
    }
}

fn decode_actions(header: &Hv, path: &str) -> Result<Vec<Value>> {
    match req(header, "actions", path)? {
        Hv::Scalar(raw) if raw == "[]" => Ok(Vec::new()),
        Hv::List(items) => items
            .iter()
            .map(|item| match item {
                Hv::Scalar(raw) => metadata_value(raw, path),
                _ => Err(CubeError::malformed(path, "action items must be scalars")),
            })
            .collect(),
        _ => Err(CubeError::malformed(path, "'actions' must be a list")),
    }
}

fn decode_body(body: &str, path: &str) -> Result<(String, String)> {
    let mut lines = body.lines();
    let title_line = loop {
        match lines.next() {
            Some(line) if line.trim().is_empty() => continue,
            Some(line) => break line,
            None => return Err(CubeError::malformed(path, "missing '# title' body line")),
        }
    };
    let title = title_line
        .strip_prefix("# ")
        .ok_or_else(|| CubeError::malformed(path, "body must begin with '# <title>'"))?
        .to_string();

    let after_title = &body[body.find(title_line).expect("title line located") + title_line.len()..];
    let content_raw = after_title
        .strip_prefix("\n\n")
        .or_else(|| after_title.strip_prefix('\n'))
        .unwrap_or(after_title);
    let content = content_raw.strip_suffix('\n').unwrap_or(content_raw);
    Ok((title, content.to_string()))
}
