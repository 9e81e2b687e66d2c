//! Code structure extractor: a regex pass over a single source file that
//! surfaces functions and classes as candidate `code` nodes, with
//! doc-comment attachment, approximate complexity, and call dependencies.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use super::{ExtractedNode, ExtractedRelation, ExtractionResult};
use crate::model::{EdgeType, NodeType, Priority};

static FUNCTION_DECL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*(?P<export>export\s+|pub(?:\([^)]*\))?\s+)?(?:async\s+)?(?:function|fn)\s+(?P<name>\w+)\s*\(")
        .expect("function pattern compiles")
});

static ARROW_ASSIGN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*(?P<export>export\s+)?(?:const|let|var)\s+(?P<name>\w+)\s*=\s*(?:async\s+)?(?:\([^)\n]*\)|\w+)\s*=>")
        .expect("arrow pattern compiles")
});

static METHOD_DECL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]+(?:async\s+)?(?P<name>\w+)\s*\([^)\n]*\)\s*\{")
        .expect("method pattern compiles")
});

static CLASS_DECL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*(?:export\s+)?(?:abstract\s+)?class\s+(?P<name>\w+)(?:\s+extends\s+(?P<extends>\w+))?(?:\s+implements\s+(?P<implements>[\w,\s]+?))?\s*\{")
        .expect("class pattern compiles")
});

static CALL_SITE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\w+)\s*\(").expect("call pattern compiles"));

static DECISION_POINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:if|else\s+if|for|while|switch|case|catch)\b|\?|&&|\|\|")
        .expect("complexity pattern compiles")
});

/// Names that appear in call position but are control flow or runtime
/// builtins, never module dependencies.
const CALL_DENYLIST: &[&str] = &[
    "if", "for", "while", "switch", "catch", "return", "function", "fn", "constructor", "super",
    "require", "import", "console", "println", "print", "format", "typeof", "new",
];

const METHOD_KEYWORDS: &[&str] = &["if", "for", "while", "switch", "catch", "function", "return"];

#[derive(Debug)]
struct RawFunction {
    name: String,
    exported: bool,
    span: (usize, usize),
    docstring: Option<String>,
    body: String,
}

/// Extract functions and classes from one source file.
pub fn extract(path: &str, language: Option<&str>, text: &str) -> ExtractionResult {
    let language = language
        .map(|l| l.to_lowercase())
        .unwrap_or_else(|| guess_language(path));

    let mut functions: Vec<RawFunction> = Vec::new();
    let mut seen_spans: HashSet<usize> = HashSet::new();

    for captures in FUNCTION_DECL.captures_iter(text) {
        let whole = captures.get(0).expect("match has a range");
        if seen_spans.insert(whole.start()) {
            functions.push(raw_function(text, &captures, whole.start(), whole.end()));
        }
    }
    for captures in ARROW_ASSIGN.captures_iter(text) {
        let whole = captures.get(0).expect("match has a range");
        if seen_spans.insert(whole.start()) {
            functions.push(raw_function(text, &captures, whole.start(), whole.end()));
        }
    }
    for captures in METHOD_DECL.captures_iter(text) {
        let whole = captures.get(0).expect("match has a range");
        let name = &captures["name"];
        if METHOD_KEYWORDS.contains(&name) {
            continue;
        }
        if seen_spans.insert(whole.start()) {
            let mut raw = raw_function(text, &captures, whole.start(), whole.end());
            // Methods are reachable through their class; treat as private.
            raw.exported = false;
            functions.push(raw);
        }
    }

    let mut nodes = Vec::new();
    let mut relations = Vec::new();
    let mut function_names: HashSet<String> = HashSet::new();
    for function in &functions {
        function_names.insert(function.name.clone());
    }

    let mut classes: Vec<(String, (usize, usize))> = Vec::new();
    for captures in CLASS_DECL.captures_iter(text) {
        let whole = captures.get(0).expect("match has a range");
        let name = captures["name"].to_string();
        let body = brace_block(text, whole.end() - 1);
        let docstring = doc_comment_above(text, whole.start());

        let mut metadata = serde_json::Map::new();
        metadata.insert("kind".into(), serde_json::json!("class"));
        metadata.insert(
            "complexity".into(),
            serde_json::json!(complexity(&body)),
        );
        if let Some(parent) = captures.name("extends") {
            metadata.insert("extends".into(), serde_json::json!(parent.as_str()));
            relations.push(ExtractedRelation {
                from_title: name.clone(),
                to_title: parent.as_str().to_string(),
                edge_type: EdgeType::PartOf,
            });
        }
        if let Some(interfaces) = captures.name("implements") {
            let list: Vec<String> = interfaces
                .as_str()
                .split(',')
                .map(|i| i.trim().to_string())
                .filter(|i| !i.is_empty())
                .collect();
            metadata.insert("implements".into(), serde_json::json!(list));
        }

        let content = match &docstring {
            Some(doc) => format!("{doc}\n\nClass `{name}` in {path}"),
            None => format!("Class `{name}` in {path}"),
        };
        nodes.push(ExtractedNode {
            title: name.clone(),
            content,
            node_type: NodeType::Code,
            tags: vec![language.clone(), "class".to_string()],
            priority: Priority::Normal,
            confidence: 0.9,
            span: (whole.start(), whole.start() + body.len()),
            metadata,
        });
        classes.push((name, (whole.start(), whole.start() + body.len())));
    }

    for function in &functions {
        // Methods ride along with their class node.
        let inside_class = classes
            .iter()
            .any(|(_, span)| function.span.0 > span.0 && function.span.0 < span.1);
        if !function.exported || inside_class {
            continue;
        }

        let deps = dependencies(&function.body, &function.name);
        let same_module: Vec<&String> = deps
            .iter()
            .filter(|d| function_names.contains(*d))
            .collect();
        for dep in &same_module {
            relations.push(ExtractedRelation {
                from_title: function.name.clone(),
                to_title: (*dep).clone(),
                edge_type: EdgeType::DependsOn,
            });
        }

        let mut metadata = serde_json::Map::new();
        metadata.insert("kind".into(), serde_json::json!("function"));
        metadata.insert(
            "complexity".into(),
            serde_json::json!(complexity(&function.body)),
        );
        metadata.insert(
            "dependencies".into(),
            serde_json::json!(deps.iter().collect::<Vec<_>>()),
        );

        let content = match &function.docstring {
            Some(doc) => format!("{doc}\n\nFunction `{}` in {path}", function.name),
            None => format!("Function `{}` in {path}", function.name),
        };
        nodes.push(ExtractedNode {
            title: function.name.clone(),
            content,
            node_type: NodeType::Code,
            tags: vec![language.clone(), "function".to_string()],
            priority: Priority::Normal,
            confidence: 0.9,
            span: function.span,
            metadata,
        });
    }

    ExtractionResult {
        nodes,
        relations,
        intents: Vec::new(),
    }
}

fn raw_function(text: &str, captures: &regex::Captures<'_>, start: usize, end: usize) -> RawFunction {
    let body_open = text[end - 1..]
        .find('{')
        .map(|i| end - 1 + i)
        .unwrap_or(end - 1);
    let body = brace_block(text, body_open);
    RawFunction {
        name: captures["name"].to_string(),
        exported: captures.name("export").is_some(),
        span: (start, body_open + body.len()),
        docstring: doc_comment_above(text, start),
        body,
    }
}

/// The `{ ... }` block starting at `open`, via brace matching; falls back
/// to the rest of the text when unbalanced.
fn brace_block(text: &str, open: usize) -> String {
    let bytes = text.as_bytes();
    if open >= bytes.len() || bytes[open] != b'{' {
        return String::new();
    }
    let mut depth = 0usize;
    for (i, &b) in bytes.iter().enumerate().skip(open) {
        match b {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return text[open..=i].to_string();
                }
            }
            _ => {}
        }
    }
    text[open..].to_string()
}

/// Documentation block (`/** */`, `///` or `//`) immediately above a
/// declaration, stripped of comment markers.
fn doc_comment_above(text: &str, decl_start: usize) -> Option<String> {
    let head = &text[..decl_start];
    let lines: Vec<&str> = head.lines().collect();
    // A blank line breaks attachment; only directly preceding comments count.
    if matches!(lines.last(), Some(l) if l.trim().is_empty()) {
        return None;
    }

    let mut doc: Vec<String> = Vec::new();
    let mut in_block = false;
    for line in lines.iter().rev() {
        let trimmed = line.trim();
        if in_block {
            let cleaned = trimmed
                .trim_start_matches("/**")
                .trim_start_matches('*')
                .trim();
            if trimmed.starts_with("/**") || trimmed.starts_with("/*") {
                if !cleaned.is_empty() {
                    doc.push(cleaned.to_string());
                }
                break;
            }
            if !cleaned.is_empty() && cleaned != "/" {
                doc.push(cleaned.to_string());
            }
            continue;
        }
        if trimmed.ends_with("*/") {
            in_block = true;
            let cleaned = trimmed.trim_end_matches("*/").trim_start_matches('*').trim();
            if !cleaned.is_empty() {
                doc.push(cleaned.to_string());
            }
            continue;
        }
        if trimmed.starts_with("///") || trimmed.starts_with("//") {
            doc.push(
                trimmed
                    .trim_start_matches('/')
                    .trim()
                    .to_string(),
            );
            continue;
        }
        break;
    }
    if doc.is_empty() {
        return None;
    }
    doc.reverse();
    doc.retain(|l| !l.is_empty());
    Some(doc.join("\n"))
}

/// Approximate cyclomatic complexity: one plus the count of decision
/// points.
fn complexity(body: &str) -> usize {
    1 + DECISION_POINT.find_iter(body).count()
}

/// Identifiers in call position, excluding builtins and the function's own
/// name.
fn dependencies(body: &str, own_name: &str) -> HashSet<String> {
    CALL_SITE
        .captures_iter(body)
        .map(|c| c[1].to_string())
        .filter(|name| name != own_name)
        .filter(|name| !CALL_DENYLIST.contains(&name.as_str()))
        .collect()
}

fn guess_language(path: &str) -> String {
    match path.rsplit('.').next() {
        Some("ts") | Some("tsx") => "typescript",
        Some("js") | Some("jsx") | Some("mjs") => "javascript",
        Some("rs") => "rust",
        Some("py") => "python",
        Some("go") => "go",
        _ => "unknown",
    }
    .to_string()
}
