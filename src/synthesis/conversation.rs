//! Conversation extractor: splits a transcript into role-prefixed messages
//! and runs pattern families (task, decision, idea, question) over the
//! concatenated content.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{
    ceil_char_boundary, floor_char_boundary, token_set, ExtractedNode, ExtractionResult, Intent,
    MessageIntent,
};
use crate::model::{NodeType, Priority};

const TITLE_MAX: usize = 100;
const CONTEXT_CHARS: usize = 50;
/// A replacement candidate must beat the incumbent by this much.
const OVERLAP_MARGIN: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Task,
    Decision,
    Idea,
    Question,
}

struct Pattern {
    family: Family,
    regex: Regex,
    confidence: f64,
    node_type: NodeType,
    priority: Option<Priority>,
}

static PATTERNS: LazyLock<Vec<Pattern>> = LazyLock::new(|| {
    let p = |family, pattern: &str, confidence, node_type, priority| Pattern {
        family,
        regex: Regex::new(pattern).expect("extraction pattern compiles"),
        confidence,
        node_type,
        priority,
    };
    vec![
        p(
            Family::Task,
            r"(?i)\btodo:?\s*([^.!?\n]+)",
            0.9,
            NodeType::Task,
            None,
        ),
        p(
            Family::Task,
            r"(?i)\b(?:we|i|you)\s+need\s+to\s+([^.!?\n]+)",
            0.8,
            NodeType::Task,
            None,
        ),
        p(
            Family::Task,
            r"(?i)\b(?:should|must|have\s+to)\s+((?:implement|add|fix|build|create|write)\s+[^.!?\n]+)",
            0.7,
            NodeType::Task,
            None,
        ),
        p(
            Family::Task,
            r"(?i)\blet'?s\s+((?:implement|add|fix|build|create)\s+[^.!?\n]+)",
            0.7,
            NodeType::Task,
            None,
        ),
        p(
            Family::Decision,
            r"(?i)\b(?:we\s+)?decided\s+to\s+([^.!?\n]+)",
            0.85,
            NodeType::Decision,
            None,
        ),
        p(
            Family::Decision,
            r"(?i)\bwe(?:'ll|\s+will)\s+go\s+with\s+([^.!?\n]+)",
            0.8,
            NodeType::Decision,
            None,
        ),
        p(
            Family::Decision,
            r"(?i)\bconclusion:?\s*([^.!?\n]+)",
            0.8,
            NodeType::Decision,
            None,
        ),
        p(
            Family::Idea,
            r"(?i)\bidea:?\s*([^.!?\n]+)",
            0.75,
            NodeType::Ideation,
            Some(Priority::Low),
        ),
        p(
            Family::Idea,
            r"(?i)\bwhat\s+if\s+(?:we\s+)?([^.!?\n]+)",
            0.6,
            NodeType::Ideation,
            Some(Priority::Low),
        ),
        p(
            Family::Idea,
            r"(?i)\bwe\s+could\s+([^.!?\n]+)",
            0.6,
            NodeType::Ideation,
            Some(Priority::Low),
        ),
        p(
            Family::Question,
            r"(?i)\b((?:how|what|why|when|where|which)\b[^.!?\n]{4,})\?",
            0.5,
            NodeType::Research,
            None,
        ),
    ]
});

static ROLE_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(user|assistant|human|ai|system)\s*[:>]\s*").expect("role prefix compiles")
});

/// Small technical vocabulary mapped onto tags.
const VOCAB: &[(&str, &str)] = &[
    ("api", "api"),
    ("endpoint", "api"),
    ("rest", "api"),
    ("database", "database"),
    ("db", "database"),
    ("sql", "database"),
    ("schema", "database"),
    ("auth", "auth"),
    ("login", "auth"),
    ("oauth", "auth"),
    ("password", "auth"),
    ("session", "auth"),
    ("ui", "ui"),
    ("frontend", "ui"),
    ("css", "ui"),
    ("backend", "backend"),
    ("server", "backend"),
    ("test", "testing"),
    ("testing", "testing"),
    ("deploy", "deployment"),
    ("deployment", "deployment"),
    ("release", "deployment"),
    ("performance", "performance"),
    ("slow", "performance"),
    ("optimize", "performance"),
    ("security", "security"),
    ("docs", "docs"),
    ("documentation", "docs"),
];

const URGENCY_MARKERS: &[&str] = &["urgent", "asap", "immediately", "critical"];

/// Split a transcript into role-prefixed messages. Unstructured input is
/// one user message.
pub fn split_messages(text: &str) -> Vec<Message> {
    let mut messages: Vec<Message> = Vec::new();
    let mut current: Option<Message> = None;
    for line in text.lines() {
        if let Some(found) = ROLE_PREFIX.find(line) {
            if let Some(message) = current.take() {
                messages.push(message);
            }
            let role = match line[..found.end()]
                .trim_end_matches(|c: char| c == ':' || c == '>' || c.is_whitespace())
                .to_lowercase()
                .as_str()
            {
                "user" | "human" => Role::User,
                "assistant" | "ai" => Role::Assistant,
                _ => Role::System,
            };
            current = Some(Message {
                role,
                content: line[found.end()..].to_string(),
            });
        } else if let Some(message) = &mut current {
            message.content.push('\n');
            message.content.push_str(line);
        } else if !line.trim().is_empty() {
            current = Some(Message {
                role: Role::User,
                content: line.to_string(),
            });
        }
    }
    if let Some(message) = current {
        messages.push(message);
    }
    if messages.is_empty() && !text.trim().is_empty() {
        messages.push(Message {
            role: Role::User,
            content: text.trim().to_string(),
        });
    }
    messages
}

struct RawEntity {
    span: (usize, usize),
    text: String,
    confidence: f64,
    node_type: NodeType,
    priority: Option<Priority>,
}

/// Extract candidate nodes from a conversation transcript.
pub fn extract(text: &str) -> ExtractionResult {
    let messages = split_messages(text);
    let combined = messages
        .iter()
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n");

    let mut raw: Vec<RawEntity> = Vec::new();
    for pattern in PATTERNS.iter() {
        for captures in pattern.regex.captures_iter(&combined) {
            let group = captures.get(1).or_else(|| captures.get(0));
            let Some(found) = group else { continue };
            raw.push(RawEntity {
                span: (found.start(), found.end()),
                text: found.as_str().to_string(),
                confidence: pattern.confidence.clamp(0.0, 1.0),
                node_type: pattern.node_type,
                priority: pattern.priority,
            });
        }
    }

    let deduped = dedup_by_span(raw);
    let nodes = deduped
        .into_iter()
        .map(|entity| build_node(entity, &combined))
        .collect();

    let intents = messages
        .iter()
        .map(|m| MessageIntent {
            role: m.role,
            intent: classify_intent(&m.content),
        })
        .collect();

    ExtractionResult {
        nodes,
        relations: Vec::new(),
        intents,
    }
}

/// Resolve overlapping byte ranges: the incumbent survives unless the
/// challenger's confidence clears it by the margin.
fn dedup_by_span(mut raw: Vec<RawEntity>) -> Vec<RawEntity> {
    raw.sort_by_key(|e| (e.span.0, e.span.1));
    let mut kept: Vec<RawEntity> = Vec::new();
    for entity in raw {
        match kept.last_mut() {
            Some(last) if overlaps(last.span, entity.span) => {
                if entity.confidence > last.confidence + OVERLAP_MARGIN {
                    *last = entity;
                }
            }
            _ => kept.push(entity),
        }
    }
    kept
}

fn overlaps(a: (usize, usize), b: (usize, usize)) -> bool {
    a.0 < b.1 && b.0 < a.1
}

fn build_node(entity: RawEntity, combined: &str) -> ExtractedNode {
    let tokens = token_set(&entity.text);
    let mut tags: Vec<String> = Vec::new();
    for (word, tag) in VOCAB {
        if tokens.contains(*word) && !tags.iter().any(|t| t == tag) {
            tags.push((*tag).to_string());
        }
    }
    let urgent = URGENCY_MARKERS.iter().any(|m| tokens.contains(*m));
    if urgent && !tags.iter().any(|t| t == "urgent") {
        tags.push("urgent".to_string());
    }

    let priority = if urgent {
        Priority::High
    } else {
        entity.priority.unwrap_or(Priority::Normal)
    };

    let lo = floor_char_boundary(combined, entity.span.0.saturating_sub(CONTEXT_CHARS));
    let hi = ceil_char_boundary(combined, entity.span.1 + CONTEXT_CHARS);
    let content = combined[lo..hi].trim().to_string();

    ExtractedNode {
        title: clean_title(&entity.text),
        content,
        node_type: entity.node_type,
        tags,
        priority,
        confidence: entity.confidence,
        span: entity.span,
        metadata: serde_json::Map::new(),
    }
}

/// Sentence-case, single-spaced, capped at 100 chars with an ellipsis.
fn clean_title(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut chars = collapsed.chars();
    let mut title: String = match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => return String::new(),
    };
    if title.chars().count() > TITLE_MAX {
        title = title.chars().take(TITLE_MAX - 1).collect();
        title.push('…');
    }
    title
}

fn classify_intent(content: &str) -> Intent {
    let lowered = content.to_lowercase();
    if content.trim_end().ends_with('?')
        || PATTERNS
            .iter()
            .filter(|p| p.family == Family::Question)
            .any(|p| p.regex.is_match(content))
    {
        Intent::Question
    } else if lowered.contains("decided") || lowered.contains("go with") {
        Intent::Decision
    } else if PATTERNS
        .iter()
        .filter(|p| p.family == Family::Task)
        .any(|p| p.regex.is_match(content))
    {
        Intent::Request
    } else {
        Intent::Statement
    }
}
