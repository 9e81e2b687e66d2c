//! Rule-based extraction of candidate nodes from conversation text and
//! source code. Extractors never mutate the graph; the pipeline applies
//! their output through the facade.

pub mod code;
pub mod conversation;
pub mod pipeline;

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::model::{EdgeType, NodeType, Priority};

pub use pipeline::{
    ApplyOutcome, Candidate, PipelineOptions, Recommendation, SimilarMatch, SynthesisPipeline,
};

/// Raw material routed to an extractor.
#[derive(Debug, Clone)]
pub enum SynthesisSource {
    Conversation {
        text: String,
    },
    Code {
        path: String,
        language: Option<String>,
        text: String,
    },
}

/// A candidate node proposed by an extractor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedNode {
    pub title: String,
    pub content: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub tags: Vec<String>,
    pub priority: Priority,
    /// In [0, 1]; pipeline filtering is by this value.
    pub confidence: f64,
    /// Byte range in the extractor's working text; extractors guarantee
    /// surviving entities never overlap.
    pub span: (usize, usize),
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// A relation between two extracted candidates, by title.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRelation {
    pub from_title: String,
    pub to_title: String,
    #[serde(rename = "type")]
    pub edge_type: EdgeType,
}

/// Coarse per-message label from the conversation extractor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Question,
    Request,
    Decision,
    Statement,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageIntent {
    pub role: conversation::Role,
    pub intent: Intent,
}

/// Combined extractor output.
#[derive(Debug, Default, Clone)]
pub struct ExtractionResult {
    pub nodes: Vec<ExtractedNode>,
    pub relations: Vec<ExtractedRelation>,
    pub intents: Vec<MessageIntent>,
}

impl ExtractionResult {
    pub fn merge(&mut self, other: ExtractionResult) {
        self.nodes.extend(other.nodes);
        self.relations.extend(other.relations);
        self.intents.extend(other.intents);
    }
}

/// Normalized word set used by similarity scoring and tag inference.
pub(crate) fn token_set(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

/// Similarity of two token sets: the mean of Jaccard and the overlap
/// coefficient, so a short phrase contained in a longer one still scores
/// near 1.0.
pub(crate) fn token_similarity(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    let smaller = a.len().min(b.len()) as f64;
    let jaccard = intersection / union;
    let overlap = intersection / smaller;
    (jaccard + overlap) / 2.0
}

/// Clamp a byte offset down/up to the nearest char boundary.
pub(crate) fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    index = index.min(text.len());
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

pub(crate) fn ceil_char_boundary(text: &str, mut index: usize) -> usize {
    index = index.min(text.len());
    while index < text.len() && !text.is_char_boundary(index) {
        index += 1;
    }
    index
}
