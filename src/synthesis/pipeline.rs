//! Routes sources to extractors, filters by confidence, deduplicates
//! candidates against the existing graph, and applies the outcome through
//! the facade.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{code, conversation, token_set, ExtractedNode, ExtractedRelation, ExtractionResult,
    SynthesisSource};
use crate::error::Result;
use crate::graph::Graph;
use crate::model::{EdgeType, NewNode, NodeUpdate};
use crate::store::index::QueryOptions;

const SIMILARITY_FLOOR: f64 = 0.3;
const SKIP_THRESHOLD: f64 = 0.95;
const LINK_THRESHOLD: f64 = 0.5;
const MAX_MATCHES: usize = 5;

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Candidates below this confidence are dropped.
    pub min_confidence: f64,
    /// Similarity at or above which a candidate merges into an existing node.
    pub dedup_threshold: f64,
    /// When set, only explicitly approved candidates are applied.
    pub require_approval: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            min_confidence: 0.3,
            dedup_threshold: 0.8,
            require_approval: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Recommendation {
    /// Near-exact duplicate of an existing node.
    Skip { target: String },
    /// Fold the candidate into an existing node.
    Merge { target: String },
    /// Create, then relate to the closest existing node.
    Link { target: String },
    Create,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarMatch {
    pub node_id: String,
    pub similarity: f64,
}

/// One extracted node with its graph context.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub node: ExtractedNode,
    pub matches: Vec<SimilarMatch>,
    pub recommendation: Recommendation,
}

#[derive(Debug, Default, Clone)]
pub struct ApplyOutcome {
    pub created: Vec<String>,
    pub merged: Vec<String>,
    pub linked: Vec<String>,
    pub skipped: usize,
}

pub struct SynthesisPipeline {
    graph: Arc<Graph>,
    options: PipelineOptions,
}

impl SynthesisPipeline {
    pub fn new(graph: Arc<Graph>, options: PipelineOptions) -> Self {
        Self { graph, options }
    }

    /// Run every source through its extractor and drop low-confidence
    /// candidates.
    pub fn extract(&self, sources: &[SynthesisSource]) -> ExtractionResult {
        let mut result = ExtractionResult::default();
        for source in sources {
            let partial = match source {
                SynthesisSource::Conversation { text } => conversation::extract(text),
                SynthesisSource::Code {
                    path,
                    language,
                    text,
                } => code::extract(path, language.as_deref(), text),
            };
            result.merge(partial);
        }
        result
            .nodes
            .retain(|n| n.confidence >= self.options.min_confidence);
        result
    }

    /// Score each candidate against existing nodes of the same type and
    /// attach a recommendation.
    pub fn dedup(&self, nodes: Vec<ExtractedNode>) -> Result<Vec<Candidate>> {
        let mut by_type: HashMap<crate::model::NodeType, Vec<crate::model::Node>> = HashMap::new();
        let mut candidates = Vec::new();

        for node in nodes {
            if !by_type.contains_key(&node.node_type) {
                let opts = QueryOptions {
                    node_type: vec![node.node_type],
                    ..QueryOptions::default()
                };
                by_type.insert(node.node_type, self.graph.query(&opts, true)?);
            }
            let existing = &by_type[&node.node_type];

            let mut matches: Vec<SimilarMatch> = existing
                .iter()
                .map(|other| SimilarMatch {
                    node_id: other.id.clone(),
                    similarity: similarity(&node, other),
                })
                .filter(|m| m.similarity >= SIMILARITY_FLOOR)
                .collect();
            matches.sort_by(|a, b| {
                b.similarity
                    .partial_cmp(&a.similarity)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            matches.truncate(MAX_MATCHES);

            let recommendation = match matches.first() {
                Some(best) if best.similarity >= SKIP_THRESHOLD => Recommendation::Skip {
                    target: best.node_id.clone(),
                },
                Some(best) if best.similarity >= self.options.dedup_threshold => {
                    Recommendation::Merge {
                        target: best.node_id.clone(),
                    }
                }
                Some(best) if best.similarity >= LINK_THRESHOLD => Recommendation::Link {
                    target: best.node_id.clone(),
                },
                _ => Recommendation::Create,
            };
            candidates.push(Candidate {
                node,
                matches,
                recommendation,
            });
        }
        Ok(candidates)
    }

    /// Extract, filter and dedup in one pass.
    pub fn process(&self, sources: &[SynthesisSource]) -> Result<(Vec<Candidate>, Vec<ExtractedRelation>)> {
        let result = self.extract(sources);
        let relations = result.relations.clone();
        let candidates = self.dedup(result.nodes)?;
        Ok((candidates, relations))
    }

    /// Apply recommendations through the graph facade. With
    /// `require_approval`, only candidates whose index appears in
    /// `approved` are applied; the rest are skipped.
    pub fn create_nodes(
        &self,
        candidates: &[Candidate],
        relations: &[ExtractedRelation],
        approved: Option<&HashSet<usize>>,
    ) -> Result<ApplyOutcome> {
        let mut outcome = ApplyOutcome::default();
        let mut created_by_title: HashMap<String, String> = HashMap::new();

        for (index, candidate) in candidates.iter().enumerate() {
            if self.options.require_approval
                && !approved.map(|a| a.contains(&index)).unwrap_or(false)
            {
                outcome.skipped += 1;
                continue;
            }

            match &candidate.recommendation {
                Recommendation::Skip { .. } => outcome.skipped += 1,
                Recommendation::Merge { target } => {
                    self.merge_into(target, &candidate.node)?;
                    outcome.merged.push(target.clone());
                }
                Recommendation::Link { target } => {
                    let id = self.create_candidate(&candidate.node)?;
                    if let Err(err) =
                        self.graph.link(&id, EdgeType::RelatesTo, target, None)
                    {
                        tracing::warn!(from = %id, to = %target, error = %err, "link recommendation failed");
                    }
                    created_by_title.insert(candidate.node.title.clone(), id.clone());
                    outcome.linked.push(id.clone());
                    outcome.created.push(id);
                }
                Recommendation::Create => {
                    let id = self.create_candidate(&candidate.node)?;
                    created_by_title.insert(candidate.node.title.clone(), id.clone());
                    outcome.created.push(id);
                }
            }
        }

        for relation in relations {
            let (Some(from), Some(to)) = (
                created_by_title.get(&relation.from_title),
                created_by_title.get(&relation.to_title),
            ) else {
                continue;
            };
            if let Err(err) = self.graph.link(from, relation.edge_type, to, None) {
                if !err.is_conflict() {
                    tracing::warn!(from = %from, to = %to, error = %err, "relation link failed");
                }
            }
        }
        Ok(outcome)
    }

    fn create_candidate(&self, node: &ExtractedNode) -> Result<String> {
        let mut input = NewNode::new(node.node_type, node.title.clone());
        input.content = Some(node.content.clone());
        input.tags = node.tags.clone();
        input.priority = Some(node.priority);
        input.confidence = Some(node.confidence);
        input.created_by = Some("synthesis".to_string());
        Ok(self.graph.create(input)?.id)
    }

    fn merge_into(&self, target: &str, node: &ExtractedNode) -> Result<()> {
        let existing = self.graph.get(target)?;
        let mut tags = existing.tags.clone();
        for tag in &node.tags {
            if !tags.contains(tag) {
                tags.push(tag.clone());
            }
        }
        let content = if existing.content.is_empty() {
            node.content.clone()
        } else if existing.content.contains(&node.content) {
            existing.content.clone()
        } else {
            format!("{}\n\n{}", existing.content, node.content)
        };
        let update = NodeUpdate {
            tags: Some(tags),
            content: Some(content),
            ..NodeUpdate::default()
        };
        self.graph.update(target, &update)?;
        Ok(())
    }
}

/// Weighted similarity between a candidate and an existing node.
fn similarity(candidate: &ExtractedNode, existing: &crate::model::Node) -> f64 {
    let title = super::token_similarity(&token_set(&candidate.title), &token_set(&existing.title));
    let content =
        super::token_similarity(&token_set(&candidate.content), &token_set(&existing.content));
    let candidate_tags: HashSet<String> = candidate.tags.iter().cloned().collect();
    let existing_tags: HashSet<String> = existing.tags.iter().cloned().collect();
    let tags = if candidate_tags.is_empty() || existing_tags.is_empty() {
        0.0
    } else {
        candidate_tags.intersection(&existing_tags).count() as f64
            / candidate_tags.union(&existing_tags).count() as f64
    };
    0.5 * title + 0.3 * content + 0.2 * tags
}
