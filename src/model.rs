use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CubeError, Result};

/// Maximum slug length in a node id.
pub const SLUG_MAX: usize = 50;
/// Maximum content preview length, in characters.
pub const PREVIEW_MAX: usize = 200;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    #[default]
    Task,
    Doc,
    Code,
    Decision,
    Ideation,
    Brainfart,
    Research,
    Conversation,
    Concept,
    Event,
    Agent,
    Project,
}

impl NodeType {
    pub const ALL: [NodeType; 12] = [
        Self::Task,
        Self::Doc,
        Self::Code,
        Self::Decision,
        Self::Ideation,
        Self::Brainfart,
        Self::Research,
        Self::Conversation,
        Self::Concept,
        Self::Event,
        Self::Agent,
        Self::Project,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Doc => "doc",
            Self::Code => "code",
            Self::Decision => "decision",
            Self::Ideation => "ideation",
            Self::Brainfart => "brainfart",
            Self::Research => "research",
            Self::Conversation => "conversation",
            Self::Concept => "concept",
            Self::Event => "event",
            Self::Agent => "agent",
            Self::Project => "project",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeType {
    type Err = CubeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| CubeError::InvalidInput(format!("unknown node type '{s}'")))
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Pending,
    Claimed,
    Active,
    Blocked,
    Complete,
    Archived,
}

impl Status {
    pub const ALL: [Status; 6] = [
        Self::Pending,
        Self::Claimed,
        Self::Active,
        Self::Blocked,
        Self::Complete,
        Self::Archived,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Active => "active",
            Self::Blocked => "blocked",
            Self::Complete => "complete",
            Self::Archived => "archived",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = CubeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| CubeError::InvalidInput(format!("unknown status '{s}'")))
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Validity {
    #[default]
    Current,
    Stale,
    Superseded,
    Archived,
}

impl Validity {
    pub const ALL: [Validity; 4] = [
        Self::Current,
        Self::Stale,
        Self::Superseded,
        Self::Archived,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Current => "current",
            Self::Stale => "stale",
            Self::Superseded => "superseded",
            Self::Archived => "archived",
        }
    }
}

impl fmt::Display for Validity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Validity {
    type Err = CubeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| CubeError::InvalidInput(format!("unknown validity '{s}'")))
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 4] = [Self::Critical, Self::High, Self::Normal, Self::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }

    /// Sort rank: critical sorts first.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = CubeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| CubeError::InvalidInput(format!("unknown priority '{s}'")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeType {
    Implements,
    Documents,
    SourcedFrom,
    Blocks,
    BlockedBy,
    DependsOn,
    Spawns,
    Becomes,
    RelatesTo,
    PartOf,
    Supersedes,
    Invalidates,
    DerivedFrom,
    AssignedTo,
    OwnedBy,
    LockedBy,
}

impl EdgeType {
    pub const ALL: [EdgeType; 16] = [
        Self::Implements,
        Self::Documents,
        Self::SourcedFrom,
        Self::Blocks,
        Self::BlockedBy,
        Self::DependsOn,
        Self::Spawns,
        Self::Becomes,
        Self::RelatesTo,
        Self::PartOf,
        Self::Supersedes,
        Self::Invalidates,
        Self::DerivedFrom,
        Self::AssignedTo,
        Self::OwnedBy,
        Self::LockedBy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Implements => "implements",
            Self::Documents => "documents",
            Self::SourcedFrom => "sourced-from",
            Self::Blocks => "blocks",
            Self::BlockedBy => "blocked-by",
            Self::DependsOn => "depends-on",
            Self::Spawns => "spawns",
            Self::Becomes => "becomes",
            Self::RelatesTo => "relates-to",
            Self::PartOf => "part-of",
            Self::Supersedes => "supersedes",
            Self::Invalidates => "invalidates",
            Self::DerivedFrom => "derived-from",
            Self::AssignedTo => "assigned-to",
            Self::OwnedBy => "owned-by",
            Self::LockedBy => "locked-by",
        }
    }
}

impl fmt::Display for EdgeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EdgeType {
    type Err = CubeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| CubeError::InvalidInput(format!("unknown edge type '{s}'")))
    }
}

/// A typed directed relation, owned by its source node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Edge {
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub edge_type: EdgeType,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl Edge {
    /// Deterministic edge identifier: `{from}--{type}-->{to}`.
    pub fn id(&self) -> String {
        edge_id(&self.from, self.edge_type, &self.to)
    }
}

pub fn edge_id(from: &str, edge_type: EdgeType, to: &str) -> String {
    format!("{from}--{edge_type}-->{to}")
}

/// Ordering metadata: supersession chain, content fingerprint, freshness date.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ordering {
    pub superseded_by: Option<String>,
    pub semantic_hash: String,
    pub source_freshness: NaiveDate,
}

/// A typed, versioned knowledge unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub version: u64,
    pub status: Status,
    pub validity: Validity,
    pub confidence: f64,
    pub priority: Priority,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_by: Option<String>,
    pub assigned_to: Option<String>,
    pub locked_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub due_at: Option<DateTime<Utc>>,
    pub ordering: Ordering,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub actions: Vec<serde_json::Value>,
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub content_preview: String,
    /// Relative path within the workspace; set by storage, not persisted in the header.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
}

/// Input for constructing a fresh node.
#[derive(Debug, Default, Clone)]
pub struct NewNode {
    pub node_type: NodeType,
    pub title: String,
    pub content: Option<String>,
    pub status: Option<Status>,
    pub priority: Option<Priority>,
    pub tags: Vec<String>,
    pub assigned_to: Option<String>,
    pub created_by: Option<String>,
    pub due_at: Option<DateTime<Utc>>,
    /// Defaults to 1.0; clamped to [0, 1].
    pub confidence: Option<f64>,
    /// Edges attached inline at creation; `from` is filled with the new id.
    pub edges: Vec<EdgeSpec>,
}

impl NewNode {
    pub fn new(node_type: NodeType, title: impl Into<String>) -> Self {
        Self {
            node_type,
            title: title.into(),
            ..Self::default()
        }
    }
}

/// Edge parameters supplied by callers; `from` and `created_at` are derived.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EdgeSpec {
    #[serde(rename = "type")]
    pub edge_type: EdgeType,
    pub to: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Partial update applied through `Node::apply_update`.
///
/// Outer `None` means "leave unchanged"; for nullable fields the inner
/// option distinguishes "set" from "clear".
#[derive(Debug, Default, Clone)]
pub struct NodeUpdate {
    pub title: Option<String>,
    pub content: Option<String>,
    pub status: Option<Status>,
    pub validity: Option<Validity>,
    pub priority: Option<Priority>,
    pub confidence: Option<f64>,
    pub tags: Option<Vec<String>>,
    pub assigned_to: Option<Option<String>>,
    pub locked_by: Option<Option<String>>,
    pub due_at: Option<Option<DateTime<Utc>>>,
    pub superseded_by: Option<Option<String>>,
}

impl NodeUpdate {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.content.is_none()
            && self.status.is_none()
            && self.validity.is_none()
            && self.priority.is_none()
            && self.confidence.is_none()
            && self.tags.is_none()
            && self.assigned_to.is_none()
            && self.locked_by.is_none()
            && self.due_at.is_none()
            && self.superseded_by.is_none()
    }
}

static PUNCTUATION: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\w\s]").unwrap());
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static HEADING: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^#{1,6}\s+").unwrap());

/// Derive the slug portion of a node id from its title.
pub fn slugify(title: &str) -> String {
    let lowered = title.to_lowercase();
    let mut slug = String::with_capacity(lowered.len());
    let mut pending_dash = false;
    for c in lowered.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c);
        } else {
            pending_dash = true;
        }
    }
    slug.truncate(SLUG_MAX);
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "untitled".to_string()
    } else {
        slug
    }
}

/// Derive a node id: `{type}/{slug}-{6hex}` where the suffix hashes
/// type, title and creation time.
pub fn derive_id(node_type: NodeType, title: &str, creation_millis: i64) -> String {
    let digest = Sha256::digest(format!("{node_type}:{title}:{creation_millis}").as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("{}/{}-{}", node_type, slugify(title), &hex[..6])
}

/// Semantic hash: first 16 hex chars of SHA-256 over normalized title+content.
pub fn semantic_hash(title: &str, content: &str) -> String {
    let combined = format!("{title} {content}").to_lowercase();
    let stripped = PUNCTUATION.replace_all(&combined, "");
    let collapsed = WHITESPACE.replace_all(&stripped, " ");
    let normalized = collapsed.trim();
    let digest = Sha256::digest(normalized.as_bytes());
    digest.iter().take(8).map(|b| format!("{b:02x}")).collect()
}

/// Derive a display preview from body content: headings stripped,
/// whitespace collapsed, truncated to `PREVIEW_MAX` characters.
pub fn content_preview(content: &str) -> String {
    let no_headings = HEADING.replace_all(content, "");
    let collapsed = WHITESPACE.replace_all(&no_headings, " ");
    collapsed.trim().chars().take(PREVIEW_MAX).collect()
}

/// Trim, drop empties, dedup preserving first-occurrence order.
fn normalize_tags(tags: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    tags.into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

impl Node {
    /// Build a fresh node at `now` with derived id, hash and preview.
    ///
    /// Inline edges from the input are NOT attached here; the graph facade
    /// verifies their targets first.
    pub fn create_at(input: &NewNode, now: DateTime<Utc>) -> Result<Node> {
        Self::create_with_millis(input, now, now.timestamp_millis())
    }

    /// Creation hook allowing the facade to vary the id-derivation clock on
    /// collision retries.
    pub fn create_with_millis(
        input: &NewNode,
        now: DateTime<Utc>,
        creation_millis: i64,
    ) -> Result<Node> {
        if input.title.trim().is_empty() {
            return Err(CubeError::InvalidInput("title cannot be empty".into()));
        }
        let content = input.content.clone().unwrap_or_default();
        Ok(Node {
            id: derive_id(input.node_type, &input.title, creation_millis),
            node_type: input.node_type,
            version: 1,
            status: input.status.unwrap_or_default(),
            validity: Validity::Current,
            confidence: input.confidence.unwrap_or(1.0).clamp(0.0, 1.0),
            priority: input.priority.unwrap_or_default(),
            tags: normalize_tags(input.tags.clone()),
            created_by: input.created_by.clone(),
            assigned_to: input.assigned_to.clone(),
            locked_by: None,
            created_at: now,
            modified_at: now,
            due_at: input.due_at,
            ordering: Ordering {
                superseded_by: None,
                semantic_hash: semantic_hash(&input.title, &content),
                source_freshness: now.date_naive(),
            },
            edges: Vec::new(),
            actions: Vec::new(),
            title: input.title.clone(),
            content_preview: content_preview(&content),
            content,
            file_path: None,
        })
    }

    /// Apply a partial update: version+1, fresh `modified_at`; preview and
    /// semantic hash recompute only when title or content moved.
    pub fn apply_update(&self, update: &NodeUpdate, now: DateTime<Utc>) -> Result<Node> {
        let mut next = self.clone();

        if let Some(title) = &update.title {
            if title.trim().is_empty() {
                return Err(CubeError::InvalidInput("title cannot be empty".into()));
            }
            next.title = title.clone();
        }
        if let Some(content) = &update.content {
            next.content = content.clone();
        }
        if let Some(status) = update.status {
            next.status = status;
        }
        if let Some(validity) = update.validity {
            next.validity = validity;
        }
        if let Some(priority) = update.priority {
            next.priority = priority;
        }
        if let Some(confidence) = update.confidence {
            next.confidence = confidence.clamp(0.0, 1.0);
        }
        if let Some(tags) = &update.tags {
            next.tags = normalize_tags(tags.clone());
        }
        if let Some(assigned_to) = &update.assigned_to {
            next.assigned_to = assigned_to.clone();
        }
        if let Some(locked_by) = &update.locked_by {
            next.locked_by = locked_by.clone();
        }
        if let Some(due_at) = &update.due_at {
            next.due_at = *due_at;
        }
        if let Some(superseded_by) = &update.superseded_by {
            next.ordering.superseded_by = superseded_by.clone();
        }

        if update.title.is_some() || update.content.is_some() {
            next.ordering.semantic_hash = semantic_hash(&next.title, &next.content);
            next.content_preview = content_preview(&next.content);
        }

        next.version = self.version + 1;
        next.modified_at = now;
        Ok(next)
    }

    /// Append an edge; the edge timestamp and the node's `modified_at` share
    /// one instant. Callers check for duplicates.
    pub fn with_edge(&self, spec: &EdgeSpec, now: DateTime<Utc>) -> Node {
        let mut next = self.clone();
        next.edges.push(Edge {
            from: self.id.clone(),
            to: spec.to.clone(),
            edge_type: spec.edge_type,
            metadata: spec.metadata.clone(),
            created_at: now,
        });
        next.version = self.version + 1;
        next.modified_at = now;
        next
    }

    /// Remove the edge with the given deterministic id.
    pub fn without_edge(&self, edge_id: &str, now: DateTime<Utc>) -> Result<Node> {
        let mut next = self.clone();
        let before = next.edges.len();
        next.edges.retain(|e| e.id() != edge_id);
        if next.edges.len() == before {
            return Err(CubeError::EdgeNotFound(edge_id.to_string()));
        }
        next.version = self.version + 1;
        next.modified_at = now;
        Ok(next)
    }

    pub fn find_edge(&self, edge_type: EdgeType, to: &str) -> Option<&Edge> {
        self.edges
            .iter()
            .find(|e| e.edge_type == edge_type && e.to == to)
    }

    /// Outgoing edges of a given type.
    pub fn edges_of_type(&self, edge_type: EdgeType) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| e.edge_type == edge_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_now() -> DateTime<Utc> {
        "2025-03-01T12:00:00Z".parse().unwrap()
    }

    #[test]
    fn slugify_basic() {
        assert_eq!(slugify("Implement authentication"), "implement-authentication");
        assert_eq!(slugify("  Fix: the bug!!  "), "fix-the-bug");
        assert_eq!(slugify("___"), "untitled");
        assert_eq!(slugify(""), "untitled");
    }

    #[test]
    fn slugify_truncates_to_fifty() {
        let long = "a".repeat(80);
        assert_eq!(slugify(&long).len(), SLUG_MAX);
    }

    #[test]
    fn slugify_never_ends_with_dash_after_truncation() {
        // 49 chars then a separator right at the cut point
        let title = format!("{} tail", "b".repeat(49));
        let slug = slugify(&title);
        assert!(!slug.ends_with('-'));
        assert!(!slug.starts_with('-'));
    }

    #[test]
    fn derived_id_shape() {
        let id = derive_id(NodeType::Task, "Implement authentication", 1_700_000_000_000);
        let re = Regex::new(r"^task/[-a-z0-9]{1,50}-[0-9a-f]{6}$").unwrap();
        assert!(re.is_match(&id), "unexpected id: {id}");
        assert!(id.starts_with("task/implement-authentication-"));
    }

    #[test]
    fn derived_id_is_deterministic() {
        let a = derive_id(NodeType::Doc, "Title", 42);
        let b = derive_id(NodeType::Doc, "Title", 42);
        let c = derive_id(NodeType::Doc, "Title", 43);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn semantic_hash_is_sixteen_lower_hex() {
        let h = semantic_hash("Add login", "Support OAuth flows.");
        assert_eq!(h.len(), 16);
        assert!(h.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_eq!(h, h.to_lowercase());
    }

    #[test]
    fn semantic_hash_ignores_case_punctuation_and_spacing() {
        let a = semantic_hash("Add   Login!", "support, oauth.");
        let b = semantic_hash("add login", "Support OAuth");
        assert_eq!(a, b);
    }

    #[test]
    fn preview_strips_headings_and_collapses_whitespace() {
        let body = "# Heading\n\nSome   text\nspanning lines.\n## Sub\nmore";
        assert_eq!(content_preview(body), "Heading Some text spanning lines. Sub more");
    }

    #[test]
    fn preview_truncates_to_limit() {
        let body = "x".repeat(500);
        assert_eq!(content_preview(&body).chars().count(), PREVIEW_MAX);
    }

    #[test]
    fn create_fills_defaults() {
        let node = Node::create_at(
            &NewNode::new(NodeType::Task, "Implement authentication"),
            fixed_now(),
        )
        .unwrap();
        assert_eq!(node.version, 1);
        assert_eq!(node.status, Status::Pending);
        assert_eq!(node.validity, Validity::Current);
        assert_eq!(node.priority, Priority::Normal);
        assert!((node.confidence - 1.0).abs() < f64::EPSILON);
        assert_eq!(node.created_at, node.modified_at);
        assert_eq!(node.ordering.source_freshness, fixed_now().date_naive());
        assert!(node.edges.is_empty());
        assert!(node.actions.is_empty());
    }

    #[test]
    fn create_rejects_blank_title() {
        let err = Node::create_at(&NewNode::new(NodeType::Task, "   "), fixed_now()).unwrap_err();
        assert_eq!(err.code(), "invalid_input");
    }

    #[test]
    fn create_normalizes_tags() {
        let mut input = NewNode::new(NodeType::Task, "T");
        input.tags = vec![" api ".into(), "".into(), "api".into(), "auth".into()];
        let node = Node::create_at(&input, fixed_now()).unwrap();
        assert_eq!(node.tags, vec!["api", "auth"]);
    }

    #[test]
    fn update_bumps_version_and_recomputes_hash_on_content_change() {
        let node = Node::create_at(&NewNode::new(NodeType::Task, "T"), fixed_now()).unwrap();
        let hash_before = node.ordering.semantic_hash.clone();

        let update = NodeUpdate {
            content: Some("new body".into()),
            ..NodeUpdate::default()
        };
        let later = fixed_now() + chrono::Duration::seconds(5);
        let updated = node.apply_update(&update, later).unwrap();

        assert_eq!(updated.version, 2);
        assert_eq!(updated.modified_at, later);
        assert_ne!(updated.ordering.semantic_hash, hash_before);
        assert_eq!(updated.content_preview, "new body");
    }

    #[test]
    fn update_without_title_or_content_keeps_hash() {
        let node = Node::create_at(&NewNode::new(NodeType::Task, "T"), fixed_now()).unwrap();
        let hash = node.ordering.semantic_hash.clone();

        let update = NodeUpdate {
            status: Some(Status::Active),
            ..NodeUpdate::default()
        };
        let updated = node.apply_update(&update, fixed_now()).unwrap();
        assert_eq!(updated.status, Status::Active);
        assert_eq!(updated.ordering.semantic_hash, hash);
        assert_eq!(updated.version, 2);
    }

    #[test]
    fn update_clears_nullable_fields() {
        let mut input = NewNode::new(NodeType::Task, "T");
        input.assigned_to = Some("coder".into());
        let node = Node::create_at(&input, fixed_now()).unwrap();

        let update = NodeUpdate {
            assigned_to: Some(None),
            ..NodeUpdate::default()
        };
        let updated = node.apply_update(&update, fixed_now()).unwrap();
        assert_eq!(updated.assigned_to, None);
    }

    #[test]
    fn confidence_is_clamped() {
        let node = Node::create_at(&NewNode::new(NodeType::Task, "T"), fixed_now()).unwrap();
        let update = NodeUpdate {
            confidence: Some(7.5),
            ..NodeUpdate::default()
        };
        let updated = node.apply_update(&update, fixed_now()).unwrap();
        assert!((updated.confidence - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn edge_id_is_deterministic() {
        let node = Node::create_at(&NewNode::new(NodeType::Task, "A"), fixed_now()).unwrap();
        let spec = EdgeSpec {
            edge_type: EdgeType::DependsOn,
            to: "task/b-000000".into(),
            metadata: serde_json::Map::new(),
        };
        let with = node.with_edge(&spec, fixed_now());
        assert_eq!(with.edges.len(), 1);
        assert_eq!(
            with.edges[0].id(),
            format!("{}--depends-on-->task/b-000000", node.id)
        );
        assert_eq!(with.version, 2);
    }

    #[test]
    fn without_edge_removes_and_bumps_version() {
        let node = Node::create_at(&NewNode::new(NodeType::Task, "A"), fixed_now()).unwrap();
        let spec = EdgeSpec {
            edge_type: EdgeType::Blocks,
            to: "task/b-000000".into(),
            metadata: serde_json::Map::new(),
        };
        let with = node.with_edge(&spec, fixed_now());
        let id = with.edges[0].id();
        let removed = with.without_edge(&id, fixed_now()).unwrap();
        assert!(removed.edges.is_empty());
        assert_eq!(removed.version, 3);

        let err = removed.without_edge(&id, fixed_now()).unwrap_err();
        assert_eq!(err.code(), "edge_not_found");
    }

    #[test]
    fn closed_enums_reject_unknown_values() {
        assert!("taskk".parse::<NodeType>().is_err());
        assert!("urgent".parse::<Priority>().is_err());
        assert!("points-at".parse::<EdgeType>().is_err());
        assert_eq!("blocked-by".parse::<EdgeType>().unwrap(), EdgeType::BlockedBy);
    }

    #[test]
    fn edge_type_serde_uses_kebab_case() {
        let json = serde_json::to_string(&EdgeType::DependsOn).unwrap();
        assert_eq!(json, r#""depends-on""#);
        let json = serde_json::to_string(&EdgeType::SourcedFrom).unwrap();
        assert_eq!(json, r#""sourced-from""#);
    }
}
