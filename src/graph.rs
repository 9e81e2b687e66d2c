use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use chrono::Utc;

use crate::config::CubeConfig;
use crate::error::{CubeError, Result};
use crate::events::{default_bus, Event, EventBus, EventKind};
use crate::model::{edge_id, Edge, EdgeSpec, EdgeType, NewNode, Node, NodeType, NodeUpdate};
use crate::store::files::{FileStore, ListOutcome};
use crate::store::index::{EdgeDirection, Index, QueryOptions, SortDirection, SortField};
use crate::store::lock::WorkspaceLock;
use crate::CancelToken;

const CREATE_RETRIES: u32 = 3;
const DEFAULT_TRAVERSE_DEPTH: u32 = 10;

#[derive(Debug, Clone)]
pub struct GraphOptions {
    pub name: String,
    pub index_enabled: bool,
    pub events_enabled: bool,
}

impl Default for GraphOptions {
    fn default() -> Self {
        Self {
            name: "cube".to_string(),
            index_enabled: true,
            events_enabled: true,
        }
    }
}

/// Direction of traversal relative to the start node.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    #[default]
    Out,
    In,
    Both,
}

#[derive(Debug, Clone)]
pub struct TraverseOptions {
    pub start: String,
    pub direction: Direction,
    /// Empty means every edge type.
    pub edge_types: Vec<EdgeType>,
    pub max_depth: u32,
    pub include_start: bool,
}

impl TraverseOptions {
    pub fn new(start: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            direction: Direction::Out,
            edge_types: Vec::new(),
            max_depth: DEFAULT_TRAVERSE_DEPTH,
            include_start: true,
        }
    }
}

/// One reached node: its depth, the id path from the start, and the edge
/// used to reach it (`None` for the start node).
#[derive(Debug, Clone)]
pub struct TraversalStep {
    pub node: Node,
    pub depth: u32,
    pub path: Vec<String>,
    pub via: Option<Edge>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CubeStats {
    pub total: u64,
    pub by_type: HashMap<String, u64>,
    pub by_status: HashMap<String, u64>,
}

/// The single authoritative entry point for graph mutations and queries.
/// Files are the source of truth; the index is a derived mirror kept
/// coherent within each operation's writer-lock critical section.
#[derive(Debug)]
pub struct Graph {
    store: FileStore,
    index: Option<Mutex<Index>>,
    bus: Arc<EventBus>,
    config: CubeConfig,
    options: GraphOptions,
    writer: Mutex<()>,
    deferred_reindex: AtomicBool,
    _lock: WorkspaceLock,
}

impl Graph {
    /// Open (initializing if needed) a workspace. Takes the workspace-wide
    /// exclusive lock; a second writer process fails loudly here.
    pub fn init(root: &Path, options: GraphOptions) -> Result<Self> {
        Self::init_with_bus(root, options, None)
    }

    pub fn init_with_bus(
        root: &Path,
        options: GraphOptions,
        bus: Option<Arc<EventBus>>,
    ) -> Result<Self> {
        let store = FileStore::new(root);
        let config = store.init(&options.name)?;
        let lock = WorkspaceLock::acquire(&store.lock_path())?;
        let bus = bus.unwrap_or_else(default_bus);

        let index = if options.index_enabled {
            let index = Index::open(&store.index_path())?;
            let current_fp = store.fingerprint()?;
            let files_exist = !current_fp.is_empty();
            let mut needs_rebuild = index.count()? == 0 && files_exist;
            if !needs_rebuild && config.index.rebuild_on_start {
                needs_rebuild = index.get_fingerprint()?.as_deref() != Some(current_fp.as_str());
            }
            if needs_rebuild {
                let ListOutcome { nodes, skipped } = store.list_all()?;
                if skipped > 0 {
                    tracing::warn!(skipped, "rebuild skipped unreadable node files");
                }
                index.rebuild(&nodes)?;
            }
            index.set_fingerprint(&current_fp)?;
            Some(Mutex::new(index))
        } else {
            None
        };

        let graph = Self {
            store,
            index,
            bus,
            config,
            options,
            writer: Mutex::new(()),
            deferred_reindex: AtomicBool::new(false),
            _lock: lock,
        };
        graph.emit(EventKind::CubeInitialized {
            name: graph.config.name.clone(),
            root: root.display().to_string(),
        });
        Ok(graph)
    }

    pub fn config(&self) -> &CubeConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn root(&self) -> &Path {
        self.store.root()
    }

    /// True when a failed index write left the mirror behind the files.
    pub fn needs_reindex(&self) -> bool {
        self.deferred_reindex.load(AtomicOrdering::SeqCst)
    }

    fn emit(&self, kind: EventKind) {
        if self.options.events_enabled {
            self.bus.emit(Event::new(kind));
        }
    }

    /// Write the file, then mirror into the index. An index failure after a
    /// successful file write is downgraded: the mutation stands, the event
    /// still fires, and a deferred reindex is flagged.
    fn commit_node(&self, node: &Node) -> Result<Node> {
        let saved = self.store.save_node(node)?;
        if let Some(index) = &self.index {
            let guard = index.lock().expect("index lock poisoned");
            if let Err(err) = guard.index_node(&saved) {
                tracing::warn!(node = %saved.id, error = %err, "index update failed; deferring reindex");
                self.deferred_reindex.store(true, AtomicOrdering::SeqCst);
            }
            self.refresh_fingerprint(&guard);
        }
        Ok(saved)
    }

    fn refresh_fingerprint(&self, index: &Index) {
        if let Ok(fp) = self.store.fingerprint() {
            let _ = index.set_fingerprint(&fp);
        }
    }

    /// Create a node, attaching any inline edges after verifying their
    /// targets. Retries id derivation on collision before surfacing one.
    pub fn create(&self, input: NewNode) -> Result<Node> {
        let _guard = self.writer.lock().expect("writer lock poisoned");

        for spec in &input.edges {
            if !self.store.node_exists(&spec.to) {
                return Err(CubeError::NodeNotFound(spec.to.clone()));
            }
        }

        let now = Utc::now();
        let base_millis = now.timestamp_millis();
        let mut node = None;
        for attempt in 0..CREATE_RETRIES {
            let candidate = Node::create_with_millis(&input, now, base_millis + attempt as i64)?;
            if !self.store.node_exists(&candidate.id) {
                node = Some(candidate);
                break;
            }
        }
        let mut node = node.ok_or_else(|| CubeError::IdCollision(input.title.clone()))?;

        for spec in &input.edges {
            node = node.with_edge(spec, now);
        }
        node.version = 1;

        let saved = self.commit_node(&node)?;
        self.emit(EventKind::NodeCreated { node: saved.clone() });
        Ok(saved)
    }

    /// Authoritative read, straight from the file.
    pub fn get(&self, id: &str) -> Result<Node> {
        self.store.load_node(id)
    }

    pub fn exists(&self, id: &str) -> bool {
        self.store.node_exists(id)
    }

    /// Load-modify-save. Emits `node.updated` with a field-delta map, plus
    /// `node.status_changed` / `node.validity_changed` when those moved.
    pub fn update(&self, id: &str, update: &NodeUpdate) -> Result<Node> {
        let _guard = self.writer.lock().expect("writer lock poisoned");
        let before = self.store.load_node(id)?;
        if update.is_empty() {
            return Ok(before);
        }
        let after = before.apply_update(update, Utc::now())?;
        let changes = field_deltas(&before, &after);
        if changes.is_empty() {
            // Every supplied value matched the current state; rewriting the
            // file would be a no-op and must not bump the version.
            return Ok(before);
        }
        let saved = self.commit_node(&after)?;
        self.emit(EventKind::NodeUpdated {
            node: saved.clone(),
            changes,
        });
        if before.status != saved.status {
            self.emit(EventKind::NodeStatusChanged {
                node_id: saved.id.clone(),
                from: before.status,
                to: saved.status,
            });
        }
        if before.validity != saved.validity {
            self.emit(EventKind::NodeValidityChanged {
                node_id: saved.id.clone(),
                from: before.validity,
                to: saved.validity,
            });
        }
        Ok(saved)
    }

    /// Remove the file and the index rows; the deleted snapshot rides on
    /// the event.
    pub fn delete(&self, id: &str) -> Result<Node> {
        let _guard = self.writer.lock().expect("writer lock poisoned");
        let snapshot = self.store.load_node(id)?;
        if !self.store.delete_node(id)? {
            return Err(CubeError::NodeNotFound(id.to_string()));
        }
        if let Some(index) = &self.index {
            let guard = index.lock().expect("index lock poisoned");
            if let Err(err) = guard.remove(id) {
                tracing::warn!(node = %id, error = %err, "index removal failed; deferring reindex");
                self.deferred_reindex.store(true, AtomicOrdering::SeqCst);
            }
            self.refresh_fingerprint(&guard);
        }
        self.emit(EventKind::NodeDeleted {
            node: snapshot.clone(),
        });
        Ok(snapshot)
    }

    /// Add a typed edge from one node to another. The target must exist;
    /// a second edge with the same (from, type, to) triple is a conflict.
    pub fn link(
        &self,
        from: &str,
        edge_type: EdgeType,
        to: &str,
        metadata: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<Node> {
        let _guard = self.writer.lock().expect("writer lock poisoned");
        let node = self.store.load_node(from)?;
        if !self.store.node_exists(to) {
            return Err(CubeError::NodeNotFound(to.to_string()));
        }
        if node.find_edge(edge_type, to).is_some() {
            return Err(CubeError::EdgeExists(edge_id(from, edge_type, to)));
        }
        let spec = EdgeSpec {
            edge_type,
            to: to.to_string(),
            metadata: metadata.unwrap_or_default(),
        };
        let with = node.with_edge(&spec, Utc::now());
        let edge = with.edges.last().cloned().expect("edge just appended");
        let saved = self.commit_node(&with)?;
        self.emit(EventKind::EdgeCreated { edge });
        Ok(saved)
    }

    /// Remove the edge identified by its deterministic id.
    pub fn unlink(&self, from: &str, edge_type: EdgeType, to: &str) -> Result<Node> {
        let _guard = self.writer.lock().expect("writer lock poisoned");
        let node = self.store.load_node(from)?;
        let id = edge_id(from, edge_type, to);
        let edge = node
            .edges
            .iter()
            .find(|e| e.id() == id)
            .cloned()
            .ok_or_else(|| CubeError::EdgeNotFound(id.clone()))?;
        let without = node.without_edge(&id, Utc::now())?;
        let saved = self.commit_node(&without)?;
        self.emit(EventKind::EdgeDeleted { edge });
        Ok(saved)
    }

    /// Filtered query. Ids resolve through the index when enabled, with an
    /// in-memory fallback otherwise. Bodies are stripped when
    /// `include_content` is false. Ids whose files vanished are skipped.
    pub fn query(&self, opts: &QueryOptions, include_content: bool) -> Result<Vec<Node>> {
        let mut nodes = match &self.index {
            Some(index) => {
                let ids = index.lock().expect("index lock poisoned").query(opts)?;
                let mut loaded = Vec::with_capacity(ids.len());
                for id in ids {
                    match self.store.load_node(&id) {
                        Ok(node) => loaded.push(node),
                        Err(err) => {
                            tracing::debug!(node = %id, error = %err, "dropping indexed id without file")
                        }
                    }
                }
                loaded
            }
            None => {
                let ListOutcome { nodes, .. } = self.store.list_all()?;
                filter_in_memory(nodes, opts)
            }
        };
        if !include_content {
            for node in &mut nodes {
                node.content.clear();
            }
        }
        Ok(nodes)
    }

    pub fn query_ids(&self, opts: &QueryOptions) -> Result<Vec<String>> {
        match &self.index {
            Some(index) => index.lock().expect("index lock poisoned").query(opts),
            None => Ok(self
                .query(opts, false)?
                .into_iter()
                .map(|n| n.id)
                .collect()),
        }
    }

    /// Breadth-first traversal with a depth cap and visit-once semantics.
    pub fn traverse(&self, opts: &TraverseOptions) -> Result<Vec<TraversalStep>> {
        let start = self.store.load_node(&opts.start)?;
        let mut steps = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(start.id.clone());

        let mut frontier: VecDeque<(Node, u32, Vec<String>)> = VecDeque::new();
        let start_path = vec![start.id.clone()];
        if opts.include_start {
            steps.push(TraversalStep {
                node: start.clone(),
                depth: 0,
                path: start_path.clone(),
                via: None,
            });
        }
        frontier.push_back((start, 0, start_path));

        while let Some((node, depth, path)) = frontier.pop_front() {
            if depth >= opts.max_depth {
                continue;
            }
            for (target_id, edge) in self.neighbors(&node, opts)? {
                if !visited.insert(target_id.clone()) {
                    continue;
                }
                let Ok(next) = self.store.load_node(&target_id) else {
                    // Orphan reference: the edge points at a deleted node.
                    continue;
                };
                let mut next_path = path.clone();
                next_path.push(target_id);
                steps.push(TraversalStep {
                    node: next.clone(),
                    depth: depth + 1,
                    path: next_path.clone(),
                    via: Some(edge),
                });
                frontier.push_back((next, depth + 1, next_path));
            }
        }
        Ok(steps)
    }

    fn neighbors(&self, node: &Node, opts: &TraverseOptions) -> Result<Vec<(String, Edge)>> {
        let mut out = Vec::new();
        if matches!(opts.direction, Direction::Out | Direction::Both) {
            for edge in &node.edges {
                if opts.edge_types.is_empty() || opts.edge_types.contains(&edge.edge_type) {
                    out.push((edge.to.clone(), edge.clone()));
                }
            }
        }
        if matches!(opts.direction, Direction::In | Direction::Both) {
            for row in self.incoming(&node.id, &opts.edge_types)? {
                // Materialize the edge as held by its owning source node.
                let edge = Edge {
                    from: row.0.clone(),
                    to: node.id.clone(),
                    edge_type: row.1,
                    metadata: serde_json::Map::new(),
                    created_at: node.modified_at,
                };
                out.push((row.0, edge));
            }
        }
        Ok(out)
    }

    /// Ids of nodes holding an edge of one of the given types that points
    /// at `id` (any type when empty).
    pub fn predecessors(&self, id: &str, edge_types: &[EdgeType]) -> Result<Vec<String>> {
        Ok(self
            .incoming(id, edge_types)?
            .into_iter()
            .map(|(from, _)| from)
            .collect())
    }

    fn incoming(&self, id: &str, edge_types: &[EdgeType]) -> Result<Vec<(String, EdgeType)>> {
        match &self.index {
            Some(index) => Ok(index
                .lock()
                .expect("index lock poisoned")
                .edges_to(id, edge_types)?
                .into_iter()
                .map(|row| (row.from_node, row.edge_type))
                .collect()),
            None => {
                let ListOutcome { nodes, .. } = self.store.list_all()?;
                let mut found = Vec::new();
                for node in nodes {
                    for edge in &node.edges {
                        if edge.to == id
                            && (edge_types.is_empty() || edge_types.contains(&edge.edge_type))
                        {
                            found.push((node.id.clone(), edge.edge_type));
                        }
                    }
                }
                Ok(found)
            }
        }
    }

    pub fn stats(&self) -> Result<CubeStats> {
        match &self.index {
            Some(index) => {
                let guard = index.lock().expect("index lock poisoned");
                let (by_type, by_status) = guard.stats()?;
                Ok(CubeStats {
                    total: guard.count()?,
                    by_type,
                    by_status,
                })
            }
            None => {
                let ListOutcome { nodes, .. } = self.store.list_all()?;
                let mut stats = CubeStats {
                    total: nodes.len() as u64,
                    ..CubeStats::default()
                };
                for node in &nodes {
                    *stats
                        .by_type
                        .entry(node.node_type.as_str().to_string())
                        .or_insert(0) += 1;
                    *stats
                        .by_status
                        .entry(node.status.as_str().to_string())
                        .or_insert(0) += 1;
                }
                Ok(stats)
            }
        }
    }

    /// Clear the index and reindex every file. Returns the number indexed
    /// and the per-file errors encountered.
    pub fn rebuild_index(&self) -> Result<(usize, Vec<String>)> {
        self.rebuild_index_with(&CancelToken::default())
    }

    pub fn rebuild_index_with(&self, cancel: &CancelToken) -> Result<(usize, Vec<String>)> {
        let Some(index) = &self.index else {
            return Ok((0, Vec::new()));
        };
        let _guard = self.writer.lock().expect("writer lock poisoned");

        let mut nodes = Vec::new();
        let mut errors = Vec::new();
        for node_type in NodeType::ALL {
            if cancel.is_cancelled() {
                tracing::warn!("index rebuild cancelled");
                errors.push("rebuild cancelled".to_string());
                return Ok((0, errors));
            }
            let outcome = self.store.list_by_type(node_type)?;
            if outcome.skipped > 0 {
                errors.push(format!(
                    "{} unreadable file(s) under nodes/{}",
                    outcome.skipped, node_type
                ));
            }
            nodes.extend(outcome.nodes);
        }

        let guard = index.lock().expect("index lock poisoned");
        guard.rebuild(&nodes)?;
        self.refresh_fingerprint(&guard);
        self.deferred_reindex.store(false, AtomicOrdering::SeqCst);
        Ok((nodes.len(), errors))
    }

    /// Non-mutating consistency scan: reports orphan edge targets and
    /// duplicate edges (hand-edited files are tolerated, never silently
    /// repaired).
    pub fn validate(&self) -> Result<Vec<String>> {
        let ListOutcome { nodes, .. } = self.store.list_all()?;
        let ids: HashSet<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
        let mut issues = Vec::new();
        for node in &nodes {
            let mut seen = HashSet::new();
            for edge in &node.edges {
                if !ids.contains(edge.to.as_str()) {
                    issues.push(format!("{}: orphan edge target {}", node.id, edge.to));
                }
                if !seen.insert(edge.id()) {
                    issues.push(format!("{}: duplicate edge {}", node.id, edge.id()));
                }
            }
        }
        Ok(issues)
    }
}

fn delta(
    changes: &mut serde_json::Map<String, serde_json::Value>,
    field: &str,
    from: serde_json::Value,
    to: serde_json::Value,
) {
    if from != to {
        changes.insert(field.to_string(), serde_json::json!({"from": from, "to": to}));
    }
}

fn field_deltas(before: &Node, after: &Node) -> serde_json::Map<String, serde_json::Value> {
    use serde_json::json;
    let mut changes = serde_json::Map::new();
    delta(&mut changes, "title", json!(before.title), json!(after.title));
    delta(&mut changes, "content", json!(before.content), json!(after.content));
    delta(&mut changes, "status", json!(before.status), json!(after.status));
    delta(&mut changes, "validity", json!(before.validity), json!(after.validity));
    delta(&mut changes, "priority", json!(before.priority), json!(after.priority));
    delta(
        &mut changes,
        "confidence",
        json!(before.confidence),
        json!(after.confidence),
    );
    delta(&mut changes, "tags", json!(before.tags), json!(after.tags));
    delta(
        &mut changes,
        "assigned_to",
        json!(before.assigned_to),
        json!(after.assigned_to),
    );
    delta(
        &mut changes,
        "locked_by",
        json!(before.locked_by),
        json!(after.locked_by),
    );
    delta(&mut changes, "due_at", json!(before.due_at), json!(after.due_at));
    delta(
        &mut changes,
        "superseded_by",
        json!(before.ordering.superseded_by),
        json!(after.ordering.superseded_by),
    );
    changes
}

/// Fallback filtering when the index is disabled: same semantics as the
/// planned query, over decoded files.
fn filter_in_memory(nodes: Vec<Node>, opts: &QueryOptions) -> Vec<Node> {
    let reverse: HashMap<String, Vec<EdgeType>> = {
        let mut map: HashMap<String, Vec<EdgeType>> = HashMap::new();
        if matches!(
            opts.has_edge,
            Some(crate::store::index::EdgeFilter {
                direction: EdgeDirection::In,
                ..
            })
        ) {
            for node in &nodes {
                for edge in &node.edges {
                    map.entry(edge.to.clone()).or_default().push(edge.edge_type);
                }
            }
        }
        map
    };

    let mut matched: Vec<Node> = nodes
        .into_iter()
        .filter(|n| matches_filters(n, opts, &reverse))
        .collect();

    if let Some(field) = opts.sort {
        matched.sort_by(|a, b| {
            let ord = match field {
                SortField::Title => a.title.cmp(&b.title),
                SortField::Priority => a.priority.rank().cmp(&b.priority.rank()),
                SortField::CreatedAt => a.created_at.cmp(&b.created_at),
                SortField::ModifiedAt => a.modified_at.cmp(&b.modified_at),
                SortField::DueAt => a.due_at.cmp(&b.due_at),
                SortField::Confidence => {
                    a.confidence.partial_cmp(&b.confidence).unwrap_or(std::cmp::Ordering::Equal)
                }
            };
            match opts.direction {
                SortDirection::Ascending => ord,
                SortDirection::Descending => ord.reverse(),
            }
        });
    }

    let offset = opts.offset.unwrap_or(0) as usize;
    let matched: Vec<Node> = matched.into_iter().skip(offset).collect();
    match opts.limit {
        Some(limit) => matched.into_iter().take(limit as usize).collect(),
        None => matched,
    }
}

fn matches_filters(
    node: &Node,
    opts: &QueryOptions,
    reverse: &HashMap<String, Vec<EdgeType>>,
) -> bool {
    let type_ok = opts.node_type.is_empty() || opts.node_type.contains(&node.node_type);
    let status_ok = opts.status.is_empty() || opts.status.contains(&node.status);
    let validity_ok = opts.validity.is_empty() || opts.validity.contains(&node.validity);
    let priority_ok = opts.priority.is_empty() || opts.priority.contains(&node.priority);
    if !(type_ok && status_ok && validity_ok && priority_ok) {
        return false;
    }
    if !opts.tags.iter().all(|t| node.tags.contains(t)) {
        return false;
    }
    if !opts.tags_any.is_empty() && !opts.tags_any.iter().any(|t| node.tags.contains(t)) {
        return false;
    }
    match &opts.assigned_to {
        Some(Some(agent)) if node.assigned_to.as_deref() != Some(agent.as_str()) => return false,
        Some(None) if node.assigned_to.is_some() => return false,
        _ => {}
    }
    if let Some(creator) = &opts.created_by {
        if node.created_by.as_deref() != Some(creator.as_str()) {
            return false;
        }
    }
    if let Some(filter) = &opts.has_edge {
        let hit = match filter.direction {
            EdgeDirection::Out => node.edges.iter().any(|e| e.edge_type == filter.edge_type),
            EdgeDirection::In => reverse
                .get(&node.id)
                .is_some_and(|types| types.contains(&filter.edge_type)),
        };
        if !hit {
            return false;
        }
    }
    if let Some(bound) = opts.created_after {
        if node.created_at < bound {
            return false;
        }
    }
    if let Some(bound) = opts.created_before {
        if node.created_at > bound {
            return false;
        }
    }
    if let Some(bound) = opts.modified_after {
        if node.modified_at < bound {
            return false;
        }
    }
    if let Some(bound) = opts.modified_before {
        if node.modified_at > bound {
            return false;
        }
    }
    if let Some(bound) = opts.due_before {
        if node.due_at.map(|d| d > bound).unwrap_or(true) {
            return false;
        }
    }
    if let Some(bound) = opts.due_after {
        if node.due_at.map(|d| d < bound).unwrap_or(true) {
            return false;
        }
    }
    if let Some(term) = &opts.search {
        let needle = term.to_lowercase();
        let hit = node.title.to_lowercase().contains(&needle)
            || node.content_preview.to_lowercase().contains(&needle);
        if !hit {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Status;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    fn open(dir: &Path) -> Graph {
        Graph::init_with_bus(
            dir,
            GraphOptions::default(),
            Some(Arc::new(EventBus::new())),
        )
        .unwrap()
    }

    fn new_task(title: &str) -> NewNode {
        let mut input = NewNode::new(NodeType::Task, title);
        input.content = Some(format!("{title} body"));
        input
    }

    #[test]
    fn create_persists_file_and_index_row() {
        let dir = tempdir().unwrap();
        let graph = open(dir.path());

        let node = graph.create(new_task("First")).unwrap();
        assert!(dir.path().join(node.file_path.as_deref().unwrap()).exists());
        assert_eq!(graph.get(&node.id).unwrap().title, "First");
        assert_eq!(graph.query_ids(&QueryOptions::default()).unwrap(), vec![node.id]);
    }

    #[test]
    fn create_emits_node_created() {
        let dir = tempdir().unwrap();
        let bus = Arc::new(EventBus::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        bus.subscribe("node.created", move |_| {
            h.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        });
        let graph =
            Graph::init_with_bus(dir.path(), GraphOptions::default(), Some(bus)).unwrap();

        graph.create(new_task("Evented")).unwrap();
        assert_eq!(hits.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn update_emits_deltas_and_status_change() {
        let dir = tempdir().unwrap();
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        bus.subscribe("*", move |e| {
            s.lock().unwrap().push((e.event_type(), e.clone()));
            Ok(())
        });
        let graph =
            Graph::init_with_bus(dir.path(), GraphOptions::default(), Some(bus)).unwrap();

        let node = graph.create(new_task("Moves")).unwrap();
        let updated = graph
            .update(
                &node.id,
                &NodeUpdate {
                    status: Some(Status::Active),
                    content: Some("fresh".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.version, 2);

        let events = seen.lock().unwrap();
        let types: Vec<&str> = events.iter().map(|(t, _)| *t).collect();
        assert!(types.contains(&"node.updated"));
        assert!(types.contains(&"node.status_changed"));
        let (_, updated_event) = events
            .iter()
            .find(|(t, _)| *t == "node.updated")
            .unwrap();
        if let EventKind::NodeUpdated { changes, .. } = &updated_event.kind {
            assert!(changes.contains_key("status"));
            assert!(changes.contains_key("content"));
            assert!(!changes.contains_key("title"));
        } else {
            panic!("wrong kind");
        }
    }

    #[test]
    fn empty_update_is_a_no_op() {
        let dir = tempdir().unwrap();
        let graph = open(dir.path());
        let node = graph.create(new_task("Still")).unwrap();
        let same = graph.update(&node.id, &NodeUpdate::default()).unwrap();
        assert_eq!(same.version, 1);
    }

    #[test]
    fn update_with_identical_values_does_not_bump_version() {
        let dir = tempdir().unwrap();
        let graph = open(dir.path());
        let node = graph.create(new_task("Same")).unwrap();
        let same = graph
            .update(
                &node.id,
                &NodeUpdate {
                    status: Some(Status::Pending),
                    content: Some(node.content.clone()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(same.version, 1);
        assert_eq!(same.modified_at, node.modified_at);
    }

    #[test]
    fn delete_removes_file_and_index_rows() {
        let dir = tempdir().unwrap();
        let graph = open(dir.path());
        let node = graph.create(new_task("Doomed")).unwrap();
        let rel = node.file_path.clone().unwrap();

        let snapshot = graph.delete(&node.id).unwrap();
        assert_eq!(snapshot.id, node.id);
        assert!(!dir.path().join(rel).exists());
        assert!(graph.get(&node.id).is_err());
        assert!(graph.query_ids(&QueryOptions::default()).unwrap().is_empty());
    }

    #[test]
    fn link_rejects_missing_target_and_duplicates() {
        let dir = tempdir().unwrap();
        let graph = open(dir.path());
        let a = graph.create(new_task("A")).unwrap();
        let b = graph.create(new_task("B")).unwrap();

        let err = graph
            .link(&a.id, EdgeType::DependsOn, "task/ghost-000000", None)
            .unwrap_err();
        assert_eq!(err.code(), "node_not_found");

        graph.link(&a.id, EdgeType::DependsOn, &b.id, None).unwrap();
        let err = graph.link(&a.id, EdgeType::DependsOn, &b.id, None).unwrap_err();
        assert_eq!(err.code(), "edge_exists");
    }

    #[test]
    fn link_then_unlink_restores_prior_edge_set() {
        let dir = tempdir().unwrap();
        let graph = open(dir.path());
        let a = graph.create(new_task("A")).unwrap();
        let b = graph.create(new_task("B")).unwrap();

        graph.link(&a.id, EdgeType::Blocks, &b.id, None).unwrap();
        let after = graph.unlink(&a.id, EdgeType::Blocks, &b.id).unwrap();
        assert!(after.edges.is_empty());

        let opts = QueryOptions {
            has_edge: Some(crate::store::index::EdgeFilter {
                edge_type: EdgeType::Blocks,
                direction: EdgeDirection::Out,
            }),
            ..QueryOptions::default()
        };
        assert!(graph.query_ids(&opts).unwrap().is_empty());

        let err = graph.unlink(&a.id, EdgeType::Blocks, &b.id).unwrap_err();
        assert_eq!(err.code(), "edge_not_found");
    }

    #[test]
    fn query_strips_content_when_asked() {
        let dir = tempdir().unwrap();
        let graph = open(dir.path());
        graph.create(new_task("Heavy")).unwrap();

        let with = graph.query(&QueryOptions::default(), true).unwrap();
        assert!(!with[0].content.is_empty());
        let without = graph.query(&QueryOptions::default(), false).unwrap();
        assert!(without[0].content.is_empty());
        assert!(!without[0].content_preview.is_empty());
    }

    #[test]
    fn traverse_out_edges_with_depth_and_paths() {
        let dir = tempdir().unwrap();
        let graph = open(dir.path());
        let a = graph.create(new_task("A")).unwrap();
        let b = graph.create(new_task("B")).unwrap();
        let c = graph.create(new_task("C")).unwrap();
        graph.link(&a.id, EdgeType::DependsOn, &b.id, None).unwrap();
        graph.link(&b.id, EdgeType::DependsOn, &c.id, None).unwrap();

        let steps = graph.traverse(&TraverseOptions::new(&a.id)).unwrap();
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0].depth, 0);
        assert!(steps[0].via.is_none());
        assert_eq!(steps[2].depth, 2);
        assert_eq!(steps[2].path, vec![a.id.clone(), b.id.clone(), c.id.clone()]);
        assert_eq!(
            steps[2].via.as_ref().unwrap().edge_type,
            EdgeType::DependsOn
        );

        let mut shallow = TraverseOptions::new(&a.id);
        shallow.max_depth = 1;
        assert_eq!(graph.traverse(&shallow).unwrap().len(), 2);

        let mut bare = TraverseOptions::new(&a.id);
        bare.include_start = false;
        assert_eq!(graph.traverse(&bare).unwrap().len(), 2);
    }

    #[test]
    fn traverse_in_direction_uses_index() {
        let dir = tempdir().unwrap();
        let graph = open(dir.path());
        let a = graph.create(new_task("A")).unwrap();
        let b = graph.create(new_task("B")).unwrap();
        graph.link(&a.id, EdgeType::Documents, &b.id, None).unwrap();

        let mut opts = TraverseOptions::new(&b.id);
        opts.direction = Direction::In;
        let steps = graph.traverse(&opts).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1].node.id, a.id);
        assert_eq!(steps[1].via.as_ref().unwrap().from, a.id);
    }

    #[test]
    fn traverse_visits_each_node_once_in_cycles() {
        let dir = tempdir().unwrap();
        let graph = open(dir.path());
        let a = graph.create(new_task("A")).unwrap();
        let b = graph.create(new_task("B")).unwrap();
        graph.link(&a.id, EdgeType::RelatesTo, &b.id, None).unwrap();
        graph.link(&b.id, EdgeType::RelatesTo, &a.id, None).unwrap();

        let steps = graph.traverse(&TraverseOptions::new(&a.id)).unwrap();
        assert_eq!(steps.len(), 2);
    }

    #[test]
    fn deleting_edge_target_leaves_orphan_filtered_from_traversal() {
        let dir = tempdir().unwrap();
        let graph = open(dir.path());
        let a = graph.create(new_task("A")).unwrap();
        let b = graph.create(new_task("B")).unwrap();
        graph.link(&a.id, EdgeType::DependsOn, &b.id, None).unwrap();
        graph.delete(&b.id).unwrap();

        // The edge row on A survives (edges are owned by the source file).
        let opts = QueryOptions {
            has_edge: Some(crate::store::index::EdgeFilter {
                edge_type: EdgeType::DependsOn,
                direction: EdgeDirection::Out,
            }),
            ..QueryOptions::default()
        };
        assert_eq!(graph.query_ids(&opts).unwrap(), vec![a.id.clone()]);

        let mut traverse = TraverseOptions::new(&a.id);
        traverse.edge_types = vec![EdgeType::DependsOn];
        let steps = graph.traverse(&traverse).unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].node.id, a.id);

        assert!(!graph.validate().unwrap().is_empty());
    }

    #[test]
    fn stats_counts_types_and_statuses() {
        let dir = tempdir().unwrap();
        let graph = open(dir.path());
        graph.create(new_task("T1")).unwrap();
        graph.create(new_task("T2")).unwrap();
        graph
            .create(NewNode::new(NodeType::Doc, "D1"))
            .unwrap();

        let stats = graph.stats().unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_type["task"], 2);
        assert_eq!(stats.by_type["doc"], 1);
        assert_eq!(stats.by_status["pending"], 3);
    }

    #[test]
    fn rebuild_index_reconciles_external_edits() {
        let dir = tempdir().unwrap();
        let graph = open(dir.path());
        let node = graph.create(new_task("External")).unwrap();

        // Simulate a hand edit behind the index's back.
        let path = dir.path().join(node.file_path.as_deref().unwrap());
        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, text.replace("status: pending", "status: active")).unwrap();

        let (count, errors) = graph.rebuild_index().unwrap();
        assert_eq!(count, 1);
        assert!(errors.is_empty());

        let opts = QueryOptions {
            status: vec![Status::Active],
            ..QueryOptions::default()
        };
        assert_eq!(graph.query_ids(&opts).unwrap(), vec![node.id]);
    }

    #[test]
    fn rebuild_honors_cancellation() {
        let dir = tempdir().unwrap();
        let graph = open(dir.path());
        graph.create(new_task("One")).unwrap();

        let cancel = CancelToken::default();
        cancel.cancel();
        let (count, errors) = graph.rebuild_index_with(&cancel).unwrap();
        assert_eq!(count, 0);
        assert_eq!(errors, vec!["rebuild cancelled".to_string()]);
    }

    #[test]
    fn reopen_rebuilds_when_files_changed_outside() {
        let dir = tempdir().unwrap();
        let id;
        {
            let graph = open(dir.path());
            id = graph.create(new_task("Persisted")).unwrap().id;
        }
        // Delete the node file while no engine is running.
        let store = FileStore::new(dir.path());
        store.delete_node(&id).unwrap();

        let reopened = open(dir.path());
        assert!(reopened.query_ids(&QueryOptions::default()).unwrap().is_empty());
    }

    #[test]
    fn second_writer_fails_loudly() {
        let dir = tempdir().unwrap();
        let _first = open(dir.path());
        let err = Graph::init_with_bus(
            dir.path(),
            GraphOptions::default(),
            Some(Arc::new(EventBus::new())),
        )
        .unwrap_err();
        assert_eq!(err.code(), "locked");
    }

    #[test]
    fn index_disabled_falls_back_to_in_memory_queries() {
        let dir = tempdir().unwrap();
        let graph = Graph::init_with_bus(
            dir.path(),
            GraphOptions {
                index_enabled: false,
                ..GraphOptions::default()
            },
            Some(Arc::new(EventBus::new())),
        )
        .unwrap();

        let mut input = new_task("Fallback");
        input.tags = vec!["api".into()];
        let node = graph.create(input).unwrap();
        graph.create(new_task("Other")).unwrap();

        let opts = QueryOptions {
            tags: vec!["api".into()],
            ..QueryOptions::default()
        };
        let found = graph.query(&opts, true).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, node.id);

        let stats = graph.stats().unwrap();
        assert_eq!(stats.total, 2);
    }
}
