use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use crate::error::Result;
use crate::model::{EdgeType, Node, NodeType, Priority, Status, Validity};

/// Direction of an edge predicate relative to the candidate node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeDirection {
    Out,
    In,
}

#[derive(Debug, Clone)]
pub struct EdgeFilter {
    pub edge_type: EdgeType,
    pub direction: EdgeDirection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    Title,
    Priority,
    CreatedAt,
    ModifiedAt,
    DueAt,
    Confidence,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

/// Filter/sort/pagination options for `Index::query`.
#[derive(Debug, Default, Clone)]
pub struct QueryOptions {
    pub node_type: Vec<NodeType>,
    pub status: Vec<Status>,
    pub validity: Vec<Validity>,
    pub priority: Vec<Priority>,
    /// All of these tags must be present.
    pub tags: Vec<String>,
    /// At least one of these tags must be present.
    pub tags_any: Vec<String>,
    /// `Some(None)` filters for unassigned nodes.
    pub assigned_to: Option<Option<String>>,
    pub created_by: Option<String>,
    pub has_edge: Option<EdgeFilter>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub modified_after: Option<DateTime<Utc>>,
    pub modified_before: Option<DateTime<Utc>>,
    pub due_before: Option<DateTime<Utc>>,
    pub due_after: Option<DateTime<Utc>>,
    /// Case-insensitive substring match over title and preview.
    pub search: Option<String>,
    pub sort: Option<SortField>,
    pub direction: SortDirection,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// An edge row as mirrored in the index; used for reverse traversal.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeRow {
    pub from_node: String,
    pub to_node: String,
    pub edge_type: EdgeType,
}

/// Structured on-disk mirror of node files. Derived state only: on any
/// disagreement the files win and a rebuild reconciles.
pub struct Index {
    conn: Connection,
}

impl std::fmt::Debug for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index").finish_non_exhaustive()
    }
}

impl Index {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let idx = Self { conn };
        idx.create_tables()?;
        Ok(idx)
    }

    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let idx = Self { conn };
        idx.create_tables()?;
        Ok(idx)
    }

    fn create_tables(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS nodes (
                id TEXT PRIMARY KEY,
                type TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                validity TEXT NOT NULL DEFAULT 'current',
                priority TEXT NOT NULL DEFAULT 'normal',
                confidence REAL NOT NULL DEFAULT 1.0,
                created_by TEXT,
                assigned_to TEXT,
                locked_by TEXT,
                created_at TEXT NOT NULL,
                modified_at TEXT NOT NULL,
                due_at TEXT,
                title TEXT NOT NULL,
                content_preview TEXT NOT NULL DEFAULT '',
                semantic_hash TEXT NOT NULL,
                file_path TEXT,
                version INTEGER NOT NULL DEFAULT 1
            );
            CREATE TABLE IF NOT EXISTS edges (
                id TEXT PRIMARY KEY,
                from_node TEXT NOT NULL REFERENCES nodes(id) ON DELETE CASCADE,
                to_node TEXT NOT NULL,
                type TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS node_tags (
                node_id TEXT NOT NULL REFERENCES nodes(id) ON DELETE CASCADE,
                tag TEXT NOT NULL,
                PRIMARY KEY (node_id, tag)
            );
            CREATE INDEX IF NOT EXISTS idx_nodes_type ON nodes(type);
            CREATE INDEX IF NOT EXISTS idx_nodes_status ON nodes(status);
            CREATE INDEX IF NOT EXISTS idx_nodes_validity ON nodes(validity);
            CREATE INDEX IF NOT EXISTS idx_nodes_priority ON nodes(priority);
            CREATE INDEX IF NOT EXISTS idx_nodes_assigned ON nodes(assigned_to);
            CREATE INDEX IF NOT EXISTS idx_nodes_created ON nodes(created_at);
            CREATE INDEX IF NOT EXISTS idx_nodes_modified ON nodes(modified_at);
            CREATE INDEX IF NOT EXISTS idx_nodes_due ON nodes(due_at);
            CREATE INDEX IF NOT EXISTS idx_edges_type ON edges(type);
            CREATE INDEX IF NOT EXISTS idx_edges_from ON edges(from_node);
            CREATE INDEX IF NOT EXISTS idx_edges_to ON edges(to_node);
            CREATE INDEX IF NOT EXISTS idx_node_tags_tag ON node_tags(tag);
            CREATE TABLE IF NOT EXISTS metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    /// Mirror one node: upsert its row, then replace its source-side edges
    /// and tag rows. Atomic; a failure leaves the index unchanged.
    pub fn index_node(&self, node: &Node) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        Self::upsert_in_tx(&tx, node)?;
        tx.commit()?;
        Ok(())
    }

    fn upsert_in_tx(tx: &rusqlite::Transaction<'_>, node: &Node) -> Result<()> {
        // ON CONFLICT keeps the rowid stable so insertion order remains the
        // sort tie-break across updates.
        tx.execute(
            "INSERT INTO nodes (id, type, status, validity, priority, confidence,
                                created_by, assigned_to, locked_by,
                                created_at, modified_at, due_at,
                                title, content_preview, semantic_hash, file_path, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
             ON CONFLICT(id) DO UPDATE SET
                type = excluded.type,
                status = excluded.status,
                validity = excluded.validity,
                priority = excluded.priority,
                confidence = excluded.confidence,
                created_by = excluded.created_by,
                assigned_to = excluded.assigned_to,
                locked_by = excluded.locked_by,
                created_at = excluded.created_at,
                modified_at = excluded.modified_at,
                due_at = excluded.due_at,
                title = excluded.title,
                content_preview = excluded.content_preview,
                semantic_hash = excluded.semantic_hash,
                file_path = excluded.file_path,
                version = excluded.version",
            params![
                node.id,
                node.node_type.as_str(),
                node.status.as_str(),
                node.validity.as_str(),
                node.priority.as_str(),
                node.confidence,
                node.created_by,
                node.assigned_to,
                node.locked_by,
                node.created_at.to_rfc3339(),
                node.modified_at.to_rfc3339(),
                node.due_at.map(|d| d.to_rfc3339()),
                node.title,
                node.content_preview,
                node.ordering.semantic_hash,
                node.file_path,
                node.version as i64,
            ],
        )?;

        tx.execute("DELETE FROM edges WHERE from_node = ?1", params![node.id])?;
        for edge in &node.edges {
            tx.execute(
                "INSERT OR IGNORE INTO edges (id, from_node, to_node, type, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    edge.id(),
                    edge.from,
                    edge.to,
                    edge.edge_type.as_str(),
                    edge.created_at.to_rfc3339(),
                ],
            )?;
        }

        tx.execute("DELETE FROM node_tags WHERE node_id = ?1", params![node.id])?;
        for tag in &node.tags {
            tx.execute(
                "INSERT OR IGNORE INTO node_tags (node_id, tag) VALUES (?1, ?2)",
                params![node.id, tag],
            )?;
        }
        Ok(())
    }

    /// Remove a node row; edge and tag rows follow via cascade.
    pub fn remove(&self, id: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM nodes WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Drop everything and reinsert from the given nodes.
    pub fn rebuild(&self, nodes: &[Node]) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute_batch("DELETE FROM node_tags; DELETE FROM edges; DELETE FROM nodes;")?;
        for node in nodes {
            Self::upsert_in_tx(&tx, node)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn count(&self) -> Result<u64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM nodes", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    pub fn contains(&self, id: &str) -> Result<bool> {
        let exists: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM nodes WHERE id = ?1)",
            params![id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Edges pointing at the given node (reverse adjacency), optionally
    /// restricted to a set of edge types.
    pub fn edges_to(&self, id: &str, edge_types: &[EdgeType]) -> Result<Vec<EdgeRow>> {
        let mut sql =
            String::from("SELECT from_node, to_node, type FROM edges WHERE to_node = ?1");
        if !edge_types.is_empty() {
            sql.push_str(" AND type IN (");
            sql.push_str(&placeholders(2, edge_types.len()));
            sql.push(')');
        }
        sql.push_str(" ORDER BY rowid");

        let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(id.to_string())];
        for t in edge_types {
            values.push(Box::new(t.as_str().to_string()));
        }
        let bound: Vec<&dyn rusqlite::types::ToSql> = values.iter().map(|v| v.as_ref()).collect();

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(bound.as_slice(), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (from_node, to_node, type_str) = row?;
            if let Ok(edge_type) = type_str.parse::<EdgeType>() {
                out.push(EdgeRow {
                    from_node,
                    to_node,
                    edge_type,
                });
            }
        }
        Ok(out)
    }

    /// Node ids grouped by type and by status.
    pub fn stats(&self) -> Result<(HashMap<String, u64>, HashMap<String, u64>)> {
        let mut by_type = HashMap::new();
        let mut stmt = self
            .conn
            .prepare("SELECT type, COUNT(*) FROM nodes GROUP BY type")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (k, v) = row?;
            by_type.insert(k, v as u64);
        }

        let mut by_status = HashMap::new();
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM nodes GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (k, v) = row?;
            by_status.insert(k, v as u64);
        }
        Ok((by_type, by_status))
    }

    /// Planned query: joins for tag/edge predicates, `IN` sets for closed
    /// enums, string comparison for ISO dates, LIKE for search. Returns
    /// matching node ids.
    pub fn query(&self, opts: &QueryOptions) -> Result<Vec<String>> {
        let mut sql = String::from("SELECT DISTINCT n.id FROM nodes n");
        let mut predicates: Vec<String> = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        let mut param = 0usize;

        // One join per required tag, each pinned to that tag.
        for tag in &opts.tags {
            param += 1;
            sql.push_str(&format!(
                " JOIN node_tags t{param} ON t{param}.node_id = n.id AND t{param}.tag = ?{param}"
            ));
            values.push(Box::new(tag.clone()));
        }
        if !opts.tags_any.is_empty() {
            let start = param + 1;
            param += opts.tags_any.len();
            sql.push_str(&format!(
                " JOIN node_tags ta ON ta.node_id = n.id AND ta.tag IN ({})",
                placeholders(start, opts.tags_any.len())
            ));
            for tag in &opts.tags_any {
                values.push(Box::new(tag.clone()));
            }
        }
        if let Some(edge) = &opts.has_edge {
            param += 1;
            let column = match edge.direction {
                EdgeDirection::Out => "from_node",
                EdgeDirection::In => "to_node",
            };
            sql.push_str(&format!(
                " JOIN edges e ON e.{column} = n.id AND e.type = ?{param}"
            ));
            values.push(Box::new(edge.edge_type.as_str().to_string()));
        }

        enum_set(&mut predicates, &mut values, &mut param, "n.type", &opts.node_type, |v| {
            v.as_str()
        });
        enum_set(&mut predicates, &mut values, &mut param, "n.status", &opts.status, |v| {
            v.as_str()
        });
        enum_set(
            &mut predicates,
            &mut values,
            &mut param,
            "n.validity",
            &opts.validity,
            |v| v.as_str(),
        );
        enum_set(
            &mut predicates,
            &mut values,
            &mut param,
            "n.priority",
            &opts.priority,
            |v| v.as_str(),
        );

        match &opts.assigned_to {
            Some(Some(agent)) => {
                param += 1;
                predicates.push(format!("n.assigned_to = ?{param}"));
                values.push(Box::new(agent.clone()));
            }
            Some(None) => predicates.push("n.assigned_to IS NULL".to_string()),
            None => {}
        }
        if let Some(creator) = &opts.created_by {
            param += 1;
            predicates.push(format!("n.created_by = ?{param}"));
            values.push(Box::new(creator.clone()));
        }

        date_bound(&mut predicates, &mut values, &mut param, "n.created_at", ">=", opts.created_after);
        date_bound(&mut predicates, &mut values, &mut param, "n.created_at", "<=", opts.created_before);
        date_bound(&mut predicates, &mut values, &mut param, "n.modified_at", ">=", opts.modified_after);
        date_bound(&mut predicates, &mut values, &mut param, "n.modified_at", "<=", opts.modified_before);
        date_bound(&mut predicates, &mut values, &mut param, "n.due_at", "<=", opts.due_before);
        date_bound(&mut predicates, &mut values, &mut param, "n.due_at", ">=", opts.due_after);

        if let Some(term) = &opts.search {
            param += 1;
            predicates.push(format!(
                "(LOWER(n.title) LIKE ?{param} OR LOWER(n.content_preview) LIKE ?{param})"
            ));
            values.push(Box::new(format!("%{}%", term.to_lowercase())));
        }

        if !predicates.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&predicates.join(" AND "));
        }

        let dir = match opts.direction {
            SortDirection::Ascending => "ASC",
            SortDirection::Descending => "DESC",
        };
        let order = match opts.sort {
            Some(SortField::Title) => format!("n.title {dir}"),
            Some(SortField::Priority) => format!(
                "CASE n.priority WHEN 'critical' THEN 0 WHEN 'high' THEN 1 \
                 WHEN 'normal' THEN 2 ELSE 3 END {dir}"
            ),
            Some(SortField::CreatedAt) => format!("n.created_at {dir}"),
            Some(SortField::ModifiedAt) => format!("n.modified_at {dir}"),
            Some(SortField::DueAt) => format!("n.due_at {dir}"),
            Some(SortField::Confidence) => format!("n.confidence {dir}"),
            None => String::new(),
        };
        if order.is_empty() {
            sql.push_str(" ORDER BY n.rowid");
        } else {
            sql.push_str(&format!(" ORDER BY {order}, n.rowid"));
        }

        if let Some(limit) = opts.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
            if let Some(offset) = opts.offset {
                sql.push_str(&format!(" OFFSET {offset}"));
            }
        } else if let Some(offset) = opts.offset {
            sql.push_str(&format!(" LIMIT -1 OFFSET {offset}"));
        }

        let bound: Vec<&dyn rusqlite::types::ToSql> = values.iter().map(|v| v.as_ref()).collect();
        let mut stmt = self.conn.prepare(&sql)?;
        let ids = stmt
            .query_map(bound.as_slice(), |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    pub fn get_fingerprint(&self) -> Result<Option<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT value FROM metadata WHERE key = 'fingerprint'")?;
        match stmt.query_row([], |row| row.get::<_, String>(0)) {
            Ok(fp) => Ok(Some(fp)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn set_fingerprint(&self, fingerprint: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES ('fingerprint', ?1)",
            params![fingerprint],
        )?;
        Ok(())
    }
}

fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn enum_set<T: Copy>(
    predicates: &mut Vec<String>,
    values: &mut Vec<Box<dyn rusqlite::types::ToSql>>,
    param: &mut usize,
    column: &str,
    set: &[T],
    as_str: impl Fn(&T) -> &'static str,
) {
    if set.is_empty() {
        return;
    }
    if set.len() == 1 {
        *param += 1;
        predicates.push(format!("{column} = ?{param}"));
        values.push(Box::new(as_str(&set[0]).to_string()));
    } else {
        let start = *param + 1;
        *param += set.len();
        predicates.push(format!("{column} IN ({})", placeholders(start, set.len())));
        for item in set {
            values.push(Box::new(as_str(item).to_string()));
        }
    }
}

fn date_bound(
    predicates: &mut Vec<String>,
    values: &mut Vec<Box<dyn rusqlite::types::ToSql>>,
    param: &mut usize,
    column: &str,
    op: &str,
    bound: Option<DateTime<Utc>>,
) {
    if let Some(value) = bound {
        *param += 1;
        predicates.push(format!("{column} {op} ?{param}"));
        values.push(Box::new(value.to_rfc3339()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EdgeSpec, NewNode, Node};
    use chrono::TimeZone;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_740_000_000 + seconds, 0).unwrap()
    }

    fn make(title: &str, node_type: NodeType, seconds: i64) -> Node {
        let mut input = NewNode::new(node_type, title);
        input.content = Some(format!("{title} body"));
        Node::create_at(&input, at(seconds)).unwrap()
    }

    #[test]
    fn index_and_query_by_type_and_status() {
        let idx = Index::open_memory().unwrap();
        let task = make("A task", NodeType::Task, 0);
        let doc = make("A doc", NodeType::Doc, 1);
        idx.index_node(&task).unwrap();
        idx.index_node(&doc).unwrap();

        let opts = QueryOptions {
            node_type: vec![NodeType::Task],
            ..QueryOptions::default()
        };
        assert_eq!(idx.query(&opts).unwrap(), vec![task.id.clone()]);

        let opts = QueryOptions {
            status: vec![Status::Pending],
            ..QueryOptions::default()
        };
        assert_eq!(idx.query(&opts).unwrap().len(), 2);
    }

    #[test]
    fn tag_joins_require_all_tags() {
        let idx = Index::open_memory().unwrap();
        let mut a = make("A", NodeType::Task, 0);
        a.tags = vec!["api".into(), "auth".into()];
        let mut b = make("B", NodeType::Task, 1);
        b.tags = vec!["api".into()];
        idx.index_node(&a).unwrap();
        idx.index_node(&b).unwrap();

        let opts = QueryOptions {
            tags: vec!["api".into(), "auth".into()],
            ..QueryOptions::default()
        };
        assert_eq!(idx.query(&opts).unwrap(), vec![a.id.clone()]);

        let opts = QueryOptions {
            tags_any: vec!["auth".into(), "missing".into()],
            ..QueryOptions::default()
        };
        assert_eq!(idx.query(&opts).unwrap(), vec![a.id]);
    }

    #[test]
    fn edge_filter_by_direction() {
        let idx = Index::open_memory().unwrap();
        let b = make("Target", NodeType::Task, 0);
        let a = make("Source", NodeType::Task, 1).with_edge(
            &EdgeSpec {
                edge_type: EdgeType::DependsOn,
                to: b.id.clone(),
                metadata: serde_json::Map::new(),
            },
            at(2),
        );
        idx.index_node(&b).unwrap();
        idx.index_node(&a).unwrap();

        let opts = QueryOptions {
            has_edge: Some(EdgeFilter {
                edge_type: EdgeType::DependsOn,
                direction: EdgeDirection::Out,
            }),
            ..QueryOptions::default()
        };
        assert_eq!(idx.query(&opts).unwrap(), vec![a.id.clone()]);

        let opts = QueryOptions {
            has_edge: Some(EdgeFilter {
                edge_type: EdgeType::DependsOn,
                direction: EdgeDirection::In,
            }),
            ..QueryOptions::default()
        };
        assert_eq!(idx.query(&opts).unwrap(), vec![b.id.clone()]);

        assert_eq!(
            idx.edges_to(&b.id, &[]).unwrap(),
            vec![EdgeRow {
                from_node: a.id,
                to_node: b.id,
                edge_type: EdgeType::DependsOn,
            }]
        );
    }

    #[test]
    fn removing_node_cascades_edges_and_tags() {
        let idx = Index::open_memory().unwrap();
        let b = make("B", NodeType::Task, 0);
        let mut a = make("A", NodeType::Task, 1);
        a.tags = vec!["x".into()];
        let a = a.with_edge(
            &EdgeSpec {
                edge_type: EdgeType::Blocks,
                to: b.id.clone(),
                metadata: serde_json::Map::new(),
            },
            at(2),
        );
        idx.index_node(&b).unwrap();
        idx.index_node(&a).unwrap();

        idx.remove(&a.id).unwrap();
        let opts = QueryOptions {
            has_edge: Some(EdgeFilter {
                edge_type: EdgeType::Blocks,
                direction: EdgeDirection::In,
            }),
            ..QueryOptions::default()
        };
        assert!(idx.query(&opts).unwrap().is_empty());
        let opts = QueryOptions {
            tags: vec!["x".into()],
            ..QueryOptions::default()
        };
        assert!(idx.query(&opts).unwrap().is_empty());
    }

    #[test]
    fn priority_sort_uses_explicit_rank() {
        let idx = Index::open_memory().unwrap();
        let mut low = make("Low", NodeType::Task, 0);
        low.priority = Priority::Low;
        let mut critical = make("Critical", NodeType::Task, 1);
        critical.priority = Priority::Critical;
        let mut high = make("High", NodeType::Task, 2);
        high.priority = Priority::High;
        idx.index_node(&low).unwrap();
        idx.index_node(&critical).unwrap();
        idx.index_node(&high).unwrap();

        let opts = QueryOptions {
            sort: Some(SortField::Priority),
            ..QueryOptions::default()
        };
        assert_eq!(
            idx.query(&opts).unwrap(),
            vec![critical.id, high.id, low.id]
        );
    }

    #[test]
    fn insertion_order_is_the_tie_break_even_after_updates() {
        let idx = Index::open_memory().unwrap();
        let first = make("Same", NodeType::Task, 0);
        let second = make("Same again", NodeType::Task, 1);
        idx.index_node(&first).unwrap();
        idx.index_node(&second).unwrap();

        // Re-index the first node; its rowid (insertion order) must survive.
        let updated = first
            .apply_update(
                &crate::model::NodeUpdate {
                    status: Some(Status::Active),
                    ..Default::default()
                },
                at(10),
            )
            .unwrap();
        idx.index_node(&updated).unwrap();

        let ids = idx.query(&QueryOptions::default()).unwrap();
        assert_eq!(ids, vec![first.id, second.id]);
    }

    #[test]
    fn search_is_case_insensitive_substring() {
        let idx = Index::open_memory().unwrap();
        let hit = make("Implement OAuth", NodeType::Task, 0);
        let miss = make("Unrelated", NodeType::Task, 1);
        idx.index_node(&hit).unwrap();
        idx.index_node(&miss).unwrap();

        let opts = QueryOptions {
            search: Some("oauth".into()),
            ..QueryOptions::default()
        };
        assert_eq!(idx.query(&opts).unwrap(), vec![hit.id]);
    }

    #[test]
    fn pagination_applies_after_sort() {
        let idx = Index::open_memory().unwrap();
        for i in 0..5 {
            idx.index_node(&make(&format!("Node {i}"), NodeType::Task, i))
                .unwrap();
        }
        let opts = QueryOptions {
            sort: Some(SortField::Title),
            limit: Some(2),
            offset: Some(1),
            ..QueryOptions::default()
        };
        let ids = idx.query(&opts).unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids[0].contains("node-1"));
        assert!(ids[1].contains("node-2"));
    }

    #[test]
    fn date_filters_compare_iso_strings() {
        let idx = Index::open_memory().unwrap();
        let early = make("Early", NodeType::Task, 0);
        let late = make("Late", NodeType::Task, 3600);
        idx.index_node(&early).unwrap();
        idx.index_node(&late).unwrap();

        let opts = QueryOptions {
            created_after: Some(at(1800)),
            ..QueryOptions::default()
        };
        assert_eq!(idx.query(&opts).unwrap(), vec![late.id]);
    }

    #[test]
    fn rebuild_replaces_all_rows() {
        let idx = Index::open_memory().unwrap();
        let stale = make("Stale", NodeType::Task, 0);
        idx.index_node(&stale).unwrap();

        let fresh = make("Fresh", NodeType::Task, 1);
        idx.rebuild(std::slice::from_ref(&fresh)).unwrap();

        assert_eq!(idx.count().unwrap(), 1);
        assert!(idx.contains(&fresh.id).unwrap());
        assert!(!idx.contains(&stale.id).unwrap());
    }

    #[test]
    fn stats_group_by_type_and_status() {
        let idx = Index::open_memory().unwrap();
        idx.index_node(&make("A", NodeType::Task, 0)).unwrap();
        idx.index_node(&make("B", NodeType::Task, 1)).unwrap();
        idx.index_node(&make("C", NodeType::Doc, 2)).unwrap();

        let (by_type, by_status) = idx.stats().unwrap();
        assert_eq!(by_type["task"], 2);
        assert_eq!(by_type["doc"], 1);
        assert_eq!(by_status["pending"], 3);
    }

    #[test]
    fn fingerprint_metadata_round_trips() {
        let idx = Index::open_memory().unwrap();
        assert_eq!(idx.get_fingerprint().unwrap(), None);
        idx.set_fingerprint("abc:1:2").unwrap();
        assert_eq!(idx.get_fingerprint().unwrap().as_deref(), Some("abc:1:2"));
    }

    #[test]
    fn duplicate_edges_in_a_file_do_not_fail_indexing() {
        let idx = Index::open_memory().unwrap();
        let spec = EdgeSpec {
            edge_type: EdgeType::RelatesTo,
            to: "doc/readme-111111".into(),
            metadata: serde_json::Map::new(),
        };
        let node = make("Duped", NodeType::Task, 0)
            .with_edge(&spec, at(1))
            .with_edge(&spec, at(2));
        idx.index_node(&node).unwrap();
        assert!(idx.contains(&node.id).unwrap());
    }
}
