use std::fs;
use std::path::{Path, PathBuf};

use crate::codec;
use crate::config::CubeConfig;
use crate::error::{CubeError, Result};
use crate::model::{Node, NodeType};

pub const CONFIG_FILE: &str = "cube.json";
pub const NODES_DIR: &str = "nodes";

/// Outcome of a directory scan: parsed nodes plus a count of files that
/// could not be read or decoded (surfaced for diagnostics, never fatal).
#[derive(Debug, Default)]
pub struct ListOutcome {
    pub nodes: Vec<Node>,
    pub skipped: usize,
}

/// Owns the on-disk layout under the workspace root.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open a workspace directory. Does not touch the filesystem; callers
    /// check `is_initialized` or run `init`.
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_initialized(&self) -> bool {
        self.root.join(CONFIG_FILE).exists()
    }

    /// Create the workspace layout. Directory creation is idempotent;
    /// `cube.json` is written only when absent and never overwritten.
    pub fn init(&self, name: &str) -> Result<CubeConfig> {
        fs::create_dir_all(self.nodes_dir())?;
        fs::create_dir_all(self.root.join("views"))?;
        fs::create_dir_all(self.root.join("agents"))?;
        fs::create_dir_all(self.root.join("schemas"))?;
        fs::create_dir_all(self.agent_state_dir())?;

        let config_path = self.root.join(CONFIG_FILE);
        if config_path.exists() {
            return self.config();
        }
        let config = CubeConfig::new(name, self.root.display().to_string());
        fs::write(&config_path, serde_json::to_string_pretty(&config)?)?;
        Ok(config)
    }

    pub fn config(&self) -> Result<CubeConfig> {
        let path = self.root.join(CONFIG_FILE);
        if !path.exists() {
            return Err(CubeError::NotInitialized);
        }
        let data = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    pub fn nodes_dir(&self) -> PathBuf {
        self.root.join(NODES_DIR)
    }

    pub fn agent_state_dir(&self) -> PathBuf {
        self.root.join("agent-state")
    }

    pub fn agents_file(&self) -> PathBuf {
        self.root.join("agents.json")
    }

    pub fn events_log_path(&self) -> PathBuf {
        self.root.join("events.log")
    }

    pub fn index_path(&self) -> PathBuf {
        self.root.join("index.sqlite")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(".cube.lock")
    }

    /// Workspace-relative path for a node id, e.g.
    /// `nodes/task/implement-auth-3f2a1b.md`.
    pub fn node_rel_path(&self, id: &str) -> Result<String> {
        let (type_part, slug_part) = id
            .split_once('/')
            .ok_or_else(|| CubeError::InvalidInput(format!("invalid node id '{id}'")))?;
        type_part
            .parse::<NodeType>()
            .map_err(|_| CubeError::InvalidInput(format!("invalid node id '{id}'")))?;
        let valid_slug = !slug_part.is_empty()
            && slug_part
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
        if !valid_slug {
            return Err(CubeError::InvalidInput(format!("invalid node id '{id}'")));
        }
        Ok(format!("{NODES_DIR}/{type_part}/{slug_part}.md"))
    }

    fn node_abs_path(&self, id: &str) -> Result<PathBuf> {
        Ok(self.root.join(self.node_rel_path(id)?))
    }

    /// Persist a node file atomically (temp write + rename), creating the
    /// per-type directory on demand. Returns the node with `file_path` set.
    pub fn save_node(&self, node: &Node) -> Result<Node> {
        let rel = self.node_rel_path(&node.id)?;
        let path = self.root.join(&rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let text = codec::encode(node);
        let tmp = path.with_extension("md.tmp");
        fs::write(&tmp, &text)?;
        fs::rename(&tmp, &path)?;

        let mut saved = node.clone();
        saved.file_path = Some(rel);
        Ok(saved)
    }

    pub fn load_node(&self, id: &str) -> Result<Node> {
        let rel = self.node_rel_path(id)?;
        let path = self.root.join(&rel);
        if !path.exists() {
            return Err(CubeError::NodeNotFound(id.to_string()));
        }
        let text = fs::read_to_string(&path)?;
        codec::decode(&text, &rel)
    }

    /// Delete a node file. Returns false when the file was already absent.
    pub fn delete_node(&self, id: &str) -> Result<bool> {
        let path = self.node_abs_path(id)?;
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(path)?;
        Ok(true)
    }

    pub fn node_exists(&self, id: &str) -> bool {
        self.node_abs_path(id).map(|p| p.exists()).unwrap_or(false)
    }

    pub fn list_by_type(&self, node_type: NodeType) -> Result<ListOutcome> {
        let dir = self.nodes_dir().join(node_type.as_str());
        let mut outcome = ListOutcome::default();
        if !dir.is_dir() {
            return Ok(outcome);
        }
        self.scan_dir(&dir, node_type, &mut outcome)?;
        Ok(outcome)
    }

    pub fn list_all(&self) -> Result<ListOutcome> {
        let mut outcome = ListOutcome::default();
        for node_type in NodeType::ALL {
            let dir = self.nodes_dir().join(node_type.as_str());
            if dir.is_dir() {
                self.scan_dir(&dir, node_type, &mut outcome)?;
            }
        }
        Ok(outcome)
    }

    fn scan_dir(&self, dir: &Path, node_type: NodeType, outcome: &mut ListOutcome) -> Result<()> {
        let mut names: Vec<String> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(".md") {
                names.push(name);
            }
        }
        names.sort();
        for name in names {
            let rel = format!("{NODES_DIR}/{}/{name}", node_type.as_str());
            match fs::read_to_string(dir.join(&name))
                .map_err(CubeError::from)
                .and_then(|text| codec::decode(&text, &rel))
            {
                Ok(node) => outcome.nodes.push(node),
                Err(err) => {
                    tracing::warn!(file = %rel, error = %err, "skipping unreadable node file");
                    outcome.skipped += 1;
                }
            }
        }
        Ok(())
    }

    /// Stat-based fingerprint over node files (path, size, mtime). Cheap,
    /// and detects additions, deletions and in-place edits without reading
    /// file contents.
    pub fn fingerprint(&self) -> Result<String> {
        let mut entries = Vec::new();
        let nodes = self.nodes_dir();
        if nodes.is_dir() {
            for type_entry in fs::read_dir(&nodes)? {
                let type_dir = type_entry?.path();
                if !type_dir.is_dir() {
                    continue;
                }
                for entry in fs::read_dir(&type_dir)? {
                    let entry = entry?;
                    let name = entry.file_name().to_string_lossy().to_string();
                    if !name.ends_with(".md") {
                        continue;
                    }
                    let meta = entry.metadata()?;
                    let mtime = meta
                        .modified()?
                        .duration_since(std::time::UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_nanos();
                    entries.push((entry.path().display().to_string(), meta.len(), mtime));
                }
            }
        }
        entries.sort();
        let fp = entries
            .iter()
            .map(|(path, size, mtime)| format!("{path}:{size}:{mtime}"))
            .collect::<Vec<_>>()
            .join(",");
        Ok(fp)
    }
}
