//! Repository snapshot tree.
//!
//! One node per directory, recording how far the full transfer got. A node is
//! Completed once it finished listing, has no files in flight and all of its
//! children are Completed; at that point it drops its children and its parent
//! link, and the parent re-checks itself. Completion therefore cascades upward
//! and a finished subtree shrinks to a single leaf.
//!
//! ```text
//!   root (Exploring)
//!    ├── org (DoneExploring, 2 files in flight)
//!    │    └── acme (Completed, no children)
//!    └── com (Exploring)
//! ```
//!
//! Each node has its own lock. Locks are only ever taken parent-to-child
//! during a walk and never held while locking a parent, so unrelated subtrees
//! progress independently.

use crate::error::{Result, TransferError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

/// Default number of nodes memoized by path
pub const DEFAULT_LRU_CAPACITY: usize = 50;

/// Relative path of a repository's root directory
pub const ROOT_PATH: &str = ".";

const SNAPSHOT_VERSION: u32 = 1;

/// Exploration state of a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Exploring,
    DoneExploring,
    Completed,
}

#[derive(Debug)]
struct NodeState {
    parent: Weak<NodeShared>,
    children: HashMap<String, SnapshotNode>,
    file_count: u64,
    status: NodeStatus,
}

#[derive(Debug)]
struct NodeShared {
    name: String,
    state: Mutex<NodeState>,
}

/// Handle to one directory node. Cloning shares the node.
#[derive(Debug, Clone)]
pub struct SnapshotNode(Arc<NodeShared>);

impl SnapshotNode {
    fn new(name: &str, parent: Weak<NodeShared>, status: NodeStatus) -> Self {
        SnapshotNode(Arc::new(NodeShared {
            name: name.to_string(),
            state: Mutex::new(NodeState {
                parent,
                children: HashMap::new(),
                file_count: 0,
                status,
            }),
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn status(&self) -> NodeStatus {
        self.0.state.lock().status
    }

    pub fn is_completed(&self) -> bool {
        self.status() == NodeStatus::Completed
    }

    pub fn file_count(&self) -> u64 {
        self.0.state.lock().file_count
    }

    pub fn child(&self, name: &str) -> Option<SnapshotNode> {
        self.0.state.lock().children.get(name).cloned()
    }

    pub fn children_count(&self) -> usize {
        self.0.state.lock().children.len()
    }

    /// Path from the root, built by walking parent links. Nodes that already
    /// collapsed have no parent and report only their own name.
    pub fn path(&self) -> String {
        let mut names = vec![self.0.name.clone()];
        let mut parent = self.0.state.lock().parent.upgrade();
        while let Some(node) = parent {
            names.push(node.name.clone());
            parent = node.state.lock().parent.upgrade();
        }
        if names.len() > 1 && names.last().map(String::as_str) == Some(ROOT_PATH) {
            names.pop();
        }
        if names.len() == 1 && names[0] == ROOT_PATH {
            return ROOT_PATH.to_string();
        }
        names.reverse();
        names.join("/")
    }

    pub fn increment_files(&self) {
        self.0.state.lock().file_count += 1;
    }

    pub fn decrement_files(&self) -> Result<()> {
        let mut state = self.0.state.lock();
        if state.file_count == 0 {
            return Err(TransferError::Snapshot(format!(
                "file count of '{}' is already zero",
                self.0.name
            )));
        }
        state.file_count -= 1;
        Ok(())
    }

    /// Listing of this directory is exhausted.
    pub fn mark_done_exploring(&self) {
        let mut state = self.0.state.lock();
        if state.status == NodeStatus::Exploring {
            state.status = NodeStatus::DoneExploring;
        }
    }

    /// Begin (re-)exploring this directory. Returns the children known so far,
    /// which the caller hands back to [`SnapshotNode::add_child`] so that
    /// subdirectories completed in an earlier run are not visited again.
    pub fn restart_exploring(&self) -> HashMap<String, SnapshotNode> {
        let mut state = self.0.state.lock();
        state.status = NodeStatus::Exploring;
        state.file_count = 0;
        std::mem::take(&mut state.children)
    }

    /// Register a subdirectory, reusing its previous node when there is one.
    pub fn add_child(
        &self,
        name: &str,
        previous: &mut HashMap<String, SnapshotNode>,
    ) -> SnapshotNode {
        let child = match previous.remove(name) {
            Some(existing) => {
                existing.0.state.lock().parent = Arc::downgrade(&self.0);
                existing
            }
            None => SnapshotNode::new(name, Arc::downgrade(&self.0), NodeStatus::Exploring),
        };
        self.0
            .state
            .lock()
            .children
            .insert(name.to_string(), child.clone());
        child
    }

    /// Collapse this node if it is finished, then let the parent re-check.
    /// Returns true if this node is Completed after the call.
    pub fn check_completed(&self) -> bool {
        let Some(parent) = self.try_collapse() else {
            return self.is_completed();
        };
        let mut next = parent.upgrade().map(SnapshotNode);
        while let Some(node) = next {
            next = node
                .try_collapse()
                .and_then(|parent| parent.upgrade())
                .map(SnapshotNode);
        }
        true
    }

    /// Completes the node if possible. Returns the former parent link when the
    /// node transitioned just now.
    fn try_collapse(&self) -> Option<Weak<NodeShared>> {
        let children: Vec<SnapshotNode> = {
            let state = self.0.state.lock();
            if state.status != NodeStatus::DoneExploring || state.file_count > 0 {
                return None;
            }
            state.children.values().cloned().collect()
        };
        if !children.iter().all(SnapshotNode::is_completed) {
            return None;
        }

        let mut state = self.0.state.lock();
        // Re-check under the lock; another task may have raced us here.
        if state.status != NodeStatus::DoneExploring || state.file_count > 0 {
            return None;
        }
        if state.children.len() != children.len() {
            return None;
        }
        state.status = NodeStatus::Completed;
        state.children.clear();
        Some(std::mem::take(&mut state.parent))
    }

    fn to_persisted(&self) -> PersistedNode {
        let (status, children) = {
            let state = self.0.state.lock();
            let children: Vec<SnapshotNode> = state.children.values().cloned().collect();
            (state.status, children)
        };
        let mut children: Vec<PersistedNode> =
            children.iter().map(SnapshotNode::to_persisted).collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        PersistedNode {
            name: self.0.name.clone(),
            status,
            children,
        }
    }

    fn from_persisted(persisted: &PersistedNode, parent: Weak<NodeShared>) -> Self {
        let status = match persisted.status {
            NodeStatus::Completed => NodeStatus::Completed,
            _ => NodeStatus::Exploring,
        };
        let node = SnapshotNode::new(&persisted.name, parent, status);
        if status != NodeStatus::Completed {
            let children = persisted
                .children
                .iter()
                .map(|child| {
                    (
                        child.name.clone(),
                        SnapshotNode::from_persisted(child, Arc::downgrade(&node.0)),
                    )
                })
                .collect();
            node.0.state.lock().children = children;
        }
        node
    }
}

/// On-disk form of a node: no parent link, no file counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedNode {
    pub name: String,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<PersistedNode>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    version: u32,
    root: PersistedNode,
}

// =============================================================================
// LRU cache
// =============================================================================

/// Fixed-capacity cache evicting the least recently inserted or hit entry.
#[derive(Debug)]
pub struct LruCache<K, V> {
    capacity: usize,
    map: HashMap<K, V>,
    order: VecDeque<K>,
}

impl<K: Eq + Hash + Clone, V: Clone> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            map: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    pub fn get(&mut self, key: &K) -> Option<V> {
        let value = self.map.get(key)?.clone();
        self.touch(key);
        Some(value)
    }

    pub fn insert(&mut self, key: K, value: V) {
        if self.map.insert(key.clone(), value).is_some() {
            self.touch(&key);
            return;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.map.remove(&oldest);
            }
        }
        self.order.push_back(key);
    }

    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn touch(&mut self, key: &K) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            if let Some(k) = self.order.remove(pos) {
                self.order.push_back(k);
            }
        }
    }
}

// =============================================================================
// RepoSnapshot
// =============================================================================

/// Snapshot tree of one repository plus its path cache and backing file.
pub struct RepoSnapshot {
    root: SnapshotNode,
    cache: Mutex<LruCache<String, SnapshotNode>>,
    file: PathBuf,
    loaded: bool,
}

impl RepoSnapshot {
    pub fn new(file: PathBuf, lru_capacity: usize) -> Self {
        Self {
            root: SnapshotNode::new(ROOT_PATH, Weak::new(), NodeStatus::Exploring),
            cache: Mutex::new(LruCache::new(lru_capacity)),
            file,
            loaded: false,
        }
    }

    /// Load the snapshot saved by a previous run, or start an empty one.
    /// Nodes that were not Completed come back as Exploring.
    pub fn load_or_new(file: PathBuf, lru_capacity: usize) -> Result<Self> {
        if !file.exists() {
            return Ok(Self::new(file, lru_capacity));
        }
        let text = fs::read_to_string(&file).map_err(|source| TransferError::ReadFile {
            path: file.clone(),
            source,
        })?;
        let parsed: SnapshotFile = serde_json::from_str(&text)?;
        if parsed.version != SNAPSHOT_VERSION {
            return Err(TransferError::Snapshot(format!(
                "unsupported snapshot version {} in {}",
                parsed.version,
                file.display()
            )));
        }
        tracing::info!("Loaded repository snapshot from {}", file.display());
        Ok(Self {
            root: SnapshotNode::from_persisted(&parsed.root, Weak::new()),
            cache: Mutex::new(LruCache::new(lru_capacity)),
            file,
            loaded: true,
        })
    }

    /// True if this tree came from a previous run.
    pub fn was_loaded(&self) -> bool {
        self.loaded
    }

    pub fn root(&self) -> SnapshotNode {
        self.root.clone()
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    /// Node for `relative_path` (`.` for the root), creating missing
    /// directories along the way. A path below a Completed directory resolves
    /// to that directory.
    pub fn lookup_or_create(&self, relative_path: &str) -> Result<SnapshotNode> {
        if relative_path.is_empty() {
            return Err(TransferError::Snapshot(
                "cannot look up an empty path".to_string(),
            ));
        }
        if relative_path == ROOT_PATH {
            return Ok(self.root.clone());
        }
        if let Some(node) = self.cache.lock().get(&relative_path.to_string()) {
            return Ok(node);
        }

        let mut current = self.root.clone();
        for segment in relative_path.split('/').filter(|s| !s.is_empty() && *s != ".") {
            let next = {
                let mut state = current.0.state.lock();
                if state.status == NodeStatus::Completed {
                    None
                } else {
                    let parent = Arc::downgrade(&current.0);
                    Some(
                        state
                            .children
                            .entry(segment.to_string())
                            .or_insert_with(|| {
                                SnapshotNode::new(segment, parent, NodeStatus::Exploring)
                            })
                            .clone(),
                    )
                }
            };
            match next {
                Some(node) => current = node,
                None => break,
            }
        }

        self.cache
            .lock()
            .insert(relative_path.to_string(), current.clone());
        Ok(current)
    }

    #[cfg(test)]
    fn is_cached(&self, relative_path: &str) -> bool {
        self.cache.lock().contains(&relative_path.to_string())
    }

    /// Write the tree atomically next to its final location.
    pub fn persist(&self) -> Result<()> {
        let snapshot = SnapshotFile {
            version: SNAPSHOT_VERSION,
            root: self.root.to_persisted(),
        };
        if let Some(parent) = self.file.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp_file = self.file.with_extension("tmp");
        fs::write(&temp_file, serde_json::to_vec(&snapshot)?).map_err(|source| {
            TransferError::WriteFile {
                path: temp_file.clone(),
                source,
            }
        })?;
        fs::rename(&temp_file, &self.file)?;
        tracing::debug!("Saved repository snapshot to {}", self.file.display());
        Ok(())
    }

    /// Delete the backing file once the repository is fully transferred.
    pub fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.file) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
