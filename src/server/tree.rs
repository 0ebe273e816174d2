//! In-memory data tree
//!
//! A flat map from absolute path to node. Writes advance the zxid; reads
//! are served at the current zxid. Not replicated: nodes of an in-process
//! ensemble share one tree.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use crate::protocol::{ErrorCode, OpResult, Operation, Stat, Zxid, ANY_VERSION};

#[derive(Debug, Clone)]
struct Node {
    data: Vec<u8>,
    stat: Stat,
}

#[derive(Debug)]
struct TreeState {
    nodes: BTreeMap<String, Node>,
    last_zxid: Zxid,
}

/// Hierarchical key-value store with versioned nodes.
#[derive(Debug)]
pub struct DataTree {
    state: Mutex<TreeState>,
}

impl Default for DataTree {
    fn default() -> Self {
        Self::new()
    }
}

impl DataTree {
    /// Tree containing only `/`.
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            Node {
                data: Vec::new(),
                stat: Stat::default(),
            },
        );
        Self {
            state: Mutex::new(TreeState {
                nodes,
                last_zxid: 0,
            }),
        }
    }

    pub fn last_zxid(&self) -> Zxid {
        self.lock().last_zxid
    }

    /// Apply one operation. Returns the zxid it was served at.
    pub fn apply(&self, op: &Operation) -> (Zxid, Result<OpResult, ErrorCode>) {
        let mut state = self.lock();
        if let Some(path) = op.path() {
            if !is_valid_path(path) {
                return (state.last_zxid, Err(ErrorCode::BadArguments));
            }
        }
        let result = match op {
            Operation::GetData { path } => state
                .nodes
                .get(path)
                .map(|node| OpResult::Data {
                    data: node.data.clone(),
                    stat: node.stat,
                })
                .ok_or(ErrorCode::NoNode),
            Operation::Exists { path } => {
                Ok(OpResult::Stat(state.nodes.get(path).map(|node| node.stat)))
            }
            Operation::GetChildren { path } => {
                if state.nodes.contains_key(path) {
                    Ok(OpResult::Children(children_of(&state.nodes, path)))
                } else {
                    Err(ErrorCode::NoNode)
                }
            }
            Operation::Create { path, data } => state.create(path, data),
            Operation::SetData {
                path,
                data,
                version,
            } => state.set_data(path, data, *version),
            Operation::Delete { path, version } => state.delete(path, *version),
            Operation::Sync { .. } | Operation::Ping | Operation::CloseSession => {
                Ok(OpResult::Done)
            }
        };
        (state.last_zxid, result)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TreeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TreeState {
    fn create(&mut self, path: &str, data: &[u8]) -> Result<OpResult, ErrorCode> {
        if self.nodes.contains_key(path) {
            return Err(ErrorCode::NodeExists);
        }
        let parent = parent_of(path).ok_or(ErrorCode::NodeExists)?;
        if !self.nodes.contains_key(parent) {
            return Err(ErrorCode::NoNode);
        }

        self.last_zxid += 1;
        let zxid = self.last_zxid;
        if let Some(parent) = self.nodes.get_mut(parent) {
            parent.stat.num_children += 1;
        }
        self.nodes.insert(
            path.to_string(),
            Node {
                data: data.to_vec(),
                stat: Stat {
                    version: 0,
                    czxid: zxid,
                    mzxid: zxid,
                    num_children: 0,
                },
            },
        );
        Ok(OpResult::Created(path.to_string()))
    }

    fn set_data(&mut self, path: &str, data: &[u8], version: i32) -> Result<OpResult, ErrorCode> {
        let current = self.nodes.get(path).ok_or(ErrorCode::NoNode)?.stat.version;
        if version != ANY_VERSION && version != current {
            return Err(ErrorCode::BadVersion);
        }

        self.last_zxid += 1;
        let zxid = self.last_zxid;
        let node = self.nodes.get_mut(path).ok_or(ErrorCode::NoNode)?;
        node.data = data.to_vec();
        node.stat.version += 1;
        node.stat.mzxid = zxid;
        Ok(OpResult::Stat(Some(node.stat)))
    }

    fn delete(&mut self, path: &str, version: i32) -> Result<OpResult, ErrorCode> {
        let parent = parent_of(path).ok_or(ErrorCode::BadArguments)?;
        let stat = self.nodes.get(path).ok_or(ErrorCode::NoNode)?.stat;
        if version != ANY_VERSION && version != stat.version {
            return Err(ErrorCode::BadVersion);
        }
        if stat.num_children > 0 {
            return Err(ErrorCode::NotEmpty);
        }

        self.last_zxid += 1;
        self.nodes.remove(path);
        if let Some(parent) = self.nodes.get_mut(parent) {
            parent.stat.num_children = parent.stat.num_children.saturating_sub(1);
        }
        Ok(OpResult::Done)
    }
}

/// Absolute, no trailing slash (except `/`), no empty segments.
fn is_valid_path(path: &str) -> bool {
    if path == "/" {
        return true;
    }
    path.starts_with('/') && path[1..].split('/').all(|segment| !segment.is_empty())
}

/// Parent path; `None` for the root.
fn parent_of(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(index) => Some(&path[..index]),
        None => None,
    }
}

fn children_of(nodes: &BTreeMap<String, Node>, path: &str) -> Vec<String> {
    nodes
        .keys()
        .filter(|candidate| parent_of(candidate) == Some(path))
        .filter_map(|candidate| candidate.rsplit('/').next().map(str::to_string))
        .collect()
}
