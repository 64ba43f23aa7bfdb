//! Arena search tree and the beam frontier.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::action::Action;
use super::effect::VisualEffect;
use crate::device::{SnapshotHandle, UiState};

/// Stable index of a node in the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Active,
    Pruned,
    Success,
    Failed,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NodeStatus::Active => "active",
            NodeStatus::Pruned => "pruned",
            NodeStatus::Success => "success",
            NodeStatus::Failed => "failed",
        })
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum TreeError {
    #[error("search tree is frozen after success")]
    Frozen,
    #[error("unknown node {0}")]
    UnknownNode(NodeId),
    #[error("node {node} cannot move from {from} to {to}")]
    IllegalTransition {
        node: NodeId,
        from: NodeStatus,
        to: NodeStatus,
    },
}

#[derive(Debug, Clone)]
pub struct SearchNode {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    /// Committed action that produced this node (`None` for the root)
    pub action: Option<Action>,
    /// Effect of `action` relative to the parent's state
    pub effect: VisualEffect,
    pub state: UiState,
    pub status: NodeStatus,
    pub snapshot: SnapshotHandle,
    pub depth: usize,
    pub round: usize,
}

#[derive(Debug, Default)]
pub struct SearchTree {
    nodes: Vec<SearchNode>,
    frozen: bool,
}

impl SearchTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_root(&mut self, state: UiState, snapshot: SnapshotHandle) -> Result<NodeId, TreeError> {
        if self.frozen {
            return Err(TreeError::Frozen);
        }
        let id = NodeId(self.nodes.len());
        self.nodes.push(SearchNode {
            id,
            parent: None,
            action: None,
            effect: VisualEffect::NoEffect,
            state,
            status: NodeStatus::Active,
            snapshot,
            depth: 0,
            round: 0,
        });
        Ok(id)
    }

    pub fn add_child(
        &mut self,
        parent: NodeId,
        action: Action,
        effect: VisualEffect,
        state: UiState,
        snapshot: SnapshotHandle,
        round: usize,
    ) -> Result<NodeId, TreeError> {
        if self.frozen {
            return Err(TreeError::Frozen);
        }
        let depth = self.get(parent).ok_or(TreeError::UnknownNode(parent))?.depth + 1;
        let id = NodeId(self.nodes.len());
        self.nodes.push(SearchNode {
            id,
            parent: Some(parent),
            action: Some(action),
            effect,
            state,
            status: NodeStatus::Active,
            snapshot,
            depth,
            round,
        });
        Ok(id)
    }

    pub fn get(&self, id: NodeId) -> Option<&SearchNode> {
        self.nodes.get(id.0)
    }

    pub fn status(&self, id: NodeId) -> Option<NodeStatus> {
        self.get(id).map(|n| n.status)
    }

    /// Move an active node to a terminal status. Success freezes the tree.
    pub fn set_status(&mut self, id: NodeId, to: NodeStatus) -> Result<(), TreeError> {
        if self.frozen {
            return Err(TreeError::Frozen);
        }
        let node = self.nodes.get_mut(id.0).ok_or(TreeError::UnknownNode(id))?;
        if node.status != NodeStatus::Active || to == NodeStatus::Active {
            return Err(TreeError::IllegalTransition {
                node: id,
                from: node.status,
                to,
            });
        }
        node.status = to;
        if to == NodeStatus::Success {
            self.frozen = true;
        }
        Ok(())
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &SearchNode> {
        self.nodes.iter()
    }

    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes.iter().filter(|n| n.parent == Some(id)).map(|n| n.id).collect()
    }

    /// Node ids from the root down to `id`
    pub fn path(&self, id: NodeId) -> Vec<NodeId> {
        let mut path = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor.and_then(|c| self.get(c)) {
            path.push(current.id);
            cursor = current.parent;
        }
        path.reverse();
        path
    }

    /// Committed actions from the root to `id`
    pub fn actions(&self, id: NodeId) -> Vec<Action> {
        self.path(id)
            .into_iter()
            .filter_map(|n| self.get(n).and_then(|node| node.action.clone()))
            .collect()
    }

    /// `(action, effect)` pairs from the root to `id`
    pub fn history(&self, id: NodeId) -> Vec<(&Action, &VisualEffect)> {
        self.path(id)
            .into_iter()
            .filter_map(|n| self.get(n))
            .filter_map(|node| node.action.as_ref().map(|a| (a, &node.effect)))
            .collect()
    }

    /// Whether `id`'s state equals the state of one of its ancestors
    pub fn revisits_ancestor(&self, id: NodeId) -> Option<NodeId> {
        let node = self.get(id)?;
        let mut cursor = node.parent;
        while let Some(ancestor) = cursor.and_then(|c| self.get(c)) {
            if ancestor.state == node.state {
                return Some(ancestor.id);
            }
            cursor = ancestor.parent;
        }
        None
    }

    /// Earliest node created before `id` that shows the same state and is
    /// still worth keeping (active or success).
    ///
    /// Failed nodes do not count: their snapshot could not be brought back,
    /// so a fresh path to the same screen replaces them.
    pub fn duplicate_of(&self, id: NodeId) -> Option<NodeId> {
        let node = self.get(id)?;
        self.nodes[..id.0]
            .iter()
            .find(|other| {
                matches!(other.status, NodeStatus::Active | NodeStatus::Success) && other.state == node.state
            })
            .map(|other| other.id)
    }

    /// Number of committed actions in the whole tree
    pub fn committed(&self) -> usize {
        self.nodes.iter().filter(|n| n.parent.is_some()).count()
    }

    pub fn success(&self) -> Option<NodeId> {
        self.nodes.iter().find(|n| n.status == NodeStatus::Success).map(|n| n.id)
    }
}

/// Ordered set of active node ids pursued in the next round
#[derive(Debug, Clone)]
pub struct Frontier {
    ids: Vec<NodeId>,
    capacity: usize,
}

impl Frontier {
    pub fn new(capacity: usize) -> Self {
        Self {
            ids: Vec::new(),
            capacity: capacity.max(1),
        }
    }

    /// Replace the members, keeping the first `capacity` distinct ids
    pub fn replace(&mut self, ids: impl IntoIterator<Item = NodeId>) {
        self.ids.clear();
        for id in ids {
            if self.ids.len() == self.capacity {
                break;
            }
            if !self.ids.contains(&id) {
                self.ids.push(id);
            }
        }
    }

    pub fn remove(&mut self, id: NodeId) {
        self.ids.retain(|&m| m != id);
    }

    pub fn ids(&self) -> &[NodeId] {
        &self.ids
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.ids.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
