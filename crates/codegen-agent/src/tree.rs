//! Arena-backed trajectory tree (§4.C).
//!
//! Nodes are stored in a flat `Vec`; a child only holds its parent's index,
//! not a borrow or an `Rc` — the parent back-reference is a lookup
//! relation, not ownership, matching the original's plain-object `Node`
//! graph (referenced from `shared_fsm.py`).

use serde::{Deserialize, Serialize};

pub type NodeId = usize;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NodeSlot<T> {
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    data: T,
}

/// An arena of `T`-carrying nodes with a single root at index 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tree<T> {
    nodes: Vec<NodeSlot<T>>,
}

impl<T> Tree<T> {
    pub fn new(root_data: T) -> Self {
        Self {
            nodes: vec![NodeSlot {
                parent: None,
                children: Vec::new(),
                data: root_data,
            }],
        }
    }

    pub fn root(&self) -> NodeId {
        0
    }

    pub fn data(&self, id: NodeId) -> &T {
        &self.nodes[id].data
    }

    pub fn data_mut(&mut self, id: NodeId) -> &mut T {
        &mut self.nodes[id].data
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id].children
    }

    pub fn is_leaf(&self, id: NodeId) -> bool {
        self.nodes[id].children.is_empty()
    }

    /// Distance from the root (root is depth 0).
    pub fn depth(&self, id: NodeId) -> usize {
        let mut depth = 0;
        let mut current = self.nodes[id].parent;
        while let Some(node) = current {
            depth += 1;
            current = self.nodes[node].parent;
        }
        depth
    }

    /// Add a new child carrying `data`, returning its id.
    pub fn push_child(&mut self, parent: NodeId, data: T) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(NodeSlot {
            parent: Some(parent),
            children: Vec::new(),
            data,
        });
        self.nodes[parent].children.push(id);
        id
    }

    /// Walk from `id` up to (and including) the root, returned root-first —
    /// the conversation trajectory an actor replays as message history.
    pub fn trajectory(&self, id: NodeId) -> Vec<NodeId> {
        let mut path = Vec::new();
        let mut current = Some(id);
        while let Some(node) = current {
            path.push(node);
            current = self.nodes[node].parent;
        }
        path.reverse();
        path
    }

    /// Depth-first walk over every node reachable from `id`, `id` first.
    pub fn dfs(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(node) = stack.pop() {
            out.push(node);
            // push in reverse so children are visited left-to-right
            for &child in self.nodes[node].children.iter().rev() {
                stack.push(child);
            }
        }
        out
    }

    /// All leaves reachable from `id`, `id` itself if it has no children.
    pub fn leaves(&self, id: NodeId) -> Vec<NodeId> {
        self.dfs(id).into_iter().filter(|&n| self.is_leaf(n)).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Rebuild this tree with every node's data run through `f`, keeping
    /// the same parent/child shape. Used to project a non-serializable
    /// node type (one carrying a live resource handle) down to a
    /// serializable snapshot before `dump`.
    pub fn map<U>(&self, f: impl Fn(&T) -> U) -> Tree<U> {
        Tree {
            nodes: self
                .nodes
                .iter()
                .map(|slot| NodeSlot {
                    parent: slot.parent,
                    children: slot.children.clone(),
                    data: f(&slot.data),
                })
                .collect(),
        }
    }
}

impl<T: Serialize + for<'de> Deserialize<'de>> Tree<T> {
    pub fn dump(&self) -> AgentResultDump {
        AgentResultDump {
            json: serde_json::to_value(self).expect("tree always serializes"),
        }
    }

    pub fn load(dump: AgentResultDump) -> serde_json::Result<Self> {
        serde_json::from_value(dump.json)
    }
}

/// Opaque serialized form of a `Tree`, round-tripped through JSON.
pub struct AgentResultDump {
    json: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trajectory_is_root_first() {
        let mut tree = Tree::new("root");
        let a = tree.push_child(tree.root(), "a");
        let b = tree.push_child(a, "b");

        let trajectory = tree.trajectory(b);
        let data: Vec<_> = trajectory.iter().map(|&id| *tree.data(id)).collect();
        assert_eq!(data, vec!["root", "a", "b"]);
    }

    #[test]
    fn leaf_and_dfs_semantics() {
        let mut tree = Tree::new(0);
        let a = tree.push_child(tree.root(), 1);
        let _b = tree.push_child(tree.root(), 2);
        let _c = tree.push_child(a, 3);

        assert!(tree.is_leaf(_b));
        assert!(!tree.is_leaf(a));
        assert_eq!(tree.leaves(tree.root()).len(), 2);
        assert_eq!(tree.dfs(tree.root()).len(), 4);
    }

    #[test]
    fn depth_counts_edges_from_root() {
        let mut tree = Tree::new("root");
        let a = tree.push_child(tree.root(), "a");
        let b = tree.push_child(a, "b");

        assert_eq!(tree.depth(tree.root()), 0);
        assert_eq!(tree.depth(a), 1);
        assert_eq!(tree.depth(b), 2);
    }

    #[test]
    fn dump_and_load_round_trips() {
        let mut tree = Tree::new("root".to_string());
        tree.push_child(tree.root(), "child".to_string());

        let dump = tree.dump();
        let restored: Tree<String> = Tree::load(dump).unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.data(1), "child");
    }
}
