//! Arena storage for the node tree
//!
//! Nodes live in a vector indexed by [`NodeId`]. Children are stored as
//! index lists and the parent as an index, so back-references never create
//! ownership cycles. Slots of removed nodes are never reused, which makes a
//! stale `NodeId` detectable instead of silently aliasing a new node.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TreeError;

/// Index of a node in the tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Get the raw index value
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    fn slot(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A node with its structural links
#[derive(Debug)]
pub struct Node<T> {
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    /// Payload
    pub data: T,
}

impl<T> Node<T> {
    /// Parent of the node, `None` for the root
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Children in insertion order
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }
}

/// Parent/children container with a single root
#[derive(Debug)]
pub struct Tree<T> {
    slots: Vec<Option<Node<T>>>,
}

impl<T> Tree<T> {
    /// Create a tree holding only a root node
    pub fn new(root: T) -> Self {
        Self {
            slots: vec![Some(Node {
                parent: None,
                children: Vec::new(),
                data: root,
            })],
        }
    }

    /// The root node id
    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    /// Check if a node id refers to a live node
    pub fn contains(&self, id: NodeId) -> bool {
        self.get(id).is_some()
    }

    /// Look up a node
    pub fn get(&self, id: NodeId) -> Option<&Node<T>> {
        self.slots.get(id.slot()).and_then(Option::as_ref)
    }

    /// Look up a node mutably
    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node<T>> {
        self.slots.get_mut(id.slot()).and_then(Option::as_mut)
    }

    /// Look up a node, failing on a stale id
    pub fn node(&self, id: NodeId) -> Result<&Node<T>, TreeError> {
        self.get(id).ok_or(TreeError::UnknownNode(id))
    }

    /// Look up a node mutably, failing on a stale id
    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut Node<T>, TreeError> {
        self.get_mut(id).ok_or(TreeError::UnknownNode(id))
    }

    /// Parent of a node
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.get(id).and_then(Node::parent)
    }

    /// Children of a node, empty for an unknown node
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.get(id).map(Node::children).unwrap_or(&[])
    }

    /// Position of a node among its parent's children
    pub fn row(&self, id: NodeId) -> Option<usize> {
        let parent = self.parent(id)?;
        self.children(parent).iter().position(|c| *c == id)
    }

    /// Number of live nodes, root included
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Check if the tree holds only its root
    pub fn is_empty(&self) -> bool {
        self.len() == 1
    }

    /// Append a node as the last child of `parent`
    pub fn append_child(&mut self, parent: NodeId, data: T) -> Result<NodeId, TreeError> {
        if !self.contains(parent) {
            return Err(TreeError::UnknownNode(parent));
        }
        let id = NodeId(self.slots.len() as u32);
        self.slots.push(Some(Node {
            parent: Some(parent),
            children: Vec::new(),
            data,
        }));
        self.node_mut(parent)?.children.push(id);
        Ok(id)
    }

    /// Remove the child at `row` of `parent`, along with its subtree
    ///
    /// Returns the removed node's payload.
    pub fn remove_child(&mut self, parent: NodeId, row: usize) -> Result<T, TreeError> {
        let node = self.node_mut(parent)?;
        if row >= node.children.len() {
            return Err(TreeError::UnknownNode(parent));
        }
        let id = node.children.remove(row);

        let mut pending: Vec<NodeId> = self.children(id).to_vec();
        while let Some(descendant) = pending.pop() {
            pending.extend_from_slice(self.children(descendant));
            self.slots[descendant.slot()] = None;
        }

        self.slots[id.slot()]
            .take()
            .map(|n| n.data)
            .ok_or(TreeError::UnknownNode(id))
    }
}
