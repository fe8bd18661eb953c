//! Structural invariant checking for the file tree.
//!
//! The simulator (and the unit tests) call [`check_tree`] after every
//! mutation. A violation means the tree reached a state that no sequence
//! of valid operations should ever produce.

use std::collections::HashSet;

use crate::storage::Storage;
use crate::tree::FileTree;
use crate::tree::node::NodeId;

/// A broken structural invariant, with a description of what failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvariantViolation {
    pub message: String,
}

impl InvariantViolation {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invariant violation: {}", self.message)
    }
}

impl std::error::Error for InvariantViolation {}

/// Verify every structural invariant of the tree:
///
/// - non-root nodes hold between `degree - 1` and `2 * degree - 1` keys,
///   the root at most `2 * degree - 1` (and at least 1 if it is internal)
/// - internal nodes have exactly `size + 1` children and as many cached
///   lengths
/// - every cached child length equals the exact byte total of that subtree
/// - all leaves sit at the same depth
/// - no key has length zero
/// - no node is reachable twice (single ownership)
/// - the tree's logical size equals the reachable key-length total
pub fn check_tree<S: Storage>(tree: &FileTree<S>) -> Result<(), InvariantViolation> {
    let mut visited = HashSet::new();
    let root_walk = walk(tree, tree.root, true, &mut visited)?;
    if root_walk.total != tree.size {
        return Err(InvariantViolation::new(format!(
            "tree size {} does not match reachable key total {}",
            tree.size, root_walk.total
        )));
    }
    Ok(())
}

struct Walk {
    total: u64,
    depth: usize,
}

fn walk<S: Storage>(
    tree: &FileTree<S>,
    node_id: NodeId,
    is_root: bool,
    visited: &mut HashSet<NodeId>,
) -> Result<Walk, InvariantViolation> {
    if !visited.insert(node_id) {
        return Err(InvariantViolation::new(format!(
            "node {node_id} is reachable twice"
        )));
    }

    let node = &tree.arena[node_id];
    let size = node.size();
    let max_keys = 2 * tree.degree - 1;

    if size > max_keys {
        return Err(InvariantViolation::new(format!(
            "node {node_id} holds {size} keys (maximum {max_keys})"
        )));
    }
    if !is_root && size < tree.degree - 1 {
        return Err(InvariantViolation::new(format!(
            "node {node_id} holds {size} keys (minimum {})",
            tree.degree - 1
        )));
    }

    for (i, key) in node.keys.iter().enumerate() {
        if key.is_empty() {
            return Err(InvariantViolation::new(format!(
                "node {node_id} key {i} has length zero"
            )));
        }
    }

    if node.is_leaf() {
        if !node.child_lengths.is_empty() {
            return Err(InvariantViolation::new(format!(
                "leaf {node_id} carries cached child lengths"
            )));
        }
        return Ok(Walk {
            total: node.subtree_total(),
            depth: 0,
        });
    }

    if is_root && size == 0 {
        return Err(InvariantViolation::new(
            "internal root holds no keys".to_string(),
        ));
    }
    if node.children.len() != size + 1 {
        return Err(InvariantViolation::new(format!(
            "node {node_id} holds {size} keys but {} children",
            node.children.len()
        )));
    }
    if node.child_lengths.len() != node.children.len() {
        return Err(InvariantViolation::new(format!(
            "node {node_id} caches {} lengths for {} children",
            node.child_lengths.len(),
            node.children.len()
        )));
    }

    let mut depth = None;
    for (i, &child) in node.children.iter().enumerate() {
        let child_walk = walk(tree, child, false, visited)?;
        if child_walk.total != node.child_lengths[i] {
            return Err(InvariantViolation::new(format!(
                "node {node_id} caches {} bytes for child {i} but the subtree holds {}",
                node.child_lengths[i], child_walk.total
            )));
        }
        match depth {
            None => depth = Some(child_walk.depth),
            Some(expected) if expected != child_walk.depth => {
                return Err(InvariantViolation::new(format!(
                    "node {node_id} has leaves at depths {expected} and {}",
                    child_walk.depth
                )));
            }
            Some(_) => {}
        }
    }

    Ok(Walk {
        total: node.subtree_total(),
        depth: depth.unwrap_or(0) + 1,
    })
}
