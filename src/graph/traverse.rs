//! Iterative walks over the active `follows` edges of one graph.
//!
//! The adjacency is materialised once per operation from the store; every
//! walk carries a visited set and a step budget so that a corrupted graph
//! can never loop forever.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::{GraphError, GraphResult};
use crate::types::{BlockEdge, EdgeRelation};

#[derive(Debug, Default, Clone)]
pub struct FollowsAdjacency {
    children: HashMap<String, Vec<String>>,
    parent: HashMap<String, String>,
}

impl FollowsAdjacency {
    /// Build from a set of edges, keeping only active `follows` edges.
    pub fn from_edges(edges: &[BlockEdge]) -> Self {
        let mut adjacency = Self::default();
        for edge in edges
            .iter()
            .filter(|e| e.relation == EdgeRelation::Follows && e.is_active())
        {
            adjacency
                .children
                .entry(edge.parent_node_id.clone())
                .or_default()
                .push(edge.child_node_id.clone());
            adjacency
                .parent
                .insert(edge.child_node_id.clone(), edge.parent_node_id.clone());
        }
        adjacency
    }

    pub fn parent_of(&self, node_id: &str) -> Option<&str> {
        self.parent.get(node_id).map(String::as_str)
    }

    pub fn children_of(&self, node_id: &str) -> &[String] {
        self.children
            .get(node_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Breadth-first search `from →* to`. Zero steps counts, so a node is
    /// always reachable from itself.
    pub fn is_reachable(&self, from: &str, to: &str, max_steps: usize) -> GraphResult<bool> {
        if from == to {
            return Ok(true);
        }
        let mut visited: HashSet<&str> = HashSet::from([from]);
        let mut queue: VecDeque<&str> = VecDeque::from([from]);
        let mut steps = 0usize;

        while let Some(current) = queue.pop_front() {
            steps += 1;
            if steps > max_steps {
                return Err(traversal_limit(max_steps));
            }
            for child in self.children_of(current) {
                if child == to {
                    return Ok(true);
                }
                if visited.insert(child.as_str()) {
                    queue.push_back(child.as_str());
                }
            }
        }
        Ok(false)
    }

    /// Node ids from the top of the conversation down to `tip`, inclusive.
    pub fn ancestry(&self, tip: &str, max_steps: usize) -> GraphResult<Vec<String>> {
        let mut path = vec![tip.to_string()];
        let mut seen: HashSet<&str> = HashSet::from([tip]);
        let mut current = tip;

        while let Some(parent) = self.parent_of(current) {
            if !seen.insert(parent) {
                // A revisit means a cycle slipped in; stop at the first repeat.
                break;
            }
            if path.len() >= max_steps {
                return Err(traversal_limit(max_steps));
            }
            path.push(parent.to_string());
            current = parent;
        }

        path.reverse();
        Ok(path)
    }
}

fn traversal_limit(max_steps: usize) -> GraphError {
    GraphError::Internal(format!("graph traversal exceeded {max_steps} steps"))
}
