//! Ancestor and descendant resolution over the conversation forest.
//!
//! The resolver is read-only and keeps no state of its own: every call reads
//! a fresh snapshot from the store, so edits made through another handle or
//! another process are visible on the next call.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Deserialize;

use crate::db::{Database, Node, NodeView};
use crate::error::{GraphError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Ancestors,
    Descendants,
}

impl Direction {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "ancestors" => Some(Direction::Ancestors),
            "descendants" => Some(Direction::Descendants),
            _ => None,
        }
    }
}

pub struct TreeResolver {
    db: Arc<Database>,
}

impl TreeResolver {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    /// Ordered path from the root to `node_id`, inclusive.
    ///
    /// The walk is bounded by the owner's node count. A revisited id means a
    /// cycle; a chain whose oldest element still points at a parent means the
    /// pointer is orphaned. Both are reported as integrity faults and never
    /// repaired.
    pub fn ancestors_of(&self, owner_id: &str, node_id: &str) -> Result<Vec<Node>> {
        let limit = self.db.count_nodes(owner_id)?;
        let rows = self.db.ancestor_rows(owner_id, node_id, limit)?;
        if rows.is_empty() {
            return Err(GraphError::node_not_found(node_id));
        }

        let mut seen = HashSet::with_capacity(rows.len());
        for (_, node) in &rows {
            if !seen.insert(node.id.as_str()) {
                tracing::error!(owner = %owner_id, node_id = %node_id, revisited = %node.id, "cycle in parent pointers");
                return Err(GraphError::Integrity(format!(
                    "cycle detected while resolving ancestors of {}",
                    node_id
                )));
            }
        }

        let chain: Vec<Node> = rows.into_iter().map(|(_, node)| node).collect();

        if let Some(dangling) = chain.first().and_then(|oldest| oldest.parent_id.as_ref()) {
            tracing::error!(owner = %owner_id, node_id = %node_id, parent = %dangling, "orphaned parent pointer");
            return Err(GraphError::Integrity(format!(
                "orphaned parent pointer {} in chain of {}",
                dangling, node_id
            )));
        }

        for pair in chain.windows(2) {
            if pair[1].parent_id.as_deref() != Some(pair[0].id.as_str()) {
                return Err(GraphError::Integrity(format!(
                    "broken link between {} and {}",
                    pair[0].id, pair[1].id
                )));
            }
        }

        Ok(chain)
    }

    /// `root_id` plus every transitive child, in creation order.
    pub fn descendants_of(
        &self,
        owner_id: &str,
        root_id: &str,
        with_children_count: bool,
    ) -> Result<Vec<NodeView>> {
        let rows = self.db.descendant_rows(owner_id, root_id, with_children_count)?;
        if rows.is_empty() {
            return Err(GraphError::node_not_found(root_id));
        }
        Ok(rows)
    }

    /// Either direction of the graph around a node, in the shape the API returns.
    pub fn graph(
        &self,
        owner_id: &str,
        node_id: &str,
        direction: Direction,
        with_children_count: bool,
    ) -> Result<Vec<NodeView>> {
        match direction {
            Direction::Descendants => self.descendants_of(owner_id, node_id, with_children_count),
            Direction::Ancestors => {
                let chain = self.ancestors_of(owner_id, node_id)?;
                chain
                    .into_iter()
                    .map(|node| {
                        let children_count = if with_children_count {
                            Some(self.db.children_of(owner_id, &node.id)?.len() as i64)
                        } else {
                            None
                        };
                        Ok(NodeView { node, children_count })
                    })
                    .collect()
            }
        }
    }

    pub fn root_of(&self, owner_id: &str, node_id: &str) -> Result<String> {
        let chain = self.ancestors_of(owner_id, node_id)?;
        chain
            .first()
            .map(|n| n.id.clone())
            .ok_or_else(|| GraphError::node_not_found(node_id))
    }
}
