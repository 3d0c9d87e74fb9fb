//! Structural edits on the node and folder forests.
//!
//! Every edit validates first, then applies in a single statement or one
//! transaction, so a failed edit leaves the forest untouched.

use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize};

use crate::db::{Database, Folder, Node};
use crate::error::{GraphError, Result};
use crate::resolver::TreeResolver;

/// Requested placement change. Outer `None` leaves the field alone;
/// `Some(None)` clears it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeMove {
    #[serde(default, rename = "parentId", deserialize_with = "double_option")]
    pub parent_id: Option<Option<String>>,
    #[serde(default, rename = "folderId", deserialize_with = "double_option")]
    pub folder_id: Option<Option<String>>,
}

/// Distinguishes an absent field from an explicit `null`.
fn double_option<'de, D, T>(deserializer: D) -> std::result::Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeleteMode {
    /// Remove the node and move its children up to its parent.
    #[default]
    Single,
    /// Remove the node and everything below it.
    Subtree,
}

impl DeleteMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeleteMode::Single => "single",
            DeleteMode::Subtree => "subtree",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "single" => Some(DeleteMode::Single),
            "subtree" => Some(DeleteMode::Subtree),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeleteOutcome {
    pub deleted: Vec<String>,
    pub reparented: Vec<String>,
}

pub struct MutationEngine {
    resolver: Arc<TreeResolver>,
}

impl MutationEngine {
    pub fn new(resolver: Arc<TreeResolver>) -> Self {
        Self { resolver }
    }

    fn db(&self) -> &Database {
        self.resolver.db()
    }

    // ==================== Nodes ====================

    pub fn move_node(&self, owner_id: &str, node_id: &str, change: NodeMove) -> Result<Node> {
        let db = self.db();
        let node = db
            .get_node(owner_id, node_id)?
            .ok_or_else(|| GraphError::node_not_found(node_id))?;

        let parent_id = match change.parent_id {
            None => node.parent_id.clone(),
            Some(target) => target,
        };
        let folder_id = match change.folder_id {
            None => node.folder_id.clone(),
            Some(target) => target,
        };

        if parent_id != node.parent_id {
            if let Some(target) = parent_id.as_deref() {
                self.check_node_target(owner_id, node_id, target)?;
            }
        }
        if folder_id != node.folder_id {
            if let Some(target) = folder_id.as_deref() {
                if db.get_folder(owner_id, target)?.is_none() {
                    return Err(GraphError::folder_not_found(target));
                }
            }
        }

        db.set_node_placement(owner_id, node_id, parent_id.as_deref(), folder_id.as_deref())?;
        tracing::info!(owner = %owner_id, node_id = %node_id, parent = ?parent_id, folder = ?folder_id, "moved node");

        db.get_node(owner_id, node_id)?
            .ok_or_else(|| GraphError::node_not_found(node_id))
    }

    /// Detach a node and its subtree into an independent conversation.
    /// The folder is kept.
    pub fn cut_to_root(&self, owner_id: &str, node_id: &str) -> Result<Node> {
        self.move_node(owner_id, node_id, NodeMove { parent_id: Some(None), folder_id: None })
    }

    pub fn delete_node(&self, owner_id: &str, node_id: &str, mode: DeleteMode) -> Result<DeleteOutcome> {
        let outcome = match mode {
            DeleteMode::Single => {
                let reparented = self.db().delete_single(owner_id, node_id)?;
                DeleteOutcome { deleted: vec![node_id.to_string()], reparented }
            }
            DeleteMode::Subtree => {
                let deleted = self.db().delete_subtree(owner_id, node_id)?;
                DeleteOutcome { deleted, reparented: Vec::new() }
            }
        };

        tracing::info!(
            owner = %owner_id,
            node_id = %node_id,
            mode = mode.as_str(),
            deleted = outcome.deleted.len(),
            reparented = outcome.reparented.len(),
            "deleted node"
        );
        Ok(outcome)
    }

    fn check_node_target(&self, owner_id: &str, node_id: &str, target: &str) -> Result<()> {
        if target == node_id {
            return Err(GraphError::Validation("a node cannot become its own parent".into()));
        }
        if self.db().get_node(owner_id, target)?.is_none() {
            return Err(GraphError::node_not_found(target));
        }
        if self.db().is_in_subtree(owner_id, node_id, target)? {
            return Err(GraphError::Validation(format!(
                "cannot move {} under its own descendant {}",
                node_id, target
            )));
        }
        Ok(())
    }

    // ==================== Folders ====================

    pub fn create_folder(&self, owner_id: &str, name: &str, parent_id: Option<&str>) -> Result<Folder> {
        let name = name.trim();
        if name.is_empty() {
            return Err(GraphError::Validation("folder name is required".into()));
        }
        if let Some(parent) = parent_id {
            if self.db().get_folder(owner_id, parent)?.is_none() {
                return Err(GraphError::folder_not_found(parent));
            }
        }

        let folder = self.db().insert_folder(owner_id, name, parent_id)?;
        tracing::info!(owner = %owner_id, folder_id = %folder.id, "created folder");
        Ok(folder)
    }

    pub fn move_folder(&self, owner_id: &str, folder_id: &str, parent_id: Option<&str>) -> Result<Folder> {
        let db = self.db();
        if db.get_folder(owner_id, folder_id)?.is_none() {
            return Err(GraphError::folder_not_found(folder_id));
        }

        if let Some(target) = parent_id {
            if target == folder_id {
                return Err(GraphError::Validation("a folder cannot contain itself".into()));
            }
            if db.get_folder(owner_id, target)?.is_none() {
                return Err(GraphError::folder_not_found(target));
            }
            let subtree = db.folder_subtree_ids(owner_id, folder_id)?;
            if subtree.iter().any(|id| id == target) {
                return Err(GraphError::Validation(format!(
                    "cannot move folder {} into its own sub-folder {}",
                    folder_id, target
                )));
            }
        }

        db.set_folder_parent(owner_id, folder_id, parent_id)?;

        db.get_folder(owner_id, folder_id)?
            .ok_or_else(|| GraphError::folder_not_found(folder_id))
    }
}
