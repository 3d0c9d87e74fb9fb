//! Error taxonomy shared by the store, resolver, assembler, mutation engine and
//! generation session.

/// What kind of record a lookup was for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Node,
    Folder,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Node => "node",
            RecordKind::Folder => "folder",
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum GraphError {
    /// Id missing or owned by someone else. The two cases are indistinguishable
    /// to the caller.
    #[error("{kind} not found: {id}")]
    NotFound { kind: RecordKind, id: String },

    #[error("parent node not found: {0}")]
    ParentNotFound(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("model generation failed: {0}")]
    Upstream(String),

    #[error("forest integrity fault: {0}")]
    Integrity(String),

    #[error("storage: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database lock poisoned")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, GraphError>;

impl GraphError {
    pub fn node_not_found(id: impl Into<String>) -> Self {
        GraphError::NotFound { kind: RecordKind::Node, id: id.into() }
    }

    pub fn folder_not_found(id: impl Into<String>) -> Self {
        GraphError::NotFound { kind: RecordKind::Folder, id: id.into() }
    }

    /// Taxonomy name reported to clients alongside the reason.
    pub fn kind(&self) -> &'static str {
        match self {
            GraphError::NotFound { .. } | GraphError::ParentNotFound(_) => "NotFound",
            GraphError::Validation(_) => "ValidationError",
            GraphError::Upstream(_) => "UpstreamGenerationError",
            GraphError::Integrity(_) => "IntegrityFault",
            GraphError::Storage(_) | GraphError::Serialization(_) | GraphError::Poisoned => {
                "InternalError"
            }
        }
    }

    /// User-facing reason. Storage internals are not leaked.
    pub fn reason(&self) -> String {
        match self {
            GraphError::Storage(_) | GraphError::Serialization(_) | GraphError::Poisoned => {
                "internal storage error".to_string()
            }
            other => other.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, GraphError::NotFound { .. } | GraphError::ParentNotFound(_))
    }
}
