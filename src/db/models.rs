use serde::{Deserialize, Serialize};

/// Who authored a cited excerpt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CitationSource {
    User,
    Ai,
}

impl CitationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CitationSource::User => "user",
            CitationSource::Ai => "ai",
        }
    }
}

/// What a reference points at.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceType {
    Folder,
    Chat,
}

impl ReferenceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferenceType::Folder => "folder",
            ReferenceType::Chat => "chat",
        }
    }
}

/// A literal excerpt the user quoted when composing a turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Citation {
    pub text: String,
    #[serde(rename = "sourceNodeId")]
    pub source_node_id: String,
    pub source: CitationSource,
}

/// Another conversation or folder attached as extra context for a turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reference {
    pub id: String,
    #[serde(rename = "type")]
    pub ref_type: ReferenceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

// A node is one user/AI turn. parent_id = None marks the root of a conversation.
// summary is the per-turn summary for children and the conversation title for roots.

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub id: String,
    #[serde(rename = "ownerId")]
    pub owner_id: String,
    #[serde(rename = "parentId")]
    pub parent_id: Option<String>,
    #[serde(rename = "folderId")]
    pub folder_id: Option<String>,
    #[serde(rename = "userPrompt")]
    pub user_prompt: String,
    #[serde(rename = "aiResponse")]
    pub ai_response: Option<String>,
    pub summary: Option<String>,
    #[serde(rename = "modelMetadata")]
    pub model_metadata: serde_json::Value,
    #[serde(default)]
    pub citations: Vec<Citation>,
    #[serde(default)]
    pub references: Vec<Reference>,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
    #[serde(rename = "updatedAt")]
    pub updated_at: i64,
}

impl Node {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Model name recorded at creation, if any.
    pub fn model_name(&self) -> Option<&str> {
        self.model_metadata.get("model").and_then(|v| v.as_str())
    }
}

/// Node row plus the optional direct-children aggregate used for UI badges.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeView {
    #[serde(flatten)]
    pub node: Node,
    #[serde(rename = "childrenCount", skip_serializing_if = "Option::is_none")]
    pub children_count: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Folder {
    pub id: String,
    #[serde(rename = "ownerId")]
    pub owner_id: String,
    pub name: String,
    #[serde(rename = "parentId")]
    pub parent_id: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
    #[serde(rename = "updatedAt")]
    pub updated_at: i64,
}
