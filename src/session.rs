//! One generation request from validation to the persisted, finalized node.
//!
//! States: `Assembling -> Streaming -> Finalizing -> Done`. `Errored` is
//! absorbing and reachable from `Streaming` and `Finalizing`. The node is
//! created before the first fragment so callers get its id immediately; the
//! session task is the only writer of that node.

use std::sync::Arc;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::ai_client::ModelClient;
use crate::context::{ContextAssembler, SkippedReference, FALLBACK_PREVIEW_CHARS};
use crate::db::{Citation, Database, NewNode, Node, Reference};
use crate::error::{GraphError, Result};
use crate::resolver::TreeResolver;
use crate::utils::preview;

/// Bound on undelivered events per session. A slow consumer stalls only its own session.
pub const EVENT_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Assembling,
    Streaming,
    Finalizing,
    Done,
    Errored,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Created { node_id: String, skipped_references: Vec<SkippedReference> },
    Fragment(String),
    Done(Node),
    Error { reason: String },
}

/// Body of a node creation request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerationRequest {
    #[serde(rename = "userPrompt", default)]
    pub user_prompt: String,
    #[serde(rename = "parentId", default)]
    pub parent_id: Option<String>,
    #[serde(rename = "folderId", default)]
    pub folder_id: Option<String>,
    #[serde(rename = "modelMetadata", default)]
    pub model_metadata: serde_json::Value,
    #[serde(default)]
    pub citations: Vec<Citation>,
    #[serde(default)]
    pub references: Vec<Reference>,
}

#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub node: Node,
    pub state: SessionState,
    pub error: Option<String>,
}

/// A running session: the created node's id, its event feed and the task
/// driving it. Dropping `events` does not stop the task.
pub struct SessionHandle {
    pub node_id: String,
    pub events: mpsc::Receiver<SessionEvent>,
    pub task: JoinHandle<SessionOutcome>,
}

pub struct GenerationSession {
    resolver: Arc<TreeResolver>,
    assembler: ContextAssembler,
    model: Arc<dyn ModelClient>,
    default_model: String,
}

impl GenerationSession {
    pub fn new(resolver: Arc<TreeResolver>, model: Arc<dyn ModelClient>, default_model: impl Into<String>) -> Self {
        Self {
            assembler: ContextAssembler::new(resolver.clone()),
            resolver,
            model,
            default_model: default_model.into(),
        }
    }

    pub fn model(&self) -> &Arc<dyn ModelClient> {
        &self.model
    }

    /// Validate, assemble context and create the node, then hand streaming
    /// and finalization to a background task. Errors here leave no node behind.
    pub fn start(&self, owner_id: &str, request: GenerationRequest) -> Result<SessionHandle> {
        let user_prompt = request.user_prompt.trim().to_string();
        if user_prompt.is_empty() {
            return Err(GraphError::Validation("userPrompt is required".into()));
        }

        let db = self.resolver.db().clone();
        if let Some(folder_id) = request.folder_id.as_deref() {
            if db.get_folder(owner_id, folder_id)?.is_none() {
                return Err(GraphError::folder_not_found(folder_id));
            }
        }

        let context = self.assembler.assemble(
            owner_id,
            request.parent_id.as_deref(),
            &request.citations,
            &request.references,
        )?;

        let mut metadata = match request.model_metadata {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        let model_name = match metadata.get("model").and_then(|m| m.as_str()) {
            Some(name) if !name.trim().is_empty() => name.to_string(),
            _ => self.default_model.clone(),
        };
        metadata.insert("model".into(), serde_json::Value::String(model_name.clone()));

        let node = db.insert_node(&NewNode {
            owner_id: owner_id.to_string(),
            parent_id: request.parent_id.clone(),
            folder_id: request.folder_id.clone(),
            user_prompt,
            model_metadata: serde_json::Value::Object(metadata),
            citations: crate::context::dedupe_citations(request.citations),
            references: context.references.clone(),
        })?;

        tracing::info!(owner = %owner_id, node_id = %node.id, model = %model_name, "generation session started");

        let (tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let run = SessionRun {
            db,
            model: self.model.clone(),
            model_name,
            context: context.text,
            skipped_references: context.skipped_references,
            node: node.clone(),
            tx,
        };

        Ok(SessionHandle { node_id: node.id, events, task: tokio::spawn(run.drive()) })
    }

    /// Drive a session with nobody listening and wait for the finalized node.
    pub async fn run_to_completion(&self, owner_id: &str, request: GenerationRequest) -> Result<SessionOutcome> {
        let handle = self.start(owner_id, request)?;
        drop(handle.events);
        handle
            .task
            .await
            .map_err(|e| GraphError::Upstream(format!("generation task failed: {}", e)))
    }
}

/// Everything the background task owns.
struct SessionRun {
    db: Arc<Database>,
    model: Arc<dyn ModelClient>,
    model_name: String,
    context: String,
    skipped_references: Vec<SkippedReference>,
    node: Node,
    tx: mpsc::Sender<SessionEvent>,
}

impl SessionRun {
    async fn drive(self) -> SessionOutcome {
        let node_id = self.node.id.clone();
        let mut listening = self
            .emit(SessionEvent::Created {
                node_id: node_id.clone(),
                skipped_references: self.skipped_references.clone(),
            }, true)
            .await;

        // Streaming
        let mut response = String::new();
        let context = Some(self.context.as_str()).filter(|c| !c.is_empty());
        let failure = match self.model.stream(&self.node.user_prompt, &self.model_name, context).await {
            Ok(mut fragments) => {
                let mut failure = None;
                while let Some(item) = fragments.next().await {
                    match item {
                        Ok(text) => {
                            response.push_str(&text);
                            listening = self.emit(SessionEvent::Fragment(text), listening).await;
                        }
                        Err(e) => {
                            failure = Some(e.to_string());
                            break;
                        }
                    }
                }
                failure
            }
            Err(e) => Some(e.to_string()),
        };

        if let Some(reason) = failure {
            tracing::warn!(node_id = %node_id, error = %reason, received = response.len(), "generation stream failed");
            let text = if response.is_empty() {
                format!("Error calling Gemini API: {}", reason)
            } else {
                response
            };
            let summary = self.fallback_summary();
            return self.fail(text, summary, reason, listening).await;
        }

        // Finalizing
        let summary = self.derive_summary(&response).await;
        if let Err(e) = self.db.finalize_node(&self.node.owner_id, &node_id, &response, summary.as_deref()) {
            tracing::error!(node_id = %node_id, error = %e, "failed to persist response");
            return self.errored(Some(response), summary, e.reason(), listening).await;
        }

        let node = match self.db.get_node(&self.node.owner_id, &node_id) {
            Ok(Some(node)) => node,
            Ok(None) => {
                // Deleted by a concurrent edit after finalize
                let reason = GraphError::node_not_found(&node_id).reason();
                return self.errored(Some(response), summary, reason, listening).await;
            }
            Err(e) => return self.errored(Some(response), summary, e.reason(), listening).await,
        };

        tracing::info!(node_id = %node_id, chars = response.len(), "generation session done");
        self.emit(SessionEvent::Done(node.clone()), listening).await;
        SessionOutcome { node, state: SessionState::Done, error: None }
    }

    /// Send an event if the consumer is still there. Returns whether it is.
    async fn emit(&self, event: SessionEvent, listening: bool) -> bool {
        if !listening {
            return false;
        }
        if self.tx.send(event).await.is_err() {
            tracing::debug!(node_id = %self.node.id, "event consumer went away, continuing without it");
            return false;
        }
        true
    }

    /// Root turns get a title, other turns a summary of this exchange alone.
    async fn derive_summary(&self, response: &str) -> Option<String> {
        let prompt = &self.node.user_prompt;
        if self.node.is_root() {
            match self.model.title_for(prompt, response).await {
                Ok(title) => Some(title),
                Err(e) => {
                    tracing::warn!(node_id = %self.node.id, error = %e, "title generation failed, using prompt preview");
                    self.fallback_summary()
                }
            }
        } else {
            match self.model.summarize(None, prompt, Some(response)).await {
                Ok(summary) if !summary.trim().is_empty() => Some(summary),
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!(node_id = %self.node.id, error = %e, "summary generation failed");
                    None
                }
            }
        }
    }

    fn fallback_summary(&self) -> Option<String> {
        self.node
            .is_root()
            .then(|| preview(&self.node.user_prompt, FALLBACK_PREVIEW_CHARS))
    }

    /// Persist what we have and end in `Errored`.
    async fn fail(&self, text: String, summary: Option<String>, reason: String, listening: bool) -> SessionOutcome {
        if let Err(e) = self.db.finalize_node(&self.node.owner_id, &self.node.id, &text, summary.as_deref()) {
            tracing::error!(node_id = %self.node.id, error = %e, "failed to persist partial response");
        }
        self.errored(Some(text), summary, reason, listening).await
    }

    async fn errored(&self, text: Option<String>, summary: Option<String>, reason: String, listening: bool) -> SessionOutcome {
        self.emit(SessionEvent::Error { reason: reason.clone() }, listening).await;

        let node = match self.db.get_node(&self.node.owner_id, &self.node.id) {
            Ok(Some(node)) => node,
            _ => Node { ai_response: text, summary, ..self.node.clone() },
        };
        SessionOutcome { node, state: SessionState::Errored, error: Some(reason) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai_client::scripted::ScriptedModel;
    use crate::ai_client::DEFAULT_MODEL;
    use crate::db::{CitationSource, ReferenceType};

    const OWNER: &str = "owner";

    struct Fixture {
        db: Arc<Database>,
        model: Arc<ScriptedModel>,
        session: GenerationSession,
    }

    fn fixture(model: ScriptedModel) -> Fixture {
        let db = Arc::new(Database::in_memory().unwrap());
        let resolver = Arc::new(TreeResolver::new(db.clone()));
        let model = Arc::new(model);
        let session = GenerationSession::new(resolver, model.clone(), DEFAULT_MODEL);
        Fixture { db, model, session }
    }

    fn ask(prompt: &str, parent: Option<&str>) -> GenerationRequest {
        GenerationRequest {
            user_prompt: prompt.into(),
            parent_id: parent.map(str::to_string),
            ..Default::default()
        }
    }

    async fn collect(mut events: mpsc::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Some(event) = events.recv().await {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn root_session_streams_then_titles() {
        let f = fixture(ScriptedModel::new(&["Hel", "lo", "!"]));
        let handle = f.session.start(OWNER, ask("Hi", None)).unwrap();
        let node_id = handle.node_id.clone();

        let events = collect(handle.events).await;
        let outcome = handle.task.await.unwrap();

        assert!(matches!(&events[0], SessionEvent::Created { node_id: id, .. } if *id == node_id));
        assert_eq!(events[1], SessionEvent::Fragment("Hel".into()));
        assert_eq!(events[3], SessionEvent::Fragment("!".into()));
        match &events[4] {
            SessionEvent::Done(node) => {
                assert_eq!(node.ai_response.as_deref(), Some("Hello!"));
                assert_eq!(node.summary.as_deref(), Some("Scripted Title"));
            }
            other => panic!("expected Done, got {:?}", other),
        }
        assert_eq!(events.len(), 5);
        assert_eq!(outcome.state, SessionState::Done);

        let stored = f.db.get_node(OWNER, &node_id).unwrap().unwrap();
        assert_eq!(stored.ai_response.as_deref(), Some("Hello!"));
        assert_eq!(stored.model_name(), Some(DEFAULT_MODEL));
        assert!(f.model.calls().iter().any(|c| c == "title:Hi"));
    }

    #[tokio::test]
    async fn child_session_sends_context_and_summarizes_only_this_turn() {
        let f = fixture(ScriptedModel::new(&["Sure."]));
        let root = f.session.run_to_completion(OWNER, ask("Hi", None)).await.unwrap();

        let child = f
            .session
            .run_to_completion(OWNER, ask("More", Some(&root.node.id)))
            .await
            .unwrap();

        assert_eq!(child.state, SessionState::Done);
        assert_eq!(child.node.parent_id.as_deref(), Some(root.node.id.as_str()));
        assert_eq!(child.node.summary.as_deref(), Some("scripted summary"));

        let calls = f.model.calls();
        let stream_call = calls.iter().filter(|c| c.starts_with("stream:")).last().unwrap();
        assert!(stream_call.contains("Previous Conversation Summary:\nRecent Conversation:\nUser: Hi\nAI: Sure."));
        assert!(stream_call.ends_with("User Message:\nMore"));
        assert!(calls.iter().any(|c| c == "summarize:-:More"));
    }

    #[tokio::test]
    async fn blank_prompt_is_rejected_before_creation() {
        let f = fixture(ScriptedModel::new(&["x"]));
        let err = f.session.start(OWNER, ask("   ", None)).err().unwrap();
        assert_eq!(err.kind(), "ValidationError");
        assert_eq!(f.db.count_nodes(OWNER).unwrap(), 0);
    }

    #[tokio::test]
    async fn missing_parent_creates_nothing() {
        let f = fixture(ScriptedModel::new(&["x"]));
        let err = f.session.start(OWNER, ask("Hi", Some("nonexistent"))).err().unwrap();
        assert_eq!(err.kind(), "NotFound");
        assert_eq!(f.db.count_nodes(OWNER).unwrap(), 0);
        assert!(f.model.calls().is_empty());
    }

    #[tokio::test]
    async fn unknown_folder_is_not_found() {
        let f = fixture(ScriptedModel::new(&["x"]));
        let mut request = ask("Hi", None);
        request.folder_id = Some("no-folder".into());
        let err = f.session.start(OWNER, request).err().unwrap();
        assert!(err.is_not_found());
        assert_eq!(f.db.count_nodes(OWNER).unwrap(), 0);
    }

    #[tokio::test]
    async fn stream_failure_persists_partial_text() {
        let mut model = ScriptedModel::new(&["partial ", "answer", "never sent"]);
        model.fail_after = Some(2);
        let f = fixture(model);

        let handle = f.session.start(OWNER, ask("Hi", None)).unwrap();
        let events = collect(handle.events).await;
        let outcome = handle.task.await.unwrap();

        assert_eq!(outcome.state, SessionState::Errored);
        assert!(matches!(events.last(), Some(SessionEvent::Error { .. })));
        assert!(!events.iter().any(|e| matches!(e, SessionEvent::Done(_))));

        let stored = f.db.get_node(OWNER, &outcome.node.id).unwrap().unwrap();
        assert_eq!(stored.ai_response.as_deref(), Some("partial answer"));
        assert_eq!(stored.summary.as_deref(), Some("Hi"));
    }

    #[tokio::test]
    async fn refused_stream_leaves_error_flavoured_response() {
        let mut model = ScriptedModel::new(&[]);
        model.refuse_stream = true;
        let f = fixture(model);

        let outcome = f.session.run_to_completion(OWNER, ask("Hi", None)).await.unwrap();
        assert_eq!(outcome.state, SessionState::Errored);
        let stored = f.db.get_node(OWNER, &outcome.node.id).unwrap().unwrap();
        assert!(stored.ai_response.unwrap().starts_with("Error calling Gemini API:"));
        assert!(outcome.error.unwrap().contains("overloaded"));
    }

    #[tokio::test]
    async fn summary_failures_fall_back() {
        let mut model = ScriptedModel::new(&["ok"]);
        model.title = None;
        model.summary = None;
        let f = fixture(model);

        let long_prompt = "a very long opening question that keeps going well past fifty characters";
        let root = f.session.run_to_completion(OWNER, ask(long_prompt, None)).await.unwrap();
        assert_eq!(root.state, SessionState::Done);
        assert_eq!(root.node.summary, Some(preview(long_prompt, FALLBACK_PREVIEW_CHARS)));

        let child = f.session.run_to_completion(OWNER, ask("next", Some(&root.node.id))).await.unwrap();
        assert_eq!(child.state, SessionState::Done);
        assert!(child.node.summary.is_none());
    }

    #[tokio::test]
    async fn dropped_consumer_does_not_stop_the_session() {
        let fragments: Vec<String> = (0..100).map(|i| format!("{} ", i)).collect();
        let refs: Vec<&str> = fragments.iter().map(String::as_str).collect();
        let f = fixture(ScriptedModel::new(&refs));

        let mut handle = f.session.start(OWNER, ask("Count", None)).unwrap();
        let first = handle.events.recv().await.unwrap();
        assert!(matches!(first, SessionEvent::Created { .. }));
        drop(handle.events);

        let outcome = handle.task.await.unwrap();
        assert_eq!(outcome.state, SessionState::Done);
        let stored = f.db.get_node(OWNER, &outcome.node.id).unwrap().unwrap();
        assert!(stored.ai_response.unwrap().ends_with("99 "));
    }

    #[tokio::test]
    async fn metadata_model_is_used_and_citations_kept() {
        let f = fixture(ScriptedModel::new(&["fine"]));
        let request = GenerationRequest {
            user_prompt: "Quote check".into(),
            model_metadata: serde_json::json!({"model": "gemini-2.5-pro", "temperature": 0.2}),
            citations: vec![
                Citation { text: "same".into(), source_node_id: "a".into(), source: CitationSource::User },
                Citation { text: "same".into(), source_node_id: "b".into(), source: CitationSource::Ai },
            ],
            references: vec![Reference { id: "gone".into(), ref_type: ReferenceType::Chat, name: None }],
            ..Default::default()
        };

        let handle = f.session.start(OWNER, request).unwrap();
        let events = collect(handle.events).await;
        let outcome = handle.task.await.unwrap();

        match &events[0] {
            SessionEvent::Created { skipped_references, .. } => assert_eq!(skipped_references.len(), 1),
            other => panic!("expected Created, got {:?}", other),
        }
        assert_eq!(outcome.node.model_name(), Some("gemini-2.5-pro"));
        assert_eq!(outcome.node.model_metadata["temperature"], 0.2);
        assert_eq!(outcome.node.citations.len(), 1);
        assert_eq!(outcome.node.citations[0].source, CitationSource::Ai);
        assert_eq!(outcome.node.references.len(), 1);
        assert!(f.model.calls().iter().any(|c| c.starts_with("stream:gemini-2.5-pro:")));
    }

    #[test]
    fn request_parses_wire_names() {
        let body = r#"{"userPrompt":"Hi","parentId":"p","modelMetadata":{"model":"m"},"references":[{"id":"f","type":"folder"}]}"#;
        let request: GenerationRequest = serde_json::from_str(body).unwrap();
        assert_eq!(request.user_prompt, "Hi");
        assert_eq!(request.parent_id.as_deref(), Some("p"));
        assert!(request.folder_id.is_none());
        assert_eq!(request.references[0].ref_type, ReferenceType::Folder);
    }
}
