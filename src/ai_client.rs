//! Gemini API client for generation, summaries and titles
//!
//! The engine only talks to [`ModelClient`]; [`GeminiClient`] is the REST
//! implementation used by the binaries.

use async_trait::async_trait;
use futures::stream::{BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::GraphError;
use crate::settings;

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-lite";

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(thiserror::Error, Debug)]
pub enum ModelError {
    #[error("GEMINI_API_KEY is not set")]
    MissingApiKey,

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Gemini API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("Gemini API error: {0}")]
    Payload(String),

    #[error("model returned no text")]
    Empty,
}

impl From<ModelError> for GraphError {
    fn from(e: ModelError) -> Self {
        GraphError::Upstream(e.to_string())
    }
}

/// Lazily produced response fragments. Finite and not restartable.
pub type FragmentStream = BoxStream<'static, Result<String, ModelError>>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelInfo {
    pub name: String,
    #[serde(rename = "displayName")]
    pub display_name: String,
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Full response in one call.
    async fn generate(&self, prompt: &str, model: &str, context: Option<&str>) -> Result<String, ModelError>;

    /// Response as a sequence of text fragments.
    async fn stream(&self, prompt: &str, model: &str, context: Option<&str>) -> Result<FragmentStream, ModelError>;

    /// Summary of one exchange, optionally folded into a prior summary.
    async fn summarize(&self, prior: Option<&str>, prompt: &str, response: Option<&str>) -> Result<String, ModelError>;

    /// Short conversation title.
    async fn title_for(&self, prompt: &str, response: &str) -> Result<String, ModelError>;

    async fn list_models(&self) -> Result<Vec<ModelInfo>, ModelError>;
}

/// Prompt actually sent to the model: the assembled context, if any, followed
/// by the user's message.
pub fn compose_prompt(prompt: &str, context: Option<&str>) -> String {
    match context.filter(|c| !c.trim().is_empty()) {
        Some(context) => format!("Previous Conversation Summary:\n{}\n\nUser Message:\n{}", context, prompt),
        None => prompt.to_string(),
    }
}

fn summary_prompt(prior: Option<&str>, prompt: &str, response: Option<&str>) -> String {
    format!(
        "You are a helpful assistant that summarizes conversation history.\n\n\
         Current Summary:\n{}\n\n\
         New Exchange:\nUser: {}\nAI: {}\n\n\
         Please provide a concise updated summary of the conversation up to this point, \
         incorporating the new exchange. Keep it brief but preserve key details and context.",
        prior.unwrap_or("No previous summary."),
        prompt,
        response.unwrap_or("No response yet."),
    )
}

fn title_prompt(prompt: &str, response: &str) -> String {
    let response = crate::utils::safe_truncate(response, 2000);
    format!(
        "Write a short title (at most 6 words) for a conversation that begins with this exchange.\n\n\
         User: {}\nAI: {}\n\n\
         Respond with only the title, no quotes or punctuation at the end.",
        prompt, response
    )
}

/// Strip quotes and trailing punctuation the model likes to add around titles.
fn clean_title(raw: &str) -> String {
    let line = raw.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    line.trim()
        .trim_start_matches("Title:")
        .trim()
        .trim_matches(|c| c == '"' || c == '\'' || c == '*')
        .trim_end_matches('.')
        .trim()
        .to_string()
}

// ============================================================================
// Gemini REST client
// ============================================================================

pub struct GeminiClient {
    http: reqwest::Client,
    api_key: Option<String>,
    summary_model: String,
}

impl GeminiClient {
    pub fn new(api_key: Option<String>, summary_model: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            summary_model: summary_model.into(),
        }
    }

    /// Key and summary model from settings (env vars first).
    pub fn from_settings() -> Self {
        Self::new(settings::get_api_key(), settings::get_summary_model())
    }

    fn key(&self) -> Result<&str, ModelError> {
        self.api_key.as_deref().map(str::trim).ok_or(ModelError::MissingApiKey)
    }

    fn request_body(text: &str) -> Value {
        json!({
            "contents": [{ "role": "user", "parts": [{ "text": text }] }]
        })
    }

    async fn post(&self, url: &str, body: &Value) -> Result<reqwest::Response, ModelError> {
        let response = self
            .http
            .post(url)
            .header("x-goog-api-key", self.key()?)
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Api { status, body });
        }
        Ok(response)
    }

    async fn generate_text(&self, text: &str, model: &str) -> Result<String, ModelError> {
        let url = format!("{}/models/{}:generateContent", API_BASE, model);
        let response = self.post(&url, &Self::request_body(text)).await?;
        let parsed: Value = response.json().await?;

        let text = extract_text(&parsed)?.concat();
        if text.trim().is_empty() {
            return Err(ModelError::Empty);
        }
        Ok(text)
    }
}

#[async_trait]
impl ModelClient for GeminiClient {
    async fn generate(&self, prompt: &str, model: &str, context: Option<&str>) -> Result<String, ModelError> {
        self.generate_text(&compose_prompt(prompt, context), model).await
    }

    async fn stream(&self, prompt: &str, model: &str, context: Option<&str>) -> Result<FragmentStream, ModelError> {
        let url = format!("{}/models/{}:streamGenerateContent?alt=sse", API_BASE, model);
        let body = Self::request_body(&compose_prompt(prompt, context));
        let response = self.post(&url, &body).await?;

        tracing::debug!(model = %model, "streaming generation started");
        Ok(sse_fragments(response.bytes_stream()).boxed())
    }

    async fn summarize(&self, prior: Option<&str>, prompt: &str, response: Option<&str>) -> Result<String, ModelError> {
        let text = self
            .generate_text(&summary_prompt(prior, prompt, response), &self.summary_model)
            .await?;
        Ok(text.trim().to_string())
    }

    async fn title_for(&self, prompt: &str, response: &str) -> Result<String, ModelError> {
        let raw = self.generate_text(&title_prompt(prompt, response), &self.summary_model).await?;
        let title = clean_title(&raw);
        if title.is_empty() {
            return Err(ModelError::Empty);
        }
        Ok(title)
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, ModelError> {
        let mut models = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .http
                .get(format!("{}/models", API_BASE))
                .header("x-goog-api-key", self.key()?)
                .query(&[("pageSize", "1000")]);
            if let Some(token) = page_token.as_deref() {
                request = request.query(&[("pageToken", token)]);
            }

            let response = request.send().await?;
            if !response.status().is_success() {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                return Err(ModelError::Api { status, body });
            }

            let page: Value = response.json().await?;
            models.extend(parse_models(&page));

            page_token = page
                .get("nextPageToken")
                .and_then(|t| t.as_str())
                .filter(|t| !t.is_empty())
                .map(str::to_string);
            if page_token.is_none() {
                break;
            }
        }

        Ok(models)
    }
}

/// Text parts of the first candidate. An `error` object in the payload is
/// reported as a failure.
fn extract_text(parsed: &Value) -> Result<Vec<String>, ModelError> {
    if let Some(error) = parsed.get("error") {
        let msg = error
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("Unknown error");
        return Err(ModelError::Payload(msg.to_string()));
    }

    let parts = parsed
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array());

    Ok(parts
        .map(|parts| {
            parts
                .iter()
                // Skip thought summaries, keep only answer text
                .filter(|p| !p.get("thought").and_then(|t| t.as_bool()).unwrap_or(false))
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default())
}

fn parse_models(page: &Value) -> Vec<ModelInfo> {
    let Some(models) = page.get("models").and_then(|m| m.as_array()) else {
        return Vec::new();
    };

    models
        .iter()
        .filter(|m| {
            m.get("supportedGenerationMethods")
                .and_then(|s| s.as_array())
                .map(|methods| methods.iter().any(|x| x.as_str() == Some("generateContent")))
                .unwrap_or(false)
        })
        .filter_map(|m| {
            let full = m.get("name")?.as_str()?;
            let name = full.strip_prefix("models/").unwrap_or(full).to_string();
            let display_name = m
                .get("displayName")
                .and_then(|d| d.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| name.clone());
            Some(ModelInfo { name, display_name })
        })
        .collect()
}

/// Turn a server-sent-events byte stream into text fragments. Lines may be
/// split across chunks; only `data: ` lines carry payloads.
fn sse_fragments<S, B, E>(bytes: S) -> impl Stream<Item = Result<String, ModelError>> + Send + 'static
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Send + 'static,
    ModelError: From<E>,
{
    async_stream::stream! {
        let mut bytes = Box::pin(bytes);
        let mut buffer = String::new();

        while let Some(chunk) = bytes.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield Err(ModelError::from(e));
                    return;
                }
            };
            buffer.push_str(&String::from_utf8_lossy(chunk.as_ref()));

            while let Some(line_end) = buffer.find('\n') {
                let line = buffer[..line_end].trim().to_string();
                buffer.drain(..=line_end);

                if let Some(data) = line.strip_prefix("data: ") {
                    match serde_json::from_str::<Value>(data).map_err(|e| ModelError::Payload(e.to_string())).and_then(|v| extract_text(&v)) {
                        Ok(texts) => {
                            for text in texts {
                                yield Ok(text);
                            }
                        }
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }
            }
        }

        // Final event without a trailing newline
        if let Some(data) = buffer.trim().strip_prefix("data: ") {
            if let Ok(value) = serde_json::from_str::<Value>(data) {
                match extract_text(&value) {
                    Ok(texts) => {
                        for text in texts {
                            yield Ok(text);
                        }
                    }
                    Err(e) => yield Err(e),
                }
            }
        }
    }
}

// ============================================================================
// Scripted client for tests
// ============================================================================
