use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::analysis::{AnalysisFailure, AnalysisRequest, AnalysisResult, FailureKind};
use crate::config::{ApiConfig, ProviderKind};
use crate::parse::parse_reply;
use crate::prompt;
use crate::state::{Mode, Selection};

/// Shortest key that is considered a real credential during auto-detection.
const MIN_KEY_LEN: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("No API key configured for {0}. Add it to companion.toml or the environment.")]
    MissingKey(ProviderKind),
    #[error("Request timed out after {0}s. Try again.")]
    Timeout(u64),
    #[error("Cannot connect to local model at {0}. Is Ollama/LM Studio running?")]
    LocalUnreachable(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("{0}")]
    Status(String),
    #[error("Unexpected API response.")]
    BadResponse,
    #[error("Empty response from API.")]
    Empty,
}

/// The provider and model an analysis runs against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub provider: ProviderKind,
    pub model: String,
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

/// Boundary between the orchestrator and whatever answers analysis requests.
/// Implementations report every failure as a populated [`AnalysisFailure`].
#[async_trait]
pub trait Analyzer: Send + Sync {
    fn resolve(&self, selection: &Selection) -> Option<Target>;

    async fn analyze(
        &self,
        target: &Target,
        request: AnalysisRequest,
        mode: Mode,
    ) -> Result<AnalysisResult, AnalysisFailure>;
}

// --- OpenAI-compatible request/response structs ---

#[derive(Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<OaiMessage>,
    max_tokens: u32,
    temperature: f32,
    response_format: ResponseFormat,
    stream: bool,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct OaiMessage {
    role: &'static str,
    content: OaiContent,
}

#[derive(Serialize)]
#[serde(untagged)]
enum OaiContent {
    Text(String),
    Parts(Vec<OaiContentPart>),
}

#[derive(Serialize)]
#[serde(tag = "type")]
enum OaiContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

// --- Gemini request/response structs ---

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    system_instruction: SystemInstruction,
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Serialize)]
struct Content {
    role: &'static str,
    parts: Vec<Part>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Part {
    Text { text: String },
    InlineData { inline_data: InlineData },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
    temperature: f32,
    response_mime_type: &'static str,
}

#[derive(Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

fn status_message(code: u16) -> String {
    match code {
        400 => "Bad request. The API rejected the payload.".into(),
        401 | 403 => "Invalid API key. Check companion.toml or the environment.".into(),
        429 => "API rate limit reached. Wait a moment and try again.".into(),
        500 | 502 | 503 => "API server error. Try again.".into(),
        code => format!("API error (HTTP {code})."),
    }
}

/// Uniform front for the configured vision providers.
pub struct Gateway {
    config: ApiConfig,
    client: reqwest::Client,
}

impl Gateway {
    pub fn new(config: ApiConfig) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { config, client }
    }

    fn credential(&self, kind: ProviderKind) -> Option<&str> {
        let key = match kind {
            ProviderKind::OpenAi => self.config.openai.key.trim(),
            ProviderKind::Gemini => self.config.gemini.key.trim(),
            ProviderKind::Local => return None,
        };
        (!key.is_empty()).then_some(key)
    }

    fn looks_valid(&self, kind: ProviderKind) -> bool {
        let Some(key) = self.credential(kind) else { return false };
        let prefix = match kind {
            ProviderKind::OpenAi => "sk-",
            ProviderKind::Gemini => "AIza",
            ProviderKind::Local => return false,
        };
        key.starts_with(prefix) && key.len() >= MIN_KEY_LEN
    }

    /// Local models need no key; remote ones need a non-empty one.
    pub fn is_usable(&self, kind: ProviderKind) -> bool {
        kind == ProviderKind::Local || self.credential(kind).is_some()
    }

    pub fn default_model(&self, kind: ProviderKind) -> &str {
        match kind {
            ProviderKind::OpenAi => &self.config.openai.model,
            ProviderKind::Gemini => &self.config.gemini.model,
            ProviderKind::Local => &self.config.local.model,
        }
    }

    fn usable_target(&self, kind: ProviderKind, model: Option<String>) -> Option<Target> {
        if !self.is_usable(kind) {
            warn!("Provider {kind} has no API key, skipping");
            return None;
        }
        Some(Target {
            provider: kind,
            model: model.unwrap_or_else(|| self.default_model(kind).to_string()),
        })
    }

    async fn send(&self, target: &Target, request: &AnalysisRequest, mode: Mode) -> Result<String, GatewayError> {
        match target.provider {
            ProviderKind::OpenAi => {
                let key = self
                    .credential(ProviderKind::OpenAi)
                    .ok_or(GatewayError::MissingKey(ProviderKind::OpenAi))?;
                self.send_chat_completion(&self.config.openai.endpoint, Some(key), target, request, mode)
                    .await
            }
            ProviderKind::Local => {
                self.send_chat_completion(&self.config.local.endpoint, None, target, request, mode)
                    .await
            }
            ProviderKind::Gemini => {
                let key = self
                    .credential(ProviderKind::Gemini)
                    .ok_or(GatewayError::MissingKey(ProviderKind::Gemini))?;
                self.send_gemini(key, target, request, mode).await
            }
        }
    }

    async fn send_chat_completion(
        &self,
        endpoint: &str,
        key: Option<&str>,
        target: &Target,
        request: &AnalysisRequest,
        mode: Mode,
    ) -> Result<String, GatewayError> {
        let mut parts = Vec::with_capacity(request.images.len() + 1);
        parts.push(OaiContentPart::Text {
            text: prompt::user_prompt(
                &request.prompt,
                request.previous_context.as_deref(),
                request.images.len(),
            ),
        });
        parts.extend(request.images.iter().map(|image| OaiContentPart::ImageUrl {
            image_url: ImageUrl {
                url: image.data_url(),
            },
        }));

        let body = ChatCompletionRequest {
            model: target.model.clone(),
            messages: vec![
                OaiMessage {
                    role: "system",
                    content: OaiContent::Text(prompt::system_prompt(mode).into()),
                },
                OaiMessage {
                    role: "user",
                    content: OaiContent::Parts(parts),
                },
            ],
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            response_format: ResponseFormat { kind: "json_object" },
            stream: false,
        };

        let mut builder = self
            .client
            .post(endpoint)
            .header("content-type", "application/json")
            .json(&body);
        if let Some(key) = key {
            builder = builder.bearer_auth(key);
        }

        let local = target.provider == ProviderKind::Local;
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout(self.config.timeout_secs)
            } else if local && e.is_connect() {
                GatewayError::LocalUnreachable(endpoint.to_string())
            } else {
                GatewayError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            debug!("{} replied HTTP {status}: {text}", target.provider);
            return Err(GatewayError::Status(status_message(status.as_u16())));
        }

        let resp: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|_| GatewayError::BadResponse)?;

        resp.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|text| !text.trim().is_empty())
            .ok_or(GatewayError::Empty)
    }

    async fn send_gemini(
        &self,
        key: &str,
        target: &Target,
        request: &AnalysisRequest,
        mode: Mode,
    ) -> Result<String, GatewayError> {
        let mut parts = Vec::with_capacity(request.images.len() + 1);
        parts.push(Part::Text {
            text: prompt::user_prompt(
                &request.prompt,
                request.previous_context.as_deref(),
                request.images.len(),
            ),
        });
        parts.extend(request.images.iter().map(|image| Part::InlineData {
            inline_data: InlineData {
                mime_type: image.mime_type.to_string(),
                data: image.data.clone(),
            },
        }));

        let body = GeminiRequest {
            system_instruction: SystemInstruction {
                parts: vec![Part::Text {
                    text: prompt::system_prompt(mode).into(),
                }],
            },
            contents: vec![Content { role: "user", parts }],
            generation_config: GenerationConfig {
                max_output_tokens: self.config.max_tokens,
                temperature: self.config.temperature,
                response_mime_type: "application/json",
            },
        };

        let url = format!(
            "{}/models/{}:generateContent",
            self.config.gemini.endpoint.trim_end_matches('/'),
            target.model
        );

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Timeout(self.config.timeout_secs)
                } else {
                    GatewayError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::Status(status_message(status.as_u16())));
        }

        let body: GeminiResponse = response
            .json()
            .await
            .map_err(|_| GatewayError::BadResponse)?;

        let text = body
            .candidates
            .into_iter()
            .flat_map(|c| c.content.parts)
            .filter_map(|p| p.text)
            .collect::<Vec<_>>()
            .join("\n");

        if text.trim().is_empty() {
            Err(GatewayError::Empty)
        } else {
            Ok(text)
        }
    }
}

#[async_trait]
impl Analyzer for Gateway {
    /// Explicit selection, then the configured default, then the first
    /// provider whose key looks real.
    fn resolve(&self, selection: &Selection) -> Option<Target> {
        if let Some(kind) = selection.provider {
            if let Some(target) = self.usable_target(kind, selection.model.clone()) {
                return Some(target);
            }
        }
        if let Some(kind) = self.config.provider {
            let model = selection.model.clone().or_else(|| self.config.model.clone());
            if let Some(target) = self.usable_target(kind, model) {
                return Some(target);
            }
        }
        ProviderKind::ALL
            .into_iter()
            .find(|kind| self.looks_valid(*kind))
            .map(|kind| Target {
                provider: kind,
                model: selection
                    .model
                    .clone()
                    .unwrap_or_else(|| self.default_model(kind).to_string()),
            })
    }

    async fn analyze(
        &self,
        target: &Target,
        request: AnalysisRequest,
        mode: Mode,
    ) -> Result<AnalysisResult, AnalysisFailure> {
        if request.images.is_empty() {
            return Err(AnalysisFailure::new(
                FailureKind::NoImages,
                mode,
                "No screenshots to analyze.",
            ));
        }

        let started = Instant::now();
        let limit = Duration::from_secs(self.config.timeout_secs.max(1));
        info!(
            "Sending {} image(s) to {target} ({mode} mode, context: {})",
            request.images.len(),
            request.previous_context.is_some()
        );

        let reply = match tokio::time::timeout(limit, self.send(target, &request, mode)).await {
            Ok(reply) => reply,
            Err(_) => Err(GatewayError::Timeout(limit.as_secs())),
        };

        match reply {
            Ok(text) => {
                info!(
                    "{target} replied with {} chars in {:.1}s",
                    text.len(),
                    started.elapsed().as_secs_f32()
                );
                Ok(parse_reply(&text, mode))
            }
            Err(e) => {
                warn!("Analysis via {target} failed: {e}");
                Err(AnalysisFailure::classify(mode, &e.to_string()))
            }
        }
    }
}
