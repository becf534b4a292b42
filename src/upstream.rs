//! # Upstream provider client
//!
//! Talks to an OpenAI-compatible chat-completions provider (OpenRouter by
//! default) over `reqwest`.
//!
//! - [`CompletionProvider`] is the seam the service depends on, so tests and
//!   alternative providers can stand in for the HTTP client.
//! - [`OpenRouterClient`] is the real implementation: streaming completions
//!   (`stream: true`, decoded by [`crate::frame`]), whole completions, and the
//!   `/models` catalog.
//!
//! Failures before the first byte (network, non-success status) surface as
//! [`RelayError::ProviderUnavailable`]. Once a stream is open, every failure
//! arrives *inside* the [`DeltaStream`] as a single
//! [`RelayError::ProviderStream`] item, after which the stream ends.

use async_stream::stream;
use async_trait::async_trait;
use futures::{StreamExt, stream::BoxStream};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::{pin::pin, time::Duration};
use tracing::{debug, warn};

use crate::{
    error::{RelayError, Result},
    frame::{FrameEvent, MalformedFrame, parse_frames},
    models::NewAiModel,
};

/// Text deltas of one streaming completion, in arrival order.
pub type DeltaStream = BoxStream<'static, Result<String>>;

/// Speaker of one turn in the upstream conversation.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    System,
    User,
    Assistant,
}

/// One entry of the `messages` array sent upstream.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ChatTurn {
    pub role: TurnRole,
    pub content: String,
}

impl ChatTurn {
    pub fn new(role: TurnRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Optional sampling parameters, passed through untouched.
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq)]
pub struct GenerationOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

/// Everything the provider needs for one completion.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    /// Provider-facing model identifier.
    pub model: String,
    pub messages: Vec<ChatTurn>,
    pub options: GenerationOptions,
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [ChatTurn],
    stream: bool,
    #[serde(flatten)]
    options: GenerationOptions,
}

/// Outcome of a whole (non-streaming) completion.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// The assistant's text. May be empty.
    Content(String),
    /// The provider answered with an `error` object in the body.
    Rejected { message: String, rate_limited: bool },
}

/// Provider contract used by the chat service.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Open a streaming completion.
    ///
    /// Resolves once the provider has accepted the request; text then
    /// arrives through the returned stream.
    async fn open_stream(&self, request: &CompletionRequest) -> Result<DeltaStream>;

    /// Request a whole completion.
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion>;

    /// Fetch the provider's model catalog.
    async fn list_models(&self) -> Result<Vec<ProviderModel>>;
}

/// HTTP client for OpenRouter and compatible providers.
#[derive(Clone, Debug)]
pub struct OpenRouterClient {
    http: Client,
    api_base: String,
    api_key: String,
}

impl OpenRouterClient {
    /// Creates a client for `api_base` authenticated with `api_key`.
    ///
    /// # Errors
    /// [`RelayError::Config`] if either value is blank or the HTTP client
    /// cannot be built.
    pub fn new(api_base: &str, api_key: &str) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(RelayError::Config("provider API key is not set".to_string()));
        }
        if api_base.trim().is_empty() {
            return Err(RelayError::Config("provider base URL is not set".to_string()));
        }

        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| RelayError::Config(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.api_base)
    }

    async fn post_completion(&self, request: &CompletionRequest, stream: bool) -> Result<reqwest::Response> {
        let body = WireRequest {
            model: &request.model,
            messages: &request.messages,
            stream,
            options: request.options,
        };
        debug!(
            model = %request.model,
            turns = request.messages.len(),
            stream,
            "Sending completion request"
        );

        let response = self
            .http
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| RelayError::ProviderUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::ProviderUnavailable(format!(
                "provider answered {status}"
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl CompletionProvider for OpenRouterClient {
    async fn open_stream(&self, request: &CompletionRequest) -> Result<DeltaStream> {
        let response = self.post_completion(request, true).await?;

        let deltas = stream! {
            let mut frames = pin!(parse_frames(response.bytes_stream()));
            while let Some(event) = frames.next().await {
                match event {
                    Ok(FrameEvent::Delta(text)) => yield Ok(text),
                    Ok(FrameEvent::Terminal) => return,
                    Ok(FrameEvent::EmbeddedError(message)) => {
                        yield Err(RelayError::ProviderStream(message));
                        return;
                    }
                    Ok(FrameEvent::Malformed(MalformedFrame::StreamEndedEarly)) => {
                        yield Err(RelayError::ProviderStream(
                            "stream ended unexpectedly".to_string(),
                        ));
                        return;
                    }
                    Ok(FrameEvent::Malformed(MalformedFrame::InvalidPayload(detail))) => {
                        warn!("Skipping malformed upstream frame: {}", detail);
                    }
                    Ok(FrameEvent::Malformed(MalformedFrame::LineTooLong { limit })) => {
                        warn!("Skipping upstream line longer than {} bytes", limit);
                    }
                    Err(e) => {
                        yield Err(RelayError::ProviderStream(e.to_string()));
                        return;
                    }
                }
            }
        };

        Ok(deltas.boxed())
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let response = self.post_completion(request, false).await?;
        let body: CompletionBody = response
            .json()
            .await
            .map_err(|e| RelayError::ProviderUnavailable(format!("unreadable response: {e}")))?;
        Ok(body.into_completion())
    }

    async fn list_models(&self) -> Result<Vec<ProviderModel>> {
        let response = self
            .http
            .get(format!("{}/models", self.api_base))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| RelayError::ProviderUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::ProviderUnavailable(format!(
                "model catalog answered {status}"
            )));
        }

        let listing: ModelListing = response
            .json()
            .await
            .map_err(|e| RelayError::ProviderUnavailable(format!("unreadable model catalog: {e}")))?;
        debug!("Provider lists {} models", listing.data.len());
        Ok(listing.data)
    }
}

#[derive(Deserialize, Debug, Default)]
struct CompletionBody {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    error: Option<BodyError>,
}

#[derive(Deserialize, Debug)]
struct CompletionChoice {
    #[serde(default)]
    message: Option<CompletionMessage>,
}

#[derive(Deserialize, Debug)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct BodyError {
    #[serde(default)]
    code: Option<serde_json::Value>,
    #[serde(default)]
    message: Option<String>,
}

impl BodyError {
    fn is_rate_limit(&self) -> bool {
        match &self.code {
            Some(serde_json::Value::Number(n)) => n.as_i64() == Some(429),
            Some(serde_json::Value::String(s)) => s.trim() == "429",
            _ => false,
        }
    }
}

impl CompletionBody {
    fn into_completion(self) -> Completion {
        if let Some(error) = self.error {
            let rate_limited = error.is_rate_limit();
            return Completion::Rejected {
                message: error
                    .message
                    .unwrap_or_else(|| "unknown provider error".to_string()),
                rate_limited,
            };
        }
        let content = self
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .and_then(|message| message.content)
            .unwrap_or_default();
        Completion::Content(content)
    }
}

#[derive(Deserialize, Debug)]
struct ModelListing {
    data: Vec<ProviderModel>,
}

/// One entry of the provider's `/models` catalog.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ProviderModel {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub context_length: Option<i64>,
    #[serde(default)]
    pub pricing: Option<ModelPricing>,
    #[serde(default)]
    pub architecture: Option<ModelArchitecture>,
}

/// Per-token prices. The provider sends them as decimal strings.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ModelPricing {
    #[serde(default)]
    pub prompt: Option<serde_json::Value>,
    #[serde(default)]
    pub completion: Option<serde_json::Value>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ModelArchitecture {
    #[serde(default)]
    pub modality: Option<String>,
    #[serde(default)]
    pub input_modalities: Vec<String>,
}

fn price(value: &Option<serde_json::Value>) -> Option<f64> {
    match value {
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        _ => None,
    }
}

impl ProviderModel {
    /// Map a catalog entry onto an [`NewAiModel`] row.
    pub fn to_new_model(&self) -> NewAiModel {
        let (prompt, completion) = self
            .pricing
            .as_ref()
            .map(|p| (price(&p.prompt), price(&p.completion)))
            .unwrap_or((None, None));

        let can_recognize_images = self.architecture.as_ref().is_some_and(|arch| {
            arch.input_modalities.iter().any(|m| m == "image")
                || arch
                    .modality
                    .as_deref()
                    .is_some_and(|m| m == "multimodal" || m.split("->").next().is_some_and(|input| input.contains("image")))
        });

        NewAiModel {
            model_id: self.id.clone(),
            display_name: self.name.clone().unwrap_or_else(|| self.id.clone()),
            description: self.description.clone(),
            is_free: prompt == Some(0.0) && completion == Some(0.0),
            price_per_m_token: prompt.unwrap_or(0.0) * 1_000_000.0,
            max_context_length: self
                .context_length
                .and_then(|len| i32::try_from(len).ok())
                .unwrap_or(0),
            can_recognize_images,
        }
    }
}
