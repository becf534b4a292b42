//! # Chat service
//!
//! The operations a transport exposes: sending a message (whole or
//! streamed), creating, reading and branching chats, and the model catalog.
//!
//! The service is transport-agnostic. It depends only on the store traits and
//! on [`CompletionProvider`], so the HTTP server, the CLI and the tests all
//! drive the same code.
//!
//! ## Ordering of a streamed send
//!
//! 1. Validate the content.
//! 2. Resolve the chat (ownership-checked) and the model.
//! 3. Load the history that precedes the new message.
//! 4. Open the upstream stream.
//! 5. Persist the user message.
//! 6. Hand the upstream to [`spawn_relay`].
//!
//! Any failure in steps 1–4 leaves the database untouched.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::{
    config::RelayConfig,
    error::{RelayError, Result},
    models::{AiModel, Chat, Message, MessageStatus, ModelRef, NewMessage, Role},
    relay::{RelayHandle, StreamSession, failure_notice, spawn_relay},
    store::{BranchRequest, ChatStore, ChatWithMessages, MessageStore, ModelStore},
    upstream::{ChatTurn, Completion, CompletionProvider, CompletionRequest, GenerationOptions, TurnRole},
};

/// Longest accepted message, in characters.
pub const MAX_CONTENT_CHARS: usize = 100_000;

/// Persisted when the provider rejects a whole completion with a rate limit.
pub const RATE_LIMIT_NOTICE: &str = "The AI request limit has been reached. Please try again later.";

/// Persisted when the provider answers a whole completion with no text.
pub const EMPTY_REPLY_NOTICE: &str = "The AI model did not provide a response.";

/// Input of both send operations.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    pub content: String,
    #[serde(default, alias = "aiModelId")]
    pub model_id: Option<ModelRef>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default, alias = "max_tokens")]
    pub max_tokens: Option<u32>,
}

impl SendMessage {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    fn options(&self) -> GenerationOptions {
        GenerationOptions {
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }
}

/// Input of [`ChatService::branch_chat`].
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BranchChat {
    pub branched_after_message_id: i32,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub initial_message_content: Option<String>,
}

/// A streamed send that has been accepted.
#[derive(Debug)]
pub struct StreamStart {
    pub user_message: Message,
    pub model: AiModel,
    pub relay: RelayHandle,
}

/// Counts reported by [`ChatService::sync_models`].
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub fetched: usize,
    pub created: usize,
    pub updated: usize,
}

/// Service-level settings taken from [`RelayConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSettings {
    pub default_model: Option<String>,
    pub history_limit: i64,
}

impl From<&RelayConfig> for ServiceSettings {
    fn from(config: &RelayConfig) -> Self {
        Self {
            default_model: config.default_model.clone(),
            history_limit: config.history_limit,
        }
    }
}

/// Chat operations over a store and a provider.
#[derive(Clone)]
pub struct ChatService {
    chats: Arc<dyn ChatStore>,
    messages: Arc<dyn MessageStore>,
    models: Arc<dyn ModelStore>,
    provider: Arc<dyn CompletionProvider>,
    settings: ServiceSettings,
}

impl ChatService {
    /// Build a service over one store implementing every storage trait.
    pub fn new<S>(store: Arc<S>, provider: Arc<dyn CompletionProvider>, settings: ServiceSettings) -> Self
    where
        S: ChatStore + MessageStore + ModelStore + 'static,
    {
        Self {
            chats: store.clone(),
            messages: store.clone(),
            models: store,
            provider,
            settings,
        }
    }

    /// Request-style send: wait for the whole reply, persist both turns, and
    /// return the assistant message.
    ///
    /// # Errors
    /// - `BadRequest` / `NotFound` / `Misconfigured` from the checks.
    /// - `ProviderUnavailable` if the provider could not be reached or
    ///   answered with a non-success status. Nothing is written in that case.
    #[instrument(skip(self, request))]
    pub async fn send_message(&self, user_id: i32, chat_id: i32, request: SendMessage) -> Result<Message> {
        let content = validate_content(&request.content)?;
        let chat = self.chats.resolve_chat(chat_id, user_id).await?;
        let model = self.resolve_model(request.model_id.as_ref()).await?;
        let completion_request = self.build_request(&chat, &model, content, request.options()).await?;

        let completion = self.provider.complete(&completion_request).await?;
        let (reply, status) = match completion {
            Completion::Rejected { rate_limited: true, .. } => {
                warn!(chat_id, "provider rate limit reached");
                (RATE_LIMIT_NOTICE.to_string(), MessageStatus::UpstreamError)
            }
            Completion::Rejected { message, .. } => {
                warn!(chat_id, error = %message, "provider rejected completion");
                (failure_notice(&message), MessageStatus::UpstreamError)
            }
            Completion::Content(text) if text.trim().is_empty() => {
                (EMPTY_REPLY_NOTICE.to_string(), MessageStatus::UpstreamError)
            }
            Completion::Content(text) => (text, MessageStatus::Ok),
        };

        self.messages
            .create_message(NewMessage::user(chat.id, content))
            .await?;
        let ai_message = self
            .messages
            .create_message(NewMessage::ai(chat.id, model.id, reply, status))
            .await?;

        info!(chat_id, model = %model.model_id, status = %status, "reply stored");
        Ok(ai_message)
    }

    /// Stream-style send: open the upstream, persist the user turn, and start
    /// the relay.
    ///
    /// # Errors
    /// Everything that can fail before the relay starts. Once this returns
    /// `Ok`, failures are reported through the relay's outcome instead.
    #[instrument(skip(self, request))]
    pub async fn start_stream(&self, user_id: i32, chat_id: i32, request: SendMessage) -> Result<StreamStart> {
        let content = validate_content(&request.content)?;
        let chat = self.chats.resolve_chat(chat_id, user_id).await?;
        let model = self.resolve_model(request.model_id.as_ref()).await?;
        let completion_request = self.build_request(&chat, &model, content, request.options()).await?;

        let upstream = self.provider.open_stream(&completion_request).await?;
        let user_message = self
            .messages
            .create_message(NewMessage::user(chat.id, content))
            .await?;

        debug!(chat_id, model = %model.model_id, "upstream open, relaying");
        let relay = spawn_relay(
            self.messages.clone(),
            StreamSession::new(chat.id, model.clone()),
            upstream,
        );

        Ok(StreamStart {
            user_message,
            model,
            relay,
        })
    }

    pub async fn create_chat(&self, user_id: i32, title: Option<String>) -> Result<Chat> {
        let title = title.map(|t| t.trim().to_string()).filter(|t| !t.is_empty());
        self.chats.create_chat(user_id, title).await
    }

    /// The chat with its full transcript, oldest first.
    pub async fn get_chat(&self, user_id: i32, chat_id: i32) -> Result<ChatWithMessages> {
        let chat = self.chats.resolve_chat(chat_id, user_id).await?;
        let messages = self.messages.list_chat_messages(chat.id).await?;
        Ok(ChatWithMessages { chat, messages })
    }

    pub async fn branch_chat(&self, user_id: i32, chat_id: i32, request: BranchChat) -> Result<ChatWithMessages> {
        let initial_message = match request.initial_message_content {
            Some(content) if !content.trim().is_empty() => Some(validate_content(&content)?.to_string()),
            _ => None,
        };
        self.chats
            .branch_chat(BranchRequest {
                user_id,
                chat_id,
                after_message_id: request.branched_after_message_id,
                title: request.title.filter(|t| !t.trim().is_empty()),
                initial_message,
            })
            .await
    }

    pub async fn list_models(&self) -> Result<Vec<AiModel>> {
        self.models.list_models().await
    }

    /// Pull the provider catalog and upsert every entry.
    pub async fn sync_models(&self) -> Result<SyncReport> {
        let catalog = self.provider.list_models().await?;
        let mut report = SyncReport {
            fetched: catalog.len(),
            ..Default::default()
        };

        for entry in &catalog {
            if self.models.upsert_model(entry.to_new_model()).await? {
                report.created += 1;
            } else {
                report.updated += 1;
            }
        }

        info!(
            fetched = report.fetched,
            created = report.created,
            updated = report.updated,
            "model catalog synced"
        );
        Ok(report)
    }

    async fn resolve_model(&self, requested: Option<&ModelRef>) -> Result<AiModel> {
        if let Some(model_ref) = requested {
            return self
                .models
                .find_model(model_ref)
                .await?
                .ok_or_else(|| RelayError::NotFound(format!("AI model {model_ref} was not found.")));
        }

        let identifier = self
            .settings
            .default_model
            .as_deref()
            .ok_or_else(|| RelayError::Misconfigured("no default model configured".to_string()))?;
        self.models
            .find_model(&ModelRef::Identifier(identifier.to_string()))
            .await?
            .ok_or_else(|| {
                RelayError::Misconfigured(format!("default model '{identifier}' is not in the catalog"))
            })
    }

    /// Recent history followed by the new user turn.
    ///
    /// Failure placeholders are excluded by the store. A user turn left
    /// without an answer (failed or cancelled) is dropped, so roles alternate.
    async fn build_request(
        &self,
        chat: &Chat,
        model: &AiModel,
        content: &str,
        options: GenerationOptions,
    ) -> Result<CompletionRequest> {
        let history = self
            .messages
            .list_recent_messages(chat.id, Utc::now().naive_utc(), self.settings.history_limit)
            .await?;

        let mut turns: Vec<ChatTurn> = Vec::with_capacity(history.len() + 1);
        for msg in history {
            let role = match msg.role {
                Role::User => TurnRole::User,
                Role::Ai => TurnRole::Assistant,
            };
            push_turn(&mut turns, ChatTurn::new(role, msg.content));
        }
        push_turn(&mut turns, ChatTurn::new(TurnRole::User, content));

        Ok(CompletionRequest {
            model: model.model_id.clone(),
            messages: turns,
            options,
        })
    }
}

fn push_turn(turns: &mut Vec<ChatTurn>, turn: ChatTurn) {
    if turn.role == TurnRole::User && turns.last().is_some_and(|last| last.role == TurnRole::User) {
        turns.pop();
    }
    turns.push(turn);
}

fn validate_content(content: &str) -> Result<&str> {
    if content.trim().is_empty() {
        return Err(RelayError::BadRequest("Message content must not be empty.".to_string()));
    }
    if content.chars().count() > MAX_CONTENT_CHARS {
        return Err(RelayError::BadRequest(format!(
            "Message content must be at most {MAX_CONTENT_CHARS} characters."
        )));
    }
    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::NewAiModel,
        relay::{RelayEvent, SessionOutcome},
        store::SqliteStore,
        upstream::{DeltaStream, ProviderModel},
    };
    use async_trait::async_trait;
    use futures::{StreamExt, stream};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Provider double that replays canned answers and records requests.
    #[derive(Default)]
    struct ScriptedProvider {
        deltas: Vec<String>,
        completion: Option<Completion>,
        unavailable: bool,
        catalog: Vec<ProviderModel>,
        seen: Mutex<Vec<CompletionRequest>>,
    }

    #[async_trait]
    impl CompletionProvider for ScriptedProvider {
        async fn open_stream(&self, request: &CompletionRequest) -> Result<DeltaStream> {
            self.seen.lock().unwrap().push(request.clone());
            if self.unavailable {
                return Err(RelayError::ProviderUnavailable("refused".into()));
            }
            let items: Vec<Result<String>> = self.deltas.iter().cloned().map(Ok).collect();
            Ok(stream::iter(items).boxed())
        }

        async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
            self.seen.lock().unwrap().push(request.clone());
            if self.unavailable {
                return Err(RelayError::ProviderUnavailable("refused".into()));
            }
            Ok(self
                .completion
                .clone()
                .unwrap_or(Completion::Content(String::new())))
        }

        async fn list_models(&self) -> Result<Vec<ProviderModel>> {
            Ok(self.catalog.clone())
        }
    }

    async fn setup(provider: ScriptedProvider) -> (TempDir, Arc<SqliteStore>, Arc<ScriptedProvider>, ChatService) {
        let _ = tracing_subscriber::fmt::try_init();
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SqliteStore::open(dir.path().join("svc.db").to_str().unwrap()).unwrap());
        store
            .upsert_model(NewAiModel {
                model_id: "vendor/default".into(),
                display_name: "Default".into(),
                description: None,
                is_free: true,
                price_per_m_token: 0.0,
                max_context_length: 4096,
                can_recognize_images: false,
            })
            .await
            .unwrap();
        let provider = Arc::new(provider);
        let service = ChatService::new(
            store.clone(),
            provider.clone(),
            ServiceSettings {
                default_model: Some("vendor/default".into()),
                history_limit: 10,
            },
        );
        (dir, store, provider, service)
    }

    #[test]
    fn test_validate_content() {
        assert!(validate_content("hi").is_ok());
        assert!(matches!(validate_content("  \n"), Err(RelayError::BadRequest(_))));
        let long = "x".repeat(MAX_CONTENT_CHARS + 1);
        assert!(matches!(validate_content(&long), Err(RelayError::BadRequest(_))));
    }

    #[test]
    fn test_send_message_accepts_both_field_spellings() {
        let a: SendMessage =
            serde_json::from_str(r#"{"content":"hi","aiModelId":3,"max_tokens":50}"#).unwrap();
        assert_eq!(a.model_id, Some(ModelRef::Id(3)));
        assert_eq!(a.max_tokens, Some(50));

        let b: SendMessage =
            serde_json::from_str(r#"{"content":"hi","modelId":"vendor/x","maxTokens":5,"temperature":0.2}"#)
                .unwrap();
        assert_eq!(b.model_id, Some(ModelRef::Identifier("vendor/x".into())));
        assert_eq!(b.max_tokens, Some(5));
    }

    #[tokio::test]
    async fn test_send_message_persists_both_turns() {
        let (_dir, store, _provider, service) = setup(ScriptedProvider {
            completion: Some(Completion::Content("Hi there".into())),
            ..Default::default()
        })
        .await;
        let chat = service.create_chat(1, None).await.unwrap();

        let reply = service.send_message(1, chat.id, SendMessage::new("Hello")).await.unwrap();
        assert_eq!(reply.content, "Hi there");
        assert_eq!(reply.status, MessageStatus::Ok);

        let messages = store.list_chat_messages(chat.id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].id, reply.id);
    }

    #[tokio::test]
    async fn test_send_message_rate_limit_and_empty_reply_notices() {
        let (_dir, _store, _provider, service) = setup(ScriptedProvider {
            completion: Some(Completion::Rejected {
                message: "Rate limit exceeded".into(),
                rate_limited: true,
            }),
            ..Default::default()
        })
        .await;
        let chat = service.create_chat(1, None).await.unwrap();
        let reply = service.send_message(1, chat.id, SendMessage::new("q")).await.unwrap();
        assert_eq!(reply.content, RATE_LIMIT_NOTICE);
        assert_eq!(reply.status, MessageStatus::UpstreamError);

        let (_dir, _store, _provider, service) = setup(ScriptedProvider::default()).await;
        let chat = service.create_chat(1, None).await.unwrap();
        let reply = service.send_message(1, chat.id, SendMessage::new("q")).await.unwrap();
        assert_eq!(reply.content, EMPTY_REPLY_NOTICE);
    }

    #[tokio::test]
    async fn test_send_message_other_rejection_persists_generic_notice() {
        let (_dir, store, _provider, service) = setup(ScriptedProvider {
            completion: Some(Completion::Rejected {
                message: "model overloaded".into(),
                rate_limited: false,
            }),
            ..Default::default()
        })
        .await;
        let chat = service.create_chat(1, None).await.unwrap();

        let reply = service.send_message(1, chat.id, SendMessage::new("q")).await.unwrap();
        assert_eq!(reply.content, failure_notice("model overloaded"));
        assert_eq!(reply.status, MessageStatus::UpstreamError);

        let stored = store.list_chat_messages(chat.id).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].status, MessageStatus::UpstreamError);
    }

    #[tokio::test]
    async fn test_sync_models_counts_created_and_updated() {
        let entry = |id: &str, name: &str| ProviderModel {
            id: id.into(),
            name: Some(name.into()),
            description: None,
            context_length: Some(32_000),
            pricing: None,
            architecture: None,
        };
        let (_dir, store, _provider, service) = setup(ScriptedProvider {
            catalog: vec![
                entry("vendor/default", "Default v2"),
                entry("vendor/new-a", "New A"),
                entry("vendor/new-b", "New B"),
            ],
            ..Default::default()
        })
        .await;

        let report = service.sync_models().await.unwrap();
        assert_eq!(
            report,
            SyncReport {
                fetched: 3,
                created: 2,
                updated: 1,
            }
        );

        let renamed = store
            .find_model(&ModelRef::Identifier("vendor/default".into()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(renamed.display_name, "Default v2");
        assert_eq!(renamed.max_context_length, 32_000);
        assert_eq!(service.list_models().await.unwrap().len(), 3);

        let again = service.sync_models().await.unwrap();
        assert_eq!((again.created, again.updated), (0, 3));
    }

    #[tokio::test]
    async fn test_unavailable_provider_writes_nothing() {
        let (_dir, store, _provider, service) = setup(ScriptedProvider {
            unavailable: true,
            ..Default::default()
        })
        .await;
        let chat = service.create_chat(1, None).await.unwrap();

        let result = service.send_message(1, chat.id, SendMessage::new("q")).await;
        assert!(matches!(result, Err(RelayError::ProviderUnavailable(_))));
        let result = service.start_stream(1, chat.id, SendMessage::new("q")).await;
        assert!(matches!(result, Err(RelayError::ProviderUnavailable(_))));

        assert!(store.list_chat_messages(chat.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_model_and_missing_default() {
        let (_dir, _store, _provider, service) = setup(ScriptedProvider::default()).await;
        let chat = service.create_chat(1, None).await.unwrap();

        let mut request = SendMessage::new("q");
        request.model_id = Some(ModelRef::Identifier("vendor/missing".into()));
        let result = service.send_message(1, chat.id, request).await;
        assert!(matches!(result, Err(RelayError::NotFound(_))));

        let mut unconfigured = service.clone();
        unconfigured.settings.default_model = None;
        let result = unconfigured.send_message(1, chat.id, SendMessage::new("q")).await;
        assert!(matches!(result, Err(RelayError::Misconfigured(_))));
    }

    #[tokio::test]
    async fn test_stream_history_skips_failure_placeholders() {
        let (_dir, store, provider, service) = setup(ScriptedProvider {
            deltas: vec!["Hel".into(), "lo".into()],
            ..Default::default()
        })
        .await;
        let mut service = service;
        service.settings.history_limit = 3;

        let chat = service.create_chat(1, None).await.unwrap();
        let model = store
            .find_model(&ModelRef::Identifier("vendor/default".into()))
            .await
            .unwrap()
            .unwrap();
        store.create_message(NewMessage::user(chat.id, "q1")).await.unwrap();
        store
            .create_message(NewMessage::ai(chat.id, model.id, "a1", MessageStatus::Ok))
            .await
            .unwrap();
        store.create_message(NewMessage::user(chat.id, "q2")).await.unwrap();
        store
            .create_message(NewMessage::ai(
                chat.id,
                model.id,
                failure_notice("boom"),
                MessageStatus::UpstreamError,
            ))
            .await
            .unwrap();

        let mut start = service.start_stream(1, chat.id, SendMessage::new("now")).await.unwrap();
        assert_eq!(start.user_message.content, "now");
        assert_eq!(start.model.id, model.id);

        let mut deltas = String::new();
        while let Some(event) = start.relay.events.recv().await {
            match event {
                RelayEvent::Delta(text) => deltas.push_str(&text),
                RelayEvent::Finished(outcome) => {
                    assert!(matches!(outcome, SessionOutcome::Completed { message: Some(_) }));
                }
            }
        }
        assert_eq!(deltas, "Hello");

        let seen = provider.seen.lock().unwrap();
        let turns: Vec<(TurnRole, &str)> = seen[0]
            .messages
            .iter()
            .map(|t| (t.role, t.content.as_str()))
            .collect();
        assert_eq!(
            turns,
            vec![
                (TurnRole::User, "q1"),
                (TurnRole::Assistant, "a1"),
                (TurnRole::User, "now"),
            ]
        );
    }

    #[tokio::test]
    async fn test_branch_validates_initial_message() {
        let (_dir, _store, _provider, service) = setup(ScriptedProvider::default()).await;
        let chat = service.create_chat(1, Some("Plans".into())).await.unwrap();
        let reply = service.send_message(1, chat.id, SendMessage::new("q")).await.unwrap();
        let branch_with = |initial: &str| BranchChat {
            branched_after_message_id: reply.id,
            title: Some("  ".into()),
            initial_message_content: Some(initial.to_string()),
        };

        let too_long = service
            .branch_chat(1, chat.id, branch_with(&"x".repeat(MAX_CONTENT_CHARS + 1)))
            .await;
        assert!(matches!(too_long, Err(RelayError::BadRequest(_))));

        let blank = service.branch_chat(1, chat.id, branch_with(" \n ")).await.unwrap();
        assert_eq!(blank.chat.title, "Branch of \"Plans\"");
        assert_eq!(blank.messages.len(), 2);

        let follow_up = service.branch_chat(1, chat.id, branch_with("q, again")).await.unwrap();
        assert_eq!(follow_up.messages.len(), 3);
        assert_eq!(follow_up.messages[2].content, "q, again");
        assert_eq!(follow_up.messages[2].role, Role::User);
    }
}
