//! # Outward frame bridge
//!
//! Converts a streamed send into the frame sequence a client sees:
//!
//! ```text
//! user_message_created, ai_chunk*, ai_stream_end
//! ```
//!
//! or, when the send could not start, a single `error` frame. Exactly one
//! terminal frame (`ai_stream_end` or `error`) is produced per request.
//!
//! Dropping the returned stream drops the relay's receiver, which cancels
//! the session.

use futures::Stream;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::debug;

use async_stream::stream;

use crate::{
    models::{AiModel, Message},
    relay::{RelayEvent, SessionOutcome},
    service::{ChatService, SendMessage},
};

/// One outward frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    UserMessageCreated { message: Message, model: AiModel },
    AiChunk { text: String },
    AiStreamEnd { outcome: SessionOutcome },
    Error { message: String },
}

impl Frame {
    /// Event name on the wire.
    pub fn event_name(&self) -> &'static str {
        match self {
            Frame::UserMessageCreated { .. } => "user_message_created",
            Frame::AiChunk { .. } => "ai_chunk",
            Frame::AiStreamEnd { .. } => "ai_stream_end",
            Frame::Error { .. } => "error",
        }
    }

    /// JSON payload on the wire.
    pub fn data(&self) -> Value {
        match self {
            Frame::UserMessageCreated { message, model } => json!({
                "messageId": message.id,
                "chatId": message.chat_id,
                "content": message.content,
                "role": message.role,
                "createdAt": message.created_at.and_utc(),
                "aiModelId": model.id,
                "aiModelIdentifier": model.model_id,
            }),
            Frame::AiChunk { text } => json!({ "text": text }),
            Frame::AiStreamEnd { outcome } => {
                let mut payload = json!({ "message": "Stream finished." });
                match outcome {
                    SessionOutcome::Completed { message } => {
                        payload["status"] = json!("completed");
                        if let Some(message) = message {
                            payload["aiMessageId"] = json!(message.id);
                        }
                    }
                    SessionOutcome::Failed { error, message } => {
                        payload["status"] = json!("failed");
                        payload["error"] = json!(error);
                        if let Some(message) = message {
                            payload["aiMessageId"] = json!(message.id);
                        }
                    }
                    SessionOutcome::Cancelled => payload["status"] = json!("cancelled"),
                }
                payload
            }
            Frame::Error { message } => json!({ "errorMessage": message }),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Frame::AiStreamEnd { .. } | Frame::Error { .. })
    }
}

/// Run a streamed send and yield its frames.
///
/// # Parameters
/// - `service`: the chat service.
/// - `user_id` / `chat_id`: caller and target chat.
/// - `request`: what to send.
///
/// # Returns
/// A frame stream ending with exactly one terminal frame.
pub fn stream_reply(
    service: Arc<ChatService>,
    user_id: i32,
    chat_id: i32,
    request: SendMessage,
) -> impl Stream<Item = Frame> + Send + 'static {
    stream! {
        let start = match service.start_stream(user_id, chat_id, request).await {
            Ok(start) => start,
            Err(e) => {
                debug!(chat_id, error = %e, "streamed send rejected before start");
                yield Frame::Error { message: e.caller_message() };
                return;
            }
        };

        yield Frame::UserMessageCreated {
            message: start.user_message,
            model: start.model,
        };

        let mut events = start.relay.events;
        while let Some(event) = events.recv().await {
            match event {
                RelayEvent::Delta(text) => yield Frame::AiChunk { text },
                RelayEvent::Finished(outcome) => {
                    yield Frame::AiStreamEnd { outcome };
                    return;
                }
            }
        }

        // The relay task ended without reporting; surface it as a failure.
        yield Frame::AiStreamEnd {
            outcome: SessionOutcome::Failed {
                error: "The relay stopped unexpectedly.".to_string(),
                message: None,
            },
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MessageStatus, Role};
    use chrono::NaiveDate;

    fn message() -> Message {
        Message {
            id: 11,
            chat_id: 4,
            role: Role::User,
            content: "Hi".into(),
            status: MessageStatus::Ok,
            ai_model_id: None,
            created_at: NaiveDate::from_ymd_opt(2024, 5, 1)
                .unwrap()
                .and_hms_opt(12, 0, 0)
                .unwrap(),
        }
    }

    fn model() -> AiModel {
        AiModel {
            id: 2,
            model_id: "vendor/model-a".into(),
            display_name: "Model A".into(),
            description: None,
            is_free: false,
            price_per_m_token: 1.0,
            max_context_length: 1000,
            can_recognize_images: false,
        }
    }

    #[test]
    fn test_user_message_payload() {
        let frame = Frame::UserMessageCreated {
            message: message(),
            model: model(),
        };
        assert_eq!(frame.event_name(), "user_message_created");
        let data = frame.data();
        assert_eq!(data["messageId"], 11);
        assert_eq!(data["role"], "user");
        assert_eq!(data["aiModelIdentifier"], "vendor/model-a");
        assert_eq!(data["createdAt"], "2024-05-01T12:00:00Z");
        assert!(!frame.is_terminal());
    }

    #[test]
    fn test_stream_end_payloads() {
        let done = Frame::AiStreamEnd {
            outcome: SessionOutcome::Completed {
                message: Some(message()),
            },
        };
        let data = done.data();
        assert_eq!(data["message"], "Stream finished.");
        assert_eq!(data["status"], "completed");
        assert_eq!(data["aiMessageId"], 11);
        assert!(data.get("error").is_none());

        let failed = Frame::AiStreamEnd {
            outcome: SessionOutcome::Failed {
                error: "boom".into(),
                message: None,
            },
        };
        let data = failed.data();
        assert_eq!(data["status"], "failed");
        assert_eq!(data["error"], "boom");
        assert!(data.get("aiMessageId").is_none());
        assert!(failed.is_terminal());
    }

    #[test]
    fn test_error_payload() {
        let frame = Frame::Error {
            message: "Chat not found.".into(),
        };
        assert_eq!(frame.event_name(), "error");
        assert_eq!(frame.data(), json!({ "errorMessage": "Chat not found." }));
    }
}
