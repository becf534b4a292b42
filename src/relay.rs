//! # Stream relay
//!
//! Owns one streaming completion from the moment the upstream accepted the
//! request until its outcome is persisted.
//!
//! [`spawn_relay`] starts a task that pumps upstream deltas into a bounded
//! channel while appending them to the session buffer. A delta is only read
//! once the channel has room for it, so the pump is never more than one delta
//! ahead of the consumer. The task finishes in exactly one of three ways:
//!
//! - **Completed**: the upstream ended normally. A non-blank buffer is
//!   persisted as the assistant message.
//! - **Failed**: the upstream reported an error. A fixed notice (never the
//!   partial text) is persisted with [`MessageStatus::UpstreamError`].
//! - **Cancelled**: the consumer went away. The upstream is dropped
//!   immediately and nothing is written.
//!
//! The upstream stream is always dropped before the outcome is persisted, so
//! no connection outlives its session. A persistence failure is logged and
//! reflected in the outcome (`message: None`), never raised to the consumer.

use futures::StreamExt;
use std::sync::Arc;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::{
    error::RelayError,
    models::{AiModel, Message, MessageStatus, NewMessage},
    store::MessageStore,
    upstream::DeltaStream,
};

/// Capacity of the delta channel between the pump and its consumer.
const CHANNEL_CAPACITY: usize = 1;

/// Notice persisted in place of the answer when the upstream fails mid-stream.
pub fn failure_notice(error: &str) -> String {
    format!("An error occurred while the AI model was processing your request: {error}")
}

/// State of one in-flight stream.
#[derive(Debug)]
pub struct StreamSession {
    pub chat_id: i32,
    pub model: AiModel,
    buffer: String,
}

impl StreamSession {
    pub fn new(chat_id: i32, model: AiModel) -> Self {
        Self {
            chat_id,
            model,
            buffer: String::new(),
        }
    }
}

/// What the consumer receives.
#[derive(Debug, Clone)]
pub enum RelayEvent {
    Delta(String),
    /// Always the last event.
    Finished(SessionOutcome),
}

/// How a session ended, and what was persisted for it.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    /// `message` is `None` when the reply was blank or could not be stored.
    Completed { message: Option<Message> },
    Failed { error: String, message: Option<Message> },
    Cancelled,
}

/// Handle to a running relay.
#[derive(Debug)]
pub struct RelayHandle {
    pub events: mpsc::Receiver<RelayEvent>,
    /// Resolves once the outcome has been persisted.
    pub finalizer: JoinHandle<SessionOutcome>,
}

enum PumpEnd {
    Completed,
    Failed(RelayError),
    Cancelled,
}

/// Start relaying `upstream` for `session`.
///
/// # Parameters
/// - `store`: where the outcome is persisted.
/// - `session`: chat and model the reply belongs to.
/// - `upstream`: the opened delta stream. Ownership moves into the relay task.
///
/// # Returns
/// A [`RelayHandle`]. Dropping `events` cancels the session.
pub fn spawn_relay(
    store: Arc<dyn MessageStore>,
    mut session: StreamSession,
    mut upstream: DeltaStream,
) -> RelayHandle {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

    let finalizer = tokio::spawn(async move {
        let end = loop {
            let Ok(permit) = tx.reserve().await else {
                break PumpEnd::Cancelled;
            };
            tokio::select! {
                _ = tx.closed() => break PumpEnd::Cancelled,
                next = upstream.next() => match next {
                    Some(Ok(delta)) => {
                        session.buffer.push_str(&delta);
                        permit.send(RelayEvent::Delta(delta));
                    }
                    Some(Err(e)) => break PumpEnd::Failed(e),
                    None => break PumpEnd::Completed,
                },
            }
        };
        drop(upstream);
        debug!(chat_id = session.chat_id, "upstream released");

        let outcome = finalize(store.as_ref(), &session, end).await;
        if tx.send(RelayEvent::Finished(outcome.clone())).await.is_err() {
            debug!(chat_id = session.chat_id, "consumer left before the final event");
        }
        outcome
    });

    RelayHandle {
        events: rx,
        finalizer,
    }
}

async fn finalize(store: &dyn MessageStore, session: &StreamSession, end: PumpEnd) -> SessionOutcome {
    match end {
        PumpEnd::Cancelled => {
            info!(
                chat_id = session.chat_id,
                received = session.buffer.len(),
                "stream cancelled by consumer; nothing persisted"
            );
            SessionOutcome::Cancelled
        }
        PumpEnd::Completed => {
            let reply = session.buffer.trim();
            if reply.is_empty() {
                warn!(chat_id = session.chat_id, "upstream finished without any text");
                return SessionOutcome::Completed { message: None };
            }
            let message = persist(
                store,
                NewMessage::ai(session.chat_id, session.model.id, reply, MessageStatus::Ok),
            )
            .await;
            SessionOutcome::Completed { message }
        }
        PumpEnd::Failed(e) => {
            let detail = match &e {
                RelayError::ProviderStream(detail) => detail.clone(),
                other => other.to_string(),
            };
            warn!(chat_id = session.chat_id, error = %detail, "upstream failed mid-stream");
            let message = persist(
                store,
                NewMessage::ai(
                    session.chat_id,
                    session.model.id,
                    failure_notice(&detail),
                    MessageStatus::UpstreamError,
                ),
            )
            .await;
            SessionOutcome::Failed {
                error: e.caller_message(),
                message,
            }
        }
    }
}

async fn persist(store: &dyn MessageStore, message: NewMessage) -> Option<Message> {
    let chat_id = message.chat_id;
    match store.create_message(message).await {
        Ok(stored) => Some(stored),
        Err(e) => {
            error!(chat_id, error = %e, "failed to persist assistant message");
            None
        }
    }
}
