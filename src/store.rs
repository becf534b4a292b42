//! # Chat store
//!
//! Persistence for chats, messages and models, including:
//!
//! - The storage contracts the relay depends on ([`ChatStore`],
//!   [`MessageStore`], [`ModelStore`]).
//! - [`SqliteStore`], their Diesel/SQLite implementation behind an r2d2 pool.
//!
//! ## What this module owns
//! - Ownership-checked chat lookup (a chat is only visible to its user).
//! - Message writes with a strictly increasing `created_at` per chat.
//! - History reads for the upstream request (most recent N `ok` messages,
//!   oldest first).
//! - Branch copies and model catalog upserts.
//!
//! Diesel is blocking, so every call hops onto `spawn_blocking`. The storage
//! layer is the only shared-mutation boundary; SQLite transactions provide
//! the synchronisation.

use async_trait::async_trait;
use chrono::{NaiveDateTime, TimeDelta, Utc};
use diesel::{
    SqliteConnection,
    connection::SimpleConnection,
    prelude::*,
    r2d2::{ConnectionManager, CustomizeConnection, Pool},
};
use serde::Serialize;
use tracing::{debug, info};

use crate::{
    error::{RelayError, Result},
    models::{
        AiModel, Chat, Message, MessageRow, MessageStatus, ModelRef, NewAiModel, NewChat,
        NewMessage,
    },
    schema::{ai_models, chats, messages},
};

/// Title given to chats created without one.
pub const DEFAULT_CHAT_TITLE: &str = "New chat";

/// DDL applied on open. Mirrors `crate::schema`.
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS ai_models (
    id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
    model_id TEXT NOT NULL UNIQUE,
    display_name TEXT NOT NULL,
    description TEXT,
    is_free BOOLEAN NOT NULL DEFAULT 0,
    price_per_m_token DOUBLE NOT NULL DEFAULT 0,
    max_context_length INTEGER NOT NULL DEFAULT 0,
    can_recognize_images BOOLEAN NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS chats (
    id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
    user_id INTEGER NOT NULL,
    title TEXT NOT NULL,
    is_archived BOOLEAN NOT NULL DEFAULT 0,
    parent_chat_id INTEGER REFERENCES chats(id) ON DELETE SET NULL,
    branched_after_message_id INTEGER,
    created_at TIMESTAMP NOT NULL,
    updated_at TIMESTAMP NOT NULL
);
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
    chat_id INTEGER NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'ok',
    ai_model_id INTEGER REFERENCES ai_models(id) ON DELETE SET NULL,
    created_at TIMESTAMP NOT NULL
);
CREATE INDEX IF NOT EXISTS messages_chat_created ON messages (chat_id, created_at);
CREATE INDEX IF NOT EXISTS chats_user ON chats (user_id);
"#;

/// Chat lookups and chat-level writes.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Ownership-checked lookup. A chat owned by someone else is `NotFound`.
    async fn resolve_chat(&self, chat_id: i32, user_id: i32) -> Result<Chat>;

    async fn create_chat(&self, user_id: i32, title: Option<String>) -> Result<Chat>;

    /// Copy `chat_id` up to and including `after_message_id` into a new chat.
    async fn branch_chat(&self, request: BranchRequest) -> Result<ChatWithMessages>;
}

/// Message reads and writes.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create_message(&self, message: NewMessage) -> Result<Message>;

    /// Up to `limit` `ok` messages created before `before`, oldest first.
    /// Failure placeholders never take a slot.
    async fn list_recent_messages(
        &self,
        chat_id: i32,
        before: NaiveDateTime,
        limit: i64,
    ) -> Result<Vec<Message>>;

    /// Every message of a chat, oldest first.
    async fn list_chat_messages(&self, chat_id: i32) -> Result<Vec<Message>>;
}

/// AiModel catalog.
#[async_trait]
pub trait ModelStore: Send + Sync {
    async fn find_model(&self, model: &ModelRef) -> Result<Option<AiModel>>;

    /// Insert or update by provider identifier. Returns `true` when inserted.
    async fn upsert_model(&self, model: NewAiModel) -> Result<bool>;

    /// Free models first, then by display name.
    async fn list_models(&self) -> Result<Vec<AiModel>>;
}

/// Parameters of [`ChatStore::branch_chat`].
#[derive(Debug, Clone)]
pub struct BranchRequest {
    pub user_id: i32,
    pub chat_id: i32,
    pub after_message_id: i32,
    pub title: Option<String>,
    pub initial_message: Option<String>,
}

/// A chat together with its transcript.
#[derive(Serialize, Debug, Clone)]
pub struct ChatWithMessages {
    #[serde(flatten)]
    pub chat: Chat,
    pub messages: Vec<Message>,
}

#[derive(Debug)]
struct SqlitePragmas;

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for SqlitePragmas {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> std::result::Result<(), diesel::r2d2::Error> {
        conn.batch_execute("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
            .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Diesel/SQLite implementation of every store trait.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<ConnectionManager<SqliteConnection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `database_url` and apply [`SCHEMA_SQL`].
    pub fn open(database_url: &str) -> Result<Self> {
        let manager = ConnectionManager::<SqliteConnection>::new(database_url);
        let pool = Pool::builder()
            .max_size(8)
            .connection_customizer(Box::new(SqlitePragmas))
            .build(manager)
            .map_err(|e| RelayError::Storage(format!("cannot open {database_url}: {e}")))?;

        let mut conn = pool.get()?;
        conn.batch_execute(SCHEMA_SQL)?;
        info!(database = database_url, "chat store ready");

        Ok(Self { pool })
    }

    async fn run<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteConnection) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            op(&mut *conn)
        })
        .await
        .map_err(|e| RelayError::Storage(format!("storage task failed: {e}")))?
    }
}

fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

/// Next timestamp for `chat_id`: the clock, or just after the chat's latest message.
fn next_created_at(conn: &mut SqliteConnection, chat_id: i32) -> Result<NaiveDateTime> {
    let latest: Option<NaiveDateTime> = messages::table
        .filter(messages::chat_id.eq(chat_id))
        .select(diesel::dsl::max(messages::created_at))
        .get_result(conn)?;

    let clock = now();
    Ok(match latest {
        Some(latest) if clock <= latest => latest + TimeDelta::microseconds(1),
        _ => clock,
    })
}

fn insert_message(conn: &mut SqliteConnection, message: NewMessage) -> Result<Message> {
    let created_at = next_created_at(conn, message.chat_id)?;
    let row = MessageRow {
        chat_id: message.chat_id,
        role: message.role,
        content: message.content,
        status: message.status,
        ai_model_id: message.ai_model_id,
        created_at,
    };

    let stored = diesel::insert_into(messages::table)
        .values(&row)
        .returning(Message::as_returning())
        .get_result(conn)?;

    diesel::update(chats::table.find(row.chat_id))
        .set(chats::updated_at.eq(created_at))
        .execute(conn)?;

    Ok(stored)
}

fn find_owned_chat(conn: &mut SqliteConnection, chat_id: i32, user_id: i32) -> Result<Option<Chat>> {
    Ok(chats::table
        .filter(chats::id.eq(chat_id))
        .filter(chats::user_id.eq(user_id))
        .select(Chat::as_select())
        .first(conn)
        .optional()?)
}

#[async_trait]
impl ChatStore for SqliteStore {
    async fn resolve_chat(&self, chat_id: i32, user_id: i32) -> Result<Chat> {
        self.run(move |conn| {
            find_owned_chat(conn, chat_id, user_id)?
                .ok_or_else(|| RelayError::NotFound("Chat not found.".to_string()))
        })
        .await
    }

    async fn create_chat(&self, user_id: i32, title: Option<String>) -> Result<Chat> {
        self.run(move |conn| {
            let created_at = now();
            let chat = NewChat {
                user_id,
                title: title.unwrap_or_else(|| DEFAULT_CHAT_TITLE.to_string()),
                is_archived: false,
                parent_chat_id: None,
                branched_after_message_id: None,
                created_at,
                updated_at: created_at,
            };
            let chat = diesel::insert_into(chats::table)
                .values(&chat)
                .returning(Chat::as_returning())
                .get_result(conn)?;
            debug!(chat_id = chat.id, user_id, "chat created");
            Ok(chat)
        })
        .await
    }

    async fn branch_chat(&self, request: BranchRequest) -> Result<ChatWithMessages> {
        self.run(move |conn| {
            conn.immediate_transaction(|conn| {
                let original = find_owned_chat(conn, request.chat_id, request.user_id)?.ok_or_else(
                    || RelayError::NotFound("Original chat not found.".to_string()),
                )?;

                let branch_point: Message = messages::table
                    .filter(messages::id.eq(request.after_message_id))
                    .filter(messages::chat_id.eq(original.id))
                    .select(Message::as_select())
                    .first(conn)
                    .optional()?
                    .ok_or_else(|| {
                        RelayError::BadRequest(format!(
                            "Message {} not found in chat {}.",
                            request.after_message_id, original.id
                        ))
                    })?;

                let to_copy: Vec<Message> = messages::table
                    .filter(messages::chat_id.eq(original.id))
                    .filter(messages::created_at.le(branch_point.created_at))
                    .order((messages::created_at.asc(), messages::id.asc()))
                    .select(Message::as_select())
                    .load(conn)?;

                let created_at = now();
                let branch = NewChat {
                    user_id: request.user_id,
                    title: request
                        .title
                        .unwrap_or_else(|| format!("Branch of \"{}\"", original.title)),
                    is_archived: false,
                    parent_chat_id: Some(original.id),
                    branched_after_message_id: Some(branch_point.id),
                    created_at,
                    updated_at: created_at,
                };
                let branch = diesel::insert_into(chats::table)
                    .values(&branch)
                    .returning(Chat::as_returning())
                    .get_result(conn)?;

                let copies: Vec<MessageRow> = to_copy
                    .into_iter()
                    .map(|msg| MessageRow {
                        chat_id: branch.id,
                        role: msg.role,
                        content: msg.content,
                        status: msg.status,
                        ai_model_id: msg.ai_model_id,
                        created_at: msg.created_at,
                    })
                    .collect();
                diesel::insert_into(messages::table)
                    .values(&copies)
                    .execute(conn)?;

                if let Some(content) = request.initial_message {
                    insert_message(conn, NewMessage::user(branch.id, content))?;
                }

                let messages = messages::table
                    .filter(messages::chat_id.eq(branch.id))
                    .order((messages::created_at.asc(), messages::id.asc()))
                    .select(Message::as_select())
                    .load(conn)?;
                let chat = chats::table
                    .find(branch.id)
                    .select(Chat::as_select())
                    .first(conn)?;

                info!(
                    chat_id = chat.id,
                    parent_chat_id = original.id,
                    copied = copies.len(),
                    "chat branched"
                );
                Ok(ChatWithMessages { chat, messages })
            })
        })
        .await
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn create_message(&self, message: NewMessage) -> Result<Message> {
        self.run(move |conn| conn.immediate_transaction(|conn| insert_message(conn, message)))
            .await
    }

    async fn list_recent_messages(
        &self,
        chat_id: i32,
        before: NaiveDateTime,
        limit: i64,
    ) -> Result<Vec<Message>> {
        self.run(move |conn| {
            let mut recent: Vec<Message> = messages::table
                .filter(messages::chat_id.eq(chat_id))
                .filter(messages::created_at.lt(before))
                .filter(messages::status.eq(MessageStatus::Ok))
                .order((messages::created_at.desc(), messages::id.desc()))
                .limit(limit)
                .select(Message::as_select())
                .load(conn)?;
            recent.reverse();
            Ok(recent)
        })
        .await
    }

    async fn list_chat_messages(&self, chat_id: i32) -> Result<Vec<Message>> {
        self.run(move |conn| {
            Ok(messages::table
                .filter(messages::chat_id.eq(chat_id))
                .order((messages::created_at.asc(), messages::id.asc()))
                .select(Message::as_select())
                .load(conn)?)
        })
        .await
    }
}

#[async_trait]
impl ModelStore for SqliteStore {
    async fn find_model(&self, model: &ModelRef) -> Result<Option<AiModel>> {
        let model = model.clone();
        self.run(move |conn| {
            let query = ai_models::table.select(AiModel::as_select());
            let found = match model {
                ModelRef::Id(id) => query.filter(ai_models::id.eq(id)).first(conn).optional()?,
                ModelRef::Identifier(identifier) => query
                    .filter(ai_models::model_id.eq(identifier))
                    .first(conn)
                    .optional()?,
            };
            Ok(found)
        })
        .await
    }

    async fn upsert_model(&self, model: NewAiModel) -> Result<bool> {
        self.run(move |conn| {
            conn.immediate_transaction(|conn| {
                let existing: Option<i32> = ai_models::table
                    .filter(ai_models::model_id.eq(&model.model_id))
                    .select(ai_models::id)
                    .first(conn)
                    .optional()?;

                match existing {
                    Some(id) => {
                        diesel::update(ai_models::table.find(id))
                            .set(&model)
                            .execute(conn)?;
                        Ok(false)
                    }
                    None => {
                        diesel::insert_into(ai_models::table)
                            .values(&model)
                            .execute(conn)?;
                        Ok(true)
                    }
                }
            })
        })
        .await
    }

    async fn list_models(&self) -> Result<Vec<AiModel>> {
        self.run(|conn| {
            Ok(ai_models::table
                .order((ai_models::is_free.desc(), ai_models::display_name.asc()))
                .select(AiModel::as_select())
                .load(conn)?)
        })
        .await
    }
}
