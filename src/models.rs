//! # Database models
//!
//! Data structures that map to the relay's SQLite schema via **Diesel**.
//!
//! - [`Chat`]: a conversation owned by exactly one user, optionally branched
//!   from a parent chat.
//! - [`Message`]: one turn (`user` or `ai`) inside a chat. Immutable once
//!   written; ordered by `created_at`, strictly increasing within a chat.
//! - [`AiModel`]: a provider model the relay may call. The provider-facing
//!   `model_id` is unique.
//!
//! Each queryable struct has an insertable `New*` counterpart. Enumerated
//! columns ([`Role`], [`MessageStatus`]) are stored as lower-case text.
//!
//! ## Diesel expectations
//!
//! The tables are declared in `crate::schema` and created by
//! [`crate::store::SqliteStore::open`].

use chrono::NaiveDateTime;
use diesel::{
    backend::Backend,
    deserialize::{self, FromSql, FromSqlRow},
    expression::AsExpression,
    prelude::*,
    serialize::{self, IsNull, Output, ToSql},
    sql_types::Text,
    sqlite::Sqlite,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsExpression, FromSqlRow, Serialize, Deserialize)]
#[diesel(sql_type = Text)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Ai,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Ai => "ai",
        }
    }
}

/// Outcome recorded on a message.
///
/// `UpstreamError` marks assistant placeholders written when the provider
/// failed; their text is a notice, not a model answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsExpression, FromSqlRow, Serialize, Deserialize)]
#[diesel(sql_type = Text)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Ok,
    UpstreamError,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Ok => "ok",
            MessageStatus::UpstreamError => "upstream_error",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql<Text, Sqlite> for Role {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Sqlite>) -> serialize::Result {
        out.set_value(self.as_str());
        Ok(IsNull::No)
    }
}

impl FromSql<Text, Sqlite> for Role {
    fn from_sql(bytes: <Sqlite as Backend>::RawValue<'_>) -> deserialize::Result<Self> {
        let raw = <String as FromSql<Text, Sqlite>>::from_sql(bytes)?;
        match raw.as_str() {
            "user" => Ok(Role::User),
            "ai" => Ok(Role::Ai),
            other => Err(format!("unknown message role: {other}").into()),
        }
    }
}

impl ToSql<Text, Sqlite> for MessageStatus {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Sqlite>) -> serialize::Result {
        out.set_value(self.as_str());
        Ok(IsNull::No)
    }
}

impl FromSql<Text, Sqlite> for MessageStatus {
    fn from_sql(bytes: <Sqlite as Backend>::RawValue<'_>) -> deserialize::Result<Self> {
        let raw = <String as FromSql<Text, Sqlite>>::from_sql(bytes)?;
        match raw.as_str() {
            "ok" => Ok(MessageStatus::Ok),
            "upstream_error" => Ok(MessageStatus::UpstreamError),
            other => Err(format!("unknown message status: {other}").into()),
        }
    }
}

/// A conversation owned by one user.
///
/// ### Table
/// - `chats`
///
/// ### Notes
/// - `parent_chat_id` / `branched_after_message_id` are set only on branches.
/// - `updated_at` moves forward whenever a message is added.
#[derive(Queryable, Selectable, Serialize, Debug, Clone, PartialEq)]
#[diesel(table_name = crate::schema::chats)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: i32,
    pub user_id: i32,
    pub title: String,
    pub is_archived: bool,
    pub parent_chat_id: Option<i32>,
    pub branched_after_message_id: Option<i32>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::chats)]
pub struct NewChat {
    pub user_id: i32,
    pub title: String,
    pub is_archived: bool,
    pub parent_chat_id: Option<i32>,
    pub branched_after_message_id: Option<i32>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// One turn in a chat.
///
/// ### Table
/// - `messages`
///
/// ### Notes
/// - `ai_model_id` is set only for [`Role::Ai`] messages and becomes `NULL`
///   if the model row is later deleted.
#[derive(Queryable, Selectable, Serialize, Debug, Clone, PartialEq)]
#[diesel(table_name = crate::schema::messages)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: i32,
    pub chat_id: i32,
    pub role: Role,
    pub content: String,
    pub status: MessageStatus,
    pub ai_model_id: Option<i32>,
    pub created_at: NaiveDateTime,
}

/// A message waiting to be written. The store assigns the timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub chat_id: i32,
    pub role: Role,
    pub content: String,
    pub status: MessageStatus,
    pub ai_model_id: Option<i32>,
}

impl NewMessage {
    /// A user turn.
    pub fn user(chat_id: i32, content: impl Into<String>) -> Self {
        Self {
            chat_id,
            role: Role::User,
            content: content.into(),
            status: MessageStatus::Ok,
            ai_model_id: None,
        }
    }

    /// An assistant turn produced by `model_id`.
    pub fn ai(chat_id: i32, model_id: i32, content: impl Into<String>, status: MessageStatus) -> Self {
        Self {
            chat_id,
            role: Role::Ai,
            content: content.into(),
            status,
            ai_model_id: Some(model_id),
        }
    }
}

/// Row form of [`NewMessage`] once the store has chosen `created_at`.
#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::messages)]
pub(crate) struct MessageRow {
    pub chat_id: i32,
    pub role: Role,
    pub content: String,
    pub status: MessageStatus,
    pub ai_model_id: Option<i32>,
    pub created_at: NaiveDateTime,
}

/// A provider model the relay may call.
///
/// ### Table
/// - `ai_models`
#[derive(Queryable, Selectable, Serialize, Debug, Clone, PartialEq)]
#[diesel(table_name = crate::schema::ai_models)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
#[serde(rename_all = "camelCase")]
pub struct AiModel {
    pub id: i32,
    /// Identifier sent to the provider, e.g. `vendor/model-a`.
    pub model_id: String,
    pub display_name: String,
    pub description: Option<String>,
    pub is_free: bool,
    pub price_per_m_token: f64,
    pub max_context_length: i32,
    pub can_recognize_images: bool,
}

/// Catalog row as written by an upsert. `None` clears the column on update.
#[derive(Insertable, AsChangeset, Debug, Clone, PartialEq)]
#[diesel(table_name = crate::schema::ai_models)]
#[diesel(treat_none_as_null = true)]
pub struct NewAiModel {
    pub model_id: String,
    pub display_name: String,
    pub description: Option<String>,
    pub is_free: bool,
    pub price_per_m_token: f64,
    pub max_context_length: i32,
    pub can_recognize_images: bool,
}

/// How a request names a model: by row id or by provider identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModelRef {
    Id(i32),
    Identifier(String),
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelRef::Id(id) => write!(f, "#{id}"),
            ModelRef::Identifier(identifier) => write!(f, "'{identifier}'"),
        }
    }
}
