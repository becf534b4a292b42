//! # chatrelay (library root)
//!
//! A chat history service that relays completions from an OpenAI-compatible
//! LLM provider and persists every turn:
//! - Storage of chats, messages and the model catalog (`models`, `schema`, `store`).
//! - The upstream client and its SSE frame parser (`upstream`, `frame`).
//! - The streaming relay and the outward frame bridge (`relay`, `bridge`).
//! - Transport-agnostic operations (`service`) and the HTTP transport (`server`).
//! - CLI parsing & configuration (`commands`, `config`, `error`).
//!
//! In addition, this module exposes [`config_dir`] for discovering the
//! per-platform configuration directory.
//!
//! ## Modules
//! - [`bridge`], [`commands`], [`config`], [`error`], [`frame`], [`models`],
//!   [`relay`], [`schema`], [`server`], [`service`], [`store`], [`upstream`]

use directories::ProjectDirs;
use std::path::PathBuf;

pub mod bridge;
pub mod commands;
pub mod config;
pub mod error;
pub mod frame;
pub mod models;
pub mod relay;
pub mod schema;
pub mod server;
pub mod service;
pub mod store;
pub mod upstream;

use crate::error::{RelayError, Result};

/// Return the per-platform configuration directory used by the relay.
///
/// This uses [`directories::ProjectDirs`] with the application triple
/// `("com", "chatrelay", "chatrelay")`, so you get the right place on each OS
/// (e.g., `~/.config/chatrelay` on Linux).
///
/// The directory is **not** created by this function; callers that need it should
/// create it with `fs::create_dir_all`.
///
/// # Errors
/// Returns [`RelayError::Config`] if the platform configuration directory cannot
/// be determined.
pub fn config_dir() -> Result<PathBuf> {
    let proj_dirs = ProjectDirs::from("com", "chatrelay", "chatrelay")
        .ok_or_else(|| RelayError::Config("Unable to determine config directory".to_string()))?;
    Ok(proj_dirs.config_dir().to_path_buf())
}
