//! Main module for the chatrelay CLI application.
//!
//! This module provides the main function for the CLI. It handles command
//! parsing, configuration loading and initialization, and invokes the
//! appropriate service operation for the given subcommand.
//!
//! # Examples
//!
//! Initializing the configuration and database, then serving:
//!
//! ```sh
//! chatrelay init
//! OPENROUTER_API_KEY=sk-... chatrelay serve
//! ```
//!
//! Asking a question in an existing chat, streamed:
//!
//! ```sh
//! chatrelay ask --user 1 --chat 3 --stream "What is the meaning of life?"
//! ```

use chatrelay::{
    bridge::{Frame, stream_reply},
    commands::{Cli, Commands},
    config::{self, RelayConfig},
    config_dir,
    models::ModelRef,
    relay::SessionOutcome,
    server,
    service::{ChatService, SendMessage, ServiceSettings},
    store::SqliteStore,
    upstream::OpenRouterClient,
};
use clap::Parser;
use futures::StreamExt;
use once_cell::sync::OnceCell;
use std::{
    error::Error,
    fs,
    io::{Write, stdout},
    path::{Path, PathBuf},
    pin::pin,
    sync::Arc,
};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

static TRACING: OnceCell<()> = OnceCell::new();

fn main() -> Result<(), Box<dyn Error>> {
    TRACING.get_or_init(|| {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with_writer(std::io::stderr)
            .init();
    });
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run())
}

/// Main asynchronous function of the chatrelay CLI application.
///
/// Parses command-line arguments, loads configuration, and executes the
/// appropriate command.
///
/// # Errors
///
/// Returns an error if there is an issue loading the configuration, opening
/// the database, reaching the provider, or executing the specified command.
async fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let config_path = match cli.config {
        Some(path) => path,
        None => config_dir()?.join("config.yaml"),
    };

    match cli.command {
        Commands::Init => {
            debug!("Initializing configuration");
            init(&config_path)?;
        }
        Commands::Serve => {
            let (relay_config, service) = load(&config_path)?;
            server::serve(&relay_config.listen_addr, service).await?;
        }
        Commands::SyncModels => {
            let (_, service) = load(&config_path)?;
            let report = service.sync_models().await?;
            println!(
                "fetched {} models: {} created, {} updated",
                report.fetched, report.created, report.updated
            );
        }
        Commands::NewChat { user, title } => {
            let (_, service) = load(&config_path)?;
            let chat = service.create_chat(user, title).await?;
            println!("{}", chat.id);
        }
        Commands::Ask {
            user,
            chat,
            model,
            stream,
            question,
        } => {
            let (_, service) = load(&config_path)?;
            let mut request = SendMessage::new(question);
            request.model_id = model.map(|m| match m.parse::<i32>() {
                Ok(id) => ModelRef::Id(id),
                Err(_) => ModelRef::Identifier(m),
            });

            if stream {
                ask_streaming(service, user, chat, request).await?;
            } else {
                let reply = service.send_message(user, chat, request).await?;
                println!("{}", reply.content);
            }
        }
    }

    Ok(())
}

/// Loads the config and wires the service to the database and provider.
fn load(config_path: &Path) -> Result<(RelayConfig, Arc<ChatService>), Box<dyn Error>> {
    debug!("Loading config from: {}", config_path.display());
    let relay_config = config::load_config(&config_path.to_string_lossy())?;
    let service = build_service(&relay_config)?;
    Ok((relay_config, Arc::new(service)))
}

fn build_service(relay_config: &RelayConfig) -> Result<ChatService, Box<dyn Error>> {
    let store = Arc::new(SqliteStore::open(&relay_config.database_url)?);
    let provider = Arc::new(OpenRouterClient::new(&relay_config.api_base, &relay_config.api_key)?);
    Ok(ChatService::new(store, provider, ServiceSettings::from(relay_config)))
}

/// Prints frames of a streamed reply as they arrive.
async fn ask_streaming(
    service: Arc<ChatService>,
    user: i32,
    chat: i32,
    request: SendMessage,
) -> Result<(), Box<dyn Error>> {
    let mut frames = pin!(stream_reply(service, user, chat, request));
    let mut out = stdout();

    while let Some(frame) = frames.next().await {
        match frame {
            Frame::UserMessageCreated { message, model } => {
                debug!(message_id = message.id, model = %model.model_id, "user message stored");
            }
            Frame::AiChunk { text } => {
                write!(out, "{text}")?;
                out.flush()?;
            }
            Frame::AiStreamEnd { outcome } => {
                writeln!(out)?;
                if let SessionOutcome::Failed { error, .. } = outcome {
                    return Err(error.into());
                }
            }
            Frame::Error { message } => return Err(message.into()),
        }
    }
    Ok(())
}

/// Initializes the application's configuration and database.
///
/// Writes a default config file (unless one exists) next to a SQLite database
/// in the same directory, and creates the database schema.
///
/// # Errors
///
/// Returns an error if there is an issue creating the directories or files,
/// serializing the configuration, or opening the database.
fn init(config_path: &Path) -> Result<(), Box<dyn Error>> {
    let dir = config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    info!("Creating config directory: {}", dir.display());
    fs::create_dir_all(&dir)?;

    let relay_config = if config_path.exists() {
        info!("Keeping existing config file: {}", config_path.display());
        config::load_config(&config_path.to_string_lossy())?
    } else {
        info!("Creating config file: {}", config_path.display());
        let relay_config = RelayConfig {
            database_url: dir.join("chatrelay.db").to_string_lossy().into_owned(),
            ..Default::default()
        };
        fs::write(config_path, serde_yaml::to_string(&relay_config)?)?;
        relay_config
    };

    SqliteStore::open(&relay_config.database_url)?;
    info!("Database ready: {}", relay_config.database_url);
    Ok(())
}
