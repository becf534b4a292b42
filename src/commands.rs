//! This module defines the command-line interface for the relay using `clap`.
//!
//! It provides a `Cli` struct that represents the parsed command-line arguments,
//! and a `Commands` enum that represents the available subcommands and their
//! options.
//!
//! # Examples
//!
//! Parsing command-line arguments:
//!
//! ```no_run
//! use clap::Parser;
//! use chatrelay::commands::{Cli, Commands};
//!
//! let cli = Cli::parse();
//! match cli.command {
//!     Commands::Serve => { /* run the HTTP transport */ }
//!     _ => {}
//! }
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Represents the parsed command-line arguments.
///
/// This struct is constructed by parsing the command-line arguments using `clap`.
/// It contains the optional config file location and the parsed subcommand.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, propagate_version = true, color = clap::ColorChoice::Always)]
pub struct Cli {
    /// Config file to use instead of the per-platform default.
    #[arg(long, short = 'c', global = true, env = "CHATRELAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// The parsed subcommand and its options.
    #[command(subcommand)]
    pub command: Commands,
}

/// Represents the available subcommands and their options.
#[derive(Subcommand, Debug)]
#[command(about, long_about = None, color = clap::ColorChoice::Always)]
pub enum Commands {
    /// Write a default config file and create the database.
    Init,

    /// Run the HTTP transport until Ctrl-C.
    #[clap(name = "serve", alias = "s")]
    Serve,

    /// Pull the provider's model catalog into the database.
    #[clap(name = "sync-models")]
    SyncModels,

    /// Create an empty chat and print its id.
    #[clap(name = "new-chat")]
    NewChat {
        #[arg(long, short = 'u')]
        user: i32,

        #[arg(long, short = 't')]
        title: Option<String>,
    },

    /// Send a message to a chat and print the reply.
    ///
    /// With `--stream` the reply is printed as it is generated.
    #[clap(name = "ask", alias = "a")]
    Ask {
        #[arg(long, short = 'u')]
        user: i32,

        #[arg(long)]
        chat: i32,

        /// Model row id or provider identifier. Defaults to the configured model.
        #[arg(long, short = 'm')]
        model: Option<String>,

        #[arg(long)]
        stream: bool,

        /// The message to send.
        question: String,
    },
}
