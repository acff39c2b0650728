//! CLI argument definitions for the ProdLens binary.
//!
//! Uses `clap` with derive macros for ergonomic argument parsing.
//! Priority resolution: CLI args > env vars > config file > defaults.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// ProdLens: ask questions about an electronics catalog in plain language.
#[derive(Parser, Debug)]
#[command(name = "prodlens", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Data directory for the session store, catalog and vector snapshot.
    #[arg(short = 'd', long = "data-dir", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Start the HTTP API.
    Serve {
        /// API server port.
        #[arg(short = 'p', long = "port")]
        port: Option<u16>,
    },
    /// Interactive conversation.
    Chat {
        /// Resume or name a session.
        #[arg(short = 's', long = "session")]
        session: Option<String>,
        /// Print standalone query, route, reasoning and statement after each answer.
        #[arg(long = "show-metadata")]
        show_metadata: bool,
    },
    /// Answer a single question and exit.
    Ask {
        question: String,
        #[arg(short = 's', long = "session")]
        session: Option<String>,
        /// Print the full response as JSON.
        #[arg(long = "json")]
        json: bool,
    },
    /// Print the stored history of a session.
    History { session: String },
    /// List stored sessions, most recent first.
    Sessions,
    /// Delete a session and its history.
    Forget { session: String },
    /// Print the turn graph as a Mermaid flowchart.
    Graph,
    /// Write a default configuration file.
    Init {
        /// Overwrite an existing file.
        #[arg(long = "force")]
        force: bool,
    },
}

impl CliArgs {
    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > PRODLENS_CONFIG env var > ~/.prodlens/config.toml.
    pub fn resolve_config_path(&self) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Ok(p) = std::env::var("PRODLENS_CONFIG") {
            return PathBuf::from(p);
        }
        default_config_path()
    }

    /// Resolve the API server port.
    ///
    /// Priority: --port flag > PRODLENS_PORT env var > config file value.
    pub fn resolve_port(&self, config_port: u16) -> u16 {
        if let Command::Serve { port: Some(p) } = self.command {
            return p;
        }
        if let Ok(val) = std::env::var("PRODLENS_PORT") {
            if let Ok(p) = val.parse::<u16>() {
                return p;
            }
        }
        config_port
    }

    /// Resolve the data directory override, if any.
    pub fn resolve_data_dir(&self) -> Option<String> {
        self.data_dir
            .as_ref()
            .map(|p| p.to_string_lossy().to_string())
    }

    /// Resolve the log filter directive.
    ///
    /// Priority: PRODLENS_LOG env var > --log-level flag > config file value.
    /// `RUST_LOG` is honoured before any of these by the caller.
    pub fn resolve_log_level(&self, config_level: &str) -> String {
        if let Ok(level) = std::env::var("PRODLENS_LOG") {
            if !level.trim().is_empty() {
                return level;
            }
        }
        self.log_level
            .clone()
            .unwrap_or_else(|| config_level.to_string())
    }
}

/// Default config file path for the current platform.
fn default_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    if let Ok(home) = std::env::var("USERPROFILE") {
        return PathBuf::from(home).join(".prodlens").join("config.toml");
    }
    #[cfg(not(target_os = "windows"))]
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".prodlens").join("config.toml");
    }
    PathBuf::from("config.toml")
}
