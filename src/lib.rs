//! ghb - manage self-hosted GitHub Actions runners under GNU pies.
//!
//! This library backs the `ghb` CLI. It keeps the pies configuration file in
//! sync with the runner directories on disk, caches GitHub registration and
//! removal tokens, and drives the running pies instance over its control
//! socket.

pub mod cli;
pub mod commands;
pub mod config;
pub mod github;
pub mod installer;
pub mod piesconf;
pub mod piesctl;
pub mod tokens;

/// Library-level error type for ghb operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{}: {}", .0.display(), .1)]
    Yaml(std::path::PathBuf, #[source] serde_yaml::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Token not found")]
    TokenNotFound,

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Config(String),

    /// Lexical or syntax error in the pies configuration file, with locus.
    #[error("{0}: {1}")]
    Syntax(crate::piesconf::Locus, String),

    #[error("can't connect to pies: not running?")]
    NotRunning,

    #[error("{0}")]
    Transport(String),

    /// Non-success response from GitHub or the pies control interface.
    #[error("{0}")]
    Remote(String),

    /// Non-zero exit from a child process (tar, config.sh, pies).
    #[error("{0}")]
    Child(String),

    #[error("{0}")]
    Other(String),
}

/// Result type alias for ghb operations.
pub type Result<T> = std::result::Result<T, Error>;
