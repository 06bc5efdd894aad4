use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImporterError {
    #[error("Source file not found: {}", .0.display())]
    SourceNotFound(PathBuf),

    #[error("Source {} has no header line", .0.display())]
    EmptySource(PathBuf),

    #[error("Source {} is missing expected columns: {}", .path.display(), .columns.join(", "))]
    MissingColumns { path: PathBuf, columns: Vec<String> },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Database error: {message}")]
    Database { message: String },

    #[error("Queue error: {message}")]
    Queue { message: String },

    #[error("Environment variable error: {0}")]
    Env(#[from] std::env::VarError),
}

impl From<rusqlite::Error> for ImporterError {
    fn from(err: rusqlite::Error) -> Self {
        ImporterError::Database { message: err.to_string() }
    }
}

impl ImporterError {
    pub fn database(message: impl Into<String>) -> Self {
        ImporterError::Database { message: message.into() }
    }

    pub fn queue(message: impl Into<String>) -> Self {
        ImporterError::Queue { message: message.into() }
    }
}

pub type Result<T> = std::result::Result<T, ImporterError>;
