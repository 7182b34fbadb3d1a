use crate::history::HistoryError;
use crate::model::ModelError;
use crate::tools::ToolError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DopasError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("History reconstruction error: {0}")]
    History(#[from] HistoryError),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl DopasError {
    /// True when the failure is a network-layer problem (model endpoint
    /// unreachable or timed out) rather than a logic or API error. The
    /// transport surfaces these with a "check your connection" message.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, DopasError::Model(m) if m.is_connectivity())
    }
}
