//! Error types for the Turnstile admission layer.

use thiserror::Error;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Layered settings could not be loaded or deserialized
    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    /// The rule file could not be parsed
    #[error("Rule syntax error on line {line}: {message}")]
    RuleSyntax { line: usize, message: String },

    /// A retry-after hint was requested for a key that was never checked
    #[error("No limiter registered for key: {0}")]
    KeyNotFound(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TurnstileError {
    pub(crate) fn syntax(line: usize, message: impl Into<String>) -> Self {
        TurnstileError::RuleSyntax {
            line,
            message: message.into(),
        }
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
