//! Error types for the effect VM.

use thiserror::Error;

/// Errors raised while registering or compiling effect programs.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FxError {
    /// A line-form script could not be parsed.
    #[error("Parse error on line {line}: {message}")]
    Parse {
        /// 1-based source line.
        line: usize,
        /// What went wrong.
        message: String,
    },

    /// No source is registered under this id.
    #[error("Unknown effect: {0}")]
    UnknownEffect(String),

    /// An effect library file could not be read.
    #[error("Effect library error: {0}")]
    Library(String),
}

impl FxError {
    pub(crate) fn parse(line: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            line,
            message: message.into(),
        }
    }
}

/// Convenience result type for effect operations.
pub type Result<T> = std::result::Result<T, FxError>;
