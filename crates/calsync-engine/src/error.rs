//! Engine-level error type.
//!
//! Provider errors and store errors pass through with their classification
//! intact; configuration rejections carry a stable machine-readable code
//! the embedding service can map to its own error surface.

use thiserror::Error;

use calsync_providers::ProviderError;

use crate::store::StoreError;

/// Errors surfaced by the orchestrator and the linking flows.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A request was rejected by configuration (feature disabled, unknown
    /// preset, custom servers not allowed, ...).
    #[error("{message}")]
    Config {
        /// Stable code, e.g. `calendar_integration_disabled`.
        code: &'static str,
        message: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl EngineError {
    /// Builds a configuration rejection with a stable code.
    pub fn config(code: &'static str, message: impl Into<String>) -> Self {
        Self::Config {
            code,
            message: message.into(),
        }
    }

    /// The stable error code for logging and API mapping.
    pub fn code(&self) -> &str {
        match self {
            Self::Config { code, .. } => code,
            Self::Store(_) => "store_error",
            Self::Provider(err) => err.code().as_str(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
