//! Provider trait and common error type for server providers.

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{ProviderKind, ProviderServer};

/// Errors that can occur during provider operations.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error response.
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Server not found.
    #[error("Server not found: {0}")]
    NotFound(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A server provider whose inventory is mirrored locally.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Kind of servers this provider manages.
    fn kind(&self) -> ProviderKind;

    /// List every server the account owns.
    async fn list_servers(&self) -> Result<Vec<ProviderServer>, ProviderError>;

    /// Boot the server into the provider's rescue system.
    async fn rescue(&self, provider_id: &str) -> Result<(), ProviderError>;
}
