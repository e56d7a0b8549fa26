//! Error types for the sync client.

use crate::api_client::ApiClientError;
use crate::config::ConfigError;
use strata_core::StrataError;
use strata_storage::LmdbStoreError;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Api(#[from] ApiClientError),
    #[error(transparent)]
    Store(#[from] LmdbStoreError),
    #[error(transparent)]
    Cache(#[from] StrataError),
    #[error("Failed to init subscriber: {0}")]
    Telemetry(String),
}
