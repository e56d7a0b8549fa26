//! Strata client: keeps a local entity cache in sync with the API.
//!
//! [`RestClient`] serves the cache's read endpoints, [`PushChannel`] folds
//! push invalidations in as they arrive, and the `strata-sync` binary wires
//! both to an LMDB-backed [`strata_cache::CacheManager`].

pub mod api_client;
pub mod channel;
pub mod config;
pub mod error;
pub mod realtime;
pub mod telemetry;

pub use api_client::{ApiClientError, RestClient};
pub use channel::{BackoffPolicy, ChannelState, CloseDecision, ConnectionState};
pub use config::{ClientConfig, ConfigError};
pub use error::ClientError;
pub use realtime::{ChannelCommand, ChannelConfig, ChannelEvent, ChannelHandle, PushChannel};
