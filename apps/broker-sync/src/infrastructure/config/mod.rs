//! Configuration
//!
//! Environment-driven settings for the sync service.

/// Settings structs and env parsing.
pub mod settings;

pub use settings::{
    CacheSettings, ConfigError, Environment, RateLimitSettings, ReconcilerSettings, SyncConfig,
    WebSocketSettings,
};
