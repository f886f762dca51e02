//! Configuration types for Boardsync.
//!
//! This module provides the [`SyncConfig`] struct with the tunables the host
//! application can set. Configuration is plain TOML; the host decides where
//! the text comes from (a settings file, an embedded default, a test string).
//!
//! # Example
//!
//! ```ignore
//! use boardsync_core::config::SyncConfig;
//!
//! let config = SyncConfig::from_toml_str(r#"push_throttle_ms = 250"#)?;
//! assert_eq!(config.push_throttle_ms, 250);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default push debounce window in milliseconds.
pub const DEFAULT_PUSH_THROTTLE_MS: u64 = 1000;

/// Default bound on undo history depth.
pub const DEFAULT_MAX_UNDO_LEVELS: usize = 100;

/// `SyncConfig` holds the parts of the sync core that the host can configure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Debounce window between a local edit and the push that carries it.
    /// An armed timer is never reset by later edits; they only re-dirty.
    #[serde(default = "default_push_throttle_ms")]
    pub push_throttle_ms: u64,

    /// Maximum number of undo entries kept per stack (0 = unlimited).
    #[serde(default = "default_max_undo_levels")]
    pub max_undo_levels: usize,

    /// Real-time channel URL (e.g. "wss://sync.boardsync.app").
    /// Consumed by the transport layer, not by this crate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_url: Option<String>,
}

fn default_push_throttle_ms() -> u64 {
    DEFAULT_PUSH_THROTTLE_MS
}

fn default_max_undo_levels() -> usize {
    DEFAULT_MAX_UNDO_LEVELS
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            push_throttle_ms: DEFAULT_PUSH_THROTTLE_MS,
            max_undo_levels: DEFAULT_MAX_UNDO_LEVELS,
            socket_url: None,
        }
    }
}

impl SyncConfig {
    /// Parse a config from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Serialize the config back to TOML text.
    pub fn to_toml_string(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// The push debounce window as a [`Duration`].
    pub fn push_throttle(&self) -> Duration {
        Duration::from_millis(self.push_throttle_ms)
    }
}
