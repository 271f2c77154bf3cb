use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Largest integer that survives a round trip through an IEEE-754 double,
/// which is what JSON consumers of `z` decode into.
pub const MAX_SAFE_INTEGER: u64 = (1 << 53) - 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub card_map: CardMapConfig,
    #[serde(default)]
    pub cards: CardConfig,
    #[serde(default)]
    pub history: HistoryConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            queue: QueueConfig::default(),
            card_map: CardMapConfig::default(),
            cards: CardConfig::default(),
            history: HistoryConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, CoreError> {
        toml::from_str(text).map_err(|e| CoreError::Config(e.to_string()))
    }

    /// Loads a config file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Coalescing window for card writes during continuous gestures.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Delay between an enqueue and the flush it schedules.
    #[serde(default = "default_flush_debounce_ms")]
    pub flush_debounce_ms: i64,
    /// How often a non-empty queue retries after a failed flush.
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: i64,
    #[serde(default = "default_remote_timeout_ms")]
    pub remote_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            flush_debounce_ms: default_flush_debounce_ms(),
            retry_interval_ms: default_retry_interval_ms(),
            remote_timeout_ms: default_remote_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardMapConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: i64,
}

impl Default for CardMapConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardConfig {
    /// Renormalize z once the highest z is within this distance of
    /// `MAX_SAFE_INTEGER`.
    #[serde(default = "default_z_headroom")]
    pub z_headroom: u64,
    #[serde(default = "default_min_resize_width")]
    pub min_resize_width: u32,
    /// Offset applied to pasted cards that would land on an existing card.
    #[serde(default = "default_paste_offset")]
    pub paste_offset: i64,
    /// Size given to cards created without measured dimensions.
    #[serde(default = "default_card_width")]
    pub default_width: u32,
    #[serde(default = "default_card_height")]
    pub default_height: u32,
}

impl Default for CardConfig {
    fn default() -> Self {
        Self {
            z_headroom: default_z_headroom(),
            min_resize_width: default_min_resize_width(),
            paste_offset: default_paste_offset(),
            default_width: default_card_width(),
            default_height: default_card_height(),
        }
    }
}

impl CardConfig {
    pub fn z_threshold(&self) -> u64 {
        MAX_SAFE_INTEGER.saturating_sub(self.z_headroom)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_history_depth")]
    pub max_depth: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_depth: default_history_depth(),
        }
    }
}

fn default_debounce_ms() -> i64 {
    200
}

fn default_flush_debounce_ms() -> i64 {
    50
}

fn default_retry_interval_ms() -> i64 {
    5_000
}

fn default_card_width() -> u32 {
    crate::model::DEFAULT_CARD_WIDTH
}

fn default_card_height() -> u32 {
    crate::model::DEFAULT_CARD_HEIGHT
}

fn default_remote_timeout_ms() -> u64 {
    5_000
}

fn default_z_headroom() -> u64 {
    2_000
}

fn default_min_resize_width() -> u32 {
    64
}

fn default_paste_offset() -> i64 {
    20
}

fn default_history_depth() -> usize {
    100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = SyncConfig::from_toml_str("").unwrap();
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.cache.debounce_ms, 200);
        assert_eq!(config.cards.z_threshold(), MAX_SAFE_INTEGER - 2_000);
    }

    #[test]
    fn partial_sections_override() {
        let config = SyncConfig::from_toml_str(
            r#"
            [queue]
            retry_interval_ms = 1000

            [cards]
            z_headroom = 1000
            "#,
        )
        .unwrap();
        assert_eq!(config.queue.retry_interval_ms, 1_000);
        assert_eq!(config.queue.flush_debounce_ms, 50);
        assert_eq!(config.cards.z_headroom, 1_000);
        assert_eq!(config.cards.min_resize_width, 64);
    }

    #[test]
    fn load_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig::load(&dir.path().join("spacesync.toml")).unwrap();
        assert_eq!(config, SyncConfig::default());
    }

    #[test]
    fn invalid_toml_is_config_error() {
        let err = SyncConfig::from_toml_str("[cache\n").unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));
    }
}
