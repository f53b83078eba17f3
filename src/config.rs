//! Ambient host configuration (spec §6 "External interface" host-facing
//! knobs): how often the engine seals a generation and secures a fresh
//! superblock slot, and where `cbe-tool` finds its backing image.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default interval between automatic superblock seals when the cache is
/// dirty (milliseconds, in whatever clock `Library::execute`'s `now` counts).
const DEFAULT_SYNC_INTERVAL_MS: u64 = 5_000;
/// Default interval between unconditional superblock seals, dirty or not.
const DEFAULT_SECURE_INTERVAL_MS: u64 = 60_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log a line for every sealed generation; off by default to keep
    /// high-frequency callers quiet.
    pub show_progress: bool,
    pub sync_interval_ms: u64,
    pub secure_interval_ms: u64,
    /// Path to the backing block image, used by `cbe-tool`; unused by
    /// embedders who bring their own [`crate::collab::BlockBackend`].
    pub block: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            show_progress: false,
            sync_interval_ms: DEFAULT_SYNC_INTERVAL_MS,
            secure_interval_ms: DEFAULT_SECURE_INTERVAL_MS,
            block: PathBuf::from("cbe.img"),
        }
    }
}

#[cfg(feature = "cli")]
impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> { toml::from_str(s) }
}
