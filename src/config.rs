//! Construction-time configuration for a farm.

use std::time::Duration;

use farm_abi::layout::ARENA_HEADER_LEN;
use serde::{Deserialize, Serialize};

use crate::error::FarmError;

/// Arena size the CLI uses when no config file is given.
pub const DEFAULT_ARENA_SIZE: usize = 10 * 1024 * 1024;

/// Slot count the CLI uses when no config file is given.
pub const DEFAULT_MAX_SLOTS: usize = 128;

/// Close-channel capacity in words, unless overridden.
pub const DEFAULT_CLOSE_CHANNEL_WORDS: usize = 4096;

fn default_close_channel_words() -> usize {
    DEFAULT_CLOSE_CHANNEL_WORDS
}

/// Sizes and limits of one farm's shared region.
///
/// Every field is explicit. Load from JSON with [`FarmConfig::from_json`]:
///
/// ```json
/// { "arena_size": 65536, "max_slots": 64, "call_timeout_ms": 5000 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FarmConfig {
    /// Bytes in the payload arena, header included.
    pub arena_size: usize,
    /// Descriptor slots in the table. Opens past this return NFILE.
    pub max_slots: usize,
    /// Words in the close-notification channel.
    #[serde(default = "default_close_channel_words")]
    pub close_channel_words: usize,
    /// How long a ref waits for a lock or a reply before abandoning the channel.
    #[serde(default)]
    pub call_timeout_ms: Option<u64>,
}

impl FarmConfig {
    pub fn new(arena_size: usize, max_slots: usize) -> Self {
        Self {
            arena_size,
            max_slots,
            close_channel_words: DEFAULT_CLOSE_CHANNEL_WORDS,
            call_timeout_ms: None,
        }
    }

    pub fn with_close_channel_words(mut self, words: usize) -> Self {
        self.close_channel_words = words;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn validate(&self) -> Result<(), FarmError> {
        if self.arena_size <= ARENA_HEADER_LEN as usize || self.arena_size > u32::MAX as usize {
            return Err(FarmError::InvalidConfig(format!(
                "arena_size {} must be in {}..=u32::MAX",
                self.arena_size,
                ARENA_HEADER_LEN + 1
            )));
        }
        if self.max_slots < 3 {
            return Err(FarmError::InvalidConfig(format!(
                "max_slots {} leaves no room for stdio",
                self.max_slots
            )));
        }
        if self.close_channel_words < 4 {
            return Err(FarmError::InvalidConfig(format!(
                "close_channel_words {} cannot hold a single record",
                self.close_channel_words
            )));
        }
        Ok(())
    }
}
