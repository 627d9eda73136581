//! Session configuration.
//! Parsed from a TOML file; every field falls back to the protocol revision.

use std::path::Path;

use arbor_protocol::CURRENT_REVISION;
use serde::{Deserialize, Serialize};

use crate::{Result, SessionError};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub bandwidth: BandwidthSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    #[serde(default = "default_command_capacity")]
    pub command_capacity: usize,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            max_frame_bytes: default_max_frame_bytes(),
            command_capacity: default_command_capacity(),
        }
    }
}

/// Bytes per second.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandwidthSection {
    #[serde(default = "default_local_cap")]
    pub local_cap: u32,
    #[serde(default = "default_floor")]
    pub floor: u32,
}

impl Default for BandwidthSection {
    fn default() -> Self {
        Self {
            local_cap: default_local_cap(),
            floor: default_floor(),
        }
    }
}

// Default value functions
fn default_tick_interval_ms() -> u64 {
    CURRENT_REVISION.tick_interval_ms
}
fn default_max_frame_bytes() -> usize {
    CURRENT_REVISION.max_frame_bytes
}
fn default_command_capacity() -> usize {
    256
}
fn default_local_cap() -> u32 {
    CURRENT_REVISION.bandwidth_default_cap
}
fn default_floor() -> u32 {
    CURRENT_REVISION.bandwidth_floor
}

impl SessionConfig {
    /// Load config from file, or use defaults if missing.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: SessionConfig = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.session.tick_interval_ms == 0 {
            return Err(SessionError::Config("session.tick_interval_ms must be > 0".into()));
        }
        if self.session.max_frame_bytes == 0 {
            return Err(SessionError::Config("session.max_frame_bytes must be > 0".into()));
        }
        if self.session.command_capacity == 0 {
            return Err(SessionError::Config("session.command_capacity must be > 0".into()));
        }
        if self.bandwidth.floor > self.bandwidth.local_cap {
            return Err(SessionError::Config(format!(
                "bandwidth.floor ({}) exceeds bandwidth.local_cap ({})",
                self.bandwidth.floor, self.bandwidth.local_cap
            )));
        }
        Ok(())
    }
}
