//! Bridge configuration
//!
//! Options are read from YAML. Every field except `engine_binary_path` has a
//! default, so a minimal file is a single line:
//!
//! ```yaml
//! engine_binary_path: /usr/bin/CuraEngine
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::protocol::DEFAULT_MAX_FRAME_BYTES;
use crate::protocol::codec::HEADER_SIZE;
use crate::{BridgeError, Result};

/// Runtime options for the bridge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    /// Engine executable; resolved against the install layout and PATH when not a file
    pub engine_binary_path: PathBuf,
    /// Coalescing window after a scene change
    pub coalesce_ms: u32,
    /// Inbound payload cap
    pub max_frame_bytes: u32,
    pub restart_backoff_initial_ms: u32,
    pub restart_backoff_max_ms: u32,
    /// Consecutive failures before the engine is declared unavailable
    pub restart_max_consecutive_failures: u32,
    /// A Ready period longer than this resets the backoff
    pub restart_reset_after_ms: u32,
    /// Send queue depth at which senders suspend
    pub send_queue_high_watermark: u32,
    /// Engine stderr lines retained in memory
    pub engine_log_max_lines: u32,
    /// Appended after `--socket <port> --command-socket`
    pub extra_engine_args: Vec<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            engine_binary_path: PathBuf::new(),
            coalesce_ms: 500,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            restart_backoff_initial_ms: 500,
            restart_backoff_max_ms: 30_000,
            restart_max_consecutive_failures: 5,
            restart_reset_after_ms: 60_000,
            send_queue_high_watermark: 1024,
            engine_log_max_lines: 20_000,
            extra_engine_args: Vec::new(),
        }
    }
}

impl BridgeConfig {
    /// Defaults with the given engine binary
    pub fn new(engine_binary_path: impl Into<PathBuf>) -> Self {
        Self { engine_binary_path: engine_binary_path.into(), ..Self::default() }
    }

    /// Parse and validate a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: BridgeConfig = serde_yaml_ng::from_str(yaml)
            .map_err(|e| BridgeError::config_error("YAML parsing", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading bridge configuration from {}", path.display());
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| BridgeError::io_error(format!("reading {}", path.display()), e))?;
        Self::from_yaml_str(&yaml)
    }

    /// Check option consistency
    pub fn validate(&self) -> Result<()> {
        if self.engine_binary_path.as_os_str().is_empty() {
            return Err(BridgeError::config_error("engine_binary_path", "is required"));
        }
        if (self.max_frame_bytes as usize) < HEADER_SIZE {
            return Err(BridgeError::config_error(
                "max_frame_bytes",
                format!("must be at least {}", HEADER_SIZE),
            ));
        }
        if self.restart_backoff_initial_ms == 0 {
            return Err(BridgeError::config_error("restart_backoff_initial_ms", "must be positive"));
        }
        if self.restart_backoff_initial_ms > self.restart_backoff_max_ms {
            return Err(BridgeError::config_error(
                "restart_backoff_max_ms",
                format!(
                    "{} is below restart_backoff_initial_ms {}",
                    self.restart_backoff_max_ms, self.restart_backoff_initial_ms
                ),
            ));
        }
        if self.restart_max_consecutive_failures == 0 {
            return Err(BridgeError::config_error(
                "restart_max_consecutive_failures",
                "must be at least 1",
            ));
        }
        if self.send_queue_high_watermark == 0 {
            return Err(BridgeError::config_error(
                "send_queue_high_watermark",
                "must be at least 1",
            ));
        }
        Ok(())
    }

    pub fn coalesce_window(&self) -> Duration {
        Duration::from_millis(self.coalesce_ms as u64)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_initial_ms as u64)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_max_ms as u64)
    }

    pub fn backoff_reset_after(&self) -> Duration {
        Duration::from_millis(self.restart_reset_after_ms as u64)
    }
}
