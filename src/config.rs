use crate::core::error::{Error, Result};
use crate::core::policy::{
    DEFAULT_QUEUE_SIZE, DEFAULT_TABLE_NAME, SessionPolicy, validate_table_name,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Queue session configuration
///
/// Read from JSON; every field is optional:
///
/// ```json
/// { "queue_size": 1024, "read_buffer": 4194304, "local": true }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueConfig {
    /// Packets the kernel may hold in the queue; 0 means the default (128)
    #[serde(default = "default_queue_size")]
    pub queue_size: u32,
    /// Socket receive buffer in bytes, kernel default when unset or 0
    #[serde(default)]
    pub read_buffer: Option<usize>,
    /// Socket send buffer in bytes, kernel default when unset or 0
    #[serde(default)]
    pub write_buffer: Option<usize>,
    /// Intercept traffic to and from this host instead of forwarded traffic
    #[serde(default)]
    pub local: bool,
    /// Answer dropped TCP connections with a reset (forward mode only)
    #[serde(default)]
    pub rst: bool,
    #[serde(default = "default_table_name")]
    pub table_name: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_size: DEFAULT_QUEUE_SIZE,
            read_buffer: None,
            write_buffer: None,
            local: false,
            rst: false,
            table_name: default_table_name(),
        }
    }
}

fn default_queue_size() -> u32 {
    DEFAULT_QUEUE_SIZE
}

fn default_table_name() -> String {
    DEFAULT_TABLE_NAME.to_string()
}

impl QueueConfig {
    /// Checks field combinations the session cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.local && self.rst {
            return Err(Error::Config {
                field: "rst".to_string(),
                message: "tcp reset is not supported in local mode".to_string(),
            });
        }
        validate_table_name(&self.table_name)?;
        Ok(())
    }

    /// Session policy for these settings.
    pub fn policy(&self) -> Result<SessionPolicy> {
        self.validate()?;
        SessionPolicy::new(self.local, self.rst)
    }
}

/// Loads and validates a config file.
///
/// # Async
/// Uses `tokio::fs` for non-blocking I/O.
pub async fn load_config(path: impl AsRef<Path>) -> Result<QueueConfig> {
    let json = tokio::fs::read_to_string(path.as_ref()).await?;
    let config: QueueConfig = serde_json::from_str(&json)?;
    config.validate()?;
    Ok(config)
}
