//! Link-local transport configuration.

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::LinkError;

/// Default inbound port search range, as used by link-local clients.
pub const DEFAULT_MIN_PORT: u16 = 2300;
pub const DEFAULT_MAX_PORT: u16 = 2400;

/// Configuration for a [`LinkService`](crate::service::LinkService).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Streams with no traffic for this long are closed by the idle reaper.
    #[serde(with = "duration_millis")]
    pub idle_timeout: Duration,

    /// How often the idle reaper sweeps the registry.
    #[serde(with = "duration_millis")]
    pub reap_interval: Duration,

    /// Bound on handshake waits, send acknowledgements and round trips.
    #[serde(with = "duration_millis")]
    pub reply_timeout: Duration,

    /// Lowest port tried when binding the inbound listener.
    pub listen_port_min: u16,

    /// Highest port tried when binding the inbound listener.
    pub listen_port_max: u16,

    /// Interface to listen on. `None` listens on all interfaces.
    pub bind_address: Option<IpAddr>,

    /// Whether to attempt (and accept) stream compression at all.
    pub compression_enabled: bool,

    /// Compression methods we offer, in preference order.
    pub compression_methods: Vec<String>,

    /// Buffer size of the event and inbound stanza broadcast channels.
    pub event_capacity: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(15),
            reap_interval: Duration::from_secs(5),
            reply_timeout: Duration::from_secs(5),
            listen_port_min: DEFAULT_MIN_PORT,
            listen_port_max: DEFAULT_MAX_PORT,
            bind_address: None,
            compression_enabled: false,
            compression_methods: vec!["zlib".to_string()],
            event_capacity: 256,
        }
    }
}

impl LinkConfig {
    /// Check the values for consistency before the service uses them.
    pub fn validate(&self) -> Result<(), LinkError> {
        if self.listen_port_min > self.listen_port_max {
            return Err(LinkError::Config(format!(
                "listen port range {}-{} is inverted",
                self.listen_port_min, self.listen_port_max
            )));
        }
        if self.idle_timeout.is_zero() || self.reply_timeout.is_zero() {
            return Err(LinkError::Config("timeouts must be non-zero".into()));
        }
        if self.reap_interval.is_zero() {
            return Err(LinkError::Config("reap interval must be non-zero".into()));
        }
        if self.event_capacity == 0 {
            return Err(LinkError::Config("event capacity must be non-zero".into()));
        }
        Ok(())
    }

    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create directory: {e}"))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {e}"))?;
        std::fs::write(path, json).map_err(|e| format!("Failed to write config file: {e}"))
    }

    /// Load config from a JSON file, or return defaults if the file is missing.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<LinkConfig>(&data) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Corrupt config file, using defaults: {e}");
                    }
                },
                Err(e) => {
                    tracing::warn!("Cannot read config file, using defaults: {e}");
                }
            }
        }
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
