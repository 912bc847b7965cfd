//! Construction-time configuration
//!
//! Everything here is fixed once a session or bridge is built. All structs
//! deserialize from JSON with every field optional.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Environment variable naming a JSON configuration file.
pub const CONFIG_ENV: &str = "INGEST_RTC_CONFIG";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BundlePolicy {
    Balanced,
    MaxCompat,
    #[default]
    MaxBundle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SdpSemantics {
    #[default]
    UnifiedPlan,
    PlanB,
}

/// Configuration handed to the outbound peer session.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Local UDP address for media. A wildcard IP binds the host address
    /// instead, port 0 picks an ephemeral port.
    pub bind: SocketAddr,
    /// STUN/TURN servers. Empty means no NAT traversal.
    pub ice_servers: Vec<String>,
    /// Time allowed from remote description to connected state
    pub connection_timeout_secs: u64,
    pub bundle_policy: BundlePolicy,
    pub sdp_semantics: SdpSemantics,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            bind: SocketAddr::from(([0, 0, 0, 0], 0)),
            ice_servers: Vec::new(),
            connection_timeout_secs: 10,
            bundle_policy: BundlePolicy::default(),
            sdp_semantics: SdpSemantics::default(),
        }
    }
}

impl SessionConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }
}

/// Configuration of the signaling server binary.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP signaling listen address
    pub listen: String,
    pub upstream_connect_timeout_secs: u64,
    /// Drop upstream audio instead of transcoding it to Opus
    pub mute_audio: bool,
    pub session: SessionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen: "0.0.0.0:3000".to_string(),
            upstream_connect_timeout_secs: 10,
            mute_audio: false,
            session: SessionConfig::default(),
        }
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let data = std::fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Loads the file named by [`CONFIG_ENV`], or defaults when it is unset.
    pub fn from_env() -> Result<Config, ConfigError> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Config::from_file(path),
            None => Ok(Config::default()),
        }
    }

    pub fn upstream_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_connect_timeout_secs)
    }
}
