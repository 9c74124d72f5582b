//! Configuration for the CastBridge control point.
//!
//! The configuration is a plain YAML document. Lookup order:
//!
//! 1. an explicit path passed to [`Config::load`],
//! 2. the `CASTBRIDGE_CONFIG` environment variable,
//! 3. `.castbridge.yml` in the current directory,
//! 4. built-in defaults.
//!
//! Every numeric accessor clamps the stored value into its documented
//! range, so a hand-edited file can never push a timer below what the
//! devices tolerate.

use std::time::Duration;
use std::{env, fs, path::PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

const ENV_CONFIG_FILE: &str = "CASTBRIDGE_CONFIG";
const LOCAL_CONFIG_FILE: &str = ".castbridge.yml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {0}: {1}")]
    Io(String, #[source] std::io::Error),
    #[error("cannot parse config file {0}: {1}")]
    Yaml(String, #[source] serde_yaml::Error),
}

/// Control-point settings.
///
/// All durations are stored in the unit their name carries; use the
/// typed accessors to obtain clamped [`Duration`] values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP timeout for SOAP and description requests, in milliseconds.
    pub communication_timeout_ms: u64,
    /// Interval between status polls of a renderer, in milliseconds.
    pub device_polling_interval_ms: u64,
    /// Pause between two outbound commands to one renderer, in milliseconds.
    pub queue_processing_interval_ms: u64,
    /// First discovery burst delay, in seconds.
    pub client_discovery_initial_interval_secs: u64,
    /// Steady-state discovery interval, in seconds.
    pub client_discovery_interval_secs: u64,
    /// Photo slideshow transition delay, in seconds.
    pub photo_transition_seconds: u64,
    /// Percentage of the runtime within which a stop counts as "played to
    /// completion".
    pub max_resume_percent: u32,
    pub user_agent: String,
    pub friendly_name: String,
    /// UDP port range for discovery sockets, e.g. "49152-65535".
    pub udp_port_range: String,
    /// Description URLs injected as synthetic discoveries when network
    /// discovery is disabled.
    pub static_devices: Vec<String>,
    pub enable_ssdp_tracing: bool,
    /// Restrict SSDP traces to one peer IP.
    pub ssdp_tracing_filter: Option<String>,
    pub enable_playto_debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            communication_timeout_ms: 8_000,
            device_polling_interval_ms: 30_000,
            queue_processing_interval_ms: 1_000,
            client_discovery_initial_interval_secs: 5,
            client_discovery_interval_secs: 1_800,
            photo_transition_seconds: 5,
            max_resume_percent: 2,
            user_agent: "UPnP/1.0 DLNADOC/1.50 CastBridge/1.0".to_string(),
            friendly_name: "CastBridge".to_string(),
            udp_port_range: "49152-65535".to_string(),
            static_devices: Vec::new(),
            enable_ssdp_tracing: false,
            ssdp_tracing_filter: None,
            enable_playto_debug: false,
        }
    }
}

fn clamp(value: u64, min: u64, max: u64) -> u64 {
    value.min(max).max(min)
}

impl Config {
    /// Load the configuration, falling back to defaults when no file is
    /// found. A file that exists but does not parse is an error: silently
    /// running with defaults in that case hides typos from the operator.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Some(p) = path {
            candidates.push(PathBuf::from(p));
        }
        if let Ok(p) = env::var(ENV_CONFIG_FILE) {
            candidates.push(PathBuf::from(p));
        }
        candidates.push(PathBuf::from(LOCAL_CONFIG_FILE));

        for candidate in candidates {
            match fs::read_to_string(&candidate) {
                Ok(text) => {
                    info!(config_file = %candidate.display(), "loading configuration");
                    return serde_yaml::from_str(&text).map_err(|e| {
                        ConfigError::Yaml(candidate.display().to_string(), e)
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!(config_file = %candidate.display(), error = %e, "cannot read config file");
                    return Err(ConfigError::Io(candidate.display().to_string(), e));
                }
            }
        }

        Ok(Self::default())
    }

    pub fn communication_timeout(&self) -> Duration {
        Duration::from_millis(clamp(self.communication_timeout_ms, 8_000, 60_000))
    }

    pub fn device_polling_interval(&self) -> Duration {
        Duration::from_millis(clamp(self.device_polling_interval_ms, 0, 1_200_000))
    }

    pub fn queue_processing_interval(&self) -> Duration {
        Duration::from_millis(clamp(self.queue_processing_interval_ms, 0, 60_000))
    }

    pub fn client_discovery_initial_interval(&self) -> Duration {
        Duration::from_secs(clamp(self.client_discovery_initial_interval_secs, 4, 1_500))
    }

    pub fn client_discovery_interval(&self) -> Duration {
        Duration::from_secs(clamp(self.client_discovery_interval_secs, 10, 60_000))
    }

    pub fn photo_transition(&self) -> Duration {
        Duration::from_secs(self.photo_transition_seconds.max(1))
    }

    pub fn max_resume_percent(&self) -> u32 {
        self.max_resume_percent.min(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_in_range() {
        let config = Config::default();
        assert_eq!(config.communication_timeout(), Duration::from_millis(8_000));
        assert_eq!(config.device_polling_interval(), Duration::from_millis(30_000));
        assert_eq!(config.queue_processing_interval(), Duration::from_millis(1_000));
        assert_eq!(config.photo_transition(), Duration::from_secs(5));
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        let config = Config {
            communication_timeout_ms: 1,
            device_polling_interval_ms: 99_999_999,
            queue_processing_interval_ms: 120_000,
            client_discovery_initial_interval_secs: 0,
            photo_transition_seconds: 0,
            max_resume_percent: 500,
            ..Config::default()
        };
        assert_eq!(config.communication_timeout(), Duration::from_millis(8_000));
        assert_eq!(
            config.device_polling_interval(),
            Duration::from_millis(1_200_000)
        );
        assert_eq!(
            config.queue_processing_interval(),
            Duration::from_millis(60_000)
        );
        assert_eq!(
            config.client_discovery_initial_interval(),
            Duration::from_secs(4)
        );
        assert_eq!(config.photo_transition(), Duration::from_secs(1));
        assert_eq!(config.max_resume_percent(), 100);
    }

    #[test]
    fn yaml_round_trip() {
        let yaml = r#"
communication_timeout_ms: 12000
friendly_name: "Living room bridge"
static_devices:
  - "http://10.0.0.17:49152/description.xml"
enable_playto_debug: true
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.communication_timeout(), Duration::from_millis(12_000));
        assert_eq!(config.friendly_name, "Living room bridge");
        assert_eq!(config.static_devices.len(), 1);
        assert!(config.enable_playto_debug);
        // untouched fields keep their defaults
        assert_eq!(config.queue_processing_interval_ms, 1_000);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let yaml = "communication_timeout: 12000\n";
        assert!(serde_yaml::from_str::<Config>(yaml).is_err());
    }
}
