//! Persistent application configuration
//!
//! Stores device, processing and export settings in a JSON file at
//! `<data_dir>/nirstream/config.json`.

use nirstream_core::session::SessionOptions;
use nirstream_server::{Encoding, ExportConfig, OutputShape};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

fn default_sampling_rate() -> u32 {
    nirstream_core::DEFAULT_SAMPLING_RATE
}

fn default_ports() -> Vec<u16> {
    nirstream_server::DEFAULT_PORTS.to_vec()
}

fn default_secret() -> String {
    nirstream_server::DEFAULT_SECRET.to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_tick_interval_ms() -> u64 {
    10
}

fn default_filter_cutoff_hz() -> f64 {
    nirstream_core::dsp::filter::DEFAULT_CUTOFF_HZ
}

/// Persistent application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Rate the probe is recorded at, in Hz
    #[serde(default = "default_sampling_rate")]
    pub sampling_rate: u32,
    /// Export server bind address
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Export port candidates, first free wins
    #[serde(default = "default_ports")]
    pub export_ports: Vec<u16>,
    /// Shared secret expected in the `security-phrase` header
    #[serde(default = "default_secret")]
    pub export_secret: String,
    #[serde(default)]
    pub output_shape: OutputShape,
    #[serde(default)]
    pub encoding: Encoding,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Run the calculation engine on its own thread
    #[serde(default)]
    pub parallel_calculation: bool,
    #[serde(default = "default_filter_cutoff_hz")]
    pub filter_cutoff_hz: f64,
    /// Directory for rolling log files (None = console only)
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            sampling_rate: default_sampling_rate(),
            bind_addr: default_bind_addr(),
            export_ports: default_ports(),
            export_secret: default_secret(),
            output_shape: OutputShape::default(),
            encoding: Encoding::default(),
            tick_interval_ms: default_tick_interval_ms(),
            parallel_calculation: false,
            filter_cutoff_hz: default_filter_cutoff_hz(),
            log_dir: None,
        }
    }
}

impl AppConfig {
    /// Config file path: `<data_dir>/nirstream/config.json`
    pub fn path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("nirstream")
            .join("config.json")
    }

    /// Load config from the default path
    pub fn load() -> Self {
        Self::load_from(&Self::path())
    }

    /// Load config from `path`, falling back to defaults on any error
    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => {
                    tracing::info!(path = %path.display(), "Loaded config from disk");
                    config
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to parse config, using defaults");
                    Self::default()
                }
            },
            Err(_) => {
                tracing::info!(path = %path.display(), "No config file found, using defaults");
                Self::default()
            }
        }
    }

    /// Save config to disk, creating parent directories if needed
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!(path = %path.display(), "Config saved to disk");
        Ok(())
    }

    pub fn export_config(&self) -> ExportConfig {
        ExportConfig {
            bind_addr: self.bind_addr.clone(),
            ports: self.export_ports.clone(),
            secret: self.export_secret.clone(),
            output_shape: self.output_shape,
            encoding: self.encoding,
            tick_interval_ms: self.tick_interval_ms,
            ..ExportConfig::default()
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            parallel_calculation: self.parallel_calculation,
            filter_cutoff_hz: self.filter_cutoff_hz,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.sampling_rate, 100);
        assert_eq!(config.export_ports, vec![9797, 9898, 8080, 9090, 2424, 2525]);
        assert_eq!(config.output_shape, OutputShape::Batch);
        assert!(!config.parallel_calculation);
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let json = r#"{"sampling_rate": 25, "encoding": "delimited"}"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.sampling_rate, 25);
        assert_eq!(config.encoding, Encoding::Delimited);
        assert_eq!(config.export_secret, nirstream_server::DEFAULT_SECRET);
        assert_eq!(config.tick_interval_ms, 10);
    }

    #[test]
    fn test_empty_json_uses_defaults() {
        let config: AppConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.sampling_rate, 100);
        assert_eq!(config.log_dir, None);
    }

    #[test]
    fn test_export_config_carries_settings() {
        let config = AppConfig {
            export_ports: vec![7000],
            output_shape: OutputShape::SinglePoint,
            ..AppConfig::default()
        };
        let export = config.export_config();
        assert_eq!(export.ports, vec![7000]);
        assert_eq!(export.output_shape, OutputShape::SinglePoint);
        assert_eq!(export.max_clients, 3);
    }
}
