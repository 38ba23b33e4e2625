//! Configuration loading

use anyhow::Result;
use serde::{Deserialize, Serialize};
use shutter_session::{DirectoryConfig, LiveViewConfig, SimConfig};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub live_view: LiveViewSection,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub simulator: SimConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveViewSection {
    /// Time between frame requests in milliseconds
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Consecutive frame fetch failures tolerated before live view stops
    #[serde(default = "default_transient_retries")]
    pub transient_retries: u32,
}

impl Default for LiveViewSection {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            transient_retries: default_transient_retries(),
        }
    }
}

fn default_interval_ms() -> u64 {
    33 // ~30 Hz
}

fn default_transient_retries() -> u32 {
    3
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Where downloaded videos are written
    #[serde(default = "default_video_dir")]
    pub video_dir: String,
    /// Where captured stills are written
    #[serde(default = "default_image_dir")]
    pub image_dir: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            video_dir: default_video_dir(),
            image_dir: default_image_dir(),
        }
    }
}

fn default_video_dir() -> String {
    "./videos".to_string()
}

fn default_image_dir() -> String {
    "./images".to_string()
}

impl Config {
    /// Convert to DirectoryConfig
    pub fn to_directory_config(&self) -> DirectoryConfig {
        DirectoryConfig {
            live_view: LiveViewConfig {
                interval: Duration::from_millis(self.live_view.interval_ms.max(1)),
                transient_retries: self.live_view.transient_retries,
            },
        }
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}

/// Save default configuration to file
pub fn save_default_config(path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(&Config::default())?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.live_view.interval_ms, 33);
        assert_eq!(config.simulator.name, "Simulated D-SLR");
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shutter.toml");
        std::fs::write(
            &path,
            "[live_view]\ntransient_retries = 0\n\n[simulator]\nvideo_fragments = 2\n",
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.live_view.transient_retries, 0);
        assert_eq!(config.live_view.interval_ms, 33);
        assert_eq!(config.simulator.video_fragments, 2);
        assert_eq!(config.simulator.fragment_size, 4096);
        assert_eq!(config.output.video_dir, "./videos");
    }

    #[test]
    fn test_saved_default_loads_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shutter.toml");
        save_default_config(&path).unwrap();
        assert_eq!(load_config(&path).unwrap(), Config::default());
    }

    #[test]
    fn test_directory_config_mapping() {
        let mut config = Config::default();
        config.live_view.interval_ms = 0;
        config.live_view.transient_retries = 5;

        let directory = config.to_directory_config();
        assert_eq!(directory.live_view.interval, Duration::from_millis(1));
        assert_eq!(directory.live_view.transient_retries, 5);
    }
}
