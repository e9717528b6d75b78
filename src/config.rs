//! Configuration for the Lark satellite
//!
//! Loaded from a TOML file (default `~/.config/lark/satellite.toml`) with a
//! few environment overrides. All voice tunables have working defaults, so a
//! missing file is not an error.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::voice::playback::ChimePaths;
use crate::voice::satellite::{SessionSettings, DEFAULT_LISTENING_TIMEOUT};
use crate::Result;

/// Default ESPHome native API port
pub const DEFAULT_PORT: u16 = 6053;

/// Top-level satellite configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Device identity and network settings
    pub satellite: SatelliteConfig,
    /// Voice pipeline tunables
    pub voice: VoiceConfig,
    /// Wake word model settings
    pub wake: WakeConfig,
    /// Chime sound files
    pub chimes: ChimeConfig,
}

/// Device identity advertised to the hub
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SatelliteConfig {
    /// Device name shown in the hub
    pub name: String,
    /// MAC address reported in device info and mDNS
    pub mac_address: String,
    /// TCP port for the native API
    pub port: u16,
    /// Optional API password; empty means open
    pub password: Option<String>,
}

impl Default for SatelliteConfig {
    fn default() -> Self {
        let name = hostname::get()
            .map_or_else(|_| "lark".to_string(), |h| h.to_string_lossy().to_string());
        Self {
            name,
            mac_address: "00:00:00:00:00:00".to_string(),
            port: DEFAULT_PORT,
            password: None,
        }
    }
}

/// Voice pipeline tunables
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// Speech gate probability threshold
    pub vad_threshold: f32,
    /// Listening timeout in seconds; 0 selects the built-in default
    pub silence_timeout_secs: u64,
    /// Always loop into a new turn after a successful one
    pub force_continuous_conversation: bool,
    /// Play the wake chime before a fresh turn
    pub wake_chime_enabled: bool,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            vad_threshold: crate::voice::speech::DEFAULT_THRESHOLD,
            silence_timeout_secs: 0,
            force_continuous_conversation: false,
            wake_chime_enabled: true,
        }
    }
}

/// Wake word model settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WakeConfig {
    /// Directory of keyword model JSON manifests
    pub manifest_dir: Option<PathBuf>,
    /// Replace every manifest's probability cutoff
    pub cutoff_override: Option<f32>,
    /// Manifest ids that act as stop words instead of wake words
    pub stop_words: Vec<String>,
}

/// Chime sound file locations
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ChimeConfig {
    pub wake: Option<PathBuf>,
    pub exit: Option<PathBuf>,
    pub timer_finished: Option<PathBuf>,
}

impl Config {
    /// Load configuration from `path`, or the default location when `None`.
    ///
    /// A missing file yields the defaults. `LARK_NAME`, `LARK_MAC` and
    /// `LARK_PORT` override the file.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map_or_else(default_config_path, |p| Some(p.to_path_buf()));

        let mut config = match path {
            Some(ref path) if path.exists() => {
                let content = std::fs::read_to_string(path)?;
                let config: Self = toml::from_str(&content)?;
                tracing::debug!(path = %path.display(), "loaded configuration");
                config
            }
            Some(ref path) => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                Self::default()
            }
            None => Self::default(),
        };

        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(name) = std::env::var("LARK_NAME") {
            self.satellite.name = name;
        }
        if let Ok(mac) = std::env::var("LARK_MAC") {
            self.satellite.mac_address = mac;
        }
        if let Some(port) = std::env::var("LARK_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            self.satellite.port = port;
        }
    }

    /// Session tunables derived from this configuration.
    #[must_use]
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            vad_threshold: self.voice.vad_threshold,
            silence_timeout: if self.voice.silence_timeout_secs > 0 {
                Duration::from_secs(self.voice.silence_timeout_secs)
            } else {
                DEFAULT_LISTENING_TIMEOUT
            },
            force_continuous_conversation: self.voice.force_continuous_conversation,
            wake_chime_enabled: self.voice.wake_chime_enabled,
        }
    }

    /// Chime file locations for the audio output.
    #[must_use]
    pub fn chime_paths(&self) -> ChimePaths {
        ChimePaths {
            wake: self.chimes.wake.clone(),
            exit: self.chimes.exit.clone(),
            timer_finished: self.chimes.timer_finished.clone(),
        }
    }
}

fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "lark", "lark")
        .map(|dirs| dirs.config_dir().join("satellite.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.satellite.port, DEFAULT_PORT);
        assert!(config.voice.wake_chime_enabled);
        assert!(!config.voice.force_continuous_conversation);

        let settings = config.session_settings();
        assert_eq!(settings.silence_timeout, DEFAULT_LISTENING_TIMEOUT);
    }

    #[test]
    fn parses_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [satellite]
            name = "kitchen"
            mac_address = "aa:bb:cc:dd:ee:ff"

            [voice]
            silence_timeout_secs = 8
            force_continuous_conversation = true
            "#,
        )
        .unwrap();

        assert_eq!(config.satellite.name, "kitchen");
        assert_eq!(config.satellite.port, DEFAULT_PORT);

        let settings = config.session_settings();
        assert_eq!(settings.silence_timeout, Duration::from_secs(8));
        assert!(settings.force_continuous_conversation);
        assert!(settings.wake_chime_enabled);
    }

    #[test]
    fn zero_timeout_selects_default() {
        let config: Config = toml::from_str("[voice]\nsilence_timeout_secs = 0\n").unwrap();
        assert_eq!(
            config.session_settings().silence_timeout,
            DEFAULT_LISTENING_TIMEOUT
        );
    }
}
