//! TOML configuration.
//!
//! Loaded from the platform config directory; a missing file is replaced
//! with the defaults and written back so users have something to edit.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::output::{Geometry, OutputMode};

const QUALIFIER: &str = "";
const ORG: &str = "";
const APP: &str = "screenpilot";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub display: DisplayConfig,
    pub engine: EngineConfig,
    pub capture: CaptureConfig,
    pub channel: ChannelConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub width: u32,
    pub height: u32,
    pub dpi: u32,
    pub mode: OutputMode,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            dpi: 240,
            mode: OutputMode::Surrogate,
        }
    }
}

impl DisplayConfig {
    pub fn geometry(&self) -> Geometry {
        Geometry::new(self.width, self.height, self.dpi)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Path to the native engine shared library. Unset runs without an
    /// engine; engine operations become no-ops.
    pub library: Option<PathBuf>,
    pub user_dir: Option<PathBuf>,
    pub resource_dir: Option<PathBuf>,
    /// Control bridge library name, passed as a static engine option.
    pub bridge: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub preview_interval_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            preview_interval_ms: 33,
        }
    }
}

impl CaptureConfig {
    pub fn preview_interval(&self) -> Duration {
        Duration::from_millis(self.preview_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Where worker control sockets live. Defaults to the platform
    /// runtime directory.
    pub runtime_dir: Option<PathBuf>,
    pub connect_timeout_ms: u64,
    /// Keep the worker alive after the controller exits.
    pub daemon: bool,
    pub debuggable: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            runtime_dir: None,
            connect_timeout_ms: 10_000,
            daemon: false,
            debuggable: false,
        }
    }
}

impl ChannelConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn runtime_dir(&self) -> Result<PathBuf> {
        match &self.runtime_dir {
            Some(dir) => Ok(dir.clone()),
            None => {
                let dirs = project_dirs()?;
                Ok(dirs
                    .runtime_dir()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| dirs.cache_dir().join("run")))
            }
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config {path:?}"))?;
            toml::from_str(&raw).with_context(|| format!("failed to parse config {path:?}"))
        } else {
            let config = Self::default();
            if let Err(e) = config.save(path) {
                warn!("could not write default config {path:?}: {e:#}");
            }
            Ok(config)
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create config directory {parent:?}"))?;
        }
        let raw = toml::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(path, raw).with_context(|| format!("failed to write config {path:?}"))
    }

    pub fn default_path() -> Result<PathBuf> {
        Ok(project_dirs()?.config_dir().join("config.toml"))
    }

    /// Worker-side state: grant store, recovery marker, exported frames.
    pub fn state_dir() -> Result<PathBuf> {
        Ok(project_dirs()?.data_local_dir().to_path_buf())
    }

    pub fn log_dir() -> Result<PathBuf> {
        Ok(project_dirs()?.data_local_dir().join("logs"))
    }
}

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from(QUALIFIER, ORG, APP).context("could not determine a home directory")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = Config::default();
        assert_eq!(config.display.geometry(), Geometry::new(1280, 720, 240));
        assert_eq!(config.display.mode, OutputMode::Surrogate);
        assert_eq!(config.capture.preview_interval(), Duration::from_millis(33));
        assert_eq!(config.channel.connect_timeout(), Duration::from_secs(10));
        assert!(!config.channel.daemon);
    }

    #[test]
    fn partial_files_keep_the_remaining_defaults() {
        let config: Config = toml::from_str(
            r#"
            [display]
            width = 1920
            height = 1080
            mode = "primary"
            "#,
        )
        .unwrap();
        assert_eq!(config.display.geometry(), Geometry::new(1920, 1080, 240));
        assert_eq!(config.display.mode, OutputMode::Primary);
        assert_eq!(config.capture.preview_interval_ms, 33);
    }

    #[test]
    fn save_and_reload_round_trips() {
        let path = std::env::temp_dir().join(format!("spx-config-{}.toml", uuid::Uuid::new_v4()));
        let mut config = Config::default();
        config.display.width = 800;
        config.channel.daemon = true;
        config.save(&path).unwrap();

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.display.width, 800);
        assert!(reloaded.channel.daemon);
        let _ = std::fs::remove_file(&path);
    }
}
