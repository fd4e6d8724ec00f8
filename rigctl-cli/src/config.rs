//! Configuration file support for rigctl.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (RIGCTL_*)
//! 3. Local config file (./rigctl.toml)
//! 4. Global config file (~/.config/rigctl/config.toml)
//! 5. Remembered port selections (./rigctl_ports.toml or ~/.config/rigctl/ports.toml)

use directories::ProjectDirs;
use log::{debug, info, warn};
use rigctl::SelectionStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Local configuration file name.
const LOCAL_CONFIG: &str = "rigctl.toml";

/// Local remembered-selection file name.
const LOCAL_PORTS: &str = "rigctl_ports.toml";

/// Port configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortsConfig {
    /// Master device (e.g., "/dev/ttyACM0" or "COM3").
    pub master: Option<String>,
    /// Target device.
    pub target: Option<String>,
    /// Baud rate of both links.
    pub baud: Option<u32>,
}

/// Flash configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlashConfig {
    /// Target firmware image (Intel HEX).
    pub firmware: Option<PathBuf>,
    /// Bound on each port discovery phase, in seconds.
    pub phase_timeout_secs: Option<u64>,
    /// Explicit nrfutil executable.
    pub tool: Option<PathBuf>,
    /// `--dev-type` passed when packaging.
    pub dev_type: Option<String>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Port configuration.
    #[serde(default)]
    pub ports: PortsConfig,
    /// Flash configuration.
    #[serde(default)]
    pub flash: FlashConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Load local config (overrides global)
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "rigctl").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        // Ports
        if other.ports.master.is_some() {
            self.ports.master = other.ports.master;
        }
        if other.ports.target.is_some() {
            self.ports.target = other.ports.target;
        }
        if other.ports.baud.is_some() {
            self.ports.baud = other.ports.baud;
        }

        // Flash
        if other.flash.firmware.is_some() {
            self.flash.firmware = other.flash.firmware;
        }
        if other.flash.phase_timeout_secs.is_some() {
            self.flash.phase_timeout_secs = other.flash.phase_timeout_secs;
        }
        if other.flash.tool.is_some() {
            self.flash.tool = other.flash.tool;
        }
        if other.flash.dev_type.is_some() {
            self.flash.dev_type = other.flash.dev_type;
        }
    }
}

/// Remembered Master/Target selections in a small TOML table.
#[derive(Debug)]
pub struct PortStore {
    path: PathBuf,
    values: BTreeMap<String, String>,
}

impl PortStore {
    /// Local `rigctl_ports.toml` when present, otherwise the global `ports.toml`.
    pub fn open_default() -> Self {
        let local = PathBuf::from(LOCAL_PORTS);
        let path = if local.exists() {
            local
        } else {
            Config::global_config_dir().map_or(local, |dir| dir.join("ports.toml"))
        };
        Self::open(path)
    }

    /// Read `path` if it exists. Unreadable files start empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let values = fs::read_to_string(&path)
            .ok()
            .and_then(|content| match toml::from_str(&content) {
                Ok(values) => Some(values),
                Err(e) => {
                    warn!("Ignoring malformed {}: {e}", path.display());
                    None
                },
            })
            .unwrap_or_default();
        debug!("Port selections from {}: {values:?}", path.display());
        Self { path, values }
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self) -> rigctl::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(&self.values).map_err(|e| rigctl::Error::Config(e.to_string()))?;
        fs::write(&self.path, content)?;
        Ok(())
    }
}

impl SelectionStore for PortStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) -> rigctl::Result<()> {
        if self.values.get(key).is_some_and(|v| v == value) {
            return Ok(());
        }
        self.values.insert(key.to_string(), value.to_string());
        self.save()?;
        info!("Remembered {key} = {value} in {}", self.path.display());
        Ok(())
    }
}
