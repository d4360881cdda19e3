//! Minimal configuration loading for the vDC host daemon.
//!
//! Configuration covers what cannot come from the controller: identity inputs
//! for dSUID derivation, the listen port, the persistence file location, and
//! whether to announce on mDNS.
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/vdcd/config.toml` (system)
//! 2. `~/.config/vdcd/config.toml` (user)
//! 3. `./vdcd.toml` (local override, or the `--config` path)
//! 4. Environment variables (`VDCD_*`)
//!
//! # Example Config
//!
//! ```toml
//! [host]
//! name = "Living Room Bridge"
//! vendor = "acme"
//! identity = "AA:BB:CC:DD:EE:FF"
//!
//! [bind]
//! port = 8444
//! announce = true
//!
//! [paths]
//! state_file = "~/.local/share/vdcd/state.yaml"
//!
//! [telemetry]
//! log_level = "info"
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default vDC API listen port.
pub const DEFAULT_PORT: u16 = 8444;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Host identity settings. These feed dSUID derivation, so changing them
/// changes the identity the controller sees.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSection {
    pub name: String,
    pub vendor: String,
    /// MAC-like identity bytes, e.g. "AA:BB:CC:DD:EE:FF".
    pub identity: String,
    pub model: String,
}

impl Default for HostSection {
    fn default() -> Self {
        Self {
            name: "vDC host".to_string(),
            vendor: "vdcd".to_string(),
            identity: "00:00:00:00:00:00".to_string(),
            model: "vdcd".to_string(),
        }
    }
}

/// Network bind settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BindSection {
    pub port: u16,
    /// Advertise `_ds-vdc._tcp` on mDNS.
    pub announce: bool,
}

impl Default for BindSection {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            announce: true,
        }
    }
}

/// Filesystem paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsSection {
    pub state_file: PathBuf,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from("vdcd-state.yaml"),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySection {
    pub log_level: String,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Complete daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VdcConfig {
    pub host: HostSection,
    pub bind: BindSection,
    pub paths: PathsSection,
    pub telemetry: TelemetrySection,
}

/// Which sources contributed to the loaded configuration.
#[derive(Debug, Default)]
pub struct ConfigSources {
    pub files: Vec<PathBuf>,
    pub env_overrides: Vec<String>,
}

impl VdcConfig {
    /// Load configuration from all discovered sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load from an optional explicit file path, then apply env overrides.
    /// The explicit path replaces the local `./vdcd.toml` override; system
    /// and user configs still load first.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration and report which sources were used.
    pub fn load_with_sources_from(
        config_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut config = VdcConfig::default();

        for path in discover_config_files(config_path) {
            config = merge(config, load_file(&path)?);
            sources.files.push(path);
        }

        apply_env_overrides(&mut config, &mut sources);
        Ok((config, sources))
    }

    /// Serialize the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse {
            path: PathBuf::from("<memory>"),
            message: e.to_string(),
        })
    }
}

fn discover_config_files(config_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/vdcd/config.toml");
    if system.is_file() {
        files.push(system);
    }

    if let Ok(home) = std::env::var("HOME") {
        let user = PathBuf::from(home).join(".config/vdcd/config.toml");
        if user.is_file() {
            files.push(user);
        }
    }

    match config_path {
        Some(path) => files.push(path.to_path_buf()),
        None => {
            let local = PathBuf::from("vdcd.toml");
            if local.is_file() {
                files.push(local);
            }
        }
    }

    files
}

fn load_file(path: &Path) -> Result<PartialConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// File-shaped config where every leaf is optional, so later files only
/// override what they mention.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PartialConfig {
    host: PartialHost,
    bind: PartialBind,
    paths: PartialPaths,
    telemetry: PartialTelemetry,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PartialHost {
    name: Option<String>,
    vendor: Option<String>,
    identity: Option<String>,
    model: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PartialBind {
    port: Option<u16>,
    announce: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PartialPaths {
    state_file: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PartialTelemetry {
    log_level: Option<String>,
}

fn merge(mut base: VdcConfig, overlay: PartialConfig) -> VdcConfig {
    if let Some(v) = overlay.host.name {
        base.host.name = v;
    }
    if let Some(v) = overlay.host.vendor {
        base.host.vendor = v;
    }
    if let Some(v) = overlay.host.identity {
        base.host.identity = v;
    }
    if let Some(v) = overlay.host.model {
        base.host.model = v;
    }
    if let Some(v) = overlay.bind.port {
        base.bind.port = v;
    }
    if let Some(v) = overlay.bind.announce {
        base.bind.announce = v;
    }
    if let Some(v) = overlay.paths.state_file {
        base.paths.state_file = v;
    }
    if let Some(v) = overlay.telemetry.log_level {
        base.telemetry.log_level = v;
    }
    base
}

fn apply_env_overrides(config: &mut VdcConfig, sources: &mut ConfigSources) {
    if let Ok(v) = std::env::var("VDCD_NAME") {
        config.host.name = v;
        sources.env_overrides.push("VDCD_NAME".into());
    }
    if let Ok(v) = std::env::var("VDCD_VENDOR") {
        config.host.vendor = v;
        sources.env_overrides.push("VDCD_VENDOR".into());
    }
    if let Ok(v) = std::env::var("VDCD_IDENTITY") {
        config.host.identity = v;
        sources.env_overrides.push("VDCD_IDENTITY".into());
    }
    if let Ok(v) = std::env::var("VDCD_PORT") {
        if let Ok(port) = v.parse() {
            config.bind.port = port;
            sources.env_overrides.push("VDCD_PORT".into());
        }
    }
    if let Ok(v) = std::env::var("VDCD_ANNOUNCE") {
        config.bind.announce = matches!(v.as_str(), "1" | "true" | "yes");
        sources.env_overrides.push("VDCD_ANNOUNCE".into());
    }
    if let Ok(v) = std::env::var("VDCD_STATE_FILE") {
        config.paths.state_file = PathBuf::from(v);
        sources.env_overrides.push("VDCD_STATE_FILE".into());
    }
    if let Ok(v) = std::env::var("VDCD_LOG_LEVEL") {
        config.telemetry.log_level = v;
        sources.env_overrides.push("VDCD_LOG_LEVEL".into());
    }
}
