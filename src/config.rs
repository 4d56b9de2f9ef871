//! Configuration for the overlay host
//!
//! Loads configuration from TOML file at `~/.config/imgoverlay/config.toml`
//! Auto-generates default config file on first run if missing.
//!
//! Settings in the `IMGOVERLAY_CONFIG` environment variable override the
//! file, e.g. `IMGOVERLAY_CONFIG=socket=/tmp/overlay.sock:no_display`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::registry::{DEFAULT_MAX_IMAGES, DEFAULT_MAX_SHM_BYTES, Limits};
use crate::session::Endpoint;

/// Environment variable holding `key=value` overrides
pub const ENV_VAR: &str = "IMGOVERLAY_CONFIG";

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub socket: SocketConfig,
    pub limits: LimitsConfig,
    pub host: HostConfig,
}

impl Config {
    /// Load configuration from file, or use defaults if file doesn't exist,
    /// then apply `IMGOVERLAY_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        let mut config = if !config_path.exists() {
            info!("Config file not found at {:?}, using defaults", config_path);
            // Auto-generate default config file
            if let Err(e) = Self::save_default(&config_path) {
                warn!("Failed to create default config file: {}", e);
            }
            Self::default()
        } else {
            Self::load_from(&config_path)?
        };

        if let Ok(env) = std::env::var(ENV_VAR) {
            config.apply_overrides(&env);
        }

        debug!("Config: {:?}", config);
        Ok(config)
    }

    /// Load a specific config file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).context("Failed to read config file")?;
        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;
        info!("Configuration loaded from {:?}", path);
        Ok(config)
    }

    /// Get the path to the config file
    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("imgoverlay");

        Ok(config_dir.join("config.toml"))
    }

    /// Save default configuration to file
    fn save_default(path: &Path) -> Result<()> {
        // Create config directory if it doesn't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let toml_string = toml::to_string_pretty(&Self::default())
            .context("Failed to serialize default config")?;

        fs::write(path, toml_string).context("Failed to write default config file")?;

        info!("Created default config file at {:?}", path);
        Ok(())
    }

    /// Apply `key=value` overrides in `IMGOVERLAY_CONFIG` syntax
    pub fn apply_overrides(&mut self, env: &str) {
        for (key, value) in parse_env(env) {
            if let Err(e) = self.apply_option(&key, &value) {
                warn!("Ignoring {}={}: {}", key, value, e);
            }
        }
    }

    fn apply_option(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "socket" => self.socket.path = Some(PathBuf::from(value)),
            "abstract" => self.socket.abstract_namespace = parse_bool(value)?,
            "no_display" => self.host.no_display = parse_bool(value)?,
            "max_images" => self.limits.max_images = value.parse()?,
            "max_shm_bytes" => self.limits.max_shm_bytes = value.parse()?,
            "frame_interval_ms" => self.host.frame_interval_ms = value.parse()?,
            _ => warn!("Unknown option '{}'", key),
        }
        Ok(())
    }

    /// Where the control server should listen
    pub fn endpoint(&self) -> Endpoint {
        let path = self.socket.path.clone();
        if self.socket.abstract_namespace {
            let name = path
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_else(|| "imgoverlay".to_string());
            Endpoint::Abstract(name)
        } else {
            path.map(Endpoint::Path).unwrap_or_default()
        }
    }

    pub fn limits(&self) -> Limits {
        Limits {
            max_images: self.limits.max_images,
            max_shm_bytes: self.limits.max_shm_bytes,
        }
    }
}

/// Control socket configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    /// Socket path, or the abstract name when `abstract_namespace` is set.
    /// Defaults to `$XDG_RUNTIME_DIR/imgoverlay.sock`.
    pub path: Option<PathBuf>,
    pub abstract_namespace: bool,
}

/// Per-producer resource limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_images: usize,
    /// Ceiling on one shared-memory double buffer, both halves
    pub max_shm_bytes: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_images: DEFAULT_MAX_IMAGES,
            max_shm_bytes: DEFAULT_MAX_SHM_BYTES,
        }
    }
}

/// Host loop configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Pump period in milliseconds
    pub frame_interval_ms: u64,
    /// Track images but never upload or draw them
    pub no_display: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            frame_interval_ms: 16,
            no_display: false,
        }
    }
}

fn is_delimiter(c: char) -> bool {
    matches!(c, ',' | ':' | ';')
}

/// Split `IMGOVERLAY_CONFIG` into `(key, value)` pairs.
///
/// Pairs are separated by `,`, `:` or `;`. A key without `=` gets the
/// value `1`. A backslash escapes a separator inside a value.
pub fn parse_env(env: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut chars = env.chars().peekable();

    while chars.peek().is_some() {
        let mut key = String::new();
        let mut value: Option<String> = None;

        while let Some(c) = chars.next() {
            if is_delimiter(c) {
                break;
            }
            if let Some(v) = value.as_mut() {
                if c == '\\' && chars.peek().is_some_and(|&n| is_delimiter(n) || n == '=') {
                    if let Some(escaped) = chars.next() {
                        v.push(escaped);
                    }
                } else {
                    v.push(c);
                }
            } else if c == '=' {
                value = Some(String::new());
            } else {
                key.push(c);
            }
        }

        if key.is_empty() {
            continue;
        }
        pairs.push((key, value.unwrap_or_else(|| "1".to_string())));
    }

    pairs
}

fn parse_bool(value: &str) -> Result<bool> {
    match value {
        "true" | "yes" | "on" => Ok(true),
        "false" | "no" | "off" => Ok(false),
        _ => Ok(value.parse::<i64>().context("expected a number or boolean")? != 0),
    }
}
