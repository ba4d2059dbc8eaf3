//! Configuration loading.
//!
//! Loads from `./simstim.toml` (or `$SIMSTIM_CONFIG_PATH`); a missing file
//! means defaults. Environment variables override file values; file values
//! override defaults.
//!
//! The master key is not configuration — it only ever enters through
//! [`crate::cipher::MasterSecret::from_env`].

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

use crate::engine::bridge::DEFAULT_BRIDGE_PORT;
use crate::engine::sidecar::{SidecarSpec, BROWSER_IMAGE, CONTAINER_NAME};
use crate::session::POLL_INTERVAL;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SimstimConfig {
    /// Browser automation settings (`[engine]`).
    pub engine: EngineConfig,
    /// Managed browser container settings (`[sidecar]`).
    pub sidecar: SidecarConfig,
    /// Persistence settings (`[store]`).
    pub store: StoreConfig,
    /// Log output settings (`[logging]`).
    pub logging: LoggingConfig,
}

impl SimstimConfig {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// # Errors
    ///
    /// Returns an error when the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let path = Self::config_path_with(|key| std::env::var(key).ok());
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                info!(path = %path.display(), "loading config from file");
                Self::from_toml(&contents)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("no config file found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!("failed to read config file: {e}")),
        }
    }

    /// Resolve the config path using a custom env resolver (for testing).
    fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        match env("SIMSTIM_CONFIG_PATH") {
            Some(p) => PathBuf::from(p),
            None => PathBuf::from("simstim.toml"),
        }
    }

    /// Parse a TOML string into config.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed TOML.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).context("failed to parse config TOML")
    }

    /// Apply environment variable overrides.
    ///
    /// Takes a resolver function so tests avoid mutating process env.
    fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("SIMSTIM_DRIVER_URL") {
            self.engine.driver_url = Some(v);
        }
        override_parsed(&env, "SIMSTIM_MAX_CONTEXTS", &mut self.engine.max_contexts);
        override_parsed(
            &env,
            "SIMSTIM_SESSION_TIMEOUT_SECS",
            &mut self.engine.session_timeout_secs,
        );
        override_parsed(
            &env,
            "SIMSTIM_SWEEP_INTERVAL_SECS",
            &mut self.engine.sweep_interval_secs,
        );

        override_parsed(&env, "SIMSTIM_SIDECAR_MANAGED", &mut self.sidecar.managed);
        override_parsed(&env, "SIMSTIM_SIDECAR_PORT", &mut self.sidecar.port);
        if let Some(v) = env("SIMSTIM_SIDECAR_IMAGE") {
            self.sidecar.image = v;
        }

        if let Some(v) = env("SIMSTIM_DATABASE_PATH") {
            self.store.database_path = Some(PathBuf::from(v));
        }
        if let Some(v) = env("SIMSTIM_LOG_DIR") {
            self.logging.dir = Some(PathBuf::from(v));
        }
        if let Some(v) = env("SIMSTIM_LOG_LEVEL") {
            self.logging.level = v;
        }
    }
}

/// Parse-and-assign override; invalid values are logged and ignored.
fn override_parsed<T: std::str::FromStr>(
    env: impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    if let Some(v) = env(key) {
        match v.parse() {
            Ok(parsed) => *slot = parsed,
            Err(_) => warn!(var = key, value = %v, "ignoring invalid env override"),
        }
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Browser automation settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Explicit bridge base URL. When unset, the sidecar port is used.
    pub driver_url: Option<String>,
    /// How many browser contexts may live at once.
    pub max_contexts: usize,
    /// Wall-clock deadline per authorization session, in seconds.
    pub session_timeout_secs: u64,
    /// Login poll cadence for callers that loop, in seconds.
    pub poll_interval_secs: u64,
    /// Cadence of the background session expiry sweep, in seconds.
    pub sweep_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            driver_url: None,
            max_contexts: 3,
            session_timeout_secs: 300,
            poll_interval_secs: POLL_INTERVAL.as_secs(),
            sweep_interval_secs: 30,
        }
    }
}

impl EngineConfig {
    /// The session deadline as a [`Duration`].
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    /// The login poll cadence as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// The expiry sweep cadence as a [`Duration`].
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Managed browser container settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SidecarConfig {
    /// Whether simstim starts and supervises the container itself.
    pub managed: bool,
    /// Docker image to run.
    pub image: String,
    /// Container name.
    pub container_name: String,
    /// Host port the bridge is published on.
    pub port: u16,
    /// Whether Chromium runs headless inside the container.
    pub headless: bool,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            managed: false,
            image: BROWSER_IMAGE.to_owned(),
            container_name: CONTAINER_NAME.to_owned(),
            port: DEFAULT_BRIDGE_PORT,
            headless: true,
        }
    }
}

impl SidecarConfig {
    /// The container spec this configuration describes.
    pub fn spec(&self) -> SidecarSpec {
        SidecarSpec {
            image: self.image.clone(),
            container_name: self.container_name.clone(),
            port: self.port,
            headless: self.headless,
        }
    }
}

/// Persistence settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database path. Defaults to `~/.simstim/simstim.db`.
    pub database_path: Option<PathBuf>,
}

impl StoreConfig {
    /// Resolve the database path, creating the parent directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error when the home directory cannot be determined or the
    /// parent directory cannot be created.
    pub fn database_path(&self) -> Result<PathBuf> {
        let path = match &self.database_path {
            Some(path) => path.clone(),
            None => data_dir()?.join("simstim.db"),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        Ok(path)
    }
}

/// Log output settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory for daily JSON log files. Defaults to `~/.simstim/logs`.
    pub dir: Option<PathBuf>,
    /// Default tracing filter when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: None,
            level: "info".to_owned(),
        }
    }
}

impl LoggingConfig {
    /// Resolve the log directory.
    ///
    /// # Errors
    ///
    /// Returns an error when the home directory cannot be determined.
    pub fn logs_dir(&self) -> Result<PathBuf> {
        match &self.dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(data_dir()?.join("logs")),
        }
    }
}

/// Resolve the default data directory (`~/.simstim/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn data_dir() -> Result<PathBuf> {
    let base = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(base.home_dir().join(".simstim"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
