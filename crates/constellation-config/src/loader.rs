use constellation_common::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::model::AppConfig;

const ENV_ANTHROPIC_API_KEY: &str = "CONSTELLATION_ANTHROPIC_API_KEY";
const ENV_ANTHROPIC_BASE_URL: &str = "CONSTELLATION_ANTHROPIC_BASE_URL";
const ENV_OPENROUTER_API_KEY: &str = "CONSTELLATION_OPENROUTER_API_KEY";
const ENV_OPENROUTER_BASE_URL: &str = "CONSTELLATION_OPENROUTER_BASE_URL";
const ENV_DATABASE_PATH: &str = "CONSTELLATION_DATABASE_PATH";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigFormat {
    Yaml,
    Toml,
}

impl ConfigFormat {
    fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yml") | Some("yaml") => Ok(ConfigFormat::Yaml),
            Some("toml") => Ok(ConfigFormat::Toml),
            other => Err(Error::Config(format!(
                "unsupported config file extension {:?} for {}",
                other,
                path.display()
            ))),
        }
    }
}

/// Reads `AppConfig` from disk and overlays process environment.
///
/// The environment is only consulted here; everything downstream receives an
/// explicit config value.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    path: Option<PathBuf>,
    load_dotenv: bool,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            path: None,
            load_dotenv: true,
        }
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            load_dotenv: true,
        }
    }

    pub fn without_dotenv(mut self) -> Self {
        self.load_dotenv = false;
        self
    }

    pub fn default_config_dir() -> PathBuf {
        dirs::home_dir()
            .map(|home| home.join(".constellation"))
            .unwrap_or_else(|| PathBuf::from(".constellation"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join("config.yml")
    }

    pub fn load(&self) -> Result<AppConfig> {
        if self.load_dotenv && let Ok(path) = dotenvy::dotenv() {
            debug!("loaded environment from {}", path.display());
        }
        let mut config = self.load_file()?;
        apply_env_overrides(&mut config, |key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load the file without the environment overlay.
    pub fn load_file(&self) -> Result<AppConfig> {
        let path = match &self.path {
            Some(path) => {
                if !path.exists() {
                    return Err(Error::Config(format!(
                        "config file {} does not exist",
                        path.display()
                    )));
                }
                path.clone()
            }
            None => {
                let path = Self::default_config_path();
                if !path.exists() {
                    debug!("no config at {}, using defaults", path.display());
                    return Ok(AppConfig::default());
                }
                path
            }
        };

        let contents = std::fs::read_to_string(&path)?;
        let config = parse(&contents, ConfigFormat::from_path(&path)?)
            .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))?;
        info!("loaded configuration from {}", path.display());
        Ok(config)
    }
}

fn parse(contents: &str, format: ConfigFormat) -> std::result::Result<AppConfig, String> {
    if contents.trim().is_empty() {
        return Ok(AppConfig::default());
    }
    match format {
        ConfigFormat::Yaml => serde_yaml::from_str(contents).map_err(|e| e.to_string()),
        ConfigFormat::Toml => toml::from_str(contents).map_err(|e| e.to_string()),
    }
}

/// Overlay `CONSTELLATION_*` variables onto `config`.
pub fn apply_env_overrides(config: &mut AppConfig, lookup: impl Fn(&str) -> Option<String>) {
    let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

    if let Some(key) = get(ENV_ANTHROPIC_API_KEY) {
        config.gateway.anthropic_api_key = Some(key);
    }
    if let Some(url) = get(ENV_ANTHROPIC_BASE_URL) {
        config.gateway.anthropic_base_url = Some(url);
    }
    if let Some(key) = get(ENV_OPENROUTER_API_KEY) {
        config.gateway.openrouter_api_key = Some(key);
    }
    if let Some(url) = get(ENV_OPENROUTER_BASE_URL) {
        config.gateway.openrouter_base_url = Some(url);
    }
    if let Some(path) = get(ENV_DATABASE_PATH) {
        config.memory.database_path = Some(PathBuf::from(path));
    }
}
