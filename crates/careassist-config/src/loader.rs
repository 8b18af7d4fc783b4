use std::path::{Path, PathBuf};

use careassist_common::{Error, Result};
use tracing::{debug, info, warn};

use crate::model::AppConfig;

const CONFIG_FILE: &str = "config.yml";
const DB_FILE: &str = "careassist.db";

/// Resolves configuration from `~/.careassist/config.yml`, `.env` and the
/// process environment, in that order of increasing precedence.
pub struct ConfigLoader {
    config_dir: PathBuf,
}

impl ConfigLoader {
    pub fn new() -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| Error::Config("could not determine home directory".into()))?;
        Ok(Self {
            config_dir: home.join(".careassist"),
        })
    }

    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: dir.into(),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    /// Default database location when `database.path` is unset.
    pub fn default_db_path(&self) -> PathBuf {
        self.config_dir.join(DB_FILE)
    }

    /// Load the effective configuration and validate it.
    pub fn load(&self) -> Result<AppConfig> {
        let config = self.load_file()?;
        finish(config)
    }

    /// Like [`load`](Self::load) but reads an explicit file, which must exist.
    pub fn load_path(&self, path: &Path) -> Result<AppConfig> {
        let config = Self::load_from(path)?;
        finish(config)
    }

    /// Load from `path` only, with no environment overrides.
    pub fn load_from(path: &Path) -> Result<AppConfig> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        parse_yaml(&raw, path)
    }

    fn load_file(&self) -> Result<AppConfig> {
        let path = self.config_path();
        if !path.exists() {
            info!("no config file at {}, using defaults", path.display());
            return Ok(AppConfig::default());
        }
        info!("loading config from {}", path.display());
        Self::load_from(&path)
    }

    /// Resolve the database path, creating its parent directory.
    pub fn resolve_db_path(&self, config: &AppConfig) -> Result<PathBuf> {
        let path = config
            .database
            .path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.default_db_path());
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Config(format!(
                    "failed to create database directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
        Ok(path)
    }
}

fn parse_yaml(raw: &str, path: &Path) -> Result<AppConfig> {
    if raw.trim().is_empty() {
        warn!("config file {} is empty, using defaults", path.display());
        return Ok(AppConfig::default());
    }
    serde_yaml::from_str(raw)
        .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))
}

fn finish(mut config: AppConfig) -> Result<AppConfig> {
    if let Err(e) = dotenvy::dotenv() {
        debug!("no .env loaded: {e}");
    }
    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

/// Apply `CAREASSIST_*` overrides. `lookup` is injected so tests do not
/// touch the process environment.
pub fn apply_env_overrides<F>(config: &mut AppConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(provider) = get("CAREASSIST_LLM_PROVIDER") {
        config.llm.provider = provider.trim().to_ascii_lowercase();
    }
    if let Some(model) = get("CAREASSIST_LLM_MODEL") {
        config.llm.model = Some(model);
    }
    if let Some(base_url) = get("CAREASSIST_LLM_BASE_URL") {
        config.llm.base_url = Some(base_url);
    }

    let vendor_key = match config.llm.provider.as_str() {
        "anthropic" => Some("ANTHROPIC_API_KEY"),
        "openai" => Some("OPENAI_API_KEY"),
        _ => None,
    };
    if let Some(key) = get("CAREASSIST_LLM_API_KEY") {
        config.llm.api_key = Some(key);
    } else if config.llm.api_key.is_none() {
        config.llm.api_key = vendor_key.and_then(get);
    }

    if let Some(path) = get("CAREASSIST_DB_PATH") {
        config.database.path = Some(path);
    }
    if let Some(port) = get("CAREASSIST_PORT") {
        config.gateway.port = port
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("CAREASSIST_PORT is not a valid port: {port}")))?;
    }
    if let Some(host) = get("CAREASSIST_HOST") {
        config.gateway.host = host;
    }
    if let Some(key) = get("CAREASSIST_API_KEY") {
        config.gateway.api_key = Some(key);
    }
    Ok(())
}
