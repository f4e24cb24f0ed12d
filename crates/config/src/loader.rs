use std::{
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use {
    anyhow::Context,
    secrecy::Secret,
    tracing::{debug, warn},
};

use crate::{env_subst::substitute_env, schema::WagateConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &["wagate.toml", "wagate.yaml", "wagate.yml", "wagate.json"];

/// Override for the config directory, set via `set_config_dir()`.
static CONFIG_DIR_OVERRIDE: Mutex<Option<PathBuf>> = Mutex::new(None);

/// Lock guarding config writes.
static CONFIG_SAVE_LOCK: Mutex<()> = Mutex::new(());

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Set a custom config directory. When set, discovery only looks here.
pub fn set_config_dir(path: PathBuf) {
    *lock(&CONFIG_DIR_OVERRIDE) = Some(path);
}

/// Clear the config directory override, restoring default discovery.
pub fn clear_config_dir() {
    *lock(&CONFIG_DIR_OVERRIDE) = None;
}

fn config_dir_override() -> Option<PathBuf> {
    lock(&CONFIG_DIR_OVERRIDE).clone()
}

/// Load config from the given path (any supported format), then apply env overrides.
pub fn load_config(path: &Path) -> anyhow::Result<WagateConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let raw = substitute_env(&raw);
    let mut config = parse_config(&raw, path)?;
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./wagate.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/wagate/wagate.{toml,yaml,yml,json}` (user-global)
///
/// Writes and returns the defaults if nothing is found.
pub fn discover_and_load() -> WagateConfig {
    let Some(path) = find_config_file() else {
        debug!("no config file found, writing default config");
        let config = WagateConfig::default();
        if let Err(e) = write_default_config(&config) {
            warn!(error = %e, "failed to write default config file");
        }
        let mut config = config;
        apply_env_overrides(&mut config);
        return config;
    };

    debug!(path = %path.display(), "loading config");
    match load_config(&path) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            let mut config = WagateConfig::default();
            apply_env_overrides(&mut config);
            config
        },
    }
}

/// Environment variables that win over file values.
fn apply_env_overrides(config: &mut WagateConfig) {
    if let Some(token) = non_empty_env("WAGATE_TOKEN") {
        config.server.api_token = Some(Secret::new(token));
    }
    if let Some(url) = non_empty_env("WEBHOOK_URL") {
        config.webhook.default_url = Some(url);
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Find the first config file in standard locations.
fn find_config_file() -> Option<PathBuf> {
    if let Some(dir) = config_dir_override() {
        return CONFIG_FILENAMES
            .iter()
            .map(|name| dir.join(name))
            .find(|p| p.exists());
    }

    CONFIG_FILENAMES
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
        .or_else(|| {
            let dir = home_dir()?.join(".config").join("wagate");
            CONFIG_FILENAMES
                .iter()
                .map(|name| dir.join(name))
                .find(|p| p.exists())
        })
}

/// Returns the config directory: override, or `~/.config/wagate/`.
pub fn config_dir() -> Option<PathBuf> {
    if let Some(dir) = config_dir_override() {
        return Some(dir);
    }
    home_dir().map(|h| h.join(".config").join("wagate"))
}

/// Returns the data directory: `~/.wagate/`.
pub fn data_dir() -> PathBuf {
    home_dir()
        .map(|h| h.join(".wagate"))
        .unwrap_or_else(|| PathBuf::from(".wagate"))
}

fn home_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf())
}

fn find_or_default_config_path() -> PathBuf {
    if let Some(path) = find_config_file() {
        return path;
    }
    config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("wagate.toml")
}

/// Serialize `config` to TOML at the discovered (or default) path.
pub fn save_config(config: &WagateConfig) -> anyhow::Result<PathBuf> {
    let _guard = lock(&CONFIG_SAVE_LOCK);
    let path = find_or_default_config_path();
    write_toml(&path, config)?;
    debug!(path = %path.display(), "saved config");
    Ok(path)
}

/// Only called when no config file exists yet.
fn write_default_config(config: &WagateConfig) -> anyhow::Result<()> {
    let _guard = lock(&CONFIG_SAVE_LOCK);
    let path = find_or_default_config_path();
    if path.exists() {
        return Ok(());
    }
    write_toml(&path, config)?;
    debug!(path = %path.display(), "wrote default config file");
    Ok(())
}

fn write_toml(path: &Path, config: &WagateConfig) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(config).context("serialize config")?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<WagateConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}

impl WagateConfig {
    /// Credential root (file backend) or sled path, defaulting under the data dir.
    pub fn credentials_path(&self) -> PathBuf {
        self.credentials
            .dir
            .clone()
            .unwrap_or_else(|| data_dir().join("auth"))
    }

    /// SQLite URL for instance records and stats, defaulting under the data dir.
    pub fn database_url(&self) -> String {
        self.database.url.clone().unwrap_or_else(|| {
            format!("sqlite://{}?mode=rwc", data_dir().join("wagate.db").display())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_format() {
        let dir = tempfile::tempdir().unwrap();

        let toml_path = dir.path().join("wagate.toml");
        std::fs::write(&toml_path, "[server]\nport = 9100\n").unwrap();
        assert_eq!(load_config(&toml_path).unwrap().server.port, 9100);

        let yaml_path = dir.path().join("wagate.yaml");
        std::fs::write(&yaml_path, "server:\n  port: 9200\n").unwrap();
        assert_eq!(load_config(&yaml_path).unwrap().server.port, 9200);

        let json_path = dir.path().join("wagate.json");
        std::fs::write(&json_path, r#"{"server":{"port":9300}}"#).unwrap();
        assert_eq!(load_config(&json_path).unwrap().server.port, 9300);
    }

    #[test]
    fn rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wagate.ini");
        std::fs::write(&path, "port=1").unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn explicit_paths_override_data_dir_defaults() {
        let mut cfg = WagateConfig::default();
        cfg.credentials.dir = Some(PathBuf::from("/tmp/creds"));
        cfg.database.url = Some("sqlite::memory:".into());
        assert_eq!(cfg.credentials_path(), PathBuf::from("/tmp/creds"));
        assert_eq!(cfg.database_url(), "sqlite::memory:");
        assert!(WagateConfig::default().credentials_path().ends_with("auth"));
    }

    #[test]
    fn override_dir_is_isolated_and_gets_default_file() {
        let dir = tempfile::tempdir().unwrap();
        set_config_dir(dir.path().to_path_buf());
        let cfg = discover_and_load();
        assert_eq!(cfg.server.bind, "127.0.0.1");
        assert!(dir.path().join("wagate.toml").exists());
        clear_config_dir();
    }
}
