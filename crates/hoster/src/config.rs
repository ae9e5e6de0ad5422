//! Application configuration.
//!
//! Loaded in layers: built-in defaults, the TOML config file, then
//! `HOSTER__SECTION__KEY` environment variables.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::APP_NAME;

/// Name of the instance synthesized when none is configured.
pub const DEFAULT_INSTANCE: &str = "default";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub paths: PathsConfig,
    pub instances: BTreeMap<String, InstanceConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let mut instances = BTreeMap::new();
        instances.insert(DEFAULT_INSTANCE.to_string(), InstanceConfig::default());
        Self {
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            paths: PathsConfig::default(),
            instances,
        }
    }
}

impl AppConfig {
    /// Make sure at least one instance exists and the default instance is served.
    pub fn normalize(&mut self) {
        if self.instances.is_empty() {
            self.instances
                .insert(self.server.default_instance.clone(), InstanceConfig::default());
        }
        if !self.instances.contains_key(&self.server.default_instance) {
            if let Some(first) = self.instances.keys().next() {
                self.server.default_instance = first.clone();
            }
        }
    }

    /// Resolve the data directory, honouring `[paths] data_dir`.
    pub fn data_dir(&self) -> Result<PathBuf> {
        match self.paths.data_dir {
            Some(ref dir) => expand_str_path(dir),
            None => default_data_dir(),
        }
    }

    pub fn max_upload_size(&self) -> u64 {
        self.server.max_upload_size_mb.saturating_mul(1024 * 1024)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_upload_size_mb: u64,
    /// Instance served by the unprefixed routes.
    pub default_instance: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            max_upload_size_mb: 100,
            default_instance: DEFAULT_INSTANCE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
}

/// Settings for one managed server instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    /// Workspace root. Defaults to `<data_dir>/server_instances/<name>`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_dir: Option<String>,
    /// Backup target. Defaults to `<data_dir>/backups/<name>`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backups_dir: Option<String>,
    /// Launch target relative to the workspace root. `.jar` files run through Java.
    pub executable: String,
    pub args: Vec<String>,
    pub java_binary: String,
    pub memory_mb: u32,
    /// Line written to the process input to request a graceful stop.
    pub stop_command: String,
    pub stop_timeout_secs: u64,
    pub kill_grace_secs: u64,
    pub startup_grace_ms: u64,
    pub console_capacity: usize,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            workspace_dir: None,
            backups_dir: None,
            executable: "server.jar".to_string(),
            args: Vec::new(),
            java_binary: "java".to_string(),
            memory_mb: 1024,
            stop_command: "stop".to_string(),
            stop_timeout_secs: 10,
            kill_grace_secs: 5,
            startup_grace_ms: 500,
            console_capacity: 1000,
        }
    }
}

impl InstanceConfig {
    pub fn workspace_path(&self, name: &str, data_dir: &Path) -> Result<PathBuf> {
        match self.workspace_dir {
            Some(ref dir) => expand_str_path(dir),
            None => Ok(data_dir.join("server_instances").join(name)),
        }
    }

    pub fn backups_path(&self, name: &str, data_dir: &Path) -> Result<PathBuf> {
        match self.backups_dir {
            Some(ref dir) => expand_str_path(dir),
            None => Ok(data_dir.join("backups").join(name)),
        }
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }
}

/// Load the config file (writing a default one first if missing) and apply
/// environment overrides.
pub fn load_or_init_config(config_file: &Path) -> Result<AppConfig> {
    if !config_file.exists() {
        write_default_config(config_file)?;
    }
    load_config(config_file)
}

pub fn load_config(config_file: &Path) -> Result<AppConfig> {
    let defaults = ServerConfig::default();
    let built = Config::builder()
        .set_default("server.host", defaults.host)?
        .set_default("server.port", i64::from(defaults.port))?
        .set_default("server.max_upload_size_mb", defaults.max_upload_size_mb as i64)?
        .set_default("server.default_instance", defaults.default_instance)?
        .set_default("logging.level", "info")?
        .add_source(
            File::from(config_file)
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix(&env_prefix()).separator("__"))
        .build()
        .with_context(|| format!("loading config from {}", config_file.display()))?;

    let mut config: AppConfig = built
        .try_deserialize()
        .context("deserializing configuration")?;
    config.normalize();
    Ok(config)
}

pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = default_config_header(path);
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

/// Point `instance` at `executable` in the config file on disk.
///
/// Edits the file's own TOML so environment overrides never leak into it.
/// Comments other than the generated header are not preserved.
pub fn set_instance_executable(path: &Path, instance: &str, executable: &str) -> Result<()> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let mut table: toml::Table = text
        .parse()
        .with_context(|| format!("parsing config file {}", path.display()))?;

    let instances = table
        .entry("instances")
        .or_insert_with(|| toml::Value::Table(toml::Table::new()))
        .as_table_mut()
        .ok_or_else(|| anyhow!("`instances` in {} is not a table", path.display()))?;
    let entry = instances
        .entry(instance)
        .or_insert_with(|| toml::Value::Table(toml::Table::new()))
        .as_table_mut()
        .ok_or_else(|| anyhow!("`instances.{instance}` in {} is not a table", path.display()))?;
    entry.insert(
        "executable".to_string(),
        toml::Value::String(executable.to_string()),
    );

    let mut body = default_config_header(path);
    body.push_str(&toml::to_string_pretty(&table).context("serializing config to TOML")?);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> String {
    let mut buffer = String::new();
    buffer.push_str("# Configuration for ");
    buffer.push_str(APP_NAME);
    buffer.push('\n');
    buffer.push_str("# File: ");
    buffer.push_str(&path.display().to_string());
    buffer.push_str("\n\n");
    buffer
}

pub fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

pub fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

pub fn default_config_file() -> Result<PathBuf> {
    Ok(default_config_dir()?.join("config.toml"))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

pub fn default_data_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::data_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("share").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine data directory"))
}

fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_has_default_instance() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.server.default_instance, DEFAULT_INSTANCE);
        let instance = &config.instances[DEFAULT_INSTANCE];
        assert_eq!(instance.executable, "server.jar");
        assert_eq!(instance.stop_command, "stop");
        assert_eq!(instance.stop_timeout(), Duration::from_secs(10));
        assert_eq!(instance.kill_grace(), Duration::from_secs(5));
        assert_eq!(instance.console_capacity, 1000);
    }

    #[test]
    fn test_default_config_roundtrips_through_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = load_or_init_config(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.server.max_upload_size_mb, 100);
        assert!(config.instances.contains_key(DEFAULT_INSTANCE));

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("# Configuration for hoster"));
    }

    #[test]
    fn test_set_instance_executable_rewrites_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        write_default_config(&path).unwrap();

        set_instance_executable(&path, DEFAULT_INSTANCE, "dummy_server.sh").unwrap();

        let config = load_config(&path).unwrap();
        let instance = &config.instances[DEFAULT_INSTANCE];
        assert_eq!(instance.executable, "dummy_server.sh");
        assert_eq!(instance.stop_command, "stop");
        assert_eq!(config.server.port, 5000);
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("# Configuration for hoster"));
    }

    #[test]
    fn test_set_instance_executable_adds_missing_instance() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[server]\nport = 6000\n").unwrap();

        set_instance_executable(&path, "lobby", "lobby.sh").unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.server.port, 6000);
        assert_eq!(config.instances["lobby"].executable, "lobby.sh");
    }

    #[test]
    fn test_file_values_override_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[server]
port = 8123
default_instance = "survival"

[instances.survival]
executable = "dummy_server.sh"
stop_timeout_secs = 3
console_capacity = 50
"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.server.port, 8123);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.instances.len(), 1);
        let survival = &config.instances["survival"];
        assert_eq!(survival.executable, "dummy_server.sh");
        assert_eq!(survival.stop_timeout_secs, 3);
        assert_eq!(survival.console_capacity, 50);
        assert_eq!(survival.kill_grace_secs, 5);
    }

    #[test]
    fn test_normalize_repairs_unknown_default_instance() {
        let mut config = AppConfig::default();
        config.instances.clear();
        config
            .instances
            .insert("creative".to_string(), InstanceConfig::default());
        config.server.default_instance = "missing".to_string();
        config.normalize();
        assert_eq!(config.server.default_instance, "creative");

        let mut empty = AppConfig::default();
        empty.instances.clear();
        empty.normalize();
        assert!(empty.instances.contains_key(DEFAULT_INSTANCE));
    }

    #[test]
    fn test_instance_paths_default_under_data_dir() {
        let instance = InstanceConfig::default();
        let data_dir = PathBuf::from("/var/lib/hoster");
        assert_eq!(
            instance.workspace_path("default", &data_dir).unwrap(),
            data_dir.join("server_instances").join("default")
        );
        assert_eq!(
            instance.backups_path("default", &data_dir).unwrap(),
            data_dir.join("backups").join("default")
        );
    }
}
