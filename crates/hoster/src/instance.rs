//! Named server instances and the registry that serves them.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use hoster_files::Workspace;
use tracing::{info, warn};

use crate::backup::BackupService;
use crate::command::CommandChannel;
use crate::config::{AppConfig, InstanceConfig};
use crate::console::ConsoleLogBuffer;
use crate::status::StatusReporter;
use crate::supervisor::{ProcessSupervisor, SupervisorConfig};

/// Everything one managed server owns: process, console, files and backups.
#[derive(Debug)]
pub struct ServerInstance {
    name: String,
    console: Arc<ConsoleLogBuffer>,
    supervisor: ProcessSupervisor,
    status: StatusReporter,
    workspace: Arc<Workspace>,
    backups: BackupService,
}

impl ServerInstance {
    pub fn new(
        name: impl Into<String>,
        config: &InstanceConfig,
        data_dir: &Path,
        max_upload_size: u64,
    ) -> Result<Self> {
        let name = name.into();
        let workspace_dir = config.workspace_path(&name, data_dir)?;
        let backups_dir = config.backups_path(&name, data_dir)?;

        let workspace = Arc::new(
            Workspace::open(&workspace_dir, max_upload_size).with_context(|| {
                format!("opening workspace {}", workspace_dir.display())
            })?,
        );
        std::fs::create_dir_all(&backups_dir)
            .with_context(|| format!("creating backups directory {}", backups_dir.display()))?;

        let console = Arc::new(ConsoleLogBuffer::new(config.console_capacity));
        let supervisor = ProcessSupervisor::new(
            name.clone(),
            workspace.root(),
            SupervisorConfig::from_instance(config),
            console.clone(),
        );
        let status = StatusReporter::new(supervisor.subscribe());
        let backups = BackupService::new(name.clone(), workspace.clone(), backups_dir);

        info!(
            "[{}] Instance ready, workspace at {}",
            name,
            workspace.root().display()
        );

        Ok(Self {
            name,
            console,
            supervisor,
            status,
            workspace,
            backups,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn console(&self) -> &ConsoleLogBuffer {
        &self.console
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub fn commands(&self) -> &CommandChannel {
        self.supervisor.commands()
    }

    pub fn status(&self) -> &StatusReporter {
        &self.status
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn backups(&self) -> &BackupService {
        &self.backups
    }
}

/// All instances served by this backend, keyed by name.
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    instances: DashMap<String, Arc<ServerInstance>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every configured instance.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let data_dir = config.data_dir()?;
        let registry = Self::new();
        for (name, instance) in &config.instances {
            let instance =
                ServerInstance::new(name.clone(), instance, &data_dir, config.max_upload_size())
                    .with_context(|| format!("setting up instance '{}'", name))?;
            registry.insert(instance);
        }
        Ok(registry)
    }

    pub fn insert(&self, instance: ServerInstance) -> Arc<ServerInstance> {
        let instance = Arc::new(instance);
        self.instances
            .insert(instance.name().to_string(), instance.clone());
        instance
    }

    pub fn get(&self, name: &str) -> Option<Arc<ServerInstance>> {
        self.instances.get(name).map(|entry| entry.value().clone())
    }

    /// Instance names in sorted order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.instances.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Stop every running server process.
    pub async fn shutdown_all(&self) {
        let instances: Vec<Arc<ServerInstance>> =
            self.instances.iter().map(|e| e.value().clone()).collect();

        for instance in instances {
            if !instance.supervisor().status().state.is_active() {
                continue;
            }
            info!("[{}] Stopping server for shutdown", instance.name());
            if let Err(e) = instance.supervisor().shutdown().await {
                warn!("[{}] Failed to stop server: {}", instance.name(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_INSTANCE;
    use tempfile::TempDir;

    #[test]
    fn test_instance_creates_directories() {
        let dir = TempDir::new().unwrap();
        let instance =
            ServerInstance::new("survival", &InstanceConfig::default(), dir.path(), 1024).unwrap();

        assert!(dir.path().join("server_instances/survival").is_dir());
        assert!(dir.path().join("backups/survival").is_dir());
        assert_eq!(instance.name(), "survival");
        assert_eq!(instance.console().capacity(), 1000);
        assert_eq!(instance.status().report().server_status, "stopped");
        assert_eq!(instance.workspace().max_upload_size(), 1024);
    }

    #[test]
    fn test_registry_from_config() {
        let dir = TempDir::new().unwrap();
        let mut config = AppConfig::default();
        config.paths.data_dir = Some(dir.path().display().to_string());
        config
            .instances
            .insert("creative".to_string(), InstanceConfig::default());

        let registry = InstanceRegistry::from_config(&config).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.names(),
            vec!["creative".to_string(), DEFAULT_INSTANCE.to_string()]
        );
        assert!(registry.get("creative").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[tokio::test]
    async fn test_shutdown_all_with_nothing_running() {
        let dir = TempDir::new().unwrap();
        let registry = InstanceRegistry::new();
        registry.insert(
            ServerInstance::new("default", &InstanceConfig::default(), dir.path(), 1024).unwrap(),
        );
        registry.shutdown_all().await;
        let instance = registry.get("default").unwrap();
        assert_eq!(instance.status().report().server_status, "stopped");
    }
}
