//! Test utilities and common setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::Router;
use hoster::api::{self, AppState};
use hoster::config::InstanceConfig;
use hoster::placeholder::{PLACEHOLDER_FILE_NAME, write_placeholder};
use hoster::{InstanceRegistry, ServerInstance};
use tempfile::TempDir;

pub const MAX_UPLOAD_SIZE: u64 = 1024 * 1024;

/// Router plus the state it serves. The temp dir lives as long as the app.
pub struct TestApp {
    pub router: Router,
    pub registry: Arc<InstanceRegistry>,
    pub dir: TempDir,
}

impl TestApp {
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn workspace(&self, instance: &str) -> PathBuf {
        self.registry
            .get(instance)
            .unwrap()
            .workspace()
            .root()
            .to_path_buf()
    }
}

fn bash() -> String {
    ["/bin/bash", "/usr/bin/bash"]
        .into_iter()
        .find(|path| Path::new(path).exists())
        .unwrap_or("/bin/bash")
        .to_string()
}

fn instance_config(dir: &Path, name: &str) -> InstanceConfig {
    let workspace = dir.join("server_instances").join(name);
    std::fs::create_dir_all(&workspace).unwrap();
    write_placeholder(&workspace).unwrap();

    InstanceConfig {
        workspace_dir: Some(workspace.to_string_lossy().into_owned()),
        backups_dir: Some(dir.join("backups").join(name).to_string_lossy().into_owned()),
        executable: bash(),
        args: vec![PLACEHOLDER_FILE_NAME.to_string()],
        stop_timeout_secs: 5,
        kill_grace_secs: 2,
        startup_grace_ms: 300,
        ..InstanceConfig::default()
    }
}

/// Create a test application with a `default` and a `lobby` instance, both
/// running the placeholder server script.
pub async fn test_app() -> TestApp {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(InstanceRegistry::new());

    for name in ["default", "lobby"] {
        let config = instance_config(dir.path(), name);
        let instance = ServerInstance::new(name, &config, dir.path(), MAX_UPLOAD_SIZE).unwrap();
        registry.insert(instance);
    }

    let state = AppState::new(registry.clone(), "default");
    let router = api::create_router(state, MAX_UPLOAD_SIZE);

    TestApp {
        router,
        registry,
        dir,
    }
}
