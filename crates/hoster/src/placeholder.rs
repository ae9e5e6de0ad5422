//! Placeholder server script for trying the panel without a real game server.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub const PLACEHOLDER_FILE_NAME: &str = "dummy_server.sh";

/// Echoes every input line and exits 0 on `stop`, SIGTERM or end of input.
pub const PLACEHOLDER_SCRIPT: &str = r#"#!/usr/bin/env bash
# Placeholder game server managed by hoster.

trap 'echo "SIGTERM received, shutting down."; exit 0' TERM

echo "Dummy server started (PID $$)."
echo "Type 'stop' to shut down."

while true; do
  if ! read -r cmd; then
    echo "Input closed, shutting down."
    exit 0
  fi
  echo "CMD_RECEIVED: $cmd"
  if [ "$cmd" = "stop" ]; then
    echo "Stop command received, shutting down."
    exit 0
  fi
done
"#;

/// Write the placeholder script into `workspace`, unless one already exists.
pub fn write_placeholder(workspace: &Path) -> Result<PathBuf> {
    let path = workspace.join(PLACEHOLDER_FILE_NAME);
    if path.exists() {
        return Ok(path);
    }

    fs::create_dir_all(workspace)
        .with_context(|| format!("creating workspace {}", workspace.display()))?;
    fs::write(&path, PLACEHOLDER_SCRIPT)
        .with_context(|| format!("writing placeholder script to {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
            .with_context(|| format!("making {} executable", path.display()))?;
    }

    Ok(path)
}
