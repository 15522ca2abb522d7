use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, anyhow};
use tokio::process::Command;
use tokio::time::timeout;

/// Run `cmd` to completion within `limit` and return its trimmed stdout.
/// A non-zero exit becomes an error carrying the program name and stderr.
/// The child is killed if the limit passes first.
pub async fn run_checked(mut cmd: Command, limit: Duration) -> Result<String> {
    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    cmd.kill_on_drop(true);

    let output = match timeout(limit, cmd.output()).await {
        Ok(result) => result.map_err(|e| anyhow!("{program}: {e}"))?,
        Err(_) => return Err(anyhow!("{program} timed out after {limit:?}")),
    };
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!("{program} exited with {}: {}", output.status, stderr.trim()));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Resolve `name` the way a shell would: as a path when it has a slash,
/// otherwise through `PATH`.
pub fn find_binary(name: &str) -> Option<PathBuf> {
    if name.contains('/') {
        return Path::new(name).is_file().then(|| PathBuf::from(name));
    }
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}
