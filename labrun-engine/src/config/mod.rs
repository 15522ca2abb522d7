use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, path::PathBuf, time::Duration};
use tracing::{info, warn};

fn default_log_level() -> String {
    "info".to_string()
}
fn default_artifact_dir() -> PathBuf {
    std::env::temp_dir().join("labrun")
}
fn default_docker_binary() -> String {
    "docker".to_string()
}
fn default_docker_network() -> String {
    "host".to_string()
}
fn default_autossh_binary() -> String {
    "autossh".to_string()
}
fn default_ssh_user() -> String {
    "root".to_string()
}
fn default_tunnel_ready_timeout() -> u64 {
    10 // s
}
fn default_tunnel_poll_interval() -> u64 {
    100 // ms
}
fn default_lro_poll_interval() -> u64 {
    1000 // ms
}
fn default_image_wait_timeout() -> u64 {
    1800 // 30 min
}
fn default_image_poll_interval() -> u64 {
    30
}
fn default_command_timeout() -> u64 {
    300 // 5 min
}
fn default_gce_project() -> String {
    "chromeos-gce-tests".to_string()
}
fn default_gce_zone() -> String {
    "us-central1-b".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Root for per-service log dirs and test artifacts.
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,
    #[serde(default = "default_docker_binary")]
    pub docker_binary: String,
    #[serde(default = "default_docker_network")]
    pub docker_network: String,
    #[serde(default = "default_autossh_binary")]
    pub autossh_binary: String,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    #[serde(default)]
    pub ssh_identity_file: Option<PathBuf>,
    #[serde(default = "default_tunnel_ready_timeout")]
    pub tunnel_ready_timeout_secs: u64,
    #[serde(default = "default_tunnel_poll_interval")]
    pub tunnel_poll_interval_ms: u64,
    #[serde(default = "default_lro_poll_interval")]
    pub lro_poll_interval_ms: u64,
    #[serde(default = "default_image_wait_timeout")]
    pub image_wait_timeout_secs: u64,
    #[serde(default = "default_image_poll_interval")]
    pub image_poll_interval_secs: u64,
    /// Upper bound for docker CLI invocations.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_gce_project")]
    pub gce_project: String,
    #[serde(default = "default_gce_zone")]
    pub gce_zone: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            artifact_dir: default_artifact_dir(),
            docker_binary: default_docker_binary(),
            docker_network: default_docker_network(),
            autossh_binary: default_autossh_binary(),
            ssh_user: default_ssh_user(),
            ssh_identity_file: None,
            tunnel_ready_timeout_secs: default_tunnel_ready_timeout(),
            tunnel_poll_interval_ms: default_tunnel_poll_interval(),
            lro_poll_interval_ms: default_lro_poll_interval(),
            image_wait_timeout_secs: default_image_wait_timeout(),
            image_poll_interval_secs: default_image_poll_interval(),
            command_timeout_secs: default_command_timeout(),
            gce_project: default_gce_project(),
            gce_zone: default_gce_zone(),
        }
    }
}

impl Config {
    // Removes the persisted config from the system
    pub fn clear() -> Result<()> {
        let path = Self::config_file_path()?;
        if path.exists() {
            fs::remove_file(&path).context("Failed to delete config file")?;
            info!("Deleted config file at {:?}", path);
        } else {
            warn!("No config file found at {:?}", path);
        }
        Ok(())
    }

    pub fn load() -> Result<Self> {
        let config_path = Self::config_file_path()?;

        if config_path.exists() {
            Self::from_file(&config_path)
        } else {
            warn!("Config file not found, using defaults");
            let config = Self::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config =
            serde_json::from_str(&contents).context("Failed to parse config file")?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_file_path()?;
        self.save_to(&config_path)
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        let config_dir = config_path
            .parent()
            .context("Failed to get config directory")?;

        fs::create_dir_all(config_dir).context("Failed to create config directory")?;

        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(config_path, contents).context("Failed to write config file")?;

        info!("Config saved to: {:?}", config_path);
        Ok(())
    }

    pub fn config_file_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().context("Failed to get config directory")?;
        Ok(config_dir.join("labrun").join("config.json"))
    }

    /// Install the process-wide tracing subscriber at `log_level`.
    pub fn init_logging(&self) {
        crate::util::logging::init_tracing(&self.log_level);
    }

    pub fn tunnel_ready_timeout(&self) -> Duration {
        Duration::from_secs(self.tunnel_ready_timeout_secs)
    }

    pub fn tunnel_poll_interval(&self) -> Duration {
        Duration::from_millis(self.tunnel_poll_interval_ms)
    }

    pub fn lro_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lro_poll_interval_ms)
    }

    pub fn image_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.image_wait_timeout_secs)
    }

    pub fn image_poll_interval(&self) -> Duration {
        Duration::from_secs(self.image_poll_interval_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Per-service log dir, mounted into the service container.
    pub fn service_log_dir(&self, container_name: &str) -> PathBuf {
        self.artifact_dir.join(container_name)
    }
}
