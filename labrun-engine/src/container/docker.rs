use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use labrun_shared::dut::IpEndpoint;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{ContainerRuntime, ContainerSpec};
use crate::config::Config;
use crate::util::command::{find_binary, run_checked};
use crate::util::network::{free_local_port, wait_for_local_port};

const READY_TIMEOUT: Duration = Duration::from_secs(60);
const READY_POLL: Duration = Duration::from_millis(200);

/// Runs service containers through the docker CLI.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    binary: String,
    network: String,
    command_timeout: Duration,
}

impl DockerRuntime {
    pub fn new(config: &Config) -> Self {
        Self {
            binary: config.docker_binary.clone(),
            network: config.docker_network.clone(),
            command_timeout: config.command_timeout(),
        }
    }

    fn host_network(&self) -> bool {
        self.network == "host"
    }

    fn docker(&self) -> Command {
        Command::new(&self.binary)
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let mut cmd = self.docker();
        cmd.args(["rm", "-f", name]);
        run_checked(cmd, self.command_timeout).await.map(|_| ())
    }

    async fn published_port(&self, name: &str, container_port: u16) -> Result<u16> {
        let mut cmd = self.docker();
        cmd.args(["port", name, &format!("{container_port}/tcp")]);
        let out = run_checked(cmd, self.command_timeout).await?;
        parse_published_port(&out)
            .ok_or_else(|| anyhow!("unexpected `docker port` output: {out:?}"))
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn start(&self, spec: &ContainerSpec) -> Result<IpEndpoint> {
        if find_binary(&self.binary).is_none() {
            return Err(anyhow!("{} not found in PATH", self.binary));
        }
        tokio::fs::create_dir_all(&spec.log_dir)
            .await
            .with_context(|| format!("create {}", spec.log_dir.display()))?;

        // leftovers from an earlier run on this host
        if self.remove(&spec.name).await.is_ok() {
            debug!("removed stale container {}", spec.name);
        }

        let listen_port = if self.host_network() {
            free_local_port().await?
        } else {
            spec.container_port
        };

        let mut cmd = self.docker();
        cmd.args(run_args(spec, &self.network, listen_port));
        let id = run_checked(cmd, self.command_timeout)
            .await
            .with_context(|| format!("docker run {}", spec.name))?;
        debug!("{} started as {}", spec.name, id);

        let host_port = if self.host_network() {
            listen_port
        } else {
            self.published_port(&spec.name, spec.container_port).await?
        };

        if !wait_for_local_port(host_port, READY_TIMEOUT, READY_POLL).await {
            return Err(anyhow!(
                "{} did not accept connections on port {} within {:?}",
                spec.name,
                host_port,
                READY_TIMEOUT
            ));
        }
        Ok(IpEndpoint::new("127.0.0.1", host_port))
    }

    async fn stop(&self, name: &str) -> Result<()> {
        let mut cmd = self.docker();
        cmd.args(["stop", name]);
        if let Err(e) = run_checked(cmd, self.command_timeout).await {
            warn!("docker stop {} failed: {}", name, e);
        }
        self.remove(name).await
    }
}

fn run_args(spec: &ContainerSpec, network: &str, listen_port: u16) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "run".into(),
        "-d".into(),
        "--name".into(),
        spec.name.clone(),
        "--network".into(),
        network.to_string(),
        "-v".into(),
        format!("{}:{}", spec.log_dir.display(), spec.mount_dir),
    ];
    if network != "host" {
        args.push("-p".into());
        args.push(format!("0:{}", spec.container_port));
    }
    args.push(spec.image.clone());
    args.push(spec.binary.clone());
    args.extend(spec.args.iter().cloned());
    args.push(spec.port_flag.clone());
    args.push(listen_port.to_string());
    args
}

/// First `host:port` line of `docker port` output, e.g. `0.0.0.0:49153`.
fn parse_published_port(output: &str) -> Option<u16> {
    output
        .lines()
        .filter_map(|line| line.trim().rsplit_once(':'))
        .find_map(|(_, port)| port.parse().ok())
}
