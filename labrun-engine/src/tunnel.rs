//! autossh tunnel subprocesses for runs that reach their devices over SSH.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use labrun_shared::dut::IpEndpoint;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::command::StepContext;
use crate::config::Config;
use crate::error::{CommandError, CommandResult};
use crate::util::network::{free_local_port, wait_for_local_port};

const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct TunnelOptions {
    pub program: String,
    pub user: String,
    pub identity_file: Option<PathBuf>,
    pub ready_timeout: Duration,
    pub poll_interval: Duration,
}

impl TunnelOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            program: config.autossh_binary.clone(),
            user: config.ssh_user.clone(),
            identity_file: config.ssh_identity_file.clone(),
            ready_timeout: config.tunnel_ready_timeout(),
            poll_interval: config.tunnel_poll_interval(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// `-L`: local port reaches a port behind the destination
    Forward,
    /// `-R`: a port on the destination reaches a local port
    Reverse,
}

struct Tunnel {
    description: String,
    child: Child,
}

/// Owns every tunnel subprocess started during a run.
pub struct TunnelManager {
    options: TunnelOptions,
    tunnels: Vec<Tunnel>,
}

impl TunnelManager {
    pub fn new(options: TunnelOptions) -> Self {
        Self {
            options,
            tunnels: Vec::new(),
        }
    }

    pub fn active(&self) -> usize {
        self.tunnels.len()
    }

    /// Forward a fresh local port to `target_host:target_port` as seen from
    /// `destination`, and wait until the local end accepts connections.
    pub async fn start_tunnel(
        &mut self,
        ctx: &StepContext,
        destination: &IpEndpoint,
        target_host: &str,
        target_port: u16,
    ) -> CommandResult<u16> {
        let local_port = free_local_port()
            .await
            .map_err(|e| CommandError::container("allocate tunnel port", e))?;
        self.start_tunnel_on(ctx, local_port, destination, target_host, target_port)
            .await?;
        Ok(local_port)
    }

    async fn start_tunnel_on(
        &mut self,
        ctx: &StepContext,
        local_port: u16,
        destination: &IpEndpoint,
        target_host: &str,
        target_port: u16,
    ) -> CommandResult<()> {
        let mapping = format!("{local_port}:{target_host}:{target_port}");
        let mut child = self.spawn(Direction::Forward, destination, None, &mapping)?;
        ctx.log.write_line(&format!(
            "forward tunnel 127.0.0.1:{local_port} -> {target_host}:{target_port} via {destination}"
        ));

        let ready = tokio::select! {
            ok = wait_for_local_port(local_port, self.options.ready_timeout, self.options.poll_interval) => ok,
            _ = ctx.cancel.cancelled() => {
                let _ = child.start_kill();
                return Err(CommandError::Cancelled);
            }
        };

        if !ready {
            let _ = child.start_kill();
            return Err(CommandError::Timeout {
                what: format!("tunnel on 127.0.0.1:{local_port}"),
                after: self.options.ready_timeout,
            });
        }

        info!("tunnel on 127.0.0.1:{} is ready", local_port);
        self.tunnels.push(Tunnel {
            description: format!("-L {mapping} {destination}"),
            child,
        });
        Ok(())
    }

    /// Expose `cache` as `localhost:remote_port` on `destination`, hopping
    /// through `jump` when the device is not directly reachable. The remote
    /// side connects lazily, so readiness is not awaited.
    pub fn start_reverse_tunnel(
        &mut self,
        ctx: &StepContext,
        destination: &IpEndpoint,
        jump: Option<&IpEndpoint>,
        remote_port: u16,
        cache: &IpEndpoint,
    ) -> CommandResult<()> {
        let mapping = format!("{remote_port}:{}:{}", cache.address, cache.port);
        let child = self.spawn(Direction::Reverse, destination, jump, &mapping)?;
        let via = jump.map(|j| format!(" via {j}")).unwrap_or_default();
        ctx.log.write_line(&format!(
            "reverse tunnel {destination} port {remote_port} -> {cache}{via}"
        ));
        self.tunnels.push(Tunnel {
            description: format!("-R {mapping} {destination}"),
            child,
        });
        Ok(())
    }

    /// Interrupt every tunnel. Failures are logged and otherwise ignored.
    /// Returns how many tunnels were stopped.
    pub async fn stop_tunnels(&mut self, ctx: &StepContext) -> usize {
        let tunnels = std::mem::take(&mut self.tunnels);
        let count = tunnels.len();

        for mut tunnel in tunnels {
            let Some(pid) = tunnel.child.id() else {
                debug!("tunnel {} already exited", tunnel.description);
                continue;
            };
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
                warn!("failed to interrupt tunnel {}: {}", tunnel.description, e);
                ctx.log
                    .write_line(&format!("failed to stop tunnel {}: {e}", tunnel.description));
                continue;
            }
            match tokio::time::timeout(STOP_GRACE, tunnel.child.wait()).await {
                Ok(Ok(status)) => debug!("tunnel {} exited: {}", tunnel.description, status),
                Ok(Err(e)) => warn!("waiting for tunnel {}: {}", tunnel.description, e),
                Err(_) => {
                    warn!("tunnel {} ignored SIGINT, killing", tunnel.description);
                    let _ = tunnel.child.start_kill();
                }
            }
            ctx.log
                .write_line(&format!("stopped tunnel {}", tunnel.description));
        }
        count
    }

    fn spawn(
        &self,
        direction: Direction,
        destination: &IpEndpoint,
        jump: Option<&IpEndpoint>,
        mapping: &str,
    ) -> CommandResult<Child> {
        let args = ssh_args(&self.options, direction, destination, jump, mapping);
        debug!("{} {}", self.options.program, args.join(" "));

        let child = Command::new(&self.options.program)
            .args(&args)
            // keep retrying even if the first connection fails fast
            .env("AUTOSSH_GATETIME", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}

fn ssh_args(
    options: &TunnelOptions,
    direction: Direction,
    destination: &IpEndpoint,
    jump: Option<&IpEndpoint>,
    mapping: &str,
) -> Vec<String> {
    let mut args: Vec<String> = [
        "-M",
        "0",
        "-o",
        "ServerAliveInterval=10",
        "-o",
        "ServerAliveCountMax=3",
        "-o",
        "StrictHostKeyChecking=no",
        "-o",
        "UserKnownHostsFile=/dev/null",
        "-o",
        "ExitOnForwardFailure=yes",
    ]
    .into_iter()
    .map(String::from)
    .collect();

    if let Some(identity) = &options.identity_file {
        args.push("-i".into());
        args.push(identity.display().to_string());
    }

    if let Some(jump) = jump {
        args.push("-J".into());
        args.push(format!("{}@{}:{}", options.user, jump.address, jump.port));
    }

    args.push("-p".into());
    args.push(destination.port.to_string());

    args.push(
        match direction {
            Direction::Forward => "-L",
            Direction::Reverse => "-R",
        }
        .into(),
    );
    args.push(mapping.to_string());

    args.push(format!("{}@{}", options.user, destination.address));
    args.push("-N".into());
    args
}
