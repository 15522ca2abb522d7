//! Tunnels for local runs, where devices are only reachable over SSH.

use async_trait::async_trait;
use labrun_shared::dut::IpEndpoint;

use crate::command::{Command, unsupported_state_keeper};
use crate::error::{CommandError, CommandResult};
use crate::state::{LocalTestState, StateKeeper};

const SSH_PORT: u16 = 22;

/// SSH endpoint of the device under test in a local run.
fn device_endpoint(command: &'static str, s: &LocalTestState) -> CommandResult<IpEndpoint> {
    s.base
        .primary_device
        .as_ref()
        .map(|d| d.dut.endpoint().clone())
        .or_else(|| {
            s.base
                .dut_topology
                .as_ref()
                .and_then(|t| t.duts.first())
                .map(|d| d.endpoint().clone())
        })
        .or_else(|| IpEndpoint::parse(&s.args.dut_host))
        .ok_or_else(|| CommandError::missing(command, "dut_topology"))
}

/// SSH destination for a local run and the device host as seen from it.
/// Through a jump host the device is addressed by its own address; without
/// one the destination is the device itself.
fn ssh_route(command: &'static str, s: &LocalTestState) -> CommandResult<(IpEndpoint, String)> {
    let device = device_endpoint(command, s)?;
    Ok(match &s.ssh_jump_host {
        Some(jump) => (jump.clone(), device.address),
        None => (device, "localhost".to_string()),
    })
}

/// Forwards a local port to a port on the primary device.
#[derive(Debug)]
pub struct StartTunnel {
    pub target_port: u16,
    pub destination: Option<IpEndpoint>,
    pub target_host: String,
    pub local_port: Option<u16>,
}

impl StartTunnel {
    pub fn new(target_port: u16) -> Self {
        Self {
            target_port,
            destination: None,
            target_host: String::new(),
            local_port: None,
        }
    }

    /// Tunnel to the device's SSH server.
    pub fn ssh() -> Self {
        Self::new(SSH_PORT)
    }
}

#[async_trait]
impl Command for StartTunnel {
    fn name(&self) -> &'static str {
        "start-tunnel"
    }

    fn extract_dependencies(&mut self, sk: &StateKeeper) -> CommandResult<()> {
        let StateKeeper::LocalTest(s) = sk else {
            return Err(unsupported_state_keeper(self.name(), sk));
        };
        let (destination, target_host) = ssh_route(self.name(), s)?;
        self.destination = Some(destination);
        self.target_host = target_host;
        Ok(())
    }

    fn update_state_keeper(&self, sk: &mut StateKeeper) -> CommandResult<()> {
        let StateKeeper::LocalTest(s) = sk else {
            return Err(unsupported_state_keeper(self.name(), sk));
        };
        if self.local_port.is_some() {
            s.dut_tunnel_port = self.local_port;
        }
        Ok(())
    }
}

/// Lets the device reach the host-side cache server on its own
/// `localhost:remote_port`. The tunnel always ends on the device; a jump
/// host only relays the SSH session.
#[derive(Debug)]
pub struct StartReverseTunnel {
    pub remote_port: u16,
    pub destination: Option<IpEndpoint>,
    pub jump_host: Option<IpEndpoint>,
    pub cache_server: Option<IpEndpoint>,
    pub started: bool,
}

impl StartReverseTunnel {
    pub fn new(remote_port: u16) -> Self {
        Self {
            remote_port,
            destination: None,
            jump_host: None,
            cache_server: None,
            started: false,
        }
    }
}

#[async_trait]
impl Command for StartReverseTunnel {
    fn name(&self) -> &'static str {
        "start-reverse-tunnel"
    }

    fn extract_dependencies(&mut self, sk: &StateKeeper) -> CommandResult<()> {
        let StateKeeper::LocalTest(s) = sk else {
            return Err(unsupported_state_keeper(self.name(), sk));
        };
        let cache = s
            .cache_server
            .clone()
            .ok_or_else(|| CommandError::missing(self.name(), "cache_server"))?;
        self.destination = Some(device_endpoint(self.name(), s)?);
        self.jump_host = s.ssh_jump_host.clone();
        self.cache_server = Some(cache);
        Ok(())
    }

    fn update_state_keeper(&self, sk: &mut StateKeeper) -> CommandResult<()> {
        let StateKeeper::LocalTest(s) = sk else {
            return Err(unsupported_state_keeper(self.name(), sk));
        };
        if self.started {
            s.cache_server_remote_port = Some(self.remote_port);
        }
        Ok(())
    }
}

/// Teardown of every tunnel the executor started.
#[derive(Debug, Default)]
pub struct StopTunnels {
    pub stopped: usize,
}

impl StopTunnels {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Command for StopTunnels {
    fn name(&self) -> &'static str {
        "stop-tunnels"
    }

    fn extract_dependencies(&mut self, sk: &StateKeeper) -> CommandResult<()> {
        match sk {
            StateKeeper::LocalTest(_) => Ok(()),
            _ => Err(unsupported_state_keeper(self.name(), sk)),
        }
    }

    fn update_state_keeper(&self, sk: &mut StateKeeper) -> CommandResult<()> {
        match sk {
            StateKeeper::LocalTest(_) => Ok(()),
            _ => Err(unsupported_state_keeper(self.name(), sk)),
        }
    }
}
