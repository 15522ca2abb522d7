use async_trait::async_trait;

use crate::command::{Command, Executor, StepContext, unsupported_command};
use crate::commands::{AnyCommand, StartReverseTunnel, StartTunnel};
use crate::error::{CommandError, CommandResult};
use crate::tunnel::{TunnelManager, TunnelOptions};

/// SSH tunnels of a local run. Tunnels live as long as the executor or
/// until `StopTunnels` runs.
pub struct SshTunnelExecutor {
    tunnels: TunnelManager,
}

impl SshTunnelExecutor {
    pub fn new(options: TunnelOptions) -> Self {
        Self {
            tunnels: TunnelManager::new(options),
        }
    }

    pub fn active_tunnels(&self) -> usize {
        self.tunnels.active()
    }

    async fn forward(&mut self, ctx: &StepContext, cmd: &mut StartTunnel) -> CommandResult<()> {
        let destination = cmd
            .destination
            .clone()
            .ok_or_else(|| CommandError::missing(cmd.name(), "destination"))?;
        let port = self
            .tunnels
            .start_tunnel(ctx, &destination, &cmd.target_host, cmd.target_port)
            .await?;
        cmd.local_port = Some(port);
        Ok(())
    }

    fn reverse(&mut self, ctx: &StepContext, cmd: &mut StartReverseTunnel) -> CommandResult<()> {
        let destination = cmd
            .destination
            .clone()
            .ok_or_else(|| CommandError::missing(cmd.name(), "destination"))?;
        let cache = cmd
            .cache_server
            .as_ref()
            .ok_or_else(|| CommandError::missing(cmd.name(), "cache_server"))?;
        self.tunnels.start_reverse_tunnel(
            ctx,
            &destination,
            cmd.jump_host.as_ref(),
            cmd.remote_port,
            cache,
        )?;
        cmd.started = true;
        Ok(())
    }
}

#[async_trait]
impl Executor for SshTunnelExecutor {
    fn name(&self) -> &'static str {
        "ssh-tunnel"
    }

    async fn execute_command(&mut self, ctx: &StepContext, cmd: &mut AnyCommand) -> CommandResult<()> {
        match cmd {
            AnyCommand::StartTunnel(c) => self.forward(ctx, c).await,
            AnyCommand::StartReverseTunnel(c) => self.reverse(ctx, c),
            AnyCommand::StopTunnels(c) => {
                c.stopped = self.tunnels.stop_tunnels(ctx).await;
                Ok(())
            }
            other => Err(unsupported_command(self.name(), other)),
        }
    }
}
