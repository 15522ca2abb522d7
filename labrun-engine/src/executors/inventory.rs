use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::clients::{DeviceStateStore, InventoryClient};
use crate::command::{Executor, StepContext, unsupported_command};
use crate::commands::{AnyCommand, GetDeviceState, LoadDutTopology, UpdateDeviceState};
use crate::error::{CommandError, CommandResult};

/// Inventory lookups and device-state bookkeeping.
pub struct InventoryExecutor {
    inventory: Arc<dyn InventoryClient>,
    states: Arc<dyn DeviceStateStore>,
}

impl InventoryExecutor {
    pub fn new(inventory: Arc<dyn InventoryClient>, states: Arc<dyn DeviceStateStore>) -> Self {
        Self { inventory, states }
    }

    async fn load_topology(&self, ctx: &StepContext, cmd: &mut LoadDutTopology) -> CommandResult<()> {
        let topology = tokio::select! {
            r = self.inventory.get_dut_topology(&cmd.hostname) => r
                .map_err(|e| CommandError::rpc(format!("inventory lookup of {}", cmd.hostname), e))?,
            _ = ctx.cancel.cancelled() => return Err(CommandError::Cancelled),
        };
        ctx.log.write_line(&format!(
            "topology {} has {} device(s)",
            topology.id,
            topology.duts.len()
        ));
        cmd.topology = Some(topology);
        Ok(())
    }

    async fn get_state(&self, ctx: &StepContext, cmd: &mut GetDeviceState) -> CommandResult<()> {
        let state = self
            .states
            .get_state(&cmd.hostname)
            .await
            .map_err(|e| CommandError::rpc(format!("device state of {}", cmd.hostname), e))?;
        ctx.log.write_line(&format!("{} is {:?}", cmd.hostname, state));
        cmd.state = Some(state);
        Ok(())
    }

    async fn update_state(&self, ctx: &StepContext, cmd: &mut UpdateDeviceState) {
        if cmd.hostname.is_empty() {
            return;
        }
        match self.states.set_state(&cmd.hostname, cmd.state).await {
            Ok(()) => {
                info!("{} -> {:?}", cmd.hostname, cmd.state);
                cmd.applied = true;
            }
            Err(e) => {
                warn!("failed to store state of {}: {:#}", cmd.hostname, e);
                ctx.log
                    .write_line(&format!("device state not stored: {e:#}"));
            }
        }
    }
}

#[async_trait]
impl Executor for InventoryExecutor {
    fn name(&self) -> &'static str {
        "inventory"
    }

    async fn execute_command(&mut self, ctx: &StepContext, cmd: &mut AnyCommand) -> CommandResult<()> {
        match cmd {
            AnyCommand::LoadDutTopology(c) => self.load_topology(ctx, c).await,
            AnyCommand::GetDeviceState(c) => self.get_state(ctx, c).await,
            AnyCommand::UpdateDeviceState(c) => {
                self.update_state(ctx, c).await;
                Ok(())
            }
            other => Err(unsupported_command(self.name(), other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::MatchDevices;
    use crate::testing::{FakeInventory, FakeStateStore, dut, step_context};
    use labrun_shared::dut::{DeviceState, DutTopology};

    fn executor(inventory: FakeInventory, states: Arc<FakeStateStore>) -> InventoryExecutor {
        InventoryExecutor::new(Arc::new(inventory), states)
    }

    #[tokio::test]
    async fn test_load_topology_calls_inventory() {
        let topology = DutTopology::single("t", dut("betty#1", "betty"));
        let mut exec = executor(
            FakeInventory::with("host1", topology.clone()),
            Arc::new(FakeStateStore::default()),
        );
        let mut cmd = AnyCommand::from(LoadDutTopology {
            hostname: "host1".into(),
            topology: None,
        });
        exec.execute_command(&step_context(), &mut cmd).await.unwrap();
        let AnyCommand::LoadDutTopology(c) = cmd else { unreachable!() };
        assert_eq!(c.topology, Some(topology));
    }

    #[tokio::test]
    async fn test_unknown_host_is_rpc_error() {
        let mut exec = executor(FakeInventory::default(), Arc::new(FakeStateStore::default()));
        let mut cmd = AnyCommand::from(LoadDutTopology {
            hostname: "ghost".into(),
            topology: None,
        });
        let err = exec.execute_command(&step_context(), &mut cmd).await.unwrap_err();
        assert!(err.to_string().starts_with("inventory lookup of ghost"));
    }

    #[tokio::test]
    async fn test_update_state_failure_is_swallowed() {
        let states = Arc::new(FakeStateStore::failing());
        let mut exec = executor(FakeInventory::default(), states.clone());
        let mut cmd = AnyCommand::from(UpdateDeviceState::new(DeviceState::NeedsRepair));
        if let AnyCommand::UpdateDeviceState(c) = &mut cmd {
            c.hostname = "host1".into();
            c.state = DeviceState::NeedsRepair;
        }
        exec.execute_command(&step_context(), &mut cmd).await.unwrap();
        let AnyCommand::UpdateDeviceState(c) = cmd else { unreachable!() };
        assert!(!c.applied);
    }

    #[tokio::test]
    async fn test_state_round_trip_through_store() {
        let states = Arc::new(FakeStateStore::default());
        let mut exec = executor(FakeInventory::default(), states.clone());

        let mut update = UpdateDeviceState::new(DeviceState::NeedsReset);
        update.hostname = "host1".into();
        update.state = DeviceState::NeedsReset;
        let mut cmd = AnyCommand::from(update);
        exec.execute_command(&step_context(), &mut cmd).await.unwrap();

        let mut cmd = AnyCommand::from(GetDeviceState {
            hostname: "host1".into(),
            state: None,
        });
        exec.execute_command(&step_context(), &mut cmd).await.unwrap();
        let AnyCommand::GetDeviceState(c) = cmd else { unreachable!() };
        assert_eq!(c.state, Some(DeviceState::NeedsReset));
    }

    #[tokio::test]
    async fn test_rejects_foreign_commands() {
        let mut exec = executor(FakeInventory::default(), Arc::new(FakeStateStore::default()));
        let mut cmd = AnyCommand::from(MatchDevices::new());
        let err = exec.execute_command(&step_context(), &mut cmd).await.unwrap_err();
        assert_eq!(err.to_string(), "inventory: unsupported command match-devices");
    }
}
