use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use labrun_shared::any::AnyMessage;
use labrun_shared::services::{InstallRequest, LeaseVmResponse, ReleaseVmRequest};
use tracing::{info, warn};

use crate::clients::ServiceConnector;
use crate::command::{Command, Executor, StepContext, unsupported_command};
use crate::commands::{AnyCommand, LeaseVm, ProvisionInstall, ReleaseVm};
use crate::container::{VM_LEASER_SERVICE, provision_service_name};
use crate::error::{CommandError, CommandResult};
use crate::executors::{ServiceCallConfig, connect_error, resolved_address};
use crate::lro;
use crate::state::VmLease;

/// Install RPCs: software installs on devices, and VM leases, which go
/// through the same install contract with a lease request as metadata.
pub struct ProvisionExecutor {
    connector: Arc<dyn ServiceConnector>,
    calls: ServiceCallConfig,
}

impl ProvisionExecutor {
    pub fn new(connector: Arc<dyn ServiceConnector>, calls: ServiceCallConfig) -> Self {
        Self { connector, calls }
    }

    async fn install(&self, ctx: &StepContext, cmd: &mut ProvisionInstall) -> CommandResult<()> {
        let name = cmd.name();
        let address = resolved_address(name, &cmd.service_address)?;
        let request = cmd
            .request
            .clone()
            .ok_or_else(|| CommandError::missing(name, "install_request"))?;
        let client = self
            .connector
            .provision(&address)
            .map_err(|e| connect_error(name, e))?;

        let call = self.calls.call(
            format!("install on {}", cmd.device_id),
            &provision_service_name(&cmd.device_id),
        );
        let response = lro::invoke(ctx, client.as_ref(), call, || client.install(request)).await?;
        info!("install on {} finished: {}", cmd.device_id, response.status.as_str());
        cmd.response = Some(response);
        Ok(())
    }

    async fn lease(&self, ctx: &StepContext, cmd: &mut LeaseVm) -> CommandResult<()> {
        let name = cmd.name();
        let address = resolved_address(name, &cmd.service_address)?;
        let lease_request = cmd
            .request
            .clone()
            .ok_or_else(|| CommandError::missing(name, "lease_request"))?;
        let metadata = AnyMessage::pack(&lease_request)
            .map_err(|e| CommandError::rpc(format!("{name}: encode lease request"), e))?;
        let client = self
            .connector
            .provision(&address)
            .map_err(|e| connect_error(name, e))?;

        ctx.log.write_line(&format!(
            "leasing {} VM from image {}",
            lease_request.board, lease_request.image_name
        ));
        let request = InstallRequest {
            metadata: Some(metadata),
            ..Default::default()
        };
        let call = self.calls.call("lease vm", VM_LEASER_SERVICE);
        let response = lro::invoke(ctx, client.as_ref(), call, || client.install(request)).await?;
        cmd.status = Some(response.status);
        if !response.status.is_success() {
            return Ok(());
        }

        let granted: LeaseVmResponse = response
            .metadata
            .as_ref()
            .ok_or_else(|| CommandError::rpc("lease vm", anyhow!("response carries no lease")))?
            .unpack()
            .map_err(|e| CommandError::rpc("lease vm: decode lease", e))?;
        ctx.log.write_line(&format!(
            "leased {} at {}",
            granted.lease_id, granted.vm_address
        ));
        let zone = if granted.zone.is_empty() {
            lease_request.zone.clone()
        } else {
            granted.zone
        };
        cmd.lease = Some(VmLease {
            lease_id: granted.lease_id,
            zone,
            project: lease_request.image_project,
            address: granted.vm_address,
        });
        Ok(())
    }

    async fn release(&self, ctx: &StepContext, cmd: &mut ReleaseVm) {
        let Some(lease) = cmd.lease.clone() else {
            return;
        };
        let Some(address) = cmd.service_address.clone() else {
            return;
        };
        let client = match self.connector.provision(&address) {
            Ok(client) => client,
            Err(e) => {
                warn!("cannot reach leaser to release {}: {:#}", lease.lease_id, e);
                return;
            }
        };
        let request = ReleaseVmRequest {
            lease_id: lease.lease_id.clone(),
            zone: lease.zone.clone(),
            project: lease.project.clone(),
        };
        let call = self.calls.call(format!("release {}", lease.lease_id), VM_LEASER_SERVICE);
        match lro::invoke(ctx, client.as_ref(), call, || client.release_vm(request)).await {
            Ok(_) => {
                ctx.log.write_line(&format!("released {}", lease.lease_id));
                cmd.released = true;
            }
            Err(e) => {
                warn!("failed to release {}: {}", lease.lease_id, e);
                ctx.log
                    .write_line(&format!("release of {} failed: {e}", lease.lease_id));
            }
        }
    }
}

#[async_trait]
impl Executor for ProvisionExecutor {
    fn name(&self) -> &'static str {
        "provision"
    }

    async fn execute_command(&mut self, ctx: &StepContext, cmd: &mut AnyCommand) -> CommandResult<()> {
        match cmd {
            AnyCommand::ProvisionInstall(c) => self.install(ctx, c).await,
            AnyCommand::LeaseVm(c) => self.lease(ctx, c).await,
            AnyCommand::ReleaseVm(c) => {
                self.release(ctx, c).await;
                Ok(())
            }
            other => Err(unsupported_command(self.name(), other)),
        }
    }
}
