use std::sync::Arc;

use async_trait::async_trait;

use crate::clients::ServiceConnector;
use crate::command::{Command, Executor, StepContext, unsupported_command};
use crate::commands::{AnyCommand, GenericExecute};
use crate::error::{CommandError, CommandResult};
use crate::executors::{ServiceCallConfig, connect_error, resolved_address};
use crate::lro;

/// Calls methods on services the engine has no typed contract for.
pub struct GenericExecutor {
    connector: Arc<dyn ServiceConnector>,
    calls: ServiceCallConfig,
}

impl GenericExecutor {
    pub fn new(connector: Arc<dyn ServiceConnector>, calls: ServiceCallConfig) -> Self {
        Self { connector, calls }
    }

    async fn call(&self, ctx: &StepContext, cmd: &mut GenericExecute) -> CommandResult<()> {
        let name = cmd.name();
        let address = resolved_address(name, &cmd.service_address)?;
        let request = cmd
            .request
            .clone()
            .ok_or_else(|| CommandError::missing(name, "generic_request"))?;
        if cmd.method.is_empty() {
            return Err(CommandError::InvalidInput {
                command: name,
                reason: format!("task for {} names no method", cmd.service),
            });
        }
        let client = self
            .connector
            .generic(&address, &cmd.service)
            .map_err(|e| connect_error(name, e))?;

        let method = cmd.method.clone();
        let call = self
            .calls
            .call(format!("{}/{}", cmd.service, method), &cmd.service);
        let response = lro::invoke(ctx, client.as_ref(), call, || client.execute(&method, request)).await?;
        cmd.response = Some(response);
        Ok(())
    }
}

#[async_trait]
impl Executor for GenericExecutor {
    fn name(&self) -> &'static str {
        "generic"
    }

    async fn execute_command(&mut self, ctx: &StepContext, cmd: &mut AnyCommand) -> CommandResult<()> {
        match cmd {
            AnyCommand::GenericExecute(c) => self.call(ctx, c).await,
            other => Err(unsupported_command(self.name(), other)),
        }
    }
}
