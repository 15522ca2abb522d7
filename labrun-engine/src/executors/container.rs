use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::command::{Command, Executor, StepContext, unsupported_command};
use crate::commands::{AnyCommand, ServiceStart, ServiceStop};
use crate::config::Config;
use crate::container::{ContainerRuntime, process_container};
use crate::error::{CommandError, CommandResult};

/// Starts and stops service containers.
pub struct ContainerExecutor {
    runtime: Arc<dyn ContainerRuntime>,
    config: Config,
}

impl ContainerExecutor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: Config) -> Self {
        Self { runtime, config }
    }

    async fn start(&self, ctx: &StepContext, cmd: &mut ServiceStart) -> CommandResult<()> {
        let (Some(template), Some(image)) = (&cmd.template, &cmd.image) else {
            return Err(CommandError::missing(cmd.name(), "container template"));
        };
        ctx.log.write_line(&format!(
            "starting {} from {}",
            template.container_name(),
            image.reference()
        ));
        let started = tokio::select! {
            r = process_container(self.runtime.as_ref(), template, image, &self.config) => r?,
            _ = ctx.cancel.cancelled() => return Err(CommandError::Cancelled),
        };
        ctx.log
            .write_line(&format!("{} is up at {}", started.name, started.address));
        cmd.started = Some(started);
        Ok(())
    }

    async fn stop(&self, ctx: &StepContext, cmd: &mut ServiceStop) {
        for name in &cmd.names {
            match self.runtime.stop(name).await {
                Ok(()) => {
                    ctx.log.write_line(&format!("stopped {name}"));
                    cmd.stopped.push(name.clone());
                }
                Err(e) => {
                    warn!("failed to stop {}: {:#}", name, e);
                    ctx.log.write_line(&format!("failed to stop {name}: {e:#}"));
                }
            }
        }
    }
}

#[async_trait]
impl Executor for ContainerExecutor {
    fn name(&self) -> &'static str {
        "container"
    }

    async fn execute_command(&mut self, ctx: &StepContext, cmd: &mut AnyCommand) -> CommandResult<()> {
        match cmd {
            AnyCommand::ServiceStart(c) => self.start(ctx, c).await,
            AnyCommand::ServiceStop(c) => {
                self.stop(ctx, c).await;
                Ok(())
            }
            other => Err(unsupported_command(self.name(), other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::ServiceKind;
    use crate::testing::{FakeRuntime, hw_keeper, step_context, test_request};
    use crate::state::StateKeeper;

    fn keeper() -> StateKeeper {
        let mut sk = hw_keeper();
        sk.base_mut().test_request = Some(test_request("betty", &[]));
        sk
    }

    #[tokio::test]
    async fn test_start_then_stop_every_service() {
        let runtime = Arc::new(FakeRuntime::default());
        let mut exec = ContainerExecutor::new(runtime.clone(), Config::default());
        let mut sk = keeper();

        for kind in [ServiceKind::TestExecution, ServiceKind::TestFinder] {
            let mut cmd = AnyCommand::from(ServiceStart::new(kind));
            cmd.extract_dependencies(&sk).unwrap();
            exec.execute_command(&step_context(), &mut cmd).await.unwrap();
            cmd.update_state_keeper(&mut sk).unwrap();
        }
        assert_eq!(sk.base().service_addresses.len(), 2);

        let mut stop = AnyCommand::from(ServiceStop::all());
        stop.extract_dependencies(&sk).unwrap();
        exec.execute_command(&step_context(), &mut stop).await.unwrap();
        stop.update_state_keeper(&mut sk).unwrap();

        assert!(sk.base().service_addresses.is_empty());
        assert_eq!(runtime.stopped(), ["cros-test", "cros-test-finder"]);
    }

    #[tokio::test]
    async fn test_stop_failures_do_not_fail_the_step() {
        let runtime = Arc::new(FakeRuntime::failing());
        let mut exec = ContainerExecutor::new(runtime, Config::default());
        let mut stop = AnyCommand::from(ServiceStop::named(["cros-test"]));
        stop.extract_dependencies(&keeper()).unwrap();
        exec.execute_command(&step_context(), &mut stop).await.unwrap();
        let AnyCommand::ServiceStop(c) = stop else { unreachable!() };
        assert!(c.stopped.is_empty());
    }

    #[tokio::test]
    async fn test_start_without_extract_is_missing_dependency() {
        let mut exec = ContainerExecutor::new(Arc::new(FakeRuntime::default()), Config::default());
        let mut cmd = AnyCommand::from(ServiceStart::new(ServiceKind::TestExecution));
        let err = exec.execute_command(&step_context(), &mut cmd).await.unwrap_err();
        assert!(matches!(err, CommandError::MissingDependency { .. }));
    }
}
