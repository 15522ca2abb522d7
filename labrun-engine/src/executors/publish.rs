use std::sync::Arc;

use async_trait::async_trait;

use crate::clients::ServiceConnector;
use crate::command::{Command, Executor, StepContext, unsupported_command};
use crate::commands::{AnyCommand, PublishResults};
use crate::error::{CommandError, CommandResult};
use crate::executors::{ServiceCallConfig, connect_error, resolved_address};
use crate::lro;

pub struct PublishExecutor {
    connector: Arc<dyn ServiceConnector>,
    calls: ServiceCallConfig,
}

impl PublishExecutor {
    pub fn new(connector: Arc<dyn ServiceConnector>, calls: ServiceCallConfig) -> Self {
        Self { connector, calls }
    }

    async fn publish(&self, ctx: &StepContext, cmd: &mut PublishResults) -> CommandResult<()> {
        let name = cmd.name();
        let address = resolved_address(name, &cmd.service_address)?;
        let request = cmd
            .request
            .clone()
            .ok_or_else(|| CommandError::missing(name, "publish_request"))?;
        let client = self
            .connector
            .publish(&address)
            .map_err(|e| connect_error(name, e))?;

        let service = cmd.kind.service();
        ctx.log.write_line(&format!(
            "publishing {} via {}",
            request.artifact_dir_path, service
        ));
        let call = self
            .calls
            .call(format!("{} publish", cmd.kind.as_str()), &service);
        let response = lro::invoke(ctx, client.as_ref(), call, || client.publish(request)).await?;
        cmd.response = Some(response);
        Ok(())
    }
}

#[async_trait]
impl Executor for PublishExecutor {
    fn name(&self) -> &'static str {
        "publish"
    }

    async fn execute_command(&mut self, ctx: &StepContext, cmd: &mut AnyCommand) -> CommandResult<()> {
        match cmd {
            AnyCommand::PublishResults(c) => self.publish(ctx, c).await,
            other => Err(unsupported_command(self.name(), other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::container::PublisherKind;
    use crate::testing::{FakeServices, step_context};
    use labrun_shared::dut::IpEndpoint;
    use labrun_shared::services::{PublishRequest, PublishResponse, PublishStatus};

    fn publish_cmd(kind: PublisherKind) -> AnyCommand {
        let mut cmd = PublishResults::new(kind);
        cmd.request = Some(PublishRequest {
            artifact_dir_path: "/tmp/run-42".into(),
            ..Default::default()
        });
        cmd.service_address = Some(IpEndpoint::new("127.0.0.1", 45000));
        AnyCommand::from(cmd)
    }

    #[tokio::test]
    async fn test_publish_success() {
        let services = Arc::new(FakeServices::default());
        let mut exec = PublishExecutor::new(services.connector(), ServiceCallConfig::new(&Config::default()));
        let mut cmd = publish_cmd(PublisherKind::Gcs);
        exec.execute_command(&step_context(), &mut cmd).await.unwrap();
        assert!(cmd.business_failure().is_none());
        assert_eq!(services.publishes()[0].artifact_dir_path, "/tmp/run-42");
    }

    #[tokio::test]
    async fn test_publisher_failure_is_business_failure() {
        let services = Arc::new(FakeServices::default());
        services.queue_publish(PublishResponse {
            status: PublishStatus::Failure,
            message: "bucket not writable".into(),
        });
        let mut exec = PublishExecutor::new(services.connector(), ServiceCallConfig::new(&Config::default()));
        let mut cmd = publish_cmd(PublisherKind::Rdb);
        exec.execute_command(&step_context(), &mut cmd).await.unwrap();
        assert_eq!(
            cmd.business_failure().unwrap(),
            "rdb publish finished with Failure: bucket not writable"
        );
    }
}
