use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use labrun_shared::services::{GceImage, ImageStatus};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::clients::CloudImageApi;
use crate::command::{Command, Executor, StepContext, unsupported_command};
use crate::commands::{AnyCommand, GetVmImage};
use crate::config::Config;
use crate::error::{CommandError, CommandResult};

/// Looks up VM images, building them from a release build when absent.
pub struct CloudImageExecutor {
    api: Arc<dyn CloudImageApi>,
    timeout: Duration,
    poll_interval: Duration,
}

impl CloudImageExecutor {
    pub fn new(api: Arc<dyn CloudImageApi>, config: &Config) -> Self {
        Self {
            api,
            timeout: config.image_wait_timeout(),
            poll_interval: config.image_poll_interval(),
        }
    }

    pub fn with_polling(mut self, timeout: Duration, poll_interval: Duration) -> Self {
        self.timeout = timeout;
        self.poll_interval = poll_interval;
        self
    }

    async fn get_image(&self, ctx: &StepContext, cmd: &mut GetVmImage) -> CommandResult<()> {
        let name = cmd.name();
        if cmd.image_name.is_empty() {
            return Err(CommandError::missing(name, "image_name"));
        }
        let context = format!("image {}/{}", cmd.project, cmd.image_name);

        let existing = self
            .api
            .get_image(&cmd.project, &cmd.image_name)
            .await
            .map_err(|e| CommandError::rpc(context.clone(), e))?;
        let image = match existing {
            Some(image) => image,
            None => {
                ctx.log.write_line(&format!(
                    "creating {} from {}",
                    cmd.image_name, cmd.build_identifier
                ));
                self.api
                    .create_image(&cmd.project, &cmd.image_name, &cmd.build_identifier)
                    .await
                    .map_err(|e| CommandError::rpc(format!("create {context}"), e))?
            }
        };

        let image = self.wait_until_ready(ctx, image, &context).await?;
        info!("{} is ready", context);
        cmd.image = Some(image);
        Ok(())
    }

    async fn wait_until_ready(
        &self,
        ctx: &StepContext,
        mut image: GceImage,
        context: &str,
    ) -> CommandResult<GceImage> {
        let deadline = Instant::now() + self.timeout;
        loop {
            match image.status {
                ImageStatus::Ready => return Ok(image),
                ImageStatus::Failed => {
                    // a failed image would be found again by the next run
                    if let Err(e) = self.api.delete_image(&image.project, &image.name).await {
                        warn!("failed to delete broken {}: {:#}", context, e);
                    }
                    return Err(CommandError::rpc(
                        context.to_string(),
                        anyhow!("image creation from {} failed", image.source_build),
                    ));
                }
                ImageStatus::Pending => {}
            }

            if Instant::now() >= deadline {
                return Err(CommandError::Timeout {
                    what: context.to_string(),
                    after: self.timeout,
                });
            }
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(CommandError::Cancelled),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
            debug!("polling {}", context);

            image = self
                .api
                .get_image(&image.project, &image.name)
                .await
                .map_err(|e| CommandError::rpc(context.to_string(), e))?
                .ok_or_else(|| {
                    CommandError::rpc(context.to_string(), anyhow!("image disappeared while pending"))
                })?;
        }
    }
}

#[async_trait]
impl Executor for CloudImageExecutor {
    fn name(&self) -> &'static str {
        "cloud-image"
    }

    async fn execute_command(&mut self, ctx: &StepContext, cmd: &mut AnyCommand) -> CommandResult<()> {
        match cmd {
            AnyCommand::GetVmImage(c) => self.get_image(ctx, c).await,
            other => Err(unsupported_command(self.name(), other)),
        }
    }
}
