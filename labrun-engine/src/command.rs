//! The step contract shared by every command and executor.
//!
//! A pipeline step runs one [`Command`] in a fixed order:
//! `extract_dependencies` copies what it needs out of the [`StateKeeper`],
//! then either the command computes locally (`execute`) or a bound
//! [`Executor`] does the side-effecting work (`execute_command`), then
//! `update_state_keeper` writes produced values back. Commands keep their
//! inputs and outputs as fields, so the three phases never hold the state
//! keeper across an await.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::commands::AnyCommand;
use crate::error::{CommandError, CommandResult};
use crate::state::StateKeeper;
use crate::ui::StepLog;

/// Ambient context of the running step.
#[derive(Clone)]
pub struct StepContext {
    pub cancel: CancellationToken,
    pub log: Arc<dyn StepLog>,
}

impl StepContext {
    pub fn new(log: Arc<dyn StepLog>) -> Self {
        Self {
            cancel: CancellationToken::new(),
            log,
        }
    }

    pub fn with_cancel(log: Arc<dyn StepLog>, cancel: CancellationToken) -> Self {
        Self { cancel, log }
    }
}

#[async_trait]
pub trait Command: Send {
    /// Step name shown in the build UI.
    fn name(&self) -> &'static str;

    fn extract_dependencies(&mut self, sk: &StateKeeper) -> CommandResult<()>;

    /// Local computation for commands that need no executor.
    async fn execute(&mut self, _ctx: &StepContext) -> CommandResult<()> {
        Err(CommandError::NoLocalExecution {
            command: self.name(),
        })
    }

    /// Write produced values back. Only values that were actually produced
    /// are written; an empty output never clears earlier state.
    fn update_state_keeper(&self, sk: &mut StateKeeper) -> CommandResult<()>;

    /// Set when the service answered but reported a product failure.
    fn business_failure(&self) -> Option<String> {
        None
    }
}

#[async_trait]
pub trait Executor: Send {
    fn name(&self) -> &'static str;

    async fn execute_command(
        &mut self,
        ctx: &StepContext,
        cmd: &mut AnyCommand,
    ) -> CommandResult<()>;
}

pub(crate) fn unsupported_state_keeper(command: &'static str, sk: &StateKeeper) -> CommandError {
    CommandError::UnsupportedStateKeeper {
        command,
        state_keeper: sk.name(),
    }
}

pub(crate) fn unsupported_command(executor: &'static str, cmd: &AnyCommand) -> CommandError {
    CommandError::UnsupportedCommand {
        executor,
        command: cmd.name(),
    }
}
