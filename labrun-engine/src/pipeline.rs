//! Runs one pipeline step: a named UI scope around the fixed
//! extract / execute / update sequence.

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::command::{Command, Executor, StepContext};
use crate::commands::AnyCommand;
use crate::error::CommandResult;
use crate::state::{StateKeeper, StepReport};
use crate::ui::{StepSink, StepStatus};

/// Run `cmd` as one step. With an executor the executor carries out the
/// command; without one the command computes locally.
///
/// A product failure reported by the command ends the step as
/// [`StepStatus::Failure`] and is returned as `Ok`. Every other failure ends
/// the step as [`StepStatus::Error`] and is returned as `Err`. Either way the
/// step is recorded in the run outcome.
pub async fn run_step(
    cancel: &CancellationToken,
    cmd: &mut AnyCommand,
    executor: Option<&mut dyn Executor>,
    sk: &mut StateKeeper,
    sink: &dyn StepSink,
) -> CommandResult<StepStatus> {
    let name = cmd.name();
    let log = sink.start_step(name);
    let ctx = StepContext::with_cancel(log.clone(), cancel.clone());

    let result = run_phases(&ctx, cmd, executor, sk).await;

    let (status, summary) = match &result {
        Ok(()) => match cmd.business_failure() {
            Some(failure) => {
                warn!(step = name, "{}", failure);
                (StepStatus::Failure, Some(failure))
            }
            None => {
                info!(step = name, "done");
                (StepStatus::Success, None)
            }
        },
        Err(e) => {
            error!(step = name, "{}", e);
            (StepStatus::Error, Some(e.to_string()))
        }
    };

    if let Some(summary) = &summary {
        log.set_summary(summary);
    }
    log.end(status);
    sk.base_mut().outcome.record(StepReport {
        name: name.to_string(),
        status,
        summary,
    });

    result.map(|()| status)
}

async fn run_phases(
    ctx: &StepContext,
    cmd: &mut AnyCommand,
    executor: Option<&mut dyn Executor>,
    sk: &mut StateKeeper,
) -> CommandResult<()> {
    cmd.extract_dependencies(sk)?;
    match executor {
        Some(executor) => executor.execute_command(ctx, cmd).await?,
        None => cmd.execute(ctx).await?,
    }
    cmd.update_state_keeper(sk)
}
