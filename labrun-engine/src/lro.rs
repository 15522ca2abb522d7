//! Long-running-operation invocation shared by every service-backed command.
//!
//! 1. the service log file is located and a relay into the step log is
//!    started before the call goes out;
//! 2. the unary RPC is issued; an operation handle is polled until done;
//! 3. the relay is signalled and joined;
//! 4. the typed response is decoded from the operation payload.
//!
//! Transport, polling and decode failures come back as [`CommandError::Rpc`]
//! carrying the call site. A decoded response with a non-success status is
//! returned as-is; judging it is up to the command.

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::anyhow;
use labrun_shared::any::TypeTagged;
use labrun_shared::operation::{Operation, OperationResult, Reply};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::clients::OperationsClient;
use crate::command::StepContext;
use crate::error::{CommandError, CommandResult};
use crate::log_relay::LogRelay;

/// Where and how one call is made.
#[derive(Debug, Clone)]
pub struct LroCall {
    /// Call-site description used to wrap errors (`install on primary`).
    pub context: String,
    /// Service log to relay while the call runs.
    pub log_file: Option<PathBuf>,
    /// Source label prefixed to relayed lines.
    pub log_source: String,
    pub poll_interval: Duration,
}

impl LroCall {
    pub fn new(context: impl Into<String>, poll_interval: Duration) -> Self {
        Self {
            context: context.into(),
            log_file: None,
            log_source: String::new(),
            poll_interval,
        }
    }

    pub fn relay_log(mut self, source: impl Into<String>, log_file: PathBuf) -> Self {
        self.log_source = source.into();
        self.log_file = Some(log_file);
        self
    }
}

pub async fn invoke<C, Resp, F, Fut>(
    ctx: &StepContext,
    client: &C,
    call: LroCall,
    rpc: F,
) -> CommandResult<Resp>
where
    C: OperationsClient + ?Sized,
    Resp: TypeTagged + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<Reply<Resp>>>,
{
    let relay = call.log_file.clone().map(|path| {
        LogRelay::start(
            path,
            call.log_source.clone(),
            ctx.log.clone(),
            call.poll_interval,
        )
    });

    let result = call_and_wait(ctx, client, &call, rpc).await;

    if let Some(relay) = relay {
        relay.finish().await;
    }
    result
}

async fn call_and_wait<C, Resp, F, Fut>(
    ctx: &StepContext,
    client: &C,
    call: &LroCall,
    rpc: F,
) -> CommandResult<Resp>
where
    C: OperationsClient + ?Sized,
    Resp: TypeTagged + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<Reply<Resp>>>,
{
    let reply = tokio::select! {
        r = rpc() => r.map_err(|e| CommandError::rpc(call.context.clone(), e))?,
        _ = ctx.cancel.cancelled() => return Err(CommandError::Cancelled),
    };

    match reply {
        Reply::Immediate(resp) => Ok(resp),
        Reply::Operation(op) => {
            let op = wait_for_operation(ctx, client, op, call).await?;
            decode_operation(op, &call.context)
        }
    }
}

/// Poll `op` until it reports done. An already-done handle is not polled.
pub async fn wait_for_operation<C>(
    ctx: &StepContext,
    client: &C,
    mut op: Operation,
    call: &LroCall,
) -> CommandResult<Operation>
where
    C: OperationsClient + ?Sized,
{
    while !op.done {
        tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(CommandError::Cancelled),
            _ = tokio::time::sleep(call.poll_interval) => {}
        }
        debug!("polling operation {}", op.name);
        let name = op.name.clone();
        op = client
            .get_operation(&name)
            .await
            .map_err(|e| CommandError::rpc(format!("{}: poll {}", call.context, name), e))?;
    }
    Ok(op)
}

pub fn decode_operation<Resp>(op: Operation, context: &str) -> CommandResult<Resp>
where
    Resp: TypeTagged + DeserializeOwned,
{
    match op.result {
        Some(OperationResult::Response(any)) => any
            .unpack::<Resp>()
            .map_err(|e| CommandError::rpc(format!("{context}: decode {}", op.name), e)),
        Some(OperationResult::Error(status)) => Err(CommandError::rpc(
            context.to_string(),
            anyhow!(
                "operation {} failed with code {}: {}",
                op.name,
                status.code,
                status.message
            ),
        )),
        None => Err(CommandError::rpc(
            context.to_string(),
            anyhow!("operation {} finished without a result", op.name),
        )),
    }
}
