//! Every pipeline step the engine knows, as one closed set.

pub mod generic;
pub mod inventory;
pub mod local;
pub mod provision;
pub mod publish;
pub mod services;
pub mod ssh;
pub mod test;
pub mod vm;

use async_trait::async_trait;

use crate::command::{Command, StepContext};
use crate::error::CommandResult;
use crate::state::StateKeeper;

pub use generic::GenericExecute;
pub use inventory::{GetDeviceState, LoadDutTopology, MatchDevices, UpdateDeviceState};
pub use local::{ParseLocalArgs, SummarizeResults};
pub use provision::ProvisionInstall;
pub use publish::PublishResults;
pub use services::{ServiceKind, ServiceStart, ServiceStop};
pub use ssh::{StartReverseTunnel, StartTunnel, StopTunnels};
pub use test::{FindTests, RunTests};
pub use vm::{GetVmImage, LeaseVm, ReleaseVm};

macro_rules! any_command {
    ($($variant:ident),* $(,)?) => {
        #[derive(Debug)]
        pub enum AnyCommand {
            $($variant($variant),)*
        }

        $(
            impl From<$variant> for AnyCommand {
                fn from(cmd: $variant) -> Self {
                    AnyCommand::$variant(cmd)
                }
            }
        )*

        #[async_trait]
        impl Command for AnyCommand {
            fn name(&self) -> &'static str {
                match self {
                    $(AnyCommand::$variant(c) => c.name(),)*
                }
            }

            fn extract_dependencies(&mut self, sk: &StateKeeper) -> CommandResult<()> {
                match self {
                    $(AnyCommand::$variant(c) => c.extract_dependencies(sk),)*
                }
            }

            async fn execute(&mut self, ctx: &StepContext) -> CommandResult<()> {
                match self {
                    $(AnyCommand::$variant(c) => c.execute(ctx).await,)*
                }
            }

            fn update_state_keeper(&self, sk: &mut StateKeeper) -> CommandResult<()> {
                match self {
                    $(AnyCommand::$variant(c) => c.update_state_keeper(sk),)*
                }
            }

            fn business_failure(&self) -> Option<String> {
                match self {
                    $(AnyCommand::$variant(c) => c.business_failure(),)*
                }
            }
        }
    };
}

any_command! {
    LoadDutTopology,
    MatchDevices,
    GetDeviceState,
    UpdateDeviceState,
    ServiceStart,
    ServiceStop,
    ProvisionInstall,
    FindTests,
    RunTests,
    PublishResults,
    GenericExecute,
    StartTunnel,
    StartReverseTunnel,
    StopTunnels,
    GetVmImage,
    LeaseVm,
    ReleaseVm,
    ParseLocalArgs,
    SummarizeResults,
}
