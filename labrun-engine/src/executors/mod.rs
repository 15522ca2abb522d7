//! Executors own external resources and carry out the commands bound to
//! them. Each matches exhaustively on the commands it understands and
//! rejects the rest.

pub mod cloud_image;
pub mod container;
pub mod generic;
pub mod inventory;
pub mod provision;
pub mod publish;
pub mod ssh;
pub mod test;

use std::time::Duration;

use labrun_shared::dut::IpEndpoint;

use crate::config::Config;
use crate::container::service_log_file;
use crate::error::{CommandError, CommandResult};
use crate::lro::LroCall;

pub use cloud_image::CloudImageExecutor;
pub use container::ContainerExecutor;
pub use generic::GenericExecutor;
pub use inventory::InventoryExecutor;
pub use provision::ProvisionExecutor;
pub use publish::PublishExecutor;
pub use ssh::SshTunnelExecutor;
pub use test::TestExecutor;

/// Call settings shared by the service-backed executors.
#[derive(Debug, Clone)]
pub struct ServiceCallConfig {
    pub poll_interval: Duration,
    config: Config,
}

impl ServiceCallConfig {
    pub fn new(config: &Config) -> Self {
        Self {
            poll_interval: config.lro_poll_interval(),
            config: config.clone(),
        }
    }

    /// LRO call against `container`, relaying its log file.
    pub fn call(&self, context: impl Into<String>, container: &str) -> LroCall {
        LroCall::new(context, self.poll_interval)
            .relay_log(container, service_log_file(&self.config, container))
    }
}

/// Address a command resolved during extraction; absent only if the command
/// was executed without extracting first.
pub(crate) fn resolved_address(
    command: &'static str,
    address: &Option<IpEndpoint>,
) -> CommandResult<IpEndpoint> {
    address
        .clone()
        .ok_or_else(|| CommandError::missing(command, "service_address"))
}

pub(crate) fn connect_error(command: &'static str, err: anyhow::Error) -> CommandError {
    CommandError::rpc(format!("{command}: connect"), err)
}
