//! Step harness shared by the pipeline tests. The fakes themselves live in
//! `labrun_engine::testing`.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use labrun_engine::clients::ServiceConnector;
use labrun_engine::command::Executor;
use labrun_engine::commands::AnyCommand;
use labrun_engine::config::Config;
use labrun_engine::error::CommandResult;
use labrun_engine::executors::{
    CloudImageExecutor, ContainerExecutor, GenericExecutor, InventoryExecutor, ProvisionExecutor,
    PublishExecutor, ServiceCallConfig, TestExecutor,
};
use labrun_engine::pipeline::run_step;
use labrun_engine::state::StateKeeper;
use labrun_engine::testing::{
    FakeCloudApi, FakeInventory, FakeRuntime, FakeServices, FakeStateStore, RecordingSink,
};
use labrun_engine::ui::StepStatus;
use labrun_shared::dut::DutTopology;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

pub const HOSTNAME: &str = "chromeos1-row1-rack1-host1";
pub const IMAGE_PATH: &str = "gs://chromeos-image-archive/betty-release/R120-15662.0.0";

pub const SERVICES: [&str; 8] = [
    "cros-dut",
    "cros-provision",
    "cros-test",
    "cros-test-finder",
    "cros-publish-gcs",
    "cros-publish-tko",
    "cros-publish-rdb",
    "vm-leaser",
];

/// `board -> service -> image` for every service, as a test request carries it.
pub fn container_images(board: &str) -> Value {
    let services: serde_json::Map<String, Value> = SERVICES
        .iter()
        .map(|s| {
            (
                s.to_string(),
                json!({
                    "repository": "us-docker.pkg.dev/cros-registry/test-services",
                    "name": s,
                    "tag": "R120",
                }),
            )
        })
        .collect();
    json!({ board: services })
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// Binds each command to the executor that owns its resource and runs it as
/// a pipeline step.
pub struct Harness {
    pub steps: RecordingSink,
    pub runtime: Arc<FakeRuntime>,
    pub services: Arc<FakeServices>,
    pub states: Arc<FakeStateStore>,
    pub images: Arc<FakeCloudApi>,
    cancel: CancellationToken,
    inventory: InventoryExecutor,
    containers: ContainerExecutor,
    provision: ProvisionExecutor,
    test: TestExecutor,
    publish: PublishExecutor,
    generic: GenericExecutor,
    cloud: CloudImageExecutor,
}

impl Harness {
    pub fn new(
        config: &Config,
        topologies: HashMap<String, DutTopology>,
        services: FakeServices,
    ) -> Self {
        let runtime = Arc::new(FakeRuntime::default());
        let services = Arc::new(services);
        let states = Arc::new(FakeStateStore::default());
        // created images turn ready on the first lookup
        let images = Arc::new(FakeCloudApi::ready_after(1));

        let mut calls = ServiceCallConfig::new(config);
        calls.poll_interval = Duration::from_millis(5);
        let connector: Arc<dyn ServiceConnector> = services.connector();

        Self {
            steps: RecordingSink::default(),
            cancel: CancellationToken::new(),
            inventory: InventoryExecutor::new(Arc::new(FakeInventory::from(topologies)), states.clone()),
            containers: ContainerExecutor::new(runtime.clone(), config.clone()),
            provision: ProvisionExecutor::new(connector.clone(), calls.clone()),
            test: TestExecutor::new(connector.clone(), calls.clone()),
            publish: PublishExecutor::new(connector.clone(), calls.clone()),
            generic: GenericExecutor::new(connector, calls),
            cloud: CloudImageExecutor::new(images.clone(), config)
                .with_polling(Duration::from_secs(1), Duration::from_millis(5)),
            runtime,
            services,
            states,
            images,
        }
    }

    pub async fn run(
        &mut self,
        cmd: impl Into<AnyCommand>,
        sk: &mut StateKeeper,
    ) -> CommandResult<StepStatus> {
        let mut cmd = cmd.into();
        let executor: Option<&mut dyn Executor> = match &cmd {
            AnyCommand::LoadDutTopology(_)
            | AnyCommand::GetDeviceState(_)
            | AnyCommand::UpdateDeviceState(_) => Some(&mut self.inventory),
            AnyCommand::ServiceStart(_) | AnyCommand::ServiceStop(_) => Some(&mut self.containers),
            AnyCommand::ProvisionInstall(_) | AnyCommand::LeaseVm(_) | AnyCommand::ReleaseVm(_) => {
                Some(&mut self.provision)
            }
            AnyCommand::FindTests(_) | AnyCommand::RunTests(_) => Some(&mut self.test),
            AnyCommand::PublishResults(_) => Some(&mut self.publish),
            AnyCommand::GenericExecute(_) => Some(&mut self.generic),
            AnyCommand::GetVmImage(_) => Some(&mut self.cloud),
            _ => None,
        };
        run_step(&self.cancel, &mut cmd, executor, sk, &self.steps).await
    }
}
