//! Starting and stopping the service containers of a run.

use async_trait::async_trait;
use labrun_shared::dut::IpEndpoint;
use labrun_shared::request::ContainerImage;

use crate::command::{Command, unsupported_state_keeper};
use crate::container::{ContainerTemplate, PublisherKind, StartedContainer};
use crate::error::{CommandError, CommandResult};
use crate::state::injectables::service_address_key;
use crate::state::{BaseState, PRIMARY_DEVICE_ID, StateKeeper};

#[derive(Debug, Clone, PartialEq)]
pub enum ServiceKind {
    DutService { device_id: String },
    Provision { device_id: String },
    TestExecution,
    TestFinder,
    Publish(PublisherKind),
    VmLeaser { project: String },
    Generic {
        name: String,
        binary: String,
        args: Vec<String>,
        port: u16,
    },
}

/// Endpoint a tunneled device is reached through from this host.
fn local_endpoint(port: u16) -> IpEndpoint {
    IpEndpoint::new("127.0.0.1", port)
}

#[derive(Debug)]
pub struct ServiceStart {
    pub kind: ServiceKind,
    pub template: Option<ContainerTemplate>,
    pub image: Option<ContainerImage>,
    pub started: Option<StartedContainer>,
}

impl ServiceStart {
    pub fn new(kind: ServiceKind) -> Self {
        Self {
            kind,
            template: None,
            image: None,
            started: None,
        }
    }

    /// Builds the template. `dut_override` replaces the primary device's
    /// endpoint, `cache_server` is the cache address as the device sees it.
    fn extract_from(
        &mut self,
        base: &BaseState,
        dut_override: Option<IpEndpoint>,
        cache_server: Option<IpEndpoint>,
    ) -> CommandResult<()> {
        let name = self.name();
        let request = base
            .test_request
            .as_ref()
            .ok_or_else(|| CommandError::missing(name, "test_request"))?;
        let mut metadata_key = request.primary_dut.container_metadata_key.clone();

        let template = match &self.kind {
            ServiceKind::DutService { device_id } => {
                let device = base
                    .device(device_id)
                    .ok_or_else(|| CommandError::missing(name, device_id.clone()))?;
                metadata_key = device.request.container_metadata_key.clone();
                let dut = match dut_override.filter(|_| device.id == PRIMARY_DEVICE_ID) {
                    Some(endpoint) => device.dut.with_endpoint(endpoint),
                    None => device.dut.clone(),
                };
                let cache_server = cache_server.or_else(|| {
                    device.dut.cache_server.as_ref().map(|c| c.address.clone())
                });
                ContainerTemplate::DutService {
                    device_id: device_id.clone(),
                    dut,
                    cache_server,
                }
            }
            ServiceKind::Provision { device_id } => {
                let device = base
                    .device(device_id)
                    .ok_or_else(|| CommandError::missing(name, device_id.clone()))?;
                metadata_key = device.request.container_metadata_key.clone();
                let dut_server = device
                    .dut_server
                    .clone()
                    .ok_or_else(|| CommandError::missing(name, format!("{device_id}.dut_server")))?;
                ContainerTemplate::Provision {
                    device_id: device_id.clone(),
                    dut: device.dut.clone(),
                    dut_server,
                }
            }
            ServiceKind::TestExecution => ContainerTemplate::TestExecution,
            ServiceKind::TestFinder => ContainerTemplate::TestFinder,
            ServiceKind::Publish(kind) => ContainerTemplate::Publish { kind: *kind },
            ServiceKind::VmLeaser { project } => ContainerTemplate::VmLeaser {
                project: project.clone(),
            },
            ServiceKind::Generic {
                name: service,
                binary,
                args,
                port,
            } => ContainerTemplate::Generic {
                name: service.clone(),
                binary: binary.clone(),
                args: args.clone(),
                port: *port,
            },
        };

        let service = template.image_service();
        let image = request
            .image_for(&metadata_key, &service)
            .cloned()
            .ok_or_else(|| {
                CommandError::missing(name, format!("container image {metadata_key}/{service}"))
            })?;

        self.template = Some(template);
        self.image = Some(image);
        Ok(())
    }

    fn update_base(&self, base: &mut BaseState) {
        let Some(started) = &self.started else {
            return;
        };
        base.service_addresses
            .insert(started.name.clone(), started.address.clone());
        base.injectables
            .set(service_address_key(&started.name), started.address.clone());

        if let ServiceKind::DutService { device_id } = &self.kind {
            if let Some(device) = base.device_mut(device_id) {
                device.dut_server = Some(started.address.clone());
            }
        }
    }
}

#[async_trait]
impl Command for ServiceStart {
    fn name(&self) -> &'static str {
        "service-start"
    }

    fn extract_dependencies(&mut self, sk: &StateKeeper) -> CommandResult<()> {
        match sk {
            StateKeeper::HwTest(s) => self.extract_from(&s.base, None, s.cache_server.clone()),
            StateKeeper::LocalTest(s) => {
                let cache = s
                    .cache_server_remote_port
                    .map(|port| IpEndpoint::new("localhost", port))
                    .or_else(|| s.cache_server.clone());
                self.extract_from(&s.base, s.dut_tunnel_port.map(local_endpoint), cache)
            }
            StateKeeper::PreLocalTest(_) => Err(unsupported_state_keeper(self.name(), sk)),
        }
    }

    fn update_state_keeper(&self, sk: &mut StateKeeper) -> CommandResult<()> {
        match sk {
            StateKeeper::HwTest(s) => self.update_base(&mut s.base),
            StateKeeper::LocalTest(s) => self.update_base(&mut s.base),
            StateKeeper::PreLocalTest(_) => return Err(unsupported_state_keeper(self.name(), sk)),
        }
        Ok(())
    }
}

/// Stops service containers. Teardown: failures are logged by the executor
/// and never fail the step.
#[derive(Debug, Default)]
pub struct ServiceStop {
    only: Option<Vec<String>>,
    pub names: Vec<String>,
    pub stopped: Vec<String>,
}

impl ServiceStop {
    /// Every container started so far.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn named(names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            only: Some(names.into_iter().map(Into::into).collect()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Command for ServiceStop {
    fn name(&self) -> &'static str {
        "service-stop"
    }

    fn extract_dependencies(&mut self, sk: &StateKeeper) -> CommandResult<()> {
        let started = &sk.base().service_addresses;
        self.names = match &self.only {
            Some(names) => names.clone(),
            None => {
                let mut names: Vec<String> = started.keys().cloned().collect();
                names.sort();
                names
            }
        };
        Ok(())
    }

    fn update_state_keeper(&self, sk: &mut StateKeeper) -> CommandResult<()> {
        let base = sk.base_mut();
        for name in &self.stopped {
            base.service_addresses.remove(name);
        }
        Ok(())
    }
}
