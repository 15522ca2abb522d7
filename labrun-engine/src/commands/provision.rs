use async_trait::async_trait;
use labrun_shared::dut::IpEndpoint;
use labrun_shared::services::{InstallRequest, InstallResponse};

use crate::command::{Command, unsupported_state_keeper};
use crate::container::provision_service_name;
use crate::error::{CommandError, CommandResult};
use crate::state::injectables::{provision_key, service_address_key};
use crate::state::tasks::{pop_if_front, resolve_dynamic_deps};
use crate::state::{BaseState, StateKeeper};

/// Installs software on one device through its provision service.
///
/// The front of the provision queue is consumed if there is one; otherwise
/// the request is built from the device's requested provision state.
#[derive(Debug)]
pub struct ProvisionInstall {
    pub device_id: String,
    pub task_id: Option<String>,
    pub request: Option<InstallRequest>,
    pub service_address: Option<IpEndpoint>,
    pub response: Option<InstallResponse>,
}

impl ProvisionInstall {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            task_id: None,
            request: None,
            service_address: None,
            response: None,
        }
    }

    fn extract_from(&mut self, base: &BaseState) -> CommandResult<()> {
        let name = self.name();

        let (task_id, device_id, request, deps, address) = match base.tasks.provision.front() {
            Some(task) => (
                Some(task.task_id.clone()),
                task.device_id.clone(),
                task.install_request.clone(),
                task.dynamic_deps.clone(),
                task.service_address.clone(),
            ),
            None => {
                let device = base
                    .device(&self.device_id)
                    .ok_or_else(|| CommandError::missing(name, self.device_id.clone()))?;
                let state = device.request.provision_state.as_ref().ok_or_else(|| {
                    CommandError::missing(name, format!("{}.provision_state", self.device_id))
                })?;
                let request = InstallRequest {
                    image_path: state.system_image_path.clone(),
                    packages: state.packages.clone(),
                    prevent_reboot: state.prevent_reboot,
                    metadata: None,
                };
                (None, self.device_id.clone(), request, Vec::new(), None)
            }
        };

        if base.device(&device_id).is_none() {
            return Err(CommandError::missing(name, device_id));
        }

        let request = resolve_dynamic_deps(name, &request, &deps, &base.injectables)?;

        let container = provision_service_name(&device_id);
        let address = address
            .or_else(|| base.service_addresses.get(&container).cloned())
            .ok_or_else(|| CommandError::missing(name, service_address_key(&container)))?;

        self.task_id = task_id;
        self.device_id = device_id;
        self.request = Some(request);
        self.service_address = Some(address);
        Ok(())
    }

    fn update_base(&self, base: &mut BaseState) {
        if let Some(response) = &self.response {
            let responses = base
                .provision_responses
                .entry(self.device_id.clone())
                .or_default();
            responses.push(response.clone());
            let all = responses.clone();
            base.injectables.set(provision_key(&self.device_id), all);
        }
        if let Some(task_id) = &self.task_id {
            pop_if_front(&mut base.tasks.provision, task_id, |t| &t.task_id);
        }
    }
}

#[async_trait]
impl Command for ProvisionInstall {
    fn name(&self) -> &'static str {
        "provision-install"
    }

    fn extract_dependencies(&mut self, sk: &StateKeeper) -> CommandResult<()> {
        match sk {
            StateKeeper::HwTest(s) => self.extract_from(&s.base),
            StateKeeper::LocalTest(s) => self.extract_from(&s.base),
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

    fn business_failure(&self) -> Option<String> {
        let response = self.response.as_ref()?;
        if response.status.is_success() {
            return None;
        }
        Some(format!(
            "provision of {} failed: {}",
            self.device_id,
            response.status.as_str()
        ))
    }
}
