use async_trait::async_trait;
use labrun_shared::dut::IpEndpoint;
use labrun_shared::services::{GenericRequest, GenericResponse};

use crate::command::{Command, unsupported_state_keeper};
use crate::error::{CommandError, CommandResult};
use crate::state::injectables::service_address_key;
use crate::state::tasks::{pop_if_front, resolve_dynamic_deps};
use crate::state::{BaseState, StateKeeper};

/// Calls an arbitrary method on a configured service. The reply payload is
/// stored in injectables under the task's output identifier, where later
/// tasks can pick it up as a dynamic dependency.
#[derive(Debug)]
pub struct GenericExecute {
    pub service: String,
    pub task_id: Option<String>,
    pub method: String,
    pub output_identifier: String,
    pub request: Option<GenericRequest>,
    pub service_address: Option<IpEndpoint>,
    pub response: Option<GenericResponse>,
}

impl GenericExecute {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            task_id: None,
            method: String::new(),
            output_identifier: String::new(),
            request: None,
            service_address: None,
            response: None,
        }
    }

    fn extract_from(&mut self, base: &BaseState) -> CommandResult<()> {
        let name = self.name();
        let task = base
            .tasks
            .generic
            .front()
            .ok_or_else(|| CommandError::missing(name, "generic task"))?;
        let request = resolve_dynamic_deps(name, &task.request, &task.dynamic_deps, &base.injectables)?;
        let address = task
            .service_address
            .clone()
            .or_else(|| base.service_addresses.get(&self.service).cloned())
            .ok_or_else(|| CommandError::missing(name, service_address_key(&self.service)))?;

        self.task_id = Some(task.task_id.clone());
        self.method = task.method.clone();
        self.output_identifier = task.output_identifier.clone();
        self.request = Some(request);
        self.service_address = Some(address);
        Ok(())
    }

    fn update_base(&self, base: &mut BaseState) {
        if let Some(response) = &self.response {
            if !self.output_identifier.is_empty() {
                base.injectables
                    .set(self.output_identifier.clone(), response.payload.clone());
            }
        }
        if let Some(task_id) = &self.task_id {
            pop_if_front(&mut base.tasks.generic, task_id, |t| &t.task_id);
        }
    }
}

#[async_trait]
impl Command for GenericExecute {
    fn name(&self) -> &'static str {
        "generic-execute"
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
}
