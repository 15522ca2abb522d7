use async_trait::async_trait;
use labrun_shared::dut::IpEndpoint;
use labrun_shared::services::{PublishRequest, PublishResponse, PublishStatus};
use tracing::warn;

use crate::command::{Command, unsupported_state_keeper};
use crate::container::PublisherKind;
use crate::error::{CommandError, CommandResult};
use crate::state::injectables::service_address_key;
use crate::state::tasks::{pop_if_front, resolve_dynamic_deps};
use crate::state::{BaseState, StateKeeper};

/// Uploads the run's artifacts and results through one publisher.
#[derive(Debug)]
pub struct PublishResults {
    pub kind: PublisherKind,
    pub task_id: Option<String>,
    pub request: Option<PublishRequest>,
    pub service_address: Option<IpEndpoint>,
    pub response: Option<PublishResponse>,
}

impl PublishResults {
    pub fn new(kind: PublisherKind) -> Self {
        Self {
            kind,
            task_id: None,
            request: None,
            service_address: None,
            response: None,
        }
    }

    fn extract_from(&mut self, base: &BaseState) -> CommandResult<()> {
        let name = self.name();

        let (task_id, request, address) = match base.tasks.publish.front() {
            Some(task) => (
                Some(task.task_id.clone()),
                resolve_dynamic_deps(name, &task.request, &task.dynamic_deps, &base.injectables)?,
                task.service_address.clone(),
            ),
            None => {
                let artifact_dir = base
                    .artifact_dir
                    .as_ref()
                    .ok_or_else(|| CommandError::missing(name, "artifact_dir"))?;
                if base.test_response.is_none() {
                    warn!("{}: no test response, publishing artifacts only", name);
                }
                let request = PublishRequest {
                    artifact_dir_path: artifact_dir.display().to_string(),
                    test_response: base.test_response.clone(),
                    metadata: None,
                };
                (None, request, None)
            }
        };

        let container = self.kind.service();
        let address = address
            .or_else(|| base.service_addresses.get(&container).cloned())
            .ok_or_else(|| CommandError::missing(name, service_address_key(&container)))?;

        self.task_id = task_id;
        self.request = Some(request);
        self.service_address = Some(address);
        Ok(())
    }
}

#[async_trait]
impl Command for PublishResults {
    fn name(&self) -> &'static str {
        "publish-results"
    }

    fn extract_dependencies(&mut self, sk: &StateKeeper) -> CommandResult<()> {
        match sk {
            StateKeeper::HwTest(s) => self.extract_from(&s.base),
            StateKeeper::LocalTest(s) => self.extract_from(&s.base),
            StateKeeper::PreLocalTest(_) => Err(unsupported_state_keeper(self.name(), sk)),
        }
    }

    fn update_state_keeper(&self, sk: &mut StateKeeper) -> CommandResult<()> {
        if let StateKeeper::PreLocalTest(_) = sk {
            return Err(unsupported_state_keeper(self.name(), sk));
        }
        let base = sk.base_mut();
        if let Some(task_id) = &self.task_id {
            pop_if_front(&mut base.tasks.publish, task_id, |t| &t.task_id);
        }
        Ok(())
    }

    fn business_failure(&self) -> Option<String> {
        let response = self.response.as_ref()?;
        match response.status {
            PublishStatus::Success => None,
            status => Some(format!(
                "{} publish finished with {:?}: {}",
                self.kind.as_str(),
                status,
                response.message
            )),
        }
    }
}
