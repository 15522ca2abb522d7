use async_trait::async_trait;
use labrun_shared::dut::IpEndpoint;
use labrun_shared::request::TestSuite;
use labrun_shared::services::{RunTestsRequest, RunTestsResponse, TestDevice};

use crate::command::{Command, unsupported_state_keeper};
use crate::container::{TEST_FINDER_SERVICE, TEST_SERVICE};
use crate::error::{CommandError, CommandResult};
use crate::state::injectables::{TEST_RESPONSE, service_address_key};
use crate::state::tasks::{pop_if_front, resolve_dynamic_deps};
use crate::state::{BaseState, Device, StateKeeper};

/// Expands tag-selected suites into concrete test cases.
#[derive(Debug, Default)]
pub struct FindTests {
    pub suites: Vec<TestSuite>,
    pub service_address: Option<IpEndpoint>,
    pub found: Option<Vec<TestSuite>>,
}

impl FindTests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn needs_expansion(&self) -> bool {
        self.suites.iter().any(TestSuite::needs_expansion)
    }

    fn extract_from(&mut self, base: &BaseState) -> CommandResult<()> {
        let request = base
            .test_request
            .as_ref()
            .ok_or_else(|| CommandError::missing(self.name(), "test_request"))?;
        self.suites = request.test_suites.clone();

        self.service_address = base.service_addresses.get(TEST_FINDER_SERVICE).cloned();
        if self.needs_expansion() && self.service_address.is_none() {
            return Err(CommandError::missing(
                self.name(),
                service_address_key(TEST_FINDER_SERVICE),
            ));
        }
        Ok(())
    }

    fn update_base(&self, base: &mut BaseState) {
        let Some(found) = self.found.as_ref().filter(|f| !f.is_empty()) else {
            return;
        };
        if let Some(request) = base.test_request.as_mut() {
            request.test_suites = found.clone();
        }
    }
}

#[async_trait]
impl Command for FindTests {
    fn name(&self) -> &'static str {
        "find-tests"
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

/// Runs the requested suites against the primary and companion devices.
#[derive(Debug, Default)]
pub struct RunTests {
    pub task_id: Option<String>,
    pub request: Option<RunTestsRequest>,
    pub service_address: Option<IpEndpoint>,
    pub response: Option<RunTestsResponse>,
}

fn test_device(command: &'static str, device: &Device) -> CommandResult<TestDevice> {
    let dut_server = device
        .dut_server
        .clone()
        .ok_or_else(|| CommandError::missing(command, format!("{}.dut_server", device.id)))?;
    Ok(TestDevice {
        dut: device.dut.clone(),
        dut_server,
    })
}

impl RunTests {
    pub fn new() -> Self {
        Self::default()
    }

    fn extract_from(&mut self, base: &BaseState) -> CommandResult<()> {
        let name = self.name();

        let (task_id, request, address) = match base.tasks.test.front() {
            Some(task) => (
                Some(task.task_id.clone()),
                resolve_dynamic_deps(name, &task.request, &task.dynamic_deps, &base.injectables)?,
                task.service_address.clone(),
            ),
            None => {
                let test_request = base
                    .test_request
                    .as_ref()
                    .ok_or_else(|| CommandError::missing(name, "test_request"))?;
                let primary = base
                    .primary_device
                    .as_ref()
                    .ok_or_else(|| CommandError::missing(name, "primary_device"))?;
                let companions = base
                    .companion_devices
                    .iter()
                    .map(|d| test_device(name, d))
                    .collect::<CommandResult<Vec<_>>>()?;
                let request = RunTestsRequest {
                    test_suites: test_request.test_suites.clone(),
                    primary: Some(test_device(name, primary)?),
                    companions,
                    metadata: None,
                };
                (None, request, None)
            }
        };

        let address = address
            .or_else(|| base.service_addresses.get(TEST_SERVICE).cloned())
            .ok_or_else(|| CommandError::missing(name, service_address_key(TEST_SERVICE)))?;

        self.task_id = task_id;
        self.request = Some(request);
        self.service_address = Some(address);
        Ok(())
    }

    fn update_base(&self, base: &mut BaseState) {
        if let Some(response) = &self.response {
            base.test_response = Some(response.clone());
            base.injectables.set(TEST_RESPONSE, response.clone());
        }
        if let Some(task_id) = &self.task_id {
            pop_if_front(&mut base.tasks.test, task_id, |t| &t.task_id);
        }
    }
}

#[async_trait]
impl Command for RunTests {
    fn name(&self) -> &'static str {
        "run-tests"
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{PRIMARY_DEVICE_ID, TestTask};
    use crate::testing::{dut, hw_keeper, test_request};
    use labrun_shared::services::{TestCaseResult, Verdict};

    fn keeper_ready_for_tests() -> StateKeeper {
        let mut sk = hw_keeper();
        let base = sk.base_mut();
        base.test_request = Some(test_request("betty", &["eve"]));
        let request = base.test_request.clone().unwrap();
        base.primary_device = Some(Device {
            id: PRIMARY_DEVICE_ID.into(),
            dut: dut("betty#1", "betty"),
            request: request.primary_dut.clone(),
            dut_server: Some(IpEndpoint::new("127.0.0.1", 41000)),
        });
        base.companion_devices = vec![Device {
            id: "companion_eve".into(),
            dut: dut("eve#1", "eve"),
            request: request.companion_duts[0].clone(),
            dut_server: Some(IpEndpoint::new("127.0.0.1", 41001)),
        }];
        base.service_addresses
            .insert(TEST_SERVICE.into(), IpEndpoint::new("127.0.0.1", 43000));
        sk
    }

    #[test]
    fn test_find_tests_only_needs_finder_for_tag_suites() {
        let mut sk = hw_keeper();
        let mut request = test_request("betty", &[]);
        request.test_suites = vec![TestSuite {
            name: "explicit".into(),
            test_case_ids: vec!["tast.example.Pass".into()],
            ..Default::default()
        }];
        sk.base_mut().test_request = Some(request);

        let mut cmd = FindTests::new();
        cmd.extract_dependencies(&sk).unwrap();
        assert!(!cmd.needs_expansion());

        sk.base_mut().test_request.as_mut().unwrap().test_suites[0] = TestSuite {
            name: "by-tag".into(),
            tags: vec!["group:mainline".into()],
            ..Default::default()
        };
        let err = cmd.extract_dependencies(&sk).unwrap_err();
        assert!(err.to_string().ends_with("missing dependency cros-test-finder_address"));
    }

    #[test]
    fn test_find_tests_update_replaces_suites_when_found() {
        let mut sk = hw_keeper();
        sk.base_mut().test_request = Some(test_request("betty", &[]));
        let before = sk.base().test_request.clone();

        let mut cmd = FindTests::new();
        cmd.found = Some(vec![]);
        cmd.update_state_keeper(&mut sk).unwrap();
        assert_eq!(sk.base().test_request, before);

        let expanded = vec![TestSuite {
            name: "by-tag".into(),
            test_case_ids: vec!["tast.a".into(), "tast.b".into()],
            ..Default::default()
        }];
        cmd.found = Some(expanded.clone());
        cmd.update_state_keeper(&mut sk).unwrap();
        assert_eq!(sk.base().test_request.as_ref().unwrap().test_suites, expanded);
    }

    #[test]
    fn test_run_tests_builds_request_for_all_devices() {
        let sk = keeper_ready_for_tests();
        let mut cmd = RunTests::new();
        cmd.extract_dependencies(&sk).unwrap();
        let request = cmd.request.unwrap();
        assert_eq!(request.primary.unwrap().dut_server.port, 41000);
        assert_eq!(request.companions.len(), 1);
        assert_eq!(request.companions[0].dut.id, "eve#1");
        assert_eq!(cmd.service_address.unwrap().port, 43000);
    }

    #[test]
    fn test_run_tests_missing_fields() {
        let mut cmd = RunTests::new();
        let mut sk = keeper_ready_for_tests();
        sk.base_mut().companion_devices[0].dut_server = None;
        let err = cmd.extract_dependencies(&sk).unwrap_err();
        assert!(err.to_string().ends_with("missing dependency companion_eve.dut_server"));

        let mut sk = keeper_ready_for_tests();
        sk.base_mut().primary_device = None;
        let err = cmd.extract_dependencies(&sk).unwrap_err();
        assert!(err.to_string().ends_with("missing dependency primary_device"));

        let mut sk = keeper_ready_for_tests();
        sk.base_mut().service_addresses.clear();
        let err = cmd.extract_dependencies(&sk).unwrap_err();
        assert!(err.to_string().ends_with("missing dependency cros-test_address"));
    }

    #[test]
    fn test_run_tests_consumes_queued_task_once() {
        let mut sk = keeper_ready_for_tests();
        let task = TestTask::new(RunTestsRequest::default());
        let second = TestTask::new(RunTestsRequest::default());
        let second_id = second.task_id.clone();
        sk.base_mut().tasks.test.push_back(task);
        sk.base_mut().tasks.test.push_back(second);

        let mut cmd = RunTests::new();
        cmd.extract_dependencies(&sk).unwrap();
        cmd.response = Some(RunTestsResponse {
            test_case_results: vec![TestCaseResult {
                test_case_id: "tast.example.Pass".into(),
                verdict: Verdict::Pass,
                result_dir_path: None,
            }],
        });
        cmd.update_state_keeper(&mut sk).unwrap();
        cmd.update_state_keeper(&mut sk).unwrap();

        let base = sk.base();
        assert_eq!(base.tasks.test.len(), 1);
        assert_eq!(base.tasks.test[0].task_id, second_id);
        assert_eq!(base.test_response.as_ref().unwrap().test_case_results.len(), 1);
        assert!(base.injectables.contains(TEST_RESPONSE));
    }
}
