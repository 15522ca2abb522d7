//! Device discovery, role assignment and device health bookkeeping.

use async_trait::async_trait;
use labrun_shared::dut::{DeviceState, Dut, DutTopology};
use labrun_shared::request::DeviceRequest;
use tracing::warn;

use crate::command::{Command, StepContext, unsupported_state_keeper};
use crate::error::{CommandError, CommandResult};
use crate::state::injectables::{DUT_TOPOLOGY, PRIMARY_DEVICE};
use crate::state::{BaseState, StateKeeper};
use crate::topology::{DeviceAssignment, assign_devices};
use crate::ui::StepStatus;

/// Looks the primary host up in inventory.
#[derive(Debug, Default)]
pub struct LoadDutTopology {
    pub hostname: String,
    pub topology: Option<DutTopology>,
}

impl LoadDutTopology {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Command for LoadDutTopology {
    fn name(&self) -> &'static str {
        "load-dut-topology"
    }

    fn extract_dependencies(&mut self, sk: &StateKeeper) -> CommandResult<()> {
        match sk {
            StateKeeper::HwTest(s) => {
                if s.hostname.is_empty() {
                    return Err(CommandError::missing(self.name(), "hostname"));
                }
                self.hostname = s.hostname.clone();
                Ok(())
            }
            _ => Err(unsupported_state_keeper(self.name(), sk)),
        }
    }

    fn update_state_keeper(&self, sk: &mut StateKeeper) -> CommandResult<()> {
        let StateKeeper::HwTest(s) = sk else {
            return Err(unsupported_state_keeper(self.name(), sk));
        };
        let Some(topology) = self.topology.as_ref().filter(|t| !t.is_empty()) else {
            return Ok(());
        };
        if s.cache_server.is_none() {
            s.cache_server = topology
                .duts
                .iter()
                .find_map(|d| d.cache_server.as_ref())
                .map(|c| c.address.clone());
        }
        s.base.dut_topology = Some(topology.clone());
        s.base.injectables.set(DUT_TOPOLOGY, topology.clone());
        Ok(())
    }
}

/// Binds devices from the discovered topology to the requested roles.
#[derive(Debug, Default)]
pub struct MatchDevices {
    pool: Vec<Dut>,
    primary_request: DeviceRequest,
    companion_requests: Vec<DeviceRequest>,
    pub assignment: Option<DeviceAssignment>,
}

impl MatchDevices {
    pub fn new() -> Self {
        Self::default()
    }

    fn extract_from(&mut self, base: &BaseState) -> CommandResult<()> {
        let request = base
            .test_request
            .as_ref()
            .ok_or_else(|| CommandError::missing(self.name(), "test_request"))?;
        let topology = base
            .dut_topology
            .as_ref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| CommandError::missing(self.name(), "dut_topology"))?;

        self.pool = topology.duts.clone();
        self.primary_request = request.primary_dut.clone();
        self.companion_requests = request.companion_duts.clone();
        Ok(())
    }

    fn update_base(&self, base: &mut BaseState) {
        let Some(assignment) = &self.assignment else {
            return;
        };
        for device in assignment.devices() {
            base.injectables.set(device.id.clone(), device.clone());
        }
        base.injectables
            .set(PRIMARY_DEVICE, assignment.primary.clone());
        base.primary_device = Some(assignment.primary.clone());
        if !assignment.companions.is_empty() {
            base.companion_devices = assignment.companions.clone();
        }
    }
}

#[async_trait]
impl Command for MatchDevices {
    fn name(&self) -> &'static str {
        "match-devices"
    }

    fn extract_dependencies(&mut self, sk: &StateKeeper) -> CommandResult<()> {
        match sk {
            StateKeeper::HwTest(s) => self.extract_from(&s.base),
            StateKeeper::LocalTest(s) => self.extract_from(&s.base),
            StateKeeper::PreLocalTest(_) => Err(unsupported_state_keeper(self.name(), sk)),
        }
    }

    async fn execute(&mut self, ctx: &StepContext) -> CommandResult<()> {
        let assignment = assign_devices(
            &mut self.pool,
            &self.primary_request,
            &self.companion_requests,
        )?;
        for device in assignment.devices() {
            ctx.log
                .write_line(&format!("{} -> {} ({})", device.id, device.dut.id, device.dut.endpoint()));
        }
        self.assignment = Some(assignment);
        Ok(())
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

#[derive(Debug, Default)]
pub struct GetDeviceState {
    pub hostname: String,
    pub state: Option<DeviceState>,
}

impl GetDeviceState {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Command for GetDeviceState {
    fn name(&self) -> &'static str {
        "get-device-state"
    }

    fn extract_dependencies(&mut self, sk: &StateKeeper) -> CommandResult<()> {
        let StateKeeper::HwTest(s) = sk else {
            return Err(unsupported_state_keeper(self.name(), sk));
        };
        if s.hostname.is_empty() {
            return Err(CommandError::missing(self.name(), "hostname"));
        }
        self.hostname = s.hostname.clone();
        Ok(())
    }

    fn update_state_keeper(&self, sk: &mut StateKeeper) -> CommandResult<()> {
        let StateKeeper::HwTest(s) = sk else {
            return Err(unsupported_state_keeper(self.name(), sk));
        };
        if let Some(state) = self.state.filter(|st| !st.is_unknown()) {
            s.base.device_state = state;
        }
        Ok(())
    }
}

/// Records the device's health at the end of a run. Runs as teardown, so a
/// missing hostname or a failing store never fails the step.
#[derive(Debug, Default)]
pub struct UpdateDeviceState {
    requested: Option<DeviceState>,
    pub hostname: String,
    pub state: DeviceState,
    pub applied: bool,
}

impl UpdateDeviceState {
    /// Store exactly `state`.
    pub fn new(state: DeviceState) -> Self {
        Self {
            requested: Some(state),
            ..Default::default()
        }
    }

    /// Derive the state from the run: any infrastructure error sends the
    /// device to repair, anything else leaves it ready.
    pub fn from_outcome() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Command for UpdateDeviceState {
    fn name(&self) -> &'static str {
        "update-device-state"
    }

    fn extract_dependencies(&mut self, sk: &StateKeeper) -> CommandResult<()> {
        let StateKeeper::HwTest(s) = sk else {
            return Err(unsupported_state_keeper(self.name(), sk));
        };
        if s.hostname.is_empty() {
            warn!("{}: no hostname, device state will not be stored", self.name());
        }
        self.hostname = s.hostname.clone();
        self.state = self.requested.unwrap_or_else(|| {
            let infra_error = s
                .base
                .outcome
                .steps
                .iter()
                .any(|step| step.status == StepStatus::Error);
            if infra_error {
                DeviceState::NeedsRepair
            } else {
                DeviceState::Ready
            }
        });
        Ok(())
    }

    fn update_state_keeper(&self, sk: &mut StateKeeper) -> CommandResult<()> {
        let StateKeeper::HwTest(s) = sk else {
            return Err(unsupported_state_keeper(self.name(), sk));
        };
        if self.applied {
            s.base.device_state = self.state;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{HwTestState, LocalTestState, PreLocalTestState, StepReport};
    use crate::testing::{dut, hw_keeper, step_context, test_request};
    use labrun_shared::dut::{CacheServer, IpEndpoint};

    #[test]
    fn test_load_topology_needs_hostname() {
        let mut cmd = LoadDutTopology::new();
        let sk = StateKeeper::HwTest(HwTestState::default());
        let err = cmd.extract_dependencies(&sk).unwrap_err();
        assert_eq!(err.to_string(), "load-dut-topology: missing dependency hostname");

        let sk = hw_keeper();
        cmd.extract_dependencies(&sk).unwrap();
        assert_eq!(cmd.hostname, "chromeos1-row1-rack1-host1");
    }

    #[test]
    fn test_load_topology_rejects_other_keepers() {
        let mut cmd = LoadDutTopology::new();
        for sk in [
            StateKeeper::LocalTest(LocalTestState::default()),
            StateKeeper::PreLocalTest(PreLocalTestState::default()),
        ] {
            assert!(matches!(
                cmd.extract_dependencies(&sk),
                Err(CommandError::UnsupportedStateKeeper { .. })
            ));
            let mut sk = sk;
            assert!(matches!(
                cmd.update_state_keeper(&mut sk),
                Err(CommandError::UnsupportedStateKeeper { .. })
            ));
        }
    }

    #[test]
    fn test_load_topology_update_keeps_existing_on_empty_result() {
        let mut sk = hw_keeper();
        let mut topo = DutTopology::single("t", dut("betty#1", "betty"));
        topo.duts[0].cache_server = Some(CacheServer {
            address: IpEndpoint::new("10.0.0.9", 8082),
        });

        let cmd = LoadDutTopology {
            hostname: "h".into(),
            topology: Some(topo.clone()),
        };
        cmd.update_state_keeper(&mut sk).unwrap();
        cmd.update_state_keeper(&mut sk).unwrap();
        let StateKeeper::HwTest(s) = &sk else { unreachable!() };
        assert_eq!(s.base.dut_topology.as_ref(), Some(&topo));
        assert_eq!(s.cache_server, Some(IpEndpoint::new("10.0.0.9", 8082)));
        assert!(s.base.injectables.contains(DUT_TOPOLOGY));

        let empty = LoadDutTopology {
            hostname: "h".into(),
            topology: Some(DutTopology::default()),
        };
        empty.update_state_keeper(&mut sk).unwrap();
        assert_eq!(sk.base().dut_topology.as_ref(), Some(&topo));
    }

    #[tokio::test]
    async fn test_match_devices_end_to_end() {
        let mut sk = hw_keeper();
        let base = sk.base_mut();
        base.test_request = Some(test_request("betty", &["betty", "eve"]));
        base.dut_topology = Some(DutTopology {
            id: "pool".into(),
            duts: vec![dut("betty#1", "betty"), dut("betty#2", "betty"), dut("eve#1", "eve")],
        });

        let mut cmd = MatchDevices::new();
        cmd.extract_dependencies(&sk).unwrap();
        cmd.execute(&step_context()).await.unwrap();
        cmd.update_state_keeper(&mut sk).unwrap();

        let base = sk.base();
        assert_eq!(base.primary_device.as_ref().unwrap().dut.id, "betty#1");
        assert_eq!(base.device("companion_betty").unwrap().dut.id, "betty#2");
        assert_eq!(base.device("companion_eve").unwrap().dut.id, "eve#1");
        assert!(base.injectables.contains(PRIMARY_DEVICE));
        assert!(base.injectables.contains("companion_eve"));
    }

    #[test]
    fn test_match_devices_missing_fields() {
        let mut cmd = MatchDevices::new();
        let mut sk = hw_keeper();
        let err = cmd.extract_dependencies(&sk).unwrap_err();
        assert!(err.to_string().ends_with("missing dependency test_request"));

        sk.base_mut().test_request = Some(test_request("betty", &[]));
        let err = cmd.extract_dependencies(&sk).unwrap_err();
        assert!(err.to_string().ends_with("missing dependency dut_topology"));

        let sk = StateKeeper::PreLocalTest(PreLocalTestState::default());
        assert!(matches!(
            cmd.extract_dependencies(&sk),
            Err(CommandError::UnsupportedStateKeeper { .. })
        ));
    }

    #[tokio::test]
    async fn test_match_devices_not_found_writes_nothing() {
        let mut sk = hw_keeper();
        let base = sk.base_mut();
        base.test_request = Some(test_request("zork", &[]));
        base.dut_topology = Some(DutTopology::single("t", dut("betty#1", "betty")));

        let mut cmd = MatchDevices::new();
        cmd.extract_dependencies(&sk).unwrap();
        let err = cmd.execute(&step_context()).await.unwrap_err();
        assert!(matches!(err, CommandError::DeviceNotFound { .. }));
        cmd.update_state_keeper(&mut sk).unwrap();
        assert!(sk.base().primary_device.is_none());
    }

    #[test]
    fn test_get_device_state_ignores_unknown() {
        let mut sk = hw_keeper();
        sk.base_mut().device_state = DeviceState::NeedsReset;
        let cmd = GetDeviceState {
            hostname: "h".into(),
            state: Some(DeviceState::Unknown),
        };
        cmd.update_state_keeper(&mut sk).unwrap();
        assert_eq!(sk.base().device_state, DeviceState::NeedsReset);

        let cmd = GetDeviceState {
            hostname: "h".into(),
            state: Some(DeviceState::Ready),
        };
        cmd.update_state_keeper(&mut sk).unwrap();
        assert_eq!(sk.base().device_state, DeviceState::Ready);
    }

    #[test]
    fn test_update_device_state_derives_from_outcome() {
        let mut sk = hw_keeper();
        sk.base_mut().outcome.record(StepReport {
            name: "run-tests".into(),
            status: StepStatus::Failure,
            summary: None,
        });
        let mut cmd = UpdateDeviceState::from_outcome();
        cmd.extract_dependencies(&sk).unwrap();
        assert_eq!(cmd.state, DeviceState::Ready);

        sk.base_mut().outcome.record(StepReport {
            name: "provision-install".into(),
            status: StepStatus::Error,
            summary: None,
        });
        let mut cmd = UpdateDeviceState::from_outcome();
        cmd.extract_dependencies(&sk).unwrap();
        assert_eq!(cmd.state, DeviceState::NeedsRepair);
    }

    #[test]
    fn test_update_device_state_tolerates_missing_hostname() {
        let sk = StateKeeper::HwTest(HwTestState::default());
        let mut cmd = UpdateDeviceState::new(DeviceState::NeedsManualRepair);
        cmd.extract_dependencies(&sk).unwrap();
        assert!(cmd.hostname.is_empty());
        assert_eq!(cmd.state, DeviceState::NeedsManualRepair);
    }
}
