//! Run-state shared between pipeline steps.
//!
//! One [`StateKeeper`] exists per run. Every variant embeds a [`BaseState`];
//! the variants add what only their flavour of run needs. Commands match on
//! the variant and reject the ones they cannot work with.

pub mod injectables;
pub mod tasks;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use labrun_shared::dut::{DeviceState, Dut, DutTopology, IpEndpoint};
use labrun_shared::request::{DeviceRequest, TestRequest};
use labrun_shared::services::{GceImage, InstallResponse, RunTestsResponse};
use serde::Serialize;

use crate::ui::StepStatus;
pub use injectables::{FromInjectable, Injectable, Injectables};
pub use tasks::{DynamicDep, GenericTask, ProvisionTask, PublishTask, TaskQueues, TestTask};

pub const PRIMARY_DEVICE_ID: &str = "primary";

/// A discovered device bound to a logical role.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Device {
    /// `primary` or `companion_<board>[_<n>]`
    pub id: String,
    pub dut: Dut,
    pub request: DeviceRequest,
    pub dut_server: Option<IpEndpoint>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    pub name: String,
    pub status: StepStatus,
    pub summary: Option<String>,
}

/// Run-scoped result threaded through every step.
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    /// Set once any step reported a product failure, as opposed to lab or
    /// infrastructure trouble.
    pub non_infra_failure: bool,
    pub steps: Vec<StepReport>,
}

impl RunOutcome {
    pub fn record(&mut self, report: StepReport) {
        if report.status == StepStatus::Failure {
            self.non_infra_failure = true;
        }
        self.steps.push(report);
    }

    pub fn failed_steps(&self) -> impl Iterator<Item = &StepReport> {
        self.steps
            .iter()
            .filter(|s| s.status != StepStatus::Success)
    }
}

#[derive(Debug, Clone, Default)]
pub struct BaseState {
    pub test_request: Option<TestRequest>,
    pub dut_topology: Option<DutTopology>,
    pub primary_device: Option<Device>,
    pub companion_devices: Vec<Device>,
    /// device id -> install responses in the order they arrived
    pub provision_responses: BTreeMap<String, Vec<InstallResponse>>,
    pub test_response: Option<RunTestsResponse>,
    /// service container name -> reachable address
    pub service_addresses: HashMap<String, IpEndpoint>,
    pub injectables: Injectables,
    pub device_state: DeviceState,
    pub artifact_dir: Option<PathBuf>,
    pub tasks: TaskQueues,
    pub outcome: RunOutcome,
}

impl BaseState {
    pub fn device(&self, id: &str) -> Option<&Device> {
        self.primary_device
            .iter()
            .chain(self.companion_devices.iter())
            .find(|d| d.id == id)
    }

    pub fn device_mut(&mut self, id: &str) -> Option<&mut Device> {
        self.primary_device
            .iter_mut()
            .chain(self.companion_devices.iter_mut())
            .find(|d| d.id == id)
    }
}

/// State of a run against lab hardware found through inventory.
#[derive(Debug, Clone, Default)]
pub struct HwTestState {
    pub base: BaseState,
    /// Inventory hostname of the primary device.
    pub hostname: String,
    pub cache_server: Option<IpEndpoint>,
}

/// Options given on the command line of a local run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalArgs {
    pub board: String,
    pub model: String,
    pub image_path: Option<String>,
    pub tests: Vec<String>,
    pub tags: Vec<String>,
    pub tags_excluded: Vec<String>,
    /// `host[:port]` of an already running device; empty means lease a VM.
    pub dut_host: String,
    pub images_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VmLease {
    pub lease_id: String,
    pub zone: String,
    pub project: String,
    pub address: IpEndpoint,
}

/// State of a run from a workstation, reaching devices or leased VMs over
/// SSH tunnels.
#[derive(Debug, Clone, Default)]
pub struct LocalTestState {
    pub base: BaseState,
    pub args: LocalArgs,
    /// Jump host used as SSH destination; `None` means SSH to the device.
    pub ssh_jump_host: Option<IpEndpoint>,
    /// Local end of the forward tunnel to the primary device.
    pub dut_tunnel_port: Option<u16>,
    /// Host-side cache server reachable by the device through a reverse tunnel.
    pub cache_server: Option<IpEndpoint>,
    pub cache_server_remote_port: Option<u16>,
    pub vm_image: Option<GceImage>,
    pub vm_lease: Option<VmLease>,
}

/// State for the argument-parsing phase that precedes a local run.
#[derive(Debug, Clone, Default)]
pub struct PreLocalTestState {
    pub base: BaseState,
    pub args: LocalArgs,
    pub chroot_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub enum StateKeeper {
    HwTest(HwTestState),
    LocalTest(LocalTestState),
    PreLocalTest(PreLocalTestState),
}

impl StateKeeper {
    pub fn name(&self) -> &'static str {
        match self {
            StateKeeper::HwTest(_) => "hw-test",
            StateKeeper::LocalTest(_) => "local-test",
            StateKeeper::PreLocalTest(_) => "pre-local-test",
        }
    }

    pub fn base(&self) -> &BaseState {
        match self {
            StateKeeper::HwTest(s) => &s.base,
            StateKeeper::LocalTest(s) => &s.base,
            StateKeeper::PreLocalTest(s) => &s.base,
        }
    }

    pub fn base_mut(&mut self) -> &mut BaseState {
        match self {
            StateKeeper::HwTest(s) => &mut s.base,
            StateKeeper::LocalTest(s) => &mut s.base,
            StateKeeper::PreLocalTest(s) => &mut s.base,
        }
    }
}

/// Overwrite `slot` only with a produced value; `None` never clears it.
pub fn set_if_some<T>(slot: &mut Option<T>, value: Option<T>) {
    if let Some(v) = value {
        *slot = Some(v);
    }
}

/// Overwrite `slot` only with a non-empty string.
pub fn set_if_non_empty(slot: &mut String, value: &str) {
    if !value.is_empty() {
        *slot = value.to_string();
    }
}
