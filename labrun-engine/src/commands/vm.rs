//! Cloud VM lifecycle for local runs: image, lease, release.
//!
//! After a lease succeeds the run sees a single-device topology pointing at
//! the VM, and nothing downstream needs to know it is not lab hardware.

use std::time::Duration;

use async_trait::async_trait;
use labrun_shared::dut::{Dut, DutModel, DutTopology, IpEndpoint};
use labrun_shared::services::{GceImage, InstallStatus, LeaseVmRequest};
use tracing::warn;

use crate::command::{Command, unsupported_state_keeper};
use crate::container::VM_LEASER_SERVICE;
use crate::error::{CommandError, CommandResult};
use crate::state::injectables::{DUT_TOPOLOGY, service_address_key};
use crate::state::{StateKeeper, VmLease, set_if_some};

const MAX_IMAGE_NAME: usize = 63;
const IMAGE_PREFIX: &str = "labrun-";

/// GCE image name for a build: lowercase, `[a-z0-9-]` only, at most 63
/// chars, starting with a letter.
pub fn gce_image_name(build_identifier: &str) -> String {
    let mut name: String = build_identifier
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' { c } else { '-' })
        .collect();
    if !name.starts_with(|c: char| c.is_ascii_lowercase()) {
        name = format!("{IMAGE_PREFIX}{name}");
    }
    name.truncate(MAX_IMAGE_NAME);
    name
}

/// Resolves (and if needed creates) the VM image for the requested build.
#[derive(Debug)]
pub struct GetVmImage {
    pub project: String,
    pub build_identifier: String,
    pub image_name: String,
    pub image: Option<GceImage>,
}

impl GetVmImage {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            build_identifier: String::new(),
            image_name: String::new(),
            image: None,
        }
    }
}

#[async_trait]
impl Command for GetVmImage {
    fn name(&self) -> &'static str {
        "get-vm-image"
    }

    fn extract_dependencies(&mut self, sk: &StateKeeper) -> CommandResult<()> {
        let StateKeeper::LocalTest(s) = sk else {
            return Err(unsupported_state_keeper(self.name(), sk));
        };
        let request = s
            .base
            .test_request
            .as_ref()
            .ok_or_else(|| CommandError::missing(self.name(), "test_request"))?;
        self.build_identifier = request
            .build_identifier()
            .ok_or_else(|| CommandError::missing(self.name(), "build_identifier"))?;
        self.image_name = gce_image_name(&self.build_identifier);
        Ok(())
    }

    fn update_state_keeper(&self, sk: &mut StateKeeper) -> CommandResult<()> {
        let StateKeeper::LocalTest(s) = sk else {
            return Err(unsupported_state_keeper(self.name(), sk));
        };
        set_if_some(&mut s.vm_image, self.image.clone());
        Ok(())
    }
}

/// Leases a VM running the resolved image through the leaser service.
#[derive(Debug)]
pub struct LeaseVm {
    pub zone: String,
    pub machine_type: String,
    pub lease_duration: Duration,
    pub request: Option<LeaseVmRequest>,
    pub service_address: Option<IpEndpoint>,
    pub status: Option<InstallStatus>,
    pub lease: Option<VmLease>,
}

impl LeaseVm {
    pub fn new(zone: impl Into<String>, machine_type: impl Into<String>, lease_duration: Duration) -> Self {
        Self {
            zone: zone.into(),
            machine_type: machine_type.into(),
            lease_duration,
            request: None,
            service_address: None,
            status: None,
            lease: None,
        }
    }
}

#[async_trait]
impl Command for LeaseVm {
    fn name(&self) -> &'static str {
        "lease-vm"
    }

    fn extract_dependencies(&mut self, sk: &StateKeeper) -> CommandResult<()> {
        let name = self.name();
        let StateKeeper::LocalTest(s) = sk else {
            return Err(unsupported_state_keeper(name, sk));
        };
        let image = s
            .vm_image
            .as_ref()
            .ok_or_else(|| CommandError::missing(name, "vm_image"))?;

        let requested = s.base.test_request.as_ref().map(|r| r.primary_dut.dut_model.clone());
        let board = Some(s.args.board.clone())
            .filter(|b| !b.is_empty())
            .or_else(|| requested.as_ref().map(|m| m.build_target.clone()))
            .filter(|b| !b.is_empty())
            .ok_or_else(|| CommandError::missing(name, "board"))?;
        let model = Some(s.args.model.clone())
            .filter(|m| !m.is_empty())
            .or_else(|| requested.map(|m| m.model_name))
            .unwrap_or_default();

        let address = s
            .base
            .service_addresses
            .get(VM_LEASER_SERVICE)
            .cloned()
            .ok_or_else(|| CommandError::missing(name, service_address_key(VM_LEASER_SERVICE)))?;

        self.request = Some(LeaseVmRequest {
            image_name: image.name.clone(),
            image_project: image.project.clone(),
            board,
            model,
            zone: self.zone.clone(),
            machine_type: self.machine_type.clone(),
            lease_duration_secs: self.lease_duration.as_secs(),
        });
        self.service_address = Some(address);
        Ok(())
    }

    fn update_state_keeper(&self, sk: &mut StateKeeper) -> CommandResult<()> {
        let StateKeeper::LocalTest(s) = sk else {
            return Err(unsupported_state_keeper(self.name(), sk));
        };
        let (Some(lease), Some(request)) = (&self.lease, &self.request) else {
            return Ok(());
        };

        let dut = Dut::chromeos(
            lease.lease_id.clone(),
            lease.address.clone(),
            DutModel::new(request.board.clone(), request.model.clone()),
        );
        let topology = DutTopology::single(format!("vm-{}", lease.lease_id), dut);
        s.base.dut_topology = Some(topology.clone());
        s.base.injectables.set(DUT_TOPOLOGY, topology);
        s.vm_lease = Some(lease.clone());
        Ok(())
    }

    fn business_failure(&self) -> Option<String> {
        match self.status {
            Some(status) if !status.is_success() => {
                Some(format!("vm lease failed: {}", status.as_str()))
            }
            _ => None,
        }
    }
}

/// Gives the leased VM back. A run that never leased one does nothing.
#[derive(Debug, Default)]
pub struct ReleaseVm {
    pub lease: Option<VmLease>,
    pub service_address: Option<IpEndpoint>,
    pub released: bool,
}

impl ReleaseVm {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Command for ReleaseVm {
    fn name(&self) -> &'static str {
        "release-vm"
    }

    fn extract_dependencies(&mut self, sk: &StateKeeper) -> CommandResult<()> {
        let StateKeeper::LocalTest(s) = sk else {
            return Err(unsupported_state_keeper(self.name(), sk));
        };
        self.lease = s.vm_lease.clone();
        self.service_address = s.base.service_addresses.get(VM_LEASER_SERVICE).cloned();
        if self.lease.is_some() && self.service_address.is_none() {
            warn!("{}: leaser service is not running, lease will expire on its own", self.name());
        }
        Ok(())
    }

    fn update_state_keeper(&self, sk: &mut StateKeeper) -> CommandResult<()> {
        let StateKeeper::LocalTest(s) = sk else {
            return Err(unsupported_state_keeper(self.name(), sk));
        };
        if self.lease.is_none() {
            return Ok(());
        }
        // the synthesized topology points at a VM that is gone either way
        s.base.dut_topology = None;
        if self.released {
            s.vm_lease = None;
        }
        Ok(())
    }
}
