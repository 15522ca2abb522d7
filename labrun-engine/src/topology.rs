//! Assignment of discovered devices to the roles a test request asks for.

use std::collections::HashSet;

use labrun_shared::dut::Dut;
use labrun_shared::request::DeviceRequest;
use tracing::debug;

use crate::error::{CommandError, CommandResult};
use crate::state::{Device, PRIMARY_DEVICE_ID};

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceAssignment {
    pub primary: Device,
    pub companions: Vec<Device>,
}

impl DeviceAssignment {
    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        std::iter::once(&self.primary).chain(self.companions.iter())
    }
}

/// Assign one device from `pool` to the primary request and to each
/// companion request, in order. Matched devices are removed from `pool`;
/// devices nobody asked for stay behind. On failure the pool is untouched.
pub fn assign_devices(
    pool: &mut Vec<Dut>,
    primary: &DeviceRequest,
    companions: &[DeviceRequest],
) -> CommandResult<DeviceAssignment> {
    let mut remaining = pool.clone();
    let mut used_ids = HashSet::new();

    let dut = take_match(&mut remaining, primary)?;
    used_ids.insert(PRIMARY_DEVICE_ID.to_string());
    let primary = Device {
        id: PRIMARY_DEVICE_ID.to_string(),
        dut,
        request: primary.clone(),
        dut_server: None,
    };

    let mut assigned = Vec::with_capacity(companions.len());
    for request in companions {
        let dut = take_match(&mut remaining, request)?;
        let id = unique_id(&format!("companion_{}", request.board()), &mut used_ids);
        debug!("assigned {} to {}", dut.id, id);
        assigned.push(Device {
            id,
            dut,
            request: request.clone(),
            dut_server: None,
        });
    }

    *pool = remaining;
    Ok(DeviceAssignment {
        primary,
        companions: assigned,
    })
}

fn take_match(pool: &mut Vec<Dut>, request: &DeviceRequest) -> CommandResult<Dut> {
    let pos = pool
        .iter()
        .position(|dut| matches(dut, request))
        .ok_or_else(|| CommandError::DeviceNotFound {
            board: request.board().to_string(),
            model: request.model().to_string(),
        })?;
    Ok(pool.remove(pos))
}

fn matches(dut: &Dut, request: &DeviceRequest) -> bool {
    if dut.board() != request.board() {
        return false;
    }
    request.model().is_empty() || dut.model() == request.model()
}

/// `base`, or `base_2`, `base_3`... whichever is free first.
fn unique_id(base: &str, used: &mut HashSet<String>) -> String {
    let mut id = base.to_string();
    let mut n = 2;
    while used.contains(&id) {
        id = format!("{base}_{n}");
        n += 1;
    }
    used.insert(id.clone());
    id
}
