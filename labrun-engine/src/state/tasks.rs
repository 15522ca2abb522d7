//! FIFO task queues filled by configuration and drained one task per step.

use std::collections::VecDeque;

use labrun_shared::dut::IpEndpoint;
use labrun_shared::services::{GenericRequest, InstallRequest, PublishRequest, RunTestsRequest};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

use super::injectables::Injectables;
use crate::error::{CommandError, CommandResult};

/// Copy the injectable named `value_identifier` into the request field at
/// dot-separated path `key`.
#[derive(Debug, Clone, PartialEq)]
pub struct DynamicDep {
    pub key: String,
    pub value_identifier: String,
}

impl DynamicDep {
    pub fn new(key: impl Into<String>, value_identifier: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value_identifier: value_identifier.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionTask {
    pub task_id: String,
    pub device_id: String,
    pub dynamic_deps: Vec<DynamicDep>,
    pub install_request: InstallRequest,
    /// Talk to this service instead of the one the executor started.
    pub service_address: Option<IpEndpoint>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestTask {
    pub task_id: String,
    pub dynamic_deps: Vec<DynamicDep>,
    pub request: RunTestsRequest,
    pub service_address: Option<IpEndpoint>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublishTask {
    pub task_id: String,
    pub dynamic_deps: Vec<DynamicDep>,
    pub request: PublishRequest,
    pub service_address: Option<IpEndpoint>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenericTask {
    pub task_id: String,
    /// Injectable key the response is stored under.
    pub output_identifier: String,
    pub method: String,
    pub dynamic_deps: Vec<DynamicDep>,
    pub request: GenericRequest,
    pub service_address: Option<IpEndpoint>,
}

fn new_task_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl ProvisionTask {
    pub fn new(device_id: impl Into<String>, install_request: InstallRequest) -> Self {
        Self {
            task_id: new_task_id(),
            device_id: device_id.into(),
            dynamic_deps: Vec::new(),
            install_request,
            service_address: None,
        }
    }
}

impl TestTask {
    pub fn new(request: RunTestsRequest) -> Self {
        Self {
            task_id: new_task_id(),
            dynamic_deps: Vec::new(),
            request,
            service_address: None,
        }
    }
}

impl PublishTask {
    pub fn new(request: PublishRequest) -> Self {
        Self {
            task_id: new_task_id(),
            dynamic_deps: Vec::new(),
            request,
            service_address: None,
        }
    }
}

impl GenericTask {
    pub fn new(
        output_identifier: impl Into<String>,
        method: impl Into<String>,
        request: GenericRequest,
    ) -> Self {
        Self {
            task_id: new_task_id(),
            output_identifier: output_identifier.into(),
            method: method.into(),
            dynamic_deps: Vec::new(),
            request,
            service_address: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskQueues {
    pub provision: VecDeque<ProvisionTask>,
    pub test: VecDeque<TestTask>,
    pub publish: VecDeque<PublishTask>,
    pub generic: VecDeque<GenericTask>,
}

/// Remove the front task if it is the one identified by `task_id`. Returns
/// whether something was removed, so a repeated call is a no-op.
pub fn pop_if_front<T>(queue: &mut VecDeque<T>, task_id: &str, id_of: impl Fn(&T) -> &str) -> bool {
    match queue.front() {
        Some(front) if id_of(front) == task_id => {
            queue.pop_front();
            true
        }
        _ => false,
    }
}

/// Returns a copy of `request` with every dynamic dependency spliced in.
pub fn resolve_dynamic_deps<T>(
    command: &'static str,
    request: &T,
    deps: &[DynamicDep],
    injectables: &Injectables,
) -> CommandResult<T>
where
    T: Serialize + DeserializeOwned,
{
    if deps.is_empty() {
        return serde_json::to_value(request)
            .and_then(serde_json::from_value)
            .map_err(|e| CommandError::InvalidInput {
                command,
                reason: e.to_string(),
            });
    }

    let mut doc = serde_json::to_value(request).map_err(|e| CommandError::InvalidInput {
        command,
        reason: e.to_string(),
    })?;

    for dep in deps {
        if !injectables.resolves(&dep.value_identifier) {
            return Err(CommandError::missing(command, dep.value_identifier.clone()));
        }
        let value = injectables.get_json(&dep.value_identifier)?;
        set_path(&mut doc, &dep.key, value).map_err(|reason| CommandError::Injectable {
            key: dep.value_identifier.clone(),
            reason,
        })?;
    }

    serde_json::from_value(doc).map_err(|e| CommandError::Injectable {
        key: deps
            .iter()
            .map(|d| d.value_identifier.as_str())
            .collect::<Vec<_>>()
            .join(","),
        reason: format!("resolved request does not decode: {e}"),
    })
}

/// Set `value` at dot-separated `path`, creating intermediate objects.
/// Numeric segments index into existing arrays.
pub fn set_path(doc: &mut Value, path: &str, value: Value) -> Result<(), String> {
    let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
    let Some((last, parents)) = segments.split_last() else {
        return Err("empty key".to_string());
    };

    let mut current = doc;
    for segment in parents {
        current = step_into(current, segment)?;
    }

    match current {
        Value::Array(items) => {
            let idx: usize = last
                .parse()
                .map_err(|_| format!("{last:?} is not an array index"))?;
            let slot = items
                .get_mut(idx)
                .ok_or_else(|| format!("index {idx} out of range"))?;
            *slot = value;
        }
        Value::Null => {
            let mut map = serde_json::Map::new();
            map.insert(last.to_string(), value);
            *current = Value::Object(map);
        }
        Value::Object(map) => {
            map.insert(last.to_string(), value);
        }
        other => return Err(format!("cannot set {last:?} inside {other}")),
    }
    Ok(())
}

fn step_into<'a>(current: &'a mut Value, segment: &str) -> Result<&'a mut Value, String> {
    if current.is_null() {
        *current = Value::Object(serde_json::Map::new());
    }
    match current {
        Value::Object(map) => Ok(map.entry(segment.to_string()).or_insert(Value::Null)),
        Value::Array(items) => {
            let idx: usize = segment
                .parse()
                .map_err(|_| format!("{segment:?} is not an array index"))?;
            items
                .get_mut(idx)
                .ok_or_else(|| format!("index {idx} out of range"))
        }
        other => Err(format!("cannot descend into {other} at {segment:?}")),
    }
}
