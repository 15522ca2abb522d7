//! Identifier-keyed store for data wired between commands by configuration
//! rather than by code.
//!
//! This is the only dynamically typed surface of the run-state. Producers
//! store a tagged [`Injectable`]; consumers read it back with a checked
//! conversion ([`Injectables::get`]) or as JSON when the value is spliced
//! into a request ([`Injectables::get_json`]).

use std::collections::HashMap;

use labrun_shared::dut::{DutTopology, IpEndpoint};
use labrun_shared::services::{InstallResponse, RunTestsResponse};
use serde_json::Value;

use super::Device;
use crate::error::{CommandError, CommandResult};

pub const DUT_TOPOLOGY: &str = "dut_topology";
pub const PRIMARY_DEVICE: &str = "primary_device";
pub const TEST_RESPONSE: &str = "test_response";

pub fn provision_key(device_id: &str) -> String {
    format!("{device_id}_provision")
}

pub fn service_address_key(service: &str) -> String {
    format!("{service}_address")
}

#[derive(Debug, Clone, PartialEq)]
pub enum Injectable {
    DutTopology(DutTopology),
    Device(Device),
    InstallResponses(Vec<InstallResponse>),
    TestResponse(RunTestsResponse),
    Endpoint(IpEndpoint),
    Text(String),
    Json(Value),
}

impl Injectable {
    pub fn kind(&self) -> &'static str {
        match self {
            Injectable::DutTopology(_) => "dut_topology",
            Injectable::Device(_) => "device",
            Injectable::InstallResponses(_) => "install_responses",
            Injectable::TestResponse(_) => "test_response",
            Injectable::Endpoint(_) => "endpoint",
            Injectable::Text(_) => "text",
            Injectable::Json(_) => "json",
        }
    }

    pub fn to_json(&self) -> Result<Value, serde_json::Error> {
        match self {
            Injectable::DutTopology(v) => serde_json::to_value(v),
            Injectable::Device(v) => serde_json::to_value(v),
            Injectable::InstallResponses(v) => serde_json::to_value(v),
            Injectable::TestResponse(v) => serde_json::to_value(v),
            Injectable::Endpoint(v) => serde_json::to_value(v),
            Injectable::Text(v) => Ok(Value::String(v.clone())),
            Injectable::Json(v) => Ok(v.clone()),
        }
    }
}

macro_rules! injectable_conversions {
    ($($ty:ty => $variant:ident, $kind:literal;)*) => {
        $(
            impl From<$ty> for Injectable {
                fn from(v: $ty) -> Self {
                    Injectable::$variant(v)
                }
            }

            impl FromInjectable for $ty {
                const KIND: &'static str = $kind;

                fn from_injectable(value: &Injectable) -> Option<Self> {
                    match value {
                        Injectable::$variant(v) => Some(v.clone()),
                        _ => None,
                    }
                }
            }
        )*
    };
}

/// Checked downcast out of an [`Injectable`].
pub trait FromInjectable: Sized {
    const KIND: &'static str;
    fn from_injectable(value: &Injectable) -> Option<Self>;
}

injectable_conversions! {
    DutTopology => DutTopology, "dut_topology";
    Device => Device, "device";
    Vec<InstallResponse> => InstallResponses, "install_responses";
    RunTestsResponse => TestResponse, "test_response";
    IpEndpoint => Endpoint, "endpoint";
    String => Text, "text";
    Value => Json, "json";
}

#[derive(Debug, Clone, Default)]
pub struct Injectables {
    entries: HashMap<String, Injectable>,
}

impl Injectables {
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Injectable>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn raw(&self, key: &str) -> Option<&Injectable> {
        self.entries.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Whether some entry key is a prefix of `identifier`.
    pub fn resolves(&self, identifier: &str) -> bool {
        self.split_identifier(identifier).is_some()
    }

    pub fn get<T: FromInjectable>(&self, key: &str) -> CommandResult<T> {
        let value = self.entries.get(key).ok_or_else(|| CommandError::Injectable {
            key: key.to_string(),
            reason: "not set".into(),
        })?;
        T::from_injectable(value).ok_or_else(|| CommandError::Injectable {
            key: key.to_string(),
            reason: format!("holds {}, wanted {}", value.kind(), T::KIND),
        })
    }

    /// Resolve `identifier` as JSON. The identifier is an entry key,
    /// optionally followed by a dot-separated path into the value
    /// (`primary_device.dut.ssh.address`); the longest matching key wins.
    pub fn get_json(&self, identifier: &str) -> CommandResult<Value> {
        let (key, path) = self.split_identifier(identifier).ok_or_else(|| {
            CommandError::Injectable {
                key: identifier.to_string(),
                reason: "not set".into(),
            }
        })?;
        let root = self.entries[key]
            .to_json()
            .map_err(|e| CommandError::Injectable {
                key: key.to_string(),
                reason: format!("not representable as json: {e}"),
            })?;

        let mut current = &root;
        for segment in path.iter() {
            let next = match current {
                Value::Object(map) => map.get(*segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            };
            current = next.ok_or_else(|| CommandError::Injectable {
                key: identifier.to_string(),
                reason: format!("no field {segment:?}"),
            })?;
        }
        Ok(current.clone())
    }

    fn split_identifier<'a>(&self, identifier: &'a str) -> Option<(&'a str, Vec<&'a str>)> {
        if self.entries.contains_key(identifier) {
            return Some((identifier, Vec::new()));
        }
        let mut cut = identifier.len();
        while let Some(pos) = identifier[..cut].rfind('.') {
            let key = &identifier[..pos];
            if self.entries.contains_key(key) {
                let path = identifier[pos + 1..].split('.').collect();
                return Some((key, path));
            }
            cut = pos;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labrun_shared::dut::{Dut, DutModel};
    use labrun_shared::request::DeviceRequest;

    fn device() -> Device {
        Device {
            id: "primary".into(),
            dut: Dut::chromeos(
                "betty-1",
                IpEndpoint::new("10.0.0.2", 22),
                DutModel::new("betty", ""),
            ),
            request: DeviceRequest::default(),
            dut_server: None,
        }
    }

    #[test]
    fn test_get_checks_kind() {
        let mut inj = Injectables::default();
        inj.set(PRIMARY_DEVICE, device());

        let d: Device = inj.get(PRIMARY_DEVICE).unwrap();
        assert_eq!(d.id, "primary");

        let err = inj.get::<DutTopology>(PRIMARY_DEVICE).unwrap_err();
        assert!(err.to_string().contains("holds device, wanted dut_topology"));

        let missing = inj.get::<String>("nope").unwrap_err();
        assert!(missing.to_string().contains("not set"));
    }

    #[test]
    fn test_get_json_walks_path() {
        let mut inj = Injectables::default();
        inj.set(PRIMARY_DEVICE, device());
        inj.set("builds", serde_json::json!({"items": ["R1", "R2"]}));

        let addr = inj.get_json("primary_device.dut.ssh.address").unwrap();
        assert_eq!(addr, Value::String("10.0.0.2".into()));

        let second = inj.get_json("builds.items.1").unwrap();
        assert_eq!(second, Value::String("R2".into()));

        assert!(inj.get_json("primary_device.dut.nothing").is_err());
        assert!(inj.get_json("absent.field").is_err());
    }

    #[test]
    fn test_get_json_prefers_longest_key() {
        let mut inj = Injectables::default();
        inj.set("a", serde_json::json!({"b": 1}));
        inj.set("a.b", Injectable::Text("dotted".into()));
        assert_eq!(inj.get_json("a.b").unwrap(), Value::String("dotted".into()));
    }
}
