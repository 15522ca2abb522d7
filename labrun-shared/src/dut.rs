use std::fmt::Display;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub struct IpEndpoint {
    pub address: String,
    pub port: u16,
}

impl IpEndpoint {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    /// Parse `host:port`. IPv6 literals must be bracketed (`[::1]:22`).
    pub fn parse(s: &str) -> Option<Self> {
        let (host, port) = s.rsplit_once(':')?;
        let port = port.parse().ok()?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return None;
        }
        Some(Self::new(host, port))
    }
}

impl Display for IpEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.address.contains(':') {
            write!(f, "[{}]:{}", self.address, self.port)
        } else {
            write!(f, "{}:{}", self.address, self.port)
        }
    }
}

/// Board (build target) and optional model of a device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DutModel {
    pub build_target: String,
    #[serde(default)]
    pub model_name: String,
}

impl DutModel {
    pub fn new(build_target: impl Into<String>, model_name: impl Into<String>) -> Self {
        Self {
            build_target: build_target.into(),
            model_name: model_name.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheServer {
    pub address: IpEndpoint,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DutKind {
    ChromeOs {
        ssh: IpEndpoint,
        dut_model: DutModel,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        servo: Option<IpEndpoint>,
    },
    Android {
        serial_number: String,
        /// Host the device is attached to over adb.
        associated_host: IpEndpoint,
        dut_model: DutModel,
    },
    Devboard {
        board_type: String,
        ssh: IpEndpoint,
        dut_model: DutModel,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Dut {
    pub id: String,
    #[serde(flatten)]
    pub kind: DutKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_server: Option<CacheServer>,
}

impl Dut {
    pub fn chromeos(id: impl Into<String>, ssh: IpEndpoint, dut_model: DutModel) -> Self {
        Self {
            id: id.into(),
            kind: DutKind::ChromeOs {
                ssh,
                dut_model,
                servo: None,
            },
            cache_server: None,
        }
    }

    /// Address the rest of the pipeline uses to reach the device.
    pub fn endpoint(&self) -> &IpEndpoint {
        match &self.kind {
            DutKind::ChromeOs { ssh, .. } | DutKind::Devboard { ssh, .. } => ssh,
            DutKind::Android {
                associated_host, ..
            } => associated_host,
        }
    }

    /// Same device, reached through `endpoint` (e.g. the local end of a tunnel).
    pub fn with_endpoint(&self, endpoint: IpEndpoint) -> Self {
        let mut dut = self.clone();
        match &mut dut.kind {
            DutKind::ChromeOs { ssh, .. } | DutKind::Devboard { ssh, .. } => *ssh = endpoint,
            DutKind::Android {
                associated_host, ..
            } => *associated_host = endpoint,
        }
        dut
    }

    pub fn dut_model(&self) -> &DutModel {
        match &self.kind {
            DutKind::ChromeOs { dut_model, .. }
            | DutKind::Android { dut_model, .. }
            | DutKind::Devboard { dut_model, .. } => dut_model,
        }
    }

    pub fn board(&self) -> &str {
        &self.dut_model().build_target
    }

    pub fn model(&self) -> &str {
        &self.dut_model().model_name
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            DutKind::ChromeOs { .. } => "chromeos",
            DutKind::Android { .. } => "android",
            DutKind::Devboard { .. } => "devboard",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DutTopology {
    pub id: String,
    #[serde(default)]
    pub duts: Vec<Dut>,
}

impl DutTopology {
    pub fn single(id: impl Into<String>, dut: Dut) -> Self {
        Self {
            id: id.into(),
            duts: vec![dut],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.duts.is_empty()
    }
}

/// Health state tracked by the device-state store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    #[default]
    Unknown,
    Ready,
    NeedsRepair,
    NeedsReset,
    NeedsManualRepair,
}

impl DeviceState {
    pub fn is_unknown(&self) -> bool {
        matches!(self, DeviceState::Unknown)
    }
}
