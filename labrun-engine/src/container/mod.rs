//! Service containers: which image runs with which flags, and the runtime
//! that starts them.

pub mod docker;

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use labrun_shared::dut::{Dut, IpEndpoint};
use labrun_shared::request::ContainerImage;
use tracing::info;

use crate::config::Config;
use crate::error::{CommandError, CommandResult};

pub use docker::DockerRuntime;

pub const DUT_SERVICE: &str = "cros-dut";
pub const PROVISION_SERVICE: &str = "cros-provision";
pub const TEST_SERVICE: &str = "cros-test";
pub const TEST_FINDER_SERVICE: &str = "cros-test-finder";
pub const VM_LEASER_SERVICE: &str = "vm-leaser";

/// File every service writes its progress to, inside its log dir.
pub const SERVICE_LOG_FILE: &str = "log.txt";

const DEFAULT_SERVICE_PORT: u16 = 8080;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherKind {
    Gcs,
    Tko,
    Rdb,
}

impl PublisherKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublisherKind::Gcs => "gcs",
            PublisherKind::Tko => "tko",
            PublisherKind::Rdb => "rdb",
        }
    }

    pub fn service(&self) -> String {
        format!("cros-publish-{}", self.as_str())
    }
}

/// What to launch. Each variant picks an image and its launch flags.
#[derive(Debug, Clone, PartialEq)]
pub enum ContainerTemplate {
    DutService {
        device_id: String,
        dut: Dut,
        cache_server: Option<IpEndpoint>,
    },
    Provision {
        device_id: String,
        dut: Dut,
        dut_server: IpEndpoint,
    },
    TestExecution,
    TestFinder,
    Publish {
        kind: PublisherKind,
    },
    VmLeaser {
        project: String,
    },
    Generic {
        name: String,
        binary: String,
        args: Vec<String>,
        port: u16,
    },
}

impl ContainerTemplate {
    /// Service name used to look the image up in the test request.
    pub fn image_service(&self) -> String {
        match self {
            ContainerTemplate::DutService { .. } => DUT_SERVICE.into(),
            ContainerTemplate::Provision { .. } => PROVISION_SERVICE.into(),
            ContainerTemplate::TestExecution => TEST_SERVICE.into(),
            ContainerTemplate::TestFinder => TEST_FINDER_SERVICE.into(),
            ContainerTemplate::Publish { kind } => kind.service(),
            ContainerTemplate::VmLeaser { .. } => VM_LEASER_SERVICE.into(),
            ContainerTemplate::Generic { name, .. } => name.clone(),
        }
    }

    /// Unique per run; also the key under which the address is recorded.
    pub fn container_name(&self) -> String {
        match self {
            ContainerTemplate::DutService { device_id, .. } => dut_service_name(device_id),
            ContainerTemplate::Provision { device_id, .. } => provision_service_name(device_id),
            _ => self.image_service(),
        }
    }
}

pub fn dut_service_name(device_id: &str) -> String {
    format!("{DUT_SERVICE}-{device_id}")
}

pub fn provision_service_name(device_id: &str) -> String {
    format!("{PROVISION_SERVICE}-{device_id}")
}

/// Log file of a service container; known before the container starts.
pub fn service_log_file(config: &Config, container_name: &str) -> PathBuf {
    config.service_log_dir(container_name).join(SERVICE_LOG_FILE)
}

/// Everything the runtime needs to launch one container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub binary: String,
    pub args: Vec<String>,
    /// Flag the service takes its listen port from.
    pub port_flag: String,
    pub container_port: u16,
    /// Host directory mounted at `mount_dir`.
    pub log_dir: PathBuf,
    pub mount_dir: String,
}

pub fn build_spec(
    template: &ContainerTemplate,
    image: &ContainerImage,
    config: &Config,
) -> ContainerSpec {
    let name = template.container_name();
    let mount_dir = format!("/tmp/{name}");
    let log_args = vec!["-log_path".to_string(), mount_dir.clone()];

    let (binary, mut args, port) = match template {
        ContainerTemplate::DutService {
            dut, cache_server, ..
        } => {
            let mut args = vec![
                "server".to_string(),
                "-dut_address".to_string(),
                dut.endpoint().to_string(),
            ];
            if let Some(cache) = cache_server {
                args.push("-cache_address".into());
                args.push(cache.to_string());
            }
            (DUT_SERVICE.to_string(), args, DEFAULT_SERVICE_PORT)
        }
        ContainerTemplate::Provision {
            dut, dut_server, ..
        } => (
            PROVISION_SERVICE.to_string(),
            vec![
                "server".to_string(),
                "-dut_id".to_string(),
                dut.id.clone(),
                "-dut_server".to_string(),
                dut_server.to_string(),
            ],
            DEFAULT_SERVICE_PORT,
        ),
        ContainerTemplate::TestExecution => (
            TEST_SERVICE.to_string(),
            vec!["server".to_string()],
            DEFAULT_SERVICE_PORT,
        ),
        ContainerTemplate::TestFinder => (
            TEST_FINDER_SERVICE.to_string(),
            vec!["server".to_string()],
            DEFAULT_SERVICE_PORT,
        ),
        ContainerTemplate::Publish { kind } => (
            kind.service(),
            vec!["server".to_string()],
            DEFAULT_SERVICE_PORT,
        ),
        ContainerTemplate::VmLeaser { project } => (
            VM_LEASER_SERVICE.to_string(),
            vec![
                "server".to_string(),
                "-project".to_string(),
                project.clone(),
            ],
            DEFAULT_SERVICE_PORT,
        ),
        ContainerTemplate::Generic {
            binary, args, port, ..
        } => (binary.clone(), args.clone(), *port),
    };
    args.extend(log_args);

    ContainerSpec {
        log_dir: config.service_log_dir(&name),
        name,
        image: image.reference(),
        binary,
        args,
        port_flag: "-port".into(),
        container_port: port,
        mount_dir,
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Start the container and return where its service listens.
    async fn start(&self, spec: &ContainerSpec) -> Result<IpEndpoint>;
    async fn stop(&self, name: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct StartedContainer {
    pub name: String,
    pub address: IpEndpoint,
    pub log_dir: PathBuf,
}

impl StartedContainer {
    pub fn log_file(&self) -> PathBuf {
        self.log_dir.join(SERVICE_LOG_FILE)
    }
}

/// Start the container described by `template` and return its address.
pub async fn process_container(
    runtime: &dyn ContainerRuntime,
    template: &ContainerTemplate,
    image: &ContainerImage,
    config: &Config,
) -> CommandResult<StartedContainer> {
    let spec = build_spec(template, image, config);
    let address = runtime
        .start(&spec)
        .await
        .map_err(|e| CommandError::container(format!("start {}", spec.name), e))?;
    info!("{} listening on {}", spec.name, address);
    Ok(StartedContainer {
        name: spec.name,
        address,
        log_dir: spec.log_dir,
    })
}
