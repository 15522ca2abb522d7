//! Call contracts of every remote collaborator.
//!
//! Service clients return either the typed response or an operation handle
//! ([`Reply`]); the LRO helper in [`crate::lro`] takes care of the rest.

pub mod device_state;
pub mod http;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use labrun_shared::dut::{DeviceState, DutTopology, IpEndpoint};
use labrun_shared::operation::{Operation, Reply};
use labrun_shared::services::{
    FindTestsRequest, FindTestsResponse, GceImage, GenericRequest, GenericResponse,
    InstallRequest, InstallResponse, PublishRequest, PublishResponse, ReleaseVmRequest,
    ReleaseVmResponse, RunTestsRequest, RunTestsResponse,
};

#[async_trait]
pub trait OperationsClient: Send + Sync {
    async fn get_operation(&self, name: &str) -> Result<Operation>;
}

#[async_trait]
pub trait ProvisionClient: OperationsClient {
    async fn install(&self, req: InstallRequest) -> Result<Reply<InstallResponse>>;
    async fn release_vm(&self, req: ReleaseVmRequest) -> Result<Reply<ReleaseVmResponse>>;
}

#[async_trait]
pub trait TestClient: OperationsClient {
    async fn run_tests(&self, req: RunTestsRequest) -> Result<Reply<RunTestsResponse>>;
}

#[async_trait]
pub trait TestFinderClient: OperationsClient {
    async fn find_tests(&self, req: FindTestsRequest) -> Result<Reply<FindTestsResponse>>;
}

#[async_trait]
pub trait PublishClient: OperationsClient {
    async fn publish(&self, req: PublishRequest) -> Result<Reply<PublishResponse>>;
}

#[async_trait]
pub trait GenericClient: OperationsClient {
    async fn execute(&self, method: &str, req: GenericRequest) -> Result<Reply<GenericResponse>>;
}

/// Builds service clients for a started container.
pub trait ServiceConnector: Send + Sync {
    fn provision(&self, endpoint: &IpEndpoint) -> Result<Arc<dyn ProvisionClient>>;
    fn test(&self, endpoint: &IpEndpoint) -> Result<Arc<dyn TestClient>>;
    fn test_finder(&self, endpoint: &IpEndpoint) -> Result<Arc<dyn TestFinderClient>>;
    fn publish(&self, endpoint: &IpEndpoint) -> Result<Arc<dyn PublishClient>>;
    fn generic(&self, endpoint: &IpEndpoint, service: &str) -> Result<Arc<dyn GenericClient>>;
}

#[async_trait]
pub trait InventoryClient: Send + Sync {
    async fn get_dut_topology(&self, hostname: &str) -> Result<DutTopology>;
}

#[async_trait]
pub trait DeviceStateStore: Send + Sync {
    async fn get_state(&self, hostname: &str) -> Result<DeviceState>;
    async fn set_state(&self, hostname: &str, state: DeviceState) -> Result<()>;
}

#[async_trait]
pub trait CloudImageApi: Send + Sync {
    async fn get_image(&self, project: &str, name: &str) -> Result<Option<GceImage>>;
    /// Starts building the image from a build; returns before it is ready.
    async fn create_image(&self, project: &str, name: &str, source_build: &str)
    -> Result<GceImage>;
    async fn delete_image(&self, project: &str, name: &str) -> Result<()>;
}
