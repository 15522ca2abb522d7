//! In-memory fakes and fixtures shared by unit and integration tests.
//! Integration tests reach them through the `testing` feature.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use labrun_shared::any::{AnyMessage, TypeTagged};
use labrun_shared::dut::{DeviceState, Dut, DutModel, DutTopology, IpEndpoint};
use labrun_shared::operation::{Operation, Reply};
use labrun_shared::request::{ContainerImage, DeviceRequest, TestRequest, TestSuite};
use labrun_shared::services::{
    FindTestsRequest, FindTestsResponse, GceImage, GenericRequest, GenericResponse, ImageStatus,
    InstallRequest, InstallResponse, InstallStatus, LeaseVmRequest, LeaseVmResponse,
    PublishRequest, PublishResponse, PublishStatus, ReleaseVmRequest, ReleaseVmResponse,
    RunTestsRequest, RunTestsResponse, TestCaseResult, Verdict,
};
use serde::Serialize;

use crate::clients::{
    CloudImageApi, DeviceStateStore, GenericClient, InventoryClient, OperationsClient,
    ProvisionClient, PublishClient, ServiceConnector, TestClient, TestFinderClient,
};
use crate::command::StepContext;
use crate::container::{
    ContainerRuntime, ContainerSpec, DUT_SERVICE, PROVISION_SERVICE, PublisherKind,
    TEST_FINDER_SERVICE, TEST_SERVICE, VM_LEASER_SERVICE,
};
use crate::state::{HwTestState, StateKeeper};
use crate::ui::{StepLog, StepSink, StepStatus};

// ---------------------------------------------------------------------------
// Step logs
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingLog {
    lines: Mutex<Vec<String>>,
    summary: Mutex<Option<String>>,
    status: Mutex<Option<StepStatus>>,
}

impl RecordingLog {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    pub fn summary(&self) -> Option<String> {
        self.summary.lock().unwrap().clone()
    }

    pub fn status(&self) -> Option<StepStatus> {
        *self.status.lock().unwrap()
    }
}

impl StepLog for RecordingLog {
    fn write_line(&self, line: &str) {
        self.lines.lock().unwrap().push(line.to_string());
    }

    fn set_summary(&self, summary: &str) {
        *self.summary.lock().unwrap() = Some(summary.to_string());
    }

    fn end(&self, status: StepStatus) {
        *self.status.lock().unwrap() = Some(status);
    }
}

#[derive(Default)]
pub struct RecordingSink {
    steps: Mutex<Vec<(String, Arc<RecordingLog>)>>,
}

impl RecordingSink {
    pub fn names(&self) -> Vec<String> {
        self.steps.lock().unwrap().iter().map(|(n, _)| n.clone()).collect()
    }

    /// Log of the most recent step called `name`.
    pub fn step(&self, name: &str) -> Arc<RecordingLog> {
        self.steps
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, log)| log.clone())
            .unwrap()
    }
}

impl StepSink for RecordingSink {
    fn start_step(&self, name: &str) -> Arc<dyn StepLog> {
        let log = Arc::new(RecordingLog::default());
        self.steps
            .lock()
            .unwrap()
            .push((name.to_string(), log.clone()));
        log
    }
}

pub fn step_context() -> StepContext {
    StepContext::new(Arc::new(RecordingLog::default()))
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn dut(id: &str, board: &str) -> Dut {
    Dut::chromeos(id, IpEndpoint::new(id, 22), DutModel::new(board, ""))
}

pub fn hw_keeper() -> StateKeeper {
    StateKeeper::HwTest(HwTestState {
        hostname: "chromeos1-row1-rack1-host1".into(),
        ..Default::default()
    })
}

fn images_for_board() -> HashMap<String, ContainerImage> {
    let mut services = vec![
        DUT_SERVICE.to_string(),
        PROVISION_SERVICE.to_string(),
        TEST_SERVICE.to_string(),
        TEST_FINDER_SERVICE.to_string(),
        VM_LEASER_SERVICE.to_string(),
    ];
    services.extend([PublisherKind::Gcs, PublisherKind::Tko, PublisherKind::Rdb].map(|k| k.service()));
    services
        .into_iter()
        .map(|service| {
            let image = ContainerImage {
                repository: "us-docker.pkg.dev/cros-registry/test-services".into(),
                name: service.clone(),
                tag: "R120".into(),
                digest: None,
            };
            (service, image)
        })
        .collect()
}

fn device_request(board: &str) -> DeviceRequest {
    DeviceRequest {
        dut_model: DutModel::new(board, ""),
        provision_state: None,
        container_metadata_key: board.into(),
    }
}

/// Request for one primary board and any companions, with images for every
/// service and a single explicit smoke suite.
pub fn test_request(primary_board: &str, companion_boards: &[&str]) -> TestRequest {
    let mut container_images = HashMap::new();
    for board in std::iter::once(&primary_board).chain(companion_boards) {
        container_images.insert(board.to_string(), images_for_board());
    }
    TestRequest {
        primary_dut: device_request(primary_board),
        companion_duts: companion_boards.iter().map(|b| device_request(b)).collect(),
        test_suites: vec![TestSuite {
            name: "smoke".into(),
            test_case_ids: vec!["tast.example.Pass".into()],
            tags: vec![],
            tags_excluded: vec![],
        }],
        container_images,
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Hands out queued operations to `get_operation`, in order.
pub struct FakeOperations {
    queue: Mutex<VecDeque<Operation>>,
    polls: AtomicUsize,
}

impl FakeOperations {
    pub fn new(ops: Vec<Operation>) -> Self {
        Self {
            queue: Mutex::new(ops.into()),
            polls: AtomicUsize::new(0),
        }
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OperationsClient for FakeOperations {
    async fn get_operation(&self, name: &str) -> Result<Operation> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        self.queue
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow!("no such operation {name}"))
    }
}

// ---------------------------------------------------------------------------
// Containers
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeRuntime {
    fail: bool,
    next_port: AtomicUsize,
    started: Mutex<Vec<String>>,
    stopped: Mutex<Vec<String>>,
}

impl FakeRuntime {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.stopped.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn start(&self, spec: &ContainerSpec) -> Result<IpEndpoint> {
        if self.fail {
            return Err(anyhow!("docker: image {} not found", spec.image));
        }
        let port = 41000 + self.next_port.fetch_add(1, Ordering::SeqCst) as u16;
        self.started.lock().unwrap().push(spec.name.clone());
        Ok(IpEndpoint::new("127.0.0.1", port))
    }

    async fn stop(&self, name: &str) -> Result<()> {
        if self.fail {
            return Err(anyhow!("docker: no such container {name}"));
        }
        self.stopped.lock().unwrap().push(name.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Inventory and device state
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeInventory {
    topologies: HashMap<String, DutTopology>,
}

impl From<HashMap<String, DutTopology>> for FakeInventory {
    fn from(topologies: HashMap<String, DutTopology>) -> Self {
        Self { topologies }
    }
}

impl FakeInventory {
    pub fn with(hostname: &str, topology: DutTopology) -> Self {
        let mut topologies = HashMap::new();
        topologies.insert(hostname.to_string(), topology);
        Self { topologies }
    }
}

#[async_trait]
impl InventoryClient for FakeInventory {
    async fn get_dut_topology(&self, hostname: &str) -> Result<DutTopology> {
        self.topologies
            .get(hostname)
            .cloned()
            .ok_or_else(|| anyhow!("host {hostname} not in inventory"))
    }
}

#[derive(Default)]
pub struct FakeStateStore {
    fail: bool,
    states: Mutex<HashMap<String, DeviceState>>,
}

impl FakeStateStore {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn state_of(&self, hostname: &str) -> Option<DeviceState> {
        self.states.lock().unwrap().get(hostname).copied()
    }
}

#[async_trait]
impl DeviceStateStore for FakeStateStore {
    async fn get_state(&self, hostname: &str) -> Result<DeviceState> {
        if self.fail {
            return Err(anyhow!("state store unavailable"));
        }
        Ok(self.state_of(hostname).unwrap_or_default())
    }

    async fn set_state(&self, hostname: &str, state: DeviceState) -> Result<()> {
        if self.fail {
            return Err(anyhow!("state store unavailable"));
        }
        self.states.lock().unwrap().insert(hostname.to_string(), state);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Services
// ---------------------------------------------------------------------------

/// Every service contract at once. Replies are completed operations so the
/// LRO decode path is exercised, or pending ones that complete on the first
/// poll when built with [`FakeServices::polled`]. Unless a response is
/// queued, installs succeed and leases are granted. Tests whose id contains
/// `Fail` fail; publishes succeed.
#[derive(Default)]
pub struct FakeServices {
    unreachable: bool,
    polled: bool,
    pending: Mutex<VecDeque<Operation>>,
    operations: AtomicUsize,
    connections: Mutex<Vec<String>>,
    install_queue: Mutex<VecDeque<InstallResponse>>,
    publish_queue: Mutex<VecDeque<PublishResponse>>,
    installs: Mutex<Vec<InstallRequest>>,
    releases: Mutex<Vec<ReleaseVmRequest>>,
    publishes: Mutex<Vec<PublishRequest>>,
    generic_calls: Mutex<Vec<String>>,
    leases: AtomicUsize,
}

impl FakeServices {
    /// Accepts connections but fails every call.
    pub fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Default::default()
        }
    }

    /// Replies with pending operations that `get_operation` completes.
    pub fn polled() -> Self {
        Self {
            polled: true,
            ..Default::default()
        }
    }

    pub fn connector(self: &Arc<Self>) -> Arc<dyn ServiceConnector> {
        Arc::new(FakeConnector(self.clone()))
    }

    pub fn queue_install(&self, response: InstallResponse) {
        self.install_queue.lock().unwrap().push_back(response);
    }

    pub fn queue_publish(&self, response: PublishResponse) {
        self.publish_queue.lock().unwrap().push_back(response);
    }

    pub fn connections(&self) -> Vec<String> {
        self.connections.lock().unwrap().clone()
    }

    pub fn installs(&self) -> Vec<InstallRequest> {
        self.installs.lock().unwrap().clone()
    }

    pub fn releases(&self) -> Vec<ReleaseVmRequest> {
        self.releases.lock().unwrap().clone()
    }

    pub fn publishes(&self) -> Vec<PublishRequest> {
        self.publishes.lock().unwrap().clone()
    }

    pub fn generic_calls(&self) -> Vec<String> {
        self.generic_calls.lock().unwrap().clone()
    }

    fn reply<T: TypeTagged + Serialize>(&self, name: &str, response: &T) -> Result<Reply<T>> {
        if self.unreachable {
            return Err(anyhow!("connection refused"));
        }
        let packed = AnyMessage::pack(response)?;
        if !self.polled {
            return Ok(Reply::Operation(Operation::completed(
                format!("operations/{name}"),
                packed,
            )));
        }
        let id = self.operations.fetch_add(1, Ordering::SeqCst);
        let op_name = format!("operations/{name}-{id}");
        self.pending
            .lock()
            .unwrap()
            .push_back(Operation::completed(op_name.clone(), packed));
        Ok(Reply::Operation(Operation::pending(op_name)))
    }

    fn default_install(&self, req: &InstallRequest) -> InstallResponse {
        let lease = req
            .metadata
            .as_ref()
            .and_then(|m| m.unpack::<LeaseVmRequest>().ok());
        let metadata = lease.map(|lease| {
            let n = self.leases.fetch_add(1, Ordering::SeqCst) + 1;
            AnyMessage::pack(&LeaseVmResponse {
                lease_id: format!("{}-vm-{n}", lease.board),
                vm_address: IpEndpoint::new("34.1.2.3", 22),
                zone: lease.zone,
            })
            .unwrap()
        });
        InstallResponse {
            status: InstallStatus::Success,
            metadata,
        }
    }
}

#[async_trait]
impl OperationsClient for FakeServices {
    async fn get_operation(&self, name: &str) -> Result<Operation> {
        let mut pending = self.pending.lock().unwrap();
        let pos = pending
            .iter()
            .position(|op| op.name == name)
            .ok_or_else(|| anyhow!("operation {name} is already done"))?;
        Ok(pending.remove(pos).unwrap())
    }
}

#[async_trait]
impl ProvisionClient for FakeServices {
    async fn install(&self, req: InstallRequest) -> Result<Reply<InstallResponse>> {
        let queued = self.install_queue.lock().unwrap().pop_front();
        let response = queued.unwrap_or_else(|| self.default_install(&req));
        self.installs.lock().unwrap().push(req);
        self.reply("install", &response)
    }

    async fn release_vm(&self, req: ReleaseVmRequest) -> Result<Reply<ReleaseVmResponse>> {
        let response = ReleaseVmResponse {
            lease_id: req.lease_id.clone(),
        };
        self.releases.lock().unwrap().push(req);
        self.reply("release", &response)
    }
}

#[async_trait]
impl TestClient for FakeServices {
    async fn run_tests(&self, req: RunTestsRequest) -> Result<Reply<RunTestsResponse>> {
        let test_case_results = req
            .test_suites
            .iter()
            .flat_map(|s| s.test_case_ids.iter())
            .map(|id| TestCaseResult {
                test_case_id: id.clone(),
                verdict: if id.contains("Fail") {
                    Verdict::Fail {
                        reason: "expected failure".into(),
                    }
                } else {
                    Verdict::Pass
                },
                result_dir_path: None,
            })
            .collect();
        self.reply("run", &RunTestsResponse { test_case_results })
    }
}

#[async_trait]
impl TestFinderClient for FakeServices {
    async fn find_tests(&self, req: FindTestsRequest) -> Result<Reply<FindTestsResponse>> {
        let test_suites = req
            .test_suites
            .into_iter()
            .map(|mut suite| {
                if suite.needs_expansion() {
                    suite.test_case_ids = suite.tags.iter().map(|t| format!("tast.{t}.Found")).collect();
                }
                suite
            })
            .collect();
        self.reply("find", &FindTestsResponse { test_suites })
    }
}

#[async_trait]
impl PublishClient for FakeServices {
    async fn publish(&self, req: PublishRequest) -> Result<Reply<PublishResponse>> {
        let response = self
            .publish_queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(PublishResponse {
                status: PublishStatus::Success,
                message: String::new(),
            });
        self.publishes.lock().unwrap().push(req);
        self.reply("publish", &response)
    }
}

#[async_trait]
impl GenericClient for FakeServices {
    async fn execute(&self, method: &str, req: GenericRequest) -> Result<Reply<GenericResponse>> {
        self.generic_calls.lock().unwrap().push(method.to_string());
        self.reply("generic", &GenericResponse {
            payload: req.payload,
        })
    }
}

struct FakeConnector(Arc<FakeServices>);

impl FakeConnector {
    fn record(&self, what: String) {
        self.0.connections.lock().unwrap().push(what);
    }
}

impl ServiceConnector for FakeConnector {
    fn provision(&self, endpoint: &IpEndpoint) -> Result<Arc<dyn ProvisionClient>> {
        self.record(format!("provision {endpoint}"));
        Ok(self.0.clone())
    }

    fn test(&self, endpoint: &IpEndpoint) -> Result<Arc<dyn TestClient>> {
        self.record(format!("test {endpoint}"));
        Ok(self.0.clone())
    }

    fn test_finder(&self, endpoint: &IpEndpoint) -> Result<Arc<dyn TestFinderClient>> {
        self.record(format!("test-finder {endpoint}"));
        Ok(self.0.clone())
    }

    fn publish(&self, endpoint: &IpEndpoint) -> Result<Arc<dyn PublishClient>> {
        self.record(format!("publish {endpoint}"));
        Ok(self.0.clone())
    }

    fn generic(&self, endpoint: &IpEndpoint, service: &str) -> Result<Arc<dyn GenericClient>> {
        self.record(format!("generic {service} {endpoint}"));
        Ok(self.0.clone())
    }
}

// ---------------------------------------------------------------------------
// Cloud images
// ---------------------------------------------------------------------------

/// Images keyed by `(project, name)`. Created images turn ready after
/// `ready_after` lookups.
#[derive(Default)]
pub struct FakeCloudApi {
    ready_after: usize,
    images: Mutex<HashMap<(String, String), (GceImage, usize)>>,
    created: Mutex<Vec<String>>,
    deleted: Mutex<Vec<String>>,
}

impl FakeCloudApi {
    pub fn ready_after(lookups: usize) -> Self {
        Self {
            ready_after: lookups,
            ..Default::default()
        }
    }

    pub fn insert(&self, project: &str, name: &str, status: ImageStatus) {
        let image = GceImage {
            name: name.into(),
            project: project.into(),
            status,
            source_build: String::new(),
        };
        self.images
            .lock()
            .unwrap()
            .insert((project.into(), name.into()), (image, 0));
    }

    pub fn created(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl CloudImageApi for FakeCloudApi {
    async fn get_image(&self, project: &str, name: &str) -> Result<Option<GceImage>> {
        let mut images = self.images.lock().unwrap();
        let Some((image, lookups)) = images.get_mut(&(project.to_string(), name.to_string())) else {
            return Ok(None);
        };
        *lookups += 1;
        if image.status == ImageStatus::Pending && self.ready_after > 0 && *lookups >= self.ready_after {
            image.status = ImageStatus::Ready;
        }
        Ok(Some(image.clone()))
    }

    async fn create_image(&self, project: &str, name: &str, source_build: &str) -> Result<GceImage> {
        let image = GceImage {
            name: name.into(),
            project: project.into(),
            status: ImageStatus::Pending,
            source_build: source_build.into(),
        };
        self.images
            .lock()
            .unwrap()
            .insert((project.into(), name.into()), (image.clone(), 0));
        self.created.lock().unwrap().push(name.to_string());
        Ok(image)
    }

    async fn delete_image(&self, project: &str, name: &str) -> Result<()> {
        self.images
            .lock()
            .unwrap()
            .remove(&(project.to_string(), name.to_string()));
        self.deleted.lock().unwrap().push(name.to_string());
        Ok(())
    }
}
