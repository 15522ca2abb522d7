use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use labrun_shared::dut::{DutTopology, IpEndpoint};
use labrun_shared::operation::{Operation, Reply};
use labrun_shared::services::{
    FindTestsRequest, FindTestsResponse, GenericRequest, GenericResponse, InstallRequest,
    InstallResponse, PublishRequest, PublishResponse, ReleaseVmRequest, ReleaseVmResponse,
    RunTestsRequest, RunTestsResponse,
};
use serde::{Serialize, de::DeserializeOwned};
use tracing::debug;

use super::{
    GenericClient, InventoryClient, OperationsClient, ProvisionClient, PublishClient,
    ServiceConnector, TestClient, TestFinderClient,
};

/// JSON-over-HTTP client for one service container:
/// `POST http://<host:port>/<service>/<Method>`.
#[derive(Clone)]
pub struct HttpServiceClient {
    http: reqwest::Client,
    base_url: String,
    service: String,
}

impl HttpServiceClient {
    pub fn new(http: reqwest::Client, endpoint: &IpEndpoint, service: &str) -> Self {
        Self {
            http,
            base_url: format!("http://{endpoint}"),
            service: service.to_string(),
        }
    }

    async fn call<Req, Resp>(&self, method: &str, req: &Req) -> Result<Resp>
    where
        Req: Serialize + Sync + ?Sized,
        Resp: DeserializeOwned,
    {
        let url = format!("{}/{}/{}", self.base_url, self.service, method);
        debug!("POST {}", url);
        let resp = self
            .http
            .post(&url)
            .json(req)
            .send()
            .await
            .with_context(|| format!("POST {url}"))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("POST {} returned {}: {}", url, status, body.trim()));
        }

        resp.json::<Resp>()
            .await
            .with_context(|| format!("decode response of {url}"))
    }
}

#[derive(Serialize)]
struct GetOperationRequest<'a> {
    name: &'a str,
}

#[async_trait]
impl OperationsClient for HttpServiceClient {
    async fn get_operation(&self, name: &str) -> Result<Operation> {
        self.call("GetOperation", &GetOperationRequest { name }).await
    }
}

#[async_trait]
impl ProvisionClient for HttpServiceClient {
    async fn install(&self, req: InstallRequest) -> Result<Reply<InstallResponse>> {
        self.call("Install", &req).await
    }

    async fn release_vm(&self, req: ReleaseVmRequest) -> Result<Reply<ReleaseVmResponse>> {
        self.call("ReleaseVm", &req).await
    }
}

#[async_trait]
impl TestClient for HttpServiceClient {
    async fn run_tests(&self, req: RunTestsRequest) -> Result<Reply<RunTestsResponse>> {
        self.call("RunTests", &req).await
    }
}

#[async_trait]
impl TestFinderClient for HttpServiceClient {
    async fn find_tests(&self, req: FindTestsRequest) -> Result<Reply<FindTestsResponse>> {
        self.call("FindTests", &req).await
    }
}

#[async_trait]
impl PublishClient for HttpServiceClient {
    async fn publish(&self, req: PublishRequest) -> Result<Reply<PublishResponse>> {
        self.call("Publish", &req).await
    }
}

#[async_trait]
impl GenericClient for HttpServiceClient {
    async fn execute(&self, method: &str, req: GenericRequest) -> Result<Reply<GenericResponse>> {
        self.call(method, &req).await
    }
}

/// Connects to services over [`HttpServiceClient`].
pub struct HttpConnector {
    http: reqwest::Client,
}

impl HttpConnector {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("build http client")?;
        Ok(Self { http })
    }
}

impl ServiceConnector for HttpConnector {
    fn provision(&self, endpoint: &IpEndpoint) -> Result<Arc<dyn ProvisionClient>> {
        Ok(Arc::new(HttpServiceClient::new(
            self.http.clone(),
            endpoint,
            "provision",
        )))
    }

    fn test(&self, endpoint: &IpEndpoint) -> Result<Arc<dyn TestClient>> {
        Ok(Arc::new(HttpServiceClient::new(
            self.http.clone(),
            endpoint,
            "test",
        )))
    }

    fn test_finder(&self, endpoint: &IpEndpoint) -> Result<Arc<dyn TestFinderClient>> {
        Ok(Arc::new(HttpServiceClient::new(
            self.http.clone(),
            endpoint,
            "testfinder",
        )))
    }

    fn publish(&self, endpoint: &IpEndpoint) -> Result<Arc<dyn PublishClient>> {
        Ok(Arc::new(HttpServiceClient::new(
            self.http.clone(),
            endpoint,
            "publish",
        )))
    }

    fn generic(&self, endpoint: &IpEndpoint, service: &str) -> Result<Arc<dyn GenericClient>> {
        Ok(Arc::new(HttpServiceClient::new(
            self.http.clone(),
            endpoint,
            service,
        )))
    }
}

/// Inventory lookups: `GET <base_url>/topology/<hostname>`.
pub struct HttpInventoryClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpInventoryClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl InventoryClient for HttpInventoryClient {
    async fn get_dut_topology(&self, hostname: &str) -> Result<DutTopology> {
        let url = format!("{}/topology/{}", self.base_url, hostname);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("GET {} returned {}", url, status));
        }
        resp.json::<DutTopology>()
            .await
            .with_context(|| format!("decode topology of {hostname}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves exactly one HTTP request with a canned JSON body and returns
    /// the raw request text.
    async fn one_shot_server(body: &'static str) -> (IpEndpoint, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let mut request = Vec::new();
            loop {
                let n = sock.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let content_length = text[..head_end]
                        .lines()
                        .find_map(|l| {
                            l.to_ascii_lowercase()
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if request.len() >= head_end + 4 + content_length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            sock.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&request).to_string()
        });
        (IpEndpoint::new("127.0.0.1", port), handle)
    }

    #[tokio::test]
    async fn test_install_posts_to_service_method() {
        let (ep, server) =
            one_shot_server(r#"{"reply":"operation","payload":{"name":"operations/7"}}"#).await;
        let client = HttpServiceClient::new(reqwest::Client::new(), &ep, "provision");

        let reply = client.install(InstallRequest::default()).await.unwrap();
        match reply {
            Reply::Operation(op) => {
                assert_eq!(op.name, "operations/7");
                assert!(!op.done);
            }
            Reply::Immediate(_) => panic!("expected operation"),
        }

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /provision/Install HTTP/1.1"));
    }

    #[tokio::test]
    async fn test_connector_routes_to_service_prefix() {
        let (ep, server) = one_shot_server(
            r#"{"reply":"immediate","payload":{"test_case_results":[]}}"#,
        )
        .await;
        let connector = HttpConnector::new(Duration::from_secs(5)).unwrap();
        let client = connector.test(&ep).unwrap();

        let reply = client.run_tests(RunTestsRequest::default()).await.unwrap();
        assert!(matches!(reply, Reply::Immediate(r) if r.test_case_results.is_empty()));
        let request = server.await.unwrap();
        assert!(request.starts_with("POST /test/RunTests HTTP/1.1"));
    }

    #[tokio::test]
    async fn test_inventory_fetches_topology_by_hostname() {
        let (ep, server) = one_shot_server(r#"{"id":"chromeos1-row1-rack1-host1","duts":[]}"#).await;
        let inventory = HttpInventoryClient::new(reqwest::Client::new(), format!("http://{ep}/"));

        let topology = inventory
            .get_dut_topology("chromeos1-row1-rack1-host1")
            .await
            .unwrap();
        assert_eq!(topology.id, "chromeos1-row1-rack1-host1");
        assert!(topology.is_empty());
        let request = server.await.unwrap();
        assert!(request.starts_with("GET /topology/chromeos1-row1-rack1-host1 HTTP/1.1"));
    }

    #[tokio::test]
    async fn test_non_success_status_is_an_error() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = sock.read(&mut buf).await;
            let _ = sock
                .write_all(b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 4\r\nConnection: close\r\n\r\nbusy")
                .await;
        });

        let client = HttpServiceClient::new(
            reqwest::Client::new(),
            &IpEndpoint::new("127.0.0.1", port),
            "test",
        );
        let err = client.get_operation("operations/1").await.unwrap_err();
        assert!(err.to_string().contains("503"));
    }
}
