//! Commands that compute locally and need no executor.

use std::collections::HashMap;

use async_trait::async_trait;
use labrun_shared::dut::{Dut, DutModel, DutTopology, IpEndpoint};
use labrun_shared::request::{ContainerImage, DeviceRequest, ProvisionState, TestRequest, TestSuite};
use labrun_shared::services::{RunTestsResponse, Verdict};
use serde_json::json;
use tracing::{info, warn};

use crate::command::{Command, StepContext, unsupported_state_keeper};
use crate::error::{CommandError, CommandResult};
use crate::state::injectables::DUT_TOPOLOGY;
use crate::state::{LocalArgs, StateKeeper, set_if_some};

const LOCAL_SUITE: &str = "local";
const DEFAULT_SSH_PORT: u16 = 22;
pub const TEST_SUMMARY: &str = "test_summary";

/// Turns command-line arguments of a local run into a test request.
#[derive(Debug, Default)]
pub struct ParseLocalArgs {
    pub args: LocalArgs,
    pub test_request: Option<TestRequest>,
    pub dut_endpoint: Option<IpEndpoint>,
}

impl ParseLocalArgs {
    pub fn new() -> Self {
        Self::default()
    }

    fn invalid(&self, reason: impl Into<String>) -> CommandError {
        CommandError::InvalidInput {
            command: self.name(),
            reason: reason.into(),
        }
    }

    async fn load_images(
        &self,
    ) -> CommandResult<HashMap<String, HashMap<String, ContainerImage>>> {
        let Some(path) = &self.args.images_file else {
            return Ok(HashMap::new());
        };
        let raw = tokio::fs::read_to_string(path).await?;
        serde_json::from_str(&raw)
            .map_err(|e| self.invalid(format!("{}: {e}", path.display())))
    }
}

fn parse_dut_host(host: &str) -> Option<IpEndpoint> {
    if host.is_empty() {
        return None;
    }
    IpEndpoint::parse(host).or_else(|| Some(IpEndpoint::new(host, DEFAULT_SSH_PORT)))
}

#[async_trait]
impl Command for ParseLocalArgs {
    fn name(&self) -> &'static str {
        "parse-local-args"
    }

    fn extract_dependencies(&mut self, sk: &StateKeeper) -> CommandResult<()> {
        self.args = match sk {
            StateKeeper::PreLocalTest(s) => s.args.clone(),
            StateKeeper::LocalTest(s) => s.args.clone(),
            StateKeeper::HwTest(_) => return Err(unsupported_state_keeper(self.name(), sk)),
        };
        Ok(())
    }

    async fn execute(&mut self, ctx: &StepContext) -> CommandResult<()> {
        let args = &self.args;
        if args.board.is_empty() {
            return Err(self.invalid("board is required"));
        }
        if args.tests.is_empty() && args.tags.is_empty() {
            return Err(self.invalid("no tests or tags given"));
        }

        let container_images = self.load_images().await?;
        let args = &self.args;

        let primary = DeviceRequest {
            dut_model: DutModel::new(args.board.clone(), args.model.clone()),
            provision_state: args.image_path.as_ref().map(|path| ProvisionState {
                system_image_path: Some(path.clone()),
                ..Default::default()
            }),
            container_metadata_key: args.board.clone(),
        };
        let suite = TestSuite {
            name: LOCAL_SUITE.into(),
            test_case_ids: args.tests.clone(),
            tags: args.tags.clone(),
            tags_excluded: args.tags_excluded.clone(),
        };

        ctx.log.write_line(&format!(
            "board {} model {:?}: {} tests, {} tags",
            args.board,
            args.model,
            args.tests.len(),
            args.tags.len()
        ));

        self.dut_endpoint = parse_dut_host(&args.dut_host);
        self.test_request = Some(TestRequest {
            primary_dut: primary,
            test_suites: vec![suite],
            container_images,
            ..Default::default()
        });
        Ok(())
    }

    fn update_state_keeper(&self, sk: &mut StateKeeper) -> CommandResult<()> {
        match sk {
            StateKeeper::PreLocalTest(s) => {
                set_if_some(&mut s.base.test_request, self.test_request.clone());
            }
            StateKeeper::LocalTest(s) => {
                set_if_some(&mut s.base.test_request, self.test_request.clone());
                let has_topology = s.base.dut_topology.is_some();
                if let Some(endpoint) = self.dut_endpoint.as_ref().filter(|_| !has_topology) {
                    let dut = Dut::chromeos(
                        endpoint.address.clone(),
                        endpoint.clone(),
                        DutModel::new(self.args.board.clone(), self.args.model.clone()),
                    );
                    let topology = DutTopology::single(format!("local-{}", endpoint.address), dut);
                    s.base.injectables.set(DUT_TOPOLOGY, topology.clone());
                    s.base.dut_topology = Some(topology);
                }
            }
            StateKeeper::HwTest(_) => return Err(unsupported_state_keeper(self.name(), sk)),
        }
        Ok(())
    }
}

/// Tallies test verdicts. Failed tests are a product failure of the run.
#[derive(Debug, Default)]
pub struct SummarizeResults {
    response: Option<RunTestsResponse>,
    pub passed: usize,
    pub failed: Vec<String>,
    pub skipped: usize,
    pub summary: String,
}

impl SummarizeResults {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Command for SummarizeResults {
    fn name(&self) -> &'static str {
        "summarize-results"
    }

    fn extract_dependencies(&mut self, sk: &StateKeeper) -> CommandResult<()> {
        self.response = sk.base().test_response.clone();
        if self.response.is_none() {
            warn!("{}: no test response, summarizing an empty run", self.name());
        }
        Ok(())
    }

    async fn execute(&mut self, ctx: &StepContext) -> CommandResult<()> {
        // retries run execute again on the same command
        self.passed = 0;
        self.failed.clear();
        self.skipped = 0;

        let results = self
            .response
            .as_ref()
            .map(|r| r.test_case_results.as_slice())
            .unwrap_or_default();

        for result in results {
            match &result.verdict {
                Verdict::Pass => self.passed += 1,
                Verdict::Skip { .. } | Verdict::NotRun { .. } => self.skipped += 1,
                verdict if verdict.is_failure() => {
                    ctx.log
                        .write_line(&format!("FAIL {}: {:?}", result.test_case_id, verdict));
                    self.failed.push(result.test_case_id.clone());
                }
                _ => {}
            }
        }

        self.summary = format!(
            "{} passed, {} failed, {} skipped",
            self.passed,
            self.failed.len(),
            self.skipped
        );
        info!("{}", self.summary);
        Ok(())
    }

    fn update_state_keeper(&self, sk: &mut StateKeeper) -> CommandResult<()> {
        if self.summary.is_empty() {
            return Ok(());
        }
        sk.base_mut().injectables.set(
            TEST_SUMMARY,
            json!({
                "passed": self.passed,
                "failed": self.failed,
                "skipped": self.skipped,
            }),
        );
        Ok(())
    }

    fn business_failure(&self) -> Option<String> {
        if self.failed.is_empty() {
            None
        } else {
            Some(self.summary.clone())
        }
    }
}
