use std::sync::Arc;

use async_trait::async_trait;
use labrun_shared::services::FindTestsRequest;

use crate::clients::ServiceConnector;
use crate::command::{Command, Executor, StepContext, unsupported_command};
use crate::commands::{AnyCommand, FindTests, RunTests};
use crate::container::{TEST_FINDER_SERVICE, TEST_SERVICE};
use crate::error::{CommandError, CommandResult};
use crate::executors::{ServiceCallConfig, connect_error, resolved_address};
use crate::lro;

/// Test discovery and execution.
pub struct TestExecutor {
    connector: Arc<dyn ServiceConnector>,
    calls: ServiceCallConfig,
}

impl TestExecutor {
    pub fn new(connector: Arc<dyn ServiceConnector>, calls: ServiceCallConfig) -> Self {
        Self { connector, calls }
    }

    async fn find(&self, ctx: &StepContext, cmd: &mut FindTests) -> CommandResult<()> {
        if !cmd.needs_expansion() {
            ctx.log.write_line("every suite names its tests, nothing to expand");
            return Ok(());
        }
        let name = cmd.name();
        let address = resolved_address(name, &cmd.service_address)?;
        let client = self
            .connector
            .test_finder(&address)
            .map_err(|e| connect_error(name, e))?;

        let request = FindTestsRequest {
            test_suites: cmd.suites.clone(),
        };
        let call = self.calls.call("find tests", TEST_FINDER_SERVICE);
        let response = lro::invoke(ctx, client.as_ref(), call, || client.find_tests(request)).await?;
        let cases: usize = response.test_suites.iter().map(|s| s.test_case_ids.len()).sum();
        ctx.log.write_line(&format!(
            "found {} test(s) in {} suite(s)",
            cases,
            response.test_suites.len()
        ));
        cmd.found = Some(response.test_suites);
        Ok(())
    }

    async fn run(&self, ctx: &StepContext, cmd: &mut RunTests) -> CommandResult<()> {
        let name = cmd.name();
        let address = resolved_address(name, &cmd.service_address)?;
        let request = cmd
            .request
            .clone()
            .ok_or_else(|| CommandError::missing(name, "run_tests_request"))?;
        let client = self
            .connector
            .test(&address)
            .map_err(|e| connect_error(name, e))?;

        let call = self.calls.call("run tests", TEST_SERVICE);
        let response = lro::invoke(ctx, client.as_ref(), call, || client.run_tests(request)).await?;
        let failed = response
            .test_case_results
            .iter()
            .filter(|r| r.verdict.is_failure())
            .count();
        ctx.log.write_line(&format!(
            "{} test(s) ran, {} failed",
            response.test_case_results.len(),
            failed
        ));
        cmd.response = Some(response);
        Ok(())
    }
}

#[async_trait]
impl Executor for TestExecutor {
    fn name(&self) -> &'static str {
        "test"
    }

    async fn execute_command(&mut self, ctx: &StepContext, cmd: &mut AnyCommand) -> CommandResult<()> {
        match cmd {
            AnyCommand::FindTests(c) => self.find(ctx, c).await,
            AnyCommand::RunTests(c) => self.run(ctx, c).await,
            other => Err(unsupported_command(self.name(), other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::ProvisionInstall;
    use crate::config::Config;
    use crate::testing::{FakeServices, step_context};
    use labrun_shared::dut::IpEndpoint;
    use labrun_shared::request::TestSuite;
    use labrun_shared::services::RunTestsRequest;

    fn executor(services: &Arc<FakeServices>) -> TestExecutor {
        TestExecutor::new(services.connector(), ServiceCallConfig::new(&Config::default()))
    }

    fn suite(tags: &[&str], tests: &[&str]) -> TestSuite {
        TestSuite {
            name: "suite".into(),
            test_case_ids: tests.iter().map(|t| t.to_string()).collect(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            tags_excluded: vec![],
        }
    }

    #[tokio::test]
    async fn test_find_skips_rpc_when_nothing_to_expand() {
        let services = Arc::new(FakeServices::default());
        let mut exec = executor(&services);
        let mut find = FindTests::new();
        find.suites = vec![suite(&[], &["tast.example.Pass"])];
        let mut cmd = AnyCommand::from(find);
        exec.execute_command(&step_context(), &mut cmd).await.unwrap();

        let AnyCommand::FindTests(c) = cmd else { unreachable!() };
        assert!(c.found.is_none());
        assert!(services.connections().is_empty());
    }

    #[tokio::test]
    async fn test_find_expands_tagged_suites() {
        let services = Arc::new(FakeServices::default());
        let mut exec = executor(&services);
        let mut find = FindTests::new();
        find.suites = vec![suite(&["group:mainline"], &[])];
        find.service_address = Some(IpEndpoint::new("127.0.0.1", 43000));
        let mut cmd = AnyCommand::from(find);
        exec.execute_command(&step_context(), &mut cmd).await.unwrap();

        let AnyCommand::FindTests(c) = cmd else { unreachable!() };
        let found = c.found.unwrap();
        assert_eq!(found[0].test_case_ids, ["tast.group:mainline.Found"]);
        assert_eq!(services.connections(), ["test-finder 127.0.0.1:43000"]);
    }

    #[tokio::test]
    async fn test_run_returns_results() {
        let services = Arc::new(FakeServices::default());
        let mut exec = executor(&services);
        let mut run = RunTests::new();
        run.request = Some(RunTestsRequest {
            test_suites: vec![suite(&[], &["tast.example.Pass", "tast.example.Fail"])],
            ..Default::default()
        });
        run.service_address = Some(IpEndpoint::new("127.0.0.1", 44000));
        let mut cmd = AnyCommand::from(run);
        exec.execute_command(&step_context(), &mut cmd).await.unwrap();

        let AnyCommand::RunTests(c) = cmd else { unreachable!() };
        let results = c.response.unwrap().test_case_results;
        assert_eq!(results.len(), 2);
        assert!(results[1].verdict.is_failure());
    }

    #[tokio::test]
    async fn test_run_without_address_is_missing_dependency() {
        let mut exec = executor(&Arc::new(FakeServices::default()));
        let mut cmd = AnyCommand::from(RunTests::new());
        let err = exec.execute_command(&step_context(), &mut cmd).await.unwrap_err();
        assert_eq!(err.to_string(), "run-tests: missing dependency service_address");

        let mut cmd = AnyCommand::from(ProvisionInstall::new("primary"));
        let err = exec.execute_command(&step_context(), &mut cmd).await.unwrap_err();
        assert!(matches!(err, CommandError::UnsupportedCommand { .. }));
    }
}
