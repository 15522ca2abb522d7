//! Minimal contract with the build UI: named step scopes that accept
//! line-oriented writes.

use std::sync::Arc;

use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Success,
    /// The service answered but reported a product failure.
    Failure,
    /// Transport, wiring or precondition error.
    Error,
}

pub trait StepLog: Send + Sync {
    fn write_line(&self, line: &str);
    fn set_summary(&self, summary: &str);
    fn end(&self, status: StepStatus);
}

pub trait StepSink: Send + Sync {
    fn start_step(&self, name: &str) -> Arc<dyn StepLog>;
}

/// Sink that renders steps into the tracing output.
#[derive(Debug, Default, Clone)]
pub struct TracingStepSink;

struct TracingStepLog {
    name: String,
}

impl StepSink for TracingStepSink {
    fn start_step(&self, name: &str) -> Arc<dyn StepLog> {
        info!(step = name, "step started");
        Arc::new(TracingStepLog {
            name: name.to_string(),
        })
    }
}

impl StepLog for TracingStepLog {
    fn write_line(&self, line: &str) {
        info!(step = %self.name, "{}", line);
    }

    fn set_summary(&self, summary: &str) {
        info!(step = %self.name, summary, "step summary");
    }

    fn end(&self, status: StepStatus) {
        match status {
            StepStatus::Success => info!(step = %self.name, "step succeeded"),
            StepStatus::Failure => warn!(step = %self.name, "step failed"),
            StepStatus::Error => error!(step = %self.name, "step errored"),
        }
    }
}
