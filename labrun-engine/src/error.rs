use std::time::Duration;

/// Failure of a single pipeline step.
///
/// Wiring errors (`UnsupportedStateKeeper`, `UnsupportedCommand`) and
/// missing preconditions are always fatal to the step. Transport failures are
/// wrapped with the call site. Business failures (a service answering with a
/// non-success status) are not errors at all; see `Command::business_failure`.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("{command}: unsupported state keeper {state_keeper}")]
    UnsupportedStateKeeper {
        command: &'static str,
        state_keeper: &'static str,
    },

    #[error("{executor}: unsupported command {command}")]
    UnsupportedCommand {
        executor: &'static str,
        command: &'static str,
    },

    #[error("{command}: missing dependency {field}")]
    MissingDependency { command: &'static str, field: String },

    #[error("no device found for board {board:?} model {model:?}")]
    DeviceNotFound { board: String, model: String },

    #[error("{context}: {source:#}")]
    Rpc {
        context: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("{context}: {source:#}")]
    Container {
        context: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },

    #[error("injectable {key}: {reason}")]
    Injectable { key: String, reason: String },

    #[error("{command}: has no local execution, it must be run by an executor")]
    NoLocalExecution { command: &'static str },

    #[error("{command}: invalid input: {reason}")]
    InvalidInput { command: &'static str, reason: String },

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CommandError {
    pub fn missing(command: &'static str, field: impl Into<String>) -> Self {
        CommandError::MissingDependency {
            command,
            field: field.into(),
        }
    }

    pub fn rpc(context: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        CommandError::Rpc {
            context: context.into(),
            source: source.into(),
        }
    }

    pub fn container(context: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        CommandError::Container {
            context: context.into(),
            source: source.into(),
        }
    }
}

pub type CommandResult<T> = Result<T, CommandError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_dependency_names_command_and_field() {
        let err = CommandError::missing("provision-install", "dut_topology");
        assert_eq!(err.to_string(), "provision-install: missing dependency dut_topology");
    }

    #[test]
    fn test_rpc_error_keeps_source_chain() {
        let inner = anyhow::anyhow!("connection refused").context("POST /provision/Install");
        let err = CommandError::rpc("install on primary", inner);
        let msg = err.to_string();
        assert!(msg.starts_with("install on primary: "));
        assert!(msg.contains("connection refused"));
    }
}
