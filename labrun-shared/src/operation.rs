use serde::{Deserialize, Serialize};

use crate::any::AnyMessage;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RpcStatus {
    pub code: i32,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum OperationResult {
    Response(AnyMessage),
    Error(RpcStatus),
}

/// Handle for a long-running operation. Polled by name until `done`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Operation {
    pub name: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<OperationResult>,
}

impl Operation {
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            done: false,
            result: None,
        }
    }

    pub fn completed(name: impl Into<String>, response: AnyMessage) -> Self {
        Self {
            name: name.into(),
            done: true,
            result: Some(OperationResult::Response(response)),
        }
    }

    pub fn failed(name: impl Into<String>, status: RpcStatus) -> Self {
        Self {
            name: name.into(),
            done: true,
            result: Some(OperationResult::Error(status)),
        }
    }
}

/// What a unary service call hands back: the typed response itself, or an
/// operation to poll for it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "reply", content = "payload", rename_all = "snake_case")]
pub enum Reply<T> {
    Immediate(T),
    Operation(Operation),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_wire_format() {
        let reply: Reply<serde_json::Value> = Reply::Operation(Operation::pending("operations/42"));
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["reply"], "operation");
        assert_eq!(json["payload"]["name"], "operations/42");
        assert_eq!(json["payload"]["done"], false);

        let parsed: Reply<serde_json::Value> = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, reply);
    }

    #[test]
    fn test_operation_defaults_when_fields_missing() {
        let op: Operation = serde_json::from_str(r#"{"name":"operations/1"}"#).unwrap();
        assert!(!op.done);
        assert!(op.result.is_none());
    }
}
