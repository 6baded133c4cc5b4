use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::WaypointError;
use crate::models::NewMessage;
use crate::schema::Schema;

pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum WaypointRequest {
    Ping,
    Health,
    StartRun {
        workflow_id: String,
        #[serde(default)]
        input: Value,
    },
    ResumeRun {
        run_id: Uuid,
        #[serde(default)]
        input: Value,
    },
    GetRun {
        run_id: Uuid,
    },
    FailRun {
        run_id: Uuid,
        reason: String,
    },
    AssembleContext {
        resource_id: String,
        thread_id: String,
        message: String,
    },
    GetWorkingMemory {
        resource_id: String,
    },
    MergeWorkingMemory {
        resource_id: String,
        patch: Value,
    },
    Generate {
        agent: String,
        messages: Vec<NewMessage>,
        #[serde(default)]
        output_schema: Option<Schema>,
        #[serde(default)]
        resource_id: Option<String>,
        #[serde(default)]
        thread_id: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaypointResponse {
    pub status: String,
    pub data: Option<Value>,
    pub error: Option<String>,
    /// Machine-readable error kind, e.g. `invalid_run_state`.
    #[serde(default)]
    pub kind: Option<String>,
    pub version: String,
}

impl WaypointResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            status: "ok".to_string(),
            data: Some(data),
            error: None,
            kind: None,
            version: PROTOCOL_VERSION.to_string(),
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            data: None,
            error: Some(msg.into()),
            kind: None,
            version: PROTOCOL_VERSION.to_string(),
        }
    }

    pub fn pong() -> Self {
        Self::ok(serde_json::json!({"pong": true}))
    }

    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

impl From<&WaypointError> for WaypointResponse {
    fn from(error: &WaypointError) -> Self {
        let mut response = Self::err(error.to_string());
        response.kind = Some(error.kind().to_string());
        if let Some(step_id) = error.step_id() {
            response.data = Some(serde_json::json!({"step_id": step_id}));
        }
        response
    }
}

/// MessagePack body for one IPC frame.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, WaypointError> {
    rmp_serde::to_vec_named(value).map_err(|e| WaypointError::Ipc(e.to_string()))
}

pub fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, WaypointError> {
    rmp_serde::from_slice(bytes).map_err(|e| WaypointError::Ipc(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RunStatus;

    #[test]
    fn test_request_uses_action_tag() {
        let json = serde_json::json!({"action": "resume_run", "run_id": Uuid::nil(), "input": {"selection": "Kyoto"}});
        let request: WaypointRequest = serde_json::from_value(json).unwrap();
        assert!(matches!(request, WaypointRequest::ResumeRun { .. }));
    }

    #[test]
    fn test_msgpack_frame_round_trip() {
        let request = WaypointRequest::MergeWorkingMemory {
            resource_id: "alice".into(),
            patch: serde_json::json!({"likes": "tea"}),
        };
        let bytes = encode(&request).unwrap();
        let decoded: WaypointRequest = decode(&bytes).unwrap();
        match decoded {
            WaypointRequest::MergeWorkingMemory { resource_id, patch } => {
                assert_eq!(resource_id, "alice");
                assert_eq!(patch["likes"], "tea");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_error_response_carries_kind() {
        let error = WaypointError::InvalidRunState {
            run_id: Uuid::nil(),
            status: RunStatus::Completed,
            expected: RunStatus::Suspended,
        };
        let response = WaypointResponse::from(&error);
        assert!(!response.is_ok());
        assert_eq!(response.kind.as_deref(), Some("invalid_run_state"));
    }
}
