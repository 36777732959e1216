//! JSON-RPC 2.0 envelope and method dispatch.
//!
//! Requests: `join_waiting_room`, `leave_waiting_room`, `submit_answer`.
//! Every server push is a notification whose `method` is the event name.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use knockout_core::rules::AnswerSubmission;
use knockout_core::{Identity, KnockoutError, ServerEvent};

use crate::arena::{Arena, JoinOutcome};

pub const PARSE_ERROR: i32 = -32700;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;
pub const CAPACITY_EXCEEDED: i32 = -32001;

// ---------------------------------------------------------------------------
// JSON-RPC types
// ---------------------------------------------------------------------------

fn default_jsonrpc() -> String {
    "2.0".into()
}

#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default = "default_jsonrpc")]
    pub jsonrpc: String,
    pub id: Option<u64>,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn ok(id: Option<u64>, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Option<u64>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
}

/// Server-initiated push (no `id`).
#[derive(Debug, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    pub params: serde_json::Value,
}

impl JsonRpcNotification {
    pub fn from_event(event: &ServerEvent) -> Result<Self, serde_json::Error> {
        let params = match serde_json::to_value(event)? {
            serde_json::Value::Object(mut map) => map
                .remove("params")
                .unwrap_or_else(|| serde_json::json!({})),
            _ => serde_json::json!({}),
        };
        Ok(Self {
            jsonrpc: "2.0".into(),
            method: event.method().to_string(),
            params,
        })
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Handle one request from an authenticated client. Returns `None` for
/// JSON-RPC notifications (requests without `id`), which get no reply.
pub async fn handle_request(
    arena: &Arc<Arena>,
    identity: &Identity,
    req: JsonRpcRequest,
) -> Option<JsonRpcResponse> {
    debug!(identity = %identity.id, method = %req.method, id = ?req.id, "request received");
    let id = req.id;
    let response = match req.method.as_str() {
        "join_waiting_room" => match arena.join_waiting_room(identity).await {
            Ok(JoinOutcome::Waiting {
                session_id,
                join_code,
                update,
            }) => JsonRpcResponse::ok(
                id,
                serde_json::json!({
                    "sessionId": session_id,
                    "joinCode": join_code,
                    "count": update.count,
                    "min": update.min,
                    "max": update.max,
                }),
            ),
            Ok(JoinOutcome::Rejoined { session_id }) => JsonRpcResponse::ok(
                id,
                serde_json::json!({ "sessionId": session_id, "rejoined": true }),
            ),
            Err(e) => error_response(id, &e),
        },

        "leave_waiting_room" => {
            let updates = arena.leave_waiting_room(identity).await;
            JsonRpcResponse::ok(id, serde_json::json!({ "left": updates.len() }))
        }

        "submit_answer" => match serde_json::from_value::<AnswerSubmission>(req.params) {
            Ok(submission) => {
                // Rejections are silent by contract; the reply only
                // acknowledges receipt.
                let _ = arena.submit_answer(identity, submission).await;
                JsonRpcResponse::ok(id, serde_json::json!({ "received": true }))
            }
            Err(e) => JsonRpcResponse::err(id, INVALID_PARAMS, format!("invalid params: {e}")),
        },

        other => JsonRpcResponse::err(id, METHOD_NOT_FOUND, format!("method not found: {other}")),
    };
    id.map(|_| response)
}

fn error_response(id: Option<u64>, err: &KnockoutError) -> JsonRpcResponse {
    let code = match err {
        KnockoutError::CapacityExceeded { .. } => CAPACITY_EXCEEDED,
        _ => INTERNAL_ERROR,
    };
    JsonRpcResponse::err(id, code, err.to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use knockout_core::{RoundId, SessionId};

    #[test]
    fn request_parsing_defaults() {
        let req: JsonRpcRequest =
            serde_json::from_str(r#"{"id": 3, "method": "join_waiting_room"}"#).unwrap();
        assert_eq!(req.jsonrpc, "2.0");
        assert_eq!(req.id, Some(3));
        assert!(req.params.is_null());
    }

    #[test]
    fn response_omits_absent_fields() {
        let resp = JsonRpcResponse::ok(Some(1), serde_json::json!({ "received": true }));
        let v: serde_json::Value = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["id"], 1);
        assert_eq!(v["result"]["received"], true);
        assert!(v.get("error").is_none());

        let resp = JsonRpcResponse::err(None, PARSE_ERROR, "parse error");
        let v: serde_json::Value = serde_json::to_value(&resp).unwrap();
        assert!(v.get("id").is_none());
        assert_eq!(v["error"]["code"], -32700);
    }

    #[test]
    fn notification_lifts_event_params() {
        let ev = ServerEvent::AnswerProgress {
            round_id: RoundId(4),
            answered_count: 2,
        };
        let n = JsonRpcNotification::from_event(&ev).unwrap();
        assert_eq!(n.method, "answer_progress");
        assert_eq!(n.params["roundId"], 4);
        assert_eq!(n.params["answeredCount"], 2);
    }

    #[test]
    fn notification_for_unit_event_has_empty_params() {
        let n = JsonRpcNotification::from_event(&ServerEvent::Superseded).unwrap();
        assert_eq!(n.method, "superseded");
        assert_eq!(n.params, serde_json::json!({}));
    }

    #[test]
    fn capacity_error_code() {
        let resp = error_response(
            Some(9),
            &KnockoutError::CapacityExceeded {
                session_id: SessionId(1),
                max: 2,
            },
        );
        assert_eq!(resp.error.unwrap().code, CAPACITY_EXCEEDED);
    }
}
