//! Wire frames exchanged between an RPC client and server.
//!
//! Frames are plain data; how they are encoded is up to the transport. All
//! frames derive `serde` traits so a transport can pick any format.

use std::fmt;

use ember_runtime::{Defect, Exit, FiberId};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Correlates a request with the frames answering it.
///
/// Allocated in strictly increasing order per client and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    pub const fn new(raw: u64) -> Self {
        RequestId(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Request headers, in insertion order.
pub type Headers = IndexMap<String, String>;

/// Trace linkage propagated with a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
    pub sampled: bool,
}

/// Frames sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_tag")]
pub enum FromClient {
    Request {
        id: RequestId,
        tag: String,
        payload: Value,
        headers: Headers,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        trace_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        span_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sampled: Option<bool>,
    },
    /// The chunk for `request_id` was enqueued; the server may send the next.
    Ack { request_id: RequestId },
    /// The caller no longer wants the result of `request_id`.
    Interrupt {
        request_id: RequestId,
        interruptors: Vec<FiberId>,
    },
    /// The client is going away.
    Eof,
}

impl FromClient {
    /// The request this frame refers to, if any.
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            FromClient::Request { id, .. } => Some(*id),
            FromClient::Ack { request_id } | FromClient::Interrupt { request_id, .. } => {
                Some(*request_id)
            }
            FromClient::Eof => None,
        }
    }
}

/// Frames delivered by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_tag")]
pub enum FromServer {
    /// Values produced by a streaming request, in order.
    Chunk {
        request_id: RequestId,
        values: Vec<Value>,
    },
    /// Final outcome of a request.
    Exit {
        request_id: RequestId,
        exit: Exit<Value, Value>,
    },
    /// The connection failed; every pending request dies with `defect`.
    Defect { defect: Value },
    /// The server finished talking to this client.
    ClientEnd,
}

/// Render a wire defect as a [`Defect`], keeping string payloads verbatim.
pub fn defect_from_value(value: &Value) -> Defect {
    match value {
        Value::String(message) => Defect::new(message.clone()),
        other => Defect::new(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_request_frame_shape() {
        let frame = FromClient::Request {
            id: RequestId::new(7),
            tag: "GetUser".to_string(),
            payload: json!({ "id": 1 }),
            headers: Headers::from([("x-tenant".to_string(), "acme".to_string())]),
            trace_id: None,
            span_id: None,
            sampled: None,
        };

        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({
                "_tag": "Request",
                "id": 7,
                "tag": "GetUser",
                "payload": { "id": 1 },
                "headers": { "x-tenant": "acme" },
            })
        );
        assert_eq!(frame.request_id(), Some(RequestId::new(7)));
    }

    #[test]
    fn test_exit_frame_from_json() {
        let frame: FromServer = serde_json::from_value(json!({
            "_tag": "Exit",
            "request_id": 3,
            "exit": { "_tag": "Failure", "value": { "_tag": "Fail", "value": "not found" } },
        }))
        .unwrap();

        assert_eq!(
            frame,
            FromServer::Exit {
                request_id: RequestId::new(3),
                exit: Exit::fail(json!("not found")),
            }
        );
    }

    #[test]
    fn test_defect_from_value() {
        assert_eq!(defect_from_value(&json!("boom")).message(), "boom");
        assert_eq!(defect_from_value(&json!({ "code": 5 })).message(), r#"{"code":5}"#);
    }
}
