//! Wire shapes for calls, results and protocol notifications.
//!
//! Two transports share these definitions:
//!
//! - Request/response batching: an ordered list of [`Call`]s is sent as one
//!   [`BatchRequest`] and answered by one [`Envelope`] per call.
//! - Persistent connections: [`RequestFrame`]s flow in, [`ServerMessage`]s
//!   ([`ResponseFrame`] or [`ReconnectNotification`]) flow out.

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::error::ErrorShape;

/// The kind of a procedure. Batching never mixes kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcedureKind {
    Query,
    Mutation,
    Subscription,
}

impl ProcedureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcedureKind::Query => "query",
            ProcedureKind::Mutation => "mutation",
            ProcedureKind::Subscription => "subscription",
        }
    }
}

impl std::fmt::Display for ProcedureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request identifier on a persistent connection: a JSON number or string.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl RequestId {
    /// Sentinel id for connection-level errors that answer no request.
    pub fn none() -> Self {
        RequestId::Number(-1)
    }

    /// Read an id from a JSON value. Only integers and strings qualify.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(RequestId::Number),
            Value::String(s) => Some(RequestId::String(s.clone())),
            _ => None,
        }
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_string())
    }
}

// ============================================================================
// Request/response batching
// ============================================================================

/// One logical call issued by a caller.
#[derive(Clone, Debug, PartialEq)]
pub struct Operation {
    /// Correlation id, unique per in-flight call on a link.
    pub id: u64,
    pub kind: ProcedureKind,
    pub path: String,
    pub input: Value,
}

impl Operation {
    /// The `{path, input}` pair this operation contributes to a batch.
    pub fn to_call(&self) -> Call {
        Call {
            path: self.path.clone(),
            input: self.input.clone(),
        }
    }
}

/// A `{path, input}` pair carried by a batched network call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub path: String,
    #[serde(default)]
    pub input: Value,
}

/// The physical shape of a batched call: comma-joined paths and a positional
/// input array.
#[derive(Clone, Debug, PartialEq)]
pub struct BatchRequest {
    pub path: String,
    pub input: Value,
}

impl BatchRequest {
    pub fn from_calls(calls: &[Call]) -> Self {
        let path = calls
            .iter()
            .map(|c| c.path.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let input = Value::Array(calls.iter().map(|c| c.input.clone()).collect());
        Self { path, input }
    }
}

/// One response slot of a batched call.
///
/// # Wire Format
///
/// ```json
/// {"result": {"type": "data", "data": "Alice"}}
/// {"error": {"message": "...", "code": -32004, "data": {"code": "NOT_FOUND"}}}
/// ```
///
/// A bare `{"result": <value>}` slot decodes as `Success` with `<value>` as
/// data. A result object is unwrapped only when its keys are `type` and
/// `data` alone and `type` is `"data"`; any other object is the data itself.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawSlot", into = "RawSlot")]
pub enum Envelope {
    Success { data: Value },
    Failure { error: ErrorShape },
}

impl Envelope {
    pub fn success(data: Value) -> Self {
        Envelope::Success { data }
    }

    pub fn failure(error: ErrorShape) -> Self {
        Envelope::Failure { error }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Envelope::Success { .. })
    }

    pub fn into_result(self) -> Result<Value, ErrorShape> {
        match self {
            Envelope::Success { data } => Ok(data),
            Envelope::Failure { error } => Err(error),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct RawSlot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ErrorShape>,
}

impl TryFrom<RawSlot> for Envelope {
    type Error = String;

    fn try_from(raw: RawSlot) -> Result<Self, Self::Error> {
        if let Some(error) = raw.error {
            return Ok(Envelope::Failure { error });
        }
        match raw.result {
            Some(Value::Object(mut result)) if is_data_result(&result) => {
                let data = result.remove("data").unwrap_or(Value::Null);
                Ok(Envelope::Success { data })
            }
            Some(data) => Ok(Envelope::Success { data }),
            None => Err("slot has neither `result` nor `error`".to_string()),
        }
    }
}

fn is_data_result(result: &serde_json::Map<String, Value>) -> bool {
    result.get("type").and_then(Value::as_str) == Some("data")
        && result.keys().all(|key| key == "type" || key == "data")
}

impl From<Envelope> for RawSlot {
    fn from(envelope: Envelope) -> Self {
        match envelope {
            Envelope::Success { data } => RawSlot {
                id: None,
                result: Some(serde_json::json!({ "type": "data", "data": data })),
                error: None,
            },
            Envelope::Failure { error } => RawSlot {
                id: None,
                result: None,
                error: Some(error),
            },
        }
    }
}

// ============================================================================
// Persistent-connection frames
// ============================================================================

/// Method of an inbound persistent-connection frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    #[serde(rename = "query")]
    Query,
    #[serde(rename = "mutation")]
    Mutation,
    #[serde(rename = "subscription")]
    Subscription,
    #[serde(rename = "subscription.stop")]
    SubscriptionStop,
}

impl Method {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "query" => Some(Method::Query),
            "mutation" => Some(Method::Mutation),
            "subscription" => Some(Method::Subscription),
            "subscription.stop" => Some(Method::SubscriptionStop),
            _ => None,
        }
    }

    /// The procedure kind invoked by this method, `None` for
    /// `subscription.stop`.
    pub fn kind(&self) -> Option<ProcedureKind> {
        match self {
            Method::Query => Some(ProcedureKind::Query),
            Method::Mutation => Some(ProcedureKind::Mutation),
            Method::Subscription => Some(ProcedureKind::Subscription),
            Method::SubscriptionStop => None,
        }
    }
}

impl From<ProcedureKind> for Method {
    fn from(kind: ProcedureKind) -> Self {
        match kind {
            ProcedureKind::Query => Method::Query,
            ProcedureKind::Mutation => Method::Mutation,
            ProcedureKind::Subscription => Method::Subscription,
        }
    }
}

/// Inbound frame on a persistent connection.
///
/// ```json
/// {"id": 5, "jsonrpc": "2.0", "method": "subscription", "params": {"path": "onTick", "input": null}}
/// {"id": 5, "method": "subscription.stop"}
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    pub method: Method,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Call>,
}

impl RequestFrame {
    pub fn call(id: impl Into<RequestId>, kind: ProcedureKind, path: &str, input: Value) -> Self {
        Self {
            id: id.into(),
            jsonrpc: None,
            method: kind.into(),
            params: Some(Call {
                path: path.to_string(),
                input,
            }),
        }
    }

    pub fn stop(id: impl Into<RequestId>) -> Self {
        Self {
            id: id.into(),
            jsonrpc: None,
            method: Method::SubscriptionStop,
            params: None,
        }
    }
}

/// A validated inbound request.
#[derive(Clone, Debug, PartialEq)]
pub enum Request {
    Stop { id: RequestId },
    Call(CallRequest),
}

impl Request {
    pub fn id(&self) -> &RequestId {
        match self {
            Request::Stop { id } => id,
            Request::Call(call) => &call.id,
        }
    }
}

/// A procedure invocation received on a persistent connection.
#[derive(Clone, Debug, PartialEq)]
pub struct CallRequest {
    pub id: RequestId,
    pub kind: ProcedureKind,
    pub path: String,
    pub input: Value,
}

/// The `result` member of an outbound frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ResultPayload {
    Data { data: Value },
    Started,
    Stopped,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseBody {
    Result(ResultPayload),
    Error(ErrorShape),
}

/// Outbound frame answering one request.
///
/// `id` is `null` when the request's id could not be read.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: Option<RequestId>,
    #[serde(flatten)]
    pub body: ResponseBody,
}

impl ResponseFrame {
    pub fn data(id: RequestId, data: Value) -> Self {
        Self::result(Some(id), ResultPayload::Data { data })
    }

    pub fn started(id: RequestId) -> Self {
        Self::result(Some(id), ResultPayload::Started)
    }

    pub fn stopped(id: RequestId) -> Self {
        Self::result(Some(id), ResultPayload::Stopped)
    }

    pub fn error(id: Option<RequestId>, error: ErrorShape) -> Self {
        Self {
            id,
            body: ResponseBody::Error(error),
        }
    }

    fn result(id: Option<RequestId>, payload: ResultPayload) -> Self {
        Self {
            id,
            body: ResponseBody::Result(payload),
        }
    }
}

/// Advisory asking every client to reconnect: `{"id": null, "method": "reconnect"}`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconnectNotification;

impl Serialize for ReconnectNotification {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("id", &Value::Null)?;
        map.serialize_entry("method", "reconnect")?;
        map.end()
    }
}

/// Anything the server writes to a persistent connection.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Response(ResponseFrame),
    Reconnect(ReconnectNotification),
}

impl From<ResponseFrame> for ServerMessage {
    fn from(frame: ResponseFrame) -> Self {
        ServerMessage::Response(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Status;
    use serde_json::json;

    #[test]
    fn test_batch_request_from_calls() {
        let calls = vec![
            Call {
                path: "getUser".into(),
                input: json!(1),
            },
            Call {
                path: "getUser".into(),
                input: json!(2),
            },
        ];
        let batch = BatchRequest::from_calls(&calls);
        assert_eq!(batch.path, "getUser,getUser");
        assert_eq!(batch.input, json!([1, 2]));
    }

    #[test]
    fn test_envelope_success_wire_format() {
        let json = serde_json::to_value(Envelope::success(json!("Alice"))).unwrap();
        assert_eq!(json, json!({"result": {"type": "data", "data": "Alice"}}));
    }

    #[test]
    fn test_envelope_accepts_bare_result() {
        let env: Envelope = serde_json::from_value(json!({"result": "Bob"})).unwrap();
        assert_eq!(env, Envelope::success(json!("Bob")));

        let env: Envelope =
            serde_json::from_value(json!({"id": 3, "result": {"type": "data"}})).unwrap();
        assert_eq!(env, Envelope::success(Value::Null));
    }

    #[test]
    fn test_envelope_keeps_data_shaped_payload() {
        let payload = json!({"type": "data", "data": 1, "source": "cache"});
        let env: Envelope = serde_json::from_value(json!({ "result": payload })).unwrap();
        assert_eq!(env, Envelope::success(payload));

        let nested = json!({"type": "data", "data": {"type": "data", "data": 2, "extra": true}});
        let env: Envelope = serde_json::from_value(json!({ "result": nested })).unwrap();
        assert_eq!(
            env,
            Envelope::success(json!({"type": "data", "data": 2, "extra": true}))
        );
    }

    #[test]
    fn test_envelope_failure() {
        let shape = Status::not_found("gone").to_shape(Some("getUser"));
        let env: Envelope = serde_json::from_value(json!({ "error": shape })).unwrap();
        assert!(!env.is_success());
        assert_eq!(env.into_result().unwrap_err().message, "gone");
    }

    #[test]
    fn test_envelope_rejects_empty_slot() {
        assert!(serde_json::from_value::<Envelope>(json!({"id": 1})).is_err());
    }

    #[test]
    fn test_request_id_from_value() {
        assert_eq!(RequestId::from_value(&json!(7)), Some(RequestId::Number(7)));
        assert_eq!(RequestId::from_value(&json!("a")), Some(RequestId::from("a")));
        assert_eq!(RequestId::from_value(&json!(1.5)), None);
        assert_eq!(RequestId::from_value(&json!(null)), None);
    }

    #[test]
    fn test_request_frame_wire_format() {
        let frame = RequestFrame::call(5, ProcedureKind::Subscription, "onTick", json!(null));
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"id": 5, "method": "subscription", "params": {"path": "onTick", "input": null}})
        );
        assert_eq!(
            serde_json::to_value(RequestFrame::stop("s")).unwrap(),
            json!({"id": "s", "method": "subscription.stop"})
        );
    }

    #[test]
    fn test_response_frames() {
        let id = RequestId::Number(5);
        assert_eq!(
            serde_json::to_value(ResponseFrame::started(id.clone())).unwrap(),
            json!({"id": 5, "result": {"type": "started"}})
        );
        assert_eq!(
            serde_json::to_value(ResponseFrame::data(id.clone(), json!("a"))).unwrap(),
            json!({"id": 5, "result": {"type": "data", "data": "a"}})
        );
        assert_eq!(
            serde_json::to_value(ResponseFrame::stopped(id)).unwrap(),
            json!({"id": 5, "result": {"type": "stopped"}})
        );
    }

    #[test]
    fn test_response_frame_round_trips_error() {
        let frame = ResponseFrame::error(None, Status::parse_error("bad").to_shape(None));
        let json = serde_json::to_string(&frame).unwrap();
        let back: ResponseFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(back, frame);
        assert!(json.starts_with(r#"{"id":null,"error":"#));
    }

    #[test]
    fn test_reconnect_notification() {
        let json = serde_json::to_string(&ServerMessage::Reconnect(ReconnectNotification)).unwrap();
        assert_eq!(json, r#"{"id":null,"method":"reconnect"}"#);
    }

    #[test]
    fn test_method_kind() {
        assert_eq!(Method::parse("subscription.stop"), Some(Method::SubscriptionStop));
        assert_eq!(Method::SubscriptionStop.kind(), None);
        assert_eq!(Method::Mutation.kind(), Some(ProcedureKind::Mutation));
        assert_eq!(Method::parse("subscribe"), None);
    }
}
