//! Encoding and decoding between in-memory values and JSON bytes.
//!
//! A payload is either a single item or an ordered sequence (a batch);
//! positional correspondence is preserved in both directions.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::{CallRequest, Envelope, Method, Request, RequestFrame, RequestId};
use crate::error::{ParseError, RpcError};

/// A single item or an ordered batch of items.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::Many(items) => items,
            OneOrMany::One(item) => vec![item],
        }
    }
}

/// Serialize a payload to JSON bytes.
pub fn encode<T: Serialize + ?Sized>(payload: &T) -> Result<Bytes, serde_json::Error> {
    serde_json::to_vec(payload).map(Bytes::from)
}

/// Decode an envelope or a batch of envelopes.
pub fn decode(bytes: &[u8]) -> Result<OneOrMany<Envelope>, ParseError> {
    let value: Value = serde_json::from_slice(bytes)?;
    match value {
        Value::Array(items) => items
            .into_iter()
            .map(envelope_from_value)
            .collect::<Result<Vec<_>, _>>()
            .map(OneOrMany::Many),
        other => envelope_from_value(other).map(OneOrMany::One),
    }
}

/// Decode the response to a batched call of `expected` operations.
///
/// The i-th slot answers the i-th call and is decoded on its own, so a
/// malformed slot fails only its member. A single non-array envelope answers
/// every call in the batch. Bytes that are not JSON, or an array of the
/// wrong length, fail the whole batch.
pub fn decode_batch_response(
    bytes: &[u8],
    expected: usize,
) -> Result<Vec<Result<Envelope, ParseError>>, ParseError> {
    let value: Value = serde_json::from_slice(bytes)?;
    match value {
        Value::Array(slots) if slots.len() != expected => Err(ParseError::LengthMismatch {
            expected,
            actual: slots.len(),
        }),
        Value::Array(slots) => Ok(slots.into_iter().map(envelope_from_value).collect()),
        other => Ok(vec![envelope_from_value(other); expected]),
    }
}

fn envelope_from_value(value: Value) -> Result<Envelope, ParseError> {
    serde_json::from_value(value).map_err(|e| ParseError::InvalidFrame(e.to_string()))
}

/// An inbound frame that failed validation.
///
/// `id` is set when the frame's id could be read, so the error can be
/// addressed to the request.
#[derive(Clone, Debug)]
pub struct InvalidRequest {
    pub id: Option<RequestId>,
    pub error: RpcError,
}

impl InvalidRequest {
    fn invalid(id: Option<RequestId>, message: impl Into<String>) -> Self {
        Self {
            id,
            error: RpcError::Parse(ParseError::InvalidFrame(message.into())),
        }
    }
}

/// Parse one inbound persistent-connection message.
///
/// An array fans out into independent requests, each validated on its own.
/// Only bytes that are not JSON at all fail the whole message.
pub fn parse_inbound(bytes: &[u8]) -> Result<Vec<Result<Request, InvalidRequest>>, ParseError> {
    let value: Value = serde_json::from_slice(bytes)?;
    let requests = match value {
        Value::Array(items) => items.into_iter().map(validate_request).collect(),
        other => vec![validate_request(other)],
    };
    Ok(requests)
}

fn validate_request(value: Value) -> Result<Request, InvalidRequest> {
    let Value::Object(object) = &value else {
        return Err(InvalidRequest::invalid(None, "request must be an object"));
    };

    let id = object
        .get("id")
        .and_then(RequestId::from_value)
        .ok_or_else(|| InvalidRequest::invalid(None, "`id` must be a number or a string"))?;

    match object.get("jsonrpc") {
        None | Some(Value::Null) => {}
        Some(Value::String(v)) if v == "2.0" => {}
        Some(_) => {
            return Err(InvalidRequest::invalid(
                Some(id),
                "`jsonrpc` must be \"2.0\" when present",
            ));
        }
    }

    let method = object.get("method").and_then(Value::as_str).unwrap_or("");
    if Method::parse(method).is_none() {
        return Err(InvalidRequest {
            id: Some(id),
            error: RpcError::ProtocolViolation(format!("unknown method `{method}`")),
        });
    }

    let frame: RequestFrame = serde_json::from_value(value)
        .map_err(|e| InvalidRequest::invalid(Some(id.clone()), e.to_string()))?;

    match (frame.method.kind(), frame.params) {
        (None, _) => Ok(Request::Stop { id: frame.id }),
        (Some(kind), Some(params)) => Ok(Request::Call(CallRequest {
            id: frame.id,
            kind,
            path: params.path,
            input: params.input,
        })),
        (Some(_), None) => Err(InvalidRequest::invalid(
            Some(frame.id),
            "`params.path` is required",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::ProcedureKind;
    use crate::error::{Code, Status};
    use serde_json::json;

    #[test]
    fn test_decode_batch_positional() {
        let body = br#"[{"result":"Alice"},{"result":{"type":"data","data":"Bob"}}]"#;
        let envelopes = decode_batch_response(body, 2).unwrap();
        assert_eq!(
            envelopes,
            vec![
                Ok(Envelope::success(json!("Alice"))),
                Ok(Envelope::success(json!("Bob")))
            ]
        );
    }

    #[test]
    fn test_decode_batch_single_value_fans_out() {
        let shape = Status::internal("down").to_shape(None);
        let body = serde_json::to_vec(&json!({ "error": shape })).unwrap();
        let envelopes = decode_batch_response(&body, 3).unwrap();
        assert_eq!(envelopes.len(), 3);
        assert!(envelopes.iter().all(|e| !e.as_ref().unwrap().is_success()));
    }

    #[test]
    fn test_decode_batch_malformed_slot_fails_alone() {
        let body = br#"[{"result":"Alice"},{"unexpected":2},{"result":"Carol"}]"#;
        let slots = decode_batch_response(body, 3).unwrap();
        assert_eq!(slots[0], Ok(Envelope::success(json!("Alice"))));
        assert!(matches!(slots[1], Err(ParseError::InvalidFrame(_))));
        assert_eq!(slots[2], Ok(Envelope::success(json!("Carol"))));
    }

    #[test]
    fn test_decode_batch_not_json_fails_whole_batch() {
        assert!(matches!(
            decode_batch_response(b"<html>", 2),
            Err(ParseError::Json(_))
        ));
    }

    #[test]
    fn test_decode_batch_length_mismatch() {
        let err = decode_batch_response(br#"[{"result":1}]"#, 2).unwrap_err();
        assert_eq!(
            err,
            ParseError::LengthMismatch {
                expected: 2,
                actual: 1
            }
        );
    }

    #[test]
    fn test_decode_malformed() {
        assert!(matches!(decode(b"{not json"), Err(ParseError::Json(_))));
        assert!(matches!(
            decode(br#"[{"nope":1}]"#),
            Err(ParseError::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_encode_batch() {
        let payload = OneOrMany::Many(vec![
            Envelope::success(json!(1)),
            Envelope::failure(Status::timeout("slow").to_shape(Some("a"))),
        ]);
        let bytes = encode(&payload).unwrap();
        let back = decode(&bytes).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_parse_inbound_single_call() {
        let requests = parse_inbound(
            br#"{"id":1,"jsonrpc":"2.0","method":"query","params":{"path":"getUser","input":1}}"#,
        )
        .unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0].as_ref().unwrap(),
            &Request::Call(CallRequest {
                id: RequestId::Number(1),
                kind: ProcedureKind::Query,
                path: "getUser".into(),
                input: json!(1),
            })
        );
    }

    #[test]
    fn test_parse_inbound_array_validates_independently() {
        let requests = parse_inbound(
            br#"[
                {"id":"a","method":"subscription.stop"},
                {"id":2,"method":"mutation","params":{"path":"bump"}},
                {"method":"query"},
                {"id":4,"jsonrpc":"1.0","method":"query","params":{"path":"x"}},
                {"id":5,"method":"subscribe"},
                {"id":6,"method":"query"}
            ]"#,
        )
        .unwrap();
        assert_eq!(requests.len(), 6);

        assert_eq!(
            requests[0].as_ref().unwrap(),
            &Request::Stop {
                id: RequestId::from("a")
            }
        );
        match &requests[1] {
            Ok(Request::Call(call)) => assert_eq!(call.input, Value::Null),
            other => panic!("unexpected: {other:?}"),
        }

        let missing_id = requests[2].as_ref().unwrap_err();
        assert_eq!(missing_id.id, None);
        assert_eq!(missing_id.error.code(), Code::ParseError);

        let bad_version = requests[3].as_ref().unwrap_err();
        assert_eq!(bad_version.id, Some(RequestId::Number(4)));

        let unknown = requests[4].as_ref().unwrap_err();
        assert_eq!(unknown.id, Some(RequestId::Number(5)));
        assert_eq!(unknown.error.code(), Code::BadRequest);

        let no_params = requests[5].as_ref().unwrap_err();
        assert_eq!(no_params.id, Some(RequestId::Number(6)));
    }

    #[test]
    fn test_parse_inbound_not_json() {
        assert!(matches!(parse_inbound(b"hello"), Err(ParseError::Json(_))));
    }

    #[test]
    fn test_parse_inbound_non_object() {
        let requests = parse_inbound(b"[1]").unwrap();
        assert!(requests[0].as_ref().unwrap_err().id.is_none());
    }
}
