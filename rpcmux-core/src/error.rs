//! Protocol error codes and types.
//!
//! This module provides the error vocabulary shared by client and server:
//! - [`Code`]: Protocol status codes and their JSON-RPC numbers
//! - [`Status`]: The error value procedures return
//! - [`ErrorShape`]: The structured error carried on the wire
//! - [`RpcError`]: The transport-core error taxonomy
//! - [`ParseError`]: Malformed inbound bytes or structure

use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// RPC error codes, each paired with a JSON-RPC 2.0 numeric code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Code {
    ParseError,
    BadRequest,
    InternalServerError,
    Unauthorized,
    Forbidden,
    NotFound,
    MethodNotSupported,
    Timeout,
    Conflict,
    PreconditionFailed,
    PayloadTooLarge,
    TooManyRequests,
    ClientClosedRequest,
}

impl Code {
    /// Get the symbolic representation of this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Code::ParseError => "PARSE_ERROR",
            Code::BadRequest => "BAD_REQUEST",
            Code::InternalServerError => "INTERNAL_SERVER_ERROR",
            Code::Unauthorized => "UNAUTHORIZED",
            Code::Forbidden => "FORBIDDEN",
            Code::NotFound => "NOT_FOUND",
            Code::MethodNotSupported => "METHOD_NOT_SUPPORTED",
            Code::Timeout => "TIMEOUT",
            Code::Conflict => "CONFLICT",
            Code::PreconditionFailed => "PRECONDITION_FAILED",
            Code::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            Code::TooManyRequests => "TOO_MANY_REQUESTS",
            Code::ClientClosedRequest => "CLIENT_CLOSED_REQUEST",
        }
    }

    /// Get the JSON-RPC numeric code carried in [`ErrorShape::code`].
    pub fn json_rpc_code(&self) -> i32 {
        match self {
            Code::ParseError => -32700,
            Code::BadRequest => -32600,
            Code::InternalServerError => -32603,
            Code::Unauthorized => -32001,
            Code::Forbidden => -32003,
            Code::NotFound => -32004,
            Code::MethodNotSupported => -32005,
            Code::Timeout => -32008,
            Code::Conflict => -32009,
            Code::PreconditionFailed => -32012,
            Code::PayloadTooLarge => -32013,
            Code::TooManyRequests => -32029,
            Code::ClientClosedRequest => -32099,
        }
    }

    /// Map a JSON-RPC numeric code back to a [`Code`].
    pub fn from_json_rpc_code(code: i32) -> Option<Code> {
        let code = match code {
            -32700 => Code::ParseError,
            -32600 => Code::BadRequest,
            -32603 => Code::InternalServerError,
            -32001 => Code::Unauthorized,
            -32003 => Code::Forbidden,
            -32004 => Code::NotFound,
            -32005 => Code::MethodNotSupported,
            -32008 => Code::Timeout,
            -32009 => Code::Conflict,
            -32012 => Code::PreconditionFailed,
            -32013 => Code::PayloadTooLarge,
            -32029 => Code::TooManyRequests,
            -32099 => Code::ClientClosedRequest,
            _ => return None,
        };
        Some(code)
    }
}

impl std::fmt::Display for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing a [`Code`] from a string fails.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParseCodeError(());

impl std::fmt::Display for ParseCodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown error code")
    }
}

impl std::error::Error for ParseCodeError {}

impl FromStr for Code {
    type Err = ParseCodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PARSE_ERROR" => Ok(Code::ParseError),
            "BAD_REQUEST" => Ok(Code::BadRequest),
            "INTERNAL_SERVER_ERROR" => Ok(Code::InternalServerError),
            "UNAUTHORIZED" => Ok(Code::Unauthorized),
            "FORBIDDEN" => Ok(Code::Forbidden),
            "NOT_FOUND" => Ok(Code::NotFound),
            "METHOD_NOT_SUPPORTED" => Ok(Code::MethodNotSupported),
            "TIMEOUT" => Ok(Code::Timeout),
            "CONFLICT" => Ok(Code::Conflict),
            "PRECONDITION_FAILED" => Ok(Code::PreconditionFailed),
            "PAYLOAD_TOO_LARGE" => Ok(Code::PayloadTooLarge),
            "TOO_MANY_REQUESTS" => Ok(Code::TooManyRequests),
            "CLIENT_CLOSED_REQUEST" => Ok(Code::ClientClosedRequest),
            _ => Err(ParseCodeError(())),
        }
    }
}

impl Serialize for Code {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Code {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse()
            .map_err(|_| serde::de::Error::custom(format!("unknown error code `{s}`")))
    }
}

/// Structured error carried by a Failure envelope.
///
/// # Wire Format
///
/// ```json
/// {"message": "user not found", "code": -32004, "data": {"code": "NOT_FOUND", "path": "user.get"}}
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorShape {
    pub message: String,
    pub code: i32,
    #[serde(default)]
    pub data: ErrorData,
}

/// The `data` member of an [`ErrorShape`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Value>,
}

impl ErrorShape {
    /// Resolve the [`Code`] of this shape.
    ///
    /// The symbolic `data.code` wins; the numeric code is the fallback, and an
    /// unrecognised shape reads as [`Code::InternalServerError`].
    pub fn error_code(&self) -> Code {
        self.data
            .code
            .as_deref()
            .and_then(|s| s.parse().ok())
            .or_else(|| Code::from_json_rpc_code(self.code))
            .unwrap_or(Code::InternalServerError)
    }
}

// ============================================================================
// Status - error value returned by procedures and context factories
// ============================================================================

/// RPC status describing a failed call.
///
/// # Example
///
/// ```
/// use rpcmux_core::{Code, Status};
///
/// let status = Status::not_found("user not found");
/// assert_eq!(status.code(), Code::NotFound);
/// assert_eq!(status.message(), "user not found");
///
/// let shape = status.to_shape(Some("user.get"));
/// assert_eq!(shape.code, -32004);
/// assert_eq!(shape.data.path.as_deref(), Some("user.get"));
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct Status {
    code: Code,
    message: String,
    cause: Option<Value>,
}

impl Status {
    /// Create a new status with a code and message.
    pub fn new<S: Into<String>>(code: Code, message: S) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
        }
    }

    /// Create a new status whose message is the code's symbolic name.
    pub fn from_code(code: Code) -> Self {
        Self::new(code, code.as_str())
    }

    /// Attach a structured cause.
    pub fn with_cause(mut self, cause: Value) -> Self {
        self.cause = Some(cause);
        self
    }

    /// Get the error code.
    pub fn code(&self) -> Code {
        self.code
    }

    /// Get the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Get the structured cause, if any.
    pub fn cause(&self) -> Option<&Value> {
        self.cause.as_ref()
    }

    /// Render the wire shape, tagging it with the procedure path when known.
    pub fn to_shape(&self, path: Option<&str>) -> ErrorShape {
        ErrorShape {
            message: self.message.clone(),
            code: self.code.json_rpc_code(),
            data: ErrorData {
                code: Some(self.code.as_str().to_string()),
                path: path.map(str::to_string),
                cause: self.cause.clone(),
            },
        }
    }

    // Convenience constructors

    /// Create a parse error status.
    pub fn parse_error<S: Into<String>>(message: S) -> Self {
        Self::new(Code::ParseError, message)
    }

    /// Create a bad request status.
    pub fn bad_request<S: Into<String>>(message: S) -> Self {
        Self::new(Code::BadRequest, message)
    }

    /// Create an internal server error status.
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::new(Code::InternalServerError, message)
    }

    /// Create an unauthorized status.
    pub fn unauthorized<S: Into<String>>(message: S) -> Self {
        Self::new(Code::Unauthorized, message)
    }

    /// Create a forbidden status.
    pub fn forbidden<S: Into<String>>(message: S) -> Self {
        Self::new(Code::Forbidden, message)
    }

    /// Create a not found status.
    pub fn not_found<S: Into<String>>(message: S) -> Self {
        Self::new(Code::NotFound, message)
    }

    /// Create a method not supported status.
    pub fn method_not_supported<S: Into<String>>(message: S) -> Self {
        Self::new(Code::MethodNotSupported, message)
    }

    /// Create a timeout status.
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Self::new(Code::Timeout, message)
    }

    /// Create a conflict status.
    pub fn conflict<S: Into<String>>(message: S) -> Self {
        Self::new(Code::Conflict, message)
    }

    /// Create a payload too large status.
    pub fn payload_too_large<S: Into<String>>(message: S) -> Self {
        Self::new(Code::PayloadTooLarge, message)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for Status {}

impl From<ErrorShape> for Status {
    fn from(shape: ErrorShape) -> Self {
        Self {
            code: shape.error_code(),
            message: shape.message,
            cause: shape.data.cause,
        }
    }
}

// ============================================================================
// Error taxonomy
// ============================================================================

/// Malformed inbound bytes or structure.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// The payload is not valid JSON.
    #[error("malformed JSON: {0}")]
    Json(String),

    /// The payload is JSON but not a valid frame.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// A batched response does not answer every request in the batch.
    #[error("batch length mismatch: expected {expected} responses, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
}

impl From<serde_json::Error> for ParseError {
    fn from(err: serde_json::Error) -> Self {
        ParseError::Json(err.to_string())
    }
}

/// Errors raised while moving calls between caller and router.
#[derive(Clone, Debug, thiserror::Error)]
pub enum RpcError {
    /// Malformed inbound bytes or structure. Fatal to the request.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// The request broke the protocol (duplicate subscription id, unknown
    /// method). Fatal to the request.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The procedure failed.
    #[error("{0}")]
    Procedure(Status),

    /// The physical connection failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// Building the per-connection context failed.
    #[error("context error: {0}")]
    Context(Status),
}

impl RpcError {
    /// Get the code this error is reported with.
    pub fn code(&self) -> Code {
        match self {
            RpcError::Parse(_) => Code::ParseError,
            RpcError::ProtocolViolation(_) => Code::BadRequest,
            RpcError::Procedure(status) | RpcError::Context(status) => status.code(),
            RpcError::Transport(_) => Code::InternalServerError,
        }
    }

    /// Convert into the [`Status`] a caller sees.
    pub fn to_status(&self) -> Status {
        match self {
            RpcError::Procedure(status) | RpcError::Context(status) => status.clone(),
            other => Status::new(other.code(), other.to_string()),
        }
    }

    /// Render the wire shape for this error.
    pub fn to_shape(&self, path: Option<&str>) -> ErrorShape {
        self.to_status().to_shape(path)
    }
}

impl From<Status> for RpcError {
    fn from(status: Status) -> Self {
        RpcError::Procedure(status)
    }
}
