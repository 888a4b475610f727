//! Client-side error type.
//!
//! This module provides [`ClientError`], the single error type every call
//! resolves to, whether the failure happened on the network or in the remote
//! procedure.

use rpcmux_core::{Code, ErrorData, ErrorShape, ParseError};
use serde_json::Value;

/// Client-side error variants.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ClientError {
    /// The remote procedure failed and answered with an error shape.
    #[error("{code}: {message}")]
    Status {
        code: Code,
        message: String,
        path: Option<String>,
        cause: Option<Value>,
    },

    /// Transport-level error (connection failed, timeout, aborted call).
    #[error("transport error: {0}")]
    Transport(String),

    /// Input serialization error.
    #[error("encode error: {0}")]
    Encode(String),

    /// Output deserialization error.
    #[error("decode error: {0}")]
    Decode(String),

    /// The response did not follow the protocol (malformed body, wrong
    /// batch length).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The caller cancelled the operation.
    #[error("operation canceled")]
    Canceled,
}

impl ClientError {
    /// Create a new status error with a code and message.
    pub fn new<S: Into<String>>(code: Code, message: S) -> Self {
        ClientError::Status {
            code,
            message: message.into(),
            path: None,
            cause: None,
        }
    }

    /// Get the error code.
    ///
    /// For non-Status variants, returns an appropriate code:
    /// - Transport, Encode, Decode: `INTERNAL_SERVER_ERROR`
    /// - Protocol: `PARSE_ERROR`
    /// - Canceled: `CLIENT_CLOSED_REQUEST`
    pub fn code(&self) -> Code {
        match self {
            ClientError::Status { code, .. } => *code,
            ClientError::Transport(_) | ClientError::Encode(_) | ClientError::Decode(_) => {
                Code::InternalServerError
            }
            ClientError::Protocol(_) => Code::ParseError,
            ClientError::Canceled => Code::ClientClosedRequest,
        }
    }

    /// Get the error message.
    pub fn message(&self) -> &str {
        match self {
            ClientError::Status { message, .. } => message,
            ClientError::Transport(msg)
            | ClientError::Encode(msg)
            | ClientError::Decode(msg)
            | ClientError::Protocol(msg) => msg,
            ClientError::Canceled => "operation canceled",
        }
    }

    /// Get the structured cause sent by the remote (only for Status variant).
    pub fn cause(&self) -> Option<&Value> {
        match self {
            ClientError::Status { cause, .. } => cause.as_ref(),
            _ => None,
        }
    }

    /// The structured error shape describing this failure.
    ///
    /// Local failures are described with the same shape a remote error
    /// arrives in.
    pub fn shape(&self) -> ErrorShape {
        let code = self.code();
        let path = match self {
            ClientError::Status { path, .. } => path.clone(),
            _ => None,
        };
        ErrorShape {
            message: self.message().to_string(),
            code: code.json_rpc_code(),
            data: ErrorData {
                code: Some(code.as_str().to_string()),
                path,
                cause: self.cause().cloned(),
            },
        }
    }

    /// Whether the failure happened before reaching a remote procedure.
    pub fn is_transport(&self) -> bool {
        matches!(self, ClientError::Transport(_))
    }
}

impl From<ErrorShape> for ClientError {
    fn from(shape: ErrorShape) -> Self {
        ClientError::Status {
            code: shape.error_code(),
            message: shape.message,
            path: shape.data.path,
            cause: shape.data.cause,
        }
    }
}

impl From<ParseError> for ClientError {
    fn from(err: ParseError) -> Self {
        ClientError::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpcmux_core::Status;
    use serde_json::json;

    #[test]
    fn test_from_shape() {
        let shape = Status::not_found("no user")
            .with_cause(json!({"id": 9}))
            .to_shape(Some("getUser"));
        let err = ClientError::from(shape.clone());

        assert_eq!(err.code(), Code::NotFound);
        assert_eq!(err.message(), "no user");
        assert_eq!(err.cause(), Some(&json!({"id": 9})));
        assert_eq!(err.shape(), shape);
        assert_eq!(err.to_string(), "NOT_FOUND: no user");
    }

    #[test]
    fn test_local_failures_have_shapes() {
        let err = ClientError::Transport("connection refused".into());
        let shape = err.shape();
        assert_eq!(shape.code, -32603);
        assert_eq!(shape.message, "connection refused");
        assert!(err.is_transport());

        assert_eq!(ClientError::Canceled.code(), Code::ClientClosedRequest);
        assert_eq!(ClientError::Canceled.shape().data.code.as_deref(), Some("CLIENT_CLOSED_REQUEST"));
    }

    #[test]
    fn test_from_parse_error() {
        let err = ClientError::from(ParseError::LengthMismatch {
            expected: 2,
            actual: 1,
        });
        assert_eq!(err.code(), Code::ParseError);
        assert!(err.message().contains("expected 2"));
    }
}
