use http::StatusCode;
use serde::Serialize;
use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;

/// Discriminant for [`RouterError`]. The set is closed: every failure on the
/// forwarding path maps to exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed resource path, unknown service prefix, unsupported method.
    BadRequest,
    /// Lookup miss in the shared store. Callers treat it as "state unknown".
    NotFound,
    /// Failure talking to a backend or to the shared store.
    Integration,
    /// Every backend of the pool failed the liveness check.
    NoBackendAvailable,
    /// Unexpected internal failure (request construction, panics).
    Generic,
}

impl ErrorKind {
    pub fn default_status(self) -> StatusCode {
        match self {
            ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Integration => StatusCode::BAD_GATEWAY,
            ErrorKind::NoBackendAvailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Generic => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Integration => "integration",
            ErrorKind::NoBackendAvailable => "no_backend_available",
            ErrorKind::Generic => "generic",
        }
    }
}

#[derive(Debug)]
pub struct RouterError {
    kind: ErrorKind,
    status: StatusCode,
    message: String,
    cause: Option<String>,
    stacktrace: Option<String>,
}

impl RouterError {
    fn new(kind: ErrorKind, message: impl Into<String>, cause: Option<String>) -> Self {
        Self {
            kind,
            status: kind.default_status(),
            message: message.into(),
            cause,
            // expected failures carry no backtrace
            stacktrace: if kind == ErrorKind::Generic {
                capture_stacktrace()
            } else {
                None
            },
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message, None)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message, None)
    }

    pub fn integration(message: impl Into<String>, cause: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Integration, message, Some(cause.to_string()))
    }

    pub fn no_backend_available(pool: &str) -> Self {
        Self::new(
            ErrorKind::NoBackendAvailable,
            format!("no healthy backend available for \"{}\"", pool),
            None,
        )
    }

    pub fn generic(message: impl Into<String>, cause: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Generic, message, Some(cause.to_string()))
    }

    /// Catch-all for a panic that escaped request handling. The stack trace is
    /// always captured here, regardless of `RUST_BACKTRACE`.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let cause = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self {
            kind: ErrorKind::Generic,
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "internal error while handling request".to_string(),
            cause: Some(cause),
            stacktrace: Some(Backtrace::force_capture().to_string()),
        }
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> Option<&str> {
        self.cause.as_deref()
    }

    pub fn stacktrace(&self) -> Option<&str> {
        self.stacktrace.as_deref()
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }

    pub fn to_envelope(&self, trace_id: &str) -> ErrorEnvelope {
        ErrorEnvelope {
            message: self.message.clone(),
            cause: self.cause.clone().unwrap_or_default(),
            stacktrace: self.stacktrace.clone().unwrap_or_default(),
            trace_id: trace_id.to_string(),
        }
    }
}

impl fmt::Display for RouterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "{}: {}", self.message, cause),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for RouterError {}

/// JSON body returned to the inbound caller on failure. Empty fields are
/// omitted from the wire form.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub cause: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stacktrace: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub trace_id: String,
}

fn capture_stacktrace() -> Option<String> {
    let bt = Backtrace::capture();
    match bt.status() {
        BacktraceStatus::Captured => Some(bt.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_without_cause() {
        assert_eq!(
            RouterError::bad_request("malformed path").to_string(),
            "malformed path"
        );
    }

    #[test]
    fn display_with_cause() {
        assert_eq!(
            RouterError::integration("error calling backend", "connection refused").to_string(),
            "error calling backend: connection refused"
        );
    }

    #[test]
    fn default_status_per_kind() {
        assert_eq!(RouterError::bad_request("x").status(), StatusCode::BAD_REQUEST);
        assert_eq!(RouterError::not_found("x").status(), StatusCode::NOT_FOUND);
        assert_eq!(
            RouterError::integration("x", "y").status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            RouterError::no_backend_available("app1").status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            RouterError::generic("x", "y").status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn with_status_keeps_kind() {
        let err = RouterError::bad_request("method not allowed")
            .with_status(StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(err.kind(), ErrorKind::BadRequest);
        assert_eq!(err.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[test]
    fn no_backend_message_names_pool() {
        let err = RouterError::no_backend_available("app1");
        assert_eq!(err.kind(), ErrorKind::NoBackendAvailable);
        assert!(err.message().contains("app1"));
    }

    #[test]
    fn from_panic_str_payload() {
        let err = RouterError::from_panic(Box::new("boom"));
        assert_eq!(err.kind(), ErrorKind::Generic);
        assert_eq!(err.cause(), Some("boom"));
        assert!(err.stacktrace().is_some());
    }

    #[test]
    fn from_panic_string_payload() {
        let err = RouterError::from_panic(Box::new("kaboom".to_string()));
        assert_eq!(err.cause(), Some("kaboom"));
    }

    #[test]
    fn envelope_omits_empty_fields() {
        let err = RouterError::bad_request("unknown prefix");
        let mut env = err.to_envelope("abc123");
        env.stacktrace.clear();
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["message"], "unknown prefix");
        assert_eq!(json["trace_id"], "abc123");
        assert!(json.get("cause").is_none());
        assert!(json.get("stacktrace").is_none());
    }

    #[test]
    fn envelope_carries_cause() {
        let err = RouterError::integration("error calling backend", "timed out");
        let env = err.to_envelope("");
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["cause"], "timed out");
        assert!(json.get("trace_id").is_none());
    }
    #[test]
    fn only_generic_errors_capture_a_backtrace() {
        for err in [
            RouterError::bad_request("bad"),
            RouterError::not_found("missing"),
            RouterError::integration("error calling http://a", "refused"),
            RouterError::no_backend_available("app1"),
        ] {
            assert!(err.stacktrace().is_none(), "{}", err.kind().as_str());
        }
    }
}
