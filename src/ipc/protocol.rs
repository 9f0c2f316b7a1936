//! Wire types for the sidecar protocol.
//!
//! The peer is untrusted, so inbound JSON is decoded into `serde_json::Value`
//! first and then checked field by field before it becomes a typed message.
//! Outbound messages serialize straight from the typed structs.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;

/// Request/response parameter and result objects.
pub type JsonObject = Map<String, Value>;

/// Default `subsystem` for log entries.
pub const DEFAULT_SUBSYSTEM: &str = "sidecar";

/// Error codes carried in `Response.error.code`.
///
/// The four named codes are fixed by the protocol. Anything else a peer sends
/// is preserved in `Other` so it can be surfaced to the caller unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The line could not be parsed as JSON.
    InvalidJson,
    /// Missing or mistyped `method`, or non-object `params`.
    InvalidRequest,
    /// Method-specific argument validation failed.
    InvalidParams,
    /// Unrecognized `method`.
    MethodNotFound,
    /// Any code outside the protocol's fixed set.
    Other(String),
}

impl ErrorCode {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::InvalidJson => "invalid_json",
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::InvalidParams => "invalid_params",
            ErrorCode::MethodNotFound => "method_not_found",
            ErrorCode::Other(code) => code.as_str(),
        }
    }
}

impl From<&str> for ErrorCode {
    fn from(code: &str) -> Self {
        match code {
            "invalid_json" => ErrorCode::InvalidJson,
            "invalid_request" => ErrorCode::InvalidRequest,
            "invalid_params" => ErrorCode::InvalidParams,
            "method_not_found" => ErrorCode::MethodNotFound,
            other => ErrorCode::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = String::deserialize(deserializer)?;
        Ok(ErrorCode::from(code.as_str()))
    }
}

/// Reasons an inbound JSON value was not accepted as a protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Message is not a JSON object")]
    NotAnObject,

    #[error("Field `{field}` must be {expected}")]
    InvalidField {
        field: &'static str,
        expected: &'static str,
    },

    #[error("Response carries both `result` and `error`")]
    BothResultAndError,

    #[error("Response carries neither `result` nor `error`")]
    MissingOutcome,

    #[error("Message is not a request, response or log entry")]
    Unrecognized,
}

/// A request as built and sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<JsonObject>,
}

impl Request {
    pub fn new(
        id: impl Into<String>,
        method: impl Into<String>,
        params: Option<JsonObject>,
    ) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    fn from_object(object: &JsonObject) -> Result<Self, EnvelopeError> {
        let id = match object.get("id") {
            Some(Value::String(id)) => id.clone(),
            _ => {
                return Err(EnvelopeError::InvalidField {
                    field: "id",
                    expected: "a string",
                })
            }
        };
        let method = match object.get("method") {
            Some(Value::String(method)) if !method.is_empty() => method.clone(),
            _ => {
                return Err(EnvelopeError::InvalidField {
                    field: "method",
                    expected: "a non-empty string",
                })
            }
        };
        let params = match object.get("params") {
            None | Some(Value::Null) => None,
            Some(Value::Object(params)) => Some(params.clone()),
            Some(_) => {
                return Err(EnvelopeError::InvalidField {
                    field: "params",
                    expected: "an object",
                })
            }
        };

        Ok(Self { id, method, params })
    }
}

/// `Response.error` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorObject {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// The mutually exclusive body of a response.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Result(JsonObject),
    Error(ErrorObject),
}

/// A response line. `id` is `None` only for failures that happened before
/// the request id could be read; it serializes as `null`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub id: Option<String>,
    #[serde(flatten)]
    pub outcome: Outcome,
}

impl Response {
    pub fn success(id: Option<String>, result: JsonObject) -> Self {
        Self {
            id,
            outcome: Outcome::Result(result),
        }
    }

    pub fn failure(id: Option<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            id,
            outcome: Outcome::Error(ErrorObject::new(code, message)),
        }
    }

    pub fn result(&self) -> Option<&JsonObject> {
        match &self.outcome {
            Outcome::Result(result) => Some(result),
            Outcome::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&ErrorObject> {
        match &self.outcome {
            Outcome::Result(_) => None,
            Outcome::Error(error) => Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, Outcome::Error(_))
    }

    /// Split into the result object or the peer's error.
    pub fn into_result(self) -> Result<JsonObject, ErrorObject> {
        match self.outcome {
            Outcome::Result(result) => Ok(result),
            Outcome::Error(error) => Err(error),
        }
    }

    /// Validate a decoded value as a response.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The value is not an object
    /// - `id` is present and neither a string nor `null`
    /// - Both or neither of `result` and `error` are present
    /// - `result` is not an object, or `error` lacks string `code`/`message`
    pub fn from_value(value: &Value) -> Result<Self, EnvelopeError> {
        let object = value.as_object().ok_or(EnvelopeError::NotAnObject)?;
        Self::from_object(object)
    }

    fn from_object(object: &JsonObject) -> Result<Self, EnvelopeError> {
        let id = match object.get("id") {
            None | Some(Value::Null) => None,
            Some(Value::String(id)) => Some(id.clone()),
            Some(_) => {
                return Err(EnvelopeError::InvalidField {
                    field: "id",
                    expected: "a string or null",
                })
            }
        };

        let outcome = match (object.get("result"), object.get("error")) {
            (Some(_), Some(_)) => return Err(EnvelopeError::BothResultAndError),
            (None, None) => return Err(EnvelopeError::MissingOutcome),
            (Some(Value::Object(result)), None) => Outcome::Result(result.clone()),
            (Some(_), None) => {
                return Err(EnvelopeError::InvalidField {
                    field: "result",
                    expected: "an object",
                })
            }
            (None, Some(error)) => Outcome::Error(Self::error_from_value(error)?),
        };

        Ok(Self { id, outcome })
    }

    fn error_from_value(value: &Value) -> Result<ErrorObject, EnvelopeError> {
        let code = value.get("code").and_then(Value::as_str);
        let message = value.get("message").and_then(Value::as_str);
        match (code, message) {
            (Some(code), Some(message)) => Ok(ErrorObject::new(ErrorCode::from(code), message)),
            (None, _) => Err(EnvelopeError::InvalidField {
                field: "error.code",
                expected: "a string",
            }),
            (_, None) => Err(EnvelopeError::InvalidField {
                field: "error.message",
                expected: "a string",
            }),
        }
    }
}

impl<'de> Deserialize<'de> for Response {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Response::from_value(&value).map_err(serde::de::Error::custom)
    }
}

/// Severity of a diagnostic log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    #[serde(alias = "warning")]
    Warn,
    Error,
}

fn default_subsystem() -> String {
    DEFAULT_SUBSYSTEM.to_string()
}

/// A structured diagnostic line written to stderr. Never part of the
/// response stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub level: LogLevel,
    #[serde(alias = "ts")]
    pub timestamp: DateTime<Utc>,
    #[serde(alias = "msg")]
    pub message: String,
    #[serde(default = "default_subsystem")]
    pub subsystem: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl LogEntry {
    /// New entry stamped with the current time at millisecond precision.
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            timestamp: Utc::now().trunc_subsecs(3),
            message: message.into(),
            subsystem: default_subsystem(),
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: Option<&str>) -> Self {
        self.request_id = request_id.map(str::to_string);
        self
    }
}

/// A request as seen by the service, after boundary validation.
///
/// Unlike `Request`, the id is optional: a missing or non-string id is
/// answered with `id: null`.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingRequest {
    pub id: Option<String>,
    pub method: String,
    pub params: JsonObject,
}

/// Why an input line could not be turned into an `IncomingRequest`, and the
/// response that reports it.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub response: Response,
    pub detail: String,
}

impl IncomingRequest {
    /// Validate one input line.
    ///
    /// Order of checks: JSON syntax (`invalid_json`), id (non-strings become
    /// `None`), method (`invalid_request`), params (`invalid_request`).
    pub fn parse(line: &str) -> Result<Self, Rejection> {
        let value: Value = serde_json::from_str(line).map_err(|e| Rejection {
            response: Response::failure(None, ErrorCode::InvalidJson, "failed to parse json"),
            detail: format!("invalid json: {}", e),
        })?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, Rejection> {
        let mut object = match value {
            Value::Object(object) => object,
            _ => JsonObject::new(),
        };

        let id = match object.remove("id") {
            Some(Value::String(id)) => Some(id),
            _ => None,
        };

        let method = match object.remove("method") {
            Some(Value::String(method)) if !method.is_empty() => method,
            _ => {
                return Err(Self::reject(
                    id,
                    ErrorCode::InvalidRequest,
                    "method must be a non-empty string",
                ))
            }
        };

        let params = match object.remove("params") {
            None | Some(Value::Null) => JsonObject::new(),
            Some(Value::Object(params)) => params,
            Some(_) => {
                return Err(Self::reject(
                    id,
                    ErrorCode::InvalidRequest,
                    "params must be an object",
                ))
            }
        };

        Ok(Self { id, method, params })
    }

    fn reject(id: Option<String>, code: ErrorCode, message: &str) -> Rejection {
        Rejection {
            response: Response::failure(id, code, message),
            detail: message.to_string(),
        }
    }
}

/// Every message kind that can appear on one of the three channels.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Request(Request),
    Response(Response),
    Log(LogEntry),
}

impl Envelope {
    /// Parse one framed line.
    pub fn parse(line: &str) -> Result<Self, EnvelopeError> {
        let value: Value =
            serde_json::from_str(line).map_err(|e| EnvelopeError::InvalidJson(e.to_string()))?;
        Self::classify(&value)
    }

    /// Decide which message kind a value is and validate it as that kind.
    ///
    /// `method` marks a request, `result`/`error` a response and `level` a
    /// log entry. Anything else is rejected.
    pub fn classify(value: &Value) -> Result<Self, EnvelopeError> {
        let object = value.as_object().ok_or(EnvelopeError::NotAnObject)?;

        if object.contains_key("method") {
            Request::from_object(object).map(Envelope::Request)
        } else if object.contains_key("result") || object.contains_key("error") {
            Response::from_object(object).map(Envelope::Response)
        } else if object.contains_key("level") {
            serde_json::from_value::<LogEntry>(value.clone())
                .map(Envelope::Log)
                .map_err(|_| EnvelopeError::InvalidField {
                    field: "level",
                    expected: "a log entry with level, timestamp and message",
                })
        } else {
            Err(EnvelopeError::Unrecognized)
        }
    }
}
