//! Reference sidecar service.
//!
//! Reads one request per line, validates it, dispatches it and writes exactly
//! one response per valid request. Diagnostics go to a separate writer so the
//! response stream only ever carries `Response` lines.
//!
//! Requests are handled one at a time in arrival order. A delayed `translate`
//! therefore holds back the lines behind it; only process termination
//! interrupts the delay.

mod diagnostics;
pub mod handlers;

use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncWrite};

use crate::config::ServiceInfo;
use crate::ipc::protocol::{ErrorCode, IncomingRequest, JsonObject, Response};
use crate::ipc::{read_line, write_message, FrameError};

pub use diagnostics::DiagnosticLog;
use handlers::{Method, TranslateRequest};

/// Exit status after a `shutdown` request or end of input.
pub const EXIT_GRACEFUL: i32 = 0;

/// Exit status for the `crash` test hook.
pub const EXIT_CRASH: i32 = 2;

/// Service lifecycle. `Exiting` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Running,
    Exiting(i32),
}

/// The peer side of the protocol, generic over its output channels so it can
/// run against stdio or in-memory buffers.
pub struct Service<W, D> {
    output: W,
    diagnostics: DiagnosticLog<D>,
    info: ServiceInfo,
    state: ServiceState,
}

impl<W, D> Service<W, D>
where
    W: AsyncWrite + Unpin,
    D: AsyncWrite + Unpin,
{
    pub fn new(output: W, diagnostics: D, info: ServiceInfo) -> Self {
        Self {
            output,
            diagnostics: DiagnosticLog::new(diagnostics),
            info,
            state: ServiceState::Running,
        }
    }

    /// Serve lines from `input` until a terminal state is reached.
    ///
    /// Returns the process exit status: `0` after `shutdown` or end of
    /// input, `2` after `crash`.
    ///
    /// # Errors
    ///
    /// Returns an error only if one of the service's own streams fails.
    /// Malformed input never ends the loop.
    pub async fn run<R>(&mut self, input: &mut R) -> Result<i32, FrameError>
    where
        R: AsyncBufRead + Unpin,
    {
        self.diagnostics.info("sidecar service started", None).await?;

        loop {
            if let ServiceState::Exiting(code) = self.state {
                return Ok(code);
            }

            match read_line(input).await {
                Ok(Some(line)) => {
                    self.handle_line(&line).await?;
                }
                Ok(None) => {
                    self.diagnostics.info("stdin closed, exiting", None).await?;
                    self.state = ServiceState::Exiting(EXIT_GRACEFUL);
                }
                Err(e) if e.is_recoverable() => {
                    self.diagnostics.warn(format!("invalid json: {}", e), None).await?;
                    self.respond(&Response::failure(
                        None,
                        ErrorCode::InvalidJson,
                        "failed to parse json",
                    ))
                    .await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Process one input line and return the resulting state.
    pub async fn handle_line(&mut self, line: &str) -> Result<ServiceState, FrameError> {
        if self.state != ServiceState::Running {
            return Ok(self.state);
        }

        let line = line.trim();
        if line.is_empty() {
            return Ok(self.state);
        }

        match IncomingRequest::parse(line) {
            Ok(request) => self.dispatch(request).await?,
            Err(rejection) => {
                if rejection.response.error().map(|e| &e.code) == Some(&ErrorCode::InvalidJson) {
                    self.diagnostics.warn(rejection.detail, None).await?;
                }
                self.respond(&rejection.response).await?;
            }
        }

        Ok(self.state)
    }

    /// Consume the service and hand back its writers.
    pub fn into_parts(self) -> (W, D) {
        (self.output, self.diagnostics.into_inner())
    }

    async fn dispatch(&mut self, request: IncomingRequest) -> Result<(), FrameError> {
        let IncomingRequest { id, method, params } = request;
        let request_id = id.as_deref();

        self.diagnostics
            .info(format!("request: {}", method), request_id)
            .await?;

        match Method::from_name(&method) {
            Some(Method::Health) => {
                let result = handlers::health(&self.info);
                self.respond_result(id, &result).await
            }
            Some(Method::Translate) => match TranslateRequest::from_params(&params) {
                Ok(translate) => {
                    let result = handlers::translate(translate).await;
                    self.respond_result(id, &result).await
                }
                Err(message) => {
                    self.respond(&Response::failure(id, ErrorCode::InvalidParams, message))
                        .await
                }
            },
            Some(Method::Shutdown) => {
                let mut result = JsonObject::new();
                result.insert("ok".to_string(), serde_json::Value::Bool(true));
                self.respond(&Response::success(id.clone(), result)).await?;
                self.diagnostics
                    .info("shutdown requested", id.as_deref())
                    .await?;
                self.state = ServiceState::Exiting(EXIT_GRACEFUL);
                Ok(())
            }
            Some(Method::Crash) => {
                self.diagnostics.error("crash requested", request_id).await?;
                self.state = ServiceState::Exiting(EXIT_CRASH);
                Ok(())
            }
            None => {
                self.respond(&Response::failure(
                    id.clone(),
                    ErrorCode::MethodNotFound,
                    format!("unknown method: {}", method),
                ))
                .await
            }
        }
    }

    async fn respond_result<T: Serialize>(
        &mut self,
        id: Option<String>,
        result: &T,
    ) -> Result<(), FrameError> {
        let result = match serde_json::to_value(result)? {
            serde_json::Value::Object(object) => object,
            _ => JsonObject::new(),
        };
        self.respond(&Response::success(id, result)).await
    }

    async fn respond(&mut self, response: &Response) -> Result<(), FrameError> {
        write_message(&mut self.output, response).await
    }
}
