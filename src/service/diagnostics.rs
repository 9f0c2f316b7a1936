//! Structured diagnostics written to the service's stderr.

use tokio::io::AsyncWrite;

use crate::ipc::protocol::{LogEntry, LogLevel};
use crate::ipc::{write_message, FrameError};

/// Writes one `LogEntry` per line and flushes after each.
pub struct DiagnosticLog<D> {
    writer: D,
}

impl<D: AsyncWrite + Unpin> DiagnosticLog<D> {
    pub fn new(writer: D) -> Self {
        Self { writer }
    }

    pub async fn log(
        &mut self,
        level: LogLevel,
        message: impl Into<String>,
        request_id: Option<&str>,
    ) -> Result<(), FrameError> {
        let entry = LogEntry::new(level, message).with_request_id(request_id);
        write_message(&mut self.writer, &entry).await
    }

    pub async fn info(
        &mut self,
        message: impl Into<String>,
        request_id: Option<&str>,
    ) -> Result<(), FrameError> {
        self.log(LogLevel::Info, message, request_id).await
    }

    pub async fn warn(
        &mut self,
        message: impl Into<String>,
        request_id: Option<&str>,
    ) -> Result<(), FrameError> {
        self.log(LogLevel::Warn, message, request_id).await
    }

    pub async fn error(
        &mut self,
        message: impl Into<String>,
        request_id: Option<&str>,
    ) -> Result<(), FrameError> {
        self.log(LogLevel::Error, message, request_id).await
    }

    pub fn into_inner(self) -> D {
        self.writer
    }
}
