//! IPC layer between a host process and its sidecar.
//!
//! The sidecar is a child process spawned with three piped streams. Requests
//! go down stdin, responses come back on stdout and structured log entries
//! come back on stderr. The two output channels are never mixed.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   stdin  (Request lines)    ┌─────────────────────┐
//! │   Host process   │ ──────────────────────────► │      Sidecar        │
//! │  (SidecarClient) │ ◄────────────────────────── │     (Service)       │
//! │                  │   stdout (Response lines)   │                     │
//! │                  │ ◄────────────────────────── │                     │
//! └──────────────────┘   stderr (LogEntry lines)   └─────────────────────┘
//! ```
//!
//! # Protocol
//!
//! Every message is one JSON object on one line:
//!
//! ```text
//! {"id":"req-1","method":"translate","params":{"text":"hello","toLang":"zh"}}
//! {"id":"req-1","result":{"translatedText":"[zh] hello","engine":"mock","timingMs":0}}
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use sidecar_ipc::ipc::SidecarClient;
//! use serde_json::json;
//!
//! let response = client
//!     .send_request("translate", Some(json!({"text": "hello", "toLang": "zh"})), None)
//!     .await?;
//! ```

mod client;
mod framing;
pub mod protocol;
mod registry;

pub use client::{ClientError, DiagnosticLine, SidecarClient, Termination};
pub use framing::{read_line, write_message, FrameError};
pub use protocol::{
    Envelope, ErrorCode, ErrorObject, IncomingRequest, LogEntry, LogLevel, Outcome, Request,
    Response,
};
pub use registry::{Abandoned, PendingResponse, RegistryError, RequestRegistry};
