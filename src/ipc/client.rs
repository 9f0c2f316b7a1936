//! Host-side client for a sidecar process.
//!
//! This module provides `SidecarClient`, an async client that spawns the
//! sidecar, writes requests to its stdin and routes responses from its stdout
//! back to the waiting callers by correlation id. Any number of requests may
//! be in flight at once; responses may arrive in any order.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::io::BufReader;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::ipc::framing::{read_line, write_message, FrameError};
use crate::ipc::protocol::{
    Envelope, ErrorCode, ErrorObject, JsonObject, LogEntry, LogLevel, Request, Response,
};
use crate::ipc::registry::{Abandoned, RegistryError, RequestRegistry};

/// Interval between liveness checks while waiting for the process to exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long to wait for the process to be reaped after a forced kill.
const KILL_WAIT: Duration = Duration::from_secs(1);

/// Client-side error types.
///
/// Application errors reported by the sidecar are not client errors:
/// `send_request` returns them as `Response` data. Only `call` converts them
/// into `ClientError::Remote`.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The sidecar executable could not be spawned.
    #[error("Failed to launch sidecar {}: {source}", .program.display())]
    Launch {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No live sidecar process; nothing was written.
    #[error("Sidecar process is not running")]
    NotRunning,

    /// `start()` was called while the process is still alive.
    #[error("Sidecar process is already running")]
    AlreadyRunning,

    /// No response arrived within the budget. The sidecar may still be
    /// working on the request.
    #[error("Request {id} timed out after {}ms", .timeout.as_millis())]
    Timeout { id: String, timeout: Duration },

    /// The sidecar's output closed while the request was pending.
    #[error("Request {id} abandoned: sidecar output closed before a response arrived")]
    Abandoned { id: String },

    /// Writing to the sidecar's stdin failed.
    #[error("Pipe to sidecar closed: {0}")]
    PipeClosed(#[source] FrameError),

    /// Local protocol violation (bad params shape, duplicate id, missing pipe).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The sidecar answered with an error response.
    #[error("Sidecar error {code}: {message}")]
    Remote { code: ErrorCode, message: String },
}

impl From<ErrorObject> for ClientError {
    fn from(err: ErrorObject) -> Self {
        ClientError::Remote {
            code: err.code,
            message: err.message,
        }
    }
}

impl From<RegistryError> for ClientError {
    fn from(err: RegistryError) -> Self {
        ClientError::Protocol(err.to_string())
    }
}

/// How a sidecar process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Exit status 0.
    Graceful,
    /// Any non-zero exit code, or `None` when killed by a signal.
    Abnormal(Option<i32>),
}

impl From<ExitStatus> for Termination {
    fn from(status: ExitStatus) -> Self {
        if status.success() {
            Termination::Graceful
        } else {
            Termination::Abnormal(status.code())
        }
    }
}

/// One line collected from the sidecar's stderr.
#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosticLine {
    /// The line as received.
    pub raw: String,
    /// The parsed entry, if the line was a well-formed log entry.
    pub entry: Option<LogEntry>,
}

/// Bounded ring of stderr lines.
#[derive(Debug)]
struct DiagnosticBuffer {
    lines: Mutex<VecDeque<DiagnosticLine>>,
    capacity: usize,
}

impl DiagnosticBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    fn push(&self, line: DiagnosticLine) {
        if self.capacity == 0 {
            return;
        }
        let mut lines = self.lines.lock().unwrap_or_else(|p| p.into_inner());
        while lines.len() >= self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    fn snapshot(&self) -> Vec<DiagnosticLine> {
        let lines = self.lines.lock().unwrap_or_else(|p| p.into_inner());
        lines.iter().cloned().collect()
    }
}

/// Everything owned by one spawned process.
struct Session {
    child: Mutex<Child>,
    stdin: tokio::sync::Mutex<ChildStdin>,
    registry: Arc<RequestRegistry>,
    diagnostics: Arc<DiagnosticBuffer>,
    /// Set by the stdout reader before it abandons pending requests.
    output_closed: Arc<AtomicBool>,
    /// Set when a write was cut off mid-line; stdin may hold a torn frame.
    input_torn: AtomicBool,
    next_id: AtomicU64,
    readers: Vec<JoinHandle<()>>,
}

impl Session {
    fn next_request_id(&self) -> String {
        format!("req-{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Check the child without blocking. `None` while it is still running.
    fn poll_exit(&self) -> Option<ExitStatus> {
        let mut child = self.child.lock().unwrap_or_else(|p| p.into_inner());
        match child.try_wait() {
            Ok(status) => status,
            Err(e) => {
                warn!("Error polling sidecar process: {}", e);
                None
            }
        }
    }

    /// Poll until the child exits or `limit` elapses. Returns whether it exited.
    async fn wait_for_exit(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            if self.poll_exit().is_some() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
    }

    fn accepts_requests(&self) -> bool {
        !self.output_closed.load(Ordering::SeqCst)
            && !self.input_torn.load(Ordering::SeqCst)
            && self.poll_exit().is_none()
    }

    fn kill(&self) {
        let mut child = self.child.lock().unwrap_or_else(|p| p.into_inner());
        if let Err(e) = child.start_kill() {
            warn!("Failed to kill sidecar process: {}", e);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
        self.registry.abandon_all();
    }
}

/// Client for a sidecar speaking JSON Lines over stdio.
///
/// The client owns the child process, the in-flight request registry and two
/// background tasks: one draining stdout into the registry, one collecting
/// stderr diagnostics. The child is killed if the client is dropped while it
/// is still running.
///
/// # Lifecycle
///
/// - `start()` - spawn the sidecar and its reader tasks
/// - `send_request()` - send a request and wait for its response (with timeout)
/// - `stop()` - graceful `shutdown`, then forced kill after a grace period
///
/// # Example
///
/// ```ignore
/// use sidecar_ipc::config::ClientConfig;
/// use sidecar_ipc::ipc::SidecarClient;
/// use serde_json::json;
///
/// let mut client = SidecarClient::new(ClientConfig::new("sidecar-mock"));
/// client.start()?;
///
/// let response = client
///     .send_request("translate", Some(json!({"text": "hello", "toLang": "zh"})), None)
///     .await?;
/// assert_eq!(response.result().unwrap()["translatedText"], "[zh] hello");
///
/// client.stop().await;
/// ```
pub struct SidecarClient {
    config: ClientConfig,
    session: Option<Session>,
}

impl SidecarClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            session: None,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Spawn the sidecar with piped stdin, stdout and stderr, and start the
    /// two reader tasks. Must be called from within a Tokio runtime.
    ///
    /// A client whose previous process has exited may be started again; the
    /// new session gets a fresh registry and id counter.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Launch` if the executable cannot be spawned, or
    /// `ClientError::AlreadyRunning` if the current process is still alive.
    pub fn start(&mut self) -> Result<(), ClientError> {
        if self.is_running() {
            return Err(ClientError::AlreadyRunning);
        }
        self.session = None;

        info!("Starting sidecar: {}", self.config.program.display());

        let mut child = Command::new(&self.config.program)
            .args(&self.config.args)
            .envs(self.config.env.iter().cloned())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ClientError::Launch {
                program: self.config.program.clone(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;

        debug!("Sidecar spawned (pid: {:?})", child.id());

        let registry = Arc::new(RequestRegistry::new());
        let diagnostics = Arc::new(DiagnosticBuffer::new(self.config.diagnostics_capacity));
        let output_closed = Arc::new(AtomicBool::new(false));

        let readers = vec![
            spawn_response_reader(stdout, Arc::clone(&registry), Arc::clone(&output_closed)),
            spawn_diagnostic_reader(stderr, Arc::clone(&diagnostics)),
        ];

        self.session = Some(Session {
            child: Mutex::new(child),
            stdin: tokio::sync::Mutex::new(stdin),
            registry,
            diagnostics,
            output_closed,
            input_torn: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            readers,
        });

        Ok(())
    }

    /// Send a request and wait for its response.
    ///
    /// This method:
    /// 1. Allocates a fresh `req-<n>` id and registers it
    /// 2. Writes the request as one line to the sidecar's stdin
    /// 3. Waits for the response
    ///
    /// Steps 2 and 3 share one deadline of `timeout` (or the configured
    /// default), so a peer that stops reading stdin cannot block the caller
    /// past it. A write cut short by the deadline leaves the session unusable:
    /// later calls fail with `ClientError::NotRunning`.
    ///
    /// A response carrying an `error` is returned as `Ok`: it is the
    /// sidecar's answer, not a failure of the call.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The process is not running (`ClientError::NotRunning`, nothing written)
    /// - `params` is not a JSON object or null (`ClientError::Protocol`)
    /// - The write fails (`ClientError::PipeClosed`)
    /// - No response arrives in time (`ClientError::Timeout`)
    /// - The sidecar's output closes first (`ClientError::Abandoned`)
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Response, ClientError> {
        let session = self.live_session()?;
        let params = params_object(params)?;

        let id = session.next_request_id();
        let request = Request::new(id.clone(), method, params);
        let pending = session.registry.register(&id)?;

        // The stdout reader may have drained the registry just before we
        // registered; nothing would ever settle this entry.
        if session.output_closed.load(Ordering::SeqCst) {
            session.registry.abandon(&id);
            return Err(ClientError::NotRunning);
        }

        let budget = timeout.unwrap_or(self.config.request_timeout);
        let deadline = Instant::now() + budget;

        let timed_out = |id: String| ClientError::Timeout {
            id,
            timeout: budget,
        };

        // Waiting for the lock writes nothing; only a cut-off write tears a line.
        let Ok(mut stdin) = tokio::time::timeout_at(deadline, session.stdin.lock()).await else {
            session.registry.abandon(&id);
            return Err(timed_out(id));
        };
        let write = write_message(&mut *stdin, &request);
        let written = tokio::time::timeout_at(deadline, write).await;
        drop(stdin);

        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                session.registry.abandon(&id);
                return Err(ClientError::PipeClosed(e));
            }
            Err(_) => {
                session.registry.abandon(&id);
                session.input_torn.store(true, Ordering::SeqCst);
                warn!(
                    request_id = %id,
                    method,
                    "Sidecar stopped reading stdin; write timed out after {:?}",
                    budget
                );
                return Err(timed_out(id));
            }
        }
        debug!(request_id = %id, method, "Sent sidecar request");

        match tokio::time::timeout_at(deadline, pending.wait()).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(Abandoned)) => Err(ClientError::Abandoned { id }),
            Err(_) => {
                session.registry.abandon(&id);
                warn!(request_id = %id, method, "Sidecar request timed out after {:?}", budget);
                Err(timed_out(id))
            }
        }
    }

    /// Send a request and extract its result object.
    ///
    /// Like `send_request` with the default timeout, but an error response
    /// becomes `ClientError::Remote`.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let health = client.call("health", None).await?;
    /// println!("sidecar version {}", health["version"]);
    /// ```
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonObject, ClientError> {
        let response = self.send_request(method, params, None).await?;
        response.into_result().map_err(ClientError::from)
    }

    /// Whether the sidecar process is alive. Checked against the OS on every
    /// call.
    pub fn is_running(&self) -> bool {
        self.session
            .as_ref()
            .map(|session| session.poll_exit().is_none())
            .unwrap_or(false)
    }

    /// Exit code of the process, once it has exited. `None` while running,
    /// before `start()`, or when the process was killed by a signal.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_status().and_then(|status| status.code())
    }

    /// How the process ended, once it has exited.
    pub fn termination(&self) -> Option<Termination> {
        self.exit_status().map(Termination::from)
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.session.as_ref().and_then(Session::poll_exit)
    }

    /// Number of requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.session
            .as_ref()
            .map(|session| session.registry.len())
            .unwrap_or(0)
    }

    /// Snapshot of the stderr lines collected so far (oldest first).
    pub fn diagnostics(&self) -> Vec<DiagnosticLine> {
        self.session
            .as_ref()
            .map(|session| session.diagnostics.snapshot())
            .unwrap_or_default()
    }

    /// Parsed log entries among the collected stderr lines.
    pub fn log_entries(&self) -> Vec<LogEntry> {
        self.diagnostics()
            .into_iter()
            .filter_map(|line| line.entry)
            .collect()
    }

    /// Stop the sidecar.
    ///
    /// Sends `shutdown` with the configured short timeout (failures ignored),
    /// waits up to `exit_grace` for the process to exit, then kills it.
    /// Safe to call repeatedly, before `start()`, or after the process has
    /// already exited.
    pub async fn stop(&self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };

        if session.poll_exit().is_none() {
            if let Err(e) = self
                .send_request("shutdown", None, Some(self.config.shutdown_timeout))
                .await
            {
                debug!("Sidecar shutdown request failed: {}", e);
            }

            if session.wait_for_exit(self.config.exit_grace).await {
                debug!("Sidecar process exited cleanly");
            } else {
                warn!("Sidecar didn't exit gracefully, killing");
                session.kill();
                if !session.wait_for_exit(KILL_WAIT).await {
                    error!("Sidecar process still running after kill");
                }
            }
        }

        let abandoned = session.registry.abandon_all();
        if abandoned > 0 {
            debug!("Abandoned {} pending request(s) on stop", abandoned);
        }
    }

    fn live_session(&self) -> Result<&Session, ClientError> {
        match self.session.as_ref() {
            Some(session) if session.accepts_requests() => Ok(session),
            _ => Err(ClientError::NotRunning),
        }
    }
}

fn missing_pipe(stream: &str) -> ClientError {
    ClientError::Protocol(format!("Failed to get {} handle for sidecar", stream))
}

fn params_object(params: Option<Value>) -> Result<Option<JsonObject>, ClientError> {
    match params {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(object)) => Ok(Some(object)),
        Some(_) => Err(ClientError::Protocol(
            "Request params must be a JSON object".to_string(),
        )),
    }
}

/// Drain stdout, resolving registry entries by id.
fn spawn_response_reader(
    stdout: ChildStdout,
    registry: Arc<RequestRegistry>,
    output_closed: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stdout);

        loop {
            match read_line(&mut reader).await {
                Ok(Some(line)) => route_response_line(&line, &registry),
                Ok(None) => {
                    debug!("Sidecar stdout closed");
                    break;
                }
                Err(e) if e.is_recoverable() => {
                    warn!("Skipping unreadable line on sidecar stdout: {}", e);
                }
                Err(e) => {
                    error!("Failed to read sidecar stdout: {}", e);
                    break;
                }
            }
        }

        output_closed.store(true, Ordering::SeqCst);
        let abandoned = registry.abandon_all();
        if abandoned > 0 {
            warn!(
                "Sidecar output closed with {} request(s) still pending",
                abandoned
            );
        }
    })
}

fn route_response_line(line: &str, registry: &RequestRegistry) {
    if line.trim().is_empty() {
        return;
    }

    match Envelope::parse(line) {
        Ok(Envelope::Response(response)) => match response.id.clone() {
            Some(id) => {
                if !registry.resolve(&id, response) {
                    // Late answer to a timed-out or abandoned request.
                    warn!(request_id = %id, "Discarding orphan sidecar response");
                }
            }
            None => {
                let detail = response
                    .error()
                    .map(|e| format!("{}: {}", e.code, e.message))
                    .unwrap_or_else(|| "result without id".to_string());
                warn!("Sidecar response without request id ({})", detail);
            }
        },
        Ok(other) => warn!("Unexpected message on sidecar stdout: {:?}", other),
        Err(e) => warn!("Malformed line on sidecar stdout: {}", e),
    }
}

/// Collect stderr lines and mirror parsed entries into `tracing`.
fn spawn_diagnostic_reader(
    stderr: ChildStderr,
    diagnostics: Arc<DiagnosticBuffer>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);

        loop {
            match read_line(&mut reader).await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let entry = match Envelope::parse(&line) {
                        Ok(Envelope::Log(entry)) => {
                            forward_log_entry(&entry);
                            Some(entry)
                        }
                        _ => {
                            debug!(target: "sidecar", "unstructured stderr: {}", line);
                            None
                        }
                    };
                    diagnostics.push(DiagnosticLine { raw: line, entry });
                }
                Ok(None) => break,
                Err(e) if e.is_recoverable() => {
                    debug!("Skipping unreadable line on sidecar stderr: {}", e);
                }
                Err(e) => {
                    debug!("Failed to read sidecar stderr: {}", e);
                    break;
                }
            }
        }
    })
}

fn forward_log_entry(entry: &LogEntry) {
    let subsystem = entry.subsystem.as_str();
    let request_id = entry.request_id.as_deref().unwrap_or("-");
    let message = entry.message.as_str();
    match entry.level {
        LogLevel::Debug => debug!(target: "sidecar", subsystem, request_id, "{}", message),
        LogLevel::Info => info!(target: "sidecar", subsystem, request_id, "{}", message),
        LogLevel::Warn => warn!(target: "sidecar", subsystem, request_id, "{}", message),
        LogLevel::Error => error!(target: "sidecar", subsystem, request_id, "{}", message),
    }
}
