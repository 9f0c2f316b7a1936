//! Wire-level tests for the `sidecar-mock` binary.
//!
//! These tests bypass `SidecarClient` and talk to the sidecar's stdio
//! directly, so malformed lines can be sent and both output channels checked
//! independently.

use std::process::Stdio;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::time::timeout;

use sidecar_ipc::ipc::{read_line, Envelope};

const SIDECAR: &str = env!("CARGO_BIN_EXE_sidecar-mock");

/// Test timeout to prevent hanging tests.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

struct RawSidecar {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    stderr: BufReader<ChildStderr>,
}

impl RawSidecar {
    fn spawn() -> Self {
        let mut child = Command::new(SIDECAR)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .expect("Failed to spawn sidecar");

        let stdin = child.stdin.take().unwrap();
        let stdout = BufReader::new(child.stdout.take().unwrap());
        let stderr = BufReader::new(child.stderr.take().unwrap());

        Self {
            child,
            stdin,
            stdout,
            stderr,
        }
    }

    async fn send_line(&mut self, line: &str) {
        self.stdin
            .write_all(format!("{}\n", line).as_bytes())
            .await
            .expect("Write failed");
        self.stdin.flush().await.expect("Flush failed");
    }

    async fn recv(&mut self) -> Value {
        let line = timeout(TEST_TIMEOUT, read_line(&mut self.stdout))
            .await
            .expect("Timed out waiting for stdout line")
            .expect("Read failed")
            .expect("stdout closed");
        serde_json::from_str(&line)
            .unwrap_or_else(|e| panic!("stdout line is not valid JSON: {:?}: {}", line, e))
    }

    async fn wait(mut self) -> Option<i32> {
        timeout(TEST_TIMEOUT, self.child.wait())
            .await
            .expect("Timed out waiting for exit")
            .expect("Wait failed")
            .code()
    }
}

#[tokio::test]
async fn test_request_response_sequence() {
    let mut sidecar = RawSidecar::spawn();

    sidecar.send_line(r#"{"id":"h","method":"health","params":{}}"#).await;
    let resp = sidecar.recv().await;
    assert_eq!(resp["id"], json!("h"));
    assert!(resp["result"]["capabilities"].is_array());

    sidecar
        .send_line(r#"{"id":"t","method":"translate","params":{"text":"hello","toLang":"zh"}}"#)
        .await;
    let resp = sidecar.recv().await;
    assert_eq!(resp["id"], json!("t"));
    assert_eq!(resp["result"]["translatedText"], json!("[zh] hello"));

    sidecar.send_line(r#"{"id":"u","method":"__unknown__"}"#).await;
    let resp = sidecar.recv().await;
    assert_eq!(resp["id"], json!("u"));
    assert_eq!(resp["error"]["code"], json!("method_not_found"));
    assert!(resp.get("result").is_none());

    sidecar.send_line("{").await;
    let resp = sidecar.recv().await;
    assert_eq!(resp["id"], Value::Null);
    assert_eq!(resp["error"]["code"], json!("invalid_json"));

    // Still serving after the malformed line.
    sidecar.send_line(r#"{"id":"s","method":"shutdown"}"#).await;
    let resp = sidecar.recv().await;
    assert_eq!(resp["id"], json!("s"));
    assert_eq!(resp["result"]["ok"], json!(true));

    assert_eq!(sidecar.wait().await, Some(0));
}

#[tokio::test]
async fn test_closing_stdin_exits_cleanly() {
    let mut child = Command::new(SIDECAR)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .expect("Failed to spawn sidecar");

    drop(child.stdin.take());

    let status = timeout(TEST_TIMEOUT, child.wait())
        .await
        .expect("Timed out waiting for exit")
        .expect("Wait failed");
    assert_eq!(status.code(), Some(0));
}

#[tokio::test]
async fn test_crash_exit_code_and_no_response() {
    let mut sidecar = RawSidecar::spawn();

    sidecar.send_line(r#"{"id":"c","method":"crash"}"#).await;

    let next = timeout(TEST_TIMEOUT, read_line(&mut sidecar.stdout))
        .await
        .expect("Timed out waiting for stdout EOF")
        .expect("Read failed");
    assert_eq!(next, None, "crash must not produce a response");

    assert_eq!(sidecar.wait().await, Some(2));
}

#[tokio::test]
async fn test_stderr_carries_only_log_entries() {
    let mut sidecar = RawSidecar::spawn();

    sidecar.send_line(r#"{"id":"h","method":"health"}"#).await;
    sidecar.recv().await;
    sidecar.send_line("not json at all").await;
    sidecar.recv().await;
    sidecar.send_line(r#"{"id":"s","method":"shutdown"}"#).await;
    sidecar.recv().await;

    let mut entries = Vec::new();
    while let Some(line) = timeout(TEST_TIMEOUT, read_line(&mut sidecar.stderr))
        .await
        .expect("Timed out reading stderr")
        .expect("Read failed")
    {
        match Envelope::parse(&line) {
            Ok(Envelope::Log(entry)) => entries.push(entry),
            other => panic!("stderr carried a non-log line {:?}: {:?}", line, other),
        }
    }

    let messages: Vec<_> = entries.iter().map(|e| e.message.as_str()).collect();
    assert_eq!(messages.first(), Some(&"sidecar service started"));
    assert!(messages.contains(&"request: health"));
    assert!(messages.iter().any(|m| m.starts_with("invalid json")));
    assert_eq!(messages.last(), Some(&"shutdown requested"));

    assert_eq!(sidecar.wait().await, Some(0));
}
