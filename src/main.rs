//! sidecar-mock - reference sidecar speaking JSON Lines over stdio.
//!
//! stdin carries requests, stdout carries responses only and stderr carries
//! structured log entries only. No tracing subscriber is installed here:
//! anything written to stderr must be a protocol log entry.

use std::io::Write;

use anyhow::{Context, Result};
use tokio::io::BufReader;

use sidecar_ipc::config::ServiceInfo;
use sidecar_ipc::ipc::{LogEntry, LogLevel};
use sidecar_ipc::service::Service;

/// Exit status when the service's own streams fail.
const EXIT_IO_FAILURE: i32 = 1;

async fn serve() -> Result<i32> {
    let mut input = BufReader::new(tokio::io::stdin());
    let mut service = Service::new(
        tokio::io::stdout(),
        tokio::io::stderr(),
        ServiceInfo::default(),
    );

    service
        .run(&mut input)
        .await
        .context("Sidecar stdio channel failed")
}

fn main() {
    let code = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build Tokio runtime")
        .and_then(|runtime| runtime.block_on(serve()))
        .unwrap_or_else(|e| {
            report_fatal(&e);
            EXIT_IO_FAILURE
        });

    // Exit without tearing down the runtime: the blocking stdin reader would
    // otherwise keep the process alive until the host closes the pipe.
    std::process::exit(code);
}

/// Best-effort structured report on stderr for failures outside the service loop.
fn report_fatal(err: &anyhow::Error) {
    let entry = LogEntry::new(LogLevel::Error, format!("fatal: {:#}", err));
    if let Ok(line) = serde_json::to_string(&entry) {
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(stderr, "{}", line);
        let _ = stderr.flush();
    }
}
