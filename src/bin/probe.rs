//! sidecar-probe - spawn a sidecar and run the protocol smoke sequence.
//!
//! Usage:
//!
//! ```text
//! sidecar-probe [SIDECAR_PATH [ARGS...]]
//! ```
//!
//! Without arguments the sidecar is taken from `SIDECAR_PATH` /
//! `SIDECAR_ARGS`. Exits non-zero if any step fails.

use anyhow::{bail, ensure, Context, Result};
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sidecar_ipc::config::ClientConfig;
use sidecar_ipc::ipc::{ErrorCode, SidecarClient, Termination};

const DEFAULT_LOG_FILTER: &str = "sidecar_ipc=info,sidecar=info,sidecar_probe=info";

fn config_from_args() -> Result<ClientConfig> {
    let mut args = std::env::args_os().skip(1);
    match args.next() {
        Some(program) => Ok(ClientConfig::new(program).with_args(args)),
        None => ClientConfig::from_env().context("No sidecar given on the command line"),
    }
}

async fn probe(client: &SidecarClient) -> Result<()> {
    let health = client.call("health", None).await.context("health failed")?;
    tracing::info!(
        "health: version={} build={} capabilities={}",
        health["version"],
        health["build"],
        health["capabilities"]
    );

    let translated = client
        .call("translate", Some(json!({"text": "hello", "toLang": "zh"})))
        .await
        .context("translate failed")?;
    ensure!(
        translated["translatedText"] == "[zh] hello",
        "unexpected translation: {}",
        translated["translatedText"]
    );
    tracing::info!(
        "translate: {} ({}ms)",
        translated["translatedText"],
        translated["timingMs"]
    );

    let unknown = client.send_request("__unknown__", None, None).await?;
    match unknown.error() {
        Some(err) if err.code == ErrorCode::MethodNotFound => {
            tracing::info!("unknown method rejected: {}", err.message)
        }
        _ => bail!("expected method_not_found, got {:?}", unknown),
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    tracing::info!("Starting sidecar probe v{}", env!("CARGO_PKG_VERSION"));

    let mut client = SidecarClient::new(config_from_args()?);
    client.start()?;

    let outcome = probe(&client).await;
    client.stop().await;

    match client.termination() {
        Some(Termination::Graceful) => tracing::info!("sidecar exited cleanly"),
        Some(Termination::Abnormal(code)) => {
            tracing::warn!("sidecar exited abnormally: {:?}", code)
        }
        None => tracing::warn!("sidecar still running after stop"),
    }

    outcome
}
