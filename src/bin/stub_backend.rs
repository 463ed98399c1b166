//! Stand-in analysis backend for local development
//!
//! Usage:
//!   sap-stub-backend [--port <PORT>] [--latency-ms <MS>] [--fail-status <CODE>] [--reply <TEXT>]

use anyhow::{Context, Result};
use sap_client::stub_backend::{spawn, StubBehavior, StubState};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

const DEFAULT_PORT: u16 = 8000;

fn parse_args() -> Result<(u16, StubBehavior)> {
    let args: Vec<String> = std::env::args().collect();
    let mut port = DEFAULT_PORT;
    let mut behavior = StubBehavior {
        fail_body: "internal error".to_string(),
        readme: Some("# SAP stub backend\n\nAnswers every analysis with a word count.".to_string()),
        ..Default::default()
    };

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].clone();
        i += 1;
        let value = args
            .get(i)
            .cloned()
            .with_context(|| format!("Missing value for {flag}"))?;

        match flag.as_str() {
            "--port" | "-p" => {
                port = value.parse().with_context(|| format!("Invalid port: {value}"))?;
            }
            "--latency-ms" => {
                let ms: u64 = value
                    .parse()
                    .with_context(|| format!("Invalid latency: {value}"))?;
                behavior.latency = Duration::from_millis(ms);
            }
            "--fail-status" => {
                let status: u16 = value
                    .parse()
                    .with_context(|| format!("Invalid status: {value}"))?;
                behavior.fail_status = Some(status);
            }
            "--reply" => behavior.reply = Some(value),
            other => anyhow::bail!("Unknown option: {other}"),
        }
        i += 1;
    }

    Ok((port, behavior))
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let (port, behavior) = parse_args()?;
    info!(
        port,
        latency_ms = behavior.latency.as_millis() as u64,
        fail_status = ?behavior.fail_status,
        "Starting SAP stub backend v{}",
        env!("CARGO_PKG_VERSION")
    );

    let state = Arc::new(StubState::new(behavior));
    let (addr, server) = spawn(state, SocketAddr::from(([0, 0, 0, 0], port))).await?;
    info!("Listening on {}", addr);

    server.await.context("Stub backend task panicked")??;
    Ok(())
}
