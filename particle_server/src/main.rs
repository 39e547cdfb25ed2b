//! Standalone server binary.
//!
//! Usage:
//!   particle-server [--addr 127.0.0.1:12345] [--config server.json]
//!
//! The server keeps the shared scene graph and relays changes between the
//! connected particle clients.

use std::env;

use anyhow::Context;
use particle_server::SceneServer;
use particle_shared::config::ServerConfig;
use tracing::info;

fn parse_args(args: &[String]) -> anyhow::Result<ServerConfig> {
    let mut cfg = ServerConfig::default();
    let mut addr = None;
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                addr = Some(args[i + 1].clone());
                i += 2;
            }
            "--config" if i + 1 < args.len() => {
                let path = &args[i + 1];
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("read config {path}"))?;
                cfg = ServerConfig::from_json_str(&text)
                    .with_context(|| format!("parse config {path}"))?;
                i += 2;
            }
            other => anyhow::bail!("unknown argument {other}"),
        }
    }
    if let Some(addr) = addr {
        cfg.listen_addr = addr;
    }
    Ok(cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let cfg = parse_args(&args)?;

    let server = SceneServer::bind(cfg.clone()).await.context("bind server")?;
    let local = server.local_addr()?;
    info!(%local, "Server listening");

    tokio::select! {
        res = server.run() => res,
        _ = tokio::signal::ctrl_c() => {
            info!("Server shutting down");
            Ok(())
        }
    }
}
