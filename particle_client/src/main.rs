//! Standalone client binary.
//!
//! Usage:
//!   particle-client [options] <server> <particle_directory>
//!
//! Options:
//!   -t sender|receiver              client type (default receiver)
//!   -v none|lines|dots|dot-lines    visualization (receiver)
//!   -d debug|info|warning|error|none
//!   -f <fps>                        frames per second (default 25)
//!   -n <count>                      number of senders (default 1)
//!   -u <user>  -p <password>
//!   -s                              request secure transport
//!   -c                              capture rendered frames
//!   --config <file.json>            load settings before the flags above
//!   -h                              print this help

use std::env;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use particle_client::ParticleClient;
use particle_shared::config::{ClientConfig, ClientFlags};
use particle_shared::particle_data::{BphysicsLoader, DatasetLoader};
use tracing::info;

const USAGE: &str = "\
Usage: particle-client [-t sender|receiver] [-v none|lines|dots|dot-lines]
                       [-d debug|info|warning|error|none] [-f fps] [-n senders]
                       [-u user] [-p password] [-s] [-c] [--config file.json]
                       <server> <particle_directory>";

enum Args {
    Run(ClientConfig),
    Help,
}

fn parse_args(args: &[String]) -> anyhow::Result<Args> {
    let mut cfg = ClientConfig::default();

    // A config file sets the baseline; flags override it.
    if let Some(i) = args.iter().position(|a| a == "--config") {
        let path = args.get(i + 1).context("--config needs a file")?;
        let text =
            std::fs::read_to_string(path).with_context(|| format!("read config {path}"))?;
        cfg = ClientConfig::from_json_str(&text).with_context(|| format!("parse config {path}"))?;
    }

    let mut positional = Vec::new();
    let mut i = 1;
    while i < args.len() {
        let value = || args.get(i + 1).with_context(|| format!("{} needs a value", args[i]));
        match args[i].as_str() {
            "-h" | "--help" => return Ok(Args::Help),
            "-t" => {
                cfg.role = value()?.parse()?;
                i += 2;
            }
            "-v" => {
                cfg.visual = value()?.parse()?;
                i += 2;
            }
            "-d" => {
                cfg.log_level = Some(value()?.parse()?);
                i += 2;
            }
            "-f" => {
                cfg.fps = value()?.parse().context("-f expects a number")?;
                i += 2;
            }
            "-n" => {
                cfg.sender_count = value()?.parse().context("-n expects a number")?;
                i += 2;
            }
            "-u" => {
                cfg.username = value()?.clone();
                i += 2;
            }
            "-p" => {
                cfg.password = value()?.clone();
                i += 2;
            }
            "-s" => {
                cfg.flags |= ClientFlags::SECURE;
                i += 1;
            }
            "-c" => {
                cfg.flags |= ClientFlags::SCREENCAST;
                i += 1;
            }
            "--config" => i += 2,
            other if other.starts_with('-') => anyhow::bail!("unknown option {other}\n{USAGE}"),
            other => {
                positional.push(other.to_string());
                i += 1;
            }
        }
    }

    let mut positional = positional.into_iter();
    if let Some(server) = positional.next() {
        cfg.server_addr = server;
    }
    if let Some(dir) = positional.next() {
        cfg.data_dir = dir;
    }
    if cfg.data_dir.is_empty() {
        anyhow::bail!("missing particle directory\n{USAGE}");
    }
    Ok(Args::Run(cfg))
}

fn init_tracing(cfg: &ClientConfig) {
    let filter = match cfg.log_level {
        Some(level) => tracing_subscriber::EnvFilter::new(level.filter_directive()),
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "info".into()),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();
    let cfg = match parse_args(&args)? {
        Args::Help => {
            println!("{USAGE}");
            return Ok(());
        }
        Args::Run(cfg) => cfg,
    };
    init_tracing(&cfg);

    let data = BphysicsLoader
        .load(Path::new(&cfg.data_dir))
        .context("load particle data")?;
    if data.frame_count() < 2 {
        anyhow::bail!("no particle frames found in {}", cfg.data_dir);
    }
    info!(
        role = %cfg.role,
        particles = data.particle_count(),
        frames = data.frame_count(),
        fps = cfg.fps,
        senders = cfg.sender_count,
        "Starting client"
    );

    let client = ParticleClient::connect(&cfg, Arc::new(data))
        .await
        .context("connect")?;

    let shutdown = client.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, disconnecting");
            shutdown.shutdown();
        }
    });

    client.run().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use particle_shared::config::{LogLevel, Role, VisualType};

    fn args(line: &str) -> Vec<String> {
        std::iter::once("particle-client")
            .chain(line.split_whitespace())
            .map(String::from)
            .collect()
    }

    #[test]
    fn full_command_line() {
        let Args::Run(cfg) = parse_args(&args(
            "-t sender -v dot-lines -d warning -f 30 -n 4 -u alice -p pw -s -c example.org ./cache",
        ))
        .unwrap() else {
            panic!("expected run");
        };
        assert_eq!(cfg.role, Role::Sender);
        assert_eq!(cfg.visual, VisualType::DotLine);
        assert_eq!(cfg.log_level, Some(LogLevel::Warning));
        assert_eq!(cfg.fps, 30);
        assert_eq!(cfg.sender_count, 4);
        assert_eq!(cfg.username, "alice");
        assert!(cfg.flags.contains(ClientFlags::SECURE | ClientFlags::SCREENCAST));
        assert_eq!(cfg.server_addr, "example.org");
        assert_eq!(cfg.data_dir, "./cache");
    }

    #[test]
    fn missing_directory_and_bad_values_fail() {
        assert!(parse_args(&args("localhost")).is_err());
        assert!(parse_args(&args("-t nobody localhost ./d")).is_err());
        assert!(parse_args(&args("-f fast localhost ./d")).is_err());
        assert!(parse_args(&args("-x localhost ./d")).is_err());
        assert!(matches!(parse_args(&args("-h")), Ok(Args::Help)));
    }
}
