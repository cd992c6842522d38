//! labgridd — the labgrid controller daemon.
//!
//! Serves the global resource lock service and the machine/site inventory
//! over HTTP, backed by a redb state store.
//!
//! # Usage
//!
//! ```text
//! labgridd serve --config /etc/labgrid/labgrid.toml --port 8480
//! labgridd match --offered 'MEM=64G/CPUS=16' --required 'MEM>=32G'
//! ```

mod config;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use labgrid_constraint::Constraints;
use tracing::info;

use crate::config::LabgridConfig;

#[derive(Parser)]
#[command(name = "labgridd", about = "labgrid controller daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the API server.
    Serve {
        /// Path to labgrid.toml.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on.
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for persistent state.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Bounded wait for the resource table mutex.
        #[arg(long)]
        lock_timeout_ms: Option<u64>,
    },
    /// Evaluate resource and flag constraints offline.
    Match {
        /// Offered resources, e.g. `MEM=64G/CPUS=16`.
        #[arg(long, default_value = "")]
        offered: String,

        /// Required resources, e.g. `MEM>=32G/CPUS>4`.
        #[arg(long, default_value = "")]
        required: String,

        /// Offered flags, e.g. `gpu,+lab,-nfs`.
        #[arg(long, default_value = "")]
        offered_flags: String,

        /// Required flags, e.g. `gpu,!nfs,~fast`.
        #[arg(long, default_value = "")]
        required_flags: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,labgridd=debug,labgrid=debug"));
    if cli.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    match cli.command {
        Command::Serve {
            config,
            port,
            data_dir,
            lock_timeout_ms,
        } => {
            let mut cfg = match config {
                Some(path) => LabgridConfig::from_file(&path)?,
                None => LabgridConfig::default(),
            };
            if let Some(port) = port {
                cfg.server.port = port;
            }
            if let Some(dir) = data_dir {
                cfg.state.data_dir = dir;
            }
            if let Some(ms) = lock_timeout_ms {
                cfg.locking.timeout_ms = ms;
            }
            run_server(cfg).await
        }
        Command::Match {
            offered,
            required,
            offered_flags,
            required_flags,
        } => {
            let verdict = evaluate(&offered, &required, &offered_flags, &required_flags)?;
            println!("{}", serde_json::json!({ "match": verdict }));
            if !verdict {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

/// True when the offered resources and flags satisfy the requirements.
fn evaluate(
    offered: &str,
    required: &str,
    offered_flags: &str,
    required_flags: &str,
) -> anyhow::Result<bool> {
    let constraints = Constraints::parse(Some(required), Some(required_flags))?;
    Ok(constraints.admits_str(offered, offered_flags)?)
}

async fn run_server(cfg: LabgridConfig) -> anyhow::Result<()> {
    info!("labgrid daemon starting");

    std::fs::create_dir_all(&cfg.state.data_dir)?;
    let db_path = cfg.db_path();
    let store = labgrid_state::StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let lock_wait: Duration = cfg.lock_wait();
    let state = labgrid_api::ApiState::new(store, lock_wait);
    info!(lock_wait_ms = cfg.locking.timeout_ms, "lock service initialized");

    let router = labgrid_api::build_router(state);
    let addr = cfg.listen_addr();
    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
            }
        })
        .await?;

    info!("labgrid daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluate_resources_and_flags() {
        assert!(evaluate("MEM=64G/CPUS=16", "MEM>=32G", "", "").unwrap());
        assert!(!evaluate("MEM=8G", "MEM>=32G", "", "").unwrap());
        assert!(evaluate("", "", "gpu,+lab", "gpu,lab").unwrap());
        assert!(!evaluate("", "", "gpu,+lab", "gpu").unwrap());
    }

    #[test]
    fn evaluate_rejects_malformed_input() {
        assert!(evaluate("MEM>8", "", "", "").is_err());
        assert!(evaluate("", "MEM=>8", "", "").is_err());
    }
}
