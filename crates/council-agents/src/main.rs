use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use council_agents::config::CouncilConfig;
use council_agents::{build_app_state, http};
use deliberation::AgentId;

/// Multi-agent deliberation service.
#[derive(Parser, Debug)]
#[command(name = "council-agents", about = "Multi-agent deliberation HTTP service")]
struct Args {
    /// Address to bind.
    #[arg(long, default_value = "127.0.0.1:8700")]
    addr: SocketAddr,

    /// Optional TOML config file (env vars still take precedence).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Skip the startup provider reachability probe.
    #[arg(long)]
    skip_health_check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = CouncilConfig::load(args.config.as_deref())?;
    info!(
        call_timeout_secs = config.engine.call_timeout_secs,
        session_timeout_secs = config.engine.session_timeout_secs,
        "configuration loaded"
    );

    let state = build_app_state(config);

    if !args.skip_health_check {
        for agent in AgentId::ALL {
            let reachable = match state.engine.runner().adapter(agent) {
                Some(adapter) => adapter.reachable().await,
                None => false,
            };
            if reachable {
                info!(agent = %agent, "provider endpoint reachable");
            } else {
                warn!(
                    agent = %agent,
                    "provider endpoint unreachable at startup, calls will rely on retries"
                );
            }
        }
    }

    http::serve(args.addr, state).await
}
