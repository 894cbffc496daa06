//! warpd — the WarpGrid agent daemon.
//!
//! Single binary that runs the server role, the client role, or both:
//! - State store (redb) and allocation broker (server)
//! - Local client with allocation directories (client)
//! - Allocation HTTP API and peer RPC on one listener
//!
//! # Usage
//!
//! ```text
//! warpd server --config /etc/warpgrid/agent.toml
//! warpd client --servers 10.0.0.1:4646 --node-id node1
//! warpd dev
//! ```

mod agent;
mod config;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing::info;

use crate::agent::Agent;
use crate::config::AgentConfig;

#[derive(Parser)]
#[command(name = "warpd", about = "WarpGrid agent daemon")]
struct Cli {
    /// Emit logs as JSON.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the server role.
    Server(CommonArgs),
    /// Run the client role against existing servers.
    Client {
        #[command(flatten)]
        common: CommonArgs,

        /// Server addresses (host:port), comma separated.
        #[arg(long, value_delimiter = ',')]
        servers: Vec<String>,

        /// Node ID of this client.
        #[arg(long)]
        node_id: Option<String>,
    },
    /// Run server and client in one process with an in-memory state store.
    Dev(CommonArgs),
}

#[derive(Args)]
struct CommonArgs {
    /// Path to a TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// HTTP port to listen on.
    #[arg(long)]
    port: Option<u16>,

    /// Data directory for persistent state.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

impl CommonArgs {
    fn load(&self) -> anyhow::Result<AgentConfig> {
        let mut config = AgentConfig::load(self.config.as_deref())?;
        if let Some(port) = self.port {
            config.http_port = port;
        }
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Server(common) => {
            let mut config = common.load()?;
            config.server.enabled = true;
            config.client.enabled = false;
            run_server(config).await
        }
        Command::Client {
            common,
            servers,
            node_id,
        } => {
            let mut config = common.load()?;
            config.server.enabled = false;
            config.client.enabled = true;
            if !servers.is_empty() {
                config.client.servers = servers;
            }
            if let Some(node_id) = node_id {
                config.client.node_id = node_id;
            }
            info!(servers = ?config.client.servers, "WarpGrid agent starting in client mode");
            Agent::build(config, None)?.run().await
        }
        Command::Dev(common) => {
            let mut config = common.load()?;
            if common.config.is_none() && common.data_dir.is_none() {
                config.data_dir = std::env::temp_dir().join("warpgrid-dev");
            }
            config.server.enabled = true;
            config.client.enabled = true;
            config.client.servers.clear();
            if config.client.node_id.is_empty() {
                config.client.node_id = "dev".to_string();
            }
            info!("WarpGrid agent starting in dev mode");
            let state = warpgrid_state::StateStore::open_in_memory()?;
            let agent = Agent::build(config, Some(state))?;
            agent.seed_dev_allocs()?;
            agent.run().await
        }
    }
}

async fn run_server(config: AgentConfig) -> anyhow::Result<()> {
    info!("WarpGrid agent starting in server mode");

    // Ensure data directory exists.
    std::fs::create_dir_all(&config.data_dir)?;
    let db_path = config.data_dir.join("warpgrid.redb");
    let state = warpgrid_state::StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    Agent::build(config, Some(state))?.run().await
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,warpd=debug,warpgrid=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
