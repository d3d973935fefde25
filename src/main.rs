use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use davit_core::config::{AgentConfig, ClusterConfig};

#[derive(Parser)]
#[command(name = "davitd", about = "davit compute-node launcher agent", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args)]
struct NodeArgs {
    /// Data root holding instance directories and images.
    #[arg(long, default_value = davit_core::config::DATA_ROOT_DEFAULT)]
    data_root: PathBuf,
    /// Manage host networking (vnics, tenant bridges) during start/delete.
    #[arg(long)]
    network: bool,
    /// Run every instance on the simulator back-end and skip the lockfile.
    #[arg(long)]
    simulation: bool,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Run the launcher agent until SIGINT/SIGTERM.
    Serve {
        #[command(flatten)]
        node: NodeArgs,
        /// Client TLS certificate for the control channel.
        #[arg(long)]
        cert: Option<PathBuf>,
        /// CA certificate for the control channel.
        #[arg(long)]
        cacert: Option<PathBuf>,
        /// Identity used by the block-storage driver.
        #[arg(long)]
        storage_id: Option<String>,
        /// Cluster configuration with admission-check toggles.
        #[arg(long)]
        cluster_config: Option<PathBuf>,
    },
    /// Terminate every detected instance, reset networking, and exit.
    HardReset {
        #[command(flatten)]
        node: NodeArgs,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    match cli.command {
        Command::Serve {
            node,
            cert,
            cacert,
            storage_id,
            cluster_config,
        } => {
            let mut config = AgentConfig {
                data_root: node.data_root,
                cert_path: cert,
                cacert_path: cacert,
                manage_network: node.network,
                simulation: node.simulation,
                storage_id,
                ..AgentConfig::default()
            };
            if let Some(path) = cluster_config {
                ClusterConfig::load(&path)?.apply(&mut config);
            }
            rt.block_on(davit_agent::agent::run(config))
        }
        Command::HardReset { node } => {
            let config = AgentConfig {
                data_root: node.data_root,
                manage_network: node.network,
                simulation: node.simulation,
                ..AgentConfig::default()
            };
            rt.block_on(davit_agent::agent::hard_reset(&config))
        }
    }
}
