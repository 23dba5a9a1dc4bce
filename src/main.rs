//! Object gateway node.
//!
//! Loads the gateway configuration, applies command-line overrides, installs
//! logging and runs the node on a runtime sized by the configuration.

use std::path::PathBuf;

use clap::Parser;

use object_gateway::config::validation::validate_config;
use object_gateway::config::{load_config, ConfigError, GatewayConfig};
use object_gateway::lifecycle::{build_runtime, run};
use object_gateway::observability::logging;

#[derive(Parser)]
#[command(name = "object-gateway")]
#[command(about = "Object storage gateway node", long_about = None)]
struct Args {
    /// Gateway configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listening port; repeat to listen on several. Replaces configured ports.
    #[arg(short, long = "port")]
    ports: Vec<u16>,

    /// Node identifier reported in responses
    #[arg(long)]
    node_id: Option<String>,

    /// Cluster configuration file watched for new generations
    #[arg(long)]
    cluster_config: Option<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = resolve_config(args)?;

    logging::init(&config.observability)?;
    tracing::info!("object-gateway v{} starting", env!("CARGO_PKG_VERSION"));

    let runtime = build_runtime(&config.runtime)?;
    runtime.block_on(run(config))?;
    Ok(())
}

fn resolve_config(args: Args) -> Result<GatewayConfig, ConfigError> {
    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => GatewayConfig::default(),
    };
    if !args.ports.is_empty() {
        config.listener.ports = args.ports;
    }
    if let Some(id) = args.node_id {
        config.node.id = id;
    }
    if let Some(path) = args.cluster_config {
        config.node.cluster_config_path = Some(path);
    }
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}
