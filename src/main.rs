use clap::Parser;
use std::path::PathBuf;

use relay_gateway::config::AppConfig;

#[derive(Debug, Parser)]
#[command(name = "relay-gateway", version, about = "Multi-dialect LLM relay gateway")]
struct Args {
    /// Path to the YAML config file
    #[arg(short, long, env = "RELAY_CONFIG", default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = AppConfig::load(&args.config)?;

    relay_gateway::init_tracing(&config.log_level, config.log_format);
    tracing::info!("Starting relay gateway on {}:{}", config.server.host, config.server.port);

    relay_gateway::run(config).await
}
