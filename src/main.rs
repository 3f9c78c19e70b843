use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::{EnvFilter, fmt};

use remote_operator::models::OpenAICompatible;
use remote_operator::sandbox::HttpSandbox;
use remote_operator::server::{self, AppState};
use remote_operator::settings::Settings;

#[derive(Debug, Parser)]
#[command(name = "remote_operator")]
#[command(about = "Streaming AI operator for a remote virtual desktop", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Start {
        #[arg(long, default_value = "127.0.0.1:7410")]
        listen: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Start { listen } => {
            let addr: SocketAddr = listen.parse()?;
            let settings = Settings::from_env();
            let metrics = PrometheusBuilder::new().install_recorder()?;
            let state = AppState {
                model: Arc::new(OpenAICompatible::new(
                    settings.model.base_url.clone(),
                    settings.model.api_key.clone(),
                )),
                sandbox: Arc::new(HttpSandbox::new(
                    settings.sandbox.base_url.clone(),
                    settings.sandbox.api_key.clone(),
                )),
                settings: Arc::new(settings),
            };
            server::serve(addr, state, Some(metrics)).await?;
        }
    }
    Ok(())
}
