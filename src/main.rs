use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use cert_eng::config::EngineConfig;
use cert_eng::server;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .with_writer(std::io::stderr)
        .init();

    let config = EngineConfig::parse();
    if let Err(err) = server::run(config).await {
        error!("{err}");
        std::process::exit(err.exit_code());
    }
}
