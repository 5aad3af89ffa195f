use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cert_eng::config::GatewayConfig;
use cert_eng::http::{router, Gateway};
use cert_eng::pool::{Pool, PoolConfig};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .with_writer(std::io::stderr)
        .init();

    let config = GatewayConfig::parse();
    let pool = Pool::new(PoolConfig {
        engine: config.engine,
        max_connections: config.pool_size,
        checkout_timeout: Some(Duration::from_millis(config.checkout_timeout_ms)),
    });
    let gateway = Arc::new(Gateway {
        pool: pool.clone(),
        company: config.company,
    });

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .expect("failed to bind http listener");
    info!(addr = %config.listen, engine = %config.engine, "gateway listening");

    axum::serve(listener, router(gateway))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("http server failed");

    pool.close();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
