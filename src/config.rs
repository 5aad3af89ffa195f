//! Command-line configuration for the engine and gateway binaries.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use crate::model::MAX_CLASS_TAG_LEN;

/// Issuance engine daemon configuration.
#[derive(Parser, Debug)]
#[command(
    name = "cert-eng",
    version,
    about = "Stock certificate issuance engine"
)]
pub struct EngineConfig {
    /// Share class inventory as TAG=AUTHORIZED, e.g. --class CS=100000. Repeatable.
    #[arg(
        long = "class",
        value_name = "TAG=AUTHORIZED",
        value_parser = parse_class,
        required = true
    )]
    pub classes: Vec<(String, u64)>,

    /// Path to the append-only grant journal.
    #[arg(long, value_name = "PATH")]
    pub journal: PathBuf,

    /// TCP endpoint to listen on.
    #[arg(long, default_value = "127.0.0.1:9999", value_name = "ADDR")]
    pub listen: SocketAddr,

    /// Close connections idle longer than this many seconds.
    #[arg(long, default_value_t = 120, value_name = "SECS")]
    pub idle_timeout_secs: u64,

    /// Bound on grant requests queued for the decision thread.
    #[arg(long, default_value_t = 1024, value_name = "N")]
    pub queue_depth: usize,
}

/// HTTP gateway configuration.
#[derive(Parser, Debug)]
#[command(
    name = "cert-gateway",
    version,
    about = "HTTP facade for the certificate issuance engine"
)]
pub struct GatewayConfig {
    /// HTTP endpoint to listen on.
    #[arg(long, default_value = "127.0.0.1:3000", value_name = "ADDR")]
    pub listen: SocketAddr,

    /// Issuance engine endpoint.
    #[arg(long, default_value = "127.0.0.1:9999", value_name = "ADDR")]
    pub engine: SocketAddr,

    /// Engine connections kept by this worker.
    #[arg(long, default_value_t = 20, value_name = "N")]
    pub pool_size: usize,

    /// Give up on a pool checkout after this many milliseconds.
    #[arg(long, default_value_t = 1000, value_name = "MS")]
    pub checkout_timeout_ms: u64,

    /// Issuing company name echoed in responses.
    #[arg(long, default_value = "Impossible Cuts Inc.")]
    pub company: String,
}

/// Parse a `TAG=AUTHORIZED` pair. The tag must survive both the wire
/// (1-byte length) and the journal (space-delimited fields).
fn parse_class(raw: &str) -> Result<(String, u64), String> {
    let (tag, authorized) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected TAG=AUTHORIZED, got '{raw}'"))?;
    if tag.is_empty() {
        return Err("class tag must not be empty".to_string());
    }
    if tag.len() > MAX_CLASS_TAG_LEN {
        return Err(format!(
            "class tag '{tag}' is over the {MAX_CLASS_TAG_LEN} byte bound"
        ));
    }
    if tag.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(format!(
            "class tag '{tag}' contains whitespace or control characters"
        ));
    }
    let authorized = authorized
        .parse::<u64>()
        .map_err(|_| format!("invalid authorized share count '{authorized}'"))?;
    Ok((tag.to_string(), authorized))
}
