pub mod config;
pub mod engine;
pub mod http;
pub mod journal;
pub mod model;
pub mod pool;
pub mod server;
pub mod wire;

pub use engine::Engine;
pub use model::{CertificateNumber, GrantRecord, GrantRequest, ShareAmount};
